//! Configuration hot-reload watcher.
//!
//! ## Responsibility
//! Watch a TOML config file for changes, apply validated new configs to the
//! shared [`ConfigHandle`], and broadcast them to subscribers. Invalid
//! reloads are logged and rejected — the current config stays in effect.
//!
//! ## Guarantees
//! - Only validated configs are applied and broadcast
//! - Invalid file edits are logged but do not disrupt the running gateway
//! - File watching is debounced to avoid rapid re-reads on multi-write editors
//!
//! ## NOT Responsible For
//! - Initial config loading (that belongs to `loader`)
//! - How components react to new values (they re-read the handle per call)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, Mutex};

use super::loader::load_from_file;
use super::validation::ConfigError;
use super::{ConfigHandle, GatewayConfig};

/// Watches a config file for changes and applies validated updates to a
/// shared [`ConfigHandle`].
///
/// Subscribers can additionally receive each applied [`GatewayConfig`] via a
/// [`broadcast::Receiver`], e.g. to log or audit reconfigurations.
pub struct ConfigWatcher {
    /// Broadcast sender for applied config updates.
    tx: broadcast::Sender<GatewayConfig>,
    /// Retained watcher handle — dropping this stops file watching.
    _watcher: Arc<Mutex<RecommendedWatcher>>,
}

impl ConfigWatcher {
    /// Create a new [`ConfigWatcher`] for the given config file path.
    ///
    /// Each validated reload is written into `handle` (visible to all
    /// components on their next config read) and broadcast to subscribers.
    /// The initial config is **not** loaded or broadcast here — use
    /// [`loader::load_from_file`](super::loader::load_from_file) for that.
    ///
    /// # Errors
    ///
    /// Returns `Err(ConfigError::Io)` if the file watcher cannot be created
    /// or the parent directory cannot be watched.
    pub fn new(path: PathBuf, handle: ConfigHandle) -> Result<Self, ConfigError> {
        let (tx, _rx) = broadcast::channel(8);
        let tx_clone = tx.clone();
        let watch_path = path.clone();

        // Bridge notify's own thread into async context via a std channel.
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| ConfigError::Io {
            file: path.display().to_string(),
            source: std::io::Error::other(e.to_string()),
        })?;

        // Watch the parent directory to handle editors that do atomic saves
        // (write temp file → rename over original).
        let watch_dir = watch_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Io {
                file: watch_dir.display().to_string(),
                source: std::io::Error::other(e.to_string()),
            })?;

        let watcher = Arc::new(Mutex::new(watcher));

        // Background task: debounce events, reload, validate, apply.
        let config_path = watch_path.clone();
        tokio::spawn(async move {
            let debounce = Duration::from_millis(500);
            let mut last_reload = std::time::Instant::now()
                .checked_sub(debounce)
                .unwrap_or_else(std::time::Instant::now);

            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;

                let mut should_reload = false;
                while let Ok(event) = notify_rx.try_recv() {
                    match event.kind {
                        EventKind::Modify(_) | EventKind::Create(_) => {
                            let is_our_file = event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == config_path.file_name());
                            if is_our_file {
                                should_reload = true;
                            }
                        }
                        _ => {}
                    }
                }

                if should_reload && last_reload.elapsed() >= debounce {
                    last_reload = std::time::Instant::now();
                    match load_from_file(&config_path) {
                        Ok(new_config) => {
                            handle.replace(new_config.clone()).await;
                            tracing::info!(
                                path = %config_path.display(),
                                mode = ?new_config.usage_mode,
                                concurrent_requests =
                                    new_config.performance.concurrent_requests,
                                "config reloaded and applied"
                            );
                            // If no receivers, that's fine — the handle
                            // already holds the new config.
                            let _ = tx_clone.send(new_config);
                        }
                        Err(e) => {
                            tracing::warn!(
                                path = %config_path.display(),
                                error = %e,
                                "config reload rejected — keeping current config"
                            );
                        }
                    }
                }
            }
        });

        Ok(Self {
            tx,
            _watcher: watcher,
        })
    }

    /// Subscribe to applied config updates.
    ///
    /// Returns a new receiver. Multiple subscribers are supported.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayConfig> {
        self.tx.subscribe()
    }
}
