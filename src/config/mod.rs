//! Gateway configuration.
//!
//! ## Responsibility
//! Parse, validate, and hot-reload the TOML gateway configuration, and expose
//! it through [`ConfigHandle`] — the shared accessor every component re-reads
//! on each relevant call. Because nothing caches config values, a runtime
//! reconfiguration (via [`ConfigHandle::replace`] or the file watcher) takes
//! effect on the very next rate-limit check or scheduling pass, no restart.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `GatewayConfig`
//! - Validated: semantic constraints are checked before a config is accepted
//! - Hot-reloadable: file changes are detected and validated before applying
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Acting on config values (components interpret their own sections)
//! - Persisting config changes back to disk

pub mod loader;
pub mod validation;
pub mod watcher;

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

// ── Default value functions ──────────────────────────────────────────────

/// Default concurrency cap: 3 simultaneous requests.
fn default_concurrent_requests() -> i64 {
    3
}

/// Default per-minute rate limit.
fn default_requests_per_minute() -> i64 {
    60
}

/// Default per-hour rate limit.
fn default_requests_per_hour() -> i64 {
    1000
}

/// Default enabled state: true.
fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a gateway instance.
///
/// Deserialized from a TOML file and validated before use.
/// Every field has either a required value or a documented default.
///
/// # Example
///
/// ```toml
/// usage_mode = "service"
///
/// [performance]
/// concurrent_requests = 8
///
/// [rate_limit]
/// enabled = true
/// requests_per_minute = 60
/// requests_per_hour = 1000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GatewayConfig {
    /// Deployment mode; decides the default balancing strategy.
    #[serde(default)]
    pub usage_mode: UsageMode,
    /// Admission-control settings.
    #[serde(default)]
    pub performance: PerformanceConfig,
    /// Per-client rate-limit settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Deployment mode of the gateway.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageMode {
    /// Single-tenant deployment — one user, deterministic first-available
    /// provider selection.
    #[default]
    Personal,
    /// Multi-tenant service deployment — round-robin provider selection.
    Service,
}

/// Admission-control settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PerformanceConfig {
    /// Maximum simultaneously active requests. `-1` means unlimited.
    #[serde(default = "default_concurrent_requests")]
    pub concurrent_requests: i64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            concurrent_requests: default_concurrent_requests(),
        }
    }
}

impl PerformanceConfig {
    /// Whether the concurrency cap is the unlimited sentinel (`-1`).
    pub fn is_unlimited(&self) -> bool {
        self.concurrent_requests < 0
    }
}

/// Per-client rate-limit settings.
///
/// A limit value ≤ 0 disables that dimension (treated as unlimited).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Master switch. When false, every check is allowed.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests allowed per client per minute. ≤ 0 means unlimited.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: i64,
    /// Requests allowed per client per hour. ≤ 0 means unlimited.
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_requests_per_minute(),
            requests_per_hour: default_requests_per_hour(),
        }
    }
}

// ── Shared accessor ──────────────────────────────────────────────────────

/// Shared, hot-reloadable accessor for the current [`GatewayConfig`].
///
/// Cloning is cheap (an `Arc` bump); all clones observe the same config.
/// Components call the section getters on every relevant operation instead
/// of caching values, so a [`replace`](ConfigHandle::replace) is visible on
/// the next call.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<GatewayConfig>>,
}

impl ConfigHandle {
    /// Wrap a config in a shared handle.
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Current usage mode.
    pub async fn usage_mode(&self) -> UsageMode {
        self.inner.read().await.usage_mode
    }

    /// Current admission-control settings.
    pub async fn performance(&self) -> PerformanceConfig {
        self.inner.read().await.performance
    }

    /// Current rate-limit settings.
    pub async fn rate_limit(&self) -> RateLimitConfig {
        self.inner.read().await.rate_limit
    }

    /// Full copy of the current config.
    pub async fn current(&self) -> GatewayConfig {
        self.inner.read().await.clone()
    }

    /// Replace the entire config. Takes effect on the next read.
    pub async fn replace(&self, config: GatewayConfig) {
        let mut guard = self.inner.write().await;
        *guard = config;
        tracing::info!("gateway config replaced");
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

/// Export the JSON Schema for `GatewayConfig`.
///
/// This enables IDE autocomplete when editing TOML config files.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(GatewayConfig);
    serde_json::to_string_pretty(&schema)
}
