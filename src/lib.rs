//! # switchboard
//!
//! Control plane for a multi-provider request gateway.
//!
//! ## Architecture
//!
//! Four components composed in a fixed per-request pipeline:
//! ```text
//! RateLimiter.check → ConcurrencyManager.enqueue → handler
//!                                                    ├── LoadBalancer.select
//!                                                    └── MetricsCollector.record_*
//! ```
//!
//! [`RateLimiter`] is the first gate (per-client fixed-window admission),
//! [`ConcurrencyManager`] holds requests under a hot-reloadable concurrency
//! cap with priority ordering, [`LoadBalancer`] picks a healthy backend, and
//! [`MetricsCollector`] is the passive instrumentation sink fed by everyone
//! else. [`Gateway`] wires the pipeline together for callers that want the
//! whole thing in one call.
//!
//! All components are explicit `Clone` handles over shared state — no global
//! singletons. Construct them once at process start and pass them around.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod balancer;
pub mod concurrency;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod rate_limit;

// Re-exports for convenience
pub use balancer::{LoadBalancer, ProviderPick, StrategyKind};
pub use concurrency::{CancelToken, ConcurrencyManager, RequestMetadata};
pub use config::{ConfigHandle, GatewayConfig, UsageMode};
pub use gateway::Gateway;
pub use metrics::MetricsCollector;
pub use rate_limit::{RateDecision, RateLimiter};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`GatewayError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), GatewayError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| GatewayError::Other(format!("tracing init failed: {e}")))
}

/// Top-level gateway errors.
///
/// The control plane never invents, swallows, or retries handler errors; it
/// only adds bookkeeping around them. [`GatewayError::Handler`] carries the
/// handler's own failure verbatim; the remaining variants are produced by the
/// control plane itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Admission was rejected by the rate limiter.
    ///
    /// Only the [`Gateway`] facade converts a rate-limit decision into this
    /// error; [`RateLimiter::check`] itself returns a structured
    /// [`RateDecision`] value and never fails.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// The request was cancelled while still queued, or its cancellation
    /// token fired while active and the handler chose to abort.
    #[error("request cancelled")]
    Cancelled,

    /// The request was discarded by [`ConcurrencyManager::clear_queue`].
    #[error("queue cleared")]
    QueueCleared,

    /// No healthy provider was available at execution time.
    ///
    /// [`LoadBalancer::select`] itself returns `None` rather than failing;
    /// this variant exists for the facade pipeline, where "no backend" must
    /// surface to the caller awaiting the request.
    #[error("no healthy provider available")]
    NoProvider,

    /// The caller-supplied handler failed. Propagated verbatim, never
    /// masked or retried.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The completion channel was dropped before the request settled.
    /// Indicates an internal bug or abrupt shutdown.
    #[error("completion channel closed unexpectedly")]
    ChannelClosed,

    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_display_includes_reason() {
        let err = GatewayError::RateLimited("too many requests per minute".into());
        assert!(err.to_string().contains("too many requests per minute"));
    }

    #[test]
    fn test_handler_error_display_carries_original_message() {
        let err = GatewayError::Handler("upstream returned 503".into());
        assert!(err.to_string().contains("upstream returned 503"));
    }

    #[test]
    fn test_cancelled_and_queue_cleared_are_distinct() {
        assert_ne!(GatewayError::Cancelled, GatewayError::QueueCleared);
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // First call may succeed or fail depending on test execution order
        // (another test may have already installed a subscriber).
        let _ = init_tracing();
        // Second call must not panic — it should return Err.
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
