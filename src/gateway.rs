//! Facade wiring the control-plane components into one request pipeline.
//!
//! ## Responsibility
//! Compose the rate limiter, concurrency manager, load balancer, and
//! metrics collector behind a single [`execute`](Gateway::execute) call:
//!
//! ```text
//! check(client) ──▶ enqueue ──▶ [admitted] ──▶ select provider
//!                                              run caller's work
//!                                              record outcome + latency
//! ```
//!
//! ## Guarantees
//! - A rate-limited request is rejected before it ever touches the queue.
//! - Provider bookkeeping is symmetric: every admitted request that got a
//!   provider releases its connection via `record_success` or
//!   `record_failure`, whatever the outcome.
//! - The caller's error is returned verbatim; the facade only adds
//!   counting and timing around it.
//!
//! ## Usage
//!
//! ```no_run
//! use switchboard::{Gateway, GatewayConfig, RequestMetadata};
//!
//! # async fn demo() -> Result<(), switchboard::GatewayError> {
//! let gateway: Gateway<String> = Gateway::new(GatewayConfig::default());
//! gateway.balancer().add_provider("openai", "OpenAI", 1.0).await?;
//!
//! let reply = gateway
//!     .execute("client-1", "req-1", RequestMetadata::default(), |provider, _cancel| async move {
//!         Ok(format!("served by {}", provider.name))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::balancer::{BalancerStats, LoadBalancer, ProviderPick};
use crate::concurrency::{CancelToken, ConcurrencyManager, ManagerStats, RequestMetadata};
use crate::config::{ConfigHandle, GatewayConfig};
use crate::metrics::{
    ErrorRecord, MetricsCollector, MetricsSnapshot, RequestOutcome, ResourceSample,
};
use crate::rate_limit::{RateLimiter, RateLimiterStats};
use crate::GatewayError;

/// Aggregate pull-based view over every component's stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    /// Rate limiter bucket counts.
    pub rate_limiter: RateLimiterStats,
    /// Provider registry view.
    pub balancer: BalancerStats,
    /// Queue and active-set counters.
    pub concurrency: ManagerStats,
    /// Full metrics view.
    pub metrics: MetricsSnapshot,
}

/// The gateway control plane. Generic over the handler result type `T`.
///
/// Cloning is cheap; all clones share the same underlying components.
pub struct Gateway<T> {
    config: ConfigHandle,
    rate_limiter: RateLimiter,
    balancer: LoadBalancer,
    concurrency: ConcurrencyManager<T>,
    metrics: MetricsCollector,
}

impl<T> Clone for Gateway<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            rate_limiter: self.rate_limiter.clone(),
            balancer: self.balancer.clone(),
            concurrency: self.concurrency.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T: Send + 'static> Gateway<T> {
    /// Build a gateway from a configuration snapshot.
    ///
    /// The balancing strategy is fixed from `config.usage_mode` at
    /// construction time; the concurrency cap and rate limits stay live
    /// through the shared [`ConfigHandle`] and hot-reload per call.
    pub fn new(config: GatewayConfig) -> Self {
        let balancer = LoadBalancer::from_mode(config.usage_mode);
        let handle = ConfigHandle::new(config);
        info!(strategy = balancer.strategy_name(), "gateway initialized");
        Self {
            rate_limiter: RateLimiter::new(handle.clone()),
            balancer,
            concurrency: ConcurrencyManager::new(handle.clone()),
            metrics: MetricsCollector::new(),
            config: handle,
        }
    }

    /// Run one request through the full pipeline.
    ///
    /// `work` receives the selected provider and a cancellation token, and
    /// runs once the request is admitted under the concurrency cap.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::RateLimited`] before queuing when the client is
    ///   over its per-minute or per-hour budget.
    /// - [`GatewayError::NoProvider`] when no healthy provider exists at
    ///   admission time.
    /// - [`GatewayError::Cancelled`] / [`GatewayError::QueueCleared`] when
    ///   the request is discarded while still queued.
    /// - Whatever `work` itself returns, verbatim.
    pub async fn execute<F, Fut>(
        &self,
        client_id: &str,
        request_id: impl Into<String>,
        metadata: RequestMetadata,
        work: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce(ProviderPick, CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let request_id = request_id.into();

        let decision = self.rate_limiter.check(client_id).await;
        if !decision.allowed {
            let reason = decision
                .reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "rate limit exceeded".to_string());
            warn!(client = %client_id, request = %request_id, %reason, "request rejected");
            self.metrics
                .record_error(ErrorRecord {
                    kind: Some("rate_limited".into()),
                    ..ErrorRecord::default()
                })
                .await;
            return Err(GatewayError::RateLimited(reason));
        }

        let balancer = self.balancer.clone();
        let metrics = self.metrics.clone();
        let model = metadata.model.clone();
        let endpoint = metadata.endpoint.clone();

        self.concurrency
            .enqueue(request_id, metadata, move |token| async move {
                let Some(provider) = balancer.select().await else {
                    metrics
                        .record_error(ErrorRecord {
                            kind: Some("no_provider".into()),
                            model: model.clone(),
                            ..ErrorRecord::default()
                        })
                        .await;
                    metrics
                        .record_request(RequestOutcome {
                            successful: false,
                            model,
                            endpoint,
                            ..RequestOutcome::default()
                        })
                        .await;
                    return Err(GatewayError::NoProvider);
                };

                debug!(provider = %provider.name, "provider selected");
                let started = Instant::now();
                let result = work(provider.clone(), token).await;
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

                match &result {
                    Ok(_) => {
                        balancer.record_success(&provider.id, elapsed_ms).await;
                    }
                    Err(e) => {
                        balancer.record_failure(&provider.id).await;
                        metrics
                            .record_error(ErrorRecord {
                                kind: Some(error_kind(e).into()),
                                provider: Some(provider.id.clone()),
                                model: model.clone(),
                            })
                            .await;
                    }
                }
                metrics.record_response_time(elapsed_ms).await;
                metrics
                    .record_request(RequestOutcome {
                        successful: result.is_ok(),
                        provider: Some(provider.id),
                        model,
                        endpoint,
                    })
                    .await;
                result
            })
            .await
    }

    /// Record a resource usage sample against the shared collector.
    pub async fn record_resources(&self, sample: ResourceSample) {
        self.metrics.record_resources(sample).await;
    }

    /// One aggregate snapshot across all components.
    pub async fn snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot {
            rate_limiter: self.rate_limiter.stats().await,
            balancer: self.balancer.stats().await,
            concurrency: self.concurrency.stats().await,
            metrics: self.metrics.snapshot().await,
        }
    }

    /// The live configuration handle, for hot-reload wiring.
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// The per-client rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// The provider registry and selection strategy.
    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// The admission queue, for cancel/status/clear operations.
    pub fn concurrency(&self) -> &ConcurrencyManager<T> {
        &self.concurrency
    }

    /// The shared metrics collector.
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }
}

/// Stable error classification for metrics dimensions.
fn error_kind(error: &GatewayError) -> &'static str {
    match error {
        GatewayError::RateLimited(_) => "rate_limited",
        GatewayError::Cancelled => "cancelled",
        GatewayError::QueueCleared => "queue_cleared",
        GatewayError::NoProvider => "no_provider",
        GatewayError::Handler(_) => "handler",
        GatewayError::ChannelClosed => "channel_closed",
        GatewayError::Config(_) => "config",
        GatewayError::Other(_) => "other",
    }
}
