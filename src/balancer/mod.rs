//! Load-aware, health-aware provider selection.
//!
//! ## Responsibility
//! Own the provider registry: registration, selection through a configured
//! [`Strategy`], per-provider connection counting, threshold-based health
//! tripping, and per-provider statistics.
//!
//! ## Guarantees
//! - Only healthy providers are eligible for selection; when none are
//!   healthy, [`LoadBalancer::select`] returns `None` — a value, never an
//!   error. Callers treat it as "no backend available".
//! - Selection is not read-only: a successful pick increments the provider's
//!   in-flight count, stamps `last_used`, and counts a request.
//! - A provider trips unhealthy after exactly 5 consecutive failures and
//!   stays down until an explicit [`LoadBalancer::set_health`] — there is no
//!   recovery timer.
//! - `reset_stats` zeroes counters and samples only; health, weight, and
//!   live connection counts are untouched.
//!
//! ## NOT Responsible For
//! - Executing requests against a provider (the handler does that)
//! - Retrying after failure (caller policy, layered above)

pub mod strategy;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::UsageMode;
use crate::GatewayError;

pub use strategy::{Candidate, Strategy, StrategyKind};

/// Consecutive failures after which a provider is marked unhealthy.
const UNHEALTHY_THRESHOLD: u32 = 5;
/// Rolling latency sample size per provider.
const LATENCY_SAMPLE_CAP: usize = 100;

// ── Registry records ─────────────────────────────────────────────────────

/// Live state of one registered provider.
#[derive(Debug, Clone)]
struct Provider {
    id: String,
    name: String,
    weight: f64,
    connections: u64,
    healthy: bool,
    error_count: u32,
    last_used: Option<u64>,
}

/// Per-provider counters and latency sample.
#[derive(Debug, Clone, Default)]
struct ProviderStats {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    /// Most recent latencies, capped at [`LATENCY_SAMPLE_CAP`] (drop-oldest).
    latencies_ms: VecDeque<f64>,
    avg_latency_ms: f64,
}

struct Registry {
    providers: Vec<Provider>,
    stats: HashMap<String, ProviderStats>,
}

// ── Public views ─────────────────────────────────────────────────────────

/// The outcome of a successful selection: enough identity for the handler to
/// run the request and report back by id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderPick {
    /// Provider id, used for `record_success` / `record_failure`.
    pub id: String,
    /// Human-readable provider name.
    pub name: String,
    /// Configured weight, echoed for observability.
    pub weight: f64,
}

/// Point-in-time view of one provider, merged with its stats.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    /// Provider id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Configured weight.
    pub weight: f64,
    /// Requests currently in flight.
    pub connections: u64,
    /// Whether the provider is eligible for selection.
    pub healthy: bool,
    /// Consecutive failures since the last success.
    pub error_count: u32,
    /// Epoch seconds of the last selection, if any.
    pub last_used: Option<u64>,
    /// Total requests routed to this provider.
    pub total_requests: u64,
    /// Requests that completed successfully.
    pub successful_requests: u64,
    /// Requests that failed.
    pub failed_requests: u64,
    /// Mean of the rolling latency sample.
    pub avg_latency_ms: f64,
}

/// Full balancer view for the pull-based stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    /// Name of the active selection strategy.
    pub strategy: &'static str,
    /// All registered providers in registration order.
    pub providers: Vec<ProviderSnapshot>,
}

// ── Balancer ─────────────────────────────────────────────────────────────

/// Provider registry plus selection strategy plus health tracking.
///
/// Cloning is cheap; all clones share the same registry.
#[derive(Clone)]
pub struct LoadBalancer {
    inner: Arc<RwLock<Registry>>,
    strategy: Arc<dyn Strategy>,
}

impl LoadBalancer {
    /// Create a balancer with the given strategy.
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Registry {
                providers: Vec::new(),
                stats: HashMap::new(),
            })),
            strategy: kind.build(),
        }
    }

    /// Create a balancer with the default strategy for a usage mode:
    /// first-available for `Personal`, round-robin for `Service`.
    pub fn from_mode(mode: UsageMode) -> Self {
        Self::new(StrategyKind::from_mode(mode))
    }

    /// Name of the active selection strategy.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Register a provider with the given selection weight.
    ///
    /// A re-registered id replaces the old entry and starts a fresh stats
    /// record. New providers start healthy with zero connections.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if `weight` is not strictly positive.
    pub async fn add_provider(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        weight: f64,
    ) -> Result<(), GatewayError> {
        if !weight.is_finite() || weight <= 0.0 {
            return Err(GatewayError::Config(format!(
                "provider weight must be > 0, got {weight}"
            )));
        }
        let id = id.into();
        let provider = Provider {
            id: id.clone(),
            name: name.into(),
            weight,
            connections: 0,
            healthy: true,
            error_count: 0,
            last_used: None,
        };

        let mut reg = self.inner.write().await;
        if let Some(existing) = reg.providers.iter_mut().find(|p| p.id == id) {
            *existing = provider;
        } else {
            reg.providers.push(provider);
        }
        reg.stats.insert(id.clone(), ProviderStats::default());
        info!(provider = %id, weight = weight, "provider registered");
        Ok(())
    }

    /// Drop a provider and its stats. Returns false for an unknown id.
    pub async fn remove_provider(&self, id: &str) -> bool {
        let mut reg = self.inner.write().await;
        let before = reg.providers.len();
        reg.providers.retain(|p| p.id != id);
        let removed = reg.providers.len() != before;
        if removed {
            reg.stats.remove(id);
            info!(provider = id, "provider removed");
        }
        removed
    }

    /// Select a provider for the next request.
    ///
    /// Filters to healthy providers, delegates the choice to the strategy,
    /// and performs selection bookkeeping: increments the pick's in-flight
    /// count and total-request stat, and stamps `last_used`.
    ///
    /// Returns `None` when no healthy provider exists — callers must treat
    /// this as "no backend available", not raise an error.
    pub async fn select(&self) -> Option<ProviderPick> {
        let mut reg = self.inner.write().await;

        let healthy: Vec<usize> = reg
            .providers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.healthy)
            .map(|(i, _)| i)
            .collect();
        if healthy.is_empty() {
            debug!(strategy = self.strategy.name(), "no healthy providers");
            return None;
        }

        let candidates: Vec<Candidate> = healthy
            .iter()
            .map(|&i| Candidate {
                connections: reg.providers[i].connections,
                weight: reg.providers[i].weight,
            })
            .collect();
        // Strategies return Some for non-empty input; index 0 is the
        // documented fallback if one misbehaves.
        let choice = self.strategy.pick(&candidates).unwrap_or(0);
        let idx = healthy[choice.min(healthy.len() - 1)];

        let provider = &mut reg.providers[idx];
        provider.connections += 1;
        provider.last_used = Some(epoch_secs());
        let pick = ProviderPick {
            id: provider.id.clone(),
            name: provider.name.clone(),
            weight: provider.weight,
        };

        if let Some(stats) = reg.stats.get_mut(&pick.id) {
            stats.total_requests += 1;
        }
        debug!(
            provider = %pick.id,
            strategy = self.strategy.name(),
            "provider selected"
        );
        Some(pick)
    }

    /// Report a completed request: releases the connection, clears the
    /// consecutive-error count, and folds the latency into the rolling
    /// sample (capped, drop-oldest) and its mean.
    pub async fn record_success(&self, id: &str, latency_ms: f64) {
        let mut reg = self.inner.write().await;
        let Some(provider) = reg.providers.iter_mut().find(|p| p.id == id) else {
            debug!(provider = id, "success recorded for unknown provider");
            return;
        };
        provider.connections = provider.connections.saturating_sub(1);
        provider.error_count = 0;

        if let Some(stats) = reg.stats.get_mut(id) {
            stats.successful_requests += 1;
            stats.latencies_ms.push_back(latency_ms);
            if stats.latencies_ms.len() > LATENCY_SAMPLE_CAP {
                stats.latencies_ms.pop_front();
            }
            stats.avg_latency_ms =
                stats.latencies_ms.iter().sum::<f64>() / stats.latencies_ms.len() as f64;
        }
    }

    /// Report a failed request: releases the connection and bumps the
    /// consecutive-error count. At 5 consecutive failures the provider is
    /// marked unhealthy and stays down until [`set_health`](Self::set_health).
    pub async fn record_failure(&self, id: &str) {
        let mut reg = self.inner.write().await;
        let Some(provider) = reg.providers.iter_mut().find(|p| p.id == id) else {
            debug!(provider = id, "failure recorded for unknown provider");
            return;
        };
        provider.connections = provider.connections.saturating_sub(1);
        provider.error_count += 1;
        if provider.error_count >= UNHEALTHY_THRESHOLD && provider.healthy {
            provider.healthy = false;
            warn!(
                provider = id,
                consecutive_errors = provider.error_count,
                "provider marked unhealthy"
            );
        }

        if let Some(stats) = reg.stats.get_mut(id) {
            stats.failed_requests += 1;
        }
    }

    /// Explicitly set a provider's health. Re-enabling also resets its
    /// consecutive-error count — this is the only recovery path.
    /// Returns false for an unknown id.
    pub async fn set_health(&self, id: &str, healthy: bool) -> bool {
        let mut reg = self.inner.write().await;
        let Some(provider) = reg.providers.iter_mut().find(|p| p.id == id) else {
            return false;
        };
        provider.healthy = healthy;
        if healthy {
            provider.error_count = 0;
            info!(provider = id, "provider re-enabled");
        } else {
            warn!(provider = id, "provider manually disabled");
        }
        true
    }

    /// Number of providers currently eligible for selection.
    pub async fn healthy_count(&self) -> usize {
        self.inner
            .read()
            .await
            .providers
            .iter()
            .filter(|p| p.healthy)
            .count()
    }

    /// Snapshot of every provider merged with its stats.
    pub async fn stats(&self) -> BalancerStats {
        let reg = self.inner.read().await;
        let providers = reg
            .providers
            .iter()
            .map(|p| {
                let stats = reg.stats.get(&p.id).cloned().unwrap_or_default();
                ProviderSnapshot {
                    id: p.id.clone(),
                    name: p.name.clone(),
                    weight: p.weight,
                    connections: p.connections,
                    healthy: p.healthy,
                    error_count: p.error_count,
                    last_used: p.last_used,
                    total_requests: stats.total_requests,
                    successful_requests: stats.successful_requests,
                    failed_requests: stats.failed_requests,
                    avg_latency_ms: stats.avg_latency_ms,
                }
            })
            .collect();
        BalancerStats {
            strategy: self.strategy.name(),
            providers,
        }
    }

    /// Zero all counters and latency samples. Health, weight, and live
    /// connection counts are untouched.
    pub async fn reset_stats(&self) {
        let mut reg = self.inner.write().await;
        for stats in reg.stats.values_mut() {
            *stats = ProviderStats::default();
        }
        debug!("balancer stats reset");
    }
}

/// Current time as whole seconds since the Unix epoch.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
