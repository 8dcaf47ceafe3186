//! Passive instrumentation sink fed by every other component.
//!
//! ## Responsibility
//! Count requests and errors (globally and per provider/model/endpoint),
//! keep a bounded latency reservoir with percentile summaries, track
//! resource usage samples, and expose it all as one serializable snapshot.
//!
//! ## Guarantees
//! - Append-only and side-effect-only: recording never fails and never
//!   influences admission, routing, or rate limiting.
//! - The latency reservoir is capped at [`LATENCY_RESERVOIR_CAP`] samples,
//!   drop-oldest. Percentiles are recomputed by sorting the current
//!   reservoir on every insertion; O(n log n) per sample is an accepted
//!   scaling limit at this bound.
//! - Rates are percentages rounded to two decimals and reported as `0`
//!   when no traffic has occurred.
//!
//! ## NOT Responsible For
//! - Push telemetry or streaming: [`snapshot`](MetricsCollector::snapshot)
//!   is pull-based only.
//! - Durable history: all state is in-memory and lost on restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

/// Maximum latency samples retained; older samples are dropped first.
const LATENCY_RESERVOIR_CAP: usize = 1000;

/// Maximum rolling samples retained per resource track.
const RESOURCE_SAMPLE_CAP: usize = 100;

// ── Recording inputs ─────────────────────────────────────────────────────

/// One finished request, with optional routing dimensions.
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    /// Whether the request succeeded.
    pub successful: bool,
    /// Provider that served it.
    pub provider: Option<String>,
    /// Model it targeted.
    pub model: Option<String>,
    /// Logical endpoint it hit.
    pub endpoint: Option<String>,
}

/// One recorded error, with optional classification dimensions.
#[derive(Debug, Clone, Default)]
pub struct ErrorRecord {
    /// Error classification, e.g. `"timeout"` or `"no_provider"`.
    pub kind: Option<String>,
    /// Provider involved, if known.
    pub provider: Option<String>,
    /// Model involved, if known.
    pub model: Option<String>,
}

/// One resource usage sample. Absent fields leave their track untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    /// Memory usage, in whatever unit the caller samples (bytes, MB).
    pub memory: Option<f64>,
    /// CPU usage, typically a percentage.
    pub cpu: Option<f64>,
}

// ── Internal state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
}

impl Counters {
    fn bump(&mut self, successful: bool) {
        self.total += 1;
        if successful {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
    }
}

#[derive(Debug, Default)]
struct LatencyState {
    /// Bounded reservoir, oldest at the front.
    samples: VecDeque<f64>,
    /// Total samples ever observed, including evicted ones.
    count: u64,
    /// Running extremes over the lifetime, not the reservoir window.
    min_ms: Option<f64>,
    max_ms: Option<f64>,
    mean_ms: f64,
    p50_ms: f64,
    p95_ms: f64,
    p99_ms: f64,
}

impl LatencyState {
    fn record(&mut self, ms: f64) {
        self.count += 1;
        self.min_ms = Some(self.min_ms.map_or(ms, |m| m.min(ms)));
        self.max_ms = Some(self.max_ms.map_or(ms, |m| m.max(ms)));

        if self.samples.len() == LATENCY_RESERVOIR_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        self.mean_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
        self.p50_ms = percentile(&sorted, 50.0);
        self.p95_ms = percentile(&sorted, 95.0);
        self.p99_ms = percentile(&sorted, 99.0);
    }
}

#[derive(Debug, Default)]
struct ResourceTrack {
    current: f64,
    peak: f64,
    samples: VecDeque<f64>,
}

impl ResourceTrack {
    fn record(&mut self, value: f64) {
        self.current = value;
        self.peak = self.peak.max(value);
        if self.samples.len() == RESOURCE_SAMPLE_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn summary(&self) -> ResourceSummary {
        let average = if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        };
        ResourceSummary {
            current: self.current,
            peak: self.peak,
            average: round2(average),
        }
    }
}

#[derive(Debug, Default)]
struct ErrorState {
    total: u64,
    by_kind: HashMap<String, u64>,
    by_provider: HashMap<String, u64>,
    by_model: HashMap<String, u64>,
}

#[derive(Debug)]
struct MetricsState {
    started_at: Instant,
    requests: Counters,
    by_provider: HashMap<String, Counters>,
    by_model: HashMap<String, Counters>,
    by_endpoint: HashMap<String, Counters>,
    errors: ErrorState,
    latency: LatencyState,
    memory: ResourceTrack,
    cpu: ResourceTrack,
}

impl MetricsState {
    fn fresh() -> Self {
        Self {
            started_at: Instant::now(),
            requests: Counters::default(),
            by_provider: HashMap::new(),
            by_model: HashMap::new(),
            by_endpoint: HashMap::new(),
            errors: ErrorState::default(),
            latency: LatencyState::default(),
            memory: ResourceTrack::default(),
            cpu: ResourceTrack::default(),
        }
    }
}

// ── Snapshot views ───────────────────────────────────────────────────────

/// Request totals plus derived rates.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    /// Total requests recorded.
    pub total: u64,
    /// Requests recorded as successful.
    pub successful: u64,
    /// Requests recorded as failed.
    pub failed: u64,
    /// Percentage successful, 2 decimals, 0 with no traffic.
    pub success_rate: f64,
    /// Percentage failed, 2 decimals, 0 with no traffic.
    pub error_rate: f64,
}

/// Per-dimension request counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DimensionCounters {
    /// Total requests for this dimension value.
    pub total: u64,
    /// Successful requests.
    pub successful: u64,
    /// Failed requests.
    pub failed: u64,
}

/// Latency reservoir summary.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencySummary {
    /// Samples ever observed, including those evicted from the reservoir.
    pub count: u64,
    /// Lifetime minimum, ms.
    pub min_ms: f64,
    /// Lifetime maximum, ms.
    pub max_ms: f64,
    /// Mean over the current reservoir, ms.
    pub mean_ms: f64,
    /// Median over the current reservoir, ms.
    pub p50_ms: f64,
    /// 95th percentile, ms.
    pub p95_ms: f64,
    /// 99th percentile, ms.
    pub p99_ms: f64,
}

/// Error totals with per-dimension breakdowns.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    /// Total errors recorded.
    pub total: u64,
    /// Counts per error classification.
    pub by_kind: HashMap<String, u64>,
    /// Counts per provider.
    pub by_provider: HashMap<String, u64>,
    /// Counts per model.
    pub by_model: HashMap<String, u64>,
}

/// One resource track's summary.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceSummary {
    /// Most recent sample.
    pub current: f64,
    /// Lifetime peak.
    pub peak: f64,
    /// Average over the rolling sample window, 2 decimals.
    pub average: f64,
}

/// The full pull-based metrics view.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Seconds since creation or the last [`MetricsCollector::reset`].
    pub uptime_secs: u64,
    /// Global request totals and rates.
    pub requests: RequestSummary,
    /// Request counters keyed by provider.
    pub by_provider: HashMap<String, DimensionCounters>,
    /// Request counters keyed by model.
    pub by_model: HashMap<String, DimensionCounters>,
    /// Request counters keyed by endpoint.
    pub by_endpoint: HashMap<String, DimensionCounters>,
    /// Error totals and breakdowns.
    pub errors: ErrorSummary,
    /// Latency reservoir summary.
    pub latency: LatencySummary,
    /// Memory usage track.
    pub memory: ResourceSummary,
    /// CPU usage track.
    pub cpu: ResourceSummary,
}

// ── Collector ────────────────────────────────────────────────────────────

/// Shared metrics recorder. Cloning is cheap; all clones feed one state.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Empty collector with the uptime clock started now.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::fresh())),
        }
    }

    /// Count one finished request, globally and for each dimension present.
    pub async fn record_request(&self, outcome: RequestOutcome) {
        let mut state = self.inner.lock().await;
        state.requests.bump(outcome.successful);
        if let Some(provider) = outcome.provider {
            state
                .by_provider
                .entry(provider)
                .or_default()
                .bump(outcome.successful);
        }
        if let Some(model) = outcome.model {
            state
                .by_model
                .entry(model)
                .or_default()
                .bump(outcome.successful);
        }
        if let Some(endpoint) = outcome.endpoint {
            state
                .by_endpoint
                .entry(endpoint)
                .or_default()
                .bump(outcome.successful);
        }
    }

    /// Append one latency sample and refresh the percentile summary.
    pub async fn record_response_time(&self, ms: f64) {
        let mut state = self.inner.lock().await;
        state.latency.record(ms);
    }

    /// Count one error, with optional classification dimensions.
    pub async fn record_error(&self, record: ErrorRecord) {
        let mut state = self.inner.lock().await;
        state.errors.total += 1;
        if let Some(kind) = record.kind {
            *state.errors.by_kind.entry(kind).or_insert(0) += 1;
        }
        if let Some(provider) = record.provider {
            *state.errors.by_provider.entry(provider).or_insert(0) += 1;
        }
        if let Some(model) = record.model {
            *state.errors.by_model.entry(model).or_insert(0) += 1;
        }
    }

    /// Record a resource usage sample. Absent fields are skipped.
    pub async fn record_resources(&self, sample: ResourceSample) {
        let mut state = self.inner.lock().await;
        if let Some(memory) = sample.memory {
            state.memory.record(memory);
        }
        if let Some(cpu) = sample.cpu {
            state.cpu.record(cpu);
        }
    }

    /// Compute the full metrics view.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let state = self.inner.lock().await;
        let total = state.requests.total;
        let (success_rate, error_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                round2(state.requests.successful as f64 * 100.0 / total as f64),
                round2(state.requests.failed as f64 * 100.0 / total as f64),
            )
        };
        MetricsSnapshot {
            uptime_secs: state.started_at.elapsed().as_secs(),
            requests: RequestSummary {
                total,
                successful: state.requests.successful,
                failed: state.requests.failed,
                success_rate,
                error_rate,
            },
            by_provider: dimension_view(&state.by_provider),
            by_model: dimension_view(&state.by_model),
            by_endpoint: dimension_view(&state.by_endpoint),
            errors: ErrorSummary {
                total: state.errors.total,
                by_kind: state.errors.by_kind.clone(),
                by_provider: state.errors.by_provider.clone(),
                by_model: state.errors.by_model.clone(),
            },
            latency: LatencySummary {
                count: state.latency.count,
                min_ms: state.latency.min_ms.unwrap_or(0.0),
                max_ms: state.latency.max_ms.unwrap_or(0.0),
                mean_ms: round2(state.latency.mean_ms),
                p50_ms: state.latency.p50_ms,
                p95_ms: state.latency.p95_ms,
                p99_ms: state.latency.p99_ms,
            },
            memory: state.memory.summary(),
            cpu: state.cpu.summary(),
        }
    }

    /// Zero all state and restart the uptime clock.
    pub async fn reset(&self) {
        let mut state = self.inner.lock().await;
        *state = MetricsState::fresh();
        debug!("metrics reset");
    }
}

fn dimension_view(counters: &HashMap<String, Counters>) -> HashMap<String, DimensionCounters> {
    counters
        .iter()
        .map(|(key, c)| {
            (
                key.clone(),
                DimensionCounters {
                    total: c.total,
                    successful: c.successful,
                    failed: c.failed,
                },
            )
        })
        .collect()
}

/// Nearest-rank percentile: `sorted[ceil(n * p / 100) - 1]`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (sorted.len() as f64 * p / 100.0).ceil() as usize;
    sorted[rank.max(1) - 1]
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
