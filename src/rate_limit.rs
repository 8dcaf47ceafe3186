//! Per-client fixed-window rate limiting.
//!
//! ## Responsibility
//! First gate of the request pipeline: decide per client whether a request
//! may enter the gateway at all, over two independent fixed windows (minute
//! and hour). Buckets are computed by integer division of epoch time, so
//! windows are discrete, not sliding.
//!
//! ## Guarantees
//! - Count-then-decide: both window counters are incremented **before** the
//!   limits are evaluated, so a rejected request still counts against later
//!   requests in the same window. This is deliberate and load-shedding
//!   friendly: a client hammering the gateway never sees its window drain.
//! - `check` never fails; rejection is a structured value, not an error.
//! - Whitelisted clients and a disabled limiter are always allowed.
//! - A limit ≤ 0 disables that dimension (unlimited).
//! - Limits are re-read from [`ConfigHandle`] on every check — hot-reloadable.
//!
//! ## NOT Responsible For
//! - Concurrency caps (that belongs to `concurrency`)
//! - Scheduling `cleanup` (an external scheduler calls it periodically)

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ConfigHandle;

/// Seconds in the minute window.
const MINUTE_SECS: u64 = 60;
/// Seconds in the hour window.
const HOUR_SECS: u64 = 3600;
/// Buckets whose window ended more than this long ago are evicted by `cleanup`.
const BUCKET_TTL_SECS: u64 = 3600;

// ── Bucket storage ───────────────────────────────────────────────────────

/// The two fixed-window dimensions tracked per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WindowKind {
    Minute,
    Hour,
}

impl WindowKind {
    fn secs(self) -> u64 {
        match self {
            WindowKind::Minute => MINUTE_SECS,
            WindowKind::Hour => HOUR_SECS,
        }
    }
}

/// Key of one fixed-window bucket: (client, dimension, bucket index).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    client: String,
    window: WindowKind,
    bucket: u64,
}

/// One bucket's live state. Counts are monotonic within a bucket and reset
/// only by bucket rollover (a new bucket index makes a new entry).
#[derive(Debug, Clone, Copy)]
struct WindowSlot {
    count: u64,
    /// Epoch second at which this bucket's window ends.
    reset_at: u64,
}

// ── Decision types ───────────────────────────────────────────────────────

/// Which dimension rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The per-minute quota is exhausted.
    PerMinute,
    /// The per-hour quota is exhausted.
    PerHour,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::PerMinute => write!(f, "too many requests per minute"),
            RejectReason::PerHour => write!(f, "too many requests per hour"),
        }
    }
}

/// Requests left in each dimension. `None` means that dimension is unlimited
/// (disabled limit, disabled limiter, or whitelisted client).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemainingQuota {
    /// Remaining requests in the current minute bucket.
    pub per_minute: Option<u64>,
    /// Remaining requests in the current hour bucket.
    pub per_hour: Option<u64>,
}

/// Epoch seconds at which each tracked window rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetTimes {
    /// End of the current minute bucket, when tracked.
    pub minute: Option<u64>,
    /// End of the current hour bucket, when tracked.
    pub hour: Option<u64>,
}

/// Structured admission decision. Never an error — callers branch on
/// [`allowed`](RateDecision::allowed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Populated only when `allowed` is false.
    pub reason: Option<RejectReason>,
    /// Quota left after this request was counted.
    pub remaining: RemainingQuota,
    /// When the tracked windows reset.
    pub reset_at: ResetTimes,
}

impl RateDecision {
    /// Decision for requests exempt from limiting entirely.
    fn exempt() -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining: RemainingQuota::default(),
            reset_at: ResetTimes::default(),
        }
    }
}

/// Point-in-time view of the limiter, for the pull-based stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    /// Whether limiting is currently enabled.
    pub enabled: bool,
    /// Configured per-minute limit (≤ 0 = unlimited).
    pub requests_per_minute: i64,
    /// Configured per-hour limit (≤ 0 = unlimited).
    pub requests_per_hour: i64,
    /// Distinct clients with at least one bucket younger than one hour.
    pub active_clients: usize,
    /// Number of whitelisted client ids.
    pub whitelist_size: usize,
}

// ── Limiter ──────────────────────────────────────────────────────────────

/// Per-client fixed-window rate limiter.
///
/// Cloning is cheap; all clones share the same buckets and whitelist.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<BucketKey, WindowSlot>>,
    whitelist: Arc<DashSet<String>>,
    config: ConfigHandle,
}

impl RateLimiter {
    /// Create a limiter reading its thresholds from `config` on every check.
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            whitelist: Arc::new(DashSet::new()),
            config,
        }
    }

    /// Check whether `client_id` may proceed, counting this request against
    /// both windows regardless of the outcome.
    ///
    /// Count-then-decide: the increments happen first, so the 4th call under
    /// a limit of 3 is rejected with zero remaining, and keeps counting.
    pub async fn check(&self, client_id: &str) -> RateDecision {
        let cfg = self.config.rate_limit().await;

        if !cfg.enabled || self.whitelist.contains(client_id) {
            return RateDecision::exempt();
        }

        let now = epoch_secs();
        let (minute_count, minute_reset) = self.bump(client_id, WindowKind::Minute, now);
        let (hour_count, hour_reset) = self.bump(client_id, WindowKind::Hour, now);

        let minute_limit = positive_limit(cfg.requests_per_minute);
        let hour_limit = positive_limit(cfg.requests_per_hour);

        let remaining = RemainingQuota {
            per_minute: minute_limit.map(|l| l.saturating_sub(minute_count)),
            per_hour: hour_limit.map(|l| l.saturating_sub(hour_count)),
        };
        let reset_at = ResetTimes {
            minute: minute_limit.map(|_| minute_reset),
            hour: hour_limit.map(|_| hour_reset),
        };

        let reason = if minute_limit.is_some_and(|l| minute_count > l) {
            Some(RejectReason::PerMinute)
        } else if hour_limit.is_some_and(|l| hour_count > l) {
            Some(RejectReason::PerHour)
        } else {
            None
        };

        if let Some(reason) = reason {
            warn!(
                client_id = client_id,
                reason = %reason,
                minute_count = minute_count,
                hour_count = hour_count,
                "rate limit exceeded"
            );
            RateDecision {
                allowed: false,
                reason: Some(reason),
                remaining,
                reset_at,
            }
        } else {
            debug!(
                client_id = client_id,
                minute_count = minute_count,
                hour_count = hour_count,
                "rate limit check passed"
            );
            RateDecision {
                allowed: true,
                reason: None,
                remaining,
                reset_at,
            }
        }
    }

    /// Increment the client's bucket for one window and return
    /// (count after increment, bucket reset epoch-second).
    fn bump(&self, client_id: &str, window: WindowKind, now: u64) -> (u64, u64) {
        let secs = window.secs();
        let bucket = now / secs;
        let key = BucketKey {
            client: client_id.to_string(),
            window,
            bucket,
        };
        let mut slot = self.buckets.entry(key).or_insert(WindowSlot {
            count: 0,
            reset_at: (bucket + 1) * secs,
        });
        slot.count += 1;
        (slot.count, slot.reset_at)
    }

    /// Drop every bucket belonging to `client_id`, restoring its full quota.
    pub fn reset(&self, client_id: &str) {
        self.buckets.retain(|key, _| key.client != client_id);
        debug!(client_id = client_id, "rate limit reset");
    }

    /// Exempt a client from all limiting. Effective immediately.
    pub fn add_to_whitelist(&self, client_id: impl Into<String>) {
        let client_id = client_id.into();
        debug!(client_id = %client_id, "client whitelisted");
        self.whitelist.insert(client_id);
    }

    /// Remove a client's exemption. Effective immediately.
    pub fn remove_from_whitelist(&self, client_id: &str) -> bool {
        let removed = self.whitelist.remove(client_id).is_some();
        if removed {
            debug!(client_id = client_id, "client removed from whitelist");
        }
        removed
    }

    /// Whether a client is currently whitelisted.
    pub fn is_whitelisted(&self, client_id: &str) -> bool {
        self.whitelist.contains(client_id)
    }

    /// Current limiter statistics.
    pub async fn stats(&self) -> RateLimiterStats {
        let cfg = self.config.rate_limit().await;
        let cutoff = epoch_secs().saturating_sub(BUCKET_TTL_SECS);

        let mut active: std::collections::HashSet<String> = std::collections::HashSet::new();
        for entry in self.buckets.iter() {
            if entry.value().reset_at > cutoff {
                active.insert(entry.key().client.clone());
            }
        }

        RateLimiterStats {
            enabled: cfg.enabled,
            requests_per_minute: cfg.requests_per_minute,
            requests_per_hour: cfg.requests_per_hour,
            active_clients: active.len(),
            whitelist_size: self.whitelist.len(),
        }
    }

    /// Evict buckets whose window ended more than an hour ago.
    ///
    /// No internal timer: an external scheduler invokes this periodically.
    /// Returns the number of evicted buckets.
    pub fn cleanup(&self) -> usize {
        let cutoff = epoch_secs().saturating_sub(BUCKET_TTL_SECS);
        let before = self.buckets.len();
        self.buckets.retain(|_, slot| slot.reset_at > cutoff);
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            debug!(evicted = evicted, "stale rate-limit buckets evicted");
        }
        evicted
    }
}

/// Current time as whole seconds since the Unix epoch.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A configured limit as an enforceable quota, `None` when ≤ 0 (unlimited).
fn positive_limit(limit: i64) -> Option<u64> {
    (limit > 0).then_some(limit as u64)
}
