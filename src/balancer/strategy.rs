//! Provider selection strategies.
//!
//! ## Responsibility
//! Given the healthy-filtered candidate list, choose one index. Each strategy
//! is its own type behind the [`Strategy`] trait, so adding a strategy never
//! touches the selector's call site in the registry.
//!
//! ## Guarantees
//! - `pick` returns `Some` for every non-empty candidate list
//! - Strategies are stateless except round-robin's wrapping counter
//! - No strategy mutates the candidates; bookkeeping belongs to the registry
//!
//! ## NOT Responsible For
//! - Health filtering or connection counting (see `balancer`)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::UsageMode;

/// Read-only view of one healthy provider, in registration order.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    /// Requests currently in flight on this provider.
    pub connections: u64,
    /// Configured selection weight (> 0).
    pub weight: f64,
}

/// A provider selection policy over the healthy candidate list.
///
/// Implementations must return `Some(index)` into `candidates` whenever the
/// list is non-empty; the registry treats `None` on a non-empty list as a
/// strategy bug and falls back to index 0.
pub trait Strategy: Send + Sync {
    /// Stable name for logs and stats.
    fn name(&self) -> &'static str;

    /// Choose an index into `candidates`, or `None` if the list is empty.
    fn pick(&self, candidates: &[Candidate]) -> Option<usize>;
}

// ── Concrete strategies ──────────────────────────────────────────────────

/// Always the first healthy provider. Deterministic, no rotation — suits
/// single-tenant deployments where one primary backend should soak traffic.
#[derive(Debug, Default)]
pub struct FirstAvailable;

impl Strategy for FirstAvailable {
    fn name(&self) -> &'static str {
        "first_available"
    }

    fn pick(&self, candidates: &[Candidate]) -> Option<usize> {
        (!candidates.is_empty()).then_some(0)
    }
}

/// Rotate through healthy providers with a wrapping atomic counter.
///
/// The counter increases monotonically across all calls (wrapping at
/// `u64::MAX`) and is never reset when providers come or go, so membership
/// changes can transiently skew the rotation. Accepted behavior — the skew
/// lasts one pass over the list.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl Strategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn pick(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Some((n % candidates.len() as u64) as usize)
    }
}

/// Fewest in-flight requests wins; ties keep registration order.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl Strategy for LeastConnections {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn pick(&self, candidates: &[Candidate]) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (i, c) in candidates.iter().enumerate() {
            // Strict less-than keeps the earliest candidate on ties.
            if best.map_or(true, |(_, conns)| c.connections < conns) {
                best = Some((i, c.connections));
            }
        }
        best.map(|(i, _)| i)
    }
}

/// Cumulative-weight draw: sample uniformly in `[0, total_weight)`, then walk
/// the candidates subtracting each weight until the remainder is ≤ 0.
///
/// If floating error leaves no match after the walk, fall back to the first
/// candidate.
#[derive(Debug, Default)]
pub struct Weighted;

impl Strategy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn pick(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let total: f64 = candidates.iter().map(|c| c.weight).sum();
        let mut remainder = rand::thread_rng().gen_range(0.0..total.max(f64::MIN_POSITIVE));
        for (i, c) in candidates.iter().enumerate() {
            remainder -= c.weight;
            if remainder <= 0.0 {
                return Some(i);
            }
        }
        Some(0)
    }
}

/// Uniformly random healthy provider.
#[derive(Debug, Default)]
pub struct Random;

impl Strategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn pick(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }
}

// ── Configuration-time selection ─────────────────────────────────────────

/// Which selection strategy the balancer runs with. Chosen at configuration
/// time; hot config changes do not swap the strategy of a live balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Always the first healthy provider.
    FirstAvailable,
    /// Rotate across healthy providers.
    RoundRobin,
    /// Fewest in-flight requests.
    LeastConnections,
    /// Weight-proportional random draw.
    Weighted,
    /// Uniformly random.
    Random,
}

impl StrategyKind {
    /// Default strategy for a usage mode: single-tenant deployments pin to
    /// the first available provider, service deployments rotate.
    pub fn from_mode(mode: UsageMode) -> Self {
        match mode {
            UsageMode::Personal => StrategyKind::FirstAvailable,
            UsageMode::Service => StrategyKind::RoundRobin,
        }
    }

    /// Instantiate the strategy.
    pub fn build(self) -> Arc<dyn Strategy> {
        match self {
            StrategyKind::FirstAvailable => Arc::new(FirstAvailable),
            StrategyKind::RoundRobin => Arc::new(RoundRobin::default()),
            StrategyKind::LeastConnections => Arc::new(LeastConnections),
            StrategyKind::Weighted => Arc::new(Weighted),
            StrategyKind::Random => Arc::new(Random),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(specs: &[(u64, f64)]) -> Vec<Candidate> {
        specs
            .iter()
            .map(|&(connections, weight)| Candidate {
                connections,
                weight,
            })
            .collect()
    }

    #[test]
    fn test_every_strategy_returns_none_on_empty() {
        let empty: Vec<Candidate> = Vec::new();
        assert_eq!(FirstAvailable.pick(&empty), None);
        assert_eq!(RoundRobin::default().pick(&empty), None);
        assert_eq!(LeastConnections.pick(&empty), None);
        assert_eq!(Weighted.pick(&empty), None);
        assert_eq!(Random.pick(&empty), None);
    }

    #[test]
    fn test_first_available_always_index_zero() {
        let list = candidates(&[(5, 1.0), (0, 1.0), (2, 1.0)]);
        for _ in 0..10 {
            assert_eq!(FirstAvailable.pick(&list), Some(0));
        }
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let rr = RoundRobin::default();
        let list = candidates(&[(0, 1.0), (0, 1.0), (0, 1.0)]);

        let picks: Vec<usize> = (0..5).filter_map(|_| rr.pick(&list)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_round_robin_counter_wraps_without_panic() {
        let rr = RoundRobin {
            counter: AtomicU64::new(u64::MAX),
        };
        let list = candidates(&[(0, 1.0), (0, 1.0)]);

        // u64::MAX % 2 == 1, then the counter wraps to 0.
        assert_eq!(rr.pick(&list), Some(1));
        assert_eq!(rr.pick(&list), Some(0));
        assert_eq!(rr.pick(&list), Some(1));
    }

    #[test]
    fn test_round_robin_adapts_to_list_resize() {
        let rr = RoundRobin::default();
        let three = candidates(&[(0, 1.0), (0, 1.0), (0, 1.0)]);
        let two = candidates(&[(0, 1.0), (0, 1.0)]);

        rr.pick(&three); // counter 0
        rr.pick(&three); // counter 1
        // After a shrink the counter keeps marching — transient skew is fine,
        // but picks must stay in range.
        for _ in 0..10 {
            let pick = rr.pick(&two).unwrap();
            assert!(pick < 2);
        }
    }

    #[test]
    fn test_least_connections_picks_minimum() {
        let list = candidates(&[(4, 1.0), (1, 1.0), (3, 1.0)]);
        assert_eq!(LeastConnections.pick(&list), Some(1));
    }

    #[test]
    fn test_least_connections_ties_keep_registration_order() {
        let list = candidates(&[(2, 1.0), (1, 1.0), (1, 1.0)]);
        assert_eq!(LeastConnections.pick(&list), Some(1), "first minimum wins");
    }

    #[test]
    fn test_weighted_distribution_roughly_proportional() {
        // Weights {A:1, B:3} — over 10k draws B should win ≈3× as often.
        let list = candidates(&[(0, 1.0), (0, 3.0)]);
        let mut counts = [0u32; 2];
        for _ in 0..10_000 {
            counts[Weighted.pick(&list).unwrap()] += 1;
        }
        let ratio = f64::from(counts[1]) / f64::from(counts[0]);
        assert!(
            (2.7..=3.3).contains(&ratio),
            "expected B ≈ 3× A (±10%), got ratio {ratio:.2} ({counts:?})"
        );
    }

    #[test]
    fn test_weighted_single_candidate_always_chosen() {
        let list = candidates(&[(0, 0.25)]);
        for _ in 0..100 {
            assert_eq!(Weighted.pick(&list), Some(0));
        }
    }

    #[test]
    fn test_random_stays_in_range() {
        let list = candidates(&[(0, 1.0), (0, 1.0), (0, 1.0), (0, 1.0)]);
        for _ in 0..1000 {
            assert!(Random.pick(&list).unwrap() < 4);
        }
    }

    #[test]
    fn test_random_eventually_hits_every_index() {
        let list = candidates(&[(0, 1.0), (0, 1.0), (0, 1.0)]);
        let mut seen = [false; 3];
        for _ in 0..1000 {
            seen[Random.pick(&list).unwrap()] = true;
        }
        assert_eq!(seen, [true, true, true]);
    }

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(
            StrategyKind::from_mode(UsageMode::Personal),
            StrategyKind::FirstAvailable
        );
        assert_eq!(
            StrategyKind::from_mode(UsageMode::Service),
            StrategyKind::RoundRobin
        );
    }

    #[test]
    fn test_kind_serializes_to_snake_case() {
        let json = serde_json::to_string(&StrategyKind::LeastConnections)
            .expect("test: serialization");
        assert_eq!(json, "\"least_connections\"");
    }

    #[test]
    fn test_kind_build_reports_matching_name() {
        let pairs = [
            (StrategyKind::FirstAvailable, "first_available"),
            (StrategyKind::RoundRobin, "round_robin"),
            (StrategyKind::LeastConnections, "least_connections"),
            (StrategyKind::Weighted, "weighted"),
            (StrategyKind::Random, "random"),
        ];
        for (kind, name) in pairs {
            assert_eq!(kind.build().name(), name);
        }
    }
}
