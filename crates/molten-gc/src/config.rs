//! Heap configuration.
//!
//! All tunables of the collector live here. The generation-budget heuristic
//! is a replaceable policy function: the default balances pause frequency
//! against working-set growth, but embedders (and tests) can install their
//! own, the same way a custom collect condition would be installed in other
//! collectors.

use std::time::Duration;

use crate::heap::Generation;

/// Inputs to the budget policy, captured at the end of a collection.
#[derive(Debug, Clone, Copy)]
pub struct SurvivalStats {
    /// The generation that was condemned.
    pub condemned: Generation,
    /// Bytes of condemned objects that survived.
    pub bytes_surviving: usize,
    /// Bytes of condemned objects examined.
    pub bytes_condemned: usize,
    /// The budget in effect before this collection.
    pub prior_budget: usize,
}

impl SurvivalStats {
    /// Fraction of condemned bytes that survived, in `[0, 1]`.
    #[must_use]
    pub fn survivor_ratio(&self) -> f64 {
        if self.bytes_condemned == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.bytes_surviving as f64 / self.bytes_condemned as f64
            }
        }
    }
}

/// Recomputes the Gen0 allocation budget after a collection.
pub type BudgetPolicy = fn(&SurvivalStats, &HeapConfig) -> usize;

/// The default budget policy.
///
/// High survivor ratios mean the collection was mostly wasted work, so the
/// budget grows (collect less often); low ratios mean garbage accumulates
/// fast enough that a tighter budget keeps pauses short. The result is
/// clamped to the configured bounds.
#[must_use]
pub fn default_budget_policy(stats: &SurvivalStats, config: &HeapConfig) -> usize {
    let ratio = stats.survivor_ratio();
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let next = if ratio > 0.6 {
        (stats.prior_budget as f64 * config.growth_factor) as usize
    } else if ratio < 0.2 {
        (stats.prior_budget as f64 / config.shrink_factor) as usize
    } else {
        stats.prior_budget
    };
    next.clamp(config.min_gen0_budget, config.max_gen0_budget)
}

/// Configuration for a [`RuntimeHeap`](crate::RuntimeHeap).
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Initial Gen0 allocation budget: bytes of new allocation allowed
    /// before a Gen0 collection is triggered.
    pub gen0_budget: usize,
    /// Lower clamp for the recomputed Gen0 budget.
    pub min_gen0_budget: usize,
    /// Upper clamp for the recomputed Gen0 budget.
    pub max_gen0_budget: usize,
    /// Bytes of old-generation growth before a full (or background)
    /// collection is triggered.
    pub gen2_budget: usize,
    /// Budget growth multiplier applied on high survivor ratios.
    pub growth_factor: f64,
    /// Budget shrink divisor applied on low survivor ratios.
    pub shrink_factor: f64,
    /// Size of the span handed to an allocation context on refill.
    pub alloc_quantum: usize,
    /// Whether full collections run on the background collector thread.
    /// Matches the runtime's classic `GCconcurrent` switch.
    pub concurrent: bool,
    /// How long the suspension coordinator waits for a mutator to reach a
    /// safe point before exempting it and treating its stack as pinned.
    pub suspend_timeout: Duration,
    /// A full collection compacts a segment when its free-space ratio
    /// exceeds this threshold.
    pub compact_free_ratio: f64,
    /// The budget recomputation policy.
    pub budget_policy: BudgetPolicy,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            gen0_budget: 4 * 1024 * 1024,
            min_gen0_budget: 64 * 1024,
            max_gen0_budget: 64 * 1024 * 1024,
            gen2_budget: 16 * 1024 * 1024,
            growth_factor: 1.5,
            shrink_factor: 1.5,
            alloc_quantum: 8 * 1024,
            concurrent: false,
            suspend_timeout: Duration::from_millis(250),
            compact_free_ratio: 0.3,
            budget_policy: default_budget_policy,
        }
    }
}

impl HeapConfig {
    /// A configuration suitable for tests: tiny budgets so collections
    /// trigger quickly.
    #[must_use]
    pub fn small() -> Self {
        Self {
            gen0_budget: 16 * 1024,
            min_gen0_budget: 8 * 1024,
            max_gen0_budget: 1024 * 1024,
            gen2_budget: 256 * 1024,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Generation;

    fn stats(surviving: usize, condemned: usize, prior: usize) -> SurvivalStats {
        SurvivalStats {
            condemned: Generation::Gen0,
            bytes_surviving: surviving,
            bytes_condemned: condemned,
            prior_budget: prior,
        }
    }

    #[test]
    fn high_survival_grows_budget() {
        let config = HeapConfig::default();
        let next = default_budget_policy(&stats(900, 1000, 1024 * 1024), &config);
        assert!(next > 1024 * 1024);
    }

    #[test]
    fn low_survival_shrinks_budget() {
        let config = HeapConfig::default();
        let next = default_budget_policy(&stats(10, 1000, 1024 * 1024), &config);
        assert!(next < 1024 * 1024);
    }

    #[test]
    fn budget_is_clamped() {
        let config = HeapConfig::default();
        let next = default_budget_policy(&stats(0, 1, config.min_gen0_budget), &config);
        assert_eq!(next, config.min_gen0_budget);
        let next = default_budget_policy(&stats(1, 1, config.max_gen0_budget), &config);
        assert_eq!(next, config.max_gen0_budget);
    }

    #[test]
    fn empty_condemned_set_counts_as_zero_survival() {
        assert!((stats(0, 0, 1).survivor_ratio() - 0.0).abs() < f64::EPSILON);
    }
}
