//! Shared configuration for both search engines.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::eval::ScoreProvider;

/// How MCTS values a leaf it has just expanded.
#[derive(Clone)]
pub enum RolloutPolicy {
    /// Play uniform-random moves to the end of the game (or a bounded
    /// horizon), resolving round ends with fresh factory deals.
    Random,
    /// No playout; score the leaf with the built-in heuristic.
    Heuristic,
    /// No playout; ask an external evaluator. Provider failures abort the
    /// search.
    External(Arc<dyn ScoreProvider>),
}

impl fmt::Debug for RolloutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutPolicy::Random => f.write_str("Random"),
            RolloutPolicy::Heuristic => f.write_str("Heuristic"),
            RolloutPolicy::External(_) => f.write_str("External(..)"),
        }
    }
}

/// Budgets and tuning knobs. `max_depth` drives alpha-beta,
/// `max_rollouts`/`exploration_constant`/`rollout_policy` drive MCTS, and
/// `max_time` caps both.
#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub max_depth: u8,
    pub max_time: Option<Duration>,
    pub max_rollouts: u32,
    pub exploration_constant: f32,
    pub rollout_policy: RolloutPolicy,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_depth: 6,
            max_time: None,
            max_rollouts: 1_000,
            exploration_constant: std::f32::consts::SQRT_2,
            rollout_policy: RolloutPolicy::Random,
        }
    }
}

impl SearchConfig {
    /// Small budgets for unit tests.
    pub fn for_testing() -> Self {
        Self {
            max_depth: 3,
            max_rollouts: 64,
            ..Self::default()
        }
    }

    pub fn with_max_depth(mut self, depth: u8) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_time(mut self, limit: Duration) -> Self {
        self.max_time = Some(limit);
        self
    }

    pub fn with_max_rollouts(mut self, rollouts: u32) -> Self {
        self.max_rollouts = rollouts;
        self
    }

    pub fn with_exploration_constant(mut self, c: f32) -> Self {
        self.exploration_constant = c;
        self
    }

    pub fn with_rollout_policy(mut self, policy: RolloutPolicy) -> Self {
        self.rollout_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        let config = SearchConfig::default()
            .with_max_depth(4)
            .with_max_time(Duration::from_millis(50))
            .with_max_rollouts(10)
            .with_exploration_constant(0.7)
            .with_rollout_policy(RolloutPolicy::Heuristic);
        assert_eq!(config.max_depth, 4);
        assert_eq!(config.max_time, Some(Duration::from_millis(50)));
        assert_eq!(config.max_rollouts, 10);
        assert!((config.exploration_constant - 0.7).abs() < f32::EPSILON);
        assert!(matches!(config.rollout_policy, RolloutPolicy::Heuristic));
    }
}
