//! Strategy variation tracking: reproducible LCG-seeded assignment of a
//! variation name per `(strategy, window key)`, plus a per-variant P&L
//! summary, covering an arbitrary named set of variations per strategy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariationConfig {
    pub enabled: bool,
    /// Relative weight per variation name; assignment draws are
    /// proportional to these weights. Equal weights if empty.
    pub weights: HashMap<String, f64>,
}

impl Default for VariationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            weights: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariationStats {
    pub trades: usize,
    pub pnl: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariationSummary {
    pub enabled: bool,
    pub stats_by_variation: HashMap<String, VariationStats>,
    pub market_assignments: HashMap<String, String>,
}

/// Tracks which variation each `(strategy, window key)` was assigned,
/// and accumulates per-variation trade count / P&L.
#[derive(Debug)]
pub struct VariationTracker {
    config: VariationConfig,
    assignments: HashMap<String, String>,
    stats: HashMap<String, VariationStats>,
    rng_state: u64,
}

impl Default for VariationTracker {
    fn default() -> Self {
        Self::new(VariationConfig::default())
    }
}

impl VariationTracker {
    pub fn new(config: VariationConfig) -> Self {
        Self {
            config,
            assignments: HashMap::new(),
            stats: HashMap::new(),
            rng_state: 42,
        }
    }

    fn next_random(&mut self) -> f64 {
        self.rng_state = self.rng_state.wrapping_mul(1103515245).wrapping_add(12345);
        ((self.rng_state >> 16) & 0x7FFF) as f64 / 32767.0
    }

    /// Assigns (or recalls) a variation name for `key`, from
    /// `candidate_variations`, weighted by `config.weights`. If A/B
    /// tracking is disabled, the first candidate is always returned.
    pub fn assign(&mut self, key: &str, candidate_variations: &[String]) -> Option<String> {
        if candidate_variations.is_empty() {
            return None;
        }
        if !self.config.enabled {
            return Some(candidate_variations[0].clone());
        }
        if let Some(existing) = self.assignments.get(key) {
            return Some(existing.clone());
        }

        let total_weight: f64 = candidate_variations
            .iter()
            .map(|v| self.config.weights.get(v).copied().unwrap_or(1.0))
            .sum();
        let draw = self.next_random() * total_weight;

        let mut cumulative = 0.0;
        let mut chosen = candidate_variations.last().unwrap().clone();
        for variation in candidate_variations {
            cumulative += self.config.weights.get(variation).copied().unwrap_or(1.0);
            if draw <= cumulative {
                chosen = variation.clone();
                break;
            }
        }

        self.assignments.insert(key.to_string(), chosen.clone());
        Some(chosen)
    }

    pub fn peek(&self, key: &str) -> Option<&str> {
        self.assignments.get(key).map(|s| s.as_str())
    }

    pub fn record_result(&mut self, variation: &str, pnl: f64) {
        let entry = self.stats.entry(variation.to_string()).or_default();
        entry.trades += 1;
        entry.pnl += pnl;
    }

    pub fn summary(&self) -> VariationSummary {
        VariationSummary {
            enabled: self.config.enabled,
            stats_by_variation: self.stats.clone(),
            market_assignments: self.assignments.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.assignments.clear();
        self.stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variations() -> Vec<String> {
        vec!["control".to_string(), "aggressive".to_string()]
    }

    #[test]
    fn disabled_always_returns_first_candidate() {
        let mut tracker = VariationTracker::new(VariationConfig {
            enabled: false,
            weights: HashMap::new(),
        });
        assert_eq!(tracker.assign("w1", &variations()), Some("control".to_string()));
    }

    #[test]
    fn assignment_is_stable_per_key() {
        let mut tracker = VariationTracker::new(VariationConfig {
            enabled: true,
            weights: HashMap::new(),
        });
        let first = tracker.assign("w1", &variations());
        let second = tracker.assign("w1", &variations());
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_keys_can_diverge() {
        let mut tracker = VariationTracker::new(VariationConfig {
            enabled: true,
            weights: HashMap::new(),
        });
        let mut seen = std::collections::HashSet::new();
        for i in 0..50 {
            if let Some(v) = tracker.assign(&format!("w{i}"), &variations()) {
                seen.insert(v);
            }
        }
        assert!(seen.len() <= 2);
    }

    #[test]
    fn record_result_accumulates_per_variation() {
        let mut tracker = VariationTracker::new(VariationConfig::default());
        tracker.record_result("control", 10.0);
        tracker.record_result("control", -4.0);
        tracker.record_result("aggressive", 20.0);

        let summary = tracker.summary();
        assert_eq!(summary.stats_by_variation["control"].trades, 2);
        assert!((summary.stats_by_variation["control"].pnl - 6.0).abs() < 1e-9);
        assert_eq!(summary.stats_by_variation["aggressive"].trades, 1);
    }

    #[test]
    fn empty_candidates_returns_none() {
        let mut tracker = VariationTracker::new(VariationConfig::default());
        assert_eq!(tracker.assign("w1", &[]), None);
    }
}
