//! Probability Model: Black-Scholes N(d2) with rolling realized
//! volatility, surprise detection, and calibration bucketing.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::models::bucket_label;

/// Abramowitz–Stegun approximation of the standard normal CDF.
/// `Φ(+∞)=1`, `Φ(−∞)=0`, `Φ(NaN)=NaN`. Accuracy target ±1e-4 on
/// `{-3,-2,-1,0,1,2,3}`.
pub fn norm_cdf(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    if x == f64::INFINITY {
        return 1.0;
    }
    if x == f64::NEG_INFINITY {
        return 0.0;
    }

    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() / std::f64::consts::SQRT_2;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();

    0.5 * (1.0 + sign * y)
}

/// `d2 = (ln(S/K) + (r - sigma^2/2) * T) / (sigma * sqrt(T))`, `r = 0`.
pub fn d2(s: f64, k: f64, sigma: f64, t_years: f64) -> f64 {
    ((s / k).ln() - 0.5 * sigma * sigma * t_years) / (sigma * t_years.sqrt())
}

/// `p_up = Phi(d2)`. Deterministic edge cases: `T<=0` or
/// `sigma<=0` collapses to the sign of `S` vs `K`.
pub fn p_up(s: f64, k: f64, sigma: f64, t_years: f64) -> f64 {
    if t_years <= 0.0 || sigma <= 0.0 {
        return if s > k {
            1.0
        } else if s < k {
            0.0
        } else {
            0.5
        };
    }
    norm_cdf(d2(s, k, sigma, t_years))
}

const MS_PER_YEAR: f64 = 365.25 * 86400.0 * 1000.0;

pub fn t_years_from_ms(t_ms: i64) -> f64 {
    (t_ms.max(0)) as f64 / MS_PER_YEAR
}

/// Volatility lookback configuration.
#[derive(Debug, Clone, Copy)]
pub struct VolatilityConfig {
    pub short_term_lookback_ms: i64,
    pub long_term_lookback_ms: i64,
    pub fallback_sigma: f64,
    pub cache_expiry_ms: i64,
    pub high_surprise_threshold: f64,
    pub low_surprise_threshold: f64,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            short_term_lookback_ms: 15 * 60 * 1000,
            long_term_lookback_ms: 6 * 3600 * 1000,
            fallback_sigma: 0.5,
            cache_expiry_ms: 60_000,
            high_surprise_threshold: 1.5,
            low_surprise_threshold: 0.67,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    sigma: f64,
    calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    price: f64,
    at: DateTime<Utc>,
}

/// Tracks on-chain oracle price observations per symbol and computes
/// annualised realized volatility of log returns, caching the result so
/// the hot probability path stays synchronous.
pub struct VolatilityTracker {
    config: VolatilityConfig,
    observations: RwLock<HashMap<String, VecDeque<Observation>>>,
    short_cache: RwLock<HashMap<String, CacheEntry>>,
    long_cache: RwLock<HashMap<String, CacheEntry>>,
}

impl VolatilityTracker {
    pub fn new(config: VolatilityConfig) -> Self {
        Self {
            config,
            observations: RwLock::new(HashMap::new()),
            short_cache: RwLock::new(HashMap::new()),
            long_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Record an oracle price observation for a symbol.
    pub fn record_observation(&self, symbol: &str, price: f64, at: DateTime<Utc>) {
        if !(price > 0.0) {
            return;
        }
        let symbol = symbol.to_lowercase();
        let mut obs = self.observations.write();
        let entry = obs.entry(symbol).or_default();
        entry.push_back(Observation { price, at });
        // Keep up to the long lookback plus a little slack; anything older
        // is never needed for either window.
        let cutoff = at - chrono::Duration::milliseconds(self.config.long_term_lookback_ms * 2);
        while entry.front().map(|o| o.at < cutoff).unwrap_or(false) {
            entry.pop_front();
        }
    }

    /// Annualised stdev of log returns over a trailing window. `None` if
    /// fewer than two valid log returns are available.
    fn realized_vol(&self, symbol: &str, lookback_ms: i64, now: DateTime<Utc>) -> Option<f64> {
        let symbol = symbol.to_lowercase();
        let obs = self.observations.read();
        let series = obs.get(&symbol)?;
        let cutoff = now - chrono::Duration::milliseconds(lookback_ms);
        let points: Vec<&Observation> = series.iter().filter(|o| o.at >= cutoff).collect();
        if points.len() < 2 {
            return None;
        }
        let mut log_returns = Vec::with_capacity(points.len() - 1);
        let mut dt_secs_total = 0.0;
        for w in points.windows(2) {
            let (a, b) = (w[0], w[1]);
            if a.price <= 0.0 || b.price <= 0.0 {
                continue;
            }
            let dt = (b.at - a.at).num_milliseconds() as f64 / 1000.0;
            if dt <= 0.0 {
                continue;
            }
            log_returns.push((b.price / a.price).ln());
            dt_secs_total += dt;
        }
        if log_returns.len() < 2 {
            return None;
        }
        let n = log_returns.len() as f64;
        let mean = log_returns.iter().sum::<f64>() / n;
        let variance = log_returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let avg_dt_secs = dt_secs_total / n;
        if avg_dt_secs <= 0.0 {
            return None;
        }
        let periods_per_year = (365.25 * 86400.0) / avg_dt_secs;
        Some((variance * periods_per_year).sqrt())
    }

    fn lookback_for_window(&self, window_duration_ms: i64) -> i64 {
        if window_duration_ms < 30 * 60 * 1000 {
            self.config.short_term_lookback_ms
        } else {
            self.config.long_term_lookback_ms
        }
    }

    /// Returns the cached/fallback sigma synchronously, kicking off a
    /// recompute if the cache is stale or missing. The hot path never
    /// blocks on the recompute.
    pub fn get_sigma(&self, symbol: &str, window_duration_ms: i64, now: DateTime<Utc>) -> f64 {
        let lookback_ms = self.lookback_for_window(window_duration_ms);
        let cache = if lookback_ms == self.config.short_term_lookback_ms {
            &self.short_cache
        } else {
            &self.long_cache
        };
        let symbol_key = symbol.to_lowercase();

        let needs_refresh = {
            let guard = cache.read();
            match guard.get(&symbol_key) {
                Some(entry) => {
                    (now - entry.calculated_at).num_milliseconds() > self.config.cache_expiry_ms
                }
                None => true,
            }
        };

        if needs_refresh {
            if let Some(sigma) = self.realized_vol(symbol, lookback_ms, now) {
                cache.write().insert(
                    symbol_key.clone(),
                    CacheEntry {
                        sigma,
                        calculated_at: now,
                    },
                );
            }
        }

        cache
            .read()
            .get(&symbol_key)
            .map(|e| e.sigma)
            .unwrap_or(self.config.fallback_sigma)
    }

    /// `ratio = sigma_short/sigma_long`; surprise iff ratio outside
    /// `[lowThreshold, highThreshold]`. Never available ⇒ not a surprise.
    pub fn is_surprise(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        let short = self.realized_vol(symbol, self.config.short_term_lookback_ms, now);
        let long = self.realized_vol(symbol, self.config.long_term_lookback_ms, now);
        match (short, long) {
            (Some(s), Some(l)) if l > 0.0 && s > 0.0 => {
                let ratio = s / l;
                ratio > self.config.high_surprise_threshold
                    || ratio < self.config.low_surprise_threshold
            }
            _ => false,
        }
    }
}

/// Calibration alert configuration.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationConfig {
    pub min_sample_size: usize,
    pub alert_threshold: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 100,
            alert_threshold: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BucketStats {
    correct: u64,
    total: u64,
}

/// Tracks per-bucket hit rates for calibration alerting.
pub struct CalibrationTracker {
    config: CalibrationConfig,
    buckets: RwLock<HashMap<&'static str, BucketStats>>,
}

impl CalibrationTracker {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, predicted_p_up: f64, correct: bool) {
        let bucket = bucket_label(predicted_p_up);
        let mut guard = self.buckets.write();
        let stats = guard.entry(bucket).or_default();
        stats.total += 1;
        if correct {
            stats.correct += 1;
        }
    }

    /// Recompute hit rate for a bucket straight from recorded counts,
    /// so it always matches whatever was last persisted.
    pub fn hit_rate(&self, bucket: &str) -> Option<f64> {
        let guard = self.buckets.read();
        let stats = guard.get(bucket)?;
        if stats.total == 0 {
            return None;
        }
        Some(stats.correct as f64 / stats.total as f64)
    }

    fn bucket_midpoint(bucket: &str) -> f64 {
        match bucket {
            "0-10%" => 0.05,
            "10-20%" => 0.15,
            "20-30%" => 0.25,
            "30-40%" => 0.35,
            "40-50%" => 0.45,
            "50-60%" => 0.55,
            "60-70%" => 0.65,
            "70-80%" => 0.75,
            "80-90%" => 0.85,
            _ => 0.95,
        }
    }

    /// Buckets with enough samples whose hit rate deviates from the
    /// bucket midpoint by more than `alertThreshold`.
    pub fn alerts(&self) -> Vec<(&'static str, f64)> {
        let guard = self.buckets.read();
        guard
            .iter()
            .filter(|(_, stats)| stats.total as usize >= self.config.min_sample_size)
            .filter_map(|(bucket, stats)| {
                let rate = stats.correct as f64 / stats.total as f64;
                let deviation = (rate - Self::bucket_midpoint(bucket)).abs();
                (deviation > self.config.alert_threshold).then_some((*bucket, rate))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_cdf_boundary_values() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-4);
        assert!((norm_cdf(1.0) - 0.8413).abs() < 1e-4);
        assert!((norm_cdf(-1.0) - 0.1587).abs() < 1e-4);
        assert_eq!(norm_cdf(f64::INFINITY), 1.0);
        assert_eq!(norm_cdf(f64::NEG_INFINITY), 0.0);
        assert!(norm_cdf(f64::NAN).is_nan());
    }

    #[test]
    fn norm_cdf_accuracy_on_integers() {
        let expected = [
            (-3.0, 0.0013499),
            (-2.0, 0.0227501),
            (-1.0, 0.1586553),
            (0.0, 0.5),
            (1.0, 0.8413447),
            (2.0, 0.9772499),
            (3.0, 0.9986501),
        ];
        for (x, want) in expected {
            assert!(
                (norm_cdf(x) - want).abs() < 1e-4,
                "x={x} got={} want={want}",
                norm_cdf(x)
            );
        }
    }

    #[test]
    fn p_up_in_range_and_complementary() {
        let p = p_up(95_500.0, 94_500.0, 0.5, t_years_from_ms(300_000));
        assert!((0.0..=1.0).contains(&p));
        assert!((p + (1.0 - p) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn p_up_degenerate_time_or_vol() {
        assert_eq!(p_up(100.0, 90.0, 0.5, 0.0), 1.0);
        assert_eq!(p_up(80.0, 90.0, 0.5, 0.0), 0.0);
        assert_eq!(p_up(90.0, 90.0, 0.5, 0.0), 0.5);
        assert_eq!(p_up(100.0, 90.0, 0.0, 1.0), 1.0);
    }

    #[test]
    fn scenario_profitable_entry() {
        let t = t_years_from_ms(300_000);
        let p = p_up(95_500.0, 94_500.0, 0.5, t);
        assert!(p > 0.65, "p_up={p}");
        let edge = p - 0.52;
        assert!(edge > 0.15, "edge={edge}");
    }

    #[test]
    fn scenario_overpriced_market() {
        let t = t_years_from_ms(300_000);
        let p = p_up(94_600.0, 94_500.0, 0.5, t);
        let edge = p - 0.85;
        assert!(edge < 0.0, "edge={edge}");
    }

    #[test]
    fn volatility_falls_back_without_observations() {
        let tracker = VolatilityTracker::new(VolatilityConfig::default());
        let sigma = tracker.get_sigma("btc", 300_000, Utc::now());
        assert_eq!(sigma, 0.5);
    }

    #[test]
    fn volatility_computed_from_observations() {
        let tracker = VolatilityTracker::new(VolatilityConfig::default());
        let now = Utc::now();
        for i in 0..10 {
            tracker.record_observation(
                "btc",
                95_000.0 + (i as f64) * 10.0,
                now - chrono::Duration::seconds(600 - i * 60),
            );
        }
        let sigma = tracker.get_sigma("btc", 300_000, now);
        assert!(sigma > 0.0);
    }

    #[test]
    fn calibration_alert_fires_on_deviation() {
        let tracker = CalibrationTracker::new(CalibrationConfig {
            min_sample_size: 10,
            alert_threshold: 0.15,
        });
        for _ in 0..100 {
            tracker.record(0.95, false);
        }
        let alerts = tracker.alerts();
        assert!(alerts.iter().any(|(b, _)| *b == "90-100%"));
    }

    #[test]
    fn calibration_hit_rate_matches_recompute() {
        let tracker = CalibrationTracker::new(CalibrationConfig::default());
        tracker.record(0.55, true);
        tracker.record(0.58, false);
        tracker.record(0.52, true);
        let rate = tracker.hit_rate("50-60%").unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }
}
