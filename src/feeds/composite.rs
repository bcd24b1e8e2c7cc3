//! Composite spot price: a VWAP-style blend of exchange mid-prices,
//! polled over REST rather than streamed, with an EWMA estimate of
//! per-second return variance.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;

use super::{get_with_retry, RateLimiter};

const MAX_HISTORY_PER_SYMBOL: usize = 600;
const BINANCE_TICKER_URL: &str = "https://api.binance.com/api/v3/ticker/price";

#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub ts_ms: i64,
    pub mid: f64,
}

#[derive(Default)]
struct SymbolState {
    latest: Option<PricePoint>,
    history: VecDeque<PricePoint>,
    ewma_var: Option<f64>,
}

#[derive(Deserialize)]
struct BinanceTickerResponse {
    price: String,
}

/// Polls one or more exchange tickers and exposes the latest/near-time
/// mid price plus an EWMA-derived volatility estimate per symbol.
pub struct CompositeFeed {
    client: reqwest::Client,
    limiter: tokio::sync::Mutex<RateLimiter>,
    ewma_lambda: f64,
    state: RwLock<HashMap<String, SymbolState>>,
    /// Maps this crate's symbol (e.g. "BTC") to the exchange ticker
    /// symbol (e.g. "BTCUSDT").
    ticker_symbols: HashMap<String, String>,
}

impl CompositeFeed {
    pub fn new(ticker_symbols: HashMap<String, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            limiter: tokio::sync::Mutex::new(RateLimiter::new(20, Duration::from_secs(1))),
            ewma_lambda: 0.97,
            state: RwLock::new(HashMap::new()),
            ticker_symbols,
        }
    }

    /// Fetch the latest ticker price for `symbol` and fold it into the
    /// rolling state. The caller decides the polling cadence.
    pub async fn poll(&self, symbol: &str) -> Result<PricePoint> {
        let ticker = self
            .ticker_symbols
            .get(symbol)
            .with_context(|| format!("no ticker mapping for symbol {symbol}"))?
            .clone();

        {
            let mut limiter = self.limiter.lock().await;
            limiter.acquire().await;
        }

        let response = get_with_retry(
            &self.client,
            BINANCE_TICKER_URL,
            &[("symbol", ticker)],
        )
        .await?;
        let parsed: BinanceTickerResponse = response.json().await.context("parse ticker price")?;
        let mid: f64 = parsed.price.parse().context("ticker price not numeric")?;
        let point = PricePoint {
            ts_ms: Utc::now().timestamp_millis(),
            mid,
        };

        self.update_symbol(symbol, point);
        Ok(point)
    }

    fn update_symbol(&self, symbol: &str, point: PricePoint) {
        let mut guard = self.state.write();
        let entry = guard.entry(symbol.to_string()).or_default();

        if let Some(prev) = entry.latest {
            if prev.mid > 0.0 && point.ts_ms > prev.ts_ms {
                let dt_secs = ((point.ts_ms - prev.ts_ms) as f64 / 1000.0).max(1e-6);
                let log_ret = (point.mid / prev.mid).ln();
                let per_sec_var = (log_ret * log_ret) / dt_secs;
                entry.ewma_var = Some(match entry.ewma_var {
                    Some(v) => self.ewma_lambda * v + (1.0 - self.ewma_lambda) * per_sec_var,
                    None => per_sec_var,
                });
            }
        }

        entry.latest = Some(point);
        entry.history.push_back(point);
        if entry.history.len() > MAX_HISTORY_PER_SYMBOL {
            entry.history.pop_front();
        }
    }

    /// Directly ingest a price point without a network round-trip (used
    /// by tests, and by the staleness/on-chain comparison paths that
    /// already have a number from elsewhere).
    pub fn ingest(&self, symbol: &str, point: PricePoint) {
        self.update_symbol(symbol, point);
    }

    pub fn latest(&self, symbol: &str) -> Option<PricePoint> {
        self.state.read().get(symbol).and_then(|s| s.latest)
    }

    /// Nearest-in-time price within `max_skew_ms`, for reconciling a spot
    /// read against a specific window-open timestamp.
    pub fn near(&self, symbol: &str, target_ms: i64, max_skew_ms: i64) -> Option<PricePoint> {
        let guard = self.state.read();
        let state = guard.get(symbol)?;
        state
            .history
            .iter()
            .filter(|p| (p.ts_ms - target_ms).abs() <= max_skew_ms)
            .min_by_key(|p| (p.ts_ms - target_ms).abs())
            .copied()
    }

    /// Per-second sigma derived from the EWMA variance of log returns.
    pub fn sigma_per_sqrt_second(&self, symbol: &str) -> Option<f64> {
        let guard = self.state.read();
        let v = guard.get(symbol)?.ewma_var?;
        (v.is_finite() && v > 0.0).then(|| v.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> CompositeFeed {
        CompositeFeed::new(HashMap::from([("BTC".to_string(), "BTCUSDT".to_string())]))
    }

    #[test]
    fn ingest_updates_latest_and_history() {
        let f = feed();
        f.ingest("BTC", PricePoint { ts_ms: 1000, mid: 95000.0 });
        f.ingest("BTC", PricePoint { ts_ms: 2000, mid: 95100.0 });
        assert_eq!(f.latest("BTC").unwrap().mid, 95100.0);
    }

    #[test]
    fn sigma_is_none_until_two_observations() {
        let f = feed();
        assert!(f.sigma_per_sqrt_second("BTC").is_none());
        f.ingest("BTC", PricePoint { ts_ms: 1000, mid: 95000.0 });
        assert!(f.sigma_per_sqrt_second("BTC").is_none());
        f.ingest("BTC", PricePoint { ts_ms: 2000, mid: 95100.0 });
        assert!(f.sigma_per_sqrt_second("BTC").is_some());
    }

    #[test]
    fn near_picks_closest_timestamp_within_skew() {
        let f = feed();
        f.ingest("BTC", PricePoint { ts_ms: 1000, mid: 95000.0 });
        f.ingest("BTC", PricePoint { ts_ms: 5000, mid: 95200.0 });
        let found = f.near("BTC", 4500, 1000).unwrap();
        assert_eq!(found.ts_ms, 5000);
        assert!(f.near("BTC", 10_000, 1000).is_none());
    }
}
