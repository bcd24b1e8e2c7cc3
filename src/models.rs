//! Shared data-model types: tokens, order books, windows, signals,
//! positions, and the probability-calibration record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One side of a binary market. An opaque exchange-assigned identifier.
pub type TokenId = String;

/// A single price level: price in `(0,1)`, size in shares.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

/// Side of the order book a `price_change` delta applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

/// An L2 order book for one token. Bids keyed descending, asks ascending;
/// `BTreeMap` with a reversed iteration order on the bid side gives us
/// that for free without a custom comparator per level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub token_id: TokenId,
    /// price (as milli-cents, i.e. price * 1_000_000 rounded) -> size.
    /// Keyed on an integer to keep `BTreeMap` ordering exact for
    /// floating-point prices quoted as decimal strings.
    bids: BTreeMap<PriceKey, f64>,
    asks: BTreeMap<PriceKey, f64>,
    pub last_trade_price: Option<f64>,
    pub last_update_at: Option<DateTime<Utc>>,
}

/// Fixed-point key so price levels sort exactly regardless of f64 noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct PriceKey(i64);

impl PriceKey {
    fn from_price(p: f64) -> Self {
        PriceKey((p * 1_000_000.0).round() as i64)
    }

    fn to_price(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
}

impl OrderBook {
    pub fn new(token_id: TokenId) -> Self {
        Self {
            token_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_trade_price: None,
            last_update_at: None,
        }
    }

    /// Replace both sides wholesale (a `book` snapshot event). Zero-size
    /// levels are dropped.
    pub fn replace_snapshot(&mut self, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>, now: DateTime<Utc>) {
        self.bids = bids
            .into_iter()
            .filter(|l| l.size > 0.0)
            .map(|l| (PriceKey::from_price(l.price), l.size))
            .collect();
        self.asks = asks
            .into_iter()
            .filter(|l| l.size > 0.0)
            .map(|l| (PriceKey::from_price(l.price), l.size))
            .collect();
        self.last_update_at = Some(now);
    }

    /// Apply a single `price_change` delta: `size == 0` deletes the level,
    /// otherwise it is upserted.
    pub fn apply_delta(&mut self, side: BookSide, price: f64, size: f64, now: DateTime<Utc>) {
        let key = PriceKey::from_price(price);
        let side_map = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        if size <= 0.0 {
            side_map.remove(&key);
        } else {
            side_map.insert(key, size);
        }
        self.last_update_at = Some(now);
    }

    pub fn set_last_trade_price(&mut self, price: f64, now: DateTime<Utc>) {
        self.last_trade_price = Some(price);
        self.last_update_at = Some(now);
    }

    /// Bids descending by price.
    pub fn bids(&self) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .map(|(k, &size)| PriceLevel {
                price: k.to_price(),
                size,
            })
            .collect()
    }

    /// Asks ascending by price.
    pub fn asks(&self) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .map(|(k, &size)| PriceLevel {
                price: k.to_price(),
                size,
            })
            .collect()
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.keys().next_back().map(|k| k.to_price())
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.keys().next().map(|k| k.to_price())
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    /// `true` when `bestBid >= bestAsk` for a book with both sides
    /// non-empty. An empty side is never considered crossed.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b >= a,
            _ => false,
        }
    }

    /// Sigma price*size within 1% of best on one side.
    pub fn depth_1pct_bid(&self) -> f64 {
        let Some(best) = self.best_bid() else {
            return 0.0;
        };
        let lower = best * 0.99;
        self.bids()
            .into_iter()
            .filter(|l| l.price >= lower && l.price <= best)
            .map(|l| l.price * l.size)
            .sum()
    }

    pub fn depth_1pct_ask(&self) -> f64 {
        let Some(best) = self.best_ask() else {
            return 0.0;
        };
        let upper = best * 1.01;
        self.asks()
            .into_iter()
            .filter(|l| l.price >= best && l.price <= upper)
            .map(|l| l.price * l.size)
            .sum()
    }
}

/// A point-in-time snapshot of an order book, suitable for serialisation
/// to callers that should not see the live mutable structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub token_id: TokenId,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub mid: Option<f64>,
    pub spread: Option<f64>,
    pub bid_depth_1pct: f64,
    pub ask_depth_1pct: f64,
    pub last_trade_price: Option<f64>,
    pub last_update_at: Option<DateTime<Utc>>,
}

impl From<&OrderBook> for BookSnapshot {
    fn from(book: &OrderBook) -> Self {
        Self {
            token_id: book.token_id.clone(),
            bids: book.bids(),
            asks: book.asks(),
            best_bid: book.best_bid(),
            best_ask: book.best_ask(),
            mid: book.mid(),
            spread: book.spread(),
            bid_depth_1pct: book.depth_1pct_bid(),
            ask_depth_1pct: book.depth_1pct_ask(),
            last_trade_price: book.last_trade_price,
            last_update_at: book.last_update_at,
        }
    }
}

/// Open prices captured near a window's epoch, from three independent
/// sources.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OpenPrices {
    pub composite: Option<f64>,
    pub aggregator: Option<f64>,
    pub vwap20: Option<f64>,
}

/// A 15-minute epoch for one underlying symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Window {
    pub window_id: String,
    pub symbol: String,
    pub epoch: i64,
    pub close_time_ms: i64,
    pub reference_price: Option<f64>,
    pub up_token_id: TokenId,
    pub down_token_id: Option<TokenId>,
    pub open_prices: OpenPrices,
    pub created_at: DateTime<Utc>,
    pub settled: bool,
}

impl Window {
    /// `windowId = symbol-15m-epoch`.
    pub fn window_id_for(symbol: &str, epoch: i64) -> String {
        format!("{symbol}-15m-{epoch}")
    }

    pub fn time_remaining_ms(&self, now_ms: i64) -> i64 {
        (self.close_time_ms - now_ms).max(0)
    }
}

/// Direction a signal/position takes. Only `Long` exists today — no
/// market-making or short inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
}

/// UP or DOWN side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Up,
    Down,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Up => "up",
            Side::Down => "down",
        }
    }
}

/// Captured market context at the moment a signal or trade is recorded.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MarketContext {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub spread: Option<f64>,
    pub bid_depth_1pct: f64,
    pub ask_depth_1pct: f64,
}

/// A candidate entry for one token in one window at one evaluation point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub strategy_id: String,
    pub window_id: String,
    pub token_id: TokenId,
    pub direction: Direction,
    pub model_probability: f64,
    pub market_price: f64,
    pub edge: f64,
    pub created_at: DateTime<Utc>,
    pub context: MarketContext,
}

impl Signal {
    pub fn new(
        strategy_id: impl Into<String>,
        window_id: impl Into<String>,
        token_id: impl Into<String>,
        model_probability: f64,
        market_price: f64,
        context: MarketContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy_id: strategy_id.into(),
            window_id: window_id.into(),
            token_id: token_id.into(),
            direction: Direction::Long,
            model_probability,
            market_price,
            edge: model_probability - market_price,
            created_at: Utc::now(),
            context,
        }
    }
}

/// One opened trade on a specific token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub window_id: String,
    pub strategy_id: String,
    pub token_id: TokenId,
    pub side: Side,
    pub size_shares: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub peak_price: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub realized_pnl: Option<f64>,
    pub is_paper: bool,
}

impl Position {
    pub fn new(
        window_id: impl Into<String>,
        strategy_id: impl Into<String>,
        token_id: impl Into<String>,
        side: Side,
        size_shares: f64,
        entry_price: f64,
        is_paper: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            window_id: window_id.into(),
            strategy_id: strategy_id.into(),
            token_id: token_id.into(),
            side,
            size_shares,
            entry_price,
            current_price: entry_price,
            peak_price: entry_price,
            opened_at: Utc::now(),
            closed_at: None,
            close_reason: None,
            realized_pnl: None,
            is_paper,
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    /// Update to the latest mid/top-of-book price. Monotonically advances
    /// `peak_price` in the position's favorable direction.
    pub fn update_current_price(&mut self, price: f64) {
        self.current_price = price;
        if matches!(self.side, Side::Up) {
            if price > self.peak_price {
                self.peak_price = price;
            }
        } else if price < self.peak_price {
            self.peak_price = price;
        }
    }

    pub fn unrealized_pnl(&self) -> f64 {
        (self.current_price - self.entry_price) * self.size_shares
    }

    pub fn peak_pnl_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        match self.side {
            Side::Up => (self.peak_price - self.entry_price) / self.entry_price,
            Side::Down => (self.entry_price - self.peak_price) / self.entry_price,
        }
    }

    pub fn close(&mut self, reason: impl Into<String>, realized_pnl: f64) {
        self.closed_at = Some(Utc::now());
        self.close_reason = Some(reason.into());
        self.realized_pnl = Some(realized_pnl);
    }
}

/// Calibration bucket label, a decile on `[0,1]`.
pub fn bucket_label(p: f64) -> &'static str {
    if p < 0.1 {
        "0-10%"
    } else if p < 0.2 {
        "10-20%"
    } else if p < 0.3 {
        "20-30%"
    } else if p < 0.4 {
        "30-40%"
    } else if p < 0.5 {
        "40-50%"
    } else if p < 0.6 {
        "50-60%"
    } else if p < 0.7 {
        "60-70%"
    } else if p < 0.8 {
        "70-80%"
    } else if p < 0.9 {
        "80-90%"
    } else {
        // Closed on the right: [0.9, 1.0] and anything above/at 1.0 or NaN.
        "90-100%"
    }
}

/// Persisted calibration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbabilityPrediction {
    pub id: Option<i64>,
    pub window_id: String,
    pub symbol: String,
    pub predicted_p_up: f64,
    pub bucket: String,
    pub oracle_price: f64,
    pub strike: f64,
    pub t_ms: i64,
    pub sigma: f64,
    pub vol_surprise: Option<bool>,
    pub actual_outcome: Option<String>,
    pub correct: Option<bool>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl ProbabilityPrediction {
    pub fn new(
        window_id: impl Into<String>,
        symbol: impl Into<String>,
        predicted_p_up: f64,
        oracle_price: f64,
        strike: f64,
        t_ms: i64,
        sigma: f64,
        vol_surprise: Option<bool>,
    ) -> Self {
        Self {
            id: None,
            window_id: window_id.into(),
            symbol: symbol.into(),
            predicted_p_up,
            bucket: bucket_label(predicted_p_up).to_string(),
            oracle_price,
            strike,
            t_ms,
            sigma,
            vol_surprise,
            actual_outcome: None,
            correct: None,
            settled_at: None,
        }
    }

    /// `correct = (p_up>=0.5) == (outcome == "up")`.
    pub fn record_outcome(&mut self, outcome: &str) {
        let predicted_up = self.predicted_p_up >= 0.5;
        let actual_up = outcome == "up";
        self.correct = Some(predicted_up == actual_up);
        self.actual_outcome = Some(outcome.to_string());
        self.settled_at = Some(Utc::now());
    }
}

/// Per-symbol rolling volatility cache.
#[derive(Debug, Clone, Copy)]
pub struct VolCacheEntry {
    pub sigma: f64,
    pub last_calculated_at: DateTime<Utc>,
    pub lookback_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_sanity_when_crossed_is_false_for_normal_book() {
        let mut book = OrderBook::new("tok".into());
        book.replace_snapshot(
            vec![PriceLevel { price: 0.50, size: 10.0 }],
            vec![PriceLevel { price: 0.51, size: 8.0 }],
            Utc::now(),
        );
        assert!(!book.is_crossed());
        assert!(book.best_bid().unwrap() < book.best_ask().unwrap());
    }

    #[test]
    fn snapshot_then_delta_roundtrip() {
        let mut book = OrderBook::new("tok".into());
        book.replace_snapshot(
            vec![
                PriceLevel { price: 0.50, size: 10.0 },
                PriceLevel { price: 0.49, size: 5.0 },
            ],
            vec![
                PriceLevel { price: 0.51, size: 8.0 },
                PriceLevel { price: 0.52, size: 4.0 },
            ],
            Utc::now(),
        );
        book.apply_delta(BookSide::Ask, 0.51, 0.0, Utc::now());
        assert_eq!(book.best_ask(), Some(0.52));
        assert_eq!(book.mid(), Some(0.505));
        assert!((book.spread().unwrap() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn delta_upsert_and_delete() {
        let mut book = OrderBook::new("tok".into());
        book.apply_delta(BookSide::Bid, 0.5, 10.0, Utc::now());
        assert_eq!(book.best_bid(), Some(0.5));
        book.apply_delta(BookSide::Bid, 0.5, 0.0, Utc::now());
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn bucket_boundaries() {
        assert_eq!(bucket_label(0.1), "10-20%");
        assert_eq!(bucket_label(0.9), "90-100%");
        assert_eq!(bucket_label(1.0), "90-100%");
        assert_eq!(bucket_label(-0.1), "0-10%");
        assert_eq!(bucket_label(1.1), "90-100%");
    }

    #[test]
    fn position_peak_price_monotone_for_up() {
        let mut pos = Position::new("w", "s", "tok", Side::Up, 10.0, 0.5, true);
        pos.update_current_price(0.6);
        pos.update_current_price(0.55);
        assert_eq!(pos.peak_price, 0.6);
    }

    #[test]
    fn prediction_correctness() {
        let mut pred =
            ProbabilityPrediction::new("w", "btc", 0.7, 95_000.0, 94_500.0, 300_000, 0.5, None);
        pred.record_outcome("up");
        assert_eq!(pred.correct, Some(true));
    }
}
