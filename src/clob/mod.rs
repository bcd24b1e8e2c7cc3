//! CLOB Book Client: a single persistent WebSocket reconstructing
//! per-token L2 order books from `book` snapshots and `price_change`
//! deltas, with copy-on-write per-token storage, crossed-book
//! rejection, exponential-backoff reconnect, subscription management,
//! and a staleness monitor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::models::{BookSide, BookSnapshot, OrderBook, TokenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct BookClientConfig {
    pub ws_url: String,
    pub connection_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub ping_interval_ms: u64,
    pub stale_threshold_ms: i64,
    pub stale_warning_interval_ms: i64,
    pub max_message_size_bytes: usize,
}

impl Default for BookClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            connection_timeout_ms: 10_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            ping_interval_ms: 5_000,
            stale_threshold_ms: 5_000,
            stale_warning_interval_ms: 30_000,
            max_message_size_bytes: 1_000_000,
        }
    }
}

impl BookClientConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            ws_url: std::env::var("CLOB_WS_URL").unwrap_or(default.ws_url),
            connection_timeout_ms: crate::config::env_or(
                "CLOB_CONNECT_TIMEOUT_MS",
                default.connection_timeout_ms,
            ),
            reconnect_base_ms: crate::config::env_or(
                "CLOB_RECONNECT_BASE_MS",
                default.reconnect_base_ms,
            ),
            reconnect_max_ms: crate::config::env_or(
                "CLOB_RECONNECT_MAX_MS",
                default.reconnect_max_ms,
            ),
            ping_interval_ms: crate::config::env_or(
                "CLOB_PING_INTERVAL_MS",
                default.ping_interval_ms,
            ),
            stale_threshold_ms: crate::config::env_or(
                "CLOB_STALE_THRESHOLD_MS",
                default.stale_threshold_ms,
            ),
            stale_warning_interval_ms: crate::config::env_or(
                "CLOB_STALE_WARNING_INTERVAL_MS",
                default.stale_warning_interval_ms,
            ),
            max_message_size_bytes: crate::config::env_or(
                "CLOB_MAX_MESSAGE_SIZE_BYTES",
                default.max_message_size_bytes,
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct WireChange {
    price: String,
    side: String,
    size: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event_type")]
#[serde(rename_all = "snake_case")]
enum WireEvent {
    Book {
        asset_id: String,
        #[serde(default)]
        bids: Vec<WireLevel>,
        #[serde(default)]
        asks: Vec<WireLevel>,
    },
    PriceChange {
        asset_id: String,
        changes: Vec<WireChange>,
    },
    LastTradePrice {
        asset_id: String,
        price: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    assets_ids: &'a [String],
}

fn parse_decimal(s: &str) -> Option<f64> {
    s.parse::<f64>().ok()
}

/// Per-token metadata outside the book itself: symbol label and staleness
/// bookkeeping.
struct TokenEntry {
    symbol_label: String,
    last_stale_warning_at: Mutex<Option<std::time::Instant>>,
}

#[derive(Default)]
pub struct BookClientMetrics {
    pub parse_errors: AtomicU64,
    pub oversize_dropped: AtomicU64,
    pub reconnects: AtomicU64,
    pub messages_received: AtomicU64,
}

/// Live L2 book state per subscribed token, read-mostly (copy-on-write at
/// the per-token granularity via `ArcSwap`).
pub struct BookStore {
    config: BookClientConfig,
    books: RwLock<HashMap<TokenId, Arc<ArcSwap<OrderBook>>>>,
    tokens: RwLock<HashMap<TokenId, Arc<TokenEntry>>>,
    state: Mutex<ConnectionState>,
    updates_tx: broadcast::Sender<TokenId>,
    metrics: Arc<BookClientMetrics>,
    parse_error_count: AtomicUsize,
    outbound_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<OutboundMsg>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

enum OutboundMsg {
    Subscribe(Vec<String>),
    Close,
}

impl BookStore {
    pub fn new(config: BookClientConfig) -> Arc<Self> {
        let (updates_tx, _rx) = broadcast::channel(4096);
        Arc::new(Self {
            config,
            books: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            state: Mutex::new(ConnectionState::Disconnected),
            updates_tx,
            metrics: Arc::new(BookClientMetrics::default()),
            parse_error_count: AtomicUsize::new(0),
            outbound_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn metrics(&self) -> Arc<BookClientMetrics> {
        self.metrics.clone()
    }

    /// `subscribe(tokenId, symbolLabel)`. Adds the token to the live
    /// subscription set and resends the full set if connected.
    pub async fn subscribe(self: &Arc<Self>, token_id: TokenId, symbol_label: String) {
        {
            let mut tokens = self.tokens.write().await;
            tokens.insert(
                token_id.clone(),
                Arc::new(TokenEntry {
                    symbol_label,
                    last_stale_warning_at: Mutex::new(None),
                }),
            );
        }
        {
            let mut books = self.books.write().await;
            books
                .entry(token_id)
                .or_insert_with(|| Arc::new(ArcSwap::from_pointee(OrderBook::default())));
        }
        self.resend_subscription_if_connected().await;
    }

    pub async fn unsubscribe(&self, token_id: &str) {
        self.tokens.write().await.remove(token_id);
        self.books.write().await.remove(token_id);
        self.resend_subscription_if_connected().await;
    }

    async fn current_token_ids(&self) -> Vec<String> {
        self.tokens.read().await.keys().cloned().collect()
    }

    async fn resend_subscription_if_connected(&self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let ids = self.current_token_ids().await;
        if let Some(tx) = self.outbound_tx.lock().as_ref() {
            let _ = tx.send(OutboundMsg::Subscribe(ids));
        }
    }

    /// `getBook(tokenId) -> ordered sides | null`.
    pub async fn get_book(&self, token_id: &str) -> Option<(Vec<crate::models::PriceLevel>, Vec<crate::models::PriceLevel>)> {
        let books = self.books.read().await;
        let swap = books.get(token_id)?;
        let book = swap.load();
        Some((book.bids(), book.asks()))
    }

    /// `getBookSnapshot(tokenId) -> snapshot | null`.
    pub async fn get_book_snapshot(&self, token_id: &str) -> Option<BookSnapshot> {
        let books = self.books.read().await;
        let swap = books.get(token_id)?;
        Some(BookSnapshot::from(swap.load().as_ref()))
    }

    /// `subscribeUpdates(tokenId, listener) -> cancel`. Modeled as a
    /// broadcast receiver filtered by the caller; returning the raw
    /// receiver lets the caller manage its own "cancel" by dropping it.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<TokenId> {
        self.updates_tx.subscribe()
    }

    /// `getState()`: connection state plus per-token book presence.
    pub async fn get_state(&self) -> ClobClientState {
        let books = self.books.read().await;
        ClobClientState {
            connection_state: self.state(),
            subscribed_tokens: books.keys().cloned().collect(),
            parse_errors: self.metrics.parse_errors.load(Ordering::Relaxed),
            reconnects: self.metrics.reconnects.load(Ordering::Relaxed),
        }
    }

    async fn book_swap_for(&self, token_id: &str) -> Option<Arc<ArcSwap<OrderBook>>> {
        self.books.read().await.get(token_id).cloned()
    }

    async fn apply_book_snapshot(
        &self,
        token_id: &str,
        bids: Vec<crate::models::PriceLevel>,
        asks: Vec<crate::models::PriceLevel>,
    ) {
        let Some(swap) = self.book_swap_for(token_id).await else {
            return;
        };
        let now = Utc::now();
        let mut new_book = (**swap.load()).clone();
        new_book.replace_snapshot(bids, asks, now);
        if new_book.is_crossed() {
            warn!(token_id, "rejecting crossed book snapshot");
            return;
        }
        swap.store(Arc::new(new_book));
        let _ = self.updates_tx.send(token_id.to_string());
    }

    async fn apply_price_change(&self, token_id: &str, side: BookSide, price: f64, size: f64) {
        let Some(swap) = self.book_swap_for(token_id).await else {
            return;
        };
        let now = Utc::now();
        let mut new_book = (**swap.load()).clone();
        new_book.apply_delta(side, price, size, now);
        if new_book.is_crossed() {
            warn!(token_id, price, size, "price_change produced a crossed book; dropping");
            return;
        }
        swap.store(Arc::new(new_book));
        let _ = self.updates_tx.send(token_id.to_string());
    }

    async fn apply_last_trade_price(&self, token_id: &str, price: f64) {
        let Some(swap) = self.book_swap_for(token_id).await else {
            return;
        };
        let now = Utc::now();
        let mut new_book = (**swap.load()).clone();
        new_book.set_last_trade_price(price, now);
        swap.store(Arc::new(new_book));
    }

    fn handle_parse_error(&self, context: &str) {
        let n = self.parse_error_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
        if n <= 5 || n % 100 == 0 {
            warn!(context, count = n, "CLOB message parse error");
        }
    }

    async fn handle_text_message(&self, text: &str) {
        if text.len() > self.config.max_message_size_bytes {
            self.metrics.oversize_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.metrics.messages_received.fetch_add(1, Ordering::Relaxed);

        let event: WireEvent = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(_) => {
                self.handle_parse_error("deserialize");
                return;
            }
        };

        match event {
            WireEvent::Book { asset_id, bids, asks } => {
                let bids: Vec<_> = bids
                    .iter()
                    .filter_map(|l| {
                        Some(crate::models::PriceLevel {
                            price: parse_decimal(&l.price)?,
                            size: parse_decimal(&l.size)?,
                        })
                    })
                    .filter(|l| l.size > 0.0)
                    .collect();
                let asks: Vec<_> = asks
                    .iter()
                    .filter_map(|l| {
                        Some(crate::models::PriceLevel {
                            price: parse_decimal(&l.price)?,
                            size: parse_decimal(&l.size)?,
                        })
                    })
                    .filter(|l| l.size > 0.0)
                    .collect();
                self.apply_book_snapshot(&asset_id, bids, asks).await;
            }
            WireEvent::PriceChange { asset_id, changes } => {
                for change in changes {
                    let (Some(price), Some(size)) =
                        (parse_decimal(&change.price), parse_decimal(&change.size))
                    else {
                        self.handle_parse_error("price_change level");
                        continue;
                    };
                    let side = if change.side.eq_ignore_ascii_case("BUY") {
                        BookSide::Bid
                    } else {
                        BookSide::Ask
                    };
                    self.apply_price_change(&asset_id, side, price, size).await;
                }
            }
            WireEvent::LastTradePrice { asset_id, price } => {
                if let Some(price) = parse_decimal(&price) {
                    self.apply_last_trade_price(&asset_id, price).await;
                } else {
                    self.handle_parse_error("last_trade_price");
                }
            }
            WireEvent::Other => {}
        }
    }

    /// Spawns the connect/read/reconnect loop plus a staleness-monitor
    /// timer. Returns immediately; the loop runs until `shutdown()`.
    pub fn spawn(self: &Arc<Self>) {
        let this = self.clone();
        let run_handle = tokio::spawn(async move {
            this.run().await;
        });
        let this = self.clone();
        let staleness_handle = tokio::spawn(async move {
            this.run_staleness_monitor().await;
        });
        self.tasks.lock().extend([run_handle, staleness_handle]);
    }

    /// Cancels the reconnect loop and staleness monitor, closes the live
    /// connection with code 1000 if one is open, and clears every
    /// tracked book and subscription.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.outbound_tx.lock().as_ref() {
            let _ = tx.send(OutboundMsg::Close);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.books.write().await.clear();
        self.tokens.write().await.clear();
        *self.state.lock() = ConnectionState::Disconnected;
    }

    async fn run(self: Arc<Self>) {
        let mut backoff_ms = self.config.reconnect_base_ms;
        loop {
            *self.state.lock() = ConnectionState::Connecting;
            match self.connect_and_stream().await {
                Ok(()) => {
                    backoff_ms = self.config.reconnect_base_ms;
                }
                Err(e) => {
                    warn!(error = %e, "CLOB websocket connection ended");
                }
            }
            *self.state.lock() = ConnectionState::Reconnecting;
            self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(self.config.reconnect_max_ms);
        }
    }

    async fn connect_and_stream(self: &Arc<Self>) -> anyhow::Result<()> {
        let connect_fut = tokio_tungstenite::connect_async(&self.config.ws_url);
        let (ws_stream, _) = tokio::time::timeout(
            Duration::from_millis(self.config.connection_timeout_ms),
            connect_fut,
        )
        .await??;
        *self.state.lock() = ConnectionState::Connected;
        info!("CLOB websocket connected");

        let (mut write, mut read) = ws_stream.split();

        let ids = self.current_token_ids().await;
        let frame = SubscribeFrame {
            kind: "market",
            assets_ids: &ids,
        };
        write
            .send(Message::Text(serde_json::to_string(&frame)?))
            .await?;

        let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<OutboundMsg>();
        *self.outbound_tx.lock() = Some(outbound_tx);

        let ping_interval = Duration::from_millis(self.config.ping_interval_ms);
        let mut ping_timer = tokio::time::interval(ping_interval);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text_message(&text).await,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "CLOB websocket read error");
                            break;
                        }
                    }
                }
                Some(msg) = outbound_rx.recv() => {
                    match msg {
                        OutboundMsg::Subscribe(ids) => {
                            let frame = SubscribeFrame { kind: "market", assets_ids: &ids };
                            if let Ok(text) = serde_json::to_string(&frame) {
                                let _ = write.send(Message::Text(text)).await;
                            }
                        }
                        OutboundMsg::Close => {
                            let _ = write
                                .send(Message::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                                    code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                                    reason: "shutdown".into(),
                                })))
                                .await;
                            break;
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    let _ = write.send(Message::Ping(Vec::new())).await;
                }
            }
        }

        *self.outbound_tx.lock() = None;
        Ok(())
    }

    async fn run_staleness_monitor(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let now = Utc::now();
            let books = self.books.read().await;
            let tokens = self.tokens.read().await;
            for (token_id, swap) in books.iter() {
                let Some(last_update) = swap.load().last_update_at else {
                    continue;
                };
                let age_ms = (now - last_update).num_milliseconds();
                if age_ms <= self.config.stale_threshold_ms {
                    continue;
                }
                let Some(entry) = tokens.get(token_id) else {
                    continue;
                };
                let mut last_warn = entry.last_stale_warning_at.lock();
                let should_warn = last_warn
                    .map(|t| t.elapsed() >= Duration::from_millis(self.config.stale_warning_interval_ms as u64))
                    .unwrap_or(true);
                if should_warn {
                    warn!(token_id, age_ms, symbol = %entry.symbol_label, "stale CLOB book");
                    *last_warn = Some(std::time::Instant::now());
                }
            }
        }
    }

    /// Forcibly feed a raw text message, used by tests to avoid a live
    /// websocket connection.
    #[cfg(test)]
    pub async fn ingest_for_test(&self, text: &str) {
        self.handle_text_message(text).await;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClobClientState {
    pub connection_state: ConnectionState,
    pub subscribed_tokens: Vec<TokenId>,
    pub parse_errors: u64,
    pub reconnects: u64,
}

impl Serialize for ConnectionState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        serializer.serialize_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn book_snapshot_then_delta_reflects_in_subsequent_reads() {
        let store = BookStore::new(BookClientConfig::default());
        store.subscribe("tok".to_string(), "btc".to_string()).await;

        store
            .ingest_for_test(
                r#"{"event_type":"book","asset_id":"tok","bids":[{"price":"0.50","size":"10"},{"price":"0.49","size":"5"}],"asks":[{"price":"0.51","size":"8"},{"price":"0.52","size":"4"}]}"#,
            )
            .await;

        store
            .ingest_for_test(
                r#"{"event_type":"price_change","asset_id":"tok","changes":[{"price":"0.51","side":"SELL","size":"0"}]}"#,
            )
            .await;

        let snapshot = store.get_book_snapshot("tok").await.unwrap();
        assert_eq!(snapshot.best_ask, Some(0.52));
        assert_eq!(snapshot.mid, Some(0.51));
        assert!((snapshot.spread.unwrap() - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn price_change_buy_side_upserts_bid() {
        let store = BookStore::new(BookClientConfig::default());
        store.subscribe("tok".to_string(), "btc".to_string()).await;
        store
            .ingest_for_test(
                r#"{"event_type":"price_change","asset_id":"tok","changes":[{"price":"0.40","side":"BUY","size":"12"}]}"#,
            )
            .await;
        let snapshot = store.get_book_snapshot("tok").await.unwrap();
        assert_eq!(snapshot.best_bid, Some(0.40));
    }

    #[tokio::test]
    async fn unknown_event_type_is_ignored() {
        let store = BookStore::new(BookClientConfig::default());
        store.subscribe("tok".to_string(), "btc".to_string()).await;
        store
            .ingest_for_test(r#"{"event_type":"tick_size_change","asset_id":"tok"}"#)
            .await;
        let snapshot = store.get_book_snapshot("tok").await.unwrap();
        assert!(snapshot.bids.is_empty());
    }

    #[tokio::test]
    async fn last_trade_price_updates_without_touching_book() {
        let store = BookStore::new(BookClientConfig::default());
        store.subscribe("tok".to_string(), "btc".to_string()).await;
        store
            .ingest_for_test(
                r#"{"event_type":"book","asset_id":"tok","bids":[{"price":"0.5","size":"1"}],"asks":[{"price":"0.51","size":"1"}]}"#,
            )
            .await;
        store
            .ingest_for_test(r#"{"event_type":"last_trade_price","asset_id":"tok","price":"0.505"}"#)
            .await;
        let snapshot = store.get_book_snapshot("tok").await.unwrap();
        assert_eq!(snapshot.last_trade_price, Some(0.505));
        assert_eq!(snapshot.best_bid, Some(0.5));
    }

    #[tokio::test]
    async fn crossed_book_is_rejected() {
        let store = BookStore::new(BookClientConfig::default());
        store.subscribe("tok".to_string(), "btc".to_string()).await;
        store
            .ingest_for_test(
                r#"{"event_type":"book","asset_id":"tok","bids":[{"price":"0.5","size":"1"}],"asks":[{"price":"0.51","size":"1"}]}"#,
            )
            .await;
        store
            .ingest_for_test(
                r#"{"event_type":"price_change","asset_id":"tok","changes":[{"price":"0.52","side":"BUY","size":"5"}]}"#,
            )
            .await;
        let snapshot = store.get_book_snapshot("tok").await.unwrap();
        // Crossed delta dropped; book keeps its prior, valid state.
        assert_eq!(snapshot.best_bid, Some(0.5));
    }

    #[tokio::test]
    async fn unsubscribed_token_has_no_book() {
        let store = BookStore::new(BookClientConfig::default());
        assert!(store.get_book_snapshot("ghost").await.is_none());
    }
}
