//! Window Scheduler: derives per-asset 15-minute epochs on a canonical
//! half-open `[epoch, epoch+W)` boundary and fires per-window
//! lifecycle timers (latency probe, signal-evaluation offsets,
//! settlement).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::models::{OpenPrices, TokenId, Window};

pub const WINDOW_DURATION_SECS: i64 = 15 * 60;

/// `epoch = floor(nowSec/900)*900`.
pub fn current_epoch(now_sec: i64) -> i64 {
    (now_sec.div_euclid(WINDOW_DURATION_SECS)) * WINDOW_DURATION_SECS
}

/// Parse a strike price out of a market question, e.g. `"Will BTC be
/// above $94,500 at 12:15 UTC?"` -> `94500.0`, preserving decimals and
/// stripping group separators.
pub fn parse_strike(question: &str) -> Option<f64> {
    let dollar_idx = question.find('$')?;
    let rest = &question[dollar_idx + 1..];
    let mut out = String::new();
    for c in rest.chars() {
        if c.is_ascii_digit() || c == '.' {
            out.push(c);
        } else if c == ',' {
            continue;
        } else {
            break;
        }
    }
    if out.is_empty() {
        return None;
    }
    out.parse::<f64>().ok()
}

/// Resolves UP/DOWN token ids and strike for a symbol's current window.
/// The concrete market-metadata REST call is an external collaborator;
/// this trait is the seam implementations plug into.
#[async_trait::async_trait]
pub trait MarketMetadataSource: Send + Sync {
    async fn resolve_window_market(
        &self,
        symbol: &str,
        epoch: i64,
    ) -> anyhow::Result<WindowMarketMeta>;
}

#[derive(Debug, Clone)]
pub struct WindowMarketMeta {
    pub up_token_id: TokenId,
    pub down_token_id: Option<TokenId>,
    pub question: String,
}

#[derive(Debug, Clone, Copy)]
pub struct WindowSchedulerConfig {
    pub scan_interval_secs: u64,
    pub latency_probe_ms_before_close: i64,
    pub signal_offsets_secs: [i64; 5],
    pub settlement_delay_ms: i64,
    pub settlement_retry_delay_secs: u64,
}

impl Default for WindowSchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 10,
            latency_probe_ms_before_close: 2_000,
            signal_offsets_secs: [120, 90, 60, 30, 10],
            settlement_delay_ms: 5_000,
            settlement_retry_delay_secs: 30,
        }
    }
}

/// Timer handles for one window so shutdown can cancel them all.
struct WindowTimers {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for WindowTimers {
    fn drop(&mut self) {
        for h in &self.handles {
            h.abort();
        }
    }
}

/// Callbacks the execution loop/paper trader register with the scheduler,
/// invoked at each timer offset below.
#[async_trait::async_trait]
pub trait WindowLifecycleHandler: Send + Sync {
    async fn on_latency_probe(&self, window_id: &str);
    async fn on_signal_offset(&self, window_id: &str, offset_secs: i64);
    /// Returns `true` if settlement succeeded (a resolution was found and
    /// trades closed); `false` triggers the single 30s retry, after which
    /// the scheduler gives up and cleans up regardless.
    async fn on_settlement(&self, window_id: &str) -> bool;
}

pub struct WindowScheduler {
    config: WindowSchedulerConfig,
    windows: RwLock<HashMap<String, Window>>,
    timers: RwLock<HashMap<String, WindowTimers>>,
}

impl WindowScheduler {
    pub fn new(config: WindowSchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            windows: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
        })
    }

    pub fn is_tracked(&self, window_id: &str) -> bool {
        self.windows.read().contains_key(window_id)
    }

    pub fn get(&self, window_id: &str) -> Option<Window> {
        self.windows.read().get(window_id).cloned()
    }

    pub fn active_windows(&self) -> Vec<Window> {
        self.windows.read().values().cloned().collect()
    }

    /// Materialise a window exactly once (idempotent keyed by
    /// `windowId`). Returns `false` if the window already exists.
    pub async fn materialize(
        self: &Arc<Self>,
        symbol: &str,
        now_sec: i64,
        meta_source: &dyn MarketMetadataSource,
        open_prices: OpenPrices,
        handler: Arc<dyn WindowLifecycleHandler>,
    ) -> anyhow::Result<bool> {
        let epoch = current_epoch(now_sec);
        let window_id = Window::window_id_for(symbol, epoch);
        if self.is_tracked(&window_id) {
            return Ok(false);
        }

        let meta = meta_source.resolve_window_market(symbol, epoch).await?;
        let strike = parse_strike(&meta.question);

        let window = Window {
            window_id: window_id.clone(),
            symbol: symbol.to_string(),
            epoch,
            close_time_ms: (epoch + WINDOW_DURATION_SECS) * 1000,
            reference_price: strike,
            up_token_id: meta.up_token_id,
            down_token_id: meta.down_token_id,
            open_prices,
            created_at: Utc::now(),
            settled: false,
        };

        self.windows.write().insert(window_id.clone(), window.clone());
        self.schedule_timers(window, handler);
        info!(window_id, epoch, "window materialized");
        Ok(true)
    }

    fn schedule_timers(self: &Arc<Self>, window: Window, handler: Arc<dyn WindowLifecycleHandler>) {
        let now_ms = Utc::now().timestamp_millis();
        let mut handles = Vec::new();

        // Latency probe.
        {
            let window_id = window.window_id.clone();
            let handler = handler.clone();
            let delay_ms =
                (window.close_time_ms - self.config.latency_probe_ms_before_close - now_ms).max(0);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms as u64)).await;
                handler.on_latency_probe(&window_id).await;
            }));
        }

        // Signal evaluation offsets.
        for offset in self.config.signal_offsets_secs {
            let window_id = window.window_id.clone();
            let handler = handler.clone();
            let delay_ms = (window.close_time_ms - offset * 1000 - now_ms).max(0);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms as u64)).await;
                handler.on_signal_offset(&window_id, offset).await;
            }));
        }

        // Settlement, with a single retry after 30s.
        {
            let window_id = window.window_id.clone();
            let handler = handler.clone();
            let this = self.clone();
            let delay_ms = (window.close_time_ms + self.config.settlement_delay_ms - now_ms).max(0);
            let retry_delay = self.config.settlement_retry_delay_secs;
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms as u64)).await;
                if handler.on_settlement(&window_id).await {
                    this.mark_settled(&window_id);
                    this.cleanup(&window_id);
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_secs(retry_delay)).await;
                if handler.on_settlement(&window_id).await {
                    this.mark_settled(&window_id);
                } else {
                    warn!(window_id, "settlement retry exhausted, giving up");
                }
                this.cleanup(&window_id);
            }));
        }

        self.timers
            .write()
            .insert(window.window_id.clone(), WindowTimers { handles });
    }

    fn mark_settled(&self, window_id: &str) {
        if let Some(w) = self.windows.write().get_mut(window_id) {
            w.settled = true;
        }
    }

    /// Cancels all pending timers for a window and removes it from
    /// tracking.
    pub fn cleanup(&self, window_id: &str) {
        self.timers.write().remove(window_id);
        self.windows.write().remove(window_id);
    }

    /// Cancels every pending timer across every window (shutdown path).
    pub fn cleanup_all(&self) {
        self.timers.write().clear();
        self.windows.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn epoch_floors_to_900_seconds() {
        assert_eq!(current_epoch(905), 900);
        assert_eq!(current_epoch(899), 0);
        assert_eq!(current_epoch(1800), 1800);
    }

    #[test]
    fn window_id_format() {
        assert_eq!(Window::window_id_for("btc", 900), "btc-15m-900");
    }

    #[test]
    fn strike_parsing_handles_commas_and_decimals() {
        assert_eq!(
            parse_strike("Will BTC be above $94,500 at 12:15 UTC?"),
            Some(94_500.0)
        );
        assert_eq!(
            parse_strike("Will ETH be above $3,250.50 at 12:00 UTC?"),
            Some(3_250.50)
        );
    }

    #[test]
    fn strike_parsing_none_without_dollar_sign() {
        assert_eq!(parse_strike("no strike here"), None);
    }

    struct FakeMetaSource;
    #[async_trait::async_trait]
    impl MarketMetadataSource for FakeMetaSource {
        async fn resolve_window_market(
            &self,
            symbol: &str,
            _epoch: i64,
        ) -> anyhow::Result<WindowMarketMeta> {
            Ok(WindowMarketMeta {
                up_token_id: format!("{symbol}-up"),
                down_token_id: Some(format!("{symbol}-down")),
                question: "Will BTC be above $94,500 at 12:15 UTC?".to_string(),
            })
        }
    }

    struct CountingHandler {
        settlement_calls: AtomicUsize,
    }
    #[async_trait::async_trait]
    impl WindowLifecycleHandler for CountingHandler {
        async fn on_latency_probe(&self, _window_id: &str) {}
        async fn on_signal_offset(&self, _window_id: &str, _offset_secs: i64) {}
        async fn on_settlement(&self, _window_id: &str) -> bool {
            self.settlement_calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn materialize_is_idempotent_per_window_id() {
        let scheduler = WindowScheduler::new(WindowSchedulerConfig::default());
        let meta = FakeMetaSource;
        let handler = Arc::new(CountingHandler {
            settlement_calls: AtomicUsize::new(0),
        });
        let now = Utc::now().timestamp();

        let created = scheduler
            .materialize("btc", now, &meta, OpenPrices::default(), handler.clone())
            .await
            .unwrap();
        assert!(created);

        let created_again = scheduler
            .materialize("btc", now, &meta, OpenPrices::default(), handler)
            .await
            .unwrap();
        assert!(!created_again);

        assert_eq!(scheduler.active_windows().len(), 1);
        scheduler.cleanup_all();
        assert_eq!(scheduler.active_windows().len(), 0);
    }

    #[test]
    fn reference_price_parsed_into_window() {
        // Directly exercises the strike parse path used by materialize.
        assert_eq!(
            parse_strike("Will BTC be above $94,500 at 12:15 UTC?"),
            Some(94_500.0)
        );
    }
}
