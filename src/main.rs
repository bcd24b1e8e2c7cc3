//! 15-minute binary-market trading engine: binary entry point.
//!
//! Wires configuration, persistence, the CLOB book client, price feeds,
//! the strategy composer, the execution loop, and the orchestrator
//! together, then drives a periodic tick against every active window
//! until `ctrl_c`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use windowtrader::circuit_breaker::CircuitBreaker;
use windowtrader::clob::{BookClientConfig, BookStore};
use windowtrader::config::{Cli, LaunchManifest, RunMode, StrategyDocument};
use windowtrader::error::PlaceOrderError;
use windowtrader::execution::{
    ExecutionAdapter, LiveExecutionAdapter, LiveOrderClient, OrderAck, OrderRequest,
    PaperExecutionAdapter,
};
use windowtrader::execution_loop::{ExecutionLoop, ExecutionLoopConfig};
use windowtrader::feeds::CompositeFeed;
use windowtrader::models::{MarketContext, OpenPrices, Window};
use windowtrader::orchestrator::{ManagedComponent, Orchestrator, OrchestratorConfig};
use windowtrader::persistence::Persistence;
use windowtrader::positions::PositionBook;
use windowtrader::probability::{VolatilityConfig, VolatilityTracker};
use windowtrader::safeguards::Safeguards;
use windowtrader::strategy::probability::{BlackScholesConfig, BlackScholesProbabilityComponent};
use windowtrader::strategy::sizing::{KellyParams, KellySizingComponent};
use windowtrader::strategy::{compose_strategy, ComponentRegistry, ComposedStrategy, WindowContext};
use windowtrader::tick_recorder::{TickRecorder, TickRow, TICKS_SCHEMA};
use windowtrader::window::{
    current_epoch, MarketMetadataSource, WindowLifecycleHandler, WindowMarketMeta, WindowScheduler,
    WindowSchedulerConfig,
};

const DEFAULT_SYMBOLS: &str = "btc";
const PAPER_FEE_RATE: f64 = 1.0;
const TICK_FLUSH_INTERVAL_SECS: u64 = 10;
const OPEN_PRICE_MAX_SKEW_MS: i64 = 5_000;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_with_dotenv();
    init_tracing();

    info!(mode = ?cli.mode, "windowtrader starting");

    let symbols: Vec<String> = std::env::var("WINDOWTRADER_SYMBOLS")
        .unwrap_or_else(|_| DEFAULT_SYMBOLS.to_string())
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

    let manifest = match LaunchManifest::load(&cli.config_dir.join("manifest.toml")) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "launch manifest not found or invalid, using defaults");
            LaunchManifest::default()
        }
    };
    let documents = StrategyDocument::load_dir(&cli.config_dir.join("strategies"));
    if documents.is_empty() {
        warn!("no strategy documents loaded; engine will run with no active strategies");
    }

    let persistence =
        Arc::new(Persistence::open(&cli.database_path).context("opening persistence layer")?);
    persistence.exec(
        "CREATE TABLE IF NOT EXISTS positions (id TEXT PRIMARY KEY, window_id TEXT, strategy_id TEXT, pnl REAL, closed_at TEXT);",
    )?;
    persistence.exec(TICKS_SCHEMA)?;

    let breaker = Arc::new(CircuitBreaker::new());
    let positions = Arc::new(PositionBook::new());
    let safeguards = Arc::new(Safeguards::new(5));

    let books = BookStore::new(BookClientConfig::from_env());
    let window_scheduler_config = WindowSchedulerConfig::default();
    let scheduler = WindowScheduler::new(window_scheduler_config);
    let tick_recorder = Arc::new(TickRecorder::new());

    let volatility = Arc::new(VolatilityTracker::new(VolatilityConfig::default()));
    let spot_feed = Arc::new(CompositeFeed::new(ticker_symbol_map(&symbols)));

    let registry = Arc::new(ComponentRegistry::new());
    registry.register(Arc::new(BlackScholesProbabilityComponent::new(
        volatility.clone(),
        BlackScholesConfig::default(),
    )));
    registry.register(Arc::new(KellySizingComponent::new(KellyParams {
        bankroll: manifest.max_exposure_dollars,
        ..KellyParams::default()
    })));

    let mut strategies: Vec<ComposedStrategy> = Vec::new();
    for document in documents.into_iter() {
        if !manifest.allowed_strategies.contains(&document.name) {
            warn!(strategy = %document.name, "strategy not in launch manifest's allowed list, skipping");
            continue;
        }
        match compose_strategy(&document, &registry) {
            Ok(composed) => strategies.push(composed),
            Err(errors) => warn!(strategy = %document.name, ?errors, "strategy failed to compose"),
        }
    }
    let strategies = Arc::new(strategies);

    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        cli.mode,
        manifest.clone(),
        breaker.clone(),
        positions.clone(),
        safeguards.clone(),
        cli.pid_file.clone(),
        cli.state_file.clone(),
    );

    let meta_source: Arc<dyn MarketMetadataSource> =
        Arc::new(SpotReferenceMetadataSource { spot_feed: spot_feed.clone() });

    orchestrator
        .register(Arc::new(BookStoreComponent { books: books.clone() }))
        .await;
    orchestrator
        .register(Arc::new(WindowScannerComponent {
            scheduler: scheduler.clone(),
            books: books.clone(),
            spot_feed: spot_feed.clone(),
            meta_source: meta_source.clone(),
            symbols: symbols.clone(),
            scan_interval_secs: window_scheduler_config.scan_interval_secs,
            task: AsyncMutex::new(None),
        }))
        .await;
    orchestrator
        .register(Arc::new(TickRecorderComponent {
            recorder: tick_recorder.clone(),
            books: books.clone(),
            persistence: persistence.clone(),
            tasks: AsyncMutex::new(Vec::new()),
        }))
        .await;

    orchestrator.start().await.context("orchestrator failed to start")?;

    for symbol in &symbols {
        spot_feed
            .poll(symbol)
            .await
            .map(|p| info!(symbol, price = p.mid, "initial spot price fetched"))
            .unwrap_or_else(|e| warn!(symbol, error = %e, "initial spot price fetch failed"));
    }

    let execution_config = ExecutionLoopConfig {
        entry_notional_usdc: manifest.position_size_dollars,
        ..ExecutionLoopConfig::default()
    };
    let sizing = KellySizingComponent::new(KellyParams {
        bankroll: manifest.max_exposure_dollars,
        ..KellyParams::default()
    });

    let executor: Box<dyn ExecutionAdapter> = match cli.mode {
        RunMode::Paper => Box::new(PaperExecutionAdapter::new(PAPER_FEE_RATE)),
        RunMode::Live => Box::new(LiveExecutionAdapter::new(UnconfiguredLiveClient)),
    };

    let exec_loop = Arc::new(ExecutionLoop::new(
        execution_config,
        breaker.clone(),
        safeguards.clone(),
        positions.clone(),
        books.clone(),
        scheduler.clone(),
        sizing,
        executor,
        manifest.max_exposure_dollars,
        cli.mode,
        volatility.clone(),
        PAPER_FEE_RATE,
    ));

    let tick_scheduler = scheduler.clone();
    let tick_books = books.clone();
    let tick_spot_feed = spot_feed.clone();
    let tick_symbols = symbols.clone();
    let tick_exec_loop = exec_loop.clone();
    let tick_strategies = strategies.clone();

    // Execution ticks run on their own 1-second cadence; window
    // materialization has its own cadence under `WindowScannerComponent`,
    // driven by `scan_interval_secs` rather than this loop.
    let tick_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;

            for symbol in &tick_symbols {
                if let Ok(point) = tick_spot_feed.poll(symbol).await {
                    debug!(symbol, mid = point.mid, "spot price polled");
                }
            }

            let contexts = build_window_contexts(&tick_scheduler, &tick_books, &tick_spot_feed).await;
            for strategy in tick_strategies.iter() {
                if let Some(report) = tick_exec_loop.tick(strategy, &contexts).await {
                    if report.entries_filled > 0 || report.exits > 0 || report.settlements > 0 {
                        info!(
                            strategy = %strategy.name,
                            entries_filled = report.entries_filled,
                            exits = report.exits,
                            settlements = report.settlements,
                            "tick report"
                        );
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    tick_task.abort();
    orchestrator.shutdown().await;

    Ok(())
}

/// Wraps [`BookStore`] as an orchestrator-managed component: `init`
/// starts its websocket loop, `shutdown` tears it down in place of the
/// old direct `books.spawn()` call at process start.
struct BookStoreComponent {
    books: Arc<BookStore>,
}

#[async_trait]
impl ManagedComponent for BookStoreComponent {
    fn name(&self) -> &str {
        "clob_book_store"
    }
    async fn init(&self) -> Result<()> {
        self.books.spawn();
        Ok(())
    }
    async fn shutdown(&self) -> Result<()> {
        self.books.shutdown().await;
        Ok(())
    }
}

/// Runs window materialization on its own `scan_interval_secs` cadence,
/// separate from the execution tick loop, and subscribes newly
/// materialized windows' tokens with the book store.
struct WindowScannerComponent {
    scheduler: Arc<WindowScheduler>,
    books: Arc<BookStore>,
    spot_feed: Arc<CompositeFeed>,
    meta_source: Arc<dyn MarketMetadataSource>,
    symbols: Vec<String>,
    scan_interval_secs: u64,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ManagedComponent for WindowScannerComponent {
    fn name(&self) -> &str {
        "window_scheduler"
    }
    async fn init(&self) -> Result<()> {
        let scheduler = self.scheduler.clone();
        let books = self.books.clone();
        let spot_feed = self.spot_feed.clone();
        let meta_source = self.meta_source.clone();
        let symbols = self.symbols.clone();
        let scan_interval_secs = self.scan_interval_secs;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(scan_interval_secs));
            loop {
                ticker.tick().await;
                for symbol in &symbols {
                    let now_sec = chrono::Utc::now().timestamp();
                    let epoch = current_epoch(now_sec);
                    let open_prices = OpenPrices {
                        composite: spot_feed
                            .near(symbol, epoch * 1000, OPEN_PRICE_MAX_SKEW_MS)
                            .map(|p| p.mid),
                        aggregator: None,
                        vwap20: None,
                    };
                    match scheduler
                        .materialize(
                            symbol,
                            now_sec,
                            meta_source.as_ref(),
                            open_prices,
                            Arc::new(NoopLifecycleHandler),
                        )
                        .await
                    {
                        Ok(true) => {
                            let window_id = Window::window_id_for(symbol, epoch);
                            if let Some(window) = scheduler.get(&window_id) {
                                books.subscribe(window.up_token_id.clone(), symbol.clone()).await;
                                if let Some(down) = window.down_token_id.clone() {
                                    books.subscribe(down, symbol.clone()).await;
                                }
                            }
                        }
                        Ok(false) => {}
                        Err(e) => warn!(symbol, error = %e, "window materialization failed"),
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }
    async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.scheduler.cleanup_all();
        Ok(())
    }
}

/// Subscribes a [`TickRecorder`] to every book update and flushes it to
/// persistence on a fixed cadence.
struct TickRecorderComponent {
    recorder: Arc<TickRecorder>,
    books: Arc<BookStore>,
    persistence: Arc<Persistence>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl ManagedComponent for TickRecorderComponent {
    fn name(&self) -> &str {
        "tick_recorder"
    }
    async fn init(&self) -> Result<()> {
        let recorder = self.recorder.clone();
        let books = self.books.clone();
        let mut updates = books.subscribe_updates();
        let record_handle = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(token_id) => {
                        if let Some(snapshot) = books.get_book_snapshot(&token_id).await {
                            recorder.record(TickRow::from_snapshot(&snapshot, chrono::Utc::now()));
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let recorder = self.recorder.clone();
        let persistence = self.persistence.clone();
        let flush_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(TICK_FLUSH_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                match recorder.flush(&persistence) {
                    Ok(0) => {}
                    Ok(n) => debug!(rows = n, "ticks flushed"),
                    Err(e) => warn!(error = %e, "tick flush failed"),
                }
            }
        });

        self.tasks.lock().await.extend([record_handle, flush_handle]);
        Ok(())
    }
    async fn shutdown(&self) -> Result<()> {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Err(e) = self.recorder.flush(&self.persistence) {
            warn!(error = %e, "final tick flush failed");
        }
        Ok(())
    }
}

fn ticker_symbol_map(symbols: &[String]) -> HashMap<String, String> {
    symbols
        .iter()
        .map(|s| (s.clone(), format!("{}USDT", s.to_uppercase())))
        .collect()
}

async fn build_window_contexts(
    scheduler: &Arc<WindowScheduler>,
    books: &Arc<BookStore>,
    spot_feed: &Arc<CompositeFeed>,
) -> Vec<WindowContext> {
    let mut contexts = Vec::new();
    for window in scheduler.active_windows() {
        let market_price = books
            .get_book(&window.up_token_id)
            .await
            .and_then(|(bids, asks)| match (bids.first(), asks.first()) {
                (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
                (Some(b), None) => Some(b.price),
                (None, Some(a)) => Some(a.price),
                (None, None) => None,
            });
        let oracle_price = spot_feed.latest(&window.symbol).map(|p| p.mid);
        let time_to_expiry_ms = window.time_remaining_ms(chrono::Utc::now().timestamp_millis());

        contexts.push(WindowContext {
            oracle_price,
            reference_price: window.reference_price,
            market_price,
            time_to_expiry_ms,
            symbol: window.symbol.clone(),
            window_id: window.window_id.clone(),
            token_id_up: window.up_token_id.clone(),
            token_id_down: window.down_token_id.clone(),
            market_context: MarketContext::default(),
        });
    }
    contexts
}

/// Stand-in market-metadata source used when no exchange market-discovery
/// client is configured: the strike is the symbol's current composite
/// spot price at window open, and token ids are derived deterministically
/// from the window id rather than looked up against a real market.
struct SpotReferenceMetadataSource {
    spot_feed: Arc<CompositeFeed>,
}

#[async_trait]
impl MarketMetadataSource for SpotReferenceMetadataSource {
    async fn resolve_window_market(&self, symbol: &str, epoch: i64) -> Result<WindowMarketMeta> {
        let strike = self
            .spot_feed
            .latest(symbol)
            .map(|p| p.mid)
            .context("no spot price observed yet for symbol")?;
        let window_id = Window::window_id_for(symbol, epoch);
        Ok(WindowMarketMeta {
            up_token_id: format!("{window_id}-up"),
            down_token_id: Some(format!("{window_id}-down")),
            question: format!("Will {symbol} be above ${strike} at window close?"),
        })
    }
}

struct NoopLifecycleHandler;

#[async_trait]
impl WindowLifecycleHandler for NoopLifecycleHandler {
    async fn on_latency_probe(&self, _window_id: &str) {}
    async fn on_signal_offset(&self, _window_id: &str, _offset_secs: i64) {}
    async fn on_settlement(&self, _window_id: &str) -> bool {
        false
    }
}

/// LIVE mode's `LiveOrderClient` seam with no concrete exchange REST
/// client plugged in; every order is rejected pre-submit rather than
/// silently pretending to trade. A real deployment replaces this with
/// an authenticated exchange client.
struct UnconfiguredLiveClient;

#[async_trait]
impl LiveOrderClient for UnconfiguredLiveClient {
    async fn submit(&self, req: &OrderRequest) -> Result<OrderAck, PlaceOrderError> {
        Err(PlaceOrderError::RejectedPreSubmit {
            reason: format!(
                "no LIVE exchange client configured; order {} not submitted",
                req.client_order_id
            ),
        })
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "windowtrader=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
