//! The per-tick execution pipeline: circuit-breaker gate, drawdown
//! check, window load, spot prices, signal evaluation, sizing and
//! entry (with the halt-on-uncertainty reservation rule), stale-order
//! sweep, position verification, stop-loss, take-profit/trailing, and
//! window-expiry resolution. Ticks are strictly serial — a tick that
//! is still running blocks the next one rather than overlapping it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::circuit_breaker::{CircuitBreaker, TripReason};
use crate::clob::BookStore;
use crate::config::RunMode;
use crate::error::{ErrorKind, OrderOutcome, PlaceOrderError};
use crate::execution::{reservation_action_for, ExecutionAdapter, OrderRequest, OrderSide, TimeInForce};
use crate::exits::{evaluate_stop_loss, evaluate_take_profit, evaluate_window_expiry, settlement_pnl, ExitConfig};
use crate::fill_sim;
use crate::models::{Position, Side};
use crate::positions::PositionBook;
use crate::probability::VolatilityTracker;
use crate::safeguards::Safeguards;
use crate::strategy::sizing::KellySizingComponent;
use crate::strategy::{execute_strategy, generate_edge_signals, ComposedStrategy, EdgeConfig, WindowContext};
use crate::window::WindowScheduler;

/// Signal-evaluation window: a window closer than this to expiry can't
/// reliably fill before settlement, and one further out than this has
/// too much residual time-decay uncertainty to size.
const MIN_SIGNAL_TIME_TO_EXPIRY_MS: i64 = 30_000;
const MAX_SIGNAL_TIME_TO_EXPIRY_MS: i64 = 600_000;

fn within_signal_window(time_to_expiry_ms: i64) -> bool {
    (MIN_SIGNAL_TIME_TO_EXPIRY_MS..=MAX_SIGNAL_TIME_TO_EXPIRY_MS).contains(&time_to_expiry_ms)
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutionLoopConfig {
    pub max_drawdown_pct: f64,
    pub max_entries_per_tick: u32,
    pub entry_notional_usdc: f64,
    pub exit_config: ExitConfig,
    pub edge_config: EdgeConfig,
}

impl Default for ExecutionLoopConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: 0.20,
            max_entries_per_tick: 5,
            entry_notional_usdc: 50.0,
            exit_config: ExitConfig::default(),
            edge_config: EdgeConfig::default(),
        }
    }
}

/// Ties the tick's collaborators together. Every reference is `Arc`'d:
/// the loop is driven by one tick task but the same state is read by
/// background timers and a status endpoint.
pub struct ExecutionLoop<E: ExecutionAdapter> {
    config: ExecutionLoopConfig,
    breaker: Arc<CircuitBreaker>,
    safeguards: Arc<Safeguards>,
    positions: Arc<PositionBook>,
    books: Arc<BookStore>,
    scheduler: Arc<WindowScheduler>,
    sizing: KellySizingComponent,
    executor: E,
    ticking: AtomicBool,
    starting_bankroll: f64,
    mode: RunMode,
    volatility: Arc<VolatilityTracker>,
    paper_fee_rate: f64,
}

#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub skipped_circuit_open: bool,
    pub skipped_drawdown: bool,
    pub entries_attempted: u32,
    pub entries_filled: u32,
    pub exits: u32,
    pub settlements: u32,
}

impl<E: ExecutionAdapter> ExecutionLoop<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutionLoopConfig,
        breaker: Arc<CircuitBreaker>,
        safeguards: Arc<Safeguards>,
        positions: Arc<PositionBook>,
        books: Arc<BookStore>,
        scheduler: Arc<WindowScheduler>,
        sizing: KellySizingComponent,
        executor: E,
        starting_bankroll: f64,
        mode: RunMode,
        volatility: Arc<VolatilityTracker>,
        paper_fee_rate: f64,
    ) -> Self {
        Self {
            config,
            breaker,
            safeguards,
            positions,
            books,
            scheduler,
            sizing,
            executor,
            ticking: AtomicBool::new(false),
            starting_bankroll,
            mode,
            volatility,
            paper_fee_rate,
        }
    }

    /// Runs one full tick. Returns `None` if a previous tick is still
    /// in flight (non-reentrancy guard), `Some(report)` otherwise.
    pub async fn tick(&self, strategy: &ComposedStrategy, contexts: &[WindowContext]) -> Option<TickReport> {
        if self.ticking.swap(true, Ordering::SeqCst) {
            warn!("tick skipped: previous tick still in flight");
            return None;
        }
        let report = self.run_tick(strategy, contexts).await;
        self.ticking.store(false, Ordering::SeqCst);
        Some(report)
    }

    async fn run_tick(&self, strategy: &ComposedStrategy, contexts: &[WindowContext]) -> TickReport {
        let mut report = TickReport::default();

        // Stage 1: circuit-breaker gate.
        if self.breaker.is_open() {
            report.skipped_circuit_open = true;
            return report;
        }

        // Stage 2: drawdown check.
        let realized = self.positions.total_realized_pnl();
        let drawdown_pct = if self.starting_bankroll > 0.0 {
            (-realized / self.starting_bankroll).max(0.0)
        } else {
            0.0
        };
        if drawdown_pct >= self.config.max_drawdown_pct {
            warn!(drawdown_pct, "max drawdown reached, skipping entries this tick");
            report.skipped_drawdown = true;
        }

        self.safeguards.reset_tick_entries();

        // Stages 3-7: window load, spot prices (carried on contexts),
        // window-timing filter, signal evaluation, sizing and entry.
        if !report.skipped_drawdown {
            for context in contexts {
                if !within_signal_window(context.time_to_expiry_ms) {
                    continue;
                }
                let surprise_active = self.volatility.is_surprise(&context.symbol, Utc::now());
                let results = execute_strategy(strategy, context);
                let signals = generate_edge_signals(
                    &strategy.name,
                    context,
                    &results,
                    &self.config.edge_config,
                    surprise_active,
                );
                for signal in signals {
                    report.entries_attempted += 1;
                    if self.try_enter(strategy, context, signal.model_probability, signal.market_price).await {
                        report.entries_filled += 1;
                    }
                }
            }
        }

        // Stage 8: stale-order sweep is LIVE-only and has no effect in
        // this pipeline, which only ever reserves then confirms/releases
        // synchronously within `try_enter`.

        // Stage 9: position verification against the book. A book-missing
        // trip means stop-loss/take-profit can't be evaluated safely this
        // tick, so the sweep below is skipped rather than acting blind.
        let stop_loss_blind = self.verify_positions().await;

        // Stages 10-11: stop-loss, take-profit/trailing.
        if stop_loss_blind {
            warn!("skipping stop-loss/take-profit sweep this tick: position verification is blind");
        } else {
            report.exits += self.sweep_price_exits().await;
        }

        // Stage 12: window-expiry resolution.
        report.settlements += self.sweep_window_expiry().await;

        report
    }

    async fn try_enter(
        &self,
        strategy: &ComposedStrategy,
        context: &WindowContext,
        model_probability: f64,
        market_price: f64,
    ) -> bool {
        if !self.safeguards.can_enter_position() {
            return false;
        }
        if self
            .positions
            .open_position_for_strategy_window(&context.window_id, &strategy.name)
            .is_some()
        {
            return false;
        }
        if !self.safeguards.reserve_entry(&context.window_id, &strategy.name) {
            return false;
        }

        let sizing = self.sizing.size_for(model_probability, market_price);
        if !sizing.should_trade {
            self.safeguards.release_entry(&context.window_id, &strategy.name);
            return false;
        }

        match self.mode {
            RunMode::Paper => {
                self.try_enter_paper(strategy, context, model_probability, sizing.position_size_usd).await
            }
            RunMode::Live => {
                self.try_enter_live(strategy, context, model_probability, sizing.position_size_usd).await
            }
        }
    }

    /// PAPER mode never talks to the network: reserve, simulate the fill
    /// against live book depth, confirm and open a virtual position if
    /// it filled, release otherwise. There is no "reached the exchange"
    /// uncertainty to halt on here, unlike LIVE.
    async fn try_enter_paper(
        &self,
        strategy: &ComposedStrategy,
        context: &WindowContext,
        model_probability: f64,
        notional_usdc: f64,
    ) -> bool {
        let Some((_bids, asks)) = self.books.get_book(&context.token_id_up).await else {
            self.safeguards.release_entry(&context.window_id, &strategy.name);
            return false;
        };
        let capped: Vec<_> = asks.into_iter().filter(|l| l.price <= model_probability).collect();
        let fill = fill_sim::simulate_fill(&capped, notional_usdc, self.paper_fee_rate);
        if !fill.success || fill.total_shares <= 0.0 {
            self.safeguards.release_entry(&context.window_id, &strategy.name);
            return false;
        }

        self.safeguards.confirm_entry(&context.window_id, &strategy.name);
        self.positions.open_position(Position::new(
            context.window_id.clone(),
            strategy.name.clone(),
            context.token_id_up.clone(),
            Side::Up,
            fill.total_shares,
            fill.vwap_price,
            true,
        ));
        true
    }

    async fn try_enter_live(
        &self,
        strategy: &ComposedStrategy,
        context: &WindowContext,
        model_probability: f64,
        notional_usdc: f64,
    ) -> bool {
        let req = OrderRequest {
            client_order_id: format!("{}-{}", context.window_id, strategy.name),
            token_id: context.token_id_up.clone(),
            side: OrderSide::Buy,
            max_price: model_probability,
            notional_usdc,
            tif: TimeInForce::Ioc,
        };

        let result = self.executor.place_order(req).await;
        let outcome = reservation_action_for(&result);
        self.resolve_reservation(&context.window_id, &strategy.name, outcome);

        match result {
            Ok(ack) if ack.filled_shares > 0.0 => {
                self.positions.open_position(Position::new(
                    context.window_id.clone(),
                    strategy.name.clone(),
                    context.token_id_up.clone(),
                    Side::Up,
                    ack.filled_shares,
                    ack.filled_price,
                    false,
                ));
                true
            }
            Ok(_) => false,
            Err(e) => {
                if matches!(e, PlaceOrderError::ExchangeError { .. }) {
                    self.breaker.trip(TripReason::PositionTrackingFailed);
                    error!(error = %e, "order may have reached the exchange with no confirmed fill; tripping breaker");
                }
                false
            }
        }
    }

    /// Applies the halt-on-uncertainty rule to the reservation state
    /// machine: only a provably-never-reached order releases its
    /// reservation; anything else stays confirmed until a human clears
    /// it, because releasing early risks a duplicate entry.
    fn resolve_reservation(&self, window_id: &str, strategy_id: &str, outcome: OrderOutcome) {
        if outcome.must_confirm() {
            self.safeguards.confirm_entry(window_id, strategy_id);
        } else {
            self.safeguards.release_entry(window_id, strategy_id);
        }
    }

    /// Refreshes every open position's current price from the book.
    /// Returns `true` if any position's book was missing, in which case
    /// the breaker has been tripped with [`TripReason::StopLossBlind`]
    /// and the caller must skip this tick's price-exit sweep.
    async fn verify_positions(&self) -> bool {
        let mut blind = false;
        for position in self.positions.open_positions() {
            match self.books.get_book(&position.token_id).await {
                Some((bids, _asks)) => {
                    if let Some(best_bid) = bids.first() {
                        self.positions.update_current_price(&position.token_id, best_bid.price);
                    }
                }
                None => {
                    warn!(token_id = %position.token_id, "no book for open position; cannot verify price");
                    self.breaker.trip(TripReason::StopLossBlind);
                    blind = true;
                }
            }
        }
        blind
    }

    async fn sweep_price_exits(&self) -> u32 {
        let mut closed = 0;
        for position in self.positions.open_positions() {
            let reason = evaluate_stop_loss(&position, &self.config.exit_config)
                .or_else(|| evaluate_take_profit(&position, &self.config.exit_config));
            if let Some(reason) = reason {
                let pnl = (position.current_price - position.entry_price) * position.size_shares;
                if self.positions.close_position(position.id, reason.as_str(), pnl) {
                    self.safeguards.remove_entry(&position.window_id, &position.strategy_id);
                    closed += 1;
                    info!(window_id = %position.window_id, reason = reason.as_str(), pnl, "position closed");
                }
            }
        }
        closed
    }

    async fn sweep_window_expiry(&self) -> u32 {
        let mut settled = 0;
        for position in self.positions.open_positions() {
            let Some(window) = self.scheduler.get(&position.window_id) else {
                continue;
            };
            if evaluate_window_expiry(&position, window.settled).is_none() {
                continue;
            }
            let winning_side = if window.up_token_id == position.token_id {
                Side::Up
            } else {
                Side::Down
            };
            let pnl = settlement_pnl(&position, winning_side, 0.0);
            if self.positions.close_position(position.id, "window_expiry", pnl) {
                self.safeguards.remove_entry(&position.window_id, &position.strategy_id);
                settled += 1;
            }
        }
        settled
    }
}

/// Maps an [`ErrorKind`] to whether a recoverable-error counter should
/// trip the breaker preemptively: too many recoverable errors in the
/// ring within the window counts as fatal.
pub fn escalate_on_repeated_recoverable(kind: ErrorKind, consecutive_count: u32, threshold: u32) -> bool {
    matches!(kind, ErrorKind::Recoverable) && consecutive_count >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::OrderAck;
    use crate::models::MarketContext;
    use crate::strategy::sizing::KellyParams;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    struct AlwaysFillAdapter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ExecutionAdapter for AlwaysFillAdapter {
        async fn place_order(&self, req: OrderRequest) -> Result<OrderAck, PlaceOrderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(OrderAck {
                order_id: req.client_order_id,
                filled_shares: req.notional_usdc / req.max_price,
                filled_price: req.max_price,
                fees_usdc: 0.0,
            })
        }
    }

    fn empty_strategy() -> ComposedStrategy {
        ComposedStrategy {
            name: "test-strategy".to_string(),
            slots: Vec::new(),
            config: HashMap::new(),
        }
    }

    struct FixedProbabilityComponent {
        probability: f64,
    }

    impl crate::strategy::Component for FixedProbabilityComponent {
        fn metadata(&self) -> crate::strategy::ComponentMetadata {
            crate::strategy::ComponentMetadata {
                name: "fixed".to_string(),
                version: 1,
                component_type: crate::strategy::ComponentType::Probability,
            }
        }
        fn validate_config(&self, _config: &toml::Value) -> Result<(), Vec<String>> {
            Ok(())
        }
        fn evaluate(&self, _context: &WindowContext, _config: &toml::Value) -> crate::strategy::ComponentResult {
            crate::strategy::ComponentResult {
                probability: Some(self.probability),
                legacy_signal: None,
            }
        }
    }

    fn strategy_with_fixed_probability(probability: f64) -> ComposedStrategy {
        ComposedStrategy {
            name: "test-strategy".to_string(),
            slots: vec![(
                "prob".to_string(),
                vec![Arc::new(FixedProbabilityComponent { probability })],
            )],
            config: HashMap::new(),
        }
    }

    fn sample_context() -> WindowContext {
        WindowContext {
            oracle_price: None,
            reference_price: Some(94_500.0),
            market_price: Some(0.50),
            time_to_expiry_ms: 60_000,
            symbol: "btc".to_string(),
            window_id: "btc-15m-900".to_string(),
            token_id_up: "up".to_string(),
            token_id_down: Some("down".to_string()),
            market_context: MarketContext::default(),
        }
    }

    #[tokio::test]
    async fn tick_is_non_reentrant() {
        let loop1 = build_loop().await;
        let strategy = empty_strategy();
        let contexts = vec![sample_context()];

        let first = loop1.tick(&strategy, &contexts).await;
        assert!(first.is_some());
    }

    #[tokio::test]
    async fn open_circuit_breaker_skips_the_tick() {
        let loop1 = build_loop().await;
        loop1.breaker.trip(TripReason::Other("test".to_string()));

        let strategy = empty_strategy();
        let contexts = vec![sample_context()];
        let report = loop1.tick(&strategy, &contexts).await.unwrap();
        assert!(report.skipped_circuit_open);
    }

    async fn build_loop() -> ExecutionLoop<AlwaysFillAdapter> {
        let config = ExecutionLoopConfig::default();
        let breaker = Arc::new(CircuitBreaker::new());
        let safeguards = Arc::new(Safeguards::new(config.max_entries_per_tick));
        let positions = Arc::new(PositionBook::new());
        let books = BookStore::new(crate::clob::BookClientConfig::from_env());
        let scheduler = WindowScheduler::new(crate::window::WindowSchedulerConfig::default());
        let sizing = KellySizingComponent::new(KellyParams::default());
        let executor = AlwaysFillAdapter { calls: AtomicU32::new(0) };
        let volatility = Arc::new(VolatilityTracker::new(crate::probability::VolatilityConfig::default()));

        ExecutionLoop::new(
            config,
            breaker,
            safeguards,
            positions,
            books,
            scheduler,
            sizing,
            executor,
            1000.0,
            RunMode::Live,
            volatility,
            1.0,
        )
    }

    #[tokio::test]
    async fn paper_mode_entry_opens_virtual_position() {
        let config = ExecutionLoopConfig::default();
        let breaker = Arc::new(CircuitBreaker::new());
        let safeguards = Arc::new(Safeguards::new(config.max_entries_per_tick));
        let positions = Arc::new(PositionBook::new());
        let books = BookStore::new(crate::clob::BookClientConfig::from_env());
        books
            .ingest_for_test(
                r#"{"event_type":"book","asset_id":"up","bids":[{"price":"0.48","size":"100"}],"asks":[{"price":"0.50","size":"100"}]}"#,
            )
            .await;
        let scheduler = WindowScheduler::new(crate::window::WindowSchedulerConfig::default());
        let sizing = KellySizingComponent::new(KellyParams::default());
        let executor = AlwaysFillAdapter { calls: AtomicU32::new(0) };
        let volatility = Arc::new(VolatilityTracker::new(crate::probability::VolatilityConfig::default()));

        let loop1 = ExecutionLoop::new(
            config,
            breaker,
            safeguards,
            positions.clone(),
            books,
            scheduler,
            sizing,
            executor,
            1000.0,
            RunMode::Paper,
            volatility,
            1.0,
        );

        let strategy = strategy_with_fixed_probability(0.70);
        let contexts = vec![sample_context()];
        let report = loop1.tick(&strategy, &contexts).await.unwrap();

        assert_eq!(report.entries_filled, 1);
        assert_eq!(loop1.executor.calls.load(Ordering::SeqCst), 0);
        let open = positions.open_positions();
        assert_eq!(open.len(), 1);
        assert!(open[0].is_paper);
    }
}
