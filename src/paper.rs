//! Paper Trader: a signal sweep independent of the Execution Loop's
//! own PAPER-mode entries, used to evaluate many strategy × variation
//! combinations against the same window cheaply, plus an optional
//! thesis-exit monitor.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::ab_test::VariationTracker;
use crate::exits::{evaluate_thesis_degraded, ExitReason};
use crate::fill_sim::{self, ExitSide};
use crate::models::{PriceLevel, Side, TokenId, Window};
use crate::paper_ledger::PaperLedger;

/// Shared market context the sweep builds once per signal offset and
/// reuses across every strategy × variation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedWindowContext {
    pub composite_vwap: Option<f64>,
    pub aggregator_price: Option<f64>,
    pub vwap20: Option<f64>,
    pub oracle_price: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct VariationSpec {
    pub min_edge: f64,
    pub dollar_size: f64,
    pub fee_rate: f64,
}

#[derive(Debug, Clone)]
pub struct PaperTrade {
    pub id: Uuid,
    pub window_id: String,
    pub strategy_id: String,
    pub variation: String,
    pub token_id: TokenId,
    pub side: Side,
    pub entry_price: f64,
    pub shares: f64,
    pub cost_usdc: f64,
    pub fee_usdc: f64,
    pub opened_at: DateTime<Utc>,
    pub closed: bool,
    pub exit_price: Option<f64>,
    pub net_pnl: Option<f64>,
}

/// Evaluates `shouldFire` for one strategy × variation: an edge-based
/// rule, same shape as the composer's but applied independently since
/// the sweep may run variations the composer doesn't know about.
pub fn should_fire(edge: f64, spec: &VariationSpec) -> bool {
    edge >= spec.min_edge
}

pub struct PaperTrader {
    ledger: Mutex<PaperLedger>,
    variations: Mutex<VariationTracker>,
    trades: RwLock<Vec<PaperTrade>>,
    monitored: Mutex<HashSet<Uuid>>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl PaperTrader {
    pub fn new(starting_cash_usdc: f64, variations: VariationTracker) -> Arc<Self> {
        Arc::new(Self {
            ledger: Mutex::new(PaperLedger::new(starting_cash_usdc)),
            variations: Mutex::new(variations),
            trades: RwLock::new(Vec::new()),
            monitored: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// One signal-offset pass: for a single window/variation, fires an
    /// entry (simulated against live ask depth) if the edge clears the
    /// variation's threshold. Returns the created trade, if any.
    pub fn evaluate_variation(
        &self,
        window: &Window,
        strategy_id: &str,
        variation: &str,
        model_probability: f64,
        asks: &[PriceLevel],
        spec: &VariationSpec,
    ) -> Option<PaperTrade> {
        let best_ask = asks.first()?.price;
        let edge = model_probability - best_ask;
        if !should_fire(edge, spec) {
            return None;
        }

        let fill = fill_sim::simulate_fill(asks, spec.dollar_size, spec.fee_rate);
        if !fill.success || fill.total_shares <= 0.0 {
            return None;
        }

        let mut ledger = self.ledger.lock();
        let shares = ledger.apply_buy(
            &window.up_token_id,
            "up",
            fill.vwap_price,
            fill.total_cost,
            fill.fees,
        );
        if shares <= 0.0 {
            return None;
        }
        drop(ledger);

        let trade = PaperTrade {
            id: Uuid::new_v4(),
            window_id: window.window_id.clone(),
            strategy_id: strategy_id.to_string(),
            variation: variation.to_string(),
            token_id: window.up_token_id.clone(),
            side: Side::Up,
            entry_price: fill.vwap_price,
            shares,
            cost_usdc: fill.total_cost,
            fee_usdc: fill.fees,
            opened_at: Utc::now(),
            closed: false,
            exit_price: None,
            net_pnl: None,
        };

        self.trades.write().push(trade.clone());
        self.monitored.lock().insert(trade.id);
        Some(trade)
    }

    /// Assigns a variation name for `window_id` from `candidates`,
    /// delegating to the variation tracker for reproducible assignment.
    pub fn assign_variation(&self, window_id: &str, candidates: &[String]) -> Option<String> {
        self.variations.lock().assign(window_id, candidates)
    }

    /// Settles every open trade for `window_id` against the resolved
    /// direction.
    pub fn resolve_window(&self, window_id: &str, resolved_direction: Side) -> Vec<PaperTrade> {
        let mut resolved = Vec::new();
        let mut guard = self.trades.write();
        for trade in guard.iter_mut() {
            if trade.window_id != window_id || trade.closed {
                continue;
            }
            let payout = if trade.side == resolved_direction {
                trade.shares
            } else {
                0.0
            };
            let net_pnl = payout - trade.cost_usdc;
            trade.closed = true;
            trade.net_pnl = Some(net_pnl);
            self.monitored.lock().remove(&trade.id);

            self.variations
                .lock()
                .record_result(&trade.variation, net_pnl);
            resolved.push(trade.clone());
        }
        resolved
    }

    /// Thesis-exit monitor tick: for every monitored trade,
    /// recompute thesis strength and exit if it has degraded past
    /// threshold, after the minimum hold time. Double-fire is prevented
    /// by removing the trade from `monitored` before simulating the
    /// exit, and by the `in_flight` guard for the duration of the call.
    pub fn tick_thesis_exits(
        &self,
        current_edge_for: impl Fn(&PaperTrade) -> Option<f64>,
        bids_for: impl Fn(&PaperTrade) -> Vec<PriceLevel>,
        min_edge_to_hold: f64,
        min_hold_secs: f64,
        fee_rate: f64,
    ) -> Vec<(Uuid, ExitReason, f64)> {
        let candidates: Vec<PaperTrade> = {
            let trades = self.trades.read();
            let monitored = self.monitored.lock();
            trades
                .iter()
                .filter(|t| monitored.contains(&t.id) && !t.closed)
                .cloned()
                .collect()
        };

        let mut exited = Vec::new();
        for trade in candidates {
            {
                let mut in_flight = self.in_flight.lock();
                if in_flight.contains(&trade.id) {
                    continue;
                }
                in_flight.insert(trade.id);
            }
            self.monitored.lock().remove(&trade.id);

            let held_secs = (Utc::now() - trade.opened_at).num_milliseconds() as f64 / 1000.0;
            let Some(edge) = current_edge_for(&trade) else {
                self.in_flight.lock().remove(&trade.id);
                continue;
            };

            if let Some(reason) =
                evaluate_thesis_degraded(edge, min_edge_to_hold, held_secs, min_hold_secs)
            {
                let bids = bids_for(&trade);
                let fill = fill_sim::simulate_exit(&bids, &[], trade.shares, ExitSide::Up, fee_rate);
                let net_pnl = fill.net_cost - trade.cost_usdc;

                let mut guard = self.trades.write();
                if let Some(stored) = guard.iter_mut().find(|t| t.id == trade.id) {
                    stored.closed = true;
                    stored.exit_price = Some(fill.vwap_price);
                    stored.net_pnl = Some(net_pnl);
                }
                drop(guard);

                self.variations.lock().record_result(&trade.variation, net_pnl);
                exited.push((trade.id, reason, net_pnl));
            } else {
                self.monitored.lock().insert(trade.id);
            }

            self.in_flight.lock().remove(&trade.id);
        }
        exited
    }

    pub fn open_trades(&self) -> Vec<PaperTrade> {
        self.trades.read().iter().filter(|t| !t.closed).cloned().collect()
    }

    pub fn all_trades(&self) -> Vec<PaperTrade> {
        self.trades.read().clone()
    }

    pub fn ledger_snapshot(&self) -> PaperLedger {
        self.ledger.lock().clone()
    }
}
