//! Position tracking: the engine-wide open/closed position book the
//! Execution Loop and Exit Evaluators share, with a capped trade
//! history.

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::models::{Position, TokenId};

const TRADE_HISTORY_CAP: usize = 1000;

/// Engine-wide open/closed position tracking. Reads are lock-free in
/// spirit (a single `RwLock` read guard, no nested locking); writers
/// (open/close/price update) take the write lock.
#[derive(Default)]
pub struct PositionBook {
    open: RwLock<HashMap<Uuid, Position>>,
    history: RwLock<Vec<Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_position(&self, position: Position) -> Uuid {
        let id = position.id;
        self.open.write().insert(id, position);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<Position> {
        self.open.read().get(&id).cloned()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    pub fn open_positions_for_token(&self, token_id: &str) -> Vec<Position> {
        self.open
            .read()
            .values()
            .filter(|p| p.token_id == token_id)
            .cloned()
            .collect()
    }

    pub fn open_position_for_strategy_window(
        &self,
        window_id: &str,
        strategy_id: &str,
    ) -> Option<Position> {
        self.open
            .read()
            .values()
            .find(|p| p.window_id == window_id && p.strategy_id == strategy_id)
            .cloned()
    }

    /// The seam the execution loop calls after each CLOB book update for
    /// a position's token (see DESIGN.md's Open Question resolution).
    pub fn update_current_price(&self, token_id: &TokenId, price: f64) {
        let mut guard = self.open.write();
        for pos in guard.values_mut() {
            if &pos.token_id == token_id {
                pos.update_current_price(price);
            }
        }
    }

    /// Closes a position exactly once: a second `close` call for an
    /// already-removed id is a no-op, so later evaluators in the same
    /// tick skip it cleanly.
    pub fn close_position(&self, id: Uuid, reason: &str, realized_pnl: f64) -> bool {
        let mut open = self.open.write();
        let Some(mut pos) = open.remove(&id) else {
            return false;
        };
        pos.close(reason, realized_pnl);
        drop(open);

        let mut history = self.history.write();
        history.push(pos);
        if history.len() > TRADE_HISTORY_CAP {
            let overflow = history.len() - TRADE_HISTORY_CAP;
            history.drain(0..overflow);
        }
        true
    }

    pub fn history(&self) -> Vec<Position> {
        self.history.read().clone()
    }

    pub fn total_exposure_dollars(&self) -> f64 {
        self.open
            .read()
            .values()
            .map(|p| p.size_shares * p.entry_price)
            .sum()
    }

    pub fn total_realized_pnl(&self) -> f64 {
        self.history
            .read()
            .iter()
            .filter_map(|p| p.realized_pnl)
            .sum()
    }
}
