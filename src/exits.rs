//! Exit Evaluators: stop-loss, take-profit with trailing, window-expiry,
//! and thesis-degradation, evaluated against a fee-adjusted minimum
//! profitable move.

use crate::models::{Position, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    WindowExpiry,
    ThesisDegraded,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::WindowExpiry => "window_expiry",
            ExitReason::ThesisDegraded => "thesis_degraded",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExitConfig {
    /// Fractional move against entry that triggers a stop-loss, e.g. 0.15
    /// means a 15% adverse move in price.
    pub stop_loss_pct: f64,
    /// Fractional move in favor of entry that triggers a take-profit.
    pub take_profit_pct: f64,
    /// Trailing-stop giveback from peak, as a fraction of the peak gain.
    pub trailing_giveback_pct: f64,
    /// Minimum peak gain before the trailing stop arms.
    pub trailing_arm_pct: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.15,
            take_profit_pct: 0.25,
            trailing_giveback_pct: 0.40,
            trailing_arm_pct: 0.10,
        }
    }
}

/// Directional price move from entry, positive when favorable.
fn favorable_move_pct(position: &Position, price: f64) -> f64 {
    if position.entry_price <= 0.0 {
        return 0.0;
    }
    match position.side {
        Side::Up => (price - position.entry_price) / position.entry_price,
        Side::Down => (position.entry_price - price) / position.entry_price,
    }
}

/// Evaluate stop-loss against current price. Returns `Some` exactly when
/// the position should close emergently.
pub fn evaluate_stop_loss(position: &Position, config: &ExitConfig) -> Option<ExitReason> {
    let move_pct = favorable_move_pct(position, position.current_price);
    (move_pct <= -config.stop_loss_pct).then_some(ExitReason::StopLoss)
}

/// Evaluate take-profit (fixed threshold) and trailing-stop (peak-derived)
/// together, since both read the same monotonically-updated peak.
pub fn evaluate_take_profit(position: &Position, config: &ExitConfig) -> Option<ExitReason> {
    let move_pct = favorable_move_pct(position, position.current_price);
    if move_pct >= config.take_profit_pct {
        return Some(ExitReason::TakeProfit);
    }

    let peak_pct = position.peak_pnl_pct();
    if peak_pct >= config.trailing_arm_pct {
        let giveback_threshold = peak_pct * (1.0 - config.trailing_giveback_pct);
        if move_pct <= giveback_threshold {
            return Some(ExitReason::TrailingStop);
        }
    }
    None
}

/// Window-expiry resolution: a position whose window has settled closes
/// against the resolved direction's payout, regardless of price-based
/// triggers.
pub fn evaluate_window_expiry(position: &Position, window_settled: bool) -> Option<ExitReason> {
    window_settled.then_some(ExitReason::WindowExpiry)
}

/// Thesis-degradation: a signed thesis strength recomputed against the
/// position's chosen VWAP source, after a minimum hold time, exits once
/// strength falls to or below threshold.
pub fn evaluate_thesis_degraded(
    current_edge: f64,
    min_edge_to_hold: f64,
    held_secs: f64,
    min_hold_secs: f64,
) -> Option<ExitReason> {
    (held_secs >= min_hold_secs && current_edge <= min_edge_to_hold)
        .then_some(ExitReason::ThesisDegraded)
}

/// Binary settlement payout: win pays `shares * 1.0`, lose pays `0`, net
/// of the entry cost already paid.
pub fn settlement_pnl(position: &Position, winning_side: Side, entry_fee: f64) -> f64 {
    let payout = if position.side == winning_side {
        position.size_shares
    } else {
        0.0
    };
    let cost = position.entry_price * position.size_shares;
    payout - cost - entry_fee
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Position;

    fn up_position(entry: f64, current: f64) -> Position {
        let mut p = Position::new("w", "s", "tok", Side::Up, 100.0, entry, true);
        p.update_current_price(current);
        p
    }

    #[test]
    fn stop_loss_triggers_on_adverse_move() {
        let p = up_position(0.50, 0.40);
        let cfg = ExitConfig::default();
        assert_eq!(evaluate_stop_loss(&p, &cfg), Some(ExitReason::StopLoss));
    }

    #[test]
    fn stop_loss_does_not_trigger_on_small_move() {
        let p = up_position(0.50, 0.48);
        let cfg = ExitConfig::default();
        assert_eq!(evaluate_stop_loss(&p, &cfg), None);
    }

    #[test]
    fn take_profit_triggers_on_fixed_threshold() {
        let p = up_position(0.50, 0.70);
        let cfg = ExitConfig::default();
        assert_eq!(evaluate_take_profit(&p, &cfg), Some(ExitReason::TakeProfit));
    }

    #[test]
    fn trailing_stop_triggers_after_giveback_from_peak() {
        let mut p = up_position(0.50, 0.65);
        p.update_current_price(0.65); // peak
        p.update_current_price(0.55); // gives back more than 40% of the 0.30 gain
        let cfg = ExitConfig::default();
        assert_eq!(
            evaluate_take_profit(&p, &cfg),
            Some(ExitReason::TrailingStop)
        );
    }

    #[test]
    fn window_expiry_closes_only_when_settled() {
        let p = up_position(0.50, 0.50);
        assert_eq!(evaluate_window_expiry(&p, false), None);
        assert_eq!(
            evaluate_window_expiry(&p, true),
            Some(ExitReason::WindowExpiry)
        );
    }

    #[test]
    fn thesis_degraded_respects_min_hold() {
        assert_eq!(evaluate_thesis_degraded(0.02, 0.05, 0.2, 0.5), None);
        assert_eq!(
            evaluate_thesis_degraded(0.02, 0.05, 1.0, 0.5),
            Some(ExitReason::ThesisDegraded)
        );
    }

    #[test]
    fn settlement_pnl_binary_payout() {
        let p = up_position(0.40, 0.40);
        let win = settlement_pnl(&p, Side::Up, 0.5);
        assert!((win - (100.0 - 40.0 - 0.5)).abs() < 1e-9);
        let lose = settlement_pnl(&p, Side::Down, 0.5);
        assert!((lose - (0.0 - 40.0 - 0.5)).abs() < 1e-9);
    }
}
