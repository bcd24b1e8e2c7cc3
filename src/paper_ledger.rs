//! Bankroll accounting for PAPER mode: cash and per-token virtual
//! positions, fee/slippage/reject/partial-fill bookkeeping.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct PaperLedger {
    pub cash_usdc: f64,
    pub positions: HashMap<String, PaperLedgerPosition>,
    pub total_fees_usdc: f64,
    pub total_slippage_usdc: f64,
    pub trade_count: u64,
    pub reject_count: u64,
    pub partial_fill_count: u64,
}

#[derive(Debug, Clone)]
pub struct PaperLedgerPosition {
    pub token_id: String,
    pub side: String,
    pub shares: f64,
    pub cost_usdc: f64,
    pub avg_price: f64,
}

impl PaperLedger {
    pub fn new(starting_cash_usdc: f64) -> Self {
        Self {
            cash_usdc: starting_cash_usdc,
            ..Default::default()
        }
    }

    /// Applies a buy with fees deducted from cash. Returns shares
    /// acquired (0.0 on invalid input).
    pub fn apply_buy(&mut self, token_id: &str, side: &str, price: f64, notional: f64, fees: f64) -> f64 {
        if !(price > 0.0 && price < 1.0) || !(notional > 0.0) {
            return 0.0;
        }

        let shares = notional / price;
        let total_cost = notional + fees;

        self.cash_usdc = (self.cash_usdc - total_cost).max(0.0);
        self.total_fees_usdc += fees;
        self.trade_count += 1;

        let entry = self
            .positions
            .entry(token_id.to_string())
            .or_insert_with(|| PaperLedgerPosition {
                token_id: token_id.to_string(),
                side: side.to_string(),
                shares: 0.0,
                cost_usdc: 0.0,
                avg_price: price,
            });

        let new_cost = entry.cost_usdc + notional;
        let new_shares = entry.shares + shares;
        entry.cost_usdc = new_cost;
        entry.shares = new_shares;
        entry.avg_price = if new_shares > 0.0 { new_cost / new_shares } else { price };

        shares
    }

    /// Applies a sell with fees deducted from proceeds. Returns shares
    /// sold (0.0 if there is nothing to sell).
    pub fn apply_sell(&mut self, token_id: &str, price: f64, notional: f64, fees: f64) -> f64 {
        if !(price > 0.0 && price < 1.0) || !(notional > 0.0) {
            return 0.0;
        }

        let Some(pos) = self.positions.get_mut(token_id) else {
            return 0.0;
        };
        if !(pos.shares > 0.0) {
            return 0.0;
        }

        let target_shares = notional / price;
        let shares_sold = target_shares.min(pos.shares);
        if !(shares_sold > 0.0) {
            return 0.0;
        }

        let notional_received = shares_sold * price;
        let cost_reduced = pos.avg_price * shares_sold;

        pos.shares = (pos.shares - shares_sold).max(0.0);
        pos.cost_usdc = (pos.cost_usdc - cost_reduced).max(0.0);

        self.cash_usdc += (notional_received - fees).max(0.0);
        self.total_fees_usdc += fees;
        self.trade_count += 1;

        if pos.shares <= 1e-9 {
            self.positions.remove(token_id);
        } else {
            pos.avg_price = (pos.cost_usdc / pos.shares).max(1e-9);
        }

        shares_sold
    }

    pub fn record_reject(&mut self) {
        self.reject_count += 1;
    }

    pub fn record_partial_fill(&mut self) {
        self.partial_fill_count += 1;
    }

    pub fn record_slippage(&mut self, slippage_usdc: f64) {
        self.total_slippage_usdc += slippage_usdc;
    }

    pub fn execution_stats(&self) -> ExecutionStats {
        ExecutionStats {
            trade_count: self.trade_count,
            reject_count: self.reject_count,
            partial_fill_count: self.partial_fill_count,
            total_fees_usdc: self.total_fees_usdc,
            total_slippage_usdc: self.total_slippage_usdc,
            reject_rate: if self.trade_count + self.reject_count > 0 {
                self.reject_count as f64 / (self.trade_count + self.reject_count) as f64
            } else {
                0.0
            },
            partial_fill_rate: if self.trade_count > 0 {
                self.partial_fill_count as f64 / self.trade_count as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    pub trade_count: u64,
    pub reject_count: u64,
    pub partial_fill_count: u64,
    pub total_fees_usdc: f64,
    pub total_slippage_usdc: f64,
    pub reject_rate: f64,
    pub partial_fill_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buy_deducts_notional_plus_fees() {
        let mut ledger = PaperLedger::new(1000.0);
        let shares = ledger.apply_buy("tok", "up", 0.5, 100.0, 1.0);
        assert!((shares - 200.0).abs() < 1e-9);
        assert!((ledger.cash_usdc - 899.0).abs() < 1e-9);
    }

    #[test]
    fn sell_credits_proceeds_minus_fees_and_closes_small_remainder() {
        let mut ledger = PaperLedger::new(1000.0);
        ledger.apply_buy("tok", "up", 0.5, 100.0, 1.0);
        let sold = ledger.apply_sell("tok", 0.6, 120.0, 1.0);
        assert!(sold > 0.0);
        assert!(!ledger.positions.contains_key("tok"));
    }

    #[test]
    fn sell_without_a_position_is_a_noop() {
        let mut ledger = PaperLedger::new(1000.0);
        assert_eq!(ledger.apply_sell("nope", 0.5, 10.0, 0.1), 0.0);
    }

    #[test]
    fn execution_stats_compute_rates() {
        let mut ledger = PaperLedger::new(1000.0);
        ledger.apply_buy("tok", "up", 0.5, 100.0, 1.0);
        ledger.record_reject();
        ledger.record_partial_fill();

        let stats = ledger.execution_stats();
        assert_eq!(stats.trade_count, 1);
        assert_eq!(stats.reject_count, 1);
        assert!((stats.reject_rate - 0.5).abs() < 1e-9);
        assert!((stats.partial_fill_rate - 1.0).abs() < 1e-9);
    }
}
