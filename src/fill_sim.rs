//! Fill Simulator. Pure functions — no suspension points, no I/O —
//! walking live L2 depth to produce a VWAP fill against a dollar
//! quantity (entry) or a share quantity (exit).

use crate::models::PriceLevel;

#[derive(Debug, Clone, Copy)]
pub struct Fill {
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone)]
pub struct FillResult {
    pub success: bool,
    pub vwap_price: f64,
    pub best_price: f64,
    pub slippage: f64,
    pub total_shares: f64,
    pub total_cost: f64,
    pub fees: f64,
    pub net_cost: f64,
    pub levels_consumed: usize,
    pub unfilled: f64,
    pub partial_fill: bool,
    pub market_impact: f64,
    pub fills: Vec<Fill>,
}

fn empty_result(best_price: f64, unfilled: f64) -> FillResult {
    FillResult {
        success: false,
        vwap_price: 0.0,
        best_price,
        slippage: 0.0,
        total_shares: 0.0,
        total_cost: 0.0,
        fees: 0.0,
        net_cost: 0.0,
        levels_consumed: 0,
        unfilled,
        partial_fill: false,
        market_impact: 0.0,
        fills: Vec::new(),
    }
}

/// Polymarket-style fee curve: symmetric around p=0.5, zero at the
/// extremes. `fee_per_share = 0.25 * (p*(1-p))^2`.
pub fn fee_per_share(price: f64, fee_rate: f64) -> f64 {
    fee_rate * (price * (1.0 - price)).powi(2)
}

/// Walk `levels` (assumed pre-sorted best-first) taking
/// `min(remaining_dollars, price*size)` at each level until the dollar
/// budget is exhausted or levels run out.
pub fn simulate_fill(levels: &[PriceLevel], dollars: f64, fee_rate: f64) -> FillResult {
    let Some(best) = levels.first().map(|l| l.price) else {
        return empty_result(0.0, dollars);
    };
    if dollars <= 0.0 {
        return empty_result(best, 0.0);
    }

    let mut remaining = dollars;
    let mut total_shares = 0.0;
    let mut total_cost = 0.0;
    let mut fills = Vec::new();

    for level in levels {
        if remaining <= 1e-9 {
            break;
        }
        let level_notional = level.price * level.size;
        let take_notional = remaining.min(level_notional);
        if take_notional <= 0.0 || level.price <= 0.0 {
            continue;
        }
        let shares = take_notional / level.price;
        total_shares += shares;
        total_cost += take_notional;
        remaining -= take_notional;
        fills.push(Fill {
            price: level.price,
            size: shares,
        });
    }

    let levels_consumed = fills.len();
    let unfilled = remaining.max(0.0);
    let partial_fill = unfilled > 0.01;

    if total_shares <= 0.0 {
        let mut result = empty_result(best, dollars);
        result.partial_fill = unfilled > 0.01 && total_shares > 0.0;
        return result;
    }

    let vwap_price = total_cost / total_shares;
    let slippage = vwap_price - best;
    let market_impact = if best > 0.0 { slippage / best } else { 0.0 };
    let fees: f64 = fills
        .iter()
        .map(|f| fee_per_share(f.price, fee_rate) * f.size)
        .sum();

    FillResult {
        success: true,
        vwap_price,
        best_price: best,
        slippage,
        total_shares,
        total_cost,
        fees,
        net_cost: total_cost + fees,
        levels_consumed,
        unfilled,
        partial_fill,
        market_impact,
        fills,
    }
}

/// Exit side: UP sells into bids; DOWN "sells" by walking asks, treating
/// the implied down-price as `1 - askPrice` (skipping levels where
/// `askPrice >= 1`, which would imply a non-positive down price).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSide {
    Up,
    Down,
}

/// Analogous to `simulate_fill` but walking a share quantity on exit.
pub fn simulate_exit(
    bids: &[PriceLevel],
    asks: &[PriceLevel],
    shares: f64,
    side: ExitSide,
    fee_rate: f64,
) -> FillResult {
    match side {
        ExitSide::Up => simulate_exit_walk(bids, shares, fee_rate, |l| l.price),
        ExitSide::Down => {
            let implied: Vec<PriceLevel> = asks
                .iter()
                .filter(|l| l.price < 1.0)
                .map(|l| PriceLevel {
                    price: 1.0 - l.price,
                    size: l.size,
                })
                .collect();
            simulate_exit_walk(&implied, shares, fee_rate, |l| l.price)
        }
    }
}

fn simulate_exit_walk(
    levels: &[PriceLevel],
    shares: f64,
    fee_rate: f64,
    price_of: impl Fn(&PriceLevel) -> f64,
) -> FillResult {
    let Some(best) = levels.first().map(&price_of) else {
        return empty_result(0.0, shares);
    };
    if shares <= 0.0 {
        return empty_result(best, 0.0);
    }

    let mut remaining_shares = shares;
    let mut total_shares = 0.0;
    let mut total_cost = 0.0;
    let mut fills = Vec::new();

    for level in levels {
        if remaining_shares <= 1e-9 {
            break;
        }
        let take = remaining_shares.min(level.size);
        if take <= 0.0 {
            continue;
        }
        let price = price_of(level);
        total_shares += take;
        total_cost += take * price;
        remaining_shares -= take;
        fills.push(Fill { price, size: take });
    }

    let levels_consumed = fills.len();
    let unfilled = remaining_shares.max(0.0);
    let partial_fill = unfilled > 0.01;

    if total_shares <= 0.0 {
        return empty_result(best, shares);
    }

    let vwap_price = total_cost / total_shares;
    let slippage = best - vwap_price; // selling: worse fill means lower price than best
    let market_impact = if best > 0.0 { slippage / best } else { 0.0 };
    let fees: f64 = fills
        .iter()
        .map(|f| fee_per_share(f.price, fee_rate) * f.size)
        .sum();

    FillResult {
        success: true,
        vwap_price,
        best_price: best,
        slippage,
        total_shares,
        total_cost,
        fees,
        net_cost: total_cost - fees,
        levels_consumed,
        unfilled,
        partial_fill,
        market_impact,
        fills,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asks() -> Vec<PriceLevel> {
        vec![
            PriceLevel { price: 0.50, size: 20.0 },
            PriceLevel { price: 0.51, size: 20.0 },
            PriceLevel { price: 0.55, size: 100.0 },
        ]
    }

    fn bids() -> Vec<PriceLevel> {
        vec![
            PriceLevel { price: 0.48, size: 20.0 },
            PriceLevel { price: 0.47, size: 20.0 },
        ]
    }

    #[test]
    fn fee_formula_matches_polymarket_curve() {
        let fee = fee_per_share(0.5, 1.0);
        assert!((fee - 0.015625).abs() < 1e-9, "fee={fee}");
        assert!(fee_per_share(0.0, 1.0) < 1e-12);
        assert!(fee_per_share(1.0, 1.0) < 1e-12);
    }

    #[test]
    fn simulate_fill_walks_levels_in_order() {
        let result = simulate_fill(&asks(), 10.0, 0.0);
        assert!(result.success);
        assert_eq!(result.levels_consumed, 1);
        assert!((result.vwap_price - 0.50).abs() < 1e-9);
        assert!(result.unfilled < 1e-9);
    }

    #[test]
    fn simulate_fill_spans_multiple_levels() {
        let result = simulate_fill(&asks(), 20.1, 0.0);
        assert!(result.levels_consumed >= 2);
        assert!(result.vwap_price > 0.50);
        assert!(result.slippage > 0.0);
    }

    #[test]
    fn simulate_fill_partial_when_book_exhausted() {
        let thin = vec![PriceLevel { price: 0.5, size: 1.0 }];
        let result = simulate_fill(&thin, 100.0, 0.0);
        assert!(result.partial_fill);
        assert!(result.unfilled > 0.0);
    }

    #[test]
    fn simulate_exit_up_walks_bids_descending() {
        let result = simulate_exit(&bids(), &asks(), 10.0, ExitSide::Up, 0.0);
        assert!(result.success);
        assert!((result.vwap_price - 0.48).abs() < 1e-9);
    }

    #[test]
    fn simulate_exit_down_uses_implied_price() {
        let result = simulate_exit(&bids(), &asks(), 10.0, ExitSide::Down, 0.0);
        assert!(result.success);
        // best ask 0.50 => implied down price 0.50
        assert!((result.vwap_price - 0.50).abs() < 1e-9);
    }

    #[test]
    fn simulate_exit_down_skips_levels_at_or_above_one() {
        let asks_with_bad = vec![
            PriceLevel { price: 1.0, size: 5.0 },
            PriceLevel { price: 0.6, size: 5.0 },
        ];
        let result = simulate_exit(&[], &asks_with_bad, 5.0, ExitSide::Down, 0.0);
        assert!(result.success);
        assert!((result.vwap_price - 0.4).abs() < 1e-9);
    }

    #[test]
    fn empty_book_is_unsuccessful() {
        let result = simulate_fill(&[], 10.0, 0.0);
        assert!(!result.success);
    }
}
