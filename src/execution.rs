//! Execution adapters: the PAPER/LIVE duality behind order placement,
//! typed so the caller must handle [`crate::error::OrderOutcome`]
//! explicitly rather than guessing whether an order reached the
//! exchange. The paper adapter uses this crate's deterministic
//! [`crate::fill_sim`] walked against live book depth rather than a
//! statistical latency/slippage model.

use async_trait::async_trait;

use crate::error::{OrderOutcome, PlaceOrderError};
use crate::fill_sim::{self, ExitSide, FillResult};
use crate::models::{PriceLevel, Side, TokenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    Ioc,
    Fok,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub token_id: TokenId,
    pub side: OrderSide,
    /// Limit price (0..1): for entries this is the model's
    /// `confidence`, capping what the engine will pay.
    pub max_price: f64,
    pub notional_usdc: f64,
    pub tif: TimeInForce,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub filled_shares: f64,
    pub filled_price: f64,
    pub fees_usdc: f64,
}

#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck, PlaceOrderError>;
}

/// PAPER mode: fills are simulated against the caller-supplied book
/// depth, deterministically, via [`fill_sim`].
pub struct PaperExecutionAdapter {
    pub fee_rate: f64,
}

impl PaperExecutionAdapter {
    pub fn new(fee_rate: f64) -> Self {
        Self { fee_rate }
    }

    /// Simulates an entry fill (dollar-denominated) against one side of
    /// the book capped at `max_price`.
    pub fn simulate_entry(&self, levels: &[PriceLevel], req: &OrderRequest) -> FillResult {
        let capped: Vec<PriceLevel> = levels
            .iter()
            .filter(|l| l.price <= req.max_price)
            .cloned()
            .collect();
        fill_sim::simulate_fill(&capped, req.notional_usdc, self.fee_rate)
    }

    /// Simulates an exit fill (share-denominated).
    pub fn simulate_exit(
        &self,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        shares: f64,
        side: Side,
    ) -> FillResult {
        let exit_side = match side {
            Side::Up => ExitSide::Up,
            Side::Down => ExitSide::Down,
        };
        fill_sim::simulate_exit(bids, asks, shares, exit_side, self.fee_rate)
    }
}

#[async_trait]
impl ExecutionAdapter for PaperExecutionAdapter {
    /// The paper adapter never talks to a network, so it can only ever
    /// report `RejectedPreSubmit` — callers that want a fill must use
    /// [`Self::simulate_entry`]/[`Self::simulate_exit`] directly against
    /// live book depth, which creates a virtual position and confirms
    /// it without an exchange round-trip.
    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck, PlaceOrderError> {
        Err(PlaceOrderError::RejectedPreSubmit {
            reason: format!(
                "paper adapter does not place network orders for {}",
                req.client_order_id
            ),
        })
    }
}

/// LIVE mode: places an IOC/FOK order against the real exchange. The
/// concrete REST/WS client is an external collaborator; this struct is
/// the seam a real client plugs into.
pub struct LiveExecutionAdapter<C: LiveOrderClient> {
    client: C,
}

#[async_trait]
pub trait LiveOrderClient: Send + Sync {
    /// Returns `Ok` on an exchange acknowledgement (filled or accepted),
    /// `Err` with a [`PlaceOrderError`] classified by whether the order
    /// is known to have reached the exchange.
    async fn submit(&self, req: &OrderRequest) -> Result<OrderAck, PlaceOrderError>;
}

impl<C: LiveOrderClient> LiveExecutionAdapter<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: LiveOrderClient> ExecutionAdapter for LiveExecutionAdapter<C> {
    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck, PlaceOrderError> {
        self.client.submit(&req).await
    }
}

#[async_trait]
impl ExecutionAdapter for Box<dyn ExecutionAdapter> {
    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck, PlaceOrderError> {
        (**self).place_order(req).await
    }
}

/// Resolves what the execution loop must do with a reservation after a
/// LIVE order attempt, under the halt-on-uncertainty rule: confirm
/// unless the order definitely never reached the exchange.
pub fn reservation_action_for(result: &Result<OrderAck, PlaceOrderError>) -> OrderOutcome {
    match result {
        Ok(_) => OrderOutcome::ReachedExchange,
        Err(e) => e.outcome(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceLevel;

    fn asks() -> Vec<PriceLevel> {
        vec![
            PriceLevel { price: 0.50, size: 20.0 },
            PriceLevel { price: 0.55, size: 20.0 },
        ]
    }

    #[test]
    fn simulate_entry_caps_at_max_price() {
        let adapter = PaperExecutionAdapter::new(1.0);
        let req = OrderRequest {
            client_order_id: "c1".into(),
            token_id: "tok".into(),
            side: OrderSide::Buy,
            max_price: 0.50,
            notional_usdc: 100.0,
            tif: TimeInForce::Ioc,
        };
        let result = adapter.simulate_entry(&asks(), &req);
        // Only the 0.50 level qualifies; book only has $10 of depth there.
        assert!(result.total_cost <= 10.0 + 1e-9);
        assert!(result.partial_fill);
    }

    #[test]
    fn paper_adapter_never_reaches_exchange() {
        let adapter = PaperExecutionAdapter::new(1.0);
        let req = OrderRequest {
            client_order_id: "c1".into(),
            token_id: "tok".into(),
            side: OrderSide::Buy,
            max_price: 0.60,
            notional_usdc: 10.0,
            tif: TimeInForce::Ioc,
        };
        let result = tokio_test_block_on(adapter.place_order(req));
        assert_eq!(result.unwrap_err().outcome(), OrderOutcome::NeverReachedExchange);
    }

    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn reservation_action_confirms_on_exchange_error() {
        let err: Result<OrderAck, PlaceOrderError> = Err(PlaceOrderError::ExchangeError {
            reason: "5xx".into(),
        });
        assert_eq!(reservation_action_for(&err), OrderOutcome::ReachedExchange);

        let ok: Result<OrderAck, PlaceOrderError> = Ok(OrderAck {
            order_id: "x".into(),
            filled_shares: 10.0,
            filled_price: 0.5,
            fees_usdc: 0.1,
        });
        assert_eq!(reservation_action_for(&ok), OrderOutcome::ReachedExchange);

        let rejected: Result<OrderAck, PlaceOrderError> = Err(PlaceOrderError::RejectedPreSubmit {
            reason: "bad size".into(),
        });
        assert_eq!(
            reservation_action_for(&rejected),
            OrderOutcome::NeverReachedExchange
        );
    }
}
