//! Black-Scholes `N(d2)` wired as a `prob` slot component. Holds no
//! state of its own beyond a shared volatility tracker, since sigma is
//! a running estimate fed by every price observation across windows.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::probability::{p_up, t_years_from_ms, VolatilityTracker};

use super::{Component, ComponentMetadata, ComponentResult, ComponentType, WindowContext};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlackScholesConfig {
    pub window_duration_ms: i64,
}

impl Default for BlackScholesConfig {
    fn default() -> Self {
        Self {
            window_duration_ms: 15 * 60 * 1000,
        }
    }
}

/// `prob-blackscholes-v1`: spot is the on-chain oracle price, strike is
/// the window's reference (open) price, sigma comes from the shared
/// volatility tracker, T is time-to-expiry annualised.
pub struct BlackScholesProbabilityComponent {
    volatility: Arc<VolatilityTracker>,
    config: BlackScholesConfig,
}

impl BlackScholesProbabilityComponent {
    pub fn new(volatility: Arc<VolatilityTracker>, config: BlackScholesConfig) -> Self {
        Self { volatility, config }
    }
}

impl Component for BlackScholesProbabilityComponent {
    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            name: "blackscholes".to_string(),
            version: 1,
            component_type: ComponentType::Probability,
        }
    }

    fn validate_config(&self, _config: &toml::Value) -> Result<(), Vec<String>> {
        Ok(())
    }

    fn evaluate(&self, context: &WindowContext, _config: &toml::Value) -> ComponentResult {
        let (Some(spot), Some(strike)) = (context.oracle_price, context.reference_price) else {
            return ComponentResult::default();
        };
        if spot <= 0.0 || strike <= 0.0 {
            return ComponentResult::default();
        }

        let sigma = self
            .volatility
            .get_sigma(&context.symbol, self.config.window_duration_ms, chrono::Utc::now());
        let t_years = t_years_from_ms(context.time_to_expiry_ms);
        let probability = p_up(spot, strike, sigma, t_years);

        ComponentResult {
            probability: Some(probability),
            legacy_signal: None,
        }
    }
}
