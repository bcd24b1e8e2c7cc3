//! Kelly-criterion position sizing, wired into the `Component` trait so
//! it can sit in a strategy's `sizing` slot alongside any other sizing
//! component.

use serde::{Deserialize, Serialize};

use super::{Component, ComponentMetadata, ComponentResult, ComponentType, WindowContext};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyParams {
    pub bankroll: f64,
    pub kelly_fraction: f64,
    pub max_position_pct: f64,
    pub min_position_usd: f64,
}

impl Default for KellyParams {
    fn default() -> Self {
        Self {
            bankroll: 1000.0,
            kelly_fraction: 0.25,
            max_position_pct: 0.10,
            min_position_usd: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyResult {
    pub position_size_usd: f64,
    pub full_kelly_fraction: f64,
    pub actual_fraction: f64,
    pub edge: f64,
    pub should_trade: bool,
    pub skip_reason: Option<String>,
}

/// Fractional-Kelly sizing for a binary outcome bought at `market_price`
/// with model `confidence`.
pub fn calculate_kelly_position(
    confidence: f64,
    market_price: f64,
    params: &KellyParams,
) -> KellyResult {
    if !(0.0..1.0).contains(&confidence) || confidence <= 0.0 {
        return skip(0.0, "invalid confidence value");
    }
    if !(0.0..1.0).contains(&market_price) || market_price <= 0.0 {
        return skip(0.0, "invalid market price");
    }

    let edge = confidence - market_price;
    if edge <= 0.0 {
        return skip(
            edge,
            &format!(
                "no edge: confidence {:.1}% <= market {:.1}%",
                confidence * 100.0,
                market_price * 100.0
            ),
        );
    }

    let odds = (1.0 / market_price) - 1.0;
    let p = confidence;
    let q = 1.0 - p;
    let full_kelly = ((p * odds - q) / odds).clamp(0.0, 1.0);
    let actual_fraction = full_kelly * params.kelly_fraction;
    let capped_fraction = actual_fraction.min(params.max_position_pct);
    let position_usd = params.bankroll * capped_fraction;

    if position_usd < params.min_position_usd {
        return KellyResult {
            position_size_usd: 0.0,
            full_kelly_fraction: full_kelly,
            actual_fraction: capped_fraction,
            edge,
            should_trade: false,
            skip_reason: Some(format!(
                "position ${:.2} below minimum ${:.2}",
                position_usd, params.min_position_usd
            )),
        };
    }

    KellyResult {
        position_size_usd: position_usd,
        full_kelly_fraction: full_kelly,
        actual_fraction: capped_fraction,
        edge,
        should_trade: true,
        skip_reason: None,
    }
}

fn skip(edge: f64, reason: &str) -> KellyResult {
    KellyResult {
        position_size_usd: 0.0,
        full_kelly_fraction: 0.0,
        actual_fraction: 0.0,
        edge,
        should_trade: false,
        skip_reason: Some(reason.to_string()),
    }
}

/// Wraps [`calculate_kelly_position`] as a `sizing` slot component. Its
/// `evaluate` reads `confidence`/`market_price` off the context rather
/// than producing a probability itself — sizing components don't
/// participate in the edge-signal rule.
pub struct KellySizingComponent {
    params: KellyParams,
}

impl KellySizingComponent {
    pub fn new(params: KellyParams) -> Self {
        Self { params }
    }

    pub fn size_for(&self, confidence: f64, market_price: f64) -> KellyResult {
        calculate_kelly_position(confidence, market_price, &self.params)
    }
}

impl Component for KellySizingComponent {
    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            name: "kelly".to_string(),
            version: 1,
            component_type: ComponentType::Sizing,
        }
    }

    fn validate_config(&self, _config: &toml::Value) -> Result<(), Vec<String>> {
        Ok(())
    }

    fn evaluate(&self, _context: &WindowContext, _config: &toml::Value) -> ComponentResult {
        ComponentResult::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_edge_recommends_a_position() {
        let params = KellyParams {
            bankroll: 10_000.0,
            kelly_fraction: 0.25,
            max_position_pct: 0.10,
            min_position_usd: 1.0,
        };
        let result = calculate_kelly_position(0.70, 0.50, &params);
        assert!(result.should_trade);
        assert!(result.position_size_usd > 0.0);
        assert!((result.edge - 0.20).abs() < 1e-9);
    }

    #[test]
    fn no_edge_skips_trade() {
        let params = KellyParams::default();
        let result = calculate_kelly_position(0.50, 0.55, &params);
        assert!(!result.should_trade);
        assert!(result.edge <= 0.0);
    }

    #[test]
    fn tiny_position_below_minimum_is_skipped() {
        let params = KellyParams {
            bankroll: 10.0,
            kelly_fraction: 0.01,
            max_position_pct: 0.10,
            min_position_usd: 5.0,
        };
        let result = calculate_kelly_position(0.55, 0.50, &params);
        assert!(!result.should_trade);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let params = KellyParams::default();
        assert!(!calculate_kelly_position(0.0, 0.5, &params).should_trade);
        assert!(!calculate_kelly_position(0.5, 1.0, &params).should_trade);
    }
}
