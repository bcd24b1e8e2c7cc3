//! Strategy Composer: a typed component registry, strategy composition
//! from on-disk documents, pipeline execution, and the edge-signal rule
//! that turns a probability component's output into a tradeable
//! [`Signal`].

pub mod probability;
pub mod sizing;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::config::StrategyDocument;
use crate::models::{Direction, MarketContext, Signal, TokenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    Probability,
    Entry,
    Exit,
    Sizing,
    PriceSource,
    Analysis,
    SignalGenerator,
}

impl ComponentType {
    pub fn prefix(&self) -> &'static str {
        match self {
            ComponentType::Probability => "prob",
            ComponentType::Entry => "entry",
            ComponentType::Exit => "exit",
            ComponentType::Sizing => "sizing",
            ComponentType::PriceSource => "src",
            ComponentType::Analysis => "anal",
            ComponentType::SignalGenerator => "sig",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "prob" => Some(ComponentType::Probability),
            "entry" => Some(ComponentType::Entry),
            "exit" => Some(ComponentType::Exit),
            "sizing" => Some(ComponentType::Sizing),
            "src" => Some(ComponentType::PriceSource),
            "anal" => Some(ComponentType::Analysis),
            "sig" => Some(ComponentType::SignalGenerator),
            _ => None,
        }
    }
}

/// `<prefix>-<name>-v<version>`, e.g. `prob-blackscholes-v1`.
pub fn parse_version_id(version_id: &str) -> Option<(ComponentType, String, u32)> {
    let mut parts = version_id.rsplitn(2, "-v");
    let version: u32 = parts.next()?.parse().ok()?;
    let rest = parts.next()?;
    let (prefix, name) = rest.split_once('-')?;
    let component_type = ComponentType::from_prefix(prefix)?;
    Some((component_type, name.to_string(), version))
}

#[derive(Debug, Clone)]
pub struct ComponentMetadata {
    pub name: String,
    pub version: u32,
    pub component_type: ComponentType,
}

impl ComponentMetadata {
    pub fn version_id(&self) -> String {
        format!("{}-{}-v{}", self.component_type.prefix(), self.name, self.version)
    }
}

/// A window's market state, assembled fresh for each strategy-execution
/// pass.
#[derive(Debug, Clone)]
pub struct WindowContext {
    pub oracle_price: Option<f64>,
    pub reference_price: Option<f64>,
    pub market_price: Option<f64>,
    pub time_to_expiry_ms: i64,
    pub symbol: String,
    pub window_id: String,
    pub token_id_up: TokenId,
    pub token_id_down: Option<TokenId>,
    pub market_context: MarketContext,
}

/// What a component's `evaluate` returns. `probability` drives the edge
/// rule; `legacy_signal` is the deprecated "just say entry" path still
/// accepted (logged once per component, not fatal).
#[derive(Debug, Clone, Default)]
pub struct ComponentResult {
    pub probability: Option<f64>,
    pub legacy_signal: Option<String>,
}

pub trait Component: Send + Sync {
    fn metadata(&self) -> ComponentMetadata;
    fn validate_config(&self, config: &toml::Value) -> Result<(), Vec<String>>;
    fn evaluate(&self, context: &WindowContext, config: &toml::Value) -> ComponentResult;
}

/// `(type, versionId) -> component`, populated at startup from whatever
/// components the binary links in via a static registration call.
#[derive(Default)]
pub struct ComponentRegistry {
    catalog: RwLock<HashMap<(ComponentType, String), Arc<dyn Component>>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, component: Arc<dyn Component>) {
        let meta = component.metadata();
        let key = (meta.component_type, meta.version_id());
        self.catalog.write().insert(key, component);
    }

    pub fn get(&self, component_type: ComponentType, version_id: &str) -> Option<Arc<dyn Component>> {
        self.catalog
            .read()
            .get(&(component_type, version_id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.catalog.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeConfig {
    pub min_edge: f64,
    pub max_edge: f64,
    /// Multiplies `min_edge` while a symbol's volatility tracker reports
    /// a surprise (short/long realized-vol ratio outside its normal
    /// band). Surprise never suppresses a signal outright, only raises
    /// the bar it has to clear.
    pub surprise_edge_multiplier: f64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            min_edge: 0.10,
            max_edge: 0.50,
            surprise_edge_multiplier: 2.0,
        }
    }
}

/// A strategy composed from a [`StrategyDocument`] against a registry:
/// every slot's versionIds resolved and prefix-checked, every config
/// validated.
pub struct ComposedStrategy {
    pub name: String,
    pub slots: Vec<(String, Vec<Arc<dyn Component>>)>,
    pub config: HashMap<String, toml::Value>,
}

/// Composes a strategy document against the registry: every
/// component's type prefix must match its slot name, and every
/// component's `validate_config` must accept the strategy's shared
/// config. Returns all failures at once rather than stopping at the
/// first.
pub fn compose_strategy(
    document: &StrategyDocument,
    registry: &ComponentRegistry,
) -> Result<ComposedStrategy, Vec<String>> {
    let mut errors = Vec::new();
    let mut slots = Vec::new();

    let slot_order: Vec<String> = document
        .pipeline_order
        .clone()
        .unwrap_or_else(|| document.components.keys().cloned().collect());

    for slot in &slot_order {
        let Some(version_ids) = document.components.get(slot) else {
            errors.push(format!("slot {slot} has no components"));
            continue;
        };

        let Some(expected_type) = ComponentType::from_prefix(slot) else {
            errors.push(format!("slot {slot} does not map to a known component type"));
            continue;
        };

        let mut resolved = Vec::new();
        for version_id in version_ids {
            let Some((component_type, _, _)) = parse_version_id(version_id) else {
                errors.push(format!("malformed versionId {version_id}"));
                continue;
            };
            if component_type != expected_type {
                errors.push(format!(
                    "component {version_id} type does not match slot {slot}"
                ));
                continue;
            }
            let Some(component) = registry.get(component_type, version_id) else {
                errors.push(format!("component {version_id} not found in registry"));
                continue;
            };

            let config_value = toml::Value::Table(
                document
                    .config
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            );
            if let Err(e) = component.validate_config(&config_value) {
                errors.push(format!("{version_id} config invalid: {}", e.join(", ")));
                continue;
            }

            resolved.push(component);
        }
        slots.push((slot.clone(), resolved));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ComposedStrategy {
        name: document.name.clone(),
        slots,
        config: document.config.clone(),
    })
}

/// Runs every slot's components against `context`, keyed by
/// `(window_id, versionId)`.
pub fn execute_strategy(
    strategy: &ComposedStrategy,
    context: &WindowContext,
) -> HashMap<(String, String), ComponentResult> {
    let config_value = toml::Value::Table(
        strategy
            .config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );

    let mut results = HashMap::new();
    for (_, components) in &strategy.slots {
        for component in components {
            let meta = component.metadata();
            let result = component.evaluate(context, &config_value);
            if result.legacy_signal.is_some() && result.probability.is_none() {
                warn!(
                    version_id = %meta.version_id(),
                    "component returned legacy signal without a probability; deprecated path"
                );
            }
            results.insert((context.window_id.clone(), meta.version_id()), result);
        }
    }
    results
}

/// Turns probability-producing results into entry signals via the edge
/// rule. Suspicious edges (`> maxEdge`) are dropped, not emitted.
/// `surprise_active` raises the minimum edge required (never suppresses
/// a signal outright) when the symbol's volatility tracker reports a
/// surprise.
pub fn generate_edge_signals(
    strategy_id: &str,
    context: &WindowContext,
    results: &HashMap<(String, String), ComponentResult>,
    edge_config: &EdgeConfig,
    surprise_active: bool,
) -> Vec<Signal> {
    let Some(market_price) = context.market_price else {
        return Vec::new();
    };
    let min_edge = if surprise_active {
        edge_config.min_edge * edge_config.surprise_edge_multiplier
    } else {
        edge_config.min_edge
    };

    let mut signals = Vec::new();
    for ((window_id, version_id), result) in results {
        let Some(probability) = result.probability else {
            continue;
        };
        let edge = probability - market_price;
        if edge > edge_config.max_edge {
            warn!(version_id, edge, "suspicious edge rejected");
            continue;
        }
        if edge < min_edge {
            continue;
        }
        let mut signal = Signal::new(
            strategy_id,
            window_id.clone(),
            context.token_id_up.clone(),
            probability,
            market_price,
            context.market_context.clone(),
        );
        signal.direction = Direction::Long;
        signals.push(signal);
    }
    signals
}

#[derive(Debug, Clone)]
pub struct UpgradeDiff {
    pub slot: String,
    pub old_version_ids: Vec<String>,
    pub new_version_id: String,
}

/// Checks whether replacing a slot's components with a single new
/// versionId would succeed, without mutating `document`.
pub fn preview_upgrade(
    document: &StrategyDocument,
    registry: &ComponentRegistry,
    slot: &str,
    new_version_id: &str,
) -> Result<UpgradeDiff, String> {
    let (component_type, _, _) =
        parse_version_id(new_version_id).ok_or_else(|| format!("malformed versionId {new_version_id}"))?;
    if ComponentType::from_prefix(slot) != Some(component_type) {
        return Err(format!("{new_version_id} does not match slot {slot}"));
    }
    let component = registry
        .get(component_type, new_version_id)
        .ok_or_else(|| format!("component {new_version_id} not found"))?;

    let config_value = toml::Value::Table(
        document
            .config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    component
        .validate_config(&config_value)
        .map_err(|e| format!("config invalid for {new_version_id}: {}", e.join(", ")))?;

    let old_version_ids = document.components.get(slot).cloned().unwrap_or_default();
    Ok(UpgradeDiff {
        slot: slot.to_string(),
        old_version_ids,
        new_version_id: new_version_id.to_string(),
    })
}

/// Applies a previously-previewed upgrade by mutating `document` in
/// place.
pub fn apply_upgrade(document: &mut StrategyDocument, diff: &UpgradeDiff) {
    document
        .components
        .insert(diff.slot.clone(), vec![diff.new_version_id.clone()]);
}

#[derive(Debug, Clone)]
pub struct BatchUpgradeOutcome {
    pub strategy_name: String,
    pub result: Result<UpgradeDiff, String>,
}

/// Applies the same slot/versionId upgrade across many strategy
/// documents, in place, never aborting the batch on a single failure.
pub fn batch_upgrade(
    documents: &mut [StrategyDocument],
    registry: &ComponentRegistry,
    slot: &str,
    new_version_id: &str,
) -> Vec<BatchUpgradeOutcome> {
    let mut outcomes = Vec::with_capacity(documents.len());
    for document in documents.iter_mut() {
        let result = preview_upgrade(document, registry, slot, new_version_id);
        if let Ok(diff) = &result {
            apply_upgrade(document, diff);
        }
        outcomes.push(BatchUpgradeOutcome {
            strategy_name: document.name.clone(),
            result,
        });
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbabilityComponent {
        meta: ComponentMetadata,
        probability: f64,
    }

    impl Component for FixedProbabilityComponent {
        fn metadata(&self) -> ComponentMetadata {
            self.meta.clone()
        }
        fn validate_config(&self, _config: &toml::Value) -> Result<(), Vec<String>> {
            Ok(())
        }
        fn evaluate(&self, _context: &WindowContext, _config: &toml::Value) -> ComponentResult {
            ComponentResult {
                probability: Some(self.probability),
                legacy_signal: None,
            }
        }
    }

    fn registry_with_prob_component(name: &str, probability: f64) -> ComponentRegistry {
        let registry = ComponentRegistry::new();
        registry.register(Arc::new(FixedProbabilityComponent {
            meta: ComponentMetadata {
                name: name.to_string(),
                version: 1,
                component_type: ComponentType::Probability,
            },
            probability,
        }));
        registry
    }

    fn sample_document(version_id: &str) -> StrategyDocument {
        let mut components = HashMap::new();
        components.insert("prob".to_string(), vec![version_id.to_string()]);
        StrategyDocument {
            name: "test-strategy".to_string(),
            components,
            config: HashMap::new(),
            pipeline_order: None,
        }
    }

    fn sample_context(window_id: &str, market_price: f64) -> WindowContext {
        WindowContext {
            oracle_price: Some(95_000.0),
            reference_price: Some(94_500.0),
            market_price: Some(market_price),
            time_to_expiry_ms: 300_000,
            symbol: "btc".to_string(),
            window_id: window_id.to_string(),
            token_id_up: "up-token".to_string(),
            token_id_down: Some("down-token".to_string()),
            market_context: MarketContext::default(),
        }
    }

    #[test]
    fn version_id_parses_prefix_name_version() {
        assert_eq!(
            parse_version_id("prob-blackscholes-v1"),
            Some((ComponentType::Probability, "blackscholes".to_string(), 1))
        );
        assert_eq!(parse_version_id("garbage"), None);
    }

    #[test]
    fn compose_rejects_slot_type_mismatch() {
        let registry = registry_with_prob_component("blackscholes", 0.7);
        let mut document = sample_document("prob-blackscholes-v1");
        document
            .components
            .insert("sizing".to_string(), vec!["prob-blackscholes-v1".to_string()]);
        let result = compose_strategy(&document, &registry);
        assert!(result.is_err());
    }

    #[test]
    fn compose_and_execute_emits_edge_signal() {
        let registry = registry_with_prob_component("blackscholes", 0.70);
        let document = sample_document("prob-blackscholes-v1");
        let strategy = compose_strategy(&document, &registry).unwrap();

        let context = sample_context("btc-15m-900", 0.55);
        let results = execute_strategy(&strategy, &context);
        let signals = generate_edge_signals("test-strategy", &context, &results, &EdgeConfig::default(), false);

        assert_eq!(signals.len(), 1);
        assert!((signals[0].edge - 0.15).abs() < 1e-9);
    }

    #[test]
    fn suspicious_edge_is_rejected() {
        let registry = registry_with_prob_component("blackscholes", 0.95);
        let document = sample_document("prob-blackscholes-v1");
        let strategy = compose_strategy(&document, &registry).unwrap();

        let context = sample_context("btc-15m-900", 0.10);
        let results = execute_strategy(&strategy, &context);
        let signals = generate_edge_signals("test-strategy", &context, &results, &EdgeConfig::default(), false);

        assert!(signals.is_empty());
    }

    #[test]
    fn no_signal_below_min_edge() {
        let registry = registry_with_prob_component("blackscholes", 0.52);
        let document = sample_document("prob-blackscholes-v1");
        let strategy = compose_strategy(&document, &registry).unwrap();

        let context = sample_context("btc-15m-900", 0.50);
        let results = execute_strategy(&strategy, &context);
        let signals = generate_edge_signals("test-strategy", &context, &results, &EdgeConfig::default(), false);

        assert!(signals.is_empty());
    }

    #[test]
    fn surprise_raises_min_edge_without_suppressing() {
        // edge of 0.15 clears the default min_edge of 0.10...
        let registry = registry_with_prob_component("blackscholes", 0.70);
        let document = sample_document("prob-blackscholes-v1");
        let strategy = compose_strategy(&document, &registry).unwrap();
        let context = sample_context("btc-15m-900", 0.55);
        let results = execute_strategy(&strategy, &context);

        let calm = generate_edge_signals("test-strategy", &context, &results, &EdgeConfig::default(), false);
        assert_eq!(calm.len(), 1);

        // ...but not the surprise-multiplied bar of 0.20.
        let surprised = generate_edge_signals("test-strategy", &context, &results, &EdgeConfig::default(), true);
        assert!(surprised.is_empty());
    }

    #[test]
    fn preview_and_apply_upgrade_roundtrip() {
        let registry = registry_with_prob_component("blackscholes", 0.7);
        registry.register(Arc::new(FixedProbabilityComponent {
            meta: ComponentMetadata {
                name: "blackscholes".to_string(),
                version: 2,
                component_type: ComponentType::Probability,
            },
            probability: 0.8,
        }));
        let mut document = sample_document("prob-blackscholes-v1");

        let diff = preview_upgrade(&document, &registry, "prob", "prob-blackscholes-v2").unwrap();
        assert_eq!(diff.old_version_ids, vec!["prob-blackscholes-v1".to_string()]);

        apply_upgrade(&mut document, &diff);
        assert_eq!(
            document.components.get("prob").unwrap(),
            &vec!["prob-blackscholes-v2".to_string()]
        );
    }

    #[test]
    fn batch_upgrade_never_aborts_on_single_failure() {
        let registry = registry_with_prob_component("blackscholes", 0.7);
        let mut documents = vec![
            sample_document("prob-blackscholes-v1"),
            sample_document("prob-missing-v9"),
        ];
        let outcomes = batch_upgrade(&mut documents, &registry, "prob", "prob-blackscholes-v1");
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_ok());
    }
}
