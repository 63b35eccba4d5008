//! Risk configuration: factor weights, critical factors, combination rules.
//!
//! The whole configuration lives in a single immutable snapshot that can be
//! hot-reloaded. Scoring requests read one snapshot for their entire
//! evaluation and never observe a partially applied update.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::rules::factor;
use crate::RiskLevel;

/// Factor severity band, used for reporting and triage ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A named risk factor definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFactor {
    pub code: String,
    pub weight: f64,
    pub severity: Severity,
    /// Critical factors unconditionally force the highest risk classification.
    pub critical: bool,
}

impl RiskFactor {
    pub fn new(code: &str, weight: f64, severity: Severity) -> Self {
        Self {
            code: code.to_string(),
            weight,
            severity,
            critical: false,
        }
    }

    pub fn critical(code: &str, weight: f64) -> Self {
        Self {
            code: code.to_string(),
            weight,
            severity: Severity::High,
            critical: true,
        }
    }
}

/// Compound rule: when every trigger factor is present, the result factor is
/// added to the set. An optional weight override applies to the result factor
/// for that request only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinationRule {
    pub trigger_factors: Vec<String>,
    pub result_factor: String,
    pub weight_override: Option<f64>,
    pub enabled: bool,
}

impl CombinationRule {
    pub fn new(triggers: &[&str], result: &str) -> Self {
        Self {
            trigger_factors: triggers.iter().map(|s| s.to_string()).collect(),
            result_factor: result.to_string(),
            weight_override: None,
            enabled: true,
        }
    }

    pub fn with_weight_override(mut self, weight: f64) -> Self {
        self.weight_override = Some(weight);
        self
    }
}

/// Thresholds consumed by the rule evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleThresholds {
    /// Base-currency amount above which `HIGH_AMOUNT` fires.
    pub high_amount: f64,
    /// Base-currency amount below which `AMOUNT_TOO_LOW` fires.
    pub low_amount: f64,
    /// Original-currency amount at or above which `HIGH_FOREIGN_AMOUNT` fires.
    pub high_foreign_amount: f64,
    /// Last hour (inclusive, from midnight) of the night-time window.
    pub night_end_hour: u32,
    /// Multiplier over the 30-day average that flags `AMOUNT_DEVIATION_HIGH`.
    pub deviation_multiplier: f64,
    /// Transactions in the last hour above which `HIGH_FREQUENCY` fires.
    pub max_tx_per_hour: u32,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            high_amount: 12_000.0,
            low_amount: 50.0,
            high_foreign_amount: 200.0,
            night_end_hour: 5,
            deviation_multiplier: 5.0,
            max_tx_per_hour: 5,
        }
    }
}

/// Thresholds consumed by the score aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringThresholds {
    /// Score at or above which the transaction classifies as high risk.
    pub high_score: f64,
    /// Score at or above which the transaction classifies as medium risk.
    pub medium_score: f64,
    /// Multiplier applied to the negative part of the anomaly score.
    pub anomaly_scale: f64,
    /// Sentinel score assigned when a critical factor short-circuits scoring.
    pub critical_sentinel: f64,
    pub probability_floor: f64,
    pub probability_scale: f64,
    pub min_probability: f64,
    pub max_probability: f64,
}

impl Default for ScoringThresholds {
    fn default() -> Self {
        Self {
            high_score: 10.0,
            medium_score: 5.0,
            anomaly_scale: 10.0,
            critical_sentinel: 999.0,
            probability_floor: 0.35,
            probability_scale: 15.0,
            min_probability: 0.01,
            max_probability: 0.99,
        }
    }
}

/// One consistent snapshot of the engine's business configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Currency all amounts are normalized into before scoring.
    pub base_currency: String,
    pub factors: HashMap<String, RiskFactor>,
    /// Evaluated in list order, single pass, no transitive closure.
    pub rules: Vec<CombinationRule>,
    pub rule_thresholds: RuleThresholds,
    pub scoring: ScoringThresholds,
    pub high_risk_countries: HashSet<String>,
    pub medium_risk_countries: HashSet<String>,
    /// Expected outlier fraction used when (re)training the anomaly model.
    pub contamination: f64,
}

impl RiskConfig {
    /// Weight for a factor code; unresolved codes score as zero, never error.
    pub fn weight_of(&self, code: &str) -> f64 {
        self.factors.get(code).map_or(0.0, |f| f.weight)
    }

    pub fn is_critical(&self, code: &str) -> bool {
        self.factors.get(code).is_some_and(|f| f.critical)
    }

    pub fn add_factor(&mut self, factor: RiskFactor) {
        self.factors.insert(factor.code.clone(), factor);
    }

    pub fn country_risk(&self, iso2: &str) -> RiskLevel {
        if self.high_risk_countries.contains(iso2) {
            RiskLevel::High
        } else if self.medium_risk_countries.contains(iso2) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        let mut factors = HashMap::new();
        for f in [
            RiskFactor::new(factor::HIGH_AMOUNT, 4.0, Severity::High),
            RiskFactor::new(factor::AMOUNT_TOO_LOW, 1.0, Severity::Low),
            RiskFactor::new(factor::FOREIGN_CURRENCY, 1.5, Severity::Low),
            RiskFactor::new(factor::HIGH_FOREIGN_AMOUNT, 2.5, Severity::Medium),
            RiskFactor::new(factor::NIGHT_TIME, 2.0, Severity::Medium),
            RiskFactor::new(factor::COUNTRY_NOT_PROVIDED, 1.5, Severity::Low),
            RiskFactor::new(factor::HIGH_RISK_COUNTRY, 6.0, Severity::High),
            RiskFactor::new(factor::MEDIUM_RISK_COUNTRY, 3.0, Severity::Medium),
            RiskFactor::new(factor::LOW_RISK_COUNTRY, 0.0, Severity::Low),
            RiskFactor::new(factor::AMOUNT_DEVIATION_HIGH, 3.0, Severity::Medium),
            RiskFactor::new(factor::HIGH_FREQUENCY, 3.0, Severity::Medium),
            RiskFactor::critical(factor::MERCHANT_NOT_ALLOWED, 10.0),
            RiskFactor::new(factor::MCC_NOT_ALLOWED, 6.0, Severity::High),
            RiskFactor::new(factor::MERCHANT_HIGH_RISK, 4.0, Severity::High),
            RiskFactor::new(factor::ANOMALY_DETECTED, 2.0, Severity::Medium),
            RiskFactor::critical(factor::SCREENING_FULL_MATCH, 10.0),
            RiskFactor::new(factor::SCREENING_PARTIAL_MATCH, 5.0, Severity::High),
            RiskFactor::new(factor::SCREENING_ERROR, 0.0, Severity::Medium),
            RiskFactor::new(factor::HIGH_AMOUNT_SUSPICIOUS_TIME, 3.0, Severity::High),
        ] {
            factors.insert(f.code.clone(), f);
        }

        Self {
            base_currency: "DOP".to_string(),
            factors,
            rules: vec![CombinationRule::new(
                &[factor::HIGH_AMOUNT, factor::NIGHT_TIME],
                factor::HIGH_AMOUNT_SUSPICIOUS_TIME,
            )],
            rule_thresholds: RuleThresholds::default(),
            scoring: ScoringThresholds::default(),
            high_risk_countries: ["VE", "HT", "NI", "CU", "KP", "IR", "SY"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            medium_risk_countries: ["PA", "BR", "MX"].iter().map(|s| s.to_string()).collect(),
            contamination: 0.03,
        }
    }
}

/// Process-wide configuration holder. Updates publish a whole new snapshot
/// via atomic pointer swap; readers take one `Arc` per request.
pub struct ConfigStore {
    current: ArcSwap<RiskConfig>,
}

impl ConfigStore {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
        }
    }

    /// One consistent snapshot for the duration of a request.
    pub fn snapshot(&self) -> Arc<RiskConfig> {
        self.current.load_full()
    }

    /// Replace the live configuration. In-flight requests keep the snapshot
    /// they already loaded.
    pub fn install(&self, config: RiskConfig) {
        tracing::info!(
            factors = config.factors.len(),
            rules = config.rules.len(),
            "risk configuration installed"
        );
        self.current.store(Arc::new(config));
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(RiskConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_code_scores_zero() {
        let config = RiskConfig::default();
        assert_eq!(config.weight_of("NO_SUCH_FACTOR"), 0.0);
        assert!(!config.is_critical("NO_SUCH_FACTOR"));
    }

    #[test]
    fn test_default_critical_set() {
        let config = RiskConfig::default();
        assert!(config.is_critical(factor::SCREENING_FULL_MATCH));
        assert!(config.is_critical(factor::MERCHANT_NOT_ALLOWED));
        assert!(!config.is_critical(factor::NIGHT_TIME));
    }

    #[test]
    fn test_country_risk_lookup() {
        let config = RiskConfig::default();
        assert_eq!(config.country_risk("VE"), RiskLevel::High);
        assert_eq!(config.country_risk("PA"), RiskLevel::Medium);
        assert_eq!(config.country_risk("US"), RiskLevel::Low);
    }

    #[test]
    fn test_snapshot_isolated_from_reload() {
        let store = ConfigStore::default();
        let before = store.snapshot();

        let mut updated = RiskConfig::default();
        updated.add_factor(RiskFactor::new("NEW_FACTOR", 7.5, Severity::High));
        store.install(updated);

        // The earlier snapshot is unaffected by the reload.
        assert_eq!(before.weight_of("NEW_FACTOR"), 0.0);
        assert_eq!(store.snapshot().weight_of("NEW_FACTOR"), 7.5);
    }

    #[test]
    fn test_config_serializes() {
        let config = RiskConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: RiskConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.base_currency, "DOP");
        assert_eq!(back.rules.len(), 1);
    }
}
