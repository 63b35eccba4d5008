//! Business rule evaluation.
//!
//! Rules are independent predicates over the normalized transaction, the
//! customer's history profile, and the merchant context. Each rule appends at
//! most one factor code; no rule removes a code added by another. Evaluation
//! is deterministic and side-effect free.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::RiskConfig;
use crate::{CustomerRiskProfile, MerchantContext, NormalizedTransaction, RiskLevel};

/// Well-known factor codes emitted by the evaluator.
pub mod factor {
    pub const HIGH_AMOUNT: &str = "HIGH_AMOUNT";
    pub const AMOUNT_TOO_LOW: &str = "AMOUNT_TOO_LOW";
    pub const FOREIGN_CURRENCY: &str = "FOREIGN_CURRENCY";
    pub const HIGH_FOREIGN_AMOUNT: &str = "HIGH_FOREIGN_AMOUNT";
    pub const NIGHT_TIME: &str = "NIGHT_TIME";
    pub const COUNTRY_NOT_PROVIDED: &str = "COUNTRY_NOT_PROVIDED";
    pub const HIGH_RISK_COUNTRY: &str = "HIGH_RISK_COUNTRY";
    pub const MEDIUM_RISK_COUNTRY: &str = "MEDIUM_RISK_COUNTRY";
    pub const LOW_RISK_COUNTRY: &str = "LOW_RISK_COUNTRY";
    pub const AMOUNT_DEVIATION_HIGH: &str = "AMOUNT_DEVIATION_HIGH";
    pub const HIGH_FREQUENCY: &str = "HIGH_FREQUENCY";
    pub const MERCHANT_NOT_ALLOWED: &str = "MERCHANT_NOT_ALLOWED";
    pub const MCC_NOT_ALLOWED: &str = "MCC_NOT_ALLOWED";
    pub const MERCHANT_HIGH_RISK: &str = "MERCHANT_HIGH_RISK";
    pub const ANOMALY_DETECTED: &str = "ANOMALY_DETECTED";
    pub const SCREENING_FULL_MATCH: &str = "SCREENING_FULL_MATCH";
    pub const SCREENING_PARTIAL_MATCH: &str = "SCREENING_PARTIAL_MATCH";
    pub const SCREENING_ERROR: &str = "SCREENING_ERROR";
    pub const HIGH_AMOUNT_SUSPICIOUS_TIME: &str = "HIGH_AMOUNT_SUSPICIOUS_TIME";
}

/// Ordered, deduplicating, push-only set of factor codes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorSet {
    codes: Vec<String>,
}

impl FactorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a code unless already present. Returns whether it was added.
    pub fn push(&mut self, code: &str) -> bool {
        if self.contains(code) {
            return false;
        }
        self.codes.push(code.to_string());
        true
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.iter().any(|c| c == code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.codes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.codes
    }

    pub fn as_slice(&self) -> &[String] {
        &self.codes
    }
}

/// Derive base factors from transaction attributes, customer history, and
/// merchant context.
pub fn evaluate(
    tx: &NormalizedTransaction,
    profile: &CustomerRiskProfile,
    merchant: &MerchantContext,
    config: &RiskConfig,
) -> FactorSet {
    let mut factors = FactorSet::new();
    let t = &config.rule_thresholds;
    let currency = tx.currency_original.trim().to_uppercase();

    // Amount rules, on the normalized base-currency amount.
    if tx.amount_base > t.high_amount {
        factors.push(factor::HIGH_AMOUNT);
    }
    if tx.amount_base < t.low_amount {
        factors.push(factor::AMOUNT_TOO_LOW);
    }

    // Currency rules. The foreign-amount threshold applies to the amount in
    // its original currency units.
    if currency != config.base_currency {
        factors.push(factor::FOREIGN_CURRENCY);
        if tx.amount_original >= t.high_foreign_amount {
            factors.push(factor::HIGH_FOREIGN_AMOUNT);
        }
    }

    // Time-of-day rule.
    if tx.hour_of_day <= t.night_end_hour {
        factors.push(factor::NIGHT_TIME);
    }

    // Geography always yields exactly one outcome.
    match tx.counterparty_country.as_deref().map(str::trim) {
        None | Some("") => {
            factors.push(factor::COUNTRY_NOT_PROVIDED);
        }
        Some(country) => {
            let code = match config.country_risk(&country.to_uppercase()) {
                RiskLevel::High => factor::HIGH_RISK_COUNTRY,
                RiskLevel::Medium => factor::MEDIUM_RISK_COUNTRY,
                RiskLevel::Low => factor::LOW_RISK_COUNTRY,
            };
            factors.push(code);
        }
    }

    // History rules.
    if let Some(avg) = profile.avg_amount_30d {
        if avg > 0.0 && tx.amount_base > avg * t.deviation_multiplier {
            factors.push(factor::AMOUNT_DEVIATION_HIGH);
        }
    }
    if profile.tx_1h > t.max_tx_per_hour {
        factors.push(factor::HIGH_FREQUENCY);
    }

    // Merchant rules. Absent context stays neutral.
    if merchant.merchant_allowed == Some(false) {
        factors.push(factor::MERCHANT_NOT_ALLOWED);
    }
    if merchant.mcc_allowed == Some(false) {
        factors.push(factor::MCC_NOT_ALLOWED);
    }
    if merchant.merchant_risk == Some(RiskLevel::High) {
        factors.push(factor::MERCHANT_HIGH_RISK);
    }

    factors
}

/// Apply the configured combination rules in list order, single pass.
///
/// A rule whose triggers are all present adds its result factor to the set.
/// Weight overrides are recorded in the returned map for this request only
/// and never written back to the shared configuration. Rules are not
/// re-evaluated after the pass, so there is no transitive closure and no
/// possibility of cycles.
pub fn apply_combination_rules(factors: &mut FactorSet, config: &RiskConfig) -> HashMap<String, f64> {
    let mut overrides = HashMap::new();

    for rule in &config.rules {
        if !rule.enabled || rule.trigger_factors.is_empty() {
            continue;
        }
        if rule.trigger_factors.iter().all(|f| factors.contains(f)) {
            factors.push(&rule.result_factor);
            if let Some(weight) = rule.weight_override {
                overrides.insert(rule.result_factor.clone(), weight);
            }
        }
    }

    overrides
}
