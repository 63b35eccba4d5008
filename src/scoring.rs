//! Final score aggregation.
//!
//! Factors collected by the rule evaluator, the combination engine, the
//! anomaly detector, and screening are combined into one classified outcome:
//! critical check, then weighted scoring, then anomaly adjustment, then
//! classification. Every path terminates in a classified outcome.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::RiskConfig;
use crate::rules::FactorSet;
use crate::RiskLevel;

/// Classified scoring outcome, prior to decision assembly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreOutcome {
    pub risk_level: RiskLevel,
    pub is_fraud: bool,
    /// Total score after anomaly adjustment; the critical sentinel when a
    /// critical factor short-circuited weighting.
    pub score: f64,
    pub fraud_probability: f64,
    /// Whether a critical factor forced the classification.
    pub critical_hit: bool,
}

/// Combine factor weights, the critical-factor override, and the anomaly
/// score into a final risk level, fraud flag, and calibrated probability.
///
/// `overrides` holds per-request weight overrides from combination rules;
/// they are consulted before the shared weight table and discarded with the
/// request.
pub fn aggregate(
    factors: &FactorSet,
    overrides: &HashMap<String, f64>,
    anomaly_score: f64,
    config: &RiskConfig,
) -> ScoreOutcome {
    let t = &config.scoring;

    // Critical check: any critical factor forces the highest classification
    // and skips weighting entirely.
    if let Some(code) = factors.iter().find(|c| config.is_critical(c)) {
        debug!(factor = code, "critical factor short-circuit");
        return ScoreOutcome {
            risk_level: RiskLevel::High,
            is_fraud: true,
            score: t.critical_sentinel,
            fraud_probability: probability(t.critical_sentinel, config),
            critical_hit: true,
        };
    }

    // Weighted scoring over the factor set; unresolved codes weigh zero.
    let mut score: f64 = factors
        .iter()
        .map(|code| overrides.get(code).copied().unwrap_or_else(|| config.weight_of(code)))
        .sum();

    // Anomaly adjustment: only the negative part of the continuous score
    // contributes, scaled into factor-weight units.
    if anomaly_score < 0.0 {
        score += anomaly_score.abs() * t.anomaly_scale;
    }

    let (risk_level, is_fraud) = if score >= t.high_score {
        (RiskLevel::High, true)
    } else if score >= t.medium_score {
        (RiskLevel::Medium, false)
    } else {
        (RiskLevel::Low, false)
    };

    ScoreOutcome {
        risk_level,
        is_fraud,
        score,
        fraud_probability: probability(score, config),
        critical_hit: false,
    }
}

/// Calibrated fraud probability: monotonically increasing in the score and
/// clamped at construction.
pub fn probability(score: f64, config: &RiskConfig) -> f64 {
    let t = &config.scoring;
    (t.probability_floor + score / t.probability_scale).clamp(t.min_probability, t.max_probability)
}

/// Message and advice are a pure function of (is_fraud, risk_level).
pub fn decision_texts(is_fraud: bool, risk_level: RiskLevel) -> (&'static str, &'static str) {
    if is_fraud {
        (
            "ALERT: Potentially fraudulent transaction.",
            "Manual review and customer verification required.",
        )
    } else if risk_level == RiskLevel::Medium {
        (
            "Medium risk transaction.",
            "Allow but closely monitor future activity.",
        )
    } else {
        (
            "Transaction within normal behavior patterns.",
            "Automatically approved.",
        )
    }
}
