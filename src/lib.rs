//! # Transaction Risk Engine
//!
//! An authorization-time risk decision engine for financial transactions.
//!
//! ## Features
//!
//! - **Currency Normalization**: TTL-cached FX rates with single-flight
//!   refresh and conservative fallbacks
//! - **Business Rules**: Deterministic factor derivation from amount,
//!   currency, time, geography, customer history, and merchant context
//! - **Combination Rules**: Configurable compound factors with per-request
//!   weight overrides
//! - **Anomaly Detection**: Isolation-forest outlier scoring over
//!   (normalized amount, hour-of-day) with atomic model swap
//! - **Watchlist Screening**: Approximate counterparty name matching with
//!   none/partial/full classification
//! - **Calibrated Decisions**: Weighted scoring with critical-factor
//!   short-circuit and a clamped fraud probability
//!
//! Every external failure degrades to a safer, more conservative decision;
//! the engine has no fatal error class and always produces a classified
//! [`RiskDecision`].

pub mod anomaly;
pub mod config;
pub mod currency;
pub mod rules;
pub mod screening;
pub mod scoring;

pub use anomaly::{AnomalyDetector, ForestParams, IsolationForest, OutlierModel};
pub use config::{CombinationRule, ConfigStore, RiskConfig, RiskFactor, Severity};
pub use currency::{Conversion, RateCache, RatePair, RateSource, RateTable, RateType};
pub use rules::{factor, FactorSet};
pub use screening::{
    CandidateSource, MatchType, ScreeningAction, ScreeningCandidate, ScreeningResult,
    WatchlistMatcher,
};
pub use scoring::ScoreOutcome;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Collaborator failure. Always transient from the engine's point of view:
/// every variant is handled by a conservative fallback, never by aborting
/// the decision.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("rate source unavailable: {0}")]
    RateSource(String),

    #[error("history lookup failed: {0}")]
    History(String),

    #[error("merchant lookup failed: {0}")]
    Merchant(String),

    #[error("screening corpus unavailable: {0}")]
    Screening(String),

    #[error("decision persistence failed: {0}")]
    Persistence(String),
}

/// Final risk classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
        }
    }
}

/// A transaction after currency normalization. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub amount_original: f64,
    pub currency_original: String,
    /// Amount in the base settlement currency. Equal to `amount_original`
    /// when no conversion was possible; see [`currency::Conversion`].
    pub amount_base: f64,
    /// Hour of day, 0-23, taken from the request timestamp as supplied by
    /// the upstream adapter.
    pub hour_of_day: u32,
    pub counterparty_country: Option<String>,
}

/// Customer history snapshot, derived per request by the history
/// collaborator. Read-only input; the engine does not cache it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerRiskProfile {
    pub tx_1h: u32,
    pub tx_24h: u32,
    pub tx_7d: u32,
    pub avg_amount_30d: Option<f64>,
}

impl CustomerRiskProfile {
    /// Profile used when the customer is unknown or history is unavailable.
    pub fn neutral() -> Self {
        Self {
            tx_1h: 0,
            tx_24h: 0,
            tx_7d: 0,
            avg_amount_30d: None,
        }
    }
}

/// Merchant and MCC context. `None` fields stay neutral in rule evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantContext {
    pub merchant_allowed: Option<bool>,
    pub mcc_allowed: Option<bool>,
    pub merchant_risk: Option<RiskLevel>,
    pub mcc_risk: Option<RiskLevel>,
}

impl MerchantContext {
    pub fn neutral() -> Self {
        Self {
            merchant_allowed: None,
            mcc_allowed: None,
            merchant_risk: None,
            mcc_risk: None,
        }
    }
}

/// Identity inputs for watchlist screening and audit hashing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScreeningQuery {
    pub counterparty_name: Option<String>,
    pub customer_ref: Option<String>,
}

/// Incoming authorization request as delivered by the upstream adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub amount: f64,
    pub currency: String,
    /// Transaction time. The night-time rule reads the hour from this value
    /// as supplied; adapters that want local-time semantics must shift the
    /// timestamp before submitting.
    pub timestamp: DateTime<Utc>,
    pub counterparty_country: Option<String>,
    pub counterparty_name: Option<String>,
    pub customer_ref: Option<String>,
    pub merchant_ref: Option<String>,
}

/// Customer history collaborator.
pub trait HistoryProvider: Send + Sync {
    fn fetch_history(
        &self,
        customer_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<CustomerRiskProfile, SourceError>;
}

/// Merchant context collaborator.
pub trait MerchantProvider: Send + Sync {
    fn fetch_merchant_context(&self, merchant_ref: &str) -> Result<MerchantContext, SourceError>;
}

/// Audit/compliance sink. Failures here never retroactively change a
/// decision already returned to the caller.
pub trait DecisionSink: Send + Sync {
    fn persist_decision(
        &self,
        transaction: &NormalizedTransaction,
        decision: &RiskDecision,
    ) -> Result<(), SourceError>;
}

/// The engine's external collaborators.
pub struct Collaborators {
    pub rates: Arc<dyn RateSource>,
    pub history: Arc<dyn HistoryProvider>,
    pub merchants: Arc<dyn MerchantProvider>,
    pub candidates: Arc<dyn CandidateSource>,
    pub sink: Arc<dyn DecisionSink>,
}

/// Short non-reversible customer identifier for audit records.
pub fn customer_hash(customer_ref: Option<&str>) -> String {
    match customer_ref {
        None => "anon".to_string(),
        Some(c) => {
            let digest = Sha256::digest(c.as_bytes());
            let mut hex = String::with_capacity(16);
            for byte in digest.iter().take(8) {
                let _ = write!(hex, "{byte:02x}");
            }
            hex
        }
    }
}

/// Final fraud decision for one transaction. Never mutated after creation;
/// persistence is the collaborator's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDecision {
    pub decision_id: Uuid,
    pub risk_level: RiskLevel,
    pub is_fraud: bool,
    pub fraud_probability: f64,
    pub factors: Vec<String>,
    pub score: f64,
    pub anomaly_score: f64,
    pub anomaly_flag: bool,
    pub screening: Option<ScreeningResult>,
    pub screening_action: ScreeningAction,
    pub message: String,
    pub advice: String,
    pub customer_hash: String,
    pub timestamp: DateTime<Utc>,
}

impl RiskDecision {
    /// Whether the transaction needs a human in the loop.
    pub fn requires_manual_review(&self) -> bool {
        self.is_fraud || self.screening_action != ScreeningAction::None
    }

    pub fn is_blocked(&self) -> bool {
        self.screening_action == ScreeningAction::AutomaticBlockAndReport
    }

    /// Export as JSON for audit sinks.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// The risk decision engine.
///
/// One instance is shared by all request handlers. Each evaluation is
/// independent: the only shared state is the rate table, the anomaly model,
/// and the risk configuration, each read as an atomic snapshot and replaced
/// only by whole-structure swap.
pub struct RiskEngine {
    config: ConfigStore,
    rates: RateCache,
    anomaly: AnomalyDetector,
    matcher: WatchlistMatcher,
    history: Arc<dyn HistoryProvider>,
    merchants: Arc<dyn MerchantProvider>,
    candidates: Arc<dyn CandidateSource>,
    sink: Arc<dyn DecisionSink>,
}

impl RiskEngine {
    /// Create an engine with the default configuration.
    pub fn new(collaborators: Collaborators) -> Self {
        Self::with_config(RiskConfig::default(), collaborators)
    }

    /// Create an engine with a custom configuration snapshot.
    pub fn with_config(config: RiskConfig, collaborators: Collaborators) -> Self {
        let contamination = config.contamination;
        Self {
            config: ConfigStore::new(config),
            rates: RateCache::new(collaborators.rates),
            anomaly: AnomalyDetector::new(ForestParams {
                contamination,
                ..ForestParams::default()
            }),
            matcher: WatchlistMatcher::new(),
            history: collaborators.history,
            merchants: collaborators.merchants,
            candidates: collaborators.candidates,
            sink: collaborators.sink,
        }
    }

    /// Configuration store, for hot reloads.
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Rate cache, for status inspection.
    pub fn rates(&self) -> &RateCache {
        &self.rates
    }

    /// Retrain the anomaly model off the request path and publish it
    /// atomically.
    pub fn retrain_anomaly(&self, samples: &[[f64; 2]]) {
        self.anomaly.retrain(samples);
    }

    /// Drive the full pipeline for an incoming authorization request:
    /// normalize the amount, gather history and merchant context (degrading
    /// to neutral on lookup failure), evaluate, and persist the decision.
    pub fn process(&self, request: &AuthorizationRequest) -> RiskDecision {
        let config = self.config.snapshot();

        let table = self.rates.get_rate_table();
        let conversion =
            currency::convert(request.amount, &request.currency, &config.base_currency, &table);

        let tx = NormalizedTransaction {
            amount_original: conversion.amount_original,
            currency_original: conversion.currency_original.clone(),
            amount_base: conversion.amount_base,
            hour_of_day: request.timestamp.hour(),
            counterparty_country: request.counterparty_country.clone(),
        };

        let profile = match &request.customer_ref {
            Some(customer) => self
                .history
                .fetch_history(customer, request.timestamp)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "history lookup failed, proceeding with neutral profile");
                    CustomerRiskProfile::neutral()
                }),
            None => CustomerRiskProfile::neutral(),
        };

        let merchant = match &request.merchant_ref {
            Some(merchant_ref) => self
                .merchants
                .fetch_merchant_context(merchant_ref)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "merchant lookup failed, proceeding with neutral context");
                    MerchantContext::neutral()
                }),
            None => MerchantContext::neutral(),
        };

        let query = ScreeningQuery {
            counterparty_name: request.counterparty_name.clone(),
            customer_ref: request.customer_ref.clone(),
        };

        let decision = self.evaluate_snapshot(&config, &tx, &profile, &merchant, &query);

        if let Err(e) = self.sink.persist_decision(&tx, &decision) {
            // The decision stands; a sink failure is an audit gap, not a
            // scoring failure.
            warn!(error = %e, decision_id = %decision.decision_id, "failed to persist decision");
        }

        decision
    }

    /// Evaluate a normalized transaction against one configuration
    /// snapshot. Synchronous and side-effect-free beyond reading the shared
    /// rate table, anomaly model, and configuration.
    pub fn evaluate(
        &self,
        tx: &NormalizedTransaction,
        profile: &CustomerRiskProfile,
        merchant: &MerchantContext,
        query: &ScreeningQuery,
    ) -> RiskDecision {
        let config = self.config.snapshot();
        self.evaluate_snapshot(&config, tx, profile, merchant, query)
    }

    fn evaluate_snapshot(
        &self,
        config: &RiskConfig,
        tx: &NormalizedTransaction,
        profile: &CustomerRiskProfile,
        merchant: &MerchantContext,
        query: &ScreeningQuery,
    ) -> RiskDecision {
        let mut factors = rules::evaluate(tx, profile, merchant, config);

        let (screening, screening_action) = self.run_screening(query, &mut factors);

        let (anomaly_score, anomaly_flag) = self.anomaly.score(tx.amount_base, tx.hour_of_day);
        if anomaly_flag {
            factors.push(factor::ANOMALY_DETECTED);
        }

        let overrides = rules::apply_combination_rules(&mut factors, config);
        let outcome = scoring::aggregate(&factors, &overrides, anomaly_score, config);
        let (message, advice) = scoring::decision_texts(outcome.is_fraud, outcome.risk_level);

        debug!(
            risk_level = %outcome.risk_level,
            score = outcome.score,
            factors = factors.len(),
            anomaly_flag,
            "transaction classified"
        );

        RiskDecision {
            decision_id: Uuid::new_v4(),
            risk_level: outcome.risk_level,
            is_fraud: outcome.is_fraud,
            fraud_probability: outcome.fraud_probability,
            factors: factors.into_vec(),
            score: outcome.score,
            anomaly_score,
            anomaly_flag,
            screening,
            screening_action,
            message: message.to_string(),
            advice: advice.to_string(),
            customer_hash: customer_hash(query.customer_ref.as_deref()),
            timestamp: Utc::now(),
        }
    }

    /// Screen the counterparty name. A collaborator failure never passes
    /// the transaction silently: it contributes a distinguished error
    /// factor routed to manual review.
    fn run_screening(
        &self,
        query: &ScreeningQuery,
        factors: &mut FactorSet,
    ) -> (Option<ScreeningResult>, ScreeningAction) {
        let Some(name) = query
            .counterparty_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
        else {
            return (None, ScreeningAction::None);
        };

        match self.candidates.fetch_candidates(name) {
            Ok(candidates) => {
                let result = self.matcher.screen(name, &candidates);
                if let Some(code) = result.factor() {
                    factors.push(code);
                }
                let action = result.action();
                (Some(result), action)
            }
            Err(e) => {
                warn!(error = %e, "screening corpus unavailable, flagging for manual review");
                factors.push(factor::SCREENING_ERROR);
                (None, ScreeningAction::ManualReview)
            }
        }
    }
}
