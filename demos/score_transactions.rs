//! Risk engine walkthrough
//!
//! Demonstrates end-to-end transaction scoring: currency normalization,
//! rule evaluation, anomaly detection, watchlist screening, and the final
//! decision payload.

use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use transaction_risk_engine::{
    AuthorizationRequest, CandidateSource, Collaborators, CustomerRiskProfile, DecisionSink,
    HistoryProvider, MerchantContext, MerchantProvider, NormalizedTransaction, RatePair,
    RateSource, RiskDecision, RiskEngine, ScreeningCandidate, SourceError,
};

struct DemoRates;

impl RateSource for DemoRates {
    fn fetch_rates(&self) -> Result<HashMap<String, RatePair>, SourceError> {
        let mut rates = HashMap::new();
        rates.insert("USD".to_string(), RatePair { buy: 58.5, sell: 59.2 });
        rates.insert("EUR".to_string(), RatePair { buy: 63.1, sell: 64.0 });
        Ok(rates)
    }
}

struct DemoHistory;

impl HistoryProvider for DemoHistory {
    fn fetch_history(
        &self,
        customer_ref: &str,
        _now: chrono::DateTime<Utc>,
    ) -> Result<CustomerRiskProfile, SourceError> {
        // A busy customer for demonstration.
        if customer_ref == "CUST-HOT" {
            return Ok(CustomerRiskProfile {
                tx_1h: 9,
                tx_24h: 31,
                tx_7d: 120,
                avg_amount_30d: Some(1_800.0),
            });
        }
        Ok(CustomerRiskProfile::neutral())
    }
}

struct DemoMerchants;

impl MerchantProvider for DemoMerchants {
    fn fetch_merchant_context(&self, merchant_ref: &str) -> Result<MerchantContext, SourceError> {
        if merchant_ref == "MID-BLOCKED" {
            return Ok(MerchantContext {
                merchant_allowed: Some(false),
                mcc_allowed: Some(true),
                merchant_risk: None,
                mcc_risk: None,
            });
        }
        Ok(MerchantContext::neutral())
    }
}

struct DemoWatchlist;

impl CandidateSource for DemoWatchlist {
    fn fetch_candidates(&self, _name_query: &str) -> Result<Vec<ScreeningCandidate>, SourceError> {
        Ok(vec![
            ScreeningCandidate::new("VICTOR MANUEL SANCHEZ", 1001),
            ScreeningCandidate::new("GLOBAL TRADING CORP", 1002),
        ])
    }
}

struct StdoutSink;

impl DecisionSink for StdoutSink {
    fn persist_decision(
        &self,
        _transaction: &NormalizedTransaction,
        decision: &RiskDecision,
    ) -> Result<(), SourceError> {
        println!("   [audit] persisted decision {}", decision.decision_id);
        Ok(())
    }
}

fn print_decision(decision: &RiskDecision) {
    println!("   Risk Level: {}", decision.risk_level);
    println!("   Fraud: {}", decision.is_fraud);
    println!("   Probability: {:.4}", decision.fraud_probability);
    println!("   Factors: {:?}", decision.factors);
    println!(
        "   Anomaly: score={:.4} flagged={}",
        decision.anomaly_score, decision.anomaly_flag
    );
    println!("   Advice: {}", decision.advice);
    println!();
}

fn main() {
    println!("=== Transaction Risk Engine ===\n");

    let engine = RiskEngine::new(Collaborators {
        rates: Arc::new(DemoRates),
        history: Arc::new(DemoHistory),
        merchants: Arc::new(DemoMerchants),
        candidates: Arc::new(DemoWatchlist),
        sink: Arc::new(StdoutSink),
    });

    let afternoon = Utc.with_ymd_and_hms(2025, 11, 6, 14, 30, 0).unwrap();
    let night = Utc.with_ymd_and_hms(2025, 11, 6, 2, 15, 0).unwrap();

    println!("1. Routine domestic purchase");
    let decision = engine.process(&AuthorizationRequest {
        amount: 2_400.0,
        currency: "DOP".to_string(),
        timestamp: afternoon,
        counterparty_country: Some("DO".to_string()),
        counterparty_name: None,
        customer_ref: Some("CUST-001".to_string()),
        merchant_ref: Some("MID-01".to_string()),
    });
    print_decision(&decision);

    println!("2. Large night-time transaction from a high-risk country");
    let decision = engine.process(&AuthorizationRequest {
        amount: 15_000.0,
        currency: "DOP".to_string(),
        timestamp: night,
        counterparty_country: Some("VE".to_string()),
        counterparty_name: None,
        customer_ref: Some("CUST-001".to_string()),
        merchant_ref: Some("MID-01".to_string()),
    });
    print_decision(&decision);

    println!("3. Foreign-currency payment with a watchlist near-match");
    let decision = engine.process(&AuthorizationRequest {
        amount: 350.0,
        currency: "USD".to_string(),
        timestamp: afternoon,
        counterparty_country: Some("US".to_string()),
        counterparty_name: Some("Victor M Sanchez".to_string()),
        customer_ref: Some("CUST-002".to_string()),
        merchant_ref: Some("MID-02".to_string()),
    });
    print_decision(&decision);

    println!("4. High-frequency customer at a blocked merchant");
    let decision = engine.process(&AuthorizationRequest {
        amount: 12_500.0,
        currency: "DOP".to_string(),
        timestamp: afternoon,
        counterparty_country: Some("DO".to_string()),
        counterparty_name: None,
        customer_ref: Some("CUST-HOT".to_string()),
        merchant_ref: Some("MID-BLOCKED".to_string()),
    });
    print_decision(&decision);

    println!("Decision JSON sample:\n");
    if let Ok(json) = decision.to_json() {
        println!("{json}");
    }
}
