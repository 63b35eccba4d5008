use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::HashMap;
use std::sync::Arc;
use transaction_risk_engine::{
    AuthorizationRequest, CandidateSource, Collaborators, CustomerRiskProfile, DecisionSink,
    HistoryProvider, MerchantContext, MerchantProvider, NormalizedTransaction, RatePair,
    RateSource, RiskDecision, RiskEngine, ScreeningCandidate, SourceError, WatchlistMatcher,
};

struct BenchRates;

impl RateSource for BenchRates {
    fn fetch_rates(&self) -> Result<HashMap<String, RatePair>, SourceError> {
        let mut rates = HashMap::new();
        rates.insert("USD".to_string(), RatePair { buy: 58.5, sell: 59.2 });
        Ok(rates)
    }
}

struct BenchHistory;

impl HistoryProvider for BenchHistory {
    fn fetch_history(
        &self,
        _customer_ref: &str,
        _now: chrono::DateTime<Utc>,
    ) -> Result<CustomerRiskProfile, SourceError> {
        Ok(CustomerRiskProfile {
            tx_1h: 1,
            tx_24h: 4,
            tx_7d: 18,
            avg_amount_30d: Some(2_500.0),
        })
    }
}

struct BenchMerchants;

impl MerchantProvider for BenchMerchants {
    fn fetch_merchant_context(&self, _merchant_ref: &str) -> Result<MerchantContext, SourceError> {
        Ok(MerchantContext::neutral())
    }
}

struct BenchWatchlist(Vec<ScreeningCandidate>);

impl CandidateSource for BenchWatchlist {
    fn fetch_candidates(&self, _name_query: &str) -> Result<Vec<ScreeningCandidate>, SourceError> {
        Ok(self.0.clone())
    }
}

struct NullSink;

impl DecisionSink for NullSink {
    fn persist_decision(
        &self,
        _transaction: &NormalizedTransaction,
        _decision: &RiskDecision,
    ) -> Result<(), SourceError> {
        Ok(())
    }
}

fn bench_engine(c: &mut Criterion) {
    let candidates: Vec<ScreeningCandidate> = (0..500)
        .map(|i| ScreeningCandidate::new(&format!("WATCHLIST ENTITY NUMBER {i}"), i))
        .collect();

    let engine = RiskEngine::new(Collaborators {
        rates: Arc::new(BenchRates),
        history: Arc::new(BenchHistory),
        merchants: Arc::new(BenchMerchants),
        candidates: Arc::new(BenchWatchlist(candidates)),
        sink: Arc::new(NullSink),
    });

    let afternoon = Utc.with_ymd_and_hms(2025, 11, 6, 14, 30, 0).unwrap();
    let night = Utc.with_ymd_and_hms(2025, 11, 6, 2, 15, 0).unwrap();

    let routine = AuthorizationRequest {
        amount: 2_400.0,
        currency: "DOP".to_string(),
        timestamp: afternoon,
        counterparty_country: Some("DO".to_string()),
        counterparty_name: None,
        customer_ref: Some("CUST-001".to_string()),
        merchant_ref: Some("MID-01".to_string()),
    };

    let risky = AuthorizationRequest {
        amount: 15_000.0,
        currency: "USD".to_string(),
        timestamp: night,
        counterparty_country: Some("VE".to_string()),
        counterparty_name: Some("Watchlist Entity Number 7".to_string()),
        customer_ref: Some("CUST-002".to_string()),
        merchant_ref: Some("MID-02".to_string()),
    };

    // Warm the rate cache and anomaly model outside the measurement loop.
    engine.process(&routine);

    c.bench_function("process_routine_transaction", |b| {
        b.iter(|| engine.process(black_box(&routine)))
    });

    c.bench_function("process_screened_transaction", |b| {
        b.iter(|| engine.process(black_box(&risky)))
    });

    let matcher = WatchlistMatcher::new();
    c.bench_function("name_similarity", |b| {
        b.iter(|| {
            matcher.similarity(
                black_box("VICTOR MANUEL SANCHEZ RODRIGUEZ"),
                black_box("Victor M. Sanchez Rodrigues"),
            )
        })
    });
}

criterion_group!(benches, bench_engine);
criterion_main!(benches);
