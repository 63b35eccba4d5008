//! Foreign-exchange rate cache and amount normalization.
//!
//! Rates come from an external source and are cached with a TTL. Refresh is
//! single-flight: the caller that wins the refresh lock fetches, everyone
//! else is served the stale table until the fresh one is committed. The
//! table is replaced by atomic pointer swap, never mutated in place, so a
//! reader can never observe a half-updated table.

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::SourceError;

/// Buy/sell quote for one currency against the base currency.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RatePair {
    pub buy: f64,
    pub sell: f64,
}

/// Immutable rate table. Replaced wholesale on refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateTable {
    rates: HashMap<String, RatePair>,
    fetched_at: DateTime<Utc>,
}

impl RateTable {
    pub fn new(rates: HashMap<String, RatePair>, fetched_at: DateTime<Utc>) -> Self {
        Self { rates, fetched_at }
    }

    /// Table representing "no rates ever obtained". Callers must treat this
    /// as rate-unavailable, not as a zero rate.
    pub fn empty() -> Self {
        Self {
            rates: HashMap::new(),
            fetched_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn sell_rate(&self, currency: &str) -> Option<f64> {
        self.rates.get(currency).map(|p| p.sell)
    }

    fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        !self.is_empty() && now.signed_duration_since(self.fetched_at) < ttl
    }
}

/// Which rate, if any, was applied during conversion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RateType {
    /// Currency already was the base currency.
    Identity,
    /// Sell rate applied.
    Sell,
    /// Currency missing from the rate table.
    Undefined,
    /// No rate table was available at all.
    Unavailable,
}

/// Outcome of normalizing an amount into the base currency.
///
/// Conversion never fails: when no usable rate exists the original amount is
/// passed through unchanged with `conversion_required == false`, and the
/// rest of the pipeline must not assume conversion succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversion {
    pub amount_original: f64,
    pub currency_original: String,
    pub amount_base: f64,
    pub rate_applied: f64,
    pub rate_type: RateType,
    pub conversion_required: bool,
}

/// Convert `amount` in `currency` into the base currency using `table`.
pub fn convert(amount: f64, currency: &str, base_currency: &str, table: &RateTable) -> Conversion {
    let currency = currency.trim().to_uppercase();

    if currency == base_currency {
        return Conversion {
            amount_original: amount,
            currency_original: currency,
            amount_base: amount,
            rate_applied: 1.0,
            rate_type: RateType::Identity,
            conversion_required: false,
        };
    }

    if table.is_empty() {
        return Conversion {
            amount_original: amount,
            currency_original: currency,
            amount_base: amount,
            rate_applied: 1.0,
            rate_type: RateType::Unavailable,
            conversion_required: false,
        };
    }

    match table.sell_rate(&currency) {
        Some(rate) if rate > 0.0 => Conversion {
            amount_original: amount,
            currency_original: currency,
            amount_base: amount * rate,
            rate_applied: rate,
            rate_type: RateType::Sell,
            conversion_required: true,
        },
        _ => Conversion {
            amount_original: amount,
            currency_original: currency,
            amount_base: amount,
            rate_applied: 1.0,
            rate_type: RateType::Undefined,
            conversion_required: false,
        },
    }
}

/// External FX source.
pub trait RateSource: Send + Sync {
    fn fetch_rates(&self) -> Result<HashMap<String, RatePair>, SourceError>;
}

/// TTL cache over a [`RateSource`].
///
/// On refresh failure the last known table is served, however stale. Only the
/// first-ever fetch blocks concurrent callers; afterwards a stale table is
/// always available while one caller refreshes.
pub struct RateCache {
    source: Arc<dyn RateSource>,
    table: ArcSwap<RateTable>,
    refresh_lock: Mutex<()>,
    ttl: Duration,
}

/// Default cache TTL in minutes.
pub const DEFAULT_TTL_MINUTES: i64 = 30;

impl RateCache {
    pub fn new(source: Arc<dyn RateSource>) -> Self {
        Self::with_ttl(source, Duration::minutes(DEFAULT_TTL_MINUTES))
    }

    pub fn with_ttl(source: Arc<dyn RateSource>, ttl: Duration) -> Self {
        Self {
            source,
            table: ArcSwap::from_pointee(RateTable::empty()),
            refresh_lock: Mutex::new(()),
            ttl,
        }
    }

    /// Current rate table: cached if fresh, refreshed if stale, last-known
    /// (or empty) if the source is down.
    pub fn get_rate_table(&self) -> Arc<RateTable> {
        let now = Utc::now();
        let current = self.table.load_full();
        if current.is_fresh(now, self.ttl) {
            debug!("serving cached rate table");
            return current;
        }

        if current.is_empty() {
            // First-ever fetch: all callers wait for one result.
            let guard = self
                .refresh_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let rechecked = self.table.load_full();
            if rechecked.is_fresh(Utc::now(), self.ttl) {
                return rechecked;
            }
            let table = self.refresh(rechecked);
            drop(guard);
            return table;
        }

        // Stale but usable: exactly one caller refreshes, the rest are
        // served the stale snapshot.
        match self.refresh_lock.try_lock() {
            Ok(_guard) => {
                let rechecked = self.table.load_full();
                if rechecked.is_fresh(Utc::now(), self.ttl) {
                    return rechecked;
                }
                self.refresh(rechecked)
            }
            Err(_) => {
                debug!("rate refresh in flight, serving stale table");
                current
            }
        }
    }

    /// Must be called with the refresh lock held.
    fn refresh(&self, last_known: Arc<RateTable>) -> Arc<RateTable> {
        match self.source.fetch_rates() {
            Ok(rates) => {
                let fresh = Arc::new(RateTable::new(rates, Utc::now()));
                info!(currencies = fresh.rates.len(), "rate table refreshed");
                self.table.store(Arc::clone(&fresh));
                fresh
            }
            Err(e) => {
                warn!(error = %e, "rate refresh failed, serving last known table");
                last_known
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use std::sync::atomic::AtomicBool;

    struct FixedSource {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FixedSource {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl RateSource for FixedSource {
        fn fetch_rates(&self) -> Result<HashMap<String, RatePair>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SourceError::RateSource("connection refused".to_string()));
            }
            let mut rates = HashMap::new();
            rates.insert(
                "USD".to_string(),
                RatePair {
                    buy: 58.5,
                    sell: 59.2,
                },
            );
            rates.insert(
                "EUR".to_string(),
                RatePair {
                    buy: 63.1,
                    sell: 64.0,
                },
            );
            Ok(rates)
        }
    }

    struct SlowSource {
        calls: AtomicUsize,
        started: AtomicBool,
    }

    impl SlowSource {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                started: AtomicBool::new(false),
            }
        }
    }

    impl RateSource for SlowSource {
        fn fetch_rates(&self) -> Result<HashMap<String, RatePair>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.store(true, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(400));
            let mut rates = HashMap::new();
            rates.insert(
                "USD".to_string(),
                RatePair {
                    buy: 58.5,
                    sell: 59.2,
                },
            );
            Ok(rates)
        }
    }

    fn table_with_usd() -> RateTable {
        let mut rates = HashMap::new();
        rates.insert(
            "USD".to_string(),
            RatePair {
                buy: 58.5,
                sell: 59.2,
            },
        );
        RateTable::new(rates, Utc::now())
    }

    #[test]
    fn test_identity_conversion() {
        let table = table_with_usd();
        let conv = convert(2500.0, "DOP", "DOP", &table);
        assert_eq!(conv.amount_base, 2500.0);
        assert_eq!(conv.rate_applied, 1.0);
        assert_eq!(conv.rate_type, RateType::Identity);
        assert!(!conv.conversion_required);
    }

    #[test]
    fn test_sell_rate_conversion() {
        let table = table_with_usd();
        let conv = convert(100.0, "USD", "DOP", &table);
        assert_eq!(conv.amount_base, 100.0 * 59.2);
        assert_eq!(conv.rate_type, RateType::Sell);
        assert!(conv.conversion_required);
    }

    #[test]
    fn test_missing_currency_falls_through() {
        let table = table_with_usd();
        let conv = convert(100.0, "GBP", "DOP", &table);
        assert_eq!(conv.amount_base, 100.0);
        assert_eq!(conv.rate_type, RateType::Undefined);
        assert!(!conv.conversion_required);
    }

    #[test]
    fn test_empty_table_is_rate_unavailable() {
        let conv = convert(100.0, "USD", "DOP", &RateTable::empty());
        assert_eq!(conv.amount_base, 100.0);
        assert_eq!(conv.rate_type, RateType::Unavailable);
        assert!(!conv.conversion_required);
    }

    #[test]
    fn test_cache_serves_without_refetching() {
        let source = Arc::new(FixedSource::new(false));
        let cache = RateCache::new(Arc::clone(&source) as Arc<dyn RateSource>);

        let first = cache.get_rate_table();
        let second = cache.get_rate_table();
        assert!(!first.is_empty());
        assert!(!second.is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_first_fetch_yields_empty_table() {
        let source = Arc::new(FixedSource::new(true));
        let cache = RateCache::new(source as Arc<dyn RateSource>);

        let table = cache.get_rate_table();
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_table_survives_source_outage() {
        let good = Arc::new(FixedSource::new(false));
        let cache = RateCache::with_ttl(good as Arc<dyn RateSource>, Duration::minutes(30));
        let fresh = cache.get_rate_table();
        assert!(!fresh.is_empty());

        // Simulate TTL expiry plus a dead source by swapping in a zero TTL
        // cache that inherits the committed table.
        let dead = Arc::new(FixedSource::new(true));
        let stale_cache = RateCache::with_ttl(dead as Arc<dyn RateSource>, Duration::zero());
        stale_cache.table.store(Arc::clone(&fresh));

        let served = stale_cache.get_rate_table();
        assert!(!served.is_empty());
        assert_eq!(served.fetched_at(), fresh.fetched_at());
    }

    #[test]
    fn test_stale_table_served_while_refresh_in_flight() {
        let source = Arc::new(SlowSource::new());
        let cache = Arc::new(RateCache::with_ttl(
            Arc::clone(&source) as Arc<dyn RateSource>,
            Duration::zero(),
        ));
        let stale = Arc::new(table_with_usd());
        cache.table.store(Arc::clone(&stale));

        // One caller wins the refresh lock and blocks inside the slow fetch.
        let winner = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.get_rate_table())
        };
        while !source.started.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        // A concurrent caller gets the stale table immediately; try_lock
        // never blocks and no second fetch goes out.
        let served = cache.get_rate_table();
        assert!(!served.is_empty());
        assert_eq!(served.fetched_at(), stale.fetched_at());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let refreshed = winner.join().unwrap();
        assert!(refreshed.fetched_at() > stale.fetched_at());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fetched_at_monotonic_across_refresh() {
        let source = Arc::new(FixedSource::new(false));
        let cache = RateCache::with_ttl(source as Arc<dyn RateSource>, Duration::zero());

        let first = cache.get_rate_table();
        let second = cache.get_rate_table();
        assert!(second.fetched_at() >= first.fetched_at());
    }
}
