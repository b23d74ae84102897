use super::{FeedId, PriceQuote, PriceSource, QuoteSource, RawFeedValue};
use crate::config::OracleConfig;
use crate::error::{DispersalError, DispersalResult};
use crate::metrics;
use crate::retry::ExponentialBackoff;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Where a query was answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricSource {
    Cache,
    Primary,
    Fallback,
}

impl MetricSource {
    fn as_str(&self) -> &'static str {
        match self {
            MetricSource::Cache => "cache",
            MetricSource::Primary => "primary",
            MetricSource::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetric {
    pub timestamp: DateTime<Utc>,
    pub feed_id: FeedId,
    pub latency_ms: u64,
    pub success: bool,
    pub source: MetricSource,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OracleMetricsSummary {
    pub total_queries: usize,
    pub successes: usize,
    pub failures: usize,
    pub cache_hits: usize,
    pub fallback_uses: usize,
    pub mean_latency_ms: f64,
}

struct CachedQuote {
    quote: PriceQuote,
    expires_at: Instant,
}

/// Validation bounds applied to every raw source value
#[derive(Debug, Clone, Copy)]
struct QuoteBounds {
    max_age_secs: u64,
    max_future_skew_secs: u64,
    max_abs_decimals: i8,
}

impl QuoteBounds {
    fn check(
        &self,
        feed: &FeedId,
        raw: &RawFeedValue,
        source: QuoteSource,
        now: u64,
    ) -> Result<PriceQuote, String> {
        if raw.decimals.unsigned_abs() > self.max_abs_decimals.unsigned_abs() {
            return Err(format!("decimals {} out of range", raw.decimals));
        }
        if raw.value.is_zero() {
            return Err("zero value".to_string());
        }
        if raw.timestamp.saturating_add(self.max_age_secs) < now {
            return Err(format!("stale by {}s", now.saturating_sub(raw.timestamp)));
        }
        if raw.timestamp > now.saturating_add(self.max_future_skew_secs) {
            return Err(format!("{}s in the future", raw.timestamp.saturating_sub(now)));
        }
        Ok(PriceQuote {
            feed_id: feed.clone(),
            value: raw.value,
            decimals: raw.decimals,
            timestamp: raw.timestamp,
            source,
        })
    }
}

fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// Cached price reads over a primary source, retried with backoff, and an
/// optional fallback source
pub struct PriceOracleClient {
    primary: Arc<dyn PriceSource>,
    fallback: Option<Arc<dyn PriceSource>>,
    cache: DashMap<FeedId, CachedQuote>,
    history: Mutex<VecDeque<QueryMetric>>,
    ttl: Duration,
    max_retries: u32,
    retry_initial_ms: u64,
    retry_max_ms: u64,
    bounds: QuoteBounds,
    capacity: usize,
}

impl PriceOracleClient {
    pub fn new(
        config: &OracleConfig,
        primary: Arc<dyn PriceSource>,
        fallback: Option<Arc<dyn PriceSource>>,
    ) -> Self {
        Self {
            primary,
            fallback,
            cache: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(config.metrics_capacity)),
            ttl: config.cache_ttl(),
            max_retries: config.max_retries.max(1),
            retry_initial_ms: config.retry_initial_delay_ms,
            retry_max_ms: config.retry_max_delay_ms,
            bounds: QuoteBounds {
                max_age_secs: config.max_price_age_secs,
                max_future_skew_secs: config.max_future_skew_secs,
                max_abs_decimals: config.max_abs_decimals,
            },
            capacity: config.metrics_capacity.max(1),
        }
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Read one feed: cache, then primary with retries, then fallback
    pub async fn get_price(&self, feed: &FeedId) -> DispersalResult<PriceQuote> {
        let started = Instant::now();
        if let Some(quote) = self.cached(feed) {
            self.record(feed, started, true, MetricSource::Cache);
            return Ok(quote);
        }

        let primary_error = match self.query_primary(feed).await {
            Ok(quote) => {
                self.store(&quote);
                self.record(feed, started, true, MetricSource::Primary);
                return Ok(quote);
            }
            Err(message) => {
                self.record(feed, started, false, MetricSource::Primary);
                message
            }
        };

        let Some(fallback) = &self.fallback else {
            return Err(DispersalError::PriceUnavailable {
                feed_id: feed.to_string(),
                message: primary_error,
            });
        };

        let fallback_started = Instant::now();
        let outcome = match fallback.fetch(std::slice::from_ref(feed)).await {
            Ok(values) => match values.into_iter().next().flatten() {
                Some(raw) => self
                    .bounds
                    .check(feed, &raw, QuoteSource::Fallback, unix_now()),
                None => Err("feed not served".to_string()),
            },
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(quote) => {
                warn!(
                    feed_id = %feed,
                    fallback = %fallback.name(),
                    "Primary oracle exhausted for {}, using fallback {}",
                    feed,
                    fallback.name()
                );
                self.store(&quote);
                self.record(feed, fallback_started, true, MetricSource::Fallback);
                Ok(quote)
            }
            Err(message) => {
                self.record(feed, fallback_started, false, MetricSource::Fallback);
                Err(DispersalError::PriceUnavailable {
                    feed_id: feed.to_string(),
                    message: format!("primary: {}; {}: {}", primary_error, fallback.name(), message),
                })
            }
        }
    }

    /// Read many feeds in one primary round-trip. Entries align with `feeds`;
    /// a feed that could not be priced is `None`.
    pub async fn get_prices(&self, feeds: &[FeedId]) -> DispersalResult<Vec<Option<PriceQuote>>> {
        let started = Instant::now();
        let mut resolved: HashMap<FeedId, PriceQuote> = HashMap::new();
        let mut missing: Vec<FeedId> = Vec::new();

        for feed in feeds {
            if resolved.contains_key(feed) || missing.contains(feed) {
                continue;
            }
            match self.cached(feed) {
                Some(quote) => {
                    self.record(feed, started, true, MetricSource::Cache);
                    resolved.insert(feed.clone(), quote);
                }
                None => missing.push(feed.clone()),
            }
        }

        if !missing.is_empty() {
            match self.fetch_batch(self.primary.as_ref(), &missing).await {
                Ok(values) => {
                    let now = unix_now();
                    for (feed, raw) in missing.iter().zip(values) {
                        let checked = raw
                            .ok_or_else(|| "feed not served".to_string())
                            .and_then(|raw| self.bounds.check(feed, &raw, QuoteSource::Primary, now));
                        match checked {
                            Ok(quote) => {
                                self.store(&quote);
                                self.record(feed, started, true, MetricSource::Primary);
                                resolved.insert(feed.clone(), quote);
                            }
                            Err(reason) => {
                                warn!(feed_id = %feed, "Skipping malformed feed: {}", reason);
                                self.record(feed, started, false, MetricSource::Primary);
                            }
                        }
                    }
                }
                Err(e) => {
                    for feed in &missing {
                        self.record(feed, started, false, MetricSource::Primary);
                    }
                    let Some(fallback) = &self.fallback else {
                        return Err(DispersalError::PriceUnavailable {
                            feed_id: join_feeds(&missing),
                            message: e.to_string(),
                        });
                    };
                    self.serve_from_fallback(fallback.as_ref(), &missing, &mut resolved)
                        .await;
                }
            }
        }

        Ok(feeds.iter().map(|f| resolved.get(f).cloned()).collect())
    }

    async fn serve_from_fallback(
        &self,
        fallback: &dyn PriceSource,
        missing: &[FeedId],
        resolved: &mut HashMap<FeedId, PriceQuote>,
    ) {
        let started = Instant::now();
        let values = match fallback.fetch(missing).await {
            Ok(values) if values.len() == missing.len() => values,
            Ok(_) | Err(_) => {
                warn!(fallback = %fallback.name(), "Fallback batch failed for {}", join_feeds(missing));
                for feed in missing {
                    self.record(feed, started, false, MetricSource::Fallback);
                }
                return;
            }
        };

        let now = unix_now();
        for (feed, raw) in missing.iter().zip(values) {
            let checked = raw
                .ok_or_else(|| "feed not served".to_string())
                .and_then(|raw| self.bounds.check(feed, &raw, QuoteSource::Fallback, now));
            match checked {
                Ok(quote) => {
                    warn!(
                        feed_id = %feed,
                        fallback = %fallback.name(),
                        "Primary oracle exhausted for {}, using fallback {}",
                        feed,
                        fallback.name()
                    );
                    self.store(&quote);
                    self.record(feed, started, true, MetricSource::Fallback);
                    resolved.insert(feed.clone(), quote);
                }
                Err(reason) => {
                    debug!(feed_id = %feed, "Fallback value rejected: {}", reason);
                    self.record(feed, started, false, MetricSource::Fallback);
                }
            }
        }
    }

    /// Primary with retries; an invalid value counts as a failed attempt
    async fn query_primary(&self, feed: &FeedId) -> Result<PriceQuote, String> {
        let mut backoff = ExponentialBackoff::from_millis(self.retry_initial_ms, self.retry_max_ms);
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            let outcome = match self.primary.fetch(std::slice::from_ref(feed)).await {
                Ok(values) => match values.into_iter().next().flatten() {
                    Some(raw) => self
                        .bounds
                        .check(feed, &raw, QuoteSource::Primary, unix_now()),
                    None => Err("feed not served".to_string()),
                },
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(quote) => return Ok(quote),
                Err(message) => {
                    warn!(
                        feed_id = %feed,
                        attempt,
                        max_attempts = self.max_retries,
                        "Primary oracle query failed: {}",
                        message
                    );
                    last_error = message;
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }

        Err(last_error)
    }

    /// One round-trip for `feeds`, retried as a unit
    async fn fetch_batch(
        &self,
        source: &dyn PriceSource,
        feeds: &[FeedId],
    ) -> DispersalResult<Vec<Option<RawFeedValue>>> {
        let mut backoff = ExponentialBackoff::from_millis(self.retry_initial_ms, self.retry_max_ms);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match source.fetch(feeds).await {
                Ok(values) if values.len() == feeds.len() => return Ok(values),
                Ok(values) => DispersalError::PriceUnavailable {
                    feed_id: join_feeds(feeds),
                    message: format!("{} values for {} feeds", values.len(), feeds.len()),
                },
                Err(e) => e,
            };

            if attempt >= self.max_retries {
                return Err(error);
            }
            warn!(
                attempt,
                feeds = feeds.len(),
                "Batch price query via {} failed: {}",
                source.name(),
                error
            );
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    fn cached(&self, feed: &FeedId) -> Option<PriceQuote> {
        let hit = self.cache.get(feed).map(|entry| {
            (entry.expires_at > Instant::now()).then(|| entry.quote.clone())
        })?;
        if hit.is_none() {
            self.cache.remove(feed);
        }
        hit
    }

    fn store(&self, quote: &PriceQuote) {
        self.cache.insert(
            quote.feed_id.clone(),
            CachedQuote {
                quote: quote.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    fn record(&self, feed: &FeedId, started: Instant, success: bool, source: MetricSource) {
        let elapsed = started.elapsed();
        metrics::record_oracle_query(source.as_str(), success, elapsed.as_secs_f64());

        let entry = QueryMetric {
            timestamp: Utc::now(),
            feed_id: feed.clone(),
            latency_ms: elapsed.as_millis() as u64,
            success,
            source,
        };
        if let Ok(mut history) = self.history.lock() {
            if history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(entry);
        }
    }

    /// Most recent query metrics, oldest first
    pub fn metrics(&self) -> Vec<QueryMetric> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn metrics_summary(&self) -> OracleMetricsSummary {
        let Ok(history) = self.history.lock() else {
            return OracleMetricsSummary::default();
        };
        let total = history.len();
        let successes = history.iter().filter(|m| m.success).count();
        let latency_sum: u64 = history.iter().map(|m| m.latency_ms).sum();

        OracleMetricsSummary {
            total_queries: total,
            successes,
            failures: total - successes,
            cache_hits: history
                .iter()
                .filter(|m| m.source == MetricSource::Cache)
                .count(),
            fallback_uses: history
                .iter()
                .filter(|m| m.source == MetricSource::Fallback && m.success)
                .count(),
            mean_latency_ms: if total == 0 {
                0.0
            } else {
                latency_sum as f64 / total as f64
            },
        }
    }
}

fn join_feeds(feeds: &[FeedId]) -> String {
    feeds
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MockPriceSource;
    use ethers::types::U256;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn oracle_config(metrics_capacity: usize) -> OracleConfig {
        toml::from_str(&format!(
            r#"
            chain_id = 114
            contract_address = "0x0000000000000000000000000000000000000abc"
            retry_initial_delay_ms = 1
            retry_max_delay_ms = 2
            metrics_capacity = {}
            "#,
            metrics_capacity
        ))
        .unwrap()
    }

    fn raw(value: u64, decimals: i8) -> RawFeedValue {
        RawFeedValue {
            value: U256::from(value),
            decimals,
            timestamp: unix_now(),
        }
    }

    fn feed(name: &str) -> FeedId {
        FeedId::parse(name).unwrap()
    }

    fn failing_source(name: &str, calls: Arc<AtomicUsize>) -> MockPriceSource {
        let mut source = MockPriceSource::new();
        source.expect_name().return_const(name.to_string());
        source.expect_fetch().returning(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DispersalError::Rpc {
                chain_id: 114,
                message: "connection refused".to_string(),
            })
        });
        source
    }

    fn fixed_source(name: &str, value: u64, decimals: i8) -> MockPriceSource {
        let mut source = MockPriceSource::new();
        source.expect_name().return_const(name.to_string());
        source
            .expect_fetch()
            .returning(move |feeds| Ok(feeds.iter().map(|_| Some(raw(value, decimals))).collect()));
        source
    }

    #[tokio::test]
    async fn test_primary_quote_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut primary = MockPriceSource::new();
        primary.expect_name().return_const("ftso".to_string());
        primary.expect_fetch().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Some(raw(200_000, 2))])
        });

        let oracle = PriceOracleClient::new(&oracle_config(1000), Arc::new(primary), None);
        let first = oracle.get_price(&feed("ETH/USD")).await.unwrap();
        let second = oracle.get_price(&feed("ETH/USD")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.source, QuoteSource::Primary);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let summary = oracle.metrics_summary();
        assert_eq!(summary.total_queries, 2);
        assert_eq!(summary.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_invalid_values_count_as_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut primary = MockPriceSource::new();
        primary.expect_name().return_const("ftso".to_string());
        primary.expect_fetch().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let value = match n {
                0 => raw(0, 2),
                1 => raw(5, 19),
                _ => raw(12345, 2),
            };
            Ok(vec![Some(value)])
        });

        let oracle = PriceOracleClient::new(&oracle_config(1000), Arc::new(primary), None);
        let quote = oracle.get_price(&feed("FLR/USD")).await.unwrap();
        assert_eq!(quote.value, U256::from(12345));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stale_quote_rejected() {
        let mut primary = MockPriceSource::new();
        primary.expect_name().return_const("ftso".to_string());
        primary.expect_fetch().returning(|_| {
            Ok(vec![Some(RawFeedValue {
                value: U256::from(1),
                decimals: 0,
                timestamp: unix_now() - 301,
            })])
        });

        let oracle = PriceOracleClient::new(&oracle_config(1000), Arc::new(primary), None);
        let err = oracle.get_price(&feed("ETH/USD")).await.unwrap_err();
        assert!(matches!(err, DispersalError::PriceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_primary_without_fallback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let primary = failing_source("ftso", calls.clone());

        let oracle = PriceOracleClient::new(&oracle_config(1000), Arc::new(primary), None);
        let err = oracle.get_price(&feed("ETH/USD")).await.unwrap_err();

        assert!(matches!(err, DispersalError::PriceUnavailable { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fallback_tags_source_and_warns() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let calls = Arc::new(AtomicUsize::new(0));
        let primary = failing_source("ftso", calls);
        let fallback = fixed_source("coingecko", 200_050, 2);

        let oracle = PriceOracleClient::new(
            &oracle_config(1000),
            Arc::new(primary),
            Some(Arc::new(fallback)),
        );
        let quote = oracle.get_price(&feed("ETH/USD")).await.unwrap();

        assert_eq!(quote.source, QuoteSource::Fallback);
        assert_eq!(quote.value, U256::from(200_050));

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|l| l.contains("using fallback"))
            .expect("fallback warning logged");
        assert!(line.contains("ETH/USD"));
        assert!(line.contains("coingecko"));

        // cached as a fallback quote
        let again = oracle.get_price(&feed("ETH/USD")).await.unwrap();
        assert_eq!(again.source, QuoteSource::Fallback);
        assert_eq!(oracle.metrics_summary().fallback_uses, 1);
    }

    #[tokio::test]
    async fn test_batch_skips_malformed_and_keeps_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut primary = MockPriceSource::new();
        primary.expect_name().return_const("ftso".to_string());
        primary.expect_fetch().returning(move |feeds| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(feeds.len(), 3);
            Ok(vec![Some(raw(100, 2)), Some(raw(0, 2)), Some(raw(80, 2))])
        });

        let oracle = PriceOracleClient::new(&oracle_config(1000), Arc::new(primary), None);
        let feeds = [feed("USDC/USD"), feed("BAD/USD"), feed("FLR/USD"), feed("USDC/USD")];
        let quotes = oracle.get_prices(&feeds).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(quotes.len(), 4);
        assert_eq!(quotes[0].as_ref().unwrap().value, U256::from(100));
        assert!(quotes[1].is_none());
        assert_eq!(quotes[2].as_ref().unwrap().feed_id, feed("FLR/USD"));
        assert_eq!(quotes[3], quotes[0]);
        assert_eq!(oracle.metrics_summary().failures, 1);
    }

    #[tokio::test]
    async fn test_batch_skips_out_of_range_timestamp() {
        let mut primary = MockPriceSource::new();
        primary.expect_name().return_const("ftso".to_string());
        primary.expect_fetch().returning(|_| {
            Ok(vec![
                Some(raw(100, 2)),
                Some(RawFeedValue {
                    value: U256::from(100),
                    decimals: 2,
                    timestamp: u64::MAX,
                }),
            ])
        });

        let oracle = PriceOracleClient::new(&oracle_config(1000), Arc::new(primary), None);
        let quotes = oracle
            .get_prices(&[feed("USDC/USD"), feed("BAD/USD")])
            .await
            .unwrap();

        assert_eq!(quotes[0].as_ref().unwrap().value, U256::from(100));
        assert!(quotes[1].is_none());
    }

    #[test]
    fn test_bounds_saturate_on_extreme_timestamps() {
        let bounds = QuoteBounds {
            max_age_secs: u64::MAX,
            max_future_skew_secs: u64::MAX,
            max_abs_decimals: 18,
        };
        let value = RawFeedValue {
            value: U256::from(1),
            decimals: 0,
            timestamp: 0,
        };
        assert!(bounds
            .check(&feed("ETH/USD"), &value, QuoteSource::Primary, u64::MAX)
            .is_ok());

        let strict = QuoteBounds {
            max_age_secs: 300,
            max_future_skew_secs: 60,
            max_abs_decimals: 18,
        };
        let future = RawFeedValue {
            timestamp: u64::MAX,
            ..value
        };
        let err = strict
            .check(&feed("ETH/USD"), &future, QuoteSource::Primary, 1_000)
            .unwrap_err();
        assert!(err.contains("in the future"));
    }

    #[tokio::test]
    async fn test_batch_retried_as_unit_then_fallback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let primary = failing_source("ftso", calls.clone());
        let fallback = fixed_source("coingecko", 42, 0);

        let oracle = PriceOracleClient::new(
            &oracle_config(1000),
            Arc::new(primary),
            Some(Arc::new(fallback)),
        );
        let quotes = oracle
            .get_prices(&[feed("ETH/USD"), feed("FLR/USD")])
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(quotes
            .iter()
            .all(|q| q.as_ref().unwrap().source == QuoteSource::Fallback));
    }

    #[tokio::test]
    async fn test_batch_failure_without_fallback_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let primary = failing_source("ftso", calls);
        let oracle = PriceOracleClient::new(&oracle_config(1000), Arc::new(primary), None);

        let result = oracle.get_prices(&[feed("ETH/USD")]).await;
        assert!(matches!(result, Err(DispersalError::PriceUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_metrics_window_capped() {
        let primary = fixed_source("ftso", 1, 0);
        let oracle = PriceOracleClient::new(&oracle_config(3), Arc::new(primary), None);

        for _ in 0..5 {
            oracle.get_price(&feed("ETH/USD")).await.unwrap();
        }
        let window = oracle.metrics();
        assert_eq!(window.len(), 3);
        assert!(window.iter().all(|m| m.source == MetricSource::Cache));
    }
}
