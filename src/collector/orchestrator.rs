use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::join_all;

use crate::error::SourceError;
use crate::http::HttpPool;
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::schema::{CombinedRecord, SourceRecord};
use crate::sources::adapter::DataSource;
use crate::util::{now_rfc3339, panic_message};

/// `collect() -> CombinedRecord`, never an error.
#[async_trait::async_trait]
pub trait Collect: Send + Sync {
    async fn collect(&self) -> CombinedRecord;
}

/// Fans one cycle out to every configured source.
///
/// DESIGN:
/// - All sources run concurrently on the shared `HttpPool`
/// - The barrier waits for every source (no first-failure cancel)
/// - A panicking source is contained like a failed one
/// - Slots are filled in registration order, so `errors` is stable
///
/// A cycle where every source failed is still a valid record.
pub struct Orchestrator {
    sources: Vec<Arc<dyn DataSource>>,
    http: HttpPool,
}

impl Orchestrator {
    pub fn new(sources: Vec<Arc<dyn DataSource>>, http: HttpPool) -> Self {
        Self { sources, http }
    }
}

#[async_trait::async_trait]
impl Collect for Orchestrator {
    async fn collect(&self) -> CombinedRecord {
        let timestamp = now_rfc3339();

        let results = join_all(self.sources.iter().map(|source| {
            let http = &self.http;
            async move {
                let result = AssertUnwindSafe(source.fetch(http))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        RuntimeMetrics::incr(&METRICS.tick_panics);
                        Err(SourceError::Unavailable(format!(
                            "panic: {}",
                            panic_message(panic.as_ref())
                        )))
                    });
                (source, result, now_rfc3339())
            }
        }))
        .await;

        let mut record = CombinedRecord::new(timestamp);

        for (source, result, fetched_at) in results {
            let name = source.name();
            match result {
                Ok(payload) => {
                    RuntimeMetrics::incr(&METRICS.source_successes);
                    record
                        .slots
                        .insert(name.to_string(), Some(SourceRecord::ok(name, payload, fetched_at)));
                }
                Err(e) => {
                    RuntimeMetrics::incr(&METRICS.source_failures);
                    log::warn!(
                        "[{}] fetch failed (policy={}): {}",
                        name,
                        source.failure_policy().as_str(),
                        e
                    );
                    record.slots.insert(name.to_string(), None);
                    record.errors.push(format!("{}: {}", name, e));
                }
            }
        }

        log::debug!(
            "Collected {}/{} sources at {}",
            record.succeeded(),
            self.sources.len(),
            record.timestamp
        );

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, HttpConfig};
    use crate::schema::{GasData, SourcePayload};
    use crate::sources;
    use crate::sources::adapter::FailurePolicy;
    use httpmock::prelude::*;
    use tokio::time::{Duration, Instant, sleep};

    /// Source that sleeps, then succeeds or fails as scripted.
    struct FakeSource {
        name: &'static str,
        delay: Duration,
        fail_with: Option<u16>,
    }

    #[async_trait::async_trait]
    impl DataSource for FakeSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn failure_policy(&self) -> FailurePolicy {
            FailurePolicy::Propagate
        }

        async fn fetch(&self, _http: &HttpPool) -> Result<SourcePayload, SourceError> {
            sleep(self.delay).await;
            match self.fail_with {
                Some(status) => Err(SourceError::Status { api: "Fake", status }),
                None => Ok(SourcePayload::Gas(GasData {
                    safe_gas_price: 10,
                    standard_gas_price: 15,
                    fast_gas_price: 25,
                })),
            }
        }
    }

    fn source(name: &'static str, secs: u64, fail_with: Option<u16>) -> Arc<dyn DataSource> {
        Arc::new(FakeSource {
            name,
            delay: Duration::from_secs(secs),
            fail_with,
        })
    }

    struct PanickingSource;

    #[async_trait::async_trait]
    impl DataSource for PanickingSource {
        fn name(&self) -> &'static str {
            "recent_blocks"
        }

        fn failure_policy(&self) -> FailurePolicy {
            FailurePolicy::SkipItem
        }

        async fn fetch(&self, _http: &HttpPool) -> Result<SourcePayload, SourceError> {
            panic!("capacity overflow");
        }
    }

    fn orchestrator(sources: Vec<Arc<dyn DataSource>>) -> Orchestrator {
        Orchestrator::new(sources, HttpPool::new(&HttpConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn all_sources_failing_still_yields_a_record() {
        let o = orchestrator(vec![
            source("price_data", 0, Some(500)),
            source("gas_data", 0, Some(502)),
            source("defi_metrics", 0, Some(503)),
        ]);

        let record = o.collect().await;

        assert_eq!(record.errors.len(), 3);
        assert_eq!(record.slots.len(), 3);
        assert!(record.slots.values().all(Option::is_none));
        assert_eq!(record.errors[0], "price_data: Fake API error: 500");
        assert_eq!(record.errors[2], "defi_metrics: Fake API error: 503");
    }

    #[tokio::test]
    async fn successes_populate_slots_next_to_failures() {
        let o = orchestrator(vec![
            source("price_data", 0, Some(500)),
            source("gas_data", 0, None),
        ]);

        let record = o.collect().await;

        assert_eq!(record.succeeded(), 1);
        let gas = record.slot("gas_data").unwrap();
        assert!(gas.success);
        assert!(gas.error.is_none());
        assert!(matches!(gas.payload, Some(SourcePayload::Gas(_))));
        assert!(record.slot("price_data").is_none());
        assert_eq!(record.errors, vec!["price_data: Fake API error: 500".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn sources_run_concurrently() {
        let o = orchestrator(vec![
            source("price_data", 10, None),
            source("gas_data", 10, Some(500)),
            source("network_stats", 3, None),
        ]);

        let started = Instant::now();
        let record = o.collect().await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
        assert_eq!(record.succeeded(), 2);
    }

    #[tokio::test]
    async fn panicking_source_does_not_suppress_the_others() {
        let o = orchestrator(vec![
            Arc::new(PanickingSource),
            source("gas_data", 0, None),
        ]);

        let record = o.collect().await;

        assert!(record.slot("gas_data").is_some());
        assert!(record.slot("recent_blocks").is_none());
        assert_eq!(record.errors, vec!["recent_blocks: panic: capacity overflow".to_string()]);
    }

    #[tokio::test]
    async fn price_outage_yields_null_slot_and_status_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/simple/price");
                then.status(500);
            })
            .await;

        let cfg = Config::from_json(
            "test.json",
            &format!(
                r#"{{"apis":{{"coingecko_url":"{}"}},"collection":{{"sources":["price_data"]}},"sink":{{"kind":"stdout"}}}}"#,
                server.base_url()
            ),
        )
        .unwrap();
        let o = orchestrator(sources::build_sources(&cfg).unwrap());

        let record = o.collect().await;

        assert_eq!(record.slots.len(), 1);
        assert!(record.slot("price_data").is_none());
        assert_eq!(record.errors, vec!["price_data: Price API error: 500".to_string()]);
        assert!(record.price().is_none());
    }
}
