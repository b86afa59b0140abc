use serde_json::Value;

use crate::error::SourceError;
use crate::http::HttpPool;
use crate::schema::{DefiMetrics, SourcePayload};

use super::adapter::{DataSource, FailurePolicy};

/// DeFi total-value-locked metric.
///
/// Best-effort: this source never fails. Any problem is reported
/// as `total_value_locked = 0` with the error text embedded in
/// the payload.
pub struct DefiMetricsSource {
    url: String,
    key: String,
}

impl DefiMetricsSource {
    pub fn new(url: &str, key: Option<&str>) -> Self {
        Self {
            url: url.to_string(),
            key: key.unwrap_or_default().to_string(),
        }
    }

    async fn try_fetch(&self, http: &HttpPool) -> Result<DefiMetrics, SourceError> {
        let request = http.client().get(&self.url).header("Api-Key", &self.key);
        let fetched = http.send(request).await?;

        if !fetched.is_ok() {
            return Ok(DefiMetrics {
                total_value_locked: 0.0,
                error: Some(format!("Status {}", fetched.status)),
            });
        }

        let body = fetched.json()?;
        Ok(DefiMetrics {
            total_value_locked: body.get("total").and_then(Value::as_f64).unwrap_or(0.0),
            error: None,
        })
    }
}

#[async_trait::async_trait]
impl DataSource for DefiMetricsSource {

    fn name(&self) -> &'static str {
        super::DEFI_METRICS
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::SubstituteDefault
    }

    async fn fetch(&self, http: &HttpPool) -> Result<SourcePayload, SourceError> {
        let metrics = self.try_fetch(http).await.unwrap_or_else(|e| {
            log::debug!("[{}] degraded: {}", self.name(), e);
            DefiMetrics {
                total_value_locked: 0.0,
                error: Some(e.to_string()),
            }
        });

        Ok(SourcePayload::Defi(metrics))
    }
}
