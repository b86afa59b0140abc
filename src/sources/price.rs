use serde_json::Value;

use crate::error::SourceError;
use crate::http::HttpPool;
use crate::schema::{PriceData, SourcePayload};

use super::adapter::{DataSource, FailurePolicy};

/// CoinGecko `simple/price` client.
///
/// One GET, no retries. A non-200 status or a missing field
/// fails the whole source.
///
/// Upstream fields (under `ethereum`):
/// - usd, btc, usd_market_cap, usd_24h_vol, usd_24h_change
pub struct PriceSource {
    base_url: String,
}

impl PriceSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

fn number(obj: &Value, key: &str) -> Result<f64, SourceError> {
    let v = obj
        .get(key)
        .ok_or_else(|| SourceError::MissingField(format!("ethereum.{}", key)))?;
    v.as_f64()
        .ok_or_else(|| SourceError::invalid(format!("ethereum.{}", key), "not a number"))
}

pub(crate) fn parse_price(body: &Value) -> Result<PriceData, SourceError> {
    let eth = body
        .get("ethereum")
        .ok_or_else(|| SourceError::MissingField("ethereum".into()))?;

    Ok(PriceData {
        price_usd: number(eth, "usd")?,
        price_btc: eth.get("btc").and_then(Value::as_f64),
        market_cap: number(eth, "usd_market_cap")?,
        volume_24h: number(eth, "usd_24h_vol")?,
        change_24h: number(eth, "usd_24h_change")?,
    })
}

#[async_trait::async_trait]
impl DataSource for PriceSource {

    fn name(&self) -> &'static str {
        super::PRICE_DATA
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Propagate
    }

    async fn fetch(&self, http: &HttpPool) -> Result<SourcePayload, SourceError> {
        let request = http
            .client()
            .get(format!("{}/simple/price", self.base_url))
            .query(&[
                ("ids", "ethereum"),
                ("vs_currencies", "usd,btc"),
                ("include_market_cap", "true"),
                ("include_24hr_vol", "true"),
                ("include_24hr_change", "true"),
            ]);

        let fetched = http.send(request).await?;
        if !fetched.is_ok() {
            return Err(SourceError::Status {
                api: "Price",
                status: fetched.status,
            });
        }

        let body = fetched.json()?;
        Ok(SourcePayload::Price(parse_price(&body)?))
    }
}
