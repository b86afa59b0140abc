use serde_json::Value;

use crate::error::SourceError;
use crate::http::HttpPool;
use crate::schema::{GasData, SourcePayload};

use super::adapter::{DataSource, FailurePolicy};
use super::etherscan::{self, EtherscanApi};

/// Etherscan gas oracle (`gastracker/gasoracle`).
///
/// Upstream prices are strings ("10", or "0.83" since the
/// sub-gwei era); they are coerced to whole gwei.
pub struct GasOracleSource {
    api: EtherscanApi,
}

impl GasOracleSource {
    pub fn new(api: EtherscanApi) -> Self {
        Self { api }
    }
}

fn gwei(result: &Value, key: &str) -> Result<u64, SourceError> {
    let raw = result
        .get(key)
        .ok_or_else(|| SourceError::MissingField(format!("result.{}", key)))?;

    let value = match raw {
        Value::String(s) => match s.trim().parse::<u64>() {
            Ok(v) => return Ok(v),
            Err(_) => s
                .trim()
                .parse::<f64>()
                .map_err(|e| SourceError::invalid(key, e))?,
        },
        Value::Number(n) => match n.as_u64() {
            Some(v) => return Ok(v),
            None => n.as_f64().unwrap_or(f64::NAN),
        },
        _ => return Err(SourceError::invalid(key, "not a number")),
    };

    if !value.is_finite() || value < 0.0 {
        return Err(SourceError::invalid(key, format!("out of range: {}", value)));
    }
    Ok(value.round() as u64)
}

pub(crate) fn parse_gas(body: &Value) -> Result<GasData, SourceError> {
    if let Some(message) = etherscan::api_error(body) {
        return Err(SourceError::Unavailable(message));
    }

    let result = body
        .get("result")
        .filter(|r| r.is_object())
        .ok_or_else(|| SourceError::MissingField("result".into()))?;

    Ok(GasData {
        safe_gas_price: gwei(result, "SafeGasPrice")?,
        standard_gas_price: gwei(result, "StandardGasPrice")?,
        fast_gas_price: gwei(result, "FastGasPrice")?,
    })
}

#[async_trait::async_trait]
impl DataSource for GasOracleSource {

    fn name(&self) -> &'static str {
        super::GAS_DATA
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Propagate
    }

    async fn fetch(&self, http: &HttpPool) -> Result<SourcePayload, SourceError> {
        let fetched = http
            .send(self.api.request(http, "gastracker", "gasoracle", &[]))
            .await?;

        if !fetched.is_ok() {
            return Err(SourceError::Status {
                api: "Gas tracker",
                status: fetched.status,
            });
        }

        Ok(SourcePayload::Gas(parse_gas(&fetched.json()?)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApisConfig, HttpConfig};
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn string_prices_become_integers() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api")
                    .query_param("module", "gastracker")
                    .query_param("action", "gasoracle");
                then.status(200).json_body(json!({
                    "status": "1",
                    "message": "OK",
                    "result": {"SafeGasPrice": "10", "StandardGasPrice": "15", "FastGasPrice": "25"}
                }));
            })
            .await;

        let api = EtherscanApi::from_config(&ApisConfig {
            etherscan_url: server.url("/api"),
            etherscan_key: Some("k".into()),
            ..ApisConfig::default()
        })
        .unwrap();
        let http = HttpPool::new(&HttpConfig::default()).unwrap();
        let payload = GasOracleSource::new(api).fetch(&http).await.unwrap();

        assert_eq!(
            payload,
            SourcePayload::Gas(GasData {
                safe_gas_price: 10,
                standard_gas_price: 15,
                fast_gas_price: 25,
            })
        );
    }

    #[test]
    fn fractional_gwei_rounds() {
        let body = json!({"result": {"SafeGasPrice": "0.4", "StandardGasPrice": "0.83", "FastGasPrice": 2}});
        let gas = parse_gas(&body).unwrap();
        assert_eq!((gas.safe_gas_price, gas.standard_gas_price, gas.fast_gas_price), (0, 1, 2));
    }

    #[test]
    fn api_level_error_is_a_failure() {
        let body = json!({"status": "0", "message": "NOTOK", "result": "Invalid API Key"});
        let err = parse_gas(&body).unwrap_err();
        assert!(err.to_string().contains("Invalid API Key"));

        let missing = json!({"result": {"SafeGasPrice": "1", "StandardGasPrice": "2"}});
        assert!(matches!(parse_gas(&missing), Err(SourceError::MissingField(_))));
    }
}
