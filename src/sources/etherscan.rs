use reqwest::RequestBuilder;
use serde_json::Value;

use crate::config::ApisConfig;
use crate::error::SourceError;
use crate::http::HttpPool;
use crate::util;

/// Request builder shared by every etherscan-backed source.
///
/// All calls are `GET <base>?module=..&action=..&apikey=..` with
/// extra query parameters appended. `chainid` is only sent when
/// configured.
#[derive(Debug, Clone)]
pub struct EtherscanApi {
    base_url: String,
    key: String,
    chain_id: Option<u64>,
}

impl EtherscanApi {
    /// Returns `None` when no API key is configured.
    pub fn from_config(apis: &ApisConfig) -> Option<Self> {
        let key = apis.etherscan_key.clone().filter(|k| !k.trim().is_empty())?;
        Some(Self {
            base_url: apis.etherscan_url.clone(),
            key,
            chain_id: apis.etherscan_chain_id,
        })
    }

    pub fn request(
        &self,
        http: &HttpPool,
        module: &str,
        action: &str,
        extra: &[(&str, String)],
    ) -> RequestBuilder {
        let mut query: Vec<(&str, String)> = Vec::with_capacity(extra.len() + 4);
        if let Some(chain) = self.chain_id {
            query.push(("chainid", chain.to_string()));
        }
        query.push(("module", module.to_string()));
        query.push(("action", action.to_string()));
        query.extend(extra.iter().cloned());
        query.push(("apikey", self.key.clone()));

        http.client().get(&self.base_url).query(&query)
    }

    /// Resolves the latest block number via `proxy/eth_blockNumber`.
    pub async fn latest_block(&self, http: &HttpPool) -> Result<u64, SourceError> {
        let fetched = http
            .send(self.request(http, "proxy", "eth_blockNumber", &[]))
            .await?;

        if !fetched.is_ok() {
            return Err(SourceError::Status {
                api: "Block number",
                status: fetched.status,
            });
        }

        let body = fetched.json()?;
        let raw = result_str(&body)?;
        util::parse_hex_u64("result", raw)
    }
}

/// `result` as a string, or a missing-field error.
pub fn result_str(body: &Value) -> Result<&str, SourceError> {
    body.get("result")
        .and_then(Value::as_str)
        .ok_or_else(|| SourceError::MissingField("result".into()))
}

/// Etherscan reports API-level failures (bad key, rate limit) as
/// HTTP 200 with `status: "0"` and a text `result`.
pub fn api_error(body: &Value) -> Option<String> {
    let status = body.get("status").and_then(Value::as_str)?;
    if status != "0" {
        return None;
    }
    let text = body.get("result").and_then(Value::as_str)?;
    let message = body.get("message").and_then(Value::as_str).unwrap_or("NOTOK");
    Some(format!("etherscan: {} ({})", message, text))
}
