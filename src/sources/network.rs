use serde_json::{Map, Value};

use crate::error::SourceError;
use crate::http::HttpPool;
use crate::schema::{NetworkStats, SourcePayload};
use crate::util;

use super::adapter::{DataSource, FailurePolicy};
use super::etherscan::EtherscanApi;

/// Network statistics from three parallel etherscan calls:
/// - stats/ethsupply      -> total_supply  (default "0")
/// - stats/ethprice       -> eth_price     (default {})
/// - proxy/eth_blockNumber -> latest_block (default 0)
///
/// A non-200 sub-call is replaced by its default. A transport
/// failure or an undecodable body fails the whole source.
pub struct NetworkStatsSource {
    api: EtherscanApi,
}

impl NetworkStatsSource {
    pub fn new(api: EtherscanApi) -> Self {
        Self { api }
    }

    /// `Ok(None)` means the sub-call degraded to its default.
    async fn sub_call(
        &self,
        http: &HttpPool,
        module: &str,
        action: &str,
    ) -> Result<Option<Value>, SourceError> {
        let fetched = http.send(self.api.request(http, module, action, &[])).await?;
        if !fetched.is_ok() {
            log::warn!(
                "[{}] {}/{} returned status {}; using default",
                super::NETWORK_STATS,
                module,
                action,
                fetched.status
            );
            return Ok(None);
        }
        Ok(Some(fetched.json()?))
    }
}

pub(crate) fn assemble(
    supply: Option<&Value>,
    price: Option<&Value>,
    block: Option<&Value>,
) -> Result<NetworkStats, SourceError> {
    let total_supply = match supply.and_then(|v| v.get("result")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "0".to_string(),
    };

    let eth_price = price
        .and_then(|v| v.get("result"))
        .filter(|r| r.is_object())
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));

    let latest_block = match block.and_then(|v| v.get("result")).and_then(Value::as_str) {
        Some(raw) if !raw.is_empty() => util::parse_hex_u64("latest_block", raw)?,
        _ => 0,
    };

    Ok(NetworkStats {
        total_supply,
        eth_price,
        latest_block,
    })
}

#[async_trait::async_trait]
impl DataSource for NetworkStatsSource {

    fn name(&self) -> &'static str {
        super::NETWORK_STATS
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::SubstituteDefault
    }

    async fn fetch(&self, http: &HttpPool) -> Result<SourcePayload, SourceError> {
        let (supply, price, block) = tokio::join!(
            self.sub_call(http, "stats", "ethsupply"),
            self.sub_call(http, "stats", "ethprice"),
            self.sub_call(http, "proxy", "eth_blockNumber"),
        );

        let stats = assemble(supply?.as_ref(), price?.as_ref(), block?.as_ref())?;
        Ok(SourcePayload::Network(stats))
    }
}
