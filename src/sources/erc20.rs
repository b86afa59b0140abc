use futures_util::future::join_all;
use serde_json::Value;

use crate::config::ContractConfig;
use crate::error::SourceError;
use crate::http::HttpPool;
use crate::schema::{Erc20Transfer, SourcePayload};
use crate::util;

use super::adapter::{DataSource, FailurePolicy};
use super::etherscan::{self, EtherscanApi};

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// ERC-20 `Transfer` logs for every configured contract over the
/// last `lookback` blocks.
///
/// The block range is resolved once per fetch and shared by all
/// contracts. Contracts are queried concurrently; any contract
/// failing fails the source.
pub struct Erc20TransferSource {
    api: EtherscanApi,
    contracts: Vec<ContractConfig>,
    lookback: u64,
}

impl Erc20TransferSource {
    pub fn new(api: EtherscanApi, contracts: Vec<ContractConfig>, lookback: u64) -> Self {
        Self {
            api,
            contracts,
            lookback,
        }
    }

    async fn fetch_contract(
        &self,
        http: &HttpPool,
        contract: &ContractConfig,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Erc20Transfer>, SourceError> {
        let request = self.api.request(
            http,
            "logs",
            "getLogs",
            &[
                ("address", contract.address.clone()),
                ("topic0", TRANSFER_TOPIC.to_string()),
                ("fromBlock", from_block.to_string()),
                ("toBlock", to_block.to_string()),
            ],
        );

        let fetched = http.send(request).await?;
        if !fetched.is_ok() {
            return Err(SourceError::Status {
                api: "Logs",
                status: fetched.status,
            });
        }

        let body = fetched.json()?;
        let logs = match body.get("result") {
            Some(Value::Array(logs)) => logs,
            _ => {
                let detail = etherscan::api_error(&body)
                    .unwrap_or_else(|| "logs result is not an array".to_string());
                return Err(SourceError::Unavailable(detail));
            }
        };

        let mut transfers = Vec::with_capacity(logs.len());
        for log in logs {
            if let Some(transfer) = decode_transfer(&contract.name, log)? {
                transfers.push(transfer);
            }
        }

        log::debug!(
            "[{}] {} transfers for {} in blocks {}..={}",
            super::ERC20_TRANSFERS,
            transfers.len(),
            contract.name,
            from_block,
            to_block
        );
        Ok(transfers)
    }
}

fn str_field<'a>(log: &'a Value, key: &str) -> Result<&'a str, SourceError> {
    log.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SourceError::MissingField(key.to_string()))
}

fn optional_hex(log: &Value, key: &str) -> Result<Option<u64>, SourceError> {
    match log.get(key).and_then(Value::as_str) {
        Some(raw) if raw != "0x" && !raw.is_empty() => util::parse_hex_u64(key, raw).map(Some),
        _ => Ok(None),
    }
}

/// Decodes one log entry.
///
/// Returns `Ok(None)` for logs with fewer than three topics; those
/// are not standard `Transfer(from, to, value)` events.
pub(crate) fn decode_transfer(
    contract_name: &str,
    log: &Value,
) -> Result<Option<Erc20Transfer>, SourceError> {
    let topics: Vec<&str> = log
        .get("topics")
        .and_then(Value::as_array)
        .map(|t| t.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    if topics.len() < 3 {
        return Ok(None);
    }

    Ok(Some(Erc20Transfer {
        contract_name: contract_name.to_string(),
        contract_address: str_field(log, "address")?.to_lowercase(),
        transaction_hash: str_field(log, "transactionHash")?.to_string(),
        block_number: util::parse_hex_u64("blockNumber", str_field(log, "blockNumber")?)?,
        from_address: util::topic_to_address("topics[1]", topics[1])?,
        to_address: util::topic_to_address("topics[2]", topics[2])?,
        value: util::hex_to_decimal("data", str_field(log, "data")?)?,
        gas_price: optional_hex(log, "gasPrice")?,
        gas_used: optional_hex(log, "gasUsed")?,
    }))
}

#[async_trait::async_trait]
impl DataSource for Erc20TransferSource {

    fn name(&self) -> &'static str {
        super::ERC20_TRANSFERS
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Propagate
    }

    async fn fetch(&self, http: &HttpPool) -> Result<SourcePayload, SourceError> {
        let latest = self.api.latest_block(http).await?;
        let from_block = latest.saturating_sub(self.lookback);

        let results = join_all(
            self.contracts
                .iter()
                .map(|c| self.fetch_contract(http, c, from_block, latest)),
        )
        .await;

        let mut transfers = Vec::new();
        for result in results {
            transfers.extend(result?);
        }

        Ok(SourcePayload::Transfers(transfers))
    }
}
