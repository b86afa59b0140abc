use serde_json::Value;

use crate::error::SourceError;
use crate::http::HttpPool;
use crate::schema::{BlockSummary, SourcePayload};
use crate::util;

use super::adapter::{DataSource, FailurePolicy};
use super::etherscan::EtherscanApi;

/// Recent block headers.
///
/// ORDERING:
/// - The latest block number is resolved first
/// - Blocks latest, latest-1, ... are then fetched one by one
///
/// FAILURES:
/// - Latest-number lookup failing fails the source
/// - A single block failing (status, null result, bad hex) is
///   skipped; the result simply has fewer entries
pub struct RecentBlocksSource {
    api: EtherscanApi,
    count: u64,
}

impl RecentBlocksSource {
    pub fn new(api: EtherscanApi, count: u64) -> Self {
        Self { api, count }
    }

    /// `Ok(None)` when etherscan has no such block (null result).
    async fn fetch_block(
        &self,
        http: &HttpPool,
        number: u64,
    ) -> Result<Option<BlockSummary>, SourceError> {
        let request = self.api.request(
            http,
            "proxy",
            "eth_getBlockByNumber",
            &[("tag", format!("0x{:x}", number)), ("boolean", "true".into())],
        );

        let fetched = http.send(request).await?;
        if !fetched.is_ok() {
            return Err(SourceError::Status {
                api: "Block",
                status: fetched.status,
            });
        }

        let body = fetched.json()?;
        match body.get("result") {
            Some(block) if block.is_object() => decode_block(block).map(Some),
            _ => Ok(None),
        }
    }
}

fn hex_field(block: &Value, key: &str) -> Result<u64, SourceError> {
    let raw = block
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SourceError::MissingField(key.to_string()))?;
    util::parse_hex_u64(key, raw)
}

fn str_field(block: &Value, key: &str) -> Result<String, SourceError> {
    block
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SourceError::MissingField(key.to_string()))
}

pub(crate) fn decode_block(block: &Value) -> Result<BlockSummary, SourceError> {
    Ok(BlockSummary {
        number: hex_field(block, "number")?,
        hash: str_field(block, "hash")?,
        timestamp: hex_field(block, "timestamp")?,
        transaction_count: block
            .get("transactions")
            .and_then(Value::as_array)
            .map_or(0, Vec::len),
        gas_used: hex_field(block, "gasUsed")?,
        gas_limit: hex_field(block, "gasLimit")?,
        miner: str_field(block, "miner")?,
        size: hex_field(block, "size")?,
    })
}

#[async_trait::async_trait]
impl DataSource for RecentBlocksSource {

    fn name(&self) -> &'static str {
        super::RECENT_BLOCKS
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::SkipItem
    }

    async fn fetch(&self, http: &HttpPool) -> Result<SourcePayload, SourceError> {
        let latest = self.api.latest_block(http).await?;

        let mut blocks = Vec::new();
        for offset in 0..self.count {
            let Some(number) = latest.checked_sub(offset) else {
                break;
            };

            match self.fetch_block(http, number).await {
                Ok(Some(block)) => blocks.push(block),
                Ok(None) => {
                    log::debug!("[{}] block {} not available; skipped", self.name(), number);
                }
                Err(e) => {
                    log::debug!("[{}] block {} skipped: {}", self.name(), number, e);
                }
            }
        }

        Ok(SourcePayload::Blocks(blocks))
    }
}
