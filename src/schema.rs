use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version tag carried by every combined record and envelope.
pub const DATA_VERSION: &str = "1.0";

/// Producer label carried by every combined record and envelope.
pub const RECORD_SOURCE: &str = "ethereum_collector";

// ------------------------------------------------------------
// Per-source payloads
// ------------------------------------------------------------
//
// Field names are the ones downstream tables expect. Upstream
// names (usd_24h_vol, SafeGasPrice, gasUsed, ...) are only used
// while parsing inside the source clients.
//

/// Market data from the price feed.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PriceData {
    pub price_usd: f64,

    /// Absent when the feed was asked for USD only
    pub price_btc: Option<f64>,

    pub market_cap: f64,
    pub volume_24h: f64,
    pub change_24h: f64,
}

/// Network statistics from the block explorer.
///
/// Each field falls back to its documented default when the
/// corresponding sub-request returns a non-200 status.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NetworkStats {
    /// Total supply in wei, as returned (default "0")
    pub total_supply: String,

    /// Raw `ethprice` result object (default {})
    pub eth_price: Value,

    /// Latest block number (default 0)
    pub latest_block: u64,
}

/// One decoded block header.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BlockSummary {
    pub number: u64,
    pub hash: String,
    pub timestamp: u64,
    pub transaction_count: usize,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub miner: String,
    pub size: u64,
}

/// Gas oracle prices in gwei.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GasData {
    pub safe_gas_price: u64,
    pub standard_gas_price: u64,
    pub fast_gas_price: u64,
}

/// Best-effort DeFi metric.
///
/// A failed fetch is reported here as `total_value_locked = 0`
/// with `error` set, never as a source failure.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DefiMetrics {
    pub total_value_locked: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A decoded ERC-20 `Transfer` log.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Erc20Transfer {
    pub contract_name: String,
    pub contract_address: String,
    pub transaction_hash: String,
    pub block_number: u64,
    pub from_address: String,
    pub to_address: String,

    /// uint256 amount as a decimal string
    pub value: String,

    pub gas_price: Option<u64>,
    pub gas_used: Option<u64>,
}

/// Payload of a successful fetch.
///
/// Serialized untagged: the slot name in the combined record
/// already identifies the shape.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum SourcePayload {
    Price(PriceData),
    Network(NetworkStats),
    Blocks(Vec<BlockSummary>),
    Gas(GasData),
    Defi(DefiMetrics),
    Transfers(Vec<Erc20Transfer>),
}

// ------------------------------------------------------------
// SourceRecord
// ------------------------------------------------------------
//
// Successful fetch as stored in a slot. Failed fetches never reach
// a slot, so `success` is always true and `error` is never
// serialized. Both fields stay for the downstream record layout.
//
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct SourceRecord {
    pub source: String,
    pub payload: Option<SourcePayload>,
    pub fetched_at: String,
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceRecord {
    pub fn ok(source: &str, payload: SourcePayload, fetched_at: String) -> Self {
        Self {
            source: source.to_string(),
            payload: Some(payload),
            fetched_at,
            success: true,
            error: None,
        }
    }
}

// ------------------------------------------------------------
// CombinedRecord
// ------------------------------------------------------------
//
// One per cycle, always produced. Slots are flattened into the
// top-level JSON object (price_data, gas_data, ...) and are null
// for failed sources.
//
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct CombinedRecord {
    pub timestamp: String,
    pub data_version: String,
    pub source: String,

    #[serde(flatten)]
    pub slots: BTreeMap<String, Option<SourceRecord>>,

    /// One entry per failed source, in registration order
    pub errors: Vec<String>,
}

impl CombinedRecord {
    pub fn new(timestamp: String) -> Self {
        Self {
            timestamp,
            data_version: DATA_VERSION.to_string(),
            source: RECORD_SOURCE.to_string(),
            slots: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn slot(&self, name: &str) -> Option<&SourceRecord> {
        self.slots.get(name).and_then(Option::as_ref)
    }

    pub fn price(&self) -> Option<&PriceData> {
        self.slots.values().flatten().find_map(|r| match &r.payload {
            Some(SourcePayload::Price(p)) => Some(p),
            _ => None,
        })
    }

    pub fn succeeded(&self) -> usize {
        self.slots.values().filter(|s| s.is_some()).count()
    }
}

// ------------------------------------------------------------
// DeliveryEnvelope
// ------------------------------------------------------------
//
// Wire-level unit handed to a producer. `body` is compact JSON,
// `properties` carries source/version/data_type, and
// `partition_key` is derived from the cycle timestamp only.
//
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct DeliveryEnvelope {
    pub body: String,
    pub event_type: String,

    /// Cycle timestamp, repeated for sinks that index on it
    pub timestamp: String,

    pub properties: BTreeMap<String, String>,
    pub partition_key: String,
}

// ------------------------------------------------------------
// Quality checks
// ------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct QualityCheckResult {
    pub check: String,
    pub status: CheckStatus,
    pub message: String,
}

impl QualityCheckResult {
    pub fn new(check: &str, status: CheckStatus, message: String) -> Self {
        Self {
            check: check.to_string(),
            status,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_slots_serialize_as_null_next_to_populated_ones() {
        let mut record = CombinedRecord::new("2024-01-01T00:00:00+00:00".into());
        record.slots.insert(
            "gas_data".into(),
            Some(SourceRecord::ok(
                "gas_data",
                SourcePayload::Gas(GasData {
                    safe_gas_price: 10,
                    standard_gas_price: 15,
                    fast_gas_price: 25,
                }),
                "2024-01-01T00:00:01+00:00".into(),
            )),
        );
        record.slots.insert("price_data".into(), None);
        record.errors.push("price_data: Price API error: 500".into());

        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["data_version"], "1.0");
        assert_eq!(v["source"], "ethereum_collector");
        assert_eq!(v["price_data"], Value::Null);
        assert_eq!(
            v["gas_data"]["payload"],
            json!({"safe_gas_price": 10, "standard_gas_price": 15, "fast_gas_price": 25})
        );
        assert!(v["gas_data"].get("error").is_none());
        assert_eq!(v["errors"][0], "price_data: Price API error: 500");
        assert_eq!(record.succeeded(), 1);
        assert!(record.price().is_none());
    }

    #[test]
    fn check_status_uses_uppercase_labels() {
        let r = QualityCheckResult::new("freshness", CheckStatus::Pass, "ok".into());
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "PASS");
        assert_eq!(serde_json::to_value(CheckStatus::Error).unwrap(), "ERROR");
    }
}
