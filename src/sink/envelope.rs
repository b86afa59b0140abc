use std::collections::BTreeMap;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::config::EnvelopeMode;
use crate::schema::{CombinedRecord, DATA_VERSION, DeliveryEnvelope, RECORD_SOURCE};
use crate::sources;

/// Event type of the whole-cycle envelope.
pub const EVENT_COMBINED: &str = "EthereumMetrics";

/// `data_type` property of the whole-cycle envelope.
pub const DATA_TYPE_COMBINED: &str = "ethereum_metrics";

/// Event type tag for a per-source envelope.
///
/// These strings are what the downstream update policies route on
/// (price and gas time series are derived from them).
pub fn event_type_for(slot: &str) -> Option<&'static str> {
    match slot {
        sources::PRICE_DATA => Some("EthereumPrice"),
        sources::GAS_DATA => Some("GasPrice"),
        sources::NETWORK_STATS => Some("NetworkStats"),
        sources::RECENT_BLOCKS => Some("BlockSummary"),
        sources::DEFI_METRICS => Some("DefiMetrics"),
        sources::ERC20_TRANSFERS => Some("Erc20Transfer"),
        _ => None,
    }
}

/// Partition key for a cycle.
///
/// First 8 bytes of SHA-256(timestamp) as big-endian u64, modulo
/// `partitions`. Depends on nothing but its inputs, so a redelivered
/// cycle lands on the same partition across restarts and builds.
pub fn partition_key(timestamp: &str, partitions: u64) -> String {
    let digest = Sha256::digest(timestamp.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % partitions.max(1)).to_string()
}

/// Turns a combined record into the envelopes of one delivery call.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    mode: EnvelopeMode,
    partitions: u64,
}

impl EnvelopeBuilder {
    pub fn new(mode: EnvelopeMode, partitions: u64) -> Self {
        Self { mode, partitions }
    }

    /// Combined envelope first, then per-source envelopes (in slot
    /// order) when enabled. All share the cycle's partition key.
    pub fn build(&self, record: &CombinedRecord) -> Result<Vec<DeliveryEnvelope>, serde_json::Error> {
        let key = partition_key(&record.timestamp, self.partitions);

        let mut envelopes = vec![DeliveryEnvelope {
            body: serde_json::to_string(record)?,
            event_type: EVENT_COMBINED.to_string(),
            timestamp: record.timestamp.clone(),
            properties: properties(DATA_TYPE_COMBINED),
            partition_key: key.clone(),
        }];

        if self.mode == EnvelopeMode::PerSource {
            for (slot, entry) in &record.slots {
                let (Some(entry), Some(event_type)) = (entry, event_type_for(slot)) else {
                    continue;
                };
                let body = json!({
                    "timestamp": record.timestamp,
                    "event_type": event_type,
                    "source": slot,
                    "fetched_at": entry.fetched_at,
                    "data": entry.payload,
                });
                envelopes.push(DeliveryEnvelope {
                    body: serde_json::to_string(&body)?,
                    event_type: event_type.to_string(),
                    timestamp: record.timestamp.clone(),
                    properties: properties(slot),
                    partition_key: key.clone(),
                });
            }
        }

        Ok(envelopes)
    }
}

fn properties(data_type: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("source".to_string(), RECORD_SOURCE.to_string()),
        ("version".to_string(), DATA_VERSION.to_string()),
        ("data_type".to_string(), data_type.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{GasData, SourcePayload, SourceRecord};

    const TS: &str = "2024-05-01T12:00:00.000000+00:00";

    fn record() -> CombinedRecord {
        let mut r = CombinedRecord::new(TS.into());
        r.slots.insert(
            sources::GAS_DATA.into(),
            Some(SourceRecord::ok(
                sources::GAS_DATA,
                SourcePayload::Gas(GasData {
                    safe_gas_price: 10,
                    standard_gas_price: 15,
                    fast_gas_price: 25,
                }),
                TS.into(),
            )),
        );
        r.slots.insert(sources::PRICE_DATA.into(), None);
        r.errors.push("price_data: Price API error: 500".into());
        r
    }

    #[test]
    fn partition_key_is_deterministic() {
        let a = partition_key(TS, 10);
        let b = partition_key(TS, 10);
        assert_eq!(a, b);

        let n: u64 = a.parse().unwrap();
        assert!(n < 10);
        assert_eq!(partition_key(TS, 1), "0");
    }

    #[test]
    fn partition_key_spreads_timestamps() {
        let keys: std::collections::HashSet<String> = (0..200)
            .map(|i| partition_key(&format!("2024-05-01T12:00:{:02}.{:06}+00:00", i % 60, i), 10))
            .collect();
        assert!(keys.len() > 5);
    }

    #[test]
    fn combined_mode_yields_one_envelope() {
        let envelopes = EnvelopeBuilder::new(EnvelopeMode::Combined, 10).build(&record()).unwrap();

        assert_eq!(envelopes.len(), 1);
        let e = &envelopes[0];
        assert_eq!(e.event_type, "EthereumMetrics");
        assert_eq!(e.properties["source"], "ethereum_collector");
        assert_eq!(e.properties["version"], "1.0");
        assert_eq!(e.properties["data_type"], "ethereum_metrics");
        assert_eq!(e.partition_key, partition_key(TS, 10));

        let body: serde_json::Value = serde_json::from_str(&e.body).unwrap();
        assert_eq!(body["timestamp"], TS);
        assert!(body["price_data"].is_null());
        assert!(!e.body.contains('\n'));
    }

    #[test]
    fn per_source_mode_tags_populated_slots_only() {
        let envelopes = EnvelopeBuilder::new(EnvelopeMode::PerSource, 10).build(&record()).unwrap();

        let types: Vec<&str> = envelopes.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["EthereumMetrics", "GasPrice"]);

        let gas: serde_json::Value = serde_json::from_str(&envelopes[1].body).unwrap();
        assert_eq!(gas["data"]["fast_gas_price"], 25);
        assert_eq!(envelopes[1].properties["data_type"], "gas_data");
        assert!(envelopes.iter().all(|e| e.partition_key == envelopes[0].partition_key));
    }
}
