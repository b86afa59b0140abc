use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use anyhow::{Context, bail};
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::Client;

use crate::config::BulkIngestConfig;
use crate::schema::DeliveryEnvelope;

use super::EnvelopeProducer;

/// Streaming-ingest client for the analytical store.
///
/// One POST per target table:
///
///     POST <endpoint>/v1/rest/ingest/<database>/<table>?streamFormat=MultiJSON
///
/// Body is one JSON object per line:
///     {"Timestamp": .., "EventType": .., "PartitionKey": .., "Payload": <envelope body>}
///
/// Tables are chosen by event type (`tables`), falling back to
/// `default_table`, which matches the raw event log layout.
pub struct BulkIngestProducer {
    http: Client,
    endpoint: String,
    database: String,
    default_table: String,
    tables: BTreeMap<String, String>,
    token: Option<String>,
    gzip: bool,
}

impl BulkIngestProducer {
    pub fn new(cfg: &BulkIngestConfig, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = cfg
            .endpoint
            .clone()
            .context("bulk ingest sink needs `endpoint`")?;
        let database = cfg
            .database
            .clone()
            .context("bulk ingest sink needs `database`")?;

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build ingest http client")?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            database,
            default_table: cfg.default_table.clone(),
            tables: cfg.tables.clone(),
            token: cfg.token.clone().filter(|t| !t.is_empty()),
            gzip: cfg.gzip,
        })
    }

    pub(crate) fn table_for(&self, event_type: &str) -> &str {
        self.tables
            .get(event_type)
            .map(String::as_str)
            .unwrap_or(&self.default_table)
    }

    fn ingest_url(&self, table: &str) -> String {
        format!("{}/v1/rest/ingest/{}/{}", self.endpoint, self.database, table)
    }

    fn encode(&self, lines: &str) -> anyhow::Result<Vec<u8>> {
        if !self.gzip {
            return Ok(lines.as_bytes().to_vec());
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(lines.as_bytes())?;
        Ok(encoder.finish()?)
    }
}

/// One MultiJSON line. The envelope body is already JSON and is
/// embedded as-is.
pub(crate) fn ingest_line(envelope: &DeliveryEnvelope, partition_key: &str) -> anyhow::Result<String> {
    Ok(format!(
        r#"{{"Timestamp":{},"EventType":{},"PartitionKey":{},"Payload":{}}}"#,
        serde_json::to_string(&envelope.timestamp)?,
        serde_json::to_string(&envelope.event_type)?,
        serde_json::to_string(partition_key)?,
        envelope.body,
    ))
}

#[async_trait::async_trait]
impl EnvelopeProducer for BulkIngestProducer {

    fn name(&self) -> &'static str {
        "bulk_ingest"
    }

    async fn send_batch(
        &self,
        envelopes: &[DeliveryEnvelope],
        partition_key: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut by_table: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for envelope in envelopes {
            let key = partition_key.unwrap_or(&envelope.partition_key);
            by_table
                .entry(self.table_for(&envelope.event_type))
                .or_default()
                .push(ingest_line(envelope, key)?);
        }

        for (table, lines) in by_table {
            let body = self.encode(&lines.join("\n"))?;

            let mut request = self
                .http
                .post(self.ingest_url(table))
                .query(&[("streamFormat", "MultiJSON")])
                .header("Content-Type", "application/json; charset=utf-8")
                .body(body);
            if self.gzip {
                request = request.header("Content-Encoding", "gzip");
            }
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("ingest into '{}' failed", table))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                bail!(
                    "ingest into '{}' rejected with status {}: {}",
                    table,
                    status.as_u16(),
                    text.chars().take(200).collect::<String>()
                );
            }

            log::debug!("Ingested {} records to {}", lines.len(), table);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use httpmock::prelude::*;
    use std::io::Read;

    fn config(endpoint: String, gzip: bool) -> BulkIngestConfig {
        BulkIngestConfig {
            endpoint: Some(endpoint),
            database: Some("eth".into()),
            default_table: "EthereumEvents".into(),
            tables: BTreeMap::from([("GasPrice".to_string(), "eth_gas_raw".to_string())]),
            token: Some("tok".into()),
            gzip,
        }
    }

    fn envelope(event_type: &str) -> DeliveryEnvelope {
        DeliveryEnvelope {
            body: r#"{"a":1}"#.into(),
            event_type: event_type.into(),
            timestamp: "2024-05-01T00:00:00+00:00".into(),
            properties: BTreeMap::new(),
            partition_key: "3".into(),
        }
    }

    #[test]
    fn line_embeds_body_verbatim() {
        let line = ingest_line(&envelope("GasPrice"), "3").unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(v["EventType"], "GasPrice");
        assert_eq!(v["PartitionKey"], "3");
        assert_eq!(v["Payload"]["a"], 1);
        assert_eq!(v["Timestamp"], "2024-05-01T00:00:00+00:00");
    }

    #[test]
    fn gzip_round_trips() {
        let producer = BulkIngestProducer::new(&config("http://x".into(), true), Duration::from_secs(5)).unwrap();
        let compressed = producer.encode("line1\nline2").unwrap();

        let mut out = String::new();
        GzDecoder::new(&compressed[..]).read_to_string(&mut out).unwrap();
        assert_eq!(out, "line1\nline2");
    }

    #[tokio::test]
    async fn routes_event_types_to_tables() {
        let server = MockServer::start_async().await;
        let events = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/rest/ingest/eth/EthereumEvents")
                    .query_param("streamFormat", "MultiJSON")
                    .header("Authorization", "Bearer tok");
                then.status(200);
            })
            .await;
        let gas = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/rest/ingest/eth/eth_gas_raw");
                then.status(200);
            })
            .await;

        let producer = BulkIngestProducer::new(&config(server.base_url(), false), Duration::from_secs(5)).unwrap();
        producer
            .send_batch(&[envelope("EthereumMetrics"), envelope("GasPrice")], Some("3"))
            .await
            .unwrap();

        events.assert_async().await;
        gas.assert_async().await;
    }

    #[tokio::test]
    async fn throttling_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(429).body("throttled");
            })
            .await;

        let producer = BulkIngestProducer::new(&config(server.base_url(), true), Duration::from_secs(5)).unwrap();
        let err = producer
            .send_batch(&[envelope("EthereumMetrics")], None)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("429"));
    }
}
