//! Delivery sink layer
//!
//! - `Deliver`:          what the collection loop talks to
//! - `DeliveryAdapter`:  record -> envelopes -> producer
//! - `EnvelopeProducer`: one implementation per downstream system
//!
//! The adapter never retries. A failed delivery is reported to the
//! loop, which abandons the cycle.

pub mod envelope;
mod bulk_ingest;
mod redis_stream;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{SinkConfig, SinkKind};
use crate::error::DeliveryError;
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::schema::{CombinedRecord, DeliveryEnvelope};

use envelope::EnvelopeBuilder;

/// Producer interface over a concrete downstream system.
///
/// CONTRACT:
/// - One call per cycle with every envelope of that cycle
/// - `partition_key` is the same for all envelopes in the batch
/// - No internal retries; errors are returned as-is
#[async_trait::async_trait]
pub trait EnvelopeProducer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_batch(
        &self,
        envelopes: &[DeliveryEnvelope],
        partition_key: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Releases connections at shutdown.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// `deliver(record) -> Ok(envelopes sent) | Err`
#[async_trait::async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, record: &CombinedRecord) -> Result<usize, DeliveryError>;
}

pub struct DeliveryAdapter {
    producer: Arc<dyn EnvelopeProducer>,
    builder: EnvelopeBuilder,
    log_payloads: bool,
}

impl DeliveryAdapter {
    pub fn new(producer: Arc<dyn EnvelopeProducer>, builder: EnvelopeBuilder, log_payloads: bool) -> Self {
        Self {
            producer,
            builder,
            log_payloads,
        }
    }
}

#[async_trait::async_trait]
impl Deliver for DeliveryAdapter {
    async fn deliver(&self, record: &CombinedRecord) -> Result<usize, DeliveryError> {
        let envelopes = self.builder.build(record)?;
        let partition_key = envelopes.first().map(|e| e.partition_key.clone());

        if self.log_payloads {
            for e in &envelopes {
                log::debug!("[{} key={}] {}", e.event_type, e.partition_key, e.body);
            }
        }

        let sink = self.producer.name();
        match self.producer.send_batch(&envelopes, partition_key.as_deref()).await {
            Ok(()) => {
                RuntimeMetrics::add(&METRICS.envelopes_sent, envelopes.len());
                log::info!(
                    "Data sent to {} successfully at {} ({} envelopes, partition {})",
                    sink,
                    record.timestamp,
                    envelopes.len(),
                    partition_key.as_deref().unwrap_or("-"),
                );
                Ok(envelopes.len())
            }
            Err(e) => {
                RuntimeMetrics::incr(&METRICS.delivery_errors);
                log::error!("Failed to send data to {}: {:#}", sink, e);
                Err(DeliveryError::Sink {
                    sink,
                    detail: format!("{:#}", e),
                })
            }
        }
    }
}

/// Demo producer: envelopes are only logged.
pub struct StdoutProducer;

#[async_trait::async_trait]
impl EnvelopeProducer for StdoutProducer {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn send_batch(
        &self,
        envelopes: &[DeliveryEnvelope],
        partition_key: Option<&str>,
    ) -> anyhow::Result<()> {
        for e in envelopes {
            log::info!("DEMO → [{} key={}] {}", e.event_type, partition_key.unwrap_or("-"), e.body);
        }
        Ok(())
    }
}

/// Builds the producer selected by `sink.kind`.
///
/// Network producers connect lazily (redis) or in the background
/// (websocket), so a downstream outage at startup is not fatal.
pub fn build_producer(cfg: &SinkConfig, timeout: Duration) -> anyhow::Result<Arc<dyn EnvelopeProducer>> {
    let producer: Arc<dyn EnvelopeProducer> = match &cfg.kind {
        SinkKind::Redis(r) => Arc::new(redis_stream::RedisStreamProducer::new(
            r.url.as_deref().unwrap_or_default(),
            r.stream.as_deref().unwrap_or_default(),
            r.max_len,
        )?),
        SinkKind::BulkIngest(b) => Arc::new(bulk_ingest::BulkIngestProducer::new(b, timeout)?),
        SinkKind::Websocket(w) => Arc::new(websocket::MasterPool::new(
            w.url.as_deref().unwrap_or_default(),
            w.key.as_deref().unwrap_or_default(),
            w.connections,
        )),
        SinkKind::Stdout => {
            log::warn!("Sink running in DEMO mode (stdout)");
            Arc::new(StdoutProducer)
        }
    };

    Ok(producer)
}
