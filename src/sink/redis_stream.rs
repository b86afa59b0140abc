use anyhow::Context;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use crate::schema::DeliveryEnvelope;

use super::EnvelopeProducer;

/// Redis Streams producer (message-bus sink).
///
/// Each envelope becomes one `XADD` entry; a cycle's envelopes
/// are written in a single MULTI/EXEC pipeline so consumers see
/// all or none of them.
///
/// The connection is opened lazily and dropped after any error,
/// so the next cycle reconnects. A Redis outage therefore shows up
/// as delivery errors, never as a startup failure.
pub struct RedisStreamProducer {
    client: redis::Client,
    stream: String,
    max_len: Option<u64>,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStreamProducer {
    pub fn new(url: &str, stream: &str, max_len: Option<u64>) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url '{}'", url))?;

        Ok(Self {
            client,
            stream: stream.to_string(),
            max_len,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> anyhow::Result<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("redis connect failed")?;
        log::info!("Connected to redis stream '{}'", self.stream);
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

/// `XADD <stream> [MAXLEN ~ n] * payload .. event_type .. partition_key .. <properties>`
pub(crate) fn xadd_command(
    stream: &str,
    max_len: Option<u64>,
    envelope: &DeliveryEnvelope,
    partition_key: Option<&str>,
) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream);
    if let Some(n) = max_len {
        cmd.arg("MAXLEN").arg("~").arg(n);
    }
    cmd.arg("*");
    cmd.arg("payload").arg(envelope.body.as_str());
    cmd.arg("event_type").arg(envelope.event_type.as_str());
    cmd.arg("timestamp").arg(envelope.timestamp.as_str());
    cmd.arg("partition_key")
        .arg(partition_key.unwrap_or(envelope.partition_key.as_str()));
    for (k, v) in &envelope.properties {
        cmd.arg(k.as_str()).arg(v.as_str());
    }
    cmd
}

#[async_trait::async_trait]
impl EnvelopeProducer for RedisStreamProducer {

    fn name(&self) -> &'static str {
        "redis"
    }

    async fn send_batch(
        &self,
        envelopes: &[DeliveryEnvelope],
        partition_key: Option<&str>,
    ) -> anyhow::Result<()> {
        if envelopes.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for envelope in envelopes {
            pipe.add_command(xadd_command(&self.stream, self.max_len, envelope, partition_key));
        }

        let mut conn = self.connection().await?;
        let written: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
        if let Err(e) = written {
            // force a reconnect on the next cycle
            *self.conn.lock().await = None;
            return Err(e).with_context(|| format!("XADD to '{}' failed", self.stream));
        }

        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.conn.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn envelope() -> DeliveryEnvelope {
        DeliveryEnvelope {
            body: r#"{"timestamp":"t"}"#.into(),
            event_type: "EthereumMetrics".into(),
            timestamp: "t".into(),
            properties: BTreeMap::from([("version".to_string(), "1.0".to_string())]),
            partition_key: "7".into(),
        }
    }

    fn packed(cmd: &redis::Cmd) -> String {
        String::from_utf8_lossy(&cmd.get_packed_command()).into_owned()
    }

    #[test]
    fn xadd_carries_payload_and_routing_fields() {
        let cmd = packed(&xadd_command("eth:events", Some(10_000), &envelope(), Some("7")));

        assert!(cmd.contains("XADD"));
        assert!(cmd.contains("eth:events"));
        assert!(cmd.contains("MAXLEN"));
        assert!(cmd.contains("10000"));
        assert!(cmd.contains(r#"{"timestamp":"t"}"#));
        assert!(cmd.contains("EthereumMetrics"));
        assert!(cmd.contains("partition_key"));
        assert!(cmd.contains("version"));
    }

    #[test]
    fn uncapped_stream_has_no_maxlen() {
        let cmd = packed(&xadd_command("eth:events", None, &envelope(), None));
        assert!(!cmd.contains("MAXLEN"));
    }

    #[tokio::test]
    async fn unreachable_redis_is_a_delivery_error() {
        let producer = RedisStreamProducer::new("redis://127.0.0.1:9/", "eth:events", None).unwrap();
        let result = producer.send_batch(&[envelope()], Some("7")).await;
        assert!(result.is_err());
    }

    #[test]
    fn bad_url_is_rejected_at_startup() {
        assert!(RedisStreamProducer::new("not a url", "s", None).is_err());
    }
}
