use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::Result;

use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::AbortHandle;
use tokio::time::{Duration, sleep};

use rand::random_range;

use crate::schema::DeliveryEnvelope;

use super::EnvelopeProducer;

const QUEUE_CAPACITY: usize = 1_000;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// ============================================================
/// MasterSender
/// ============================================================
///
/// Represents a **single persistent WebSocket connection** to the
/// master ingestion service.
///
/// Responsibilities:
/// - Perform login handshake
/// - Send envelopes from an internal queue
/// - Send periodic JSON pings
/// - Reconnect automatically
///
/// Unlike a fire-and-forget feed, a queued envelope counts as
/// delivered, so `send` refuses (with an error) while the socket
/// is down or the queue is full.
#[derive(Clone)]
pub struct MasterSender {
    /// Replaced on every reconnect
    queue: Arc<Mutex<mpsc::Sender<String>>>,

    /// True between a successful login and the next disconnect
    connected: Arc<AtomicBool>,

    task: AbortHandle,
}

impl MasterSender {

    /// Starts a persistent reconnect loop to the master.
    ///
    /// CONTRACT:
    /// - This function never fails
    /// - All connection errors are handled internally
    pub fn connect_loop(master_url: String, login_msg: String) -> Self {
        let (tx, _) = mpsc::channel::<String>(QUEUE_CAPACITY);
        let queue = Arc::new(Mutex::new(tx));
        let connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn({
            let queue = queue.clone();
            let connected = connected.clone();

            async move {
                loop {
                    // Fresh queue per connection; stale envelopes are dropped
                    let (tx, rx) = mpsc::channel::<String>(QUEUE_CAPACITY);
                    {
                        let mut q = queue.lock().await;
                        *q = tx;
                    }

                    if let Err(e) = Self::try_connect(
                        &master_url,
                        &login_msg,
                        rx,
                        connected.clone(),
                    ).await {
                        log::warn!("Master connection lost: {:#}", e);
                    }
                    connected.store(false, Ordering::SeqCst);

                    sleep(RECONNECT_DELAY).await;
                }
            }
        });

        Self {
            queue,
            connected,
            task: task.abort_handle(),
        }
    }

    /// Establishes a single WebSocket connection to the master.
    ///
    /// TERMINATION:
    /// - Returns an error when the connection is closed
    async fn try_connect(
        master_url: &str,
        login_msg: &str,
        mut rx: mpsc::Receiver<String>,
        connected: Arc<AtomicBool>,
    ) -> Result<()> {
        let (ws, _) = connect_async(master_url).await?;
        let (mut write, mut read) = ws.split();

        let closed = Arc::new(Notify::new());

        // ------------------------------------------------------------
        // LOGIN HANDSHAKE
        // ------------------------------------------------------------
        write.send(Message::Text(login_msg.to_string().into())).await?;
        connected.store(true, Ordering::SeqCst);
        log::info!("Connected to master {}", master_url);

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);

        // ------------------------------------------------------------
        // READER TASK
        // ------------------------------------------------------------
        // Incoming frames are ignored; EOF stops the writer.
        let reader = tokio::spawn({
            let closed = closed.clone();

            async move {
                while let Some(Ok(msg)) = read.next().await {
                    if let Message::Text(text) = msg {
                        log::trace!("[master recv] {}", text);
                    }
                }
                closed.notify_one();
            }
        });

        // ------------------------------------------------------------
        // WRITER LOOP
        // ------------------------------------------------------------
        let result = loop {
            tokio::select! {
                Some(json) = rx.recv() => {
                    if let Err(e) = write.send(Message::Text(json.into())).await {
                        break Err(e.into());
                    }
                }

                _ = ping_interval.tick() => {
                    let ping = r#"{"op":"ping"}"#;
                    if let Err(e) = write.send(Message::Text(ping.into())).await {
                        break Err(e.into());
                    }
                }

                _ = closed.notified() => {
                    break Err(anyhow::anyhow!("master closed connection"));
                }
            }
        };

        connected.store(false, Ordering::SeqCst);
        reader.abort();
        result
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Enqueues a whole batch of serialized envelopes without blocking.
    pub async fn send_all(&self, batch: Vec<String>) -> Result<()> {
        if !self.is_connected() {
            anyhow::bail!("master connection not established");
        }

        let tx = self.queue.lock().await;
        enqueue_all(&tx, batch)
    }

    fn shutdown(&self) {
        self.task.abort();
    }
}

/// Queues every item or none of them.
///
/// Slots for the whole batch are reserved before the first send, so
/// a full queue never leaves part of a cycle behind.
fn enqueue_all(tx: &mpsc::Sender<String>, batch: Vec<String>) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let permits = match tx.try_reserve_many(batch.len()) {
        Ok(permits) => permits,
        Err(mpsc::error::TrySendError::Full(_)) => {
            anyhow::bail!("master send queue full")
        }
        Err(e) => return Err(anyhow::anyhow!("send error: {}", e)),
    };

    for (permit, json) in permits.zip(batch) {
        permit.send(json);
    }
    Ok(())
}

/// ============================================================
/// MasterPool
/// ============================================================
///
/// Manages multiple `MasterSender` connections.
///
/// Routing:
/// - Numeric partition key -> sender `key % n` (stable per cycle)
/// - No key -> random sender
pub struct MasterPool {
    senders: Vec<MasterSender>,
}

impl MasterPool {

    /// Creates a pool of master connections.
    ///
    /// LOGIN FORMAT:
    /// - key=<API_KEY>&role=collector
    pub fn new(master_url: &str, key: &str, count: usize) -> Self {
        let login = format!("key={}&role=collector", key);
        let senders = (0..count.max(1))
            .map(|_| MasterSender::connect_loop(master_url.to_string(), login.clone()))
            .collect();

        Self { senders }
    }

    pub(crate) fn pick(&self, partition_key: Option<&str>) -> usize {
        let n = self.senders.len();
        match partition_key.and_then(|k| k.parse::<u64>().ok()) {
            Some(k) => (k % n as u64) as usize,
            None => random_range(0..n),
        }
    }
}

#[async_trait::async_trait]
impl EnvelopeProducer for MasterPool {

    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn send_batch(
        &self,
        envelopes: &[DeliveryEnvelope],
        partition_key: Option<&str>,
    ) -> anyhow::Result<()> {
        let sender = &self.senders[self.pick(partition_key)];

        let batch = envelopes
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        sender.send_all(batch).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        for sender in &self.senders {
            sender.shutdown();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn envelope() -> DeliveryEnvelope {
        DeliveryEnvelope {
            body: "{}".into(),
            event_type: "EthereumMetrics".into(),
            timestamp: "t".into(),
            properties: BTreeMap::new(),
            partition_key: "4".into(),
        }
    }

    #[tokio::test]
    async fn partition_key_picks_a_stable_sender() {
        let pool = MasterPool::new("ws://127.0.0.1:9", "k", 3);

        assert_eq!(pool.pick(Some("4")), 1);
        assert_eq!(pool.pick(Some("4")), 1);
        assert!(pool.pick(None) < 3);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn disconnected_master_rejects_delivery() {
        let pool = MasterPool::new("ws://127.0.0.1:9", "k", 1);

        let err = pool.send_batch(&[envelope()], Some("4")).await.unwrap_err();
        assert!(err.to_string().contains("not established"));
        pool.close().await.unwrap();
    }

    #[test]
    fn batch_larger_than_free_queue_space_is_not_split() {
        let (tx, mut rx) = mpsc::channel::<String>(2);
        let batch = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let err = enqueue_all(&tx, batch).unwrap_err();

        assert!(err.to_string().contains("queue full"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn batch_that_fits_is_queued_in_order() {
        let (tx, mut rx) = mpsc::channel::<String>(3);

        enqueue_all(&tx, vec!["a".to_string(), "b".to_string()]).unwrap();

        assert_eq!(rx.try_recv().unwrap(), "a");
        assert_eq!(rx.try_recv().unwrap(), "b");
        assert!(rx.try_recv().is_err());
    }
}
