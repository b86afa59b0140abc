use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::config::HttpConfig;
use crate::error::SourceError;

/// ============================================================
/// HttpPool
/// ============================================================
///
/// Shared HTTP client used by every source client.
///
/// - One `reqwest::Client` (connection reuse, per-request timeout)
/// - One semaphore bounding in-flight requests across all sources
///
/// Created once in `main` and injected into the orchestrator.
/// Cloning is cheap; all clones share the same pool and permits.
#[derive(Clone)]
pub struct HttpPool {
    client: Client,
    permits: Arc<Semaphore>,
}

/// Status and raw body of a completed request.
///
/// The body is kept as bytes so callers can decide whether a
/// non-200 body is worth parsing.
#[derive(Debug)]
pub struct Fetched {
    pub status: u16,
    body: Vec<u8>,
}

impl Fetched {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn json(&self) -> Result<Value, SourceError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

impl HttpPool {
    pub fn new(cfg: &HttpConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .pool_max_idle_per_host(cfg.max_connections)
            .user_agent(concat!("eth-metrics-collector/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(cfg.max_connections)),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Sends a request and reads the whole body while holding a permit.
    ///
    /// Transport failures (timeout, refused, reset) are errors.
    /// Any HTTP status, including 5xx, is a successful `Fetched`.
    pub async fn send(&self, request: RequestBuilder) -> Result<Fetched, SourceError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SourceError::Unavailable("http pool closed".into()))?;

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();

        Ok(Fetched { status, body })
    }

    #[cfg(test)]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}
