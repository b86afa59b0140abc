use crate::error::SourceError;
use crate::http::HttpPool;
use crate::schema::SourcePayload;

/// How a source reacts to failures below the whole-source level.
///
/// Declared by every source so the orchestrator (and the logs)
/// can tell the three behaviors apart:
///
/// - Propagate:         any failure fails the source
/// - SubstituteDefault: failed sub-calls fall back to documented defaults
/// - SkipItem:          failed sub-items are dropped from the result
///
/// Transport-level failures of a mandatory request still propagate
/// under every policy except where a source says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Propagate,
    SubstituteDefault,
    SkipItem,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Propagate => "propagate",
            FailurePolicy::SubstituteDefault => "default",
            FailurePolicy::SkipItem => "skip",
        }
    }
}

/// DataSource is the abstraction layer between:
/// - The generic collection orchestrator
/// - One upstream REST API
///
/// Each source implementation must:
/// - Build its requests from its own configuration
/// - Parse the upstream JSON using the upstream field names
/// - Normalize the result into a `SourcePayload`
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - Instances are shared across cycles behind `Arc`
///
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {

    /// Slot name in the combined record (e.g. "price_data").
    ///
    /// CONTRACT:
    /// - Must match the name used in `collection.sources`
    /// - Must be stable; downstream tables key on it
    fn name(&self) -> &'static str;

    /// Declared reaction to partial failures.
    fn failure_policy(&self) -> FailurePolicy;

    /// Performs one fetch.
    ///
    /// IMPORTANT:
    /// - Must never panic on malformed upstream data
    /// - Must not retry; the next cycle is the retry
    /// - All requests go through `http` so the shared bound applies
    async fn fetch(&self, http: &HttpPool) -> Result<SourcePayload, SourceError>;
}
