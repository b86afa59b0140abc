use thiserror::Error;

// ------------------------------------------------------------
// Error taxonomy
// ------------------------------------------------------------
//
// - SourceError:   one upstream source failed (recovered by the orchestrator)
// - DeliveryError: the sink rejected the cycle (recovered by the loop)
// - ConfigError:   startup validation failed (fatal)
//
// Partial degradation inside a multi-call source never reaches these
// types; it is handled by the source's declared failure policy.
//

/// Failure of a single upstream fetch.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Upstream answered with a non-200 status.
    #[error("{api} API error: {status}")]
    Status { api: &'static str, status: u16 },

    /// A documented field is absent from the response body.
    #[error("missing field `{0}` in response")]
    MissingField(String),

    /// A field is present but cannot be decoded (bad hex, not a number).
    #[error("invalid field `{field}`: {detail}")]
    InvalidField { field: String, detail: String },

    /// Transport-level failure: timeout, DNS, connection refused, ...
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Body was not valid JSON.
    #[error("malformed response body: {0}")]
    Json(#[from] serde_json::Error),

    /// Source cannot run with the current configuration.
    #[error("{0}")]
    Unavailable(String),
}

impl SourceError {
    pub fn invalid(field: impl Into<String>, detail: impl ToString) -> Self {
        SourceError::InvalidField {
            field: field.into(),
            detail: detail.to_string(),
        }
    }
}

/// The sink could not accept a cycle's envelopes.
///
/// Producers work with `anyhow` internally; the adapter flattens the
/// error chain into `detail` at the boundary.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("sink `{sink}` rejected delivery: {detail}")]
    Sink { sink: &'static str, detail: String },
}

/// Missing or inconsistent configuration, detected before the loop starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required configuration key `{0}`")]
    Missing(&'static str),

    #[error("invalid configuration value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}
