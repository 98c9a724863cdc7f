//! Typed failures raised by the asset pipeline and the search subsystem.
//!
//! Orchestration code works in `anyhow::Result`; these variants are
//! recovered with `downcast_ref` wherever the kind of failure changes what
//! happens next (HTTP error categorisation, per-visualization logging).

use thiserror::Error;

/// Maximum number of characters of an upstream error body kept in
/// [`PublishError::AssetFetch`].
pub const ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum PublishError {
    /// The declared MIME type has no normalization rule.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// The backend answered an asset download with a non-2xx status.
    #[error("failed to fetch asset {url}: HTTP {status}: {body}")]
    AssetFetch {
        url: String,
        status: u16,
        body: String,
    },

    /// No resolver rule matched the asset reference.
    #[error("unrecognized asset source: {0}")]
    UnrecognizedAssetSource(String),

    #[error("invalid data URI: {0}")]
    InvalidDataUri(String),

    /// Generic REST failure against Splunkd.
    #[error("Splunkd responded with HTTP status {status} requesting {path}")]
    Splunkd { path: String, status: u16 },

    /// An HTTP request hit the client timeout.
    #[error("{method} {url} timed out")]
    Timeout { method: String, url: String },

    /// The search job could not be created.
    #[error("Failed to dispatch job, Splunk returned HTTP status {status}")]
    Dispatch { status: u16 },

    /// The search job was created but reported failure.
    #[error("Search job failed (sid {sid})")]
    SearchExecution { sid: String },

    /// The job never reached a terminal state within the poll ceiling.
    #[error("Search job {sid} timed out after {polls} status checks")]
    PollLimitExceeded { sid: String, polls: u32 },
}

impl PublishError {
    /// Build an [`PublishError::AssetFetch`], truncating the body.
    pub fn asset_fetch(url: impl Into<String>, status: u16, body: &str) -> Self {
        PublishError::AssetFetch {
            url: url.into(),
            status,
            body: body.chars().take(ERROR_BODY_LIMIT).collect(),
        }
    }
}
