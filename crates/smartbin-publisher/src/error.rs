//! Publisher error types.
//!
//! Every publisher subsystem surfaces errors through [`PublishError`].
//! Upload rejections are not errors: they are reported as an
//! [`UploadOutcome`](crate::transport::UploadOutcome) and retried.

use std::path::PathBuf;

use smartbin_kernel::{DriverError, KernelError};

/// Unified error type for the sample publisher.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Reading or writing the on-disk journal failed.
    #[error("journal i/o failed at {}: {source}", path.display())]
    Journal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The secret store could not be read or parsed.
    #[error("secret store {}: {reason}", path.display())]
    Secrets { path: PathBuf, reason: String },

    /// A secret required for the operation is not configured.
    #[error("missing secret `{key}`")]
    MissingSecret { key: String },

    /// The configured endpoint is not a valid base URL.
    #[error("invalid endpoint `{url}`: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    /// The operator alert could not be delivered.
    #[error("alert delivery failed: {reason}")]
    Alert { reason: String },

    /// An operation exceeded its time limit.
    #[error("timeout after {seconds}s: {reason}")]
    Timeout { seconds: u64, reason: String },

    /// The enrichment step failed.
    #[error("enrichment failed: {reason}")]
    Enrichment { reason: String },

    /// A registry operation failed.
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the publisher crate.
pub type Result<T> = std::result::Result<T, PublishError>;

impl From<PublishError> for DriverError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Kernel(e) => DriverError::Registry(e),
            PublishError::Io(e) => DriverError::Io(e),
            other => DriverError::Other(other.to_string()),
        }
    }
}
