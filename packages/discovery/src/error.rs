//! Error types for the discovery pipeline.

use thiserror::Error;
use uuid::Uuid;

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Discovery pipeline errors.
///
/// Per-URL fetch failures during pre-scan are not represented here; they
/// are logged and skipped. These variants cover failures that abort a
/// phase or the whole job.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Configuration error (missing API key, invalid settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Official website could not be resolved
    #[error("Could not resolve official website: {0}")]
    UrlResolution(String),

    /// Browser adapter failure
    #[error("Browser error: {0}")]
    Browser(String),

    /// Model call failure
    #[error("Model error: {0}")]
    Model(String),

    /// Model output could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Job was cancelled cooperatively
    #[error("Job cancelled")]
    Cancelled,

    /// Unknown job id
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),
}

impl From<anthropic_client::AnthropicError> for DiscoveryError {
    fn from(err: anthropic_client::AnthropicError) -> Self {
        DiscoveryError::Model(err.to_string())
    }
}
