//! Error types for the courier.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Transport (chat channel) errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Channel {name} logged out: {reason}")]
    LoggedOut { name: String, reason: String },

    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to download attachment on channel {name}: {reason}")]
    DownloadFailed { name: String, reason: String },

    #[error("Channel {name} does not support {operation}")]
    Unsupported { name: String, operation: String },
}

/// Media and caption fetch errors.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{tool} is not installed or not on PATH")]
    ToolMissing { tool: String },

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("No matching output file found in {}", dir.display())]
    NoArtifact { dir: PathBuf },

    #[error("No manual subtitles available for this video")]
    NoManualSubtitles,

    #[error("Attachment download failed: {0}")]
    Attachment(#[from] ChannelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upload backend errors. Surfaced to the requester as `UploadFailed`.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} rejected the upload ({status}): {body}")]
    Rejected {
        service: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {service}: {reason}")]
    InvalidResponse { service: String, reason: String },

    #[error("Credential store error: {0}")]
    Credentials(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Text-pipeline (generative cleanup) errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("No API key configured for {provider}")]
    NotConfigured { provider: String },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Random-pick catalog errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a job ended without delivering its artifact.
///
/// Submission-time dispositions (ignored, rejected, queued) live in
/// [`crate::scheduler::Disposition`]; these are the terminal failures of a
/// job that actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JobFailure {
    #[error("content fetch failed")]
    FetchFailed,

    #[error("destination credential is invalid")]
    AuthInvalid,

    #[error("upload failed")]
    UploadFailed,

    #[error("transport lost while reporting progress")]
    TransportLost,

    #[error("job aborted unexpectedly")]
    UnknownFatal,
}

/// Result type alias for the courier.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_errors_convert_into_top_level() {
        let err: Error = ConfigError::MissingEnvVar("COURIER_PRIMARY_ID".into()).into();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("COURIER_PRIMARY_ID"));
    }

    #[test]
    fn rate_limit_display_includes_delay() {
        let err = LlmError::RateLimited {
            provider: "gemini".into(),
            retry_after: Some(Duration::from_secs(12)),
        };
        assert!(err.to_string().contains("12s"));
    }

    #[test]
    fn channel_error_lifts_into_fetch_error() {
        let err: FetchError = ChannelError::Unsupported {
            name: "cli".into(),
            operation: "attachments".into(),
        }
        .into();
        assert!(matches!(err, FetchError::Attachment(_)));
    }
}
