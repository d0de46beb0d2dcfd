//! Job executors: the collaborators a job calls out to.
//!
//! Each concern sits behind a narrow async trait so the runner can be
//! driven by stubs in tests:
//! - [`MediaFetcher`]: link → local file (yt-dlp, gallery-dl)
//! - [`Uploader`]: local file → destination (Google Photos, GoFile)
//! - [`CredentialStore`]: per-account authorization tokens
//! - [`CaptionFetcher`] and [`TextPipeline`]: the lyrics command

pub mod captions;
pub mod credentials;
pub mod fetch;
pub mod retry;
pub mod text;
pub mod upload;

pub use captions::YtDlpCaptionFetcher;
pub use credentials::TokenStore;
pub use fetch::{FetchConfig, ToolFetcher};
pub use retry::RetryPolicy;
pub use text::{GeminiCleaner, preprocess_captions};
pub use upload::{DestinationUploader, GoFileUploader, GooglePhotosUploader};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::{FetchError, LlmError, UploadError};
use crate::scheduler::{AccountSlot, Destination};

/// A fetched file ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    /// Human-readable title, used in the partner notification.
    pub title: String,
}

impl Artifact {
    /// Build an artifact titled after the file stem.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "untitled".to_string());
        Self { path, title }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string())
    }
}

/// Result of handing an artifact to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Stored. File hosts answer with a share link.
    Success { link: Option<String> },
    /// The destination's cached authorization is stale.
    AuthInvalid,
    Failed(String),
}

/// Downloads remote media into a working directory.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str, work_dir: &Path) -> Result<Artifact, FetchError>;
}

/// Uploads an artifact to a destination.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, artifact: &Artifact, destination: Destination) -> UploadOutcome;
}

/// Cached per-account authorization.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Current access token, `None` if the account was never authorized or
    /// its authorization was invalidated.
    async fn access_token(&self, account: AccountSlot) -> Result<Option<SecretString>, UploadError>;

    /// Forget the cached authorization for `destination`.
    async fn invalidate(&self, destination: Destination) -> Result<(), UploadError>;
}

/// Fetches raw manual subtitles for a video link.
#[async_trait]
pub trait CaptionFetcher: Send + Sync {
    async fn fetch_captions(&self, url: &str) -> Result<String, FetchError>;
}

/// Turns raw caption text into clean lyrics.
#[async_trait]
pub trait TextPipeline: Send + Sync {
    async fn clean(&self, raw_captions: &str) -> Result<String, LlmError>;
}
