//! Upload backends: Google Photos libraries and the GoFile file host.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::error::UploadError;
use crate::executors::{Artifact, CredentialStore, UploadOutcome, Uploader};
use crate::scheduler::{AccountSlot, Destination};

const PHOTOS_BASE_URL: &str = "https://photoslibrary.googleapis.com/v1";
const GOFILE_UPLOAD_URL: &str = "https://upload.gofile.io/uploadfile";

/// Log and flatten an upload attempt into an outcome.
fn settle(service: &str, result: Result<UploadOutcome, UploadError>) -> UploadOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(service, error = %e, "Upload failed");
            UploadOutcome::Failed(e.to_string())
        }
    }
}

async fn rejected(service: &str, response: reqwest::Response) -> UploadError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    UploadError::Rejected {
        service: service.to_string(),
        status,
        body,
    }
}

// ── Google Photos ───────────────────────────────────────────────────

/// Two-step Google Photos upload: raw bytes, then `mediaItems:batchCreate`.
pub struct GooglePhotosUploader {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialStore>,
    base_url: String,
}

impl GooglePhotosUploader {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            base_url: PHOTOS_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn try_upload(
        &self,
        artifact: &Artifact,
        account: AccountSlot,
    ) -> Result<UploadOutcome, UploadError> {
        let Some(token) = self.credentials.access_token(account).await? else {
            tracing::warn!(account = account.number(), "No authorization token for account");
            return Ok(UploadOutcome::AuthInvalid);
        };
        let bytes = tokio::fs::read(&artifact.path).await?;
        let file_name = artifact.file_name();

        let response = self
            .client
            .post(format!("{}/uploads", self.base_url))
            .bearer_auth(token.expose_secret())
            .header("Content-Type", "application/octet-stream")
            .header("X-Goog-Upload-File-Name", &file_name)
            .header("X-Goog-Upload-Protocol", "raw")
            .body(bytes)
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(UploadOutcome::AuthInvalid);
        }
        if !response.status().is_success() {
            return Err(rejected("google-photos", response).await);
        }
        let upload_token = response.text().await?;

        let payload = json!({
            "newMediaItems": [{
                "description": artifact.title,
                "simpleMediaItem": { "uploadToken": upload_token, "fileName": file_name }
            }]
        });
        let response = self
            .client
            .post(format!("{}/mediaItems:batchCreate", self.base_url))
            .bearer_auth(token.expose_secret())
            .json(&payload)
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(UploadOutcome::AuthInvalid);
        }
        if !response.status().is_success() {
            return Err(rejected("google-photos", response).await);
        }

        let created: serde_json::Value = response.json().await?;
        let link = created["newMediaItemResults"][0]["mediaItem"]["productUrl"]
            .as_str()
            .map(str::to_string);
        tracing::info!(account = account.number(), file = %file_name, "Stored in photo library");
        Ok(UploadOutcome::Success { link })
    }
}

#[async_trait]
impl Uploader for GooglePhotosUploader {
    async fn upload(&self, artifact: &Artifact, destination: Destination) -> UploadOutcome {
        let Destination::PhotoLibrary { account } = destination else {
            return UploadOutcome::Failed(format!("photo library cannot serve {destination}"));
        };
        settle("google-photos", self.try_upload(artifact, account).await)
    }
}

// ── GoFile ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct GoFileResponse {
    status: String,
    data: Option<GoFileData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoFileData {
    download_page: Option<String>,
}

/// Parse a GoFile upload reply into its download page.
pub fn parse_gofile_response(body: &str) -> Result<String, UploadError> {
    let parsed: GoFileResponse = serde_json::from_str(body)?;
    if parsed.status != "ok" {
        return Err(UploadError::InvalidResponse {
            service: "gofile".into(),
            reason: format!("status {}", parsed.status),
        });
    }
    parsed
        .data
        .and_then(|d| d.download_page)
        .ok_or_else(|| UploadError::InvalidResponse {
            service: "gofile".into(),
            reason: "missing downloadPage".into(),
        })
}

/// Multipart upload to GoFile; answers with a share link.
pub struct GoFileUploader {
    client: reqwest::Client,
    api_token: Option<SecretString>,
    endpoint: String,
}

impl GoFileUploader {
    pub fn new(api_token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_token,
            endpoint: GOFILE_UPLOAD_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn try_upload(&self, artifact: &Artifact) -> Result<UploadOutcome, UploadError> {
        let bytes = tokio::fs::read(&artifact.path).await?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(artifact.file_name());
        let form = reqwest::multipart::Form::new().part("file", part);

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(rejected("gofile", response).await);
        }
        let body = response.text().await?;
        let link = parse_gofile_response(&body)?;
        tracing::info!(file = %artifact.file_name(), link = %link, "Stored on file host");
        Ok(UploadOutcome::Success { link: Some(link) })
    }
}

#[async_trait]
impl Uploader for GoFileUploader {
    async fn upload(&self, artifact: &Artifact, _destination: Destination) -> UploadOutcome {
        settle("gofile", self.try_upload(artifact).await)
    }
}

// ── Routing ─────────────────────────────────────────────────────────

/// Sends each artifact to the backend serving its destination.
pub struct DestinationUploader {
    photo_library: Arc<dyn Uploader>,
    file_host: Arc<dyn Uploader>,
}

impl DestinationUploader {
    pub fn new(photo_library: Arc<dyn Uploader>, file_host: Arc<dyn Uploader>) -> Self {
        Self {
            photo_library,
            file_host,
        }
    }
}

#[async_trait]
impl Uploader for DestinationUploader {
    async fn upload(&self, artifact: &Artifact, destination: Destination) -> UploadOutcome {
        match destination {
            Destination::PhotoLibrary { .. } => {
                self.photo_library.upload(artifact, destination).await
            }
            Destination::FileHost => self.file_host.upload(artifact, destination).await,
        }
    }
}
