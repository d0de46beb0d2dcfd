//! File-backed authorization tokens for the photo-library accounts.
//!
//! Each account has its own token file (`token.json`, `token2.json`)
//! holding at least an `access_token`. Obtaining the token is done out of
//! band; this store only reads it and deletes it when the destination
//! reports it as invalid.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::UploadError;
use crate::executors::CredentialStore;
use crate::scheduler::{AccountSlot, Destination};

#[derive(Deserialize)]
struct TokenFile {
    access_token: Option<String>,
}

/// Token files in a directory.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn token_path(&self, account: AccountSlot) -> PathBuf {
        let name = match account {
            AccountSlot::First => "token.json",
            AccountSlot::Second => "token2.json",
        };
        self.dir.join(name)
    }
}

async fn read_token(path: &Path) -> Result<Option<SecretString>, UploadError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let parsed: TokenFile = serde_json::from_str(&raw)?;
    Ok(parsed
        .access_token
        .filter(|t| !t.trim().is_empty())
        .map(SecretString::from))
}

#[async_trait]
impl CredentialStore for TokenStore {
    async fn access_token(&self, account: AccountSlot) -> Result<Option<SecretString>, UploadError> {
        read_token(&self.token_path(account)).await
    }

    async fn invalidate(&self, destination: Destination) -> Result<(), UploadError> {
        let Destination::PhotoLibrary { account } = destination else {
            tracing::debug!(%destination, "No cached authorization to clear");
            return Ok(());
        };
        let path = self.token_path(account);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::warn!(path = %path.display(), "Deleted invalid authorization token");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
