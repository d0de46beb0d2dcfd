//! Categorized list of items for the random-pick commands.
//!
//! The catalog is a JSON object mapping category names to string arrays,
//! e.g. `{"female": ["..."], "male": ["..."]}`. It is re-read on every pick
//! so edits take effect without a restart.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Category a random pick is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Female,
    Male,
    /// Titles rather than characters.
    Hentai,
}

impl Category {
    /// Key used in the catalog file.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Female => "female",
            Self::Male => "male",
            Self::Hentai => "hentai",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Female => "💖",
            Self::Male => "💙",
            Self::Hentai => "🔞",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// File-backed catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Pick a random item from `category`. `Ok(None)` when the category is
    /// missing or empty.
    pub async fn pick(&self, category: Category) -> Result<Option<String>, CatalogError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CatalogError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let entries: HashMap<String, Vec<String>> = serde_json::from_str(&raw)?;

        let picked = entries
            .get(category.key())
            .and_then(|items| items.choose(&mut rand::thread_rng()))
            .cloned();
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pick_returns_item_from_category() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("characters.json");
        std::fs::write(&path, r#"{"female": ["Ada", "Grace"], "male": []}"#).unwrap();

        let catalog = Catalog::new(&path);
        let item = catalog.pick(Category::Female).await.unwrap().unwrap();
        assert!(item == "Ada" || item == "Grace");
    }

    #[tokio::test]
    async fn empty_category_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("characters.json");
        std::fs::write(&path, r#"{"female": ["Ada"], "male": []}"#).unwrap();

        let catalog = Catalog::new(&path);
        assert!(catalog.pick(Category::Male).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn categories_read_their_own_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("characters.json");
        std::fs::write(&path, r#"{"female": ["Ada"], "hentai": ["Some Title"]}"#).unwrap();

        let catalog = Catalog::new(&path);
        assert_eq!(
            catalog.pick(Category::Hentai).await.unwrap().as_deref(),
            Some("Some Title")
        );
        assert!(catalog.pick(Category::Male).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().join("nope.json"));
        let err = catalog.pick(Category::Female).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[tokio::test]
    async fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("characters.json");
        std::fs::write(&path, "not json").unwrap();
        let err = Catalog::new(&path).pick(Category::Female).await.unwrap_err();
        assert!(matches!(err, CatalogError::Parse(_)));
    }
}
