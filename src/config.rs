//! Configuration, read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::executors::FetchConfig;
use crate::router::{DEFAULT_REWRITES, Identities, Identity, UrlRewriter};
use crate::scheduler::DisconnectPolicy;

/// Telegram transport settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

/// Lyrics cleanup provider settings.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// Unset disables the lyrics command (it answers "not configured").
    pub api_key: Option<SecretString>,
    pub model: String,
}

/// Everything the courier needs at startup.
#[derive(Debug, Clone)]
pub struct CourierConfig {
    pub identities: Identities,
    /// Names used when addressing each requester.
    pub primary_name: String,
    pub secondary_name: String,
    /// Display labels of photo-library accounts 1 and 2.
    pub account_labels: [String; 2],
    pub rewriter: UrlRewriter,
    /// Shared scratch directory for artifacts and subtitles.
    pub work_dir: PathBuf,
    /// Directory holding `token.json` / `token2.json`.
    pub token_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub fetch: FetchConfig,
    pub disconnect_policy: DisconnectPolicy,
    /// `None` falls back to the CLI transport.
    pub telegram: Option<TelegramConfig>,
    pub gemini: GeminiConfig,
    pub gofile_token: Option<SecretString>,
}

impl CourierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let mut primary = Identity::new(&required("COURIER_PRIMARY_ID")?);
        if let Some(chat) = get("COURIER_PRIMARY_CHAT") {
            primary = primary.with_chat(chat);
        }
        let mut secondary = Identity::new(&required("COURIER_SECONDARY_ID")?);
        if let Some(chat) = get("COURIER_SECONDARY_CHAT") {
            secondary = secondary.with_chat(chat);
        }
        if primary.user_id == secondary.user_id {
            return Err(ConfigError::InvalidValue {
                key: "COURIER_SECONDARY_ID".to_string(),
                message: "must differ from COURIER_PRIMARY_ID".to_string(),
            });
        }

        let rewriter = match get("COURIER_URL_REWRITES") {
            Some(raw) => UrlRewriter::new(parse_rewrites(&raw)?)?,
            None => UrlRewriter::new(DEFAULT_REWRITES.iter().copied())?,
        };

        let work_dir = PathBuf::from(get("COURIER_WORK_DIR").unwrap_or_else(|| "./work".into()));
        let fetch = FetchConfig {
            yt_dlp: get("YT_DLP_PATH").unwrap_or_else(|| "yt-dlp".into()),
            gallery_dl: get("GALLERY_DL_PATH").unwrap_or_else(|| "gallery-dl".into()),
            max_height: parse_or(get("COURIER_MAX_HEIGHT"), "COURIER_MAX_HEIGHT", 1080)?,
            cookies_file: Some(PathBuf::from(
                get("COURIER_COOKIES_FILE").unwrap_or_else(|| "cookies.txt".into()),
            )),
            settle_delay: Duration::from_millis(parse_or(
                get("COURIER_SETTLE_DELAY_MS"),
                "COURIER_SETTLE_DELAY_MS",
                1500,
            )?),
        };

        let disconnect_policy = if parse_or(
            get("COURIER_PURGE_QUEUE_ON_DISCONNECT"),
            "COURIER_PURGE_QUEUE_ON_DISCONNECT",
            false,
        )? {
            DisconnectPolicy::PurgeQueue
        } else {
            DisconnectPolicy::KeepQueue
        };

        let telegram = match get("TELEGRAM_BOT_TOKEN") {
            Some(token) => Some(TelegramConfig {
                bot_token: SecretString::from(token),
                initial_backoff: Duration::from_secs(parse_or(
                    get("TELEGRAM_RECONNECT_INITIAL_SECS"),
                    "TELEGRAM_RECONNECT_INITIAL_SECS",
                    5,
                )?),
                max_backoff: Duration::from_secs(parse_or(
                    get("TELEGRAM_RECONNECT_MAX_SECS"),
                    "TELEGRAM_RECONNECT_MAX_SECS",
                    60,
                )?),
            }),
            None => None,
        };

        Ok(Self {
            identities: Identities::new(primary, secondary),
            primary_name: get("COURIER_PRIMARY_NAME").unwrap_or_else(|| "Boss".into()),
            secondary_name: get("COURIER_SECONDARY_NAME").unwrap_or_else(|| "Partner".into()),
            account_labels: [
                get("COURIER_ACCOUNT_1_LABEL").unwrap_or_else(|| "first account".into()),
                get("COURIER_ACCOUNT_2_LABEL").unwrap_or_else(|| "second account".into()),
            ],
            rewriter,
            work_dir,
            token_dir: PathBuf::from(get("COURIER_TOKEN_DIR").unwrap_or_else(|| ".".into())),
            catalog_path: PathBuf::from(
                get("COURIER_CATALOG_PATH").unwrap_or_else(|| "characters.json".into()),
            ),
            fetch,
            disconnect_policy,
            telegram,
            gemini: GeminiConfig {
                api_key: get("GEMINI_API_KEY").map(SecretString::from),
                model: get("GEMINI_MODEL").unwrap_or_else(|| "gemini-2.5-flash".into()),
            },
            gofile_token: get("GOFILE_API_TOKEN").map(SecretString::from),
        })
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

/// `pattern=>replacement` pairs separated by `;`.
fn parse_rewrites(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(';')
        .map(str::trim)
        .filter(|rule| !rule.is_empty())
        .map(|rule| {
            rule.split_once("=>")
                .map(|(p, r)| (p.trim().to_string(), r.trim().to_string()))
                .filter(|(p, _)| !p.is_empty())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "COURIER_URL_REWRITES".to_string(),
                    message: format!("expected pattern=>replacement, got {rule:?}"),
                })
        })
        .collect()
}
