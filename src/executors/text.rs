//! Caption cleanup: deterministic preprocessing followed by a Gemini pass.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use crate::error::LlmError;
use crate::executors::{RetryPolicy, TextPipeline};

/// Longest preprocessed transcript sent to the model, in characters.
pub const MAX_CAPTION_CHARS: usize = 100_000;

/// Appended when the transcript was cut at [`MAX_CAPTION_CHARS`].
pub const TRUNCATION_MARKER: &str = "\n\n[... transcript truncated ...]";

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const PROVIDER: &str = "gemini";

static VTT_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)WEBVTT.*?\n\n").expect("static pattern"));
static CUE_TIMING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\d{2}:)?\d{2}:\d{2}[.,]\d{3}\s*-->\s*(?:\d{2}:)?\d{2}:\d{2}[.,]\d{3}[^\n]*")
        .expect("static pattern")
});
static SEQUENCE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\d+\n").expect("static pattern"));
static MARKUP_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("static pattern"));
static BLANK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n(?:[ \t]*\n){2,}").expect("static pattern"));
static RETRY_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)retry in ([\d.]+)s").expect("static pattern"));

/// Strip subtitle scaffolding (headers, cue timings, sequence numbers,
/// markup) and cap the length.
pub fn preprocess_captions(raw: &str) -> String {
    let text = raw.replace("\r\n", "\n");
    let text = VTT_HEADER.replace_all(&text, "");
    let text = CUE_TIMING.replace_all(&text, "");
    let text = SEQUENCE_NUMBER.replace_all(&text, "");
    let text = MARKUP_TAG.replace_all(&text, "");
    let text = BLANK_RUN.replace_all(&text, "\n\n");

    let mut processed = text.into_owned();
    if processed.chars().count() > MAX_CAPTION_CHARS {
        let cut = processed
            .char_indices()
            .nth(MAX_CAPTION_CHARS)
            .map(|(i, _)| i)
            .unwrap_or(processed.len());
        tracing::info!(
            original_chars = processed.chars().count(),
            kept_chars = MAX_CAPTION_CHARS,
            "Truncating captions"
        );
        processed.truncate(cut);
        processed.push_str(TRUNCATION_MARKER);
    }
    processed.trim().to_string()
}

/// Instructions sent along with the transcript.
pub fn build_prompt(transcript: &str) -> String {
    format!(
        "Below is a subtitle file extracted from YouTube. It still has timing marks, odd \
         line breaks and repetitions caused by the subtitle format.\n\n\
         1. Remove every timing mark, number, symbol or anything that is not part of the lyrics.\n\
         2. Remove phrases repeated only because of subtitle synchronization.\n\
         3. Join the phrases and fix the line breaks so the lyrics read naturally.\n\
         4. Lay the result out as proper lyrics with well-formed verses and choruses.\n\
         5. Do not write new verses; only clean and organize the original content, keeping its language.\n\n\
         Reply with the final lyrics only.\n\n\
         ---ORIGINAL SUBTITLE---\n{transcript}\n---END OF SUBTITLE---"
    )
}

/// Server-suggested wait from a rate-limit message ("... retry in 12.3s").
pub fn parse_retry_after(message: &str) -> Option<Duration> {
    let secs: f64 = RETRY_HINT.captures(message)?.get(1)?.as_str().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs(secs.ceil() as u64))
}

/// Concatenated text parts of the first candidate.
pub fn extract_text(response: &serde_json::Value) -> Option<String> {
    let parts = response["candidates"][0]["content"]["parts"].as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Lyrics cleanup through the Gemini `generateContent` REST endpoint.
pub struct GeminiCleaner {
    client: reqwest::Client,
    api_key: Option<SecretString>,
    model: String,
    base_url: String,
    retry: RetryPolicy,
}

impl GeminiCleaner {
    pub fn new(api_key: Option<SecretString>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.into(),
            base_url: GEMINI_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn generate(&self, api_key: &SecretString, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: format!("failed to read body: {e}"),
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| text.clone());
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                    retry_after: parse_retry_after(&message),
                });
            }
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("HTTP {status}: {message}"),
            });
        }

        let value: serde_json::Value = serde_json::from_str(&text)?;
        extract_text(&value).ok_or_else(|| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "no text in first candidate".to_string(),
        })
    }
}

#[async_trait]
impl TextPipeline for GeminiCleaner {
    async fn clean(&self, raw_captions: &str) -> Result<String, LlmError> {
        let Some(api_key) = self.api_key.as_ref() else {
            return Err(LlmError::NotConfigured {
                provider: PROVIDER.to_string(),
            });
        };

        let transcript = preprocess_captions(raw_captions);
        tracing::info!(
            raw_chars = raw_captions.chars().count(),
            preprocessed_chars = transcript.chars().count(),
            model = %self.model,
            "Cleaning captions"
        );
        let prompt = build_prompt(&transcript);
        self.retry.run(|| self.generate(api_key, &prompt)).await
    }
}
