//! Manual subtitle download for the lyrics command.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use crate::error::FetchError;
use crate::executors::CaptionFetcher;
use crate::executors::fetch::{FetchConfig, newest_matching, run_tool};

/// Preferred subtitle languages, in order.
const SUB_LANGS: &str = "pt-BR,pt,por";

const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "vtt", "ass", "ttml", "lrc"];

/// yt-dlp stderr fragments meaning "no manual subtitles".
const NO_SUBS_MARKERS: &[&str] = &["no subtitles", "no captions", "requested subtitle"];

/// Downloads manual (never auto-generated) subtitles with yt-dlp.
#[derive(Debug, Clone)]
pub struct YtDlpCaptionFetcher {
    config: FetchConfig,
    work_dir: PathBuf,
}

impl YtDlpCaptionFetcher {
    pub fn new(config: FetchConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            work_dir: work_dir.into(),
        }
    }

    async fn download(&self, url: &str, prefix: &str) -> Result<(), FetchError> {
        let template = self.work_dir.join(format!("{prefix}%(title)s.%(ext)s"));
        let mut cmd = Command::new(&self.config.yt_dlp);
        cmd.args(["--write-subs", "--no-write-auto-subs", "--sub-langs", SUB_LANGS])
            .args(["--skip-download", "--restrict-filenames"])
            .arg("-o")
            .arg(&template);
        if let Some(cookies) = self.config.existing_cookies().await {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.arg(url);

        match run_tool(&self.config.yt_dlp, cmd).await {
            Ok(output) if mentions_missing_subs(&output.stderr) => {
                tracing::debug!(stderr = %output.stderr.trim(), "yt-dlp reported no subtitles");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(FetchError::ToolFailed { stderr, .. }) if mentions_missing_subs(&stderr) => {
                Err(FetchError::NoManualSubtitles)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CaptionFetcher for YtDlpCaptionFetcher {
    async fn fetch_captions(&self, url: &str) -> Result<String, FetchError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        // Unique per call so concurrent lyrics requests never pick up each other's files.
        let prefix = format!("subtitle_{}_", Uuid::new_v4().simple());
        self.download(url, &prefix).await?;

        let found = newest_matching(&self.work_dir, None, |p| is_subtitle_file(p, &prefix)).await?;
        let Some(path) = found else {
            return Err(FetchError::NoManualSubtitles);
        };

        tracing::info!(path = %path.display(), "Subtitle file downloaded");
        let content = tokio::fs::read_to_string(&path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove subtitle file");
        }
        Ok(content?)
    }
}

fn mentions_missing_subs(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    NO_SUBS_MARKERS.iter().any(|m| lower.contains(m))
}

fn is_subtitle_file(path: &Path, prefix: &str) -> bool {
    let named = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(prefix));
    let subtitle = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SUBTITLE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)));
    named && subtitle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtitle_file_needs_prefix_and_extension() {
        let prefix = "subtitle_abc_";
        assert!(is_subtitle_file(
            Path::new("/w/subtitle_abc_Song.pt-BR.vtt"),
            prefix
        ));
        assert!(is_subtitle_file(Path::new("/w/subtitle_abc_Song.pt.SRT"), prefix));
        assert!(!is_subtitle_file(Path::new("/w/subtitle_xyz_Song.vtt"), prefix));
        assert!(!is_subtitle_file(Path::new("/w/subtitle_abc_Song.mp4"), prefix));
    }

    #[test]
    fn recognizes_missing_subtitle_messages() {
        assert!(mentions_missing_subs(
            "WARNING: There are no subtitles for the requested languages"
        ));
        assert!(mentions_missing_subs("Requested subtitle format not available"));
        assert!(!mentions_missing_subs("ERROR: Unable to download webpage"));
    }

    #[tokio::test]
    async fn missing_yt_dlp_is_tool_missing() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = YtDlpCaptionFetcher::new(
            FetchConfig {
                yt_dlp: "courier-no-such-yt-dlp".into(),
                ..FetchConfig::default()
            },
            dir.path(),
        );
        let err = fetcher
            .fetch_captions("https://youtu.be/abc")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ToolMissing { .. }));
    }
}
