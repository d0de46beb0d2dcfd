//! Media fetching through external downloaders.
//!
//! Links go to yt-dlp, except Pinterest pins which gallery-dl handles
//! better. Both tools are asked to print the files they wrote; scanning the
//! output directory for the newest media file after a settle delay is only
//! the fallback when nothing usable was printed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::error::FetchError;
use crate::executors::{Artifact, MediaFetcher};

/// Extensions accepted as downloaded media.
const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "webm", "jpg", "jpeg", "png", "gif", "webp",
];

/// Subdirectory of the work dir that gallery-dl writes into.
const GALLERY_SUBDIR: &str = "gallery-dl-downloads";

static PINTEREST_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)pin\.it/\w+|pinterest\.(com|pt|br)/pin/").expect("static pattern")
});

/// Downloader settings.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub yt_dlp: String,
    pub gallery_dl: String,
    /// Highest vertical resolution to download.
    pub max_height: u32,
    /// Passed to yt-dlp when the file exists.
    pub cookies_file: Option<PathBuf>,
    /// Wait before the fallback directory scan.
    pub settle_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            yt_dlp: "yt-dlp".to_string(),
            gallery_dl: "gallery-dl".to_string(),
            max_height: 1080,
            cookies_file: None,
            settle_delay: Duration::from_millis(1500),
        }
    }
}

impl FetchConfig {
    /// yt-dlp format selector that never exceeds `max_height`.
    pub fn format_selector(&self) -> String {
        let h = self.max_height;
        format!(
            "bestvideo[height<={h}][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<={h}]+bestaudio/\
             best[height<={h}][ext=mp4]/best[height<={h}]/worst"
        )
    }

    /// Cookies file, if configured and present on disk.
    pub(crate) async fn existing_cookies(&self) -> Option<&Path> {
        let path = self.cookies_file.as_deref()?;
        match tokio::fs::try_exists(path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }
}

/// Fetcher backed by yt-dlp and gallery-dl.
#[derive(Debug, Clone, Default)]
pub struct ToolFetcher {
    config: FetchConfig,
}

impl ToolFetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    async fn fetch_video(&self, url: &str, work_dir: &Path) -> Result<Artifact, FetchError> {
        let started = SystemTime::now();
        let template = work_dir.join("%(title)s.%(ext)s");

        let mut cmd = Command::new(&self.config.yt_dlp);
        cmd.arg("-f")
            .arg(self.config.format_selector())
            .arg("-o")
            .arg(&template)
            .args(["--merge-output-format", "mp4", "--restrict-filenames"])
            .args(["--no-simulate", "--print", "after_move:filepath"]);
        if let Some(cookies) = self.config.existing_cookies().await {
            tracing::debug!(cookies = %cookies.display(), "Using cookies file");
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.arg(url);

        let output = run_tool(&self.config.yt_dlp, cmd).await?;
        self.locate(&output.stdout, work_dir, started, |p| has_extension(p, &["mp4"]))
            .await
    }

    async fn fetch_pinterest(&self, url: &str, work_dir: &Path) -> Result<Artifact, FetchError> {
        let started = SystemTime::now();
        let out_dir = work_dir.join(GALLERY_SUBDIR);
        tokio::fs::create_dir_all(&out_dir).await?;

        let mut cmd = Command::new(&self.config.gallery_dl);
        cmd.arg(url).arg("-D").arg(&out_dir);

        let output = run_tool(&self.config.gallery_dl, cmd).await?;
        self.locate(&output.stdout, &out_dir, started, |p| {
            has_extension(p, MEDIA_EXTENSIONS)
        })
        .await
    }

    /// Resolve the produced file: printed path first, directory scan second.
    async fn locate(
        &self,
        stdout: &str,
        dir: &Path,
        started: SystemTime,
        accept: impl Fn(&Path) -> bool,
    ) -> Result<Artifact, FetchError> {
        if let Some(path) = parse_printed_path(stdout) {
            if accept(&path) && tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(Artifact::from_path(path));
            }
            tracing::debug!(path = %path.display(), "Printed path unusable, scanning directory");
        }

        tokio::time::sleep(self.config.settle_delay).await;
        match newest_matching(dir, Some(started), &accept).await? {
            Some(path) => {
                tracing::warn!(path = %path.display(), "Artifact found by directory scan");
                Ok(Artifact::from_path(path))
            }
            None => Err(FetchError::NoArtifact {
                dir: dir.to_path_buf(),
            }),
        }
    }
}

#[async_trait]
impl MediaFetcher for ToolFetcher {
    async fn fetch(&self, url: &str, work_dir: &Path) -> Result<Artifact, FetchError> {
        if is_pinterest_url(url) {
            tracing::info!(url, "Fetching pin with gallery-dl");
            self.fetch_pinterest(url, work_dir).await
        } else {
            tracing::info!(url, "Fetching media with yt-dlp");
            self.fetch_video(url, work_dir).await
        }
    }
}

/// Captured output of a finished tool.
pub(crate) struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run an external tool to completion. The child is killed if the future is
/// dropped, so aborting a job stops its download.
pub(crate) async fn run_tool(tool: &str, mut cmd: Command) -> Result<ToolOutput, FetchError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = cmd.output().await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FetchError::ToolMissing {
            tool: tool.to_string(),
        },
        _ => FetchError::Io(e),
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(FetchError::ToolFailed {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }
    if !stderr.trim().is_empty() {
        tracing::debug!(tool, stderr = %stderr.trim(), "Tool warnings");
    }
    Ok(ToolOutput { stdout, stderr })
}

/// Whether a link should go to gallery-dl.
pub fn is_pinterest_url(url: &str) -> bool {
    PINTEREST_URL.is_match(url)
}

/// Last path printed by a downloader. gallery-dl prefixes files it skipped
/// with `# `.
pub fn parse_printed_path(stdout: &str) -> Option<PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .map(|line| line.strip_prefix("# ").unwrap_or(line))
        .filter(|line| !line.is_empty())
        .rfind(|line| Path::new(line).is_absolute() || line.contains(std::path::MAIN_SEPARATOR))
        .map(PathBuf::from)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Most recently modified file in `dir` accepted by `accept`, optionally
/// ignoring files older than `not_before`.
pub async fn newest_matching(
    dir: &Path,
    not_before: Option<SystemTime>,
    accept: impl Fn(&Path) -> bool,
) -> Result<Option<PathBuf>, FetchError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !accept(&path) {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        // Filesystem timestamps can be coarser than the clock; allow a little slack.
        if let Some(floor) = not_before {
            let floor = floor.checked_sub(Duration::from_secs(2)).unwrap_or(floor);
            if modified < floor {
                continue;
            }
        }
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, p)| p))
}
