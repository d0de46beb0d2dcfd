//! Execution procedure for a single job.
//!
//! starting ack → fetch → fetched ack → upload → outcome notice →
//! partner notice (Secondary successes) → artifact cleanup.
//!
//! The runner never touches scheduler state. The dispatcher spawns it and
//! feeds the result back as a completion, whatever the outcome.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;

use crate::error::JobFailure;
use crate::executors::{Artifact, CredentialStore, MediaFetcher, UploadOutcome, Uploader};
use crate::notify::{Notice, Outbound, Outbox};
use crate::scheduler::job::{Destination, Job, Requester, Resource};

/// Removes the artifact file when dropped, including when the job task is
/// aborted mid-flight.
#[derive(Debug)]
pub struct ArtifactGuard {
    path: PathBuf,
}

impl ArtifactGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Artifact removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove artifact")
            }
        }
    }
}

/// What a successful job delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub title: String,
    pub destination: Destination,
    pub link: Option<String>,
}

/// Collaborators a job needs.
#[derive(Clone)]
pub struct JobContext {
    pub outbox: Outbox,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub uploader: Arc<dyn Uploader>,
    pub credentials: Arc<dyn CredentialStore>,
    pub work_dir: PathBuf,
}

/// Runs jobs against a [`JobContext`].
#[derive(Clone)]
pub struct JobRunner {
    ctx: Arc<JobContext>,
}

impl JobRunner {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Run `job` to its end. Panics inside the procedure surface as
    /// [`JobFailure::UnknownFatal`].
    pub async fn run(&self, job: Job) -> Result<Delivery, JobFailure> {
        let job_id = job.id;
        let requester = job.requester;
        let result = AssertUnwindSafe(self.execute(job))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                tracing::error!(job_id = %job_id, "Job panicked");
                Err(JobFailure::UnknownFatal)
            });

        match &result {
            Ok(delivery) => tracing::info!(
                job_id = %job_id,
                requester = %requester,
                destination = %delivery.destination,
                title = %delivery.title,
                "Job delivered"
            ),
            Err(failure) => tracing::warn!(
                job_id = %job_id,
                requester = %requester,
                failure = %failure,
                "Job ended without delivery"
            ),
        }
        result
    }

    async fn execute(&self, job: Job) -> Result<Delivery, JobFailure> {
        let destination = job
            .destination
            .unwrap_or_else(|| job.resource.default_destination());

        self.say(&job, Notice::Starting).await?;

        let artifact = match self.fetch(&job.resource).await {
            Ok(artifact) => artifact,
            Err(reason) => {
                tracing::error!(job_id = %job.id, resource = %job.resource, reason = %reason, "Fetch failed");
                self.say(&job, Notice::FetchFailed).await?;
                return Err(JobFailure::FetchFailed);
            }
        };
        let guard = ArtifactGuard::new(&artifact.path);
        tracing::info!(job_id = %job.id, path = %guard.path().display(), "Artifact ready");

        self.say(&job, Notice::Fetched).await?;

        match self.ctx.uploader.upload(&artifact, destination).await {
            UploadOutcome::Success { link } => {
                self.say(
                    &job,
                    Notice::Delivered {
                        destination,
                        link: link.clone(),
                    },
                )
                .await?;
                if job.requester == Requester::Secondary {
                    self.tell(Outbound::to_requester(
                        Requester::Primary,
                        Notice::PartnerDelivered {
                            title: artifact.title.clone(),
                            destination,
                        },
                    ))
                    .await?;
                }
                Ok(Delivery {
                    title: artifact.title,
                    destination,
                    link,
                })
            }
            UploadOutcome::AuthInvalid => {
                if let Err(e) = self.ctx.credentials.invalidate(destination).await {
                    tracing::error!(%destination, error = %e, "Failed to clear stale authorization");
                }
                self.say(&job, Notice::AuthInvalid { destination }).await?;
                Err(JobFailure::AuthInvalid)
            }
            UploadOutcome::Failed(reason) => {
                tracing::error!(job_id = %job.id, %destination, reason = %reason, "Upload failed");
                self.say(&job, Notice::UploadFailed).await?;
                Err(JobFailure::UploadFailed)
            }
        }
    }

    async fn fetch(&self, resource: &Resource) -> Result<Artifact, String> {
        tokio::fs::create_dir_all(&self.ctx.work_dir)
            .await
            .map_err(|e| e.to_string())?;
        match resource {
            Resource::Url(url) => self
                .ctx
                .fetcher
                .fetch(url, &self.ctx.work_dir)
                .await
                .map_err(|e| e.to_string()),
            Resource::Attachment(attachment) => self
                .ctx
                .outbox
                .channel()
                .download_attachment(attachment, &self.ctx.work_dir)
                .await
                .map(Artifact::from_path)
                .map_err(|e| e.to_string()),
        }
    }

    /// Status message to the job's conversation. A failed send means the
    /// transport is gone, which ends the job.
    async fn say(&self, job: &Job, notice: Notice) -> Result<(), JobFailure> {
        self.tell(Outbound::to_conversation(&job.target, job.requester, notice))
            .await
    }

    async fn tell(&self, outbound: Outbound) -> Result<(), JobFailure> {
        self.ctx
            .outbox
            .deliver(&outbound)
            .await
            .map_err(|_| JobFailure::TransportLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_removes_file_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"x").unwrap();
        {
            let _guard = ArtifactGuard::new(&path);
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn guard_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        drop(ArtifactGuard::new(dir.path().join("never-written.mp4")));
    }
}
