//! Event loop tying the transport, router, scheduler and runner together.
//!
//! One task owns the [`Scheduler`] and handles transport events and job
//! completions one at a time. The in-flight job runs in its own task and
//! reports back over an mpsc channel tagged with its id.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::channels::{Channel, IncomingMessage, TransportEvent};
use crate::commands::CommandHandler;
use crate::config::CourierConfig;
use crate::error::{ChannelError, JobFailure, Result};
use crate::executors::{
    DestinationUploader, GeminiCleaner, GoFileUploader, GooglePhotosUploader, TokenStore,
    ToolFetcher, YtDlpCaptionFetcher,
};
use crate::lyrics::LyricsService;
use crate::notify::{Notifier, Outbox};
use crate::router::{RequestKind, Route, Router};
use crate::scheduler::{Delivery, Effect, Job, JobContext, JobRunner, Resource, Scheduler};

/// A finished job, successful or not.
#[derive(Debug)]
pub struct Completion {
    pub job_id: Uuid,
    pub result: std::result::Result<Delivery, JobFailure>,
}

struct InFlight {
    job_id: Uuid,
    handle: JoinHandle<()>,
}

pub struct Dispatcher {
    channel: Arc<dyn Channel>,
    router: Router,
    scheduler: Scheduler,
    outbox: Outbox,
    runner: JobRunner,
    commands: CommandHandler,
    in_flight: Option<InFlight>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    account_id: Option<String>,
}

impl Dispatcher {
    pub fn new(
        router: Router,
        scheduler: Scheduler,
        outbox: Outbox,
        runner: JobRunner,
        commands: CommandHandler,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            channel: Arc::clone(outbox.channel()),
            router,
            scheduler,
            outbox,
            runner,
            commands,
            in_flight: None,
            completions_tx,
            completions_rx,
            account_id: None,
        }
    }

    /// Wire the production executors described by `config` around `channel`.
    pub fn from_config(config: &CourierConfig, channel: Arc<dyn Channel>) -> Self {
        let notifier = Notifier::new(
            config.primary_name.clone(),
            config.secondary_name.clone(),
            config.account_labels.clone(),
        );
        let outbox = Outbox::new(channel, notifier, config.identities.clone());

        let credentials = Arc::new(TokenStore::new(&config.token_dir));
        let uploader = DestinationUploader::new(
            Arc::new(GooglePhotosUploader::new(credentials.clone())),
            Arc::new(GoFileUploader::new(config.gofile_token.clone())),
        );
        let runner = JobRunner::new(JobContext {
            outbox: outbox.clone(),
            fetcher: Arc::new(ToolFetcher::new(config.fetch.clone())),
            uploader: Arc::new(uploader),
            credentials,
            work_dir: config.work_dir.clone(),
        });

        let lyrics = LyricsService::new(
            Arc::new(YtDlpCaptionFetcher::new(
                config.fetch.clone(),
                &config.work_dir,
            )),
            Arc::new(GeminiCleaner::new(
                config.gemini.api_key.clone(),
                config.gemini.model.clone(),
            )),
            outbox.clone(),
        );
        let commands = CommandHandler::new(
            outbox.clone(),
            Catalog::new(&config.catalog_path),
            Arc::new(lyrics),
        );

        Self::new(
            Router::new(config.identities.clone(), config.rewriter.clone()),
            Scheduler::new(config.disconnect_policy),
            outbox,
            runner,
            commands,
        )
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run until Ctrl+C, the end of the event stream, or a terminal logout.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await
    }

    /// Run until `shutdown` resolves, the event stream ends, or the
    /// transport reports a terminal logout.
    ///
    /// When the stream ends, the running job and everything queued behind
    /// it is finished before returning. On `shutdown` the running job is
    /// aborted instead.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut events = self.channel.start().await?;
        tracing::info!(channel = self.channel.name(), "Dispatcher started");
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.abort_in_flight();
                    break Ok(());
                }
                Some(done) = self.completions_rx.recv() => {
                    self.on_completion(done).await;
                }
                event = events.next() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            break Err(e);
                        }
                    }
                    None => {
                        tracing::info!("Event stream ended, finishing outstanding jobs");
                        self.drain().await;
                        break Ok(());
                    }
                },
            }
        };

        if let Err(e) = self.channel.shutdown().await {
            tracing::warn!(error = %e, "Channel shutdown failed");
        }
        outcome.map_err(Into::into)
    }

    async fn handle_event(&mut self, event: TransportEvent) -> std::result::Result<(), ChannelError> {
        match event {
            TransportEvent::Connected { account_id } => {
                tracing::info!(account = %account_id, "Transport connected");
                self.account_id = Some(account_id);
                let effects = self.scheduler.transport_restored();
                self.perform(effects).await;
            }
            TransportEvent::Disconnected {
                reason,
                recoverable,
            } => {
                tracing::warn!(reason = %reason, recoverable, "Transport disconnected");
                self.reset_session();
                if !recoverable {
                    return Err(ChannelError::LoggedOut {
                        name: self.channel.name().to_string(),
                        reason,
                    });
                }
            }
            TransportEvent::Message(message) => self.handle_message(message).await,
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: IncomingMessage) {
        let Route::Accepted(request) = self.router.classify(&message) else {
            return;
        };
        tracing::debug!(requester = %request.requester, kind = ?request.kind, "Request accepted");

        let effects = match request.kind {
            RequestKind::Command(command) => {
                if let Err(e) = self
                    .commands
                    .handle(request.requester, &request.conversation, command)
                    .await
                {
                    tracing::warn!(error = %e, "Command reply failed");
                }
                return;
            }
            RequestKind::ChoiceAnswer(choice) => {
                self.scheduler.answer_choice(request.requester, choice)
            }
            RequestKind::MediaAttachment(attachment) => {
                let job = Job::new(
                    request.requester,
                    Resource::Attachment(attachment),
                    request.conversation,
                );
                self.scheduler.submit(job).effects
            }
            RequestKind::JobRequest(url) => {
                let job = Job::new(request.requester, Resource::Url(url), request.conversation);
                self.scheduler.submit(job).effects
            }
        };
        self.perform(effects).await;
    }

    async fn on_completion(&mut self, done: Completion) {
        if self.in_flight.as_ref().is_some_and(|f| f.job_id == done.job_id) {
            self.in_flight = None;
        }
        let is_active = self.scheduler.active().is_some_and(|a| a.job_id == done.job_id);

        if is_active && matches!(done.result, Err(JobFailure::TransportLost)) {
            tracing::warn!(job_id = %done.job_id, "Job lost the transport, resetting session");
            self.reset_session();
            // The send may have failed transiently; resume right away if the
            // session answers, otherwise wait for the next Connected event.
            match self.channel.health_check().await {
                Ok(()) => {
                    let effects = self.scheduler.transport_restored();
                    self.perform(effects).await;
                }
                Err(e) => tracing::warn!(error = %e, "Transport unhealthy, waiting for reconnect"),
            }
            return;
        }

        let effects = self.scheduler.complete(done.job_id);
        self.perform(effects).await;
    }

    async fn perform(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(outbound) => {
                    // Failures are logged by the outbox; the transport reports
                    // real disconnects as events.
                    let _ = self.outbox.deliver(&outbound).await;
                }
                Effect::Execute(job) => self.spawn(job),
            }
        }
    }

    fn spawn(&mut self, job: Job) {
        let job_id = job.id;
        let runner = self.runner.clone();
        let tx = self.completions_tx.clone();
        let handle = tokio::spawn(async move {
            let result = runner.run(job).await;
            // The receiver lives as long as the dispatcher.
            let _ = tx.send(Completion { job_id, result });
        });
        if let Some(previous) = self.in_flight.replace(InFlight { job_id, handle }) {
            tracing::error!(job_id = %previous.job_id, "Replacing a job that was still tracked");
            previous.handle.abort();
        }
    }

    fn abort_in_flight(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            tracing::warn!(job_id = %in_flight.job_id, "Aborting in-flight job");
            in_flight.handle.abort();
        }
    }

    fn reset_session(&mut self) {
        self.abort_in_flight();
        if let Some(interrupted) = self.scheduler.transport_lost() {
            tracing::warn!(
                job_id = %interrupted.job_id,
                requester = %interrupted.requester,
                "Job interrupted by session reset"
            );
        }
        tracing::info!(
            kept = self.scheduler.queue_len(),
            account = self.account_id.as_deref().unwrap_or("unknown"),
            "Scheduler reset to idle"
        );
    }

    /// Wait for the running job and everything queued behind it.
    async fn drain(&mut self) {
        while self.scheduler.is_busy() {
            match self.completions_rx.recv().await {
                Some(done) => self.on_completion(done).await,
                None => break,
            }
        }
        if self.scheduler.pending_choice().is_some() || self.scheduler.queue_len() > 0 {
            tracing::info!(
                queued = self.scheduler.queue_len(),
                "Dropping requests still waiting on a destination choice"
            );
        }
    }
}
