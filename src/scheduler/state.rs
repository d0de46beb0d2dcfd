//! Single-flight scheduler state machine.
//!
//! The scheduler owns the execution slot, the FIFO queue and the
//! awaiting-choice sub-state. It performs no I/O: every transition returns
//! the effects (messages to send, jobs to execute) for the dispatcher to
//! carry out.
//!
//! ```text
//!   Idle ──Secondary link──────────────▶ Busy(Secondary)
//!   Idle ──Primary link──▶ AwaitingChoice(Primary) ──"1"/"2"──▶ Busy(Primary)
//!   Busy(r) ──link from r──▶ rejected      Busy(r) ──link from other──▶ queued
//!   Busy ──completion──▶ Busy(head of queue) | Idle
//!   Idle with kept queue ──any link──▶ Busy(head of queue), link admitted after
//!   any ──transport lost──▶ Idle
//! ```

use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notify::{Notice, Outbound};
use crate::scheduler::job::{AccountSlot, Destination, Job, Requester, Resource};

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(Outbound),
    /// Run this job now. Its destination is always resolved.
    Execute(Job),
}

/// What happened to a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Started,
    /// Held until the requester picks a destination.
    AwaitingChoice,
    /// Queued behind the active job or a pending choice.
    Queued,
    /// Same requester is already being served; the job was dropped.
    Rejected,
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub disposition: Disposition,
    pub effects: Vec<Effect>,
}

/// What to do with queued jobs when the transport drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Keep queued jobs and serve them once the session is back.
    #[default]
    KeepQueue,
    /// Drop queued jobs together with the rest of the in-memory state.
    PurgeQueue,
}

/// A Primary link held until its destination is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChoice {
    pub requester: Requester,
    pub resource: Resource,
    pub target: String,
}

/// The job occupying the execution slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveJob {
    pub job_id: Uuid,
    pub requester: Requester,
}

/// Externally visible scheduler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingChoice(Requester),
    Busy(Requester),
}

/// The single authoritative scheduling state.
#[derive(Debug, Default)]
pub struct Scheduler {
    active: Option<ActiveJob>,
    queue: VecDeque<Job>,
    pending_choice: Option<PendingChoice>,
    disconnect_policy: DisconnectPolicy,
}

impl Scheduler {
    pub fn new(disconnect_policy: DisconnectPolicy) -> Self {
        Self {
            disconnect_policy,
            ..Self::default()
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        match (&self.active, &self.pending_choice) {
            (Some(active), _) => Phase::Busy(active.requester),
            (None, Some(pending)) => Phase::AwaitingChoice(pending.requester),
            (None, None) => Phase::Idle,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<ActiveJob> {
        self.active
    }

    pub fn active_requester(&self) -> Option<Requester> {
        self.active.map(|a| a.requester)
    }

    pub fn pending_choice(&self) -> Option<&PendingChoice> {
        self.pending_choice.as_ref()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Submit a job (a link or an attachment).
    pub fn submit(&mut self, job: Job) -> Step {
        if let Some(active) = self.active {
            if active.requester == job.requester {
                tracing::info!(
                    requester = %job.requester,
                    active_job = %active.job_id,
                    "Rejecting submission while the same requester is being served"
                );
                return Step {
                    disposition: Disposition::Rejected,
                    effects: vec![Effect::Send(Outbound::to_conversation(
                        &job.target,
                        job.requester,
                        Notice::BusySelf,
                    ))],
                };
            }

            let notice = Outbound::to_conversation(&job.target, job.requester, Notice::BusyOther);
            self.enqueue(job);
            return Step {
                disposition: Disposition::Queued,
                effects: vec![Effect::Send(notice)],
            };
        }

        if self.pending_choice.is_none() && !self.queue.is_empty() {
            // Entries kept across a reset go first.
            tracing::info!(
                kept = self.queue.len(),
                "Resuming kept queue ahead of new submission"
            );
            let mut effects = self.drain_next();
            let step = self.submit(job);
            effects.extend(step.effects);
            return Step {
                disposition: step.disposition,
                effects,
            };
        }

        if self.pending_choice.is_some() {
            let notice =
                Outbound::to_conversation(&job.target, job.requester, Notice::QueuedBehindChoice);
            self.enqueue(job);
            return Step {
                disposition: Disposition::Queued,
                effects: vec![Effect::Send(notice)],
            };
        }

        if job.needs_choice() {
            tracing::info!(requester = %job.requester, "Holding link until a destination is chosen");
            let prompt = Outbound::to_conversation(&job.target, job.requester, Notice::ChoicePrompt);
            self.pending_choice = Some(PendingChoice {
                requester: job.requester,
                resource: job.resource,
                target: job.target,
            });
            return Step {
                disposition: Disposition::AwaitingChoice,
                effects: vec![Effect::Send(prompt)],
            };
        }

        Step {
            disposition: Disposition::Started,
            effects: vec![self.start(job)],
        }
    }

    /// Handle a numeric destination reply from `requester`.
    ///
    /// Replies that don't match the pending choice (wrong requester, no
    /// pending choice, number out of range) leave the state untouched.
    pub fn answer_choice(&mut self, requester: Requester, choice: u8) -> Vec<Effect> {
        let Some(account) = AccountSlot::from_choice(choice) else {
            return Vec::new();
        };
        match &self.pending_choice {
            Some(pending) if pending.requester == requester => {}
            _ => return Vec::new(),
        }
        let Some(pending) = self.pending_choice.take() else {
            return Vec::new();
        };

        let job = Job::new(pending.requester, pending.resource, pending.target)
            .with_destination(Destination::PhotoLibrary { account });
        let mut effects = vec![Effect::Send(Outbound::to_conversation(
            &job.target,
            requester,
            Notice::ChoiceAccepted { account },
        ))];

        if self.is_busy() {
            effects.push(Effect::Send(Outbound::to_conversation(
                &job.target,
                requester,
                Notice::QueuedAfterChoice,
            )));
            self.enqueue(job);
        } else {
            effects.push(self.start(job));
        }
        effects
    }

    /// The job `job_id` finished, whatever its outcome.
    ///
    /// Completions for a job that no longer holds the slot (its session was
    /// reset in the meantime) are ignored.
    pub fn complete(&mut self, job_id: Uuid) -> Vec<Effect> {
        match self.active {
            Some(active) if active.job_id == job_id => {
                tracing::debug!(job_id = %job_id, requester = %active.requester, "Job slot released");
                self.active = None;
                self.drain_next()
            }
            _ => {
                tracing::warn!(job_id = %job_id, "Ignoring completion of a job that is not active");
                Vec::new()
            }
        }
    }

    /// The transport dropped. Resets to `Idle`; returns the job that held
    /// the slot, if any.
    pub fn transport_lost(&mut self) -> Option<ActiveJob> {
        let interrupted = self.active.take();
        if self.pending_choice.take().is_some() {
            tracing::info!("Discarding pending destination choice after transport loss");
        }
        if self.disconnect_policy == DisconnectPolicy::PurgeQueue && !self.queue.is_empty() {
            tracing::info!(dropped = self.queue.len(), "Purging queued jobs after transport loss");
            self.queue.clear();
        }
        interrupted
    }

    /// The transport is back. Resumes serving kept queue entries.
    pub fn transport_restored(&mut self) -> Vec<Effect> {
        if self.active.is_some() || self.pending_choice.is_some() {
            return Vec::new();
        }
        self.drain_next()
    }

    // ── Internals ───────────────────────────────────────────────────

    fn enqueue(&mut self, job: Job) {
        tracing::info!(
            job_id = %job.id,
            requester = %job.requester,
            position = self.queue.len() + 1,
            "Job queued"
        );
        self.queue.push_back(job);
    }

    fn start(&mut self, job: Job) -> Effect {
        debug_assert!(self.active.is_none(), "single-flight slot already taken");
        let job = job.resolved();
        tracing::info!(
            job_id = %job.id,
            requester = %job.requester,
            resource = %job.resource,
            waited_ms = (Utc::now() - job.created_at).num_milliseconds(),
            "Job started"
        );
        self.active = Some(ActiveJob {
            job_id: job.id,
            requester: job.requester,
        });
        Effect::Execute(job)
    }

    fn drain_next(&mut self) -> Vec<Effect> {
        let Some(next) = self.queue.pop_front() else {
            return Vec::new();
        };
        let notice = Outbound::to_conversation(&next.target, next.requester, Notice::YourTurn);
        vec![Effect::Send(notice), self.start(next)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{Attachment, AttachmentKind};
    use rand::{Rng, SeedableRng};

    fn link(requester: Requester, name: &str) -> Job {
        let chat = match requester {
            Requester::Primary => "primary-chat",
            Requester::Secondary => "secondary-chat",
        };
        Job::new(requester, Resource::Url(format!("https://example.com/{name}")), chat)
    }

    fn executed(effects: &[Effect]) -> Vec<Job> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Execute(job) => Some(job.clone()),
                _ => None,
            })
            .collect()
    }

    fn notices(effects: &[Effect]) -> Vec<Notice> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(o) => Some(o.notice.clone()),
                _ => None,
            })
            .collect()
    }

    fn url_of(job: &Job) -> &str {
        match &job.resource {
            Resource::Url(u) => u,
            Resource::Attachment(_) => "",
        }
    }

    #[test]
    fn secondary_link_starts_immediately_with_default_destination() {
        let mut s = Scheduler::default();
        let step = s.submit(link(Requester::Secondary, "a"));
        assert_eq!(step.disposition, Disposition::Started);
        let jobs = executed(&step.effects);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].destination, Some(Destination::DEFAULT_LIBRARY));
        assert_eq!(s.phase(), Phase::Busy(Requester::Secondary));
    }

    #[test]
    fn primary_link_waits_for_choice() {
        let mut s = Scheduler::default();
        let step = s.submit(link(Requester::Primary, "a"));
        assert_eq!(step.disposition, Disposition::AwaitingChoice);
        assert!(executed(&step.effects).is_empty());
        assert_eq!(notices(&step.effects), vec![Notice::ChoicePrompt]);
        assert_eq!(s.phase(), Phase::AwaitingChoice(Requester::Primary));
        assert!(!s.is_busy());
    }

    #[test]
    fn valid_choice_starts_with_chosen_account() {
        let mut s = Scheduler::default();
        s.submit(link(Requester::Primary, "a"));
        let effects = s.answer_choice(Requester::Primary, 2);
        let jobs = executed(&effects);
        assert_eq!(jobs.len(), 1);
        assert_eq!(
            jobs[0].destination,
            Some(Destination::PhotoLibrary {
                account: AccountSlot::Second
            })
        );
        assert_eq!(url_of(&jobs[0]), "https://example.com/a");
        assert!(s.pending_choice().is_none());
        assert_eq!(s.phase(), Phase::Busy(Requester::Primary));
    }

    #[test]
    fn irrelevant_replies_leave_choice_pending() {
        let mut s = Scheduler::default();
        s.submit(link(Requester::Primary, "a"));

        assert!(s.answer_choice(Requester::Primary, 3).is_empty());
        assert!(s.answer_choice(Requester::Secondary, 1).is_empty());
        assert_eq!(s.phase(), Phase::AwaitingChoice(Requester::Primary));
        assert!(s.pending_choice().is_some());
    }

    #[test]
    fn choice_without_pending_is_ignored() {
        let mut s = Scheduler::default();
        assert!(s.answer_choice(Requester::Primary, 1).is_empty());
        assert_eq!(s.phase(), Phase::Idle);
    }

    #[test]
    fn submissions_while_awaiting_choice_are_queued() {
        let mut s = Scheduler::default();
        s.submit(link(Requester::Primary, "z"));
        let step = s.submit(link(Requester::Secondary, "a"));
        assert_eq!(step.disposition, Disposition::Queued);
        assert_eq!(notices(&step.effects), vec![Notice::QueuedBehindChoice]);
        assert!(executed(&step.effects).is_empty());
        assert!(!s.is_busy());
        assert_eq!(s.queue_len(), 1);
    }

    #[test]
    fn self_submission_while_busy_is_rejected() {
        let mut s = Scheduler::default();
        s.submit(link(Requester::Secondary, "a"));
        let step = s.submit(link(Requester::Secondary, "b"));
        assert_eq!(step.disposition, Disposition::Rejected);
        assert_eq!(notices(&step.effects), vec![Notice::BusySelf]);
        assert_eq!(s.queue_len(), 0);
    }

    #[test]
    fn other_requester_is_queued_and_notified() {
        let mut s = Scheduler::default();
        s.submit(link(Requester::Secondary, "a"));
        let step = s.submit(link(Requester::Primary, "b"));
        assert_eq!(step.disposition, Disposition::Queued);
        assert_eq!(notices(&step.effects), vec![Notice::BusyOther]);
        assert_eq!(s.queue_len(), 1);
    }

    #[test]
    fn completion_drains_queue_in_fifo_order() {
        // Z is held for a choice, so A, B and C all queue behind it.
        let mut s = Scheduler::default();
        s.submit(link(Requester::Primary, "z"));
        s.submit(link(Requester::Secondary, "a"));
        s.submit(link(Requester::Primary, "b"));
        s.submit(link(Requester::Secondary, "c"));

        let mut order = Vec::new();
        let mut running = executed(&s.answer_choice(Requester::Primary, 1));
        while let Some(job) = running.pop() {
            order.push(url_of(&job).rsplit('/').next().unwrap_or_default().to_string());
            running = executed(&s.complete(job.id));
        }

        assert_eq!(order, vec!["z", "a", "b", "c"]);
        assert_eq!(s.phase(), Phase::Idle);
    }

    #[test]
    fn dequeued_job_gets_your_turn_notice() {
        let mut s = Scheduler::default();
        let first = executed(&s.submit(link(Requester::Secondary, "a")).effects).remove(0);
        s.submit(link(Requester::Primary, "b"));

        let effects = s.complete(first.id);
        assert_eq!(notices(&effects), vec![Notice::YourTurn]);
        let next = executed(&effects);
        assert_eq!(next[0].requester, Requester::Primary);
        // Queued Primary links fall back to the default account.
        assert_eq!(next[0].destination, Some(Destination::DEFAULT_LIBRARY));
    }

    #[test]
    fn stale_completion_is_ignored() {
        let mut s = Scheduler::default();
        let old = executed(&s.submit(link(Requester::Secondary, "a")).effects).remove(0);
        s.transport_lost();
        let fresh = executed(&s.submit(link(Requester::Secondary, "b")).effects).remove(0);

        assert!(s.complete(old.id).is_empty());
        assert_eq!(s.active().map(|a| a.job_id), Some(fresh.id));
    }

    #[test]
    fn transport_loss_resets_every_state() {
        let mut s = Scheduler::default();
        s.submit(link(Requester::Primary, "a"));
        s.transport_lost();
        assert_eq!(s.phase(), Phase::Idle);
        assert!(s.pending_choice().is_none());

        s.submit(link(Requester::Secondary, "b"));
        s.submit(link(Requester::Primary, "c"));
        let interrupted = s.transport_lost();
        assert_eq!(interrupted.map(|a| a.requester), Some(Requester::Secondary));
        assert_eq!(s.phase(), Phase::Idle);
        assert!(!s.is_busy());
        assert!(s.active_requester().is_none());
    }

    #[test]
    fn kept_queue_is_served_after_reconnect() {
        let mut s = Scheduler::new(DisconnectPolicy::KeepQueue);
        s.submit(link(Requester::Secondary, "a"));
        s.submit(link(Requester::Primary, "b"));
        s.transport_lost();
        assert_eq!(s.queue_len(), 1);

        let effects = s.transport_restored();
        let jobs = executed(&effects);
        assert_eq!(jobs.len(), 1);
        assert_eq!(url_of(&jobs[0]), "https://example.com/b");
        assert_eq!(s.phase(), Phase::Busy(Requester::Primary));
    }

    #[test]
    fn kept_queue_runs_before_a_newer_submission() {
        let mut s = Scheduler::new(DisconnectPolicy::KeepQueue);
        s.submit(link(Requester::Secondary, "a"));
        s.submit(link(Requester::Primary, "b"));
        s.transport_lost();

        // No reconnect yet; a fresh link arrives first.
        let step = s.submit(link(Requester::Secondary, "c"));
        let jobs = executed(&step.effects);
        assert_eq!(jobs.len(), 1);
        assert_eq!(url_of(&jobs[0]), "https://example.com/b");
        assert_eq!(step.disposition, Disposition::Queued);
        assert_eq!(
            notices(&step.effects),
            vec![Notice::YourTurn, Notice::BusyOther]
        );
        assert_eq!(s.phase(), Phase::Busy(Requester::Primary));
        assert_eq!(s.queue_len(), 1);

        let next = executed(&s.complete(jobs[0].id));
        assert_eq!(url_of(&next[0]), "https://example.com/c");
        assert_eq!(s.queue_len(), 0);
    }

    #[test]
    fn kept_queue_head_counts_as_busy_for_its_requester() {
        let mut s = Scheduler::new(DisconnectPolicy::KeepQueue);
        s.submit(link(Requester::Secondary, "a"));
        s.submit(link(Requester::Primary, "b"));
        s.transport_lost();

        let step = s.submit(link(Requester::Primary, "c"));
        assert_eq!(step.disposition, Disposition::Rejected);
        assert_eq!(url_of(&executed(&step.effects)[0]), "https://example.com/b");
        assert_eq!(
            notices(&step.effects),
            vec![Notice::YourTurn, Notice::BusySelf]
        );
        assert_eq!(s.queue_len(), 0);
    }

    #[test]
    fn purge_policy_drops_queue_on_loss() {
        let mut s = Scheduler::new(DisconnectPolicy::PurgeQueue);
        s.submit(link(Requester::Secondary, "a"));
        s.submit(link(Requester::Primary, "b"));
        s.transport_lost();
        assert_eq!(s.queue_len(), 0);
        assert!(s.transport_restored().is_empty());
    }

    #[test]
    fn attachment_from_primary_skips_choice() {
        let mut s = Scheduler::default();
        let job = Job::new(
            Requester::Primary,
            Resource::Attachment(Attachment::new(AttachmentKind::Video, "vid")),
            "primary-chat",
        );
        let step = s.submit(job);
        assert_eq!(step.disposition, Disposition::Started);
        assert_eq!(executed(&step.effects)[0].destination, Some(Destination::FileHost));
    }

    #[test]
    fn random_sequences_never_run_two_jobs() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut s = Scheduler::default();
        let mut running: Vec<Job> = Vec::new();
        let mut started_order: Vec<Uuid> = Vec::new();
        let mut queued_order: Vec<Uuid> = Vec::new();

        for _ in 0..2_000 {
            let effects = match rng.gen_range(0..6) {
                0 | 1 => {
                    let requester = if rng.gen_bool(0.5) {
                        Requester::Primary
                    } else {
                        Requester::Secondary
                    };
                    let job = link(requester, "x");
                    let id = job.id;
                    let step = s.submit(job);
                    if step.disposition == Disposition::Queued {
                        queued_order.push(id);
                    }
                    step.effects
                }
                2 => s.answer_choice(Requester::Primary, rng.gen_range(0..4)),
                3 | 4 => match running.pop() {
                    Some(job) => s.complete(job.id),
                    None => Vec::new(),
                },
                _ => {
                    running.clear();
                    s.transport_lost();
                    s.transport_restored()
                }
            };

            for job in executed(&effects) {
                started_order.push(job.id);
                running.push(job);
            }
            assert!(running.len() <= 1, "two jobs in flight");
            assert_eq!(running.len(), usize::from(s.is_busy()));
            if !s.is_busy() {
                assert!(s.active_requester().is_none());
            }
            if s.pending_choice().is_some() {
                assert!(!s.is_busy());
            }
        }

        // Queued jobs start in the order they were queued.
        let started_from_queue: Vec<Uuid> = started_order
            .iter()
            .filter(|id| queued_order.contains(id))
            .copied()
            .collect();
        let expected: Vec<Uuid> = queued_order
            .iter()
            .filter(|id| started_from_queue.contains(id))
            .copied()
            .collect();
        assert_eq!(started_from_queue, expected);
    }
}
