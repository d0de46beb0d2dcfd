//! Single-flight job scheduling.
//!
//! `state` holds the pure state machine, `job` the value types it moves
//! around, and `runner` the execution procedure for one job.

pub mod job;
pub mod runner;
pub mod state;

pub use job::{AccountSlot, Destination, Job, Requester, Resource};
pub use runner::{ArtifactGuard, Delivery, JobContext, JobRunner};
pub use state::{
    ActiveJob, DisconnectPolicy, Disposition, Effect, PendingChoice, Phase, Scheduler, Step,
};
