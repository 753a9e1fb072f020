//! Spindle Core - Named job lanes on a reusable worker pool
//!
//! Background work is submitted as [`Job`]s to a [`Dispatcher`] owned by the
//! coordinator thread. Jobs sharing a name run one at a time in submission
//! order; different names run in parallel. Finished jobs come back to the
//! coordinator, which calls [`Job::complete`] with its own state.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod progress;
pub mod worker;

pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use error::DispatchError;
pub use job::{
    AbortHandle, DependentJob, FnJob, Job, JobContext, JobId, JobInfo, JobOutcome, JobOwner,
    JobRecipient, JobState, OwnerLink,
};
pub use progress::{LogDisplay, Progress, ProgressDisplay};
pub use worker::{current_worker_id, WorkerId, WorkerInit};
