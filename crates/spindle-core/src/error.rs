//! Error type for dispatcher internals
//!
//! None of these reach job authors: a failure while handing a job to a worker
//! is turned into an `Aborted` delivery and logged.

use crate::worker::WorkerId;

/// Errors raised while managing the worker pool
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    #[error("Worker {0} disconnected")]
    WorkerGone(WorkerId),
}
