//! Completion channel: worker → coordinator messages
//!
//! Every worker holds a clone of the same sender. The coordinator owns the
//! receiver and drains it from [`Dispatcher::pump`](super::Dispatcher::pump).
//! A finished job travels inside its [`Finished`] message, so ownership returns
//! to exactly one delivery point; it cannot be delivered twice.
//!
//! For one job, progress messages and its `Finished` message are sent from the
//! same worker thread, so the coordinator always sees them in order.

use crossbeam::channel::{self, Receiver, Sender};
use std::time::Duration;

use crate::job::context::ProgressSink;
use crate::job::{Job, JobId, JobInfo};
use crate::progress::Progress;
use crate::worker::WorkerId;

/// How `run` ended, as seen by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunResult {
    /// `run` returned `true`
    Succeeded,
    /// `run` returned `false`
    Declined,
    /// `run` panicked; the worker caught it
    Panicked,
    /// Aborted before a worker was assigned; `run` never called
    Skipped,
    /// No worker could take the job; `run` never called
    NotStarted,
}

/// A job handed back to the coordinator
pub(crate) struct Finished<C: 'static> {
    /// Worker that held the job, kept busy until delivery so the lane can reuse it
    pub worker: Option<WorkerId>,
    pub info: JobInfo,
    pub job: Box<dyn Job<C>>,
    pub result: RunResult,
}

/// Message on the completion channel
pub(crate) enum WorkerEvent<C: 'static> {
    Progress { job: JobId, progress: Progress },
    Finished(Finished<C>),
}

impl<C: 'static> ProgressSink for Sender<WorkerEvent<C>> {
    fn publish(&self, job: JobId, progress: Progress) {
        // Receiver only disappears while the dispatcher is being torn down
        let _ = self.send(WorkerEvent::Progress { job, progress });
    }
}

/// Unbounded multi-producer channel into the coordinator
pub(crate) struct CompletionChannel<C: 'static> {
    sender: Sender<WorkerEvent<C>>,
    receiver: Receiver<WorkerEvent<C>>,
}

impl<C: 'static> CompletionChannel<C> {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self { sender, receiver }
    }

    /// Sender for a new worker
    pub fn sender(&self) -> Sender<WorkerEvent<C>> {
        self.sender.clone()
    }

    /// Post a job that never ran, from the coordinator itself
    pub fn post(&self, finished: Finished<C>) {
        // Both ends live in self, so this cannot fail
        let _ = self.sender.send(WorkerEvent::Finished(finished));
    }

    pub fn try_recv(&self) -> Option<WorkerEvent<C>> {
        self.receiver.try_recv().ok()
    }

    /// Wait up to `timeout` for the next message
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerEvent<C>> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}
