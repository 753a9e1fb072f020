//! Worker-side view of a running job

use super::{AbortHandle, JobId, JobInfo};
use crate::progress::{Progress, ProgressTracker};
use crate::worker::WorkerId;

/// Publishes progress snapshots to the coordinator
///
/// Implemented by the completion channel's sender, so progress travels the
/// same ordered path as the finished job itself.
pub(crate) trait ProgressSink: Send {
    fn publish(&self, job: JobId, progress: Progress);
}

/// Handle passed to [`Job::run`](super::Job::run)
///
/// Lives on the worker thread for the duration of one `run` call.
pub struct JobContext {
    info: JobInfo,
    worker: WorkerId,
    abort: AbortHandle,
    tracker: ProgressTracker,
    sink: Box<dyn ProgressSink>,
}

impl JobContext {
    pub(crate) fn new(
        info: JobInfo,
        worker: WorkerId,
        abort: AbortHandle,
        sink: Box<dyn ProgressSink>,
    ) -> Self {
        Self {
            info,
            worker,
            abort,
            tracker: ProgressTracker::default(),
            sink,
        }
    }

    pub fn id(&self) -> JobId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Worker executing this job
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Whether the coordinator asked this job to stop
    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Set both counters and publish
    pub fn report_progress(&mut self, done: u64, total: u64) {
        let snapshot = self.tracker.set_progress(done, total).clone();
        self.sink.publish(self.info.id, snapshot);
    }

    pub fn report_total_steps(&mut self, total: u64) {
        let snapshot = self.tracker.set_total_steps(total).clone();
        self.sink.publish(self.info.id, snapshot);
    }

    /// Mark one more step done
    pub fn increment_progress(&mut self) {
        let snapshot = self.tracker.increment(1).clone();
        self.sink.publish(self.info.id, snapshot);
    }

    pub fn report_status(&mut self, text: impl Into<String>) {
        let snapshot = self.tracker.set_status(text.into()).clone();
        self.sink.publish(self.info.id, snapshot);
    }

    /// Last published progress
    pub fn progress(&self) -> &Progress {
        self.tracker.current()
    }
}
