//! Progress reporting
//!
//! Jobs mutate a [`ProgressTracker`] on their worker thread; every change is
//! published as a [`Progress`] snapshot through the completion channel. The
//! coordinator only ever sees snapshots, never the live tracker.
//!
//! ```text
//! Worker: JobContext::report_progress()
//!     │
//!     │ WorkerEvent::Progress (snapshot)
//!     ▼
//! Coordinator: Dispatcher::pump()
//!     │
//!     ▼
//! ProgressDisplay::progress()   (status bar, log, ...)
//! ```

use crate::job::{JobInfo, JobOutcome};

/// Snapshot of a job's progress as published to the coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// Total number of steps, 0 if unknown
    pub total_steps: u64,
    /// Steps completed so far
    pub done_steps: u64,
    /// Completion percentage (0-100), never decreasing for one job
    pub percent: u8,
    /// Latest status text, if the job reported any
    pub status: Option<String>,
}

/// Worker-side progress state for the running job
///
/// Keeps `percent` monotonic: growing `total_steps` mid-run would otherwise
/// make the bar jump backwards.
#[derive(Debug, Default)]
pub(crate) struct ProgressTracker {
    current: Progress,
}

impl ProgressTracker {
    pub fn current(&self) -> &Progress {
        &self.current
    }

    pub fn set_total_steps(&mut self, total: u64) -> &Progress {
        self.current.total_steps = total;
        self.recompute()
    }

    pub fn set_progress(&mut self, done: u64, total: u64) -> &Progress {
        self.current.done_steps = done;
        self.current.total_steps = total;
        self.recompute()
    }

    pub fn increment(&mut self, steps: u64) -> &Progress {
        self.current.done_steps = self.current.done_steps.saturating_add(steps);
        self.recompute()
    }

    pub fn set_status(&mut self, text: String) -> &Progress {
        self.current.status = Some(text);
        &self.current
    }

    fn recompute(&mut self) -> &Progress {
        let p = &mut self.current;
        if p.total_steps > 0 {
            let done = p.done_steps.min(p.total_steps);
            let percent = (u128::from(done) * 100 / u128::from(p.total_steps)) as u8;
            p.percent = p.percent.max(percent);
        }
        &self.current
    }
}

/// Display collaborator that renders job progress (status bar, log, ...)
///
/// Called on the coordinator thread only. The dispatcher forwards events
/// without interpreting them.
pub trait ProgressDisplay {
    /// A job was handed to a worker
    fn job_started(&mut self, _job: &JobInfo) {}

    /// A running job published new progress
    fn progress(&mut self, job: &JobInfo, progress: &Progress);

    /// A job was delivered back to the coordinator
    fn job_finished(&mut self, _job: &JobInfo, _outcome: JobOutcome) {}
}

/// Display that writes progress to the log at debug level
#[derive(Debug, Default)]
pub struct LogDisplay;

impl ProgressDisplay for LogDisplay {
    fn job_started(&mut self, job: &JobInfo) {
        log::debug!("{} started", job.label());
    }

    fn progress(&mut self, job: &JobInfo, progress: &Progress) {
        match &progress.status {
            Some(status) => log::debug!("{}: {}% ({})", job.label(), progress.percent, status),
            None => log::debug!("{}: {}%", job.label(), progress.percent),
        }
    }

    fn job_finished(&mut self, job: &JobInfo, outcome: JobOutcome) {
        log::debug!("{} finished: {:?}", job.label(), outcome);
    }
}
