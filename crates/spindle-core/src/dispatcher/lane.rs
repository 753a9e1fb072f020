//! Per-name serialization lane
//!
//! State machine: `Idle → Running(one job) → Idle | Running(next queued job)`.
//! A lane exists in the registry only while it holds at least one job; idle
//! lanes are removed.

use std::collections::VecDeque;

use crate::job::{AbortHandle, Job, JobId, JobInfo, JobState};
use crate::worker::WorkerId;

/// Job waiting for its lane
pub(crate) struct QueuedJob<C: 'static> {
    pub info: JobInfo,
    pub abort: AbortHandle,
    pub job: Box<dyn Job<C>>,
}

/// Job handed to a worker (or posted for skip delivery), not yet delivered
#[derive(Debug)]
pub(crate) struct RunningJob {
    pub info: JobInfo,
    pub abort: AbortHandle,
    pub worker: Option<WorkerId>,
}

pub(crate) struct Lane<C: 'static> {
    running: Option<RunningJob>,
    pending: VecDeque<QueuedJob<C>>,
}

impl<C: 'static> Lane<C> {
    pub fn new() -> Self {
        Self {
            running: None,
            pending: VecDeque::new(),
        }
    }

    /// Queued plus running
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.running.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn queued_len(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, job: QueuedJob<C>) {
        self.pending.push_back(job);
    }

    /// Earliest queued job, only if nothing is running
    pub fn next_to_start(&mut self) -> Option<QueuedJob<C>> {
        if self.running.is_some() {
            return None;
        }
        self.pending.pop_front()
    }

    pub fn set_running(&mut self, running: RunningJob) {
        debug_assert!(self.running.is_none(), "lane already has a running job");
        self.running = Some(running);
    }

    pub fn running(&self) -> Option<&RunningJob> {
        self.running.as_ref()
    }

    /// Take the running job if it is `id`
    pub fn finish(&mut self, id: JobId) -> Option<RunningJob> {
        match &self.running {
            Some(running) if running.info.id == id => self.running.take(),
            _ => None,
        }
    }

    /// Raise the abort flag of every job in the lane
    pub fn abort_all(&self) -> usize {
        let mut count = 0;
        if let Some(running) = &self.running {
            running.abort.abort();
            count += 1;
        }
        for queued in &self.pending {
            queued.abort.abort();
            count += 1;
        }
        count
    }

    /// Raise the abort flag of queued jobs only
    pub fn abort_queued(&self) -> usize {
        for queued in &self.pending {
            queued.abort.abort();
        }
        self.pending.len()
    }

    /// Jobs in execution order with their state
    pub fn snapshot(&self) -> Vec<(JobInfo, JobState)> {
        self.running
            .iter()
            .map(|r| (r.info.clone(), JobState::Running))
            .chain(
                self.pending
                    .iter()
                    .map(|q| (q.info.clone(), JobState::Queued)),
            )
            .collect()
    }
}
