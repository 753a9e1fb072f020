//! Workers: reusable background threads that run one job at a time
//!
//! The dispatcher owns a [`Worker`] handle per thread. A worker blocks on its
//! private assignment channel, runs whatever job it is handed, and sends the
//! finished job back on the shared completion channel. It never touches
//! coordinator state itself.
//!
//! ```text
//! Dispatcher ── Assignment ──► worker thread
//!                                 │ init hook (first job only)
//!                                 │ job.run(ctx)
//!                                 ▼
//!                   WorkerEvent::Finished ──► completion channel
//! ```

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};

use crate::config::DispatcherConfig;
use crate::dispatcher::message::{Finished, RunResult, WorkerEvent};
use crate::error::DispatchError;
use crate::job::{AbortHandle, Job, JobContext, JobId, JobInfo};

/// Process-wide source of worker identities
static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// Unique worker identity, never reused within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    fn next() -> Self {
        WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: u64) -> Self {
        WorkerId(id)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The worker running on this thread, or `None` off the pool
pub fn current_worker_id() -> Option<WorkerId> {
    CURRENT_WORKER.with(|w| w.get())
}

/// Per-worker resource setup (e.g. opening a thread-local database handle)
///
/// Runs on the worker thread exactly once, before its first job.
pub type WorkerInit = Arc<dyn Fn(WorkerId) + Send + Sync>;

/// A job on its way to a worker thread
pub(crate) struct Assignment<C: 'static> {
    pub info: JobInfo,
    pub abort: AbortHandle,
    pub job: Box<dyn Job<C>>,
}

/// Coordinator-side handle to one worker thread
pub(crate) struct Worker<C: 'static> {
    id: WorkerId,
    assignments: Option<Sender<Assignment<C>>>,
    thread: Option<JoinHandle<()>>,
    current: Option<JobId>,
    idle_since: Instant,
    jobs_run: u64,
}

impl<C: 'static> Worker<C> {
    /// Start a worker thread
    pub fn spawn(
        config: &DispatcherConfig,
        events: Sender<WorkerEvent<C>>,
        init: Option<WorkerInit>,
    ) -> Result<Self, DispatchError> {
        let id = WorkerId::next();
        let (tx, rx) = channel::unbounded::<Assignment<C>>();

        let mut builder = thread::Builder::new().name(config.worker_thread_name(id.0));
        if let Some(stack_size) = config.worker_stack_size {
            builder = builder.stack_size(stack_size);
        }
        let thread = builder.spawn(move || worker_main(id, rx, events, init))?;

        log::debug!("Worker {} spawned", id);
        Ok(Self {
            id,
            assignments: Some(tx),
            thread: Some(thread),
            current: None,
            idle_since: Instant::now(),
            jobs_run: 0,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// How long the worker has been idle, `None` while busy
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        if self.is_idle() {
            Some(now.saturating_duration_since(self.idle_since))
        } else {
            None
        }
    }

    pub fn idle_since(&self) -> Instant {
        self.idle_since
    }

    pub fn jobs_run(&self) -> u64 {
        self.jobs_run
    }

    /// Hold the worker for a job that will be delivered without running
    pub fn reserve(&mut self, job: JobId) {
        self.current = Some(job);
    }

    /// Hand a job to the thread
    ///
    /// On failure the assignment comes back so it can be delivered as aborted.
    pub fn run_job(
        &mut self,
        assignment: Assignment<C>,
    ) -> Result<(), (DispatchError, Assignment<C>)> {
        let job_id = assignment.info.id;
        let Some(tx) = &self.assignments else {
            return Err((DispatchError::WorkerGone(self.id), assignment));
        };
        match tx.send(assignment) {
            Ok(()) => {
                self.current = Some(job_id);
                self.jobs_run += 1;
                Ok(())
            }
            Err(e) => Err((DispatchError::WorkerGone(self.id), e.into_inner())),
        }
    }

    /// Mark the worker free for any lane
    pub fn release(&mut self) {
        self.current = None;
        self.idle_since = Instant::now();
    }

    /// Close the assignment channel and join the thread
    ///
    /// Blocks until the current job's `run` returns.
    pub fn stop(&mut self) {
        self.assignments = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Worker {} thread panicked", self.id);
            } else {
                log::debug!("Worker {} stopped after {} job(s)", self.id, self.jobs_run());
            }
        }
    }
}

impl<C: 'static> Drop for Worker<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker thread body
fn worker_main<C: 'static>(
    id: WorkerId,
    assignments: Receiver<Assignment<C>>,
    events: Sender<WorkerEvent<C>>,
    init: Option<WorkerInit>,
) {
    CURRENT_WORKER.with(|w| w.set(Some(id)));
    log::debug!("Worker {} started", id);

    let mut init = init;
    while let Ok(Assignment { info, abort, mut job }) = assignments.recv() {
        if let Some(hook) = init.take() {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(id))).is_err() {
                log::error!("Worker {} init hook panicked", id);
            }
        }

        let mut ctx = JobContext::new(info.clone(), id, abort, Box::new(events.clone()));
        let result = match panic::catch_unwind(AssertUnwindSafe(|| job.run(&mut ctx))) {
            Ok(true) => RunResult::Succeeded,
            Ok(false) => RunResult::Declined,
            Err(payload) => {
                log::error!(
                    "Job {} panicked on worker {}: {}",
                    info.label(),
                    id,
                    panic_message(payload.as_ref())
                );
                RunResult::Panicked
            }
        };
        drop(ctx);

        let finished = Finished {
            worker: Some(id),
            info,
            job,
            result,
        };
        if events.send(WorkerEvent::Finished(finished)).is_err() {
            log::warn!("Worker {}: completion channel closed, exiting", id);
            break;
        }
    }

    log::debug!("Worker {} exiting", id);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
