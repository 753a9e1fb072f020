//! Jobs: named, cancellable units of background work
//!
//! A job is handed to the [`Dispatcher`](crate::dispatcher::Dispatcher) as a
//! `Box<dyn Job<C>>`. From then on the dispatcher owns it: the box moves to
//! exactly one worker thread for `run`, comes back through the completion
//! channel, gets `complete` on the coordinator thread (unless aborted) and is
//! dropped there.
//!
//! # Lifecycle
//!
//! ```text
//! enqueue ──► Queued ──► Running ──► run() returns ──► delivered on coordinator
//!                │                                        │
//!                │ aborted before start                   ├─ not aborted, run()=true ─► complete() ─► Completed
//!                └────────────────────────────────────────┴─ otherwise ─────────────────────────────► Aborted
//! ```
//!
//! Jobs sharing a [`name`](Job::name) form a lane: they never run at the same
//! time and start in enqueue order.

mod abort;
pub(crate) mod context;
pub mod dependent;

pub use abort::AbortHandle;
pub use context::JobContext;
pub use dependent::{DependentJob, JobOwner, JobRecipient, OwnerLink};

use std::fmt;
use std::sync::Arc;

/// A unit of cancellable, named background work
///
/// `C` is the coordinator-owned state handed to [`complete`](Job::complete).
pub trait Job<C = ()>: Send + 'static {
    /// Lane name. Jobs with equal names are serialized FIFO.
    fn name(&self) -> &str;

    /// Human-readable label for progress displays
    fn description(&self) -> Option<String> {
        None
    }

    /// Called on the coordinator when the job is enqueued, before it can run
    fn attach(&mut self, _abort: &AbortHandle) {}

    /// Do the work. Runs on a worker thread.
    ///
    /// Must poll [`JobContext::is_aborted`] at reasonable intervals; nothing
    /// else stops it. Return `false` to skip `complete`.
    fn run(&mut self, ctx: &mut JobContext) -> bool;

    /// Runs on the coordinator thread, at most once, only if the job was not
    /// aborted and `run` returned `true`.
    fn complete(self: Box<Self>, _cx: &mut C) {}
}

/// Identifier assigned by the dispatcher at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl JobId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coordinator-side identity of an enqueued job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub id: JobId,
    pub name: Arc<str>,
    pub description: Option<String>,
}

impl JobInfo {
    /// Description if the job has one, otherwise `name#id`
    pub fn label(&self) -> String {
        match &self.description {
            Some(description) => description.clone(),
            None => format!("{}{}", self.name, self.id),
        }
    }
}

/// Where a job is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Aborted,
}

/// Terminal result of a delivered job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobOutcome {
    /// `complete` ran
    Completed,
    /// Cancelled, declined by `run`, panicked, or never started
    Aborted,
}

impl From<JobOutcome> for JobState {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Completed => JobState::Completed,
            JobOutcome::Aborted => JobState::Aborted,
        }
    }
}

type WorkFn = Box<dyn FnMut(&mut JobContext) -> bool + Send>;
type CompleteFn<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Job built from closures
///
/// ```
/// use spindle_core::job::FnJob;
///
/// let job = FnJob::<Vec<String>>::new("cover-fetch", |ctx| {
///     ctx.report_status("Fetching cover");
///     !ctx.is_aborted()
/// })
/// .on_complete(|log| log.push("cover ready".to_string()));
/// ```
pub struct FnJob<C = ()> {
    name: String,
    description: Option<String>,
    work: WorkFn,
    on_complete: Option<CompleteFn<C>>,
}

impl<C: 'static> FnJob<C> {
    pub fn new(
        name: impl Into<String>,
        work: impl FnMut(&mut JobContext) -> bool + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            work: Box::new(work),
            on_complete: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(&mut C) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Box the job for [`Dispatcher::enqueue`](crate::dispatcher::Dispatcher::enqueue)
    pub fn boxed(self) -> Box<dyn Job<C>> {
        Box::new(self)
    }
}

impl<C: 'static> Job<C> for FnJob<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<String> {
        self.description.clone()
    }

    fn run(&mut self, ctx: &mut JobContext) -> bool {
        (self.work)(ctx)
    }

    fn complete(self: Box<Self>, cx: &mut C) {
        if let Some(f) = self.on_complete {
            f(cx);
        }
    }
}

impl<C> fmt::Debug for FnJob<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnJob")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("has_on_complete", &self.on_complete.is_some())
            .finish()
    }
}
