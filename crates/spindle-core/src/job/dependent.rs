//! Jobs whose completion depends on an owner staying alive
//!
//! A UI panel that asks for a playlist to be parsed in the background must not
//! receive the result after it has been closed. The panel embeds a
//! [`JobOwner`]; every [`DependentJob`] created from it registers its abort
//! flag with the owner. Dropping the owner raises all those flags, so the
//! dispatcher skips `complete` when the jobs come back.
//!
//! ```text
//! Coordinator                                 Worker
//!    │ enqueue(DependentJob) ── attach ──► owner registers abort flag
//!    │                                         │ run() ...
//!    │ drop(JobOwner) ── abort flags ─────────►│ (observes is_aborted)
//!    │ pump(): aborted → no complete()   ◄─────┘
//! ```
//!
//! When the owner is still alive at delivery, `complete` hands the finished
//! job to it synchronously through [`JobRecipient::job_done`]; there is no
//! second queue hop because delivery already runs on the coordinator.

use super::{AbortHandle, Job, JobContext};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Coordinator object that receives finished dependent jobs of type `J`
pub trait JobRecipient<J> {
    fn job_done(&mut self, job: J);
}

#[derive(Debug, Default)]
struct OwnerShared {
    destroyed: AtomicBool,
    next_key: AtomicU64,
    dependents: Mutex<Vec<(u64, AbortHandle)>>,
}

/// Destroyed-notification source, embedded in the owning object
///
/// Dropping it aborts every job still registered against it.
#[derive(Debug, Default)]
pub struct JobOwner {
    shared: Arc<OwnerShared>,
}

impl JobOwner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weak link for building dependent jobs
    pub fn link(&self) -> OwnerLink {
        OwnerLink {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of jobs currently registered against this owner
    pub fn dependent_count(&self) -> usize {
        self.shared
            .dependents
            .lock()
            .map(|deps| deps.len())
            .unwrap_or(0)
    }
}

impl Drop for JobOwner {
    fn drop(&mut self) {
        self.shared.destroyed.store(true, Ordering::SeqCst);
        let dependents = match self.shared.dependents.lock() {
            Ok(mut deps) => std::mem::take(&mut *deps),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if !dependents.is_empty() {
            log::debug!(
                "JobOwner dropped, aborting {} dependent job(s)",
                dependents.len()
            );
        }
        for (_, abort) in dependents {
            abort.abort();
        }
    }
}

/// Weak reference from a job to its owner
#[derive(Debug, Clone)]
pub struct OwnerLink {
    shared: Weak<OwnerShared>,
}

impl OwnerLink {
    pub fn is_alive(&self) -> bool {
        self.shared
            .upgrade()
            .map(|s| !s.destroyed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Register `abort` for the destroyed notification.
    ///
    /// If the owner is already gone the flag is raised immediately.
    fn register(&self, abort: &AbortHandle) -> Option<Registration> {
        let shared = match self.shared.upgrade() {
            Some(shared) if !shared.destroyed.load(Ordering::SeqCst) => shared,
            _ => {
                abort.abort();
                return None;
            }
        };
        let key = shared.next_key.fetch_add(1, Ordering::Relaxed);
        match shared.dependents.lock() {
            Ok(mut deps) => deps.push((key, abort.clone())),
            Err(_) => {
                abort.abort();
                return None;
            }
        }
        Some(Registration {
            owner: self.shared.clone(),
            key,
        })
    }
}

/// Removes a job's abort flag from its owner when dropped
#[derive(Debug)]
struct Registration {
    owner: Weak<OwnerShared>,
    key: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(shared) = self.owner.upgrade() {
            if let Ok(mut deps) = shared.dependents.lock() {
                deps.retain(|(key, _)| *key != self.key);
            }
        }
    }
}

/// Wraps job `J` so that it completes into owner `O`, or not at all
///
/// `locate` finds the owner inside the coordinator state `C` at delivery
/// time. The inner job's own `complete` is not called; the owner receives
/// the finished job instead.
pub struct DependentJob<J, O, C> {
    job: J,
    owner: OwnerLink,
    locate: fn(&mut C) -> Option<&mut O>,
    registration: Option<Registration>,
}

impl<J, O, C> DependentJob<J, O, C> {
    pub fn new(owner: &JobOwner, job: J, locate: fn(&mut C) -> Option<&mut O>) -> Self {
        Self {
            job,
            owner: owner.link(),
            locate,
            registration: None,
        }
    }
}

impl<J, O, C> Job<C> for DependentJob<J, O, C>
where
    J: Job<C>,
    O: JobRecipient<J> + 'static,
    C: 'static,
{
    fn name(&self) -> &str {
        self.job.name()
    }

    fn description(&self) -> Option<String> {
        self.job.description()
    }

    fn attach(&mut self, abort: &AbortHandle) {
        self.job.attach(abort);
        self.registration = self.owner.register(abort);
    }

    fn run(&mut self, ctx: &mut JobContext) -> bool {
        self.job.run(ctx)
    }

    fn complete(self: Box<Self>, cx: &mut C) {
        let DependentJob {
            job,
            owner,
            locate,
            registration,
        } = *self;
        drop(registration);

        if !owner.is_alive() {
            log::debug!("Dependent job '{}' outlived its owner, dropping", job.name());
            return;
        }
        match locate(cx) {
            Some(recipient) => recipient.job_done(job),
            None => log::warn!(
                "Dependent job '{}' finished but its owner is no longer reachable",
                job.name()
            ),
        }
    }
}
