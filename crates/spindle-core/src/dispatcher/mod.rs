//! Dispatcher: named job lanes over a reusable worker pool
//!
//! The dispatcher lives on the coordinator thread (typically the UI thread)
//! and is the only owner of the job registry and the worker pool. Neither is
//! shared, so neither is locked.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐  Assignment   ┌──────────┐
//! │     Coordinator      │ ────────────► │ Worker 1 │──┐
//! │                      │               └──────────┘  │
//! │  Dispatcher          │  Assignment   ┌──────────┐  │ WorkerEvent
//! │   lanes: name → Lane │ ────────────► │ Worker 2 │──┤ (progress, finished)
//! │   workers: pool      │               └──────────┘  │
//! │                      │ ◄───────────────────────────┘
//! │  pump(): complete()  │        completion channel
//! └──────────────────────┘
//! ```
//!
//! Jobs with the same name share a lane: at most one runs at any instant and
//! they start in enqueue order. When a job is delivered its worker
//! immediately takes the next queued job of the same lane; otherwise it goes
//! back to the idle pool for any lane. Jobs with different names run in
//! parallel, and the pool grows on demand to match.
//!
//! # Usage
//!
//! ```no_run
//! use spindle_core::config::DispatcherConfig;
//! use spindle_core::dispatcher::Dispatcher;
//! use spindle_core::job::FnJob;
//!
//! #[derive(Default)]
//! struct Collection {
//!     scans_done: usize,
//! }
//!
//! let mut collection = Collection::default();
//! let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
//!
//! dispatcher.enqueue(
//!     FnJob::new("collection-scan", |ctx| {
//!         ctx.report_total_steps(100);
//!         for _ in 0..100 {
//!             if ctx.is_aborted() {
//!                 return false;
//!             }
//!             ctx.increment_progress();
//!         }
//!         true
//!     })
//!     .on_complete(|c: &mut Collection| c.scans_done += 1)
//!     .boxed(),
//! );
//!
//! // Coordinator run loop tick
//! dispatcher.pump(&mut collection);
//!
//! dispatcher.shutdown(&mut collection);
//! ```

pub(crate) mod lane;
pub(crate) mod message;

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DispatcherConfig;
use crate::job::{AbortHandle, Job, JobId, JobInfo, JobOutcome, JobState};
use crate::progress::{Progress, ProgressDisplay};
use crate::worker::{Assignment, Worker, WorkerId, WorkerInit};

use lane::{Lane, QueuedJob, RunningJob};
use message::{CompletionChannel, Finished, RunResult, WorkerEvent};

/// Snapshot of dispatcher activity for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Worker threads in the pool
    pub workers: usize,
    /// Workers not holding a job
    pub idle_workers: usize,
    /// Lanes with a job in flight
    pub running: usize,
    /// Jobs waiting behind a running job
    pub queued: usize,
    /// Messages sent by workers but not yet pumped
    pub undelivered_events: usize,
    /// Jobs delivered with `complete` called, since creation
    pub completed: u64,
    /// Jobs delivered without `complete`, since creation
    pub aborted: u64,
}

/// Coordinator-thread job scheduler
///
/// `C` is the coordinator-owned state passed to [`Job::complete`]. The
/// dispatcher is deliberately `!Send`: every method must be called from the
/// thread that created it.
pub struct Dispatcher<C: 'static = ()> {
    config: DispatcherConfig,
    lanes: HashMap<Arc<str>, Lane<C>>,
    workers: Vec<Worker<C>>,
    channel: CompletionChannel<C>,
    worker_init: Option<WorkerInit>,
    display: Option<Box<dyn ProgressDisplay>>,
    next_job_id: u64,
    completed: u64,
    aborted: u64,
    last_prune: Instant,
    _coordinator: PhantomData<*const ()>,
}

impl<C: 'static> Dispatcher<C> {
    pub fn new(config: DispatcherConfig) -> Self {
        log::info!(
            "Dispatcher: starting (idle timeout: {:?})",
            config.idle_timeout()
        );
        Self {
            config,
            lanes: HashMap::new(),
            workers: Vec::new(),
            channel: CompletionChannel::new(),
            worker_init: None,
            display: None,
            next_job_id: 1,
            completed: 0,
            aborted: 0,
            last_prune: Instant::now(),
            _coordinator: PhantomData,
        }
    }

    /// Run `init` on every new worker thread before its first job
    pub fn with_worker_init(mut self, init: impl Fn(WorkerId) + Send + Sync + 'static) -> Self {
        self.worker_init = Some(Arc::new(init));
        self
    }

    /// Forward lifecycle and progress events to a display
    pub fn set_display(&mut self, display: Box<dyn ProgressDisplay>) {
        self.display = Some(display);
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    // ────────────────────────────────────────────────────────────────────────
    // Queueing
    // ────────────────────────────────────────────────────────────────────────

    /// Queue a job, starting it at once if its lane is idle
    ///
    /// Returns the number of jobs (running + queued, including this one)
    /// sharing the job's name.
    pub fn enqueue(&mut self, job: Box<dyn Job<C>>) -> usize {
        let name = self.register(job);
        let count = self.job_count(&name);
        self.advance_lane(&name, None);
        count
    }

    /// Queue several jobs before any of them can start
    ///
    /// Returns the lane count for the first job's name, or `None` for an
    /// empty batch.
    pub fn enqueue_batch(&mut self, jobs: Vec<Box<dyn Job<C>>>) -> Option<usize> {
        if jobs.is_empty() {
            return None;
        }

        let mut names: Vec<Arc<str>> = Vec::new();
        for job in jobs {
            let name = self.register(job);
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let count = self.job_count(&names[0]);
        for name in &names {
            self.advance_lane(name, None);
        }
        Some(count)
    }

    /// Abort every job with this job's name, then queue it behind them
    ///
    /// The aborted jobs still occupy the lane until delivered, so the new job
    /// never overlaps with one of them.
    pub fn enqueue_unique(&mut self, job: Box<dyn Job<C>>) -> usize {
        let name = job.name().to_string();
        self.cancel_all_named(&name);
        self.enqueue(job)
    }

    /// Raise the abort flag of every queued or running job named `name`
    ///
    /// Running jobs stop only when their `run` notices. Returns the number of
    /// jobs flagged.
    pub fn cancel_all_named(&mut self, name: &str) -> usize {
        let count = self.lanes.get(name).map(|lane| lane.abort_all()).unwrap_or(0);
        if count > 0 {
            log::debug!("Dispatcher: aborted {} job(s) named '{}'", count, name);
        }
        count
    }

    /// Whether any job named `name` is queued or running
    pub fn is_job_pending(&self, name: &str) -> bool {
        self.lanes.contains_key(name)
    }

    /// Queued plus running jobs named `name`
    pub fn job_count(&self, name: &str) -> usize {
        self.lanes.get(name).map(|lane| lane.len()).unwrap_or(0)
    }

    /// Jobs named `name` in execution order
    pub fn jobs_named(&self, name: &str) -> Vec<(JobInfo, JobState)> {
        self.lanes
            .get(name)
            .map(|lane| lane.snapshot())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            workers: self.workers.len(),
            idle_workers: self.workers.iter().filter(|w| w.is_idle()).count(),
            running: self.lanes.values().filter(|l| l.is_running()).count(),
            queued: self.lanes.values().map(|l| l.queued_len()).sum(),
            undelivered_events: self.channel.len(),
            completed: self.completed,
            aborted: self.aborted,
        }
    }

    /// Assign an id, let the job attach to its abort flag, append to its lane
    fn register(&mut self, mut job: Box<dyn Job<C>>) -> Arc<str> {
        let id = JobId(self.next_job_id);
        self.next_job_id += 1;

        let name: Arc<str> = match self.lanes.get_key_value(job.name()) {
            Some((existing, _)) => existing.clone(),
            None => Arc::from(job.name()),
        };
        let info = JobInfo {
            id,
            name: name.clone(),
            description: job.description(),
        };
        let abort = AbortHandle::new();
        job.attach(&abort);

        log::debug!("Dispatcher: queued {}", info.label());
        self.lanes
            .entry(name.clone())
            .or_insert_with(Lane::new)
            .push(QueuedJob { info, abort, job });
        name
    }

    // ────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ────────────────────────────────────────────────────────────────────────

    /// Start the lane's next job if it is idle
    ///
    /// `worker` is the worker that just delivered a job of this lane; it is
    /// reused when there is more work, otherwise released.
    fn advance_lane(&mut self, name: &Arc<str>, worker: Option<WorkerId>) {
        let next = match self.lanes.get_mut(name) {
            Some(lane) => lane.next_to_start(),
            None => None,
        };

        let Some(QueuedJob { info, abort, job }) = next else {
            if let Some(id) = worker {
                self.release_worker(id);
            }
            if self.lanes.get(name).is_some_and(|lane| lane.is_empty()) {
                self.lanes.remove(name);
            }
            return;
        };

        if abort.is_aborted() {
            // Never started: straight to delivery, no run()
            log::debug!("Dispatcher: {} aborted before start", info.label());
            if let Some(w) = worker.and_then(|id| self.worker_mut(id)) {
                w.reserve(info.id);
            }
            self.set_running(name, &info, &abort, worker);
            self.channel.post(Finished {
                worker,
                info,
                job,
                result: RunResult::Skipped,
            });
            return;
        }

        let index = match worker.and_then(|id| self.worker_index(id)) {
            Some(index) => index,
            None => match self.acquire_worker() {
                Some(index) => index,
                None => {
                    self.set_running(name, &info, &abort, None);
                    self.channel.post(Finished {
                        worker: None,
                        info,
                        job,
                        result: RunResult::NotStarted,
                    });
                    return;
                }
            },
        };

        let worker_id = self.workers[index].id();
        let job_id = info.id;
        self.set_running(name, &info, &abort, Some(worker_id));

        let assignment = Assignment { info, abort, job };
        if let Err((e, assignment)) = self.workers[index].run_job(assignment) {
            log::error!(
                "Dispatcher: could not start {}: {}",
                assignment.info.label(),
                e
            );
            self.workers.remove(index);
            if let Some(lane) = self.lanes.get_mut(name) {
                if let Some(running) = lane.finish(assignment.info.id) {
                    lane.set_running(RunningJob {
                        worker: None,
                        ..running
                    });
                }
            }
            self.channel.post(Finished {
                worker: None,
                info: assignment.info,
                job: assignment.job,
                result: RunResult::NotStarted,
            });
        } else {
            log::debug!("Dispatcher: job {} started on worker {}", job_id, worker_id);
            let running = self.lanes.get(name).and_then(|lane| lane.running());
            if let (Some(display), Some(running)) = (self.display.as_mut(), running) {
                display.job_started(&running.info);
            }
        }
    }

    fn set_running(
        &mut self,
        name: &Arc<str>,
        info: &JobInfo,
        abort: &AbortHandle,
        worker: Option<WorkerId>,
    ) {
        if let Some(lane) = self.lanes.get_mut(name) {
            lane.set_running(RunningJob {
                info: info.clone(),
                abort: abort.clone(),
                worker,
            });
        }
    }

    /// Idle worker, or a new one; `None` if the thread could not be spawned
    ///
    /// Picks the most recently released idle worker so surplus workers age
    /// out under the idle timeout.
    fn acquire_worker(&mut self) -> Option<usize> {
        let idle = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.is_idle())
            .max_by_key(|(_, w)| w.idle_since())
            .map(|(index, _)| index);
        if idle.is_some() {
            return idle;
        }

        match Worker::spawn(&self.config, self.channel.sender(), self.worker_init.clone()) {
            Ok(worker) => {
                log::info!(
                    "Dispatcher: spawned worker {} (pool size {})",
                    worker.id(),
                    self.workers.len() + 1
                );
                self.workers.push(worker);
                Some(self.workers.len() - 1)
            }
            Err(e) => {
                log::error!("Dispatcher: {}", e);
                None
            }
        }
    }

    fn worker_index(&self, id: WorkerId) -> Option<usize> {
        self.workers.iter().position(|w| w.id() == id)
    }

    fn worker_mut(&mut self, id: WorkerId) -> Option<&mut Worker<C>> {
        self.workers.iter_mut().find(|w| w.id() == id)
    }

    fn release_worker(&mut self, id: WorkerId) {
        if let Some(worker) = self.worker_mut(id) {
            worker.release();
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Delivery
    // ────────────────────────────────────────────────────────────────────────

    /// Deliver everything waiting on the completion channel
    ///
    /// Call once per coordinator run-loop tick. Returns the number of jobs
    /// delivered. Also prunes idle workers when the prune interval elapsed.
    pub fn pump(&mut self, cx: &mut C) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.channel.try_recv() {
            if self.handle_event(event, cx) {
                delivered += 1;
            }
        }
        self.maybe_prune();
        delivered
    }

    /// Block up to `timeout` for the first event, then [`pump`](Self::pump)
    pub fn pump_timeout(&mut self, cx: &mut C, timeout: Duration) -> usize {
        let mut delivered = 0;
        if let Some(event) = self.channel.recv_timeout(timeout) {
            if self.handle_event(event, cx) {
                delivered += 1;
            }
        }
        delivered + self.pump(cx)
    }

    /// Returns true if a job was delivered
    fn handle_event(&mut self, event: WorkerEvent<C>, cx: &mut C) -> bool {
        match event {
            WorkerEvent::Progress { job, progress } => {
                self.forward_progress(job, &progress);
                false
            }
            WorkerEvent::Finished(finished) => {
                self.deliver(finished, cx);
                true
            }
        }
    }

    fn forward_progress(&mut self, job: JobId, progress: &Progress) {
        let Some(display) = self.display.as_mut() else {
            return;
        };
        let running = self
            .lanes
            .values()
            .filter_map(|lane| lane.running())
            .find(|running| running.info.id == job);
        if let Some(running) = running {
            display.progress(&running.info, progress);
        }
    }

    fn deliver(&mut self, finished: Finished<C>, cx: &mut C) {
        let Finished {
            worker,
            info,
            job,
            result,
        } = finished;

        let running = self
            .lanes
            .get_mut(&info.name)
            .and_then(|lane| lane.finish(info.id));
        let Some(running) = running else {
            log::error!(
                "Dispatcher: {} delivered but is not running in its lane",
                info.label()
            );
            if let Some(id) = worker {
                self.release_worker(id);
            }
            return;
        };

        if running.worker != worker {
            log::error!(
                "Dispatcher: {} came back from worker {:?}, expected {:?}",
                info.label(),
                worker,
                running.worker
            );
        }

        let outcome = if result == RunResult::Succeeded && !running.abort.is_aborted() {
            job.complete(cx);
            self.completed += 1;
            JobOutcome::Completed
        } else {
            drop(job);
            self.aborted += 1;
            JobOutcome::Aborted
        };
        log::debug!(
            "Dispatcher: {} delivered as {:?} ({:?})",
            info.label(),
            outcome,
            result
        );

        if let Some(display) = self.display.as_mut() {
            display.job_finished(&info, outcome);
        }
        self.advance_lane(&info.name, worker);
    }

    // ────────────────────────────────────────────────────────────────────────
    // Pool maintenance
    // ────────────────────────────────────────────────────────────────────────

    fn maybe_prune(&mut self) {
        if self.config.idle_timeout().is_none() {
            return;
        }
        if self.last_prune.elapsed() >= self.config.prune_interval() {
            self.prune_idle_workers();
        }
    }

    /// Stop workers idle for at least the configured idle timeout
    ///
    /// Busy workers are never evicted. Returns the number removed.
    pub fn prune_idle_workers(&mut self) -> usize {
        self.last_prune = Instant::now();
        let Some(timeout) = self.config.idle_timeout() else {
            return 0;
        };

        let now = Instant::now();
        let before = self.workers.len();
        self.workers
            .retain(|w| w.idle_for(now).map_or(true, |idle| idle < timeout));
        let pruned = before - self.workers.len();
        if pruned > 0 {
            log::info!(
                "Dispatcher: pruned {} idle worker(s), {} left",
                pruned,
                self.workers.len()
            );
        }
        pruned
    }

    /// Drain all jobs and stop every worker
    ///
    /// Queued jobs are aborted and delivered without running. Running jobs
    /// are waited for and delivered normally (their abort flag is raised too
    /// if `abort_running_on_shutdown` is set).
    pub fn shutdown(mut self, cx: &mut C) {
        log::info!("Dispatcher: shutting down");
        let abort_running = self.config.abort_running_on_shutdown;
        for lane in self.lanes.values() {
            if abort_running {
                lane.abort_all();
            } else {
                lane.abort_queued();
            }
        }

        while !self.lanes.is_empty() {
            let waiting: usize = self.lanes.values().map(|l| l.len()).sum();
            if self.pump_timeout(cx, Duration::from_secs(5)) == 0 {
                log::info!("Dispatcher: waiting for {} job(s) to finish", waiting);
            }
        }

        self.stop_workers();
        log::info!(
            "Dispatcher: stopped ({} completed, {} aborted)",
            self.completed,
            self.aborted
        );
    }

    fn stop_workers(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
        self.workers.clear();
    }
}

impl<C: 'static> Drop for Dispatcher<C> {
    fn drop(&mut self) {
        if !self.lanes.is_empty() {
            let outstanding: usize = self.lanes.values().map(|l| l.abort_all()).sum();
            log::warn!(
                "Dispatcher dropped with {} job(s) outstanding; they will not complete",
                outstanding
            );
        }
        self.stop_workers();
    }
}

impl<C: 'static> fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("lanes", &self.lanes.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DependentJob, FnJob, JobContext, JobOwner, JobRecipient};
    use crate::worker::current_worker_id;
    use crossbeam::channel::{self, Receiver, Sender};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(5);

    fn pump_until<C: 'static>(
        dispatcher: &mut Dispatcher<C>,
        cx: &mut C,
        mut done: impl FnMut(&Dispatcher<C>, &C) -> bool,
    ) {
        let deadline = Instant::now() + WAIT;
        while !done(&*dispatcher, &*cx) {
            assert!(Instant::now() < deadline, "Timed out waiting for dispatcher");
            dispatcher.pump_timeout(cx, Duration::from_millis(10));
        }
    }

    fn drained<C: 'static>(dispatcher: &Dispatcher<C>, _cx: &C) -> bool {
        dispatcher.lanes.is_empty()
    }

    /// Job that blocks until the gate opens, announcing its start
    fn gated(
        name: &str,
        label: &str,
        started: Sender<String>,
        gate: Receiver<()>,
    ) -> Box<dyn Job<Vec<String>>> {
        let start_label = label.to_string();
        let done_label = label.to_string();
        FnJob::new(name, move |_| {
            let _ = started.send(start_label.clone());
            gate.recv_timeout(WAIT).is_ok()
        })
        .on_complete(move |log: &mut Vec<String>| log.push(done_label))
        .boxed()
    }

    fn recording(name: &str, label: &str) -> Box<dyn Job<Vec<String>>> {
        let label = label.to_string();
        FnJob::new(name, |_| true)
            .on_complete(move |log: &mut Vec<String>| log.push(label))
            .boxed()
    }

    #[test]
    fn test_same_name_runs_in_order_without_overlap() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut log: Vec<String> = Vec::new();
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let run_order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let active = active.clone();
            let overlapped = overlapped.clone();
            let run_order = run_order.clone();
            let job = FnJob::new("collection-scan", move |_| {
                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                run_order.lock().unwrap().push(i);
                std::thread::sleep(Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
                true
            })
            .on_complete(move |log: &mut Vec<String>| log.push(format!("scan-{}", i)));
            assert_eq!(dispatcher.enqueue(job.boxed()), i + 1);
        }

        pump_until(&mut dispatcher, &mut log, |_, log| log.len() == 5);
        assert!(!overlapped.load(Ordering::SeqCst), "Jobs of one lane overlapped");
        assert_eq!(*run_order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(log, vec!["scan-0", "scan-1", "scan-2", "scan-3", "scan-4"]);
        assert_eq!(dispatcher.stats().completed, 5);
        assert!(!dispatcher.is_job_pending("collection-scan"));
    }

    #[test]
    fn test_different_names_run_in_parallel() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut log: Vec<String> = Vec::new();
        let (a_tx, a_rx) = channel::unbounded::<()>();
        let (b_tx, b_rx) = channel::unbounded::<()>();

        // Each job waits for the other to have started
        dispatcher.enqueue(
            FnJob::new("cover-fetch", move |_| {
                let _ = a_tx.send(());
                b_rx.recv_timeout(WAIT).is_ok()
            })
            .on_complete(|log: &mut Vec<String>| log.push("covers".to_string()))
            .boxed(),
        );
        dispatcher.enqueue(
            FnJob::new("waveform", move |_| {
                let _ = b_tx.send(());
                a_rx.recv_timeout(WAIT).is_ok()
            })
            .on_complete(|log: &mut Vec<String>| log.push("waveform".to_string()))
            .boxed(),
        );
        assert_eq!(dispatcher.stats().workers, 2);

        pump_until(&mut dispatcher, &mut log, drained);
        log.sort();
        assert_eq!(log, vec!["covers", "waveform"]);
    }

    #[test]
    fn test_cancel_aborts_running_and_skips_queued() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut log: Vec<String> = Vec::new();
        let (started_tx, started_rx) = channel::unbounded();
        let (gate_tx, gate_rx) = channel::unbounded();
        let second_ran = Arc::new(AtomicBool::new(false));

        dispatcher.enqueue(gated("tags", "first", started_tx, gate_rx));
        let ran = second_ran.clone();
        dispatcher.enqueue(
            FnJob::new("tags", move |_| {
                ran.store(true, Ordering::SeqCst);
                true
            })
            .boxed(),
        );
        assert_eq!(started_rx.recv_timeout(WAIT).unwrap(), "first");

        assert_eq!(dispatcher.cancel_all_named("tags"), 2);
        assert_eq!(dispatcher.cancel_all_named("unknown"), 0);
        gate_tx.send(()).unwrap();

        pump_until(&mut dispatcher, &mut log, drained);
        assert!(log.is_empty(), "Aborted jobs must not complete");
        assert!(!second_ran.load(Ordering::SeqCst), "Aborted queued job must not run");
        assert_eq!(dispatcher.stats().aborted, 2);
    }

    #[test]
    fn test_enqueue_unique_supersedes_pending_jobs() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut log: Vec<String> = Vec::new();
        let (started_tx, started_rx) = channel::unbounded();
        let (gate_tx, gate_rx) = channel::unbounded();

        dispatcher.enqueue(gated("search", "old", started_tx, gate_rx));
        dispatcher.enqueue(recording("search", "stale"));
        started_rx.recv_timeout(WAIT).unwrap();

        assert_eq!(dispatcher.enqueue_unique(recording("search", "fresh")), 3);
        gate_tx.send(()).unwrap();

        pump_until(&mut dispatcher, &mut log, drained);
        assert_eq!(log, vec!["fresh"]);
    }

    #[test]
    fn test_declined_and_panicking_jobs_do_not_complete() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut log: Vec<String> = Vec::new();

        dispatcher.enqueue(
            FnJob::new("import", |_| false)
                .on_complete(|log: &mut Vec<String>| log.push("declined".to_string()))
                .boxed(),
        );
        dispatcher.enqueue(
            FnJob::new("import", |_| panic!("unreadable file"))
                .on_complete(|log: &mut Vec<String>| log.push("panicked".to_string()))
                .boxed(),
        );
        dispatcher.enqueue(recording("import", "after"));

        pump_until(&mut dispatcher, &mut log, drained);
        assert_eq!(log, vec!["after"]);
        let stats = dispatcher.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.aborted, 2);
        assert_eq!(stats.workers, 1, "Worker must survive a panicking job");
    }

    #[test]
    fn test_enqueue_batch() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut log: Vec<String> = Vec::new();

        assert_eq!(dispatcher.enqueue_batch(Vec::new()), None);

        let batch = vec![
            recording("export", "e1"),
            recording("export", "e2"),
            recording("waveform", "w1"),
            recording("export", "e3"),
        ];
        assert_eq!(dispatcher.enqueue_batch(batch), Some(3));

        pump_until(&mut dispatcher, &mut log, drained);
        let exports: Vec<&str> = log
            .iter()
            .map(|s| s.as_str())
            .filter(|s| s.starts_with('e'))
            .collect();
        assert_eq!(exports, vec!["e1", "e2", "e3"]);
        assert!(log.contains(&"w1".to_string()));
    }

    #[test]
    fn test_queries_reflect_lane_contents() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut log: Vec<String> = Vec::new();
        let (started_tx, started_rx) = channel::unbounded();
        let (gate_tx, gate_rx) = channel::unbounded();

        dispatcher.enqueue(gated("analysis", "a", started_tx, gate_rx));
        dispatcher.enqueue(recording("analysis", "b"));
        dispatcher.enqueue(
            FnJob::new("analysis", |_| true)
                .with_description("Analysing track 3")
                .boxed(),
        );
        started_rx.recv_timeout(WAIT).unwrap();

        assert!(dispatcher.is_job_pending("analysis"));
        assert!(!dispatcher.is_job_pending("export"));
        assert_eq!(dispatcher.job_count("analysis"), 3);
        assert_eq!(dispatcher.job_count("export"), 0);

        let states: Vec<JobState> = dispatcher
            .jobs_named("analysis")
            .into_iter()
            .map(|(_, state)| state)
            .collect();
        assert_eq!(states, vec![JobState::Running, JobState::Queued, JobState::Queued]);
        assert_eq!(
            dispatcher.jobs_named("analysis")[2].0.label(),
            "Analysing track 3"
        );

        let stats = dispatcher.stats();
        assert_eq!(stats.running, 1);
        assert_eq!(stats.queued, 2);

        gate_tx.send(()).unwrap();
        pump_until(&mut dispatcher, &mut log, drained);
        assert_eq!(log, vec!["a", "b"]);
        assert_eq!(dispatcher.job_count("analysis"), 0);
    }

    #[test]
    fn test_lane_continues_on_same_worker_and_pool_is_reused() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut log: Vec<String> = Vec::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["scan", "scan", "scan"] {
            let seen = seen.clone();
            dispatcher.enqueue(
                FnJob::new(name, move |ctx| {
                    seen.lock().unwrap().push((current_worker_id(), ctx.worker_id()));
                    true
                })
                .boxed(),
            );
        }
        pump_until(&mut dispatcher, &mut log, drained);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        let first = seen[0].1;
        for (thread_local, ctx_worker) in &seen {
            assert_eq!(*thread_local, Some(*ctx_worker));
            assert_eq!(*ctx_worker, first);
        }

        // An idle worker serves any lane
        dispatcher.enqueue(recording("tags", "t"));
        pump_until(&mut dispatcher, &mut log, drained);
        assert_eq!(log, vec!["t"]);
        let stats = dispatcher.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.idle_workers, 1);
    }

    #[test]
    fn test_worker_init_runs_once_per_worker() {
        let inits = Arc::new(Mutex::new(Vec::new()));
        let hook_inits = inits.clone();
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default())
            .with_worker_init(move |id| hook_inits.lock().unwrap().push(id));
        let mut log: Vec<String> = Vec::new();
        let job_worker = Arc::new(Mutex::new(None));

        for _ in 0..3 {
            let job_worker = job_worker.clone();
            dispatcher.enqueue(
                FnJob::new("db", move |ctx| {
                    *job_worker.lock().unwrap() = Some(ctx.worker_id());
                    true
                })
                .boxed(),
            );
        }
        pump_until(&mut dispatcher, &mut log, drained);

        let inits = inits.lock().unwrap().clone();
        assert_eq!(inits.len(), 1);
        assert_eq!(Some(inits[0]), *job_worker.lock().unwrap());
    }

    #[test]
    fn test_prune_removes_only_idle_workers() {
        let config = DispatcherConfig {
            idle_timeout_ms: Some(0),
            ..DispatcherConfig::default()
        };
        let mut dispatcher = Dispatcher::new(config);
        let mut log: Vec<String> = Vec::new();
        let (started_tx, started_rx) = channel::unbounded();
        let (gate_tx, gate_rx) = channel::unbounded();

        dispatcher.enqueue(recording("quick", "q"));
        pump_until(&mut dispatcher, &mut log, drained);
        dispatcher.enqueue(gated("slow", "s", started_tx, gate_rx));
        started_rx.recv_timeout(WAIT).unwrap();
        dispatcher.enqueue(recording("other", "o"));
        pump_until(&mut dispatcher, &mut log, |d, _| !d.is_job_pending("other"));
        assert_eq!(dispatcher.stats().workers, 2);

        assert_eq!(dispatcher.prune_idle_workers(), 1);
        let stats = dispatcher.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.idle_workers, 0);

        gate_tx.send(()).unwrap();
        pump_until(&mut dispatcher, &mut log, drained);
        assert_eq!(log, vec!["q", "o", "s"]);
    }

    #[test]
    fn test_workers_kept_without_idle_timeout() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut log: Vec<String> = Vec::new();
        dispatcher.enqueue(recording("quick", "q"));
        pump_until(&mut dispatcher, &mut log, drained);

        assert_eq!(dispatcher.prune_idle_workers(), 0);
        assert_eq!(dispatcher.stats().workers, 1);
    }

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl ProgressDisplay for Recorder {
        fn job_started(&mut self, job: &JobInfo) {
            self.0.lock().unwrap().push(format!("start {}", job.name));
        }

        fn progress(&mut self, _job: &JobInfo, progress: &Progress) {
            self.0.lock().unwrap().push(format!("{}%", progress.percent));
        }

        fn job_finished(&mut self, job: &JobInfo, outcome: JobOutcome) {
            self.0
                .lock()
                .unwrap()
                .push(format!("finish {} {:?}", job.name, outcome));
        }
    }

    #[test]
    fn test_progress_forwarded_to_display_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.set_display(Box::new(Recorder(events.clone())));
        let mut log: Vec<String> = Vec::new();

        dispatcher.enqueue(
            FnJob::new("scan", |ctx: &mut JobContext| {
                ctx.report_total_steps(4);
                ctx.increment_progress();
                ctx.increment_progress();
                ctx.report_progress(4, 4);
                true
            })
            .boxed(),
        );
        pump_until(&mut dispatcher, &mut log, drained);

        let events = events.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some("start scan"));
        assert_eq!(events.last().map(String::as_str), Some("finish scan Completed"));
        assert!(events.contains(&"50%".to_string()));
        assert!(events.contains(&"100%".to_string()));
    }

    #[test]
    fn test_shutdown_waits_for_running_and_aborts_queued() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut log: Vec<String> = Vec::new();
        let (started_tx, started_rx) = channel::unbounded::<()>();

        dispatcher.enqueue(
            FnJob::new("save", move |_| {
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(50));
                true
            })
            .on_complete(|log: &mut Vec<String>| log.push("saved".to_string()))
            .boxed(),
        );
        dispatcher.enqueue(recording("save", "queued"));
        started_rx.recv_timeout(WAIT).unwrap();

        dispatcher.shutdown(&mut log);
        assert_eq!(log, vec!["saved"]);
    }

    #[test]
    fn test_shutdown_can_abort_running_jobs() {
        let config = DispatcherConfig {
            abort_running_on_shutdown: true,
            ..DispatcherConfig::default()
        };
        let mut dispatcher = Dispatcher::new(config);
        let mut log: Vec<String> = Vec::new();
        let (started_tx, started_rx) = channel::unbounded::<()>();

        dispatcher.enqueue(
            FnJob::new("export", move |ctx| {
                let _ = started_tx.send(());
                let deadline = Instant::now() + WAIT;
                while !ctx.is_aborted() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(1));
                }
                true
            })
            .on_complete(|log: &mut Vec<String>| log.push("exported".to_string()))
            .boxed(),
        );
        started_rx.recv_timeout(WAIT).unwrap();

        dispatcher.shutdown(&mut log);
        assert!(log.is_empty());
    }

    #[test]
    fn test_drop_aborts_running_jobs() {
        let mut dispatcher: Dispatcher<()> = Dispatcher::new(DispatcherConfig::default());
        let (started_tx, started_rx) = channel::unbounded::<()>();
        let saw_abort = Arc::new(AtomicBool::new(false));

        let flag = saw_abort.clone();
        dispatcher.enqueue(
            FnJob::new("scan", move |ctx| {
                let _ = started_tx.send(());
                let deadline = Instant::now() + WAIT;
                while Instant::now() < deadline {
                    if ctx.is_aborted() {
                        flag.store(true, Ordering::SeqCst);
                        return false;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                true
            })
            .boxed(),
        );
        started_rx.recv_timeout(WAIT).unwrap();

        drop(dispatcher);
        assert!(saw_abort.load(Ordering::SeqCst));
    }

    struct Reader {
        path: String,
        gate: Receiver<()>,
        ran: Arc<AtomicBool>,
    }

    impl Job<Browser> for Reader {
        fn name(&self) -> &str {
            "playlist-reader"
        }

        fn run(&mut self, _ctx: &mut JobContext) -> bool {
            self.ran.store(true, Ordering::SeqCst);
            self.gate.recv_timeout(WAIT).is_ok()
        }
    }

    #[derive(Default)]
    struct Panel {
        owner: JobOwner,
        loaded: Vec<String>,
    }

    impl JobRecipient<Reader> for Panel {
        fn job_done(&mut self, job: Reader) {
            self.loaded.push(job.path);
        }
    }

    #[derive(Default)]
    struct Browser {
        panel: Option<Panel>,
    }

    fn locate_panel(browser: &mut Browser) -> Option<&mut Panel> {
        browser.panel.as_mut()
    }

    fn reader_for(
        panel: &Panel,
        path: &str,
        gate: Receiver<()>,
    ) -> (Box<dyn Job<Browser>>, Arc<AtomicBool>) {
        let ran = Arc::new(AtomicBool::new(false));
        let job = DependentJob::new(
            &panel.owner,
            Reader {
                path: path.to_string(),
                gate,
                ran: ran.clone(),
            },
            locate_panel,
        );
        (Box::new(job), ran)
    }

    #[test]
    fn test_dependent_job_delivers_to_live_owner() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut browser = Browser {
            panel: Some(Panel::default()),
        };
        let (gate_tx, gate_rx) = channel::unbounded();

        let (job, _) = reader_for(browser.panel.as_ref().unwrap(), "crate.m3u", gate_rx);
        dispatcher.enqueue(job);
        gate_tx.send(()).unwrap();
        pump_until(&mut dispatcher, &mut browser, drained);

        let panel = browser.panel.as_ref().unwrap();
        assert_eq!(panel.loaded, vec!["crate.m3u".to_string()]);
        assert_eq!(panel.owner.dependent_count(), 0);
    }

    #[test]
    fn test_dependent_job_dropped_with_owner() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut browser = Browser {
            panel: Some(Panel::default()),
        };
        let (gate_tx, gate_rx) = channel::unbounded();

        let (job, _) = reader_for(browser.panel.as_ref().unwrap(), "crate.m3u", gate_rx);
        dispatcher.enqueue(job);
        assert_eq!(browser.panel.as_ref().unwrap().owner.dependent_count(), 1);

        // Panel closes while the read is in flight
        browser.panel = None;
        gate_tx.send(()).unwrap();
        pump_until(&mut dispatcher, &mut browser, drained);

        // Replacement panel must not receive the old result
        browser.panel = Some(Panel::default());
        assert!(browser.panel.as_ref().unwrap().loaded.is_empty());
        assert_eq!(dispatcher.stats().aborted, 1);
    }

    #[test]
    fn test_job_aborted_before_start_never_runs() {
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        let mut browser = Browser {
            panel: Some(Panel::default()),
        };
        let (_gate_tx, gate_rx) = channel::unbounded();

        let (job, ran) = reader_for(browser.panel.as_ref().unwrap(), "crate.m3u", gate_rx);
        browser.panel = None;
        browser.panel = Some(Panel::default());

        // Owner already gone: attach raises the flag at enqueue
        dispatcher.enqueue(job);
        pump_until(&mut dispatcher, &mut browser, drained);

        assert!(!ran.load(Ordering::SeqCst));
        assert!(browser.panel.as_ref().unwrap().loaded.is_empty());
        let stats = dispatcher.stats();
        assert_eq!(stats.aborted, 1);
        assert_eq!(stats.workers, 0, "Skipped job must not need a worker");
    }

    #[test]
    fn test_dead_worker_delivers_aborted_and_lane_continues() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.set_display(Box::new(Recorder(events.clone())));
        let mut log: Vec<String> = Vec::new();

        dispatcher.enqueue(recording("tags", "t0"));
        pump_until(&mut dispatcher, &mut log, drained);
        assert_eq!(dispatcher.stats().workers, 1);

        // The pooled worker's thread is gone; the next hand-off fails
        dispatcher.workers[0].stop();
        dispatcher.enqueue(recording("tags", "t1"));
        dispatcher.enqueue(recording("tags", "t2"));
        pump_until(&mut dispatcher, &mut log, drained);

        assert_eq!(log, vec!["t0", "t2"]);
        let stats = dispatcher.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.aborted, 1);
        assert_eq!(stats.workers, 1, "Dead worker must leave the pool");

        let events = events.lock().unwrap().clone();
        let started = events.iter().filter(|e| e.starts_with("start")).count();
        assert_eq!(started, 2, "A job that never reached a worker must not be shown as started");
        assert!(events.contains(&"finish tags Aborted".to_string()));
    }

    #[test]
    fn test_pump_prunes_once_interval_elapses() {
        let config = DispatcherConfig {
            idle_timeout_ms: Some(0),
            prune_interval_ms: 0,
            ..DispatcherConfig::default()
        };
        let mut dispatcher = Dispatcher::new(config);
        let mut log: Vec<String> = Vec::new();

        dispatcher.enqueue(recording("quick", "q"));
        pump_until(&mut dispatcher, &mut log, drained);
        dispatcher.pump(&mut log);

        assert_eq!(log, vec!["q"]);
        assert_eq!(dispatcher.stats().workers, 0);
    }

    #[test]
    fn test_pump_does_not_prune_before_interval() {
        let config = DispatcherConfig {
            idle_timeout_ms: Some(0),
            prune_interval_ms: 3_600_000,
            ..DispatcherConfig::default()
        };
        let mut dispatcher = Dispatcher::new(config);
        let mut log: Vec<String> = Vec::new();

        dispatcher.enqueue(recording("quick", "q"));
        pump_until(&mut dispatcher, &mut log, drained);
        dispatcher.pump(&mut log);
        assert_eq!(dispatcher.stats().workers, 1);

        // Eligible all along, only the interval held it back
        assert_eq!(dispatcher.prune_idle_workers(), 1);
        assert_eq!(dispatcher.stats().workers, 0);
    }
}
