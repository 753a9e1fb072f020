//! lane-soak - Drive the dispatcher with synthetic job lanes
//!
//! Usage: `lane-soak [config.yaml]`
//!
//! Queues an interleaved batch of jobs across several lanes, cancels one lane
//! half-way through, pumps until everything is delivered and checks that each
//! lane ran its jobs one at a time in submission order.
//!
//! Set RUST_LOG=debug to see per-job progress.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use spindle_core::config::{default_config_path, load_config};
use spindle_core::{Dispatcher, DispatcherConfig, FnJob, Job, JobContext, LogDisplay};

const LANES: [&str; 4] = ["collection-scan", "cover-fetch", "waveform", "export"];
const CANCELLED_LANE: &str = "export";
const JOBS_PER_LANE: usize = 24;
const STEPS_PER_JOB: u64 = 8;

/// What the workers observed for one lane
#[derive(Default)]
struct LaneProbe {
    active: AtomicUsize,
    overlapped: AtomicBool,
    started: Mutex<Vec<usize>>,
}

/// Coordinator-side record of delivered jobs
#[derive(Default)]
struct SoakState {
    completed: BTreeMap<&'static str, Vec<usize>>,
}

impl SoakState {
    fn completed_in(&self, lane: &str) -> usize {
        self.completed.get(lane).map_or(0, Vec::len)
    }
}

fn soak_job(lane: &'static str, index: usize, probe: Arc<LaneProbe>) -> Box<dyn Job<SoakState>> {
    FnJob::new(lane, move |ctx: &mut JobContext| {
        if probe.active.fetch_add(1, Ordering::SeqCst) > 0 {
            probe.overlapped.store(true, Ordering::SeqCst);
        }
        if let Ok(mut started) = probe.started.lock() {
            started.push(index);
        }

        ctx.report_total_steps(STEPS_PER_JOB);
        let mut finished = true;
        for _ in 0..STEPS_PER_JOB {
            if ctx.is_aborted() {
                finished = false;
                break;
            }
            thread::sleep(Duration::from_millis(1));
            ctx.increment_progress();
        }

        probe.active.fetch_sub(1, Ordering::SeqCst);
        finished
    })
    .with_description(format!("{} {}/{}", lane, index + 1, JOBS_PER_LANE))
    .on_complete(move |state: &mut SoakState| {
        state.completed.entry(lane).or_default().push(index);
    })
    .boxed()
}

fn is_increasing(indices: &[usize]) -> bool {
    indices.windows(2).all(|pair| pair[0] < pair[1])
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config: DispatcherConfig = load_config(&config_path);

    log::info!(
        "lane-soak: {} lanes x {} jobs, cancelling '{}' half-way",
        LANES.len(),
        JOBS_PER_LANE,
        CANCELLED_LANE
    );

    let mut dispatcher = Dispatcher::new(config);
    dispatcher.set_display(Box::new(LogDisplay));
    let mut state = SoakState::default();

    let probes: Vec<(&'static str, Arc<LaneProbe>)> = LANES
        .iter()
        .map(|lane| (*lane, Arc::new(LaneProbe::default())))
        .collect();

    let mut batch = Vec::with_capacity(LANES.len() * JOBS_PER_LANE);
    for index in 0..JOBS_PER_LANE {
        for (lane, probe) in &probes {
            batch.push(soak_job(*lane, index, probe.clone()));
        }
    }
    dispatcher.enqueue_batch(batch);

    let start = Instant::now();
    let mut cancelled = None;
    while LANES.iter().any(|lane| dispatcher.is_job_pending(lane)) {
        dispatcher.pump_timeout(&mut state, Duration::from_millis(20));

        if cancelled.is_none() && state.completed_in(CANCELLED_LANE) >= JOBS_PER_LANE / 2 {
            let count = dispatcher.cancel_all_named(CANCELLED_LANE);
            log::info!("lane-soak: cancelled {} job(s) in '{}'", count, CANCELLED_LANE);
            cancelled = Some(count);
        }
    }
    let elapsed = start.elapsed();
    let stats = dispatcher.stats();
    dispatcher.shutdown(&mut state);

    println!();
    println!("{:<16} {:>9} {:>9}  {}", "lane", "started", "completed", "result");
    let mut failures = 0;
    for (lane, probe) in &probes {
        let started = probe
            .started
            .lock()
            .map(|started| started.clone())
            .unwrap_or_default();
        let completed = state.completed.get(lane).cloned().unwrap_or_default();

        let mut problems = Vec::new();
        if probe.overlapped.load(Ordering::SeqCst) {
            problems.push("overlapping runs");
        }
        if !is_increasing(&started) {
            problems.push("started out of order");
        }
        if !is_increasing(&completed) {
            problems.push("completed out of order");
        }
        if *lane != CANCELLED_LANE && completed.len() != JOBS_PER_LANE {
            problems.push("jobs missing");
        }

        let result = if problems.is_empty() {
            "ok".to_string()
        } else {
            failures += 1;
            problems.join(", ")
        };
        println!(
            "{:<16} {:>9} {:>9}  {}",
            lane,
            started.len(),
            completed.len(),
            result
        );
    }

    println!();
    println!("elapsed:   {:?}", elapsed);
    println!("cancelled: {}", cancelled.unwrap_or(0));
    println!("{:#?}", stats);

    if failures > 0 {
        log::error!("lane-soak: {} lane(s) failed", failures);
        ExitCode::FAILURE
    } else {
        log::info!("lane-soak: all lanes ordered and serialized");
        ExitCode::SUCCESS
    }
}
