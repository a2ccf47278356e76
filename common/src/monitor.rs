//! Completion monitor: aggregation, throttling, stall detection, halt
//!
//! One dedicated aggregator drains the completion channel so statistics keep
//! flowing while the worker pool is saturated. It is the single
//! continue-vs-halt decision point: batch failures consult the error policy,
//! fatal-tagged failures always halt. Throttling compares the cumulative
//! events/sec or bytes/sec (whichever is configured, never both) against the
//! cap and sleeps just long enough for the trailing average to converge back
//! under it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use throttle::RateGate;
use tokio::sync::mpsc;

use crate::error::fatal;
use crate::pool::WorkerPool;
use crate::queue::UriQueue;
use crate::task::TaskOutcome;
use crate::timer::Timer;

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Bound on each completion poll so shutdown is observed promptly.
    pub poll_timeout: Duration,
    /// No completion within this window means the pipeline is stuck.
    pub stall_timeout: Duration,
    /// Halt on the first batch failure instead of counting and continuing.
    pub fail_early: bool,
    /// Events/sec cap, 0 disables. Mutually exclusive with `bytes_per_sec`.
    pub events_per_sec: f64,
    /// Bytes/sec cap, 0 disables.
    pub bytes_per_sec: f64,
    pub progress_interval: Duration,
    /// Keep individual events for percentile reporting.
    pub retain_events: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            stall_timeout: Duration::from_secs(15 * 60),
            fail_early: false,
            events_per_sec: 0.0,
            bytes_per_sec: 0.0,
            progress_interval: Duration::from_secs(10),
            retain_events: false,
        }
    }
}

struct Shared {
    running: AtomicBool,
    halted: AtomicBool,
    completed_tasks: AtomicU64,
    events: AtomicU64,
    errors: AtomicU64,
    bytes: AtomicU64,
    expected_tasks: std::sync::Mutex<Option<u64>>,
    halt_reason: std::sync::Mutex<Option<String>>,
}

/// Counter view shared between the monitor task and the driver wait loop.
#[derive(Clone)]
pub struct MonitorHandle {
    shared: Arc<Shared>,
}

impl MonitorHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(true),
                halted: AtomicBool::new(false),
                completed_tasks: AtomicU64::new(0),
                events: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
                expected_tasks: std::sync::Mutex::new(None),
                halt_reason: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Sets the expected task count, exactly once. Re-setting it or setting
    /// it below the already-completed count is a broken accounting invariant
    /// and therefore fatal.
    pub fn set_expected(&self, tasks: u64) -> anyhow::Result<()> {
        let mut expected = self.shared.expected_tasks.lock().unwrap();
        if let Some(existing) = *expected {
            return Err(fatal(format!(
                "expected task count set twice ({} then {})",
                existing, tasks
            )));
        }
        let completed = self.completed_tasks();
        if tasks < completed {
            return Err(fatal(format!(
                "expected task count {} is below the live completed count {}",
                tasks, completed
            )));
        }
        *expected = Some(tasks);
        Ok(())
    }

    pub fn expected(&self) -> Option<u64> {
        *self.shared.expected_tasks.lock().unwrap()
    }

    pub fn completed_tasks(&self) -> u64 {
        self.shared.completed_tasks.load(Ordering::Acquire)
    }

    pub fn events(&self) -> u64 {
        self.shared.events.load(Ordering::Acquire)
    }

    pub fn errors(&self) -> u64 {
        self.shared.errors.load(Ordering::Acquire)
    }

    pub fn bytes(&self) -> u64 {
        self.shared.bytes.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::Acquire)
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.shared.halt_reason.lock().unwrap().clone()
    }

    /// Tells the monitor the run is over; it exits once the pool terminates.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    /// Driver wait loop: blocks until every expected task completed or the
    /// pipeline halted. Returns true on clean completion.
    pub async fn wait_complete(&self) -> bool {
        loop {
            if self.is_halted() {
                return false;
            }
            if let Some(expected) = self.expected() {
                if self.completed_tasks() >= expected {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn record_halt(&self, reason: String) {
        self.shared
            .halt_reason
            .lock()
            .unwrap()
            .get_or_insert(reason);
        self.shared.halted.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn force_completed_for_test(&self, tasks: u64) {
        self.shared.completed_tasks.store(tasks, Ordering::Release);
    }
}

pub struct Monitor {
    results: mpsc::Receiver<TaskOutcome>,
    handle: MonitorHandle,
    pool: Arc<WorkerPool>,
    queue: Arc<UriQueue>,
    settings: Settings,
}

impl Monitor {
    /// Spawns the aggregator; the join handle yields the final timer.
    pub fn spawn(
        results: mpsc::Receiver<TaskOutcome>,
        pool: Arc<WorkerPool>,
        queue: Arc<UriQueue>,
        settings: Settings,
    ) -> (MonitorHandle, tokio::task::JoinHandle<Timer>) {
        let handle = MonitorHandle::new();
        let monitor = Monitor {
            results,
            handle: handle.clone(),
            pool,
            queue,
            settings,
        };
        (handle, tokio::spawn(monitor.run()))
    }

    async fn run(mut self) -> Timer {
        let mut timer = Timer::new(self.settings.retain_events);
        let event_gate = RateGate::per_sec(self.settings.events_per_sec);
        let byte_gate = RateGate::per_sec(self.settings.bytes_per_sec);
        let mut last_completion = std::time::Instant::now();
        let mut last_progress = std::time::Instant::now();
        loop {
            // throttle between completions; recomputed from cumulative
            // counters so the average converges instead of oscillating
            if let Some(gate) = &event_gate {
                gate.pace(timer.count(), timer.elapsed()).await;
            } else if let Some(gate) = &byte_gate {
                gate.pace(timer.bytes(), timer.elapsed()).await;
            }
            let polled =
                tokio::time::timeout(self.settings.poll_timeout, self.results.recv()).await;
            match polled {
                Ok(Some(outcome)) => {
                    last_completion = std::time::Instant::now();
                    self.fold(&mut timer, outcome);
                    if last_progress.elapsed() >= self.settings.progress_interval {
                        last_progress = std::time::Instant::now();
                        self.report_progress(&timer);
                    }
                    if self.handle.is_halted() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("completion channel closed, monitor exiting");
                    break;
                }
                Err(_) => {
                    let outstanding =
                        self.queue.submitted() > self.handle.completed_tasks();
                    if outstanding && last_completion.elapsed() >= self.settings.stall_timeout {
                        self.halt_pipeline(format!(
                            "no task completed within {}",
                            humantime::format_duration(self.settings.stall_timeout)
                        ));
                        break;
                    }
                    if !self.shared_running() && self.pool.is_terminated() {
                        break;
                    }
                }
            }
        }
        // the pool is always force-shut on exit, normal or fatal, so the
        // process can terminate
        self.pool.force_shutdown();
        self.report_progress(&timer);
        timer
    }

    fn shared_running(&self) -> bool {
        self.handle.shared.running.load(Ordering::Acquire)
    }

    fn fold(&self, timer: &mut Timer, outcome: TaskOutcome) {
        for event in outcome.events {
            self.handle.shared.events.fetch_add(1, Ordering::AcqRel);
            if event.is_error() {
                self.handle.shared.errors.fetch_add(1, Ordering::AcqRel);
            }
            self.handle
                .shared
                .bytes
                .fetch_add(event.bytes(), Ordering::AcqRel);
            timer.record(event);
        }
        self.handle
            .shared
            .completed_tasks
            .fetch_add(1, Ordering::AcqRel);
        if let Some(failure) = outcome.failure {
            let offending: Vec<&str> = failure
                .batch
                .iter()
                .flatten()
                .map(String::as_str)
                .take(3)
                .collect();
            tracing::error!(
                "batch failed (first identifiers {:?}): {:#}",
                offending,
                &failure.source
            );
            if failure.fatal {
                self.halt_pipeline(format!("fatal error: {:#}", failure.source));
            } else if self.settings.fail_early {
                self.halt_pipeline(format!("failing early: {:#}", failure.source));
            }
        }
    }

    fn halt_pipeline(&self, reason: String) {
        tracing::error!("halting pipeline: {}", reason);
        self.handle.record_halt(reason);
        // queue halt also force-shuts the worker pool
        self.queue.halt();
        self.pool.force_shutdown();
    }

    fn report_progress(&self, timer: &Timer) {
        tracing::info!(
            "progress: {} documents, {} errors, {} total, {:.2} docs/s, {}/s",
            timer.count(),
            timer.errors(),
            bytesize::ByteSize(timer.bytes()),
            timer.events_per_sec(),
            bytesize::ByteSize(timer.bytes_per_sec() as u64)
        );
    }
}
