//! The top-level synchronization operation
//!
//! Wires the pipeline together and drives it to completion: lister ->
//! identifier queue -> worker pool -> monitor, then tears the stages down in
//! order (queue, pool, monitor, writers). The invariant underpinning
//! shutdown is strict: the number of tasks the producer enqueued equals the
//! number of completions the monitor observed, or the run is treated as
//! failed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tracing::instrument;

use crate::document::DocumentFormat;
use crate::endpoint::{Lister, Reader, Writer};
use crate::error::fatal;
use crate::factory::TaskFactory;
use crate::monitor::{Monitor, MonitorHandle};
use crate::pool::WorkerPool;
use crate::queue::UriQueue;
use crate::retry::RetryPolicy;
use crate::timer::Timer;
use crate::transform::{FormatFilter, OutputTransforms};
use crate::{monitor, pool, queue};

/// Error type for sync runs that preserves the partial summary on failure.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub batch_size: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Additional attempts after the first for each batch read/write.
    pub max_retries: u32,
    pub fail_early: bool,
    pub start_offset: u64,
    pub spill_threshold: usize,
    pub spill_dir: Option<std::path::PathBuf>,
    pub events_per_sec: f64,
    pub bytes_per_sec: f64,
    pub stall_timeout: Duration,
    pub progress_interval: Duration,
    pub retain_events: bool,
    pub transforms: OutputTransforms,
    pub exclude_formats: Vec<DocumentFormat>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            workers: 4,
            queue_capacity: 64,
            max_retries: 3,
            fail_early: false,
            start_offset: 0,
            spill_threshold: 0,
            spill_dir: None,
            events_per_sec: 0.0,
            bytes_per_sec: 0.0,
            stall_timeout: Duration::from_secs(15 * 60),
            progress_interval: Duration::from_secs(10),
            retain_events: false,
            transforms: OutputTransforms::default(),
            exclude_formats: Vec::new(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch size must be positive");
        }
        if self.workers == 0 {
            anyhow::bail!("worker count must be positive");
        }
        if self.events_per_sec > 0.0 && self.bytes_per_sec > 0.0 {
            anyhow::bail!("throttle caps are mutually exclusive: set events/sec or bytes/sec");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Summary {
    pub documents: u64,
    pub errors: u64,
    pub bytes: u64,
    pub tasks: u64,
    pub elapsed: Duration,
    pub docs_per_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99: Option<Duration>,
}

impl Summary {
    fn from_timer(timer: &Timer, tasks: u64) -> Self {
        Self {
            documents: timer.count(),
            errors: timer.errors(),
            bytes: timer.bytes(),
            tasks,
            elapsed: timer.elapsed(),
            docs_per_sec: timer.events_per_sec(),
            p50: timer.duration_percentile(50.0),
            p95: timer.duration_percentile(95.0),
            p99: timer.duration_percentile(99.0),
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "documents synced: {}\n\
            errors: {}\n\
            bytes copied: {}\n\
            tasks completed: {}\n\
            elapsed: {}\n\
            average rate: {:.2} docs/s",
            self.documents,
            self.errors,
            bytesize::ByteSize(self.bytes),
            self.tasks,
            humantime::format_duration(Duration::from_millis(self.elapsed.as_millis() as u64)),
            self.docs_per_sec,
        )?;
        if let (Some(p50), Some(p95), Some(p99)) = (self.p50, self.p95, self.p99) {
            write!(
                f,
                "\nlatency p50/p95/p99: {:?} / {:?} / {:?}",
                p50, p95, p99
            )?;
        }
        Ok(())
    }
}

struct Pipeline {
    factory: Arc<TaskFactory>,
    pool: Arc<WorkerPool>,
    queue: Arc<UriQueue>,
    monitor: MonitorHandle,
    monitor_join: tokio::task::JoinHandle<Timer>,
}

impl Pipeline {
    /// Tears the pipeline down in order and produces the final summary.
    async fn finish(self) -> (Summary, Option<anyhow::Error>) {
        self.pool.close();
        self.pool.join_all().await;
        self.monitor.stop();
        let timer = match self.monitor_join.await {
            Ok(timer) => timer,
            Err(join_error) => {
                tracing::error!("monitor died: {:#}", &join_error);
                Timer::new(false)
            }
        };
        let close_error = self.factory.close().await.err();
        let summary = Summary::from_timer(&timer, self.monitor.completed_tasks());
        (summary, close_error)
    }

    async fn abort(self, source: anyhow::Error) -> Error {
        self.queue.halt();
        let (summary, _) = self.finish().await;
        Error::new(source, summary)
    }
}

/// Copies every listed document from the reader to the writers.
#[instrument(skip_all)]
pub async fn sync(
    lister: Arc<dyn Lister>,
    reader: Arc<dyn Reader>,
    writers: Vec<Arc<dyn Writer>>,
    settings: &Settings,
) -> Result<Summary, Error> {
    settings
        .validate()
        .map_err(|err| Error::new(err, Summary::default()))?;
    let factory = Arc::new(
        TaskFactory::new(
            reader,
            writers,
            settings.transforms.clone(),
            FormatFilter::excluding(settings.exclude_formats.clone()),
            RetryPolicy::with_retries(settings.max_retries),
        )
        .map_err(|err| Error::new(err, Summary::default()))?,
    );
    if !settings.transforms.is_identity() {
        tracing::debug!(
            "output transforms: {}",
            serde_json::to_string(&settings.transforms).unwrap_or_default()
        );
    }
    let (pool, results) = WorkerPool::start(pool::Settings {
        workers: settings.workers,
        queue_capacity: settings.queue_capacity,
    });
    let queue = Arc::new(UriQueue::new(queue::Settings {
        batch_size: settings.batch_size,
        spill_threshold: settings.spill_threshold,
        spill_dir: settings.spill_dir.clone(),
        start_offset: settings.start_offset,
        poll_timeout: Duration::from_millis(100),
    }));
    let (monitor, monitor_join) = Monitor::spawn(
        results,
        pool.clone(),
        queue.clone(),
        monitor::Settings {
            poll_timeout: Duration::from_millis(500),
            stall_timeout: settings.stall_timeout,
            fail_early: settings.fail_early,
            events_per_sec: settings.events_per_sec,
            bytes_per_sec: settings.bytes_per_sec,
            progress_interval: settings.progress_interval,
            retain_events: settings.retain_events,
        },
    );
    let producer = tokio::spawn(queue.clone().run(pool.clone(), factory.clone()));
    let pipeline = Pipeline {
        factory,
        pool,
        queue: queue.clone(),
        monitor: monitor.clone(),
        monitor_join,
    };

    // the driver itself performs the listing; losing an identifier here
    // would silently break the task accounting, so any listing error is
    // fatal to the run
    let listed = lister.list(&queue).await;
    if let Err(error) = listed {
        // halt first: the producer may be parked on pool backpressure
        queue.halt();
        let _ = producer.await;
        return Err(pipeline.abort(error.context("listing identifiers failed")).await);
    }
    tracing::debug!(
        "listing complete: {} identifiers accepted, {} skipped",
        queue.added(),
        queue.skipped()
    );
    queue.shutdown();
    match producer.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            // a halt can surface here first as a failed submission; report
            // the halt reason rather than the secondary error
            let source = match monitor.halt_reason() {
                Some(reason) => anyhow!(reason),
                None => error.context("producer loop failed"),
            };
            return Err(pipeline.abort(source).await);
        }
        Err(join_error) => {
            return Err(pipeline
                .abort(anyhow!("producer loop died: {:#}", join_error))
                .await);
        }
    }
    if let Err(error) = monitor.set_expected(queue.submitted()) {
        return Err(pipeline.abort(error).await);
    }
    let clean = monitor.wait_complete().await;
    let submitted = queue.submitted();
    let completed = monitor.completed_tasks();
    let (summary, close_error) = pipeline.finish().await;
    if !clean {
        let reason = monitor
            .halt_reason()
            .unwrap_or_else(|| "pipeline halted".to_string());
        return Err(Error::new(anyhow!(reason), summary));
    }
    if completed != submitted {
        return Err(Error::new(
            fatal(format!(
                "task accounting mismatch: {} enqueued but {} completed",
                submitted, completed
            )),
            summary,
        ));
    }
    if let Some(error) = close_error {
        return Err(Error::new(error.context("closing endpoints"), summary));
    }
    tracing::info!("sync complete: {} documents", summary.documents);
    Ok(summary)
}
