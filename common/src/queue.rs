//! Identifier queue decoupling listing rate from consumption rate
//!
//! The external lister pushes identifiers in; the run loop batches them and
//! submits sync tasks. Pending identifiers live in a mutex-guarded deque
//! that optionally spills to a side file once it grows past a threshold, so
//! listings of millions of documents never hold the whole set in memory.

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;

use crate::factory::TaskFactory;
use crate::pool::WorkerPool;

#[derive(Debug, Clone)]
pub struct Settings {
    pub batch_size: usize,
    /// Pending identifiers beyond this count spill to a side file; 0 keeps
    /// everything in memory.
    pub spill_threshold: usize,
    /// Directory for the spill file, the system temp dir by default.
    pub spill_dir: Option<std::path::PathBuf>,
    /// Resume offset: identifiers skipped (uncounted) before batching
    /// starts.
    pub start_offset: u64,
    /// Bound on each pull wait so shutdown and halt are observed promptly.
    pub poll_timeout: std::time::Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            spill_threshold: 0,
            spill_dir: None,
            start_offset: 0,
            poll_timeout: std::time::Duration::from_millis(100),
        }
    }
}

struct SpillFile {
    path: std::path::PathBuf,
    writer: std::io::BufWriter<std::fs::File>,
    reader: std::io::BufReader<std::fs::File>,
    queued: u64,
    dirty: bool,
}

impl SpillFile {
    fn create(dir: &std::path::Path) -> anyhow::Result<Self> {
        let path = dir.join(format!("dcp-spill-{:016x}.uris", rand::random::<u64>()));
        let write_half = std::fs::OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed creating spill file {:?}", path))?;
        let read_half = std::fs::File::open(&path)?;
        tracing::info!("identifier queue spilling to {:?}", path);
        Ok(Self {
            path,
            writer: std::io::BufWriter::new(write_half),
            reader: std::io::BufReader::new(read_half),
            queued: 0,
            dirty: false,
        })
    }

    fn push(&mut self, uri: &str) -> anyhow::Result<()> {
        if uri.contains('\n') {
            anyhow::bail!("identifier {:?} cannot be spilled (embedded newline)", uri);
        }
        writeln!(self.writer, "{}", uri)?;
        self.queued += 1;
        self.dirty = true;
        Ok(())
    }

    fn pop(&mut self) -> anyhow::Result<Option<String>> {
        if self.queued == 0 {
            return Ok(None);
        }
        if self.dirty {
            self.writer.flush()?;
            self.dirty = false;
        }
        let mut line = String::new();
        let read = self.reader.read_line(&mut line)?;
        if read == 0 {
            return Err(crate::error::fatal(format!(
                "spill file {:?} lost queued identifiers",
                self.path
            )));
        }
        self.queued -= 1;
        Ok(Some(line.trim_end_matches('\n').to_string()))
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed removing spill file {:?}: {}", self.path, error);
        }
    }
}

struct Pending {
    buf: VecDeque<String>,
    spill: Option<SpillFile>,
    to_skip: u64,
}

pub struct UriQueue {
    settings: Settings,
    state: std::sync::Mutex<Pending>,
    notify: tokio::sync::Notify,
    live: AtomicBool,
    halted: AtomicBool,
    added: AtomicU64,
    skipped: AtomicU64,
    submitted: AtomicU64,
    pool: std::sync::OnceLock<Arc<WorkerPool>>,
}

impl UriQueue {
    pub fn new(settings: Settings) -> Self {
        let to_skip = settings.start_offset;
        Self {
            settings,
            state: std::sync::Mutex::new(Pending {
                buf: VecDeque::new(),
                spill: None,
                to_skip,
            }),
            notify: tokio::sync::Notify::new(),
            live: AtomicBool::new(true),
            halted: AtomicBool::new(false),
            added: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            pool: std::sync::OnceLock::new(),
        }
    }

    /// Appends one identifier. Safe for concurrent callers; the resume
    /// offset consumes identifiers before any are accepted.
    pub fn add(&self, uri: String) -> anyhow::Result<()> {
        if self.halted.load(Ordering::Acquire) {
            anyhow::bail!("identifier queue is halted");
        }
        {
            let mut pending = self.state.lock().unwrap();
            if pending.to_skip > 0 {
                pending.to_skip -= 1;
                self.skipped.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
            let threshold = self.settings.spill_threshold;
            if pending.spill.is_some() || (threshold > 0 && pending.buf.len() >= threshold) {
                if pending.spill.is_none() {
                    let dir = self
                        .settings
                        .spill_dir
                        .clone()
                        .unwrap_or_else(std::env::temp_dir);
                    pending.spill = Some(SpillFile::create(&dir)?);
                }
                // spill is the tail from here on, preserving FIFO order
                pending.spill.as_mut().unwrap().push(&uri)?;
            } else {
                pending.buf.push_back(uri);
            }
        }
        self.added.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
        Ok(())
    }

    /// Identifiers accepted so far (resume-offset skips excluded).
    pub fn added(&self) -> u64 {
        self.added.load(Ordering::Acquire)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Acquire)
    }

    /// Tasks successfully handed to the worker pool.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Marks the source as exhausted; the run loop drains what is buffered,
    /// pads and submits the final partial batch, then exits.
    pub fn shutdown(&self) {
        self.live.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Hard stop on fatal error: pending work is discarded, the run loop is
    /// interrupted and the worker pool is force-shut.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        {
            let mut pending = self.state.lock().unwrap();
            pending.buf.clear();
            pending.spill = None;
        }
        self.notify.notify_waiters();
        if let Some(pool) = self.pool.get() {
            pool.force_shutdown();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn try_pop(&self) -> anyhow::Result<Option<String>> {
        let mut pending = self.state.lock().unwrap();
        if let Some(uri) = pending.buf.pop_front() {
            return Ok(Some(uri));
        }
        match &mut pending.spill {
            Some(spill) => spill.pop(),
            None => Ok(None),
        }
    }

    /// Producer loop: pull with a bounded timeout, fill fixed-size batches,
    /// submit each full batch as one task.
    pub async fn run(
        self: Arc<Self>,
        pool: Arc<WorkerPool>,
        factory: Arc<TaskFactory>,
    ) -> anyhow::Result<()> {
        let _ = self.pool.set(pool.clone());
        let batch_size = self.settings.batch_size.max(1);
        let mut batch: Vec<Option<String>> = Vec::with_capacity(batch_size);
        loop {
            if self.halted.load(Ordering::Acquire) {
                tracing::debug!("identifier queue halted, discarding partial batch");
                return Ok(());
            }
            match self.try_pop()? {
                Some(uri) => {
                    batch.push(Some(uri));
                    if batch.len() == batch_size {
                        self.submit_batch(&pool, &factory, &mut batch).await?;
                    }
                }
                None => {
                    if !self.live.load(Ordering::Acquire) {
                        if !batch.is_empty() {
                            batch.resize(batch_size, None);
                            self.submit_batch(&pool, &factory, &mut batch).await?;
                        }
                        tracing::debug!(
                            "identifier queue drained after {} tasks",
                            self.submitted()
                        );
                        return Ok(());
                    }
                    let _ = tokio::time::timeout(self.settings.poll_timeout, self.notify.notified())
                        .await;
                }
            }
        }
    }

    async fn submit_batch(
        &self,
        pool: &WorkerPool,
        factory: &TaskFactory,
        batch: &mut Vec<Option<String>>,
    ) -> anyhow::Result<()> {
        let uris = std::mem::replace(batch, Vec::with_capacity(self.settings.batch_size));
        let task = factory.make_task(uris);
        // this send blocks while the pool's backing queue is full: the
        // system's sole backpressure mechanism
        pool.submit(task).await.context("submitting sync task")?;
        self.submitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn drain_pending(&self) -> Vec<String> {
        let mut drained = Vec::new();
        while let Ok(Some(uri)) = self.try_pop() {
            drained.push(uri);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(settings: Settings) -> UriQueue {
        UriQueue::new(settings)
    }

    #[test]
    fn preserves_fifo_order_in_memory() {
        let queue = queue_with(Settings::default());
        for i in 0..5 {
            queue.add(format!("uri-{}", i)).unwrap();
        }
        assert_eq!(queue.added(), 5);
        let drained = queue.drain_pending();
        assert_eq!(drained, (0..5).map(|i| format!("uri-{}", i)).collect::<Vec<_>>());
    }

    #[test]
    fn start_offset_skips_uncounted() {
        let queue = queue_with(Settings {
            start_offset: 3,
            ..Default::default()
        });
        for i in 0..5 {
            queue.add(format!("uri-{}", i)).unwrap();
        }
        assert_eq!(queue.skipped(), 3);
        assert_eq!(queue.added(), 2);
        assert_eq!(queue.drain_pending(), vec!["uri-3", "uri-4"]);
    }

    #[test]
    fn spills_past_the_threshold_and_keeps_order() {
        let queue = queue_with(Settings {
            spill_threshold: 3,
            ..Default::default()
        });
        for i in 0..10 {
            queue.add(format!("uri-{}", i)).unwrap();
        }
        {
            let pending = queue.state.lock().unwrap();
            assert_eq!(pending.buf.len(), 3);
            let spill = pending.spill.as_ref().expect("spill must engage");
            assert_eq!(spill.queued, 7);
        }
        let drained = queue.drain_pending();
        assert_eq!(
            drained,
            (0..10).map(|i| format!("uri-{}", i)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn spill_file_is_removed_on_drop() {
        let spill_path = {
            let queue = queue_with(Settings {
                spill_threshold: 1,
                ..Default::default()
            });
            queue.add("a".to_string()).unwrap();
            queue.add("b".to_string()).unwrap();
            queue
                .state
                .lock()
                .unwrap()
                .spill
                .as_ref()
                .unwrap()
                .path
                .clone()
        };
        assert!(!spill_path.exists());
    }

    #[test]
    fn newline_identifiers_cannot_spill() {
        let queue = queue_with(Settings {
            spill_threshold: 1,
            ..Default::default()
        });
        queue.add("ok".to_string()).unwrap();
        assert!(queue.add("bad\nuri".to_string()).is_err());
    }

    #[test]
    fn add_after_halt_is_rejected() {
        let queue = queue_with(Settings::default());
        queue.add("a".to_string()).unwrap();
        queue.halt();
        assert!(queue.add("b".to_string()).is_err());
        assert!(queue.drain_pending().is_empty());
    }
}
