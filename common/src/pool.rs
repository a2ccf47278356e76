//! Fixed-size worker pool with bounded submission
//!
//! Workers drain one shared bounded task channel; submission awaits channel
//! capacity, which is the system's sole backpressure mechanism: a slow
//! downstream store stalls the producer instead of growing the queue.
//! Completed outcomes surface on a bounded results channel in completion
//! order, not submission order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use crate::task::{SyncTask, TaskOutcome};

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Worker task count, sized for I/O concurrency against the store.
    pub workers: usize,
    /// Backing queue capacity; submission blocks when full.
    pub queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
        }
    }
}

pub struct WorkerPool {
    task_tx: std::sync::Mutex<Option<mpsc::Sender<SyncTask>>>,
    join: tokio::sync::Mutex<tokio::task::JoinSet<()>>,
    terminated: AtomicBool,
}

impl WorkerPool {
    /// Spawns the workers and returns the pool plus the completion stream
    /// read by the monitor.
    pub fn start(settings: Settings) -> (Arc<Self>, mpsc::Receiver<TaskOutcome>) {
        let workers = settings.workers.max(1);
        let capacity = settings.queue_capacity.max(1);
        let (task_tx, task_rx) = mpsc::channel::<SyncTask>(capacity);
        let (result_tx, result_rx) = mpsc::channel::<TaskOutcome>(capacity);
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let mut join = tokio::task::JoinSet::new();
        for worker in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            join.spawn(async move {
                tracing::debug!("worker {} started", worker);
                loop {
                    let task = { task_rx.lock().await.recv().await };
                    let Some(task) = task else {
                        break;
                    };
                    let outcome = task.run().await;
                    if result_tx.send(outcome).await.is_err() {
                        // monitor is gone; nothing left to report to
                        break;
                    }
                }
                tracing::debug!("worker {} exiting", worker);
            });
        }
        let pool = Arc::new(Self {
            task_tx: std::sync::Mutex::new(Some(task_tx)),
            join: tokio::sync::Mutex::new(join),
            terminated: AtomicBool::new(false),
        });
        (pool, result_rx)
    }

    /// Submits one task, waiting for queue capacity (backpressure).
    pub async fn submit(&self, task: SyncTask) -> anyhow::Result<()> {
        let sender = self
            .task_tx
            .lock()
            .unwrap()
            .clone()
            .context("worker pool is no longer accepting tasks")?;
        sender
            .send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker pool shut down while submitting"))?;
        Ok(())
    }

    /// Stops accepting tasks; workers exit once the queue drains.
    pub fn close(&self) {
        self.task_tx.lock().unwrap().take();
    }

    /// Waits for every worker to exit.
    pub async fn join_all(&self) {
        let mut join = self.join.lock().await;
        while let Some(result) = join.join_next().await {
            if let Err(error) = result {
                if error.is_panic() {
                    tracing::error!("worker panicked: {:#}", &error);
                } else {
                    tracing::debug!("worker cancelled");
                }
            }
        }
        self.terminated.store(true, Ordering::Release);
    }

    /// Hard stop: abort in-flight workers and refuse further submissions.
    /// Dispatched-but-unstarted tasks are discarded.
    pub fn force_shutdown(&self) {
        self.close();
        if let Ok(mut join) = self.join.try_lock() {
            join.abort_all();
        }
        self.terminated.store(true, Ordering::Release);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}
