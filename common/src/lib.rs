//! Bulk document synchronization engine - `dcp` core library
//!
//! This crate implements the concurrent pipeline behind the `dcp` tool:
//! bulk-copying documents (content plus structured metadata) between a
//! remote document store, a filesystem tree and a portable archive
//! container, for migration, backup/restore and replication of datasets
//! that may span millions of documents.
//!
//! # Architecture
//!
//! ```text
//! Lister ──▶ UriQueue ──▶ WorkerPool ──▶ Monitor
//!            (batches)    (SyncTasks)    (stats, throttle, halt)
//!                │             │
//!                ▼             ▼
//!           TaskFactory   Reader ─▶ transforms/filters ─▶ Writer
//! ```
//!
//! - [`queue::UriQueue`] decouples listing rate from consumption rate,
//!   batching identifiers and optionally spilling to a side file.
//! - [`pool::WorkerPool`] is a fixed-size pool with a bounded backing
//!   queue; full-queue submission blocks the producer (backpressure).
//! - [`task::SyncTask`] reads one batch, transforms and filters output
//!   identifiers, writes the survivors and emits one timing event per slot.
//! - [`monitor::Monitor`] aggregates completions, throttles throughput,
//!   detects stalls and is the sole continue-vs-halt decision point.
//! - [`archive`] implements the zip-style container of paired
//!   content/metadata entries, with rotation below the format's 16-bit
//!   entry-count and 32-bit size ceilings and reference-counted reads.
//!
//! The store wire protocol is out of scope: store endpoints plug in through
//! the [`endpoint`] traits exactly like the bundled filesystem and archive
//! endpoints.

pub mod archive;
pub mod config;
pub mod document;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod fstree;
pub mod metaxml;
pub mod monitor;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod sync;
pub mod task;
pub mod timer;
pub mod transform;

#[cfg(test)]
pub(crate) mod testutils;

pub use crate::config::{OutputConfig, RuntimeConfig};
pub use crate::document::{Document, DocumentBatch, DocumentFormat, Metadata, Permission};
pub use crate::endpoint::{Lister, Reader, Writer};
pub use crate::sync::{sync, Settings as SyncSettings, Summary};
pub use crate::transform::OutputTransforms;

/// Bootstraps tracing and the tokio runtime, runs the operation and prints
/// the summary. Returns `None` when the operation failed (the caller maps
/// this to a non-zero exit status).
pub fn run<Fut, Out>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Out>
where
    Fut: std::future::Future<Output = Result<Out, sync::Error>>,
    Out: std::fmt::Display,
{
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.filter_directive()));
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", error);
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(error) => {
            eprintln!("failed to build tokio runtime: {}", error);
            return None;
        }
    };
    match rt.block_on(func()) {
        Ok(result) => {
            if output.print_summary {
                println!("{}", &result);
            }
            Some(result)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", &error);
                if output.print_summary {
                    println!("{}", &error.summary);
                }
            }
            None
        }
    }
}
