//! Builds sync tasks and owns the writer pool
//!
//! Every task gets the shared reader and one writer. When output targets an
//! archive, the factory owns a small fixed pool of writers bound to
//! independent physical files and round-robins tasks across them to reduce
//! lock contention; for single-file targets the pool degenerates to one
//! writer. On shutdown each owned writer closes exactly once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;

use crate::document::DocumentBatch;
use crate::endpoint::{Reader, Writer};
use crate::retry::RetryPolicy;
use crate::task::SyncTask;
use crate::transform::{FormatFilter, OutputTransforms};

pub struct TaskFactory {
    reader: Arc<dyn Reader>,
    writers: Vec<Arc<dyn Writer>>,
    next_writer: AtomicUsize,
    transforms: Arc<OutputTransforms>,
    filter: Arc<FormatFilter>,
    retry: RetryPolicy,
    closed: AtomicBool,
}

impl TaskFactory {
    pub fn new(
        reader: Arc<dyn Reader>,
        writers: Vec<Arc<dyn Writer>>,
        transforms: OutputTransforms,
        filter: FormatFilter,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        if writers.is_empty() {
            anyhow::bail!("task factory needs at least one writer");
        }
        Ok(Self {
            reader,
            writers,
            next_writer: AtomicUsize::new(0),
            transforms: Arc::new(transforms),
            filter: Arc::new(filter),
            retry,
            closed: AtomicBool::new(false),
        })
    }

    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }

    /// Builds the task for one null-padded identifier batch.
    pub fn make_task(&self, uris: Vec<Option<String>>) -> SyncTask {
        let writer =
            self.writers[self.next_writer.fetch_add(1, Ordering::Relaxed) % self.writers.len()].clone();
        SyncTask::new(
            DocumentBatch::new(uris),
            self.reader.clone(),
            writer,
            self.transforms.clone(),
            self.filter.clone(),
            self.retry,
        )
    }

    /// Closes the reader and every owned writer exactly once.
    pub async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_error = None;
        if let Err(error) = self.reader.close().await.context("closing reader") {
            first_error.get_or_insert(error);
        }
        let closes = self.writers.iter().map(|writer| writer.close());
        for result in futures::future::join_all(closes).await {
            if let Err(error) = result.context("closing writer") {
                tracing::error!("writer close failed: {:#}", &error);
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{self, MemStore};

    fn factory_with_writers(count: usize) -> (TaskFactory, Vec<Arc<MemStore>>) {
        let reader = testutils::seeded_store(&[("a", b"a")]);
        let writers: Vec<Arc<MemStore>> = (0..count).map(|_| Arc::new(MemStore::new())).collect();
        let factory = TaskFactory::new(
            reader,
            writers.iter().map(|w| w.clone() as Arc<dyn Writer>).collect(),
            OutputTransforms::default(),
            FormatFilter::default(),
            RetryPolicy::with_retries(0),
        )
        .unwrap();
        (factory, writers)
    }

    #[tokio::test]
    async fn round_robins_across_the_writer_pool() {
        let (factory, writers) = factory_with_writers(3);
        for _ in 0..6 {
            let task = factory.make_task(vec![Some("a".to_string())]);
            let outcome = task.run().await;
            assert!(outcome.failure.is_none());
        }
        for writer in &writers {
            assert_eq!(writer.writes(), 2);
        }
    }

    #[tokio::test]
    async fn close_closes_writers_exactly_once() {
        let (factory, writers) = factory_with_writers(2);
        factory.close().await.unwrap();
        factory.close().await.unwrap();
        for writer in &writers {
            assert_eq!(writer.closes(), 1);
        }
    }

    #[test]
    fn rejects_an_empty_writer_pool() {
        let reader = testutils::seeded_store(&[]);
        assert!(
            TaskFactory::new(
                reader,
                Vec::new(),
                OutputTransforms::default(),
                FormatFilter::default(),
                RetryPolicy::default(),
            )
            .is_err()
        );
    }
}
