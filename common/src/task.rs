//! One unit of synchronization work
//!
//! A task owns one null-padded batch: read every non-null slot through the
//! reader, transform and filter the output identifiers, persist the
//! survivors through the writer, and emit one timing event per originally
//! non-null slot. Reads and writes retry on transient failure with the
//! shared policy; an exhausted retry becomes a batch failure carrying the
//! full batch for diagnosis.

use std::sync::Arc;

use anyhow::Context;

use crate::document::DocumentBatch;
use crate::endpoint::{Reader, Writer};
use crate::error::is_fatal;
use crate::retry::RetryPolicy;
use crate::timer::TimedEvent;
use crate::transform::{FormatFilter, OutputTransforms};

/// Failure of one whole batch, carried to the monitor for the
/// continue-vs-halt decision.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct BatchFailure {
    #[source]
    pub source: anyhow::Error,
    /// The full failing batch, for diagnosis.
    pub batch: Vec<Option<String>>,
    /// Fatal failures halt the pipeline regardless of the error policy.
    pub fatal: bool,
}

/// What the monitor receives for every completed task.
#[derive(Debug)]
pub struct TaskOutcome {
    /// One finalized event per originally non-null slot.
    pub events: Vec<TimedEvent>,
    pub failure: Option<BatchFailure>,
}

pub struct SyncTask {
    batch: DocumentBatch,
    reader: Arc<dyn Reader>,
    writer: Arc<dyn Writer>,
    transforms: Arc<OutputTransforms>,
    filter: Arc<FormatFilter>,
    retry: RetryPolicy,
}

impl SyncTask {
    pub fn new(
        batch: DocumentBatch,
        reader: Arc<dyn Reader>,
        writer: Arc<dyn Writer>,
        transforms: Arc<OutputTransforms>,
        filter: Arc<FormatFilter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            batch,
            reader,
            writer,
            transforms,
            filter,
            retry,
        }
    }

    /// Runs the task to completion. Never panics across the channel
    /// boundary: all failure modes fold into the outcome.
    pub async fn run(mut self) -> TaskOutcome {
        let mut events: Vec<Option<TimedEvent>> = self
            .batch
            .uris()
            .iter()
            .map(|uri| uri.as_ref().map(TimedEvent::begin))
            .collect();
        let result = Self::execute(
            &mut self.batch,
            self.reader.as_ref(),
            self.writer.as_ref(),
            &self.transforms,
            &self.filter,
            &self.retry,
        )
        .await;
        match result {
            Ok(bytes) => {
                // all bytes of the batched write attach to the first slot's
                // event; the aggregate is exact, per-slot attribution is not
                if let Some(first) = events.iter_mut().find_map(Option::as_mut) {
                    first.add_bytes(bytes);
                }
                TaskOutcome {
                    events: events.into_iter().flatten().map(TimedEvent::finish).collect(),
                    failure: None,
                }
            }
            Err(source) => {
                let fatal = is_fatal(&source);
                TaskOutcome {
                    events: events
                        .into_iter()
                        .flatten()
                        .map(TimedEvent::finish_error)
                        .collect(),
                    failure: Some(BatchFailure {
                        source,
                        batch: self.batch.uris().to_vec(),
                        fatal,
                    }),
                }
            }
        }
    }

    async fn execute(
        batch: &mut DocumentBatch,
        reader: &dyn Reader,
        writer: &dyn Writer,
        transforms: &OutputTransforms,
        filter: &FormatFilter,
        retry: &RetryPolicy,
    ) -> anyhow::Result<u64> {
        // read with retry; the reader re-acquires any connection per attempt
        let mut failed_attempts = 0;
        loop {
            match reader.read(batch).await {
                Ok(()) => break,
                Err(error) => {
                    failed_attempts += 1;
                    let Some(delay) = retry.next_delay(failed_attempts) else {
                        return Err(error)
                            .with_context(|| format!("batch read failed after {} attempts", failed_attempts));
                    };
                    tracing::warn!(
                        "batch read attempt {} failed, retrying in {:?}: {:#}",
                        failed_attempts,
                        delay,
                        &error
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        let slots: Vec<usize> = batch.occupied().collect();
        for slot in slots {
            let uri = batch.uri(slot).unwrap();
            let format = batch
                .document(slot)
                .map(|doc| doc.metadata.format)
                .context("reader left a non-null slot unpopulated")?;
            if filter.excludes(format) {
                tracing::debug!("skipping {:?}: format {} is excluded", uri, format);
                batch.drop_from_output(slot);
                continue;
            }
            let output = transforms.apply(uri);
            batch.set_output(slot, output);
        }
        // write with the same retry discipline
        let mut failed_attempts = 0;
        loop {
            match writer.write(batch).await {
                Ok(bytes) => return Ok(bytes),
                Err(error) => {
                    failed_attempts += 1;
                    let Some(delay) = retry.next_delay(failed_attempts) else {
                        return Err(error)
                            .with_context(|| format!("batch write failed after {} attempts", failed_attempts));
                    };
                    tracing::warn!(
                        "batch write attempt {} failed, retrying in {:?}: {:#}",
                        failed_attempts,
                        delay,
                        &error
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
