//! Reader/Writer/Lister contracts between the engine and its endpoints
//!
//! The engine never knows what sits behind a batch: a remote document store,
//! a filesystem tree or an archive container. Concrete endpoints implement
//! these traits; the store wire protocol itself lives outside this workspace
//! and plugs in through the same seam.

use async_trait::async_trait;

use crate::document::{Document, DocumentBatch};
use crate::queue::UriQueue;

/// Produces the stream of identifiers to synchronize.
#[async_trait]
pub trait Lister: Send + Sync {
    /// Pushes every identifier into the queue, returning how many were
    /// offered (before any resume-offset skipping). A listing error is fatal
    /// to the whole run: a lost identifier would break the task accounting
    /// invariant.
    async fn list(&self, queue: &UriQueue) -> anyhow::Result<u64>;
}

/// Populates one batch of documents.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Fills content and metadata for every non-null slot, leaving null
    /// slots untouched. Must be safe to call again on the same batch after a
    /// transient failure: any stateful connection is opened and released
    /// within the call, never carried across attempts.
    async fn read(&self, batch: &mut DocumentBatch) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Persists one batch of documents.
///
/// Implementations may provide only the single-document form and inherit the
/// batched loop, or override [`Writer::write`] with a true multi-document
/// transaction.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write_one(&self, uri: &str, doc: &Document) -> anyhow::Result<u64>;

    /// Persists every surviving slot, returning total bytes written.
    async fn write(&self, batch: &DocumentBatch) -> anyhow::Result<u64> {
        let mut bytes = 0;
        for (_, uri, doc) in batch.writable() {
            bytes += self.write_one(uri, doc).await?;
        }
        Ok(bytes)
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
