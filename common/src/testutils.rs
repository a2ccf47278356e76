use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::document::{Document, DocumentBatch, DocumentFormat, Metadata};
use crate::endpoint::{Lister, Reader, Writer};
use crate::queue::UriQueue;

pub fn create_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("dcp_test{}", &idx));
        if let Err(error) = std::fs::create_dir(&tmp_dir) {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

/// In-memory document store standing in for the remote-store collaborator.
#[derive(Default)]
pub struct MemStore {
    docs: std::sync::Mutex<BTreeMap<String, Document>>,
    writes: AtomicU64,
    closes: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uri: &str, content: &[u8]) {
        let metadata = Metadata::with_format(DocumentFormat::from_identifier(uri));
        self.docs
            .lock()
            .unwrap()
            .insert(uri.to_string(), Document::new(content.to_vec(), metadata));
    }

    pub fn insert_document(&self, uri: &str, doc: Document) {
        self.docs.lock().unwrap().insert(uri.to_string(), doc);
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.docs.lock().unwrap().contains_key(uri)
    }

    pub fn get(&self, uri: &str) -> Option<Document> {
        self.docs.lock().unwrap().get(uri).cloned()
    }

    pub fn uris(&self) -> Vec<String> {
        self.docs.lock().unwrap().keys().cloned().collect()
    }

    /// Documents written through the Writer contract.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Lister for MemStore {
    async fn list(&self, queue: &UriQueue) -> anyhow::Result<u64> {
        let uris = self.uris();
        for uri in &uris {
            queue.add(uri.clone())?;
        }
        Ok(uris.len() as u64)
    }
}

#[async_trait]
impl Reader for MemStore {
    async fn read(&self, batch: &mut DocumentBatch) -> anyhow::Result<()> {
        let slots: Vec<usize> = batch.occupied().collect();
        for slot in slots {
            let uri = batch.uri(slot).unwrap().to_string();
            let doc = self
                .get(&uri)
                .ok_or_else(|| anyhow::anyhow!("document {:?} not found", uri))?;
            batch.set_document(slot, doc);
        }
        Ok(())
    }
}

#[async_trait]
impl Writer for MemStore {
    async fn write_one(&self, uri: &str, doc: &Document) -> anyhow::Result<u64> {
        self.insert_document(uri, doc.clone());
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(doc.content.len() as u64)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

pub fn seeded_store(docs: &[(&str, &[u8])]) -> Arc<MemStore> {
    let store = MemStore::new();
    for (uri, content) in docs {
        store.insert(uri, content);
    }
    Arc::new(store)
}

/// Wraps a reader, failing the first `failures` read calls with a transient
/// error.
pub struct FlakyReader {
    inner: Arc<dyn Reader>,
    remaining: AtomicU32,
}

impl FlakyReader {
    pub fn new(inner: Arc<dyn Reader>, failures: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Reader for FlakyReader {
    async fn read(&self, batch: &mut DocumentBatch) -> anyhow::Result<()> {
        let remaining = self.remaining.load(Ordering::Acquire);
        if remaining > 0 {
            self.remaining.store(remaining - 1, Ordering::Release);
            anyhow::bail!("simulated connection reset");
        }
        self.inner.read(batch).await
    }
}

/// Always fails, optionally with a fatal-tagged error.
pub struct FailingReader {
    pub fatal: bool,
}

#[async_trait]
impl Reader for FailingReader {
    async fn read(&self, _batch: &mut DocumentBatch) -> anyhow::Result<()> {
        if self.fatal {
            Err(crate::error::fatal("simulated invariant violation"))
        } else {
            anyhow::bail!("simulated permanent read failure")
        }
    }
}
