//! Filesystem tree endpoints
//!
//! A filesystem source/target maps identifiers to `/`-separated paths
//! relative to a root directory. The tree carries no native metadata record:
//! the reader fills in defaults (format inferred from the extension), and
//! the writer materializes content only.

use async_recursion::async_recursion;
use async_trait::async_trait;

use anyhow::Context;

use crate::document::{Document, DocumentBatch, DocumentFormat, Metadata};
use crate::endpoint::{Lister, Reader, Writer};
use crate::queue::UriQueue;

/// Maps an identifier to a path under `root`, rejecting traversal outside.
fn resolve(root: &std::path::Path, uri: &str) -> anyhow::Result<std::path::PathBuf> {
    let relative = uri.trim_start_matches('/');
    let path = std::path::Path::new(relative);
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        anyhow::bail!("identifier {:?} escapes the filesystem root", uri);
    }
    Ok(root.join(path))
}

/// Lists every regular file under a root directory.
pub struct FsLister {
    root: std::path::PathBuf,
}

impl FsLister {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[async_recursion]
    async fn walk(
        &self,
        dir: &std::path::Path,
        queue: &UriQueue,
        count: &mut u64,
    ) -> anyhow::Result<()> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("cannot open directory {:?} for listing", dir))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", dir))?
        {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                self.walk(&path, queue, count).await?;
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(&self.root)
                    .expect("walked path must sit under the root");
                let uri = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                queue.add(uri)?;
                *count += 1;
            }
            // sockets, fifos and symlinks are not documents
        }
        Ok(())
    }
}

#[async_trait]
impl Lister for FsLister {
    async fn list(&self, queue: &UriQueue) -> anyhow::Result<u64> {
        let mut count = 0;
        self.walk(&self.root, queue, &mut count).await?;
        Ok(count)
    }
}

/// Reads documents from a tree, filling default metadata.
pub struct FsReader {
    root: std::path::PathBuf,
    generate_checksums: bool,
}

impl FsReader {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            root: root.into(),
            generate_checksums: false,
        }
    }

    pub fn with_checksum_generation(mut self, generate: bool) -> Self {
        self.generate_checksums = generate;
        self
    }
}

#[async_trait]
impl Reader for FsReader {
    async fn read(&self, batch: &mut DocumentBatch) -> anyhow::Result<()> {
        let slots: Vec<usize> = batch.occupied().collect();
        for slot in slots {
            let uri = batch.uri(slot).unwrap().to_string();
            let path = resolve(&self.root, &uri)?;
            let content = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed reading {:?}", path))?;
            let metadata = Metadata::with_format(DocumentFormat::from_identifier(&uri));
            let mut doc = Document::new(content, metadata);
            if self.generate_checksums {
                doc.metadata.checksum = Some(doc.content_checksum());
            }
            batch.set_document(slot, doc);
        }
        Ok(())
    }
}

/// Materializes document content under a root directory.
pub struct FsWriter {
    root: std::path::PathBuf,
}

impl FsWriter {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Writer for FsWriter {
    async fn write_one(&self, uri: &str, doc: &Document) -> anyhow::Result<u64> {
        let path = resolve(&self.root, uri)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {:?}", parent))?;
        }
        tokio::fs::write(&path, &doc.content)
            .await
            .with_context(|| format!("failed writing {:?}", path))?;
        Ok(doc.content.len() as u64)
    }
}
