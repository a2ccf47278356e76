//! Reference-counted archive reading
//!
//! Presents a flat `{identifier -> content, identifier -> metadata}` view
//! over one physical file. Concurrent readers acquire before use and release
//! after; the underlying handle opens on the first acquire and closes only
//! when the count returns to zero. A release without a matching acquire is a
//! fatal invariant violation. Entry reads go through positioned reads on a
//! shared handle, so distinct entry streams never contend beyond the
//! reference-count mutex itself.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::archive::{zip, METADATA_SUFFIX};
use crate::document::{Document, DocumentBatch};
use crate::endpoint::{Lister, Reader};
use crate::error::fatal;
use crate::metaxml;
use crate::queue::UriQueue;

struct OpenArchive {
    file: std::fs::File,
    entries: HashMap<String, zip::ZipEntry>,
    order: Vec<String>,
}

struct ArchiveState {
    refs: u64,
    open: Option<Arc<OpenArchive>>,
}

/// One physical archive file with reference-counted lifetime.
pub struct ArchiveFile {
    path: std::path::PathBuf,
    scan_boundary: u64,
    state: std::sync::Mutex<ArchiveState>,
}

impl ArchiveFile {
    pub fn new(path: impl Into<std::path::PathBuf>, scan_boundary: u64) -> Self {
        Self {
            path: path.into(),
            scan_boundary,
            state: std::sync::Mutex::new(ArchiveState {
                refs: 0,
                open: None,
            }),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Registers a reader; opens the file and parses the index on 0 -> 1.
    pub fn acquire(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.open.is_none() {
            let file = std::fs::File::open(&self.path)
                .with_context(|| format!("failed opening archive {:?}", self.path))?;
            let index = zip::read_index(&file, self.scan_boundary)
                .with_context(|| format!("failed indexing archive {:?}", self.path))?;
            let mut entries = HashMap::with_capacity(index.entries.len());
            let mut order = Vec::with_capacity(index.entries.len());
            for entry in index.entries {
                order.push(entry.name.clone());
                entries.insert(entry.name.clone(), entry);
            }
            state.open = Some(Arc::new(OpenArchive {
                file,
                entries,
                order,
            }));
        }
        state.refs += 1;
        Ok(())
    }

    /// Deregisters a reader; closes the file on 1 -> 0. Over-release is a
    /// fatal signal.
    pub fn release(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.refs == 0 {
            return Err(fatal(format!(
                "archive {:?} released without a matching acquire",
                self.path
            )));
        }
        state.refs -= 1;
        if state.refs == 0 {
            state.open = None;
        }
        Ok(())
    }

    pub fn refs(&self) -> u64 {
        self.state.lock().unwrap().refs
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open.is_some()
    }

    fn snapshot(&self) -> anyhow::Result<Arc<OpenArchive>> {
        let state = self.state.lock().unwrap();
        state.open.clone().ok_or_else(|| {
            fatal(format!(
                "archive {:?} accessed without an acquired reference",
                self.path
            ))
        })
    }

    /// True when the archive holds an entry with this exact name.
    pub fn contains(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.snapshot()?.entries.contains_key(name))
    }

    /// Bytes of one entry, `None` when absent.
    pub fn read_entry(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let open = self.snapshot()?;
        match open.entries.get(name) {
            Some(entry) => Ok(Some(zip::read_entry(&open.file, entry)?)),
            None => Ok(None),
        }
    }

    /// De-duplicated logical identifiers: metadata-twin suffixes stripped,
    /// zero-length directory-like entries skipped.
    pub fn list(&self) -> anyhow::Result<Vec<String>> {
        let open = self.snapshot()?;
        let mut seen = std::collections::BTreeSet::new();
        let mut uris = Vec::new();
        for name in &open.order {
            let entry = &open.entries[name];
            if entry.size == 0 && name.ends_with('/') {
                continue;
            }
            let uri = name.strip_suffix(METADATA_SUFFIX).unwrap_or(name);
            if seen.insert(uri.to_string()) {
                uris.push(uri.to_string());
            }
        }
        Ok(uris)
    }
}

/// Reader endpoint over one or more archive fragments.
pub struct ArchiveReader {
    archives: Vec<Arc<ArchiveFile>>,
    verify_checksums: bool,
}

impl ArchiveReader {
    pub fn new(archives: Vec<Arc<ArchiveFile>>) -> Self {
        Self {
            archives,
            verify_checksums: false,
        }
    }

    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    fn read_document(&self, uri: &str) -> anyhow::Result<Document> {
        for archive in &self.archives {
            let Some(content) = archive.read_entry(uri)? else {
                continue;
            };
            let meta_name = format!("{}{}", uri, METADATA_SUFFIX);
            let metadata = match archive.read_entry(&meta_name)? {
                Some(bytes) => {
                    let xml = String::from_utf8(bytes)
                        .with_context(|| format!("metadata entry {:?} is not UTF-8", meta_name))?;
                    metaxml::from_xml(&xml)
                        .with_context(|| format!("parsing metadata entry {:?}", meta_name))?
                }
                None => anyhow::bail!(
                    "archive {:?} has no metadata twin for {:?}",
                    archive.path(),
                    uri
                ),
            };
            let doc = Document::new(content, metadata);
            if self.verify_checksums {
                if let Some(recorded) = &doc.metadata.checksum {
                    let computed = doc.content_checksum();
                    if *recorded != computed {
                        anyhow::bail!(
                            "checksum mismatch for {:?}: recorded {}, computed {}",
                            uri,
                            recorded,
                            computed
                        );
                    }
                }
            }
            return Ok(doc);
        }
        anyhow::bail!("document {:?} not found in any archive fragment", uri)
    }
}

#[async_trait]
impl Reader for ArchiveReader {
    async fn read(&self, batch: &mut DocumentBatch) -> anyhow::Result<()> {
        let mut acquired = 0;
        for archive in &self.archives {
            if let Err(error) = archive.acquire() {
                for prior in &self.archives[..acquired] {
                    prior.release()?;
                }
                return Err(error);
            }
            acquired += 1;
        }
        let result: anyhow::Result<()> = (|| {
            let slots: Vec<usize> = batch.occupied().collect();
            for slot in slots {
                let uri = batch.uri(slot).unwrap().to_string();
                let doc = self.read_document(&uri)?;
                batch.set_document(slot, doc);
            }
            Ok(())
        })();
        for archive in &self.archives {
            archive.release()?;
        }
        result
    }
}

/// Lister over the fragments of one logical archive.
pub struct ArchiveLister {
    archives: Vec<Arc<ArchiveFile>>,
}

impl ArchiveLister {
    pub fn new(archives: Vec<Arc<ArchiveFile>>) -> Self {
        Self { archives }
    }
}

#[async_trait]
impl Lister for ArchiveLister {
    async fn list(&self, queue: &UriQueue) -> anyhow::Result<u64> {
        let mut count = 0;
        for archive in &self.archives {
            archive.acquire()?;
            let listed = archive.list();
            let released = archive.release();
            for uri in listed? {
                queue.add(uri)?;
                count += 1;
            }
            released?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::writer::ArchiveWriter;
    use crate::archive::ArchiveSettings;
    use crate::document::{DocumentFormat, Metadata};
    use crate::endpoint::Writer;
    use crate::error::is_fatal;
    use crate::testutils;

    async fn sample_archive(dir: &std::path::Path) -> std::path::PathBuf {
        let base = dir.join("sample.zip");
        let writer = ArchiveWriter::new(
            &base,
            ArchiveSettings::default(),
            Arc::new(tokio::sync::Mutex::new(())),
        );
        let mut metadata = Metadata::with_format(DocumentFormat::Text);
        metadata.collections.insert("fixtures".to_string());
        writer
            .write_one("a.txt", &Document::new(b"alpha".to_vec(), metadata.clone()))
            .await
            .unwrap();
        writer
            .write_one("b.txt", &Document::new(b"beta".to_vec(), metadata))
            .await
            .unwrap();
        writer.close().await.unwrap();
        base
    }

    #[tokio::test]
    async fn list_strips_twins_and_deduplicates() {
        let dir = testutils::create_temp_dir().unwrap();
        let base = sample_archive(&dir).await;
        let archive = ArchiveFile::new(&base, u16::MAX as u64);
        archive.acquire().unwrap();
        assert_eq!(archive.list().unwrap(), vec!["a.txt", "b.txt"]);
        archive.release().unwrap();
    }

    #[tokio::test]
    async fn list_skips_directory_entries() {
        let dir = testutils::create_temp_dir().unwrap();
        let base = dir.join("dirs.zip");
        let mut writer = zip::ZipFileWriter::create(&base).unwrap();
        writer.append("docs/", b"").unwrap();
        writer.append("docs/a", b"a").unwrap();
        writer.finish().unwrap();
        let archive = ArchiveFile::new(&base, u16::MAX as u64);
        archive.acquire().unwrap();
        assert_eq!(archive.list().unwrap(), vec!["docs/a"]);
        archive.release().unwrap();
    }

    #[tokio::test]
    async fn refcount_closes_exactly_once() {
        let dir = testutils::create_temp_dir().unwrap();
        let base = sample_archive(&dir).await;
        let archive = Arc::new(ArchiveFile::new(&base, u16::MAX as u64));
        let concurrency = 8;
        let mut joined = Vec::new();
        for worker in 0..concurrency {
            let archive = archive.clone();
            joined.push(std::thread::spawn(move || {
                archive.acquire().unwrap();
                let uri = if worker % 2 == 0 { "a.txt" } else { "b.txt" };
                let content = archive.read_entry(uri).unwrap().unwrap();
                assert!(!content.is_empty());
                assert!(archive.is_open());
                archive.release().unwrap();
            }));
        }
        for handle in joined {
            handle.join().unwrap();
        }
        assert_eq!(archive.refs(), 0);
        assert!(!archive.is_open());
    }

    #[tokio::test]
    async fn over_release_is_fatal() {
        let dir = testutils::create_temp_dir().unwrap();
        let base = sample_archive(&dir).await;
        let archive = ArchiveFile::new(&base, u16::MAX as u64);
        archive.acquire().unwrap();
        archive.release().unwrap();
        let err = archive.release().unwrap_err();
        assert!(is_fatal(&err));
    }

    #[tokio::test]
    async fn reader_round_trips_documents() {
        let dir = testutils::create_temp_dir().unwrap();
        let base = sample_archive(&dir).await;
        let reader = ArchiveReader::new(vec![Arc::new(ArchiveFile::new(&base, u16::MAX as u64))]);
        let mut batch = DocumentBatch::new(vec![Some("a.txt".to_string()), None]);
        reader.read(&mut batch).await.unwrap();
        let doc = batch.document(0).unwrap();
        assert_eq!(doc.content, b"alpha");
        assert!(doc.metadata.collections.contains("fixtures"));
        // the null slot stays untouched
        assert!(batch.document(1).is_none());
    }

    #[tokio::test]
    async fn missing_document_is_an_error() {
        let dir = testutils::create_temp_dir().unwrap();
        let base = sample_archive(&dir).await;
        let reader = ArchiveReader::new(vec![Arc::new(ArchiveFile::new(&base, u16::MAX as u64))]);
        let mut batch = DocumentBatch::new(vec![Some("missing.txt".to_string())]);
        assert!(reader.read(&mut batch).await.is_err());
    }

    #[tokio::test]
    async fn checksum_verification_detects_mismatch() {
        let dir = testutils::create_temp_dir().unwrap();
        let base = dir.join("sums.zip");
        let writer = ArchiveWriter::new(
            &base,
            ArchiveSettings::default(),
            Arc::new(tokio::sync::Mutex::new(())),
        );
        let mut metadata = Metadata::with_format(DocumentFormat::Text);
        metadata.checksum = Some("00000000".to_string());
        writer
            .write_one("x", &Document::new(b"payload".to_vec(), metadata))
            .await
            .unwrap();
        writer.close().await.unwrap();
        let reader = ArchiveReader::new(vec![Arc::new(ArchiveFile::new(&base, u16::MAX as u64))])
            .with_checksum_verification(true);
        let mut batch = DocumentBatch::new(vec![Some("x".to_string())]);
        let err = reader.read(&mut batch).await.unwrap_err();
        assert!(format!("{:#}", err).contains("checksum mismatch"));
    }
}
