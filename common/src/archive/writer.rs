//! Rotating archive writer
//!
//! Accumulates (content, metadata) entry pairs into one or more
//! independently valid container files. The rotation check runs once, before
//! either half of a pair is written, so a pair always lands in a single
//! physical file. Finalizing a full file (the trailing index flush can be
//! slow) happens on a blocking worker while new pairs already flow into the
//! next fragment; all finalizes are serialized through one shared lock so
//! two never interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::archive::{fragment_path, zip, ArchiveSettings, METADATA_SUFFIX};
use crate::document::Document;
use crate::endpoint::Writer;
use crate::metaxml;

struct WriterState {
    current: Option<zip::ZipFileWriter>,
    seq: u32,
    finalizers: Vec<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

/// Writer endpoint producing a rotated series of archive fragments.
pub struct ArchiveWriter {
    base: std::path::PathBuf,
    settings: ArchiveSettings,
    close_lock: Arc<tokio::sync::Mutex<()>>,
    state: tokio::sync::Mutex<WriterState>,
    closed: AtomicBool,
}

impl ArchiveWriter {
    pub fn new(
        base: impl Into<std::path::PathBuf>,
        settings: ArchiveSettings,
        close_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            base: base.into(),
            settings,
            close_lock,
            state: tokio::sync::Mutex::new(WriterState {
                current: None,
                seq: 0,
                finalizers: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Builds a pool of `count` writers bound to independent physical file
    /// series, sharing one close-serialization lock.
    pub fn pool(
        base: &std::path::Path,
        count: usize,
        settings: ArchiveSettings,
    ) -> Vec<Arc<ArchiveWriter>> {
        let close_lock = Arc::new(tokio::sync::Mutex::new(()));
        (0..count.max(1))
            .map(|member| {
                Arc::new(ArchiveWriter::new(
                    pool_base(base, member),
                    settings,
                    close_lock.clone(),
                ))
            })
            .collect()
    }

    async fn write_pair(&self, uri: &str, content: &[u8], meta_xml: &str) -> anyhow::Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("archive writer for {:?} is closed", self.base);
        }
        let meta_name = format!("{}{}", uri, METADATA_SUFFIX);
        let pending = zip::entry_cost(uri.len() as u64, content.len() as u64)
            + zip::entry_cost(meta_name.len() as u64, meta_xml.len() as u64);
        let mut state = self.state.lock().await;
        let rotate = state.current.as_ref().is_some_and(|writer| {
            writer.entry_count() + 2 > self.settings.max_entries
                || writer.projected_len() + pending > self.settings.max_bytes
        });
        if rotate {
            let full = state.current.take().unwrap();
            tracing::info!(
                "rotating archive {:?} at {} entries",
                full.path(),
                full.entry_count()
            );
            state.seq += 1;
            self.spawn_finalize(&mut state, full);
        }
        if state.current.is_none() {
            let path = fragment_path(&self.base, state.seq);
            state.current = Some(zip::ZipFileWriter::create(&path)?);
        }
        let writer = state.current.as_mut().unwrap();
        let mut bytes = writer
            .append(uri, content)
            .with_context(|| format!("writing content entry {:?}", uri))?;
        bytes += writer
            .append(&meta_name, meta_xml.as_bytes())
            .with_context(|| format!("writing metadata entry {:?}", meta_name))?;
        Ok(bytes)
    }

    fn spawn_finalize(&self, state: &mut WriterState, full: zip::ZipFileWriter) {
        let close_lock = self.close_lock.clone();
        let path = full.path().to_path_buf();
        state.finalizers.push(tokio::spawn(async move {
            let _serialize = close_lock.lock().await;
            tokio::task::spawn_blocking(move || full.finish())
                .await
                .with_context(|| format!("archive finalize task for {:?} died", path))??;
            Ok(())
        }));
    }
}

#[async_trait]
impl Writer for ArchiveWriter {
    async fn write_one(&self, uri: &str, doc: &Document) -> anyhow::Result<u64> {
        let meta_xml = metaxml::to_xml(&doc.metadata);
        self.write_pair(uri, &doc.content, &meta_xml).await
    }

    /// Finalizes the current fragment and waits for every outstanding
    /// finalize. Later calls are no-ops: each writer closes exactly once.
    async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if let Some(full) = state.current.take() {
            self.spawn_finalize(&mut state, full);
        }
        let finalizers = std::mem::take(&mut state.finalizers);
        drop(state);
        let mut first_error = None;
        for finalizer in finalizers {
            match finalizer.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::error!("archive finalize failed: {:#}", &error);
                    first_error.get_or_insert(error);
                }
                Err(join_error) => {
                    first_error.get_or_insert(anyhow::Error::new(join_error));
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Base path of pool member `member`; member 0 reuses the base itself.
pub fn pool_base(base: &std::path::Path, member: usize) -> std::path::PathBuf {
    if member == 0 {
        return base.to_path_buf();
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match base.extension() {
        Some(ext) => format!("{}-w{}.{}", stem, member, ext.to_string_lossy()),
        None => format!("{}-w{}", stem, member),
    };
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::find_fragments;
    use crate::document::{DocumentFormat, Metadata};
    use crate::testutils;
    use std::collections::BTreeSet;

    fn doc(content: &[u8]) -> Document {
        Document::new(
            content.to_vec(),
            Metadata::with_format(DocumentFormat::Text),
        )
    }

    fn single(base: &std::path::Path, settings: ArchiveSettings) -> ArchiveWriter {
        ArchiveWriter::new(base, settings, Arc::new(tokio::sync::Mutex::new(())))
    }

    #[tokio::test]
    async fn pair_lands_in_one_file() {
        let dir = testutils::create_temp_dir().unwrap();
        let base = dir.join("out.zip");
        let writer = single(&base, ArchiveSettings::default());
        writer.write_one("docs/a.txt", &doc(b"hello")).await.unwrap();
        writer.close().await.unwrap();
        let file = std::fs::File::open(&base).unwrap();
        let index = zip::read_index(&file, u16::MAX as u64).unwrap();
        let names: Vec<&str> = index.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs/a.txt", "docs/a.txt.metadata"]);
    }

    #[tokio::test]
    async fn rotation_splits_into_valid_fragments() {
        let dir = testutils::create_temp_dir().unwrap();
        let base = dir.join("out.zip");
        let settings = ArchiveSettings {
            // two documents (four entries) per fragment
            max_entries: 4,
            ..Default::default()
        };
        let writer = single(&base, settings);
        let uris: Vec<String> = (0..5).map(|i| format!("doc-{}.txt", i)).collect();
        for uri in &uris {
            writer.write_one(uri, &doc(uri.as_bytes())).await.unwrap();
        }
        writer.close().await.unwrap();
        let fragments = find_fragments(&base).unwrap();
        assert_eq!(fragments.len(), 3);
        // every fragment is independently valid; the combined listing is the
        // full input set with no duplicates
        let mut combined = BTreeSet::new();
        for fragment in &fragments {
            let file = std::fs::File::open(fragment).unwrap();
            let index = zip::read_index(&file, u16::MAX as u64).unwrap();
            assert!(index.entries.len() <= 4);
            // content and metadata twin stay together
            assert_eq!(index.entries.len() % 2, 0);
            for entry in &index.entries {
                if let Some(uri) = entry.name.strip_suffix(METADATA_SUFFIX) {
                    assert!(index.entries.iter().any(|e| e.name == uri));
                } else {
                    assert!(combined.insert(entry.name.clone()));
                }
            }
        }
        assert_eq!(combined, uris.iter().cloned().collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn size_margin_forces_rotation() {
        let dir = testutils::create_temp_dir().unwrap();
        let base = dir.join("out.zip");
        let settings = ArchiveSettings {
            max_bytes: 2_000,
            ..Default::default()
        };
        let writer = single(&base, settings);
        for i in 0..4 {
            let uri = format!("big-{}", i);
            writer.write_one(&uri, &doc(&[0u8; 700])).await.unwrap();
        }
        writer.close().await.unwrap();
        let fragments = find_fragments(&base).unwrap();
        assert!(fragments.len() > 1);
        for fragment in &fragments {
            assert!(std::fs::metadata(fragment).unwrap().len() <= 2_000);
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = testutils::create_temp_dir().unwrap();
        let base = dir.join("out.zip");
        let writer = single(&base, ArchiveSettings::default());
        writer.write_one("a", &doc(b"a")).await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(writer.write_one("b", &doc(b"b")).await.is_err());
    }

    #[test]
    fn pool_bases_are_distinct_series() {
        let base = std::path::Path::new("/out/docs.zip");
        assert_eq!(pool_base(base, 0), base);
        assert_eq!(pool_base(base, 2), std::path::Path::new("/out/docs-w2.zip"));
    }
}
