//! Portable archive container: paired content/metadata entries with
//! rotation across physical files
//!
//! Per document the container holds two entries: `<identifier>` (raw bytes)
//! and `<identifier>.metadata` (UTF-8 XML record). The underlying zip-style
//! format caps entry counts at 16 bits and cumulative sizes at 32 bits, so
//! the writer rotates to a fresh physical file before either ceiling is
//! reached; a pair is never split across files.

pub mod reader;
pub mod writer;
pub mod zip;

pub use self::reader::{ArchiveFile, ArchiveLister, ArchiveReader};
pub use self::writer::ArchiveWriter;

/// Entry name suffix of the metadata twin.
pub const METADATA_SUFFIX: &str = ".metadata";

/// Rotation thresholds. Both are empirical safety margins kept below the
/// documented format ceilings (65,535 entries / 4 GiB), configurable rather
/// than hard-coded.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveSettings {
    /// Rotate before a file would exceed this many entries (two per
    /// document).
    pub max_entries: u64,
    /// Rotate before a file's projected size would exceed this many bytes.
    pub max_bytes: u64,
    /// Recorded entry counts at/above this value are not trusted on read;
    /// the reader scans entries sequentially instead.
    pub scan_boundary: u64,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            max_entries: 65_000,
            max_bytes: u32::MAX as u64 - (64 << 20),
            scan_boundary: u16::MAX as u64,
        }
    }
}

/// Path of fragment `seq` in a rotated series; sequence 0 reuses the base
/// name itself.
pub fn fragment_path(base: &std::path::Path, seq: u32) -> std::path::PathBuf {
    if seq == 0 {
        return base.to_path_buf();
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match base.extension() {
        Some(ext) => format!("{}-{:06}.{}", stem, seq, ext.to_string_lossy()),
        None => format!("{}-{:06}", stem, seq),
    };
    base.with_file_name(name)
}

/// Existing fragments of a rotated series, base first, in sequence order.
pub fn find_fragments(base: &std::path::Path) -> anyhow::Result<Vec<std::path::PathBuf>> {
    let mut fragments = Vec::new();
    if !base.exists() {
        anyhow::bail!("archive {:?} does not exist", base);
    }
    let mut seq = 0u32;
    loop {
        let path = fragment_path(base, seq);
        if !path.exists() {
            break;
        }
        fragments.push(path);
        seq += 1;
    }
    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_zero_reuses_base_name() {
        let base = std::path::Path::new("/out/docs.zip");
        assert_eq!(fragment_path(base, 0), base);
        assert_eq!(
            fragment_path(base, 1),
            std::path::Path::new("/out/docs-000001.zip")
        );
        assert_eq!(
            fragment_path(base, 123_456),
            std::path::Path::new("/out/docs-123456.zip")
        );
    }

    #[test]
    fn fragment_naming_without_extension() {
        let base = std::path::Path::new("/out/docs");
        assert_eq!(
            fragment_path(base, 2),
            std::path::Path::new("/out/docs-000002")
        );
    }

    #[test]
    fn default_margins_sit_below_format_ceilings() {
        let settings = ArchiveSettings::default();
        assert!(settings.max_entries < u16::MAX as u64);
        assert!(settings.max_bytes < u32::MAX as u64);
    }
}
