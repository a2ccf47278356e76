//! Minimal zip container codec used by the archive endpoints
//!
//! Entries are always stored (method 0): archive throughput is bounded by
//! the store and the disk, not by entry compression, and stored entries keep
//! the rotation size math exact. The writer produces a classic single-disk
//! container: local headers, a central directory, and the end-of-central-
//! directory record whose 16-bit entry count is the ceiling the rotating
//! writer works around.
//!
//! The reader trusts the central directory unless the recorded entry count
//! sits at or above the known-buggy boundary, in which case it falls back to
//! a sequential walk of the local headers.

use std::io::Write;
use std::os::unix::fs::FileExt;

use anyhow::{anyhow, bail, Context};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
pub const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
pub const EOCD_SIG: u32 = 0x0605_4b50;

pub const LOCAL_HEADER_LEN: u64 = 30;
pub const CENTRAL_HEADER_LEN: u64 = 46;
pub const EOCD_LEN: u64 = 22;

const VERSION: u16 = 20;
// general-purpose flag bit 11: names are UTF-8
const FLAG_UTF8: u16 = 0x0800;
// bit 3: sizes live in a trailing data descriptor (never written here)
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
const METHOD_STORED: u16 = 0;

/// Container bytes one `(name, data)` entry adds, headers included.
pub fn entry_cost(name_len: u64, data_len: u64) -> u64 {
    LOCAL_HEADER_LEN + CENTRAL_HEADER_LEN + 2 * name_len + data_len
}

struct PendingEntry {
    name: String,
    crc: u32,
    size: u32,
    offset: u32,
}

/// Append-only writer for one physical container file.
pub struct ZipFileWriter {
    path: std::path::PathBuf,
    file: std::io::BufWriter<std::fs::File>,
    entries: Vec<PendingEntry>,
    offset: u64,
    central_size: u64,
    dos_time: u16,
    dos_date: u16,
}

impl ZipFileWriter {
    pub fn create(path: &std::path::Path) -> anyhow::Result<Self> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed creating archive file {:?}", path))?;
        let (dos_time, dos_date) = dos_datetime();
        Ok(Self {
            path: path.to_path_buf(),
            file: std::io::BufWriter::new(file),
            entries: Vec::new(),
            offset: 0,
            central_size: 0,
            dos_time,
            dos_date,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Final container size if the file were closed right now.
    pub fn projected_len(&self) -> u64 {
        self.offset + self.central_size + EOCD_LEN
    }

    /// Appends a stored entry, returning the bytes added to the local
    /// section (headers included).
    pub fn append(&mut self, name: &str, data: &[u8]) -> anyhow::Result<u64> {
        let name_len = u16::try_from(name.len())
            .map_err(|_| anyhow!("entry name too long for container: {:?}", name))?;
        let size = u32::try_from(data.len())
            .map_err(|_| anyhow!("entry {:?} too large for container: {} bytes", name, data.len()))?;
        let offset = u32::try_from(self.offset)
            .map_err(|_| anyhow!("container offset overflow before entry {:?}", name))?;
        let crc = crc32fast::hash(data);
        self.file.write_u32::<LittleEndian>(LOCAL_HEADER_SIG)?;
        self.file.write_u16::<LittleEndian>(VERSION)?;
        self.file.write_u16::<LittleEndian>(FLAG_UTF8)?;
        self.file.write_u16::<LittleEndian>(METHOD_STORED)?;
        self.file.write_u16::<LittleEndian>(self.dos_time)?;
        self.file.write_u16::<LittleEndian>(self.dos_date)?;
        self.file.write_u32::<LittleEndian>(crc)?;
        self.file.write_u32::<LittleEndian>(size)?;
        self.file.write_u32::<LittleEndian>(size)?;
        self.file.write_u16::<LittleEndian>(name_len)?;
        self.file.write_u16::<LittleEndian>(0)?;
        self.file.write_all(name.as_bytes())?;
        self.file.write_all(data)?;
        self.entries.push(PendingEntry {
            name: name.to_string(),
            crc,
            size,
            offset,
        });
        let added = LOCAL_HEADER_LEN + name.len() as u64 + data.len() as u64;
        self.offset += added;
        self.central_size += CENTRAL_HEADER_LEN + name.len() as u64;
        Ok(added)
    }

    /// Writes the central directory and end record, then flushes.
    pub fn finish(mut self) -> anyhow::Result<()> {
        let count = u16::try_from(self.entries.len())
            .map_err(|_| anyhow!("entry count overflow in {:?}: rotation defect", self.path))?;
        let central_offset = u32::try_from(self.offset)
            .map_err(|_| anyhow!("container size overflow in {:?}: rotation defect", self.path))?;
        for entry in &self.entries {
            self.file.write_u32::<LittleEndian>(CENTRAL_HEADER_SIG)?;
            self.file.write_u16::<LittleEndian>(VERSION)?;
            self.file.write_u16::<LittleEndian>(VERSION)?;
            self.file.write_u16::<LittleEndian>(FLAG_UTF8)?;
            self.file.write_u16::<LittleEndian>(METHOD_STORED)?;
            self.file.write_u16::<LittleEndian>(self.dos_time)?;
            self.file.write_u16::<LittleEndian>(self.dos_date)?;
            self.file.write_u32::<LittleEndian>(entry.crc)?;
            self.file.write_u32::<LittleEndian>(entry.size)?;
            self.file.write_u32::<LittleEndian>(entry.size)?;
            self.file
                .write_u16::<LittleEndian>(entry.name.len() as u16)?;
            self.file.write_u16::<LittleEndian>(0)?; // extra
            self.file.write_u16::<LittleEndian>(0)?; // comment
            self.file.write_u16::<LittleEndian>(0)?; // disk start
            self.file.write_u16::<LittleEndian>(0)?; // internal attrs
            self.file.write_u32::<LittleEndian>(0)?; // external attrs
            self.file.write_u32::<LittleEndian>(entry.offset)?;
            self.file.write_all(entry.name.as_bytes())?;
        }
        let central_size = u32::try_from(self.central_size)
            .map_err(|_| anyhow!("central directory overflow in {:?}", self.path))?;
        self.file.write_u32::<LittleEndian>(EOCD_SIG)?;
        self.file.write_u16::<LittleEndian>(0)?; // this disk
        self.file.write_u16::<LittleEndian>(0)?; // central dir disk
        self.file.write_u16::<LittleEndian>(count)?;
        self.file.write_u16::<LittleEndian>(count)?;
        self.file.write_u32::<LittleEndian>(central_size)?;
        self.file.write_u32::<LittleEndian>(central_offset)?;
        self.file.write_u16::<LittleEndian>(0)?; // comment length
        self.file
            .flush()
            .with_context(|| format!("failed flushing archive {:?}", self.path))?;
        Ok(())
    }
}

/// One entry as located in a physical file.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub name: String,
    pub header_offset: u64,
    pub size: u64,
    pub crc: u32,
    pub method: u16,
}

/// Parsed view of a container's entries.
#[derive(Debug)]
pub struct ZipIndex {
    pub entries: Vec<ZipEntry>,
    /// True when the index came from a sequential scan rather than the
    /// central directory.
    pub scanned: bool,
}

/// Reads the entry index, falling back to a sequential local-header scan
/// when the recorded entry count is at/above `fallback_boundary`.
pub fn read_index(file: &std::fs::File, fallback_boundary: u64) -> anyhow::Result<ZipIndex> {
    let len = file.metadata()?.len();
    if len < EOCD_LEN {
        bail!("file too short to be an archive ({} bytes)", len);
    }
    let tail_len = len.min(EOCD_LEN + u16::MAX as u64);
    let mut tail = vec![0u8; tail_len as usize];
    file.read_exact_at(&mut tail, len - tail_len)?;
    let eocd_pos = find_eocd(&tail).ok_or_else(|| anyhow!("no end-of-central-directory record"))?;
    let eocd = &tail[eocd_pos..];
    let mut cursor = &eocd[10..];
    let total_entries = cursor.read_u16::<LittleEndian>()? as u64;
    let central_size = cursor.read_u32::<LittleEndian>()? as u64;
    let central_offset = cursor.read_u32::<LittleEndian>()? as u64;
    if total_entries >= fallback_boundary {
        tracing::warn!(
            "recorded entry count {} is at/above the unreliable boundary {}, scanning entries",
            total_entries,
            fallback_boundary
        );
        return scan_entries(file, len);
    }
    let mut central = vec![0u8; central_size as usize];
    file.read_exact_at(&mut central, central_offset)
        .context("reading central directory")?;
    let mut entries = Vec::with_capacity(total_entries as usize);
    let mut cursor = &central[..];
    for _ in 0..total_entries {
        let sig = cursor.read_u32::<LittleEndian>()?;
        if sig != CENTRAL_HEADER_SIG {
            bail!("bad central directory signature {:#010x}", sig);
        }
        let _version_made = cursor.read_u16::<LittleEndian>()?;
        let _version_needed = cursor.read_u16::<LittleEndian>()?;
        let _flags = cursor.read_u16::<LittleEndian>()?;
        let method = cursor.read_u16::<LittleEndian>()?;
        let _time = cursor.read_u16::<LittleEndian>()?;
        let _date = cursor.read_u16::<LittleEndian>()?;
        let crc = cursor.read_u32::<LittleEndian>()?;
        let comp_size = cursor.read_u32::<LittleEndian>()? as u64;
        let _uncomp_size = cursor.read_u32::<LittleEndian>()?;
        let name_len = cursor.read_u16::<LittleEndian>()? as usize;
        let extra_len = cursor.read_u16::<LittleEndian>()? as usize;
        let comment_len = cursor.read_u16::<LittleEndian>()? as usize;
        let _disk = cursor.read_u16::<LittleEndian>()?;
        let _internal = cursor.read_u16::<LittleEndian>()?;
        let _external = cursor.read_u32::<LittleEndian>()?;
        let header_offset = cursor.read_u32::<LittleEndian>()? as u64;
        if cursor.len() < name_len + extra_len + comment_len {
            bail!("truncated central directory entry");
        }
        let name = String::from_utf8(cursor[..name_len].to_vec())
            .context("entry name is not valid UTF-8")?;
        cursor = &cursor[name_len + extra_len + comment_len..];
        entries.push(ZipEntry {
            name,
            header_offset,
            size: comp_size,
            crc,
            method,
        });
    }
    Ok(ZipIndex {
        entries,
        scanned: false,
    })
}

/// Walks local headers from the start of the file, ignoring the index.
pub fn scan_entries(file: &std::fs::File, len: u64) -> anyhow::Result<ZipIndex> {
    let mut entries = Vec::new();
    let mut pos = 0u64;
    while pos + LOCAL_HEADER_LEN <= len {
        let mut header = [0u8; LOCAL_HEADER_LEN as usize];
        file.read_exact_at(&mut header, pos)?;
        let mut cursor = &header[..];
        let sig = cursor.read_u32::<LittleEndian>()?;
        if sig != LOCAL_HEADER_SIG {
            // first non-entry record is the central directory
            break;
        }
        let _version = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let method = cursor.read_u16::<LittleEndian>()?;
        let _time = cursor.read_u16::<LittleEndian>()?;
        let _date = cursor.read_u16::<LittleEndian>()?;
        let crc = cursor.read_u32::<LittleEndian>()?;
        let comp_size = cursor.read_u32::<LittleEndian>()? as u64;
        let _uncomp_size = cursor.read_u32::<LittleEndian>()?;
        let name_len = cursor.read_u16::<LittleEndian>()? as usize;
        let extra_len = cursor.read_u16::<LittleEndian>()? as usize;
        if flags & FLAG_DATA_DESCRIPTOR != 0 {
            bail!("cannot scan entries that use data descriptors");
        }
        let mut name = vec![0u8; name_len];
        file.read_exact_at(&mut name, pos + LOCAL_HEADER_LEN)?;
        let name = String::from_utf8(name).context("entry name is not valid UTF-8")?;
        entries.push(ZipEntry {
            name,
            header_offset: pos,
            size: comp_size,
            crc,
            method,
        });
        pos += LOCAL_HEADER_LEN + name_len as u64 + extra_len as u64 + comp_size;
    }
    Ok(ZipIndex {
        entries,
        scanned: true,
    })
}

/// Reads and verifies one entry's bytes.
pub fn read_entry(file: &std::fs::File, entry: &ZipEntry) -> anyhow::Result<Vec<u8>> {
    if entry.method != METHOD_STORED {
        bail!(
            "unsupported compression method {} for entry {:?}",
            entry.method,
            entry.name
        );
    }
    let mut header = [0u8; LOCAL_HEADER_LEN as usize];
    file.read_exact_at(&mut header, entry.header_offset)
        .with_context(|| format!("reading local header of {:?}", entry.name))?;
    let mut cursor = &header[..];
    let sig = cursor.read_u32::<LittleEndian>()?;
    if sig != LOCAL_HEADER_SIG {
        bail!("bad local header signature for entry {:?}", entry.name);
    }
    let name_len = u64::from(u16::from_le_bytes([header[26], header[27]]));
    let extra_len = u64::from(u16::from_le_bytes([header[28], header[29]]));
    let data_offset = entry.header_offset + LOCAL_HEADER_LEN + name_len + extra_len;
    let mut data = vec![0u8; entry.size as usize];
    file.read_exact_at(&mut data, data_offset)
        .with_context(|| format!("reading entry {:?}", entry.name))?;
    let crc = crc32fast::hash(&data);
    if crc != entry.crc {
        bail!(
            "checksum mismatch in entry {:?}: recorded {:08x}, computed {:08x}",
            entry.name,
            entry.crc,
            crc
        );
    }
    Ok(data)
}

fn find_eocd(tail: &[u8]) -> Option<usize> {
    let sig = EOCD_SIG.to_le_bytes();
    (0..=tail.len().saturating_sub(EOCD_LEN as usize))
        .rev()
        .find(|&pos| tail[pos..pos + 4] == sig)
}

fn dos_datetime() -> (u16, u16) {
    use chrono::{Datelike, Timelike};
    let now = chrono::Local::now();
    let year = now.year().clamp(1980, 2107) as u16;
    let date = ((year - 1980) << 9) | ((now.month() as u16) << 5) | now.day() as u16;
    let time =
        ((now.hour() as u16) << 11) | ((now.minute() as u16) << 5) | (now.second() as u16 / 2);
    (time, date)
}
