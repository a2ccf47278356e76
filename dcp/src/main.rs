use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use common::archive::{self, ArchiveFile, ArchiveLister, ArchiveReader, ArchiveSettings, ArchiveWriter};
use common::fstree::{FsLister, FsReader, FsWriter};
use common::sync::{Error, Settings, Summary};
use common::{Lister, Reader, Writer};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dcp",
    version,
    about = "Bulk-copy documents between stores, filesystem trees and portable archives",
    long_about = "`dcp` bulk-copies documents (content + structured metadata) between a
filesystem tree and a portable archive container, for migration, backup/restore
and replication of large datasets.

Endpoints are paths, optionally prefixed with a scheme:
    fs:/data/docs           a filesystem tree (the default for plain paths)
    archive:/backups/d.zip  an archive container (also inferred from .zip)

Archives pair every document with a metadata twin entry and split across
multiple physical files before the container format's entry-count and size
ceilings; `dcp` reads such fragmented archives back transparently.

EXIT CODES:
    0 - Completed
    1 - Halted on error
    2 - Invalid usage

EXAMPLES:
    # Back a tree up into an archive, with a final summary
    dcp /data/docs archive:/backups/docs.zip --summary

    # Restore it elsewhere, verifying checksums
    dcp archive:/backups/docs.zip /restore/docs --checksums --progress-interval 5s

    # Replicate under a new identifier prefix, capped at 500 docs/s
    dcp /data/docs /mirror/docs --strip-prefix staging/ --output-prefix live/ --events-throttle 500"
)]
struct Args {
    // Sync options
    /// Number of documents processed per task
    #[arg(long, default_value = "100", value_name = "N", help_heading = "Sync options")]
    batch_size: usize,

    /// Concurrent sync workers (sized for I/O concurrency, not CPU count)
    #[arg(long, default_value = "4", value_name = "N", help_heading = "Sync options")]
    threads: usize,

    /// Task queue capacity; submission blocks when full
    #[arg(long, default_value = "128", value_name = "N", help_heading = "Sync options")]
    queue_size: usize,

    /// Retries per batch read/write on transient failure
    #[arg(long, default_value = "3", value_name = "N", help_heading = "Sync options")]
    max_retries: u32,

    /// Halt the whole run on the first batch failure
    #[arg(short = 'e', long = "fail-early", help_heading = "Sync options")]
    fail_early: bool,

    /// Resume offset: skip this many identifiers from the start of the listing
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Sync options")]
    start_position: u64,

    /// Spill pending identifiers to a side file past this count (0 = never)
    #[arg(
        long,
        default_value = "1000000",
        value_name = "N",
        help_heading = "Sync options"
    )]
    spill_threshold: usize,

    /// Exclude documents of a format from the output: xml, text or binary
    #[arg(long, value_name = "FORMAT", help_heading = "Sync options")]
    exclude_format: Vec<String>,

    /// Generate content checksums on import, verify them on archive reads
    #[arg(long, help_heading = "Sync options")]
    checksums: bool,

    // Output identifier transforms
    /// Strip this prefix from every output identifier
    #[arg(long, value_name = "PREFIX", help_heading = "Output identifier transforms")]
    strip_prefix: Option<String>,

    /// Strip this suffix from every output identifier
    #[arg(long, value_name = "SUFFIX", help_heading = "Output identifier transforms")]
    strip_suffix: Option<String>,

    /// Prepend this prefix to every output identifier
    #[arg(long, value_name = "PREFIX", help_heading = "Output identifier transforms")]
    output_prefix: Option<String>,

    /// Append this suffix to every output identifier
    #[arg(long, value_name = "SUFFIX", help_heading = "Output identifier transforms")]
    output_suffix: Option<String>,

    /// Prepend a random tag to every output identifier
    #[arg(long, help_heading = "Output identifier transforms")]
    randomize_uris: bool,

    /// Percent-encode output identifiers
    #[arg(long, help_heading = "Output identifier transforms")]
    encode_uris: bool,

    // Performance & throttling
    /// Cap throughput at N synchronized documents per second (0 = no cap)
    ///
    /// Mutually exclusive with --bytes-throttle.
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    events_throttle: f64,

    /// Cap throughput at SIZE bytes per second, e.g. "64MiB" (mutually
    /// exclusive with --events-throttle)
    #[arg(long, value_name = "SIZE", help_heading = "Performance & throttling")]
    bytes_throttle: Option<String>,

    /// Treat the pipeline as stuck when no task completes for this long
    ///
    /// This option accepts a human readable duration, e.g. "90s", "15min".
    #[arg(
        long,
        default_value = "15min",
        value_name = "DURATION",
        help_heading = "Performance & throttling"
    )]
    stall_timeout: String,

    // Archive options
    /// Independent archive writers when output targets an archive
    #[arg(long, default_value = "1", value_name = "N", help_heading = "Archive options")]
    archive_writers: usize,

    /// Rotate an archive file before it reaches this many entries
    /// (two per document)
    #[arg(
        long,
        default_value = "65000",
        value_name = "N",
        help_heading = "Archive options"
    )]
    archive_max_entries: u64,

    /// Rotate an archive file before it reaches this size, e.g. "4000MiB"
    #[arg(long, value_name = "SIZE", help_heading = "Archive options")]
    archive_max_bytes: Option<String>,

    // Progress & output
    /// Sets the delay between progress log lines
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s".
    #[arg(
        long,
        default_value = "10s",
        value_name = "DELAY",
        help_heading = "Progress & output"
    )]
    progress_interval: String,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Keep per-document timings and report latency percentiles
    /// (implies --summary)
    #[arg(long, help_heading = "Progress & output")]
    detailed_summary: bool,

    // Advanced settings
    /// Number of runtime worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source: filesystem tree or archive
    #[arg()]
    src: String,

    /// Destination: filesystem tree or archive
    #[arg()]
    dst: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Fs(std::path::PathBuf),
    Archive(std::path::PathBuf),
}

fn parse_endpoint(raw: &str) -> anyhow::Result<Endpoint> {
    if let Some(path) = raw.strip_prefix("fs:") {
        return Ok(Endpoint::Fs(path.into()));
    }
    if let Some(path) = raw.strip_prefix("archive:") {
        return Ok(Endpoint::Archive(path.into()));
    }
    if raw.contains(':') && !raw.starts_with('/') && !raw.starts_with('.') {
        anyhow::bail!(
            "unknown endpoint scheme in {:?}; use fs:PATH or archive:PATH",
            raw
        );
    }
    if raw.ends_with(".zip") {
        return Ok(Endpoint::Archive(raw.into()));
    }
    Ok(Endpoint::Fs(raw.into()))
}

/// All physical files of a (possibly fragmented, possibly pooled) archive.
fn collect_archive_files(
    base: &std::path::Path,
    settings: ArchiveSettings,
) -> anyhow::Result<Vec<Arc<ArchiveFile>>> {
    let mut paths = archive::find_fragments(base)?;
    let mut member = 1;
    loop {
        let pool_base = archive::writer::pool_base(base, member);
        if !pool_base.exists() {
            break;
        }
        paths.extend(archive::find_fragments(&pool_base)?);
        member += 1;
    }
    Ok(paths
        .into_iter()
        .map(|path| Arc::new(ArchiveFile::new(path, settings.scan_boundary)))
        .collect())
}

fn build_settings(args: &Args) -> anyhow::Result<Settings> {
    let bytes_per_sec = match &args.bytes_throttle {
        Some(size) => size
            .parse::<bytesize::ByteSize>()
            .map_err(|err| anyhow::anyhow!("invalid --bytes-throttle {:?}: {}", size, err))?
            .as_u64() as f64,
        None => 0.0,
    };
    let mut exclude_formats = Vec::new();
    for format in &args.exclude_format {
        exclude_formats.push(
            format
                .parse()
                .with_context(|| format!("invalid --exclude-format {:?}", format))?,
        );
    }
    Ok(Settings {
        batch_size: args.batch_size,
        workers: args.threads,
        queue_capacity: args.queue_size,
        max_retries: args.max_retries,
        fail_early: args.fail_early,
        start_offset: args.start_position,
        spill_threshold: args.spill_threshold,
        spill_dir: None,
        events_per_sec: args.events_throttle,
        bytes_per_sec,
        stall_timeout: humantime::parse_duration(&args.stall_timeout)
            .with_context(|| format!("invalid --stall-timeout {:?}", args.stall_timeout))?,
        progress_interval: humantime::parse_duration(&args.progress_interval)
            .with_context(|| format!("invalid --progress-interval {:?}", args.progress_interval))?,
        retain_events: args.detailed_summary,
        transforms: common::OutputTransforms {
            strip_prefix: args.strip_prefix.clone(),
            strip_suffix: args.strip_suffix.clone(),
            add_prefix: args.output_prefix.clone(),
            add_suffix: args.output_suffix.clone(),
            randomize: args.randomize_uris,
            uri_encode: args.encode_uris,
        },
        exclude_formats,
    })
}

fn archive_settings(args: &Args) -> anyhow::Result<ArchiveSettings> {
    let mut settings = ArchiveSettings {
        max_entries: args.archive_max_entries,
        ..Default::default()
    };
    if let Some(size) = &args.archive_max_bytes {
        settings.max_bytes = size
            .parse::<bytesize::ByteSize>()
            .map_err(|err| anyhow::anyhow!("invalid --archive-max-bytes {:?}: {}", size, err))?
            .as_u64();
    }
    Ok(settings)
}

async fn async_main(args: Args) -> Result<Summary, Error> {
    let fail = |err: anyhow::Error| Error::new(err, Summary::default());
    let settings = build_settings(&args).map_err(fail)?;
    let archive_settings = archive_settings(&args).map_err(fail)?;
    let src = parse_endpoint(&args.src).map_err(fail)?;
    let dst = parse_endpoint(&args.dst).map_err(fail)?;
    tracing::info!("syncing {:?} -> {:?}", src, dst);
    let (lister, reader): (Arc<dyn Lister>, Arc<dyn Reader>) = match &src {
        Endpoint::Fs(root) => (
            Arc::new(FsLister::new(root)),
            Arc::new(FsReader::new(root).with_checksum_generation(args.checksums)),
        ),
        Endpoint::Archive(base) => {
            let files = collect_archive_files(base, archive_settings).map_err(fail)?;
            (
                Arc::new(ArchiveLister::new(files.clone())),
                Arc::new(ArchiveReader::new(files).with_checksum_verification(args.checksums)),
            )
        }
    };
    let writers: Vec<Arc<dyn Writer>> = match &dst {
        Endpoint::Fs(root) => vec![Arc::new(FsWriter::new(root))],
        Endpoint::Archive(base) => ArchiveWriter::pool(base, args.archive_writers, archive_settings)
            .into_iter()
            .map(|writer| writer as Arc<dyn Writer>)
            .collect(),
    };
    common::sync(lister, reader, writers, &settings).await
}

fn main() {
    let args = Args::parse();
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary || args.detailed_summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    match common::run(output, runtime, func) {
        Some(_) => std::process::exit(0),
        None => std::process::exit(1),
    }
}
