//! Parallel ZIP archive assembly.
//!
//! An [`Archive`] partitions each submitted entry into chunks compressed
//! across a worker pool, stitches the per-chunk output and running CRC-32
//! back into a single logical entry, and emits a bit-exact ZIP file through
//! one ordered writer thread. Entries land in the archive in submission
//! order regardless of how workers finish; all header fields are known
//! before a local header is written, so no data descriptors and no backward
//! seeks. ZIP64 promotion is per field.
//!
//! Pre-compressed entries from other archives can be spliced in byte-exact
//! via [`Archive::enqueue_precompressed`] without touching the worker pool.
//!
//! ```no_run
//! use parzip::{Archive, ArchiveOptions, EntryOptions};
//!
//! let archive = Archive::create("bundle.zip", ArchiveOptions::default())?;
//! archive.write_path("assets/logo.png")?;
//! archive.write_blob("VERSION", b"1.2.3\n".to_vec(), EntryOptions::default())?;
//! let stats = archive.close()?;
//! println!("{} entries, {} bytes", stats.entries, stats.output_bytes);
//! # Ok::<(), parzip::ArchiveError>(())
//! ```

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;

pub mod chooser;
mod format;
mod planner;
mod pool;
mod writer;

pub use chooser::{Chooser, Decision, Rule};

use planner::{AssembledEntry, Payload, Planner, SourceBytes};
use pool::{BoundedQueue, Budget, BudgetPermit, EntrySlot};

/// Write buffer in front of the output file.
const OUTPUT_BUF_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("invalid entry name: {0}")]
    BadName(&'static str),
    #[error("invalid chooser rule: {0}")]
    BadRule(&'static str),
    #[error("duplicate entry name: {0}")]
    DuplicateName(String),
    #[error("source I/O error: {0}")]
    SourceIo(#[source] std::io::Error),
    #[error("compressor error: {0}")]
    Compressor(#[from] parzip_compress::CompressError),
    #[error("output I/O error: {0}")]
    OutputIo(#[source] std::io::Error),
    #[error("internal invariant violated: {0}")]
    Inconsistent(&'static str),
    #[error("async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveStats {
    pub entries: usize,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

/// Tuning knobs for one archive. The defaults saturate the host: one worker
/// per CPU, 16 mapped inputs, 64 MiB of in-flight chunk bytes.
#[derive(Debug)]
pub struct ArchiveOptions {
    pub threads: usize,
    pub open_file_budget: usize,
    pub byte_budget: u64,
    pub chooser: Chooser,
    pub deflate_chunk_size: usize,
    pub zstd_chunk_size: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            threads: std::thread::available_parallelism()
                .map(|value| value.get())
                .unwrap_or(1),
            open_file_budget: 16,
            byte_budget: 64 * 1024 * 1024,
            chooser: Chooser::default(),
            deflate_chunk_size: 256 * 1024,
            zstd_chunk_size: 1024 * 1024,
        }
    }
}

/// Per-entry metadata overrides. A `None` mtime/mode falls back to the
/// source file's stat values (or 0 / 0o100644 for blobs).
#[derive(Debug, Clone, Default)]
pub struct EntryOptions {
    pub archive_name: Option<String>,
    pub mtime: Option<i64>,
    pub mode: Option<u32>,
}

/// Description of an already-compressed entry in some source archive,
/// spliced into the output without recompression.
#[derive(Debug, Clone)]
pub struct PrecompressedEntry {
    pub name: String,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub mtime: Option<i64>,
    pub mode: u32,
    /// Offset of the stored/compressed stream inside the source, as the
    /// source's `open_range` understands it (no local-header bytes).
    pub offset: u64,
}

/// Read side of the splice path. The engine never parses a source archive's
/// central directory; it trusts this abstraction to enumerate entries and to
/// yield exactly `compressed_size` bytes of stored/compressed stream per
/// entry.
pub trait SourceArchive: Send + Sync {
    fn entries(&self) -> Result<Vec<PrecompressedEntry>, ArchiveError>;
    fn open_range(&self, offset: u64, len: u64)
        -> std::io::Result<Box<dyn std::io::Read + Send>>;
}

/// A ZIP archive being assembled. Submission methods take `&self` and may
/// block on the open-file or in-flight byte budget; compression and output
/// happen on background threads. `close` drains everything and writes the
/// central directory.
pub struct Archive {
    path: PathBuf,
    planner: Planner,
    file_budget: Arc<Budget>,
    entries: Arc<BoundedQueue<Arc<EntrySlot>>>,
    aborted: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<writer::WriterOutcome>>,
}

impl Archive {
    /// Create `path` exclusively (a pre-existing file is an error) and start
    /// the worker pool and writer.
    pub fn create(path: impl AsRef<Path>, options: ArchiveOptions) -> Result<Archive, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(ArchiveError::OutputIo)?;
        let out = BufWriter::with_capacity(OUTPUT_BUF_SIZE, file);

        let threads = options.threads.max(1);
        tracing::debug!(path = %path.display(), threads, "creating archive");

        let jobs = Arc::new(BoundedQueue::new(threads * 4));
        let workers = pool::spawn_workers(&jobs, threads);
        let entries = Arc::new(BoundedQueue::new((threads * 4).max(16)));
        let aborted = Arc::new(AtomicBool::new(false));
        let writer = writer::spawn_writer(out, Arc::clone(&entries), Arc::clone(&aborted));

        let planner = Planner {
            chooser: options.chooser,
            deflate_chunk_size: options.deflate_chunk_size.max(1) as u64,
            zstd_chunk_size: options.zstd_chunk_size.max(1),
            byte_budget: Arc::new(Budget::new(options.byte_budget)),
            jobs,
        };

        Ok(Archive {
            path,
            planner,
            file_budget: Arc::new(Budget::new(options.open_file_budget.max(1) as u64)),
            entries,
            aborted,
            workers,
            writer: Some(writer),
        })
    }

    /// Add a file, deriving the archive name from its path.
    pub fn write_path(&self, local_path: impl AsRef<Path>) -> Result<(), ArchiveError> {
        self.write_path_with(local_path, EntryOptions::default())
    }

    /// Add a file with explicit name/mtime/mode overrides. Source read and
    /// mmap errors are attached to the entry and surface from `close`.
    pub fn write_path_with(
        &self,
        local_path: impl AsRef<Path>,
        options: EntryOptions,
    ) -> Result<(), ArchiveError> {
        let local = local_path.as_ref();
        let name = match options.archive_name {
            Some(name) => {
                validate_entry_name(&name)?;
                name
            }
            None => archive_name_from_path(local)?,
        };

        let slot = Arc::new(EntrySlot::new());
        self.entries.push(Arc::clone(&slot))?;
        let permit = BudgetPermit::acquire(&self.file_budget, 1);

        match planner::open_source(local) {
            Ok((source, size, file_mtime, file_mode)) => {
                let mtime = options.mtime.unwrap_or(file_mtime);
                let mode = options.mode.unwrap_or(file_mode);
                self.planner
                    .submit(name, source, size, mtime, mode, Some(permit), slot);
            }
            Err(err) => {
                tracing::warn!(path = %local.display(), error = %err, "failed to open source");
                slot.fill(Err(err));
            }
        }
        Ok(())
    }

    /// Add an in-memory payload under `archive_name`.
    pub fn write_blob(
        &self,
        archive_name: impl Into<String>,
        data: Vec<u8>,
        options: EntryOptions,
    ) -> Result<(), ArchiveError> {
        let name = archive_name.into();
        validate_entry_name(&name)?;

        let slot = Arc::new(EntrySlot::new());
        self.entries.push(Arc::clone(&slot))?;

        let size = data.len() as u64;
        self.planner.submit(
            name,
            SourceBytes::Owned(Arc::new(data)),
            size,
            options.mtime.unwrap_or(0),
            options.mode.unwrap_or(0o100_644),
            None,
            slot,
        );
        Ok(())
    }

    /// Splice an already-compressed entry from `source` into this archive.
    /// The entry's bytes are copied verbatim at write time; its CRC is
    /// trusted, and no compression work is dispatched.
    pub fn enqueue_precompressed(
        &self,
        source: Arc<dyn SourceArchive>,
        entry: &PrecompressedEntry,
    ) -> Result<(), ArchiveError> {
        validate_entry_name(&entry.name)?;

        let slot = Arc::new(EntrySlot::new());
        self.entries.push(Arc::clone(&slot))?;
        slot.fill(Ok(AssembledEntry {
            name: entry.name.clone(),
            method: entry.method,
            crc32: entry.crc32,
            compressed_size: entry.compressed_size,
            uncompressed_size: entry.uncompressed_size,
            mtime: entry.mtime.unwrap_or(0),
            mode: entry.mode,
            payload: Payload::Splice {
                source,
                offset: entry.offset,
            },
            file_permit: None,
        }));
        Ok(())
    }

    /// Wait for all entries to drain, then write the central directory and
    /// EOCD. The first archive-fatal error is returned here, and on any
    /// error the output path is removed.
    pub fn close(mut self) -> Result<ArchiveStats, ArchiveError> {
        let outcome = match self.shutdown() {
            Ok(outcome) => outcome,
            Err(err) => {
                let _ = std::fs::remove_file(&self.path);
                return Err(err);
            }
        };
        match writer::finish(outcome) {
            Ok(stats) => Ok(stats),
            Err(err) => {
                let _ = std::fs::remove_file(&self.path);
                Err(err)
            }
        }
    }

    /// Abandon the archive: drain queued entries without writing them,
    /// release all budgets, and remove the partially written output.
    pub fn abort(mut self) -> Result<(), ArchiveError> {
        self.aborted.store(true, Ordering::SeqCst);
        let outcome = self.shutdown()?;
        drop(outcome);
        std::fs::remove_file(&self.path).map_err(ArchiveError::OutputIo)?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<writer::WriterOutcome, ArchiveError> {
        self.entries.close();
        let writer = self
            .writer
            .take()
            .ok_or(ArchiveError::Inconsistent("archive already closed"))?;
        let outcome = writer
            .join()
            .map_err(|_| ArchiveError::Inconsistent("writer thread panicked"))?;
        self.planner.jobs.close();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        Ok(outcome)
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.aborted.store(true, Ordering::SeqCst);
            if self.shutdown().is_ok() {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

/// Convenience alias for [`Archive::create`].
pub fn open_archive(
    path: impl AsRef<Path>,
    options: ArchiveOptions,
) -> Result<Archive, ArchiveError> {
    Archive::create(path, options)
}

/// Compress a directory tree into a fresh archive, entries in sorted path
/// order, names relative to `input_dir`.
pub fn compress_dir(
    input_dir: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    options: ArchiveOptions,
) -> Result<ArchiveStats, ArchiveError> {
    let input_dir = input_dir.as_ref();
    if !input_dir.is_dir() {
        return Err(ArchiveError::SourceIo(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "input path is not a directory",
        )));
    }

    let files = collect_files_recursively(input_dir)?;
    let archive = Archive::create(output_path, options)?;
    for file in files {
        let rel = file
            .strip_prefix(input_dir)
            .map_err(|_| ArchiveError::BadName("failed to compute relative path"))?;
        let name = archive_name_from_path(rel)?;
        archive.write_path_with(
            &file,
            EntryOptions {
                archive_name: Some(name),
                ..EntryOptions::default()
            },
        )?;
    }
    archive.close()
}

/// `compress_dir` on a blocking tokio task.
pub async fn compress_dir_async(
    input_dir: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    options: ArchiveOptions,
) -> Result<ArchiveStats, ArchiveError> {
    let input_dir = input_dir.as_ref().to_path_buf();
    let output_path = output_path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || compress_dir(input_dir, output_path, options)).await?
}

fn collect_files_recursively(dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut queue = VecDeque::from([dir.to_path_buf()]);
    let mut files = Vec::new();
    while let Some(dir) = queue.pop_front() {
        for entry in std::fs::read_dir(&dir).map_err(ArchiveError::SourceIo)? {
            let entry = entry.map_err(ArchiveError::SourceIo)?;
            let path = entry.path();
            if path.is_dir() {
                queue.push_back(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Reject anything that would not be a portable ZIP entry name: `/` is the
/// only separator, components must be plain, and the name must be byte-clean.
pub(crate) fn validate_entry_name(name: &str) -> Result<(), ArchiveError> {
    if name.is_empty() {
        return Err(ArchiveError::BadName("entry name is empty"));
    }
    if name.len() > usize::from(u16::MAX) {
        return Err(ArchiveError::BadName("entry name longer than 65535 bytes"));
    }
    if name.as_bytes().contains(&0) {
        return Err(ArchiveError::BadName("entry name contains NUL"));
    }
    if name.starts_with('\u{feff}') {
        return Err(ArchiveError::BadName("entry name starts with a byte order mark"));
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        return Err(ArchiveError::BadName("entry name has leading or trailing spaces"));
    }
    if name.contains('\\') {
        return Err(ArchiveError::BadName("entry name contains a backslash"));
    }
    if name.starts_with('/') {
        return Err(ArchiveError::BadName("entry name is absolute"));
    }
    for component in name.split('/') {
        match component {
            "" => return Err(ArchiveError::BadName("entry name has an empty component")),
            "." | ".." => return Err(ArchiveError::BadName("entry name has a dot component")),
            _ => {}
        }
    }
    Ok(())
}

/// Derive an archive name from a local path: anchors are stripped, `.` is
/// dropped, `..` is rejected.
pub(crate) fn archive_name_from_path(path: &Path) -> Result<String, ArchiveError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or(ArchiveError::BadName("entry name is not valid UTF-8"))?;
                parts.push(part.to_string());
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(ArchiveError::BadName("entry name has a dot component"))
            }
        }
    }
    if parts.is_empty() {
        return Err(ArchiveError::BadName("entry name is empty"));
    }
    let name = parts.join("/");
    validate_entry_name(&name)?;
    Ok(name)
}
