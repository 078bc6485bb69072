//! Entry planning: source acquisition, chunk partitioning, dispatch to the
//! worker pool, and reassembly of per-chunk results into one entry.
//!
//! Deflate entries fan out into fixed-size chunks whose raw fragments
//! concatenate into a single stream. Stored entries fan out CRC-only jobs
//! over the same pool. zstd does not chunk-combine cleanly, so a zstd entry
//! is one job feeding a single compressor context serially.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::UNIX_EPOCH;

use memmap2::Mmap;

use crate::chooser::{Chooser, Decision};
use crate::format::{METHOD_DEFLATE, METHOD_STORE, METHOD_ZSTD};
use crate::pool::{BoundedQueue, Budget, BudgetPermit, EntrySlot};
use crate::{ArchiveError, SourceArchive};

/// Stored entries still compute CRC-32 in parallel; this is the slice size
/// handed to each CRC job.
pub(crate) const CRC_CHUNK_SIZE: u64 = 1024 * 1024;

/// How many leading bytes the chooser gets to look at.
const SNIFF_LIMIT: u64 = 16 * 1024;

/// Files up to this size are read into an owned buffer; mapping them costs
/// more than the copy.
const SMALL_READ_LIMIT: u64 = 32 * 1024;

/// Backing bytes of one input entry, shared between chunk jobs and the
/// assembled payload until the writer has flushed it.
#[derive(Clone)]
pub(crate) enum SourceBytes {
    Owned(Arc<Vec<u8>>),
    Mapped(Arc<Mmap>),
}

impl SourceBytes {
    pub fn empty() -> SourceBytes {
        SourceBytes::Owned(Arc::new(Vec::new()))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            SourceBytes::Owned(vec) => vec,
            SourceBytes::Mapped(map) => map,
        }
    }

    pub fn get(&self, offset: u64, len: u64) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        self.as_slice().get(start..end)
    }
}

/// Open an input file and capture its bytes, size, mtime and mode as
/// observed now; later growth of the file is ignored.
pub(crate) fn open_source(path: &Path) -> Result<(SourceBytes, u64, i64, u32), ArchiveError> {
    let file = File::open(path).map_err(ArchiveError::SourceIo)?;
    let meta = file.metadata().map_err(ArchiveError::SourceIo)?;
    let len = meta.len();
    let mtime = meta
        .modified()
        .ok()
        .map(|t| match t.duration_since(UNIX_EPOCH) {
            Ok(after) => after.as_secs() as i64,
            Err(before) => -(before.duration().as_secs() as i64),
        })
        .unwrap_or(0);
    let mode = file_mode(&meta);

    if len == 0 {
        return Ok((SourceBytes::empty(), 0, mtime, mode));
    }
    if len <= SMALL_READ_LIMIT {
        let mut buf = vec![0_u8; len as usize];
        (&file).read_exact(&mut buf).map_err(ArchiveError::SourceIo)?;
        return Ok((SourceBytes::Owned(Arc::new(buf)), len, mtime, mode));
    }

    let map = unsafe { Mmap::map(&file) }.map_err(ArchiveError::SourceIo)?;
    let len = map.len() as u64;
    Ok((SourceBytes::Mapped(Arc::new(map)), len, mtime, mode))
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o100_644
}

/// A fully assembled entry, ready for the writer: all header fields are
/// known before the local header is emitted.
pub(crate) struct AssembledEntry {
    pub name: String,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub payload: Payload,
    pub file_permit: Option<BudgetPermit>,
}

pub(crate) enum Payload {
    /// Ordered compressed fragments.
    Chunks(Vec<Vec<u8>>),
    /// The source bytes themselves (stored entries and store downgrades).
    Raw(SourceBytes),
    /// Byte-exact copy out of another archive.
    Splice {
        source: Arc<dyn SourceArchive>,
        offset: u64,
    },
}

#[derive(Clone, Copy)]
enum PlanMethod {
    Store,
    Deflate { level: u32 },
    Zstd { level: i32, step: usize },
}

pub(crate) enum ChunkKind {
    CrcOnly,
    Deflate { level: u32, is_final: bool },
    Zstd { level: i32, step: usize },
}

pub(crate) struct ChunkJob {
    entry: Arc<EntryJob>,
    index: usize,
    offset: u64,
    len: u64,
    kind: ChunkKind,
    charge: u64,
}

struct ChunkOut {
    bytes: Vec<u8>,
    crc: u32,
    len: u64,
}

struct Progress {
    slots: Vec<Option<ChunkOut>>,
    remaining: usize,
    failed: Option<ArchiveError>,
    file_permit: Option<BudgetPermit>,
}

pub(crate) struct EntryJob {
    name: String,
    method: PlanMethod,
    mtime: i64,
    mode: u32,
    uncompressed_size: u64,
    source: SourceBytes,
    byte_budget: Arc<Budget>,
    slot: Arc<EntrySlot>,
    state: Mutex<Progress>,
}

impl EntryJob {
    fn complete_chunk(self: &Arc<Self>, index: usize, result: Result<ChunkOut, ArchiveError>) {
        let mut progress = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(out) => {
                if progress.failed.is_none() {
                    match progress.slots.get_mut(index) {
                        Some(slot) => *slot = Some(out),
                        None => {
                            progress.failed =
                                Some(ArchiveError::Inconsistent("chunk index out of range"));
                        }
                    }
                }
            }
            Err(err) => {
                if progress.failed.is_none() {
                    progress.failed = Some(err);
                }
            }
        }

        progress.remaining -= 1;
        if progress.remaining == 0 {
            let failed = progress.failed.take();
            let file_permit = progress.file_permit.take();
            let slots = std::mem::take(&mut progress.slots);
            drop(progress);

            let result = match failed {
                Some(err) => Err(err),
                None => self.assemble(slots, file_permit),
            };
            self.slot.fill(result);
        }
    }

    /// Account for chunks that were never dispatched (queue closed under us).
    fn abandon(self: &Arc<Self>, undispatched: usize, err: ArchiveError) {
        let mut progress = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if progress.failed.is_none() {
            progress.failed = Some(err);
        }
        progress.remaining -= undispatched;
        if progress.remaining == 0 {
            let failed = progress.failed.take();
            drop(progress.file_permit.take());
            progress.slots.clear();
            drop(progress);
            self.slot
                .fill(Err(failed
                    .unwrap_or(ArchiveError::Inconsistent("entry abandoned"))));
        }
    }

    fn assemble(
        &self,
        slots: Vec<Option<ChunkOut>>,
        file_permit: Option<BudgetPermit>,
    ) -> Result<AssembledEntry, ArchiveError> {
        let mut chunks = Vec::with_capacity(slots.len());
        let mut crc = 0_u32;
        let mut combined_len = 0_u64;
        let mut compressed_size = 0_u64;

        for (index, slot) in slots.into_iter().enumerate() {
            let out = slot.ok_or(ArchiveError::Inconsistent("missing chunk result"))?;
            crc = if index == 0 {
                out.crc
            } else {
                parzip_compress::crc32_combine(crc, out.crc, out.len)
            };
            combined_len += out.len;
            compressed_size += out.bytes.len() as u64;
            chunks.push(out.bytes);
        }

        if combined_len != self.uncompressed_size {
            return Err(ArchiveError::Inconsistent("assembled length mismatch"));
        }

        let (method, compressed_size, payload) = match self.method {
            PlanMethod::Store => (
                METHOD_STORE,
                self.uncompressed_size,
                Payload::Raw(self.source.clone()),
            ),
            PlanMethod::Deflate { .. } | PlanMethod::Zstd { .. } => {
                if Chooser::should_store_instead(compressed_size, self.uncompressed_size) {
                    tracing::debug!(name = %self.name, "compressed output not smaller, storing raw");
                    (
                        METHOD_STORE,
                        self.uncompressed_size,
                        Payload::Raw(self.source.clone()),
                    )
                } else {
                    let code = match self.method {
                        PlanMethod::Zstd { .. } => METHOD_ZSTD,
                        _ => METHOD_DEFLATE,
                    };
                    (code, compressed_size, Payload::Chunks(chunks))
                }
            }
        };

        Ok(AssembledEntry {
            name: self.name.clone(),
            method,
            crc32: crc,
            compressed_size,
            uncompressed_size: self.uncompressed_size,
            mtime: self.mtime,
            mode: self.mode,
            payload,
            file_permit,
        })
    }
}

/// Runs on a pool worker: compress (or just CRC) one chunk, release the byte
/// charge, hand the result back to the owning entry.
pub(crate) fn execute_chunk(job: ChunkJob) {
    let ChunkJob {
        entry,
        index,
        offset,
        len,
        kind,
        charge,
    } = job;
    let result = run_chunk(&entry, offset, len, &kind);
    entry.byte_budget.release(charge);
    entry.complete_chunk(index, result);
}

fn run_chunk(
    entry: &EntryJob,
    offset: u64,
    len: u64,
    kind: &ChunkKind,
) -> Result<ChunkOut, ArchiveError> {
    let data = entry
        .source
        .get(offset, len)
        .ok_or(ArchiveError::Inconsistent("chunk range outside source"))?;
    let (bytes, crc) = match *kind {
        ChunkKind::CrcOnly => (Vec::new(), parzip_compress::crc32(data)),
        ChunkKind::Deflate { level, is_final } => (
            parzip_compress::deflate_chunk(data, level, is_final)?,
            parzip_compress::crc32(data),
        ),
        ChunkKind::Zstd { level, step } => (
            parzip_compress::zstd_entry(data, level, step)?,
            parzip_compress::crc32(data),
        ),
    };
    Ok(ChunkOut { bytes, crc, len })
}

/// Dispatch side of the pipeline, shared by every submission path.
pub(crate) struct Planner {
    pub chooser: Chooser,
    pub deflate_chunk_size: u64,
    pub zstd_chunk_size: usize,
    pub byte_budget: Arc<Budget>,
    pub jobs: Arc<BoundedQueue<ChunkJob>>,
}

impl Planner {
    /// Partition one entry and feed its chunks to the pool. Blocks on the
    /// byte budget and the pool queue bound; the assembled entry (or the
    /// first error) is delivered through `slot`.
    pub fn submit(
        &self,
        name: String,
        source: SourceBytes,
        size: u64,
        mtime: i64,
        mode: u32,
        file_permit: Option<BudgetPermit>,
        slot: Arc<EntrySlot>,
    ) {
        let _span = tracing::debug_span!("plan", name = %name, size).entered();

        if size == 0 {
            drop(file_permit);
            slot.fill(Ok(AssembledEntry {
                name,
                method: METHOD_STORE,
                crc32: 0,
                compressed_size: 0,
                uncompressed_size: 0,
                mtime,
                mode,
                payload: Payload::Raw(SourceBytes::empty()),
                file_permit: None,
            }));
            return;
        }

        let sample = source.get(0, size.min(SNIFF_LIMIT)).unwrap_or(&[]);
        let method = match self.chooser.choose(&name, size, sample) {
            Decision::Store => PlanMethod::Store,
            Decision::Deflate { level } => PlanMethod::Deflate { level },
            Decision::Zstd { level } => PlanMethod::Zstd {
                level,
                step: self.zstd_chunk_size,
            },
        };
        let chunk_size = match method {
            PlanMethod::Store => CRC_CHUNK_SIZE,
            PlanMethod::Deflate { .. } => self.deflate_chunk_size.max(1),
            // zstd runs as one serial stream on a single worker
            PlanMethod::Zstd { .. } => size,
        };

        let count = size.div_ceil(chunk_size) as usize;
        let entry = Arc::new(EntryJob {
            name,
            method,
            mtime,
            mode,
            uncompressed_size: size,
            source,
            byte_budget: Arc::clone(&self.byte_budget),
            slot,
            state: Mutex::new(Progress {
                slots: std::iter::repeat_with(|| None).take(count).collect(),
                remaining: count,
                failed: None,
                file_permit,
            }),
        });

        for index in 0..count {
            let offset = index as u64 * chunk_size;
            let len = chunk_size.min(size - offset);
            let kind = match method {
                PlanMethod::Store => ChunkKind::CrcOnly,
                PlanMethod::Deflate { level } => ChunkKind::Deflate {
                    level,
                    is_final: index == count - 1,
                },
                PlanMethod::Zstd { level, step } => ChunkKind::Zstd { level, step },
            };
            let charge = self.byte_budget.acquire(len);
            let job = ChunkJob {
                entry: Arc::clone(&entry),
                index,
                offset,
                len,
                kind,
                charge,
            };
            if self.jobs.push(job).is_err() {
                self.byte_budget.release(charge);
                entry.abandon(
                    count - index,
                    ArchiveError::Inconsistent("worker pool shut down during dispatch"),
                );
                return;
            }
        }
    }
}
