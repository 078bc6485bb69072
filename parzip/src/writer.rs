//! Single-threaded archive writer.
//!
//! The writer is the only component that touches the output file. It pulls
//! assembled entries in submission order, emits local header + payload for
//! each, and accumulates the central directory records that `finish` turns
//! into the trailing CD / ZIP64 records / EOCD. The first failed entry makes
//! the archive fatal: remaining entries are drained and discarded so budgets
//! release, and `close()` surfaces the error after removing the output.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::format::{self, CdRecord};
use crate::planner::{AssembledEntry, Payload};
use crate::pool::{BoundedQueue, EntrySlot};
use crate::{ArchiveError, ArchiveStats};

/// Copy buffer for splice transfers.
const SPLICE_BUF_SIZE: usize = 256 * 1024;

pub(crate) struct WriterOutcome {
    pub out: BufWriter<File>,
    pub records: Vec<CdRecord>,
    pub offset: u64,
    pub input_bytes: u64,
    pub error: Option<ArchiveError>,
}

pub(crate) fn spawn_writer(
    out: BufWriter<File>,
    entries: Arc<BoundedQueue<Arc<EntrySlot>>>,
    aborted: Arc<AtomicBool>,
) -> JoinHandle<WriterOutcome> {
    std::thread::spawn(move || {
        let mut state = WriteState {
            out,
            offset: 0,
            records: Vec::new(),
            seen: HashMap::new(),
            input_bytes: 0,
            error: None,
        };

        while let Some(slot) = entries.pop() {
            let result = slot.wait();
            if state.error.is_some() || aborted.load(Ordering::SeqCst) {
                // drain so budgets release and submitters unblock
                continue;
            }
            match result {
                Ok(entry) => {
                    if let Err(err) = state.write_entry(entry) {
                        tracing::warn!(error = %err, "archive write failed, discarding output");
                        state.error = Some(err);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "entry failed, discarding output");
                    state.error = Some(err);
                }
            }
        }

        WriterOutcome {
            out: state.out,
            records: state.records,
            offset: state.offset,
            input_bytes: state.input_bytes,
            error: state.error,
        }
    })
}

struct WriteState {
    out: BufWriter<File>,
    offset: u64,
    records: Vec<CdRecord>,
    seen: HashMap<String, u64>,
    input_bytes: u64,
    error: Option<ArchiveError>,
}

impl WriteState {
    fn write_entry(&mut self, entry: AssembledEntry) -> Result<(), ArchiveError> {
        if self.seen.contains_key(&entry.name) {
            let err = ArchiveError::DuplicateName(entry.name.clone());
            tracing::warn!(error = %err, "skipping entry, first occurrence kept");
            return Ok(());
        }

        let record = CdRecord {
            name: entry.name.clone(),
            method: entry.method,
            mtime: entry.mtime,
            crc32: entry.crc32,
            compressed_size: entry.compressed_size,
            uncompressed_size: entry.uncompressed_size,
            local_header_offset: self.offset,
            mode: entry.mode,
        };

        let header = format::encode_local_header(&record);
        self.out
            .write_all(&header)
            .map_err(ArchiveError::OutputIo)?;
        self.offset += header.len() as u64;

        match &entry.payload {
            Payload::Chunks(chunks) => {
                for chunk in chunks {
                    self.out.write_all(chunk).map_err(ArchiveError::OutputIo)?;
                }
            }
            Payload::Raw(source) => {
                let data = source
                    .get(0, entry.uncompressed_size)
                    .ok_or(ArchiveError::Inconsistent("raw payload shorter than entry"))?;
                self.out.write_all(data).map_err(ArchiveError::OutputIo)?;
            }
            Payload::Splice { source, offset } => {
                self.copy_splice(source.as_ref(), *offset, entry.compressed_size)?;
            }
        }
        self.offset += entry.compressed_size;

        tracing::debug!(
            name = %record.name,
            method = record.method,
            csize = record.compressed_size,
            usize = record.uncompressed_size,
            "entry flushed"
        );

        self.seen
            .insert(record.name.clone(), record.local_header_offset);
        self.input_bytes += record.uncompressed_size;
        self.records.push(record);
        // dropping the entry here releases its source map and budgets
        Ok(())
    }

    fn copy_splice(
        &mut self,
        source: &dyn crate::SourceArchive,
        offset: u64,
        len: u64,
    ) -> Result<(), ArchiveError> {
        let mut reader = source
            .open_range(offset, len)
            .map_err(ArchiveError::SourceIo)?;
        let mut buf = vec![0_u8; SPLICE_BUF_SIZE.min(len.max(1) as usize)];
        let mut remaining = len;
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let got = reader
                .read(&mut buf[..want])
                .map_err(ArchiveError::SourceIo)?;
            if got == 0 {
                return Err(ArchiveError::Inconsistent(
                    "splice source ended before csize bytes",
                ));
            }
            self.out
                .write_all(&buf[..got])
                .map_err(ArchiveError::OutputIo)?;
            remaining -= got as u64;
        }
        Ok(())
    }
}

/// Emit the central directory, ZIP64 records when needed, and the EOCD.
/// Runs on the closing thread after the writer has been joined.
pub(crate) fn finish(outcome: WriterOutcome) -> Result<ArchiveStats, ArchiveError> {
    let WriterOutcome {
        mut out,
        records,
        mut offset,
        input_bytes,
        error,
    } = outcome;
    if let Some(err) = error {
        return Err(err);
    }

    tracing::info!(entries = records.len(), "writing central directory");

    let cd_start = offset;
    for record in &records {
        let header = format::encode_central_header(record);
        out.write_all(&header).map_err(ArchiveError::OutputIo)?;
        offset += header.len() as u64;
    }
    let cd_size = offset - cd_start;
    let entries = records.len() as u64;

    if format::needs_zip64_archive(entries, cd_size, cd_start) {
        let zip64_eocd_offset = offset;
        let record = format::encode_zip64_eocd(entries, cd_size, cd_start);
        out.write_all(&record).map_err(ArchiveError::OutputIo)?;
        offset += record.len() as u64;
        let locator = format::encode_zip64_locator(zip64_eocd_offset);
        out.write_all(&locator).map_err(ArchiveError::OutputIo)?;
        offset += locator.len() as u64;
    }

    let eocd = format::encode_eocd(entries, cd_size, cd_start);
    out.write_all(&eocd).map_err(ArchiveError::OutputIo)?;
    offset += eocd.len() as u64;
    out.flush().map_err(ArchiveError::OutputIo)?;

    Ok(ArchiveStats {
        entries: records.len(),
        input_bytes,
        output_bytes: offset,
    })
}
