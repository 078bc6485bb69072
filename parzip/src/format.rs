//! Pure encoders for the ZIP wire format: local file headers, central
//! directory headers, EOCD and the ZIP64 records, plus the extra fields the
//! writer attaches (UNIX extended timestamp 0x5455, ZIP64 0x0001).
//!
//! Everything here is little-endian and follows APPNOTE 6.3.x. ZIP64
//! promotion is per field: a 32-bit slot holds the sentinel 0xFFFFFFFF iff
//! its value does not fit, and only promoted fields appear in the ZIP64
//! extra (in `usize, csize, offset` order). The one exception is the local
//! header, where a promoted size drags the other size along because APPNOTE
//! requires both in a local-header ZIP64 extra.

use chrono::{DateTime, Datelike, Timelike, Utc};

pub(crate) const LOCAL_FILE_HEADER_SIG: u32 = 0x0403_4b50;
pub(crate) const CENTRAL_DIR_HEADER_SIG: u32 = 0x0201_4b50;
pub(crate) const EOCD_SIG: u32 = 0x0605_4b50;
pub(crate) const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
pub(crate) const ZIP64_EOCD_LOCATOR_SIG: u32 = 0x0706_4b50;

pub(crate) const METHOD_STORE: u16 = 0;
pub(crate) const METHOD_DEFLATE: u16 = 8;
pub(crate) const METHOD_ZSTD: u16 = 93;

pub(crate) const GP_FLAG_UTF8: u16 = 1 << 11;

pub(crate) const VERSION_BASE: u16 = 20;
pub(crate) const VERSION_ZIP64: u16 = 45;
/// High byte 3 = UNIX host system.
pub(crate) const VERSION_MADE_BY: u16 = (3 << 8) | VERSION_ZIP64;

pub(crate) const ZIP64_EXTRA_TAG: u16 = 0x0001;
pub(crate) const UNIX_TIME_EXTRA_TAG: u16 = 0x5455;

pub(crate) const U32_SENTINEL: u64 = 0xFFFF_FFFF;
pub(crate) const U16_SENTINEL: u64 = 0xFFFF;

/// Everything the writer needs to remember about a flushed entry in order to
/// emit its central directory header at close time.
#[derive(Debug, Clone)]
pub(crate) struct CdRecord {
    pub name: String,
    pub method: u16,
    pub mtime: i64,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub local_header_offset: u64,
    pub mode: u32,
}

impl CdRecord {
    fn flags(&self) -> u16 {
        if self.name.bytes().any(|b| b > 0x7F) {
            GP_FLAG_UTF8
        } else {
            0
        }
    }

    fn needs_zip64(&self) -> bool {
        self.uncompressed_size >= U32_SENTINEL
            || self.compressed_size >= U32_SENTINEL
            || self.local_header_offset >= U32_SENTINEL
    }

    fn version_needed(&self) -> u16 {
        if self.needs_zip64() {
            VERSION_ZIP64
        } else {
            VERSION_BASE
        }
    }
}

pub(crate) fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(0xFFFF_FFFF)
}

/// MS-DOS date/time: seconds rounded down to even, valid for 1980..=2107.
/// Out-of-range timestamps encode 1980-01-01 00:00:00.
pub(crate) fn dos_datetime(mtime: i64) -> (u16, u16) {
    let fallback = (0, (1 << 5) | 1);
    let Some(dt) = DateTime::<Utc>::from_timestamp(mtime, 0) else {
        return fallback;
    };
    let year = dt.year();
    if !(1980..=2107).contains(&year) {
        return fallback;
    }
    let time = ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | ((dt.second() as u16) >> 1);
    let date = (((year - 1980) as u16) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
    (time, date)
}

/// UNIX extended timestamp extra (0x5455). The local variant may carry
/// atime/ctime when supplied; the central variant carries mtime only, with
/// the flags byte mirroring the local field.
pub(crate) fn unix_time_extra(
    mtime: i64,
    atime: Option<i64>,
    ctime: Option<i64>,
    central: bool,
) -> Vec<u8> {
    let mut flags = 1_u8;
    if atime.is_some() {
        flags |= 2;
    }
    if ctime.is_some() {
        flags |= 4;
    }

    let mut payload = vec![flags];
    payload.extend_from_slice(&unix_time_seconds(mtime).to_le_bytes());
    if !central {
        if let Some(atime) = atime {
            payload.extend_from_slice(&unix_time_seconds(atime).to_le_bytes());
        }
        if let Some(ctime) = ctime {
            payload.extend_from_slice(&unix_time_seconds(ctime).to_le_bytes());
        }
    }

    let mut out = Vec::with_capacity(4 + payload.len());
    put_u16(&mut out, UNIX_TIME_EXTRA_TAG);
    put_u16(&mut out, payload.len() as u16);
    out.extend_from_slice(&payload);
    out
}

fn unix_time_seconds(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

fn zip64_extra(fields: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + fields.len() * 8);
    put_u16(&mut out, ZIP64_EXTRA_TAG);
    put_u16(&mut out, (fields.len() * 8) as u16);
    for &field in fields {
        put_u64(&mut out, field);
    }
    out
}

pub(crate) fn encode_local_header(rec: &CdRecord) -> Vec<u8> {
    let name = rec.name.as_bytes();
    let (time, date) = dos_datetime(rec.mtime);
    let sizes_promoted =
        rec.uncompressed_size >= U32_SENTINEL || rec.compressed_size >= U32_SENTINEL;

    let mut extra = unix_time_extra(rec.mtime, None, None, false);
    if sizes_promoted {
        extra.extend_from_slice(&zip64_extra(&[rec.uncompressed_size, rec.compressed_size]));
    }

    let mut out = Vec::with_capacity(30 + name.len() + extra.len());
    put_u32(&mut out, LOCAL_FILE_HEADER_SIG);
    put_u16(&mut out, rec.version_needed());
    put_u16(&mut out, rec.flags());
    put_u16(&mut out, rec.method);
    put_u16(&mut out, time);
    put_u16(&mut out, date);
    put_u32(&mut out, rec.crc32);
    if sizes_promoted {
        put_u32(&mut out, 0xFFFF_FFFF);
        put_u32(&mut out, 0xFFFF_FFFF);
    } else {
        put_u32(&mut out, rec.compressed_size as u32);
        put_u32(&mut out, rec.uncompressed_size as u32);
    }
    put_u16(&mut out, name.len() as u16);
    put_u16(&mut out, extra.len() as u16);
    out.extend_from_slice(name);
    out.extend_from_slice(&extra);
    out
}

pub(crate) fn encode_central_header(rec: &CdRecord) -> Vec<u8> {
    let name = rec.name.as_bytes();
    let (time, date) = dos_datetime(rec.mtime);

    let mut promoted = Vec::new();
    if rec.uncompressed_size >= U32_SENTINEL {
        promoted.push(rec.uncompressed_size);
    }
    if rec.compressed_size >= U32_SENTINEL {
        promoted.push(rec.compressed_size);
    }
    if rec.local_header_offset >= U32_SENTINEL {
        promoted.push(rec.local_header_offset);
    }

    let mut extra = unix_time_extra(rec.mtime, None, None, true);
    if !promoted.is_empty() {
        extra.extend_from_slice(&zip64_extra(&promoted));
    }

    let mut out = Vec::with_capacity(46 + name.len() + extra.len());
    put_u32(&mut out, CENTRAL_DIR_HEADER_SIG);
    put_u16(&mut out, VERSION_MADE_BY);
    put_u16(&mut out, rec.version_needed());
    put_u16(&mut out, rec.flags());
    put_u16(&mut out, rec.method);
    put_u16(&mut out, time);
    put_u16(&mut out, date);
    put_u32(&mut out, rec.crc32);
    put_u32(&mut out, clamp_u32(rec.compressed_size));
    put_u32(&mut out, clamp_u32(rec.uncompressed_size));
    put_u16(&mut out, name.len() as u16);
    put_u16(&mut out, extra.len() as u16);
    put_u16(&mut out, 0); // comment len
    put_u16(&mut out, 0); // disk number start
    put_u16(&mut out, 0); // internal file attributes
    put_u32(&mut out, rec.mode << 16); // external file attributes
    put_u32(&mut out, clamp_u32(rec.local_header_offset));
    out.extend_from_slice(name);
    out.extend_from_slice(&extra);
    out
}

pub(crate) fn needs_zip64_archive(entries: u64, cd_size: u64, cd_start: u64) -> bool {
    entries > U16_SENTINEL || cd_size >= U32_SENTINEL || cd_start >= U32_SENTINEL
}

pub(crate) fn encode_zip64_eocd(entries: u64, cd_size: u64, cd_start: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(56);
    put_u32(&mut out, ZIP64_EOCD_SIG);
    put_u64(&mut out, 44); // size of the remaining record
    put_u16(&mut out, VERSION_MADE_BY);
    put_u16(&mut out, VERSION_ZIP64);
    put_u32(&mut out, 0); // disk number
    put_u32(&mut out, 0); // disk with central dir
    put_u64(&mut out, entries);
    put_u64(&mut out, entries);
    put_u64(&mut out, cd_size);
    put_u64(&mut out, cd_start);
    out
}

pub(crate) fn encode_zip64_locator(zip64_eocd_offset: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    put_u32(&mut out, ZIP64_EOCD_LOCATOR_SIG);
    put_u32(&mut out, 0); // disk with ZIP64 EOCD
    put_u64(&mut out, zip64_eocd_offset);
    put_u32(&mut out, 1); // total disks
    out
}

pub(crate) fn encode_eocd(entries: u64, cd_size: u64, cd_start: u64) -> Vec<u8> {
    let entries_u16 = if entries > U16_SENTINEL {
        0xFFFF
    } else {
        entries as u16
    };

    let mut out = Vec::with_capacity(22);
    put_u32(&mut out, EOCD_SIG);
    put_u16(&mut out, 0); // disk number
    put_u16(&mut out, 0); // disk with central dir
    put_u16(&mut out, entries_u16);
    put_u16(&mut out, entries_u16);
    put_u32(&mut out, clamp_u32(cd_size));
    put_u32(&mut out, clamp_u32(cd_start));
    put_u16(&mut out, 0); // comment len
    out
}
