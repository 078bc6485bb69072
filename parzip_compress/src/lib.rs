//! Compression primitives for the parzip archive engine.
//!
//! Deflate output is produced as *raw* stream fragments: every non-final
//! chunk ends with a sync flush (an empty stored block aligning the stream to
//! a byte boundary) and the final chunk ends with a final-block marker, so
//! the concatenation of an entry's fragments is one valid raw deflate stream.
//! zstd entries are a single frame and are never split across workers.

use std::io::Write;

use flate2::Compression;
use thiserror::Error;

#[cfg(test)]
mod tests;

/// Feed granularity for the zstd streaming encoder when the caller does not
/// specify one.
pub const DEFAULT_ZSTD_STEP: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("deflate error: {0}")]
    Deflate(#[source] std::io::Error),
    #[error("zstd error: {0}")]
    Zstd(#[source] std::io::Error),
}

/// CRC-32 (IEEE 802.3 polynomial, initial/final XOR 0xFFFFFFFF) of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Compress one chunk of an entry as a raw deflate fragment.
///
/// Non-final fragments end with a sync flush, the final fragment with a
/// final block. `level` is clamped to the deflate range 0..=9.
pub fn deflate_chunk(data: &[u8], level: u32, is_final: bool) -> Result<Vec<u8>, CompressError> {
    let out = Vec::with_capacity(data.len() / 2 + 64);
    let mut encoder =
        flate2::write::DeflateEncoder::new(out, Compression::new(level.clamp(0, 9)));
    encoder.write_all(data).map_err(CompressError::Deflate)?;
    if is_final {
        encoder.finish().map_err(CompressError::Deflate)
    } else {
        // a Write::flush is a sync flush: the fragment ends on a byte
        // boundary without a final block
        encoder.flush().map_err(CompressError::Deflate)?;
        Ok(std::mem::take(encoder.get_mut()))
    }
}

/// Decompress a complete raw deflate stream.
pub fn deflate_decompress(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    let mut decoder = flate2::write::DeflateDecoder::new(Vec::new());
    decoder.write_all(data).map_err(CompressError::Deflate)?;
    decoder.finish().map_err(CompressError::Deflate)
}

/// Compress a whole entry as one zstd frame, feeding the encoder `step`
/// bytes at a time. The frame pledges the uncompressed size so conforming
/// readers can preallocate.
pub fn zstd_entry(data: &[u8], level: i32, step: usize) -> Result<Vec<u8>, CompressError> {
    let out = Vec::with_capacity(data.len() / 2 + 64);
    let mut encoder = zstd::stream::Encoder::new(out, level).map_err(CompressError::Zstd)?;
    encoder
        .set_pledged_src_size(Some(data.len() as u64))
        .map_err(CompressError::Zstd)?;
    for piece in data.chunks(step.max(1)) {
        encoder.write_all(piece).map_err(CompressError::Zstd)?;
    }
    encoder.finish().map_err(CompressError::Zstd)
}

/// Decompress a complete zstd frame.
pub fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    zstd::stream::decode_all(data).map_err(CompressError::Zstd)
}

const CRC32_POLY_REFLECTED: u32 = 0xEDB8_8320;

fn gf2_matrix_times(mat: &[u32; 32], mut vec: u32) -> u32 {
    let mut sum = 0;
    let mut row = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[row];
        }
        vec >>= 1;
        row += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u32; 32], mat: &[u32; 32]) {
    for (slot, &row) in square.iter_mut().zip(mat.iter()) {
        *slot = gf2_matrix_times(mat, row);
    }
}

/// CRC-32 combine over GF(2): given `crc_a` of some bytes A and `crc_b` of
/// bytes B with `len_b == |B|`, produces the CRC-32 of `A || B`.
///
/// The operation is associative, so ordered chunk CRCs may be folded in any
/// grouping as long as left-to-right order is preserved.
pub fn crc32_combine(crc_a: u32, crc_b: u32, len_b: u64) -> u32 {
    if len_b == 0 {
        return crc_a;
    }

    let mut even = [0_u32; 32];
    let mut odd = [0_u32; 32];

    // odd = the operator for one zero bit appended to the message
    odd[0] = CRC32_POLY_REFLECTED;
    let mut row = 1_u32;
    for slot in odd.iter_mut().skip(1) {
        *slot = row;
        row <<= 1;
    }

    // even = operator for two zero bits, odd = operator for four
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    let mut crc = crc_a;
    let mut len = len_b;
    loop {
        // apply len_b zero bytes to crc_a, one power-of-two block at a time
        gf2_matrix_square(&mut even, &odd);
        if len & 1 != 0 {
            crc = gf2_matrix_times(&even, crc);
        }
        len >>= 1;
        if len == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len & 1 != 0 {
            crc = gf2_matrix_times(&odd, crc);
        }
        len >>= 1;
        if len == 0 {
            break;
        }
    }

    crc ^ crc_b
}
