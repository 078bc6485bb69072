use super::*;

fn patterned_data(len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    for i in 0..len {
        data.push(((i as u32 * 31 + 7) % 251) as u8);
    }
    data
}

#[test]
fn crc32_known_value() {
    assert_eq!(crc32(b"hello"), 0x3610_a686);
    assert_eq!(crc32(b""), 0);
}

#[test]
fn crc32_combine_matches_whole_buffer() {
    let data = patterned_data(1024 * 64 + 13);
    for split in [1, 250, 4096, 65536, data.len() - 1] {
        let (a, b) = data.split_at(split);
        let combined = crc32_combine(crc32(a), crc32(b), b.len() as u64);
        assert_eq!(combined, crc32(&data), "split at {split}");
    }
}

#[test]
fn crc32_combine_folds_many_chunks_left_to_right() {
    let data = patterned_data(300_000);
    let chunk = 7919;
    let mut acc = None;
    for piece in data.chunks(chunk) {
        let piece_crc = crc32(piece);
        acc = Some(match acc {
            None => piece_crc,
            Some(prev) => crc32_combine(prev, piece_crc, piece.len() as u64),
        });
    }
    assert_eq!(acc, Some(crc32(&data)));
}

#[test]
fn crc32_combine_zero_length_is_identity() {
    assert_eq!(crc32_combine(0xDEAD_BEEF, 0x1234_5678, 0), 0xDEAD_BEEF);
}

#[test]
fn deflate_single_final_chunk_roundtrip() {
    let input = b"parzip parzip parzip parzip parzip";
    let compressed = deflate_chunk(input, 6, true).expect("compress");
    let restored = deflate_decompress(&compressed).expect("decompress");
    assert_eq!(restored, input);
}

#[test]
fn deflate_chunk_concatenation_is_one_stream() {
    let data = patterned_data(1024 * 600);
    let chunk = 256 * 1024;
    let pieces: Vec<&[u8]> = data.chunks(chunk).collect();

    let mut stream = Vec::new();
    for (i, piece) in pieces.iter().enumerate() {
        let is_final = i == pieces.len() - 1;
        stream.extend_from_slice(&deflate_chunk(piece, 6, is_final).expect("compress chunk"));
    }

    let restored = deflate_decompress(&stream).expect("decompress concatenated stream");
    assert_eq!(restored, data);
}

#[test]
fn deflate_sync_flush_aligns_to_byte_boundary() {
    // A sync flush ends with an empty stored block: 00 00 FF FF.
    let fragment = deflate_chunk(&patterned_data(4096), 6, false).expect("compress");
    assert!(fragment.len() >= 4);
    assert_eq!(&fragment[fragment.len() - 4..], &[0x00, 0x00, 0xFF, 0xFF]);
}

#[test]
fn deflate_empty_final_chunk_decodes_to_empty() {
    let compressed = deflate_chunk(b"", 6, true).expect("compress empty");
    let restored = deflate_decompress(&compressed).expect("decompress empty");
    assert!(restored.is_empty());
}

#[test]
fn zstd_entry_roundtrip() {
    let data = patterned_data(3 * 1024 * 1024 + 17);
    let compressed = zstd_entry(&data, 3, DEFAULT_ZSTD_STEP).expect("zstd compress");
    let restored = zstd_decompress(&compressed).expect("zstd decompress");
    assert_eq!(restored, data);
}

#[test]
fn zstd_entry_small_step_produces_same_payload() {
    let data = patterned_data(50_000);
    let whole = zstd_entry(&data, 3, data.len()).expect("zstd whole");
    let stepped = zstd_entry(&data, 3, 1024).expect("zstd stepped");
    assert_eq!(
        zstd_decompress(&whole).expect("decode whole"),
        zstd_decompress(&stepped).expect("decode stepped"),
    );
}
