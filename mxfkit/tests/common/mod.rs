//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use mxfkit::{Klv, UniversalLabel};
use std::io::Cursor;

/// A synthetic MPEG-2 video elementary stream.
///
/// Each GOP opens with a sequence header and a (closed) GOP header,
/// followed by pictures given as (temporal_reference, picture_type) in
/// stream order with token slice payloads.
pub fn build_ves(gops: &[&[(u16, u8)]]) -> Vec<u8> {
    let mut data = Vec::new();
    for pictures in gops {
        // Sequence header: 720x576, 4:3, frame rate code 3 (25 fps)
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0xB3]);
        data.extend_from_slice(&[0x2D, 0x02, 0x40, 0x23, 0xFF, 0xFF, 0xE0, 0x18]);
        // Closed GOP header
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0xB8]);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x40]);

        for &(temporal_reference, picture_type) in *pictures {
            data.extend_from_slice(&[0x00, 0x00, 0x01, 0x00]);
            let picture_data: u16 = (temporal_reference << 6) | ((picture_type as u16) << 3);
            data.extend_from_slice(&picture_data.to_be_bytes());
            data.extend_from_slice(&[0x00, 0x00, 0x01, 0x01, 0xDE, 0xAD, 0xBE, 0xEF]);
        }
    }
    data
}

/// A 12-frame closed GOP in decode order: I P B B P B B P B B B B, with
/// display order I B B P B B P B B P B B.
pub fn twelve_frame_gop() -> Vec<(u16, u8)> {
    vec![
        (0, 1),
        (3, 2),
        (1, 3),
        (2, 3),
        (6, 2),
        (4, 3),
        (5, 3),
        (9, 2),
        (7, 3),
        (8, 3),
        (10, 3),
        (11, 3),
    ]
}

/// A minimal 16-bit PCM WAVE file of the given shape.
pub fn build_wave(sample_rate: u32, channels: u16, samples: u32) -> Vec<u8> {
    let block_align = channels * 2;
    let data_len = samples * block_align as u32;
    let mut out = Vec::new();
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend((0..data_len).map(|i| i as u8));
    out
}

/// Every KLV of a file with its file offset.
pub fn walk_klvs(bytes: &[u8]) -> Vec<Klv> {
    let mut cursor = Cursor::new(bytes);
    let mut klvs = Vec::new();
    loop {
        let at = cursor.position();
        match Klv::read(&mut cursor, at).unwrap() {
            Some(klv) => klvs.push(klv),
            None => break klvs,
        }
    }
}

/// The index table segments of a file, parsed into one table.
pub fn read_index_table(bytes: &[u8]) -> mxfkit::IndexTable {
    let mut table = mxfkit::IndexTable::new();
    let mut found = false;
    for klv in walk_klvs(bytes) {
        if klv.key.is_index_segment() {
            table.read_segment(&klv.value).unwrap();
            found = true;
        }
    }
    assert!(found, "no index table segment in file");
    table
}

/// The GC essence element KLVs of a file.
pub fn essence_klvs(bytes: &[u8]) -> Vec<Klv> {
    walk_klvs(bytes)
        .into_iter()
        .filter(|klv| klv.key.is_gc_essence())
        .collect()
}

/// True when the key is a picture element.
pub fn is_picture(key: &UniversalLabel) -> bool {
    key.gc_element_kind().map(|k| k.is_picture()).unwrap_or(false)
}
