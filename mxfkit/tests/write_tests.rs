//! End-to-end write scenarios: raw essence in, conformant MXF out.

mod common;

use mxfkit::prelude::*;
use mxfkit::{
    EssenceSubParser, Mpeg2VesParser, ParserSource, Rational, WavePcmParser, WrappingOption,
};
use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

/// Build a parser source over in-memory MPEG-2 VES data.
fn mpeg2_source(ves: Vec<u8>, wrap: WrapType) -> ParserSource {
    let mut parser = Box::new(Mpeg2VesParser::new());
    let mut file = Box::new(Cursor::new(ves));
    let descriptors = parser.identify_essence(file.as_mut()).unwrap();
    assert_eq!(descriptors.len(), 1);
    let options = parser.identify_wrapping_options(file.as_mut(), &descriptors[0]);
    let wrapping: WrappingOption = options
        .iter()
        .find(|o| o.wrap_type == wrap)
        .unwrap()
        .clone();
    ParserSource::new(parser, file, 0, wrapping).unwrap()
}

/// Build a parser source over in-memory WAVE data at a given edit rate.
fn pcm_source(wave: Vec<u8>, wrap: WrapType, edit_rate: Rational) -> ParserSource {
    let mut parser = Box::new(WavePcmParser::new());
    let mut file = Box::new(Cursor::new(wave));
    let descriptors = parser.identify_essence(file.as_mut()).unwrap();
    let options = parser.identify_wrapping_options(file.as_mut(), &descriptors[0]);
    let wrapping: WrappingOption = options
        .iter()
        .find(|o| o.wrap_type == wrap)
        .unwrap()
        .clone();
    assert!(parser.set_edit_rate(edit_rate));
    ParserSource::new(parser, file, 0, wrapping).unwrap()
}

fn write_file(stream: BodyStream, config: WriterConfig) -> Vec<u8> {
    let mut writer = BodyWriter::new(Cursor::new(Vec::new()), config);
    writer.add_stream(stream, 0).unwrap();
    writer.write_header(false, false).unwrap();
    writer.write_body(0, 0).unwrap();
    writer.write_footer(false, true).unwrap();
    writer.into_inner().into_inner()
}

/// A single frame-wrapped MPEG-2 stream with a 12-frame IBBP GOP produces
/// a VBR index whose temporal offsets remap display order to stream
/// order, whose key-frame offsets point back at the I frame, and whose
/// random-access flag is set only on the first I frame.
#[test]
fn frame_wrapped_mpeg2_vbr_index() {
    let gop = common::twelve_frame_gop();
    let source = mpeg2_source(common::build_ves(&[&gop]), WrapType::Frame);

    let mut stream = BodyStream::new(1, Rc::new(RefCell::new(source)));
    stream.set_index_sid(2);
    stream.set_index_flags(StreamIndexFlags::FULL_FOOTER);

    let bytes = write_file(stream, WriterConfig::default());

    // Twelve frame-wrapped picture elements
    let essence = common::essence_klvs(&bytes);
    assert_eq!(essence.len(), 12);
    assert!(essence.iter().all(|klv| common::is_picture(&klv.key)));

    let table = common::read_index_table(&bytes);
    assert_eq!(table.index_sid, 2);
    assert_eq!(table.body_sid, 1);
    assert_eq!(table.edit_rate, Rational::new(25, 1));

    // Entry n maps display position n to its stream position
    let expected_temporal = [0, 1, 1, -2, 1, 1, -2, 1, 1, -2, 0, 0];
    // Entry n's key frame is the I frame at stream position 0
    let expected_key: Vec<i8> = (0..12i8).map(|n| -n).collect();
    let expected_flags = [
        0xC0u8, 0x22, 0x13, 0x13, 0x22, 0x33, 0x33, 0x22, 0x33, 0x33, 0x33, 0x33,
    ];

    let mut last_location = 0;
    for n in 0..12i64 {
        let entry = table.lookup(n, 0, false).unwrap();
        assert!(entry.exact);
        assert_eq!(entry.temporal_offset, expected_temporal[n as usize], "unit {}", n);
        assert_eq!(entry.key_frame_offset, expected_key[n as usize], "unit {}", n);
        assert_eq!(entry.flags, expected_flags[n as usize], "unit {}", n);
        assert!(entry.location >= last_location, "offsets must not decrease");
        last_location = entry.location;
    }

    // The random-access flag appears exactly once
    let ra_count = (0..12)
        .filter(|&n| table.lookup(n, 0, false).unwrap().flags & 0x80 != 0)
        .count();
    assert_eq!(ra_count, 1);

    // Reorder law: looking up a display position with reordering lands on
    // the stream position its temporal offset names
    for n in 0..12i64 {
        let plain = table.lookup(n, 0, false).unwrap();
        let reordered = table.lookup(n, 0, true).unwrap();
        let target = table
            .lookup(n + plain.temporal_offset as i64, 0, false)
            .unwrap();
        assert_eq!(reordered.location, target.location, "unit {}", n);
    }
}

/// Clip-wrapped PCM with FastClipWrap: the value length is streamed under
/// the maximum 8-byte BER and back-patched; parsing the file back yields
/// exactly the payload size.
#[test]
fn clip_wrapped_pcm_fast_clip_wrap() {
    // Ten seconds of 48 kHz 16-bit stereo: 1,920,000 payload bytes
    let wave = common::build_wave(48000, 2, 480_000);
    let source = pcm_source(wave, WrapType::Clip, Rational::new(25, 1));

    let stream = BodyStream::new(1, Rc::new(RefCell::new(source)));

    let config = WriterConfig::default().with_fast_clip_wrap(true);
    let bytes = write_file(stream, config);

    let essence = common::essence_klvs(&bytes);
    assert_eq!(essence.len(), 1);
    assert_eq!(essence[0].value.len(), 1_920_000);

    // The 8-byte BER length was back-patched in place
    let length_at = essence[0].offset as usize + 16;
    assert_eq!(
        &bytes[length_at..length_at + 8],
        &[0x87, 0x00, 0x00, 0x00, 0x00, 0x1D, 0x4C, 0x00]
    );
}

/// Range filtering with pre-charge: requesting 10 frames from position 30
/// keeps frames back to the last random-access point (24), indexed at
/// negative positions.
#[test]
fn range_filter_collects_precharge() {
    // 100 frames: eight 12-frame GOPs and one 4-frame GOP
    let gop = common::twelve_frame_gop();
    let tail: Vec<(u16, u8)> = vec![(0, 1), (3, 2), (1, 3), (2, 3)];
    let mut gops: Vec<&[(u16, u8)]> = vec![&gop; 8];
    gops.push(&tail);

    let base = mpeg2_source(common::build_ves(&gops), WrapType::Frame);
    let ranged = RangedSource::new(Box::new(base), 30, Some(10));

    let source: Rc<RefCell<RangedSource>> = Rc::new(RefCell::new(ranged));
    let mut stream = BodyStream::new(1, source.clone());
    stream.set_index_sid(2);
    stream.set_index_flags(StreamIndexFlags::FULL_FOOTER);

    let bytes = write_file(stream, WriterConfig::default());

    // Pre-charge ran from the last edit point at or before 30
    assert_eq!(source.borrow_mut().precharge_size(), 6);

    // 6 pre-charge frames + 10 requested frames
    assert_eq!(common::essence_klvs(&bytes).len(), 16);

    let table = common::read_index_table(&bytes);
    assert_eq!(*table.segments.keys().next().unwrap(), -6);
    let segment = table.segments.values().next().unwrap();
    assert_eq!(segment.entry_count, 16);

    // The pre-charge entries carry offsets like any other
    let first = table.lookup(-6, 0, false).unwrap();
    assert!(first.exact);
    assert_eq!(first.location, 0);
}

/// The same range with NegPrechargeIndex disabled: positions are biased by
/// the pre-charge so none are negative.
#[test]
fn range_filter_biased_positions() {
    let gop = common::twelve_frame_gop();
    let gops: Vec<&[(u16, u8)]> = vec![&gop; 4];
    let base = mpeg2_source(common::build_ves(&gops), WrapType::Frame);
    let ranged = RangedSource::new(Box::new(base), 30, Some(10));

    let mut stream = BodyStream::new(1, Rc::new(RefCell::new(ranged)));
    stream.set_index_sid(2);
    stream.set_index_flags(StreamIndexFlags::FULL_FOOTER);

    let mut config = WriterConfig::default();
    config.neg_precharge_index = false;
    let bytes = write_file(stream, config);

    let table = common::read_index_table(&bytes);
    assert_eq!(*table.segments.keys().next().unwrap(), 0);
    assert_eq!(table.segments.values().next().unwrap().entry_count, 16);
}

/// KAG alignment: every essence element of a KAG-512 container starts on
/// a 512-byte boundary of the essence stream.
#[test]
fn kag_aligned_essence() {
    let gop = common::twelve_frame_gop();
    let source = mpeg2_source(common::build_ves(&[&gop]), WrapType::Frame);

    let mut stream = BodyStream::new(1, Rc::new(RefCell::new(source)));
    stream.set_force_ber4(true);

    let config = WriterConfig::default().with_kag(512).with_force_ber4(true);
    let bytes = write_file(stream, config);

    let essence = common::essence_klvs(&bytes);
    assert_eq!(essence.len(), 12);
    let first = essence[0].offset;
    for klv in &essence {
        assert_eq!((klv.offset - first) % 512, 0, "element at {}", klv.offset);
    }
}

/// Sprinkled indexing: each body partition carries the index chunk for the
/// partitions before it, and the footer completes the table.
#[test]
fn sprinkled_index_chunks() {
    let gop = common::twelve_frame_gop();
    let gops: Vec<&[(u16, u8)]> = vec![&gop; 3];
    let source = mpeg2_source(common::build_ves(&gops), WrapType::Frame);

    let mut stream = BodyStream::new(1, Rc::new(RefCell::new(source)));
    stream.set_index_sid(2);
    stream.set_index_flags(StreamIndexFlags::SPRINKLED | StreamIndexFlags::FULL_FOOTER);

    let mut writer = BodyWriter::new(Cursor::new(Vec::new()), WriterConfig::default());
    writer.add_stream(stream, 0).unwrap();
    writer.write_header(false, false).unwrap();
    // Cap partitions at 12 edit units per call
    writer.write_body(12, 0).unwrap();
    writer.write_body(12, 0).unwrap();
    writer.write_body(0, 0).unwrap();
    writer.write_footer(false, true).unwrap();
    let bytes = writer.into_inner().into_inner();

    assert_eq!(common::essence_klvs(&bytes).len(), 36);

    // All sprinkled chunks and the footer segment merge into one table
    let table = common::read_index_table(&bytes);
    let indexed: usize = table.segments.values().map(|s| s.entry_count).sum();
    assert_eq!(indexed, 36);
}

/// Two streams cannot claim the same effective write order.
#[test]
fn write_order_clash_detected() {
    let mut gc = mxfkit::GcWriter::new(1);
    let first = gc.add_picture_element(false, 0x05).unwrap();
    let second = gc.add_picture_element(false, 0x05).unwrap();

    gc.set_relative_write_order(first, 0x07, -2).unwrap();
    let err = gc.set_relative_write_order(second, 0x07, -2).unwrap_err();
    assert!(matches!(
        err,
        mxfkit::Error::Mux(mxfkit::MuxError::WriteOrderClash { .. })
    ));
}

/// The file ends with a random index pack naming every partition, and
/// every partition pack points at the footer.
#[test]
fn rip_and_footer_backpatch() {
    let gop = common::twelve_frame_gop();
    let source = mpeg2_source(common::build_ves(&[&gop]), WrapType::Frame);
    let stream = BodyStream::new(1, Rc::new(RefCell::new(source)));
    let bytes = write_file(stream, WriterConfig::default());

    let klvs = common::walk_klvs(&bytes);
    let rip_klv = klvs.last().unwrap();
    assert!(rip_klv.key.is_random_index_pack());
    let rip = mxfkit::RandomIndexPack::parse(&rip_klv.value).unwrap();
    // Header, body, footer
    assert_eq!(rip.entries.len(), 3);
    assert_eq!(rip.entries[0].byte_offset, 0);
    assert_eq!(rip.entries[1].body_sid, 1);

    let footer_at = rip.entries[2].byte_offset;
    for entry in &rip.entries {
        let klv = klvs
            .iter()
            .find(|k| k.offset == entry.byte_offset)
            .expect("RIP points at a KLV");
        assert!(klv.key.is_partition_pack());
        let pack = mxfkit::Partition::parse(&klv.key, &klv.value, klv.offset).unwrap();
        assert_eq!(pack.footer_partition, footer_at);
        assert_eq!(pack.this_partition, entry.byte_offset);
    }
}

/// A pass capped by `stop_after` ends the stream at that duration.
#[test]
fn stop_after_limits_stream() {
    let gop = common::twelve_frame_gop();
    let gops: Vec<&[(u16, u8)]> = vec![&gop; 2];
    let source = mpeg2_source(common::build_ves(&gops), WrapType::Frame);
    let stream = BodyStream::new(1, Rc::new(RefCell::new(source)));

    let mut writer = BodyWriter::new(Cursor::new(Vec::new()), WriterConfig::default());
    writer.add_stream(stream, 5).unwrap();
    writer.write_header(false, false).unwrap();
    writer.write_body(0, 0).unwrap();
    writer.write_footer(false, true).unwrap();
    let bytes = writer.into_inner().into_inner();

    assert_eq!(common::essence_klvs(&bytes).len(), 5);
}
