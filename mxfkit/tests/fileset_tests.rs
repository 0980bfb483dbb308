//! File-set handling: numbered sequences feeding one logical stream.

mod common;

use mxfkit::prelude::*;
use mxfkit::EssenceSource;
use std::io::Write;

/// A numbered sequence of elementary stream files reads as one stream,
/// rolling over at wrapping-unit boundaries.
#[test]
fn sequence_reads_as_one_stream() {
    let dir = tempfile::tempdir().unwrap();
    let gop = common::twelve_frame_gop();
    for i in 1..=3 {
        let path = dir.path().join(format!("reel{:02}.m2v", i));
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&common::build_ves(&[&gop])).unwrap();
    }

    let pattern = format!("{}/reel%02d.m2v@1-3", dir.path().display());
    let parsed = FilePattern::parse(&pattern).unwrap();
    let registry = ParserRegistry::with_defaults();
    let mut source = FileSet::new(parsed.master)
        .into_source(&registry, None, WrapType::Frame)
        .unwrap();

    let mut frames = 0;
    loop {
        let mut ended = false;
        loop {
            match source.next_chunk(0, 0).unwrap() {
                Some(_) => {
                    if source.end_of_item() {
                        break;
                    }
                }
                None => {
                    ended = true;
                    break;
                }
            }
        }
        if ended {
            break;
        }
        frames += 1;
    }

    // Three 12-frame files, numbered continuously across the set
    assert_eq!(frames, 36);
    assert_eq!(source.current_position(), 36);
    assert!(source.end_of_data());
}

/// Unknown essence is rejected by the registry with a typed error.
#[test]
fn unknown_essence_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.bin");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(&[0x11; 256])
        .unwrap();

    let pattern = FilePattern::parse(&path.display().to_string()).unwrap();
    let registry = ParserRegistry::with_defaults();
    let err = FileSet::new(pattern.master)
        .into_source(&registry, None, WrapType::Frame)
        .unwrap_err();
    assert!(matches!(
        err,
        mxfkit::Error::Demux(mxfkit::DemuxError::UnknownEssence { .. })
    ));
}
