//! # mxfkit
//!
//! A library for reading and writing Material Exchange Format (MXF) files.
//!
//! On the write side, raw elementary streams are identified by sub-parsers,
//! framed into wrapping units, interleaved into a Generic Container with
//! KAG-aligned KLV packing, and laid out across partitions together with
//! header metadata and random-access index tables. On the read side, an
//! existing file is walked partition by partition and its essence
//! dispatched to per-track handlers.
//!
//! The workspace splits into:
//! - [`mxfkit_core`]: Universal Labels, KLV/BER coding, fillers, errors
//! - [`mxfkit_essence`]: essence sources, sub-parsers, file sets
//! - [`mxfkit_container`]: index tables, the GC writer/reader, partitions,
//!   and the body writer/reader
//!
//! ```no_run
//! use mxfkit::prelude::*;
//! use std::cell::RefCell;
//! use std::fs::File;
//! use std::rc::Rc;
//!
//! # fn main() -> mxfkit::Result<()> {
//! // Identify the essence and pick a wrapping
//! let pattern = FilePattern::parse("video.m2v")?;
//! let registry = ParserRegistry::with_defaults();
//! let source = FileSet::new(pattern.master)
//!     .into_source(&registry, None, WrapType::Frame)?;
//!
//! // Describe the stream and write the file
//! let mut stream = BodyStream::new(1, Rc::new(RefCell::new(source)));
//! stream.set_index_sid(2);
//! stream.set_index_flags(StreamIndexFlags::FULL_FOOTER);
//!
//! let out = File::create("out.mxf")?;
//! let mut writer = BodyWriter::new(out, WriterConfig::default());
//! writer.add_stream(stream, 0)?;
//! writer.write_header(false, false)?;
//! writer.write_body(0, 0)?;
//! writer.write_footer(false, true)?;
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub use mxfkit_core::{
    DemuxError, Error, EssenceError, IndexError, Klv, KlvError, MuxError, Rational, Result,
    UniversalLabel, WriterConfig, UL,
};

pub use mxfkit_essence::{
    EssenceInfo, EssenceSource, EssenceStreamDescriptor, EssenceSubParser, FilePattern, FileRole,
    FileSequence, FileSet, IndexObserver, Mpeg2VesParser, ParserRegistry, ParserSource,
    RangedSource, SequentialSource, SharedEssenceSource, SharedIndexObserver, WavePcmParser,
    WrapType, WrappingOption,
};

pub use mxfkit_container::{
    BodyReader, BodyStream, BodyWriter, DeltaEntry, GcLayout, GcReadHandler, GcReader,
    GcReaderControl, GcStreamId, GcWriter, IndexManager, IndexPosition, IndexSegment, IndexTable,
    Partition, PartitionCompleteness, PartitionKind, PartitionStatus, RandomIndexPack, ReaderUnit,
    SharedIndexManager, SharedReadHandler, StreamIndexFlags, StreamState,
};
