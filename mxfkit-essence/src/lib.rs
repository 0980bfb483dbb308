//! # mxfkit-essence
//!
//! Essence handling for the mxfkit MXF library:
//! - The [`EssenceSource`] pull interface that feeds the container writers
//! - Sub-parsers that identify raw essence and frame it into wrapping units
//!   (MPEG-2 video elementary streams, WAVE/PCM audio)
//! - Range filtering with pre-charge collection
//! - File-set patterns and sequential multi-file sources

pub mod fileset;
pub mod mpeg2;
pub mod parser;
pub mod pattern;
pub mod pcm;
pub mod source;
pub mod wrapping;

pub use fileset::FileSet;
pub use mpeg2::Mpeg2VesParser;
pub use parser::{
    EssenceInfo, EssenceStreamDescriptor, EssenceSubParser, ParserRegistry, ReadSeek,
};
pub use pattern::{FilePattern, FileRole, FileSequence};
pub use pcm::WavePcmParser;
pub use source::{
    EssenceSource, IndexObserver, ParserSource, RangedSource, SequentialSource,
    SharedEssenceSource, SharedIndexObserver,
};
pub use wrapping::{select_wrapping, WrapType, WrappingOption};
