//! Sub-parser interface.
//!
//! A sub-parser knows one raw essence format. It works in three phases:
//! identify the essence in a file, enumerate the wrapping options for a
//! stream, then commit to one wrapping and serve framed essence data.
//! Parsers fail identification softly (an empty descriptor list) so that a
//! registry can probe a file against every known format.

use crate::source::SharedIndexObserver;
use crate::wrapping::WrappingOption;
use mxfkit_core::{DemuxError, Rational, Result};
use std::io::{Read, Seek};
use uuid::Uuid;

/// Object-safe alias for readable, seekable essence files.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Technical description of one essence stream found in a file.
#[derive(Debug, Clone)]
pub struct EssenceStreamDescriptor {
    /// Stream identifier, unique within the parser that produced it.
    pub id: u32,
    /// Identifier for the source file format.
    pub source_format: Uuid,
    /// Human readable description.
    pub description: String,
    /// Technical parameters.
    pub info: EssenceInfo,
}

/// Technical parameters of an essence stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EssenceInfo {
    /// Picture essence.
    Video {
        width: u32,
        height: u32,
        edit_rate: Rational,
    },
    /// Sound essence.
    Audio {
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
        block_align: u16,
    },
    /// Anything else.
    Opaque,
}

/// A codec-specific essence scanner.
///
/// After [`use_wrapping`](EssenceSubParser::use_wrapping) commits a choice,
/// the rate, sizing and read calls all reflect that choice. Parsers that
/// advertise sub-streams must support [`re_validate`](EssenceSubParser::re_validate)
/// so their state can be re-entered when a file-set rolls over to the next
/// source file.
pub trait EssenceSubParser: std::fmt::Debug {
    /// Name of this sub-parser, for error messages.
    fn name(&self) -> &'static str;

    /// Examine an open file and report the essence streams found.
    ///
    /// Returns an empty list when the format is not recognised.
    fn identify_essence(
        &mut self,
        file: &mut dyn ReadSeek,
    ) -> Result<Vec<EssenceStreamDescriptor>>;

    /// Report the possible wrappings for a stream, in preference order.
    fn identify_wrapping_options(
        &mut self,
        file: &mut dyn ReadSeek,
        descriptor: &EssenceStreamDescriptor,
    ) -> Vec<WrappingOption>;

    /// Commit to a wrapping option for a stream.
    fn use_wrapping(&mut self, stream: u32, wrapping: &WrappingOption) -> Result<()>;

    /// The edit rate of the selected wrapping.
    fn edit_rate(&self) -> Rational;

    /// Offer a different edit rate; returns true if accepted.
    ///
    /// Only wrappings with `can_slave` accept a non-native rate.
    fn set_edit_rate(&mut self, _rate: Rational) -> bool {
        false
    }

    /// Bytes per edit unit at the given KAG, or 0 if not constant.
    fn bytes_per_edit_unit(&mut self, _kag: u32) -> u32 {
        0
    }

    /// Current position in edit units from the start of the essence.
    fn current_position(&self) -> i64;

    /// Attach an index observer that will receive per-edit-unit offers
    /// while the essence is scanned.
    fn set_index_observer(&mut self, _observer: SharedIndexObserver, _sub_stream: usize) {}

    /// True if this parser can produce VBR index data.
    fn can_index(&self) -> bool {
        false
    }

    /// Read essence for the next wrapping unit.
    ///
    /// Returns at most one wrapping unit unless `max_size` forces a split;
    /// never spans two wrapping units. `None` means end of data; an empty
    /// buffer means more is coming but none is available yet.
    fn read_chunk(
        &mut self,
        file: &mut dyn ReadSeek,
        size_hint: usize,
        max_size: usize,
    ) -> Result<Option<Vec<u8>>>;

    /// Size in bytes of the next chunk [`read_chunk`](EssenceSubParser::read_chunk)
    /// would return with the same arguments.
    fn next_chunk_size(&mut self, file: &mut dyn ReadSeek, max_size: usize) -> Result<usize>;

    /// Did the previous `read_chunk` finish a wrapping unit?
    fn end_of_item(&self) -> bool;

    /// Did the most recent wrapping unit begin at an edit point (a position
    /// a decoder can start from cleanly)?
    fn is_edit_point(&self) -> bool {
        true
    }

    /// Is the essence exhausted?
    fn end_of_data(&self) -> bool;

    /// Force clip-wrapped reads to return one edit unit at a time so each
    /// unit's offset can be indexed.
    fn enable_vbr_index_mode(&mut self) {}

    /// Re-enter parser state after a file-set rolled over to a new file.
    ///
    /// Returns true if the parser state is valid for the new file.
    fn re_validate(&mut self, _file: &mut dyn ReadSeek) -> bool {
        false
    }

    /// True if this parser splits a container format into sub-streams.
    fn has_sub_streams(&self) -> bool {
        false
    }
}

/// Factory producing fresh sub-parser instances.
pub type ParserFactory = Box<dyn Fn() -> Box<dyn EssenceSubParser>>;

/// Registry of known sub-parsers, probed in registration order.
pub struct ParserRegistry {
    factories: Vec<ParserFactory>,
}

impl ParserRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        ParserRegistry {
            factories: Vec::new(),
        }
    }

    /// A registry with the built-in parsers (MPEG-2 VES, WAVE/PCM).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(|| Box::new(crate::mpeg2::Mpeg2VesParser::new()));
        registry.register(|| Box::new(crate::pcm::WavePcmParser::new()));
        registry
    }

    /// Register a parser factory.
    pub fn register<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn EssenceSubParser> + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    /// Number of registered parsers.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// True if no parsers are registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Probe a file against every registered parser.
    ///
    /// Returns the first parser that identifies at least one stream,
    /// together with its descriptors. Fails with `UnknownEssence` when no
    /// parser matches.
    pub fn identify(
        &self,
        file: &mut dyn ReadSeek,
        path: &str,
    ) -> Result<(Box<dyn EssenceSubParser>, Vec<EssenceStreamDescriptor>)> {
        for factory in &self.factories {
            let mut parser = factory();
            file.rewind()?;
            let descriptors = parser.identify_essence(file)?;
            if !descriptors.is_empty() {
                log::debug!(
                    "{} identified {} stream(s) in {}",
                    parser.name(),
                    descriptors.len(),
                    path
                );
                return Ok((parser, descriptors));
            }
        }

        Err(DemuxError::UnknownEssence {
            path: path.to_string(),
        }
        .into())
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
