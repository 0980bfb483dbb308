//! Error types for the mxfkit library.
//!
//! Each layer has its own error enum; the top-level [`Error`] collects them
//! so that `?` works across crate boundaries.

use thiserror::Error;

/// Main error type for mxfkit operations.
#[derive(Error, Debug)]
pub enum Error {
    /// KLV or BER coding errors.
    #[error("KLV error: {0}")]
    Klv(#[from] KlvError),

    /// Index table construction or lookup errors.
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Multiplexing / writing errors.
    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),

    /// Demultiplexing / reading errors.
    #[error("Demux error: {0}")]
    Demux(#[from] DemuxError),

    /// Essence source and sub-parser errors.
    #[error("Essence error: {0}")]
    Essence(#[from] EssenceError),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// KLV coding errors.
#[derive(Error, Debug)]
pub enum KlvError {
    /// BER length could not be decoded or an encoding request cannot be met.
    #[error("Malformed BER length at offset {offset}: {message}")]
    MalformedLength { offset: u64, message: String },

    /// A key is not a valid 16-byte Universal Label.
    #[error("Malformed key at offset {offset}")]
    MalformedKey { offset: u64 },

    /// A computed KAG filler would exceed the largest representable size.
    #[error("Filler of {needed} bytes exceeds maximum of {max} at position {position}")]
    FillerTooLarge { needed: u64, max: u64, position: u64 },
}

/// Index table errors.
#[derive(Error, Debug)]
pub enum IndexError {
    /// A serialised index segment body would exceed the 2-byte local-set limit.
    #[error("Index segment starting at edit unit {start} would be {size} bytes (limit 0xFFFF)")]
    SegmentTooLarge { start: i64, size: usize },

    /// A CBR delta entry references a slice other than zero.
    #[error("CBR index delta for sub-item {sub_item} references slice {slice}")]
    InvalidSlice { sub_item: usize, slice: u8 },

    /// The index format has been fixed and can no longer be changed.
    #[error("Index manager format is fixed; cannot add sub-stream")]
    FormatFixed,

    /// An update targeted an edit unit the manager has never seen.
    #[error("Unknown edit unit {edit_unit} in {operation}")]
    UnknownEditUnit { edit_unit: i64, operation: &'static str },

    /// A serialised segment failed to parse.
    #[error("Malformed index segment: {0}")]
    MalformedSegment(String),
}

/// Multiplexing errors.
#[derive(Error, Debug)]
pub enum MuxError {
    /// Two streams computed the same effective write order.
    #[error("Write order 0x{write_order:08x} already claimed by stream {existing}")]
    WriteOrderClash { write_order: u32, existing: u16 },

    /// FastClipWrap was requested but the sink cannot seek.
    #[error("FastClipWrap requires a seekable sink")]
    NonSeekableFastClip,

    /// A KLV appeared outside its permitted partition context.
    #[error("Unexpected KLV {key} at offset {offset}")]
    UnexpectedKlv { key: String, offset: u64 },

    /// An operation referenced a stream id that was never registered.
    #[error("Unknown stream id {0}")]
    UnknownStream(u16),

    /// A body stream was registered with a BodySID already in use.
    #[error("BodySID {0} already registered")]
    DuplicateBodySid(u32),
}

/// Demultiplexing errors.
#[derive(Error, Debug)]
pub enum DemuxError {
    /// The GC element sequence deviated from the established template.
    ///
    /// Recoverable: callers may re-capture the layout and continue.
    #[error("Generic container layout inconsistent at element {element}")]
    InconsistentLayout { element: usize },

    /// A ranged source ran out of data before the requested duration.
    ///
    /// Recoverable: the affected stream ends, others continue.
    #[error("Range exhausted after {produced} of {requested} edit units")]
    RangeExhausted { produced: i64, requested: i64 },

    /// No sub-parser identified the source.
    #[error("No essence parser recognised {path}")]
    UnknownEssence { path: String },

    /// Resync could not find another partition pack.
    #[error("Resync failed: no partition pack before end of file")]
    ResyncFailed,

    /// A partition pack failed to parse.
    #[error("Invalid partition pack at offset {offset}: {message}")]
    InvalidPartition { offset: u64, message: String },
}

/// Essence source and sub-parser errors.
#[derive(Error, Debug)]
pub enum EssenceError {
    /// The requested wrapping is not available for this essence.
    #[error("Wrapping {wrapping} not supported by parser {parser}")]
    UnsupportedWrapping { wrapping: String, parser: &'static str },

    /// The requested edit rate is not acceptable for this source.
    #[error("Edit rate {num}/{den} not accepted by this source")]
    BadEditRate { num: i32, den: i32 },

    /// A file pattern could not be parsed.
    #[error("Invalid file pattern: {0}")]
    BadPattern(String),

    /// A raw essence file is malformed.
    #[error("Malformed essence in {path}: {message}")]
    MalformedEssence { path: String, message: String },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a recoverable signal (the affected stream can
    /// be ended while others continue).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Demux(DemuxError::InconsistentLayout { .. })
                | Error::Demux(DemuxError::RangeExhausted { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: Error = KlvError::MalformedKey { offset: 42 }.into();
        assert_eq!(err.to_string(), "KLV error: Malformed key at offset 42");
    }

    #[test]
    fn test_index_error_conversion() {
        let err: Error = IndexError::FormatFixed.into();
        assert!(matches!(err, Error::Index(IndexError::FormatFixed)));
    }

    #[test]
    fn test_is_recoverable() {
        let layout: Error = DemuxError::InconsistentLayout { element: 3 }.into();
        assert!(layout.is_recoverable());

        let range: Error = DemuxError::RangeExhausted {
            produced: 5,
            requested: 10,
        }
        .into();
        assert!(range.is_recoverable());

        let clash: Error = MuxError::WriteOrderClash {
            write_order: 0x1234,
            existing: 1,
        }
        .into();
        assert!(!clash.is_recoverable());
    }
}
