//! The essence source pull interface.
//!
//! An [`EssenceSource`] supplies essence data one wrapping unit at a time
//! to the generic container writer. A source exclusively owns its file
//! handle and buffers; wrapping sources (ranged, sequential) exclusively
//! own their inner source. Body streams refer to sources only by stream id.

use crate::parser::{EssenceSubParser, ReadSeek};
use crate::wrapping::{WrapType, WrappingOption};
use mxfkit_core::ul::UL;
use mxfkit_core::{DemuxError, Rational, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Receives per-edit-unit index observations from essence scanners.
///
/// Implemented by the index manager in the container crate; defined here so
/// sub-parsers can offer data without a dependency cycle.
pub trait IndexObserver {
    /// Record an edit unit without a known file offset.
    fn offer_edit_unit(&mut self, sub_stream: usize, edit_unit: i64, key_offset: i8, flags: Option<u8>);

    /// Record the stream offset of an edit unit.
    fn offer_offset(
        &mut self,
        sub_stream: usize,
        edit_unit: i64,
        offset: u64,
        key_offset: i8,
        flags: Option<u8>,
    );

    /// Record the decode/presentation displacement for an edit unit.
    fn offer_temporal_offset(&mut self, edit_unit: i64, offset: i32);
}

/// Shared handle to an index observer.
///
/// The library is single-threaded; `Rc<RefCell<..>>` mirrors the shared
/// mutation pattern of the write pass.
pub type SharedIndexObserver = Rc<RefCell<dyn IndexObserver>>;

/// Shared handle to an essence source.
///
/// A body stream holds one of these per source; the container writer's
/// queue holds a second handle while a clip-wrapped write is in flight.
pub type SharedEssenceSource = Rc<RefCell<dyn EssenceSource>>;

/// Pull interface for essence data.
pub trait EssenceSource {
    /// Size in bytes of the next installment of essence data.
    fn data_size(&mut self) -> Result<usize>;

    /// Get the next installment of essence data.
    ///
    /// Returns at most one wrapping unit unless `size_hint` or `max_size`
    /// force a split; never returns bytes spanning two wrapping units.
    /// `max_size` (when non-zero) is a hard ceiling. An empty buffer means
    /// more data is coming but none is available yet; `None` means end of
    /// data. If [`end_of_item`](EssenceSource::end_of_item) was true after
    /// the previous call, the next call begins a new wrapping unit.
    fn next_chunk(&mut self, size_hint: usize, max_size: usize) -> Result<Option<Vec<u8>>>;

    /// Did the last chunk complete a wrapping unit?
    fn end_of_item(&self) -> bool;

    /// Is all data exhausted?
    fn end_of_data(&self) -> bool;

    /// The edit rate of this wrapping of the essence.
    ///
    /// May differ from the native rate when the wrapping slaves to another
    /// stream's rate.
    fn edit_rate(&self) -> Rational;

    /// Current position in edit-rate units from the start of the stream.
    fn current_position(&mut self) -> i64;

    /// Generic container essence type byte for this wrapping.
    fn gc_essence_type(&self) -> u8;

    /// Generic container element type byte for this wrapping.
    fn gc_element_type(&self) -> u8;

    /// Preferred BER length size for essence KLVs from this source, 0 for auto.
    fn ber_size(&self) -> usize {
        0
    }

    /// Bytes per edit unit if constant, else 0.
    fn bytes_per_edit_unit(&mut self, _kag: u32) -> u32 {
        0
    }

    /// Can this source feed an index manager?
    fn can_index(&self) -> bool {
        false
    }

    /// Attach the index observer that receives offers during scanning.
    fn set_index_observer(&mut self, _observer: SharedIndexObserver, _sub_stream: usize) {}

    /// Force edit-unit-granular chunks so clip-wrapped essence can be
    /// VBR indexed.
    fn enable_vbr_index_mode(&mut self) {}

    /// Number of pre-charge edit units this source will deliver before
    /// position zero.
    fn precharge_size(&mut self) -> i64 {
        0
    }

    /// Requested range start, in edit units of the unfiltered stream.
    fn range_start(&self) -> i64 {
        0
    }

    /// Requested range end, or 0 when unbounded.
    fn range_end(&self) -> i64 {
        0
    }

    /// Requested range duration, or 0 when unbounded.
    fn range_duration(&self) -> i64 {
        0
    }

    /// Did the most recent wrapping unit begin at an edit point?
    fn is_edit_point(&self) -> bool {
        true
    }

    /// Padding to write in wrapping units after this source's data ends,
    /// instead of zero-length KLVs.
    fn padding(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Overridden essence key for this source, with a flag set when the key
    /// does not use the GC track-number mechanism.
    fn key_override(&self) -> Option<(UL, bool)> {
        None
    }

    /// Relative write-order nudge, or 0 for default ordering.
    fn relative_write_order(&self) -> i32 {
        0
    }

    /// Item type byte that [`relative_write_order`](EssenceSource::relative_write_order)
    /// positions against.
    fn relative_write_order_type(&self) -> u8 {
        0
    }

    /// Is this a system item rather than essence?
    fn is_system_item(&self) -> bool {
        false
    }

    /// The wrap type committed for this source.
    fn wrap_type(&self) -> WrapType {
        WrapType::Other
    }

    /// The essence container label of the committed wrapping, if known.
    fn container_ul(&self) -> Option<UL> {
        None
    }
}

/// An essence source backed by a sub-parser bound to a single file.
pub struct ParserSource {
    parser: Box<dyn EssenceSubParser>,
    file: Box<dyn ReadSeek>,
    wrapping: WrappingOption,
}

impl ParserSource {
    /// Bind a parser and an open file to a committed wrapping option.
    pub fn new(
        mut parser: Box<dyn EssenceSubParser>,
        file: Box<dyn ReadSeek>,
        stream: u32,
        wrapping: WrappingOption,
    ) -> Result<Self> {
        parser.use_wrapping(stream, &wrapping)?;
        Ok(ParserSource {
            parser,
            file,
            wrapping,
        })
    }

    /// The wrapping this source was built with.
    pub fn wrapping(&self) -> &WrappingOption {
        &self.wrapping
    }
}

impl EssenceSource for ParserSource {
    fn data_size(&mut self) -> Result<usize> {
        self.parser.next_chunk_size(self.file.as_mut(), 0)
    }

    fn next_chunk(&mut self, size_hint: usize, max_size: usize) -> Result<Option<Vec<u8>>> {
        self.parser
            .read_chunk(self.file.as_mut(), size_hint, max_size)
    }

    fn end_of_item(&self) -> bool {
        self.parser.end_of_item()
    }

    fn end_of_data(&self) -> bool {
        self.parser.end_of_data()
    }

    fn edit_rate(&self) -> Rational {
        self.parser.edit_rate()
    }

    fn current_position(&mut self) -> i64 {
        self.parser.current_position()
    }

    fn gc_essence_type(&self) -> u8 {
        self.wrapping.gc_essence_type
    }

    fn gc_element_type(&self) -> u8 {
        self.wrapping.gc_element_type
    }

    fn ber_size(&self) -> usize {
        self.wrapping.ber_size as usize
    }

    fn bytes_per_edit_unit(&mut self, kag: u32) -> u32 {
        self.parser.bytes_per_edit_unit(kag)
    }

    fn can_index(&self) -> bool {
        self.parser.can_index()
    }

    fn set_index_observer(&mut self, observer: SharedIndexObserver, sub_stream: usize) {
        self.parser.set_index_observer(observer, sub_stream);
    }

    fn enable_vbr_index_mode(&mut self) {
        self.parser.enable_vbr_index_mode();
    }

    fn is_edit_point(&self) -> bool {
        self.parser.is_edit_point()
    }

    fn wrap_type(&self) -> WrapType {
        self.wrapping.wrap_type
    }

    fn container_ul(&self) -> Option<UL> {
        Some(self.wrapping.wrapping_ul)
    }
}

/// A source that clips an inner source to a start/duration window.
///
/// Edit units before the requested start are discarded, except that units
/// from the last edit point at or before the start are buffered as
/// pre-charge and delivered first (they carry negative positions). The
/// source ends after the requested duration; if the inner source ends
/// first, `next_chunk` fails with the recoverable `RangeExhausted`.
pub struct RangedSource {
    inner: Box<dyn EssenceSource>,
    requested_start: i64,
    requested_duration: Option<i64>,
    /// Buffered pre-charge wrapping units, oldest first.
    precharge: VecDeque<Vec<u8>>,
    /// Number of units buffered at charge time; fixed once charged.
    precharge_len: i64,
    /// The unit at the requested start, read during charging to learn
    /// whether it is an edit point.
    pending_first: Option<Vec<u8>>,
    charged: bool,
    /// Position of the next unit to deliver, relative to the kept range
    /// (pre-charge units are negative).
    position: i64,
    /// Count of non-precharge units fully delivered.
    produced: i64,
    end_of_item: bool,
    done: bool,
}

impl RangedSource {
    /// Window `inner` to `duration` edit units starting at `start`.
    pub fn new(inner: Box<dyn EssenceSource>, start: i64, duration: Option<i64>) -> Self {
        RangedSource {
            inner,
            requested_start: start,
            requested_duration: duration,
            precharge: VecDeque::new(),
            precharge_len: 0,
            pending_first: None,
            charged: false,
            position: 0,
            produced: 0,
            end_of_item: true,
            done: false,
        }
    }

    /// Read one complete wrapping unit from the inner source.
    fn read_unit(&mut self) -> Result<Option<Vec<u8>>> {
        let mut unit = Vec::new();
        loop {
            match self.inner.next_chunk(0, 0)? {
                None => {
                    if unit.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(unit));
                }
                Some(chunk) => {
                    unit.extend_from_slice(&chunk);
                    if self.inner.end_of_item() {
                        return Ok(Some(unit));
                    }
                }
            }
        }
    }

    /// Skip to the requested start, buffering pre-charge units.
    fn charge(&mut self) -> Result<()> {
        if self.charged {
            return Ok(());
        }

        let mut pos = 0i64;
        while pos < self.requested_start {
            let Some(unit) = self.read_unit()? else {
                return Err(DemuxError::RangeExhausted {
                    produced: 0,
                    requested: self.requested_start,
                }
                .into());
            };

            // A new edit point invalidates any earlier pre-charge.
            if self.inner.is_edit_point() {
                self.precharge.clear();
            }
            self.precharge.push_back(unit);
            pos += 1;
        }

        // Read the unit at the start position: if it opens an edit point
        // the decoder needs nothing before it and the buffer is dropped.
        let Some(first) = self.read_unit()? else {
            return Err(DemuxError::RangeExhausted {
                produced: 0,
                requested: self.requested_start + 1,
            }
            .into());
        };
        if self.inner.is_edit_point() {
            self.precharge.clear();
        }
        self.pending_first = Some(first);

        self.precharge_len = self.precharge.len() as i64;
        self.position = -self.precharge_len;
        self.charged = true;
        Ok(())
    }
}

impl EssenceSource for RangedSource {
    fn data_size(&mut self) -> Result<usize> {
        self.charge()?;
        if let Some(unit) = self.precharge.front() {
            return Ok(unit.len());
        }
        if let Some(unit) = self.pending_first.as_ref() {
            return Ok(unit.len());
        }
        self.inner.data_size()
    }

    fn next_chunk(&mut self, size_hint: usize, max_size: usize) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        self.charge()?;

        // Drain the pre-charge buffer first.
        if let Some(unit) = self.precharge.pop_front() {
            self.end_of_item = true;
            self.position += 1;
            return Ok(Some(unit));
        }

        if let Some(duration) = self.requested_duration {
            if self.produced >= duration {
                self.done = true;
                return Ok(None);
            }
        }

        // Then the start unit read during charging.
        if let Some(unit) = self.pending_first.take() {
            self.end_of_item = true;
            self.position += 1;
            self.produced += 1;
            return Ok(Some(unit));
        }

        let chunk = self.inner.next_chunk(size_hint, max_size)?;
        match chunk {
            None => {
                if let Some(duration) = self.requested_duration {
                    if self.produced < duration {
                        self.done = true;
                        return Err(DemuxError::RangeExhausted {
                            produced: self.produced,
                            requested: duration,
                        }
                        .into());
                    }
                }
                self.done = true;
                Ok(None)
            }
            Some(chunk) => {
                self.end_of_item = self.inner.end_of_item();
                if self.end_of_item {
                    self.produced += 1;
                    self.position += 1;
                }
                Ok(Some(chunk))
            }
        }
    }

    fn end_of_item(&self) -> bool {
        self.end_of_item
    }

    fn end_of_data(&self) -> bool {
        if self.done {
            return true;
        }
        if !self.charged {
            return false;
        }
        if !self.precharge.is_empty() || self.pending_first.is_some() {
            return false;
        }
        match self.requested_duration {
            Some(duration) => self.produced >= duration || self.inner.end_of_data(),
            None => self.inner.end_of_data(),
        }
    }

    fn edit_rate(&self) -> Rational {
        self.inner.edit_rate()
    }

    fn current_position(&mut self) -> i64 {
        self.position
    }

    fn gc_essence_type(&self) -> u8 {
        self.inner.gc_essence_type()
    }

    fn gc_element_type(&self) -> u8 {
        self.inner.gc_element_type()
    }

    fn ber_size(&self) -> usize {
        self.inner.ber_size()
    }

    fn bytes_per_edit_unit(&mut self, kag: u32) -> u32 {
        self.inner.bytes_per_edit_unit(kag)
    }

    fn can_index(&self) -> bool {
        self.inner.can_index()
    }

    fn set_index_observer(&mut self, observer: SharedIndexObserver, sub_stream: usize) {
        self.inner.set_index_observer(observer, sub_stream);
    }

    fn enable_vbr_index_mode(&mut self) {
        self.inner.enable_vbr_index_mode();
    }

    fn precharge_size(&mut self) -> i64 {
        if self.charge().is_err() {
            return 0;
        }
        self.precharge_len
    }

    fn range_start(&self) -> i64 {
        self.requested_start
    }

    fn range_end(&self) -> i64 {
        match self.requested_duration {
            Some(d) => self.requested_start + d,
            None => 0,
        }
    }

    fn range_duration(&self) -> i64 {
        self.requested_duration.unwrap_or(0)
    }

    fn is_edit_point(&self) -> bool {
        self.inner.is_edit_point()
    }

    fn wrap_type(&self) -> WrapType {
        self.inner.wrap_type()
    }

    fn container_ul(&self) -> Option<UL> {
        self.inner.container_ul()
    }
}

/// A source that concatenates the files of a file-set as one stream.
///
/// The active file's parser state is carried across the boundary: when the
/// current file is exhausted at a wrapping-unit boundary the next file is
/// opened and the parser re-validated against it.
pub struct SequentialSource {
    parser: Box<dyn EssenceSubParser>,
    file: Box<dyn ReadSeek>,
    fileset: crate::fileset::FileSet,
    wrapping: WrappingOption,
    stream: u32,
    /// Set when re_validate fails and the stream must end.
    exhausted: bool,
}

impl std::fmt::Debug for SequentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialSource")
            .field("stream", &self.stream)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl SequentialSource {
    /// Build from an already-identified parser, its first open file, and the
    /// file-set that supplies the remaining files.
    pub fn new(
        mut parser: Box<dyn EssenceSubParser>,
        file: Box<dyn ReadSeek>,
        fileset: crate::fileset::FileSet,
        stream: u32,
        wrapping: WrappingOption,
    ) -> Result<Self> {
        parser.use_wrapping(stream, &wrapping)?;
        Ok(SequentialSource {
            parser,
            file,
            fileset,
            wrapping,
            stream,
            exhausted: false,
        })
    }

    /// Move to the next file in the set. Returns false when none remain or
    /// the parser cannot continue into it.
    fn roll_over(&mut self) -> Result<bool> {
        let Some(next) = self.fileset.next_file()? else {
            return Ok(false);
        };
        log::debug!("file-set rolling over to {}", next.0.display());
        self.file = next.1;
        if !self.parser.re_validate(self.file.as_mut()) {
            log::warn!(
                "{} could not re-validate against {}; ending stream",
                self.parser.name(),
                next.0.display()
            );
            self.exhausted = true;
            return Ok(false);
        }
        Ok(true)
    }
}

impl EssenceSource for SequentialSource {
    fn data_size(&mut self) -> Result<usize> {
        self.parser.next_chunk_size(self.file.as_mut(), 0)
    }

    fn next_chunk(&mut self, size_hint: usize, max_size: usize) -> Result<Option<Vec<u8>>> {
        if self.exhausted {
            return Ok(None);
        }

        match self
            .parser
            .read_chunk(self.file.as_mut(), size_hint, max_size)?
        {
            Some(chunk) => Ok(Some(chunk)),
            None => {
                // Only roll files at wrapping-unit boundaries.
                if !self.parser.end_of_item() {
                    return Ok(None);
                }
                if !self.roll_over()? {
                    return Ok(None);
                }
                self.parser
                    .read_chunk(self.file.as_mut(), size_hint, max_size)
            }
        }
    }

    fn end_of_item(&self) -> bool {
        self.parser.end_of_item()
    }

    fn end_of_data(&self) -> bool {
        self.exhausted || (self.parser.end_of_data() && self.fileset.is_last_file())
    }

    fn edit_rate(&self) -> Rational {
        self.parser.edit_rate()
    }

    fn current_position(&mut self) -> i64 {
        self.parser.current_position()
    }

    fn gc_essence_type(&self) -> u8 {
        self.wrapping.gc_essence_type
    }

    fn gc_element_type(&self) -> u8 {
        self.wrapping.gc_element_type
    }

    fn ber_size(&self) -> usize {
        self.wrapping.ber_size as usize
    }

    fn bytes_per_edit_unit(&mut self, kag: u32) -> u32 {
        self.parser.bytes_per_edit_unit(kag)
    }

    fn can_index(&self) -> bool {
        self.parser.can_index()
    }

    fn set_index_observer(&mut self, observer: SharedIndexObserver, sub_stream: usize) {
        self.parser.set_index_observer(observer, sub_stream);
    }

    fn enable_vbr_index_mode(&mut self) {
        self.parser.enable_vbr_index_mode();
    }

    fn is_edit_point(&self) -> bool {
        self.parser.is_edit_point()
    }

    fn wrap_type(&self) -> WrapType {
        self.wrapping.wrap_type
    }

    fn container_ul(&self) -> Option<UL> {
        Some(self.wrapping.wrapping_ul)
    }
}

impl SequentialSource {
    /// The stream id this source was identified as.
    pub fn stream(&self) -> u32 {
        self.stream
    }
}
