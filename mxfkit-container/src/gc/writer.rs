//! The generic container writer.
//!
//! Manages the streams of one essence container (one BodySID): their keys,
//! their canonical write order, and the assembly of content packages.
//! Essence data is queued per stream and materialised by
//! [`flush`](GcWriter::flush) in write order, with KAG filler, index
//! callbacks and clip-wrap length back-patching handled on the way out.

use crate::index::manager::SharedIndexManager;
use mxfkit_core::klv::{ber_length_size, encode_ber, filler_size, write_filler};
use mxfkit_core::ul::{labels, UL};
use mxfkit_core::{MuxError, Result};
use mxfkit_essence::{IndexObserver, SharedEssenceSource};
use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom, Write};

/// Identifier of a stream within one GC writer.
pub type GcStreamId = u16;

/// Object-safe alias for the writable, seekable output sink.
pub trait WriteSeek: Write + Seek {}
impl<T: Write + Seek> WriteSeek for T {}

/// Canonical ordering rank of an item type byte: CP system, GC system,
/// CP picture, GC picture, CP sound, GC sound, CP data, GC data, compound.
fn type_rank(item_type: u8) -> u32 {
    match item_type {
        0x04 => 0,
        0x14 => 1,
        0x05 => 2,
        0x15 => 3,
        0x06 => 4,
        0x16 => 5,
        0x07 => 6,
        0x17 => 7,
        _ => 8,
    }
}

/// Compute the effective write order for default placement.
///
/// The 32-bit key space is divided into bands, two per item class: an odd
/// band for default placement and the adjacent even bands for streams
/// positioned relative to the class (before = the band below, after = the
/// band above). Within the default band, streams order by element type
/// then element number.
fn default_write_order(item_type: u8, element: u8, number: u8) -> u32 {
    let band = 2 * type_rank(item_type) + 1;
    (band << 27) | ((element as u32) << 12) | ((number as u32) << 4)
}

/// Compute the effective write order for relative placement.
fn relative_write_order(item_type: u8, position: i32) -> u32 {
    let rank = type_rank(item_type);
    let band = if position < 0 { 2 * rank } else { 2 * rank + 2 };
    (band << 27) | ((1u32 << 26).wrapping_add_signed(position) & 0x07FF_FFFF)
}

/// Index binding of one stream.
struct StreamIndex {
    manager: SharedIndexManager,
    sub_stream: usize,
    /// Include filler preceding the element in the indexed offset.
    index_filler: bool,
    /// Index clip-wrapped essence edit unit by edit unit.
    index_clip: bool,
}

/// Per-stream registration data.
struct GcStreamData {
    /// Complete key when one was specified, otherwise built on demand.
    specified_key: Option<UL>,
    /// The track-number bytes are not managed for non-GC keys.
    non_gc: bool,
    item_type: u8,
    /// Scheme ID for system items; element count for essence (set when the
    /// count is fixed).
    scheme_or_count: u8,
    /// Element identifier or type.
    element: u8,
    /// Sub ID for system items; element number for essence.
    sub_or_number: u8,
    /// Forced BER length size for this stream (0 = auto).
    len_size: usize,
    index: Option<StreamIndex>,
    /// Set once a key has been issued; the element count may no longer
    /// change.
    count_fixed: bool,
    write_order: u32,
}

/// Data queued for the current content package.
enum BlockData {
    Buffer(Vec<u8>),
    Source {
        source: SharedEssenceSource,
        fast_clip_wrap: bool,
    },
}

struct WriteBlock {
    stream: GcStreamId,
    data: BlockData,
}

/// Writes the essence of one generic container.
pub struct GcWriter {
    body_sid: u32,
    kag_size: u32,
    force_filler_ber4: bool,
    /// First element number issued to essence streams.
    stream_base: u8,
    streams: Vec<GcStreamData>,
    /// Effective write order to stream, to reject duplicates.
    write_order_map: BTreeMap<u32, GcStreamId>,
    /// Edit unit reported with index offsets for the current package.
    index_edit_unit: i64,
    /// Pre-charge still expected, carried into new index managers.
    pre_charge: i64,
    /// Offset within this essence container.
    stream_offset: u64,
    /// Pending blocks for the current content package, in write order.
    write_queue: BTreeMap<u32, WriteBlock>,
    /// False simulates a non-seekable sink, refusing FastClipWrap.
    seekable: bool,
}

impl GcWriter {
    /// Create a writer for one essence container.
    pub fn new(body_sid: u32) -> Self {
        GcWriter {
            body_sid,
            kag_size: 1,
            force_filler_ber4: false,
            stream_base: 1,
            streams: Vec::new(),
            write_order_map: BTreeMap::new(),
            index_edit_unit: 0,
            pre_charge: 0,
            stream_offset: 0,
            write_queue: BTreeMap::new(),
            seekable: true,
        }
    }

    /// The BodySID of this container.
    pub fn body_sid(&self) -> u32 {
        self.body_sid
    }

    /// Set the KAG for this container.
    pub fn set_kag(&mut self, kag: u32, force_ber4: bool) {
        self.kag_size = kag;
        self.force_filler_ber4 = force_ber4;
    }

    /// The current KAG.
    pub fn kag(&self) -> u32 {
        self.kag_size
    }

    /// Mark the sink as non-seekable; FastClipWrap will be refused.
    pub fn set_seekable(&mut self, seekable: bool) {
        self.seekable = seekable;
    }

    /// Current offset within this essence container.
    pub fn stream_offset(&self) -> u64 {
        self.stream_offset
    }

    /// Set the edit unit reported for the current content package.
    pub fn set_index_edit_unit(&mut self, edit_unit: i64) {
        self.index_edit_unit = edit_unit;
    }

    /// The edit unit of the current content package.
    pub fn index_edit_unit(&self) -> i64 {
        self.index_edit_unit
    }

    /// Record the pre-charge size so index managers can bias positions.
    pub fn set_pre_charge(&mut self, pre_charge: i64) {
        self.pre_charge = pre_charge;
        for stream in &self.streams {
            if let Some(index) = &stream.index {
                index.manager.borrow_mut().set_pre_charge(pre_charge);
            }
        }
    }

    fn add_stream(&mut self, data: GcStreamData) -> Result<GcStreamId> {
        let id = self.streams.len() as GcStreamId;
        let order = data.write_order;
        if let Some(&existing) = self.write_order_map.get(&order) {
            return Err(MuxError::WriteOrderClash {
                write_order: order,
                existing,
            }
            .into());
        }
        self.write_order_map.insert(order, id);
        self.streams.push(data);
        Ok(id)
    }

    /// Define a system element for this container.
    pub fn add_system_element(
        &mut self,
        cp_compatible: bool,
        registry_designator: u8,
        scheme_id: u8,
        element_id: u8,
        sub_id: u8,
    ) -> Result<GcStreamId> {
        let item_type = if cp_compatible { 0x04 } else { 0x14 };
        let mut key = labels::GC_SYSTEM_KEY_BASE;
        key[5] = registry_designator;
        key[12] = item_type;
        key[13] = scheme_id;
        key[14] = element_id;
        key[15] = sub_id;
        self.add_stream(GcStreamData {
            specified_key: Some(key),
            non_gc: false,
            item_type,
            scheme_or_count: scheme_id,
            element: element_id,
            sub_or_number: sub_id,
            len_size: 0,
            index: None,
            count_fixed: true,
            write_order: default_write_order(item_type, element_id, sub_id),
        })
    }

    /// Define a picture element (0x05 CP-compatible, 0x15 GC).
    pub fn add_picture_element(
        &mut self,
        cp_compatible: bool,
        element_type: u8,
    ) -> Result<GcStreamId> {
        self.add_essence_element(if cp_compatible { 0x05 } else { 0x15 }, element_type, 0)
    }

    /// Define a sound element (0x06 CP-compatible, 0x16 GC).
    pub fn add_sound_element(
        &mut self,
        cp_compatible: bool,
        element_type: u8,
    ) -> Result<GcStreamId> {
        self.add_essence_element(if cp_compatible { 0x06 } else { 0x16 }, element_type, 0)
    }

    /// Define a data element (0x07 CP-compatible, 0x17 GC).
    pub fn add_data_element(
        &mut self,
        cp_compatible: bool,
        element_type: u8,
    ) -> Result<GcStreamId> {
        self.add_essence_element(if cp_compatible { 0x07 } else { 0x17 }, element_type, 0)
    }

    /// Define a compound element (0x18).
    pub fn add_compound_element(&mut self, element_type: u8) -> Result<GcStreamId> {
        self.add_essence_element(0x18, element_type, 0)
    }

    /// Define an essence element from its item and element type bytes.
    pub fn add_essence_element(
        &mut self,
        essence_type: u8,
        element_type: u8,
        len_size: usize,
    ) -> Result<GcStreamId> {
        let number = self.next_element_number(essence_type);
        self.add_stream(GcStreamData {
            specified_key: None,
            non_gc: false,
            item_type: essence_type,
            scheme_or_count: 0,
            element: element_type,
            sub_or_number: number,
            len_size,
            index: None,
            count_fixed: false,
            write_order: default_write_order(essence_type, element_type, number),
        })
    }

    /// Define an essence element with a caller-specified key.
    ///
    /// With `non_gc` set the track-number bytes of the key are left alone.
    pub fn add_essence_element_with_key(
        &mut self,
        key: UL,
        len_size: usize,
        non_gc: bool,
    ) -> Result<GcStreamId> {
        let item_type = key[12];
        let number = self.next_element_number(item_type);
        self.add_stream(GcStreamData {
            specified_key: Some(key),
            non_gc,
            item_type,
            scheme_or_count: key[13],
            element: key[14],
            sub_or_number: if non_gc { key[15] } else { number },
            len_size,
            index: None,
            count_fixed: non_gc,
            write_order: default_write_order(item_type, key[14], number),
        })
    }

    fn next_element_number(&self, item_type: u8) -> u8 {
        let ordinal = self
            .streams
            .iter()
            .filter(|s| s.item_type == item_type)
            .count() as u8;
        self.stream_base + ordinal
    }

    /// Bind a stream to an index manager sub-stream.
    pub fn add_stream_index(
        &mut self,
        id: GcStreamId,
        manager: SharedIndexManager,
        sub_stream: usize,
        index_filler: bool,
        index_clip: bool,
    ) -> Result<()> {
        let stream = self
            .streams
            .get_mut(id as usize)
            .ok_or(MuxError::UnknownStream(id))?;
        stream.index = Some(StreamIndex {
            manager,
            sub_stream,
            index_filler,
            index_clip,
        });
        Ok(())
    }

    /// Fix the element count of a stream and return its key.
    fn fixed_key(&mut self, id: GcStreamId) -> Result<UL> {
        let item_type = self
            .streams
            .get(id as usize)
            .ok_or(MuxError::UnknownStream(id))?
            .item_type;

        if self.streams[id as usize].non_gc {
            if let Some(key) = self.streams[id as usize].specified_key {
                return Ok(key);
            }
        }

        if !self.streams[id as usize].count_fixed {
            let count = self
                .streams
                .iter()
                .filter(|s| s.item_type == item_type)
                .count() as u8;
            let stream = &mut self.streams[id as usize];
            stream.scheme_or_count = count;
            stream.count_fixed = true;
        }

        let stream = &self.streams[id as usize];
        let mut key = stream.specified_key.unwrap_or(labels::GC_ESSENCE_KEY_BASE);
        key[12] = stream.item_type;
        key[13] = stream.scheme_or_count;
        key[14] = stream.element;
        key[15] = stream.sub_or_number;
        Ok(key)
    }

    /// The GC track number of a stream (fixes its element count).
    pub fn track_number(&mut self, id: GcStreamId) -> Result<u32> {
        let key = self.fixed_key(id)?;
        Ok(u32::from_be_bytes([key[12], key[13], key[14], key[15]]))
    }

    /// Override the write order of a stream with a raw 32-bit value.
    pub fn set_write_order(&mut self, id: GcStreamId, order: u32) -> Result<()> {
        let stream = self
            .streams
            .get(id as usize)
            .ok_or(MuxError::UnknownStream(id))?;
        if let Some(&existing) = self.write_order_map.get(&order) {
            if existing != id {
                return Err(MuxError::WriteOrderClash {
                    write_order: order,
                    existing,
                }
                .into());
            }
        }
        self.write_order_map.remove(&stream.write_order);
        self.write_order_map.insert(order, id);
        self.streams[id as usize].write_order = order;
        Ok(())
    }

    /// Position a stream relative to all items of a given type.
    ///
    /// A negative `position` places it before every item of `item_type`
    /// (more negative = earlier); positive places it after.
    pub fn set_relative_write_order(
        &mut self,
        id: GcStreamId,
        item_type: u8,
        position: i32,
    ) -> Result<()> {
        self.set_write_order(id, relative_write_order(item_type, position))
    }

    /// The effective write order of a stream.
    pub fn write_order(&self, id: GcStreamId) -> Option<u32> {
        self.streams.get(id as usize).map(|s| s.write_order)
    }

    /// Number of registered streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Queue system item data for the current content package.
    pub fn add_system_data(&mut self, id: GcStreamId, data: Vec<u8>) -> Result<()> {
        self.queue_block(id, BlockData::Buffer(data))
    }

    /// Queue essence data for the current content package.
    pub fn add_essence_data(&mut self, id: GcStreamId, data: Vec<u8>) -> Result<()> {
        self.queue_block(id, BlockData::Buffer(data))
    }

    /// Queue a whole essence source (clip wrapping).
    ///
    /// With `fast_clip_wrap` the value length is written as the maximum
    /// 8-byte BER, the data streamed, and the length patched afterwards;
    /// this needs a seekable sink. Without it the source is pre-buffered.
    pub fn add_essence_source(
        &mut self,
        id: GcStreamId,
        source: SharedEssenceSource,
        fast_clip_wrap: bool,
    ) -> Result<()> {
        if fast_clip_wrap && !self.seekable {
            return Err(MuxError::NonSeekableFastClip.into());
        }
        self.queue_block(
            id,
            BlockData::Source {
                source,
                fast_clip_wrap,
            },
        )
    }

    fn queue_block(&mut self, id: GcStreamId, data: BlockData) -> Result<()> {
        let stream = self
            .streams
            .get(id as usize)
            .ok_or(MuxError::UnknownStream(id))?;
        self.write_queue
            .insert(stream.write_order, WriteBlock { stream: id, data });
        Ok(())
    }

    /// True when essence is queued for the current content package.
    pub fn has_pending_data(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// Bytes that [`flush`](GcWriter::flush) would write now.
    pub fn calc_write_size(&mut self) -> Result<u64> {
        let mut total = 0u64;
        let orders: Vec<u32> = self.write_queue.keys().copied().collect();
        for order in orders {
            let (stream_id, size) = {
                let block = self.write_queue.get_mut(&order).unwrap();
                let size = match &mut block.data {
                    BlockData::Buffer(data) => data.len() as u64,
                    BlockData::Source { source, .. } => source.borrow_mut().data_size()? as u64,
                };
                (block.stream, size)
            };

            if self.kag_size > 1 {
                let offset = self.stream_offset + total;
                total += filler_size(offset, self.kag_size, self.force_filler_ber4)?;
            }
            let len_size = self.effective_len_size(stream_id, size);
            total += 16 + len_size as u64 + size;
        }
        Ok(total)
    }

    fn effective_len_size(&self, id: GcStreamId, length: u64) -> usize {
        let configured = self.streams[id as usize].len_size;
        if configured != 0 {
            configured
        } else {
            ber_length_size(length)
        }
    }

    /// Begin a new content package, flushing the previous one.
    pub fn start_new_cp(&mut self, sink: &mut dyn WriteSeek) -> Result<()> {
        if self.has_pending_data() {
            self.flush(sink)?;
            self.index_edit_unit += 1;
        }
        Ok(())
    }

    /// Write out every queued block of the current content package, in
    /// write order.
    pub fn flush(&mut self, sink: &mut dyn WriteSeek) -> Result<()> {
        let orders: Vec<u32> = self.write_queue.keys().copied().collect();
        for order in orders {
            let block = self.write_queue.remove(&order).unwrap();
            match block.data {
                BlockData::Buffer(data) => self.write_buffer_block(sink, block.stream, data)?,
                BlockData::Source {
                    source,
                    fast_clip_wrap,
                } => self.write_source_block(sink, block.stream, source, fast_clip_wrap)?,
            }
        }
        Ok(())
    }

    /// Align to the KAG, returning (bytes written, offset of the filler).
    fn align_kag(&mut self, sink: &mut dyn WriteSeek) -> Result<(u64, u64)> {
        let filler_at = self.stream_offset;
        if self.kag_size > 1 {
            let written =
                write_filler(sink, self.stream_offset, self.kag_size, self.force_filler_ber4)?;
            self.stream_offset += written;
            return Ok((written, filler_at));
        }
        Ok((0, filler_at))
    }

    fn write_buffer_block(
        &mut self,
        sink: &mut dyn WriteSeek,
        id: GcStreamId,
        data: Vec<u8>,
    ) -> Result<()> {
        let (_, filler_at) = self.align_kag(sink)?;
        let key = self.fixed_key(id)?;
        let key_at = self.stream_offset;

        sink.write_all(&key)?;
        let len_size = self.effective_len_size(id, data.len() as u64);
        let len_bytes = encode_ber(data.len() as u64, len_size)?;
        sink.write_all(&len_bytes)?;
        let value_at = key_at + 16 + len_bytes.len() as u64;

        // The index callback fires once the key and length are known.
        let stream = &self.streams[id as usize];
        if let Some(index) = &stream.index {
            let offset = if index.manager.borrow().value_relative_indexing() {
                value_at
            } else if index.index_filler {
                filler_at
            } else {
                key_at
            };
            index.manager.borrow_mut().offer_offset(
                index.sub_stream,
                self.index_edit_unit,
                offset,
                0,
                None,
            );
        }

        sink.write_all(&data)?;
        self.stream_offset = value_at + data.len() as u64;
        Ok(())
    }

    fn write_source_block(
        &mut self,
        sink: &mut dyn WriteSeek,
        id: GcStreamId,
        source: SharedEssenceSource,
        fast_clip_wrap: bool,
    ) -> Result<()> {
        let (_, filler_at) = self.align_kag(sink)?;
        let key = self.fixed_key(id)?;
        let key_at = self.stream_offset;

        // Indexed clips must yield one edit unit per chunk.
        let indexed_clip = {
            let stream = &self.streams[id as usize];
            match &stream.index {
                Some(index) if index.index_clip => {
                    source.borrow_mut().enable_vbr_index_mode();
                    true
                }
                _ => false,
            }
        };

        if fast_clip_wrap {
            sink.write_all(&key)?;
            // The largest 8-byte BER length keeps a concurrent reader from
            // running off the end while the file is still growing.
            sink.write_all(&encode_ber((1u64 << 56) - 1, 8)?)?;
            let value_at = key_at + 16 + 8;

            let total =
                self.stream_value(sink, id, &source, indexed_clip, filler_at, key_at, value_at)?;

            // Seek back over the value to rewrite the 8-byte length field.
            let end = sink.stream_position()?;
            sink.seek(SeekFrom::Start(end - total - 8))?;
            sink.write_all(&encode_ber(total, 8)?)?;
            sink.seek(SeekFrom::Start(end))?;

            self.stream_offset = value_at + total;
        } else {
            // Without random access the whole value is buffered so the real
            // length can precede it.
            let mut value = Vec::new();
            let mut unit_offsets = Vec::new();
            {
                let mut src = source.borrow_mut();
                let mut at_unit_start = true;
                loop {
                    if at_unit_start {
                        unit_offsets.push(value.len() as u64);
                    }
                    match src.next_chunk(0, 0)? {
                        Some(chunk) => {
                            value.extend_from_slice(&chunk);
                            at_unit_start = src.end_of_item();
                        }
                        None => {
                            unit_offsets.pop();
                            break;
                        }
                    }
                }
            }

            sink.write_all(&key)?;
            let len_size = self.effective_len_size(id, value.len() as u64);
            let len_bytes = encode_ber(value.len() as u64, len_size)?;
            sink.write_all(&len_bytes)?;
            let value_at = key_at + 16 + len_bytes.len() as u64;
            sink.write_all(&value)?;

            if indexed_clip {
                let stream = &self.streams[id as usize];
                if let Some(index) = &stream.index {
                    let value_relative = index.manager.borrow().value_relative_indexing();
                    let base = if value_relative {
                        value_at
                    } else if index.index_filler {
                        filler_at
                    } else {
                        key_at
                    };
                    let mut manager = index.manager.borrow_mut();
                    for (unit, at) in unit_offsets.iter().enumerate() {
                        manager.offer_offset(
                            index.sub_stream,
                            self.index_edit_unit + unit as i64,
                            base + at,
                            0,
                            None,
                        );
                    }
                }
            }

            self.stream_offset = value_at + value.len() as u64;
        }

        Ok(())
    }

    /// Stream a source's value bytes, reporting per-edit-unit offsets for
    /// indexed clips. Returns the number of value bytes written.
    #[allow(clippy::too_many_arguments)]
    fn stream_value(
        &mut self,
        sink: &mut dyn WriteSeek,
        id: GcStreamId,
        source: &SharedEssenceSource,
        indexed_clip: bool,
        filler_at: u64,
        key_at: u64,
        value_at: u64,
    ) -> Result<u64> {
        let mut total = 0u64;
        let mut at_unit_start = true;
        let mut edit_unit = self.index_edit_unit;

        loop {
            if at_unit_start && indexed_clip {
                let stream = &self.streams[id as usize];
                if let Some(index) = &stream.index {
                    let value_relative = index.manager.borrow().value_relative_indexing();
                    let base = if value_relative {
                        value_at
                    } else if index.index_filler {
                        filler_at
                    } else {
                        key_at
                    };
                    index.manager.borrow_mut().offer_offset(
                        index.sub_stream,
                        edit_unit,
                        base + total,
                        0,
                        None,
                    );
                    edit_unit += 1;
                }
            }

            let chunk = source.borrow_mut().next_chunk(0, 0)?;
            match chunk {
                Some(chunk) => {
                    sink.write_all(&chunk)?;
                    total += chunk.len() as u64;
                    at_unit_start = source.borrow().end_of_item();
                }
                None => break,
            }
        }

        Ok(total)
    }
}
