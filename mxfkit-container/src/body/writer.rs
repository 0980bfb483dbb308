//! The body writer.
//!
//! Schedules the partitions of an output file: the header partition with
//! its metadata, body partitions carrying essence and (as requested per
//! stream) index table segments, isolated index partitions, the footer
//! and the random index pack.
//!
//! The writer walks Start → Header → Body → Footer → Done. Within the body
//! it visits the active streams in registration order; each stream's own
//! state (see [`BodyStream`]) decides whether the next partition for it
//! carries essence, an index chunk, or both.
//!
//! Because a partition pack names the BodySID of the essence that follows
//! it, the pack for an essence partition is staged, the essence written,
//! and the pack re-tagged as metadata-only in place if the essence write
//! produced nothing.

use crate::body::stream::{BodyStream, StreamIndexFlags, StreamState};
use crate::gc::writer::GcWriter;
use crate::index::table::INDEX_LOWEST;
use crate::partition::{Partition, PartitionCompleteness, PartitionKind, PartitionStatus, RandomIndexPack};
use mxfkit_core::klv::{filler_size, write_filler_exact, MIN_KLV_SIZE_BER4, MIN_KLV_SIZE_SHORT};
use mxfkit_core::ul::UL;
use mxfkit_core::{MuxError, Result, WriterConfig};
use mxfkit_essence::{SharedEssenceSource, WrapType};
use std::io::{Seek, SeekFrom, Write};

/// Offset of the FooterPartition field within a partition pack KLV:
/// key (16) + BER (4) + versions (4) + KAGSize (4) + ThisPartition (8) +
/// PreviousPartition (8).
const FOOTER_FIELD_OFFSET: u64 = 44;

/// Overall writer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Start,
    Header,
    Body,
    Footer,
    Done,
}

/// Medium-term data about one stream being written.
struct StreamInfo {
    active: bool,
    stream: BodyStream,
    /// Stop writing this stream after this many edit units (0 = no limit).
    stop_after: i64,
    /// Edit units written so far.
    written: i64,
}

/// Multiplexes body streams into a partitioned file.
pub struct BodyWriter<W: Write + Seek> {
    file: W,
    config: WriterConfig,
    state: WriterState,
    streams: Vec<StreamInfo>,
    header_metadata: Vec<u8>,
    previous_partition: u64,
    /// Pack offsets for footer back-patching.
    pack_offsets: Vec<u64>,
    /// (BodySID, offset) pairs for the random index pack.
    rip_entries: Vec<(u32, u64)>,
    /// BodySIDs whose header CBR table was embedded in the header
    /// partition.
    head_index_embedded: Vec<u32>,
    /// The current partition may take no more essence.
    partition_done: bool,
}

impl<W: Write + Seek> BodyWriter<W> {
    /// Create a body writer over a sink.
    pub fn new(file: W, config: WriterConfig) -> Self {
        BodyWriter {
            file,
            config,
            state: WriterState::Start,
            streams: Vec::new(),
            header_metadata: Vec::new(),
            previous_partition: 0,
            pack_offsets: Vec::new(),
            rip_entries: Vec::new(),
            head_index_embedded: Vec::new(),
            partition_done: false,
        }
    }

    /// Recover the sink.
    pub fn into_inner(self) -> W {
        self.file
    }

    /// Provide the header metadata blob (primer pack and metadata sets),
    /// written into the header partition and wherever metadata is repeated.
    pub fn set_header_metadata(&mut self, metadata: Vec<u8>) {
        self.header_metadata = metadata;
    }

    /// Add a stream to write. Streams are visited in registration order.
    pub fn add_stream(&mut self, stream: BodyStream, stop_after: i64) -> Result<()> {
        if self
            .streams
            .iter()
            .any(|info| info.stream.body_sid() == stream.body_sid())
        {
            return Err(MuxError::DuplicateBodySid(stream.body_sid()).into());
        }
        self.streams.push(StreamInfo {
            active: true,
            stream,
            stop_after,
            written: 0,
        });
        Ok(())
    }

    /// Access a stream by BodySID.
    pub fn stream(&self, body_sid: u32) -> Option<&BodyStream> {
        self.streams
            .iter()
            .find(|info| info.stream.body_sid() == body_sid)
            .map(|info| &info.stream)
    }

    /// True once every body partition has been written.
    pub fn body_done(&self) -> bool {
        matches!(self.state, WriterState::Footer | WriterState::Done)
            || self.streams.iter().all(|info| !info.active)
    }

    /// Labels of every essence container carried by the registered streams.
    fn essence_container_labels(&self) -> Vec<UL> {
        let mut labels = Vec::new();
        for info in &self.streams {
            for source in info.stream.sources() {
                if let Some(ul) = source.borrow().container_ul() {
                    if !labels.contains(&ul) {
                        labels.push(ul);
                    }
                }
            }
        }
        labels
    }

    fn base_partition(&self, kind: PartitionKind) -> Partition {
        let mut pack = match kind {
            PartitionKind::Header => Partition::header(),
            PartitionKind::Body => Partition::body(),
            PartitionKind::Footer => Partition::footer(),
        };
        pack.kag_size = self.config.kag_size.max(1);
        pack.essence_containers = self.essence_container_labels();
        pack
    }

    /// Write a partition pack plus its metadata and index regions.
    ///
    /// Byte counts and filler are computed so the pack fields are correct
    /// before anything hits the file. Returns the pack's offset and the
    /// pack exactly as written (for in-place re-tagging).
    fn commit_partition(
        &mut self,
        mut pack: Partition,
        metadata: bool,
        index_data: Option<&[u8]>,
        before_essence: bool,
    ) -> Result<(u64, Partition)> {
        let at = self.file.stream_position()?;
        pack.this_partition = at;
        pack.previous_partition = self.previous_partition;

        let kag = pack.kag_size;
        let force_ber4 = self.config.force_ber4;

        // All region sizes are known up front; KAG positions are relative
        // to the start of the partition pack.
        let mut position = pack.size() as u64;

        let metadata_fill = if metadata && !self.header_metadata.is_empty() {
            let fill = filler_size(position + self.header_metadata.len() as u64, kag, force_ber4)?;
            pack.header_byte_count = self.header_metadata.len() as u64 + fill;
            position += pack.header_byte_count;
            fill
        } else {
            pack.header_byte_count = 0;
            0
        };

        let index_fill = if let Some(index) = index_data {
            let fill = filler_size(position + index.len() as u64, kag, force_ber4)?;
            pack.index_byte_count = index.len() as u64 + fill;
            position += pack.index_byte_count;
            fill
        } else {
            pack.index_byte_count = 0;
            0
        };

        // Space reserved for later metadata growth, plus the pre-essence
        // filler floor.
        let mut final_fill = 0u64;
        if before_essence {
            let mut want = self.config.min_partition_filler as u64;
            if (self.config.min_partition_size as u64) > position {
                want = want.max(self.config.min_partition_size as u64 - position);
            }
            let mut fill = filler_size(position, kag, force_ber4)?;
            if want > 0 {
                let min = if force_ber4 {
                    MIN_KLV_SIZE_BER4
                } else {
                    MIN_KLV_SIZE_SHORT
                };
                if fill < want.max(min) {
                    let step = kag.max(1) as u64;
                    if fill == 0 {
                        fill = want.max(min);
                        // keep the KAG law intact
                        let rem = (position + fill) % step;
                        if rem != 0 {
                            fill += step - rem;
                        }
                    } else {
                        while fill < want.max(min) {
                            fill += step;
                        }
                    }
                }
            }
            final_fill = fill;
        }

        pack.write(&mut self.file)?;
        if metadata && !self.header_metadata.is_empty() {
            self.file.write_all(&self.header_metadata)?;
            if metadata_fill > 0 {
                write_filler_exact(&mut self.file, metadata_fill, force_ber4)?;
            }
        }
        if let Some(index) = index_data {
            self.file.write_all(index)?;
            if index_fill > 0 {
                write_filler_exact(&mut self.file, index_fill, force_ber4)?;
            }
        }
        if final_fill > 0 {
            write_filler_exact(&mut self.file, final_fill, force_ber4)?;
        }

        self.previous_partition = at;
        self.pack_offsets.push(at);
        self.rip_entries.push((pack.body_sid, at));
        self.partition_done = false;
        Ok((at, pack))
    }

    /// Rewrite a previously written pack in place (same geometry) to
    /// reflect a different BodySID.
    fn retag_partition(&mut self, at: u64, pack: &Partition) -> Result<()> {
        let here = self.file.stream_position()?;
        self.file.seek(SeekFrom::Start(at))?;
        pack.write(&mut self.file)?;
        self.file.seek(SeekFrom::Start(here))?;
        for entry in self.rip_entries.iter_mut() {
            if entry.1 == at {
                entry.0 = pack.body_sid;
            }
        }
        Ok(())
    }

    /// Write the header partition (metadata and, when sharing permits, the
    /// first header CBR index table).
    pub fn write_header(&mut self, closed: bool, complete: bool) -> Result<()> {
        debug_assert_eq!(self.state, WriterState::Start);

        let mut pack = self.base_partition(PartitionKind::Header);
        pack.status = if closed {
            PartitionStatus::Closed
        } else {
            PartitionStatus::Open
        };
        pack.completeness = if complete {
            PartitionCompleteness::Complete
        } else {
            PartitionCompleteness::Incomplete
        };

        // One header CBR table may share the partition with metadata.
        let mut index_blob = None;
        if self.config.index_shares_with_metadata {
            for i in 0..self.streams.len() {
                let flags = self.streams[i].stream.index_flags();
                if flags.contains(StreamIndexFlags::CBR_HEADER) {
                    self.ensure_writer(i)?;
                    let sid = self.streams[i].stream.body_sid();
                    let blob = self.build_cbr_index(i)?;
                    pack.index_sid = self.streams[i].stream.index_sid();
                    index_blob = Some(blob);
                    self.head_index_embedded.push(sid);
                    break;
                }
            }
        }

        self.commit_partition(pack, true, index_blob.as_deref(), true)?;
        self.state = WriterState::Header;
        Ok(())
    }

    /// End the current partition: no more essence may be added to it.
    pub fn end_partition(&mut self) {
        self.partition_done = true;
    }

    /// Write body partitions until every stream is finished, or per-call
    /// caps are reached.
    ///
    /// `duration` > 0 caps the edit units written per stream in this call;
    /// `max_partition_size` > 0 asks the writer to start a new partition
    /// once a partition's essence exceeds that many bytes.
    pub fn write_body(&mut self, duration: i64, max_partition_size: u64) -> Result<()> {
        if self.state == WriterState::Start {
            self.write_header(false, false)?;
        }
        self.state = WriterState::Body;

        loop {
            let mut acted = false;

            for i in 0..self.streams.len() {
                if !self.streams[i].active {
                    continue;
                }
                self.ensure_writer(i)?;

                let state = match self.streams[i].stream.state() {
                    StreamState::Start => self.streams[i].stream.next_state(),
                    state => state,
                };

                match state {
                    StreamState::HeadIndex => {
                        let sid = self.streams[i].stream.body_sid();
                        if !self.head_index_embedded.contains(&sid) {
                            let blob = self.build_cbr_index(i)?;
                            self.write_index_partition(i, &blob)?;
                        }
                        self.streams[i].stream.next_state();
                    }
                    StreamState::PreBodyIndex => {
                        let blob = self.build_cbr_index(i)?;
                        self.write_index_partition(i, &blob)?;
                        self.streams[i].stream.next_state();
                    }
                    StreamState::PostBodyIndex => {
                        let blob = self.build_post_body_index(i)?;
                        self.write_index_partition(i, &blob)?;
                        self.streams[i].stream.next_state();
                    }
                    StreamState::BodyWithIndex | StreamState::BodyNoIndex => {
                        self.write_essence_partition(i, state, duration, max_partition_size)?;
                        self.streams[i].stream.next_state();
                    }
                    StreamState::FootIndex | StreamState::Done => {
                        self.streams[i].active = false;
                    }
                    StreamState::Start => unreachable!("next_state() never returns Start"),
                }
                acted = true;
            }

            if !acted || duration > 0 {
                break;
            }
            if self.streams.iter().all(|info| !info.active) {
                break;
            }
        }

        Ok(())
    }

    /// Write one essence partition for a stream.
    fn write_essence_partition(
        &mut self,
        i: usize,
        state: StreamState,
        duration: i64,
        max_partition_size: u64,
    ) -> Result<()> {
        // Index data carried inside the partition, before the essence.
        let index_blob = if state == StreamState::BodyWithIndex {
            let flags = self.streams[i].stream.index_flags();
            if flags.contains(StreamIndexFlags::CBR_BODY) {
                Some(self.build_cbr_index(i)?)
            } else if flags.contains(StreamIndexFlags::SPRINKLED) {
                let blob = self.build_sprinkled_chunk(i)?;
                if blob.is_empty() {
                    None
                } else {
                    Some(blob)
                }
            } else {
                None
            }
        } else {
            None
        };

        let mut pack = self.base_partition(PartitionKind::Body);
        pack.body_sid = self.streams[i].stream.body_sid();
        pack.index_sid = if index_blob.is_some() {
            self.streams[i].stream.index_sid()
        } else {
            0
        };
        pack.body_offset = self.streams[i]
            .stream
            .writer_mut()
            .map(|w| w.stream_offset())
            .unwrap_or(0);
        let (pack_at, mut committed) =
            self.commit_partition(pack, false, index_blob.as_deref(), true)?;

        let written = self.write_essence(i, duration, max_partition_size)?;

        if written == 0 {
            // The essence write came to nothing: this partition carries
            // metadata (or index) only.
            committed.body_sid = 0;
            committed.body_offset = 0;
            self.retag_partition(pack_at, &committed)?;
        }

        Ok(())
    }

    /// Pull essence from a stream's sources into its container writer.
    ///
    /// Returns the number of edit units written (clip wraps count the
    /// whole clip as its duration in edit units).
    fn write_essence(
        &mut self,
        i: usize,
        duration: i64,
        max_partition_size: u64,
    ) -> Result<i64> {
        let sources: Vec<SharedEssenceSource> =
            self.streams[i].stream.sources().to_vec();
        let element_ids = self.streams[i].stream.element_ids().to_vec();
        let wrap = self.streams[i].stream.wrap_type();
        let fast_clip = self.config.fast_clip_wrap;
        let stop_after = self.streams[i].stop_after;

        if wrap == WrapType::Clip {
            if sources[0].borrow().end_of_data() {
                self.streams[i].stream.set_end_of_stream(true);
                return Ok(0);
            }
            // The whole clip is one wrapping unit.
            let edit_unit = sources[0].borrow_mut().current_position();
            let mut wrote = 0i64;
            {
                let info = &mut self.streams[i];
                let gc = info.stream.writer_mut().expect("writer installed");
                gc.set_index_edit_unit(edit_unit);
                for (source, &id) in sources.iter().zip(element_ids.iter()) {
                    gc.add_essence_source(id, source.clone(), fast_clip)?;
                }
                gc.flush(&mut self.file)?;
            }
            let end_position = sources[0].borrow_mut().current_position();
            wrote += end_position - edit_unit;
            let info = &mut self.streams[i];
            info.written += wrote;
            info.stream.set_end_of_stream(true);
            return Ok(wrote);
        }

        let partition_start = self.streams[i]
            .stream
            .writer_mut()
            .expect("writer installed")
            .stream_offset();

        let mut wrote = 0i64;
        loop {
            if self.partition_done {
                break;
            }

            // Stop when the master is exhausted.
            if sources[0].borrow().end_of_data() {
                self.streams[i].stream.set_end_of_stream(true);
                break;
            }

            let edit_unit = sources[0].borrow_mut().current_position();

            // One content package: one wrapping unit from every source.
            let mut units: Vec<Option<Vec<u8>>> = Vec::with_capacity(sources.len());
            let mut exhausted = false;
            for source in &sources {
                match pull_unit(source) {
                    Ok(unit) => units.push(unit),
                    Err(e) if e.is_recoverable() => {
                        log::warn!("stream {} ended early: {}", self.streams[i].stream.body_sid(), e);
                        exhausted = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if exhausted || units.first().map(|u| u.is_none()).unwrap_or(true) {
                self.streams[i].stream.set_end_of_stream(true);
                break;
            }

            // Sources that ended before the others fill their wrapping
            // units with their padding, or a zero-length KLV.
            let mut blocks = Vec::with_capacity(units.len());
            for (unit, source) in units.into_iter().zip(sources.iter()) {
                match unit {
                    Some(data) => blocks.push(data),
                    None => blocks.push(source.borrow_mut().padding().unwrap_or_default()),
                }
            }

            {
                let info = &mut self.streams[i];
                let gc = info.stream.writer_mut().expect("writer installed");
                gc.set_index_edit_unit(edit_unit);
                for (data, &id) in blocks.into_iter().zip(element_ids.iter()) {
                    gc.add_essence_data(id, data)?;
                }
                gc.flush(&mut self.file)?;
                info.stream.decrement_precharge();
            }

            wrote += 1;
            self.streams[i].written += 1;

            if duration > 0 && wrote >= duration {
                break;
            }
            if stop_after > 0 && self.streams[i].written >= stop_after {
                self.streams[i].stream.set_end_of_stream(true);
                break;
            }
            if max_partition_size > 0 {
                let in_partition = self.streams[i]
                    .stream
                    .writer_mut()
                    .expect("writer installed")
                    .stream_offset()
                    - partition_start;
                if in_partition >= max_partition_size {
                    break;
                }
            }
        }

        Ok(wrote)
    }

    /// Write an isolated (metadata-free, essence-free) index partition.
    fn write_index_partition(&mut self, i: usize, index: &[u8]) -> Result<()> {
        let mut pack = self.base_partition(PartitionKind::Body);
        pack.body_sid = 0;
        pack.index_sid = self.streams[i].stream.index_sid();
        self.commit_partition(pack, false, Some(index), false)?;
        Ok(())
    }

    /// Serialise a CBR index table for a stream.
    fn build_cbr_index(&mut self, i: usize) -> Result<Vec<u8>> {
        let info = &mut self.streams[i];
        let manager = info.stream.index_manager();
        let mut manager = manager.borrow_mut();
        manager.set_index_duration(info.written);
        let table = manager.make_index();
        let mut blob = Vec::new();
        table.write_segments(&mut blob, self.config.neg_precharge_index)?;
        Ok(blob)
    }

    /// Serialise the next sprinkled VBR chunk for a stream.
    fn build_sprinkled_chunk(&mut self, i: usize) -> Result<Vec<u8>> {
        let (manager, from) = {
            let info = &mut self.streams[i];
            (info.stream.index_manager(), info.stream.next_sprinkled())
        };
        let mut mgr = manager.borrow_mut();
        let mut table = mgr.make_index();
        // Entries stay in stream order; lookups undo the reordering via the
        // temporal offsets.
        let committed = mgr.add_entries_to_index(false, &mut table, from, i64::MAX)?;
        if committed == 0 {
            return Ok(Vec::new());
        }
        let mut blob = Vec::new();
        table.write_segments(&mut blob, self.config.neg_precharge_index)?;
        self.streams[i]
            .stream
            .set_next_sprinkled(from + committed as i64);
        Ok(blob)
    }

    /// Serialise the index data for a post-body isolated partition.
    fn build_post_body_index(&mut self, i: usize) -> Result<Vec<u8>> {
        let flags = self.streams[i].stream.index_flags();
        if flags.contains(StreamIndexFlags::SPRINKLED_ISOLATED) {
            self.build_sprinkled_chunk(i)
        } else {
            self.build_cbr_index(i)
        }
    }

    /// Serialise a stream's footer index table (full, sparse or CBR).
    fn build_footer_index(&mut self, i: usize) -> Result<Vec<u8>> {
        let flags = self.streams[i].stream.index_flags();
        if flags.contains(StreamIndexFlags::CBR_FOOTER) {
            return self.build_cbr_index(i);
        }

        let manager = self.streams[i].stream.index_manager();
        let mut mgr = manager.borrow_mut();
        let mut table = mgr.make_index();

        if flags.contains(StreamIndexFlags::SPARSE_FOOTER) {
            let sparse: Vec<i64> = self.streams[i].stream.sparse_list.clone();
            for position in sparse {
                mgr.add_entries_to_index(false, &mut table, position, position)?;
            }
        } else if flags.contains(StreamIndexFlags::SPRINKLED) {
            // Finish the sprinkle: everything not yet emitted.
            let from = self.streams[i].stream.next_sprinkled();
            mgr.add_entries_to_index(false, &mut table, from, i64::MAX)?;
        } else {
            mgr.add_entries_to_index(false, &mut table, INDEX_LOWEST, i64::MAX)?;
        }

        let mut blob = Vec::new();
        table.write_segments(&mut blob, self.config.neg_precharge_index)?;
        Ok(blob)
    }

    /// Write pre-footer index partitions, the footer partition, and the
    /// random index pack, then back-patch every pack's footer pointer.
    pub fn write_footer(&mut self, write_metadata: bool, complete: bool) -> Result<()> {
        self.state = WriterState::Footer;

        // Streams whose index belongs in (or just before) the footer.
        let footer_streams: Vec<usize> = (0..self.streams.len())
            .filter(|&i| {
                self.streams[i].stream.state() == StreamState::FootIndex
                    || (self.streams[i].stream.index_flags().wants_footer_index()
                        && self.streams[i].stream.state() != StreamState::Done)
            })
            .collect();

        // The first one rides in the footer partition itself; the others
        // take isolated partitions just before it.
        for &i in footer_streams.iter().skip(1) {
            let blob = self.build_footer_index(i)?;
            self.write_index_partition(i, &blob)?;
            self.streams[i].stream.set_state(StreamState::Done);
        }

        let mut pack = self.base_partition(PartitionKind::Footer);
        pack.status = PartitionStatus::Closed;
        pack.completeness = if complete {
            PartitionCompleteness::Complete
        } else {
            PartitionCompleteness::Incomplete
        };

        let footer_blob = match footer_streams.first() {
            Some(&i) => {
                pack.index_sid = self.streams[i].stream.index_sid();
                self.streams[i].stream.set_state(StreamState::Done);
                Some(self.build_footer_index(i)?)
            }
            None => None,
        };

        let footer_at = self.file.stream_position()?;
        pack.footer_partition = footer_at;
        self.commit_partition(pack, write_metadata, footer_blob.as_deref(), false)?;

        // Random index pack, then the footer offset into every pack.
        let mut rip = RandomIndexPack::new();
        for &(sid, offset) in &self.rip_entries {
            rip.add_entry(sid, offset);
        }
        rip.write(&mut self.file)?;

        let end = self.file.stream_position()?;
        for &offset in &self.pack_offsets {
            self.file.seek(SeekFrom::Start(offset + FOOTER_FIELD_OFFSET))?;
            self.file.write_all(&footer_at.to_be_bytes())?;
        }
        self.file.seek(SeekFrom::Start(end))?;

        for info in self.streams.iter_mut() {
            info.active = false;
            info.stream.set_state(StreamState::Done);
        }
        self.state = WriterState::Done;
        Ok(())
    }

    /// Build the container writer for a stream if it does not exist yet.
    fn ensure_writer(&mut self, i: usize) -> Result<()> {
        if self.streams[i].stream.has_writer() {
            return Ok(());
        }

        let body_sid = self.streams[i].stream.body_sid();
        let index_sid = self.streams[i].stream.index_sid();
        let wrap = self.streams[i].stream.wrap_type();
        let sources: Vec<SharedEssenceSource> = self.streams[i].stream.sources().to_vec();

        let mut gc = GcWriter::new(body_sid);
        let kag = match self.streams[i].stream.kag() {
            0 => self.config.kag_size,
            kag => kag,
        };
        gc.set_kag(
            kag,
            self.streams[i].stream.force_ber4() || self.config.force_ber4,
        );

        let mut element_ids = Vec::with_capacity(sources.len());
        for source in &sources {
            let source = source.borrow();
            let id = match source.key_override() {
                Some((key, non_gc)) => {
                    gc.add_essence_element_with_key(key, source.ber_size(), non_gc)?
                }
                None => gc.add_essence_element(
                    source.gc_essence_type(),
                    source.gc_element_type(),
                    source.ber_size(),
                )?,
            };
            if source.relative_write_order() != 0 {
                gc.set_relative_write_order(
                    id,
                    source.relative_write_order_type(),
                    source.relative_write_order(),
                )?;
            }
            element_ids.push(id);
        }

        if index_sid != 0 {
            // Observers must be listening (and the sub-range offset set)
            // before the pre-charge scan makes its first offers.
            let manager = self.streams[i].stream.index_manager();
            let range_start = sources[0].borrow().range_start();
            manager.borrow_mut().set_sub_range_offset(range_start);
            let precharge = sources[0].borrow_mut().precharge_size();
            manager.borrow_mut().set_pre_charge(precharge);
            gc.set_pre_charge(precharge);
            for (sub, &id) in element_ids.iter().enumerate() {
                gc.add_stream_index(id, manager.clone(), sub, false, wrap == WrapType::Clip)?;
            }
            gc.set_index_edit_unit(-precharge);
        }

        self.streams[i].stream.set_writer(gc, element_ids);
        Ok(())
    }
}

/// Read one complete wrapping unit from a source.
fn pull_unit(source: &SharedEssenceSource) -> Result<Option<Vec<u8>>> {
    let mut unit = Vec::new();
    loop {
        let chunk = source.borrow_mut().next_chunk(0, 0)?;
        match chunk {
            None => {
                return Ok(if unit.is_empty() { None } else { Some(unit) });
            }
            Some(chunk) => {
                unit.extend_from_slice(&chunk);
                if source.borrow().end_of_item() {
                    return Ok(Some(unit));
                }
            }
        }
    }
}
