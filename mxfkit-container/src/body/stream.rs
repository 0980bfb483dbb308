//! Body streams.
//!
//! A [`BodyStream`] couples one master essence source (plus any
//! sub-streams muxed into the same container) with everything the body
//! writer needs to schedule it: BodySID/IndexSID, the index table types
//! requested, per-stream layout options, and the stream's position in the
//! write state machine.

use crate::gc::writer::GcWriter;
use crate::index::manager::{IndexManager, SharedIndexManager};
use bitflags::bitflags;
use mxfkit_essence::{SharedEssenceSource, WrapType};
use std::cell::RefCell;
use std::rc::Rc;

bitflags! {
    /// The index table type (or types) requested for a stream.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamIndexFlags: u32 {
        /// Full VBR table in the footer (or isolated just before it).
        const FULL_FOOTER = 0x0001;
        /// Sparse VBR table in the footer (or isolated just before it).
        const SPARSE_FOOTER = 0x0002;
        /// VBR table sprinkled through the file, one chunk per body
        /// partition, completed in or before the footer.
        const SPRINKLED = 0x0004;
        /// Sprinkled chunks in isolated partitions after each body
        /// partition.
        const SPRINKLED_ISOLATED = 0x0008;
        /// CBR table in the header.
        const CBR_HEADER = 0x0010;
        /// CBR table in an isolated partition following the header.
        const CBR_HEADER_ISOLATED = 0x0020;
        /// CBR table in the footer.
        const CBR_FOOTER = 0x0040;
        /// CBR table in each body partition of this stream.
        const CBR_BODY = 0x0080;
        /// CBR table in an isolated partition after each body partition.
        const CBR_ISOLATED = 0x0100;
        /// CBR table in an isolated partition before each body partition.
        const CBR_PRE_ISOLATED = 0x0200;
    }
}

impl StreamIndexFlags {
    /// Any flag that wants index data in or before the footer.
    pub fn wants_footer_index(&self) -> bool {
        self.intersects(
            StreamIndexFlags::FULL_FOOTER
                | StreamIndexFlags::SPARSE_FOOTER
                | StreamIndexFlags::CBR_FOOTER
                | StreamIndexFlags::SPRINKLED,
        )
    }

    /// Any flag that wants index data in the header region.
    pub fn wants_header_index(&self) -> bool {
        self.intersects(StreamIndexFlags::CBR_HEADER | StreamIndexFlags::CBR_HEADER_ISOLATED)
    }

    /// Any flag that wants index chunks inside body partitions.
    pub fn wants_body_index(&self) -> bool {
        self.intersects(StreamIndexFlags::SPRINKLED | StreamIndexFlags::CBR_BODY)
    }

    /// Any flag that wants isolated index partitions after body partitions.
    pub fn wants_post_body_index(&self) -> bool {
        self.intersects(StreamIndexFlags::SPRINKLED_ISOLATED | StreamIndexFlags::CBR_ISOLATED)
    }

    /// Any flag that wants isolated index partitions before body
    /// partitions.
    pub fn wants_pre_body_index(&self) -> bool {
        self.contains(StreamIndexFlags::CBR_PRE_ISOLATED)
    }
}

/// The next action required for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing done yet.
    Start,
    /// Write a header index table in an isolated partition after the
    /// header.
    HeadIndex,
    /// Write an isolated index partition before the next body partition.
    PreBodyIndex,
    /// Write a body partition carrying an index chunk.
    BodyWithIndex,
    /// Write a body partition without index data.
    BodyNoIndex,
    /// Write an isolated index partition after a body partition.
    PostBodyIndex,
    /// Write a footer index table in an isolated partition before the
    /// footer.
    FootIndex,
    /// All done.
    Done,
}

/// One stream to be written into the file body.
pub struct BodyStream {
    body_sid: u32,
    index_sid: u32,
    /// The master source first, then any sub-stream sources.
    sources: Vec<SharedEssenceSource>,
    state: StreamState,
    index_flags: StreamIndexFlags,
    footer_index_flags: StreamIndexFlags,
    wrap_type: WrapType,
    index_manager: Option<SharedIndexManager>,
    /// Writer for this stream's container, built by the body writer.
    writer: Option<GcWriter>,
    /// Container stream id per source, parallel to `sources`.
    element_ids: Vec<crate::gc::writer::GcStreamId>,
    /// First edit unit of the next sprinkled index chunk.
    next_sprinkled: i64,
    end_of_stream: bool,
    /// Edit units of pre-charge remaining to be written.
    precharge_remaining: i64,
    /// Positions for sparse footer tables.
    pub sparse_list: Vec<i64>,

    kag: u32,
    force_ber4: bool,
    edit_align: bool,
    free_space_index: bool,
    value_relative_indexing: bool,
}

impl BodyStream {
    /// Create a body stream over a master essence source.
    pub fn new(body_sid: u32, source: SharedEssenceSource) -> Self {
        let wrap_type = source.borrow().wrap_type();
        BodyStream {
            body_sid,
            index_sid: 0,
            sources: vec![source],
            state: StreamState::Start,
            index_flags: StreamIndexFlags::empty(),
            footer_index_flags: StreamIndexFlags::empty(),
            wrap_type,
            index_manager: None,
            writer: None,
            element_ids: Vec::new(),
            next_sprinkled: 0,
            end_of_stream: false,
            precharge_remaining: 0,
            sparse_list: Vec::new(),
            kag: 0,
            force_ber4: false,
            edit_align: false,
            free_space_index: false,
            value_relative_indexing: false,
        }
    }

    /// Attach a sub-stream source, muxed into the same container.
    pub fn add_sub_stream(&mut self, source: SharedEssenceSource) {
        self.sources.push(source);
    }

    /// The master source plus sub-stream sources.
    pub fn sources(&self) -> &[SharedEssenceSource] {
        &self.sources
    }

    /// The master source.
    pub fn master(&self) -> &SharedEssenceSource {
        &self.sources[0]
    }

    /// Number of sources (master included).
    pub fn sub_stream_count(&self) -> usize {
        self.sources.len()
    }

    /// This stream's BodySID.
    pub fn body_sid(&self) -> u32 {
        self.body_sid
    }

    /// Set this stream's IndexSID.
    pub fn set_index_sid(&mut self, sid: u32) {
        self.index_sid = sid;
    }

    /// This stream's IndexSID.
    pub fn index_sid(&self) -> u32 {
        self.index_sid
    }

    /// Replace the index type flags.
    pub fn set_index_flags(&mut self, flags: StreamIndexFlags) {
        self.index_flags = flags;
    }

    /// Add index type flags to the current set.
    pub fn add_index_flags(&mut self, flags: StreamIndexFlags) {
        self.index_flags |= flags;
    }

    /// The index type flags.
    pub fn index_flags(&self) -> StreamIndexFlags {
        self.index_flags
    }

    /// Set the footer index tracking flags.
    pub fn set_footer_index_flags(&mut self, flags: StreamIndexFlags) {
        self.footer_index_flags = flags;
    }

    /// The footer index tracking flags.
    pub fn footer_index_flags(&self) -> StreamIndexFlags {
        self.footer_index_flags
    }

    /// The wrapping type of the master source.
    pub fn wrap_type(&self) -> WrapType {
        self.wrap_type
    }

    /// Per-stream KAG override (0 uses the writer default).
    pub fn set_kag(&mut self, kag: u32) {
        self.kag = kag;
    }

    /// The per-stream KAG override.
    pub fn kag(&self) -> u32 {
        self.kag
    }

    /// Force 4-byte BER lengths for this stream.
    pub fn set_force_ber4(&mut self, force: bool) {
        self.force_ber4 = force;
    }

    /// Whether 4-byte BER lengths are forced.
    pub fn force_ber4(&self) -> bool {
        self.force_ber4
    }

    /// Only partition on edit-unit boundaries of the master stream.
    pub fn set_edit_align(&mut self, align: bool) {
        self.edit_align = align;
    }

    /// The edit-align flag.
    pub fn edit_align(&self) -> bool {
        self.edit_align
    }

    /// Index the free space following the essence (non-standard).
    pub fn set_free_space_index(&mut self, flag: bool) {
        if flag {
            log::warn!("free-space indexing produces tables that are not standards-compliant");
        }
        self.free_space_index = flag;
    }

    /// The free-space-index flag.
    pub fn free_space_index(&self) -> bool {
        self.free_space_index
    }

    /// Count stream offsets from the first value byte instead of the key
    /// (non-standard; the tables must not be written to a file).
    pub fn set_value_relative_indexing(&mut self, flag: bool) {
        self.value_relative_indexing = flag;
        if let Some(manager) = &self.index_manager {
            manager.borrow_mut().set_value_relative_indexing(flag);
        }
    }

    /// The value-relative indexing flag.
    pub fn value_relative_indexing(&self) -> bool {
        self.value_relative_indexing
    }

    /// The current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Force the state.
    pub fn set_state(&mut self, state: StreamState) {
        self.state = state;
    }

    /// Advance to the next state and return it.
    ///
    /// The progression is Start → HeadIndex → PreBodyIndex →
    /// BodyWithIndex/BodyNoIndex → PostBodyIndex → FootIndex → Done, with
    /// each stage entered only when the index flags call for it and the
    /// body stages repeating until the essence is exhausted.
    pub fn next_state(&mut self) -> StreamState {
        let flags = self.index_flags;
        self.state = match self.state {
            StreamState::Start => {
                let precharge_size = self.master().borrow_mut().precharge_size();
                self.precharge_remaining = precharge_size;
                if flags.wants_header_index() {
                    StreamState::HeadIndex
                } else {
                    self.body_entry_state()
                }
            }
            StreamState::HeadIndex => self.body_entry_state(),
            StreamState::PreBodyIndex => self.body_state(),
            StreamState::BodyWithIndex | StreamState::BodyNoIndex => {
                if flags.wants_post_body_index() {
                    StreamState::PostBodyIndex
                } else if self.end_of_stream {
                    self.footer_state()
                } else {
                    self.body_entry_state()
                }
            }
            StreamState::PostBodyIndex => {
                if self.end_of_stream {
                    self.footer_state()
                } else {
                    self.body_entry_state()
                }
            }
            StreamState::FootIndex => StreamState::Done,
            StreamState::Done => StreamState::Done,
        };
        self.state
    }

    fn body_entry_state(&self) -> StreamState {
        if self.end_of_stream {
            return self.footer_state();
        }
        if self.index_flags.wants_pre_body_index() {
            StreamState::PreBodyIndex
        } else {
            self.body_state()
        }
    }

    fn body_state(&self) -> StreamState {
        if self.index_flags.wants_body_index() {
            StreamState::BodyWithIndex
        } else {
            StreamState::BodyNoIndex
        }
    }

    fn footer_state(&self) -> StreamState {
        if self.index_flags.wants_footer_index() {
            StreamState::FootIndex
        } else {
            StreamState::Done
        }
    }

    /// Mark the essence exhausted.
    pub fn set_end_of_stream(&mut self, end: bool) {
        self.end_of_stream = end;
    }

    /// Is the essence exhausted?
    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// The first edit unit of the next sprinkled index chunk.
    pub fn next_sprinkled(&self) -> i64 {
        self.next_sprinkled
    }

    /// Record the first edit unit of the next sprinkled index chunk.
    pub fn set_next_sprinkled(&mut self, edit_unit: i64) {
        self.next_sprinkled = edit_unit;
    }

    /// Edit units of pre-charge remaining to be written.
    pub fn precharge_remaining(&self) -> i64 {
        self.precharge_remaining
    }

    /// Count one pre-charge edit unit as written.
    pub fn decrement_precharge(&mut self) {
        if self.precharge_remaining > 0 {
            self.precharge_remaining -= 1;
        }
    }

    /// The master stream's position in edit units.
    pub fn position(&self) -> i64 {
        self.master().borrow_mut().current_position()
    }

    /// The index manager, initialised on first use.
    ///
    /// The master source decides the main stream's reordering and sizing
    /// (VBR essence may need reordering, so its PosTableIndex is -1; CBR
    /// essence carries its bytes-per-edit-unit). Sub-stream sources are
    /// added in order and receive the manager as their index observer.
    pub fn index_manager(&mut self) -> SharedIndexManager {
        if let Some(manager) = &self.index_manager {
            return manager.clone();
        }

        let (main_pos_table, main_size, edit_rate) = {
            let mut master = self.sources[0].borrow_mut();
            let size = master.bytes_per_edit_unit(1);
            let pos_table = if size == 0 { -1 } else { 0 };
            (pos_table, size, master.edit_rate())
        };

        let mut manager = IndexManager::new(main_pos_table, main_size);
        manager.set_body_sid(self.body_sid);
        manager.set_index_sid(self.index_sid);
        manager.set_edit_rate(edit_rate);
        manager.set_value_relative_indexing(self.value_relative_indexing);
        let manager = Rc::new(RefCell::new(manager));

        for (i, source) in self.sources.iter().enumerate() {
            if i > 0 {
                let size = source.borrow_mut().bytes_per_edit_unit(1);
                let pos_table = if size == 0 { -1 } else { 0 };
                let sub = manager
                    .borrow_mut()
                    .add_sub_stream(pos_table, size)
                    .expect("index format fixed before sub-streams were added");
                source
                    .borrow_mut()
                    .set_index_observer(manager.clone(), sub);
            } else {
                source.borrow_mut().set_index_observer(manager.clone(), 0);
            }
        }

        self.index_manager = Some(manager.clone());
        manager
    }

    /// The index manager if one has been initialised.
    pub fn index_manager_opt(&self) -> Option<SharedIndexManager> {
        self.index_manager.clone()
    }

    /// Install the container writer for this stream, with the container
    /// stream id of each source.
    pub fn set_writer(&mut self, writer: GcWriter, element_ids: Vec<crate::gc::writer::GcStreamId>) {
        self.writer = Some(writer);
        self.element_ids = element_ids;
    }

    /// Container stream ids, parallel to [`sources`](BodyStream::sources).
    pub fn element_ids(&self) -> &[crate::gc::writer::GcStreamId] {
        &self.element_ids
    }

    /// The container writer, if installed.
    pub fn writer_mut(&mut self) -> Option<&mut GcWriter> {
        self.writer.as_mut()
    }

    /// True once a container writer is installed.
    pub fn has_writer(&self) -> bool {
        self.writer.is_some()
    }
}
