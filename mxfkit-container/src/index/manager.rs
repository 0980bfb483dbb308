//! The index manager.
//!
//! Accepts per-edit-unit observations (offsets, temporal offsets, key-frame
//! offsets, flags) from any number of sub-streams while essence is being
//! written, and materialises them into an [`IndexTable`] on demand.
//!
//! Entries accumulate in a managed map keyed by edit unit. Temporal offsets
//! may arrive before the edit unit they reference exists; they are parked
//! in unsatisfied maps and resolved when the entry is created. A
//! provisional slot buffers one staged entry so partial updates to the same
//! edit unit do not churn the map.

use crate::index::table::{IndexTable, INDEX_LOWEST};
use mxfkit_core::{IndexError, Rational, Result};
use mxfkit_essence::IndexObserver;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// Shared handle to an index manager.
pub type SharedIndexManager = Rc<RefCell<IndexManager>>;

/// Status bits of a managed entry.
const STATUS_OFFSET: u8 = 0x01;
const STATUS_TEMPORAL_OFFSET: u8 = 0x02;
const STATUS_TEMPORAL_DIFF: u8 = 0x04;

/// One managed edit unit.
#[derive(Debug, Clone)]
struct ManagedEntry {
    status: u8,
    temporal_offset: i32,
    /// Displacement that undoes reordering when entries are committed.
    temporal_diff: i32,
    key_offset: i8,
    flags: u8,
    /// Stream offset per sub-stream.
    stream_offsets: Vec<u64>,
}

impl ManagedEntry {
    fn new(stream_count: usize) -> Self {
        ManagedEntry {
            status: 0,
            temporal_offset: 0,
            temporal_diff: 0,
            key_offset: 0,
            flags: 0,
            stream_offsets: vec![0; stream_count],
        }
    }
}

/// Builds index tables from write-time observations.
pub struct IndexManager {
    format_fixed: bool,
    uses_reordering: bool,
    data_is_cbr: bool,
    pos_table_indices: Vec<i32>,
    element_sizes: Vec<u32>,
    /// Sub-stream allowed to set per-entry values (key offset, flags).
    master_stream: usize,

    body_sid: u32,
    index_sid: u32,
    edit_rate: Rational,
    pre_charge: i64,
    index_duration: i64,
    value_relative_indexing: bool,

    /// Subtracted from incoming edit units so that unit zero is the first
    /// kept frame when writing through a ranged source.
    sub_range_offset: i64,

    managed: BTreeMap<i64, ManagedEntry>,
    /// Staged entry not yet in the managed map.
    provisional: Option<(i64, ManagedEntry)>,
    last_new_edit_unit: i64,

    unsatisfied_temporal_offsets: BTreeMap<i64, i32>,
    unsatisfied_temporal_diffs: BTreeMap<i64, i32>,

    entry_log: HashMap<i32, i64>,
    next_log_id: i32,
    log_next_entry: i32,
}

impl IndexManager {
    /// Construct with the main stream's reordering and sizing details.
    ///
    /// A negative `pos_table_index` means the stream needs temporal
    /// reordering; a non-zero `element_size` means it is constant-rate.
    pub fn new(pos_table_index: i32, element_size: u32) -> Self {
        IndexManager {
            format_fixed: false,
            uses_reordering: pos_table_index < 0,
            data_is_cbr: element_size > 0,
            pos_table_indices: vec![pos_table_index],
            element_sizes: vec![element_size],
            master_stream: 0,
            body_sid: 0,
            index_sid: 0,
            edit_rate: Rational::new(1, 1),
            pre_charge: 0,
            index_duration: 0,
            value_relative_indexing: false,
            sub_range_offset: 0,
            managed: BTreeMap::new(),
            provisional: None,
            last_new_edit_unit: INDEX_LOWEST,
            unsatisfied_temporal_offsets: BTreeMap::new(),
            unsatisfied_temporal_diffs: BTreeMap::new(),
            entry_log: HashMap::new(),
            next_log_id: 0,
            log_next_entry: -1,
        }
    }

    /// Add a sub-stream. Fails once the format is fixed.
    ///
    /// Returns the sub-stream id to use in offers.
    pub fn add_sub_stream(&mut self, pos_table_index: i32, element_size: u32) -> Result<usize> {
        if self.format_fixed {
            return Err(IndexError::FormatFixed.into());
        }
        if pos_table_index < 0 {
            self.uses_reordering = true;
        }
        if element_size == 0 {
            self.data_is_cbr = false;
        }
        self.pos_table_indices.push(pos_table_index);
        self.element_sizes.push(element_size);
        Ok(self.pos_table_indices.len() - 1)
    }

    /// Number of sub-streams including the main stream.
    pub fn stream_count(&self) -> usize {
        self.pos_table_indices.len()
    }

    /// True when every sub-stream is constant-rate.
    pub fn is_cbr(&self) -> bool {
        self.data_is_cbr
    }

    /// True when any sub-stream needs temporal reordering.
    pub fn uses_reordering(&self) -> bool {
        self.uses_reordering
    }

    /// Set the BodySID recorded in produced tables.
    pub fn set_body_sid(&mut self, sid: u32) {
        self.body_sid = sid;
    }

    /// Set the IndexSID recorded in produced tables.
    pub fn set_index_sid(&mut self, sid: u32) {
        self.index_sid = sid;
    }

    /// Set the indexed edit rate.
    pub fn set_edit_rate(&mut self, rate: Rational) {
        self.edit_rate = rate;
    }

    /// Set the pre-charge size carried into produced tables.
    pub fn set_pre_charge(&mut self, pre_charge: i64) {
        self.pre_charge = pre_charge;
    }

    /// Set the duration recorded in CBR tables.
    pub fn set_index_duration(&mut self, duration: i64) {
        self.index_duration = duration;
    }

    /// Enable value-relative indexing (offsets count from the first value
    /// byte of clip-wrapped essence rather than the key).
    ///
    /// The flag is honoured by the GC writer when it reports offsets; it is
    /// recorded here so readers of the manager can tell the two apart.
    pub fn set_value_relative_indexing(&mut self, value_relative: bool) {
        self.value_relative_indexing = value_relative;
    }

    /// Read the value-relative indexing flag.
    pub fn value_relative_indexing(&self) -> bool {
        self.value_relative_indexing
    }

    /// Set the sub-range offset subtracted from incoming edit units.
    pub fn set_sub_range_offset(&mut self, offset: i64) {
        self.sub_range_offset = offset;
    }

    /// The edit unit most recently added.
    pub fn last_new_edit_unit(&self) -> i64 {
        self.last_new_edit_unit
    }

    /// Fetch (creating if needed) the entry for an edit unit, resolving any
    /// parked temporal data against it. Flushes a non-matching provisional
    /// entry into the managed map first.
    fn entry_for(&mut self, edit_unit: i64) -> &mut ManagedEntry {
        self.format_fixed = true;

        if let Some((staged_unit, _)) = self.provisional.as_ref() {
            let staged_unit = *staged_unit;
            if staged_unit == edit_unit {
                // Re-use the staged entry in place.
                return &mut self.provisional.as_mut().unwrap().1;
            }
            let (_, entry) = self.provisional.take().unwrap();
            self.managed.insert(staged_unit, entry);
            self.last_new_edit_unit = staged_unit;
        }

        let stream_count = self.stream_count();
        if !self.managed.contains_key(&edit_unit) {
            let mut entry = ManagedEntry::new(stream_count);
            if let Some(offset) = self.unsatisfied_temporal_offsets.remove(&edit_unit) {
                entry.status |= STATUS_TEMPORAL_OFFSET;
                entry.temporal_offset = offset;
            }
            if let Some(diff) = self.unsatisfied_temporal_diffs.remove(&edit_unit) {
                entry.status |= STATUS_TEMPORAL_DIFF;
                entry.temporal_diff = diff;
            }
            self.managed.insert(edit_unit, entry);
            self.last_new_edit_unit = edit_unit;
            self.log(edit_unit);
        }
        self.managed.get_mut(&edit_unit).unwrap()
    }

    /// Record an edit unit of a sub-stream without a known offset.
    ///
    /// The edit unit is absolute from the stream start (sub-range corrected
    /// internally).
    pub fn add_edit_unit(
        &mut self,
        sub_stream: usize,
        edit_unit: i64,
        key_offset: i8,
        flags: Option<u8>,
    ) {
        if self.data_is_cbr {
            return;
        }
        let edit_unit = edit_unit - self.sub_range_offset;
        let master = sub_stream == self.master_stream;
        let entry = self.entry_for(edit_unit);
        if master {
            if key_offset != 0 {
                entry.key_offset = key_offset;
            }
            if let Some(flags) = flags {
                entry.flags = flags;
            }
        }
    }

    /// Record the stream offset of an edit unit of a sub-stream.
    ///
    /// The edit unit here is already sub-range relative (pre-charge units
    /// are negative), because offsets are reported by the writer as the
    /// filtered stream is laid out.
    pub fn set_offset(
        &mut self,
        sub_stream: usize,
        edit_unit: i64,
        offset: u64,
        key_offset: i8,
        flags: Option<u8>,
    ) {
        if self.data_is_cbr {
            return;
        }
        let master = sub_stream == self.master_stream;
        let entry = self.entry_for(edit_unit);
        entry.status |= STATUS_OFFSET;
        if sub_stream < entry.stream_offsets.len() {
            entry.stream_offsets[sub_stream] = offset;
        }
        if master {
            if key_offset != 0 {
                entry.key_offset = key_offset;
            }
            if let Some(flags) = flags {
                entry.flags = flags;
            }
        }
    }

    /// Record the displacement between display and stream order for an
    /// edit unit (absolute position, sub-range corrected internally).
    ///
    /// Also records the reverse displacement against the referenced entry
    /// so that reordering can be undone at commit time. Either side may
    /// precede its entry's creation; the values wait in unsatisfied maps.
    pub fn set_temporal_offset(&mut self, edit_unit: i64, offset: i32) {
        if self.data_is_cbr {
            return;
        }
        let edit_unit = edit_unit - self.sub_range_offset;

        if let Some((staged_unit, entry)) = self.provisional.as_mut() {
            if *staged_unit == edit_unit {
                entry.status |= STATUS_TEMPORAL_OFFSET;
                entry.temporal_offset = offset;
            }
        }
        match self.managed.get_mut(&edit_unit) {
            Some(entry) => {
                entry.status |= STATUS_TEMPORAL_OFFSET;
                entry.temporal_offset = offset;
            }
            None => {
                if self
                    .provisional
                    .as_ref()
                    .map(|(unit, _)| *unit != edit_unit)
                    .unwrap_or(true)
                {
                    self.unsatisfied_temporal_offsets.insert(edit_unit, offset);
                }
            }
        }

        let diff_unit = edit_unit + offset as i64;
        if let Some((staged_unit, entry)) = self.provisional.as_mut() {
            if *staged_unit == diff_unit {
                entry.status |= STATUS_TEMPORAL_DIFF;
                entry.temporal_diff = -offset;
                return;
            }
        }
        match self.managed.get_mut(&diff_unit) {
            Some(entry) => {
                entry.status |= STATUS_TEMPORAL_DIFF;
                entry.temporal_diff = -offset;
            }
            None => {
                self.unsatisfied_temporal_diffs.insert(diff_unit, -offset);
            }
        }
    }

    /// Update the key-frame offset of a known edit unit (absolute position).
    pub fn set_key_offset(&mut self, edit_unit: i64, key_offset: i8) -> Result<()> {
        if self.data_is_cbr {
            return Ok(());
        }
        let edit_unit = edit_unit - self.sub_range_offset;
        if let Some((staged_unit, entry)) = self.provisional.as_mut() {
            if *staged_unit == edit_unit {
                entry.key_offset = key_offset;
                return Ok(());
            }
        }
        match self.managed.get_mut(&edit_unit) {
            Some(entry) => {
                entry.key_offset = key_offset;
                Ok(())
            }
            None => Err(IndexError::UnknownEditUnit {
                edit_unit,
                operation: "set_key_offset",
            }
            .into()),
        }
    }

    /// Update the flags of a known edit unit (absolute position).
    pub fn set_flags(&mut self, edit_unit: i64, flags: u8) -> Result<()> {
        if self.data_is_cbr {
            return Ok(());
        }
        let edit_unit = edit_unit - self.sub_range_offset;
        if let Some((staged_unit, entry)) = self.provisional.as_mut() {
            if *staged_unit == edit_unit {
                entry.flags = flags;
                return Ok(());
            }
        }
        match self.managed.get_mut(&edit_unit) {
            Some(entry) => {
                entry.flags = flags;
                Ok(())
            }
            None => Err(IndexError::UnknownEditUnit {
                edit_unit,
                operation: "set_flags",
            }
            .into()),
        }
    }

    /// Stage a provisional entry for an edit unit (sub-range relative).
    ///
    /// The staged entry soaks up partial updates targeting the same unit;
    /// it is committed when an offer for a different unit arrives, or
    /// immediately by [`accept_next`](IndexManager::accept_next).
    pub fn accept_provisional(&mut self, edit_unit: i64) {
        if self.provisional.is_some() {
            // Flush the old one through the normal path.
            self.entry_for(edit_unit);
            return;
        }
        let stream_count = self.stream_count();
        self.format_fixed = true;
        let mut entry = ManagedEntry::new(stream_count);
        if let Some(offset) = self.unsatisfied_temporal_offsets.remove(&edit_unit) {
            entry.status |= STATUS_TEMPORAL_OFFSET;
            entry.temporal_offset = offset;
        }
        if let Some(diff) = self.unsatisfied_temporal_diffs.remove(&edit_unit) {
            entry.status |= STATUS_TEMPORAL_DIFF;
            entry.temporal_diff = diff;
        }
        self.provisional = Some((edit_unit, entry));
    }

    /// Commit any staged provisional entry.
    pub fn accept_next(&mut self) {
        if let Some((edit_unit, entry)) = self.provisional.take() {
            self.managed.insert(edit_unit, entry);
            self.last_new_edit_unit = edit_unit;
            self.log(edit_unit);
        }
    }

    /// Ask for the next added edit unit to be recorded in the log.
    ///
    /// Returns the log id to query with [`read_log`](IndexManager::read_log).
    pub fn log_next(&mut self) -> i32 {
        if self.log_next_entry >= 0 {
            return self.log_next_entry;
        }
        self.log_next_entry = self.next_log_id;
        self.next_log_id = self.next_log_id.wrapping_add(1).max(0);
        self.log_next_entry
    }

    /// Read a logged edit unit.
    pub fn read_log(&self, id: i32) -> Option<i64> {
        self.entry_log.get(&id).copied()
    }

    fn log(&mut self, edit_unit: i64) {
        if self.log_next_entry >= 0 {
            self.entry_log.insert(self.log_next_entry, edit_unit);
            self.log_next_entry = -1;
        }
    }

    /// The first and last edit units in the managed map.
    pub fn committed_range(&self) -> (i64, i64) {
        let first = self.managed.keys().next().copied().unwrap_or(0);
        let last = self.managed.keys().next_back().copied().unwrap_or(-1);
        (first, last)
    }

    /// Build the index table skeleton for the managed format.
    ///
    /// Fixes the format. CBR managers get a complete table (byte count is
    /// the sum of element sizes); VBR managers get an empty table that
    /// [`add_entries_to_index`](IndexManager::add_entries_to_index) fills.
    pub fn make_index(&mut self) -> IndexTable {
        self.format_fixed = true;

        let mut table = IndexTable::new();
        table.index_sid = self.index_sid;
        table.body_sid = self.body_sid;
        table.edit_rate = self.edit_rate;
        table.pre_charge = self.pre_charge;
        table.define_delta_array(&self.element_sizes);
        for (delta, &pos_table_index) in table
            .base_delta_array
            .iter_mut()
            .zip(self.pos_table_indices.iter())
        {
            delta.pos_table_index = pos_table_index as i8;
        }

        if self.data_is_cbr {
            table.edit_unit_byte_count = self.element_sizes.iter().sum();
            table.index_duration = self.index_duration;
        }

        table
    }

    /// Commit complete managed entries in `[first, last]` into a table.
    ///
    /// An entry is complete when it has an offset and, if reordering is in
    /// use, a temporal offset. With `undo_reorder` each entry additionally
    /// needs its temporal diff, is rewritten at `edit_unit + temporal_diff`,
    /// and the table's negative PosTable indices are cleared so readers do
    /// not re-apply the reordering.
    ///
    /// Returns the number of entries committed.
    pub fn add_entries_to_index(
        &mut self,
        undo_reorder: bool,
        table: &mut IndexTable,
        first: i64,
        last: i64,
    ) -> Result<usize> {
        if self.data_is_cbr {
            return Ok(0);
        }

        let mut status_test = STATUS_OFFSET;
        if self.uses_reordering {
            status_test |= STATUS_TEMPORAL_OFFSET;
        }
        if undo_reorder {
            status_test |= STATUS_TEMPORAL_DIFF;
            for delta in table.base_delta_array.iter_mut() {
                if delta.pos_table_index < 0 {
                    delta.pos_table_index = 0;
                }
            }
            for segment in table.segments.values_mut() {
                for delta in segment.delta_array.iter_mut() {
                    if delta.pos_table_index < 0 {
                        delta.pos_table_index = 0;
                    }
                }
            }
        }

        if table.npe != 0 {
            log::warn!("PosTable entries are not originated by the index manager");
        }

        let nsl = table.nsl;
        let stream_count = self.stream_count();
        let mut committed = 0;

        let range: Vec<i64> = self
            .managed
            .range(first..=last)
            .filter(|(_, entry)| entry.status & status_test == status_test)
            .map(|(&unit, _)| unit)
            .collect();

        for unit in range {
            let entry = &self.managed[&unit];

            // Slice offsets: each VBR sub-stream ends its slice, and the
            // offset of the next slice is the next stream's offset relative
            // to the first. Zero-sized elements that were never offered
            // leave a zero offset behind.
            let mut slices = Vec::with_capacity(nsl);
            let base = entry.stream_offsets[0];
            for i in 0..stream_count.saturating_sub(1) {
                if self.element_sizes[i] == 0 {
                    let next = entry.stream_offsets[i + 1];
                    if next >= base {
                        slices.push((next - base) as u32);
                    } else {
                        log::warn!(
                            "no offset for sub-stream {} at edit unit {}; writing zero slice",
                            i + 1,
                            unit
                        );
                        slices.push(0);
                    }
                }
            }
            slices.resize(nsl, 0);

            let target_unit = if undo_reorder {
                unit + entry.temporal_diff as i64
            } else {
                unit
            };

            table.add_entry(
                target_unit,
                entry.temporal_offset.clamp(-128, 127) as i8,
                entry.key_offset,
                entry.flags,
                entry.stream_offsets[0],
                &slices,
                &[],
            )?;
            committed += 1;
        }

        Ok(committed)
    }

    /// True when no offered temporal offset is still waiting for its edit
    /// unit to appear.
    pub fn temporal_offsets_resolved(&self) -> bool {
        self.unsatisfied_temporal_offsets.is_empty() && self.unsatisfied_temporal_diffs.is_empty()
    }
}

impl IndexObserver for IndexManager {
    fn offer_edit_unit(
        &mut self,
        sub_stream: usize,
        edit_unit: i64,
        key_offset: i8,
        flags: Option<u8>,
    ) {
        // All offers are currently accepted.
        self.add_edit_unit(sub_stream, edit_unit, key_offset, flags);
    }

    fn offer_offset(
        &mut self,
        sub_stream: usize,
        edit_unit: i64,
        offset: u64,
        key_offset: i8,
        flags: Option<u8>,
    ) {
        self.set_offset(sub_stream, edit_unit, offset, key_offset, flags);
    }

    fn offer_temporal_offset(&mut self, edit_unit: i64, offset: i32) {
        self.set_temporal_offset(edit_unit, offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_sub_stream_after_fix_fails() {
        let mut manager = IndexManager::new(-1, 0);
        manager.add_edit_unit(0, 0, 0, Some(0x80));
        let err = manager.add_sub_stream(0, 48).unwrap_err();
        assert!(matches!(
            err,
            mxfkit_core::Error::Index(IndexError::FormatFixed)
        ));
    }

    #[test]
    fn test_cbr_flags() {
        let mut manager = IndexManager::new(0, 100);
        assert!(manager.is_cbr());
        manager.add_sub_stream(0, 0).unwrap();
        assert!(!manager.is_cbr());

        let mut manager = IndexManager::new(0, 100);
        manager.add_sub_stream(0, 50).unwrap();
        assert!(manager.is_cbr());
        assert!(!manager.uses_reordering());
        manager.add_sub_stream(-1, 50).unwrap();
        assert!(manager.uses_reordering());
    }

    #[test]
    fn test_cbr_make_index_sums_sizes() {
        let mut manager = IndexManager::new(0, 100);
        manager.add_sub_stream(0, 28).unwrap();
        manager.set_index_duration(250);
        manager.set_edit_rate(Rational::new(25, 1));
        let table = manager.make_index();
        assert_eq!(table.edit_unit_byte_count, 128);
        assert_eq!(table.index_duration, 250);
        assert_eq!(table.base_delta_array.len(), 2);
        assert_eq!(table.base_delta_array[1].element_delta, 100);
    }

    #[test]
    fn test_vbr_commit_requires_offset_and_temporal() {
        let mut manager = IndexManager::new(-1, 0);
        manager.add_edit_unit(0, 0, 0, Some(0x80));
        manager.set_offset(0, 0, 0, 0, None);
        manager.add_edit_unit(0, 1, -1, Some(0x33));
        manager.set_offset(0, 1, 1000, -1, None);

        // Temporal offsets only for unit 0 so far
        manager.set_temporal_offset(0, 0);

        let mut table = manager.make_index();
        let committed = manager
            .add_entries_to_index(false, &mut table, INDEX_LOWEST, i64::MAX)
            .unwrap();
        assert_eq!(committed, 1);

        manager.set_temporal_offset(1, 0);
        let mut table = manager.make_index();
        let committed = manager
            .add_entries_to_index(false, &mut table, INDEX_LOWEST, i64::MAX)
            .unwrap();
        assert_eq!(committed, 2);
    }

    #[test]
    fn test_unsatisfied_temporal_offset_resolved_late() {
        let mut manager = IndexManager::new(-1, 0);
        // Offset arrives for edit unit 3 before the unit exists
        manager.set_temporal_offset(3, -2);
        assert!(!manager.temporal_offsets_resolved());

        manager.add_edit_unit(0, 3, 0, None);
        manager.set_offset(0, 3, 300, 0, None);

        // The diff side went to unit 3 + (-2) = 1
        manager.add_edit_unit(0, 1, 0, None);
        assert!(manager.temporal_offsets_resolved());
        manager.set_offset(0, 1, 100, 0, None);
        manager.set_temporal_offset(1, 2);

        let mut table = manager.make_index();
        let committed = manager
            .add_entries_to_index(false, &mut table, INDEX_LOWEST, i64::MAX)
            .unwrap();
        assert_eq!(committed, 2);
        assert_eq!(table.lookup(3, 0, false).unwrap().location, 300);
    }

    #[test]
    fn test_undo_reorder_rewrites_positions() {
        let mut manager = IndexManager::new(-1, 0);
        // Stream order entries 0..4, display mapping via temporal offsets:
        // display 0->0, display 3 -> stream 1, displays 1,2 -> streams 2,3
        for unit in 0..4i64 {
            manager.add_edit_unit(0, unit, 0, None);
            manager.set_offset(0, unit, unit as u64 * 100, 0, None);
        }
        manager.set_temporal_offset(0, 0);
        manager.set_temporal_offset(3, -2); // display 3 at stream 1
        manager.set_temporal_offset(1, 1); // display 1 at stream 2
        manager.set_temporal_offset(2, 1); // display 2 at stream 3

        let mut table = manager.make_index();
        table.base_delta_array[0].pos_table_index = -1;
        let committed = manager
            .add_entries_to_index(true, &mut table, INDEX_LOWEST, i64::MAX)
            .unwrap();
        assert_eq!(committed, 4);

        // Reordering undone: delta array no longer flags reordering
        assert_eq!(table.base_delta_array[0].pos_table_index, 0);

        // Stream entry 1 (display 3, diff +2) lands at position 3
        assert_eq!(table.lookup(3, 0, false).unwrap().location, 100);
        // Stream entry 2 (display 1, diff -1) lands at position 1
        assert_eq!(table.lookup(1, 0, false).unwrap().location, 200);
    }

    #[test]
    fn test_sub_range_offset_shifts_positions() {
        let mut manager = IndexManager::new(-1, 0);
        manager.set_sub_range_offset(30);

        // Parser offers absolute positions 28..32; writer offers
        // range-relative offsets for the same units (-2..2)
        for absolute in 28..33i64 {
            manager.add_edit_unit(0, absolute, 0, Some(0x80));
            manager.set_temporal_offset(absolute, 0);
        }
        for relative in -2..3i64 {
            manager.set_offset(0, relative, (relative + 2) as u64 * 10, 0, None);
        }

        let mut table = manager.make_index();
        let committed = manager
            .add_entries_to_index(false, &mut table, INDEX_LOWEST, i64::MAX)
            .unwrap();
        assert_eq!(committed, 5);
        assert_eq!(*table.segments.keys().next().unwrap(), -2);
        assert_eq!(table.lookup(0, 0, false).unwrap().location, 20);
    }

    #[test]
    fn test_provisional_reuse() {
        let mut manager = IndexManager::new(-1, 0);
        manager.accept_provisional(5);
        manager.set_flags(5, 0x22).unwrap();
        manager.set_key_offset(5, -2).unwrap();
        // Not yet in the managed map
        assert_eq!(manager.committed_range(), (0, -1));

        // An offer for the same unit re-uses the staged entry
        manager.set_offset(0, 5, 555, 0, None);
        manager.set_temporal_offset(5, 0);
        manager.accept_next();

        let mut table = manager.make_index();
        manager
            .add_entries_to_index(false, &mut table, INDEX_LOWEST, i64::MAX)
            .unwrap();
        let pos = table.lookup(5, 0, false).unwrap();
        assert_eq!(pos.location, 555);
        assert_eq!(pos.flags, 0x22);
        assert_eq!(pos.key_frame_offset, -2);
    }

    #[test]
    fn test_provisional_dropped_on_other_unit() {
        let mut manager = IndexManager::new(-1, 0);
        manager.accept_provisional(5);
        // An offer for a different unit commits the staged entry first
        manager.set_offset(0, 6, 600, 0, None);
        assert_eq!(manager.committed_range(), (5, 6));
    }

    #[test]
    fn test_log() {
        let mut manager = IndexManager::new(-1, 0);
        let id = manager.log_next();
        assert!(manager.read_log(id).is_none());
        manager.add_edit_unit(0, 42, 0, None);
        assert_eq!(manager.read_log(id), Some(42));

        // Only the next entry is logged
        manager.add_edit_unit(0, 43, 0, None);
        assert_eq!(manager.read_log(id), Some(42));
    }

    #[test]
    fn test_slice_offsets_from_sub_streams() {
        let mut manager = IndexManager::new(-1, 0);
        let audio = manager.add_sub_stream(0, 0).unwrap();
        manager.set_temporal_offset(0, 0);
        manager.set_offset(0, 0, 1000, 0, Some(0x80));
        manager.set_offset(audio, 0, 1500, 0, None);

        let mut table = manager.make_index();
        assert_eq!(table.nsl, 1);
        manager
            .add_entries_to_index(false, &mut table, INDEX_LOWEST, i64::MAX)
            .unwrap();

        // Sub-item 1 sits in slice 1, offset 500 past the main stream
        let pos = table.lookup(0, 1, false).unwrap();
        assert_eq!(pos.location, 1500);
    }
}
