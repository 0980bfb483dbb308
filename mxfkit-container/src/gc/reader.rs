//! The generic container reader.
//!
//! Pulls KLVs from a file and dispatches them to per-track handlers. The
//! reader owns no interpretation of the essence itself: fillers go to the
//! filler handler (or are discarded), encrypted triplets go to the
//! encryption handler (which may resubmit the decrypted KLV), recognised
//! GC keys go to the handler registered for their track number, and
//! everything else goes to the default handler.

use crate::gc::layout::{GcLayout, LayoutEvent};
use mxfkit_core::klv::{read_key_length, Klv};
use mxfkit_core::Result;
use mxfkit_essence::ReadSeek;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

/// What a read pass counts before stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderUnit {
    /// Individual KLVs.
    #[default]
    Klv,
    /// Complete content packages.
    GcPackage,
    /// Partitions.
    Partition,
    /// Essence containers.
    Container,
}

/// Control surface handlers use to influence the read loop.
pub struct GcReaderControl {
    stop: bool,
    push_back: bool,
    /// Offset of the current KLV within its essence container.
    pub stream_offset: u64,
    /// Offset of the current KLV within the file.
    pub file_offset: u64,
}

impl GcReaderControl {
    /// Stop the current read pass. With `push_back` the current KLV is
    /// left to be re-read by the next pass (used when a handler realises
    /// the KLV belongs to a different partition).
    pub fn stop_reading(&mut self, push_back: bool) {
        self.stop = true;
        self.push_back = push_back;
    }
}

/// Receives KLVs from a [`GcReader`].
pub trait GcReadHandler {
    /// Handle one KLV. Return false to abort the read pass.
    fn handle_data(&mut self, control: &mut GcReaderControl, klv: &Klv) -> Result<bool>;
}

/// Shared handle to a read handler.
pub type SharedReadHandler = Rc<RefCell<dyn GcReadHandler>>;

/// Reads the KLVs of one essence container and dispatches them.
pub struct GcReader {
    /// Offset of the next KLV within the file.
    file_offset: u64,
    /// Offset of the next KLV within this container's stream.
    stream_offset: u64,
    stop_now: bool,
    push_back_requested: bool,

    default_handler: Option<SharedReadHandler>,
    filler_handler: Option<SharedReadHandler>,
    encryption_handler: Option<SharedReadHandler>,
    handlers: HashMap<u32, SharedReadHandler>,

    layout: GcLayout,
}

impl GcReader {
    /// Create a reader, optionally with default and filler handlers.
    pub fn new(
        default_handler: Option<SharedReadHandler>,
        filler_handler: Option<SharedReadHandler>,
    ) -> Self {
        GcReader {
            file_offset: 0,
            stream_offset: 0,
            stop_now: false,
            push_back_requested: false,
            default_handler,
            filler_handler,
            encryption_handler: None,
            handlers: HashMap::new(),
            layout: GcLayout::new(true),
        }
    }

    /// Set the default handler for KLVs with no specific handler.
    pub fn set_default_handler(&mut self, handler: Option<SharedReadHandler>) {
        self.default_handler = handler;
    }

    /// Set the filler handler. Fillers are never sent to the default
    /// handler; without a filler handler they are discarded.
    pub fn set_filler_handler(&mut self, handler: Option<SharedReadHandler>) {
        self.filler_handler = handler;
    }

    /// Set the encryption handler. It receives encrypted triplets and may
    /// resubmit the decrypted KLV via [`handle_data`](GcReader::handle_data).
    pub fn set_encryption_handler(&mut self, handler: Option<SharedReadHandler>) {
        self.encryption_handler = handler;
    }

    /// Register (or with `None` remove) the handler for a track number.
    pub fn set_data_handler(&mut self, track_number: u32, handler: Option<SharedReadHandler>) {
        match handler {
            Some(handler) => {
                self.handlers.insert(track_number, handler);
            }
            None => {
                self.handlers.remove(&track_number);
            }
        }
    }

    /// Set the file offset of the next KLV (after parsing a partition pack
    /// or a seek).
    pub fn set_file_offset(&mut self, offset: u64) {
        self.file_offset = offset;
    }

    /// File offset of the next read.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Set the stream offset of the next KLV within this container.
    pub fn set_stream_offset(&mut self, offset: u64) {
        self.stream_offset = offset;
    }

    /// Stream offset of the next read.
    pub fn stream_offset(&self) -> u64 {
        self.stream_offset
    }

    /// The layout tracker fed by this reader.
    pub fn layout(&self) -> &GcLayout {
        &self.layout
    }

    /// True when the last pass ended because a handler stopped it.
    pub fn stopped(&self) -> bool {
        self.stop_now
    }

    /// Read KLVs from a position, dispatching each to its handler.
    pub fn read_from_at(
        &mut self,
        file: &mut dyn ReadSeek,
        file_offset: u64,
        stream_offset: u64,
        focus: bool,
        unit: ReaderUnit,
        count: usize,
    ) -> Result<bool> {
        self.file_offset = file_offset;
        self.stream_offset = stream_offset;
        self.read_from(file, focus, unit, count)
    }

    /// Read KLVs, dispatching each to its handler.
    ///
    /// With `focus`, reading stops once `count` of the given `unit` have
    /// been consumed (a `count` of 0 reads forever). Returns false at end
    /// of file, on a partition boundary, or when a handler stopped the
    /// pass.
    pub fn read_from(
        &mut self,
        file: &mut dyn ReadSeek,
        focus: bool,
        unit: ReaderUnit,
        count: usize,
    ) -> Result<bool> {
        Ok(self.read_counted(file, focus, unit, count)?.0)
    }

    /// As [`read_from`](GcReader::read_from), also reporting how many of
    /// `unit` were consumed (so a caller spanning partitions can carry the
    /// remaining budget over).
    pub fn read_counted(
        &mut self,
        file: &mut dyn ReadSeek,
        focus: bool,
        unit: ReaderUnit,
        count: usize,
    ) -> Result<(bool, usize)> {
        self.stop_now = false;
        self.push_back_requested = false;
        let mut consumed = 0usize;

        loop {
            file.seek(SeekFrom::Start(self.file_offset))?;
            let Some((key, length)) = read_key_length(file, self.file_offset)? else {
                return Ok((false, consumed));
            };

            // Partition packs bound the essence region; they are handled by
            // the body reader, never consumed here.
            if key.is_partition_pack() {
                return Ok((false, consumed));
            }

            // The KLV size on disk uses whatever BER size the writer chose.
            let header_size = file.stream_position()? - self.file_offset;

            // A corrupt length must not run past the file (or trigger an
            // absurd allocation).
            let value_at = self.file_offset + header_size;
            let end = file.seek(SeekFrom::End(0))?;
            file.seek(SeekFrom::Start(value_at))?;
            if length > end.saturating_sub(value_at) {
                return Err(mxfkit_core::KlvError::MalformedLength {
                    offset: self.file_offset,
                    message: format!(
                        "KLV length {} overruns the {} bytes remaining",
                        length,
                        end.saturating_sub(value_at)
                    ),
                }
                .into());
            }

            let mut value = vec![0u8; length as usize];
            file.read_exact(&mut value)?;
            let klv = Klv {
                key,
                value,
                offset: self.file_offset,
            };
            let klv_size = header_size + length;

            let mut package_boundary = false;
            if let Some(kind) = klv.key.gc_element_kind() {
                let event = self.layout.offer(kind);
                if event == LayoutEvent::Inconsistent {
                    log::warn!(
                        "content package layout deviates at {} (stream offset {})",
                        klv.key,
                        self.stream_offset
                    );
                }
                package_boundary = event == LayoutEvent::NewPackage;
            }

            if !self.handle_data(&klv)? {
                return Ok((false, consumed));
            }

            if self.stop_now {
                if !self.push_back_requested {
                    self.file_offset += klv_size;
                    self.stream_offset += klv_size;
                }
                return Ok((false, consumed));
            }

            self.file_offset += klv_size;
            self.stream_offset += klv_size;

            if focus {
                match unit {
                    ReaderUnit::Klv => consumed += 1,
                    ReaderUnit::GcPackage => {
                        if package_boundary {
                            consumed += 1;
                        }
                    }
                    // Partition and container units are counted by the body
                    // reader; within one container they never elapse.
                    ReaderUnit::Partition | ReaderUnit::Container => {}
                }
                if count != 0 && consumed >= count {
                    return Ok((true, consumed));
                }
            }
        }
    }

    /// Dispatch one KLV to the appropriate handler.
    ///
    /// Public so an encryption handler can resubmit a decrypted KLV for
    /// normal dispatch.
    pub fn handle_data(&mut self, klv: &Klv) -> Result<bool> {
        let mut control = GcReaderControl {
            stop: false,
            push_back: false,
            stream_offset: self.stream_offset,
            file_offset: self.file_offset,
        };

        let handler = if klv.key.is_fill_item() {
            self.filler_handler.clone()
        } else if klv.key.is_encrypted() {
            self.encryption_handler
                .clone()
                .or_else(|| self.default_handler.clone())
        } else {
            let track = klv.key.gc_track_number();
            if track != 0 {
                self.handlers
                    .get(&track)
                    .cloned()
                    .or_else(|| self.default_handler.clone())
            } else {
                self.default_handler.clone()
            }
        };

        let ok = match handler {
            Some(handler) => handler.borrow_mut().handle_data(&mut control, klv)?,
            None => true,
        };

        if control.stop {
            self.stop_now = true;
            self.push_back_requested = control.push_back;
        }

        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mxfkit_core::ul::labels;
    use std::io::Cursor;

    struct Collector {
        tracks: Vec<u32>,
        sizes: Vec<usize>,
        stop_at: Option<usize>,
        push_back: bool,
    }

    impl Collector {
        fn new() -> Self {
            Collector {
                tracks: Vec::new(),
                sizes: Vec::new(),
                stop_at: None,
                push_back: false,
            }
        }
    }

    impl GcReadHandler for Collector {
        fn handle_data(&mut self, control: &mut GcReaderControl, klv: &Klv) -> Result<bool> {
            self.tracks.push(klv.key.gc_track_number());
            self.sizes.push(klv.value.len());
            if let Some(stop_at) = self.stop_at {
                if self.tracks.len() >= stop_at {
                    control.stop_reading(self.push_back);
                }
            }
            Ok(true)
        }
    }

    fn essence_klv(item: u8, number: u8, size: usize) -> Vec<u8> {
        let mut key = labels::GC_ESSENCE_KEY_BASE;
        key[12] = item;
        key[13] = 0x01;
        key[14] = 0x05;
        key[15] = number;
        let mut out = Vec::new();
        Klv::new(key, vec![number; size]).write(&mut out).unwrap();
        out
    }

    fn track(item: u8, number: u8) -> u32 {
        u32::from_be_bytes([item, 0x01, 0x05, number])
    }

    #[test]
    fn test_dispatch_by_track_number() {
        let mut data = Vec::new();
        data.extend(essence_klv(0x15, 1, 10));
        data.extend(essence_klv(0x16, 1, 20));
        data.extend(essence_klv(0x15, 1, 30));

        let picture = Rc::new(RefCell::new(Collector::new()));
        let default = Rc::new(RefCell::new(Collector::new()));

        let mut reader = GcReader::new(Some(default.clone()), None);
        reader.set_data_handler(track(0x15, 1), Some(picture.clone()));

        let mut file = Cursor::new(data);
        let done = reader.read_from(&mut file, false, ReaderUnit::Klv, 0).unwrap();
        assert!(!done); // end of file

        assert_eq!(picture.borrow().sizes, vec![10, 30]);
        assert_eq!(default.borrow().sizes, vec![20]);
    }

    #[test]
    fn test_filler_never_reaches_default() {
        let mut data = Vec::new();
        data.extend(essence_klv(0x15, 1, 10));
        mxfkit_core::klv::write_filler(&mut data, 27, 64, false).unwrap();
        data.extend(essence_klv(0x15, 1, 10));

        let default = Rc::new(RefCell::new(Collector::new()));
        let filler = Rc::new(RefCell::new(Collector::new()));

        let mut reader = GcReader::new(Some(default.clone()), Some(filler.clone()));
        let mut file = Cursor::new(data);
        reader.read_from(&mut file, false, ReaderUnit::Klv, 0).unwrap();

        assert_eq!(default.borrow().tracks.len(), 2);
        assert_eq!(filler.borrow().tracks.len(), 1);
    }

    #[test]
    fn test_focus_counts_klvs() {
        let mut data = Vec::new();
        for _ in 0..5 {
            data.extend(essence_klv(0x15, 1, 8));
        }

        let default = Rc::new(RefCell::new(Collector::new()));
        let mut reader = GcReader::new(Some(default.clone()), None);
        let mut file = Cursor::new(data);

        let more = reader.read_from(&mut file, true, ReaderUnit::Klv, 2).unwrap();
        assert!(more);
        assert_eq!(default.borrow().tracks.len(), 2);

        // Continue from where the first pass stopped
        reader.read_from(&mut file, true, ReaderUnit::Klv, 2).unwrap();
        assert_eq!(default.borrow().tracks.len(), 4);
    }

    #[test]
    fn test_focus_counts_packages() {
        // Three packages of (picture, sound)
        let mut data = Vec::new();
        for _ in 0..3 {
            data.extend(essence_klv(0x15, 1, 8));
            data.extend(essence_klv(0x16, 1, 4));
        }

        let default = Rc::new(RefCell::new(Collector::new()));
        let mut reader = GcReader::new(Some(default.clone()), None);
        let mut file = Cursor::new(data);

        // Two package boundaries = two packages consumed
        reader
            .read_from(&mut file, true, ReaderUnit::GcPackage, 2)
            .unwrap();
        // Stops on seeing the picture element starting package 2
        assert_eq!(default.borrow().tracks.len(), 3);
    }

    #[test]
    fn test_stop_with_push_back_re_reads() {
        let mut data = Vec::new();
        data.extend(essence_klv(0x15, 1, 8));
        data.extend(essence_klv(0x16, 1, 4));

        let handler = Rc::new(RefCell::new(Collector::new()));
        handler.borrow_mut().stop_at = Some(1);
        handler.borrow_mut().push_back = true;

        let mut reader = GcReader::new(Some(handler.clone()), None);
        let mut file = Cursor::new(data);

        let done = reader.read_from(&mut file, false, ReaderUnit::Klv, 0).unwrap();
        assert!(!done);
        assert_eq!(reader.file_offset(), 0); // pushed back

        // The next pass re-reads the same KLV
        handler.borrow_mut().stop_at = None;
        reader.read_from(&mut file, false, ReaderUnit::Klv, 0).unwrap();
        assert_eq!(handler.borrow().sizes, vec![8, 8, 4]);
    }

    #[test]
    fn test_stops_at_partition_pack() {
        let mut data = Vec::new();
        data.extend(essence_klv(0x15, 1, 8));
        let mut part_key = labels::PARTITION_PACK_BASE;
        part_key[13] = 0x03;
        part_key[14] = 0x04;
        Klv::new(part_key, vec![0; 88]).write(&mut data).unwrap();

        let default = Rc::new(RefCell::new(Collector::new()));
        let mut reader = GcReader::new(Some(default.clone()), None);
        let mut file = Cursor::new(data);

        let done = reader.read_from(&mut file, false, ReaderUnit::Klv, 0).unwrap();
        assert!(!done);
        // Only the essence KLV was dispatched; the pack is left unread
        assert_eq!(default.borrow().tracks.len(), 1);
        assert_eq!(reader.file_offset(), 25);
    }
}
