//! The body reader.
//!
//! Walks the partitions of a file and hands the essence region of each to
//! the [`GcReader`] registered for its BodySID. Partition packs, filler
//! between partitions and the random index pack are consumed here; essence
//! KLVs are dispatched by the per-container readers.

use crate::gc::reader::{GcReader, ReaderUnit, SharedReadHandler};
use crate::partition::{Partition, RandomIndexPack};
use mxfkit_core::klv::read_key_length;
use mxfkit_core::ul::labels;
use mxfkit_core::{DemuxError, MuxError, Result};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

/// Per-partition geometry learned while walking the file, used for
/// stream-offset seeks.
#[derive(Debug, Clone, Copy)]
struct EssenceRegion {
    /// BodySID of the essence.
    body_sid: u32,
    /// Stream offset of the partition's first essence byte.
    body_offset: u64,
    /// File offset of the partition's first essence byte.
    file_offset: u64,
}

/// Reads the body of an MXF file, dispatching essence to per-BodySID
/// generic container readers.
pub struct BodyReader<R: Read + Seek> {
    file: R,
    /// Offset of the next KLV to examine.
    current_pos: u64,
    /// The position was changed by a seek; reading must reinitialise.
    new_pos: bool,
    at_eof: bool,
    current_body_sid: u32,

    default_handler: Option<SharedReadHandler>,
    filler_handler: Option<SharedReadHandler>,
    encryption_handler: Option<SharedReadHandler>,

    readers: HashMap<u32, GcReader>,

    /// Partition essence regions, filled by [`init_seek`](BodyReader::init_seek).
    regions: Vec<EssenceRegion>,
    seek_inited: bool,
}

impl<R: Read + Seek> BodyReader<R> {
    /// Create a body reader over a file.
    pub fn new(file: R) -> Self {
        BodyReader {
            file,
            current_pos: 0,
            new_pos: true,
            at_eof: false,
            current_body_sid: 0,
            default_handler: None,
            filler_handler: None,
            encryption_handler: None,
            readers: HashMap::new(),
            regions: Vec::new(),
            seek_inited: false,
        }
    }

    /// Recover the file.
    pub fn into_inner(self) -> R {
        self.file
    }

    /// Set the default handler used by newly created container readers.
    pub fn set_default_handler(&mut self, handler: Option<SharedReadHandler>) {
        self.default_handler = handler;
    }

    /// Set the filler handler used by newly created container readers.
    pub fn set_filler_handler(&mut self, handler: Option<SharedReadHandler>) {
        self.filler_handler = handler;
    }

    /// Set the encryption handler used by newly created container readers.
    pub fn set_encryption_handler(&mut self, handler: Option<SharedReadHandler>) {
        self.encryption_handler = handler;
    }

    /// Create a container reader for a BodySID.
    ///
    /// Returns false if one already exists.
    pub fn make_gc_reader(&mut self, body_sid: u32) -> bool {
        if self.readers.contains_key(&body_sid) {
            return false;
        }
        let mut reader = GcReader::new(self.default_handler.clone(), self.filler_handler.clone());
        if let Some(handler) = &self.encryption_handler {
            reader.set_encryption_handler(Some(handler.clone()));
        }
        self.readers.insert(body_sid, reader);
        true
    }

    /// The container reader for a BodySID.
    pub fn gc_reader(&mut self, body_sid: u32) -> Option<&mut GcReader> {
        self.readers.get_mut(&body_sid)
    }

    /// The BodySID of the current position (0 when not known).
    pub fn body_sid(&self) -> u32 {
        self.current_body_sid
    }

    /// Current file position.
    pub fn tell(&self) -> u64 {
        self.current_pos
    }

    /// Move to an absolute file position.
    pub fn seek(&mut self, position: u64) -> Result<u64> {
        self.file.seek(SeekFrom::Start(position))?;
        self.current_pos = position;
        self.new_pos = true;
        self.at_eof = false;
        self.current_body_sid = 0;
        Ok(position)
    }

    /// Move to a byte offset within a given essence stream.
    pub fn seek_stream(&mut self, body_sid: u32, stream_offset: u64) -> Result<u64> {
        self.init_seek()?;

        let region = self
            .regions
            .iter()
            .filter(|r| r.body_sid == body_sid && r.body_offset <= stream_offset)
            .last()
            .copied()
            .ok_or(DemuxError::InvalidPartition {
                offset: 0,
                message: format!("no partition holds offset {} of BodySID {}", stream_offset, body_sid),
            })?;

        let position = region.file_offset + (stream_offset - region.body_offset);
        self.current_pos = position;
        self.new_pos = false;
        self.at_eof = false;
        self.current_body_sid = body_sid;
        if let Some(reader) = self.readers.get_mut(&body_sid) {
            reader.set_file_offset(position);
            reader.set_stream_offset(stream_offset);
        }
        Ok(position)
    }

    /// Report the stream offset of a given BodySID's reader.
    pub fn tell_stream(&mut self, body_sid: u32) -> Option<u64> {
        self.readers.get(&body_sid).map(|r| r.stream_offset())
    }

    /// Walk every partition once, recording essence regions for seeking.
    ///
    /// Prefers the random index pack when the file ends with one; falls
    /// back to a KLV walk from the head of the file.
    fn init_seek(&mut self) -> Result<()> {
        if self.seek_inited {
            return Ok(());
        }

        let mut pack_offsets = Vec::new();

        // The last four bytes of the file give the RIP size when a RIP is
        // present.
        let file_len = self.file.seek(SeekFrom::End(0))?;
        if file_len >= 4 {
            self.file.seek(SeekFrom::End(-4))?;
            let mut overall = [0u8; 4];
            self.file.read_exact(&mut overall)?;
            let overall = u32::from_be_bytes(overall) as u64;
            if overall >= 20 && overall <= file_len {
                self.file.seek(SeekFrom::Start(file_len - overall))?;
                if let Ok(Some((key, length))) =
                    read_key_length(&mut self.file, file_len - overall)
                {
                    if key.is_random_index_pack() {
                        let mut value = vec![0u8; length as usize];
                        self.file.read_exact(&mut value)?;
                        if let Ok(rip) = RandomIndexPack::parse(&value) {
                            pack_offsets = rip.entries.iter().map(|e| e.byte_offset).collect();
                        }
                    }
                }
            }
        }

        if pack_offsets.is_empty() {
            // No RIP: walk the KLV stream recording partition packs.
            let mut position = 0u64;
            loop {
                self.file.seek(SeekFrom::Start(position))?;
                let Some((key, length)) = read_key_length(&mut self.file, position)? else {
                    break;
                };
                if key.is_partition_pack() {
                    pack_offsets.push(position);
                }
                position = self.file.stream_position()? + length;
            }
        }

        for offset in pack_offsets {
            self.file.seek(SeekFrom::Start(offset))?;
            let Some((key, length)) = read_key_length(&mut self.file, offset)? else {
                continue;
            };
            if !key.is_partition_pack() {
                continue;
            }
            let mut value = vec![0u8; length as usize];
            self.file.read_exact(&mut value)?;
            let pack = Partition::parse(&key, &value, offset)?;
            if pack.body_sid != 0 {
                let essence_at = self.file.stream_position()?
                    + pack.header_byte_count
                    + pack.index_byte_count;
                self.regions.push(EssenceRegion {
                    body_sid: pack.body_sid,
                    body_offset: pack.body_offset,
                    file_offset: essence_at,
                });
            }
        }

        self.seek_inited = true;
        Ok(())
    }

    /// Are we at the start of a partition pack?
    pub fn is_at_partition(&mut self) -> Result<bool> {
        self.file.seek(SeekFrom::Start(self.current_pos))?;
        let mut key = [0u8; 16];
        match self.file.read_exact(&mut key) {
            Ok(()) => Ok(mxfkit_core::UniversalLabel(key).is_partition_pack()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Are we at the end of the file?
    pub fn eof(&self) -> bool {
        self.at_eof
    }

    /// Read KLVs, dispatching essence to the per-SID container readers.
    ///
    /// With `focus`, reading stops after `count` of `unit` have been
    /// consumed. Returns false at end of file or when a handler stopped
    /// the pass.
    pub fn read_from_file(&mut self, focus: bool, unit: ReaderUnit, count: usize) -> Result<bool> {
        let mut remaining = count;
        self.new_pos = false;

        loop {
            self.file.seek(SeekFrom::Start(self.current_pos))?;
            let Some((key, length)) = read_key_length(&mut self.file, self.current_pos)? else {
                self.at_eof = true;
                return Ok(false);
            };
            let header_size = self.file.stream_position()? - self.current_pos;

            // Guard against corrupt lengths before any allocation.
            let value_at = self.current_pos + header_size;
            let end = self.file.seek(SeekFrom::End(0))?;
            self.file.seek(SeekFrom::Start(value_at))?;
            if length > end.saturating_sub(value_at) {
                return Err(mxfkit_core::KlvError::MalformedLength {
                    offset: self.current_pos,
                    message: format!(
                        "KLV length {} overruns the {} bytes remaining",
                        length,
                        end.saturating_sub(value_at)
                    ),
                }
                .into());
            }

            if key.is_partition_pack() {
                let mut value = vec![0u8; length as usize];
                self.file.read_exact(&mut value)?;
                let pack = Partition::parse(&key, &value, self.current_pos)?;

                let previous_sid = self.current_body_sid;
                self.current_body_sid = pack.body_sid;
                self.current_pos = self.current_pos
                    + header_size
                    + length
                    + pack.header_byte_count
                    + pack.index_byte_count;

                if pack.body_sid != 0 {
                    if let Some(reader) = self.readers.get_mut(&pack.body_sid) {
                        reader.set_file_offset(self.current_pos);
                        reader.set_stream_offset(pack.body_offset);
                    }
                }

                if focus {
                    let elapsed = match unit {
                        ReaderUnit::Partition => true,
                        ReaderUnit::Container => {
                            pack.body_sid != 0 && pack.body_sid != previous_sid
                        }
                        _ => false,
                    };
                    if elapsed {
                        if remaining > 0 {
                            remaining -= 1;
                        }
                        if count != 0 && remaining == 0 {
                            return Ok(true);
                        }
                    }
                }
                continue;
            }

            if key.is_fill_item() || key.is_random_index_pack() {
                self.file.seek(SeekFrom::Current(length as i64))?;
                self.current_pos += header_size + length;
                continue;
            }

            // Anything else is essence territory.
            if self.current_body_sid == 0 {
                return Err(MuxError::UnexpectedKlv {
                    key: key.to_string(),
                    offset: self.current_pos,
                }
                .into());
            }

            let Some(reader) = self.readers.get_mut(&self.current_body_sid) else {
                // Nobody cares about this container: skip KLV by KLV.
                self.file.seek(SeekFrom::Current(length as i64))?;
                self.current_pos += header_size + length;
                continue;
            };

            reader.set_file_offset(self.current_pos);
            let (satisfied, consumed) =
                reader.read_counted(&mut self.file, focus, unit, remaining)?;
            self.current_pos = reader.file_offset();
            remaining = remaining.saturating_sub(consumed);

            if satisfied {
                return Ok(true);
            }
            if reader.stopped() {
                return Ok(false);
            }
            // Otherwise the container reader hit a partition boundary or
            // the end of the file; loop to find out which.
            if !self.is_at_partition()? {
                self.at_eof = true;
                return Ok(false);
            }
        }
    }

    /// Resync after loss or corruption of body data: scan forward for the
    /// next partition pack and reposition there.
    ///
    /// Returns false if no partition pack lies between here and the end of
    /// the file.
    pub fn resync(&mut self) -> Result<bool> {
        // Start the scan one byte ahead so a corrupt pack at the current
        // position is not immediately re-found.
        let mut position = self.current_pos + 1;
        log::warn!("resynchronising body reader from offset {}", position);

        let mut window = [0u8; 4096];
        let mut carry: Vec<u8> = Vec::new();

        loop {
            self.file.seek(SeekFrom::Start(position))?;
            let got = read_up_to(&mut self.file, &mut window)?;
            if got == 0 {
                self.at_eof = true;
                return Ok(false);
            }

            // Scan with a 13-byte overlap carried across window edges.
            let mut haystack = std::mem::take(&mut carry);
            let carry_len = haystack.len();
            haystack.extend_from_slice(&window[..got]);

            for i in 0..haystack.len().saturating_sub(13) {
                if partition_prefix_at(&haystack[i..]) {
                    let found = position - carry_len as u64 + i as u64;
                    self.current_pos = found;
                    self.new_pos = true;
                    self.current_body_sid = 0;
                    log::warn!("resync found a partition pack at offset {}", found);
                    return Ok(true);
                }
            }

            let keep = haystack.len().min(13);
            carry = haystack[haystack.len() - keep..].to_vec();
            position += got as u64;
        }
    }
}

/// Does the buffer open with a partition pack key (byte 7 wildcarded)?
fn partition_prefix_at(data: &[u8]) -> bool {
    if data.len() < 14 {
        return false;
    }
    for (i, &expected) in labels::PARTITION_PACK_BASE[..13].iter().enumerate() {
        if i == 7 {
            continue;
        }
        if data[i] != expected {
            return false;
        }
    }
    (0x02..=0x04).contains(&data[13])
}

fn read_up_to<T: Read>(reader: &mut T, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::reader::{GcReadHandler, GcReaderControl};
    use mxfkit_core::klv::Klv;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    struct Collector {
        values: Vec<Vec<u8>>,
    }

    impl GcReadHandler for Collector {
        fn handle_data(&mut self, _control: &mut GcReaderControl, klv: &Klv) -> Result<bool> {
            self.values.push(klv.value.clone());
            Ok(true)
        }
    }

    /// A two-partition file: header (no essence), body with two essence
    /// KLVs, footer, RIP.
    fn build_test_file() -> Vec<u8> {
        let mut out = Vec::new();

        let mut header = Partition::header();
        header.write(&mut out).unwrap();

        let body_at = out.len() as u64;
        let mut body = Partition::body();
        body.this_partition = body_at;
        body.body_sid = 1;
        body.write(&mut out).unwrap();

        let mut key = labels::GC_ESSENCE_KEY_BASE;
        key[12] = 0x15;
        key[13] = 0x01;
        key[14] = 0x05;
        key[15] = 0x01;
        Klv::new(key, vec![0xAA; 10]).write(&mut out).unwrap();
        Klv::new(key, vec![0xBB; 12]).write(&mut out).unwrap();

        let footer_at = out.len() as u64;
        let mut footer = Partition::footer();
        footer.this_partition = footer_at;
        footer.previous_partition = body_at;
        footer.footer_partition = footer_at;
        footer.write(&mut out).unwrap();

        let mut rip = RandomIndexPack::new();
        rip.add_entry(0, 0);
        rip.add_entry(1, body_at);
        rip.add_entry(0, footer_at);
        rip.write(&mut out).unwrap();

        out
    }

    #[test]
    fn test_walks_partitions_and_dispatches() {
        let handler = Rc::new(RefCell::new(Collector { values: Vec::new() }));
        let mut reader = BodyReader::new(Cursor::new(build_test_file()));
        reader.set_default_handler(Some(handler.clone()));
        reader.make_gc_reader(1);

        let done = reader.read_from_file(false, ReaderUnit::Klv, 0).unwrap();
        assert!(!done); // ran to end of file
        assert!(reader.eof());

        let values = &handler.borrow().values;
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], vec![0xAA; 10]);
        assert_eq!(values[1], vec![0xBB; 12]);
    }

    #[test]
    fn test_focus_on_single_klv() {
        let handler = Rc::new(RefCell::new(Collector { values: Vec::new() }));
        let mut reader = BodyReader::new(Cursor::new(build_test_file()));
        reader.set_default_handler(Some(handler.clone()));
        reader.make_gc_reader(1);

        assert!(reader.read_from_file(true, ReaderUnit::Klv, 1).unwrap());
        assert_eq!(handler.borrow().values.len(), 1);

        assert!(reader.read_from_file(true, ReaderUnit::Klv, 1).unwrap());
        assert_eq!(handler.borrow().values.len(), 2);
    }

    #[test]
    fn test_unregistered_sid_skipped() {
        let mut reader = BodyReader::new(Cursor::new(build_test_file()));
        // No GC reader for BodySID 1: the pass completes without dispatch
        let done = reader.read_from_file(false, ReaderUnit::Klv, 0).unwrap();
        assert!(!done);
        assert!(reader.eof());
    }

    #[test]
    fn test_resync_after_corruption() {
        let mut data = build_test_file();
        // Corrupt the BER length of the first essence KLV
        let body_pack_size = Partition::body().size();
        let header_size = Partition::header().size();
        let corrupt_at = header_size + body_pack_size + 16;
        data[corrupt_at] = 0x87; // claims a huge 7-byte length

        let handler = Rc::new(RefCell::new(Collector { values: Vec::new() }));
        let mut reader = BodyReader::new(Cursor::new(data));
        reader.set_default_handler(Some(handler.clone()));
        reader.make_gc_reader(1);

        // The damaged length swallows the rest of the file
        let _ = reader.read_from_file(false, ReaderUnit::Klv, 0);

        // Resync from the corruption point
        reader.seek(corrupt_at as u64 - 16).unwrap();
        assert!(reader.resync().unwrap());

        // The reader landed on a partition pack
        assert!(reader.is_at_partition().unwrap());
    }

    #[test]
    fn test_resync_at_eof_fails() {
        let mut reader = BodyReader::new(Cursor::new(vec![0u8; 256]));
        assert!(!reader.resync().unwrap());
    }

    #[test]
    fn test_seek_stream() {
        let mut reader = BodyReader::new(Cursor::new(build_test_file()));
        reader.make_gc_reader(1);

        // Stream offset 25 is the second essence KLV (first is 16+1+10+?...
        // actually 16 key + 1 BER + 10 value = 27)
        let position = reader.seek_stream(1, 27).unwrap();
        let handler = Rc::new(RefCell::new(Collector { values: Vec::new() }));
        reader
            .gc_reader(1)
            .unwrap()
            .set_default_handler(Some(handler.clone()));

        reader.read_from_file(true, ReaderUnit::Klv, 1).unwrap();
        assert_eq!(handler.borrow().values[0], vec![0xBB; 12]);
        assert!(position > 0);
    }

    #[test]
    fn test_focus_counts_partitions() {
        let mut reader = BodyReader::new(Cursor::new(build_test_file()));
        reader.make_gc_reader(1);

        // Two partitions: header and body
        assert!(reader
            .read_from_file(true, ReaderUnit::Partition, 2)
            .unwrap());
        assert_eq!(reader.body_sid(), 1);
    }
}
