//! MPEG-2 video elementary stream sub-parser.
//!
//! Scans start codes to frame the stream into pictures, tracks GOP state
//! to classify each picture, and offers index data (key-frame offsets,
//! flags, temporal offsets) to an attached index observer while reading.

use crate::parser::{EssenceInfo, EssenceStreamDescriptor, EssenceSubParser, ReadSeek};
use crate::source::{IndexObserver, SharedIndexObserver};
use crate::wrapping::{WrapType, WrappingOption};
use mxfkit_core::ul::labels;
use mxfkit_core::{EssenceError, Rational, Result};
use std::io::{Read, Seek, SeekFrom};
use uuid::Uuid;

const PICTURE_START_CODE: u32 = 0x0000_0100;
const SEQUENCE_HEADER_CODE: u32 = 0x0000_01B3;
const GOP_START_CODE: u32 = 0x0000_01B8;

/// Source format id for MPEG-2 video elementary stream files.
pub const MPEG2_VES_FORMAT: Uuid = Uuid::from_bytes([
    0x45, 0x54, 0x57, 0x62, 0xd6, 0xb4, 0x4e, 0x4f, 0xa1, 0x8a, 0x04, 0x7c, 0xc2, 0x3b, 0x39, 0x8f,
]);

/// Where the scan is within the current GOP, used to tell leading B
/// pictures (which only reference backwards in a closed GOP) from ordinary
/// bidirectional ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GopPlace {
    Start,
    FirstI,
    ConsecB,
    SecondI,
    PostB,
}

/// Per-picture index data computed while scanning.
#[derive(Debug, Clone, Copy)]
struct PictureIndex {
    picture_number: i64,
    anchor_offset: i8,
    flags: u8,
    temporal_entry: i64,
    temporal_offset: i32,
}

/// Result of scanning one picture: its byte span and edit-point state.
#[derive(Debug, Clone, Copy)]
struct FrameScan {
    start: u64,
    end: u64,
    edit_point: bool,
    last: bool,
}

/// MPEG-2 VES sub-parser.
pub struct Mpeg2VesParser {
    /// Byte position of the next unscanned data.
    current_pos: u64,
    /// Pictures consumed so far (stream order).
    picture_number: i64,
    /// Pictures seen in the current GOP.
    gop_offset: i64,
    closed_gop: bool,
    gop_place: GopPlace,
    /// Stream position of the most recent anchor (I) frame.
    anchor_frame: i64,
    end_of_stream: bool,
    edit_point: bool,
    end_of_item: bool,

    native_rate: Rational,
    selected_rate: Rational,
    width: u32,
    height: u32,

    wrapping: Option<WrappingOption>,
    vbr_index_mode: bool,
    observer: Option<SharedIndexObserver>,
    observer_sub_stream: usize,

    /// Cached scan of the next picture, so sizing and reading agree.
    cached_scan: Option<FrameScan>,
    /// Bytes of the cached frame already delivered (max_size splits).
    delivered: u64,

    /// Read-ahead buffer over the file.
    buf: Vec<u8>,
    buf_start: u64,
}

impl std::fmt::Debug for Mpeg2VesParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mpeg2VesParser")
            .field("current_pos", &self.current_pos)
            .field("picture_number", &self.picture_number)
            .field("gop_offset", &self.gop_offset)
            .field("closed_gop", &self.closed_gop)
            .field("gop_place", &self.gop_place)
            .field("anchor_frame", &self.anchor_frame)
            .field("end_of_stream", &self.end_of_stream)
            .field("edit_point", &self.edit_point)
            .field("end_of_item", &self.end_of_item)
            .field("native_rate", &self.native_rate)
            .field("selected_rate", &self.selected_rate)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("wrapping", &self.wrapping)
            .field("vbr_index_mode", &self.vbr_index_mode)
            .field("observer_sub_stream", &self.observer_sub_stream)
            .field("cached_scan", &self.cached_scan)
            .field("delivered", &self.delivered)
            .field("buf_start", &self.buf_start)
            .finish()
    }
}

impl Mpeg2VesParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Mpeg2VesParser {
            current_pos: 0,
            picture_number: 0,
            gop_offset: 0,
            closed_gop: false,
            gop_place: GopPlace::Start,
            anchor_frame: 0,
            end_of_stream: false,
            edit_point: false,
            end_of_item: true,
            native_rate: Rational::new(25, 1),
            selected_rate: Rational::new(25, 1),
            width: 0,
            height: 0,
            wrapping: None,
            vbr_index_mode: false,
            observer: None,
            observer_sub_stream: 0,
            cached_scan: None,
            delivered: 0,
            buf: Vec::new(),
            buf_start: 0,
        }
    }

    fn is_clip_wrap(&self) -> bool {
        self.wrapping
            .as_ref()
            .map(|w| w.wrap_type == WrapType::Clip)
            .unwrap_or(false)
    }

    /// Read the byte at `pos`, buffering 4 KiB at a time.
    fn byte_at(&mut self, file: &mut dyn ReadSeek, pos: u64) -> Result<Option<u8>> {
        if pos < self.buf_start || pos >= self.buf_start + self.buf.len() as u64 {
            file.seek(SeekFrom::Start(pos))?;
            let mut buf = vec![0u8; 4096];
            let got = read_up_to(file, &mut buf)?;
            if got == 0 {
                return Ok(None);
            }
            buf.truncate(got);
            self.buf = buf;
            self.buf_start = pos;
        }
        Ok(Some(self.buf[(pos - self.buf_start) as usize]))
    }

    /// Compute the flags, anchor offset and temporal offset for a picture,
    /// updating GOP tracking state.
    fn picture_index(
        &mut self,
        temporal_reference: i32,
        picture_type: u8,
        seq_head: bool,
    ) -> PictureIndex {
        self.gop_place = match (self.gop_place, picture_type) {
            (GopPlace::Start, 1) => GopPlace::FirstI,
            (GopPlace::FirstI, 3) => GopPlace::ConsecB,
            (GopPlace::FirstI, 1) => GopPlace::SecondI,
            (GopPlace::ConsecB, t) if t != 3 => GopPlace::PostB,
            (place, _) => place,
        };

        let mut flags: u8 = match picture_type {
            2 => 0x22,
            3 => {
                if self.closed_gop && self.gop_place == GopPlace::ConsecB {
                    0x13
                } else {
                    0x33
                }
            }
            _ => {
                self.anchor_frame = self.picture_number;
                0x00
            }
        };

        if seq_head {
            flags |= 0x40;
            if self.closed_gop {
                flags |= 0x80;
                self.edit_point = true;
            }
        }

        // MPEG anchor offsets are never positive. Offsets that burst the
        // i8 range are pinned at the maximum representable value and
        // signalled via flags bit 2.
        let mut anchor_offset = self.anchor_frame - self.picture_number;
        if anchor_offset < -128 {
            anchor_offset = 127;
            flags |= 0x04;
        }

        // The temporal offset is recorded against the picture's display
        // position and maps it back to this stream position.
        let stream_ahead = self.gop_offset - temporal_reference as i64;
        PictureIndex {
            picture_number: self.picture_number,
            anchor_offset: anchor_offset as i8,
            flags,
            temporal_entry: self.picture_number - stream_ahead,
            temporal_offset: stream_ahead as i32,
        }
    }

    /// Scan one picture starting at `current_pos`, offering its index data.
    ///
    /// Leaves `current_pos` at the start of the next picture.
    fn scan_frame(&mut self, file: &mut dyn ReadSeek) -> Result<Option<FrameScan>> {
        if let Some(scan) = self.cached_scan {
            return Ok(Some(scan));
        }
        if self.end_of_stream {
            return Ok(None);
        }

        let start = self.current_pos;
        let mut pos = self.current_pos;
        let mut scan: u32 = 0xFFFF_FFFF;
        let mut found_start = false;
        let mut seq_head = false;
        let mut last = false;
        self.edit_point = false;

        loop {
            let Some(byte) = self.byte_at(file, pos)? else {
                self.end_of_stream = true;
                last = true;
                break;
            };
            scan = (scan << 8) | byte as u32;
            pos += 1;

            if !found_start {
                match scan {
                    PICTURE_START_CODE => {
                        found_start = true;

                        let hi = self.byte_at(file, pos)?.unwrap_or(0);
                        let lo = self.byte_at(file, pos + 1)?.unwrap_or(0);
                        pos += 2;
                        let picture_data = ((hi as u16) << 8) | lo as u16;
                        let temporal_reference = (picture_data >> 6) as i32;
                        let picture_type = ((picture_data >> 3) & 0x07) as u8;

                        let index = self.picture_index(temporal_reference, picture_type, seq_head);
                        if let Some(observer) = self.observer.clone() {
                            let mut observer = observer.borrow_mut();
                            observer.offer_edit_unit(
                                self.observer_sub_stream,
                                index.picture_number,
                                index.anchor_offset,
                                Some(index.flags),
                            );
                            observer
                                .offer_temporal_offset(index.temporal_entry, index.temporal_offset);
                        }

                        self.gop_offset += 1;
                    }
                    GOP_START_CODE => {
                        self.gop_offset = 0;
                        self.gop_place = GopPlace::Start;
                        // Skip the 25-bit time code; the closed_gop flag is
                        // bit 6 of the fourth byte.
                        let flag_byte = self.byte_at(file, pos + 3)?.unwrap_or(0);
                        self.closed_gop = flag_byte & 0x40 != 0;
                        pos += 4;
                    }
                    SEQUENCE_HEADER_CODE => {
                        seq_head = true;
                    }
                    _ => {}
                }
            } else if scan == PICTURE_START_CODE
                || scan == GOP_START_CODE
                || scan == SEQUENCE_HEADER_CODE
            {
                // Start of the next picture; rewind over the start code.
                pos -= 4;
                break;
            }
        }

        if !found_start {
            // Trailing bytes with no picture (sequence end code etc.)
            self.current_pos = pos;
            return Ok(None);
        }

        let result = FrameScan {
            start,
            end: pos,
            edit_point: self.edit_point,
            last,
        };
        self.current_pos = pos;
        self.picture_number += 1;
        self.cached_scan = Some(result);
        self.delivered = 0;
        Ok(Some(result))
    }

    /// Parse a sequence header at `offset`, returning (width, height, rate).
    fn parse_sequence_header(
        &mut self,
        file: &mut dyn ReadSeek,
        offset: u64,
    ) -> Result<Option<(u32, u32, Rational)>> {
        let mut header = [0u8; 8];
        file.seek(SeekFrom::Start(offset))?;
        if read_up_to(file, &mut header)? < 8 {
            return Ok(None);
        }

        let width = ((header[0] as u32) << 4) | ((header[1] as u32) >> 4);
        let height = (((header[1] as u32) & 0x0F) << 8) | header[2] as u32;
        let frame_rate_code = header[3] & 0x0F;

        let rate = match frame_rate_code {
            1 => Rational::new(24000, 1001),
            2 => Rational::new(24, 1),
            3 => Rational::new(25, 1),
            4 => Rational::new(30000, 1001),
            5 => Rational::new(30, 1),
            6 => Rational::new(50, 1),
            7 => Rational::new(60000, 1001),
            8 => Rational::new(60, 1),
            _ => return Ok(None),
        };

        Ok(Some((width, height, rate)))
    }

    /// Locate the first sequence header in the file.
    fn find_sequence_header(&mut self, file: &mut dyn ReadSeek) -> Result<Option<u64>> {
        let mut scan: u32 = 0xFFFF_FFFF;
        let mut pos = 0u64;
        // An elementary stream opens with a sequence header almost
        // immediately; cap the probe so foreign files fail fast.
        while pos < 65536 {
            let Some(byte) = self.byte_at(file, pos)? else {
                return Ok(None);
            };
            scan = (scan << 8) | byte as u32;
            pos += 1;
            if scan == SEQUENCE_HEADER_CODE {
                return Ok(Some(pos));
            }
        }
        Ok(None)
    }
}

impl Default for Mpeg2VesParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EssenceSubParser for Mpeg2VesParser {
    fn name(&self) -> &'static str {
        "MPEG2-VES"
    }

    fn identify_essence(
        &mut self,
        file: &mut dyn ReadSeek,
    ) -> Result<Vec<EssenceStreamDescriptor>> {
        let Some(header_at) = self.find_sequence_header(file)? else {
            return Ok(Vec::new());
        };
        let Some((width, height, rate)) = self.parse_sequence_header(file, header_at)? else {
            return Ok(Vec::new());
        };

        self.width = width;
        self.height = height;
        self.native_rate = rate;
        self.selected_rate = rate;
        // Scanning starts from the sequence header, not any preceding junk.
        self.current_pos = header_at - 4;
        self.buf.clear();

        Ok(vec![EssenceStreamDescriptor {
            id: 0,
            source_format: MPEG2_VES_FORMAT,
            description: format!("MPEG-2 video, {}x{} @ {}", width, height, rate),
            info: EssenceInfo::Video {
                width,
                height,
                edit_rate: rate,
            },
        }])
    }

    fn identify_wrapping_options(
        &mut self,
        _file: &mut dyn ReadSeek,
        _descriptor: &EssenceStreamDescriptor,
    ) -> Vec<WrappingOption> {
        vec![
            WrappingOption {
                name: "frame",
                description: "MPEG-2 VES frame wrapping".to_string(),
                wrapping_id: Some(labels::GC_MPEG2_VES_FRAME),
                wrapping_ul: labels::GC_MPEG2_VES_FRAME,
                gc_essence_type: 0x15,
                gc_element_type: 0x05,
                wrap_type: WrapType::Frame,
                can_slave: false,
                can_index: true,
                cbr_index: false,
                ber_size: 4,
                bytes_per_edit_unit: 0,
            },
            WrappingOption {
                name: "clip",
                description: "MPEG-2 VES clip wrapping".to_string(),
                wrapping_id: Some(labels::GC_MPEG2_VES_CLIP),
                wrapping_ul: labels::GC_MPEG2_VES_CLIP,
                gc_essence_type: 0x15,
                gc_element_type: 0x05,
                wrap_type: WrapType::Clip,
                can_slave: false,
                can_index: true,
                cbr_index: false,
                ber_size: 0,
                bytes_per_edit_unit: 0,
            },
        ]
    }

    fn use_wrapping(&mut self, _stream: u32, wrapping: &WrappingOption) -> Result<()> {
        match wrapping.wrap_type {
            WrapType::Frame | WrapType::Clip => {
                self.wrapping = Some(wrapping.clone());
                Ok(())
            }
            other => Err(EssenceError::UnsupportedWrapping {
                wrapping: format!("{:?}", other),
                parser: self.name(),
            }
            .into()),
        }
    }

    fn edit_rate(&self) -> Rational {
        self.selected_rate
    }

    fn set_edit_rate(&mut self, rate: Rational) -> bool {
        rate == self.native_rate
    }

    fn current_position(&self) -> i64 {
        if self.selected_rate == self.native_rate {
            return self.picture_number;
        }
        // Equality test on the denominator: a zero denominator would mean
        // an unset rate, never a divisor.
        let native_den = if self.native_rate.den == 0 {
            1
        } else {
            self.native_rate.den
        };
        let scaled = self.picture_number as i128 * self.selected_rate.num as i128
            * native_den as i128;
        let divisor = self.native_rate.num as i128 * self.selected_rate.den as i128;
        (scaled / divisor) as i64
    }

    fn set_index_observer(&mut self, observer: SharedIndexObserver, sub_stream: usize) {
        self.observer = Some(observer);
        self.observer_sub_stream = sub_stream;
    }

    fn can_index(&self) -> bool {
        true
    }

    fn read_chunk(
        &mut self,
        file: &mut dyn ReadSeek,
        _size_hint: usize,
        max_size: usize,
    ) -> Result<Option<Vec<u8>>> {
        let Some(scan) = self.scan_frame(file)? else {
            self.end_of_item = true;
            return Ok(None);
        };

        let remaining = scan.end - scan.start - self.delivered;
        let take = if max_size > 0 {
            remaining.min(max_size as u64)
        } else {
            remaining
        };

        let mut chunk = vec![0u8; take as usize];
        file.seek(SeekFrom::Start(scan.start + self.delivered))?;
        file.read_exact(&mut chunk)?;
        self.delivered += take;

        let frame_complete = self.delivered >= scan.end - scan.start;
        if frame_complete {
            self.cached_scan = None;
            self.delivered = 0;
        }

        // A clip is one wrapping unit: the item only ends with the stream.
        self.end_of_item = if self.is_clip_wrap() && !self.vbr_index_mode {
            frame_complete && scan.last
        } else {
            frame_complete
        };

        Ok(Some(chunk))
    }

    fn next_chunk_size(&mut self, file: &mut dyn ReadSeek, max_size: usize) -> Result<usize> {
        let Some(scan) = self.scan_frame(file)? else {
            return Ok(0);
        };
        let remaining = (scan.end - scan.start - self.delivered) as usize;
        Ok(if max_size > 0 {
            remaining.min(max_size)
        } else {
            remaining
        })
    }

    fn end_of_item(&self) -> bool {
        self.end_of_item
    }

    fn end_of_data(&self) -> bool {
        self.end_of_stream && self.cached_scan.is_none()
    }

    fn is_edit_point(&self) -> bool {
        self.edit_point
    }

    fn enable_vbr_index_mode(&mut self) {
        self.vbr_index_mode = true;
    }

    fn re_validate(&mut self, file: &mut dyn ReadSeek) -> bool {
        // Continue picture numbering into the new file; scanning restarts
        // at its head. The read-ahead buffer still holds bytes of the
        // previous file and must go first.
        self.buf.clear();
        self.buf_start = 0;
        match self.find_sequence_header(file) {
            Ok(Some(header_at)) => {
                self.current_pos = header_at - 4;
                self.buf.clear();
                self.end_of_stream = false;
                self.cached_scan = None;
                self.delivered = 0;
                true
            }
            _ => false,
        }
    }
}

fn read_up_to<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
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
