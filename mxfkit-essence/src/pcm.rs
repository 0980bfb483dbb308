//! WAVE / PCM audio sub-parser.
//!
//! Parses the RIFF header of a WAVE file and serves the PCM payload in
//! edit-unit sized blocks. PCM is constant-rate, so the parser advertises
//! CBR indexing, and it can slave to a video edit rate by grouping a
//! varying number of samples per edit unit (the 1601/1602 pattern at
//! 30000/1001 and friends).

use crate::parser::{EssenceInfo, EssenceStreamDescriptor, EssenceSubParser, ReadSeek};
use crate::wrapping::{WrapType, WrappingOption};
use byteorder::{LittleEndian, ReadBytesExt};
use mxfkit_core::ul::labels;
use mxfkit_core::{EssenceError, Rational, Result};
use std::io::{Read, Seek, SeekFrom};
use uuid::Uuid;

/// Source format id for WAVE files.
pub const WAVE_FORMAT: Uuid = Uuid::from_bytes([
    0x54, 0x21, 0x9e, 0x2e, 0x1d, 0xd5, 0x44, 0x51, 0xb2, 0x21, 0x50, 0x10, 0x4c, 0x86, 0xae, 0x4f,
]);

/// WAVE / PCM sub-parser.
#[derive(Debug)]
pub struct WavePcmParser {
    channels: u16,
    sample_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
    /// Offset of the PCM payload.
    data_start: u64,
    /// Length of the PCM payload in bytes.
    data_len: u64,

    native_rate: Rational,
    selected_rate: Rational,

    /// Samples fully consumed so far.
    samples_read: u64,
    /// Edit units fully consumed so far.
    position: i64,
    /// Bytes of the current edit unit already delivered.
    delivered: u64,

    wrapping: Option<WrappingOption>,
    vbr_index_mode: bool,
    end_of_item: bool,
}

impl WavePcmParser {
    /// Create a new parser.
    pub fn new() -> Self {
        WavePcmParser {
            channels: 0,
            sample_rate: 0,
            block_align: 0,
            bits_per_sample: 0,
            data_start: 0,
            data_len: 0,
            native_rate: Rational::new(1, 1),
            selected_rate: Rational::new(1, 1),
            samples_read: 0,
            position: 0,
            delivered: 0,
            wrapping: None,
            vbr_index_mode: false,
            end_of_item: true,
        }
    }

    fn is_clip_wrap(&self) -> bool {
        self.wrapping
            .as_ref()
            .map(|w| w.wrap_type == WrapType::Clip)
            .unwrap_or(false)
    }

    /// Parse the RIFF/WAVE header; true when the file is PCM WAVE.
    fn parse_header(&mut self, file: &mut dyn ReadSeek) -> Result<bool> {
        file.rewind()?;
        let mut fourcc = [0u8; 4];
        if file.read_exact(&mut fourcc).is_err() || &fourcc != b"RIFF" {
            return Ok(false);
        }
        let _riff_size = file.read_u32::<LittleEndian>()?;
        if file.read_exact(&mut fourcc).is_err() || &fourcc != b"WAVE" {
            return Ok(false);
        }

        let mut have_fmt = false;
        loop {
            if file.read_exact(&mut fourcc).is_err() {
                break;
            }
            let chunk_size = match file.read_u32::<LittleEndian>() {
                Ok(size) => size as u64,
                Err(_) => break,
            };

            match &fourcc {
                b"fmt " => {
                    let audio_format = file.read_u16::<LittleEndian>()?;
                    self.channels = file.read_u16::<LittleEndian>()?;
                    self.sample_rate = file.read_u32::<LittleEndian>()?;
                    let _byte_rate = file.read_u32::<LittleEndian>()?;
                    self.block_align = file.read_u16::<LittleEndian>()?;
                    self.bits_per_sample = file.read_u16::<LittleEndian>()?;
                    if audio_format != 1 {
                        // Not linear PCM
                        return Ok(false);
                    }
                    have_fmt = true;
                    if chunk_size > 16 {
                        file.seek(SeekFrom::Current(chunk_size as i64 - 16))?;
                    }
                }
                b"data" => {
                    self.data_start = file.stream_position()?;
                    self.data_len = chunk_size;
                    break;
                }
                _ => {
                    // Chunks are word aligned
                    file.seek(SeekFrom::Current((chunk_size + (chunk_size & 1)) as i64))?;
                }
            }
        }

        if !have_fmt || self.data_len == 0 || self.block_align == 0 {
            return Ok(false);
        }

        self.native_rate = Rational::new(self.sample_rate as i32, 1);
        self.selected_rate = self.native_rate;
        Ok(true)
    }

    /// Total samples in the payload.
    fn total_samples(&self) -> u64 {
        self.data_len / self.block_align as u64
    }

    /// Samples in edit unit `n` at the selected rate.
    ///
    /// Distributes non-integer sample counts so the long-run average is
    /// exact: unit n spans samples floor(n·k)..floor((n+1)·k) where
    /// k = sample_rate · den / num.
    fn samples_in_unit(&self, n: i64) -> u64 {
        let sr = self.sample_rate as i128;
        let num = self.selected_rate.num as i128;
        let den = self.selected_rate.den as i128;
        let start = (n as i128 * sr * den) / num;
        let end = ((n as i128 + 1) * sr * den) / num;
        (end - start) as u64
    }

    /// Constant samples per edit unit, or None when they vary.
    fn constant_samples_per_unit(&self) -> Option<u64> {
        let product = self.sample_rate as u64 * self.selected_rate.den as u64;
        if self.selected_rate.num > 0 && product % self.selected_rate.num as u64 == 0 {
            Some(product / self.selected_rate.num as u64)
        } else {
            None
        }
    }
}

impl Default for WavePcmParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EssenceSubParser for WavePcmParser {
    fn name(&self) -> &'static str {
        "WAVE-PCM"
    }

    fn identify_essence(
        &mut self,
        file: &mut dyn ReadSeek,
    ) -> Result<Vec<EssenceStreamDescriptor>> {
        if !self.parse_header(file)? {
            return Ok(Vec::new());
        }

        Ok(vec![EssenceStreamDescriptor {
            id: 0,
            source_format: WAVE_FORMAT,
            description: format!(
                "PCM audio, {} Hz {}-bit {} channel",
                self.sample_rate, self.bits_per_sample, self.channels
            ),
            info: EssenceInfo::Audio {
                sample_rate: self.sample_rate,
                channels: self.channels,
                bits_per_sample: self.bits_per_sample,
                block_align: self.block_align,
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
                description: "AES/BWF frame wrapping".to_string(),
                wrapping_id: Some(labels::GC_PCM_FRAME),
                wrapping_ul: labels::GC_PCM_FRAME,
                gc_essence_type: 0x16,
                gc_element_type: 0x01,
                wrap_type: WrapType::Frame,
                can_slave: true,
                can_index: true,
                cbr_index: true,
                ber_size: 4,
                bytes_per_edit_unit: self.block_align as u32,
            },
            WrappingOption {
                name: "clip",
                description: "AES/BWF clip wrapping".to_string(),
                wrapping_id: Some(labels::GC_PCM_CLIP),
                wrapping_ul: labels::GC_PCM_CLIP,
                gc_essence_type: 0x16,
                gc_element_type: 0x01,
                wrap_type: WrapType::Clip,
                can_slave: true,
                can_index: true,
                cbr_index: true,
                ber_size: 0,
                bytes_per_edit_unit: self.block_align as u32,
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
        if rate.num <= 0 || rate.den <= 0 {
            return false;
        }
        self.selected_rate = rate;
        true
    }

    fn bytes_per_edit_unit(&mut self, _kag: u32) -> u32 {
        match self.constant_samples_per_unit() {
            Some(samples) => samples as u32 * self.block_align as u32,
            None => 0,
        }
    }

    fn current_position(&self) -> i64 {
        self.position
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
        let total = self.total_samples();
        if self.samples_read >= total {
            self.end_of_item = true;
            return Ok(None);
        }

        let unit_samples = self
            .samples_in_unit(self.position)
            .min(total - self.samples_read);
        let unit_bytes = unit_samples * self.block_align as u64;
        let remaining = unit_bytes - self.delivered;

        let take = if max_size > 0 {
            remaining.min(max_size as u64)
        } else {
            remaining
        };

        let offset =
            self.data_start + self.samples_read * self.block_align as u64 + self.delivered;
        let mut chunk = vec![0u8; take as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut chunk)?;
        self.delivered += take;

        let unit_complete = self.delivered >= unit_bytes;
        if unit_complete {
            self.samples_read += unit_samples;
            self.position += 1;
            self.delivered = 0;
        }

        self.end_of_item = if self.is_clip_wrap() && !self.vbr_index_mode {
            self.samples_read >= total
        } else {
            unit_complete
        };

        Ok(Some(chunk))
    }

    fn next_chunk_size(&mut self, _file: &mut dyn ReadSeek, max_size: usize) -> Result<usize> {
        let total = self.total_samples();
        if self.samples_read >= total {
            return Ok(0);
        }
        let unit_samples = self
            .samples_in_unit(self.position)
            .min(total - self.samples_read);
        let remaining = (unit_samples * self.block_align as u64 - self.delivered) as usize;
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
        self.block_align != 0 && self.samples_read >= self.total_samples()
    }

    fn enable_vbr_index_mode(&mut self) {
        self.vbr_index_mode = true;
    }

    fn re_validate(&mut self, file: &mut dyn ReadSeek) -> bool {
        let previous = (
            self.channels,
            self.sample_rate,
            self.block_align,
            self.bits_per_sample,
        );
        let position_carried = self.position;

        match self.parse_header(file) {
            Ok(true) => {
                let matches = previous
                    == (
                        self.channels,
                        self.sample_rate,
                        self.block_align,
                        self.bits_per_sample,
                    );
                if !matches {
                    log::warn!("WAVE format changed across file-set boundary");
                    return false;
                }
                // Positions continue; only the payload window restarts.
                self.samples_read = 0;
                self.delivered = 0;
                self.position = position_carried;
                true
            }
            _ => false,
        }
    }
}
