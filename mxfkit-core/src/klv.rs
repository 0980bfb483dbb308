//! KLV (Key-Length-Value) triplet handling.
//!
//! All data in an MXF file is encoded as KLV triplets:
//! - Key: 16-byte Universal Label identifying the data
//! - Length: BER-encoded length of the value (1..=9 bytes)
//! - Value: the actual data
//!
//! This module also computes KAG-aligned filler KLVs and provides the
//! 2-byte-tag local-set helpers used by index table segments.

use crate::error::{KlvError, Result};
use crate::ul::{labels, UniversalLabel};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Minimum overhead of a KLV with a short-form BER length: key + 1.
pub const MIN_KLV_SIZE_SHORT: u64 = 17;

/// Minimum overhead of a KLV with a forced 4-byte BER length: key + 4.
pub const MIN_KLV_SIZE_BER4: u64 = 20;

/// Largest filler the length encoding scheme supports.
pub const MAX_FILLER_SIZE: u64 = 0x00FF_FFFF;

/// A KLV triplet with its value loaded.
#[derive(Debug, Clone)]
pub struct Klv {
    /// Universal Label (key).
    pub key: UniversalLabel,
    /// Value data.
    pub value: Vec<u8>,
    /// Offset of the key within the file, if known.
    pub offset: u64,
}

impl Klv {
    /// Create a new KLV.
    pub fn new(key: impl Into<UniversalLabel>, value: Vec<u8>) -> Self {
        Klv {
            key: key.into(),
            value,
            offset: 0,
        }
    }

    /// Value length.
    pub fn length(&self) -> usize {
        self.value.len()
    }

    /// Total size including key and an auto-sized BER length.
    pub fn total_size(&self) -> usize {
        16 + ber_length_size(self.value.len() as u64) + self.value.len()
    }

    /// Write this KLV with an auto-sized BER length.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<usize> {
        self.write_with_ber(writer, 0)
    }

    /// Write this KLV with a forced BER length size (0 for auto).
    pub fn write_with_ber<W: Write>(&self, writer: &mut W, ber_size: usize) -> Result<usize> {
        writer.write_all(self.key.as_bytes())?;
        let len_bytes = encode_ber(self.value.len() as u64, ber_size)?;
        writer.write_all(&len_bytes)?;
        writer.write_all(&self.value)?;
        Ok(16 + len_bytes.len() + self.value.len())
    }

    /// Read the next KLV from a reader, or `None` at a clean end of stream.
    ///
    /// `offset` is the file position of the key, recorded in the result and
    /// used for error context.
    pub fn read<R: Read>(reader: &mut R, offset: u64) -> Result<Option<Klv>> {
        let Some((key, length)) = read_key_length(reader, offset)? else {
            return Ok(None);
        };

        let mut value = vec![0u8; length as usize];
        reader.read_exact(&mut value)?;

        Ok(Some(Klv { key, value, offset }))
    }
}

/// Read just the key and BER length of the next KLV, leaving the reader
/// positioned at the first value byte. Returns `None` at a clean EOF.
pub fn read_key_length<R: Read + ?Sized>(
    reader: &mut R,
    offset: u64,
) -> Result<Option<(UniversalLabel, u64)>> {
    let mut key = [0u8; 16];
    match reader.read_exact(&mut key) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    if key[0..4] != labels::SMPTE_PREFIX {
        return Err(KlvError::MalformedKey { offset }.into());
    }

    let (length, _) = read_ber(reader, offset + 16)?;
    Ok(Some((UniversalLabel(key), length)))
}

/// Number of bytes an auto-sized BER encoding of `length` occupies.
pub fn ber_length_size(length: u64) -> usize {
    if length < 0x80 {
        1
    } else {
        1 + (8 - (length.leading_zeros() / 8) as usize)
    }
}

/// Encode a length as BER.
///
/// `size` 0 selects the smallest encoding (short form below 128, otherwise
/// the minimal long form). A non-zero `size` forces exactly that many bytes
/// in total (1 for short form, 2..=9 for `0x80|n` plus n data bytes) so the
/// field can be back-patched later; the call fails with `MalformedLength`
/// when the value cannot be represented in the requested size.
pub fn encode_ber(length: u64, size: usize) -> Result<Vec<u8>> {
    if size == 0 {
        if length < 0x80 {
            return Ok(vec![length as u8]);
        }
        let n = ber_length_size(length) - 1;
        let mut out = Vec::with_capacity(1 + n);
        out.push(0x80 | n as u8);
        out.extend_from_slice(&length.to_be_bytes()[8 - n..]);
        return Ok(out);
    }

    if size == 1 {
        if length < 0x80 {
            return Ok(vec![length as u8]);
        }
        return Err(KlvError::MalformedLength {
            offset: 0,
            message: format!("length {} does not fit short-form BER", length),
        }
        .into());
    }

    let n = size - 1;
    if n > 8 || (n < 8 && length >= 1u64 << (8 * n)) {
        return Err(KlvError::MalformedLength {
            offset: 0,
            message: format!("length {} does not fit {}-byte BER", length, size),
        }
        .into());
    }

    let mut out = Vec::with_capacity(size);
    out.push(0x80 | n as u8);
    out.extend_from_slice(&length.to_be_bytes()[8 - n..]);
    Ok(out)
}

/// Decode a BER length from a byte slice, returning (length, bytes consumed).
pub fn decode_ber(data: &[u8]) -> Result<(u64, usize)> {
    if data.is_empty() {
        return Err(KlvError::MalformedLength {
            offset: 0,
            message: "no data for BER length".into(),
        }
        .into());
    }

    let first = data[0];
    if first < 0x80 {
        return Ok((first as u64, 1));
    }
    if first == 0x80 {
        return Err(KlvError::MalformedLength {
            offset: 0,
            message: "indefinite BER length not permitted".into(),
        }
        .into());
    }

    let n = (first & 0x7F) as usize;
    if n > 8 {
        return Err(KlvError::MalformedLength {
            offset: 0,
            message: format!("BER length declares {} bytes", n),
        }
        .into());
    }
    if data.len() < 1 + n {
        return Err(KlvError::MalformedLength {
            offset: 0,
            message: "truncated BER length".into(),
        }
        .into());
    }

    let mut length: u64 = 0;
    for &b in &data[1..1 + n] {
        length = (length << 8) | b as u64;
    }
    Ok((length, 1 + n))
}

/// Decode a BER length from a reader, returning (length, bytes consumed).
pub fn read_ber<R: Read + ?Sized>(reader: &mut R, offset: u64) -> Result<(u64, usize)> {
    let first = reader.read_u8()?;
    if first < 0x80 {
        return Ok((first as u64, 1));
    }
    if first == 0x80 {
        return Err(KlvError::MalformedLength {
            offset,
            message: "indefinite BER length not permitted".into(),
        }
        .into());
    }

    let n = (first & 0x7F) as usize;
    if n > 8 {
        return Err(KlvError::MalformedLength {
            offset,
            message: format!("BER length declares {} bytes", n),
        }
        .into());
    }

    let mut length: u64 = 0;
    for _ in 0..n {
        length = (length << 8) | reader.read_u8()? as u64;
    }
    Ok((length, 1 + n))
}

/// Compute the total size of the filler KLV needed to move `position` to the
/// next KAG boundary.
///
/// The size is `(kag - position % kag) % kag`, raised by whole KAGs until it
/// can hold at least a key and its length field. A KAG of 0 or 1 with no
/// outstanding misalignment yields 0 (no filler required).
pub fn filler_size(position: u64, kag: u32, force_ber4: bool) -> Result<u64> {
    if kag <= 1 {
        return Ok(0);
    }
    let kag = kag as u64;
    let mut size = (kag - position % kag) % kag;
    if size == 0 {
        return Ok(0);
    }

    let min = if force_ber4 {
        MIN_KLV_SIZE_BER4
    } else {
        MIN_KLV_SIZE_SHORT
    };
    while size < min {
        size += kag;
    }

    if size > MAX_FILLER_SIZE {
        log::error!(
            "filler of {} bytes at position {} exceeds the maximum of {}",
            size,
            position,
            MAX_FILLER_SIZE
        );
        return Err(KlvError::FillerTooLarge {
            needed: size,
            max: MAX_FILLER_SIZE,
            position,
        }
        .into());
    }

    Ok(size)
}

/// Write a filler KLV that aligns `position` to the next KAG boundary.
///
/// Returns the number of bytes written (possibly 0).
pub fn write_filler<W: Write + ?Sized>(
    writer: &mut W,
    position: u64,
    kag: u32,
    force_ber4: bool,
) -> Result<u64> {
    let size = filler_size(position, kag, force_ber4)?;
    if size == 0 {
        return Ok(0);
    }
    write_filler_exact(writer, size, force_ber4)
}

/// Write a filler KLV of exactly `size` total bytes.
///
/// `size` must be at least the minimum KLV overhead for the chosen BER
/// form and no more than [`MAX_FILLER_SIZE`].
pub fn write_filler_exact<W: Write + ?Sized>(writer: &mut W, size: u64, force_ber4: bool) -> Result<u64> {
    let min = if force_ber4 {
        MIN_KLV_SIZE_BER4
    } else {
        MIN_KLV_SIZE_SHORT
    };
    if size < min || size > MAX_FILLER_SIZE {
        return Err(KlvError::FillerTooLarge {
            needed: size,
            max: MAX_FILLER_SIZE,
            position: 0,
        }
        .into());
    }

    writer.write_all(&labels::FILL_ITEM)?;

    // The BER field and the value must together fill exactly `size - 16`
    // bytes, so a non-minimal long form is used where the boundary demands.
    let (value_len, len_bytes) = if force_ber4 {
        let value_len = size - MIN_KLV_SIZE_BER4;
        (value_len, encode_ber(value_len, 4)?)
    } else if size - MIN_KLV_SIZE_SHORT < 0x80 {
        let value_len = size - MIN_KLV_SIZE_SHORT;
        (value_len, encode_ber(value_len, 1)?)
    } else {
        let mut n = 1u64;
        loop {
            let value_len = size - MIN_KLV_SIZE_SHORT - n;
            if value_len < 1u64 << (8 * n) {
                break (value_len, encode_ber(value_len, n as usize + 1)?);
            }
            n += 1;
        }
    };

    writer.write_all(&len_bytes)?;
    writer.write_all(&vec![0u8; value_len as usize])?;
    Ok(size)
}

/// Write a local-set item (2-byte tag, 2-byte length).
pub fn write_local_item<W: Write>(writer: &mut W, tag: u16, value: &[u8]) -> Result<usize> {
    debug_assert!(value.len() <= 0xFFFF);
    writer.write_u16::<BigEndian>(tag)?;
    writer.write_u16::<BigEndian>(value.len() as u16)?;
    writer.write_all(value)?;
    Ok(4 + value.len())
}

/// Read a local-set item at `offset`, returning (tag, value, bytes consumed).
pub fn read_local_item(data: &[u8], offset: usize) -> Result<(u16, &[u8], usize)> {
    if offset + 4 > data.len() {
        return Err(KlvError::MalformedLength {
            offset: offset as u64,
            message: "truncated local-set item header".into(),
        }
        .into());
    }

    let tag = u16::from_be_bytes([data[offset], data[offset + 1]]);
    let length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;

    if offset + 4 + length > data.len() {
        return Err(KlvError::MalformedLength {
            offset: offset as u64,
            message: format!("local-set item 0x{:04x} overruns the set", tag),
        }
        .into());
    }

    Ok((tag, &data[offset + 4..offset + 4 + length], 4 + length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::Cursor;

    #[test]
    fn test_ber_short_form() {
        let encoded = encode_ber(100, 0).unwrap();
        assert_eq!(encoded, vec![100]);
        assert_eq!(decode_ber(&encoded).unwrap(), (100, 1));
    }

    #[test]
    fn test_ber_long_form() {
        let encoded = encode_ber(1000, 0).unwrap();
        assert_eq!(encoded, vec![0x82, 0x03, 0xE8]);
        assert_eq!(decode_ber(&encoded).unwrap(), (1000, 3));
    }

    #[test]
    fn test_ber_forced_four_bytes() {
        let encoded = encode_ber(24, 4).unwrap();
        assert_eq!(encoded, vec![0x83, 0x00, 0x00, 24]);
        assert_eq!(decode_ber(&encoded).unwrap(), (24, 4));
    }

    #[test]
    fn test_ber_forced_overflow() {
        assert!(encode_ber(0x1_0000, 3).is_err());
        assert!(encode_ber(200, 1).is_err());
    }

    #[test]
    fn test_ber_max_eight_byte() {
        let max = (1u64 << 56) - 1;
        let encoded = encode_ber(max, 8).unwrap();
        assert_eq!(encoded[0], 0x87);
        assert_eq!(&encoded[1..], &[0xFF; 7]);
        assert_eq!(decode_ber(&encoded).unwrap(), (max, 8));
    }

    #[test]
    fn test_ber_decode_rejects_indefinite() {
        assert!(decode_ber(&[0x80]).is_err());
    }

    #[test]
    fn test_ber_decode_rejects_overlong() {
        assert!(decode_ber(&[0x89, 0, 0, 0, 0, 0, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_filler_exact_kag() {
        // position already aligned: no filler
        assert_eq!(filler_size(1024, 512, false).unwrap(), 0);
    }

    #[test]
    fn test_filler_small_gap_grows() {
        // a 10-byte gap cannot hold a KLV, so a whole KAG is added
        assert_eq!(filler_size(502, 512, false).unwrap(), 522);
    }

    #[test]
    fn test_filler_ber4_minimum() {
        // 24-byte gap is fine with 4-byte BER (>= 20)
        assert_eq!(filler_size(1000, 512, true).unwrap(), 24);
        // 18-byte gap is not, and grows by one KAG
        assert_eq!(filler_size(494, 512, true).unwrap(), 530);
    }

    #[test]
    fn test_filler_too_large_fails() {
        let err = filler_size(1, 0x0100_0000, false).unwrap_err();
        assert!(matches!(
            err,
            Error::Klv(KlvError::FillerTooLarge { .. })
        ));
    }

    #[test]
    fn test_write_filler_alignment() {
        for pos in [0u64, 1, 100, 511, 1000, 4095] {
            for kag in [64u32, 512, 4096] {
                let mut buf = Vec::new();
                let written = write_filler(&mut buf, pos, kag, false).unwrap();
                assert_eq!(written as usize, buf.len());
                assert_eq!((pos + written) % kag as u64, 0, "pos {} kag {}", pos, kag);
            }
        }
    }

    #[test]
    fn test_write_filler_ber4_layout() {
        // KAG 512, position 1000, forced 4-byte BER: 24 total bytes,
        // 0x83 length prefix and 4 zero value bytes.
        let mut buf = Vec::new();
        let written = write_filler(&mut buf, 1000, 512, true).unwrap();
        assert_eq!(written, 24);
        assert_eq!(&buf[0..4], &labels::SMPTE_PREFIX);
        assert_eq!(buf[16], 0x83);
        assert_eq!(&buf[17..20], &[0, 0, 4]);
        assert_eq!(&buf[20..24], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_klv_roundtrip() {
        let klv = Klv::new(labels::FILL_ITEM, vec![1, 2, 3, 4]);
        let mut buf = Vec::new();
        let size = klv.write(&mut buf).unwrap();
        assert_eq!(size, 16 + 1 + 4);

        let mut cursor = Cursor::new(buf);
        let back = Klv::read(&mut cursor, 0).unwrap().unwrap();
        assert!(back.key.is_fill_item());
        assert_eq!(back.value, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_klv_read_eof() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(Klv::read(&mut cursor, 0).unwrap().is_none());
    }

    #[test]
    fn test_klv_read_bad_key() {
        let mut data = vec![0u8; 17];
        data[16] = 0;
        let mut cursor = Cursor::new(data);
        let err = Klv::read(&mut cursor, 7).unwrap_err();
        assert!(matches!(
            err,
            Error::Klv(KlvError::MalformedKey { offset: 7 })
        ));
    }

    #[test]
    fn test_local_item_roundtrip() {
        let mut buf = Vec::new();
        write_local_item(&mut buf, 0x3F0B, &[1, 2, 3]).unwrap();
        let (tag, value, consumed) = read_local_item(&buf, 0).unwrap();
        assert_eq!(tag, 0x3F0B);
        assert_eq!(value, &[1, 2, 3]);
        assert_eq!(consumed, 7);
    }
}
