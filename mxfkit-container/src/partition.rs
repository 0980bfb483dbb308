//! Partition packs and the random index pack.
//!
//! An MXF file is a sequence of partitions: a header partition, optional
//! body partitions, and a footer. Each opens with a partition pack KLV
//! recording the file geometry (offsets of this, the previous and the
//! footer partition, byte counts of metadata and index data) and the SIDs
//! of the data that follows.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use mxfkit_core::klv::encode_ber;
use mxfkit_core::ul::{labels, UniversalLabel, UL};
use mxfkit_core::{DemuxError, Result};
use std::io::{Cursor, Read, Write};

/// Partition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// Header partition (first in the file).
    Header,
    /// Body partition.
    Body,
    /// Footer partition (last, cannot contain essence).
    Footer,
}

/// Whether the partition's metadata may still change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    /// Values may be updated by a later partition.
    Open,
    /// Values are final.
    Closed,
}

/// Whether required metadata is present and correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionCompleteness {
    /// Some metadata is absent or provisional.
    Incomplete,
    /// All metadata is present.
    Complete,
}

/// An MXF partition pack.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Partition kind.
    pub kind: PartitionKind,
    /// Open or closed.
    pub status: PartitionStatus,
    /// Complete or incomplete.
    pub completeness: PartitionCompleteness,
    /// Major version (1).
    pub major_version: u16,
    /// Minor version (2 or 3).
    pub minor_version: u16,
    /// KLV alignment grid for this partition.
    pub kag_size: u32,
    /// Offset of this partition in the file.
    pub this_partition: u64,
    /// Offset of the previous partition (0 in the header).
    pub previous_partition: u64,
    /// Offset of the footer partition (0 until known, back-patched).
    pub footer_partition: u64,
    /// Byte count of the header metadata (primer through last set,
    /// including trailing filler).
    pub header_byte_count: u64,
    /// Byte count of the index table segments in this partition.
    pub index_byte_count: u64,
    /// Stream ID of the index data in this partition (0 if none).
    pub index_sid: u32,
    /// Byte offset of the first essence byte within its container.
    pub body_offset: u64,
    /// Stream ID of the essence in this partition (0 if none).
    pub body_sid: u32,
    /// Operational pattern label.
    pub operational_pattern: UL,
    /// Labels of every essence container in the file.
    pub essence_containers: Vec<UL>,
}

impl Default for Partition {
    fn default() -> Self {
        Partition {
            kind: PartitionKind::Header,
            status: PartitionStatus::Closed,
            completeness: PartitionCompleteness::Complete,
            major_version: 1,
            minor_version: 3,
            kag_size: 1,
            this_partition: 0,
            previous_partition: 0,
            footer_partition: 0,
            header_byte_count: 0,
            index_byte_count: 0,
            index_sid: 0,
            body_offset: 0,
            body_sid: 0,
            operational_pattern: labels::OP1A,
            essence_containers: Vec::new(),
        }
    }
}

impl Partition {
    /// Create a header partition pack.
    pub fn header() -> Self {
        Partition::default()
    }

    /// Create a body partition pack.
    pub fn body() -> Self {
        Partition {
            kind: PartitionKind::Body,
            ..Default::default()
        }
    }

    /// Create a footer partition pack.
    pub fn footer() -> Self {
        Partition {
            kind: PartitionKind::Footer,
            ..Default::default()
        }
    }

    /// The pack key for this kind/status/completeness combination.
    pub fn pack_key(&self) -> UL {
        let mut key = labels::PARTITION_PACK_BASE;
        key[13] = match self.kind {
            PartitionKind::Header => 0x02,
            PartitionKind::Body => 0x03,
            PartitionKind::Footer => 0x04,
        };
        key[14] = match (self.status, self.completeness) {
            (PartitionStatus::Open, PartitionCompleteness::Incomplete) => 0x01,
            (PartitionStatus::Closed, PartitionCompleteness::Incomplete) => 0x02,
            (PartitionStatus::Open, PartitionCompleteness::Complete) => 0x03,
            (PartitionStatus::Closed, PartitionCompleteness::Complete) => 0x04,
        };
        key
    }

    /// Parse a partition pack from its key and KLV value.
    pub fn parse(key: &UniversalLabel, value: &[u8], offset: u64) -> Result<Self> {
        if !key.is_partition_pack() {
            return Err(DemuxError::InvalidPartition {
                offset,
                message: format!("{} is not a partition pack key", key),
            }
            .into());
        }

        let kind = match key.as_bytes()[13] {
            0x02 => PartitionKind::Header,
            0x03 => PartitionKind::Body,
            0x04 => PartitionKind::Footer,
            other => {
                return Err(DemuxError::InvalidPartition {
                    offset,
                    message: format!("unknown partition type 0x{:02x}", other),
                }
                .into())
            }
        };
        let status = match key.as_bytes()[14] {
            0x01 | 0x03 => PartitionStatus::Open,
            _ => PartitionStatus::Closed,
        };
        let completeness = match key.as_bytes()[14] {
            0x01 | 0x02 => PartitionCompleteness::Incomplete,
            _ => PartitionCompleteness::Complete,
        };

        if value.len() < 88 {
            return Err(DemuxError::InvalidPartition {
                offset,
                message: format!("pack value is {} bytes, need 88", value.len()),
            }
            .into());
        }

        let mut cursor = Cursor::new(value);
        let major_version = cursor.read_u16::<BigEndian>()?;
        let minor_version = cursor.read_u16::<BigEndian>()?;
        let kag_size = cursor.read_u32::<BigEndian>()?;
        let this_partition = cursor.read_u64::<BigEndian>()?;
        let previous_partition = cursor.read_u64::<BigEndian>()?;
        let footer_partition = cursor.read_u64::<BigEndian>()?;
        let header_byte_count = cursor.read_u64::<BigEndian>()?;
        let index_byte_count = cursor.read_u64::<BigEndian>()?;
        let index_sid = cursor.read_u32::<BigEndian>()?;
        let body_offset = cursor.read_u64::<BigEndian>()?;
        let body_sid = cursor.read_u32::<BigEndian>()?;

        let mut operational_pattern = [0u8; 16];
        cursor.read_exact(&mut operational_pattern)?;

        let batch_count = cursor.read_u32::<BigEndian>()?;
        let batch_item_size = cursor.read_u32::<BigEndian>()?;
        let mut essence_containers = Vec::new();
        for _ in 0..batch_count {
            if batch_item_size == 16 {
                let mut ul = [0u8; 16];
                cursor.read_exact(&mut ul)?;
                essence_containers.push(ul);
            } else {
                cursor.set_position(cursor.position() + batch_item_size as u64);
            }
        }

        Ok(Partition {
            kind,
            status,
            completeness,
            major_version,
            minor_version,
            kag_size,
            this_partition,
            previous_partition,
            footer_partition,
            header_byte_count,
            index_byte_count,
            index_sid,
            body_offset,
            body_sid,
            operational_pattern,
            essence_containers,
        })
    }

    /// Write the full partition pack KLV. Returns bytes written.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<usize> {
        writer.write_all(&self.pack_key())?;

        let value_size = self.value_size();
        // Partition packs always use a 4-byte BER so in-place rewrites
        // (footer back-patching) cannot change the pack size.
        let len_bytes = encode_ber(value_size as u64, 4)?;
        writer.write_all(&len_bytes)?;

        writer.write_u16::<BigEndian>(self.major_version)?;
        writer.write_u16::<BigEndian>(self.minor_version)?;
        writer.write_u32::<BigEndian>(self.kag_size)?;
        writer.write_u64::<BigEndian>(self.this_partition)?;
        writer.write_u64::<BigEndian>(self.previous_partition)?;
        writer.write_u64::<BigEndian>(self.footer_partition)?;
        writer.write_u64::<BigEndian>(self.header_byte_count)?;
        writer.write_u64::<BigEndian>(self.index_byte_count)?;
        writer.write_u32::<BigEndian>(self.index_sid)?;
        writer.write_u64::<BigEndian>(self.body_offset)?;
        writer.write_u32::<BigEndian>(self.body_sid)?;
        writer.write_all(&self.operational_pattern)?;

        writer.write_u32::<BigEndian>(self.essence_containers.len() as u32)?;
        writer.write_u32::<BigEndian>(16)?;
        for ec in &self.essence_containers {
            writer.write_all(ec)?;
        }

        Ok(16 + 4 + value_size)
    }

    /// Size of the pack value in bytes.
    fn value_size(&self) -> usize {
        88 + self.essence_containers.len() * 16
    }

    /// Total size of the pack KLV in bytes.
    pub fn size(&self) -> usize {
        16 + 4 + self.value_size()
    }

    /// Record an essence container label, ignoring duplicates.
    pub fn add_essence_container(&mut self, ul: UL) {
        if !self.essence_containers.contains(&ul) {
            self.essence_containers.push(ul);
        }
    }
}

/// One entry of the random index pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipEntry {
    /// BodySID of the partition (0 for metadata-only partitions).
    pub body_sid: u32,
    /// Byte offset of the partition pack.
    pub byte_offset: u64,
}

/// The random index pack: partition offsets for random access, written as
/// the very last KLV of the file.
#[derive(Debug, Clone, Default)]
pub struct RandomIndexPack {
    /// Partition entries, in file order.
    pub entries: Vec<RipEntry>,
}

impl RandomIndexPack {
    /// An empty RIP.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a partition entry.
    pub fn add_entry(&mut self, body_sid: u32, byte_offset: u64) {
        self.entries.push(RipEntry {
            body_sid,
            byte_offset,
        });
    }

    /// Parse a RIP from its KLV value.
    pub fn parse(value: &[u8]) -> Result<Self> {
        if value.len() < 4 || (value.len() - 4) % 12 != 0 {
            return Err(DemuxError::InvalidPartition {
                offset: 0,
                message: format!("random index pack value of {} bytes", value.len()),
            }
            .into());
        }

        let mut cursor = Cursor::new(&value[..value.len() - 4]);
        let mut entries = Vec::new();
        for _ in 0..(value.len() - 4) / 12 {
            let body_sid = cursor.read_u32::<BigEndian>()?;
            let byte_offset = cursor.read_u64::<BigEndian>()?;
            entries.push(RipEntry {
                body_sid,
                byte_offset,
            });
        }

        Ok(RandomIndexPack { entries })
    }

    /// Write the RIP KLV. Returns bytes written.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let value_size = self.entries.len() * 12 + 4;

        writer.write_all(&labels::RANDOM_INDEX_PACK)?;
        let len_bytes = encode_ber(value_size as u64, 4)?;
        writer.write_all(&len_bytes)?;

        for entry in &self.entries {
            writer.write_u32::<BigEndian>(entry.body_sid)?;
            writer.write_u64::<BigEndian>(entry.byte_offset)?;
        }

        // The final field is the byte length of the whole pack, so a reader
        // can locate the RIP from the end of the file.
        let overall = (16 + 4 + value_size) as u32;
        writer.write_u32::<BigEndian>(overall)?;

        Ok(overall as usize)
    }
}
