//! Universal Label (UL) types.
//!
//! Universal Labels are 16-byte SMPTE identifiers naming every key, essence
//! container, wrapping and metadata set in an MXF file. Byte 7 is a version
//! number and is treated as a wildcard when labels are compared.

use std::fmt;

/// A raw 16-byte Universal Label.
pub type UL = [u8; 16];

/// Universal Label wrapper with helper methods.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniversalLabel(pub UL);

impl UniversalLabel {
    /// Create from raw bytes.
    pub const fn new(bytes: UL) -> Self {
        UniversalLabel(bytes)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &UL {
        &self.0
    }

    /// Check if this is a SMPTE-registered label (starts with 06 0E 2B 34).
    pub fn is_smpte(&self) -> bool {
        self.0[0..4] == labels::SMPTE_PREFIX
    }

    /// Label equality with byte 7 (the version byte) wildcarded.
    pub fn matches(&self, other: &UL) -> bool {
        self.0[0..7] == other[0..7] && self.0[8..16] == other[8..16]
    }

    /// Check if the first `len` bytes match, skipping byte 7.
    ///
    /// Used for key families where the trailing bytes vary (fill items,
    /// partition packs, GC element keys).
    pub fn matches_prefix(&self, pattern: &[u8], len: usize) -> bool {
        debug_assert!(len <= 16 && len <= pattern.len());
        for i in 0..len {
            if i == 7 {
                continue;
            }
            if self.0[i] != pattern[i] {
                return false;
            }
        }
        true
    }

    /// Check if this is a partition pack key (header, body or footer).
    pub fn is_partition_pack(&self) -> bool {
        self.matches_prefix(&labels::PARTITION_PACK_BASE, 13)
            && (self.0[13] >= 0x02 && self.0[13] <= 0x04)
    }

    /// Check if this is a primer pack key.
    pub fn is_primer_pack(&self) -> bool {
        self.matches(&labels::PRIMER_PACK)
    }

    /// Check if this is a fill item key.
    pub fn is_fill_item(&self) -> bool {
        self.matches_prefix(&labels::FILL_ITEM, 13)
    }

    /// Check if this is an index table segment key.
    pub fn is_index_segment(&self) -> bool {
        self.matches(&labels::INDEX_TABLE_SEGMENT)
    }

    /// Check if this is a random index pack key.
    pub fn is_random_index_pack(&self) -> bool {
        self.matches(&labels::RANDOM_INDEX_PACK)
    }

    /// Check if this is a GC essence element key.
    pub fn is_gc_essence(&self) -> bool {
        self.matches_prefix(&labels::GC_ESSENCE_KEY_BASE, 12)
    }

    /// Check if this is a GC system item key.
    pub fn is_gc_system(&self) -> bool {
        // System item keys use the groups registry (byte 4 = 0x02) with the
        // GC designator, item types 0x04 (CP) or 0x14 (GC).
        self.matches_prefix(&labels::GC_SYSTEM_KEY_BASE, 12)
            && (self.0[12] == 0x04 || self.0[12] == 0x14)
    }

    /// Check if this is an encrypted-triplet key.
    pub fn is_encrypted(&self) -> bool {
        self.matches(&labels::ENCRYPTED_TRIPLET)
    }

    /// Parse the GC element kind from bytes 13..16, if this is a GC key.
    pub fn gc_element_kind(&self) -> Option<GcElementKind> {
        if !self.is_gc_essence() && !self.is_gc_system() {
            return None;
        }
        Some(GcElementKind {
            item: self.0[12],
            count: self.0[13],
            element_type: self.0[14],
            number: self.0[15],
        })
    }

    /// Get the GC track number encoded in the final four key bytes.
    ///
    /// Returns 0 for keys that are not GC element keys.
    pub fn gc_track_number(&self) -> u32 {
        if !self.is_gc_essence() && !self.is_gc_system() {
            return 0;
        }
        u32::from_be_bytes([self.0[12], self.0[13], self.0[14], self.0[15]])
    }
}

impl fmt::Display for UniversalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for UniversalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UL({})", self)
    }
}

impl From<UL> for UniversalLabel {
    fn from(bytes: UL) -> Self {
        UniversalLabel(bytes)
    }
}

/// The four bytes of a GC element key that identify its place in a content
/// package: item type, element count, element type, element number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcElementKind {
    /// Item type (byte 13 of the key): 0x04..0x18, CP or GC variants.
    pub item: u8,
    /// Element count, or scheme id for system items.
    pub count: u8,
    /// Element type.
    pub element_type: u8,
    /// Element number, or sub id for system items.
    pub number: u8,
}

impl GcElementKind {
    /// Item class rank used for same-level layout ordering:
    /// Sys < Pic < Snd < Data < Cpd.
    pub fn class_rank(&self) -> u8 {
        self.item & 0x0F
    }

    /// True for CP-compatible item types (high nibble 0).
    pub fn is_cp(&self) -> bool {
        self.item & 0xF0 == 0x00
    }

    /// True for picture items (0x05 / 0x15).
    pub fn is_picture(&self) -> bool {
        self.class_rank() == 0x05
    }

    /// True for sound items (0x06 / 0x16).
    pub fn is_sound(&self) -> bool {
        self.class_rank() == 0x06
    }

    /// True for data items (0x07 / 0x17).
    pub fn is_data(&self) -> bool {
        self.class_rank() == 0x07
    }

    /// True for system items (0x04 / 0x14).
    pub fn is_system(&self) -> bool {
        self.class_rank() == 0x04
    }

    /// True for compound items (0x18).
    pub fn is_compound(&self) -> bool {
        self.item == 0x18
    }
}

/// Well-known Universal Labels.
pub mod labels {
    use super::UL;

    /// SMPTE label prefix.
    pub const SMPTE_PREFIX: [u8; 4] = [0x06, 0x0E, 0x2B, 0x34];

    /// Partition pack base; byte 13 selects header (0x02), body (0x03) or
    /// footer (0x04), byte 14 the open/closed completeness state.
    pub const PARTITION_PACK_BASE: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x00, 0x00,
        0x00,
    ];

    /// Primer pack.
    pub const PRIMER_PACK: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x05, 0x01,
        0x00,
    ];

    /// Fill item. Bytes 13..16 are fixed but byte 7 varies between versions.
    pub const FILL_ITEM: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x01, 0x01, 0x01, 0x02, 0x03, 0x01, 0x02, 0x10, 0x01, 0x00, 0x00,
        0x00,
    ];

    /// Index table segment.
    pub const INDEX_TABLE_SEGMENT: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x10, 0x01,
        0x00,
    ];

    /// Random index pack.
    pub const RANDOM_INDEX_PACK: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x11, 0x01,
        0x00,
    ];

    /// GC essence element key base: bytes 13..16 carry item type, element
    /// count, element type and element number.
    pub const GC_ESSENCE_KEY_BASE: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x00, 0x00, 0x00,
        0x00,
    ];

    /// GC system item key base (groups registry).
    pub const GC_SYSTEM_KEY_BASE: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x00, 0x00, 0x00,
        0x00,
    ];

    /// Encrypted triplet (cryptographic framework) key.
    pub const ENCRYPTED_TRIPLET: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x04, 0x01, 0x07, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x7E, 0x01,
        0x00,
    ];

    /// Generic container wrapping base; byte 15 is 0x01 for frame wrapping
    /// and 0x02 for clip wrapping, byte 14 the essence element type.
    pub const GC_WRAPPING_BASE: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x02, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x04, 0x60,
        0x00,
    ];

    /// Multiple-essence-types generic container label.
    pub const GC_MULTI: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x03, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x7F, 0x01,
        0x00,
    ];

    /// OP1a operational pattern.
    pub const OP1A: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x01, 0x01,
        0x00,
    ];

    /// MPEG-2 VES frame-wrapped essence container.
    pub const GC_MPEG2_VES_FRAME: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x02, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x04, 0x60,
        0x01,
    ];

    /// MPEG-2 VES clip-wrapped essence container.
    pub const GC_MPEG2_VES_CLIP: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x02, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x04, 0x60,
        0x02,
    ];

    /// AES/BWF frame-wrapped PCM essence container.
    pub const GC_PCM_FRAME: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x06, 0x01,
        0x00,
    ];

    /// AES/BWF clip-wrapped PCM essence container.
    pub const GC_PCM_CLIP: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x06, 0x02,
        0x00,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_byte_wildcard() {
        let mut a = labels::FILL_ITEM;
        a[7] = 0x01;
        let mut b = labels::FILL_ITEM;
        b[7] = 0x09;
        assert!(UniversalLabel(a).matches(&b));
        assert!(UniversalLabel(a).is_fill_item());
    }

    #[test]
    fn test_non_wildcard_bytes_compared() {
        let a = labels::FILL_ITEM;
        let mut b = labels::FILL_ITEM;
        b[10] ^= 0xFF;
        assert!(!UniversalLabel(a).matches(&b));
    }

    #[test]
    fn test_partition_pack_detection() {
        let mut key = labels::PARTITION_PACK_BASE;
        key[13] = 0x03; // body
        key[14] = 0x04; // closed complete
        let ul = UniversalLabel(key);
        assert!(ul.is_partition_pack());
        assert!(!ul.is_primer_pack());

        // Primer pack shares the prefix but byte 13 is 0x05
        assert!(!UniversalLabel(labels::PRIMER_PACK).is_partition_pack());
    }

    #[test]
    fn test_gc_element_kind() {
        let mut key = labels::GC_ESSENCE_KEY_BASE;
        key[12] = 0x15; // GC picture
        key[13] = 0x01;
        key[14] = 0x05; // MPEG
        key[15] = 0x01;
        let ul = UniversalLabel(key);

        let kind = ul.gc_element_kind().unwrap();
        assert!(kind.is_picture());
        assert!(!kind.is_cp());
        assert_eq!(ul.gc_track_number(), 0x15010501);
    }

    #[test]
    fn test_non_gc_key_has_no_kind() {
        let ul = UniversalLabel(labels::PRIMER_PACK);
        assert!(ul.gc_element_kind().is_none());
        assert_eq!(ul.gc_track_number(), 0);
    }

    #[test]
    fn test_class_ranks_order() {
        let sys = GcElementKind { item: 0x04, count: 0, element_type: 0, number: 0 };
        let pic = GcElementKind { item: 0x15, count: 0, element_type: 0, number: 0 };
        let snd = GcElementKind { item: 0x16, count: 0, element_type: 0, number: 0 };
        let dat = GcElementKind { item: 0x17, count: 0, element_type: 0, number: 0 };
        let cpd = GcElementKind { item: 0x18, count: 0, element_type: 0, number: 0 };
        assert!(sys.class_rank() < pic.class_rank());
        assert!(pic.class_rank() < snd.class_rank());
        assert!(snd.class_rank() < dat.class_rank());
        assert!(dat.class_rank() < cpd.class_rank());
    }
}
