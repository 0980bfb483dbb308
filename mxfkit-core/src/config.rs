//! Writer configuration.
//!
//! All knobs that influence file layout live here and are passed explicitly
//! to the writers; nothing is process-global.

/// Configuration for a write pass.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Permit "FastClipWrap": write the maximum 8-byte BER length, stream
    /// the value, then seek back and patch the real length. Requires a
    /// seekable sink.
    pub fast_clip_wrap: bool,
    /// Force 4-byte BER lengths wherever a choice exists.
    pub force_ber4: bool,
    /// Default KLV alignment grid, in bytes. 0 or 1 disables alignment.
    pub kag_size: u32,
    /// Emit signed, possibly negative, IndexStartPosition values for
    /// pre-charge frames. When false, positions are biased by the
    /// pre-charge count so they stay non-negative.
    pub neg_precharge_index: bool,
    /// Minimum size of the non-essence part of a partition; filler is
    /// added after metadata/index to reach it (space for later updates).
    pub min_partition_size: u32,
    /// Minimum filler between the non-essence part of a partition and the
    /// first essence KLV.
    pub min_partition_filler: u32,
    /// Index table segments may share a partition with header metadata.
    pub index_shares_with_metadata: bool,
    /// Essence may share a partition with header metadata.
    pub essence_shares_with_metadata: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            fast_clip_wrap: false,
            force_ber4: false,
            kag_size: 1,
            neg_precharge_index: true,
            min_partition_size: 0,
            min_partition_filler: 0,
            index_shares_with_metadata: true,
            essence_shares_with_metadata: false,
        }
    }
}

impl WriterConfig {
    /// Config with a given KAG size.
    pub fn with_kag(mut self, kag: u32) -> Self {
        self.kag_size = kag;
        self
    }

    /// Enable or disable FastClipWrap.
    pub fn with_fast_clip_wrap(mut self, enable: bool) -> Self {
        self.fast_clip_wrap = enable;
        self
    }

    /// Force 4-byte BER lengths.
    pub fn with_force_ber4(mut self, force: bool) -> Self {
        self.force_ber4 = force;
        self
    }
}
