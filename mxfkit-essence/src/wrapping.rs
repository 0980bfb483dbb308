//! Wrapping options.
//!
//! A wrapping option describes one way a sub-parser can place essence into
//! the generic container: frame-by-frame, as a single clip, line-by-line,
//! or some other scheme. Sub-parsers advertise their options in preference
//! order and the application (or [`select_wrapping`]) commits to one.

use mxfkit_core::ul::UL;
use mxfkit_core::UniversalLabel;

/// The granularity of a wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapType {
    /// Not yet decided.
    #[default]
    None,
    /// One wrapping unit per edit unit (typically one frame).
    Frame,
    /// The whole essence in a single KLV.
    Clip,
    /// One wrapping unit per line (uncompressed video).
    Line,
    /// Any other non-standard scheme.
    Other,
}

/// One way of wrapping a particular kind of essence.
#[derive(Debug, Clone)]
pub struct WrappingOption {
    /// Short name, unique within the advertising sub-parser.
    pub name: &'static str,
    /// Human readable description.
    pub description: String,
    /// Identifier for this parser/wrapping combination, used to request a
    /// specific wrapping.
    pub wrapping_id: Option<UL>,
    /// The essence container label for this wrapping.
    pub wrapping_ul: UL,
    /// Generic container essence type byte (0x05/0x15 picture, 0x06/0x16
    /// sound, 0x07/0x17 data, 0x18 compound).
    pub gc_essence_type: u8,
    /// Generic container element type byte.
    pub gc_element_type: u8,
    /// Wrapping granularity.
    pub wrap_type: WrapType,
    /// True if this wrapping can run at a non-native edit rate.
    pub can_slave: bool,
    /// True if the handler can produce VBR index data for this wrapping.
    pub can_index: bool,
    /// True if a CBR index table may describe this wrapping.
    pub cbr_index: bool,
    /// Forced BER length size for essence KLVs, or 0 for any.
    pub ber_size: u8,
    /// Bytes per edit unit; non-zero means constant bit rate.
    pub bytes_per_edit_unit: u32,
}

/// Pick a wrapping from `options` honouring the tie-break rules:
/// a requested UL wins outright, then earlier entries in the sub-parser's
/// preference list, and Frame beats Clip when the caller asks for "any"
/// (`requested_type` of [`WrapType::None`]).
pub fn select_wrapping<'a>(
    options: &'a [WrappingOption],
    requested_ul: Option<&UL>,
    requested_type: WrapType,
) -> Option<&'a WrappingOption> {
    if let Some(want) = requested_ul {
        if let Some(found) = options.iter().find(|o| {
            o.wrapping_id
                .map(|id| UniversalLabel(id).matches(want))
                .unwrap_or(false)
                || UniversalLabel(o.wrapping_ul).matches(want)
        }) {
            return Some(found);
        }
    }

    match requested_type {
        WrapType::None => options
            .iter()
            .find(|o| o.wrap_type == WrapType::Frame)
            .or_else(|| options.first()),
        wanted => options.iter().find(|o| o.wrap_type == wanted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mxfkit_core::ul::labels;

    fn option(name: &'static str, wrap_type: WrapType, ul: UL) -> WrappingOption {
        WrappingOption {
            name,
            description: String::new(),
            wrapping_id: None,
            wrapping_ul: ul,
            gc_essence_type: 0x15,
            gc_element_type: 0x05,
            wrap_type,
            can_slave: false,
            can_index: true,
            cbr_index: false,
            ber_size: 0,
            bytes_per_edit_unit: 0,
        }
    }

    #[test]
    fn test_requested_ul_wins() {
        let options = vec![
            option("frame", WrapType::Frame, labels::GC_MPEG2_VES_FRAME),
            option("clip", WrapType::Clip, labels::GC_MPEG2_VES_CLIP),
        ];
        let picked =
            select_wrapping(&options, Some(&labels::GC_MPEG2_VES_CLIP), WrapType::None).unwrap();
        assert_eq!(picked.name, "clip");
    }

    #[test]
    fn test_any_prefers_frame() {
        let options = vec![
            option("clip", WrapType::Clip, labels::GC_MPEG2_VES_CLIP),
            option("frame", WrapType::Frame, labels::GC_MPEG2_VES_FRAME),
        ];
        let picked = select_wrapping(&options, None, WrapType::None).unwrap();
        assert_eq!(picked.name, "frame");
    }

    #[test]
    fn test_explicit_type_honoured() {
        let options = vec![
            option("frame", WrapType::Frame, labels::GC_MPEG2_VES_FRAME),
            option("clip", WrapType::Clip, labels::GC_MPEG2_VES_CLIP),
        ];
        let picked = select_wrapping(&options, None, WrapType::Clip).unwrap();
        assert_eq!(picked.name, "clip");
    }

    #[test]
    fn test_unknown_type_yields_none() {
        let options = vec![option("frame", WrapType::Frame, labels::GC_MPEG2_VES_FRAME)];
        assert!(select_wrapping(&options, None, WrapType::Line).is_none());
    }
}
