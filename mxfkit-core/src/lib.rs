//! # mxfkit-core
//!
//! Wire-level primitives shared by every mxfkit crate:
//! - Universal Label types and well-known label tables
//! - KLV triplet reading/writing with BER-encoded lengths
//! - KAG filler computation
//! - Rational edit rates
//! - The error taxonomy used across the workspace

pub mod config;
pub mod error;
pub mod klv;
pub mod rational;
pub mod ul;

pub use config::WriterConfig;
pub use error::{DemuxError, Error, EssenceError, IndexError, KlvError, MuxError, Result};
pub use klv::{decode_ber, encode_ber, filler_size, Klv};
pub use rational::Rational;
pub use ul::{GcElementKind, UniversalLabel, UL};
