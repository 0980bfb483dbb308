//! Generic container writing and reading.

pub mod layout;
pub mod reader;
pub mod writer;
