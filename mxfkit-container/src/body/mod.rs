//! Body writing and reading.

pub mod reader;
pub mod stream;
pub mod writer;
