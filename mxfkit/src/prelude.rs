//! Convenience re-exports for applications.
//!
//! ```
//! use mxfkit::prelude::*;
//! ```

pub use mxfkit_core::{Error, Rational, Result, UniversalLabel, WriterConfig, UL};

pub use mxfkit_essence::{
    EssenceSource, EssenceSubParser, FilePattern, FileSet, ParserRegistry, RangedSource,
    SharedEssenceSource, WrapType,
};

pub use mxfkit_container::{
    BodyReader, BodyStream, BodyWriter, GcReadHandler, IndexManager, IndexTable, ReaderUnit,
    StreamIndexFlags,
};
