//! # mxfkit-container
//!
//! The multiplexing core of the mxfkit MXF library:
//! - Index tables and the index manager that builds them from per-edit-unit
//!   observations
//! - The generic-container writer (content-package assembly, write order,
//!   clip-wrap back-patching) and reader (KLV dispatch to handlers)
//! - Partition packs and the random index pack
//! - The body writer state machine that schedules partitions, metadata,
//!   index segments and essence, and the body reader that walks them back

pub mod body;
pub mod gc;
pub mod index;
pub mod partition;

pub use body::reader::BodyReader;
pub use body::stream::{BodyStream, StreamIndexFlags, StreamState};
pub use body::writer::BodyWriter;
pub use gc::layout::{GcLayout, LayoutEvent, LayoutPlace};
pub use gc::reader::{GcReadHandler, GcReader, GcReaderControl, ReaderUnit, SharedReadHandler};
pub use gc::writer::{GcStreamId, GcWriter, WriteSeek};
pub use index::manager::{IndexManager, SharedIndexManager};
pub use index::table::{DeltaEntry, IndexPosition, IndexSegment, IndexTable};
pub use partition::{
    Partition, PartitionCompleteness, PartitionKind, PartitionStatus, RandomIndexPack,
};
