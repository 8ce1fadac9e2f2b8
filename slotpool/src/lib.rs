//! A fixed-capacity pool of fixed-size records in one shared memory segment.
//!
//! Independent processes map the same segment, possibly at different base
//! addresses, and insert or fetch records under one process-shared mutex.
//! Records are addressed by slot index only, never by pointer.

mod allocator;
pub mod core;
mod errors;
pub mod layout;
mod lock;
pub mod reader;
pub mod signals;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::core::{
    close_segment, create_segment, destroy_segment, open_segment, Segment, SegmentConfig,
    SegmentConfigBuilder,
};
pub use crate::errors::{PoolError, Result};
pub use crate::layout::{Record, SlotIndex, SlotView, END_OF_LIST};
pub use crate::reader::{fetch, fetch_into, inspect, MessageReader, ReaderConfig};
pub use crate::writer::{insert, release, upsert, MessageWriter, WriterConfig};

pub const DEFAULT_CAPACITY: u32 = crate::core::DEFAULT_CAPACITY;
