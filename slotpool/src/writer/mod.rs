use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use super::core::*;
use crate::errors::{PoolError, Result};
use crate::layout::{Record, SlotIndex};

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    pub shmem: SegmentConfig,
}

/// Copies `record` into a freshly allocated slot and returns its index.
pub fn insert(segment: &Segment, record: &Record) -> Result<SlotIndex> {
    segment.with_free_list(|list| -> Result<SlotIndex> {
        let index = list.acquire()?;
        list.slot_mut(index)?.record = *record;
        Ok(index)
    })?
}

/// Writes `record` into the slot numbered `record.id`, whether or not that
/// slot was ever allocated. The free list is left alone.
pub fn upsert(segment: &Segment, record: &Record) -> Result<SlotIndex> {
    let index = record.id;
    let capacity = segment.capacity();
    if index >= capacity {
        return Err(PoolError::OutOfRange { index, capacity });
    }
    segment.with_free_list(|list| -> Result<SlotIndex> {
        list.slot_mut(index)?.record = *record;
        Ok(index)
    })?
}

/// Hands an allocated slot back to the free list.
pub fn release(segment: &Segment, index: SlotIndex) -> Result<()> {
    let capacity = segment.capacity();
    if index >= capacity {
        return Err(PoolError::OutOfRange { index, capacity });
    }
    segment.with_free_list(|list| list.release(index))?
}

pub struct MessageWriter {
    segment: Arc<Segment>,
}

impl MessageWriter {
    pub fn new(cfg: &WriterConfig) -> Result<MessageWriter> {
        let segment = open_segment(&cfg.shmem)?;
        Ok(MessageWriter::attach(Arc::new(segment)))
    }

    pub fn attach(segment: Arc<Segment>) -> MessageWriter {
        MessageWriter { segment }
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn insert(&self, record: &Record) -> Result<SlotIndex> {
        insert(&self.segment, record)
    }

    pub fn upsert(&self, record: &Record) -> Result<SlotIndex> {
        upsert(&self.segment, record)
    }

    pub fn release(&self, index: SlotIndex) -> Result<()> {
        release(&self.segment, index)
    }

    /// The mapping goes away with the last handle sharing it.
    pub fn close(self) {}
}
