use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use super::core::*;
use crate::errors::{PoolError, Result};
use crate::layout::{Record, SlotIndex, SlotView};

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub shmem: SegmentConfig,
}

/// Copies the payload of slot `index` into `out`.
///
/// Reads take the segment lock like writes do, so a reader never sees a
/// record half way through being written.
pub fn fetch_into(segment: &Segment, index: SlotIndex, out: &mut Record) -> Result<()> {
    let capacity = segment.capacity();
    if index >= capacity {
        return Err(PoolError::OutOfRange { index, capacity });
    }
    segment.with_free_list(|list| -> Result<()> {
        *out = list.slot(index)?.record;
        Ok(())
    })?
}

pub fn fetch(segment: &Segment, index: SlotIndex) -> Result<Record> {
    let mut record = Record::default();
    fetch_into(segment, index, &mut record)?;
    Ok(record)
}

/// Reports whether slot `index` is on the free list or holds a record.
pub fn inspect(segment: &Segment, index: SlotIndex) -> Result<SlotView> {
    let capacity = segment.capacity();
    if index >= capacity {
        return Err(PoolError::OutOfRange { index, capacity });
    }
    segment.with_free_list(|list| -> Result<SlotView> {
        list.slot(index)?.view().ok_or(PoolError::CorruptionRisk {
            index,
            reason: "slot tag is neither free nor occupied",
        })
    })?
}

pub struct MessageReader {
    segment: Arc<Segment>,
}

impl MessageReader {
    pub fn new(cfg: &ReaderConfig) -> Result<MessageReader> {
        let segment = open_segment(&cfg.shmem)?;
        Ok(MessageReader::attach(Arc::new(segment)))
    }

    pub fn attach(segment: Arc<Segment>) -> MessageReader {
        MessageReader { segment }
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn fetch(&self, index: SlotIndex) -> Result<Record> {
        fetch(&self.segment, index)
    }

    pub fn fetch_into(&self, index: SlotIndex, out: &mut Record) -> Result<()> {
        fetch_into(&self.segment, index, out)
    }

    pub fn close(self) {}
}
