use std::io;
use std::path::PathBuf;
use std::time::Duration;

use shared_memory::ShmemError;
use thiserror::Error;

use crate::layout::SlotIndex;

pub type Result<T> = std::result::Result<T, PoolError>;

// raw_sync hands back Box<dyn Error> without Send/Sync, so lock failures keep
// only the message.

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("cannot size or map the segment at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: ShmemError,
    },

    #[error("no initialized segment at {path:?}")]
    NotFound { path: PathBuf },

    #[error("cannot map the segment at {path:?}: {source}")]
    Map {
        path: PathBuf,
        #[source]
        source: ShmemError,
    },

    #[error("segment layout mismatch: {0}")]
    InvalidLayout(String),

    #[error("invalid capacity {0}")]
    InvalidCapacity(u64),

    #[error("all {capacity} slots are in use")]
    PoolExhausted { capacity: u32 },

    #[error("slot index {index} is out of range for capacity {capacity}")]
    OutOfRange { index: SlotIndex, capacity: u32 },

    #[error("slot {index}: {reason}")]
    CorruptionRisk { index: SlotIndex, reason: &'static str },

    #[error("lock error: {0}")]
    Lock(String),

    #[error("gave up waiting for the segment lock after {0:?}")]
    LockTimeout(Duration),

    #[error("segment handle is closed")]
    Closed,

    #[error("process is terminating")]
    Terminating,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PoolError {
    pub(crate) fn lock(err: Box<dyn std::error::Error>) -> PoolError {
        PoolError::Lock(err.to_string())
    }
}
