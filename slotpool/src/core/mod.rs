use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{fence, Ordering};
use std::time::Duration;

use ::shared_memory::*;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::allocator::FreeList;
use crate::errors::{PoolError, Result};
use crate::layout::{self, SegmentHeader, Slot, MAX_CAPACITY, SEGMENT_MAGIC};
use crate::lock::SegmentLock;
use crate::signals;

pub const DEFAULT_CAPACITY: u32 = 1_000_000;
pub static SEGMENT_FILE_NAME: &str = "slotpool-segment";

fn default_path() -> PathBuf {
    std::env::temp_dir().join(SEGMENT_FILE_NAME)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Link file naming the segment. Every process attaching to the same
    /// segment uses the same path.
    pub path: PathBuf,
    /// Slot count used by `create_segment`. Ignored on open, where the
    /// capacity stored in the segment wins.
    pub capacity: u32,
    /// Bounded wait for the segment lock. `None` waits forever.
    pub lock_timeout_ms: Option<u64>,
    pub exit_on_signal: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        SegmentConfig {
            path: default_path(),
            capacity: DEFAULT_CAPACITY,
            lock_timeout_ms: None,
            exit_on_signal: false,
        }
    }
}

impl SegmentConfig {
    pub fn builder() -> SegmentConfigBuilder {
        SegmentConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(PoolError::InvalidCapacity(self.capacity as u64));
        }
        if layout::segment_size(self.capacity).is_none() {
            return Err(PoolError::InvalidCapacity(self.capacity as u64));
        }
        Ok(())
    }

    fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Default)]
pub struct SegmentConfigBuilder {
    config: SegmentConfig,
}

impl SegmentConfigBuilder {
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.path = path.into();
        self
    }

    pub fn capacity(mut self, capacity: u32) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn exit_on_signal(mut self, enabled: bool) -> Self {
        self.config.exit_on_signal = enabled;
        self
    }

    pub fn build(self) -> Result<SegmentConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

struct Mapping {
    // Declared before `shmem` so the mutex handle goes away before the unmap.
    lock: SegmentLock,
    header: NonNull<SegmentHeader>,
    slots: NonNull<Slot>,
    shmem: Shmem,
}

/// A process's handle on one mapped segment.
///
/// Holds the mapping and the attached mutex. Slot indices handed out through
/// a handle are valid through any other handle on the same segment, in this
/// process or another one.
pub struct Segment {
    mapping: Option<Mapping>,
    path: PathBuf,
    capacity: u32,
    total_size: usize,
}

// SAFETY: the raw pointers target the shared mapping owned by the handle, and
// every access to header or slots happens while the process-shared mutex is
// held (see `with_free_list`).
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.mapping.is_some()
    }

    /// Number of slots currently on the free list.
    pub fn free_count(&self) -> Result<u32> {
        self.with_free_list(|list| list.free_count())
    }

    /// Walks the free list and checks every slot tag. Useful after a peer
    /// died mid-operation.
    pub fn verify(&self) -> Result<()> {
        self.with_free_list(|list| list.check())?
    }

    /// Unmaps the segment. The segment itself stays in place for other
    /// processes. Calling it again does nothing.
    pub fn close(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            debug!(path = ?self.path, os_id = mapping.shmem.get_os_id(), "closing segment");
            drop(mapping);
        }
    }

    /// Takes the segment lock outside any operation, to stand in for a peer
    /// stuck inside its critical section.
    #[cfg(test)]
    pub(crate) fn hold_lock(&self) -> Result<raw_sync::locks::LockGuard<'_>> {
        self.mapping()?.lock.acquire(|| false)
    }

    fn mapping(&self) -> Result<&Mapping> {
        self.mapping.as_ref().ok_or(PoolError::Closed)
    }

    /// Runs `f` with the free list and the slot array while holding the
    /// segment lock.
    pub(crate) fn with_free_list<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut FreeList<'_>) -> R,
    {
        let mapping = self.mapping()?;
        let section = signals::enter()?;
        let _guard = mapping.lock.acquire(|| section.closing())?;
        // SAFETY: the lock is held for the lifetime of both references and
        // the mapping is at least `total_size` bytes long.
        let (state, slots) = unsafe {
            (
                &mut (*mapping.header.as_ptr()).free,
                slice::from_raw_parts_mut(mapping.slots.as_ptr(), self.capacity as usize),
            )
        };
        let mut list = FreeList::new(state, slots);
        Ok(f(&mut list))
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.close();
    }
}

fn slots_of(header: NonNull<SegmentHeader>) -> NonNull<Slot> {
    // SAFETY: the slot array starts right after the header inside the same
    // allocation.
    unsafe { NonNull::new_unchecked(header.as_ptr().add(1) as *mut Slot) }
}

fn lock_area(header: NonNull<SegmentHeader>) -> *mut u8 {
    unsafe { ptr::addr_of_mut!((*header.as_ptr()).lock) as *mut u8 }
}

/// Maps a new segment of `total_size` bytes linked at `path` and runs `init`
/// on its base address. Until `init` succeeds the handle owns the mapping, so
/// a failed initialization unlinks it and removes the link file on drop.
fn map_new<T, F>(path: &Path, total_size: usize, init: F) -> Result<(Shmem, T)>
where
    F: FnOnce(*mut u8) -> Result<T>,
{
    let mut shmem = ShmemConf::new()
        .size(total_size)
        .flink(path)
        .create()
        .map_err(|source| PoolError::Storage {
            path: path.to_path_buf(),
            source,
        })?;
    let value = init(shmem.as_ptr())?;
    // The segment outlives this handle; only destroy_segment removes it.
    shmem.set_owner(false);
    Ok((shmem, value))
}

/// Creates and formats a segment at `cfg.path`, replacing any segment that
/// already lives there.
pub fn create_segment(cfg: &SegmentConfig) -> Result<Segment> {
    cfg.validate()?;
    let total_size = layout::segment_size(cfg.capacity)
        .ok_or(PoolError::InvalidCapacity(cfg.capacity as u64))?;

    if cfg.path.exists() {
        warn!(path = ?cfg.path, "segment already exists, destroying it");
        destroy_segment(&cfg.path)?;
    }

    let (shmem, (lock, header)) = map_new(&cfg.path, total_size, |base| {
        let header = NonNull::new(base as *mut SegmentHeader).ok_or_else(|| {
            PoolError::InvalidLayout("mapping returned a null base address".to_string())
        })?;
        let slots = slots_of(header);

        // SAFETY: the mapping is `total_size` bytes, freshly created, and not
        // yet visible through the magic marker to anyone else.
        let lock = unsafe {
            ptr::write_bytes(base, 0, total_size);
            let hdr = &mut *header.as_ptr();
            hdr.capacity = cfg.capacity;
            hdr.total_size = total_size as u64;
            FreeList::new(
                &mut hdr.free,
                slice::from_raw_parts_mut(slots.as_ptr(), cfg.capacity as usize),
            )
            .format();
            SegmentLock::initialize(lock_area(header), base, cfg.lock_timeout())?
        };
        // Pairs with the acquire fence in open_segment: whoever sees the
        // marker also sees the formatted header and free list.
        fence(Ordering::Release);
        unsafe {
            ptr::write_volatile(ptr::addr_of_mut!((*header.as_ptr()).magic), SEGMENT_MAGIC);
        }
        Ok((lock, header))
    })?;

    if cfg.exit_on_signal {
        signals::install()?;
    }
    info!(
        path = ?cfg.path,
        os_id = shmem.get_os_id(),
        capacity = cfg.capacity,
        total_size,
        "created segment"
    );
    Ok(Segment {
        mapping: Some(Mapping {
            lock,
            header,
            slots: slots_of(header),
            shmem,
        }),
        path: cfg.path.clone(),
        capacity: cfg.capacity,
        total_size,
    })
}

/// Maps an existing segment without touching its contents.
pub fn open_segment(cfg: &SegmentConfig) -> Result<Segment> {
    let not_found = || PoolError::NotFound {
        path: cfg.path.clone(),
    };
    if !cfg.path.exists() {
        return Err(not_found());
    }
    let shmem = match ShmemConf::new().flink(&cfg.path).open() {
        Ok(v) => v,
        Err(ShmemError::LinkDoesNotExist) => return Err(not_found()),
        Err(ShmemError::MapOpenFailed(code)) if code == libc::ENOENT as u32 => {
            return Err(not_found())
        }
        Err(source) => {
            return Err(PoolError::Map {
                path: cfg.path.clone(),
                source,
            })
        }
    };
    if shmem.len() < layout::header_size() {
        return Err(not_found());
    }

    let base = shmem.as_ptr();
    let header = NonNull::new(base as *mut SegmentHeader).ok_or_else(not_found)?;
    // SAFETY: the mapping holds at least a header; capacity and size are
    // written once before the magic marker and never change afterwards.
    let (magic, capacity, stored_size) = unsafe {
        let hdr = header.as_ptr();
        let magic = ptr::read_volatile(ptr::addr_of!((*hdr).magic));
        // Pairs with the release fence in create_segment.
        fence(Ordering::Acquire);
        (magic, (*hdr).capacity, (*hdr).total_size)
    };
    if magic != SEGMENT_MAGIC {
        return Err(not_found());
    }
    let total_size = match layout::segment_size(capacity) {
        Some(size) if size as u64 == stored_size && size <= shmem.len() => size,
        _ => {
            return Err(PoolError::InvalidLayout(format!(
                "capacity {} with recorded size {} does not fit a mapping of {} bytes",
                capacity,
                stored_size,
                shmem.len()
            )))
        }
    };

    let lock = unsafe { SegmentLock::attach(lock_area(header), base, cfg.lock_timeout())? };
    if cfg.exit_on_signal {
        signals::install()?;
    }
    debug!(path = ?cfg.path, os_id = shmem.get_os_id(), capacity, "opened segment");
    Ok(Segment {
        mapping: Some(Mapping {
            lock,
            header,
            slots: slots_of(header),
            shmem,
        }),
        path: cfg.path.clone(),
        capacity,
        total_size,
    })
}

pub fn close_segment(mut segment: Segment) {
    segment.close();
}

/// Removes the segment behind `path`: unlinks the OS mapping and deletes the
/// link file. Handles still mapped elsewhere keep their pages until they
/// close. A missing segment is not an error.
pub fn destroy_segment<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    match ShmemConf::new().flink(path).open() {
        Ok(mut old) => {
            // An owner unlinks the mapping and its link file on drop.
            old.set_owner(true);
            info!(path = ?path, os_id = old.get_os_id(), "destroying segment");
            drop(old);
        }
        Err(e) => debug!(path = ?path, error = %e, "no mapping to unlink"),
    }
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}
