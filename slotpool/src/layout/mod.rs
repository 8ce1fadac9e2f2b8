//! Byte layout of a segment: one header followed by `capacity` slots.
//!
//! Nothing in here stores a machine address. Every link between slots is a
//! [`SlotIndex`], so the same bytes are valid in every process regardless of
//! where the segment got mapped.

use std::mem;

pub type SlotIndex = u32;

/// Terminates the free list.
pub const END_OF_LIST: SlotIndex = u32::MAX;

/// Largest capacity whose indices stay clear of [`END_OF_LIST`].
pub const MAX_CAPACITY: u32 = END_OF_LIST - 1;

/// Bytes reserved in the header for the process-shared mutex.
pub const LOCK_AREA_SIZE: usize = 128;

/// Written last during creation. A segment without it was never initialized.
pub(crate) const SEGMENT_MAGIC: u64 = 0x534c_4f54_504f_4f4c; // "SLOTPOOL"

pub(crate) const SLOT_FREE: u32 = 0;
pub(crate) const SLOT_OCCUPIED: u32 = 0x0cc0_0cc0;

/// The fixed-size payload stored in every slot.
#[repr(C)]
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Record {
    pub id: u32,
    pub data: u64,
}

impl Record {
    pub fn new(id: u32, data: u64) -> Record {
        Record { id, data }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub(crate) struct Slot {
    pub next: SlotIndex,
    pub state: u32,
    pub record: Record,
}

/// Tagged reading of a slot's overlaid storage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotView {
    Free { next: SlotIndex },
    Occupied(Record),
}

impl Slot {
    pub(crate) const fn free(next: SlotIndex) -> Slot {
        Slot {
            next,
            state: SLOT_FREE,
            record: Record { id: 0, data: 0 },
        }
    }

    #[inline]
    pub(crate) fn is_occupied(&self) -> bool {
        self.state == SLOT_OCCUPIED
    }

    /// `None` when the tag word holds neither known value.
    pub(crate) fn view(&self) -> Option<SlotView> {
        match self.state {
            SLOT_FREE => Some(SlotView::Free { next: self.next }),
            SLOT_OCCUPIED => Some(SlotView::Occupied(self.record)),
            _ => None,
        }
    }
}

/// Free-list bookkeeping. Mutated only while the segment lock is held.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct FreeListState {
    pub free_count: u32,
    pub free_head: SlotIndex,
    pub free_tail: SlotIndex,
    pub _reserved: u32,
}

impl FreeListState {
    pub(crate) const fn empty() -> FreeListState {
        FreeListState {
            free_count: 0,
            free_head: END_OF_LIST,
            free_tail: END_OF_LIST,
            _reserved: 0,
        }
    }
}

#[repr(C, align(64))]
pub(crate) struct LockArea(pub [u8; LOCK_AREA_SIZE]);

/// Root of the shared segment, at offset zero of the mapping.
///
/// `capacity` and `total_size` never change after creation and are copied
/// into each process's handle on open. The lock lives in its own area so
/// that `&mut FreeListState` never overlaps the mutex bytes other threads
/// are spinning on.
#[repr(C, align(64))]
pub(crate) struct SegmentHeader {
    pub magic: u64,
    pub total_size: u64,
    pub capacity: u32,
    pub _pad: u32,
    pub free: FreeListState,
    pub lock: LockArea,
}

pub const fn header_size() -> usize {
    mem::size_of::<SegmentHeader>()
}

pub const fn slot_size() -> usize {
    mem::size_of::<Slot>()
}

/// Size in bytes of a segment holding `capacity` slots, or `None` on overflow.
pub fn segment_size(capacity: u32) -> Option<usize> {
    (capacity as usize)
        .checked_mul(slot_size())
        .and_then(|slots| slots.checked_add(header_size()))
}

const _: () = assert!(mem::size_of::<SegmentHeader>() % mem::align_of::<Slot>() == 0);
const _: () = assert!(mem::size_of::<Record>() == 16);
const _: () = assert!(mem::size_of::<Slot>() == 24);
