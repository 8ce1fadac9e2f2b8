//! Free-list allocation over the slot array.
//!
//! The list is singly linked through `Slot::next` and used LIFO at the head,
//! which matches the direction of the chain laid down by [`FreeList::format`].
//! Callers must hold the segment lock for the whole lifetime of a [`FreeList`].

use tracing::warn;

use crate::errors::{PoolError, Result};
use crate::layout::{FreeListState, Slot, SlotIndex, SlotView, END_OF_LIST, SLOT_FREE, SLOT_OCCUPIED};

pub(crate) struct FreeList<'a> {
    state: &'a mut FreeListState,
    slots: &'a mut [Slot],
}

impl<'a> FreeList<'a> {
    pub(crate) fn new(state: &'a mut FreeListState, slots: &'a mut [Slot]) -> FreeList<'a> {
        FreeList { state, slots }
    }

    /// Zeroes every slot and links them `0 -> 1 -> .. -> capacity-1 -> END`.
    pub(crate) fn format(&mut self) {
        let capacity = self.capacity();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let next = i as SlotIndex + 1;
            *slot = Slot::free(if next == capacity { END_OF_LIST } else { next });
        }
        *self.state = if capacity == 0 {
            FreeListState::empty()
        } else {
            FreeListState {
                free_count: capacity,
                free_head: 0,
                free_tail: capacity - 1,
                _reserved: 0,
            }
        };
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    #[inline]
    pub(crate) fn free_count(&self) -> u32 {
        self.state.free_count
    }

    pub(crate) fn state(&self) -> FreeListState {
        *self.state
    }

    /// Pops the head of the free list.
    pub(crate) fn acquire(&mut self) -> Result<SlotIndex> {
        let capacity = self.capacity();
        if self.state.free_count == 0 {
            warn!(capacity, "slot pool exhausted");
            return Err(PoolError::PoolExhausted { capacity });
        }
        let index = self.state.free_head;
        let slot = self.slots.get_mut(index as usize).ok_or_else(|| {
            warn!(index, "free list head points outside the slot array");
            PoolError::CorruptionRisk {
                index,
                reason: "free list head is out of range",
            }
        })?;
        if slot.state != SLOT_FREE {
            warn!(index, "free list head is an occupied slot");
            return Err(PoolError::CorruptionRisk {
                index,
                reason: "free list links an occupied slot",
            });
        }

        self.state.free_head = slot.next;
        if slot.next == END_OF_LIST {
            self.state.free_tail = END_OF_LIST;
        }
        slot.next = END_OF_LIST;
        slot.state = SLOT_OCCUPIED;
        self.state.free_count -= 1;
        Ok(index)
    }

    /// Pushes `index` back at the head. The payload bytes are left as they are.
    pub(crate) fn release(&mut self, index: SlotIndex) -> Result<()> {
        let capacity = self.capacity();
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(PoolError::OutOfRange { index, capacity })?;
        if !slot.is_occupied() {
            warn!(index, "release of a slot that is not allocated");
            return Err(PoolError::CorruptionRisk {
                index,
                reason: "slot is not allocated (double release?)",
            });
        }

        slot.next = self.state.free_head;
        slot.state = SLOT_FREE;
        if self.state.free_head == END_OF_LIST {
            self.state.free_tail = index;
        }
        self.state.free_head = index;
        self.state.free_count += 1;
        Ok(())
    }

    pub(crate) fn slot(&self, index: SlotIndex) -> Result<&Slot> {
        let capacity = self.capacity();
        self.slots
            .get(index as usize)
            .ok_or(PoolError::OutOfRange { index, capacity })
    }

    pub(crate) fn slot_mut(&mut self, index: SlotIndex) -> Result<&mut Slot> {
        let capacity = self.capacity();
        self.slots
            .get_mut(index as usize)
            .ok_or(PoolError::OutOfRange { index, capacity })
    }

    /// Indices on the free list, head first. Stops early on a cycle or an
    /// out-of-range link, so it always terminates.
    #[cfg(test)]
    pub(crate) fn walk(&self) -> Vec<SlotIndex> {
        let mut out = Vec::with_capacity(self.state.free_count as usize);
        let mut cursor = self.state.free_head;
        while cursor != END_OF_LIST && out.len() <= self.slots.len() {
            out.push(cursor);
            match self.slots.get(cursor as usize) {
                Some(slot) => cursor = slot.next,
                None => break,
            }
        }
        out
    }

    /// Checks every free-list invariant and every slot tag.
    pub(crate) fn check(&self) -> Result<()> {
        let capacity = self.capacity();
        let state = *self.state;
        if state.free_count > capacity {
            return Err(PoolError::CorruptionRisk {
                index: state.free_head,
                reason: "free count exceeds capacity",
            });
        }

        let mut on_list = vec![false; self.slots.len()];
        let mut cursor = state.free_head;
        let mut last = END_OF_LIST;
        let mut visited = 0u32;
        while cursor != END_OF_LIST {
            let slot = self.slots.get(cursor as usize).ok_or(PoolError::CorruptionRisk {
                index: cursor,
                reason: "free list link is out of range",
            })?;
            if on_list[cursor as usize] {
                return Err(PoolError::CorruptionRisk {
                    index: cursor,
                    reason: "free list contains a cycle",
                });
            }
            match slot.view() {
                Some(SlotView::Free { next }) => {
                    on_list[cursor as usize] = true;
                    visited += 1;
                    last = cursor;
                    cursor = next;
                }
                Some(SlotView::Occupied(_)) => {
                    return Err(PoolError::CorruptionRisk {
                        index: cursor,
                        reason: "free list links an occupied slot",
                    })
                }
                None => {
                    return Err(PoolError::CorruptionRisk {
                        index: cursor,
                        reason: "slot tag is neither free nor occupied",
                    })
                }
            }
        }

        if visited != state.free_count {
            return Err(PoolError::CorruptionRisk {
                index: last,
                reason: "free list length disagrees with the free count",
            });
        }
        if last != state.free_tail {
            return Err(PoolError::CorruptionRisk {
                index: last,
                reason: "free list tail is stale",
            });
        }
        for (i, slot) in self.slots.iter().enumerate() {
            let index = i as SlotIndex;
            match slot.view() {
                Some(SlotView::Free { .. }) if !on_list[i] => {
                    return Err(PoolError::CorruptionRisk {
                        index,
                        reason: "free slot is unreachable from the free list",
                    })
                }
                None => {
                    return Err(PoolError::CorruptionRisk {
                        index,
                        reason: "slot tag is neither free nor occupied",
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }
}
