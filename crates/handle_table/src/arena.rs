//! Segmented slot storage shared by the handle table and the continuation store.
//!
//! An id is `generation << INDEX_BITS | (index + 1)`, where `index` is
//! `segment * slots_per_segment + slot`. Segments are allocated on demand and
//! never released; freed slots are recycled with a bumped generation so a
//! stale id does not alias the new occupant.

use crate::config::{ArenaLimits, INDEX_BITS, INDEX_MASK};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArenaError {
    /// Every slot under the segment ceiling is occupied.
    Full,
    /// A new segment could not be allocated.
    AllocationFailed,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u8,
    value: Option<T>,
}

impl<T> Slot<T> {
    fn vacant() -> Self {
        Self {
            generation: 0,
            value: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SegmentedArena<T> {
    segments: Vec<Vec<Slot<T>>>,
    limits: ArenaLimits,
    /// Indices released by `remove`, reused oldest first.
    free: VecDeque<u32>,
    /// Next index that has never been handed out.
    next_fresh: u32,
    live: usize,
}

impl<T> SegmentedArena<T> {
    pub(crate) fn new(limits: ArenaLimits) -> Self {
        Self {
            segments: Vec::new(),
            limits,
            free: VecDeque::new(),
            next_fresh: 0,
            live: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn segments_allocated(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.limits.capacity()
    }

    /// Store the value produced by `make`, which receives the id it will
    /// live under.
    pub(crate) fn insert_with(&mut self, make: impl FnOnce(u32) -> T) -> Result<u32, ArenaError> {
        let index = self.claim_index()?;
        let (segment, slot) = self.split(index);
        let cell = &mut self.segments[segment][slot];
        let id = encode(cell.generation, index);
        cell.value = Some(make(id));
        self.live += 1;
        Ok(id)
    }

    pub(crate) fn get(&self, id: u32) -> Option<&T> {
        let (segment, slot, generation) = self.locate(id)?;
        let cell = self.segments.get(segment)?.get(slot)?;
        if cell.generation != generation {
            return None;
        }
        cell.value.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        let (segment, slot, generation) = self.locate(id)?;
        let cell = self.segments.get_mut(segment)?.get_mut(slot)?;
        if cell.generation != generation {
            return None;
        }
        cell.value.as_mut()
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<T> {
        let (segment, slot, generation) = self.locate(id)?;
        let cell = self.segments.get_mut(segment)?.get_mut(slot)?;
        if cell.generation != generation {
            return None;
        }
        let value = cell.value.take()?;
        cell.generation = cell.generation.wrapping_add(1);
        self.free.push_back((id & INDEX_MASK) - 1);
        self.live -= 1;
        Some(value)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        let per_segment = self.limits.slots_per_segment;
        self.segments
            .iter()
            .enumerate()
            .flat_map(move |(segment, slots)| {
                slots.iter().enumerate().filter_map(move |(slot, cell)| {
                    let index = segment as u32 * per_segment + slot as u32;
                    cell.value
                        .as_ref()
                        .map(|value| (encode(cell.generation, index), value))
                })
            })
    }

    /// Fresh slots in already allocated segments come first, then recycled
    /// slots, and only then a new segment.
    fn claim_index(&mut self) -> Result<u32, ArenaError> {
        let allocated = self.segments.len() as u32 * self.limits.slots_per_segment;
        if self.next_fresh < allocated {
            let index = self.next_fresh;
            self.next_fresh += 1;
            return Ok(index);
        }
        if let Some(index) = self.free.pop_front() {
            return Ok(index);
        }
        if self.segments.len() as u32 >= self.limits.max_segments {
            return Err(ArenaError::Full);
        }
        self.grow()?;
        let index = self.next_fresh;
        self.next_fresh += 1;
        Ok(index)
    }

    fn grow(&mut self) -> Result<(), ArenaError> {
        let per_segment = self.limits.slots_per_segment as usize;
        let mut segment = Vec::new();
        segment
            .try_reserve_exact(per_segment)
            .map_err(|_| ArenaError::AllocationFailed)?;
        segment.resize_with(per_segment, Slot::vacant);
        self.segments
            .try_reserve(1)
            .map_err(|_| ArenaError::AllocationFailed)?;
        self.segments.push(segment);
        Ok(())
    }

    fn split(&self, index: u32) -> (usize, usize) {
        let per_segment = self.limits.slots_per_segment;
        ((index / per_segment) as usize, (index % per_segment) as usize)
    }

    fn locate(&self, id: u32) -> Option<(usize, usize, u8)> {
        let encoded = id & INDEX_MASK;
        if encoded == 0 {
            return None;
        }
        let (segment, slot) = self.split(encoded - 1);
        Some((segment, slot, (id >> INDEX_BITS) as u8))
    }
}

fn encode(generation: u8, index: u32) -> u32 {
    (u32::from(generation) << INDEX_BITS) | (index + 1)
}
