//! Over-aligned allocations.
//!
//! When an allocation doesn't happen to land on the requested boundary, a
//! larger one is made and an aligned offset inside it is handed out. The
//! mapping back to the exact offset is kept so `free` can find the real
//! object.

use std::collections::BTreeMap;

use log::trace;

use crate::error::{HeapError, Result};
use crate::heap::{Heap, Ptr};
use crate::store::{page_size, round_up, BackingStore};

/// Aligned offset -> exact offset, for every outstanding aligned object that
/// doesn't start its own allocation.
#[derive(Debug, Default)]
pub struct AlignRecords {
    records: BTreeMap<usize, usize>,
    capacity: usize,
}

impl AlignRecords {
    pub fn new(capacity: usize) -> Self {
        AlignRecords {
            records: BTreeMap::new(),
            capacity,
        }
    }

    pub fn from_records<I>(capacity: usize, records: I) -> Self
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        AlignRecords {
            records: records.into_iter().collect(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn contains(&self, aligned: usize) -> bool {
        self.records.contains_key(&aligned)
    }

    pub fn get(&self, aligned: usize) -> Option<usize> {
        self.records.get(&aligned).copied()
    }

    fn insert(&mut self, aligned: usize, exact: usize) -> Result<()> {
        if self.is_full() {
            return Err(HeapError::OutOfMemory);
        }
        self.records.insert(aligned, exact);
        Ok(())
    }

    pub(crate) fn remove(&mut self, aligned: usize) -> Option<usize> {
        self.records.remove(&aligned)
    }

    /// `(aligned, exact)` pairs, ordered by aligned offset.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.records.iter().map(|(&aligned, &exact)| (aligned, exact))
    }
}

impl<S: BackingStore> Heap<S> {
    /// Allocate `size` bytes starting at a multiple of `alignment`, which must
    /// be a power of two.
    pub fn allocate_aligned(&mut self, alignment: usize, size: usize) -> Result<Ptr> {
        if !alignment.is_power_of_two() {
            return Err(HeapError::Unsupported("alignment must be a power of two"));
        }
        let padded = size
            .max(1)
            .checked_add(alignment - 1)
            .ok_or(HeapError::OutOfMemory)?
            & !(alignment - 1);

        let ptr = self.allocate(padded)?;
        if ptr.offset() % alignment == 0 {
            return Ok(ptr);
        }

        // Give the first try back before asking for one with room to slide.
        self.free_exact(ptr.offset())?;
        if self.aligned.is_full() {
            return Err(HeapError::OutOfMemory);
        }
        let slack = padded.checked_add(alignment).ok_or(HeapError::OutOfMemory)?;
        let exact = self.allocate(slack)?;
        let aligned = round_up(exact.offset(), alignment);
        if aligned == exact.offset() {
            return Ok(exact);
        }

        self.aligned.insert(aligned, exact.offset())?;
        trace!(
            "allocate_aligned({}, {}) -> {} inside {}",
            alignment,
            size,
            aligned,
            exact
        );
        Ok(Ptr::from_offset(aligned))
    }

    /// [`Heap::allocate_aligned`] on a page boundary.
    pub fn allocate_page_aligned(&mut self, size: usize) -> Result<Ptr> {
        self.allocate_aligned(page_size(), size)
    }
}
