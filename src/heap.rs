//! A single heap: one backing store, the info table describing its arena, and
//! the fragment free lists.
//!
//! Requests larger than half a block get a run of whole blocks. Smaller ones
//! get a fragment: blocks are carved into equal power-of-two fragments, and
//! the free fragments of each size are kept on a doubly linked list threaded
//! through the fragments' own bytes, so the lists live inside the arena.
//! Which fragments are live is recorded separately, in a busy map per block.
//!
//! Objects are named by [`Ptr`], their byte offset inside the arena. Offsets do
//! not depend on where a process maps the region.

use core::fmt;

use log::{debug, trace, warn};

use crate::align::AlignRecords;
use crate::bitmap::FragmentMaps;
use crate::blocklist::{Entry, InfoTable};
use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::layout::{get_u64, put_u64};
use crate::registry::Registry;
use crate::store::BackingStore;

/// Smallest fragment: 16 bytes, room for the two free-list links.
pub const MIN_FRAGMENT_LOG2: u32 = 4;

const NIL: u64 = u64::MAX;

/// An object handle: the offset of the object's first byte in its arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ptr(usize);

impl Ptr {
    pub const fn from_offset(offset: usize) -> Ptr {
        Ptr(offset)
    }

    pub const fn offset(self) -> usize {
        self.0
    }

    /// The handle `bytes` further into the same object.
    pub const fn add(self, bytes: usize) -> Ptr {
        Ptr(self.0 + bytes)
    }
}

impl fmt::Display for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SizeClass {
    Fragment(u32),
    Blocks(usize),
}

pub(crate) fn encode_link(link: Option<usize>) -> u64 {
    link.map_or(NIL, |offset| offset as u64)
}

pub(crate) fn decode_link(raw: u64) -> Option<usize> {
    if raw == NIL {
        None
    } else {
        Some(raw as usize)
    }
}

pub struct Heap<S> {
    pub(crate) store: S,
    pub(crate) block_log2: u32,
    /// Bytes of metadata in front of the arena.
    pub(crate) meta_len: usize,
    pub(crate) max_blocks: usize,
    /// Freeing never hands blocks back to the store below this many.
    pub(crate) floor_blocks: usize,
    pub(crate) info: InfoTable,
    /// Head of the free-fragment list for each fragment size, by log2.
    pub(crate) frag_heads: Vec<Option<usize>>,
    pub(crate) busy: FragmentMaps,
    pub(crate) aligned: AlignRecords,
    pub(crate) registry: Registry,
}

impl<S: BackingStore> Heap<S> {
    /// Lay out a new heap on an empty backing store.
    pub fn create(store: S, config: &HeapConfig) -> Result<Self> {
        let meta_len = config.meta_len()?;
        let mut heap = Heap {
            store,
            block_log2: config.block_log2,
            meta_len,
            max_blocks: config.max_blocks,
            floor_blocks: config.initial_blocks,
            info: InfoTable::new(),
            frag_heads: vec![None; config.block_log2 as usize],
            busy: FragmentMaps::new(),
            aligned: AlignRecords::new(config.max_aligned),
            registry: Registry::new(config.max_names),
        };

        heap.store.resize(meta_len)?;
        heap.grow(config.initial_blocks)?;
        heap.sync()?;
        debug!(
            "Created heap: {} blocks of {} bytes, {} bytes of metadata",
            heap.info.len(),
            heap.block_size(),
            meta_len
        );
        Ok(heap)
    }

    /// Create a heap on an empty store, or attach to the one already in it.
    pub fn open(store: S, config: &HeapConfig) -> Result<Self> {
        if store.is_empty() {
            Self::create(store, config)
        } else {
            Self::attach(store)
        }
    }

    pub fn block_size(&self) -> usize {
        1 << self.block_log2
    }

    fn block_mask(&self) -> usize {
        self.block_size() - 1
    }

    /// Blocks currently in the arena.
    pub fn limit_blocks(&self) -> usize {
        self.info.len()
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    pub fn info(&self) -> &InfoTable {
        &self.info
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Give up the heap, returning its store. Call [`Heap::sync`] first to
    /// keep the metadata current.
    pub fn into_store(self) -> S {
        self.store
    }

    pub(crate) fn arena(&self) -> &[u8] {
        &self.store.as_slice()[self.meta_len..]
    }

    pub(crate) fn arena_mut(&mut self) -> &mut [u8] {
        let meta_len = self.meta_len;
        &mut self.store.as_mut_slice()[meta_len..]
    }

    fn size_class(&self, size: usize) -> SizeClass {
        if size <= self.block_size() / 2 {
            let log2 = size
                .max(1)
                .next_power_of_two()
                .trailing_zeros()
                .max(MIN_FRAGMENT_LOG2);
            SizeClass::Fragment(log2)
        } else {
            let blocks = (size >> self.block_log2) + usize::from(size & self.block_mask() != 0);
            SizeClass::Blocks(blocks)
        }
    }

    fn fragment_count(&self, log2: u32) -> usize {
        1 << (self.block_log2 - log2)
    }

    ////////////////////////////////////////////////////////////
    // Growing and shrinking the backing store

    /// Add `count` free blocks to the end of the arena.
    pub fn grow(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let limit = self.info.len();
        let new_limit = limit
            .checked_add(count)
            .filter(|&blocks| blocks <= self.max_blocks)
            .ok_or(HeapError::OutOfMemory)?;

        let new_len = self.meta_len + (new_limit << self.block_log2);
        if let Err(e) = self.store.resize(new_len) {
            warn!("Growing heap by {} blocks failed: {}", count, e);
            return Err(HeapError::OutOfMemory);
        }
        self.info.push_blocks(count);
        debug!("Grew heap from {} to {} blocks", limit, new_limit);
        Ok(())
    }

    /// Return `count` blocks at the end of the arena to the backing store.
    /// All of them must be free. Freeing won't grow the arena back to where
    /// it was; later allocations still may.
    pub fn shrink(&mut self, count: usize) -> Result<()> {
        let available = self.info.trailing_free();
        if count > available {
            return Err(HeapError::ShrinkBusy {
                requested: count,
                available,
            });
        }
        if count == 0 {
            return Ok(());
        }

        let new_limit = self.info.len() - count;
        self.store.resize(self.meta_len + (new_limit << self.block_log2))?;
        let truncated = self.info.truncate(count);
        debug_assert!(truncated, "Trailing blocks were checked to be free");
        self.floor_blocks = self.floor_blocks.min(new_limit);
        debug!("Shrank heap to {} blocks", new_limit);
        Ok(())
    }

    // Hand the free blocks at the end of the arena back to the store, down to
    // the floor. Runs after every release, so the arena never ends in free
    // blocks above the floor.
    fn release_tail(&mut self) {
        let excess = self.info.len().saturating_sub(self.floor_blocks);
        let count = self.info.trailing_free().min(excess);
        if count == 0 {
            return;
        }
        if let Err(e) = self.shrink(count) {
            warn!("Keeping {} free blocks at the end of the heap: {}", count, e);
        }
    }

    /// Return every free block at the end of the arena to the backing store,
    /// returning how many were released.
    pub fn trim(&mut self) -> Result<usize> {
        let count = self.info.trailing_free();
        self.shrink(count)?;
        Ok(count)
    }

    // Take a busy run of `count` blocks, growing the arena by the deficit if
    // no free run is large enough.
    fn take_blocks(&mut self, count: usize) -> Result<usize> {
        if count > self.max_blocks {
            return Err(HeapError::OutOfMemory);
        }
        if let Some(block) = self.info.take(count) {
            return Ok(block);
        }

        let deficit = count - self.info.trailing_free();
        self.grow(deficit)?;
        self.info
            .take(count)
            .ok_or(HeapError::Corrupt("grown arena has no room for the request"))
    }

    ////////////////////////////////////////////////////////////
    // Fragment free lists

    pub(crate) fn fragment_links(&self, offset: usize) -> (Option<usize>, Option<usize>) {
        let arena = self.arena();
        (
            decode_link(get_u64(arena, offset)),
            decode_link(get_u64(arena, offset + 8)),
        )
    }

    fn set_fragment_next(&mut self, offset: usize, next: Option<usize>) {
        put_u64(self.arena_mut(), offset, encode_link(next));
    }

    fn set_fragment_prev(&mut self, offset: usize, prev: Option<usize>) {
        put_u64(self.arena_mut(), offset + 8, encode_link(prev));
    }

    fn push_fragment(&mut self, log2: u32, offset: usize) {
        let head = self.frag_heads[log2 as usize];
        self.set_fragment_next(offset, head);
        self.set_fragment_prev(offset, None);
        if let Some(head) = head {
            self.set_fragment_prev(head, Some(offset));
        }
        self.frag_heads[log2 as usize] = Some(offset);
    }

    fn unlink_fragment(&mut self, log2: u32, offset: usize) {
        let (next, prev) = self.fragment_links(offset);
        match prev {
            Some(prev) => self.set_fragment_next(prev, next),
            None => self.frag_heads[log2 as usize] = next,
        }
        if let Some(next) = next {
            self.set_fragment_prev(next, prev);
        }
    }

    // Index of the fragment at `offset` within its block.
    fn fragment_index(&self, offset: usize, log2: u32) -> usize {
        (offset & self.block_mask()) >> log2
    }

    fn is_busy_fragment(&self, block: usize, offset: usize, log2: u32) -> bool {
        self.busy.is_busy(block, self.fragment_index(offset, log2))
    }

    fn allocate_fragment(&mut self, log2: u32) -> Result<Ptr> {
        if let Some(offset) = self.frag_heads[log2 as usize] {
            let block = offset >> self.block_log2;
            let nfree = match self.info.get(block) {
                Some(Entry::Fragmented { log2: t, nfree }) if t == log2 && nfree > 0 => nfree,
                _ => return Err(HeapError::Corrupt("fragment list leads outside its blocks")),
            };
            let index = self.fragment_index(offset, log2);
            if self.busy.set(block, index, true) != Some(false) {
                return Err(HeapError::Corrupt("fragment list holds a live fragment"));
            }
            self.unlink_fragment(log2, offset);
            self.info.set(
                block,
                Entry::Fragmented {
                    log2,
                    nfree: nfree - 1,
                },
            );
            return Ok(Ptr(offset));
        }

        // No free fragment of this size: carve up a fresh block, handing out
        // its first fragment and listing the rest lowest-first.
        let block = self.take_blocks(1)?;
        let count = self.fragment_count(log2);
        self.info.set(
            block,
            Entry::Fragmented {
                log2,
                nfree: count - 1,
            },
        );
        self.busy.insert(block, count);
        self.busy.set(block, 0, true);
        let base = block << self.block_log2;
        for i in (1..count).rev() {
            self.push_fragment(log2, base + (i << log2));
        }
        Ok(Ptr(base))
    }

    fn free_fragment(&mut self, block: usize, offset: usize, log2: u32, nfree: usize) -> Result<()> {
        if offset & ((1 << log2) - 1) != 0 || !self.is_busy_fragment(block, offset, log2) {
            return Err(HeapError::InvalidPointer(offset));
        }

        let count = self.fragment_count(log2);
        if nfree + 1 < count {
            let index = self.fragment_index(offset, log2);
            self.busy.set(block, index, false);
            self.push_fragment(log2, offset);
            self.info.set(
                block,
                Entry::Fragmented {
                    log2,
                    nfree: nfree + 1,
                },
            );
            return Ok(());
        }

        // Last busy fragment: pull its siblings off the free list and give the
        // whole block back.
        let base = block << self.block_log2;
        for i in 0..count {
            let fragment = base + (i << log2);
            if fragment != offset {
                self.unlink_fragment(log2, fragment);
            }
        }
        self.busy.remove(block);
        let (head, size) = self.info.release(block, 1);
        trace!("Fragmented block {} freed into run {}+{}", block, head, size);
        Ok(())
    }

    ////////////////////////////////////////////////////////////
    // Allocation

    /// Allocate `size` bytes. Size 0 yields a unique, minimal object.
    pub fn allocate(&mut self, size: usize) -> Result<Ptr> {
        let ptr = match self.size_class(size) {
            SizeClass::Fragment(log2) => self.allocate_fragment(log2)?,
            SizeClass::Blocks(count) => Ptr(self.take_blocks(count)? << self.block_log2),
        };
        trace!("allocate({}) -> {}", size, ptr);
        Ok(ptr)
    }

    /// Allocate `count * size` bytes, all zero.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Result<Ptr> {
        let total = count.checked_mul(size).ok_or(HeapError::OutOfMemory)?;
        let ptr = self.allocate(total)?;
        self.arena_mut()[ptr.0..ptr.0 + total].fill(0);
        Ok(ptr)
    }

    /// Free an object. `ptr` must be exactly what an allocation returned.
    pub fn free(&mut self, ptr: Ptr) -> Result<()> {
        let exact = self.aligned.get(ptr.0);
        let result = self.free_exact(exact.unwrap_or(ptr.0));
        match &result {
            Ok(()) => {
                if exact.is_some() {
                    self.aligned.remove(ptr.0);
                }
                trace!("free({})", ptr);
                self.release_tail();
            }
            Err(e) => warn!("free({}) rejected: {}", ptr, e),
        }
        result
    }

    pub(crate) fn free_exact(&mut self, offset: usize) -> Result<()> {
        let block = offset >> self.block_log2;
        match self.info.get(block) {
            Some(Entry::RunHead { length }) if offset & self.block_mask() == 0 => {
                self.info.release(block, length);
                Ok(())
            }
            Some(Entry::Fragmented { log2, nfree }) => self.free_fragment(block, offset, log2, nfree),
            _ => Err(HeapError::InvalidPointer(offset)),
        }
    }

    /// The start and length in bytes of the live object containing `offset`.
    fn object_span(&self, offset: usize) -> Result<(usize, usize)> {
        let block = offset >> self.block_log2;
        match self.info.get(block) {
            Some(Entry::RunHead { length }) => Ok((block << self.block_log2, length << self.block_log2)),
            Some(Entry::RunBody { offset: back }) => {
                let head = block
                    .checked_sub(back)
                    .ok_or(HeapError::Corrupt("continuation block points before the arena"))?;
                match self.info.get(head) {
                    Some(Entry::RunHead { length }) => {
                        Ok((head << self.block_log2, length << self.block_log2))
                    }
                    _ => Err(HeapError::Corrupt("continuation block points outside its run")),
                }
            }
            Some(Entry::Fragmented { log2, .. }) => {
                let start = offset & !((1 << log2) - 1);
                if self.is_busy_fragment(block, start, log2) {
                    Ok((start, 1 << log2))
                } else {
                    Err(HeapError::InvalidPointer(offset))
                }
            }
            _ => Err(HeapError::InvalidPointer(offset)),
        }
    }

    /// The start of the live object containing `ptr`, which may point
    /// anywhere inside it.
    pub fn resolve_object_start(&self, ptr: Ptr) -> Result<Ptr> {
        self.object_span(ptr.0).map(|(start, _)| Ptr(start))
    }

    /// Bytes usable from `ptr` to the end of its object.
    pub fn usable_size(&self, ptr: Ptr) -> Result<usize> {
        let (start, len) = self.object_span(ptr.0)?;
        Ok(start + len - ptr.0)
    }

    /// Resize an object, moving it only when it can't be resized in place.
    /// The first `min(old, new_size)` bytes are preserved.
    pub fn reallocate(&mut self, ptr: Ptr, new_size: usize) -> Result<Ptr> {
        if self.aligned.contains(ptr.0) {
            return self.reallocate_by_copy(ptr, new_size);
        }

        let (start, _) = self.object_span(ptr.0)?;
        if start != ptr.0 {
            return Err(HeapError::InvalidPointer(ptr.0));
        }

        let block = ptr.0 >> self.block_log2;
        match (self.info.get(block), self.size_class(new_size)) {
            (Some(Entry::RunHead { length }), SizeClass::Blocks(want)) => {
                if want < length {
                    self.info.shrink_run(block, length, want);
                    self.release_tail();
                    return Ok(ptr);
                }
                if want == length
                    || self.info.extend_run(block, length, want)
                    || self.grow_in_place(block, length, want)?
                {
                    return Ok(ptr);
                }
                self.reallocate_by_copy(ptr, new_size)
            }
            (Some(Entry::Fragmented { log2, .. }), SizeClass::Fragment(want)) if log2 == want => {
                Ok(ptr)
            }
            _ => self.reallocate_by_copy(ptr, new_size),
        }
    }

    // Extend a run that ends the arena (possibly followed by trailing free
    // blocks) by growing the backing store.
    fn grow_in_place(&mut self, block: usize, length: usize, want: usize) -> Result<bool> {
        let end = block + length;
        let limit = self.info.len();
        let trailing = match self.info.get(end) {
            None => 0,
            Some(Entry::Free { size, .. }) if end + size == limit => size,
            _ => return Ok(false),
        };
        if self.max_blocks < limit || want - length - trailing > self.max_blocks - limit {
            return Ok(false);
        }
        if self.grow(want - length - trailing).is_err() {
            return Ok(false);
        }
        Ok(self.info.extend_run(block, length, want))
    }

    fn reallocate_by_copy(&mut self, ptr: Ptr, new_size: usize) -> Result<Ptr> {
        let available = self.usable_size(ptr)?;
        let new = self.allocate(new_size)?;
        let count = available.min(new_size);
        self.arena_mut().copy_within(ptr.0..ptr.0 + count, new.0);
        self.free(ptr)?;
        trace!("reallocate({}, {}) moved to {}", ptr, new_size, new);
        Ok(new)
    }

    ////////////////////////////////////////////////////////////
    // Object contents

    /// `len` bytes of the object at `ptr`. Fails unless they all lie inside
    /// one live object.
    pub fn bytes(&self, ptr: Ptr, len: usize) -> Result<&[u8]> {
        if len > self.usable_size(ptr)? {
            return Err(HeapError::InvalidPointer(ptr.0.saturating_add(len)));
        }
        Ok(&self.arena()[ptr.0..ptr.0 + len])
    }

    pub fn bytes_mut(&mut self, ptr: Ptr, len: usize) -> Result<&mut [u8]> {
        if len > self.usable_size(ptr)? {
            return Err(HeapError::InvalidPointer(ptr.0.saturating_add(len)));
        }
        Ok(&mut self.arena_mut()[ptr.0..ptr.0 + len])
    }

    pub fn read(&self, ptr: Ptr, buf: &mut [u8]) -> Result<()> {
        buf.copy_from_slice(self.bytes(ptr, buf.len())?);
        Ok(())
    }

    pub fn write(&mut self, ptr: Ptr, data: &[u8]) -> Result<()> {
        self.bytes_mut(ptr, data.len())?.copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_heap(
    block_log2: u32,
    initial_blocks: usize,
    max_blocks: usize,
) -> Heap<crate::store::MemoryStore> {
    let config = HeapConfig::with_blocks(block_log2, initial_blocks, max_blocks);
    let store = crate::store::MemoryStore::new(config.capacity_bytes().unwrap()).unwrap();
    Heap::create(store, &config).unwrap()
}
