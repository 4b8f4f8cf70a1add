//! Backing stores: the raw, growable byte regions that hold a heap.
//!
//! ## [`BackingStore`]
//!
//! `BackingStore` is a simple trait interface meant to abstract over the calls
//! to the OS to expand or shrink the region a heap lives in. A heap calls it
//! only while holding its own guard, so a store never sees concurrent resizes.
//!
//! ## [`MemoryStore`]
//!
//! `MemoryStore` is a fixed, page-aligned reservation that pretends to be a
//! growable region. It is private to the process, and mainly useful for
//! anonymous heaps and for testing.
//!
//! The file-backed store lives in [`crate::mmap`].

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use spin::Once;

use crate::error::StoreError;

// Round up value to the nearest multiple of increment
pub(crate) fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

static PAGE_SIZE: Once<usize> = Once::new();

/// Virtual memory page size in bytes, queried once per process.
pub fn page_size() -> usize {
    *PAGE_SIZE.call_once(|| {
        #[cfg(feature = "use_libc")]
        {
            sysconf::page::pagesize()
        }
        // Page size is 4 kb "on most architectures"
        #[cfg(not(feature = "use_libc"))]
        {
            4096
        }
    })
}

pub trait BackingStore: Send {
    /// Bytes currently usable, starting at the region base.
    fn len(&self) -> usize;

    /// The most bytes `resize` will ever accept.
    fn capacity(&self) -> usize;

    /// Grow or shrink the region to `new_len` bytes. Bytes past the old length
    /// read as zero after growing. The region base never moves.
    fn resize(&mut self, new_len: usize) -> Result<(), StoreError>;

    fn as_slice(&self) -> &[u8];

    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Make everything written so far durable, for stores that can be.
    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: BackingStore + ?Sized> BackingStore for Box<S> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn capacity(&self) -> usize {
        (**self).capacity()
    }

    fn resize(&mut self, new_len: usize) -> Result<(), StoreError> {
        (**self).resize(new_len)
    }

    fn as_slice(&self) -> &[u8] {
        (**self).as_slice()
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        (**self).as_mut_slice()
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        (**self).flush()
    }
}

/// An in-process region: one zeroed, page-aligned reservation of `capacity`
/// bytes whose visible length moves up and down.
pub struct MemoryStore {
    base: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// The reservation is owned exclusively by the store, so it can move between
// threads along with it.
unsafe impl Send for MemoryStore {}

impl MemoryStore {
    pub fn new(capacity: usize) -> Result<Self, StoreError> {
        let pagesize = page_size();
        let capacity = round_up(capacity.max(1), pagesize);
        let exhausted = StoreError::Exhausted {
            requested: capacity,
            capacity: 0,
        };
        let layout = Layout::from_size_align(capacity, pagesize).map_err(|_| exhausted)?;

        // The layout is never zero-sized, see above.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(StoreError::Exhausted {
            requested: capacity,
            capacity: 0,
        })?;

        Ok(MemoryStore {
            base,
            layout,
            len: 0,
        })
    }
}

impl BackingStore for MemoryStore {
    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.layout.size()
    }

    fn resize(&mut self, new_len: usize) -> Result<(), StoreError> {
        if new_len > self.capacity() {
            return Err(StoreError::Exhausted {
                requested: new_len,
                capacity: self.capacity(),
            });
        }
        if new_len > self.len {
            // Bytes uncovered by an earlier shrink still hold old data.
            unsafe {
                ptr::write_bytes(self.base.as_ptr().add(self.len), 0, new_len - self.len);
            }
        }
        self.len = new_len;
        Ok(())
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}
