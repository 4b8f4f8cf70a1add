//! Error types returned by heaps, stores and the heap table.

use thiserror::Error;

/// Failures of a [`BackingStore`](crate::store::BackingStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be resized to `requested` bytes.
    #[error("backing store cannot hold {requested} bytes (capacity {capacity})")]
    Exhausted { requested: usize, capacity: usize },

    #[error("backing store i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A libc call (mmap, msync) failed.
    #[cfg(feature = "use_libc")]
    #[error("backing store system call failed: {0}")]
    Os(errno::Errno),
}

/// Everything a heap operation can fail with.
///
/// None of these are retried internally; a heap that returned an error is
/// still consistent and usable.
#[derive(Debug, Error)]
pub enum HeapError {
    /// The backing store cannot grow far enough, or a size computation
    /// overflowed.
    #[error("out of memory")]
    OutOfMemory,

    #[error("an object named {0:?} already exists in this heap")]
    NameExists(String),

    #[error("no object named {0:?} in this heap")]
    NotFound(String),

    /// The offset was not produced by this heap, or has already been freed.
    #[error("{0:#x} is not a live object of this heap")]
    InvalidPointer(usize),

    #[error("unsupported request: {0}")]
    Unsupported(&'static str),

    #[error("named-object registry is full ({0} slots)")]
    RegistryFull(usize),

    /// A shrink would cut into blocks that are still in use.
    #[error("cannot release {requested} blocks, only {available} trailing blocks are free")]
    ShrinkBusy { requested: usize, available: usize },

    #[error("no open heap with descriptor {0}")]
    BadDescriptor(usize),

    /// The metadata in front of an attached arena does not describe a heap.
    #[error("corrupt heap metadata: {0}")]
    Corrupt(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = HeapError> = core::result::Result<T, E>;
