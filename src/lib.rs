//! A multi-heap, named-object allocator over growable byte regions.
//!
//! Each heap manages one region (a [`BackingStore`]): a metadata area
//! followed by an arena of fixed-size blocks. Large objects get runs of whole
//! blocks, small ones get power-of-two fragments carved out of a block. Free
//! runs are coalesced as soon as they are released.
//!
//! Objects are addressed by [`Ptr`], their offset in the arena, and can be
//! given names. A heap in a [`FileStore`] can be synced, closed, and attached
//! again later or from another process, where its names still resolve.
//!
//! Most programs go through a [`HeapTable`], which hands out
//! [`HeapDescriptor`]s and guards each heap for concurrent use:
//!
//! ```
//! use persistent_heap::{HeapConfig, HeapTable};
//!
//! let table = HeapTable::new();
//! let hd = table.open_memory(&HeapConfig::default()).unwrap();
//! let ptr = table.allocate_named(hd, "answer", 8).unwrap();
//! table.write(hd, ptr, &42u64.to_le_bytes()).unwrap();
//! assert_eq!(table.lookup(hd, "answer").unwrap(), ptr);
//! table.close(hd).unwrap();
//! ```

pub mod align;
pub mod bitmap;
pub mod blocklist;
pub mod config;
pub mod error;
pub mod heap;
pub mod layout;
#[cfg(feature = "use_libc")]
pub mod mmap;
pub mod registry;
pub mod stats;
pub mod store;
pub mod table;

pub use crate::blocklist::Validity;
pub use crate::config::HeapConfig;
pub use crate::error::{HeapError, Result, StoreError};
pub use crate::heap::{Heap, Ptr};
#[cfg(feature = "use_libc")]
pub use crate::mmap::FileStore;
pub use crate::stats::HeapStats;
pub use crate::store::{page_size, BackingStore, MemoryStore};
pub use crate::table::{DynHeap, HeapDescriptor, HeapTable};
