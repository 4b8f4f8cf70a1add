//! The heap table: every heap a process has open, by descriptor.
//!
//! Each heap sits behind its own [`spin::Mutex`], held for the whole of one
//! operation. The table itself is a [`spin::RwLock`] over the descriptor
//! slots, held only long enough to look a descriptor up, so operations on
//! different heaps never wait on each other.
//!
//! Closing the last reference marks the heap closed and syncs it under the
//! heap's lock. An operation that looked the heap up just before the close
//! and only gets the lock afterwards finds it closed and fails, so nothing
//! changes a heap after its final sync.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(feature = "use_libc")]
use std::path::Path;

use log::debug;
use spin::{Mutex, RwLock};

use crate::blocklist::Validity;
use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::heap::{Heap, Ptr};
#[cfg(feature = "use_libc")]
use crate::mmap::FileStore;
use crate::stats::HeapStats;
use crate::store::{BackingStore, MemoryStore};

/// A heap whose store type has been erased, as kept in a [`HeapTable`].
pub type DynHeap = Heap<Box<dyn BackingStore>>;

/// Names one open heap of a [`HeapTable`]. Descriptors of closed heaps are
/// handed out again, lowest first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapDescriptor(usize);

impl HeapDescriptor {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for HeapDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hd{}", self.0)
    }
}

struct OpenHeap {
    refs: AtomicUsize,
    closed: AtomicBool,
    heap: Mutex<DynHeap>,
}

impl OpenHeap {
    fn run<F, T>(&self, hd: HeapDescriptor, f: F) -> Result<T>
    where
        F: FnOnce(&mut DynHeap) -> Result<T>,
    {
        let mut heap = self.heap.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(HeapError::BadDescriptor(hd.0));
        }
        f(&mut heap)
    }
}

#[derive(Default)]
pub struct HeapTable {
    heaps: RwLock<Vec<Option<Arc<OpenHeap>>>>,
}

impl HeapTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a heap on `store`: a new one if the store is empty, otherwise the
    /// one already in it.
    pub fn open<S: BackingStore + 'static>(
        &self,
        store: S,
        config: &HeapConfig,
    ) -> Result<HeapDescriptor> {
        let store: Box<dyn BackingStore> = Box::new(store);
        let heap = Heap::open(store, config)?;
        Ok(self.insert(heap))
    }

    /// Open a new heap private to this process.
    pub fn open_memory(&self, config: &HeapConfig) -> Result<HeapDescriptor> {
        let store = MemoryStore::new(config.capacity_bytes()?)?;
        self.open(store, config)
    }

    /// Open the heap stored in the file at `path`, creating it if the file is
    /// missing or empty.
    #[cfg(feature = "use_libc")]
    pub fn open_file<P: AsRef<Path>>(&self, path: P, config: &HeapConfig) -> Result<HeapDescriptor> {
        let store = FileStore::open(path, config.capacity_bytes()?)?;
        self.open(store, config)
    }

    fn insert(&self, heap: DynHeap) -> HeapDescriptor {
        let open = Arc::new(OpenHeap {
            refs: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
            heap: Mutex::new(heap),
        });

        let mut heaps = self.heaps.write();
        let index = match heaps.iter().position(Option::is_none) {
            Some(index) => {
                heaps[index] = Some(open);
                index
            }
            None => {
                heaps.push(Some(open));
                heaps.len() - 1
            }
        };
        debug!("Opened heap hd{}", index);
        HeapDescriptor(index)
    }

    fn get(&self, hd: HeapDescriptor) -> Result<Arc<OpenHeap>> {
        self.heaps
            .read()
            .get(hd.0)
            .and_then(Option::clone)
            .ok_or(HeapError::BadDescriptor(hd.0))
    }

    pub fn is_open(&self, hd: HeapDescriptor) -> bool {
        self.get(hd).is_ok()
    }

    /// Number of open heaps.
    pub fn len(&self) -> usize {
        self.heaps.read().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take another reference to an open heap; it stays open until every
    /// reference is closed.
    pub fn retain(&self, hd: HeapDescriptor) -> Result<()> {
        let heaps = self.heaps.read();
        let open = heaps
            .get(hd.0)
            .and_then(Option::as_ref)
            .ok_or(HeapError::BadDescriptor(hd.0))?;
        open.refs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop a reference to a heap. The last one syncs the heap and frees its
    /// descriptor.
    pub fn close(&self, hd: HeapDescriptor) -> Result<()> {
        let closed = {
            let mut heaps = self.heaps.write();
            let slot = heaps
                .get_mut(hd.0)
                .filter(|slot| slot.is_some())
                .ok_or(HeapError::BadDescriptor(hd.0))?;
            let remaining = slot
                .as_ref()
                .map_or(0, |open| open.refs.fetch_sub(1, Ordering::AcqRel) - 1);
            if remaining > 0 {
                debug!("Heap {} still has {} references", hd, remaining);
                return Ok(());
            }
            slot.take()
        };

        if let Some(open) = closed {
            let mut heap = open.heap.lock();
            open.closed.store(true, Ordering::Release);
            heap.sync()?;
            debug!("Closed heap {}", hd);
        }
        Ok(())
    }

    /// Run `f` on a heap, holding its guard for the duration.
    pub fn with<F, T>(&self, hd: HeapDescriptor, f: F) -> Result<T>
    where
        F: FnOnce(&mut DynHeap) -> Result<T>,
    {
        self.get(hd)?.run(hd, f)
    }

    pub fn sync(&self, hd: HeapDescriptor) -> Result<()> {
        self.with(hd, |heap| heap.sync())
    }

    pub fn allocate(&self, hd: HeapDescriptor, size: usize) -> Result<Ptr> {
        self.with(hd, |heap| heap.allocate(size))
    }

    pub fn allocate_zeroed(&self, hd: HeapDescriptor, count: usize, size: usize) -> Result<Ptr> {
        self.with(hd, |heap| heap.allocate_zeroed(count, size))
    }

    pub fn allocate_aligned(
        &self,
        hd: HeapDescriptor,
        alignment: usize,
        size: usize,
    ) -> Result<Ptr> {
        self.with(hd, |heap| heap.allocate_aligned(alignment, size))
    }

    pub fn allocate_page_aligned(&self, hd: HeapDescriptor, size: usize) -> Result<Ptr> {
        self.with(hd, |heap| heap.allocate_page_aligned(size))
    }

    pub fn reallocate(&self, hd: HeapDescriptor, ptr: Ptr, new_size: usize) -> Result<Ptr> {
        self.with(hd, |heap| heap.reallocate(ptr, new_size))
    }

    pub fn free(&self, hd: HeapDescriptor, ptr: Ptr) -> Result<()> {
        self.with(hd, |heap| heap.free(ptr))
    }

    pub fn allocate_named(&self, hd: HeapDescriptor, name: &str, size: usize) -> Result<Ptr> {
        self.with(hd, |heap| heap.allocate_named(name, size))
    }

    pub fn allocate_zeroed_named(
        &self,
        hd: HeapDescriptor,
        name: &str,
        count: usize,
        size: usize,
    ) -> Result<Ptr> {
        self.with(hd, |heap| heap.allocate_zeroed_named(name, count, size))
    }

    pub fn allocate_aligned_named(
        &self,
        hd: HeapDescriptor,
        name: &str,
        alignment: usize,
        size: usize,
    ) -> Result<Ptr> {
        self.with(hd, |heap| heap.allocate_aligned_named(name, alignment, size))
    }

    pub fn free_named(&self, hd: HeapDescriptor, name: &str) -> Result<()> {
        self.with(hd, |heap| heap.free_named(name))
    }

    pub fn register(&self, hd: HeapDescriptor, name: &str, ptr: Ptr) -> Result<()> {
        self.with(hd, |heap| heap.register(name, ptr))
    }

    pub fn lookup(&self, hd: HeapDescriptor, name: &str) -> Result<Ptr> {
        self.with(hd, |heap| heap.lookup(name))
    }

    pub fn unregister(&self, hd: HeapDescriptor, name: &str) -> Result<Ptr> {
        self.with(hd, |heap| heap.unregister(name))
    }

    pub fn names(&self, hd: HeapDescriptor) -> Result<Vec<String>> {
        self.with(hd, |heap| Ok(heap.names()))
    }

    pub fn resolve_object_start(&self, hd: HeapDescriptor, ptr: Ptr) -> Result<Ptr> {
        self.with(hd, |heap| heap.resolve_object_start(ptr))
    }

    pub fn usable_size(&self, hd: HeapDescriptor, ptr: Ptr) -> Result<usize> {
        self.with(hd, |heap| heap.usable_size(ptr))
    }

    pub fn read(&self, hd: HeapDescriptor, ptr: Ptr, buf: &mut [u8]) -> Result<()> {
        self.with(hd, |heap| heap.read(ptr, buf))
    }

    pub fn write(&self, hd: HeapDescriptor, ptr: Ptr, data: &[u8]) -> Result<()> {
        self.with(hd, |heap| heap.write(ptr, data))
    }

    pub fn stats(&self, hd: HeapDescriptor) -> Result<HeapStats> {
        self.with(hd, |heap| Ok(heap.stats()))
    }

    pub fn check(&self, hd: HeapDescriptor) -> Result<Validity> {
        self.with(hd, |heap| Ok(heap.check()))
    }

    pub fn shrink(&self, hd: HeapDescriptor, blocks: usize) -> Result<()> {
        self.with(hd, |heap| heap.shrink(blocks))
    }

    pub fn trim(&self, hd: HeapDescriptor) -> Result<usize> {
        self.with(hd, |heap| heap.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use test_log::test;

    fn small() -> HeapConfig {
        HeapConfig::with_blocks(12, 16, 64)
    }

    #[test]
    fn test_descriptors_are_reused_lowest_first() {
        let table = HeapTable::new();
        let a = table.open_memory(&small()).unwrap();
        let b = table.open_memory(&small()).unwrap();
        let c = table.open_memory(&small()).unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));

        table.close(a).unwrap();
        table.close(b).unwrap();
        assert_eq!(table.len(), 1);
        assert!(!table.is_open(a));
        assert!(matches!(
            table.allocate(a, 10),
            Err(HeapError::BadDescriptor(0))
        ));
        assert!(matches!(table.close(a), Err(HeapError::BadDescriptor(0))));

        assert_eq!(table.open_memory(&small()).unwrap(), a);
        assert_eq!(table.open_memory(&small()).unwrap(), b);
        assert_eq!(table.open_memory(&small()).unwrap().index(), 3);
    }

    #[test]
    fn test_heaps_are_independent() {
        let table = HeapTable::new();
        let a = table.open_memory(&small()).unwrap();
        let b = table.open_memory(&small()).unwrap();

        let in_a = table.allocate_named(a, "shared", 100).unwrap();
        // The same name in another heap is a different object
        let in_b = table.allocate_named(b, "shared", 5000).unwrap();
        table.write(a, in_a, b"a").unwrap();
        table.write(b, in_b, b"b").unwrap();

        let mut buf = [0; 1];
        table.read(a, table.lookup(a, "shared").unwrap(), &mut buf).unwrap();
        assert_eq!(&buf, b"a");
        table.read(b, table.lookup(b, "shared").unwrap(), &mut buf).unwrap();
        assert_eq!(&buf, b"b");

        table.free_named(a, "shared").unwrap();
        assert!(matches!(
            table.lookup(a, "shared"),
            Err(HeapError::NotFound(_))
        ));
        assert!(table.lookup(b, "shared").is_ok());
    }

    #[test]
    fn test_retain_and_close() {
        let table = HeapTable::new();
        let hd = table.open_memory(&small()).unwrap();
        table.retain(hd).unwrap();

        table.close(hd).unwrap();
        assert!(table.is_open(hd));
        let ptr = table.allocate(hd, 10).unwrap();
        assert_eq!(table.resolve_object_start(hd, ptr.add(3)).unwrap(), ptr);

        table.close(hd).unwrap();
        assert!(!table.is_open(hd));
        assert!(table.is_empty());
    }

    #[test]
    fn test_close_stops_operations_already_in_flight() {
        let table = HeapTable::new();
        let hd = table.open_memory(&small()).unwrap();
        let ptr = table.allocate(hd, 100).unwrap();

        // Looked up before the close, run after it
        let open = table.get(hd).unwrap();
        table.close(hd).unwrap();
        assert!(matches!(
            open.run(hd, |heap| heap.free(ptr)),
            Err(HeapError::BadDescriptor(0))
        ));
        assert_eq!(open.heap.lock().stats().fragments_used, 1);
    }

    #[test]
    fn test_threads_share_one_heap() {
        const THREADS: usize = 4;
        const OBJECTS: usize = 50;

        let table = HeapTable::new();
        let hd = table.open_memory(&HeapConfig {
            max_names: THREADS * OBJECTS,
            ..HeapConfig::with_blocks(12, 4, 1024)
        })
        .unwrap();
        let before = table.stats(hd).unwrap();

        thread::scope(|scope| {
            for t in 0..THREADS {
                let table = &table;
                scope.spawn(move || {
                    for i in 0..OBJECTS {
                        let name = format!("t{}-{}", t, i);
                        let size = 1 + (t * 997 + i * 131) % 9000;
                        let ptr = table.allocate_named(hd, &name, size).unwrap();
                        table.write(hd, ptr, name.as_bytes()).unwrap();
                    }
                });
            }
        });

        assert_eq!(table.stats(hd).unwrap().named_objects, THREADS * OBJECTS);
        assert!(table.check(hd).unwrap().is_valid());

        for t in 0..THREADS {
            for i in 0..OBJECTS {
                let name = format!("t{}-{}", t, i);
                let ptr = table.lookup(hd, &name).unwrap();
                let mut buf = vec![0; name.len()];
                table.read(hd, ptr, &mut buf).unwrap();
                assert_eq!(buf, name.as_bytes());
                table.free_named(hd, &name).unwrap();
            }
        }

        let after = table.stats(hd).unwrap();
        assert_eq!(after.bytes_used, before.bytes_used);
        assert_eq!(after.chunks_free, 1);
        assert!(table.check(hd).unwrap().is_valid());
    }

    #[test]
    fn test_threads_on_separate_heaps() {
        let table = HeapTable::new();
        let config = HeapConfig::with_blocks(12, 16, 1024);
        let heaps: Vec<HeapDescriptor> = (0..4)
            .map(|_| table.open_memory(&config).unwrap())
            .collect();

        thread::scope(|scope| {
            for &hd in &heaps {
                let table = &table;
                scope.spawn(move || {
                    let mut live = Vec::new();
                    for i in 0..200 {
                        live.push(table.allocate(hd, (i * 37) % 6000).unwrap());
                        if i % 3 == 0 {
                            let ptr = live.swap_remove(i % live.len());
                            table.free(hd, ptr).unwrap();
                        }
                    }
                    for ptr in live {
                        table.free(hd, ptr).unwrap();
                    }
                });
            }
        });

        for hd in heaps {
            assert!(table.check(hd).unwrap().is_valid());
            assert_eq!(table.stats(hd).unwrap().bytes_used, 0);
            table.close(hd).unwrap();
        }
        assert!(table.is_empty());
    }
}
