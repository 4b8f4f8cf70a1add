//! File-backed stores, shared between processes through `mmap`.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{null_mut, NonNull};

use log::{debug, warn};

use crate::error::StoreError;
use crate::store::{page_size, round_up, BackingStore};

/// A file mapped `MAP_SHARED` at a fixed address.
///
/// The whole capacity is mapped once, up front, so the region never moves;
/// resizing only changes the file length. Only the first `len` bytes are ever
/// touched, since pages past the end of the file fault on access.
pub struct FileStore {
    file: File,
    path: PathBuf,
    base: NonNull<u8>,
    capacity: usize,
    len: usize,
}

// The mapping is owned by the store and only reachable through it.
unsafe impl Send for FileStore {}

impl FileStore {
    /// Open or create the file at `path`, reserving room for `capacity` bytes.
    /// An existing file keeps its contents.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = usize::try_from(file.metadata()?.len()).map_err(|_| StoreError::Exhausted {
            requested: usize::MAX,
            capacity,
        })?;
        let capacity = round_up(capacity.max(len).max(1), page_size());

        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                // Shared, so writes reach the file and other processes
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(StoreError::Os(errno::errno()));
        }
        let base = NonNull::new(ptr as *mut u8).ok_or(StoreError::Exhausted {
            requested: capacity,
            capacity: 0,
        })?;

        debug!(
            "Mapped {} ({} of {} bytes)",
            path.display(),
            len,
            capacity
        );
        Ok(FileStore {
            file,
            path: path.to_owned(),
            base,
            capacity,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackingStore for FileStore {
    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn resize(&mut self, new_len: usize) -> Result<(), StoreError> {
        if new_len > self.capacity {
            return Err(StoreError::Exhausted {
                requested: new_len,
                capacity: self.capacity,
            });
        }
        self.file.set_len(new_len as u64)?;
        self.len = new_len;
        Ok(())
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.len == 0 {
            return Ok(());
        }
        let result = unsafe { libc::msync(self.base.as_ptr().cast(), self.len, libc::MS_SYNC) };
        if result != 0 {
            return Err(StoreError::Os(errno::errno()));
        }
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base.as_ptr().cast(), self.capacity) } != 0 {
            warn!(
                "Unmapping {} failed: {}",
                self.path.display(),
                errno::errno()
            );
        }
    }
}
