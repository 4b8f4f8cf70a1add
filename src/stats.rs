//! Statistics and consistency checks.

use core::fmt;

use crate::blocklist::{Entry, Validity};
use crate::heap::{Heap, MIN_FRAGMENT_LOG2};
use crate::store::BackingStore;

/// A snapshot of a heap's usage, from one scan of its info table.
///
/// A chunk is a block-level unit: a busy run or a fragmented block is one used
/// chunk, a free run is one free chunk. Byte counts look inside fragmented
/// blocks, so free fragments count as free bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub bytes_total: usize,
    pub chunks_used: usize,
    pub bytes_used: usize,
    pub chunks_free: usize,
    pub bytes_free: usize,
    pub fragments_used: usize,
    pub fragments_free: usize,
    pub named_objects: usize,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes: {} used in {} chunks ({} fragments), {} free in {} chunks ({} fragments), {} named",
            self.bytes_total,
            self.bytes_used,
            self.chunks_used,
            self.fragments_used,
            self.bytes_free,
            self.chunks_free,
            self.fragments_free,
            self.named_objects
        )
    }
}

impl<S: BackingStore> Heap<S> {
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            bytes_total: self.info.len() << self.block_log2,
            named_objects: self.registry.len(),
            ..Default::default()
        };

        for (_, entry) in self.info.runs() {
            match entry {
                Entry::Free { size, .. } => {
                    stats.chunks_free += 1;
                    stats.bytes_free += size << self.block_log2;
                }
                Entry::RunHead { length } => {
                    stats.chunks_used += 1;
                    stats.bytes_used += length << self.block_log2;
                }
                Entry::Fragmented { log2, nfree } => {
                    let count = 1usize << (self.block_log2 - log2);
                    stats.chunks_used += 1;
                    stats.fragments_used += count - nfree;
                    stats.fragments_free += nfree;
                    stats.bytes_used += (count - nfree) << log2;
                    stats.bytes_free += nfree << log2;
                }
                // Only reachable on a broken table, which `check` reports.
                Entry::FreeTail { .. } | Entry::FreeBody | Entry::RunBody { .. } => {}
            }
        }
        stats
    }

    /// Every free run, as `(first block, length)`, in address order.
    pub fn free_runs(&self) -> Vec<(usize, usize)> {
        self.info.free_runs()
    }

    /// Check the info table, fragment free lists and busy maps for broken
    /// invariants.
    pub fn check(&self) -> Validity {
        let mut validity = self.info.check();

        let mut expected = vec![0usize; self.frag_heads.len()];
        let mut fragmented = 0;
        for (block, entry) in self.info.runs() {
            if let Entry::Fragmented { log2, nfree } = entry {
                fragmented += 1;
                let sane = (MIN_FRAGMENT_LOG2..self.block_log2).contains(&log2)
                    && nfree < 1 << (self.block_log2 - log2);
                if !sane {
                    log::debug!("Block {} has a bad fragment entry {:?}", block, entry);
                    validity.fragments += 1;
                    continue;
                }
                expected[log2 as usize] += nfree;

                let count = 1usize << (self.block_log2 - log2);
                if self.busy.busy_count(block) != Some(count - nfree)
                    || self.busy.has_bits_past(block, count)
                {
                    log::debug!("Block {} disagrees with its busy map", block);
                    validity.fragments += 1;
                }
            }
        }
        // Maps of blocks that are no longer fragmented
        if self.busy.len() != fragmented {
            validity.fragments += 1;
        }

        let arena_len = self.arena().len();
        for (log2, &head) in self.frag_heads.iter().enumerate() {
            let mut cursor = head;
            let mut previous = None;
            let mut found = 0;
            while let Some(offset) = cursor {
                let in_block = offset
                    .checked_add(16)
                    .map_or(false, |end| end <= arena_len)
                    && offset & ((1 << log2) - 1) == 0
                    && matches!(
                        self.info.get(offset >> self.block_log2),
                        Some(Entry::Fragmented { log2: t, .. }) if t as usize == log2
                    );
                // Also stops cycles: no list is longer than its free count
                if !in_block || found >= expected[log2] {
                    validity.fragments += 1;
                    break;
                }
                let block = offset >> self.block_log2;
                if self.busy.is_busy(block, (offset & (self.block_size() - 1)) >> log2) {
                    validity.fragments += 1;
                }

                let (next, prev) = self.fragment_links(offset);
                if prev != previous {
                    validity.fragments += 1;
                }
                found += 1;
                previous = Some(offset);
                cursor = next;
            }
            if found != expected[log2] {
                validity.fragments += 1;
            }
        }

        validity
    }
}
