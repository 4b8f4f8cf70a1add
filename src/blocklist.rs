//! The info table: one [`Entry`] per block of a heap's arena.
//!
//! Free runs of blocks are threaded through the table itself, in doubly linked
//! lists binned by size: bin `k` holds the runs whose length lies in
//! `[2^k, 2^(k+1))`.
//!
//! It maintains a few internal invariants:
//!
//! - The first block of a free run holds [`Entry::Free`] with the true length
//!   of the run, and the last block of a longer run holds [`Entry::FreeTail`]
//!   pointing back at the first. Blocks in between are [`Entry::FreeBody`].
//! - No two free runs are adjacent (they are merged when a run is released).
//! - Every block after the first of a busy run holds [`Entry::RunBody`] with
//!   its distance from the first, so any block resolves to its run in O(1).

use core::fmt;

const BINS: usize = usize::BITS as usize;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    /// First block of a free run of `size` blocks.
    Free {
        size: usize,
        next: Option<usize>,
        prev: Option<usize>,
    },
    /// Last block of a free run longer than one block.
    FreeTail { head: usize },
    /// Any other block inside a free run.
    FreeBody,
    /// First block of a busy run of `length` blocks.
    RunHead { length: usize },
    /// Continuation block, `offset` blocks after the head of its run.
    RunBody { offset: usize },
    /// A busy block carved into fragments of `1 << log2` bytes, `nfree` of
    /// which are on the fragment free list.
    Fragmented { log2: u32, nfree: usize },
}

impl Entry {
    pub fn is_free(&self) -> bool {
        matches!(
            self,
            Entry::Free { .. } | Entry::FreeTail { .. } | Entry::FreeBody
        )
    }
}

fn bin_of(size: usize) -> usize {
    debug_assert!(size > 0, "Free runs are never empty");
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

pub struct InfoTable {
    entries: Vec<Entry>,
    bins: [Option<usize>; BINS],
}

impl Default for InfoTable {
    fn default() -> Self {
        InfoTable {
            entries: Vec::new(),
            bins: [None; BINS],
        }
    }
}

/// Iterator over the runs of an [`InfoTable`], yielding the first block of
/// each run and its entry.
pub struct Runs<'table> {
    entries: &'table [Entry],
    next: usize,
}

impl<'table> Iterator for Runs<'table> {
    type Item = (usize, Entry);

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next;
        let entry = *self.entries.get(start)?;
        let step = match entry {
            Entry::Free { size, .. } => size,
            Entry::RunHead { length } => length,
            // Fragmented blocks are one block long, anything else here is a
            // broken table and is reported by `check`.
            _ => 1,
        };
        self.next = start + step.max(1);
        Some((start, entry))
    }
}

impl fmt::Display for InfoTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoTable(")?;
        let mut start = true;
        for (block, entry) in self.runs() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            match entry {
                Entry::Free { size, .. } => write!(f, "Free({}, {})", block, size)?,
                Entry::RunHead { length } => write!(f, "Run({}, {})", block, length)?,
                Entry::Fragmented { log2, nfree } => {
                    write!(f, "Frag({}, 2^{}, {} free)", block, log2, nfree)?
                }
                other => write!(f, "Broken({}, {:?})", block, other)?,
            }
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in an
/// InfoTable.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of free runs directly following another free run, unmerged.
    pub adjacents: usize,

    /// Number of runs starting with an entry that can only appear inside a
    /// run. This likely indicates corruption.
    pub misplaced: usize,

    /// Free runs whose tail does not point back at them, empty busy runs, or
    /// busy runs with a continuation block that does not point back at its
    /// head.
    pub broken_tags: usize,

    /// Free runs missing from their bin, plus bin members that are not free
    /// runs of that bin's size.
    pub unbinned: usize,

    /// Fragment free lists disagreeing with the free counts in the table.
    /// Filled in by the heap, which owns the fragment lists.
    pub fragments: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.adjacents == 0
            && self.misplaced == 0
            && self.broken_tags == 0
            && self.unbinned == 0
            && self.fragments == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

impl InfoTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a table from its entries, as read back from a heap's metadata.
    /// Free-list links are recomputed, not trusted.
    pub fn from_entries(entries: Vec<Entry>) -> Self {
        let mut table = InfoTable {
            entries,
            bins: [None; BINS],
        };
        table.relink_all();
        table
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, block: usize) -> Option<Entry> {
        self.entries.get(block).copied()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn runs(&self) -> Runs<'_> {
        Runs {
            entries: &self.entries,
            next: 0,
        }
    }

    /// Every free run, as `(first block, length)`, in address order.
    pub fn free_runs(&self) -> Vec<(usize, usize)> {
        self.runs()
            .filter_map(|(block, entry)| match entry {
                Entry::Free { size, .. } => Some((block, size)),
                _ => None,
            })
            .collect()
    }

    /// Overwrite the entry of a single busy block.
    pub(crate) fn set(&mut self, block: usize, entry: Entry) {
        debug_assert!(!entry.is_free(), "Free entries are maintained by release");
        self.entries[block] = entry;
    }

    /// Write the boundary tags of a free run and push it onto its bin.
    fn link(&mut self, head: usize, size: usize) {
        let bin = bin_of(size);
        let next = self.bins[bin];
        if let Some(n) = next {
            if let Entry::Free { prev, .. } = &mut self.entries[n] {
                *prev = Some(head);
            }
        }
        self.entries[head] = Entry::Free {
            size,
            next,
            prev: None,
        };
        if size > 1 {
            self.entries[head + size - 1] = Entry::FreeTail { head };
        }
        self.bins[bin] = Some(head);
    }

    /// Remove a free run from its bin, returning its size. Its tags are left
    /// in place for the caller to overwrite.
    fn unlink(&mut self, head: usize) -> usize {
        let (size, next, prev) = match self.entries[head] {
            Entry::Free { size, next, prev } => (size, next, prev),
            other => panic!("Block {} is not the head of a free run: {:?}", head, other),
        };

        match prev {
            Some(p) => {
                if let Entry::Free { next: prev_next, .. } = &mut self.entries[p] {
                    *prev_next = next;
                }
            }
            None => self.bins[bin_of(size)] = next,
        }
        if let Some(n) = next {
            if let Entry::Free { prev: next_prev, .. } = &mut self.entries[n] {
                *next_prev = prev;
            }
        }

        size
    }

    fn relink_all(&mut self) {
        self.bins = [None; BINS];
        let heads = self.free_runs();
        for (head, size) in heads {
            self.link(head, size);
        }
    }

    /// The head of the free run whose last block is `block`, if there is one.
    fn free_run_ending_at(&self, block: usize) -> Option<usize> {
        match self.entries.get(block)? {
            Entry::Free { size: 1, .. } => Some(block),
            Entry::FreeTail { head } => Some(*head),
            _ => None,
        }
    }

    fn mark_run(&mut self, head: usize, length: usize) {
        self.entries[head] = Entry::RunHead { length };
        for offset in 1..length {
            self.entries[head + offset] = Entry::RunBody { offset };
        }
    }

    /// Mark `count` blocks starting at `start` free, merging them with the
    /// free runs directly before and after. Returns the resulting run as
    /// `(first block, length)`.
    pub fn release(&mut self, start: usize, count: usize) -> (usize, usize) {
        assert!(count > 0, "Can't release an empty run");
        assert!(
            start + count <= self.entries.len(),
            "Run {}+{} is outside a table of {} blocks",
            start,
            count,
            self.entries.len()
        );

        for entry in &mut self.entries[start..start + count] {
            *entry = Entry::FreeBody;
        }

        let mut head = start;
        let mut size = count;

        if start > 0 {
            if let Some(before) = self.free_run_ending_at(start - 1) {
                size += self.unlink(before);
                self.entries[start - 1] = Entry::FreeBody;
                head = before;
            }
        }

        let end = start + count;
        if matches!(self.entries.get(end), Some(Entry::Free { .. })) {
            size += self.unlink(end);
            self.entries[end] = Entry::FreeBody;
        }

        self.link(head, size);
        (head, size)
    }

    /// Find `count` contiguous free blocks, mark them as one busy run, and
    /// return the first block.
    ///
    /// The bin that `count` falls in is searched first-fit; every larger bin
    /// holds only runs that are large enough, so its head is taken.
    pub fn take(&mut self, count: usize) -> Option<usize> {
        let first = bin_of(count);

        let mut cursor = self.bins[first];
        while let Some(head) = cursor {
            match self.entries[head] {
                Entry::Free { size, .. } if size >= count => return Some(self.carve(head, count)),
                Entry::Free { next, .. } => cursor = next,
                other => panic!("Bin {} links to a busy block {}: {:?}", first, head, other),
            }
        }

        let head = self.bins[first + 1..].iter().find_map(|&bin| bin)?;
        Some(self.carve(head, count))
    }

    // Split the lower `count` blocks off a free run and mark them busy.
    fn carve(&mut self, head: usize, count: usize) -> usize {
        let size = self.unlink(head);
        if size > count {
            self.link(head + count, size - count);
        }
        self.mark_run(head, count);
        head
    }

    /// Append `count` free blocks to the end of the table, merged with any
    /// trailing free run.
    pub fn push_blocks(&mut self, count: usize) -> (usize, usize) {
        let start = self.entries.len();
        self.entries.resize(start + count, Entry::FreeBody);
        self.release(start, count)
    }

    /// Length of the free run at the very end of the table.
    pub fn trailing_free(&self) -> usize {
        let last = match self.entries.len().checked_sub(1) {
            Some(last) => last,
            None => return 0,
        };
        match self.free_run_ending_at(last) {
            Some(head) => self.entries.len() - head,
            None => 0,
        }
    }

    /// Drop `count` blocks from the end of the table. Refuses, returning
    /// false, unless all of them are free.
    pub fn truncate(&mut self, count: usize) -> bool {
        if count == 0 {
            return true;
        }
        if self.trailing_free() < count {
            return false;
        }

        let len = self.entries.len();
        let head = match self.free_run_ending_at(len - 1) {
            Some(head) => head,
            None => return false,
        };
        let size = self.unlink(head);
        self.entries.truncate(len - count);
        if size > count {
            self.link(head, size - count);
        }
        true
    }

    /// Grow the busy run at `head` from `length` to `want` blocks using the
    /// free run right after it. Returns false, changing nothing, if that run
    /// is missing or too small.
    pub fn extend_run(&mut self, head: usize, length: usize, want: usize) -> bool {
        let next = head + length;
        let extra = want - length;
        let available = match self.entries.get(next) {
            Some(Entry::Free { size, .. }) => *size,
            _ => 0,
        };
        if available < extra {
            return false;
        }

        let size = self.unlink(next);
        if size > extra {
            self.link(next + extra, size - extra);
        }
        self.mark_run(head, want);
        true
    }

    /// Cut the busy run at `head` down from `length` to `want` blocks,
    /// releasing the rest.
    pub fn shrink_run(&mut self, head: usize, length: usize, want: usize) {
        assert!(want > 0 && want < length, "Can only shrink to a shorter run");
        self.entries[head] = Entry::RunHead { length: want };
        self.release(head + want, length - want);
    }

    /// Check the table for broken invariants.
    pub fn check(&self) -> Validity {
        let mut validity = Validity::default();
        let mut free_runs = 0;
        let mut previous_free = false;

        for (block, entry) in self.runs() {
            match entry {
                Entry::Free { size, .. } => {
                    free_runs += 1;
                    if previous_free {
                        validity.adjacents += 1;
                    }
                    let tail_ok = size == 1
                        || self.entries.get(block + size - 1)
                            == Some(&Entry::FreeTail { head: block });
                    if !tail_ok {
                        validity.broken_tags += 1;
                    }
                }
                Entry::RunHead { length } => {
                    let bodies_ok = length > 0
                        && (1..length).all(|offset| {
                            self.entries.get(block + offset) == Some(&Entry::RunBody { offset })
                        });
                    if !bodies_ok {
                        validity.broken_tags += 1;
                    }
                }
                Entry::Fragmented { .. } => {}
                Entry::FreeTail { .. } | Entry::FreeBody | Entry::RunBody { .. } => {
                    validity.misplaced += 1;
                }
            }
            previous_free = matches!(entry, Entry::Free { .. });
        }

        let mut binned = 0;
        for (bin, &first) in self.bins.iter().enumerate() {
            let mut cursor = first;
            // Cap the walk so a cycle can't hang the check
            let mut steps = 0;
            while let Some(head) = cursor {
                steps += 1;
                if steps > self.entries.len() {
                    validity.unbinned += 1;
                    break;
                }
                match self.entries.get(head) {
                    Some(&Entry::Free { size, next, .. }) => {
                        if bin_of(size) != bin {
                            validity.unbinned += 1;
                        }
                        binned += 1;
                        cursor = next;
                    }
                    _ => {
                        validity.unbinned += 1;
                        break;
                    }
                }
            }
        }
        validity.unbinned += (free_runs as isize - binned as isize).unsigned_abs();

        validity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn table(blocks: usize) -> InfoTable {
        let mut table = InfoTable::new();
        table.push_blocks(blocks);
        table
    }

    #[test]
    fn test_take_carves_lowest_blocks() {
        let mut table = table(16);
        assert_eq!(table.free_runs(), vec![(0, 16)]);

        assert_eq!(table.take(3), Some(0));
        assert_eq!(table.take(1), Some(3));
        assert_eq!(table.get(0), Some(Entry::RunHead { length: 3 }));
        assert_eq!(table.get(2), Some(Entry::RunBody { offset: 2 }));
        assert_eq!(table.free_runs(), vec![(4, 12)]);
        assert!(table.check().is_valid());

        assert_eq!(table.take(13), None);
        assert_eq!(table.take(12), Some(4));
        assert!(table.free_runs().is_empty());
        assert_eq!(table.trailing_free(), 0);
        assert!(table.check().is_valid());
    }

    #[test]
    fn test_release_coalesces_both_sides() {
        let mut table = table(10);
        let a = table.take(2).unwrap();
        let b = table.take(3).unwrap();
        let c = table.take(1).unwrap();
        log::info!("allocated: {}", table);

        // Free the middle one: neighbours are busy, no merging
        assert_eq!(table.release(b, 3), (b, 3));
        assert_eq!(table.free_runs(), vec![(2, 3), (6, 4)]);
        assert!(table.check().is_valid());

        // Free the first: merges with the middle
        assert_eq!(table.release(a, 2), (0, 5));
        assert_eq!(table.free_runs(), vec![(0, 5), (6, 4)]);
        assert!(table.check().is_valid());

        // Free the last: everything becomes a single run
        assert_eq!(table.release(c, 1), (0, 10));
        assert_eq!(table.free_runs(), vec![(0, 10)]);
        log::info!("released: {}", table);
        assert!(table.check().is_valid());
    }

    #[test]
    fn test_take_prefers_fitting_run_in_smaller_bin() {
        let mut table = table(20);
        let runs: Vec<usize> = (0..6).map(|_| table.take(2).unwrap()).collect();
        let rest = table.take(8).unwrap();
        assert_eq!(rest, 12);

        // Free runs of 2 blocks at 0 and of 2 blocks at 8 (bin 1), and the
        // 8-block run at 12 merged with the trailing free space.
        table.release(runs[0], 2);
        table.release(runs[4], 2);
        table.release(rest, 8);
        assert_eq!(table.free_runs(), vec![(0, 2), (8, 2), (12, 8)]);

        // A 3-block request skips bin 1 and takes the head of the larger bin
        assert_eq!(table.take(3), Some(12));
        // A 2-block request is satisfied from bin 1
        let two = table.take(2).unwrap();
        assert!(two == 0 || two == 8);
        assert!(table.check().is_valid());
    }

    #[test]
    fn test_extend_and_shrink_run() {
        let mut table = table(8);
        let a = table.take(2).unwrap();
        let b = table.take(2).unwrap();

        // b is followed by 4 free blocks
        assert!(table.extend_run(b, 2, 5));
        assert_eq!(table.get(b), Some(Entry::RunHead { length: 5 }));
        assert_eq!(table.free_runs(), vec![(7, 1)]);
        assert!(!table.extend_run(b, 5, 7));
        // a is followed by a busy run
        assert!(!table.extend_run(a, 2, 3));

        table.shrink_run(b, 5, 1);
        assert_eq!(table.free_runs(), vec![(3, 5)]);
        assert!(table.check().is_valid());
    }

    #[test]
    fn test_truncate_only_free_tail() {
        let mut table = table(6);
        let a = table.take(4).unwrap();
        assert_eq!(table.trailing_free(), 2);
        assert!(!table.truncate(3));
        assert!(table.truncate(1));
        assert_eq!(table.len(), 5);
        assert_eq!(table.free_runs(), vec![(4, 1)]);

        table.release(a, 4);
        assert_eq!(table.trailing_free(), 5);
        assert!(table.truncate(5));
        assert!(table.is_empty());
        assert!(table.check().is_valid());
    }

    #[test]
    fn test_rebuild_from_entries() {
        let mut table = table(12);
        let a = table.take(3).unwrap();
        let _b = table.take(1).unwrap();
        let c = table.take(5).unwrap();
        table.release(a, 3);
        table.release(c, 5);

        let rebuilt = InfoTable::from_entries(table.entries().to_vec());
        assert_eq!(rebuilt.free_runs(), table.free_runs());
        assert!(rebuilt.check().is_valid());
    }

    #[test]
    fn test_check_flags_adjacent_runs() {
        let mut entries = vec![Entry::FreeBody; 4];
        entries[0] = Entry::Free {
            size: 2,
            next: None,
            prev: None,
        };
        entries[1] = Entry::FreeTail { head: 0 };
        entries[2] = Entry::Free {
            size: 2,
            next: None,
            prev: None,
        };
        entries[3] = Entry::FreeTail { head: 2 };
        let table = InfoTable::from_entries(entries);
        let validity = table.check();
        assert_eq!(validity.adjacents, 1);
        assert!(!validity.is_valid());
    }

    #[test]
    fn test_check_flags_empty_runs() {
        let entries = vec![
            Entry::RunHead { length: 0 },
            Entry::Free {
                size: 1,
                next: None,
                prev: None,
            },
        ];
        let table = InfoTable::from_entries(entries);
        let validity = table.check();
        assert_eq!(validity.broken_tags, 1);
        assert!(!validity.is_valid());
    }
}
