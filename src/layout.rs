//! The metadata area at the start of every backing region.
//!
//! All fields are little-endian at fixed offsets, so a heap written by one
//! process can be attached by another regardless of where either maps it:
//!
//! ```text
//! header          HEADER_BYTES
//! info table      max_blocks x ENTRY_BYTES
//! fragment heads  FRAGMENT_HEADS x u64
//! name slots      slot_capacity x SLOT_BYTES
//! align records   align_capacity x ALIGN_RECORD_BYTES
//! busy maps       max_blocks x map_bytes
//! padding         up to meta_len
//! arena           limit_blocks blocks
//! ```
//!
//! The in-memory structures are the source of truth while a heap is open;
//! [`Heap::sync`] writes them out and attaching reads them back.

use std::str;

use log::{debug, warn};
use static_assertions::const_assert;

use crate::align::AlignRecords;
use crate::bitmap::{words_for, FragmentMaps};
use crate::blocklist::{Entry, InfoTable};
use crate::config::{MAX_BLOCK_LOG2, MIN_BLOCK_LOG2};
use crate::error::{HeapError, Result};
use crate::heap::{decode_link, encode_link, Heap, Ptr, MIN_FRAGMENT_LOG2};
use crate::registry::{MapSlot, Registry};
use crate::store::BackingStore;

pub const MAGIC: [u8; 8] = *b"PHEAP\0v1";
pub const VERSION: u32 = 1;

pub const HEADER_BYTES: usize = 128;
pub const ENTRY_BYTES: usize = 16;
pub const FRAGMENT_HEADS: usize = 32;
/// Longest name the registry stores.
pub const NAME_MAX: usize = 54;
pub const SLOT_BYTES: usize = 64;
pub const ALIGN_RECORD_BYTES: usize = 16;

// Header fields
const AT_VERSION: usize = 8;
const AT_BLOCK_LOG2: usize = 12;
const AT_LIMIT: usize = 16;
const AT_MAX_BLOCKS: usize = 24;
const AT_META_LEN: usize = 32;
const AT_SLOT_COUNT: usize = 40;
const AT_SLOT_CAPACITY: usize = 48;
const AT_ALIGN_COUNT: usize = 56;
const AT_ALIGN_CAPACITY: usize = 64;
const AT_FLOOR: usize = 72;

const_assert!(AT_FLOOR + 8 <= HEADER_BYTES);
const_assert!(2 + NAME_MAX + 8 == SLOT_BYTES);
const_assert!(FRAGMENT_HEADS > MAX_BLOCK_LOG2 as usize);
const_assert!(MIN_BLOCK_LOG2 > MIN_FRAGMENT_LOG2);

const NIL32: u32 = u32::MAX;

const TAG_FREE: u32 = 1;
const TAG_FREE_TAIL: u32 = 2;
const TAG_FREE_BODY: u32 = 3;
const TAG_RUN_HEAD: u32 = 4;
const TAG_RUN_BODY: u32 = 5;
const TAG_FRAGMENTED: u32 = 6;

/// Byte offsets of the metadata tables for one geometry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MetaLayout {
    pub info: usize,
    pub fragments: usize,
    pub slots: usize,
    pub aligned: usize,
    pub busy: usize,
    /// Bytes of busy map per block: one bit for each of the smallest
    /// fragments.
    pub map_bytes: usize,
    /// First byte past the metadata, before padding.
    pub end: usize,
}

impl MetaLayout {
    /// `None` if the tables don't fit in the address space. `block_log2` must
    /// be a supported block size.
    pub fn new(
        block_log2: u32,
        max_blocks: usize,
        slot_capacity: usize,
        align_capacity: usize,
    ) -> Option<Self> {
        let map_bytes = 8 * words_for(1 << (block_log2 - MIN_FRAGMENT_LOG2));
        let info = HEADER_BYTES;
        let fragments = info.checked_add(max_blocks.checked_mul(ENTRY_BYTES)?)?;
        let slots = fragments.checked_add(FRAGMENT_HEADS * 8)?;
        let aligned = slots.checked_add(slot_capacity.checked_mul(SLOT_BYTES)?)?;
        let busy = aligned.checked_add(align_capacity.checked_mul(ALIGN_RECORD_BYTES)?)?;
        let end = busy.checked_add(max_blocks.checked_mul(map_bytes)?)?;
        Some(MetaLayout {
            info,
            fragments,
            slots,
            aligned,
            busy,
            map_bytes,
            end,
        })
    }
}

pub(crate) fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn put_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn put_u16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn encode_block_link(link: Option<usize>) -> u32 {
    link.map_or(NIL32, |block| block as u32)
}

fn decode_block_link(raw: u32) -> Option<usize> {
    if raw == NIL32 {
        None
    } else {
        Some(raw as usize)
    }
}

fn encode_entry(entry: Entry) -> [u32; 4] {
    match entry {
        Entry::Free { size, next, prev } => [
            TAG_FREE,
            size as u32,
            encode_block_link(next),
            encode_block_link(prev),
        ],
        Entry::FreeTail { head } => [TAG_FREE_TAIL, head as u32, 0, 0],
        Entry::FreeBody => [TAG_FREE_BODY, 0, 0, 0],
        Entry::RunHead { length } => [TAG_RUN_HEAD, length as u32, 0, 0],
        Entry::RunBody { offset } => [TAG_RUN_BODY, offset as u32, 0, 0],
        Entry::Fragmented { log2, nfree } => [TAG_FRAGMENTED, log2, nfree as u32, 0],
    }
}

fn decode_entry(raw: [u32; 4]) -> Option<Entry> {
    let [tag, a, b, c] = raw;
    let entry = match tag {
        TAG_FREE => Entry::Free {
            size: a as usize,
            next: decode_block_link(b),
            prev: decode_block_link(c),
        },
        TAG_FREE_TAIL => Entry::FreeTail { head: a as usize },
        TAG_FREE_BODY => Entry::FreeBody,
        TAG_RUN_HEAD => Entry::RunHead { length: a as usize },
        TAG_RUN_BODY => Entry::RunBody { offset: a as usize },
        TAG_FRAGMENTED => Entry::Fragmented {
            log2: a,
            nfree: b as usize,
        },
        _ => return None,
    };
    Some(entry)
}

fn corrupt(reason: &'static str) -> HeapError {
    warn!("Refusing to attach: {}", reason);
    HeapError::Corrupt(reason)
}

impl<S: BackingStore> Heap<S> {
    /// Attach to the heap already laid out in `store`.
    ///
    /// Free-run bins are rebuilt from the info table, and the whole structure
    /// is checked before the heap is handed out.
    pub fn attach(mut store: S) -> Result<Self> {
        let region = store.as_slice();
        if region.len() < HEADER_BYTES || region[..8] != MAGIC {
            return Err(corrupt("missing heap header"));
        }
        if get_u32(region, AT_VERSION) != VERSION {
            return Err(corrupt("unsupported metadata version"));
        }
        let block_log2 = get_u32(region, AT_BLOCK_LOG2);
        if !(MIN_BLOCK_LOG2..=MAX_BLOCK_LOG2).contains(&block_log2) {
            return Err(corrupt("block size out of range"));
        }

        let field = |at| {
            usize::try_from(get_u64(region, at)).map_err(|_| corrupt("oversized header field"))
        };
        let limit = field(AT_LIMIT)?;
        let max_blocks = field(AT_MAX_BLOCKS)?;
        let meta_len = field(AT_META_LEN)?;
        let slot_count = field(AT_SLOT_COUNT)?;
        let slot_capacity = field(AT_SLOT_CAPACITY)?;
        let align_count = field(AT_ALIGN_COUNT)?;
        let align_capacity = field(AT_ALIGN_CAPACITY)?;
        let floor = field(AT_FLOOR)?;

        let layout = MetaLayout::new(block_log2, max_blocks, slot_capacity, align_capacity)
            .ok_or_else(|| corrupt("metadata tables overflow"))?;
        if meta_len < layout.end
            || limit > max_blocks
            || slot_count > slot_capacity
            || align_count > align_capacity
        {
            return Err(corrupt("inconsistent header"));
        }
        let expected_len = limit
            .checked_mul(1 << block_log2)
            .and_then(|arena| arena.checked_add(meta_len))
            .ok_or_else(|| corrupt("arena size overflows"))?;
        if region.len() < expected_len {
            return Err(corrupt("region is shorter than its recorded arena"));
        }

        let mut entries = Vec::with_capacity(limit);
        for block in 0..limit {
            let at = layout.info + block * ENTRY_BYTES;
            let raw = [
                get_u32(region, at),
                get_u32(region, at + 4),
                get_u32(region, at + 8),
                get_u32(region, at + 12),
            ];
            entries.push(decode_entry(raw).ok_or_else(|| corrupt("unknown info table entry"))?);
        }
        let in_range = entries.iter().enumerate().all(|(block, entry)| match *entry {
            Entry::Free { size, .. } => size > 0 && block + size <= limit,
            Entry::FreeTail { head } => head < block,
            Entry::FreeBody => true,
            Entry::RunHead { length } => length > 0 && block + length <= limit,
            Entry::RunBody { offset } => offset > 0 && offset <= block,
            Entry::Fragmented { log2, nfree } => {
                (MIN_FRAGMENT_LOG2..block_log2).contains(&log2)
                    && nfree < 1 << (block_log2 - log2)
            }
        });
        if !in_range {
            return Err(corrupt("info table entry out of range"));
        }

        let mut busy = FragmentMaps::new();
        for (block, entry) in entries.iter().enumerate() {
            if let Entry::Fragmented { log2, .. } = *entry {
                let at = layout.busy + block * layout.map_bytes;
                let words = (0..words_for(1 << (block_log2 - log2)))
                    .map(|i| get_u64(region, at + 8 * i))
                    .collect();
                busy.insert_words(block, words);
            }
        }

        let frag_heads = (0..block_log2 as usize)
            .map(|log2| decode_link(get_u64(region, layout.fragments + 8 * log2)))
            .collect();

        let mut slots = Vec::with_capacity(slot_count);
        for index in 0..slot_count {
            let at = layout.slots + index * SLOT_BYTES;
            let name_len = get_u16(region, at) as usize;
            if name_len == 0 {
                slots.push(None);
                continue;
            }
            if name_len > NAME_MAX {
                return Err(corrupt("name slot overflows"));
            }
            let name = str::from_utf8(&region[at + 2..at + 2 + name_len])
                .map_err(|_| corrupt("name is not UTF-8"))?;
            let ptr = usize::try_from(get_u64(region, at + 2 + NAME_MAX))
                .map_err(|_| corrupt("name slot overflows"))?;
            slots.push(Some(MapSlot::new(name, Ptr::from_offset(ptr))));
        }
        let registry = Registry::from_slots(slot_capacity, slots)
            .ok_or_else(|| corrupt("duplicate name in registry"))?;

        let mut records = Vec::with_capacity(align_count);
        for index in 0..align_count {
            let at = layout.aligned + index * ALIGN_RECORD_BYTES;
            records.push((get_u64(region, at) as usize, get_u64(region, at + 8) as usize));
        }
        let aligned = AlignRecords::from_records(align_capacity, records);

        // Blocks grown after the last sync were never recorded; drop them.
        if store.len() > expected_len {
            store.resize(expected_len)?;
        }

        let heap = Heap {
            store,
            block_log2,
            meta_len,
            max_blocks,
            floor_blocks: floor.min(limit),
            info: InfoTable::from_entries(entries),
            frag_heads,
            busy,
            aligned,
            registry,
        };
        let validity = heap.check();
        if !validity.is_valid() {
            warn!("Attached heap fails its checks: {:?}", validity);
            return Err(HeapError::Corrupt("inconsistent allocator state"));
        }
        debug!(
            "Attached heap: {} of {} blocks of {} bytes, {} named objects",
            limit,
            max_blocks,
            heap.block_size(),
            heap.registry.len()
        );
        Ok(heap)
    }

    /// Write the allocator state into the metadata area and flush the store.
    pub fn sync(&mut self) -> Result<()> {
        self.marshal()?;
        self.store.flush()?;
        debug!("Synced heap of {} blocks", self.info.len());
        Ok(())
    }

    fn marshal(&mut self) -> Result<()> {
        let layout = MetaLayout::new(
            self.block_log2,
            self.max_blocks,
            self.registry.capacity(),
            self.aligned.capacity(),
        )
        .ok_or(HeapError::Corrupt("metadata tables overflow"))?;
        let meta = &mut self.store.as_mut_slice()[..self.meta_len];

        meta[..HEADER_BYTES].fill(0);
        meta[..8].copy_from_slice(&MAGIC);
        put_u32(meta, AT_VERSION, VERSION);
        put_u32(meta, AT_BLOCK_LOG2, self.block_log2);
        put_u64(meta, AT_LIMIT, self.info.len() as u64);
        put_u64(meta, AT_MAX_BLOCKS, self.max_blocks as u64);
        put_u64(meta, AT_META_LEN, self.meta_len as u64);
        put_u64(meta, AT_SLOT_COUNT, self.registry.slots().len() as u64);
        put_u64(meta, AT_SLOT_CAPACITY, self.registry.capacity() as u64);
        put_u64(meta, AT_ALIGN_COUNT, self.aligned.len() as u64);
        put_u64(meta, AT_ALIGN_CAPACITY, self.aligned.capacity() as u64);
        put_u64(meta, AT_FLOOR, self.floor_blocks as u64);

        for (block, &entry) in self.info.entries().iter().enumerate() {
            let at = layout.info + block * ENTRY_BYTES;
            for (i, word) in encode_entry(entry).into_iter().enumerate() {
                put_u32(meta, at + 4 * i, word);
            }
        }

        for log2 in 0..FRAGMENT_HEADS {
            let head = self.frag_heads.get(log2).copied().flatten();
            put_u64(meta, layout.fragments + 8 * log2, encode_link(head));
        }

        for (index, slot) in self.registry.slots().iter().enumerate() {
            let at = layout.slots + index * SLOT_BYTES;
            meta[at..at + SLOT_BYTES].fill(0);
            if let Some(slot) = slot {
                let name = slot.name().as_bytes();
                put_u16(meta, at, name.len() as u16);
                meta[at + 2..at + 2 + name.len()].copy_from_slice(name);
                put_u64(meta, at + 2 + NAME_MAX, slot.ptr().offset() as u64);
            }
        }

        for (index, (aligned, exact)) in self.aligned.iter().enumerate() {
            let at = layout.aligned + index * ALIGN_RECORD_BYTES;
            put_u64(meta, at, aligned as u64);
            put_u64(meta, at + 8, exact as u64);
        }

        for block in 0..self.info.len() {
            let at = layout.busy + block * layout.map_bytes;
            meta[at..at + layout.map_bytes].fill(0);
            if let Some(words) = self.busy.words(block) {
                for (i, &word) in words.iter().enumerate() {
                    put_u64(meta, at + 8 * i, word);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::config::HeapConfig;
    use crate::heap::test_heap;
    use crate::store::MemoryStore;

    fn reattach(mut heap: Heap<MemoryStore>) -> Result<Heap<MemoryStore>> {
        heap.sync().unwrap();
        Heap::attach(heap.into_store())
    }

    #[test]
    fn test_layout_offsets() {
        let layout = MetaLayout::new(12, 10, 2, 3).unwrap();
        assert_eq!(layout.info, 128);
        assert_eq!(layout.fragments, 128 + 160);
        assert_eq!(layout.slots, 288 + 256);
        assert_eq!(layout.aligned, 544 + 128);
        assert_eq!(layout.busy, 672 + 48);
        // 256 fragments of 16 bytes per block
        assert_eq!(layout.map_bytes, 32);
        assert_eq!(layout.end, 720 + 320);

        assert_eq!(MetaLayout::new(MIN_BLOCK_LOG2, 1, 0, 0).unwrap().map_bytes, 8);
        assert_eq!(MetaLayout::new(12, usize::MAX / 2, 1, 1), None);
    }

    #[test]
    fn test_entries_survive_encoding() {
        let entries = [
            Entry::Free {
                size: 7,
                next: Some(3),
                prev: None,
            },
            Entry::FreeTail { head: 12 },
            Entry::FreeBody,
            Entry::RunHead { length: 4 },
            Entry::RunBody { offset: 3 },
            Entry::Fragmented { log2: 9, nfree: 5 },
        ];
        for entry in entries {
            assert_eq!(decode_entry(encode_entry(entry)), Some(entry));
        }
        assert_eq!(decode_entry([0, 1, 2, 3]), None);
    }

    #[test]
    fn test_reattach_preserves_state() {
        let mut heap = test_heap(12, 16, 32);
        let run = heap.allocate(3 * 4096).unwrap();
        let small = heap.allocate(40).unwrap();
        let gone = heap.allocate(4096).unwrap();
        heap.free(gone).unwrap();
        heap.write(run, b"still here").unwrap();
        let named = heap.allocate_named("config", 100).unwrap();
        heap.write(named, b"named").unwrap();
        // Too big to land aligned by chance: needs an alignment record
        let aligned = heap.allocate_aligned(16384, 100).unwrap();
        assert_eq!(aligned.offset(), 8 * 4096);

        let stats = heap.stats();
        let runs = heap.free_runs();
        let mut heap = reattach(heap).unwrap();

        assert_eq!(heap.stats(), stats);
        assert_eq!(heap.free_runs(), runs);
        assert_eq!(heap.lookup("config").unwrap(), named);
        assert_eq!(heap.bytes(named, 5).unwrap(), b"named");
        assert_eq!(heap.bytes(run, 10).unwrap(), b"still here");

        // Fragment lists still work: the next 64-byte fragment sits right
        // after the one handed out before the round trip.
        let next = heap.allocate(64).unwrap();
        assert_eq!(next.offset(), small.offset() + 64);

        // Aligned handles are still known
        heap.free(aligned).unwrap();
        heap.free(next).unwrap();
        heap.free(small).unwrap();
        heap.free_named("config").unwrap();
        heap.free(run).unwrap();
        assert_eq!(heap.free_runs(), vec![(0, 16)]);
        assert!(heap.check().is_valid());
    }

    #[test]
    fn test_unsynced_growth_is_dropped() {
        let mut heap = test_heap(12, 4, 32);
        heap.sync().unwrap();
        heap.grow(4).unwrap();
        // No sync: the header still says 4 blocks
        let heap = Heap::attach(heap.into_store()).unwrap();
        assert_eq!(heap.limit_blocks(), 4);
        assert_eq!(heap.store().len(), heap.meta_len + 4 * 4096);
    }

    #[test]
    fn test_rejects_foreign_regions() {
        let config = HeapConfig::with_blocks(12, 4, 8);
        let mut store = MemoryStore::new(config.capacity_bytes().unwrap()).unwrap();
        store.resize(4096).unwrap();
        store.as_mut_slice()[..8].copy_from_slice(b"NOTAHEAP");
        assert!(matches!(
            Heap::attach(store),
            Err(HeapError::Corrupt("missing heap header"))
        ));

        // A valid header over a broken info table
        let mut heap = test_heap(12, 4, 8);
        heap.sync().unwrap();
        let info = MetaLayout::new(12, 8, heap.registry.capacity(), heap.aligned.capacity())
            .unwrap()
            .info;
        let mut store = heap.into_store();
        put_u32(store.as_mut_slice(), info, 99);
        assert!(matches!(
            Heap::attach(store),
            Err(HeapError::Corrupt("unknown info table entry"))
        ));

        // An entry that decodes but can't start a run
        let mut heap = test_heap(12, 4, 8);
        heap.sync().unwrap();
        let mut store = heap.into_store();
        put_u32(store.as_mut_slice(), info, TAG_RUN_BODY);
        assert!(matches!(Heap::attach(store), Err(HeapError::Corrupt(_))));

        // An empty busy run
        let mut heap = test_heap(12, 4, 8);
        heap.allocate(4096).unwrap();
        heap.sync().unwrap();
        let mut store = heap.into_store();
        assert_eq!(get_u32(store.as_slice(), info), TAG_RUN_HEAD);
        put_u32(store.as_mut_slice(), info + 4, 0);
        assert!(matches!(
            Heap::attach(store),
            Err(HeapError::Corrupt("info table entry out of range"))
        ));

        // Fragments as large as the block
        let mut heap = test_heap(12, 4, 8);
        heap.allocate(100).unwrap();
        heap.sync().unwrap();
        let mut store = heap.into_store();
        assert_eq!(get_u32(store.as_slice(), info), TAG_FRAGMENTED);
        put_u32(store.as_mut_slice(), info + 4, 12);
        assert!(matches!(
            Heap::attach(store),
            Err(HeapError::Corrupt("info table entry out of range"))
        ));
    }

    #[test]
    fn test_busy_maps_survive_reattach() {
        let mut heap = test_heap(12, 4, 8);
        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(16).unwrap();
        // Contents shaped like free-list links must not matter
        heap.write(a, &[0; 16]).unwrap();
        heap.write(b, &[0xFF; 16]).unwrap();
        heap.free(a).unwrap();

        let mut heap = reattach(heap).unwrap();
        assert_eq!(heap.busy.busy_count(0), Some(1));
        assert_eq!(heap.bytes(b, 16).unwrap(), &[0xFF; 16]);
        assert!(matches!(heap.free(a), Err(HeapError::InvalidPointer(_))));
        heap.free(b).unwrap();
        assert!(heap.busy.is_empty());
    }

    #[test]
    fn test_rejects_lost_busy_bits() {
        let mut heap = test_heap(12, 4, 8);
        heap.allocate(100).unwrap();
        heap.sync().unwrap();
        let busy = MetaLayout::new(12, 8, heap.registry.capacity(), heap.aligned.capacity())
            .unwrap()
            .busy;
        let mut store = heap.into_store();
        assert_eq!(get_u64(store.as_slice(), busy), 1);
        put_u64(store.as_mut_slice(), busy, 0);
        assert!(matches!(
            Heap::attach(store),
            Err(HeapError::Corrupt("inconsistent allocator state"))
        ));
    }

    #[test]
    fn test_floor_survives_reattach() {
        let mut heap = test_heap(12, 4, 16);
        heap.shrink(2).unwrap();
        let mut heap = reattach(heap).unwrap();
        assert_eq!(heap.floor_blocks, 2);

        let ptr = heap.allocate(6 * 4096).unwrap();
        heap.free(ptr).unwrap();
        assert_eq!(heap.limit_blocks(), 2);
    }

    #[test]
    fn test_short_region_is_corrupt() {
        let mut heap = test_heap(12, 4, 8);
        heap.sync().unwrap();
        let mut store = heap.into_store();
        let len = store.len();
        store.resize(len - 4096).unwrap();
        assert!(matches!(Heap::attach(store), Err(HeapError::Corrupt(_))));
    }
}
