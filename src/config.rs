//! Heap configuration.

use crate::error::{HeapError, Result};
use crate::layout::MetaLayout;
use crate::store::{page_size, round_up};

/// Smallest and largest supported block size, as log2 of bytes.
pub const MIN_BLOCK_LOG2: u32 = 8;
pub const MAX_BLOCK_LOG2: u32 = 24;

/// Configuration for one heap. All fields have sensible defaults.
///
/// When attaching to an existing backing store, the geometry recorded in the
/// store wins; only the capacity of a freshly created store is taken from
/// here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Block size in bytes is `1 << block_log2`. Default: 12 (4096 bytes).
    pub block_log2: u32,

    /// Blocks the arena starts with. Freeing objects never shrinks the arena
    /// below this. Default: 16.
    pub initial_blocks: usize,

    /// Blocks the arena may grow to. Default: 16384 (64 MiB of 4 KiB blocks).
    pub max_blocks: usize,

    /// Slots in the named-object registry. Default: 64.
    pub max_names: usize,

    /// Outstanding over-aligned allocations. Default: 256.
    pub max_aligned: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            block_log2: 12,
            initial_blocks: 16,
            max_blocks: 16384,
            max_names: 64,
            max_aligned: 256,
        }
    }
}

impl HeapConfig {
    /// A default configuration with the given block geometry.
    pub fn with_blocks(block_log2: u32, initial_blocks: usize, max_blocks: usize) -> Self {
        HeapConfig {
            block_log2,
            initial_blocks,
            max_blocks,
            ..Default::default()
        }
    }

    pub fn block_size(&self) -> usize {
        1 << self.block_log2
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_log2 < MIN_BLOCK_LOG2 || self.block_log2 > MAX_BLOCK_LOG2 {
            return Err(HeapError::Unsupported("block size out of range"));
        }
        if self.max_blocks == 0 || self.max_blocks >= u32::MAX as usize {
            return Err(HeapError::Unsupported("max_blocks out of range"));
        }
        if self.initial_blocks > self.max_blocks {
            return Err(HeapError::Unsupported("initial_blocks exceeds max_blocks"));
        }
        Ok(())
    }

    /// Bytes reserved in front of the arena for heap metadata. Rounded so the
    /// arena starts on both a page and a block boundary.
    pub fn meta_len(&self) -> Result<usize> {
        self.validate()?;
        let layout = MetaLayout::new(
            self.block_log2,
            self.max_blocks,
            self.max_names,
            self.max_aligned,
        )
        .ok_or(HeapError::OutOfMemory)?;
        Ok(round_up(layout.end, page_size().max(self.block_size())))
    }

    /// Bytes a backing store needs to hold the largest arena this
    /// configuration allows.
    pub fn capacity_bytes(&self) -> Result<usize> {
        let meta_len = self.meta_len()?;
        self.max_blocks
            .checked_mul(self.block_size())
            .and_then(|arena| arena.checked_add(meta_len))
            .ok_or(HeapError::OutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_default_is_valid() {
        let config = HeapConfig::default();
        config.validate().unwrap();
        assert_eq!(config.block_size(), 4096);

        let meta_len = config.meta_len().unwrap();
        assert_eq!(meta_len % page_size(), 0);
        assert_eq!(meta_len % config.block_size(), 0);
        assert_eq!(
            config.capacity_bytes().unwrap(),
            meta_len + config.max_blocks * config.block_size()
        );
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let too_small = HeapConfig::with_blocks(MIN_BLOCK_LOG2 - 1, 1, 8);
        assert!(matches!(too_small.validate(), Err(HeapError::Unsupported(_))));

        let too_many_initial = HeapConfig::with_blocks(12, 9, 8);
        assert!(matches!(
            too_many_initial.validate(),
            Err(HeapError::Unsupported(_))
        ));

        let empty = HeapConfig::with_blocks(12, 0, 0);
        assert!(empty.capacity_bytes().is_err());
    }
}
