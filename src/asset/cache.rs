//! The block cache: just enough block data to avoid refetching headers.
//!
//! Two indexes: every block ever seen by hash, and the main chain by
//! height. Orphaned blocks stay in the hash index but never appear in the
//! height index, so `at_height` answers are always main-chain answers.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{AssetError, Hash256, VerboseBlock};

/// A cached block record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBlock {
    pub hash: Hash256,
    /// Zero hash for the genesis block.
    pub prev_hash: Hash256,
    pub height: u32,
    pub orphaned: bool,
}

#[derive(Default)]
struct CacheInner {
    blocks: HashMap<Hash256, CachedBlock>,
    mainchain: HashMap<u32, Hash256>,
    tip: Option<(u32, Hash256)>,
}

/// Height- and hash-indexed cache of chain blocks, shared between the block
/// consumer (writer) and synchronous query paths (readers).
#[derive(Default)]
pub struct BlockCache {
    inner: RwLock<CacheInner>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a block from its verbose RPC record. Negative confirmations
    /// mean the node no longer considers it main-chain: it is cached as an
    /// orphan and kept out of the height index.
    pub fn add(&self, verbose: &VerboseBlock) -> Result<CachedBlock, AssetError> {
        let hash = Hash256::from_hex(&verbose.hash)?;
        let prev_hash = if verbose.previous_hash.is_empty() {
            Hash256::default()
        } else {
            Hash256::from_hex(&verbose.previous_hash)?
        };
        let height: u32 = verbose
            .height
            .try_into()
            .map_err(|_| AssetError::Inconsistency(format!("block height {}", verbose.height)))?;

        let block = CachedBlock {
            hash,
            prev_hash,
            height,
            orphaned: verbose.confirmations < 0,
        };

        let mut inner = self.inner.write();
        inner.blocks.insert(hash, block.clone());
        if !block.orphaned {
            inner.mainchain.insert(height, hash);
            match inner.tip {
                Some((tip_height, _)) if tip_height >= height => {}
                _ => inner.tip = Some((height, hash)),
            }
        }
        Ok(block)
    }

    /// Look up a block by hash, orphaned or not.
    pub fn block(&self, hash: &Hash256) -> Option<CachedBlock> {
        self.inner.read().blocks.get(hash).cloned()
    }

    /// The main-chain block at `height`, if the cache knows it.
    pub fn at_height(&self, height: u32) -> Option<CachedBlock> {
        let inner = self.inner.read();
        let hash = inner.mainchain.get(&height)?;
        inner.blocks.get(hash).cloned()
    }

    /// Hash of the highest main-chain block, once one is cached.
    pub fn tip_hash(&self) -> Option<Hash256> {
        self.inner.read().tip.map(|(_, hash)| hash)
    }

    /// Height of the highest main-chain block, once one is cached.
    pub fn tip_height(&self) -> Option<u32> {
        self.inner.read().tip.map(|(height, _)| height)
    }

    /// Reconcile a reorganization announced by `new_block`: every cached
    /// main-chain block at or above its height is orphaned and evicted from
    /// the height index. The new block itself is installed by the caller's
    /// subsequent [`add`](Self::add).
    pub fn reorg(&self, new_block: &VerboseBlock) {
        let Ok(new_height) = u32::try_from(new_block.height) else {
            tracing::error!("reorg to unusable height {}", new_block.height);
            return;
        };

        let mut inner = self.inner.write();
        let tip_height = match inner.tip {
            Some((height, _)) => height,
            None => return,
        };
        if new_height > tip_height {
            return;
        }
        tracing::warn!(
            "reorg detected: orphaning heights {new_height}..={tip_height} for block {}",
            new_block.hash,
        );

        for height in new_height..=tip_height {
            if let Some(hash) = inner.mainchain.remove(&height) {
                if let Some(block) = inner.blocks.get_mut(&hash) {
                    block.orphaned = true;
                }
            }
        }
        inner.tip = inner
            .mainchain
            .iter()
            .max_by_key(|(height, _)| **height)
            .map(|(height, hash)| (*height, *hash));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verbose(height: i64, confirmations: i64, tag: u8, prev_tag: u8) -> VerboseBlock {
        VerboseBlock {
            hash: hex::encode([tag; 32]),
            height,
            confirmations,
            previous_hash: hex::encode([prev_tag; 32]),
        }
    }

    /// Seed heights 100..=105 with one block each.
    fn seeded() -> BlockCache {
        let cache = BlockCache::new();
        for (i, height) in (100..=105).enumerate() {
            let tag = 10 + i as u8;
            cache.add(&verbose(height, 1, tag, tag.wrapping_sub(1))).unwrap();
        }
        cache
    }

    #[test]
    fn test_add_and_lookup() {
        let cache = BlockCache::new();
        let block = cache.add(&verbose(100, 1, 10, 9)).unwrap();
        assert!(!block.orphaned);

        assert_eq!(cache.block(&block.hash), Some(block.clone()));
        assert_eq!(cache.at_height(100), Some(block.clone()));
        assert_eq!(cache.tip_height(), Some(100));
        assert_eq!(cache.tip_hash(), Some(block.hash));
        assert_eq!(cache.at_height(101), None);
    }

    #[test]
    fn test_orphan_stays_out_of_height_index() {
        let cache = BlockCache::new();
        let block = cache.add(&verbose(100, -1, 10, 9)).unwrap();
        assert!(block.orphaned);
        assert!(cache.block(&block.hash).is_some());
        assert_eq!(cache.at_height(100), None);
        assert_eq!(cache.tip_height(), None);
    }

    #[test]
    fn test_tip_tracks_highest() {
        let cache = seeded();
        assert_eq!(cache.tip_height(), Some(105));
        // A lower add does not move the tip.
        cache.add(&verbose(99, 1, 60, 59)).unwrap();
        assert_eq!(cache.tip_height(), Some(105));
    }

    #[test]
    fn test_reorg_orphans_suffix() {
        let cache = seeded();
        let incoming = verbose(103, 1, 77, 12);

        cache.reorg(&incoming);
        for height in 103..=105 {
            assert_eq!(cache.at_height(height), None, "height {height}");
        }
        assert_eq!(cache.tip_height(), Some(102));

        // The replacement installs normally; the higher heights stay empty.
        let replacement = cache.add(&incoming).unwrap();
        assert_eq!(cache.at_height(103), Some(replacement));
        assert_eq!(cache.at_height(104), None);
        assert_eq!(cache.at_height(105), None);
        assert_eq!(cache.tip_height(), Some(103));
    }

    #[test]
    fn test_reorg_marks_blocks_orphaned() {
        let cache = seeded();
        let old_tip = cache.at_height(105).unwrap();

        cache.reorg(&verbose(103, 1, 77, 12));
        let orphan = cache.block(&old_tip.hash).unwrap();
        assert!(orphan.orphaned);
    }

    #[test]
    fn test_reorg_above_tip_is_noop() {
        let cache = seeded();
        cache.reorg(&verbose(200, 1, 77, 12));
        assert_eq!(cache.tip_height(), Some(105));
        assert!(cache.at_height(105).is_some());
    }

    #[test]
    fn test_add_rejects_bad_hash() {
        let cache = BlockCache::new();
        let bad = VerboseBlock {
            hash: "zz".into(),
            height: 1,
            confirmations: 1,
            previous_hash: String::new(),
        };
        assert!(matches!(cache.add(&bad), Err(AssetError::InvalidHash(_))));
    }
}
