//! Bounded pool of blocks received before their parent, keyed both by the
//! orphan's own hash and by the parent hash it is waiting on.

use std::collections::HashMap;
use std::time::Instant;

use bitcoin::block::Block;
use bitcoin::BlockHash;

/// A block held pending its parent's arrival.
#[derive(Debug, Clone)]
pub struct Orphan {
    /// The orphan block itself.
    pub block: Block,
    /// Verification flags the peer's announcement was received under.
    pub flags: script::VerifyFlags,
    /// Identifier of the peer that announced this block, for ban-scoring if
    /// the orphan later turns out invalid.
    pub peer_id: u64,
    /// Local receive time, used to expire stale orphans ahead of the oldest
    /// fallback.
    pub received_at: Instant,
}

/// Bounded orphan pool. Exactly one orphan is held per previous-block hash:
/// a competing orphan at the same parent evicts the earlier one rather than
/// both being kept, since only one of them can end up connecting.
#[derive(Debug, Default)]
pub struct OrphanPool {
    capacity: usize,
    by_hash: HashMap<BlockHash, Orphan>,
    by_prev: HashMap<BlockHash, BlockHash>,
}

impl OrphanPool {
    /// Build a pool bounded at `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        OrphanPool { capacity, by_hash: HashMap::new(), by_prev: HashMap::new() }
    }

    /// Insert `orphan`, evicting as needed to respect `capacity`. Returns
    /// the hash of any orphan this insertion displaced (a prior orphan at
    /// the same parent, or -- if the pool was full -- the expired/oldest
    /// entry), so the caller can log the eviction.
    pub fn insert(&mut self, hash: BlockHash, orphan: Orphan) -> Option<BlockHash> {
        let prev_hash = orphan.block.header.prev_blockhash;
        let mut displaced = None;

        if let Some(existing_hash) = self.by_prev.get(&prev_hash).copied() {
            self.by_hash.remove(&existing_hash);
            displaced = Some(existing_hash);
        } else if self.by_hash.len() >= self.capacity {
            let evict = self.oldest_or_expired();
            if let Some(evict_hash) = evict {
                if let Some(evicted) = self.by_hash.remove(&evict_hash) {
                    self.by_prev.remove(&evicted.block.header.prev_blockhash);
                }
                displaced = Some(evict_hash);
            }
        }

        self.by_prev.insert(prev_hash, hash);
        self.by_hash.insert(hash, orphan);
        displaced
    }

    fn oldest_or_expired(&self) -> Option<BlockHash> {
        let now = Instant::now();
        let expired = self
            .by_hash
            .iter()
            .find(|(_, orphan)| now.duration_since(orphan.received_at).as_secs() >= 3600)
            .map(|(hash, _)| *hash);
        expired.or_else(|| self.by_hash.iter().min_by_key(|(_, orphan)| orphan.received_at).map(|(hash, _)| *hash))
    }

    /// Remove and return the orphan waiting on `prev_hash`, if any -- called
    /// when the block at `prev_hash` has just connected, to chain-react the
    /// dependent orphan into the connector.
    pub fn take_waiting_on(&mut self, prev_hash: &BlockHash) -> Option<Orphan> {
        let hash = self.by_prev.remove(prev_hash)?;
        self.by_hash.remove(&hash)
    }

    /// Whether `hash` is currently held as an orphan.
    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Discard every held orphan: called on checkpoint mismatch or on a
    /// full chain reset, since orphans accumulated under a now-invalid
    /// history can never connect.
    pub fn clear(&mut self) {
        self.by_hash.clear();
        self.by_prev.clear();
    }

    /// Number of orphans currently held.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Whether the pool holds no orphans.
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::block::{Header, Version};
    use bitcoin::hash_types::TxMerkleNode;
    use bitcoin::hashes::Hash as _;
    use bitcoin::CompactTarget;

    fn orphan_block(prev: BlockHash, nonce: u32) -> Block {
        Block {
            header: Header {
                version: Version::from_consensus(1),
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 0,
                bits: CompactTarget::from_consensus(0x207fffff),
                nonce,
            },
            txdata: Vec::new(),
        }
    }

    fn wrap(block: Block) -> Orphan {
        Orphan { block, flags: script::VerifyFlags::empty(), peer_id: 1, received_at: Instant::now() }
    }

    #[test]
    fn competing_orphan_at_same_parent_evicts_the_earlier_one() {
        let mut pool = OrphanPool::new(20);
        let parent = BlockHash::all_zeros();
        let first = orphan_block(parent, 1);
        let first_hash = first.block_hash();
        let second = orphan_block(parent, 2);
        let second_hash = second.block_hash();

        pool.insert(first_hash, wrap(first));
        let displaced = pool.insert(second_hash, wrap(second));

        assert_eq!(displaced, Some(first_hash));
        assert!(!pool.contains(&first_hash));
        assert!(pool.contains(&second_hash));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn full_pool_evicts_before_accepting_a_new_orphan() {
        let mut pool = OrphanPool::new(1);
        let first = orphan_block(BlockHash::all_zeros(), 1);
        let first_hash = first.block_hash();
        pool.insert(first_hash, wrap(first));

        let other_parent_bytes = [7u8; 32];
        let other_parent = BlockHash::from_byte_array(other_parent_bytes);
        let second = orphan_block(other_parent, 2);
        let second_hash = second.block_hash();
        let displaced = pool.insert(second_hash, wrap(second));

        assert_eq!(displaced, Some(first_hash));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn take_waiting_on_removes_and_returns_the_orphan() {
        let mut pool = OrphanPool::new(20);
        let parent = BlockHash::all_zeros();
        let block = orphan_block(parent, 1);
        let hash = block.block_hash();
        pool.insert(hash, wrap(block));

        let taken = pool.take_waiting_on(&parent);
        assert!(taken.is_some());
        assert!(pool.is_empty());
    }
}
