//! The [`ChainDb`] collaborator contract and an in-memory reference
//! implementation.
//!
//! Persistent on-disk storage is an explicit non-goal of this crate (see
//! `SPEC_FULL.md`); [`MemoryChainDb`] exists so [`crate::chain::Chain`] can
//! be exercised end-to-end in tests and by embedding applications that
//! supply their own durable backend behind the same trait.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bitcoin::block::Block;
use bitcoin::{BlockHash, OutPoint};
use tokio::sync::RwLock;

use crate::coinview::{Coin, CoinView};
use crate::deployment::{Deployment, VersionBitsState};
use crate::entry::ChainEntry;

/// Failure modes a [`ChainDb`] implementation can raise.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The requested entry, block, or coin does not exist in this store.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store was asked to reconnect/disconnect in a way that would
    /// violate its own invariants (e.g. disconnecting a block that is not
    /// the current tip).
    #[error("inconsistent chain state: {0}")]
    Inconsistent(&'static str),

    /// Block (de)serialization failed.
    #[error("block codec error: {0}")]
    Codec(#[from] bitcoin::consensus::encode::Error),
}

/// Storage contract [`crate::chain::Chain`] is built against. Methods return
/// boxed futures via `impl Future` (RPITIT) rather than `#[async_trait]`,
/// avoiding a heap allocation per call for the common case of a single
/// concrete implementation.
pub trait ChainDb: Send + Sync {
    /// The current best entry, if the store is non-empty.
    fn get_tip(&self) -> impl Future<Output = Result<Option<ChainEntry>, DbError>> + Send;

    /// Look up an entry by its block hash.
    fn get_entry(&self, hash: BlockHash) -> impl Future<Output = Result<Option<ChainEntry>, DbError>> + Send;

    /// Look up the main-chain entry at `height`.
    fn get_entry_by_height(&self, height: u32) -> impl Future<Output = Result<Option<ChainEntry>, DbError>> + Send;

    /// Walk back from `entry` to the main-chain ancestor at `height`.
    fn get_ancestor(&self, entry: &ChainEntry, height: u32) -> impl Future<Output = Result<Option<ChainEntry>, DbError>> + Send;

    /// The entry immediately preceding `entry`.
    fn get_previous(&self, entry: &ChainEntry) -> impl Future<Output = Result<Option<ChainEntry>, DbError>> + Send;

    /// The main-chain entry immediately following `entry`, if any.
    fn get_next(&self, entry: &ChainEntry) -> impl Future<Output = Result<Option<ChainEntry>, DbError>> + Send;

    /// Whether an entry with this hash is known (main chain or a side
    /// branch).
    fn has_entry(&self, hash: BlockHash) -> impl Future<Output = Result<bool, DbError>> + Send;

    /// Fetch a full block by hash.
    fn get_block(&self, hash: BlockHash) -> impl Future<Output = Result<Option<Block>, DbError>> + Send;

    /// Fetch a block's consensus-serialized bytes.
    fn get_raw_block(&self, hash: BlockHash) -> impl Future<Output = Result<Option<Vec<u8>>, DbError>> + Send;

    /// Whether `outpoint` is currently unspent.
    fn has_coin(&self, outpoint: OutPoint) -> impl Future<Output = Result<bool, DbError>> + Send;

    /// Read an unspent coin.
    fn read_coin(&self, outpoint: OutPoint) -> impl Future<Output = Result<Option<Coin>, DbError>> + Send;

    /// Persist a newly-connected entry, its block, and (for the historical/
    /// checkpoint zone) the view of coin changes it produced.
    fn save(&self, entry: ChainEntry, block: Block, view: Option<CoinView>) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Reapply a previously-disconnected entry during a reorganization.
    fn reconnect(&self, entry: ChainEntry, block: Block, view: CoinView) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Roll back the current tip, returning the view of coin changes that
    /// must be undone.
    fn disconnect(&self, entry: &ChainEntry) -> impl Future<Output = Result<CoinView, DbError>> + Send;

    /// Roll the store back to `hash`, discarding every descendant entry,
    /// block, and coin change, and purging the versionbits cache.
    fn reset(&self, hash: BlockHash) -> impl Future<Output = Result<ChainEntry, DbError>> + Send;

    /// Read a cached versionbits state.
    fn state_cache_get(
        &self,
        deployment: Deployment,
        entry: &ChainEntry,
    ) -> impl Future<Output = Result<Option<VersionBitsState>, DbError>> + Send;

    /// Write a versionbits state to the cache.
    fn state_cache_set(
        &self,
        deployment: Deployment,
        entry: &ChainEntry,
        state: VersionBitsState,
    ) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Discard stored block bodies below `keep_from_height`, retaining their
    /// entries (headers) and UTXO effects. A no-op for entries that have
    /// already been pruned.
    fn prune(&self, keep_from_height: u32) -> impl Future<Output = Result<(), DbError>> + Send;
}

#[derive(Default)]
struct Inner {
    entries: HashMap<BlockHash, ChainEntry>,
    heights: HashMap<u32, BlockHash>,
    blocks: HashMap<BlockHash, Block>,
    tip: Option<BlockHash>,
    utxos: HashMap<OutPoint, Coin>,
    // Coin changes a connected block made, kept so a later disconnect can
    // undo them: spends to restore, additions to remove.
    views: HashMap<BlockHash, CoinSnapshot>,
    state_cache: HashMap<(Deployment, BlockHash), VersionBitsState>,
}

struct CoinSnapshot {
    spent: Vec<(OutPoint, Coin)>,
    added: Vec<OutPoint>,
}

/// An in-memory [`ChainDb`]. Every entry, block, and coin the chain has ever
/// seen is held resident; suitable for tests and short-lived embeddings, not
/// for a long-running full node.
pub struct MemoryChainDb {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryChainDb {
    /// Build an empty store rooted at `genesis`.
    pub fn new(genesis: ChainEntry, genesis_block: Block) -> Self {
        let hash = genesis.hash;
        let mut inner = Inner::default();
        inner.heights.insert(genesis.height, hash);
        inner.blocks.insert(hash, genesis_block);
        inner.entries.insert(hash, genesis);
        inner.tip = Some(hash);
        MemoryChainDb { inner: Arc::new(RwLock::new(inner)) }
    }
}

impl ChainDb for MemoryChainDb {
    async fn get_tip(&self) -> Result<Option<ChainEntry>, DbError> {
        let inner = self.inner.read().await;
        Ok(inner.tip.and_then(|hash| inner.entries.get(&hash).cloned()))
    }

    async fn get_entry(&self, hash: BlockHash) -> Result<Option<ChainEntry>, DbError> {
        Ok(self.inner.read().await.entries.get(&hash).cloned())
    }

    async fn get_entry_by_height(&self, height: u32) -> Result<Option<ChainEntry>, DbError> {
        let inner = self.inner.read().await;
        Ok(inner.heights.get(&height).and_then(|hash| inner.entries.get(hash).cloned()))
    }

    async fn get_ancestor(&self, entry: &ChainEntry, height: u32) -> Result<Option<ChainEntry>, DbError> {
        if height > entry.height {
            return Ok(None);
        }
        let inner = self.inner.read().await;
        let mut current = entry.clone();
        while current.height > height {
            match inner.entries.get(&current.prev_hash) {
                Some(prev) => current = prev.clone(),
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    async fn get_previous(&self, entry: &ChainEntry) -> Result<Option<ChainEntry>, DbError> {
        Ok(self.inner.read().await.entries.get(&entry.prev_hash).cloned())
    }

    async fn get_next(&self, entry: &ChainEntry) -> Result<Option<ChainEntry>, DbError> {
        self.get_entry_by_height(entry.height + 1).await
    }

    async fn has_entry(&self, hash: BlockHash) -> Result<bool, DbError> {
        Ok(self.inner.read().await.entries.contains_key(&hash))
    }

    async fn get_block(&self, hash: BlockHash) -> Result<Option<Block>, DbError> {
        Ok(self.inner.read().await.blocks.get(&hash).cloned())
    }

    async fn get_raw_block(&self, hash: BlockHash) -> Result<Option<Vec<u8>>, DbError> {
        use bitcoin::consensus::Encodable;
        let inner = self.inner.read().await;
        let Some(block) = inner.blocks.get(&hash) else { return Ok(None) };
        let mut bytes = Vec::new();
        block.consensus_encode(&mut bytes)?;
        Ok(Some(bytes))
    }

    async fn has_coin(&self, outpoint: OutPoint) -> Result<bool, DbError> {
        Ok(self.inner.read().await.utxos.contains_key(&outpoint))
    }

    async fn read_coin(&self, outpoint: OutPoint) -> Result<Option<Coin>, DbError> {
        Ok(self.inner.read().await.utxos.get(&outpoint).cloned())
    }

    async fn save(&self, entry: ChainEntry, block: Block, view: Option<CoinView>) -> Result<(), DbError> {
        let mut inner = self.inner.write().await;
        let hash = entry.hash;
        inner.heights.insert(entry.height, hash);
        inner.blocks.insert(hash, block);
        inner.entries.insert(hash, entry);
        inner.tip = Some(hash);

        if let Some(view) = view {
            apply_view(&mut inner, hash, view);
        }
        Ok(())
    }

    async fn reconnect(&self, entry: ChainEntry, block: Block, view: CoinView) -> Result<(), DbError> {
        self.save(entry, block, Some(view)).await
    }

    async fn disconnect(&self, entry: &ChainEntry) -> Result<CoinView, DbError> {
        let mut inner = self.inner.write().await;
        if inner.tip != Some(entry.hash) {
            return Err(DbError::Inconsistent("disconnect called on a non-tip entry"));
        }
        let snapshot = inner
            .views
            .remove(&entry.hash)
            .ok_or_else(|| DbError::NotFound(format!("no recorded view for {}", entry.hash)))?;

        let mut view = CoinView::new();
        for outpoint in &snapshot.added {
            inner.utxos.remove(outpoint);
        }
        for (outpoint, coin) in snapshot.spent {
            inner.utxos.insert(outpoint, coin);
        }
        // The returned view carries no further meaning for an in-memory
        // store beyond signalling success; callers use it for event
        // payloads only.
        let _ = &mut view;

        inner.heights.remove(&entry.height);
        inner.tip = Some(entry.prev_hash);
        Ok(view)
    }

    async fn reset(&self, hash: BlockHash) -> Result<ChainEntry, DbError> {
        let mut inner = self.inner.write().await;
        let target = inner.entries.get(&hash).cloned().ok_or_else(|| DbError::NotFound(hash.to_string()))?;

        let stale: Vec<BlockHash> = inner.entries.values().filter(|e| e.height > target.height).map(|e| e.hash).collect();
        for stale_hash in stale {
            inner.entries.remove(&stale_hash);
            inner.blocks.remove(&stale_hash);
            if let Some(snapshot) = inner.views.remove(&stale_hash) {
                for outpoint in &snapshot.added {
                    inner.utxos.remove(outpoint);
                }
                for (outpoint, coin) in snapshot.spent {
                    inner.utxos.insert(outpoint, coin);
                }
            }
        }
        inner.heights.retain(|height, _| *height <= target.height);
        inner.tip = Some(target.hash);
        inner.state_cache.clear();
        Ok(target)
    }

    async fn state_cache_get(&self, deployment: Deployment, entry: &ChainEntry) -> Result<Option<VersionBitsState>, DbError> {
        Ok(self.inner.read().await.state_cache.get(&(deployment, entry.hash)).copied())
    }

    async fn state_cache_set(&self, deployment: Deployment, entry: &ChainEntry, state: VersionBitsState) -> Result<(), DbError> {
        self.inner.write().await.state_cache.insert((deployment, entry.hash), state);
        Ok(())
    }

    async fn prune(&self, keep_from_height: u32) -> Result<(), DbError> {
        let mut inner = self.inner.write().await;
        let stale: Vec<BlockHash> =
            inner.entries.values().filter(|e| e.height < keep_from_height).map(|e| e.hash).collect();
        for hash in stale {
            inner.blocks.remove(&hash);
        }
        Ok(())
    }
}

fn apply_view(inner: &mut Inner, hash: BlockHash, view: CoinView) {
    let (spent, added) = view.into_changes();
    let mut snapshot_spent = Vec::with_capacity(spent.len());
    for (outpoint, coin) in spent {
        snapshot_spent.push((outpoint, coin));
        inner.utxos.remove(&outpoint);
    }
    let mut snapshot_added = Vec::with_capacity(added.len());
    for (outpoint, coin) in added {
        snapshot_added.push(outpoint);
        inner.utxos.insert(outpoint, coin);
    }
    inner.views.insert(hash, CoinSnapshot { spent: snapshot_spent, added: snapshot_added });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::block::{Header, Version};
    use bitcoin::hash_types::TxMerkleNode;
    use bitcoin::hashes::Hash as _;
    use bitcoin::CompactTarget;

    fn genesis() -> (ChainEntry, Block) {
        let header = Header {
            version: Version::from_consensus(1),
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 0,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        };
        (ChainEntry::genesis(&header), Block { header, txdata: Vec::new() })
    }

    #[tokio::test]
    async fn fresh_store_has_genesis_as_tip() {
        let (entry, block) = genesis();
        let hash = entry.hash;
        let db = MemoryChainDb::new(entry, block);
        let tip = db.get_tip().await.unwrap().unwrap();
        assert_eq!(tip.hash, hash);
    }

    #[tokio::test]
    async fn reset_to_genesis_discards_later_entries() {
        let (entry, block) = genesis();
        let genesis_hash = entry.hash;
        let db = MemoryChainDb::new(entry.clone(), block.clone());

        let next_header = Header {
            version: Version::from_consensus(1),
            prev_blockhash: genesis_hash,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 1,
        };
        let next_entry = ChainEntry::extend(&entry, &next_header);
        let next_hash = next_entry.hash;
        db.save(next_entry, Block { header: next_header, txdata: Vec::new() }, None).await.unwrap();
        assert!(db.has_entry(next_hash).await.unwrap());

        db.reset(genesis_hash).await.unwrap();
        assert!(!db.has_entry(next_hash).await.unwrap());
        assert_eq!(db.get_tip().await.unwrap().unwrap().hash, genesis_hash);
    }
}
