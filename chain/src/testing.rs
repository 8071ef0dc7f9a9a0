//! Fixture generators for chain-engine tests: building a valid-by-
//! construction header chain without going through full block verification,
//! so `Chain` tests can focus on the behavior under test.

use bitcoin::block::{Header, Version};
use bitcoin::hash_types::TxMerkleNode;
use bitcoin::hashes::Hash as _;
use bitcoin::{Block, BlockHash, CompactTarget};

use crate::entry::ChainEntry;

/// An easy, always-passing compact target, so fixture headers never need to
/// satisfy real proof-of-work.
pub const EASY_BITS: u32 = 0x207fffff;

/// Build a single header extending `prev` (all-zero for genesis) at `time`
/// with `nonce` distinguishing otherwise-identical headers.
pub fn header(prev: BlockHash, time: u32, nonce: u32) -> Header {
    Header {
        version: Version::from_consensus(1),
        prev_blockhash: prev,
        merkle_root: TxMerkleNode::all_zeros(),
        time,
        bits: CompactTarget::from_consensus(EASY_BITS),
        nonce,
    }
}

/// Build the genesis header/entry/block triple.
pub fn genesis() -> (Header, ChainEntry, Block) {
    let h = header(BlockHash::all_zeros(), 0, 0);
    let entry = ChainEntry::genesis(&h);
    let block = Block { header: h, txdata: Vec::new() };
    (h, entry, block)
}

/// Build a chain of `count` blocks extending genesis, one second apart,
/// returning the entries and blocks in height order (genesis first).
pub fn build_chain(count: u32) -> Vec<(ChainEntry, Block)> {
    let (_, genesis_entry, genesis_block) = genesis();
    let mut out = vec![(genesis_entry.clone(), genesis_block)];
    let mut prev = genesis_entry;
    for height in 1..=count {
        let h = header(prev.hash, height, height);
        let entry = ChainEntry::extend(&prev, &h);
        let block = Block { header: h, txdata: Vec::new() };
        out.push((entry.clone(), block));
        prev = entry;
    }
    out
}

/// Build a competing chain of `count` blocks that forks from `fork_point`
/// (an entry already in the caller's primary chain), using `branch_id` to
/// keep its headers distinct from the original chain's.
pub fn build_fork(fork_point: &ChainEntry, count: u32, branch_id: u32) -> Vec<(ChainEntry, Block)> {
    let mut out = Vec::new();
    let mut prev = fork_point.clone();
    for step in 1..=count {
        let h = header(prev.hash, prev.time + step, branch_id * 1000 + step);
        let entry = ChainEntry::extend(&prev, &h);
        let block = Block { header: h, txdata: Vec::new() };
        out.push((entry.clone(), block));
        prev = entry;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_chain_produces_increasing_heights_and_chainwork() {
        let chain = build_chain(5);
        assert_eq!(chain.len(), 6);
        for pair in chain.windows(2) {
            assert_eq!(pair[1].0.height, pair[0].0.height + 1);
            assert!(pair[1].0.chainwork > pair[0].0.chainwork);
        }
    }

    #[test]
    fn build_fork_diverges_from_the_named_fork_point() {
        let chain = build_chain(3);
        let fork_point = &chain[1].0;
        let fork = build_fork(fork_point, 2, 7);
        assert_eq!(fork[0].0.prev_hash, fork_point.hash);
        assert_ne!(fork[0].0.hash, chain[2].0.hash);
    }
}
