//! [`ChainEntry`]: one node in the block-header DAG rooted at genesis.

use bitcoin::block::Header;
use bitcoin::hashes::Hash as _;
use bitcoin::BlockHash;

use crate::u256::U256;

/// A validated block header plus the cumulative chainwork to reach it.
///
/// Entries form a DAG rooted at genesis; the main chain is the path from
/// genesis to the entry of greatest cumulative chainwork among entries that
/// extend the longest accepted prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    /// This entry's block hash.
    pub hash: BlockHash,
    /// The previous block's hash (all-zero for genesis).
    pub prev_hash: BlockHash,
    /// Height above genesis (genesis is 0).
    pub height: u32,
    /// Block header timestamp.
    pub time: u32,
    /// Compact-encoded PoW target.
    pub bits: u32,
    /// Block version field.
    pub version: i32,
    /// The merkle root committed to by this header.
    pub merkle_root: bitcoin::TxMerkleNode,
    /// Cumulative chainwork from genesis through this entry, inclusive.
    pub chainwork: u128,
}

impl ChainEntry {
    /// Build the genesis entry from its header.
    pub fn genesis(header: &Header) -> Self {
        ChainEntry {
            hash: header.block_hash(),
            prev_hash: BlockHash::all_zeros(),
            height: 0,
            time: header.time,
            bits: header.bits.to_consensus(),
            version: header.version.to_consensus(),
            merkle_root: header.merkle_root,
            chainwork: block_work(header.bits.to_consensus()),
        }
    }

    /// Build the entry that extends `prev` with `header`.
    ///
    /// Does not itself verify that `header.prev_blockhash == prev.hash`; the
    /// caller resolves prev-entry lookup and is expected to have already
    /// matched hashes before constructing this.
    pub fn extend(prev: &ChainEntry, header: &Header) -> Self {
        ChainEntry {
            hash: header.block_hash(),
            prev_hash: header.prev_blockhash,
            height: prev.height + 1,
            time: header.time,
            bits: header.bits.to_consensus(),
            version: header.version.to_consensus(),
            merkle_root: header.merkle_root,
            chainwork: prev.chainwork + block_work(header.bits.to_consensus()),
        }
    }
}

/// The proof-of-work contributed by a single block at compact target `bits`:
/// `2**256 / (target + 1)`, i.e. `(!target / (target + 1)) + 1`.
///
/// A compact target's significant bits land anywhere across the full 256
/// bits depending on its exponent byte, so the division runs over a real
/// 256-bit value ([`U256`]) rather than a truncated approximation; the
/// quotient itself is always small enough to fit `u128` for any target a
/// real retarget rule produces.
fn block_work(bits: u32) -> u128 {
    let target = compact_to_target(bits);
    if target.is_zero() {
        return 0;
    }
    let divisor = target.wrapping_add_one();
    if divisor.is_zero() {
        // target was all-ones; 2**256 / 2**256 == 1.
        return 1;
    }
    target.not().div(divisor).to_u128_saturating()
}

/// Decode a compact ("nBits") target encoding into a full 256-bit target.
///
/// `bits = mantissa (24 bits) | exponent << 24`; `target = mantissa *
/// 256**(exponent - 3)`. The sign bit (0x00800000 within the mantissa) marks
/// a negative target, which has no meaningful proof-of-work and is treated
/// as zero, matching the reference encoding's treatment of negative/overflow
/// targets.
pub(crate) fn compact_to_target(bits: u32) -> U256 {
    let exponent = (bits >> 24) as i32;
    let mantissa = bits & 0x007f_ffff;
    let is_negative = bits & 0x0080_0000 != 0;
    if is_negative || mantissa == 0 {
        return U256::ZERO;
    }

    let shift_bytes = exponent - 3;
    let mut bytes = [0u8; 32];
    let mantissa_bytes = mantissa.to_be_bytes();
    // mantissa occupies the low 3 bytes of its 4-byte big-endian form.
    let mantissa_be = &mantissa_bytes[1..4];

    if shift_bytes >= 0 && (shift_bytes as usize) + 3 <= 32 {
        let start = 32 - (shift_bytes as usize) - 3;
        bytes[start..start + 3].copy_from_slice(mantissa_be);
    } else if shift_bytes < 0 {
        let drop = (-shift_bytes) as usize;
        if drop < 3 {
            let start = 32 - (3 - drop);
            bytes[start..].copy_from_slice(&mantissa_be[drop..]);
        }
        // drop >= 3: mantissa shifted entirely out of range, target is 0.
    }
    // shift_bytes too large to fit in 32 bytes: saturate to the max target,
    // which never happens for any real retarget rule's output.

    let mut le = bytes;
    le.reverse();
    U256::from_le_bytes(le)
}

/// Encode a full 256-bit target back into the compact ("nBits") form,
/// inverting [`compact_to_target`].
pub(crate) fn target_to_compact(target: U256) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let mut be = target.to_le_bytes();
    be.reverse();
    let mut first_nonzero = 0;
    while first_nonzero < 32 && be[first_nonzero] == 0 {
        first_nonzero += 1;
    }
    if first_nonzero == 32 {
        return 0;
    }
    let significant = 32 - first_nonzero;
    let mut mantissa_bytes = [0u8; 3];
    let mut exponent = significant as i32;
    if significant >= 3 {
        mantissa_bytes.copy_from_slice(&be[first_nonzero..first_nonzero + 3]);
    } else {
        mantissa_bytes[3 - significant..].copy_from_slice(&be[first_nonzero..]);
    }
    // If the mantissa's top bit is set it would be read as a sign bit; shift
    // right one byte and bump the exponent to keep the value unsigned.
    if mantissa_bytes[0] & 0x80 != 0 {
        mantissa_bytes = [0, mantissa_bytes[0], mantissa_bytes[1]];
        exponent += 1;
    }
    let mantissa = u32::from_be_bytes([0, mantissa_bytes[0], mantissa_bytes[1], mantissa_bytes[2]]);
    ((exponent as u32) << 24) | mantissa
}

/// A chain locator: a condensed, strictly-decreasing-in-height set of block
/// hashes used to describe "what I have" to a peer without transmitting the
/// full history.
///
/// Contains the most recent ~10 hashes, then hashes spaced by doubling
/// strides, terminating at genesis -- giving O(log n) total entries.
pub fn build_locator(entries: &[ChainEntry]) -> Vec<BlockHash> {
    let mut locator = Vec::new();
    let mut step: usize = 1;
    let mut index = entries.len();
    let mut recent = 0;
    while index > 0 {
        index -= 1;
        locator.push(entries[index].hash);
        recent += 1;
        if recent >= 10 {
            step *= 2;
        }
        if index < step {
            if index > 0 {
                locator.push(entries[0].hash);
            }
            break;
        }
        index -= step.saturating_sub(1).min(index);
    }
    locator
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::block::Version;
    use bitcoin::hash_types::TxMerkleNode;
    use bitcoin::CompactTarget;

    fn header(prev: BlockHash, time: u32, bits: u32) -> Header {
        Header {
            version: Version::from_consensus(1),
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits: CompactTarget::from_consensus(bits),
            nonce: 0,
        }
    }

    #[test]
    fn chainwork_accumulates_monotonically() {
        let genesis_header = header(BlockHash::all_zeros(), 0, 0x1d00ffff);
        let genesis = ChainEntry::genesis(&genesis_header);
        let next_header = header(genesis.hash, 1, 0x1d00ffff);
        let next = ChainEntry::extend(&genesis, &next_header);
        assert!(next.chainwork > genesis.chainwork);
        assert_eq!(next.height, 1);
    }

    #[test]
    fn locator_contains_genesis_and_is_short() {
        let mut entries = Vec::new();
        let mut prev = ChainEntry::genesis(&header(BlockHash::all_zeros(), 0, 0x1d00ffff));
        entries.push(prev.clone());
        for h in 1..40u32 {
            let hdr = header(prev.hash, h, 0x1d00ffff);
            prev = ChainEntry::extend(&prev, &hdr);
            entries.push(prev.clone());
        }
        let locator = build_locator(&entries);
        assert!(locator.len() < entries.len());
        assert_eq!(*locator.last().unwrap(), entries[0].hash);
    }
}
