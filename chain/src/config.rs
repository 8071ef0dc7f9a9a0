//! Network-specific consensus constants.
//!
//! [`DeploymentParams`] is a plain, `serde`-deserializable struct so an
//! embedding application can load a network preset from its own
//! configuration file the way the teacher lineage loads `config.toml` into
//! a typed `Settings` struct; [`NetworkParams`] bundles genesis data
//! alongside it.

use bitcoin::block::Header;
use bitcoin::hash_types::TxMerkleNode;
use bitcoin::hashes::Hash as _;
use bitcoin::{BlockHash, CompactTarget};
use serde::{Deserialize, Serialize};

/// The fixed constants [`crate::deployment::get_deployments`] and the
/// difficulty retargeter read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentParams {
    /// BIP16 (P2SH) activation time (median-time-past).
    pub bip16_time: u32,
    /// BIP34 (coinbase height commitment) activation height.
    pub bip34_height: u32,
    /// BIP66 (strict DER) activation height.
    pub bip66_height: u32,
    /// BIP65 (CHECKLOCKTIMEVERIFY) activation height.
    pub bip65_height: u32,
    /// CSV deployment BIP9 `startTime` (median-time-past).
    pub csv_start_time: u32,
    /// CSV deployment BIP9 `timeout` (median-time-past).
    pub csv_timeout: u32,
    /// UAHF (August 2017 fork: STRICTENC, SIGHASH_FORKID) activation
    /// height.
    pub uahf_height: u32,
    /// DAA (November 2017: new difficulty algorithm, LOW_S, NULLFAIL)
    /// activation height.
    pub daa_height: u32,
    /// Magnetic Anomaly (CHECKDATASIG, SIGPUSHONLY, CLEANSTACK, canonical
    /// tx ordering) activation height.
    pub magnetic_anomaly_height: u32,
    /// Great Wall activation height.
    pub great_wall_height: u32,
    /// Graviton (Schnorr multisig, MINIMALDATA) activation height.
    pub graviton_height: u32,
    /// Phonon (per-tx sigcheck accounting) activation height.
    pub phonon_height: u32,
    /// ASERT difficulty algorithm activation time (median-time-past).
    pub asert_activation_time: u32,
    /// Axion (coinbase-rule enforcement window opens) activation time.
    pub axion_activation_time: u32,
    /// Tachyon activation time.
    pub tachyon_activation_time: u32,
    /// Selectron activation time.
    pub selectron_activation_time: u32,
    /// Gluon activation time.
    pub gluon_activation_time: u32,
    /// Jefferson activation time.
    pub jefferson_activation_time: u32,
    /// Wellington (closes the coinbase-rule window, constrains tx.version)
    /// activation time.
    pub wellington_activation_time: u32,
    /// BIP9 versionbits window size, in blocks.
    pub miner_window: u32,
    /// BIP9 versionbits lock-in threshold, in blocks out of `miner_window`.
    pub rule_change_activation_threshold: u32,

    /// ASERT anchor block height.
    pub asert_ref_height: u32,
    /// ASERT anchor block's compact target.
    pub asert_ref_bits: u32,
    /// ASERT anchor block's ancestor (parent) timestamp.
    pub asert_ref_ancestor_time: u32,
    /// ASERT half-life, in seconds (172800 = 2 days for BCH mainnet).
    pub asert_half_life: u32,

    /// Legacy retarget: desired spacing between blocks, in seconds.
    pub pow_target_spacing: u32,
    /// Legacy retarget: desired span of the 2016-block retarget window, in
    /// seconds.
    pub pow_target_timespan: u32,
    /// Maximum permitted PoW target (minimum difficulty), compact-encoded.
    pub pow_limit_bits: u32,

    /// Maximum serialized block size before UAHF, in bytes.
    pub max_block_size_pre_uahf: u64,
    /// Maximum serialized block size after UAHF, in bytes.
    pub max_block_size_post_uahf: u64,

    /// Block subsidy at height 0, in satoshis.
    pub subsidy_initial_sat: u64,
    /// Number of blocks between subsidy halvings.
    pub subsidy_halving_interval: u32,
    /// Percentage of the coinbase output value that must go to a
    /// coinbase-rule ("miner fund") address once Axion is active and before
    /// Wellington closes the window.
    pub coinbase_rule_percent: u64,

    /// Bounded capacity of the orphan pool.
    pub max_orphans: usize,
    /// Bounded capacity of the invalid-hash LRU.
    pub invalid_set_capacity: usize,

    /// Block hashes that must match at their given height, keyed by height.
    pub checkpoints: Vec<(u32, BlockHash)>,
}

impl DeploymentParams {
    /// A small, internally-consistent parameter set for regtest-style
    /// tests: every feature activates at height/time 0 so individual
    /// behaviors can be exercised without constructing a long chain.
    pub fn regtest() -> Self {
        DeploymentParams {
            bip16_time: 0,
            bip34_height: 0,
            bip66_height: 0,
            bip65_height: 0,
            csv_start_time: 0,
            csv_timeout: u32::MAX,
            uahf_height: 0,
            daa_height: 0,
            magnetic_anomaly_height: 0,
            great_wall_height: 0,
            graviton_height: 0,
            phonon_height: 0,
            asert_activation_time: 0,
            axion_activation_time: 0,
            tachyon_activation_time: 0,
            selectron_activation_time: 0,
            gluon_activation_time: 0,
            jefferson_activation_time: 0,
            wellington_activation_time: 0,
            miner_window: 144,
            rule_change_activation_threshold: 108,
            asert_ref_height: 0,
            asert_ref_bits: 0x207f_ffff,
            asert_ref_ancestor_time: 0,
            asert_half_life: 172_800,
            pow_target_spacing: 600,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_limit_bits: 0x207f_ffff,
            max_block_size_pre_uahf: 2_000_000,
            max_block_size_post_uahf: 32_000_000,
            subsidy_initial_sat: 50_0000_0000,
            subsidy_halving_interval: 150,
            coinbase_rule_percent: 8,
            max_orphans: 20,
            invalid_set_capacity: 5000,
            checkpoints: Vec::new(),
        }
    }

    /// Mainnet-shaped parameter set. Activation heights are illustrative
    /// placeholders rather than the exact historical mainnet values, since
    /// this crate does not ship a specific network's genesis block.
    pub fn mainnet() -> Self {
        DeploymentParams {
            bip16_time: 1_333_238_400,
            bip34_height: 227_931,
            bip66_height: 363_725,
            bip65_height: 388_381,
            csv_start_time: 1_462_060_800,
            csv_timeout: 1_493_596_800,
            uahf_height: 478_559,
            daa_height: 504_031,
            magnetic_anomaly_height: 556_767,
            great_wall_height: 582_680,
            graviton_height: 610_680,
            phonon_height: 635_259,
            asert_activation_time: 1_605_441_600,
            axion_activation_time: 1_605_441_600,
            tachyon_activation_time: 1_621_310_400,
            selectron_activation_time: 1_636_934_400,
            gluon_activation_time: 1_652_616_000,
            jefferson_activation_time: 1_668_254_400,
            wellington_activation_time: 1_715_774_400,
            miner_window: 2016,
            rule_change_activation_threshold: 1512,
            asert_ref_height: 661_647,
            asert_ref_bits: 0x1804_2d85,
            asert_ref_ancestor_time: 1_605_447_844,
            asert_half_life: 172_800,
            pow_target_spacing: 600,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_limit_bits: 0x1d00_ffff,
            max_block_size_pre_uahf: 2_000_000,
            max_block_size_post_uahf: 32_000_000,
            subsidy_initial_sat: 50_0000_0000,
            subsidy_halving_interval: 210_000,
            coinbase_rule_percent: 8,
            max_orphans: 20,
            invalid_set_capacity: 5000,
            checkpoints: Vec::new(),
        }
    }

    /// Testnet-shaped parameter set, same activation schedule as mainnet
    /// but with a permissive `pow_limit_bits` as testnets conventionally
    /// use.
    pub fn testnet() -> Self {
        DeploymentParams { pow_limit_bits: 0x1d00_ffff, ..Self::mainnet() }
    }

    /// The block subsidy at `height`, halving every `subsidy_halving_interval`
    /// blocks down to zero.
    pub fn block_subsidy(&self, height: u32) -> u64 {
        let halvings = height / self.subsidy_halving_interval;
        if halvings >= 64 {
            0
        } else {
            self.subsidy_initial_sat >> halvings
        }
    }
}

/// Bundles [`DeploymentParams`] with the genesis block header the chain is
/// rooted at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkParams {
    /// Consensus-rule activation parameters.
    pub deployments: DeploymentParams,
    /// Serialized genesis header fields, stored rather than a `Header`
    /// directly so the struct stays trivially (de)serializable.
    pub genesis_version: i32,
    /// Genesis block timestamp.
    pub genesis_time: u32,
    /// Genesis block compact target.
    pub genesis_bits: u32,
    /// Genesis block nonce.
    pub genesis_nonce: u32,
    /// Genesis block merkle root.
    pub genesis_merkle_root: TxMerkleNode,
}

impl NetworkParams {
    /// Reconstruct the genesis [`Header`] from the stored fields.
    pub fn genesis_header(&self) -> Header {
        Header {
            version: bitcoin::block::Version::from_consensus(self.genesis_version),
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: self.genesis_merkle_root,
            time: self.genesis_time,
            bits: CompactTarget::from_consensus(self.genesis_bits),
            nonce: self.genesis_nonce,
        }
    }

    /// A regtest-style network: permissive deployment parameters plus an
    /// arbitrary, internally-consistent genesis header suitable for tests.
    pub fn regtest() -> Self {
        NetworkParams {
            deployments: DeploymentParams::regtest(),
            genesis_version: 1,
            genesis_time: 1_296_688_602,
            genesis_bits: 0x207f_ffff,
            genesis_nonce: 2,
            genesis_merkle_root: TxMerkleNode::all_zeros(),
        }
    }
}
