//! Fixture generators for interpreter tests.
//!
//! Mirrors the dummy-data generator style used throughout this lineage: a
//! free function per fixture kind, taking an explicit RNG so callers can
//! reproduce a failing case by fixing the seed.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use rand::RngCore;
use secp256k1::{Keypair, Secp256k1, SecretKey};

use crate::interpreter::sighash::SighashContext;
use crate::interpreter::TxContext;
use crate::script::Script;

/// A minimal [`TxContext`] implementation for tests: a transaction plus the
/// previous outputs each of its inputs spends.
pub struct FixedTxContext {
    tx: Transaction,
    prevouts: Vec<TxOut>,
}

impl FixedTxContext {
    /// Build a context from a transaction and the outputs it spends, one
    /// per input, in order.
    pub fn new(tx: Transaction, prevouts: Vec<TxOut>) -> Self {
        assert_eq!(tx.input.len(), prevouts.len());
        FixedTxContext { tx, prevouts }
    }
}

impl SighashContext for FixedTxContext {
    fn transaction(&self) -> &Transaction {
        &self.tx
    }

    fn prevout(&self, index: usize) -> Option<&TxOut> {
        self.prevouts.get(index)
    }
}

impl TxContext for FixedTxContext {
    fn lock_time(&self) -> u32 {
        self.tx.lock_time.to_consensus_u32()
    }

    fn input_sequence(&self, index: usize) -> u32 {
        self.tx.input[index].sequence.0
    }

    fn version(&self) -> i32 {
        self.tx.version.0
    }
}

/// Generate a random secp256k1 keypair.
pub fn keypair<R: RngCore + ?Sized>(rng: &mut R) -> Keypair {
    let secp = Secp256k1::new();
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    let secret = SecretKey::from_slice(&bytes).expect("32 random bytes are a valid secret key");
    Keypair::from_secret_key(&secp, &secret)
}

/// Build a one-input, one-output transaction spending `prevout` with
/// `script_sig`, paying an arbitrary output so the transaction is
/// well-formed.
pub fn spending_transaction(script_sig: Script) -> Transaction {
    Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::all_zeros(), 0),
            script_sig: bitcoin::ScriptBuf::from_bytes(script_sig.as_bytes().to_vec()),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(49_000),
            script_pubkey: bitcoin::ScriptBuf::new(),
        }],
    }
}

/// The previous output a [`spending_transaction`] fixture spends.
pub fn prevout(script_pubkey: Script, value: Amount) -> TxOut {
    TxOut {
        value,
        script_pubkey: bitcoin::ScriptBuf::from_bytes(script_pubkey.as_bytes().to_vec()),
    }
}
