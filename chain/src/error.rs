//! Top-level error type for the chain engine.

use bitcoin::BlockHash;

/// Broad classification of a [`VerifyError`], mirroring the categories a
/// peer-ban-score policy would key off of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifyErrorKind {
    /// The block or transaction is consensus-invalid; the hash should be
    /// remembered so it is never revalidated.
    Invalid,
    /// The block was valid under rules that are no longer active (e.g. it
    /// arrived after a checkpoint made an alternate history moot).
    Obsolete,
    /// The block conflicts with a known checkpoint hash at its height.
    Checkpoint,
    /// The block or header could not be decoded or is structurally
    /// malformed.
    Malformed,
    /// The block is a byte-for-byte duplicate of one already known.
    Duplicate,
}

/// A contextual block/transaction validation failure.
///
/// `malleated` marks failures that a different but equally-hashing encoding
/// of the same logical block might avoid (e.g. a witness malleability bug) --
/// these must NOT cause the hash to be placed in the invalid set, since a
/// corrected re-announcement of the same block could still be valid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {reason} (score {score})")]
pub struct VerifyError {
    /// Broad failure category.
    pub kind: VerifyErrorKind,
    /// Stable, machine-matchable reason identifier (e.g.
    /// `"bad-txns-inputs-missingorspent"`), following the `bad-*` naming
    /// convention of the reference consensus rules.
    pub reason: &'static str,
    /// Suggested peer ban score contribution, 0..=100.
    pub score: u8,
    /// Whether this failure could be an artifact of malleated encoding
    /// rather than a genuine consensus violation.
    pub malleated: bool,
}

impl VerifyError {
    /// Build a non-malleated, fully-invalid verify error.
    pub fn invalid(reason: &'static str, score: u8) -> Self {
        VerifyError { kind: VerifyErrorKind::Invalid, reason, score, malleated: false }
    }

    /// Build a malformed-structure verify error.
    pub fn malformed(reason: &'static str) -> Self {
        VerifyError { kind: VerifyErrorKind::Malformed, reason, score: 100, malleated: false }
    }

    /// Build a duplicate-block verify error.
    pub fn duplicate(reason: &'static str) -> Self {
        VerifyError { kind: VerifyErrorKind::Duplicate, reason, score: 0, malleated: false }
    }

    /// Build a checkpoint-mismatch verify error.
    pub fn checkpoint(reason: &'static str) -> Self {
        VerifyError { kind: VerifyErrorKind::Checkpoint, reason, score: 100, malleated: false }
    }

    /// Build an obsolete-chain verify error.
    pub fn obsolete(reason: &'static str) -> Self {
        VerifyError { kind: VerifyErrorKind::Obsolete, reason, score: 0, malleated: false }
    }
}

/// Top-level chain engine error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transaction input's script failed interpreter verification.
    #[error("script verification failed for input {index} of {txid}: {source}")]
    ScriptVerify {
        /// The failing input's index within its transaction.
        index: usize,
        /// The transaction containing the failing input.
        txid: bitcoin::Txid,
        /// The underlying interpreter error.
        #[source]
        source: script::ScriptError,
    },

    /// Contextual block or transaction validation failed.
    #[error("block verification failed: {0}")]
    Verify(#[from] VerifyError),

    /// The persistent or in-memory chain store raised an error.
    #[error("chain database error: {0}")]
    Db(#[from] crate::db::DbError),

    /// `add` was called with a block whose previous hash names an entry not
    /// present in the database and not already pending as an orphan.
    #[error("block {0} could not be connected: previous block unknown")]
    UnknownPrevious(BlockHash),

    /// The orphan pool rejected a block because it was already full and the
    /// new arrival did not displace an existing entry.
    #[error("orphan pool is full")]
    OrphanPoolFull,

    /// A reorganization failed partway through reconnecting the new best
    /// chain; the chain has been left at the fork point rather than the
    /// attempted new tip.
    #[error("reorganization to {new_tip} failed while reconnecting {failed_at}: {source}")]
    ReorganizeFailed {
        /// The tip the reorganization was attempting to reach.
        new_tip: BlockHash,
        /// The block whose reconnection failed.
        failed_at: BlockHash,
        /// The underlying verification failure.
        #[source]
        source: VerifyError,
    },

    /// A worker-pool script verification task failed to run to completion
    /// (panicked or was cancelled), distinct from the script itself failing
    /// verification.
    #[error("mandatory-script-verify-flag-failed")]
    WorkerFailed,
}
