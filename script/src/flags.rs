//! Verification flag bitmask.
//!
//! Flags gate which consensus rules are active for a given script
//! evaluation. The interpreter is otherwise stateless with respect to
//! network upgrades; callers (the `chain` crate's `DeploymentState`)
//! compute the correct mask for a given block height and pass it in.

use bitflags::bitflags;

bitflags! {
    /// Bitmask controlling which script verification rules are enforced.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VerifyFlags: u32 {
        /// Evaluate P2SH subscripts (BIP16).
        const P2SH = 1 << 0;
        /// Require strict DER + canonical pubkey encoding for signature checks.
        const STRICTENC = 1 << 1;
        /// Require strict DER encoding for ECDSA signatures (BIP66).
        const DERSIG = 1 << 2;
        /// Require a low S value in ECDSA signatures.
        const LOW_S = 1 << 3;
        /// Require `OP_CHECKMULTISIG`'s dummy element to be empty.
        const NULLDUMMY = 1 << 4;
        /// Require the scriptSig to contain push operations only.
        const SIGPUSHONLY = 1 << 5;
        /// Require all pushes to use their minimal encoding.
        const MINIMALDATA = 1 << 6;
        /// Reject unassigned NOP opcodes.
        const DISCOURAGE_UPGRADABLE_NOPS = 1 << 7;
        /// Require the final stack to contain exactly one element.
        const CLEANSTACK = 1 << 8;
        /// Enable `OP_CHECKLOCKTIMEVERIFY` (BIP65).
        const CHECKLOCKTIMEVERIFY = 1 << 9;
        /// Enable `OP_CHECKSEQUENCEVERIFY` (BIP112).
        const CHECKSEQUENCEVERIFY = 1 << 10;
        /// Require `OP_IF`/`OP_NOTIF` operands to be minimally encoded booleans.
        const MINIMALIF = 1 << 11;
        /// Require failed signature checks to have supplied an empty signature.
        const NULLFAIL = 1 << 12;
        /// Require public keys to use the compressed encoding.
        const COMPRESSED_PUBKEYTYPE = 1 << 13;
        /// Interpret the signature hash type's fork id bit (UAHF).
        const SIGHASH_FORKID = 1 << 14;
        /// Enable `OP_CHECKDATASIG`/`OP_CHECKDATASIGVERIFY`.
        const CHECKDATASIG = 1 << 15;
        /// Accept 64-byte Schnorr signatures in `OP_CHECKSIG`/`OP_CHECKDATASIG`.
        const SCHNORR = 1 << 16;
        /// Accept the bitfield-indexed Schnorr form of `OP_CHECKMULTISIG`.
        const SCHNORR_MULTISIG = 1 << 17;
        /// Disallow the P2SH "segwit recovery" exception.
        const DISALLOW_SEGWIT_RECOVERY = 1 << 18;
        /// Enforce a minimum scriptSig size relative to sigcheck count.
        const INPUT_SIGCHECKS = 1 << 19;
        /// Report the sigcheck count back to the caller instead of just pass/fail.
        const REPORT_SIGCHECKS = 1 << 20;
        /// Require zero sigchecks (used for some historical standardness rules).
        const ZERO_SIGOPS = 1 << 21;
        /// Verify the block header's proof of work.
        const VERIFY_POW = 1 << 22;
        /// Verify the full block body, not just the header.
        const VERIFY_BODY = 1 << 23;
    }
}

impl VerifyFlags {
    /// Flags a standardness-conscious relay node applies to mempool
    /// candidates.
    pub fn standard() -> Self {
        Self::P2SH
            | Self::STRICTENC
            | Self::DERSIG
            | Self::LOW_S
            | Self::NULLDUMMY
            | Self::SIGPUSHONLY
            | Self::MINIMALDATA
            | Self::DISCOURAGE_UPGRADABLE_NOPS
            | Self::CLEANSTACK
            | Self::CHECKLOCKTIMEVERIFY
            | Self::CHECKSEQUENCEVERIFY
            | Self::MINIMALIF
            | Self::NULLFAIL
            | Self::SIGHASH_FORKID
            | Self::CHECKDATASIG
            | Self::SCHNORR
            | Self::SCHNORR_MULTISIG
            | Self::INPUT_SIGCHECKS
    }

    /// The minimal set of flags every block must satisfy regardless of
    /// local relay policy.
    pub fn mandatory() -> Self {
        Self::P2SH | Self::STRICTENC | Self::SIGHASH_FORKID | Self::VERIFY_POW | Self::VERIFY_BODY
    }
}

impl Default for VerifyFlags {
    fn default() -> Self {
        Self::empty()
    }
}
