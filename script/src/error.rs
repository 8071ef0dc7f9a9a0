//! Error type returned by the script interpreter.

/// Every way a script evaluation can fail.
///
/// Each variant is a stable, testable identifier: callers match on these
/// rather than on the rendered message, so [`ScriptError`] derives
/// [`PartialEq`] and [`Eq`] in addition to the usual [`std::error::Error`]
/// machinery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    /// The serialized script exceeds the 10,000 byte consensus limit.
    #[error("script size {0} exceeds the maximum of {max}", max = crate::script::MAX_SCRIPT_SIZE)]
    ScriptSize(usize),

    /// A single push exceeds the 520 byte consensus limit.
    #[error("push of {0} bytes exceeds the maximum of 520")]
    PushSize(usize),

    /// More than 201 non-push opcodes were executed.
    #[error("executed opcode count {0} exceeds the maximum of 201")]
    OpCount(usize),

    /// The combined stack and altstack depth exceeded 1000 elements.
    #[error("combined stack depth {0} exceeds the maximum of 1000")]
    StackSize(usize),

    /// The script contains an opcode byte with no defined meaning, or a push
    /// whose declared length runs past the end of the script.
    #[error("script contains an undecodable opcode")]
    BadOpcode,

    /// The opcode is disabled under the active flags (e.g. the historical
    /// string-splicing opcodes without `OP_CAT`'s 2022 re-enable).
    #[error("opcode is disabled")]
    DisabledOpcode,

    /// `MINIMALDATA` is set and a push did not use the shortest encoding.
    #[error("push does not use the minimal encoding required by MINIMALDATA")]
    MinimalData,

    /// `MINIMALIF` is set and `OP_IF`/`OP_NOTIF` was given a non-minimal
    /// boolean.
    #[error("OP_IF/OP_NOTIF operand is not minimally encoded")]
    MinimalIf,

    /// `OP_VERIFY` (or an implicit `*VERIFY` opcode) popped a false value.
    #[error("OP_VERIFY failed")]
    Verify,

    /// `OP_EQUALVERIFY` popped two byte strings that were not equal.
    #[error("OP_EQUALVERIFY failed")]
    EqualVerify,

    /// `OP_NUMEQUALVERIFY` popped two numbers that were not equal.
    #[error("OP_NUMEQUALVERIFY failed")]
    NumEqualVerify,

    /// `OP_CHECKSIGVERIFY` popped a failed signature check.
    #[error("OP_CHECKSIGVERIFY failed")]
    CheckSigVerify,

    /// `OP_CHECKDATASIGVERIFY` popped a failed signature check.
    #[error("OP_CHECKDATASIGVERIFY failed")]
    CheckDataSigVerify,

    /// `OP_CHECKMULTISIGVERIFY` popped a failed signature check.
    #[error("OP_CHECKMULTISIGVERIFY failed")]
    CheckMultisigVerify,

    /// An `OP_ELSE`/`OP_ENDIF` appeared without a matching `OP_IF`/`OP_NOTIF`,
    /// or the script ended with an open conditional.
    #[error("unbalanced OP_IF/OP_NOTIF/OP_ELSE/OP_ENDIF")]
    UnbalancedConditional,

    /// An opcode needed more stack elements than were present.
    #[error("invalid stack operation: not enough elements")]
    InvalidStackOperation,

    /// An opcode needed more altstack elements than were present.
    #[error("invalid altstack operation: not enough elements")]
    InvalidAltstackOperation,

    /// `OP_CHECKLOCKTIMEVERIFY`/`OP_CHECKSEQUENCEVERIFY` was given a negative
    /// operand.
    #[error("locktime operand is negative")]
    NegativeLocktime,

    /// The transaction's actual locktime/sequence does not satisfy the
    /// operand given to `OP_CHECKLOCKTIMEVERIFY`/`OP_CHECKSEQUENCEVERIFY`.
    #[error("unsatisfied locktime or sequence number")]
    UnsatisfiedLocktime,

    /// An upgradable NOP was executed while `DISCOURAGE_UPGRADABLE_NOPS` is
    /// set.
    #[error("upgradable NOP executed while discouraged")]
    DiscourageUpgradableNops,

    /// `OP_DIV` with a zero divisor.
    #[error("division by zero")]
    DivByZero,

    /// `OP_MOD` with a zero divisor.
    #[error("modulo by zero")]
    ModByZero,

    /// `OP_SPLIT` position fell outside `[0, len]`.
    #[error("split position {0} is out of range for a {1} byte string")]
    InvalidSplitRange(i64, usize),

    /// `OP_AND`/`OP_OR`/`OP_XOR` operands had different lengths.
    #[error("bitwise operands have mismatched lengths: {0} vs {1}")]
    InvalidOperandSize(usize, usize),

    /// `OP_NUM2BIN`'s minimal encoding of the source number does not fit in
    /// the requested target size.
    #[error("number cannot be represented in {0} bytes")]
    ImpossibleEncoding(usize),

    /// A `ScriptNum` operand was out of the required size bound, or was not
    /// minimally encoded while minimal encoding was required.
    #[error("number is not in the valid range for this operation")]
    InvalidNumberRange,

    /// `STRICTENC`/`COMPRESSED_PUBKEYTYPE` rejected an uncompressed or
    /// otherwise non-canonical public key.
    #[error("public key is not a valid type under the active flags")]
    PubkeyType,

    /// `COMPRESSED_PUBKEYTYPE` rejected an uncompressed public key.
    #[error("public key must be compressed")]
    NonCompressedPubkey,

    /// `DERSIG`/`STRICTENC` rejected a signature with invalid DER encoding.
    #[error("signature is not valid DER")]
    SigDer,

    /// `LOW_S` rejected a signature with a high S value.
    #[error("signature has a high S value")]
    SigHighS,

    /// `STRICTENC` rejected a signature with an invalid hash type byte.
    #[error("signature has an invalid hash type byte")]
    SigHashType,

    /// A signature had an implausible length for its claimed scheme.
    #[error("signature has an invalid length")]
    SigBadLength,

    /// `SCHNORR`/`SCHNORR_MULTISIG` expects a 64-byte Schnorr signature and
    /// found something else.
    #[error("signature does not use the Schnorr encoding")]
    SigNonSchnorr,

    /// `SIGPUSHONLY` rejected an input script containing a non-push opcode.
    #[error("signature script contains a non-push opcode")]
    SigPushOnly,

    /// A signature used the `SIGHASH_FORKID` bit while `SIGHASH_FORKID` is
    /// not an active flag.
    #[error("signature illegally sets the fork id bit")]
    IllegalForkId,

    /// `SIGHASH_FORKID` is active and a signature did not set the fork id
    /// bit.
    #[error("signature must set the fork id bit")]
    MustUseForkId,

    /// `NULLFAIL` rejected a non-empty signature on a failed check.
    #[error("signature check failed with a non-empty signature under NULLFAIL")]
    NullFail,

    /// `OP_CHECKMULTISIG`'s key count operand was out of `[0, 20]`.
    #[error("public key count {0} is out of range")]
    PubkeyCount(i64),

    /// `OP_CHECKMULTISIG`'s signature count operand exceeded the key count.
    #[error("signature count {0} is out of range")]
    SigCount(i64),

    /// The Schnorr-multisig bitfield's byte length did not match
    /// `ceil(nKeys / 8)`.
    #[error("multisig bitfield has the wrong size: {actual} bytes, expected {expected}")]
    InvalidBitfieldSize {
        /// The bitfield's actual length in bytes.
        actual: usize,
        /// The required length, `ceil(nKeys / 8)`.
        expected: usize,
    },

    /// Reserved for a future bitfield size check; currently unused but kept
    /// as a distinct identifier from [`ScriptError::InvalidBitfieldSize`] to
    /// match the upstream taxonomy.
    #[error("multisig bitfield size error")]
    BitfieldSize,

    /// A bit outside `[0, nKeys)` was set in the multisig bitfield.
    #[error("multisig bitfield sets a bit outside the valid key range")]
    BitRange,

    /// The multisig bitfield's popcount did not equal the signature count.
    #[error("multisig bitfield selects {actual} keys, expected {expected}")]
    InvalidBitCount {
        /// Number of bits actually set.
        actual: u32,
        /// Number of signatures supplied.
        expected: u32,
    },

    /// A signature in the Schnorr-multisig bitfield path could not be
    /// aligned with its selected key.
    #[error("multisig bitfield selection could not be aligned with the supplied signatures")]
    InvalidBitRange,

    /// `CLEANSTACK` requires the stack to hold exactly one element after a
    /// successful P2SH evaluation.
    #[error("stack is not clean after script evaluation")]
    CleanStack,

    /// The script evaluated successfully but left a false value on top of
    /// the stack (or an empty stack).
    #[error("script evaluated to false")]
    EvalFalse,

    /// `OP_RETURN` was executed.
    #[error("OP_RETURN encountered")]
    OpReturn,

    /// `INPUT_SIGCHECKS` rejected an input script that is too small for the
    /// number of signature checks it performs.
    #[error("input script is too small for its sigcheck count")]
    InputSigChecks,

    /// A condition that does not correspond to a named consensus rule;
    /// retained so that a from-upstream error with no mapped variant still
    /// produces a typed value instead of panicking.
    #[error("unknown script error: {0}")]
    UnknownError(String),
}
