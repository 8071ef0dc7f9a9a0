//! Signature and public key validation, and the three signature-check
//! opcodes (`OP_CHECKSIG`, `OP_CHECKDATASIG`, `OP_CHECKMULTISIG`) built on
//! top of them.

use bitcoin::Amount;
use secp256k1::ecdsa;
use secp256k1::schnorr;
use secp256k1::{Message, PublicKey, SECP256K1};
use sha2::{Digest, Sha256};

use crate::error::ScriptError;
use crate::flags::VerifyFlags;
use crate::interpreter::sighash::{self, SighashContext};
use crate::script::Script;

/// The result of validating and checking a signature: whether it passed,
/// separated from the "was this encoding even acceptable" error path so
/// that a deliberately-empty signature can cleanly mean "false" rather
/// than an error.
pub type SigResult = Result<bool, ScriptError>;

/// Validate a DER-or-Schnorr-plus-hashtype signature's encoding against the
/// active flags. An empty signature is always accepted here (the caller
/// treats it as an automatic `false` result, per consensus).
pub fn check_signature_encoding(sig: &[u8], flags: VerifyFlags) -> Result<(), ScriptError> {
    if sig.is_empty() {
        return Ok(());
    }
    let (raw_sig, hash_type) = sig.split_at(sig.len() - 1);
    let hash_type = hash_type[0];

    if flags.intersects(VerifyFlags::SIGHASH_FORKID) {
        if hash_type & sighash::SIGHASH_FORKID == 0 {
            return Err(ScriptError::MustUseForkId);
        }
    } else if hash_type & sighash::SIGHASH_FORKID != 0 {
        return Err(ScriptError::IllegalForkId);
    }

    if flags.intersects(VerifyFlags::STRICTENC) {
        let base = hash_type & !(sighash::SIGHASH_ANYONECANPAY | sighash::SIGHASH_FORKID);
        if !(sighash::SIGHASH_ALL..=sighash::SIGHASH_SINGLE).contains(&base) {
            return Err(ScriptError::SigHashType);
        }
    }

    match raw_sig.len() {
        64 if flags.intersects(VerifyFlags::SCHNORR) => Ok(()),
        _ if flags.intersects(VerifyFlags::DERSIG | VerifyFlags::STRICTENC) => {
            check_der_encoding(raw_sig, flags)
        }
        _ => Ok(()),
    }
}

fn check_der_encoding(sig: &[u8], flags: VerifyFlags) -> Result<(), ScriptError> {
    let parsed = ecdsa::Signature::from_der(sig).map_err(|_| ScriptError::SigDer)?;
    if flags.intersects(VerifyFlags::LOW_S) {
        let mut normalized = parsed;
        normalized.normalize_s();
        if normalized.serialize_compact() != parsed.serialize_compact() {
            return Err(ScriptError::SigHighS);
        }
    }
    Ok(())
}

/// Validate a public key's encoding against the active flags.
pub fn check_pubkey_encoding(pubkey: &[u8], flags: VerifyFlags) -> Result<(), ScriptError> {
    let is_compressed = pubkey.len() == 33 && (pubkey[0] == 0x02 || pubkey[0] == 0x03);
    let is_uncompressed = pubkey.len() == 65 && pubkey[0] == 0x04;

    if flags.intersects(VerifyFlags::COMPRESSED_PUBKEYTYPE) && !is_compressed {
        return Err(ScriptError::NonCompressedPubkey);
    }
    if flags.intersects(VerifyFlags::STRICTENC) && !(is_compressed || is_uncompressed) {
        return Err(ScriptError::PubkeyType);
    }
    Ok(())
}

fn parse_public_key(pubkey: &[u8]) -> Result<PublicKey, ScriptError> {
    PublicKey::from_slice(pubkey).map_err(|_| ScriptError::PubkeyType)
}

/// Verify a single `OP_CHECKSIG`-style signature over the spending
/// transaction. `sig` includes the trailing hash type byte; an empty `sig`
/// is a valid "I choose not to sign" input and returns `Ok(false)`.
pub fn check_tx_signature<C: SighashContext>(
    ctx: &C,
    input_index: usize,
    sig: &[u8],
    pubkey: &[u8],
    script_code: &Script,
    prev_value: Amount,
    flags: VerifyFlags,
) -> SigResult {
    check_signature_encoding(sig, flags)?;
    check_pubkey_encoding(pubkey, flags)?;
    if sig.is_empty() {
        return Ok(false);
    }

    let (raw_sig, hash_type) = sig.split_at(sig.len() - 1);
    let hash_type = hash_type[0];
    let digest = sighash::forkid_sighash(ctx, input_index, script_code, prev_value, hash_type)?;
    let message = Message::from_digest(digest);

    if raw_sig.len() == 64 && flags.intersects(VerifyFlags::SCHNORR) {
        let key = parse_public_key(pubkey)?;
        let (xonly, _parity) = key.x_only_public_key();
        let Ok(parsed) = schnorr::Signature::from_slice(raw_sig) else {
            return Err(ScriptError::SigBadLength);
        };
        Ok(SECP256K1.verify_schnorr(&parsed, &message, &xonly).is_ok())
    } else {
        let key = parse_public_key(pubkey)?;
        let Ok(parsed) = ecdsa::Signature::from_der(raw_sig) else {
            return Ok(false);
        };
        Ok(SECP256K1.verify_ecdsa(&message, &parsed, &key).is_ok())
    }
}

/// Verify an `OP_CHECKDATASIG`-style signature over an arbitrary message
/// (hashed with a single SHA256, unlike the double-SHA256 used for
/// transaction sighashes).
pub fn check_data_signature(sig: &[u8], msg: &[u8], pubkey: &[u8], flags: VerifyFlags) -> SigResult {
    check_pubkey_encoding(pubkey, flags)?;
    if sig.is_empty() {
        return Ok(false);
    }
    if !(sig.len() == 64 && flags.intersects(VerifyFlags::SCHNORR)) {
        // CHECKDATASIG carries no trailing hash type byte, so the only
        // encoding checks that apply are the plain DER/low-S ones.
        check_der_encoding(sig, flags)?;
    }

    let raw_sig = sig;
    let digest: [u8; 32] = Sha256::digest(msg).into();
    let message = Message::from_digest(digest);
    let key = parse_public_key(pubkey)?;

    if raw_sig.len() == 64 && flags.intersects(VerifyFlags::SCHNORR) {
        let (xonly, _parity) = key.x_only_public_key();
        let Ok(parsed) = schnorr::Signature::from_slice(raw_sig) else {
            return Err(ScriptError::SigBadLength);
        };
        Ok(SECP256K1.verify_schnorr(&parsed, &message, &xonly).is_ok())
    } else {
        let Ok(parsed) = ecdsa::Signature::from_der(raw_sig) else {
            return Ok(false);
        };
        Ok(SECP256K1.verify_ecdsa(&message, &parsed, &key).is_ok())
    }
}
