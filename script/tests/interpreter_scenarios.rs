//! End-to-end interpreter scenarios: a full scriptSig + scriptPubKey pair
//! evaluated against a real transaction context, rather than individual
//! opcode unit tests.

use bitcoin::Amount;
use rand::rngs::OsRng;
use script::flags::VerifyFlags;
use script::interpreter::sighash::{self, SighashContext};
use script::interpreter::{self, checksig};
use script::opcode::{ops, Opcode, PushStyle, OP_1};
use script::script::Script;
use script::testing::{keypair, prevout, spending_transaction, FixedTxContext};

fn p2pkh_output_script(pubkey_hash: [u8; 20]) -> Script {
    let ops_bytes = [
        vec![ops::OP_DUP, ops::OP_HASH160, 20],
        pubkey_hash.to_vec(),
        vec![ops::OP_EQUALVERIFY, ops::OP_CHECKSIG],
    ]
    .concat();
    Script::from_bytes(ops_bytes).unwrap()
}

fn hash160(data: &[u8]) -> [u8; 20] {
    use ripemd::Digest as _;
    use sha2::Digest as _;
    let sha = sha2::Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripemd::Ripemd160::digest(sha));
    out
}

#[test]
fn p2pkh_spend_succeeds_with_a_valid_signature() {
    let kp = keypair(&mut OsRng);
    let pubkey = kp.public_key().serialize().to_vec();
    let pkh = hash160(&pubkey);
    let output_script = p2pkh_output_script(pkh);

    let flags = VerifyFlags::STRICTENC | VerifyFlags::SIGHASH_FORKID | VerifyFlags::LOW_S | VerifyFlags::NULLFAIL;

    // Build an input script with a placeholder signature first so the
    // transaction (and therefore the sighash) is fully determined, then
    // replace the placeholder with a real signature over that digest.
    let prev_value = Amount::from_sat(50_000);
    let script_sig_template = Script::from_opcodes(&[
        Opcode::Push(vec![0; 64], PushStyle::Direct),
        Opcode::from_push(&pubkey),
    ])
    .unwrap();
    let tx = spending_transaction(script_sig_template);
    let ctx = FixedTxContext::new(tx.clone(), vec![prevout(output_script.clone(), prev_value)]);

    let hash_type = sighash::SIGHASH_ALL | sighash::SIGHASH_FORKID;
    let digest = sighash::forkid_sighash(&ctx, 0, &output_script, prev_value, hash_type).unwrap();
    let msg = secp256k1::Message::from_digest(digest);
    let sig = secp256k1::SECP256K1.sign_ecdsa_low_r(&msg, &kp.secret_key());
    let mut sig_bytes = sig.serialize_der().to_vec();
    sig_bytes.push(hash_type);

    let script_sig = Script::from_opcodes(&[Opcode::from_push(&sig_bytes), Opcode::from_push(&pubkey)]).unwrap();
    let ctx = FixedTxContext::new(tx, vec![prevout(output_script.clone(), prev_value)]);

    let result = interpreter::verify(&script_sig, &output_script, &ctx, 0, prev_value, flags);
    assert!(result.is_ok(), "{result:?}");
}

#[test]
fn p2pkh_spend_fails_with_a_bit_flipped_signature() {
    let kp = keypair(&mut OsRng);
    let pubkey = kp.public_key().serialize().to_vec();
    let pkh = hash160(&pubkey);
    let output_script = p2pkh_output_script(pkh);
    let prev_value = Amount::from_sat(50_000);

    let flags = VerifyFlags::STRICTENC | VerifyFlags::SIGHASH_FORKID | VerifyFlags::LOW_S | VerifyFlags::NULLFAIL;

    let script_sig_template =
        Script::from_opcodes(&[Opcode::Push(vec![0; 64], PushStyle::Direct), Opcode::from_push(&pubkey)]).unwrap();
    let tx = spending_transaction(script_sig_template);
    let ctx = FixedTxContext::new(tx.clone(), vec![prevout(output_script.clone(), prev_value)]);

    let hash_type = sighash::SIGHASH_ALL | sighash::SIGHASH_FORKID;
    let digest = sighash::forkid_sighash(&ctx, 0, &output_script, prev_value, hash_type).unwrap();
    let msg = secp256k1::Message::from_digest(digest);
    let sig = secp256k1::SECP256K1.sign_ecdsa_low_r(&msg, &kp.secret_key());
    let mut sig_bytes = sig.serialize_der().to_vec();
    sig_bytes[10] ^= 0xff;
    sig_bytes.push(hash_type);

    let script_sig = Script::from_opcodes(&[Opcode::from_push(&sig_bytes), Opcode::from_push(&pubkey)]).unwrap();
    let ctx = FixedTxContext::new(tx, vec![prevout(output_script.clone(), prev_value)]);

    let result = interpreter::verify(&script_sig, &output_script, &ctx, 0, prev_value, flags);
    assert!(result.is_err());
}

#[test]
fn bare_true_script_succeeds() {
    let output_script = Script::from_bytes(vec![OP_1 /* OP_TRUE */]).unwrap();
    let script_sig = Script::empty();
    let tx = spending_transaction(Script::empty());
    let ctx = FixedTxContext::new(tx, vec![prevout(Script::empty(), Amount::from_sat(1))]);

    let result = interpreter::verify(&script_sig, &output_script, &ctx, 0, Amount::from_sat(1), VerifyFlags::empty());
    assert!(result.is_ok());
}

#[test]
fn checkdatasig_validates_an_arbitrary_message() {
    let kp = keypair(&mut OsRng);
    let pubkey = kp.public_key().serialize().to_vec();
    let msg = b"arbitrary oracle message".to_vec();
    let digest: [u8; 32] = {
        use sha2::Digest as _;
        sha2::Sha256::digest(&msg).into()
    };
    let sig = secp256k1::SECP256K1
        .sign_ecdsa_low_r(&secp256k1::Message::from_digest(digest), &kp.secret_key())
        .serialize_der()
        .to_vec();

    let flags = VerifyFlags::CHECKDATASIG | VerifyFlags::STRICTENC;
    let ok = checksig::check_data_signature(&sig, &msg, &pubkey, flags).unwrap();
    assert!(ok);

    let mut tampered = msg.clone();
    tampered.push(0);
    let ok = checksig::check_data_signature(&sig, &tampered, &pubkey, flags).unwrap();
    assert!(!ok);
}
