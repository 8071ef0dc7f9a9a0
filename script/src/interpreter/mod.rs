//! The script execution engine.
//!
//! [`Interpreter::execute`] runs a single script against a stack;
//! [`Interpreter::verify`] is the top-level entry point a transaction input
//! validator calls, combining scriptSig and scriptPubKey execution with the
//! P2SH and segwit-recovery special cases.

pub mod checksig;
pub mod sighash;

use bitcoin::Amount;

use crate::error::ScriptError;
use crate::flags::VerifyFlags;
use crate::num::{ScriptNum, DEFAULT_MAX_NUM_SIZE, LOCKTIME_MAX_NUM_SIZE};
use crate::opcode::{ops, Opcode};
use crate::script::Script;
use crate::stack::{cast_to_bool, Stack};

pub use sighash::SighashContext;

const MAX_OPS_PER_SCRIPT: usize = 201;

/// Everything about the spending transaction the interpreter needs beyond
/// the two scripts themselves: locktime/sequence checks and signature
/// hashing both read from the transaction context.
pub trait TxContext: SighashContext {
    /// nLockTime of the spending transaction.
    fn lock_time(&self) -> u32;
    /// nSequence of the input currently being verified.
    fn input_sequence(&self, index: usize) -> u32;
    /// nVersion of the spending transaction.
    fn version(&self) -> i32;
}

/// Per-call interpreter state: the running sigcheck count for this
/// verification. Threaded through explicitly rather than held on a
/// module-level counter, so concurrent verifications never contaminate
/// each other (see the open question in `SPEC_FULL.md` about the
/// reference implementation's global counter).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SigCheckCount(pub u32);

struct ExecState {
    stack: Stack,
    altstack: Stack,
    conditional: Vec<bool>,
    negate_depth: u32,
    op_count: usize,
    last_code_separator: usize,
    sig_checks: u32,
}

impl ExecState {
    fn new(stack: Stack) -> Self {
        ExecState {
            stack,
            altstack: Stack::new(),
            conditional: Vec::new(),
            negate_depth: 0,
            op_count: 0,
            last_code_separator: 0,
            sig_checks: 0,
        }
    }

    fn executing(&self) -> bool {
        self.negate_depth == 0
    }

    fn check_stack_size(&self) -> Result<(), ScriptError> {
        let total = self.stack.len() + self.altstack.len();
        if total > crate::stack::MAX_STACK_SIZE {
            return Err(ScriptError::StackSize(total));
        }
        Ok(())
    }
}

/// Execute `script` against `stack`, mutating it in place.
///
/// `ctx` is `None` for scripts with no enclosing transaction (tests,
/// standalone script analysis); any locktime/signature opcode will then
/// fail rather than panic.
pub fn execute<C: TxContext>(
    script: &Script,
    stack: &mut Stack,
    flags: VerifyFlags,
    ctx: Option<(&C, usize, Amount)>,
) -> Result<SigCheckCount, ScriptError> {
    if script.len() > crate::script::MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize(script.len()));
    }

    let mut state = ExecState::new(std::mem::take(stack));
    let bytes = script.as_bytes();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let (op, rest) = Opcode::decode(&bytes[pos..]);
        let consumed = bytes.len() - pos - rest.len();

        match &op {
            Opcode::Malformed(_) => return Err(ScriptError::BadOpcode),
            Opcode::Push(data, _) => {
                if data.len() > 520 {
                    return Err(ScriptError::PushSize(data.len()));
                }
                if state.executing() {
                    if flags.intersects(VerifyFlags::MINIMALDATA) && !op.is_minimal() {
                        return Err(ScriptError::MinimalData);
                    }
                    state.stack.push(data.clone());
                }
            }
            Opcode::Op(opcode) => {
                if !is_small_int_push(*opcode) && *opcode > ops::OP_16 {
                    state.op_count += 1;
                    if state.op_count > MAX_OPS_PER_SCRIPT {
                        return Err(ScriptError::OpCount(state.op_count));
                    }
                }

                if op.is_disabled() {
                    return Err(ScriptError::DisabledOpcode);
                }

                if state.executing() || op.is_branch() {
                    exec_opcode(*opcode, &mut state, flags, ctx, bytes)?;
                    if *opcode == ops::OP_CODESEPARATOR {
                        state.last_code_separator = pos + consumed;
                    }
                }
            }
        }

        state.check_stack_size()?;
        pos += consumed;
    }

    if !state.conditional.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }

    *stack = state.stack;
    Ok(SigCheckCount(state.sig_checks))
}

fn is_small_int_push(op: u8) -> bool {
    op == crate::opcode::OP_0 || op == ops::OP_1NEGATE || (crate::opcode::OP_1..=crate::opcode::OP_16).contains(&op)
}

#[allow(clippy::too_many_arguments)]
fn exec_opcode<C: TxContext>(
    op: u8,
    state: &mut ExecState,
    flags: VerifyFlags,
    ctx: Option<(&C, usize, Amount)>,
    script_bytes: &[u8],
) -> Result<(), ScriptError> {
    use ScriptError as E;

    match op {
        ops::OP_NOP => Ok(()),
        ops::OP_VER => Err(E::BadOpcode),

        ops::OP_IF | ops::OP_NOTIF => {
            let mut value = true;
            if state.executing() {
                let bytes = state.stack.pop()?;
                if flags.intersects(VerifyFlags::MINIMALIF) && !(bytes.is_empty() || bytes == [1]) {
                    return Err(E::MinimalIf);
                }
                value = cast_to_bool(&bytes);
                if op == ops::OP_NOTIF {
                    value = !value;
                }
            }
            state.conditional.push(value);
            if !value {
                state.negate_depth += 1;
            }
            Ok(())
        }
        ops::OP_ELSE => {
            let top = state.conditional.last_mut().ok_or(E::UnbalancedConditional)?;
            if !*top {
                state.negate_depth -= 1;
            }
            *top = !*top;
            if !*top {
                state.negate_depth += 1;
            }
            Ok(())
        }
        ops::OP_ENDIF => {
            let was_true = state.conditional.pop().ok_or(E::UnbalancedConditional)?;
            if !was_true {
                state.negate_depth -= 1;
            }
            Ok(())
        }

        ops::OP_VERIFY => {
            if !state.stack.pop_bool()? {
                return Err(E::Verify);
            }
            Ok(())
        }
        ops::OP_RETURN => Err(E::OpReturn),

        ops::OP_TOALTSTACK => {
            let v = state.stack.pop()?;
            state.altstack.push(v);
            Ok(())
        }
        ops::OP_FROMALTSTACK => {
            let v = state.altstack.pop().map_err(|_| E::InvalidAltstackOperation)?;
            state.stack.push(v);
            Ok(())
        }
        ops::OP_2DROP => {
            state.stack.pop()?;
            state.stack.pop()?;
            Ok(())
        }
        ops::OP_2DUP => {
            let a = state.stack.top(1)?.clone();
            let b = state.stack.top(0)?.clone();
            state.stack.push(a);
            state.stack.push(b);
            Ok(())
        }
        ops::OP_3DUP => {
            let a = state.stack.top(2)?.clone();
            let b = state.stack.top(1)?.clone();
            let c = state.stack.top(0)?.clone();
            state.stack.push(a);
            state.stack.push(b);
            state.stack.push(c);
            Ok(())
        }
        ops::OP_2OVER => {
            let a = state.stack.top(3)?.clone();
            let b = state.stack.top(2)?.clone();
            state.stack.push(a);
            state.stack.push(b);
            Ok(())
        }
        ops::OP_2ROT => {
            let a = state.stack.erase_from_top(5)?;
            let b = state.stack.erase_from_top(4)?;
            state.stack.push(a);
            state.stack.push(b);
            Ok(())
        }
        ops::OP_2SWAP => {
            let a = state.stack.erase_from_top(3)?;
            let b = state.stack.erase_from_top(2)?;
            state.stack.push(a);
            state.stack.push(b);
            Ok(())
        }
        ops::OP_IFDUP => {
            let top = state.stack.top(0)?.clone();
            if cast_to_bool(&top) {
                state.stack.push(top);
            }
            Ok(())
        }
        ops::OP_DEPTH => {
            let n = state.stack.len() as i64;
            state.stack.push(ScriptNum::new(n).to_bytes());
            Ok(())
        }
        ops::OP_DROP => {
            state.stack.pop()?;
            Ok(())
        }
        ops::OP_DUP => {
            let v = state.stack.top(0)?.clone();
            state.stack.push(v);
            Ok(())
        }
        ops::OP_NIP => {
            state.stack.erase_from_top(1)?;
            Ok(())
        }
        ops::OP_OVER => {
            let v = state.stack.top(1)?.clone();
            state.stack.push(v);
            Ok(())
        }
        ops::OP_PICK | ops::OP_ROLL => {
            let n = state.stack.pop_num(flags.intersects(VerifyFlags::MINIMALDATA), DEFAULT_MAX_NUM_SIZE)?.value();
            if n < 0 {
                return Err(E::InvalidStackOperation);
            }
            let k = n as usize;
            if op == ops::OP_PICK {
                let v = state.stack.top(k)?.clone();
                state.stack.push(v);
            } else {
                let v = state.stack.erase_from_top(k)?;
                state.stack.push(v);
            }
            Ok(())
        }
        ops::OP_ROT => {
            let v = state.stack.erase_from_top(2)?;
            state.stack.push(v);
            Ok(())
        }
        ops::OP_SWAP => state.stack.swap_top(),
        ops::OP_TUCK => {
            let top = state.stack.top(0)?.clone();
            state.stack.insert_from_top(2, top);
            Ok(())
        }

        ops::OP_CAT => {
            let mut b = state.stack.pop()?;
            let mut a = state.stack.pop()?;
            if a.len() + b.len() > 520 {
                return Err(E::PushSize(a.len() + b.len()));
            }
            a.append(&mut b);
            state.stack.push(a);
            Ok(())
        }
        ops::OP_SPLIT => {
            let n = state.stack.pop_num(flags.intersects(VerifyFlags::MINIMALDATA), DEFAULT_MAX_NUM_SIZE)?.value();
            let data = state.stack.pop()?;
            if n < 0 || n as usize > data.len() {
                return Err(E::InvalidSplitRange(n, data.len()));
            }
            let (left, right) = data.split_at(n as usize);
            state.stack.push(left.to_vec());
            state.stack.push(right.to_vec());
            Ok(())
        }
        ops::OP_REVERSEBYTES => {
            let mut v = state.stack.pop()?;
            v.reverse();
            state.stack.push(v);
            Ok(())
        }
        ops::OP_NUM2BIN => {
            let size = state.stack.pop_num(flags.intersects(VerifyFlags::MINIMALDATA), DEFAULT_MAX_NUM_SIZE)?.value();
            if size < 0 || size as usize > 520 {
                return Err(E::PushSize(size.max(0) as usize));
            }
            let size = size as usize;
            let n = state.stack.pop()?;
            let encoded = num_to_bin(&n, size)?;
            state.stack.push(encoded);
            Ok(())
        }
        ops::OP_BIN2NUM => {
            let v = state.stack.pop()?;
            let minimal = bin_to_minimal(&v);
            if minimal.len() > DEFAULT_MAX_NUM_SIZE {
                return Err(E::InvalidNumberRange);
            }
            state.stack.push(minimal);
            Ok(())
        }
        ops::OP_SIZE => {
            let n = state.stack.top(0)?.len() as i64;
            state.stack.push(ScriptNum::new(n).to_bytes());
            Ok(())
        }

        ops::OP_AND | ops::OP_OR | ops::OP_XOR => {
            let b = state.stack.pop()?;
            let a = state.stack.pop()?;
            if a.len() != b.len() {
                return Err(E::InvalidOperandSize(a.len(), b.len()));
            }
            let out = a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| match op {
                    ops::OP_AND => x & y,
                    ops::OP_OR => x | y,
                    _ => x ^ y,
                })
                .collect();
            state.stack.push(out);
            Ok(())
        }
        ops::OP_EQUAL => {
            let b = state.stack.pop()?;
            let a = state.stack.pop()?;
            state.stack.push_bool(a == b);
            Ok(())
        }
        ops::OP_EQUALVERIFY => {
            let b = state.stack.pop()?;
            let a = state.stack.pop()?;
            if a != b {
                return Err(E::EqualVerify);
            }
            Ok(())
        }

        ops::OP_1ADD | ops::OP_1SUB | ops::OP_NEGATE | ops::OP_ABS | ops::OP_NOT | ops::OP_0NOTEQUAL => {
            let n = state.stack.pop_num(flags.intersects(VerifyFlags::MINIMALDATA), DEFAULT_MAX_NUM_SIZE)?;
            let result = match op {
                ops::OP_1ADD => (n + ScriptNum::new(1)).ok_or(E::InvalidNumberRange)?,
                ops::OP_1SUB => (n - ScriptNum::new(1)).ok_or(E::InvalidNumberRange)?,
                ops::OP_NEGATE => n.checked_neg().ok_or(E::InvalidNumberRange)?,
                ops::OP_ABS => n.checked_abs().ok_or(E::InvalidNumberRange)?,
                ops::OP_NOT => ScriptNum::from(!n.is_true()),
                _ => ScriptNum::from(n.is_true()),
            };
            state.stack.push(result.to_bytes());
            Ok(())
        }
        ops::OP_ADD | ops::OP_SUB | ops::OP_BOOLAND | ops::OP_BOOLOR | ops::OP_NUMEQUAL
        | ops::OP_NUMEQUALVERIFY | ops::OP_NUMNOTEQUAL | ops::OP_LESSTHAN | ops::OP_GREATERTHAN
        | ops::OP_LESSTHANOREQUAL | ops::OP_GREATERTHANOREQUAL | ops::OP_MIN | ops::OP_MAX => {
            let minimal = flags.intersects(VerifyFlags::MINIMALDATA);
            let b = state.stack.pop_num(minimal, DEFAULT_MAX_NUM_SIZE)?.value();
            let a = state.stack.pop_num(minimal, DEFAULT_MAX_NUM_SIZE)?.value();
            let result: ScriptNum = match op {
                ops::OP_ADD => a.checked_add(b).ok_or(E::InvalidNumberRange)?.into(),
                ops::OP_SUB => a.checked_sub(b).ok_or(E::InvalidNumberRange)?.into(),
                ops::OP_BOOLAND => ScriptNum::from(a != 0 && b != 0),
                ops::OP_BOOLOR => ScriptNum::from(a != 0 || b != 0),
                ops::OP_NUMEQUAL | ops::OP_NUMEQUALVERIFY => ScriptNum::from(a == b),
                ops::OP_NUMNOTEQUAL => ScriptNum::from(a != b),
                ops::OP_LESSTHAN => ScriptNum::from(a < b),
                ops::OP_GREATERTHAN => ScriptNum::from(a > b),
                ops::OP_LESSTHANOREQUAL => ScriptNum::from(a <= b),
                ops::OP_GREATERTHANOREQUAL => ScriptNum::from(a >= b),
                ops::OP_MIN => ScriptNum::new(a.min(b)),
                _ => ScriptNum::new(a.max(b)),
            };
            if op == ops::OP_NUMEQUALVERIFY {
                if !result.is_true() {
                    return Err(E::NumEqualVerify);
                }
            } else {
                state.stack.push(result.to_bytes());
            }
            Ok(())
        }
        ops::OP_MUL => {
            let minimal = flags.intersects(VerifyFlags::MINIMALDATA);
            let b = state.stack.pop_num(minimal, DEFAULT_MAX_NUM_SIZE)?.value();
            let a = state.stack.pop_num(minimal, DEFAULT_MAX_NUM_SIZE)?.value();
            let result = a.checked_mul(b).ok_or(E::InvalidNumberRange)?;
            state.stack.push(ScriptNum::new(result).to_bytes());
            Ok(())
        }
        ops::OP_DIV | ops::OP_MOD => {
            let minimal = flags.intersects(VerifyFlags::MINIMALDATA);
            let b = state.stack.pop_num(minimal, DEFAULT_MAX_NUM_SIZE)?.value();
            let a = state.stack.pop_num(minimal, DEFAULT_MAX_NUM_SIZE)?.value();
            if b == 0 {
                return Err(if op == ops::OP_DIV { E::DivByZero } else { E::ModByZero });
            }
            let result = if op == ops::OP_DIV { a / b } else { a % b };
            state.stack.push(ScriptNum::new(result).to_bytes());
            Ok(())
        }
        ops::OP_WITHIN => {
            let minimal = flags.intersects(VerifyFlags::MINIMALDATA);
            let max = state.stack.pop_num(minimal, DEFAULT_MAX_NUM_SIZE)?.value();
            let min = state.stack.pop_num(minimal, DEFAULT_MAX_NUM_SIZE)?.value();
            let x = state.stack.pop_num(minimal, DEFAULT_MAX_NUM_SIZE)?.value();
            state.stack.push_bool(x >= min && x < max);
            Ok(())
        }

        ops::OP_RIPEMD160 => hash_top(state, |b| ripemd160(b)),
        ops::OP_SHA1 => hash_top(state, sha1),
        ops::OP_SHA256 => hash_top(state, sha256),
        ops::OP_HASH160 => hash_top(state, |b| ripemd160(&sha256(b))),
        ops::OP_HASH256 => hash_top(state, |b| sha256(&sha256(b))),
        ops::OP_CODESEPARATOR => Ok(()),

        ops::OP_CHECKSIG | ops::OP_CHECKSIGVERIFY => {
            let (tx, input_index, value) = ctx.ok_or(E::InvalidStackOperation)?;
            let pubkey = state.stack.pop()?;
            let sig = state.stack.pop()?;
            checksig::check_signature_encoding(&sig, flags)?;
            if !sig.is_empty() {
                state.sig_checks += 1;
            }
            let subscript = subscript_from(script_bytes, state.last_code_separator, &sig, flags);
            let ok = checksig::check_tx_signature(tx, input_index, &sig, &pubkey, &subscript, value, flags)?;
            if !ok && flags.intersects(VerifyFlags::NULLFAIL) && !sig.is_empty() {
                return Err(E::NullFail);
            }
            if op == ops::OP_CHECKSIGVERIFY {
                if !ok {
                    return Err(E::CheckSigVerify);
                }
            } else {
                state.stack.push_bool(ok);
            }
            Ok(())
        }
        ops::OP_CHECKDATASIG | ops::OP_CHECKDATASIGVERIFY => {
            let pubkey = state.stack.pop()?;
            let msg = state.stack.pop()?;
            let sig = state.stack.pop()?;
            if !sig.is_empty() {
                state.sig_checks += 1;
            }
            let ok = checksig::check_data_signature(&sig, &msg, &pubkey, flags)?;
            if !ok && flags.intersects(VerifyFlags::NULLFAIL) && !sig.is_empty() {
                return Err(E::NullFail);
            }
            if op == ops::OP_CHECKDATASIGVERIFY {
                if !ok {
                    return Err(E::CheckDataSigVerify);
                }
            } else {
                state.stack.push_bool(ok);
            }
            Ok(())
        }
        ops::OP_CHECKMULTISIG | ops::OP_CHECKMULTISIGVERIFY => {
            let (tx, input_index, value) = ctx.ok_or(E::InvalidStackOperation)?;
            let ok = exec_checkmultisig(state, tx, input_index, value, flags, script_bytes)?;
            if op == ops::OP_CHECKMULTISIGVERIFY {
                if !ok {
                    return Err(E::CheckMultisigVerify);
                }
            } else {
                state.stack.push_bool(ok);
            }
            Ok(())
        }

        ops::OP_CHECKLOCKTIMEVERIFY => {
            if !flags.intersects(VerifyFlags::CHECKLOCKTIMEVERIFY) {
                return reject_unknown_nop(flags);
            }
            let (tx, input_index, _value) = ctx.ok_or(E::InvalidStackOperation)?;
            let n = state.stack.top(0)?;
            let locktime = ScriptNum::from_bytes(n, flags.intersects(VerifyFlags::MINIMALDATA), LOCKTIME_MAX_NUM_SIZE)?.value();
            if locktime < 0 {
                return Err(E::NegativeLocktime);
            }
            let tx_locktime = tx.lock_time() as i64;
            if (locktime < 500_000_000) != (tx_locktime < 500_000_000) {
                return Err(E::UnsatisfiedLocktime);
            }
            if locktime > tx_locktime {
                return Err(E::UnsatisfiedLocktime);
            }
            if tx.input_sequence(input_index) == 0xffff_ffff {
                return Err(E::UnsatisfiedLocktime);
            }
            Ok(())
        }
        ops::OP_CHECKSEQUENCEVERIFY => {
            if !flags.intersects(VerifyFlags::CHECKSEQUENCEVERIFY) {
                return reject_unknown_nop(flags);
            }
            let (tx, input_index, _value) = ctx.ok_or(E::InvalidStackOperation)?;
            let n = state.stack.top(0)?;
            let sequence = ScriptNum::from_bytes(n, flags.intersects(VerifyFlags::MINIMALDATA), LOCKTIME_MAX_NUM_SIZE)?.value();
            if sequence < 0 {
                return Err(E::NegativeLocktime);
            }
            const DISABLE_FLAG: i64 = 1 << 31;
            if sequence & DISABLE_FLAG != 0 {
                return Ok(());
            }
            if tx.version() < 2 {
                return Err(E::UnsatisfiedLocktime);
            }
            let tx_sequence = tx.input_sequence(input_index) as i64;
            if tx_sequence & DISABLE_FLAG != 0 {
                return Err(E::UnsatisfiedLocktime);
            }
            const TYPE_FLAG: i64 = 1 << 22;
            const MASK: i64 = 0x0000_ffff;
            if (sequence & TYPE_FLAG) != (tx_sequence & TYPE_FLAG) {
                return Err(E::UnsatisfiedLocktime);
            }
            if (sequence & MASK) > (tx_sequence & MASK) {
                return Err(E::UnsatisfiedLocktime);
            }
            Ok(())
        }

        ops::OP_NOP1 | ops::OP_NOP4 | ops::OP_NOP5 | ops::OP_NOP6 | ops::OP_NOP7 | ops::OP_NOP8 | ops::OP_NOP9 | ops::OP_NOP10 => {
            reject_unknown_nop(flags)
        }

        _ => Err(E::BadOpcode),
    }
}

fn reject_unknown_nop(flags: VerifyFlags) -> Result<(), ScriptError> {
    if flags.intersects(VerifyFlags::DISCOURAGE_UPGRADABLE_NOPS) {
        Err(ScriptError::DiscourageUpgradableNops)
    } else {
        Ok(())
    }
}

fn hash_top(state: &mut ExecState, f: impl FnOnce(&[u8]) -> Vec<u8>) -> Result<(), ScriptError> {
    let v = state.stack.pop()?;
    state.stack.push(f(&v));
    Ok(())
}

fn sha256(data: &[u8]) -> Vec<u8> {
    use sha2::Digest as _;
    sha2::Sha256::digest(data).to_vec()
}

fn sha1(data: &[u8]) -> Vec<u8> {
    use sha1::Digest as _;
    sha1::Sha1::digest(data).to_vec()
}

fn ripemd160(data: &[u8]) -> Vec<u8> {
    use ripemd::Digest as _;
    ripemd::Ripemd160::digest(data).to_vec()
}

fn num_to_bin(n: &[u8], size: usize) -> Result<Vec<u8>, ScriptError> {
    if n.is_empty() {
        return Ok(vec![0u8; size]);
    }
    let negative = n.last().map(|b| b & 0x80 != 0).unwrap_or(false);
    let mut magnitude = n.to_vec();
    if let Some(last) = magnitude.last_mut() {
        *last &= 0x7f;
    }
    while magnitude.last() == Some(&0) {
        magnitude.pop();
    }
    if magnitude.len() > size {
        return Err(ScriptError::ImpossibleEncoding(size));
    }
    let mut out = vec![0u8; size];
    out[..magnitude.len()].copy_from_slice(&magnitude);
    if negative {
        if let Some(last) = out.last_mut() {
            *last |= 0x80;
        }
    }
    Ok(out)
}

fn bin_to_minimal(v: &[u8]) -> Vec<u8> {
    let mut out = v.to_vec();
    while out.last() == Some(&0) {
        if out.len() >= 2 && out[out.len() - 2] & 0x80 != 0 {
            break;
        }
        out.pop();
    }
    out
}

/// Subscript extraction for a signature check: the active script from the
/// last `OP_CODESEPARATOR` onward, with `sig` stripped out via
/// `find_and_delete` unless it sets the `SIGHASH_FORKID` bit (FORKID
/// signatures commit to the subscript directly and never need stripping).
fn subscript_from(script_bytes: &[u8], last_code_separator: usize, sig: &[u8], _flags: VerifyFlags) -> Script {
    let base = Script::from_bytes(script_bytes[last_code_separator..].to_vec())
        .expect("a subslice of an already-validated script is still within the size limit");
    let is_forkid = sig.last().map(|b| b & sighash::SIGHASH_FORKID != 0).unwrap_or(false);
    if is_forkid {
        base
    } else {
        sighash::find_and_delete(&base, sig)
    }
}

/// Legacy and Schnorr-bitfield `OP_CHECKMULTISIG`/`OP_CHECKMULTISIGVERIFY`.
fn exec_checkmultisig<C: TxContext>(
    state: &mut ExecState,
    tx: &C,
    input_index: usize,
    value: Amount,
    flags: VerifyFlags,
    script_bytes: &[u8],
) -> Result<bool, ScriptError> {
    let minimal = flags.intersects(VerifyFlags::MINIMALDATA);

    let key_count = state.stack.pop_num(minimal, DEFAULT_MAX_NUM_SIZE)?.value();
    if !(0..=20).contains(&key_count) {
        return Err(ScriptError::PubkeyCount(key_count));
    }
    state.op_count += key_count as usize;
    if state.op_count > MAX_OPS_PER_SCRIPT {
        return Err(ScriptError::OpCount(state.op_count));
    }

    let mut keys = Vec::with_capacity(key_count as usize);
    for _ in 0..key_count {
        keys.push(state.stack.pop()?);
    }
    keys.reverse();

    let sig_count = state.stack.pop_num(minimal, DEFAULT_MAX_NUM_SIZE)?.value();
    if !(0..=key_count).contains(&sig_count) {
        return Err(ScriptError::SigCount(sig_count));
    }

    let mut sigs = Vec::with_capacity(sig_count as usize);
    for _ in 0..sig_count {
        sigs.push(state.stack.pop()?);
    }
    sigs.reverse();

    let dummy = state.stack.pop()?;

    let schnorr_path = flags.intersects(VerifyFlags::SCHNORR_MULTISIG) && !dummy.is_empty();

    let mut subscript = Script::from_bytes(script_bytes[state.last_code_separator..].to_vec())
        .expect("a subslice of an already-validated script is still within the size limit");
    if !schnorr_path {
        for sig in &sigs {
            subscript = subscript_from(subscript.as_bytes(), 0, sig, flags);
        }
    }

    let result = if schnorr_path {
        checkmultisig_schnorr(&dummy, &sigs, &keys, tx, input_index, &subscript, value, flags)?
    } else {
        if flags.intersects(VerifyFlags::NULLDUMMY) && !dummy.is_empty() {
            return Err(ScriptError::SigHashType);
        }
        checkmultisig_legacy(&sigs, &keys, tx, input_index, &subscript, value, flags)?
    };

    state.sig_checks += sigs.iter().filter(|s| !s.is_empty()).count() as u32;
    Ok(result)
}

#[allow(clippy::too_many_arguments)]
fn checkmultisig_legacy<C: TxContext>(
    sigs: &[Vec<u8>],
    keys: &[Vec<u8>],
    tx: &C,
    input_index: usize,
    subscript: &Script,
    value: Amount,
    flags: VerifyFlags,
) -> Result<bool, ScriptError> {
    let mut key_iter = keys.iter();
    let mut success = true;
    for sig in sigs {
        let mut matched = false;
        for key in key_iter.by_ref() {
            match checksig::check_tx_signature(tx, input_index, sig, key, subscript, value, flags) {
                Ok(true) => {
                    matched = true;
                    break;
                }
                Ok(false) => continue,
                Err(e) => return Err(e),
            }
        }
        if !matched {
            success = false;
            break;
        }
    }

    // NULLFAIL (BIP146) applies to every originally-supplied signature, not
    // just the one that exhausted the key list: a failed multisig is only
    // valid if none of `sigs` is non-empty.
    if !success && flags.intersects(VerifyFlags::NULLFAIL) && sigs.iter().any(|sig| !sig.is_empty()) {
        return Err(ScriptError::NullFail);
    }

    Ok(success)
}

#[allow(clippy::too_many_arguments)]
fn checkmultisig_schnorr<C: TxContext>(
    bitfield: &[u8],
    sigs: &[Vec<u8>],
    keys: &[Vec<u8>],
    tx: &C,
    input_index: usize,
    subscript: &Script,
    value: Amount,
    flags: VerifyFlags,
) -> Result<bool, ScriptError> {
    let expected_bytes = keys.len().div_ceil(8);
    if bitfield.len() != expected_bytes {
        return Err(ScriptError::InvalidBitfieldSize {
            actual: bitfield.len(),
            expected: expected_bytes,
        });
    }

    let mut selected = Vec::with_capacity(sigs.len());
    for (i, key) in keys.iter().enumerate() {
        let byte = bitfield[i / 8];
        let bit = 0x80 >> (i % 8);
        if byte & bit != 0 {
            selected.push(key);
        }
    }
    // Reject any set bit beyond the key count (only possible if the final
    // byte has padding bits set).
    let total_bits = bitfield.len() * 8;
    for i in keys.len()..total_bits {
        let byte = bitfield[i / 8];
        let bit = 0x80 >> (i % 8);
        if byte & bit != 0 {
            return Err(ScriptError::BitRange);
        }
    }

    if selected.len() != sigs.len() {
        return Err(ScriptError::InvalidBitCount {
            actual: selected.len() as u32,
            expected: sigs.len() as u32,
        });
    }

    for (sig, key) in sigs.iter().zip(selected.iter()) {
        let ok = checksig::check_tx_signature(tx, input_index, sig, key, subscript, value, flags)?;
        if !ok {
            return Err(ScriptError::InvalidBitRange);
        }
    }

    Ok(true)
}

/// Run the full input/output verification protocol for a single
/// transaction input.
pub fn verify<C: TxContext>(
    input_script: &Script,
    output_script: &Script,
    tx: &C,
    input_index: usize,
    prev_value: Amount,
    flags: VerifyFlags,
) -> Result<SigCheckCount, ScriptError> {
    if flags.intersects(VerifyFlags::SIGPUSHONLY) && !input_script.is_push_only() {
        return Err(ScriptError::SigPushOnly);
    }

    let flags = if flags.intersects(VerifyFlags::SIGHASH_FORKID) {
        flags | VerifyFlags::STRICTENC
    } else {
        flags
    };

    let mut stack = Stack::new();
    let mut total_checks = execute(input_script, &mut stack, flags, Some((tx, input_index, prev_value)))?;

    let stack_snapshot = if flags.intersects(VerifyFlags::P2SH) {
        Some(stack.clone())
    } else {
        None
    };

    total_checks.0 += execute(output_script, &mut stack, flags, Some((tx, input_index, prev_value)))?.0;

    if stack.is_empty() || !stack.pop_bool()? {
        return Err(ScriptError::EvalFalse);
    }

    if flags.intersects(VerifyFlags::P2SH) && output_script.is_pay_to_script_hash() {
        if !input_script.is_push_only() {
            return Err(ScriptError::SigPushOnly);
        }
        let mut p2sh_stack = stack_snapshot.expect("P2SH flag implies a snapshot was taken");
        let redeem_bytes = p2sh_stack.pop()?;

        if p2sh_stack.is_empty() && !flags.intersects(VerifyFlags::DISALLOW_SEGWIT_RECOVERY) && is_witness_program(&redeem_bytes) {
            return Ok(total_checks);
        }

        let redeem_script = Script::from_bytes(redeem_bytes)?;
        total_checks.0 += execute(&redeem_script, &mut p2sh_stack, flags, Some((tx, input_index, prev_value)))?.0;

        if p2sh_stack.is_empty() || !p2sh_stack.pop_bool()? {
            return Err(ScriptError::EvalFalse);
        }
        if flags.intersects(VerifyFlags::CLEANSTACK) && p2sh_stack.len() != 0 {
            return Err(ScriptError::CleanStack);
        }
    } else if flags.intersects(VerifyFlags::CLEANSTACK) && stack.len() != 0 {
        return Err(ScriptError::CleanStack);
    }

    if flags.intersects(VerifyFlags::INPUT_SIGCHECKS) {
        let limit = (input_script.len() as i64 + 60) / 43;
        if (total_checks.0 as i64) > limit {
            return Err(ScriptError::InputSigChecks);
        }
    }

    Ok(total_checks)
}

fn is_witness_program(script: &[u8]) -> bool {
    matches!(script.first(), Some(0..=0x10)) && script.len() >= 4 && script.len() <= 42 && script.get(1).map(|&n| n as usize == script.len() - 2).unwrap_or(false)
}
