//! Decoded script opcodes.
//!
//! An [`Opcode`] is either a plain operation byte or a data push. Scripts
//! are decoded one opcode at a time; a push whose declared length runs past
//! the end of the script decodes to [`Opcode::Malformed`] rather than
//! panicking or silently truncating -- callers that scan a script (e.g.
//! `find_and_delete`, sigop counting) must stop at the first `Malformed`
//! opcode they encounter, mirroring the historical behavior of breaking a
//! scan loop on an undecodable opcode.

use crate::num::ScriptNum;

/// Push of fewer than `OP_PUSHDATA1` (0x4c) bytes is encoded as a single
/// length byte followed by that many bytes of data.
pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_RESERVED: u8 = 0x50;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;

/// Style of push encoding, used to test minimality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushStyle {
    /// A direct push (length byte 0x01..=0x4b, or OP_0).
    Direct,
    /// `OP_PUSHDATA1`: one length byte.
    PushData1,
    /// `OP_PUSHDATA2`: little-endian two-byte length.
    PushData2,
    /// `OP_PUSHDATA4`: little-endian four-byte length.
    PushData4,
    /// `OP_1NEGATE` or `OP_1`..`OP_16`: a dedicated small-integer opcode.
    SmallInt,
}

/// A single decoded script opcode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// A non-push operation, identified by its byte value.
    Op(u8),
    /// A data push, with the bytes pushed and the encoding style used.
    Push(Vec<u8>, PushStyle),
    /// A push whose declared length ran past the end of the script. Carries
    /// whatever trailing bytes remained so diagnostics can report them; a
    /// decoder must never step past this opcode.
    Malformed(Vec<u8>),
}

impl Opcode {
    /// Decode the opcode at the front of `bytes`, returning it and the
    /// remaining, unconsumed bytes.
    pub fn decode(bytes: &[u8]) -> (Opcode, &[u8]) {
        let Some((&first, rest)) = bytes.split_first() else {
            return (Opcode::Op(0), bytes);
        };

        match first {
            OP_0 => (Opcode::Push(Vec::new(), PushStyle::Direct), rest),
            1..=0x4b => {
                let len = first as usize;
                if rest.len() < len {
                    (Opcode::Malformed(rest.to_vec()), &[])
                } else {
                    (Opcode::Push(rest[..len].to_vec(), PushStyle::Direct), &rest[len..])
                }
            }
            OP_PUSHDATA1 => decode_pushdata(rest, 1, PushStyle::PushData1),
            OP_PUSHDATA2 => decode_pushdata(rest, 2, PushStyle::PushData2),
            OP_PUSHDATA4 => decode_pushdata(rest, 4, PushStyle::PushData4),
            OP_1NEGATE => (Opcode::Push(ScriptNum::new(-1).to_bytes(), PushStyle::SmallInt), rest),
            OP_1..=OP_16 => {
                let n = (first - OP_1 + 1) as i64;
                (Opcode::Push(ScriptNum::new(n).to_bytes(), PushStyle::SmallInt), rest)
            }
            other => (Opcode::Op(other), rest),
        }
    }

    /// Build the minimal-encoding push for an arbitrary byte string.
    pub fn from_push(bytes: &[u8]) -> Opcode {
        if bytes.is_empty() {
            return Opcode::Push(Vec::new(), PushStyle::Direct);
        }
        if bytes.len() == 1 && (1..=16).contains(&bytes[0]) {
            return Opcode::Push(bytes.to_vec(), PushStyle::SmallInt);
        }
        if bytes == [0x81] {
            return Opcode::Push(bytes.to_vec(), PushStyle::SmallInt);
        }
        let style = match bytes.len() {
            0..=75 => PushStyle::Direct,
            76..=255 => PushStyle::PushData1,
            256..=65535 => PushStyle::PushData2,
            _ => PushStyle::PushData4,
        };
        Opcode::Push(bytes.to_vec(), style)
    }

    /// Build the dedicated small-integer opcode for `-1..=16`, or a direct
    /// push for anything else.
    pub fn from_small(n: i64) -> Opcode {
        if n == 0 {
            return Opcode::Push(Vec::new(), PushStyle::Direct);
        }
        if (-1..=16).contains(&n) {
            return Opcode::Push(ScriptNum::new(n).to_bytes(), PushStyle::SmallInt);
        }
        Self::from_push(&ScriptNum::new(n).to_bytes())
    }

    /// Build the push encoding of a [`ScriptNum`].
    pub fn from_num(n: ScriptNum) -> Opcode {
        Self::from_small(n.value())
    }

    /// Serialize this opcode back to its wire encoding.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Opcode::Op(b) => vec![*b],
            Opcode::Malformed(tail) => tail.clone(),
            Opcode::Push(bytes, style) => {
                let mut out = Vec::with_capacity(bytes.len() + 5);
                match style {
                    PushStyle::Direct => out.push(bytes.len() as u8),
                    PushStyle::PushData1 => {
                        out.push(OP_PUSHDATA1);
                        out.push(bytes.len() as u8);
                    }
                    PushStyle::PushData2 => {
                        out.push(OP_PUSHDATA2);
                        out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                    }
                    PushStyle::PushData4 => {
                        out.push(OP_PUSHDATA4);
                        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    }
                    PushStyle::SmallInt => {
                        let num = ScriptNum::from_bytes(bytes, false, 4).map(|n| n.value()).unwrap_or(0);
                        let op = if num == -1 { OP_1NEGATE } else { OP_1 + (num - 1) as u8 };
                        out.push(op);
                        return out;
                    }
                }
                out.extend_from_slice(bytes);
                out
            }
        }
    }

    /// Total serialized size of this opcode, in bytes.
    pub fn size(&self) -> usize {
        self.serialize().len()
    }

    /// Whether this opcode's push, if any, is minimally encoded given the
    /// active flags (`MINIMALDATA`-worthy check, independent of the flag
    /// itself so callers can test unconditionally).
    pub fn is_minimal(&self) -> bool {
        match self {
            Opcode::Op(_) | Opcode::Malformed(_) => true,
            Opcode::Push(bytes, style) => match Self::from_push(bytes) {
                Opcode::Push(_, canonical) => *style == canonical,
                _ => unreachable!("from_push always returns Opcode::Push"),
            },
        }
    }

    /// Whether this opcode has no defined consensus meaning and always
    /// fails execution. `OP_CAT`/`OP_SPLIT`/`OP_AND`/`OP_OR`/`OP_XOR`/
    /// `OP_NUM2BIN`/`OP_BIN2NUM`/`OP_DIV`/`OP_MOD` were re-enabled by the
    /// May 2018 upgrade and are handled as ordinary opcodes; bit-shift and
    /// the legacy `OP_2MUL`/`OP_2DIV`/`OP_INVERT` opcodes remain disabled.
    pub fn is_disabled(&self) -> bool {
        matches!(
            self,
            Opcode::Op(op) if matches!(
                *op,
                ops::OP_VERIF
                    | ops::OP_VERNOTIF
                    | OP_RESERVED
                    | ops::OP_VER
                    | ops::OP_RESERVED1
                    | ops::OP_RESERVED2
                    | ops::OP_INVERT
                    | ops::OP_2MUL
                    | ops::OP_2DIV
                    | ops::OP_LSHIFT
                    | ops::OP_RSHIFT
            )
        )
    }

    /// Whether this is one of the four flow-control opcodes that must still
    /// execute while inside a false conditional branch.
    pub fn is_branch(&self) -> bool {
        matches!(self, Opcode::Op(op) if matches!(*op, ops::OP_IF | ops::OP_NOTIF | ops::OP_ELSE | ops::OP_ENDIF))
    }
}

fn decode_pushdata(rest: &[u8], len_bytes: usize, style: PushStyle) -> (Opcode, &[u8]) {
    if rest.len() < len_bytes {
        return (Opcode::Malformed(rest.to_vec()), &[]);
    }
    let (len_slice, body) = rest.split_at(len_bytes);
    let len = match len_bytes {
        1 => len_slice[0] as usize,
        2 => u16::from_le_bytes([len_slice[0], len_slice[1]]) as usize,
        4 => u32::from_le_bytes([len_slice[0], len_slice[1], len_slice[2], len_slice[3]]) as usize,
        _ => unreachable!("len_bytes is always 1, 2, or 4"),
    };
    if body.len() < len {
        (Opcode::Malformed(body.to_vec()), &[])
    } else {
        (Opcode::Push(body[..len].to_vec(), style), &body[len..])
    }
}

/// Named opcode byte values used outside of push decoding.
///
/// Grouped separately from [`Opcode`] because the interpreter dispatches on
/// these constants directly rather than re-deriving an enum discriminant
/// per operation.
pub mod ops {
    pub const OP_1NEGATE: u8 = super::OP_1NEGATE;
    pub const OP_NOP: u8 = 0x61;
    pub const OP_VER: u8 = 0x62;
    pub const OP_IF: u8 = 0x63;
    pub const OP_NOTIF: u8 = 0x64;
    pub const OP_VERIF: u8 = 0x65;
    pub const OP_VERNOTIF: u8 = 0x66;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_TOALTSTACK: u8 = 0x6b;
    pub const OP_FROMALTSTACK: u8 = 0x6c;
    pub const OP_2DROP: u8 = 0x6d;
    pub const OP_2DUP: u8 = 0x6e;
    pub const OP_3DUP: u8 = 0x6f;
    pub const OP_2OVER: u8 = 0x70;
    pub const OP_2ROT: u8 = 0x71;
    pub const OP_2SWAP: u8 = 0x72;
    pub const OP_IFDUP: u8 = 0x73;
    pub const OP_DEPTH: u8 = 0x74;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_NIP: u8 = 0x77;
    pub const OP_OVER: u8 = 0x78;
    pub const OP_PICK: u8 = 0x79;
    pub const OP_ROLL: u8 = 0x7a;
    pub const OP_ROT: u8 = 0x7b;
    pub const OP_SWAP: u8 = 0x7c;
    pub const OP_TUCK: u8 = 0x7d;
    pub const OP_CAT: u8 = 0x7e;
    pub const OP_SPLIT: u8 = 0x7f;
    pub const OP_NUM2BIN: u8 = 0x80;
    pub const OP_BIN2NUM: u8 = 0x81;
    pub const OP_SIZE: u8 = 0x82;
    pub const OP_INVERT: u8 = 0x83;
    pub const OP_AND: u8 = 0x84;
    pub const OP_OR: u8 = 0x85;
    pub const OP_XOR: u8 = 0x86;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_RESERVED1: u8 = 0x89;
    pub const OP_RESERVED2: u8 = 0x8a;
    pub const OP_1ADD: u8 = 0x8b;
    pub const OP_1SUB: u8 = 0x8c;
    pub const OP_2MUL: u8 = 0x8d;
    pub const OP_2DIV: u8 = 0x8e;
    pub const OP_NEGATE: u8 = 0x8f;
    pub const OP_ABS: u8 = 0x90;
    pub const OP_NOT: u8 = 0x91;
    pub const OP_0NOTEQUAL: u8 = 0x92;
    pub const OP_ADD: u8 = 0x93;
    pub const OP_SUB: u8 = 0x94;
    pub const OP_MUL: u8 = 0x95;
    pub const OP_DIV: u8 = 0x96;
    pub const OP_MOD: u8 = 0x97;
    pub const OP_LSHIFT: u8 = 0x98;
    pub const OP_RSHIFT: u8 = 0x99;
    pub const OP_BOOLAND: u8 = 0x9a;
    pub const OP_BOOLOR: u8 = 0x9b;
    pub const OP_NUMEQUAL: u8 = 0x9c;
    pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
    pub const OP_NUMNOTEQUAL: u8 = 0x9e;
    pub const OP_LESSTHAN: u8 = 0x9f;
    pub const OP_GREATERTHAN: u8 = 0xa0;
    pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
    pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
    pub const OP_MIN: u8 = 0xa3;
    pub const OP_MAX: u8 = 0xa4;
    pub const OP_WITHIN: u8 = 0xa5;
    pub const OP_RIPEMD160: u8 = 0xa6;
    pub const OP_SHA1: u8 = 0xa7;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_HASH256: u8 = 0xaa;
    pub const OP_CODESEPARATOR: u8 = 0xab;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
    pub const OP_NOP1: u8 = 0xb0;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
    pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
    pub const OP_NOP4: u8 = 0xb3;
    pub const OP_NOP5: u8 = 0xb4;
    pub const OP_NOP6: u8 = 0xb5;
    pub const OP_NOP7: u8 = 0xb6;
    pub const OP_NOP8: u8 = 0xb7;
    pub const OP_NOP9: u8 = 0xb8;
    pub const OP_NOP10: u8 = 0xb9;
    pub const OP_CHECKDATASIG: u8 = 0xba;
    pub const OP_CHECKDATASIGVERIFY: u8 = 0xbb;
    pub const OP_REVERSEBYTES: u8 = 0xbc;
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(&[] ; "empty")]
    #[test_case(&[1, 2, 3] ; "short")]
    #[test_case(&[0u8; 75] ; "direct boundary")]
    #[test_case(&[0u8; 76] ; "pushdata1 boundary")]
    #[test_case(&[0u8; 256] ; "pushdata2 boundary")]
    fn from_push_is_minimal(bytes: &[u8]) {
        assert!(Opcode::from_push(bytes).is_minimal());
    }

    #[test]
    fn small_ints_use_dedicated_opcodes() {
        let (op, rest) = Opcode::decode(&[OP_1 + 4]);
        assert!(rest.is_empty());
        assert_eq!(op, Opcode::Push(ScriptNum::new(5).to_bytes(), PushStyle::SmallInt));
    }

    #[test]
    fn truncated_push_is_malformed() {
        let (op, rest) = Opcode::decode(&[0x4c, 10, 1, 2, 3]);
        assert!(rest.is_empty());
        assert!(matches!(op, Opcode::Malformed(_)));
    }

    #[test]
    fn round_trips_through_serialize() {
        let script = [OP_1, 0x4c, 3, 9, 9, 9, ops::OP_CHECKSIG];
        let mut rest: &[u8] = &script;
        let mut out = Vec::new();
        while !rest.is_empty() {
            let (op, remaining) = Opcode::decode(rest);
            out.extend(op.serialize());
            rest = remaining;
        }
        assert_eq!(out, script);
    }
}
