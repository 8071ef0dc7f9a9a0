//! A parsed sequence of [`Opcode`]s plus its canonical serialization.

use crate::error::ScriptError;
use crate::opcode::Opcode;

/// Consensus bound on serialized script length.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// A script: an ordered sequence of opcodes and the bytes they serialize
/// to.
///
/// The byte vector is the source of truth; [`Script::opcodes`] decodes it
/// lazily on demand rather than caching a parallel representation that
/// could drift out of sync with a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Script {
    bytes: Vec<u8>,
}

impl Script {
    /// Wrap a pre-serialized byte string as a script.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ScriptError> {
        if bytes.len() > MAX_SCRIPT_SIZE {
            return Err(ScriptError::ScriptSize(bytes.len()));
        }
        Ok(Script { bytes })
    }

    /// Build a script from already-decoded opcodes.
    pub fn from_opcodes(opcodes: &[Opcode]) -> Result<Self, ScriptError> {
        let mut bytes = Vec::new();
        for op in opcodes {
            bytes.extend(op.serialize());
        }
        Self::from_bytes(bytes)
    }

    /// The empty script.
    pub fn empty() -> Self {
        Script { bytes: Vec::new() }
    }

    /// The script's canonical serialization.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the serialized script, in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the script has zero bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode every opcode in the script in order.
    ///
    /// Decoding halts at the first [`Opcode::Malformed`] opcode: its
    /// trailing bytes are included as the final element, and no opcodes
    /// after it are produced, since their boundaries cannot be determined.
    pub fn opcodes(&self) -> Vec<Opcode> {
        let mut out = Vec::new();
        let mut rest: &[u8] = &self.bytes;
        while !rest.is_empty() {
            let (op, remaining) = Opcode::decode(rest);
            let malformed = matches!(op, Opcode::Malformed(_));
            out.push(op);
            if malformed {
                break;
            }
            rest = remaining;
        }
        out
    }

    /// Whether every opcode in the script is a push (no operators at all);
    /// required of the scriptSig when `SIGPUSHONLY` is active.
    pub fn is_push_only(&self) -> bool {
        self.opcodes()
            .iter()
            .all(|op| matches!(op, Opcode::Push(..)))
    }

    /// Whether this script is exactly the P2SH output template:
    /// `OP_HASH160 <20-byte push> OP_EQUAL`.
    pub fn is_pay_to_script_hash(&self) -> bool {
        self.bytes.len() == 23
            && self.bytes[0] == crate::opcode::ops::OP_HASH160
            && self.bytes[1] == 20
            && self.bytes[22] == crate::opcode::ops::OP_EQUAL
    }

    /// Count of disabled opcodes appearing anywhere in the script
    /// (including inside untaken branches), used for an early, cheap
    /// rejection before full execution.
    pub fn has_disabled_opcode(&self) -> bool {
        self.opcodes().iter().any(Opcode::is_disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::ops;

    #[test]
    fn round_trips_through_opcodes() {
        let bytes = vec![ops::OP_DUP, ops::OP_HASH160, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, ops::OP_EQUALVERIFY, ops::OP_CHECKSIG];
        let script = Script::from_bytes(bytes.clone()).unwrap();
        let rebuilt = Script::from_opcodes(&script.opcodes()).unwrap();
        assert_eq!(rebuilt.as_bytes(), bytes.as_slice());
    }

    #[test]
    fn detects_p2sh_template() {
        let mut bytes = vec![ops::OP_HASH160, 20];
        bytes.extend([0u8; 20]);
        bytes.push(ops::OP_EQUAL);
        assert!(Script::from_bytes(bytes).unwrap().is_pay_to_script_hash());
    }

    #[test]
    fn oversized_script_is_rejected() {
        let bytes = vec![0u8; MAX_SCRIPT_SIZE + 1];
        assert!(matches!(Script::from_bytes(bytes), Err(ScriptError::ScriptSize(_))));
    }
}
