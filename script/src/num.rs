//! Arbitrary-precision signed integers in the bytecode VM's little-endian,
//! sign-magnitude encoding.
//!
//! The decode logic mirrors rust-bitcoin's `read_scriptint`, which is
//! itself based on the `CScriptNum` constructor in Bitcoin Core
//! (`src/script/script.h`). The interpreter needs a `max_size` that varies
//! per opcode (4 bytes for arithmetic, 5 bytes for the locktime opcodes),
//! so this implementation keeps that as an explicit parameter rather than
//! hardcoding it the way rust-bitcoin's public API does.

use crate::error::ScriptError;

/// The consensus bound on arithmetic operands.
pub const DEFAULT_MAX_NUM_SIZE: usize = 4;

/// The wider bound accepted by `OP_CHECKLOCKTIMEVERIFY`/`OP_CHECKSEQUENCEVERIFY`.
pub const LOCKTIME_MAX_NUM_SIZE: usize = 5;

/// A script-encoded integer.
///
/// Wraps an `i64`: every value the interpreter operates on during
/// arithmetic fits comfortably within 64 bits even though the wire encoding
/// is a variable-length byte string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScriptNum(i64);

impl ScriptNum {
    /// The additive identity, encoded as the empty byte string.
    pub const ZERO: ScriptNum = ScriptNum(0);

    /// Wrap a plain integer value.
    pub fn new(value: i64) -> Self {
        ScriptNum(value)
    }

    /// The wrapped value.
    pub fn value(self) -> i64 {
        self.0
    }

    /// Decode a byte string as a script number.
    ///
    /// `require_minimal` enforces that `bytes` uses the shortest possible
    /// encoding (the form `OP_CHECKMULTISIG` et al. require once
    /// `MINIMALDATA` is active); `max_size` bounds the operand length
    /// (4 for ordinary arithmetic, 5 for the locktime opcodes).
    pub fn from_bytes(
        bytes: &[u8],
        require_minimal: bool,
        max_size: usize,
    ) -> Result<Self, ScriptError> {
        if bytes.len() > max_size {
            return Err(ScriptError::InvalidNumberRange);
        }
        if require_minimal && !is_minimally_encoded(bytes) {
            return Err(ScriptError::InvalidNumberRange);
        }
        Ok(ScriptNum(scriptint_parse(bytes)))
    }

    /// Encode this value using the minimal (canonical) byte representation.
    ///
    /// Zero encodes as the empty vector. Otherwise the value is written
    /// little-endian, with an extra `0x00`/`0x80` byte appended if the
    /// natural encoding's high bit would otherwise collide with the sign
    /// bit.
    pub fn to_bytes(self) -> Vec<u8> {
        let value = self.0;
        if value == 0 {
            return Vec::new();
        }

        let negative = value < 0;
        let mut absvalue = value.unsigned_abs();
        let mut result = Vec::with_capacity(9);

        while absvalue > 0 {
            result.push((absvalue & 0xff) as u8);
            absvalue >>= 8;
        }

        // If the most significant byte has the sign bit set already, push
        // an extra byte to hold the sign unambiguously.
        if result.last().map(|b| b & 0x80 != 0).unwrap_or(false) {
            result.push(if negative { 0x80 } else { 0x00 });
        } else if negative {
            *result.last_mut().expect("absvalue != 0") |= 0x80;
        }

        result
    }

    /// Numeric negation.
    pub fn checked_neg(self) -> Option<Self> {
        self.0.checked_neg().map(ScriptNum)
    }

    /// Absolute value.
    pub fn checked_abs(self) -> Option<Self> {
        self.0.checked_abs().map(ScriptNum)
    }

    /// Whether this value is non-zero, the VM's definition of "true".
    pub fn is_true(self) -> bool {
        self.0 != 0
    }
}

impl std::ops::Add for ScriptNum {
    type Output = Option<ScriptNum>;
    fn add(self, rhs: Self) -> Self::Output {
        self.0.checked_add(rhs.0).map(ScriptNum)
    }
}

impl std::ops::Sub for ScriptNum {
    type Output = Option<ScriptNum>;
    fn sub(self, rhs: Self) -> Self::Output {
        self.0.checked_sub(rhs.0).map(ScriptNum)
    }
}

impl From<i64> for ScriptNum {
    fn from(value: i64) -> Self {
        ScriptNum(value)
    }
}

impl From<bool> for ScriptNum {
    fn from(value: bool) -> Self {
        ScriptNum(value as i64)
    }
}

/// Whether `bytes` is the shortest possible encoding of its value.
///
/// If the most-significant byte, excluding the sign bit, is zero then the
/// encoding is not minimal -- except when a shorter encoding would make the
/// next byte's high bit collide with the sign bit (e.g. +255/-255 require
/// the full two bytes: `0xff00`/`0xff80`).
pub fn is_minimally_encoded(bytes: &[u8]) -> bool {
    let Some(&last) = bytes.last() else {
        return true;
    };
    if (last & 0x7f) == 0 && (bytes.len() <= 1 || (bytes[bytes.len() - 2] & 0x80) == 0) {
        return false;
    }
    true
}

/// Parse a non-empty, already-validated byte string into its integer value.
///
/// The caller is responsible for range/minimality checks; this function
/// merely reassembles the little-endian sign-magnitude bytes.
fn scriptint_parse(v: &[u8]) -> i64 {
    let Some(&last) = v.last() else {
        return 0;
    };
    let (mut ret, sh) = v
        .iter()
        .fold((0i64, 0u32), |(acc, sh), n| (acc + ((*n as i64) << sh), sh + 8));
    if last & 0x80 != 0 {
        ret &= (1i64 << (sh - 1)) - 1;
        ret = -ret;
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0 ; "zero")]
    #[test_case(1 ; "one")]
    #[test_case(-1 ; "negative one")]
    #[test_case(127 ; "max single byte")]
    #[test_case(128 ; "needs extra byte")]
    #[test_case(-128 ; "negative needs extra byte")]
    #[test_case(255 ; "two byte boundary")]
    #[test_case(-255 ; "two byte boundary negative")]
    #[test_case(i32::MAX as i64 ; "i32 max")]
    #[test_case(i32::MIN as i64 + 1 ; "i32 min plus one")]
    fn round_trips_through_minimal_encoding(value: i64) {
        let encoded = ScriptNum::new(value).to_bytes();
        assert!(is_minimally_encoded(&encoded));
        let decoded = ScriptNum::from_bytes(&encoded, true, 4).unwrap();
        assert_eq!(decoded.value(), value);
    }

    #[test]
    fn empty_bytes_decode_to_zero() {
        assert_eq!(ScriptNum::from_bytes(&[], true, 4).unwrap().value(), 0);
    }

    #[test]
    fn non_minimal_zero_is_rejected_when_required() {
        // 0x80 is "negative zero" and must never be accepted as minimal.
        assert!(ScriptNum::from_bytes(&[0x80], true, 4).is_err());
        assert_eq!(ScriptNum::from_bytes(&[0x80], false, 4).unwrap().value(), 0);
    }

    #[test]
    fn oversized_operand_is_rejected() {
        let five_bytes = [1, 2, 3, 4, 5];
        assert!(ScriptNum::from_bytes(&five_bytes, true, 4).is_err());
        assert!(ScriptNum::from_bytes(&five_bytes, true, 5).is_ok());
    }
}
