//! A Bitcoin-Cash-family script interpreter: decoding, the value stack, and
//! the bytecode VM that decides whether a transaction input's signature
//! script and the output script it spends evaluate to `true`.
//!
//! This crate has no notion of a blockchain, a mempool, or even a full
//! transaction graph -- it evaluates one script pair against one
//! [`TxContext`](interpreter::TxContext) at a time. The `chain` crate
//! builds the stateful block/chain validator on top of it.

pub mod error;
pub mod flags;
pub mod interpreter;
pub mod num;
pub mod opcode;
pub mod script;
pub mod stack;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::ScriptError;
pub use flags::VerifyFlags;
pub use interpreter::{execute, verify, SigCheckCount, TxContext};
pub use num::ScriptNum;
pub use opcode::Opcode;
pub use script::Script;
pub use stack::Stack;
