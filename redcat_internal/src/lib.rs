//! Shared low-level types for the redcat session runtime.
//!
//! This crate holds the pieces that both the core library and the CLI need
//! without pulling in the whole session machinery: the error taxonomy, the
//! stage-two C2 wire ABI, and the framing helpers used on raw byte streams.

pub mod error;
pub mod rpc;
pub mod wire;
