//! Adapters
//!
//! In-memory implementations of the outbound ports:
//! - `InMemoryStore`: backing state and commit sink
//! - `ScriptedInterpreter`: per-tx operation scripts in place of bytecode

pub mod memory_store;
pub mod scripted;

pub use memory_store::InMemoryStore;
pub use scripted::{Op, ScriptedInterpreter, BASE_GAS, OP_GAS};
