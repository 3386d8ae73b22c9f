//! Scripted interpreter
//!
//! Runs a fixed list of state operations per tx index instead of bytecode.
//! Used by tests, benches and demos to drive the execution core with known
//! access patterns.

use primitive_types::U256;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::entities::{BlockContext, Execution, Message, Receipt};
use crate::domain::errors::{CacheError, ExecutionError, InterpreterError};
use crate::domain::path::{self, Path};
use crate::domain::value_objects::{Address, Delta, TxIndex, TypedValue};
use crate::execution::context::TxContext;
use crate::execution::generation::Generation;
use crate::execution::job::Job;
use crate::execution::sequence::JobSequence;
use crate::ports::outbound::Interpreter;

/// Gas charged per transaction
pub const BASE_GAS: u64 = 21_000;
/// Gas charged per operation, nested ones included
pub const OP_GAS: u64 = 5_000;

/// One scripted state operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Read(Path),
    /// Absolute write, `None` deletes
    Write(Path, Option<TypedValue>),
    Delta(Path, Delta),
    /// Read the first path and write its value to the second
    Copy(Path, Path),
    /// Move `amount` from the sender's balance to `to`
    Transfer(Address, U256),
    /// Run in a child frame; a revert inside only discards the frame
    Call(Vec<Op>),
    /// Run a nested generation, one sequence per entry, jobs by tx index
    Spawn(Vec<Vec<TxIndex>>),
    Revert(String),
}

impl Op {
    fn gas(&self) -> u64 {
        match self {
            Self::Call(ops) => OP_GAS.saturating_add(gas_of(ops)),
            _ => OP_GAS,
        }
    }
}

fn gas_of(ops: &[Op]) -> u64 {
    ops.iter().fold(0u64, |total, op| total.saturating_add(op.gas()))
}

#[derive(Debug, Error)]
enum ScriptError {
    #[error("Reverted: {0}")]
    Reverted(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl From<ScriptError> for InterpreterError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Reverted(reason) => Self::Reverted(reason),
            other => Self::Fault(other.to_string()),
        }
    }
}

/// Interpreter running per-tx scripts.
///
/// With fees enabled, a top-level job pays `gas * gas_price` from the
/// sender to the coinbase and bumps the sender nonce before its script
/// runs. Jobs of nested generations never pay.
#[derive(Clone, Debug, Default)]
pub struct ScriptedInterpreter {
    scripts: BTreeMap<TxIndex, Vec<Op>>,
    charge_fees: bool,
}

impl ScriptedInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_fees(mut self) -> Self {
        self.charge_fees = true;
        self
    }

    #[must_use]
    pub fn script(mut self, tx_index: TxIndex, ops: Vec<Op>) -> Self {
        self.scripts.insert(tx_index, ops);
        self
    }

    /// Gas a script consumes.
    pub fn gas(&self, tx_index: TxIndex) -> u64 {
        let ops = self.scripts.get(&tx_index).map_or(&[][..], Vec::as_slice);
        BASE_GAS.saturating_add(gas_of(ops))
    }

    fn charge(
        &self,
        message: &Message,
        block: &BlockContext,
        tx: &mut TxContext<'_, '_>,
        gas: u64,
    ) -> Result<(), CacheError> {
        let fee = U256::from(gas).saturating_mul(message.gas_price);
        tx.write_delta(&path::balance(&message.sender), Delta::debit(fee))?;
        tx.write_delta(&path::balance(&block.coinbase), Delta::credit(fee))?;
        tx.write_delta(&path::nonce(&message.sender), Delta::credit(U256::one()))?;
        Ok(())
    }

    fn apply(
        &self,
        ops: &[Op],
        message: &Message,
        tx: &mut TxContext<'_, '_>,
    ) -> Result<(), ScriptError> {
        for op in ops {
            match op {
                Op::Read(at) => {
                    tx.read(at)?;
                }
                Op::Write(at, value) => {
                    tx.write(at, value.clone())?;
                }
                Op::Delta(at, delta) => {
                    tx.write_delta(at, delta.clone())?;
                }
                Op::Copy(from, to) => {
                    let value = tx.read(from)?;
                    tx.write(to, value.map(|v| v.folded()))?;
                }
                Op::Transfer(to, amount) => {
                    tx.write_delta(&path::balance(&message.sender), Delta::debit(*amount))?;
                    tx.write_delta(&path::balance(to), Delta::credit(*amount))?;
                }
                Op::Call(inner) => match tx.nested(|frame| self.apply(inner, message, frame)) {
                    Ok(()) | Err(ScriptError::Reverted(_)) => {}
                    Err(err) => return Err(err),
                },
                Op::Spawn(sequences) => {
                    let degree = tx.context().config().degree_of_parallelism;
                    let sequences = sequences
                        .iter()
                        .zip(1u64..)
                        .map(|(txs, id)| {
                            let jobs = txs
                                .iter()
                                .map(|&index| Job::new(index, message.clone()))
                                .collect();
                            JobSequence::with_jobs(id, jobs)
                        })
                        .collect();
                    let mut generation =
                        Generation::with_sequences(tx.tx_index(), degree, sequences);
                    tx.spawn(&mut generation)?;
                }
                Op::Revert(reason) => return Err(ScriptError::Reverted(reason.clone())),
            }
        }
        Ok(())
    }
}

impl Interpreter for ScriptedInterpreter {
    fn run(
        &self,
        message: &Message,
        block: &BlockContext,
        tx: &mut TxContext<'_, '_>,
    ) -> Execution {
        let tx_index = tx.tx_index();
        let gas = self.gas(tx_index);
        if gas > message.gas_limit {
            return Execution::rejected(InterpreterError::Prevalidation(format!(
                "gas {gas} exceeds limit {}",
                message.gas_limit
            )));
        }

        if self.charge_fees && tx.is_top_level() {
            if let Err(err) = self.charge(message, block, tx, gas) {
                return Execution::rejected(InterpreterError::Prevalidation(format!(
                    "cannot pay fee: {err}"
                )));
            }
        }

        let ops = self.scripts.get(&tx_index).map_or(&[][..], Vec::as_slice);
        match self.apply(ops, message, tx) {
            Ok(()) => Execution::success(Receipt::success(tx_index, gas), Vec::new()),
            Err(err) => Execution::failure(Receipt::failed(tx_index, gas), err.into()),
        }
    }
}
