//! Jobs and their results

use primitive_types::U256;
use tracing::{debug, warn};

use crate::cache::{ExportFilter, LayerId, WriteCache};
use crate::domain::entities::{BlockContext, Execution, Message, Receipt};
use crate::domain::errors::{ExecutionError, JobError};
use crate::domain::path;
use crate::domain::value_objects::{Address, NumericDelta, TxIndex};
use crate::domain::versioned::{sort_by_access, VersionedValue};

use super::context::{ExecutionContext, TxContext};

/// One state-mutating operation. Executed at most once.
#[derive(Clone, Debug)]
pub struct Job {
    tx_index: TxIndex,
    message: Message,
    result: Option<JobResult>,
}

impl Job {
    pub fn new(tx_index: TxIndex, message: Message) -> Self {
        Self {
            tx_index,
            message,
            result: None,
        }
    }

    pub fn tx_index(&self) -> TxIndex {
        self.tx_index
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn result(&self) -> Option<&JobResult> {
        self.result.as_ref()
    }

    pub(crate) fn result_mut(&mut self) -> Option<&mut JobResult> {
        self.result.as_mut()
    }

    pub fn is_executed(&self) -> bool {
        self.result.is_some()
    }

    pub fn successful(&self) -> bool {
        self.result.as_ref().is_some_and(JobResult::successful)
    }

    /// Run the message through the interpreter against `layer` and record
    /// the postprocessed result.
    pub fn execute(
        &mut self,
        ctx: &ExecutionContext,
        cache: &mut WriteCache<'_>,
        layer: LayerId,
    ) -> Result<(), ExecutionError> {
        if self.result.is_some() {
            return Err(ExecutionError::AlreadyExecuted {
                tx_index: self.tx_index,
            });
        }

        let execution = {
            let mut tx = TxContext::new(ctx, cache, layer, self.tx_index);
            ctx.interpreter().run(&self.message, ctx.block(), &mut tx)
        };
        let accesses = cache.export(layer, &ExportFilter::accesses())?;

        let mut result =
            JobResult::new(self.tx_index, &self.message, ctx.block(), accesses, execution);
        result.postprocess();
        debug!(
            tx_index = self.tx_index,
            success = result.successful(),
            accesses = result.raw_accesses.len(),
            immune = result.immune_transitions.len(),
            "Job executed"
        );
        self.result = Some(result);
        Ok(())
    }
}

/// Outcome of one job.
#[derive(Clone, Debug)]
pub struct JobResult {
    pub tx_index: TxIndex,
    pub sender: Address,
    pub coinbase: Address,
    pub gas_price: U256,
    pub receipt: Option<Receipt>,
    pub output: Vec<u8>,
    /// Every access of the job, pure reads included
    pub raw_accesses: Vec<VersionedValue>,
    /// Transitions that survive failure or a conflict flag
    pub immune_transitions: Vec<VersionedValue>,
    pub error: Option<JobError>,
}

impl JobResult {
    pub fn new(
        tx_index: TxIndex,
        message: &Message,
        block: &BlockContext,
        raw_accesses: Vec<VersionedValue>,
        execution: Execution,
    ) -> Self {
        Self {
            tx_index,
            sender: message.sender,
            coinbase: block.coinbase,
            gas_price: message.gas_price,
            receipt: execution.receipt,
            output: execution.output,
            raw_accesses,
            immune_transitions: Vec::new(),
            error: execution.error.map(JobError::from),
        }
    }

    /// Receipt present, status success, no error recorded.
    pub fn successful(&self) -> bool {
        self.error.is_none() && self.receipt.as_ref().is_some_and(Receipt::is_success)
    }

    pub fn gas_used(&self) -> u64 {
        self.receipt.as_ref().map_or(0, |r| r.gas_used)
    }

    pub fn fee(&self) -> U256 {
        U256::from(self.gas_used()).saturating_mul(self.gas_price)
    }

    /// Raw accesses on success, immune transitions otherwise.
    pub fn transitions(&self) -> Vec<VersionedValue> {
        if self.successful() {
            self.raw_accesses.clone()
        } else {
            self.immune_transitions.clone()
        }
    }

    /// Entries this job puts before arbitration, tagged with its tx index:
    /// `transitions()` plus the immune transitions not already among them.
    ///
    /// A successful job carries both its full balance entries and their
    /// fee-only counterparts, so arbitration can fall back to the latter
    /// once the job is truncated.
    pub fn arbitration_entries(&self) -> Vec<VersionedValue> {
        let mut entries = self.transitions();
        if self.successful() {
            let covered = |path: &str| {
                self.raw_accesses
                    .iter()
                    .any(|raw| raw.persistent && raw.path == path)
            };
            entries.extend(
                self.immune_transitions
                    .iter()
                    .filter(|immune| !covered(immune.path.as_str()))
                    .cloned(),
            );
        }
        for entry in &mut entries {
            entry.origin = self.tx_index;
        }
        entries
    }

    /// Record `error` unless an earlier one is already recorded.
    pub fn flag(&mut self, error: JobError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Derive the immune fee and nonce transitions, then narrow the raw
    /// accesses to `transitions()`. Idempotent.
    pub fn postprocess(&mut self) {
        if self.raw_accesses.is_empty() {
            return;
        }
        let sender_balance = path::balance(&self.sender);
        let coinbase_balance = path::balance(&self.coinbase);
        let sender_nonce = path::nonce(&self.sender);
        let fee = self.fee();

        let mut immune = Vec::with_capacity(3);
        let mut violation = None;

        // A sender mining its own block pays itself.
        let charges = if coinbase_balance == sender_balance {
            vec![(sender_balance.as_str(), NumericDelta::zero())]
        } else {
            vec![
                (sender_balance.as_str(), NumericDelta::debit(fee)),
                (coinbase_balance.as_str(), NumericDelta::credit(fee)),
            ]
        };
        for (balance, delta) in charges {
            let Some(entry) = self.raw_accesses.iter().find(|v| v.path == balance) else {
                continue;
            };
            match entry.fee_transition(delta) {
                Ok(transition) => immune.push(transition),
                Err(err) => {
                    violation = Some(JobError::InvariantViolation(format!("{balance}: {err}")))
                }
            }
        }

        for entry in self
            .raw_accesses
            .iter_mut()
            .filter(|v| v.path == sender_nonce && v.is_transition())
        {
            entry.persistent = true;
            immune.push(entry.clone());
        }

        sort_by_access(&mut immune);
        self.immune_transitions = immune;
        if let Some(err) = violation {
            warn!(tx_index = self.tx_index, %err, "Fee transition rejected");
            self.flag(err);
        }
        self.raw_accesses = self.transitions();
    }

    /// Drop every transition, immune ones included.
    pub(crate) fn discard_transitions(&mut self) {
        self.raw_accesses.clear();
        self.immune_transitions.clear();
    }
}
