//! Parallel Execution Service
//!
//! Main service implementing ParallelExecutionApi.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ExecutionConfig;
use crate::domain::entities::BlockContext;
use crate::domain::errors::{ConfigError, ExecutionError};
use crate::execution::{ExecutionContext, Generation, GenerationOutcome, ResourceBudget};
use crate::ports::inbound::{BlockOutcome, ParallelExecutionApi};
use crate::ports::outbound::{CommitKey, CommitSink, Interpreter, StateView};

/// Parallel Execution Service
///
/// Orchestrates one block:
/// 1. Run a generation against committed state
/// 2. Commit its cleared transitions
/// 3. Move on to the next generation, which sees them
///
/// Generations run on the blocking pool; every generation of the service
/// shares one worker budget.
pub struct ParallelExecutionService<S> {
    store: Arc<S>,
    interpreter: Arc<dyn Interpreter>,
    config: Arc<ExecutionConfig>,
    budget: Arc<ResourceBudget>,
}

impl<S> Clone for ParallelExecutionService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            interpreter: Arc::clone(&self.interpreter),
            config: Arc::clone(&self.config),
            budget: Arc::clone(&self.budget),
        }
    }
}

impl<S> ParallelExecutionService<S>
where
    S: StateView + CommitSink + 'static,
{
    /// Create a new service with a validated config
    pub fn new(
        store: Arc<S>,
        interpreter: Arc<dyn Interpreter>,
        config: ExecutionConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let budget = Arc::new(ResourceBudget::new(config.max_sub_processes));
        Ok(Self {
            store,
            interpreter,
            config: Arc::new(config),
            budget,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Execution context for `block`, sharing the service budget.
    pub fn context(&self, block: BlockContext) -> ExecutionContext {
        ExecutionContext::new((*self.config).clone(), block, Arc::clone(&self.interpreter))
            .with_budget(Arc::clone(&self.budget))
    }

    /// Empty generation using the configured parallelism.
    pub fn generation(&self, id: u64) -> Generation {
        Generation::new(id, self.config.degree_of_parallelism)
    }

    /// Execute and commit on the calling thread.
    pub fn run_generation(
        &self,
        ctx: &ExecutionContext,
        mut generation: Generation,
    ) -> Result<GenerationOutcome, ExecutionError> {
        let outcome = generation.execute_detailed(ctx, self.store.as_ref());
        let key = CommitKey {
            block: ctx.block().number,
            generation: generation.id(),
        };
        if let Err(err) = self.store.commit(key, &outcome.transitions) {
            warn!(block = key.block, generation = key.generation, %err, "Commit rejected");
            return Err(err.into());
        }
        Ok(outcome)
    }

    fn run_block(
        &self,
        block: BlockContext,
        generations: Vec<Generation>,
    ) -> Result<BlockOutcome, ExecutionError> {
        let ctx = self.context(block);
        let mut outcome = BlockOutcome {
            block_number: ctx.block().number,
            generations: Vec::with_capacity(generations.len()),
        };
        for generation in generations {
            outcome.generations.push(self.run_generation(&ctx, generation)?);
        }
        let stats = outcome.stats();
        info!(
            block = outcome.block_number,
            generations = stats.generations,
            jobs = stats.jobs,
            conflicting_sequences = stats.conflicting_sequences,
            transitions = stats.transitions,
            "Block executed"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl<S> ParallelExecutionApi for ParallelExecutionService<S>
where
    S: StateView + CommitSink + 'static,
{
    async fn execute_generation(
        &self,
        block: BlockContext,
        generation: Generation,
    ) -> Result<GenerationOutcome, ExecutionError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || {
            let ctx = service.context(block);
            service.run_generation(&ctx, generation)
        })
        .await
        .map_err(|e| ExecutionError::WorkerFailed(e.to_string()))?
    }

    async fn execute_block(
        &self,
        block: BlockContext,
        generations: Vec<Generation>,
    ) -> Result<BlockOutcome, ExecutionError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.run_block(block, generations))
            .await
            .map_err(|e| ExecutionError::WorkerFailed(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryStore, Op, ScriptedInterpreter, BASE_GAS, OP_GAS};
    use crate::domain::entities::Message;
    use crate::domain::path;
    use crate::domain::value_objects::{Address, TxIndex, TypedValue};
    use crate::execution::{Job, JobSequence};
    use primitive_types::U256;

    fn addr(v: u64) -> Address {
        Address::from_low_u64_be(v)
    }

    fn paying_job(tx: TxIndex, from: u64, to: u64) -> Job {
        Job::new(tx, Message::call(addr(from), addr(to)).with_gas(100_000, U256::one()))
    }

    fn service(interpreter: ScriptedInterpreter) -> ParallelExecutionService<InMemoryStore> {
        let store = InMemoryStore::new();
        for account in 1..=4 {
            store.fund_account(&addr(account), U256::from(1_000_000)).unwrap();
        }
        store.fund_account(&addr(99), U256::zero()).unwrap();
        ParallelExecutionService::new(
            Arc::new(store),
            Arc::new(interpreter),
            ExecutionConfig::sequential().with_parallelism(2),
        )
        .unwrap()
    }

    fn block() -> BlockContext {
        BlockContext {
            number: 7,
            ..BlockContext::default()
        }
        .with_coinbase(addr(99))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ExecutionConfig {
            max_sub_processes: 0,
            ..ExecutionConfig::default()
        };
        let result = ParallelExecutionService::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ScriptedInterpreter::new()),
            config,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_execute_generation_commits() {
        let interpreter = ScriptedInterpreter::new()
            .with_fees()
            .script(1, vec![Op::Transfer(addr(3), U256::from(500))])
            .script(2, vec![Op::Transfer(addr(4), U256::from(700))]);
        let service = service(interpreter);
        let mut generation = service.generation(1);
        generation.add(JobSequence::with_jobs(1, vec![paying_job(1, 1, 3)]));
        generation.add(JobSequence::with_jobs(2, vec![paying_job(2, 2, 4)]));

        let outcome = service.execute_generation(block(), generation).await.unwrap();
        assert!(outcome.conflicts.is_empty());

        let store = service.store();
        let fee = U256::from(BASE_GAS + OP_GAS);
        assert_eq!(store.balance(&addr(1)), U256::from(1_000_000 - 500) - fee);
        assert_eq!(store.balance(&addr(3)), U256::from(1_000_500));
        assert_eq!(store.balance(&addr(99)), fee * 2);
        assert_eq!(store.nonce(&addr(1)), U256::one());
        assert_eq!(store.commits(), vec![CommitKey { block: 7, generation: 1 }]);
    }

    #[tokio::test]
    async fn test_execute_block_chains_generations() {
        let source = path::storage_slot(&addr(1), "k");
        let target = path::storage_slot(&addr(2), "k");
        let interpreter = ScriptedInterpreter::new()
            .script(1, vec![Op::Write(source.clone(), Some(TypedValue::plain(vec![1])))])
            .script(2, vec![Op::Copy(source, target)]);
        let service = service(interpreter);

        let mut first = service.generation(1);
        first.add(JobSequence::with_jobs(1, vec![Job::new(1, Message::call(addr(1), addr(1)))]));
        let mut second = service.generation(2);
        second.add(JobSequence::with_jobs(1, vec![Job::new(2, Message::call(addr(2), addr(2)))]));

        let outcome = service.execute_block(block(), vec![first, second]).await.unwrap();
        assert_eq!(outcome.generations.len(), 2);
        assert_eq!(outcome.stats().generations, 2);
        assert_eq!(
            service.store().value(&path::storage_slot(&addr(2), "k")),
            Some(TypedValue::plain(vec![1]))
        );
        assert_eq!(service.store().commits().len(), 2);
    }

    #[tokio::test]
    async fn test_conflicting_generation_reports_losers() {
        let slot = path::storage_slot(&addr(1), "shared");
        let interpreter = ScriptedInterpreter::new()
            .script(1, vec![Op::Write(slot.clone(), Some(TypedValue::plain(vec![1])))])
            .script(2, vec![Op::Write(slot.clone(), Some(TypedValue::plain(vec![2])))]);
        let service = service(interpreter);
        let mut generation = service.generation(1);
        let first = Job::new(1, Message::call(addr(1), addr(1)));
        let second = Job::new(2, Message::call(addr(2), addr(1)));
        generation.add(JobSequence::with_jobs(1, vec![first]));
        generation.add(JobSequence::with_jobs(2, vec![second]));

        let outcome = service.execute_generation(block(), generation).await.unwrap();
        assert!(outcome.conflicts.contains(2));
        assert_eq!(outcome.stats.flagged_jobs, 1);
        assert_eq!(
            service.store().value(&slot),
            Some(TypedValue::plain(vec![1]))
        );
    }
}
