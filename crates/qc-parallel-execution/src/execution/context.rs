//! Execution and transaction contexts

use std::sync::Arc;
use tracing::debug;

use crate::cache::{LayerId, WriteCache};
use crate::config::ExecutionConfig;
use crate::domain::entities::BlockContext;
use crate::domain::errors::{CacheError, ExecutionError};
use crate::domain::value_objects::{Delta, TxIndex, TypedValue};
use crate::ports::outbound::Interpreter;

use super::budget::ResourceBudget;
use super::generation::Generation;

/// Everything a generation needs besides its parent state.
///
/// Cheap to clone; nested generations get a clone one level deeper.
#[derive(Clone)]
pub struct ExecutionContext {
    config: Arc<ExecutionConfig>,
    block: BlockContext,
    interpreter: Arc<dyn Interpreter>,
    budget: Arc<ResourceBudget>,
    nesting: usize,
}

impl ExecutionContext {
    pub fn new(
        config: ExecutionConfig,
        block: BlockContext,
        interpreter: Arc<dyn Interpreter>,
    ) -> Self {
        let budget = Arc::new(ResourceBudget::new(config.max_sub_processes));
        Self {
            config: Arc::new(config),
            block,
            interpreter,
            budget,
            nesting: 0,
        }
    }

    /// Share an existing budget, e.g. one owned by a service.
    #[must_use]
    pub fn with_budget(mut self, budget: Arc<ResourceBudget>) -> Self {
        self.budget = budget;
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn block(&self) -> &BlockContext {
        &self.block
    }

    pub fn interpreter(&self) -> &dyn Interpreter {
        self.interpreter.as_ref()
    }

    pub fn budget(&self) -> &ResourceBudget {
        &self.budget
    }

    /// Generation nesting level, 0 for top-level generations
    pub fn nesting(&self) -> usize {
        self.nesting
    }

    fn nested(&self) -> Self {
        Self {
            nesting: self.nesting + 1,
            ..self.clone()
        }
    }
}

/// State access handed to the interpreter for one job.
///
/// Every read and write is attributed to `tx_index` and lands in the job's
/// cache layer.
pub struct TxContext<'a, 'p> {
    ctx: &'a ExecutionContext,
    cache: &'a mut WriteCache<'p>,
    layer: LayerId,
    tx_index: TxIndex,
    depth: usize,
}

impl<'a, 'p> TxContext<'a, 'p> {
    pub fn new(
        ctx: &'a ExecutionContext,
        cache: &'a mut WriteCache<'p>,
        layer: LayerId,
        tx_index: TxIndex,
    ) -> Self {
        Self {
            ctx,
            cache,
            layer,
            tx_index,
            depth: 0,
        }
    }

    pub fn tx_index(&self) -> TxIndex {
        self.tx_index
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }

    pub fn context(&self) -> &ExecutionContext {
        self.ctx
    }

    /// Frame depth within this job
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Outermost frame of a top-level job
    pub fn is_top_level(&self) -> bool {
        self.depth == 0 && self.ctx.nesting == 0
    }

    pub fn read(&mut self, path: &str) -> Result<Option<TypedValue>, CacheError> {
        self.cache.read(self.layer, self.tx_index, path)
    }

    pub fn peek(&self, path: &str) -> Result<Option<TypedValue>, CacheError> {
        self.cache.peek(self.layer, path)
    }

    pub fn exists(&self, path: &str) -> Result<bool, CacheError> {
        self.cache.exists(self.layer, path)
    }

    pub fn write(&mut self, path: &str, value: Option<TypedValue>) -> Result<usize, CacheError> {
        self.cache.write(self.layer, self.tx_index, path, value)
    }

    pub fn write_delta(&mut self, path: &str, delta: Delta) -> Result<usize, CacheError> {
        self.cache.write_delta(self.layer, self.tx_index, path, delta)
    }

    /// Run `f` in a child frame.
    ///
    /// The frame's writes reach this frame only if `f` succeeds; on error
    /// they are discarded and the error is returned.
    pub fn nested<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut TxContext<'_, 'p>) -> Result<T, E>,
        E: From<CacheError>,
    {
        let max = self.ctx.config.max_nesting_depth;
        if self.depth + 1 > max {
            return Err(CacheError::NestingTooDeep { max }.into());
        }
        let child = self.cache.derive(self.layer)?;
        let outcome = {
            let mut frame = TxContext {
                ctx: self.ctx,
                cache: &mut *self.cache,
                layer: child,
                tx_index: self.tx_index,
                depth: self.depth + 1,
            };
            f(&mut frame)
        };
        match outcome {
            Ok(value) => {
                self.cache.fold(child)?;
                Ok(value)
            }
            Err(err) => {
                self.cache.release(child)?;
                Err(err)
            }
        }
    }

    /// Execute `generation` on top of this frame and merge its cleared
    /// transitions into it. Returns the number of transitions merged.
    pub fn spawn(&mut self, generation: &mut Generation) -> Result<usize, ExecutionError> {
        let max = self.ctx.config.max_nesting_depth;
        if self.ctx.nesting + 1 > max {
            return Err(CacheError::NestingTooDeep { max }.into());
        }
        let nested = self.ctx.nested();
        let transitions = {
            let view = self.cache.view(self.layer)?;
            generation.execute(&nested, &view)
        };
        let merged = transitions.len();
        self.cache.merge(self.layer, transitions)?;
        debug!(
            tx_index = self.tx_index,
            generation = generation.id(),
            nesting = nested.nesting,
            merged,
            "Nested generation merged"
        );
        Ok(merged)
    }
}
