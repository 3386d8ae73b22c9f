//! Configuration for parallel execution

use serde::{Deserialize, Serialize};
use std::env;

use crate::domain::errors::ConfigError;

/// Execution configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Worker threads per generation
    pub degree_of_parallelism: usize,
    /// Worker threads shared by every generation of one context, nested
    /// generations included
    pub max_sub_processes: usize,
    /// Fewer sequences than this run on the calling thread
    pub parallel_threshold: usize,
    /// Maximum depth of nested frames and nested generations
    pub max_nesting_depth: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            degree_of_parallelism: cpus,
            max_sub_processes: cpus * 4,
            parallel_threshold: 2,
            max_nesting_depth: 16,
        }
    }
}

impl ExecutionConfig {
    /// Single worker, no thread pool.
    pub fn sequential() -> Self {
        Self {
            degree_of_parallelism: 1,
            max_sub_processes: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_parallelism(mut self, workers: usize) -> Self {
        self.degree_of_parallelism = workers;
        self.max_sub_processes = self.max_sub_processes.max(workers);
        self
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QC_EXEC_PARALLELISM`: workers per generation (default: CPU count)
    /// - `QC_EXEC_MAX_SUB_PROCESSES`: shared worker budget (default: 4 x CPU count)
    /// - `QC_EXEC_PARALLEL_THRESHOLD`: minimum sequences for a worker pool (default: 2)
    /// - `QC_EXEC_MAX_NESTING`: nesting depth limit (default: 16)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            degree_of_parallelism: env_usize(
                "QC_EXEC_PARALLELISM",
                defaults.degree_of_parallelism,
            )?,
            max_sub_processes: env_usize("QC_EXEC_MAX_SUB_PROCESSES", defaults.max_sub_processes)?,
            parallel_threshold: env_usize(
                "QC_EXEC_PARALLEL_THRESHOLD",
                defaults.parallel_threshold,
            )?,
            max_nesting_depth: env_usize("QC_EXEC_MAX_NESTING", defaults.max_nesting_depth)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("degree_of_parallelism", self.degree_of_parallelism),
            ("max_sub_processes", self.max_sub_processes),
            ("parallel_threshold", self.parallel_threshold),
            ("max_nesting_depth", self.max_nesting_depth),
        ];
        match fields.into_iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::Zero { field }),
            None => Ok(()),
        }
    }
}

fn env_usize(var: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(default),
    }
}
