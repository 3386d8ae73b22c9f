//! # Driven Ports (SPI - Outbound)
//!
//! Collaborators the execution core depends on:
//! - Backing state (read-only during a generation)
//! - The interpreter running a single job
//! - The commit sink consuming cleared transitions
//!
//! Adapters implement these traits; `adapters` ships in-memory versions.

use serde::{Deserialize, Serialize};

use crate::domain::entities::{BlockContext, Execution, Message};
use crate::domain::errors::CommitError;
use crate::domain::value_objects::TypedValue;
use crate::domain::versioned::VersionedValue;
use crate::execution::context::TxContext;

// =============================================================================
// STATE VIEW
// =============================================================================

/// Read-only state a write cache cascades onto.
///
/// Implemented by backing stores and by views over a cache layer, which
/// lets nested generations stack on top of a running job.
pub trait StateView: Send + Sync {
    /// Value stored at `path`, `None` if absent.
    fn retrieve(&self, path: &str) -> Option<TypedValue>;

    /// Whether a value is stored at `path`.
    fn exists(&self, path: &str) -> bool {
        self.retrieve(path).is_some()
    }
}

// =============================================================================
// INTERPRETER
// =============================================================================

/// Executes one message against the job's cache layer.
///
/// All state access goes through `tx`. Failures are reported inside the
/// returned `Execution`, never by panicking.
pub trait Interpreter: Send + Sync {
    fn run(&self, message: &Message, block: &BlockContext, tx: &mut TxContext<'_, '_>) -> Execution;
}

// =============================================================================
// COMMIT SINK
// =============================================================================

/// Sequencing key of a commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitKey {
    pub block: u64,
    pub generation: u64,
}

/// Durable destination of cleared transitions.
pub trait CommitSink: Send + Sync {
    /// Apply `transitions` in order under `key`.
    fn commit(&self, key: CommitKey, transitions: &[VersionedValue]) -> Result<(), CommitError>;
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::BTreeMap;

    /// Fixed path/value table.
    #[derive(Default)]
    pub struct MockStateView {
        pub values: BTreeMap<String, TypedValue>,
    }

    impl MockStateView {
        pub fn with(mut self, path: &str, value: TypedValue) -> Self {
            self.values.insert(path.to_string(), value);
            self
        }
    }

    impl StateView for MockStateView {
        fn retrieve(&self, path: &str) -> Option<TypedValue> {
            self.values.get(path).cloned()
        }
    }
}
