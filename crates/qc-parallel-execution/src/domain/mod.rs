//! Domain module for parallel execution
//!
//! Contains values, versioned entries, paths, entities, conflicts, errors,
//! and invariants.

pub mod conflicts;
pub mod entities;
pub mod errors;
pub mod invariants;
pub mod path;
pub mod value_objects;
pub mod versioned;

pub use conflicts::*;
pub use entities::*;
pub use errors::*;
pub use value_objects::*;
pub use versioned::*;
