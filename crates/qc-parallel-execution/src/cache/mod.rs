//! Cascading write cache
//!
//! - `WriteCache`: arena of layers over a read-only `StateView`
//! - `LayerView`: a layer seen as a `StateView`, for nested generations

mod view;
mod write_cache;

pub use view::LayerView;
pub use write_cache::{ExportFilter, LayerId, WriteCache};
