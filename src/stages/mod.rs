//! # Stage Model
//!
//! Ordered, named phases with monotonically increasing progress. Every
//! definition is wrapped in `initializing@0` and `complete@100`.

pub mod definition;
pub mod loader;

pub use definition::{Stage, StageDefinition, StageError, StageInfo};
pub use loader::{StageConfigLoader, StageFile};
