//! # Progress Tracking
//!
//! Per-invocation stage tracking, interpolated progress, ETA and the
//! standardized `processing` / `success` / `error` payloads.

pub mod emitter;
pub mod events;
pub mod tracker;

pub use emitter::ProgressEmitter;
pub use events::{ErrorInfo, ProgressDetails, ProgressEvent};
pub use tracker::{AdvanceMode, ProgressError, ProgressTracker};
