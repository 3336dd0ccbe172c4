//! Per-invocation progress state.
//!
//! A [`ProgressTracker`] walks a [`StageDefinition`] either in declaration
//! order ([`AdvanceMode::Sequential`], via `next_stage`) or by naming stages
//! directly ([`AdvanceMode::Manual`], via `set_stage`). The two styles cannot
//! be mixed on one tracker.
//!
//! While a stage has substeps, progress is interpolated linearly toward the
//! next stage's declared progress. ETA assumes uniform work per percent and
//! is only a rough estimate.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use super::events::{ErrorInfo, ProgressDetails, ProgressEvent};
use crate::constants::stages::COMPLETE_PROGRESS;
use crate::stages::{Stage, StageDefinition};

/// How an invocation moves between stages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdvanceMode {
    /// `next_stage` walks the declared order
    #[default]
    Sequential,
    /// `set_stage` jumps to named stages
    Manual,
}

impl fmt::Display for AdvanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProgressError {
    #[error("'{operation}' is not allowed on a {mode} tracker")]
    ModeMismatch {
        mode: AdvanceMode,
        operation: &'static str,
    },

    #[error("No stage after '{current}'")]
    NoMoreStages { current: String },

    #[error("Unknown stage: '{id}'")]
    UnknownStage { id: String },

    #[error("Progress stream receiver was dropped")]
    StreamClosed,

    #[error("Progress stream already ended with a terminal event")]
    AlreadyTerminated,
}

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    definition: StageDefinition,
    mode: AdvanceMode,
    stage_index: usize,
    current_substep: u32,
    total_substeps: u32,
    started_at: Option<Instant>,
    include_timestamps: bool,
}

impl ProgressTracker {
    pub fn new(definition: StageDefinition, mode: AdvanceMode) -> Self {
        Self {
            definition,
            mode,
            stage_index: 0,
            current_substep: 0,
            total_substeps: 0,
            started_at: None,
            include_timestamps: false,
        }
    }

    pub fn with_timestamps(mut self, include: bool) -> Self {
        self.include_timestamps = include;
        self
    }

    pub fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    pub fn mode(&self) -> AdvanceMode {
        self.mode
    }

    pub fn start_tracking(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn is_tracking(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| start.elapsed())
    }

    pub fn current_stage(&self) -> &Stage {
        // stage_index only ever holds indices returned by the definition
        &self.definition.all_stages()[self.stage_index]
    }

    pub fn current_stage_id(&self) -> &str {
        &self.current_stage().id
    }

    pub fn current_substep(&self) -> u32 {
        self.current_substep
    }

    pub fn total_substeps(&self) -> u32 {
        self.total_substeps
    }

    /// Advance to the following stage. `total_substeps` of 0 disables
    /// interpolation for the new stage.
    pub fn next_stage(&mut self, total_substeps: u32) -> Result<&Stage, ProgressError> {
        self.require_mode(AdvanceMode::Sequential, "next_stage")?;

        let next = self.stage_index + 1;
        if next >= self.definition.all_stages().len() {
            return Err(ProgressError::NoMoreStages {
                current: self.current_stage_id().to_string(),
            });
        }
        self.enter(next, total_substeps);
        Ok(self.current_stage())
    }

    /// Jump to the stage named `id`
    pub fn set_stage(&mut self, id: &str, total_substeps: u32) -> Result<&Stage, ProgressError> {
        self.require_mode(AdvanceMode::Manual, "set_stage")?;

        let index = self
            .definition
            .index_of(id)
            .ok_or_else(|| ProgressError::UnknownStage { id: id.to_string() })?;
        self.enter(index, total_substeps);
        Ok(self.current_stage())
    }

    pub fn increment_substep(&mut self) {
        self.current_substep = (self.current_substep + 1).min(self.total_substeps);
    }

    pub fn set_substep(&mut self, step: u32) {
        self.current_substep = step.min(self.total_substeps);
    }

    /// Declared progress of the current stage, interpolated toward the next
    /// stage while substeps are active; truncated and capped at 100
    pub fn current_progress(&self) -> i32 {
        let base = self.current_stage().progress;
        if self.total_substeps == 0 {
            return base.min(COMPLETE_PROGRESS);
        }

        let Some(next) = self.definition.all_stages().get(self.stage_index + 1) else {
            return base.min(COMPLETE_PROGRESS);
        };

        let span = i64::from(next.progress - base);
        let advanced = span * i64::from(self.current_substep) / i64::from(self.total_substeps);
        (i64::from(base) + advanced).min(i64::from(COMPLETE_PROGRESS)) as i32
    }

    /// Remaining time assuming the elapsed time bought `progress` percent
    pub fn eta(&self, progress: i32) -> Option<Duration> {
        let elapsed = self.elapsed()?;
        if progress <= 0 {
            return None;
        }
        let factor = (f64::from(COMPLETE_PROGRESS) / f64::from(progress) - 1.0).max(0.0);
        Some(elapsed.mul_f64(factor))
    }

    pub fn progress_event(&self, include_eta: bool) -> ProgressEvent {
        let progress = self.current_progress();
        let mut details = ProgressDetails::default();
        if self.total_substeps > 0 {
            details.current_step = Some(self.current_substep);
            details.total_steps = Some(self.total_substeps);
        }
        if include_eta {
            details.eta_seconds = self.eta(progress).map(|eta| eta.as_secs_f64().round() as u64);
        }

        let event = ProgressEvent::progress(progress, self.current_stage_id()).with_details(details);
        self.stamp(event)
    }

    pub fn success_event(&self, result: Option<Value>) -> ProgressEvent {
        self.stamp(ProgressEvent::success(result))
    }

    pub fn error_event(
        &self,
        code: &str,
        message: &str,
        details: Option<String>,
        recoverable: bool,
    ) -> ProgressEvent {
        let mut info =
            ErrorInfo::new(code, message, self.current_stage_id()).recoverable(recoverable);
        info.details = details;
        self.stamp(ProgressEvent::error(info))
    }

    fn stamp(&self, event: ProgressEvent) -> ProgressEvent {
        if self.include_timestamps {
            event.with_timestamp(Utc::now())
        } else {
            event
        }
    }

    fn enter(&mut self, index: usize, total_substeps: u32) {
        self.stage_index = index;
        self.current_substep = 0;
        self.total_substeps = total_substeps;
    }

    fn require_mode(
        &self,
        expected: AdvanceMode,
        operation: &'static str,
    ) -> Result<(), ProgressError> {
        if self.mode == expected {
            Ok(())
        } else {
            Err(ProgressError::ModeMismatch {
                mode: self.mode,
                operation,
            })
        }
    }
}
