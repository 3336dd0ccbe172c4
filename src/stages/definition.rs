//! Stage definitions: the ordered phases a capability reports progress through.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::stages::{
    COMPLETE, COMPLETE_PROGRESS, INITIALIZING, INITIALIZING_PROGRESS, UNKNOWN_PROGRESS,
};

/// Errors raised while building or validating stage lists
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("Stage id must be snake_case: '{id}'")]
    InvalidId { id: String },

    #[error("Stage '{id}' progress must be within 0..=100, got {progress}")]
    ProgressOutOfRange { id: String, progress: i32 },

    #[error("Stage '{id}' progress {progress} does not increase over '{previous_id}' ({previous_progress})")]
    NonIncreasing {
        id: String,
        progress: i32,
        previous_id: String,
        previous_progress: i32,
    },

    #[error("Duplicate stage id: '{id}'")]
    DuplicateId { id: String },

    #[error("Failed to load stage file '{path}': {reason}")]
    Load { path: String, reason: String },
}

fn is_snake_case(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && id.chars().any(|c| c.is_ascii_lowercase())
}

/// One named phase of a capability's work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub progress: i32,
    #[serde(default)]
    pub supports_substeps: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Stage {
    /// Create a stage, validating the id format and progress range
    pub fn new(id: impl Into<String>, progress: i32) -> Result<Self, StageError> {
        let stage = Self {
            id: id.into(),
            progress,
            supports_substeps: false,
            timeout_seconds: None,
            description: None,
        };
        stage.validate()?;
        Ok(stage)
    }

    pub fn with_substeps(mut self) -> Self {
        self.supports_substeps = true;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn validate(&self) -> Result<(), StageError> {
        if !is_snake_case(&self.id) {
            return Err(StageError::InvalidId {
                id: self.id.clone(),
            });
        }
        if !(0..=100).contains(&self.progress) {
            return Err(StageError::ProgressOutOfRange {
                id: self.id.clone(),
                progress: self.progress,
            });
        }
        Ok(())
    }

    fn builtin(id: &str, progress: i32) -> Self {
        Self {
            id: id.to_string(),
            progress,
            supports_substeps: false,
            timeout_seconds: None,
            description: None,
        }
    }
}

/// Summary of one stage for logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageInfo {
    pub id: String,
    pub progress: i32,
    pub supports_substeps: bool,
    pub timeout_seconds: Option<u64>,
}

/// A capability's own stages wrapped in `initializing` / `complete`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    own: Vec<Stage>,
    all: Vec<Stage>,
}

impl StageDefinition {
    /// Wrap `stages`; call [`validate_sequence`](Self::validate_sequence)
    /// before relying on ordering
    pub fn new(stages: Vec<Stage>) -> Self {
        let mut all = Vec::with_capacity(stages.len() + 2);
        all.push(Stage::builtin(INITIALIZING, INITIALIZING_PROGRESS));
        all.extend(stages.iter().cloned());
        all.push(Stage::builtin(COMPLETE, COMPLETE_PROGRESS));
        Self { own: stages, all }
    }

    /// Wrap and validate in one step
    pub fn validated(stages: Vec<Stage>) -> Result<Self, StageError> {
        let definition = Self::new(stages);
        definition.validate_sequence()?;
        Ok(definition)
    }

    /// Single `processing@50` stage with substeps and a 300s timeout
    pub fn fallback() -> Self {
        Self::new(vec![Stage {
            id: "processing".to_string(),
            progress: 50,
            supports_substeps: true,
            timeout_seconds: Some(300),
            description: None,
        }])
    }

    pub fn own_stages(&self) -> &[Stage] {
        &self.own
    }

    pub fn all_stages(&self) -> &[Stage] {
        &self.all
    }

    pub fn stage_by_id(&self, id: &str) -> Option<&Stage> {
        self.all.iter().find(|s| s.id == id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.all.iter().position(|s| s.id == id)
    }

    /// Declared progress of `id`, or -1 when unknown
    pub fn progress_for(&self, id: &str) -> i32 {
        self.stage_by_id(id)
            .map(|s| s.progress)
            .unwrap_or(UNKNOWN_PROGRESS)
    }

    /// Strictly increasing progress up to (not including) `complete`, and
    /// unique ids across the whole list
    pub fn validate_sequence(&self) -> Result<(), StageError> {
        for stage in &self.own {
            stage.validate()?;
        }

        let last = self.all.len() - 1;
        for i in 1..last {
            let (previous, current) = (&self.all[i - 1], &self.all[i]);
            if current.progress <= previous.progress {
                return Err(StageError::NonIncreasing {
                    id: current.id.clone(),
                    progress: current.progress,
                    previous_id: previous.id.clone(),
                    previous_progress: previous.progress,
                });
            }
        }

        let mut seen = std::collections::HashSet::with_capacity(self.all.len());
        for stage in &self.all {
            if !seen.insert(stage.id.as_str()) {
                return Err(StageError::DuplicateId {
                    id: stage.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// The stage after `id`; `None` for `complete` or an unknown id
    pub fn next_stage(&self, id: &str) -> Option<&Stage> {
        self.index_of(id).and_then(|i| self.all.get(i + 1))
    }

    pub fn stage_info(&self) -> Vec<StageInfo> {
        self.all
            .iter()
            .map(|s| StageInfo {
                id: s.id.clone(),
                progress: s.progress,
                supports_substeps: s.supports_substeps,
                timeout_seconds: s.timeout_seconds,
            })
            .collect()
    }
}

impl Default for StageDefinition {
    fn default() -> Self {
        Self::fallback()
    }
}
