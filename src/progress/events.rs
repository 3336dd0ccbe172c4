//! Progress event payloads.
//!
//! Every invocation produces a sequence of `processing` events followed by
//! exactly one terminal `success` or `error` event. The `status` field is the
//! serde discriminator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::stages::{COMPLETE, COMPLETE_PROGRESS, ERROR, UNKNOWN_PROGRESS};

/// Substep and ETA details attached to a `processing` event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

impl ProgressDetails {
    pub fn is_empty(&self) -> bool {
        self.current_step.is_none() && self.total_steps.is_none() && self.eta_seconds.is_none()
    }
}

fn default_recoverable() -> bool {
    true
}

/// Error object carried by the terminal `error` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// UPPER_SNAKE_CASE error code, see [`crate::constants::error_codes`]
    pub code: String,
    pub message: String,
    pub stage_failed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default = "default_recoverable")]
    pub recoverable: bool,
}

impl ErrorInfo {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        stage_failed: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            stage_failed: stage_failed.into(),
            details: None,
            recoverable: true,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }
}

/// One event of an invocation's progress stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ProgressEvent {
    #[serde(rename = "processing")]
    Progress {
        progress: i32,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<ProgressDetails>,
    },

    #[serde(rename = "success")]
    Success {
        progress: i32,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },

    #[serde(rename = "error")]
    Error {
        progress: i32,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        error: ErrorInfo,
    },
}

impl ProgressEvent {
    pub fn progress(progress: i32, stage: impl Into<String>) -> Self {
        Self::Progress {
            progress,
            stage: stage.into(),
            timestamp: None,
            details: None,
        }
    }

    pub fn success(result: Option<Value>) -> Self {
        Self::Success {
            progress: COMPLETE_PROGRESS,
            stage: COMPLETE.to_string(),
            timestamp: None,
            result,
        }
    }

    pub fn error(error: ErrorInfo) -> Self {
        Self::Error {
            progress: UNKNOWN_PROGRESS,
            stage: ERROR.to_string(),
            timestamp: None,
            error,
        }
    }

    /// Attach details to a `processing` event; terminal events are unchanged
    pub fn with_details(mut self, new_details: ProgressDetails) -> Self {
        if let Self::Progress { details, .. } = &mut self {
            *details = (!new_details.is_empty()).then_some(new_details);
        }
        self
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        match &mut self {
            Self::Progress { timestamp, .. }
            | Self::Success { timestamp, .. }
            | Self::Error { timestamp, .. } => *timestamp = Some(at),
        }
        self
    }

    pub fn progress_value(&self) -> i32 {
        match self {
            Self::Progress { progress, .. }
            | Self::Success { progress, .. }
            | Self::Error { progress, .. } => *progress,
        }
    }

    pub fn stage(&self) -> &str {
        match self {
            Self::Progress { stage, .. } | Self::Success { stage, .. } | Self::Error { stage, .. } => {
                stage
            }
        }
    }

    pub fn status(&self) -> &'static str {
        use crate::constants::push::{STATUS_ERROR, STATUS_PROCESSING, STATUS_SUCCESS};
        match self {
            Self::Progress { .. } => STATUS_PROCESSING,
            Self::Success { .. } => STATUS_SUCCESS,
            Self::Error { .. } => STATUS_ERROR,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }

    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
