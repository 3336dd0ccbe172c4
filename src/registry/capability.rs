//! # Capability Contract
//!
//! A capability is a named unit of work reachable over RPC as
//! `<name>.execute`. Every capability implements [`Capability::execute`];
//! capabilities that report staged progress also override
//! [`Capability::execute_stream`] and drive the supplied [`ProgressEmitter`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::constants::error_codes;
use crate::progress::{AdvanceMode, ErrorInfo, ProgressEmitter, ProgressError};
use crate::stages::StageDefinition;

/// Domain error raised by a capability
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CapabilityError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub recoverable: bool,
}

impl CapabilityError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            recoverable: true,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_INPUT, message).non_recoverable()
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_SERVICE_ERROR, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(error_codes::TIMEOUT_ERROR, message)
    }

    pub fn not_found(name: &str) -> Self {
        Self::new(
            error_codes::SERVICE_NOT_FOUND,
            format!("Service '{name}' not found"),
        )
        .non_recoverable()
    }

    pub fn cancelled() -> Self {
        Self::new(error_codes::CANCELLED, "Stream receiver went away")
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn non_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }

    /// Error object for a terminal `error` event
    pub fn to_error_info(&self, stage_failed: &str) -> ErrorInfo {
        ErrorInfo {
            code: self.code.clone(),
            message: self.message.clone(),
            stage_failed: stage_failed.to_string(),
            details: self.details.clone(),
            recoverable: self.recoverable,
        }
    }

    /// JSON form carried in a JSON-RPC error's `data`
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<ProgressError> for CapabilityError {
    fn from(err: ProgressError) -> Self {
        match err {
            ProgressError::StreamClosed => Self::cancelled(),
            other => Self::internal(other.to_string()),
        }
    }
}

/// A remotely callable unit of work
#[async_trait]
pub trait Capability: Send + Sync + fmt::Debug {
    /// Type name the method name is derived from, e.g. `TranslateService`
    fn type_name(&self) -> &str;

    /// Stages reported by `execute_stream`
    fn stages(&self) -> StageDefinition {
        StageDefinition::fallback()
    }

    fn advance_mode(&self) -> AdvanceMode {
        AdvanceMode::Sequential
    }

    async fn execute(&self, input: Value) -> Result<Value, CapabilityError>;

    /// Streaming variant. The returned value becomes the terminal success
    /// event unless the capability already emitted a terminal event itself.
    async fn execute_stream(
        &self,
        input: Value,
        emitter: &mut ProgressEmitter,
    ) -> Result<Value, CapabilityError> {
        let _ = emitter;
        self.execute(input).await
    }
}
