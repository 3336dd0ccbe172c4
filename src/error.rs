//! # Error Types
//!
//! [`MediaflowError`] is the crate-level error: every module keeps its own
//! structured error type and converts into this one at the edges (startup,
//! the worker binary, embedding applications).

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::{MessagingError, RpcCallError};
use crate::progress::ProgressError;
use crate::registry::{CapabilityError, RegistryError};
use crate::stages::StageError;

#[derive(Error, Debug)]
pub enum MediaflowError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("RPC call failed: {0}")]
    RpcCall(#[from] RpcCallError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Stage definition error: {0}")]
    Stage(#[from] StageError),

    #[error("Progress error: {0}")]
    Progress(#[from] ProgressError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),
}

impl MediaflowError {
    /// Whether retrying the failed operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Messaging(e) => e.is_transient(),
            Self::RpcCall(e) => e.is_retryable(),
            Self::Capability(e) => e.recoverable,
            Self::Configuration(_) | Self::Registry(_) | Self::Stage(_) | Self::Progress(_) => {
                false
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_and_retryability() {
        let err: MediaflowError = RpcCallError::NotConnected.into();
        assert!(err.is_retryable());

        let err: MediaflowError = CapabilityError::invalid_input("bad").into();
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Capability error: INVALID_INPUT: bad");

        let err: MediaflowError = StageError::DuplicateId { id: "x".into() }.into();
        assert!(!err.is_retryable());
    }
}
