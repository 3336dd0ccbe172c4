//! Diagnostic echo capability (`echo.execute`).
//!
//! Returns its input together with a short acknowledgement. Workers expose it
//! for smoke tests of the whole request/reply path; `delay_ms` in the input
//! makes it wait before answering, which is handy for timeout checks.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::progress::ProgressEmitter;
use crate::registry::{Capability, CapabilityError};
use crate::stages::{Stage, StageDefinition};

const NO_MESSAGE: &str = "No message provided";

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoService;

impl EchoService {
    fn parse(input: &Value) -> Result<(String, Option<Duration>), CapabilityError> {
        let message = match input.get("message") {
            None | Some(Value::Null) => NO_MESSAGE.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(CapabilityError::invalid_input("'message' must be a string")),
        };
        let delay = match input.get("delay_ms") {
            None | Some(Value::Null) => None,
            Some(value) => Some(Duration::from_millis(value.as_u64().ok_or_else(|| {
                CapabilityError::invalid_input("'delay_ms' must be a non-negative integer")
            })?)),
        };
        Ok((message, delay))
    }

    fn reply(&self, message: &str, input: Value) -> Value {
        json!({
            "status": "success",
            "message": format!("Test service received: {message}"),
            "echo": input,
            "service": self.type_name(),
        })
    }
}

#[async_trait]
impl Capability for EchoService {
    fn type_name(&self) -> &str {
        "EchoService"
    }

    fn stages(&self) -> StageDefinition {
        StageDefinition::new(vec![
            Stage {
                id: "receiving".to_string(),
                progress: 30,
                supports_substeps: false,
                timeout_seconds: Some(10),
                description: Some("Validate the request".to_string()),
            },
            Stage {
                id: "echoing".to_string(),
                progress: 70,
                supports_substeps: true,
                timeout_seconds: Some(60),
                description: Some("Echo the message word by word".to_string()),
            },
        ])
    }

    async fn execute(&self, input: Value) -> Result<Value, CapabilityError> {
        let (message, delay) = Self::parse(&input)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        info!(message = %message, "EchoService executed");
        Ok(self.reply(&message, input))
    }

    async fn execute_stream(
        &self,
        input: Value,
        emitter: &mut ProgressEmitter,
    ) -> Result<Value, CapabilityError> {
        emitter.start().await?;
        emitter.advance(0).await?;
        let (message, delay) = Self::parse(&input)?;

        let words = message.split_whitespace().count() as u32;
        emitter.advance(words).await?;
        for _ in 0..words {
            if let Some(delay) = delay {
                tokio::time::sleep(delay / words).await;
            }
            emitter.substep().await?;
        }

        Ok(self.reply(&message, input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{AdvanceMode, ProgressEvent, ProgressTracker};

    #[tokio::test]
    async fn test_execute_echoes_input() {
        let result = EchoService
            .execute(json!({"message": "hello", "extra": 1}))
            .await
            .unwrap();
        assert_eq!(result["message"], "Test service received: hello");
        assert_eq!(result["echo"], json!({"message": "hello", "extra": 1}));
        assert_eq!(result["service"], "EchoService");
        assert_eq!(result["status"], "success");
    }

    #[tokio::test]
    async fn test_execute_without_message() {
        let result = EchoService.execute(json!({})).await.unwrap();
        assert_eq!(result["message"], "Test service received: No message provided");
    }

    #[tokio::test]
    async fn test_invalid_input() {
        let err = EchoService
            .execute(json!({"message": 42}))
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_INPUT");
        assert!(!err.recoverable);

        let err = EchoService
            .execute(json!({"delay_ms": "soon"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_INPUT");
    }

    #[test]
    fn test_stages_are_valid() {
        let stages = EchoService.stages();
        stages.validate_sequence().unwrap();
        let ids: Vec<&str> = stages.all_stages().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["initializing", "receiving", "echoing", "complete"]);
    }

    #[tokio::test]
    async fn test_stream_walks_stages() {
        let tracker = ProgressTracker::new(EchoService.stages(), AdvanceMode::Sequential);
        let (mut emitter, mut rx) = ProgressEmitter::channel(tracker, 16);
        let result = EchoService
            .execute_stream(json!({"message": "one two"}), &mut emitter)
            .await
            .unwrap();
        assert_eq!(result["message"], "Test service received: one two");
        drop(emitter);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let stages: Vec<&str> = events.iter().map(ProgressEvent::stage).collect();
        assert_eq!(
            stages,
            vec!["initializing", "receiving", "echoing", "echoing", "echoing"]
        );
        let progress: Vec<i32> = events.iter().map(ProgressEvent::progress_value).collect();
        assert_eq!(progress, vec![0, 30, 70, 85, 100]);
    }
}
