//! # RPC Envelopes
//!
//! JSON-RPC 2.0 request/reply bodies and the broker envelope that carries a
//! request to the work queue. The request `id` always equals the AMQP
//! `correlation_id`; replies are matched on the property, never on the body.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::broker::{MessageProperties, OutgoingMessage};
use super::errors::{MessagingError, MessagingResult};
use crate::constants::jsonrpc::VERSION;

/// Caller-generated identifier tying a reply to its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A request ready to be sent to the RPC work queue
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub method: String,
    pub params: Map<String, Value>,
    pub correlation_id: CorrelationId,
    pub reply_to: String,
}

impl RequestEnvelope {
    pub fn new(
        method: impl Into<String>,
        params: Map<String, Value>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            params,
            correlation_id: CorrelationId::new(),
            reply_to: reply_to.into(),
        }
    }

    pub fn to_request(&self) -> RpcRequest {
        RpcRequest {
            jsonrpc: VERSION.to_string(),
            method: self.method.clone(),
            params: Value::Object(self.params.clone()),
            id: Some(Value::String(self.correlation_id.to_string())),
        }
    }

    /// Persistent JSON message addressed back to `reply_to`
    pub fn to_outgoing(&self) -> MessagingResult<OutgoingMessage> {
        let body = serde_json::to_vec(&self.to_request())
            .map_err(|e| MessagingError::message_serialization(e.to_string()))?;
        let properties = MessageProperties::json(self.correlation_id.to_string())
            .with_reply_to(self.reply_to.clone())
            .persistent();
        Ok(OutgoingMessage::new(properties, body))
    }
}

/// JSON-RPC 2.0 request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 reply body: exactly one of `result` / `error` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    #[serde(default)]
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_bytes(&self) -> MessagingResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| MessagingError::message_serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> MessagingResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_id_matches_correlation_id() {
        let mut params = Map::new();
        params.insert("text".to_string(), json!("hola"));
        let envelope = RequestEnvelope::new("translate.execute", params, "amq.gen-reply");

        let outgoing = envelope.to_outgoing().unwrap();
        let body: Value = serde_json::from_slice(&outgoing.body).unwrap();
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["method"], "translate.execute");
        assert_eq!(body["params"]["text"], "hola");
        assert_eq!(body["id"], json!(envelope.correlation_id.to_string()));

        let props = &outgoing.properties;
        assert_eq!(
            props.correlation_id.as_deref(),
            Some(envelope.correlation_id.to_string().as_str())
        );
        assert_eq!(props.reply_to.as_deref(), Some("amq.gen-reply"));
        assert_eq!(props.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn test_correlation_ids_are_unique_and_parseable() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<CorrelationId>().unwrap(), a);
        assert!("not-a-uuid".parse::<CorrelationId>().is_err());
    }

    #[test]
    fn test_response_shapes() {
        let ok = RpcResponse::success(json!("1"), json!({"x": 1}));
        let encoded: Value = serde_json::from_slice(&ok.to_bytes().unwrap()).unwrap();
        assert!(encoded.get("error").is_none());
        assert_eq!(encoded["result"]["x"], 1);

        let err = RpcResponse::error(Value::Null, -32601, "Method not found", None);
        let encoded: Value = serde_json::from_slice(&err.to_bytes().unwrap()).unwrap();
        assert!(encoded.get("result").is_none());
        assert_eq!(encoded["error"]["code"], -32601);
        assert_eq!(encoded["id"], Value::Null);
    }

    #[test]
    fn test_request_without_params_defaults_to_empty_object() {
        let request: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"echo.execute","id":"7"}"#)
                .unwrap();
        assert_eq!(request.params, json!({}));
    }
}
