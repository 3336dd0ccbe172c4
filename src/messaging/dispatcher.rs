//! # JSON-RPC Dispatcher
//!
//! Turns a raw request body into exactly one [`RpcResponse`]. Dispatch never
//! fails: malformed bodies, unknown methods and capability errors all become
//! JSON-RPC error replies.
//!
//! | Condition                          | Code     |
//! |------------------------------------|----------|
//! | body is not JSON                   | `-32700` |
//! | not a JSON-RPC 2.0 request object  | `-32600` |
//! | method not registered              | `-32601` |
//! | `params` is not an object          | `-32602` |
//! | capability panicked                | `-32603` |
//! | capability returned an error       | `-32000` |

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use super::envelope::{RpcRequest, RpcResponse};
use crate::constants::jsonrpc::{
    CAPABILITY_ERROR, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
    PARSE_ERROR, VERSION,
};
use crate::registry::CapabilityRegistry;

/// A response together with the method it answered, when the body
/// decoded far enough to name one
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub method: Option<String>,
    pub response: RpcResponse,
}

#[derive(Debug, Clone)]
pub struct JsonRpcDispatcher {
    registry: Arc<CapabilityRegistry>,
}

impl JsonRpcDispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Decode and dispatch one request body
    pub async fn handle_raw(&self, body: &[u8]) -> RpcResponse {
        self.dispatch_raw(body).await.response
    }

    /// [`handle_raw`](Self::handle_raw), keeping the decoded method name
    pub async fn dispatch_raw(&self, body: &[u8]) -> DispatchOutcome {
        let rejected = |response| DispatchOutcome {
            method: None,
            response,
        };

        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Request body is not valid JSON");
                return rejected(RpcResponse::error(
                    Value::Null,
                    PARSE_ERROR,
                    "Parse error",
                    Some(json!(e.to_string())),
                ));
            }
        };

        let id = value.get("id").cloned().unwrap_or(Value::Null);
        if value.get("jsonrpc").and_then(Value::as_str) != Some(VERSION) {
            return rejected(RpcResponse::error(
                id,
                INVALID_REQUEST,
                "Invalid Request",
                Some(json!("jsonrpc must be \"2.0\"")),
            ));
        }

        match serde_json::from_value::<RpcRequest>(value) {
            Ok(request) => {
                let method = request.method.clone();
                DispatchOutcome {
                    method: Some(method),
                    response: self.dispatch(request).await,
                }
            }
            Err(e) => rejected(RpcResponse::error(
                id,
                INVALID_REQUEST,
                "Invalid Request",
                Some(json!(e.to_string())),
            )),
        }
    }

    /// Route a decoded request to its capability
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id.clone().unwrap_or(Value::Null);

        let Some(entry) = self.registry.get(&request.method) else {
            warn!(method = %request.method, "Method not found");
            return RpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                "Method not found",
                Some(json!({ "method": request.method })),
            );
        };

        if !request.params.is_object() {
            return RpcResponse::error(
                id,
                INVALID_PARAMS,
                "Invalid params",
                Some(json!("params must be an object")),
            );
        }

        let capability = Arc::clone(entry.capability());
        let params = request.params;
        let started = Instant::now();

        // A panicking capability only takes its own task down
        let outcome = tokio::spawn(async move { capability.execute(params).await }).await;

        match outcome {
            Ok(Ok(result)) => {
                debug!(
                    method = %request.method,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Capability executed"
                );
                RpcResponse::success(id, result)
            }
            Ok(Err(capability_error)) => {
                warn!(
                    method = %request.method,
                    code = %capability_error.code,
                    message = %capability_error.message,
                    "Capability returned an error"
                );
                RpcResponse::error(
                    id,
                    CAPABILITY_ERROR,
                    capability_error.message.clone(),
                    Some(capability_error.to_value()),
                )
            }
            Err(join_error) => {
                error!(method = %request.method, error = %join_error, "Capability task failed");
                RpcResponse::error(
                    id,
                    INTERNAL_ERROR,
                    "Internal error",
                    Some(json!(join_error.to_string())),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Capability, CapabilityError};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Upper;

    #[async_trait]
    impl Capability for Upper {
        fn type_name(&self) -> &str {
            "UpperService"
        }

        async fn execute(&self, input: Value) -> Result<Value, CapabilityError> {
            match input.get("text").and_then(Value::as_str) {
                Some("panic") => panic!("capability blew up"),
                Some(text) => Ok(json!({ "text": text.to_uppercase() })),
                None => Err(CapabilityError::invalid_input("missing 'text'")),
            }
        }
    }

    fn dispatcher() -> JsonRpcDispatcher {
        let registry = CapabilityRegistry::build(vec![Arc::new(Upper) as Arc<dyn Capability>]).unwrap();
        JsonRpcDispatcher::new(Arc::new(registry))
    }

    fn error_code(response: &RpcResponse) -> i64 {
        response.error.as_ref().map(|e| e.code).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_successful_call() {
        let response = dispatcher()
            .handle_raw(br#"{"jsonrpc":"2.0","method":"upper.execute","params":{"text":"hola"},"id":"abc"}"#)
            .await;
        assert_eq!(response.result, Some(json!({"text": "HOLA"})));
        assert_eq!(response.id, json!("abc"));
    }

    #[tokio::test]
    async fn test_dispatch_raw_reports_method() {
        let d = dispatcher();
        let outcome = d
            .dispatch_raw(br#"{"jsonrpc":"2.0","method":"nope.execute","params":{},"id":8}"#)
            .await;
        assert_eq!(outcome.method.as_deref(), Some("nope.execute"));
        assert_eq!(error_code(&outcome.response), METHOD_NOT_FOUND);

        let outcome = d.dispatch_raw(b"{not json").await;
        assert_eq!(outcome.method, None);
        assert_eq!(error_code(&outcome.response), PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_parse_error() {
        let response = dispatcher().handle_raw(b"{not json").await;
        assert_eq!(error_code(&response), PARSE_ERROR);
        assert_eq!(response.id, Value::Null);
    }

    #[tokio::test]
    async fn test_invalid_request() {
        let d = dispatcher();
        let response = d.handle_raw(br#"{"method":"upper.execute","id":1}"#).await;
        assert_eq!(error_code(&response), INVALID_REQUEST);
        assert_eq!(response.id, json!(1));

        let response = d.handle_raw(br#"{"jsonrpc":"2.0","id":2}"#).await;
        assert_eq!(error_code(&response), INVALID_REQUEST);

        let response = d.handle_raw(br#"[1,2,3]"#).await;
        assert_eq!(error_code(&response), INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let response = dispatcher()
            .handle_raw(br#"{"jsonrpc":"2.0","method":"nope.execute","params":{},"id":3}"#)
            .await;
        assert_eq!(error_code(&response), METHOD_NOT_FOUND);
        assert_eq!(response.error.unwrap().data, Some(json!({"method": "nope.execute"})));
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let response = dispatcher()
            .handle_raw(br#"{"jsonrpc":"2.0","method":"upper.execute","params":[1],"id":4}"#)
            .await;
        assert_eq!(error_code(&response), INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_missing_params_default_to_empty_object() {
        let response = dispatcher()
            .handle_raw(br#"{"jsonrpc":"2.0","method":"upper.execute","id":5}"#)
            .await;
        // reaches the capability, which rejects the missing field
        assert_eq!(error_code(&response), CAPABILITY_ERROR);
    }

    #[tokio::test]
    async fn test_capability_error_carries_error_object() {
        let response = dispatcher()
            .handle_raw(br#"{"jsonrpc":"2.0","method":"upper.execute","params":{},"id":6}"#)
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, CAPABILITY_ERROR);
        assert_eq!(error.message, "missing 'text'");
        let data = error.data.unwrap();
        assert_eq!(data["code"], "INVALID_INPUT");
        assert_eq!(data["recoverable"], false);
    }

    #[tokio::test]
    async fn test_panicking_capability_becomes_internal_error() {
        let response = dispatcher()
            .handle_raw(br#"{"jsonrpc":"2.0","method":"upper.execute","params":{"text":"panic"},"id":7}"#)
            .await;
        assert_eq!(error_code(&response), INTERNAL_ERROR);
        assert_eq!(response.id, json!(7));
    }
}
