//! # System Constants
//!
//! Queue names, stage identifiers, JSON-RPC codes and push-event constants
//! shared by the transport and streaming layers.

/// Broker-level defaults
pub mod broker {
    /// Durable work queue every worker consumes from
    pub const DEFAULT_RPC_QUEUE: &str = "rpc_requests_queue";

    /// Content type carried on every request and reply
    pub const JSON_CONTENT_TYPE: &str = "application/json";

    /// AMQP delivery mode for messages that must survive a broker restart
    pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

    pub const DEFAULT_CONNECTION_NAME: &str = "mediaflow";
}

/// Universal stage identifiers wrapped around every capability's own stages
pub mod stages {
    pub const INITIALIZING: &str = "initializing";
    pub const COMPLETE: &str = "complete";
    pub const ERROR: &str = "error";

    pub const INITIALIZING_PROGRESS: i32 = 0;
    pub const COMPLETE_PROGRESS: i32 = 100;

    /// Sentinel for unknown stages and the error event
    pub const UNKNOWN_PROGRESS: i32 = -1;

    /// Stage id reported when an invocation fails before entering a stage
    pub const UNKNOWN_STAGE: &str = "unknown";
}

/// JSON-RPC 2.0 error codes
pub mod jsonrpc {
    pub const VERSION: &str = "2.0";

    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Capability raised a domain error while executing
    pub const CAPABILITY_ERROR: i64 = -32000;

    /// Suffix appended to every capability's method name
    pub const EXECUTE_SUFFIX: &str = ".execute";
}

/// Standardized error codes carried in `Error` progress events
pub mod error_codes {
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    pub const FILE_TOO_LARGE: &str = "FILE_TOO_LARGE";
    pub const UNSUPPORTED_FORMAT: &str = "UNSUPPORTED_FORMAT";

    pub const INTERNAL_SERVICE_ERROR: &str = "INTERNAL_SERVICE_ERROR";
    pub const TIMEOUT_ERROR: &str = "TIMEOUT_ERROR";
    pub const OUT_OF_MEMORY: &str = "OUT_OF_MEMORY";

    pub const STREAM_ERROR: &str = "STREAM_ERROR";
    pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";

    pub const SERVICE_NOT_FOUND: &str = "SERVICE_NOT_FOUND";
    pub const SERVICE_EXECUTION_ERROR: &str = "SERVICE_EXECUTION_ERROR";
    pub const CANCELLED: &str = "CANCELLED";
}

/// Push-event channel constants
pub mod push {
    pub const EVENT_PROGRESS: &str = "progress";
    pub const EVENT_COMPLETE: &str = "complete";
    pub const EVENT_ERROR: &str = "error";
    pub const EVENT_PING: &str = "ping";

    pub const STATUS_PROCESSING: &str = "processing";
    pub const STATUS_SUCCESS: &str = "success";
    pub const STATUS_ERROR: &str = "error";

    /// Response headers for whichever HTTP layer serves the event stream
    pub const RESPONSE_HEADERS: &[(&str, &str)] = &[
        ("Content-Type", "text/event-stream"),
        ("Cache-Control", "no-cache"),
        ("Connection", "keep-alive"),
        ("X-Accel-Buffering", "no"),
    ];
}
