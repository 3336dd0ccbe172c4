//! Push-event wire format.
//!
//! ```text
//! event: progress
//! data: {"progress":30,"stage":"translating","status":"processing"}
//!
//! ```
//!
//! The event kind is derived from the payload: an error status or an `error`
//! key always wins, a `success` status at 100% (or on the `complete` stage)
//! is `complete`, anything else is `progress`. JSON is written compact and
//! UTF-8 text is kept as is.

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};
use thiserror::Error;

use crate::constants::push::{
    EVENT_COMPLETE, EVENT_ERROR, EVENT_PING, EVENT_PROGRESS, STATUS_ERROR, STATUS_SUCCESS,
};
use crate::constants::stages::{COMPLETE, COMPLETE_PROGRESS};
use crate::progress::ProgressEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireEventKind {
    Progress,
    Complete,
    Error,
    Ping,
}

impl WireEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => EVENT_PROGRESS,
            Self::Complete => EVENT_COMPLETE,
            Self::Error => EVENT_ERROR,
            Self::Ping => EVENT_PING,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for WireEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireEventKind {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            EVENT_PROGRESS => Ok(Self::Progress),
            EVENT_COMPLETE => Ok(Self::Complete),
            EVENT_ERROR => Ok(Self::Error),
            EVENT_PING => Ok(Self::Ping),
            other => Err(FormatError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Event block has no 'event:' line")]
    MissingEvent,

    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    #[error("Event block has no 'data:' line")]
    MissingData,

    #[error("Event data is not valid JSON: {0}")]
    InvalidJson(String),
}

/// One classified event ready to be written to a connection
#[derive(Debug, Clone, PartialEq)]
pub struct WireEvent {
    pub kind: WireEventKind,
    pub data: Value,
}

impl WireEvent {
    pub fn ping() -> Self {
        Self {
            kind: WireEventKind::Ping,
            data: json!({}),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventFormatter;

impl EventFormatter {
    /// Event kind for an arbitrary payload
    pub fn classify(payload: &Value) -> WireEventKind {
        let status = payload.get("status").and_then(Value::as_str);
        if status == Some(STATUS_ERROR) || payload.get("error").is_some() {
            return WireEventKind::Error;
        }

        let progress = payload.get("progress").and_then(Value::as_i64);
        let stage = payload.get("stage").and_then(Value::as_str);
        if status == Some(STATUS_SUCCESS)
            && (progress == Some(i64::from(COMPLETE_PROGRESS)) || stage == Some(COMPLETE))
        {
            return WireEventKind::Complete;
        }

        WireEventKind::Progress
    }

    pub fn format(event: &ProgressEvent) -> WireEvent {
        Self::format_value(event.to_value())
    }

    pub fn format_value(payload: Value) -> WireEvent {
        WireEvent {
            kind: Self::classify(&payload),
            data: payload,
        }
    }

    pub fn encode(event: &WireEvent) -> String {
        format!("event: {}\ndata: {}\n\n", event.kind, event.data)
    }

    /// Classify and encode in one step
    pub fn render(event: &ProgressEvent) -> String {
        Self::encode(&Self::format(event))
    }

    /// `event: ping` with an empty object
    pub fn ping() -> String {
        Self::encode(&WireEvent::ping())
    }

    /// Parse one event block. Multiple `data:` lines are joined with `\n`.
    pub fn parse(text: &str) -> Result<WireEvent, FormatError> {
        let mut kind = None;
        let mut data_lines: Vec<&str> = Vec::new();

        for line in text.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                kind = Some(value.trim().parse::<WireEventKind>()?);
            } else if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.strip_prefix(' ').unwrap_or(value));
            }
        }

        let kind = kind.ok_or(FormatError::MissingEvent)?;
        if data_lines.is_empty() {
            return Err(FormatError::MissingData);
        }
        let data = serde_json::from_str(&data_lines.join("\n"))
            .map_err(|e| FormatError::InvalidJson(e.to_string()))?;
        Ok(WireEvent { kind, data })
    }
}
