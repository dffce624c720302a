//! Captured traffic types
//!
//! Snapshots are built once per message leg and never mutated after being
//! published. The serialized shape is what monitor clients receive:
//!
//! ```json
//! { "type": "request", "id": "...", "url": "/users/1", "method": "GET",
//!   "httpVersion": "1.1", "headers": [{"name": "accept", "value": "*/*"}],
//!   "bodySize": 0, "truncated": false, "complete": true,
//!   "start": 1700000000000, "end": 1700000000001 }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::body::CapturedBody;
use crate::correlation::CorrelationId;

/// One header line; duplicates stay separate entries in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPair {
    pub name: String,
    pub value: String,
}

impl HeaderPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A captured inbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub id: CorrelationId,
    /// Path and query as received by the proxy
    pub url: String,
    pub method: String,
    pub http_version: String,
    pub headers: Vec<HeaderPair>,
    #[serde(flatten)]
    pub body: CapturedBody,
    /// Capture start (milliseconds since UNIX epoch)
    pub start: u64,
    /// Capture end (milliseconds since UNIX epoch)
    pub end: u64,
}

/// A captured backend response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSnapshot {
    pub id: CorrelationId,
    pub http_version: String,
    pub headers: Vec<HeaderPair>,
    pub status_code: u16,
    pub status_message: String,
    #[serde(flatten)]
    pub body: CapturedBody,
    pub start: u64,
    pub end: u64,
}

/// Kind of a [`TrafficEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Request,
    Response,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Request => write!(f, "request"),
            EventKind::Response => write!(f, "response"),
        }
    }
}

/// Envelope carried by the bus and pushed to monitor clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TrafficEvent {
    Request(RequestSnapshot),
    Response(ResponseSnapshot),
}

impl TrafficEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TrafficEvent::Request(_) => EventKind::Request,
            TrafficEvent::Response(_) => EventKind::Response,
        }
    }

    pub fn id(&self) -> CorrelationId {
        match self {
            TrafficEvent::Request(r) => r.id,
            TrafficEvent::Response(r) => r.id,
        }
    }

    /// Serialize to the JSON frame sent to subscribers
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<RequestSnapshot> for TrafficEvent {
    fn from(snapshot: RequestSnapshot) -> Self {
        TrafficEvent::Request(snapshot)
    }
}

impl From<ResponseSnapshot> for TrafficEvent {
    fn from(snapshot: ResponseSnapshot) -> Self {
        TrafficEvent::Response(snapshot)
    }
}

/// Milliseconds since UNIX epoch, used for capture timestamps
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
