//! Debug Adapter Protocol (DAP) front end of the bridge.
//!
//! This module speaks the Debug Adapter Protocol to the editor and drives the
//! remote debugger on its behalf.
//!
//! # Architecture
//!
//! The DAP implementation consists of:
//! - Protocol types and messages (requests, responses, events)
//! - Content-Length framing over any byte stream
//! - A server loop that dispatches requests and relays session events
//! - The session controller that owns the connection, mapping and variables
//!
//! # References
//!
//! - [DAP Specification](https://microsoft.github.io/debug-adapter-protocol/)

pub mod messages;
pub mod server;
pub mod session;
pub mod transport;

pub use messages::*;
pub use server::DapServer;
pub use session::{DebugSession, SessionEvent, Signal};

use serde::{Deserialize, Serialize};

/// DAP protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    /// A request from the editor.
    #[serde(rename = "request")]
    Request(Request),
    /// A response to a request.
    #[serde(rename = "response")]
    Response(Response),
    /// An event sent without being asked.
    #[serde(rename = "event")]
    Event(Event),
}

/// DAP request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Sequence number.
    pub seq: i64,
    /// Command name.
    pub command: String,
    /// Command arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

/// DAP response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Sequence number.
    pub seq: i64,
    /// Sequence number of the request.
    pub request_seq: i64,
    /// Whether the request succeeded.
    pub success: bool,
    /// Command of the request.
    pub command: String,
    /// Error message shown to the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

/// DAP event message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Sequence number.
    pub seq: i64,
    /// Event name.
    pub event: String,
    /// Event body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl ProtocolMessage {
    /// Sequence number of the message.
    pub fn seq(&self) -> i64 {
        match self {
            Self::Request(r) => r.seq,
            Self::Response(r) => r.seq,
            Self::Event(e) => e.seq,
        }
    }
}
