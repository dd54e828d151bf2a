//! Wire protocol message types.
//!
//! All communication between xyz nodes uses JSON-framed messages over TCP.
//! Each message is prefixed with a 4-byte big-endian length header. The `id`
//! of a request is echoed unchanged in its response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A wire protocol message (envelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Request id; responses carry the id of the request they answer.
    pub id: String,
    /// Message variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

/// The different kinds of wire messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    /// Request from one node to another.
    #[serde(rename = "request")]
    Request(WireRequest),
    /// Response to a request.
    #[serde(rename = "response")]
    Response(WireResponse),
}

/// Request messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireRequest {
    /// First message on every connection: exchange identity.
    #[serde(rename = "handshake")]
    Handshake {
        /// Name of the calling node.
        node_name: String,
        /// Protocol version.
        protocol_version: u32,
        /// Actions registered on the calling node.
        actions: Vec<String>,
        /// Random nonce for HMAC authentication.
        #[serde(default)]
        nonce: String,
        /// HMAC-SHA256(shared_secret, nonce + node_name).
        #[serde(default)]
        auth_hmac: String,
    },
    /// Invoke a named action on the remote node.
    #[serde(rename = "invoke")]
    Invoke {
        action: String,
        #[serde(default)]
        payload: Value,
    },
    /// Liveness check.
    #[serde(rename = "ping")]
    Ping,
}

/// Response messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireResponse {
    /// Handshake acknowledgement.
    #[serde(rename = "handshake_ack")]
    HandshakeAck {
        node_name: String,
        protocol_version: u32,
        actions: Vec<String>,
        #[serde(default)]
        nonce: String,
        #[serde(default)]
        auth_hmac: String,
    },
    /// Value produced by the remote handler.
    #[serde(rename = "reply")]
    Reply {
        #[serde(default)]
        payload: Value,
    },
    /// Pong response.
    #[serde(rename = "pong")]
    Pong {
        /// Uptime in seconds.
        uptime_secs: u64,
    },
    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// Error code.
        code: i32,
        /// Error message.
        message: String,
    },
}

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error codes carried in [`WireResponse::Error`].
pub mod codes {
    /// Protocol version mismatch during handshake.
    pub const VERSION_MISMATCH: i32 = 1;
    /// Malformed or out-of-place request.
    pub const BAD_REQUEST: i32 = 400;
    /// Request sent before the handshake completed.
    pub const UNAUTHENTICATED: i32 = 401;
    /// Handshake HMAC did not verify.
    pub const FORBIDDEN: i32 = 403;
    /// No handler registered for the action.
    pub const NOT_FOUND: i32 = 404;
    /// The handler failed or dropped its responder.
    pub const HANDLER_FAILED: i32 = 500;
}

impl WireMessage {
    /// Build an `invoke` request.
    pub fn invoke(id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: WireMessageKind::Request(WireRequest::Invoke {
                action: action.into(),
                payload,
            }),
        }
    }

    /// Build a response answering request `id`.
    pub fn response(id: impl Into<String>, response: WireResponse) -> Self {
        Self {
            id: id.into(),
            kind: WireMessageKind::Response(response),
        }
    }

    /// Build an error response answering request `id`.
    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self::response(
            id,
            WireResponse::Error {
                code,
                message: message.into(),
            },
        )
    }
}

/// Encode a wire message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a WireMessage.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}
