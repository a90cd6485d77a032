//! Sync protocol types.
//!
//! Every frame on a room socket is a JSON text message tagged by `type`.
//!
//! ```json
//! {"type": "connect", "connectRequestId": "r1", "lastServerClock": 0, "protocolVersion": 8, "schema": {...}}
//! {"type": "connect", "connectRequestId": "r1", "hydrationType": "wipe_all", "protocolVersion": 8, "schema": {...}, "serverClock": 12, "diff": {...}}
//! {"type": "incompatibility_error", "reason": "clientTooOld"}
//! {"type": "push", "clientClock": 1, "diff": {"shape:a": [0, {...}]}}
//! {"type": "push_result", "clientClock": 1, "serverClock": 13, "action": "commit"}
//! {"type": "data", "serverClock": 13, "diff": {"shape:a": [0, {...}]}}
//! {"type": "presence", "presence": {...}}
//! {"type": "presence", "sessionId": "s1", "presence": null}
//! {"type": "ping"}
//! {"type": "pong"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schema::SchemaDescriptor;

/// Protocol version spoken by this server.
pub const PROTOCOL_VERSION: u32 = 8;

/// Opaque document diff, keyed by record id.
pub type Diff = Map<String, Value>;

// ==================== Client -> Server ====================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the handshake. Must be the first message on a socket.
    #[serde(rename_all = "camelCase")]
    Connect {
        connect_request_id: String,
        #[serde(default)]
        last_server_clock: u64,
        protocol_version: u32,
        /// Kept raw so an unparseable schema can be reported as
        /// `invalidRecord` rather than failing the whole frame.
        schema: Value,
    },
    /// Incremental change from the client.
    #[serde(rename_all = "camelCase")]
    Push { client_clock: u64, diff: Value },
    /// Ephemeral per-session state (cursor, selection). `null` clears it.
    Presence {
        #[serde(default)]
        presence: Value,
    },
    Ping,
}

// ==================== Server -> Client ====================

/// How a newly connected client should bring its view up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HydrationType {
    /// Discard local state and load the full snapshot in the ack's `diff`.
    #[serde(rename = "wipe_all")]
    Full,
    /// Client is already at the server clock; only presence is reset.
    #[serde(rename = "wipe_presence")]
    Incremental,
}

/// Why a `connect` was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IncompatibilityReason {
    ClientTooOld,
    ServerTooOld,
    InvalidRecord,
}

impl std::fmt::Display for IncompatibilityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IncompatibilityReason::ClientTooOld => "clientTooOld",
            IncompatibilityReason::ServerTooOld => "serverTooOld",
            IncompatibilityReason::InvalidRecord => "invalidRecord",
        };
        f.write_str(s)
    }
}

/// Outcome of a push, reported back to the sender only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushAction {
    /// Diff applied, persisted and broadcast.
    Commit,
    /// Diff rejected (stale clock or malformed); nothing changed.
    Discard,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Successful handshake. Shares the `connect` tag with the request.
    #[serde(rename = "connect", rename_all = "camelCase")]
    ConnectAck {
        connect_request_id: String,
        hydration_type: HydrationType,
        protocol_version: u32,
        schema: SchemaDescriptor,
        server_clock: u64,
        diff: Diff,
    },
    /// Terminal; the server closes the socket right after sending it.
    IncompatibilityError { reason: IncompatibilityReason },
    #[serde(rename_all = "camelCase")]
    PushResult {
        client_clock: u64,
        server_clock: u64,
        action: PushAction,
    },
    /// A diff applied on behalf of another session.
    #[serde(rename_all = "camelCase")]
    Data { server_clock: u64, diff: Diff },
    /// Another session's presence. `null` means that session is gone.
    #[serde(rename_all = "camelCase")]
    Presence { session_id: String, presence: Value },
    Pong,
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // ServerMessage only holds strings, integers and serde_json values,
        // none of which can fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

// ==================== Tests ====================
