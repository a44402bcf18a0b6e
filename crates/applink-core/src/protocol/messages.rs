//! All AppLink protocol message types.
//!
//! Every message is a JSON object with a `"type"` field that identifies the
//! variant; all other fields are flattened into the same object:
//!
//! ```json
//! {"type":"hello","device_id":"SERIAL-1","app_name":"shop","query":{"os":"android"}}
//! ```
//!
//! Two distinct enums cover the two directions, so it is a compile-time
//! error to send a server-only message from a client or vice versa.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Client → Server messages ──────────────────────────────────────────────────

/// Messages an instrumented app can send to the session server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// The handshake. Must be the first frame on a new connection.
    Hello {
        /// Serial of the device the app runs on, as reported by the
        /// platform SDK. Validated against the device registry.
        device_id: String,
        /// Name of the connecting application.
        app_name: String,
        /// Version of the instrumentation SDK embedded in the app.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdk_version: Option<String>,
        /// Free-form session metadata (OS version, build flavor, ...).
        #[serde(default)]
        query: HashMap<String, String>,
    },

    /// Voluntary disconnect announced before the app closes the socket.
    Goodbye {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

// ── Server → Client messages ──────────────────────────────────────────────────

/// Messages the session server sends back to an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// The handshake was accepted; the app is now a registered client.
    HelloAck {
        /// Identity assigned to this connection, unique per live session.
        connection_id: Uuid,
    },

    /// The handshake was refused; the server closes the connection after
    /// sending this frame.
    Rejected { code: RejectCode, message: String },

    /// Server-initiated close (e.g. graceful shutdown).
    Goodbye { reason: GoodbyeReason },
}

/// Why a handshake was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectCode {
    /// The declared device serial is not in the device registry.
    UnknownDevice,
    /// A client with the same connection identity is already registered.
    DuplicateClient,
    /// The device already has a live client and the server is configured
    /// for one client per device.
    DeviceBusy,
    /// The server is shutting down and no longer admits clients.
    ServerClosing,
    /// The first frame was not a parseable `hello`.
    BadHandshake,
}

/// Why the server is closing an established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GoodbyeReason {
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_round_trips_through_json() {
        let msg = ClientMessage::Hello {
            device_id: "SERIAL-1".to_string(),
            app_name: "shop".to_string(),
            sdk_version: Some("2.4.1".to_string()),
            query: HashMap::from([("os".to_string(), "android".to_string())]),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_type_tag_is_kebab_case() {
        let msg = ClientMessage::Goodbye { reason: None };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"goodbye\""), "got: {json}");
    }

    #[test]
    fn test_hello_without_optional_fields_parses() {
        // Minimal handshake an old SDK might send.
        let json = r#"{"type":"hello","device_id":"SERIAL-1","app_name":"shop"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Hello { device_id, sdk_version, query, .. } => {
                assert_eq!(device_id, "SERIAL-1");
                assert_eq!(sdk_version, None);
                assert!(query.is_empty());
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn test_rejected_code_serializes_kebab_case() {
        let msg = ServerMessage::Rejected {
            code: RejectCode::UnknownDevice,
            message: "no device with serial SERIAL-9".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"code\":\"unknown-device\""), "got: {json}");
    }

    #[test]
    fn test_hello_ack_round_trips() {
        let msg = ServerMessage::HelloAck { connection_id: Uuid::new_v4() };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_unknown_type_field_fails_to_parse() {
        let json = r#"{"type":"launch-missiles"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }
}
