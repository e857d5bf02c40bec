//! Realtime wire messages (JSON text frames).
//!
//! Client to server, tagged by `action`:
//! ```json
//! {"action": "subscribe", "id": "s1", "path": "/rooms/1", "events": ["value"]}
//! {"action": "unsubscribe", "id": "s1"}
//! {"action": "signin", "token": "..."}
//! ```
//! Server to client, tagged by `type`: `ack`, `error` and `event`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::subscription::{EventKind, QuerySpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Client-chosen subscription id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub path: String,
    #[serde(default)]
    pub events: Vec<EventKind>,
    #[serde(default)]
    pub query: Option<QuerySpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(SubscribeRequest),
    Unsubscribe {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        path: Option<String>,
    },
    Signin { token: String },
    Signout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub subscription: String,
    pub event: EventKind,
    /// Path of the node the value belongs to.
    pub path: String,
    /// Child key for `child_*` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ack {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<String>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        code: String,
        message: String,
    },
    Event(EventMessage),
}

impl ServerMessage {
    pub fn ack(action: &str, id: Option<String>) -> Self { ServerMessage::Ack { action: action.to_string(), id, uid: None } }

    pub fn error(id: Option<String>, err: &crate::error::AppError) -> Self {
        ServerMessage::Error { id, code: err.code_str().to_string(), message: err.message().to_string() }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!(r#"{{"type":"error","code":"internal_error","message":"{}"}}"#, e))
    }
}
