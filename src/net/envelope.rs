//! Datagram wire envelope
//!
//! Every peer exchange is a single UTF-8 JSON datagram. Requests carry
//! `ping: true`, responses `pong: true` with the same correlation id.
//! The `target` field is the only multiplexing filter on the shared
//! socket: messages addressed to someone else are dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single datagram message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id, a UUID chosen by the requester
    pub id: String,
    /// Handler namespace, e.g. `p2p:index`
    pub namespace: String,
    /// Peer id of the sender
    pub source: String,
    /// Peer id of the addressee
    pub target: String,
    /// Handler type within the namespace, e.g. `index:getItem`
    #[serde(rename = "type")]
    pub kind: String,
    /// Operation payload
    #[serde(default)]
    pub data: Value,
    /// Whether this message is part of a broadcast
    #[serde(default)]
    pub broadcast: bool,
    /// Set on requests
    #[serde(default)]
    pub ping: bool,
    /// Set on responses
    #[serde(default)]
    pub pong: bool,
    /// Set on error responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Build a request envelope with a fresh correlation id.
    pub fn request(
        source: String,
        target: String,
        namespace: &str,
        kind: &str,
        data: Value,
        broadcast: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            namespace: namespace.to_string(),
            source,
            target,
            kind: kind.to_string(),
            data,
            broadcast,
            ping: true,
            pong: false,
            error: None,
        }
    }

    /// Build the success response for a request, swapping source/target.
    pub fn reply(request: &Envelope, source: String, data: Value) -> Self {
        Self {
            id: request.id.clone(),
            namespace: request.namespace.clone(),
            source,
            target: request.source.clone(),
            kind: request.kind.clone(),
            data,
            broadcast: request.broadcast,
            ping: false,
            pong: true,
            error: None,
        }
    }

    /// Build an error response for a request.
    pub fn reply_error(request: &Envelope, source: String, error: String) -> Self {
        let mut env = Self::reply(request, source, Value::Null);
        env.error = Some(error);
        env
    }
}
