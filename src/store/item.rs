//! Items and identity
//!
//! An item is the runtime view of an index entry plus a restartable
//! content producer: a path whose fresh open yields a sequential read
//! of the bytes. The id is the lowercase hex SHA-256 of the content,
//! optionally suffixed with `_<namespace>`; the namespace is part of
//! the identity but never hashed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::index::{DeviceStatus, IndexEntry};

/// Compose an item id from a content digest and optional namespace.
pub fn compose_id(hash: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{}_{}", hash, ns),
        None => hash.to_string(),
    }
}

/// Hex SHA-256 of a byte slice.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// The addressable unit: identity, frozen metadata, per-device status,
/// and a restartable byte producer.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: String,
    pub metadata: Value,
    pub status: HashMap<String, DeviceStatus>,
    source: Option<PathBuf>,
}

impl Item {
    pub fn from_entry(entry: IndexEntry) -> Self {
        Self {
            id: entry.id,
            metadata: entry.metadata,
            status: entry.status,
            source: None,
        }
    }

    /// Point the content producer at a file.
    pub fn set_source(&mut self, path: PathBuf) {
        self.source = Some(path);
    }

    pub fn clear_source(&mut self) {
        self.source = None;
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Open a fresh sequential read of the content.
    pub async fn reader(&self) -> std::io::Result<tokio::fs::File> {
        let path = self.source.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "item has no content source")
        })?;
        tokio::fs::File::open(path).await
    }

    /// Every attempted device reported failure.
    pub fn is_missing(&self) -> bool {
        !self.status.is_empty() && self.status.values().all(|s| !s.is_ok())
    }

    /// All attempted devices reported success.
    pub fn is_fully_replicated(&self) -> bool {
        !self.status.is_empty() && self.status.values().all(|s| s.is_ok())
    }

    /// The `{id, metadata, status}` shape carried on the wire.
    pub fn to_wire(&self) -> Value {
        json!({
            "id": self.id,
            "metadata": self.metadata,
            "status": serde_json::to_value(&self.status).unwrap_or(Value::Null),
        })
    }
}
