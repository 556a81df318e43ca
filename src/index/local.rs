//! Local index
//!
//! The authoritative id → item map, held in memory and mirrored to a
//! single `index.json` under the base directory. Every mutation
//! persists eagerly through an atomic temp-file + rename write, so a
//! creation that has returned is durable.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

/// Filename of the index snapshot.
pub const INDEX_FILE: &str = "index.json";

/// Per-device placement status. Codes follow HTTP conventions:
/// 200 success, 500 failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DeviceStatus {
    pub fn ok() -> Self {
        Self {
            code: 200,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: 500,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 200
    }
}

fn is_false(v: &bool) -> bool {
    !v
}

/// One indexed item: identity, frozen metadata, mutable placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub metadata: Value,
    #[serde(default)]
    pub status: HashMap<String, DeviceStatus>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

impl IndexEntry {
    pub fn new(id: impl Into<String>, metadata: Value) -> Self {
        Self {
            id: id.into(),
            metadata,
            status: HashMap::new(),
            deleted: false,
        }
    }

    /// An item is missing when every attempted device reported failure.
    pub fn is_missing(&self) -> bool {
        !self.status.is_empty() && self.status.values().all(|s| !s.is_ok())
    }
}

/// Errors from index operations.
#[derive(Debug)]
pub enum IndexError {
    /// No entry under the id
    NotFound(String),
    /// A second create with an existing id
    Exists(String),
    /// The snapshot could not be read or written
    Persist(String),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::NotFound(id) => write!(f, "item not found: {}", id),
            IndexError::Exists(id) => write!(f, "item already exists: {}", id),
            IndexError::Persist(e) => write!(f, "index persistence failed: {}", e),
        }
    }
}

impl std::error::Error for IndexError {}

/// In-memory id → entry map mirrored to `index.json`.
pub struct LocalIndex {
    path: PathBuf,
    items: Mutex<HashMap<String, IndexEntry>>,
}

impl LocalIndex {
    /// Open the index under a base directory, loading any snapshot.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self, IndexError> {
        let base_dir = base_dir.as_ref();
        fs::create_dir_all(base_dir).map_err(|e| IndexError::Persist(e.to_string()))?;
        let path = base_dir.join(INDEX_FILE);

        let items = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| IndexError::Persist(e.to_string()))?;
            serde_json::from_str(&raw).map_err(|e| IndexError::Persist(e.to_string()))?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    /// Look up an entry by id.
    pub async fn get_item(&self, id: &str) -> Result<IndexEntry, IndexError> {
        self.items
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| IndexError::NotFound(id.to_string()))
    }

    /// Insert a new entry and persist immediately. Metadata is adopted
    /// as-is and frozen from here on.
    pub async fn create_item(&self, id: &str, metadata: Value) -> Result<IndexEntry, IndexError> {
        let mut items = self.items.lock().await;
        if items.contains_key(id) {
            return Err(IndexError::Exists(id.to_string()));
        }
        let entry = IndexEntry::new(id, metadata);
        items.insert(id.to_string(), entry.clone());
        self.persist(&items)?;
        debug!(id = %id, "item indexed");
        Ok(entry)
    }

    /// Record a device's placement status for an item and persist.
    pub async fn set_status(
        &self,
        id: &str,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<(), IndexError> {
        let mut items = self.items.lock().await;
        let entry = items
            .get_mut(id)
            .ok_or_else(|| IndexError::NotFound(id.to_string()))?;
        entry.status.insert(device_id.to_string(), status);
        self.persist(&items)
    }

    /// Flag an entry as logically deleted and persist.
    pub async fn mark_deleted(&self, id: &str) -> Result<(), IndexError> {
        let mut items = self.items.lock().await;
        let entry = items
            .get_mut(id)
            .ok_or_else(|| IndexError::NotFound(id.to_string()))?;
        entry.deleted = true;
        self.persist(&items)
    }

    /// Drop an entry entirely and persist.
    pub async fn remove_item(&self, id: &str) -> Result<(), IndexError> {
        let mut items = self.items.lock().await;
        if items.remove(id).is_none() {
            return Err(IndexError::NotFound(id.to_string()));
        }
        self.persist(&items)
    }

    /// Overwrite an entry's metadata in place and persist.
    ///
    /// Metadata is frozen for ordinary items; this exists for the
    /// reserved network-map entry, which the overlay mutates by
    /// contract.
    pub(crate) async fn update_metadata(&self, id: &str, metadata: Value) -> Result<(), IndexError> {
        let mut items = self.items.lock().await;
        let entry = items
            .get_mut(id)
            .ok_or_else(|| IndexError::NotFound(id.to_string()))?;
        entry.metadata = metadata;
        self.persist(&items)
    }

    /// Snapshot of every entry.
    pub async fn items(&self) -> Vec<IndexEntry> {
        self.items.lock().await.values().cloned().collect()
    }

    /// Persist the current map.
    pub async fn flush(&self) -> Result<(), IndexError> {
        let items = self.items.lock().await;
        self.persist(&items)
    }

    fn persist(&self, items: &HashMap<String, IndexEntry>) -> Result<(), IndexError> {
        let raw = serde_json::to_string_pretty(items)
            .map_err(|e| IndexError::Persist(e.to_string()))?;
        // write to a temp file first, then rename (atomic)
        let temp = self.path.with_extension(format!("json.tmp.{}", std::process::id()));
        fs::write(&temp, raw).map_err(|e| IndexError::Persist(e.to_string()))?;
        fs::rename(&temp, &self.path).map_err(|e| IndexError::Persist(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalIndex::open(dir.path()).unwrap();

        let entry = index
            .create_item("abc", json!({"name": "t"}))
            .await
            .unwrap();
        assert_eq!(entry.id, "abc");
        assert_eq!(entry.metadata["name"], "t");
        assert!(entry.status.is_empty());

        let got = index.get_item("abc").await.unwrap();
        assert_eq!(got.id, "abc");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalIndex::open(dir.path()).unwrap();
        assert!(matches!(
            index.get_item("nope").await,
            Err(IndexError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_second_create_with_same_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalIndex::open(dir.path()).unwrap();

        index.create_item("abc", json!({})).await.unwrap();
        assert!(matches!(
            index.create_item("abc", json!({"other": 1})).await,
            Err(IndexError::Exists(_))
        ));
        // the original entry is unchanged
        let entry = index.get_item("abc").await.unwrap();
        assert!(entry.metadata.as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_is_durable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = LocalIndex::open(dir.path()).unwrap();
            index.create_item("abc", json!({"name": "t"})).await.unwrap();
        }
        // a fresh index over the same directory sees the entry
        let reopened = LocalIndex::open(dir.path()).unwrap();
        let entry = reopened.get_item("abc").await.unwrap();
        assert_eq!(entry.metadata["name"], "t");
    }

    #[tokio::test]
    async fn test_status_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalIndex::open(dir.path()).unwrap();
        index.create_item("abc", json!({})).await.unwrap();

        index
            .set_status("abc", "local-0", DeviceStatus::ok())
            .await
            .unwrap();
        index
            .set_status("abc", "local-1", DeviceStatus::failed("disk full"))
            .await
            .unwrap();

        let reopened = LocalIndex::open(dir.path()).unwrap();
        let entry = reopened.get_item("abc").await.unwrap();
        assert!(entry.status["local-0"].is_ok());
        assert_eq!(entry.status["local-1"].code, 500);
        assert_eq!(entry.status["local-1"].message.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_is_missing() {
        let mut entry = IndexEntry::new("x", json!({}));
        assert!(!entry.is_missing()); // never attempted

        entry.status.insert("a".into(), DeviceStatus::failed("x"));
        assert!(entry.is_missing());

        entry.status.insert("b".into(), DeviceStatus::ok());
        assert!(!entry.is_missing());
    }

    #[tokio::test]
    async fn test_mark_deleted_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalIndex::open(dir.path()).unwrap();
        index.create_item("abc", json!({})).await.unwrap();

        index.mark_deleted("abc").await.unwrap();
        assert!(index.get_item("abc").await.unwrap().deleted);

        index.remove_item("abc").await.unwrap();
        assert!(index.get_item("abc").await.is_err());

        let reopened = LocalIndex::open(dir.path()).unwrap();
        assert!(reopened.get_item("abc").await.is_err());
    }

    #[tokio::test]
    async fn test_deleted_flag_not_serialized_when_false() {
        let dir = tempfile::tempdir().unwrap();
        let index = LocalIndex::open(dir.path()).unwrap();
        index.create_item("abc", json!({})).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        assert!(!raw.contains("deleted"));
    }
}
