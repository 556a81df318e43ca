//! Item index
//!
//! The authoritative mapping from item id to metadata and per-device
//! placement status. Comes in two variants the store dispatches over: a
//! purely local map, and the overlay-aware wrapper that resolves misses
//! through peers.

pub mod local;
pub mod network;

use std::sync::Arc;

use serde_json::Value;

pub use local::{DeviceStatus, IndexEntry, IndexError, LocalIndex, INDEX_FILE};
pub use network::{
    NetworkIndex, LOCAL_KEY, NETWORK_MAP_ID, NS_INDEX, TYPE_CREATE_ITEM, TYPE_GET_ITEM,
};

/// Reserved ids (like the network map) that item-level operations skip.
pub fn is_reserved_id(id: &str) -> bool {
    id.starts_with("__")
}

/// Index variants the store holds.
#[derive(Clone)]
pub enum Index {
    Local(Arc<LocalIndex>),
    Network(Arc<NetworkIndex>),
}

impl Index {
    fn backing(&self) -> &Arc<LocalIndex> {
        match self {
            Index::Local(local) => local,
            Index::Network(network) => network.local(),
        }
    }

    /// Look up an item, falling back to peers on the network variant.
    pub async fn get_item(&self, id: &str) -> Result<IndexEntry, IndexError> {
        match self {
            Index::Local(local) => local.get_item(id).await,
            Index::Network(network) => network.get_item(id).await,
        }
    }

    /// Create an item; the network variant announces it to peers.
    pub async fn create_item(&self, id: &str, metadata: Value) -> Result<IndexEntry, IndexError> {
        match self {
            Index::Local(local) => local.create_item(id, metadata).await,
            Index::Network(network) => network.create_item(id, metadata).await,
        }
    }

    pub async fn set_status(
        &self,
        id: &str,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<(), IndexError> {
        self.backing().set_status(id, device_id, status).await
    }

    pub async fn mark_deleted(&self, id: &str) -> Result<(), IndexError> {
        self.backing().mark_deleted(id).await
    }

    pub async fn remove_item(&self, id: &str) -> Result<(), IndexError> {
        self.backing().remove_item(id).await
    }

    /// Snapshot of every local entry.
    pub async fn items(&self) -> Vec<IndexEntry> {
        self.backing().items().await
    }

    pub async fn flush(&self) -> Result<(), IndexError> {
        self.backing().flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids() {
        assert!(is_reserved_id(NETWORK_MAP_ID));
        assert!(is_reserved_id("__local__"));
        assert!(!is_reserved_id("9f64a747"));
        assert!(!is_reserved_id("abc_ns"));
    }
}
