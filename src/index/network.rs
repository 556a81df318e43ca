//! Network index
//!
//! Wraps the local index with the peer overlay: reads fall back to a
//! broadcast when the local map misses, adopting the first peer's
//! answer as a synthesized local entry; creates are announced to every
//! peer fire-and-forget. The peer roster itself lives in the index as
//! the reserved `__p2p__` entry, whose metadata maps `LOCAL` and peer
//! ids to peer records.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, trace, warn};

use crate::net::{NetError, Transport};
use crate::swarm::Peer;

use super::local::{IndexError, IndexEntry, LocalIndex};

/// Reserved index entry holding the network map.
pub const NETWORK_MAP_ID: &str = "__p2p__";
/// Network-map metadata key of the local peer.
pub const LOCAL_KEY: &str = "LOCAL";

/// Handler namespace of the index overlay.
pub const NS_INDEX: &str = "p2p:index";
/// Broadcast-fallback read.
pub const TYPE_GET_ITEM: &str = "index:getItem";
/// Fire-and-forget create announcement.
pub const TYPE_CREATE_ITEM: &str = "index:createItem";

/// Distributed view over a local index.
pub struct NetworkIndex {
    local: Arc<LocalIndex>,
    transport: Arc<Transport>,
    local_peer: Peer,
}

impl NetworkIndex {
    /// Wire the overlay: seed the network map with the local peer and
    /// register the peer-facing handlers on the transport.
    ///
    /// `local_peer` must already carry its externally reachable
    /// address; it is written into the map as the `LOCAL` entry.
    pub async fn start(
        local: Arc<LocalIndex>,
        transport: Arc<Transport>,
        local_peer: Peer,
    ) -> Result<Arc<Self>, IndexError> {
        // seed or refresh the reserved network-map entry
        let local_value =
            serde_json::to_value(&local_peer).map_err(|e| IndexError::Persist(e.to_string()))?;
        match local.get_item(NETWORK_MAP_ID).await {
            Ok(entry) => {
                let mut map = entry.metadata.as_object().cloned().unwrap_or_default();
                map.insert(LOCAL_KEY.to_string(), local_value);
                local
                    .update_metadata(NETWORK_MAP_ID, Value::Object(map))
                    .await?;
            }
            Err(IndexError::NotFound(_)) => {
                let mut map = Map::new();
                map.insert(LOCAL_KEY.to_string(), local_value);
                local
                    .create_item(NETWORK_MAP_ID, Value::Object(map))
                    .await?;
            }
            Err(e) => return Err(e),
        }

        let index = Arc::new(Self {
            local: local.clone(),
            transport: transport.clone(),
            local_peer,
        });

        // peer-facing read
        let reader = local.clone();
        transport
            .on(NS_INDEX, TYPE_GET_ITEM, move |env| {
                let reader = reader.clone();
                async move {
                    let id = env.data["id"]
                        .as_str()
                        .ok_or_else(|| "missing id".to_string())?
                        .to_string();
                    match reader.get_item(&id).await {
                        Ok(entry) => Ok(json!({"id": entry.id, "metadata": entry.metadata})),
                        Err(e) => Err(e.to_string()),
                    }
                }
            })
            .await;

        // peer-facing create; errors are swallowed on purpose
        let writer = local.clone();
        transport
            .on(NS_INDEX, TYPE_CREATE_ITEM, move |env| {
                let writer = writer.clone();
                async move {
                    let id = env.data["id"]
                        .as_str()
                        .ok_or_else(|| "missing id".to_string())?
                        .to_string();
                    let metadata = env.data["metadata"].clone();
                    if let Err(e) = writer.create_item(&id, metadata).await {
                        debug!(id = %id, error = %e, "announced item not adopted");
                    }
                    Ok(Value::Null)
                }
            })
            .await;

        Ok(index)
    }

    /// The wrapped local index.
    pub fn local(&self) -> &Arc<LocalIndex> {
        &self.local
    }

    /// This node's peer record as registered in the network map.
    pub fn local_peer(&self) -> &Peer {
        &self.local_peer
    }

    /// Local-first read with broadcast fallback.
    ///
    /// A peer's answer is adopted into the local index with a `nodes`
    /// list naming the responding peer, so the next read is a local
    /// hit. No answer within the broadcast window surfaces not-found.
    pub async fn get_item(&self, id: &str) -> Result<IndexEntry, IndexError> {
        match self.local.get_item(id).await {
            Ok(entry) => return Ok(entry),
            Err(IndexError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let peers = self.peers().await;
        if peers.is_empty() {
            return Err(IndexError::NotFound(id.to_string()));
        }

        let (peer_id, data) = match self
            .transport
            .broadcast(&peers, NS_INDEX, TYPE_GET_ITEM, json!({ "id": id }))
            .await
        {
            Ok(found) => found,
            Err(NetError::Timeout) | Err(NetError::NoResponse) | Err(NetError::NoPeers) => {
                return Err(IndexError::NotFound(id.to_string()))
            }
            Err(e) => {
                warn!(id = %id, error = %e, "index broadcast failed");
                return Err(IndexError::NotFound(id.to_string()));
            }
        };

        let mut metadata = data["metadata"].clone();
        if let Some(map) = metadata.as_object_mut() {
            map.insert("nodes".to_string(), json!([peer_id]));
        }

        match self.local.create_item(id, metadata).await {
            Ok(entry) => Ok(entry),
            // lost a race against a concurrent resolve of the same id
            Err(IndexError::Exists(_)) => self.local.get_item(id).await,
            Err(e) => Err(e),
        }
    }

    /// Create locally, then announce to every peer fire-and-forget.
    pub async fn create_item(&self, id: &str, metadata: Value) -> Result<IndexEntry, IndexError> {
        let entry = self.local.create_item(id, metadata.clone()).await?;

        let announcement = json!({"id": id, "metadata": metadata});
        for peer in self.peers().await {
            if let Err(e) = self
                .transport
                .notify(&peer, NS_INDEX, TYPE_CREATE_ITEM, announcement.clone())
                .await
            {
                trace!(peer = %peer.id, error = %e, "create announcement not sent");
            }
        }
        Ok(entry)
    }

    /// Every peer in the network map except the local one.
    pub async fn peers(&self) -> Vec<Peer> {
        let entry = match self.local.get_item(NETWORK_MAP_ID).await {
            Ok(entry) => entry,
            Err(_) => return Vec::new(),
        };
        let map = match entry.metadata.as_object() {
            Some(map) => map,
            None => return Vec::new(),
        };
        map.iter()
            .filter(|(key, _)| key.as_str() != LOCAL_KEY)
            .filter_map(|(key, value)| match serde_json::from_value(value.clone()) {
                Ok(peer) => Some(peer),
                Err(e) => {
                    warn!(key = %key, error = %e, "unreadable peer in network map");
                    None
                }
            })
            .collect()
    }

    /// Add or update a peer in the network map.
    pub async fn join(&self, peer: &Peer) -> Result<(), IndexError> {
        let value = serde_json::to_value(peer).map_err(|e| IndexError::Persist(e.to_string()))?;
        let mut map = self.network_map().await;
        map.insert(peer.id.clone(), value);
        self.local
            .update_metadata(NETWORK_MAP_ID, Value::Object(map))
            .await
    }

    /// Remove a peer from the network map.
    pub async fn leave(&self, peer: &Peer) -> Result<(), IndexError> {
        let mut map = self.network_map().await;
        map.remove(&peer.id);
        self.local
            .update_metadata(NETWORK_MAP_ID, Value::Object(map))
            .await
    }

    async fn network_map(&self) -> Map<String, Value> {
        self.local
            .get_item(NETWORK_MAP_ID)
            .await
            .ok()
            .and_then(|entry| entry.metadata.as_object().cloned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::testing::{loopback_peer, loopback_transport, peer_for};

    async fn overlay_node(
        dir: &std::path::Path,
        name: &str,
    ) -> (Arc<NetworkIndex>, Arc<Transport>, Peer) {
        let transport = loopback_transport(name, 500).await;
        let peer = peer_for(&transport);
        let local = Arc::new(LocalIndex::open(dir).unwrap());
        let index = NetworkIndex::start(local, transport.clone(), peer.clone())
            .await
            .unwrap();
        (index, transport, peer)
    }

    #[tokio::test]
    async fn test_network_map_holds_local_peer() {
        let dir = tempfile::tempdir().unwrap();
        let (index, transport, peer) = overlay_node(dir.path(), "node-a").await;

        let entry = index.local().get_item(NETWORK_MAP_ID).await.unwrap();
        let local: Peer =
            serde_json::from_value(entry.metadata[LOCAL_KEY].clone()).unwrap();
        assert_eq!(local, peer);
        assert!(index.peers().await.is_empty());

        transport.close().await;
    }

    #[tokio::test]
    async fn test_join_and_leave_mutate_map() {
        let dir = tempfile::tempdir().unwrap();
        let (index, transport, _) = overlay_node(dir.path(), "node-a").await;

        let other = Peer {
            id: "node-b".to_string(),
            address: "127.0.0.1".to_string(),
            port: 4242,
            protocol: "http".to_string(),
            master: false,
        };
        index.join(&other).await.unwrap();
        assert_eq!(index.peers().await, vec![other.clone()]);

        index.leave(&other).await.unwrap();
        assert!(index.peers().await.is_empty());

        transport.close().await;
    }

    #[tokio::test]
    async fn test_remote_resolution_synthesizes_entry() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (index_a, transport_a, peer_a) = overlay_node(dir_a.path(), "node-a").await;
        let (index_b, transport_b, _peer_b) = overlay_node(dir_b.path(), "node-b").await;

        index_a
            .local()
            .create_item("foo", json!({"name": "from-a"}))
            .await
            .unwrap();
        index_b.join(&peer_a).await.unwrap();

        let entry = index_b.get_item("foo").await.unwrap();
        assert_eq!(entry.metadata["name"], "from-a");
        assert_eq!(entry.metadata["nodes"][0], "node-a");

        // second read is a local hit even with the peer gone
        transport_a.close().await;
        let again = index_b.get_item("foo").await.unwrap();
        assert_eq!(again.metadata["name"], "from-a");

        transport_b.close().await;
    }

    #[tokio::test]
    async fn test_unresolvable_id_is_not_found_within_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let (index, transport, _) = overlay_node(dir.path(), "node-a").await;

        // a peer that will never answer
        index.join(&loopback_peer("ghost", 1)).await.unwrap();

        let started = std::time::Instant::now();
        let err = index.get_item("nonexistent").await.unwrap_err();
        assert!(matches!(err, IndexError::NotFound(_)));
        assert!(started.elapsed() < Duration::from_secs(2));

        transport.close().await;
    }

    #[tokio::test]
    async fn test_no_peers_is_immediate_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (index, transport, _) = overlay_node(dir.path(), "node-a").await;
        assert!(matches!(
            index.get_item("nonexistent").await,
            Err(IndexError::NotFound(_))
        ));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_create_announcement_reaches_peers() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (index_a, transport_a, _peer_a) = overlay_node(dir_a.path(), "node-a").await;
        let (index_b, transport_b, peer_b) = overlay_node(dir_b.path(), "node-b").await;

        index_a.join(&peer_b).await.unwrap();
        index_a
            .create_item("bar", json!({"name": "announced"}))
            .await
            .unwrap();

        // the announcement is fire-and-forget; give it a moment
        tokio::time::sleep(Duration::from_millis(200)).await;
        let entry = index_b.local().get_item("bar").await.unwrap();
        assert_eq!(entry.metadata["name"], "announced");

        transport_a.close().await;
        transport_b.close().await;
    }
}
