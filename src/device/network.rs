//! Network device
//!
//! Wraps a local device with the peer overlay. A miss on the wrapped
//! device turns into an `nd:get` broadcast; the first peer holding the
//! content answers with its content-server port, and the bytes are
//! fetched over HTTP straight into the local layout, so the item is a
//! local hit from then on. Existence is answered from the distributed
//! index, because content can arrive on demand.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::gateway::Gateway;
use crate::index::{DeviceStatus, NetworkIndex};
use crate::net::http::{fetch_content, serve_content};
use crate::net::Transport;
use crate::store::item::Item;

use super::local::LocalDevice;
use super::DeviceError;

/// Handler namespace of the device overlay.
pub const NS_DEVICE: &str = "p2p-device";
/// Content lookup broadcast.
pub const TYPE_GET: &str = "nd:get";

/// A storage backend that pulls missing content from peers.
#[derive(Clone)]
pub struct NetworkDevice {
    local: LocalDevice,
    index: Arc<NetworkIndex>,
    transport: Arc<Transport>,
    http_port: u16,
}

impl NetworkDevice {
    /// Wrap a local device: start the content server (mapping its port
    /// through the gateway when available) and answer peers' `nd:get`
    /// lookups for content the wrapped device holds.
    pub async fn start(
        local: LocalDevice,
        index: Arc<NetworkIndex>,
        transport: Arc<Transport>,
        gateway: Option<Arc<Gateway>>,
    ) -> std::io::Result<Self> {
        let local_peer_id = index.local_peer().id.clone();
        let http_port = serve_content(local_peer_id, local.clone(), gateway).await?;

        let lookup = local.clone();
        transport
            .on(NS_DEVICE, TYPE_GET, move |env| {
                let lookup = lookup.clone();
                async move {
                    let id = env.data["id"]
                        .as_str()
                        .ok_or_else(|| "missing id".to_string())?
                        .to_string();
                    let present = tokio::fs::try_exists(lookup.content_path(&id))
                        .await
                        .unwrap_or(false);
                    if present {
                        Ok(json!({ "port": http_port }))
                    } else {
                        Err(format!("item not found: {}", id))
                    }
                }
            })
            .await;

        info!(device = %local.id(), port = http_port, "network device started");

        Ok(Self {
            local,
            index,
            transport,
            http_port,
        })
    }

    pub fn id(&self) -> &str {
        self.local.id()
    }

    /// The wrapped local device.
    pub fn local(&self) -> &LocalDevice {
        &self.local
    }

    /// Port of this node's content server.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub async fn put(&self, item: &Item) -> DeviceStatus {
        self.local.put(item).await
    }

    pub async fn ping(&self) -> bool {
        self.local.ping().await
    }

    pub async fn remove(&self, item: &Item) -> Result<(), DeviceError> {
        self.local.remove(item).await
    }

    /// Existence according to the distributed index: content that only
    /// peers hold still counts, since `get` fetches it on demand.
    pub async fn exists(&self, item: &Item) -> bool {
        self.index.get_item(&item.id).await.is_ok()
    }

    /// Local-first get with transparent peer fetch.
    pub async fn get(&self, item: &mut Item) -> Result<(), DeviceError> {
        if self.local.exists(item).await {
            return self.local.get(item).await;
        }

        let peers = self.index.peers().await;
        if peers.is_empty() {
            return Err(DeviceError::Fetch(format!(
                "no peers to fetch {} from",
                item.id
            )));
        }

        let (peer_id, data) = self
            .transport
            .broadcast(&peers, NS_DEVICE, TYPE_GET, item.to_wire())
            .await
            .map_err(|e| DeviceError::Fetch(format!("lookup for {} failed: {}", item.id, e)))?;

        let port = data["port"]
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| DeviceError::Fetch(format!("peer {} sent no port", peer_id)))?;
        let peer = peers
            .into_iter()
            .find(|p| p.id == peer_id)
            .ok_or_else(|| DeviceError::Fetch(format!("unknown responding peer {}", peer_id)))?;

        let dest = self.local.content_path(&item.id);
        let item_json = item.to_wire().to_string();
        let bytes = fetch_content(&peer.address, port, &peer.id, &item_json, &dest)
            .await
            .map_err(|e| DeviceError::Fetch(format!("fetch from {} failed: {}", peer.id, e)))?;

        debug!(item = %item.id, peer = %peer.id, bytes = bytes, "content fetched from peer");
        item.set_source(dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexEntry, LocalIndex};
    use crate::swarm::Peer;

    struct Node {
        device: NetworkDevice,
        index: Arc<NetworkIndex>,
        transport: Arc<Transport>,
        peer: Peer,
        _dir: tempfile::TempDir,
    }

    use crate::testing::{loopback_transport, peer_for};

    async fn overlay_node(name: &str) -> Node {
        let dir = tempfile::tempdir().unwrap();
        let transport = loopback_transport(name, 500).await;
        let peer = peer_for(&transport);
        let local_index = Arc::new(LocalIndex::open(dir.path()).unwrap());
        let index = NetworkIndex::start(local_index, transport.clone(), peer.clone())
            .await
            .unwrap();
        let device = NetworkDevice::start(
            LocalDevice::new(dir.path()),
            index.clone(),
            transport.clone(),
            None,
        )
        .await
        .unwrap();
        Node {
            device,
            index,
            transport,
            peer,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_transparent_peer_fetch() {
        let a = overlay_node("node-a").await;
        let b = overlay_node("node-b").await;

        // seed content on a
        let id = "f".repeat(64);
        let spool = a._dir.path().join("seed");
        tokio::fs::write(&spool, b"replicated bytes").await.unwrap();
        let entry = a
            .index
            .local()
            .create_item(&id, serde_json::json!({"name": "t"}))
            .await
            .unwrap();
        let mut seeded = Item::from_entry(entry.clone());
        seeded.set_source(spool);
        assert!(a.device.put(&seeded).await.is_ok());

        // b learns about a, then fetches transparently
        b.index.join(&a.peer).await.unwrap();
        let mut wanted = Item::from_entry(entry);
        assert!(!b.device.local().exists(&wanted).await);
        b.device.get(&mut wanted).await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        wanted.reader().await.unwrap().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"replicated bytes");

        // the fetch cached the content locally
        assert!(b.device.local().exists(&wanted).await);

        a.transport.close().await;
        b.transport.close().await;
    }

    #[tokio::test]
    async fn test_get_without_peers_fails() {
        let a = overlay_node("node-a").await;
        let mut item = Item::from_entry(IndexEntry::new("a".repeat(64), serde_json::json!({})));
        assert!(matches!(
            a.device.get(&mut item).await,
            Err(DeviceError::Fetch(_))
        ));
        a.transport.close().await;
    }

    #[tokio::test]
    async fn test_exists_consults_the_index() {
        let a = overlay_node("node-a").await;
        let entry = a
            .index
            .local()
            .create_item("indexed-only", serde_json::json!({}))
            .await
            .unwrap();
        let item = Item::from_entry(entry);

        // nothing on disk, but the index knows the id
        assert!(!a.device.local().exists(&item).await);
        assert!(a.device.exists(&item).await);

        let unknown = Item::from_entry(IndexEntry::new("unknown", serde_json::json!({})));
        assert!(!a.device.exists(&unknown).await);

        a.transport.close().await;
    }
}
