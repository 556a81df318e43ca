//! Replication core
//!
//! The store ingests byte streams and replicates them across a fixed
//! set of devices: content is hashed while it spools to a temp file,
//! indexed under its content id, then fanned out to every device in
//! parallel. Per-device outcomes land in the item's status map; the
//! index is the source of truth even when every device failed. A
//! reconciling sync pass re-replicates items with failed placements,
//! either on demand or from a background loop.

pub mod config;
pub mod error;
pub mod item;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::{Device, LocalDevice, NetworkDevice};
use crate::gateway::Gateway;
use crate::index::{is_reserved_id, Index, IndexError, LocalIndex, NetworkIndex};
use crate::net::Transport;
use crate::swarm::{draw_port, Peer, Swarm};

pub use config::StoreConfig;
pub use error::StoreError;
pub use item::{compose_id, Item};

/// Attempts at binding the datagram port before giving up.
const BIND_ATTEMPTS: usize = 8;
/// Spool copy buffer size.
const SPOOL_BUF: usize = 64 * 1024;

/// Operation kind reported to the error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Save,
    Get,
    Delete,
    Sync,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Save => write!(f, "save"),
            Op::Get => write!(f, "get"),
            Op::Delete => write!(f, "delete"),
            Op::Sync => write!(f, "sync"),
        }
    }
}

/// Notification-only error handler: `(error, item id, namespace, op)`.
pub type ErrorHook = Arc<dyn Fn(&StoreError, Option<&str>, Option<&str>, Op) + Send + Sync>;

type HookCell = Arc<std::sync::RwLock<Option<ErrorHook>>>;

fn notify(hook: &HookCell, err: &StoreError, id: Option<&str>, namespace: Option<&str>, op: Op) {
    let hook = hook.read().ok().and_then(|h| h.clone());
    if let Some(hook) = hook {
        hook(err, id, namespace, op);
    }
}

/// Removes the spool file on every exit path of a save.
struct SpoolGuard(PathBuf);

impl Drop for SpoolGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Content-addressed replicating data store.
pub struct Store {
    config: StoreConfig,
    index: Index,
    devices: Vec<Device>,
    swarm: Option<Swarm>,
    transport: Option<Arc<Transport>>,
    gateway: Option<Arc<Gateway>>,
    local_peer: Option<Peer>,
    error_hook: HookCell,
    running: Arc<RwLock<bool>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    spool_dir: PathBuf,
}

impl Store {
    /// Bring up a store under the configured base directory.
    ///
    /// With the overlay enabled this also resolves the gateway (when
    /// configured), binds the datagram transport, registers the local
    /// peer in the network map (with its external address, when one
    /// could be learned, so peers never see the bootstrap address) and
    /// wraps the first device in the peer-fetching adapter.
    pub async fn start(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.base_dir)
            .map_err(|e| StoreError::Start(e.to_string()))?;
        let spool_dir = config.base_dir.join(".spool");
        std::fs::create_dir_all(&spool_dir).map_err(|e| StoreError::Start(e.to_string()))?;

        let local_index = Arc::new(LocalIndex::open(&config.base_dir)?);

        let device_dirs = if config.device_dirs.is_empty() {
            vec![config.base_dir.clone()]
        } else {
            config.device_dirs.clone()
        };
        let mut locals: Vec<LocalDevice> = if device_dirs.len() == 1 {
            vec![LocalDevice::new(&device_dirs[0])]
        } else {
            device_dirs
                .iter()
                .enumerate()
                .map(|(i, dir)| LocalDevice::with_id(format!("local-{}", i), dir))
                .collect()
        };

        let running = Arc::new(RwLock::new(true));

        let (index, devices, swarm, transport, gateway, local_peer) = if config.p2p {
            let gateway = if config.gateway {
                let gateway = Gateway::new(
                    config.namespace.clone(),
                    Duration::from_secs(config.discovery_timeout_secs),
                );
                match gateway.ready().await {
                    Ok(()) => Some(Arc::new(gateway)),
                    Err(e) => {
                        warn!(error = %e, "gateway unavailable, overlay stays local-network");
                        None
                    }
                }
            } else {
                None
            };

            let swarm = Swarm::open(&config.base_dir)?;
            let mut local_peer = swarm.local_node()?;

            // bind the persisted port, drawing fresh ones if taken
            let request_timeout = Duration::from_secs(config.request_timeout_secs);
            let broadcast_timeout = Duration::from_secs(config.broadcast_timeout_secs);
            let mut transport = None;
            for _ in 0..BIND_ATTEMPTS {
                match Transport::bind(
                    local_peer.id.clone(),
                    local_peer.port,
                    request_timeout,
                    broadcast_timeout,
                )
                .await
                {
                    Ok(t) => {
                        transport = Some(t);
                        break;
                    }
                    Err(e) => {
                        warn!(port = local_peer.port, error = %e, "datagram bind failed, drawing a new port");
                        local_peer = swarm.update_local_port(draw_port())?;
                    }
                }
            }
            let transport = Arc::new(transport.ok_or_else(|| {
                StoreError::Start("could not bind a datagram port".to_string())
            })?);

            // the external address must be known before the local peer
            // is registered in the network map
            if let Some(gateway) = &gateway {
                match gateway.external_address().await {
                    Ok(address) => {
                        local_peer = swarm.update_local_node(&address.to_string())?;
                    }
                    Err(e) => warn!(error = %e, "external address unavailable"),
                }
                if let Err(e) = gateway.open_port("udp", local_peer.port).await {
                    warn!(port = local_peer.port, error = %e, "datagram port mapping failed");
                }
            }

            let network_index =
                NetworkIndex::start(local_index.clone(), transport.clone(), local_peer.clone())
                    .await?;

            // the persisted roster seeds the network map
            for peer in swarm.peers()? {
                network_index.join(&peer).await?;
            }

            let first = locals.remove(0);
            let network_device = NetworkDevice::start(
                first,
                network_index.clone(),
                transport.clone(),
                gateway.clone(),
            )
            .await
            .map_err(|e| StoreError::Start(e.to_string()))?;

            let mut devices = vec![Device::Network(network_device)];
            devices.extend(locals.into_iter().map(Device::Local));

            (
                Index::Network(network_index),
                devices,
                Some(swarm),
                Some(transport),
                gateway,
                Some(local_peer),
            )
        } else {
            let devices = locals.into_iter().map(Device::Local).collect();
            (Index::Local(local_index), devices, None, None, None, None)
        };

        let error_hook: HookCell = Arc::new(std::sync::RwLock::new(None));
        let tasks = Mutex::new(Vec::new());

        let store = Self {
            config,
            index,
            devices,
            swarm,
            transport,
            gateway,
            local_peer,
            error_hook,
            running,
            tasks,
            spool_dir,
        };

        if store.config.sync_interval_secs > 0 {
            store.spawn_sync_loop().await;
        }

        info!(
            base_dir = %store.config.base_dir.display(),
            devices = store.devices.len(),
            p2p = store.config.p2p,
            "store started"
        );
        Ok(store)
    }

    /// Install the notification-only error handler.
    pub fn set_error_hook(&self, hook: ErrorHook) {
        if let Ok(mut cell) = self.error_hook.write() {
            *cell = Some(hook);
        }
    }

    /// This node's peer record, when the overlay is enabled.
    pub fn local_peer(&self) -> Option<&Peer> {
        self.local_peer.as_ref()
    }

    /// Peers in the network map.
    pub async fn peers(&self) -> Vec<Peer> {
        match &self.index {
            Index::Network(network) => network.peers().await,
            Index::Local(_) => Vec::new(),
        }
    }

    /// Add a peer to the roster and the network map.
    pub async fn join_peer(&self, peer: Peer) -> Result<(), StoreError> {
        if let Some(swarm) = &self.swarm {
            swarm.join(&peer)?;
        }
        if let Index::Network(network) = &self.index {
            network.join(&peer).await?;
        }
        Ok(())
    }

    /// Remove a peer from the roster and the network map.
    pub async fn leave_peer(&self, peer: &Peer) -> Result<(), StoreError> {
        if let Some(swarm) = &self.swarm {
            swarm.leave(peer)?;
        }
        if let Index::Network(network) = &self.index {
            network.leave(peer).await?;
        }
        Ok(())
    }

    /// Ingest a byte stream.
    ///
    /// The stream is hashed while it spools; the id is the hex digest
    /// plus the optional namespace suffix. The item is indexed before
    /// any device sees it, the fan-out runs in parallel, and the spool
    /// is gone by the time this returns, on every path. When some
    /// devices fail the item is carried inside the replication error;
    /// it is indexed and readable from the devices that succeeded.
    pub async fn save<R>(
        &self,
        mut stream: R,
        namespace: Option<&str>,
        metadata: Value,
    ) -> Result<Item, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let spool = self.spool_dir.join(Uuid::new_v4().to_string());
        let _guard = SpoolGuard(spool.clone());

        // hash while teeing to the spool
        let mut hasher = Sha256::new();
        let mut file = tokio::fs::File::create(&spool)
            .await
            .map_err(|e| StoreError::Spool(e.to_string()))?;
        let mut buf = vec![0u8; SPOOL_BUF];
        loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| StoreError::Spool(e.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .await
                .map_err(|e| StoreError::Spool(e.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|e| StoreError::Spool(e.to_string()))?;
        drop(file);

        let id = compose_id(&hex::encode(hasher.finalize()), namespace);

        let entry = match self.index.create_item(&id, metadata).await {
            Ok(entry) => entry,
            Err(IndexError::Exists(_)) => {
                // a fully-failed item may be re-attached by saving
                // matching content again
                let existing = self.index.get_item(&id).await?;
                if existing.is_missing() {
                    debug!(id = %id, "re-attaching missing item");
                    existing
                } else {
                    let err = StoreError::Index(IndexError::Exists(id.clone()));
                    notify(&self.error_hook, &err, Some(&id), namespace, Op::Save);
                    return Err(err);
                }
            }
            Err(e) => {
                let err = StoreError::Index(e);
                notify(&self.error_hook, &err, Some(&id), namespace, Op::Save);
                return Err(err);
            }
        };

        let mut item = Item::from_entry(entry);
        item.set_source(spool.clone());

        // parallel fan-out to every device
        let puts = self.devices.iter().map(|device| {
            let item = item.clone();
            async move { (device.id().to_string(), device.put(&item).await) }
        });
        let results = futures::future::join_all(puts).await;

        let mut failed = false;
        for (device_id, status) in results {
            if !status.is_ok() {
                failed = true;
            }
            item.status.insert(device_id.clone(), status.clone());
            if let Err(e) = self.index.set_status(&id, &device_id, status).await {
                warn!(id = %id, device = %device_id, error = %e, "status not persisted");
            }
        }

        // the spool is about to go; point the producer at a good copy
        match self
            .devices
            .iter()
            .find(|d| item.status.get(d.id()).map(|s| s.is_ok()).unwrap_or(false))
        {
            Some(device) => item.set_source(device.content_path(&id)),
            None => item.clear_source(),
        }

        if failed {
            let err = StoreError::Replication {
                item: Box::new(item),
            };
            notify(&self.error_hook, &err, Some(&id), namespace, Op::Save);
            return Err(err);
        }

        debug!(id = %id, devices = self.devices.len(), "item saved");
        Ok(item)
    }

    /// Fetch an item's content from the first available device.
    pub async fn get(&self, id: &str, namespace: Option<&str>) -> Result<Item, StoreError> {
        let full_id = compose_id(id, namespace);

        let entry = match self.index.get_item(&full_id).await {
            Ok(entry) => entry,
            Err(e) => {
                let err = StoreError::Index(e);
                notify(&self.error_hook, &err, Some(&full_id), namespace, Op::Get);
                return Err(err);
            }
        };
        let mut item = Item::from_entry(entry);

        for device in &self.devices {
            if !device.ping().await || !device.exists(&item).await {
                continue;
            }
            return match device.get(&mut item).await {
                Ok(()) => Ok(item),
                Err(e) => {
                    let err = StoreError::Device(e);
                    notify(&self.error_hook, &err, Some(&full_id), namespace, Op::Get);
                    Err(err)
                }
            };
        }

        let err = StoreError::NoDevice(full_id.clone());
        notify(&self.error_hook, &err, Some(&full_id), namespace, Op::Get);
        Err(err)
    }

    /// Remove the item from every device best-effort, then mark the
    /// index entry deleted. The entry stays addressable.
    pub async fn delete(&self, id: &str, namespace: Option<&str>) -> Result<(), StoreError> {
        let full_id = compose_id(id, namespace);

        let entry = match self.index.get_item(&full_id).await {
            Ok(entry) => entry,
            Err(e) => {
                let err = StoreError::Index(e);
                notify(&self.error_hook, &err, Some(&full_id), namespace, Op::Delete);
                return Err(err);
            }
        };
        let item = Item::from_entry(entry);

        for device in &self.devices {
            if let Err(e) = device.remove(&item).await {
                warn!(id = %full_id, device = %device.id(), error = %e, "physical removal failed");
                let err = StoreError::Device(e);
                notify(&self.error_hook, &err, Some(&full_id), namespace, Op::Delete);
            }
        }

        self.index.mark_deleted(&full_id).await?;
        info!(id = %full_id, "item deleted");
        Ok(())
    }

    /// Re-replicate failed placements.
    ///
    /// With an id, reconciles that item; with none, scans the whole
    /// index. Per-item errors are swallowed and reported through the
    /// error handler.
    pub async fn sync(&self, id: Option<&str>) -> Result<(), StoreError> {
        if let Some(id) = id {
            // surface an unknown id to the caller; pass-level errors
            // below still go through the hook only
            self.index.get_item(id).await?;
        }
        Self::run_sync_pass(&self.index, &self.devices, &self.error_hook, id).await;
        Ok(())
    }

    /// Drop index entries that are marked deleted or fully failed.
    pub async fn purge(&self) -> Result<(), StoreError> {
        for entry in self.index.items().await {
            if is_reserved_id(&entry.id) {
                continue;
            }
            if entry.deleted || entry.is_missing() {
                self.index.remove_item(&entry.id).await?;
                info!(id = %entry.id, "entry purged");
            }
        }
        Ok(())
    }

    /// Flush the index and release the transport. The datagram port
    /// mapping is returned to the gateway; the content server and its
    /// mapping persist for process lifetime.
    pub async fn close(&self) -> Result<(), StoreError> {
        *self.running.write().await = false;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(transport) = &self.transport {
            transport.close().await;
        }
        if let (Some(gateway), Some(peer)) = (&self.gateway, &self.local_peer) {
            if let Err(e) = gateway.close_port(Some("udp"), Some(peer.port)).await {
                warn!(error = %e, "datagram port unmapping failed");
            }
        }
        self.index.flush().await?;
        info!("store closed");
        Ok(())
    }

    async fn spawn_sync_loop(&self) {
        let index = self.index.clone();
        let devices = self.devices.clone();
        let hook = self.error_hook.clone();
        let running = self.running.clone();
        let interval = Duration::from_secs(self.config.sync_interval_secs);

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !*running.read().await {
                    break;
                }
                Self::run_sync_pass(&index, &devices, &hook, None).await;
            }
        });
        self.tasks.lock().await.push(task);
    }

    /// One reconciliation pass: for every targeted entry, find a
    /// readable copy and re-put it on each device whose status is not
    /// success. Errors are swallowed and reported through the hook.
    async fn run_sync_pass(index: &Index, devices: &[Device], hook: &HookCell, target: Option<&str>) {
        let entries = match target {
            Some(id) => match index.get_item(id).await {
                Ok(entry) => vec![entry],
                Err(e) => {
                    notify(hook, &StoreError::Index(e), Some(id), None, Op::Sync);
                    return;
                }
            },
            None => index.items().await,
        };

        for entry in entries {
            if is_reserved_id(&entry.id) || entry.deleted {
                continue;
            }
            let pending: Vec<usize> = devices
                .iter()
                .enumerate()
                .filter(|(_, d)| {
                    entry
                        .status
                        .get(d.id())
                        .map(|s| !s.is_ok())
                        .unwrap_or(true)
                })
                .map(|(i, _)| i)
                .collect();
            if pending.is_empty() {
                continue;
            }

            // find a readable copy to replicate from
            let mut item = Item::from_entry(entry);
            let mut readable = false;
            for device in devices {
                if device.ping().await
                    && device.exists(&item).await
                    && device.get(&mut item).await.is_ok()
                {
                    readable = true;
                    break;
                }
            }
            if !readable {
                let err = StoreError::NoDevice(item.id.clone());
                notify(hook, &err, Some(&item.id), None, Op::Sync);
                continue;
            }

            for i in pending {
                let device = &devices[i];
                let status = device.put(&item).await;
                if status.is_ok() {
                    debug!(id = %item.id, device = %device.id(), "placement reconciled");
                } else {
                    let err = StoreError::Device(crate::device::DeviceError::Io(
                        status
                            .message
                            .clone()
                            .unwrap_or_else(|| "put failed".to_string()),
                    ));
                    notify(hook, &err, Some(&item.id), None, Op::Sync);
                }
                if let Err(e) = index.set_status(&item.id, device.id(), status).await {
                    notify(hook, &StoreError::Index(e), Some(&item.id), None, Op::Sync);
                }
            }
        }
    }
}
