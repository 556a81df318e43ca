//! Quay
//!
//! Content-addressed, multi-device replicating data store with an
//! optional peer-to-peer overlay.
//!
//! A byte stream goes in; an immutable item comes out, identified by
//! the SHA-256 of its content (plus an optional namespace suffix). The
//! item is replicated across a fixed set of devices: local storage
//! backends, one of which may be a peer adapter that lazily fetches
//! bytes from remote nodes when no local copy exists. A central index
//! maps item ids to metadata and per-device placement status.
//!
//! # Module Structure
//!
//! - `store/`: Replication core (save/get/delete/sync/purge, config,
//!   items and identity)
//! - `index/`: Local id → item map and the overlay-aware wrapper with
//!   broadcast-fallback reads
//! - `device/`: Content-addressed local storage and the peer-fetching
//!   adapter
//! - `net/`: Datagram transport (correlation, dispatch, broadcasts)
//!   and the HTTP content side-channel
//! - `swarm/`: Persistent peer roster and local identity
//! - `gateway/`: uPnP IGD discovery and port mapping (SSDP + SOAP)
//! - `testing/`: Loopback test utilities
//!
//! # Quick Start
//!
//! ```ignore
//! use quay::{Store, StoreConfig};
//!
//! let store = Store::start(StoreConfig::new("/var/lib/quay")).await?;
//!
//! let item = store.save(&bytes[..], None, serde_json::json!({"name": "report"})).await?;
//! println!("saved as {}", item.id);
//!
//! let fetched = store.get(&item.id, None).await?;
//! let mut reader = fetched.reader().await?;
//! ```

// Public interface
pub mod store;

// Infrastructure modules
pub mod device;
pub mod gateway;
pub mod index;
pub mod net;
pub mod swarm;
pub mod testing;

// Re-export main API types for convenience
pub use device::{Device, DeviceError, LocalDevice, NetworkDevice};
pub use gateway::{Gateway, GatewayError, PortMapping};
pub use index::{DeviceStatus, Index, IndexEntry, IndexError, LocalIndex, NetworkIndex};
pub use net::{Envelope, NetError, Transport};
pub use store::{compose_id, ErrorHook, Item, Op, Store, StoreConfig, StoreError};
pub use swarm::{Peer, Swarm, SwarmError};
