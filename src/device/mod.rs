//! Storage devices
//!
//! A device is a backend with put/get/exists/ping (and best-effort
//! remove). The store holds a fixed vector of the two variants: plain
//! local filesystem devices, and the overlay-aware wrapper that pulls
//! missing content from peers.

pub mod local;
pub mod network;

use std::path::PathBuf;

use crate::index::DeviceStatus;
use crate::store::item::Item;

pub use local::{LocalDevice, DEFAULT_DEVICE_ID};
pub use network::{NetworkDevice, NS_DEVICE, TYPE_GET};

/// Errors from device operations.
#[derive(Debug)]
pub enum DeviceError {
    /// The device does not hold the item
    NotFound(String),
    /// The item has no content source to read from
    NoContent(String),
    Io(String),
    /// A remote fetch could not be completed
    Fetch(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::NotFound(id) => write!(f, "item not on device: {}", id),
            DeviceError::NoContent(e) => write!(f, "no content source: {}", e),
            DeviceError::Io(e) => write!(f, "io error: {}", e),
            DeviceError::Fetch(e) => write!(f, "remote fetch failed: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        DeviceError::Io(e.to_string())
    }
}

/// Device variants the store holds.
#[derive(Clone)]
pub enum Device {
    Local(LocalDevice),
    Network(NetworkDevice),
}

impl Device {
    pub fn id(&self) -> &str {
        match self {
            Device::Local(d) => d.id(),
            Device::Network(d) => d.id(),
        }
    }

    /// Where this device keeps (or would keep) the id's content.
    pub fn content_path(&self, id: &str) -> PathBuf {
        match self {
            Device::Local(d) => d.content_path(id),
            Device::Network(d) => d.local().content_path(id),
        }
    }

    pub async fn put(&self, item: &Item) -> DeviceStatus {
        match self {
            Device::Local(d) => d.put(item).await,
            Device::Network(d) => d.put(item).await,
        }
    }

    pub async fn get(&self, item: &mut Item) -> Result<(), DeviceError> {
        match self {
            Device::Local(d) => d.get(item).await,
            Device::Network(d) => d.get(item).await,
        }
    }

    pub async fn exists(&self, item: &Item) -> bool {
        match self {
            Device::Local(d) => d.exists(item).await,
            Device::Network(d) => d.exists(item).await,
        }
    }

    pub async fn ping(&self) -> bool {
        match self {
            Device::Local(d) => d.ping().await,
            Device::Network(d) => d.ping().await,
        }
    }

    pub async fn remove(&self, item: &Item) -> Result<(), DeviceError> {
        match self {
            Device::Local(d) => d.remove(item).await,
            Device::Network(d) => d.remove(item).await,
        }
    }
}
