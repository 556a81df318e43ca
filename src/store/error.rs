//! Store errors

use crate::device::DeviceError;
use crate::index::IndexError;
use crate::net::NetError;
use crate::swarm::SwarmError;

use super::item::Item;

/// Errors surfaced by store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Failed to bring the store up
    Start(String),
    /// Index failure; fatal to the operation it happened in
    Index(IndexError),
    /// Device failure outside the save fan-out
    Device(DeviceError),
    /// Transport failure
    Net(NetError),
    /// Peer roster failure
    Swarm(SwarmError),
    /// Some devices rejected the content during save. The item is
    /// still indexed; per-device detail is in its status map.
    Replication { item: Box<Item> },
    /// No device could produce the item
    NoDevice(String),
    /// The temporary spool could not be written
    Spool(String),
    /// IO error
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Start(e) => write!(f, "failed to start store: {}", e),
            StoreError::Index(e) => write!(f, "index error: {}", e),
            StoreError::Device(e) => write!(f, "device error: {}", e),
            StoreError::Net(e) => write!(f, "network error: {}", e),
            StoreError::Swarm(e) => write!(f, "swarm error: {}", e),
            StoreError::Replication { item } => {
                write!(f, "item {} could not be sent to some devices", item.id)
            }
            StoreError::NoDevice(id) => write!(f, "no available device for {}", id),
            StoreError::Spool(e) => write!(f, "spool error: {}", e),
            StoreError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<IndexError> for StoreError {
    fn from(e: IndexError) -> Self {
        StoreError::Index(e)
    }
}

impl From<DeviceError> for StoreError {
    fn from(e: DeviceError) -> Self {
        StoreError::Device(e)
    }
}

impl From<NetError> for StoreError {
    fn from(e: NetError) -> Self {
        StoreError::Net(e)
    }
}

impl From<SwarmError> for StoreError {
    fn from(e: SwarmError) -> Self {
        StoreError::Swarm(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}
