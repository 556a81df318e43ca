//! Peer roster
//!
//! One JSON file per peer under `peers/` in the store's base directory;
//! the reserved `__local__` file holds this node's own identity. The
//! local peer is bootstrapped on first run with a fresh UUID, address
//! `"localhost"` and a random port; the overlay later overwrites the
//! address with the gateway-derived external one.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Reserved roster filename for the local peer.
pub const LOCAL_PEER_FILE: &str = "__local__";

/// Inclusive lower bound of the unprivileged port range we draw from.
const PORT_MIN: u16 = 1024;
/// Exclusive upper bound of the port range we draw from.
const PORT_MAX: u16 = 13024;

/// Draw a random port in [1024, 13024).
pub fn draw_port() -> u16 {
    rand::thread_rng().gen_range(PORT_MIN..PORT_MAX)
}

/// A participant in the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// UUIDv4
    pub id: String,
    /// IPv4 address or hostname
    pub address: String,
    /// Datagram port, 1024-65535
    pub port: u16,
    /// Transfer protocol for the content side-channel
    pub protocol: String,
    pub master: bool,
}

impl Peer {
    /// Bootstrap a local peer identity with a random port.
    pub fn local() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            address: "localhost".to_string(),
            port: draw_port(),
            protocol: "http".to_string(),
            master: false,
        }
    }
}

/// Errors from roster persistence.
#[derive(Debug)]
pub enum SwarmError {
    Io(String),
    /// A roster file held something that is not a peer
    Corrupt(String),
}

impl std::fmt::Display for SwarmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwarmError::Io(e) => write!(f, "io error: {}", e),
            SwarmError::Corrupt(e) => write!(f, "corrupt peer file: {}", e),
        }
    }
}

impl std::error::Error for SwarmError {}

impl From<std::io::Error> for SwarmError {
    fn from(e: std::io::Error) -> Self {
        SwarmError::Io(e.to_string())
    }
}

/// Persistent peer roster under `<base_dir>/peers/`.
#[derive(Debug, Clone)]
pub struct Swarm {
    peers_dir: PathBuf,
}

impl Swarm {
    /// Open (and create if needed) the roster directory.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self, SwarmError> {
        let peers_dir = base_dir.as_ref().join("peers");
        fs::create_dir_all(&peers_dir)?;
        Ok(Self { peers_dir })
    }

    fn peer_path(&self, name: &str) -> PathBuf {
        self.peers_dir.join(name)
    }

    fn read_peer(&self, path: &Path) -> Result<Peer, SwarmError> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| SwarmError::Corrupt(e.to_string()))
    }

    fn write_peer(&self, name: &str, peer: &Peer) -> Result<(), SwarmError> {
        let raw = serde_json::to_string_pretty(peer)
            .map_err(|e| SwarmError::Corrupt(e.to_string()))?;
        fs::write(self.peer_path(name), raw)?;
        Ok(())
    }

    /// Load the local peer, bootstrapping one on first run.
    pub fn local_node(&self) -> Result<Peer, SwarmError> {
        let path = self.peer_path(LOCAL_PEER_FILE);
        if path.exists() {
            return self.read_peer(&path);
        }
        let peer = Peer::local();
        self.write_peer(LOCAL_PEER_FILE, &peer)?;
        info!(peer = %peer.id, port = peer.port, "bootstrapped local peer");
        Ok(peer)
    }

    /// All remote peers (the local node is excluded).
    pub fn peers(&self) -> Result<Vec<Peer>, SwarmError> {
        let mut peers = Vec::new();
        for entry in fs::read_dir(&self.peers_dir)? {
            let entry = entry?;
            if entry.file_name() == LOCAL_PEER_FILE {
                continue;
            }
            peers.push(self.read_peer(&entry.path())?);
        }
        Ok(peers)
    }

    /// Overwrite the local peer's address, keeping everything else.
    pub fn update_local_node(&self, address: &str) -> Result<Peer, SwarmError> {
        let mut peer = self.local_node()?;
        peer.address = address.to_string();
        self.write_peer(LOCAL_PEER_FILE, &peer)?;
        debug!(peer = %peer.id, address = %peer.address, "updated local address");
        Ok(peer)
    }

    /// Overwrite the local peer's port (after a failed socket bind).
    pub fn update_local_port(&self, port: u16) -> Result<Peer, SwarmError> {
        let mut peer = self.local_node()?;
        peer.port = port;
        self.write_peer(LOCAL_PEER_FILE, &peer)?;
        debug!(peer = %peer.id, port = peer.port, "updated local port");
        Ok(peer)
    }

    /// Add a peer, overwriting any existing entry with the same id.
    pub fn join(&self, peer: &Peer) -> Result<(), SwarmError> {
        self.write_peer(&peer.id, peer)?;
        info!(peer = %peer.id, address = %peer.address, "peer joined");
        Ok(())
    }

    /// Remove a peer from the roster.
    pub fn leave(&self, peer: &Peer) -> Result<(), SwarmError> {
        match fs::remove_file(self.peer_path(&peer.id)) {
            Ok(()) => {
                info!(peer = %peer.id, "peer left");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
