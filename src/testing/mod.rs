//! Test utilities
//!
//! Loopback building blocks for exercising the overlay without real
//! networks: ephemeral transports bound to 127.0.0.1 and peer records
//! pointing at them.

use std::sync::Arc;
use std::time::Duration;

use crate::net::Transport;
use crate::swarm::Peer;

/// A peer record pointing at a loopback port.
pub fn loopback_peer(id: &str, port: u16) -> Peer {
    Peer {
        id: id.to_string(),
        address: "127.0.0.1".to_string(),
        port,
        protocol: "http".to_string(),
        master: false,
    }
}

/// Bind a transport on an ephemeral port with uniform tight deadlines.
pub async fn loopback_transport(id: &str, timeout_ms: u64) -> Arc<Transport> {
    Arc::new(
        Transport::bind(
            id.to_string(),
            0,
            Duration::from_millis(timeout_ms),
            Duration::from_millis(timeout_ms),
        )
        .await
        .expect("loopback transport bind"),
    )
}

/// The peer record other test nodes should use to reach a transport.
pub fn peer_for(transport: &Transport) -> Peer {
    loopback_peer(transport.local_id(), transport.local_addr().port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_transport_is_reachable() {
        let t = loopback_transport("probe", 500).await;
        let peer = peer_for(&t);
        assert_eq!(peer.id, "probe");
        assert_eq!(peer.address, "127.0.0.1");
        assert_eq!(peer.port, t.local_addr().port());
        t.close().await;
    }
}
