//! Store configuration

use std::path::PathBuf;

/// Configuration for a store instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base directory: index, peer roster, spool and the default
    /// device layout all live under it
    pub base_dir: PathBuf,

    /// Base directories for additional local devices. Empty means one
    /// device rooted at `base_dir`.
    pub device_dirs: Vec<PathBuf>,

    /// Enable the peer overlay (transport, network index, network
    /// device wrapping the first local device)
    pub p2p: bool,

    /// Try to reach a uPnP gateway for the external address and port
    /// mappings. Failure is logged and non-fatal.
    pub gateway: bool,

    /// Description tag for gateway port mappings, so this instance only
    /// enumerates and deletes its own
    pub namespace: String,

    /// Response deadline for a single peer request (seconds)
    /// Default: 6
    pub request_timeout_secs: u64,

    /// Window for broadcast responses before not-found (seconds)
    /// Default: 10
    pub broadcast_timeout_secs: u64,

    /// SSDP discovery deadline (seconds)
    /// Default: 3
    pub discovery_timeout_secs: u64,

    /// Interval of the background re-replication pass (seconds)
    /// Default: 0 (disabled)
    pub sync_interval_secs: u64,
}

impl StoreConfig {
    /// Config with defaults under the given base directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            device_dirs: Vec::new(),
            p2p: false,
            gateway: false,
            namespace: "quay".to_string(),
            request_timeout_secs: 6,
            broadcast_timeout_secs: 10,
            discovery_timeout_secs: 3,
            sync_interval_secs: 0,
        }
    }

    /// Add a local device rooted at the given directory.
    pub fn with_device_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.device_dirs.push(dir.into());
        self
    }

    /// Replace the device directories.
    pub fn with_device_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.device_dirs = dirs;
        self
    }

    /// Enable the peer overlay.
    pub fn with_p2p(mut self) -> Self {
        self.p2p = true;
        self
    }

    /// Enable gateway discovery and port mapping.
    pub fn with_gateway(mut self) -> Self {
        self.gateway = true;
        self
    }

    /// Set the port-mapping namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the single-request response deadline.
    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Set the broadcast response window.
    pub fn with_broadcast_timeout(mut self, secs: u64) -> Self {
        self.broadcast_timeout_secs = secs;
        self
    }

    /// Set the background sync interval (0 disables it).
    pub fn with_sync_interval(mut self, secs: u64) -> Self {
        self.sync_interval_secs = secs;
        self
    }

    /// Configuration for tests: no overlay, tight deadlines.
    pub fn for_testing(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            device_dirs: Vec::new(),
            p2p: false,
            gateway: false,
            namespace: "quay-test".to_string(),
            request_timeout_secs: 1,
            broadcast_timeout_secs: 1,
            discovery_timeout_secs: 1,
            sync_interval_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new("/tmp/store");
        assert_eq!(config.base_dir, PathBuf::from("/tmp/store"));
        assert!(config.device_dirs.is_empty());
        assert!(!config.p2p);
        assert!(!config.gateway);
        assert_eq!(config.request_timeout_secs, 6);
        assert_eq!(config.broadcast_timeout_secs, 10);
        assert_eq!(config.discovery_timeout_secs, 3);
        assert_eq!(config.sync_interval_secs, 0);
    }

    #[test]
    fn test_builder_chain() {
        let config = StoreConfig::new("/tmp/store")
            .with_device_dir("/tmp/a")
            .with_device_dir("/tmp/b")
            .with_p2p()
            .with_namespace("custom")
            .with_broadcast_timeout(3)
            .with_sync_interval(30);

        assert_eq!(config.device_dirs.len(), 2);
        assert!(config.p2p);
        assert_eq!(config.namespace, "custom");
        assert_eq!(config.broadcast_timeout_secs, 3);
        assert_eq!(config.sync_interval_secs, 30);
    }

    #[test]
    fn test_testing_config_is_tight() {
        let config = StoreConfig::for_testing("/tmp/t");
        assert!(!config.p2p);
        assert!(!config.gateway);
        assert!(config.request_timeout_secs <= 2);
        assert!(config.broadcast_timeout_secs <= 2);
    }
}
