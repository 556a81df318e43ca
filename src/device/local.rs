//! Local device
//!
//! Content-addressed filesystem layout under a base directory:
//! `<id[0:2]>/<id[2:6]>/<id[4:10]>/<id>`. Directories are created on
//! demand; writes go through a temp file and rename so a failed put
//! never leaves a half-written content file at the target path.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::index::DeviceStatus;
use crate::store::item::Item;

use super::DeviceError;

/// Default device id; stores wiring several local devices give each an
/// explicit distinct id since the status map is keyed by it.
pub const DEFAULT_DEVICE_ID: &str = "local";

/// A storage backend on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDevice {
    id: String,
    base_dir: PathBuf,
}

impl LocalDevice {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self::with_id(DEFAULT_DEVICE_ID, base_dir)
    }

    pub fn with_id(id: impl Into<String>, base_dir: impl AsRef<Path>) -> Self {
        Self {
            id: id.into(),
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Target path for an id in the fan-out layout. Ids shorter than
    /// the fan-out window land flat under the base directory.
    pub fn content_path(&self, id: &str) -> PathBuf {
        if id.len() < 10 {
            return self.base_dir.join(id);
        }
        self.base_dir
            .join(&id[0..2])
            .join(&id[2..6])
            .join(&id[4..10])
            .join(id)
    }

    /// Copy the item's content to this device.
    ///
    /// Returns the status to record: 200 on success, 500 with the
    /// failure message otherwise. Never retries.
    pub async fn put(&self, item: &Item) -> DeviceStatus {
        match self.try_put(item).await {
            Ok(bytes) => {
                debug!(device = %self.id, item = %item.id, bytes = bytes, "content stored");
                DeviceStatus::ok()
            }
            Err(e) => {
                warn!(device = %self.id, item = %item.id, error = %e, "put failed");
                DeviceStatus::failed(e.to_string())
            }
        }
    }

    async fn try_put(&self, item: &Item) -> Result<u64, DeviceError> {
        let mut reader = item
            .reader()
            .await
            .map_err(|e| DeviceError::NoContent(e.to_string()))?;

        let target = self.content_path(&item.id);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = target.with_extension(format!("tmp.{}", std::process::id()));
        let result = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            let bytes = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            Ok::<u64, std::io::Error>(bytes)
        }
        .await;

        match result {
            Ok(bytes) => {
                tokio::fs::rename(&temp, &target).await?;
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                Err(e.into())
            }
        }
    }

    /// Repoint the item's content producer at this device's copy.
    pub async fn get(&self, item: &mut Item) -> Result<(), DeviceError> {
        let target = self.content_path(&item.id);
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(DeviceError::NotFound(item.id.clone()));
        }
        item.set_source(target);
        Ok(())
    }

    pub async fn exists(&self, item: &Item) -> bool {
        tokio::fs::try_exists(self.content_path(&item.id))
            .await
            .unwrap_or(false)
    }

    pub async fn ping(&self) -> bool {
        true
    }

    /// Best-effort unlink; absence is not an error.
    pub async fn remove(&self, item: &Item) -> Result<(), DeviceError> {
        match tokio::fs::remove_file(self.content_path(&item.id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexEntry;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    fn item_with_source(id: &str, source: PathBuf) -> Item {
        let mut item = Item::from_entry(IndexEntry::new(id, json!({})));
        item.set_source(source);
        item
    }

    #[test]
    fn test_content_path_layout() {
        let device = LocalDevice::new("/data");
        let id = "9f64a747e1b97f131fabb6b447296c9b6f0201e79fb3c5356e6c77e89b6a806a";
        assert_eq!(
            device.content_path(id),
            PathBuf::from("/data/9f/64a7/a747e1").join(id)
        );
    }

    #[test]
    fn test_content_path_with_namespace_suffix() {
        let device = LocalDevice::new("/data");
        let id = "9f64a747e1b97f131fabb6b447296c9b6f0201e79fb3c5356e6c77e89b6a806a_photos";
        let path = device.content_path(id);
        assert!(path.starts_with("/data/9f/64a7/a747e1"));
        assert!(path.to_string_lossy().ends_with("_photos"));
    }

    #[test]
    fn test_short_id_lands_flat() {
        let device = LocalDevice::new("/data");
        assert_eq!(device.content_path("foo"), PathBuf::from("/data/foo"));
    }

    #[tokio::test]
    async fn test_put_get_exists_roundtrip() {
        let spool_dir = tempfile::tempdir().unwrap();
        let spool = spool_dir.path().join("spool");
        tokio::fs::write(&spool, b"payload").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let device = LocalDevice::with_id("local-0", dir.path());
        let id = "a".repeat(64);
        let mut item = item_with_source(&id, spool);

        assert!(!device.exists(&item).await);
        assert!(device.put(&item).await.is_ok());
        assert!(device.exists(&item).await);

        // get repoints the producer at the device copy
        item.clear_source();
        device.get(&mut item).await.unwrap();
        let mut buf = Vec::new();
        item.reader().await.unwrap().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"payload");
    }

    #[tokio::test]
    async fn test_put_without_source_reports_500() {
        let dir = tempfile::tempdir().unwrap();
        let device = LocalDevice::new(dir.path());
        let item = Item::from_entry(IndexEntry::new("b".repeat(64), json!({})));

        let status = device.put(&item).await;
        assert_eq!(status.code, 500);
        assert!(status.message.is_some());
        assert!(!device.exists(&item).await);
    }

    #[tokio::test]
    async fn test_put_failure_leaves_no_partial_file() {
        let spool_dir = tempfile::tempdir().unwrap();
        let spool = spool_dir.path().join("spool");
        tokio::fs::write(&spool, b"payload").await.unwrap();

        // base dir is an existing *file*, so directory creation fails
        let blocker_dir = tempfile::tempdir().unwrap();
        let blocker = blocker_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let device = LocalDevice::new(&blocker);
        let id = "c".repeat(64);
        let item = item_with_source(&id, spool);

        let status = device.put(&item).await;
        assert_eq!(status.code, 500);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let device = LocalDevice::new(dir.path());
        let mut item = Item::from_entry(IndexEntry::new("d".repeat(64), json!({})));
        assert!(matches!(
            device.get(&mut item).await,
            Err(DeviceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let device = LocalDevice::new(dir.path());
        let item = Item::from_entry(IndexEntry::new("e".repeat(64), json!({})));

        // removing an absent item succeeds
        device.remove(&item).await.unwrap();

        let spool_dir = tempfile::tempdir().unwrap();
        let spool = spool_dir.path().join("spool");
        tokio::fs::write(&spool, b"x").await.unwrap();
        let mut stored = item.clone();
        stored.set_source(spool);
        device.put(&stored).await;
        assert!(device.exists(&stored).await);

        device.remove(&stored).await.unwrap();
        assert!(!device.exists(&stored).await);
    }
}
