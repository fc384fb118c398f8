//! Live views over cached artifacts found during enumeration.
//!
//! Sizes and removals are deferred: each view carries the engine operation it
//! needs, bound at construction, and only runs it when asked.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;

use crate::Error;
use crate::config::Driver;
use crate::reuse::ReuseRecord;

/// Something whose size in bytes can be looked up by name.
#[async_trait]
pub trait Sizeable: Send + Sync {
    /// Best-effort size. `None` when the engine cannot tell.
    async fn size_of(&self, name: &str) -> Option<u64>;
}

/// Something that can be removed by name.
#[async_trait]
pub trait Removable: Send + Sync {
    /// Remove the named artifact. Removing an absent artifact succeeds.
    async fn remove_named(&self, name: &str, stale: bool) -> Result<bool, Error>;
}

/// One candidate database found on a server.
pub struct DatabaseMetaInfo {
    pub name: String,
    pub connection: String,
    pub driver: Driver,
    /// Whether the stored build hash matches the current one.
    pub is_valid: bool,
    pub record: ReuseRecord,
    sizer: Arc<dyn Sizeable>,
    remover: Arc<dyn Removable>,
    size: OnceCell<Option<u64>>,
}

impl DatabaseMetaInfo {
    pub fn new(
        name: String, connection: String, driver: Driver, record: ReuseRecord, build_hash: &str,
        sizer: Arc<dyn Sizeable>, remover: Arc<dyn Removable>,
    ) -> Self {
        let is_valid = record.build_hash == build_hash;
        Self { name, connection, driver, is_valid, record, sizer, remover, size: OnceCell::new() }
    }

    /// Size in bytes, computed on first call.
    pub async fn size(&self) -> Option<u64> {
        *self.size.get_or_init(|| self.sizer.size_of(&self.name)).await
    }

    pub async fn remove(&self) -> Result<bool, Error> {
        self.remover.remove_named(&self.name, !self.is_valid).await
    }

    /// Remove the database when it is stale. Returns whether it was removed.
    pub async fn purge_if_needed(&self) -> Result<bool, Error> {
        if self.is_valid {
            return Ok(false);
        }
        self.remove().await
    }

    pub async fn readable(&self) -> String {
        format!("{} {}", self.name, readable_size(self.size().await))
    }
}

impl fmt::Debug for DatabaseMetaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseMetaInfo")
            .field("name", &self.name)
            .field("connection", &self.connection)
            .field("driver", &self.driver)
            .field("is_valid", &self.is_valid)
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

/// One snapshot file found in the storage directory.
pub struct SnapshotMetaInfo {
    pub path: PathBuf,
    pub filename: String,
    pub accessed_at: Option<DateTime<Utc>>,
    /// Whether the build hash embedded in the filename matches a current one.
    pub is_valid: bool,
    sizer: Arc<dyn Sizeable>,
    remover: Arc<dyn Removable>,
    size: OnceCell<Option<u64>>,
}

impl SnapshotMetaInfo {
    pub fn new(
        path: PathBuf, filename: String, accessed_at: Option<DateTime<Utc>>, is_valid: bool,
        sizer: Arc<dyn Sizeable>, remover: Arc<dyn Removable>,
    ) -> Self {
        Self { path, filename, accessed_at, is_valid, sizer, remover, size: OnceCell::new() }
    }

    pub async fn size(&self) -> Option<u64> {
        let key = self.path.to_string_lossy().into_owned();
        *self.size.get_or_init(|| async move { self.sizer.size_of(&key).await }).await
    }

    pub async fn delete(&self) -> Result<bool, Error> {
        self.remover.remove_named(&self.path.to_string_lossy(), !self.is_valid).await
    }

    pub async fn purge_if_needed(&self) -> Result<bool, Error> {
        if self.is_valid {
            return Ok(false);
        }
        self.delete().await
    }

    pub async fn readable(&self) -> String {
        format!("{} {}", self.path.display(), readable_size(self.size().await))
    }
}

impl fmt::Debug for SnapshotMetaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotMetaInfo")
            .field("path", &self.path)
            .field("accessed_at", &self.accessed_at)
            .field("is_valid", &self.is_valid)
            .finish_non_exhaustive()
    }
}

/// Render a byte count as `1.5 MB` style text.
pub fn readable_size(bytes: Option<u64>) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let Some(bytes) = bytes else {
        return "(size unknown)".to_string();
    };
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 { format!("{bytes} B") } else { format!("{value:.1} {}", UNITS[unit]) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        sized: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl Sizeable for Counting {
        async fn size_of(&self, _name: &str) -> Option<u64> {
            self.sized.fetch_add(1, Ordering::SeqCst);
            Some(2048)
        }
    }

    #[async_trait]
    impl Removable for Counting {
        async fn remove_named(&self, _name: &str, _stale: bool) -> Result<bool, Error> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn meta(ops: &Arc<Counting>, stored_build_hash: &str) -> DatabaseMetaInfo {
        let record = ReuseRecord { build_hash: stored_build_hash.into(), ..ReuseRecord::sample() };
        DatabaseMetaInfo::new("test-app_1".into(), "main".into(), Driver::Sqlite, record, "current", ops.clone(), ops.clone())
    }

    #[test]
    fn test_readable_size() {
        assert_eq!(readable_size(Some(512)), "512 B");
        assert_eq!(readable_size(Some(1536)), "1.5 KB");
        assert_eq!(readable_size(Some(3 * 1024 * 1024)), "3.0 MB");
        assert_eq!(readable_size(None), "(size unknown)");
    }

    #[tokio::test]
    async fn test_size_is_deferred_and_cached() {
        let ops = Arc::new(Counting::default());
        let info = meta(&ops, "current");
        assert_eq!(ops.sized.load(Ordering::SeqCst), 0);
        assert_eq!(info.size().await, Some(2048));
        assert_eq!(info.size().await, Some(2048));
        assert_eq!(ops.sized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validity_follows_build_hash() {
        let ops = Arc::new(Counting::default());
        assert!(meta(&ops, "current").is_valid);
        assert!(!meta(&ops, "previous").is_valid);
    }

    #[tokio::test]
    async fn test_purge_only_removes_stale() {
        let ops = Arc::new(Counting::default());
        assert!(!meta(&ops, "current").purge_if_needed().await.unwrap());
        assert_eq!(ops.removed.load(Ordering::SeqCst), 0);
        assert!(meta(&ops, "previous").purge_if_needed().await.unwrap());
        assert_eq!(ops.removed.load(Ordering::SeqCst), 1);
    }
}
