//! On-disk snapshot dumps.
//!
//! Filenames carry everything needed to judge a snapshot without opening it:
//!
//! ```text
//! <prefix><buildHash[0..8]>-<snapshotHash>.<stage>.<ext>
//! ```
//!
//! The build-hash part decides validity, so snapshots of every scenario built
//! from the current schema survive a purge. The full name is the lookup key.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Error;
use crate::config::BuildConfig;
use crate::dump::{DumpTool, dump_tool_for};
use crate::hash::HashTriplet;
use crate::meta::{Removable, Sizeable, SnapshotMetaInfo};

const BUILD_PART: usize = 8;

/// Point in the build a snapshot was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStage {
    /// Schema only.
    Migrated,
    /// Schema plus seed data.
    Seeded,
}

impl SnapshotStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStage::Migrated => "migrated",
            SnapshotStage::Seeded => "seeded",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "migrated" => Some(SnapshotStage::Migrated),
            "seeded" => Some(SnapshotStage::Seeded),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parts of a snapshot filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName {
    pub build_part: String,
    pub snapshot_hash: String,
    pub stage: SnapshotStage,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    prefix: String,
    dump: Arc<dyn DumpTool>,
}

impl SnapshotStore {
    pub fn new(dir: PathBuf, prefix: &str, dump: Arc<dyn DumpTool>) -> Self {
        Self { dir, prefix: prefix.to_string(), dump }
    }

    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(config.snapshot_dir(), &config.snapshot_prefix, dump_tool_for(config))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn filename(&self, hashes: &HashTriplet, stage: SnapshotStage) -> String {
        let build_part: String = hashes.build_hash.chars().take(BUILD_PART).collect();
        format!("{}{}-{}.{}.{}", self.prefix, build_part, hashes.snapshot_hash, stage, self.dump.extension())
    }

    pub fn snapshot_path(&self, hashes: &HashTriplet, stage: SnapshotStage) -> PathBuf {
        self.dir.join(self.filename(hashes, stage))
    }

    /// The snapshot for exactly these hashes and stage, if one exists.
    pub async fn find_snapshot(&self, hashes: &HashTriplet, stage: SnapshotStage) -> Option<PathBuf> {
        let path = self.snapshot_path(hashes, stage);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }

    /// Decode a filename of this store. Foreign files yield `None`.
    pub fn parse_filename(&self, filename: &str) -> Option<SnapshotName> {
        let rest = filename.strip_prefix(&self.prefix)?;
        let rest = rest.strip_suffix(self.dump.extension())?.strip_suffix('.')?;
        let (hashes, stage) = rest.rsplit_once('.')?;
        let (build_part, snapshot_hash) = hashes.split_once('-')?;
        if build_part.len() != BUILD_PART || snapshot_hash.is_empty() {
            return None;
        }
        Some(SnapshotName {
            build_part: build_part.to_string(),
            snapshot_hash: snapshot_hash.to_string(),
            stage: SnapshotStage::parse(stage)?,
        })
    }

    /// Scan the store, judging each snapshot against the current build hashes.
    pub async fn list_snapshots(&self, valid_build_hashes: &[String]) -> Result<Vec<SnapshotMetaInfo>, Error> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let ops = Arc::new(self.clone());
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name().to_string_lossy().into_owned();
            let Some(name) = self.parse_filename(&filename) else {
                continue;
            };
            let accessed_at =
                entry.metadata().await.ok().and_then(|m| m.accessed().ok()).map(DateTime::<Utc>::from);
            let is_valid = valid_build_hashes.iter().any(|hash| hash.starts_with(&name.build_part));
            found.push(SnapshotMetaInfo::new(entry.path(), filename, accessed_at, is_valid, ops.clone(), ops.clone()));
        }
        found.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(found)
    }

    pub async fn import_snapshot(&self, path: &Path, database: &str) -> Result<(), Error> {
        let start = std::time::Instant::now();
        self.dump.import(path, database).await?;
        tracing::debug!("Imported snapshot {} into \"{}\" ({}ms)", path.display(), database, start.elapsed().as_millis());
        Ok(())
    }

    /// Export through a temporary file so a failed dump never leaves a
    /// snapshot under its final name.
    pub async fn export_snapshot(&self, database: &str, path: &Path) -> Result<(), Error> {
        let start = std::time::Instant::now();
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut partial = path.as_os_str().to_owned();
        partial.push(format!(".partial-{}", std::process::id()));
        let partial = PathBuf::from(partial);

        if let Err(e) = self.dump.export(database, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, path)
            .await
            .map_err(|e| Error::SnapshotIo(format!("rename {}: {e}", partial.display())))?;

        tracing::debug!("Exported \"{}\" to snapshot {} ({}ms)", database, path.display(), start.elapsed().as_millis());
        Ok(())
    }
}

#[async_trait]
impl Sizeable for SnapshotStore {
    async fn size_of(&self, name: &str) -> Option<u64> {
        tokio::fs::metadata(name).await.ok().map(|m| m.len())
    }
}

#[async_trait]
impl Removable for SnapshotStore {
    async fn remove_named(&self, name: &str, stale: bool) -> Result<bool, Error> {
        match tokio::fs::remove_file(name).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let stale = if stale { " stale" } else { "" };
        tracing::debug!("Removed{} snapshot: \"{}\"", stale, name);
        Ok(true)
    }
}
