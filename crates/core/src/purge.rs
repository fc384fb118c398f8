//! Once-per-process removal of stale databases, snapshots and orphaned files.
//!
//! Every removal is best-effort: a failure is logged and the sweep moves on.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use crate::Error;
use crate::adapters::DriverAdapter;
use crate::builder::DatabaseBuilder;
use crate::run::{SHARED_CONFIG_PREFIX, SHARED_CONFIG_SUFFIX};

/// Owned by the test-run coordinator; open until the first purge takes it.
///
/// Clones share the flag, so every coordinator in one process can be handed
/// the same gate.
#[derive(Debug, Clone)]
pub struct PurgeGate(Arc<AtomicBool>);

impl PurgeGate {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Close the gate. Returns whether it was still open.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for PurgeGate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub databases_removed: Vec<String>,
    pub snapshots_removed: Vec<PathBuf>,
    pub shared_configs_removed: Vec<PathBuf>,
    /// Enumerations or removals that failed and were skipped.
    pub failures: usize,
}

impl PurgeReport {
    pub fn is_empty(&self) -> bool {
        self.databases_removed.is_empty() && self.snapshots_removed.is_empty() && self.shared_configs_removed.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StalePurger {
    gate: PurgeGate,
}

impl StalePurger {
    pub fn new(gate: PurgeGate) -> Self {
        Self { gate }
    }

    /// Purge stale artifacts of `builders`, at most once per gate.
    ///
    /// Returns `None` when the sweep was skipped: nothing builds locally,
    /// purging is disabled, or the gate was already taken. Builders must have
    /// been hashed; unhashed builders contribute nothing.
    pub async fn purge_once(&self, builders: &[DatabaseBuilder]) -> Option<PurgeReport> {
        let local: Vec<&DatabaseBuilder> =
            builders.iter().filter(|b| b.builds_locally() && b.config().purge_stale).collect();
        if local.is_empty() {
            tracing::debug!("stale purge skipped: nothing builds locally");
            return None;
        }
        if !self.gate.take() {
            return None;
        }

        let start = std::time::Instant::now();
        let valid: Vec<String> = builders.iter().filter_map(|b| b.hashes()).map(|h| h.build_hash.clone()).collect();
        let mut report = PurgeReport::default();

        let mut seen_dbs = BTreeSet::new();
        let mut seen_snapshot_dirs = BTreeSet::new();
        let mut seen_storage_dirs = BTreeSet::new();
        for builder in local {
            let Some(hashes) = builder.hashes() else {
                continue;
            };
            let config = builder.config();
            let services = builder.services();

            let key = (config.connection.clone(), config.driver, config.database.clone());
            if seen_dbs.insert(key) {
                purge_databases(builder, &hashes.build_hash, &valid, &mut report).await;
            }
            if seen_snapshot_dirs.insert(services.snapshots.dir().to_path_buf()) {
                purge_snapshots(builder, &valid, &mut report).await;
            }
            if seen_storage_dirs.insert(config.storage_dir.clone()) {
                let max_age = Duration::from_secs(config.shared_config_max_age_secs);
                purge_shared_configs(&config.storage_dir, max_age, &mut report).await;
            }
        }

        tracing::debug!(
            "Purged {} database(s), {} snapshot(s), {} shared-config file(s) ({}ms)",
            report.databases_removed.len(),
            report.snapshots_removed.len(),
            report.shared_configs_removed.len(),
            start.elapsed().as_millis()
        );
        Some(report)
    }
}

async fn purge_databases(builder: &DatabaseBuilder, build_hash: &str, valid: &[String], report: &mut PurgeReport) {
    let adapter = &builder.services().adapter;
    let found = match adapter.find_databases(Some(&builder.config().database), build_hash).await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!("Could not list databases of \"{}\": {}", adapter.connection(), e);
            report.failures += 1;
            return;
        }
    };

    for meta in found {
        if meta.is_valid || valid.contains(&meta.record.build_hash) {
            continue;
        }
        match meta.remove().await {
            Ok(_) => report.databases_removed.push(meta.name.clone()),
            Err(e) => {
                tracing::warn!("Could not remove stale database \"{}\": {}", meta.name, e);
                report.failures += 1;
            }
        }
    }
}

async fn purge_snapshots(builder: &DatabaseBuilder, valid: &[String], report: &mut PurgeReport) {
    let store = &builder.services().snapshots;
    let found = match store.list_snapshots(valid).await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!("Could not list snapshots in {}: {}", store.dir().display(), e);
            report.failures += 1;
            return;
        }
    };

    for snapshot in found {
        match snapshot.purge_if_needed().await {
            Ok(true) => report.snapshots_removed.push(snapshot.path.clone()),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("Could not remove stale snapshot {}: {}", snapshot.path.display(), e);
                report.failures += 1;
            }
        }
    }
}

/// Remove shared-config files older than `max_age`.
async fn purge_shared_configs(storage_dir: &Path, max_age: Duration, report: &mut PurgeReport) {
    match orphaned_shared_configs(storage_dir, max_age).await {
        Ok(orphans) => {
            for path in orphans {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => report.shared_configs_removed.push(path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!("Could not remove shared-config file {}: {}", path.display(), e);
                        report.failures += 1;
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!("Could not scan {} for shared-config files: {}", storage_dir.display(), e);
            report.failures += 1;
        }
    }
}

async fn orphaned_shared_configs(storage_dir: &Path, max_age: Duration) -> Result<Vec<PathBuf>, Error> {
    let mut entries = match tokio::fs::read_dir(storage_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut orphans = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(SHARED_CONFIG_PREFIX) || !name.ends_with(SHARED_CONFIG_SUFFIX) {
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        if now.duration_since(modified).unwrap_or_default() >= max_age {
            orphans.push(entry.path());
        }
    }
    orphans.sort();
    Ok(orphans)
}
