//! Inventory of the cached artifacts of one connection.

use scenariodb_core::meta::readable_size;
use scenariodb_core::{
    BuildConfig, BuildServices, DatabaseMetaInfo, DriverAdapter, Error, HashTriplet, SnapshotMetaInfo,
};

pub struct Inventory {
    pub databases: Vec<DatabaseMetaInfo>,
    pub snapshots: Vec<SnapshotMetaInfo>,
    /// Whether validity was judged against the current checkout.
    pub hashed: bool,
}

impl Inventory {
    /// Enumerate everything `config` may have built.
    ///
    /// Without `hashes` nothing counts as valid.
    pub async fn collect(
        config: &BuildConfig, services: &BuildServices, hashes: Option<&HashTriplet>,
    ) -> Result<Self, Error> {
        let build_hash = hashes.map(|h| h.build_hash.clone()).unwrap_or_default();
        let databases = services.adapter.find_databases(Some(&config.database), &build_hash).await?;
        let valid: Vec<String> = hashes.map(|h| vec![h.build_hash.clone()]).unwrap_or_default();
        let snapshots = services.snapshots.list_snapshots(&valid).await?;
        Ok(Self { databases, snapshots, hashed: hashes.is_some() })
    }

    pub async fn render(&self) -> String {
        let mut out = String::new();
        let mut total = 0u64;

        out.push_str(&format!("Databases ({}):\n", self.databases.len()));
        for db in &self.databases {
            total += db.size().await.unwrap_or(0);
            out.push_str(&format!("  {} {}\n", db.readable().await, self.status(db.is_valid)));
        }

        out.push_str(&format!("Snapshots ({}):\n", self.snapshots.len()));
        for snapshot in &self.snapshots {
            total += snapshot.size().await.unwrap_or(0);
            out.push_str(&format!("  {} {}\n", snapshot.readable().await, self.status(snapshot.is_valid)));
        }

        out.push_str(&format!("Total: {}\n", readable_size(Some(total))));
        out
    }

    fn status(&self, valid: bool) -> &'static str {
        match (self.hashed, valid) {
            (false, _) => "[unknown]",
            (true, true) => "[current]",
            (true, false) => "[stale]",
        }
    }

    /// Remove every artifact, or only the stale ones. Returns how many went.
    pub async fn remove(&self, stale_only: bool) -> usize {
        let mut removed = 0;
        for db in &self.databases {
            let result = if stale_only { db.purge_if_needed().await } else { db.remove().await };
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Could not remove database \"{}\": {}", db.name, e),
            }
        }
        for snapshot in &self.snapshots {
            let result = if stale_only { snapshot.purge_if_needed().await } else { snapshot.delete().await };
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Could not remove snapshot {}: {}", snapshot.path.display(), e),
            }
        }
        removed
    }
}
