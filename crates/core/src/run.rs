//! Coordination of every builder one test needs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::builder::DatabaseBuilder;
use crate::purge::{PurgeGate, StalePurger};

/// Header carrying [`ConnectionDatabases`] to workers that share the databases.
pub const CONNECTION_DBS_HEADER: &str = "x-scenariodb-connection-dbs";

pub const SHARED_CONFIG_PREFIX: &str = "shared-config.";
pub const SHARED_CONFIG_SUFFIX: &str = ".json";

/// Resolved `connection -> database` mapping of one test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ConnectionDatabases(BTreeMap<String, String>);

impl ConnectionDatabases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection: &str, database: &str) {
        self.0.insert(connection.to_string(), database.to_string());
    }

    pub fn get(&self, connection: &str) -> Option<&str> {
        self.0.get(connection).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn header_value(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::RemoteShare(format!("could not encode connection databases: {e}")))
    }

    pub fn from_header_value(value: &str) -> Result<Self, Error> {
        serde_json::from_str(value).map_err(|e| Error::RemoteShare(format!("could not read connection databases: {e}")))
    }

    /// Write the mapping to a fresh `shared-config.*.json` file in `storage_dir`.
    ///
    /// Stale files are removed by the purger once they exceed their maximum age.
    pub async fn write_shared_config(&self, storage_dir: &Path) -> Result<PathBuf, Error> {
        tokio::fs::create_dir_all(storage_dir).await?;
        let stamp = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or_default();
        let path = storage_dir.join(format!(
            "{SHARED_CONFIG_PREFIX}{stamp}-{}{SHARED_CONFIG_SUFFIX}",
            std::process::id()
        ));
        let body = serde_json::to_vec_pretty(self).map_err(|e| Error::RemoteShare(e.to_string()))?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }

    pub async fn read_shared_config(path: &Path) -> Result<Self, Error> {
        let body = tokio::fs::read_to_string(path).await?;
        Self::from_header_value(&body)
    }
}

/// Drives the builders of one test through build, post-build and post-test.
#[derive(Debug)]
pub struct TestRun {
    builders: Vec<DatabaseBuilder>,
    purger: StalePurger,
    databases: ConnectionDatabases,
}

impl TestRun {
    pub fn new(builders: Vec<DatabaseBuilder>, gate: PurgeGate) -> Self {
        Self { builders, purger: StalePurger::new(gate), databases: ConnectionDatabases::new() }
    }

    pub fn builders(&self) -> &[DatabaseBuilder] {
        &self.builders
    }

    pub fn builder(&self, connection: &str) -> Option<&DatabaseBuilder> {
        self.builders.iter().find(|b| b.config().connection == connection)
    }

    pub fn connection_databases(&self) -> &ConnectionDatabases {
        &self.databases
    }

    /// Hash every builder, purge stale artifacts once, then build what is not built yet.
    ///
    /// # Errors
    ///
    /// A `HashingError` aborts before anything is built. Other failures do
    /// not stop the remaining builders; the first one is returned afterwards.
    pub async fn build_steps(&mut self) -> Result<&ConnectionDatabases, Error> {
        for builder in &mut self.builders {
            builder.hash()?;
        }

        if let Some(report) = self.purger.purge_once(&self.builders).await
            && !report.is_empty()
        {
            tracing::info!(
                "Removed {} stale database(s) and {} stale snapshot(s)",
                report.databases_removed.len(),
                report.snapshots_removed.len()
            );
        }

        let mut first_error = None;
        for builder in &mut self.builders {
            if !builder.is_built()
                && let Err(e) = builder.execute().await.map(|_| ())
            {
                tracing::error!("Building connection \"{}\" failed: {}", builder.config().connection, e);
                first_error.get_or_insert(e);
                continue;
            }
            if let Some(resolved) = builder.resolved() {
                self.databases.insert(&resolved.connection, &resolved.database);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(&self.databases),
        }
    }

    /// Open the reuse transactions before the test body.
    pub async fn post_build_steps(&mut self) -> Result<(), Error> {
        let mut first_error = None;
        for builder in self.builders.iter_mut().filter(|b| b.is_built()) {
            if let Err(e) = builder.post_build().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Roll back after the test body; the final builder is finalized.
    pub async fn post_test_steps(&mut self) -> Result<(), Error> {
        let last = self.builders.len().saturating_sub(1);
        let mut first_error = None;
        for (i, builder) in self.builders.iter_mut().enumerate() {
            if !builder.is_built() {
                continue;
            }
            if let Err(e) = builder.post_test(i == last).await {
                tracing::warn!("Post-test step of \"{}\" failed: {}", builder.config().connection, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
