//! The settings a connection was actually provisioned with.

use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::config::BuildConfig;
use crate::hash::HashTriplet;

/// Final, concrete settings of one provisioned connection.
///
/// Serialized flat as the remote build response and rendered for the build log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResolvedSettings {
    pub project_name: String,
    pub test_name: String,
    pub connection: String,
    pub driver: String,
    pub host: Option<String>,
    pub database: String,
    pub built_remotely: bool,
    pub remote_build_url: Option<String>,
    pub snapshots_enabled: bool,
    pub storage_dir: PathBuf,
    pub pre_migration_imports: Vec<PathBuf>,
    pub run_migrations: bool,
    pub migrations_path: Option<PathBuf>,
    pub seeding_allowed: bool,
    pub seeders: Vec<String>,
    pub using_scenarios: bool,
    /// Hashes are only reported when scenario databases are in use.
    pub build_hash: Option<String>,
    pub snapshot_hash: Option<String>,
    pub scenario_hash: Option<String>,
    pub database_is_reusable: bool,
}

impl ResolvedSettings {
    /// Settings of a database built (or reused) by this process.
    pub fn local(
        config: &BuildConfig, test_name: &str, host: Option<String>, database: &str, hashes: &HashTriplet,
    ) -> Self {
        let using_scenarios = config.scenario_test_dbs;
        let hash = |h: &String| using_scenarios.then(|| h.clone());
        Self {
            project_name: config.project_name.clone(),
            test_name: test_name.to_string(),
            connection: config.connection.clone(),
            driver: config.driver.as_str().to_string(),
            host,
            database: database.to_string(),
            built_remotely: false,
            remote_build_url: None,
            snapshots_enabled: config.snapshots.enabled(),
            storage_dir: config.storage_dir.clone(),
            pre_migration_imports: config.pre_migration_imports.clone(),
            run_migrations: config.run_migrations,
            migrations_path: config.migrations_path.clone(),
            seeding_allowed: config.seeding_allowed(),
            seeders: config.effective_seeders().to_vec(),
            using_scenarios,
            build_hash: hash(&hashes.build_hash),
            snapshot_hash: hash(&hashes.snapshot_hash),
            scenario_hash: hash(&hashes.scenario_hash),
            database_is_reusable: config.reuse_transaction,
        }
    }

    /// Mark these settings as produced by the remote instance at `url`.
    pub fn built_remotely(mut self, url: &str) -> Self {
        self.built_remotely = true;
        self.remote_build_url = Some(url.to_string());
        self
    }

    /// JSON payload for cross-process transfer.
    pub fn build_payload(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::RemoteShare(format!("could not encode resolved settings: {e}")))
    }

    /// # Errors
    ///
    /// Returns `Error::RemoteShare` for an empty or unreadable payload.
    pub fn from_payload(payload: &str) -> Result<Self, Error> {
        if payload.trim().is_empty() {
            return Err(Error::RemoteShare("could not read the resolved settings: empty payload".into()));
        }
        serde_json::from_str(payload)
            .map_err(|e| Error::RemoteShare(format!("could not read the resolved settings: {e}")))
    }

    pub fn render_build_settings(&self) -> Vec<(String, String)> {
        let remote = if self.built_remotely { " (remote)" } else { "" };

        let migrations = match (self.run_migrations, &self.migrations_path) {
            (false, _) => "No".to_string(),
            (true, None) => "Yes".to_string(),
            (true, Some(path)) => format!("\"{}\"", path.display()),
        };
        let seeders = if self.seeding_allowed { render_list(&self.seeders, remote) } else { Some("n/a".into()) };
        let imports: Vec<String> = self.pre_migration_imports.iter().map(|p| p.display().to_string()).collect();
        let imports_title =
            if imports.len() == 1 { "Pre-migration import:" } else { "Pre-migration imports:" };
        let seeders_title =
            if self.seeding_allowed && self.seeders.len() == 1 { "Seeder:" } else { "Seeders:" };
        let reusable = if self.database_is_reusable { "Yes" } else { "No, it will be rebuilt for each test" };

        let rows: [(&str, Option<String>); 13] = [
            ("Project name:", Some(quoted(&self.project_name).unwrap_or_else(|| "n/a".into()))),
            ("Remote-build url:", self.remote_build_url.as_deref().and_then(quoted)),
            ("Snapshots enabled?", Some(yes_no(self.snapshots_enabled))),
            (
                "Snapshot storage dir:",
                self.snapshots_enabled.then(|| format!("\"{}\"{remote}", self.storage_dir.display())),
            ),
            (imports_title, render_list(&imports, remote)),
            ("Migrations:", Some(format!("{migrations}{remote}"))),
            (seeders_title, seeders),
            ("Is reusable?", Some(" ".into())),
            ("- Using transactions:", Some(reusable.into())),
            ("Using scenarios?", Some(yes_no(self.using_scenarios))),
            ("- Build-hash:", self.build_hash.as_deref().and_then(quoted)),
            ("- Snapshot-hash:", self.snapshot_hash.as_deref().and_then(quoted)),
            ("- Scenario-hash:", self.scenario_hash.as_deref().and_then(quoted)),
        ];
        collect_rows(rows)
    }

    pub fn render_resolved_database_settings(&self) -> Vec<(String, String)> {
        collect_rows([
            ("Connection:", quoted(&self.connection)),
            ("Driver:", quoted(&self.driver)),
            ("Host:", self.host.as_deref().and_then(quoted)),
            ("Database:", quoted(&self.database)),
        ])
    }

    /// Both tables as aligned text, for the build log.
    pub fn render_table(&self) -> String {
        let mut rows = self.render_build_settings();
        rows.extend(self.render_resolved_database_settings());
        let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        rows.iter().map(|(k, v)| format!("{k:<width$} {v}")).collect::<Vec<_>>().join("\n")
    }
}

fn collect_rows<const N: usize>(rows: [(&str, Option<String>); N]) -> Vec<(String, String)> {
    rows.into_iter().filter_map(|(k, v)| v.map(|v| (k.to_string(), v))).collect()
}

fn quoted(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| format!("\"{value}\""))
}

fn yes_no(value: bool) -> String {
    if value { "Yes" } else { "No" }.to_string()
}

fn render_list(items: &[String], suffix: &str) -> Option<String> {
    match items {
        [] => Some("None".into()),
        [one] => Some(format!("\"{one}\"{suffix}")),
        many => Some(many.iter().map(|i| format!("- \"{i}\"{suffix}")).collect::<Vec<_>>().join("\n")),
    }
}
