//! Per-connection build configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (SCENARIODB_*)
//! 2. TOML config file (if SCENARIODB_CONFIG_FILE set)
//! 3. Built-in defaults

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Database engine a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    Sqlite,
    Mysql,
    #[serde(alias = "postgres", alias = "postgresql")]
    Pgsql,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Sqlite => "sqlite",
            Driver::Mysql => "mysql",
            Driver::Pgsql => "pgsql",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Driver {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Driver::Sqlite),
            "mysql" | "mariadb" => Ok(Driver::Mysql),
            "pgsql" | "postgres" | "postgresql" => Ok(Driver::Pgsql),
            other => Err(ConfigError::Invalid { field: "driver".into(), reason: format!("unknown driver \"{other}\"") }),
        }
    }
}

/// When snapshot dumps are taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    #[default]
    Off,
    AfterMigrations,
    AfterSeeders,
    Both,
}

impl SnapshotMode {
    pub fn enabled(&self) -> bool {
        *self != SnapshotMode::Off
    }

    pub fn after_migrations(&self) -> bool {
        matches!(self, SnapshotMode::AfterMigrations | SnapshotMode::Both)
    }

    pub fn after_seeders(&self) -> bool {
        matches!(self, SnapshotMode::AfterSeeders | SnapshotMode::Both)
    }
}

/// How migrations and seeders are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplierConfig {
    #[default]
    /// Execute `*.sql` files from the migrations directory, and each seeder as a SQL file path.
    SqlFiles,
    /// Run external programs. `seed` is run once per seeder with `SCENARIODB_SEEDER` set.
    Command { migrate: Vec<String>, seed: Vec<String> },
}

/// Client/dump binaries used for snapshots and pre-migration imports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ToolPaths {
    #[serde(default = "default_mysql")]
    pub mysql: String,
    #[serde(default = "default_mysqldump")]
    pub mysqldump: String,
    #[serde(default = "default_psql")]
    pub psql: String,
    #[serde(default = "default_pg_dump")]
    pub pg_dump: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self { mysql: default_mysql(), mysqldump: default_mysqldump(), psql: default_psql(), pg_dump: default_pg_dump() }
    }
}

/// Logging switches. Never part of the build fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LogConfig {
    /// Log the rendered build settings table after each build.
    #[serde(default)]
    pub build_settings: bool,
    /// Extra per-step debug output.
    #[serde(default)]
    pub verbose: bool,
}

/// Immutable per-connection build settings.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (SCENARIODB_*)
/// 2. TOML config file (if SCENARIODB_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BuildConfig {
    /// Project name, stored in the reuse table so projects sharing a server leave each other alone.
    #[serde(default)]
    pub project_name: String,

    /// Connection name this configuration provisions.
    #[serde(default = "default_connection")]
    pub connection: String,

    #[serde(default = "default_driver")]
    pub driver: Driver,

    /// The original database name the test suite would otherwise use.
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// Directory holding snapshots, SQLite databases and shared-config files.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,

    #[serde(default = "default_database_prefix")]
    pub database_prefix: String,

    /// Files and directories whose content feeds the build hash.
    #[serde(default)]
    pub hash_paths: Vec<PathBuf>,

    /// Dump files imported before migrations run.
    #[serde(default)]
    pub pre_migration_imports: Vec<PathBuf>,

    #[serde(default = "default_true")]
    pub run_migrations: bool,

    #[serde(default)]
    pub migrations_path: Option<PathBuf>,

    /// Seeders run after migrating. Ignored when migrations are off.
    #[serde(default)]
    pub seeders: Vec<String>,

    /// Reuse the database across tests, isolating each test in a transaction.
    #[serde(default = "default_true")]
    pub reuse_transaction: bool,

    /// Give every scenario (schema + seeders + settings) its own database name.
    #[serde(default = "default_true")]
    pub scenario_test_dbs: bool,

    #[serde(default)]
    pub snapshots: SnapshotMode,

    #[serde(default)]
    pub applier: ApplierConfig,

    #[serde(default)]
    pub tools: ToolPaths,

    /// Remote instance to delegate builds to.
    #[serde(default)]
    pub remote_build_url: Option<String>,

    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    /// Build locally when the remote build times out or is unusable.
    #[serde(default)]
    pub remote_fallback_to_local: bool,

    /// Remove stale databases, snapshots and orphaned files once per process.
    #[serde(default = "default_true")]
    pub purge_stale: bool,

    /// Shared-config files older than this are orphans.
    #[serde(default = "default_shared_config_max_age_secs")]
    pub shared_config_max_age_secs: u64,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_connection() -> String {
    "default".into()
}

fn default_driver() -> Driver {
    Driver::Sqlite
}

fn default_database() -> String {
    "test".into()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./tests/scenariodb-storage")
}

fn default_snapshot_prefix() -> String {
    "snapshot.".into()
}

fn default_database_prefix() -> String {
    "test-".into()
}

fn default_true() -> bool {
    true
}

fn default_remote_timeout_ms() -> u64 {
    300_000
}

fn default_shared_config_max_age_secs() -> u64 {
    4 * 60 * 60
}

fn default_mysql() -> String {
    "mysql".into()
}

fn default_mysqldump() -> String {
    "mysqldump".into()
}

fn default_psql() -> String {
    "psql".into()
}

fn default_pg_dump() -> String {
    "pg_dump".into()
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            connection: default_connection(),
            driver: default_driver(),
            database: default_database(),
            host: None,
            port: None,
            username: None,
            password: None,
            storage_dir: default_storage_dir(),
            snapshot_prefix: default_snapshot_prefix(),
            database_prefix: default_database_prefix(),
            hash_paths: Vec::new(),
            pre_migration_imports: Vec::new(),
            run_migrations: true,
            migrations_path: None,
            seeders: Vec::new(),
            reuse_transaction: true,
            scenario_test_dbs: true,
            snapshots: SnapshotMode::Off,
            applier: ApplierConfig::SqlFiles,
            tools: ToolPaths::default(),
            remote_build_url: None,
            remote_timeout_ms: default_remote_timeout_ms(),
            remote_fallback_to_local: false,
            purge_stale: true,
            shared_config_max_age_secs: default_shared_config_max_age_secs(),
            log: LogConfig::default(),
        }
    }
}

impl BuildConfig {
    /// Remote build timeout as Duration for use with reqwest/tokio.
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Seeders that will actually run. Seeding requires migrations.
    pub fn effective_seeders(&self) -> &[String] {
        if self.run_migrations { &self.seeders } else { &[] }
    }

    pub fn seeding_allowed(&self) -> bool {
        self.run_migrations
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.storage_dir.join("snapshots")
    }

    pub fn sqlite_dir(&self) -> PathBuf {
        self.storage_dir.join("databases")
    }

    /// Resolve every relative path against `root`.
    ///
    /// Used by the remote build server, whose checkout lives somewhere else.
    pub fn rooted_at(mut self, root: &Path) -> Self {
        let rebase = |p: &PathBuf| if p.is_relative() { root.join(p) } else { p.clone() };
        self.storage_dir = rebase(&self.storage_dir);
        self.hash_paths = self.hash_paths.iter().map(rebase).collect();
        self.pre_migration_imports = self.pre_migration_imports.iter().map(rebase).collect();
        self.migrations_path = self.migrations_path.as_ref().map(rebase);
        if self.applier == ApplierConfig::SqlFiles {
            self.seeders = self
                .seeders
                .iter()
                .map(|s| rebase(&PathBuf::from(s)).to_string_lossy().into_owned())
                .collect();
        }
        self
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `SCENARIODB_`
    /// 2. TOML file from `SCENARIODB_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    /// The layered figment `load` extracts from.
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("SCENARIODB_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment.merge(
            Env::prefixed("SCENARIODB_")
                .ignore(&["config_file"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
