//! Content-fingerprint generation for build scenarios.
//!
//! Three hashes are chained so a change to any source file moves all of them:
//! the build hash covers file contents, the snapshot hash adds the settings
//! that shape a dump, and the scenario hash adds the settings that shape a
//! live database.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::BuildConfig;
use crate::Error;

/// Bumped whenever the hashing scheme or reuse-table layout changes.
pub const HASH_FORMAT_VERSION: &str = "scenariodb-hash-2";

/// Width of every hash in hex characters.
pub const HASH_WIDTH: usize = 32;

/// `(build, snapshot, scenario)` fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashTriplet {
    pub build_hash: String,
    pub snapshot_hash: String,
    pub scenario_hash: String,
}

impl HashTriplet {
    /// Compact rendering used in error context.
    pub fn render(&self) -> String {
        format!("build={} snapshot={} scenario={}", self.build_hash, self.snapshot_hash, self.scenario_hash)
    }
}

/// Derives a [`HashTriplet`] from a [`BuildConfig`] and its source files.
#[derive(Debug, Clone, Default)]
pub struct ScenarioHasher {
    root: Option<PathBuf>,
}

impl ScenarioHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative hash-paths against `root` instead of the working directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: Some(root.into()) }
    }

    /// Compute the hash triplet.
    ///
    /// # Errors
    ///
    /// Returns `Error::HashingError` if any hash-path, pre-migration import or
    /// the migrations path cannot be read.
    pub fn compute_hashes(&self, config: &BuildConfig) -> Result<HashTriplet, Error> {
        let sources = self.digest_sources(config)?;
        let build_hash = digest(&[HASH_FORMAT_VERSION, "build", &sources.combined()]);

        // Paths are named by their content digest so the checkout location never leaks in.
        let migrations = match (&config.run_migrations, &config.migrations_path) {
            (false, _) => "off".to_string(),
            (true, None) => "on".to_string(),
            (true, Some(path)) => format!("on:{}", sources.digest_of(&self.resolve(path))),
        };
        let imports = sorted(config.pre_migration_imports.iter().map(|p| sources.digest_of(&self.resolve(p))));
        let seeders = config
            .effective_seeders()
            .iter()
            .map(|seeder| self.seeder_key(seeder))
            .collect::<Result<Vec<_>, _>>()?;
        let snapshot_hash = digest(&[
            "snapshot",
            &build_hash,
            config.driver.as_str(),
            &config.snapshot_prefix,
            &imports.join("\u{1f}"),
            &migrations,
            &seeders.join("\u{1f}"),
        ]);

        let scenario_hash = digest(&[
            "scenario",
            &snapshot_hash,
            &config.project_name,
            &config.connection,
            &config.database,
            &config.database_prefix,
            flag(config.reuse_transaction),
            flag(config.scenario_test_dbs),
        ]);

        Ok(HashTriplet { build_hash, snapshot_hash, scenario_hash })
    }

    /// Digest every source root on its own, keyed by its resolved location.
    fn digest_sources(&self, config: &BuildConfig) -> Result<SourceDigests, Error> {
        let mut roots: Vec<(PathBuf, &PathBuf)> = config
            .hash_paths
            .iter()
            .chain(config.pre_migration_imports.iter())
            .chain(config.migrations_path.iter().filter(|_| config.run_migrations))
            .map(|configured| (self.resolve(configured), configured))
            .collect();
        roots.sort();
        roots.dedup_by(|a, b| a.0 == b.0);

        let mut digests = Vec::with_capacity(roots.len());
        for (resolved, configured) in roots {
            let root_digest = digest_root(&resolved, configured)?;
            digests.push((resolved, root_digest));
        }
        Ok(SourceDigests(digests))
    }

    /// Seeders naming a readable file contribute its content; anything else
    /// (a seeder class, a missing file) contributes its name.
    fn seeder_key(&self, seeder: &str) -> Result<String, Error> {
        let path = self.resolve(Path::new(seeder));
        if !path.is_file() {
            return Ok(format!("name:{seeder}"));
        }
        Ok(format!("file:{}", digest_root(&path, Path::new(seeder))?))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Per-root content digests of one hashing pass.
struct SourceDigests(Vec<(PathBuf, String)>);

impl SourceDigests {
    /// Location-free combination: root digests in sorted order.
    fn combined(&self) -> String {
        sorted(self.0.iter().map(|(_, d)| d.clone())).join("\u{1e}")
    }

    fn digest_of(&self, resolved: &Path) -> String {
        self.0
            .iter()
            .find(|(path, _)| path == resolved)
            .map(|(_, d)| d.clone())
            .unwrap_or_default()
    }
}

/// Digest the files under one root, each keyed by its path relative to the root.
fn digest_root(resolved: &Path, configured: &Path) -> Result<String, Error> {
    let mut hasher = Sha256::new();
    for (relative, file) in collect_files(resolved, configured)? {
        let content = fs::read(&file).map_err(|e| hashing_error(&file, e))?;
        hasher.update(relative.as_bytes());
        hasher.update(b"\0");
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// List the files under `resolved` keyed by their path relative to it.
fn collect_files(resolved: &Path, configured: &Path) -> Result<Vec<(String, PathBuf)>, Error> {
    let metadata = fs::metadata(resolved).map_err(|e| hashing_error(configured, e))?;
    if metadata.is_file() {
        return Ok(vec![(String::new(), resolved.to_path_buf())]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(resolved).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::HashingError {
            path: configured.display().to_string(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(resolved).unwrap_or(entry.path());
        files.push((portable(relative), entry.path().to_path_buf()));
    }
    Ok(files)
}

fn hashing_error(path: &Path, err: std::io::Error) -> Error {
    Error::HashingError { path: path.display().to_string(), reason: err.to_string() }
}

/// Forward-slash rendering so Windows and Unix checkouts hash alike.
fn portable(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn sorted(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut items: Vec<String> = items.collect();
    items.sort();
    items
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    let mut hash = hex::encode(hasher.finalize());
    hash.truncate(HASH_WIDTH);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Driver, LogConfig};

    fn workspace() -> (tempfile::TempDir, BuildConfig) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("migrations")).unwrap();
        fs::create_dir_all(dir.path().join("seeds")).unwrap();
        fs::write(dir.path().join("migrations/001_users.sql"), "CREATE TABLE users (id INTEGER);").unwrap();
        fs::write(dir.path().join("migrations/002_posts.sql"), "CREATE TABLE posts (id INTEGER);").unwrap();
        fs::write(dir.path().join("seeds/users.sql"), "INSERT INTO users VALUES (1);").unwrap();

        let config = BuildConfig {
            project_name: "shop".into(),
            hash_paths: vec![PathBuf::from("migrations"), PathBuf::from("seeds")],
            migrations_path: Some(PathBuf::from("migrations")),
            seeders: vec!["seeds/users.sql".into()],
            ..Default::default()
        };
        (dir, config)
    }

    #[test]
    fn test_hash_stability() {
        let (dir, config) = workspace();
        let hasher = ScenarioHasher::with_root(dir.path());
        let first = hasher.compute_hashes(&config).unwrap();
        let second = ScenarioHasher::with_root(dir.path()).compute_hashes(&config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_hash_format() {
        let (dir, config) = workspace();
        let hashes = ScenarioHasher::with_root(dir.path()).compute_hashes(&config).unwrap();
        for hash in [&hashes.build_hash, &hashes.snapshot_hash, &hashes.scenario_hash] {
            assert_eq!(hash.len(), HASH_WIDTH);
            assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_hash_path_order_is_irrelevant() {
        let (dir, mut config) = workspace();
        let hasher = ScenarioHasher::with_root(dir.path());
        let forward = hasher.compute_hashes(&config).unwrap();
        config.hash_paths.reverse();
        let reversed = hasher.compute_hashes(&config).unwrap();
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_one_byte_changes_all_three_hashes() {
        let (dir, config) = workspace();
        let hasher = ScenarioHasher::with_root(dir.path());
        let before = hasher.compute_hashes(&config).unwrap();

        fs::write(dir.path().join("seeds/users.sql"), "INSERT INTO users VALUES (2);").unwrap();
        let after = hasher.compute_hashes(&config).unwrap();

        assert_ne!(before.build_hash, after.build_hash);
        assert_ne!(before.snapshot_hash, after.snapshot_hash);
        assert_ne!(before.scenario_hash, after.scenario_hash);
    }

    #[test]
    fn test_out_of_scope_settings_leave_hashes_alone() {
        let (dir, config) = workspace();
        let hasher = ScenarioHasher::with_root(dir.path());
        let before = hasher.compute_hashes(&config).unwrap();

        let tweaked = BuildConfig {
            log: LogConfig { build_settings: true, verbose: true },
            remote_timeout_ms: 1_000,
            purge_stale: false,
            password: Some("secret".into()),
            ..config
        };
        assert_eq!(before, hasher.compute_hashes(&tweaked).unwrap());
    }

    #[test]
    fn test_seeders_change_snapshot_but_not_build_hash() {
        let (dir, config) = workspace();
        let hasher = ScenarioHasher::with_root(dir.path());
        let before = hasher.compute_hashes(&config).unwrap();

        let unseeded = BuildConfig { seeders: Vec::new(), ..config };
        let after = hasher.compute_hashes(&unseeded).unwrap();
        assert_eq!(before.build_hash, after.build_hash);
        assert_ne!(before.snapshot_hash, after.snapshot_hash);
        assert_ne!(before.scenario_hash, after.scenario_hash);
    }

    #[test]
    fn test_driver_changes_snapshot_hash() {
        let (dir, config) = workspace();
        let hasher = ScenarioHasher::with_root(dir.path());
        let sqlite = hasher.compute_hashes(&config).unwrap();
        let pgsql = hasher.compute_hashes(&BuildConfig { driver: Driver::Pgsql, ..config }).unwrap();
        assert_eq!(sqlite.build_hash, pgsql.build_hash);
        assert_ne!(sqlite.snapshot_hash, pgsql.snapshot_hash);
    }

    #[test]
    fn test_connection_changes_only_scenario_hash() {
        let (dir, config) = workspace();
        let hasher = ScenarioHasher::with_root(dir.path());
        let main = hasher.compute_hashes(&config).unwrap();
        let other = hasher.compute_hashes(&BuildConfig { connection: "reporting".into(), ..config }).unwrap();
        assert_eq!(main.snapshot_hash, other.snapshot_hash);
        assert_ne!(main.scenario_hash, other.scenario_hash);
    }

    #[test]
    fn test_missing_hash_path_is_an_error() {
        let (dir, mut config) = workspace();
        config.hash_paths.push(PathBuf::from("factories"));
        let result = ScenarioHasher::with_root(dir.path()).compute_hashes(&config);
        assert!(matches!(result, Err(Error::HashingError { path, .. }) if path == "factories"));
    }

    #[test]
    fn test_root_location_does_not_matter() {
        let (first_dir, config) = workspace();
        let (second_dir, _) = workspace();
        let first = ScenarioHasher::with_root(first_dir.path()).compute_hashes(&config).unwrap();
        let second = ScenarioHasher::with_root(second_dir.path()).compute_hashes(&config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_absolute_paths_hash_alike_across_checkouts() {
        let (first_dir, config) = workspace();
        let (second_dir, _) = workspace();
        let first = ScenarioHasher::new().compute_hashes(&config.clone().rooted_at(first_dir.path())).unwrap();
        let second = ScenarioHasher::new().compute_hashes(&config.rooted_at(second_dir.path())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rooted_config_matches_rooted_hasher() {
        let (dir, config) = workspace();
        let relative = ScenarioHasher::with_root(dir.path()).compute_hashes(&config).unwrap();
        let absolute = ScenarioHasher::new().compute_hashes(&config.rooted_at(dir.path())).unwrap();
        assert_eq!(relative, absolute);
    }

    #[test]
    fn test_seeder_content_changes_snapshot_hash() {
        let (dir, config) = workspace();
        fs::write(dir.path().join("seeds/posts.sql"), "INSERT INTO posts VALUES (1);").unwrap();
        let hasher = ScenarioHasher::with_root(dir.path());
        let users = hasher.compute_hashes(&config).unwrap();
        let posts = hasher.compute_hashes(&BuildConfig { seeders: vec!["seeds/posts.sql".into()], ..config }).unwrap();
        assert_eq!(users.build_hash, posts.build_hash);
        assert_ne!(users.snapshot_hash, posts.snapshot_hash);
    }
}
