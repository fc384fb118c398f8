//! Per-connection build state machine.
//!
//! ```text
//! Configured -> Hashed -> { Reusing | Importing | Migrating } -> Built
//!            -> ReuseTxnOpen -> Executed -> ... -> Finalized
//! ```
//!
//! A remote build replaces the whole `Hashed -> Built` step. The reuse row is
//! always the last thing a local build writes, so a database that failed half
//! way never looks reusable.

mod services;

use std::fmt;
use std::time::Instant;

pub use services::BuildServices;

use crate::Error;
use crate::adapters::{DriverAdapter, ReuseSession};
use crate::applier::{ApplyTarget, SchemaApplier};
use crate::config::{BuildConfig, ConfigError};
use crate::hash::{HashTriplet, ScenarioHasher};
use crate::remote::{RemoteBuild, RemoteBuildRequest};
use crate::reuse::{MARK_IN_USE, ReuseRecord, touch_last_used};
use crate::settings::ResolvedSettings;
use crate::snapshots::SnapshotStage;

/// Hash characters appended to scenario database names.
const SCENARIO_SUFFIX_WIDTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Configured,
    Hashed,
    Reusing,
    Importing,
    Migrating,
    Built,
    ReuseTxnOpen,
    Executed,
    Finalized,
}

/// How the database ended up ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPath {
    Reused,
    Imported,
    Migrated,
    Remote,
}

pub struct DatabaseBuilder {
    config: BuildConfig,
    test_name: String,
    hasher: ScenarioHasher,
    services: BuildServices,
    state: BuildState,
    hashes: Option<HashTriplet>,
    resolved: Option<ResolvedSettings>,
    path: Option<BuildPath>,
    session: Option<Box<dyn ReuseSession>>,
}

impl fmt::Debug for DatabaseBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseBuilder")
            .field("connection", &self.config.connection)
            .field("state", &self.state)
            .field("hashes", &self.hashes)
            .field("path", &self.path)
            .field("session_open", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl DatabaseBuilder {
    pub fn new(config: BuildConfig, services: BuildServices) -> Self {
        Self {
            config,
            test_name: String::new(),
            hasher: ScenarioHasher::new(),
            services,
            state: BuildState::Configured,
            hashes: None,
            resolved: None,
            path: None,
            session: None,
        }
    }

    pub fn with_test_name(mut self, test_name: &str) -> Self {
        self.test_name = test_name.to_string();
        self
    }

    pub fn with_hasher(mut self, hasher: ScenarioHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn services(&self) -> &BuildServices {
        &self.services
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn hashes(&self) -> Option<&HashTriplet> {
        self.hashes.as_ref()
    }

    pub fn resolved(&self) -> Option<&ResolvedSettings> {
        self.resolved.as_ref()
    }

    pub fn build_path(&self) -> Option<BuildPath> {
        self.path
    }

    /// The open reuse transaction the test body should run its queries through.
    pub fn session(&self) -> Option<&dyn ReuseSession> {
        self.session.as_deref()
    }

    /// Whether this builder may touch local databases (it is not delegated remotely).
    pub fn builds_locally(&self) -> bool {
        self.config.remote_build_url.is_none()
    }

    pub fn is_built(&self) -> bool {
        self.resolved.is_some()
    }

    /// Compute the hash triplet, once.
    ///
    /// # Errors
    ///
    /// Returns `Error::HashingError` when a source path is unreadable. This
    /// aborts the run; it is never wrapped into `BuildFailed`.
    pub fn hash(&mut self) -> Result<&HashTriplet, Error> {
        if self.hashes.is_none() {
            let start = Instant::now();
            let hashes = self.hasher.compute_hashes(&self.config)?;
            tracing::debug!(
                "Hashed connection \"{}\": {} ({}ms)",
                self.config.connection,
                hashes.render(),
                start.elapsed().as_millis()
            );
            self.hashes = Some(hashes);
            self.state = BuildState::Hashed;
        }
        self.hashes.as_ref().ok_or_else(|| Error::InvalidState("hashes missing after hashing".into()))
    }

    /// Name of the database this configuration builds.
    pub fn database_name(&self) -> Result<String, Error> {
        let base = format!("{}{}", self.config.database_prefix, self.config.database);
        if !self.config.scenario_test_dbs {
            return Ok(base);
        }
        let hashes = self.hashes.as_ref().ok_or_else(|| Error::InvalidState("database name needs hashes".into()))?;
        let suffix: String = hashes.scenario_hash.chars().take(SCENARIO_SUFFIX_WIDTH).collect();
        Ok(format!("{base}_{suffix}"))
    }

    /// Make the database ready: reuse, import, migrate or delegate.
    ///
    /// # Errors
    ///
    /// `HashingError` aborts the run. A local build failure is returned as
    /// `BuildFailed` with connection, driver and hashes. Remote failures are
    /// returned as-is unless `remote_fallback_to_local` is set.
    pub async fn execute(&mut self) -> Result<&ResolvedSettings, Error> {
        match self.state {
            BuildState::Configured => {
                self.hash()?;
            }
            BuildState::Hashed => {}
            state if self.resolved.is_some() => {
                tracing::debug!("connection \"{}\" already built ({:?})", self.config.connection, state);
            }
            state => return Err(Error::InvalidState(format!("cannot build from state {state:?}"))),
        }

        if self.resolved.is_none() {
            let hashes = self.hash()?.clone();
            let start = Instant::now();
            let result = match self.config.remote_build_url.clone() {
                Some(url) => match self.build_remotely(&url, &hashes).await {
                    Err(e) if e.is_remote_failure() && self.config.remote_fallback_to_local => {
                        tracing::warn!(
                            "Remote build of \"{}\" failed ({}); building locally",
                            self.config.connection,
                            e
                        );
                        self.build_locally(&hashes).await
                    }
                    other => other,
                },
                None => self.build_locally(&hashes).await,
            };

            let settings = match result {
                Ok(settings) => settings,
                Err(e) => {
                    self.state = BuildState::Hashed;
                    return Err(e);
                }
            };

            tracing::info!(
                "Database for connection \"{}\" ready: \"{}\" via {:?} ({}ms)",
                self.config.connection,
                settings.database,
                self.path,
                start.elapsed().as_millis()
            );
            if self.config.log.build_settings {
                tracing::info!("Build settings for \"{}\":\n{}", self.config.connection, settings.render_table());
            }
            self.resolved = Some(settings);
            self.state = BuildState::Built;
        }

        self.resolved.as_ref().ok_or_else(|| Error::InvalidState("resolved settings missing".into()))
    }

    async fn build_remotely(&mut self, url: &str, hashes: &HashTriplet) -> Result<ResolvedSettings, Error> {
        let remote = self.services.remote.as_ref().ok_or_else(|| ConfigError::Missing {
            field: "remote build client".into(),
            hint: "remote_build_url is set; pass a client with BuildServices::with_remote".into(),
        })?;

        tracing::info!("Building connection \"{}\" remotely at {}", self.config.connection, url);
        let request = RemoteBuildRequest::new(&self.config, &self.test_name, hashes);
        let settings = remote.build(&request).await?;
        self.path = Some(BuildPath::Remote);
        Ok(settings.built_remotely(url))
    }

    async fn build_locally(&mut self, hashes: &HashTriplet) -> Result<ResolvedSettings, Error> {
        let database = self.database_name()?;
        let path = self.provision(&database, hashes).await.map_err(|e| self.build_failed(hashes, e))?;
        self.path = Some(path);
        Ok(ResolvedSettings::local(&self.config, &self.test_name, self.services.adapter.host(), &database, hashes))
    }

    async fn provision(&mut self, database: &str, hashes: &HashTriplet) -> Result<BuildPath, Error> {
        if self.config.reuse_transaction {
            self.state = BuildState::Reusing;
            if self.find_reusable(database, hashes).await {
                tracing::info!("Reusing database \"{}\"", database);
                return Ok(BuildPath::Reused);
            }
        }

        if self.config.snapshots.enabled() {
            self.state = BuildState::Importing;
            match self.import_from_snapshot(database, hashes).await {
                Ok(true) => return Ok(BuildPath::Imported),
                Ok(false) => {}
                Err(Error::SnapshotIo(reason)) => {
                    tracing::warn!("Snapshot import into \"{}\" failed ({}); migrating instead", database, reason);
                }
                Err(e) => return Err(e),
            }
        }

        self.state = BuildState::Migrating;
        self.migrate(database, hashes).await?;
        Ok(BuildPath::Migrated)
    }

    async fn find_reusable(&self, database: &str, hashes: &HashTriplet) -> bool {
        let found = match self.services.adapter.find_databases(Some(&self.config.database), &hashes.build_hash).await {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!("could not look up reusable databases: {}", e);
                return false;
            }
        };

        let Some(meta) = found.iter().find(|m| m.name == database) else {
            return false;
        };
        if meta.record.inuse {
            tracing::info!("Database \"{}\" was left dirty by an earlier test; rebuilding", database);
        }
        meta.is_valid && meta.record.is_reusable_for(hashes)
    }

    /// Restore from the newest usable snapshot. Returns `false` when there is none.
    async fn import_from_snapshot(&self, database: &str, hashes: &HashTriplet) -> Result<bool, Error> {
        let snapshots = &self.services.snapshots;

        if self.config.snapshots.after_seeders()
            && let Some(path) = snapshots.find_snapshot(hashes, SnapshotStage::Seeded).await
        {
            self.services.adapter.recreate_database(database).await?;
            snapshots.import_snapshot(&path, database).await?;
            self.write_reuse_row(database, hashes).await?;
            tracing::info!("Imported seeded snapshot into \"{}\"", database);
            return Ok(true);
        }

        if self.config.snapshots.after_migrations()
            && let Some(path) = snapshots.find_snapshot(hashes, SnapshotStage::Migrated).await
        {
            self.services.adapter.recreate_database(database).await?;
            snapshots.import_snapshot(&path, database).await?;
            self.seed(database, hashes).await?;
            self.write_reuse_row(database, hashes).await?;
            tracing::info!("Imported migrated snapshot into \"{}\"", database);
            return Ok(true);
        }

        Ok(false)
    }

    async fn migrate(&self, database: &str, hashes: &HashTriplet) -> Result<(), Error> {
        let adapter = &self.services.adapter;
        adapter.recreate_database(database).await?;

        for import in &self.config.pre_migration_imports {
            self.services.snapshots.import_snapshot(import, database).await?;
        }

        if self.config.run_migrations {
            let start = Instant::now();
            self.services.applier.migrate(&self.target(database)).await?;
            tracing::debug!("Ran migrations on \"{}\" ({}ms)", database, start.elapsed().as_millis());
            if self.config.snapshots.after_migrations() {
                self.export(database, hashes, SnapshotStage::Migrated).await?;
            }
        }

        self.seed(database, hashes).await?;
        self.write_reuse_row(database, hashes).await
    }

    async fn seed(&self, database: &str, hashes: &HashTriplet) -> Result<(), Error> {
        if !self.config.seeding_allowed() {
            return Ok(());
        }
        for seeder in self.config.effective_seeders() {
            self.services.applier.seed(&self.target(database), seeder).await?;
        }
        if self.config.snapshots.after_seeders() {
            self.export(database, hashes, SnapshotStage::Seeded).await?;
        }
        Ok(())
    }

    async fn export(&self, database: &str, hashes: &HashTriplet, stage: SnapshotStage) -> Result<(), Error> {
        let path = self.services.snapshots.snapshot_path(hashes, stage);
        self.services.snapshots.export_snapshot(database, &path).await
    }

    async fn write_reuse_row(&self, database: &str, hashes: &HashTriplet) -> Result<(), Error> {
        let record = ReuseRecord::for_build(&self.config, hashes);
        self.services.adapter.write_reuse_record(database, &record).await
    }

    fn target<'a>(&'a self, database: &'a str) -> ApplyTarget<'a> {
        ApplyTarget {
            connection: &self.config.connection,
            driver: self.config.driver,
            database,
            adapter: self.services.adapter.as_ref(),
        }
    }

    fn build_failed(&self, hashes: &HashTriplet, err: Error) -> Error {
        match err {
            e @ (Error::BuildFailed { .. } | Error::HashingError { .. }) => e,
            other => Error::BuildFailed {
                connection: self.config.connection.clone(),
                driver: self.config.driver.to_string(),
                hashes: hashes.render(),
                reason: other.to_string(),
            },
        }
    }

    /// Open the reuse transaction around the next test body.
    ///
    /// Marks the reuse row in use inside the transaction; the rollback in
    /// [`post_test`](Self::post_test) clears the mark again.
    pub async fn post_build(&mut self) -> Result<(), Error> {
        match self.state {
            BuildState::Built | BuildState::Executed => {}
            BuildState::ReuseTxnOpen => return Ok(()),
            state => return Err(Error::InvalidState(format!("post-build step in state {state:?}"))),
        }
        if !self.config.reuse_transaction {
            return Ok(());
        }

        let database = self.resolved_database()?;
        let session = self.services.adapter.open_session(&database).await?;
        session.execute(&touch_last_used(chrono::Utc::now())).await?;
        session.execute("BEGIN").await?;
        session.execute(MARK_IN_USE).await?;
        self.session = Some(session);
        self.state = BuildState::ReuseTxnOpen;
        tracing::debug!("Opened reuse transaction on \"{}\"", database);
        Ok(())
    }

    /// Roll back the test's changes. `is_last` finalizes the builder.
    pub async fn post_test(&mut self, is_last: bool) -> Result<(), Error> {
        match self.state {
            BuildState::ReuseTxnOpen | BuildState::Built | BuildState::Executed => {}
            state => return Err(Error::InvalidState(format!("post-test step in state {state:?}"))),
        }

        let mut result = Ok(());
        if let Some(session) = self.session.take() {
            result = session.execute("ROLLBACK").await;
        }
        self.state = if is_last { BuildState::Finalized } else { BuildState::Executed };

        if self.config.reuse_transaction {
            self.check_dirty().await;
        }
        result
    }

    /// Warn when the test committed into the shared database.
    async fn check_dirty(&self) {
        let Ok(database) = self.resolved_database() else {
            return;
        };
        match self.services.adapter.read_reuse_record(&database).await {
            Ok(Some(record)) if record.inuse => {
                tracing::warn!(
                    "The test committed changes to \"{}\"; it will be rebuilt for the next run",
                    database
                );
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("dirty check on \"{}\" failed: {}", database, e),
        }
    }

    fn resolved_database(&self) -> Result<String, Error> {
        self.resolved
            .as_ref()
            .map(|r| r.database.clone())
            .ok_or_else(|| Error::InvalidState("database not built yet".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::SqlFileApplier;
    use crate::config::SnapshotMode;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingApplier {
        inner: SqlFileApplier,
        migrations: AtomicUsize,
        seeds: AtomicUsize,
    }

    #[async_trait]
    impl SchemaApplier for CountingApplier {
        async fn migrate(&self, target: &ApplyTarget<'_>) -> Result<(), Error> {
            self.migrations.fetch_add(1, Ordering::SeqCst);
            self.inner.migrate(target).await
        }

        async fn seed(&self, target: &ApplyTarget<'_>, seeder: &str) -> Result<(), Error> {
            self.seeds.fetch_add(1, Ordering::SeqCst);
            self.inner.seed(target, seeder).await
        }
    }

    #[derive(Debug)]
    struct FakeRemote {
        result: Result<ResolvedSettings, String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteBuild for FakeRemote {
        async fn build(&self, request: &RemoteBuildRequest) -> Result<ResolvedSettings, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.config.remote_build_url.is_none());
            self.result.clone().map_err(Error::RemoteBuildTimeout)
        }
    }

    struct Project {
        _tmp: tempfile::TempDir,
        root: PathBuf,
    }

    impl Project {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().to_path_buf();
            std::fs::create_dir_all(root.join("migrations")).unwrap();
            std::fs::create_dir_all(root.join("seeds")).unwrap();
            std::fs::write(root.join("migrations/001_users.sql"), "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);")
                .unwrap();
            std::fs::write(root.join("seeds/users.sql"), "INSERT INTO users (name) VALUES ('ada'), ('grace');").unwrap();
            Self { _tmp: tmp, root }
        }

        fn path(&self, relative: &str) -> PathBuf {
            self.root.join(relative)
        }

        fn config(&self) -> BuildConfig {
            BuildConfig {
                project_name: "shop".into(),
                connection: "main".into(),
                database: "app".into(),
                storage_dir: self.path("storage"),
                hash_paths: vec![self.path("migrations"), self.path("seeds")],
                migrations_path: Some(self.path("migrations")),
                ..Default::default()
            }
        }

        fn seeded_config(&self) -> BuildConfig {
            BuildConfig { seeders: vec![self.path("seeds/users.sql").to_string_lossy().into_owned()], ..self.config() }
        }
    }

    fn builder(config: BuildConfig) -> (DatabaseBuilder, Arc<CountingApplier>) {
        let applier = Arc::new(CountingApplier {
            inner: SqlFileApplier::new(config.migrations_path.clone()),
            migrations: AtomicUsize::new(0),
            seeds: AtomicUsize::new(0),
        });
        let services = BuildServices::from_config(&config).unwrap().with_applier(applier.clone());
        (DatabaseBuilder::new(config, services).with_test_name("checkout_test"), applier)
    }

    async fn user_count(builder: &DatabaseBuilder) -> String {
        let database = builder.resolved().unwrap().database.clone();
        let session = builder.services().adapter.open_session(&database).await.unwrap();
        session.query("SELECT COUNT(*) FROM users").await.unwrap()[0][0].clone().unwrap()
    }

    #[tokio::test]
    async fn test_second_builder_reuses_without_migrating() {
        let project = Project::new();

        let (mut first, first_applier) = builder(project.config());
        let database = first.execute().await.unwrap().database.clone();
        assert_eq!(first.build_path(), Some(BuildPath::Migrated));
        assert_eq!(first_applier.migrations.load(Ordering::SeqCst), 1);
        first.post_build().await.unwrap();
        first.post_test(true).await.unwrap();
        assert_eq!(first.state(), BuildState::Finalized);

        let (mut second, second_applier) = builder(project.config());
        let resolved = second.execute().await.unwrap().clone();
        assert_eq!(second.build_path(), Some(BuildPath::Reused));
        assert_eq!(second_applier.migrations.load(Ordering::SeqCst), 0);
        assert_eq!(resolved.database, database);
        assert_eq!(second.hashes(), first.hashes());
    }

    #[tokio::test]
    async fn test_seeder_change_invalidates_old_database() {
        let project = Project::new();
        let (mut first, _) = builder(project.seeded_config());
        first.execute().await.unwrap();
        let old_hashes = first.hashes().unwrap().clone();

        std::fs::write(project.path("seeds/users.sql"), "INSERT INTO users (name) VALUES ('linus');").unwrap();
        let (mut second, applier) = builder(project.seeded_config());
        let new_hashes = second.hash().unwrap().clone();
        assert_ne!(new_hashes.build_hash, old_hashes.build_hash);

        let found = second.services().adapter.find_databases(Some("app"), &new_hashes.build_hash).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(!found[0].is_valid);
        assert!(found[0].purge_if_needed().await.unwrap());

        second.execute().await.unwrap();
        assert_eq!(second.build_path(), Some(BuildPath::Migrated));
        assert_eq!(applier.migrations.load(Ordering::SeqCst), 1);
        assert_eq!(user_count(&second).await, "1");
    }

    #[tokio::test]
    async fn test_seeded_snapshot_skips_applier() {
        let project = Project::new();
        let config = BuildConfig { snapshots: SnapshotMode::AfterSeeders, ..project.seeded_config() };
        let (mut first, _) = builder(config.clone());
        first.execute().await.unwrap();
        assert!(first.services().snapshots.find_snapshot(first.hashes().unwrap(), SnapshotStage::Seeded).await.is_some());

        let (mut second, applier) = builder(BuildConfig { reuse_transaction: false, ..config });
        second.execute().await.unwrap();
        assert_eq!(second.build_path(), Some(BuildPath::Imported));
        assert_eq!(applier.migrations.load(Ordering::SeqCst), 0);
        assert_eq!(applier.seeds.load(Ordering::SeqCst), 0);
        assert_eq!(user_count(&second).await, "2");

        let database = second.resolved().unwrap().database.clone();
        let record = second.services().adapter.read_reuse_record(&database).await.unwrap().unwrap();
        assert_eq!(&record.scenario_hash, &second.hashes().unwrap().scenario_hash);
    }

    #[tokio::test]
    async fn test_migrated_snapshot_is_seeded_after_import() {
        let project = Project::new();
        let config = BuildConfig { snapshots: SnapshotMode::AfterMigrations, ..project.seeded_config() };
        let (mut first, _) = builder(config.clone());
        first.execute().await.unwrap();

        let (mut second, applier) = builder(BuildConfig { reuse_transaction: false, ..config });
        second.execute().await.unwrap();
        assert_eq!(second.build_path(), Some(BuildPath::Imported));
        assert_eq!(applier.migrations.load(Ordering::SeqCst), 0);
        assert_eq!(applier.seeds.load(Ordering::SeqCst), 1);
        assert_eq!(user_count(&second).await, "2");
    }

    #[tokio::test]
    async fn test_failed_migration_is_build_failed_and_leaves_no_reuse_row() {
        let project = Project::new();
        std::fs::write(project.path("migrations/002_broken.sql"), "CREATE TABLE (;").unwrap();
        let (mut builder, _) = builder(project.config());

        let err = builder.execute().await.unwrap_err();
        match &err {
            Error::BuildFailed { connection, driver, hashes, reason } => {
                assert_eq!(connection, "main");
                assert_eq!(driver, "sqlite");
                assert!(hashes.contains(&builder.hashes().unwrap().build_hash));
                assert!(reason.contains("002_broken.sql"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(builder.state(), BuildState::Hashed);
        let database = builder.database_name().unwrap();
        assert_eq!(builder.services().adapter.read_reuse_record(&database).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreadable_hash_path_aborts_unwrapped() {
        let project = Project::new();
        let config = BuildConfig { hash_paths: vec![project.path("missing")], ..project.config() };
        let (mut builder, applier) = builder(config);

        assert!(matches!(builder.execute().await, Err(Error::HashingError { .. })));
        assert_eq!(builder.state(), BuildState::Configured);
        assert_eq!(applier.migrations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_pre_migration_import_is_fatal() {
        let project = Project::new();
        std::fs::write(project.path("base.sql"), "NOT SQL AT ALL;").unwrap();
        let config = BuildConfig {
            pre_migration_imports: vec![project.path("base.sql")],
            snapshots: SnapshotMode::Both,
            ..project.config()
        };
        let (mut builder, applier) = builder(config);

        assert!(matches!(builder.execute().await, Err(Error::BuildFailed { .. })));
        assert_eq!(applier.migrations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rollback_discards_test_writes() {
        let project = Project::new();
        let (mut builder, _) = builder(project.seeded_config());
        builder.execute().await.unwrap();

        builder.post_build().await.unwrap();
        assert_eq!(builder.state(), BuildState::ReuseTxnOpen);
        builder.session().unwrap().execute("INSERT INTO users (name) VALUES ('temp')").await.unwrap();
        builder.post_test(false).await.unwrap();
        assert_eq!(builder.state(), BuildState::Executed);
        assert_eq!(user_count(&builder).await, "2");

        builder.post_build().await.unwrap();
        builder.post_test(true).await.unwrap();
        assert_eq!(builder.state(), BuildState::Finalized);
        assert!(builder.post_build().await.is_err());
    }

    #[tokio::test]
    async fn test_reuse_refreshes_last_used() {
        let project = Project::new();
        let (mut builder, _) = builder(project.config());
        builder.execute().await.unwrap();

        let database = builder.resolved().unwrap().database.clone();
        let adapter = builder.services().adapter.clone();
        let old = "2020-01-01T00:00:00+00:00";
        let record = adapter.read_reuse_record(&database).await.unwrap().unwrap();
        adapter.write_reuse_record(&database, &ReuseRecord { last_used: old.into(), ..record }).await.unwrap();

        builder.post_build().await.unwrap();
        builder.post_test(true).await.unwrap();

        let after = adapter.read_reuse_record(&database).await.unwrap().unwrap();
        assert!(!after.inuse);
        let touched = chrono::DateTime::parse_from_rfc3339(&after.last_used).unwrap();
        assert!(touched > chrono::DateTime::parse_from_rfc3339(old).unwrap());
    }

    #[tokio::test]
    async fn test_committed_database_is_not_reused() {
        let project = Project::new();
        let (mut first, _) = builder(project.config());
        first.execute().await.unwrap();
        first.post_build().await.unwrap();
        first.session().unwrap().execute("COMMIT").await.unwrap();
        first.post_test(true).await.unwrap_err();

        let (mut second, applier) = builder(project.config());
        second.execute().await.unwrap();
        assert_eq!(second.build_path(), Some(BuildPath::Migrated));
        assert_eq!(applier.migrations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scenario_database_naming() {
        let project = Project::new();
        let (mut scenario, _) = builder(project.config());
        scenario.hash().unwrap();
        let name = scenario.database_name().unwrap();
        assert_eq!(name, format!("test-app_{}", &scenario.hashes().unwrap().scenario_hash[..16]));

        let (plain, _) = builder(BuildConfig { scenario_test_dbs: false, ..project.config() });
        assert_eq!(plain.database_name().unwrap(), "test-app");
    }

    fn remote_settings(project: &Project) -> ResolvedSettings {
        let hashes = HashTriplet { build_hash: "b".repeat(32), snapshot_hash: "s".repeat(32), scenario_hash: "c".repeat(32) };
        let mut settings = ResolvedSettings::local(&project.config(), "checkout_test", None, "remote-db", &hashes);
        settings.host = Some("db.remote:5432".into());
        settings
    }

    fn remote_builder(project: &Project, remote: Arc<FakeRemote>, fallback: bool) -> (DatabaseBuilder, Arc<CountingApplier>) {
        let config = BuildConfig {
            remote_build_url: Some("http://builder:8080".into()),
            remote_fallback_to_local: fallback,
            ..project.config()
        };
        let (builder, applier) = builder(config);
        let services = builder.services.clone().with_remote(remote);
        (DatabaseBuilder { services, ..builder }, applier)
    }

    #[tokio::test]
    async fn test_remote_build_uses_remote_settings_verbatim() {
        let project = Project::new();
        let remote = Arc::new(FakeRemote { result: Ok(remote_settings(&project)), calls: AtomicUsize::new(0) });
        let (mut builder, applier) = remote_builder(&project, remote.clone(), false);

        let resolved = builder.execute().await.unwrap().clone();
        assert_eq!(resolved.database, "remote-db");
        assert_eq!(resolved.connection, "main");
        assert!(resolved.built_remotely);
        assert_eq!(resolved.remote_build_url.as_deref(), Some("http://builder:8080"));
        assert_eq!(builder.build_path(), Some(BuildPath::Remote));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(applier.migrations.load(Ordering::SeqCst), 0);
        assert!(!project.path("storage/databases").exists());
    }

    #[tokio::test]
    async fn test_remote_timeout_fails_unless_fallback_configured() {
        let project = Project::new();
        let failing = || Arc::new(FakeRemote { result: Err("no answer after 300000ms".into()), calls: AtomicUsize::new(0) });

        let (mut strict, applier) = remote_builder(&project, failing(), false);
        assert!(matches!(strict.execute().await, Err(Error::RemoteBuildTimeout(_))));
        assert_eq!(applier.migrations.load(Ordering::SeqCst), 0);

        let (mut lenient, applier) = remote_builder(&project, failing(), true);
        lenient.execute().await.unwrap();
        assert_eq!(lenient.build_path(), Some(BuildPath::Migrated));
        assert_eq!(applier.migrations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_url_without_client_is_config_error() {
        let project = Project::new();
        let config = BuildConfig { remote_build_url: Some("http://builder:8080".into()), ..project.config() };
        let (mut builder, _) = builder(config);
        assert!(matches!(builder.execute().await, Err(Error::Config(_))));
    }
}
