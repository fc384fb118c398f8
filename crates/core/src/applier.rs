//! Schema appliers: the black box that runs migrations and seeders.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::Error;
use crate::adapters::DriverAdapter;
use crate::config::{ApplierConfig, BuildConfig, Driver};
use crate::dump::run_tool;

/// The database an applier works on.
pub struct ApplyTarget<'a> {
    pub connection: &'a str,
    pub driver: Driver,
    pub database: &'a str,
    pub adapter: &'a dyn DriverAdapter,
}

#[async_trait]
pub trait SchemaApplier: Send + Sync + fmt::Debug {
    async fn migrate(&self, target: &ApplyTarget<'_>) -> Result<(), Error>;

    async fn seed(&self, target: &ApplyTarget<'_>, seeder: &str) -> Result<(), Error>;
}

pub fn applier_for(config: &BuildConfig) -> Arc<dyn SchemaApplier> {
    match &config.applier {
        ApplierConfig::SqlFiles => Arc::new(SqlFileApplier::new(config.migrations_path.clone())),
        ApplierConfig::Command { migrate, seed } => Arc::new(CommandApplier::new(migrate.clone(), seed.clone())),
    }
}

/// Executes `*.sql` migration files in filename order; seeders are SQL file paths.
#[derive(Debug, Clone)]
pub struct SqlFileApplier {
    migrations_path: Option<PathBuf>,
}

impl SqlFileApplier {
    pub fn new(migrations_path: Option<PathBuf>) -> Self {
        Self { migrations_path }
    }

    async fn run_file(&self, target: &ApplyTarget<'_>, file: &Path) -> Result<(), Error> {
        let sql = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| Error::Applier(format!("{}: {e}", file.display())))?;
        target
            .adapter
            .execute(target.database, &sql)
            .await
            .map_err(|e| Error::Applier(format!("{}: {e}", file.display())))
    }
}

#[async_trait]
impl SchemaApplier for SqlFileApplier {
    async fn migrate(&self, target: &ApplyTarget<'_>) -> Result<(), Error> {
        let Some(dir) = &self.migrations_path else {
            tracing::debug!("no migrations path for \"{}\"", target.connection);
            return Ok(());
        };

        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| Error::Applier(format!("{}: {e}", dir.display())))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("sql") {
                files.push(path);
            }
        }
        files.sort();

        for file in &files {
            let start = std::time::Instant::now();
            self.run_file(target, file).await?;
            tracing::debug!("Migrated {} ({}ms)", file.display(), start.elapsed().as_millis());
        }
        Ok(())
    }

    async fn seed(&self, target: &ApplyTarget<'_>, seeder: &str) -> Result<(), Error> {
        let start = std::time::Instant::now();
        self.run_file(target, Path::new(seeder)).await?;
        tracing::debug!("Seeded {} ({}ms)", seeder, start.elapsed().as_millis());
        Ok(())
    }
}

/// Runs external programs against the target database.
///
/// The target is described through `SCENARIODB_TARGET_*` environment
/// variables; the seed command also gets `SCENARIODB_TARGET_SEEDER`.
#[derive(Debug, Clone)]
pub struct CommandApplier {
    migrate: Vec<String>,
    seed: Vec<String>,
}

impl CommandApplier {
    pub fn new(migrate: Vec<String>, seed: Vec<String>) -> Self {
        Self { migrate, seed }
    }

    fn command(argv: &[String], target: &ApplyTarget<'_>) -> Option<Command> {
        let (program, args) = argv.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("SCENARIODB_TARGET_CONNECTION", target.connection)
            .env("SCENARIODB_TARGET_DRIVER", target.driver.as_str())
            .env("SCENARIODB_TARGET_DATABASE", target.database);
        if let Some(host) = target.adapter.host() {
            cmd.env("SCENARIODB_TARGET_HOST", host);
        }
        if let Some(path) = target.adapter.location(target.database) {
            cmd.env("SCENARIODB_TARGET_PATH", path);
        }
        Some(cmd)
    }
}

#[async_trait]
impl SchemaApplier for CommandApplier {
    async fn migrate(&self, target: &ApplyTarget<'_>) -> Result<(), Error> {
        let Some(cmd) = Self::command(&self.migrate, target) else {
            return Ok(());
        };
        run_tool(cmd, &self.migrate.join(" ")).await.map_err(Error::Applier)
    }

    async fn seed(&self, target: &ApplyTarget<'_>, seeder: &str) -> Result<(), Error> {
        let Some(mut cmd) = Self::command(&self.seed, target) else {
            return Err(Error::Applier(format!("no seed command configured for seeder \"{seeder}\"")));
        };
        cmd.env("SCENARIODB_TARGET_SEEDER", seeder);
        run_tool(cmd, &self.seed.join(" ")).await.map_err(Error::Applier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SqliteAdapter;
    use crate::adapters::ReuseSession;

    fn target<'a>(adapter: &'a SqliteAdapter, database: &'a str) -> ApplyTarget<'a> {
        ApplyTarget { connection: "main", driver: Driver::Sqlite, database, adapter }
    }

    async fn count(adapter: &SqliteAdapter, database: &str, sql: &str) -> String {
        let session: Box<dyn ReuseSession> = adapter.open_session(database).await.unwrap();
        let rows = session.query(sql).await.unwrap();
        rows[0][0].clone().unwrap()
    }

    #[tokio::test]
    async fn test_sql_files_run_in_name_order() {
        let tmp = tempfile::tempdir().unwrap();
        let migrations = tmp.path().join("migrations");
        std::fs::create_dir_all(&migrations).unwrap();
        std::fs::write(migrations.join("002_orders.sql"), "CREATE TABLE orders (user_id INTEGER REFERENCES users(id));")
            .unwrap();
        std::fs::write(migrations.join("001_users.sql"), "CREATE TABLE users (id INTEGER PRIMARY KEY);").unwrap();
        std::fs::write(migrations.join("README.md"), "not a migration").unwrap();
        let seed = tmp.path().join("users.sql");
        std::fs::write(&seed, "INSERT INTO users (id) VALUES (1), (2);").unwrap();

        let adapter = SqliteAdapter::new("main", "shop", tmp.path().join("databases"));
        let applier = SqlFileApplier::new(Some(migrations));
        applier.migrate(&target(&adapter, "test-app")).await.unwrap();
        applier.seed(&target(&adapter, "test-app"), &seed.to_string_lossy()).await.unwrap();

        assert_eq!(count(&adapter, "test-app", "SELECT COUNT(*) FROM users").await, "2");
        assert_eq!(count(&adapter, "test-app", "SELECT COUNT(*) FROM orders").await, "0");
    }

    #[tokio::test]
    async fn test_broken_migration_names_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let migrations = tmp.path().join("migrations");
        std::fs::create_dir_all(&migrations).unwrap();
        std::fs::write(migrations.join("001_broken.sql"), "CREATE TABLE (;").unwrap();

        let adapter = SqliteAdapter::new("main", "shop", tmp.path().join("databases"));
        let err = SqlFileApplier::new(Some(migrations)).migrate(&target(&adapter, "test-app")).await.unwrap_err();
        match err {
            Error::Applier(msg) => assert!(msg.contains("001_broken.sql")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_applier_describes_target() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("env.txt");
        let script = format!(
            "echo \"$SCENARIODB_TARGET_DATABASE $SCENARIODB_TARGET_DRIVER $SCENARIODB_TARGET_SEEDER\" > {}",
            out.display()
        );
        let applier = CommandApplier::new(vec![], vec!["sh".into(), "-c".into(), script]);
        let adapter = SqliteAdapter::new("main", "shop", tmp.path().join("databases"));

        applier.migrate(&target(&adapter, "test-app")).await.unwrap();
        applier.seed(&target(&adapter, "test-app"), "UserSeeder").await.unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "test-app sqlite UserSeeder");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = SqliteAdapter::new("main", "shop", tmp.path().join("databases"));
        let applier = CommandApplier::new(vec!["sh".into(), "-c".into(), "echo boom >&2; exit 3".into()], vec![]);

        let err = applier.migrate(&target(&adapter, "test-app")).await.unwrap_err();
        match err {
            Error::Applier(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(applier.seed(&target(&adapter, "test-app"), "UserSeeder").await.is_err());
    }
}
