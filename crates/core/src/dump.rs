//! Dump and restore tools, one per engine.
//!
//! Network engines shell out to the engine's own client binaries. SQLite
//! databases are single files and are copied.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_rusqlite::Connection;

use crate::Error;
use crate::config::{BuildConfig, Driver};

/// Exports a database to a file and imports one back.
#[async_trait]
pub trait DumpTool: Send + Sync + fmt::Debug {
    /// File extension of exported snapshots, without the dot.
    fn extension(&self) -> &'static str;

    async fn export(&self, database: &str, path: &Path) -> Result<(), Error>;

    /// Load `path` into `database`, which already exists.
    async fn import(&self, path: &Path, database: &str) -> Result<(), Error>;
}

/// Pick the dump tool for `config.driver`.
pub fn dump_tool_for(config: &BuildConfig) -> Arc<dyn DumpTool> {
    match config.driver {
        Driver::Sqlite => Arc::new(SqliteFileCopy::new(config.sqlite_dir())),
        Driver::Pgsql => Arc::new(PgDumpTool::from_config(config)),
        Driver::Mysql => Arc::new(MysqlDumpTool::from_config(config)),
    }
}

/// Run a prepared command and collect stderr into the failure message.
pub(crate) async fn run_tool(mut cmd: Command, label: &str) -> Result<(), String> {
    cmd.stdout(Stdio::null()).stderr(Stdio::piped());
    let start = std::time::Instant::now();
    let output = cmd.output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            format!("{label}: program not found: {e}")
        } else {
            format!("{label}: failed to start: {e}")
        }
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{label} exited with {}: {}", output.status, stderr.trim()));
    }
    tracing::debug!("{} finished ({}ms)", label, start.elapsed().as_millis());
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SqliteFileCopy {
    dir: PathBuf,
}

impl SqliteFileCopy {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn database_path(&self, database: &str) -> PathBuf {
        self.dir.join(format!("{database}.sqlite"))
    }
}

#[async_trait]
impl DumpTool for SqliteFileCopy {
    fn extension(&self) -> &'static str {
        "sqlite"
    }

    async fn export(&self, database: &str, path: &Path) -> Result<(), Error> {
        tokio::fs::copy(self.database_path(database), path)
            .await
            .map_err(|e| Error::SnapshotIo(format!("copy {database} to {}: {e}", path.display())))?;
        Ok(())
    }

    /// Database files are copied over the target; `.sql` files are executed in it.
    async fn import(&self, path: &Path, database: &str) -> Result<(), Error> {
        let target = self.database_path(database);
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::copy(path, &target)
                .await
                .map_err(|e| Error::SnapshotIo(format!("copy {} to {database}: {e}", path.display())))?;
            return Ok(());
        }

        let sql = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::SnapshotIo(format!("read {}: {e}", path.display())))?;
        let conn = Connection::open(target).await.map_err(|e| Error::Database(e.into()))?;
        conn.call(move |conn| -> Result<(), Error> {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::SnapshotIo(format!("import {}: {}", path.display(), Error::from(e))))
    }
}

/// `pg_dump` / `psql`.
#[derive(Clone)]
pub struct PgDumpTool {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    pg_dump: String,
    psql: String,
}

impl PgDumpTool {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            host: config.host.clone().unwrap_or_else(|| "127.0.0.1".into()),
            port: config.port.unwrap_or(5432),
            user: config.username.clone().unwrap_or_else(|| "postgres".into()),
            password: config.password.clone(),
            pg_dump: config.tools.pg_dump.clone(),
            psql: config.tools.psql.clone(),
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("-h").arg(&self.host).arg("-p").arg(self.port.to_string()).arg("-U").arg(&self.user);
        if let Some(password) = &self.password {
            cmd.env("PGPASSWORD", password);
        }
        cmd
    }
}

impl fmt::Debug for PgDumpTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgDumpTool")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("pg_dump", &self.pg_dump)
            .field("psql", &self.psql)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DumpTool for PgDumpTool {
    fn extension(&self) -> &'static str {
        "sql"
    }

    async fn export(&self, database: &str, path: &Path) -> Result<(), Error> {
        let mut cmd = self.command(&self.pg_dump);
        cmd.arg("--no-owner").arg("--no-privileges").arg("-f").arg(path).arg(database);
        run_tool(cmd, &self.pg_dump).await.map_err(Error::SnapshotIo)
    }

    async fn import(&self, path: &Path, database: &str) -> Result<(), Error> {
        let mut cmd = self.command(&self.psql);
        cmd.arg("-q").arg("-v").arg("ON_ERROR_STOP=1").arg("-d").arg(database).arg("-f").arg(path);
        run_tool(cmd, &self.psql).await.map_err(Error::SnapshotIo)
    }
}

/// `mysqldump` / `mysql`.
#[derive(Clone)]
pub struct MysqlDumpTool {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    mysqldump: String,
    mysql: String,
}

impl MysqlDumpTool {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            host: config.host.clone().unwrap_or_else(|| "127.0.0.1".into()),
            port: config.port.unwrap_or(3306),
            user: config.username.clone().unwrap_or_else(|| "root".into()),
            password: config.password.clone(),
            mysqldump: config.tools.mysqldump.clone(),
            mysql: config.tools.mysql.clone(),
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg(format!("--host={}", self.host))
            .arg(format!("--port={}", self.port))
            .arg(format!("--user={}", self.user));
        if let Some(password) = &self.password {
            cmd.env("MYSQL_PWD", password);
        }
        cmd
    }
}

impl fmt::Debug for MysqlDumpTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqlDumpTool")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("mysqldump", &self.mysqldump)
            .field("mysql", &self.mysql)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DumpTool for MysqlDumpTool {
    fn extension(&self) -> &'static str {
        "sql"
    }

    async fn export(&self, database: &str, path: &Path) -> Result<(), Error> {
        let mut cmd = self.command(&self.mysqldump);
        cmd.arg("--routines").arg("--single-transaction").arg(format!("--result-file={}", path.display())).arg(database);
        run_tool(cmd, &self.mysqldump).await.map_err(Error::SnapshotIo)
    }

    async fn import(&self, path: &Path, database: &str) -> Result<(), Error> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::SnapshotIo(format!("open {}: {e}", path.display())))?
            .into_std()
            .await;
        let mut cmd = self.command(&self.mysql);
        cmd.arg(database).stdin(Stdio::from(file));
        run_tool(cmd, &self.mysql).await.map_err(Error::SnapshotIo)
    }
}
