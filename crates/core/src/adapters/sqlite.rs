//! File-backed SQLite databases.
//!
//! Each test database is a `<name>.sqlite` file in one directory. Enumeration
//! lists that directory; removal deletes the file and its journal siblings.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_rusqlite::rusqlite::types::ValueRef;
use tokio_rusqlite::{Connection, params, rusqlite};

use super::{DriverAdapter, ReuseSession, Row, accepts};
use crate::Error;
use crate::config::Driver;
use crate::meta::{DatabaseMetaInfo, Removable, Sizeable};
use crate::reuse::{CLEAR_REUSE_ROWS, CREATE_REUSE_TABLE, REUSE_TABLE, ReuseRecord, SELECT_REUSE_ROW};

const EXTENSION: &str = "sqlite";
const SIBLING_SUFFIXES: [&str; 4] = ["", "-wal", "-shm", "-journal"];

#[derive(Debug, Clone)]
pub struct SqliteAdapter {
    connection: String,
    project_name: String,
    dir: PathBuf,
}

impl SqliteAdapter {
    pub fn new(connection: &str, project_name: &str, dir: PathBuf) -> Self {
        Self { connection: connection.to_string(), project_name: project_name.to_string(), dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the named database.
    pub fn database_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{EXTENSION}"))
    }

    async fn open(&self, name: &str) -> Result<Connection, Error> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Connection::open(self.database_path(name)).await.map_err(|e| Error::Database(e.into()))
    }

    /// Open an existing database without creating it.
    async fn open_existing(&self, name: &str) -> Result<Option<Connection>, Error> {
        if !tokio::fs::try_exists(self.database_path(name)).await? {
            return Ok(None);
        }
        self.open(name).await.map(Some)
    }
}

#[async_trait]
impl Sizeable for SqliteAdapter {
    async fn size_of(&self, name: &str) -> Option<u64> {
        tokio::fs::metadata(self.database_path(name)).await.ok().map(|m| m.len())
    }
}

#[async_trait]
impl Removable for SqliteAdapter {
    async fn remove_named(&self, name: &str, stale: bool) -> Result<bool, Error> {
        let start = std::time::Instant::now();
        let base = self.database_path(name);
        for suffix in SIBLING_SUFFIXES {
            let mut path = base.clone().into_os_string();
            path.push(suffix);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let stale = if stale { " stale" } else { "" };
        tracing::debug!("Removed{} sqlite database: \"{}\" ({}ms)", stale, base.display(), start.elapsed().as_millis());
        Ok(true)
    }
}

#[async_trait]
impl DriverAdapter for SqliteAdapter {
    fn driver(&self) -> Driver {
        Driver::Sqlite
    }

    fn connection(&self) -> &str {
        &self.connection
    }

    fn host(&self) -> Option<String> {
        None
    }

    fn location(&self, database: &str) -> Option<PathBuf> {
        Some(self.database_path(database))
    }

    async fn find_databases(
        &self, orig_database: Option<&str>, build_hash: &str,
    ) -> Result<Vec<DatabaseMetaInfo>, Error> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();

        let mut found = Vec::new();
        for name in names {
            let record = match self.read_reuse_record(&name).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!("skipping unreadable sqlite database \"{}\": {}", name, e);
                    continue;
                }
            };
            if !accepts(&record, &self.project_name, orig_database) {
                continue;
            }
            let ops = Arc::new(self.clone());
            found.push(DatabaseMetaInfo::new(
                name,
                self.connection.clone(),
                Driver::Sqlite,
                record,
                build_hash,
                ops.clone(),
                ops,
            ));
        }
        Ok(found)
    }

    async fn recreate_database(&self, database: &str) -> Result<(), Error> {
        self.remove_named(database, false).await?;
        let conn = self.open(database).await?;
        conn.call(|conn| -> Result<(), Error> {
            conn.execute_batch("PRAGMA journal_mode=DELETE;")?;
            Ok(())
        })
        .await
        .map_err(Error::from)
    }

    async fn execute(&self, database: &str, sql: &str) -> Result<(), Error> {
        let conn = self.open(database).await?;
        let sql = sql.to_string();
        conn.call(move |conn| -> Result<(), Error> {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
        .map_err(Error::from)
    }

    async fn read_reuse_record(&self, database: &str) -> Result<Option<ReuseRecord>, Error> {
        let Some(conn) = self.open_existing(database).await? else {
            return Ok(None);
        };
        conn.call(|conn| -> Result<Option<ReuseRecord>, Error> {
            let has_table: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                params![REUSE_TABLE],
                |row| row.get(0),
            )?;
            if !has_table {
                return Ok(None);
            }
            let rows = text_rows(conn, SELECT_REUSE_ROW)?;
            Ok(rows.first().and_then(|row| ReuseRecord::from_text_row(row)))
        })
        .await
        .map_err(Error::from)
    }

    async fn write_reuse_record(&self, database: &str, record: &ReuseRecord) -> Result<(), Error> {
        let conn = self.open(database).await?;
        let record = record.clone();
        conn.call(move |conn| -> Result<(), Error> {
            conn.execute_batch(CREATE_REUSE_TABLE)?;
            conn.execute_batch(CLEAR_REUSE_ROWS)?;
            conn.execute(
                "INSERT INTO _scenariodb_reuse (
                    table_version, project_name, connection, orig_database, driver,
                    build_hash, snapshot_hash, scenario_hash, reuse_transaction, inuse, last_used
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.table_version,
                    &record.project_name,
                    &record.connection,
                    &record.orig_database,
                    &record.driver,
                    &record.build_hash,
                    &record.snapshot_hash,
                    &record.scenario_hash,
                    record.reuse_transaction as i32,
                    record.inuse as i32,
                    &record.last_used,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(Error::from)
    }

    async fn open_session(&self, database: &str) -> Result<Box<dyn ReuseSession>, Error> {
        let conn = self.open(database).await?;
        Ok(Box::new(SqliteSession { conn }))
    }
}

/// One connection held open across a test body.
pub struct SqliteSession {
    conn: Connection,
}

#[async_trait]
impl ReuseSession for SqliteSession {
    async fn execute(&self, sql: &str) -> Result<(), Error> {
        let sql = sql.to_string();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>, Error> {
        let sql = sql.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<Row>, Error> { text_rows(conn, &sql) })
            .await
            .map_err(Error::from)
    }
}

/// Run a query and render every column as text.
fn text_rows(conn: &rusqlite::Connection, sql: &str) -> Result<Vec<Row>, Error> {
    let mut stmt = conn.prepare(sql)?;
    let columns = stmt.column_count();
    let rows = stmt
        .query_map([], |row| {
            (0..columns)
                .map(|i| {
                    Ok(match row.get_ref(i)? {
                        ValueRef::Null => None,
                        ValueRef::Integer(v) => Some(v.to_string()),
                        ValueRef::Real(v) => Some(v.to_string()),
                        ValueRef::Text(v) => Some(String::from_utf8_lossy(v).into_owned()),
                        ValueRef::Blob(v) => Some(hex::encode(v)),
                    })
                })
                .collect::<Result<Row, rusqlite::Error>>()
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
