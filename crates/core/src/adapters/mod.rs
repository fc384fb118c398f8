//! Per-engine driver adapters.
//!
//! Every engine follows the same enumeration flow: list the databases the
//! connection can see, read the reuse table of each, and classify it against
//! the current build hash. Databases without a readable reuse row are not
//! ours and are skipped silently. Engines differ only in dialect and catalog.
//!
//! SQLite databases are files and are handled directly. Network engines are
//! reached through a [`DbServer`], the boundary to the wire client.

pub mod dialect;
pub mod postgres;
pub mod sql;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Error;
use crate::config::{BuildConfig, Driver};
use crate::meta::{DatabaseMetaInfo, Removable, Sizeable};
use crate::reuse::ReuseRecord;

pub use dialect::{Dialect, dialect_for};
pub use postgres::PostgresServer;
pub use sql::SqlAdapter;
pub use sqlite::SqliteAdapter;

/// A result row with every column rendered as text.
pub type Row = Vec<Option<String>>;

/// Text-SQL access to a database server.
#[async_trait]
pub trait DbServer: Send + Sync + fmt::Debug {
    /// Run a query, against `database` or the server's maintenance database when `None`.
    async fn query(&self, database: Option<&str>, sql: &str) -> Result<Vec<Row>, Error>;

    async fn execute(&self, database: Option<&str>, sql: &str) -> Result<(), Error>;

    /// Open a dedicated connection that stays open across statements.
    async fn open_session(&self, database: &str) -> Result<Box<dyn ReuseSession>, Error>;

    fn host(&self) -> Option<String>;
}

/// A dedicated connection wrapping one test body.
#[async_trait]
pub trait ReuseSession: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<(), Error>;

    async fn query(&self, sql: &str) -> Result<Vec<Row>, Error>;
}

/// Uniform contract over database engines.
#[async_trait]
pub trait DriverAdapter: Sizeable + Removable + fmt::Debug {
    fn driver(&self) -> Driver;

    fn connection(&self) -> &str;

    fn host(&self) -> Option<String>;

    /// Filesystem location of the database, for file-based engines.
    fn location(&self, _database: &str) -> Option<std::path::PathBuf> {
        None
    }

    /// Enumerate the databases carrying one of our reuse rows.
    ///
    /// `orig_database` restricts the result to databases built for that
    /// original database name; `None` returns every database of the project.
    async fn find_databases(&self, orig_database: Option<&str>, build_hash: &str)
    -> Result<Vec<DatabaseMetaInfo>, Error>;

    /// Drop the database. Dropping an absent database succeeds.
    async fn remove_database(&self, meta: &DatabaseMetaInfo) -> Result<bool, Error> {
        self.remove_named(&meta.name, !meta.is_valid).await
    }

    /// Best-effort size in bytes.
    async fn size(&self, database: &str) -> Option<u64> {
        self.size_of(database).await
    }

    /// Drop (if present) and create an empty database.
    async fn recreate_database(&self, database: &str) -> Result<(), Error>;

    /// Run one or more statements against the database.
    async fn execute(&self, database: &str, sql: &str) -> Result<(), Error>;

    async fn read_reuse_record(&self, database: &str) -> Result<Option<ReuseRecord>, Error>;

    /// Replace the reuse row. Must be the last step of a build.
    async fn write_reuse_record(&self, database: &str, record: &ReuseRecord) -> Result<(), Error>;

    async fn open_session(&self, database: &str) -> Result<Box<dyn ReuseSession>, Error>;
}

/// Whether a reuse row belongs to this project (and original database, when given).
pub(crate) fn accepts(record: &ReuseRecord, project_name: &str, orig_database: Option<&str>) -> bool {
    record.project_name == project_name && orig_database.is_none_or(|orig| record.orig_database == orig)
}

/// Pick the adapter for `config.driver`.
///
/// SQLite needs no server. Network engines use `server` when given, otherwise
/// the built-in client for the engine.
///
/// # Errors
///
/// Returns `Error::Config` when a network engine has no client available.
pub fn adapter_for(config: &BuildConfig, server: Option<Arc<dyn DbServer>>) -> Result<Arc<dyn DriverAdapter>, Error> {
    if config.driver == Driver::Sqlite {
        return Ok(Arc::new(SqliteAdapter::new(&config.connection, &config.project_name, config.sqlite_dir())));
    }

    let server = match (server, config.driver) {
        (Some(server), _) => server,
        (None, Driver::Pgsql) => Arc::new(PostgresServer::from_config(config)) as Arc<dyn DbServer>,
        (None, driver) => {
            return Err(crate::config::ConfigError::Missing {
                field: format!("{driver} client"),
                hint: "No built-in client for this engine; pass a DbServer to BuildServices::with_server".into(),
            }
            .into());
        }
    };

    let dialect = dialect_for(config.driver).ok_or_else(|| Error::InvalidState(format!("no dialect for {}", config.driver)))?;
    Ok(Arc::new(SqlAdapter::new(&config.connection, &config.project_name, dialect, server)))
}
