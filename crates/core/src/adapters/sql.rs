//! Adapter for network engines reached through a [`DbServer`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::{DbServer, Dialect, DriverAdapter, ReuseSession, accepts};
use crate::Error;
use crate::config::Driver;
use crate::meta::{DatabaseMetaInfo, Removable, Sizeable};
use crate::reuse::{CLEAR_REUSE_ROWS, CREATE_REUSE_TABLE, ReuseRecord, SELECT_REUSE_ROW};

/// PostgreSQL/MySQL adapter: one dialect over one server client.
#[derive(Clone)]
pub struct SqlAdapter {
    connection: String,
    project_name: String,
    dialect: &'static dyn Dialect,
    server: Arc<dyn DbServer>,
}

impl SqlAdapter {
    pub fn new(connection: &str, project_name: &str, dialect: &'static dyn Dialect, server: Arc<dyn DbServer>) -> Self {
        Self { connection: connection.to_string(), project_name: project_name.to_string(), dialect, server }
    }
}

impl fmt::Debug for SqlAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlAdapter")
            .field("connection", &self.connection)
            .field("driver", &self.dialect.driver())
            .field("server", &self.server)
            .finish()
    }
}

#[async_trait]
impl Sizeable for SqlAdapter {
    async fn size_of(&self, name: &str) -> Option<u64> {
        let rows = match self.server.query(None, &self.dialect.size_sql(name)).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::debug!("size query for \"{}\" failed: {}", name, e);
                return None;
            }
        };
        rows.first()
            .and_then(|row| row.first())
            .and_then(|value| value.as_deref())
            .and_then(|value| value.trim().parse::<u64>().ok())
    }
}

#[async_trait]
impl Removable for SqlAdapter {
    async fn remove_named(&self, name: &str, stale: bool) -> Result<bool, Error> {
        let start = std::time::Instant::now();
        self.server.execute(None, &self.dialect.drop_database_sql(name)).await?;

        let stale = if stale { " stale" } else { "" };
        tracing::debug!(
            "Removed{} {} database: \"{}\" ({}ms)",
            stale,
            self.dialect.driver(),
            name,
            start.elapsed().as_millis()
        );
        Ok(true)
    }
}

#[async_trait]
impl DriverAdapter for SqlAdapter {
    fn driver(&self) -> Driver {
        self.dialect.driver()
    }

    fn connection(&self) -> &str {
        &self.connection
    }

    fn host(&self) -> Option<String> {
        self.server.host()
    }

    async fn find_databases(
        &self, orig_database: Option<&str>, build_hash: &str,
    ) -> Result<Vec<DatabaseMetaInfo>, Error> {
        let rows = self.server.query(None, self.dialect.list_databases_sql()).await?;

        let mut found = Vec::new();
        for name in rows.into_iter().filter_map(|row| row.into_iter().next().flatten()) {
            let record = match self.read_reuse_record(&name).await {
                Ok(Some(record)) => record,
                _ => continue,
            };
            if !accepts(&record, &self.project_name, orig_database) {
                continue;
            }
            found.push(DatabaseMetaInfo::new(
                name,
                self.connection.clone(),
                self.driver(),
                record,
                build_hash,
                Arc::new(self.clone()),
                Arc::new(self.clone()),
            ));
        }
        Ok(found)
    }

    async fn recreate_database(&self, database: &str) -> Result<(), Error> {
        self.server.execute(None, &self.dialect.drop_database_sql(database)).await?;
        self.server.execute(None, &self.dialect.create_database_sql(database)).await
    }

    async fn execute(&self, database: &str, sql: &str) -> Result<(), Error> {
        self.server.execute(Some(database), sql).await
    }

    async fn read_reuse_record(&self, database: &str) -> Result<Option<ReuseRecord>, Error> {
        let rows = self.server.query(Some(database), SELECT_REUSE_ROW).await?;
        Ok(rows.first().and_then(|row| ReuseRecord::from_text_row(row)))
    }

    async fn write_reuse_record(&self, database: &str, record: &ReuseRecord) -> Result<(), Error> {
        self.server.execute(Some(database), CREATE_REUSE_TABLE).await?;
        self.server.execute(Some(database), CLEAR_REUSE_ROWS).await?;
        self.server.execute(Some(database), &record.insert_sql(self.dialect.literal())).await
    }

    async fn open_session(&self, database: &str) -> Result<Box<dyn ReuseSession>, Error> {
        self.server.open_session(database).await
    }
}
