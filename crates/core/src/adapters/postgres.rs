//! Built-in PostgreSQL client on tokio-postgres.

use std::fmt;

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

use super::{DbServer, ReuseSession, Row};
use crate::Error;
use crate::config::BuildConfig;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5432;
const DEFAULT_USER: &str = "postgres";
const MAINTENANCE_DB: &str = "postgres";

/// Connection settings for one PostgreSQL server.
///
/// A fresh connection is opened per call; databases are created and dropped
/// between calls, so pooled connections would pin them.
#[derive(Clone)]
pub struct PostgresServer {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
}

impl PostgresServer {
    pub fn new(host: &str, port: u16, user: &str, password: Option<String>) -> Self {
        Self { host: host.to_string(), port, user: user.to_string(), password }
    }

    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(
            config.host.as_deref().unwrap_or(DEFAULT_HOST),
            config.port.unwrap_or(DEFAULT_PORT),
            config.username.as_deref().unwrap_or(DEFAULT_USER),
            config.password.clone(),
        )
    }

    async fn connect(&self, database: &str) -> Result<Client, Error> {
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&self.host).port(self.port).user(&self.user).dbname(database);
        if let Some(password) = &self.password {
            cfg.password(password);
        }

        let (client, connection) = cfg.connect(NoTls).await?;
        let database = database.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("postgres connection to \"{}\" ended: {}", database, e);
            }
        });
        Ok(client)
    }
}

impl fmt::Debug for PostgresServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresServer")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[async_trait]
impl DbServer for PostgresServer {
    async fn query(&self, database: Option<&str>, sql: &str) -> Result<Vec<Row>, Error> {
        let client = self.connect(database.unwrap_or(MAINTENANCE_DB)).await?;
        simple_rows(&client, sql).await
    }

    async fn execute(&self, database: Option<&str>, sql: &str) -> Result<(), Error> {
        let client = self.connect(database.unwrap_or(MAINTENANCE_DB)).await?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    async fn open_session(&self, database: &str) -> Result<Box<dyn ReuseSession>, Error> {
        let client = self.connect(database).await?;
        Ok(Box::new(PgSession { client }))
    }

    fn host(&self) -> Option<String> {
        Some(format!("{}:{}", self.host, self.port))
    }
}

pub struct PgSession {
    client: Client,
}

#[async_trait]
impl ReuseSession for PgSession {
    async fn execute(&self, sql: &str) -> Result<(), Error> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>, Error> {
        simple_rows(&self.client, sql).await
    }
}

/// Text-protocol query; every value arrives as text already.
async fn simple_rows(client: &Client, sql: &str) -> Result<Vec<Row>, Error> {
    let messages = client.simple_query(sql).await?;
    Ok(messages
        .into_iter()
        .filter_map(|message| match message {
            SimpleQueryMessage::Row(row) => Some((0..row.len()).map(|i| row.get(i).map(str::to_string)).collect()),
            _ => None,
        })
        .collect())
}
