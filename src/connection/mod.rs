// physdbtool/src/connection/mod.rs
pub(crate) mod cache;

pub use cache::{ConnectionCache, ConnectionRole};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{Connection, Executor, Row as _};

use crate::config::DatabaseCredentials;

/// One result row, every column rendered as text.
pub type Row = Vec<Option<String>>;

/// A single server session. Session state (locks, `FOREIGN_KEY_CHECKS`,
/// `wait_timeout`) lives exactly as long as this value.
#[async_trait]
pub trait SqlSession: Send {
    async fn execute(&mut self, sql: &str) -> Result<()>;
    async fn query(&mut self, sql: &str) -> Result<Vec<Row>>;
    /// Cheap round trip; false when the server side of the session is gone.
    async fn is_usable(&mut self) -> bool;
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Session: SqlSession;

    async fn connect(&self, database: &str) -> Result<Self::Session>;
}

/// Opens sessions against a MariaDB/MySQL server.
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    credentials: DatabaseCredentials,
}

impl MySqlConnector {
    pub fn new(credentials: DatabaseCredentials) -> Self {
        MySqlConnector { credentials }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Session = MySqlSession;

    async fn connect(&self, database: &str) -> Result<MySqlSession> {
        let options = MySqlConnectOptions::new()
            .host(&self.credentials.host)
            .port(self.credentials.port)
            .username(&self.credentials.user)
            .password(&self.credentials.password)
            .database(database);

        let connection = MySqlConnection::connect_with(&options)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to database '{}' on {}:{}",
                    database, self.credentials.host, self.credentials.port
                )
            })?;
        Ok(MySqlSession {
            connection: Some(connection),
        })
    }
}

/// Statements go over the text protocol: `FLUSH TABLES ... FOR EXPORT`,
/// `LOCK TABLES` and `ALTER TABLE ... DISCARD TABLESPACE` cannot be prepared.
pub struct MySqlSession {
    connection: Option<MySqlConnection>,
}

impl MySqlSession {
    fn connection(&mut self) -> Result<&mut MySqlConnection> {
        self.connection
            .as_mut()
            .context("Database session has already been closed")
    }
}

#[async_trait]
impl SqlSession for MySqlSession {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        let connection = self.connection()?;
        connection
            .execute(sql)
            .await
            .with_context(|| format!("Failed to execute: {}", sql))?;
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        let connection = self.connection()?;
        let rows = connection
            .fetch_all(sql)
            .await
            .with_context(|| format!("Failed to query: {}", sql))?;

        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|index| row.try_get::<Option<String>, _>(index))
                    .collect::<Result<Row, _>>()
                    .with_context(|| format!("Failed to decode row returned by: {}", sql))
            })
            .collect()
    }

    async fn is_usable(&mut self) -> bool {
        match self.connection.as_mut() {
            Some(connection) => connection.ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            connection
                .close()
                .await
                .context("Failed to close database session")?;
        }
        Ok(())
    }
}
