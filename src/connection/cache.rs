// physdbtool/src/connection/cache.rs
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Connector, SqlSession};
use crate::errors::AppError;

/// Which of the per-database sessions to use.
///
/// A session holding `LOCK TABLES ... WRITE` may only touch the tables it
/// locked, so DDL and lock-holding must never share a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    General,
    LockScoped,
}

struct CachedSession<S> {
    session: S,
    connection_id: u64,
}

/// Lazily opened, memoized sessions keyed by database and role.
///
/// A cached session that stopped answering is reported as
/// [`AppError::ConnectionClosed`] instead of being reopened: the server
/// drops a session's locks with it, and reconnecting would hide that.
pub struct ConnectionCache<C: Connector> {
    connector: C,
    wait_timeout: Duration,
    sessions: HashMap<(String, ConnectionRole), CachedSession<C::Session>>,
}

impl<C: Connector> ConnectionCache<C> {
    pub fn new(connector: C, wait_timeout: Duration) -> Self {
        ConnectionCache {
            connector,
            wait_timeout,
            sessions: HashMap::new(),
        }
    }

    pub async fn get(&mut self, database: &str, role: ConnectionRole) -> Result<&mut C::Session> {
        match self.sessions.entry((database.to_string(), role)) {
            Entry::Occupied(entry) => {
                let cached = entry.into_mut();
                if !cached.session.is_usable().await {
                    return Err(AppError::ConnectionClosed(database.to_string()).into());
                }
                Ok(&mut cached.session)
            }
            Entry::Vacant(entry) => {
                let mut session = self.connector.connect(database).await?;
                session
                    .execute(&format!(
                        "SET SESSION wait_timeout = {};",
                        self.wait_timeout.as_secs()
                    ))
                    .await?;
                let connection_id = fetch_connection_id(&mut session).await?;
                debug!(database, ?role, connection_id, "Opened database session");
                let cached = entry.insert(CachedSession {
                    session,
                    connection_id,
                });
                Ok(&mut cached.session)
            }
        }
    }

    pub fn is_open(&self, database: &str, role: ConnectionRole) -> bool {
        self.sessions.contains_key(&(database.to_string(), role))
    }

    /// Server-side id of a cached session, used to spare it when killing other clients.
    pub fn connection_id(&self, database: &str, role: ConnectionRole) -> Option<u64> {
        self.sessions
            .get(&(database.to_string(), role))
            .map(|cached| cached.connection_id)
    }

    /// Closes every cached session. Failures are logged, never returned.
    pub async fn close_all(&mut self) {
        for ((database, role), mut cached) in self.sessions.drain() {
            if let Err(e) = cached.session.close().await {
                warn!(database = %database, ?role, "Failed to close database session: {:#}", e);
            }
        }
    }
}

async fn fetch_connection_id<S: SqlSession>(session: &mut S) -> Result<u64> {
    let rows = session
        .query("SELECT CAST(CONNECTION_ID() AS CHAR);")
        .await?;
    rows.first()
        .and_then(|row| row.first().cloned().flatten())
        .context("CONNECTION_ID() returned no value")?
        .parse::<u64>()
        .context("CONNECTION_ID() returned a non-numeric value")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnector;

    #[tokio::test]
    async fn test_get_reuses_live_session() -> anyhow::Result<()> {
        let connector = FakeConnector::new();
        let journal = connector.journal();
        let mut cache = ConnectionCache::new(connector, Duration::from_secs(14400));

        cache.get("app_db", ConnectionRole::General).await?;
        cache.get("app_db", ConnectionRole::General).await?;

        let entries = journal.statements_for("app_db");
        assert_eq!(
            entries
                .iter()
                .filter(|sql| sql.as_str() == "SET SESSION wait_timeout = 14400;")
                .count(),
            1
        );
        assert!(cache.connection_id("app_db", ConnectionRole::General).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_roles_get_independent_sessions() -> anyhow::Result<()> {
        let mut cache = ConnectionCache::new(FakeConnector::new(), Duration::from_secs(60));

        cache.get("app_db", ConnectionRole::General).await?;
        assert!(!cache.is_open("app_db", ConnectionRole::LockScoped));
        cache.get("app_db", ConnectionRole::LockScoped).await?;

        let general = cache.connection_id("app_db", ConnectionRole::General);
        let locked = cache.connection_id("app_db", ConnectionRole::LockScoped);
        assert!(general.is_some() && locked.is_some());
        assert_ne!(general, locked);
        Ok(())
    }

    #[tokio::test]
    async fn test_dead_session_is_reported_not_reopened() -> anyhow::Result<()> {
        let connector = FakeConnector::new();
        let liveness = connector.liveness();
        let mut cache = ConnectionCache::new(connector, Duration::from_secs(60));

        cache.get("app_db", ConnectionRole::General).await?;
        liveness.kill_all();

        let err = match cache.get("app_db", ConnectionRole::General).await {
            Ok(_) => panic!("dead session must not be handed out"),
            Err(e) => e,
        };
        assert!(matches!(
            err.downcast_ref::<AppError>(),
            Some(AppError::ConnectionClosed(db)) if db == "app_db"
        ));
        Ok(())
    }
}
