// physdbtool/src/testing.rs
//! In-memory stand-ins for the database server and the snapshot service.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backup::snapshot::{SnapshotRequest, SnapshotTransport};
use crate::connection::{Connector, Row, SqlSession};

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub database: String,
    pub session: u64,
    pub sql: String,
    /// Whatever the probe reported at the moment the statement ran.
    pub observation: Option<String>,
}

/// Every statement seen by every fake session, in execution order.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<JournalEntry>>>);

impl Journal {
    fn push(&self, entry: JournalEntry) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().unwrap().clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.sql).collect()
    }

    pub fn statements_for(&self, database: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.database == database)
            .map(|e| e.sql)
            .collect()
    }

    pub fn position(&self, needle: &str) -> Option<usize> {
        self.statements().iter().position(|sql| sql.contains(needle))
    }
}

#[derive(Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn kill_all(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub type Probe = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Clone)]
struct CannedResponse {
    database: Option<String>,
    pattern: String,
    rows: Vec<Row>,
}

pub fn row(values: &[&str]) -> Row {
    values.iter().map(|v| Some(v.to_string())).collect()
}

/// Hands out sessions that record statements and answer queries from canned rows.
#[derive(Clone)]
pub struct FakeConnector {
    journal: Journal,
    alive: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    responses: Vec<CannedResponse>,
    failures: Vec<String>,
    probe: Option<Probe>,
}

impl FakeConnector {
    pub fn new() -> Self {
        FakeConnector {
            journal: Journal::default(),
            alive: Arc::new(AtomicBool::new(true)),
            next_id: Arc::new(AtomicU64::new(100)),
            responses: Vec::new(),
            failures: Vec::new(),
            probe: None,
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn liveness(&self) -> Liveness {
        Liveness(self.alive.clone())
    }

    /// Queries on `database` whose text contains `pattern` return `rows`.
    pub fn respond(mut self, database: &str, pattern: &str, rows: Vec<Row>) -> Self {
        self.responses.push(CannedResponse {
            database: Some(database.to_string()),
            pattern: pattern.to_string(),
            rows,
        });
        self
    }

    /// Statements containing `pattern` fail.
    pub fn fail_on(mut self, pattern: &str) -> Self {
        self.failures.push(pattern.to_string());
        self
    }

    pub fn with_probe(mut self, probe: Probe) -> Self {
        self.probe = Some(probe);
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, database: &str) -> Result<FakeSession> {
        Ok(FakeSession {
            database: database.to_string(),
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            connector: self.clone(),
        })
    }
}

pub struct FakeSession {
    database: String,
    id: u64,
    connector: FakeConnector,
}

impl FakeSession {
    fn record(&self, sql: &str) -> Result<()> {
        let observation = self.connector.probe.as_ref().and_then(|probe| probe(sql));
        self.connector.journal.push(JournalEntry {
            database: self.database.clone(),
            session: self.id,
            sql: sql.to_string(),
            observation,
        });
        if let Some(pattern) = self.connector.failures.iter().find(|p| sql.contains(p.as_str())) {
            anyhow::bail!("fake server rejected statement matching '{}'", pattern);
        }
        Ok(())
    }
}

#[async_trait]
impl SqlSession for FakeSession {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.record(sql)
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        if sql.contains("CONNECTION_ID()") {
            return Ok(vec![row(&[&self.id.to_string()])]);
        }
        self.record(sql)?;
        Ok(self
            .connector
            .responses
            .iter()
            .find(|r| {
                r.database.as_deref().is_none_or(|db| db == self.database)
                    && sql.contains(r.pattern.as_str())
            })
            .map(|r| r.rows.clone())
            .unwrap_or_default())
    }

    async fn is_usable(&mut self) -> bool {
        self.connector.alive.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Replies with scripted HTTP statuses, then 200 once the script runs out.
pub struct ScriptedTransport {
    statuses: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<(String, SnapshotRequest)>>,
}

impl ScriptedTransport {
    pub fn new(statuses: &[u16]) -> Self {
        ScriptedTransport {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(String, SnapshotRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnapshotTransport for ScriptedTransport {
    async fn post(&self, url: &str, request: &SnapshotRequest) -> Result<u16> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), request.clone()));
        Ok(self.statuses.lock().unwrap().pop_front().unwrap_or(200))
    }
}

#[async_trait]
impl<T: SnapshotTransport> SnapshotTransport for Arc<T> {
    async fn post(&self, url: &str, request: &SnapshotRequest) -> Result<u16> {
        self.as_ref().post(url, request).await
    }
}
