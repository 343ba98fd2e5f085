// physdbtool/src/backup/session.rs
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

use super::db_dump::export_table_schema;
use super::manifest::{
    BackupManifest, DatabaseManifest, FileMetadata, metadata_path, store_database_manifest,
};
use super::snapshot::{RetryPolicy, SnapshotRequest, SnapshotTransport, SnapshotTrigger};
use crate::config::{BackupConfig, DatabaseCredentials};
use crate::connection::{ConnectionCache, ConnectionRole, Connector, SqlSession};
use crate::engine::{FileKind, StorageEngine};
use crate::errors::AppError;
use crate::stage::run_step;
use crate::utils::files::{
    compute_file_hash, decode_mariadb_filename, list_files, sync_file,
};
use crate::utils::quote_identifier;

const TABLE_INFO_QUERY: &str = "SELECT table_name, engine, table_type FROM information_schema.tables \
     WHERE table_schema = DATABASE() AND table_type != 'VIEW' ORDER BY table_name";

/// One physical backup of a set of databases living on the same server.
///
/// From `flush_tables` until `unlock_all_tables` every database holds a
/// `FOR EXPORT` read lock on its own session. Callers must run
/// [`BackupSession::teardown`] whatever the outcome, so a failed backup
/// never leaves tables locked.
pub struct BackupSession<C: Connector, T: SnapshotTransport> {
    site_backup_name: String,
    snapshot_request_key: String,
    databases: Vec<String>,
    db_base_directory: PathBuf,
    db_directories: HashMap<String, PathBuf>,
    credentials: DatabaseCredentials,
    schema_dump_tool: PathBuf,
    connections: ConnectionCache<C>,
    snapshot: SnapshotTrigger<T>,

    innodb_tables: HashMap<String, Vec<String>>,
    myisam_tables: HashMap<String, Vec<String>>,
    sequence_tables: HashMap<String, Vec<String>>,
    table_schemas: HashMap<String, String>,
    files_metadata: HashMap<String, BTreeMap<String, FileMetadata>>,
    locked: HashMap<String, bool>,
}

impl<C: Connector, T: SnapshotTransport> BackupSession<C, T> {
    pub fn new(config: &BackupConfig, connector: C, transport: T) -> Result<Self> {
        if config.databases.is_empty() {
            return Err(AppError::Config("At least one database is required".to_string()).into());
        }

        let databases = config.databases.clone();
        let empty_lists = || -> HashMap<String, Vec<String>> {
            databases.iter().map(|db| (db.clone(), Vec::new())).collect()
        };

        Ok(BackupSession {
            site_backup_name: config.site_backup_name.clone(),
            snapshot_request_key: config.snapshot_request_key.clone(),
            db_base_directory: config.db_base_directory.clone(),
            db_directories: databases
                .iter()
                .map(|db| (db.clone(), config.db_base_directory.join(db)))
                .collect(),
            credentials: config.credentials.clone(),
            schema_dump_tool: config.tools.schema_dump.clone(),
            connections: ConnectionCache::new(connector, config.session_wait_timeout),
            snapshot: SnapshotTrigger::new(
                transport,
                config.snapshot_trigger_url.clone(),
                RetryPolicy::snapshot_default(),
            ),
            innodb_tables: empty_lists(),
            myisam_tables: empty_lists(),
            sequence_tables: empty_lists(),
            table_schemas: HashMap::new(),
            files_metadata: databases.iter().map(|db| (db.clone(), BTreeMap::new())).collect(),
            locked: databases.iter().map(|db| (db.clone(), false)).collect(),
            databases,
        })
    }

    /// Runs the whole protocol and returns the restore manifest.
    pub async fn run(&mut self) -> Result<BackupManifest> {
        self.remove_backups_metadata();
        run_step("Fetch Database Tables Information", self.fetch_table_info()).await?;
        run_step("Flush Database Tables", self.flush_tables()).await?;
        run_step("Flush Changes to Disk", async { self.flush_changes_to_disk() }).await?;
        run_step("Validate Exportable Files", async { self.validate_exportable_files() }).await?;
        run_step("Export Table Schema", self.export_table_schemas()).await?;
        run_step("Collect Files Metadata", async { self.collect_files_metadata() }).await?;
        run_step("Store Backup Metadata", async { self.store_backup_metadata() }).await?;
        run_step("Create Database Snapshot", self.create_snapshot()).await?;
        run_step("Unlock Tables", self.unlock_all_tables()).await?;
        self.remove_backups_metadata();
        Ok(self.manifest())
    }

    pub fn manifest(&self) -> BackupManifest {
        let created_at = Utc::now();
        self.databases
            .iter()
            .map(|db| {
                (
                    db.clone(),
                    DatabaseManifest {
                        innodb_tables: self.innodb_tables[db].clone(),
                        myisam_tables: self.myisam_tables[db].clone(),
                        sequence_tables: self.sequence_tables[db].clone(),
                        table_schema: self.table_schemas.get(db).cloned().unwrap_or_default(),
                        files_metadata: self.files_metadata[db].clone(),
                        created_at: Some(created_at),
                    },
                )
            })
            .collect()
    }

    pub fn is_locked(&self, database: &str) -> bool {
        self.locked.get(database).copied().unwrap_or(false)
    }

    /// Best effort; a stale metadata file must not end up in the next snapshot.
    pub fn remove_backups_metadata(&self) {
        for db in &self.databases {
            let _ = fs::remove_file(metadata_path(&self.db_base_directory, db));
        }
    }

    pub async fn fetch_table_info(&mut self) -> Result<()> {
        for db in self.databases.clone() {
            let rows = self.db(&db).await?.query(TABLE_INFO_QUERY).await?;

            let mut innodb = Vec::new();
            let mut myisam = Vec::new();
            let mut sequences = Vec::new();
            for row in rows {
                let mut columns = row.into_iter();
                let table = columns
                    .next()
                    .flatten()
                    .with_context(|| format!("Catalog returned a table without a name in {}", db))?;
                let engine = columns.next().flatten().unwrap_or_default();
                let table_type = columns.next().flatten().unwrap_or_default();

                match StorageEngine::from_catalog(&engine) {
                    Some(StorageEngine::InnoDb) => innodb.push(table.clone()),
                    Some(StorageEngine::MyIsam) => myisam.push(table.clone()),
                    None => {}
                }
                // sequences can use any engine and need their own DDL on restore
                if table_type == "SEQUENCE" {
                    sequences.push(table);
                }
            }

            info!(
                database = %db,
                innodb = innodb.len(),
                myisam = myisam.len(),
                sequences = sequences.len(),
                "Classified tables"
            );
            self.innodb_tables.insert(db.clone(), innodb);
            self.myisam_tables.insert(db.clone(), myisam);
            self.sequence_tables.insert(db, sequences);
        }
        Ok(())
    }

    /// `FLUSH TABLES ... FOR EXPORT` read-locks the tables, flushes them, and
    /// blocks any ALTER/DROP until the session unlocks.
    pub async fn flush_tables(&mut self) -> Result<()> {
        for db in self.databases.clone() {
            let tables: Vec<String> = self.innodb_tables[&db]
                .iter()
                .chain(self.myisam_tables[&db].iter())
                .map(|table| quote_identifier(table))
                .collect();
            if tables.is_empty() {
                info!(database = %db, "No InnoDB or MyISAM tables to flush");
                continue;
            }

            self.kill_other_db_connections(&db).await?;
            let flush_query = format!("FLUSH TABLES {} FOR EXPORT;", tables.join(", "));
            self.db(&db).await?.execute(&flush_query).await?;
            self.locked.insert(db, true);
        }
        Ok(())
    }

    /// Export flushes update file metadata lazily; fsync every file so the
    /// snapshot sees what the server wrote.
    pub fn flush_changes_to_disk(&self) -> Result<()> {
        for db in &self.databases {
            for path in list_files(&self.db_directories[db])? {
                sync_file(&path)?;
            }
        }
        Ok(())
    }

    pub fn validate_exportable_files(&self) -> Result<()> {
        for db in &self.databases {
            let present: HashSet<String> = list_files(&self.db_directories[db])?
                .iter()
                .filter_map(|path| path.file_name())
                .map(|name| decode_mariadb_filename(&name.to_string_lossy()))
                .collect();

            let tables = [
                (StorageEngine::InnoDb, &self.innodb_tables[db]),
                (StorageEngine::MyIsam, &self.myisam_tables[db]),
            ];
            for (engine, tables) in tables {
                for table in tables {
                    for kind in engine.required_export_files() {
                        if !present.contains(&kind.file_name(table)) {
                            return Err(AppError::ExportFileNotFound(format!(
                                "{} file for {} table {} not found in {}",
                                kind.extension().to_uppercase(),
                                engine,
                                table,
                                db
                            ))
                            .into());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Must run while the export lock is held so the DDL matches the flushed files.
    pub async fn export_table_schemas(&mut self) -> Result<()> {
        for db in self.databases.clone() {
            self.kill_other_db_connections(&db).await?;
            let schema = export_table_schema(&self.schema_dump_tool, &self.credentials, &db)?;
            self.table_schemas.insert(db, schema);
        }
        Ok(())
    }

    pub fn collect_files_metadata(&mut self) -> Result<()> {
        for db in &self.databases {
            let mut metadata = BTreeMap::new();
            for path in list_files(&self.db_directories[db])? {
                let Some(kind) = FileKind::from_path(&path) else {
                    continue;
                };
                let size = fs::metadata(&path)
                    .with_context(|| format!("Failed to stat {}", path.display()))?
                    .len();
                let checksum = if kind.is_checksummed() {
                    Some(compute_file_hash(&path)?)
                } else {
                    None
                };
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                metadata.insert(file_name, FileMetadata { size, checksum });
            }
            self.files_metadata.insert(db.clone(), metadata);
        }
        Ok(())
    }

    pub fn store_backup_metadata(&self) -> Result<()> {
        let manifest = self.manifest();
        for db in &self.databases {
            store_database_manifest(&metadata_path(&self.db_base_directory, db), &manifest[db])?;
        }
        Ok(())
    }

    /// Blocks until the storage layer reports a durable snapshot.
    pub async fn create_snapshot(&self) -> Result<()> {
        let request = SnapshotRequest {
            name: self.site_backup_name.clone(),
            key: self.snapshot_request_key.clone(),
        };
        self.snapshot.create_snapshot(&request).await?;
        Ok(())
    }

    /// Safe to call any number of times.
    pub async fn unlock_all_tables(&mut self) -> Result<()> {
        for db in self.databases.clone() {
            self.unlock_tables(&db).await?;
        }
        Ok(())
    }

    async fn unlock_tables(&mut self, database: &str) -> Result<()> {
        self.db(database).await?.execute("UNLOCK TABLES;").await?;
        // a closed session would have released its locks on the server anyway
        self.locked.insert(database.to_string(), false);
        Ok(())
    }

    /// Releases whatever is still locked and closes every session. Never fails.
    pub async fn teardown(&mut self) {
        for db in self.databases.clone() {
            if !self.is_locked(&db) {
                continue;
            }
            if let Err(e) = self.unlock_tables(&db).await {
                warn!(database = %db, "Failed to unlock tables during teardown: {:#}", e);
            }
        }
        self.connections.close_all().await;
    }

    async fn db(&mut self, database: &str) -> Result<&mut C::Session> {
        if !self.databases.iter().any(|db| db == database) {
            anyhow::bail!("Database {} is not part of this backup", database);
        }
        self.connections.get(database, ConnectionRole::General).await
    }

    /// Clients coming through a proxy can still hold metadata locks that would
    /// stall the export flush; kill everything but our own session.
    async fn kill_other_db_connections(&mut self, database: &str) -> Result<()> {
        let own_id = {
            self.db(database).await?;
            self.connections
                .connection_id(database, ConnectionRole::General)
                .context("Connection id missing for an open session")?
        };
        let session = self.db(database).await?;
        let rows = session
            .query(&format!(
                "SELECT CAST(ID AS CHAR) FROM INFORMATION_SCHEMA.PROCESSLIST \
                 WHERE DB = DATABASE() AND USER != 'system user' AND ID NOT IN ({});",
                own_id
            ))
            .await?;

        for pid in rows.into_iter().filter_map(|row| row.into_iter().next().flatten()) {
            if let Err(e) = session.execute(&format!("KILL {};", pid)).await {
                warn!(database, pid = %pid, "Failed to kill connection: {:#}", e);
            }
        }
        Ok(())
    }
}

impl<C: Connector, T: SnapshotTransport> Drop for BackupSession<C, T> {
    fn drop(&mut self) {
        for (db, locked) in &self.locked {
            if *locked {
                warn!(database = %db, "Backup session dropped while tables are still locked; teardown was not run");
            }
        }
    }
}
