// physdbtool/src/restore/session.rs
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::db_restore::{
    discard_tablespace_statement, drop_statement, extract_create_statement,
    import_tablespace_statement, lock_tables_statement, sanitize_schema_dump, split_statements,
};
use super::myisam_check::{IndexCheck, check_and_repair_index};
use super::verification::{FULLTEXT_TABLES_QUERY, has_error_rows, validate_backup_files};
use crate::backup::manifest::{DatabaseManifest, FileMetadata, load_database_manifest, metadata_path};
use crate::config::{FileOwner, RestoreConfig};
use crate::connection::{ConnectionCache, ConnectionRole, Connector, SqlSession};
use crate::engine::{FileKind, StorageEngine};
use crate::errors::AppError;
use crate::stage::run_step;
use crate::utils::files::{copy_table_file, list_files, table_name_from_path, warmup_files};
use crate::utils::quote_identifier;

const TARGET_TABLES_QUERY: &str = "SELECT table_name, table_type FROM information_schema.tables \
     WHERE table_schema = DATABASE() AND table_type != 'VIEW' ORDER BY table_name";
const DISABLE_FOREIGN_KEY_CHECKS: &str = "SET SESSION FOREIGN_KEY_CHECKS = 0;";
const ENABLE_FOREIGN_KEY_CHECKS: &str = "SET SESSION FOREIGN_KEY_CHECKS = 1;";

/// Restores one backed-up database onto a live target database.
///
/// There is no rollback. Every stage is ordered so that a failure before
/// "Prepare Database for Restoration" leaves the target untouched, and the
/// tablespace of each InnoDB table is discarded before its file is replaced.
pub struct RestoreSession<C: Connector> {
    backup_database: String,
    target_database: String,
    backup_directory: PathBuf,
    target_directory: PathBuf,
    file_owner: Option<FileOwner>,
    myisamchk_tool: PathBuf,
    connections: ConnectionCache<C>,

    innodb_tables: Vec<String>,
    myisam_tables: Vec<String>,
    sequence_tables: Vec<String>,
    table_schema: String,
    files_metadata: BTreeMap<String, FileMetadata>,
    /// `None` restores the whole database.
    tables_to_restore: Option<Vec<String>>,
}

impl<C: Connector> RestoreSession<C> {
    pub fn new(config: &RestoreConfig, manifest: DatabaseManifest, connector: C) -> Self {
        let DatabaseManifest {
            mut innodb_tables,
            mut myisam_tables,
            sequence_tables,
            table_schema,
            files_metadata,
            ..
        } = manifest;

        let tables_to_restore = config.tables_to_restore.as_ref().map(|requested| {
            let mut restorable = Vec::new();
            for table in requested {
                if innodb_tables.contains(table) || myisam_tables.contains(table) {
                    restorable.push(table.clone());
                } else {
                    warn!(table = %table, "Requested table is not part of the backup, skipping");
                }
            }
            restorable
        });
        if let Some(tables) = &tables_to_restore {
            innodb_tables.retain(|table| tables.contains(table));
            myisam_tables.retain(|table| tables.contains(table));
        }

        RestoreSession {
            backup_database: config.backup_database.clone(),
            target_database: config.target_database.clone(),
            backup_directory: config.backup_db_base_directory.join(&config.backup_database),
            target_directory: config.target_db_base_directory.join(&config.target_database),
            file_owner: config.file_owner.clone(),
            myisamchk_tool: config.tools.myisamchk.clone(),
            connections: ConnectionCache::new(connector, config.session_wait_timeout),
            innodb_tables,
            myisam_tables,
            sequence_tables,
            table_schema,
            files_metadata,
            tables_to_restore,
        }
    }

    /// Reads the manifest that travelled inside the snapshot.
    pub fn from_backup_metadata(config: &RestoreConfig, connector: C) -> Result<Self> {
        let path = metadata_path(&config.backup_db_base_directory, &config.backup_database);
        let manifest = load_database_manifest(&path)?;
        Ok(Self::new(config, manifest, connector))
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(
            backup = %self.backup_database,
            target = %self.target_database,
            innodb = self.innodb_tables.len(),
            myisam = self.myisam_tables.len(),
            specific_tables = self.tables_to_restore.is_some(),
            "Starting physical restore"
        );
        run_step("Validate Backup Files", async { self.validate_backup_files() }).await?;
        run_step("Validate Connection to Target Database", self.validate_connection()).await?;
        run_step("Warmup MyISAM Files", async { self.warmup(StorageEngine::MyIsam) }).await?;
        run_step("Check and Fix MyISAM Table Files", async { self.check_and_fix_myisam_files() })
            .await?;
        run_step("Warmup InnoDB Files", async { self.warmup(StorageEngine::InnoDb) }).await?;
        run_step("Prepare Database for Restoration", self.prepare_target_db()).await?;
        run_step("Create Tables from Table Schema", self.create_tables()).await?;
        run_step("Discard InnoDB Tablespaces", self.discard_tablespaces()).await?;
        run_step("Copying InnoDB Table Files", self.copy_table_files(StorageEngine::InnoDb)).await?;
        run_step("Import InnoDB Tablespaces", self.import_tablespaces()).await?;
        run_step("Hold Write Lock on MyISAM Tables", self.lock_myisam_tables()).await?;
        run_step("Copying MyISAM Table Files", self.copy_table_files(StorageEngine::MyIsam)).await?;
        run_step("Unlock All Tables", self.unlock_all_tables()).await?;
        run_step("Validate And Fix Tables", self.validate_and_fix_tables()).await?;
        Ok(())
    }

    pub async fn teardown(&mut self) {
        self.connections.close_all().await;
    }

    fn tables(&self, engine: StorageEngine) -> &[String] {
        match engine {
            StorageEngine::InnoDb => &self.innodb_tables,
            StorageEngine::MyIsam => &self.myisam_tables,
        }
    }

    fn is_sequence(&self, table: &str) -> bool {
        self.sequence_tables.iter().any(|sequence| sequence == table)
    }

    fn is_restorable_file(&self, file_name: &str) -> bool {
        let path = Path::new(file_name);
        if FileKind::from_path(path).is_none() {
            return false;
        }
        let table = table_name_from_path(path);
        self.innodb_tables.contains(&table) || self.myisam_tables.contains(&table)
    }

    /// Backup files of `kinds` belonging to the tables of `engine` being restored.
    fn restorable_files(&self, engine: StorageEngine, kinds: &[FileKind]) -> Result<Vec<PathBuf>> {
        let tables = self.tables(engine);
        Ok(list_files(&self.backup_directory)?
            .into_iter()
            .filter(|path| {
                FileKind::from_path(path).is_some_and(|kind| kinds.contains(&kind))
                    && tables.contains(&table_name_from_path(path))
            })
            .collect())
    }

    pub fn validate_backup_files(&self) -> Result<()> {
        let checked = validate_backup_files(&self.backup_directory, &self.files_metadata, |name| {
            self.is_restorable_file(name)
        })?;
        info!(files = checked, "Backup files match their recorded metadata");
        Ok(())
    }

    pub async fn validate_connection(&mut self) -> Result<()> {
        self.connections
            .get(&self.target_database, ConnectionRole::General)
            .await?
            .execute("SELECT 1;")
            .await
    }

    /// Pulls the bulk files of `engine` off a lazily hydrated volume.
    pub fn warmup(&self, engine: StorageEngine) -> Result<()> {
        let files = self.restorable_files(engine, engine.warmup_files())?;
        let bytes = warmup_files(&files)?;
        info!(engine = %engine, files = files.len(), bytes, "Warmed up table files");
        Ok(())
    }

    /// Runs before anything touches the target, so a corrupt index aborts cleanly.
    pub fn check_and_fix_myisam_files(&self) -> Result<()> {
        for index_file in self.restorable_files(StorageEngine::MyIsam, &[FileKind::MyIsamIndex])? {
            if check_and_repair_index(&self.myisamchk_tool, &index_file)? == IndexCheck::Repaired {
                warn!(file = %index_file.display(), "MyISAM index was repaired before restore");
            }
        }
        Ok(())
    }

    /// Empties the target database. Skipped when restoring specific tables.
    pub async fn prepare_target_db(&mut self) -> Result<()> {
        if self.tables_to_restore.is_some() {
            return Ok(());
        }
        let session = self
            .connections
            .get(&self.target_database, ConnectionRole::General)
            .await?;
        let existing = session.query(TARGET_TABLES_QUERY).await?;

        session.execute(DISABLE_FOREIGN_KEY_CHECKS).await?;
        for row in existing {
            let mut columns = row.into_iter();
            let Some(table) = columns.next().flatten() else {
                continue;
            };
            let is_sequence = columns.next().flatten().as_deref() == Some("SEQUENCE");
            session.execute(&drop_statement(&table, is_sequence)).await?;
        }
        session.execute(ENABLE_FOREIGN_KEY_CHECKS).await
    }

    pub async fn create_tables(&mut self) -> Result<()> {
        let statements: Vec<String> = match &self.tables_to_restore {
            Some(tables) => {
                let mut statements = Vec::with_capacity(tables.len() * 2);
                for table in tables {
                    let is_sequence = self.is_sequence(table);
                    statements.push(drop_statement(table, is_sequence));
                    statements.push(extract_create_statement(&self.table_schema, table, is_sequence)?);
                }
                statements
            }
            None => split_statements(&sanitize_schema_dump(&self.table_schema))
                .into_iter()
                .map(str::to_string)
                .collect(),
        };

        let session = self
            .connections
            .get(&self.target_database, ConnectionRole::General)
            .await?;
        session.execute(DISABLE_FOREIGN_KEY_CHECKS).await?;
        for statement in &statements {
            session.execute(statement).await?;
        }
        session.execute(ENABLE_FOREIGN_KEY_CHECKS).await?;
        info!(statements = statements.len(), "Table definitions recreated");
        Ok(())
    }

    /// Must finish before any `.ibd` lands in the target directory.
    pub async fn discard_tablespaces(&mut self) -> Result<()> {
        let session = self
            .connections
            .get(&self.target_database, ConnectionRole::General)
            .await?;
        // foreign keys between InnoDB tables would otherwise block the discard
        session.execute(DISABLE_FOREIGN_KEY_CHECKS).await?;
        for table in &self.innodb_tables {
            session.execute(&discard_tablespace_statement(table)).await?;
        }
        session.execute(ENABLE_FOREIGN_KEY_CHECKS).await
    }

    pub async fn copy_table_files(&self, engine: StorageEngine) -> Result<()> {
        let files = self.restorable_files(engine, engine.transported_files())?;
        for file in &files {
            copy_table_file(file, &self.target_directory, self.file_owner.as_ref()).await?;
        }
        info!(engine = %engine, files = files.len(), target = %self.target_directory.display(), "Copied table files");
        Ok(())
    }

    pub async fn import_tablespaces(&mut self) -> Result<()> {
        let session = self
            .connections
            .get(&self.target_database, ConnectionRole::General)
            .await?;
        for table in &self.innodb_tables {
            session.execute(&import_tablespace_statement(table)).await?;
        }
        Ok(())
    }

    /// MyISAM has no tablespace to discard; a write lock on a dedicated
    /// session keeps readers away while its files are swapped.
    pub async fn lock_myisam_tables(&mut self) -> Result<()> {
        let Some(statement) = lock_tables_statement(&self.myisam_tables) else {
            return Ok(());
        };
        self.connections
            .get(&self.target_database, ConnectionRole::LockScoped)
            .await?
            .execute(&statement)
            .await
    }

    pub async fn unlock_all_tables(&mut self) -> Result<()> {
        self.connections
            .get(&self.target_database, ConnectionRole::General)
            .await?
            .execute("UNLOCK TABLES;")
            .await?;
        if self
            .connections
            .is_open(&self.target_database, ConnectionRole::LockScoped)
        {
            self.connections
                .get(&self.target_database, ConnectionRole::LockScoped)
                .await?
                .execute("UNLOCK TABLES;")
                .await?;
        }
        Ok(())
    }

    /// FULLTEXT indexes do not travel with a tablespace, and a MyISAM table
    /// whose files were swapped under a live server can carry stale row counts.
    pub async fn validate_and_fix_tables(&mut self) -> Result<()> {
        let session = self
            .connections
            .get(&self.target_database, ConnectionRole::General)
            .await?;

        let fulltext_tables: Vec<String> = session
            .query(FULLTEXT_TABLES_QUERY)
            .await?
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .filter(|table| self.innodb_tables.contains(table))
            .collect();
        for table in &fulltext_tables {
            info!(table = %table, "Rebuilding FULLTEXT index");
            let result = session
                .query(&StorageEngine::InnoDb.repair_statement(table))
                .await?;
            if has_error_rows(&result) {
                return Err(AppError::TableRepairFailed(table.clone()).into());
            }
        }

        for table in &self.myisam_tables {
            let check = session
                .query(&format!("CHECK TABLE {} QUICK;", quote_identifier(table)))
                .await?;
            if !has_error_rows(&check) {
                continue;
            }
            warn!(table = %table, "MyISAM table is corrupted after restore, repairing");
            let result = session
                .query(&StorageEngine::MyIsam.repair_statement(table))
                .await?;
            if has_error_rows(&result) {
                return Err(AppError::TableRepairFailed(table.clone()).into());
            }
        }
        Ok(())
    }
}
