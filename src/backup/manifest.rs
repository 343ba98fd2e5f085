// physdbtool/src/backup/manifest.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::utils::files::sync_file;

pub const BACKUP_METADATA_FILE: &str = "physical_backup_meta.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,
    pub checksum: Option<String>,
}

/// Everything a restore needs to know about one backed-up database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseManifest {
    #[serde(rename = "innodbTables", alias = "innodb_tables")]
    pub innodb_tables: Vec<String>,
    #[serde(rename = "myisamTables", alias = "myisam_tables")]
    pub myisam_tables: Vec<String>,
    #[serde(rename = "sequenceTables", alias = "sequence_tables", default)]
    pub sequence_tables: Vec<String>,
    #[serde(rename = "schemaDDL", alias = "table_schema")]
    pub table_schema: String,
    #[serde(rename = "fileMetadata", alias = "files_metadata")]
    pub files_metadata: BTreeMap<String, FileMetadata>,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

pub type BackupManifest = BTreeMap<String, DatabaseManifest>;

pub fn metadata_path(db_base_directory: &Path, database: &str) -> PathBuf {
    db_base_directory.join(database).join(BACKUP_METADATA_FILE)
}

/// Writes the manifest next to the table files so it travels inside the snapshot.
pub fn store_database_manifest(path: &Path, manifest: &DatabaseManifest) -> Result<()> {
    let content = serde_json::to_vec(manifest).context("Failed to serialize backup metadata")?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write backup metadata: {}", path.display()))?;
    // readable by whichever account mounts the snapshot later
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    sync_file(path)
}

pub fn load_database_manifest(path: &Path) -> Result<DatabaseManifest> {
    if !path.exists() {
        anyhow::bail!("Backup metadata not found: {}", path.display());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read backup metadata: {}", path.display()))?;
    if content.trim().is_empty() {
        anyhow::bail!("Backup metadata is empty: {}", path.display());
    }
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse backup metadata: {}", path.display()))
}

pub fn write_backup_manifest(path: &Path, manifest: &BackupManifest) -> Result<()> {
    let content =
        serde_json::to_string_pretty(manifest).context("Failed to serialize backup manifest")?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write backup manifest: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_manifest_wire_format() -> anyhow::Result<()> {
        let mut files_metadata = BTreeMap::new();
        files_metadata.insert(
            "tabDoc.ibd".to_string(),
            FileMetadata { size: 98304, checksum: None },
        );
        let manifest = DatabaseManifest {
            innodb_tables: vec!["tabDoc".to_string()],
            table_schema: "CREATE TABLE `tabDoc` (...);\n".to_string(),
            files_metadata,
            ..Default::default()
        };

        let value = serde_json::to_value(&manifest)?;
        assert_eq!(value["innodbTables"], json!(["tabDoc"]));
        assert_eq!(value["myisamTables"], json!([]));
        assert_eq!(value["schemaDDL"], json!("CREATE TABLE `tabDoc` (...);\n"));
        assert_eq!(value["fileMetadata"]["tabDoc.ibd"], json!({"size": 98304, "checksum": null}));
        Ok(())
    }

    #[test]
    fn test_reads_snake_case_metadata() -> anyhow::Result<()> {
        let manifest: DatabaseManifest = serde_json::from_value(json!({
            "innodb_tables": ["tabDoc"],
            "myisam_tables": ["tabLog"],
            "table_schema": "",
            "files_metadata": {"tabLog.MYI": {"size": 1024, "checksum": "abc"}}
        }))?;
        assert_eq!(manifest.myisam_tables, vec!["tabLog".to_string()]);
        assert!(manifest.sequence_tables.is_empty());
        assert_eq!(manifest.files_metadata["tabLog.MYI"].checksum.as_deref(), Some("abc"));
        Ok(())
    }

    #[test]
    fn test_store_then_load_metadata_file() -> anyhow::Result<()> {
        let base = tempfile::tempdir()?;
        fs::create_dir(base.path().join("app_db"))?;
        let path = metadata_path(base.path(), "app_db");
        let manifest = DatabaseManifest {
            myisam_tables: vec!["tabLog".to_string()],
            created_at: Some(Utc::now()),
            ..Default::default()
        };

        store_database_manifest(&path, &manifest)?;
        assert_eq!(load_database_manifest(&path)?, manifest);
        assert!(load_database_manifest(&base.path().join("missing.json")).is_err());
        Ok(())
    }
}
