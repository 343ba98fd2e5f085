// physdbtool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::errors::AppError;

const DEFAULT_DB_HOST: &str = "localhost";
const DEFAULT_DB_PORT: u16 = 3306;
const DEFAULT_DB_USER: &str = "root";
const DEFAULT_DB_BASE_DIRECTORY: &str = "/var/lib/mysql";
// 4 hours, long enough to hold FOR EXPORT locks across a slow snapshot
const DEFAULT_SESSION_WAIT_TIMEOUT_SECS: u64 = 14400;
const DEFAULT_SERVICE_USER: &str = "mysql";
const DEFAULT_SCHEMA_DUMP_TOOL: &str = "mariadb-dump";
const DEFAULT_MYISAMCHK_TOOL: &str = "myisamchk";
const PASSWORD_ENV_VAR: &str = "MARIADB_ROOT_PASSWORD";

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FileOwner {
    pub user: String,
    pub group: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonToolPaths {
    pub schema_dump: Option<PathBuf>,
    pub myisamchk: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub db_host: Option<String>,
    pub db_port: Option<u16>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub db_base_directory: Option<PathBuf>,
    pub session_wait_timeout_secs: Option<u64>,

    // backup
    pub databases: Option<Vec<String>>,
    pub site_backup_name: Option<String>,
    pub snapshot_trigger_url: Option<String>,
    pub snapshot_request_key: Option<String>,
    pub manifest_output_path: Option<PathBuf>,

    // restore
    pub backup_database: Option<String>,
    pub target_database: Option<String>,
    pub backup_db_base_directory: Option<PathBuf>,
    #[serde(default)]
    pub restore_specific_tables: bool,
    pub tables_to_restore: Option<Vec<String>>,
    /// Absent means `mysql:mysql`; an explicit `null` leaves ownership alone.
    #[serde(default = "default_file_owner")]
    pub file_owner: Option<FileOwner>,

    #[serde(default)]
    pub tools: JsonToolPaths,
}

fn default_file_owner() -> Option<FileOwner> {
    Some(FileOwner {
        user: DEFAULT_SERVICE_USER.to_string(),
        group: DEFAULT_SERVICE_USER.to_string(),
    })
}

// Application's internal configuration structs
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseCredentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub schema_dump: PathBuf,
    pub myisamchk: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            schema_dump: PathBuf::from(DEFAULT_SCHEMA_DUMP_TOOL),
            myisamchk: PathBuf::from(DEFAULT_MYISAMCHK_TOOL),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub credentials: DatabaseCredentials,
    pub databases: Vec<String>,
    pub db_base_directory: PathBuf,
    pub site_backup_name: String,
    pub snapshot_trigger_url: String,
    pub snapshot_request_key: String,
    pub session_wait_timeout: Duration,
    pub manifest_output_path: Option<PathBuf>,
    pub tools: ToolPaths,
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub credentials: DatabaseCredentials,
    pub backup_database: String,
    pub target_database: String,
    pub backup_db_base_directory: PathBuf,
    pub target_db_base_directory: PathBuf,
    pub tables_to_restore: Option<Vec<String>>,
    pub file_owner: Option<FileOwner>,
    pub session_wait_timeout: Duration,
    pub tools: ToolPaths,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub operation: Option<OperationConfig>,
    pub raw_json_config: RawJsonConfig,
}

#[derive(Debug, Clone)]
pub enum OperationConfig {
    Backup(BackupConfig),
    Restore(RestoreConfig),
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        Ok(AppConfig {
            operation: None, // To be filled by main after parsing CLI args
            raw_json_config,
        })
    }
}

fn load_credentials(raw_config: &RawJsonConfig) -> Result<DatabaseCredentials> {
    let password = match raw_config.db_password.as_ref().filter(|p| !p.is_empty()) {
        Some(password) => password.clone(),
        None => env::var(PASSWORD_ENV_VAR).with_context(|| {
            format!(
                "db_password must be set in config.json or {} in the environment",
                PASSWORD_ENV_VAR
            )
        })?,
    };

    Ok(DatabaseCredentials {
        host: raw_config
            .db_host
            .clone()
            .unwrap_or_else(|| DEFAULT_DB_HOST.to_string()),
        port: raw_config.db_port.unwrap_or(DEFAULT_DB_PORT),
        user: raw_config
            .db_user
            .clone()
            .unwrap_or_else(|| DEFAULT_DB_USER.to_string()),
        password,
    })
}

fn load_tool_paths(raw_config: &RawJsonConfig) -> ToolPaths {
    let defaults = ToolPaths::default();
    ToolPaths {
        schema_dump: raw_config
            .tools
            .schema_dump
            .clone()
            .unwrap_or(defaults.schema_dump),
        myisamchk: raw_config
            .tools
            .myisamchk
            .clone()
            .unwrap_or(defaults.myisamchk),
    }
}

fn session_wait_timeout(raw_config: &RawJsonConfig) -> Duration {
    Duration::from_secs(
        raw_config
            .session_wait_timeout_secs
            .unwrap_or(DEFAULT_SESSION_WAIT_TIMEOUT_SECS),
    )
}

fn required_string(value: &Option<String>, key: &str, operation: &str) -> Result<String> {
    let value = value
        .as_ref()
        .with_context(|| format!("{} must be set in config.json for {}", key, operation))?;
    if value.trim().is_empty() {
        return Err(AppError::Config(format!("{} cannot be empty in config.json.", key)).into());
    }
    Ok(value.clone())
}

pub fn load_backup_config_from_json(raw_config: &RawJsonConfig) -> Result<BackupConfig> {
    let databases = parse_database_list(&raw_config.databases)?;
    let site_backup_name = required_string(&raw_config.site_backup_name, "site_backup_name", "backup")?;
    let snapshot_trigger_url =
        required_string(&raw_config.snapshot_trigger_url, "snapshot_trigger_url", "backup")?;
    Url::parse(&snapshot_trigger_url)
        .with_context(|| format!("Invalid snapshot_trigger_url: {}", snapshot_trigger_url))?;
    let snapshot_request_key =
        required_string(&raw_config.snapshot_request_key, "snapshot_request_key", "backup")?;

    Ok(BackupConfig {
        credentials: load_credentials(raw_config)?,
        databases,
        db_base_directory: raw_config
            .db_base_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_BASE_DIRECTORY)),
        site_backup_name,
        snapshot_trigger_url,
        snapshot_request_key,
        session_wait_timeout: session_wait_timeout(raw_config),
        manifest_output_path: raw_config.manifest_output_path.clone(),
        tools: load_tool_paths(raw_config),
    })
}

pub fn load_restore_config_from_json(raw_config: &RawJsonConfig) -> Result<RestoreConfig> {
    let backup_database = required_string(&raw_config.backup_database, "backup_database", "restore")?;
    let target_database = required_string(&raw_config.target_database, "target_database", "restore")?;
    let backup_db_base_directory = raw_config
        .backup_db_base_directory
        .clone()
        .context("backup_db_base_directory must be set in config.json for restore")?;

    if backup_db_base_directory.to_string_lossy().is_empty() {
        return Err(AppError::Config(
            "backup_db_base_directory cannot be empty in config.json.".to_string(),
        )
        .into());
    }

    let tables_to_restore = if raw_config.restore_specific_tables {
        let tables = raw_config.tables_to_restore.clone().unwrap_or_default();
        if tables.is_empty() {
            return Err(AppError::Config(
                "restore_specific_tables is set but tables_to_restore is empty.".to_string(),
            )
            .into());
        }
        Some(tables)
    } else {
        None
    };

    Ok(RestoreConfig {
        credentials: load_credentials(raw_config)?,
        backup_database,
        target_database,
        backup_db_base_directory,
        target_db_base_directory: raw_config
            .db_base_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_BASE_DIRECTORY)),
        tables_to_restore,
        file_owner: raw_config.file_owner.clone(),
        session_wait_timeout: session_wait_timeout(raw_config),
        tools: load_tool_paths(raw_config),
    })
}

/// Parses the `databases` list for a backup.
/// Names are trimmed, must be non-empty, and duplicates keep their first position.
fn parse_database_list(databases: &Option<Vec<String>>) -> Result<Vec<String>> {
    let databases = databases
        .as_ref()
        .context("databases must be set in config.json for backup")?;

    let mut parsed: Vec<String> = Vec::with_capacity(databases.len());
    for name in databases {
        let name = name.trim();
        if name.is_empty() || name.contains(|c: char| c == '/' || c == '`' || c.is_whitespace()) {
            return Err(AppError::Config(format!(
                "Invalid database name in databases list: {:?}",
                name
            ))
            .into());
        }
        if !parsed.iter().any(|existing| existing == name) {
            parsed.push(name.to_string());
        }
    }

    if parsed.is_empty() {
        return Err(AppError::Config("At least one database is required".to_string()).into());
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).expect("valid raw config")
    }

    #[test]
    fn test_parse_database_list_keeps_order_and_dedups() -> anyhow::Result<()> {
        let result = parse_database_list(&Some(vec![
            "app_db".to_string(),
            " analytics ".to_string(),
            "app_db".to_string(),
        ]))?;
        assert_eq!(result, vec!["app_db".to_string(), "analytics".to_string()]);
        Ok(())
    }

    #[test]
    fn test_parse_database_list_rejects_empty() {
        assert!(parse_database_list(&Some(vec![])).is_err());
        assert!(parse_database_list(&None).is_err());
        assert!(parse_database_list(&Some(vec!["  ".to_string()])).is_err());
        assert!(parse_database_list(&Some(vec!["a/b".to_string()])).is_err());
    }

    #[test]
    fn test_backup_config_from_json() -> anyhow::Result<()> {
        let config = raw(json!({
            "db_password": "secret",
            "databases": ["app_db"],
            "site_backup_name": "backup-0001",
            "snapshot_trigger_url": "https://press.example.com/api/snapshot",
            "snapshot_request_key": "k3y"
        }));
        let backup = load_backup_config_from_json(&config)?;

        assert_eq!(backup.databases, vec!["app_db".to_string()]);
        assert_eq!(backup.credentials.host, "localhost");
        assert_eq!(backup.credentials.port, 3306);
        assert_eq!(backup.credentials.user, "root");
        assert_eq!(backup.db_base_directory, PathBuf::from("/var/lib/mysql"));
        assert_eq!(backup.session_wait_timeout, Duration::from_secs(14400));
        assert_eq!(backup.tools.schema_dump, PathBuf::from("mariadb-dump"));
        Ok(())
    }

    #[test]
    fn test_backup_config_rejects_bad_snapshot_url() {
        let config = raw(json!({
            "db_password": "secret",
            "databases": ["app_db"],
            "site_backup_name": "backup-0001",
            "snapshot_trigger_url": "not a url",
            "snapshot_request_key": "k3y"
        }));
        assert!(load_backup_config_from_json(&config).is_err());
    }

    #[test]
    fn test_restore_config_file_owner_defaults_and_null() -> anyhow::Result<()> {
        let base = json!({
            "db_password": "secret",
            "backup_database": "app_db",
            "target_database": "app_db_restored",
            "backup_db_base_directory": "/mnt/snap/var/lib/mysql"
        });
        let restore = load_restore_config_from_json(&raw(base.clone()))?;
        assert_eq!(
            restore.file_owner,
            Some(FileOwner { user: "mysql".to_string(), group: "mysql".to_string() })
        );
        assert_eq!(restore.tables_to_restore, None);

        let mut without_owner = base;
        without_owner["file_owner"] = serde_json::Value::Null;
        let restore = load_restore_config_from_json(&raw(without_owner))?;
        assert_eq!(restore.file_owner, None);
        Ok(())
    }

    #[test]
    fn test_restore_specific_tables_requires_list() -> anyhow::Result<()> {
        let mut config = json!({
            "db_password": "secret",
            "backup_database": "app_db",
            "target_database": "app_db",
            "backup_db_base_directory": "/mnt/snap",
            "restore_specific_tables": true
        });
        assert!(load_restore_config_from_json(&raw(config.clone())).is_err());

        config["tables_to_restore"] = json!(["tabDoc"]);
        let restore = load_restore_config_from_json(&raw(config))?;
        assert_eq!(restore.tables_to_restore, Some(vec!["tabDoc".to_string()]));
        Ok(())
    }
}
