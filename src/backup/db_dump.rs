// physdbtool/src/backup/db_dump.rs
use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;
use tracing::debug;

use crate::config::DatabaseCredentials;
use crate::errors::AppError;
use crate::utils::resolve_tool;

/// Dumps the structure of `database` without any row data.
///
/// The password goes through `MYSQL_PWD` so it never shows up in the process list.
pub fn export_table_schema(
    schema_dump_tool: &Path,
    credentials: &DatabaseCredentials,
    database: &str,
) -> Result<String> {
    let dump_path = resolve_tool(schema_dump_tool)?;
    debug!(database, tool = %dump_path.display(), "Exporting table schema");

    let output = Command::new(&dump_path)
        .env("MYSQL_PWD", &credentials.password)
        .arg("-h")
        .arg(&credentials.host)
        .arg("-P")
        .arg(credentials.port.to_string())
        .arg("-u")
        .arg(&credentials.user)
        .arg("--no-data")
        .arg(database)
        .output()
        .with_context(|| format!("Failed to execute {} for database {}", dump_path.display(), database))?;

    if !output.status.success() {
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr.trim().is_empty() {
            stderr = format!("exited with {}", output.status);
        }
        return Err(AppError::SchemaExport {
            database: database.to_string(),
            stderr,
        }
        .into());
    }

    String::from_utf8(output.stdout)
        .with_context(|| format!("Schema dump of {} is not valid UTF-8", database))
}
