// physdbtool/src/restore/verification.rs
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};

use crate::backup::manifest::FileMetadata;
use crate::connection::Row;
use crate::errors::AppError;
use crate::utils::files::compute_file_hash;

/// InnoDB tables of the current database carrying a FULLTEXT index.
pub const FULLTEXT_TABLES_QUERY: &str = "SELECT DISTINCT(t.TABLE_NAME) \
     FROM information_schema.STATISTICS s \
     JOIN information_schema.TABLES t \
       ON s.TABLE_SCHEMA = t.TABLE_SCHEMA AND s.TABLE_NAME = t.TABLE_NAME \
     WHERE s.INDEX_TYPE = 'FULLTEXT' AND t.TABLE_SCHEMA = DATABASE() AND t.ENGINE = 'InnoDB';";

/// Compares the files in `backup_directory` against the sizes and checksums
/// recorded at backup time.
///
/// Only entries accepted by `is_restorable` are checked. Every mismatch is
/// collected before failing so one run reports all the bad files.
pub fn validate_backup_files<F>(
    backup_directory: &Path,
    files_metadata: &BTreeMap<String, FileMetadata>,
    is_restorable: F,
) -> Result<usize>
where
    F: Fn(&str) -> bool,
{
    let mut report = String::new();
    let mut invalid_files = Vec::new();
    let mut checked = 0;

    for (file_name, expected) in files_metadata {
        if !is_restorable(file_name) {
            continue;
        }
        checked += 1;
        let path = backup_directory.join(file_name);

        let size = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                report.push_str(&format!("[INVALID] [MISSING] {}\n", file_name));
                invalid_files.push(file_name.as_str());
                continue;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read metadata of backup file {}", path.display())
                });
            }
        };
        if size != expected.size {
            report.push_str(&format!("[INVALID] [FILE SIZE] {} - {} bytes\n", file_name, size));
            invalid_files.push(file_name.as_str());
            continue;
        }

        if let Some(expected_checksum) = &expected.checksum {
            let checksum = compute_file_hash(&path)?;
            if &checksum != expected_checksum {
                report.push_str(&format!("[INVALID] [CHECKSUM] {} - {}\n", file_name, checksum));
                invalid_files.push(file_name.as_str());
                continue;
            }
        }
        debug!(file = %file_name, size, "Backup file verified");
    }

    if !invalid_files.is_empty() {
        warn!(count = invalid_files.len(), "Backup files failed validation");
        report.push_str("Invalid Files:\n");
        for file_name in &invalid_files {
            report.push_str(file_name);
            report.push('\n');
        }
        return Err(AppError::InvalidBackupFiles(report).into());
    }
    Ok(checked)
}

/// True when any `CHECK TABLE`/`REPAIR TABLE`/`OPTIMIZE TABLE` result row has
/// `Msg_type = error`.
pub fn has_error_rows(rows: &[Row]) -> bool {
    rows.iter()
        .any(|row| row.get(2).and_then(|msg_type| msg_type.as_deref()) == Some("error"))
}
