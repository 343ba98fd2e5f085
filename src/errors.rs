use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A file required to transport a table out of the server is missing.
    #[error("Export file not found: {0}")]
    ExportFileNotFound(String),

    #[error("Schema export failed for database {database}: {stderr}")]
    SchemaExport { database: String, stderr: String },

    /// A cached connection went away. Any lock it held is lost.
    #[error("Database connection closed with database {0}")]
    ConnectionClosed(String),

    #[error("Snapshot trigger failed after {attempts} attempt(s): {reason}")]
    SnapshotTrigger { attempts: u32, reason: String },

    #[error("MyISAM index {file} is corrupt and could not be repaired: {output}")]
    IndexCorruptionUnrecoverable { file: String, output: String },

    #[error("Backup file validation failed:\n{0}")]
    InvalidBackupFiles(String),

    #[error("Failed to repair table {0}")]
    TableRepairFailed(String),

    #[error("Command execution failed: {stderr}{stdout}")]
    Command { stdout: String, stderr: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_carries_both_streams() {
        let error = AppError::Command {
            stdout: "changed ownership of 'tabDoc.ibd'".to_string(),
            stderr: "chown: invalid group: 'mysql:mysql'\n".to_string(),
        };
        let message = error.to_string();
        assert!(message.contains("invalid group"));
        assert!(message.contains("changed ownership"));
    }
}
