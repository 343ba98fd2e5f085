pub(crate) mod db_dump;
pub(crate) mod manifest;
pub(crate) mod session;
pub(crate) mod snapshot;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{AppConfig, OperationConfig};
use crate::connection::MySqlConnector;
use manifest::write_backup_manifest;
use session::BackupSession;
use snapshot::HttpSnapshotTransport;

/// Public entry point for the backup process.
pub async fn run_backup_flow(app_config: &AppConfig) -> Result<()> {
    let backup_config = match &app_config.operation {
        Some(OperationConfig::Backup(cfg)) => cfg,
        _ => anyhow::bail!("Backup operation selected but no backup configuration found."),
    };

    let connector = MySqlConnector::new(backup_config.credentials.clone());
    let transport = HttpSnapshotTransport::new()?;
    let mut session = BackupSession::new(backup_config, connector, transport)?;

    info!(
        databases = ?backup_config.databases,
        snapshot = %backup_config.site_backup_name,
        "Starting physical backup"
    );
    let result = session.run().await;
    session.teardown().await;
    let manifest = result?;

    if let Some(path) = &backup_config.manifest_output_path {
        write_backup_manifest(path, &manifest)
            .with_context(|| format!("Failed to write manifest to {}", path.display()))?;
        info!(path = %path.display(), "Backup manifest written");
    }
    Ok(())
}
