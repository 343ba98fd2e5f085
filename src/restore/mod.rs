pub(crate) mod db_restore;
pub(crate) mod myisam_check;
pub(crate) mod session;
pub(crate) mod verification;

use anyhow::Result;

use crate::config::{AppConfig, OperationConfig};
use crate::connection::MySqlConnector;
use crate::stage::run_step;
use session::RestoreSession;

/// Public entry point for the restore process.
pub async fn run_restore_flow(app_config: &AppConfig) -> Result<()> {
    let restore_config = match &app_config.operation {
        Some(OperationConfig::Restore(cfg)) => cfg,
        _ => anyhow::bail!("Restore operation selected but no restore configuration found."),
    };

    let connector = MySqlConnector::new(restore_config.credentials.clone());
    let mut session = run_step("Load Backup Metadata", async {
        RestoreSession::from_backup_metadata(restore_config, connector)
    })
    .await?;

    let result = session.run().await;
    session.teardown().await;
    result
}
