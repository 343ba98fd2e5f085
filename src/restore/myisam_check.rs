// physdbtool/src/restore/myisam_check.rs
use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Command, Output};
use tracing::{info, warn};

use crate::errors::AppError;
use crate::utils::resolve_tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCheck {
    Healthy,
    Repaired,
}

/// Runs `myisamchk` on one `.MYI` file and tries `--recover` if the check fails.
pub fn check_and_repair_index(myisamchk_tool: &Path, index_file: &Path) -> Result<IndexCheck> {
    let myisamchk = resolve_tool(myisamchk_tool)?;

    let check = run(&myisamchk, &[], index_file)?;
    if check.status.success() {
        return Ok(IndexCheck::Healthy);
    }
    warn!(
        file = %index_file.display(),
        "myisamchk reported problems, trying --recover: {}",
        String::from_utf8_lossy(&check.stdout).trim()
    );

    let recover = run(&myisamchk, &["--recover"], index_file)?;
    if recover.status.success() {
        info!(file = %index_file.display(), "MyISAM index recovered");
        return Ok(IndexCheck::Repaired);
    }

    let mut output = String::from_utf8_lossy(&recover.stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(&recover.stderr));
    Err(AppError::IndexCorruptionUnrecoverable {
        file: index_file.display().to_string(),
        output,
    }
    .into())
}

fn run(myisamchk: &Path, flags: &[&str], index_file: &Path) -> Result<Output> {
    Command::new(myisamchk)
        .args(flags)
        .arg(index_file)
        .output()
        .with_context(|| {
            format!(
                "Failed to execute {} on {}",
                myisamchk.display(),
                index_file.display()
            )
        })
}
