pub mod files;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use which::which;

/// Resolves a configured tool to an executable path.
///
/// Bare names (`mariadb-dump`, `myisamchk`) are looked up in PATH; anything
/// with a directory component is used as given.
pub fn resolve_tool(tool: &Path) -> Result<PathBuf> {
    if tool.components().count() > 1 {
        if !tool.exists() {
            anyhow::bail!("Configured tool not found: {}", tool.display());
        }
        return Ok(tool.to_path_buf());
    }
    which(tool).with_context(|| {
        format!(
            "{} executable not found in PATH. Please ensure MariaDB client tools are installed and in your PATH.",
            tool.display()
        )
    })
}

/// Quotes an identifier for MariaDB.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
