// physdbtool/src/utils/files.rs
use anyhow::{Context, Result};
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use walkdir::WalkDir;

use crate::config::FileOwner;
use crate::errors::AppError;

const HASH_CHUNK_SIZE: usize = 10_000_000;
const WARMUP_BLOCK_SIZE: usize = 4 * 1024 * 1024;
const RESTORED_FILE_MODE: u32 = 0o660;

/// SHA-256 of a file's content, hex encoded.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// MariaDB stores special characters of table names as `@XXXX` in file names.
pub fn decode_mariadb_filename(filename: &str) -> String {
    static ENCODED: OnceLock<Regex> = OnceLock::new();
    let pattern = ENCODED.get_or_init(|| Regex::new(r"@([0-9A-Fa-f]{4})").expect("valid regex"));
    pattern
        .replace_all(filename, |caps: &Captures| {
            u32::from_str_radix(&caps[1], 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Decoded table name of a table file, e.g. `tabSales@0020Invoice.ibd` -> `tabSales Invoice`.
pub fn table_name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| decode_mariadb_filename(&stem.to_string_lossy()))
        .unwrap_or_default()
}

/// Regular files directly inside `dir`, sorted by name.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("Failed to list directory: {}", dir.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Forces the kernel to write a file's buffered pages and metadata to the device.
pub fn sync_file(path: &Path) -> Result<()> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for fsync: {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to fsync file: {}", path.display()))
}

/// Reads files front to back in large blocks and throws the content away.
///
/// A volume restored from a block-storage snapshot is fetched lazily; touching
/// every block once up front is much faster than letting the server fault
/// them in one random read at a time.
pub fn warmup_files(paths: &[PathBuf]) -> Result<u64> {
    let mut buffer = vec![0u8; WARMUP_BLOCK_SIZE];
    let mut total_bytes = 0u64;
    for path in paths {
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open file for warmup: {}", path.display()))?;
        loop {
            let bytes_read = file
                .read(&mut buffer)
                .with_context(|| format!("Failed to read file for warmup: {}", path.display()))?;
            if bytes_read == 0 {
                break;
            }
            total_bytes += bytes_read as u64;
        }
    }
    Ok(total_bytes)
}

/// Copies a table file into a server data directory and hands it to the service account.
pub async fn copy_table_file(
    source: &Path,
    target_dir: &Path,
    owner: Option<&FileOwner>,
) -> Result<PathBuf> {
    let file_name = source
        .file_name()
        .with_context(|| format!("Invalid source file path: {}", source.display()))?;
    let target = target_dir.join(file_name);

    tokio::fs::copy(source, &target).await.with_context(|| {
        format!("Failed to copy {} to {}", source.display(), target.display())
    })?;

    if let Some(owner) = owner {
        change_owner(&target, owner)?;
    }
    fs::set_permissions(&target, fs::Permissions::from_mode(RESTORED_FILE_MODE))
        .with_context(|| format!("Failed to set permissions on {}", target.display()))?;
    Ok(target)
}

fn change_owner(path: &Path, owner: &FileOwner) -> Result<()> {
    let chown = super::resolve_tool(Path::new("chown"))?;
    let output = Command::new(chown)
        .arg(format!("{}:{}", owner.user, owner.group))
        .arg(path)
        .output()
        .with_context(|| format!("Failed to execute chown on {}", path.display()))?;

    if !output.status.success() {
        let error = AppError::Command {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        return Err(anyhow::Error::new(error).context(format!(
            "chown {}:{} failed for {}",
            owner.user,
            owner.group,
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_compute_file_hash() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tabDoc.frm");
        File::create(&path)?.write_all(b"hello")?;

        assert_eq!(
            compute_file_hash(&path)?,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(compute_file_hash(&dir.path().join("missing.frm")).is_err());
        Ok(())
    }

    #[test]
    fn test_decode_mariadb_filename() {
        assert_eq!(decode_mariadb_filename("tabSales@0020Invoice"), "tabSales Invoice");
        assert_eq!(decode_mariadb_filename("tab@002dLog@0020x"), "tab-Log x");
        assert_eq!(decode_mariadb_filename("tabDoc"), "tabDoc");
        assert_eq!(decode_mariadb_filename("odd@zz"), "odd@zz");
    }

    #[test]
    fn test_table_name_from_path() {
        assert_eq!(
            table_name_from_path(Path::new("/var/lib/mysql/db/tabSales@0020Invoice.ibd")),
            "tabSales Invoice"
        );
        assert_eq!(table_name_from_path(Path::new("tabLog.MYI")), "tabLog");
    }

    #[test]
    fn test_list_files_skips_directories() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        File::create(dir.path().join("b.ibd"))?;
        File::create(dir.path().join("a.frm"))?;
        fs::create_dir(dir.path().join("nested"))?;

        let names: Vec<String> = list_files(dir.path())?
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.frm".to_string(), "b.ibd".to_string()]);
        Ok(())
    }

    #[test]
    fn test_warmup_reads_everything() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let first = dir.path().join("t1.ibd");
        let second = dir.path().join("t2.ibd");
        File::create(&first)?.write_all(&vec![1u8; WARMUP_BLOCK_SIZE + 10])?;
        File::create(&second)?.write_all(b"abc")?;

        assert_eq!(warmup_files(&[first, second])?, (WARMUP_BLOCK_SIZE + 13) as u64);
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_table_file_sets_mode() -> anyhow::Result<()> {
        let source_dir = tempfile::tempdir()?;
        let target_dir = tempfile::tempdir()?;
        let source = source_dir.path().join("tabDoc.ibd");
        File::create(&source)?.write_all(b"pages")?;

        let target = copy_table_file(&source, target_dir.path(), None).await?;
        assert_eq!(fs::read(&target)?, b"pages");
        assert_eq!(fs::metadata(&target)?.permissions().mode() & 0o777, 0o660);
        Ok(())
    }
}
