// physdbtool/src/restore/db_restore.rs
//! Statement builders for recreating tables from a schema-only dump.

use anyhow::{Context, Result};
use regex::Regex;
use std::sync::OnceLock;

use crate::utils::quote_identifier;

/// Strips the dump directives that a restore target must not execute:
/// the sandbox-mode marker newer dump clients emit, and definer clauses
/// naming accounts that may not exist on the target.
pub fn sanitize_schema_dump(schema: &str) -> String {
    static SANDBOX_MODE: OnceLock<Regex> = OnceLock::new();
    static DEFINER: OnceLock<Regex> = OnceLock::new();

    let sandbox_mode = SANDBOX_MODE.get_or_init(|| {
        Regex::new(r"/\*M?!999999\\- enable the sandbox mode \*/").expect("valid regex")
    });
    let definer = DEFINER.get_or_init(|| {
        Regex::new(r"/\*![0-9]* DEFINER=[^ ]* SQL SECURITY DEFINER \*/").expect("valid regex")
    });

    let without_sandbox = sandbox_mode.replace_all(schema, "");
    definer.replace_all(&without_sandbox, "").into_owned()
}

/// Splits a dump into statements on `;` at end of line, dropping blank pieces.
pub fn split_statements(schema: &str) -> Vec<&str> {
    schema
        .split(";\n")
        .filter(|statement| !statement.trim().is_empty())
        .collect()
}

/// Finds the `CREATE TABLE` (or `CREATE SEQUENCE`) statement of one table in a dump.
pub fn extract_create_statement(schema: &str, table: &str, is_sequence: bool) -> Result<String> {
    let name = regex::escape(&quote_identifier(table));
    let (kind, pattern) = if is_sequence {
        ("CREATE SEQUENCE", format!(r"(?s)CREATE SEQUENCE {}.*?;", name))
    } else {
        // a table definition ends at the first `;` that closes its line
        ("CREATE TABLE", format!(r"(?s)CREATE TABLE {}.*?;[ \t\r]*(?:\n|\z)", name))
    };
    let pattern = Regex::new(&pattern)
        .with_context(|| format!("Failed to build statement pattern for table {}", table))?;

    pattern
        .find(schema)
        .map(|found| found.as_str().trim_end().to_string())
        .with_context(|| format!("{} statement for {} not found in SQL dump", kind, table))
}

pub fn drop_statement(table: &str, is_sequence: bool) -> String {
    if is_sequence {
        format!("DROP SEQUENCE IF EXISTS {};", quote_identifier(table))
    } else {
        format!("DROP TABLE IF EXISTS {};", quote_identifier(table))
    }
}

pub fn discard_tablespace_statement(table: &str) -> String {
    format!("ALTER TABLE {} DISCARD TABLESPACE;", quote_identifier(table))
}

pub fn import_tablespace_statement(table: &str) -> String {
    format!("ALTER TABLE {} IMPORT TABLESPACE;", quote_identifier(table))
}

/// One statement write-locking every table, or `None` when there is nothing to lock.
pub fn lock_tables_statement(tables: &[String]) -> Option<String> {
    if tables.is_empty() {
        return None;
    }
    let locks: Vec<String> = tables
        .iter()
        .map(|table| format!("{} WRITE", quote_identifier(table)))
        .collect();
    Some(format!("LOCK TABLES {};", locks.join(", ")))
}
