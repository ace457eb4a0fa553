//! Whole-engine snapshots.
//!
//! Layout:
//!
//! ```text
//! [magic "LXS\0"][format: u8][body length: u64 LE][body: MessagePack][crc32 of body: u32 LE]
//! ```
//!
//! The body holds every fixed table and every per-schema cache table, so a
//! restored engine needs no cache rebuild and resumes its id/timestamp
//! sequence from the key-value rows.

use crate::error::{EngineError, Result};
use crate::schema::{cache_table_ddl, migrate, CACHE_TABLE_PREFIX, INTERNAL_TABLES};
use crate::state::cache::cache_tables;
use crate::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Magic bytes for engine snapshots.
const SNAPSHOT_MAGIC: &[u8; 4] = b"LXS\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

const HEADER_LEN: usize = 4 + 1 + 8;
const TRAILER_LEN: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
struct TableDump {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotBody {
    tables: Vec<TableDump>,
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn dump_table(conn: &Connection, name: &str) -> Result<TableDump> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {name}"))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let rows = stmt
        .query_map([], |row| {
            (0..width)
                .map(|index| row.get::<_, Value>(index))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(TableDump {
        name: name.to_string(),
        columns,
        rows,
    })
}

/// Serialize every engine table into one blob.
pub fn export(conn: &Connection) -> Result<Vec<u8>> {
    let mut tables = Vec::new();
    for name in INTERNAL_TABLES {
        tables.push(dump_table(conn, name)?);
    }
    for (_, table) in cache_tables(conn)? {
        tables.push(dump_table(conn, &table)?);
    }

    let body = rmp_serde::to_vec(&SnapshotBody { tables })?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + TRAILER_LEN);
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.push(SNAPSHOT_VERSION);
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    debug!(bytes = out.len(), "exported snapshot");
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SnapshotBody> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err(EngineError::InvalidFormat("Snapshot too short".into()));
    }
    if &bytes[..4] != SNAPSHOT_MAGIC {
        return Err(EngineError::InvalidFormat("Invalid snapshot magic".into()));
    }
    if bytes[4] != SNAPSHOT_VERSION {
        return Err(EngineError::InvalidFormat(format!(
            "Unsupported snapshot version: {}",
            bytes[4]
        )));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[5..HEADER_LEN]);
    let len = u64::from_le_bytes(len_bytes);
    let body_len = bytes.len() - HEADER_LEN - TRAILER_LEN;
    if usize::try_from(len).ok() != Some(body_len) {
        return Err(EngineError::InvalidFormat(format!(
            "Snapshot length mismatch: header says {len} body bytes"
        )));
    }

    let body = &bytes[HEADER_LEN..HEADER_LEN + body_len];
    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&bytes[HEADER_LEN + body_len..]);
    let expected = u32::from_le_bytes(checksum_bytes);
    let got = crc32fast::hash(body);
    if expected != got {
        return Err(EngineError::ChecksumMismatch { expected, got });
    }

    Ok(rmp_serde::from_slice(body)?)
}

/// Load a blob produced by [`export`] into an empty connection.
pub fn import(conn: &Connection, bytes: &[u8]) -> Result<()> {
    let body = decode(bytes)?;
    migrate(conn)?;

    let tx = conn.unchecked_transaction()?;
    for table in &body.tables {
        let known = INTERNAL_TABLES.contains(&table.name.as_str());
        let cache = table.name.starts_with(CACHE_TABLE_PREFIX) && is_identifier(&table.name);
        if !known && !cache {
            return Err(EngineError::InvalidFormat(format!(
                "Unexpected table in snapshot: {}",
                table.name
            )));
        }
        if let Some(column) = table.columns.iter().find(|column| !is_identifier(column)) {
            return Err(EngineError::InvalidFormat(format!(
                "Invalid column {column} in table {}",
                table.name
            )));
        }
        if cache {
            tx.execute_batch(&cache_table_ddl(&table.name))?;
        }

        tx.execute(&format!("DELETE FROM {}", table.name), [])?;
        if table.columns.is_empty() {
            continue;
        }
        let placeholders = (1..=table.columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            table.name,
            table.columns.join(", ")
        ))?;
        for row in &table.rows {
            stmt.execute(params_from_iter(row.iter()))?;
        }
    }
    tx.commit()?;
    debug!(tables = body.tables.len(), "imported snapshot");
    Ok(())
}

/// Write `bytes` to `path` through a temporary file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
