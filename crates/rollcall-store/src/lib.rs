//! rollcall-store: SQLite persistence for the gallery and the attendance log.
//!
//! Both stores open their own connection on the same database file; the
//! schema is created on open and is idempotent.

mod attendance;
mod gallery;

pub use attendance::AttendanceDb;
pub use gallery::GalleryDb;

use chrono::{DateTime, Utc};
use rollcall_core::StorageError;
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid database value: {0}")]
    InvalidDbValue(String),
}

impl From<StoreError> for StorageError {
    fn from(e: StoreError) -> Self {
        StorageError::backend(e)
    }
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS employees (
    employee_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    enrolled_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    employee_id TEXT NOT NULL REFERENCES employees(employee_id) ON DELETE CASCADE,
    dimension INTEGER NOT NULL,
    embedding BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_templates_employee ON templates(employee_id);

CREATE TABLE IF NOT EXISTS attendance_sessions (
    id TEXT PRIMARY KEY,
    employee_id TEXT NOT NULL,
    name TEXT NOT NULL,
    check_in INTEGER NOT NULL,
    check_out INTEGER,
    duration_secs INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sessions_open
    ON attendance_sessions(employee_id, check_out);
CREATE INDEX IF NOT EXISTS idx_sessions_check_in
    ON attendance_sessions(check_in);
";

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    init(&conn)?;
    tracing::debug!(path = %path.display(), "opened database");
    Ok(conn)
}

fn open_memory() -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory()?;
    init(&conn)?;
    Ok(conn)
}

fn init(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "foreign_keys", 1)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

fn encode_embedding_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding_blob(blob: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
    let expected_len = dimension
        .checked_mul(std::mem::size_of::<f32>())
        .ok_or_else(|| StoreError::InvalidDbValue("embedding dimension overflow".into()))?;
    if blob.len() != expected_len {
        return Err(StoreError::InvalidDbValue(format!(
            "embedding byte length: expected {expected_len}, got {}",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::InvalidDbValue(format!("timestamp out of range: {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_little_endian_layout() {
        let blob = encode_embedding_blob(&[1.0, -0.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(decode_embedding_blob(&blob, 2).unwrap(), vec![1.0, -0.5]);
    }

    #[test]
    fn test_blob_length_mismatch() {
        let blob = encode_embedding_blob(&[1.0, 2.0, 3.0]);
        assert!(matches!(
            decode_embedding_blob(&blob, 4),
            Err(StoreError::InvalidDbValue(_))
        ));
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = open_memory().unwrap();
        init(&conn).unwrap();
    }
}
