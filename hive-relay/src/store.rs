use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Failures of the local SQLite stores. None of these are fatal: callers log
/// them and skip the operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid timestamp in store: {0}")]
    Timestamp(String),
    #[error("invalid sync status in store: {0}")]
    Status(String),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Opens (creating if needed) a store file and applies its schema.
pub fn open_database<P: AsRef<Path>>(path: P, schema: &str) -> Result<Connection, StoreError> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(dir = %parent.display(), error = %e, "could not create database directory");
            }
        }
    }
    let conn = Connection::open(path)?;
    // another process (the sensor logger) may hold the file briefly
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(schema)?;
    Ok(conn)
}

pub fn open_in_memory(schema: &str) -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(schema)?;
    Ok(conn)
}
