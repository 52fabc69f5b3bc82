//! Liveness store: per-unit status table plus the append-only heartbeat log.
//!
//! Every mutation is a single statement or a single transaction so that the
//! heartbeat handler and the liveness monitor can race on a row without a
//! read-modify-write in component code.

use crate::clock::{format_timestamp, parse_timestamp};
use crate::models::{HeartbeatRecord, SyncStatus, UnitStatus};
use crate::state::{new_state, Shared};
use crate::store::{open_database, open_in_memory, StoreError};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS heartbeats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        camera_name TEXT NOT NULL,
        receipt_time TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_heartbeats_camera ON heartbeats (camera_name, id);
    CREATE TABLE IF NOT EXISTS camera_status (
        camera_name TEXT PRIMARY KEY,
        last_seen TEXT NOT NULL,
        sync_status TEXT NOT NULL,
        camera_on BOOLEAN NOT NULL DEFAULT 0
    );
";

#[derive(Clone)]
pub struct LivenessStore {
    conn: Shared<Connection>,
}

impl LivenessStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Self { conn: new_state(open_database(path, SCHEMA)?) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self { conn: new_state(open_in_memory(SCHEMA)?) })
    }

    /// Appends a heartbeat row and upserts the unit's status in one transaction.
    pub fn record_heartbeat(
        &self,
        unit_id: &str,
        receipt_time: &NaiveDateTime,
        sync_status: SyncStatus,
        powered_on: bool,
    ) -> Result<(), StoreError> {
        let receipt = format_timestamp(receipt_time);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO heartbeats (camera_name, receipt_time) VALUES (?1, ?2)",
            params![unit_id, receipt],
        )?;
        tx.execute(
            "INSERT INTO camera_status (camera_name, last_seen, sync_status, camera_on)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(camera_name) DO UPDATE SET
                 last_seen = excluded.last_seen,
                 sync_status = excluded.sync_status,
                 camera_on = excluded.camera_on",
            params![unit_id, receipt, sync_status.as_str(), powered_on],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_units(&self) -> Result<Vec<UnitStatus>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT camera_name, last_seen, sync_status, camera_on FROM camera_status ORDER BY camera_name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?, row.get::<_, bool>(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(name, last_seen, status, on)| unit_from_columns(name, &last_seen, &status, on))
            .collect()
    }

    pub fn unit(&self, unit_id: &str) -> Result<Option<UnitStatus>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT camera_name, last_seen, sync_status, camera_on FROM camera_status WHERE camera_name = ?1",
                params![unit_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?, row.get::<_, bool>(3)?)),
            )
            .optional()?;
        row.map(|(name, last_seen, status, on)| unit_from_columns(name, &last_seen, &status, on))
            .transpose()
    }

    /// DOWN transition: status DOWN, power forced off, `last_seen` untouched.
    /// Only applies if the row still carries the `last_seen` the caller judged
    /// silent, so a heartbeat that lands mid-sweep wins. Returns whether the row changed.
    pub fn mark_down(&self, unit_id: &str, observed_last_seen: &NaiveDateTime) -> Result<bool, StoreError> {
        let changed = self.conn.lock().execute(
            "UPDATE camera_status SET sync_status = ?1, camera_on = 0
             WHERE camera_name = ?2 AND last_seen = ?3 AND sync_status != ?1",
            params![SyncStatus::Down.as_str(), unit_id, format_timestamp(observed_last_seen)],
        )?;
        Ok(changed > 0)
    }

    /// DOWN -> GOOD. Returns whether the row was DOWN.
    pub fn mark_recovered(&self, unit_id: &str) -> Result<bool, StoreError> {
        let changed = self.conn.lock().execute(
            "UPDATE camera_status SET sync_status = ?1 WHERE camera_name = ?2 AND sync_status = ?3",
            params![SyncStatus::Good.as_str(), unit_id, SyncStatus::Down.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn heartbeat_count(&self, unit_id: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM heartbeats WHERE camera_name = ?1",
            params![unit_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Most recent heartbeats first.
    pub fn recent_heartbeats(&self, unit_id: &str, limit: usize) -> Result<Vec<HeartbeatRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, camera_name, receipt_time FROM heartbeats
             WHERE camera_name = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![unit_id, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, unit_id, receipt)| {
                let receipt_time = parse_timestamp(&receipt).ok_or(StoreError::Timestamp(receipt))?;
                Ok(HeartbeatRecord { id, unit_id, receipt_time })
            })
            .collect()
    }
}

fn unit_from_columns(unit_id: String, last_seen: &str, status: &str, powered_on: bool) -> Result<UnitStatus, StoreError> {
    let last_seen = parse_timestamp(last_seen).ok_or_else(|| StoreError::Timestamp(last_seen.to_string()))?;
    let sync_status = SyncStatus::parse(status).ok_or_else(|| StoreError::Status(status.to_string()))?;
    Ok(UnitStatus { unit_id, last_seen, sync_status, powered_on })
}
