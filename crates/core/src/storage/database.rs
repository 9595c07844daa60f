use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;

use crate::alert::event::AlertEvent;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
}

/// Local persistence of admitted detections.
///
/// A coarse per-process lock serialises readers and writers; every
/// operation is short and no invariant spans multiple calls.
pub struct DetectionDatabase {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl DetectionDatabase {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS detections (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 track_id INTEGER NOT NULL,
                 vehicle_type TEXT NOT NULL,
                 detected_class TEXT NOT NULL,
                 status TEXT NOT NULL,
                 is_registered INTEGER NOT NULL,
                 beacon_mac TEXT,
                 plate_number TEXT,
                 distance REAL,
                 confidence REAL,
                 snapshot_path TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_detections_timestamp
                 ON detections (timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn insert_event(&self, event: &AlertEvent) -> Result<i64, DatabaseError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO detections
                 (timestamp, track_id, vehicle_type, detected_class, status,
                  is_registered, beacon_mac, plate_number, distance,
                  confidence, snapshot_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                event.track_id,
                event.vehicle_type.as_str(),
                event.detected_class,
                event.status.as_str(),
                event.is_registered,
                event.beacon_mac,
                event.plate_number,
                event.distance,
                event.confidence,
                event
                    .local_snapshot
                    .as_ref()
                    .map(|p| p.display().to_string()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn record_count(&self) -> Result<u64, DatabaseError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM detections", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Deletes rows older than `retention_days`. Timestamps are stored
    /// as fixed-format RFC 3339 UTC strings, so string comparison
    /// orders correctly.
    pub fn cleanup_old_records(&self, retention_days: u32) -> Result<u64, DatabaseError> {
        let cutoff = (Utc::now() - chrono::TimeDelta::days(retention_days as i64))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM detections WHERE timestamp < ?1", [&cutoff])?;
        Ok(deleted as u64)
    }

    /// Deletes the oldest rows beyond `max_records`.
    pub fn cleanup_excess_records(&self, max_records: u64) -> Result<u64, DatabaseError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM detections WHERE id IN (
                 SELECT id FROM detections ORDER BY id ASC
                 LIMIT max(0, (SELECT COUNT(*) FROM detections) - ?1)
             )",
            [max_records as i64],
        )?;
        Ok(deleted as u64)
    }

    /// Reclaims file space after deletions.
    pub fn vacuum(&self) -> Result<(), DatabaseError> {
        let conn = self.lock()?;
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::Poisoned)
    }
}
