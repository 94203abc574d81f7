//! SQLite persistence for the set catalog and scan status.
//!
//! The store is a restart cache: on startup the library loads the last
//! scan's rows for an immediate view, then a fresh scan rewrites them.
//! Scan status lives in its own single-row table so progress survives a
//! restart independent of the in-memory state machine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::metadata::{RecordSource, SetRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scan state machine states, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Scanning,
    Completed,
    Error,
}

impl ScanState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    fn from_str(value: &str) -> Self {
        match value {
            "scanning" => Self::Scanning,
            "completed" => Self::Completed,
            "error" => Self::Error,
            _ => Self::Idle,
        }
    }
}

/// Snapshot of the persisted scan status row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStatus {
    pub state: ScanState,
    pub total_files: u64,
    pub processed_files: u64,
    pub current_file: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self {
            state: ScanState::Idle,
            total_files: 0,
            processed_files: 0,
            current_file: None,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

/// Durable key/value-ish store of set records keyed by `set_id`.
///
/// All methods are blocking; async callers go through `spawn_blocking`. The
/// connection is serialized behind a mutex, matching the short-critical-
/// section discipline of the in-memory index.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (and migrate) the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sets (
                 set_id        INTEGER PRIMARY KEY,
                 artist        TEXT NOT NULL DEFAULT '',
                 title         TEXT NOT NULL DEFAULT '',
                 creator       TEXT NOT NULL DEFAULT '',
                 file_path     TEXT NOT NULL DEFAULT '',
                 file_size     INTEGER NOT NULL DEFAULT 0,
                 last_modified REAL NOT NULL DEFAULT 0,
                 updated_at    INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
             );
             CREATE INDEX IF NOT EXISTS idx_sets_file_path ON sets(file_path);
             CREATE TABLE IF NOT EXISTS scan_status (
                 id              INTEGER PRIMARY KEY CHECK (id = 1),
                 state           TEXT NOT NULL DEFAULT 'idle',
                 total_files     INTEGER NOT NULL DEFAULT 0,
                 processed_files INTEGER NOT NULL DEFAULT 0,
                 current_file    TEXT,
                 started_at      INTEGER,
                 completed_at    INTEGER,
                 error_message   TEXT
             );",
        )?;
        Ok(())
    }

    /// Idempotent insert-or-replace of one set row.
    pub fn upsert(
        &self,
        record: &SetRecord,
        file_path: &str,
        file_size: u64,
        last_modified: f64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO sets
                 (set_id, artist, title, creator, file_path, file_size, last_modified, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, strftime('%s', 'now'))",
            params![
                record.set_id as i64,
                record.artist,
                record.title,
                record.creator,
                file_path,
                file_size as i64,
                last_modified,
            ],
        )?;
        Ok(())
    }

    /// All persisted records, keyed by set id.
    pub fn get_all(&self) -> Result<HashMap<u64, SetRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt =
            conn.prepare("SELECT set_id, artist, title, creator FROM sets ORDER BY set_id")?;
        let rows = stmt.query_map([], |row| {
            let set_id: i64 = row.get(0)?;
            Ok(SetRecord::new(
                set_id as u64,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
            )
            .with_source(RecordSource::Filesystem))
        })?;

        let mut result = HashMap::new();
        for row in rows {
            let record = row?;
            result.insert(record.set_id, record);
        }
        Ok(result)
    }

    /// Drop rows whose file path is no longer backed by a scanned file.
    /// Returns the number of deleted rows.
    pub fn delete_not_in(&self, valid_paths: &[String]) -> Result<usize, StoreError> {
        if valid_paths.is_empty() {
            return self.delete_all();
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        let placeholders = vec!["?"; valid_paths.len()].join(",");
        let sql = format!("DELETE FROM sets WHERE file_path NOT IN ({placeholders})");
        let deleted = conn.execute(&sql, rusqlite::params_from_iter(valid_paths.iter()))?;
        Ok(deleted)
    }

    /// Drop every set row. Returns the number of deleted rows.
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let deleted = conn.execute("DELETE FROM sets", [])?;
        Ok(deleted)
    }

    /// Transition scan status to `scanning` with a fresh progress row.
    pub fn start_scan(&self, total_files: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO scan_status
                 (id, state, total_files, processed_files, current_file,
                  started_at, completed_at, error_message)
             VALUES (1, 'scanning', ?1, 0, NULL, strftime('%s', 'now'), NULL, NULL)",
            params![total_files as i64],
        )?;
        Ok(())
    }

    /// Update progress counters for the running scan.
    pub fn update_progress(
        &self,
        processed_files: u64,
        current_file: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE scan_status SET processed_files = ?1, current_file = ?2 WHERE id = 1",
            params![processed_files as i64, current_file],
        )?;
        Ok(())
    }

    /// Transition scan status to `completed`.
    pub fn complete_scan(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE scan_status
             SET state = 'completed', completed_at = strftime('%s', 'now')
             WHERE id = 1",
            [],
        )?;
        Ok(())
    }

    /// Transition scan status to `error`, recording the message.
    pub fn set_scan_error(&self, message: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE scan_status
             SET state = 'error', error_message = ?1, completed_at = strftime('%s', 'now')
             WHERE id = 1",
            params![message],
        )?;
        Ok(())
    }

    /// Current scan status row, or the idle default if none exists yet.
    pub fn scan_status(&self) -> Result<ScanStatus, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let status = conn
            .query_row(
                "SELECT state, total_files, processed_files, current_file,
                        started_at, completed_at, error_message
                 FROM scan_status WHERE id = 1",
                [],
                |row| {
                    let state: String = row.get(0)?;
                    let total: i64 = row.get(1)?;
                    let processed: i64 = row.get(2)?;
                    Ok(ScanStatus {
                        state: ScanState::from_str(&state),
                        total_files: total as u64,
                        processed_files: processed as u64,
                        current_file: row.get(3)?,
                        started_at: row.get(4)?,
                        completed_at: row.get(5)?,
                        error_message: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(status.unwrap_or_default())
    }

    /// Reset scan status back to idle.
    pub fn reset_scan_status(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO scan_status
                 (id, state, total_files, processed_files, current_file,
                  started_at, completed_at, error_message)
             VALUES (1, 'idle', 0, 0, NULL, NULL, NULL, NULL)",
            [],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(set_id: u64, artist: &str) -> SetRecord {
        SetRecord::new(set_id, artist.into(), "Title".into(), "creator".into())
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.upsert(&record(1, "A"), "/songs/1.osu", 10, 1.0).unwrap();
        store.upsert(&record(1, "B"), "/songs/1.osu", 10, 2.0).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[&1].artist, "B");
    }

    #[test]
    fn delete_not_in_prunes_stale_rows() {
        let store = Store::open_in_memory().unwrap();
        store.upsert(&record(1, "A"), "/songs/1.osu", 0, 0.0).unwrap();
        store.upsert(&record(2, "B"), "/songs/2.osu", 0, 0.0).unwrap();

        let deleted = store.delete_not_in(&["/songs/2.osu".to_string()]).unwrap();
        assert_eq!(deleted, 1);
        let all = store.get_all().unwrap();
        assert!(all.contains_key(&2));
        assert!(!all.contains_key(&1));
    }

    #[test]
    fn delete_not_in_with_no_paths_clears_everything() {
        let store = Store::open_in_memory().unwrap();
        store.upsert(&record(1, "A"), "/songs/1.osu", 0, 0.0).unwrap();
        assert_eq!(store.delete_not_in(&[]).unwrap(), 1);
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn scan_status_transitions() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.scan_status().unwrap().state, ScanState::Idle);

        store.start_scan(42).unwrap();
        let status = store.scan_status().unwrap();
        assert_eq!(status.state, ScanState::Scanning);
        assert_eq!(status.total_files, 42);
        assert!(status.started_at.is_some());

        store.update_progress(10, Some("/songs/x.osu")).unwrap();
        let status = store.scan_status().unwrap();
        assert_eq!(status.processed_files, 10);
        assert_eq!(status.current_file.as_deref(), Some("/songs/x.osu"));

        store.complete_scan().unwrap();
        let status = store.scan_status().unwrap();
        assert_eq!(status.state, ScanState::Completed);
        assert!(status.completed_at.is_some());
    }

    #[test]
    fn scan_error_keeps_message() {
        let store = Store::open_in_memory().unwrap();
        store.start_scan(1).unwrap();
        store.set_scan_error("root missing").unwrap();

        let status = store.scan_status().unwrap();
        assert_eq!(status.state, ScanState::Error);
        assert_eq!(status.error_message.as_deref(), Some("root missing"));

        store.reset_scan_status().unwrap();
        assert_eq!(store.scan_status().unwrap().state, ScanState::Idle);
    }
}
