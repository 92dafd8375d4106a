//! Per-day local log databases.
//!
//! One SQLite file per Berlin calendar day under `<root>/user-logs/`,
//! named `logs-YYYY-MM-DD.db`. Rows are append-only and deduplicated on
//! `(user_id, timestamp_ms, log_type)`; whole files are dropped when the
//! day leaves the retention window.

use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use chrono_tz::Europe::Berlin;
use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::models::log::{LogEntry, LogType};

/// Reads older than this go through the short-lived read-only cache.
const OLD_DATE_DAYS: i64 = 7;
const OLD_HANDLE_TTL: Duration = Duration::from_secs(3600);

/// Berlin calendar day of an epoch-ms event time.
pub fn berlin_date_of_ms(timestamp_ms: i64) -> NaiveDate {
    match Utc.timestamp_millis_opt(timestamp_ms) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Berlin).date_naive(),
        _ => Utc::now().with_timezone(&Berlin).date_naive(),
    }
}

pub fn berlin_today() -> NaiveDate {
    Utc::now().with_timezone(&Berlin).date_naive()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayStats {
    pub exists: bool,
    pub size_bytes: u64,
    pub row_count: i64,
    pub user_count: i64,
}

type SharedConn = Arc<Mutex<Connection>>;

pub struct DayStore {
    dir: PathBuf,
    /// One write connection per open day.
    handles: Mutex<HashMap<NaiveDate, SharedConn>>,
    /// Read-only connections for old dates, auto-closed after an hour.
    old_reads: Mutex<HashMap<NaiveDate, (SharedConn, Instant)>>,
}

impl DayStore {
    pub fn open(data_root: &str) -> anyhow::Result<Self> {
        let dir = Path::new(data_root).join("user-logs");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            handles: Mutex::new(HashMap::new()),
            old_reads: Mutex::new(HashMap::new()),
        })
    }

    pub fn file_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("logs-{}.db", date.format("%Y-%m-%d")))
    }

    fn open_conn(&self, date: NaiveDate) -> anyhow::Result<Connection> {
        let conn = Connection::open(self.file_path(date))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             CREATE TABLE IF NOT EXISTS log (
                 id            INTEGER PRIMARY KEY AUTOINCREMENT,
                 user_id       TEXT NOT NULL,
                 username      TEXT NOT NULL,
                 timestamp_ms  INTEGER NOT NULL,
                 log_type      TEXT NOT NULL,
                 data          TEXT NOT NULL,
                 created_at_ms INTEGER NOT NULL,
                 UNIQUE(user_id, timestamp_ms, log_type)
             );
             CREATE INDEX IF NOT EXISTS idx_log_user_ts ON log(user_id, timestamp_ms);
             CREATE INDEX IF NOT EXISTS idx_log_type ON log(log_type);",
        )?;
        Ok(conn)
    }

    fn write_handle(&self, date: NaiveDate) -> anyhow::Result<SharedConn> {
        let mut handles = self.handles.lock().unwrap();
        if let Some(conn) = handles.get(&date) {
            return Ok(conn.clone());
        }
        let conn = Arc::new(Mutex::new(self.open_conn(date)?));
        handles.insert(date, conn.clone());
        Ok(conn)
    }

    /// Read connection for a date. Recent dates share the write handle;
    /// older dates get a cached read-only handle that expires after an
    /// hour.
    fn read_handle(&self, date: NaiveDate) -> anyhow::Result<Option<SharedConn>> {
        if !self.file_path(date).exists() {
            return Ok(None);
        }
        let age_days = (berlin_today() - date).num_days();
        if age_days <= OLD_DATE_DAYS {
            return Ok(Some(self.write_handle(date)?));
        }

        let mut cache = self.old_reads.lock().unwrap();
        cache.retain(|_, (_, opened)| opened.elapsed() < OLD_HANDLE_TTL);
        if let Some((conn, _)) = cache.get(&date) {
            return Ok(Some(conn.clone()));
        }
        let conn = Connection::open_with_flags(
            self.file_path(date),
            OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        let shared = Arc::new(Mutex::new(conn));
        cache.insert(date, (shared.clone(), Instant::now()));
        Ok(Some(shared))
    }

    /// Idempotent insert; returns whether a row was actually written.
    pub fn insert(&self, date: NaiveDate, entry: &LogEntry) -> anyhow::Result<bool> {
        let handle = self.write_handle(date)?;
        let conn = handle.lock().unwrap();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO log (user_id, username, timestamp_ms, log_type, data, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.user_id,
                entry.username,
                entry.timestamp_ms,
                entry.log_type.as_str(),
                entry.data.to_string(),
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Single-transaction batch insert; returns the number of new rows.
    pub fn insert_batch(&self, date: NaiveDate, entries: &[LogEntry]) -> anyhow::Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let handle = self.write_handle(date)?;
        let mut conn = handle.lock().unwrap();
        let now_ms = Utc::now().timestamp_millis();
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO log (user_id, username, timestamp_ms, log_type, data, created_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for entry in entries {
                inserted += stmt.execute(params![
                    entry.user_id,
                    entry.username,
                    entry.timestamp_ms,
                    entry.log_type.as_str(),
                    entry.data.to_string(),
                    now_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_by_user(&self, date: NaiveDate, user_id: &str) -> anyhow::Result<Vec<LogEntry>> {
        let Some(handle) = self.read_handle(date)? else {
            return Ok(Vec::new());
        };
        let conn = handle.lock().unwrap();
        let result = (|| -> rusqlite::Result<Vec<LogEntry>> {
            let mut stmt = conn.prepare(
                "SELECT user_id, username, timestamp_ms, log_type, data FROM log \
                 WHERE user_id = ?1 ORDER BY timestamp_ms ASC",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    let log_type: String = row.get(3)?;
                    let data: String = row.get(4)?;
                    Ok(LogEntry {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        timestamp_ms: row.get(2)?,
                        log_type: LogType::parse(&log_type).unwrap_or(LogType::Action),
                        data: serde_json::from_str(&data)
                            .unwrap_or(serde_json::Value::String(data)),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })();
        drop(conn);
        match result {
            Ok(rows) => Ok(rows),
            Err(e) if is_corruption(&e) => {
                self.quarantine(date);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user_ids(&self, date: NaiveDate) -> anyhow::Result<Vec<String>> {
        let Some(handle) = self.read_handle(date)? else {
            return Ok(Vec::new());
        };
        let conn = handle.lock().unwrap();
        let result = (|| -> rusqlite::Result<Vec<String>> {
            let mut stmt =
                conn.prepare("SELECT DISTINCT user_id FROM log ORDER BY user_id ASC")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })();
        drop(conn);
        match result {
            Ok(rows) => Ok(rows),
            Err(e) if is_corruption(&e) => {
                self.quarantine(date);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Flush the write-ahead log into the main file, ahead of backup or
    /// export.
    pub fn checkpoint(&self, date: NaiveDate) -> anyhow::Result<()> {
        if !self.file_path(date).exists() {
            return Ok(());
        }
        let handle = self.write_handle(date)?;
        let conn = handle.lock().unwrap();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    pub fn checkpoint_all_open(&self) {
        let dates: Vec<NaiveDate> = self.handles.lock().unwrap().keys().copied().collect();
        for date in dates {
            if let Err(e) = self.checkpoint(date) {
                tracing::warn!("checkpoint failed for {date}: {e}");
            }
        }
    }

    pub fn stats(&self, date: NaiveDate) -> anyhow::Result<DayStats> {
        let path = self.file_path(date);
        if !path.exists() {
            return Ok(DayStats {
                exists: false,
                size_bytes: 0,
                row_count: 0,
                user_count: 0,
            });
        }
        let size_bytes = std::fs::metadata(&path)?.len();
        let handle = self.write_handle(date)?;
        let conn = handle.lock().unwrap();
        let row_count: i64 = conn.query_row("SELECT COUNT(*) FROM log", [], |r| r.get(0))?;
        let user_count: i64 =
            conn.query_row("SELECT COUNT(DISTINCT user_id) FROM log", [], |r| r.get(0))?;
        Ok(DayStats {
            exists: true,
            size_bytes,
            row_count,
            user_count,
        })
    }

    /// Delete day files (with WAL/shm siblings) older than the retention
    /// window. Returns the number of days removed.
    pub fn cleanup_older_than(&self, days: u32) -> anyhow::Result<usize> {
        let cutoff = berlin_today() - ChronoDuration::days(days as i64);
        let mut removed = 0usize;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(date) = parse_db_filename(&name) else {
                continue;
            };
            if date >= cutoff {
                continue;
            }
            self.handles.lock().unwrap().remove(&date);
            self.old_reads.lock().unwrap().remove(&date);
            self.remove_files(date);
            removed += 1;
            tracing::info!("retention: removed day store {date}");
        }
        Ok(removed)
    }

    fn remove_files(&self, date: NaiveDate) {
        let path = self.file_path(date);
        for sibling in [
            path.clone(),
            path.with_extension("db-wal"),
            path.with_extension("db-shm"),
        ] {
            if sibling.exists() {
                if let Err(e) = std::fs::remove_file(&sibling) {
                    tracing::warn!("could not remove {}: {e}", sibling.display());
                }
            }
        }
    }

    /// A corrupt day file is useless locally; drop it and flag the date
    /// for re-download from the backup sink.
    fn quarantine(&self, date: NaiveDate) {
        tracing::error!(
            "day store {date} is corrupt, removing; the day must be re-downloaded from backup"
        );
        self.handles.lock().unwrap().remove(&date);
        self.old_reads.lock().unwrap().remove(&date);
        self.remove_files(date);
    }
}

fn is_corruption(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseCorrupt) | Some(rusqlite::ErrorCode::NotADatabase)
    )
}

fn parse_db_filename(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_prefix("logs-")?.strip_suffix(".db")?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

/// Daily retention sweep.
pub fn spawn_retention_cleanup(store: Arc<DayStore>, retention_days: u32) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
        loop {
            interval.tick().await;
            match store.cleanup_older_than(retention_days) {
                Ok(0) => {}
                Ok(n) => tracing::info!("retention: removed {n} day stores"),
                Err(e) => tracing::error!("retention cleanup failed: {e}"),
            }
        }
    });
}
