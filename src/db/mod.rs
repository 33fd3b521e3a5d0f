// SPDX-License-Identifier: MIT

//! Detection log store
//!
//! One row per completed capture cycle, including cycles where nothing was
//! detected. Rows are append-only from the loop's perspective: created once,
//! never updated, never deleted here.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::{BugwatchError, Result};

/// Detection log store (thread-safe wrapper around SQLite)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Classification outcome of one cycle.
///
/// Carrying the label and confidence together makes "confidence present iff
/// label present" hold by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// An insect was identified
    Insect { label: String, confidence: f64 },
    /// Nothing detected (or the classifier failed and was degraded to this)
    None,
}

impl Detection {
    pub fn label(&self) -> Option<&str> {
        match self {
            Detection::Insect { label, .. } => Some(label),
            Detection::None => None,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            Detection::Insect { confidence, .. } => Some(*confidence),
            Detection::None => None,
        }
    }

    pub fn is_insect(&self) -> bool {
        matches!(self, Detection::Insect { .. })
    }
}

/// Optional temperature/humidity readings supplied by the capture context
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EnvironmentReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

/// A new row to append, assembled by the orchestrator at the end of a cycle
#[derive(Debug, Clone)]
pub struct NewDetection {
    pub camera_name: String,
    pub filename: String,
    pub processed_filename: Option<String>,
    pub detection: Detection,
    pub environment: EnvironmentReading,
    pub captured_at: DateTime<Utc>,
    pub notified: bool,
}

/// A persisted detection row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub camera_name: String,
    pub filename: String,
    pub processed_filename: Option<String>,
    pub insect: Option<String>,
    pub confidence: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub notified: bool,
}

/// Aggregate counters for the dashboard and `db stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub total: i64,
    pub detected: i64,
    pub notified: i64,
}

const RECORD_COLUMNS: &str =
    "id, camera_name, filename, processed_filename, insect, confidence, \
     temperature, humidity, created_at, notified";

impl Database {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize()?;
        Ok(db)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| BugwatchError::LockPoisoned)
    }

    /// Initialize database schema
    fn initialize(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS detections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                camera_name TEXT NOT NULL,
                filename TEXT NOT NULL,
                processed_filename TEXT,
                insect TEXT,
                confidence REAL,
                temperature REAL,
                humidity REAL,
                created_at TEXT NOT NULL,
                notified INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_detections_created ON detections(created_at);
            CREATE INDEX IF NOT EXISTS idx_detections_insect ON detections(insect);
        "#,
        )?;
        Ok(())
    }

    /// Append one detection record, returning its id
    pub fn insert_detection(&self, new: &NewDetection) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"INSERT INTO detections
                   (camera_name, filename, processed_filename, insect, confidence,
                    temperature, humidity, created_at, notified)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                new.camera_name,
                new.filename,
                new.processed_filename,
                new.detection.label(),
                new.detection.confidence(),
                new.environment.temperature,
                new.environment.humidity,
                new.captured_at.to_rfc3339(),
                new.notified as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DetectionRecord> {
        let created_str: String = row.get(8)?;
        Ok(DetectionRecord {
            id: row.get(0)?,
            camera_name: row.get(1)?,
            filename: row.get(2)?,
            processed_filename: row.get(3)?,
            insect: row.get(4)?,
            confidence: row.get(5)?,
            temperature: row.get(6)?,
            humidity: row.get(7)?,
            created_at: DateTime::parse_from_rfc3339(&created_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            notified: row.get::<_, i64>(9)? != 0,
        })
    }

    /// Most recent records, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<DetectionRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM detections ORDER BY created_at DESC, id DESC LIMIT ?1",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![limit as i64], Self::map_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Records for one species label, newest first
    pub fn by_label(&self, label: &str, limit: usize) -> Result<Vec<DetectionRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM detections WHERE insect = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![label, limit as i64], Self::map_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Records with no detection, newest first
    pub fn without_label(&self, limit: usize) -> Result<Vec<DetectionRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM detections WHERE insect IS NULL \
             ORDER BY created_at DESC, id DESC LIMIT ?1",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![limit as i64], Self::map_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Count of records per species label, most frequent first
    pub fn label_counts(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT insect, COUNT(*) FROM detections WHERE insect IS NOT NULL \
             GROUP BY insect ORDER BY COUNT(*) DESC",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    /// Distinct species labels seen so far, alphabetical
    pub fn labels(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT insect FROM detections WHERE insect IS NOT NULL ORDER BY insect",
        )?;
        let labels = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(labels)
    }

    /// Total number of records
    pub fn count(&self) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))
            .map_err(Into::into)
    }

    /// Aggregate statistics
    pub fn stats(&self) -> Result<DbStats> {
        let conn = self.lock_conn()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?;
        let detected: i64 = conn.query_row(
            "SELECT COUNT(*) FROM detections WHERE insect IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let notified: i64 = conn.query_row(
            "SELECT COUNT(*) FROM detections WHERE notified = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(DbStats { total, detected, notified })
    }

    /// All records, newest first (for `db export`)
    pub fn export_all(&self) -> Result<Vec<DetectionRecord>> {
        self.recent(i64::MAX as usize)
    }

    /// Vacuum database
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("VACUUM", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(detection: Detection, notified: bool) -> NewDetection {
        NewDetection {
            camera_name: "camara-finca".to_string(),
            filename: "camara-finca_ab12cd34_20250801-120000.jpg".to_string(),
            processed_filename: None,
            detection,
            environment: EnvironmentReading::default(),
            captured_at: Utc::now(),
            notified,
        }
    }

    #[test]
    fn insert_and_read_back() {
        let db = Database::in_memory().unwrap();
        let id = db
            .insert_detection(&sample(
                Detection::Insect {
                    label: "mosca_del_olivo".to_string(),
                    confidence: 0.91,
                },
                true,
            ))
            .unwrap();
        assert_eq!(id, 1);

        let records = db.recent(10).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.insect.as_deref(), Some("mosca_del_olivo"));
        assert_eq!(r.confidence, Some(0.91));
        assert!(r.notified);
    }

    #[test]
    fn confidence_absent_without_label() {
        let db = Database::in_memory().unwrap();
        db.insert_detection(&sample(Detection::None, false)).unwrap();

        let records = db.recent(10).unwrap();
        assert!(records[0].insect.is_none());
        assert!(records[0].confidence.is_none());
        assert!(!records[0].notified);
    }

    #[test]
    fn label_queries_and_counts() {
        let db = Database::in_memory().unwrap();
        for _ in 0..3 {
            db.insert_detection(&sample(
                Detection::Insect {
                    label: "abeja".to_string(),
                    confidence: 0.7,
                },
                false,
            ))
            .unwrap();
        }
        db.insert_detection(&sample(
            Detection::Insect {
                label: "hormiga".to_string(),
                confidence: 0.6,
            },
            false,
        ))
        .unwrap();
        db.insert_detection(&sample(Detection::None, false)).unwrap();

        assert_eq!(db.count().unwrap(), 5);
        assert_eq!(db.by_label("abeja", 10).unwrap().len(), 3);
        assert_eq!(db.without_label(10).unwrap().len(), 1);
        assert_eq!(db.labels().unwrap(), vec!["abeja", "hormiga"]);

        let counts = db.label_counts().unwrap();
        assert_eq!(counts[0], ("abeja".to_string(), 3));

        let stats = db.stats().unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.detected, 4);
        assert_eq!(stats.notified, 0);
    }

    #[test]
    fn poisoned_lock_surfaces_as_lock_error() {
        let db = Database::in_memory().unwrap();
        let poison = db.clone();
        std::thread::spawn(move || {
            let _guard = poison.conn.lock().unwrap();
            panic!("poison the connection lock");
        })
        .join()
        .unwrap_err();

        match db.count() {
            Err(BugwatchError::LockPoisoned) => {}
            other => panic!("expected LockPoisoned, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn environment_readings_round_trip() {
        let db = Database::in_memory().unwrap();
        let mut new = sample(Detection::None, false);
        new.environment = EnvironmentReading {
            temperature: Some(27.5),
            humidity: Some(40.0),
        };
        db.insert_detection(&new).unwrap();

        let r = &db.recent(1).unwrap()[0];
        assert_eq!(r.temperature, Some(27.5));
        assert_eq!(r.humidity, Some(40.0));
    }
}
