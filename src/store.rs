use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Durable copy of a test job, as the history endpoints see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    pub id: String,
    pub user_id: String,
    pub test_type: String,
    pub url: String,
    pub config: serde_json::Value,
    pub status: String,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub results: Option<serde_json::Value>,
    pub overall_score: Option<f64>,
    pub total_requests: Option<i64>,
    pub successful_requests: Option<i64>,
    pub failed_requests: Option<i64>,
    pub error: Option<String>,
}

/// Fields written once when a job reaches a terminal status.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalUpdate {
    pub status: String,
    pub end_time: DateTime<Utc>,
    pub duration: Option<f64>,
    pub results: Option<serde_json::Value>,
    pub overall_score: Option<f64>,
    pub total_requests: Option<i64>,
    pub successful_requests: Option<i64>,
    pub failed_requests: Option<i64>,
    pub error: Option<String>,
}

pub struct RecordDb {
    conn: Mutex<Connection>,
}

impl RecordDb {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        db.mark_interrupted()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS test_records (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                test_type TEXT NOT NULL,
                url TEXT NOT NULL,
                config TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                submitted_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                duration REAL,
                results TEXT,
                overall_score REAL,
                total_requests INTEGER,
                successful_requests INTEGER,
                failed_requests INTEGER,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_records_user ON test_records(user_id);
            CREATE INDEX IF NOT EXISTS idx_records_status ON test_records(status);
        ",
        )?;
        Ok(())
    }

    /// Records left queued or running by a previous process can never finish.
    fn mark_interrupted(&self) -> anyhow::Result<()> {
        let n = self.conn().execute(
            "UPDATE test_records SET status = 'interrupted', ended_at = ?1
             WHERE status IN ('queued', 'running')",
            params![Utc::now().to_rfc3339()],
        )?;
        if n > 0 {
            info!("Marked {} stale test records as interrupted", n);
        }
        Ok(())
    }

    pub fn insert_record(&self, record: &TestRecord) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT INTO test_records
                (id, user_id, test_type, url, config, status, submitted_at, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.user_id,
                record.test_type,
                record.url,
                record.config.to_string(),
                record.status,
                record.submitted_at.to_rfc3339(),
                record.started_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// queued -> running. Returns false if the record was not queued.
    pub fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> anyhow::Result<bool> {
        let n = self.conn().execute(
            "UPDATE test_records SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'queued'",
            params![id, started_at.to_rfc3339()],
        )?;
        Ok(n == 1)
    }

    /// Write the terminal outcome. A record that is already terminal is left
    /// untouched and `Ok(false)` is returned.
    pub fn update_test_record(&self, id: &str, update: &TerminalUpdate) -> anyhow::Result<bool> {
        let n = self.conn().execute(
            "UPDATE test_records SET
                status = ?2, ended_at = ?3, duration = ?4, results = ?5,
                overall_score = ?6, total_requests = ?7, successful_requests = ?8,
                failed_requests = ?9, error = ?10
             WHERE id = ?1 AND status IN ('queued', 'running')",
            params![
                id,
                update.status,
                update.end_time.to_rfc3339(),
                update.duration,
                update.results.as_ref().map(|v| v.to_string()),
                update.overall_score,
                update.total_requests,
                update.successful_requests,
                update.failed_requests,
                update.error,
            ],
        )?;
        Ok(n == 1)
    }

    pub fn get_record(&self, id: &str) -> anyhow::Result<Option<TestRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT id, user_id, test_type, url, config, status, submitted_at,
                        started_at, ended_at, duration, results, overall_score,
                        total_requests, successful_requests, failed_requests, error
                 FROM test_records WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn status_counts(&self) -> anyhow::Result<BTreeMap<String, i64>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM test_records GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

fn parse_time(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn parse_json(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TestRecord> {
    Ok(TestRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        test_type: row.get(2)?,
        url: row.get(3)?,
        config: parse_json(row.get(4)?).unwrap_or(serde_json::Value::Null),
        status: row.get(5)?,
        submitted_at: parse_time(row.get(6)?).unwrap_or_default(),
        started_at: parse_time(row.get(7)?),
        ended_at: parse_time(row.get(8)?),
        duration: row.get(9)?,
        results: parse_json(row.get(10)?),
        overall_score: row.get(11)?,
        total_requests: row.get(12)?,
        successful_requests: row.get(13)?,
        failed_requests: row.get(14)?,
        error: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> TestRecord {
        TestRecord {
            id: id.to_string(),
            user_id: "u1".to_string(),
            test_type: "load".to_string(),
            url: "https://example.com".to_string(),
            config: json!({"users": 5}),
            status: "queued".to_string(),
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration: None,
            results: None,
            overall_score: None,
            total_requests: None,
            successful_requests: None,
            failed_requests: None,
            error: None,
        }
    }

    fn terminal(status: &str) -> TerminalUpdate {
        TerminalUpdate {
            status: status.to_string(),
            end_time: Utc::now(),
            duration: Some(12.5),
            results: Some(json!({"grade": "A"})),
            overall_score: Some(95.0),
            total_requests: Some(100),
            successful_requests: Some(99),
            failed_requests: Some(1),
            error: None,
        }
    }

    #[test]
    fn test_lifecycle_writes_terminal_once() {
        let db = RecordDb::in_memory().unwrap();
        db.insert_record(&record("j1")).unwrap();
        assert!(db.mark_running("j1", Utc::now()).unwrap());
        assert!(!db.mark_running("j1", Utc::now()).unwrap());

        assert!(db.update_test_record("j1", &terminal("cancelled")).unwrap());
        // a late completion must not overwrite the cancel
        assert!(!db.update_test_record("j1", &terminal("completed")).unwrap());

        let stored = db.get_record("j1").unwrap().unwrap();
        assert_eq!(stored.status, "cancelled");
        assert_eq!(stored.total_requests, Some(100));
        assert_eq!(stored.results, Some(json!({"grade": "A"})));
        assert!(stored.started_at.is_some());
    }

    #[test]
    fn test_unknown_record() {
        let db = RecordDb::in_memory().unwrap();
        assert!(db.get_record("missing").unwrap().is_none());
        assert!(!db.update_test_record("missing", &terminal("failed")).unwrap());
    }

    #[test]
    fn test_reopen_marks_unfinished_records_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        {
            let db = RecordDb::open(&path).unwrap();
            db.insert_record(&record("queued")).unwrap();
            db.insert_record(&record("running")).unwrap();
            db.mark_running("running", Utc::now()).unwrap();
            db.insert_record(&record("done")).unwrap();
            db.update_test_record("done", &terminal("completed")).unwrap();
        }

        let db = RecordDb::open(&path).unwrap();
        let counts = db.status_counts().unwrap();
        assert_eq!(counts.get("interrupted"), Some(&2));
        assert_eq!(counts.get("completed"), Some(&1));
    }
}
