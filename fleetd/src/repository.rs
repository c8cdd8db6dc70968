//! Durable task metadata, execution logs and connection records (SQLite).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use fleet_common::{TaskLog, TaskRecord};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("invalid record: {0}")]
    Invalid(String),
}

/// Live connection bookkeeping row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub client_ip: String,
    pub connection_time: DateTime<Utc>,
    pub auth_code: String,
    pub auth_expiration: DateTime<Utc>,
}

pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepoError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| RepoError::Invalid(format!("timestamp '{raw}': {err}")))
}

fn task_record_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        task_id: row.get("task_id")?,
        client_ip: row.get("client_ip")?,
        script_path: row.get("script_path")?,
        remarks: row.get("remarks")?,
        crond_expression: row.get("crond_expression")?,
        status: row.get("status")?,
        file_id: row.get("file_id")?,
    })
}

struct RawLog {
    log_id: i64,
    client_ip: String,
    task_id: String,
    execution_time: String,
    completion_time: String,
    output: String,
    remarks: String,
    success: bool,
    exit_code: Option<i32>,
}

impl RawLog {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            log_id: row.get("log_id")?,
            client_ip: row.get("client_ip")?,
            task_id: row.get("task_id")?,
            execution_time: row.get("execution_time")?,
            completion_time: row.get("completion_time")?,
            output: row.get("output")?,
            remarks: row.get("remarks")?,
            success: row.get("success")?,
            exit_code: row.get("exit_code")?,
        })
    }

    fn into_log(self) -> Result<TaskLog, RepoError> {
        Ok(TaskLog {
            log_id: Some(self.log_id),
            client_ip: self.client_ip,
            task_id: self.task_id,
            execution_time: parse_timestamp(&self.execution_time)?,
            completion_time: parse_timestamp(&self.completion_time)?,
            output: self.output,
            remarks: self.remarks,
            success: self.success,
            exit_code: self.exit_code,
        })
    }
}

impl SqliteRepository {
    pub fn open(path: &Path) -> Result<Self, RepoError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, RepoError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RepoError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS task_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                client_ip TEXT NOT NULL,
                script_path TEXT,
                remarks TEXT,
                crond_expression TEXT,
                status TEXT,
                file_id INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_task_records_task_id ON task_records(task_id);

            CREATE TABLE IF NOT EXISTS client_task_logs (
                log_id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_ip TEXT NOT NULL,
                task_id TEXT NOT NULL,
                execution_time TEXT NOT NULL,
                completion_time TEXT NOT NULL,
                output TEXT NOT NULL,
                remarks TEXT NOT NULL DEFAULT '',
                success INTEGER NOT NULL DEFAULT 1,
                exit_code INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_client_task_logs_task_id ON client_task_logs(task_id);

            CREATE TABLE IF NOT EXISTS client_server_connections (
                client_ip TEXT PRIMARY KEY,
                connection_time TEXT NOT NULL,
                auth_code TEXT NOT NULL,
                auth_expiration TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn insert_task_record(&self, record: &TaskRecord) -> Result<i64, RepoError> {
        if record.task_id.is_empty() || record.client_ip.is_empty() {
            return Err(RepoError::Invalid(
                "task record needs task_id and client_ip".to_string(),
            ));
        }
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO task_records
                (task_id, client_ip, script_path, remarks, crond_expression, status, file_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.task_id,
                record.client_ip,
                record.script_path,
                record.remarks,
                record.crond_expression,
                record.status,
                record.file_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn task_record(&self, task_id: &str) -> Result<Option<TaskRecord>, RepoError> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT * FROM task_records WHERE task_id = ?1 ORDER BY id DESC LIMIT 1",
                params![task_id],
                task_record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Batch lookup; rows that fail to map are skipped with a warning.
    pub async fn task_records(&self, task_ids: &[String]) -> Result<Vec<TaskRecord>, RepoError> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=task_ids.len())
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT * FROM task_records WHERE task_id IN ({placeholders}) ORDER BY id");

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(task_ids.iter()), task_record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            match row {
                Ok(record) => records.push(record),
                Err(err) => warn!("Skipping malformed task record row: {}", err),
            }
        }
        Ok(records)
    }

    /// Newest row of every task id; malformed rows are skipped with a warning.
    pub async fn latest_task_records(&self) -> Result<Vec<TaskRecord>, RepoError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM task_records
             WHERE id IN (SELECT MAX(id) FROM task_records GROUP BY task_id)
             ORDER BY id",
        )?;
        let rows = stmt.query_map([], task_record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            match row {
                Ok(record) => records.push(record),
                Err(err) => warn!("Skipping malformed task record row: {}", err),
            }
        }
        Ok(records)
    }

    /// Mirrors a status change onto the stored rows of `task_id`.
    pub async fn update_task_status(&self, task_id: &str, status: &str) -> Result<usize, RepoError> {
        let conn = self.conn.lock().await;
        Ok(conn.execute(
            "UPDATE task_records SET status = ?2 WHERE task_id = ?1",
            params![task_id, status],
        )?)
    }

    pub async fn delete_task_records(&self, task_id: &str) -> Result<usize, RepoError> {
        let conn = self.conn.lock().await;
        Ok(conn.execute("DELETE FROM task_records WHERE task_id = ?1", params![task_id])?)
    }

    pub async fn insert_task_log(&self, log: &TaskLog) -> Result<i64, RepoError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO client_task_logs
                (client_ip, task_id, execution_time, completion_time, output, remarks, success, exit_code)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                log.client_ip,
                log.task_id,
                timestamp(&log.execution_time),
                timestamp(&log.completion_time),
                log.output,
                log.remarks,
                log.success,
                log.exit_code,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn task_logs(&self, task_id: &str) -> Result<Vec<TaskLog>, RepoError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM client_task_logs WHERE task_id = ?1 ORDER BY log_id")?;
        let rows = stmt.query_map(params![task_id], RawLog::from_row)?;

        let mut logs = Vec::new();
        for row in rows {
            match row.map_err(RepoError::from).and_then(RawLog::into_log) {
                Ok(log) => logs.push(log),
                Err(err) => warn!("Skipping malformed task log row: {}", err),
            }
        }
        Ok(logs)
    }

    pub async fn upsert_connection(
        &self,
        client_ip: &str,
        auth_code: &str,
        auth_expiration: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO client_server_connections (client_ip, connection_time, auth_code, auth_expiration)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(client_ip) DO UPDATE SET
                connection_time = excluded.connection_time,
                auth_code = excluded.auth_code,
                auth_expiration = excluded.auth_expiration",
            params![
                client_ip,
                timestamp(&Utc::now()),
                auth_code,
                timestamp(&auth_expiration),
            ],
        )?;
        Ok(())
    }

    pub async fn delete_connection(&self, client_ip: &str) -> Result<bool, RepoError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM client_server_connections WHERE client_ip = ?1",
            params![client_ip],
        )?;
        Ok(removed > 0)
    }

    pub async fn connection(&self, client_ip: &str) -> Result<Option<ConnectionRecord>, RepoError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT client_ip, connection_time, auth_code, auth_expiration
                 FROM client_server_connections WHERE client_ip = ?1",
                params![client_ip],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        raw.map(|(client_ip, connected, auth_code, expires)| {
            Ok(ConnectionRecord {
                client_ip,
                connection_time: parse_timestamp(&connected)?,
                auth_code,
                auth_expiration: parse_timestamp(&expires)?,
            })
        })
        .transpose()
    }

    pub async fn count_task_records(&self) -> Result<i64, RepoError> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row("SELECT COUNT(*) FROM task_records", [], |row| row.get(0))?)
    }

    pub async fn count_task_logs(&self) -> Result<i64, RepoError> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row("SELECT COUNT(*) FROM client_task_logs", [], |row| row.get(0))?)
    }
}
