//! SQLite-backed report record store.

use super::{
    CompletionRecord, GenerationLogEntry, PendingReport, ReportInputs, ReportRecord,
    ReportRecordStore, ReportStatus, ServiceError, SourceFileRecord, StatusUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS reports (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    progress INTEGER NOT NULL DEFAULT 0,
    status_message TEXT,
    error_message TEXT,
    title TEXT,
    config TEXT NOT NULL DEFAULT '{}',
    generated_content TEXT,
    output_files TEXT,
    total_input_tokens INTEGER NOT NULL DEFAULT 0,
    total_output_tokens INTEGER NOT NULL DEFAULT 0,
    estimated_cost REAL NOT NULL DEFAULT 0,
    generation_time_secs REAL,
    completed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reports_status_created ON reports(status, created_at);

CREATE TABLE IF NOT EXISTS source_files (
    id TEXT PRIMARY KEY NOT NULL,
    report_id TEXT NOT NULL,
    file_name TEXT,
    extension TEXT,
    size_bytes INTEGER,
    storage_path TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (report_id) REFERENCES reports(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_source_files_report ON source_files(report_id);

CREATE TABLE IF NOT EXISTS generation_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    report_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    estimated_cost REAL NOT NULL DEFAULT 0,
    duration_secs REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_generation_logs_report ON generation_logs(report_id);
"#;

const REPORT_COLUMNS: &str = "id, user_id, status, progress, status_message, error_message, title, \
     config, generated_content, output_files, total_input_tokens, total_output_tokens, \
     estimated_cost, generation_time_secs, completed_at, created_at, updated_at";

pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_json(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_report(row: &Row<'_>) -> rusqlite::Result<ReportRecord> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let status: String = row.get(2)?;
    let output_files: Option<String> = row.get(9)?;
    let completed_at: Option<String> = row.get(14)?;
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;

    Ok(ReportRecord {
        report_id: Uuid::parse_str(&id).unwrap_or_default(),
        user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
        status: ReportStatus::parse(&status),
        progress: row.get::<_, i64>(3)?.clamp(0, 100) as u8,
        status_message: row.get(4)?,
        error_message: row.get(5)?,
        title: row.get(6)?,
        config: parse_json(row.get(7)?).unwrap_or_else(|| serde_json::json!({})),
        generated_content: parse_json(row.get(8)?),
        output_files: output_files
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        total_input_tokens: row.get::<_, i64>(10)?.max(0) as u64,
        total_output_tokens: row.get::<_, i64>(11)?.max(0) as u64,
        estimated_cost: row.get(12)?,
        generation_time_secs: row.get(13)?,
        completed_at: completed_at.as_deref().map(parse_time),
        created_at: parse_time(&created_at),
        updated_at: parse_time(&updated_at),
    })
}

impl SqliteRecordStore {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, ServiceError>(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, ServiceError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a pending report and its source files.
    pub async fn create_report(
        &self,
        report_id: Uuid,
        user_id: Uuid,
        config: &serde_json::Value,
        files: &[SourceFileRecord],
    ) -> Result<(), ServiceError> {
        let conn = self.conn.clone();
        let config = config.to_string();
        let files = files.to_vec();
        let now = Utc::now().to_rfc3339();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO reports (id, user_id, status, config, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?4)",
                params![report_id.to_string(), user_id.to_string(), config, now],
            )?;
            for file in &files {
                tx.execute(
                    "INSERT INTO source_files (id, report_id, file_name, extension, size_bytes, storage_path, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        file.file_id.to_string(),
                        report_id.to_string(),
                        file.file_name,
                        file.extension,
                        file.size_bytes.map(|s| s as i64),
                        file.storage_path,
                        now
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    /// Generation log entries for a report, oldest first.
    pub async fn generation_logs(&self, report_id: Uuid) -> Result<Vec<GenerationLogEntry>, ServiceError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT report_id, user_id, status, error_message, input_tokens, output_tokens,
                        estimated_cost, duration_secs, created_at
                 FROM generation_logs WHERE report_id = ?1 ORDER BY id ASC",
            )?;
            let entries = stmt
                .query_map(params![report_id.to_string()], |row| {
                    let report_id: String = row.get(0)?;
                    let user_id: String = row.get(1)?;
                    let status: String = row.get(2)?;
                    let created_at: String = row.get(8)?;
                    Ok(GenerationLogEntry {
                        report_id: Uuid::parse_str(&report_id).unwrap_or_default(),
                        user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
                        status: ReportStatus::parse(&status),
                        error_message: row.get(3)?,
                        input_tokens: row.get::<_, i64>(4)?.max(0) as u64,
                        output_tokens: row.get::<_, i64>(5)?.max(0) as u64,
                        estimated_cost: row.get(6)?,
                        duration_secs: row.get(7)?,
                        created_at: parse_time(&created_at),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await?
    }
}

#[async_trait]
impl ReportRecordStore for SqliteRecordStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn load_inputs(&self, report_id: Uuid) -> Result<ReportInputs, ServiceError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let id = report_id.to_string();

            let config: Option<String> = conn
                .query_row("SELECT config FROM reports WHERE id = ?1", params![id], |row| row.get(0))
                .optional()?;
            let config = config.ok_or_else(|| ServiceError::NotFound(format!("report {}", report_id)))?;

            let mut stmt = conn.prepare(
                "SELECT id, file_name, extension, size_bytes, storage_path
                 FROM source_files WHERE report_id = ?1 ORDER BY created_at ASC, rowid ASC",
            )?;
            let source_files = stmt
                .query_map(params![id], |row| {
                    let file_id: String = row.get(0)?;
                    Ok(SourceFileRecord {
                        file_id: Uuid::parse_str(&file_id).unwrap_or_default(),
                        file_name: row.get(1)?,
                        extension: row.get(2)?,
                        size_bytes: row.get::<_, Option<i64>>(3)?.map(|s| s.max(0) as u64),
                        storage_path: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(ReportInputs {
                source_files,
                config: serde_json::from_str(&config).unwrap_or_else(|_| serde_json::json!({})),
            })
        })
        .await?
    }

    async fn get_report(&self, report_id: Uuid) -> Result<Option<ReportRecord>, ServiceError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let report = conn
                .query_row(
                    &format!("SELECT {} FROM reports WHERE id = ?1", REPORT_COLUMNS),
                    params![report_id.to_string()],
                    row_to_report,
                )
                .optional()?;
            Ok(report)
        })
        .await?
    }

    async fn update_status(&self, report_id: Uuid, update: &StatusUpdate) -> Result<(), ServiceError> {
        let conn = self.conn.clone();
        let update = update.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let changed = conn.execute(
                "UPDATE reports
                 SET status = ?2, progress = ?3,
                     status_message = COALESCE(?4, status_message),
                     error_message = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    report_id.to_string(),
                    update.status.as_str(),
                    update.progress.min(100) as i64,
                    update.status_message,
                    update.error_message,
                    Utc::now().to_rfc3339()
                ],
            )?;
            if changed == 0 {
                return Err(ServiceError::NotFound(format!("report {}", report_id)));
            }
            Ok(())
        })
        .await?
    }

    async fn complete_report(
        &self,
        report_id: Uuid,
        record: &CompletionRecord,
    ) -> Result<(), ServiceError> {
        let conn = self.conn.clone();
        let content = record.generated_content.to_string();
        let outputs = serde_json::to_string(&record.output_files)
            .map_err(|e| ServiceError::Database(format!("Failed to serialize outputs: {}", e)))?;
        let record = record.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let changed = conn.execute(
                "UPDATE reports
                 SET status = 'completed', progress = 100, error_message = NULL,
                     title = ?2, generated_content = ?3, output_files = ?4,
                     total_input_tokens = ?5, total_output_tokens = ?6, estimated_cost = ?7,
                     generation_time_secs = ?8, completed_at = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    report_id.to_string(),
                    record.title,
                    content,
                    outputs,
                    record.total_input_tokens as i64,
                    record.total_output_tokens as i64,
                    record.estimated_cost,
                    record.generation_time_secs,
                    record.completed_at.to_rfc3339(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            if changed == 0 {
                return Err(ServiceError::NotFound(format!("report {}", report_id)));
            }
            Ok(())
        })
        .await?
    }

    async fn log_generation(&self, entry: &GenerationLogEntry) -> Result<(), ServiceError> {
        let conn = self.conn.clone();
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO generation_logs
                     (report_id, user_id, status, error_message, input_tokens, output_tokens,
                      estimated_cost, duration_secs, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.report_id.to_string(),
                    entry.user_id.to_string(),
                    entry.status.as_str(),
                    entry.error_message,
                    entry.input_tokens as i64,
                    entry.output_tokens as i64,
                    entry.estimated_cost,
                    entry.duration_secs,
                    entry.created_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<PendingReport>, ServiceError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, user_id, config FROM reports
                 WHERE status = 'pending'
                 ORDER BY created_at ASC
                 LIMIT ?1",
            )?;
            let pending = stmt
                .query_map(params![limit as i64], |row| {
                    let id: String = row.get(0)?;
                    let user_id: String = row.get(1)?;
                    let config: String = row.get(2)?;
                    Ok(PendingReport {
                        report_id: Uuid::parse_str(&id).unwrap_or_default(),
                        user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
                        config: serde_json::from_str(&config).unwrap_or_else(|_| serde_json::json!({})),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(pending)
        })
        .await?
    }
}
