//! External collaborators of the workflow, behind narrow traits.
//!
//! Backends:
//! - `memory`: in-process fakes (non-persistent, for tests and embedding)
//! - `fs_store`: filesystem object store with `file://` signed URLs
//! - `sqlite`: report/source-file/generation-log records
//! - `command`: text extraction and rendering through external commands

mod command;
mod fs_store;
mod memory;
mod sqlite;

pub use command::{CommandRenderer, CommandTextProvider, RenderCommands};
pub use fs_store::LocalObjectStore;
pub use memory::{InMemoryObjectStore, InMemoryRecordStore, PlainTextProvider, ScriptedRenderer};
pub use sqlite::SqliteRecordStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::content::{GeneratedPresentation, GeneratedReport};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Text extraction failed: {0}")]
    Extraction(String),

    #[error("Rendering failed: {0}")]
    Render(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        ServiceError::Database(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServiceError::Database(format!("Task join error: {}", e))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// Caller-visible report status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Source file row as stored. Metadata may be incomplete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFileRecord {
    pub file_id: Uuid,
    pub file_name: Option<String>,
    pub extension: Option<String>,
    pub size_bytes: Option<u64>,
    pub storage_path: Option<String>,
}

/// Inputs read once when a run starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportInputs {
    pub source_files: Vec<SourceFileRecord>,
    /// Stored report configuration, as submitted
    pub config: serde_json::Value,
}

/// A rendered, uploaded output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub format: String,
    pub storage_path: String,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Projection written after every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: ReportStatus,
    pub progress: u8,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
}

/// Final record written by a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub title: String,
    pub generated_content: serde_json::Value,
    pub output_files: Vec<OutputFile>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub estimated_cost: f64,
    pub generation_time_secs: f64,
    pub completed_at: DateTime<Utc>,
}

/// One line of the generation audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationLogEntry {
    pub report_id: Uuid,
    pub user_id: Uuid,
    pub status: ReportStatus,
    pub error_message: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    pub duration_secs: f64,
    pub created_at: DateTime<Utc>,
}

/// A report waiting for the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReport {
    pub report_id: Uuid,
    pub user_id: Uuid,
    pub config: serde_json::Value,
}

/// Full report row, as a caller polling for progress sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub report_id: Uuid,
    pub user_id: Uuid,
    pub status: ReportStatus,
    pub progress: u8,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub title: Option<String>,
    pub config: serde_json::Value,
    pub generated_content: Option<serde_json::Value>,
    #[serde(default)]
    pub output_files: Vec<OutputFile>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub estimated_cost: f64,
    pub generation_time_secs: Option<f64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReportRecord {
    pub fn new(report_id: Uuid, user_id: Uuid, config: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            report_id,
            user_id,
            status: ReportStatus::Pending,
            progress: 0,
            status_message: None,
            error_message: None,
            title: None,
            config,
            generated_content: None,
            output_files: Vec::new(),
            total_input_tokens: 0,
            total_output_tokens: 0,
            estimated_cost: 0.0,
            generation_time_secs: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply_status(&mut self, update: &StatusUpdate) {
        self.status = update.status;
        self.progress = update.progress.min(100);
        if update.status_message.is_some() {
            self.status_message = update.status_message.clone();
        }
        self.error_message = update.error_message.clone();
        self.updated_at = Utc::now();
    }

    pub fn apply_completion(&mut self, record: &CompletionRecord) {
        self.status = ReportStatus::Completed;
        self.progress = 100;
        self.error_message = None;
        self.title = Some(record.title.clone());
        self.generated_content = Some(record.generated_content.clone());
        self.output_files = record.output_files.clone();
        self.total_input_tokens = record.total_input_tokens;
        self.total_output_tokens = record.total_output_tokens;
        self.estimated_cost = record.estimated_cost;
        self.generation_time_secs = Some(record.generation_time_secs);
        self.completed_at = Some(record.completed_at);
        self.updated_at = Utc::now();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Per-format text extraction.
#[async_trait]
pub trait DocumentTextProvider: Send + Sync {
    async fn parse(&self, data: &[u8], extension: &str, file_name: &str) -> Result<String, ServiceError>;
}

/// Bucketed blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, bucket: &str, path: &str) -> Result<Bytes, ServiceError>;

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ServiceError>;

    /// Time-limited download URL.
    async fn signed_url(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String, ServiceError>;
}

/// Report, source-file and generation-log records.
#[async_trait]
pub trait ReportRecordStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    async fn load_inputs(&self, report_id: Uuid) -> Result<ReportInputs, ServiceError>;

    async fn get_report(&self, report_id: Uuid) -> Result<Option<ReportRecord>, ServiceError>;

    async fn update_status(&self, report_id: Uuid, update: &StatusUpdate) -> Result<(), ServiceError>;

    async fn complete_report(
        &self,
        report_id: Uuid,
        record: &CompletionRecord,
    ) -> Result<(), ServiceError>;

    async fn log_generation(&self, entry: &GenerationLogEntry) -> Result<(), ServiceError>;

    /// Oldest pending reports first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<PendingReport>, ServiceError>;
}

/// Document writers.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render_pdf(&self, report: &GeneratedReport) -> Result<Bytes, ServiceError>;

    async fn render_docx(&self, report: &GeneratedReport) -> Result<Bytes, ServiceError>;

    async fn render_pptx(&self, presentation: &GeneratedPresentation) -> Result<Bytes, ServiceError>;
}
