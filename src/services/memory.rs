//! In-memory service implementations (non-persistent).

use super::{
    CompletionRecord, DocumentTextProvider, GenerationLogEntry, ObjectStore, PendingReport,
    Renderer, ReportInputs, ReportRecord, ReportRecordStore, ReportStatus, ServiceError,
    SourceFileRecord, StatusUpdate,
};
use crate::content::{GeneratedPresentation, GeneratedReport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Record store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    reports: Arc<RwLock<HashMap<Uuid, ReportRecord>>>,
    files: Arc<RwLock<HashMap<Uuid, Vec<SourceFileRecord>>>>,
    logs: Arc<RwLock<Vec<GenerationLogEntry>>>,
    history: Arc<RwLock<Vec<(Uuid, StatusUpdate)>>>,
    fail_completion: Arc<AtomicBool>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending report with its source files.
    pub async fn insert_report(
        &self,
        report_id: Uuid,
        user_id: Uuid,
        config: serde_json::Value,
        files: Vec<SourceFileRecord>,
    ) {
        self.reports
            .write()
            .await
            .insert(report_id, ReportRecord::new(report_id, user_id, config));
        self.files.write().await.insert(report_id, files);
    }

    /// Every status update written for `report_id`, in order.
    pub async fn status_history(&self, report_id: Uuid) -> Vec<StatusUpdate> {
        self.history
            .read()
            .await
            .iter()
            .filter(|(id, _)| *id == report_id)
            .map(|(_, u)| u.clone())
            .collect()
    }

    pub async fn generation_logs(&self) -> Vec<GenerationLogEntry> {
        self.logs.read().await.clone()
    }

    /// Make `complete_report` fail, to exercise persistence errors.
    pub fn set_fail_completion(&self, fail: bool) {
        self.fail_completion.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReportRecordStore for InMemoryRecordStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn load_inputs(&self, report_id: Uuid) -> Result<ReportInputs, ServiceError> {
        let reports = self.reports.read().await;
        let report = reports
            .get(&report_id)
            .ok_or_else(|| ServiceError::NotFound(format!("report {}", report_id)))?;
        let source_files = self
            .files
            .read()
            .await
            .get(&report_id)
            .cloned()
            .unwrap_or_default();
        Ok(ReportInputs {
            source_files,
            config: report.config.clone(),
        })
    }

    async fn get_report(&self, report_id: Uuid) -> Result<Option<ReportRecord>, ServiceError> {
        Ok(self.reports.read().await.get(&report_id).cloned())
    }

    async fn update_status(&self, report_id: Uuid, update: &StatusUpdate) -> Result<(), ServiceError> {
        let mut reports = self.reports.write().await;
        let report = reports
            .get_mut(&report_id)
            .ok_or_else(|| ServiceError::NotFound(format!("report {}", report_id)))?;
        report.apply_status(update);
        self.history.write().await.push((report_id, update.clone()));
        Ok(())
    }

    async fn complete_report(
        &self,
        report_id: Uuid,
        record: &CompletionRecord,
    ) -> Result<(), ServiceError> {
        if self.fail_completion.load(Ordering::SeqCst) {
            return Err(ServiceError::Database("completion write rejected".to_string()));
        }
        let mut reports = self.reports.write().await;
        let report = reports
            .get_mut(&report_id)
            .ok_or_else(|| ServiceError::NotFound(format!("report {}", report_id)))?;
        report.apply_completion(record);
        Ok(())
    }

    async fn log_generation(&self, entry: &GenerationLogEntry) -> Result<(), ServiceError> {
        self.logs.write().await.push(entry.clone());
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<PendingReport>, ServiceError> {
        let mut pending: Vec<ReportRecord> = self
            .reports
            .read()
            .await
            .values()
            .filter(|r| r.status == ReportStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending
            .into_iter()
            .take(limit)
            .map(|r| PendingReport {
                report_id: r.report_id,
                user_id: r.user_id,
                config: r.config,
            })
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Object store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
}

#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    downloads: Arc<AtomicUsize>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(bucket: &str, path: &str) -> String {
        format!("{}/{}", bucket, path.trim_start_matches('/'))
    }

    pub async fn get(&self, bucket: &str, path: &str) -> Option<(Bytes, String)> {
        self.objects
            .read()
            .await
            .get(&Self::key(bucket, path))
            .map(|o| (o.data.clone(), o.content_type.clone()))
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn download(&self, bucket: &str, path: &str) -> Result<Bytes, ServiceError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.objects
            .read()
            .await
            .get(&Self::key(bucket, path))
            .map(|o| o.data.clone())
            .ok_or_else(|| ServiceError::NotFound(Self::key(bucket, path)))
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ServiceError> {
        self.objects.write().await.insert(
            Self::key(bucket, path),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn signed_url(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String, ServiceError> {
        let key = Self::key(bucket, path);
        if !self.objects.read().await.contains_key(&key) {
            return Err(ServiceError::NotFound(key));
        }
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("memory://{}?expires={}", key, expires))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Text extraction
// ─────────────────────────────────────────────────────────────────────────────

/// Decodes every file as UTF-8 text. Named files can be made to fail.
#[derive(Clone, Default)]
pub struct PlainTextProvider {
    failing: HashSet<String>,
    parses: Arc<AtomicUsize>,
}

impl PlainTextProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, file_name: impl Into<String>) -> Self {
        self.failing.insert(file_name.into());
        self
    }

    pub fn parse_count(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentTextProvider for PlainTextProvider {
    async fn parse(&self, data: &[u8], _extension: &str, file_name: &str) -> Result<String, ServiceError> {
        self.parses.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(file_name) {
            return Err(ServiceError::Extraction(format!("cannot parse {}", file_name)));
        }
        Ok(String::from_utf8_lossy(data).into_owned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rendering
// ─────────────────────────────────────────────────────────────────────────────

/// Renders placeholder bytes and records which formats were requested.
#[derive(Clone, Default)]
pub struct ScriptedRenderer {
    failing: HashSet<String>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, format: impl Into<String>) -> Self {
        self.failing.insert(format.into());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn render(&self, format: &str, title: &str) -> Result<Bytes, ServiceError> {
        match self.calls.lock() {
            Ok(mut calls) => calls.push(format.to_string()),
            Err(poisoned) => poisoned.into_inner().push(format.to_string()),
        }
        if self.failing.contains(format) {
            return Err(ServiceError::Render(format!("{} renderer crashed", format)));
        }
        Ok(Bytes::from(format!("{}:{}", format, title)))
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn render_pdf(&self, report: &GeneratedReport) -> Result<Bytes, ServiceError> {
        self.render("pdf", &report.title)
    }

    async fn render_docx(&self, report: &GeneratedReport) -> Result<Bytes, ServiceError> {
        self.render("docx", &report.title)
    }

    async fn render_pptx(&self, presentation: &GeneratedPresentation) -> Result<Bytes, ServiceError> {
        self.render("pptx", &presentation.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_record_store_lifecycle() {
        let store = InMemoryRecordStore::new();
        let (report_id, user_id) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .insert_report(report_id, user_id, json!({"title": "Q3"}), vec![])
            .await;

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].config["title"], "Q3");

        store
            .update_status(
                report_id,
                &StatusUpdate {
                    status: ReportStatus::Processing,
                    progress: 10,
                    status_message: Some("Registering".to_string()),
                    error_message: None,
                },
            )
            .await
            .unwrap();
        assert!(store.list_pending(10).await.unwrap().is_empty());
        assert_eq!(store.status_history(report_id).await.len(), 1);

        let missing = store.load_inputs(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_object_store_signed_url() {
        let store = InMemoryObjectStore::new();
        store
            .upload("out", "u/r/output.pdf", Bytes::from_static(b"%PDF"), "application/pdf")
            .await
            .unwrap();
        let url = store
            .signed_url("out", "u/r/output.pdf", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("memory://out/u/r/output.pdf?expires="));
        assert!(store.signed_url("out", "missing", Duration::from_secs(1)).await.is_err());
        assert_eq!(store.get("out", "u/r/output.pdf").await.unwrap().1, "application/pdf");
    }
}
