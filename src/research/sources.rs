//! Registered source files, downloaded and parsed on demand.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::services::{DocumentTextProvider, ObjectStore, ServiceError};
use crate::workflow::FileRegistryEntry;

/// The files of one run plus per-run download and text caches.
pub struct SourceLibrary {
    files: Vec<FileRegistryEntry>,
    bucket: String,
    store: Arc<dyn ObjectStore>,
    parser: Arc<dyn DocumentTextProvider>,
    downloads: Mutex<HashMap<Uuid, Bytes>>,
    texts: Mutex<HashMap<Uuid, Arc<str>>>,
}

impl SourceLibrary {
    pub fn new(
        files: Vec<FileRegistryEntry>,
        bucket: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        parser: Arc<dyn DocumentTextProvider>,
    ) -> Self {
        Self {
            files,
            bucket: bucket.into(),
            store,
            parser,
            downloads: Mutex::new(HashMap::new()),
            texts: Mutex::new(HashMap::new()),
        }
    }

    pub fn files(&self) -> &[FileRegistryEntry] {
        &self.files
    }

    pub fn file_names(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.file_name.as_str()).collect()
    }

    /// Exact case-insensitive match first, then substring.
    pub fn find(&self, name: &str) -> Option<&FileRegistryEntry> {
        let wanted = name.trim().to_lowercase();
        if wanted.is_empty() {
            return None;
        }
        self.files
            .iter()
            .find(|f| f.file_name.to_lowercase() == wanted)
            .or_else(|| {
                self.files
                    .iter()
                    .find(|f| f.file_name.to_lowercase().contains(&wanted))
            })
    }

    async fn download(&self, entry: &FileRegistryEntry) -> Result<Bytes, ServiceError> {
        if let Some(data) = self.downloads.lock().await.get(&entry.file_id) {
            return Ok(data.clone());
        }
        let data = self.store.download(&self.bucket, &entry.storage_path).await?;
        tracing::info!(
            "Downloaded {} ({} bytes) from {}",
            entry.file_name,
            data.len(),
            self.bucket
        );
        self.downloads
            .lock()
            .await
            .insert(entry.file_id, data.clone());
        Ok(data)
    }

    /// Extracted text of `entry`, parsed at most once per run.
    pub async fn text(&self, entry: &FileRegistryEntry) -> Result<Arc<str>, ServiceError> {
        if let Some(text) = self.texts.lock().await.get(&entry.file_id) {
            return Ok(text.clone());
        }
        let data = self.download(entry).await?;
        let text: Arc<str> = self
            .parser
            .parse(&data, &entry.file_type, &entry.file_name)
            .await?
            .into();
        self.texts.lock().await.insert(entry.file_id, text.clone());
        Ok(text)
    }
}
