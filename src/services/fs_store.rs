//! Filesystem-backed object store.
//!
//! Buckets are directories under `{root}/storage/{bucket}`. Signed URLs are
//! `file://` URLs carrying an `expires` unix timestamp.

use super::{ObjectStore, ServiceError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let root = data_dir.as_ref().join("storage");
        tokio::fs::create_dir_all(&root).await?;
        let root = tokio::fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    /// Resolve `bucket/path`, rejecting anything that escapes the bucket.
    fn resolve(&self, bucket: &str, path: &str) -> Result<PathBuf, ServiceError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let safe = |p: &Path| p.components().all(|c| matches!(c, Component::Normal(_)));
        if bucket.is_empty() || !safe(Path::new(bucket)) || path.is_empty() || !safe(relative) {
            return Err(ServiceError::Storage(format!("Invalid object path: {}/{}", bucket, path)));
        }
        Ok(self.root.join(bucket).join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn download(&self, bucket: &str, path: &str) -> Result<Bytes, ServiceError> {
        let full = self.resolve(bucket, path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServiceError::NotFound(format!("{}/{}", bucket, path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ServiceError> {
        let full = self.resolve(bucket, path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, &data).await?;
        tracing::debug!(
            "Stored {}/{} ({} bytes, {})",
            bucket,
            path,
            data.len(),
            content_type
        );
        Ok(())
    }

    async fn signed_url(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String, ServiceError> {
        let full = self.resolve(bucket, path)?;
        if !tokio::fs::try_exists(&full).await? {
            return Err(ServiceError::NotFound(format!("{}/{}", bucket, path)));
        }
        let mut url = Url::from_file_path(&full)
            .map_err(|_| ServiceError::Storage(format!("Cannot build URL for {}", full.display())))?;
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        url.query_pairs_mut().append_pair("expires", &expires.to_string());
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_download_and_sign() {
        let tmp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(tmp.path()).await.unwrap();

        store
            .upload("generated-reports", "u1/r1/output.pdf", Bytes::from_static(b"%PDF-1.7"), "application/pdf")
            .await
            .unwrap();
        let data = store.download("generated-reports", "u1/r1/output.pdf").await.unwrap();
        assert_eq!(&data[..], b"%PDF-1.7");

        let url = store
            .signed_url("generated-reports", "u1/r1/output.pdf", Duration::from_secs(3600))
            .await
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.scheme(), "file");
        assert!(parsed.path().ends_with("/storage/generated-reports/u1/r1/output.pdf"));
        assert!(parsed.query_pairs().any(|(k, _)| k == "expires"));
    }

    #[tokio::test]
    async fn test_missing_and_escaping_paths() {
        let tmp = TempDir::new().unwrap();
        let store = LocalObjectStore::new(tmp.path()).await.unwrap();

        assert!(matches!(
            store.download("uploads", "nope.txt").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            store.download("uploads", "../../etc/passwd").await,
            Err(ServiceError::Storage(_))
        ));
        assert!(store
            .upload("../x", "a.txt", Bytes::new(), "text/plain")
            .await
            .is_err());
    }
}
