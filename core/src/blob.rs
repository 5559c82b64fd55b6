//! Blob store for uploaded YAML artifacts
//!
//! Append-once, delete-by-id storage keyed by opaque ids. Writes are
//! exclusive per id; reads are unlocked. Durability is pluggable behind the
//! trait; the filesystem implementation lays blobs out as
//! `blob_store/{id}.yaml` in plain UTF-8.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{HarveyError, Result};

/// Upload size cap
pub const MAX_BLOB_BYTES: usize = 1024 * 1024;

const ALLOWED_MIME: [&str; 3] = ["application/yaml", "text/yaml", "text/plain"];

/// Handle returned by a successful upload
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub id: String,
    pub filename: String,
}

/// Durable artifact storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, filename: &str, content_type: &str, bytes: &[u8]) -> Result<StoredBlob>;
    async fn get(&self, id: &str) -> Result<Vec<u8>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Filesystem-backed blob store
pub struct FsBlobStore {
    dir: PathBuf,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FsBlobStore {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            HarveyError::ConfigError {
                message: format!("cannot create blob directory {}: {e}", dir.display()),
            }
        })?;
        Ok(Self {
            dir,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        // Ids are minted here as UUIDs; anything else cannot name a blob.
        Uuid::parse_str(id).map_err(|_| HarveyError::NotFound { id: id.to_string() })?;
        Ok(self.dir.join(format!("{id}.yaml")))
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .lock()
            .await
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, filename: &str, content_type: &str, bytes: &[u8]) -> Result<StoredBlob> {
        if !ALLOWED_MIME.contains(&content_type) {
            return Err(HarveyError::BadRequest {
                message: format!(
                    "unsupported content type '{content_type}'; expected one of {}",
                    ALLOWED_MIME.join(", ")
                ),
            });
        }
        if bytes.len() > MAX_BLOB_BYTES {
            return Err(HarveyError::BadRequest {
                message: format!(
                    "upload of {} bytes exceeds the {MAX_BLOB_BYTES} byte limit",
                    bytes.len()
                ),
            });
        }
        if std::str::from_utf8(bytes).is_err() {
            return Err(HarveyError::BadRequest {
                message: "uploaded YAML must be UTF-8 text".into(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let path = self.path_for(&id)?;
        let lock = self.lock_for(&id).await;
        let _guard = lock.lock().await;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| HarveyError::internal(format!("failed to store blob: {e}")))?;
        info!(%id, filename, bytes = bytes.len(), "blob stored");
        Ok(StoredBlob {
            id,
            filename: filename.to_string(),
        })
    }

    async fn get(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HarveyError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(HarveyError::internal(format!("failed to read blob: {e}"))),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(%id, "blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HarveyError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(HarveyError::internal(format!("failed to delete blob: {e}"))),
        }
    }
}
