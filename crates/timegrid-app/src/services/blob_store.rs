//! Blob storage abstraction for uploaded artifacts and result documents.
//!
//! Blobs are addressed by opaque, path-shaped keys chosen by the caller:
//! `uploads/{owner-or-anonymous}/{epoch-millis}-{sanitized-name}` for
//! artifacts and `results/{job_id}/extraction-result.json` for results.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::paths::{AppPaths, PathError};

/// Errors emitted by blob storage operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),

    #[error("invalid blob key `{0}`")]
    InvalidKey(String),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("io error for blob `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Compute the BLAKE3 content hash of an artifact, recorded on the job for
/// later integrity checks.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Build the upload key for an artifact.
pub fn upload_key(owner: Option<&str>, epoch_millis: i64, original_name: &str) -> String {
    let owner = owner
        .map(sanitize_segment)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "anonymous".to_string());
    let name = sanitize_segment(original_name);
    let name = if name.is_empty() { "artifact".to_string() } else { name };
    format!("uploads/{owner}/{epoch_millis}-{name}")
}

/// Build the result-document key for a job.
pub fn result_key(job_id: &str) -> String {
    debug_assert!(!job_id.is_empty());
    format!("results/{job_id}/extraction-result.json")
}

fn sanitize_segment(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Reject keys that are empty or would escape the store root.
pub fn validate_key(key: &str) -> Result<(), BlobError> {
    if key.is_empty() || key.starts_with('/') {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(BlobError::InvalidKey(key.to_string())),
        }
    }
    Ok(())
}

/// Trait abstracting over blob storage backends.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BlobError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    async fn delete(&self, key: &str) -> Result<(), BlobError>;
}

/// Filesystem-backed blob store. Writes land in a temp file first and are
/// renamed into place so readers never observe partial content.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(paths: &AppPaths) -> Result<Self, BlobError> {
        Ok(Self {
            root: paths.blobs_dir()?,
        })
    }

    pub fn at_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, BlobError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), BlobError> {
        let path = self.blob_path(key)?;
        let key_owned = key.to_string();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| BlobError::Io {
                    key: key_owned.clone(),
                    source,
                })?;
            }
            let tmp = path.with_extension("part");
            std::fs::write(&tmp, &bytes).map_err(|source| BlobError::Io {
                key: key_owned.clone(),
                source,
            })?;
            std::fs::rename(&tmp, &path).map_err(|source| BlobError::Io {
                key: key_owned.clone(),
                source,
            })?;
            Ok(())
        })
        .await
        .map_err(|join| BlobError::Io {
            key: key.to_string(),
            source: std::io::Error::other(join),
        })?
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.blob_path(key)?;
        let key_owned = key.to_string();
        tokio::task::spawn_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key_owned))
            }
            Err(source) => Err(BlobError::Io {
                key: key_owned,
                source,
            }),
        })
        .await
        .map_err(|join| BlobError::Io {
            key: key.to_string(),
            source: std::io::Error::other(join),
        })?
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.blob_path(key)?;
        let key_owned = key.to_string();
        tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BlobError::Io {
                key: key_owned,
                source,
            }),
        })
        .await
        .map_err(|join| BlobError::Io {
            key: key.to_string(),
            source: std::io::Error::other(join),
        })?
    }
}

/// In-memory blob store used by tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.lock().expect("blob mutex").contains_key(key)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), BlobError> {
        validate_key(key)?;
        self.blobs
            .lock()
            .expect("blob mutex")
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        validate_key(key)?;
        self.blobs
            .lock()
            .expect("blob mutex")
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        validate_key(key)?;
        self.blobs.lock().expect("blob mutex").remove(key);
        Ok(())
    }
}
