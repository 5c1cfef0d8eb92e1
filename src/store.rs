use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::session::UploadSession;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("session store failed to {operation} `{upload_id}`: {message}")]
pub struct SessionStoreError {
    pub operation: &'static str,
    pub upload_id: String,
    pub message: String,
}

impl SessionStoreError {
    pub fn new(
        operation: &'static str,
        upload_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            upload_id: upload_id.into(),
            message: message.into(),
        }
    }
}

/// Persistence for upload sessions so an upload can be resumed by id after a
/// pause, an abort or a process restart.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, upload_id: &str)
    -> Result<Option<UploadSession>, SessionStoreError>;

    async fn save_session(&self, session: &UploadSession) -> Result<(), SessionStoreError>;

    /// Deleting an unknown id is not an error.
    async fn delete_session(&self, upload_id: &str) -> Result<(), SessionStoreError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, UploadSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, upload_id: &str) -> bool {
        lock_unpoisoned(&self.sessions).contains_key(upload_id)
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.sessions).is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_session(
        &self,
        upload_id: &str,
    ) -> Result<Option<UploadSession>, SessionStoreError> {
        Ok(lock_unpoisoned(&self.sessions).get(upload_id).cloned())
    }

    async fn save_session(&self, session: &UploadSession) -> Result<(), SessionStoreError> {
        lock_unpoisoned(&self.sessions).insert(session.upload_id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, upload_id: &str) -> Result<(), SessionStoreError> {
        lock_unpoisoned(&self.sessions).remove(upload_id);
        Ok(())
    }
}

/// One pretty-printed JSON file per session inside `directory`. Writes go to
/// a temporary file first and are renamed into place.
#[derive(Clone, Debug)]
pub struct FileSessionStore {
    directory: PathBuf,
}

impl FileSessionStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn session_path(&self, upload_id: &str) -> PathBuf {
        self.directory
            .join(format!("{}.json", sanitize_file_stem(upload_id)))
    }
}

/// Distinct ids always map to distinct stems: bytes outside
/// `[A-Za-z0-9.-]`, `_` included, are written as `_xx`.
fn sanitize_file_stem(upload_id: &str) -> String {
    let mut stem = String::with_capacity(upload_id.len());
    for byte in upload_id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.') {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02x}"));
        }
    }
    stem
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load_session(
        &self,
        upload_id: &str,
    ) -> Result<Option<UploadSession>, SessionStoreError> {
        let raw = match tokio::fs::read(self.session_path(upload_id)).await {
            Ok(raw) => raw,
            Err(source) if source.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SessionStoreError::new("read", upload_id, source.to_string())),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| SessionStoreError::new("decode", upload_id, source.to_string()))
    }

    async fn save_session(&self, session: &UploadSession) -> Result<(), SessionStoreError> {
        let upload_id = session.upload_id.as_str();
        let encoded = serde_json::to_vec_pretty(session)
            .map_err(|source| SessionStoreError::new("encode", upload_id, source.to_string()))?;
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|source| SessionStoreError::new("create directory for", upload_id, source.to_string()))?;

        let path = self.session_path(upload_id);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, encoded)
            .await
            .map_err(|source| SessionStoreError::new("write", upload_id, source.to_string()))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|source| SessionStoreError::new("commit", upload_id, source.to_string()))
    }

    async fn delete_session(&self, upload_id: &str) -> Result<(), SessionStoreError> {
        match tokio::fs::remove_file(self.session_path(upload_id)).await {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == IoErrorKind::NotFound => Ok(()),
            Err(source) => Err(SessionStoreError::new("delete", upload_id, source.to_string())),
        }
    }
}
