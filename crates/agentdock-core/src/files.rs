use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "pdf", "png", "jpg", "jpeg", "gif", "webp", "txt", "csv", "json", "md", "docx", "xlsx",
];

const TEXT_EXTENSIONS: &[&str] = &["txt", "csv", "json", "md"];

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("file name is required")]
    MissingName,
    #[error("file type `.{0}` is not allowed")]
    ExtensionNotAllowed(String),
    #[error("file is empty")]
    Empty,
    #[error("file is too large: {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("file content does not match its `.{0}` extension")]
    ContentMismatch(String),
    #[error("failed to store upload: {0}")]
    Io(#[from] std::io::Error),
}

/// An accepted upload. The server path stays inside the process; only the
/// id, name and size are ever returned to callers.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_id: String,
    pub file_name: String,
    pub extension: String,
    pub size: usize,
    pub server_path: PathBuf,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub file_id: String,
    pub file_name: String,
    pub size: usize,
}

impl UploadedFile {
    pub fn receipt(&self) -> UploadReceipt {
        UploadReceipt {
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            size: self.size,
        }
    }
}

/// Lowercased extension of `name`, checked against the allow-list.
pub fn allowed_extension(name: &str) -> Result<String, UploadError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(UploadError::MissingName);
    }
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ext)
    } else {
        Err(UploadError::ExtensionNotAllowed(ext))
    }
}

fn matches_magic(ext: &str, bytes: &[u8]) -> bool {
    match ext {
        "pdf" => bytes.starts_with(b"%PDF-"),
        "png" => bytes.starts_with(b"\x89PNG\r\n\x1a\n"),
        "jpg" | "jpeg" => bytes.starts_with(&[0xFF, 0xD8, 0xFF]),
        "gif" => bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a"),
        "webp" => bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP",
        // Office documents are zip containers.
        "docx" | "xlsx" => bytes.starts_with(b"PK\x03\x04"),
        _ => false,
    }
}

/// Checks name, size and content of an upload. Returns the normalized
/// extension on success.
pub fn validate_upload(name: &str, bytes: &[u8], max_bytes: usize) -> Result<String, UploadError> {
    let ext = allowed_extension(name)?;
    if bytes.is_empty() {
        return Err(UploadError::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(UploadError::TooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    let content_ok = if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        std::str::from_utf8(bytes).is_ok() && !bytes.contains(&0)
    } else {
        matches_magic(&ext, bytes)
    };
    if !content_ok {
        return Err(UploadError::ContentMismatch(ext));
    }
    Ok(ext)
}

/// Keeps only characters that are safe in a file name.
fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// `fileId -> UploadedFile` map shared by the upload route and admission.
#[derive(Clone)]
pub struct FileRegistry {
    dir: PathBuf,
    ttl: Duration,
    max_bytes: usize,
    entries: Arc<RwLock<HashMap<String, UploadedFile>>>,
}

impl FileRegistry {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            max_bytes,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Validates and writes the upload under the registry directory.
    pub async fn persist(&self, name: &str, bytes: &[u8]) -> Result<UploadedFile, UploadError> {
        let extension = validate_upload(name, bytes, self.max_bytes)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let file_id = Uuid::new_v4().to_string();
        let file_name = sanitize_file_name(name);
        let server_path = self.dir.join(format!("{file_id}_{file_name}"));
        tokio::fs::write(&server_path, bytes).await?;
        let uploaded = UploadedFile {
            file_id: file_id.clone(),
            file_name,
            extension,
            size: bytes.len(),
            server_path,
            uploaded_at: Utc::now(),
        };
        self.entries.write().await.insert(file_id, uploaded.clone());
        tracing::info!(
            file_id = %uploaded.file_id,
            size = uploaded.size,
            extension = %uploaded.extension,
            "upload stored"
        );
        Ok(uploaded)
    }

    pub async fn insert(&self, file: UploadedFile) {
        self.entries.write().await.insert(file.file_id.clone(), file);
    }

    /// Expired entries read as absent even before the sweeper runs.
    pub async fn resolve(&self, file_id: &str) -> Option<UploadedFile> {
        let entries = self.entries.read().await;
        let file = entries.get(file_id)?;
        if self.is_expired(file, Utc::now()) {
            return None;
        }
        Some(file.clone())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn is_expired(&self, file: &UploadedFile, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(file.uploaded_at);
        age.to_std().map(|age| age > self.ttl).unwrap_or(false)
    }

    /// Drops expired entries and deletes their files. Returns how many
    /// entries were removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired = {
            let mut entries = self.entries.write().await;
            let ids = entries
                .values()
                .filter(|f| self.is_expired(f, now))
                .map(|f| f.file_id.clone())
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id))
                .collect::<Vec<_>>()
        };
        for file in &expired {
            if let Err(err) = tokio::fs::remove_file(&file.server_path).await {
                tracing::debug!(
                    file_id = %file.file_id,
                    "failed to remove expired upload: {err}"
                );
            }
        }
        expired.len()
    }
}
