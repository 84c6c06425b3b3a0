//! Filesystem-backed uploader
//!
//! "Uploads" by writing each payload into a destination directory. Used by the
//! CLI and by tests that want real files on disk.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{UploadError, UploadErrorKind};
use crate::payload::BinaryPayload;
use crate::scheduler::{FileMetadata, FileUploader, UploadResult};
use crate::upload_log::MemoryUploadLog;

pub struct DirectoryUploader {
    dest: PathBuf,
    log: Option<(Arc<MemoryUploadLog>, String)>,
}

impl DirectoryUploader {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            log: None,
        }
    }

    /// Narrate each write into `log` under `session_id`
    pub fn with_log(mut self, log: Arc<MemoryUploadLog>, session_id: impl Into<String>) -> Self {
        self.log = Some((log, session_id.into()));
        self
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    fn narrate(&self, line: String) {
        if let Some((log, session)) = &self.log {
            log.append(session, line);
        }
    }

    /// Create the first free file for `name`, adding `-1`, `-2`, ... before the extension.
    /// `create_new` makes the reservation atomic across concurrent uploads.
    async fn reserve(&self, name: &str) -> std::io::Result<(PathBuf, File)> {
        let path = Path::new(name);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
        let ext = path.extension().and_then(|e| e.to_str());

        let mut n = 0usize;
        loop {
            let candidate = match (n, ext) {
                (0, _) => self.dest.join(name),
                (_, Some(ext)) => self.dest.join(format!("{}-{}.{}", stem, n, ext)),
                (_, None) => self.dest.join(format!("{}-{}", stem, n)),
            };
            match OpenOptions::new().write(true).create_new(true).open(&candidate).await {
                Ok(file) => return Ok((candidate, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(e),
            }
        }
    }
}

fn io_upload_error(action: &str, path: &Path, e: std::io::Error) -> UploadError {
    let kind = match e.kind() {
        ErrorKind::PermissionDenied => UploadErrorKind::Forbidden,
        _ => UploadErrorKind::Server,
    };
    UploadError::new(kind, format!("Failed to {} {}: {}", action, path.display(), e))
}

#[async_trait]
impl FileUploader for DirectoryUploader {
    async fn upload_file(
        &self,
        payload: BinaryPayload,
        metadata: &FileMetadata,
    ) -> std::result::Result<UploadResult, UploadError> {
        if payload.is_empty() {
            self.narrate(format!("Rejected {}: empty file", metadata.file_name));
            return Err(UploadError::validation(format!("{} is empty", metadata.file_name)));
        }

        // Only the final path component; callers may pass full paths
        let name = Path::new(&metadata.file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| UploadError::validation(format!("invalid file name: {}", metadata.file_name)))?;

        tokio::fs::create_dir_all(&self.dest)
            .await
            .map_err(|e| io_upload_error("create", &self.dest, e))?;

        let (path, mut file) = self
            .reserve(name)
            .await
            .map_err(|e| io_upload_error("create", &self.dest.join(name), e))?;
        file.write_all(payload.bytes())
            .await
            .map_err(|e| io_upload_error("write", &path, e))?;
        file.flush().await.map_err(|e| io_upload_error("write", &path, e))?;

        let stored_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        debug!(path = %path.display(), size = payload.len(), "Stored upload");
        self.narrate(format!(
            "Uploaded {} ({} bytes{})",
            stored_name,
            payload.len(),
            if metadata.compressed { ", compressed" } else { "" }
        ));

        Ok(UploadResult {
            asset_id: path.display().to_string(),
            file_name: stored_name,
            size: payload.len() as u64,
        })
    }
}
