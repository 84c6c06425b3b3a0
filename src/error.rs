use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Fetch failed for {asset_id}: {message}")]
    Fetch { asset_id: String, message: String },

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Load queue overrun: {in_flight} in flight with ceiling {ceiling}")]
    QueueOverrun { in_flight: usize, ceiling: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AssetError>;

/// Failure category reported by the upload collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadErrorKind {
    /// Server unreachable, connection reset, DNS, ...
    Connectivity,
    /// Missing or expired credentials (401)
    Auth,
    /// Authenticated but not allowed (403)
    Forbidden,
    /// Backend failure (5xx)
    Server,
    /// Payload rejected (bad file, too large, unsupported type)
    Validation,
    Other,
}

impl UploadErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadErrorKind::Connectivity => "connectivity",
            UploadErrorKind::Auth => "auth",
            UploadErrorKind::Forbidden => "forbidden",
            UploadErrorKind::Server => "server",
            UploadErrorKind::Validation => "validation",
            UploadErrorKind::Other => "other",
        }
    }
}

/// Upload failure as surfaced per file in a `BatchReport`
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}", self.display_message())]
pub struct UploadError {
    pub kind: UploadErrorKind,
    pub status: Option<u16>,
    /// Message reported by the server, if any
    pub message: Option<String>,
}

impl UploadError {
    pub fn new(kind: UploadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: Some(message.into()),
        }
    }

    /// Classify an HTTP-style status. Status 0 means the request never got an answer.
    pub fn from_status(status: u16, message: Option<String>) -> Self {
        let kind = match status {
            0 => UploadErrorKind::Connectivity,
            401 => UploadErrorKind::Auth,
            403 => UploadErrorKind::Forbidden,
            400 | 409 | 413 | 415 | 422 => UploadErrorKind::Validation,
            500..=599 => UploadErrorKind::Server,
            _ => UploadErrorKind::Other,
        };
        Self {
            kind,
            status: Some(status),
            message: message.filter(|m| !m.trim().is_empty()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(UploadErrorKind::Validation, message)
    }

    fn display_message(&self) -> String {
        match &self.message {
            Some(message) => message.clone(),
            None => "upload failed".to_string(),
        }
    }
}
