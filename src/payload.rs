//! Asset identity and immutable byte payloads

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Fallback MIME type when sniffing finds nothing
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Reference to a remote asset. Identity is `asset_id` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRef {
    pub asset_id: String,
    pub file_name: Option<String>,
}

impl AssetRef {
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            file_name: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

impl PartialEq for AssetRef {
    fn eq(&self, other: &Self) -> bool {
        self.asset_id == other.asset_id
    }
}

impl Eq for AssetRef {}

impl std::hash::Hash for AssetRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.asset_id.hash(state);
    }
}

/// How a caller intends to display an asset
#[derive(Debug, Clone, Default)]
pub struct DisplayHint {
    /// Thumbnail-class assets keep their bytes cached and get a dominant color
    pub thumbnail: bool,
    /// Content-version token (e.g. the asset's current field id)
    pub signature: Option<String>,
}

impl DisplayHint {
    pub fn thumbnail(signature: impl Into<String>) -> Self {
        Self {
            thumbnail: true,
            signature: Some(signature.into()),
        }
    }
}

/// Immutable byte buffer tagged with a MIME type. Clones share the buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct BinaryPayload {
    bytes: Arc<[u8]>,
    mime_type: String,
}

impl BinaryPayload {
    pub fn new(bytes: impl Into<Arc<[u8]>>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Build a payload, detecting the MIME type from magic bytes
    pub fn sniffed(bytes: Vec<u8>) -> Self {
        let mime_type = sniff_mime(&bytes).to_string();
        Self::new(bytes, mime_type)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

impl fmt::Debug for BinaryPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryPayload")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Detect a MIME type from magic bytes
pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    infer::get(bytes)
        .map(|kind| kind.mime_type())
        .unwrap_or(OCTET_STREAM)
}
