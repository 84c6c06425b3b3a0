//! soma_assets - media asset pipeline for the SOMA platform
//!
//! Prepares images for upload and for display:
//! - `AdaptiveCompressor` bisects JPEG quality to hit a byte budget and carries
//!   EXIF over with orientation normalized (`MetadataCodec`)
//! - `BatchUploadScheduler` pushes files through compression and an upload
//!   collaborator in fixed-size concurrent batches
//! - `ThumbnailLoader` fetches remote assets once each, behind the global
//!   `LoadQueue` ceiling, into the three-tier `CacheStore`
//! - `DominantColorExtractor` derives card colors from loaded thumbnails
//!
//! Fetch and upload transports are traits (`AssetFetcher`, `FileUploader`);
//! `DirectoryUploader` is the local implementation used by the CLI.

pub mod error;
pub mod config;
pub mod payload;
pub mod metadata;
pub mod compressor;
pub mod handle;
pub mod cache;
pub mod queue;
pub mod loader;
pub mod color;
pub mod scheduler;
pub mod upload_log;
pub mod local;
pub mod metrics;
pub mod organ;
pub mod validation;

pub use error::{AssetError, Result, UploadError, UploadErrorKind};
pub use config::{ColorConfig, CompressionConfig, LoaderConfig, PipelineConfig, UploadConfig, CONFIG_ENV};
pub use payload::{sniff_mime, AssetRef, BinaryPayload, DisplayHint};
pub use metadata::{EmbeddedMetadata, MetadataCodec};
pub use compressor::{decode_upright, AdaptiveCompressor, CompressedImage, SearchStop};
pub use handle::{DisplayHandle, HandleProvider, MemoryHandles};
pub use cache::{CacheEntry, CacheStats, CacheStore, CleanupReport, StyleEntry};
pub use queue::{LoadQueue, LoadTicket};
pub use loader::{AssetFetcher, LoadOutcome, RenderRecovery, ThumbnailLoader};
pub use color::{DisplayStyle, DominantColor, DominantColorExtractor};
pub use scheduler::{
    BatchOutcome, BatchReport, BatchUploadScheduler, FileError, FileMetadata, FileUploader, ProgressEvent,
    ProgressPhase, TaskState, UploadItem, UploadResult,
};
pub use upload_log::{FollowHandle, MemoryUploadLog, UploadLogFollower, UploadLogSource};
pub use local::DirectoryUploader;
pub use metrics::{Metrics, MetricsSnapshot};
