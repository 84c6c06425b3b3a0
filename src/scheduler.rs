//! Batch upload scheduling
//!
//! Files are split into batches of `batch_size`. Every item in a batch runs as
//! its own task: optional compression on the blocking pool, then the upload.
//! Compression of one item overlaps uploads of others. A batch must fully settle
//! before the next one starts. Per-file failures are folded into the
//! `BatchReport`; nothing aborts the submission.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::compressor::{AdaptiveCompressor, JPEG_MIME};
use crate::config::UploadConfig;
use crate::error::{UploadError, UploadErrorKind};
use crate::metrics::Metrics;
use crate::payload::BinaryPayload;

/// Metadata sent alongside each uploaded payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_name: String,
    pub mime_type: String,
    pub original_size: u64,
    pub compressed: bool,
    /// Position of the file in its submission
    pub index: usize,
}

/// Identifiers assigned by the upload collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub asset_id: String,
    pub file_name: String,
    pub size: u64,
}

/// External collaborator that persists a file server-side
#[async_trait]
pub trait FileUploader: Send + Sync {
    async fn upload_file(
        &self,
        payload: BinaryPayload,
        metadata: &FileMetadata,
    ) -> std::result::Result<UploadResult, UploadError>;
}

/// One file handed to `submit`
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub file_name: String,
    pub payload: BinaryPayload,
}

impl UploadItem {
    pub fn new(file_name: impl Into<String>, payload: BinaryPayload) -> Self {
        Self {
            file_name: file_name.into(),
            payload,
        }
    }

    /// Item whose MIME type is sniffed from its bytes
    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::new(file_name, BinaryPayload::sniffed(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Compressing,
    Uploading,
}

/// Live progress, sent fire-and-forget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    /// Items that have entered `phase` so far
    pub current: usize,
    pub total: usize,
    /// Items currently in `phase`
    pub active: usize,
}

/// Per-item lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Compressing,
    Uploading,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn can_advance_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Compressing) | (Pending, Uploading) | (Compressing, Uploading) | (Uploading, Succeeded) | (Uploading, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

struct UploadTask {
    index: usize,
    item: UploadItem,
    state: TaskState,
}

impl UploadTask {
    fn advance(&mut self, next: TaskState) {
        if !self.state.can_advance_to(next) {
            error!(file = %self.item.file_name, from = ?self.state, to = ?next, "Invalid upload task transition");
        }
        self.state = next;
    }
}

/// Per-file failure line in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub file_name: String,
    pub message: String,
    pub kind: UploadErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Empty,
    AllSucceeded,
    Partial,
    AllFailed,
}

/// Aggregate result of one `submit`
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    /// Items never started because the scheduler was cancelled
    pub skipped_count: usize,
    pub errors: Vec<FileError>,
    pub uploaded: Vec<UploadResult>,
    pub compressed_count: usize,
    pub bytes_saved: u64,
    pub duration_ms: u64,
}

impl BatchReport {
    fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn outcome(&self) -> BatchOutcome {
        match (self.success_count, self.failed_count) {
            (0, 0) => BatchOutcome::Empty,
            (_, 0) => BatchOutcome::AllSucceeded,
            (0, _) => BatchOutcome::AllFailed,
            _ => BatchOutcome::Partial,
        }
    }

    /// Human-readable summary, one line per failed file
    pub fn summary(&self) -> String {
        let secs = self.duration().as_secs_f64();
        let mut text = match self.outcome() {
            BatchOutcome::Empty => "No files were uploaded".to_string(),
            BatchOutcome::AllSucceeded => {
                format!("All {} file(s) uploaded successfully in {:.1}s", self.success_count, secs)
            }
            BatchOutcome::Partial => format!(
                "Uploaded {} of {} file(s) in {:.1}s; {} failed",
                self.success_count,
                self.success_count + self.failed_count,
                secs,
                self.failed_count
            ),
            BatchOutcome::AllFailed => format!("All {} upload(s) failed", self.failed_count),
        };

        if self.compressed_count > 0 {
            text.push_str(&format!(
                " ({} compressed, {} KiB saved)",
                self.compressed_count,
                self.bytes_saved / 1024
            ));
        }
        if self.skipped_count > 0 {
            text.push_str(&format!(" ({} skipped after cancel)", self.skipped_count));
        }
        for err in &self.errors {
            text.push_str(&format!("\n  {}: {}", err.file_name, err.message));
        }
        text
    }

    fn record(&mut self, outcome: TaskOutcome) {
        match outcome.result {
            Ok(uploaded) => {
                self.success_count += 1;
                if outcome.bytes_saved > 0 {
                    self.compressed_count += 1;
                    self.bytes_saved += outcome.bytes_saved;
                }
                self.uploaded.push(uploaded);
            }
            Err(err) => {
                self.failed_count += 1;
                self.errors.push(FileError {
                    file_name: outcome.file_name,
                    message: err.to_string(),
                    kind: err.kind,
                });
            }
        }
    }
}

struct TaskOutcome {
    index: usize,
    file_name: String,
    result: std::result::Result<UploadResult, UploadError>,
    bytes_saved: u64,
}

/// Shared phase counters driving progress events
struct Progress {
    total: usize,
    compress_started: AtomicUsize,
    compress_active: AtomicUsize,
    upload_started: AtomicUsize,
    upload_active: AtomicUsize,
    sender: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Progress {
    fn new(total: usize, sender: Option<mpsc::UnboundedSender<ProgressEvent>>) -> Self {
        Self {
            total,
            compress_started: AtomicUsize::new(0),
            compress_active: AtomicUsize::new(0),
            upload_started: AtomicUsize::new(0),
            upload_active: AtomicUsize::new(0),
            sender,
        }
    }

    fn counters(&self, phase: ProgressPhase) -> (&AtomicUsize, &AtomicUsize) {
        match phase {
            ProgressPhase::Compressing => (&self.compress_started, &self.compress_active),
            ProgressPhase::Uploading => (&self.upload_started, &self.upload_active),
        }
    }

    fn begin(&self, phase: ProgressPhase) {
        let (started, active) = self.counters(phase);
        let current = started.fetch_add(1, Ordering::SeqCst) + 1;
        let active = active.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(sender) = &self.sender {
            // Receiver gone means nobody is watching
            let _ = sender.send(ProgressEvent {
                phase,
                current,
                total: self.total,
                active,
            });
        }
    }

    fn end(&self, phase: ProgressPhase) {
        let (_, active) = self.counters(phase);
        active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TaskContext {
    compressor: AdaptiveCompressor,
    uploader: Arc<dyn FileUploader>,
    progress: Progress,
    metrics: Arc<Metrics>,
}

impl TaskContext {
    fn should_compress(&self, payload: &BinaryPayload) -> bool {
        let cfg = self.compressor.config();
        cfg.enabled && payload.is_image() && payload.len() as u64 > cfg.threshold_bytes
    }
}

pub struct BatchUploadScheduler {
    compressor: AdaptiveCompressor,
    uploader: Arc<dyn FileUploader>,
    config: UploadConfig,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    cancelled: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

impl BatchUploadScheduler {
    pub fn new(compressor: AdaptiveCompressor, uploader: Arc<dyn FileUploader>, config: UploadConfig) -> Self {
        Self {
            compressor,
            uploader,
            config,
            progress: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            metrics: Metrics::new(),
        }
    }

    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Stop starting new batches. Running items finish normally.
    pub fn cancel(&self) {
        info!("Upload cancellation requested");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear a previous `cancel` so later submissions run again
    pub fn resume(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub async fn submit(&self, items: Vec<UploadItem>) -> BatchReport {
        let started = Instant::now();
        let total = items.len();
        let batch_size = self.config.batch_size.max(1);
        let mut report = BatchReport::new(total);

        let ctx = Arc::new(TaskContext {
            compressor: self.compressor.clone(),
            uploader: self.uploader.clone(),
            progress: Progress::new(total, self.progress.clone()),
            metrics: self.metrics.clone(),
        });

        let mut pending: VecDeque<UploadTask> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| UploadTask {
                index,
                item,
                state: TaskState::Pending,
            })
            .collect();

        info!(total, batch_size, "Starting batch upload");

        while !pending.is_empty() {
            if self.is_cancelled() {
                report.skipped_count = pending.len();
                info!(skipped = report.skipped_count, "Upload cancelled; remaining files skipped");
                break;
            }

            let take = batch_size.min(pending.len());
            let batch: Vec<UploadTask> = pending.drain(..take).collect();
            let names: Vec<(usize, String)> = batch.iter().map(|t| (t.index, t.item.file_name.clone())).collect();
            debug!(size = batch.len(), remaining = pending.len(), "Launching batch");

            let mut set = JoinSet::new();
            for task in batch {
                set.spawn(run_task(ctx.clone(), task));
            }

            let mut outcomes = Vec::with_capacity(names.len());
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => error!("Upload task aborted: {}", e),
                }
            }

            // Tasks that died without reporting still count as failed files
            for (index, file_name) in names {
                if !outcomes.iter().any(|o| o.index == index) {
                    Metrics::incr(&self.metrics.uploads_failed);
                    outcomes.push(TaskOutcome {
                        index,
                        file_name,
                        result: Err(UploadError::new(UploadErrorKind::Other, "upload task aborted")),
                        bytes_saved: 0,
                    });
                }
            }

            outcomes.sort_by_key(|o| o.index);
            for outcome in outcomes {
                report.record(outcome);
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            succeeded = report.success_count,
            failed = report.failed_count,
            skipped = report.skipped_count,
            duration_ms = report.duration_ms,
            "Batch upload finished"
        );
        report
    }
}

async fn run_task(ctx: Arc<TaskContext>, mut task: UploadTask) -> TaskOutcome {
    let original = task.item.payload.clone();
    let mut body = original.clone();
    let mut file_name = task.item.file_name.clone();
    let mut bytes_saved = 0u64;

    if ctx.should_compress(&original) {
        task.advance(TaskState::Compressing);
        ctx.progress.begin(ProgressPhase::Compressing);

        let compressor = ctx.compressor.clone();
        let source = original.clone();
        let target = compressor.config().target_size_bytes;
        let result = tokio::task::spawn_blocking(move || compressor.compress(source.bytes(), target)).await;
        ctx.progress.end(ProgressPhase::Compressing);

        match result {
            Ok(Ok(compressed)) if compressed.size() < original.len() => {
                bytes_saved = (original.len() - compressed.size()) as u64;
                Metrics::incr(&ctx.metrics.compressions);
                ctx.metrics.bytes_saved.fetch_add(bytes_saved, Ordering::Relaxed);
                debug!(
                    file = %file_name,
                    original = original.len(),
                    size = compressed.size(),
                    quality = compressed.quality,
                    attempts = compressed.attempts,
                    "Compressed before upload"
                );
                if original.mime_type() != JPEG_MIME {
                    file_name = jpeg_file_name(&file_name);
                }
                body = BinaryPayload::new(compressed.data, JPEG_MIME);
            }
            Ok(Ok(compressed)) => {
                debug!(
                    file = %file_name,
                    original = original.len(),
                    size = compressed.size(),
                    "Compressed output not smaller; uploading original"
                );
            }
            Ok(Err(e)) => {
                Metrics::incr(&ctx.metrics.compression_fallbacks);
                warn!(file = %file_name, "Compression failed, uploading original: {}", e);
            }
            Err(e) => {
                Metrics::incr(&ctx.metrics.compression_fallbacks);
                warn!(file = %file_name, "Compression task failed, uploading original: {}", e);
            }
        }
    }

    task.advance(TaskState::Uploading);
    ctx.progress.begin(ProgressPhase::Uploading);
    let metadata = FileMetadata {
        file_name: file_name.clone(),
        mime_type: body.mime_type().to_string(),
        original_size: original.len() as u64,
        compressed: bytes_saved > 0,
        index: task.index,
    };
    let result = ctx.uploader.upload_file(body, &metadata).await;
    ctx.progress.end(ProgressPhase::Uploading);

    match &result {
        Ok(uploaded) => {
            task.advance(TaskState::Succeeded);
            Metrics::incr(&ctx.metrics.uploads_succeeded);
            debug!(file = %file_name, asset_id = %uploaded.asset_id, "Uploaded");
        }
        Err(e) => {
            task.advance(TaskState::Failed);
            Metrics::incr(&ctx.metrics.uploads_failed);
            warn!(file = %file_name, kind = e.kind.as_str(), status = ?e.status, "Upload failed: {}", e);
        }
    }

    TaskOutcome {
        index: task.index,
        file_name: task.item.file_name,
        result,
        bytes_saved,
    }
}

fn jpeg_file_name(file_name: &str) -> String {
    Path::new(file_name).with_extension("jpg").to_string_lossy().into_owned()
}
