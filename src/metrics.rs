//! Metrics and observability for soma_assets

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use serde::{Deserialize, Serialize};

/// Process-wide pipeline counters
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub total_latency_ms: AtomicU64,

    // Per-operation counters
    pub compress_ops: AtomicU64,
    pub dominant_color_ops: AtomicU64,
    pub upload_batch_ops: AtomicU64,

    // Compression / upload
    pub compressions: AtomicU64,
    pub compression_fallbacks: AtomicU64,
    pub bytes_saved: AtomicU64,
    pub uploads_succeeded: AtomicU64,
    pub uploads_failed: AtomicU64,

    // Thumbnail loading
    pub fetches: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub loads_deduplicated: AtomicU64,
    pub resurrections: AtomicU64,
    pub color_extractions: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_request(&self, op: &str, success: bool, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        match op {
            "asset.compress" => Self::incr(&self.compress_ops),
            "asset.dominant_color" => Self::incr(&self.dominant_color_ops),
            "asset.upload_batch" => Self::incr(&self.upload_batch_ops),
            _ => {}
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_requests: total,
            failed_requests: failed,
            error_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            avg_latency_ms: if total > 0 { total_latency / total } else { 0 },
            operations: OperationMetrics {
                compress: self.compress_ops.load(Ordering::Relaxed),
                dominant_color: self.dominant_color_ops.load(Ordering::Relaxed),
                upload_batch: self.upload_batch_ops.load(Ordering::Relaxed),
            },
            pipeline: PipelineCounters {
                compressions: self.compressions.load(Ordering::Relaxed),
                compression_fallbacks: self.compression_fallbacks.load(Ordering::Relaxed),
                bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
                uploads_succeeded: self.uploads_succeeded.load(Ordering::Relaxed),
                uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
                fetches: self.fetches.load(Ordering::Relaxed),
                fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
                loads_deduplicated: self.loads_deduplicated.load(Ordering::Relaxed),
                resurrections: self.resurrections.load(Ordering::Relaxed),
                color_extractions: self.color_extractions.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub avg_latency_ms: u64,
    pub operations: OperationMetrics,
    pub pipeline: PipelineCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub compress: u64,
    pub dominant_color: u64,
    pub upload_batch: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCounters {
    pub compressions: u64,
    pub compression_fallbacks: u64,
    pub bytes_saved: u64,
    pub uploads_succeeded: u64,
    pub uploads_failed: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub loads_deduplicated: u64,
    pub resurrections: u64,
    pub color_extractions: u64,
}
