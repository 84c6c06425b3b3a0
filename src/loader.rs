//! Single-flight thumbnail loader
//!
//! `load` answers from the cache when it can. Otherwise it marks the asset in
//! flight and hands a job to the shared `LoadQueue`; the job fetches the bytes,
//! writes them into the cache, clears the mark, frees its queue slot and finally
//! kicks off dominant color extraction for thumbnail-class assets.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::color::DominantColorExtractor;
use crate::error::Result;
use crate::handle::DisplayHandle;
use crate::metrics::Metrics;
use crate::payload::{AssetRef, BinaryPayload, DisplayHint};
use crate::queue::{LoadQueue, LoadTicket};

/// External collaborator that retrieves raw bytes for a remote asset
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch_asset(&self, asset_id: &str) -> Result<BinaryPayload>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Served from the cache (possibly via resurrection)
    Cached,
    /// A fetch for this asset is already running
    AlreadyInFlight,
    /// A fetch was queued
    Enqueued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderRecovery {
    /// A fresh handle was minted from cached bytes
    Resurrected(DisplayHandle),
    /// Nothing cached; the asset is being fetched again
    Reloading,
}

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Clears an in-flight mark when dropped, even if the fetch panics
struct InFlightMark {
    set: InFlight,
    asset_id: String,
}

impl Drop for InFlightMark {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.asset_id);
    }
}

#[derive(Clone)]
pub struct ThumbnailLoader {
    cache: CacheStore,
    queue: LoadQueue,
    fetcher: Arc<dyn AssetFetcher>,
    colors: Option<DominantColorExtractor>,
    in_flight: InFlight,
    metrics: Arc<Metrics>,
}

impl ThumbnailLoader {
    pub fn new(cache: CacheStore, queue: LoadQueue, fetcher: Arc<dyn AssetFetcher>) -> Self {
        Self {
            cache,
            queue,
            fetcher,
            colors: None,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            metrics: Metrics::new(),
        }
    }

    /// Extract dominant colors for thumbnail-class assets after they load
    pub fn with_colors(mut self, extractor: DominantColorExtractor) -> Self {
        self.colors = Some(extractor);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn queue(&self) -> &LoadQueue {
        &self.queue
    }

    pub fn is_in_flight(&self, asset_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(asset_id)
    }

    /// Make `asset` displayable. The result lands in the cache.
    pub fn load(&self, asset: &AssetRef, hint: &DisplayHint) -> LoadOutcome {
        let asset_id = asset.asset_id.clone();

        if self.cache.get(&asset_id, hint.signature.as_deref()).is_some() {
            return LoadOutcome::Cached;
        }

        let mark = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if !in_flight.insert(asset_id.clone()) {
                Metrics::incr(&self.metrics.loads_deduplicated);
                debug!(asset_id, "Load already in flight");
                return LoadOutcome::AlreadyInFlight;
            }
            InFlightMark {
                set: self.in_flight.clone(),
                asset_id: asset_id.clone(),
            }
        };

        let loader = self.clone();
        let hint = hint.clone();
        self.queue
            .enqueue(move |ticket| async move { loader.run_load(mark, hint, ticket).await });
        debug!(asset_id, pending = self.queue.pending(), "Queued asset load");
        LoadOutcome::Enqueued
    }

    /// A previously issued handle failed to render
    pub fn report_render_error(&self, asset: &AssetRef, hint: &DisplayHint) -> RenderRecovery {
        if let Some(handle) = self.cache.report_render_error(&asset.asset_id) {
            Metrics::incr(&self.metrics.resurrections);
            return RenderRecovery::Resurrected(handle);
        }
        match self.load(asset, hint) {
            LoadOutcome::Cached => match self.cache.get(&asset.asset_id, hint.signature.as_deref()) {
                Some(entry) => RenderRecovery::Resurrected(entry.handle),
                None => RenderRecovery::Reloading,
            },
            LoadOutcome::AlreadyInFlight | LoadOutcome::Enqueued => RenderRecovery::Reloading,
        }
    }

    async fn run_load(self, mark: InFlightMark, hint: DisplayHint, ticket: LoadTicket) {
        let asset_id = mark.asset_id.clone();
        Metrics::incr(&self.metrics.fetches);

        match self.fetcher.fetch_asset(&asset_id).await {
            Ok(payload) => {
                let handle = self.cache.store(&asset_id, payload.clone(), &hint);
                drop(mark);
                ticket.complete();
                debug!(asset_id, handle = handle.uri(), size = payload.len(), "Loaded asset");

                if hint.thumbnail {
                    if let Some(colors) = &self.colors {
                        colors
                            .extract_for(&asset_id, hint.signature.as_deref(), &payload)
                            .await;
                    }
                }
            }
            Err(e) => {
                Metrics::incr(&self.metrics.fetch_failures);
                warn!(asset_id, "Asset fetch failed: {}", e);
                drop(mark);
                if self.cache.resolve_display_handle(&asset_id).is_some() {
                    Metrics::incr(&self.metrics.resurrections);
                    debug!(asset_id, "Recovered cached handle after fetch failure");
                }
                ticket.complete();
            }
        }
    }
}
