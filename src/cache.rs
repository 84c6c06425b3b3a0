//! Three-tier asset cache
//!
//! Lookups consult, in order:
//! 1. the handle tier (`asset_id` → live `DisplayHandle`),
//! 2. the payload tier (`asset_id` → bytes, thumbnail-class assets only), which
//!    resurrects a fresh handle when the previous one went stale,
//! 3. the style tier (`asset_id` → color/style for one signature).
//!
//! Handle and payload hits do not check the signature; style hits do. A stale
//! thumbnail that can be shown immediately is preferred over a forced re-fetch.
//!
//! The store is cheap to clone; all clones share one set of tiers behind a single
//! mutex, so tier updates for an asset are never observed half-applied.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::color::{DisplayStyle, DominantColor};
use crate::handle::{DisplayHandle, HandleProvider, MemoryHandles};
use crate::payload::{BinaryPayload, DisplayHint};

/// Result of a cache lookup
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub asset_id: String,
    pub handle: DisplayHandle,
    pub payload: Option<BinaryPayload>,
    pub color: Option<DominantColor>,
    pub style: Option<DisplayStyle>,
    pub signature: Option<String>,
}

/// Style-tier record
#[derive(Debug, Clone, PartialEq)]
pub struct StyleEntry {
    pub signature: Option<String>,
    pub handle: Option<DisplayHandle>,
    pub color: DominantColor,
    pub style: DisplayStyle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub resurrections: u64,
    pub style_hits: u64,
    pub misses: u64,
    pub live_handles: usize,
    pub payloads: usize,
    pub styles: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub evicted: usize,
    pub released_handles: usize,
}

#[derive(Debug)]
struct HandleSlot {
    handle: DisplayHandle,
    signature: Option<String>,
    invalid: bool,
}

#[derive(Default)]
struct Tiers {
    handles: HashMap<String, HandleSlot>,
    payloads: HashMap<String, BinaryPayload>,
    styles: HashMap<String, StyleEntry>,
    stats: CacheStats,
}

struct CacheInner {
    tiers: Mutex<Tiers>,
    provider: Arc<dyn HandleProvider>,
}

#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<CacheInner>,
}

impl CacheStore {
    pub fn new(provider: Arc<dyn HandleProvider>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                tiers: Mutex::new(Tiers::default()),
                provider,
            }),
        }
    }

    /// Store backed by an in-process `MemoryHandles` registry
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryHandles::new()))
    }

    pub fn provider(&self) -> &Arc<dyn HandleProvider> {
        &self.inner.provider
    }

    fn tiers(&self) -> MutexGuard<'_, Tiers> {
        self.inner.tiers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an asset, resurrecting its handle from cached bytes if needed.
    ///
    /// `signature` only gates style-tier data.
    pub fn get(&self, asset_id: &str, signature: Option<&str>) -> Option<CacheEntry> {
        let provider = &self.inner.provider;
        let mut tiers = self.tiers();

        // 1. live handle
        let live = tiers
            .handles
            .get(asset_id)
            .filter(|slot| !slot.invalid && provider.is_live(&slot.handle))
            .map(|slot| slot.handle.clone());
        if let Some(handle) = live {
            tiers.stats.hits += 1;
            return Some(entry_for(&tiers, asset_id, handle, signature));
        }

        // 2. resurrect from payload
        if tiers.payloads.contains_key(asset_id) {
            let handle = resurrect_locked(provider.as_ref(), &mut tiers, asset_id, signature)?;
            return Some(entry_for(&tiers, asset_id, handle, signature));
        }

        // 3. style tier, signature must match
        let from_style = tiers
            .styles
            .get(asset_id)
            .filter(|s| s.signature.as_deref() == signature)
            .and_then(|s| s.handle.clone())
            .filter(|h| provider.is_live(h));
        if let Some(handle) = from_style {
            tiers.stats.style_hits += 1;
            tiers.handles.insert(
                asset_id.to_string(),
                HandleSlot {
                    handle: handle.clone(),
                    signature: signature.map(str::to_string),
                    invalid: false,
                },
            );
            return Some(entry_for(&tiers, asset_id, handle, signature));
        }

        tiers.stats.misses += 1;
        None
    }

    /// Whether the handle tier holds a usable handle, without touching stats
    pub fn has_live_handle(&self, asset_id: &str) -> bool {
        let tiers = self.tiers();
        tiers
            .handles
            .get(asset_id)
            .is_some_and(|slot| !slot.invalid && self.inner.provider.is_live(&slot.handle))
    }

    /// Mint a handle for freshly loaded bytes and write it into the tiers.
    ///
    /// Bytes are retained only for thumbnail-class assets. A style entry recorded
    /// under a different signature is dropped.
    pub fn store(&self, asset_id: &str, payload: BinaryPayload, hint: &DisplayHint) -> DisplayHandle {
        let provider = &self.inner.provider;
        let handle = provider.create(&payload);
        let mut tiers = self.tiers();

        let previous = tiers.handles.insert(
            asset_id.to_string(),
            HandleSlot {
                handle: handle.clone(),
                signature: hint.signature.clone(),
                invalid: false,
            },
        );
        if let Some(old) = previous {
            if old.handle != handle {
                provider.release(&old.handle);
            }
        }

        if hint.thumbnail {
            tiers.payloads.insert(asset_id.to_string(), payload);
        } else {
            tiers.payloads.remove(asset_id);
        }

        let stale_style = tiers
            .styles
            .get(asset_id)
            .is_some_and(|s| s.signature != hint.signature);
        if stale_style {
            tiers.styles.remove(asset_id);
        }

        debug!(asset_id, handle = handle.uri(), "Cached asset");
        handle
    }

    /// Write a complete entry into every tier it has data for
    pub fn put(&self, entry: CacheEntry) {
        let provider = &self.inner.provider;
        let mut tiers = self.tiers();

        let previous = tiers.handles.insert(
            entry.asset_id.clone(),
            HandleSlot {
                handle: entry.handle.clone(),
                signature: entry.signature.clone(),
                invalid: false,
            },
        );
        if let Some(old) = previous {
            if old.handle != entry.handle {
                provider.release(&old.handle);
            }
        }

        match entry.payload {
            Some(payload) => tiers.payloads.insert(entry.asset_id.clone(), payload),
            None => tiers.payloads.remove(&entry.asset_id),
        };

        let stale_style = tiers
            .styles
            .get(&entry.asset_id)
            .is_some_and(|s| s.signature != entry.signature);
        if stale_style {
            tiers.styles.remove(&entry.asset_id);
        }

        if let (Some(color), Some(style)) = (entry.color, entry.style) {
            tiers.styles.insert(
                entry.asset_id,
                StyleEntry {
                    signature: entry.signature,
                    handle: Some(entry.handle),
                    color,
                    style,
                },
            );
        }
    }

    /// Mint a fresh handle from cached bytes, ignoring the current handle.
    ///
    /// Falls back to the current handle when no bytes are cached and it is still
    /// usable; `None` means the asset has to be fetched again.
    pub fn resolve_display_handle(&self, asset_id: &str) -> Option<DisplayHandle> {
        let mut tiers = self.tiers();
        resolve_locked(self.inner.provider.as_ref(), &mut tiers, asset_id)
    }

    /// A handle failed to render: flag it and try to resurrect.
    ///
    /// When nothing can be resurrected the broken handle is released, so no tier
    /// serves it again.
    pub fn report_render_error(&self, asset_id: &str) -> Option<DisplayHandle> {
        let provider = self.inner.provider.as_ref();
        let mut tiers = self.tiers();

        if let Some(slot) = tiers.handles.get_mut(asset_id) {
            slot.invalid = true;
        }
        let resolved = resolve_locked(provider, &mut tiers, asset_id);
        if resolved.is_none() {
            if let Some(slot) = tiers.handles.remove(asset_id) {
                provider.release(&slot.handle);
            }
        }
        resolved
    }

    /// Drop every tier for `asset_id`, releasing its handles
    pub fn invalidate(&self, asset_id: &str) {
        let provider = &self.inner.provider;
        let mut tiers = self.tiers();

        let mut released = HashSet::new();
        if let Some(slot) = tiers.handles.remove(asset_id) {
            provider.release(&slot.handle);
            released.insert(slot.handle.id());
        }
        tiers.payloads.remove(asset_id);
        if let Some(handle) = tiers.styles.remove(asset_id).and_then(|s| s.handle) {
            if released.insert(handle.id()) {
                provider.release(&handle);
            }
        }
        debug!(asset_id, "Invalidated cache entry");
    }

    /// Record a derived style under `signature`, bound to the current handle
    pub fn put_style(
        &self,
        asset_id: &str,
        signature: Option<&str>,
        color: DominantColor,
        style: DisplayStyle,
    ) -> StyleEntry {
        let mut tiers = self.tiers();
        let handle = tiers
            .handles
            .get(asset_id)
            .filter(|slot| !slot.invalid)
            .map(|slot| slot.handle.clone());

        let entry = StyleEntry {
            signature: signature.map(str::to_string),
            handle,
            color,
            style,
        };
        tiers.styles.insert(asset_id.to_string(), entry.clone());
        entry
    }

    /// Style for `asset_id` if it was computed under the same signature
    pub fn style(&self, asset_id: &str, signature: Option<&str>) -> Option<StyleEntry> {
        let mut tiers = self.tiers();
        let hit = tiers
            .styles
            .get(asset_id)
            .filter(|s| s.signature.as_deref() == signature)
            .cloned();
        if hit.is_some() {
            tiers.stats.style_hits += 1;
        }
        hit
    }

    /// Evict every asset not in `keep`, releasing handles before dropping them
    pub fn cleanup(&self, keep: &HashSet<String>) -> CleanupReport {
        let provider = &self.inner.provider;
        let mut tiers = self.tiers();

        let mut evicted: HashSet<String> = HashSet::new();
        let mut released: HashSet<u64> = HashSet::new();

        let doomed: Vec<String> = tiers.handles.keys().filter(|k| !keep.contains(*k)).cloned().collect();
        for asset_id in doomed {
            if let Some(slot) = tiers.handles.remove(&asset_id) {
                if released.insert(slot.handle.id()) {
                    provider.release(&slot.handle);
                }
            }
            evicted.insert(asset_id);
        }

        let doomed: Vec<String> = tiers.styles.keys().filter(|k| !keep.contains(*k)).cloned().collect();
        for asset_id in doomed {
            if let Some(handle) = tiers.styles.remove(&asset_id).and_then(|s| s.handle) {
                if released.insert(handle.id()) {
                    provider.release(&handle);
                }
            }
            evicted.insert(asset_id);
        }

        tiers.payloads.retain(|asset_id, _| {
            let kept = keep.contains(asset_id);
            if !kept {
                evicted.insert(asset_id.clone());
            }
            kept
        });

        let report = CleanupReport {
            evicted: evicted.len(),
            released_handles: released.len(),
        };
        debug!(evicted = report.evicted, released = report.released_handles, "Cache cleanup");
        report
    }

    pub fn stats(&self) -> CacheStats {
        let tiers = self.tiers();
        CacheStats {
            live_handles: tiers
                .handles
                .values()
                .filter(|slot| !slot.invalid && self.inner.provider.is_live(&slot.handle))
                .count(),
            payloads: tiers.payloads.len(),
            styles: tiers.styles.len(),
            ..tiers.stats
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Resurrect from cached bytes, else the current usable handle
fn resolve_locked(provider: &dyn HandleProvider, tiers: &mut Tiers, asset_id: &str) -> Option<DisplayHandle> {
    if tiers.payloads.contains_key(asset_id) {
        let signature = tiers.handles.get(asset_id).and_then(|s| s.signature.clone());
        return resurrect_locked(provider, tiers, asset_id, signature.as_deref());
    }

    tiers
        .handles
        .get(asset_id)
        .filter(|slot| !slot.invalid && provider.is_live(&slot.handle))
        .map(|slot| slot.handle.clone())
}

fn resurrect_locked(
    provider: &dyn HandleProvider,
    tiers: &mut Tiers,
    asset_id: &str,
    signature: Option<&str>,
) -> Option<DisplayHandle> {
    let payload = tiers.payloads.get(asset_id)?.clone();
    let handle = provider.resurrect(&payload);

    let previous = tiers.handles.insert(
        asset_id.to_string(),
        HandleSlot {
            handle: handle.clone(),
            signature: signature.map(str::to_string),
            invalid: false,
        },
    );
    if let Some(old) = previous {
        provider.release(&old.handle);
    }
    if let Some(style) = tiers.styles.get_mut(asset_id) {
        style.handle = Some(handle.clone());
    }

    tiers.stats.resurrections += 1;
    debug!(asset_id, handle = handle.uri(), "Resurrected display handle");
    Some(handle)
}

fn entry_for(tiers: &Tiers, asset_id: &str, handle: DisplayHandle, signature: Option<&str>) -> CacheEntry {
    let style = tiers
        .styles
        .get(asset_id)
        .filter(|s| s.signature.as_deref() == signature);

    CacheEntry {
        asset_id: asset_id.to_string(),
        handle,
        payload: tiers.payloads.get(asset_id).cloned(),
        color: style.map(|s| s.color),
        style: style.map(|s| s.style.clone()),
        signature: signature.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<MemoryHandles>, CacheStore) {
        let handles = Arc::new(MemoryHandles::new());
        let cache = CacheStore::new(handles.clone());
        (handles, cache)
    }

    fn payload() -> BinaryPayload {
        BinaryPayload::new(vec![0xFF, 0xD8, 0xFF, 0xD9], "image/jpeg")
    }

    fn sample_style() -> (DominantColor, DisplayStyle) {
        let color = DominantColor::new(10, 20, 30);
        (color, color.style(160.0))
    }

    #[test]
    fn test_handle_tier_hit() {
        let (_, cache) = setup();
        let handle = cache.store("a1", payload(), &DisplayHint::default());

        let entry = cache.get("a1", None).unwrap();
        assert_eq!(entry.handle, handle);
        assert!(entry.payload.is_none());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_resurrects_revoked_handle_from_payload() {
        let (handles, cache) = setup();
        let first = cache.store("a1", payload(), &DisplayHint::thumbnail("sig-1"));
        handles.revoke(&first);

        let entry = cache.get("a1", Some("sig-1")).unwrap();
        assert_ne!(entry.handle, first);
        assert!(handles.is_live(&entry.handle));
        assert_eq!(cache.stats().resurrections, 1);

        // second lookup is a plain hit on the new handle
        assert_eq!(cache.get("a1", Some("sig-1")).unwrap().handle, entry.handle);
    }

    #[test]
    fn test_payload_tier_ignores_signature() {
        let (handles, cache) = setup();
        let first = cache.store("a1", payload(), &DisplayHint::thumbnail("old"));
        handles.revoke(&first);

        assert!(cache.get("a1", Some("new")).is_some());
    }

    #[test]
    fn test_non_thumbnail_revoked_is_miss() {
        let (handles, cache) = setup();
        let first = cache.store("a1", payload(), &DisplayHint::default());
        handles.revoke(&first);

        assert!(cache.get("a1", None).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_style_tier_requires_signature() {
        let (_, cache) = setup();
        cache.store("a1", payload(), &DisplayHint::thumbnail("sig-1"));
        let (color, style) = sample_style();
        cache.put_style("a1", Some("sig-1"), color, style.clone());

        let entry = cache.get("a1", Some("sig-1")).unwrap();
        assert_eq!(entry.color, Some(color));
        assert_eq!(entry.style, Some(style));

        let other = cache.get("a1", Some("sig-2")).unwrap();
        assert!(other.color.is_none());
        assert!(cache.style("a1", Some("sig-2")).is_none());
    }

    #[test]
    fn test_style_tier_serves_evicted_handle() {
        let (handles, cache) = setup();
        let handle = handles.create(&payload());
        let (color, style) = sample_style();
        cache.put(CacheEntry {
            asset_id: "a1".into(),
            handle: handle.clone(),
            payload: None,
            color: Some(color),
            style: Some(style),
            signature: Some("sig".into()),
        });

        // evict handle tier only
        cache.tiers().handles.remove("a1");

        let entry = cache.get("a1", Some("sig")).unwrap();
        assert_eq!(entry.handle, handle);
        assert_eq!(cache.stats().style_hits, 1);
        assert!(cache.get("a1", Some("stale")).is_some());
    }

    #[test]
    fn test_store_with_new_signature_drops_style() {
        let (_, cache) = setup();
        cache.store("a1", payload(), &DisplayHint::thumbnail("v1"));
        let (color, style) = sample_style();
        cache.put_style("a1", Some("v1"), color, style);

        cache.store("a1", payload(), &DisplayHint::thumbnail("v2"));
        assert!(cache.style("a1", Some("v1")).is_none());
        assert_eq!(cache.stats().styles, 0);
    }

    #[test]
    fn test_replacing_handle_releases_old() {
        let (handles, cache) = setup();
        let first = cache.store("a1", payload(), &DisplayHint::default());
        let second = cache.store("a1", payload(), &DisplayHint::default());

        assert!(!handles.is_live(&first));
        assert!(handles.is_live(&second));
    }

    #[test]
    fn test_report_render_error_mints_fresh_handle() {
        let (handles, cache) = setup();
        let first = cache.store("a1", payload(), &DisplayHint::thumbnail("s"));

        let fresh = cache.report_render_error("a1").unwrap();
        assert_ne!(fresh, first);
        assert!(!handles.is_live(&first));
        assert!(cache.has_live_handle("a1"));
    }

    #[test]
    fn test_report_render_error_without_bytes() {
        let (_, cache) = setup();
        cache.store("a1", payload(), &DisplayHint::default());

        assert!(cache.report_render_error("a1").is_none());
        assert!(!cache.has_live_handle("a1"));
    }

    #[test]
    fn test_store_after_failed_render_stays_live() {
        let (handles, cache) = setup();
        let broken = cache.store("a1", payload(), &DisplayHint::default());
        assert!(cache.report_render_error("a1").is_none());
        assert!(!handles.is_live(&broken));

        let fresh = cache.store("a1", payload(), &DisplayHint::default());
        assert!(handles.is_live(&fresh));
        assert_eq!(cache.get("a1", None).unwrap().handle, fresh);
    }

    #[test]
    fn test_render_errors_racing_stores_keep_tiers_consistent() {
        let (handles, cache) = setup();

        std::thread::scope(|scope| {
            let storer = cache.clone();
            scope.spawn(move || {
                for _ in 0..500 {
                    storer.store("a1", payload(), &DisplayHint::default());
                }
            });
            let reporter = cache.clone();
            scope.spawn(move || {
                for _ in 0..500 {
                    reporter.report_render_error("a1");
                }
            });
        });

        // Whatever survived is live, and nothing else leaked
        match cache.get("a1", None) {
            Some(entry) => {
                assert!(handles.is_live(&entry.handle));
                assert_eq!(handles.live_count(), 1);
            }
            None => assert_eq!(handles.live_count(), 0),
        }

        let last = cache.store("a1", payload(), &DisplayHint::default());
        assert_eq!(cache.get("a1", None).unwrap().handle, last);
        assert_eq!(handles.live_count(), 1);
    }

    #[test]
    fn test_put_without_payload_drops_old_bytes() {
        let (handles, cache) = setup();
        cache.store("a1", BinaryPayload::new(vec![1, 1, 1], "image/jpeg"), &DisplayHint::thumbnail("s"));

        let replacement = BinaryPayload::new(vec![2, 2, 2], "image/jpeg");
        let handle = handles.create(&replacement);
        cache.put(CacheEntry {
            asset_id: "a1".to_string(),
            handle: handle.clone(),
            payload: None,
            color: None,
            style: None,
            signature: Some("s".to_string()),
        });
        handles.revoke(&handle);

        // No bytes left to resurrect from, so the stale content is never served
        assert!(cache.get("a1", Some("s")).is_none());
        assert_eq!(cache.stats().resurrections, 0);
    }

    #[test]
    fn test_put_drops_style_from_other_signature() {
        let (handles, cache) = setup();
        cache.store("a1", payload(), &DisplayHint::thumbnail("old"));
        let (color, style) = sample_style();
        cache.put_style("a1", Some("old"), color, style);

        let handle = handles.create(&payload());
        cache.put(CacheEntry {
            asset_id: "a1".to_string(),
            handle,
            payload: Some(payload()),
            color: None,
            style: None,
            signature: Some("new".to_string()),
        });

        assert!(cache.style("a1", Some("old")).is_none());
        assert!(cache.get("a1", Some("new")).unwrap().color.is_none());
    }

    #[test]
    fn test_invalidate_releases_everything() {
        let (handles, cache) = setup();
        let handle = cache.store("a1", payload(), &DisplayHint::thumbnail("s"));
        let (color, style) = sample_style();
        cache.put_style("a1", Some("s"), color, style);

        cache.invalidate("a1");
        assert!(!handles.is_live(&handle));
        assert!(cache.get("a1", Some("s")).is_none());
        assert_eq!(handles.live_count(), 0);
    }

    #[test]
    fn test_cleanup_keeps_only_keep_set() {
        let (handles, cache) = setup();
        cache.store("keep", payload(), &DisplayHint::thumbnail("s"));
        cache.store("drop1", payload(), &DisplayHint::thumbnail("s"));
        cache.store("drop2", payload(), &DisplayHint::default());

        let keep: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let report = cache.cleanup(&keep);

        assert_eq!(report.evicted, 2);
        assert_eq!(report.released_handles, 2);
        assert_eq!(handles.live_count(), 1);
        assert!(cache.has_live_handle("keep"));
        assert!(cache.get("drop1", Some("s")).is_none());
    }
}
