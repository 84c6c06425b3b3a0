//! Display handles
//!
//! A `DisplayHandle` is a revocable, process-local reference to a payload that a
//! renderer can consume (an object URL in a browser, a mapped buffer natively).
//! The `HandleProvider` capability mints and releases them; `MemoryHandles` is the
//! in-process implementation backed by a registry of live payloads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::payload::BinaryPayload;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisplayHandle {
    id: u64,
    uri: String,
}

impl DisplayHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// Mints and releases display handles
pub trait HandleProvider: Send + Sync {
    fn create(&self, payload: &BinaryPayload) -> DisplayHandle;

    /// Release the resource behind `handle`. Releasing twice is a no-op.
    fn release(&self, handle: &DisplayHandle);

    /// Whether `handle` still resolves to its payload
    fn is_live(&self, handle: &DisplayHandle) -> bool;

    /// Mint a fresh handle for bytes whose previous handle went stale
    fn resurrect(&self, payload: &BinaryPayload) -> DisplayHandle {
        self.create(payload)
    }
}

/// In-memory handle registry (`mem://asset/<n>`)
#[derive(Default)]
pub struct MemoryHandles {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, BinaryPayload>>,
}

impl MemoryHandles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload behind a live handle
    pub fn resolve(&self, handle: &DisplayHandle) -> Option<BinaryPayload> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.id)
            .cloned()
    }

    /// Invalidate a handle out of band, the way a runtime revokes an object URL
    pub fn revoke(&self, handle: &DisplayHandle) {
        self.release(handle);
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl HandleProvider for MemoryHandles {
    fn create(&self, payload: &BinaryPayload) -> DisplayHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, payload.clone());
        DisplayHandle {
            id,
            uri: format!("mem://asset/{}", id),
        }
    }

    fn release(&self, handle: &DisplayHandle) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id);
    }

    fn is_live(&self, handle: &DisplayHandle) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&handle.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_resolve_revoke() {
        let handles = MemoryHandles::new();
        let payload = BinaryPayload::new(vec![1, 2, 3], "image/png");

        let first = handles.create(&payload);
        let second = handles.create(&payload);
        assert_ne!(first, second);
        assert!(first.uri().starts_with("mem://asset/"));
        assert_eq!(handles.resolve(&first).unwrap().bytes(), &[1, 2, 3]);

        handles.revoke(&first);
        assert!(!handles.is_live(&first));
        assert!(handles.is_live(&second));
        assert_eq!(handles.live_count(), 1);

        handles.release(&first);
        assert_eq!(handles.live_count(), 1);
    }
}
