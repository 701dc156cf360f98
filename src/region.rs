//! # Unmanaged Region
//!
//! A user-declared memory area that backs zero-copy [`Message`](crate::message::Message)s
//! without a per-message release callback. Instead, the transport
//! accumulates "no longer needed" `(offset, length, hint)` triples and
//! invokes a single bulk callback in batches (§4.7).
//!
//! The region must outlive every message built from it; this is enforced
//! structurally by [`RegionHandle`] being a cheap `Arc` clone that each
//! [`Message::InRegion`](crate::message::Message) keeps alive.
//!
//! Grounded on the region-backed ring buffer in the teacher's
//! `ipc::shared_memory` transport, generalized into a transport-agnostic
//! buffer pool as the "unmanaged region" of FairMQ's `UnmanagedRegion.h`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::{Arc, Weak};

/// Opaque identifier for a region, unique within the owning device.
pub type RegionTag = u64;

fn next_tag() -> RegionTag {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A single `(offset, length, hint)` release event, queued until the
/// bulk callback flushes.
#[derive(Debug, Clone)]
pub struct ReleaseEvent {
    pub offset: usize,
    pub len: usize,
    pub hint: Option<String>,
}

/// Lifecycle events a region can report to an optional subscriber on the
/// transport factory that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionEvent {
    Created,
    Destroyed,
}

/// The bulk release callback: `(events) -> ()`, invoked with every
/// accumulated release since the last flush.
pub type BulkReleaseFn = Arc<dyn Fn(&[ReleaseEvent]) + Send + Sync>;

/// Region lifecycle subscriber, injected by the transport factory.
pub type RegionEventFn = Arc<dyn Fn(RegionTag, RegionEvent) + Send + Sync>;

/// Configuration for a region: an identifier, an optional filesystem
/// backing hint (used by shared-memory-backed regions), and the flush
/// threshold controlling how many releases accumulate before the bulk
/// callback fires.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    pub path: Option<String>,
    /// Number of pending release events that triggers an automatic flush.
    /// `1` flushes on every release (no batching); this is the default.
    pub flush_threshold: usize,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self { path: None, flush_threshold: 1 }
    }
}

/// What actually backs a region's bytes. `Heap` is the common case;
/// `Shared` wraps an OS-level `shared_memory::Shmem` mapping so a region
/// can be handed to a second process by name (§6); `Foreign` wraps a
/// caller-supplied pointer whose lifetime the caller vouches for
/// ([`UnmanagedRegion::from_raw`]).
enum Backing {
    Heap(Box<[u8]>),
    Shared(shared_memory::Shmem),
    Foreign,
}

// SAFETY: `shared_memory::Shmem` wraps a raw mapping pointer that is not
// `Sync` by default; this region only exposes it through bounds-checked
// slices behind `&self`, the same discipline already relied on for the
// heap-backed and foreign-pointer cases below.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

struct Storage {
    backing: Backing,
    base: *mut u8,
    len: usize,
}

// SAFETY: `base` is derived from `backing` (heap memory or a shared
// mapping we own) or from a caller-supplied mapping guaranteed by the
// constructor's contract to outlive the region. All access goes through
// bounds-checked slices.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

/// A user-owned memory area that zero-copy messages can reference.
pub struct UnmanagedRegion {
    tag: RegionTag,
    size: usize,
    config: RegionConfig,
    storage: Storage,
    callback: Option<BulkReleaseFn>,
    pending: Mutex<Vec<ReleaseEvent>>,
    lifecycle: Option<RegionEventFn>,
}

impl Drop for UnmanagedRegion {
    fn drop(&mut self) {
        self.flush();
        if let Some(cb) = &self.lifecycle {
            cb(self.tag, RegionEvent::Destroyed);
        }
    }
}

/// A cheaply-cloneable handle to an [`UnmanagedRegion`]. Every
/// `Message::InRegion` keeps one of these alive so the region cannot be
/// dropped while messages still reference it.
#[derive(Clone)]
pub struct RegionHandle(Arc<UnmanagedRegion>);

/// A non-owning reference to a region, used where keeping it alive would
/// be a cycle (e.g. diagnostics that should not extend the region's
/// lifetime).
#[derive(Clone)]
pub struct WeakRegionHandle(Weak<UnmanagedRegion>);

impl UnmanagedRegion {
    /// Create a heap-backed region of `size` bytes with the given bulk
    /// release callback.
    pub fn new(size: usize, config: RegionConfig, callback: Option<BulkReleaseFn>) -> RegionHandle {
        Self::with_lifecycle(size, config, callback, None)
    }

    /// Create a region and register a lifecycle subscriber, as a
    /// transport factory does when it wants `Created`/`Destroyed`
    /// notifications (§4.7).
    pub fn with_lifecycle(
        size: usize,
        config: RegionConfig,
        callback: Option<BulkReleaseFn>,
        lifecycle: Option<RegionEventFn>,
    ) -> RegionHandle {
        let mut owned = vec![0u8; size].into_boxed_slice();
        let base = owned.as_mut_ptr();
        let tag = next_tag();
        if let Some(cb) = &lifecycle {
            cb(tag, RegionEvent::Created);
        }
        let region = UnmanagedRegion {
            tag,
            size,
            config,
            storage: Storage { backing: Backing::Heap(owned), base, len: size },
            callback,
            pending: Mutex::new(Vec::new()),
            lifecycle,
        };
        RegionHandle(Arc::new(region))
    }

    /// Create a region backed by an OS-level shared-memory segment
    /// identified by `os_id`, so a second process naming the same id can
    /// map the identical bytes (§6). Falls back to the caller on failure
    /// (e.g. no `/dev/shm` in a sandboxed environment) rather than
    /// panicking; callers that don't need cross-process sharing should
    /// use [`UnmanagedRegion::new`] instead.
    pub fn new_shared(
        size: usize,
        os_id: impl AsRef<str>,
        config: RegionConfig,
        callback: Option<BulkReleaseFn>,
    ) -> crate::error::Result<RegionHandle> {
        let shmem = shared_memory::ShmemConf::new()
            .size(size)
            .os_id(os_id.as_ref())
            .create()
            .map_err(|e| crate::error::DeviceError::TransportError {
                transport: "shmem".to_string(),
                reason: format!("failed to create shared region {}: {e}", os_id.as_ref()),
            })?;
        let base = shmem.as_ptr();
        let tag = next_tag();
        let region = UnmanagedRegion {
            tag,
            size,
            config,
            storage: Storage { backing: Backing::Shared(shmem), base, len: size },
            callback,
            pending: Mutex::new(Vec::new()),
            lifecycle: None,
        };
        Ok(RegionHandle(Arc::new(region)))
    }

    /// Wrap an externally mapped segment (e.g. a `shared_memory::Shmem`
    /// mapping) as a region, without taking ownership of the mapping's
    /// lifetime. The caller must keep the mapping alive for at least as
    /// long as the returned handle.
    ///
    /// # Safety
    /// `base` must be valid for reads/writes of `size` bytes for the
    /// entire lifetime of the returned handle.
    pub unsafe fn from_raw(
        base: *mut u8,
        size: usize,
        config: RegionConfig,
        callback: Option<BulkReleaseFn>,
        lifecycle: Option<RegionEventFn>,
    ) -> RegionHandle {
        let tag = next_tag();
        if let Some(cb) = &lifecycle {
            cb(tag, RegionEvent::Created);
        }
        let region = UnmanagedRegion {
            tag,
            size,
            config,
            storage: Storage { backing: Backing::Foreign, base, len: size },
            callback,
            pending: Mutex::new(Vec::new()),
            lifecycle,
        };
        RegionHandle(Arc::new(region))
    }
}

impl RegionHandle {
    pub fn tag(&self) -> RegionTag {
        self.0.tag
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn path_hint(&self) -> Option<&str> {
        self.0.config.path.as_deref()
    }

    pub fn downgrade(&self) -> WeakRegionHandle {
        WeakRegionHandle(Arc::downgrade(&self.0))
    }

    /// Borrow `len` bytes at `offset` within the region.
    pub fn as_slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset + len <= self.0.storage.len,
            "region sub-range out of bounds: offset={offset} len={len} region_size={}",
            self.0.storage.len
        );
        unsafe { std::slice::from_raw_parts(self.0.storage.base.add(offset), len) }
    }

    /// Borrow `len` bytes at `offset` mutably, for filling a region-backed
    /// message before handing it to a transport.
    pub fn as_mut_slice(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(
            offset + len <= self.0.storage.len,
            "region sub-range out of bounds: offset={offset} len={len} region_size={}",
            self.0.storage.len
        );
        unsafe { std::slice::from_raw_parts_mut(self.0.storage.base.add(offset), len) }
    }

    /// Record that `(offset, length, hint)` is no longer needed by the
    /// transport. Flushes immediately once `flush_threshold` pending
    /// events accumulate.
    pub fn release(&self, offset: usize, len: usize, hint: Option<&str>) {
        let mut pending = self.0.pending.lock().unwrap();
        pending.push(ReleaseEvent { offset, len, hint: hint.map(str::to_owned) });
        if pending.len() >= self.0.config.flush_threshold {
            drop(pending);
            self.flush();
        }
    }

    /// Force-flush any pending release events to the bulk callback now.
    pub fn flush(&self) {
        self.0.flush();
    }
}

impl UnmanagedRegion {
    fn flush(&self) {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return;
        }
        let events = std::mem::take(&mut *pending);
        drop(pending);
        if let Some(cb) = &self.callback {
            cb(&events);
        }
    }
}

impl WeakRegionHandle {
    pub fn upgrade(&self) -> Option<RegionHandle> {
        self.0.upgrade().map(RegionHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn release_fires_immediately_with_default_threshold() {
        let fired: Arc<Mutex<Vec<ReleaseEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let fired_clone = fired.clone();
        let cb: BulkReleaseFn = Arc::new(move |events| {
            fired_clone.lock().unwrap().extend_from_slice(events);
        });
        let region = UnmanagedRegion::new(64, RegionConfig::default(), Some(cb));
        region.release(0, 8, None);
        assert_eq!(fired.lock().unwrap().len(), 1);
        region.release(8, 8, Some("hint"));
        assert_eq!(fired.lock().unwrap().len(), 2);
    }

    #[test]
    fn batched_release_invokes_callback_once_covering_all_triples() {
        let batches: Arc<Mutex<Vec<Vec<ReleaseEvent>>>> = Arc::new(Mutex::new(Vec::new()));
        let batches_clone = batches.clone();
        let cb: BulkReleaseFn = Arc::new(move |events| {
            batches_clone.lock().unwrap().push(events.to_vec());
        });
        let config = RegionConfig { path: None, flush_threshold: 3 };
        let region = UnmanagedRegion::new(64, config, Some(cb));

        region.release(0, 4, None);
        region.release(4, 4, None);
        assert!(batches.lock().unwrap().is_empty(), "should not flush below threshold");
        region.release(8, 4, None);

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[test]
    fn region_outlives_handle_clones_via_arc() {
        let region = UnmanagedRegion::new(16, RegionConfig::default(), None);
        let clone = region.clone();
        let weak = region.downgrade();
        drop(region);
        assert!(weak.upgrade().is_some(), "clone keeps the region alive");
        drop(clone);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn as_slice_and_as_mut_slice_reference_the_same_bytes() {
        let region = UnmanagedRegion::new(16, RegionConfig::default(), None);
        region.as_mut_slice(0, 4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(region.as_slice(0, 4), &[1, 2, 3, 4]);
    }

    #[test]
    fn lifecycle_events_report_created_and_destroyed_once_each() {
        let events: Arc<Mutex<Vec<RegionEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let lifecycle: RegionEventFn = Arc::new(move |_tag, ev| events_clone.lock().unwrap().push(ev));
        let region = UnmanagedRegion::with_lifecycle(16, RegionConfig::default(), None, Some(lifecycle));
        drop(region);
        let events = events.lock().unwrap();
        assert_eq!(*events, vec![RegionEvent::Created, RegionEvent::Destroyed]);
    }

    #[test]
    #[allow(dead_code)]
    fn region_tags_are_unique() {
        let a = UnmanagedRegion::new(8, RegionConfig::default(), None);
        let b = UnmanagedRegion::new(8, RegionConfig::default(), None);
        assert_ne!(a.tag(), b.tag());
        let _ = AtomicUsize::new(0); // keep import used across cfg combos
    }

    #[test]
    fn new_shared_maps_a_real_os_backed_segment() {
        let os_id = format!("devicemesh-test-{}", std::process::id());
        let region = UnmanagedRegion::new_shared(64, &os_id, RegionConfig::default(), None)
            .expect("shared-memory segment creation");
        region.as_mut_slice(0, 4).copy_from_slice(&[9, 8, 7, 6]);
        assert_eq!(region.as_slice(0, 4), &[9, 8, 7, 6]);
        assert_eq!(region.size(), 64);
    }
}
