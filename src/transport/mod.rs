//! # Transport Factory
//!
//! A transport instantiates the sockets, messages, and unmanaged regions
//! for one transfer mechanism, and owns the interrupt flag shared by
//! every socket it creates (§6, §4.7, §9 Open Questions).
//!
//! Three reference transports are in scope, one per module here:
//! `tcp` (out-of-process TCP/IPC, tag `zeromq`), `inproc` (in-process
//! lightweight transport, tag `nanomsg`), and `shmem` (shared-memory,
//! tag `shmem`) — named after the config store's `transport` key's
//! enumerated values (§6).
//!
//! Grounded on the teacher's `ipc::TransportFactory`/`IpcTransport`
//! pairing (one factory trait object per mechanism, async socket trait)
//! and on `FairMQ`'s per-transport `CreateMessage*`/`CreateSocket`/
//! `CreatePoller`/`CreateUnmanagedRegion` plugin surface.

pub mod inproc;
pub mod shmem;
pub mod tcp;

use crate::channel::SocketType;
use crate::error::DeviceError;
use crate::interrupt::InterruptFlag;
use crate::region::{BulkReleaseFn, RegionConfig, RegionEventFn, RegionHandle, UnmanagedRegion};
use crate::socket::Socket;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// A queue bridging a transport's background reader task(s) and the
/// `Socket::receive`/`readable` front shared by `tcp` and `inproc`:
/// readiness (`readable`) can be observed without consuming the item
/// `receive` would later take, which a bare `mpsc::Receiver` cannot do.
pub(crate) struct Inbox<T> {
    queue: Mutex<std::collections::VecDeque<T>>,
    pending: AtomicUsize,
    notify: Notify,
}

impl<T> Default for Inbox<T> {
    fn default() -> Self {
        Self { queue: Mutex::new(std::collections::VecDeque::new()), pending: AtomicUsize::new(0), notify: Notify::new() }
    }
}

impl<T> Inbox<T> {
    pub fn push(&self, item: T) {
        self.queue.lock().unwrap().push_back(item);
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn try_pop(&self) -> Option<T> {
        let mut q = self.queue.lock().unwrap();
        let item = q.pop_front();
        if item.is_some() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Resolve once an item is available, without consuming it. Wrapped
    /// by [`crate::poller::Poller`] in a zero-duration timeout for a
    /// non-blocking "is something here right now" check.
    pub async fn readable(&self) -> std::io::Result<()> {
        loop {
            if self.pending.load(Ordering::SeqCst) > 0 {
                return Ok(());
            }
            self.notify.notified().await;
        }
    }

    /// Wait until an item is available and pop it.
    pub async fn pop_wait(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}

/// A future that is always immediately ready, used by sockets whose
/// write side never blocks in this crate's transports (the underlying
/// queues are unbounded — a production shmem/tcp transport would instead
/// track kernel/ring buffer backpressure here).
pub(crate) struct AlwaysReady;

impl std::future::Future for AlwaysReady {
    type Output = std::io::Result<()>;
    fn poll(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        std::task::Poll::Ready(Ok(()))
    }
}

/// A plugin supplying sockets, unmanaged regions, and the interrupt
/// signal shared by every socket it creates, for one transfer mechanism.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The tag this transport is registered under (§6): `zeromq`,
    /// `nanomsg`, or `shmem` for the three reference transports.
    fn tag(&self) -> &str;

    fn create_socket(&self, socket_type: SocketType) -> Arc<dyn Socket>;

    fn create_region(
        &self,
        size: usize,
        config: RegionConfig,
        callback: Option<BulkReleaseFn>,
        lifecycle: Option<RegionEventFn>,
    ) -> RegionHandle {
        UnmanagedRegion::with_lifecycle(size, config, callback, lifecycle)
    }

    /// Interrupt every socket this transport has created (§4.4, §9).
    fn interrupt(&self);

    fn resume(&self);

    /// Tear down all sockets created by this transport, as happens on
    /// `ResettingDevice` (§4.2).
    async fn reset(&self);
}

/// Registry of transports by tag, used by the Device Core to resolve a
/// channel's `transport` field into a concrete implementation.
#[derive(Default)]
pub struct Factory {
    transports: Mutex<HashMap<String, Arc<dyn Transport>>>,
}

impl Factory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the three reference transports under their conventional
    /// tags, plus `"default"` aliasing whichever one `default_tag` names.
    pub fn with_defaults(default_tag: &str) -> Result<Self, DeviceError> {
        let factory = Self::new();
        factory.register(Arc::new(tcp::TcpTransport::new(InterruptFlag::new())));
        factory.register(Arc::new(inproc::InprocTransport::new(InterruptFlag::new())));
        factory.register(Arc::new(shmem::ShmemTransport::new(InterruptFlag::new())));
        let chosen = factory.get(default_tag).ok_or_else(|| DeviceError::TransportError {
            transport: default_tag.to_string(),
            reason: "unknown transport tag".to_string(),
        })?;
        factory.transports.lock().unwrap().insert("default".to_string(), chosen);
        Ok(factory)
    }

    pub fn register(&self, transport: Arc<dyn Transport>) {
        self.transports.lock().unwrap().insert(transport.tag().to_string(), transport);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Transport>> {
        self.transports.lock().unwrap().get(tag).cloned()
    }

    pub async fn reset_all(&self) {
        let all: Vec<_> = self.transports.lock().unwrap().values().cloned().collect();
        for t in all {
            t.reset().await;
        }
    }

    pub fn interrupt_all(&self) {
        for t in self.transports.lock().unwrap().values() {
            t.interrupt();
        }
    }

    pub fn resume_all(&self) {
        for t in self.transports.lock().unwrap().values() {
            t.resume();
        }
    }
}
