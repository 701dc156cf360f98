//! # In-process Transport
//!
//! The lightweight, nanomsg-like transport (§6), registered under tag
//! `nanomsg`. Endpoints are named in-process mailboxes rather than
//! network addresses: `bind("inproc://name")` registers the mailbox,
//! `connect("inproc://name")` attaches to it. No bytes cross a socket;
//! messages are copied into owned buffers and handed across `tokio`
//! channels, matching the "implicit copy" invariant already required of
//! cross-transport sends (§3) — here applied internally since the
//! registry only carries byte vectors, not live `Message` ownership.
//!
//! Grounded on nanomsg's inproc transport semantics (named, process-local
//! rendezvous points) and on this crate's own `transport::tcp` for the
//! `Inbox`-based readiness/receive shape.

use super::{Inbox, AlwaysReady, Transport};
use crate::channel::SocketType;
use crate::error::DeviceError;
use crate::interrupt::InterruptFlag;
use crate::message::{Message, MultipartMessage};
use crate::socket::{race_interrupt_timeout, Socket, SocketCounters, SocketOptions, Transfer};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::mpsc;

type Frame = Vec<Vec<u8>>;

fn to_frame(parts: &MultipartMessage) -> Frame {
    parts.iter().map(|m| m.as_slice().to_vec()).collect()
}

fn from_frame(frame: Frame) -> MultipartMessage {
    MultipartMessage::from_vec(frame.into_iter().map(|b| Message::Owned(b.into_boxed_slice())).collect())
}

/// A registered mailbox: connecting sockets send to the bound side over
/// `to_bound`, and receive whatever the bound side publishes over
/// `from_bound` (a broadcast so `Pub`-like fan-out reaches every
/// subscriber).
struct Endpoint {
    to_bound_tx: mpsc::UnboundedSender<Frame>,
    to_bound_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    from_bound: broadcast::Sender<Frame>,
}

#[derive(Default)]
struct Registry {
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
}

impl Registry {
    fn get_or_create(&self, name: &str) -> Arc<Endpoint> {
        let mut endpoints = self.endpoints.lock().unwrap();
        endpoints
            .entry(name.to_string())
            .or_insert_with(|| {
                let (to_bound_tx, to_bound_rx) = mpsc::unbounded_channel();
                let (from_bound, _) = broadcast::channel(1024);
                Arc::new(Endpoint { to_bound_tx, to_bound_rx: Mutex::new(Some(to_bound_rx)), from_bound })
            })
            .clone()
    }
}

enum Role {
    Unbound,
    Bound { inbox: Arc<Inbox<MultipartMessage>>, endpoint: Arc<Endpoint> },
    Connected { endpoint: Arc<Endpoint>, inbox: Arc<Inbox<MultipartMessage>> },
}

struct InprocSocket {
    pattern: SocketType,
    options: SocketOptions,
    counters: SocketCounters,
    interrupt: Arc<InterruptFlag>,
    role: Mutex<Role>,
    registry: Arc<Registry>,
}

impl InprocSocket {
    fn new(pattern: SocketType, interrupt: Arc<InterruptFlag>, registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            pattern,
            options: SocketOptions::default(),
            counters: SocketCounters::default(),
            interrupt,
            role: Mutex::new(Role::Unbound),
            registry,
        })
    }
}

#[async_trait]
impl Socket for InprocSocket {
    async fn bind(&self, addr: &str) -> Result<String, DeviceError> {
        let name = addr.strip_prefix("inproc://").unwrap_or(addr).to_string();
        let endpoint = self.registry.get_or_create(&name);
        let mut rx = endpoint.to_bound_rx.lock().unwrap().take().ok_or_else(|| DeviceError::AddressInUse {
            address: addr.to_string(),
        })?;
        let inbox = Arc::new(Inbox::default());
        let inbox_clone = inbox.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                inbox_clone.push(from_frame(frame));
            }
        });
        *self.role.lock().unwrap() = Role::Bound { inbox, endpoint };
        Ok(format!("inproc://{name}"))
    }

    async fn connect(&self, addr: &str) -> Result<(), DeviceError> {
        let name = addr.strip_prefix("inproc://").unwrap_or(addr).to_string();
        let endpoint = self.registry.get_or_create(&name);
        let mut from_bound_rx = endpoint.from_bound.subscribe();
        let inbox = Arc::new(Inbox::default());
        let inbox_clone = inbox.clone();
        tokio::spawn(async move {
            loop {
                match from_bound_rx.recv().await {
                    Ok(frame) => inbox_clone.push(from_frame(frame)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.role.lock().unwrap() = Role::Connected { endpoint, inbox };
        Ok(())
    }

    async fn send(&self, msg: Message, timeout_ms: i64) -> Transfer<usize> {
        let mut parts = MultipartMessage::new();
        parts.push(msg);
        self.send_parts(parts, timeout_ms).await
    }

    async fn receive(&self, timeout_ms: i64) -> Transfer<Message> {
        match self.receive_parts(timeout_ms).await {
            Transfer::Done(mut parts) => {
                Transfer::Done(parts.into_vec().drain(..).next().unwrap_or(Message::Empty))
            }
            Transfer::Timeout => Transfer::Timeout,
            Transfer::Interrupted => Transfer::Interrupted,
            Transfer::Error(e) => Transfer::Error(e),
        }
    }

    async fn send_parts(&self, parts: MultipartMessage, timeout_ms: i64) -> Transfer<usize> {
        let bytes = parts.total_bytes();
        let frame = to_frame(&parts);
        let role = self.role.lock().unwrap();
        let outcome = match &*role {
            Role::Unbound => return Transfer::Error("socket is neither bound nor connected".to_string()),
            Role::Bound { endpoint, .. } => endpoint.from_bound.send(frame).map(|_| ()).map_err(|_| "no subscribers"),
            Role::Connected { endpoint, .. } => {
                endpoint.to_bound_tx.send(frame).map_err(|_| "bound side gone")
            }
        };
        drop(role);
        match race_interrupt_timeout(&self.interrupt, timeout_ms, async move {
            outcome
                .map(|_| bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        })
        .await
        {
            Transfer::Done(n) => {
                self.counters.record_send(n);
                Transfer::Done(n)
            }
            other => other,
        }
    }

    async fn receive_parts(&self, timeout_ms: i64) -> Transfer<MultipartMessage> {
        let inbox = match &*self.role.lock().unwrap() {
            Role::Bound { inbox, .. } | Role::Connected { inbox, .. } => inbox.clone(),
            Role::Unbound => return Transfer::Error("socket is neither bound nor connected".to_string()),
        };
        let result = race_interrupt_timeout(&self.interrupt, timeout_ms, async move { Ok(inbox.pop_wait().await) }).await;
        if let Transfer::Done(parts) = &result {
            self.counters.record_receive(parts.total_bytes());
        }
        result
    }

    async fn readable(&self) -> std::io::Result<()> {
        let inbox = match &*self.role.lock().unwrap() {
            Role::Bound { inbox, .. } | Role::Connected { inbox, .. } => Some(inbox.clone()),
            Role::Unbound => None,
        };
        match inbox {
            Some(inbox) => inbox.readable().await,
            None => std::future::pending().await,
        }
    }

    async fn writable(&self) -> std::io::Result<()> {
        AlwaysReady.await
    }

    fn options(&self) -> &SocketOptions {
        &self.options
    }

    fn counters(&self) -> &SocketCounters {
        &self.counters
    }

    fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    fn resume(&self) {
        self.interrupt.resume();
    }

    async fn close(&self) {
        *self.role.lock().unwrap() = Role::Unbound;
    }
}

/// Factory for in-process sockets, tagged `nanomsg` (§6).
pub struct InprocTransport {
    interrupt: Arc<InterruptFlag>,
    registry: Arc<Registry>,
    sockets: Mutex<Vec<Arc<InprocSocket>>>,
}

impl InprocTransport {
    pub fn new(interrupt: Arc<InterruptFlag>) -> Self {
        Self { interrupt, registry: Arc::new(Registry::default()), sockets: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl Transport for InprocTransport {
    fn tag(&self) -> &str {
        "nanomsg"
    }

    fn create_socket(&self, socket_type: SocketType) -> Arc<dyn Socket> {
        let socket = InprocSocket::new(socket_type, self.interrupt.clone(), self.registry.clone());
        self.sockets.lock().unwrap().push(socket.clone());
        socket
    }

    fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    fn resume(&self) {
        self.interrupt.resume();
    }

    async fn reset(&self) {
        let sockets: Vec<_> = self.sockets.lock().unwrap().drain(..).collect();
        for s in sockets {
            s.close().await;
        }
        self.registry.endpoints.lock().unwrap().clear();
    }
}
