//! # Socket
//!
//! A transport-owned endpoint: bind/connect, send/receive with
//! interrupt-aware blocking, options, and running counters (§4.4).
//!
//! Grounded on the teacher's `ipc::IpcTransport` trait (async-first,
//! `Send + Sync`, one trait object per mechanism) and on the
//! `FairMQSocket`/`FairMQSocketZMQ` pair from the original source: a
//! generic socket interface with one concrete implementation per
//! transport.

use crate::interrupt::{InterruptFlag, SUB_WAIT_MS};
use crate::message::{Message, MultipartMessage};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Outcome of a send/receive operation: either the completed value or one
/// of the negative sentinels from §7 (`Timeout`, `Interrupted`, a
/// transport error). Modeled as an enum rather than C's "non-negative
/// count vs. negative code" convention, since Rust has no need to
/// overload a single integer's sign.
#[derive(Debug)]
pub enum Transfer<T> {
    Done(T),
    Timeout,
    Interrupted,
    Error(String),
}

impl<T> Transfer<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Transfer::Done(_))
    }

    pub fn into_done(self) -> Option<T> {
        match self {
            Transfer::Done(v) => Some(v),
            _ => None,
        }
    }
}

/// Race an async operation against the shared interrupt flag and an
/// overall deadline, re-checking both at least every [`SUB_WAIT_MS`] so
/// an `Interrupt()` issued mid-wait is observed promptly (§4.4, §5, and
/// the testable property "after Interrupt(), every outstanding blocking
/// transfer returns Interrupted within ≤200ms").
///
/// `timeout_ms = -1` waits indefinitely (but remains interruptible);
/// `timeout_ms = 0` allows only a single immediate attempt.
pub async fn race_interrupt_timeout<Fut, T>(
    interrupt: &InterruptFlag,
    timeout_ms: i64,
    op: Fut,
) -> Transfer<T>
where
    Fut: Future<Output = std::io::Result<T>>,
{
    tokio::pin!(op);

    if timeout_ms == 0 {
        return match tokio::time::timeout(Duration::from_millis(0), &mut op).await {
            Ok(Ok(v)) => Transfer::Done(v),
            Ok(Err(e)) => Transfer::Error(e.to_string()),
            Err(_) => Transfer::Timeout,
        };
    }

    let deadline =
        (timeout_ms > 0).then(|| tokio::time::Instant::now() + Duration::from_millis(timeout_ms as u64));

    loop {
        if interrupt.is_interrupted() {
            return Transfer::Interrupted;
        }

        let slice = match deadline {
            Some(d) => {
                let remaining = d.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Transfer::Timeout;
                }
                remaining.min(Duration::from_millis(SUB_WAIT_MS))
            }
            None => Duration::from_millis(SUB_WAIT_MS),
        };

        tokio::select! {
            biased;
            _ = interrupt.wait() => return Transfer::Interrupted,
            res = &mut op => {
                return match res {
                    Ok(v) => Transfer::Done(v),
                    Err(e) => Transfer::Error(e.to_string()),
                };
            }
            _ = tokio::time::sleep(slice) => continue,
        }
    }
}

/// Socket options settable/gettable independently of the transport
/// implementation (§4.4): linger, high-water marks, kernel buffer sizes.
pub struct SocketOptions {
    linger_ms: AtomicI64,
    snd_hwm: AtomicI64,
    rcv_hwm: AtomicI64,
    snd_kernel_size: AtomicI64,
    rcv_kernel_size: AtomicI64,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            linger_ms: AtomicI64::new(500),
            snd_hwm: AtomicI64::new(1000),
            rcv_hwm: AtomicI64::new(1000),
            snd_kernel_size: AtomicI64::new(0),
            rcv_kernel_size: AtomicI64::new(0),
        }
    }
}

macro_rules! option_accessor {
    ($field:ident, $getter:ident, $setter:ident) => {
        pub fn $getter(&self) -> i64 {
            self.$field.load(Ordering::Relaxed)
        }
        pub fn $setter(&self, value: i64) {
            self.$field.store(value, Ordering::Relaxed);
        }
    };
}

impl SocketOptions {
    option_accessor!(linger_ms, linger, set_linger);
    option_accessor!(snd_hwm, snd_hwm, set_snd_hwm);
    option_accessor!(rcv_hwm, rcv_hwm, set_rcv_hwm);
    option_accessor!(snd_kernel_size, snd_kernel_size, set_snd_kernel_size);
    option_accessor!(rcv_kernel_size, rcv_kernel_size, set_rcv_kernel_size);
}

/// Running transfer counters, updated atomically after every successful
/// transfer. A multi-part transfer counts as one message and as many
/// bytes as the sum of its parts (§4.4).
#[derive(Default)]
pub struct SocketCounters {
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
    messages_tx: AtomicU64,
    messages_rx: AtomicU64,
}

impl SocketCounters {
    pub fn record_send(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_tx(&self) -> u64 {
        self.bytes_tx.load(Ordering::Relaxed)
    }
    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx.load(Ordering::Relaxed)
    }
    pub fn messages_tx(&self) -> u64 {
        self.messages_tx.load(Ordering::Relaxed)
    }
    pub fn messages_rx(&self) -> u64 {
        self.messages_rx.load(Ordering::Relaxed)
    }
}

/// One endpoint of a channel (§3, §4.4). Transport implementations
/// (`transport::tcp`, `transport::inproc`, `transport::shmem`) provide
/// this trait; `Channel` is the validated, named wrapper around it.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Bind to `addr`, returning the (possibly rewritten, e.g. for
    /// auto-assigned ports) address actually bound.
    async fn bind(&self, addr: &str) -> Result<String, crate::error::DeviceError>;

    /// Connect to `addr`. May be retried by the caller on failure
    /// (§4.3 `AttachEndpoint` returns `Retry` for this case).
    async fn connect(&self, addr: &str) -> Result<(), crate::error::DeviceError>;

    async fn send(&self, msg: Message, timeout_ms: i64) -> Transfer<usize>;

    async fn receive(&self, timeout_ms: i64) -> Transfer<Message>;

    async fn send_parts(&self, parts: MultipartMessage, timeout_ms: i64) -> Transfer<usize>;

    async fn receive_parts(&self, timeout_ms: i64) -> Transfer<MultipartMessage>;

    /// Resolve once the socket has at least one message available to
    /// receive, without consuming it. Used by [`crate::poller::Poller`]
    /// for level-triggered input readiness.
    async fn readable(&self) -> std::io::Result<()>;

    /// Resolve once the socket has room to accept another send. Used by
    /// [`crate::poller::Poller`] for level-triggered output readiness.
    async fn writable(&self) -> std::io::Result<()>;

    fn options(&self) -> &SocketOptions;

    fn counters(&self) -> &SocketCounters;

    /// Process-scoped (per transport instance, see `interrupt` module
    /// docs) interrupt: every blocking call on every socket of this
    /// transport returns `Interrupted` promptly.
    fn interrupt(&self);

    fn resume(&self);

    /// Idempotent; invoked on channel drop.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::InterruptFlag;
    use std::time::Instant;

    #[tokio::test]
    async fn immediate_timeout_returns_quickly_with_no_peer() {
        let interrupt = InterruptFlag::new();
        let start = Instant::now();
        let result: Transfer<()> =
            race_interrupt_timeout(&interrupt, 0, std::future::pending()).await;
        assert!(matches!(result, Transfer::Timeout));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn bounded_timeout_returns_within_epsilon() {
        let interrupt = InterruptFlag::new();
        let start = Instant::now();
        let result: Transfer<()> =
            race_interrupt_timeout(&interrupt, 200, std::future::pending()).await;
        assert!(matches!(result, Transfer::Timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(150) && elapsed <= Duration::from_millis(350));
    }

    #[tokio::test]
    async fn interrupt_aborts_an_infinite_wait_within_bound() {
        let interrupt = InterruptFlag::new();
        let interrupt2 = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            interrupt2.interrupt();
        });
        let start = Instant::now();
        let result: Transfer<()> = race_interrupt_timeout(&interrupt, -1, std::future::pending()).await;
        assert!(matches!(result, Transfer::Interrupted));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn completed_operation_returns_done() {
        let interrupt = InterruptFlag::new();
        let result = race_interrupt_timeout(&interrupt, -1, async { Ok::<_, std::io::Error>(42usize) }).await;
        assert!(matches!(result, Transfer::Done(42)));
    }

    #[test]
    fn counters_track_bytes_and_message_counts() {
        let counters = SocketCounters::default();
        counters.record_send(10);
        counters.record_send(20);
        counters.record_receive(5);
        assert_eq!(counters.bytes_tx(), 30);
        assert_eq!(counters.messages_tx(), 2);
        assert_eq!(counters.bytes_rx(), 5);
        assert_eq!(counters.messages_rx(), 1);
    }

    #[test]
    fn options_default_to_sensible_values_and_are_settable() {
        let options = SocketOptions::default();
        assert_eq!(options.linger(), 500);
        options.set_rcv_hwm(42);
        assert_eq!(options.rcv_hwm(), 42);
    }
}
