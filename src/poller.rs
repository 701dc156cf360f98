//! # Poller
//!
//! Multiplexes readiness across an ordered, fixed set of sockets.
//! `Poll(timeout_ms)` returns after the requested time or as soon as any
//! referenced slot has a readiness event; `CheckInput`/`CheckOutput`
//! report the level-triggered state observed at the last `Poll` (§4.5).
//!
//! Polling across heterogeneous transports is not required within a
//! single `Poller` — the Device Core creates one poller per transport
//! when dispatch must span more than one (§4.2 callback-mode dispatch).
//!
//! Grounded on `FairMQPoller.h`/`FairMQPollerZMQ.cxx`: a snapshot struct
//! built over a fixed channel list, re-armed on every `Poll` call.

use crate::interrupt::InterruptFlag;
use crate::socket::Socket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Slot {
    channel_name: String,
    subchannel_index: usize,
    socket: Arc<dyn Socket>,
    input_ready: AtomicBool,
    output_ready: AtomicBool,
}

/// Outcome of a [`Poller::poll`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// The wait completed normally — either an event fired, or the
    /// timeout elapsed with nothing ready. Call `check_input`/
    /// `check_output` to see which, if any.
    Ready,
    Interrupted,
}

/// How often the poller re-checks readiness while waiting, bounding how
/// quickly it notices a socket becoming ready (and how quickly it honors
/// an interrupt).
const POLL_SLICE_MS: u64 = 20;

/// A snapshot poller over an ordered set of sockets.
pub struct Poller {
    slots: Vec<Slot>,
}

impl Poller {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Add a socket to the poller, indexed in insertion order.
    pub fn add(&mut self, channel_name: impl Into<String>, subchannel_index: usize, socket: Arc<dyn Socket>) {
        self.slots.push(Slot {
            channel_name: channel_name.into(),
            subchannel_index,
            socket,
            input_ready: AtomicBool::new(false),
            output_ready: AtomicBool::new(false),
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Wait up to `timeout_ms` (or indefinitely if negative) for any slot
    /// to become readable or writable, re-checking readiness and the
    /// interrupt flag every [`POLL_SLICE_MS`].
    pub async fn poll(&self, timeout_ms: i64, interrupt: &InterruptFlag) -> PollOutcome {
        let deadline = (timeout_ms >= 0)
            .then(|| tokio::time::Instant::now() + Duration::from_millis(timeout_ms as u64));

        loop {
            if interrupt.is_interrupted() {
                return PollOutcome::Interrupted;
            }

            let mut any_ready = false;
            for slot in &self.slots {
                let readable = tokio::time::timeout(Duration::ZERO, slot.socket.readable())
                    .await
                    .is_ok();
                slot.input_ready.store(readable, Ordering::Relaxed);
                any_ready |= readable;

                let writable = tokio::time::timeout(Duration::ZERO, slot.socket.writable())
                    .await
                    .is_ok();
                slot.output_ready.store(writable, Ordering::Relaxed);
                any_ready |= writable;
            }

            if any_ready {
                return PollOutcome::Ready;
            }

            if let Some(d) = deadline {
                if tokio::time::Instant::now() >= d {
                    return PollOutcome::Ready;
                }
            }

            tokio::select! {
                biased;
                _ = interrupt.wait() => return PollOutcome::Interrupted,
                _ = tokio::time::sleep(Duration::from_millis(POLL_SLICE_MS)) => continue,
            }
        }
    }

    pub fn check_input(&self, index: usize) -> bool {
        self.slots[index].input_ready.load(Ordering::Relaxed)
    }

    pub fn check_output(&self, index: usize) -> bool {
        self.slots[index].output_ready.load(Ordering::Relaxed)
    }

    pub fn check_input_named(&self, name: &str, subchannel_index: usize) -> Option<bool> {
        self.find(name, subchannel_index).map(|s| s.input_ready.load(Ordering::Relaxed))
    }

    pub fn check_output_named(&self, name: &str, subchannel_index: usize) -> Option<bool> {
        self.find(name, subchannel_index).map(|s| s.output_ready.load(Ordering::Relaxed))
    }

    fn find(&self, name: &str, subchannel_index: usize) -> Option<&Slot> {
        self.slots
            .iter()
            .find(|s| s.channel_name == name && s.subchannel_index == subchannel_index)
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MultipartMessage};
    use crate::socket::{SocketCounters, SocketOptions, Transfer};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    /// A socket stub whose readiness is controlled directly by the test,
    /// standing in for a live transport to exercise poller semantics in
    /// isolation.
    struct StubSocket {
        ready: StdAtomicBool,
        options: SocketOptions,
        counters: SocketCounters,
    }

    impl StubSocket {
        fn new(ready: bool) -> Arc<Self> {
            Arc::new(Self {
                ready: StdAtomicBool::new(ready),
                options: SocketOptions::default(),
                counters: SocketCounters::default(),
            })
        }

        fn set_ready(&self, ready: bool) {
            self.ready.store(ready, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Socket for StubSocket {
        async fn bind(&self, addr: &str) -> Result<String, crate::error::DeviceError> {
            Ok(addr.to_string())
        }
        async fn connect(&self, _addr: &str) -> Result<(), crate::error::DeviceError> {
            Ok(())
        }
        async fn send(&self, _msg: Message, _timeout_ms: i64) -> Transfer<usize> {
            Transfer::Done(0)
        }
        async fn receive(&self, _timeout_ms: i64) -> Transfer<Message> {
            Transfer::Done(Message::new_empty())
        }
        async fn send_parts(&self, _parts: MultipartMessage, _timeout_ms: i64) -> Transfer<usize> {
            Transfer::Done(0)
        }
        async fn receive_parts(&self, _timeout_ms: i64) -> Transfer<MultipartMessage> {
            Transfer::Done(MultipartMessage::new())
        }
        async fn readable(&self) -> std::io::Result<()> {
            if self.ready.load(Ordering::SeqCst) {
                Ok(())
            } else {
                std::future::pending().await
            }
        }
        async fn writable(&self) -> std::io::Result<()> {
            std::future::pending().await
        }
        fn options(&self) -> &SocketOptions {
            &self.options
        }
        fn counters(&self) -> &SocketCounters {
            &self.counters
        }
        fn interrupt(&self) {}
        fn resume(&self) {}
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn poll_returns_ready_when_a_slot_becomes_readable() {
        let interrupt = InterruptFlag::new();
        let socket = StubSocket::new(true);
        let mut poller = Poller::new();
        poller.add("data", 0, socket);

        let outcome = poller.poll(500, &interrupt).await;
        assert_eq!(outcome, PollOutcome::Ready);
        assert!(poller.check_input(0));
        assert!(!poller.check_output(0));
    }

    #[tokio::test]
    async fn poll_times_out_with_no_flags_set_when_nothing_is_ready() {
        let interrupt = InterruptFlag::new();
        let socket = StubSocket::new(false);
        let mut poller = Poller::new();
        poller.add("data", 0, socket);

        let start = tokio::time::Instant::now();
        let outcome = poller.poll(100, &interrupt).await;
        assert_eq!(outcome, PollOutcome::Ready);
        assert!(!poller.check_input(0));
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn poll_is_interrupted_promptly() {
        let interrupt = InterruptFlag::new();
        let socket = StubSocket::new(false);
        let mut poller = Poller::new();
        poller.add("data", 0, socket);

        let interrupt2 = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            interrupt2.interrupt();
        });

        let start = tokio::time::Instant::now();
        let outcome = poller.poll(-1, &interrupt).await;
        assert_eq!(outcome, PollOutcome::Interrupted);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn multiple_slots_are_addressable_by_index_and_name() {
        let interrupt = InterruptFlag::new();
        let a = StubSocket::new(true);
        let b = StubSocket::new(false);
        let mut poller = Poller::new();
        poller.add("data1", 0, a);
        poller.add("data2", 0, b);

        poller.poll(100, &interrupt).await;
        assert!(poller.check_input_named("data1", 0).unwrap());
        assert!(!poller.check_input_named("data2", 0).unwrap());
        assert_eq!(poller.check_input_named("missing", 0), None);
    }
}
