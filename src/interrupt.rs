//! # Interrupt Signal
//!
//! The cancellation primitive shared by the state machine and every
//! socket it drives. `Interrupt()` must make every outstanding blocking
//! transfer return `Interrupted` within a bounded time, and `Resume()`
//! clears the flag again (§4.1, §5).
//!
//! ## Open Question Resolved (see DESIGN.md)
//!
//! The original source treats interruption as a transport-wide static.
//! This crate instead gives each [`crate::transport::Transport`] instance
//! its own [`InterruptFlag`], shared by every socket the transport
//! creates. This keeps the "all sockets under one transport observe one
//! interrupt" semantics the device core relies on (Stop/ResetDevice/End
//! interrupt the whole transport) while avoiding a process-wide global,
//! which would make multiple devices in one process interfere with each
//! other — a correctness improvement over the original static, not just a
//! style preference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Maximum slice, in milliseconds, between interrupt observations during a
/// blocking wait (§4.4, §5 "Cancellation").
pub const SUB_WAIT_MS: u64 = 100;

/// Shared cancellation flag. Cloned cheaply via `Arc` into every socket a
/// transport creates.
pub struct InterruptFlag {
    interrupted: AtomicBool,
    notify: Notify,
}

impl InterruptFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { interrupted: AtomicBool::new(false), notify: Notify::new() })
    }

    /// Signal every waiter bound to this flag. Idempotent.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Clear the flag so future waits block normally again.
    pub fn resume(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Resolve immediately if already interrupted, otherwise resolve on
    /// the next `interrupt()` call.
    pub async fn wait(&self) {
        if self.is_interrupted() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for InterruptFlag {
    fn default() -> Self {
        Self { interrupted: AtomicBool::new(false), notify: Notify::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_resolves_immediately_if_already_interrupted() {
        let flag = InterruptFlag::new();
        flag.interrupt();
        tokio::time::timeout(Duration::from_millis(50), flag.wait())
            .await
            .expect("wait should resolve immediately once interrupted");
    }

    #[tokio::test]
    async fn wait_resolves_when_interrupted_from_another_task() {
        let flag = InterruptFlag::new();
        let flag2 = flag.clone();
        let waiter = tokio::spawn(async move { flag2.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.interrupt();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter task should complete")
            .expect("waiter task should not panic");
    }

    #[tokio::test]
    async fn resume_allows_a_fresh_wait_to_block_again() {
        let flag = InterruptFlag::new();
        flag.interrupt();
        assert!(flag.is_interrupted());
        flag.resume();
        assert!(!flag.is_interrupted());
        let result = tokio::time::timeout(Duration::from_millis(50), flag.wait()).await;
        assert!(result.is_err(), "wait should still be pending after resume");
    }
}
