//! # Utility Functions
//!
//! Small helpers shared across the device core and transports: spawning a
//! dedicated OS thread that runs a single-threaded Tokio runtime (the
//! concurrency model the state machine and transport listeners use, §4.2),
//! and nanosecond timestamps for statistics sampling.

use anyhow::Result;
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

/// Run `future` to completion on a brand-new OS thread with its own
/// single-threaded Tokio runtime, returning a `JoinHandle` the caller can
/// use to wait for the result or detect a panic.
///
/// The device core uses this for its state thread (§4.2) so that device
/// lifecycle processing never shares a runtime, and therefore never
/// contends for worker threads, with the application's own async code.
pub fn spawn_dedicated_thread<F, T>(
    name: impl Into<String>,
    future: F,
) -> std::thread::JoinHandle<Result<T>>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(future)
        })
        .unwrap_or_else(|e| panic!("failed to spawn dedicated thread \"{name}\": {e}"))
}

/// Current time as nanoseconds since the Unix epoch, used to timestamp
/// statistics samples and rate-logging intervals (§4.6).
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn spawn_dedicated_thread_runs_on_a_new_thread() {
        let main_thread_id = thread::current().id();
        let handle = spawn_dedicated_thread("test-thread", async move {
            Ok(thread::current().id())
        });
        let spawned_thread_id = handle.join().unwrap().unwrap();
        assert_ne!(main_thread_id, spawned_thread_id);
    }

    #[test]
    fn spawn_dedicated_thread_propagates_the_future_error() {
        let handle = spawn_dedicated_thread("test-thread-err", async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        });
        let result = handle.join().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn current_timestamp_ns_is_monotonic_enough_for_ordering() {
        let a = current_timestamp_ns();
        let b = current_timestamp_ns();
        assert!(b >= a);
    }
}
