//! # State Machine
//!
//! Serializes device lifecycle transitions, delivers state-change and
//! new-transition notifications to subscribers, and exposes the shared
//! interrupt signal every blocking transport operation races against
//! (§4.1, §5).
//!
//! Current state is broadcast through a `tokio::sync::watch` channel:
//! `WaitForNext`/`WaitForState` are just specialized waits over it. The
//! subscriber lists are guarded by a `parking_lot` mutex but invoked with
//! the lock released, after being handed off through a `crossbeam`
//! channel to a dedicated notification thread — per §9's "subscriber
//! callbacks delivered via a task/channel queue to decouple from the
//! state thread's critical path" redesign note. The caller still blocks
//! until the batch finishes (an ack channel closes the loop), so
//! `request_transition`'s observable behavior is unchanged; only the
//! thread the callbacks actually execute on moves. A callback may safely
//! unsubscribe a *different* key, even re-entrantly.
//!
//! No `StateMachine.h` was available to ground this module directly; it
//! is built from the transition table and invariants in §4.1 plus the
//! mutex/condvar-replacement pattern from §9's design notes.

use crate::interrupt::{InterruptFlag, SUB_WAIT_MS};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Device lifecycle state (§3 Data Model). `Ok` is the machine's initial
/// state, left automatically for `Idle` the first time the device core
/// drives the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Ok,
    Error,
    Idle,
    InitializingDevice,
    Initialized,
    Binding,
    Bound,
    Connecting,
    DeviceReady,
    InitializingTask,
    Ready,
    Running,
    ResettingTask,
    ResettingDevice,
    Exiting,
}

impl State {
    /// The human-readable spelling used externally (§6): same spelling as
    /// the variant, upper-cased and space-separated.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Ok => "OK",
            State::Error => "ERROR",
            State::Idle => "IDLE",
            State::InitializingDevice => "INITIALIZING DEVICE",
            State::Initialized => "INITIALIZED",
            State::Binding => "BINDING",
            State::Bound => "BOUND",
            State::Connecting => "CONNECTING",
            State::DeviceReady => "DEVICE READY",
            State::InitializingTask => "INITIALIZING TASK",
            State::Ready => "READY",
            State::Running => "RUNNING",
            State::ResettingTask => "RESETTING TASK",
            State::ResettingDevice => "RESETTING DEVICE",
            State::Exiting => "EXITING",
        }
    }

    /// Working states whose entry triggers a Device Core handler and
    /// whose exit is self-triggered via `Auto` once that handler finishes.
    pub fn is_working_state(&self) -> bool {
        matches!(
            self,
            State::InitializingDevice
                | State::Binding
                | State::Connecting
                | State::InitializingTask
                | State::ResettingTask
                | State::ResettingDevice
        )
    }
}

/// A requested state transition (§3, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    InitDevice,
    CompleteInit,
    Bind,
    Connect,
    InitTask,
    Run,
    Stop,
    ResetTask,
    ResetDevice,
    End,
    ErrorFound,
    /// Self-triggered by a working state's handler once it completes.
    Auto,
}

const TABLE: &[(State, Transition, State)] = &[
    (State::Ok, Transition::Auto, State::Idle),
    (State::Idle, Transition::InitDevice, State::InitializingDevice),
    (State::InitializingDevice, Transition::CompleteInit, State::Initialized),
    (State::Initialized, Transition::Bind, State::Binding),
    (State::Binding, Transition::Auto, State::Bound),
    (State::Bound, Transition::Connect, State::Connecting),
    (State::Connecting, Transition::Auto, State::DeviceReady),
    (State::DeviceReady, Transition::InitTask, State::InitializingTask),
    (State::InitializingTask, Transition::Auto, State::Ready),
    (State::Ready, Transition::Run, State::Running),
    (State::Running, Transition::Stop, State::Ready),
    (State::Ready, Transition::ResetTask, State::ResettingTask),
    (State::ResettingTask, Transition::Auto, State::DeviceReady),
    (State::DeviceReady, Transition::ResetDevice, State::ResettingDevice),
    (State::Initialized, Transition::ResetDevice, State::ResettingDevice),
    (State::Bound, Transition::ResetDevice, State::ResettingDevice),
    (State::ResettingDevice, Transition::Auto, State::Idle),
    (State::Idle, Transition::End, State::Exiting),
];

fn lookup(from: State, t: Transition) -> Option<State> {
    if t == Transition::ErrorFound {
        return Some(State::Error);
    }
    TABLE.iter().find(|(f, tr, _)| *f == from && *tr == t).map(|(_, _, to)| *to)
}

pub type StateChangeFn = Arc<dyn Fn(State) + Send + Sync>;
pub type NewTransitionFn = Arc<dyn Fn(State, Transition) + Send + Sync>;

type NotifyJob = Box<dyn FnOnce() + Send>;

/// Spawns the dedicated thread that runs subscriber callbacks, fed by a
/// `crossbeam` channel so `apply_transition` never calls user code from
/// inside its own critical section.
fn spawn_notifier() -> crossbeam::channel::Sender<NotifyJob> {
    let (tx, rx) = crossbeam::channel::unbounded::<NotifyJob>();
    std::thread::Builder::new()
        .name("state-notify".to_string())
        .spawn(move || {
            for job in rx {
                job();
            }
        })
        .expect("failed to spawn state-machine notification thread");
    tx
}

struct Subscription<F> {
    id: String,
    callback: F,
}

#[derive(Default)]
struct Subscribers {
    state_change: Vec<Subscription<StateChangeFn>>,
    new_transition: Vec<Subscription<NewTransitionFn>>,
}

/// Outcome of a bounded wait for a state-machine event.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached(State),
    TimedOut,
    Interrupted,
}

/// The per-device state machine.
pub struct StateMachine {
    state_tx: watch::Sender<State>,
    subscribers: Mutex<Subscribers>,
    /// Guards against a transition being requested while another is still
    /// being processed (reported as `OngoingTransition`, §7), distinct
    /// from the mutex above which only ever guards subscriber lists.
    busy: AtomicBool,
    interrupt: Arc<InterruptFlag>,
    notify_tx: crossbeam::channel::Sender<NotifyJob>,
}

impl StateMachine {
    pub fn new() -> Arc<Self> {
        let (state_tx, _rx) = watch::channel(State::Ok);
        Arc::new(Self {
            state_tx,
            subscribers: Mutex::new(Subscribers::default()),
            busy: AtomicBool::new(false),
            interrupt: InterruptFlag::new(),
            notify_tx: spawn_notifier(),
        })
    }

    /// Hands `job` to the notification thread and blocks until it has run,
    /// so callers observe the same synchronous ordering as before while
    /// the callbacks themselves execute off the calling thread.
    fn dispatch_and_wait(&self, job: NotifyJob) {
        let (done_tx, done_rx) = crossbeam::channel::bounded(0);
        let wrapped: NotifyJob = Box::new(move || {
            job();
            let _ = done_tx.send(());
        });
        if self.notify_tx.send(wrapped).is_ok() {
            let _ = done_rx.recv();
        }
    }

    pub fn current(&self) -> State {
        *self.state_tx.borrow()
    }

    pub fn interrupt_flag(&self) -> &Arc<InterruptFlag> {
        &self.interrupt
    }

    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub fn resume(&self) {
        self.interrupt.resume();
    }

    /// `RequestTransition(t)`. Returns `Ok(true)` if the transition was
    /// legal from the current state and has now been applied, `Ok(false)`
    /// if it is not legal from the current state, or
    /// `Err(OngoingTransition)` if another transition is still being
    /// processed.
    pub fn request_transition(&self, t: Transition) -> Result<bool, crate::error::DeviceError> {
        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(crate::error::DeviceError::OngoingTransition);
        }
        let result = self.apply_transition(t);
        self.busy.store(false, Ordering::Release);
        result
    }

    fn apply_transition(&self, t: Transition) -> Result<bool, crate::error::DeviceError> {
        let from = self.current();
        let Some(to) = lookup(from, t) else {
            return Ok(false);
        };

        let transition_subs = {
            let subs = self.subscribers.lock();
            subs.new_transition.iter().map(|s| s.callback.clone()).collect::<Vec<_>>()
        };
        self.dispatch_and_wait(Box::new(move || {
            for cb in transition_subs {
                cb(from, t);
            }
        }));

        // Committing via the watch channel is what `wait_for_next`/
        // `wait_for_state` wake up on.
        let _ = self.state_tx.send(to);

        let state_subs = {
            let subs = self.subscribers.lock();
            subs.state_change.iter().map(|s| s.callback.clone()).collect::<Vec<_>>()
        };
        self.dispatch_and_wait(Box::new(move || {
            for cb in state_subs {
                cb(to);
            }
        }));

        Ok(true)
    }

    pub fn subscribe_state_change(&self, id: impl Into<String>, callback: StateChangeFn) {
        self.subscribers.lock().state_change.push(Subscription { id: id.into(), callback });
    }

    pub fn unsubscribe_state_change(&self, id: &str) {
        self.subscribers.lock().state_change.retain(|s| s.id != id);
    }

    pub fn subscribe_new_transition(&self, id: impl Into<String>, callback: NewTransitionFn) {
        self.subscribers.lock().new_transition.push(Subscription { id: id.into(), callback });
    }

    pub fn unsubscribe_new_transition(&self, id: &str) {
        self.subscribers.lock().new_transition.retain(|s| s.id != id);
    }

    /// `WaitForNext()`: block until the state machine has moved to any
    /// state other than the one current when the wait began, or the
    /// interrupt fires, or `timeout_ms` elapses (`-1` = infinite, `0` =
    /// test-once).
    pub async fn wait_for_next(&self, timeout_ms: i64) -> WaitOutcome {
        let mut rx = self.state_tx.subscribe();
        self.wait_loop(&mut rx, None, timeout_ms).await
    }

    /// `WaitForState(s[, timeout])`: returns immediately if already in
    /// `target`, otherwise waits for it the same way `wait_for_next` does.
    pub async fn wait_for_state(&self, target: State, timeout_ms: i64) -> WaitOutcome {
        if self.current() == target {
            return WaitOutcome::Reached(target);
        }
        let mut rx = self.state_tx.subscribe();
        self.wait_loop(&mut rx, Some(target), timeout_ms).await
    }

    async fn wait_loop(&self, rx: &mut watch::Receiver<State>, target: Option<State>, timeout_ms: i64) -> WaitOutcome {
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));

        loop {
            if self.interrupt.is_interrupted() {
                return WaitOutcome::Interrupted;
            }

            if timeout_ms == 0 {
                return match rx.has_changed() {
                    Ok(true) => WaitOutcome::Reached(*rx.borrow_and_update()),
                    _ => WaitOutcome::TimedOut,
                };
            }

            let slice = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return WaitOutcome::TimedOut;
                    }
                    remaining.min(Duration::from_millis(SUB_WAIT_MS))
                }
                None => Duration::from_millis(SUB_WAIT_MS),
            };

            tokio::select! {
                biased;
                _ = self.interrupt.wait() => return WaitOutcome::Interrupted,
                changed = rx.changed() => {
                    if changed.is_ok() {
                        let s = *rx.borrow_and_update();
                        match target {
                            Some(t) if s != t => continue,
                            _ => return WaitOutcome::Reached(s),
                        }
                    }
                }
                _ = tokio::time::sleep(slice) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn legal_transition_table_walks_idle_to_running_and_back() {
        let sm_path = [
            (State::Ok, Transition::Auto, State::Idle),
            (State::Idle, Transition::InitDevice, State::InitializingDevice),
            (State::InitializingDevice, Transition::CompleteInit, State::Initialized),
            (State::Initialized, Transition::Bind, State::Binding),
            (State::Binding, Transition::Auto, State::Bound),
            (State::Bound, Transition::Connect, State::Connecting),
            (State::Connecting, Transition::Auto, State::DeviceReady),
            (State::DeviceReady, Transition::InitTask, State::InitializingTask),
            (State::InitializingTask, Transition::Auto, State::Ready),
            (State::Ready, Transition::Run, State::Running),
            (State::Running, Transition::Stop, State::Ready),
        ];
        for (from, t, to) in sm_path {
            assert_eq!(lookup(from, t), Some(to));
        }
    }

    #[test]
    fn error_found_is_legal_from_any_state() {
        for state in [State::Idle, State::Running, State::Connecting, State::Exiting] {
            assert_eq!(lookup(state, Transition::ErrorFound), Some(State::Error));
        }
    }

    #[test]
    fn illegal_transition_is_rejected() {
        assert_eq!(lookup(State::Idle, Transition::Run), None);
    }

    #[tokio::test]
    async fn request_transition_applies_a_legal_move_and_notifies_subscribers() {
        let sm = StateMachine::new();
        let seen: Arc<Mutex<Vec<State>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        sm.subscribe_state_change("watcher", Arc::new(move |s| seen_clone.lock().push(s)));

        assert!(sm.request_transition(Transition::Auto).unwrap());
        assert_eq!(sm.current(), State::Idle);
        assert!(sm.request_transition(Transition::InitDevice).unwrap());
        assert_eq!(sm.current(), State::InitializingDevice);
        assert_eq!(*seen.lock(), vec![State::Idle, State::InitializingDevice]);
    }

    #[tokio::test]
    async fn request_transition_rejects_an_illegal_move_without_changing_state() {
        let sm = StateMachine::new();
        sm.request_transition(Transition::Auto).unwrap();
        assert!(!sm.request_transition(Transition::Run).unwrap());
        assert_eq!(sm.current(), State::Idle);
    }

    #[tokio::test]
    async fn wait_for_state_returns_immediately_if_already_there() {
        let sm = StateMachine::new();
        let outcome = sm.wait_for_state(State::Ok, 1000).await;
        assert_eq!(outcome, WaitOutcome::Reached(State::Ok));
    }

    #[tokio::test]
    async fn wait_for_state_wakes_up_on_the_matching_transition() {
        let sm = StateMachine::new();
        let sm2 = sm.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sm2.request_transition(Transition::Auto).unwrap();
        });
        let outcome = sm.wait_for_state(State::Idle, 2000).await;
        assert_eq!(outcome, WaitOutcome::Reached(State::Idle));
    }

    #[tokio::test]
    async fn wait_for_next_times_out_with_no_transition() {
        let sm = StateMachine::new();
        let outcome = sm.wait_for_next(100).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn interrupt_aborts_a_pending_wait_promptly() {
        let sm = StateMachine::new();
        let sm2 = sm.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sm2.interrupt();
        });
        let start = Instant::now();
        let outcome = sm.wait_for_next(-1).await;
        assert_eq!(outcome, WaitOutcome::Interrupted);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn a_callback_may_unsubscribe_a_different_key_re_entrantly() {
        let sm = StateMachine::new();
        let other_fired = Arc::new(AtomicUsize::new(0));
        let other_fired_clone = other_fired.clone();
        sm.subscribe_state_change("other", Arc::new(move |_s| {
            other_fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let sm_for_cb = sm.clone();
        sm.subscribe_state_change(
            "unsubscriber",
            Arc::new(move |_s| sm_for_cb.unsubscribe_state_change("other")),
        );

        sm.request_transition(Transition::Auto).unwrap();
        assert_eq!(other_fired.load(Ordering::SeqCst), 1);
        sm.request_transition(Transition::InitDevice).unwrap();
        assert_eq!(other_fired.load(Ordering::SeqCst), 1, "other should have been unsubscribed");
    }
}
