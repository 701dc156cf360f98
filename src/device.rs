//! # Device Core
//!
//! Orchestrates the device lifecycle on a dedicated OS thread (§4.2,
//! §5): owns the channel map, drives the state machine's working-state
//! handlers, dispatches user hooks and `OnData` callbacks, and provides
//! the message/region factories and `Send`/`Receive` shorthand every
//! hook uses.
//!
//! Grounded on `Device.h`/`FairMQDevice.cxx` for the handler sequence and
//! hook set, and on the teacher's `utils::spawn_with_affinity` for
//! running the state machine on its own single-threaded Tokio runtime.

use crate::channel::{AttachOutcome, Channel, Method};
use crate::config::ConfigStore;
use crate::error::DeviceError;
use crate::message::{Message, MultipartMessage};
use crate::region::{BulkReleaseFn, RegionConfig, RegionHandle};
use crate::socket::Transfer;
use crate::state_machine::{State, StateMachine, Transition, WaitOutcome};
use crate::transport::Factory as TransportFactory;
use crate::utils;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// User-supplied lifecycle hooks (§4.2). Every method defaults to a
/// no-op so a device only overrides what it needs.
///
/// Hooks run on the device's dedicated state thread inside a
/// `catch_unwind`: a panicking hook drives the device to `Error` and the
/// panic is then resumed on that thread, which is the "rethrown" the
/// Running handler's spec text describes — whoever joins the device
/// thread observes it.
pub trait DeviceHooks: Send + Sync {
    fn init(&self, _device: &Device) -> Result<(), DeviceError> {
        Ok(())
    }
    fn bind(&self, _device: &Device) -> Result<(), DeviceError> {
        Ok(())
    }
    fn connect(&self, _device: &Device) -> Result<(), DeviceError> {
        Ok(())
    }
    fn init_task(&self, _device: &Device) -> Result<(), DeviceError> {
        Ok(())
    }
    fn pre_run(&self, _device: &Device) -> Result<(), DeviceError> {
        Ok(())
    }
    /// Loop-mode hook for a user that wants to own its own loop; returns
    /// once it decides to stop. Only invoked if `conditional_run` is not
    /// overridden and no `OnData` callback is registered.
    fn run(&self, _device: &Device) -> Result<(), DeviceError> {
        Ok(())
    }
    /// Loop-mode hook invoked repeatedly at the configured `rate` (Hz)
    /// until it returns `Ok(false)`. Takes precedence over `run` when
    /// overridden.
    fn conditional_run(&self, _device: &Device) -> Result<bool, DeviceError> {
        Ok(false)
    }
    fn post_run(&self, _device: &Device) -> Result<(), DeviceError> {
        Ok(())
    }
    fn reset_task(&self, _device: &Device) -> Result<(), DeviceError> {
        Ok(())
    }
    fn reset(&self, _device: &Device) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// A no-op hook set, useful for devices driven purely by `OnData`.
pub struct NoopHooks;
impl DeviceHooks for NoopHooks {}

pub type DataCallback = Arc<dyn Fn(Message) -> bool + Send + Sync>;
pub type PartsCallback = Arc<dyn Fn(MultipartMessage) -> bool + Send + Sync>;

enum Callback {
    Single(DataCallback),
    Multi(PartsCallback),
}

/// The device lifecycle orchestrator.
pub struct Device {
    pub id: String,
    pub config: Arc<ConfigStore>,
    state_machine: Arc<StateMachine>,
    hooks: Arc<dyn DeviceHooks>,
    pending_channels: Mutex<Vec<Channel>>,
    channels: RwLock<HashMap<(String, usize), Channel>>,
    factory: RwLock<Option<TransportFactory>>,
    callbacks: Mutex<HashMap<String, Callback>>,
}

impl Device {
    pub fn new(id: impl Into<String>, config: Arc<ConfigStore>, hooks: Arc<dyn DeviceHooks>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            config,
            state_machine: StateMachine::new(),
            hooks,
            pending_channels: Mutex::new(Vec::new()),
            channels: RwLock::new(HashMap::new()),
            factory: RwLock::new(None),
            callbacks: Mutex::new(HashMap::new()),
        })
    }

    /// Register a channel before `start()`. The channel becomes part of
    /// the channel map when `InitializingDevice` runs.
    pub fn add_channel(&self, channel: Channel) {
        self.pending_channels.lock().unwrap().push(channel);
    }

    /// Register a single-message `OnData` callback for `channel`,
    /// switching the Running handler into callback-mode dispatch (§4.2).
    pub fn on_data(&self, channel: impl Into<String>, callback: DataCallback) {
        self.callbacks.lock().unwrap().insert(channel.into(), Callback::Single(callback));
    }

    pub fn on_data_parts(&self, channel: impl Into<String>, callback: PartsCallback) {
        self.callbacks.lock().unwrap().insert(channel.into(), Callback::Multi(callback));
    }

    pub fn state(&self) -> State {
        self.state_machine.current()
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state_machine
    }

    pub fn request_transition(&self, t: Transition) -> Result<bool, DeviceError> {
        self.state_machine.request_transition(t)
    }

    pub async fn wait_for_state(&self, target: State, timeout_ms: i64) -> WaitOutcome {
        self.state_machine.wait_for_state(target, timeout_ms).await
    }

    /// Spawn the dedicated state thread and drive the device to `Idle`
    /// then `InitializingDevice`, returning the thread's `JoinHandle`.
    /// The caller subsequently drives the remaining lifecycle with
    /// `request_transition`.
    pub fn start(self: &Arc<Self>) -> std::thread::JoinHandle<anyhow::Result<()>> {
        let device = self.clone();
        let name = format!("device-{}", device.id);
        let handle = utils::spawn_dedicated_thread(name, async move { device.run_state_machine().await });
        self.state_machine.request_transition(Transition::Auto).ok();
        self.state_machine.request_transition(Transition::InitDevice).ok();
        handle
    }

    async fn run_state_machine(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            match self.state_machine.current() {
                State::Exiting => return Ok(()),
                State::InitializingDevice => self.handle_initializing_device().await?,
                State::Binding => self.handle_binding().await?,
                State::Connecting => self.handle_connecting().await?,
                State::InitializingTask => self.handle_initializing_task().await?,
                State::Running => self.handle_running().await?,
                State::ResettingTask => self.handle_resetting_task().await?,
                State::ResettingDevice => self.handle_resetting_device().await?,
                _ => {
                    self.state_machine.wait_for_next(-1).await;
                }
            }
        }
    }

    /// Run a user hook, converting a panic into `ErrorFound` and then
    /// resuming the panic on this (the device's own) thread.
    fn guarded<T>(&self, f: impl FnOnce() -> Result<T, DeviceError> + std::panic::UnwindSafe) -> Result<T, DeviceError> {
        match std::panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => {
                self.state_machine.request_transition(Transition::ErrorFound).ok();
                std::panic::resume_unwind(payload);
            }
        }
    }

    fn fail(&self, reason: impl Into<String>) -> anyhow::Error {
        tracing::error!(device = %self.id, reason = %reason.into(), "device entering Error");
        self.state_machine.request_transition(Transition::ErrorFound).ok();
        anyhow::anyhow!("device {} failed", self.id)
    }

    // -- InitializingDevice ------------------------------------------------

    async fn handle_initializing_device(self: &Arc<Self>) -> anyhow::Result<()> {
        let default_tag = self.config.get::<String>("transport").unwrap_or_else(|_| "zeromq".to_string());
        let factory = match TransportFactory::with_defaults(&default_tag) {
            Ok(f) => f,
            Err(e) => return Err(self.fail(e.to_string())),
        };

        let mut channels = self.channels.write().unwrap();
        for mut channel in self.pending_channels.lock().unwrap().drain(..) {
            if channel.transport == "default" {
                channel.transport = default_tag.clone();
            }
            if (channel.address.is_empty() || channel.address == "unspecified") && channel.default_method == Method::Bind {
                let iface = self.config.get::<String>("network-interface").unwrap_or_else(|_| "default".to_string());
                // FairMQ's literal "tcp://<ip>:1" fallback is mapped to port 0
                // here (this crate's auto-bind convention, used elsewhere in
                // this same handler): binding to TCP port 1 needs root.
                channel.address = format!("tcp://{}:0", resolve_network_interface_ip(&iface));
                channel.invalidate();
            }
            let Some(transport) = factory.get(&channel.transport) else {
                return Err(self.fail(format!("unknown transport \"{}\" for channel \"{}\"", channel.transport, channel.name)));
            };
            let socket = transport.create_socket(channel.socket_type);
            channel.attach_socket(socket);
            self.config.mirror_channel(&channel);
            channels.insert((channel.name.clone(), channel.subchannel_index), channel);
        }
        drop(channels);
        *self.factory.write().unwrap() = Some(factory);

        if let Err(e) = self.guarded(|| self.hooks.init(self)) {
            return Err(self.fail(e.to_string()));
        }
        Ok(())
    }

    // -- Binding -------------------------------------------------------------

    async fn handle_binding(self: &Arc<Self>) -> anyhow::Result<()> {
        let names: Vec<(String, usize)> = self.channels.read().unwrap().keys().cloned().collect();
        for key in names {
            let endpoints = {
                let mut channels = self.channels.write().unwrap();
                let channel = channels.get_mut(&key).expect("channel map stable during Binding");
                self.config.apply_channel_overrides(channel);
                match channel.validate() {
                    Ok(eps) => eps,
                    Err(e) => return Err(self.fail(e.to_string())),
                }
            };

            let mut rewritten = Vec::new();
            for endpoint in endpoints.into_iter().filter(|e| e.method == Method::Bind) {
                let channel_ref = self.channels.read().unwrap();
                let channel = channel_ref.get(&key).expect("channel present");
                match channel.attach_endpoint(&endpoint).await {
                    AttachOutcome::Success(addr) => rewritten.push(addr),
                    AttachOutcome::Retry | AttachOutcome::Fail(_) => {
                        return Err(self.fail(format!("bind failed for channel \"{}\"", key.0)));
                    }
                }
            }
            if !rewritten.is_empty() {
                let mut channels = self.channels.write().unwrap();
                let channel = channels.get_mut(&key).unwrap();
                channel.address = rewritten.join(",");
                self.config.mirror_channel(channel);
            }
        }

        if let Err(e) = self.guarded(|| self.hooks.bind(self)) {
            return Err(self.fail(e.to_string()));
        }
        self.state_machine.request_transition(Transition::Auto).ok();
        Ok(())
    }

    // -- Connecting ------------------------------------------------------

    async fn handle_connecting(self: &Arc<Self>) -> anyhow::Result<()> {
        let init_timeout_s = self.config.get::<i64>("init-timeout").unwrap_or(120);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(init_timeout_s.max(0) as u64);

        let names: Vec<(String, usize)> = self.channels.read().unwrap().keys().cloned().collect();
        for key in names {
            loop {
                let endpoints = {
                    let mut channels = self.channels.write().unwrap();
                    let channel = channels.get_mut(&key).expect("channel map stable during Connecting");
                    self.config.apply_channel_overrides(channel);
                    match channel.validate() {
                        Ok(eps) => eps,
                        Err(e) => return Err(self.fail(e.to_string())),
                    }
                };

                let mut all_ok = true;
                for endpoint in endpoints.into_iter().filter(|e| e.method == Method::Connect) {
                    let channel_ref = self.channels.read().unwrap();
                    let channel = channel_ref.get(&key).expect("channel present");
                    if !matches!(channel.attach_endpoint(&endpoint).await, AttachOutcome::Success(_)) {
                        all_ok = false;
                    }
                }

                if all_ok {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(self.fail(format!("connect timed out for channel \"{}\"", key.0)));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        if let Err(e) = self.guarded(|| self.hooks.connect(self)) {
            return Err(self.fail(e.to_string()));
        }
        self.state_machine.request_transition(Transition::Auto).ok();
        Ok(())
    }

    // -- InitializingTask --------------------------------------------------

    async fn handle_initializing_task(self: &Arc<Self>) -> anyhow::Result<()> {
        if let Err(e) = self.guarded(|| self.hooks.init_task(self)) {
            return Err(self.fail(e.to_string()));
        }
        self.state_machine.request_transition(Transition::Auto).ok();
        Ok(())
    }

    // -- Running -------------------------------------------------------------

    async fn handle_running(self: &Arc<Self>) -> anyhow::Result<()> {
        if let Some(factory) = self.factory.read().unwrap().as_ref() {
            factory.resume_all();
        }

        let stats_stop = Arc::new(AtomicBool::new(false));
        let stats_handle = self.spawn_stats_sampler(stats_stop.clone());

        if let Err(e) = self.guarded(|| self.hooks.pre_run(self)) {
            stats_stop.store(true, Ordering::SeqCst);
            return Err(self.fail(e.to_string()));
        }

        let result = if self.callbacks.lock().unwrap().is_empty() {
            self.run_loop_mode().await
        } else {
            self.run_callback_mode().await
        };

        stats_stop.store(true, Ordering::SeqCst);
        let _ = stats_handle.await;

        if let Err(e) = self.guarded(|| self.hooks.post_run(self)) {
            return Err(self.fail(e.to_string()));
        }

        match result {
            Ok(()) => {
                if let Some(factory) = self.factory.read().unwrap().as_ref() {
                    factory.interrupt_all();
                    factory.resume_all();
                }
                self.state_machine.request_transition(Transition::Stop).ok();
                Ok(())
            }
            Err(e) => Err(self.fail(e.to_string())),
        }
    }

    async fn run_loop_mode(self: &Arc<Self>) -> Result<(), DeviceError> {
        let rate_hz = self.config.get::<f64>("rate").unwrap_or(0.0);
        loop {
            if self.state_machine.current() != State::Running {
                return Ok(());
            }
            let keep_going = self.guarded(|| self.hooks.conditional_run(self))?;
            if keep_going {
                if rate_hz > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(1.0 / rate_hz)).await;
                }
                continue;
            }
            // No `ConditionalRun` override: fall back to the blocking,
            // user-owned `Run()` loop, which returns when the user is done.
            return self.guarded(|| self.hooks.run(self));
        }
    }

    async fn run_callback_mode(self: &Arc<Self>) -> Result<(), DeviceError> {
        use crate::poller::Poller;

        let subscribed: Vec<String> = self.callbacks.lock().unwrap().keys().cloned().collect();
        if subscribed.len() == 1 {
            let name = subscribed[0].clone();
            loop {
                if self.state_machine.current() != State::Running {
                    return Ok(());
                }
                if !self.dispatch_one(&name, 0).await? {
                    return Ok(());
                }
            }
        }

        // Group by transport tag; one poller per transport.
        let mut by_transport: HashMap<String, Vec<(String, usize)>> = HashMap::new();
        {
            let channels = self.channels.read().unwrap();
            for name in &subscribed {
                if let Some(channel) = channels.get(&(name.clone(), 0)) {
                    by_transport.entry(channel.transport.clone()).or_default().push((name.clone(), 0));
                }
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let dispatch_lock = Arc::new(tokio::sync::Mutex::new(()));
        let mut tasks = Vec::new();
        let poll_timeout_ms = if by_transport.len() > 1 { 500 } else { 200 };

        for (_, members) in by_transport {
            let device = self.clone();
            let stop = stop.clone();
            let dispatch_lock = dispatch_lock.clone();
            tasks.push(tokio::spawn(async move {
                let mut poller = Poller::new();
                let interrupt = device.state_machine.interrupt_flag().clone();
                {
                    let channels = device.channels.read().unwrap();
                    for (name, idx) in &members {
                        if let Some(channel) = channels.get(&(name.clone(), *idx)) {
                            if let Some(socket) = channel.socket() {
                                poller.add(name.clone(), *idx, socket.clone());
                            }
                        }
                    }
                }

                while !stop.load(Ordering::SeqCst) && device.state_machine.current() == State::Running {
                    if matches!(poller.poll(poll_timeout_ms, &interrupt).await, crate::poller::PollOutcome::Interrupted) {
                        break;
                    }
                    for (i, (name, idx)) in members.iter().enumerate() {
                        if poller.check_input(i) {
                            let _guard = dispatch_lock.lock().await;
                            match device.dispatch_one(name, *idx).await {
                                Ok(true) => {}
                                Ok(false) | Err(_) => stop.store(true, Ordering::SeqCst),
                            }
                        }
                    }
                }
            }));
        }

        for t in tasks {
            let _ = t.await;
        }
        Ok(())
    }

    /// Receive one message (or multi-part sequence) on `channel` and
    /// invoke its registered callback, returning whether dispatch should
    /// continue (the callback's own return value).
    async fn dispatch_one(&self, channel: &str, index: usize) -> Result<bool, DeviceError> {
        let callback = {
            let callbacks = self.callbacks.lock().unwrap();
            match callbacks.get(channel) {
                Some(Callback::Single(cb)) => Callback::Single(cb.clone()),
                Some(Callback::Multi(cb)) => Callback::Multi(cb.clone()),
                None => return Ok(false),
            }
        };
        match callback {
            Callback::Single(cb) => match self.receive(channel, index, -1).await {
                Transfer::Done(msg) => Ok(cb(msg)),
                Transfer::Interrupted => Ok(false),
                Transfer::Timeout => Ok(true),
                Transfer::Error(e) => Err(DeviceError::TransportError { transport: channel.to_string(), reason: e }),
            },
            Callback::Multi(cb) => match self.receive_parts(channel, index, -1).await {
                Transfer::Done(parts) => Ok(cb(parts)),
                Transfer::Interrupted => Ok(false),
                Transfer::Timeout => Ok(true),
                Transfer::Error(e) => Err(DeviceError::TransportError { transport: channel.to_string(), reason: e }),
            },
        }
    }

    fn spawn_stats_sampler(self: &Arc<Self>, stop: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let device = self.clone();
        tokio::spawn(async move {
            let mut last: HashMap<(String, usize), (u64, u64)> = HashMap::new();
            while !stop.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let channels = device.channels.read().unwrap();
                for (key, channel) in channels.iter() {
                    if channel.rate_logging_interval_s <= 0 {
                        continue;
                    }
                    if let Some(socket) = channel.socket() {
                        let counters = socket.counters();
                        let (rx, tx) = (counters.bytes_rx(), counters.bytes_tx());
                        let (prev_rx, prev_tx) = last.get(key).copied().unwrap_or((rx, tx));
                        let in_mb = (rx.saturating_sub(prev_rx)) as f64 / (1024.0 * 1024.0);
                        let out_mb = (tx.saturating_sub(prev_tx)) as f64 / (1024.0 * 1024.0);
                        tracing::info!(
                            "{}: in: {} ({:.3} MB) out: {} ({:.3} MB)",
                            key.0,
                            counters.messages_rx(),
                            in_mb,
                            counters.messages_tx(),
                            out_mb
                        );
                        last.insert(key.clone(), (rx, tx));
                    }
                }
            }
        })
    }

    // -- ResettingTask / ResettingDevice ------------------------------------

    async fn handle_resetting_task(self: &Arc<Self>) -> anyhow::Result<()> {
        if let Err(e) = self.guarded(|| self.hooks.reset_task(self)) {
            return Err(self.fail(e.to_string()));
        }
        self.state_machine.request_transition(Transition::Auto).ok();
        Ok(())
    }

    async fn handle_resetting_device(self: &Arc<Self>) -> anyhow::Result<()> {
        if let Some(factory) = self.factory.read().unwrap().as_ref() {
            factory.interrupt_all();
            factory.reset_all().await;
        }
        if let Err(e) = self.guarded(|| self.hooks.reset(self)) {
            return Err(self.fail(e.to_string()));
        }
        self.channels.write().unwrap().clear();
        *self.factory.write().unwrap() = None;
        self.state_machine.request_transition(Transition::Auto).ok();
        Ok(())
    }

    // -- Send/Receive shorthand (§4.2) ---------------------------------------

    pub async fn send(&self, msg: Message, channel: &str, index: usize, timeout_ms: i64) -> Transfer<usize> {
        let channels = self.channels.read().unwrap();
        match channels.get(&(channel.to_string(), index)) {
            Some(c) => c.send(msg, timeout_ms, None).await,
            None => Transfer::Error(format!("unknown channel \"{channel}\"")),
        }
    }

    pub async fn receive(&self, channel: &str, index: usize, timeout_ms: i64) -> Transfer<Message> {
        let socket = {
            let channels = self.channels.read().unwrap();
            match channels.get(&(channel.to_string(), index)) {
                Some(c) => c.socket().cloned(),
                None => return Transfer::Error(format!("unknown channel \"{channel}\"")),
            }
        };
        match socket {
            Some(s) => s.receive(timeout_ms).await,
            None => Transfer::Error(format!("channel \"{channel}\" has no attached socket")),
        }
    }

    pub async fn send_parts(&self, parts: MultipartMessage, channel: &str, index: usize, timeout_ms: i64) -> Transfer<usize> {
        let channels = self.channels.read().unwrap();
        match channels.get(&(channel.to_string(), index)) {
            Some(c) => c.send_parts(parts, timeout_ms).await,
            None => Transfer::Error(format!("unknown channel \"{channel}\"")),
        }
    }

    pub async fn receive_parts(&self, channel: &str, index: usize, timeout_ms: i64) -> Transfer<MultipartMessage> {
        let channels = self.channels.read().unwrap();
        match channels.get(&(channel.to_string(), index)) {
            Some(c) => c.receive_parts(timeout_ms).await,
            None => Transfer::Error(format!("unknown channel \"{channel}\"")),
        }
    }

    // -- Message & region factories (§4.2) ------------------------------------

    pub fn new_message(&self) -> Message {
        Message::new_empty()
    }

    pub fn new_message_sized(&self, size: usize) -> Message {
        Message::new_sized(size)
    }

    pub fn new_static_message(&self, data: &'static [u8]) -> Message {
        Message::new_static(data)
    }

    pub fn new_simple_message<T: Copy>(&self, value: T) -> Message {
        Message::new_simple(value)
    }

    /// # Safety
    /// See [`Message::new_adopted`].
    pub unsafe fn new_adopted_message(
        &self,
        ptr: *mut u8,
        size: usize,
        free: crate::message::FreeFn,
        hint: Option<String>,
    ) -> Message {
        Message::new_adopted(ptr, size, free, hint)
    }

    pub fn new_unmanaged_region(&self, size: usize, config: RegionConfig, callback: Option<BulkReleaseFn>) -> RegionHandle {
        crate::region::UnmanagedRegion::new(size, config, callback)
    }
}

/// IP of the interface that owns the default route, found by opening a UDP
/// socket toward a public address and reading back its local endpoint — no
/// packet is ever sent, the kernel just has to pick a route.
fn default_route_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "0.0.0.0".to_string())
}

/// Resolve the `network-interface` config key (§4.2) to an IPv4 address:
/// `"default"` (or empty) means the default-route interface, anything else
/// names a specific interface looked up via `getifaddrs`.
fn resolve_network_interface_ip(name: &str) -> String {
    if name.is_empty() || name == "default" {
        return default_route_ip();
    }

    // SAFETY: `addrs` is initialized by `getifaddrs` on success and always
    // freed via `freeifaddrs` before returning; `ifa_name`/`ifa_addr` are
    // checked for null before dereferencing.
    unsafe {
        let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut addrs) != 0 {
            return default_route_ip();
        }
        let mut found = None;
        let mut cur = addrs;
        while !cur.is_null() {
            let ifa = &*cur;
            if !ifa.ifa_name.is_null() && !ifa.ifa_addr.is_null() {
                let ifname = std::ffi::CStr::from_ptr(ifa.ifa_name).to_string_lossy();
                if ifname == name && (*ifa.ifa_addr).sa_family as i32 == libc::AF_INET {
                    let sockaddr_in = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    found = Some(std::net::Ipv4Addr::from(u32::from_be(sockaddr_in.sin_addr.s_addr)).to_string());
                    break;
                }
            }
            cur = ifa.ifa_next;
        }
        libc::freeifaddrs(addrs);
        found.unwrap_or_else(default_route_ip)
    }
}
