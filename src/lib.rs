//! # Device Mesh
//!
//! A device-lifecycle and multi-transport message-passing framework for
//! distributed data-processing topologies: a finite-state device core
//! driving named, multi-transport channels over a zero-copy message and
//! unmanaged-region ownership model.

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod interrupt;
pub mod logging;
pub mod message;
pub mod poller;
pub mod region;
pub mod socket;
pub mod state_machine;
pub mod transport;
pub mod utils;

pub use channel::{Channel, Method, SocketType};
pub use config::ConfigStore;
pub use device::Device;
pub use error::{DeviceError, Result};
pub use message::{Message, MultipartMessage};
pub use region::{RegionConfig, RegionHandle, UnmanagedRegion};
pub use socket::{Socket, Transfer};
pub use state_machine::{State, StateMachine, Transition};

/// The current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Defaults mirrored from the original source's channel and socket option
/// defaults (§4.3, §4.4), used when a configuration key is absent.
pub mod defaults {
    /// Default send/receive high-water mark, in messages.
    pub const BUFFER_SIZE: i64 = 1000;

    /// Default socket linger period on close.
    pub const LINGER_MS: i64 = 500;

    /// Default rate-logging interval, in seconds. `0` disables logging.
    pub const RATE_LOGGING_INTERVAL_S: i64 = 1;

    /// Default region bulk-release batching threshold.
    pub const REGION_FLUSH_THRESHOLD: usize = 1;

    /// Poll slice used by the interrupt-aware wait helpers.
    pub const POLL_SLICE_MS: u64 = 20;
}
