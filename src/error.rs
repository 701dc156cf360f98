//! # Error Kinds
//!
//! This module defines the error kinds that flow through the device
//! lifecycle, channel, and transport layers. Transient I/O outcomes
//! (timeouts, interruption) are modeled as return codes rather than
//! errors (see [`crate::socket::Transfer`]); this enum covers the
//! conditions that are genuinely exceptional: invalid configuration,
//! transport failure, and lifecycle misuse.
//!
//! ## Propagation Policy
//!
//! Configuration and lifecycle errors propagate up to the
//! [`crate::state_machine::StateMachine`], which reacts by entering
//! `Error` and interrupting all transports. Transient I/O errors never
//! reach this type; they are surfaced as [`crate::socket::Transfer`]
//! variants instead.

use thiserror::Error;

/// Error kinds produced by the device framework.
///
/// Every variant corresponds to one of the error kinds enumerated in the
/// framework's error handling design: configuration validation failures,
/// transport-level failures, and lifecycle misuse all have a dedicated
/// variant so callers can match on the kind rather than parsing text.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A channel failed `Validate()`.
    #[error("invalid channel \"{channel}\": {reason}")]
    InvalidChannel { channel: String, reason: String },

    /// Bind failed because the address/port was already taken.
    #[error("address in use: {address}")]
    AddressInUse { address: String },

    /// An unexpected transport-level failure that cannot be retried locally.
    #[error("transport error on {transport}: {reason}")]
    TransportError { transport: String, reason: String },

    /// A `TransitionTo` request arrived while another transition was still
    /// in progress. Reported to the caller; does not alter device state.
    #[error("transition already in progress")]
    OngoingTransition,

    /// A configuration key was looked up but does not exist.
    #[error("property not found: {key}")]
    PropertyNotFound { key: String },

    /// A configuration key exists but holds a value of a different type.
    #[error("property type mismatch for {key}: expected {expected}")]
    PropertyTypeMismatch { key: String, expected: &'static str },

    /// An unrecoverable invariant violation. The device enters `Error` and
    /// stays there until externally reset.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Convenience alias used throughout the crate's typed-error core.
pub type Result<T> = std::result::Result<T, DeviceError>;
