//! # Channel
//!
//! A named, configured socket: one or more endpoint addresses, a
//! socket-pattern, a bind/connect method, and the buffer/linger/rate
//! knobs that get attached to the underlying transport socket once the
//! channel validates (§3, §4.3).
//!
//! Grounded on `FairMQChannel`: `ValidateChannel` (endpoint grammar and
//! range checks), `AttachEndpoint` (resolve, then bind-or-connect), and
//! the send/receive forwarding methods that implicitly copy a message
//! crossing into a different transport.

use crate::error::DeviceError;
use crate::message::{Message, MultipartMessage};
use crate::socket::{Socket, Transfer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Socket pattern a channel's sockets implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Sub,
    Pub,
    Pull,
    Push,
    Req,
    Rep,
    XSub,
    XPub,
    Dealer,
    Router,
    Pair,
}

impl SocketType {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sub" => Self::Sub,
            "pub" => Self::Pub,
            "pull" => Self::Pull,
            "push" => Self::Push,
            "req" => Self::Req,
            "rep" => Self::Rep,
            "xsub" => Self::XSub,
            "xpub" => Self::XPub,
            "dealer" => Self::Dealer,
            "router" => Self::Router,
            "pair" => Self::Pair,
            _ => return None,
        })
    }
}

/// How a channel's sockets attach to their endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Bind,
    Connect,
}

impl Method {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "bind" => Some(Self::Bind),
            "connect" => Some(Self::Connect),
            _ => None,
        }
    }
}

/// Recognized address protocols (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Ipc,
    Inproc,
}

/// One endpoint parsed out of a channel's (possibly comma-separated,
/// possibly modifier-prefixed) address field.
#[derive(Debug, Clone)]
pub struct ParsedEndpoint {
    pub method: Method,
    pub protocol: Protocol,
    pub address: String,
    /// The endpoint string with its `@`/`+`/`>` modifier (if any) stripped.
    pub raw: String,
}

/// Result of attempting to attach one endpoint (§4.3).
#[derive(Debug)]
pub enum AttachOutcome {
    /// Attached; carries the address actually in effect (rewritten for
    /// auto-bound ports).
    Success(String),
    /// Connect failed; the caller may retry later (Connecting handler
    /// does this every 50ms, §4.2).
    Retry,
    Fail(String),
}

/// Configuration and validation state for one channel (§3, §4.3).
pub struct Channel {
    pub name: String,
    pub subchannel_index: usize,
    pub socket_type: SocketType,
    pub default_method: Method,
    /// Raw, possibly comma-separated, possibly modifier-prefixed address
    /// configuration as supplied by the configuration store.
    pub address: String,
    pub transport: String,
    pub snd_buf_size: i64,
    pub rcv_buf_size: i64,
    pub snd_kernel_size: i64,
    pub rcv_kernel_size: i64,
    pub linger_ms: i64,
    pub rate_logging_interval_s: i64,
    pub port_range: Option<(u16, u16)>,
    valid: AtomicBool,
    socket: Option<Arc<dyn Socket>>,
}

impl Channel {
    pub fn new(name: impl Into<String>, socket_type: SocketType, default_method: Method, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subchannel_index: 0,
            socket_type,
            default_method,
            address: address.into(),
            transport: "default".to_string(),
            snd_buf_size: 1000,
            rcv_buf_size: 1000,
            snd_kernel_size: 0,
            rcv_kernel_size: 0,
            linger_ms: 500,
            rate_logging_interval_s: 1,
            port_range: None,
            valid: AtomicBool::new(false),
            socket: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the channel invalid, forcing re-validation before the next
    /// attach. Any field setter should call this.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn attach_socket(&mut self, socket: Arc<dyn Socket>) {
        let opts = socket.options();
        opts.set_linger(self.linger_ms);
        opts.set_snd_hwm(self.snd_buf_size);
        opts.set_rcv_hwm(self.rcv_buf_size);
        opts.set_snd_kernel_size(self.snd_kernel_size);
        opts.set_rcv_kernel_size(self.rcv_kernel_size);
        self.socket = Some(socket);
    }

    pub fn socket(&self) -> Option<&Arc<dyn Socket>> {
        self.socket.as_ref()
    }

    /// `Validate()`: check socket-pattern, endpoint grammar, transport
    /// tag, and numeric ranges. Ported from `FairMQChannel::ValidateChannel`.
    pub fn validate(&self) -> Result<Vec<ParsedEndpoint>, DeviceError> {
        if self.is_valid() {
            return self.parse_endpoints();
        }

        if self.address.is_empty() || self.address == "unspecified" {
            return Err(DeviceError::InvalidChannel {
                channel: self.name.clone(),
                reason: format!("invalid channel address: \"{}\"", self.address),
            });
        }

        let endpoints = self.parse_endpoints()?;

        if self.snd_buf_size < 0 {
            return Err(self.invalid("send buffer size cannot be negative"));
        }
        if self.rcv_buf_size < 0 {
            return Err(self.invalid("receive buffer size cannot be negative"));
        }
        if self.snd_kernel_size < 0 {
            return Err(self.invalid("send kernel transmit size cannot be negative"));
        }
        if self.rcv_kernel_size < 0 {
            return Err(self.invalid("receive kernel transmit size cannot be negative"));
        }
        if self.rate_logging_interval_s < 0 {
            return Err(self.invalid("rate logging interval cannot be negative"));
        }

        self.valid.store(true, Ordering::Release);
        Ok(endpoints)
    }

    fn invalid(&self, reason: &str) -> DeviceError {
        DeviceError::InvalidChannel { channel: self.name.clone(), reason: reason.to_string() }
    }

    fn parse_endpoints(&self) -> Result<Vec<ParsedEndpoint>, DeviceError> {
        let _ = SocketType::parse(self.type_name())
            .ok_or_else(|| self.invalid(&format!("invalid channel type: \"{}\"", self.type_name())))?;

        let mut parsed = Vec::new();
        for token in self.address.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (method, raw) = match token.as_bytes().first() {
                Some(b'@') => (Method::Bind, &token[1..]),
                Some(b'+') | Some(b'>') => (Method::Connect, &token[1..]),
                _ => (self.default_method, token),
            };

            let protocol = if let Some(rest) = raw.strip_prefix("tcp://") {
                if !rest.contains(':') {
                    return Err(self.invalid(&format!("invalid channel address: \"{raw}\" (missing port?)")));
                }
                Protocol::Tcp
            } else if let Some(rest) = raw.strip_prefix("ipc://") {
                if rest.is_empty() {
                    return Err(self.invalid(&format!("invalid channel address: \"{raw}\" (empty IPC address?)")));
                }
                Protocol::Ipc
            } else if raw.strip_prefix("inproc://").is_some() {
                Protocol::Inproc
            } else {
                return Err(self.invalid(&format!("invalid channel address: \"{raw}\" (missing protocol specifier?)")));
            };

            parsed.push(ParsedEndpoint { method, protocol, address: raw.to_string(), raw: token.to_string() });
        }
        Ok(parsed)
    }

    fn type_name(&self) -> &'static str {
        match self.socket_type {
            SocketType::Sub => "sub",
            SocketType::Pub => "pub",
            SocketType::Pull => "pull",
            SocketType::Push => "push",
            SocketType::Req => "req",
            SocketType::Rep => "rep",
            SocketType::XSub => "xsub",
            SocketType::XPub => "xpub",
            SocketType::Dealer => "dealer",
            SocketType::Router => "router",
            SocketType::Pair => "pair",
        }
    }

    /// `AttachEndpoint(endpoint)`: bind or connect according to the
    /// effective method, rewriting the endpoint address on a successful
    /// bind (e.g. auto-assigned port).
    pub async fn attach_endpoint(&self, endpoint: &ParsedEndpoint) -> AttachOutcome {
        let Some(socket) = &self.socket else {
            return AttachOutcome::Fail("channel has no socket attached".to_string());
        };

        match endpoint.method {
            Method::Bind => match socket.bind(&endpoint.address).await {
                Ok(bound) => AttachOutcome::Success(bound),
                Err(DeviceError::AddressInUse { .. }) => AttachOutcome::Retry,
                Err(e) => AttachOutcome::Fail(e.to_string()),
            },
            Method::Connect => match socket.connect(&endpoint.address).await {
                Ok(()) => AttachOutcome::Success(endpoint.address.clone()),
                Err(e) => AttachOutcome::Retry.tap_fail(e),
            },
        }
    }

    /// `Send(msg, timeout)`. If `msg` was built for a different
    /// transport than this channel's socket, perform the implicit copy
    /// required by the ownership invariant in §3 before sending.
    pub async fn send(&self, msg: Message, timeout_ms: i64, own_transport_tag: Option<crate::region::RegionTag>) -> Transfer<usize> {
        let Some(socket) = &self.socket else {
            return Transfer::Error("channel has no socket attached".to_string());
        };
        let msg = match (msg.region_tag(), own_transport_tag) {
            (Some(tag), Some(expected)) if tag != expected => msg.copy_for_transport(),
            _ => msg,
        };
        socket.send(msg, timeout_ms).await
    }

    pub async fn receive(&self, timeout_ms: i64) -> Transfer<Message> {
        match &self.socket {
            Some(socket) => socket.receive(timeout_ms).await,
            None => Transfer::Error("channel has no socket attached".to_string()),
        }
    }

    pub async fn send_parts(&self, parts: MultipartMessage, timeout_ms: i64) -> Transfer<usize> {
        if parts.is_empty() {
            return Transfer::Error("multi-part send rejected: sequence must not be empty".to_string());
        }
        match &self.socket {
            Some(socket) => socket.send_parts(parts, timeout_ms).await,
            None => Transfer::Error("channel has no socket attached".to_string()),
        }
    }

    pub async fn receive_parts(&self, timeout_ms: i64) -> Transfer<MultipartMessage> {
        match &self.socket {
            Some(socket) => socket.receive_parts(timeout_ms).await,
            None => Transfer::Error("channel has no socket attached".to_string()),
        }
    }
}

impl AttachOutcome {
    fn tap_fail(self, err: DeviceError) -> Self {
        tracing::debug!(%err, "connect attempt failed, eligible for retry");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_unknown_protocol() {
        let chan = Channel::new("data", SocketType::Push, Method::Bind, "udp://127.0.0.1:1234");
        let err = chan.validate().unwrap_err();
        assert!(matches!(err, DeviceError::InvalidChannel { .. }));
    }

    #[test]
    fn validate_rejects_tcp_address_missing_port() {
        let chan = Channel::new("data", SocketType::Push, Method::Bind, "tcp://127.0.0.1");
        assert!(chan.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_ipc_path() {
        let chan = Channel::new("data", SocketType::Push, Method::Bind, "ipc://");
        assert!(chan.validate().is_err());
    }

    #[test]
    fn validate_accepts_a_well_formed_tcp_endpoint() {
        let chan = Channel::new("data", SocketType::Push, Method::Bind, "tcp://127.0.0.1:5555");
        let endpoints = chan.validate().unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].protocol as u8, Protocol::Tcp as u8);
        assert!(chan.is_valid());
    }

    #[test]
    fn validate_honors_endpoint_modifiers_over_default_method() {
        let chan = Channel::new("data", SocketType::Push, Method::Bind, "+tcp://127.0.0.1:5555");
        let endpoints = chan.validate().unwrap();
        assert_eq!(endpoints[0].method, Method::Connect);
    }

    #[test]
    fn validate_accepts_multiple_comma_separated_endpoints() {
        let chan = Channel::new(
            "data",
            SocketType::Pub,
            Method::Bind,
            "tcp://127.0.0.1:5555,tcp://127.0.0.1:5556",
        );
        let endpoints = chan.validate().unwrap();
        assert_eq!(endpoints.len(), 2);
    }

    #[test]
    fn validate_rejects_negative_buffer_sizes() {
        let mut chan = Channel::new("data", SocketType::Push, Method::Bind, "tcp://127.0.0.1:5555");
        chan.snd_buf_size = -1;
        assert!(chan.validate().is_err());
    }

    #[test]
    fn invalidate_forces_revalidation() {
        let chan = Channel::new("data", SocketType::Push, Method::Bind, "tcp://127.0.0.1:5555");
        chan.validate().unwrap();
        assert!(chan.is_valid());
        chan.invalidate();
        assert!(!chan.is_valid());
    }
}
