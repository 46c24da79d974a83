//! Usage metrics interface
//!
//! The services report connection, datagram and probe events through a
//! [`MetricsSink`]. Export formats and aggregation live with the caller.

use std::{fmt, time::Duration};

/// Terminal status of a relayed session or datagram. The set is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    ErrCipher,
    ErrReplay,
    ErrAddress,
    ErrDial,
    ErrRelay,
    ErrTimeout,
}

impl Status {
    /// Stable label for metric dimensions
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::ErrCipher => "ERR_CIPHER",
            Status::ErrReplay => "ERR_REPLAY",
            Status::ErrAddress => "ERR_ADDRESS",
            Status::ErrDial => "ERR_DIAL",
            Status::ErrRelay => "ERR_RELAY",
            Status::ErrTimeout => "ERR_TIMEOUT",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte counters for one TCP session. `client_proxy` / `proxy_client` count
/// wire (encrypted) bytes, `proxy_target` / `target_proxy` count plaintext.
#[derive(Clone, Copy, Debug, Default)]
pub struct Traffic {
    pub client_proxy: u64,
    pub proxy_target: u64,
    pub target_proxy: u64,
    pub proxy_client: u64,
}

/// Receives usage and probe events from the services.
///
/// Every method has a no-op default, implementors pick what they care about.
/// Calls are made from the service tasks, implementations must be cheap and
/// non-blocking.
pub trait MetricsSink: Send + Sync {
    /// A TCP connection was accepted
    fn add_open_tcp_connection(&self) {}

    /// A TCP connection terminated. `key_id` is empty when no key was
    /// identified, `cipher_search` is how long trial decryption took.
    fn add_closed_tcp_connection(
        &self,
        _key_id: &str,
        _status: Status,
        _traffic: &Traffic,
        _cipher_search: Duration,
        _duration: Duration,
    ) {
    }

    /// A TCP connection failed authentication or replayed a handshake;
    /// `drained_bytes` is how much the prober sent before the deadline.
    fn add_tcp_probe(&self, _status: Status, _drained_bytes: u64) {}

    /// An inbound UDP datagram was processed
    fn add_udp_packet_from_client(
        &self,
        _key_id: &str,
        _status: Status,
        _client_proxy_bytes: usize,
        _proxy_target_bytes: usize,
        _cipher_search: Duration,
    ) {
    }

    /// A UDP reply from a target was relayed back
    fn add_udp_packet_from_target(
        &self,
        _key_id: &str,
        _status: Status,
        _target_proxy_bytes: usize,
        _proxy_client_bytes: usize,
    ) {
    }

    /// A UDP NAT association was created
    fn add_udp_nat_entry(&self) {}

    /// A UDP NAT association was removed
    fn remove_udp_nat_entry(&self) {}
}

/// Discards every event
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}
