//! TCP and UDP proxy services
//!
//! Both services are handed a pre-bound socket and the shared collaborators
//! (key registry, metrics sink, optional replay protector) and expose an
//! idempotent `start` / `stop` lifecycle.

use std::{net::IpAddr, sync::Arc};

use crate::relay::socks5::Address;

pub use self::{tcp::TcpService, udp::UdpService};

pub mod tcp;
pub mod udp;

/// Client admission predicate, consulted once per accepted TCP connection
/// and once per inbound UDP datagram. Returning a reason denies the client.
pub type ClientFilter = Arc<dyn Fn(IpAddr) -> Option<String> + Send + Sync>;

pub(crate) fn allow_all() -> ClientFilter {
    Arc::new(|_| None)
}

/// Destinations that parse but must never be dialed
pub(crate) fn prohibited_target(addr: &Address) -> bool {
    match *addr {
        Address::SocketAddress(sa) => sa.port() == 0,
        Address::DomainNameAddress(ref domain, port) => domain.is_empty() || port == 0,
    }
}
