//! Relay for UDP implementation
//!
//! shadowsocks UDP Request / Response (before encryption)
//! ```plain
//! +------+----------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +------+----------+----------+----------+
//! |  1   | Variable |    2     | Variable |
//! +------+----------+----------+----------+
//! ```
//!
//! shadowsocks UDP Request / Response (after encryption)
//! ```plain
//! +-------+--------------+
//! | SALT  |   PAYLOAD    |
//! +-------+--------------+
//! | Fixed |   Variable   |
//! +-------+--------------+
//! ```
//!
//! Each datagram is one AEAD message sealed at nonce zero; uniqueness comes
//! from the fresh random salt.

use std::time::Duration;

pub mod crypto_io;

/// The maximum UDP payload size (defined in the original shadowsocks Python)
pub const MAXIMUM_UDP_PAYLOAD_SIZE: usize = 65536;

/// Default NAT association expire time
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
