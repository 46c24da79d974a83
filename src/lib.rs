//! Multi-access-key shadowsocks AEAD proxy server core
//!
//! A single listener serves many independent access keys. Each new TCP
//! connection or UDP datagram is matched to its key by trial decryption of
//! the initial AEAD block, ordered by a per-client-IP affinity cache so the
//! steady state costs one verification. Authenticated TCP streams relay to
//! the destination carried in a SOCKS5-style header; UDP datagrams are
//! multiplexed through a NAT table of per-client target sockets. Connections
//! that no key can open, or that replay a previously observed handshake, are
//! absorbed without ever writing back.

pub use self::{
    config::{AccessKey, KeySource},
    crypto::{Cipher, CipherKind},
    keyring::{KeyEntry, Keyring},
    metrics::{MetricsSink, NoopMetrics, Status, Traffic},
    security::replay::ReplayProtector,
    service::{ClientFilter, TcpService, UdpService},
};

pub mod config;
pub mod crypto;
pub mod keyring;
pub mod metrics;
pub mod net;
pub mod relay;
pub mod security;
pub mod service;
