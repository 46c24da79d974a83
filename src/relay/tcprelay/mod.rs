//! Relay for TCP implementation
//!
//! AEAD protocol is defined in <https://shadowsocks.org/en/spec/AEAD.html>.

pub use self::{crypto_io::CryptoStream, proxy_stream::ProxyClientStream};

pub mod aead;
pub mod crypto_io;
pub mod proxy_stream;
pub mod utils;
