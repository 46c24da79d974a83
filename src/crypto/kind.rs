//! Supported AEAD cipher methods

use std::{fmt, str::FromStr};

/// AEAD method of an access key.
///
/// Every supported method seals with a 16-byte tag and a 12-byte nonce; the
/// per-direction salt has the same length as the master key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    /// Master key (and derived session key) length in bytes
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes192Gcm => 24,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 32,
        }
    }

    /// Per-direction salt length in bytes
    pub fn salt_len(self) -> usize {
        self.key_len()
    }

    /// AEAD nonce length in bytes
    pub fn nonce_len(self) -> usize {
        12
    }

    /// AEAD tag length in bytes
    pub fn tag_len(self) -> usize {
        16
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes192Gcm => "aes-192-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
        })
    }
}

/// Error parsing a method name
#[derive(Debug, thiserror::Error)]
#[error("unknown cipher method {0:?}")]
pub struct UnknownMethodError(String);

impl FromStr for CipherKind {
    type Err = UnknownMethodError;

    fn from_str(s: &str) -> Result<CipherKind, UnknownMethodError> {
        match s {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-192-gcm" => Ok(CipherKind::Aes192Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            _ => Err(UnknownMethodError(s.to_owned())),
        }
    }
}
