//! Access key configuration

use std::{fmt, io};

use md5::{Digest, Md5};

use crate::crypto::CipherKind;

/// One pre-shared access key: an opaque identifier, an AEAD method and the
/// secret it authenticates with.
///
/// The master key is derived from the text secret at construction time with
/// OpenSSL's `EVP_BytesToKey` (MD5), the conventional shadowsocks password
/// derivation.
#[derive(Clone)]
pub struct AccessKey {
    id: String,
    method: CipherKind,
    password: String,
    key: Box<[u8]>,
}

impl AccessKey {
    /// Creates an access key, deriving the master key from `password`
    pub fn new<I, P>(id: I, method: CipherKind, password: P) -> AccessKey
    where
        I: Into<String>,
        P: Into<String>,
    {
        let password = password.into();

        let mut key = vec![0u8; method.key_len()].into_boxed_slice();
        openssl_bytes_to_key(password.as_bytes(), &mut key);

        AccessKey {
            id: id.into(),
            method,
            password,
            key,
        }
    }

    /// Key identifier, opaque to the proxy
    pub fn id(&self) -> &str {
        &self.id
    }

    /// AEAD method
    pub fn method(&self) -> CipherKind {
        self.method
    }

    /// Original text secret
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Derived master key
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // the secret stays out of logs
        f.debug_struct("AccessKey")
            .field("id", &self.id)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Key derivation from password, the OpenSSL `EVP_BytesToKey` behavior with
/// MD5 and no IV
pub fn openssl_bytes_to_key(password: &[u8], key: &mut [u8]) {
    let key_len = key.len();

    let mut last_digest: Option<[u8; 16]> = None;
    let mut offset = 0;
    while offset < key_len {
        let mut m = Md5::new();
        if let Some(ld) = last_digest {
            m.update(ld);
        }
        m.update(password);

        let digest = m.finalize();
        let amt = usize::min(key_len - offset, digest.len());
        key[offset..offset + amt].copy_from_slice(&digest[..amt]);

        offset += amt;
        last_digest = Some(digest.into());
    }
}

/// Supplies the access keys the proxy serves. The registry is built from this
/// once at startup; hot reload is a concern of the caller.
pub trait KeySource {
    fn access_keys(&self) -> io::Result<Vec<AccessKey>>;
}

impl KeySource for Vec<AccessKey> {
    fn access_keys(&self) -> io::Result<Vec<AccessKey>> {
        Ok(self.clone())
    }
}

impl KeySource for [AccessKey] {
    fn access_keys(&self) -> io::Result<Vec<AccessKey>> {
        Ok(self.to_vec())
    }
}
