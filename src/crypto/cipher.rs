//! AEAD session cipher
//!
//! A session key is derived from the access key's master key and the
//! per-direction salt with HKDF-SHA1 (info `"ss-subkey"`). The nonce is a
//! 12-byte little-endian counter starting at zero, advanced once per
//! seal/open operation; uniqueness within a direction follows from the
//! counter, across directions from the independent salts.

use aes_gcm::{
    aead::{
        generic_array::{typenum::U12, GenericArray},
        AeadInPlace, KeyInit,
    },
    aes::Aes192,
    Aes128Gcm, Aes256Gcm, AesGcm,
};
use byte_string::ByteStr;
use bytes::{BufMut, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use log::trace;
use rand::{thread_rng, RngCore};
use sha1::Sha1;

use super::kind::CipherKind;

/// The `aes-gcm` crate aliases only the 128/256-bit variants
type Aes192Gcm = AesGcm<Aes192, U12>;

const SUBKEY_INFO: &[u8] = b"ss-subkey";
const NONCE_LEN: usize = 12;

enum CipherVariant {
    Aes128Gcm(Aes128Gcm),
    Aes192Gcm(Aes192Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

/// One direction's AEAD state: derived session key and nonce counter
pub struct Cipher {
    variant: CipherVariant,
    nonce: [u8; NONCE_LEN],
    kind: CipherKind,
}

impl Cipher {
    /// Derives the session key from `key` and `salt` and builds the cipher
    /// with its nonce counter at zero.
    pub fn new(kind: CipherKind, key: &[u8], salt: &[u8]) -> Cipher {
        debug_assert_eq!(key.len(), kind.key_len());
        debug_assert_eq!(salt.len(), kind.salt_len());

        let mut subkey = [0u8; 32];
        let subkey = &mut subkey[..kind.key_len()];
        hkdf_sha1(key, salt, subkey);

        let variant = match kind {
            CipherKind::Aes128Gcm => {
                CipherVariant::Aes128Gcm(Aes128Gcm::new_from_slice(subkey).expect("aes-128-gcm session key"))
            }
            CipherKind::Aes192Gcm => {
                CipherVariant::Aes192Gcm(Aes192Gcm::new_from_slice(subkey).expect("aes-192-gcm session key"))
            }
            CipherKind::Aes256Gcm => {
                CipherVariant::Aes256Gcm(Aes256Gcm::new_from_slice(subkey).expect("aes-256-gcm session key"))
            }
            CipherKind::ChaCha20Poly1305 => CipherVariant::ChaCha20Poly1305(
                ChaCha20Poly1305::new_from_slice(subkey).expect("chacha20-ietf-poly1305 session key"),
            ),
        };

        Cipher {
            variant,
            nonce: [0u8; NONCE_LEN],
            kind,
        }
    }

    /// Cipher method
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// AEAD tag length in bytes
    pub fn tag_len(&self) -> usize {
        self.kind.tag_len()
    }

    /// Seals `m` in place. The plaintext occupies `m[..m.len() - tag_len()]`,
    /// the trailing bytes are overwritten with the tag. Advances the nonce
    /// once.
    pub fn encrypt_packet(&mut self, m: &mut [u8]) {
        let tag_len = self.tag_len();
        debug_assert!(m.len() >= tag_len);

        let data_len = m.len() - tag_len;
        let (data, tag_out) = m.split_at_mut(data_len);

        let nonce = self.nonce;
        let nonce = GenericArray::from_slice(&nonce);
        let tag = match self.variant {
            CipherVariant::Aes128Gcm(ref c) => c.encrypt_in_place_detached(nonce, &[], data),
            CipherVariant::Aes192Gcm(ref c) => c.encrypt_in_place_detached(nonce, &[], data),
            CipherVariant::Aes256Gcm(ref c) => c.encrypt_in_place_detached(nonce, &[], data),
            CipherVariant::ChaCha20Poly1305(ref c) => c.encrypt_in_place_detached(nonce, &[], data),
        }
        .expect("aead seal");
        tag_out.copy_from_slice(tag.as_slice());

        increase_nonce(&mut self.nonce);
    }

    /// Opens `m` in place, leaving the plaintext in
    /// `m[..m.len() - tag_len()]`. Returns `false` if the tag does not
    /// verify. Advances the nonce once either way.
    pub fn decrypt_packet(&mut self, m: &mut [u8]) -> bool {
        let tag_len = self.tag_len();
        if m.len() < tag_len {
            return false;
        }

        let data_len = m.len() - tag_len;
        let (data, tag) = m.split_at_mut(data_len);
        let tag = GenericArray::from_slice(tag);

        let nonce = self.nonce;
        let nonce = GenericArray::from_slice(&nonce);
        let ret = match self.variant {
            CipherVariant::Aes128Gcm(ref c) => c.decrypt_in_place_detached(nonce, &[], data, tag),
            CipherVariant::Aes192Gcm(ref c) => c.decrypt_in_place_detached(nonce, &[], data, tag),
            CipherVariant::Aes256Gcm(ref c) => c.decrypt_in_place_detached(nonce, &[], data, tag),
            CipherVariant::ChaCha20Poly1305(ref c) => c.decrypt_in_place_detached(nonce, &[], data, tag),
        };

        increase_nonce(&mut self.nonce);
        ret.is_ok()
    }

    /// Seals `plaintext` as a standalone message appended to `dst`:
    /// `salt || ciphertext || tag`, with a fresh random salt and the nonce
    /// counter at zero. For datagram transports, where every message carries
    /// its own salt instead of sharing a stream's.
    pub fn seal_message(kind: CipherKind, key: &[u8], plaintext: &[u8], dst: &mut BytesMut) {
        let salt_len = kind.salt_len();
        let start = dst.len();
        dst.reserve(salt_len + plaintext.len() + kind.tag_len());

        dst.resize(start + salt_len, 0);
        let salt = &mut dst[start..];
        thread_rng().fill_bytes(salt);
        trace!("sealing message with fresh salt {:?}", ByteStr::new(salt));

        let mut cipher = Cipher::new(kind, key, &dst[start..]);
        dst.put_slice(plaintext);
        dst.resize(start + salt_len + plaintext.len() + kind.tag_len(), 0);
        cipher.encrypt_packet(&mut dst[start + salt_len..]);
    }

    /// Opens a standalone `salt || ciphertext || tag` message in place.
    /// Returns the plaintext, which sits right after the salt, or `None`
    /// when the message is too short or its tag does not verify.
    pub fn open_message<'a>(kind: CipherKind, key: &[u8], message: &'a mut [u8]) -> Option<&'a mut [u8]> {
        let salt_len = kind.salt_len();
        if message.len() < salt_len + kind.tag_len() {
            return None;
        }

        let (salt, sealed) = message.split_at_mut(salt_len);
        let mut cipher = Cipher::new(kind, key, salt);
        if !cipher.decrypt_packet(sealed) {
            return None;
        }

        let plain_len = sealed.len() - kind.tag_len();
        Some(&mut sealed[..plain_len])
    }

    #[cfg(test)]
    pub(crate) fn nonce(&self) -> &[u8] {
        &self.nonce
    }
}

/// HKDF-SHA1 session key expansion
fn hkdf_sha1(key: &[u8], salt: &[u8], okm: &mut [u8]) {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    hk.expand(SUBKEY_INFO, okm).expect("hkdf-sha1 expand");
}

/// Increment a little-endian unsigned integer, wrapping on overflow
fn increase_nonce(nonce: &mut [u8]) {
    for b in nonce.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            return;
        }
    }
}
