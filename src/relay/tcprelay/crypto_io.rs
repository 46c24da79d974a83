//! Encrypted TCP stream
//!
//! Joins a [`DecryptedReader`] and an [`EncryptedWriter`] over one transport
//! stream. Each direction carries its own salt and therefore its own derived
//! session key and nonce counter.

use std::{
    io,
    pin::Pin,
    task::{self, Poll},
};

use byte_string::ByteStr;
use futures::ready;
use log::trace;
use rand::{thread_rng, RngCore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::aead::{DecryptedReader, EncryptedWriter};
use crate::crypto::CipherKind;

/// A stream that encrypts written data and decrypts read data with the
/// shadowsocks AEAD chunk protocol
pub struct CryptoStream<S> {
    stream: S,
    dec: DecryptedReader,
    enc: EncryptedWriter,
    method: CipherKind,
}

impl<S> CryptoStream<S> {
    /// Creates a stream with a fresh random write salt; the read salt is
    /// taken from the head of the peer's stream. This is the client-side
    /// construction.
    pub fn from_stream(stream: S, method: CipherKind, key: &[u8]) -> CryptoStream<S> {
        let salt = generate_salt(method);

        CryptoStream {
            stream,
            dec: DecryptedReader::new(method, key),
            enc: EncryptedWriter::new(method, key, &salt),
            method,
        }
    }

    /// Creates the server side of a stream whose inbound salt was already
    /// consumed by the access key dispatcher. `buffered` is the ciphertext
    /// read past the salt; decryption restarts from it at nonce zero. The
    /// outbound direction gets its own fresh salt.
    pub fn from_identified(stream: S, method: CipherKind, key: &[u8], salt: &[u8], buffered: &[u8]) -> CryptoStream<S> {
        let write_salt = generate_salt(method);

        CryptoStream {
            stream,
            dec: DecryptedReader::from_identified(method, key, salt, buffered),
            enc: EncryptedWriter::new(method, key, &write_salt),
            method,
        }
    }

    /// Cipher method of this stream
    pub fn method(&self) -> CipherKind {
        self.method
    }

    /// Queues plaintext to be coalesced with the next written chunk, without
    /// touching the transport. Flushing (or any write) sends it.
    pub fn lazy_write(&mut self, buf: &[u8]) -> usize {
        self.enc.lazy_write(buf)
    }

    /// Get reference to the underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Get mutable reference to the underlying stream
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consumes the object and returns the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

fn generate_salt(method: CipherKind) -> Vec<u8> {
    let mut salt = vec![0u8; method.salt_len()];
    thread_rng().fill_bytes(&mut salt);
    trace!("generated AEAD salt {:?}", ByteStr::new(&salt));
    salt
}

impl<S> AsyncRead for CryptoStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.dec.poll_read_decrypted(cx, &mut this.stream, buf)
    }
}

impl<S> AsyncWrite for CryptoStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.enc.poll_write_encrypted(cx, &mut this.stream, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.enc.poll_flush_pending(cx, &mut this.stream))?;
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.enc.poll_flush_pending(cx, &mut this.stream))?;
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    const ALL_KINDS: [CipherKind; 4] = [
        CipherKind::Aes128Gcm,
        CipherKind::Aes192Gcm,
        CipherKind::Aes256Gcm,
        CipherKind::ChaCha20Poly1305,
    ];

    fn test_key(kind: CipherKind) -> Vec<u8> {
        (0..kind.key_len() as u8).map(|b| b.wrapping_mul(3)).collect()
    }

    #[tokio::test]
    async fn stream_roundtrip_all_methods() {
        for kind in ALL_KINDS {
            let key = test_key(kind);
            let (a, b) = tokio::io::duplex(1 << 20);

            let mut left = CryptoStream::from_stream(a, kind, &key);
            let mut right = CryptoStream::from_stream(b, kind, &key);

            // uneven write sizes, some larger than one chunk
            let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
            let payload_clone = payload.clone();
            let writer = tokio::spawn(async move {
                let mut offset = 0;
                for chunk in [1usize, 7, 0x3FFF, 0x4001, 100_000] {
                    let end = usize::min(offset + chunk, payload_clone.len());
                    left.write_all(&payload_clone[offset..end]).await.unwrap();
                    offset = end;
                }
                left.write_all(&payload_clone[offset..]).await.unwrap();
                left.shutdown().await.unwrap();
            });

            let mut received = Vec::new();
            right.read_to_end(&mut received).await.unwrap();
            writer.await.unwrap();

            assert_eq!(received, payload, "{kind}");
        }
    }

    #[tokio::test]
    async fn lazy_write_coalesces_with_first_chunk() {
        let kind = CipherKind::ChaCha20Poly1305;
        let key = test_key(kind);
        let (a, b) = tokio::io::duplex(1 << 16);

        let mut left = CryptoStream::from_stream(a, kind, &key);
        let header = b"\x01\x7f\x00\x00\x01\x1f\x90";
        left.lazy_write(header);

        let payload = b"hello world";
        left.write_all(payload).await.unwrap();

        // a single wire record: salt, one sealed length, one sealed payload
        let expected = kind.salt_len() + (2 + kind.tag_len()) + (header.len() + payload.len() + kind.tag_len());
        let mut wire = vec![0u8; expected + 1];
        let mut raw = b;
        let n = raw.read(&mut wire).await.unwrap();
        assert_eq!(n, expected);

        // and the decrypted chunk carries header and payload back to back
        let (a2, b2) = tokio::io::duplex(1 << 16);
        let mut sender = CryptoStream::from_stream(a2, kind, &key);
        let mut receiver = CryptoStream::from_stream(b2, kind, &key);
        sender.lazy_write(header);
        sender.write_all(payload).await.unwrap();

        let mut plain = vec![0u8; header.len() + payload.len()];
        receiver.read_exact(&mut plain).await.unwrap();
        assert_eq!(&plain[..header.len()], header);
        assert_eq!(&plain[header.len()..], payload);
    }

    #[tokio::test]
    async fn flush_sends_pending_alone_and_is_idempotent() {
        let kind = CipherKind::Aes128Gcm;
        let key = test_key(kind);
        let (a, b) = tokio::io::duplex(1 << 16);

        let mut left = CryptoStream::from_stream(a, kind, &key);
        let header = b"\x03\x00\x00\x50";
        left.lazy_write(header);
        left.flush().await.unwrap();
        // nothing pending anymore
        left.flush().await.unwrap();

        let mut right = CryptoStream::from_stream(b, kind, &key);
        let mut plain = vec![0u8; header.len()];
        tokio::time::timeout(Duration::from_secs(1), right.read_exact(&mut plain))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&plain[..], header);
    }

    #[tokio::test]
    async fn truncated_stream_is_unexpected_eof() {
        let kind = CipherKind::Aes256Gcm;
        let key = test_key(kind);
        let (a, b) = tokio::io::duplex(1 << 16);

        let mut left = CryptoStream::from_stream(a, kind, &key);
        left.write_all(b"0123456789").await.unwrap();

        // capture the wire bytes and replay all but the final tag byte
        let mut raw = b;
        let mut wire = Vec::new();
        drop(left);
        raw.read_to_end(&mut wire).await.unwrap();
        wire.pop();

        let (a2, b2) = tokio::io::duplex(1 << 16);
        let mut raw_sender = a2;
        raw_sender.write_all(&wire).await.unwrap();
        drop(raw_sender);

        let mut receiver = CryptoStream::from_stream(b2, kind, &key);
        let mut out = Vec::new();
        let err = receiver.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn salts_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..100_000 {
            let salt = generate_salt(CipherKind::ChaCha20Poly1305);
            assert!(seen.insert(salt));
        }
    }
}
