//! UDP datagram codec
//!
//! One datagram is one standalone sealed message. Its plaintext starts with
//! a SOCKS5-style address: the destination on the way in, the reply source
//! on the way out. Whatever follows the address is the payload.

use std::io::Cursor;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::{
    crypto::{Cipher, CipherKind},
    relay::socks5::{self, Address},
};

/// Why an inbound datagram was rejected
#[derive(Error, Debug)]
pub enum DatagramError {
    #[error("datagram of {0} bytes cannot hold a salt and tag")]
    Truncated(usize),
    #[error("datagram failed authentication")]
    BadSeal,
    #[error("datagram carries no usable address: {0}")]
    Header(#[from] socks5::Error),
}

/// Builds the wire form of one datagram: the address header and payload
/// sealed together behind a fresh salt, appended to `dst`
pub fn encrypt_payload(method: CipherKind, key: &[u8], addr: &Address, payload: &[u8], dst: &mut BytesMut) {
    let mut plain = BytesMut::with_capacity(addr.serialized_len() + payload.len());
    addr.write_to_buf(&mut plain);
    plain.put_slice(payload);

    Cipher::seal_message(method, key, &plain, dst);
}

/// Opens one datagram in place and splits its plaintext into the embedded
/// address and the payload that follows it
pub fn decrypt_payload<'a>(
    method: CipherKind,
    key: &[u8],
    datagram: &'a mut [u8],
) -> Result<(Address, &'a [u8]), DatagramError> {
    if datagram.len() < method.salt_len() + method.tag_len() {
        return Err(DatagramError::Truncated(datagram.len()));
    }

    let plain = Cipher::open_message(method, key, datagram).ok_or(DatagramError::BadSeal)?;

    let mut cur = Cursor::new(&plain[..]);
    let addr = Address::read_cursor(&mut cur)?;
    let header_len = cur.position() as usize;

    Ok((addr, &plain[header_len..]))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    const ALL_KINDS: [CipherKind; 4] = [
        CipherKind::Aes128Gcm,
        CipherKind::Aes192Gcm,
        CipherKind::Aes256Gcm,
        CipherKind::ChaCha20Poly1305,
    ];

    #[test]
    fn datagram_roundtrip() {
        for kind in ALL_KINDS {
            let key: Vec<u8> = (0..kind.key_len() as u8).collect();
            let addr = Address::from("198.51.100.7:53".parse::<SocketAddr>().unwrap());
            let payload = b"a small request";

            let mut packet = BytesMut::new();
            encrypt_payload(kind, &key, &addr, payload, &mut packet);
            assert_eq!(
                packet.len(),
                kind.salt_len() + addr.serialized_len() + payload.len() + kind.tag_len()
            );

            let mut wire = packet.to_vec();
            let (parsed, plain) = decrypt_payload(kind, &key, &mut wire).unwrap();
            assert_eq!(parsed, addr);
            assert_eq!(plain, &payload[..]);
        }
    }

    #[test]
    fn tampered_datagram_rejected() {
        let kind = CipherKind::ChaCha20Poly1305;
        let key = vec![9u8; kind.key_len()];
        let addr = Address::from("198.51.100.7:53".parse::<SocketAddr>().unwrap());

        let mut packet = BytesMut::new();
        encrypt_payload(kind, &key, &addr, b"payload", &mut packet);

        let mut wire = packet.to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0x80;
        assert!(matches!(
            decrypt_payload(kind, &key, &mut wire),
            Err(DatagramError::BadSeal)
        ));
    }

    #[test]
    fn wrong_key_rejected() {
        let kind = CipherKind::Aes256Gcm;
        let key = vec![1u8; kind.key_len()];
        let other = vec![2u8; kind.key_len()];
        let addr = Address::from("198.51.100.7:53".parse::<SocketAddr>().unwrap());

        let mut packet = BytesMut::new();
        encrypt_payload(kind, &key, &addr, b"payload", &mut packet);

        let mut wire = packet.to_vec();
        assert!(matches!(
            decrypt_payload(kind, &other, &mut wire),
            Err(DatagramError::BadSeal)
        ));
    }

    #[test]
    fn short_datagram_rejected() {
        let kind = CipherKind::Aes128Gcm;
        let key = vec![1u8; kind.key_len()];
        let mut wire = [0u8; 10];
        assert!(matches!(
            decrypt_payload(kind, &key, &mut wire),
            Err(DatagramError::Truncated(10))
        ));
    }
}
