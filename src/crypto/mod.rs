//! AEAD primitives for the shadowsocks wire protocol

pub use self::{
    cipher::Cipher,
    kind::{CipherKind, UnknownMethodError},
};

pub mod cipher;
pub mod kind;
