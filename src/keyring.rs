//! Access key registry with per-client-IP affinity
//!
//! Every new connection or datagram is matched to its key by trial
//! decryption, so the registry keeps the most likely candidates first: a key
//! is annotated with the last client IP that authenticated with it, and
//! snapshots for that IP put it at the front. Affinity is a performance
//! hint, not a correctness requirement; a snapshot taken concurrently with a
//! `mark_used` may be slightly stale.

use std::{
    io,
    net::IpAddr,
    sync::{Arc, Mutex, RwLock},
};

use crate::{
    config::{AccessKey, KeySource},
    crypto::CipherKind,
};

/// One registered access key. The identifier, method and master key are
/// immutable; the affinity annotation is mutable under the entry's own lock.
pub struct KeyEntry {
    id: String,
    method: CipherKind,
    key: Box<[u8]>,
    last_client_ip: Mutex<Option<IpAddr>>,
}

impl KeyEntry {
    fn new(key: AccessKey) -> KeyEntry {
        KeyEntry {
            id: key.id().to_owned(),
            method: key.method(),
            key: key.key().into(),
            last_client_ip: Mutex::new(None),
        }
    }

    /// Key identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// AEAD method
    pub fn method(&self) -> CipherKind {
        self.method
    }

    /// Master key
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    fn matches_ip(&self, client_ip: IpAddr) -> bool {
        *self.last_client_ip.lock().unwrap() == Some(client_ip)
    }
}

/// Ordered, thread-safe collection of access keys
pub struct Keyring {
    entries: RwLock<Vec<Arc<KeyEntry>>>,
}

impl Keyring {
    /// Creates an empty registry
    pub fn new() -> Keyring {
        Keyring {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Builds a registry from a key source
    pub fn from_source<S>(source: &S) -> io::Result<Keyring>
    where
        S: KeySource + ?Sized,
    {
        let keyring = Keyring::new();
        for key in source.access_keys()? {
            keyring.push_back(key);
        }
        Ok(keyring)
    }

    /// Appends a key at the end of the trial order
    pub fn push_back(&self, key: AccessKey) {
        self.entries.write().unwrap().push(Arc::new(KeyEntry::new(key)));
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a consistent ordered view for trial decryption: entries last
    /// used by `client_ip` first, then the rest, each group in its current
    /// relative order.
    pub fn snapshot_for(&self, client_ip: IpAddr) -> Vec<Arc<KeyEntry>> {
        let entries = self.entries.read().unwrap();

        let mut snapshot = Vec::with_capacity(entries.len());
        let mut remaining = Vec::new();
        for entry in entries.iter() {
            if entry.matches_ip(client_ip) {
                snapshot.push(entry.clone());
            } else {
                remaining.push(entry.clone());
            }
        }
        snapshot.append(&mut remaining);
        snapshot
    }

    /// Moves `entry` to the front of the trial order and records `client_ip`
    /// as its affine client. Called once per successful authentication.
    pub fn mark_used(&self, entry: &Arc<KeyEntry>, client_ip: IpAddr) {
        let mut entries = self.entries.write().unwrap();
        if let Some(pos) = entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
            let e = entries.remove(pos);
            entries.insert(0, e);
        }
        *entry.last_client_ip.lock().unwrap() = Some(client_ip);
    }
}

impl Default for Keyring {
    fn default() -> Keyring {
        Keyring::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keyring(n: usize) -> Keyring {
        let keyring = Keyring::new();
        for i in 0..n {
            keyring.push_back(AccessKey::new(
                i.to_string(),
                CipherKind::ChaCha20Poly1305,
                format!("secret-{i}"),
            ));
        }
        keyring
    }

    fn ids(snapshot: &[Arc<KeyEntry>]) -> Vec<&str> {
        snapshot.iter().map(|e| e.id()).collect()
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let keyring = test_keyring(4);
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(ids(&keyring.snapshot_for(ip)), ["0", "1", "2", "3"]);
    }

    #[test]
    fn mark_used_moves_entry_to_front() {
        let keyring = test_keyring(4);
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let other: IpAddr = "192.0.2.2".parse().unwrap();

        let entry = keyring.snapshot_for(ip)[2].clone();
        keyring.mark_used(&entry, ip);

        // affine for the marking client, and at the live front for everyone
        assert_eq!(ids(&keyring.snapshot_for(ip)), ["2", "0", "1", "3"]);
        assert_eq!(ids(&keyring.snapshot_for(other)), ["2", "0", "1", "3"]);
    }

    #[test]
    fn affinity_orders_per_client() {
        let keyring = test_keyring(4);
        let a: IpAddr = "192.0.2.1".parse().unwrap();
        let b: IpAddr = "192.0.2.2".parse().unwrap();

        let for_a = keyring.snapshot_for(a)[3].clone();
        keyring.mark_used(&for_a, a);
        let for_b = keyring.snapshot_for(b)[3].clone();
        keyring.mark_used(&for_b, b);

        assert_eq!(keyring.snapshot_for(a)[0].id(), "3");
        assert_eq!(keyring.snapshot_for(b)[0].id(), "2");

        // no entry is duplicated or dropped
        let snapshot_for_a = keyring.snapshot_for(a);
        let mut snapshot = ids(&snapshot_for_a);
        snapshot.sort_unstable();
        assert_eq!(snapshot, ["0", "1", "2", "3"]);
    }
}
