pub mod hash;

use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::watch;
use shared::types::{PeerEntry, ServiceRecord};
use crate::lock;

/// Confirmed peers keyed and ordered by identifier.
///
/// Every mutation happens under one lock and republishes the content hash;
/// readers only ever get copies.
pub struct PeerRegistry {
    peers: Mutex<BTreeMap<String, PeerEntry>>,
    hash_tx: watch::Sender<String>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (hash_tx, _) = watch::channel(hash::compute_hash(&[]));
        Self {
            peers: Mutex::new(BTreeMap::new()),
            hash_tx,
        }
    }

    /// Insert or replace an entry. Returns true if the identifier was new.
    pub fn insert(&self, entry: PeerEntry) -> bool {
        let mut peers = lock(&self.peers);
        let is_new = peers.insert(entry.identifier.clone(), entry).is_none();
        self.publish_hash(&peers);
        is_new
    }

    /// Insert `entry` only if `accept` approves it, deciding and inserting
    /// under one lock. Returns `None` when rejected, otherwise whether the
    /// identifier was new.
    pub fn insert_if<F>(&self, entry: PeerEntry, accept: F) -> Option<bool>
    where
        F: FnOnce(&PeerEntry) -> bool,
    {
        let mut peers = lock(&self.peers);
        if !accept(&entry) {
            return None;
        }
        let is_new = peers.insert(entry.identifier.clone(), entry).is_none();
        self.publish_hash(&peers);
        Some(is_new)
    }

    /// Update addresses, port and payload of a known peer from a fresh
    /// resolution. Returns false if the peer is not registered.
    pub fn refresh(&self, record: &ServiceRecord) -> bool {
        let mut peers = lock(&self.peers);
        let Some(entry) = peers.get_mut(&record.identifier) else {
            return false;
        };
        entry.addresses = record.addresses.clone();
        entry.port = record.port;
        entry.payload = record.payload.clone();
        self.publish_hash(&peers);
        true
    }

    pub fn remove(&self, identifier: &str) -> Option<PeerEntry> {
        let mut peers = lock(&self.peers);
        let removed = peers.remove(identifier);
        if removed.is_some() {
            self.publish_hash(&peers);
        }
        removed
    }

    pub fn contains(&self, identifier: &str) -> bool {
        lock(&self.peers).contains_key(identifier)
    }

    /// Copy of all peers, sorted by identifier
    pub fn snapshot(&self) -> Vec<PeerEntry> {
        lock(&self.peers).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.peers).is_empty()
    }

    /// Drop every entry. Returns how many there were.
    pub fn clear(&self) -> usize {
        let mut peers = lock(&self.peers);
        let count = peers.len();
        peers.clear();
        self.publish_hash(&peers);
        count
    }

    pub fn subscribe_hash(&self) -> watch::Receiver<String> {
        self.hash_tx.subscribe()
    }

    fn publish_hash(&self, peers: &BTreeMap<String, PeerEntry>) {
        let entries: Vec<&PeerEntry> = peers.values().collect();
        self.hash_tx.send_replace(hash::compute_hash(&entries));
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
