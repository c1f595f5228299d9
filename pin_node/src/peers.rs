//! Table of authenticated connections, keyed by peer id.

use dashmap::DashMap;
use pin_core::PeerId;
use pin_protocol::{DiscoveryPeer, Envelope};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Outbound half of a connection; a writer task drains it into the socket.
pub type PeerSender = mpsc::UnboundedSender<Envelope>;

#[derive(Debug)]
struct PeerEntry {
    sender: PeerSender,
    discovery: Option<String>,
    connection: u64,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    entries: DashMap<PeerId, PeerEntry>,
    next_connection: AtomicU64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel for `peer`, replacing any previous one, and
    /// returns a token that [`PeerTable::remove`] needs.
    pub fn insert(&self, peer: PeerId, sender: PeerSender, discovery: Option<String>) -> u64 {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            peer,
            PeerEntry {
                sender,
                discovery,
                connection,
            },
        );
        connection
    }

    /// Removes `peer` unless a newer connection has replaced it since.
    pub fn remove(&self, peer: &PeerId, connection: u64) -> bool {
        self.entries
            .remove_if(peer, |_, entry| entry.connection == connection)
            .is_some()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queues `envelope` for `peer`. Returns false if the peer is not
    /// connected or its connection is shutting down.
    pub fn send(&self, peer: &PeerId, envelope: Envelope) -> bool {
        match self.entries.get(peer) {
            Some(entry) => entry.sender.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Queues `envelope` for every connected peer except those in `skip`.
    /// Returns the number of peers it was queued for.
    pub fn broadcast(&self, envelope: &Envelope, skip: &[&PeerId]) -> usize {
        self.entries
            .iter()
            .filter(|entry| !skip.contains(&entry.key()))
            .filter(|entry| entry.sender.send(envelope.clone()).is_ok())
            .count()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Connected peers that announced a discovery address.
    pub fn allocator_capable(&self) -> Vec<DiscoveryPeer> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry.discovery.as_ref().map(|discovery| DiscoveryPeer {
                    peer_id: entry.key().clone(),
                    discovery: discovery.clone(),
                })
            })
            .collect()
    }
}
