//! Peer table
//!
//! The authoritative in-memory record of live tunnel peers: identity,
//! assigned inner IP, session key, replay counter, and liveness. Three
//! indices (id, inner IP, key fingerprint) are kept in lockstep under one
//! lock; every public operation is its own short critical section and no
//! AEAD work ever happens under the lock.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::crypto::{self, Key};
use crate::error::{Error, Result};
use crate::registry::KeyRegistry;

/// Hard cap on live sessions, bounded by the one-byte peer id. The inner
/// address pool (10.0.0.2..=10.0.0.255) runs out one entry earlier.
pub const MAX_PEERS: usize = 255;
/// The server's own address on the inner network; never assigned to a peer.
pub const SERVER_INNER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// A live peer session.
struct Peer {
    id: u8,
    inner_ip: Ipv4Addr,
    key: Key,
    remote_addr: SocketAddr,
    /// Highest sequence seen in either direction. Both directions encrypt
    /// under the same key with a sequence-derived nonce, so they must share
    /// one sequence space.
    last_seq: u32,
    last_seen: Instant,
    connected: bool,
}

/// What `authenticate` hands back for the Auth response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub id: u8,
    pub inner_ip: Ipv4Addr,
    pub key: Key,
}

/// Everything the egress pump needs to send one Data packet.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub key: Key,
    pub sequence: u32,
    pub remote_addr: SocketAddr,
}

/// Immutable per-peer descriptor for the control surface.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: u8,
    pub inner_ip: Ipv4Addr,
    pub remote_addr: SocketAddr,
    pub connected: bool,
    pub idle: Duration,
}

struct Tables {
    by_id: HashMap<u8, Peer>,
    ip_index: HashMap<Ipv4Addr, u8>,
    key_index: HashMap<[u8; 8], u8>,
}

pub struct PeerTable {
    inner: RwLock<Tables>,
    timeout: Duration,
}

impl PeerTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Tables {
                by_id: HashMap::new(),
                ip_index: HashMap::new(),
                key_index: HashMap::new(),
            }),
            timeout,
        }
    }

    /// Authenticate a peer. `claimed_id == 0` requests assignment: the
    /// smallest unused id and inner IP are allocated and a fresh key is
    /// generated. A claimed id is looked up in the registry; if that id is
    /// already live its session is replaced in place (address updated,
    /// sequence reset, key re-copied, inner IP retained).
    pub fn authenticate(
        &self,
        claimed_id: u8,
        remote_addr: SocketAddr,
        registry: &KeyRegistry,
    ) -> Result<AuthGrant> {
        // Registry access stays outside the table lock.
        let registry_key = if claimed_id != 0 {
            Some(registry.lookup(claimed_id).ok_or(Error::UnknownPeer(claimed_id))?)
        } else {
            None
        };

        let mut tables = self.inner.write().unwrap();

        if let Some(key) = registry_key {
            if tables.by_id.contains_key(&claimed_id) {
                return Ok(Self::replace_session(&mut tables, claimed_id, key, remote_addr));
            }
            let fp = crypto::fingerprint(&key);
            if tables.key_index.contains_key(&fp) {
                return Err(Error::DuplicateKey);
            }
            Self::insert(&mut tables, claimed_id, key, remote_addr)
        } else {
            let key = crypto::generate_key();
            let fp = crypto::fingerprint(&key);
            if tables.key_index.contains_key(&fp) {
                return Err(Error::DuplicateKey);
            }
            let id = Self::next_free_id(&tables).ok_or(Error::Full)?;
            Self::insert(&mut tables, id, key, remote_addr)
        }
    }

    fn insert(tables: &mut Tables, id: u8, key: Key, remote_addr: SocketAddr) -> Result<AuthGrant> {
        if tables.by_id.len() >= MAX_PEERS {
            return Err(Error::Full);
        }
        let inner_ip = Self::next_free_ip(tables).ok_or(Error::Full)?;
        let fp = crypto::fingerprint(&key);
        tables.by_id.insert(
            id,
            Peer {
                id,
                inner_ip,
                key,
                remote_addr,
                last_seq: 0,
                last_seen: Instant::now(),
                connected: true,
            },
        );
        tables.ip_index.insert(inner_ip, id);
        tables.key_index.insert(fp, id);
        info!(peer = id, ip = %inner_ip, from = %remote_addr, "peer authenticated");
        Ok(AuthGrant { id, inner_ip, key })
    }

    fn replace_session(
        tables: &mut Tables,
        id: u8,
        key: Key,
        remote_addr: SocketAddr,
    ) -> AuthGrant {
        let peer = tables.by_id.get_mut(&id).expect("caller checked presence");
        let old_fp = crypto::fingerprint(&peer.key);
        peer.key = key;
        peer.remote_addr = remote_addr;
        peer.last_seq = 0;
        peer.last_seen = Instant::now();
        peer.connected = true;
        let inner_ip = peer.inner_ip;
        tables.key_index.remove(&old_fp);
        tables.key_index.insert(crypto::fingerprint(&key), id);
        info!(peer = id, from = %remote_addr, "session re-initialized");
        AuthGrant { id, inner_ip, key }
    }

    /// Sequence-window admission for an inbound Data packet: checks strict
    /// monotonicity and hands back the key, without mutating any state.
    /// Commit happens separately, after decryption succeeds.
    pub fn begin_inbound(&self, peer_id: u8, sequence: u32) -> Result<Key> {
        let tables = self.inner.read().unwrap();
        let peer = tables.by_id.get(&peer_id).ok_or(Error::UnknownPeer(peer_id))?;
        if sequence <= peer.last_seq {
            return Err(Error::ReplayOrReorder { peer: peer_id, sequence, last: peer.last_seq });
        }
        Ok(peer.key)
    }

    /// Commit an admitted sequence: advance the replay counter, refresh
    /// liveness, and follow the peer's address. The monotonicity check is
    /// re-run so the same `(peer, sequence)` can never commit twice.
    pub fn commit_inbound(&self, peer_id: u8, sequence: u32, remote_addr: SocketAddr) -> Result<()> {
        let mut tables = self.inner.write().unwrap();
        let peer = tables.by_id.get_mut(&peer_id).ok_or(Error::UnknownPeer(peer_id))?;
        if sequence <= peer.last_seq {
            return Err(Error::ReplayOrReorder { peer: peer_id, sequence, last: peer.last_seq });
        }
        peer.last_seq = sequence;
        peer.last_seen = Instant::now();
        peer.remote_addr = remote_addr;
        Ok(())
    }

    /// Admission and commit in one critical section, for packet types that
    /// carry no ciphertext (Ping, Pong). Returns the peer's recorded
    /// address for the reply.
    pub fn touch(&self, peer_id: u8, sequence: u32, remote_addr: SocketAddr) -> Result<SocketAddr> {
        let mut tables = self.inner.write().unwrap();
        let peer = tables.by_id.get_mut(&peer_id).ok_or(Error::UnknownPeer(peer_id))?;
        if sequence <= peer.last_seq {
            return Err(Error::ReplayOrReorder { peer: peer_id, sequence, last: peer.last_seq });
        }
        peer.last_seq = sequence;
        peer.last_seen = Instant::now();
        peer.remote_addr = remote_addr;
        Ok(peer.remote_addr)
    }

    /// Reserve the next outbound sequence and return everything needed to
    /// seal and send. The counter advances atomically, so a burned sequence
    /// (send failure) is skipped rather than reused.
    pub fn allocate_outbound(&self, peer_id: u8) -> Result<Outbound> {
        let mut tables = self.inner.write().unwrap();
        let peer = tables.by_id.get_mut(&peer_id).ok_or(Error::UnknownPeer(peer_id))?;
        if peer.last_seq == u32::MAX {
            return Err(Error::SequenceExhausted(peer_id));
        }
        peer.last_seq += 1;
        Ok(Outbound {
            key: peer.key,
            sequence: peer.last_seq,
            remote_addr: peer.remote_addr,
        })
    }

    pub fn resolve_by_inner_ip(&self, ip: Ipv4Addr) -> Option<u8> {
        self.inner.read().unwrap().ip_index.get(&ip).copied()
    }

    /// Remove a peer from all three indices.
    pub fn evict(&self, peer_id: u8) -> Result<()> {
        let mut tables = self.inner.write().unwrap();
        let peer = tables.by_id.remove(&peer_id).ok_or(Error::UnknownPeer(peer_id))?;
        tables.ip_index.remove(&peer.inner_ip);
        tables.key_index.remove(&crypto::fingerprint(&peer.key));
        info!(peer = peer_id, ip = %peer.inner_ip, "peer evicted");
        Ok(())
    }

    /// Evict every peer whose last activity precedes `now - timeout`.
    /// Returns the evicted ids.
    pub fn tick(&self, now: Instant) -> Vec<u8> {
        let mut tables = self.inner.write().unwrap();
        let expired: Vec<u8> = tables
            .by_id
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > self.timeout)
            .map(|p| p.id)
            .collect();
        for id in &expired {
            if let Some(peer) = tables.by_id.remove(id) {
                tables.ip_index.remove(&peer.inner_ip);
                tables.key_index.remove(&crypto::fingerprint(&peer.key));
                debug!(peer = peer.id, ip = %peer.inner_ip, "inactivity timeout");
            }
        }
        expired
    }

    /// Consistent, immutable copy of the live table, sorted by id.
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let tables = self.inner.read().unwrap();
        let now = Instant::now();
        let mut peers: Vec<PeerSnapshot> = tables
            .by_id
            .values()
            .map(|p| PeerSnapshot {
                id: p.id,
                inner_ip: p.inner_ip,
                remote_addr: p.remote_addr,
                connected: p.connected,
                idle: now.saturating_duration_since(p.last_seen),
            })
            .collect();
        peers.sort_unstable_by_key(|p| p.id);
        peers
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_free_id(tables: &Tables) -> Option<u8> {
        (1..=255).find(|id| !tables.by_id.contains_key(id))
    }

    fn next_free_ip(tables: &Tables) -> Option<Ipv4Addr> {
        (2..=255)
            .map(|octet| Ipv4Addr::new(10, 0, 0, octet))
            .find(|ip| !tables.ip_index.contains_key(ip))
    }
}
