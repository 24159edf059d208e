//! Ingress pump
//!
//! Owns the UDP read half and the TUN write half. Receives datagrams with a
//! one-second read deadline (so shutdown is observed promptly), decodes and
//! validates them, and dispatches by packet type. Every failure on this
//! path is a silent drop toward the peer; only `debug!` traces remain for
//! the operator.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::crypto;
use crate::peers::PeerTable;
use crate::protocol::{Packet, PacketType};
use crate::registry::KeyRegistry;
use crate::tun::TunPort;

pub(crate) fn run(
    socket: Arc<UdpSocket>,
    tun: Arc<dyn TunPort>,
    peers: Arc<PeerTable>,
    registry: Arc<KeyRegistry>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; super::MAX_DATAGRAM];

    while running.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                warn!("udp receive error: {}", e);
                continue;
            }
        };

        let packet = match Packet::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(from = %src, "dropping malformed datagram: {}", e);
                continue;
            }
        };

        // decode() validated the type field.
        let Ok(kind) = packet.kind() else { continue };
        match kind {
            PacketType::Auth => handle_auth(&packet, src, &socket, &peers, &registry),
            PacketType::Data => handle_data(&packet, src, &peers, tun.as_ref()),
            PacketType::Ping => handle_ping(&packet, src, &socket, &peers),
            PacketType::Pong => handle_pong(&packet, src, &peers),
        }
    }
}

/// Auth: establish or re-establish a session and answer with
/// `key ‖ ASCII inner IP` at sequence 0. Refusals are silent.
fn handle_auth(
    packet: &Packet,
    src: SocketAddr,
    socket: &UdpSocket,
    peers: &PeerTable,
    registry: &KeyRegistry,
) {
    if packet.peer_id == 0 && !registry.allow_anonymous() {
        debug!(from = %src, "anonymous authentication disabled");
        return;
    }

    let grant = match peers.authenticate(packet.peer_id, src, registry) {
        Ok(grant) => grant,
        Err(e) => {
            debug!(from = %src, claimed = packet.peer_id, "authentication refused: {}", e);
            return;
        }
    };

    let ip = grant.inner_ip.to_string();
    let mut payload = Vec::with_capacity(crypto::KEY_LEN + ip.len());
    payload.extend_from_slice(&grant.key);
    payload.extend_from_slice(ip.as_bytes());

    let response = Packet::auth(grant.id, 0, payload);
    if let Err(e) = socket.send_to(&response.encode(), src) {
        warn!(peer = grant.id, "failed to send auth response: {}", e);
    }
}

/// Data: admit the sequence, decrypt outside any lock, commit state only
/// once decryption has succeeded, then hand the datagram to the TUN.
fn handle_data(packet: &Packet, src: SocketAddr, peers: &PeerTable, tun: &dyn TunPort) {
    let key = match peers.begin_inbound(packet.peer_id, packet.sequence) {
        Ok(key) => key,
        Err(e) => {
            debug!(peer = packet.peer_id, seq = packet.sequence, "data refused: {}", e);
            return;
        }
    };

    let plaintext = match crypto::open(&packet.payload, &key, packet.sequence) {
        Ok(plaintext) => plaintext,
        Err(_) => {
            debug!(peer = packet.peer_id, seq = packet.sequence, "undecryptable payload");
            return;
        }
    };

    if peers.commit_inbound(packet.peer_id, packet.sequence, src).is_err() {
        return;
    }

    if let Err(e) = tun.write_packet(&plaintext) {
        warn!(peer = packet.peer_id, "tun write error: {}", e);
    }
}

/// Ping: liveness update plus a Pong echoing the peer id and sequence.
fn handle_ping(packet: &Packet, src: SocketAddr, socket: &UdpSocket, peers: &PeerTable) {
    let addr = match peers.touch(packet.peer_id, packet.sequence, src) {
        Ok(addr) => addr,
        Err(e) => {
            debug!(peer = packet.peer_id, "ping refused: {}", e);
            return;
        }
    };

    let pong = Packet::pong(packet.peer_id, packet.sequence);
    if let Err(e) = socket.send_to(&pong.encode(), addr) {
        warn!(peer = packet.peer_id, "failed to send pong: {}", e);
    }
}

/// Pong: liveness update only.
fn handle_pong(packet: &Packet, src: SocketAddr, peers: &PeerTable) {
    if let Err(e) = peers.touch(packet.peer_id, packet.sequence, src) {
        debug!(peer = packet.peer_id, "pong refused: {}", e);
    }
}
