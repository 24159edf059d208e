//! Egress pump
//!
//! Owns the TUN read half and the UDP send side. Reads one inner IP
//! datagram at a time, resolves the owning peer by inner address, seals the
//! datagram, and ships it as a Data packet. Datagrams with no live peer are
//! dropped.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::crypto;
use crate::error::Error;
use crate::peers::{PeerTable, SERVER_INNER_IP};
use crate::protocol::Packet;
use crate::tun::{self, TunPort};

pub(crate) fn run(
    tun: Arc<dyn TunPort>,
    peers: Arc<PeerTable>,
    socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        let datagram = match tun.read_packet() {
            Ok(datagram) => datagram,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!("tun read error: {}", e);
                continue;
            }
        };
        forward(&datagram, &peers, &socket);
    }
}

fn forward(datagram: &[u8], peers: &PeerTable, socket: &UdpSocket) {
    let (Some(src), Some(dst)) = (tun::source_ip(datagram), tun::destination_ip(datagram)) else {
        debug!(len = datagram.len(), "dropping non-ipv4 datagram from tun");
        return;
    };

    // Replies addressed to the server's own inner IP are routed back by
    // their source; everything else routes by destination.
    let target = if dst == SERVER_INNER_IP { src } else { dst };
    let Some(peer_id) = peers.resolve_by_inner_ip(target) else {
        debug!(%target, "no peer for inner address");
        return;
    };

    let outbound = match peers.allocate_outbound(peer_id) {
        Ok(outbound) => outbound,
        Err(Error::SequenceExhausted(_)) => {
            // The nonce space is spent; the session must not encrypt again.
            warn!(peer = peer_id, "sequence space exhausted, tearing down session");
            let _ = peers.evict(peer_id);
            return;
        }
        Err(e) => {
            debug!(peer = peer_id, "outbound allocation failed: {}", e);
            return;
        }
    };

    let ciphertext = match crypto::seal(datagram, &outbound.key, outbound.sequence) {
        Ok(ciphertext) => ciphertext,
        Err(e) => {
            debug!(peer = peer_id, "seal failed: {}", e);
            return;
        }
    };

    let packet = Packet::data(peer_id, outbound.sequence, ciphertext);
    if let Err(e) = socket.send_to(&packet.encode(), outbound.remote_addr) {
        warn!(peer = peer_id, to = %outbound.remote_addr, "udp send error: {}", e);
    }
}
