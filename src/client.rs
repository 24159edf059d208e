//! FVP client session
//!
//! The protocol-defining counterpart to the server: authenticates over UDP,
//! brings up its end of the tunnel, and pumps datagrams symmetrically. TUN
//! reads are sealed and sent as Data packets; received Data packets are
//! opened and written to the TUN. A Ping every 30 seconds keeps the session
//! inside the server's inactivity deadline.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::{self, Key, KEY_LEN};
use crate::error::{Error, Result};
use crate::protocol::{Packet, PacketType};
use crate::tun::TunPort;

/// Interface name the client creates.
pub const CLIENT_TUN_NAME: &str = "fvpc0";
/// Where a connected client records its session for `fvpc status`.
pub const STATE_FILE: &str = "/var/run/fvp/client.json";
/// Keepalive cadence; half of the smallest sensible server timeout.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

const AUTH_DEADLINE: Duration = Duration::from_secs(10);
const MAX_DATAGRAM: usize = 2048;

/// What authentication yields: identity, key, and the assigned inner IP.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub peer_id: u8,
    pub key: Key,
    pub inner_ip: Ipv4Addr,
}

/// Send an Auth packet (sequence 1) and wait for the server's grant.
/// `claimed_id == 0` requests assignment; a provisioned client claims its
/// registry id. The response payload is `key ‖ ASCII inner IP`.
pub fn authenticate(socket: &UdpSocket, claimed_id: u8) -> Result<Handshake> {
    authenticate_with_deadline(socket, claimed_id, AUTH_DEADLINE)
}

fn authenticate_with_deadline(
    socket: &UdpSocket,
    claimed_id: u8,
    deadline: Duration,
) -> Result<Handshake> {
    socket.send(&Packet::auth(claimed_id, 1, Vec::new()).encode())?;
    socket.set_read_timeout(Some(deadline))?;

    let mut buf = [0u8; MAX_DATAGRAM];
    let len = socket.recv(&mut buf).map_err(|e| {
        if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
            Error::AuthFailed("no response from server".into())
        } else {
            Error::Io(e)
        }
    })?;

    let packet = Packet::decode(&buf[..len])?;
    if packet.kind()? != PacketType::Auth {
        return Err(Error::AuthFailed(format!("unexpected packet type {}", packet.packet_type)));
    }
    if packet.payload.len() <= KEY_LEN {
        return Err(Error::AuthFailed("truncated grant payload".into()));
    }

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&packet.payload[..KEY_LEN]);
    let inner_ip: Ipv4Addr = std::str::from_utf8(&packet.payload[KEY_LEN..])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::AuthFailed("unparsable inner address".into()))?;

    info!(peer = packet.peer_id, ip = %inner_ip, "authenticated");
    Ok(Handshake { peer_id: packet.peer_id, key, inner_ip })
}

/// Both directions encrypt under the same key with a sequence-derived
/// nonce, so the session runs one shared sequence space: every send is
/// allocated above both the last sent and the last received value, and
/// received values must strictly exceed the receive high-water mark.
struct SessionSequence {
    inner: Mutex<SequenceState>,
}

struct SequenceState {
    tx_last: u32,
    rx_high: u32,
}

impl SessionSequence {
    fn new(tx_last: u32) -> Self {
        Self { inner: Mutex::new(SequenceState { tx_last, rx_high: 0 }) }
    }

    fn next(&self, peer_id: u8) -> Result<u32> {
        let mut state = self.inner.lock().unwrap();
        let floor = state.tx_last.max(state.rx_high);
        if floor == u32::MAX {
            return Err(Error::SequenceExhausted(peer_id));
        }
        state.tx_last = floor + 1;
        Ok(state.tx_last)
    }

    fn is_fresh(&self, sequence: u32) -> bool {
        sequence > self.inner.lock().unwrap().rx_high
    }

    fn commit(&self, sequence: u32) {
        let mut state = self.inner.lock().unwrap();
        if sequence > state.rx_high {
            state.rx_high = sequence;
        }
    }
}

pub struct ClientSession {
    peer_id: u8,
    inner_ip: Ipv4Addr,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl ClientSession {
    /// Start the tunnel pumps over an authenticated socket. The socket must
    /// already be connected to the server.
    pub fn start(socket: UdpSocket, tun: Arc<dyn TunPort>, handshake: Handshake) -> Result<Self> {
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        let socket = Arc::new(socket);
        let running = Arc::new(AtomicBool::new(true));
        // Sequence 1 was spent on the Auth request.
        let sequence = Arc::new(SessionSequence::new(1));

        let mut threads = Vec::new();

        // Uplink: TUN → seal → Data packet.
        {
            let socket = socket.clone();
            let tun = tun.clone();
            let running = running.clone();
            let sequence = sequence.clone();
            let handshake = handshake.clone();
            threads.push(std::thread::spawn(move || {
                uplink(socket, tun, sequence, handshake, running);
            }));
        }

        // Downlink: Data packet → open → TUN; Pong → liveness.
        {
            let socket = socket.clone();
            let tun = tun.clone();
            let running = running.clone();
            let sequence = sequence.clone();
            let handshake = handshake.clone();
            threads.push(std::thread::spawn(move || {
                downlink(socket, tun, sequence, handshake, running);
            }));
        }

        // Keepalive.
        {
            let socket = socket.clone();
            let running = running.clone();
            let sequence = sequence.clone();
            let peer_id = handshake.peer_id;
            threads.push(std::thread::spawn(move || {
                keepalive(socket, sequence, peer_id, running);
            }));
        }

        Ok(Self {
            peer_id: handshake.peer_id,
            inner_ip: handshake.inner_ip,
            running,
            threads,
        })
    }

    pub fn peer_id(&self) -> u8 {
        self.peer_id
    }

    pub fn inner_ip(&self) -> Ipv4Addr {
        self.inner_ip
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("disconnected");
    }
}

fn uplink(
    socket: Arc<UdpSocket>,
    tun: Arc<dyn TunPort>,
    sequence: Arc<SessionSequence>,
    handshake: Handshake,
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
        let seq = match sequence.next(handshake.peer_id) {
            Ok(seq) => seq,
            Err(e) => {
                // The nonce space is spent; the session cannot continue.
                warn!("{}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };
        let ciphertext = match crypto::seal(&datagram, &handshake.key, seq) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                debug!("seal failed: {}", e);
                continue;
            }
        };
        let packet = Packet::data(handshake.peer_id, seq, ciphertext);
        if let Err(e) = socket.send(&packet.encode()) {
            warn!("udp send error: {}", e);
        }
    }
}

fn downlink(
    socket: Arc<UdpSocket>,
    tun: Arc<dyn TunPort>,
    sequence: Arc<SessionSequence>,
    handshake: Handshake,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while running.load(Ordering::Relaxed) {
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                warn!("udp receive error: {}", e);
                continue;
            }
        };
        let packet = match Packet::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping malformed datagram: {}", e);
                continue;
            }
        };
        let Ok(kind) = packet.kind() else { continue };
        match kind {
            PacketType::Data => {
                if !sequence.is_fresh(packet.sequence) {
                    debug!(seq = packet.sequence, "stale data packet");
                    continue;
                }
                let plaintext = match crypto::open(&packet.payload, &handshake.key, packet.sequence)
                {
                    Ok(plaintext) => plaintext,
                    Err(_) => {
                        debug!(seq = packet.sequence, "undecryptable payload");
                        continue;
                    }
                };
                sequence.commit(packet.sequence);
                if let Err(e) = tun.write_packet(&plaintext) {
                    warn!("tun write error: {}", e);
                }
            }
            PacketType::Pong => {
                sequence.commit(packet.sequence);
                debug!(seq = packet.sequence, "pong");
            }
            PacketType::Auth | PacketType::Ping => {}
        }
    }
}

fn keepalive(
    socket: Arc<UdpSocket>,
    sequence: Arc<SessionSequence>,
    peer_id: u8,
    running: Arc<AtomicBool>,
) {
    let mut since_ping = Duration::ZERO;
    let step = Duration::from_millis(200);
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(step);
        since_ping += step;
        if since_ping < PING_INTERVAL {
            continue;
        }
        since_ping = Duration::ZERO;
        match sequence.next(peer_id) {
            Ok(seq) => {
                if let Err(e) = socket.send(&Packet::ping(peer_id, seq).encode()) {
                    warn!("ping send error: {}", e);
                }
            }
            Err(e) => {
                warn!("{}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// Session record for `fvpc status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientState {
    pub server: String,
    pub peer_id: u8,
    pub inner_ip: String,
    pub interface: String,
}

impl ClientState {
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize client state: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<ClientState> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse client state: {}", e)))
    }

    pub fn clear(path: &Path) {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, CONFIG_FILE};
    use crate::registry::KeyRegistry;
    use crate::server::Server;
    use crate::tun::{test_datagram, MockTun};
    use tempfile::tempdir;

    struct Tunnel {
        _dir: tempfile::TempDir,
        server: Option<Server>,
        session: Option<ClientSession>,
        server_tun: Arc<MockTun>,
        client_tun: Arc<MockTun>,
    }

    impl Tunnel {
        /// A full server + client pair over loopback with mock TUNs on
        /// both ends.
        fn establish() -> Tunnel {
            let dir = tempdir().unwrap();
            let path = dir.path().join(CONFIG_FILE);
            ServerConfig::create(&path, "1194", 30).unwrap();
            let registry = Arc::new(KeyRegistry::load(&path).unwrap());

            let server_tun = Arc::new(MockTun::new("fvp0"));
            let server =
                Server::start_with(registry, server_tun.clone(), "127.0.0.1:0", None).unwrap();

            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.connect(server.local_addr().unwrap()).unwrap();
            let handshake = authenticate(&socket, 0).unwrap();
            assert_eq!(handshake.peer_id, 1);
            assert_eq!(handshake.inner_ip, Ipv4Addr::new(10, 0, 0, 2));

            let client_tun = Arc::new(MockTun::new(CLIENT_TUN_NAME));
            let session = ClientSession::start(socket, client_tun.clone(), handshake).unwrap();

            Tunnel {
                _dir: dir,
                server: Some(server),
                session: Some(session),
                server_tun,
                client_tun,
            }
        }
    }

    impl Drop for Tunnel {
        fn drop(&mut self) {
            if let Some(session) = self.session.take() {
                session.shutdown();
            }
            if let Some(server) = self.server.take() {
                server.stop();
            }
        }
    }

    #[test]
    fn datagrams_flow_client_to_server() {
        let tunnel = Tunnel::establish();
        let datagram =
            test_datagram(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(8, 8, 8, 8));

        tunnel.client_tun.queue_read(&datagram);
        assert!(tunnel.server_tun.wait_for_written(1, Duration::from_secs(2)));
        assert_eq!(tunnel.server_tun.written(), vec![datagram]);
    }

    #[test]
    fn datagrams_flow_server_to_client() {
        let tunnel = Tunnel::establish();
        let reply =
            test_datagram(Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(10, 0, 0, 2));

        tunnel.server_tun.queue_read(&reply);
        assert!(tunnel.client_tun.wait_for_written(1, Duration::from_secs(2)));
        assert_eq!(tunnel.client_tun.written(), vec![reply]);
    }

    #[test]
    fn both_directions_alternate() {
        let tunnel = Tunnel::establish();
        let out = test_datagram(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(1, 1, 1, 1));
        let back = test_datagram(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(10, 0, 0, 2));

        for round in 1..=3 {
            tunnel.client_tun.queue_read(&out);
            assert!(tunnel.server_tun.wait_for_written(round, Duration::from_secs(2)));
            tunnel.server_tun.queue_read(&back);
            assert!(tunnel.client_tun.wait_for_written(round, Duration::from_secs(2)));
        }
    }

    #[test]
    fn authenticate_times_out_without_server() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        // A bound but silent endpoint.
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.connect(silent.local_addr().unwrap()).unwrap();

        let result = authenticate_with_deadline(&socket, 0, Duration::from_millis(100));
        assert!(matches!(result, Err(Error::AuthFailed(_))));
    }

    #[test]
    fn session_sequence_is_shared_and_monotonic() {
        let seq = SessionSequence::new(1);
        // The Auth consumed sequence 1 without encrypting anything, so a
        // server packet sealed at sequence 1 is still acceptable.
        assert!(seq.is_fresh(1));
        assert_eq!(seq.next(1).unwrap(), 2);
        assert!(seq.is_fresh(3));
        seq.commit(10);
        assert!(!seq.is_fresh(10));
        // Sends allocate above the receive high-water mark.
        assert_eq!(seq.next(1).unwrap(), 11);

        let seq = SessionSequence::new(u32::MAX);
        assert!(matches!(seq.next(1), Err(Error::SequenceExhausted(1))));
    }

    #[test]
    fn client_state_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("client.json");
        let state = ClientState {
            server: "192.0.2.1:1194".into(),
            peer_id: 1,
            inner_ip: "10.0.0.2".into(),
            interface: CLIENT_TUN_NAME.into(),
        };
        state.write(&path).unwrap();
        let read = ClientState::read(&path).unwrap();
        assert_eq!(read.peer_id, 1);
        assert_eq!(read.inner_ip, "10.0.0.2");

        ClientState::clear(&path);
        assert!(ClientState::read(&path).is_err());
    }
}
