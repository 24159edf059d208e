//! FVP server
//!
//! Wires the UDP socket, the TUN port, the key registry, and the peer table
//! together, and runs the datapath: an ingress pump, an egress pump, the
//! liveness reaper, and a status-snapshot writer. Each I/O endpoint is
//! owned by exactly one thread; the threads coordinate only through the
//! shared peer table and a single running flag.

mod egress;
mod ingress;
mod reaper;

use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::peers::PeerTable;
use crate::registry::KeyRegistry;
use crate::tun::TunPort;

pub use reaper::REAPER_INTERVAL;

/// Interface name the server daemon creates.
pub const TUN_NAME: &str = "fvp0";
/// Where the running daemon publishes its status snapshot.
pub const STATUS_FILE: &str = "/var/run/fvp/status.json";
/// Largest datagram the ingress pump accepts: an MTU-sized inner packet
/// plus the wire header and the AEAD tag, with headroom.
const MAX_DATAGRAM: usize = 2048;

/// Read-only server status for the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub port: String,
    pub interface: String,
    pub total_peers: usize,
    pub connected_peers: usize,
}

/// One row of the live peer listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRow {
    pub id: u8,
    pub ip: String,
    pub connected: bool,
    pub last_seen_secs: u64,
}

/// The document the daemon writes for `fvps status` / `fvps list-clients`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub server: ServerStatus,
    pub peers: Vec<PeerRow>,
}

pub struct Server {
    registry: Arc<KeyRegistry>,
    peers: Arc<PeerTable>,
    socket: Arc<UdpSocket>,
    tun: Arc<dyn TunPort>,
    running: Arc<AtomicBool>,
    started_at: Instant,
    status_path: Option<PathBuf>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind the configured port and start the datapath threads.
    pub fn start(registry: Arc<KeyRegistry>, tun: Arc<dyn TunPort>) -> Result<Server> {
        let bind = format!("0.0.0.0:{}", registry.port());
        Self::start_with(registry, tun, &bind, Some(PathBuf::from(STATUS_FILE)))
    }

    /// Start on an explicit bind address, optionally publishing status
    /// snapshots. Tests bind an ephemeral port and skip the snapshot file.
    pub fn start_with(
        registry: Arc<KeyRegistry>,
        tun: Arc<dyn TunPort>,
        bind: &str,
        status_path: Option<PathBuf>,
    ) -> Result<Server> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        let socket = Arc::new(socket);
        info!(addr = %socket.local_addr()?, "listening for tunnel traffic");

        let peers = Arc::new(PeerTable::new(registry.timeout()));
        let running = Arc::new(AtomicBool::new(true));

        let mut server = Server {
            registry,
            peers,
            socket,
            tun,
            running,
            started_at: Instant::now(),
            status_path,
            threads: Vec::new(),
        };
        server.spawn_threads();
        Ok(server)
    }

    fn spawn_threads(&mut self) {
        {
            let socket = self.socket.clone();
            let tun = self.tun.clone();
            let peers = self.peers.clone();
            let registry = self.registry.clone();
            let running = self.running.clone();
            self.threads.push(std::thread::spawn(move || {
                ingress::run(socket, tun, peers, registry, running);
            }));
        }
        {
            let socket = self.socket.clone();
            let tun = self.tun.clone();
            let peers = self.peers.clone();
            let running = self.running.clone();
            self.threads.push(std::thread::spawn(move || {
                egress::run(tun, peers, socket, running);
            }));
        }
        {
            let peers = self.peers.clone();
            let running = self.running.clone();
            self.threads.push(std::thread::spawn(move || {
                reaper::run(peers, running, REAPER_INTERVAL);
            }));
        }
        if self.status_path.is_some() {
            let running = self.running.clone();
            let path = self.status_path.clone().unwrap();
            let snapshot = self.snapshot_fn();
            self.threads.push(std::thread::spawn(move || {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                while running.load(Ordering::Relaxed) {
                    let doc = snapshot();
                    match serde_json::to_string_pretty(&doc) {
                        Ok(json) => {
                            if let Err(e) = std::fs::write(&path, json) {
                                debug!("status snapshot write failed: {}", e);
                            }
                        }
                        Err(e) => debug!("status snapshot serialization failed: {}", e),
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
            }));
        }
    }

    fn snapshot_fn(&self) -> impl Fn() -> StatusSnapshot + Send + 'static {
        let registry = self.registry.clone();
        let peers = self.peers.clone();
        let running = self.running.clone();
        let tun_name = self.tun.name().to_string();
        let started_at = self.started_at;
        move || {
            let snapshot = peers.snapshot();
            StatusSnapshot {
                server: ServerStatus {
                    running: running.load(Ordering::Relaxed),
                    uptime_secs: started_at.elapsed().as_secs(),
                    port: registry.port(),
                    interface: tun_name.clone(),
                    total_peers: snapshot.len(),
                    connected_peers: snapshot.iter().filter(|p| p.connected).count(),
                },
                peers: snapshot
                    .iter()
                    .map(|p| PeerRow {
                        id: p.id,
                        ip: p.inner_ip.to_string(),
                        connected: p.connected,
                        last_seen_secs: p.idle.as_secs(),
                    })
                    .collect(),
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ServerStatus {
        self.snapshot_fn()().server
    }

    pub fn list_peers(&self) -> Vec<PeerRow> {
        self.snapshot_fn()().peers
    }

    /// Signal shutdown, wait for every thread to drain and exit, and remove
    /// the published snapshot.
    pub fn stop(mut self) {
        info!("stopping server");
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(path) = &self.status_path {
            let _ = std::fs::remove_file(path);
        }
        info!("server stopped");
    }

    #[cfg(test)]
    pub(crate) fn peer_table(&self) -> &Arc<PeerTable> {
        &self.peers
    }
}
