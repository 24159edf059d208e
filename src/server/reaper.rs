//! Liveness reaper
//!
//! Periodically sweeps the peer table and evicts peers whose last activity
//! precedes the inactivity deadline. The sweep interval adds to the
//! effective timeout; clients are expected to ping well inside it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::peers::PeerTable;

/// How often the table is swept.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Polling step between shutdown checks while waiting for the next sweep.
const POLL_STEP: Duration = Duration::from_millis(200);

pub(crate) fn run(peers: Arc<PeerTable>, running: Arc<AtomicBool>, interval: Duration) {
    let mut last_sweep = Instant::now();
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(POLL_STEP.min(interval));
        if last_sweep.elapsed() < interval {
            continue;
        }
        last_sweep = Instant::now();
        let evicted = peers.tick(last_sweep);
        if !evicted.is_empty() {
            info!(count = evicted.len(), ids = ?evicted, "reaped inactive peers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, CONFIG_FILE};
    use crate::registry::KeyRegistry;
    use tempfile::tempdir;

    #[test]
    fn reaper_thread_evicts_idle_peers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        ServerConfig::create(&path, "1194", 30).unwrap();
        let registry = KeyRegistry::load(&path).unwrap();

        let peers = Arc::new(PeerTable::new(Duration::from_millis(50)));
        peers
            .authenticate(0, "198.51.100.7:4000".parse().unwrap(), &registry)
            .unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let peers = peers.clone();
            let running = running.clone();
            std::thread::spawn(move || run(peers, running, Duration::from_millis(100)))
        };

        std::thread::sleep(Duration::from_millis(400));
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        assert!(peers.is_empty());
    }
}
