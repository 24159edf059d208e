//! Shutdown signal handling
//!
//! SIGINT and SIGTERM clear a shared running flag. Every pump polls the
//! flag at its next read deadline, so an orderly shutdown completes within
//! one deadline period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static RUNNING: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_signal(_sig: libc::c_int) {
    if let Some(running) = RUNNING.get() {
        running.store(false, Ordering::SeqCst);
    }
}

/// Register SIGINT/SIGTERM handlers that clear `running`. The first
/// registered flag wins; later calls leave it in place.
pub fn install_shutdown_handler(running: Arc<AtomicBool>) {
    let _ = RUNNING.set(running);
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as *const () as libc::sighandler_t);
    }
}
