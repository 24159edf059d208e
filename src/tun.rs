//! TUN port
//!
//! A minimal abstraction over the virtual network interface: one raw IP
//! datagram in or out per call. The Linux implementation drives the TUN
//! character device; the mock keeps in-memory queues and satisfies the same
//! contract so the datapath and its tests are interchangeable.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{Error, Result};

/// One-datagram read buffer; the inner network runs at the standard MTU.
pub const TUN_MTU: usize = 1500;
/// Read deadline, matching the UDP socket's: shutdown is observed within
/// one deadline period.
pub const READ_DEADLINE: Duration = Duration::from_secs(1);

// TUNSETIFF = _IOW('T', 202, c_int)
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Blocking, datagram-at-a-time access to the inner network.
///
/// `read_packet` blocks until one complete IP datagram is available or the
/// read deadline lapses (a `TimedOut` I/O error, which callers poll on).
pub trait TunPort: Send + Sync {
    fn read_packet(&self) -> Result<Vec<u8>>;
    fn write_packet(&self, datagram: &[u8]) -> Result<()>;
    fn name(&self) -> &str;
}

fn deadline_error() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::TimedOut, "read deadline elapsed"))
}

/// A Linux TUN device in no-packet-info mode
pub struct TunDevice {
    fd: RawFd,
    name: String,
}

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

impl TunDevice {
    /// Open /dev/net/tun and create an interface with the given name.
    pub fn create(name: &str) -> Result<Self> {
        let fd = unsafe { libc::open(b"/dev/net/tun\0".as_ptr() as *const _, libc::O_RDWR) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(15);
        req.ifr_name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let ret = unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut req as *mut _) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }

        let actual_name = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(name)
            .trim_end_matches('\0')
            .to_string();

        Ok(Self { fd, name: actual_name })
    }

    /// Assign an address and bring the interface up via the host's `ip`
    /// utility. Part of device initialization, not of the pumps.
    pub fn configure(&self, address: &str, prefix: u8) -> Result<()> {
        let status = std::process::Command::new("ip")
            .args(["addr", "add", &format!("{}/{}", address, prefix), "dev", &self.name])
            .status()?;
        if !status.success() {
            return Err(Error::Config(format!("failed to set address on {}", self.name)));
        }

        let status = std::process::Command::new("ip")
            .args(["link", "set", "dev", &self.name, "up"])
            .status()?;
        if !status.success() {
            return Err(Error::Config(format!("failed to bring up {}", self.name)));
        }
        Ok(())
    }
}

impl TunPort for TunDevice {
    fn read_packet(&self) -> Result<Vec<u8>> {
        let mut pollfd = libc::pollfd { fd: self.fd, events: libc::POLLIN, revents: 0 };
        let ready = unsafe { libc::poll(&mut pollfd, 1, READ_DEADLINE.as_millis() as libc::c_int) };
        if ready < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if ready == 0 {
            return Err(deadline_error());
        }

        let mut buf = [0u8; TUN_MTU];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(buf[..n as usize].to_vec())
    }

    fn write_packet(&self, datagram: &[u8]) -> Result<()> {
        let n = unsafe { libc::write(self.fd, datagram.as_ptr() as *const _, datagram.len()) };
        if n < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if n as usize != datagram.len() {
            warn!(wrote = n, len = datagram.len(), "short write to {}", self.name);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// In-memory TUN with the same blocking contract as the device
pub struct MockTun {
    name: String,
    state: Mutex<MockState>,
    available: Condvar,
    deadline: Duration,
}

#[derive(Default)]
struct MockState {
    read_queue: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
}

impl MockTun {
    pub fn new(name: &str) -> Self {
        Self::with_deadline(name, READ_DEADLINE)
    }

    pub fn with_deadline(name: &str, deadline: Duration) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState::default()),
            available: Condvar::new(),
            deadline,
        }
    }

    /// Queue a datagram for the next `read_packet` call.
    pub fn queue_read(&self, datagram: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.read_queue.push_back(datagram.to_vec());
        self.available.notify_all();
    }

    /// Everything written so far, oldest first.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().written.clone()
    }

    /// Block until at least `count` datagrams have been written, or the
    /// timeout lapses. Returns whether the count was reached.
    pub fn wait_for_written(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.written.len() < count {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) => d,
                None => return false,
            };
            let (next, _) = self.available.wait_timeout(state, remaining).unwrap();
            state = next;
        }
        true
    }
}

impl TunPort for MockTun {
    fn read_packet(&self) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.deadline;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(datagram) = state.read_queue.pop_front() {
                return Ok(datagram);
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) => d,
                None => return Err(deadline_error()),
            };
            let (next, _) = self.available.wait_timeout(state, remaining).unwrap();
            state = next;
        }
    }

    fn write_packet(&self, datagram: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.written.push(datagram.to_vec());
        self.available.notify_all();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Extract the source IPv4 address from a raw IP datagram.
pub fn source_ip(datagram: &[u8]) -> Option<std::net::Ipv4Addr> {
    if datagram.len() < 20 || (datagram[0] >> 4) != 4 {
        return None;
    }
    Some(std::net::Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]))
}

/// Extract the destination IPv4 address from a raw IP datagram.
pub fn destination_ip(datagram: &[u8]) -> Option<std::net::Ipv4Addr> {
    if datagram.len() < 20 || (datagram[0] >> 4) != 4 {
        return None;
    }
    Some(std::net::Ipv4Addr::new(datagram[16], datagram[17], datagram[18], datagram[19]))
}

/// Minimal IPv4 header with the given source and destination, for tests.
#[cfg(test)]
pub(crate) fn test_datagram(src: std::net::Ipv4Addr, dst: std::net::Ipv4Addr) -> Vec<u8> {
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[3] = 20;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet
}
