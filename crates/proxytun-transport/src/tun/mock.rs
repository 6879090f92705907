// ============================================
// File: crates/proxytun-transport/src/tun/mock.rs
// ============================================
//! # Mock TUN Device Implementation
//!
//! ## Creation Reason
//! Drives the engine end-to-end in tests without privileges: tests inject
//! the packets "applications" send and inspect what the engine writes
//! back.
//!
//! ## Main Functionality
//! - In-memory read and write queues
//! - `wait_for_written` to await engine output without sleeps
//! - Read failure injection for fatal-error paths
//!
//! ## Usage in Tests
//! ```
//! use proxytun_transport::tun::MockTun;
//! use proxytun_transport::traits::{TunConfig, TunDevice};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let tun = MockTun::new(TunConfig::new("mock0"));
//! tun.inject_packet(b"test packet".to_vec());
//!
//! let mut buf = [0u8; 1500];
//! let len = tun.read(&mut buf).await.unwrap();
//! assert_eq!(&buf[..len], b"test packet");
//! # }
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Testing only; queues are bounded and overflow panics on inject
//!
//! ## Last Modified
//! v0.1.0 - Initial mock implementation

use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Result, TransportError};
use crate::traits::{TunConfig, TunDevice};

// ============================================
// Constants
// ============================================

/// Maximum number of packets to queue in either direction.
const MAX_QUEUE_SIZE: usize = 4096;

// ============================================
// MockTun
// ============================================

/// Mock TUN device for testing.
pub struct MockTun {
    config: TunConfig,
    read_queue: Mutex<VecDeque<Vec<u8>>>,
    write_queue: Mutex<VecDeque<Vec<u8>>>,
    read_failure: Mutex<Option<io::ErrorKind>>,
    is_up: AtomicBool,
    down_calls: AtomicUsize,
    read_notify: Notify,
    write_notify: Notify,
}

impl MockTun {
    /// Creates a new mock TUN device.
    #[must_use]
    pub fn new(config: TunConfig) -> Self {
        Self {
            config,
            read_queue: Mutex::new(VecDeque::with_capacity(64)),
            write_queue: Mutex::new(VecDeque::with_capacity(64)),
            read_failure: Mutex::new(None),
            is_up: AtomicBool::new(false),
            down_calls: AtomicUsize::new(0),
            read_notify: Notify::new(),
            write_notify: Notify::new(),
        }
    }

    /// Queues a packet for the next `read()`.
    ///
    /// # Panics
    /// Panics if the queue is full.
    pub fn inject_packet(&self, packet: impl Into<Vec<u8>>) {
        let mut queue = self.read_queue.lock();
        assert!(queue.len() < MAX_QUEUE_SIZE, "Mock TUN read queue overflow");
        queue.push_back(packet.into());
        drop(queue);
        self.read_notify.notify_one();
    }

    /// Makes every subsequent `read()` fail with `kind` until
    /// [`MockTun::clear_read_failure`].
    pub fn fail_reads(&self, kind: io::ErrorKind) {
        *self.read_failure.lock() = Some(kind);
        self.read_notify.notify_one();
    }

    /// Stops injecting read failures.
    pub fn clear_read_failure(&self) {
        *self.read_failure.lock() = None;
    }

    /// Takes all packets written so far.
    #[must_use]
    pub fn take_written_packets(&self) -> Vec<Vec<u8>> {
        self.write_queue.lock().drain(..).collect()
    }

    /// Waits until at least `count` packets have been written or `timeout`
    /// elapses, then takes everything written.
    pub async fn wait_for_written(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.written_count() >= count {
                break;
            }
            let notified = self.write_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        self.take_written_packets()
    }

    /// Number of packets waiting to be read.
    #[must_use]
    pub fn pending_read_count(&self) -> usize {
        self.read_queue.lock().len()
    }

    /// Number of packets written and not yet taken.
    #[must_use]
    pub fn written_count(&self) -> usize {
        self.write_queue.lock().len()
    }

    /// Number of times `down()` was called.
    #[must_use]
    pub fn down_calls(&self) -> usize {
        self.down_calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl TunDevice for MockTun {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let failure = *self.read_failure.lock();
            if let Some(kind) = failure {
                // Yield so a retry loop on transient kinds cannot starve the runtime.
                tokio::task::yield_now().await;
                return Err(TransportError::io("mock TUN read", io::Error::from(kind)));
            }

            let next = self.read_queue.lock().pop_front();
            if let Some(packet) = next {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                return Ok(len);
            }

            self.read_notify.notified().await;
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        {
            let mut queue = self.write_queue.lock();
            if queue.len() >= MAX_QUEUE_SIZE {
                return Err(TransportError::io(
                    "mock TUN write",
                    io::Error::new(io::ErrorKind::OutOfMemory, "write queue full"),
                ));
            }
            queue.push_back(buf.to_vec());
        }
        self.write_notify.notify_one();
        Ok(buf.len())
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn mtu(&self) -> u16 {
        self.config.mtu
    }

    fn ip_addr(&self) -> Ipv4Addr {
        self.config.address
    }

    fn netmask(&self) -> Ipv4Addr {
        self.config.netmask()
    }

    async fn up(&self) -> Result<()> {
        self.is_up.store(true, Ordering::Release);
        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.is_up.store(false, Ordering::Release);
        self.down_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.is_up.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MockTun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTun")
            .field("name", &self.config.name)
            .field("mtu", &self.config.mtu)
            .field("is_up", &self.is_up())
            .field("pending_reads", &self.pending_read_count())
            .field("written_packets", &self.written_count())
            .finish()
    }
}

impl Default for MockTun {
    fn default() -> Self {
        Self::new(TunConfig::default())
    }
}

// ============================================
// Tests
// ============================================
