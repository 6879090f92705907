// ============================================
// File: crates/proxytun-transport/src/tun/linux.rs
// ============================================
//! # Linux TUN Device Implementation
//!
//! ## Main Functionality
//! - TUN device creation via `TUNSETIFF`
//! - Address, MTU and route configuration through `ip(8)`
//! - Async read/write via Tokio `AsyncFd`
//!
//! ## Linux TUN Interface
//! 1. Open `/dev/net/tun`
//! 2. `TUNSETIFF` with `IFF_TUN | IFF_NO_PI`
//! 3. Set non-blocking and register with the reactor
//! 4. On `up`: `ip addr add`, `ip link set mtu`, `ip link set up`,
//!    `ip route replace` per route
//! 5. On `down`: `ip route del` per route, `ip link set down`
//!
//! ## Required Capabilities
//! - `CAP_NET_ADMIN` or root
//!
//! ## ⚠️ Important Note for Next Developer
//! - Always set `IFF_NO_PI`; otherwise every packet carries a 4-byte
//!   prefix the codec does not expect
//! - DNS servers in the config are not applied here; the host owns
//!   resolver configuration
//!
//! ## Last Modified
//! v0.1.0 - Initial Linux TUN implementation

#![cfg(target_os = "linux")]

use std::fs::{File, OpenOptions};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use nix::libc;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{TunConfig, TunDevice};

// ============================================
// Constants
// ============================================

const TUN_DEVICE_PATH: &str = "/dev/net/tun";

/// TUN device (no Ethernet headers).
const IFF_TUN: libc::c_short = 0x0001;

/// Do not prepend packet information.
const IFF_NO_PI: libc::c_short = 0x1000;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

// ============================================
// ifreq Structure
// ============================================

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

impl IfReq {
    #[allow(clippy::cast_possible_wrap)]
    fn new(name: &str) -> Self {
        let mut ifr = Self {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: 0,
            _padding: [0; 22],
        };
        for (slot, &byte) in ifr
            .ifr_name
            .iter_mut()
            .zip(name.as_bytes().iter().take(libc::IFNAMSIZ - 1))
        {
            *slot = byte as libc::c_char;
        }
        ifr
    }

    const fn with_flags(mut self, flags: libc::c_short) -> Self {
        self.ifr_flags = flags;
        self
    }

    #[allow(clippy::cast_sign_loss)]
    fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .ifr_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

// ============================================
// LinuxTun
// ============================================

/// Linux TUN device.
///
/// # Example
/// ```ignore
/// use proxytun_transport::{LinuxTun, TunConfig, TunDevice};
///
/// let tun = LinuxTun::create(TunConfig::new("proxytun0")).await?;
/// tun.up().await?;
/// let mut buf = [0u8; 1500];
/// let len = tun.read(&mut buf).await?;
/// ```
pub struct LinuxTun {
    async_fd: AsyncFd<File>,
    config: TunConfig,
    is_up: AtomicBool,
}

impl LinuxTun {
    /// Creates the device. It stays down until [`TunDevice::up`].
    ///
    /// # Errors
    /// - `PermissionDenied` without `CAP_NET_ADMIN`
    /// - `TunCreateFailed` if the ioctl or reactor registration fails
    pub async fn create(config: TunConfig) -> Result<Self> {
        config.validate()?;

        info!(device = %config.name, "Creating TUN device");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE_PATH)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    TransportError::PermissionDenied {
                        operation: format!("open {TUN_DEVICE_PATH}"),
                    }
                } else {
                    TransportError::tun_create_failed(&config.name, e.to_string())
                }
            })?;

        let fd = file.as_raw_fd();
        let mut ifr = IfReq::new(&config.name).with_flags(IFF_TUN | IFF_NO_PI);

        // SAFETY: `fd` is open for the lifetime of `file`; `ifr` is a valid
        // `struct ifreq` prefix large enough for TUNSETIFF.
        let result = unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr) };
        if result < 0 {
            return Err(TransportError::tun_create_failed(
                &config.name,
                format!("TUNSETIFF failed: {}", io::Error::last_os_error()),
            ));
        }

        // SAFETY: plain fcntl on an owned descriptor.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(TransportError::tun_create_failed(
                &config.name,
                "Failed to get file flags",
            ));
        }
        // SAFETY: as above.
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(TransportError::tun_create_failed(
                &config.name,
                "Failed to set non-blocking mode",
            ));
        }

        let async_fd = AsyncFd::new(file).map_err(|e| {
            TransportError::tun_create_failed(&config.name, format!("AsyncFd creation failed: {e}"))
        })?;

        let mut config = config;
        config.name = ifr.name();
        debug!(device = %config.name, "TUN device created");

        Ok(Self {
            async_fd,
            config,
            is_up: AtomicBool::new(false),
        })
    }

    /// Runs `ip <args>`; stderr containing `tolerate` is not an error.
    async fn ip(&self, args: &[&str], tolerate: Option<&str>) -> Result<()> {
        debug!(device = %self.config.name, cmd = %args.join(" "), "ip");

        let output = Command::new("ip").args(args).output().await.map_err(|e| {
            TransportError::tun_config_failed(&self.config.name, format!("failed to run ip: {e}"))
        })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if tolerate.is_some_and(|t| stderr.contains(t)) {
            return Ok(());
        }
        Err(TransportError::tun_config_failed(
            &self.config.name,
            format!("ip {} failed: {}", args.join(" "), stderr.trim()),
        ))
    }

    fn installed_routes(&self) -> Vec<String> {
        self.config
            .routes
            .iter()
            .flat_map(crate::route::Route::install_set)
            .map(|r| r.to_string())
            .collect()
    }
}

#[async_trait]
impl TunDevice for LinuxTun {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self
                .async_fd
                .ready(Interest::READABLE)
                .await
                .map_err(|e| TransportError::io("TUN readiness", e))?;

            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                // SAFETY: `buf` is valid for `buf.len()` bytes of writes.
                let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
                usize::try_from(n).map_err(|_| io::Error::last_os_error())
            }) {
                Ok(Ok(len)) => return Ok(len),
                Ok(Err(e)) => return Err(TransportError::io("TUN read", e)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        loop {
            let mut guard = self
                .async_fd
                .ready(Interest::WRITABLE)
                .await
                .map_err(|e| TransportError::io("TUN readiness", e))?;

            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                // SAFETY: `buf` is valid for `buf.len()` bytes of reads.
                let n = unsafe { libc::write(fd, buf.as_ptr().cast::<libc::c_void>(), buf.len()) };
                usize::try_from(n).map_err(|_| io::Error::last_os_error())
            }) {
                Ok(Ok(len)) => return Ok(len),
                Ok(Err(e)) => return Err(TransportError::io("TUN write", e)),
                Err(_would_block) => continue,
            }
        }
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
        let name = self.config.name.as_str();
        let addr = format!("{}/{}", self.config.address, self.config.prefix_len);
        let mtu = self.config.mtu.to_string();

        self.ip(&["addr", "add", &addr, "dev", name], Some("File exists")).await?;
        self.ip(&["link", "set", "dev", name, "mtu", &mtu], None).await?;
        self.ip(&["link", "set", "dev", name, "up"], None).await?;
        for route in self.installed_routes() {
            self.ip(&["route", "replace", &route, "dev", name], None).await?;
        }

        self.is_up.store(true, Ordering::Release);
        info!(
            device = %name,
            address = %addr,
            routes = ?self.installed_routes(),
            dns = ?self.config.dns,
            "TUN device is up"
        );
        Ok(())
    }

    async fn down(&self) -> Result<()> {
        let name = self.config.name.as_str();

        for route in self.installed_routes() {
            if let Err(e) = self.ip(&["route", "del", &route, "dev", name], None).await {
                debug!(device = %name, route = %route, error = %e, "Route removal failed");
            }
        }
        if let Err(e) = self.ip(&["link", "set", "dev", name, "down"], None).await {
            warn!(device = %name, error = %e, "ip link set down failed");
        }

        self.is_up.store(false, Ordering::Release);
        info!(device = %name, "TUN device is down");
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.is_up.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LinuxTun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxTun")
            .field("name", &self.config.name)
            .field("address", &self.config.address)
            .field("prefix_len", &self.config.prefix_len)
            .field("mtu", &self.config.mtu)
            .field("is_up", &self.is_up())
            .finish()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    // Device creation needs CAP_NET_ADMIN and is not exercised here.

    #[test]
    fn test_ifreq_creation() {
        let ifr = IfReq::new("proxytun0").with_flags(IFF_TUN | IFF_NO_PI);

        assert_eq!(ifr.name(), "proxytun0");
        assert_eq!(ifr.ifr_flags, IFF_TUN | IFF_NO_PI);
    }

    #[test]
    fn test_ifreq_name_truncation() {
        let ifr = IfReq::new(&"a".repeat(20));
        assert_eq!(ifr.name().len(), libc::IFNAMSIZ - 1);
    }
}
