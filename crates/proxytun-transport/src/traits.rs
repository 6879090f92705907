// ============================================
// File: crates/proxytun-transport/src/traits.rs
// ============================================
//! # Transport Traits
//!
//! ## Creation Reason
//! The engine reads and writes raw IP datagrams without knowing which
//! device is behind them.
//!
//! ## Main Functionality
//! - `TunDevice`: TUN device read/write/lifecycle interface
//! - `TunConfig`: parameters for creating a device
//!
//! ## ⚠️ Important Note for Next Developer
//! - `read` and `write` take `&self`; one task reads while many relays
//!   write concurrently
//! - `read` must be cancel-safe: the engine drops it inside `select!`
//!
//! ## Last Modified
//! v0.1.0 - Initial trait definitions

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;

use crate::error::{Result, TransportError};
use crate::route::{prefix_mask, Route};

// ============================================
// TunDevice Trait
// ============================================

/// Abstract interface for TUN device operations.
///
/// Data read from and written to the device is raw IP packets (no
/// Ethernet or packet-info header).
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Reads one IP packet into `buf`.
    ///
    /// # Errors
    /// Returns error if the read fails; see
    /// [`TransportError::is_retryable`].
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Writes one IP packet.
    ///
    /// # Errors
    /// Returns error if the write fails
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Returns the device name.
    fn name(&self) -> &str;

    /// Returns the MTU.
    fn mtu(&self) -> u16;

    /// Returns the tunnel address assigned to the device.
    fn ip_addr(&self) -> Ipv4Addr;

    /// Returns the network mask.
    fn netmask(&self) -> Ipv4Addr;

    /// Assigns the address, MTU and routes and activates the device.
    ///
    /// # Errors
    /// Returns error if activation fails
    async fn up(&self) -> Result<()>;

    /// Removes routes and deactivates the device.
    ///
    /// # Errors
    /// Returns error if deactivation fails
    async fn down(&self) -> Result<()>;

    /// Returns `true` if the device is up.
    fn is_up(&self) -> bool;
}

// ============================================
// TunConfig
// ============================================

/// Configuration for TUN device creation.
///
/// # Example
/// ```
/// use proxytun_transport::traits::TunConfig;
/// use std::net::Ipv4Addr;
///
/// let config = TunConfig::new("proxytun0")
///     .with_address(Ipv4Addr::new(10, 0, 0, 2), 32)
///     .with_mtu(1500);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Device name (e.g., "proxytun0").
    pub name: String,
    /// Tunnel address assigned to the device.
    pub address: Ipv4Addr,
    /// Prefix length of the tunnel address.
    pub prefix_len: u8,
    /// MTU size.
    pub mtu: u16,
    /// Routes steered into the device.
    pub routes: Vec<Route>,
    /// DNS servers for the host to use while the tunnel is up.
    pub dns: Vec<IpAddr>,
}

impl TunConfig {
    /// Creates a configuration with the default tunnel address
    /// (`10.0.0.2/32`), MTU 1500, a default route and DNS `8.8.8.8`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: Ipv4Addr::new(10, 0, 0, 2),
            prefix_len: 32,
            mtu: 1500,
            routes: vec![Route::DEFAULT],
            dns: vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))],
        }
    }

    /// Sets the tunnel address.
    #[must_use]
    pub fn with_address(mut self, address: Ipv4Addr, prefix_len: u8) -> Self {
        self.address = address;
        self.prefix_len = prefix_len;
        self
    }

    /// Sets the MTU.
    #[must_use]
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Replaces the routes.
    #[must_use]
    pub fn with_routes(mut self, routes: Vec<Route>) -> Self {
        self.routes = routes;
        self
    }

    /// Replaces the DNS servers.
    #[must_use]
    pub fn with_dns(mut self, dns: Vec<IpAddr>) -> Self {
        self.dns = dns;
        self
    }

    /// Network mask derived from the prefix length.
    #[must_use]
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_mask(self.prefix_len.min(32)))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns error if configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TransportError::invalid_config(
                "name",
                "device name cannot be empty",
            ));
        }

        if self.name.len() > 15 {
            return Err(TransportError::invalid_config(
                "name",
                "device name cannot exceed 15 characters",
            ));
        }

        if self.prefix_len > 32 {
            return Err(TransportError::invalid_config(
                "prefix_len",
                "prefix length cannot exceed 32",
            ));
        }

        if self.mtu < 576 {
            return Err(TransportError::invalid_config(
                "mtu",
                "MTU must be at least 576 bytes",
            ));
        }

        if self.mtu > 9000 {
            return Err(TransportError::invalid_config(
                "mtu",
                "MTU cannot exceed 9000 bytes",
            ));
        }

        Ok(())
    }
}

impl Default for TunConfig {
    fn default() -> Self {
        Self::new("proxytun0")
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tun_config_defaults() {
        let config = TunConfig::default();

        assert_eq!(config.name, "proxytun0");
        assert_eq!(config.address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.prefix_len, 32);
        assert_eq!(config.netmask(), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.routes, vec![Route::DEFAULT]);
        assert_eq!(config.dns, vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))]);
    }

    #[test]
    fn test_tun_config_builder() {
        let config = TunConfig::new("test0")
            .with_address(Ipv4Addr::new(172, 19, 0, 1), 30)
            .with_mtu(1400)
            .with_routes(vec!["10.0.0.0/8".parse().unwrap()])
            .with_dns(vec![]);

        assert_eq!(config.netmask(), Ipv4Addr::new(255, 255, 255, 252));
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.routes.len(), 1);
        assert!(config.dns.is_empty());
    }

    #[test]
    fn test_tun_config_validation() {
        assert!(TunConfig::new("tun0").validate().is_ok());
        assert!(TunConfig::new("").validate().is_err());
        assert!(TunConfig::new("a".repeat(20)).validate().is_err());
        assert!(TunConfig::new("tun0").with_mtu(100).validate().is_err());
        assert!(TunConfig::new("tun0").with_mtu(10_000).validate().is_err());
        assert!(TunConfig::new("tun0")
            .with_address(Ipv4Addr::new(10, 0, 0, 2), 40)
            .validate()
            .is_err());
    }
}
