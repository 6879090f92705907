// ============================================
// File: crates/proxytun-engine/src/config.rs
// ============================================
//! # Engine Configuration
//!
//! ## Creation Reason
//! Gathers everything the host application decides before a tunnel run
//! into one immutable value handed to `TunnelEngine::start`.
//!
//! ## Main Functionality
//! - `EngineConfig`: top-level configuration
//! - TOML loading, validation and (credential-free) serialization
//!
//! ## Configuration Sections
//! - `proxy`: upstream proxy address, type, credentials, socket mark
//! - `tun`: device name, tunnel address, MTU, routes, DNS
//! - `limits`: flow capacity, idle timeouts, sweep and shutdown timing
//! - `logging`: log level
//!
//! ## Example Configuration
//! ```toml
//! [proxy]
//! host = "proxy.example.com"
//! port = 8080
//! type = "http"
//! username = "alice"
//! password = "s3cret"
//!
//! [tun]
//! device_name = "proxytun0"
//! address = "10.0.0.2"
//! prefix_len = 32
//! routes = ["0.0.0.0/0"]
//! dns = ["8.8.8.8"]
//!
//! [limits]
//! max_flows = 4096
//! tcp_idle_timeout_secs = 120
//! udp_idle_timeout_secs = 30
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The password never appears in `Debug`, `Display` or `to_toml` output
//! - A running engine never sees config changes; restart to apply
//!
//! ## Last Modified
//! v0.1.0 - Initial configuration implementation

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::info;
use zeroize::Zeroize;

use proxytun_common::ProxyKind;
use proxytun_transport::{Route, TunConfig};

use crate::error::{EngineError, Result};
use crate::services::IdleTimeouts;

/// Placeholder written wherever a password would be rendered.
const REDACTED: &str = "********";

// ============================================
// EngineConfig
// ============================================

/// Main engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upstream proxy.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// TUN device settings.
    #[serde(default)]
    pub tun: TunSettings,

    /// Resource limits and timers.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        info!("Loading configuration from: {}", path_str);

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EngineError::config_load(&path_str, e.to_string()))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| EngineError::config_load(&path_str, e.to_string()))?;

        config.validate()?;

        info!(proxy = %config.proxy, "Configuration loaded successfully");
        Ok(config)
    }

    /// Loads configuration from a string (useful for testing).
    ///
    /// # Errors
    /// Returns error if the content cannot be parsed or validated.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| EngineError::config_load("<string>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.proxy.validate()?;
        self.tun.validate()?;
        self.limits.validate()?;
        Ok(())
    }

    /// Serializes configuration to a TOML string. Passwords are redacted.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

// ============================================
// Password
// ============================================

/// Proxy password, wiped from memory on drop.
///
/// Serializes as a fixed placeholder so configuration dumps never leak it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    /// Wraps a password.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for Password {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for Password {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}

// ============================================
// ProxyConfig
// ============================================

/// Upstream proxy section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host name or address.
    #[serde(default)]
    pub host: String,

    /// Proxy port.
    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// Proxy protocol.
    #[serde(default, rename = "type")]
    pub kind: ProxyKind,

    /// Optional username for Basic / RFC 1929 authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Optional password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Password>,

    /// Bound on TCP connect plus proxy handshake, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// `SO_MARK` applied to proxy sockets (Linux) so policy routing can
    /// keep them off the tunnel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_mark: Option<u32>,
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_connect_timeout() -> u64 {
    10
}

impl ProxyConfig {
    /// Creates a proxy configuration without credentials.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, kind: ProxyKind) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
            ..Self::default()
        }
    }

    /// Sets credentials.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(Password::new(password));
        self
    }

    /// Sets the connect timeout, rounded up to whole seconds.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        let partial = u64::from(timeout.subsec_nanos() > 0);
        self.connect_timeout_secs = timeout.as_secs().saturating_add(partial).max(1);
        self
    }

    /// Returns `(username, password)` when a username is configured.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let user = self.username.as_deref().filter(|u| !u.is_empty())?;
        let pass = self.password.as_ref().map_or("", Password::expose);
        Some((user, pass))
    }

    /// Returns the connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Returns `host:port` for logs and socket resolution.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(EngineError::config_invalid("proxy.host", "cannot be empty"));
        }

        if self.port == 0 {
            return Err(EngineError::config_invalid(
                "proxy.port",
                "must be between 1 and 65535",
            ));
        }

        if self.connect_timeout_secs == 0 {
            return Err(EngineError::config_invalid(
                "proxy.connect_timeout_secs",
                "must be greater than 0",
            ));
        }

        if self.password.is_some() && self.username.as_deref().map_or(true, str::is_empty) {
            return Err(EngineError::config_invalid(
                "proxy.username",
                "required when a password is set",
            ));
        }

        if self.username.as_ref().is_some_and(|u| u.len() > 255) {
            return Err(EngineError::config_invalid(
                "proxy.username",
                "cannot exceed 255 bytes",
            ));
        }

        if self.password.as_ref().is_some_and(|p| p.expose().len() > 255) {
            return Err(EngineError::config_invalid(
                "proxy.password",
                "cannot exceed 255 bytes",
            ));
        }

        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_proxy_port(),
            kind: ProxyKind::default(),
            username: None,
            password: None,
            connect_timeout_secs: default_connect_timeout(),
            socket_mark: None,
        }
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.authority())
    }
}

// ============================================
// TunSettings
// ============================================

/// TUN device section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunSettings {
    /// Interface name.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Tunnel address.
    #[serde(default = "default_address")]
    pub address: Ipv4Addr,

    /// Tunnel prefix length.
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// MTU.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Routes sent into the tunnel.
    #[serde(default = "default_routes")]
    pub routes: Vec<Route>,

    /// DNS servers for the host to apply.
    #[serde(default = "default_dns")]
    pub dns: Vec<IpAddr>,
}

fn default_device_name() -> String {
    "proxytun0".to_string()
}

fn default_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 2)
}

fn default_prefix_len() -> u8 {
    32
}

fn default_mtu() -> u16 {
    1500
}

fn default_routes() -> Vec<Route> {
    vec![Route::DEFAULT]
}

fn default_dns() -> Vec<IpAddr> {
    vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))]
}

impl TunSettings {
    /// Builds the device configuration for this section.
    #[must_use]
    pub fn to_tun_config(&self) -> TunConfig {
        TunConfig::new(&self.device_name)
            .with_address(self.address, self.prefix_len)
            .with_mtu(self.mtu)
            .with_routes(self.routes.clone())
            .with_dns(self.dns.clone())
    }

    fn validate(&self) -> Result<()> {
        self.to_tun_config().validate().map_err(|e| match e {
            proxytun_transport::TransportError::InvalidConfig { field, reason } => {
                let field = if field == "name" { "device_name".to_string() } else { field };
                EngineError::config_invalid(format!("tun.{field}"), reason)
            }
            other => EngineError::config_invalid("tun", other.to_string()),
        })
    }
}

impl Default for TunSettings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            address: default_address(),
            prefix_len: default_prefix_len(),
            mtu: default_mtu(),
            routes: default_routes(),
            dns: default_dns(),
        }
    }
}

// ============================================
// LimitsConfig
// ============================================

/// Resource limits and timers section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent flows.
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,

    /// Idle timeout for TCP flows, in seconds.
    #[serde(default = "default_tcp_idle")]
    pub tcp_idle_timeout_secs: u64,

    /// Idle timeout for UDP flows, in seconds.
    #[serde(default = "default_udp_idle")]
    pub udp_idle_timeout_secs: u64,

    /// Interval between idle sweeps, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Time relays get to finish after stop, in milliseconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_max_flows() -> usize {
    4096
}

fn default_tcp_idle() -> u64 {
    120
}

fn default_udp_idle() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_shutdown_grace() -> u64 {
    2000
}

/// Upper bound for `shutdown_grace_ms`; stop must stay prompt.
pub const MAX_SHUTDOWN_GRACE_MS: u64 = 2000;

impl LimitsConfig {
    /// Returns the per-protocol idle timeouts.
    #[must_use]
    pub const fn idle_timeouts(&self) -> IdleTimeouts {
        IdleTimeouts {
            tcp: Duration::from_secs(self.tcp_idle_timeout_secs),
            udp: Duration::from_secs(self.udp_idle_timeout_secs),
        }
    }

    /// Returns the sweep interval.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Returns the shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("limits.max_flows", self.max_flows as u64),
            ("limits.tcp_idle_timeout_secs", self.tcp_idle_timeout_secs),
            ("limits.udp_idle_timeout_secs", self.udp_idle_timeout_secs),
            ("limits.sweep_interval_secs", self.sweep_interval_secs),
        ];

        for (field, value) in positive {
            if value == 0 {
                return Err(EngineError::config_invalid(field, "must be greater than 0"));
            }
        }

        if self.shutdown_grace_ms > MAX_SHUTDOWN_GRACE_MS {
            return Err(EngineError::config_invalid(
                "limits.shutdown_grace_ms",
                format!("must be at most {MAX_SHUTDOWN_GRACE_MS}"),
            ));
        }

        Ok(())
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_flows: default_max_flows(),
            tcp_idle_timeout_secs: default_tcp_idle(),
            udp_idle_timeout_secs: default_udp_idle(),
            sweep_interval_secs: default_sweep_interval(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

// ============================================
// LoggingConfig
// ============================================

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_needs_proxy_host() {
        let config = EngineConfig::default();
        assert_eq!(config.proxy.port, 8080);
        assert_eq!(config.proxy.kind, ProxyKind::Http);
        assert_eq!(config.tun.address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.tun.routes, vec![Route::DEFAULT]);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("proxy.host"));
    }

    #[test]
    fn test_full_config_format() {
        let toml = r#"
            [proxy]
            host = "proxy.example.com"
            port = 3128
            type = "SOCKS"
            username = "alice"
            password = "s3cret"
            socket_mark = 51820

            [tun]
            device_name = "tun7"
            mtu = 1400
            routes = ["0.0.0.0/0", "10.1.0.0/16"]
            dns = ["1.1.1.1"]

            [limits]
            max_flows = 16
            udp_idle_timeout_secs = 10

            [logging]
            level = "debug"
        "#;

        let config = EngineConfig::from_str(toml).unwrap();
        assert_eq!(config.proxy.kind, ProxyKind::Socks);
        assert_eq!(config.proxy.credentials(), Some(("alice", "s3cret")));
        assert_eq!(config.proxy.socket_mark, Some(51820));
        assert_eq!(config.tun.routes.len(), 2);
        assert_eq!(config.limits.max_flows, 16);
        assert_eq!(config.limits.idle_timeouts().udp, Duration::from_secs(10));
        assert_eq!(config.limits.idle_timeouts().tcp, Duration::from_secs(120));
        assert_eq!(config.logging.level, "debug");

        let tun = config.tun.to_tun_config();
        assert_eq!(tun.name, "tun7");
        assert_eq!(tun.mtu, 1400);
    }

    #[test]
    fn test_validation_errors() {
        let err = EngineConfig::from_str("[proxy]\nhost = \"p\"\nport = 0\n").unwrap_err();
        assert!(err.to_string().contains("proxy.port"));

        let err = EngineConfig::from_str("[proxy]\nhost = \"p\"\n[limits]\nmax_flows = 0\n").unwrap_err();
        assert!(err.to_string().contains("limits.max_flows"));

        let err = EngineConfig::from_str("[proxy]\nhost = \"p\"\n[tun]\nmtu = 100\n").unwrap_err();
        assert!(err.to_string().contains("tun.mtu"));

        let err = EngineConfig::from_str("[proxy]\nhost = \"p\"\npassword = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("proxy.username"));

        let err = EngineConfig::from_str("[proxy]\nhost = \"p\"\nport = 70000\n").unwrap_err();
        assert!(matches!(err, EngineError::ConfigLoad { .. }));
    }

    #[test]
    fn test_credentials_never_rendered() {
        let mut config = EngineConfig::default();
        config.proxy = ProxyConfig::new("10.9.8.7", 1080, ProxyKind::Socks).with_credentials("bob", "hunter2");

        assert_eq!(config.proxy.to_string(), "socks5://10.9.8.7:1080");
        assert!(!format!("{:?}", config.proxy).contains("hunter2"));
        let dump = config.to_toml();
        assert!(dump.contains("bob"));
        assert!(!dump.contains("hunter2"));
    }

    #[test]
    fn test_sub_second_connect_timeout_rounds_up() {
        let proxy = ProxyConfig::new("p", 8080, ProxyKind::Http).with_connect_timeout(Duration::from_millis(300));
        assert_eq!(proxy.connect_timeout(), Duration::from_secs(1));
        assert!(proxy.validate().is_ok());

        let proxy = proxy.with_connect_timeout(Duration::from_millis(2500));
        assert_eq!(proxy.connect_timeout(), Duration::from_secs(3));

        let proxy = proxy.with_connect_timeout(Duration::ZERO);
        assert_eq!(proxy.connect_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_shutdown_grace_bounded() {
        let config = EngineConfig::from_str("[proxy]\nhost = \"p\"\n[limits]\nshutdown_grace_ms = 2000\n").unwrap();
        assert_eq!(config.limits.shutdown_grace(), Duration::from_secs(2));

        let err = EngineConfig::from_str("[proxy]\nhost = \"p\"\n[limits]\nshutdown_grace_ms = 30000\n").unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("limits.shutdown_grace_ms"));
    }

    #[test]
    fn test_ipv6_authority() {
        let proxy = ProxyConfig::new("::1", 8080, ProxyKind::Http);
        assert_eq!(proxy.authority(), "[::1]:8080");
        assert_eq!(proxy.to_string(), "http://[::1]:8080");
    }
}
