// ============================================
// File: crates/proxytun-transport/src/route.rs
// ============================================
//! # Tunnel Routes
//!
//! IPv4 prefixes steered into the TUN device.
//!
//! ## ⚠️ Important Note for Next Developer
//! - A default route (`0.0.0.0/0`) is installed as `0.0.0.0/1` plus
//!   `128.0.0.0/1`. Both are more specific than the host's existing
//!   default, so that default stays in place and remains reachable via
//!   policy routing (`SO_MARK`) for proxy sockets.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use proxytun_common::CommonError;

/// An IPv4 route (`network/prefix_len`).
///
/// Host bits beyond the prefix are cleared on construction.
///
/// # Example
/// ```
/// use proxytun_transport::route::Route;
///
/// let route: Route = "10.1.2.3/8".parse().unwrap();
/// assert_eq!(route.to_string(), "10.0.0.0/8");
/// assert_eq!(Route::DEFAULT.install_set().len(), 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Route {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Route {
    /// The IPv4 default route, `0.0.0.0/0`.
    pub const DEFAULT: Self = Self {
        network: Ipv4Addr::UNSPECIFIED,
        prefix_len: 0,
    };

    /// Creates a route, clearing host bits.
    ///
    /// # Errors
    /// `prefix_len` above 32.
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Result<Self, CommonError> {
        if prefix_len > 32 {
            return Err(CommonError::out_of_range(prefix_len, 0, 32));
        }
        Ok(Self {
            network: Ipv4Addr::from(u32::from(network) & prefix_mask(prefix_len)),
            prefix_len,
        })
    }

    /// Network address.
    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    #[must_use]
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns `true` for `0.0.0.0/0`.
    #[must_use]
    pub const fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Routes to actually install for this route.
    #[must_use]
    pub fn install_set(&self) -> Vec<Self> {
        if self.is_default() {
            vec![
                Self {
                    network: Ipv4Addr::UNSPECIFIED,
                    prefix_len: 1,
                },
                Self {
                    network: Ipv4Addr::new(128, 0, 0, 0),
                    prefix_len: 1,
                },
            ]
        } else {
            vec![*self]
        }
    }

    /// Returns `true` if `addr` falls inside this route.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & prefix_mask(self.prefix_len) == u32::from(self.network)
    }
}

/// Netmask with the top `prefix_len` bits set.
#[must_use]
pub const fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Route {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s.trim(), None),
        };
        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| CommonError::invalid_input("route", format!("'{s}' is not an IPv4 prefix")))?;
        let prefix_len = match prefix {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| CommonError::invalid_input("route", format!("bad prefix length in '{s}'")))?,
            None => 32,
        };
        Self::new(network, prefix_len)
    }
}

impl TryFrom<String> for Route {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Route> for String {
    fn from(route: Route) -> Self {
        route.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_normalize() {
        let route: Route = "192.168.77.9/24".parse().unwrap();
        assert_eq!(route.network(), Ipv4Addr::new(192, 168, 77, 0));
        assert_eq!(route.prefix_len(), 24);

        let host: Route = "1.1.1.1".parse().unwrap();
        assert_eq!(host.prefix_len(), 32);

        assert!("1.1.1.1/33".parse::<Route>().is_err());
        assert!("fe80::/10".parse::<Route>().is_err());
        assert!("1.1.1.1/x".parse::<Route>().is_err());
    }

    #[test]
    fn test_default_split() {
        let route: Route = "0.0.0.0/0".parse().unwrap();
        assert!(route.is_default());
        let set = route.install_set();
        assert_eq!(set[0].to_string(), "0.0.0.0/1");
        assert_eq!(set[1].to_string(), "128.0.0.0/1");
        assert!(set.iter().any(|r| r.contains(Ipv4Addr::new(8, 8, 8, 8))));
        assert!(set.iter().any(|r| r.contains(Ipv4Addr::new(200, 1, 1, 1))));
    }

    #[test]
    fn test_prefix_mask() {
        assert_eq!(prefix_mask(0), 0);
        assert_eq!(prefix_mask(24), 0xffff_ff00);
        assert_eq!(prefix_mask(32), u32::MAX);
    }
}
