// ============================================
// File: crates/proxytun-core/src/lib.rs
// ============================================
//! # proxytun Core - Packet & Proxy Wire Library
//!
//! ## Creation Reason
//! Holds every byte-level format the tunnel speaks, free of I/O, so it
//! can be tested without a TUN device or a live proxy.
//!
//! ## Main Functionality
//!
//! ### Packet Module ([`packet`])
//! - IPv4/IPv6 header parsing into an immutable [`Packet`] view
//! - TCP/UDP packet synthesis with header and pseudo-header checksums
//!
//! ### Proxy Module ([`proxy`])
//! - HTTP CONNECT request encoding and response-head parsing
//! - SOCKS5 greeting, RFC 1929 authentication, request/reply and UDP header
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              proxytun-engine                        │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                     │
//! │         ▼                     ▼                     │
//! │   proxytun-core        proxytun-transport           │
//! │   You are here                │                     │
//! │         │                     │                     │
//! │         └──────────┬──────────┘                     │
//! │                    ▼                                │
//! │             proxytun-common                         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - No I/O in this crate; callers own sockets and devices
//! - Parsed packets never verify checksums, built packets always carry them
//! - Multi-byte wire fields are network byte order (big-endian)
//!
//! ## Last Modified
//! v0.1.0 - Initial implementation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod packet;
pub mod proxy;

pub use error::{HandshakeError, ParseError, Result};
pub use packet::{IpVersion, Packet, PacketCodec, TcpFlags, TcpHeader, TcpSegment, TransportHeader};
