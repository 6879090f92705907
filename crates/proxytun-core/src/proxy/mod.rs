// ============================================
// File: crates/proxytun-core/src/proxy/mod.rs
// ============================================
//! # Proxy Wire Protocols
//!
//! Byte-level halves of the two upstream handshakes. The engine's
//! connector owns the sockets and drives these in order.
//!
//! - [`http`]: `CONNECT` request and response head
//! - [`socks5`]: RFC 1928 / RFC 1929 messages and the UDP relay header

pub mod http;
pub mod socks5;
