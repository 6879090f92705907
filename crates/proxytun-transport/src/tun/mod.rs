// ============================================
// File: crates/proxytun-transport/src/tun/mod.rs
// ============================================
//! # TUN Device Module
//!
//! ## Platform Implementations
//! - `linux`: `/dev/net/tun` with `IFF_TUN | IFF_NO_PI`
//! - `mock`: in-memory device for tests (feature `mock`)
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     User Space                            │
//! │  ┌────────────────┐          ┌────────────────────────┐   │
//! │  │  Application   │          │    proxytun engine     │──►│ proxy
//! │  └───────┬────────┘          └───────────▲────────────┘   │
//! │          │ connect()                     │ read/write     │
//! ├──────────┼───────────────────────────────┼────────────────┤
//! │          ▼           Kernel Space        │                │
//! │  ┌────────────────────────────────────────────────────┐   │
//! │  │   routing: 0.0.0.0/1 + 128.0.0.0/1 → proxytun0     │   │
//! │  └────────────────────────────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - TUN packets are raw IP (no Ethernet header)
//! - Device names are limited to 15 characters on Linux

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

#[cfg(any(test, feature = "mock"))]
pub use mock::MockTun;
