// ============================================
// File: crates/proxytun-transport/src/lib.rs
// ============================================
//! # proxytun Transport - TUN Device Layer
//!
//! ## Creation Reason
//! Isolates the platform-specific virtual interface behind a trait so the
//! engine can be driven by a real device in production and an in-memory
//! one in tests.
//!
//! ## Main Functionality
//!
//! ### Modules
//! - [`traits`]: `TunDevice` trait and `TunConfig`
//! - [`route`]: IPv4 routes installed on the device
//! - [`tun`]: Linux implementation and the `mock` test device
//! - [`error`]: Transport-specific error types
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              proxytun-engine                        │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                     │
//! │         ▼                     ▼                     │
//! │   proxytun-core        proxytun-transport           │
//! │                        You are here ◄──             │
//! │         │                     │                     │
//! │         └──────────┬──────────┘                     │
//! │                    ▼                                │
//! │             proxytun-common                         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Platform Support
//! | Platform | TUN |
//! |----------|-----|
//! | Linux | ✅ |
//! | Others | mock only |
//!
//! ## ⚠️ Important Note for Next Developer
//! - TUN operations require root or `CAP_NET_ADMIN`
//! - Mock implementation available with the `mock` feature
//!
//! ## Last Modified
//! v0.1.0 - Initial transport layer implementation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod route;
pub mod traits;
pub mod tun;

pub use error::{Result, TransportError};
pub use route::Route;
pub use traits::{TunConfig, TunDevice};

#[cfg(target_os = "linux")]
pub use tun::linux::LinuxTun;
