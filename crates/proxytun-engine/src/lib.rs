// ============================================
// File: crates/proxytun-engine/src/lib.rs
// ============================================
//! # proxytun Engine Library
//!
//! ## Creation Reason
//! Turns the IP packets an application writes into a TUN device into
//! streams carried through a single upstream HTTP CONNECT or SOCKS5 proxy,
//! and synthesizes the reply packets the application expects.
//!
//! ## Main Functionality
//!
//! ### Modules
//! - [`config`]: TOML configuration (`[proxy]`, `[tun]`, `[limits]`, `[logging]`)
//! - [`engine`]: Run lifecycle (`TunnelEngine`)
//! - [`handlers`]: Packet dispatch from the read loop
//! - [`relay`]: Per-flow TCP/UDP relays
//! - [`services`]: Flow table and proxy connector
//! - [`error`]: Engine error types
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          proxytun                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌─────────────┐     ┌─────────────┐     ┌─────────────────┐   │
//! │  │   Config    │────►│   Tunnel    │────►│   Dispatcher    │   │
//! │  │             │     │   Engine    │     │                 │   │
//! │  └─────────────┘     └──────┬──────┘     └────────┬────────┘   │
//! │                             │                     │            │
//! │         ┌───────────────────┴──────────┬──────────┘            │
//! │         ▼                              ▼                       │
//! │  ┌─────────────┐               ┌───────────────┐               │
//! │  │  FlowTable  │◄──────────────│  Flow Relays  │               │
//! │  └─────────────┘               └───────┬───────┘               │
//! │                                        ▼                       │
//! │                               ┌────────────────┐               │
//! │                               │ ProxyConnector │──► upstream   │
//! │                               └────────────────┘               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     TUN Device (proxytun-transport)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//! ```text
//! App → TUN → parse → FlowTable → relay → proxy → destination
//! App ← TUN ← build ← relay ← proxy ← destination
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Requires root or `CAP_NET_ADMIN` for the real TUN device
//! - Proxy traffic must not route back into the tunnel; set
//!   `proxy.socket_mark` and a matching policy rule on the host
//! - Configuration changes require restart (no hot-reload)
//!
//! ## Last Modified
//! v0.1.0 - Initial engine library

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod services;

pub use config::{EngineConfig, LimitsConfig, LoggingConfig, Password, ProxyConfig, TunSettings};
pub use engine::TunnelEngine;
pub use error::{ConnectError, EngineError, FlowTableError, Result};
pub use services::{FlowState, FlowTable, ProxyConnector};
