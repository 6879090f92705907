// ============================================
// File: crates/proxytun-engine/src/services/mod.rs
// ============================================
//! # Engine Services
//!
//! ## Creation Reason
//! Holds the stateful services the packet path depends on, separate from
//! the packet handling and relay logic that drives them.
//!
//! ## Main Functionality
//!
//! ### Submodules
//! - [`flow_table`]: flow lifecycle, capacity and idle eviction
//! - [`connector`]: proxy handshakes (HTTP CONNECT, SOCKS5)
//!
//! ## Service Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Service Layer                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌──────────────────────┐      ┌─────────────────────────┐ │
//! │  │      FlowTable        │      │     ProxyConnector      │ │
//! │  │  - lookup_or_create   │      │  - connect (TCP)        │ │
//! │  │  - remove_flow        │      │  - open_datagram (UDP)  │ │
//! │  │  - sweep_idle / drain │      │  - SO_MARK, NODELAY     │ │
//! │  └──────────▲───────────┘      └───────────▲─────────────┘ │
//! │             │ dispatcher, sweeper          │ relays         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Both services are `Send + Sync` and shared through `Arc`
//! - The connector never touches the flow table
//!
//! ## Last Modified
//! v0.1.0 - Initial services structure

pub mod connector;
pub mod flow_table;

pub use connector::{DatagramTunnel, ProxyConnector, ProxyStream};
pub use flow_table::{
    Flow, FlowLookup, FlowState, FlowStats, FlowStatsSnapshot, FlowTable, IdleTimeouts, TcpSequence,
};
