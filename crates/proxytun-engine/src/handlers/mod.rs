// ============================================
// File: crates/proxytun-engine/src/handlers/mod.rs
// ============================================
//! # Packet Handlers
//!
//! ## Creation Reason
//! Keeps the per-packet decision (parse, look up, hand off) apart from
//! the long-lived relay tasks it feeds.
//!
//! ## Main Functionality
//!
//! ### Submodules
//! - [`dispatch`]: TUN packet → flow table → relay channel
//!
//! ## Data Flow
//! ```text
//! TUN → Relay:
//!   1. Read IP packet from TUN (engine read loop)
//!   2. PacketCodec::parse; unsupported traffic is dropped
//!   3. FlowTable::lookup_or_create (SYN / UDP may create)
//!   4. New flow → spawn relay task
//!   5. try_send into the flow's channel; full → drop
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Runs on the read loop: never await here
//! - Per-packet drops are logged at debug/trace to avoid log flooding
//!
//! ## Last Modified
//! v0.1.0 - Initial dispatcher

pub mod dispatch;

pub use dispatch::{DispatchOutcome, DropReason, PacketDispatcher};
