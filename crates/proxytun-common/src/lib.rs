// ============================================
// File: crates/proxytun-common/src/lib.rs
// ============================================
//! # proxytun Common - Shared Types
//!
//! ## Creation Reason
//! Holds the small set of types every proxytun crate agrees on: flow
//! identity, transport protocol, proxy kind and an atomic timestamp used
//! for idle tracking.
//!
//! ## Main Functionality
//! - [`types`]: `FlowKey`, `TransportProtocol`, `ProxyKind`
//! - [`time`]: `AtomicInstant` for lock-free activity tracking
//! - [`error`]: `CommonError` and result alias
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              proxytun-engine                        │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                    │
//! │         ▼                     ▼                    │
//! │   proxytun-core        proxytun-transport          │
//! │         │                                          │
//! │         ▼                                          │
//! │   proxytun-common  ◄── You are here               │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Last Modified
//! v0.1.0 - Initial implementation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod time;
pub mod types;

pub use error::{CommonError, Result};
pub use types::{FlowKey, ProxyKind, TransportProtocol};
