// ============================================
// File: crates/proxytun-engine/src/services/flow_table.rs
// ============================================
//! # Flow Table Service
//!
//! ## Creation Reason
//! Tracks every live network flow captured from the TUN device, keyed by
//! its 5-tuple, and decides which packets may open a new one.
//!
//! ## Main Functionality
//! - `Flow`: per-flow record shared between dispatcher, relay and sweeper
//! - `FlowState`: relay state machine states
//! - `TcpSequence`: sequence bookkeeping for the synthesized TCP endpoint
//! - `FlowTable`: concurrent map with capacity limit and idle eviction
//!
//! ## Flow Lifecycle
//! ```text
//! ┌──────┐  connect  ┌────────────┐   ok    ┌─────────────┐
//! │ New  │ ────────► │ Connecting │ ──────► │ Established │
//! └──────┘           └─────┬──────┘         └──────┬──────┘
//!                          │ error          FIN in │ EOF out
//!                          ▼                       ▼
//!                     ┌────────┐      HalfClosedLocal / HalfClosedRemote
//!                     │ Failed │                   │ both
//!                     └────────┘                   ▼
//!                                             ┌────────┐
//!                                             │ Closed │
//!                                             └────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Flows are created only by the dispatcher
//! - A relay removes its flow with `remove_flow`, which checks pointer
//!   identity so a stale relay never evicts a newer flow on the same key
//! - Never hold a `DashMap` guard while calling `len()`: it locks every shard
//! - Terminal flows are removed, never retained
//!
//! ## Last Modified
//! v0.1.0 - Initial flow table

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use proxytun_common::time::AtomicInstant;
use proxytun_common::{FlowKey, TransportProtocol};
use proxytun_core::Packet;

use crate::error::FlowTableError;

/// Capacity of each flow's inbound packet channel.
pub const FLOW_CHANNEL_CAPACITY: usize = 256;

// ============================================
// IdleTimeouts
// ============================================

/// Per-protocol idle limits used by the sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimeouts {
    /// TCP idle limit.
    pub tcp: Duration,
    /// UDP idle limit.
    pub udp: Duration,
}

impl IdleTimeouts {
    /// Returns the limit for `protocol`.
    #[must_use]
    pub const fn for_protocol(&self, protocol: TransportProtocol) -> Duration {
        match protocol {
            TransportProtocol::Tcp => self.tcp,
            TransportProtocol::Udp => self.udp,
        }
    }
}

impl Default for IdleTimeouts {
    fn default() -> Self {
        Self {
            tcp: Duration::from_secs(120),
            udp: Duration::from_secs(30),
        }
    }
}

// ============================================
// FlowState
// ============================================

/// Flow state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Created from a trigger packet, relay not yet running.
    New,
    /// Proxy connection in progress.
    Connecting,
    /// Relaying in both directions.
    Established,
    /// Originator sent FIN; proxy may still send.
    HalfClosedLocal,
    /// Proxy reached EOF; originator may still send.
    HalfClosedRemote,
    /// Finished normally.
    Closed,
    /// Finished with an error.
    Failed,
}

impl FlowState {
    /// Returns `true` for `Closed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Established => write!(f, "Established"),
            Self::HalfClosedLocal => write!(f, "HalfClosedLocal"),
            Self::HalfClosedRemote => write!(f, "HalfClosedRemote"),
            Self::Closed => write!(f, "Closed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// ============================================
// TcpSequence
// ============================================

/// Sequence-space bookkeeping for the TCP endpoint we impersonate.
///
/// `our_*` fields are in our sequence space, `peer_next` in the
/// originator's. All arithmetic wraps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpSequence {
    /// Next sequence number we will send.
    pub our_next: u32,
    /// Next sequence number expected from the originator.
    pub peer_next: u32,
    /// Highest of our sequence numbers the originator acknowledged.
    pub peer_acked: u32,
    /// Originator's advertised receive window.
    pub peer_window: u16,
    /// Originator sent FIN (local half closed).
    pub fin_received: bool,
    /// We sent FIN (remote half closed).
    pub fin_sent: bool,
}

impl TcpSequence {
    /// Bytes sent but not yet acknowledged.
    #[must_use]
    pub const fn in_flight(&self) -> u32 {
        self.our_next.wrapping_sub(self.peer_acked)
    }

    /// Bytes we may still send before filling the peer's window.
    #[must_use]
    pub const fn send_window(&self) -> u32 {
        (self.peer_window as u32).saturating_sub(self.in_flight())
    }

    /// Records an acknowledgment if it covers new data we actually sent.
    pub fn on_ack(&mut self, ack: u32, window: u16) {
        if seq_gt(ack, self.peer_acked) && !seq_gt(ack, self.our_next) {
            self.peer_acked = ack;
        }
        self.peer_window = window;
    }
}

/// `a < b` in wrapping sequence space.
#[must_use]
pub const fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a > b` in wrapping sequence space.
#[must_use]
pub const fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

// ============================================
// FlowStats
// ============================================

/// Flow statistics.
#[derive(Debug, Default)]
pub struct FlowStats {
    /// Payload bytes forwarded to the proxy.
    pub bytes_out: AtomicU64,
    /// Payload bytes delivered back to the originator.
    pub bytes_in: AtomicU64,
    /// Packets received from the originator.
    pub packets_out: AtomicU64,
    /// Packets written to the TUN device.
    pub packets_in: AtomicU64,
}

impl FlowStats {
    /// Records a packet from the originator.
    pub fn record_out(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a packet written back to the originator.
    pub fn record_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> FlowStatsSnapshot {
        FlowStatsSnapshot {
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`FlowStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStatsSnapshot {
    /// Payload bytes sent toward the proxy.
    pub bytes_out: u64,
    /// Payload bytes written back to the originator.
    pub bytes_in: u64,
    /// Packets read from the originator.
    pub packets_out: u64,
    /// Packets written to the originator.
    pub packets_in: u64,
}

// ============================================
// Flow
// ============================================

/// A tracked network flow.
pub struct Flow {
    key: FlowKey,
    state: RwLock<FlowState>,
    created_at: Instant,
    last_activity: AtomicInstant,
    sender: mpsc::Sender<Packet>,
    receiver: Mutex<Option<mpsc::Receiver<Packet>>>,
    cancel: CancellationToken,
    tcp: Mutex<TcpSequence>,
    /// Traffic counters.
    pub stats: FlowStats,
}

impl Flow {
    fn new(key: FlowKey, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        let (sender, receiver) = mpsc::channel(FLOW_CHANNEL_CAPACITY);
        Self {
            key,
            state: RwLock::new(FlowState::New),
            created_at: now,
            last_activity: AtomicInstant::from_instant(now),
            sender,
            receiver: Mutex::new(Some(receiver)),
            cancel,
            tcp: Mutex::new(TcpSequence::default()),
            stats: FlowStats::default(),
        }
    }

    /// Flow identity as seen from the originator.
    #[must_use]
    pub const fn key(&self) -> FlowKey {
        self.key
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> FlowState {
        *self.state.read()
    }

    /// Moves to `state`, returning the previous one.
    pub fn set_state(&self, state: FlowState) -> FlowState {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(flow = %self.key, from = %previous, to = %state, "Flow state changed");
        }
        previous
    }

    /// When the flow was created.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Records activity now.
    pub fn touch(&self) {
        self.last_activity.touch();
    }

    /// Idle time measured at `now`.
    #[must_use]
    pub fn idle_at(&self, now: Instant) -> Duration {
        self.last_activity.idle_at(now)
    }

    /// Queues a packet for the relay without waiting.
    ///
    /// # Errors
    /// Returns the packet back when the channel is full or the relay is gone.
    pub fn try_send(&self, packet: Packet) -> Result<(), TrySendError<Packet>> {
        self.sender.try_send(packet)
    }

    /// Hands the inbound channel to the relay. Returns `None` after the
    /// first call.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Packet>> {
        self.receiver.lock().take()
    }

    /// Token cancelled on eviction, drain or engine stop.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Locks the TCP bookkeeping. Never hold across an await.
    pub fn tcp(&self) -> MutexGuard<'_, TcpSequence> {
        self.tcp.lock()
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("age", &self.created_at.elapsed())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

// ============================================
// FlowTable
// ============================================

/// Result of [`FlowTable::lookup_or_create`].
#[derive(Debug, Clone)]
pub enum FlowLookup {
    /// The flow already existed.
    Existing(Arc<Flow>),
    /// The packet opened a new flow; its relay must be started.
    Created(Arc<Flow>),
}

impl FlowLookup {
    /// Returns the flow regardless of variant.
    #[must_use]
    pub fn flow(&self) -> &Arc<Flow> {
        match self {
            Self::Existing(flow) | Self::Created(flow) => flow,
        }
    }
}

/// Concurrent table of live flows.
pub struct FlowTable {
    flows: DashMap<FlowKey, Arc<Flow>>,
    max_flows: usize,
    root: CancellationToken,
}

impl FlowTable {
    /// Creates a table whose flow tokens are children of `root`.
    #[must_use]
    pub fn new(max_flows: usize, root: CancellationToken) -> Self {
        Self {
            flows: DashMap::new(),
            max_flows,
            root,
        }
    }

    /// Finds the flow for `key`, creating it when the packet may open one.
    ///
    /// # Errors
    /// - `NoFlow` when no flow exists and the packet is not a trigger
    /// - `Exhausted` when the table is full
    pub fn lookup_or_create(
        &self,
        key: FlowKey,
        is_new_flow_trigger: bool,
    ) -> Result<FlowLookup, FlowTableError> {
        if let Some(flow) = self.get(&key) {
            return Ok(FlowLookup::Existing(flow));
        }

        if !is_new_flow_trigger {
            return Err(FlowTableError::NoFlow { key });
        }

        if self.flows.len() >= self.max_flows {
            return Err(FlowTableError::Exhausted {
                limit: self.max_flows,
            });
        }

        match self.flows.entry(key) {
            Entry::Occupied(entry) => Ok(FlowLookup::Existing(Arc::clone(entry.get()))),
            Entry::Vacant(entry) => {
                let flow = Arc::new(Flow::new(key, self.root.child_token()));
                entry.insert(Arc::clone(&flow));
                debug!(flow = %key, "Flow created");
                Ok(FlowLookup::Created(flow))
            }
        }
    }

    /// Looks up a flow without creating it.
    #[must_use]
    pub fn get(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        self.flows.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Removes whatever flow is stored under `key`.
    pub fn remove(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        self.flows.remove(key).map(|(_, flow)| flow)
    }

    /// Removes `flow` only if it is still the entry for its key.
    pub fn remove_flow(&self, flow: &Arc<Flow>) -> bool {
        self.flows
            .remove_if(&flow.key(), |_, current| Arc::ptr_eq(current, flow))
            .is_some()
    }

    /// Evicts flows idle longer than their protocol's limit at `now`.
    ///
    /// Evicted flows are marked `Closed` and cancelled.
    pub fn sweep_idle(&self, now: Instant, timeouts: &IdleTimeouts) -> Vec<Arc<Flow>> {
        let is_idle = |flow: &Flow| flow.idle_at(now) > timeouts.for_protocol(flow.key().protocol);

        let candidates: Vec<Arc<Flow>> = self
            .flows
            .iter()
            .filter(|entry| is_idle(entry.value().as_ref()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut evicted = Vec::with_capacity(candidates.len());
        for flow in candidates {
            let removed = self
                .flows
                .remove_if(&flow.key(), |_, current| Arc::ptr_eq(current, &flow) && is_idle(current.as_ref()));
            if removed.is_some() {
                flow.set_state(FlowState::Closed);
                flow.cancel_token().cancel();
                debug!(flow = %flow.key(), idle = ?flow.idle_at(now), "Flow evicted");
                evicted.push(flow);
            }
        }

        if !evicted.is_empty() {
            info!("Evicted {} idle flows", evicted.len());
        }

        evicted
    }

    /// Closes and removes every flow.
    pub fn drain(&self) -> Vec<Arc<Flow>> {
        let keys: Vec<FlowKey> = self.flows.iter().map(|entry| *entry.key()).collect();
        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(flow) = self.remove(&key) {
                flow.set_state(FlowState::Closed);
                flow.cancel_token().cancel();
                drained.push(flow);
            }
        }
        drained
    }

    /// Number of live flows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Returns `true` when no flow is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

}

impl std::fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTable")
            .field("len", &self.len())
            .field("max_flows", &self.max_flows)
            .finish()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn tcp_key(port: u16) -> FlowKey {
        let src: SocketAddr = format!("10.0.0.2:{port}").parse().unwrap();
        let dst: SocketAddr = "93.184.216.34:443".parse().unwrap();
        FlowKey::new(TransportProtocol::Tcp, src, dst)
    }

    fn udp_key(port: u16) -> FlowKey {
        let src: SocketAddr = format!("10.0.0.2:{port}").parse().unwrap();
        let dst: SocketAddr = "8.8.8.8:53".parse().unwrap();
        FlowKey::new(TransportProtocol::Udp, src, dst)
    }

    #[test]
    fn test_create_then_existing_same_arc() {
        let table = FlowTable::new(8, CancellationToken::new());

        let created = table.lookup_or_create(tcp_key(40000), true).unwrap();
        assert!(matches!(created, FlowLookup::Created(_)));
        assert_eq!(created.flow().state(), FlowState::New);

        let again = table.lookup_or_create(tcp_key(40000), false).unwrap();
        assert!(matches!(again, FlowLookup::Existing(_)));
        assert!(Arc::ptr_eq(created.flow(), again.flow()));

        let retrigger = table.lookup_or_create(tcp_key(40000), true).unwrap();
        assert!(matches!(retrigger, FlowLookup::Existing(_)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_non_trigger_without_flow() {
        let table = FlowTable::new(8, CancellationToken::new());
        let err = table.lookup_or_create(tcp_key(1), false).unwrap_err();
        assert_eq!(err, FlowTableError::NoFlow { key: tcp_key(1) });
        assert!(table.is_empty());
    }

    #[test]
    fn test_capacity_exhausted() {
        let table = FlowTable::new(1, CancellationToken::new());
        table.lookup_or_create(tcp_key(1), true).unwrap();

        let err = table.lookup_or_create(tcp_key(2), true).unwrap_err();
        assert_eq!(err, FlowTableError::Exhausted { limit: 1 });
        assert_eq!(table.len(), 1);
        assert!(table.get(&tcp_key(2)).is_none());
    }

    #[test]
    fn test_remove_flow_checks_identity() {
        let table = FlowTable::new(8, CancellationToken::new());
        let old = table.lookup_or_create(udp_key(5000), true).unwrap().flow().clone();
        table.remove(&udp_key(5000));
        let new = table.lookup_or_create(udp_key(5000), true).unwrap().flow().clone();

        assert!(!table.remove_flow(&old));
        assert_eq!(table.len(), 1);
        assert!(table.remove_flow(&new));
        assert!(table.is_empty());
    }

    #[test]
    fn test_receiver_taken_once() {
        let table = FlowTable::new(8, CancellationToken::new());
        let flow = table.lookup_or_create(udp_key(5001), true).unwrap().flow().clone();
        assert!(flow.take_receiver().is_some());
        assert!(flow.take_receiver().is_none());
    }

    #[test]
    fn test_sweep_idle_per_protocol() {
        let root = CancellationToken::new();
        let table = FlowTable::new(8, root.clone());
        let tcp = table.lookup_or_create(tcp_key(1), true).unwrap().flow().clone();
        let udp = table.lookup_or_create(udp_key(2), true).unwrap().flow().clone();

        let timeouts = IdleTimeouts::default();
        let later = Instant::now() + Duration::from_secs(60);
        let evicted = table.sweep_idle(later, &timeouts);

        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &udp));
        assert_eq!(udp.state(), FlowState::Closed);
        assert!(udp.cancel_token().is_cancelled());
        assert!(!tcp.cancel_token().is_cancelled());
        assert!(!root.is_cancelled());
        assert_eq!(table.len(), 1);

        let much_later = Instant::now() + Duration::from_secs(600);
        assert_eq!(table.sweep_idle(much_later, &timeouts).len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_drain_empties_table() {
        let table = FlowTable::new(8, CancellationToken::new());
        for port in 1..=4 {
            table.lookup_or_create(tcp_key(port), true).unwrap();
        }
        let drained = table.drain();
        assert_eq!(drained.len(), 4);
        assert!(drained.iter().all(|f| f.state() == FlowState::Closed));
        assert!(drained.iter().all(|f| f.cancel_token().is_cancelled()));
        assert!(table.is_empty());
        assert!(table.drain().is_empty());
    }

    #[test]
    fn test_root_cancel_reaches_flows() {
        let root = CancellationToken::new();
        let table = FlowTable::new(8, root.clone());
        let flow = table.lookup_or_create(tcp_key(9), true).unwrap().flow().clone();
        root.cancel();
        assert!(flow.cancel_token().is_cancelled());
    }

    #[test]
    fn test_sequence_window() {
        let mut seq = TcpSequence {
            our_next: 1000,
            peer_acked: 1000,
            peer_window: 500,
            ..TcpSequence::default()
        };
        assert_eq!(seq.send_window(), 500);

        seq.our_next = 1400;
        assert_eq!(seq.in_flight(), 400);
        assert_eq!(seq.send_window(), 100);

        seq.on_ack(1300, 500);
        assert_eq!(seq.peer_acked, 1300);
        assert_eq!(seq.send_window(), 400);

        // acknowledging beyond what we sent is ignored
        seq.on_ack(5000, 500);
        assert_eq!(seq.peer_acked, 1300);
    }

    #[test]
    fn test_sequence_wraps() {
        assert!(seq_lt(u32::MAX - 5, 10));
        assert!(seq_gt(10, u32::MAX - 5));
        let seq = TcpSequence {
            our_next: 20,
            peer_acked: u32::MAX - 9,
            peer_window: 100,
            ..TcpSequence::default()
        };
        assert_eq!(seq.in_flight(), 30);
    }
}
