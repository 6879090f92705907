// ============================================
// File: crates/proxytun-engine/src/handlers/dispatch.rs
// ============================================
//! # Packet Dispatcher
//!
//! ## Creation Reason
//! The read loop must never stall on one flow. The dispatcher classifies
//! each TUN packet and queues it for its flow's relay without waiting.
//!
//! ## ⚠️ Important Note for Next Developer
//! - The only place flows are created
//! - Relay tasks are spawned on the run's `TaskTracker` so stop can wait
//!   for them, and raced against the run's abort token so stop can end them
//!
//! ## Last Modified
//! v0.1.0 - Initial dispatcher

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use proxytun_core::PacketCodec;

use crate::error::FlowTableError;
use crate::relay::{self, RelayContext};
use crate::services::{Flow, FlowLookup};

// ============================================
// Outcome
// ============================================

/// Why a packet was not delivered to a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not parseable or not TCP/UDP.
    Unparseable,
    /// TCP packet without a flow and without SYN.
    NoFlow,
    /// Flow table full.
    Exhausted,
    /// Relay channel full.
    ChannelFull,
    /// Relay already finished.
    RelayGone,
}

/// Result of dispatching one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Packet opened a new flow and its relay was started.
    Created,
    /// Packet queued for an existing flow.
    Forwarded,
    /// Packet dropped.
    Dropped(DropReason),
}

/// Dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Packets queued to relays (including flow-opening ones).
    pub forwarded: AtomicU64,
    /// Packets dropped for any reason.
    pub dropped: AtomicU64,
    /// Flows created.
    pub flows_created: AtomicU64,
}

// ============================================
// PacketDispatcher
// ============================================

/// Routes TUN packets to flow relays.
pub struct PacketDispatcher {
    ctx: Arc<RelayContext>,
    tracker: TaskTracker,
    abort: CancellationToken,
    stats: DispatchStats,
}

impl PacketDispatcher {
    /// Creates a dispatcher spawning relays on `tracker`.
    #[must_use]
    pub fn new(ctx: Arc<RelayContext>, tracker: TaskTracker, abort: CancellationToken) -> Self {
        Self {
            ctx,
            tracker,
            abort,
            stats: DispatchStats::default(),
        }
    }

    /// Context shared with spawned relays.
    #[must_use]
    pub const fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    /// Dispatch counters.
    #[must_use]
    pub const fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Dispatches one raw packet read from the TUN device.
    pub fn dispatch(&self, bytes: Bytes) -> DispatchOutcome {
        let outcome = self.classify(bytes);
        match outcome {
            DispatchOutcome::Dropped(_) => self.stats.dropped.fetch_add(1, Ordering::Relaxed),
            DispatchOutcome::Created | DispatchOutcome::Forwarded => {
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed)
            }
        };
        outcome
    }

    fn classify(&self, bytes: Bytes) -> DispatchOutcome {
        let packet = match PacketCodec::parse(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(error = %e, "Dropping unparseable packet");
                return DispatchOutcome::Dropped(DropReason::Unparseable);
            }
        };

        let key = packet.key();
        let lookup = match self.ctx.flows.lookup_or_create(key, packet.is_new_flow_trigger()) {
            Ok(lookup) => lookup,
            Err(FlowTableError::NoFlow { .. }) => {
                trace!(flow = %key, "No flow for packet");
                return DispatchOutcome::Dropped(DropReason::NoFlow);
            }
            Err(e @ FlowTableError::Exhausted { .. }) => {
                warn!(flow = %key, error = %e, "Dropping new flow");
                return DispatchOutcome::Dropped(DropReason::Exhausted);
            }
        };

        let created = matches!(lookup, FlowLookup::Created(_));
        let flow = match lookup {
            FlowLookup::Created(flow) | FlowLookup::Existing(flow) => flow,
        };
        flow.touch();

        match flow.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(flow = %key, "Relay channel full, packet dropped");
                return DispatchOutcome::Dropped(DropReason::ChannelFull);
            }
            Err(TrySendError::Closed(_)) => {
                trace!(flow = %key, "Relay gone, packet dropped");
                return DispatchOutcome::Dropped(DropReason::RelayGone);
            }
        }

        if created {
            self.stats.flows_created.fetch_add(1, Ordering::Relaxed);
            self.spawn_relay(flow);
            DispatchOutcome::Created
        } else {
            DispatchOutcome::Forwarded
        }
    }

    fn spawn_relay(&self, flow: Arc<Flow>) {
        let ctx = Arc::clone(&self.ctx);
        let abort = self.abort.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = abort.cancelled() => {
                    debug!(flow = %flow.key(), "Relay aborted");
                    ctx.flows.remove_flow(&flow);
                }
                () = relay::run(Arc::clone(&ctx), Arc::clone(&flow)) => {}
            }
        });
    }
}

impl std::fmt::Debug for PacketDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDispatcher")
            .field("ctx", &self.ctx)
            .field("relays", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use proxytun_common::{FlowKey, ProxyKind, TransportProtocol};
    use proxytun_core::TcpFlags;
    use proxytun_transport::tun::MockTun;
    use proxytun_transport::TunConfig;

    use crate::config::ProxyConfig;
    use crate::services::{FlowTable, ProxyConnector};

    fn dispatcher(max_flows: usize) -> (PacketDispatcher, TaskTracker, CancellationToken) {
        let root = CancellationToken::new();
        let device = Arc::new(MockTun::new(TunConfig::new("mock0")));
        // Port 9 on loopback: connects fail fast and relays finish on their own.
        let connector = ProxyConnector::new(ProxyConfig::new("127.0.0.1", 9, ProxyKind::Http));
        let flows = Arc::new(FlowTable::new(max_flows, root.clone()));
        let ctx = Arc::new(RelayContext::new(device, connector, flows, root.clone()));
        let tracker = TaskTracker::new();
        (PacketDispatcher::new(ctx, tracker.clone(), CancellationToken::new()), tracker, root)
    }

    fn tcp(src_port: u16, flags: TcpFlags) -> Bytes {
        let key = FlowKey::new(
            TransportProtocol::Tcp,
            SocketAddr::from(([10, 0, 0, 2], src_port)),
            SocketAddr::from(([93, 184, 216, 34], 443)),
        );
        PacketCodec::build_tcp(&key, 1000, 0, flags, &[])
    }

    #[tokio::test]
    async fn test_garbage_dropped() {
        let (dispatcher, _, _) = dispatcher(4);
        let outcome = dispatcher.dispatch(Bytes::from_static(&[0x45, 0x00, 0x00]));
        assert_eq!(outcome, DispatchOutcome::Dropped(DropReason::Unparseable));
        assert_eq!(dispatcher.stats().dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_ack_without_flow_dropped() {
        let (dispatcher, _, _) = dispatcher(4);
        let outcome = dispatcher.dispatch(tcp(40000, TcpFlags::ACK));
        assert_eq!(outcome, DispatchOutcome::Dropped(DropReason::NoFlow));
        assert!(dispatcher.context().flows.is_empty());
    }

    // Relay tasks cannot run between these synchronous dispatches on the
    // current-thread test runtime, so flow state is deterministic here.

    #[tokio::test]
    async fn test_syn_creates_then_forwards() {
        let (dispatcher, _, root) = dispatcher(4);
        assert_eq!(dispatcher.dispatch(tcp(40000, TcpFlags::SYN)), DispatchOutcome::Created);
        assert_eq!(dispatcher.dispatch(tcp(40000, TcpFlags::SYN)), DispatchOutcome::Forwarded);
        assert_eq!(dispatcher.dispatch(tcp(40000, TcpFlags::ACK)), DispatchOutcome::Forwarded);
        assert_eq!(dispatcher.stats().flows_created.load(Ordering::Relaxed), 1);
        assert_eq!(dispatcher.stats().forwarded.load(Ordering::Relaxed), 3);
        assert_eq!(dispatcher.context().flows.len(), 1);
        root.cancel();
    }

    #[tokio::test]
    async fn test_capacity_one_drops_second_syn() {
        let (dispatcher, _, root) = dispatcher(1);
        assert_eq!(dispatcher.dispatch(tcp(40000, TcpFlags::SYN)), DispatchOutcome::Created);
        assert_eq!(
            dispatcher.dispatch(tcp(40001, TcpFlags::SYN)),
            DispatchOutcome::Dropped(DropReason::Exhausted)
        );

        let flows = &dispatcher.context().flows;
        assert_eq!(flows.len(), 1);
        let second = FlowKey::new(
            TransportProtocol::Tcp,
            SocketAddr::from(([10, 0, 0, 2], 40001)),
            SocketAddr::from(([93, 184, 216, 34], 443)),
        );
        assert!(flows.get(&second).is_none());
        root.cancel();
    }

    #[tokio::test]
    async fn test_relays_tracked() {
        let (dispatcher, tracker, root) = dispatcher(4);
        dispatcher.dispatch(tcp(40000, TcpFlags::SYN));
        root.cancel();
        tracker.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), tracker.wait())
            .await
            .unwrap();
        assert!(dispatcher.context().flows.is_empty());
    }
}
