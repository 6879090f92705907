// ============================================
// File: crates/proxytun-engine/src/relay/mod.rs
// ============================================
//! # Flow Relays
//!
//! ## Creation Reason
//! Each flow gets one task that owns its proxy connection and bridges
//! packets from the TUN device to the proxy and back.
//!
//! ## Main Functionality
//! - [`RelayContext`]: what every relay shares (device, connector, table)
//! - [`run`]: entry point picking the TCP or UDP relay
//! - [`tcp`]: synthesized TCP endpoint (handshake, seq/ack, FIN/RST)
//! - [`udp`]: datagram forwarding over a proxy datagram tunnel
//!
//! ## Relay Data Flow
//! ```text
//!   dispatcher ──mpsc──► relay task ──► ProxyConnector ──► proxy
//!                            │
//!                            └──► PacketCodec::build_* ──► TUN write
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - A relay removes only its own flow (`FlowTable::remove_flow`)
//! - Flow token cancelled with the run token still live means eviction:
//!   the sweeper already answered the originator, the relay stays silent
//!
//! ## Last Modified
//! v0.1.0 - Initial relays

pub mod tcp;
pub mod udp;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use proxytun_common::{FlowKey, TransportProtocol};
use proxytun_core::packet::{IPV4_HEADER_LEN, IPV6_HEADER_LEN, TCP_HEADER_LEN, UDP_HEADER_LEN};
use proxytun_transport::TunDevice;

use crate::services::{Flow, FlowState, FlowTable, ProxyConnector};

// ============================================
// RelayContext
// ============================================

/// Shared state handed to every relay of one engine run.
pub struct RelayContext {
    /// TUN device packets are written back to.
    pub device: Arc<dyn TunDevice>,
    /// Proxy connector.
    pub connector: ProxyConnector,
    /// Flow table of this run.
    pub flows: Arc<FlowTable>,
    /// Run token; cancelled by engine stop.
    pub shutdown: CancellationToken,
}

impl RelayContext {
    /// Creates a context.
    #[must_use]
    pub fn new(
        device: Arc<dyn TunDevice>,
        connector: ProxyConnector,
        flows: Arc<FlowTable>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            device,
            connector,
            flows,
            shutdown,
        }
    }

    /// Returns `true` once engine stop began.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn ip_header_len(key: &FlowKey) -> usize {
        if key.is_ipv4() {
            IPV4_HEADER_LEN
        } else {
            IPV6_HEADER_LEN
        }
    }

    /// MSS we advertise for `key`, derived from the device MTU.
    #[must_use]
    pub fn local_mss(&self, key: &FlowKey) -> u16 {
        let overhead = Self::ip_header_len(key) + TCP_HEADER_LEN;
        let mss = usize::from(self.device.mtu()).saturating_sub(overhead);
        u16::try_from(mss).unwrap_or(u16::MAX)
    }

    /// Largest UDP payload that fits one packet for `key`.
    #[must_use]
    pub fn max_udp_payload(&self, key: &FlowKey) -> usize {
        usize::from(self.device.mtu()).saturating_sub(Self::ip_header_len(key) + UDP_HEADER_LEN)
    }

    /// Writes a built packet back to the originator.
    ///
    /// Write failures are logged and swallowed: the flow will notice its
    /// peer going quiet, and a dead device stops the engine via the read loop.
    pub async fn write_packet(&self, flow: &Flow, packet: &[u8], payload_len: usize) -> bool {
        match self.device.write(packet).await {
            Ok(_) => {
                flow.stats.record_in(payload_len as u64);
                true
            }
            Err(e) => {
                debug!(flow = %flow.key(), error = %e, "TUN write failed");
                false
            }
        }
    }

    /// Records a terminal transition and removes the flow (own entry only).
    pub fn finish(&self, flow: &Arc<Flow>, state: FlowState) {
        flow.set_state(state);
        let removed = self.flows.remove_flow(flow);
        let stats = flow.stats.snapshot();
        debug!(
            flow = %flow.key(),
            state = %state,
            removed,
            bytes_out = stats.bytes_out,
            bytes_in = stats.bytes_in,
            packets_out = stats.packets_out,
            packets_in = stats.packets_in,
            lifetime = ?flow.created_at().elapsed(),
            "Flow finished"
        );
    }
}

impl std::fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayContext")
            .field("device", &self.device.name())
            .field("proxy", &self.connector.config().to_string())
            .field("flows", &self.flows.len())
            .finish()
    }
}

// ============================================
// Entry Point
// ============================================

/// Runs the relay for a freshly created flow until it terminates.
pub async fn run(ctx: Arc<RelayContext>, flow: Arc<Flow>) {
    let Some(inbound) = flow.take_receiver() else {
        warn!(flow = %flow.key(), "Relay already started for flow");
        return;
    };

    match flow.key().protocol {
        TransportProtocol::Tcp => tcp::run(ctx, flow, inbound).await,
        TransportProtocol::Udp => udp::run(ctx, flow, inbound).await,
    }
}
