// ============================================
// File: crates/proxytun-engine/src/relay/tcp.rs
// ============================================
//! # TCP Relay
//!
//! ## Creation Reason
//! The originator believes it talks TCP to the destination. This relay
//! impersonates that destination: it answers the handshake, tracks
//! sequence numbers and carries the byte stream over a proxy tunnel.
//!
//! ## Main Functionality
//! - SYN-ACK only after the proxy tunnel is up (connect failure → RST)
//! - In-order data forwarded and ACKed; retransmits re-ACKed;
//!   out-of-order segments dropped with a duplicate ACK
//! - Proxy bytes chunked to the MSS as PSH|ACK segments, paused while the
//!   originator's window is full
//! - Originator bytes staged in a bounded upstream buffer drained by its own
//!   `select!` branch; the advertised window is the buffer's free space
//! - FIN in each direction, RST on failure
//!
//! ## Sequence Spaces
//! ```text
//! originator ── seq=peer_next ──────────────► relay ──► upstream buf ──► proxy
//! originator ◄─ seq=our_next, ack=peer_next ─ relay ◄─────────────────── proxy
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - No retransmission timers: the proxy leg is a reliable stream and the
//!   originator retransmits its own losses
//! - Bookkeeping lives in `Flow::tcp()` so the sweeper can build its RST
//! - Never await a proxy write inside a `select!` handler: a proxy that
//!   stops reading must only close the window, not the whole flow
//!
//! ## Last Modified
//! v0.1.0 - Initial TCP relay

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use proxytun_common::FlowKey;
use proxytun_core::{Packet, PacketCodec, TcpFlags, TcpSegment};

use crate::error::ConnectError;
use crate::services::flow_table::{seq_gt, seq_lt};
use crate::services::{Flow, FlowState, ProxyStream};

use super::RelayContext;

/// MSS assumed when the SYN carries no option (RFC 9293).
const DEFAULT_PEER_MSS: u16 = 536;

/// Proxy read buffer size.
const READ_CHUNK: usize = 16 * 1024;

/// Originator bytes accepted but not yet written to the proxy.
const UPSTREAM_BUFFER: usize = 64 * 1024;

/// Receive window advertised with `buffered` bytes waiting for the proxy.
fn window_for(buffered: usize) -> u16 {
    u16::try_from(UPSTREAM_BUFFER.saturating_sub(buffered)).unwrap_or(u16::MAX)
}

/// Builds the RST|ACK answering `flow`'s originator from its current
/// bookkeeping.
#[must_use]
pub fn reset_segment(flow: &Flow) -> Bytes {
    let tcb = *flow.tcp();
    PacketCodec::build_tcp(
        &flow.key().reversed(),
        tcb.our_next,
        tcb.peer_next,
        TcpFlags::RST | TcpFlags::ACK,
        &[],
    )
}

/// Runs the TCP relay for `flow`.
pub async fn run(ctx: Arc<RelayContext>, flow: Arc<Flow>, mut inbound: mpsc::Receiver<Packet>) {
    let syn = match inbound.recv().await {
        Some(packet) => packet.tcp().copied(),
        None => None,
    };
    let Some(syn) = syn.filter(|h| h.flags.is_syn_only()) else {
        ctx.finish(&flow, FlowState::Closed);
        return;
    };

    let key = flow.key();
    let isn: u32 = rand::random();
    {
        let mut tcb = flow.tcp();
        tcb.peer_next = syn.seq.wrapping_add(1);
        tcb.our_next = isn;
        tcb.peer_acked = isn;
        tcb.peer_window = syn.window;
    }

    let local_mss = ctx.local_mss(&key);
    let relay = TcpRelay {
        mss: usize::from(syn.mss.unwrap_or(DEFAULT_PEER_MSS).min(local_mss)).max(1),
        local_mss,
        advertised: window_for(0),
        reply: key.reversed(),
        isn,
        ctx,
        flow,
        inbound,
    };
    relay.drive().await;
}

// ============================================
// TcpRelay
// ============================================

enum ConnectOutcome {
    Connected(ProxyStream),
    Failed(ConnectError),
    Reset,
    Cancelled,
}

struct TcpRelay {
    ctx: Arc<RelayContext>,
    flow: Arc<Flow>,
    inbound: mpsc::Receiver<Packet>,
    /// Addressing of packets we send.
    reply: FlowKey,
    isn: u32,
    /// Segment size toward the originator.
    mss: usize,
    local_mss: u16,
    /// Receive window carried by our last segment.
    advertised: u16,
}

/// What one originator segment did to the flow.
enum SegmentOutcome {
    Continue,
    /// In-sequence FIN: shut the proxy write side once upstream drains.
    FinAccepted,
    Done(FlowState),
}

impl TcpRelay {
    async fn drive(mut self) {
        self.flow.set_state(FlowState::Connecting);

        let proxied = match self.connect().await {
            ConnectOutcome::Connected(proxied) => proxied,
            ConnectOutcome::Failed(e) => {
                warn!(flow = %self.flow.key(), error = %e, "Proxy connect failed");
                self.send_connect_reset().await;
                self.ctx.finish(&self.flow, FlowState::Failed);
                return;
            }
            ConnectOutcome::Reset | ConnectOutcome::Cancelled => {
                self.ctx.finish(&self.flow, FlowState::Closed);
                return;
            }
        };

        self.send_syn_ack().await;
        {
            let mut tcb = self.flow.tcp();
            tcb.our_next = self.isn.wrapping_add(1);
        }
        self.flow.set_state(FlowState::Established);
        self.flow.touch();

        let state = self.established(proxied).await;
        self.ctx.finish(&self.flow, state);
    }

    async fn connect(&mut self) -> ConnectOutcome {
        let connector = self.ctx.connector.clone();
        let connecting = connector.connect(self.flow.key().dst);
        tokio::pin!(connecting);

        loop {
            tokio::select! {
                () = self.flow.cancel_token().cancelled() => return ConnectOutcome::Cancelled,
                result = &mut connecting => {
                    return match result {
                        Ok(proxied) => ConnectOutcome::Connected(proxied),
                        Err(e) => ConnectOutcome::Failed(e),
                    };
                }
                packet = self.inbound.recv() => match packet {
                    None => return ConnectOutcome::Cancelled,
                    Some(packet) if packet.tcp().is_some_and(|h| h.flags.contains(TcpFlags::RST)) => {
                        debug!(flow = %self.flow.key(), "Originator reset while connecting");
                        return ConnectOutcome::Reset;
                    }
                    // SYN retransmissions are answered once the tunnel is up.
                    Some(_) => {}
                },
            }
        }
    }

    async fn established(&mut self, proxied: ProxyStream) -> FlowState {
        let (stream, prefetched) = proxied.into_parts();
        let (mut proxy_rx, mut proxy_tx) = stream.into_split();

        if !prefetched.is_empty() {
            self.send_data(&prefetched).await;
        }

        let mut upstream = BytesMut::with_capacity(READ_CHUNK);
        let mut fin_pending = false;
        let mut upstream_closed = false;
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            if fin_pending && upstream.is_empty() {
                fin_pending = false;
                upstream_closed = true;
                if let Err(e) = proxy_tx.shutdown().await {
                    debug!(flow = %self.flow.key(), error = %e, "Proxy shutdown failed");
                }
            }

            let (window, proxy_open) = {
                let tcb = self.flow.tcp();
                if upstream_closed && tcb.fin_sent {
                    return FlowState::Closed;
                }
                (tcb.send_window() as usize, !tcb.fin_sent)
            };
            let limit = window.min(buf.len());

            tokio::select! {
                () = self.flow.cancel_token().cancelled() => {
                    if self.ctx.is_shutting_down() {
                        self.send_reset().await;
                    }
                    return FlowState::Closed;
                }
                packet = self.inbound.recv() => {
                    let Some(packet) = packet else {
                        return FlowState::Closed;
                    };
                    match self.on_segment(&packet, &mut upstream).await {
                        SegmentOutcome::Continue => {}
                        SegmentOutcome::FinAccepted => fin_pending = true,
                        SegmentOutcome::Done(state) => return state,
                    }
                }
                written = proxy_tx.write(&upstream), if !upstream.is_empty() => match written {
                    Ok(n) if n > 0 => {
                        upstream.advance(n);
                        self.reopen_window(upstream.len()).await;
                    }
                    Ok(_) => {
                        debug!(flow = %self.flow.key(), "Proxy accepted zero bytes");
                        self.send_reset().await;
                        return FlowState::Failed;
                    }
                    Err(e) => {
                        debug!(flow = %self.flow.key(), error = %e, "Proxy write failed");
                        self.send_reset().await;
                        return FlowState::Failed;
                    }
                },
                read = proxy_rx.read(&mut buf[..limit]), if proxy_open && limit > 0 => match read {
                    Ok(0) => {
                        self.send_fin().await;
                        if !self.flow.tcp().fin_received {
                            self.flow.set_state(FlowState::HalfClosedRemote);
                        }
                    }
                    Ok(n) => {
                        self.send_data(&buf[..n]).await;
                        self.flow.touch();
                    }
                    Err(e) => {
                        debug!(flow = %self.flow.key(), error = %e, "Proxy read failed");
                        self.send_reset().await;
                        return FlowState::Failed;
                    }
                },
            }
        }
    }

    /// Handles one segment from the originator, staging accepted payload in
    /// `upstream`.
    async fn on_segment(&mut self, packet: &Packet, upstream: &mut BytesMut) -> SegmentOutcome {
        let Some(header) = packet.tcp().copied() else {
            return SegmentOutcome::Continue;
        };
        let payload = packet.payload();
        self.flow.touch();
        self.flow.stats.record_out(payload.len() as u64);

        if header.flags.contains(TcpFlags::RST) {
            debug!(flow = %self.flow.key(), "Originator reset");
            return SegmentOutcome::Done(FlowState::Closed);
        }

        if header.flags.is_syn_only() {
            self.send_syn_ack().await;
            return SegmentOutcome::Continue;
        }

        if header.flags.contains(TcpFlags::ACK) {
            self.flow.tcp().on_ack(header.ack, header.window);
        }

        let is_fin = header.flags.contains(TcpFlags::FIN);
        if payload.is_empty() && !is_fin {
            return SegmentOutcome::Continue;
        }

        let (expected, fin_received) = {
            let tcb = self.flow.tcp();
            (tcb.peer_next, tcb.fin_received)
        };

        if !payload.is_empty() && !fin_received {
            // Bytes of this segment we already have; zero when in order.
            let overlap = expected.wrapping_sub(header.seq) as usize;
            let in_window =
                header.seq == expected || (seq_lt(header.seq, expected) && overlap < payload.len());

            if in_window {
                let fresh = &payload[overlap..];
                let room = UPSTREAM_BUFFER.saturating_sub(upstream.len());
                let accepted = &fresh[..fresh.len().min(room)];
                if accepted.len() < fresh.len() {
                    trace!(flow = %self.flow.key(), dropped = fresh.len() - accepted.len(), "Upstream buffer full");
                }
                upstream.extend_from_slice(accepted);
                self.flow.tcp().peer_next = expected.wrapping_add(accepted.len() as u32);
            } else if seq_gt(header.seq, expected) {
                trace!(flow = %self.flow.key(), seq = header.seq, expected, "Out-of-order segment dropped");
                self.advertised = window_for(upstream.len());
                self.send_ack().await;
                return SegmentOutcome::Continue;
            }
        }

        let mut fin_accepted = false;
        if is_fin {
            let fin_seq = header.seq.wrapping_add(payload.len() as u32);
            let mut tcb = self.flow.tcp();
            if !tcb.fin_received && fin_seq == tcb.peer_next {
                tcb.peer_next = tcb.peer_next.wrapping_add(1);
                tcb.fin_received = true;
                fin_accepted = true;
                let fin_sent = tcb.fin_sent;
                drop(tcb);
                if !fin_sent {
                    self.flow.set_state(FlowState::HalfClosedLocal);
                }
            }
        }

        self.advertised = window_for(upstream.len());
        self.send_ack().await;
        if fin_accepted {
            SegmentOutcome::FinAccepted
        } else {
            SegmentOutcome::Continue
        }
    }

    /// Announces a reopened window once the proxy drained enough of a
    /// window we had shrunk below one segment.
    async fn reopen_window(&mut self, buffered: usize) {
        let window = window_for(buffered);
        if usize::from(self.advertised) < self.mss && usize::from(window) >= self.mss {
            self.advertised = window;
            self.send_ack().await;
        }
    }

    // ========================================
    // Segment Output
    // ========================================

    async fn send_syn_ack(&self) {
        let ack = self.flow.tcp().peer_next;
        let segment = TcpSegment::new(self.reply, self.isn, ack, TcpFlags::SYN | TcpFlags::ACK)
            .with_window(self.advertised)
            .with_mss(self.local_mss);
        let packet = PacketCodec::build_tcp_segment(&segment);
        self.ctx.write_packet(&self.flow, &packet, 0).await;
    }

    async fn send_ack(&self) {
        let tcb = *self.flow.tcp();
        let segment = TcpSegment::new(self.reply, tcb.our_next, tcb.peer_next, TcpFlags::ACK)
            .with_window(self.advertised);
        let packet = PacketCodec::build_tcp_segment(&segment);
        self.ctx.write_packet(&self.flow, &packet, 0).await;
    }

    async fn send_data(&self, data: &[u8]) {
        for chunk in data.chunks(self.mss) {
            let (seq, ack) = {
                let mut tcb = self.flow.tcp();
                let seq = tcb.our_next;
                tcb.our_next = seq.wrapping_add(chunk.len() as u32);
                (seq, tcb.peer_next)
            };
            let segment = TcpSegment::new(self.reply, seq, ack, TcpFlags::PSH | TcpFlags::ACK)
                .with_window(self.advertised)
                .with_payload(chunk);
            let packet = PacketCodec::build_tcp_segment(&segment);
            self.ctx.write_packet(&self.flow, &packet, chunk.len()).await;
        }
    }

    async fn send_fin(&self) {
        let (seq, ack) = {
            let mut tcb = self.flow.tcp();
            let seq = tcb.our_next;
            tcb.our_next = seq.wrapping_add(1);
            tcb.fin_sent = true;
            (seq, tcb.peer_next)
        };
        let segment = TcpSegment::new(self.reply, seq, ack, TcpFlags::FIN | TcpFlags::ACK)
            .with_window(self.advertised);
        let packet = PacketCodec::build_tcp_segment(&segment);
        self.ctx.write_packet(&self.flow, &packet, 0).await;
    }

    async fn send_reset(&self) {
        let packet = reset_segment(&self.flow);
        self.ctx.write_packet(&self.flow, &packet, 0).await;
    }

    /// Refuses the originator's SYN: no SYN-ACK was ever sent.
    async fn send_connect_reset(&self) {
        let ack = self.flow.tcp().peer_next;
        let packet = PacketCodec::build_tcp(&self.reply, 0, ack, TcpFlags::RST | TcpFlags::ACK, &[]);
        self.ctx.write_packet(&self.flow, &packet, 0).await;
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use proxytun_common::{ProxyKind, TransportProtocol};
    use proxytun_transport::tun::MockTun;
    use proxytun_transport::TunConfig;

    use crate::config::ProxyConfig;
    use crate::services::{FlowLookup, FlowTable, ProxyConnector};

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        device: Arc<MockTun>,
        flows: Arc<FlowTable>,
        flow: Arc<Flow>,
        task: JoinHandle<()>,
        proxy: TcpStream,
        isn: u32,
    }

    impl Harness {
        fn inject(&self, segment: TcpSegment<'_>) {
            let packet = PacketCodec::parse(PacketCodec::build_tcp_segment(&segment)).unwrap();
            self.flow.try_send(packet).unwrap();
        }

        fn data(&self, seq: u32, payload: &[u8]) {
            self.inject(
                TcpSegment::new(key(), seq, self.isn.wrapping_add(1), TcpFlags::PSH | TcpFlags::ACK)
                    .with_payload(payload),
            );
        }
    }

    fn key() -> FlowKey {
        FlowKey::new(
            TransportProtocol::Tcp,
            SocketAddr::from(([10, 0, 0, 2], 40000)),
            SocketAddr::from(([93, 184, 216, 34], 80)),
        )
    }

    fn parse(raw: Vec<u8>) -> Packet {
        PacketCodec::parse(Bytes::from(raw)).unwrap()
    }

    /// Collects written packets until `count` arrived or the wait expires.
    async fn collect(device: &MockTun, count: usize) -> Vec<Packet> {
        let deadline = tokio::time::Instant::now() + WAIT;
        let mut packets = Vec::new();
        while packets.len() < count && tokio::time::Instant::now() < deadline {
            let written = device.wait_for_written(count - packets.len(), WAIT).await;
            packets.extend(written.into_iter().map(parse));
        }
        packets
    }

    /// Collects written packets until they carry `total` payload bytes.
    async fn collect_payload(device: &MockTun, total: usize) -> Vec<Packet> {
        let deadline = tokio::time::Instant::now() + WAIT;
        let mut packets: Vec<Packet> = Vec::new();
        while packets.iter().map(|p| p.payload().len()).sum::<usize>() < total
            && tokio::time::Instant::now() < deadline
        {
            packets.extend(collect(device, 1).await);
        }
        packets
    }

    async fn read_head(stream: &mut TcpStream) {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
    }

    /// Opens a flow through a fake HTTP proxy and consumes the SYN-ACK.
    async fn established(syn: TcpSegment<'_>) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let device = Arc::new(MockTun::new(TunConfig::new("mock0")));
        let root = CancellationToken::new();
        let flows = Arc::new(FlowTable::new(16, root.clone()));
        let ctx = Arc::new(RelayContext::new(
            device.clone(),
            ProxyConnector::new(ProxyConfig::new("127.0.0.1", port, ProxyKind::Http)),
            Arc::clone(&flows),
            root,
        ));

        let FlowLookup::Created(flow) = flows.lookup_or_create(key(), true).unwrap() else {
            panic!("flow already existed");
        };
        let packet = PacketCodec::parse(PacketCodec::build_tcp_segment(&syn)).unwrap();
        flow.try_send(packet).unwrap();
        let task = tokio::spawn(crate::relay::run(ctx, Arc::clone(&flow)));

        let (mut proxy, _) = listener.accept().await.unwrap();
        read_head(&mut proxy).await;
        proxy.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await.unwrap();

        let syn_ack = collect(&device, 1).await.remove(0);
        let header = syn_ack.tcp().copied().unwrap();
        assert_eq!(header.flags, TcpFlags::SYN | TcpFlags::ACK);

        Harness {
            device,
            flows,
            flow,
            task,
            proxy,
            isn: header.seq,
        }
    }

    fn syn() -> TcpSegment<'static> {
        TcpSegment::new(key(), 1000, 0, TcpFlags::SYN).with_mss(1460)
    }

    #[tokio::test]
    async fn test_out_of_order_segment_gets_duplicate_ack() {
        let mut h = established(syn()).await;

        h.data(1006, b"world");
        let dup = collect(&h.device, 1).await.remove(0);
        let dup = dup.tcp().copied().unwrap();
        assert_eq!(dup.flags, TcpFlags::ACK);
        assert_eq!(dup.ack, 1001);

        h.data(1001, b"hello");
        let ack = collect(&h.device, 1).await.remove(0);
        assert_eq!(ack.tcp().unwrap().ack, 1006);

        let mut got = [0u8; 5];
        h.proxy.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        // The dropped segment never reached the proxy.
        let mut more = [0u8; 1];
        assert!(tokio::time::timeout(Duration::from_millis(50), h.proxy.read(&mut more))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_retransmit_overlap_forwards_only_new_bytes() {
        let mut h = established(syn()).await;

        h.data(1001, b"hello");
        assert_eq!(collect(&h.device, 1).await[0].tcp().unwrap().ack, 1006);

        h.data(1001, b"hello world");
        assert_eq!(collect(&h.device, 1).await[0].tcp().unwrap().ack, 1012);

        // Entirely old: re-ACKed, nothing forwarded.
        h.data(1001, b"hello");
        assert_eq!(collect(&h.device, 1).await[0].tcp().unwrap().ack, 1012);

        let mut got = [0u8; 11];
        h.proxy.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello world");
        let mut more = [0u8; 1];
        assert!(tokio::time::timeout(Duration::from_millis(50), h.proxy.read(&mut more))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_proxy_data_chunked_to_peer_mss() {
        let mut h = established(TcpSegment::new(key(), 1000, 0, TcpFlags::SYN).with_mss(100)).await;

        let data: Vec<u8> = (0..250u32).map(|i| (i % 251) as u8).collect();
        h.proxy.write_all(&data).await.unwrap();

        let segments = collect_payload(&h.device, data.len()).await;
        assert!(segments.len() >= 3);

        let mut expected_seq = h.isn.wrapping_add(1);
        let mut received = Vec::new();
        for segment in &segments {
            let header = segment.tcp().copied().unwrap();
            assert_eq!(header.flags, TcpFlags::PSH | TcpFlags::ACK);
            assert_eq!(header.seq, expected_seq);
            assert!(segment.payload().len() <= 100);
            expected_seq = expected_seq.wrapping_add(segment.payload().len() as u32);
            received.extend_from_slice(segment.payload());
        }
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_full_peer_window_pauses_proxy_reads() {
        let mut h = established(
            TcpSegment::new(key(), 1000, 0, TcpFlags::SYN)
                .with_mss(100)
                .with_window(100),
        )
        .await;
        let base = h.isn.wrapping_add(1);
        // Completes the handshake so the SYN-ACK no longer counts in flight.
        h.inject(TcpSegment::new(key(), 1001, base, TcpFlags::ACK).with_window(100));
        tokio::time::timeout(WAIT, async {
            while h.flow.tcp().peer_acked != base {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        h.proxy.write_all(&[7u8; 300]).await.unwrap();

        let first = collect_payload(&h.device, 100).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].tcp().unwrap().seq, base);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.device.written_count(), 0);

        // ACK with a closed window: still paused.
        h.inject(TcpSegment::new(key(), 1001, base.wrapping_add(100), TcpFlags::ACK).with_window(0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.device.written_count(), 0);

        h.inject(TcpSegment::new(key(), 1001, base.wrapping_add(100), TcpFlags::ACK).with_window(100));
        let second = collect_payload(&h.device, 100).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].tcp().unwrap().seq, base.wrapping_add(100));
    }

    #[tokio::test]
    async fn test_stalled_proxy_keeps_flow_responsive() {
        // The proxy never reads what the originator uploads.
        let mut h = established(syn()).await;

        let chunk = vec![0x5a; 16 * 1024];
        let mut seq = 1001u32;
        let mut window = chunk.len();
        for _ in 0..8192 {
            let len = chunk.len().min(window);
            if len == 0 {
                break;
            }
            h.data(seq, &chunk[..len]);
            let acks = collect(&h.device, 1).await;
            let last = acks.last().and_then(|p| p.tcp().copied()).unwrap();
            seq = last.ack;
            window = usize::from(last.window);
        }
        assert_eq!(window, 0);

        // The other direction still flows.
        h.proxy.write_all(b"server-data").await.unwrap();
        let reply = collect_payload(&h.device, 11).await;
        let body: Vec<u8> = reply.iter().flat_map(|p| p.payload().to_vec()).collect();
        assert_eq!(body, b"server-data");

        // And the originator can still tear the flow down.
        h.inject(TcpSegment::new(key(), seq, 0, TcpFlags::RST));
        tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
        assert!(h.flows.get(&key()).is_none());
        assert_eq!(h.flow.state(), FlowState::Closed);
    }

    #[tokio::test]
    async fn test_eviction_stops_stalled_relay_silently() {
        let h = established(syn()).await;
        h.data(1001, b"unread");
        collect(&h.device, 1).await;

        let evicted = h.flows.remove(&key()).unwrap();
        evicted.cancel_token().cancel();
        tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
        assert_eq!(h.device.written_count(), 0);
    }
}
