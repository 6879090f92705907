// ============================================
// File: crates/proxytun-engine/src/relay/udp.rs
// ============================================
//! # UDP Relay
//!
//! Forwards one UDP flow's datagrams through a [`DatagramTunnel`] and
//! re-encodes replies as UDP packets from the original destination.
//! Failures are silent toward the originator; UDP has no reset.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use proxytun_core::{Packet, PacketCodec};

use crate::error::ConnectError;
use crate::services::{DatagramTunnel, Flow, FlowState};

use super::RelayContext;

/// Runs the UDP relay for `flow`.
pub async fn run(ctx: Arc<RelayContext>, flow: Arc<Flow>, mut inbound: mpsc::Receiver<Packet>) {
    let Some(first) = inbound.recv().await else {
        ctx.finish(&flow, FlowState::Closed);
        return;
    };
    flow.stats.record_out(first.payload().len() as u64);

    let key = flow.key();
    let opened = tokio::select! {
        () = flow.cancel_token().cancelled() => None,
        result = ctx.connector.open_datagram(key.dst) => Some(result),
    };

    let mut tunnel = match opened {
        None => {
            ctx.finish(&flow, FlowState::Closed);
            return;
        }
        Some(Err(e @ ConnectError::Unsupported { .. })) => {
            debug!(flow = %key, error = %e, "Datagram flow not relayable");
            ctx.finish(&flow, FlowState::Failed);
            return;
        }
        Some(Err(e)) => {
            warn!(flow = %key, error = %e, "Proxy datagram tunnel failed");
            ctx.finish(&flow, FlowState::Failed);
            return;
        }
        Some(Ok(tunnel)) => tunnel,
    };

    if let Err(e) = tunnel.send(first.payload()).await {
        debug!(flow = %key, error = %e, "First datagram send failed");
        ctx.finish(&flow, FlowState::Failed);
        return;
    }
    flow.set_state(FlowState::Established);

    let state = relay(&ctx, &flow, &mut inbound, &mut tunnel).await;
    ctx.finish(&flow, state);
}

async fn relay(
    ctx: &RelayContext,
    flow: &Flow,
    inbound: &mut mpsc::Receiver<Packet>,
    tunnel: &mut DatagramTunnel,
) -> FlowState {
    let reply_key = flow.key().reversed();
    let max_payload = ctx.max_udp_payload(&reply_key);

    loop {
        tokio::select! {
            () = flow.cancel_token().cancelled() => return FlowState::Closed,
            packet = inbound.recv() => {
                let Some(packet) = packet else {
                    return FlowState::Closed;
                };
                flow.stats.record_out(packet.payload().len() as u64);
                if let Err(e) = tunnel.send(packet.payload()).await {
                    debug!(flow = %flow.key(), error = %e, "Datagram send failed");
                    return FlowState::Failed;
                }
            }
            reply = tunnel.recv() => match reply {
                Ok(Some(data)) => {
                    if data.len() > max_payload {
                        debug!(flow = %flow.key(), len = data.len(), max_payload, "Oversized reply dropped");
                        continue;
                    }
                    let packet = PacketCodec::build_udp(&reply_key, &data);
                    ctx.write_packet(flow, &packet, data.len()).await;
                    flow.touch();
                }
                Ok(None) => return FlowState::Closed,
                Err(e) => {
                    debug!(flow = %flow.key(), error = %e, "Datagram receive failed");
                    return FlowState::Failed;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use proxytun_common::{FlowKey, ProxyKind, TransportProtocol};
    use proxytun_core::packet::checksum;
    use proxytun_transport::tun::MockTun;
    use proxytun_transport::TunConfig;

    use crate::config::ProxyConfig;
    use crate::services::{FlowLookup, FlowTable, ProxyConnector};

    const WAIT: Duration = Duration::from_secs(5);

    fn udp_key(dst: SocketAddr) -> FlowKey {
        FlowKey::new(TransportProtocol::Udp, SocketAddr::from(([10, 0, 0, 2], 5353)), dst)
    }

    /// Starts a relay for one datagram to `dst` through an HTTP proxy on `port`.
    fn spawn_relay(
        port: u16,
        dst: SocketAddr,
        payload: &[u8],
    ) -> (Arc<MockTun>, Arc<FlowTable>, Arc<Flow>, tokio::task::JoinHandle<()>) {
        let device = Arc::new(MockTun::new(TunConfig::new("mock0")));
        let root = CancellationToken::new();
        let flows = Arc::new(FlowTable::new(16, root.clone()));
        let ctx = Arc::new(RelayContext::new(
            device.clone(),
            ProxyConnector::new(ProxyConfig::new("127.0.0.1", port, ProxyKind::Http)),
            Arc::clone(&flows),
            root,
        ));

        let key = udp_key(dst);
        let FlowLookup::Created(flow) = flows.lookup_or_create(key, true).unwrap() else {
            panic!("flow already existed");
        };
        let packet = PacketCodec::parse(PacketCodec::build_udp(&key, payload)).unwrap();
        flow.try_send(packet).unwrap();
        let task = tokio::spawn(crate::relay::run(ctx, Arc::clone(&flow)));
        (device, flows, flow, task)
    }

    #[tokio::test]
    async fn test_dns_round_trip_over_http_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dns: SocketAddr = "8.8.8.8:53".parse().unwrap();

        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                s.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            assert!(head.starts_with(b"CONNECT 8.8.8.8:53 "));
            s.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();

            let mut len = [0u8; 2];
            s.read_exact(&mut len).await.unwrap();
            let mut query = vec![0u8; usize::from(u16::from_be_bytes(len))];
            s.read_exact(&mut query).await.unwrap();
            assert_eq!(query, b"query");
            s.write_all(&[0x00, 0x06]).await.unwrap();
            s.write_all(b"answer").await.unwrap();
            s
        });

        let (device, flows, flow, task) = spawn_relay(port, dns, b"query");

        let written = device.wait_for_written(1, WAIT).await;
        assert_eq!(written.len(), 1);
        let reply = PacketCodec::parse(Bytes::from(written[0].clone())).unwrap();
        assert_eq!(reply.key(), udp_key(dns).reversed());
        assert_eq!(&reply.payload()[..], b"answer");
        let raw = reply.as_bytes();
        assert!(checksum::verify_transport(reply.src().ip(), reply.dst().ip(), 17, &raw[20..]));
        assert_eq!(flow.state(), FlowState::Established);

        // Proxy side closing ends the flow.
        drop(server.await.unwrap());
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(flow.state(), FlowState::Closed);
        assert!(flows.is_empty());
    }

    #[tokio::test]
    async fn test_non_dns_udp_over_http_fails_silently() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (device, flows, flow, task) = spawn_relay(port, "9.9.9.9:123".parse().unwrap(), b"ntp");
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();

        assert_eq!(flow.state(), FlowState::Failed);
        assert!(flows.is_empty());
        assert_eq!(device.written_count(), 0);
        // Nothing was attempted against the proxy.
        assert!(tokio::time::timeout(Duration::from_millis(50), listener.accept())
            .await
            .is_err());
    }
}
