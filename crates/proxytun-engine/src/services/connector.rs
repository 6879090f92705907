// ============================================
// File: crates/proxytun-engine/src/services/connector.rs
// ============================================
//! # Proxy Connector
//!
//! ## Creation Reason
//! Turns a flow's destination into a byte stream (or datagram tunnel)
//! relayed by the configured upstream proxy.
//!
//! ## Main Functionality
//! - `ProxyConnector::connect`: TCP relay via HTTP CONNECT or SOCKS5 CONNECT
//! - `ProxyConnector::open_datagram`: UDP relay via SOCKS5 UDP ASSOCIATE,
//!   or DNS-over-TCP through HTTP CONNECT for port 53
//! - Proxy sockets get `TCP_NODELAY` and, on Linux, the configured `SO_MARK`
//!
//! ## Handshake Flow
//! ```text
//! HTTP:   CONNECT host:port ──► 200 ──► [prefetched bytes] + stream
//! SOCKS5: greeting ──► [RFC 1929 auth] ──► CONNECT ──► reply ──► stream
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - `connect_timeout` bounds TCP connect AND handshake together
//! - Bytes read past the HTTP response head belong to the tunnel; they
//!   are returned by `ProxyStream::into_parts`, never dropped
//! - Without `SO_MARK` and a matching `ip rule`, proxy traffic would loop
//!   back into the TUN device when the default route points there
//!
//! ## Last Modified
//! v0.1.0 - Initial connector

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace};

use proxytun_common::ProxyKind;
use proxytun_core::proxy::http;
use proxytun_core::proxy::socks5::{self, AuthMethod, BoundAddrLen, Command};

use crate::config::ProxyConfig;
use crate::error::ConnectError;

/// DNS port carried over HTTP proxies as DNS-over-TCP.
pub const DNS_PORT: u16 = 53;

/// Largest datagram the tunnel will receive from a SOCKS5 relay.
const MAX_DATAGRAM: usize = 65_535;

// ============================================
// ProxyStream
// ============================================

/// An established TCP relay through the proxy.
#[derive(Debug)]
pub struct ProxyStream {
    stream: TcpStream,
    prefetched: Bytes,
}

impl ProxyStream {
    /// Splits into the socket and bytes that must be delivered first.
    #[must_use]
    pub fn into_parts(self) -> (TcpStream, Bytes) {
        (self.stream, self.prefetched)
    }
}

// ============================================
// DatagramTunnel
// ============================================

/// A datagram relay through the proxy for one UDP flow.
///
/// `recv` is cancel-safe and may be raced against other futures.
#[derive(Debug)]
pub enum DatagramTunnel {
    /// SOCKS5 UDP ASSOCIATE.
    Socks {
        /// Held open for the association's lifetime.
        control: TcpStream,
        /// Connected to the proxy's relay address.
        socket: UdpSocket,
        /// Flow destination written into each datagram header.
        target: SocketAddr,
        /// Receive scratch space.
        buf: Vec<u8>,
    },
    /// DNS messages framed with a 2-byte length over a CONNECT tunnel.
    DnsOverTcp {
        /// Tunnel to the DNS server's TCP port.
        stream: TcpStream,
        /// Bytes received but not yet returned as a full message.
        pending: BytesMut,
    },
}

impl DatagramTunnel {
    /// Sends one datagram payload.
    ///
    /// # Errors
    /// I/O failure on the underlying socket.
    pub async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            Self::Socks { socket, target, .. } => {
                let datagram = socks5::encode_udp_datagram(target, payload);
                socket.send(&datagram).await.map(|_| ())
            }
            Self::DnsOverTcp { stream, .. } => {
                let len = u16::try_from(payload.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "DNS message exceeds 65535 bytes")
                })?;
                let mut frame = BytesMut::with_capacity(2 + payload.len());
                frame.put_u16(len);
                frame.put_slice(payload);
                stream.write_all(&frame).await
            }
        }
    }

    /// Receives the next reply payload; `None` once the tunnel closed.
    ///
    /// # Errors
    /// I/O failure on the underlying socket.
    pub async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        match self {
            Self::Socks {
                control,
                socket,
                buf,
                ..
            } => loop {
                let mut probe = [0u8; 1];
                tokio::select! {
                    read = control.read(&mut probe) => {
                        // Any byte or EOF on the control channel ends the association.
                        read?;
                        return Ok(None);
                    }
                    received = socket.recv(buf) => {
                        let n = received?;
                        match socks5::decode_udp_datagram(&buf[..n]) {
                            Ok((_, data)) => return Ok(Some(Bytes::copy_from_slice(data))),
                            Err(e) => trace!(error = %e, "Dropping relay datagram"),
                        }
                    }
                }
            },
            Self::DnsOverTcp { stream, pending } => loop {
                if pending.len() >= 2 {
                    let len = usize::from(u16::from_be_bytes([pending[0], pending[1]]));
                    if pending.len() >= 2 + len {
                        pending.advance(2);
                        return Ok(Some(pending.split_to(len).freeze()));
                    }
                }
                if stream.read_buf(pending).await? == 0 {
                    return Ok(None);
                }
            },
        }
    }
}

// ============================================
// ProxyConnector
// ============================================

/// Opens relayed connections through the configured proxy.
#[derive(Debug, Clone)]
pub struct ProxyConnector {
    config: Arc<ProxyConfig>,
}

impl ProxyConnector {
    /// Creates a connector for `config`.
    #[must_use]
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Upstream proxy this connector dials.
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Opens a TCP relay to `destination`.
    ///
    /// # Errors
    /// - `Unreachable`: resolution, connect failure or timeout
    /// - `ProxyRejected`: the handshake failed or was refused
    pub async fn connect(&self, destination: SocketAddr) -> Result<ProxyStream, ConnectError> {
        let deadline = self.config.connect_timeout();
        let attempt = async {
            let mut stream = self.open_control().await?;
            let prefetched = match self.config.kind {
                ProxyKind::Http => self.http_connect(&mut stream, destination).await?,
                ProxyKind::Socks => {
                    self.socks_request(&mut stream, Command::Connect, destination).await?;
                    Bytes::new()
                }
            };
            Ok::<_, ConnectError>(ProxyStream { stream, prefetched })
        };

        let result = timeout(deadline, attempt)
            .await
            .map_err(|_| self.unreachable(format!("timed out after {deadline:?}")))?;

        if result.is_ok() {
            debug!(proxy = %self.config, destination = %destination, "Proxy tunnel established");
        }
        result
    }

    /// Opens a datagram relay to `destination`.
    ///
    /// # Errors
    /// - `Unsupported`: an HTTP proxy and a destination other than DNS
    /// - otherwise as [`connect`](Self::connect)
    pub async fn open_datagram(&self, destination: SocketAddr) -> Result<DatagramTunnel, ConnectError> {
        match self.config.kind {
            ProxyKind::Http if destination.port() == DNS_PORT => {
                let (stream, prefetched) = self.connect(destination).await?.into_parts();
                let mut pending = BytesMut::with_capacity(512);
                pending.extend_from_slice(&prefetched);
                Ok(DatagramTunnel::DnsOverTcp { stream, pending })
            }
            ProxyKind::Http => Err(ConnectError::unsupported(format!(
                "UDP to {destination} through an HTTP proxy"
            ))),
            ProxyKind::Socks => {
                let deadline = self.config.connect_timeout();
                timeout(deadline, self.socks_associate(destination))
                    .await
                    .map_err(|_| self.unreachable(format!("timed out after {deadline:?}")))?
            }
        }
    }

    // ========================================
    // Sockets
    // ========================================

    fn unreachable(&self, reason: impl Into<String>) -> ConnectError {
        ConnectError::unreachable(self.config.authority(), reason)
    }

    async fn resolve(&self) -> Result<SocketAddr, ConnectError> {
        let host = self.config.host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.config.port));
        }

        tokio::net::lookup_host((host, self.config.port))
            .await
            .map_err(|e| self.unreachable(format!("resolve failed: {e}")))?
            .next()
            .ok_or_else(|| self.unreachable("resolved to no addresses"))
    }

    fn new_socket(&self, addr: &SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(*addr), ty, Some(protocol))?;
        #[cfg(target_os = "linux")]
        if let Some(mark) = self.config.socket_mark {
            socket.set_mark(mark)?;
        }
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    async fn open_control(&self) -> Result<TcpStream, ConnectError> {
        let addr = self.resolve().await?;
        let socket = self
            .new_socket(&addr, Type::STREAM, Protocol::TCP)
            .and_then(|s| {
                s.set_nodelay(true)?;
                Ok(s)
            })
            .map_err(|e| self.unreachable(format!("socket setup failed: {e}")))?;

        let std_stream: std::net::TcpStream = socket.into();
        TcpSocket::from_std_stream(std_stream)
            .connect(addr)
            .await
            .map_err(|e| self.unreachable(e.to_string()))
    }

    // ========================================
    // HTTP CONNECT
    // ========================================

    async fn http_connect(&self, stream: &mut TcpStream, destination: SocketAddr) -> Result<Bytes, ConnectError> {
        let request = http::encode_connect(&destination, self.config.credentials());
        stream.write_all(&request).await.map_err(handshake_io)?;

        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if stream.read_buf(&mut buf).await.map_err(handshake_io)? == 0 {
                return Err(ConnectError::rejected("proxy closed before response"));
            }
            if let Some(head) = http::parse_response_head(&buf)? {
                let head = head.into_result()?;
                buf.advance(head.head_len);
                return Ok(buf.freeze());
            }
        }
    }

    // ========================================
    // SOCKS5
    // ========================================

    async fn socks_request(
        &self,
        stream: &mut TcpStream,
        command: Command,
        addr: SocketAddr,
    ) -> Result<Option<SocketAddr>, ConnectError> {
        let credentials = self.config.credentials();

        stream
            .write_all(&socks5::encode_greeting(credentials.is_some()))
            .await
            .map_err(handshake_io)?;
        let mut selection = [0u8; 2];
        stream.read_exact(&mut selection).await.map_err(handshake_io)?;

        if socks5::parse_method_selection(selection, credentials.is_some())? == AuthMethod::Password {
            let (user, pass) = credentials.unwrap_or_default();
            stream
                .write_all(&socks5::encode_auth(user, pass)?)
                .await
                .map_err(handshake_io)?;
            let mut reply = [0u8; 2];
            stream.read_exact(&mut reply).await.map_err(handshake_io)?;
            socks5::parse_auth_reply(reply)?;
        }

        stream
            .write_all(&socks5::encode_request(command, &addr))
            .await
            .map_err(handshake_io)?;
        let mut header = [0u8; socks5::REPLY_HEADER_LEN];
        stream.read_exact(&mut header).await.map_err(handshake_io)?;

        let rest_len = match socks5::parse_reply_header(header)? {
            BoundAddrLen::Fixed(len) => len,
            BoundAddrLen::Domain => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.map_err(handshake_io)?;
                usize::from(len[0]) + 2
            }
        };
        let mut rest = vec![0u8; rest_len];
        stream.read_exact(&mut rest).await.map_err(handshake_io)?;

        Ok(socks5::decode_bound_addr(header[3], &rest))
    }

    async fn socks_associate(&self, destination: SocketAddr) -> Result<DatagramTunnel, ConnectError> {
        let proxy_addr = self.resolve().await?;
        let mut control = self.open_control().await?;

        let any = if proxy_addr.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let relay = self
            .socks_request(&mut control, Command::UdpAssociate, any)
            .await?
            .ok_or_else(|| ConnectError::rejected("relay address is not an IP address"))?;

        let relay = if relay.ip().is_unspecified() {
            SocketAddr::new(proxy_addr.ip(), relay.port())
        } else {
            relay
        };

        let socket = self
            .new_socket(&relay, Type::DGRAM, Protocol::UDP)
            .and_then(|s| {
                s.bind(&socket2::SockAddr::from(if relay.is_ipv4() {
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
                } else {
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
                }))?;
                UdpSocket::from_std(s.into())
            })
            .map_err(|e| self.unreachable(format!("UDP socket setup failed: {e}")))?;
        socket
            .connect(relay)
            .await
            .map_err(|e| self.unreachable(format!("UDP relay {relay}: {e}")))?;

        debug!(proxy = %self.config, relay = %relay, destination = %destination, "UDP association established");

        Ok(DatagramTunnel::Socks {
            control,
            socket,
            target: destination,
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }
}

fn handshake_io(err: io::Error) -> ConnectError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ConnectError::rejected("proxy closed during handshake")
    } else {
        ConnectError::rejected(format!("handshake I/O: {err}"))
    }
}

// ============================================
// Tests
// ============================================
