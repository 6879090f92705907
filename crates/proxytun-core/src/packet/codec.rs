// ============================================
// File: crates/proxytun-core/src/packet/codec.rs
// ============================================
//! # Packet Codec
//!
//! ## Creation Reason
//! Parses datagrams read from the TUN device and synthesizes the TCP/UDP
//! packets written back to it on behalf of remote hosts.
//!
//! ## Parsing Strategy
//! 1. Check the version nibble and dispatch to the IPv4 or IPv6 parser
//! 2. Validate header length fields against the buffer
//! 3. Reject fragments and non-TCP/UDP protocols as `Unsupported`
//! 4. Extract ports, TCP fields and the MSS option
//! 5. Slice the payload out of the original buffer without copying
//!
//! ## Build Strategy
//! The transport segment is assembled first so its checksum can be
//! computed over the pseudo-header, then the IP header is prepended.
//!
//! ## ⚠️ Important Note for Next Developer
//! - Checksums are NOT verified on parse; the kernel already did
//! - The `key` handed to a builder is the addressing of the packet being
//!   built. Replies to a flow pass `flow_key.reversed()`.
//! - A key mixing IPv4 and IPv6 endpoints is built as IPv6 with the IPv4
//!   side mapped (`::ffff:a.b.c.d`)
//!
//! ## Last Modified
//! v0.1.0 - Initial codec implementation

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use proxytun_common::{FlowKey, TransportProtocol};

use super::checksum;
use super::{IpVersion, Packet, TcpFlags, TcpHeader, TransportHeader};
use crate::error::{ParseError, Result};

// ============================================
// Constants
// ============================================

/// Minimum IPv4 header length.
pub const IPV4_HEADER_LEN: usize = 20;

/// Fixed IPv6 header length.
pub const IPV6_HEADER_LEN: usize = 40;

/// TCP header length without options.
pub const TCP_HEADER_LEN: usize = 20;

/// UDP header length.
pub const UDP_HEADER_LEN: usize = 8;

/// Receive window advertised in synthesized segments.
pub const DEFAULT_WINDOW: u16 = 65_535;

const DEFAULT_TTL: u8 = 64;
const IPV4_FLAG_DF: u16 = 0x4000;
const IPV4_FLAG_MF: u16 = 0x2000;
const IPV4_FRAGMENT_OFFSET: u16 = 0x1fff;

const TCP_OPT_END: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_MSS: u8 = 2;
const TCP_OPT_MSS_LEN: usize = 4;

const TCP_CHECKSUM_OFFSET: usize = 16;
const UDP_CHECKSUM_OFFSET: usize = 6;

// ============================================
// TcpSegment
// ============================================

/// Description of a TCP segment to synthesize.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    /// Addressing of the segment (source = sender of this segment).
    pub key: FlowKey,
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgment number.
    pub ack: u32,
    /// Control bits.
    pub flags: TcpFlags,
    /// Advertised window.
    pub window: u16,
    /// MSS option to include (SYN segments only).
    pub mss: Option<u16>,
    /// Segment payload.
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Creates an empty segment with the default window and no options.
    #[must_use]
    pub const fn new(key: FlowKey, seq: u32, ack: u32, flags: TcpFlags) -> Self {
        Self {
            key,
            seq,
            ack,
            flags,
            window: DEFAULT_WINDOW,
            mss: None,
            payload: &[],
        }
    }

    /// Sets the payload.
    #[must_use]
    pub const fn with_payload(mut self, payload: &'a [u8]) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the advertised window.
    #[must_use]
    pub const fn with_window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    /// Adds an MSS option.
    #[must_use]
    pub const fn with_mss(mut self, mss: u16) -> Self {
        self.mss = Some(mss);
        self
    }
}

// ============================================
// PacketCodec
// ============================================

/// Stateless IPv4/IPv6 TCP/UDP parser and builder.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl PacketCodec {
    // ========================================
    // Parsing
    // ========================================

    /// Parses a datagram read from the TUN device.
    ///
    /// # Errors
    /// - `TooShort` if the buffer ends before a header or declared length
    /// - `Malformed` if header length fields are inconsistent
    /// - `Unsupported` for fragments, unknown versions, and protocols other
    ///   than TCP/UDP
    pub fn parse(bytes: Bytes) -> Result<Packet> {
        let first = *bytes.first().ok_or(ParseError::too_short(1, 0))?;
        match first >> 4 {
            4 => Self::parse_ipv4(bytes),
            6 => Self::parse_ipv6(bytes),
            v => Err(ParseError::unsupported(format!("IP version {v}"))),
        }
    }

    fn parse_ipv4(bytes: Bytes) -> Result<Packet> {
        if bytes.len() < IPV4_HEADER_LEN {
            return Err(ParseError::too_short(IPV4_HEADER_LEN, bytes.len()));
        }

        let ihl = usize::from(bytes[0] & 0x0f) * 4;
        if ihl < IPV4_HEADER_LEN {
            return Err(ParseError::malformed(format!("IPv4 header length {ihl}")));
        }

        let total = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
        if total < ihl {
            return Err(ParseError::malformed(format!(
                "IPv4 total length {total} shorter than header {ihl}"
            )));
        }
        if bytes.len() < total {
            return Err(ParseError::too_short(total, bytes.len()));
        }

        let fragment = u16::from_be_bytes([bytes[6], bytes[7]]);
        if fragment & IPV4_FLAG_MF != 0 || fragment & IPV4_FRAGMENT_OFFSET != 0 {
            return Err(ParseError::unsupported("IPv4 fragment"));
        }

        let protocol = bytes[9];
        let src = Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]);
        let dst = Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]);

        Self::parse_transport(
            IpVersion::V4,
            protocol,
            src.into(),
            dst.into(),
            bytes.slice(..total),
            ihl,
        )
    }

    fn parse_ipv6(bytes: Bytes) -> Result<Packet> {
        if bytes.len() < IPV6_HEADER_LEN {
            return Err(ParseError::too_short(IPV6_HEADER_LEN, bytes.len()));
        }

        let total = IPV6_HEADER_LEN + usize::from(u16::from_be_bytes([bytes[4], bytes[5]]));
        if bytes.len() < total {
            return Err(ParseError::too_short(total, bytes.len()));
        }

        let next_header = bytes[6];
        let mut src = [0u8; 16];
        src.copy_from_slice(&bytes[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&bytes[24..40]);

        Self::parse_transport(
            IpVersion::V6,
            next_header,
            Ipv6Addr::from(src).into(),
            Ipv6Addr::from(dst).into(),
            bytes.slice(..total),
            IPV6_HEADER_LEN,
        )
    }

    fn parse_transport(
        version: IpVersion,
        number: u8,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        raw: Bytes,
        offset: usize,
    ) -> Result<Packet> {
        let protocol = TransportProtocol::from_number(number)
            .ok_or_else(|| ParseError::unsupported(format!("{version} protocol {number}")))?;
        let segment = &raw[offset..];

        let (src_port, dst_port, transport, payload) = match protocol {
            TransportProtocol::Tcp => {
                if segment.len() < TCP_HEADER_LEN {
                    return Err(ParseError::too_short(offset + TCP_HEADER_LEN, raw.len()));
                }
                let data_offset = usize::from(segment[12] >> 4) * 4;
                if data_offset < TCP_HEADER_LEN {
                    return Err(ParseError::malformed(format!("TCP data offset {data_offset}")));
                }
                if data_offset > segment.len() {
                    return Err(ParseError::too_short(offset + data_offset, raw.len()));
                }

                let header = TcpHeader {
                    seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
                    ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
                    flags: TcpFlags::from_bits(segment[13]),
                    window: u16::from_be_bytes([segment[14], segment[15]]),
                    mss: Self::find_mss(&segment[TCP_HEADER_LEN..data_offset]),
                };
                (
                    u16::from_be_bytes([segment[0], segment[1]]),
                    u16::from_be_bytes([segment[2], segment[3]]),
                    TransportHeader::Tcp(header),
                    raw.slice(offset + data_offset..),
                )
            }
            TransportProtocol::Udp => {
                if segment.len() < UDP_HEADER_LEN {
                    return Err(ParseError::too_short(offset + UDP_HEADER_LEN, raw.len()));
                }
                let length = usize::from(u16::from_be_bytes([segment[4], segment[5]]));
                if length < UDP_HEADER_LEN {
                    return Err(ParseError::malformed(format!("UDP length {length}")));
                }
                if length > segment.len() {
                    return Err(ParseError::too_short(offset + length, raw.len()));
                }
                (
                    u16::from_be_bytes([segment[0], segment[1]]),
                    u16::from_be_bytes([segment[2], segment[3]]),
                    TransportHeader::Udp,
                    raw.slice(offset + UDP_HEADER_LEN..offset + length),
                )
            }
        };

        Ok(Packet {
            version,
            key: FlowKey::new(
                protocol,
                SocketAddr::new(src_ip, src_port),
                SocketAddr::new(dst_ip, dst_port),
            ),
            transport,
            payload,
            raw,
        })
    }

    /// Walks TCP options looking for MSS. Stops at the first malformed
    /// option.
    fn find_mss(options: &[u8]) -> Option<u16> {
        let mut i = 0;
        while i < options.len() {
            match options[i] {
                TCP_OPT_END => break,
                TCP_OPT_NOP => i += 1,
                kind => {
                    let len = usize::from(*options.get(i + 1)?);
                    if len < 2 || i + len > options.len() {
                        return None;
                    }
                    if kind == TCP_OPT_MSS && len == TCP_OPT_MSS_LEN {
                        return Some(u16::from_be_bytes([options[i + 2], options[i + 3]]));
                    }
                    i += len;
                }
            }
        }
        None
    }

    // ========================================
    // Building
    // ========================================

    /// Builds a TCP packet with the default window and no options.
    ///
    /// `key` is the addressing of the packet being built.
    #[must_use]
    pub fn build_tcp(key: &FlowKey, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Bytes {
        Self::build_tcp_segment(&TcpSegment::new(*key, seq, ack, flags).with_payload(payload))
    }

    /// Builds a TCP packet from a full segment description.
    ///
    /// The payload must fit in a single IP datagram.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build_tcp_segment(segment: &TcpSegment<'_>) -> Bytes {
        let header_len = TCP_HEADER_LEN + if segment.mss.is_some() { TCP_OPT_MSS_LEN } else { 0 };
        let mut tcp = BytesMut::with_capacity(header_len + segment.payload.len());

        tcp.put_u16(segment.key.src.port());
        tcp.put_u16(segment.key.dst.port());
        tcp.put_u32(segment.seq);
        tcp.put_u32(segment.ack);
        tcp.put_u8(((header_len / 4) as u8) << 4);
        tcp.put_u8(segment.flags.bits());
        tcp.put_u16(segment.window);
        tcp.put_u16(0); // checksum
        tcp.put_u16(0); // urgent pointer
        if let Some(mss) = segment.mss {
            tcp.put_u8(TCP_OPT_MSS);
            tcp.put_u8(TCP_OPT_MSS_LEN as u8);
            tcp.put_u16(mss);
        }
        tcp.put_slice(segment.payload);

        Self::wrap(&segment.key, tcp, TCP_CHECKSUM_OFFSET)
    }

    /// Builds a UDP packet.
    ///
    /// `key` is the addressing of the packet being built. The payload must
    /// fit in a single IP datagram.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build_udp(key: &FlowKey, payload: &[u8]) -> Bytes {
        let length = UDP_HEADER_LEN + payload.len();
        let mut udp = BytesMut::with_capacity(length);

        udp.put_u16(key.src.port());
        udp.put_u16(key.dst.port());
        udp.put_u16(length as u16);
        udp.put_u16(0); // checksum
        udp.put_slice(payload);

        Self::wrap(key, udp, UDP_CHECKSUM_OFFSET)
    }

    /// Fills in the transport checksum and prepends the IP header.
    #[allow(clippy::cast_possible_truncation)]
    fn wrap(key: &FlowKey, mut segment: BytesMut, checksum_at: usize) -> Bytes {
        let src = key.src.ip();
        let dst = key.dst.ip();
        let protocol = key.protocol.number();

        let mut sum = checksum::transport(src, dst, protocol, &segment);
        if sum == 0 && key.protocol == TransportProtocol::Udp {
            sum = 0xffff;
        }
        segment[checksum_at..checksum_at + 2].copy_from_slice(&sum.to_be_bytes());

        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                let total = IPV4_HEADER_LEN + segment.len();
                let mut packet = BytesMut::with_capacity(total);
                packet.put_u8(0x45);
                packet.put_u8(0); // DSCP/ECN
                packet.put_u16(total as u16);
                packet.put_u16(0); // identification
                packet.put_u16(IPV4_FLAG_DF);
                packet.put_u8(DEFAULT_TTL);
                packet.put_u8(protocol);
                packet.put_u16(0); // header checksum
                packet.put_slice(&s.octets());
                packet.put_slice(&d.octets());

                let header_sum = checksum::ipv4_header(&packet[..IPV4_HEADER_LEN]);
                packet[10..12].copy_from_slice(&header_sum.to_be_bytes());
                packet.put_slice(&segment);
                packet.freeze()
            }
            (s, d) => {
                let mut packet = BytesMut::with_capacity(IPV6_HEADER_LEN + segment.len());
                packet.put_u32(0x6000_0000);
                packet.put_u16(segment.len() as u16);
                packet.put_u8(protocol);
                packet.put_u8(DEFAULT_TTL);
                packet.put_slice(&as_v6(s).octets());
                packet.put_slice(&as_v6(d).octets());
                packet.put_slice(&segment);
                packet.freeze()
            }
        }
    }
}

fn as_v6(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_key() -> FlowKey {
        FlowKey::new(
            TransportProtocol::Tcp,
            "10.0.0.2:40000".parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
        )
    }

    fn udp6_key() -> FlowKey {
        FlowKey::new(
            TransportProtocol::Udp,
            "[fd00::2]:5353".parse().unwrap(),
            "[2001:4860:4860::8888]:53".parse().unwrap(),
        )
    }

    fn transport_checksum_ok(packet: &Packet) -> bool {
        let raw = packet.as_bytes();
        let offset = match packet.version() {
            IpVersion::V4 => usize::from(raw[0] & 0x0f) * 4,
            IpVersion::V6 => IPV6_HEADER_LEN,
        };
        checksum::verify_transport(
            packet.src().ip(),
            packet.dst().ip(),
            packet.protocol().number(),
            &raw[offset..],
        )
    }

    #[test]
    fn test_syn_with_mss() {
        let syn = TcpSegment::new(tcp_key(), 1000, 0, TcpFlags::SYN).with_mss(1460);
        let packet = PacketCodec::parse(PacketCodec::build_tcp_segment(&syn)).unwrap();

        assert_eq!(packet.version(), IpVersion::V4);
        assert_eq!(packet.key(), tcp_key());
        assert!(packet.is_new_flow_trigger());
        let tcp = packet.tcp().unwrap();
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.mss, Some(1460));
        assert_eq!(tcp.window, DEFAULT_WINDOW);
        assert!(packet.payload().is_empty());
    }

    #[test]
    fn test_built_ipv4_checksums_valid() {
        let bytes = PacketCodec::build_tcp(
            &tcp_key().reversed(),
            7,
            1001,
            TcpFlags::PSH | TcpFlags::ACK,
            b"hello world",
        );
        assert_eq!(bytes[8], DEFAULT_TTL);
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), IPV4_FLAG_DF);
        assert!(checksum::verify_ipv4_header(&bytes[..IPV4_HEADER_LEN]));

        let packet = PacketCodec::parse(bytes).unwrap();
        assert!(transport_checksum_ok(&packet));
        assert_eq!(packet.payload().as_ref(), b"hello world");
        assert!(!packet.is_new_flow_trigger());
    }

    #[test]
    fn test_ipv6_udp() {
        let bytes = PacketCodec::build_udp(&udp6_key(), b"\x12\x34query");
        assert_eq!(bytes[0] >> 4, 6);

        let packet = PacketCodec::parse(bytes).unwrap();
        assert_eq!(packet.version(), IpVersion::V6);
        assert_eq!(packet.key(), udp6_key());
        assert_eq!(packet.payload().as_ref(), b"\x12\x34query");
        assert!(packet.is_new_flow_trigger());
        assert!(transport_checksum_ok(&packet));
    }

    #[test]
    fn test_trailing_bytes_trimmed() {
        let mut raw = BytesMut::from(&PacketCodec::build_udp(&udp6_key(), b"abc")[..]);
        raw.put_slice(&[0xee; 5]);
        let packet = PacketCodec::parse(raw.freeze()).unwrap();
        assert_eq!(packet.payload().as_ref(), b"abc");
    }

    #[test]
    fn test_fragment_unsupported() {
        let mut raw = BytesMut::from(&PacketCodec::build_tcp(&tcp_key(), 1, 0, TcpFlags::SYN, &[])[..]);
        raw[6] |= 0x20; // MF
        let err = PacketCodec::parse(raw.clone().freeze()).unwrap_err();
        assert!(err.is_unsupported());

        raw[6] = 0x00;
        raw[7] = 0x10; // offset 16
        assert!(PacketCodec::parse(raw.freeze()).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_icmp_unsupported() {
        let mut raw = BytesMut::from(&PacketCodec::build_tcp(&tcp_key(), 1, 0, TcpFlags::SYN, &[])[..]);
        raw[9] = 1;
        assert!(PacketCodec::parse(raw.freeze()).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_unknown_version() {
        let err = PacketCodec::parse(Bytes::from_static(&[0x50; 40])).unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(PacketCodec::parse(Bytes::new()).unwrap_err(), ParseError::too_short(1, 0));
    }

    #[test]
    fn test_truncated() {
        let full = PacketCodec::build_tcp(&tcp_key(), 1, 0, TcpFlags::SYN, b"data");
        let err = PacketCodec::parse(full.slice(..30)).unwrap_err();
        assert!(matches!(err, ParseError::TooShort { .. }));

        let err = PacketCodec::parse(full.slice(..12)).unwrap_err();
        assert_eq!(err, ParseError::too_short(IPV4_HEADER_LEN, 12));
    }

    #[test]
    fn test_malformed_header_lengths() {
        let mut raw = BytesMut::from(&PacketCodec::build_tcp(&tcp_key(), 1, 0, TcpFlags::SYN, &[])[..]);
        raw[0] = 0x44; // IHL 16 bytes
        assert!(matches!(
            PacketCodec::parse(raw.clone().freeze()),
            Err(ParseError::Malformed { .. })
        ));

        raw[0] = 0x45;
        raw[IPV4_HEADER_LEN + 12] = 0x20; // data offset 8 bytes
        assert!(matches!(PacketCodec::parse(raw.freeze()), Err(ParseError::Malformed { .. })));
    }

    #[test]
    fn test_mss_option_walk() {
        assert_eq!(PacketCodec::find_mss(&[1, 1, 2, 4, 0x05, 0xb4]), Some(1460));
        assert_eq!(PacketCodec::find_mss(&[4, 2, 2, 4, 0x02, 0x18]), Some(536));
        assert_eq!(PacketCodec::find_mss(&[0, 2, 4, 0x05, 0xb4]), None);
        assert_eq!(PacketCodec::find_mss(&[8, 0]), None);
        assert_eq!(PacketCodec::find_mss(&[2]), None);
    }

    #[test]
    fn test_mixed_family_builds_ipv6() {
        let key = FlowKey::new(
            TransportProtocol::Udp,
            "10.0.0.1:53".parse().unwrap(),
            "[fd00::2]:5353".parse().unwrap(),
        );
        let packet = PacketCodec::parse(PacketCodec::build_udp(&key, b"x")).unwrap();
        assert_eq!(packet.version(), IpVersion::V6);
        assert!(transport_checksum_ok(&packet));
    }
}
