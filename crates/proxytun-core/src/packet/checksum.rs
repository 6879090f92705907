// ============================================
// File: crates/proxytun-core/src/packet/checksum.rs
// ============================================
//! Internet checksum (RFC 1071) for IPv4 headers and TCP/UDP segments.
//!
//! Summing a region that already contains a correct checksum yields zero,
//! which is how [`verify_ipv4_header`] and [`verify_transport`] work.

use std::net::IpAddr;

/// Adds `data` to a running 32-bit one's-complement accumulator.
#[must_use]
pub fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([pair[0], pair[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Folds the accumulator and returns its one's complement.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of an IPv4 header whose checksum field is zeroed.
#[must_use]
pub fn ipv4_header(header: &[u8]) -> u16 {
    finish(accumulate(0, header))
}

fn pseudo_header(src: IpAddr, dst: IpAddr, protocol: u8, length: usize) -> u32 {
    let sum = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => accumulate(accumulate(0, &s.octets()), &d.octets()),
        (s, d) => {
            let s = to_v6(s);
            let d = to_v6(d);
            accumulate(accumulate(0, &s.octets()), &d.octets())
        }
    };
    #[allow(clippy::cast_possible_truncation)]
    let length = length as u32;
    sum.wrapping_add(u32::from(protocol))
        .wrapping_add(length >> 16)
        .wrapping_add(length & 0xffff)
}

fn to_v6(addr: IpAddr) -> std::net::Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Checksum of a TCP or UDP segment (checksum field zeroed) including the
/// pseudo-header for `src`/`dst`.
///
/// A UDP checksum that computes to zero is transmitted as `0xffff`; the
/// caller applies that rule.
#[must_use]
pub fn transport(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    finish(accumulate(pseudo_header(src, dst, protocol, segment.len()), segment))
}

/// Returns `true` if the IPv4 header checksum is correct.
#[must_use]
pub fn verify_ipv4_header(header: &[u8]) -> bool {
    finish(accumulate(0, header)) == 0
}

/// Returns `true` if the TCP/UDP checksum in `segment` is correct.
#[must_use]
pub fn verify_transport(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> bool {
    transport(src, dst, protocol, segment) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1071_example() {
        // Example bytes from RFC 1071 section 3.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(finish(accumulate(0, &data)), !0xddf2);
    }

    #[test]
    fn test_odd_length() {
        assert_eq!(accumulate(0, &[0xab]), 0xab00);
    }

    #[test]
    fn test_ipv4_header_known_value() {
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let sum = ipv4_header(&header);
        assert_eq!(sum, 0xb861);
        header[10..12].copy_from_slice(&sum.to_be_bytes());
        assert!(verify_ipv4_header(&header));
    }
}
