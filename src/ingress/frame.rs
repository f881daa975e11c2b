//! Defensive Ethernet/IPv4/UDP frame classification.
//!
//! Every length field is checked against the captured frame before any
//! deeper read. A frame longer than its declared IP length is fine
//! (Ethernet padding); a frame shorter than declared is rejected.

use std::net::Ipv4Addr;

use thiserror::Error;

/// Ethernet header size in bytes.
pub const ETH_HEADER_SIZE: usize = 14;

/// Minimum IPv4 header size in bytes.
pub const IPV4_MIN_HEADER_SIZE: usize = 20;

/// UDP header size in bytes.
pub const UDP_HEADER_SIZE: usize = 8;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const IPPROTO_UDP: u8 = 17;

/// Reasons a frame never reaches dispatch. None of these are fatal.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("runt frame: {size} bytes")]
    Runt { size: usize },

    #[error("unhandled ethertype {raw:#06x}")]
    UnhandledEtherType { raw: u16 },

    #[error("IP version {raw} is not 4")]
    BadIpVersion { raw: u8 },

    #[error("IP header truncated or inconsistent")]
    IpHeaderTruncated,

    #[error("IP total length {declared} exceeds captured frame {captured}")]
    IpLengthOverrun { declared: usize, captured: usize },

    #[error("IP protocol {protocol} is not UDP")]
    NotUdp { protocol: u8 },

    #[error("datagram for {destination} is not ours")]
    ForeignDestination { destination: Ipv4Addr },

    #[error("UDP header truncated")]
    UdpHeaderTruncated,

    #[error("UDP length {declared} exceeds captured frame {captured}")]
    UdpLengthOverrun { declared: usize, captured: usize },
}

/// Reassembly key: one per in-flight fragmented datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src_ip: Ipv4Addr,
    pub ident: u16,
    pub protocol: u8,
}

/// An IPv4 fragment bound for the reassembly table.
#[derive(Debug, Clone, Copy)]
pub struct FragmentInfo {
    pub key: FragmentKey,
    /// Byte offset of this fragment's payload within the full datagram.
    pub offset: usize,
    pub more_fragments: bool,
    /// Start of the IP payload within the captured frame.
    pub payload_offset: usize,
    /// Declared IP payload bytes present in this fragment.
    pub payload_len: usize,
}

/// A complete UDP datagram addressed to this host.
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Start of the UDP payload within the captured frame.
    pub payload_offset: usize,
    pub payload_len: usize,
}

/// What a captured frame turned out to be.
#[derive(Debug)]
pub enum FrameClass {
    /// Complete UDP datagram for this host; dispatch by destination port.
    Udp(UdpDatagram),
    /// IPv4 fragment for this host; hand to the reassembly table.
    Fragment(FragmentInfo),
    /// ARP frame; the responder decides whether it is ours to answer.
    Arp,
}

#[inline]
fn read_u16_be(data: &[u8], offset: usize) -> u16 {
    let bytes: [u8; 2] = data[offset..offset + 2]
        .try_into()
        .expect("slice of length 2");
    u16::from_be_bytes(bytes)
}

/// Classify one captured frame.
pub fn classify(frame: &[u8], my_ip: Ipv4Addr) -> Result<FrameClass, FrameError> {
    if frame.len() < ETH_HEADER_SIZE {
        return Err(FrameError::Runt { size: frame.len() });
    }

    let ethertype = read_u16_be(frame, 12);
    if ethertype == ETHERTYPE_ARP {
        return Ok(FrameClass::Arp);
    }
    if ethertype != ETHERTYPE_IPV4 {
        return Err(FrameError::UnhandledEtherType { raw: ethertype });
    }

    if frame.len() < ETH_HEADER_SIZE + IPV4_MIN_HEADER_SIZE {
        return Err(FrameError::IpHeaderTruncated);
    }

    let ip = &frame[ETH_HEADER_SIZE..];
    let version = ip[0] >> 4;
    if version != 4 {
        return Err(FrameError::BadIpVersion { raw: version });
    }

    let ihl = usize::from(ip[0] & 0x0F) * 4;
    if ihl < IPV4_MIN_HEADER_SIZE || frame.len() < ETH_HEADER_SIZE + ihl {
        return Err(FrameError::IpHeaderTruncated);
    }

    let total_len = usize::from(read_u16_be(ip, 2));
    if total_len < ihl {
        return Err(FrameError::IpHeaderTruncated);
    }
    // Shorter-than-captured is Ethernet padding and fine; longer is not.
    if total_len + ETH_HEADER_SIZE > frame.len() {
        return Err(FrameError::IpLengthOverrun {
            declared: total_len + ETH_HEADER_SIZE,
            captured: frame.len(),
        });
    }

    let protocol = ip[9];
    if protocol != IPPROTO_UDP {
        return Err(FrameError::NotUdp { protocol });
    }

    let dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
    if dst_ip != my_ip {
        return Err(FrameError::ForeignDestination {
            destination: dst_ip,
        });
    }

    let src_ip = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);

    let frag_field = read_u16_be(ip, 6);
    let more_fragments = frag_field & 0x2000 != 0;
    let fragment_offset = usize::from(frag_field & 0x1FFF) * 8;
    if more_fragments || fragment_offset > 0 {
        return Ok(FrameClass::Fragment(FragmentInfo {
            key: FragmentKey {
                src_ip,
                ident: read_u16_be(ip, 4),
                protocol,
            },
            offset: fragment_offset,
            more_fragments,
            payload_offset: ETH_HEADER_SIZE + ihl,
            payload_len: total_len - ihl,
        }));
    }

    if total_len < ihl + UDP_HEADER_SIZE {
        return Err(FrameError::UdpHeaderTruncated);
    }

    let udp = &ip[ihl..];
    let udp_len = usize::from(read_u16_be(udp, 4));
    if udp_len < UDP_HEADER_SIZE {
        return Err(FrameError::UdpHeaderTruncated);
    }
    if udp_len + ihl + ETH_HEADER_SIZE > frame.len() {
        return Err(FrameError::UdpLengthOverrun {
            declared: udp_len + ihl + ETH_HEADER_SIZE,
            captured: frame.len(),
        });
    }

    Ok(FrameClass::Udp(UdpDatagram {
        src_ip,
        src_port: read_u16_be(udp, 0),
        dst_port: read_u16_be(udp, 2),
        payload_offset: ETH_HEADER_SIZE + ihl + UDP_HEADER_SIZE,
        payload_len: udp_len - UDP_HEADER_SIZE,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 42);

    /// Build an Ethernet/IPv4/UDP frame around `payload`.
    pub(crate) fn build_udp_frame(
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let udp_len = UDP_HEADER_SIZE + payload.len();
        let total_len = IPV4_MIN_HEADER_SIZE + udp_len;

        let mut frame = Vec::with_capacity(ETH_HEADER_SIZE + total_len);
        frame.extend_from_slice(&[0x02; 6]); // dst mac
        frame.extend_from_slice(&[0x04; 6]); // src mac
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        frame.push(0x45); // v4, ihl 20
        frame.push(0);
        frame.extend_from_slice(&(total_len as u16).to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes()); // ident
        frame.extend_from_slice(&0u16.to_be_bytes()); // flags/frag
        frame.push(64); // ttl
        frame.push(IPPROTO_UDP);
        frame.extend_from_slice(&0u16.to_be_bytes()); // checksum
        frame.extend_from_slice(&src_ip.octets());
        frame.extend_from_slice(&dst_ip.octets());

        frame.extend_from_slice(&src_port.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&(udp_len as u16).to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes()); // checksum
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_classify_udp() {
        let frame = build_udp_frame(Ipv4Addr::new(10, 0, 0, 1), MY_IP, 4000, 58913, b"hello");
        let class = classify(&frame, MY_IP).expect("classify");

        let FrameClass::Udp(dgram) = class else {
            panic!("expected Udp");
        };
        assert_eq!(dgram.src_port, 4000);
        assert_eq!(dgram.dst_port, 58913);
        assert_eq!(
            &frame[dgram.payload_offset..dgram.payload_offset + dgram.payload_len],
            b"hello"
        );
    }

    #[test]
    fn test_ethernet_padding_tolerated() {
        let mut frame = build_udp_frame(Ipv4Addr::new(10, 0, 0, 1), MY_IP, 1, 2, b"x");
        frame.extend_from_slice(&[0u8; 18]); // pad to minimum wire size
        assert!(matches!(
            classify(&frame, MY_IP).expect("classify"),
            FrameClass::Udp(_)
        ));
    }

    #[test]
    fn test_declared_longer_than_captured_rejected() {
        let mut frame = build_udp_frame(Ipv4Addr::new(10, 0, 0, 1), MY_IP, 1, 2, b"abcdef");
        frame.truncate(frame.len() - 3);
        assert!(matches!(
            classify(&frame, MY_IP).unwrap_err(),
            FrameError::IpLengthOverrun { .. }
        ));
    }

    #[test]
    fn test_udp_length_overrun_rejected() {
        let mut frame = build_udp_frame(Ipv4Addr::new(10, 0, 0, 1), MY_IP, 1, 2, b"abc");
        // Inflate the UDP length field past the captured frame.
        let udp_len_at = ETH_HEADER_SIZE + IPV4_MIN_HEADER_SIZE + 4;
        frame[udp_len_at..udp_len_at + 2].copy_from_slice(&500u16.to_be_bytes());
        // Keep ip.tot_len consistent with the capture so the UDP check is hit.
        assert!(matches!(
            classify(&frame, MY_IP).unwrap_err(),
            FrameError::UdpLengthOverrun { .. }
        ));
    }

    #[test]
    fn test_arp_classified() {
        let mut frame = vec![0u8; 42];
        frame[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        assert!(matches!(
            classify(&frame, MY_IP).expect("classify"),
            FrameClass::Arp
        ));
    }

    #[test]
    fn test_unhandled_ethertype() {
        let mut frame = vec![0u8; 60];
        frame[12..14].copy_from_slice(&0x86DDu16.to_be_bytes()); // IPv6
        assert!(matches!(
            classify(&frame, MY_IP).unwrap_err(),
            FrameError::UnhandledEtherType { raw: 0x86DD }
        ));
    }

    #[test]
    fn test_non_udp_protocol() {
        let mut frame = build_udp_frame(Ipv4Addr::new(10, 0, 0, 1), MY_IP, 1, 2, b"x");
        frame[ETH_HEADER_SIZE + 9] = 6; // TCP
        assert!(matches!(
            classify(&frame, MY_IP).unwrap_err(),
            FrameError::NotUdp { protocol: 6 }
        ));
    }

    #[test]
    fn test_foreign_destination() {
        let other = Ipv4Addr::new(10, 0, 0, 99);
        let frame = build_udp_frame(Ipv4Addr::new(10, 0, 0, 1), other, 1, 2, b"x");
        assert!(matches!(
            classify(&frame, MY_IP).unwrap_err(),
            FrameError::ForeignDestination { destination } if destination == other
        ));
    }

    #[test]
    fn test_runt_frame() {
        assert!(matches!(
            classify(&[0u8; 9], MY_IP).unwrap_err(),
            FrameError::Runt { size: 9 }
        ));
    }

    #[test]
    fn test_fragment_detected() {
        let mut frame = build_udp_frame(Ipv4Addr::new(10, 0, 0, 7), MY_IP, 1, 2, b"fragment");
        // ident 77, more-fragments set, offset 0.
        frame[ETH_HEADER_SIZE + 4..ETH_HEADER_SIZE + 6].copy_from_slice(&77u16.to_be_bytes());
        frame[ETH_HEADER_SIZE + 6..ETH_HEADER_SIZE + 8].copy_from_slice(&0x2000u16.to_be_bytes());

        let FrameClass::Fragment(info) = classify(&frame, MY_IP).expect("classify") else {
            panic!("expected Fragment");
        };
        assert_eq!(info.key.ident, 77);
        assert_eq!(info.key.src_ip, Ipv4Addr::new(10, 0, 0, 7));
        assert!(info.more_fragments);
        assert_eq!(info.offset, 0);
        assert_eq!(info.payload_len, UDP_HEADER_SIZE + 8);
    }

    #[test]
    fn test_trailing_fragment_offset() {
        let mut frame = build_udp_frame(Ipv4Addr::new(10, 0, 0, 7), MY_IP, 1, 2, b"tail");
        // offset 185 * 8, no more fragments.
        frame[ETH_HEADER_SIZE + 6..ETH_HEADER_SIZE + 8].copy_from_slice(&185u16.to_be_bytes());

        let FrameClass::Fragment(info) = classify(&frame, MY_IP).expect("classify") else {
            panic!("expected Fragment");
        };
        assert!(!info.more_fragments);
        assert_eq!(info.offset, 185 * 8);
    }
}
