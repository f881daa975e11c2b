//! ARP responder boundary.
//!
//! The farm network has no kernel IP stack on the receive ring, so the
//! node answers ARP itself: a request naming the configured host IP gets a
//! reply built here and transmitted on the same ring; anything else is
//! ignored.

use std::net::Ipv4Addr;

use super::frame::{ETHERTYPE_ARP, ETH_HEADER_SIZE};

/// ARPv4 packet size in bytes (after the Ethernet header).
pub const ARP_PACKET_SIZE: usize = 28;

const HTYPE_ETHERNET: u16 = 1;
const PTYPE_IPV4: u16 = 0x0800;
const OPER_REQUEST: u16 = 1;
const OPER_REPLY: u16 = 2;

/// A parsed ARP request asking for this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpRequest {
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
}

/// Parse `frame` as an ARP request for `my_ip`. Returns `None` for
/// malformed packets, non-requests, and requests for other hosts.
pub fn parse_request(frame: &[u8], my_ip: Ipv4Addr) -> Option<ArpRequest> {
    if frame.len() < ETH_HEADER_SIZE + ARP_PACKET_SIZE {
        return None;
    }

    let arp = &frame[ETH_HEADER_SIZE..];
    let htype = u16::from_be_bytes([arp[0], arp[1]]);
    let ptype = u16::from_be_bytes([arp[2], arp[3]]);
    let oper = u16::from_be_bytes([arp[6], arp[7]]);

    if htype != HTYPE_ETHERNET || ptype != PTYPE_IPV4 || arp[4] != 6 || arp[5] != 4 {
        return None;
    }
    if oper != OPER_REQUEST {
        return None;
    }

    let target_ip = Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]);
    if target_ip != my_ip {
        return None;
    }

    let mut sender_mac = [0u8; 6];
    sender_mac.copy_from_slice(&arp[8..14]);

    Some(ArpRequest {
        sender_mac,
        sender_ip: Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]),
    })
}

/// Build the reply frame for a request we answer.
pub fn build_reply(request: &ArpRequest, my_mac: [u8; 6], my_ip: Ipv4Addr) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HEADER_SIZE + ARP_PACKET_SIZE);

    frame.extend_from_slice(&request.sender_mac);
    frame.extend_from_slice(&my_mac);
    frame.extend_from_slice(&ETHERTYPE_ARP.to_be_bytes());

    frame.extend_from_slice(&HTYPE_ETHERNET.to_be_bytes());
    frame.extend_from_slice(&PTYPE_IPV4.to_be_bytes());
    frame.push(6);
    frame.push(4);
    frame.extend_from_slice(&OPER_REPLY.to_be_bytes());
    frame.extend_from_slice(&my_mac);
    frame.extend_from_slice(&my_ip.octets());
    frame.extend_from_slice(&request.sender_mac);
    frame.extend_from_slice(&request.sender_ip.octets());

    frame
}

/// One-shot responder: the reply frame for `frame`, if it is a request for
/// `my_ip`.
pub fn reply_for(frame: &[u8], my_ip: Ipv4Addr, my_mac: [u8; 6]) -> Option<Vec<u8>> {
    parse_request(frame, my_ip).map(|req| build_reply(&req, my_mac, my_ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 42);
    const MY_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x0a, 0x00, 0x2a];

    fn build_request(target_ip: Ipv4Addr) -> Vec<u8> {
        let sender_mac = [0x04, 0x05, 0x06, 0x07, 0x08, 0x09];
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0xFF; 6]); // broadcast
        frame.extend_from_slice(&sender_mac);
        frame.extend_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        frame.extend_from_slice(&HTYPE_ETHERNET.to_be_bytes());
        frame.extend_from_slice(&PTYPE_IPV4.to_be_bytes());
        frame.push(6);
        frame.push(4);
        frame.extend_from_slice(&OPER_REQUEST.to_be_bytes());
        frame.extend_from_slice(&sender_mac);
        frame.extend_from_slice(&Ipv4Addr::new(10, 0, 0, 1).octets());
        frame.extend_from_slice(&[0u8; 6]); // unknown target mac
        frame.extend_from_slice(&target_ip.octets());
        frame
    }

    #[test]
    fn test_request_for_us_answered() {
        let request = build_request(MY_IP);
        let reply = reply_for(&request, MY_IP, MY_MAC).expect("reply");

        assert_eq!(reply.len(), ETH_HEADER_SIZE + ARP_PACKET_SIZE);
        // Addressed back to the asker, from us.
        assert_eq!(&reply[0..6], &[0x04, 0x05, 0x06, 0x07, 0x08, 0x09]);
        assert_eq!(&reply[6..12], &MY_MAC);
        // Operation is reply; sender protocol address is our IP.
        assert_eq!(
            u16::from_be_bytes([reply[ETH_HEADER_SIZE + 6], reply[ETH_HEADER_SIZE + 7]]),
            OPER_REPLY
        );
        assert_eq!(
            &reply[ETH_HEADER_SIZE + 14..ETH_HEADER_SIZE + 18],
            &MY_IP.octets()
        );
    }

    #[test]
    fn test_request_for_other_host_ignored() {
        let request = build_request(Ipv4Addr::new(10, 0, 0, 7));
        assert!(reply_for(&request, MY_IP, MY_MAC).is_none());
    }

    #[test]
    fn test_reply_packet_ignored() {
        let mut request = build_request(MY_IP);
        request[ETH_HEADER_SIZE + 6..ETH_HEADER_SIZE + 8]
            .copy_from_slice(&OPER_REPLY.to_be_bytes());
        assert!(reply_for(&request, MY_IP, MY_MAC).is_none());
    }

    #[test]
    fn test_truncated_arp_ignored() {
        let mut request = build_request(MY_IP);
        request.truncate(30);
        assert!(reply_for(&request, MY_IP, MY_MAC).is_none());
    }
}
