// Copyright (c) Abstract Machines

//! Minimal link/network/transport decoding, enough to pull the port pair
//! out of a captured Ethernet frame.

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV6_HEADER_LEN: usize = 40;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSummary {
    pub transport: Transport,
    pub src_port: u16,
    pub dst_port: u16,
    /// Length of the whole captured frame.
    pub length: usize,
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Decodes an Ethernet frame carrying TCP or UDP over IPv4/IPv6.
///
/// Returns `None` for anything else, including truncated frames and
/// non-first IPv4 fragments (which carry no transport header).
pub fn parse_ethernet(frame: &[u8]) -> Option<PacketSummary> {
    let mut offset = ETHERNET_HEADER_LEN - 2;
    let mut ethertype = read_u16(frame, offset)?;
    offset += 2;

    if ethertype == ETHERTYPE_VLAN {
        ethertype = read_u16(frame, offset + 2)?;
        offset += VLAN_TAG_LEN;
    }

    let (protocol, transport_offset) = match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(frame, offset)?,
        ETHERTYPE_IPV6 => {
            let next_header = *frame.get(offset + 6)?;
            (next_header, offset + IPV6_HEADER_LEN)
        }
        _ => return None,
    };

    let transport = match protocol {
        PROTO_TCP => Transport::Tcp,
        PROTO_UDP => Transport::Udp,
        _ => return None,
    };

    Some(PacketSummary {
        transport,
        src_port: read_u16(frame, transport_offset)?,
        dst_port: read_u16(frame, transport_offset + 2)?,
        length: frame.len(),
    })
}

fn parse_ipv4(frame: &[u8], offset: usize) -> Option<(u8, usize)> {
    let version_ihl = *frame.get(offset)?;
    if version_ihl >> 4 != 4 {
        return None;
    }
    let header_len = usize::from(version_ihl & 0x0f) * 4;
    if header_len < 20 {
        return None;
    }

    let fragment = read_u16(frame, offset + 6)?;
    if fragment & 0x1fff != 0 {
        return None;
    }

    let protocol = *frame.get(offset + 9)?;
    Some((protocol, offset + header_len))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ipv4_frame(protocol: u8, src_port: u16, dst_port: u16, payload: usize) -> Vec<u8> {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = protocol;
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&src_port.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend(std::iter::repeat(0u8).take(4 + payload));
        frame
    }

    #[test]
    fn test_parse_ipv4_udp() {
        let frame = ipv4_frame(PROTO_UDP, 1234, 1235, 25);
        let summary = parse_ethernet(&frame).unwrap();

        assert_eq!(summary.transport, Transport::Udp);
        assert_eq!(summary.src_port, 1234);
        assert_eq!(summary.dst_port, 1235);
        assert_eq!(summary.length, frame.len());
    }

    #[test]
    fn test_parse_ipv4_tcp_with_options() {
        let mut frame = ipv4_frame(PROTO_TCP, 40000, 1234, 0);
        // Grow the IP header to 24 bytes by inserting one option word.
        frame[14] = 0x46;
        frame.splice(34..34, [1u8, 1, 1, 1]);

        let summary = parse_ethernet(&frame).unwrap();
        assert_eq!(summary.transport, Transport::Tcp);
        assert_eq!(summary.src_port, 40000);
        assert_eq!(summary.dst_port, 1234);
    }

    #[test]
    fn test_parse_ipv6_udp() {
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
        let mut ip = vec![0u8; 40];
        ip[0] = 0x60;
        ip[6] = PROTO_UDP;
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&5000u16.to_be_bytes());
        frame.extend_from_slice(&1236u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 4]);

        let summary = parse_ethernet(&frame).unwrap();
        assert_eq!(summary.src_port, 5000);
        assert_eq!(summary.dst_port, 1236);
    }

    #[test]
    fn test_parse_vlan_tagged() {
        let inner = ipv4_frame(PROTO_UDP, 1, 2, 0);
        let mut frame = inner[..12].to_vec();
        frame.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x64]);
        frame.extend_from_slice(&inner[12..]);

        let summary = parse_ethernet(&frame).unwrap();
        assert_eq!(summary.src_port, 1);
        assert_eq!(summary.dst_port, 2);
    }

    #[test]
    fn test_parse_ignores_other_protocols() {
        // ICMP
        assert!(parse_ethernet(&ipv4_frame(1, 0, 0, 8)).is_none());

        let mut arp = vec![0u8; 12];
        arp.extend_from_slice(&0x0806u16.to_be_bytes());
        arp.extend_from_slice(&[0u8; 28]);
        assert!(parse_ethernet(&arp).is_none());
    }

    #[test]
    fn test_parse_ignores_trailing_fragment() {
        let mut frame = ipv4_frame(PROTO_UDP, 1234, 1235, 0);
        frame[20] = 0x00;
        frame[21] = 0xb9;

        assert!(parse_ethernet(&frame).is_none());
    }

    #[test]
    fn test_parse_truncated_frame() {
        let frame = ipv4_frame(PROTO_TCP, 1234, 1235, 0);

        assert!(parse_ethernet(&frame[..36]).is_none());
        assert!(parse_ethernet(&[]).is_none());
    }
}
