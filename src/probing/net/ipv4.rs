use crate::probing::config::Protocol;
use crate::probing::error::SendError;
use crate::probing::net::socket::Socket;
use crate::probing::packet::checksum::icmp_ipv4_checksum;
use crate::probing::packet::icmpv4::destination_unreachable::DestinationUnreachablePacket;
use crate::probing::packet::icmpv4::echo_reply::EchoReplyPacket;
use crate::probing::packet::icmpv4::echo_request::EchoRequestPacket;
use crate::probing::packet::icmpv4::time_exceeded::TimeExceededPacket;
use crate::probing::packet::icmpv4::{IcmpCode, IcmpPacket, IcmpType};
use crate::probing::packet::ipv4::Ipv4Packet;
use crate::probing::packet::udp::UdpPacket;
use crate::probing::packet::IpProtocol;
use crate::probing::types::{PacketSize, Port, Sequence};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// The assumed size of the IPv4 header on the wire (no options).
const IPV4_HEADER_SIZE: usize = Ipv4Packet::minimum_packet_size();

/// The size of the 32-bit sequence prefix written into every probe payload.
const SEQUENCE_PREFIX_SIZE: usize = 4;

/// Build and send an ICMP echo request carrying `sequence`.
///
/// The total on-the-wire IP packet length will equal `packet_size`; the kernel prepends the IP
/// header. The full 32-bit sequence is written as the payload prefix in network byte order while
/// the 16-bit ICMP sequence field carries its low half.
pub fn dispatch_icmp_probe<S: Socket>(
    socket: &mut S,
    buf: &mut [u8],
    sequence: Sequence,
    packet_size: PacketSize,
    identifier: u16,
    dest_addr: Ipv4Addr,
) -> Result<usize, SendError> {
    let payload_size = icmp_payload_size(packet_size);
    let packet_len = EchoRequestPacket::minimum_packet_size() + payload_size;
    buf[..packet_len].fill(0);
    let mut icmp = EchoRequestPacket::new(&mut buf[..packet_len])?;
    icmp.set_icmp_type(IcmpType::EchoRequest);
    icmp.set_icmp_code(IcmpCode(0));
    icmp.set_identifier(identifier);
    icmp.set_sequence(sequence.0 as u16);
    icmp.set_payload(&sequence.0.to_be_bytes());
    icmp.set_checksum(icmp_ipv4_checksum(icmp.packet()));
    let remote_addr = SocketAddr::new(IpAddr::V4(dest_addr), 0);
    socket.send_to(icmp.packet(), remote_addr).map_err(SendError::from)
}

/// Send a UDP probe carrying `sequence` over a connected socket.
pub fn dispatch_udp_probe<S: Socket>(
    socket: &mut S,
    buf: &mut [u8],
    sequence: Sequence,
    packet_size: PacketSize,
) -> Result<usize, SendError> {
    let payload_size = udp_payload_size(packet_size);
    buf[..payload_size].fill(0);
    buf[..SEQUENCE_PREFIX_SIZE].copy_from_slice(&sequence.0.to_be_bytes());
    socket.send(&buf[..payload_size]).map_err(SendError::from)
}

/// Recover the probe sequence from a raw ICMPv4 datagram, if it is ours.
///
/// `buf` holds a complete IP packet as delivered by a raw ICMP socket. Echo replies are matched
/// by identifier; time-exceeded and destination-unreachable errors are matched by parsing the
/// embedded original datagram (ICMP echo request or UDP probe). Anything else is noise.
pub fn parse_reply(
    buf: &[u8],
    protocol: Protocol,
    identifier: u16,
    dest_port: Port,
) -> Option<Sequence> {
    let ipv4 = Ipv4Packet::new_view(buf).ok()?;
    if ipv4.get_protocol() != IpProtocol::Icmp {
        return None;
    }
    let icmp = IcmpPacket::new_view(ipv4.payload()).ok()?;
    match icmp.get_icmp_type() {
        IcmpType::EchoReply if protocol == Protocol::Icmp => {
            let echo_reply = EchoReplyPacket::new_view(icmp.packet()).ok()?;
            if echo_reply.get_identifier() != identifier {
                return None;
            }
            sequence_from_payload(echo_reply.payload())
        }
        IcmpType::TimeExceeded => {
            let packet = TimeExceededPacket::new_view(icmp.packet()).ok()?;
            extract_original(packet.payload(), protocol, identifier, dest_port)
        }
        IcmpType::DestinationUnreachable => {
            let packet = DestinationUnreachablePacket::new_view(icmp.packet()).ok()?;
            extract_original(packet.payload(), protocol, identifier, dest_port)
        }
        _ => None,
    }
}

/// Recover the sequence from the original datagram embedded in an ICMP error reply.
fn extract_original(
    payload: &[u8],
    protocol: Protocol,
    identifier: u16,
    dest_port: Port,
) -> Option<Sequence> {
    let ipv4 = Ipv4Packet::new_view(payload).ok()?;
    match (protocol, ipv4.get_protocol()) {
        (Protocol::Icmp, IpProtocol::Icmp) => {
            let echo_request = EchoRequestPacket::new_view(ipv4.payload()).ok()?;
            if echo_request.get_icmp_type() != IcmpType::EchoRequest
                || echo_request.get_identifier() != identifier
            {
                return None;
            }
            sequence_from_payload(echo_request.payload())
        }
        (Protocol::Udp, IpProtocol::Udp) => {
            let udp = UdpPacket::new_view(ipv4.payload()).ok()?;
            if udp.get_destination() != dest_port.0 {
                return None;
            }
            sequence_from_payload(udp.payload())
        }
        _ => None,
    }
}

fn sequence_from_payload(payload: &[u8]) -> Option<Sequence> {
    let prefix = payload.get(..SEQUENCE_PREFIX_SIZE)?;
    Some(Sequence(u32::from_be_bytes(prefix.try_into().ok()?)))
}

fn icmp_payload_size(packet_size: PacketSize) -> usize {
    packet_size
        .0
        .saturating_sub(IPV4_HEADER_SIZE + EchoRequestPacket::minimum_packet_size())
        .max(SEQUENCE_PREFIX_SIZE)
}

fn udp_payload_size(packet_size: PacketSize) -> usize {
    packet_size
        .0
        .saturating_sub(IPV4_HEADER_SIZE + UdpPacket::minimum_packet_size())
        .max(SEQUENCE_PREFIX_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_header(protocol: u8, payload_len: usize) -> [u8; 20] {
        let mut header = [0_u8; 20];
        header[0] = 0x45;
        header[2..4].copy_from_slice(&(20 + payload_len as u16).to_be_bytes());
        header[8] = 64;
        header[9] = protocol;
        header[12..16].copy_from_slice(&[10, 0, 0, 1]);
        header[16..20].copy_from_slice(&[10, 0, 0, 2]);
        header
    }

    fn echo_packet(icmp_type: u8, identifier: u16, sequence: u32) -> Vec<u8> {
        let mut icmp = vec![0_u8; 12];
        icmp[0] = icmp_type;
        icmp[4..6].copy_from_slice(&identifier.to_be_bytes());
        icmp[6..8].copy_from_slice(&(sequence as u16).to_be_bytes());
        icmp[8..12].copy_from_slice(&sequence.to_be_bytes());
        icmp
    }

    fn wrap_ipv4(protocol: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = ipv4_header(protocol, payload.len()).to_vec();
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_parse_echo_reply() {
        let packet = wrap_ipv4(1, &echo_packet(0, 0xbeef, 70000));
        let sequence = parse_reply(&packet, Protocol::Icmp, 0xbeef, Port(0));
        assert_eq!(Some(Sequence(70000)), sequence);
    }

    #[test]
    fn test_parse_echo_reply_foreign_identifier() {
        let packet = wrap_ipv4(1, &echo_packet(0, 0x1111, 7));
        assert_eq!(None, parse_reply(&packet, Protocol::Icmp, 0xbeef, Port(0)));
    }

    #[test]
    fn test_parse_time_exceeded_with_embedded_udp() {
        // original probe: ipv4 + udp to port 33434 with a 4 byte sequence prefix
        let mut udp = vec![0_u8; 12];
        udp[0..2].copy_from_slice(&54321_u16.to_be_bytes());
        udp[2..4].copy_from_slice(&33434_u16.to_be_bytes());
        udp[4..6].copy_from_slice(&12_u16.to_be_bytes());
        udp[8..12].copy_from_slice(&42_u32.to_be_bytes());
        let original = wrap_ipv4(17, &udp);
        // time exceeded reply carrying the original datagram
        let mut te = vec![0x0b, 0, 0, 0, 0, 0, 0, 0];
        te.extend_from_slice(&original);
        let packet = wrap_ipv4(1, &te);
        let sequence = parse_reply(&packet, Protocol::Udp, 0, Port(33434));
        assert_eq!(Some(Sequence(42)), sequence);
    }

    #[test]
    fn test_parse_time_exceeded_with_embedded_echo_request() {
        let original = wrap_ipv4(1, &echo_packet(8, 0xbeef, 9));
        let mut te = vec![0x0b, 0, 0, 0, 0, 0, 0, 0];
        te.extend_from_slice(&original);
        let packet = wrap_ipv4(1, &te);
        let sequence = parse_reply(&packet, Protocol::Icmp, 0xbeef, Port(0));
        assert_eq!(Some(Sequence(9)), sequence);
    }

    #[test]
    fn test_parse_destination_unreachable_with_embedded_udp() {
        let mut udp = vec![0_u8; 12];
        udp[2..4].copy_from_slice(&33434_u16.to_be_bytes());
        udp[8..12].copy_from_slice(&7_u32.to_be_bytes());
        let original = wrap_ipv4(17, &udp);
        let mut unreachable = vec![0x03, 0x03, 0, 0, 0, 0, 0, 0];
        unreachable.extend_from_slice(&original);
        let packet = wrap_ipv4(1, &unreachable);
        let sequence = parse_reply(&packet, Protocol::Udp, 0, Port(33434));
        assert_eq!(Some(Sequence(7)), sequence);
    }

    #[test]
    fn test_parse_foreign_port_is_noise() {
        let mut udp = vec![0_u8; 12];
        udp[2..4].copy_from_slice(&9999_u16.to_be_bytes());
        udp[8..12].copy_from_slice(&7_u32.to_be_bytes());
        let original = wrap_ipv4(17, &udp);
        let mut te = vec![0x0b, 0, 0, 0, 0, 0, 0, 0];
        te.extend_from_slice(&original);
        let packet = wrap_ipv4(1, &te);
        assert_eq!(None, parse_reply(&packet, Protocol::Udp, 0, Port(33434)));
    }

    #[test]
    fn test_parse_truncated_embedded_payload_is_noise() {
        // only the embedded udp header arrived, no sequence prefix
        let udp = vec![0_u8; 8];
        let original = wrap_ipv4(17, &udp);
        let mut te = vec![0x0b, 0, 0, 0, 0, 0, 0, 0];
        te.extend_from_slice(&original);
        let packet = wrap_ipv4(1, &te);
        assert_eq!(None, parse_reply(&packet, Protocol::Udp, 0, Port(0)));
    }

    #[test]
    fn test_parse_non_icmp_is_noise() {
        let packet = wrap_ipv4(6, &[0_u8; 20]);
        assert_eq!(None, parse_reply(&packet, Protocol::Icmp, 0, Port(0)));
    }

    #[test]
    fn test_payload_sizes_hit_total_packet_length() {
        // 64 byte total = 20 ip + 8 icmp + 36 payload
        assert_eq!(36, icmp_payload_size(PacketSize(64)));
        // 64 byte total = 20 ip + 8 udp + 36 payload
        assert_eq!(36, udp_payload_size(PacketSize(64)));
        // too-small sizes are floored so the sequence prefix always fits
        assert_eq!(4, icmp_payload_size(PacketSize(8)));
        assert_eq!(4, udp_payload_size(PacketSize(0)));
    }
}
