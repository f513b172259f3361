use crate::probing::config::Protocol;
use crate::probing::error::SendError;
use crate::probing::net::socket::Socket;
use crate::probing::packet::icmpv6::{IcmpCode, IcmpPacket, IcmpType};
use crate::probing::packet::ipv6::Ipv6Packet;
use crate::probing::packet::udp::UdpPacket;
use crate::probing::packet::IpProtocol;
use crate::probing::types::{PacketSize, Port, Sequence};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// The size of the fixed IPv6 header on the wire.
const IPV6_HEADER_SIZE: usize = Ipv6Packet::minimum_packet_size();

/// The size of the 32-bit sequence prefix written into every probe payload.
const SEQUENCE_PREFIX_SIZE: usize = 4;

/// Build and send an ICMPv6 echo request carrying `sequence`.
///
/// The checksum is left zero; the kernel fills it in for ICMPv6 sockets.
pub fn dispatch_icmp_probe<S: Socket>(
    socket: &mut S,
    buf: &mut [u8],
    sequence: Sequence,
    packet_size: PacketSize,
    identifier: u16,
    dest_addr: Ipv6Addr,
) -> Result<usize, SendError> {
    let payload_size = icmp_payload_size(packet_size);
    let packet_len = IcmpPacket::minimum_packet_size() + payload_size;
    buf[..packet_len].fill(0);
    let mut icmp = IcmpPacket::new(&mut buf[..packet_len])?;
    icmp.set_icmp_type(IcmpType::EchoRequest);
    icmp.set_icmp_code(IcmpCode(0));
    icmp.set_identifier(identifier);
    icmp.set_sequence(sequence.0 as u16);
    icmp.set_payload(&sequence.0.to_be_bytes());
    let remote_addr = SocketAddr::new(IpAddr::V6(dest_addr), 0);
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

/// Recover the probe sequence from an ICMPv6 datagram, if it is ours.
///
/// Raw ICMPv6 sockets deliver the ICMP message without the IP header. Embedded originals in
/// error replies do carry the full fixed IPv6 header of the probe.
pub fn parse_reply(
    buf: &[u8],
    protocol: Protocol,
    identifier: u16,
    dest_port: Port,
) -> Option<Sequence> {
    let icmp = IcmpPacket::new_view(buf).ok()?;
    match icmp.get_icmp_type() {
        IcmpType::EchoReply if protocol == Protocol::Icmp => {
            if icmp.get_identifier() != identifier {
                return None;
            }
            sequence_from_payload(icmp.payload())
        }
        IcmpType::TimeExceeded | IcmpType::DestinationUnreachable => {
            extract_original(icmp.payload(), protocol, identifier, dest_port)
        }
        _ => None,
    }
}

/// Recover the sequence from the original datagram embedded in an ICMPv6 error reply.
fn extract_original(
    payload: &[u8],
    protocol: Protocol,
    identifier: u16,
    dest_port: Port,
) -> Option<Sequence> {
    let ipv6 = Ipv6Packet::new_view(payload).ok()?;
    match (protocol, ipv6.get_next_header()) {
        (Protocol::Icmp, IpProtocol::IcmpV6) => {
            let echo_request = IcmpPacket::new_view(ipv6.payload()).ok()?;
            if echo_request.get_icmp_type() != IcmpType::EchoRequest
                || echo_request.get_identifier() != identifier
            {
                return None;
            }
            sequence_from_payload(echo_request.payload())
        }
        (Protocol::Udp, IpProtocol::Udp) => {
            let udp = UdpPacket::new_view(ipv6.payload()).ok()?;
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
        .saturating_sub(IPV6_HEADER_SIZE + IcmpPacket::minimum_packet_size())
        .max(SEQUENCE_PREFIX_SIZE)
}

fn udp_payload_size(packet_size: PacketSize) -> usize {
    packet_size
        .0
        .saturating_sub(IPV6_HEADER_SIZE + UdpPacket::minimum_packet_size())
        .max(SEQUENCE_PREFIX_SIZE)
}
