use crate::probing::packet::buffer::Buffer;
use crate::probing::packet::error::{PacketError, Result};
use crate::probing::packet::IpProtocol;
use std::fmt::{Debug, Formatter};
use std::net::Ipv6Addr;

const PAYLOAD_LENGTH_OFFSET: usize = 4;
const NEXT_HEADER_OFFSET: usize = 6;
const SOURCE_OFFSET: usize = 8;
const DESTINATION_OFFSET: usize = 24;

/// Represents an `IPv6` packet.
///
/// Read-only; used to parse the original datagram embedded in `ICMPv6` error replies. Extension
/// headers are not walked, the payload is taken to start directly after the fixed header.
pub struct Ipv6Packet<'a> {
    buf: Buffer<'a>,
}

impl<'a> Ipv6Packet<'a> {
    pub fn new_view(packet: &'a [u8]) -> Result<Self> {
        if packet.len() >= Self::minimum_packet_size() {
            Ok(Self {
                buf: Buffer::Immutable(packet),
            })
        } else {
            Err(PacketError::InsufficientPacketBuffer(
                String::from("Ipv6Packet"),
                Self::minimum_packet_size(),
                packet.len(),
            ))
        }
    }

    #[must_use]
    pub const fn minimum_packet_size() -> usize {
        40
    }

    #[must_use]
    pub fn get_payload_length(&self) -> u16 {
        self.buf.get_u16(PAYLOAD_LENGTH_OFFSET)
    }

    #[must_use]
    pub fn get_next_header(&self) -> IpProtocol {
        IpProtocol::from(self.buf.get_u8(NEXT_HEADER_OFFSET))
    }

    #[must_use]
    pub fn get_source(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.buf.get_bytes::<16>(SOURCE_OFFSET))
    }

    #[must_use]
    pub fn get_destination(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.buf.get_bytes::<16>(DESTINATION_OFFSET))
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf.as_slice()[Self::minimum_packet_size()..]
    }
}

impl Debug for Ipv6Packet<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ipv6Packet")
            .field("payload_length", &self.get_payload_length())
            .field("next_header", &self.get_next_header())
            .field("source", &self.get_source())
            .field("destination", &self.get_destination())
            .finish()
    }
}
