use crate::probing::config::{ProbeConfig, Protocol};
use crate::probing::error::{ProbeResult, SendError};
use crate::probing::net::socket::{Socket, SocketImpl};
use crate::probing::net::{ipv4, ipv6, Network, Reply};
use crate::probing::types::{PacketSize, Port, Sequence, TimeToLive};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// The maximum total IP packet size we allow.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Poll slice used to interleave the two receive sources in UDP mode.
const UDP_POLL_SLICE: Duration = Duration::from_millis(10);

/// The size of the 32-bit sequence prefix carried by every probe.
const SEQUENCE_PREFIX_SIZE: usize = 4;

/// A channel for sending probes and receiving correlated replies.
///
/// Transport selection: ICMP echo when probing without a TTL and outside client mode, otherwise
/// UDP. In UDP mode the send socket is connected (so ICMP unreachable surfaces as
/// `ECONNREFUSED`) and a second raw ICMP socket captures time-exceeded and unreachable errors
/// carrying the original probe; the connected socket itself yields direct echoes from a
/// cooperating server.
pub struct ProbeChannel<S: Socket = SocketImpl> {
    protocol: Protocol,
    dest_addr: IpAddr,
    dest_port: Port,
    identifier: u16,
    send_socket: S,
    recv_socket: Option<S>,
    send_buf: Vec<u8>,
    recv_buf: Vec<u8>,
    from_addr: Option<IpAddr>,
}

impl<S: Socket> ProbeChannel<S> {
    /// Open the sockets for one destination attempt.
    ///
    /// This operation requires the `CAP_NET_RAW` capability on Linux.
    pub fn connect(config: &ProbeConfig) -> ProbeResult<Self> {
        let (mut send_socket, recv_socket) = match (config.protocol, config.dest_addr) {
            (Protocol::Icmp, IpAddr::V4(_)) => (S::new_icmp_socket_ipv4()?, None),
            (Protocol::Icmp, IpAddr::V6(_)) => (S::new_icmp_socket_ipv6()?, None),
            (Protocol::Udp, IpAddr::V4(_)) => {
                (S::new_udp_socket_ipv4()?, Some(S::new_recv_socket_ipv4()?))
            }
            (Protocol::Udp, IpAddr::V6(_)) => {
                (S::new_udp_socket_ipv6()?, Some(S::new_recv_socket_ipv6()?))
            }
        };
        if let Some(source_addr) = config.source_addr {
            send_socket.bind(SocketAddr::new(source_addr, 0))?;
        }
        if config.protocol == Protocol::Udp {
            if config.ttl.0 > 0 {
                send_socket.set_ttl(u32::from(config.ttl.0))?;
            }
            send_socket.connect(SocketAddr::new(config.dest_addr, config.dest_port.0))?;
        }
        tracing::debug!(
            dest = %config.dest_addr,
            protocol = %config.protocol,
            dest_port = config.dest_port.0,
            "channel open"
        );
        Ok(Self {
            protocol: config.protocol,
            dest_addr: config.dest_addr,
            dest_port: config.dest_port,
            identifier: config.identifier,
            send_socket,
            recv_socket,
            send_buf: vec![0_u8; MAX_PACKET_SIZE],
            recv_buf: vec![0_u8; MAX_PACKET_SIZE],
            from_addr: None,
        })
    }

    #[cfg(test)]
    fn with_sockets(
        protocol: Protocol,
        dest_addr: IpAddr,
        dest_port: Port,
        identifier: u16,
        send_socket: S,
        recv_socket: Option<S>,
    ) -> Self {
        Self {
            protocol,
            dest_addr,
            dest_port,
            identifier,
            send_socket,
            recv_socket,
            send_buf: vec![0_u8; MAX_PACKET_SIZE],
            recv_buf: vec![0_u8; MAX_PACKET_SIZE],
            from_addr: None,
        }
    }

    /// Read one datagram from the raw ICMP socket and try to decode it as a reply to us.
    fn read_icmp_reply(&mut self, on_recv_socket: bool) -> ProbeResult<Option<Reply>> {
        let socket = if on_recv_socket {
            match self.recv_socket.as_mut() {
                Some(socket) => socket,
                None => return Ok(None),
            }
        } else {
            &mut self.send_socket
        };
        let (bytes_read, addr) = match socket.recv_from(&mut self.recv_buf) {
            Ok(read) => read,
            Err(err) if is_transient_recv(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let sequence = match self.dest_addr {
            IpAddr::V4(_) => ipv4::parse_reply(
                &self.recv_buf[..bytes_read],
                self.protocol,
                self.identifier,
                self.dest_port,
            ),
            IpAddr::V6(_) => ipv6::parse_reply(
                &self.recv_buf[..bytes_read],
                self.protocol,
                self.identifier,
                self.dest_port,
            ),
        };
        Ok(sequence.map(|sequence| Reply {
            sequence,
            addr: addr.unwrap_or(self.dest_addr),
        }))
    }

    /// Read one datagram from the connected UDP socket: a direct echo from a cooperating server.
    fn read_udp_echo(&mut self) -> ProbeResult<Option<Reply>> {
        let (bytes_read, addr) = match self.send_socket.recv_from(&mut self.recv_buf) {
            Ok(read) => read,
            Err(err) if is_transient_recv(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if bytes_read < SEQUENCE_PREFIX_SIZE {
            return Ok(None);
        }
        let prefix: [u8; SEQUENCE_PREFIX_SIZE] = self.recv_buf[..SEQUENCE_PREFIX_SIZE]
            .try_into()
            .unwrap_or_default();
        Ok(Some(Reply {
            sequence: Sequence(u32::from_be_bytes(prefix)),
            addr: addr.unwrap_or(self.dest_addr),
        }))
    }
}

impl<S: Socket> Network for ProbeChannel<S> {
    fn set_ttl(&mut self, ttl: TimeToLive) -> ProbeResult<()> {
        self.send_socket.set_ttl(u32::from(ttl.0))?;
        Ok(())
    }

    fn send_probe(&mut self, sequence: Sequence, size: PacketSize) -> Result<usize, SendError> {
        match (self.protocol, self.dest_addr) {
            (Protocol::Icmp, IpAddr::V4(dest_addr)) => ipv4::dispatch_icmp_probe(
                &mut self.send_socket,
                &mut self.send_buf,
                sequence,
                size,
                self.identifier,
                dest_addr,
            ),
            (Protocol::Icmp, IpAddr::V6(dest_addr)) => ipv6::dispatch_icmp_probe(
                &mut self.send_socket,
                &mut self.send_buf,
                sequence,
                size,
                self.identifier,
                dest_addr,
            ),
            (Protocol::Udp, IpAddr::V4(_)) => {
                ipv4::dispatch_udp_probe(&mut self.send_socket, &mut self.send_buf, sequence, size)
            }
            (Protocol::Udp, IpAddr::V6(_)) => {
                ipv6::dispatch_udp_probe(&mut self.send_socket, &mut self.send_buf, sequence, size)
            }
        }
    }

    fn recv_probe(&mut self, timeout: Duration) -> ProbeResult<Option<Reply>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.protocol {
                Protocol::Icmp => {
                    if !self.send_socket.is_readable(remaining)? {
                        return Ok(None);
                    }
                    if let Some(reply) = self.read_icmp_reply(false)? {
                        self.from_addr = Some(reply.addr);
                        return Ok(Some(reply));
                    }
                }
                Protocol::Udp => {
                    if self.send_socket.is_readable(Duration::ZERO)? {
                        if let Some(reply) = self.read_udp_echo()? {
                            self.from_addr = Some(reply.addr);
                            return Ok(Some(reply));
                        }
                    }
                    let slice = remaining.min(UDP_POLL_SLICE);
                    let readable = match self.recv_socket.as_mut() {
                        Some(socket) => socket.is_readable(slice)?,
                        None => {
                            std::thread::sleep(slice);
                            false
                        }
                    };
                    if readable {
                        if let Some(reply) = self.read_icmp_reply(true)? {
                            self.from_addr = Some(reply.addr);
                            return Ok(Some(reply));
                        }
                    }
                }
            }
        }
    }

    fn from_addr(&self) -> Option<IpAddr> {
        self.from_addr
    }
}

fn is_transient_recv(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probing::net::socket::MockSocket;
    use std::net::Ipv4Addr;

    const IDENTIFIER: u16 = 0xbeef;

    fn dest() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))
    }

    fn echo_reply_datagram(sequence: u32) -> Vec<u8> {
        let mut icmp = vec![0_u8; 12];
        icmp[4..6].copy_from_slice(&IDENTIFIER.to_be_bytes());
        icmp[6..8].copy_from_slice(&(sequence as u16).to_be_bytes());
        icmp[8..12].copy_from_slice(&sequence.to_be_bytes());
        let mut packet = vec![0_u8; 20];
        packet[0] = 0x45;
        packet[9] = 1;
        packet.extend_from_slice(&icmp);
        packet
    }

    #[test]
    fn test_recv_icmp_echo_reply() {
        let mut socket = MockSocket::new();
        socket.expect_is_readable().returning(|_| Ok(true));
        socket.expect_recv_from().returning(|buf| {
            let packet = echo_reply_datagram(1234);
            buf[..packet.len()].copy_from_slice(&packet);
            Ok((packet.len(), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))))
        });
        let mut channel = ProbeChannel::with_sockets(
            Protocol::Icmp,
            dest(),
            Port(0),
            IDENTIFIER,
            socket,
            None,
        );
        let reply = channel
            .recv_probe(Duration::from_millis(100))
            .unwrap()
            .unwrap();
        assert_eq!(Sequence(1234), reply.sequence);
        assert_eq!(dest(), reply.addr);
        assert_eq!(Some(dest()), channel.from_addr());
    }

    #[test]
    fn test_recv_skips_noise_then_times_out() {
        let mut socket = MockSocket::new();
        let mut calls = 0;
        socket.expect_is_readable().returning(move |_| {
            calls += 1;
            Ok(calls == 1)
        });
        socket.expect_recv_from().times(1).returning(|buf| {
            // an unrelated ICMP datagram: parseable but not ours
            let packet = echo_reply_datagram(99);
            buf[..packet.len()].copy_from_slice(&packet);
            buf[24] = 0x11;
            Ok((packet.len(), None))
        });
        let mut channel = ProbeChannel::with_sockets(
            Protocol::Icmp,
            dest(),
            Port(0),
            IDENTIFIER,
            socket,
            None,
        );
        let reply = channel.recv_probe(Duration::from_millis(20)).unwrap();
        assert!(reply.is_none());
    }

    #[test]
    fn test_recv_udp_time_exceeded_on_error_socket() {
        let mut send_socket = MockSocket::new();
        send_socket
            .expect_is_readable()
            .returning(|_| Ok(false));
        let mut recv_socket = MockSocket::new();
        recv_socket.expect_is_readable().returning(|_| Ok(true));
        recv_socket.expect_recv_from().returning(|buf| {
            let mut udp = vec![0_u8; 12];
            udp[2..4].copy_from_slice(&33434_u16.to_be_bytes());
            udp[4..6].copy_from_slice(&12_u16.to_be_bytes());
            udp[8..12].copy_from_slice(&7_u32.to_be_bytes());
            let mut original = vec![0_u8; 20];
            original[0] = 0x45;
            original[9] = 17;
            original.extend_from_slice(&udp);
            let mut te = vec![0x0b, 0, 0, 0, 0, 0, 0, 0];
            te.extend_from_slice(&original);
            let mut packet = vec![0_u8; 20];
            packet[0] = 0x45;
            packet[9] = 1;
            packet.extend_from_slice(&te);
            buf[..packet.len()].copy_from_slice(&packet);
            Ok((packet.len(), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))))
        });
        let mut channel = ProbeChannel::with_sockets(
            Protocol::Udp,
            dest(),
            Port(33434),
            0,
            send_socket,
            Some(recv_socket),
        );
        let reply = channel
            .recv_probe(Duration::from_millis(100))
            .unwrap()
            .unwrap();
        assert_eq!(Sequence(7), reply.sequence);
        assert_eq!(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), reply.addr);
    }

    #[test]
    fn test_recv_udp_direct_server_echo() {
        let mut send_socket = MockSocket::new();
        send_socket.expect_is_readable().returning(|_| Ok(true));
        send_socket.expect_recv_from().returning(|buf| {
            buf[..4].copy_from_slice(&41_u32.to_be_bytes());
            buf[4..8].fill(0);
            Ok((8, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))))
        });
        let mut channel = ProbeChannel::with_sockets(
            Protocol::Udp,
            dest(),
            Port(2003),
            0,
            send_socket,
            Some(MockSocket::new()),
        );
        let reply = channel
            .recv_probe(Duration::from_millis(100))
            .unwrap()
            .unwrap();
        assert_eq!(Sequence(41), reply.sequence);
    }

    #[test]
    fn test_send_icmp_probe_hits_total_packet_size() {
        let mut socket = MockSocket::new();
        socket
            .expect_send_to()
            .withf(|buf, addr| {
                // 64 byte total = 20 byte IP header added by the kernel + 44 sent here
                buf.len() == 44 && addr.port() == 0
            })
            .returning(|buf, _| Ok(buf.len()));
        let mut channel = ProbeChannel::with_sockets(
            Protocol::Icmp,
            dest(),
            Port(0),
            IDENTIFIER,
            socket,
            None,
        );
        let sent = channel.send_probe(Sequence(5), PacketSize(64)).unwrap();
        assert_eq!(44, sent);
    }

    #[test]
    fn test_send_classifies_refused() {
        let mut socket = MockSocket::new();
        socket.expect_send().returning(|_| {
            Err(std::io::Error::from_raw_os_error(
                nix::errno::Errno::ECONNREFUSED as i32,
            ))
        });
        let mut channel = ProbeChannel::with_sockets(
            Protocol::Udp,
            dest(),
            Port(33434),
            0,
            socket,
            Some(MockSocket::new()),
        );
        let err = channel
            .send_probe(Sequence(1), PacketSize(64))
            .unwrap_err();
        assert!(matches!(err, SendError::Refused));
    }
}
