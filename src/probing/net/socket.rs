use nix::sys::select::{select, FdSet};
use nix::sys::socket::{SockaddrLike, SockaddrStorage};
use nix::sys::time::{TimeVal, TimeValLike};
use socket2::{Domain, Protocol, SockAddr, Type};
use std::io::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;

/// The socket operations needed by a probe channel.
#[cfg_attr(test, mockall::automock)]
pub trait Socket: Sized {
    /// Create a raw socket for sending and receiving ICMPv4 echo packets.
    fn new_icmp_socket_ipv4() -> Result<Self>;
    /// Create a raw socket for sending and receiving ICMPv6 echo packets.
    fn new_icmp_socket_ipv6() -> Result<Self>;
    /// Create a datagram socket for sending IPv4 UDP probes.
    fn new_udp_socket_ipv4() -> Result<Self>;
    /// Create a datagram socket for sending IPv6 UDP probes.
    fn new_udp_socket_ipv6() -> Result<Self>;
    /// Create a raw ICMPv4 socket for receiving error replies to UDP probes.
    fn new_recv_socket_ipv4() -> Result<Self>;
    /// Create a raw ICMPv6 socket for receiving error replies to UDP probes.
    fn new_recv_socket_ipv6() -> Result<Self>;
    fn bind(&mut self, address: SocketAddr) -> Result<()>;
    fn connect(&mut self, address: SocketAddr) -> Result<()>;
    fn set_ttl(&mut self, ttl: u32) -> Result<()>;
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<usize>;
    fn send(&mut self, buf: &[u8]) -> Result<usize>;
    /// Returns true if the socket becomes readable before the timeout, false otherwise.
    ///
    /// A signal arriving during the wait reports "not readable".
    fn is_readable(&mut self, timeout: Duration) -> Result<bool>;
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, Option<IpAddr>)>;
}

/// A `Socket` over non-blocking `socket2` sockets.
#[derive(Debug)]
pub struct SocketImpl {
    inner: socket2::Socket,
    ipv6: bool,
}

impl SocketImpl {
    fn new(domain: Domain, ty: Type, protocol: Protocol) -> Result<Self> {
        let inner = socket2::Socket::new(domain, ty, Some(protocol))?;
        inner.set_nonblocking(true)?;
        Ok(Self {
            inner,
            ipv6: domain == Domain::IPV6,
        })
    }
}

impl Socket for SocketImpl {
    fn new_icmp_socket_ipv4() -> Result<Self> {
        Self::new(Domain::IPV4, Type::RAW, Protocol::ICMPV4)
    }

    fn new_icmp_socket_ipv6() -> Result<Self> {
        Self::new(Domain::IPV6, Type::RAW, Protocol::ICMPV6)
    }

    fn new_udp_socket_ipv4() -> Result<Self> {
        Self::new(Domain::IPV4, Type::DGRAM, Protocol::UDP)
    }

    fn new_udp_socket_ipv6() -> Result<Self> {
        Self::new(Domain::IPV6, Type::DGRAM, Protocol::UDP)
    }

    fn new_recv_socket_ipv4() -> Result<Self> {
        Self::new(Domain::IPV4, Type::RAW, Protocol::ICMPV4)
    }

    fn new_recv_socket_ipv6() -> Result<Self> {
        Self::new(Domain::IPV6, Type::RAW, Protocol::ICMPV6)
    }

    fn bind(&mut self, address: SocketAddr) -> Result<()> {
        self.inner.bind(&SockAddr::from(address))
    }

    fn connect(&mut self, address: SocketAddr) -> Result<()> {
        self.inner.connect(&SockAddr::from(address))
    }

    fn set_ttl(&mut self, ttl: u32) -> Result<()> {
        if self.ipv6 {
            self.inner.set_unicast_hops_v6(ttl)
        } else {
            self.inner.set_ttl(ttl)
        }
    }

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        self.inner.send_to(buf, &SockAddr::from(addr))
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.send(buf)
    }

    fn is_readable(&mut self, timeout: Duration) -> Result<bool> {
        let mut read = FdSet::new();
        let fd = self.inner.as_fd();
        read.insert(&fd);
        let readable = select(
            None,
            Some(&mut read),
            None,
            None,
            Some(&mut TimeVal::milliseconds(timeout.as_millis() as i64)),
        );
        match readable {
            Ok(readable) => Ok(readable == 1),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(err) => Err(std::io::Error::from(err)),
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, Option<IpAddr>)> {
        let (bytes_read, addr) =
            nix::sys::socket::recvfrom::<SockaddrStorage>(self.inner.as_raw_fd(), buf)
                .map_err(std::io::Error::from)?;
        Ok((bytes_read, addr.as_ref().and_then(sockaddr_ip)))
    }
}

fn sockaddr_ip(addr: &SockaddrStorage) -> Option<IpAddr> {
    match addr.family() {
        Some(nix::sys::socket::AddressFamily::Inet) => addr
            .as_sockaddr_in()
            .map(|sin| IpAddr::V4(Ipv4Addr::from(sin.ip()))),
        Some(nix::sys::socket::AddressFamily::Inet6) => {
            addr.as_sockaddr_in6().map(|sin6| IpAddr::V6(sin6.ip()))
        }
        _ => None,
    }
}
