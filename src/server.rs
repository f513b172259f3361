use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use tracing::{debug, info, warn};

/// The address family to serve on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerFamily {
    Ipv4,
    Ipv6,
}

/// Configuration for the echo server (`-s`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub family: ServerFamily,
    pub recv_buf: usize,
}

/// Run the UDP echo daemon until interrupted.
///
/// Probe clients in `-c` mode pair their sequenced payloads with these echoes.
pub fn run(config: &ServerConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = match config.family {
        ServerFamily::Ipv4 => (Ipv4Addr::UNSPECIFIED, config.port).into(),
        ServerFamily::Ipv6 => (Ipv6Addr::UNSPECIFIED, config.port).into(),
    };
    let socket = UdpSocket::bind(addr)?;
    info!(%addr, "echo server listening");
    let mut buf = vec![0_u8; config.recv_buf];
    let mut echoed: u64 = 0;
    loop {
        match echo_once(&socket, &mut buf) {
            Ok(Some(peer)) => {
                echoed += 1;
                debug!(%peer, echoed, "echo");
            }
            Ok(None) => {}
            Err(err) => return Err(err.into()),
        }
    }
}

/// Read one datagram and write it straight back to the sender.
///
/// Transient receive/send errors (interrupts, refusals surfaced for previous echoes) are
/// swallowed so a misbehaving peer cannot stop the daemon.
fn echo_once(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Option<SocketAddr>> {
    let (len, peer) = match socket.recv_from(buf) {
        Ok(read) => read,
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::ConnectionRefused
            ) =>
        {
            return Ok(None)
        }
        Err(err) => return Err(err),
    };
    match socket.send_to(&buf[..len], peer) {
        Ok(_) => Ok(Some(peer)),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::ConnectionRefused
            ) =>
        {
            warn!(%err, %peer, "echo send failed");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .send_to(&[0, 0, 0, 42, 1, 2, 3], server.local_addr().unwrap())
            .unwrap();
        let mut buf = [0_u8; 64];
        let peer = echo_once(&server, &mut buf).unwrap().unwrap();
        assert_eq!(client.local_addr().unwrap(), peer);
        let mut reply = [0_u8; 64];
        let (len, from) = client.recv_from(&mut reply).unwrap();
        assert_eq!(7, len);
        assert_eq!(server.local_addr().unwrap(), from);
        assert_eq!([0, 0, 0, 42, 1, 2, 3], reply[..len]);
    }
}
