use crate::probing::error::{ProbeResult, SendError};
use crate::probing::types::{PacketSize, Sequence, TimeToLive};
use std::net::IpAddr;
use std::time::Duration;

/// A channel for sending and receiving probes.
pub mod channel;

/// IPv4 implementation.
mod ipv4;

/// IPv6 implementation.
mod ipv6;

/// A network socket.
pub mod socket;

pub use channel::ProbeChannel;

/// A reply correlated back to a probe sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// The sequence recovered from the reply payload.
    pub sequence: Sequence,
    /// The address of the responder.
    pub addr: IpAddr,
}

/// An abstraction over a network interface for probing.
#[cfg_attr(test, mockall::automock)]
pub trait Network {
    /// Set the time-to-live for subsequent probes.
    fn set_ttl(&mut self, ttl: TimeToLive) -> ProbeResult<()>;

    /// Send a single probe carrying `sequence`, sized to `size` total IP bytes.
    fn send_probe(&mut self, sequence: Sequence, size: PacketSize) -> Result<usize, SendError>;

    /// Block until a decodable reply arrives or `timeout` expires.
    ///
    /// Undecodable packets are consumed and skipped; `None` means the timeout (or a signal)
    /// ended the wait.
    fn recv_probe(&mut self, timeout: Duration) -> ProbeResult<Option<Reply>>;

    /// The address of the most recent responder, if any.
    fn from_addr(&self) -> Option<IpAddr>;
}
