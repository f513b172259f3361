use crate::probing::packet::error::PacketError;
use nix::errno::Errno;
use std::io;
use thiserror::Error;

/// A probe error result.
pub type ProbeResult<T> = Result<T, ProbeError>;

/// A fatal probe error.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid packet size: {0}")]
    InvalidPacketSize(usize),
    #[error("invalid packet: {0}")]
    Packet(#[from] PacketError),
    #[error("invalid probe config: {0}")]
    BadConfig(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Classification of a failed probe send.
///
/// The engine treats the first three classes as transient per the retract-and-continue policy;
/// anything else aborts the destination attempt.
#[derive(Debug)]
pub enum SendError {
    /// The send was interrupted by a signal (`EINTR`).
    Interrupted,
    /// The kernel send buffer is exhausted (`ENOBUFS`, or `EAGAIN` on a non-blocking socket).
    BufferFull,
    /// A previously received ICMP unreachable surfaced on the connected socket (`ECONNREFUSED`).
    Refused,
    /// Any other error.
    Fatal(io::Error),
}

impl From<io::Error> for SendError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error().map(Errno::from_i32) {
            Some(Errno::EINTR) => Self::Interrupted,
            Some(Errno::ENOBUFS | Errno::EAGAIN) => Self::BufferFull,
            Some(Errno::ECONNREFUSED) => Self::Refused,
            _ => Self::Fatal(err),
        }
    }
}

impl From<PacketError> for SendError {
    fn from(err: PacketError) -> Self {
        Self::Fatal(io::Error::new(io::ErrorKind::InvalidInput, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(errno: Errno) -> SendError {
        SendError::from(io::Error::from_raw_os_error(errno as i32))
    }

    #[test]
    fn test_classify_transient() {
        assert!(matches!(classify(Errno::EINTR), SendError::Interrupted));
        assert!(matches!(classify(Errno::ENOBUFS), SendError::BufferFull));
        assert!(matches!(classify(Errno::EAGAIN), SendError::BufferFull));
        assert!(matches!(classify(Errno::ECONNREFUSED), SendError::Refused));
    }

    #[test]
    fn test_classify_fatal() {
        assert!(matches!(classify(Errno::EPERM), SendError::Fatal(_)));
        assert!(matches!(
            SendError::from(io::Error::new(io::ErrorKind::Other, "no errno")),
            SendError::Fatal(_)
        ));
    }
}
