use crate::probing::error::ProbeError;
use crate::probing::types::{PacketSize, Port, TimeToLive, Window};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};

/// Default values for configuration.
pub mod defaults {
    /// The default value for the in-flight window (`-n`).
    pub const DEFAULT_WINDOW_SIZE: u16 = 4;

    /// The default total packet size when `-b` is not given.
    pub const DEFAULT_PACKET_SIZE: usize = 64;

    /// The default UDP destination port when `-p` is not given.
    ///
    /// The traceroute convention, as the UDP modes expect ICMP errors back.
    pub const DEFAULT_UDP_PORT: u16 = 33434;

    /// The TTL used in client mode when `-t` is not given.
    pub const DEFAULT_CLIENT_TTL: u8 = 255;

    /// The default receive buffer size for server mode.
    pub const DEFAULT_SERVER_BUFFER: usize = 4096;

    /// The smallest total packet size that can carry the sequence prefix over IPv4.
    pub const MIN_PACKET_SIZE: usize = 32;

    /// The largest total packet size.
    pub const MAX_PACKET_SIZE: usize = 65535;
}

/// The probe transport.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Protocol {
    /// ICMP echo request probes, paired with echo replies.
    Icmp,
    /// UDP probes, paired with ICMP errors or a cooperating server echo.
    Udp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Icmp => write!(f, "icmp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Packet size sweep selector (`-b -1` through `-b -4`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SizeSweep {
    /// A fixed table of representative sizes.
    Selected,
    /// Steps of 64 bytes up to 1500.
    Step64,
    /// Steps of 128 bytes up to 2048.
    Step128,
    /// Steps of 256 bytes up to 4500.
    Step256,
}

impl SizeSweep {
    const SELECTED: [usize; 8] = [64, 100, 500, 1000, 1500, 2000, 3000, 4000];

    /// The total packet sizes this sweep visits, in order.
    #[must_use]
    pub fn sizes(self) -> Vec<usize> {
        match self {
            Self::Selected => Self::SELECTED.to_vec(),
            Self::Step64 => stepped(64, 1500),
            Self::Step128 => stepped(128, 2048),
            Self::Step256 => stepped(256, 4500),
        }
    }
}

impl TryFrom<i32> for SizeSweep {
    type Error = ProbeError;

    fn try_from(selector: i32) -> Result<Self, Self::Error> {
        match selector {
            -1 => Ok(Self::Selected),
            -2 => Ok(Self::Step64),
            -3 => Ok(Self::Step128),
            -4 => Ok(Self::Step256),
            _ => Err(ProbeError::BadConfig(format!(
                "size sweep selector must be -1..-4, got {selector}"
            ))),
        }
    }
}

fn stepped(step: usize, limit: usize) -> Vec<usize> {
    (1..)
        .map(|k| k * step)
        .take_while(|size| *size <= limit)
        .collect()
}

/// Immutable configuration for one probing run.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub dest_addr: IpAddr,
    pub protocol: Protocol,
    pub source_addr: Option<IpAddr>,
    pub dest_port: Port,
    /// Identifier stamped into ICMP echo requests, derived from the pid.
    pub identifier: u16,
    pub ttl: TimeToLive,
    /// Sweep the TTL from 1 up to `ttl` instead of probing at a single TTL.
    pub sweep_ttl: bool,
    pub win_size: Window,
    /// Hold the window at `win_size` instead of ramping 1..=`win_size`.
    pub loop_forever: bool,
    /// Open at most 2 new in-flight slots per tick instead of 10.
    pub slow_start: bool,
    /// Number of back-to-back probes per tick once the window has filled; 0 disables.
    pub burst: u16,
    pub packet_size: PacketSize,
    pub size_sweep: Option<SizeSweep>,
    /// Record the time and sequence of every send and receive (`-r`).
    pub record_seq_time: bool,
    pub client_mode: bool,
    /// Parsed but reserved; rate limiting has no defined semantics yet.
    pub rate: u32,
}

impl ProbeConfig {
    /// The total packet sizes the size loop will visit, in order.
    #[must_use]
    pub fn probe_sizes(&self) -> Vec<PacketSize> {
        self.size_sweep.map_or_else(
            || vec![self.packet_size],
            |sweep| sweep.sizes().into_iter().map(PacketSize).collect(),
        )
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            dest_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            protocol: Protocol::Icmp,
            source_addr: None,
            dest_port: Port(0),
            identifier: 0,
            ttl: TimeToLive(0),
            sweep_ttl: false,
            win_size: Window(defaults::DEFAULT_WINDOW_SIZE),
            loop_forever: false,
            slow_start: false,
            burst: 0,
            packet_size: PacketSize(defaults::DEFAULT_PACKET_SIZE),
            size_sweep: None,
            record_seq_time: false,
            client_mode: false,
            rate: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selected_sizes() {
        assert_eq!(
            vec![64, 100, 500, 1000, 1500, 2000, 3000, 4000],
            SizeSweep::Selected.sizes()
        );
    }

    #[test]
    fn test_step64_sizes() {
        let sizes = SizeSweep::Step64.sizes();
        assert_eq!(23, sizes.len());
        assert_eq!(Some(&64), sizes.first());
        assert_eq!(Some(&1472), sizes.last());
    }

    #[test]
    fn test_step128_sizes() {
        let sizes = SizeSweep::Step128.sizes();
        assert_eq!(16, sizes.len());
        assert_eq!(Some(&2048), sizes.last());
    }

    #[test]
    fn test_step256_sizes() {
        let sizes = SizeSweep::Step256.sizes();
        assert_eq!(17, sizes.len());
        assert_eq!(Some(&4352), sizes.last());
    }

    #[test]
    fn test_sweep_selector() {
        assert_eq!(SizeSweep::Selected, SizeSweep::try_from(-1).unwrap());
        assert_eq!(SizeSweep::Step64, SizeSweep::try_from(-2).unwrap());
        assert_eq!(SizeSweep::Step128, SizeSweep::try_from(-3).unwrap());
        assert_eq!(SizeSweep::Step256, SizeSweep::try_from(-4).unwrap());
        assert!(SizeSweep::try_from(-5).is_err());
        assert!(SizeSweep::try_from(0).is_err());
    }

    #[test]
    fn test_probe_sizes_fixed() {
        let config = ProbeConfig {
            packet_size: PacketSize(1024),
            ..Default::default()
        };
        assert_eq!(vec![PacketSize(1024)], config.probe_sizes());
    }

    #[test]
    fn test_probe_sizes_sweep() {
        let config = ProbeConfig {
            size_sweep: Some(SizeSweep::Step64),
            ..Default::default()
        };
        assert_eq!(23, config.probe_sizes().len());
    }
}
