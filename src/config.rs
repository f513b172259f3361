use crate::probing::config::defaults;
use crate::probing::{PacketSize, Port, ProbeConfig, Protocol, SizeSweep, TimeToLive, Window};
use crate::server::{ServerConfig, ServerFamily};
use anyhow::{anyhow, bail};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr};

/// Measure a network path by keeping a window of probes in flight.
#[derive(Parser, Debug)]
#[command(name = "mping", version, about, long_about = None, arg_required_else_help(true))]
pub struct Args {
    /// Number of messages to keep in transit
    #[arg(short = 'n', long = "window", default_value_t = defaults::DEFAULT_WINDOW_SIZE)]
    pub window: u16,

    /// Loop forever instead of ramping the window up
    #[arg(short = 'f', long = "forever")]
    pub forever: bool,

    /// Rate at which to limit messages in transit [reserved]
    #[arg(short = 'R', long)]
    pub rate: Option<u32>,

    /// Use a TCP style slow start
    #[arg(short = 'S', long = "slow-start")]
    pub slow_start: bool,

    /// Send UDP packets (instead of ICMP) with this TTL
    #[arg(short = 't', long, value_parser = clap::value_parser!(u8).range(1..))]
    pub ttl: Option<u8>,

    /// Auto-increment the TTL up to this maximum; implies UDP
    #[arg(short = 'a', long = "ttl-max", conflicts_with = "ttl", value_parser = clap::value_parser!(u8).range(1..))]
    pub ttl_max: Option<u8>,

    /// Message length in bytes including the IP header, or a size sweep selector -1..-4
    #[arg(short = 'b', long = "bytes", allow_negative_numbers = true)]
    pub bytes: Option<i32>,

    /// Send this many packets in a burst once the window has filled
    #[arg(short = 'B', long)]
    pub burst: Option<u16>,

    /// UDP destination port
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Server mode: echo UDP datagrams received on this port
    #[arg(short = 's', long = "server", value_parser = clap::value_parser!(u16).range(1..))]
    pub server_port: Option<u16>,

    /// Server mode: use IPv4
    #[arg(short = '4', long = "ipv4", conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Server mode: use IPv6
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,

    /// Client mode: send UDP probes to a host running in server mode
    #[arg(short = 'c', long = "client")]
    pub client: bool,

    /// Print the time and sequence number of every sent and received packet
    #[arg(short = 'r', long = "record")]
    pub record: bool,

    /// Verbose debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Source interface address
    #[arg(short = 'F', long = "source")]
    pub source: Option<IpAddr>,

    /// Target host
    pub host: Option<String>,
}

/// What this invocation should do, validated.
#[derive(Debug)]
pub enum MpingMode {
    Server(ServerConfig),
    Probe { host: String, config: ProbeConfig },
}

impl MpingMode {
    /// Validate the parsed arguments into a runnable mode.
    ///
    /// `identifier` is stamped into ICMP echo requests so replies can be told apart from other
    /// pings on the same host.
    pub fn from(args: Args, identifier: u16) -> anyhow::Result<Self> {
        if let Some(port) = args.server_port {
            return Ok(Self::Server(server_config(&args, port)?));
        }
        let host = args
            .host
            .clone()
            .ok_or_else(|| anyhow!("destination host required"))?;
        if args.client && args.port.is_none() {
            bail!("client mode needs a destination port, use -p");
        }
        let sweep_ttl = args.ttl_max.is_some();
        let ttl = args
            .ttl_max
            .or(args.ttl)
            .unwrap_or(if args.client { defaults::DEFAULT_CLIENT_TTL } else { 0 });
        let protocol = if ttl > 0 || args.client {
            Protocol::Udp
        } else {
            Protocol::Icmp
        };
        if args.port.is_some() && protocol == Protocol::Icmp {
            bail!("-p needs a UDP mode, use -t, -a or -c");
        }
        let dest_port = if protocol == Protocol::Udp {
            args.port.unwrap_or(defaults::DEFAULT_UDP_PORT)
        } else {
            0
        };
        let (packet_size, size_sweep) = packet_size(args.bytes)?;
        if args.window == 0 {
            bail!("window must be at least 1");
        }
        let burst = args.burst.unwrap_or(0);
        if burst > args.window {
            bail!(
                "burst ({burst}) must not exceed the window ({window})",
                window = args.window
            );
        }
        Ok(Self::Probe {
            host,
            config: ProbeConfig {
                // replaced per resolved candidate address
                dest_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                protocol,
                source_addr: args.source,
                dest_port: Port(dest_port),
                identifier,
                ttl: TimeToLive(ttl),
                sweep_ttl,
                win_size: Window(args.window),
                loop_forever: args.forever,
                slow_start: args.slow_start,
                burst,
                packet_size: PacketSize(packet_size),
                size_sweep,
                record_seq_time: args.record,
                client_mode: args.client,
                rate: args.rate.unwrap_or(0),
            },
        })
    }
}

fn server_config(args: &Args, port: u16) -> anyhow::Result<ServerConfig> {
    let family = if args.ipv4 {
        ServerFamily::Ipv4
    } else if args.ipv6 {
        ServerFamily::Ipv6
    } else {
        bail!("server mode needs the socket family, use -4 or -6");
    };
    let recv_buf = match args.bytes {
        None => defaults::DEFAULT_SERVER_BUFFER,
        Some(bytes) if bytes > 0 && bytes as usize <= defaults::MAX_PACKET_SIZE => bytes as usize,
        Some(bytes) => bail!("server receive buffer must be positive and at most {}, got {bytes}", defaults::MAX_PACKET_SIZE),
    };
    Ok(ServerConfig {
        port,
        family,
        recv_buf,
    })
}

/// Split `-b` into a fixed packet size or a sweep selector; exactly one is active.
fn packet_size(bytes: Option<i32>) -> anyhow::Result<(usize, Option<SizeSweep>)> {
    match bytes {
        None => Ok((defaults::DEFAULT_PACKET_SIZE, None)),
        Some(bytes) if bytes > 0 => {
            let size = bytes as usize;
            if !(defaults::MIN_PACKET_SIZE..=defaults::MAX_PACKET_SIZE).contains(&size) {
                bail!(
                    "packet size must be {}..={} bytes, got {size}",
                    defaults::MIN_PACKET_SIZE,
                    defaults::MAX_PACKET_SIZE
                );
            }
            Ok((size, None))
        }
        Some(selector) => Ok((0, Some(SizeSweep::try_from(selector)?))),
    }
}
