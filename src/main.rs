#![warn(clippy::all, clippy::pedantic, rust_2018_idioms)]
#![allow(clippy::module_name_repetitions)]
#![forbid(unsafe_code)]

use clap::Parser;
use mping::config::{Args, MpingMode};
use mping::probing::{ProbeChannel, ProbeConfig, Prober, SessionFlags, SocketImpl};
use mping::{dns, server};
use std::process;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    configure_logging(args.debug);
    let identifier = u16::try_from(process::id() % u32::from(u16::MAX))?;
    match MpingMode::from(args, identifier)? {
        MpingMode::Server(config) => server::run(&config),
        MpingMode::Probe { host, config } => run_probe(&host, config),
    }
}

/// Probe each candidate address for the host in turn until one is usable.
fn run_probe(host: &str, mut config: ProbeConfig) -> anyhow::Result<()> {
    let flags = SessionFlags::new();
    flags.register()?;
    let addrs = dns::resolve(host)?;
    anyhow::ensure!(!addrs.is_empty(), "no addresses found for {host}");
    for addr in addrs {
        config.dest_addr = addr;
        tracing::info!(%addr, "destination");
        let channel = match ProbeChannel::<SocketImpl>::connect(&config) {
            Ok(channel) => channel,
            Err(err) => {
                tracing::warn!(%addr, %err, "destination unusable, trying next");
                continue;
            }
        };
        let mut prober = Prober::new(config.clone(), channel, Arc::clone(&flags));
        prober.run()?;
        prober.stats().print_summary();
        if config.record_seq_time {
            prober.stats().print_sequence_times();
        }
        break;
    }
    Ok(())
}

fn configure_logging(debug: bool) {
    let filter = if debug { "mping=debug" } else { "mping=info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
