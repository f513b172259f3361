use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// A DNS resolution result.
pub type Result<T> = std::result::Result<T, Error>;

/// A DNS resolution error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("DNS lookup for {0} failed: {1}")]
    LookupFailed(String, io::Error),
}

/// Resolve a hostname to its candidate destination addresses, in resolver order.
///
/// Numeric IPv4 and IPv6 addresses resolve to themselves.
pub fn resolve(hostname: &str) -> Result<Vec<IpAddr>> {
    let mut addrs = dns_lookup::lookup_host(hostname)
        .map_err(|err| Error::LookupFailed(hostname.to_string(), err))?;
    addrs.dedup();
    Ok(addrs)
}
