//! The probe engine and its collaborators.
//!
//! Probing keeps a target number of sequenced probes in flight toward one destination and
//! reconciles replies back to their sequence numbers, so loss, reordering and bottleneck
//! behavior can be read from the resulting accounting.

pub mod config;
pub mod error;
pub mod net;
pub mod packet;
pub mod prober;
pub mod signal;
pub mod stats;
pub mod types;

pub use config::{defaults, ProbeConfig, Protocol, SizeSweep};
pub use error::{ProbeError, ProbeResult, SendError};
pub use net::socket::SocketImpl;
pub use net::{Network, ProbeChannel, Reply};
pub use prober::Prober;
pub use signal::SessionFlags;
pub use stats::ProbeStatistics;
pub use types::{PacketSize, Port, Sequence, TimeToLive, Window};
