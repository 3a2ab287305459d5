//! # rudt
//!
//! A reliable, rate-controlled, message-oriented transport built atop
//! unreliable datagrams, with a pluggable packet channel: direct UDP, or
//! an ICE-established candidate pair so peers behind NATs can rendezvous.
//! The crate provides the wire codec, the per-connection sender/receiver
//! engine with selective and negative acknowledgement, the rate/window
//! congestion controller, and a socket-style API surface with a poll-style
//! readiness multiplexer.

pub mod buffer;
pub mod channel;
pub mod cli;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod framing;
pub mod loss;
pub mod metrics;
pub mod packet;
pub mod seq;
pub mod socket;

pub use channel::{IceChannel, PacketChannel, UdpChannel};
pub use connection::{ConnConfig, Connection, Status};
pub use error::{ChannelError, Result, TransportError};
pub use metrics::TraceInfo;
pub use packet::{Packet, SocketType};
pub use seq::{MsgNo, SeqNo};
pub use socket::{cleanup, startup, Interest, OptValue, PollEvents, Poller, SockOpt, Transport};

/// The crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values shared by the tools and tests.
pub mod defaults {
    use std::time::Duration;

    /// Default maximum segment size in bytes.
    pub const MSS: usize = crate::packet::DEFAULT_MSS;

    /// Default send-buffer capacity in packets.
    pub const SND_BUF_PKTS: usize = 8192;

    /// Default receive-buffer capacity in packets.
    pub const RCV_BUF_PKTS: usize = 8192;

    /// Default handshake timeout.
    pub const CONN_TIMEOUT: Duration = crate::connection::DEFAULT_CONN_TIMEOUT;

    /// Default close linger.
    pub const LINGER: Duration = Duration::from_secs(3);
}
