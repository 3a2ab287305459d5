//! # Error Taxonomy Module
//!
//! This module defines the error types surfaced by the transport. Errors are
//! grouped the way the wire protocol groups them: a major category (setup,
//! connection, I/O, file, API misuse, fatal) plus a minor code, so callers
//! that speak the numeric form can still obtain `(major, minor)` pairs while
//! Rust callers match on the enum directly.
//!
//! Two layers exist on purpose:
//!
//! - [`TransportError`]: user-visible failures of socket-level operations.
//! - [`ChannelError`]: transient conditions inside a packet channel
//!   (`Again` for "no packet yet", `Closed` for a torn-down channel). These
//!   never escape to the API surface unmapped; the connection engine either
//!   retries or converts them into a `TransportError`.

use std::io;
use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors returned by the socket-level API surface.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A system resource (memory, descriptors, task budget) was exhausted.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Binding the local endpoint failed.
    #[error("unable to bind local endpoint: {0}")]
    Bind(#[source] io::Error),

    /// The requested option or operation is not supported on this socket.
    #[error("unsupported option or operation")]
    Unsupported,

    /// The connection handshake did not complete within the timeout.
    #[error("connection setup timed out")]
    ConnTimeout,

    /// The peer rejected the connection attempt.
    #[error("connection rejected by peer")]
    ConnRejected,

    /// The connection broke mid-stream (peer vanished, substrate failed).
    #[error("connection broken")]
    ConnBroken,

    /// The operation was attempted on a connection that is already broken
    /// or closed.
    #[error("connection does not exist or is already closed")]
    ConnLost,

    /// Non-blocking mode and the operation cannot make progress right now.
    #[error("operation would block")]
    WouldBlock,

    /// A blocking operation exceeded its configured send/receive timeout.
    #[error("operation timed out")]
    Timeout,

    /// A substrate I/O failure that is not a would-block condition.
    #[error("transport I/O failure: {0}")]
    Io(#[source] io::Error),

    /// File I/O failed during `sendfile`/`recvfile`.
    #[error("file I/O failure: {0}")]
    File(#[source] io::Error),

    /// The operation is invalid for the socket's current state
    /// (e.g. `listen` on a connected socket).
    #[error("invalid operation: socket is {0}")]
    InvalidState(&'static str),

    /// No socket is registered under the given identifier.
    #[error("unknown socket id {0}")]
    UnknownSocket(u32),

    /// A message submitted via `sendmsg` exceeds the configured maximum
    /// message size or the send-buffer capacity.
    #[error("message larger than the configured limit")]
    MessageTooLarge,

    /// An inbound packet could not be parsed.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// Anything we cannot classify.
    #[error("fatal transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Numeric `(major, minor)` code of this error.
    ///
    /// Major categories: 1 setup, 2 connection, 3 I/O, 4 file, 5 API misuse,
    /// 6 fatal/unknown.
    pub fn code(&self) -> (u16, u16) {
        match self {
            TransportError::Resource(_) => (1, 1),
            TransportError::Bind(_) => (1, 3),
            TransportError::Unsupported => (1, 4),
            TransportError::ConnTimeout => (2, 1),
            TransportError::ConnRejected => (2, 2),
            TransportError::ConnBroken => (2, 3),
            TransportError::ConnLost => (2, 4),
            TransportError::WouldBlock => (3, 1),
            TransportError::Timeout => (3, 2),
            TransportError::Io(_) => (3, 3),
            TransportError::File(_) => (4, 1),
            TransportError::InvalidState(_) => (5, 1),
            TransportError::UnknownSocket(_) => (5, 4),
            TransportError::MessageTooLarge => (5, 12),
            TransportError::MalformedPacket(_) => (6, 1),
            TransportError::Fatal(_) => (6, 0),
        }
    }

    /// The underlying OS error number, when one exists.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            TransportError::Bind(e)
            | TransportError::Io(e)
            | TransportError::File(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Transient and terminal conditions reported by a packet channel.
///
/// `recv_from` uses `Again` to mean "no packet within the bounded poll
/// interval, retry"; `Closed` is the distinct code reported for a receive
/// against a closing or closed channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No packet available; retry after the caller's timers have run.
    #[error("no packet available, try again")]
    Again,

    /// The channel has been closed or is closing; no further I/O possible.
    #[error("channel is closed")]
    Closed,

    /// The substrate failed permanently.
    #[error("channel failure: {0}")]
    Broken(String),
}

impl From<ChannelError> for TransportError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Again => TransportError::WouldBlock,
            ChannelError::Closed => TransportError::ConnLost,
            ChannelError::Broken(msg) => TransportError::Fatal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_major_categories() {
        assert_eq!(TransportError::ConnTimeout.code().0, 2);
        assert_eq!(TransportError::WouldBlock.code(), (3, 1));
        assert_eq!(TransportError::UnknownSocket(7).code().0, 5);
        assert_eq!(
            TransportError::File(io::Error::new(io::ErrorKind::Other, "x")).code().0,
            4
        );
    }

    #[test]
    fn channel_errors_map_to_distinct_transport_errors() {
        assert!(matches!(
            TransportError::from(ChannelError::Again),
            TransportError::WouldBlock
        ));
        assert!(matches!(
            TransportError::from(ChannelError::Closed),
            TransportError::ConnLost
        ));
    }
}
