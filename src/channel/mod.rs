//! # Packet Channel Abstraction
//!
//! The connection engine sends and receives one MTU-sized packet at a time
//! through a [`PacketChannel`]. Two interchangeable substrates implement
//! it: a direct UDP channel (one datagram = one packet, bound to a local
//! address) and an ICE channel that tunnels packets through a
//! connectivity-established candidate pair, possibly relayed.
//!
//! The receive side always blocks for a short bounded interval (around
//! 10 ms) and then reports [`ChannelError::Again`] so the engine can
//! interleave its timer work; a closed channel reports the distinct
//! [`ChannelError::Closed`].
//!
//! [`RoutedChannel`] lets several connections share one bound substrate: a
//! pump task owned by the socket layer reads the real channel and routes
//! each packet by destination socket id into a per-connection queue, and
//! every connection keeps the strictly per-connection channel view the
//! engine expects.

pub mod ice;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::ChannelError;
use crate::packet::Packet;

pub use ice::{IceChannel, IceConfig, RelayTransport, TurnRelay, DEFAULT_STUN_PORT};
pub use udp::UdpChannel;

/// Bounded interval a `recv_from` call may block before reporting `Again`.
pub const RECV_POLL: Duration = Duration::from_millis(10);

/// Default substrate buffer size preference in bytes.
pub const DEFAULT_BUF_SIZE: usize = 65536;

/// One-packet-at-a-time datagram substrate used by the connection engine.
#[async_trait]
pub trait PacketChannel: Send + Sync {
    /// Acquires the substrate resource. Idempotent: opening an open
    /// channel is a no-op.
    async fn open(&self) -> Result<(), ChannelError>;

    /// Releases the resource and unblocks any in-progress `recv_from`.
    async fn close(&self);

    /// Best known local address; `None` before the substrate settles.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Best known peer address; `None` before the substrate settles.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Advisory send-buffer size; the channel may clamp.
    fn snd_buf_size(&self) -> usize;

    /// Advisory receive-buffer size; the channel may clamp.
    fn rcv_buf_size(&self) -> usize;

    /// Sets the advisory send-buffer size (applied at next `open`).
    fn set_snd_buf_size(&self, bytes: usize);

    /// Sets the advisory receive-buffer size (applied at next `open`).
    fn set_rcv_buf_size(&self, bytes: usize);

    /// Sends one packet as one datagram. `addr` names the destination for
    /// address-oriented substrates and is ignored by connected ones.
    async fn send_to(&self, addr: Option<SocketAddr>, pkt: &Packet)
        -> Result<usize, ChannelError>;

    /// Receives one packet, blocking for at most [`RECV_POLL`].
    async fn recv_from(&self) -> Result<(Option<SocketAddr>, Packet), ChannelError>;

    /// Maximum datagram size this channel can carry.
    fn mtu(&self) -> usize {
        crate::packet::DEFAULT_MSS
    }
}

/// A packet routed by the socket layer's pump task.
pub type RoutedPacket = (Option<SocketAddr>, Packet);

/// Per-connection view over a shared, pumped substrate.
///
/// Sending goes straight to the underlying channel (stamped with the
/// connection's peer address); receiving pops this connection's routed
/// queue with the same bounded-block contract as a real channel. When the
/// pump drops the queue's sender the channel reads as closed.
pub struct RoutedChannel {
    inner: Arc<dyn PacketChannel>,
    peer: Mutex<Option<SocketAddr>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<RoutedPacket>>,
}

impl RoutedChannel {
    /// Wraps `inner`, receiving from `rx` instead of the shared substrate.
    pub fn new(inner: Arc<dyn PacketChannel>, rx: mpsc::Receiver<RoutedPacket>) -> Self {
        RoutedChannel {
            inner,
            peer: Mutex::new(None),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Fixes the peer address used for sends without an explicit address.
    pub fn set_peer(&self, addr: Option<SocketAddr>) {
        *self.peer.lock() = addr;
    }
}

#[async_trait]
impl PacketChannel for RoutedChannel {
    async fn open(&self) -> Result<(), ChannelError> {
        self.inner.open().await
    }

    async fn close(&self) {
        // The shared substrate stays open for sibling connections; closing
        // a routed view just stops consuming. The pump notices the dropped
        // receiver and unregisters the route.
        self.rx.lock().await.close();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (*self.peer.lock()).or_else(|| self.inner.peer_addr())
    }

    fn snd_buf_size(&self) -> usize {
        self.inner.snd_buf_size()
    }

    fn rcv_buf_size(&self) -> usize {
        self.inner.rcv_buf_size()
    }

    fn set_snd_buf_size(&self, bytes: usize) {
        self.inner.set_snd_buf_size(bytes);
    }

    fn set_rcv_buf_size(&self, bytes: usize) {
        self.inner.set_rcv_buf_size(bytes);
    }

    async fn send_to(&self, addr: Option<SocketAddr>, pkt: &Packet)
        -> Result<usize, ChannelError> {
        let addr = addr.or_else(|| *self.peer.lock());
        self.inner.send_to(addr, pkt).await
    }

    async fn recv_from(&self) -> Result<(Option<SocketAddr>, Packet), ChannelError> {
        let mut rx = self.rx.lock().await;
        match timeout(RECV_POLL, rx.recv()).await {
            Ok(Some(routed)) => Ok(routed),
            Ok(None) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::Again),
        }
    }

    fn mtu(&self) -> usize {
        self.inner.mtu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ControlPacket, Control};

    fn keepalive(dst: u32) -> Packet {
        Packet::Control(ControlPacket {
            timestamp: 0,
            dst_id: dst,
            body: Control::KeepAlive,
        })
    }

    #[tokio::test]
    async fn routed_channel_preserves_queue_order_and_reports_closed() {
        let inner = Arc::new(UdpChannel::new("127.0.0.1:0".parse().unwrap()));
        inner.open().await.unwrap();
        let (tx, rx) = mpsc::channel(8);
        let routed = RoutedChannel::new(inner, rx);

        tx.send((None, keepalive(1))).await.unwrap();
        tx.send((None, keepalive(2))).await.unwrap();
        let (_, first) = routed.recv_from().await.unwrap();
        let (_, second) = routed.recv_from().await.unwrap();
        assert_eq!(first.dst_id(), 1);
        assert_eq!(second.dst_id(), 2);

        // Empty queue: bounded block then Again.
        assert!(matches!(routed.recv_from().await, Err(ChannelError::Again)));

        // Pump gone: distinct closed error.
        drop(tx);
        assert!(matches!(routed.recv_from().await, Err(ChannelError::Closed)));
    }
}
