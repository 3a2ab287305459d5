//! # Direct UDP Channel
//!
//! One datagram carries exactly one packet. The substrate socket is sized
//! through socket2 before being handed to tokio, and receives poll with a
//! short timeout so the engine's timers stay responsive.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{PacketChannel, DEFAULT_BUF_SIZE, RECV_POLL};
use crate::error::ChannelError;
use crate::packet::{Packet, DEFAULT_MSS};

/// Packet channel over a bound UDP socket.
pub struct UdpChannel {
    bind_addr: SocketAddr,
    sock: RwLock<Option<Arc<UdpSocket>>>,
    snd_buf: AtomicUsize,
    rcv_buf: AtomicUsize,
    reuse_addr: AtomicBool,
    mtu: usize,
}

impl UdpChannel {
    /// Creates a channel that will bind `bind_addr` on open. Use port 0
    /// for an ephemeral port.
    pub fn new(bind_addr: SocketAddr) -> Self {
        UdpChannel {
            bind_addr,
            sock: RwLock::new(None),
            snd_buf: AtomicUsize::new(DEFAULT_BUF_SIZE),
            rcv_buf: AtomicUsize::new(DEFAULT_BUF_SIZE),
            reuse_addr: AtomicBool::new(false),
            mtu: DEFAULT_MSS,
        }
    }

    /// Requests SO_REUSEADDR on the substrate socket at the next open.
    pub fn set_reuse_addr(&self, reuse: bool) {
        self.reuse_addr.store(reuse, Ordering::Relaxed);
    }

    /// Whether SO_REUSEADDR will be requested.
    pub fn reuse_addr(&self) -> bool {
        self.reuse_addr.load(Ordering::Relaxed)
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, ChannelError> {
        self.sock.read().clone().ok_or(ChannelError::Closed)
    }
}

#[async_trait]
impl PacketChannel for UdpChannel {
    async fn open(&self) -> Result<(), ChannelError> {
        if self.sock.read().is_some() {
            return Ok(());
        }
        let domain = if self.bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let raw = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| ChannelError::Broken(e.to_string()))?;
        // Buffer sizing is advisory; the kernel may clamp, and a refusal is
        // not fatal.
        if let Err(e) = raw.set_send_buffer_size(self.snd_buf.load(Ordering::Relaxed)) {
            warn!("failed to size UDP send buffer: {e}");
        }
        if let Err(e) = raw.set_recv_buffer_size(self.rcv_buf.load(Ordering::Relaxed)) {
            warn!("failed to size UDP receive buffer: {e}");
        }
        if self.reuse_addr.load(Ordering::Relaxed) {
            raw.set_reuse_address(true)
                .map_err(|e| ChannelError::Broken(e.to_string()))?;
        }
        raw.bind(&self.bind_addr.into())
            .map_err(|e| ChannelError::Broken(e.to_string()))?;
        raw.set_nonblocking(true)
            .map_err(|e| ChannelError::Broken(e.to_string()))?;
        let sock = UdpSocket::from_std(raw.into())
            .map_err(|e| ChannelError::Broken(e.to_string()))?;
        debug!("UDP channel bound to {:?}", sock.local_addr().ok());
        *self.sock.write() = Some(Arc::new(sock));
        Ok(())
    }

    async fn close(&self) {
        *self.sock.write() = None;
        debug!("UDP channel closed");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.read().as_ref().and_then(|s| s.local_addr().ok())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn snd_buf_size(&self) -> usize {
        self.snd_buf.load(Ordering::Relaxed)
    }

    fn rcv_buf_size(&self) -> usize {
        self.rcv_buf.load(Ordering::Relaxed)
    }

    fn set_snd_buf_size(&self, bytes: usize) {
        self.snd_buf.store(bytes, Ordering::Relaxed);
    }

    fn set_rcv_buf_size(&self, bytes: usize) {
        self.rcv_buf.store(bytes, Ordering::Relaxed);
    }

    async fn send_to(&self, addr: Option<SocketAddr>, pkt: &Packet)
        -> Result<usize, ChannelError> {
        let sock = self.socket()?;
        let addr = addr.ok_or_else(|| {
            ChannelError::Broken("UDP channel needs a destination address".into())
        })?;
        let mut buf = Vec::with_capacity(pkt.wire_len());
        pkt.encode(&mut buf);
        match sock.send_to(&buf, addr).await {
            Ok(n) => Ok(n),
            Err(e) => {
                debug!("UDP send to {addr} failed: {e}");
                Err(ChannelError::Broken(e.to_string()))
            }
        }
    }

    async fn recv_from(&self) -> Result<(Option<SocketAddr>, Packet), ChannelError> {
        let sock = self.socket()?;
        let mut buf = vec![0u8; self.mtu];
        match timeout(RECV_POLL, sock.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => match Packet::decode(&buf[..len]) {
                Ok(pkt) => Ok((Some(addr), pkt)),
                Err(e) => {
                    // A stray or corrupt datagram is dropped, not fatal.
                    debug!("discarding undecodable datagram from {addr}: {e}");
                    Err(ChannelError::Again)
                }
            },
            Ok(Err(e)) => {
                if self.sock.read().is_none() {
                    return Err(ChannelError::Closed);
                }
                Err(ChannelError::Broken(e.to_string()))
            }
            Err(_) => Err(ChannelError::Again),
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Control, ControlPacket, DataPacket, Boundary};
    use crate::seq::{MsgNo, SeqNo};

    #[tokio::test]
    async fn datagrams_cross_a_loopback_pair() {
        let a = UdpChannel::new("127.0.0.1:0".parse().unwrap());
        let b = UdpChannel::new("127.0.0.1:0".parse().unwrap());
        a.open().await.unwrap();
        // Idempotent open.
        a.open().await.unwrap();
        b.open().await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let pkt = Packet::Data(DataPacket {
            seq: SeqNo::new(3),
            msg: MsgNo::new(1),
            boundary: Boundary::Solo,
            in_order: true,
            timestamp: 0,
            dst_id: 9,
            payload: b"ping".to_vec(),
        });
        a.send_to(Some(b_addr), &pkt).await.unwrap();

        let received = loop {
            match b.recv_from().await {
                Ok((from, got)) => {
                    assert!(from.is_some());
                    break got;
                }
                Err(ChannelError::Again) => continue,
                Err(e) => panic!("unexpected channel error: {e}"),
            }
        };
        assert_eq!(received, pkt);
    }

    #[tokio::test]
    async fn receive_on_an_empty_socket_reports_again() {
        let ch = UdpChannel::new("127.0.0.1:0".parse().unwrap());
        ch.open().await.unwrap();
        assert!(matches!(ch.recv_from().await, Err(ChannelError::Again)));
    }

    #[tokio::test]
    async fn closed_channel_refuses_io() {
        let ch = UdpChannel::new("127.0.0.1:0".parse().unwrap());
        ch.open().await.unwrap();
        ch.close().await;
        let pkt = Packet::Control(ControlPacket {
            timestamp: 0,
            dst_id: 0,
            body: Control::KeepAlive,
        });
        assert!(matches!(
            ch.send_to(Some("127.0.0.1:1".parse().unwrap()), &pkt).await,
            Err(ChannelError::Closed)
        ));
        assert!(matches!(ch.recv_from().await, Err(ChannelError::Closed)));
    }
}
