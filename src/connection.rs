//! # Connection Engine
//!
//! One connection owns a send buffer, a receive buffer, two loss lists and
//! a congestion controller, and runs two cooperating tasks:
//!
//! - the **sender task** paces packet emissions on the congestion
//!   controller's clock, serving the sender loss list in strict priority
//!   over fresh data and emitting every 16th packet back-to-back with its
//!   successor as a bandwidth probe pair;
//! - the **receiver task** interleaves bounded channel reads with the
//!   SYN-derived timers: full ACKs every 10 ms, RTT-paced NAKs, keep-alives
//!   after a second of silence, and connection expiry after sixteen.
//!
//! User-facing operations (`send`/`recv`/`sendmsg`/`recvmsg`) touch the
//! buffers under short critical sections and park on notifies; the tasks
//! never call back into user code. All state transitions funnel through
//! the status mutex so a `close` or a peer `SHUTDOWN` wakes every waiter
//! exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::buffer::{Deposit, RcvBuffer, SndBuffer};
use crate::channel::PacketChannel;
use crate::congestion::RateController;
use crate::error::{ChannelError, Result, TransportError};
use crate::loss::{RcvLossList, SndLossList};
use crate::metrics::{PerfCounters, TraceInfo};
use crate::packet::{
    AckInfo, Control, ControlPacket, DataPacket, Handshake, Packet, SocketType, HS_FINAL,
    HS_RENDEZVOUS, HS_REQUEST, HS_RESPONSE, PKT_OVERHEAD,
};
use crate::seq::SeqNo;

/// The SYN interval: full-ACK cadence and the rate-control tick.
pub const SYN_INTERVAL: Duration = Duration::from_millis(10);

/// Idle interval after which a keep-alive is emitted.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Silence interval after which the connection is declared broken.
const EXP_TIMEOUT: Duration = Duration::from_secs(16);

/// Handshake retransmission cadence.
const HS_RETRY: Duration = Duration::from_millis(250);

/// Default handshake timeout.
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(3);

/// Protocol version spoken by this crate.
pub const PROTO_VERSION: u32 = 4;

/// Cap on loss ranges packed into one NAK.
const MAX_NAK_RANGES: usize = 128;

/// Samples kept by the receive-rate and packet-pair median filters.
const RATE_WINDOW: usize = 16;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Created, not yet connecting.
    Init,
    /// Handshake in progress.
    Opening,
    /// Established and exchanging data.
    Connected,
    /// Local close in progress (draining).
    Closing,
    /// Failed; every operation reports a connection error.
    Broken,
    /// Fully closed.
    Closed,
}

/// Per-connection configuration, frozen at connect time.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Stream or message semantics.
    pub sock_type: SocketType,
    /// Maximum segment size including UDP/IP framing.
    pub mss: usize,
    /// Send-buffer capacity in packets.
    pub snd_buf_pkts: usize,
    /// Receive-buffer capacity in packets.
    pub rcv_buf_pkts: usize,
    /// Blocking send mode.
    pub snd_syn: bool,
    /// Blocking receive mode.
    pub rcv_syn: bool,
    /// Optional cap on a blocking send.
    pub snd_timeout: Option<Duration>,
    /// Optional cap on a blocking receive.
    pub rcv_timeout: Option<Duration>,
    /// How long `close` waits for unsent data to drain.
    pub linger: Duration,
    /// Handshake timeout.
    pub conn_timeout: Duration,
    /// Rendezvous connection mode.
    pub rendezvous: bool,
    /// Maximum message size accepted by `sendmsg`.
    pub max_msg: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            sock_type: SocketType::Stream,
            mss: crate::packet::DEFAULT_MSS,
            snd_buf_pkts: 8192,
            rcv_buf_pkts: 8192,
            snd_syn: true,
            rcv_syn: true,
            snd_timeout: None,
            rcv_timeout: None,
            linger: Duration::from_secs(3),
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            rendezvous: false,
            max_msg: 8 * 1024 * 1024,
        }
    }
}

impl ConnConfig {
    /// Application payload bytes carried per packet.
    pub fn payload_size(&self) -> usize {
        self.mss.saturating_sub(PKT_OVERHEAD).max(1)
    }
}

#[derive(Debug)]
struct SndState {
    buffer: SndBuffer,
    loss: SndLossList,
    /// Peer's next expected sequence; everything below is acknowledged.
    last_ack: SeqNo,
    /// Next fresh sequence to transmit.
    next_send: SeqNo,
    /// Newest sequence ever handed to the channel.
    largest_sent: SeqNo,
    flow_window: u32,
    rtt_us: u32,
    rtt_var_us: u32,
    bandwidth_pps: u32,
    recv_rate_pps: u32,
    next_ttl_check: Instant,
}

#[derive(Debug)]
struct AckRecord {
    serial: u32,
    sent: Instant,
}

#[derive(Debug)]
struct RcvState {
    buffer: RcvBuffer,
    loss: RcvLossList,
    /// Largest sequence observed from the peer.
    largest_seq: SeqNo,
    ack_serial: u32,
    ack_window: Vec<AckRecord>,
    rtt_us: u32,
    rtt_var_us: u32,
    last_arrival: Option<Instant>,
    probe_arrival: Option<Instant>,
    arrival_intervals_us: Vec<u32>,
    pair_intervals_us: Vec<u32>,
}

impl RcvState {
    fn nak_delay(&self) -> Duration {
        Duration::from_micros(self.rtt_us.max(SYN_INTERVAL.as_micros() as u32) as u64)
    }

    fn recv_rate_pps(&self) -> u32 {
        match median(&self.arrival_intervals_us) {
            Some(us) if us > 0 => (1_000_000 / us as u64) as u32,
            _ => 0,
        }
    }

    fn bandwidth_pps(&self) -> u32 {
        match median(&self.pair_intervals_us) {
            Some(us) if us > 0 => (1_000_000 / us as u64) as u32,
            _ => 0,
        }
    }
}

fn median(samples: &[u32]) -> Option<u32> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    Some(sorted[sorted.len() / 2])
}

fn push_sample(window: &mut Vec<u32>, sample: u32) {
    if window.len() == RATE_WINDOW {
        window.remove(0);
    }
    window.push(sample);
}

pub(crate) struct Core {
    pub id: u32,
    pub peer_id: AtomicU32,
    cfg: ConnConfig,
    channel: Arc<dyn PacketChannel>,
    status: Mutex<Status>,
    status_notify: Notify,
    snd: Mutex<Option<SndState>>,
    rcv: Mutex<Option<RcvState>>,
    cc: Mutex<RateController>,
    pub stats: PerfCounters,
    /// Wakes the sender task: new data, fresh loss, opened window.
    snd_wake: Notify,
    /// Wakes user sends blocked on buffer space.
    snd_space: Notify,
    /// Wakes user receives blocked on deliverable data.
    rcv_ready: Notify,
    peer_shutdown: AtomicBool,
    eos_reported: AtomicBool,
    payload_size: AtomicUsize,
    /// Our initial sequence number, fixed at establishment.
    local_isn: Mutex<SeqNo>,
    start: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    fn now_ts(&self) -> u32 {
        self.start.elapsed().as_micros() as u32
    }

    fn status(&self) -> Status {
        *self.status.lock()
    }

    fn wake_all(&self) {
        self.status_notify.notify_waiters();
        self.snd_wake.notify_waiters();
        self.snd_space.notify_waiters();
        self.rcv_ready.notify_waiters();
    }

    fn mark_broken(&self, why: &str) {
        {
            let mut st = self.status.lock();
            if matches!(*st, Status::Closed | Status::Broken) {
                return;
            }
            *st = Status::Broken;
        }
        warn!(id = self.id, "connection broken: {why}");
        self.wake_all();
    }

    fn control(&self, body: Control) -> Packet {
        Packet::Control(ControlPacket {
            timestamp: self.now_ts(),
            dst_id: self.peer_id.load(Ordering::Relaxed),
            body,
        })
    }

    async fn emit(&self, pkt: &Packet) -> bool {
        match self.channel.send_to(None, pkt).await {
            Ok(_) => true,
            Err(ChannelError::Again) => false,
            Err(e) => {
                self.mark_broken(&format!("channel send failed: {e}"));
                false
            }
        }
    }
}

/// A live transport connection.
pub struct Connection {
    core: Arc<Core>,
}

impl Connection {
    /// Creates an unconnected engine over `channel`.
    pub(crate) fn new(id: u32, cfg: ConnConfig, channel: Arc<dyn PacketChannel>) -> Self {
        let payload = cfg.payload_size();
        Connection {
            core: Arc::new(Core {
                id,
                peer_id: AtomicU32::new(0),
                cfg,
                channel,
                status: Mutex::new(Status::Init),
                status_notify: Notify::new(),
                snd: Mutex::new(None),
                rcv: Mutex::new(None),
                cc: Mutex::new(RateController::new(SYN_INTERVAL)),
                stats: PerfCounters::default(),
                snd_wake: Notify::new(),
                snd_space: Notify::new(),
                rcv_ready: Notify::new(),
                peer_shutdown: AtomicBool::new(false),
                eos_reported: AtomicBool::new(false),
                payload_size: AtomicUsize::new(payload),
                local_isn: Mutex::new(SeqNo::ZERO),
                start: Instant::now(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Socket identifier this connection answers to.
    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// Current lifecycle status.
    pub fn status(&self) -> Status {
        self.core.status()
    }

    /// Peer address as currently observed by the channel.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.channel.peer_addr()
    }

    /// Local handshake image used while connecting.
    fn local_handshake(&self, req_type: i32, cookie: u32, isn: SeqNo) -> Handshake {
        Handshake {
            version: PROTO_VERSION,
            sock_type: self.core.cfg.sock_type,
            init_seq: isn,
            mss: self.core.cfg.mss as u32,
            flow_window: self.core.cfg.rcv_buf_pkts as u32,
            req_type,
            socket_id: self.core.id,
            cookie,
            peer_ip: encode_peer_ip(self.core.channel.peer_addr()),
        }
    }

    /// Caller-initiated handshake: request, response, cookie-echoing
    /// final. In rendezvous mode both sides start with type-0 requests and
    /// converge on the same exchange.
    pub(crate) async fn connect(&self) -> Result<()> {
        {
            let mut st = self.core.status.lock();
            if !matches!(*st, Status::Init) {
                return Err(TransportError::InvalidState("already connecting or connected"));
            }
            *st = Status::Opening;
        }

        let rendezvous = self.core.cfg.rendezvous;
        let isn = SeqNo::random();
        let req_type = if rendezvous { HS_RENDEZVOUS } else { HS_REQUEST };
        let request = self.local_handshake(req_type, 0, isn);
        let deadline = Instant::now() + self.core.cfg.conn_timeout;

        let mut peer_hs: Option<Handshake> = None;
        let mut responded_final = false;

        'handshake: loop {
            let hs_pkt = Packet::Control(ControlPacket {
                timestamp: self.core.now_ts(),
                dst_id: 0,
                body: Control::Handshake(request),
            });
            if let Err(e) = self.core.channel.send_to(None, &hs_pkt).await {
                if !matches!(e, ChannelError::Again) {
                    *self.core.status.lock() = Status::Closed;
                    return Err(TransportError::from(e));
                }
            }

            let retry_at = Instant::now() + HS_RETRY;
            while Instant::now() < retry_at {
                if Instant::now() >= deadline {
                    break;
                }
                let resp = match self.core.channel.recv_from().await {
                    Ok((_, Packet::Control(ControlPacket {
                        body: Control::Handshake(hs),
                        ..
                    }))) => hs,
                    Ok(_) => continue,
                    Err(ChannelError::Again) => continue,
                    Err(e) => {
                        *self.core.status.lock() = Status::Closed;
                        return Err(TransportError::from(e));
                    }
                };

                match resp.req_type {
                    HS_RESPONSE => {
                        // Echo the cookie; the responder will not commit the
                        // connection until it sees it back.
                        let mut fin = self.local_handshake(HS_FINAL, resp.cookie, isn);
                        fin.peer_ip = resp.peer_ip;
                        let fin_pkt = Packet::Control(ControlPacket {
                            timestamp: self.core.now_ts(),
                            dst_id: 0,
                            body: Control::Handshake(fin),
                        });
                        let _ = self.core.channel.send_to(None, &fin_pkt).await;
                        // In rendezvous mode the peer's request may already
                        // be on file; both carry the same ISN and id.
                        peer_hs.get_or_insert(resp);
                        break 'handshake;
                    }
                    HS_RENDEZVOUS if rendezvous => {
                        // Answer the peer's request; keep retransmitting our
                        // own until a response or final arrives.
                        let reply = self.local_handshake(HS_RESPONSE, 0, isn);
                        let reply_pkt = Packet::Control(ControlPacket {
                            timestamp: self.core.now_ts(),
                            dst_id: 0,
                            body: Control::Handshake(reply),
                        });
                        let _ = self.core.channel.send_to(None, &reply_pkt).await;
                        peer_hs.get_or_insert(resp);
                    }
                    HS_FINAL if rendezvous => {
                        peer_hs.get_or_insert(resp);
                        responded_final = true;
                        break 'handshake;
                    }
                    _ => {
                        trace!(id = self.core.id, "ignoring handshake step {}", resp.req_type);
                    }
                }
            }

            if Instant::now() >= deadline {
                // Timed out: the socket ends up CLOSED, not broken.
                *self.core.status.lock() = Status::Closed;
                return Err(TransportError::ConnTimeout);
            }
        }

        let peer = peer_hs.expect("loop exits with a peer handshake");
        if rendezvous && !responded_final {
            let fin = self.local_handshake(HS_FINAL, peer.cookie, isn);
            let fin_pkt = Packet::Control(ControlPacket {
                timestamp: self.core.now_ts(),
                dst_id: 0,
                body: Control::Handshake(fin),
            });
            let _ = self.core.channel.send_to(None, &fin_pkt).await;
        }
        self.establish(isn, &peer);
        Ok(())
    }

    /// Installs buffers and spawns the engine tasks. Used by `connect` and
    /// by the listener when a final handshake commits a pending request.
    pub(crate) fn establish(&self, local_isn: SeqNo, peer: &Handshake) {
        let core = &self.core;
        core.peer_id.store(peer.socket_id, Ordering::Relaxed);
        *core.local_isn.lock() = local_isn;
        let mss = core.cfg.mss.min(peer.mss as usize).max(PKT_OVERHEAD + 1);
        core.payload_size.store(mss - PKT_OVERHEAD, Ordering::Relaxed);

        let now = Instant::now();
        *core.snd.lock() = Some(SndState {
            buffer: SndBuffer::new(local_isn, core.cfg.snd_buf_pkts),
            loss: SndLossList::new(),
            last_ack: local_isn,
            next_send: local_isn,
            largest_sent: local_isn.prev(),
            flow_window: peer.flow_window.max(1),
            rtt_us: 100_000,
            rtt_var_us: 50_000,
            bandwidth_pps: 0,
            recv_rate_pps: 0,
            next_ttl_check: now,
        });
        *core.rcv.lock() = Some(RcvState {
            buffer: RcvBuffer::new(peer.init_seq, core.cfg.rcv_buf_pkts),
            loss: RcvLossList::new(),
            largest_seq: peer.init_seq.prev(),
            ack_serial: 0,
            ack_window: Vec::new(),
            rtt_us: 100_000,
            rtt_var_us: 50_000,
            last_arrival: None,
            probe_arrival: None,
            arrival_intervals_us: Vec::new(),
            pair_intervals_us: Vec::new(),
        });
        *core.status.lock() = Status::Connected;
        core.status_notify.notify_waiters();

        let mut tasks = core.tasks.lock();
        tasks.push(tokio::spawn(sender_task(core.clone())));
        tasks.push(tokio::spawn(receiver_task(core.clone())));
        debug!(
            id = core.id,
            peer = peer.socket_id,
            "connection established (isn {}, peer isn {})",
            local_isn.raw(),
            peer.init_seq.raw()
        );
    }

    fn ensure_stream(&self) -> Result<()> {
        if self.core.cfg.sock_type != SocketType::Stream {
            return Err(TransportError::InvalidState("a message-mode socket"));
        }
        Ok(())
    }

    fn ensure_dgram(&self) -> Result<()> {
        if self.core.cfg.sock_type != SocketType::Dgram {
            return Err(TransportError::InvalidState("a stream-mode socket"));
        }
        Ok(())
    }

    fn send_status_err(&self) -> Option<TransportError> {
        match self.core.status() {
            Status::Connected => None,
            Status::Broken => Some(TransportError::ConnBroken),
            Status::Init | Status::Opening => {
                Some(TransportError::InvalidState("not connected"))
            }
            Status::Closing | Status::Closed => Some(TransportError::ConnLost),
        }
    }

    /// Bytestream send: admits as much of `data` as fits and returns the
    /// number of bytes accepted, blocking for space in blocking mode.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        self.ensure_stream()?;
        self.send_admit(data, None, true, false).await
    }

    /// Message send: the entire buffer becomes one message with the given
    /// in-order flag and optional time-to-live.
    pub async fn sendmsg(
        &self,
        data: &[u8],
        ttl: Option<Duration>,
        in_order: bool,
    ) -> Result<usize> {
        self.ensure_dgram()?;
        if data.is_empty() {
            return Ok(0);
        }
        let payload = self.core.payload_size.load(Ordering::Relaxed);
        let pkts = data.len().div_ceil(payload);
        if data.len() > self.core.cfg.max_msg || pkts > self.core.cfg.snd_buf_pkts {
            return Err(TransportError::MessageTooLarge);
        }
        self.send_admit(data, ttl, in_order, true).await
    }

    async fn send_admit(
        &self,
        data: &[u8],
        ttl: Option<Duration>,
        in_order: bool,
        whole: bool,
    ) -> Result<usize> {
        let payload = self.core.payload_size.load(Ordering::Relaxed);
        let deadline = self.core.cfg.snd_timeout.map(|t| Instant::now() + t);
        loop {
            // Register for the space signal before checking, so a
            // concurrent acknowledgement cannot slip between the check and
            // the wait.
            let space = self.core.snd_space.notified();
            if let Some(e) = self.send_status_err() {
                return Err(e);
            }
            {
                let mut guard = self.core.snd.lock();
                let snd = guard.as_mut().expect("connected");
                let free = snd.buffer.free();
                let needed = data.len().div_ceil(payload).max(1);
                if whole && free >= needed {
                    snd.buffer.add(data, payload, in_order, ttl, Instant::now());
                    self.core.snd_wake.notify_waiters();
                    return Ok(data.len());
                }
                if !whole && free > 0 {
                    let take = data.len().min(free * payload);
                    snd.buffer.add(&data[..take], payload, in_order, ttl, Instant::now());
                    self.core.snd_wake.notify_waiters();
                    return Ok(take);
                }
            }
            if !self.core.cfg.snd_syn {
                return Err(TransportError::WouldBlock);
            }
            park(space, deadline).await?;
        }
    }

    /// Bytestream receive: copies in-order bytes into `buf`, blocking in
    /// blocking mode. Returns 0 exactly once at end-of-stream after a peer
    /// shutdown.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_stream()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = self.core.cfg.rcv_timeout.map(|t| Instant::now() + t);
        loop {
            let ready = self.core.rcv_ready.notified();
            {
                let mut guard = self.core.rcv.lock();
                if let Some(rcv) = guard.as_mut() {
                    let n = rcv.buffer.read_stream(buf);
                    if n > 0 {
                        return Ok(n);
                    }
                }
            }
            if let Some(n) = self.check_eos()? {
                return Ok(n);
            }
            if !self.core.cfg.rcv_syn {
                return Err(TransportError::WouldBlock);
            }
            park(ready, deadline).await?;
        }
    }

    /// Message receive: returns the next complete message, honouring the
    /// out-of-order acceptance flag.
    pub async fn recvmsg(&self, allow_out_of_order: bool) -> Result<Vec<u8>> {
        self.ensure_dgram()?;
        let deadline = self.core.cfg.rcv_timeout.map(|t| Instant::now() + t);
        loop {
            let ready = self.core.rcv_ready.notified();
            {
                let mut guard = self.core.rcv.lock();
                if let Some(rcv) = guard.as_mut() {
                    if let Some(msg) = rcv.buffer.read_message(allow_out_of_order) {
                        return Ok(msg);
                    }
                }
            }
            if self.check_eos()?.is_some() {
                return Ok(Vec::new());
            }
            if !self.core.cfg.rcv_syn {
                return Err(TransportError::WouldBlock);
            }
            park(ready, deadline).await?;
        }
    }

    /// End-of-stream and error handling shared by the receive paths.
    fn check_eos(&self) -> Result<Option<usize>> {
        if self.core.peer_shutdown.load(Ordering::Relaxed) {
            if !self.core.eos_reported.swap(true, Ordering::Relaxed) {
                return Ok(Some(0));
            }
            return Err(TransportError::ConnBroken);
        }
        match self.core.status() {
            Status::Broken => Err(TransportError::ConnBroken),
            Status::Closed | Status::Closing => Err(TransportError::ConnLost),
            _ => Ok(None),
        }
    }


    /// Streams `len` bytes from `file` over the bytestream engine.
    pub async fn sendfile(&self, file: &mut tokio::fs::File, len: u64) -> Result<u64> {
        use tokio::io::AsyncReadExt;
        self.ensure_stream()?;
        let mut remaining = len;
        let mut chunk = vec![0u8; 65536];
        while remaining > 0 {
            let want = chunk.len().min(remaining as usize);
            let got = file
                .read(&mut chunk[..want])
                .await
                .map_err(TransportError::File)?;
            if got == 0 {
                break;
            }
            let mut off = 0;
            while off < got {
                off += self.send(&chunk[off..got]).await?;
            }
            remaining -= got as u64;
        }
        Ok(len - remaining)
    }

    /// Receives `len` bytes from the bytestream engine into `file`.
    pub async fn recvfile(&self, file: &mut tokio::fs::File, len: u64) -> Result<u64> {
        use tokio::io::AsyncWriteExt;
        self.ensure_stream()?;
        let mut remaining = len;
        let mut chunk = vec![0u8; 65536];
        while remaining > 0 {
            let want = chunk.len().min(remaining as usize);
            let got = self.recv(&mut chunk[..want]).await?;
            if got == 0 {
                break;
            }
            file.write_all(&chunk[..got])
                .await
                .map_err(TransportError::File)?;
            remaining -= got as u64;
        }
        file.flush().await.map_err(TransportError::File)?;
        Ok(len - remaining)
    }

    /// Whether a receive would make progress without blocking.
    pub fn readable(&self) -> bool {
        if self.core.peer_shutdown.load(Ordering::Relaxed) {
            return true;
        }
        if matches!(self.core.status(), Status::Broken) {
            return true;
        }
        let guard = self.core.rcv.lock();
        match guard.as_ref() {
            Some(rcv) => match self.core.cfg.sock_type {
                SocketType::Stream => rcv.buffer.deliverable_bytes() > 0,
                SocketType::Dgram => rcv.buffer.message_ready(true),
            },
            None => false,
        }
    }

    /// Whether a send would make progress without blocking.
    pub fn writable(&self) -> bool {
        if matches!(self.core.status(), Status::Broken) {
            return true;
        }
        let guard = self.core.snd.lock();
        matches!(guard.as_ref(), Some(snd) if snd.buffer.free() > 0)
    }

    /// Whether the connection is in an error state.
    pub fn in_error(&self) -> bool {
        matches!(self.core.status(), Status::Broken)
    }

    /// Snapshot of the connection's performance state.
    pub fn perfmon(&self) -> TraceInfo {
        let (rtt, flow) = {
            let guard = self.core.snd.lock();
            match guard.as_ref() {
                Some(snd) => (snd.rtt_us, snd.flow_window),
                None => (0, 0),
            }
        };
        let (cwnd, period) = {
            let cc = self.core.cc.lock();
            (cc.window(), cc.period_us())
        };
        TraceInfo::capture(&self.core.stats, self.core.start, rtt, cwnd, flow, period)
    }

    /// Orderly local close: drain within the linger budget, notify the
    /// peer, stop the tasks and release the channel.
    pub async fn close(&self) {
        let was_connected = {
            let mut st = self.core.status.lock();
            match *st {
                Status::Closed => return,
                Status::Connected => {
                    *st = Status::Closing;
                    true
                }
                _ => {
                    *st = Status::Closed;
                    false
                }
            }
        };

        if was_connected {
            // Linger: give buffered data a bounded chance to drain.
            let deadline = Instant::now() + self.core.cfg.linger;
            loop {
                let drained = {
                    let guard = self.core.snd.lock();
                    guard.as_ref().map(|s| s.buffer.is_empty()).unwrap_or(true)
                };
                if drained || Instant::now() >= deadline || self.core.status() == Status::Broken
                {
                    break;
                }
                let _ = timeout(SYN_INTERVAL, self.core.snd_space.notified()).await;
            }
            let shutdown = self.core.control(Control::Shutdown);
            let _ = self.core.channel.send_to(None, &shutdown).await;
            let mut st = self.core.status.lock();
            if *st == Status::Closing {
                *st = Status::Closed;
            }
        }

        self.core.wake_all();
        self.core.channel.close().await;
        let handles: Vec<_> = self.core.tasks.lock().drain(..).collect();
        for h in handles {
            let _ = h.await;
        }
        debug!(id = self.core.id, "connection closed");
    }
}

/// Awaits an already-registered wakeup, honouring an optional deadline.
async fn park(wait: impl std::future::Future<Output = ()>, deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return Err(TransportError::Timeout);
            }
            if timeout(d - now, wait).await.is_err() {
                return Err(TransportError::Timeout);
            }
        }
        None => wait.await,
    }
    Ok(())
}

fn encode_peer_ip(addr: Option<SocketAddr>) -> [u32; 4] {
    match addr {
        Some(SocketAddr::V4(v4)) => [u32::from_be_bytes(v4.ip().octets()), 0, 0, 0],
        Some(SocketAddr::V6(v6)) => {
            let o = v6.ip().octets();
            let mut words = [0u32; 4];
            for (i, w) in words.iter_mut().enumerate() {
                *w = u32::from_be_bytes([o[4 * i], o[4 * i + 1], o[4 * i + 2], o[4 * i + 3]]);
            }
            words
        }
        None => [0; 4],
    }
}

/// Time-bucketed syn cookie binding a handshake response to the requester.
pub(crate) fn syn_cookie(addr: Option<SocketAddr>, secret: u64, bucket: u64) -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    secret.hash(&mut hasher);
    bucket.hash(&mut hasher);
    if let Some(addr) = addr {
        addr.hash(&mut hasher);
    }
    let v = hasher.finish();
    ((v >> 32) as u32) ^ (v as u32)
}

/// The pacing loop: retransmissions first, then fresh data within the
/// congestion and flow windows, probe pairs back-to-back.
async fn sender_task(core: Arc<Core>) {
    let mut next_due = Instant::now();
    loop {
        match core.status() {
            Status::Connected | Status::Closing => {}
            _ => break,
        }
        tokio::time::sleep_until(next_due.into()).await;

        // TTL scan rides the pacing clock at SYN cadence.
        let drop_req = {
            let mut guard = core.snd.lock();
            let Some(snd) = guard.as_mut() else { break };
            let now = Instant::now();
            if now >= snd.next_ttl_check {
                snd.next_ttl_check = now + SYN_INTERVAL;
                snd.buffer.expired_message(now).map(|(msg, first, last)| {
                    snd.buffer.drop_message(msg);
                    snd.loss.remove_range(first, last);
                    Control::MsgDrop { msg, first, last }
                })
            } else {
                None
            }
        };
        if let Some(body) = drop_req {
            debug!(id = core.id, "dropping TTL-expired message");
            let pkt = core.control(body);
            core.emit(&pkt).await;
        }

        let picked = {
            let mut guard = core.snd.lock();
            let Some(snd) = guard.as_mut() else { break };
            pick_packet(&core, snd)
        };

        let (pkt, retrans, probe) = match picked {
            Some(p) => p,
            None => {
                // Nothing eligible: park until data, loss or window arrives.
                let _ = timeout(SYN_INTERVAL, core.snd_wake.notified()).await;
                continue;
            }
        };

        let payload_len = match &pkt {
            Packet::Data(d) => d.payload.len() as u64,
            _ => 0,
        };
        if !core.emit(&pkt).await {
            continue;
        }
        PerfCounters::bump(&core.stats.pkt_sent);
        if retrans {
            PerfCounters::bump(&core.stats.pkt_retrans);
            PerfCounters::add(&core.stats.bytes_retrans, payload_len);
        } else {
            PerfCounters::add(&core.stats.bytes_sent, payload_len);
        }

        // The second packet of a probe pair leaves back-to-back so the
        // receiver can measure the link.
        if probe {
            next_due = Instant::now();
        } else {
            next_due = Instant::now() + core.cc.lock().period();
        }
    }
    trace!(id = core.id, "sender task finished");
}

fn pick_packet(core: &Core, snd: &mut SndState) -> Option<(Packet, bool, bool)> {
    // Loss list first, always.
    while let Some(seq) = snd.loss.pop_first() {
        match snd.buffer.block_for(seq) {
            Some(block) if !block.dropped => {
                let pkt = Packet::Data(DataPacket {
                    seq,
                    msg: block.msg,
                    boundary: block.boundary,
                    in_order: block.in_order,
                    timestamp: core.now_ts(),
                    dst_id: core.peer_id.load(Ordering::Relaxed),
                    payload: block.data.clone(),
                });
                return Some((pkt, true, false));
            }
            // Acknowledged or abandoned since the NAK arrived.
            _ => continue,
        }
    }

    let window = {
        let cc = core.cc.lock();
        cc.window().min(snd.flow_window)
    };
    let in_flight = snd.last_ack.offset_to(snd.next_send);
    if in_flight >= window as i32 {
        return None;
    }
    let block = snd.buffer.block_for(snd.next_send)?;
    if block.dropped {
        snd.next_send = snd.next_send.next();
        return pick_packet_skip(core, snd, window);
    }
    let seq = snd.next_send;
    let pkt = Packet::Data(DataPacket {
        seq,
        msg: block.msg,
        boundary: block.boundary,
        in_order: block.in_order,
        timestamp: core.now_ts(),
        dst_id: core.peer_id.load(Ordering::Relaxed),
        payload: block.data.clone(),
    });
    snd.next_send = snd.next_send.next();
    if snd.largest_sent.cmp_to(seq) < 0 {
        snd.largest_sent = seq;
    }
    let probe = seq.raw() % 16 == 0;
    Some((pkt, false, probe))
}

fn pick_packet_skip(core: &Core, snd: &mut SndState, window: u32) -> Option<(Packet, bool, bool)> {
    // Slide over a run of dropped blocks after a TTL abandonment.
    loop {
        let in_flight = snd.last_ack.offset_to(snd.next_send);
        if in_flight >= window as i32 {
            return None;
        }
        let block = snd.buffer.block_for(snd.next_send)?;
        if block.dropped {
            snd.next_send = snd.next_send.next();
            continue;
        }
        let seq = snd.next_send;
        let pkt = Packet::Data(DataPacket {
            seq,
            msg: block.msg,
            boundary: block.boundary,
            in_order: block.in_order,
            timestamp: core.now_ts(),
            dst_id: core.peer_id.load(Ordering::Relaxed),
            payload: block.data.clone(),
        });
        snd.next_send = snd.next_send.next();
        if snd.largest_sent.cmp_to(seq) < 0 {
            snd.largest_sent = seq;
        }
        return Some((pkt, false, seq.raw() % 16 == 0));
    }
}

/// The receive loop: bounded channel reads interleaved with the SYN timers.
async fn receiver_task(core: Arc<Core>) {
    let now = Instant::now();
    let mut next_full_ack = now + SYN_INTERVAL;
    let mut next_nak = now + SYN_INTERVAL;
    let mut last_traffic = now;
    let mut next_keepalive = now + KEEPALIVE_INTERVAL;

    loop {
        match core.status() {
            Status::Connected | Status::Closing => {}
            _ => break,
        }

        match core.channel.recv_from().await {
            Ok((_, Packet::Data(data))) => {
                last_traffic = Instant::now();
                on_data(&core, data).await;
            }
            Ok((_, Packet::Control(ctrl))) => {
                last_traffic = Instant::now();
                on_control(&core, ctrl).await;
            }
            Err(ChannelError::Again) => {}
            Err(ChannelError::Closed) => {
                if core.status() == Status::Connected {
                    core.mark_broken("channel closed under the connection");
                }
                break;
            }
            Err(ChannelError::Broken(e)) => {
                core.mark_broken(&format!("channel failure: {e}"));
                break;
            }
        }

        let now = Instant::now();
        if now >= next_full_ack {
            next_full_ack = now + SYN_INTERVAL;
            send_full_ack(&core).await;
            core.cc.lock().on_rate_tick();
        }
        if now >= next_nak {
            next_nak = now + SYN_INTERVAL;
            send_due_naks(&core).await;
        }
        if now.duration_since(last_traffic) >= KEEPALIVE_INTERVAL && now >= next_keepalive {
            next_keepalive = now + KEEPALIVE_INTERVAL;
            let pkt = core.control(Control::KeepAlive);
            core.emit(&pkt).await;
        }
        if now.duration_since(last_traffic) >= EXP_TIMEOUT {
            core.mark_broken("peer silent beyond the expiry window");
            break;
        }
    }
    trace!(id = core.id, "receiver task finished");
}

async fn on_data(core: &Core, pkt: DataPacket) {
    PerfCounters::bump(&core.stats.pkt_recv);
    let now = Instant::now();
    let light_ack = {
        let mut guard = core.rcv.lock();
        let Some(rcv) = guard.as_mut() else { return };

        // Packet-pair probe: every 16th sequence and its successor leave
        // the sender back-to-back; their spacing samples link capacity.
        if pkt.seq.raw() % 16 == 0 {
            rcv.probe_arrival = Some(now);
        } else if pkt.seq.raw() % 16 == 1 {
            if let Some(t) = rcv.probe_arrival.take() {
                let us = now.duration_since(t).as_micros().max(1) as u32;
                push_sample(&mut rcv.pair_intervals_us, us);
            }
        }
        if let Some(last) = rcv.last_arrival.replace(now) {
            let us = now.duration_since(last).as_micros().max(1) as u32;
            push_sample(&mut rcv.arrival_intervals_us, us);
        }

        let ahead = rcv.largest_seq.offset_to(pkt.seq);
        if ahead > 0 {
            if ahead > 1 {
                // Everything between the previous largest and this arrival
                // is now believed missing; make it NAK-eligible at once.
                let first = rcv.largest_seq.next();
                let last = pkt.seq.prev();
                let delay = rcv.nak_delay();
                rcv.loss.insert(first, last, now - delay);
                PerfCounters::add(&core.stats.pkt_rcv_loss, (ahead - 1) as u64);
            }
            rcv.largest_seq = pkt.seq;
        } else {
            rcv.loss.remove(pkt.seq);
        }

        let len = pkt.payload.len() as u64;
        match rcv.buffer.deposit(pkt) {
            Deposit::Stored => {
                PerfCounters::add(&core.stats.bytes_recv, len);
            }
            Deposit::Duplicate => {
                PerfCounters::bump(&core.stats.pkt_recv_dup);
            }
            Deposit::OutOfWindow => {
                PerfCounters::bump(&core.stats.pkt_recv_dup);
                debug!(id = core.id, "receive buffer overflow, packet dropped");
            }
        }

        Control::Ack { serial: 0, ack_seq: rcv.buffer.ack_seq(), info: None }
    };

    // Light ACK on every received data packet.
    let pkt = core.control(light_ack);
    if core.emit(&pkt).await {
        PerfCounters::bump(&core.stats.pkt_sent_ack);
    }
    core.rcv_ready.notify_waiters();
}

async fn on_control(core: &Core, ctrl: ControlPacket) {
    match ctrl.body {
        Control::Ack { serial, ack_seq, info } => {
            PerfCounters::bump(&core.stats.pkt_recv_ack);
            let ack2 = {
                let mut guard = core.snd.lock();
                let Some(snd) = guard.as_mut() else { return };
                let newly = snd.last_ack.offset_to(ack_seq);
                if newly > 0 {
                    snd.buffer.ack_up_to(ack_seq);
                    snd.loss.remove_below(ack_seq);
                    snd.last_ack = ack_seq;
                    if snd.next_send.cmp_to(ack_seq) < 0 {
                        snd.next_send = ack_seq;
                    }
                }
                if let Some(info) = info {
                    PerfCounters::bump(&core.stats.pkt_recv_ack_full);
                    // Exponential smoothing, alpha = 1/8 and beta = 1/4.
                    let diff = snd.rtt_us.abs_diff(info.rtt);
                    snd.rtt_var_us = (snd.rtt_var_us * 3 + diff) / 4;
                    snd.rtt_us = (snd.rtt_us * 7 + info.rtt) / 8;
                    if info.bandwidth > 0 {
                        snd.bandwidth_pps = (snd.bandwidth_pps * 7 + info.bandwidth) / 8;
                    }
                    if info.recv_rate > 0 {
                        snd.recv_rate_pps = (snd.recv_rate_pps * 7 + info.recv_rate) / 8;
                    }
                    snd.flow_window = info.avail_buf.max(1);
                    core.cc.lock().on_ack(
                        newly.max(0) as u32,
                        snd.rtt_us,
                        snd.recv_rate_pps,
                        snd.bandwidth_pps,
                        snd.flow_window,
                    );
                    Some(Control::Ack2 { serial })
                } else {
                    None
                }
            };
            if newly_freed_space(core) {
                core.snd_space.notify_waiters();
            }
            core.snd_wake.notify_waiters();
            // Every full ACK is answered by exactly one ACK² echoing its
            // serial, so the receiver can measure the link RTT.
            if let Some(body) = ack2 {
                PerfCounters::bump(&core.stats.pkt_sent_ack2);
                let pkt = core.control(body);
                core.emit(&pkt).await;
            }
        }
        Control::Nak(ranges) => {
            PerfCounters::bump(&core.stats.pkt_recv_nak);
            let loss_event = {
                let mut guard = core.snd.lock();
                let Some(snd) = guard.as_mut() else { return };
                let mut smallest: Option<SeqNo> = None;
                for r in &ranges {
                    let mut first = r.first;
                    let last = r.last;
                    // Clamp to the live window.
                    if first.cmp_to(snd.last_ack) < 0 {
                        first = snd.last_ack;
                    }
                    if first.cmp_to(last) > 0 || last.cmp_to(snd.largest_sent) > 0 {
                        continue;
                    }
                    snd.loss.insert(first, last);
                    if smallest.map(|s| first.cmp_to(s) < 0).unwrap_or(true) {
                        smallest = Some(first);
                    }
                }
                smallest.map(|s| (s, snd.largest_sent))
            };
            if let Some((loss_seq, largest)) = loss_event {
                core.cc.lock().on_loss(loss_seq, largest);
                core.snd_wake.notify_waiters();
            }
        }
        Control::Ack2 { serial } => {
            PerfCounters::bump(&core.stats.pkt_recv_ack2);
            let mut guard = core.rcv.lock();
            let Some(rcv) = guard.as_mut() else { return };
            if let Some(pos) = rcv.ack_window.iter().position(|r| r.serial == serial) {
                let rec = rcv.ack_window.remove(pos);
                let sample = rec.sent.elapsed().as_micros().max(1) as u32;
                let diff = rcv.rtt_us.abs_diff(sample);
                rcv.rtt_var_us = (rcv.rtt_var_us * 3 + diff) / 4;
                rcv.rtt_us = (rcv.rtt_us * 7 + sample) / 8;
                rcv.ack_window.retain(|r| r.sent >= rec.sent);
            }
        }
        Control::KeepAlive => {}
        Control::Shutdown => {
            debug!(id = core.id, "peer shutdown received");
            core.peer_shutdown.store(true, Ordering::Relaxed);
            {
                let mut st = core.status.lock();
                if !matches!(*st, Status::Broken) {
                    *st = Status::Closed;
                }
            }
            core.wake_all();
        }
        Control::MsgDrop { first, last, .. } => {
            let mut guard = core.rcv.lock();
            if let Some(rcv) = guard.as_mut() {
                rcv.buffer.drop_message(first, last);
                rcv.loss.remove_range(first, last);
                if rcv.largest_seq.cmp_to(last) < 0 {
                    rcv.largest_seq = last;
                }
            }
            drop(guard);
            core.rcv_ready.notify_waiters();
        }
        Control::CongestionWarning => {
            let largest = {
                let guard = core.snd.lock();
                guard.as_ref().map(|s| s.largest_sent)
            };
            if let Some(largest) = largest {
                core.cc.lock().on_congestion_warning(largest);
            }
        }
        Control::Handshake(hs) => {
            // Post-establishment handshake traffic covers peers whose view
            // of the exchange is behind ours: a duplicated response means
            // our final got lost, a repeated rendezvous request means the
            // peer never saw our reply.
            let reply_type = match hs.req_type {
                HS_RESPONSE => Some(HS_FINAL),
                HS_RENDEZVOUS if core.cfg.rendezvous => Some(HS_RESPONSE),
                _ => None,
            };
            if let Some(req_type) = reply_type {
                let reply = Handshake {
                    version: PROTO_VERSION,
                    sock_type: core.cfg.sock_type,
                    init_seq: *core.local_isn.lock(),
                    mss: core.cfg.mss as u32,
                    flow_window: core.cfg.rcv_buf_pkts as u32,
                    req_type,
                    socket_id: core.id,
                    cookie: hs.cookie,
                    peer_ip: hs.peer_ip,
                };
                let pkt = Packet::Control(ControlPacket {
                    timestamp: core.now_ts(),
                    dst_id: 0,
                    body: Control::Handshake(reply),
                });
                core.emit(&pkt).await;
            }
        }
        Control::Error { code } => {
            core.mark_broken(&format!("peer signalled error {code}"));
        }
    }
}

fn newly_freed_space(core: &Core) -> bool {
    let guard = core.snd.lock();
    matches!(guard.as_ref(), Some(snd) if snd.buffer.free() > 0)
}

async fn send_full_ack(core: &Core) {
    let pkt = {
        let mut guard = core.rcv.lock();
        let Some(rcv) = guard.as_mut() else { return };
        rcv.ack_serial = rcv.ack_serial.wrapping_add(1).max(1);
        let serial = rcv.ack_serial;
        let ack_seq = rcv.buffer.ack_seq();
        rcv.ack_window.push(AckRecord { serial, sent: Instant::now() });
        if rcv.ack_window.len() > 64 {
            rcv.ack_window.remove(0);
        }
        let info = AckInfo {
            rtt: rcv.rtt_us,
            rtt_var: rcv.rtt_var_us,
            avail_buf: rcv.buffer.free_slots().max(2) as u32,
            bandwidth: rcv.bandwidth_pps(),
            recv_rate: rcv.recv_rate_pps(),
        };
        core.control(Control::Ack { serial, ack_seq, info: Some(info) })
    };
    if core.emit(&pkt).await {
        PerfCounters::bump(&core.stats.pkt_sent_ack);
        PerfCounters::bump(&core.stats.pkt_sent_ack_full);
    }
}

async fn send_due_naks(core: &Core) {
    let pkt = {
        let mut guard = core.rcv.lock();
        let Some(rcv) = guard.as_mut() else { return };
        let delay = rcv.nak_delay();
        let mut due = rcv.loss.ranges_due(Instant::now(), delay);
        if due.is_empty() {
            return;
        }
        due.truncate(MAX_NAK_RANGES);
        core.control(Control::Nak(due))
    };
    if core.emit(&pkt).await {
        PerfCounters::bump(&core.stats.pkt_sent_nak);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory packet channel used to exercise the engine without real
    //! sockets: deterministic drop rules stand in for a lossy network.

    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    type DropRule = Box<dyn Fn(&Packet, u64) -> bool + Send + Sync>;

    pub struct MemChannel {
        tx: mpsc::Sender<Packet>,
        rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
        drop_rule: Mutex<Option<DropRule>>,
        sent: AtomicUsize,
        closed: AtomicBool,
    }

    impl MemChannel {
        /// A bidirectional in-memory channel pair.
        pub fn pair() -> (Arc<MemChannel>, Arc<MemChannel>) {
            let (a_tx, b_rx) = mpsc::channel(4096);
            let (b_tx, a_rx) = mpsc::channel(4096);
            let mk = |tx, rx| {
                Arc::new(MemChannel {
                    tx,
                    rx: tokio::sync::Mutex::new(rx),
                    drop_rule: Mutex::new(None),
                    sent: AtomicUsize::new(0),
                    closed: AtomicBool::new(false),
                })
            };
            (mk(a_tx, a_rx), mk(b_tx, b_rx))
        }

        /// Installs a drop rule called with each outbound packet and the
        /// count of packets sent so far.
        pub fn set_drop_rule(
            &self,
            rule: impl Fn(&Packet, u64) -> bool + Send + Sync + 'static,
        ) {
            *self.drop_rule.lock() = Some(Box::new(rule));
        }
    }

    #[async_trait]
    impl PacketChannel for MemChannel {
        async fn open(&self) -> std::result::Result<(), ChannelError> {
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn snd_buf_size(&self) -> usize {
            65536
        }

        fn rcv_buf_size(&self) -> usize {
            65536
        }

        fn set_snd_buf_size(&self, _bytes: usize) {}

        fn set_rcv_buf_size(&self, _bytes: usize) {}

        async fn send_to(
            &self,
            _addr: Option<SocketAddr>,
            pkt: &Packet,
        ) -> std::result::Result<usize, ChannelError> {
            if self.closed.load(Ordering::Relaxed) {
                return Err(ChannelError::Closed);
            }
            let n = self.sent.fetch_add(1, Ordering::Relaxed) as u64;
            let dropped = self
                .drop_rule
                .lock()
                .as_ref()
                .map(|rule| rule(pkt, n))
                .unwrap_or(false);
            if !dropped {
                let _ = self.tx.send(pkt.clone()).await;
            }
            Ok(pkt.wire_len())
        }

        async fn recv_from(
            &self,
        ) -> std::result::Result<(Option<SocketAddr>, Packet), ChannelError> {
            if self.closed.load(Ordering::Relaxed) {
                return Err(ChannelError::Closed);
            }
            let mut rx = self.rx.lock().await;
            match timeout(Duration::from_millis(10), rx.recv()).await {
                Ok(Some(pkt)) => Ok((None, pkt)),
                Ok(None) => Err(ChannelError::Closed),
                Err(_) => Err(ChannelError::Again),
            }
        }
    }

    /// Builds an established connection pair over in-memory channels,
    /// skipping the wire handshake.
    pub fn established_pair(
        cfg_a: ConnConfig,
        cfg_b: ConnConfig,
    ) -> (Connection, Connection, Arc<MemChannel>, Arc<MemChannel>) {
        let (ch_a, ch_b) = MemChannel::pair();
        let a = Connection::new(1, cfg_a.clone(), ch_a.clone());
        let b = Connection::new(2, cfg_b.clone(), ch_b.clone());
        let isn_a = SeqNo::new(0);
        let isn_b = SeqNo::new(1000);
        let hs_a = Handshake {
            version: PROTO_VERSION,
            sock_type: cfg_a.sock_type,
            init_seq: isn_a,
            mss: cfg_a.mss as u32,
            flow_window: cfg_a.rcv_buf_pkts as u32,
            req_type: HS_REQUEST,
            socket_id: 1,
            cookie: 0,
            peer_ip: [0; 4],
        };
        let hs_b = Handshake {
            version: PROTO_VERSION,
            sock_type: cfg_b.sock_type,
            init_seq: isn_b,
            mss: cfg_b.mss as u32,
            flow_window: cfg_b.rcv_buf_pkts as u32,
            req_type: HS_RESPONSE,
            socket_id: 2,
            cookie: 0,
            peer_ip: [0; 4],
        };
        a.establish(isn_a, &hs_b);
        b.establish(isn_b, &hs_a);
        (a, b, ch_a, ch_b)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn stream_cfg() -> ConnConfig {
        ConnConfig {
            linger: Duration::from_millis(500),
            ..ConnConfig::default()
        }
    }

    fn dgram_cfg() -> ConnConfig {
        ConnConfig {
            sock_type: SocketType::Dgram,
            linger: Duration::from_millis(500),
            ..ConnConfig::default()
        }
    }

    async fn recv_exact(conn: &Connection, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut got = 0;
        while got < len {
            let n = conn.recv(&mut out[got..]).await.expect("recv");
            assert!(n > 0, "unexpected end of stream");
            got += n;
        }
        out
    }

    #[tokio::test]
    async fn bytestream_is_delivered_in_order() {
        let (a, b, _, _) = established_pair(stream_cfg(), stream_cfg());
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let mut sent = 0;
        while sent < data.len() {
            sent += a.send(&data[sent..]).await.unwrap();
        }
        let received = recv_exact(&b, data.len()).await;
        assert_eq!(received, data);
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn loss_is_repaired_by_nak_and_retransmission() {
        let (a, b, ch_a, _) = established_pair(stream_cfg(), stream_cfg());
        // Drop the first transmission of sequences 4 and 5 (ISN is 0);
        // retransmissions pass.
        let dropped = Arc::new(Mutex::new(std::collections::HashSet::new()));
        let seen = dropped.clone();
        ch_a.set_drop_rule(move |pkt, _| {
            if let Packet::Data(d) = pkt {
                let raw = d.seq.raw();
                if (raw == 4 || raw == 5) && seen.lock().insert(raw) {
                    return true;
                }
            }
            false
        });

        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
        let mut sent = 0;
        while sent < data.len() {
            sent += a.send(&data[sent..]).await.unwrap();
        }
        let received = recv_exact(&b, data.len()).await;
        assert_eq!(received, data);

        let a_stats = a.perfmon();
        let b_stats = b.perfmon();
        assert!(a_stats.pkt_recv_nak >= 1, "sender saw no NAK");
        assert!(a_stats.pkt_retrans >= 2, "expected retransmissions");
        assert!(b_stats.pkt_rcv_loss >= 2, "receiver recorded no loss");
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn message_boundaries_survive_transfer() {
        let (a, b, _, _) = established_pair(dgram_cfg(), dgram_cfg());
        let small = vec![1u8; 100];
        let large = vec![2u8; 5000];
        a.sendmsg(&small, None, true).await.unwrap();
        a.sendmsg(&large, None, true).await.unwrap();
        assert_eq!(b.recvmsg(false).await.unwrap(), small);
        assert_eq!(b.recvmsg(false).await.unwrap(), large);
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn ttl_expired_message_is_dropped_whole() {
        let (a, b, ch_a, _) = established_pair(dgram_cfg(), dgram_cfg());
        // The first message's data packets never arrive, so its TTL runs
        // out; the follow-up message must still deliver, and no fragment of
        // the first may surface.
        ch_a.set_drop_rule(|pkt, _| {
            matches!(pkt, Packet::Data(d) if d.msg == crate::seq::MsgNo::new(1))
        });
        let doomed = vec![9u8; 3000];
        let survivor = vec![7u8; 64];
        a.sendmsg(&doomed, Some(Duration::from_millis(50)), true).await.unwrap();
        a.sendmsg(&survivor, None, true).await.unwrap();
        let got = b.recvmsg(false).await.unwrap();
        assert_eq!(got, survivor);
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn every_full_ack_is_echoed_by_one_ack2() {
        let (a, b, _, _) = established_pair(stream_cfg(), stream_cfg());
        let data = vec![3u8; 30_000];
        let mut sent = 0;
        while sent < data.len() {
            sent += a.send(&data[sent..]).await.unwrap();
        }
        let _ = recv_exact(&b, data.len()).await;
        // Let the periodic ACK/ACK² exchange run, then quiesce the pair so
        // the counters are final before comparing.
        tokio::time::sleep(Duration::from_millis(150)).await;
        a.close().await;
        b.close().await;
        let full_acks_received = a
            .core
            .stats
            .pkt_recv_ack_full
            .load(std::sync::atomic::Ordering::Relaxed);
        let ack2_sent = a
            .core
            .stats
            .pkt_sent_ack2
            .load(std::sync::atomic::Ordering::Relaxed);
        assert!(full_acks_received > 0, "no full ACK crossed the pair");
        assert_eq!(ack2_sent, full_acks_received, "one ACK² per full ACK");
    }

    #[tokio::test]
    async fn shutdown_surfaces_as_end_of_stream() {
        let (a, b, _, _) = established_pair(stream_cfg(), stream_cfg());
        a.send(b"tail").await.unwrap();
        // Give the payload time to cross before closing.
        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");
        a.close().await;
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(n, 0, "peer shutdown reads as end of stream");
        assert!(matches!(
            b.recv(&mut buf).await,
            Err(TransportError::ConnBroken)
        ));
        assert!(matches!(b.send(b"x").await, Err(_)));
        b.close().await;
    }

    #[tokio::test]
    async fn non_blocking_receive_reports_would_block() {
        let cfg = ConnConfig { rcv_syn: false, ..stream_cfg() };
        let (a, b, _, _) = established_pair(stream_cfg(), cfg);
        let mut buf = [0u8; 8];
        assert!(matches!(
            b.recv(&mut buf).await,
            Err(TransportError::WouldBlock)
        ));
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn unordered_messages_may_overtake_a_gap() {
        let (a, b, ch_a, _) = established_pair(dgram_cfg(), dgram_cfg());
        // First message lost on first transmission; second sent unordered.
        let gate = Arc::new(AtomicBool::new(true));
        let gate_rule = gate.clone();
        ch_a.set_drop_rule(move |pkt, _| {
            gate_rule.load(Ordering::Relaxed)
                && matches!(pkt, Packet::Data(d) if d.msg == crate::seq::MsgNo::new(1))
        });
        a.sendmsg(&[1u8; 100], None, true).await.unwrap();
        a.sendmsg(&[2u8; 100], None, false).await.unwrap();
        // Out-of-order acceptance lets the unordered message through first.
        let first = b.recvmsg(true).await.unwrap();
        assert_eq!(first, vec![2u8; 100]);
        // Stop dropping; the retransmission completes message one.
        gate.store(false, Ordering::Relaxed);
        let second = b.recvmsg(true).await.unwrap();
        assert_eq!(second, vec![1u8; 100]);
        a.close().await;
        b.close().await;
    }

    #[test]
    fn syn_cookie_binds_address_and_bucket() {
        let addr: SocketAddr = "10.1.2.3:5000".parse().unwrap();
        let other: SocketAddr = "10.1.2.4:5000".parse().unwrap();
        let c1 = syn_cookie(Some(addr), 42, 1);
        assert_eq!(c1, syn_cookie(Some(addr), 42, 1));
        assert_ne!(c1, syn_cookie(Some(other), 42, 1));
        assert_ne!(c1, syn_cookie(Some(addr), 42, 2));
        assert_ne!(c1, syn_cookie(Some(addr), 43, 1));
    }
}
