//! # Socket/API Surface
//!
//! A process-wide registry maps opaque 32-bit socket identifiers to
//! connections and exposes the socket-style surface: `socket`, `bind`,
//! `listen`, `accept`, `connect`, blocking and non-blocking send/receive in
//! stream and message modes, file streaming, option getters and setters, a
//! `perfmon` snapshot and a poll-style readiness multiplexer.
//!
//! `startup()`/`cleanup()` are counted so nested users compose; the
//! registry is handed out as an `Arc<Transport>`, never as a language-level
//! singleton. A reaper task reclaims closed sockets after a grace period.
//!
//! Every bound socket owns one substrate channel and one pump task. The
//! pump routes inbound packets by destination socket id: id 0 is handshake
//! traffic (delivered to the listener, or to a rendezvous connector), any
//! other id goes to the owning connection's queue. Accepted connections
//! therefore share their listener's UDP port while the engine keeps its
//! strictly per-connection view of the channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::{IceChannel, IceConfig, PacketChannel, RoutedChannel, RoutedPacket, UdpChannel};
use crate::connection::{syn_cookie, ConnConfig, Connection, Status, PROTO_VERSION};
use crate::error::{Result, TransportError};
use crate::metrics::TraceInfo;
use crate::packet::{
    Control, ControlPacket, Handshake, Packet, SocketType, HS_FINAL, HS_RENDEZVOUS, HS_REQUEST,
    HS_RESPONSE,
};
use crate::seq::SeqNo;

/// Grace period before a closed socket's entry is reclaimed.
const REAPER_GRACE: Duration = Duration::from_secs(1);

/// Reaper sweep cadence.
const REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// How long ICE connectivity establishment may take before `connect`
/// gives up.
const ICE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pending-handshake retention on a listener.
const PENDING_TTL: Duration = Duration::from_secs(30);

/// Syn-cookie time bucket width in seconds.
const COOKIE_BUCKET_SECS: u64 = 60;

/// Socket option keys, mirroring the wire-era option names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    /// Maximum segment size.
    Mss,
    /// Blocking send mode.
    SndSyn,
    /// Blocking receive mode.
    RcvSyn,
    /// Send-buffer capacity in packets.
    SndBuf,
    /// Receive-buffer capacity in packets.
    RcvBuf,
    /// Substrate send-buffer size in bytes.
    UdpSndBuf,
    /// Substrate receive-buffer size in bytes.
    UdpRcvBuf,
    /// Close linger duration.
    Linger,
    /// Rendezvous connection mode.
    Rendezvous,
    /// Send timeout.
    SndTimeo,
    /// Receive timeout.
    RcvTimeo,
    /// Maximum message size.
    MaxMsg,
    /// SO_REUSEADDR on the substrate socket.
    ReuseAddr,
    /// Local ICE user fragment (get) / remote user fragment (set).
    IceUfrag,
    /// Local ICE password (get) / remote password (set).
    IcePwd,
    /// Local ICE candidates (get) / remote candidates (set).
    IceCandidates,
    /// STUN server as `host[:port]`.
    IceStunServer,
    /// TURN relay as `host[:port],user,pass`.
    IceTurnServer,
}

/// Dynamically typed option values.
#[derive(Debug, Clone, PartialEq)]
pub enum OptValue {
    /// Integer-valued options.
    Int(i64),
    /// Boolean options.
    Bool(bool),
    /// Optional durations (timeouts, linger).
    Time(Option<Duration>),
    /// String options.
    Str(String),
    /// String-list options (candidates).
    List(Vec<String>),
}

impl OptValue {
    fn as_int(&self) -> Result<i64> {
        match self {
            OptValue::Int(v) => Ok(*v),
            _ => Err(TransportError::Unsupported),
        }
    }

    fn as_bool(&self) -> Result<bool> {
        match self {
            OptValue::Bool(v) => Ok(*v),
            _ => Err(TransportError::Unsupported),
        }
    }

    fn as_time(&self) -> Result<Option<Duration>> {
        match self {
            OptValue::Time(v) => Ok(*v),
            _ => Err(TransportError::Unsupported),
        }
    }

    fn as_str(&self) -> Result<&str> {
        match self {
            OptValue::Str(v) => Ok(v),
            _ => Err(TransportError::Unsupported),
        }
    }
}

type RouteMap = Arc<Mutex<HashMap<u32, mpsc::Sender<RoutedPacket>>>>;
type HandshakeSlot = Arc<Mutex<Option<mpsc::Sender<RoutedPacket>>>>;

#[derive(Clone)]
enum Substrate {
    Udp(Arc<UdpChannel>),
    Ice(Arc<IceChannel>),
}

impl Substrate {
    fn as_dyn(&self) -> Arc<dyn PacketChannel> {
        match self {
            Substrate::Udp(c) => c.clone(),
            Substrate::Ice(c) => c.clone(),
        }
    }
}

#[derive(Clone)]
struct BoundState {
    substrate: Substrate,
    routes: RouteMap,
    handshake: HandshakeSlot,
}

struct ListenerState {
    accept_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<(u32, Option<SocketAddr>)>>>,
    accept_len: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

struct SocketEntry {
    id: u32,
    cfg: Mutex<ConnConfig>,
    reuse_addr: AtomicBool,
    owns_channel: AtomicBool,
    bound: Mutex<Option<BoundState>>,
    conn: Mutex<Option<Arc<Connection>>>,
    listener: Mutex<Option<ListenerState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed_at: Mutex<Option<Instant>>,
    /// Status to report while no connection object exists (e.g. CLOSED
    /// after a failed handshake).
    fallback_status: Mutex<Status>,
    /// ICE configuration collected before `bind_ice` builds the agent.
    ice_cfg: Mutex<IceConfig>,
}

impl SocketEntry {
    fn new(id: u32, sock_type: SocketType) -> Arc<Self> {
        let cfg = ConnConfig { sock_type, ..ConnConfig::default() };
        Arc::new(SocketEntry {
            id,
            cfg: Mutex::new(cfg),
            reuse_addr: AtomicBool::new(false),
            owns_channel: AtomicBool::new(true),
            bound: Mutex::new(None),
            conn: Mutex::new(None),
            listener: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            closed_at: Mutex::new(None),
            fallback_status: Mutex::new(Status::Init),
            ice_cfg: Mutex::new(IceConfig::default()),
        })
    }

    fn bound(&self) -> Result<BoundState> {
        self.bound
            .lock()
            .clone()
            .ok_or(TransportError::InvalidState("not bound"))
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.conn
            .lock()
            .clone()
            .ok_or(TransportError::InvalidState("not connected"))
    }

    fn ice(&self) -> Result<Arc<IceChannel>> {
        match self.bound()?.substrate {
            Substrate::Ice(ch) => Ok(ch),
            Substrate::Udp(_) => Err(TransportError::Unsupported),
        }
    }
}

/// The process-wide transport registry and API surface.
pub struct Transport {
    sockets: Mutex<HashMap<u32, Arc<SocketEntry>>>,
    next_id: AtomicU32,
    cookie_secret: u64,
    reaper: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<Transport>,
}

static GLOBAL: Mutex<Option<(Arc<Transport>, usize)>> = Mutex::new(None);

/// Counted global initialization. The first call creates the registry and
/// its reaper task (requires a tokio runtime); later calls return the same
/// instance.
pub fn startup() -> Arc<Transport> {
    let mut global = GLOBAL.lock();
    match global.as_mut() {
        Some((transport, count)) => {
            *count += 1;
            transport.clone()
        }
        None => {
            let transport = Transport::new();
            transport.spawn_reaper();
            *global = Some((transport.clone(), 1));
            info!("transport runtime started");
            transport
        }
    }
}

/// Counted global teardown; the final call closes every socket and stops
/// the reaper.
pub async fn cleanup() {
    let last = {
        let mut global = GLOBAL.lock();
        match global.as_mut() {
            Some((transport, count)) => {
                *count -= 1;
                if *count == 0 {
                    let t = transport.clone();
                    *global = None;
                    Some(t)
                } else {
                    None
                }
            }
            None => None,
        }
    };
    if let Some(transport) = last {
        transport.shutdown().await;
        info!("transport runtime stopped");
    }
}

impl Transport {
    fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Transport {
            sockets: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(rand::random::<u32>() & 0x3FFF_FFFF | 1),
            cookie_secret: rand::random(),
            reaper: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    fn spawn_reaper(&self) {
        let handle = tokio::spawn(reaper_task(self.weak_self.clone()));
        *self.reaper.lock() = Some(handle);
    }

    fn alloc_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.sockets.lock().contains_key(&id) {
                return id;
            }
        }
    }

    fn entry(&self, id: u32) -> Result<Arc<SocketEntry>> {
        self.sockets
            .lock()
            .get(&id)
            .cloned()
            .ok_or(TransportError::UnknownSocket(id))
    }

    /// Allocates a socket handle of the given type.
    pub fn socket(&self, sock_type: SocketType) -> u32 {
        let id = self.alloc_id();
        let entry = SocketEntry::new(id, sock_type);
        self.sockets.lock().insert(id, entry);
        debug!(id, "socket created");
        id
    }

    /// Binds the socket to a local UDP endpoint and starts its pump.
    pub async fn bind(&self, id: u32, addr: SocketAddr) -> Result<()> {
        let entry = self.entry(id)?;
        if entry.bound.lock().is_some() {
            return Err(TransportError::InvalidState("already bound"));
        }
        let channel = Arc::new(UdpChannel::new(addr));
        channel.set_reuse_addr(entry.reuse_addr.load(Ordering::Relaxed));
        channel.open().await.map_err(|e| {
            TransportError::Bind(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;
        self.install_bound(&entry, Substrate::Udp(channel));
        Ok(())
    }

    /// Binds the socket to an ICE channel and starts candidate gathering.
    /// STUN/TURN/port-range options set beforehand are applied to the
    /// agent being built.
    pub async fn bind_ice(&self, id: u32) -> Result<()> {
        let entry = self.entry(id)?;
        if entry.bound.lock().is_some() {
            return Err(TransportError::InvalidState("already bound"));
        }
        let channel = Arc::new(IceChannel::new(false));
        {
            let cfg = entry.ice_cfg.lock();
            if let Some((host, port)) = &cfg.stun {
                channel.set_stun(host, *port);
            }
            channel.set_turn_relay(cfg.turn.clone());
            if let Some((min, max)) = cfg.port_range {
                channel.set_port_range(min, max);
            }
        }
        channel
            .open()
            .await
            .map_err(TransportError::from)?;
        self.install_bound(&entry, Substrate::Ice(channel));
        Ok(())
    }

    fn install_bound(&self, entry: &Arc<SocketEntry>, substrate: Substrate) {
        let state = BoundState {
            substrate: substrate.clone(),
            routes: Arc::new(Mutex::new(HashMap::new())),
            handshake: Arc::new(Mutex::new(None)),
        };
        let pump = tokio::spawn(pump_task(
            substrate.as_dyn(),
            state.routes.clone(),
            state.handshake.clone(),
        ));
        entry.tasks.lock().push(pump);
        *entry.bound.lock() = Some(state);
        debug!(id = entry.id, "socket bound");
    }

    /// Retrieves the local ICE credentials and candidates to ship to the
    /// peer out-of-band. Blocks until candidate gathering completes.
    pub async fn get_ice_info(&self, id: u32) -> Result<(String, String, Vec<String>)> {
        let entry = self.entry(id)?;
        let ice = entry.ice()?;
        ice.wait_for_candidates().await;
        let (ufrag, pwd) = ice.local_credentials().await.map_err(TransportError::from)?;
        Ok((ufrag, pwd, ice.local_candidates()))
    }

    /// Supplies the peer's ICE credentials and candidates. In rendezvous
    /// mode this also resolves the controlling role deterministically from
    /// the two user fragments.
    pub async fn set_ice_info(
        &self,
        id: u32,
        ufrag: &str,
        pwd: &str,
        candidates: &[String],
    ) -> Result<()> {
        let entry = self.entry(id)?;
        let ice = entry.ice()?;
        ice.set_remote_credentials(ufrag, pwd);
        ice.set_remote_candidates(candidates)
            .map_err(TransportError::from)?;
        let (local_ufrag, _) = ice.local_credentials().await.map_err(TransportError::from)?;
        ice.set_controlling(local_ufrag.as_str() > ufrag);
        Ok(())
    }

    /// Starts listening for handshakes on a bound socket. For an ICE
    /// socket the peer's credentials must already have been supplied via
    /// [`set_ice_info`]; connectivity establishment runs alongside the
    /// listener.
    ///
    /// [`set_ice_info`]: Transport::set_ice_info
    pub fn listen(&self, id: u32, backlog: usize) -> Result<()> {
        let entry = self.entry(id)?;
        if entry.conn.lock().is_some() {
            return Err(TransportError::InvalidState("already connected"));
        }
        if entry.listener.lock().is_some() {
            return Err(TransportError::InvalidState("already listening"));
        }
        let bound = entry.bound()?;
        if let Substrate::Ice(ice) = &bound.substrate {
            let ice = ice.clone();
            entry.tasks.lock().push(tokio::spawn(async move {
                if !ice.wait_until_connected(ICE_CONNECT_TIMEOUT).await {
                    warn!("ICE connectivity did not come up under the listener");
                }
            }));
        }
        let (hs_tx, hs_rx) = mpsc::channel(256);
        *bound.handshake.lock() = Some(hs_tx);
        let (accept_tx, accept_rx) = mpsc::channel(backlog.max(1));
        let accept_len = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(listener_task(ListenerCtx {
            transport: self.weak_self.clone(),
            cfg: entry.cfg.lock().clone(),
            bound: bound.clone(),
            cookie_secret: self.cookie_secret,
            hs_rx,
            accept_tx,
            accept_len: accept_len.clone(),
        }));
        *entry.listener.lock() = Some(ListenerState {
            accept_rx: Arc::new(tokio::sync::Mutex::new(accept_rx)),
            accept_len,
            task,
        });
        debug!(id, backlog, "socket listening");
        Ok(())
    }

    /// Accepts an established connection, returning its socket id and the
    /// peer address when known. Blocks unless the socket is in
    /// non-blocking receive mode.
    pub async fn accept(&self, id: u32) -> Result<(u32, Option<SocketAddr>)> {
        let entry = self.entry(id)?;
        let blocking = entry.cfg.lock().rcv_syn;
        let (rx, accept_len) = {
            let guard = entry.listener.lock();
            let state = guard
                .as_ref()
                .ok_or(TransportError::InvalidState("not listening"))?;
            (state.accept_rx.clone(), state.accept_len.clone())
        };

        let mut rx = rx.lock().await;
        if !blocking {
            return match rx.try_recv() {
                Ok(item) => {
                    accept_len.fetch_sub(1, Ordering::Relaxed);
                    Ok(item)
                }
                Err(_) => Err(TransportError::WouldBlock),
            };
        }
        match rx.recv().await {
            Some(item) => {
                accept_len.fetch_sub(1, Ordering::Relaxed);
                Ok(item)
            }
            None => Err(TransportError::ConnLost),
        }
    }

    /// Connects to a peer. `addr` names the destination for UDP sockets
    /// and is ignored for ICE sockets (connectivity is established toward
    /// the configured remote candidates first).
    pub async fn connect(&self, id: u32, addr: Option<SocketAddr>) -> Result<()> {
        let entry = self.entry(id)?;
        if entry.conn.lock().is_some() {
            return Err(TransportError::InvalidState("already connected"));
        }
        if entry.bound.lock().is_none() {
            let any: SocketAddr = "0.0.0.0:0".parse().expect("literal address");
            self.bind(id, any).await?;
        }
        let bound = entry.bound()?;
        let cfg = entry.cfg.lock().clone();

        if let Substrate::Ice(ice) = &bound.substrate {
            if !cfg.rendezvous {
                ice.set_controlling(true);
            }
            if !ice.wait_until_connected(ICE_CONNECT_TIMEOUT).await {
                return Err(TransportError::ConnTimeout);
            }
        }

        let (tx, rx) = mpsc::channel(1024);
        bound.routes.lock().insert(id, tx.clone());
        if cfg.rendezvous {
            // Rendezvous handshakes arrive addressed to socket id 0.
            *bound.handshake.lock() = Some(tx);
        }
        let routed = Arc::new(RoutedChannel::new(bound.substrate.as_dyn(), rx));
        routed.set_peer(addr);
        let conn = Arc::new(Connection::new(id, cfg, routed));
        match conn.connect().await {
            Ok(()) => {
                *entry.conn.lock() = Some(conn);
                debug!(id, "connect completed");
                Ok(())
            }
            Err(e) => {
                bound.routes.lock().remove(&id);
                // A failed handshake leaves the socket CLOSED.
                *entry.fallback_status.lock() = Status::Closed;
                debug!(id, "connect failed: {e}");
                Err(e)
            }
        }
    }

    /// Bytestream send; returns the bytes admitted to the send buffer.
    pub async fn send(&self, id: u32, data: &[u8]) -> Result<usize> {
        self.entry(id)?.connection()?.send(data).await
    }

    /// Bytestream receive.
    pub async fn recv(&self, id: u32, buf: &mut [u8]) -> Result<usize> {
        self.entry(id)?.connection()?.recv(buf).await
    }

    /// Message send with per-call in-order flag and time-to-live.
    pub async fn sendmsg(
        &self,
        id: u32,
        data: &[u8],
        ttl: Option<Duration>,
        in_order: bool,
    ) -> Result<usize> {
        self.entry(id)?.connection()?.sendmsg(data, ttl, in_order).await
    }

    /// Message receive with out-of-order delivery acceptance.
    pub async fn recvmsg(&self, id: u32, allow_out_of_order: bool) -> Result<Vec<u8>> {
        self.entry(id)?.connection()?.recvmsg(allow_out_of_order).await
    }

    /// Streams `len` bytes from `file` over the connection.
    pub async fn sendfile(&self, id: u32, file: &mut tokio::fs::File, len: u64) -> Result<u64> {
        self.entry(id)?.connection()?.sendfile(file, len).await
    }

    /// Receives `len` bytes from the connection into `file`.
    pub async fn recvfile(&self, id: u32, file: &mut tokio::fs::File, len: u64) -> Result<u64> {
        self.entry(id)?.connection()?.recvfile(file, len).await
    }

    /// Sends the whole buffer, looping over partial admissions.
    pub async fn send_all(&self, id: u32, data: &[u8]) -> Result<()> {
        let conn = self.entry(id)?.connection()?;
        let mut off = 0;
        while off < data.len() {
            off += conn.send(&data[off..]).await?;
        }
        Ok(())
    }

    /// Fills the whole buffer, failing on a premature end of stream.
    pub async fn recv_all(&self, id: u32, buf: &mut [u8]) -> Result<()> {
        let conn = self.entry(id)?.connection()?;
        let mut off = 0;
        while off < buf.len() {
            let n = conn.recv(&mut buf[off..]).await?;
            if n == 0 {
                return Err(TransportError::ConnBroken);
            }
            off += n;
        }
        Ok(())
    }

    /// Performance snapshot of a connected socket.
    pub fn perfmon(&self, id: u32) -> Result<TraceInfo> {
        Ok(self.entry(id)?.connection()?.perfmon())
    }

    /// Local address of a bound socket, once the substrate knows it.
    pub fn local_addr(&self, id: u32) -> Result<Option<SocketAddr>> {
        Ok(self.entry(id)?.bound()?.substrate.as_dyn().local_addr())
    }

    /// Peer address of a connected socket, when known.
    pub fn peer_addr(&self, id: u32) -> Result<Option<SocketAddr>> {
        Ok(self.entry(id)?.connection()?.peer_addr())
    }

    /// Current connection status of a socket.
    pub fn status(&self, id: u32) -> Result<Status> {
        let entry = self.entry(id)?;
        let conn = entry.conn.lock().clone();
        Ok(match conn {
            Some(c) => c.status(),
            None => *entry.fallback_status.lock(),
        })
    }

    /// Sets a socket option. Options that shape the connection must be set
    /// before `connect`/`listen`.
    pub fn set_opt(&self, id: u32, opt: SockOpt, value: OptValue) -> Result<()> {
        let entry = self.entry(id)?;
        let mut cfg = entry.cfg.lock();
        match opt {
            SockOpt::Mss => cfg.mss = value.as_int()?.max(100) as usize,
            SockOpt::SndSyn => cfg.snd_syn = value.as_bool()?,
            SockOpt::RcvSyn => cfg.rcv_syn = value.as_bool()?,
            SockOpt::SndBuf => cfg.snd_buf_pkts = value.as_int()?.max(16) as usize,
            SockOpt::RcvBuf => cfg.rcv_buf_pkts = value.as_int()?.max(16) as usize,
            SockOpt::UdpSndBuf => {
                if let Ok(bound) = entry.bound() {
                    bound.substrate.as_dyn().set_snd_buf_size(value.as_int()? as usize);
                } else {
                    return Err(TransportError::InvalidState("not bound"));
                }
            }
            SockOpt::UdpRcvBuf => {
                if let Ok(bound) = entry.bound() {
                    bound.substrate.as_dyn().set_rcv_buf_size(value.as_int()? as usize);
                } else {
                    return Err(TransportError::InvalidState("not bound"));
                }
            }
            SockOpt::Linger => {
                cfg.linger = value.as_time()?.unwrap_or(Duration::ZERO);
            }
            SockOpt::Rendezvous => cfg.rendezvous = value.as_bool()?,
            SockOpt::SndTimeo => cfg.snd_timeout = value.as_time()?,
            SockOpt::RcvTimeo => cfg.rcv_timeout = value.as_time()?,
            SockOpt::MaxMsg => cfg.max_msg = value.as_int()?.max(1) as usize,
            SockOpt::ReuseAddr => {
                entry.reuse_addr.store(value.as_bool()?, Ordering::Relaxed);
            }
            SockOpt::IceStunServer => {
                let spec = value.as_str()?.trim();
                let parsed = if spec.is_empty() {
                    None
                } else {
                    Some(crate::cli::parse_host_port(spec).ok_or(TransportError::Unsupported)?)
                };
                match entry.ice() {
                    Ok(ice) => match &parsed {
                        Some((host, port)) => ice.set_stun(host, *port),
                        None => ice.set_stun("", 0),
                    },
                    Err(_) => entry.ice_cfg.lock().stun = parsed,
                }
            }
            SockOpt::IceTurnServer => {
                let spec = value.as_str()?.trim();
                let parsed = if spec.is_empty() {
                    None
                } else {
                    Some(crate::cli::parse_turn_spec(spec).ok_or(TransportError::Unsupported)?)
                };
                match entry.ice() {
                    Ok(ice) => ice.set_turn_relay(parsed),
                    Err(_) => entry.ice_cfg.lock().turn = parsed,
                }
            }
            SockOpt::IceUfrag | SockOpt::IcePwd | SockOpt::IceCandidates => {
                // Remote credentials travel together; use set_ice_info.
                return Err(TransportError::Unsupported);
            }
        }
        Ok(())
    }

    /// Reads a socket option.
    pub async fn get_opt(&self, id: u32, opt: SockOpt) -> Result<OptValue> {
        let entry = self.entry(id)?;
        let cfg = entry.cfg.lock().clone();
        Ok(match opt {
            SockOpt::Mss => OptValue::Int(cfg.mss as i64),
            SockOpt::SndSyn => OptValue::Bool(cfg.snd_syn),
            SockOpt::RcvSyn => OptValue::Bool(cfg.rcv_syn),
            SockOpt::SndBuf => OptValue::Int(cfg.snd_buf_pkts as i64),
            SockOpt::RcvBuf => OptValue::Int(cfg.rcv_buf_pkts as i64),
            SockOpt::UdpSndBuf => {
                OptValue::Int(entry.bound()?.substrate.as_dyn().snd_buf_size() as i64)
            }
            SockOpt::UdpRcvBuf => {
                OptValue::Int(entry.bound()?.substrate.as_dyn().rcv_buf_size() as i64)
            }
            SockOpt::Linger => OptValue::Time(Some(cfg.linger)),
            SockOpt::Rendezvous => OptValue::Bool(cfg.rendezvous),
            SockOpt::SndTimeo => OptValue::Time(cfg.snd_timeout),
            SockOpt::RcvTimeo => OptValue::Time(cfg.rcv_timeout),
            SockOpt::MaxMsg => OptValue::Int(cfg.max_msg as i64),
            SockOpt::ReuseAddr => OptValue::Bool(entry.reuse_addr.load(Ordering::Relaxed)),
            SockOpt::IceUfrag => {
                let (ufrag, _) = entry
                    .ice()?
                    .local_credentials()
                    .await
                    .map_err(TransportError::from)?;
                OptValue::Str(ufrag)
            }
            SockOpt::IcePwd => {
                let (_, pwd) = entry
                    .ice()?
                    .local_credentials()
                    .await
                    .map_err(TransportError::from)?;
                OptValue::Str(pwd)
            }
            SockOpt::IceCandidates => OptValue::List(entry.ice()?.local_candidates()),
            SockOpt::IceStunServer => {
                let cfg = entry.ice()?.config();
                OptValue::Str(
                    cfg.stun
                        .map(|(h, p)| format!("{h}:{p}"))
                        .unwrap_or_default(),
                )
            }
            SockOpt::IceTurnServer => {
                let cfg = entry.ice()?.config();
                OptValue::Str(
                    cfg.turn
                        .map(|r| format!("{}:{},{},{}", r.host, r.port, r.username, r.password))
                        .unwrap_or_default(),
                )
            }
        })
    }

    /// Closes a socket: tears down its connection, listener and (when it
    /// owns one) its substrate channel. The entry itself is reclaimed by
    /// the reaper after a grace period.
    pub async fn close(&self, id: u32) -> Result<()> {
        let entry = self.entry(id)?;
        let conn = entry.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().await;
        }
        let listener = entry.listener.lock().take();
        if let Some(listener) = listener {
            listener.task.abort();
        }
        let bound = entry.bound.lock().take();
        if let Some(bound) = bound {
            *bound.handshake.lock() = None;
            if entry.owns_channel.load(Ordering::Relaxed) {
                bound.routes.lock().clear();
                bound.substrate.as_dyn().close().await;
            }
        }
        for task in entry.tasks.lock().drain(..) {
            task.abort();
        }
        *entry.closed_at.lock() = Some(Instant::now());
        debug!(id, "socket closed");
        Ok(())
    }

    /// Readiness predicates used by the poll multiplexer.
    fn readiness(&self, id: u32) -> (bool, bool, bool) {
        let Ok(entry) = self.entry(id) else {
            return (false, false, true);
        };
        if let Some(listener) = entry.listener.lock().as_ref() {
            let pending = listener.accept_len.load(Ordering::Relaxed) > 0;
            return (pending, false, false);
        }
        let result = match entry.conn.lock().as_ref() {
            Some(conn) => (conn.readable(), conn.writable(), conn.in_error()),
            None => (false, false, false),
        };
        result
    }

    async fn shutdown(self: Arc<Self>) {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        let ids: Vec<u32> = self.sockets.lock().keys().copied().collect();
        for id in ids {
            let _ = self.close(id).await;
        }
        self.sockets.lock().clear();
    }
}

/// Readiness interest for one registered socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interest {
    /// Wake on readability (data, message, pending accept, EOS).
    pub read: bool,
    /// Wake on writability (send-buffer space).
    pub write: bool,
    /// Wake on error states.
    pub error: bool,
}

/// Ready sets returned by [`Poller::wait`].
#[derive(Debug, Default, Clone)]
pub struct PollEvents {
    /// Sockets ready for reading.
    pub readable: Vec<u32>,
    /// Sockets ready for writing.
    pub writable: Vec<u32>,
    /// Sockets in an error state.
    pub errors: Vec<u32>,
}

impl PollEvents {
    /// Whether no socket is ready.
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty() && self.errors.is_empty()
    }
}

/// Poll-style readiness multiplexer over registered sockets.
pub struct Poller {
    transport: Arc<Transport>,
    registered: Mutex<HashMap<u32, Interest>>,
}

impl Poller {
    /// Creates a multiplexer bound to `transport`.
    pub fn new(transport: Arc<Transport>) -> Self {
        Poller { transport, registered: Mutex::new(HashMap::new()) }
    }

    /// Registers or updates a socket's interest set.
    pub fn register(&self, id: u32, interest: Interest) {
        self.registered.lock().insert(id, interest);
    }

    /// Removes a socket from the set.
    pub fn unregister(&self, id: u32) {
        self.registered.lock().remove(&id);
    }

    /// Waits until any registered socket is ready or the timeout elapses.
    pub async fn wait(&self, timeout: Option<Duration>) -> PollEvents {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let mut events = PollEvents::default();
            for (&id, interest) in self.registered.lock().iter() {
                let (r, w, e) = self.transport.readiness(id);
                if interest.read && r {
                    events.readable.push(id);
                }
                if interest.write && w {
                    events.writable.push(id);
                }
                if interest.error && e {
                    events.errors.push(id);
                }
            }
            if !events.is_empty() {
                return events;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return events;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Routes inbound packets from a shared substrate to their connections.
async fn pump_task(
    channel: Arc<dyn PacketChannel>,
    routes: RouteMap,
    handshake: HandshakeSlot,
) {
    loop {
        match channel.recv_from().await {
            Ok((addr, pkt)) => {
                let dst = pkt.dst_id();
                let tx = if dst == 0 {
                    handshake.lock().clone()
                } else {
                    routes.lock().get(&dst).cloned()
                };
                match tx {
                    Some(tx) => {
                        if tx.send((addr, pkt)).await.is_err() {
                            if dst == 0 {
                                *handshake.lock() = None;
                            } else {
                                routes.lock().remove(&dst);
                            }
                        }
                    }
                    None => {
                        trace!("no route for inbound packet to socket {dst}");
                    }
                }
            }
            Err(crate::error::ChannelError::Again) => {}
            Err(crate::error::ChannelError::Closed) => break,
            Err(crate::error::ChannelError::Broken(e)) => {
                warn!("substrate receive error: {e}");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    // Dropping the routes unblocks every connection with a closed error.
    routes.lock().clear();
    *handshake.lock() = None;
    trace!("pump task finished");
}

struct PendingConn {
    new_id: u32,
    isn: SeqNo,
    cookie: u32,
    response: Handshake,
    created: Instant,
}

struct ListenerCtx {
    transport: Weak<Transport>,
    cfg: ConnConfig,
    bound: BoundState,
    cookie_secret: u64,
    hs_rx: mpsc::Receiver<RoutedPacket>,
    accept_tx: mpsc::Sender<(u32, Option<SocketAddr>)>,
    accept_len: Arc<AtomicUsize>,
}

fn cookie_bucket() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / COOKIE_BUCKET_SECS
}

/// Serves handshakes on a listening socket: answers requests with a
/// cookie-bearing response and commits a connection when the cookie comes
/// back in a final.
async fn listener_task(mut ctx: ListenerCtx) {
    let mut pending: HashMap<(Option<SocketAddr>, u32), PendingConn> = HashMap::new();

    while let Some((addr, pkt)) = ctx.hs_rx.recv().await {
        pending.retain(|_, p| p.created.elapsed() < PENDING_TTL);

        let Packet::Control(ControlPacket { body: Control::Handshake(hs), .. }) = pkt else {
            continue;
        };
        let key = (addr, hs.socket_id);
        match hs.req_type {
            HS_REQUEST | HS_RENDEZVOUS => {
                let Some(transport) = ctx.transport.upgrade() else { break };
                let entry = pending.entry(key).or_insert_with(|| {
                    let new_id = transport.alloc_id();
                    let isn = SeqNo::random();
                    let cookie = syn_cookie(addr, ctx.cookie_secret, cookie_bucket());
                    let response = Handshake {
                        version: PROTO_VERSION,
                        sock_type: hs.sock_type,
                        init_seq: isn,
                        mss: ctx.cfg.mss.min(hs.mss as usize) as u32,
                        flow_window: ctx.cfg.rcv_buf_pkts as u32,
                        req_type: HS_RESPONSE,
                        socket_id: new_id,
                        cookie,
                        peer_ip: hs.peer_ip,
                    };
                    debug!(
                        client = hs.socket_id,
                        assigned = new_id,
                        "handshake request admitted"
                    );
                    PendingConn { new_id, isn, cookie, response, created: Instant::now() }
                });
                // Answer (and re-answer) with the same response so lost
                // replies are covered by client retransmission.
                let resp = Packet::Control(ControlPacket {
                    timestamp: 0,
                    dst_id: hs.socket_id,
                    body: Control::Handshake(entry.response),
                });
                let _ = ctx.bound.substrate.as_dyn().send_to(addr, &resp).await;
            }
            HS_FINAL => {
                let Some(p) = pending.get(&key) else { continue };
                let bucket = cookie_bucket();
                let valid = hs.cookie == p.cookie
                    || hs.cookie == syn_cookie(addr, ctx.cookie_secret, bucket)
                    || hs.cookie
                        == syn_cookie(addr, ctx.cookie_secret, bucket.saturating_sub(1));
                if !valid {
                    warn!(client = hs.socket_id, "final handshake with a stale cookie");
                    continue;
                }
                let Some(transport) = ctx.transport.upgrade() else { break };
                let p = pending.remove(&key).expect("checked above");

                let (tx, rx) = mpsc::channel(1024);
                ctx.bound.routes.lock().insert(p.new_id, tx);
                let routed = Arc::new(RoutedChannel::new(ctx.bound.substrate.as_dyn(), rx));
                routed.set_peer(addr);
                let conn = Arc::new(Connection::new(p.new_id, ctx.cfg.clone(), routed));
                conn.establish(p.isn, &hs);

                let accepted = SocketEntry::new(p.new_id, ctx.cfg.sock_type);
                *accepted.cfg.lock() = ctx.cfg.clone();
                accepted.owns_channel.store(false, Ordering::Relaxed);
                *accepted.bound.lock() = Some(ctx.bound.clone());
                *accepted.conn.lock() = Some(conn.clone());
                transport.sockets.lock().insert(p.new_id, accepted);

                if ctx.accept_tx.try_send((p.new_id, addr)).is_ok() {
                    ctx.accept_len.fetch_add(1, Ordering::Relaxed);
                    debug!(id = p.new_id, "connection accepted");
                } else {
                    warn!("accept backlog full, refusing connection");
                    conn.close().await;
                    transport.sockets.lock().remove(&p.new_id);
                    ctx.bound.routes.lock().remove(&p.new_id);
                }
            }
            _ => {}
        }
    }
    trace!("listener task finished");
}

/// Reclaims closed sockets after the grace period.
async fn reaper_task(transport: Weak<Transport>) {
    loop {
        tokio::time::sleep(REAPER_INTERVAL).await;
        let Some(transport) = transport.upgrade() else { break };
        let now = Instant::now();
        let mut sockets = transport.sockets.lock();
        sockets.retain(|id, entry| {
            let expired = entry
                .closed_at
                .lock()
                .map(|t| now.duration_since(t) >= REAPER_GRACE)
                .unwrap_or(false);
            if expired {
                trace!(id, "socket reclaimed");
            }
            !expired
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh_transport() -> Arc<Transport> {
        startup()
    }

    #[tokio::test]
    async fn loopback_connect_and_exchange() {
        let t = fresh_transport().await;
        let server = t.socket(SocketType::Stream);
        let client = t.socket(SocketType::Stream);

        t.bind(server, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        t.listen(server, 4).unwrap();
        let server_addr = {
            let entry = t.entry(server).unwrap();
            let bound = entry.bound().unwrap();
            bound.substrate.as_dyn().local_addr().unwrap()
        };

        let t2 = t.clone();
        let accept_handle =
            tokio::spawn(async move { t2.accept(server).await });

        t.connect(client, Some(server_addr)).await.unwrap();
        let (accepted, peer) = accept_handle.await.unwrap().unwrap();
        assert!(peer.is_some());

        t.send_all(client, b"over the top").await.unwrap();
        let mut buf = [0u8; 12];
        t.recv_all(accepted, &mut buf).await.unwrap();
        assert_eq!(&buf, b"over the top");

        // Traffic the other way across the shared listener port.
        t.send_all(accepted, b"right back").await.unwrap();
        let mut buf = [0u8; 10];
        t.recv_all(client, &mut buf).await.unwrap();
        assert_eq!(&buf, b"right back");

        let stats = t.perfmon(client).unwrap();
        assert!(stats.pkt_sent > 0);

        t.close(client).await.unwrap();
        t.close(accepted).await.unwrap();
        t.close(server).await.unwrap();
        cleanup().await;
    }

    #[tokio::test]
    async fn connect_against_silence_times_out_closed() {
        let t = fresh_transport().await;
        let client = t.socket(SocketType::Stream);
        t.set_opt(client, SockOpt::Mss, OptValue::Int(1500)).unwrap();
        {
            let entry = t.entry(client).unwrap();
            entry.cfg.lock().conn_timeout = Duration::from_millis(600);
        }
        // A bound-but-deaf peer: nothing ever answers.
        let blackhole = UdpChannel::new("127.0.0.1:0".parse().unwrap());
        blackhole.open().await.unwrap();
        let target = blackhole.local_addr().unwrap();

        let started = Instant::now();
        let err = t.connect(client, Some(target)).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnTimeout));
        assert_eq!(err.code().0, 2);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(matches!(t.status(client), Ok(Status::Closed)));
        t.close(client).await.unwrap();
        cleanup().await;
    }

    #[tokio::test]
    async fn options_round_trip() {
        let t = fresh_transport().await;
        let s = t.socket(SocketType::Dgram);
        t.set_opt(s, SockOpt::Mss, OptValue::Int(1400)).unwrap();
        t.set_opt(s, SockOpt::SndSyn, OptValue::Bool(false)).unwrap();
        t.set_opt(s, SockOpt::Rendezvous, OptValue::Bool(true)).unwrap();
        t.set_opt(s, SockOpt::SndTimeo, OptValue::Time(Some(Duration::from_millis(250))))
            .unwrap();
        assert_eq!(t.get_opt(s, SockOpt::Mss).await.unwrap(), OptValue::Int(1400));
        assert_eq!(t.get_opt(s, SockOpt::SndSyn).await.unwrap(), OptValue::Bool(false));
        assert_eq!(t.get_opt(s, SockOpt::Rendezvous).await.unwrap(), OptValue::Bool(true));
        assert_eq!(
            t.get_opt(s, SockOpt::SndTimeo).await.unwrap(),
            OptValue::Time(Some(Duration::from_millis(250)))
        );
        // ICE server options are cached until an ICE bind consumes them,
        // but reading them back requires an ICE substrate.
        t.set_opt(s, SockOpt::IceStunServer, OptValue::Str("stun.example:3478".into()))
            .unwrap();
        assert!(t.get_opt(s, SockOpt::IceStunServer).await.is_err());
        t.close(s).await.unwrap();
        cleanup().await;
    }

    #[tokio::test]
    async fn unknown_socket_is_an_api_misuse_error() {
        let t = fresh_transport().await;
        let err = t.send(0xDEAD_BEEF, b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownSocket(_)));
        assert_eq!(err.code().0, 5);
        cleanup().await;
    }

    #[tokio::test]
    async fn poller_reports_accept_and_data_readiness() {
        let t = fresh_transport().await;
        let server = t.socket(SocketType::Stream);
        let client = t.socket(SocketType::Stream);
        t.bind(server, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        t.listen(server, 4).unwrap();
        let addr = {
            let entry = t.entry(server).unwrap();
            entry.bound().unwrap().substrate.as_dyn().local_addr().unwrap()
        };

        let poller = Poller::new(t.clone());
        poller.register(server, Interest { read: true, ..Default::default() });

        // Nothing pending yet.
        let events = poller.wait(Some(Duration::from_millis(50))).await;
        assert!(events.is_empty());

        t.connect(client, Some(addr)).await.unwrap();
        let events = poller.wait(Some(Duration::from_secs(2))).await;
        assert_eq!(events.readable, vec![server]);

        let (accepted, _) = t.accept(server).await.unwrap();
        poller.unregister(server);
        poller.register(accepted, Interest { read: true, write: true, error: false });
        t.send_all(client, b"wake").await.unwrap();
        let events = poller.wait(Some(Duration::from_secs(2))).await;
        assert!(events.readable.contains(&accepted));
        assert!(events.writable.contains(&accepted));

        t.close(client).await.unwrap();
        t.close(accepted).await.unwrap();
        t.close(server).await.unwrap();
        cleanup().await;
    }

    #[tokio::test]
    async fn startup_is_counted() {
        let t1 = startup();
        let t2 = startup();
        assert!(Arc::ptr_eq(&t1, &t2));
        cleanup().await;
        // Still alive for the second holder.
        let s = t1.socket(SocketType::Stream);
        assert!(t1.entry(s).is_ok());
        cleanup().await;
    }
}
