//! # ICE Packet Channel
//!
//! Tunnels transport packets through a connectivity-established ICE
//! candidate pair, possibly relayed over TURN. The ICE stack itself is an
//! external agent (webrtc-ice); this channel owns its lifecycle:
//!
//! - `open` builds the agent from the cached STUN/TURN/port-range
//!   configuration, registers candidate and state callbacks, and starts
//!   candidate gathering;
//! - credentials and candidates flow out-of-band (the demo tools use the
//!   length-prefixed line in [`crate::framing`]);
//! - `wait_until_connected` nominates a pair (dialing when controlling,
//!   accepting otherwise) and starts the reader and writer tasks that own
//!   all datagram I/O on the agent;
//! - sends from transport tasks are funnelled to the single writer task as
//!   completion-tracked requests; transient backpressure is re-attempted
//!   there without surfacing an error, permanent failure marks the channel
//!   failed and wakes every state waiter;
//! - `close` drains in-flight sends, tears the agent down, pushes a
//!   sentinel into the inbound queue to release a blocked `recv_from`, and
//!   joins the tasks.
//!
//! Inbound datagrams land on a bounded producer-consumer queue; `recv_from`
//! pops it with a short timeout so the engine's timers keep running, and a
//! sentinel pop reports the distinct closed-channel error.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use webrtc_ice::agent::agent_config::AgentConfig;
use webrtc_ice::agent::Agent;
use webrtc_ice::candidate::candidate_base::unmarshal_candidate;
use webrtc_ice::candidate::Candidate;
use webrtc_ice::network_type::NetworkType;
use webrtc_ice::state::ConnectionState;
use webrtc_ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc_ice::url::{ProtoType, SchemeType, Url};
use webrtc_util::Conn;

use super::{PacketChannel, DEFAULT_BUF_SIZE, RECV_POLL};
use crate::error::ChannelError;
use crate::packet::{Packet, DEFAULT_MSS};

/// Default STUN/TURN port when a server spec omits one.
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// How long `close` waits for in-flight sends to drain.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Transport used toward a TURN relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayTransport {
    /// Relay over UDP (the default).
    #[default]
    Udp,
    /// Relay over TCP.
    Tcp,
}

/// A configured TURN relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRelay {
    /// Relay host name or address.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Long-term credential user name.
    pub username: String,
    /// Long-term credential password.
    pub password: String,
    /// Transport toward the relay.
    pub transport: RelayTransport,
}

/// Cached ICE configuration, applied when the agent is (re)built at open.
#[derive(Debug, Clone, Default)]
pub struct IceConfig {
    /// STUN server for server-reflexive candidates.
    pub stun: Option<(String, u16)>,
    /// TURN relay for relayed candidates.
    pub turn: Option<TurnRelay>,
    /// Restriction on locally selected UDP ports.
    pub port_range: Option<(u16, u16)>,
}

#[derive(Debug, Default)]
struct Flags {
    connected: bool,
    failed: bool,
    gathering_done: bool,
    closing: bool,
    active_sends: u32,
}

struct SendRequest {
    data: Vec<u8>,
    done: oneshot::Sender<Result<usize, ChannelError>>,
}

/// State shared with the agent's callbacks and the reader/writer tasks.
struct Shared {
    flags: Mutex<Flags>,
    notify: Notify,
    local_candidates: Mutex<Vec<String>>,
    recv_tx: Mutex<Option<mpsc::Sender<Option<Vec<u8>>>>>,
}

impl Shared {
    fn mark_failed(&self, why: &str) {
        {
            let mut f = self.flags.lock();
            if f.connected {
                f.connected = false;
            }
            f.failed = true;
        }
        self.notify.notify_waiters();
        warn!("ICE channel marked unusable: {why}");
    }
}

/// Packet channel tunnelled through an ICE candidate pair.
pub struct IceChannel {
    controlling: AtomicBool,
    config: Mutex<IceConfig>,
    shared: Arc<Shared>,
    agent: Mutex<Option<Arc<Agent>>>,
    conn: Mutex<Option<Arc<dyn Conn + Send + Sync>>>,
    remote_creds: Mutex<Option<(String, String)>>,
    recv_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Option<Vec<u8>>>>>,
    send_tx: Mutex<Option<mpsc::Sender<SendRequest>>>,
    cancel_tx: Mutex<Option<mpsc::Sender<()>>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    snd_buf: AtomicUsize,
    rcv_buf: AtomicUsize,
}

impl IceChannel {
    /// Creates an unopened channel. `controlling` selects the ICE role:
    /// the controlling side nominates the pair.
    pub fn new(controlling: bool) -> Self {
        IceChannel {
            controlling: AtomicBool::new(controlling),
            config: Mutex::new(IceConfig::default()),
            shared: Arc::new(Shared {
                flags: Mutex::new(Flags::default()),
                notify: Notify::new(),
                local_candidates: Mutex::new(Vec::new()),
                recv_tx: Mutex::new(None),
            }),
            agent: Mutex::new(None),
            conn: Mutex::new(None),
            remote_creds: Mutex::new(None),
            recv_rx: tokio::sync::Mutex::new(None),
            send_tx: Mutex::new(None),
            cancel_tx: Mutex::new(None),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
            peer_addr: Mutex::new(None),
            snd_buf: AtomicUsize::new(DEFAULT_BUF_SIZE),
            rcv_buf: AtomicUsize::new(DEFAULT_BUF_SIZE),
        }
    }

    /// Switches the intended ICE role.
    pub fn set_controlling(&self, controlling: bool) {
        self.controlling.store(controlling, Ordering::Relaxed);
    }

    /// Whether this side controls pair nomination.
    pub fn controlling(&self) -> bool {
        self.controlling.load(Ordering::Relaxed)
    }

    /// Caches a STUN server; an empty host clears it. Port 0 selects the
    /// default 3478. Takes effect when the agent is built at open.
    pub fn set_stun(&self, host: &str, port: u16) {
        let mut cfg = self.config.lock();
        if host.is_empty() {
            cfg.stun = None;
        } else {
            let port = if port == 0 { DEFAULT_STUN_PORT } else { port };
            cfg.stun = Some((host.to_string(), port));
        }
    }

    /// Caches a TURN relay; an empty host clears it.
    pub fn set_turn_relay(&self, relay: Option<TurnRelay>) {
        let mut cfg = self.config.lock();
        cfg.turn = relay.filter(|r| !r.host.is_empty()).map(|mut r| {
            if r.port == 0 {
                r.port = DEFAULT_STUN_PORT;
            }
            r
        });
    }

    /// Restricts locally selected UDP ports. An empty or inverted range
    /// clears the restriction.
    pub fn set_port_range(&self, min: u16, max: u16) {
        let mut cfg = self.config.lock();
        cfg.port_range = if min > 0 && max > 0 && min <= max {
            Some((min, max))
        } else {
            None
        };
    }

    /// Currently cached configuration.
    pub fn config(&self) -> IceConfig {
        self.config.lock().clone()
    }

    fn build_urls(cfg: &IceConfig) -> Vec<Url> {
        let mut urls = Vec::new();
        if let Some((host, port)) = &cfg.stun {
            urls.push(Url {
                scheme: SchemeType::Stun,
                host: host.clone(),
                port: *port,
                username: String::new(),
                password: String::new(),
                proto: ProtoType::Udp,
            });
        }
        if let Some(relay) = &cfg.turn {
            urls.push(Url {
                scheme: SchemeType::Turn,
                host: relay.host.clone(),
                port: relay.port,
                username: relay.username.clone(),
                password: relay.password.clone(),
                proto: match relay.transport {
                    RelayTransport::Udp => ProtoType::Udp,
                    RelayTransport::Tcp => ProtoType::Tcp,
                },
            });
        }
        urls
    }

    /// Blocks until candidate gathering completes or the channel fails.
    pub async fn wait_for_candidates(&self) {
        loop {
            let notified = self.shared.notify.notified();
            {
                let f = self.shared.flags.lock();
                if f.gathering_done || f.failed || f.closing {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Local username fragment and password to ship to the peer.
    pub async fn local_credentials(&self) -> Result<(String, String), ChannelError> {
        let agent = self
            .agent
            .lock()
            .clone()
            .ok_or(ChannelError::Closed)?;
        Ok(agent.get_local_user_credentials().await)
    }

    /// Gathered local candidates in their textual exchange form, filtered
    /// to IPv4. Call after [`wait_for_candidates`].
    ///
    /// [`wait_for_candidates`]: IceChannel::wait_for_candidates
    pub fn local_candidates(&self) -> Vec<String> {
        self.shared.local_candidates.lock().clone()
    }

    /// Supplies the peer's credentials. Must precede
    /// [`wait_until_connected`].
    ///
    /// [`wait_until_connected`]: IceChannel::wait_until_connected
    pub fn set_remote_credentials(&self, ufrag: &str, pwd: &str) {
        *self.remote_creds.lock() = Some((ufrag.to_string(), pwd.to_string()));
    }

    /// Applies the peer's candidates. Entries that fail to parse, name a
    /// different component, or are not IPv4 are dropped.
    pub fn set_remote_candidates(&self, candidates: &[String]) -> Result<usize, ChannelError> {
        let agent = self
            .agent
            .lock()
            .clone()
            .ok_or(ChannelError::Closed)?;
        let mut applied = 0;
        for raw in candidates {
            let cand = match unmarshal_candidate(raw) {
                Ok(c) => c,
                Err(e) => {
                    debug!("ignoring unparseable remote candidate {raw:?}: {e}");
                    continue;
                }
            };
            if cand.component() != 1 {
                debug!("ignoring remote candidate for component {}", cand.component());
                continue;
            }
            if cand.address().contains(':') {
                debug!("ignoring non-IPv4 remote candidate {raw:?}");
                continue;
            }
            let cand: Arc<dyn Candidate + Send + Sync> = Arc::new(cand);
            agent
                .add_remote_candidate(&cand)
                .map_err(|e| ChannelError::Broken(e.to_string()))?;
            applied += 1;
        }
        debug!("applied {applied} remote ICE candidates");
        Ok(applied)
    }

    /// Runs connectivity establishment and blocks until the component is
    /// usable, `timeout_after` elapses, or the channel fails. Returns
    /// whether the channel is connected.
    pub async fn wait_until_connected(&self, timeout_after: Duration) -> bool {
        if self.shared.flags.lock().connected {
            return true;
        }
        let agent = match self.agent.lock().clone() {
            Some(a) => a,
            None => return false,
        };
        let Some((ufrag, pwd)) = self.remote_creds.lock().clone() else {
            warn!("wait_until_connected called before remote credentials were set");
            return false;
        };

        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        *self.cancel_tx.lock() = Some(cancel_tx);

        let dialing = self.controlling();
        debug!("starting ICE connectivity ({})", if dialing { "dial" } else { "accept" });
        let connect = async {
            if dialing {
                agent.dial(cancel_rx, ufrag, pwd).await.map(erase_conn)
            } else {
                agent.accept(cancel_rx, ufrag, pwd).await.map(erase_conn)
            }
        };
        let conn = match timeout(timeout_after, connect).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                self.shared.mark_failed(&format!("connectivity failed: {e}"));
                return false;
            }
            Err(_) => {
                debug!("ICE connectivity timed out after {timeout_after:?}");
                return false;
            }
        };

        *self.local_addr.lock() = conn.local_addr().ok();
        *self.peer_addr.lock() = conn.remote_addr();
        {
            let mut f = self.shared.flags.lock();
            f.connected = true;
        }
        self.shared.notify.notify_waiters();

        let (send_tx, send_rx) = mpsc::channel::<SendRequest>(256);
        *self.send_tx.lock() = Some(send_tx);
        *self.conn.lock() = Some(conn.clone());

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Self::reader_task(conn.clone(), self.shared.clone())));
        tasks.push(tokio::spawn(Self::writer_task(conn, send_rx, self.shared.clone())));
        true
    }

    /// Pumps inbound datagrams into the receive queue in arrival order.
    async fn reader_task(conn: Arc<dyn Conn + Send + Sync>, shared: Arc<Shared>) {
        let mut buf = vec![0u8; DEFAULT_MSS];
        loop {
            match conn.recv(&mut buf).await {
                Ok(len) => {
                    let tx = shared.recv_tx.lock().clone();
                    let Some(tx) = tx else { break };
                    if tx.send(Some(buf[..len].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let closing = shared.flags.lock().closing;
                    if !closing {
                        shared.mark_failed(&format!("receive failed: {e}"));
                    }
                    break;
                }
            }
        }
        debug!("ICE reader task finished");
    }

    /// Serializes all agent sends; the substrate forbids concurrent sends
    /// from arbitrary tasks.
    async fn writer_task(
        conn: Arc<dyn Conn + Send + Sync>,
        mut rx: mpsc::Receiver<SendRequest>,
        shared: Arc<Shared>,
    ) {
        while let Some(req) = rx.recv().await {
            let result = loop {
                {
                    let f = shared.flags.lock();
                    if f.closing || f.failed {
                        break Err(ChannelError::Closed);
                    }
                }
                match conn.send(&req.data).await {
                    Ok(n) => break Ok(n),
                    Err(e) if is_transient(&e) => {
                        // Kernel-level backpressure: retry on the next
                        // iteration, keeping FIFO order.
                        debug!("ICE send deferred ({e}), retrying");
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Err(e) => {
                        shared.mark_failed(&format!("send failed: {e}"));
                        break Err(ChannelError::Broken(e.to_string()));
                    }
                }
            };
            {
                let mut f = shared.flags.lock();
                f.active_sends = f.active_sends.saturating_sub(1);
            }
            shared.notify.notify_waiters();
            let _ = req.done.send(result);
        }
        debug!("ICE writer task finished");
    }

    #[cfg(test)]
    pub(crate) async fn push_inbound_for_testing(&self, datagram: Option<Vec<u8>>) {
        let tx = self.shared.recv_tx.lock().clone().expect("channel open");
        tx.send(datagram).await.expect("queue alive");
    }
}

fn erase_conn<C: Conn + Send + Sync + 'static>(conn: Arc<C>) -> Arc<dyn Conn + Send + Sync> {
    conn
}

// The substrate surfaces kernel send errors only as rendered text, so
// backpressure is recognized by the exact phrases the standard error
// kinds produce. Needles are anchored; a permanent failure whose message
// merely contains "again" must not be retried.
fn is_transient(err: &webrtc_util::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("would block")
        || msg.contains("try again")
        || msg.contains("resource temporarily unavailable")
        || msg.contains("interrupted")
        || msg.contains("no buffer space")
}

#[async_trait]
impl PacketChannel for IceChannel {
    async fn open(&self) -> Result<(), ChannelError> {
        if self.agent.lock().is_some() {
            return Ok(());
        }
        {
            let mut f = self.shared.flags.lock();
            *f = Flags::default();
        }
        self.shared.local_candidates.lock().clear();

        let cfg = self.config.lock().clone();
        let udp_network = match cfg.port_range {
            Some((min, max)) => UDPNetwork::Ephemeral(
                EphemeralUDP::new(min, max)
                    .map_err(|e| ChannelError::Broken(e.to_string()))?,
            ),
            None => UDPNetwork::default(),
        };
        let agent_config = AgentConfig {
            urls: Self::build_urls(&cfg),
            network_types: vec![NetworkType::Udp4],
            udp_network,
            ..Default::default()
        };
        let agent = Arc::new(
            Agent::new(agent_config)
                .await
                .map_err(|e| ChannelError::Broken(e.to_string()))?,
        );

        let (recv_tx, recv_rx) = mpsc::channel(1024);
        *self.shared.recv_tx.lock() = Some(recv_tx);
        *self.recv_rx.lock().await = Some(recv_rx);

        let shared = self.shared.clone();
        agent.on_candidate(Box::new(move |cand: Option<Arc<dyn Candidate + Send + Sync>>| {
            let shared = shared.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => {
                        if c.address().contains(':') {
                            debug!("skipping non-IPv4 local candidate {}", c.marshal());
                            return;
                        }
                        shared.local_candidates.lock().push(c.marshal());
                    }
                    None => {
                        shared.flags.lock().gathering_done = true;
                        shared.notify.notify_waiters();
                        debug!("ICE candidate gathering complete");
                    }
                }
            })
        }));

        let shared = self.shared.clone();
        agent.on_connection_state_change(Box::new(move |state: ConnectionState| {
            let shared = shared.clone();
            Box::pin(async move {
                debug!("ICE connection state changed to {state}");
                match state {
                    ConnectionState::Connected | ConnectionState::Completed => {
                        shared.flags.lock().connected = true;
                        shared.notify.notify_waiters();
                    }
                    ConnectionState::Failed => {
                        shared.mark_failed("component reached FAILED");
                    }
                    ConnectionState::Disconnected => {
                        let was_connected = shared.flags.lock().connected;
                        if was_connected {
                            shared.mark_failed("component disconnected after being connected");
                        }
                    }
                    _ => {}
                }
            })
        }));

        agent
            .gather_candidates()
            .map_err(|e| ChannelError::Broken(e.to_string()))?;
        debug!("ICE channel opened, candidate gathering started");
        *self.agent.lock() = Some(agent);
        Ok(())
    }

    async fn close(&self) {
        debug!("closing ICE channel");
        {
            let mut f = self.shared.flags.lock();
            if f.closing {
                return;
            }
            f.closing = true;
        }
        self.shared.notify.notify_waiters();

        // Let in-flight sends drain before tearing down the substrate.
        let drained = timeout(CLOSE_DRAIN_TIMEOUT, async {
            loop {
                let notified = self.shared.notify.notified();
                if self.shared.flags.lock().active_sends == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("ICE close proceeding with sends still in flight");
        }

        if let Some(cancel) = self.cancel_tx.lock().take() {
            let _ = cancel.try_send(());
        }
        *self.send_tx.lock() = None;

        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            let _ = conn.close().await;
        }
        let agent = self.agent.lock().take();
        if let Some(agent) = agent {
            let _ = agent.close().await;
        }

        // Sentinel wakes any blocked recv_from with the closed error.
        let tx = self.shared.recv_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.try_send(None);
        }

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        debug!("ICE channel closed");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock()
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

    async fn send_to(&self, _addr: Option<SocketAddr>, pkt: &Packet)
        -> Result<usize, ChannelError> {
        {
            let mut f = self.shared.flags.lock();
            if f.closing {
                return Err(ChannelError::Closed);
            }
            if f.failed {
                return Err(ChannelError::Broken("channel already failed".into()));
            }
            f.active_sends += 1;
        }
        let tx = self.send_tx.lock().clone();
        let Some(tx) = tx else {
            let mut f = self.shared.flags.lock();
            f.active_sends = f.active_sends.saturating_sub(1);
            return Err(ChannelError::Broken("channel not connected".into()));
        };

        let mut data = Vec::with_capacity(pkt.wire_len());
        pkt.encode(&mut data);
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(SendRequest { data, done: done_tx }).await.is_err() {
            let mut f = self.shared.flags.lock();
            f.active_sends = f.active_sends.saturating_sub(1);
            self.shared.notify.notify_waiters();
            return Err(ChannelError::Closed);
        }
        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Closed),
        }
    }

    async fn recv_from(&self) -> Result<(Option<SocketAddr>, Packet), ChannelError> {
        let mut guard = self.recv_rx.lock().await;
        let rx = guard.as_mut().ok_or(ChannelError::Closed)?;
        match timeout(RECV_POLL, rx.recv()).await {
            Ok(Some(Some(datagram))) => match Packet::decode(&datagram) {
                Ok(pkt) => Ok((*self.peer_addr.lock(), pkt)),
                Err(e) => {
                    debug!("discarding undecodable ICE datagram: {e}");
                    Err(ChannelError::Again)
                }
            },
            // Sentinel or dropped producer: the channel is gone.
            Ok(Some(None)) | Ok(None) => Err(ChannelError::Closed),
            Err(_) => {
                let f = self.shared.flags.lock();
                if f.closing {
                    Err(ChannelError::Closed)
                } else {
                    Err(ChannelError::Again)
                }
            }
        }
    }
}
