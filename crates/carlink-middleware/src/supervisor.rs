//! [`ConnectionSupervisor`] – owns one transport connection at a time.
//!
//! The same supervisor runs on both peers.  The agent *dials* the server and
//! the server *listens*; everything after the TCP handshake is identical.
//!
//! # State machine
//!
//! ```text
//!  DISCONNECTED ──start──▶ CONNECTING ──handshake ok──▶ CONNECTED
//!        ▲                   ▲    │ fail: backoff, retry       │
//!        │                   │    ▼                            │ read/write error,
//!        │                   └─ FAULTED ◀──────────────────────┘ timeout, peer close
//!        └──────────── stop() from any state
//! ```
//!
//! An idle link is healthy: the read timeout only bounds a message whose
//! first byte has arrived.  Half-open peers are caught by the write timeout
//! and by TCP keepalive, which is enabled on every socket.
//!
//! Callers see exactly two things: [`ConnectionSupervisor::send`], which
//! fails fast unless the link is `CONNECTED`, and an [`InboundSink`] that
//! receives every decoded message.  Reconnection is invisible to both.

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use carlink_types::{ConnectionState, Event, EventPayload, LinkError};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::bus::{EventBus, Topic};
use crate::codec::{CodecLimits, WireMessage};
use crate::mailbox::Mailbox;

const EVENT_SOURCE: &str = "carlink-middleware::supervisor";

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Which side of the TCP handshake this supervisor performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Connect out to `host:port` (agent side).
    Dial(String),
    /// Accept one peer at a time on `host:port` (server side).  A newer peer
    /// supersedes the current one.
    Listen(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Dial(addr) => write!(f, "dial {addr}"),
            Endpoint::Listen(addr) => write!(f, "listen {addr}"),
        }
    }
}

/// Transport tuning for one supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub backoff: BackoffConfig,
    pub limits: CodecLimits,
    pub connect_timeout: Duration,
    /// Longest time a started message may take to arrive completely.
    /// Silence between messages is not timed.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Depth of the outbound mailbox.  `1` means only the newest unsent
    /// message is kept.
    pub outbound_depth: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            limits: CodecLimits::default(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(1),
            outbound_depth: 1,
        }
    }
}

/// Receives everything the supervisor decodes.
///
/// Called from the supervisor's task; implementations must not block.
pub trait InboundSink<M>: Send + Sync + 'static {
    fn on_message(&self, message: M);

    /// Notified on every state transition.
    fn on_state(&self, _state: ConnectionState) {}
}

/// The send half of a link, as seen by pipelines.
pub trait Outbound<M>: Send + Sync {
    /// Queue `message` for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] immediately when the link is not
    /// `CONNECTED`; never waits for a connection.
    fn send(&self, message: M) -> Result<(), LinkError>;

    fn state(&self) -> ConnectionState;
}

/// Point-in-time copy of [`LinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatsSnapshot {
    pub connects: u64,
    pub faults: u64,
    pub sent: u64,
    pub dropped: u64,
    pub received: u64,
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct LinkStats {
    connects: AtomicU64,
    faults: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
    malformed: AtomicU64,
}

impl LinkStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

struct Shared<O> {
    state: watch::Sender<ConnectionState>,
    outbound: Mailbox<O>,
    stats: LinkStats,
    local_addr: Mutex<Option<SocketAddr>>,
}

// ────────────────────────────────────────────────────────────────────────────
// ConnectionSupervisor
// ────────────────────────────────────────────────────────────────────────────

/// Owns the transport for one logical peer link.
///
/// `O` is the message type this side sends, `I` the type it receives.  The
/// supervisor is an ordinary value with an explicit [`start`][Self::start] /
/// [`stop`][Self::stop] lifecycle, so several links can coexist in one
/// process.
pub struct ConnectionSupervisor<O, I> {
    endpoint: Endpoint,
    config: SupervisorConfig,
    bus: Option<EventBus>,
    shared: Arc<Shared<O>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    _inbound: PhantomData<fn() -> I>,
}

impl<O, I> ConnectionSupervisor<O, I>
where
    O: WireMessage,
    I: WireMessage,
{
    pub fn new(endpoint: Endpoint, config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            endpoint,
            config,
            bus: None,
            shared: Arc::new(Shared {
                state,
                outbound: Mailbox::new(config.outbound_depth),
                stats: LinkStats::default(),
                local_addr: Mutex::new(None),
            }),
            shutdown,
            task: Mutex::new(None),
            _inbound: PhantomData,
        }
    }

    /// Publish state transitions on `bus` ([`Topic::Link`]).
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Spawn the connection task; decoded messages go to `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::AlreadyStarted`] if the task is already running.
    pub fn start(&self, sink: Arc<dyn InboundSink<I>>) -> Result<(), LinkError> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(LinkError::AlreadyStarted);
        }
        self.shutdown.send_replace(false);
        let link = LinkTask::<O, I> {
            endpoint: self.endpoint.clone(),
            config: self.config,
            shared: Arc::clone(&self.shared),
            sink,
            bus: self.bus.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        info!(endpoint = %self.endpoint, "starting link supervisor");
        *task = Some(tokio::spawn(link.run()));
        Ok(())
    }

    /// Request shutdown and wait for the connection task to exit.
    ///
    /// Anything still in the outbound mailbox is written (bounded by the
    /// write timeout) before the transport is closed.  The final state is
    /// `DISCONNECTED`.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "link task ended abnormally");
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch channel that follows every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Messages accepted by [`send`][Self::send] but not yet written.
    pub fn pending_outbound(&self) -> usize {
        self.shared.outbound.len()
    }

    /// Bound address of a listening supervisor, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// See [`Outbound::send`].
    pub fn send(&self, message: O) -> Result<(), LinkError> {
        let state = self.state();
        if !state.is_connected() {
            LinkStats::bump(&self.shared.stats.dropped);
            return Err(LinkError::NotConnected(state));
        }
        if self.shared.outbound.push(message).is_some() {
            LinkStats::bump(&self.shared.stats.dropped);
            trace!(kind = O::KIND, "displaced unsent outbound message");
        }
        Ok(())
    }
}

impl<O, I> Outbound<O> for ConnectionSupervisor<O, I>
where
    O: WireMessage,
    I: WireMessage,
{
    fn send(&self, message: O) -> Result<(), LinkError> {
        ConnectionSupervisor::send(self, message)
    }

    fn state(&self) -> ConnectionState {
        ConnectionSupervisor::state(self)
    }
}

impl<O, I> Drop for ConnectionSupervisor<O, I> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl<M: Send + 'static> InboundSink<M> for Mailbox<M> {
    fn on_message(&self, message: M) {
        if self.push(message).is_some() {
            trace!("inbound mailbox full; dropped oldest entry");
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Connection task
// ────────────────────────────────────────────────────────────────────────────

enum Establish {
    Ready(TcpStream, SocketAddr),
    Failed(String),
    Shutdown,
}

enum SessionEnd {
    Fault(String),
    Superseded(TcpStream, SocketAddr),
    Shutdown,
}

struct LinkTask<O, I> {
    endpoint: Endpoint,
    config: SupervisorConfig,
    shared: Arc<Shared<O>>,
    sink: Arc<dyn InboundSink<I>>,
    bus: Option<EventBus>,
    shutdown: watch::Receiver<bool>,
}

impl<O, I> LinkTask<O, I>
where
    O: WireMessage,
    I: WireMessage,
{
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.backoff);

        let listener = match self.endpoint.clone() {
            Endpoint::Listen(addr) => match self.bind(&addr, &mut backoff).await {
                Some(l) => Some(l),
                None => {
                    self.set_state(ConnectionState::Disconnected, None);
                    return;
                }
            },
            Endpoint::Dial(_) => None,
        };

        let mut pending: Option<(TcpStream, SocketAddr)> = None;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting, None);

            let (stream, peer) = match pending.take() {
                Some(ready) => ready,
                None => match self.establish(listener.as_ref()).await {
                    Establish::Ready(stream, peer) => (stream, peer),
                    Establish::Shutdown => break,
                    Establish::Failed(reason) => {
                        let delay = backoff.next_delay();
                        warn!(
                            endpoint = %self.endpoint,
                            attempt = backoff.attempts(),
                            retry_in_ms = delay.as_millis() as u64,
                            error = %reason,
                            "connection attempt failed"
                        );
                        if self.sleep_or_shutdown(delay).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            backoff.reset();
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "could not disable Nagle");
            }
            self.shared.outbound.clear();
            LinkStats::bump(&self.shared.stats.connects);
            info!(peer = %peer, endpoint = %self.endpoint, "link connected");
            self.set_state(ConnectionState::Connected, Some(peer));

            match self.serve(stream, listener.as_ref()).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Fault(reason) => {
                    LinkStats::bump(&self.shared.stats.faults);
                    let dropped = self.shared.outbound.clear();
                    warn!(peer = %peer, reason = %reason, dropped_outbound = dropped, "link faulted");
                    self.set_state(ConnectionState::Faulted, Some(peer));
                }
                SessionEnd::Superseded(stream, new_peer) => {
                    LinkStats::bump(&self.shared.stats.faults);
                    self.shared.outbound.clear();
                    info!(old_peer = %peer, new_peer = %new_peer, "newer peer superseded current link");
                    self.set_state(ConnectionState::Faulted, Some(peer));
                    pending = Some((stream, new_peer));
                }
            }
        }

        self.shared.outbound.clear();
        self.set_state(ConnectionState::Disconnected, None);
        info!(endpoint = %self.endpoint, "link supervisor stopped");
    }

    /// Bind the listening socket, retrying with backoff.  `None` on shutdown.
    async fn bind(&mut self, addr: &str, backoff: &mut Backoff) -> Option<TcpListener> {
        loop {
            if *self.shutdown.borrow() {
                return None;
            }
            self.set_state(ConnectionState::Connecting, None);
            match listen_on(addr).await {
                Ok(listener) => {
                    let local = listener.local_addr().ok();
                    *self.shared.local_addr.lock() = local;
                    info!(addr = %addr, local = ?local, "listening for peer");
                    backoff.reset();
                    return Some(listener);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(addr = %addr, error = %e, retry_in_ms = delay.as_millis() as u64, "bind failed");
                    if self.sleep_or_shutdown(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn establish(&mut self, listener: Option<&TcpListener>) -> Establish {
        let attempt = async {
            match (listener, &self.endpoint) {
                (Some(listener), _) => match listener.accept().await {
                    Ok((stream, peer)) => Establish::Ready(stream, peer),
                    Err(e) => Establish::Failed(format!("accept: {e}")),
                },
                (None, endpoint) => {
                    let addr = match endpoint {
                        Endpoint::Dial(addr) | Endpoint::Listen(addr) => addr.as_str(),
                    };
                    match timeout(self.config.connect_timeout, dial(addr)).await {
                        Err(_) => Establish::Failed(format!(
                            "connect to {addr} timed out after {:?}",
                            self.config.connect_timeout
                        )),
                        Ok(Err(e)) => Establish::Failed(format!("connect to {addr}: {e}")),
                        Ok(Ok(stream)) => match stream.peer_addr() {
                            Ok(peer) => Establish::Ready(stream, peer),
                            Err(e) => Establish::Failed(format!("peer address: {e}")),
                        },
                    }
                }
            }
        };
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            outcome = attempt => outcome,
            _ = wait_shutdown(&mut shutdown) => Establish::Shutdown,
        }
    }

    /// Run one connected session until it faults, is superseded, or the
    /// supervisor is stopped.
    async fn serve(&mut self, stream: TcpStream, listener: Option<&TcpListener>) -> SessionEnd {
        let (mut rd, mut wr) = stream.into_split();
        let limits = self.config.limits;
        let read_timeout = self.config.read_timeout;
        let write_timeout = self.config.write_timeout;
        let shared = &self.shared;
        let sink = &self.sink;
        let mut shutdown = self.shutdown.clone();

        let end = {
            let reader = async {
                let mut first = [0u8; 1];
                loop {
                    match rd.peek(&mut first).await {
                        Ok(0) => return "peer closed the connection".to_string(),
                        Ok(_) => {}
                        Err(e) => return format!("{} read failed: {e}", I::KIND),
                    }
                    match timeout(read_timeout, I::read_from(&mut rd, &limits)).await {
                        Err(_) => {
                            return format!("{} incomplete after {read_timeout:?}", I::KIND);
                        }
                        Ok(Ok(message)) => {
                            LinkStats::bump(&shared.stats.received);
                            sink.on_message(message);
                        }
                        Ok(Err(e)) if e.is_recoverable() => {
                            LinkStats::bump(&shared.stats.malformed);
                            warn!(kind = I::KIND, error = %e, "discarding malformed message");
                        }
                        Ok(Err(e)) => return e.to_string(),
                    }
                }
            };
            let writer = async {
                loop {
                    let Some(message) = shared.outbound.recv().await else {
                        return "outbound mailbox closed".to_string();
                    };
                    let Some(bytes) = encode_outbound(&message, &limits, &shared.stats) else {
                        continue;
                    };
                    if let Err(reason) =
                        write_bytes(&mut wr, O::KIND, bytes, write_timeout, &shared.stats).await
                    {
                        return reason;
                    }
                }
            };
            tokio::select! {
                reason = reader => SessionEnd::Fault(reason),
                reason = writer => SessionEnd::Fault(reason),
                (stream, peer) = accept_next(listener) => SessionEnd::Superseded(stream, peer),
                _ = wait_shutdown(&mut shutdown) => SessionEnd::Shutdown,
            }
        };

        if matches!(end, SessionEnd::Shutdown) {
            while let Some(message) = self.shared.outbound.try_pop() {
                let Some(bytes) = encode_outbound(&message, &limits, &self.shared.stats) else {
                    continue;
                };
                if let Err(reason) =
                    write_bytes(&mut wr, O::KIND, bytes, write_timeout, &self.shared.stats).await
                {
                    debug!(reason = %reason, "could not flush outbound message on shutdown");
                    break;
                }
            }
            if let Err(e) = wr.shutdown().await {
                debug!(error = %e, "transport shutdown");
            }
        }
        end
    }

    /// Sleep for `delay`; returns `true` if shutdown was requested meanwhile.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = wait_shutdown(&mut shutdown) => true,
        }
    }

    fn set_state(&self, to: ConnectionState, peer: Option<SocketAddr>) {
        let from = self.shared.state.send_replace(to);
        if from == to {
            return;
        }
        debug!(from = %from, to = %to, "link state transition");
        self.sink.on_state(to);
        if let Some(bus) = &self.bus {
            let event = Event::new(
                EVENT_SOURCE,
                EventPayload::LinkState {
                    from,
                    to,
                    peer: peer.map(|p| p.to_string()),
                },
            );
            // Best-effort publish – no subscribers is not an error.
            let _ = bus.publish_to(Topic::Link, event);
        }
    }
}

/// `None` (counted as dropped) when the message cannot be put on the wire.
fn encode_outbound<O: WireMessage>(
    message: &O,
    limits: &CodecLimits,
    stats: &LinkStats,
) -> Option<Vec<u8>> {
    match message.encode(limits) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            LinkStats::bump(&stats.dropped);
            warn!(kind = O::KIND, error = %e, "dropping message that cannot be encoded");
            None
        }
    }
}

async fn write_bytes(
    wr: &mut OwnedWriteHalf,
    kind: &'static str,
    bytes: Vec<u8>,
    write_timeout: Duration,
    stats: &LinkStats,
) -> Result<(), String> {
    match timeout(write_timeout, wr.write_all(&bytes)).await {
        Err(_) => Err(format!("{kind} write timed out after {write_timeout:?}")),
        Ok(Err(e)) => Err(format!("{kind} write failed: {e}")),
        Ok(Ok(())) => {
            LinkStats::bump(&stats.sent);
            Ok(())
        }
    }
}

fn keepalive_socket(addr: &SocketAddr) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    Ok(socket)
}

/// Bind a listener whose accepted sockets inherit `SO_KEEPALIVE`.
async fn listen_on(addr: &str) -> io::Result<TcpListener> {
    let mut last = None;
    for local in lookup_host(addr).await? {
        let socket = keepalive_socket(&local)?;
        #[cfg(unix)]
        socket.set_reuseaddr(true)?;
        if let Err(e) = socket.bind(local) {
            last = Some(e);
            continue;
        }
        return socket.listen(16);
    }
    Err(last.unwrap_or_else(|| no_address(addr)))
}

/// Connect to the first address `addr` resolves to that accepts.
async fn dial(addr: &str) -> io::Result<TcpStream> {
    let mut last = None;
    for target in lookup_host(addr).await? {
        match keepalive_socket(&target)?.connect(target).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| no_address(addr)))
}

fn no_address(addr: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("{addr} resolved to no address"))
}

/// Resolves with the next accepted peer; never resolves for dialers.
async fn accept_next(listener: Option<&TcpListener>) -> (TcpStream, SocketAddr) {
    let Some(listener) = listener else {
        return std::future::pending().await;
    };
    loop {
        match listener.accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!(error = %e, "accept failed while connected");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Resolves once shutdown is requested or the supervisor is dropped.
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use carlink_types::{ActuatorCommand, SensorFrame};
    use tokio::io::AsyncReadExt;

    type AgentLink = ConnectionSupervisor<SensorFrame, ActuatorCommand>;
    type ServerLink = ConnectionSupervisor<ActuatorCommand, SensorFrame>;

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            backoff: BackoffConfig {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(100),
                multiplier: 2.0,
            },
            ..SupervisorConfig::default()
        }
    }

    async fn wait_for_state<O: WireMessage, I: WireMessage>(
        link: &ConnectionSupervisor<O, I>,
        target: ConnectionState,
    ) {
        let mut rx = link.subscribe_state();
        tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| *s == target))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {target}"))
            .expect("state channel closed");
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting until {what}");
    }

    async fn wait_for_local_addr<O: WireMessage, I: WireMessage>(
        link: &ConnectionSupervisor<O, I>,
    ) -> SocketAddr {
        for _ in 0..300 {
            if let Some(addr) = link.local_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("listener never bound");
    }

    #[tokio::test]
    async fn dialer_sends_frames_and_receives_commands() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let link = AgentLink::new(Endpoint::Dial(addr.to_string()), fast_config());
        let inbox: Arc<Mailbox<ActuatorCommand>> = Arc::new(Mailbox::new(4));
        link.start(inbox.clone())?;

        let (mut peer, _) = listener.accept().await?;
        wait_for_state(&link, ConnectionState::Connected).await;

        link.send(SensorFrame::new(b"jpeg-bytes".to_vec()))?;
        let frame = SensorFrame::read_from(&mut peer, &CodecLimits::default()).await?;
        assert_eq!(frame.payload(), b"jpeg-bytes");

        peer.write_all(&[200, 200, 1, 1]).await?;
        let cmd = tokio::time::timeout(Duration::from_secs(2), inbox.recv()).await?;
        assert_eq!(cmd, Some(ActuatorCommand::forward(200)));

        link.stop().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
        Ok(())
    }

    #[tokio::test]
    async fn send_fails_fast_when_not_connected() -> Result<(), Box<dyn std::error::Error>> {
        // Grab a free port, then close it so every connect is refused.
        let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;

        let link = AgentLink::new(Endpoint::Dial(addr.to_string()), fast_config());
        link.start(Arc::new(Mailbox::<ActuatorCommand>::slot()))?;

        let started = std::time::Instant::now();
        let result = link.send(SensorFrame::new(vec![1, 2, 3]));
        assert!(matches!(result, Err(LinkError::NotConnected(_))));
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(link.pending_outbound(), 0);
        assert_eq!(link.stats().dropped, 1);

        link.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn start_twice_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
        let link = AgentLink::new(Endpoint::Dial(addr.to_string()), fast_config());
        link.start(Arc::new(Mailbox::<ActuatorCommand>::slot()))?;
        assert!(matches!(
            link.start(Arc::new(Mailbox::<ActuatorCommand>::slot())),
            Err(LinkError::AlreadyStarted)
        ));
        link.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn malformed_command_is_discarded_and_stream_survives() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let link = AgentLink::new(Endpoint::Dial(addr.to_string()), fast_config());
        let inbox: Arc<Mailbox<ActuatorCommand>> = Arc::new(Mailbox::new(4));
        link.start(inbox.clone())?;
        let (mut peer, _) = listener.accept().await?;
        wait_for_state(&link, ConnectionState::Connected).await;

        peer.write_all(&[120, 120, 1, 3, 9, 9, 0, 0]).await?;
        let cmd = tokio::time::timeout(Duration::from_secs(2), inbox.recv()).await?;
        assert_eq!(cmd, Some(ActuatorCommand::backward(9)));
        assert!(inbox.is_empty());
        assert_eq!(link.stats().malformed, 1);
        assert_eq!(link.state(), ConnectionState::Connected);

        link.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn reconnects_transparently_after_peer_close() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let link = AgentLink::new(Endpoint::Dial(addr.to_string()), fast_config());
        let inbox: Arc<Mailbox<ActuatorCommand>> = Arc::new(Mailbox::slot());
        link.start(inbox.clone())?;

        let (first, _) = listener.accept().await?;
        wait_for_state(&link, ConnectionState::Connected).await;
        drop(first);

        let (mut second, _) = tokio::time::timeout(Duration::from_secs(3), listener.accept()).await??;
        wait_until("second connect", || link.stats().connects == 2).await;
        wait_for_state(&link, ConnectionState::Connected).await;
        assert!(link.stats().faults >= 1);

        second.write_all(&ActuatorCommand::NEUTRAL.to_bytes()).await?;
        let cmd = tokio::time::timeout(Duration::from_secs(2), inbox.recv()).await?;
        assert_eq!(cmd, Some(ActuatorCommand::NEUTRAL));

        link.stop().await;
        Ok(())
    }

    #[test]
    fn connection_task_is_send() {
        fn assert_send<T: Send>(_: T) {}
        let link = AgentLink::new(Endpoint::Dial("127.0.0.1:9".to_string()), fast_config());
        let task = LinkTask::<SensorFrame, ActuatorCommand> {
            endpoint: link.endpoint.clone(),
            config: link.config,
            shared: Arc::clone(&link.shared),
            sink: Arc::new(Mailbox::<ActuatorCommand>::slot()),
            bus: None,
            shutdown: link.shutdown.subscribe(),
        };
        assert_send(task.run());
    }

    #[tokio::test]
    async fn quiet_peer_is_not_faulted() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = SupervisorConfig {
            read_timeout: Duration::from_millis(100),
            ..fast_config()
        };
        let link = AgentLink::new(Endpoint::Dial(addr.to_string()), config);
        let inbox: Arc<Mailbox<ActuatorCommand>> = Arc::new(Mailbox::slot());
        link.start(inbox.clone())?;

        let (mut quiet, _) = listener.accept().await?;
        wait_for_state(&link, ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(link.stats().faults, 0);
        assert_eq!(link.stats().connects, 1);

        quiet.write_all(&[50, 50, 1, 1]).await?;
        let cmd = tokio::time::timeout(Duration::from_secs(2), inbox.recv()).await?;
        assert_eq!(cmd, Some(ActuatorCommand::forward(50)));

        link.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn stalled_message_faults_after_read_timeout() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = SupervisorConfig {
            read_timeout: Duration::from_millis(100),
            ..fast_config()
        };
        let link = AgentLink::new(Endpoint::Dial(addr.to_string()), config);
        link.start(Arc::new(Mailbox::<ActuatorCommand>::slot()))?;

        let (mut stalled, _) = listener.accept().await?;
        wait_for_state(&link, ConnectionState::Connected).await;
        stalled.write_all(&[200, 200]).await?;
        wait_until("read timeout fault", || link.stats().faults >= 1).await;
        assert_eq!(link.stats().received, 0);

        link.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn listener_faults_on_oversize_frame() -> Result<(), Box<dyn std::error::Error>> {
        let config = SupervisorConfig {
            limits: CodecLimits { max_frame_len: 16 },
            ..fast_config()
        };
        let link = ServerLink::new(Endpoint::Listen("127.0.0.1:0".to_string()), config);
        link.start(Arc::new(Mailbox::<SensorFrame>::slot()))?;
        let addr = wait_for_local_addr(&link).await;

        let mut car = TcpStream::connect(addr).await?;
        wait_for_state(&link, ConnectionState::Connected).await;
        car.write_all(&1000u32.to_be_bytes()).await?;

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), car.read(&mut buf)).await??;
        assert_eq!(n, 0, "server must drop the connection");
        wait_until("oversize fault", || link.stats().faults == 1).await;
        assert_eq!(link.stats().received, 0);

        link.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn newer_peer_supersedes_current_one() -> Result<(), Box<dyn std::error::Error>> {
        let link = ServerLink::new(Endpoint::Listen("127.0.0.1:0".to_string()), fast_config());
        let frames: Arc<Mailbox<SensorFrame>> = Arc::new(Mailbox::new(2));
        link.start(frames.clone())?;
        let addr = wait_for_local_addr(&link).await;

        let _old = TcpStream::connect(addr).await?;
        wait_for_state(&link, ConnectionState::Connected).await;

        let mut new = TcpStream::connect(addr).await?;
        let limits = CodecLimits::default();
        new.write_all(&SensorFrame::new(b"from-new".to_vec()).encode(&limits)?)
            .await?;
        let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv()).await?;
        assert_eq!(frame.map(|f| f.into_payload()), Some(b"from-new".to_vec()));
        assert_eq!(link.stats().connects, 2);

        link.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn stop_flushes_final_command_then_closes() -> Result<(), Box<dyn std::error::Error>> {
        let link = ServerLink::new(Endpoint::Listen("127.0.0.1:0".to_string()), fast_config());
        link.start(Arc::new(Mailbox::<SensorFrame>::slot()))?;
        let addr = wait_for_local_addr(&link).await;

        let mut car = TcpStream::connect(addr).await?;
        wait_for_state(&link, ConnectionState::Connected).await;

        link.send(ActuatorCommand::NEUTRAL)?;
        link.stop().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), car.read_to_end(&mut received)).await??;
        assert_eq!(received, ActuatorCommand::NEUTRAL.to_bytes().to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn state_changes_are_published_on_the_bus() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Link);
        let link = ServerLink::new(Endpoint::Listen("127.0.0.1:0".to_string()), fast_config())
            .with_bus(bus.clone());
        link.start(Arc::new(Mailbox::<SensorFrame>::slot()))?;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await??;
        match event.payload {
            EventPayload::LinkState { from, to, .. } => {
                assert_eq!(from, ConnectionState::Disconnected);
                assert_eq!(to, ConnectionState::Connecting);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        link.stop().await;
        Ok(())
    }
}
