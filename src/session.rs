//! Sessions and the Session Table
//!
//! A `Session` is one authenticated channel to one peer. The `SessionTable`
//! holds the established sessions, at most one per peer address.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::network::channel::Channel;
use crate::network::codec::{Message, TunnelCodec};
use crate::peers::PeerDefinition;

/// Framed channel carrying tunnel messages
pub type Transport = Framed<Channel, TunnelCodec>;

/// Write half of a session's channel
pub type SessionSink = SplitSink<Transport, Message>;

/// Read half of a session's channel, owned by the receive loop
pub type SessionStream = SplitStream<Transport>;

/// How long closing the write half may take before the channel is dropped
const FINISH_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Transport being set up
    Connecting = 0,
    /// Identity exchange in progress, not yet registered
    Authenticating = 1,
    /// Registered and relaying frames
    Established = 2,
    /// Teardown started
    Closing = 3,
    /// Channel released
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Authenticating,
            2 => SessionState::Established,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::Authenticating => write!(f, "AUTHENTICATING"),
            SessionState::Established => write!(f, "ESTABLISHED"),
            SessionState::Closing => write!(f, "CLOSING"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic counters for one session
#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

/// One live channel bound to an authenticated peer
pub struct Session {
    id: u64,
    peer: Arc<PeerDefinition>,
    direction: Direction,
    remote: SocketAddr,
    established_at: chrono::DateTime<chrono::Utc>,
    state: AtomicU8,
    /// Reference point for the millisecond timestamps below
    origin: Instant,
    last_received_ms: AtomicU64,
    replaced: AtomicBool,
    closed: CancellationToken,
    sink: Mutex<SessionSink>,
    stats: SessionStats,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer.address)
            .field("direction", &self.direction)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Wrap an authenticated channel. The session stays `Authenticating`
    /// until it is inserted into a `SessionTable`.
    pub fn establish(
        transport: Transport,
        peer: Arc<PeerDefinition>,
        direction: Direction,
        remote: SocketAddr,
    ) -> (Arc<Self>, SessionStream) {
        let (sink, stream): (SessionSink, SessionStream) = transport.split();
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            direction,
            remote,
            established_at: chrono::Utc::now(),
            state: AtomicU8::new(SessionState::Authenticating as u8),
            origin: Instant::now(),
            last_received_ms: AtomicU64::new(0),
            replaced: AtomicBool::new(false),
            closed: CancellationToken::new(),
            sink: Mutex::new(sink),
            stats: SessionStats::default(),
        });
        (session, stream)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &Arc<PeerDefinition> {
        &self.peer
    }

    pub fn address(&self) -> Ipv4Addr {
        self.peer.address
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    /// True once a newer session for the same peer displaced this one
    pub fn was_replaced(&self) -> bool {
        self.replaced.load(Ordering::Acquire)
    }

    fn mark_established(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Authenticating as u8,
            SessionState::Established as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Start teardown: wakes the receive loop and fails pending sends.
    /// Idempotent.
    pub fn close(&self) {
        let previous = self.state.fetch_max(SessionState::Closing as u8, Ordering::AcqRel);
        if previous < SessionState::Closing as u8 {
            tracing::debug!("Closing session {} with {}", self.id, self.peer.address);
        }
        self.closed.cancel();
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send one message, giving up as soon as the session is closed
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let outbound = match &message {
            Message::Frame(frame) => Some(frame.len() as u64),
            _ => None,
        };

        let mut sink = self.sink.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::SessionClosed),
            result = sink.send(message) => {
                result?;
                if let Some(len) = outbound {
                    self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_out.fetch_add(len, Ordering::Relaxed);
                }
                Ok(())
            }
        }
    }

    /// Tell the peer we are leaving, then close
    pub async fn say_goodbye(&self) {
        if let Err(e) = tokio::time::timeout(FINISH_TIMEOUT, self.send(Message::Goodbye)).await {
            tracing::debug!("Goodbye to {} timed out: {}", self.peer.address, e);
        }
        self.close();
    }

    /// Close the write half of the channel and mark the session closed.
    /// Called by the receive loop owner once it has stopped reading.
    pub async fn finish(&self) {
        self.close();
        let _ = tokio::time::timeout(FINISH_TIMEOUT, async {
            let mut sink = self.sink.lock().await;
            let _ = sink.close().await;
        })
        .await;
        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }

    /// Record inbound traffic; `len` is the frame size, `None` for control messages
    pub fn record_inbound(&self, len: Option<usize>) {
        let now = self.elapsed_ms();
        self.last_received_ms.store(now, Ordering::Relaxed);
        if let Some(len) = len {
            self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
        }
    }

    /// Time since anything was received from the peer
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_received_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }

    /// Wall-clock time since authentication completed
    pub fn connected_for(&self) -> chrono::Duration {
        chrono::Utc::now().signed_duration_since(self.established_at)
    }

    fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Established sessions keyed by peer address
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<Ipv4Addr, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` as the established session for its peer.
    ///
    /// Any prior session for the same peer is marked replaced and closed
    /// while the lock is held, so no reader can pick it up afterwards.
    /// Returns the displaced session.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        session.mark_established();
        let previous = sessions.insert(session.address(), Arc::clone(&session));
        if let Some(previous) = &previous {
            previous.replaced.store(true, Ordering::Release);
            previous.close();
            tracing::info!(
                "Session {} with {} replaced by session {}",
                previous.id,
                session.address(),
                session.id
            );
        }
        previous
    }

    /// Established session for `address`, if any
    pub fn get(&self, address: &Ipv4Addr) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(address)
            .filter(|session| session.is_established())
            .cloned()
    }

    /// Remove `session` if it is still the registered one for its peer
    pub fn remove(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(&session.address()) {
            Some(current) if current.id == session.id => {
                sessions.remove(&session.address());
                true
            }
            _ => false,
        }
    }

    /// All registered sessions
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.values().cloned().collect()
    }

    /// Empty the table, closing every session; returns what was removed
    pub fn close_all(&self) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let drained: Vec<_> = sessions.drain().map(|(_, session)| session).collect();
        for session in &drained {
            session.close();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A session over an in-memory duplex pipe, plus the far end of the pipe
    pub fn session_pair(peer: Arc<PeerDefinition>, direction: Direction) -> (Arc<Session>, SessionStream, Transport) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let near: Channel = Box::new(near);
        let far: Channel = Box::new(far);
        let remote: SocketAddr = "127.0.0.1:9443".parse().unwrap();
        let (session, stream) = Session::establish(Framed::new(near, TunnelCodec), peer, direction, remote);
        (session, stream, Framed::new(far, TunnelCodec))
    }

    pub fn peer(line: &str) -> Arc<PeerDefinition> {
        Arc::new(PeerDefinition::parse_line(line, crate::peers::HOST_PREFIX).unwrap())
    }
}
