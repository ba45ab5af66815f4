//! Tunnel
//!
//! Wires the registry, authenticator, session table, router, liveness
//! monitor and hook scripts together and owns every background task.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::config::TunnelConfig;
use crate::device::FrameDevice;
use crate::error::{Error, Result};
use crate::hooks::HookRunner;
use crate::liveness::LivenessMonitor;
use crate::network::{Acceptor, Channel, ConnectionObserver, Dialer, Established, TunnelCodec};
use crate::peers::PeerRegistry;
use crate::router::FrameRouter;
use crate::session::{Direction, Session, SessionTable};

/// Bound on how long shutdown waits for background tasks
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Where sessions come from
pub enum Endpoint {
    Listen(Acceptor),
    Dial(Dialer),
}

/// A running tunnel instance
pub struct Tunnel {
    config: Arc<TunnelConfig>,
    registry: Arc<PeerRegistry>,
    authenticator: Authenticator,
    sessions: Arc<SessionTable>,
    router: Arc<FrameRouter>,
    hooks: HookRunner,
    /// Peers whose up script has run with no down script since; held while
    /// a hook decision is taken against the session table
    peers_up: Mutex<HashSet<Ipv4Addr>>,
    shutdown: CancellationToken,
}

impl Tunnel {
    pub fn new(config: Arc<TunnelConfig>, registry: Arc<PeerRegistry>, device: Arc<dyn FrameDevice>) -> Arc<Self> {
        let sessions = Arc::new(SessionTable::new());
        let hooks = HookRunner::new(device.name(), &config.scripts);
        let router = Arc::new(FrameRouter::new(Arc::clone(&registry), Arc::clone(&sessions), device));
        Arc::new(Self {
            authenticator: Authenticator::new(Arc::clone(&registry)),
            config,
            registry,
            sessions,
            router,
            hooks,
            peers_up: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Cancelling this token stops the tunnel
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token is cancelled, the device fails or the
    /// endpoint gives up
    pub async fn run(self: Arc<Self>, endpoint: Endpoint) -> Result<()> {
        let local = self.registry.local();
        tracing::info!(
            "Tunnel up on {} as {} ({} remote peer(s))",
            self.router.device().name(),
            local.cidr(),
            self.registry.len() - 1
        );

        let (mut reader, dispatcher) = self.router.spawn(self.shutdown.clone());

        let liveness = self.config.ping_interval().map(|interval| {
            let monitor = LivenessMonitor::new(Arc::clone(&self.sessions), interval, self.config.liveness.missed_intervals);
            tokio::spawn(monitor.run(self.shutdown.clone()))
        });
        if liveness.is_none() {
            tracing::info!("Liveness monitor disabled");
        }

        let mut endpoint_task: JoinHandle<Result<()>> = match endpoint {
            Endpoint::Listen(acceptor) => tokio::spawn(acceptor.run(Arc::clone(&self), self.shutdown.clone())),
            Endpoint::Dial(dialer) => tokio::spawn(dialer.run(Arc::clone(&self), self.shutdown.clone())),
        };

        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => Ok(()),
            read = &mut reader => match read {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(Error::Device(format!("device reader panicked: {}", e))),
            },
            stopped = &mut endpoint_task => match stopped {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, format!("endpoint task failed: {}", e)))),
            },
        };

        self.shutdown_sessions().await;

        let mut tasks: Vec<JoinHandle<()>> = vec![dispatcher];
        tasks.extend(liveness);
        let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
            if !endpoint_task.is_finished() {
                match endpoint_task.await {
                    Ok(Err(e)) => tracing::warn!("Endpoint stopped with error: {}", e),
                    Err(e) => tracing::error!("Endpoint task failed: {}", e),
                    Ok(Ok(())) => {}
                }
            }
            for task in tasks {
                let _ = task.await;
            }
            if !reader.is_finished() {
                let _ = reader.await;
            }
        })
        .await;
        if joined.is_err() {
            tracing::warn!("Background tasks did not stop within {:?}", SHUTDOWN_GRACE);
        }

        tracing::info!("Tunnel stopped");
        outcome
    }

    /// Stop all loops, say goodbye to every peer and close all sessions
    async fn shutdown_sessions(&self) {
        self.shutdown.cancel();
        let sessions = self.sessions.snapshot();
        if !sessions.is_empty() {
            tracing::info!("Closing {} session(s)", sessions.len());
        }
        join_all(sessions.iter().map(|session| session.say_goodbye())).await;
        self.sessions.close_all();
    }

    fn register(&self, session: &Arc<Session>) {
        let mut peers_up = self.peers_up.lock().unwrap_or_else(PoisonError::into_inner);
        match self.sessions.insert(Arc::clone(session)) {
            Some(previous) => {
                tracing::info!(
                    "Peer {} reconnected ({}), session {} supersedes {}",
                    session.address(),
                    session.direction(),
                    session.id(),
                    previous.id()
                );
            }
            None => {
                tracing::info!(
                    "Peer {} established ({} from {})",
                    session.address(),
                    session.direction(),
                    session.remote()
                );
            }
        }
        if peers_up.insert(session.address()) {
            self.hooks.session_up(session);
        }
    }

    /// Run the down script if `session` was the last one for its peer
    fn release(&self, session: &Session) {
        let mut peers_up = self.peers_up.lock().unwrap_or_else(PoisonError::into_inner);
        if session.was_replaced() || self.sessions.get(&session.address()).is_some() {
            return;
        }
        if peers_up.remove(&session.address()) {
            tracing::info!("Peer {} is down", session.address());
            self.hooks.session_down(session);
        }
    }
}

#[async_trait]
impl ConnectionObserver for Tunnel {
    async fn on_connect(&self, channel: Channel, remote: SocketAddr, direction: Direction) -> Result<Established> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let mut transport = Framed::new(channel, TunnelCodec);
        let peer = self.authenticator.authenticate(&mut transport).await?;
        let (session, stream) = Session::establish(transport, peer, direction, remote);
        self.register(&session);
        Ok(Established { session, stream })
    }

    async fn on_established(&self, established: Established) {
        let Established { session, stream } = established;
        if self.shutdown.is_cancelled() {
            session.close();
        }

        let outcome = self.router.receive(&session, stream).await;
        let lasted = session.connected_for().num_seconds();
        match outcome {
            Ok(()) => tracing::info!("Session {} with {} closed after {}s", session.id(), session.address(), lasted),
            Err(e) => tracing::warn!(
                "Session {} with {} failed after {}s: {}",
                session.id(),
                session.address(),
                lasted,
                e
            ),
        }

        self.sessions.remove(&session);
        self.release(&session);
        session.finish().await;
    }

    fn on_init_failed(&self, remote: &str, error: &Error) {
        match error {
            Error::ShuttingDown => tracing::debug!("Dropping connection from {} during shutdown", remote),
            Error::Authentication(_) => tracing::warn!("Rejected peer at {}: {}", remote, error),
            _ => tracing::warn!("Connection with {} failed: {}", remote, error),
        }
    }

    fn on_timeout(&self, remote: &str) {
        tracing::warn!("Connection with {} timed out during setup", remote);
    }
}
