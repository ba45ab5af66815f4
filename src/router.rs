//! Frame Router
//!
//! Moves Ethernet frames between the local device and the established
//! sessions.
//!
//! Device to network: one blocking reader thread pulls frames off the device
//! and hands them to a single dispatcher task, which picks the destination
//! peer from the IPv4 address the frame is addressed to (IPv4 destination or
//! ARP target) and writes the frame to that peer's session. Frames for the
//! same peer leave in the order they were read.
//!
//! Network to device: every session runs `receive`, which writes the peer's
//! frames to the device. Device writes are serialized by one lock.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::{self, FrameDevice};
use crate::error::{Error, Result};
use crate::network::codec::Message;
use crate::peers::PeerRegistry;
use crate::session::{Session, SessionStream, SessionTable};

/// How long one device read may block before the shutdown signal is checked
const DEVICE_POLL: Duration = Duration::from_millis(250);

/// Frames buffered between the device reader and the dispatcher
const DISPATCH_QUEUE: usize = 1024;

/// Largest frame read from the device
const MAX_FRAME: usize = 65535;

/// What happened to a frame read from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Written to the peer's session
    Sent(Ipv4Addr),
    /// Not addressed to a registered remote peer
    NoRoute,
    /// The peer has no established session
    NoSession(Ipv4Addr),
    /// The session failed while sending and was torn down
    SendFailed(Ipv4Addr),
}

/// Bridge between the device and the session table
pub struct FrameRouter {
    registry: Arc<PeerRegistry>,
    sessions: Arc<SessionTable>,
    device: Arc<dyn FrameDevice>,
    write_lock: Mutex<()>,
}

impl FrameRouter {
    pub fn new(registry: Arc<PeerRegistry>, sessions: Arc<SessionTable>, device: Arc<dyn FrameDevice>) -> Self {
        Self {
            registry,
            sessions,
            device,
            write_lock: Mutex::new(()),
        }
    }

    pub fn device(&self) -> &Arc<dyn FrameDevice> {
        &self.device
    }

    /// Route one frame read from the device
    pub async fn dispatch(&self, frame: Bytes) -> DispatchOutcome {
        let Some(destination) = device::destination_ipv4(&frame) else {
            tracing::trace!("Dropping {} byte frame without an IPv4 destination", frame.len());
            return DispatchOutcome::NoRoute;
        };
        if self.registry.remote(&destination).is_none() {
            tracing::trace!("Dropping frame for {}: not a registered peer", destination);
            return DispatchOutcome::NoRoute;
        }
        let Some(session) = self.sessions.get(&destination) else {
            tracing::debug!("Dropping frame for {}: no established session", destination);
            return DispatchOutcome::NoSession(destination);
        };

        match session.send(Message::Frame(frame)).await {
            Ok(()) => DispatchOutcome::Sent(destination),
            Err(e) => {
                tracing::warn!("Failed to send frame to {}: {}", destination, e);
                session.close();
                self.sessions.remove(&session);
                DispatchOutcome::SendFailed(destination)
            }
        }
    }

    /// Dispatch frames from the reader until shutdown or the reader stops
    pub async fn run_dispatcher(self: Arc<Self>, mut frames: mpsc::Receiver<Bytes>, shutdown: CancellationToken) {
        tracing::debug!("Frame dispatcher started");
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            self.dispatch(frame).await;
        }
        tracing::debug!("Frame dispatcher stopped");
    }

    /// Start the device reader thread and the dispatcher task.
    ///
    /// The reader handle resolves with an error if the device fails.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> (JoinHandle<Result<()>>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(DISPATCH_QUEUE);
        let reader = spawn_device_reader(Arc::clone(&self.device), tx, shutdown.clone());
        let dispatcher = tokio::spawn(Arc::clone(self).run_dispatcher(rx, shutdown));
        (reader, dispatcher)
    }

    /// Relay a session's inbound messages to the device until the session
    /// closes, the peer says goodbye or the channel fails
    pub async fn receive(&self, session: &Session, mut stream: SessionStream) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = session.closed() => return Ok(()),
                next = stream.next() => next,
            };

            match next {
                None => return Err(Error::SessionClosed),
                Some(Err(e)) => return Err(e),
                Some(Ok(Message::Frame(frame))) => {
                    session.record_inbound(Some(frame.len()));
                    self.deliver(session, &frame);
                }
                Some(Ok(Message::Ping { seq, .. })) => {
                    session.record_inbound(None);
                    tracing::trace!("Ping {} from {}", seq, session.address());
                }
                Some(Ok(Message::Goodbye)) => {
                    tracing::info!("Peer {} closed the session", session.address());
                    return Ok(());
                }
                Some(Ok(other)) => {
                    return Err(Error::Protocol(format!(
                        "unexpected {} from established peer {}",
                        other.type_name(),
                        session.address()
                    )));
                }
            }
        }
    }

    /// Write a frame received from `session` to the device
    fn deliver(&self, session: &Session, frame: &[u8]) -> bool {
        let source = device::source_mac(frame);
        if source != Some(session.peer().mac) {
            tracing::debug!(
                "Dropping frame from {}: source {:?} is not the registered {}",
                session.address(),
                source,
                session.peer().mac
            );
            return false;
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.device.write_frame(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to write frame from {} to {}: {}", session.address(), self.device.name(), e);
                false
            }
        }
    }
}

/// Blocking device read loop feeding the dispatcher
fn spawn_device_reader(
    device: Arc<dyn FrameDevice>,
    frames: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::task::spawn_blocking(move || {
        tracing::debug!("Device reader started on {}", device.name());
        let mut buf = vec![0u8; MAX_FRAME];
        while !shutdown.is_cancelled() {
            match device.read_frame(&mut buf, DEVICE_POLL) {
                Ok(0) => continue,
                Ok(len) => {
                    if frames.blocking_send(Bytes::copy_from_slice(&buf[..len])).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Reading from {} failed: {}", device.name(), e);
                    return Err(Error::Device(format!("read from {} failed: {}", device.name(), e)));
                }
            }
        }
        tracing::debug!("Device reader stopped");
        Ok(())
    })
}
