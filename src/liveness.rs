//! Liveness Monitor
//!
//! On every tick each established session is sent a ping. A session whose
//! ping cannot be sent within one interval, or from which nothing has been
//! received for `missed_intervals` intervals, is closed and removed. Closing
//! wakes the session's receive loop, which in dial mode hands control back to
//! the dial loop for an immediate reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::network::codec::Message;
use crate::session::{Session, SessionTable};

/// Result of one liveness pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub pinged: usize,
    pub timed_out: usize,
    pub failed: usize,
}

/// Periodic keepalive and dead-peer detection
#[derive(Debug)]
pub struct LivenessMonitor {
    sessions: Arc<SessionTable>,
    interval: Duration,
    inactivity_timeout: Duration,
    seq: AtomicU64,
}

impl LivenessMonitor {
    /// `interval` must be non-zero; a zero interval means the monitor is
    /// not started at all
    pub fn new(sessions: Arc<SessionTable>, interval: Duration, missed_intervals: u32) -> Self {
        Self {
            sessions,
            interval,
            inactivity_timeout: interval * missed_intervals.max(1),
            seq: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    /// Tick until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            "Liveness monitor started (ping every {:?}, timeout after {:?})",
            self.interval,
            self.inactivity_timeout
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.timed_out > 0 || report.failed > 0 {
                        tracing::debug!("Liveness pass: {:?}", report);
                    }
                }
            }
        }
        tracing::info!("Liveness monitor stopped");
    }

    /// One pass over the established sessions
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut live = Vec::new();

        for session in self.sessions.snapshot() {
            if !session.is_established() {
                continue;
            }
            let idle = session.idle_for();
            if idle >= self.inactivity_timeout {
                tracing::warn!(
                    "Peer {} silent for {:?}, closing session {}",
                    session.address(),
                    idle,
                    session.id()
                );
                self.drop_session(&session);
                report.timed_out += 1;
            } else {
                live.push(session);
            }
        }

        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let pings = live.iter().map(|session| {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            async move {
                let sent = tokio::time::timeout(self.interval, session.send(Message::Ping { seq, timestamp_ms })).await;
                (session, sent)
            }
        });

        for (session, sent) in join_all(pings).await {
            match sent {
                Ok(Ok(())) => report.pinged += 1,
                Ok(Err(e)) => {
                    tracing::warn!("Ping to {} failed: {}", session.address(), e);
                    self.drop_session(session);
                    report.failed += 1;
                }
                Err(_) => {
                    tracing::warn!("Ping to {} did not complete within {:?}", session.address(), self.interval);
                    self.drop_session(session);
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn drop_session(&self, session: &Session) {
        session.close();
        self.sessions.remove(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{peer, session_pair};
    use crate::session::Direction;
    use futures::StreamExt;

    const PEER: &str = "10.0.0.2:psk2:AA:BB:CC:DD:EE:02";

    #[tokio::test]
    async fn test_tick_pings_established_sessions() {
        let sessions = Arc::new(SessionTable::new());
        let (session, _stream, mut far) = session_pair(peer(PEER), Direction::Inbound);
        sessions.insert(Arc::clone(&session));

        let monitor = LivenessMonitor::new(Arc::clone(&sessions), Duration::from_secs(1), 3);
        assert_eq!(monitor.inactivity_timeout(), Duration::from_secs(3));

        let report = monitor.tick().await;
        assert_eq!(report, TickReport { pinged: 1, timed_out: 0, failed: 0 });
        assert!(matches!(far.next().await, Some(Ok(Message::Ping { seq: 0, .. }))));
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_silent_peer_is_closed() {
        let sessions = Arc::new(SessionTable::new());
        let (session, _stream, _far) = session_pair(peer(PEER), Direction::Outbound);
        sessions.insert(Arc::clone(&session));

        let monitor = LivenessMonitor::new(Arc::clone(&sessions), Duration::from_millis(10), 3);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = monitor.tick().await;
        assert_eq!(report.timed_out, 1);
        assert!(session.is_closed());
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_broken_channel_is_removed() {
        let sessions = Arc::new(SessionTable::new());
        let (session, stream, far) = session_pair(peer(PEER), Direction::Inbound);
        sessions.insert(Arc::clone(&session));
        drop(far);
        drop(stream);

        let monitor = LivenessMonitor::new(Arc::clone(&sessions), Duration::from_secs(5), 3);
        let report = monitor.tick().await;
        assert_eq!(report.failed, 1);
        assert!(session.is_closed());
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let sessions = Arc::new(SessionTable::new());
        let monitor = LivenessMonitor::new(sessions, Duration::from_millis(10), 3);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(monitor.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
