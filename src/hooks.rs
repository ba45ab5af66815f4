//! Up/down scripts
//!
//! Runs the configured script when a peer's session becomes established or
//! goes away. Scripts are invoked as
//! `<script> <interface> <peer-ip> <inbound|outbound>` with the same values
//! also exported in the environment. A failing script is logged, never fatal.
//! Runs for the same peer execute one after another, in the order they were
//! requested.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::ScriptsConfig;
use crate::session::Session;

/// Which transition triggered a script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Up,
    Down,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::Up => "up",
            HookEvent::Down => "down",
        }
    }
}

/// Spawns hook scripts for session transitions
#[derive(Debug)]
pub struct HookRunner {
    interface: String,
    up: Option<PathBuf>,
    down: Option<PathBuf>,
    /// Completion of the most recently queued run, per peer
    last_run: Mutex<HashMap<Ipv4Addr, oneshot::Receiver<()>>>,
}

impl HookRunner {
    pub fn new(interface: &str, scripts: &ScriptsConfig) -> Self {
        Self {
            interface: interface.to_string(),
            up: scripts.up.clone(),
            down: scripts.down.clone(),
            last_run: Mutex::new(HashMap::new()),
        }
    }

    /// Run the up script for a newly established session
    pub fn session_up(&self, session: &Session) -> Option<JoinHandle<()>> {
        self.fire(HookEvent::Up, session)
    }

    /// Run the down script for a session that ended without being replaced
    pub fn session_down(&self, session: &Session) -> Option<JoinHandle<()>> {
        self.fire(HookEvent::Down, session)
    }

    fn fire(&self, event: HookEvent, session: &Session) -> Option<JoinHandle<()>> {
        let script = match event {
            HookEvent::Up => self.up.clone(),
            HookEvent::Down => self.down.clone(),
        }?;

        let mut command = Command::new(&script);
        command
            .arg(&self.interface)
            .arg(session.address().to_string())
            .arg(session.direction().as_str())
            .env("ETHERDWARF_INTERFACE", &self.interface)
            .env("ETHERDWARF_PEER_IP", session.address().to_string())
            .env("ETHERDWARF_PEER_MAC", session.peer().mac.to_string())
            .env("ETHERDWARF_EVENT", event.as_str())
            .kill_on_drop(false);

        let peer = session.address();
        let (done, finished) = oneshot::channel();
        let previous = self
            .last_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, finished);

        Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            match command.status().await {
                Ok(status) if status.success() => {
                    tracing::debug!("{} script {} for {} finished", event.as_str(), script.display(), peer);
                }
                Ok(status) => {
                    tracing::warn!("{} script {} for {} exited with {}", event.as_str(), script.display(), peer, status);
                }
                Err(e) => {
                    tracing::warn!("Failed to run {} script {} for {}: {}", event.as_str(), script.display(), peer, e);
                }
            }
            let _ = done.send(());
        }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::testing::{peer, session_pair};
    use crate::session::Direction;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &std::path::Path, name: &str, out: &std::path::Path) -> PathBuf {
        let path = dir.join(name);
        let body = format!(
            "#!/bin/sh\necho \"$1 $2 $3 $ETHERDWARF_EVENT $ETHERDWARF_PEER_MAC\" >> {}\n",
            out.display()
        );
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_scripts_receive_session_details() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("events.log");
        let scripts = ScriptsConfig {
            up: Some(script(dir.path(), "up.sh", &out)),
            down: Some(script(dir.path(), "down.sh", &out)),
        };
        let hooks = HookRunner::new("utap0", &scripts);
        let (session, _stream, _far) = session_pair(peer("10.0.0.2:psk2:AA:BB:CC:DD:EE:02"), Direction::Outbound);

        hooks.session_up(&session).unwrap().await.unwrap();
        hooks.session_down(&session).unwrap().await.unwrap();

        let log = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<_> = log.lines().collect();
        assert_eq!(
            lines,
            vec![
                "utap0 10.0.0.2 outbound up AA:BB:CC:DD:EE:02",
                "utap0 10.0.0.2 outbound down AA:BB:CC:DD:EE:02",
            ]
        );
    }

    #[tokio::test]
    async fn test_runs_for_one_peer_keep_their_order() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("events.log");
        let slow_up = dir.path().join("up.sh");
        std::fs::write(&slow_up, format!("#!/bin/sh\nsleep 0.3\necho up >> {}\n", out.display())).unwrap();
        std::fs::set_permissions(&slow_up, std::fs::Permissions::from_mode(0o755)).unwrap();
        let scripts = ScriptsConfig {
            up: Some(slow_up),
            down: Some(script(dir.path(), "down.sh", &out)),
        };
        let hooks = HookRunner::new("utap0", &scripts);
        let (session, _stream, _far) = session_pair(peer("10.0.0.2:psk2:AA:BB:CC:DD:EE:02"), Direction::Inbound);

        let up = hooks.session_up(&session).unwrap();
        let down = hooks.session_down(&session).unwrap();
        down.await.unwrap();
        up.await.unwrap();

        let log = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<_> = log.lines().collect();
        assert_eq!(lines, vec!["up", "utap0 10.0.0.2 inbound down AA:BB:CC:DD:EE:02"]);
    }

    #[tokio::test]
    async fn test_missing_scripts_are_skipped() {
        let hooks = HookRunner::new("utap0", &ScriptsConfig::default());
        let (session, _stream, _far) = session_pair(peer("10.0.0.2:psk2:AA:BB:CC:DD:EE:02"), Direction::Inbound);
        assert!(hooks.session_up(&session).is_none());
        assert!(hooks.session_down(&session).is_none());
    }

    #[tokio::test]
    async fn test_failing_script_is_not_fatal() {
        let hooks = HookRunner::new(
            "utap0",
            &ScriptsConfig { up: Some(PathBuf::from("/nonexistent/up.sh")), down: None },
        );
        let (session, _stream, _far) = session_pair(peer("10.0.0.2:psk2:AA:BB:CC:DD:EE:02"), Direction::Inbound);
        hooks.session_up(&session).unwrap().await.unwrap();
    }
}
