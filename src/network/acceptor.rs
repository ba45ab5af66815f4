//! Connection Acceptor
//!
//! Listen-mode accept loop. Each connection gets its own task which runs the
//! channel handshake and peer authentication under a deadline, then keeps the
//! session's receive loop. A semaphore caps the number of connections alive
//! at once; a permit is released when the connection's task ends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::channel::ChannelFactory;
use super::ConnectionObserver;
use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::session::Direction;

/// Bound listening socket plus the accept policy
pub struct Acceptor {
    listener: TcpListener,
    channels: ChannelFactory,
    limit: Arc<Semaphore>,
    handshake_timeout: Duration,
}

impl Acceptor {
    /// Bind the listening socket. `*` binds every local address.
    pub async fn bind(config: &TunnelConfig, channels: ChannelFactory) -> Result<Self> {
        let network = &config.network;
        let host = match network.address.as_str() {
            "*" if network.ipv4_only => "0.0.0.0",
            "*" => "::",
            host => host,
        };
        let address = format!("{}:{}", host, network.port);
        let bind_error = |reason: String| Error::Bind {
            address: address.clone(),
            reason,
        };

        let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, network.port))
            .await
            .map_err(|e| bind_error(e.to_string()))?
            .filter(|addr| !network.ipv4_only || addr.is_ipv4())
            .collect();
        let target = candidates
            .first()
            .copied()
            .ok_or_else(|| bind_error("no usable local address".into()))?;

        let listener = TcpListener::bind(target).await.map_err(|e| bind_error(e.to_string()))?;
        tracing::info!(
            "Listening on {}://{} (max {} connections)",
            channels.scheme(),
            listener.local_addr()?,
            network.max_connections
        );

        Ok(Self {
            listener,
            channels,
            limit: Arc::new(Semaphore::new(network.max_connections)),
            handshake_timeout: config.handshake_timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown, then wait for every connection
    /// task to finish
    pub async fn run<O: ConnectionObserver>(self, observer: Arc<O>, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
            };

            let (stream, remote) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // A failed accept never stops the loop
                        tracing::warn!("Accept error: {}", e);
                        continue;
                    }
                },
            };
            tracing::debug!("Connection from {}", remote);

            let channels = self.channels.clone();
            let observer = Arc::clone(&observer);
            let shutdown = shutdown.clone();
            let deadline = self.handshake_timeout;
            tasks.spawn(async move {
                let _permit = permit;
                let setup = async {
                    let channel = channels.accept(stream).await?;
                    observer.on_connect(channel, remote, Direction::Inbound).await
                };
                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    outcome = tokio::time::timeout(deadline, setup) => outcome,
                };
                match outcome {
                    Ok(Ok(established)) => observer.on_established(established).await,
                    Ok(Err(e)) => observer.on_init_failed(&remote.to_string(), &e),
                    Err(_) => observer.on_timeout(&remote.to_string()),
                }
            });
        }

        tracing::info!("Acceptor stopped, waiting for {} connection(s)", tasks.len());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!("Connection task failed: {}", e);
            }
        }
        Ok(())
    }
}
