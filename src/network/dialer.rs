//! Dial loop
//!
//! Keeps one outbound session to the configured peer alive for the lifetime
//! of the process. After an established session ends the peer is redialed
//! at once; after a failed attempt the loop sleeps `retry_delay` first.
//! Failures that no retry can fix, such as an unusable TLS server name, end
//! the loop with that error.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::channel::ChannelFactory;
use super::{ConnectionObserver, Established};
use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::session::Direction;

/// Outbound connection policy
pub struct Dialer {
    host: String,
    port: u16,
    ipv4_only: bool,
    channels: ChannelFactory,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    retry_delay: Duration,
}

impl Dialer {
    pub fn new(config: &TunnelConfig, channels: ChannelFactory) -> Self {
        Self {
            host: config.network.address.clone(),
            port: config.network.port,
            ipv4_only: config.network.ipv4_only,
            channels,
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            retry_delay: config.retry_delay(),
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Dial until shutdown
    pub async fn run<O: ConnectionObserver>(self, observer: Arc<O>, shutdown: CancellationToken) -> Result<()> {
        let target = self.target();
        tracing::info!("Dialing {}://{}", self.channels.scheme(), target);

        loop {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => break,
                attempt = self.attempt(observer.as_ref()) => attempt,
            };

            match attempt {
                Ok(established) => {
                    let peer = established.session.address();
                    observer.on_established(established).await;
                    if shutdown.is_cancelled() {
                        break;
                    }
                    tracing::info!("Session with {} ended, reconnecting to {}", peer, target);
                    continue;
                }
                Err(Error::ShuttingDown) => break,
                Err(Error::ConnectionTimeout(_)) | Err(Error::HandshakeTimeout(_)) => observer.on_timeout(&target),
                Err(e) if !e.is_retryable() => {
                    observer.on_init_failed(&target, &e);
                    tracing::error!("Giving up on {}: {}", target, e);
                    return Err(e);
                }
                Err(e) => observer.on_init_failed(&target, &e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        tracing::info!("Dialer stopped");
        Ok(())
    }

    /// One connect + handshake + authentication attempt
    async fn attempt<O: ConnectionObserver>(&self, observer: &O) -> Result<Established> {
        let stream = self.connect().await?;
        let remote = stream.peer_addr()?;

        let setup = async {
            let channel = self.channels.connect(stream, &self.host).await?;
            observer.on_connect(channel, remote, Direction::Outbound).await
        };
        tokio::time::timeout(self.handshake_timeout, setup)
            .await
            .map_err(|_| Error::HandshakeTimeout(remote.to_string()))?
    }

    async fn connect(&self) -> Result<TcpStream> {
        let target = self.target();
        let failed = |reason: String| Error::ConnectionFailed {
            address: target.clone(),
            reason,
        };

        let addresses: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| failed(e.to_string()))?
            .filter(|addr| !self.ipv4_only || addr.is_ipv4())
            .collect();
        if addresses.is_empty() {
            return Err(failed("no usable address".into()));
        }

        let mut last_error = None;
        for address in addresses {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_error = Some(failed(e.to_string())),
                Err(_) => last_error = Some(Error::ConnectionTimeout(address.to_string())),
            }
        }
        Err(last_error.unwrap_or_else(|| failed("no usable address".into())))
    }
}
