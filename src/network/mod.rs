//! Network Module
//!
//! Listening and dialing, the channel variants and the wire codec.

pub mod acceptor;
pub mod channel;
pub mod codec;
pub mod dialer;

pub use acceptor::Acceptor;
pub use channel::{Channel, ChannelFactory};
pub use codec::{Message, TunnelCodec};
pub use dialer::Dialer;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::session::{Direction, Session, SessionStream};

/// An authenticated, registered session and the read half of its channel
pub struct Established {
    pub session: Arc<Session>,
    pub stream: SessionStream,
}

/// Receives connection lifecycle events from the acceptor and the dialer
#[async_trait]
pub trait ConnectionObserver: Send + Sync + 'static {
    /// A channel finished its transport handshake: authenticate the peer and
    /// register the session
    async fn on_connect(&self, channel: Channel, remote: SocketAddr, direction: Direction) -> Result<Established>;

    /// Drive an established session until it ends
    async fn on_established(&self, established: Established);

    /// Transport setup or authentication failed
    fn on_init_failed(&self, remote: &str, error: &Error);

    /// Connect, handshake or authentication did not finish in time
    fn on_timeout(&self, remote: &str);
}
