//! etherdwarf - Multi-peer virtual Ethernet tunnel
//!
//! Bridges a local TAP device to remote instances of itself over TLS (or
//! plain TCP) sessions. Peers are defined statically in a peers file by
//! IPv4 address, pre-shared key and MAC address.
//!
//! # Architecture
//!
//! - `peers`: the frozen peer table
//! - `auth`: in-band pre-shared key check on a fresh channel
//! - `network`: listen-mode acceptor, dial loop, channel variants, wire codec
//! - `session`: established sessions, at most one per peer
//! - `router`: device to session and session to device frame relay
//! - `liveness`: keepalive pings and dead-peer detection
//! - `tunnel`: owns the tasks above and the shutdown sequence

pub mod auth;
pub mod config;
pub mod device;
pub mod error;
pub mod hooks;
pub mod liveness;
pub mod network;
pub mod peers;
pub mod router;
pub mod session;
pub mod tunnel;

pub use config::TunnelConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Mode, TunnelConfig};
    pub use crate::device::{FrameDevice, MemoryDevice};
    pub use crate::error::{Error, Result};
    pub use crate::network::{Acceptor, ChannelFactory, Dialer};
    pub use crate::peers::{MacAddr, PeerDefinition, PeerRegistry};
    pub use crate::session::{Session, SessionTable};
    pub use crate::tunnel::{Endpoint, Tunnel};
}
