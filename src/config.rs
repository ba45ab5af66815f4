//! etherdwarf Configuration
//!
//! This module provides the configuration structures for a tunnel instance.
//! The configuration is loaded once, validated, and then shared read-only
//! with every component.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main etherdwarf configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Virtual device configuration
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Listener / dialer configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Keepalive configuration
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Channel encryption configuration
    #[serde(default)]
    pub tls: TlsConfig,

    /// Peer table configuration
    #[serde(default)]
    pub peers: PeersConfig,

    /// Up/down hook scripts
    #[serde(default)]
    pub scripts: ScriptsConfig,

    /// Privilege drop after startup
    #[serde(default)]
    pub privileges: PrivilegesConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Virtual device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// TAP interface name
    #[serde(default = "default_interface")]
    pub name: String,

    /// Keep the interface after the process exits
    #[serde(default = "default_true")]
    pub persistent: bool,

    /// MTU for the TAP interface
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

/// Operating mode of the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Accept many inbound peers
    Listen,
    /// Maintain one outbound connection
    Dial,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Listen => write!(f, "listen"),
            Mode::Dial => write!(f, "dial"),
        }
    }
}

/// Listener / dialer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen or dial
    #[serde(default = "default_mode")]
    pub mode: Mode,

    /// Bind address (listen mode, `*` for any) or target host (dial mode)
    #[serde(default = "default_address")]
    pub address: String,

    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use only IPv4
    #[serde(default = "default_true")]
    pub ipv4_only: bool,

    /// Maximum concurrent connections (listen mode)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Channel handshake + authentication deadline in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// TCP connect deadline in seconds (dial mode)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Delay between failed dial attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Keepalive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Ping every N seconds, 0 to disable
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Close a session after this many intervals without inbound traffic
    #[serde(default = "default_missed_intervals")]
    pub missed_intervals: u32,
}

/// Channel encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Disable to run in plain-text mode
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// X.509 certificate authority (PEM)
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// X.509 private key (PEM)
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// X.509 certificate (PEM)
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    /// Name to verify the listener certificate against (dial mode).
    /// Defaults to `network.address`.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Peer table configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeersConfig {
    /// Path to the peers file (`IP[/prefix]:PSK:MAC` per line, first line is this node)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Hook scripts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptsConfig {
    /// Executed when a peer session comes up
    #[serde(default)]
    pub up: Option<PathBuf>,

    /// Executed when a peer session goes down
    #[serde(default)]
    pub down: Option<PathBuf>,
}

/// Privilege drop configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrivilegesConfig {
    /// Drop privileges to this UID (0 = keep)
    #[serde(default)]
    pub uid: u32,

    /// Drop privileges to this GID (0 = keep)
    #[serde(default)]
    pub gid: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// System log mode: no colours, no timestamps (for journald)
    #[serde(default)]
    pub system: bool,
}

// Default value functions
fn default_interface() -> String {
    "utap0".to_string()
}

fn default_mtu() -> u16 {
    1500
}

fn default_mode() -> Mode {
    Mode::Dial
}

fn default_address() -> String {
    "*".to_string()
}

fn default_port() -> u16 {
    443
}

fn default_max_connections() -> usize {
    1024
}

fn default_handshake_timeout() -> u64 {
    15
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_retry_delay() -> u64 {
    5
}

fn default_ping_interval() -> u64 {
    10
}

fn default_missed_intervals() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_interface(),
            persistent: true,
            mtu: default_mtu(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            address: default_address(),
            port: default_port(),
            ipv4_only: true,
            max_connections: default_max_connections(),
            handshake_timeout_secs: default_handshake_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            missed_intervals: default_missed_intervals(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_file: None,
            key_file: None,
            cert_file: None,
            server_name: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            system: false,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            interface: InterfaceConfig::default(),
            network: NetworkConfig::default(),
            liveness: LivenessConfig::default(),
            tls: TlsConfig::default(),
            peers: PeersConfig::default(),
            scripts: ScriptsConfig::default(),
            privileges: PrivilegesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TunnelConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config = Self::parse(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file without validating it, so command line overrides
    /// can be applied first
    pub fn read(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse a TOML string without validating it
    pub fn parse(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.interface.name.is_empty() || self.interface.name.len() > 15 {
            return Err(crate::Error::Config(
                "interface.name must be 1-15 characters".into(),
            ));
        }

        if !(576..=9000).contains(&self.interface.mtu) {
            return Err(crate::Error::Config("interface.mtu must be within 576..=9000".into()));
        }

        if self.peers.file.is_none() {
            return Err(crate::Error::Config("peers.file must be set".into()));
        }

        if self.network.address.is_empty() {
            return Err(crate::Error::Config("network.address cannot be empty".into()));
        }

        if self.network.mode == Mode::Dial && (self.network.address == "*" || self.network.port == 0) {
            return Err(crate::Error::Config(
                "dial mode requires an explicit network.address and a non-zero network.port".into(),
            ));
        }

        if self.network.max_connections == 0 {
            return Err(crate::Error::Config("network.max_connections must be at least 1".into()));
        }

        if self.network.handshake_timeout_secs == 0 {
            return Err(crate::Error::Config("network.handshake_timeout_secs must be positive".into()));
        }

        if self.liveness.missed_intervals == 0 {
            return Err(crate::Error::Config("liveness.missed_intervals must be at least 1".into()));
        }

        if self.tls.enabled {
            match self.network.mode {
                Mode::Listen => {
                    if self.tls.key_file.is_none() || self.tls.cert_file.is_none() {
                        return Err(crate::Error::Config(
                            "listen mode with TLS requires tls.key_file and tls.cert_file".into(),
                        ));
                    }
                }
                Mode::Dial => {
                    if self.tls.ca_file.is_none() {
                        return Err(crate::Error::Config("dial mode with TLS requires tls.ca_file".into()));
                    }
                    if self.tls.key_file.is_some() != self.tls.cert_file.is_some() {
                        return Err(crate::Error::Config(
                            "a client certificate requires both tls.key_file and tls.cert_file".into(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Path of the peers file
    pub fn peers_file(&self) -> Option<&std::path::Path> {
        self.peers.file.as_deref()
    }

    /// Get ping interval as Duration (None when disabled)
    pub fn ping_interval(&self) -> Option<Duration> {
        match self.liveness.ping_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Inactivity timeout: `missed_intervals` ping intervals without inbound traffic
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.ping_interval()
            .map(|interval| interval * self.liveness.missed_intervals)
    }

    /// Get handshake timeout as Duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.network.handshake_timeout_secs)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connect_timeout_secs)
    }

    /// Get dial retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.network.retry_delay_secs)
    }

    /// URL-like description of the endpoint, for logs
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.tls.enabled { "tls" } else { "tcp" };
        format!("{}://{}:{}", scheme, self.network.address, self.network.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[interface]
name = "utap1"

[network]
mode = "listen"
address = "*"
port = 9443
max_connections = 16

[liveness]
ping_interval_secs = 5

[tls]
ca_file = "/etc/etherdwarf/ca.pem"
key_file = "/etc/etherdwarf/key.pem"
cert_file = "/etc/etherdwarf/cert.pem"

[peers]
file = "/etc/etherdwarf/peers"

[scripts]
up = "/etc/etherdwarf/up.sh"
"#;

        let config = TunnelConfig::from_str(toml).unwrap();
        assert_eq!(config.interface.name, "utap1");
        assert!(config.interface.persistent);
        assert_eq!(config.network.mode, Mode::Listen);
        assert_eq!(config.network.port, 9443);
        assert_eq!(config.network.max_connections, 16);
        assert_eq!(config.ping_interval(), Some(Duration::from_secs(5)));
        assert_eq!(config.inactivity_timeout(), Some(Duration::from_secs(15)));
        assert!(config.scripts.down.is_none());
        assert_eq!(config.endpoint_url(), "tls://*:9443");
    }

    #[test]
    fn test_ping_disabled() {
        let toml = r#"
[network]
address = "vpn.example.net"

[liveness]
ping_interval_secs = 0

[tls]
enabled = false

[peers]
file = "peers"
"#;
        let config = TunnelConfig::from_str(toml).unwrap();
        assert_eq!(config.network.mode, Mode::Dial);
        assert!(config.ping_interval().is_none());
        assert!(config.inactivity_timeout().is_none());
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_validation() {
        let mut config = TunnelConfig::default();
        assert!(config.validate().is_err(), "peers file is mandatory");

        config.peers.file = Some(PathBuf::from("peers"));
        config.network.address = "10.1.1.1".into();
        assert!(config.validate().is_err(), "dial mode with TLS needs a CA");

        config.tls.ca_file = Some(PathBuf::from("ca.pem"));
        assert!(config.validate().is_ok());

        config.tls.key_file = Some(PathBuf::from("key.pem"));
        assert!(config.validate().is_err(), "client key without certificate");

        config.tls.enabled = false;
        config.network.mode = Mode::Listen;
        config.network.max_connections = 0;
        assert!(config.validate().is_err());
    }
}
