//! Peer Registry
//!
//! Parses the static peers file and holds the resulting table for the
//! lifetime of the process.
//!
//! Each line has the form `IP[/prefix]:presharedKey:MAC`. The first line
//! describes this node (any prefix length, it addresses the local device);
//! every following line is a remote peer and must be a single host (/32).

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

/// Prefix length assumed for remote entries without an explicit `/prefix`
pub const HOST_PREFIX: u8 = 32;

/// Prefix length assumed for the self entry without an explicit `/prefix`
pub const DEFAULT_SELF_PREFIX: u8 = 24;

/// A 6-byte Ethernet hardware address
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }

    /// Read the address from the first six bytes of a slice
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = PeerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PeerParseError::InvalidMac(s.to_string());
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(MacAddr(octets))
    }
}

/// Why a single peers-file line could not be parsed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerParseError {
    #[error("expected IP[/prefix]:presharedKey:MAC")]
    MissingField,

    #[error("invalid IPv4 address '{0}'")]
    InvalidAddress(String),

    #[error("invalid prefix length '{0}'")]
    InvalidPrefix(String),

    #[error("empty pre-shared key")]
    EmptyKey,

    #[error("invalid MAC address '{0}'")]
    InvalidMac(String),
}

/// Peers file load failures. Line numbers are 1-based.
#[derive(Error, Debug)]
pub enum PeerFileError {
    #[error("Failed to open peers file '{path}': {source}")]
    Missing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Peers file requires at least 2 lines (one for this node and one per remote peer), found {found}")]
    TooFewLines { found: usize },

    #[error("Malformed peer definition in configuration line number {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: PeerParseError,
    },

    #[error("Netmask /{prefix} is not /32 in configuration line number {line}")]
    NotHostRoute { line: usize, prefix: u8 },

    #[error("IP address {address} repeated in configuration line number {line}")]
    DuplicateAddress { line: usize, address: Ipv4Addr },
}

impl PeerFileError {
    /// Process exit status for this category of failure
    pub fn exit_code(&self) -> i32 {
        match self {
            PeerFileError::Missing { .. } => 13,
            PeerFileError::TooFewLines { .. } => 15,
            PeerFileError::Malformed { .. } => 16,
            PeerFileError::NotHostRoute { .. } => 17,
            PeerFileError::DuplicateAddress { .. } => 18,
        }
    }
}

/// One entry of the static peer table
#[derive(Clone, PartialEq, Eq)]
pub struct PeerDefinition {
    pub address: Ipv4Addr,
    pub preshared_key: Vec<u8>,
    pub mac: MacAddr,
    pub prefix_len: u8,
    pub is_self: bool,
}

impl fmt::Debug for PeerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerDefinition")
            .field("address", &self.address)
            .field("preshared_key", &"<redacted>")
            .field("mac", &self.mac)
            .field("prefix_len", &self.prefix_len)
            .field("is_self", &self.is_self)
            .finish()
    }
}

impl PeerDefinition {
    /// Parse one `IP[/prefix]:presharedKey:MAC` line.
    ///
    /// `default_prefix` applies when the line carries no `/prefix`.
    pub fn parse_line(line: &str, default_prefix: u8) -> Result<Self, PeerParseError> {
        let line = line.trim();
        let (addr_part, rest) = line.split_once(':').ok_or(PeerParseError::MissingField)?;

        let (ip_str, prefix_len) = match addr_part.split_once('/') {
            Some((ip, prefix)) => {
                let prefix_len: u8 = prefix
                    .trim()
                    .parse()
                    .map_err(|_| PeerParseError::InvalidPrefix(prefix.to_string()))?;
                if prefix_len > 32 {
                    return Err(PeerParseError::InvalidPrefix(prefix.to_string()));
                }
                (ip, prefix_len)
            }
            None => (addr_part, default_prefix),
        };
        let address: Ipv4Addr = ip_str
            .trim()
            .parse()
            .map_err(|_| PeerParseError::InvalidAddress(ip_str.to_string()))?;

        // The MAC itself contains ':' separators, so it is the trailing 17
        // characters; everything between the address and the MAC is the key.
        const MAC_TEXT_LEN: usize = 17;
        if rest.len() < MAC_TEXT_LEN + 1 || !rest.is_char_boundary(rest.len() - MAC_TEXT_LEN) {
            return Err(PeerParseError::MissingField);
        }
        let (key_part, mac_str) = rest.split_at(rest.len() - MAC_TEXT_LEN);
        let key = key_part.strip_suffix(':').ok_or(PeerParseError::MissingField)?;
        if key.is_empty() {
            return Err(PeerParseError::EmptyKey);
        }
        let mac: MacAddr = mac_str.parse()?;

        Ok(Self {
            address,
            preshared_key: key.as_bytes().to_vec(),
            mac,
            prefix_len,
            is_self: false,
        })
    }

    /// Netmask derived from the prefix length
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = match self.prefix_len {
            0 => 0,
            n => u32::MAX << (32 - u32::from(n.min(32))),
        };
        Ipv4Addr::from(bits)
    }

    /// `address/prefix` notation
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

/// Immutable table of every configured peer, keyed by IPv4 address.
///
/// Built once at startup; no writer exists afterwards, so it is shared
/// between tasks behind a plain `Arc`.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: HashMap<Ipv4Addr, Arc<PeerDefinition>>,
    local: Arc<PeerDefinition>,
}

impl PeerRegistry {
    /// Load the peers file at `path`
    pub fn from_file(path: &Path) -> Result<Self, PeerFileError> {
        let contents = std::fs::read_to_string(path).map_err(|source| PeerFileError::Missing {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load(&contents)
    }

    /// Parse a complete peers file.
    ///
    /// Blank lines and `#` comments are skipped but still count towards the
    /// reported line numbers. Any violation aborts the load.
    pub fn load(contents: &str) -> Result<Self, PeerFileError> {
        let entries: Vec<(usize, &str)> = contents
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
            .collect();

        if entries.len() < 2 {
            return Err(PeerFileError::TooFewLines { found: entries.len() });
        }

        let (self_line, self_text) = entries[0];
        let mut local = PeerDefinition::parse_line(self_text, DEFAULT_SELF_PREFIX)
            .map_err(|source| PeerFileError::Malformed { line: self_line, source })?;
        local.is_self = true;
        let local = Arc::new(local);

        let mut peers = HashMap::with_capacity(entries.len());
        peers.insert(local.address, Arc::clone(&local));

        for &(line, text) in &entries[1..] {
            let peer = PeerDefinition::parse_line(text, HOST_PREFIX)
                .map_err(|source| PeerFileError::Malformed { line, source })?;
            if peer.prefix_len != HOST_PREFIX {
                return Err(PeerFileError::NotHostRoute { line, prefix: peer.prefix_len });
            }
            if peers.contains_key(&peer.address) {
                return Err(PeerFileError::DuplicateAddress { line, address: peer.address });
            }
            peers.insert(peer.address, Arc::new(peer));
        }

        Ok(Self { peers, local })
    }

    /// Exact-match lookup, including the self entry
    pub fn lookup(&self, address: &Ipv4Addr) -> Option<&Arc<PeerDefinition>> {
        self.peers.get(address)
    }

    /// Lookup restricted to remote peers
    pub fn remote(&self, address: &Ipv4Addr) -> Option<&Arc<PeerDefinition>> {
        self.lookup(address).filter(|peer| !peer.is_self)
    }

    /// The entry describing this node
    pub fn local(&self) -> &Arc<PeerDefinition> {
        &self.local
    }

    /// Iterate over remote peers (unordered)
    pub fn remotes(&self) -> impl Iterator<Item = &Arc<PeerDefinition>> {
        self.peers.values().filter(|peer| !peer.is_self)
    }

    /// Number of entries including the self entry
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
