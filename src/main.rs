//! etherdwarf - Multi-peer virtual Ethernet tunnel
//!
//! Bridges a local TAP interface to remote etherdwarf instances over TLS.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use etherdwarf::config::{Mode, TunnelConfig};
use etherdwarf::device::FrameDevice;
use etherdwarf::error::Error;
use etherdwarf::network::{Acceptor, ChannelFactory, Dialer};
use etherdwarf::peers::PeerRegistry;
use etherdwarf::tunnel::{Endpoint, Tunnel};

/// etherdwarf - Multi-peer virtual Ethernet tunnel
#[derive(Parser)]
#[command(name = "etherdwarf")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/etherdwarf/etherdwarf.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// System log mode: no colours and no timestamps (for journald)
    #[arg(long)]
    sys: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the tunnel
    Start {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Validate the configuration and the peers file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "etherdwarf.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the parsed peer table
    Peers,
}

/// Command line settings that take precedence over the config file
#[derive(clap::Args, Default)]
struct Overrides {
    /// Accept peer connections instead of dialing
    #[arg(long, conflicts_with = "connect")]
    listen: bool,

    /// Dial this host
    #[arg(long, value_name = "HOST")]
    connect: Option<String>,

    /// TCP port to listen on or dial
    #[arg(short, long)]
    port: Option<u16>,

    /// TAP interface name
    #[arg(short, long)]
    interface: Option<String>,

    /// Peers file
    #[arg(long, value_name = "FILE")]
    peers: Option<PathBuf>,

    /// Disable TLS (plain-text mode)
    #[arg(long)]
    no_tls: bool,
}

impl Overrides {
    fn apply(&self, config: &mut TunnelConfig) {
        if self.listen {
            config.network.mode = Mode::Listen;
        }
        if let Some(host) = &self.connect {
            config.network.mode = Mode::Dial;
            config.network.address = host.clone();
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(name) = &self.interface {
            config.interface.name = name.clone();
        }
        if let Some(peers) = &self.peers {
            config.peers.file = Some(peers.clone());
        }
        if self.no_tls {
            config.tls.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Start { overrides } => run_start(&cli, overrides).await,
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), cli.sys);
            run_validate(&cli.config)
        }
        Commands::Init { output, force } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), cli.sys);
            run_init(output, *force)
        }
        Commands::Peers => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), cli.sys);
            run_peers(&cli.config)
        }
    };

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        let code = e.downcast_ref::<Error>().map(Error::exit_code).unwrap_or(1);
        std::process::exit(code);
    }
}

/// Initialize logging
fn init_logging(level: &str, system: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if system {
        registry
            .with(tracing_subscriber::fmt::layer().with_ansi(false).without_time())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Read the config file, apply command line overrides, validate
fn load_config(path: &Path, overrides: &Overrides) -> etherdwarf::Result<TunnelConfig> {
    let mut config = TunnelConfig::read(path)?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn load_peers(config: &TunnelConfig) -> etherdwarf::Result<PeerRegistry> {
    let path = config
        .peers_file()
        .ok_or_else(|| Error::Config("peers.file must be set".into()))?;
    Ok(PeerRegistry::from_file(path)?)
}

/// Start the tunnel
async fn run_start(cli: &Cli, overrides: &Overrides) -> anyhow::Result<()> {
    let config = load_config(&cli.config, overrides);
    let (level, system) = match &config {
        Ok(config) => (
            cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone()),
            cli.sys || config.logging.system,
        ),
        Err(_) => (cli.log_level.clone().unwrap_or_else(|| "info".into()), cli.sys),
    };
    init_logging(&level, system);

    let config = config.with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    tracing::info!("Starting etherdwarf {} in {} mode", env!("CARGO_PKG_VERSION"), config.network.mode);

    let registry = load_peers(&config).context("Failed to load the peers file")?;
    let local = Arc::clone(registry.local());
    tracing::info!(
        "Loaded {} peer(s), local entry {} ({})",
        registry.len() - 1,
        local.cidr(),
        local.mac
    );

    let channels = ChannelFactory::from_config(&config.tls, config.network.mode)
        .context("Failed to load TLS material")?;

    let device = open_device(&config, &registry).context("Failed to set up the virtual interface")?;

    let endpoint = match config.network.mode {
        Mode::Listen => Endpoint::Listen(
            Acceptor::bind(&config, channels)
                .await
                .context("Failed to start the listener")?,
        ),
        Mode::Dial => Endpoint::Dial(Dialer::new(&config, channels)),
    };

    drop_privileges(config.privileges.uid, config.privileges.gid).context("Failed to drop privileges")?;

    let tunnel = Tunnel::new(Arc::new(config), Arc::new(registry), device);
    let shutdown = tunnel.shutdown_token();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Received shutdown signal");
        shutdown.cancel();
    });

    tunnel.run(endpoint).await?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_device(config: &TunnelConfig, registry: &PeerRegistry) -> etherdwarf::Result<Arc<dyn FrameDevice>> {
    use etherdwarf::device::TapDevice;

    if !nix::unistd::geteuid().is_root() {
        tracing::warn!("Not running as root, creating {} will likely fail", config.interface.name);
    }

    let device = TapDevice::create(&config.interface.name)?;
    device.set_persistent(config.interface.persistent)?;
    device.configure(registry.local(), config.interface.mtu)?;

    let mac = device
        .hardware_address()
        .map_err(|e| Error::Device(format!("cannot read hardware address of {}: {}", device.name(), e)))?;
    if mac.is_zero() {
        return Err(Error::Device(format!("{} has no hardware address", device.name())));
    }
    if mac != registry.local().mac {
        tracing::warn!(
            "{} reports hardware address {}, peers expect {}",
            device.name(),
            mac,
            registry.local().mac
        );
    }
    Ok(Arc::new(device))
}

#[cfg(not(target_os = "linux"))]
fn open_device(_config: &TunnelConfig, _registry: &PeerRegistry) -> etherdwarf::Result<Arc<dyn FrameDevice>> {
    Err(Error::Device("TAP devices are only supported on Linux".into()))
}

/// Switch to the configured group and user (0 keeps the current one)
fn drop_privileges(uid: u32, gid: u32) -> etherdwarf::Result<()> {
    use nix::unistd::{setgid, setuid, Gid, Uid};

    if gid != 0 {
        setgid(Gid::from_raw(gid)).map_err(|e| Error::Config(format!("setgid({}) failed: {}", gid, e)))?;
        tracing::info!("Switched to group {}", gid);
    }
    if uid != 0 {
        setuid(Uid::from_raw(uid)).map_err(|e| Error::Config(format!("setuid({}) failed: {}", uid, e)))?;
        tracing::info!("Switched to user {}", uid);
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Validate configuration
fn run_validate(config_path: &Path) -> anyhow::Result<()> {
    let config = match TunnelConfig::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            return Err(e.into());
        }
    };
    let registry = match load_peers(&config) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("✗ Peers file error: {}", e);
            return Err(e.into());
        }
    };

    println!("✓ Configuration is valid");
    println!("  Mode:       {}", config.network.mode);
    println!("  Endpoint:   {}", config.endpoint_url());
    println!("  Interface:  {} (mtu {})", config.interface.name, config.interface.mtu);
    println!("  Local:      {} ({})", registry.local().cidr(), registry.local().mac);
    println!("  Peers:      {}", registry.len() - 1);
    match config.ping_interval() {
        Some(interval) => println!("  Keepalive:  every {:?}", interval),
        None => println!("  Keepalive:  disabled"),
    }
    Ok(())
}

/// Print the peer table (keys are never shown)
fn run_peers(config_path: &Path) -> anyhow::Result<()> {
    let config = TunnelConfig::from_file(config_path)?;
    let registry = load_peers(&config)?;

    let mut remotes: Vec<_> = registry.remotes().collect();
    remotes.sort_by_key(|peer| peer.address);

    println!("{:<20} {:<19} ROLE", "ADDRESS", "MAC");
    let local = registry.local();
    println!("{:<20} {:<19} self", local.cidr(), local.mac.to_string());
    for peer in remotes {
        println!("{:<20} {:<19} peer", peer.cidr(), peer.mac.to_string());
    }
    Ok(())
}

/// Written by `init`
const CONFIG_TEMPLATE: &str = r#"# etherdwarf Configuration
# Generated configuration file

[interface]
name = "utap0"
persistent = true
mtu = 1500

[network]
# "listen" accepts peers, "dial" keeps one connection to `address`
mode = "listen"
address = "*"
port = 443
ipv4_only = true
max_connections = 1024
handshake_timeout_secs = 15
connect_timeout_secs = 10
retry_delay_secs = 5

[liveness]
# 0 disables keepalives
ping_interval_secs = 10
missed_intervals = 3

[tls]
enabled = true
ca_file = "/etc/etherdwarf/ca.pem"
key_file = "/etc/etherdwarf/key.pem"
cert_file = "/etc/etherdwarf/cert.pem"

[peers]
# First line: this node, IP[/prefix]:psk:MAC
#   the prefix is the subnet assigned to the interface, /24 when omitted
# Other lines: remote peers, IP:psk:MAC (always /32)
file = "/etc/etherdwarf/peers"

[scripts]
# up = "/etc/etherdwarf/up.sh"
# down = "/etc/etherdwarf/down.sh"

[privileges]
uid = 0
gid = 0

[logging]
level = "info"
system = false
"#;

/// Write a starter configuration file
fn run_init(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists, use --force to overwrite", output.display());
    }


    std::fs::write(output, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your peers and TLS material.");
    println!("Then start with: etherdwarf --config {} start", output.display());

    Ok(())
}
