//! Two tunnels over loopback TCP, each bridged to an in-memory device

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use etherdwarf::config::Mode;
use etherdwarf::device::{MemoryDevice, MemoryDeviceHandle};
use etherdwarf::network::{Acceptor, ChannelFactory, Dialer};
use etherdwarf::peers::{MacAddr, PeerRegistry};
use etherdwarf::tunnel::{Endpoint, Tunnel};
use etherdwarf::TunnelConfig;

const MAC_A: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
const MAC_B: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);
const IP_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const IP_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

const PEERS_A: &str = "10.0.0.1/24:psk1:AA:BB:CC:DD:EE:01\n10.0.0.2:psk2:AA:BB:CC:DD:EE:02\n";
const PEERS_B: &str = "10.0.0.2/24:psk2:AA:BB:CC:DD:EE:02\n10.0.0.1:psk1:AA:BB:CC:DD:EE:01\n";

fn config(mode: Mode, port: u16) -> TunnelConfig {
    let mut config = TunnelConfig::default();
    config.network.mode = mode;
    config.network.address = "127.0.0.1".into();
    config.network.port = port;
    config.network.retry_delay_secs = 1;
    config.tls.enabled = false;
    config.liveness.ping_interval_secs = 1;
    config
}

/// Ethernet + minimal IPv4 header
fn ipv4_frame(src: MacAddr, dst: MacAddr, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&dst.octets());
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&[0x08, 0x00]);
    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&((20 + body.len()) as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&src_ip.octets());
    ip[16..20].copy_from_slice(&dst_ip.octets());
    frame.extend_from_slice(&ip);
    frame.extend_from_slice(body);
    frame
}

async fn wait_for_frame(handle: &MemoryDeviceHandle) -> Option<Vec<u8>> {
    for _ in 0..500 {
        if let Some(frame) = handle.try_recv() {
            return Some(frame);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

async fn wait_established(tunnel: &Tunnel, peer: Ipv4Addr) -> bool {
    for _ in 0..500 {
        if tunnel.sessions().get(&peer).is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

struct Node {
    tunnel: Arc<Tunnel>,
    handle: MemoryDeviceHandle,
    task: tokio::task::JoinHandle<etherdwarf::Result<()>>,
}

async fn listener(peers: &str) -> (Node, u16) {
    let config = config(Mode::Listen, 0);
    let acceptor = Acceptor::bind(&config, ChannelFactory::Plain).await.unwrap();
    let port = acceptor.local_addr().unwrap().port();
    let (device, handle) = MemoryDevice::new("mem-a", MAC_A);
    let tunnel = Tunnel::new(Arc::new(config), Arc::new(PeerRegistry::load(peers).unwrap()), Arc::new(device));
    let task = tokio::spawn(Arc::clone(&tunnel).run(Endpoint::Listen(acceptor)));
    (Node { tunnel, handle, task }, port)
}

fn dialer(peers: &str, port: u16) -> Node {
    let config = config(Mode::Dial, port);
    let dialer = Dialer::new(&config, ChannelFactory::Plain);
    let (device, handle) = MemoryDevice::new("mem-b", MAC_B);
    let tunnel = Tunnel::new(Arc::new(config), Arc::new(PeerRegistry::load(peers).unwrap()), Arc::new(device));
    let task = tokio::spawn(Arc::clone(&tunnel).run(Endpoint::Dial(dialer)));
    Node { tunnel, handle, task }
}

async fn stop(node: Node) {
    node.tunnel.shutdown_token().cancel();
    tokio::time::timeout(Duration::from_secs(10), node.task)
        .await
        .expect("tunnel did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_frames_cross_the_tunnel_both_ways() {
    let (a, port) = listener(PEERS_A).await;
    let b = dialer(PEERS_B, port);

    assert!(wait_established(&a.tunnel, IP_B).await, "listener never saw the dialer");
    assert!(wait_established(&b.tunnel, IP_A).await, "dialer never authenticated");

    let to_b = ipv4_frame(MAC_A, MAC_B, IP_A, IP_B, b"hello from a");
    assert!(a.handle.inject(to_b.clone()));
    assert_eq!(wait_for_frame(&b.handle).await, Some(to_b));

    let to_a = ipv4_frame(MAC_B, MAC_A, IP_B, IP_A, b"hello from b");
    assert!(b.handle.inject(to_a.clone()));
    assert_eq!(wait_for_frame(&a.handle).await, Some(to_a));

    // Frames for unknown hosts are dropped without disturbing the session
    let stray = ipv4_frame(MAC_A, MAC_B, IP_A, Ipv4Addr::new(10, 0, 0, 99), b"nowhere");
    assert!(a.handle.inject(stray));
    let again = ipv4_frame(MAC_A, MAC_B, IP_A, IP_B, b"still here");
    assert!(a.handle.inject(again.clone()));
    assert_eq!(wait_for_frame(&b.handle).await, Some(again));

    stop(b).await;
    stop(a).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dialer_reconnects_after_session_loss() {
    let (a, port) = listener(PEERS_A).await;
    let b = dialer(PEERS_B, port);
    assert!(wait_established(&a.tunnel, IP_B).await);

    let first = a.tunnel.sessions().get(&IP_B).unwrap().id();
    // Drop the session on the listener side; the dialer notices and redials
    a.tunnel.sessions().get(&IP_B).unwrap().close();

    let mut reconnected = false;
    for _ in 0..500 {
        if let Some(session) = a.tunnel.sessions().get(&IP_B) {
            if session.id() != first {
                reconnected = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reconnected, "dialer did not reconnect");

    stop(b).await;
    stop(a).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wrong_key_never_establishes() {
    let (a, port) = listener(PEERS_A).await;
    let b = dialer(
        "10.0.0.2/24:not-psk2:AA:BB:CC:DD:EE:02\n10.0.0.1:psk1:AA:BB:CC:DD:EE:01\n",
        port,
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(a.tunnel.sessions().is_empty());
    assert!(b.tunnel.sessions().is_empty());

    stop(b).await;
    stop(a).await;
}
