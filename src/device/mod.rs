//! Virtual Device Module
//!
//! The tunnel talks to a layer-2 device that hands out and accepts whole
//! Ethernet frames. `TapDevice` is the Linux implementation, `MemoryDevice`
//! an in-process loopback used by tests and embedders.

mod memory;
#[cfg(target_os = "linux")]
mod tap;

pub use memory::{MemoryDevice, MemoryDeviceHandle};
#[cfg(target_os = "linux")]
pub use tap::TapDevice;

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::peers::MacAddr;

/// Ethernet header length without VLAN tag
pub const ETHERNET_HEADER_LEN: usize = 14;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_VLAN: u16 = 0x8100;

/// A device presenting raw Ethernet frames.
///
/// The read path has a single owner (the device reader loop); writes may
/// come from any session task and are serialized by the caller.
pub trait FrameDevice: Send + Sync + 'static {
    /// Interface name as assigned by the OS
    fn name(&self) -> &str;

    /// Hardware address currently assigned to the device
    fn hardware_address(&self) -> std::io::Result<MacAddr>;

    /// Block until one frame is read into `buf` or `timeout` elapses.
    /// Returns `Ok(0)` on timeout.
    fn read_frame(&self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    /// Write one complete frame
    fn write_frame(&self, frame: &[u8]) -> std::io::Result<()>;
}

/// Destination MAC of an Ethernet frame
pub fn destination_mac(frame: &[u8]) -> Option<MacAddr> {
    MacAddr::from_slice(frame)
}

/// Source MAC of an Ethernet frame
pub fn source_mac(frame: &[u8]) -> Option<MacAddr> {
    MacAddr::from_slice(frame.get(6..)?)
}

/// Extract the IPv4 host a frame is addressed to.
///
/// IPv4 frames yield the header destination address, ARP frames the target
/// protocol address. A single 802.1Q tag is skipped.
pub fn destination_ipv4(frame: &[u8]) -> Option<Ipv4Addr> {
    let (ethertype, l3) = payload(frame)?;
    match ethertype {
        ETHERTYPE_IPV4 => {
            if l3.len() < 20 || (l3[0] >> 4) != 4 {
                return None;
            }
            Some(Ipv4Addr::new(l3[16], l3[17], l3[18], l3[19]))
        }
        ETHERTYPE_ARP => {
            // htype(2) ptype(2) hlen(1) plen(1) oper(2) sha(6) spa(4) tha(6) tpa(4)
            if l3.len() < 28 || l3[4] != 6 || l3[5] != 4 {
                return None;
            }
            Some(Ipv4Addr::new(l3[24], l3[25], l3[26], l3[27]))
        }
        _ => None,
    }
}

/// EtherType and layer-3 payload of a frame
fn payload(frame: &[u8]) -> Option<(u16, &[u8])> {
    if frame.len() < ETHERNET_HEADER_LEN {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype == ETHERTYPE_VLAN {
        let inner = frame.get(16..18)?;
        return Some((u16::from_be_bytes([inner[0], inner[1]]), frame.get(18..)?));
    }
    Some((ethertype, &frame[ETHERNET_HEADER_LEN..]))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Minimal Ethernet + IPv4 header frame
    pub fn ipv4_frame(src: MacAddr, dst: MacAddr, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(34 + body.len());
        frame.extend_from_slice(&dst.octets());
        frame.extend_from_slice(&src.octets());
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        let total = (20 + body.len()) as u16;
        ip[2..4].copy_from_slice(&total.to_be_bytes());
        ip[8] = 64;
        ip[9] = 17;
        ip[12..16].copy_from_slice(&src_ip.octets());
        ip[16..20].copy_from_slice(&dst_ip.octets());
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(body);
        frame
    }

    /// Broadcast ARP request for `target_ip`
    pub fn arp_request(src: MacAddr, src_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
        let mut frame = Vec::with_capacity(42);
        frame.extend_from_slice(&MacAddr::BROADCAST.octets());
        frame.extend_from_slice(&src.octets());
        frame.extend_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
        frame.extend_from_slice(&src.octets());
        frame.extend_from_slice(&src_ip.octets());
        frame.extend_from_slice(&[0u8; 6]);
        frame.extend_from_slice(&target_ip.octets());
        frame
    }
}
