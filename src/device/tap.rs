//! TAP device management
//!
//! Creates and manages a layer-2 virtual interface using the Linux TUN/TAP
//! driver.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::FrameDevice;
use crate::error::{Error, Result};
use crate::peers::{MacAddr, PeerDefinition};

// TUNSETIFF = _IOW('T', 202, c_int), TUNSETPERSIST = _IOW('T', 203, c_int)
// PowerPC encodes the write direction bit differently from x86/ARM.
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETPERSIST: libc::c_ulong = 0x800454cb;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETPERSIST: libc::c_ulong = 0x400454cb;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// A Linux TAP device
pub struct TapDevice {
    file: File,
    name: String,
}

impl TapDevice {
    /// Open (or attach to) the TAP device with the given name
    pub fn create(name: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| Error::Device(format!("Failed to open /dev/net/tun: {}", e)))?;

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(15);
        req.ifr_name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut _) };
        if ret < 0 {
            return Err(Error::Device(format!(
                "ioctl TUNSETIFF failed for {}: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }

        let actual_name = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(name)
            .trim_end_matches('\0')
            .to_string();

        debug!("Opened TAP device {}", actual_name);
        Ok(Self { file, name: actual_name })
    }

    /// Keep (or stop keeping) the interface after the descriptor is closed
    pub fn set_persistent(&self, persistent: bool) -> Result<()> {
        let flag: libc::c_ulong = if persistent { 1 } else { 0 };
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), TUNSETPERSIST as _, flag) };
        if ret < 0 {
            return Err(Error::Device(format!(
                "ioctl TUNSETPERSIST failed for {}: {}",
                self.name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Assign the local peer's hardware address, IPv4 address and MTU, then
    /// bring the interface up
    pub fn configure(&self, local: &PeerDefinition, mtu: u16) -> Result<()> {
        self.ip(&["link", "set", "dev", &self.name, "address", &local.mac.to_string()])?;
        self.ip(&["addr", "replace", &local.cidr(), "dev", &self.name])?;
        if let Err(e) = self.ip(&["link", "set", "dev", &self.name, "mtu", &mtu.to_string()]) {
            warn!("Failed to set MTU on {}: {}", self.name, e);
        }
        self.ip(&["link", "set", "dev", &self.name, "up"])?;

        info!("TAP interface {} configured as {} ({})", self.name, local.cidr(), local.mac);
        Ok(())
    }

    fn ip(&self, args: &[&str]) -> Result<()> {
        let status = std::process::Command::new("ip")
            .args(args)
            .status()
            .map_err(|e| Error::Device(format!("Failed to run ip {}: {}", args.join(" "), e)))?;
        if !status.success() {
            return Err(Error::Device(format!("ip {} failed on {}: {}", args.join(" "), self.name, status)));
        }
        Ok(())
    }
}

impl FrameDevice for TapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn hardware_address(&self) -> std::io::Result<MacAddr> {
        let path = format!("/sys/class/net/{}/address", self.name);
        let text = std::fs::read_to_string(path)?;
        text.trim()
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn read_frame(&self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        if ready == 0 {
            return Ok(0);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("{} reported poll error", self.name),
            ));
        }
        (&self.file).read(buf)
    }

    fn write_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        let written = (&self.file).write(frame)?;
        if written != frame.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short write to {}: {} of {} bytes", self.name, written, frame.len()),
            ));
        }
        Ok(())
    }
}
