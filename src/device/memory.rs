//! In-memory frame device
//!
//! Frames injected through the handle are returned by `read_frame`; frames
//! written by the tunnel are delivered to the handle.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

use super::FrameDevice;
use crate::peers::MacAddr;

/// Loopback device backed by channels
pub struct MemoryDevice {
    name: String,
    mac: MacAddr,
    inbound: Mutex<Receiver<Vec<u8>>>,
    outbound: Mutex<Sender<Vec<u8>>>,
}

/// The "wire" side of a `MemoryDevice`
pub struct MemoryDeviceHandle {
    inject: Sender<Vec<u8>>,
    emitted: Receiver<Vec<u8>>,
}

impl MemoryDevice {
    /// Create a device and the handle that feeds and observes it
    pub fn new(name: &str, mac: MacAddr) -> (Self, MemoryDeviceHandle) {
        let (inject, inbound) = mpsc::channel();
        let (outbound, emitted) = mpsc::channel();
        let device = Self {
            name: name.to_string(),
            mac,
            inbound: Mutex::new(inbound),
            outbound: Mutex::new(outbound),
        };
        (device, MemoryDeviceHandle { inject, emitted })
    }
}

impl FrameDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn hardware_address(&self) -> std::io::Result<MacAddr> {
        Ok(self.mac)
    }

    fn read_frame(&self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        let inbound = self
            .inbound
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "device lock poisoned"))?;
        match inbound.recv_timeout(timeout) {
            Ok(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(len)
            }
            Err(RecvTimeoutError::Timeout) => Ok(0),
            Err(RecvTimeoutError::Disconnected) => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("{} handle dropped", self.name),
            )),
        }
    }

    fn write_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        let outbound = self
            .outbound
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "device lock poisoned"))?;
        outbound.send(frame.to_vec()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, format!("{} handle dropped", self.name))
        })
    }
}

impl MemoryDeviceHandle {
    /// Make a frame available to the next `read_frame`
    pub fn inject(&self, frame: Vec<u8>) -> bool {
        self.inject.send(frame).is_ok()
    }

    /// Wait for the next frame the tunnel wrote to the device
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.emitted.recv_timeout(timeout).ok()
    }

    /// Frame written to the device, if one is already waiting
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.emitted.try_recv().ok()
    }
}
