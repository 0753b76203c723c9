use std::path::Path;

use anyhow::{Context, Result};
use pcap::{Active, Capture, Direction, Error as PcapError, Offline};
use tracing::{debug, info, warn};

use crate::dispatch::Burst;
use crate::high_performance::{BufferPool, PacketBuf, DEFAULT_SLOT_SIZE};
use crate::packet::Timeval;

/// A packet source/sink with one receive and one transmit queue.
pub trait Port {
    fn name(&self) -> &str;

    /// Pull up to `max` frames into `burst` without blocking. Stops early
    /// when the queue is empty or the pool runs dry. Returns the number of
    /// frames appended.
    fn receive_burst(&mut self, pool: &BufferPool, burst: &mut Burst, max: usize) -> usize;

    /// Single-shot transmit. `Ok` means the transmit path now owns the
    /// buffer; on failure the buffer comes back to the caller.
    fn transmit(&mut self, buf: PacketBuf) -> Result<(), PacketBuf>;

    /// True once a finite source has nothing left to deliver.
    fn is_exhausted(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub snaplen: i32,
    pub promisc: bool,
    /// Kernel capture buffer in bytes
    pub buffer_size: i32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            snaplen: DEFAULT_SLOT_SIZE as i32,
            promisc: true,
            buffer_size: 16 * 1024 * 1024,
        }
    }
}

enum Handle {
    Live(Capture<Active>),
    Offline(Capture<Offline>),
}

/// libpcap-backed port: a live interface, or a capture file being replayed.
pub struct PcapPort {
    name: String,
    handle: Handle,
    exhausted: bool,
    rx_errors: u64,
    tx_errors: u64,
}

impl PcapPort {
    /// Open an interface in non-blocking, immediate mode. Only inbound
    /// frames are captured so our own transmissions are never seen again.
    pub fn open_live(device: &str, config: &PortConfig) -> Result<Self> {
        info!("Configuring port {}...", device);

        let capture = Capture::from_device(device)
            .with_context(|| format!("Unknown device {}", device))?
            .promisc(config.promisc)
            .snaplen(config.snaplen)
            .buffer_size(config.buffer_size)
            .immediate_mode(true)
            .open()
            .with_context(|| format!("Failed to start capture on {}", device))?
            .setnonblock()
            .with_context(|| format!("Failed to set {} non-blocking", device))?;

        if let Err(e) = capture.direction(Direction::In) {
            warn!("Port {} cannot filter inbound-only traffic: {}", device, e);
        }

        Ok(Self {
            name: device.to_string(),
            handle: Handle::Live(capture),
            exhausted: false,
            rx_errors: 0,
            tx_errors: 0,
        })
    }

    pub fn open_offline(path: &Path) -> Result<Self> {
        debug!("Opening capture file: {}", path.display());

        let capture = Capture::from_file(path)
            .with_context(|| format!("Failed to open capture file: {}", path.display()))?;

        Ok(Self {
            name: path.display().to_string(),
            handle: Handle::Offline(capture),
            exhausted: false,
            rx_errors: 0,
            tx_errors: 0,
        })
    }
}

impl Drop for PcapPort {
    fn drop(&mut self) {
        if self.rx_errors > 0 || self.tx_errors > 0 {
            warn!(
                "Port {} closed with {} receive errors, {} transmit errors",
                self.name, self.rx_errors, self.tx_errors
            );
        }
    }
}

impl Port for PcapPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive_burst(&mut self, pool: &BufferPool, burst: &mut Burst, max: usize) -> usize {
        let mut received = 0;

        while received < max {
            // Take the slot first so a dry pool leaves frames in the queue
            let mut buf = match pool.try_acquire() {
                Some(buf) => buf,
                None => break,
            };

            let next = match &mut self.handle {
                Handle::Live(capture) => capture.next_packet(),
                Handle::Offline(capture) => capture.next_packet(),
            };

            match next {
                Ok(packet) => {
                    let ts = Timeval::new(
                        packet.header.ts.tv_sec as u64,
                        packet.header.ts.tv_usec as u32,
                    );
                    buf.fill(packet.data, packet.header.len as usize, ts);
                    burst.push(buf);
                    received += 1;
                }
                Err(PcapError::TimeoutExpired) => break,
                Err(PcapError::NoMorePackets) => {
                    if !self.exhausted {
                        info!("End of capture on {}", self.name);
                        self.exhausted = true;
                    }
                    break;
                }
                Err(e) => {
                    self.rx_errors += 1;
                    warn!("Error receiving on port {}: {}", self.name, e);
                    break;
                }
            }
        }

        received
    }

    fn transmit(&mut self, buf: PacketBuf) -> Result<(), PacketBuf> {
        let capture = match &mut self.handle {
            Handle::Live(capture) => capture,
            Handle::Offline(_) => return Err(buf),
        };

        match capture.sendpacket(buf.data()) {
            // libpcap has copied the frame; the slot can go back to the pool
            Ok(()) => Ok(()),
            Err(e) => {
                self.tx_errors += 1;
                debug!("Transmit on {} failed: {}", self.name, e);
                Err(buf)
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
