// Burst dispatch loop: receive, account, classify, forward or release

use std::fmt::Write as _;
use std::io::Write;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::flow::{Action, FlowEngine};
use crate::high_performance::{prefetch_frames, BufferPool, PacketBuf};
use crate::packet::{unix_secs, Timeval};
use crate::port::Port;
use crate::shutdown::ShutdownToken;
use crate::stats::Accounting;

/// Most frames pulled from one receive queue per poll.
pub const BURST_SIZE: usize = 32;

/// Frames at the head of a burst whose data is prefetched.
pub const PREFETCH_OFFSET: usize = 3;

/// Added to every frame's wire length in the byte counter. Approximates the
/// preamble, inter-frame gap and CRC a frame occupies on the wire (8 + 12
/// + 4 bytes); it is a fixed convention and ignores VLAN tags and the like.
pub const FRAME_OVERHEAD_BYTES: u64 = 24;

pub type Burst = SmallVec<[PacketBuf; BURST_SIZE]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Classify through the flow engine. When off every frame is only
    /// counted and released.
    pub compute_flows: bool,
    /// Hex-dump every frame to stdout. Debug aid; costs O(frame length)
    /// per packet on the hot path.
    pub verbose: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            compute_flows: true,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Primary,
    Twin,
}

pub struct Dispatcher<P: Port, E: FlowEngine> {
    primary: P,
    twin: Option<P>,
    engine: E,
    pool: BufferPool,
    accounting: Arc<Accounting>,
    options: DispatchOptions,
    truncated: u64,
}

impl<P: Port, E: FlowEngine> Dispatcher<P, E> {
    /// `twin` turns on bridge mode: frames the engine does not discard are
    /// sent out of the opposite port.
    pub fn new(
        primary: P,
        twin: Option<P>,
        engine: E,
        pool: BufferPool,
        accounting: Arc<Accounting>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            primary,
            twin,
            engine,
            pool,
            accounting,
            options,
            truncated: 0,
        }
    }

    /// Poll until `shutdown` leaves RUNNING, or until every port is a
    /// finite source that has run dry.
    pub fn run(&mut self, shutdown: &ShutdownToken) {
        match &self.twin {
            Some(twin) => info!("Bridging {} <-> {}", self.primary.name(), twin.name()),
            None => info!("Capturing from port {}...", self.primary.name()),
        }

        while shutdown.is_running() {
            self.poll_once();

            if self.inputs_exhausted() && shutdown.trigger() {
                info!("All inputs exhausted, stopping");
            }
        }
    }

    /// One loop iteration: a burst from each configured port.
    pub fn poll_once(&mut self) {
        self.poll_port(Side::Primary);
        if self.twin.is_some() {
            self.poll_port(Side::Twin);
        }

        if self.options.compute_flows {
            self.accounting.publish_flow_stats(self.engine.stats());
        }
    }

    fn inputs_exhausted(&self) -> bool {
        self.primary.is_exhausted() && self.twin.as_ref().is_none_or(|twin| twin.is_exhausted())
    }

    fn poll_port(&mut self, side: Side) {
        let (rx, mut tx) = match side {
            Side::Primary => (&mut self.primary, self.twin.as_mut()),
            Side::Twin => match self.twin.as_mut() {
                Some(twin) => (twin, Some(&mut self.primary)),
                None => return,
            },
        };

        let mut burst = Burst::new();
        if rx.receive_burst(&self.pool, &mut burst, BURST_SIZE) == 0 {
            if self.options.compute_flows {
                self.engine.housekeeping(unix_secs());
            }
            return;
        }

        prefetch_frames(&burst, PREFETCH_OFFSET);

        for mut buf in burst.drain(..) {
            self.accounting.record_packet(buf.wire_len() as u64 + FRAME_OVERHEAD_BYTES);

            let action = if self.options.compute_flows {
                let now = Timeval::now();
                buf.set_timestamp(now);
                self.engine.process(buf.data(), now)
            } else {
                Action::Discard
            };

            if self.options.verbose {
                let line = hex_dump(buf.data(), action);
                let _ = writeln!(std::io::stdout().lock(), "{}", line);
            }

            match (tx.as_mut(), action) {
                // Only whole frames cross the bridge
                (Some(_), Action::Forward) if buf.is_truncated() => {
                    self.truncated += 1;
                    debug!("Dropping truncated frame: {} of {} bytes captured", buf.len(), buf.wire_len());
                    buf.release();
                }
                (Some(out), Action::Forward) => {
                    if let Err(buf) = out.transmit(buf) {
                        debug!("Transmit on {} failed, releasing buffer", out.name());
                        buf.release();
                    }
                }
                _ => buf.release(),
            }
        }
    }

    /// DRAINING → STOPPED: export every remaining flow, tear the engine
    /// down, close the ports. Consumes the dispatcher so it runs once.
    pub fn finish(self, shutdown: &ShutdownToken) {
        let Self {
            primary,
            twin,
            mut engine,
            accounting,
            truncated,
            ..
        } = self;

        if truncated > 0 {
            warn!("{} truncated frames were not forwarded", truncated);
        }

        engine.flush();
        accounting.publish_flow_stats(engine.stats());
        engine.destroy();

        drop(twin);
        drop(primary);
        shutdown.mark_stopped();
    }
}

/// `[Packet] hex: 00 1B 21 ... [discard]`
pub fn hex_dump(data: &[u8], action: Action) -> String {
    let mut line = String::with_capacity(16 + data.len() * 3 + 10);
    line.push_str("[Packet] hex: ");
    for byte in data {
        let _ = write!(line, "{:02X} ", byte);
    }
    if action == Action::Discard {
        line.push_str(" [discard]");
    }
    line
}
