// Flow engine seam and flow record types
pub mod l7;
pub mod parse;
pub mod table;

use std::net::IpAddr;

use crate::export::FlowExporter;
use crate::packet::Timeval;

pub use l7::L7Protocol;
pub use table::{FlowTable, FlowTableConfig};

/// Verdict for a classified packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Forward,
    Discard,
}

/// Engine-side counters surfaced in the periodic stats line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub active_flows: u64,
    pub flows: u64,
    pub err_no_room: u64,
    pub err_no_mem: u64,
}

impl FlowStats {
    pub fn errors(&self) -> u64 {
        self.err_no_room + self.err_no_mem
    }
}

/// Stateful flow classifier driven by the dispatch loop.
///
/// Only the dispatch thread touches an engine, so implementations need no
/// internal locking. Exporters are called synchronously from
/// [`housekeeping`](FlowEngine::housekeeping) and [`flush`](FlowEngine::flush).
pub trait FlowEngine {
    fn process(&mut self, frame: &[u8], timestamp: Timeval) -> Action;

    /// Expire stale flows. `now` is wall-clock seconds.
    fn housekeeping(&mut self, now: u64);

    /// Export every resident flow.
    fn flush(&mut self);

    fn stats(&self) -> FlowStats;

    fn set_exporter(&mut self, exporter: Box<dyn FlowExporter + Send>);

    /// Tear the engine down. Consumes it, so it can only happen once.
    fn destroy(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// Bidirectional flow identity. The client is whoever sent the first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: u16,
    pub dport: u16,
    pub protocol: u8,
}

impl FlowKey {
    pub fn ip_version(&self) -> u8 {
        match self.src {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    /// The same flow seen from the other end.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            sport: self.dport,
            dport: self.sport,
            protocol: self.protocol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer = 0,
    ServerToClient = 1,
}

/// Per-direction aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    pub packets: u64,
    pub bytes: u64,
    pub first: Timeval,
    pub last: Timeval,
    pub tcp_flags: u8,
}

impl DirectionStats {
    pub fn update(&mut self, bytes: usize, timestamp: Timeval, tcp_flags: u8) {
        if self.packets == 0 {
            self.first = timestamp;
        }
        self.packets += 1;
        self.bytes += bytes as u64;
        self.last = self.last.max(timestamp);
        self.tcp_flags |= tcp_flags;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowValue {
    pub direction: [DirectionStats; 2],
    pub l7_protocol: L7Protocol,
}

impl FlowValue {
    pub fn c2s(&self) -> &DirectionStats {
        &self.direction[Direction::ClientToServer as usize]
    }

    pub fn s2c(&self) -> &DirectionStats {
        &self.direction[Direction::ServerToClient as usize]
    }

    pub fn tcp_flags(&self) -> u8 {
        self.c2s().tcp_flags | self.s2c().tcp_flags
    }

    /// Earliest packet in either direction.
    pub fn first_seen(&self) -> Timeval {
        match (self.c2s().packets, self.s2c().packets) {
            (0, _) => self.s2c().first,
            (_, 0) => self.c2s().first,
            _ => self.c2s().first.min(self.s2c().first),
        }
    }

    pub fn last_seen(&self) -> Timeval {
        self.c2s().last.max(self.s2c().last)
    }
}

/// A flow leaving the table, owned by whoever receives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub value: FlowValue,
}
