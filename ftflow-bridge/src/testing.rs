// Test fixtures: hand-built frames, a collecting exporter, scripted port and engine

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatch::Burst;
use crate::export::FlowExporter;
use crate::flow::{Action, FlowEngine, FlowRecord, FlowStats};
use crate::high_performance::{BufferPool, PacketBuf};
use crate::packet::Timeval;
use crate::port::Port;

pub mod frames {
    use std::net::Ipv6Addr;

    const DST_MAC: [u8; 6] = [0x00, 0x1b, 0x21, 0x00, 0x00, 0x02];
    const SRC_MAC: [u8; 6] = [0x00, 0x1b, 0x21, 0x00, 0x00, 0x01];

    fn ethernet(ethertype: u16) -> Vec<u8> {
        let mut frame = Vec::with_capacity(128);
        frame.extend_from_slice(&DST_MAC);
        frame.extend_from_slice(&SRC_MAC);
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame
    }

    fn ipv4_header(frame: &mut Vec<u8>, src: [u8; 4], dst: [u8; 4], protocol: u8, l4_len: usize) {
        let total_len = (20 + l4_len) as u16;
        frame.push(0x45);
        frame.push(0);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.extend_from_slice(&[0x12, 0x34]); // id
        frame.extend_from_slice(&[0x40, 0x00]); // DF, offset 0
        frame.push(64);
        frame.push(protocol);
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&dst);
    }

    fn udp_header(frame: &mut Vec<u8>, sport: u16, dport: u16, payload_len: usize) {
        frame.extend_from_slice(&sport.to_be_bytes());
        frame.extend_from_slice(&dport.to_be_bytes());
        frame.extend_from_slice(&((8 + payload_len) as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
    }

    pub fn tcp_v4(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, flags: u8, payload_len: usize) -> Vec<u8> {
        let mut frame = ethernet(0x0800);
        ipv4_header(&mut frame, src, dst, 6, 20 + payload_len);

        frame.extend_from_slice(&sport.to_be_bytes());
        frame.extend_from_slice(&dport.to_be_bytes());
        frame.extend_from_slice(&1u32.to_be_bytes()); // seq
        frame.extend_from_slice(&0u32.to_be_bytes()); // ack
        frame.push(0x50);
        frame.push(flags);
        frame.extend_from_slice(&0xffffu16.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.resize(frame.len() + payload_len, 0xAA);
        frame
    }

    pub fn udp_v4(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload_len: usize) -> Vec<u8> {
        let mut frame = ethernet(0x0800);
        ipv4_header(&mut frame, src, dst, 17, 8 + payload_len);
        udp_header(&mut frame, sport, dport, payload_len);
        frame.resize(frame.len() + payload_len, 0xBB);
        frame
    }

    pub fn udp_v6(src: Ipv6Addr, dst: Ipv6Addr, sport: u16, dport: u16, payload_len: usize) -> Vec<u8> {
        let mut frame = ethernet(0x86DD);
        frame.extend_from_slice(&[0x60, 0, 0, 0]);
        frame.extend_from_slice(&((8 + payload_len) as u16).to_be_bytes());
        frame.push(17);
        frame.push(64);
        frame.extend_from_slice(&src.octets());
        frame.extend_from_slice(&dst.octets());
        udp_header(&mut frame, sport, dport, payload_len);
        frame.resize(frame.len() + payload_len, 0xCC);
        frame
    }

    /// Insert an 802.1Q tag after the MAC addresses.
    pub fn with_vlan(frame: &[u8], vlan_id: u16) -> Vec<u8> {
        let mut tagged = Vec::with_capacity(frame.len() + 4);
        tagged.extend_from_slice(&frame[..12]);
        tagged.extend_from_slice(&0x8100u16.to_be_bytes());
        tagged.extend_from_slice(&(vlan_id & 0x0fff).to_be_bytes());
        tagged.extend_from_slice(&frame[12..]);
        tagged
    }

    /// ARP who-has, padded to the Ethernet minimum.
    pub fn arp() -> Vec<u8> {
        let mut frame = ethernet(0x0806);
        frame.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
        frame.extend_from_slice(&SRC_MAC);
        frame.extend_from_slice(&[10, 0, 0, 1]);
        frame.extend_from_slice(&[0; 6]);
        frame.extend_from_slice(&[10, 0, 0, 2]);
        frame.resize(60, 0);
        frame
    }
}

#[derive(Clone, Default)]
pub struct CollectingExporter {
    records: Arc<Mutex<Vec<FlowRecord>>>,
}

impl CollectingExporter {
    pub fn records(&self) -> Vec<FlowRecord> {
        self.records.lock().clone()
    }
}

impl FlowExporter for CollectingExporter {
    fn export(&mut self, record: FlowRecord) {
        self.records.lock().push(record);
    }
}

#[derive(Default)]
struct EngineCalls {
    processed: Vec<(u8, Timeval)>,
    housekeeping: usize,
    flush: usize,
    destroy: usize,
}

/// What a [`RecordingEngine`] was asked to do. Survives the engine itself.
#[derive(Clone, Default)]
pub struct EngineLog {
    calls: Arc<Mutex<EngineCalls>>,
}

impl EngineLog {
    pub fn process_calls(&self) -> usize {
        self.calls.lock().processed.len()
    }

    pub fn housekeeping_calls(&self) -> usize {
        self.calls.lock().housekeeping
    }

    pub fn flush_calls(&self) -> usize {
        self.calls.lock().flush
    }

    pub fn destroy_calls(&self) -> usize {
        self.calls.lock().destroy
    }

    /// First byte of every processed frame, in call order.
    pub fn first_bytes(&self) -> Vec<u8> {
        self.calls.lock().processed.iter().map(|(b, _)| *b).collect()
    }

    pub fn timestamps(&self) -> Vec<Timeval> {
        self.calls.lock().processed.iter().map(|(_, ts)| *ts).collect()
    }
}

/// Engine that only records calls. Frames starting with `b'D'` are
/// discarded, everything else is forwarded.
pub struct RecordingEngine {
    log: EngineLog,
}

impl RecordingEngine {
    pub fn new(log: EngineLog) -> Self {
        Self { log }
    }
}

impl FlowEngine for RecordingEngine {
    fn process(&mut self, frame: &[u8], timestamp: Timeval) -> Action {
        let first = frame.first().copied().unwrap_or(0);
        self.log.calls.lock().processed.push((first, timestamp));
        if first == b'D' { Action::Discard } else { Action::Forward }
    }

    fn housekeeping(&mut self, _now: u64) {
        self.log.calls.lock().housekeeping += 1;
    }

    fn flush(&mut self) {
        self.log.calls.lock().flush += 1;
    }

    fn stats(&self) -> FlowStats {
        FlowStats::default()
    }

    fn set_exporter(&mut self, _exporter: Box<dyn FlowExporter + Send>) {}

    fn destroy(self) {
        self.log.calls.lock().destroy += 1;
    }
}

#[derive(Default)]
struct PortCalls {
    in_flight: Vec<PacketBuf>,
    attempts: usize,
}

/// Transmit-side view of a [`ScriptedPort`].
#[derive(Clone, Default)]
pub struct PortLog {
    calls: Arc<Mutex<PortCalls>>,
}

impl PortLog {
    /// Frames accepted for transmit and not yet completed.
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.calls.lock().in_flight.iter().map(|buf| buf.data().to_vec()).collect()
    }

    pub fn transmit_attempts(&self) -> usize {
        self.calls.lock().attempts
    }

    /// The hardware is done with every accepted frame.
    pub fn complete_transmits(&self) {
        self.calls.lock().in_flight.clear();
    }
}

/// Port that delivers a fixed script of bursts, one per receive call.
pub struct ScriptedPort {
    name: String,
    script: VecDeque<Vec<Vec<u8>>>,
    fail_transmit: bool,
    finite: bool,
    log: PortLog,
}

impl ScriptedPort {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: VecDeque::new(),
            fail_transmit: false,
            finite: false,
            log: PortLog::default(),
        }
    }

    pub fn with_burst(mut self, frames: Vec<Vec<u8>>) -> Self {
        self.script.push_back(frames);
        self
    }

    pub fn failing_transmit(mut self) -> Self {
        self.fail_transmit = true;
        self
    }

    /// Report exhaustion once the script has been delivered.
    pub fn exhausted_after_script(mut self) -> Self {
        self.finite = true;
        self
    }

    pub fn log(&self) -> PortLog {
        self.log.clone()
    }
}

impl Port for ScriptedPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive_burst(&mut self, pool: &BufferPool, burst: &mut Burst, max: usize) -> usize {
        let mut frames: VecDeque<Vec<u8>> = match self.script.pop_front() {
            Some(frames) => frames.into(),
            None => return 0,
        };

        let mut received = 0;
        while received < max {
            let Some(frame) = frames.pop_front() else { break };
            let Some(mut buf) = pool.try_acquire() else {
                frames.push_front(frame);
                break;
            };
            buf.fill(&frame, frame.len(), Timeval::now());
            burst.push(buf);
            received += 1;
        }

        if !frames.is_empty() {
            self.script.push_front(frames.into());
        }
        received
    }

    fn transmit(&mut self, buf: PacketBuf) -> Result<(), PacketBuf> {
        let mut calls = self.log.calls.lock();
        calls.attempts += 1;
        if self.fail_transmit {
            return Err(buf);
        }
        calls.in_flight.push(buf);
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.finite && self.script.is_empty()
    }
}
