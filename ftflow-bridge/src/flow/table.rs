use std::collections::HashMap;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::export::FlowExporter;
use crate::flow::parse::{self, PacketInfo};
use crate::flow::{Action, Direction, FlowEngine, FlowKey, FlowRecord, FlowStats, FlowValue, L7Protocol};
use crate::packet::Timeval;

const TCP_FIN: u8 = 0x01;
const TCP_RST: u8 = 0x04;

pub const DEFAULT_IDLE_TIMEOUT: u64 = 30;
pub const DEFAULT_LIFETIME_TIMEOUT: u64 = 120;
pub const DEFAULT_MAX_FLOWS: usize = 65536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowTableConfig {
    /// Attach a port-based L7 guess to new flows
    pub dpi: bool,
    /// Seconds without traffic before a flow expires
    pub idle_timeout: u64,
    /// Seconds since the first packet before a flow is exported regardless
    pub lifetime_timeout: u64,
    pub max_flows: usize,
    /// Flows classified as one of these get `Action::Discard`
    pub discard: Vec<L7Protocol>,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        Self {
            dpi: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            lifetime_timeout: DEFAULT_LIFETIME_TIMEOUT,
            max_flows: DEFAULT_MAX_FLOWS,
            discard: Vec::new(),
        }
    }
}

struct FlowEntry {
    value: FlowValue,
    action: Action,
    fin_seen: [bool; 2],
    reset: bool,
}

impl FlowEntry {
    fn new(l7_protocol: L7Protocol, action: Action) -> Self {
        Self {
            value: FlowValue {
                l7_protocol,
                ..Default::default()
            },
            action,
            fin_seen: [false; 2],
            reset: false,
        }
    }

    fn update(&mut self, direction: Direction, bytes: usize, timestamp: Timeval, tcp_flags: u8) {
        self.value.direction[direction as usize].update(bytes, timestamp, tcp_flags);
        if tcp_flags & TCP_FIN != 0 {
            self.fin_seen[direction as usize] = true;
        }
        if tcp_flags & TCP_RST != 0 {
            self.reset = true;
        }
    }

    /// Both sides sent FIN, or either side reset.
    fn is_closed(&self) -> bool {
        self.reset || (self.fin_seen[0] && self.fin_seen[1])
    }
}

/// In-process flow table keyed by bidirectional 5-tuple.
pub struct FlowTable {
    config: FlowTableConfig,
    flows: HashMap<FlowKey, FlowEntry>,
    exporter: Option<Box<dyn FlowExporter + Send>>,
    total_flows: u64,
    err_no_room: u64,
    err_no_mem: u64,
    last_housekeeping: Option<u64>,
}

impl FlowTable {
    pub fn new(config: FlowTableConfig) -> Result<Self> {
        if config.max_flows == 0 {
            return Err(anyhow!("flow table needs room for at least one flow"));
        }

        info!(
            "Flow table created: max {} flows, idle timeout {}s, lifetime {}s, L7 {}",
            config.max_flows,
            config.idle_timeout,
            config.lifetime_timeout,
            if config.dpi { "enabled" } else { "disabled" }
        );

        Ok(Self {
            config,
            flows: HashMap::new(),
            exporter: None,
            total_flows: 0,
            err_no_room: 0,
            err_no_mem: 0,
            last_housekeeping: None,
        })
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Find the stored orientation of `key`, or make room for a new flow.
    /// `None` means the flow cannot be tracked.
    fn locate(&mut self, key: FlowKey) -> Option<(FlowKey, Direction)> {
        if self.flows.contains_key(&key) {
            return Some((key, Direction::ClientToServer));
        }

        let reversed = key.reversed();
        if self.flows.contains_key(&reversed) {
            return Some((reversed, Direction::ServerToClient));
        }

        if self.flows.len() >= self.config.max_flows {
            self.err_no_room += 1;
            return None;
        }

        if let Err(e) = self.flows.try_reserve(1) {
            self.err_no_mem += 1;
            warn!("Flow table allocation failed: {}", e);
            return None;
        }

        Some((key, Direction::ClientToServer))
    }

    fn expire(&mut self, now: u64) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let lifetime_timeout = self.config.lifetime_timeout;

        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, entry)| {
                let idle = now.saturating_sub(entry.value.last_seen().sec) >= idle_timeout;
                let aged = now.saturating_sub(entry.value.first_seen().sec) >= lifetime_timeout;
                idle || aged || entry.is_closed()
            })
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            if let Some(entry) = self.flows.remove(key) {
                export(&mut self.exporter, *key, entry.value);
            }
        }

        expired.len()
    }
}

fn export(exporter: &mut Option<Box<dyn FlowExporter + Send>>, key: FlowKey, value: FlowValue) {
    match exporter.as_mut() {
        Some(exporter) => exporter.export(FlowRecord { key, value }),
        None => debug!("No exporter registered, dropping flow {:?}", key),
    }
}

impl FlowEngine for FlowTable {
    fn process(&mut self, frame: &[u8], timestamp: Timeval) -> Action {
        let PacketInfo { key, tcp_flags } = match parse::extract(frame) {
            Some(info) => info,
            None => return Action::Forward,
        };

        let (key, direction) = match self.locate(key) {
            Some(found) => found,
            None => return Action::Forward,
        };

        let dpi = self.config.dpi;
        let discard = &self.config.discard;
        let mut created = false;
        let entry = self.flows.entry(key).or_insert_with(|| {
            created = true;
            let l7 = if dpi {
                L7Protocol::guess(key.protocol, key.sport, key.dport)
            } else {
                L7Protocol::Unknown
            };
            let action = if discard.contains(&l7) { Action::Discard } else { Action::Forward };
            FlowEntry::new(l7, action)
        });

        entry.update(direction, frame.len(), timestamp, tcp_flags);
        let action = entry.action;

        if created {
            self.total_flows += 1;
        }
        action
    }

    fn housekeeping(&mut self, now: u64) {
        // Expiry works in whole seconds; one scan per second is enough
        if self.last_housekeeping == Some(now) {
            return;
        }
        self.last_housekeeping = Some(now);

        let expired = self.expire(now);
        if expired > 0 {
            debug!("Housekeeping expired {} flows, {} active", expired, self.flows.len());
        }
    }

    fn flush(&mut self) {
        let count = self.flows.len();
        for (key, entry) in self.flows.drain() {
            export(&mut self.exporter, key, entry.value);
        }
        debug!("Flushed {} flows", count);
    }

    fn stats(&self) -> FlowStats {
        FlowStats {
            active_flows: self.flows.len() as u64,
            flows: self.total_flows,
            err_no_room: self.err_no_room,
            err_no_mem: self.err_no_mem,
        }
    }

    fn set_exporter(&mut self, exporter: Box<dyn FlowExporter + Send>) {
        self.exporter = Some(exporter);
    }

    fn destroy(self) {
        let stats = self.stats();
        info!(
            "Flow table destroyed: {} flows seen, {} still resident, {} errors",
            stats.flows,
            stats.active_flows,
            stats.errors()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{frames, CollectingExporter};

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];

    fn table_with(config: FlowTableConfig) -> (FlowTable, CollectingExporter) {
        let mut table = FlowTable::new(config).unwrap();
        let exporter = CollectingExporter::default();
        table.set_exporter(Box::new(exporter.clone()));
        (table, exporter)
    }

    #[test]
    fn test_both_directions_share_a_flow() {
        let (mut table, exporter) = table_with(FlowTableConfig::default());

        let syn = frames::tcp_v4(CLIENT, SERVER, 40000, 80, 0x02, 0);
        let syn_ack = frames::tcp_v4(SERVER, CLIENT, 80, 40000, 0x12, 0);
        let data = frames::tcp_v4(CLIENT, SERVER, 40000, 80, 0x18, 100);

        assert_eq!(table.process(&syn, Timeval::new(100, 1)), Action::Forward);
        assert_eq!(table.process(&syn_ack, Timeval::new(100, 2)), Action::Forward);
        assert_eq!(table.process(&data, Timeval::new(100, 3)), Action::Forward);
        assert_eq!(table.len(), 1);

        table.flush();
        let records = exporter.records();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.key.sport, 40000);
        assert_eq!(record.value.c2s().packets, 2);
        assert_eq!(record.value.c2s().bytes, (syn.len() + data.len()) as u64);
        assert_eq!(record.value.s2c().packets, 1);
        assert_eq!(record.value.c2s().first, Timeval::new(100, 1));
        assert_eq!(record.value.c2s().last, Timeval::new(100, 3));
        assert_eq!(record.value.tcp_flags(), 0x1A);
        assert!(table.is_empty());
    }

    #[test]
    fn test_idle_flows_expire() {
        let config = FlowTableConfig { idle_timeout: 10, ..Default::default() };
        let (mut table, exporter) = table_with(config);

        table.process(&frames::udp_v4(CLIENT, SERVER, 5000, 53, 20), Timeval::new(1000, 0));
        table.process(&frames::udp_v4(CLIENT, SERVER, 5001, 53, 20), Timeval::new(1008, 0));

        table.housekeeping(1009);
        assert_eq!(exporter.records().len(), 0);

        table.housekeeping(1010);
        assert_eq!(exporter.records().len(), 1);
        assert_eq!(exporter.records()[0].key.sport, 5000);
        assert_eq!(table.stats().active_flows, 1);
    }

    #[test]
    fn test_long_lived_flows_hit_lifetime() {
        let config = FlowTableConfig { idle_timeout: 30, lifetime_timeout: 60, ..Default::default() };
        let (mut table, exporter) = table_with(config);
        let frame = frames::udp_v4(CLIENT, SERVER, 5000, 9999, 20);

        for t in (0..=60).step_by(10) {
            table.process(&frame, Timeval::new(2000 + t, 0));
            table.housekeeping(2000 + t);
        }

        assert_eq!(exporter.records().len(), 1);
        assert_eq!(exporter.records()[0].value.c2s().packets, 7);
    }

    #[test]
    fn test_closed_tcp_flows_exported_on_next_pass() {
        let (mut table, exporter) = table_with(FlowTableConfig::default());

        table.process(&frames::tcp_v4(CLIENT, SERVER, 40000, 80, 0x11, 0), Timeval::new(50, 0));
        table.housekeeping(50);
        assert!(exporter.records().is_empty());

        table.process(&frames::tcp_v4(SERVER, CLIENT, 80, 40000, 0x11, 0), Timeval::new(50, 10));
        table.process(&frames::tcp_v4(CLIENT, SERVER, 40001, 80, 0x04, 0), Timeval::new(50, 20));
        table.housekeeping(51);

        assert_eq!(exporter.records().len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_housekeeping_runs_once_per_second() {
        let config = FlowTableConfig { idle_timeout: 0, ..Default::default() };
        let (mut table, exporter) = table_with(config);

        table.housekeeping(300);
        table.process(&frames::udp_v4(CLIENT, SERVER, 1, 2, 0), Timeval::new(300, 0));
        table.housekeeping(300);
        assert!(exporter.records().is_empty());

        table.housekeeping(301);
        assert_eq!(exporter.records().len(), 1);
    }

    #[test]
    fn test_full_table_counts_no_room() {
        let config = FlowTableConfig { max_flows: 2, ..Default::default() };
        let (mut table, _exporter) = table_with(config);

        for sport in 1..=4 {
            let action = table.process(&frames::udp_v4(CLIENT, SERVER, sport, 53, 0), Timeval::new(1, 0));
            assert_eq!(action, Action::Forward);
        }
        // Existing flows keep updating when full
        table.process(&frames::udp_v4(SERVER, CLIENT, 53, 1, 0), Timeval::new(1, 0));

        let stats = table.stats();
        assert_eq!(stats.active_flows, 2);
        assert_eq!(stats.flows, 2);
        assert_eq!(stats.err_no_room, 2);
        assert_eq!(stats.errors(), 2);
    }

    #[test]
    fn test_discard_filter_applies_to_whole_flow() {
        let config = FlowTableConfig {
            dpi: true,
            discard: vec![L7Protocol::Dns],
            ..Default::default()
        };
        let (mut table, exporter) = table_with(config);

        let query = frames::udp_v4(CLIENT, SERVER, 5353, 53, 30);
        let answer = frames::udp_v4(SERVER, CLIENT, 53, 5353, 80);
        let web = frames::tcp_v4(CLIENT, SERVER, 40000, 443, 0x02, 0);

        assert_eq!(table.process(&query, Timeval::new(1, 0)), Action::Discard);
        assert_eq!(table.process(&answer, Timeval::new(1, 1)), Action::Discard);
        assert_eq!(table.process(&web, Timeval::new(1, 2)), Action::Forward);

        table.flush();
        let mut names: Vec<_> = exporter.records().iter().map(|r| r.value.l7_protocol.name()).collect();
        names.sort();
        assert_eq!(names, vec!["DNS", "TLS"]);
    }

    #[test]
    fn test_l7_unknown_without_dpi() {
        let (mut table, exporter) = table_with(FlowTableConfig::default());
        table.process(&frames::tcp_v4(CLIENT, SERVER, 40000, 443, 0x02, 0), Timeval::new(1, 0));
        table.flush();
        assert_eq!(exporter.records()[0].value.l7_protocol, L7Protocol::Unknown);
    }

    #[test]
    fn test_non_ip_and_garbage_forwarded_untracked() {
        let (mut table, _exporter) = table_with(FlowTableConfig::default());

        assert_eq!(table.process(&[], Timeval::new(1, 0)), Action::Forward);
        assert_eq!(table.process(&[0xFF; 7], Timeval::new(1, 0)), Action::Forward);
        assert_eq!(table.process(&frames::arp(), Timeval::new(1, 0)), Action::Forward);
        assert!(table.is_empty());
        assert_eq!(table.stats(), FlowStats::default());
    }

    #[test]
    fn test_flush_exports_each_flow_once() {
        let (mut table, exporter) = table_with(FlowTableConfig::default());
        for sport in 0..50 {
            table.process(&frames::udp_v4(CLIENT, SERVER, 10000 + sport, 9000, 4), Timeval::new(1, 0));
        }

        table.flush();
        table.flush();

        let mut ports: Vec<u16> = exporter.records().iter().map(|r| r.key.sport).collect();
        ports.sort();
        ports.dedup();
        assert_eq!(exporter.records().len(), 50);
        assert_eq!(ports.len(), 50);
        assert_eq!(table.stats().flows, 50);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = FlowTableConfig { max_flows: 0, ..Default::default() };
        assert!(FlowTable::new(config).is_err());
    }
}
