use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::flow::FlowStats;
use crate::shutdown::ShutdownToken;

pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Cumulative counters written by the dispatch loop and read by the
/// reporter. One writer, any number of readers; every field is an atomic
/// so a reader never sees a torn value.
#[derive(Default)]
pub struct Accounting {
    packets: CachePadded<AtomicU64>,
    bytes: CachePadded<AtomicU64>,
    active_flows: AtomicU64,
    flows: AtomicU64,
    errors: AtomicU64,
}

impl Accounting {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn record_packet(&self, accounted_bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(accounted_bytes, Ordering::Relaxed);
    }

    /// Copy the engine's counters out so readers never touch the engine.
    pub fn publish_flow_stats(&self, stats: FlowStats) {
        self.active_flows.store(stats.active_flows, Ordering::Relaxed);
        self.flows.store(stats.flows, Ordering::Relaxed);
        self.errors.store(stats.errors(), Ordering::Relaxed);
    }

    /// Each field is loaded on its own, so packets and bytes in one
    /// snapshot may be a few frames apart. Deltas between snapshots still
    /// add up.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            active_flows: self.active_flows.load(Ordering::Relaxed),
            flows: self.flows.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub active_flows: u64,
    pub flows: u64,
    pub errors: u64,
}

/// Rates between two snapshots: (Mpps, Gbps).
pub fn throughput(previous: &StatsSnapshot, current: &StatsSnapshot, elapsed: Duration) -> (f64, f64) {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return (0.0, 0.0);
    }

    let packet_delta = current.packets.saturating_sub(previous.packets) as f64;
    let byte_delta = current.bytes.saturating_sub(previous.bytes) as f64;

    let mpps = packet_delta / secs / 1_000_000.0;
    let gbps = byte_delta * 8.0 / secs / 1_000_000_000.0;
    (mpps, gbps)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputReport {
    pub snapshot: StatsSnapshot,
    pub mpps: f64,
    pub gbps: f64,
}

impl fmt::Display for ThroughputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ActFlows: {}\tTotFlows: {}\tErrors:   {}\tPackets:  {}\tBytes:    {}\tThroughput: {:.6} Mpps ({:.6} Gbps)",
            self.snapshot.active_flows,
            self.snapshot.flows,
            self.snapshot.errors,
            self.snapshot.packets,
            self.snapshot.bytes,
            self.mpps,
            self.gbps
        )
    }
}

/// Periodic throughput line. Reads counters through [`Accounting`] only.
pub struct StatsReporter {
    accounting: Arc<Accounting>,
    previous: Option<(Instant, StatsSnapshot)>,
}

impl StatsReporter {
    pub fn new(accounting: Arc<Accounting>) -> Self {
        Self {
            accounting,
            previous: None,
        }
    }

    /// Take a snapshot at `now`. The first call only records the baseline.
    pub fn tick(&mut self, now: Instant) -> Option<ThroughputReport> {
        let current = self.accounting.snapshot();
        let report = self.previous.map(|(last_time, last)| {
            let (mpps, gbps) = throughput(&last, &current, now.saturating_duration_since(last_time));
            ThroughputReport {
                snapshot: current,
                mpps,
                gbps,
            }
        });

        self.previous = Some((now, current));
        report
    }

    /// Fire every [`STATS_INTERVAL`] until shutdown. Ticks never overlap:
    /// the next one is only awaited after the previous line is written.
    pub async fn run<W: Write>(mut self, shutdown: ShutdownToken, mut out: W) {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if !shutdown.is_running() {
                break;
            }

            if let Some(report) = self.tick(tokio::time::Instant::now().into_std()) {
                if let Err(e) = writeln!(out, "{}", report) {
                    warn!("Failed to write stats: {}", e);
                }
            }
        }

        debug!("Stats reporter stopped");
    }
}
