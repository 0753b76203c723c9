use std::io::Write;

use tracing::{debug, warn};

use crate::flow::{DirectionStats, FlowRecord};

/// Receives each flow exactly once when it leaves the table.
///
/// Called synchronously from inside the engine's housekeeping or flush. An
/// exporter is never given access to the engine, so it cannot re-enter it.
pub trait FlowExporter {
    fn export(&mut self, record: FlowRecord);
}

/// Writes one `[Flow] ...` line per record.
pub struct LineExporter<W: Write> {
    out: W,
    exported: u64,
    write_errors: u64,
}

impl<W: Write> LineExporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            exported: 0,
            write_errors: 0,
        }
    }

    pub fn exported(&self) -> u64 {
        self.exported
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }
}

impl<W: Write> Drop for LineExporter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!("Failed to flush flow records: {}", e);
        }
        match self.write_errors() {
            0 => debug!("Exported {} flow records", self.exported()),
            failed => warn!("{} of {} flow records could not be written", failed, self.exported()),
        }
    }
}

impl<W: Write> FlowExporter for LineExporter<W> {
    fn export(&mut self, record: FlowRecord) {
        let line = format_flow(&record);
        self.exported += 1;

        if let Err(e) = writeln!(self.out, "{}", line) {
            self.write_errors += 1;
            // Only the first failure is worth a log line
            if self.write_errors == 1 {
                warn!("Failed to write flow record: {}", e);
            }
        }
        // record dropped here, ending the flow's lifetime
    }
}

/// Human-readable rendering of a flow record.
pub fn format_flow(record: &FlowRecord) -> String {
    let key = &record.key;
    let value = &record.value;

    format!(
        "[Flow] srcIp: {}, dstIp: {}, srcPort: {}, dstPort: {}, protocol: {}, tcpFlags: 0x{:02X}, l7: {}, c2s: {}, s2c: {}",
        key.src,
        key.dst,
        key.sport,
        key.dport,
        key.protocol,
        value.tcp_flags(),
        value.l7_protocol.name(),
        format_direction(value.c2s()),
        format_direction(value.s2c()),
    )
}

fn format_direction(stats: &DirectionStats) -> String {
    format!(
        "{{ Packets: {}, Bytes: {}, First: {}, Last: {} }}",
        stats.packets, stats.bytes, stats.first, stats.last
    )
}
