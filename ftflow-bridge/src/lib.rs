pub mod config;
pub mod dispatch;
pub mod export;
pub mod flow;
pub mod high_performance;
pub mod packet;
pub mod port;
pub mod shutdown;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::{DispatchOptions, Dispatcher, BURST_SIZE, FRAME_OVERHEAD_BYTES};
pub use export::{FlowExporter, LineExporter};
pub use flow::{Action, FlowEngine, FlowKey, FlowRecord, FlowStats, FlowTable, FlowTableConfig, FlowValue};
pub use high_performance::{BufferPool, PacketBuf};
pub use packet::Timeval;
pub use port::{PcapPort, Port, PortConfig};
pub use shutdown::{RunState, ShutdownToken};
pub use stats::{Accounting, StatsReporter, StatsSnapshot};
