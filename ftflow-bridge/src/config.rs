use std::fmt;
use std::path::PathBuf;

use clap::Parser;

use crate::dispatch::DispatchOptions;
use crate::flow::table::{DEFAULT_IDLE_TIMEOUT, DEFAULT_LIFETIME_TIMEOUT, DEFAULT_MAX_FLOWS};
use crate::flow::{FlowTableConfig, L7Protocol};
use crate::high_performance::memory_pool::{DEFAULT_POOL_SIZE, DEFAULT_SLOT_SIZE};
use crate::port::PortConfig;

const MIN_SNAPLEN: usize = 64;
const MAX_SNAPLEN: usize = 65535;

#[derive(Parser, Debug)]
#[command(name = "ftflow-bridge")]
#[command(about = "Capture or bridge packets between two ports while tracking flows")]
pub struct Args {
    /// Interface(s) to capture on (comma-separated, two = bridge mode)
    #[arg(short, long)]
    pub ports: Option<String>,

    /// Replay a pcap file instead of capturing from a live port
    #[arg(short, long)]
    pub read: Option<PathBuf>,

    /// Enable L7 protocol guessing
    #[arg(short = '7', long, default_value = "false")]
    pub dpi: bool,

    /// Capture accounting only, no flow tracking
    #[arg(short = '0', long, default_value = "false")]
    pub no_flows: bool,

    /// Hex-dump every packet to stdout
    #[arg(short, long, default_value = "false")]
    pub verbose: bool,

    /// L7 protocols to drop instead of forwarding (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub discard: Vec<String>,

    /// Seconds without traffic before a flow is exported
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT)]
    pub idle_timeout: u64,

    /// Seconds after its first packet before a flow is exported
    #[arg(long, default_value_t = DEFAULT_LIFETIME_TIMEOUT)]
    pub lifetime_timeout: u64,

    /// Flow table capacity
    #[arg(long, default_value_t = DEFAULT_MAX_FLOWS)]
    pub max_flows: usize,

    /// Packet buffer pool slots
    #[arg(long, default_value_t = DEFAULT_POOL_SIZE)]
    pub pool_size: usize,

    /// Bytes captured per frame, also the size of each pool slot. Longer
    /// frames are counted in full but never forwarded.
    #[arg(long, default_value_t = DEFAULT_SLOT_SIZE)]
    pub snaplen: usize,

    /// Pin the dispatch thread to this CPU core
    #[arg(long)]
    pub core: Option<usize>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Live { primary: String, twin: Option<String> },
    Offline(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub source: Source,
    pub dispatch: DispatchOptions,
    pub flow_table: FlowTableConfig,
    pub port: PortConfig,
    pub pool_size: usize,
    pub slot_size: usize,
    pub core: Option<usize>,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoSource,
    ConflictingSources,
    EmptyPortName,
    TooManyPorts(usize),
    SamePortTwice(String),
    UnknownProtocol(String),
    ZeroPoolSize,
    ZeroMaxFlows,
    InvalidSnaplen(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoSource => write!(f, "Either --ports or --read must be specified"),
            ConfigError::ConflictingSources => write!(f, "--ports and --read are mutually exclusive"),
            ConfigError::EmptyPortName => write!(f, "Empty port name in --ports"),
            ConfigError::TooManyPorts(n) => write!(f, "At most 2 ports can be specified, got {}", n),
            ConfigError::SamePortTwice(name) => write!(f, "Cannot bridge port {} to itself", name),
            ConfigError::UnknownProtocol(err) => write!(f, "Invalid --discard entry: {}", err),
            ConfigError::ZeroPoolSize => write!(f, "--pool-size must be at least 1"),
            ConfigError::ZeroMaxFlows => write!(f, "--max-flows must be at least 1"),
            ConfigError::InvalidSnaplen(n) => {
                write!(f, "--snaplen must be between {} and {}, got {}", MIN_SNAPLEN, MAX_SNAPLEN, n)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl TryFrom<Args> for Config {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let source = match (args.ports, args.read) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingSources),
            (None, None) => return Err(ConfigError::NoSource),
            (None, Some(path)) => Source::Offline(path),
            (Some(ports), None) => parse_ports(&ports)?,
        };

        if args.pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        if args.max_flows == 0 {
            return Err(ConfigError::ZeroMaxFlows);
        }
        if !(MIN_SNAPLEN..=MAX_SNAPLEN).contains(&args.snaplen) {
            return Err(ConfigError::InvalidSnaplen(args.snaplen));
        }

        let discard = args
            .discard
            .iter()
            .map(|name| name.parse::<L7Protocol>().map_err(ConfigError::UnknownProtocol))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Config {
            source,
            dispatch: DispatchOptions {
                compute_flows: !args.no_flows,
                verbose: args.verbose,
            },
            flow_table: FlowTableConfig {
                dpi: args.dpi,
                idle_timeout: args.idle_timeout,
                lifetime_timeout: args.lifetime_timeout,
                max_flows: args.max_flows,
                discard,
            },
            port: PortConfig {
                snaplen: args.snaplen as i32,
                ..PortConfig::default()
            },
            pool_size: args.pool_size,
            slot_size: args.snaplen,
            core: args.core,
            log_level: args.log_level,
        })
    }
}

fn parse_ports(list: &str) -> Result<Source, ConfigError> {
    let names: Vec<&str> = list.split(',').map(str::trim).collect();
    if names.iter().any(|name| name.is_empty()) {
        return Err(ConfigError::EmptyPortName);
    }

    match names.as_slice() {
        [primary] => Ok(Source::Live { primary: primary.to_string(), twin: None }),
        [primary, twin] if primary == twin => Err(ConfigError::SamePortTwice(primary.to_string())),
        [primary, twin] => Ok(Source::Live {
            primary: primary.to_string(),
            twin: Some(twin.to_string()),
        }),
        _ => Err(ConfigError::TooManyPorts(names.len())),
    }
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        Self::try_from(args)
    }

    pub fn is_bridge(&self) -> bool {
        matches!(self.source, Source::Live { twin: Some(_), .. })
    }
}
