use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp with microsecond resolution, as carried in pcap
/// headers and flow records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timeval {
    pub sec: u64,
    pub usec: u32,
}

impl Timeval {
    pub fn new(sec: u64, usec: u32) -> Self {
        Self { sec, usec }
    }

    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        Self {
            sec: since_epoch.as_secs(),
            usec: since_epoch.subsec_micros(),
        }
    }
}

impl fmt::Display for Timeval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

/// Current wall-clock time in whole seconds, the resolution housekeeping
/// works at.
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
