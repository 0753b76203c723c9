use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const STOPPED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Draining,
    Stopped,
}

/// Shared cancellation state: RUNNING → DRAINING → STOPPED.
///
/// Signal handlers call [`trigger`](Self::trigger); the dispatch loop checks
/// [`is_running`](Self::is_running) once per iteration, never mid-burst.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    state: Arc<AtomicU8>,
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(RUNNING)),
        }
    }

    /// Request shutdown. Returns `true` only for the call that actually
    /// moved RUNNING to DRAINING; repeats are no-ops.
    pub fn trigger(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Teardown is complete.
    pub fn mark_stopped(&self) {
        self.state.store(STOPPED, Ordering::Release);
    }

    pub fn state(&self) -> RunState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => RunState::Running,
            DRAINING => RunState::Draining,
            _ => RunState::Stopped,
        }
    }
}
