use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use crossbeam_queue::ArrayQueue;

use crate::packet::Timeval;

/// Default data room per slot, enough for a full Ethernet frame.
pub const DEFAULT_SLOT_SIZE: usize = 2048;

/// Default number of slots.
pub const DEFAULT_POOL_SIZE: usize = 8191;

/// Fixed-capacity pool of pre-allocated packet buffers.
///
/// Every slot is allocated up front. A slot handed out as a [`PacketBuf`]
/// goes back to the pool when the handle is dropped, whichever thread drops
/// it, so the pool can be shared by the receive path and a transmit path.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: ArrayQueue<Box<[u8]>>,
    slot_size: usize,
    in_use: AtomicUsize,
    exhausted: AtomicU64,
}

impl BufferPool {
    pub fn new(capacity: usize, slot_size: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("buffer pool capacity must be non-zero"));
        }
        if slot_size == 0 {
            return Err(anyhow!("buffer pool slot size must be non-zero"));
        }

        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let mut slot = Vec::new();
            slot.try_reserve_exact(slot_size)
                .map_err(|e| anyhow!("failed to allocate {} byte slot: {}", slot_size, e))?;
            slot.resize(slot_size, 0);

            if free.push(slot.into_boxed_slice()).is_err() {
                return Err(anyhow!("buffer pool overfilled during allocation"));
            }
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                free,
                slot_size,
                in_use: AtomicUsize::new(0),
                exhausted: AtomicU64::new(0),
            }),
        })
    }

    /// Take a free slot, or `None` when every slot is outstanding.
    pub fn try_acquire(&self) -> Option<PacketBuf> {
        match self.inner.free.pop() {
            Some(data) => {
                self.inner.in_use.fetch_add(1, Ordering::Relaxed);
                Some(PacketBuf {
                    data: Some(data),
                    len: 0,
                    wire_len: 0,
                    timestamp: Timeval::default(),
                    pool: Arc::clone(&self.inner),
                })
            }
            None => {
                self.inner.exhausted.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn slot_size(&self) -> usize {
        self.inner.slot_size
    }

    pub fn get_stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.free.capacity(),
            available: self.inner.free.len(),
            in_use: self.inner.in_use.load(Ordering::Relaxed),
            exhausted: self.inner.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl PoolInner {
    fn give_back(&self, data: Box<[u8]>) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        // Cannot overflow: only slots taken from this queue come back.
        let _ = self.free.push(data);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,   // Slots allocated at creation
    pub available: usize,  // Slots sitting in the pool
    pub in_use: usize,     // Slots held by receive/transmit paths
    pub exhausted: u64,    // Acquire attempts that found the pool empty
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.in_use as f64 / self.capacity as f64) * 100.0
        }
    }
}

/// One captured frame living in a pool slot.
///
/// Exactly one of two things ends a buffer's life: it is handed to a
/// transmit path, or it is released (dropped) back to the pool.
pub struct PacketBuf {
    data: Option<Box<[u8]>>,
    len: usize,
    wire_len: usize,
    timestamp: Timeval,
    pool: Arc<PoolInner>,
}

impl PacketBuf {
    /// Copy a captured frame into the slot, truncating to the slot size.
    /// `wire_len` is the frame's length on the wire, which a snaplen may
    /// already have cut `frame` short of.
    pub fn fill(&mut self, frame: &[u8], wire_len: usize, timestamp: Timeval) {
        if let Some(slot) = self.data.as_mut() {
            let captured = frame.len().min(slot.len());
            slot[..captured].copy_from_slice(&frame[..captured]);
            self.len = captured;
        }
        self.wire_len = wire_len.max(frame.len());
        self.timestamp = timestamp;
    }

    pub fn data(&self) -> &[u8] {
        match self.data.as_ref() {
            Some(slot) => &slot[..self.len],
            None => &[],
        }
    }

    /// Captured length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn wire_len(&self) -> usize {
        self.wire_len
    }

    /// Part of the frame never made it into the slot.
    pub fn is_truncated(&self) -> bool {
        self.len < self.wire_len
    }

    pub fn timestamp(&self) -> Timeval {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: Timeval) {
        self.timestamp = timestamp;
    }

    /// Give the slot back to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.give_back(data);
        }
    }
}

impl std::fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuf")
            .field("len", &self.len)
            .field("wire_len", &self.wire_len)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
