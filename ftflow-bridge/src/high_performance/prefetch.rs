use crate::high_performance::PacketBuf;

/// Hint the CPU to pull the first `count` frames of a burst into cache.
/// A no-op where the architecture has no prefetch intrinsic.
#[inline]
pub fn prefetch_frames(burst: &[PacketBuf], count: usize) {
    for buf in burst.iter().take(count) {
        prefetch(buf.data());
    }
}

#[inline]
fn prefetch(data: &[u8]) {
    if data.is_empty() {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        // SSE is part of the x86_64 baseline; prefetch never faults.
        #[allow(unused_unsafe)]
        unsafe {
            _mm_prefetch::<_MM_HINT_T0>(data.as_ptr() as *const i8);
        }
    }
}
