//! Heap limiting for the V8 isolate.
//!
//! The isolate is created with a heap cap; near that cap V8 calls back into
//! [`near_heap_limit`], which terminates execution and grants a little
//! headroom so the termination can unwind instead of aborting the process.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};

use deno_core::v8;

/// Extra heap granted once the limit is hit.
const GRACE_BYTES: usize = 1024 * 1024;

/// Shared with the near-heap-limit callback.
pub struct HeapLimiter {
    handle: v8::IsolateHandle,
    max_heap_size: usize,
    limit_exceeded: AtomicBool,
}

impl HeapLimiter {
    pub fn new(handle: v8::IsolateHandle, max_heap_size: usize) -> Self {
        Self {
            handle,
            max_heap_size,
            limit_exceeded: AtomicBool::new(false),
        }
    }

    /// Check if the heap limit was reached.
    pub fn limit_exceeded(&self) -> bool {
        self.limit_exceeded.load(Ordering::SeqCst)
    }

    /// Get the configured heap limit.
    pub fn max_heap_size(&self) -> usize {
        self.max_heap_size
    }

    fn trip(&self) {
        if !self.limit_exceeded.swap(true, Ordering::SeqCst) {
            self.handle.terminate_execution();
        }
    }
}

extern "C" fn near_heap_limit(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` is the `HeapLimiter` boxed inside a `HeapGuard`, which
    // removes this callback before the box is dropped. V8 calls back only on
    // the isolate's own thread while the guard is alive.
    let limiter = unsafe { &*(data as *const HeapLimiter) };
    limiter.trip();
    current_heap_limit + GRACE_BYTES
}

/// Installs the callback for as long as it lives. Call [`HeapGuard::uninstall`]
/// before the isolate is dropped.
pub struct HeapGuard {
    limiter: Box<HeapLimiter>,
    installed: bool,
}

impl HeapGuard {
    pub fn install(isolate: &mut v8::Isolate, max_heap_size: usize) -> Self {
        let limiter = Box::new(HeapLimiter::new(isolate.thread_safe_handle(), max_heap_size));
        isolate.add_near_heap_limit_callback(
            near_heap_limit,
            &*limiter as *const HeapLimiter as *mut c_void,
        );
        Self {
            limiter,
            installed: true,
        }
    }

    pub fn limit_exceeded(&self) -> bool {
        self.limiter.limit_exceeded()
    }

    pub fn limiter(&self) -> &HeapLimiter {
        &self.limiter
    }

    /// Remove the callback. Idempotent.
    pub fn uninstall(&mut self, isolate: &mut v8::Isolate) {
        if self.installed {
            isolate.remove_near_heap_limit_callback(near_heap_limit, 0);
            self.installed = false;
        }
    }
}

/// Bytes currently in use on the isolate's heap.
pub fn used_heap_bytes(isolate: &mut v8::Isolate) -> usize {
    let mut stats = v8::HeapStatistics::default();
    isolate.get_heap_statistics(&mut stats);
    stats.used_heap_size()
}

/// Signed difference between two heap readings.
pub fn heap_delta(before: usize, after: usize) -> i64 {
    let before = i64::try_from(before).unwrap_or(i64::MAX);
    let after = i64::try_from(after).unwrap_or(i64::MAX);
    after.saturating_sub(before)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_delta_signs() {
        assert_eq!(heap_delta(100, 150), 50);
        assert_eq!(heap_delta(150, 100), -50);
        assert_eq!(heap_delta(0, 0), 0);
    }
}
