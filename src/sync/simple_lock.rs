// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Uncontended-fast-path mutex in shared memory.
// Three states: 0 unlocked, 1 locked, 2 locked with waiters. The contended
// release wakes exactly one waiter. An acquire-with-callback variant lets
// the caller bail out of the wait on a higher-level condition (used by the
// allocator while waiting for the superblock lock during region growth).

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::platform;
use crate::status::Status;

/// A cross-process mutex with an uncontended fast path.
///
/// Heap locks and the superblock lock are the only users; the nesting order
/// (heap → superblock) is fixed in the allocator.
#[repr(C)]
pub struct SimpleLock {
    state: AtomicU32,
    owner: AtomicI32, // thread id, for owned() and diagnostics
    contention_count: AtomicI32,
    wait_count: AtomicI32,
    wake_count: AtomicI32,
    /// Ticks spent inside contended waits, low and high words.
    contention_duration: AtomicU32,
    contention_duration_high: AtomicU32,
}

impl SimpleLock {
    pub fn init(&self) {
        self.state.store(0, Ordering::Release);
        self.owner.store(0, Ordering::Release);
        self.contention_count.store(0, Ordering::Relaxed);
        self.wait_count.store(0, Ordering::Relaxed);
        self.wake_count.store(0, Ordering::Relaxed);
        self.contention_duration.store(0, Ordering::Relaxed);
        self.contention_duration_high.store(0, Ordering::Relaxed);
    }

    /// Try the fast path only.
    pub fn try_acquire(&self) -> bool {
        let ok = self
            .state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            self.owner
                .store(platform::current_thread_id(), Ordering::Relaxed);
        } else {
            self.contention_count.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Acquire, invoking `cancel` after each wake-up on the contended path.
    /// A non-`Invalid` status from the callback abandons the acquisition
    /// and is returned to the caller.
    pub fn acquire_with<F>(&self, mut cancel: F) -> Status
    where
        F: FnMut() -> Status,
    {
        let fast = self
            .state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !fast {
            self.contention_count.fetch_add(1, Ordering::Relaxed);
            let started = platform::monotonic_ticks();
            let mut old = self.state.swap(2, Ordering::AcqRel);
            while old != 0 {
                self.wait_count.fetch_add(1, Ordering::Relaxed);
                platform::wait_on_u32(&self.state, 2, 2000);
                let r = cancel();
                if r != Status::Invalid {
                    return r;
                }
                old = self.state.swap(2, Ordering::AcqRel);
            }
            let waited = platform::monotonic_ticks().wrapping_sub(started);
            let low = (waited & 0xFFFF_FFFF) as u32;
            let prev = self.contention_duration.fetch_add(low, Ordering::Relaxed);
            let mut high = (waited >> 32) as u32;
            if low > u32::MAX - prev {
                high = high.wrapping_add(1);
            }
            self.contention_duration_high.fetch_add(high, Ordering::Relaxed);
        }
        self.owner
            .store(platform::current_thread_id(), Ordering::Relaxed);
        Status::Ok
    }

    /// Acquire unconditionally.
    pub fn acquire(&self) {
        let r = self.acquire_with(|| Status::Invalid);
        debug_assert_eq!(r, Status::Ok);
    }

    /// True when the calling thread holds the lock.
    pub fn owned(&self) -> bool {
        self.state.load(Ordering::Acquire) != 0
            && self.owner.load(Ordering::Relaxed) == platform::current_thread_id()
    }

    pub fn release(&self) {
        debug_assert!(self.owned());
        self.owner.store(0, Ordering::Relaxed);
        // 1 -> 0 uncontended; 2 -> 0 plus a wake.
        if self.state.swap(0, Ordering::AcqRel) == 2 {
            platform::wake_one_u32(&self.state);
            self.wake_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn contention_count(&self) -> i32 {
        self.contention_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fresh() -> SimpleLock {
        SimpleLock {
            state: AtomicU32::new(0),
            owner: AtomicI32::new(0),
            contention_count: AtomicI32::new(0),
            wait_count: AtomicI32::new(0),
            wake_count: AtomicI32::new(0),
            contention_duration: AtomicU32::new(0),
            contention_duration_high: AtomicU32::new(0),
        }
    }

    #[test]
    fn acquire_release_cycle() {
        let lock = fresh();
        lock.acquire();
        assert!(lock.owned());
        lock.release();
        assert!(!lock.owned());
    }

    #[test]
    fn try_acquire_fails_when_held() {
        let lock = fresh();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn mutual_exclusion() {
        let lock = Arc::new(fresh());
        let counter = Arc::new(AtomicI32::new(0));
        let iterations = 1000;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..iterations {
                        lock.acquire();
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                        lock.release();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4 * iterations);
    }

    #[test]
    fn callback_can_abandon() {
        let lock = fresh();
        lock.acquire();
        // Second acquire from this thread would deadlock; the callback
        // abandons after the first wake/timeout.
        let r = lock.acquire_with(|| Status::Repeat);
        assert_eq!(r, Status::Repeat);
        lock.release();
    }
}
