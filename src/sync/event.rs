// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Manual-reset event stored as a single shared word.
// signal() latches the word and wakes one waiter; wait() consumes the latch.
// The producer/consumer protocol is:
//   producer: make the condition observable, then signal();
//   consumer: wait() { implicit reset }, process, wait() again.
// Consumers must not reset between processing and the next wait.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::platform;
use crate::status::Status;

/// A manual-reset event in shared memory.
#[repr(C)]
pub struct ShmEvent {
    ready: AtomicU32,
}

impl ShmEvent {
    /// Initialise in place (the region zero-fills fresh chunks, so this is
    /// only needed when recycling).
    pub fn init(&self) {
        self.ready.store(0, Ordering::Release);
    }

    /// True if the event is signalled.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) != 0
    }

    /// Clear the latch.
    pub fn reset(&self) {
        self.ready.store(0, Ordering::Release);
    }

    /// Latch the event and wake one waiter.
    ///
    /// When the latch was already set the wake is skipped: the consumer has
    /// not observed the previous signal yet and will pick this one up too.
    pub fn signal(&self) -> Status {
        if self.is_ready() {
            return Status::Ok;
        }
        if self
            .ready
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            platform::wake_one_u32(&self.ready);
        }
        Status::Ok
    }

    /// Wait for the event with a timeout, consuming the latch on success.
    ///
    /// Returns `Ok` when signalled, `Wait` on timeout.
    pub fn wait(&self, timeout_ms: u32) -> Status {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms as u64);
        loop {
            if self.ready.load(Ordering::Acquire) != 0 {
                self.reset();
                return Status::Ok;
            }
            if std::time::Instant::now() >= deadline {
                return Status::Wait;
            }
            platform::wait_on_u32(&self.ready, 0, timeout_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn signal_then_wait() {
        let ev = ShmEvent { ready: AtomicU32::new(0) };
        ev.signal();
        assert_eq!(ev.wait(10), Status::Ok);
        // latch consumed
        assert!(!ev.is_ready());
        assert_eq!(ev.wait(1), Status::Wait);
    }

    #[test]
    fn double_signal_is_one_latch() {
        let ev = ShmEvent { ready: AtomicU32::new(0) };
        ev.signal();
        ev.signal();
        assert_eq!(ev.wait(10), Status::Ok);
        assert_eq!(ev.wait(1), Status::Wait);
    }

    #[test]
    fn cross_thread_wakeup() {
        struct Shared(ShmEvent);
        let shared = Arc::new(Shared(ShmEvent { ready: AtomicU32::new(0) }));

        let s2 = Arc::clone(&shared);
        let waiter = std::thread::spawn(move || s2.0.wait(2000));

        std::thread::sleep(std::time::Duration::from_millis(20));
        shared.0.signal();
        assert_eq!(waiter.join().unwrap(), Status::Ok);
    }
}
