// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-container reader-writer lock.
//
// The discipline is strictly older-wins: before acquiring, a thread aborts
// itself when any contender is older; after acquiring, it preempts any
// strictly younger holder by CAS-ing the victim's thread_preempted slot and
// signalling its ready event. next_writer doubles as a barrier that stops
// new readers while a writer negotiates. Hand-off goes through the
// queue_threads bitmap: release signals the oldest queued thread.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::block::RefHeader;
use crate::region::Region;
use crate::shm_ptr::ShmPtr;
use crate::status::Status;
use crate::sync::bitmap::{iter_bits, AtomicBitmap};
use crate::thread_ctx::{ticket_older, ThreadContext, ThreadSlot};

/// Lock state carried by every mutable container.
#[repr(C)]
pub struct ContainerLock {
    /// Bit i set = thread slot i holds a read lock.
    pub reader_lock: AtomicBitmap,
    /// Slot pointer of the writing thread; NONE when unlocked.
    pub writer_lock: AtomicUsize,
    /// Slot pointer of the thread with priority to write next; barriers new
    /// readers. NONE when clear.
    pub next_writer: AtomicUsize,
    /// Threads waiting for this lock.
    pub queue_threads: AtomicBitmap,
    /// Container pointer while a write transaction is staged; NONE
    /// otherwise. Doubles as the "already locked by my transaction" flag.
    pub transaction_data: AtomicUsize,
    pub readers_count: AtomicI32,
    pub writers_count: AtomicI32,
    pub read_contention_count: AtomicI32,
    pub write_contention_count: AtomicI32,
}

impl ContainerLock {
    pub fn init(&self) {
        self.reader_lock.init();
        self.writer_lock.store(ShmPtr::NONE.0, Ordering::Release);
        self.next_writer.store(ShmPtr::NONE.0, Ordering::Release);
        self.queue_threads.init();
        self.transaction_data.store(ShmPtr::NONE.0, Ordering::Release);
        self.readers_count.store(0, Ordering::Relaxed);
        self.writers_count.store(0, Ordering::Relaxed);
        self.read_contention_count.store(0, Ordering::Relaxed);
        self.write_contention_count.store(0, Ordering::Relaxed);
    }

    pub fn writer(&self) -> ShmPtr {
        ShmPtr(self.writer_lock.load(Ordering::SeqCst))
    }

    pub fn next_writer_ptr(&self) -> ShmPtr {
        ShmPtr(self.next_writer.load(Ordering::SeqCst))
    }
}

/// Header shared by every lockable container: refcount trio + lock.
#[repr(C)]
pub struct ContainerHeader {
    pub refs: RefHeader,
    pub lock: ContainerLock,
}

impl ContainerHeader {
    pub fn init(&self, tag: u32, size: usize) {
        self.refs.init(tag, size);
        self.lock.init();
    }
}

/// The lock of the container at `ptr`.
pub fn lock_of(region: &Region, ptr: ShmPtr) -> Option<&ContainerLock> {
    region.deref::<ContainerHeader>(ptr).map(|c| &c.lock)
}

// ---------------------------------------------------------------------------
// Priority helpers
// ---------------------------------------------------------------------------

fn ticket_of(region: &Region, slot_ptr: ShmPtr) -> u32 {
    region.thread_slot(slot_ptr).map(|s| s.ticket()).unwrap_or(0)
}

/// Oldest ticket among the slots named by `bits`; (0, None) when all idle.
fn oldest_in_bitmap(region: &Region, bits: u64) -> (u32, Option<usize>) {
    let sb = region.superblock();
    let mut best = 0u32;
    let mut best_index = None;
    for i in iter_bits(bits) {
        let t = sb.threads[i].ticket();
        if t != 0 && (best == 0 || ticket_older(t, best)) {
            best = t;
            best_index = Some(i);
        }
    }
    (best, best_index)
}

/// Force `victim` to abort: CAS its preemption slot from EMPTY to our slot
/// pointer and wake it. An already-preempted victim is left as is.
fn preempt_thread(thread: &ThreadContext, victim: &ThreadSlot) {
    let mine = thread.slot_ptr().0;
    let already = victim.thread_preempted.load(Ordering::SeqCst);
    if already == mine
        || victim
            .thread_preempted
            .compare_exchange(ShmPtr::EMPTY.0, mine, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    {
        victim.ready.signal();
    } else {
        // someone else is already preempting it; a wake never hurts
        victim.ready.signal();
    }
}

fn preempt_slot_ptr(thread: &ThreadContext, victim_ptr: ShmPtr) {
    if let Some(victim) = thread.region().thread_slot(victim_ptr) {
        preempt_thread(thread, victim);
    }
}

/// Signal every strictly younger reader to abort. Returns true when a
/// contending reader is still present afterwards.
fn preempt_younger_readers(thread: &ThreadContext, lock: &ContainerLock, my_ticket: u32) -> bool {
    let region = thread.region();
    let contenders = lock.reader_lock.contenders(thread.index());
    for i in iter_bits(contenders) {
        let slot = &region.superblock().threads[i];
        let t = slot.ticket();
        if t == 0 || ticket_older(my_ticket, t) {
            preempt_thread(thread, slot);
        }
    }
    lock.reader_lock.contenders(thread.index()) != 0
}

// ---------------------------------------------------------------------------
// Reader acquisition
// ---------------------------------------------------------------------------

/// Take a read lock for the calling thread (spec order: barrier check, bit
/// set, contender re-check, preempt-younger-writers).
pub fn take_read_lock(thread: &ThreadContext, lock: &ContainerLock) -> Status {
    let region = thread.region();
    let me = thread.index();
    let my_ticket = thread.slot().ticket();
    debug_assert!(my_ticket != 0, "read lock outside a transaction cycle");

    if thread.slot().is_preempted() {
        return Status::Preempted;
    }

    let writer = lock.writer();
    let next_writer = lock.next_writer_ptr();
    let lock_is_mine = writer == thread.slot_ptr();

    // Fast path: bit already set and no foreign writer.
    if lock.reader_lock.check(me) && (writer.is_none() || lock_is_mine) {
        return Status::Ok;
    }

    // An older writer (held or pending) bars new readers.
    for barrier in [writer, next_writer] {
        if barrier.is_set() && barrier != thread.slot_ptr() {
            let t = ticket_of(region, barrier);
            if ticket_older(t, my_ticket) {
                lock.read_contention_count.fetch_add(1, Ordering::Relaxed);
                return Status::Preempted;
            }
        }
    }

    lock.reader_lock.set(me);

    // Re-check after publishing the bit; an older writer that appeared in
    // the window wins. The bit stays set: the caller either retries (and
    // sees it) or aborts (and clears it).
    let writer = lock.writer();
    let next_writer = lock.next_writer_ptr();
    for barrier in [writer, next_writer] {
        if barrier.is_set() && barrier != thread.slot_ptr() {
            let t = ticket_of(region, barrier);
            if ticket_older(t, my_ticket) {
                lock.read_contention_count.fetch_add(1, Ordering::Relaxed);
                return Status::Preempted;
            }
        }
    }

    // Every conflicting writer left is younger: force them out.
    for barrier in [writer, next_writer] {
        if barrier.is_set() && barrier != thread.slot_ptr() {
            preempt_slot_ptr(thread, barrier);
        }
    }
    let writer_now = lock.writer();
    if writer_now.is_set() && writer_now != thread.slot_ptr() {
        // the aborting writer will signal our ready event on release
        return Status::WaitSignal;
    }

    lock.readers_count.fetch_add(1, Ordering::Relaxed);
    Status::Ok
}

/// Drop the read lock; when the last reader leaves, wake the pending
/// writer.
pub fn release_read_lock(thread: &ThreadContext, lock: &ContainerLock) {
    let was_set = lock.reader_lock.reset(thread.index());
    if !was_set {
        return;
    }
    if lock.reader_lock.get() == 0 {
        let next = lock.next_writer_ptr();
        if next.is_set() {
            if let Some(slot) = thread.region().thread_slot(next) {
                slot.ready.signal();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Writer acquisition
// ---------------------------------------------------------------------------

/// Take the write lock for the calling thread (spec §4.4.3 order).
/// `container_ptr` is recorded as the thread's pending lock while queued.
pub fn take_write_lock(
    thread: &ThreadContext,
    lock: &ContainerLock,
    container_ptr: ShmPtr,
) -> Status {
    let region = thread.region();
    let me = thread.index();
    let my_slot = thread.slot_ptr();
    let my_ticket = thread.slot().ticket();
    debug_assert!(my_ticket != 0, "write lock outside a transaction cycle");

    // 1. Preempted threads unwind before taking anything new.
    if thread.slot().is_preempted() {
        return Status::Preempted;
    }

    // 2. Older readers or queued threads win immediately.
    let (oldest_reader, _) = oldest_in_bitmap(region, lock.reader_lock.contenders(me));
    let (oldest_queued, _) = oldest_in_bitmap(region, lock.queue_threads.contenders(me));
    for t in [oldest_reader, oldest_queued] {
        if t != 0 && ticket_older(t, my_ticket) {
            lock.write_contention_count.fetch_add(1, Ordering::Relaxed);
            return Status::Preempted;
        }
    }

    // 3. Re-entry: the lock is already ours from this transaction cycle.
    if lock.writer() == my_slot {
        lock.queue_threads.reset(me);
        if preempt_younger_readers(thread, lock, my_ticket) {
            return Status::Wait;
        }
        return Status::Ok;
    }

    // 4. Enter the queue and arm our wake-up event.
    lock.queue_threads.set(me);
    thread
        .slot()
        .pending_lock
        .store(container_ptr.0, Ordering::SeqCst);
    thread.slot().ready.reset();

    // 5. Become (or displace) the next_writer barrier.
    loop {
        let cur = lock.next_writer_ptr();
        if cur == my_slot {
            break;
        }
        if cur.is_set() {
            let cur_ticket = ticket_of(region, cur);
            if ticket_older(cur_ticket, my_ticket) {
                lock.write_contention_count.fetch_add(1, Ordering::Relaxed);
                return Status::Preempted;
            }
        }
        if lock
            .next_writer
            .compare_exchange(cur.0, my_slot.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if cur.is_set() {
                preempt_slot_ptr(thread, cur); // displaced younger candidate
            }
            break;
        }
    }

    // 6. Clear younger readers out of the way.
    if preempt_younger_readers(thread, lock, my_ticket) {
        return Status::WaitSignal; // last reader signals via next_writer
    }

    // 7. Claim the write lock itself.
    if lock
        .writer_lock
        .compare_exchange(ShmPtr::NONE.0, my_slot.0, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        let holder = lock.writer();
        if holder == my_slot {
            // lost a race with our own retry; fall through to the post-check
        } else if holder.is_set() {
            let t = ticket_of(region, holder);
            if ticket_older(t, my_ticket) {
                lock.write_contention_count.fetch_add(1, Ordering::Relaxed);
                return Status::Preempted;
            }
            preempt_slot_ptr(thread, holder);
            return Status::WaitSignal;
        } else {
            return Status::Repeat; // holder vanished mid-check
        }
    }

    // The lock is ours from here on: leave the queue and account it before
    // the post-check so retry and release see consistent bookkeeping.
    lock.queue_threads.reset(me);
    thread.slot().pending_lock.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
    lock.writers_count.fetch_add(1, Ordering::Relaxed);
    region.superblock().locks_held.fetch_add(1, Ordering::SeqCst);

    // 8. Post-check: readers that slipped in during the claim.
    let contenders = lock.reader_lock.contenders(me);
    if contenders != 0 {
        let (oldest, _) = oldest_in_bitmap(region, contenders);
        if oldest != 0 && ticket_older(oldest, my_ticket) {
            // an older reader appeared: back out entirely
            release_write_lock(thread, lock);
            lock.write_contention_count.fetch_add(1, Ordering::Relaxed);
            return Status::Preempted;
        }
        preempt_younger_readers(thread, lock, my_ticket);
        return Status::Wait; // lock stays held while they unwind
    }
    Status::Ok
}

/// Wake the oldest queued thread, if any.
fn notify_queue(thread: &ThreadContext, lock: &ContainerLock) {
    let region = thread.region();
    let (_, oldest_index) = oldest_in_bitmap(region, lock.queue_threads.contenders(thread.index()));
    if let Some(i) = oldest_index {
        region.superblock().threads[i].ready.signal();
    } else {
        let next = lock.next_writer_ptr();
        if next.is_set() && next != thread.slot_ptr() {
            if let Some(slot) = region.thread_slot(next) {
                slot.ready.signal();
            }
        }
    }
}

/// Drop the write lock and hand off to the highest-priority waiter.
pub fn release_write_lock(thread: &ThreadContext, lock: &ContainerLock) {
    debug_assert!(lock.writer() == thread.slot_ptr());
    // Our barrier falls with the lock; a queued thread re-arms its own.
    let _ = lock.next_writer.compare_exchange(
        thread.slot_ptr().0,
        ShmPtr::NONE.0,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
    lock.transaction_data.store(ShmPtr::NONE.0, Ordering::SeqCst);
    lock.writer_lock.store(ShmPtr::NONE.0, Ordering::SeqCst);
    thread.region().superblock().locks_held.fetch_sub(1, Ordering::SeqCst);
    notify_queue(thread, lock);
}

/// Abandon a queued-but-not-granted write attempt.
pub fn unqueue_from_lock(thread: &ThreadContext, lock: &ContainerLock) {
    lock.queue_threads.reset(thread.index());
    let _ = lock.next_writer.compare_exchange(
        thread.slot_ptr().0,
        ShmPtr::NONE.0,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
    thread.slot().pending_lock.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
    notify_queue(thread, lock);
}

/// True when the calling thread holds the write lock.
pub fn have_write_lock(thread: &ThreadContext, lock: &ContainerLock) -> bool {
    lock.writer() == thread.slot_ptr()
}

/// True when the calling thread holds a read (or write) lock.
pub fn have_read_lock(thread: &ThreadContext, lock: &ContainerLock) -> bool {
    lock.reader_lock.check(thread.index()) || have_write_lock(thread, lock)
}
