// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Background reclaimer, running in the coordinator.
//
// Cycle: detach every thread's published free list, flag the busy threads
// and wait out the grace period, then walk the spliced list. A block whose
// revival_count outran its release_count was resurrected mid-flight and is
// skipped (one release request consumed); dead blocks run their destructor
// and their bytes return to the owning heap under that heap's lock.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::block::{self, FreeListBlock};
use crate::heap;
use crate::region::Region;
use crate::shm_ptr::ShmPtr;
use crate::sync::bitmap::MAX_THREADS;
use crate::thread_ctx::{ThreadContext, TxMode};

/// Start the reclaimer thread. Called once by `Region::create`.
pub fn start(region: &Arc<Region>) {
    let sb = region.superblock();
    if sb
        .reclaimer_taken
        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        debug_assert!(false, "reclaimer is already running");
        return;
    }
    let weak: Weak<Region> = Arc::downgrade(region);
    let handle = std::thread::Builder::new()
        .name("shmstore-reclaimer".to_string())
        .spawn(move || reclaimer_main(weak))
        .expect("failed to spawn the reclaimer thread");
    *region.reclaimer.lock().unwrap() = Some(handle);
}

/// Ask the reclaimer to halt and join it. Safe to call twice.
pub fn stop(region: &Region) {
    let sb = region.superblock();
    sb.halt.store(1, Ordering::SeqCst);
    sb.has_garbage_event.signal();
    let handle = region.reclaimer.lock().unwrap().take();
    if let Some(handle) = handle {
        if handle.thread().id() != std::thread::current().id() {
            let _ = handle.join();
        }
    }
}

fn reclaimer_main(weak: Weak<Region>) {
    loop {
        // Hold the region only for the duration of one cycle so shutdown
        // can tear it down between cycles.
        let Some(region) = weak.upgrade() else {
            return;
        };
        let sb = region.superblock();
        if sb.halt.load(Ordering::SeqCst) != 0 {
            return;
        }
        sb.has_garbage_event.wait(20);
        if sb.halt.load(Ordering::SeqCst) != 0 {
            return;
        }
        if sb.has_garbage.load(Ordering::SeqCst) != 0
            && sb.stop_reclaimer.load(Ordering::SeqCst) == 0
        {
            if let Ok(ctx) = ThreadContext::new(Arc::clone(&region)) {
                process_garbage(&ctx);
                // child releases from destructors publish for a later cycle
                ctx.flush_free();
            }
        }
    }
}

/// One reclamation cycle. Returns the number of blocks physically freed.
pub fn process_garbage(ctx: &ThreadContext) -> usize {
    let region = ctx.region();
    let sb = region.superblock();
    // Reset the flag before the walk: a publisher racing us re-raises it.
    sb.has_garbage.store(0, Ordering::SeqCst);

    // 1. Detach every published free list, splicing into one private list.
    let mut spliced = ShmPtr::EMPTY;
    for index in 0..MAX_THREADS {
        let slot = &sb.threads[index];
        let list = ShmPtr(slot.free_list.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
        if !list.is_set() {
            continue;
        }
        if spliced.is_set() {
            // find the detached chain's tail and hang the previous chains
            let mut tail = list;
            loop {
                let Some(node) = region.deref::<FreeListBlock>(tail) else {
                    break;
                };
                let next = ShmPtr(node.next.load(Ordering::SeqCst));
                if !next.is_set() {
                    node.next.store(spliced.0, Ordering::SeqCst);
                    break;
                }
                tail = next;
            }
        }
        spliced = list;
    }

    // 2. Flag busy threads; snapshot the non-transient ones.
    let mut snapshot_len = 0usize;
    for index in 0..MAX_THREADS {
        let slot = &sb.threads[index];
        if slot.in_use.load(Ordering::SeqCst) == 0 || index == ctx.index() {
            continue;
        }
        let mode = slot.mode();
        if mode >= TxMode::Transient {
            slot.test_finished.store(1, Ordering::SeqCst);
            if mode != TxMode::Transient {
                sb.grace_threads[snapshot_len].store(ctx.region().superblock_ptr(
                    slot as *const _ as *const u8,
                ).0, Ordering::SeqCst);
                snapshot_len += 1;
            }
        }
    }
    sb.grace_count.store(snapshot_len as i32, Ordering::SeqCst);

    // 3. Grace period: wait until every snapshotted thread has observed the
    // flag (cleared it at a transaction boundary) or gone idle.
    if snapshot_len > 0 {
        let mut waiting = true;
        while waiting && sb.halt.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
            waiting = false;
            for i in 0..snapshot_len {
                let ptr = ShmPtr(sb.grace_threads[i].load(Ordering::SeqCst));
                if !ptr.is_set() {
                    continue;
                }
                let Some(slot) = region.thread_slot(ptr) else {
                    continue;
                };
                if slot.test_finished.load(Ordering::SeqCst) == 0 || slot.mode() <= TxMode::Idle {
                    sb.grace_threads[i].store(ShmPtr::EMPTY.0, Ordering::SeqCst);
                } else {
                    waiting = true;
                }
            }
        }
        for i in 0..snapshot_len {
            sb.grace_threads[i].store(ShmPtr::EMPTY.0, Ordering::SeqCst);
        }
        sb.grace_count.store(0, Ordering::SeqCst);
    }

    // 4. Walk the spliced list: skip revived blocks; dead ones run their
    // destructor lock-free (destructors may allocate a fresh free-list
    // carrier, and the only sanctioned nesting is heap -> superblock inside
    // the allocator) and then return to the owning heap under its lock.
    let mut freed = 0usize;
    let mut cursor = spliced;
    while cursor.is_set() {
        let Some(node) = region.deref::<FreeListBlock>(cursor) else {
            break;
        };
        let next = ShmPtr(node.next.load(Ordering::SeqCst));
        let count = node.count.load(Ordering::SeqCst) as usize;
        for i in 0..count.min(block::FREE_LIST_CAPACITY) {
            let ptr = ShmPtr(node.items[i].load(Ordering::SeqCst));
            if !ptr.is_set() {
                continue;
            }
            if let Some(refs) = block::as_refcounted(region, ptr) {
                let revival = refs.revival_count.load(Ordering::SeqCst);
                let release = refs.release_count.load(Ordering::SeqCst);
                debug_assert!(revival >= release && release >= 0);
                if revival > release {
                    // revived during the grace period: consume one release
                    // request and leave the block alive
                    refs.release_count.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
            }
            block::destroy_block(ctx, ptr);
            heap::free_mem(region, ptr);
            freed += 1;
        }

        // the carrier block itself goes back to its heap
        heap::free_mem(region, cursor);
        cursor = next;
    }
    freed
}
