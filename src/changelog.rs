// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bounded per-container change log: the touched-slot descriptors that make
// commit and rollback visit exactly the modified slots instead of scanning
// the container. Allocated lazily on first modification; grows by
// reallocation, never drops entries.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::block::AbstractHeader;
use crate::region::Region;
use crate::shm_ptr::ShmPtr;
use crate::status::Status;
use crate::thread_ctx::ThreadContext;

pub const CHANGE_LOG_CAPACITY: usize = 20;

#[repr(C)]
pub struct ChangeLog {
    pub header: AbstractHeader, // TAG_LIST_CHANGES / TAG_QUEUE_CHANGES / TAG_DICT_DELTA
    pub capacity: AtomicI32,
    pub count: AtomicI32,
    // `capacity` AtomicU64 entries follow the header
}

fn log_size(capacity: usize) -> usize {
    std::mem::size_of::<ChangeLog>() + capacity * std::mem::size_of::<u64>()
}

pub fn entries(region: &Region, log_ptr: ShmPtr) -> Option<&[AtomicU64]> {
    let log: &ChangeLog = region.deref(log_ptr)?;
    let capacity = log.capacity.load(Ordering::Acquire) as usize;
    let raw = region.translate(log_ptr.shift(std::mem::size_of::<ChangeLog>()))?;
    Some(unsafe { std::slice::from_raw_parts(raw as *const AtomicU64, capacity) })
}

pub fn count(region: &Region, log_ptr: ShmPtr) -> usize {
    region
        .deref::<ChangeLog>(log_ptr)
        .map(|l| l.count.load(Ordering::Acquire) as usize)
        .unwrap_or(0)
}

pub fn clear(region: &Region, log_ptr: ShmPtr) {
    if let Some(log) = region.deref::<ChangeLog>(log_ptr) {
        log.count.store(0, Ordering::Release);
    }
}

fn new_log(
    thread: &ThreadContext,
    tag: u32,
    capacity: usize,
    debug_id: i32,
) -> Result<ShmPtr, Status> {
    let ptr = thread.alloc(log_size(capacity), debug_id)?;
    let log: &ChangeLog = thread.region().deref(ptr).ok_or(Status::Failure)?;
    log.header.init(tag, log_size(capacity));
    log.capacity.store(capacity as i32, Ordering::Release);
    log.count.store(0, Ordering::Release);
    Ok(ptr)
}

/// Append `entry` to the container's log at `*slot`, creating the log on
/// first use and growing it (entries preserved) when full. Only the thread
/// holding the container's write lock calls this.
pub fn push(
    thread: &ThreadContext,
    slot: &std::sync::atomic::AtomicUsize,
    tag: u32,
    debug_id: i32,
    entry: u64,
) -> Result<(), Status> {
    let region = thread.region();
    let mut log_ptr = ShmPtr(slot.load(Ordering::SeqCst));
    if !log_ptr.is_set() {
        log_ptr = new_log(thread, tag, CHANGE_LOG_CAPACITY, debug_id)?;
        slot.store(log_ptr.0, Ordering::SeqCst);
    }

    let log: &ChangeLog = region.deref(log_ptr).ok_or(Status::Failure)?;
    let capacity = log.capacity.load(Ordering::Acquire) as usize;
    let n = log.count.load(Ordering::Acquire) as usize;
    if n >= capacity {
        // grow, preserving indices
        let grown_ptr = new_log(thread, tag, capacity * 2, debug_id)?;
        let old_entries = entries(region, log_ptr).ok_or(Status::Failure)?;
        let new_entries = entries(region, grown_ptr).ok_or(Status::Failure)?;
        for i in 0..n {
            new_entries[i].store(old_entries[i].load(Ordering::Acquire), Ordering::Release);
        }
        let grown: &ChangeLog = region.deref(grown_ptr).ok_or(Status::Failure)?;
        grown.count.store(n as i32, Ordering::Release);
        slot.store(grown_ptr.0, Ordering::SeqCst);
        thread.push_free(log_ptr);
        return push(thread, slot, tag, debug_id, entry);
    }

    let slot_entries = entries(region, log_ptr).ok_or(Status::Failure)?;
    slot_entries[n].store(entry, Ordering::Release);
    log.count.store(n as i32 + 1, Ordering::Release);
    Ok(())
}
