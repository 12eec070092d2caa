// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Queue container: singly-linked cells with head/tail shadows.
//
// A cell is referenced exactly once by the container (through `head` or the
// previous cell's `next`); `tail` is a non-owning shortcut for appending.
// New cells are invisible until commit publishes the staged links in append
// order. new_head/new_next use NONE for "unused" and EMPTY for "set the
// live link to EMPTY".

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::block::{self, TAG_QUEUE, TAG_QUEUE_CELL, TAG_QUEUE_CHANGES};
use crate::cell::{init_cell_body, ShmCell};
use crate::changelog;
use crate::lock::{have_write_lock, ContainerHeader};
use crate::shm_ptr::ShmPtr;
use crate::status::{Status, StoreResult};
use crate::thread_ctx::{debug_id, ThreadContext};
use crate::transaction::ContainerKind;

#[repr(C)]
pub struct QueueCell {
    pub cell: ShmCell, // TAG_QUEUE_CELL in its header
    pub next: AtomicUsize,
    /// NONE = unused, EMPTY = "publish EMPTY into next".
    pub new_next: AtomicUsize,
}

#[repr(C)]
pub struct ShmQueue {
    pub head_container: ContainerHeader, // TAG_QUEUE
    pub head: AtomicUsize,
    /// NONE = unused.
    pub new_head: AtomicUsize,
    /// Non-owning pointer to the last cell.
    pub tail: AtomicUsize,
    pub new_tail: AtomicUsize,
    pub count: AtomicI32,
    pub new_count: AtomicI32, // -1 = no staged change
    pub changes: AtomicUsize,
}

pub fn new_queue(thread: &ThreadContext) -> Result<ShmPtr, Status> {
    let size = std::mem::size_of::<ShmQueue>();
    let ptr = thread.alloc(size, debug_id::QUEUE)?;
    let queue: &ShmQueue = thread.region().deref(ptr).ok_or(Status::Failure)?;
    queue.head_container.init(TAG_QUEUE, size);
    queue.head.store(ShmPtr::EMPTY.0, Ordering::Release);
    queue.new_head.store(ShmPtr::NONE.0, Ordering::Release);
    queue.tail.store(ShmPtr::EMPTY.0, Ordering::Release);
    queue.new_tail.store(ShmPtr::NONE.0, Ordering::Release);
    queue.count.store(0, Ordering::Release);
    queue.new_count.store(-1, Ordering::Release);
    queue.changes.store(ShmPtr::EMPTY.0, Ordering::Release);
    Ok(ptr)
}

fn new_queue_cell(thread: &ThreadContext, value: ShmPtr) -> Result<ShmPtr, Status> {
    let size = std::mem::size_of::<QueueCell>();
    let ptr = thread.alloc(size, debug_id::QUEUE_CELL)?;
    let cell: &QueueCell = thread.region().deref(ptr).ok_or(Status::Failure)?;
    cell.cell.head.init(TAG_QUEUE_CELL, size);
    init_cell_body(&cell.cell);
    // the cell is invisible until commit, so the value goes in directly
    cell.cell.data.store(value.0, Ordering::Release);
    cell.next.store(ShmPtr::EMPTY.0, Ordering::Release);
    cell.new_next.store(ShmPtr::NONE.0, Ordering::Release);
    Ok(ptr)
}

/// Append `value` (ownership moves). Returns the new cell.
pub(crate) fn append_op(
    thread: &ThreadContext,
    queue_ptr: ShmPtr,
    value: ShmPtr,
) -> Result<ShmPtr, Status> {
    match thread.lock_write(queue_ptr, ContainerKind::Queue) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let queue: &ShmQueue = region.deref(queue_ptr).ok_or(Status::Failure)?;

    let cell_ptr = new_queue_cell(thread, value)?;

    let staged_tail = ShmPtr(queue.new_tail.load(Ordering::SeqCst));
    let tail = if staged_tail.is_none() {
        ShmPtr(queue.tail.load(Ordering::SeqCst))
    } else {
        staged_tail
    };

    if tail.is_set() {
        let tail_cell: &QueueCell = region.deref(tail).ok_or(Status::Failure)?;
        let prev = tail_cell.new_next.swap(cell_ptr.0, Ordering::SeqCst);
        debug_assert!(ShmPtr(prev).is_none(), "tail already had a staged link");
        changelog::push(
            thread,
            &queue.changes,
            TAG_QUEUE_CHANGES,
            debug_id::QUEUE_CHANGES,
            tail.0 as u64,
        )?;
    } else {
        debug_assert!(ShmPtr(queue.new_head.load(Ordering::SeqCst)).is_none());
        queue.new_head.store(cell_ptr.0, Ordering::SeqCst);
    }
    queue.new_tail.store(cell_ptr.0, Ordering::SeqCst);

    let count = {
        let staged = queue.new_count.load(Ordering::SeqCst);
        if staged == -1 {
            queue.count.load(Ordering::SeqCst)
        } else {
            staged
        }
    };
    queue.new_count.store(count + 1, Ordering::SeqCst);
    Ok(cell_ptr)
}

/// First cell in the caller's view; acquired.
pub(crate) fn first_op(thread: &ThreadContext, queue_ptr: ShmPtr) -> Result<ShmPtr, Status> {
    match thread.lock_read(queue_ptr, ContainerKind::Queue) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let queue: &ShmQueue = region.deref(queue_ptr).ok_or(Status::Failure)?;
    let owner = have_write_lock(thread, &queue.head_container.lock);
    let staged_head = ShmPtr(queue.new_head.load(Ordering::SeqCst));
    let head = if owner && !staged_head.is_none() {
        staged_head
    } else {
        ShmPtr(queue.head.load(Ordering::SeqCst))
    };
    block::acq(region, head);
    Ok(head)
}

/// Cell after `cell_ptr` in the caller's view; acquired. The caller still
/// holds the queue's read lock from `first_op`.
pub(crate) fn next_op(
    thread: &ThreadContext,
    queue_ptr: ShmPtr,
    cell_ptr: ShmPtr,
) -> Result<ShmPtr, Status> {
    match thread.lock_read(queue_ptr, ContainerKind::Queue) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let queue: &ShmQueue = region.deref(queue_ptr).ok_or(Status::Failure)?;
    let cell: &QueueCell = region.deref(cell_ptr).ok_or(Status::Failure)?;
    let owner = have_write_lock(thread, &queue.head_container.lock);
    let staged = ShmPtr(cell.new_next.load(Ordering::SeqCst));
    let next = if owner && !staged.is_none() {
        staged
    } else {
        ShmPtr(cell.next.load(Ordering::SeqCst))
    };
    block::acq(region, next);
    Ok(next)
}

/// The value held by `cell_ptr`; acquired.
pub(crate) fn cell_value_op(
    thread: &ThreadContext,
    queue_ptr: ShmPtr,
    cell_ptr: ShmPtr,
) -> Result<ShmPtr, Status> {
    match thread.lock_read(queue_ptr, ContainerKind::Queue) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let cell: &QueueCell = region.deref(cell_ptr).ok_or(Status::Failure)?;
    let value = ShmPtr(cell.cell.data.load(Ordering::SeqCst));
    block::acq(region, value);
    Ok(value)
}

pub(crate) fn count_op(thread: &ThreadContext, queue_ptr: ShmPtr) -> Result<i32, Status> {
    match thread.lock_read(queue_ptr, ContainerKind::Queue) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let queue: &ShmQueue = region.deref(queue_ptr).ok_or(Status::Failure)?;
    let owner = have_write_lock(thread, &queue.head_container.lock);
    let staged = queue.new_count.load(Ordering::SeqCst);
    if owner && staged != -1 {
        Ok(staged)
    } else {
        Ok(queue.count.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Commit, rollback, destroy
// ---------------------------------------------------------------------------

pub(crate) fn commit_queue(thread: &ThreadContext, queue_ptr: ShmPtr) {
    let region = thread.region();
    let Some(queue) = region.deref::<ShmQueue>(queue_ptr) else {
        return;
    };

    // publish staged links in append order
    let log_ptr = ShmPtr(queue.changes.load(Ordering::SeqCst));
    if log_ptr.is_set() {
        let n = changelog::count(region, log_ptr);
        if let Some(entries) = changelog::entries(region, log_ptr) {
            for entry in entries.iter().take(n) {
                let cell_ptr = ShmPtr(entry.load(Ordering::SeqCst) as usize);
                let Some(cell) = region.deref::<QueueCell>(cell_ptr) else {
                    continue;
                };
                let staged = ShmPtr(cell.new_next.swap(ShmPtr::NONE.0, Ordering::SeqCst));
                if !staged.is_none() {
                    // the link owns its cell: the displaced one is released
                    let old = ShmPtr(cell.next.swap(staged.0, Ordering::SeqCst));
                    block::release(thread, old);
                }
            }
        }
        changelog::clear(region, log_ptr);
    }

    let staged_head = ShmPtr(queue.new_head.swap(ShmPtr::NONE.0, Ordering::SeqCst));
    if !staged_head.is_none() {
        let old = ShmPtr(queue.head.swap(staged_head.0, Ordering::SeqCst));
        block::release(thread, old);
    }
    let staged_tail = ShmPtr(queue.new_tail.swap(ShmPtr::NONE.0, Ordering::SeqCst));
    if !staged_tail.is_none() {
        queue.tail.store(staged_tail.0, Ordering::SeqCst); // non-owning
    }
    let staged_count = queue.new_count.swap(-1, Ordering::SeqCst);
    if staged_count != -1 {
        queue.count.store(staged_count, Ordering::SeqCst);
    }
}

pub(crate) fn rollback_queue(thread: &ThreadContext, queue_ptr: ShmPtr) {
    let region = thread.region();
    let Some(queue) = region.deref::<ShmQueue>(queue_ptr) else {
        return;
    };

    // detach every staged link first, then release the orphaned cells once
    let log_ptr = ShmPtr(queue.changes.load(Ordering::SeqCst));
    if log_ptr.is_set() {
        let n = changelog::count(region, log_ptr);
        if let Some(entries) = changelog::entries(region, log_ptr) {
            for entry in entries.iter().take(n) {
                let cell_ptr = ShmPtr(entry.load(Ordering::SeqCst) as usize);
                let Some(cell) = region.deref::<QueueCell>(cell_ptr) else {
                    continue;
                };
                let staged = ShmPtr(cell.new_next.swap(ShmPtr::NONE.0, Ordering::SeqCst));
                if staged.is_set() {
                    block::release(thread, staged);
                }
            }
        }
        changelog::clear(region, log_ptr);
    }

    let staged_head = ShmPtr(queue.new_head.swap(ShmPtr::NONE.0, Ordering::SeqCst));
    if staged_head.is_set() {
        block::release(thread, staged_head);
    }
    queue.new_tail.store(ShmPtr::NONE.0, Ordering::SeqCst);
    queue.new_count.store(-1, Ordering::SeqCst);
}

pub(crate) fn destroy_queue(thread: &ThreadContext, queue_ptr: ShmPtr) {
    let region = thread.region();
    let Some(queue) = region.deref::<ShmQueue>(queue_ptr) else {
        return;
    };
    let head = ShmPtr(queue.head.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    block::release(thread, head); // the chain cascades cell by cell
    let staged_head = ShmPtr(queue.new_head.swap(ShmPtr::NONE.0, Ordering::SeqCst));
    if staged_head.is_set() {
        block::release(thread, staged_head);
    }
    let log_ptr = ShmPtr(queue.changes.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    if log_ptr.is_set() {
        thread.push_free(log_ptr);
    }
}

pub(crate) fn destroy_queue_cell(thread: &ThreadContext, cell_ptr: ShmPtr) {
    let region = thread.region();
    let Some(cell) = region.deref::<QueueCell>(cell_ptr) else {
        return;
    };
    crate::cell::destroy_cell(thread, cell_ptr); // data + new_data share the layout
    let next = ShmPtr(cell.next.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    block::release(thread, next);
    let staged = ShmPtr(cell.new_next.swap(ShmPtr::NONE.0, Ordering::SeqCst));
    if staged.is_set() {
        block::release(thread, staged);
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A copyable handle to a queue in the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueRef(pub ShmPtr);

impl QueueRef {
    pub fn new(thread: &ThreadContext) -> StoreResult<QueueRef> {
        thread.with_transaction(|t| new_queue(t).map(QueueRef))
    }

    /// Append a value pointer; the caller's reference moves into the queue.
    pub fn append_consume(&self, thread: &ThreadContext, value: ShmPtr) -> StoreResult<()> {
        let ptr = self.0;
        thread.with_transaction(|t| append_op(t, ptr, value).map(|_| ()))
    }

    pub fn append_str(&self, thread: &ThreadContext, s: &str) -> StoreResult<()> {
        let value = thread.with_transaction(|t| crate::value::new_string(t, s))?;
        self.append_consume(thread, value)
    }

    pub fn len(&self, thread: &ThreadContext) -> StoreResult<i32> {
        let ptr = self.0;
        thread.with_transaction(|t| count_op(t, ptr))
    }

    pub fn is_empty(&self, thread: &ThreadContext) -> StoreResult<bool> {
        Ok(self.len(thread)? == 0)
    }

    /// Snapshot the committed values as strings, in order.
    pub fn values_str(&self, thread: &ThreadContext) -> StoreResult<Vec<String>> {
        let ptr = self.0;
        thread.with_transaction(|t| {
            let region = t.region();
            let mut out = Vec::new();
            let mut cursor = first_op(t, ptr)?;
            while cursor.is_set() {
                let value = cell_value_op(t, ptr, cursor)?;
                if let Some(s) = crate::value::get_string(region, value) {
                    out.push(s);
                }
                block::release(t, value);
                let next = next_op(t, ptr, cursor)?;
                block::release(t, cursor);
                cursor = next;
            }
            Ok(out)
        })
    }
}
