// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cell: a single-slot mutable container. The smallest demonstration of the
// shadow-field discipline — one (data, new_data, has_new_data) triple that
// commit swaps and rollback discards. Queue cells extend this layout.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::block::{self, TAG_CELL};
use crate::lock::ContainerHeader;
use crate::shm_ptr::ShmPtr;
use crate::status::{Status, StoreResult};
use crate::thread_ctx::{debug_id, ThreadContext};
use crate::transaction::ContainerKind;

#[repr(C)]
pub struct ShmCell {
    pub head: ContainerHeader, // TAG_CELL
    pub data: AtomicUsize,
    pub has_new_data: AtomicI32,
    pub new_data: AtomicUsize,
}

pub(crate) fn init_cell_body(cell: &ShmCell) {
    cell.data.store(ShmPtr::EMPTY.0, Ordering::Release);
    cell.has_new_data.store(0, Ordering::Release);
    cell.new_data.store(ShmPtr::EMPTY.0, Ordering::Release);
}

/// Allocate an empty cell. The caller owns the creating reference.
pub fn new_cell(thread: &ThreadContext) -> Result<ShmPtr, Status> {
    let size = std::mem::size_of::<ShmCell>();
    let ptr = thread.alloc(size, debug_id::CELL)?;
    let cell: &ShmCell = thread.region().deref(ptr).ok_or(Status::Failure)?;
    cell.head.init(TAG_CELL, size);
    init_cell_body(cell);
    Ok(ptr)
}

/// Stage `value` into the cell; ownership of the caller's reference moves
/// into the shadow slot. Requires (and takes) the write lock.
pub(crate) fn cell_set_op(
    thread: &ThreadContext,
    cell_ptr: ShmPtr,
    value: ShmPtr,
) -> Result<(), Status> {
    match thread.lock_write(cell_ptr, ContainerKind::Cell) {
        Status::Ok => {}
        s => return Err(s),
    }
    let cell: &ShmCell = thread.region().deref(cell_ptr).ok_or(Status::Failure)?;
    if cell.has_new_data.load(Ordering::SeqCst) != 0 {
        block::move_ptr(thread, &cell.new_data, value);
    } else {
        cell.new_data.store(value.0, Ordering::SeqCst);
        cell.has_new_data.store(1, Ordering::SeqCst);
    }
    Ok(())
}

/// Read the committed value — or the staged one when the calling
/// transaction owns the write lock. The result is acquired.
pub(crate) fn cell_get_op(
    thread: &ThreadContext,
    cell_ptr: ShmPtr,
) -> Result<ShmPtr, Status> {
    match thread.lock_read(cell_ptr, ContainerKind::Cell) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let cell: &ShmCell = region.deref(cell_ptr).ok_or(Status::Failure)?;
    let owner = crate::lock::have_write_lock(thread, &cell.head.lock);
    let ptr = if owner && cell.has_new_data.load(Ordering::SeqCst) != 0 {
        ShmPtr(cell.new_data.load(Ordering::SeqCst))
    } else {
        ShmPtr(cell.data.load(Ordering::SeqCst))
    };
    block::acq(region, ptr);
    Ok(ptr)
}

pub(crate) fn commit_cell(thread: &ThreadContext, cell_ptr: ShmPtr) {
    let Some(cell) = thread.region().deref::<ShmCell>(cell_ptr) else {
        return;
    };
    if cell.has_new_data.load(Ordering::SeqCst) != 0 {
        let staged = ShmPtr(cell.new_data.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
        cell.has_new_data.store(0, Ordering::SeqCst);
        block::move_ptr(thread, &cell.data, staged);
    }
}

pub(crate) fn rollback_cell(thread: &ThreadContext, cell_ptr: ShmPtr) {
    let Some(cell) = thread.region().deref::<ShmCell>(cell_ptr) else {
        return;
    };
    if cell.has_new_data.load(Ordering::SeqCst) != 0 {
        cell.has_new_data.store(0, Ordering::SeqCst);
        block::clear_ptr(thread, &cell.new_data);
    }
}

pub(crate) fn destroy_cell(thread: &ThreadContext, cell_ptr: ShmPtr) {
    let Some(cell) = thread.region().deref::<ShmCell>(cell_ptr) else {
        return;
    };
    block::clear_ptr(thread, &cell.data);
    if cell.has_new_data.swap(0, Ordering::SeqCst) != 0 {
        block::clear_ptr(thread, &cell.new_data);
    } else {
        cell.new_data.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A copyable handle to a cell in the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellRef(pub ShmPtr);

impl CellRef {
    pub fn new(thread: &ThreadContext) -> StoreResult<CellRef> {
        thread.with_transaction(|t| new_cell(t).map(CellRef))
    }

    /// Store a value pointer; the caller's reference moves into the cell.
    pub fn set_consume(&self, thread: &ThreadContext, value: ShmPtr) -> StoreResult<()> {
        let ptr = self.0;
        thread.with_transaction(|t| cell_set_op(t, ptr, value))
    }

    /// Store a string value.
    pub fn set_str(&self, thread: &ThreadContext, s: &str) -> StoreResult<()> {
        let value = thread
            .with_transaction(|t| crate::value::new_string(t, s))?;
        self.set_consume(thread, value)
    }

    /// Read an acquired pointer to the current value; the caller releases.
    pub fn get_owned(&self, thread: &ThreadContext) -> StoreResult<ShmPtr> {
        let ptr = self.0;
        thread.with_transaction(|t| cell_get_op(t, ptr))
    }

    /// Read the current value as a string, if it is one.
    pub fn get_str(&self, thread: &ThreadContext) -> StoreResult<Option<String>> {
        let ptr = self.get_owned(thread)?;
        let result = crate::value::get_string(thread.region(), ptr);
        block::release(thread, ptr);
        Ok(result)
    }
}
