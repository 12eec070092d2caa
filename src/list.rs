// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// List container: append at the tail, pop from the head.
//
// Small lists are one dense cell block; large lists hold an index of block
// descriptors. Blocks only grow: a transaction that needs room reallocates
// the block first, and the grown block stays in place whether the
// transaction commits or rolls back. Head deletions advance a cursor; a
// fully consumed head block is dropped at commit by rebuilding the index,
// and the last block is never dropped.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::block::{
    self, RefHeader, TAG_LIST, TAG_LIST_BLOCK, TAG_LIST_CHANGES, TAG_LIST_INDEX,
};
use crate::changelog;
use crate::lock::{have_write_lock, ContainerHeader};
use crate::region::Region;
use crate::shm_ptr::ShmPtr;
use crate::status::{Status, StoreResult};
use crate::thread_ctx::{debug_id, ThreadContext};
use crate::transaction::ContainerKind;

/// Cells per fresh block.
const INITIAL_CAPACITY: usize = 8;
/// A block doubles up to this many cells; past it a new tail block starts.
const MAX_BLOCK_CELLS: usize = 512;

#[repr(C)]
pub struct ShmList {
    pub head: ContainerHeader, // TAG_LIST
    pub top_block: AtomicUsize, // ListBlock or ListIndex
    pub count: AtomicI32,
    pub new_count: AtomicI32, // -1 = no staged change
    pub deleted: AtomicI32,
    pub new_deleted: AtomicI32,
    pub changes: AtomicUsize, // ChangeLog; EMPTY before first modification
}

#[repr(C)]
pub struct ListCell {
    pub data: AtomicUsize,
    pub has_new_data: AtomicI32,
    pub changed: AtomicI32,
    pub new_data: AtomicUsize,
}

#[repr(C)]
pub struct ListBlock {
    pub refs: RefHeader, // TAG_LIST_BLOCK
    pub count: AtomicI32,
    pub new_count: AtomicI32,
    /// Head-deletion cursor; only moves forward. count + deleted <= capacity.
    pub deleted: AtomicI32,
    pub new_deleted: AtomicI32,
    pub capacity: AtomicI32,
    // `capacity` ListCells follow
}

#[repr(C)]
pub struct ListIndexItem {
    pub count: AtomicI32,
    pub new_count: AtomicI32,
    pub deleted: AtomicI32,
    pub new_deleted: AtomicI32,
    pub block: AtomicUsize,
}

#[repr(C, align(8))]
pub struct ListIndex {
    pub refs: RefHeader, // TAG_LIST_INDEX
    pub index_size: AtomicI32,
    _pad: i32,
    // `index_size` ListIndexItems follow
}

#[inline]
fn staged(v: &AtomicI32, fallback: &AtomicI32) -> i32 {
    let s = v.load(Ordering::SeqCst);
    if s == -1 {
        fallback.load(Ordering::SeqCst)
    } else {
        s
    }
}

fn pack_entry(block_index: usize, cell_index: usize) -> u64 {
    ((block_index as u64) << 32) | cell_index as u64
}

fn unpack_entry(entry: u64) -> (usize, usize) {
    ((entry >> 32) as usize, (entry & 0xFFFF_FFFF) as usize)
}

// ---------------------------------------------------------------------------
// Block and index plumbing
// ---------------------------------------------------------------------------

fn cells_of(region: &Region, block_ptr: ShmPtr) -> Option<&[ListCell]> {
    let block: &ListBlock = region.deref(block_ptr)?;
    let capacity = block.capacity.load(Ordering::Acquire) as usize;
    let raw = region.translate(block_ptr.shift(std::mem::size_of::<ListBlock>()))?;
    Some(unsafe { std::slice::from_raw_parts(raw as *const ListCell, capacity) })
}

fn new_block(thread: &ThreadContext, capacity: usize) -> Result<ShmPtr, Status> {
    let size = std::mem::size_of::<ListBlock>() + capacity * std::mem::size_of::<ListCell>();
    let ptr = thread.alloc(size, debug_id::LIST_BLOCK)?;
    let block: &ListBlock = thread.region().deref(ptr).ok_or(Status::Failure)?;
    block.refs.init(TAG_LIST_BLOCK, size);
    block.count.store(0, Ordering::Release);
    block.new_count.store(-1, Ordering::Release);
    block.deleted.store(0, Ordering::Release);
    block.new_deleted.store(-1, Ordering::Release);
    block.capacity.store(capacity as i32, Ordering::Release);
    let cells = cells_of(thread.region(), ptr).ok_or(Status::Failure)?;
    for cell in cells {
        cell.data.store(ShmPtr::EMPTY.0, Ordering::Release);
        cell.has_new_data.store(0, Ordering::Release);
        cell.changed.store(0, Ordering::Release);
        cell.new_data.store(ShmPtr::EMPTY.0, Ordering::Release);
    }
    Ok(ptr)
}

fn index_items(region: &Region, index_ptr: ShmPtr) -> Option<&[ListIndexItem]> {
    let index: &ListIndex = region.deref(index_ptr)?;
    let n = index.index_size.load(Ordering::Acquire) as usize;
    let raw = region.translate(index_ptr.shift(std::mem::size_of::<ListIndex>()))?;
    Some(unsafe { std::slice::from_raw_parts(raw as *const ListIndexItem, n) })
}

/// Build a fresh immutable index over `blocks`, mirroring their counters.
fn new_index(thread: &ThreadContext, blocks: &[ShmPtr]) -> Result<ShmPtr, Status> {
    let size =
        std::mem::size_of::<ListIndex>() + blocks.len() * std::mem::size_of::<ListIndexItem>();
    let ptr = thread.alloc(size, debug_id::LIST_INDEX)?;
    let region = thread.region();
    let index: &ListIndex = region.deref(ptr).ok_or(Status::Failure)?;
    index.refs.init(TAG_LIST_INDEX, size);
    index.index_size.store(blocks.len() as i32, Ordering::Release);
    let items = index_items(region, ptr).ok_or(Status::Failure)?;
    for (item, &block_ptr) in items.iter().zip(blocks) {
        let block: &ListBlock = region.deref(block_ptr).ok_or(Status::Failure)?;
        item.count.store(block.count.load(Ordering::SeqCst), Ordering::SeqCst);
        item.new_count.store(block.new_count.load(Ordering::SeqCst), Ordering::SeqCst);
        item.deleted.store(block.deleted.load(Ordering::SeqCst), Ordering::SeqCst);
        item.new_deleted.store(block.new_deleted.load(Ordering::SeqCst), Ordering::SeqCst);
        // the index owns a reference to each of its blocks
        block::acq_store(region, &item.block, block_ptr);
    }
    Ok(ptr)
}

fn is_index(region: &Region, ptr: ShmPtr) -> bool {
    region
        .deref::<RefHeader>(ptr)
        .map(|h| h.tag() & !block::RELEASE_MARK == TAG_LIST_INDEX)
        .unwrap_or(false)
}

/// Block pointers of the list in order.
fn collect_blocks(region: &Region, list: &ShmList) -> Vec<ShmPtr> {
    let top = ShmPtr(list.top_block.load(Ordering::SeqCst));
    if !top.is_set() {
        return Vec::new();
    }
    if is_index(region, top) {
        match index_items(region, top) {
            Some(items) => items
                .iter()
                .map(|i| ShmPtr(i.block.load(Ordering::SeqCst)))
                .collect(),
            None => Vec::new(),
        }
    } else {
        vec![top]
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

pub fn new_list(thread: &ThreadContext) -> Result<ShmPtr, Status> {
    new_list_with_capacity(thread, INITIAL_CAPACITY)
}

pub fn new_list_with_capacity(thread: &ThreadContext, capacity: usize) -> Result<ShmPtr, Status> {
    let size = std::mem::size_of::<ShmList>();
    let ptr = thread.alloc(size, debug_id::LIST)?;
    let region = thread.region();
    let list: &ShmList = region.deref(ptr).ok_or(Status::Failure)?;
    list.head.init(TAG_LIST, size);
    let block_ptr = new_block(thread, capacity.max(1))?;
    list.top_block.store(block_ptr.0, Ordering::Release);
    list.count.store(0, Ordering::Release);
    list.new_count.store(-1, Ordering::Release);
    list.deleted.store(0, Ordering::Release);
    list.new_deleted.store(-1, Ordering::Release);
    list.changes.store(ShmPtr::EMPTY.0, Ordering::Release);
    Ok(ptr)
}

// ---------------------------------------------------------------------------
// Growth
// ---------------------------------------------------------------------------

/// Replace `old_block` with a double-capacity copy. Cell ownership moves to
/// the copy: the old block's pointers are blanked before it is released.
fn grow_block(
    thread: &ThreadContext,
    old_ptr: ShmPtr,
    new_capacity: usize,
) -> Result<ShmPtr, Status> {
    let region = thread.region();
    let new_ptr = new_block(thread, new_capacity)?;
    let old: &ListBlock = region.deref(old_ptr).ok_or(Status::Failure)?;
    let old_cells = cells_of(region, old_ptr).ok_or(Status::Failure)?;
    let new: &ListBlock = region.deref(new_ptr).ok_or(Status::Failure)?;
    let new_cells = cells_of(region, new_ptr).ok_or(Status::Failure)?;

    let committed_fill = old.deleted.load(Ordering::SeqCst) + old.count.load(Ordering::SeqCst);
    let staged_fill =
        staged(&old.new_deleted, &old.deleted) + staged(&old.new_count, &old.count);
    let fill = committed_fill.max(staged_fill) as usize;
    for i in 0..fill {
        new_cells[i].data.store(old_cells[i].data.load(Ordering::SeqCst), Ordering::SeqCst);
        new_cells[i]
            .has_new_data
            .store(old_cells[i].has_new_data.load(Ordering::SeqCst), Ordering::SeqCst);
        new_cells[i]
            .changed
            .store(old_cells[i].changed.load(Ordering::SeqCst), Ordering::SeqCst);
        new_cells[i]
            .new_data
            .store(old_cells[i].new_data.load(Ordering::SeqCst), Ordering::SeqCst);
        // ownership moved: blank the source so release of the old block
        // does not touch the transferred references
        old_cells[i].data.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
        old_cells[i].new_data.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
        old_cells[i].has_new_data.store(0, Ordering::SeqCst);
        old_cells[i].changed.store(0, Ordering::SeqCst);
    }
    new.count.store(old.count.load(Ordering::SeqCst), Ordering::SeqCst);
    new.new_count.store(old.new_count.load(Ordering::SeqCst), Ordering::SeqCst);
    new.deleted.store(old.deleted.load(Ordering::SeqCst), Ordering::SeqCst);
    new.new_deleted.store(old.new_deleted.load(Ordering::SeqCst), Ordering::SeqCst);

    old.count.store(0, Ordering::SeqCst);
    old.deleted.store(0, Ordering::SeqCst);
    old.new_count.store(-1, Ordering::SeqCst);
    old.new_deleted.store(-1, Ordering::SeqCst);
    block::release(thread, old_ptr);
    Ok(new_ptr)
}

/// The writable tail block, growing storage as needed. Returns
/// (block_index, block_ptr).
fn writable_tail(thread: &ThreadContext, list: &ShmList) -> Result<(usize, ShmPtr), Status> {
    let region = thread.region();
    let blocks = collect_blocks(region, list);
    debug_assert!(!blocks.is_empty());
    let tail_index = blocks.len() - 1;
    let tail_ptr = blocks[tail_index];
    let tail: &ListBlock = region.deref(tail_ptr).ok_or(Status::Failure)?;

    let fill = staged(&tail.new_deleted, &tail.deleted) + staged(&tail.new_count, &tail.count);
    let capacity = tail.capacity.load(Ordering::SeqCst);
    if fill < capacity {
        return Ok((tail_index, tail_ptr));
    }

    if (capacity as usize) < MAX_BLOCK_CELLS {
        let grown = grow_block(thread, tail_ptr, (capacity as usize * 2).min(MAX_BLOCK_CELLS))?;
        let top = ShmPtr(list.top_block.load(Ordering::SeqCst));
        if is_index(region, top) {
            let items = index_items(region, top).ok_or(Status::Failure)?;
            items[tail_index].block.store(grown.0, Ordering::SeqCst);
        } else {
            list.top_block.store(grown.0, Ordering::SeqCst);
        }
        return Ok((tail_index, grown));
    }

    // tail is at the cap: start a new tail block and rebuild the index
    let fresh = new_block(thread, INITIAL_CAPACITY)?;
    let mut all = blocks;
    all.push(fresh);
    let new_index_ptr = new_index(thread, &all)?; // acquires every block
    let top = ShmPtr(list.top_block.swap(new_index_ptr.0, Ordering::SeqCst));
    block::release(thread, top); // old top (block or index) loses the list's reference
    block::release(thread, fresh); // creation reference; the index keeps its own
    Ok((tail_index + 1, fresh))
}

// ---------------------------------------------------------------------------
// Operations (write lock held by the transaction layer)
// ---------------------------------------------------------------------------

pub(crate) fn append_op(
    thread: &ThreadContext,
    list_ptr: ShmPtr,
    value: ShmPtr,
) -> Result<i32, Status> {
    match thread.lock_write(list_ptr, ContainerKind::List) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let list: &ShmList = region.deref(list_ptr).ok_or(Status::Failure)?;

    let (block_index, block_ptr) = writable_tail(thread, list)?;
    let block: &ListBlock = region.deref(block_ptr).ok_or(Status::Failure)?;
    let cells = cells_of(region, block_ptr).ok_or(Status::Failure)?;

    let fill =
        (staged(&block.new_deleted, &block.deleted) + staged(&block.new_count, &block.count)) as usize;
    debug_assert!(fill < cells.len());
    let cell = &cells[fill];
    debug_assert_eq!(cell.has_new_data.load(Ordering::SeqCst), 0);
    cell.new_data.store(value.0, Ordering::SeqCst);
    cell.has_new_data.store(1, Ordering::SeqCst);
    if cell.changed.swap(1, Ordering::SeqCst) == 0 {
        changelog::push(
            thread,
            &list.changes,
            TAG_LIST_CHANGES,
            debug_id::LIST_CHANGES,
            pack_entry(block_index, fill),
        )?;
    }

    block
        .new_count
        .store(staged(&block.new_count, &block.count) + 1, Ordering::SeqCst);
    mirror_index_item(region, list, block_index, block_ptr);

    let list_count = staged(&list.new_count, &list.count);
    list.new_count.store(list_count + 1, Ordering::SeqCst);
    Ok(list_count)
}

/// Keep an index item's counters equal to its block's.
fn mirror_index_item(region: &Region, list: &ShmList, block_index: usize, block_ptr: ShmPtr) {
    let top = ShmPtr(list.top_block.load(Ordering::SeqCst));
    if !is_index(region, top) {
        return;
    }
    let Some(items) = index_items(region, top) else {
        return;
    };
    let Some(block) = region.deref::<ListBlock>(block_ptr) else {
        return;
    };
    let item = &items[block_index];
    item.count.store(block.count.load(Ordering::SeqCst), Ordering::SeqCst);
    item.new_count.store(block.new_count.load(Ordering::SeqCst), Ordering::SeqCst);
    item.deleted.store(block.deleted.load(Ordering::SeqCst), Ordering::SeqCst);
    item.new_deleted.store(block.new_deleted.load(Ordering::SeqCst), Ordering::SeqCst);
}

/// Locate the cell at logical `index` in the caller's view.
fn locate(
    region: &Region,
    list: &ShmList,
    index: i32,
    owner: bool,
) -> Result<(usize, ShmPtr, usize), Status> {
    if index < 0 {
        return Err(Status::Invalid);
    }
    let blocks = collect_blocks(region, list);
    let mut remaining = index;
    for (bi, &block_ptr) in blocks.iter().enumerate() {
        let block: &ListBlock = region.deref(block_ptr).ok_or(Status::Failure)?;
        let count = if owner {
            staged(&block.new_count, &block.count)
        } else {
            block.count.load(Ordering::SeqCst)
        };
        if remaining < count {
            let deleted = if owner {
                staged(&block.new_deleted, &block.deleted)
            } else {
                block.deleted.load(Ordering::SeqCst)
            };
            return Ok((bi, block_ptr, (deleted + remaining) as usize));
        }
        remaining -= count;
    }
    Err(Status::Invalid)
}

pub(crate) fn get_op(
    thread: &ThreadContext,
    list_ptr: ShmPtr,
    index: i32,
) -> Result<ShmPtr, Status> {
    match thread.lock_read(list_ptr, ContainerKind::List) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let list: &ShmList = region.deref(list_ptr).ok_or(Status::Failure)?;
    let owner = have_write_lock(thread, &list.head.lock);
    let (_, block_ptr, cell_index) = locate(region, list, index, owner)?;
    let cells = cells_of(region, block_ptr).ok_or(Status::Failure)?;
    let cell = &cells[cell_index];
    let ptr = if owner && cell.has_new_data.load(Ordering::SeqCst) != 0 {
        ShmPtr(cell.new_data.load(Ordering::SeqCst))
    } else {
        ShmPtr(cell.data.load(Ordering::SeqCst))
    };
    block::acq(region, ptr);
    Ok(ptr)
}

pub(crate) fn set_op(
    thread: &ThreadContext,
    list_ptr: ShmPtr,
    index: i32,
    value: ShmPtr,
) -> Result<(), Status> {
    match thread.lock_write(list_ptr, ContainerKind::List) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let list: &ShmList = region.deref(list_ptr).ok_or(Status::Failure)?;
    let (block_index, block_ptr, cell_index) = locate(region, list, index, true)?;
    let cells = cells_of(region, block_ptr).ok_or(Status::Failure)?;
    let cell = &cells[cell_index];
    if cell.has_new_data.load(Ordering::SeqCst) != 0 {
        block::move_ptr(thread, &cell.new_data, value);
    } else {
        cell.new_data.store(value.0, Ordering::SeqCst);
        cell.has_new_data.store(1, Ordering::SeqCst);
    }
    if cell.changed.swap(1, Ordering::SeqCst) == 0 {
        changelog::push(
            thread,
            &list.changes,
            TAG_LIST_CHANGES,
            debug_id::LIST_CHANGES,
            pack_entry(block_index, cell_index),
        )?;
    }
    Ok(())
}

pub(crate) fn popleft_op(thread: &ThreadContext, list_ptr: ShmPtr) -> Result<ShmPtr, Status> {
    match thread.lock_write(list_ptr, ContainerKind::List) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let list: &ShmList = region.deref(list_ptr).ok_or(Status::Failure)?;
    if staged(&list.new_count, &list.count) <= 0 {
        return Err(Status::Invalid);
    }
    let (block_index, block_ptr, cell_index) = locate(region, list, 0, true)?;
    let block: &ListBlock = region.deref(block_ptr).ok_or(Status::Failure)?;
    let cells = cells_of(region, block_ptr).ok_or(Status::Failure)?;
    let cell = &cells[cell_index];

    // hand the effective value to the caller with its own reference
    let result = if cell.has_new_data.load(Ordering::SeqCst) != 0 {
        ShmPtr(cell.new_data.load(Ordering::SeqCst))
    } else {
        ShmPtr(cell.data.load(Ordering::SeqCst))
    };
    block::acq(region, result);

    // stage the deletion: the slot's staged value becomes EMPTY and the
    // cursor advances
    if cell.has_new_data.load(Ordering::SeqCst) != 0 {
        block::clear_ptr(thread, &cell.new_data);
    } else {
        cell.new_data.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
        cell.has_new_data.store(1, Ordering::SeqCst);
    }
    if cell.changed.swap(1, Ordering::SeqCst) == 0 {
        changelog::push(
            thread,
            &list.changes,
            TAG_LIST_CHANGES,
            debug_id::LIST_CHANGES,
            pack_entry(block_index, cell_index),
        )?;
    }

    block
        .new_deleted
        .store(staged(&block.new_deleted, &block.deleted) + 1, Ordering::SeqCst);
    block
        .new_count
        .store(staged(&block.new_count, &block.count) - 1, Ordering::SeqCst);
    mirror_index_item(region, list, block_index, block_ptr);

    list.new_deleted
        .store(staged(&list.new_deleted, &list.deleted) + 1, Ordering::SeqCst);
    list.new_count
        .store(staged(&list.new_count, &list.count) - 1, Ordering::SeqCst);
    Ok(result)
}

pub(crate) fn count_op(thread: &ThreadContext, list_ptr: ShmPtr) -> Result<(i32, i32), Status> {
    match thread.lock_read(list_ptr, ContainerKind::List) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let list: &ShmList = region.deref(list_ptr).ok_or(Status::Failure)?;
    let owner = have_write_lock(thread, &list.head.lock);
    if owner {
        Ok((
            staged(&list.new_count, &list.count),
            staged(&list.new_deleted, &list.deleted),
        ))
    } else {
        Ok((
            list.count.load(Ordering::SeqCst),
            list.deleted.load(Ordering::SeqCst),
        ))
    }
}

// ---------------------------------------------------------------------------
// Commit, rollback, destroy
// ---------------------------------------------------------------------------

fn for_each_logged<F: FnMut(&ListCell)>(region: &Region, list: &ShmList, mut f: F) {
    let log_ptr = ShmPtr(list.changes.load(Ordering::SeqCst));
    if !log_ptr.is_set() {
        return;
    }
    let n = changelog::count(region, log_ptr);
    let Some(entries) = changelog::entries(region, log_ptr) else {
        return;
    };
    let blocks = collect_blocks(region, list);
    for entry in entries.iter().take(n) {
        let (bi, ci) = unpack_entry(entry.load(Ordering::SeqCst));
        if bi >= blocks.len() {
            continue;
        }
        if let Some(cells) = cells_of(region, blocks[bi]) {
            if ci < cells.len() {
                f(&cells[ci]);
            }
        }
    }
}

pub(crate) fn commit_list(thread: &ThreadContext, list_ptr: ShmPtr) {
    let region = thread.region();
    let Some(list) = region.deref::<ShmList>(list_ptr) else {
        return;
    };

    // publish staged cells first, counts second: a reader that observes the
    // new counts also observes the data they describe
    for_each_logged(region, list, |cell| {
        if cell.has_new_data.load(Ordering::SeqCst) != 0 {
            let fresh = ShmPtr(cell.new_data.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
            cell.has_new_data.store(0, Ordering::SeqCst);
            block::move_ptr(thread, &cell.data, fresh);
        }
        cell.changed.store(0, Ordering::SeqCst);
    });

    let blocks = collect_blocks(region, list);
    for (bi, &block_ptr) in blocks.iter().enumerate() {
        let Some(block) = region.deref::<ListBlock>(block_ptr) else {
            continue;
        };
        let nc = block.new_count.swap(-1, Ordering::SeqCst);
        if nc != -1 {
            block.count.store(nc, Ordering::SeqCst);
        }
        let nd = block.new_deleted.swap(-1, Ordering::SeqCst);
        if nd != -1 {
            block.deleted.store(nd, Ordering::SeqCst);
        }
        mirror_index_item(region, list, bi, block_ptr);
    }

    let nc = list.new_count.swap(-1, Ordering::SeqCst);
    if nc != -1 {
        list.count.store(nc, Ordering::SeqCst);
    }
    let nd = list.new_deleted.swap(-1, Ordering::SeqCst);
    if nd != -1 {
        list.deleted.store(nd, Ordering::SeqCst);
    }

    drop_exhausted_heads(thread, list);

    let log_ptr = ShmPtr(list.changes.load(Ordering::SeqCst));
    if log_ptr.is_set() {
        changelog::clear(region, log_ptr);
    }
}

/// Rebuild the index without fully consumed head blocks. The last block
/// always survives, even when empty.
fn drop_exhausted_heads(thread: &ThreadContext, list: &ShmList) {
    let region = thread.region();
    let top = ShmPtr(list.top_block.load(Ordering::SeqCst));
    if !is_index(region, top) {
        return;
    }
    let blocks = collect_blocks(region, list);
    let mut first_live = 0;
    for (i, &block_ptr) in blocks.iter().enumerate() {
        if i == blocks.len() - 1 {
            break; // the last block must not be dropped
        }
        let Some(block) = region.deref::<ListBlock>(block_ptr) else {
            break;
        };
        let count = block.count.load(Ordering::SeqCst);
        let capacity = block.capacity.load(Ordering::SeqCst);
        let deleted = block.deleted.load(Ordering::SeqCst);
        if count == 0 && deleted == capacity {
            first_live = i + 1;
        } else {
            break;
        }
    }
    if first_live == 0 {
        return;
    }

    let survivors: Vec<ShmPtr> = blocks[first_live..].to_vec();
    let new_top = if survivors.len() == 1 {
        survivors[0]
    } else {
        match new_index(thread, &survivors) {
            Ok(p) => p,
            Err(_) => return,
        }
    };
    if survivors.len() == 1 {
        block::acq(region, new_top); // it gains a direct reference from the list
    }
    let old_index = ShmPtr(list.top_block.swap(new_top.0, Ordering::SeqCst));

    // deleted-range totals move out of the aggregate
    let mut dropped = 0;
    for &block_ptr in &blocks[..first_live] {
        if let Some(block) = region.deref::<ListBlock>(block_ptr) {
            dropped += block.deleted.load(Ordering::SeqCst);
        }
    }
    list.deleted.fetch_sub(dropped, Ordering::SeqCst);

    block::release(thread, old_index); // releases the dropped blocks with it
}

pub(crate) fn rollback_list(thread: &ThreadContext, list_ptr: ShmPtr) {
    let region = thread.region();
    let Some(list) = region.deref::<ShmList>(list_ptr) else {
        return;
    };

    for_each_logged(region, list, |cell| {
        if cell.has_new_data.load(Ordering::SeqCst) != 0 {
            cell.has_new_data.store(0, Ordering::SeqCst);
            block::clear_ptr(thread, &cell.new_data);
        }
        cell.changed.store(0, Ordering::SeqCst);
    });

    let blocks = collect_blocks(region, list);
    for (bi, &block_ptr) in blocks.iter().enumerate() {
        if let Some(block) = region.deref::<ListBlock>(block_ptr) {
            block.new_count.store(-1, Ordering::SeqCst);
            block.new_deleted.store(-1, Ordering::SeqCst);
            mirror_index_item(region, list, bi, block_ptr);
        }
    }
    list.new_count.store(-1, Ordering::SeqCst);
    list.new_deleted.store(-1, Ordering::SeqCst);

    let log_ptr = ShmPtr(list.changes.load(Ordering::SeqCst));
    if log_ptr.is_set() {
        changelog::clear(region, log_ptr);
    }
}

pub(crate) fn destroy_list(thread: &ThreadContext, list_ptr: ShmPtr) {
    let region = thread.region();
    let Some(list) = region.deref::<ShmList>(list_ptr) else {
        return;
    };
    let top = ShmPtr(list.top_block.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    block::release(thread, top);
    let log_ptr = ShmPtr(list.changes.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    if log_ptr.is_set() {
        thread.push_free(log_ptr);
    }
}

pub(crate) fn destroy_list_block(thread: &ThreadContext, block_ptr: ShmPtr) {
    let region = thread.region();
    let Some(block) = region.deref::<ListBlock>(block_ptr) else {
        return;
    };
    let fill = (block.deleted.load(Ordering::SeqCst) + block.count.load(Ordering::SeqCst))
        .max(staged(&block.new_deleted, &block.deleted) + staged(&block.new_count, &block.count));
    let Some(cells) = cells_of(region, block_ptr) else {
        return;
    };
    for cell in cells.iter().take(fill.max(0) as usize) {
        block::clear_ptr(thread, &cell.data);
        if cell.has_new_data.swap(0, Ordering::SeqCst) != 0 {
            block::clear_ptr(thread, &cell.new_data);
        }
    }
}

pub(crate) fn destroy_list_index(thread: &ThreadContext, index_ptr: ShmPtr) {
    let region = thread.region();
    let Some(items) = index_items(region, index_ptr) else {
        return;
    };
    for item in items {
        let block_ptr = ShmPtr(item.block.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
        block::release(thread, block_ptr);
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A copyable handle to a list in the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListRef(pub ShmPtr);

impl ListRef {
    pub fn new(thread: &ThreadContext) -> StoreResult<ListRef> {
        thread.with_transaction(|t| new_list(t).map(ListRef))
    }

    pub fn with_capacity(thread: &ThreadContext, capacity: usize) -> StoreResult<ListRef> {
        thread.with_transaction(|t| new_list_with_capacity(t, capacity).map(ListRef))
    }

    /// Append a value pointer; the caller's reference moves into the list.
    /// Returns the commit-time index.
    pub fn append_consume(&self, thread: &ThreadContext, value: ShmPtr) -> StoreResult<i32> {
        let ptr = self.0;
        thread.with_transaction(|t| append_op(t, ptr, value))
    }

    pub fn append_str(&self, thread: &ThreadContext, s: &str) -> StoreResult<i32> {
        let value = thread.with_transaction(|t| crate::value::new_string(t, s))?;
        self.append_consume(thread, value)
    }

    /// Acquired pointer to the value at `index`; the caller releases.
    pub fn get_owned(&self, thread: &ThreadContext, index: i32) -> StoreResult<ShmPtr> {
        let ptr = self.0;
        thread.with_transaction(|t| get_op(t, ptr, index))
    }

    pub fn get_str(&self, thread: &ThreadContext, index: i32) -> StoreResult<Option<String>> {
        let ptr = self.get_owned(thread, index)?;
        let result = crate::value::get_string(thread.region(), ptr);
        block::release(thread, ptr);
        Ok(result)
    }

    pub fn set_consume(&self, thread: &ThreadContext, index: i32, value: ShmPtr) -> StoreResult<()> {
        let ptr = self.0;
        thread.with_transaction(|t| set_op(t, ptr, index, value))
    }

    /// Pop the head value; `Invalid` when the list is empty.
    pub fn popleft_owned(&self, thread: &ThreadContext) -> StoreResult<ShmPtr> {
        let ptr = self.0;
        thread.with_transaction(|t| popleft_op(t, ptr))
    }

    pub fn popleft_str(&self, thread: &ThreadContext) -> StoreResult<Option<String>> {
        let ptr = self.popleft_owned(thread)?;
        let result = crate::value::get_string(thread.region(), ptr);
        block::release(thread, ptr);
        Ok(result)
    }

    /// (count, deleted) in the caller's view.
    pub fn counts(&self, thread: &ThreadContext) -> StoreResult<(i32, i32)> {
        let ptr = self.0;
        thread.with_transaction(|t| count_op(t, ptr))
    }

    pub fn len(&self, thread: &ThreadContext) -> StoreResult<i32> {
        Ok(self.counts(thread)?.0)
    }

    pub fn is_empty(&self, thread: &ThreadContext) -> StoreResult<bool> {
        Ok(self.len(thread)? == 0)
    }
}
