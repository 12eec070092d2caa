// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Block headers and the cross-process refcount discipline.
//
// Every allocation starts with a type tag and a size. Refcounted blocks add
// the (refcount, revival_count, release_count) trio: a reader may briefly
// resurrect a block whose refcount hit zero, and the revival/release pair
// tells the reclaimer how many extra release requests it still owes the
// block before the bytes can go back to the heap.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use crate::region::Region;
use crate::shm_ptr::ShmPtr;
use crate::thread_ctx::ThreadContext;

// ---------------------------------------------------------------------------
// Type tags
// ---------------------------------------------------------------------------

pub const FLAG_REFCOUNTED: u32 = 1 << 8;
pub const FLAG_CONTAINED: u32 = 2 << 8;
pub const FLAG_MUTABLE: u32 = 4 << 8;
pub const TYPE_MASK: u32 = (1 << 8) - 1;
/// High byte of the tag; set exactly once when a block is handed to the
/// reclaimer. A second marking is a double free.
pub const RELEASE_MARK: u32 = 0xFF00_0000;

/// Flag combination shared by every lockable container.
pub const CONTAINER_FLAGS: u32 = FLAG_MUTABLE | FLAG_REFCOUNTED;

pub const TAG_BOOL: u32 = 0x01 | FLAG_REFCOUNTED;
pub const TAG_INT: u32 = 0x02 | FLAG_REFCOUNTED;
pub const TAG_FLOAT: u32 = 0x03 | FLAG_REFCOUNTED;
pub const TAG_STRING: u32 = 0x04 | FLAG_REFCOUNTED;
pub const TAG_BYTES: u32 = 0x05 | FLAG_REFCOUNTED;
pub const TAG_TRANSACTION_ELEMENT: u32 = 0x10;
pub const TAG_CELL: u32 = 0x20 | CONTAINER_FLAGS;
pub const TAG_TUPLE: u32 = 0x30 | FLAG_REFCOUNTED;
pub const TAG_LIST: u32 = 0x40 | CONTAINER_FLAGS;
pub const TAG_LIST_BLOCK: u32 = 0x41 | FLAG_REFCOUNTED;
pub const TAG_LIST_INDEX: u32 = 0x44 | FLAG_REFCOUNTED;
pub const TAG_LIST_CHANGES: u32 = 0x48;
pub const TAG_QUEUE: u32 = 0x50 | CONTAINER_FLAGS;
pub const TAG_QUEUE_CELL: u32 = 0x51 | CONTAINER_FLAGS;
pub const TAG_QUEUE_CHANGES: u32 = 0x54;
pub const TAG_DICT: u32 = 0x60 | CONTAINER_FLAGS;
pub const TAG_DICT_NODE: u32 = 0x61;
pub const TAG_DICT_DELTA: u32 = 0x64;
pub const TAG_UNDICT: u32 = 0x70 | CONTAINER_FLAGS;
pub const TAG_UNDICT_TABLE: u32 = 0x74 | FLAG_REFCOUNTED;
pub const TAG_UNDICT_DELTA_TABLE: u32 = 0x76 | FLAG_REFCOUNTED;
pub const TAG_PROMISE: u32 = 0x80 | CONTAINER_FLAGS;
pub const TAG_FREE_LIST: u32 = 0x90;

#[inline]
pub fn base_tag(tag: u32) -> u32 {
    tag & TYPE_MASK
}

#[inline]
pub fn is_refcounted(tag: u32) -> bool {
    tag & FLAG_REFCOUNTED != 0
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Common prefix of every block.
#[repr(C)]
pub struct AbstractHeader {
    pub type_tag: AtomicU32,
    /// Total bytes of the block, header included.
    pub size: AtomicI32,
}

impl AbstractHeader {
    pub fn init(&self, tag: u32, size: usize) {
        self.type_tag.store(tag, Ordering::Release);
        self.size.store(size as i32, Ordering::Release);
    }

    pub fn tag(&self) -> u32 {
        self.type_tag.load(Ordering::Acquire)
    }
}

/// Header of every refcounted block.
#[repr(C)]
pub struct RefHeader {
    pub type_tag: AtomicU32,
    pub size: AtomicI32,
    pub refcount: AtomicI32,
    pub revival_count: AtomicI32,
    pub release_count: AtomicI32,
}

impl RefHeader {
    /// Initialise with refcount 1 (the creating reference).
    pub fn init(&self, tag: u32, size: usize) {
        debug_assert!(is_refcounted(tag));
        self.type_tag.store(tag, Ordering::Release);
        self.size.store(size as i32, Ordering::Release);
        self.refcount.store(1, Ordering::Release);
        self.revival_count.store(0, Ordering::Release);
        self.release_count.store(0, Ordering::Release);
    }

    pub fn tag(&self) -> u32 {
        self.type_tag.load(Ordering::Acquire)
    }

    /// Set the release mark; returns false when it was already set
    /// (a double free).
    pub fn mark_released(&self) -> bool {
        let prev = self.type_tag.fetch_or(RELEASE_MARK, Ordering::AcqRel);
        prev & RELEASE_MARK != RELEASE_MARK
    }
}

/// View `ptr` as a refcounted block, checking the flag in its tag.
pub fn as_refcounted(region: &Region, ptr: ShmPtr) -> Option<&RefHeader> {
    let header: &RefHeader = region.deref(ptr)?;
    if is_refcounted(header.tag()) {
        Some(header)
    } else {
        None
    }
}

/// Add one reference. An increment from zero revives the block: the
/// reclaimer then owes it one extra release request.
pub fn acq(region: &Region, ptr: ShmPtr) {
    if !ptr.is_set() {
        return;
    }
    if let Some(header) = as_refcounted(region, ptr) {
        let prev = header.refcount.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev >= 0);
        if prev == 0 {
            header.revival_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Drop one reference; at zero the pointer goes onto the calling thread's
/// free list for the reclaimer.
pub fn release(thread: &ThreadContext, ptr: ShmPtr) {
    if !ptr.is_set() {
        return;
    }
    let Some(header) = as_refcounted(thread.region(), ptr) else {
        debug_assert!(false, "release of a non-refcounted block");
        return;
    };
    let now = header.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
    debug_assert!(now >= 0, "refcount went negative");
    if now == 0 {
        thread.push_free(ptr);
    }
}

/// Store `source` into `*dest` (releasing nothing) and take a reference.
pub fn acq_store(region: &Region, dest: &AtomicUsize, source: ShmPtr) {
    acq(region, source);
    dest.store(source.0, Ordering::SeqCst);
}

/// Replace `*dest` with EMPTY, releasing the displaced pointer.
pub fn clear_ptr(thread: &ThreadContext, dest: &AtomicUsize) {
    let old = ShmPtr(dest.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    release(thread, old);
}

/// Replace `*dest` with `source`, releasing the displaced pointer. The
/// reference held on `source` transfers to the slot.
pub fn move_ptr(thread: &ThreadContext, dest: &AtomicUsize, source: ShmPtr) {
    let old = ShmPtr(dest.swap(source.0, Ordering::SeqCst));
    release(thread, old);
}

// ---------------------------------------------------------------------------
// Free-list blocks
// ---------------------------------------------------------------------------

pub const FREE_LIST_CAPACITY: usize = 50;

/// A bounded batch of released pointers, CAS-published to the thread slot
/// when full and drained by the reclaimer.
#[repr(C)]
pub struct FreeListBlock {
    pub header: AbstractHeader, // TAG_FREE_LIST
    pub capacity: i32,
    pub count: AtomicI32,
    pub next: AtomicUsize, // ShmPtr of the next published batch
    pub items: [AtomicUsize; FREE_LIST_CAPACITY],
}

impl FreeListBlock {
    pub fn init(&mut self) {
        self.header
            .init(TAG_FREE_LIST, std::mem::size_of::<FreeListBlock>());
        self.capacity = FREE_LIST_CAPACITY as i32;
        self.count.store(0, Ordering::Release);
        self.next.store(ShmPtr::EMPTY.0, Ordering::Release);
    }

    pub fn is_full(&self) -> bool {
        self.count.load(Ordering::Acquire) >= self.capacity
    }

    pub fn push(&self, ptr: ShmPtr) {
        let idx = self.count.load(Ordering::Acquire);
        debug_assert!((idx as usize) < FREE_LIST_CAPACITY);
        self.items[idx as usize].store(ptr.0, Ordering::Release);
        self.count.store(idx + 1, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Destructors
// ---------------------------------------------------------------------------

/// Run the type-specific destructor of a dead block: release every fat
/// pointer it holds, staged or committed. Called by the reclaimer with its
/// own thread context, so child releases queue up for a later cycle.
pub fn destroy_block(thread: &ThreadContext, ptr: ShmPtr) {
    let region = thread.region();
    let Some(header) = region.deref::<AbstractHeader>(ptr) else {
        return;
    };
    let tag = header.tag();
    if is_refcounted(tag) {
        let Some(refs) = region.deref::<RefHeader>(ptr) else {
            return;
        };
        let fresh = refs.mark_released();
        debug_assert!(fresh, "double release of {ptr:?}");
        if !fresh {
            return;
        }
    }
    match tag & !RELEASE_MARK {
        t if t == TAG_BOOL || t == TAG_INT || t == TAG_FLOAT || t == TAG_STRING || t == TAG_BYTES => {}
        t if t == TAG_TUPLE => crate::value::destroy_tuple(thread, ptr),
        t if t == TAG_CELL => crate::cell::destroy_cell(thread, ptr),
        t if t == TAG_LIST => crate::list::destroy_list(thread, ptr),
        t if t == TAG_LIST_BLOCK => crate::list::destroy_list_block(thread, ptr),
        t if t == TAG_LIST_INDEX => crate::list::destroy_list_index(thread, ptr),
        t if t == TAG_QUEUE => crate::queue::destroy_queue(thread, ptr),
        t if t == TAG_QUEUE_CELL => crate::queue::destroy_queue_cell(thread, ptr),
        t if t == TAG_DICT => crate::dict::destroy_dict(thread, ptr),
        t if t == TAG_UNDICT => crate::undict::destroy_undict(thread, ptr),
        t if t == TAG_UNDICT_TABLE || t == TAG_UNDICT_DELTA_TABLE => {
            crate::undict::destroy_table(thread, ptr)
        }
        t if t == TAG_PROMISE => crate::promise::destroy_promise(thread, ptr),
        // change logs, dict nodes and transaction elements hold no owned
        // references
        t if t == TAG_LIST_CHANGES
            || t == TAG_QUEUE_CHANGES
            || t == TAG_DICT_NODE
            || t == TAG_DICT_DELTA
            || t == TAG_TRANSACTION_ELEMENT
            || t == TAG_FREE_LIST => {}
        other => debug_assert!(false, "destroy_block: unknown tag {other:#x}"),
    }
}
