// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Size-classed shared-memory allocator.
//
// superheap -> per-thread heap -> sector (1 MiB chunk) -> segment -> block.
// Small blocks live in 4 KiB segments that are bound to one size class at
// first use and never change it. Medium blocks live in flex sectors divided
// into power-of-two buddies that are split lazily on demand. Every sector
// stores a back-reference to its owning heap; blocks may be freed by any
// thread but only through the owning heap's lock.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::region::{ChunkHeader, Region, CHUNK_SIZE, CHUNK_TYPE_SECTOR, CHUNK_TYPE_SECTOR_FLEX};
use crate::shm_ptr::ShmPtr;
use crate::status::Status;
use crate::sync::SimpleLock;

pub const SEGMENT_SIZE: usize = 4096;

pub const SMALL_CLASS_COUNT: usize = 9;
const SMALL_SIZES_ORIG: [usize; SMALL_CLASS_COUNT] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];

pub const MEDIUM_CLASS_COUNT: usize = 8;
/// Nominal size of the largest medium block; the effective size is slightly
/// smaller so that headers fit (see `MEDIUM_SIZE_MAP`).
const MEDIUM_LARGEST_ORIG: usize = 128 * 1024;

const ALIGN_BITS: usize = 3; // 8-byte alignment

/// Guard word at the tail of every allocated payload slot.
pub const GUARD_BYTES: u32 = 0xCCCC_CCCC;
/// Magic in every live small-block header.
const SMALL_MAGIC: u32 = 0xBBBB_BBBB;

/// Invalid sector offset ("no link").
const INVALID_OFF: i32 = -1;

const fn align_lower(value: usize, bits: usize) -> usize {
    value & !((1 << bits) - 1)
}

const fn align_higher(value: usize, bits: usize) -> usize {
    ((value - 1) & !((1 << bits) - 1)) + (1 << bits)
}

// ---------------------------------------------------------------------------
// Shared structures
// ---------------------------------------------------------------------------

/// Doubly-ended list of sectors owned by one heap.
#[repr(C)]
pub struct SectorList {
    pub head: AtomicUsize, // ShmPtr, EMPTY when the list is empty
    pub tail: AtomicUsize,
}

impl SectorList {
    fn init(&self) {
        self.head.store(ShmPtr::EMPTY.0, Ordering::Release);
        self.tail.store(ShmPtr::EMPTY.0, Ordering::Release);
    }

    fn head_ptr(&self) -> ShmPtr {
        ShmPtr(self.head.load(Ordering::Acquire))
    }
}

/// Per-thread heap descriptor, embedded in the superblock's superheap.
#[repr(C)]
pub struct ShmHeap {
    pub lock: SimpleLock,
    pub thread_index: AtomicI32,
    pub fixed_sectors: SectorList,
    pub flex_sectors: SectorList,
}

impl ShmHeap {
    pub fn init(&self, index: usize) {
        self.lock.init();
        self.thread_index.store(index as i32, Ordering::Release);
        self.fixed_sectors.init();
        self.flex_sectors.init();
    }
}

/// Header at the start of every 4 KiB segment. For segment 0 of a sector
/// this is the leading part of `SectorHeader` (the two headers are merged so
/// the first segment is not wasted).
#[repr(C)]
pub struct SegmentHeader {
    pub chunk: ChunkHeader, // meaningful for segment 0 only
    pub header_size: i32,
    pub sector: AtomicUsize, // ShmPtr of the containing sector chunk
    /// Sector offset of the next segment in the same class head list.
    pub next_segment: i32,
    /// 1 while linked into `segments_heads[size_class]`.
    pub in_heads: i32,
    pub size_class: i32,
    pub element_size: i32,
    /// Sector offset of the first free block header; 0 = none.
    pub free_blocks_head: i32,
    /// Blocks handed out so far (bump cursor).
    pub capacity: i32,
    pub max_capacity: i32,
    pub used_count: i32,
}

/// Head of the slot list for segments that were never assigned a class.
const EMPTY_SEGMENTS: usize = SMALL_CLASS_COUNT;

/// Sector header of a small-block sector, merged with segment 0's header.
#[repr(C)]
pub struct SectorHeader {
    pub segment: SegmentHeader,
    pub heap: AtomicUsize, // ShmPtr of the owning ShmHeap (superblock offset)
    pub next_sector: AtomicUsize,
    pub prev_sector: AtomicUsize,
    /// Per-class sector offsets of the first segment with free slots, plus
    /// one extra slot tracking the next never-claimed segment.
    pub segments_heads: [i32; SMALL_CLASS_COUNT + 1],
}

pub const SEGMENT_HEADER_SIZE: usize = align_higher(std::mem::size_of::<SegmentHeader>(), ALIGN_BITS);
pub const SECTOR_HEADER_SIZE: usize = align_higher(std::mem::size_of::<SectorHeader>(), ALIGN_BITS);

/// Bookkeeping in front of every small-block payload.
#[repr(C)]
struct SmallBlockHeader {
    /// Sector offset of the next free block header; 0 = none.
    next: i32,
    debug_id: i32,
    magic: u32,
    _pad: u32,
}

pub const SMALL_BLOCK_HEADER_SIZE: usize =
    align_higher(std::mem::size_of::<SmallBlockHeader>(), ALIGN_BITS);

/// Header of a medium (flex) block; the payload follows it.
#[repr(C)]
pub struct FlexBlockHeader {
    pub sector: AtomicUsize, // ShmPtr of the containing flex sector
    pub next_free: i32,
    pub prev_free: i32,
    /// Neighbour chain in address order, spanning the whole sector.
    pub next_block: i32,
    pub prev_block: i32,
    pub claimed: i32,
    pub size_class: i32,
    pub debug_id: i32,
}

pub const FLEX_BLOCK_HEADER_SIZE: usize =
    align_higher(std::mem::size_of::<FlexBlockHeader>(), ALIGN_BITS);

/// Sector header of a flex (medium-block) sector.
#[repr(C)]
pub struct FlexSectorHeader {
    pub chunk: ChunkHeader,
    pub self_ptr: AtomicUsize,
    pub heap: AtomicUsize,
    pub next_sector: AtomicUsize,
    pub prev_sector: AtomicUsize,
    pub class_heads: [i32; MEDIUM_CLASS_COUNT],
    pub class_tails: [i32; MEDIUM_CLASS_COUNT],
}

pub const FLEX_SECTOR_HEADER_SIZE: usize =
    align_higher(std::mem::size_of::<FlexSectorHeader>(), ALIGN_BITS);

// ---------------------------------------------------------------------------
// Size maps
// ---------------------------------------------------------------------------

/// Effective small class sizes: the nominal powers of two, adjusted down so
/// that `sector_header + k * (block_header + class)` uses a segment fully.
pub const SMALL_SIZE_MAP: [usize; SMALL_CLASS_COUNT] = {
    let mut map = [0usize; SMALL_CLASS_COUNT];
    let hdr = SECTOR_HEADER_SIZE;
    let mut i = 0;
    while i < SMALL_CLASS_COUNT {
        let orig = SMALL_SIZES_ORIG[i];
        if orig > hdr * 3 {
            let capacity = (SEGMENT_SIZE - hdr) / (orig + SMALL_BLOCK_HEADER_SIZE);
            let newsize = (SEGMENT_SIZE - hdr) / (capacity + 1);
            map[i] = align_lower(newsize, ALIGN_BITS);
        } else {
            map[i] = orig;
        }
        i += 1;
    }
    map
};

/// Effective medium payload sizes: 8 classes doubling from the smallest,
/// chosen so that `largest_count` largest blocks (headers included) fill the
/// sector.
pub const MEDIUM_SIZE_MAP: [usize; MEDIUM_CLASS_COUNT] = {
    let largest_count = CHUNK_SIZE / MEDIUM_LARGEST_ORIG;
    let flex_data = CHUNK_SIZE - FLEX_SECTOR_HEADER_SIZE;
    let smallest_full =
        align_lower((flex_data / largest_count) >> (MEDIUM_CLASS_COUNT - 1), ALIGN_BITS);
    let mut map = [0usize; MEDIUM_CLASS_COUNT];
    let mut full = smallest_full;
    let mut i = 0;
    while i < MEDIUM_CLASS_COUNT {
        map[i] = full - FLEX_BLOCK_HEADER_SIZE;
        full *= 2;
        i += 1;
    }
    map
};

const MEDIUM_LARGEST_COUNT: usize = CHUNK_SIZE / MEDIUM_LARGEST_ORIG;

/// Actual bytes of a flex sector occupied by blocks and the header; the
/// remainder of the chunk is padding.
pub const ACTUAL_FLEX_SECTOR_SIZE: usize = FLEX_SECTOR_HEADER_SIZE
    + (MEDIUM_SIZE_MAP[MEDIUM_CLASS_COUNT - 1] + FLEX_BLOCK_HEADER_SIZE) * MEDIUM_LARGEST_COUNT;

/// Full block size (header + payload) of a medium class.
#[inline]
pub const fn flex_full_size(class: usize) -> usize {
    MEDIUM_SIZE_MAP[class] + FLEX_BLOCK_HEADER_SIZE
}

/// Largest payload servable by the small allocator.
pub const MAX_SMALL_SIZE: usize = SMALL_SIZE_MAP[SMALL_CLASS_COUNT - 1] - 4;
/// Largest payload servable at all.
pub const MAX_MEDIUM_SIZE: usize = MEDIUM_SIZE_MAP[MEDIUM_CLASS_COUNT - 1] - 4;

/// Small class for `size` payload bytes plus the tail guard; None when the
/// request is too large for the small allocator.
pub fn classify_small(size: usize) -> Option<usize> {
    (0..SMALL_CLASS_COUNT).find(|&i| size + 4 <= SMALL_SIZE_MAP[i])
}

/// Medium class for `size` payload bytes plus the tail guard.
pub fn classify_medium(size: usize) -> Option<usize> {
    (0..MEDIUM_CLASS_COUNT).find(|&i| size + 4 <= MEDIUM_SIZE_MAP[i])
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[inline]
unsafe fn at<T>(base: *mut u8, off: usize) -> &'static T {
    &*(base.add(off) as *const T)
}

#[inline]
unsafe fn at_mut<T>(base: *mut u8, off: usize) -> &'static mut T {
    &mut *(base.add(off) as *mut T)
}

fn write_guard(base: *mut u8, payload_off: usize, element_size: usize) {
    unsafe {
        let guard = base.add(payload_off + element_size - 4) as *mut u32;
        guard.write_unaligned(GUARD_BYTES);
    }
}

fn check_guard(base: *mut u8, payload_off: usize, element_size: usize) -> bool {
    unsafe {
        let guard = base.add(payload_off + element_size - 4) as *const u32;
        guard.read_unaligned() == GUARD_BYTES
    }
}

// ---------------------------------------------------------------------------
// Small path
// ---------------------------------------------------------------------------

fn init_claimed_segment(base: *mut u8, seg_off: usize, class: usize) {
    let seg: &mut SegmentHeader = unsafe { at_mut(base, seg_off) };
    let header_size = if seg_off == 0 {
        SECTOR_HEADER_SIZE
    } else {
        SEGMENT_HEADER_SIZE
    };
    seg.header_size = header_size as i32;
    seg.next_segment = INVALID_OFF;
    seg.in_heads = 0;
    seg.size_class = class as i32;
    seg.element_size = SMALL_SIZE_MAP[class] as i32;
    seg.free_blocks_head = 0;
    seg.capacity = 0;
    seg.max_capacity =
        ((SEGMENT_SIZE - header_size) / (SMALL_BLOCK_HEADER_SIZE + SMALL_SIZE_MAP[class])) as i32;
    seg.used_count = 0;
    if seg_off != 0 {
        let sector: &SectorHeader = unsafe { at(base, 0) };
        seg.sector
            .store(sector.segment.sector.load(Ordering::Relaxed), Ordering::Release);
    }
}

/// Take one block from `seg`; `seg_off` is its sector offset.
/// Returns the sector offset of the block header.
fn segment_take_block(base: *mut u8, seg_off: usize, debug_id: i32) -> Option<usize> {
    let seg: &mut SegmentHeader = unsafe { at_mut(base, seg_off) };
    let element = seg.element_size as usize;

    let block_off = if seg.free_blocks_head != 0 {
        let off = seg.free_blocks_head as usize;
        let block: &mut SmallBlockHeader = unsafe { at_mut(base, off) };
        debug_assert_eq!(block.magic, 0, "allocating a block that is still live");
        seg.free_blocks_head = block.next;
        off
    } else if seg.capacity < seg.max_capacity {
        let off = seg_off
            + seg.header_size as usize
            + seg.capacity as usize * (SMALL_BLOCK_HEADER_SIZE + element);
        seg.capacity += 1;
        off
    } else {
        return None;
    };

    let block: &mut SmallBlockHeader = unsafe { at_mut(base, block_off) };
    block.next = 0;
    block.debug_id = debug_id;
    block.magic = SMALL_MAGIC;
    seg.used_count += 1;
    Some(block_off)
}

fn segment_exhausted(base: *mut u8, seg_off: usize) -> bool {
    let seg: &SegmentHeader = unsafe { at(base, seg_off) };
    seg.free_blocks_head == 0 && seg.capacity >= seg.max_capacity
}

/// Allocate a block of `class` inside one sector. Returns the sector offset
/// of the payload.
fn sector_alloc(base: *mut u8, class: usize, debug_id: i32) -> Option<usize> {
    let take = |base: *mut u8, seg_off: usize| -> Option<usize> {
        let block_off = segment_take_block(base, seg_off, debug_id)?;
        if segment_exhausted(base, seg_off) {
            // unlink the drained segment from the class heads
            let seg: &mut SegmentHeader = unsafe { at_mut(base, seg_off) };
            let next = seg.next_segment;
            seg.in_heads = 0;
            seg.next_segment = INVALID_OFF;
            let sector: &mut SectorHeader = unsafe { at_mut(base, 0) };
            sector.segments_heads[class] = next;
        }
        Some(block_off + SMALL_BLOCK_HEADER_SIZE)
    };

    loop {
        let head = unsafe { at::<SectorHeader>(base, 0) }.segments_heads[class];
        if head == INVALID_OFF {
            break;
        }
        let seg_off = head as usize;
        if let Some(payload) = take(base, seg_off) {
            return Some(payload);
        }
        // Drained segment still linked: unlink and look again.
        let seg: &mut SegmentHeader = unsafe { at_mut(base, seg_off) };
        let next = seg.next_segment;
        seg.in_heads = 0;
        seg.next_segment = INVALID_OFF;
        let sector: &mut SectorHeader = unsafe { at_mut(base, 0) };
        sector.segments_heads[class] = next;
    }

    // Claim a never-used segment.
    let empty = unsafe { at::<SectorHeader>(base, 0) }.segments_heads[EMPTY_SEGMENTS];
    if empty == INVALID_OFF || empty as usize + SEGMENT_SIZE > CHUNK_SIZE {
        return None;
    }
    let seg_off = empty as usize;
    {
        let sector: &mut SectorHeader = unsafe { at_mut(base, 0) };
        let next = seg_off + SEGMENT_SIZE;
        sector.segments_heads[EMPTY_SEGMENTS] = if next + SEGMENT_SIZE > CHUNK_SIZE {
            INVALID_OFF
        } else {
            next as i32
        };
    }
    init_claimed_segment(base, seg_off, class);
    {
        let sector: &mut SectorHeader = unsafe { at_mut(base, 0) };
        let seg: &mut SegmentHeader = unsafe { at_mut(base, seg_off) };
        seg.next_segment = sector.segments_heads[class];
        seg.in_heads = 1;
        sector.segments_heads[class] = seg_off as i32;
    }
    take(base, seg_off)
}

/// Create a fresh small-block sector chunk for `heap` and link it at the
/// head of the heap's fixed list. Assumes the heap lock is held.
fn alloc_sector(region: &Region, heap: &ShmHeap, heap_ptr: ShmPtr) -> Result<ShmPtr, Status> {
    let chunk_index = region.alloc_chunk(CHUNK_TYPE_SECTOR)?;
    let sector_ptr = ShmPtr::pack(chunk_index, 0);
    let base = region.translate(sector_ptr).ok_or(Status::Failure)?;

    let sector: &mut SectorHeader = unsafe { at_mut(base, 0) };
    sector.segment.sector.store(sector_ptr.0, Ordering::Release);
    sector.segment.header_size = SECTOR_HEADER_SIZE as i32;
    sector.segment.size_class = -1;
    sector.heap.store(heap_ptr.0, Ordering::Release);
    for i in 0..SMALL_CLASS_COUNT {
        sector.segments_heads[i] = INVALID_OFF;
    }
    sector.segments_heads[EMPTY_SEGMENTS] = 0; // segment 0 is claimable (merged header)

    // link at head
    let old_head = heap.fixed_sectors.head_ptr();
    sector.next_sector.store(old_head.0, Ordering::Release);
    sector.prev_sector.store(ShmPtr::EMPTY.0, Ordering::Release);
    if old_head.is_set() {
        let old: &SectorHeader = region.deref(old_head).ok_or(Status::Failure)?;
        old.prev_sector.store(sector_ptr.0, Ordering::Release);
    } else {
        heap.fixed_sectors.tail.store(sector_ptr.0, Ordering::Release);
    }
    heap.fixed_sectors.head.store(sector_ptr.0, Ordering::Release);
    Ok(sector_ptr)
}

fn small_get(
    region: &Region,
    heap: &ShmHeap,
    heap_ptr: ShmPtr,
    class: usize,
    debug_id: i32,
) -> Result<ShmPtr, Status> {
    // walk existing sectors, then allow a single class upgrade, then grow
    for try_class in [class, class + 1] {
        if try_class >= SMALL_CLASS_COUNT {
            break;
        }
        let mut iter = heap.fixed_sectors.head_ptr();
        while iter.is_set() {
            let base = region.translate(iter).ok_or(Status::Failure)?;
            if let Some(payload_off) = sector_alloc(base, try_class, debug_id) {
                return Ok(ShmPtr::pack(iter.chunk(), payload_off));
            }
            let sector: &SectorHeader = unsafe { at(base, 0) };
            iter = ShmPtr(sector.next_sector.load(Ordering::Acquire));
        }
        if try_class == class {
            continue; // one upgrade attempt before growing the region
        }
    }

    let sector_ptr = alloc_sector(region, heap, heap_ptr)?;
    let base = region.translate(sector_ptr).ok_or(Status::Failure)?;
    match sector_alloc(base, class, debug_id) {
        Some(payload_off) => Ok(ShmPtr::pack(sector_ptr.chunk(), payload_off)),
        None => Err(Status::Failure),
    }
}

fn small_free(base: *mut u8, payload_off: usize) {
    let block_off = payload_off - SMALL_BLOCK_HEADER_SIZE;
    let seg_off = block_off & !(SEGMENT_SIZE - 1);
    let seg: &mut SegmentHeader = unsafe { at_mut(base, seg_off) };
    let class = seg.size_class as usize;
    debug_assert!(class < SMALL_CLASS_COUNT);
    debug_assert!(
        check_guard(base, payload_off, seg.element_size as usize),
        "corrupted guard bytes"
    );

    let was_exhausted = segment_exhausted(base, seg_off);

    let block: &mut SmallBlockHeader = unsafe { at_mut(base, block_off) };
    debug_assert_eq!(block.magic, SMALL_MAGIC, "double free of a small block");
    block.magic = 0;
    block.next = seg.free_blocks_head;
    seg.free_blocks_head = block_off as i32;
    seg.used_count -= 1;

    if was_exhausted && seg.in_heads == 0 {
        let sector: &mut SectorHeader = unsafe { at_mut(base, 0) };
        seg.next_segment = sector.segments_heads[class];
        seg.in_heads = 1;
        sector.segments_heads[class] = seg_off as i32;
    }
}

// ---------------------------------------------------------------------------
// Medium path
// ---------------------------------------------------------------------------

fn init_medium_block(base: *mut u8, off: usize, sector_ptr: ShmPtr, class: usize) {
    let block: &mut FlexBlockHeader = unsafe { at_mut(base, off) };
    block.sector.store(sector_ptr.0, Ordering::Release);
    block.next_free = INVALID_OFF;
    block.prev_free = INVALID_OFF;
    block.next_block = INVALID_OFF;
    block.prev_block = INVALID_OFF;
    block.claimed = 0;
    block.size_class = class as i32;
    block.debug_id = 0;
}

fn flex_push_free_head(base: *mut u8, block_off: usize, class: usize) {
    let sector: &mut FlexSectorHeader = unsafe { at_mut(base, 0) };
    let old_head = sector.class_heads[class];
    let block: &mut FlexBlockHeader = unsafe { at_mut(base, block_off) };
    block.next_free = old_head;
    block.prev_free = INVALID_OFF;
    if old_head != INVALID_OFF {
        let old: &mut FlexBlockHeader = unsafe { at_mut(base, old_head as usize) };
        old.prev_free = block_off as i32;
    } else {
        sector.class_tails[class] = block_off as i32;
    }
    sector.class_heads[class] = block_off as i32;
}

fn flex_unlink_free(base: *mut u8, block_off: usize, class: usize) {
    let (next, prev) = {
        let block: &FlexBlockHeader = unsafe { at(base, block_off) };
        (block.next_free, block.prev_free)
    };
    if next != INVALID_OFF {
        unsafe { at_mut::<FlexBlockHeader>(base, next as usize) }.prev_free = prev;
    }
    if prev != INVALID_OFF {
        unsafe { at_mut::<FlexBlockHeader>(base, prev as usize) }.next_free = next;
    }
    let sector: &mut FlexSectorHeader = unsafe { at_mut(base, 0) };
    if prev == INVALID_OFF {
        sector.class_heads[class] = next;
    }
    if next == INVALID_OFF {
        sector.class_tails[class] = prev;
    }
    let block: &mut FlexBlockHeader = unsafe { at_mut(base, block_off) };
    block.next_free = INVALID_OFF;
    block.prev_free = INVALID_OFF;
}

/// Claim the head block of `class` in this sector for `target` (<= class),
/// splitting the tail into free buddies. Returns the payload offset.
fn flex_take_and_split(
    base: *mut u8,
    sector_ptr: ShmPtr,
    target: usize,
    class: usize,
    debug_id: i32,
) -> Option<usize> {
    let head = unsafe { at::<FlexSectorHeader>(base, 0) }.class_heads[class];
    if head == INVALID_OFF {
        return None;
    }
    let block_off = head as usize;
    flex_unlink_free(base, block_off, class);

    let old_next_block = {
        let block: &mut FlexBlockHeader = unsafe { at_mut(base, block_off) };
        debug_assert_eq!(block.claimed, 0);
        debug_assert_eq!(block.size_class as usize, class);
        block.claimed = 1;
        block.size_class = target as i32;
        block.debug_id = debug_id;
        block.next_block
    };

    if class > target {
        // Split the tail half into buddies, smallest first:
        // | target | target | target+1 | ... | class-1 | == | class |
        let mut position = block_off + flex_full_size(target);
        let mut prev_off = block_off;
        for splitting in target..class {
            init_medium_block(base, position, sector_ptr, splitting);
            flex_push_free_head(base, position, splitting);
            unsafe { at_mut::<FlexBlockHeader>(base, prev_off) }.next_block = position as i32;
            unsafe { at_mut::<FlexBlockHeader>(base, position) }.prev_block = prev_off as i32;
            prev_off = position;
            position += flex_full_size(splitting);
        }
        debug_assert_eq!(position, block_off + flex_full_size(class));
        if old_next_block != INVALID_OFF {
            unsafe { at_mut::<FlexBlockHeader>(base, old_next_block as usize) }.prev_block =
                prev_off as i32;
            unsafe { at_mut::<FlexBlockHeader>(base, prev_off) }.next_block = old_next_block;
        }
    }

    Some(block_off + FLEX_BLOCK_HEADER_SIZE)
}

/// Create a fresh flex sector: all space becomes one free list of
/// largest-class blocks. Assumes the heap lock is held.
fn alloc_flex_sector(region: &Region, heap: &ShmHeap, heap_ptr: ShmPtr) -> Result<ShmPtr, Status> {
    let chunk_index = region.alloc_chunk(CHUNK_TYPE_SECTOR_FLEX)?;
    let sector_ptr = ShmPtr::pack(chunk_index, 0);
    let base = region.translate(sector_ptr).ok_or(Status::Failure)?;

    {
        let sector: &mut FlexSectorHeader = unsafe { at_mut(base, 0) };
        sector.self_ptr.store(sector_ptr.0, Ordering::Release);
        sector.heap.store(heap_ptr.0, Ordering::Release);
        for i in 0..MEDIUM_CLASS_COUNT {
            sector.class_heads[i] = INVALID_OFF;
            sector.class_tails[i] = INVALID_OFF;
        }
    }

    let largest = MEDIUM_CLASS_COUNT - 1;
    let mut position = FLEX_SECTOR_HEADER_SIZE;
    let mut prev_off = INVALID_OFF;
    for _ in 0..MEDIUM_LARGEST_COUNT {
        init_medium_block(base, position, sector_ptr, largest);
        flex_push_free_head(base, position, largest);
        if prev_off != INVALID_OFF {
            unsafe { at_mut::<FlexBlockHeader>(base, prev_off as usize) }.next_block =
                position as i32;
            unsafe { at_mut::<FlexBlockHeader>(base, position) }.prev_block = prev_off;
        }
        prev_off = position as i32;
        position += flex_full_size(largest);
    }
    debug_assert_eq!(position, ACTUAL_FLEX_SECTOR_SIZE);

    // link at head of the heap's flex list
    let sector: &mut FlexSectorHeader = unsafe { at_mut(base, 0) };
    let old_head = heap.flex_sectors.head_ptr();
    sector.next_sector.store(old_head.0, Ordering::Release);
    sector.prev_sector.store(ShmPtr::EMPTY.0, Ordering::Release);
    if old_head.is_set() {
        let old: &FlexSectorHeader = region.deref(old_head).ok_or(Status::Failure)?;
        old.prev_sector.store(sector_ptr.0, Ordering::Release);
    } else {
        heap.flex_sectors.tail.store(sector_ptr.0, Ordering::Release);
    }
    heap.flex_sectors.head.store(sector_ptr.0, Ordering::Release);
    Ok(sector_ptr)
}

fn medium_get(
    region: &Region,
    heap: &ShmHeap,
    heap_ptr: ShmPtr,
    target: usize,
    debug_id: i32,
) -> Result<ShmPtr, Status> {
    // class-major scan: the smallest satisfying class anywhere wins
    for class in target..MEDIUM_CLASS_COUNT {
        let mut iter = heap.flex_sectors.head_ptr();
        while iter.is_set() {
            let base = region.translate(iter).ok_or(Status::Failure)?;
            if let Some(payload_off) = flex_take_and_split(base, iter, target, class, debug_id) {
                return Ok(ShmPtr::pack(iter.chunk(), payload_off));
            }
            let sector: &FlexSectorHeader = unsafe { at(base, 0) };
            iter = ShmPtr(sector.next_sector.load(Ordering::Acquire));
        }
    }

    let sector_ptr = alloc_flex_sector(region, heap, heap_ptr)?;
    let base = region.translate(sector_ptr).ok_or(Status::Failure)?;
    match flex_take_and_split(base, sector_ptr, target, MEDIUM_CLASS_COUNT - 1, debug_id) {
        Some(payload_off) => Ok(ShmPtr::pack(sector_ptr.chunk(), payload_off)),
        None => Err(Status::Failure),
    }
}

fn medium_free(base: *mut u8, payload_off: usize) {
    let block_off = payload_off - FLEX_BLOCK_HEADER_SIZE;
    let class = {
        let block: &mut FlexBlockHeader = unsafe { at_mut(base, block_off) };
        debug_assert_eq!(block.claimed, 1, "double free of a medium block");
        debug_assert!(
            check_guard(base, payload_off, MEDIUM_SIZE_MAP[block.size_class as usize]),
            "corrupted guard bytes"
        );
        block.claimed = 0;
        block.size_class as usize
    };
    // No buddy merging here: freed blocks go straight to the class head and
    // coalescing is left to a future compactor.
    flex_push_free_head(base, block_off, class);
}

// ---------------------------------------------------------------------------
// Public contract
// ---------------------------------------------------------------------------

/// Allocate `size` payload bytes from the heap at `heap_ptr`.
///
/// The returned payload is zeroed and carries a tail guard word inside the
/// slot. Takes the heap's lock; may additionally take the superblock lock to
/// grow the region (the only place two simple locks nest).
pub fn get_mem(
    region: &Region,
    heap_ptr: ShmPtr,
    size: usize,
    debug_id: i32,
) -> Result<ShmPtr, Status> {
    if size == 0 {
        return Err(Status::Invalid);
    }
    let heap: &ShmHeap = region.deref(heap_ptr).ok_or(Status::Failure)?;
    heap.lock.acquire();
    let result = if let Some(class) = classify_small(size) {
        small_get(region, heap, heap_ptr, class, debug_id)
    } else if let Some(class) = classify_medium(size) {
        medium_get(region, heap, heap_ptr, class, debug_id)
    } else {
        Err(Status::Failure)
    };
    heap.lock.release();

    let ptr = result?;
    let element = element_size_of(region, ptr).ok_or(Status::Failure)?;
    let base = region.translate(ShmPtr::pack(ptr.chunk(), 0)).ok_or(Status::Failure)?;
    unsafe {
        std::ptr::write_bytes(base.add(ptr.offset()), 0, element - 4);
    }
    write_guard(base, ptr.offset(), element);
    Ok(ptr)
}

/// Payload slot size (guard included) of an allocated block.
pub fn element_size_of(region: &Region, ptr: ShmPtr) -> Option<usize> {
    let base = region.translate(ShmPtr::pack(ptr.chunk(), 0))?;
    let chunk: &ChunkHeader = unsafe { at(base, 0) };
    match chunk.type_tag.load(Ordering::Acquire) {
        t if t == CHUNK_TYPE_SECTOR => {
            let seg_off = (ptr.offset() - SMALL_BLOCK_HEADER_SIZE) & !(SEGMENT_SIZE - 1);
            let seg: &SegmentHeader = unsafe { at(base, seg_off) };
            Some(seg.element_size as usize)
        }
        t if t == CHUNK_TYPE_SECTOR_FLEX => {
            let block: &FlexBlockHeader =
                unsafe { at(base, ptr.offset() - FLEX_BLOCK_HEADER_SIZE) };
            Some(MEDIUM_SIZE_MAP[block.size_class as usize])
        }
        _ => None,
    }
}

/// The heap owning the sector that `ptr` points into.
pub fn heap_of(region: &Region, ptr: ShmPtr) -> Option<ShmPtr> {
    let base = region.translate(ShmPtr::pack(ptr.chunk(), 0))?;
    let chunk: &ChunkHeader = unsafe { at(base, 0) };
    match chunk.type_tag.load(Ordering::Acquire) {
        t if t == CHUNK_TYPE_SECTOR => {
            let sector: &SectorHeader = unsafe { at(base, 0) };
            Some(ShmPtr(sector.heap.load(Ordering::Acquire)))
        }
        t if t == CHUNK_TYPE_SECTOR_FLEX => {
            let sector: &FlexSectorHeader = unsafe { at(base, 0) };
            Some(ShmPtr(sector.heap.load(Ordering::Acquire)))
        }
        _ => None,
    }
}

/// Return a block to its sector. The owning heap's lock must be held; the
/// reclaimer batches consecutive same-heap frees under one acquisition.
pub fn free_mem_locked(region: &Region, ptr: ShmPtr) {
    debug_assert!(ptr.is_set());
    let base = match region.translate(ShmPtr::pack(ptr.chunk(), 0)) {
        Some(b) => b,
        None => return,
    };
    let chunk: &ChunkHeader = unsafe { at(base, 0) };
    match chunk.type_tag.load(Ordering::Acquire) {
        t if t == CHUNK_TYPE_SECTOR => small_free(base, ptr.offset()),
        t if t == CHUNK_TYPE_SECTOR_FLEX => medium_free(base, ptr.offset()),
        _ => debug_assert!(false, "free_mem on a non-sector chunk"),
    }
}

/// Return a block to its sector, taking the owning heap's lock.
pub fn free_mem(region: &Region, ptr: ShmPtr) {
    let heap_ptr = match heap_of(region, ptr) {
        Some(h) => h,
        None => return,
    };
    let heap: &ShmHeap = match region.deref(heap_ptr) {
        Some(h) => h,
        None => return,
    };
    heap.lock.acquire();
    free_mem_locked(region, ptr);
    heap.lock.release();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_map_is_monotonic_and_bounded() {
        let mut prev = 0;
        for (i, &s) in SMALL_SIZE_MAP.iter().enumerate() {
            assert!(s > prev, "class {i} not larger than class {}", i - 1);
            assert!(s <= SMALL_SIZES_ORIG[i]);
            assert_eq!(s % 8, 0);
            prev = s;
        }
    }

    #[test]
    fn segment_capacity_fills_segment() {
        for &s in &SMALL_SIZE_MAP {
            let cap = (SEGMENT_SIZE - SECTOR_HEADER_SIZE) / (SMALL_BLOCK_HEADER_SIZE + s);
            assert!(cap >= 1, "class {s} does not fit a segment");
            assert!(SECTOR_HEADER_SIZE + cap * (SMALL_BLOCK_HEADER_SIZE + s) <= SEGMENT_SIZE);
        }
    }

    #[test]
    fn medium_map_doubles() {
        for i in 1..MEDIUM_CLASS_COUNT {
            assert_eq!(
                flex_full_size(i),
                flex_full_size(i - 1) * 2,
                "class {i} is not double its predecessor"
            );
        }
    }

    #[test]
    fn flex_sector_accounting() {
        // sum over the initial largest blocks == actual flex sector size
        assert!(ACTUAL_FLEX_SECTOR_SIZE <= CHUNK_SIZE);
        assert_eq!(
            ACTUAL_FLEX_SECTOR_SIZE,
            FLEX_SECTOR_HEADER_SIZE + MEDIUM_LARGEST_COUNT * flex_full_size(MEDIUM_CLASS_COUNT - 1)
        );
    }

    #[test]
    fn classify_boundaries() {
        assert_eq!(classify_small(1), Some(0));
        assert_eq!(classify_small(4), Some(0));
        assert_eq!(classify_small(5), Some(1));
        assert_eq!(classify_small(MAX_SMALL_SIZE), Some(SMALL_CLASS_COUNT - 1));
        assert_eq!(classify_small(MAX_SMALL_SIZE + 1), None);
        assert!(classify_medium(MAX_SMALL_SIZE + 1).is_some());
        assert_eq!(classify_medium(MAX_MEDIUM_SIZE + 1), None);
    }
}
