// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Allocator behavior observed through a real region: size-class churn,
// free-list freshness, and the medium-block split discipline.

use std::sync::atomic::Ordering;

use shmstore::heap::{
    self, FlexBlockHeader, FlexSectorHeader, FLEX_BLOCK_HEADER_SIZE, MEDIUM_SIZE_MAP,
};
use shmstore::{Region, ShmPtr, ThreadContext};

const TEST_ID: i32 = 20;

#[test]
fn small_block_churn_keeps_chunk_count_stable() {
    let region = Region::create().expect("region");
    let thread = ThreadContext::new(region.clone()).expect("thread");

    // warm-up
    for _ in 0..1000 {
        let ptr = thread.alloc(200, TEST_ID).expect("alloc");
        heap::free_mem(thread.region(), ptr);
    }
    let chunks_after_warmup = region.superblock().chunk_count.load(Ordering::SeqCst);

    for _ in 0..100_000 {
        let ptr = thread.alloc(200, TEST_ID).expect("alloc");
        heap::free_mem(thread.region(), ptr);
    }
    let chunks_at_end = region.superblock().chunk_count.load(Ordering::SeqCst);
    assert_eq!(
        chunks_after_warmup, chunks_at_end,
        "steady churn must not grow the region"
    );
}

#[test]
fn freed_small_block_is_reused_first() {
    let region = Region::create().expect("region");
    let thread = ThreadContext::new(region.clone()).expect("thread");

    let first = thread.alloc(60, TEST_ID).expect("alloc");
    heap::free_mem(thread.region(), first);
    let second = thread.alloc(60, TEST_ID).expect("alloc");
    assert_eq!(first, second, "same class must pop the freshest free block");
}

#[test]
fn freed_medium_block_is_reused_first() {
    let region = Region::create().expect("region");
    let thread = ThreadContext::new(region.clone()).expect("thread");

    let size = MEDIUM_SIZE_MAP[2] - 4;
    let first = thread.alloc(size, TEST_ID).expect("alloc");
    heap::free_mem(thread.region(), first);
    let second = thread.alloc(size, TEST_ID).expect("alloc");
    assert_eq!(first, second);
}

#[test]
fn zero_size_allocation_is_rejected() {
    let region = Region::create().expect("region");
    let thread = ThreadContext::new(region.clone()).expect("thread");
    assert!(thread.alloc(0, TEST_ID).is_err());
}

#[test]
fn distinct_allocations_do_not_alias() {
    let region = Region::create().expect("region");
    let thread = ThreadContext::new(region.clone()).expect("thread");

    let mut seen = std::collections::HashSet::new();
    for _ in 0..500 {
        let ptr = thread.alloc(48, TEST_ID).expect("alloc");
        assert!(seen.insert(ptr), "allocator handed out a live block twice");
    }
}

#[test]
fn medium_split_leaves_alternating_free_pattern() {
    let region = Region::create().expect("region");
    let thread = ThreadContext::new(region.clone()).expect("thread");

    let class = 4usize;
    let size = MEDIUM_SIZE_MAP[class] - 4;
    let blocks: Vec<ShmPtr> = (0..10)
        .map(|_| thread.alloc(size, TEST_ID).expect("alloc"))
        .collect();

    // free blocks 0, 2, 4, 6, 8
    for i in (0..10).step_by(2) {
        heap::free_mem(thread.region(), blocks[i]);
    }

    // every freed block must sit on class_heads[4] of its sector
    let sector_ptr = ShmPtr::pack(blocks[0].chunk(), 0);
    let sector: &FlexSectorHeader = region.deref(sector_ptr).expect("sector");

    let mut free_offsets = std::collections::HashSet::new();
    let mut cursor = sector.class_heads[class];
    while cursor != -1 {
        free_offsets.insert(cursor as usize);
        let block: &FlexBlockHeader = region
            .deref(ShmPtr::pack(blocks[0].chunk(), cursor as usize))
            .expect("free block");
        assert_eq!(block.claimed, 0);
        assert_eq!(block.size_class as usize, class);
        cursor = block.next_free;
    }

    for i in (0..10).step_by(2) {
        let header_off = blocks[i].offset() - FLEX_BLOCK_HEADER_SIZE;
        assert!(
            free_offsets.contains(&header_off),
            "freed block {i} missing from class_heads[{class}]"
        );
    }
    // the surviving odd blocks stay claimed
    for i in (1..10).step_by(2) {
        let header_off = blocks[i].offset() - FLEX_BLOCK_HEADER_SIZE;
        let block: &FlexBlockHeader = region
            .deref(ShmPtr::pack(blocks[i].chunk(), header_off))
            .expect("claimed block");
        assert_eq!(block.claimed, 1, "live block {i} must stay claimed");
        assert!(!free_offsets.contains(&header_off));
    }
}

#[test]
fn flex_sector_neighbour_chain_covers_the_sector() {
    let region = Region::create().expect("region");
    let thread = ThreadContext::new(region.clone()).expect("thread");

    // force a flex sector into existence (class 0 sizes are still served by
    // the largest small class, so use class 1)
    let ptr = thread.alloc(MEDIUM_SIZE_MAP[1] - 4, TEST_ID).expect("alloc");
    let chunk = ptr.chunk();

    // walk the neighbour chain from the first block and sum sizes
    let mut offset = shmstore::heap::FLEX_SECTOR_HEADER_SIZE;
    let mut total = shmstore::heap::FLEX_SECTOR_HEADER_SIZE;
    loop {
        let block: &FlexBlockHeader = region
            .deref(ShmPtr::pack(chunk, offset))
            .expect("chain block");
        let full = shmstore::heap::flex_full_size(block.size_class as usize);
        total += full;
        if block.next_block == -1 {
            break;
        }
        assert_eq!(block.next_block as usize, offset + full, "chain must be contiguous");
        offset = block.next_block as usize;
    }
    assert_eq!(total, shmstore::heap::ACTUAL_FLEX_SECTOR_SIZE);
}
