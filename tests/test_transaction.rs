// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Transaction-layer behavior: persistent multi-container commits, rollback
// on abort, idle-thread lock invariants, and refcount bookkeeping through a
// reclamation cycle.

use std::sync::atomic::Ordering;

use shmstore::shm_block::RefHeader;
use shmstore::{process_garbage, CellRef, Region, StoreError, ThreadContext, TxMode, UnDictRef};

fn setup() -> (std::sync::Arc<Region>, ThreadContext) {
    let region = Region::create().expect("region");
    let thread = ThreadContext::new(region.clone()).expect("thread");
    (region, thread)
}

#[test]
fn persistent_transaction_commits_both_containers() {
    let (_region, thread) = setup();
    let cell = CellRef::new(&thread).unwrap();
    let dict = UnDictRef::new(&thread).unwrap();

    thread
        .run_transaction(|t| {
            cell.set_str(t, "cell-value")?;
            dict.set_str(t, "dict-key", "dict-value")?;
            Ok(())
        })
        .unwrap();

    assert_eq!(cell.get_str(&thread).unwrap().as_deref(), Some("cell-value"));
    assert_eq!(
        dict.get_str(&thread, "dict-key").unwrap().as_deref(),
        Some("dict-value")
    );
}

#[test]
fn failed_transaction_rolls_back_everything() {
    let (_region, thread) = setup();
    let cell = CellRef::new(&thread).unwrap();
    let dict = UnDictRef::new(&thread).unwrap();
    cell.set_str(&thread, "before").unwrap();

    let result: Result<(), StoreError> = thread.run_transaction(|t| {
        cell.set_str(t, "after")?;
        dict.set_str(t, "staged", "x")?;
        Err(StoreError::Invalid) // abort the whole scope
    });
    assert!(matches!(result, Err(StoreError::Invalid)));

    assert_eq!(cell.get_str(&thread).unwrap().as_deref(), Some("before"));
    assert!(matches!(
        dict.get_str(&thread, "staged"),
        Err(StoreError::Invalid)
    ));
    assert_eq!(dict.len(&thread).unwrap(), 0);
}

#[test]
fn staged_writes_are_visible_inside_the_transaction_only() {
    let (_region, thread) = setup();
    let dict = UnDictRef::new(&thread).unwrap();
    dict.set_str(&thread, "k", "committed").unwrap();

    thread
        .run_transaction(|t| {
            dict.set_str(t, "k", "staged")?;
            // the writer sees its own staged value
            assert_eq!(dict.get_str(t, "k")?.as_deref(), Some("staged"));
            Ok(())
        })
        .unwrap();
    assert_eq!(dict.get_str(&thread, "k").unwrap().as_deref(), Some("staged"));
}

#[test]
fn idle_thread_holds_no_locks() {
    let (_region, thread) = setup();
    let cell = CellRef::new(&thread).unwrap();
    cell.set_str(&thread, "x").unwrap();
    let _ = cell.get_str(&thread).unwrap();

    // after every operation the thread is idle again and lock-free
    assert_eq!(thread.slot().mode(), TxMode::Idle);
    assert_eq!(thread.slot().ticket(), 0);
    let lock = shmstore::lock::lock_of(thread.region(), cell.0).expect("lock");
    assert_eq!(lock.reader_lock.get(), 0, "reader bitmap must be clear");
    assert!(!lock.writer().is_set());
}

#[test]
fn nested_scopes_commit_once_at_the_outermost() {
    let (_region, thread) = setup();
    let cell = CellRef::new(&thread).unwrap();
    thread
        .run_transaction(|t| {
            t.run_transaction(|t2| cell.set_str(t2, "inner"))?;
            // still inside the outer scope: nothing published yet, and the
            // write lock is still ours
            let lock = shmstore::lock::lock_of(t.region(), cell.0).expect("lock");
            assert!(lock.writer().is_set());
            Ok(())
        })
        .unwrap();
    assert_eq!(cell.get_str(&thread).unwrap().as_deref(), Some("inner"));
}

#[test]
fn refcounts_hold_through_a_reclamation_cycle() {
    let (region, thread) = setup();
    // park the background reclaimer so this test drives the cycle itself
    region
        .superblock()
        .stop_reclaimer
        .store(1, Ordering::SeqCst);

    // a value shared by a cell and by us
    let value = thread
        .with_transaction(|t| shmstore::value::new_string(t, "shared"))
        .unwrap();
    let cell = CellRef::new(&thread).unwrap();
    shmstore::shm_block::acq(&region, value);
    cell.set_consume(&thread, value).unwrap();

    {
        let header: &RefHeader = region.deref(value).expect("value header");
        let rc = header.refcount.load(Ordering::SeqCst);
        assert_eq!(rc, 2, "cell + our local reference");
        assert!(
            header.revival_count.load(Ordering::SeqCst)
                >= header.release_count.load(Ordering::SeqCst)
        );
    }

    // drop our reference and replace the cell's value: the block is dead
    shmstore::shm_block::release(&thread, value);
    cell.set_str(&thread, "other").unwrap();
    thread.flush_free();

    // run a cycle with a second context standing in for the reclaimer
    let ctx = ThreadContext::new(region.clone()).expect("ctx");
    let freed = process_garbage(&ctx);
    ctx.flush_free();
    assert!(freed > 0, "the dead value must be physically reclaimed");
}

#[test]
fn released_block_is_not_freed_while_a_transaction_is_in_flight() {
    let (region, thread) = setup();
    region
        .superblock()
        .stop_reclaimer
        .store(1, Ordering::SeqCst);
    let value = thread
        .with_transaction(|t| shmstore::value::new_string(t, "grace"))
        .unwrap();

    // another thread parks inside a persistent transaction
    let region2 = region.clone();
    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let (finish_tx, finish_rx) = std::sync::mpsc::channel::<()>();
    let parked = std::thread::spawn(move || {
        let t = ThreadContext::new(region2).expect("thread 2");
        let probe = CellRef::new(&t).unwrap();
        t.run_transaction(|tx| {
            probe.set_str(tx, "busy")?;
            started_tx.send(()).unwrap();
            finish_rx.recv().unwrap();
            Ok(())
        })
        .unwrap();
    });
    started_rx.recv().unwrap();

    shmstore::shm_block::release(&thread, value);
    thread.flush_free();

    // the reclaimer cycle must wait for the parked transaction; run it on a
    // helper thread and let it block
    let region3 = region.clone();
    let reclaim = std::thread::spawn(move || {
        let ctx = ThreadContext::new(region3).expect("ctx");
        let freed = process_garbage(&ctx);
        ctx.flush_free();
        freed
    });
    std::thread::sleep(std::time::Duration::from_millis(100));
    let header: &RefHeader = region.deref(value).expect("header");
    assert_eq!(
        header.refcount.load(Ordering::SeqCst),
        0,
        "block is dead but must still be intact during the grace period"
    );

    finish_tx.send(()).unwrap();
    parked.join().unwrap();
    let freed = reclaim.join().unwrap();
    assert!(freed > 0);
}
