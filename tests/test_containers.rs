// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Container laws on a single thread: cells, lists, queues, both
// dictionaries, promises, and the shadow-field postconditions after commit.

use std::sync::atomic::Ordering;

use shmstore::{
    CellRef, DictRef, ListRef, PromiseRef, QueueRef, Region, StoreError, ThreadContext, UnDictRef,
    PROMISE_FULFILLED, PROMISE_PENDING,
};

fn setup() -> (std::sync::Arc<Region>, ThreadContext) {
    let region = Region::create().expect("region");
    let thread = ThreadContext::new(region.clone()).expect("thread");
    (region, thread)
}

// ---------------------------------------------------------------------------
// Cell
// ---------------------------------------------------------------------------

#[test]
fn cell_set_then_get() {
    let (_region, thread) = setup();
    let cell = CellRef::new(&thread).unwrap();
    cell.set_str(&thread, "hello").unwrap();
    assert_eq!(cell.get_str(&thread).unwrap().as_deref(), Some("hello"));
    cell.set_str(&thread, "world").unwrap();
    assert_eq!(cell.get_str(&thread).unwrap().as_deref(), Some("world"));
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

#[test]
fn list_append_then_get_last() {
    let (_region, thread) = setup();
    let list = ListRef::new(&thread).unwrap();
    for i in 0..50 {
        let idx = list.append_str(&thread, &format!("v{i}")).unwrap();
        assert_eq!(idx, i);
    }
    let (count, _) = list.counts(&thread).unwrap();
    assert_eq!(count, 50);
    assert_eq!(
        list.get_str(&thread, count - 1).unwrap().as_deref(),
        Some("v49")
    );
}

#[test]
fn list_queue_semantics_under_heavy_append() {
    let (_region, thread) = setup();
    let list = ListRef::new(&thread).unwrap();
    // interleave appends and pops; popleft returns values in append order
    let mut next_push = 0;
    let mut next_pop = 0;
    for round in 0..200 {
        let appends = 1 + round % 3;
        for _ in 0..appends {
            list.append_str(&thread, &format!("q{next_push}")).unwrap();
            next_push += 1;
        }
        let popped = list.popleft_str(&thread).unwrap();
        assert_eq!(popped.as_deref(), Some(format!("q{next_pop}").as_str()));
        next_pop += 1;
    }
    let (count, deleted) = list.counts(&thread).unwrap();
    assert_eq!(count, next_push - next_pop);
    assert!(deleted >= 0);
}

#[test]
fn list_popleft_on_empty_is_invalid() {
    let (_region, thread) = setup();
    let list = ListRef::new(&thread).unwrap();
    assert!(matches!(
        list.popleft_owned(&thread),
        Err(StoreError::Invalid)
    ));
}

#[test]
fn list_set_replaces_value() {
    let (_region, thread) = setup();
    let list = ListRef::new(&thread).unwrap();
    list.append_str(&thread, "old").unwrap();
    let value = thread
        .with_transaction(|t| shmstore::value::new_string(t, "new"))
        .unwrap();
    list.set_consume(&thread, 0, value).unwrap();
    assert_eq!(list.get_str(&thread, 0).unwrap().as_deref(), Some("new"));
}

#[test]
fn list_grows_past_one_block() {
    let (_region, thread) = setup();
    let list = ListRef::new(&thread).unwrap();
    // enough appends to force block growth and promotion to indexed form
    for i in 0..1500 {
        list.append_str(&thread, &format!("g{i}")).unwrap();
    }
    assert_eq!(list.len(&thread).unwrap(), 1500);
    assert_eq!(list.get_str(&thread, 0).unwrap().as_deref(), Some("g0"));
    assert_eq!(
        list.get_str(&thread, 1499).unwrap().as_deref(),
        Some("g1499")
    );
    assert_eq!(
        list.get_str(&thread, 777).unwrap().as_deref(),
        Some("g777")
    );
}

#[test]
fn list_shadow_fields_clear_after_commit() {
    let (region, thread) = setup();
    let list = ListRef::new(&thread).unwrap();
    for i in 0..20 {
        list.append_str(&thread, &format!("s{i}")).unwrap();
    }
    let shm_list: &shmstore::list::ShmList = region.deref(list.0).expect("list header");
    assert_eq!(shm_list.new_count.load(Ordering::SeqCst), -1);
    assert_eq!(shm_list.new_deleted.load(Ordering::SeqCst), -1);
    let log = shmstore::ShmPtr(shm_list.changes.load(Ordering::SeqCst));
    if log.is_set() {
        assert_eq!(shmstore::changelog::count(&region, log), 0);
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[test]
fn queue_appends_preserve_order() {
    let (_region, thread) = setup();
    let queue = QueueRef::new(&thread).unwrap();
    assert!(queue.is_empty(&thread).unwrap());
    for i in 0..40 {
        queue.append_str(&thread, &format!("m{i}")).unwrap();
    }
    assert_eq!(queue.len(&thread).unwrap(), 40);
    let values = queue.values_str(&thread).unwrap();
    assert_eq!(values.len(), 40);
    for (i, v) in values.iter().enumerate() {
        assert_eq!(v, &format!("m{i}"));
    }
}

// ---------------------------------------------------------------------------
// Unordered dict
// ---------------------------------------------------------------------------

#[test]
fn undict_set_then_get() {
    let (_region, thread) = setup();
    let dict = UnDictRef::new(&thread).unwrap();
    dict.set_str(&thread, "k", "v").unwrap();
    assert_eq!(dict.get_str(&thread, "k").unwrap().as_deref(), Some("v"));
    dict.set_str(&thread, "k", "v2").unwrap();
    assert_eq!(dict.get_str(&thread, "k").unwrap().as_deref(), Some("v2"));
    assert_eq!(dict.len(&thread).unwrap(), 1);
}

#[test]
fn undict_delete_then_get_is_invalid() {
    let (_region, thread) = setup();
    let dict = UnDictRef::new(&thread).unwrap();
    dict.set_str(&thread, "k", "v").unwrap();
    dict.delete(&thread, "k").unwrap();
    assert!(matches!(
        dict.get_str(&thread, "k"),
        Err(StoreError::Invalid)
    ));
    assert_eq!(dict.len(&thread).unwrap(), 0);
    // deleting again is a domain error
    assert!(matches!(dict.delete(&thread, "k"), Err(StoreError::Invalid)));
}

#[test]
fn undict_grows_past_the_initial_table() {
    let (_region, thread) = setup();
    let dict = UnDictRef::new(&thread).unwrap();
    for i in 0..300 {
        dict.set_int(&thread, &format!("key{i}"), i).unwrap();
    }
    assert_eq!(dict.len(&thread).unwrap(), 300);
    for i in 0..300 {
        assert_eq!(
            dict.get_int(&thread, &format!("key{i}")).unwrap(),
            Some(i),
            "key{i} lost after growth"
        );
    }
}

#[test]
fn undict_probe_runs_stay_compact_after_deletes() {
    let (region, thread) = setup();
    let dict = UnDictRef::new(&thread).unwrap();
    for i in 0..64 {
        dict.set_int(&thread, &format!("d{i}"), i).unwrap();
    }
    for i in (0..64).step_by(2) {
        dict.delete(&thread, &format!("d{i}")).unwrap();
    }
    // every survivor is still reachable by probing
    for i in (1..64).step_by(2) {
        assert_eq!(dict.get_int(&thread, &format!("d{i}")).unwrap(), Some(i));
    }
    assert_eq!(dict.len(&thread).unwrap(), 32);

    // structural check: no live bucket is separated from its base position
    // by an empty slot
    let shm_dict: &shmstore::undict::ShmUnDict = region.deref(dict.0).expect("dict header");
    let table_ptr = shmstore::ShmPtr(shm_dict.buckets.load(Ordering::SeqCst));
    let table: &shmstore::undict::UnDictTable = region.deref(table_ptr).expect("table");
    let n = table.bucket_count.load(Ordering::SeqCst) as usize;
    for i in (1..64).step_by(2) {
        let key = format!("d{i}");
        let hash = shmstore::value::hash_str(&key);
        let mask = n - 1;
        let mut step = 0;
        loop {
            let idx = (hash as usize + step) & mask;
            let bucket: &shmstore::undict::Bucket = region
                .deref(table_ptr.shift(
                    std::mem::size_of::<shmstore::undict::UnDictTable>()
                        + idx * std::mem::size_of::<shmstore::undict::Bucket>(),
                ))
                .expect("bucket");
            let bkey = shmstore::ShmPtr(bucket.key.load(Ordering::SeqCst));
            let bhash = bucket.hash.load(Ordering::SeqCst);
            if bkey.is_set() && bhash == hash && shmstore::value::string_eq_str(&region, bkey, &key)
            {
                break; // found before hitting any empty slot
            }
            assert_ne!(bhash, 0, "empty slot inside the probe run for {key}");
            step += 1;
            assert!(step < n, "unterminated probe for {key}");
        }
    }
}

#[test]
fn undict_clear_removes_everything() {
    let (_region, thread) = setup();
    let dict = UnDictRef::new(&thread).unwrap();
    for i in 0..20 {
        dict.set_int(&thread, &format!("c{i}"), i).unwrap();
    }
    dict.clear(&thread).unwrap();
    assert_eq!(dict.len(&thread).unwrap(), 0);
    assert!(matches!(
        dict.get_int(&thread, "c0"),
        Err(StoreError::Invalid)
    ));
}

// ---------------------------------------------------------------------------
// Ordered dict
// ---------------------------------------------------------------------------

#[test]
fn dict_set_then_get() {
    let (_region, thread) = setup();
    let dict = DictRef::new(&thread).unwrap();
    dict.set_str(&thread, "alpha", "1").unwrap();
    dict.set_str(&thread, "beta", "2").unwrap();
    assert_eq!(dict.get_str(&thread, "alpha").unwrap().as_deref(), Some("1"));
    assert_eq!(dict.get_str(&thread, "beta").unwrap().as_deref(), Some("2"));
    assert_eq!(dict.len(&thread).unwrap(), 2);
    assert!(matches!(
        dict.get_str(&thread, "gamma"),
        Err(StoreError::Invalid)
    ));
}

#[test]
fn dict_handles_colliding_paths() {
    let (_region, thread) = setup();
    let dict = DictRef::new(&thread).unwrap();
    // plenty of keys: trie levels share 2-bit slices, so collisions at the
    // first levels are guaranteed
    for i in 0..200 {
        dict.set_str(&thread, &format!("key-{i}"), &format!("{i}")).unwrap();
    }
    assert_eq!(dict.len(&thread).unwrap(), 200);
    for i in 0..200 {
        assert_eq!(
            dict.get_str(&thread, &format!("key-{i}")).unwrap().as_deref(),
            Some(format!("{i}").as_str())
        );
    }
}

// Ordered-dict delete coverage is discovery-grade: the behavior is
// specified but was never exercised by the original test suite.
#[test]
fn dict_delete_hides_the_key() {
    let (_region, thread) = setup();
    let dict = DictRef::new(&thread).unwrap();
    dict.set_str(&thread, "gone", "1").unwrap();
    dict.delete(&thread, "gone").unwrap();
    assert!(matches!(
        dict.get_str(&thread, "gone"),
        Err(StoreError::Invalid)
    ));
    assert_eq!(dict.len(&thread).unwrap(), 0);
    // the slot is reusable
    dict.set_str(&thread, "gone", "2").unwrap();
    assert_eq!(dict.get_str(&thread, "gone").unwrap().as_deref(), Some("2"));
}

// ---------------------------------------------------------------------------
// Promise
// ---------------------------------------------------------------------------

#[test]
fn promise_single_transition() {
    let (_region, thread) = setup();
    let promise = PromiseRef::new(&thread).unwrap();
    assert_eq!(promise.state(&thread).unwrap(), PROMISE_PENDING);
    promise.fulfill_str(&thread, "ok").unwrap();
    assert_eq!(promise.state(&thread).unwrap(), PROMISE_FULFILLED);
    assert_eq!(promise.value_str(&thread).unwrap().as_deref(), Some("ok"));
    // the transition is one-shot
    assert!(matches!(
        promise.fulfill_str(&thread, "again"),
        Err(StoreError::Invalid)
    ));
}
