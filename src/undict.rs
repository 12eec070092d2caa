// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Unordered dictionary: open-addressed hash table with linear probing.
//
// Two tables share one lock: the persistent table everyone reads, and a
// delta table the writer creates at its first modification. Delta buckets
// carry `orig_item`, the index of the persistent bucket they shadow (-1
// for inserts). Commit merges the delta into the persistent table;
// deletions backward-shift the following probe run so no live bucket is
// ever stranded behind a hole that crosses its base position.
//
// Bucket states, encoded in (key, hash, value):
//   key set,   value set   — occupied
//   key set,   value EMPTY — delta-only tombstone (staged deletion)
//   key EMPTY, hash == 1   — tombstone
//   key EMPTY, hash == 0   — empty

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use crate::block::{self, RefHeader, TAG_UNDICT, TAG_UNDICT_DELTA_TABLE, TAG_UNDICT_TABLE};
use crate::lock::{have_write_lock, ContainerHeader};
use crate::region::Region;
use crate::shm_ptr::ShmPtr;
use crate::status::{Status, StoreResult};
use crate::thread_ctx::{debug_id, ThreadContext};
use crate::transaction::ContainerKind;
use crate::value;

const INITIAL_BUCKETS: usize = 8;
/// Tables cap at the largest medium block; growth past this is a hard stop.
const MAX_BUCKETS: usize = 4096;

const HASH_EMPTY: u32 = 0;
const HASH_TOMBSTONE: u32 = 1;

#[repr(C)]
pub struct Bucket {
    pub key: AtomicUsize, // interned string; EMPTY when unoccupied
    pub hash: AtomicU32,
    _pad: u32,
    pub value: AtomicUsize,
}

/// Delta bucket: the persistent layout plus the back-index.
#[repr(C)]
pub struct DeltaBucket {
    pub key: AtomicUsize,
    pub hash: AtomicU32,
    /// Persistent bucket this entry shadows; -1 for an insert.
    pub orig_item: AtomicI32,
    pub value: AtomicUsize,
}

#[repr(C, align(8))]
pub struct UnDictTable {
    pub refs: RefHeader, // TAG_UNDICT_TABLE or TAG_UNDICT_DELTA_TABLE
    pub bucket_count: AtomicI32, // power of two
    pub relocated: AtomicI32,
    // buckets follow
}

#[repr(C)]
pub struct ShmUnDict {
    pub head: ContainerHeader, // TAG_UNDICT
    pub class_name: AtomicUsize,
    pub buckets: AtomicUsize, // persistent UnDictTable
    pub count: AtomicI32,
    pub deleted_count: AtomicI32,
    pub delta_buckets: AtomicUsize, // delta UnDictTable; EMPTY between transactions
    pub delta_count: AtomicI32,     // staged count; -1 = no staged change
    pub delta_deleted_count: AtomicI32,
}

const TABLE_HEADER: usize = std::mem::size_of::<UnDictTable>();

fn max_chain(bucket_count: usize) -> usize {
    (bucket_count / 8).max(3)
}

fn table_size(bucket_count: usize, delta: bool) -> usize {
    let slot = if delta {
        std::mem::size_of::<DeltaBucket>()
    } else {
        std::mem::size_of::<Bucket>()
    };
    TABLE_HEADER + bucket_count * slot
}

fn buckets_of(region: &Region, table_ptr: ShmPtr) -> Option<&[Bucket]> {
    let table: &UnDictTable = region.deref(table_ptr)?;
    let n = table.bucket_count.load(Ordering::Acquire) as usize;
    let raw = region.translate(table_ptr.shift(TABLE_HEADER))?;
    Some(unsafe { std::slice::from_raw_parts(raw as *const Bucket, n) })
}

fn delta_buckets_of(region: &Region, table_ptr: ShmPtr) -> Option<&[DeltaBucket]> {
    let table: &UnDictTable = region.deref(table_ptr)?;
    let n = table.bucket_count.load(Ordering::Acquire) as usize;
    let raw = region.translate(table_ptr.shift(TABLE_HEADER))?;
    Some(unsafe { std::slice::from_raw_parts(raw as *const DeltaBucket, n) })
}

fn new_table(thread: &ThreadContext, bucket_count: usize, delta: bool) -> Result<ShmPtr, Status> {
    debug_assert!(bucket_count.is_power_of_two());
    if bucket_count > MAX_BUCKETS {
        return Err(Status::Failure);
    }
    let size = table_size(bucket_count, delta);
    let (tag, id) = if delta {
        (TAG_UNDICT_DELTA_TABLE, debug_id::UNDICT_DELTA)
    } else {
        (TAG_UNDICT_TABLE, debug_id::UNDICT_TABLE)
    };
    let ptr = thread.alloc(size, id)?;
    let region = thread.region();
    let table: &UnDictTable = region.deref(ptr).ok_or(Status::Failure)?;
    table.refs.init(tag, size);
    table.bucket_count.store(bucket_count as i32, Ordering::Release);
    table.relocated.store(0, Ordering::Release);
    if delta {
        for bucket in delta_buckets_of(region, ptr).ok_or(Status::Failure)? {
            bucket.key.store(ShmPtr::EMPTY.0, Ordering::Release);
            bucket.hash.store(HASH_EMPTY, Ordering::Release);
            bucket.orig_item.store(-1, Ordering::Release);
            bucket.value.store(ShmPtr::EMPTY.0, Ordering::Release);
        }
    } else {
        for bucket in buckets_of(region, ptr).ok_or(Status::Failure)? {
            bucket.key.store(ShmPtr::EMPTY.0, Ordering::Release);
            bucket.hash.store(HASH_EMPTY, Ordering::Release);
            bucket.value.store(ShmPtr::EMPTY.0, Ordering::Release);
        }
    }
    Ok(ptr)
}

pub fn new_undict(thread: &ThreadContext) -> Result<ShmPtr, Status> {
    let size = std::mem::size_of::<ShmUnDict>();
    let ptr = thread.alloc(size, debug_id::UNDICT)?;
    let region = thread.region();
    let dict: &ShmUnDict = region.deref(ptr).ok_or(Status::Failure)?;
    dict.head.init(TAG_UNDICT, size);
    dict.class_name.store(ShmPtr::EMPTY.0, Ordering::Release);
    let table = new_table(thread, INITIAL_BUCKETS, false)?;
    dict.buckets.store(table.0, Ordering::Release);
    dict.count.store(0, Ordering::Release);
    dict.deleted_count.store(0, Ordering::Release);
    dict.delta_buckets.store(ShmPtr::EMPTY.0, Ordering::Release);
    dict.delta_count.store(-1, Ordering::Release);
    dict.delta_deleted_count.store(0, Ordering::Release);
    Ok(ptr)
}

// ---------------------------------------------------------------------------
// Probing
// ---------------------------------------------------------------------------

enum Probe {
    Found(usize),
    /// First reusable slot on the probe path (tombstone or trailing empty).
    Free(usize),
    /// Chain limit exceeded without a match or free slot: grow.
    Exhausted,
}

fn probe_persistent(region: &Region, table_ptr: ShmPtr, hash: u32, key: &str) -> Probe {
    let Some(buckets) = buckets_of(region, table_ptr) else {
        return Probe::Exhausted;
    };
    let n = buckets.len();
    let mask = n - 1;
    let mut free: Option<usize> = None;
    for step in 0..max_chain(n) {
        let i = (hash as usize + step) & mask;
        let bucket = &buckets[i];
        let bkey = ShmPtr(bucket.key.load(Ordering::SeqCst));
        let bhash = bucket.hash.load(Ordering::SeqCst);
        if !bkey.is_set() {
            if bhash == HASH_EMPTY {
                return Probe::Free(free.unwrap_or(i));
            }
            if free.is_none() {
                free = Some(i); // tombstone, reusable
            }
            continue;
        }
        if bhash == hash && value::string_eq_str(region, bkey, key) {
            return Probe::Found(i);
        }
    }
    match free {
        Some(i) => Probe::Free(i),
        None => Probe::Exhausted,
    }
}

fn probe_delta(region: &Region, table_ptr: ShmPtr, hash: u32, key: &str) -> Probe {
    let Some(buckets) = delta_buckets_of(region, table_ptr) else {
        return Probe::Exhausted;
    };
    let n = buckets.len();
    let mask = n - 1;
    let mut free: Option<usize> = None;
    for step in 0..max_chain(n) {
        let i = (hash as usize + step) & mask;
        let bucket = &buckets[i];
        let bkey = ShmPtr(bucket.key.load(Ordering::SeqCst));
        let bhash = bucket.hash.load(Ordering::SeqCst);
        if !bkey.is_set() {
            if bhash == HASH_EMPTY {
                return Probe::Free(free.unwrap_or(i));
            }
            if free.is_none() {
                free = Some(i);
            }
            continue;
        }
        if bhash == hash && value::string_eq_str(region, bkey, key) {
            return Probe::Found(i);
        }
    }
    match free {
        Some(i) => Probe::Free(i),
        None => Probe::Exhausted,
    }
}

// ---------------------------------------------------------------------------
// Growth and deletion compaction (persistent table)
// ---------------------------------------------------------------------------

/// Replace the persistent table with one of double the buckets, reinserting
/// every live entry. The old table is marked relocated and released.
fn grow_persistent(thread: &ThreadContext, dict: &ShmUnDict) -> Result<(), Status> {
    let region = thread.region();
    let old_ptr = ShmPtr(dict.buckets.load(Ordering::SeqCst));
    let old_table: &UnDictTable = region.deref(old_ptr).ok_or(Status::Failure)?;
    let old_count = old_table.bucket_count.load(Ordering::SeqCst) as usize;
    let new_ptr = new_table(thread, old_count * 2, false)?;

    {
        let old_buckets = buckets_of(region, old_ptr).ok_or(Status::Failure)?;
        let new_buckets = buckets_of(region, new_ptr).ok_or(Status::Failure)?;
        let mask = old_count * 2 - 1;
        for bucket in old_buckets {
            let key = ShmPtr(bucket.key.load(Ordering::SeqCst));
            if !key.is_set() {
                continue;
            }
            let hash = bucket.hash.load(Ordering::SeqCst);
            let mut placed = false;
            for step in 0..=mask {
                let i = (hash as usize + step) & mask;
                let target = &new_buckets[i];
                if !ShmPtr(target.key.load(Ordering::SeqCst)).is_set() {
                    // ownership moves wholesale
                    target.hash.store(hash, Ordering::SeqCst);
                    target.value.store(bucket.value.load(Ordering::SeqCst), Ordering::SeqCst);
                    target.key.store(key.0, Ordering::SeqCst);
                    placed = true;
                    break;
                }
            }
            debug_assert!(placed);
            bucket.key.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
            bucket.value.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
            bucket.hash.store(HASH_EMPTY, Ordering::SeqCst);
        }
    }

    old_table.relocated.store(1, Ordering::SeqCst);
    dict.buckets.store(new_ptr.0, Ordering::SeqCst);
    block::release(thread, old_ptr);
    Ok(())
}

/// Empty the bucket at `hole` and backward-shift the following probe run so
/// that no survivor sits past a gap that crosses its base bucket.
fn delete_and_compact(buckets: &[Bucket], hole: usize) {
    let n = buckets.len();
    let mask = n - 1;
    let mut hole = hole;
    buckets[hole].key.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
    buckets[hole].value.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
    buckets[hole].hash.store(HASH_TOMBSTONE, Ordering::SeqCst);

    let mut i = hole;
    loop {
        i = (i + 1) & mask;
        let bucket = &buckets[i];
        let key = ShmPtr(bucket.key.load(Ordering::SeqCst));
        if !key.is_set() {
            if bucket.hash.load(Ordering::SeqCst) == HASH_EMPTY {
                break; // run ends: the hole can become fully empty
            }
            continue; // an existing tombstone keeps the run going
        }
        let hash = bucket.hash.load(Ordering::SeqCst);
        let base = hash as usize & mask;
        // does the candidate's base position lie outside (hole, i]?
        let dist_hole = (i.wrapping_sub(hole)) & mask;
        let dist_base = (i.wrapping_sub(base)) & mask;
        if dist_base >= dist_hole {
            // move it back into the hole
            buckets[hole].hash.store(hash, Ordering::SeqCst);
            buckets[hole].value.store(bucket.value.load(Ordering::SeqCst), Ordering::SeqCst);
            buckets[hole].key.store(key.0, Ordering::SeqCst);
            bucket.key.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
            bucket.value.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
            bucket.hash.store(HASH_TOMBSTONE, Ordering::SeqCst);
            hole = i;
        }
    }
    // the final hole ends its run: demote it from tombstone to empty
    buckets[hole].hash.store(HASH_EMPTY, Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

fn ensure_delta(thread: &ThreadContext, dict: &ShmUnDict) -> Result<ShmPtr, Status> {
    let existing = ShmPtr(dict.delta_buckets.load(Ordering::SeqCst));
    if existing.is_set() {
        return Ok(existing);
    }
    let region = thread.region();
    let persistent = ShmPtr(dict.buckets.load(Ordering::SeqCst));
    let table: &UnDictTable = region.deref(persistent).ok_or(Status::Failure)?;
    let n = table.bucket_count.load(Ordering::SeqCst) as usize;
    let fresh = new_table(thread, n, true)?;
    dict.delta_buckets.store(fresh.0, Ordering::SeqCst);
    Ok(fresh)
}

/// Grow the delta table in place, re-probing every entry.
fn grow_delta(thread: &ThreadContext, dict: &ShmUnDict) -> Result<(), Status> {
    let region = thread.region();
    let old_ptr = ShmPtr(dict.delta_buckets.load(Ordering::SeqCst));
    let old_table: &UnDictTable = region.deref(old_ptr).ok_or(Status::Failure)?;
    let old_count = old_table.bucket_count.load(Ordering::SeqCst) as usize;
    let new_ptr = new_table(thread, old_count * 2, true)?;
    {
        let old_buckets = delta_buckets_of(region, old_ptr).ok_or(Status::Failure)?;
        let new_buckets = delta_buckets_of(region, new_ptr).ok_or(Status::Failure)?;
        let mask = old_count * 2 - 1;
        for bucket in old_buckets {
            let key = ShmPtr(bucket.key.load(Ordering::SeqCst));
            if !key.is_set() {
                continue;
            }
            let hash = bucket.hash.load(Ordering::SeqCst);
            for step in 0..=mask {
                let i = (hash as usize + step) & mask;
                let target = &new_buckets[i];
                if !ShmPtr(target.key.load(Ordering::SeqCst)).is_set() {
                    target.hash.store(hash, Ordering::SeqCst);
                    target.orig_item.store(bucket.orig_item.load(Ordering::SeqCst), Ordering::SeqCst);
                    target.value.store(bucket.value.load(Ordering::SeqCst), Ordering::SeqCst);
                    target.key.store(key.0, Ordering::SeqCst);
                    break;
                }
            }
            bucket.key.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
            bucket.value.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
        }
    }
    let old_table: &UnDictTable = region.deref(old_ptr).ok_or(Status::Failure)?;
    old_table.relocated.store(1, Ordering::SeqCst);
    dict.delta_buckets.store(new_ptr.0, Ordering::SeqCst);
    block::release(thread, old_ptr);
    Ok(())
}

fn staged_count(dict: &ShmUnDict) -> i32 {
    let staged = dict.delta_count.load(Ordering::SeqCst);
    if staged == -1 {
        dict.count.load(Ordering::SeqCst)
    } else {
        staged
    }
}

/// Stage `value` under `key`; EMPTY stages a deletion.
pub(crate) fn set_op(
    thread: &ThreadContext,
    dict_ptr: ShmPtr,
    key: &str,
    value_ptr: ShmPtr,
) -> Result<(), Status> {
    match thread.lock_write(dict_ptr, ContainerKind::UnDict) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let dict: &ShmUnDict = region.deref(dict_ptr).ok_or(Status::Failure)?;
    let hash = value::hash_str(key);

    let delta_ptr = ensure_delta(thread, dict)?;

    // Already shadowed this transaction?
    match probe_delta(region, delta_ptr, hash, key) {
        Probe::Found(i) => {
            let buckets = delta_buckets_of(region, delta_ptr).ok_or(Status::Failure)?;
            let bucket = &buckets[i];
            let old_visible = ShmPtr(bucket.value.load(Ordering::SeqCst)).is_set();
            let old = ShmPtr(bucket.value.swap(value_ptr.0, Ordering::SeqCst));
            block::release(thread, old);
            let now_visible = value_ptr.is_set();
            let delta = (now_visible as i32) - (old_visible as i32);
            if !now_visible && bucket.orig_item.load(Ordering::SeqCst) == -1 && !old_visible {
                return Err(Status::Invalid); // deleting a key that never existed
            }
            if delta != 0 {
                dict.delta_count.store(staged_count(dict) + delta, Ordering::SeqCst);
            }
            return Ok(());
        }
        Probe::Exhausted => {
            grow_delta(thread, dict)?;
            return set_op_after_locked(thread, dict, key, hash, value_ptr);
        }
        Probe::Free(_) => {}
    }
    set_op_after_locked(thread, dict, key, hash, value_ptr)
}

/// Insert a fresh delta entry for `key` (not yet shadowed).
fn set_op_after_locked(
    thread: &ThreadContext,
    dict: &ShmUnDict,
    key: &str,
    hash: u32,
    value_ptr: ShmPtr,
) -> Result<(), Status> {
    let region = thread.region();
    let delta_ptr = ShmPtr(dict.delta_buckets.load(Ordering::SeqCst));
    let persistent_ptr = ShmPtr(dict.buckets.load(Ordering::SeqCst));

    let orig = match probe_persistent(region, persistent_ptr, hash, key) {
        Probe::Found(i) => i as i32,
        _ => -1,
    };
    if orig == -1 && !value_ptr.is_set() {
        return Err(Status::Invalid); // delete of a missing key
    }

    let slot = match probe_delta(region, delta_ptr, hash, key) {
        Probe::Free(i) => i,
        Probe::Found(i) => i, // unreachable in practice
        Probe::Exhausted => {
            grow_delta(thread, dict)?;
            return set_op_after_locked(thread, dict, key, hash, value_ptr);
        }
    };

    let buckets = delta_buckets_of(region, delta_ptr).ok_or(Status::Failure)?;
    let bucket = &buckets[slot];
    let key_value = if orig >= 0 {
        let persistent = buckets_of(region, persistent_ptr).ok_or(Status::Failure)?;
        let shared = ShmPtr(persistent[orig as usize].key.load(Ordering::SeqCst));
        block::acq(region, shared);
        shared
    } else {
        value::new_string(thread, key)?
    };
    bucket.hash.store(hash, Ordering::SeqCst);
    bucket.orig_item.store(orig, Ordering::SeqCst);
    bucket.value.store(value_ptr.0, Ordering::SeqCst);
    bucket.key.store(key_value.0, Ordering::SeqCst);

    let was_visible = orig >= 0;
    let now_visible = value_ptr.is_set();
    let delta = (now_visible as i32) - (was_visible as i32);
    if delta != 0 {
        dict.delta_count.store(staged_count(dict) + delta, Ordering::SeqCst);
    }
    if !now_visible {
        dict.delta_deleted_count.fetch_add(1, Ordering::SeqCst);
    }
    Ok(())
}

/// Read the value for `key`; acquired. Lock owners see the delta first.
pub(crate) fn get_op(
    thread: &ThreadContext,
    dict_ptr: ShmPtr,
    key: &str,
) -> Result<ShmPtr, Status> {
    match thread.lock_read(dict_ptr, ContainerKind::UnDict) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let dict: &ShmUnDict = region.deref(dict_ptr).ok_or(Status::Failure)?;
    let hash = value::hash_str(key);

    if have_write_lock(thread, &dict.head.lock) {
        let delta_ptr = ShmPtr(dict.delta_buckets.load(Ordering::SeqCst));
        if delta_ptr.is_set() {
            if let Probe::Found(i) = probe_delta(region, delta_ptr, hash, key) {
                let buckets = delta_buckets_of(region, delta_ptr).ok_or(Status::Failure)?;
                let staged = ShmPtr(buckets[i].value.load(Ordering::SeqCst));
                if !staged.is_set() {
                    return Err(Status::Invalid); // staged deletion
                }
                block::acq(region, staged);
                return Ok(staged);
            }
        }
    }

    let persistent_ptr = ShmPtr(dict.buckets.load(Ordering::SeqCst));
    match probe_persistent(region, persistent_ptr, hash, key) {
        Probe::Found(i) => {
            let buckets = buckets_of(region, persistent_ptr).ok_or(Status::Failure)?;
            let v = ShmPtr(buckets[i].value.load(Ordering::SeqCst));
            if !v.is_set() {
                return Err(Status::Invalid);
            }
            block::acq(region, v);
            Ok(v)
        }
        _ => Err(Status::Invalid),
    }
}

pub(crate) fn count_op(thread: &ThreadContext, dict_ptr: ShmPtr) -> Result<i32, Status> {
    match thread.lock_read(dict_ptr, ContainerKind::UnDict) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let dict: &ShmUnDict = region.deref(dict_ptr).ok_or(Status::Failure)?;
    if have_write_lock(thread, &dict.head.lock) {
        Ok(staged_count(dict))
    } else {
        Ok(dict.count.load(Ordering::SeqCst))
    }
}

/// Stage the removal of every key.
pub(crate) fn clear_op(thread: &ThreadContext, dict_ptr: ShmPtr) -> Result<(), Status> {
    match thread.lock_write(dict_ptr, ContainerKind::UnDict) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let dict: &ShmUnDict = region.deref(dict_ptr).ok_or(Status::Failure)?;
    let persistent_ptr = ShmPtr(dict.buckets.load(Ordering::SeqCst));
    let buckets = buckets_of(region, persistent_ptr).ok_or(Status::Failure)?;
    for bucket in buckets {
        let key_ptr = ShmPtr(bucket.key.load(Ordering::SeqCst));
        if !key_ptr.is_set() || !ShmPtr(bucket.value.load(Ordering::SeqCst)).is_set() {
            continue;
        }
        if let Some(key) = value::get_string(region, key_ptr) {
            set_op_after_staged_clear(thread, dict, &key)?;
        }
    }
    Ok(())
}

fn set_op_after_staged_clear(
    thread: &ThreadContext,
    dict: &ShmUnDict,
    key: &str,
) -> Result<(), Status> {
    let region = thread.region();
    let hash = value::hash_str(key);
    let delta_ptr = ensure_delta(thread, dict)?;
    match probe_delta(region, delta_ptr, hash, key) {
        Probe::Found(i) => {
            let buckets = delta_buckets_of(region, delta_ptr).ok_or(Status::Failure)?;
            let old_visible = ShmPtr(buckets[i].value.load(Ordering::SeqCst)).is_set();
            let old = ShmPtr(buckets[i].value.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
            block::release(thread, old);
            if old_visible {
                dict.delta_count.store(staged_count(dict) - 1, Ordering::SeqCst);
            }
            Ok(())
        }
        _ => set_op_after_locked(thread, dict, key, hash, ShmPtr::EMPTY),
    }
}

// ---------------------------------------------------------------------------
// Commit, rollback, destroy
// ---------------------------------------------------------------------------

pub(crate) fn commit_undict(thread: &ThreadContext, dict_ptr: ShmPtr) {
    let region = thread.region();
    let Some(dict) = region.deref::<ShmUnDict>(dict_ptr) else {
        return;
    };
    let delta_ptr = ShmPtr(dict.delta_buckets.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    if delta_ptr.is_set() {
        let Some(delta) = delta_buckets_of(region, delta_ptr) else {
            return;
        };
        for bucket in delta {
            let key_ptr = ShmPtr(bucket.key.load(Ordering::SeqCst));
            if !key_ptr.is_set() {
                continue;
            }
            let hash = bucket.hash.load(Ordering::SeqCst);
            let staged_value = ShmPtr(bucket.value.load(Ordering::SeqCst));
            let orig = bucket.orig_item.load(Ordering::SeqCst);
            apply_delta_bucket(thread, dict, key_ptr, hash, staged_value, orig);
            // ownership has moved or been released; blank before the table
            // itself is freed
            bucket.key.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
            bucket.value.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
            bucket.hash.store(HASH_EMPTY, Ordering::SeqCst);
        }
        block::release(thread, delta_ptr);
    }

    let staged = dict.delta_count.swap(-1, Ordering::SeqCst);
    if staged != -1 {
        dict.count.store(staged, Ordering::SeqCst);
    }
    dict.delta_deleted_count.store(0, Ordering::SeqCst);
}

fn apply_delta_bucket(
    thread: &ThreadContext,
    dict: &ShmUnDict,
    key_ptr: ShmPtr,
    hash: u32,
    staged_value: ShmPtr,
    orig: i32,
) {
    let region = thread.region();
    let key = match value::get_string(region, key_ptr) {
        Some(k) => k,
        None => return,
    };

    let persistent_ptr = ShmPtr(dict.buckets.load(Ordering::SeqCst));
    // `orig` may be stale after a persistent growth during this commit;
    // re-probe rather than trust it blindly.
    let position = match probe_persistent(region, persistent_ptr, hash, &key) {
        Probe::Found(i) => Some(i),
        _ => None,
    };

    match (position, staged_value.is_set()) {
        (Some(i), false) => {
            // committed deletion with run compaction
            let buckets = match buckets_of(region, persistent_ptr) {
                Some(b) => b,
                None => return,
            };
            let old_key = ShmPtr(buckets[i].key.load(Ordering::SeqCst));
            let old_value = ShmPtr(buckets[i].value.load(Ordering::SeqCst));
            delete_and_compact(buckets, i);
            block::release(thread, old_key);
            block::release(thread, old_value);
            block::release(thread, key_ptr); // the delta's own key reference
            dict.deleted_count.fetch_add(1, Ordering::SeqCst);
        }
        (Some(i), true) => {
            // update in place
            let buckets = match buckets_of(region, persistent_ptr) {
                Some(b) => b,
                None => return,
            };
            let old = ShmPtr(buckets[i].value.swap(staged_value.0, Ordering::SeqCst));
            block::release(thread, old);
            block::release(thread, key_ptr);
        }
        (None, true) => {
            // insert, growing as needed
            let mut table_ptr = persistent_ptr;
            loop {
                match probe_persistent(region, table_ptr, hash, &key) {
                    Probe::Free(i) => {
                        let buckets = match buckets_of(region, table_ptr) {
                            Some(b) => b,
                            None => return,
                        };
                        buckets[i].hash.store(hash, Ordering::SeqCst);
                        buckets[i].value.store(staged_value.0, Ordering::SeqCst);
                        buckets[i].key.store(key_ptr.0, Ordering::SeqCst);
                        return;
                    }
                    Probe::Found(_) => return,
                    Probe::Exhausted => {
                        if grow_persistent(thread, dict).is_err() {
                            debug_assert!(false, "persistent table growth failed");
                            return;
                        }
                        table_ptr = ShmPtr(dict.buckets.load(Ordering::SeqCst));
                    }
                }
            }
        }
        (None, false) => {
            // delete raced with nothing to delete
            block::release(thread, key_ptr);
        }
    }
}

pub(crate) fn rollback_undict(thread: &ThreadContext, dict_ptr: ShmPtr) {
    let region = thread.region();
    let Some(dict) = region.deref::<ShmUnDict>(dict_ptr) else {
        return;
    };
    let delta_ptr = ShmPtr(dict.delta_buckets.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    if delta_ptr.is_set() {
        if let Some(delta) = delta_buckets_of(region, delta_ptr) {
            for bucket in delta {
                let key_ptr = ShmPtr(bucket.key.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
                if key_ptr.is_set() {
                    block::release(thread, key_ptr);
                }
                let v = ShmPtr(bucket.value.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
                block::release(thread, v);
                bucket.hash.store(HASH_EMPTY, Ordering::SeqCst);
            }
        }
        block::release(thread, delta_ptr);
    }
    dict.delta_count.store(-1, Ordering::SeqCst);
    dict.delta_deleted_count.store(0, Ordering::SeqCst);
}

/// Shared by the persistent and delta table destructors.
pub(crate) fn destroy_table(thread: &ThreadContext, table_ptr: ShmPtr) {
    let region = thread.region();
    let Some(buckets) = buckets_of(region, table_ptr) else {
        return;
    };
    // The delta layout shares the (key, hash, value) prefix offsets that
    // matter here only in the persistent shape; delta tables are blanked
    // before release, so this walk frees nothing twice.
    for bucket in buckets {
        let key = ShmPtr(bucket.key.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
        block::release(thread, key);
        let v = ShmPtr(bucket.value.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
        block::release(thread, v);
    }
}

pub(crate) fn destroy_undict(thread: &ThreadContext, dict_ptr: ShmPtr) {
    let region = thread.region();
    let Some(dict) = region.deref::<ShmUnDict>(dict_ptr) else {
        return;
    };
    block::clear_ptr(thread, &dict.class_name);
    let table = ShmPtr(dict.buckets.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    block::release(thread, table);
    let delta = ShmPtr(dict.delta_buckets.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    if delta.is_set() {
        block::release(thread, delta);
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A copyable handle to an unordered dictionary in the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnDictRef(pub ShmPtr);

impl UnDictRef {
    pub fn new(thread: &ThreadContext) -> StoreResult<UnDictRef> {
        thread.with_transaction(|t| new_undict(t).map(UnDictRef))
    }

    /// Store a value pointer under `key`; the caller's reference moves in.
    pub fn set_consume(&self, thread: &ThreadContext, key: &str, value: ShmPtr) -> StoreResult<()> {
        let ptr = self.0;
        thread.with_transaction(|t| set_op(t, ptr, key, value))
    }

    pub fn set_str(&self, thread: &ThreadContext, key: &str, v: &str) -> StoreResult<()> {
        let value = thread.with_transaction(|t| value::new_string(t, v))?;
        self.set_consume(thread, key, value)
    }

    pub fn set_int(&self, thread: &ThreadContext, key: &str, v: i64) -> StoreResult<()> {
        let value = thread.with_transaction(|t| value::new_int(t, v))?;
        self.set_consume(thread, key, value)
    }

    /// Remove `key`; `Err(Invalid)` when absent.
    pub fn delete(&self, thread: &ThreadContext, key: &str) -> StoreResult<()> {
        let ptr = self.0;
        thread.with_transaction(|t| set_op(t, ptr, key, ShmPtr::EMPTY))
    }

    /// Acquired value pointer for `key`; `Err(Invalid)` when missing.
    pub fn get_owned(&self, thread: &ThreadContext, key: &str) -> StoreResult<ShmPtr> {
        let ptr = self.0;
        thread.with_transaction(|t| get_op(t, ptr, key))
    }

    pub fn get_str(&self, thread: &ThreadContext, key: &str) -> StoreResult<Option<String>> {
        let ptr = self.get_owned(thread, key)?;
        let result = value::get_string(thread.region(), ptr);
        block::release(thread, ptr);
        Ok(result)
    }

    pub fn get_int(&self, thread: &ThreadContext, key: &str) -> StoreResult<Option<i64>> {
        let ptr = self.get_owned(thread, key)?;
        let result = value::get_int(thread.region(), ptr);
        block::release(thread, ptr);
        Ok(result)
    }

    pub fn len(&self, thread: &ThreadContext) -> StoreResult<i32> {
        let ptr = self.0;
        thread.with_transaction(|t| count_op(t, ptr))
    }

    /// Remove every key.
    pub fn clear(&self, thread: &ThreadContext) -> StoreResult<()> {
        let ptr = self.0;
        thread.with_transaction(|t| clear_op(t, ptr))
    }
}
