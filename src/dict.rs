// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Ordered dictionary: a 4-way bit-sliced hash trie, 2 bits of the key hash
// per level. Elements stay at the level where they were first inserted;
// collisions push new keys into nested nodes. A bounded delta array names
// every element (and every node created) by the current writer, so commit
// and rollback touch exactly those.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use crate::block::{self, AbstractHeader, TAG_DICT, TAG_DICT_DELTA, TAG_DICT_NODE};
use crate::changelog;
use crate::lock::{have_write_lock, ContainerHeader};
use crate::region::Region;
use crate::shm_ptr::ShmPtr;
use crate::status::{Status, StoreResult};
use crate::thread_ctx::{debug_id, ThreadContext};
use crate::transaction::ContainerKind;
use crate::value;

pub const LEVEL_BITS: u32 = 2;
pub const LEVEL_SIZE: usize = 1 << LEVEL_BITS;

#[repr(C)]
pub struct DictElement {
    pub hash: AtomicU32,
    pub claimed: AtomicI32,
    /// Interned string key; EMPTY when the element is unused.
    pub key: AtomicUsize,
    pub data: AtomicUsize,
    pub has_new_data: AtomicI32,
    _pad: i32,
    pub new_data: AtomicUsize,
    /// Nested node for colliding keys; EMPTY when leaf.
    pub nested: AtomicUsize,
}

#[repr(C)]
pub struct DictNode {
    pub header: AbstractHeader, // TAG_DICT_NODE
    pub elements: [DictElement; LEVEL_SIZE],
}

#[repr(C)]
pub struct ShmDict {
    pub head: ContainerHeader, // TAG_DICT
    pub root: AtomicUsize,     // DictNode; EMPTY until first insert
    pub count: AtomicI32,
    pub new_count: AtomicI32, // -1 = no staged change
    pub delta: AtomicUsize,   // ChangeLog of delta entries
}

// Delta entry: low 62 bits the element/node pointer, high 2 bits the kind.
const DELTA_CHANGED: u64 = 0;
const DELTA_NEW_KEY: u64 = 1;
const DELTA_NEW_NODE: u64 = 2;

fn pack_delta(kind: u64, ptr: ShmPtr) -> u64 {
    (kind << 62) | ptr.0 as u64
}

fn unpack_delta(entry: u64) -> (u64, ShmPtr) {
    (entry >> 62, ShmPtr((entry & ((1 << 62) - 1)) as usize))
}

pub fn new_dict(thread: &ThreadContext) -> Result<ShmPtr, Status> {
    let size = std::mem::size_of::<ShmDict>();
    let ptr = thread.alloc(size, debug_id::DICT)?;
    let dict: &ShmDict = thread.region().deref(ptr).ok_or(Status::Failure)?;
    dict.head.init(TAG_DICT, size);
    dict.root.store(ShmPtr::EMPTY.0, Ordering::Release);
    dict.count.store(0, Ordering::Release);
    dict.new_count.store(-1, Ordering::Release);
    dict.delta.store(ShmPtr::EMPTY.0, Ordering::Release);
    Ok(ptr)
}

fn new_node(thread: &ThreadContext) -> Result<ShmPtr, Status> {
    let size = std::mem::size_of::<DictNode>();
    let ptr = thread.alloc(size, debug_id::DICT_NODE)?;
    let node: &DictNode = thread.region().deref(ptr).ok_or(Status::Failure)?;
    node.header.init(TAG_DICT_NODE, size);
    for element in &node.elements {
        element.hash.store(0, Ordering::Release);
        element.claimed.store(0, Ordering::Release);
        element.key.store(ShmPtr::EMPTY.0, Ordering::Release);
        element.data.store(ShmPtr::EMPTY.0, Ordering::Release);
        element.has_new_data.store(0, Ordering::Release);
        element.new_data.store(ShmPtr::EMPTY.0, Ordering::Release);
        element.nested.store(ShmPtr::EMPTY.0, Ordering::Release);
    }
    Ok(ptr)
}

fn element_ptr(node_ptr: ShmPtr, index: usize) -> ShmPtr {
    node_ptr.shift(
        std::mem::size_of::<AbstractHeader>() + index * std::mem::size_of::<DictElement>(),
    )
}

/// The element slot for `hash` at `node_ptr`, walking existing nested
/// nodes. Returns the element whose key matches, or the first free /
/// claimable slot on the path. `create` extends the trie when the path is
/// fully occupied by other keys.
fn find_slot(
    thread: &ThreadContext,
    dict: &ShmDict,
    hash: u32,
    key: &str,
    create: bool,
) -> Result<Option<ShmPtr>, Status> {
    let region = thread.region();
    let mut node_ptr = ShmPtr(dict.root.load(Ordering::SeqCst));
    if !node_ptr.is_set() {
        if !create {
            return Ok(None);
        }
        let fresh = new_node(thread)?;
        dict.root.store(fresh.0, Ordering::SeqCst);
        changelog::push(
            thread,
            &dict.delta,
            TAG_DICT_DELTA,
            debug_id::DICT_DELTA,
            pack_delta(DELTA_NEW_NODE, fresh),
        )?;
        node_ptr = fresh;
    }

    let mut level = 0u32;
    loop {
        let index = ((hash >> (LEVEL_BITS * level)) & (LEVEL_SIZE as u32 - 1)) as usize;
        let node: &DictNode = region.deref(node_ptr).ok_or(Status::Failure)?;
        let element = &node.elements[index];
        let ekey = ShmPtr(element.key.load(Ordering::SeqCst));
        if !ekey.is_set() {
            return Ok(if create {
                Some(element_ptr(node_ptr, index))
            } else {
                None
            });
        }
        if element.hash.load(Ordering::SeqCst) == hash && value::string_eq_str(region, ekey, key) {
            return Ok(Some(element_ptr(node_ptr, index)));
        }
        let nested = ShmPtr(element.nested.load(Ordering::SeqCst));
        if nested.is_set() {
            node_ptr = nested;
        } else {
            if !create {
                return Ok(None);
            }
            let fresh = new_node(thread)?;
            element.nested.store(fresh.0, Ordering::SeqCst);
            changelog::push(
                thread,
                &dict.delta,
                TAG_DICT_DELTA,
                debug_id::DICT_DELTA,
                pack_delta(DELTA_NEW_NODE, fresh),
            )?;
            node_ptr = fresh;
        }
        level = (level + 1) % (32 / LEVEL_BITS);
    }
}

/// Stage `value` under `key`; EMPTY stages a deletion.
pub(crate) fn set_op(
    thread: &ThreadContext,
    dict_ptr: ShmPtr,
    key: &str,
    value_ptr: ShmPtr,
) -> Result<(), Status> {
    match thread.lock_write(dict_ptr, ContainerKind::Dict) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let dict: &ShmDict = region.deref(dict_ptr).ok_or(Status::Failure)?;
    let hash = value::hash_str(key);

    let slot = find_slot(thread, dict, hash, key, true)?.ok_or(Status::Failure)?;
    let element: &DictElement = region.deref(slot).ok_or(Status::Failure)?;

    let existing_key = ShmPtr(element.key.load(Ordering::SeqCst));
    // visibility in this transaction's own view, staged changes included
    let was_visible = existing_key.is_set()
        && if element.has_new_data.load(Ordering::SeqCst) != 0 {
            ShmPtr(element.new_data.load(Ordering::SeqCst)).is_set()
        } else {
            ShmPtr(element.data.load(Ordering::SeqCst)).is_set()
        };

    if !existing_key.is_set() {
        if !value_ptr.is_set() {
            // deleting a missing key
            return Err(Status::Invalid);
        }
        let interned = value::new_string(thread, key)?;
        element.hash.store(hash, Ordering::SeqCst);
        element.key.store(interned.0, Ordering::SeqCst);
        if element.claimed.swap(1, Ordering::SeqCst) == 0 {
            changelog::push(
                thread,
                &dict.delta,
                TAG_DICT_DELTA,
                debug_id::DICT_DELTA,
                pack_delta(DELTA_NEW_KEY, slot),
            )?;
        }
    } else if element.claimed.swap(1, Ordering::SeqCst) == 0 {
        changelog::push(
            thread,
            &dict.delta,
            TAG_DICT_DELTA,
            debug_id::DICT_DELTA,
            pack_delta(DELTA_CHANGED, slot),
        )?;
    }

    if !was_visible && !value_ptr.is_set() {
        return Err(Status::Invalid);
    }

    if element.has_new_data.load(Ordering::SeqCst) != 0 {
        block::move_ptr(thread, &element.new_data, value_ptr);
    } else {
        element.new_data.store(value_ptr.0, Ordering::SeqCst);
        element.has_new_data.store(1, Ordering::SeqCst);
    }

    // staged count bookkeeping
    let count = {
        let staged = dict.new_count.load(Ordering::SeqCst);
        if staged == -1 {
            dict.count.load(Ordering::SeqCst)
        } else {
            staged
        }
    };
    let now_visible = value_ptr.is_set();
    let delta = match (was_visible, now_visible) {
        (false, true) => 1,
        (true, false) => -1,
        _ => 0,
    };
    if delta != 0 {
        dict.new_count.store(count + delta, Ordering::SeqCst);
    }
    Ok(())
}

/// Read the value for `key`; acquired. `Invalid` when absent.
pub(crate) fn get_op(
    thread: &ThreadContext,
    dict_ptr: ShmPtr,
    key: &str,
) -> Result<ShmPtr, Status> {
    match thread.lock_read(dict_ptr, ContainerKind::Dict) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let dict: &ShmDict = region.deref(dict_ptr).ok_or(Status::Failure)?;
    let owner = have_write_lock(thread, &dict.head.lock);
    let hash = value::hash_str(key);

    let Some(slot) = find_slot(thread, dict, hash, key, false)? else {
        return Err(Status::Invalid);
    };
    let element: &DictElement = region.deref(slot).ok_or(Status::Failure)?;
    if !ShmPtr(element.key.load(Ordering::SeqCst)).is_set() {
        return Err(Status::Invalid);
    }
    let ptr = if owner && element.has_new_data.load(Ordering::SeqCst) != 0 {
        ShmPtr(element.new_data.load(Ordering::SeqCst))
    } else {
        ShmPtr(element.data.load(Ordering::SeqCst))
    };
    if !ptr.is_set() {
        return Err(Status::Invalid); // staged or committed deletion
    }
    block::acq(region, ptr);
    Ok(ptr)
}

pub(crate) fn count_op(thread: &ThreadContext, dict_ptr: ShmPtr) -> Result<i32, Status> {
    match thread.lock_read(dict_ptr, ContainerKind::Dict) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let dict: &ShmDict = region.deref(dict_ptr).ok_or(Status::Failure)?;
    let owner = have_write_lock(thread, &dict.head.lock);
    let staged = dict.new_count.load(Ordering::SeqCst);
    if owner && staged != -1 {
        Ok(staged)
    } else {
        Ok(dict.count.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Commit, rollback, destroy
// ---------------------------------------------------------------------------

fn for_each_delta<F: FnMut(u64, ShmPtr)>(region: &Region, dict: &ShmDict, mut f: F) {
    let log_ptr = ShmPtr(dict.delta.load(Ordering::SeqCst));
    if !log_ptr.is_set() {
        return;
    }
    let n = changelog::count(region, log_ptr);
    let Some(entries) = changelog::entries(region, log_ptr) else {
        return;
    };
    for entry in entries.iter().take(n) {
        let (kind, ptr) = unpack_delta(entry.load(Ordering::SeqCst));
        f(kind, ptr);
    }
}

pub(crate) fn commit_dict(thread: &ThreadContext, dict_ptr: ShmPtr) {
    let region = thread.region();
    let Some(dict) = region.deref::<ShmDict>(dict_ptr) else {
        return;
    };

    for_each_delta(region, dict, |kind, ptr| {
        if kind == DELTA_NEW_NODE {
            return; // nodes created this transaction stay
        }
        let Some(element) = region.deref::<DictElement>(ptr) else {
            return;
        };
        if element.has_new_data.load(Ordering::SeqCst) != 0 {
            let staged = ShmPtr(element.new_data.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
            element.has_new_data.store(0, Ordering::SeqCst);
            block::move_ptr(thread, &element.data, staged);
        }
        element.claimed.store(0, Ordering::SeqCst);
    });

    let staged = dict.new_count.swap(-1, Ordering::SeqCst);
    if staged != -1 {
        dict.count.store(staged, Ordering::SeqCst);
    }
    let log_ptr = ShmPtr(dict.delta.load(Ordering::SeqCst));
    if log_ptr.is_set() {
        changelog::clear(region, log_ptr);
    }
}

pub(crate) fn rollback_dict(thread: &ThreadContext, dict_ptr: ShmPtr) {
    let region = thread.region();
    let Some(dict) = region.deref::<ShmDict>(dict_ptr) else {
        return;
    };

    for_each_delta(region, dict, |kind, ptr| {
        if kind == DELTA_NEW_NODE {
            // Created nodes stay in the trie: they are empty once their
            // claimed elements roll back, and reusable by later inserts.
            return;
        }
        let Some(element) = region.deref::<DictElement>(ptr) else {
            return;
        };
        if element.has_new_data.load(Ordering::SeqCst) != 0 {
            element.has_new_data.store(0, Ordering::SeqCst);
            block::clear_ptr(thread, &element.new_data);
        }
        if kind == DELTA_NEW_KEY {
            // the key never became visible: unclaim the slot entirely
            block::clear_ptr(thread, &element.key);
            element.hash.store(0, Ordering::SeqCst);
        }
        element.claimed.store(0, Ordering::SeqCst);
    });

    dict.new_count.store(-1, Ordering::SeqCst);
    let log_ptr = ShmPtr(dict.delta.load(Ordering::SeqCst));
    if log_ptr.is_set() {
        changelog::clear(region, log_ptr);
    }
}

fn destroy_node(thread: &ThreadContext, node_ptr: ShmPtr) {
    let region = thread.region();
    let Some(node) = region.deref::<DictNode>(node_ptr) else {
        return;
    };
    for element in &node.elements {
        block::clear_ptr(thread, &element.key);
        block::clear_ptr(thread, &element.data);
        if element.has_new_data.swap(0, Ordering::SeqCst) != 0 {
            block::clear_ptr(thread, &element.new_data);
        }
        let nested = ShmPtr(element.nested.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
        if nested.is_set() {
            destroy_node(thread, nested);
            thread.push_free(nested);
        }
    }
}

pub(crate) fn destroy_dict(thread: &ThreadContext, dict_ptr: ShmPtr) {
    let region = thread.region();
    let Some(dict) = region.deref::<ShmDict>(dict_ptr) else {
        return;
    };
    let root = ShmPtr(dict.root.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    if root.is_set() {
        destroy_node(thread, root);
        thread.push_free(root);
    }
    let log_ptr = ShmPtr(dict.delta.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    if log_ptr.is_set() {
        thread.push_free(log_ptr);
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A copyable handle to an ordered dictionary in the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DictRef(pub ShmPtr);

impl DictRef {
    pub fn new(thread: &ThreadContext) -> StoreResult<DictRef> {
        thread.with_transaction(|t| new_dict(t).map(DictRef))
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

    /// Stage a deletion. Discovery-grade: the original's test suite never
    /// exercised ordered-dict deletes, so treat behavior here as subject to
    /// test findings rather than a frozen contract.
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

    pub fn len(&self, thread: &ThreadContext) -> StoreResult<i32> {
        let ptr = self.0;
        thread.with_transaction(|t| count_op(t, ptr))
    }
}
