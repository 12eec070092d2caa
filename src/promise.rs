// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Promise: a one-shot cross-process notification. State moves from pending
// to fulfilled or rejected exactly once; commit publishes the staged state
// and wakes every thread in the waiter bitmap.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::block::{self, TAG_PROMISE};
use crate::lock::{have_write_lock, ContainerHeader};
use crate::shm_ptr::ShmPtr;
use crate::status::{Status, StoreResult};
use crate::sync::bitmap::{iter_bits, AtomicBitmap};
use crate::sync::Backoff;
use crate::thread_ctx::{debug_id, ThreadContext};
use crate::transaction::ContainerKind;

pub const PROMISE_PENDING: i32 = 0;
pub const PROMISE_FULFILLED: i32 = 1;
pub const PROMISE_REJECTED: i32 = 2;

/// Sentinel for "no staged state".
const STATE_UNSET: i32 = -1;

#[repr(C)]
pub struct ShmPromise {
    pub head: ContainerHeader, // TAG_PROMISE
    pub state: AtomicI32,
    pub value: AtomicUsize,
    pub new_state: AtomicI32,
    pub new_value: AtomicUsize,
    pub waiters: AtomicBitmap,
}

pub fn new_promise(thread: &ThreadContext) -> Result<ShmPtr, Status> {
    let size = std::mem::size_of::<ShmPromise>();
    let ptr = thread.alloc(size, debug_id::PROMISE)?;
    let promise: &ShmPromise = thread.region().deref(ptr).ok_or(Status::Failure)?;
    promise.head.init(TAG_PROMISE, size);
    promise.state.store(PROMISE_PENDING, Ordering::Release);
    promise.value.store(ShmPtr::EMPTY.0, Ordering::Release);
    promise.new_state.store(STATE_UNSET, Ordering::Release);
    promise.new_value.store(ShmPtr::EMPTY.0, Ordering::Release);
    promise.waiters.init();
    Ok(ptr)
}

/// Stage the one-shot transition. A promise that is already resolved (or
/// already staged) reports `Invalid`.
pub(crate) fn signal_op(
    thread: &ThreadContext,
    promise_ptr: ShmPtr,
    new_state: i32,
    value: ShmPtr,
) -> Result<(), Status> {
    if new_state != PROMISE_FULFILLED && new_state != PROMISE_REJECTED {
        return Err(Status::Invalid);
    }
    match thread.lock_write(promise_ptr, ContainerKind::Promise) {
        Status::Ok => {}
        s => return Err(s),
    }
    let promise: &ShmPromise = thread.region().deref(promise_ptr).ok_or(Status::Failure)?;
    if promise.state.load(Ordering::SeqCst) != PROMISE_PENDING
        || promise.new_state.load(Ordering::SeqCst) != STATE_UNSET
    {
        return Err(Status::Invalid);
    }
    promise.new_state.store(new_state, Ordering::SeqCst);
    promise.new_value.store(value.0, Ordering::SeqCst);
    Ok(())
}

pub(crate) fn get_state_op(thread: &ThreadContext, promise_ptr: ShmPtr) -> Result<i32, Status> {
    match thread.lock_read(promise_ptr, ContainerKind::Promise) {
        Status::Ok => {}
        s => return Err(s),
    }
    let promise: &ShmPromise = thread.region().deref(promise_ptr).ok_or(Status::Failure)?;
    let owner = have_write_lock(thread, &promise.head.lock);
    let staged = promise.new_state.load(Ordering::SeqCst);
    if owner && staged != STATE_UNSET {
        Ok(staged)
    } else {
        Ok(promise.state.load(Ordering::SeqCst))
    }
}

pub(crate) fn get_value_op(thread: &ThreadContext, promise_ptr: ShmPtr) -> Result<ShmPtr, Status> {
    match thread.lock_read(promise_ptr, ContainerKind::Promise) {
        Status::Ok => {}
        s => return Err(s),
    }
    let region = thread.region();
    let promise: &ShmPromise = region.deref(promise_ptr).ok_or(Status::Failure)?;
    let v = ShmPtr(promise.value.load(Ordering::SeqCst));
    block::acq(region, v);
    Ok(v)
}

pub(crate) fn commit_promise(thread: &ThreadContext, promise_ptr: ShmPtr) {
    let region = thread.region();
    let Some(promise) = region.deref::<ShmPromise>(promise_ptr) else {
        return;
    };
    let staged = promise.new_state.swap(STATE_UNSET, Ordering::SeqCst);
    if staged == STATE_UNSET {
        return;
    }
    let staged_value = ShmPtr(promise.new_value.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
    block::move_ptr(thread, &promise.value, staged_value);
    promise.state.store(staged, Ordering::SeqCst);

    // wake everyone parked in wait_op; they clear their own bits
    let waiters = promise.waiters.get();
    for i in iter_bits(waiters) {
        region.superblock().threads[i].ready.signal();
    }
}

pub(crate) fn rollback_promise(thread: &ThreadContext, promise_ptr: ShmPtr) {
    let Some(promise) = thread.region().deref::<ShmPromise>(promise_ptr) else {
        return;
    };
    if promise.new_state.swap(STATE_UNSET, Ordering::SeqCst) != STATE_UNSET {
        block::clear_ptr(thread, &promise.new_value);
    }
}

pub(crate) fn destroy_promise(thread: &ThreadContext, promise_ptr: ShmPtr) {
    let Some(promise) = thread.region().deref::<ShmPromise>(promise_ptr) else {
        return;
    };
    block::clear_ptr(thread, &promise.value);
    if promise.new_state.swap(STATE_UNSET, Ordering::SeqCst) != STATE_UNSET {
        block::clear_ptr(thread, &promise.new_value);
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A copyable handle to a promise in the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PromiseRef(pub ShmPtr);

impl PromiseRef {
    pub fn new(thread: &ThreadContext) -> StoreResult<PromiseRef> {
        thread.with_transaction(|t| new_promise(t).map(PromiseRef))
    }

    /// Resolve the promise; the caller's value reference moves in.
    pub fn signal_consume(
        &self,
        thread: &ThreadContext,
        state: i32,
        value: ShmPtr,
    ) -> StoreResult<()> {
        let ptr = self.0;
        thread.with_transaction(|t| signal_op(t, ptr, state, value))
    }

    pub fn fulfill_str(&self, thread: &ThreadContext, v: &str) -> StoreResult<()> {
        let value = thread.with_transaction(|t| crate::value::new_string(t, v))?;
        self.signal_consume(thread, PROMISE_FULFILLED, value)
    }

    pub fn reject_str(&self, thread: &ThreadContext, v: &str) -> StoreResult<()> {
        let value = thread.with_transaction(|t| crate::value::new_string(t, v))?;
        self.signal_consume(thread, PROMISE_REJECTED, value)
    }

    pub fn state(&self, thread: &ThreadContext) -> StoreResult<i32> {
        let ptr = self.0;
        thread.with_transaction(|t| get_state_op(t, ptr))
    }

    pub fn value_str(&self, thread: &ThreadContext) -> StoreResult<Option<String>> {
        let ptr = self.0;
        let v = thread.with_transaction(|t| get_value_op(t, ptr))?;
        let result = crate::value::get_string(thread.region(), v);
        block::release(thread, v);
        Ok(result)
    }

    /// Block until the promise resolves; returns the final state.
    ///
    /// Sets the caller's waiter bit, re-checks the state, and parks on the
    /// thread's ready event; the bit is always cleared on the way out.
    pub fn wait(&self, thread: &ThreadContext) -> StoreResult<i32> {
        let region = thread.region_arc();
        let promise: &ShmPromise = region
            .deref(self.0)
            .ok_or(crate::status::StoreError::Invalid)?;
        let mut backoff = Backoff::new();
        promise.waiters.set(thread.index());
        let result = loop {
            let state = self.state(thread)?;
            if state != PROMISE_PENDING {
                break state;
            }
            thread.slot().ready.wait(50);
            backoff.step();
        };
        promise.waiters.reset(thread.index());
        Ok(result)
    }
}
