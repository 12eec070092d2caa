// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Transaction manager.
//
// Modes order as None < Idle < Transient < Persistent; scopes nest on a
// private per-thread stack and the outermost start draws a fresh ticket.
// Every lock acquired through here is recorded in a singly-linked list of
// transaction elements in shared memory; the outermost commit (or abort)
// walks that list twice — once applying each container's commit or rollback
// handler, once unlocking — then unqueues, clears preemption and drops the
// thread back to Idle.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::block::{AbstractHeader, TAG_TRANSACTION_ELEMENT};
use crate::heap;
use crate::lock::{
    have_write_lock, lock_of, release_read_lock, release_write_lock, take_read_lock,
    take_write_lock, unqueue_from_lock,
};
use crate::shm_ptr::ShmPtr;
use crate::status::{Status, StoreError, StoreResult};
use crate::sync::Backoff;
use crate::thread_ctx::{debug_id, LockMode, ThreadContext, TxMode};

pub const ELEMENT_READ: i32 = 1;
pub const ELEMENT_WRITE: i32 = 2;

/// Container kind recorded per acquired lock; drives commit dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ContainerKind {
    None = 0,
    Cell = 1,
    List = 2,
    Queue = 3,
    Dict = 4,
    UnDict = 5,
    Promise = 6,
}

impl ContainerKind {
    fn from_i32(v: i32) -> ContainerKind {
        match v {
            1 => ContainerKind::Cell,
            2 => ContainerKind::List,
            3 => ContainerKind::Queue,
            4 => ContainerKind::Dict,
            5 => ContainerKind::UnDict,
            6 => ContainerKind::Promise,
            _ => ContainerKind::None,
        }
    }
}

/// One acquired lock, linked off the thread slot for the duration of the
/// transaction.
#[repr(C)]
pub struct TransactionElement {
    pub header: AbstractHeader, // TAG_TRANSACTION_ELEMENT
    pub owner: AtomicUsize,
    pub element_type: AtomicI32, // ELEMENT_READ / ELEMENT_WRITE
    pub container_kind: AtomicI32,
    pub container: AtomicUsize,
    pub next: AtomicUsize, // EMPTY terminates
}

impl ThreadContext {
    // -----------------------------------------------------------------------
    // Scope management
    // -----------------------------------------------------------------------

    /// Current effective mode: the maximum over the scope stack.
    pub fn transaction_mode(&self) -> TxMode {
        self.mode_stack
            .borrow()
            .iter()
            .map(|&(m, _)| m)
            .max()
            .unwrap_or(TxMode::Idle)
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_mode() >= TxMode::Transient
    }

    /// Open a transaction scope. The outermost start draws a fresh ticket
    /// and clears any stale preemption.
    pub fn start_transaction(&self, mode: TxMode, lock_mode: LockMode) {
        let slot = self.slot();
        let mut stack = self.mode_stack.borrow_mut();
        if stack.is_empty() {
            slot.last_start
                .store(self.region().next_ticket(), Ordering::SeqCst);
            slot.thread_preempted.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
            slot.test_finished.store(0, Ordering::SeqCst);
        }
        stack.push((mode, lock_mode));
        let effective = stack.iter().map(|&(m, _)| m).max().unwrap_or(TxMode::Idle);
        slot.transaction_mode.store(effective as i32, Ordering::SeqCst);
    }

    /// Close the current scope with commit semantics.
    pub fn commit_transaction(&self) {
        self.close_scope(false);
    }

    /// Close the current scope with rollback semantics.
    pub fn abort_transaction(&self) {
        self.close_scope(true);
    }

    fn close_scope(&self, rollback: bool) {
        let outermost = {
            let mut stack = self.mode_stack.borrow_mut();
            debug_assert!(!stack.is_empty(), "scope close without open scope");
            stack.pop();
            stack.is_empty()
        };
        if !outermost {
            let slot = self.slot();
            let effective = self
                .mode_stack
                .borrow()
                .iter()
                .map(|&(m, _)| m)
                .max()
                .unwrap_or(TxMode::Idle);
            slot.transaction_mode.store(effective as i32, Ordering::SeqCst);
            return;
        }
        self.end_transaction(rollback);
        self.finish_cycle();
    }

    /// Release everything but keep the scope stack and mode: the retry loop
    /// continues the same lexical transaction with a refreshed ticket.
    pub fn abort_retaining(&self) {
        self.times_aborted.set(self.times_aborted.get() + 1);
        self.end_transaction(true);
        self.unqueue_pending();
        self.signal_preemptor();
        let slot = self.slot();
        // every lock and reference is released: this is a grace-period
        // boundary for the reclaimer as much as a real transaction end
        slot.test_finished.store(0, Ordering::SeqCst);
        slot.last_start
            .store(self.region().next_ticket(), Ordering::SeqCst);
    }

    /// First pass (commit or rollback per container), second pass (unlock),
    /// then free the element list.
    fn end_transaction(&self, rollback: bool) {
        let region = self.region();
        let slot = self.slot();

        let head = ShmPtr(slot.current_transaction.load(Ordering::SeqCst));

        // pass 1: apply or roll back staged changes
        let mut cursor = head;
        while cursor.is_set() {
            let element: &TransactionElement = match region.deref(cursor) {
                Some(e) => e,
                None => break,
            };
            let container = ShmPtr(element.container.load(Ordering::SeqCst));
            let kind = ContainerKind::from_i32(element.container_kind.load(Ordering::SeqCst));
            if element.element_type.load(Ordering::SeqCst) == ELEMENT_WRITE {
                // only touch containers whose write lock we actually hold: a
                // registered-but-never-granted intent has nothing staged by
                // us, and another writer may be staging right now
                let held = lock_of(region, container)
                    .map(|l| have_write_lock(self, l))
                    .unwrap_or(false);
                if held {
                    dispatch_end(self, kind, container, rollback);
                }
            }
            cursor = ShmPtr(element.next.load(Ordering::SeqCst));
        }

        // pass 2: unlock, then free the elements
        let mut cursor = head;
        while cursor.is_set() {
            let element: &TransactionElement = match region.deref(cursor) {
                Some(e) => e,
                None => break,
            };
            let container = ShmPtr(element.container.load(Ordering::SeqCst));
            let next = ShmPtr(element.next.load(Ordering::SeqCst));
            if let Some(l) = lock_of(region, container) {
                if element.element_type.load(Ordering::SeqCst) == ELEMENT_WRITE {
                    if have_write_lock(self, l) {
                        release_write_lock(self, l);
                    }
                } else if l.reader_lock.check(self.index()) {
                    release_read_lock(self, l);
                }
            }
            heap::free_mem(region, cursor);
            cursor = next;
        }
        slot.current_transaction.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
        self.read_locks_taken.set(0);
        self.write_locks_taken.set(0);
    }

    /// Outermost-scope epilogue: unqueue, clear preemption, go idle.
    fn finish_cycle(&self) {
        self.unqueue_pending();
        self.signal_preemptor();
        let slot = self.slot();
        slot.transaction_mode.store(TxMode::Idle as i32, Ordering::SeqCst);
        slot.last_start.store(0, Ordering::SeqCst);
        slot.test_finished.store(0, Ordering::SeqCst);
    }

    fn unqueue_pending(&self) {
        let slot = self.slot();
        let pending = ShmPtr(slot.pending_lock.load(Ordering::SeqCst));
        if pending.is_set() {
            if let Some(l) = lock_of(self.region(), pending) {
                unqueue_from_lock(self, l);
            } else {
                slot.pending_lock.store(ShmPtr::EMPTY.0, Ordering::SeqCst);
            }
        }
    }

    /// Clear our preemption flag and wake the thread that set it: it is
    /// parked in WAIT_SIGNAL until our unwind finishes.
    fn signal_preemptor(&self) {
        let slot = self.slot();
        let preemptor = ShmPtr(slot.thread_preempted.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
        if preemptor.is_set() {
            if let Some(other) = self.region().thread_slot(preemptor) {
                other.ready.signal();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lock registration
    // -----------------------------------------------------------------------

    /// Acquire a read lock on `container` and record it.
    ///
    /// The element is registered before the acquisition attempt: whatever
    /// state the attempt leaves behind (a published reader bit waiting on a
    /// signal, a queued write intent), the unlock pass of the transaction
    /// end finds the container and cleans up exactly what is held.
    pub fn lock_read(&self, container: ShmPtr, kind: ContainerKind) -> Status {
        let region = self.region();
        let Some(l) = lock_of(region, container) else {
            return Status::Failure;
        };
        if have_write_lock(self, l) {
            return Status::Ok; // reads are covered by the write element
        }
        if !self.has_element(container, ELEMENT_READ) {
            let r = self.register_element(container, kind, ELEMENT_READ);
            if r != Status::Ok {
                return r;
            }
        }
        let r = take_read_lock(self, l);
        if r == Status::Ok {
            self.read_locks_taken.set(self.read_locks_taken.get() + 1);
        }
        r
    }

    /// Acquire the write lock on `container` and record it.
    pub fn lock_write(&self, container: ShmPtr, kind: ContainerKind) -> Status {
        let region = self.region();
        let Some(l) = lock_of(region, container) else {
            return Status::Failure;
        };
        if have_write_lock(self, l)
            && l.transaction_data.load(Ordering::SeqCst) == container.0
        {
            return Status::Ok;
        }
        if !self.has_element(container, ELEMENT_WRITE) {
            let r = self.register_element(container, kind, ELEMENT_WRITE);
            if r != Status::Ok {
                return r;
            }
        }
        let r = take_write_lock(self, l, container);
        if r == Status::Ok {
            l.transaction_data.store(container.0, Ordering::SeqCst);
            self.write_locks_taken.set(self.write_locks_taken.get() + 1);
        }
        r
    }

    /// True when this transaction already recorded `container` with the
    /// given element type.
    fn has_element(&self, container: ShmPtr, rw: i32) -> bool {
        let region = self.region();
        let mut cursor = ShmPtr(self.slot().current_transaction.load(Ordering::SeqCst));
        while cursor.is_set() {
            let Some(element) = region.deref::<TransactionElement>(cursor) else {
                return false;
            };
            if element.container.load(Ordering::SeqCst) == container.0
                && element.element_type.load(Ordering::SeqCst) == rw
            {
                return true;
            }
            cursor = ShmPtr(element.next.load(Ordering::SeqCst));
        }
        false
    }

    fn register_element(&self, container: ShmPtr, kind: ContainerKind, rw: i32) -> Status {
        let element_ptr = match self.alloc(
            std::mem::size_of::<TransactionElement>(),
            debug_id::TRANSACTION_ELEMENT,
        ) {
            Ok(p) => p,
            Err(s) => return s,
        };
        let slot = self.slot();
        let region = self.region();
        let Some(element) = region.deref::<TransactionElement>(element_ptr) else {
            return Status::Failure;
        };
        element
            .header
            .init(TAG_TRANSACTION_ELEMENT, std::mem::size_of::<TransactionElement>());
        element.owner.store(self.slot_ptr().0, Ordering::SeqCst);
        element.element_type.store(rw, Ordering::SeqCst);
        element.container_kind.store(kind as i32, Ordering::SeqCst);
        element.container.store(container.0, Ordering::SeqCst);
        element
            .next
            .store(slot.current_transaction.load(Ordering::SeqCst), Ordering::SeqCst);
        slot.current_transaction.store(element_ptr.0, Ordering::SeqCst);
        Status::Ok
    }

    // -----------------------------------------------------------------------
    // Caller-facing retry loops
    // -----------------------------------------------------------------------

    /// Run one container operation with the mandated retry discipline.
    ///
    /// Outside an explicit transaction the operation escalates to a
    /// transient scope, commits on success, and silently retries the abort
    /// family with a fresh ticket. Inside a persistent scope the abort
    /// family surfaces as `TransactionAborted` so the whole scope retries.
    pub fn with_transaction<T>(
        &self,
        mut f: impl FnMut(&ThreadContext) -> Result<T, Status>,
    ) -> StoreResult<T> {
        if self.in_transaction() {
            let mut backoff = Backoff::new();
            loop {
                match f(self) {
                    Ok(v) => return Ok(v),
                    Err(Status::Invalid) => return Err(StoreError::Invalid),
                    Err(s) if s.is_transient() => {
                        self.wait_round(s, &mut backoff);
                    }
                    Err(s) if s.is_abort() => return Err(StoreError::TransactionAborted),
                    Err(s) => panic!("irrecoverable status {s:?} in transaction"),
                }
            }
        }

        self.start_transaction(TxMode::Transient, LockMode::All);
        let mut backoff = Backoff::new();
        loop {
            match f(self) {
                Ok(v) => {
                    self.commit_transaction();
                    return Ok(v);
                }
                Err(Status::Invalid) => {
                    self.abort_transaction();
                    return Err(StoreError::Invalid);
                }
                Err(s) if s.is_transient() => {
                    self.wait_round(s, &mut backoff);
                }
                Err(s) if s.is_abort() => {
                    // transient transactions swallow preemption and retry
                    self.abort_retaining();
                    backoff.step();
                }
                Err(s) => {
                    self.abort_transaction();
                    panic!("irrecoverable status {s:?} in transient operation");
                }
            }
        }
    }

    /// Run a persistent multi-operation transaction, retrying the whole
    /// closure whenever an older transaction preempts it.
    pub fn run_transaction<T>(
        &self,
        mut f: impl FnMut(&ThreadContext) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.start_transaction(TxMode::Persistent, LockMode::All);
        let mut backoff = Backoff::new();
        loop {
            match f(self) {
                Ok(v) => {
                    self.commit_transaction();
                    return Ok(v);
                }
                Err(StoreError::TransactionAborted) => {
                    self.abort_retaining();
                    backoff.step();
                }
                Err(e) => {
                    self.abort_transaction();
                    return Err(e);
                }
            }
        }
    }

    fn wait_round(&self, s: Status, backoff: &mut Backoff) {
        match s {
            Status::WaitSignal => {
                // a specific thread promised to signal our ready event
                self.times_waiting.set(self.times_waiting.get() + 1);
                self.slot().ready.wait(5);
            }
            Status::Wait => {
                self.times_waiting.set(self.times_waiting.get() + 1);
                backoff.step();
            }
            _ => {
                self.times_repeated.set(self.times_repeated.get() + 1);
                backoff.step();
            }
        }
    }
}

/// Commit or roll back one container's staged changes.
fn dispatch_end(thread: &ThreadContext, kind: ContainerKind, container: ShmPtr, rollback: bool) {
    match kind {
        ContainerKind::Cell => {
            if rollback {
                crate::cell::rollback_cell(thread, container);
            } else {
                crate::cell::commit_cell(thread, container);
            }
        }
        ContainerKind::List => {
            if rollback {
                crate::list::rollback_list(thread, container);
            } else {
                crate::list::commit_list(thread, container);
            }
        }
        ContainerKind::Queue => {
            if rollback {
                crate::queue::rollback_queue(thread, container);
            } else {
                crate::queue::commit_queue(thread, container);
            }
        }
        ContainerKind::Dict => {
            if rollback {
                crate::dict::rollback_dict(thread, container);
            } else {
                crate::dict::commit_dict(thread, container);
            }
        }
        ContainerKind::UnDict => {
            if rollback {
                crate::undict::rollback_undict(thread, container);
            } else {
                crate::undict::commit_undict(thread, container);
            }
        }
        ContainerKind::Promise => {
            if rollback {
                crate::promise::rollback_promise(thread, container);
            } else {
                crate::promise::commit_promise(thread, container);
            }
        }
        ContainerKind::None => {}
    }
}

/// The teardown used by `lock::take_write_lock` callers that observed their
/// own preemption: everything is released but the mode survives for the
/// retry. Exposed for tests.
pub fn observe_preemption(thread: &ThreadContext) -> bool {
    thread.slot().is_preempted()
}
