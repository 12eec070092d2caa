// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Result codes shared by every core operation. Core functions never unwind;
// they report one of these and the caller-facing retry loop in
// transaction.rs translates them into the public API contract.

/// Outcome of a core operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    /// Logically invalid input: out-of-range index, missing key.
    Invalid = 0,
    Ok = 1,
    /// Block briefly, then retry.
    Wait = 3,
    /// A specific other thread has promised to signal our `ready` event.
    WaitSignal = 4,
    /// Fatal for this transaction; a retry with a fresh ticket is allowed.
    Abort = 5,
    /// A higher-priority transaction forced this one to abort.
    Preempted = 6,
    /// Transient inconsistency observed; retry immediately.
    Repeat = 7,
    /// Irrecoverable: out of region or a broken invariant.
    Failure = 16,
}

impl Status {
    /// True for the abort family: the current transaction cannot continue.
    #[inline]
    pub fn is_abort(self) -> bool {
        matches!(self, Status::Abort | Status::Preempted)
    }

    /// True for outcomes that are resolved by retrying the same attempt
    /// without abandoning held locks.
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(self, Status::Wait | Status::WaitSignal | Status::Repeat)
    }
}

/// Error surfaced by the public container API.
#[derive(Debug)]
pub enum StoreError {
    /// Out-of-range index or missing key.
    Invalid,
    /// A persistent transaction was preempted by an older one; the whole
    /// transaction scope must be retried.
    TransactionAborted,
    /// The fixed chunk budget of the region is exhausted.
    OutOfRegion,
    /// Platform-level failure while creating or attaching the region.
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Invalid => write!(f, "invalid argument or missing key"),
            StoreError::TransactionAborted => write!(f, "transaction aborted by an older transaction"),
            StoreError::OutOfRegion => write!(f, "shared region chunk budget exhausted"),
            StoreError::Io(e) => write!(f, "region i/o error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
