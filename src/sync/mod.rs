// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process synchronisation primitives living inside the shared region:
// a manual-reset event, an uncontended-fast-path mutex, and the 64-bit
// thread bitmaps used by the container lock.

pub mod backoff;
pub mod bitmap;
pub mod event;
pub mod simple_lock;

pub use backoff::Backoff;
pub use bitmap::AtomicBitmap;
pub use event::ShmEvent;
pub use simple_lock::SimpleLock;
