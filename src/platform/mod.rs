// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

#[cfg(unix)]
pub mod posix;

#[cfg(windows)]
pub mod windows;

// Re-export the platform-specific implementations under a uniform name.

#[cfg(unix)]
pub use posix::{current_thread_id, monotonic_ticks, wait_on_u32, wake_one_u32, PlatformShm, ShmMode};

#[cfg(windows)]
pub use windows::{
    current_thread_id, monotonic_ticks, wait_on_u32, wake_one_u32, PlatformShm, ShmMode,
};
