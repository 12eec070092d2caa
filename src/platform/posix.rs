// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX implementation of the shared-memory and wait primitives.
// Each chunk of the region is its own named shm object; the region layer
// decides names and sizes, this module only maps and unmaps.

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::shm_name;

/// Open mode for a chunk backing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    /// Create exclusively — fail if already exists.
    Create,
    /// Open existing — fail if it does not exist.
    Open,
}

/// A single mapped shm object (the superblock or one data chunk).
pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    name: String, // POSIX name (with leading '/')
}

// Safety: the mapping is process-shared by design; all mutation inside it
// goes through atomics or region-level locks.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    /// Create or open a named shm object of `size` bytes and map it.
    pub fn acquire(name: &str, size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let perms: libc::mode_t = 0o660; // S_IRUSR|S_IWUSR|S_IRGRP|S_IWGRP

        let (fd, need_truncate) = match mode {
            ShmMode::Create => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, true)
            }
            ShmMode::Open => {
                let f =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, false)
            }
        };

        if need_truncate {
            let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::shm_unlink(c_name.as_ptr());
                    libc::close(fd);
                }
                return Err(err);
            }
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            if mode == ShmMode::Create {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            mem: mem as *mut u8,
            size,
            name: posix_name,
        })
    }

    /// Base address of the mapping.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// POSIX name (with leading '/').
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the backing object. Only the coordinator calls this; the
    /// mapping itself stays valid until `Drop`.
    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    /// Unlink a named shm object without an open handle.
    pub fn unlink_by_name(name: &str) {
        let posix_name = shm_name::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
    }
}

// ---------------------------------------------------------------------------
// Address waiting — futex on Linux, sleep-poll elsewhere
// ---------------------------------------------------------------------------

use std::sync::atomic::AtomicU32;

/// Block until `*addr != expected`, a wake arrives, or `timeout_ms` passes.
/// Spurious returns are allowed; every caller loops and re-checks.
#[cfg(target_os = "linux")]
pub fn wait_on_u32(addr: &AtomicU32, expected: u32, timeout_ms: u32) {
    let ts = libc::timespec {
        tv_sec: (timeout_ms / 1000) as libc::time_t,
        tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
    };
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            0usize,
            0usize,
        );
    }
    // ETIMEDOUT / EAGAIN / EINTR all mean "re-check the value".
}

/// Wake one waiter blocked in `wait_on_u32` on `addr`.
#[cfg(target_os = "linux")]
pub fn wake_one_u32(addr: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr.as_ptr(),
            libc::FUTEX_WAKE,
            1i32,
            0usize,
            0usize,
            0usize,
        );
    }
}

/// Sleep-poll fallback for unixes without a futex syscall: the callers'
/// re-check loops turn this into a 1 ms poll.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn wait_on_u32(addr: &AtomicU32, expected: u32, _timeout_ms: u32) {
    use std::sync::atomic::Ordering;
    if addr.load(Ordering::Acquire) == expected {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn wake_one_u32(_addr: &AtomicU32) {}

/// Monotonic cycle-counter style timestamp for diagnostics.
pub fn monotonic_ticks() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::time::Instant;
        use std::sync::OnceLock;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

/// Thread identifier unique within the process.
pub fn current_thread_id() -> i32 {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::syscall(libc::SYS_gettid) as i32
    }
    #[cfg(not(target_os = "linux"))]
    unsafe {
        libc::pthread_self() as usize as i32
    }
}
