// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Windows implementation of the shared-memory and wait primitives.
// Chunks are named file mappings backed by the page file. Waits use a named
// kernel event per region: unlike a futex there is no address-keyed wait
// that crosses processes, so wake-ups are funneled through one event and
// the callers' re-check loops sort out who actually made progress.

use std::io;
use std::ptr;
use std::sync::atomic::AtomicU32;
use std::sync::{Mutex, OnceLock};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_ALL_ACCESS, PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, GetCurrentThreadId, SetEvent, WaitForSingleObject,
};

/// Open mode for a chunk backing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// A single mapped file-mapping object (the superblock or one data chunk).
pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    handle: HANDLE,
    name: String,
}

unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    pub fn acquire(name: &str, size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let wname = to_wide(&format!("Local\\{name}"));
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE, // page-file backed
                ptr::null(),
                PAGE_READWRITE,
                (size as u64 >> 32) as u32,
                size as u32,
                wname.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        let already = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;
        match mode {
            ShmMode::Create if already => {
                unsafe { CloseHandle(handle) };
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, "shm exists"));
            }
            ShmMode::Open if !already => {
                unsafe { CloseHandle(handle) };
                return Err(io::Error::new(io::ErrorKind::NotFound, "shm not found"));
            }
            _ => {}
        }

        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(err);
        }

        Ok(Self {
            mem: view.Value as *mut u8,
            size,
            handle,
            name: name.to_string(),
        })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel objects disappear with their last handle; nothing to do here.
    pub fn unlink(&self) {}

    pub fn unlink_by_name(_name: &str) {}
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        unsafe {
            if !self.mem.is_null() {
                UnmapViewOfFile(windows_sys::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS {
                    Value: self.mem as _,
                });
            }
            if !self.handle.is_null() {
                CloseHandle(self.handle);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Region-wide named wake event
// ---------------------------------------------------------------------------

static WAKE_EVENT: OnceLock<Mutex<Option<OwnedEvent>>> = OnceLock::new();

struct OwnedEvent(HANDLE);
unsafe impl Send for OwnedEvent {}

fn wake_event() -> &'static Mutex<Option<OwnedEvent>> {
    WAKE_EVENT.get_or_init(|| Mutex::new(None))
}

/// Bind this process to the region's named wake event. Called once per
/// process by the region layer with the region id.
pub fn bind_region_events(region_id: &str) -> io::Result<()> {
    let wname = to_wide(&format!("Local\\{region_id}_wake"));
    // Auto-reset event: each SetEvent releases one waiter.
    let h = unsafe { CreateEventW(ptr::null(), 0, 0, wname.as_ptr()) };
    if h.is_null() {
        return Err(io::Error::last_os_error());
    }
    *wake_event().lock().unwrap() = Some(OwnedEvent(h));
    Ok(())
}

/// Block until a wake or `timeout_ms` passes, then let the caller re-check
/// `*addr`. Spurious returns are allowed by the contract.
pub fn wait_on_u32(addr: &AtomicU32, expected: u32, timeout_ms: u32) {
    use std::sync::atomic::Ordering;
    if addr.load(Ordering::Acquire) != expected {
        return;
    }
    let guard = wake_event().lock().unwrap();
    match guard.as_ref() {
        Some(ev) => {
            let h = ev.0;
            drop(guard);
            unsafe { WaitForSingleObject(h, timeout_ms.max(1)) };
        }
        None => {
            drop(guard);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

pub fn wake_one_u32(_addr: &AtomicU32) {
    if let Some(ev) = wake_event().lock().unwrap().as_ref() {
        unsafe { SetEvent(ev.0) };
    }
}

pub fn current_thread_id() -> i32 {
    unsafe { GetCurrentThreadId() as i32 }
}

/// Monotonic cycle-counter style timestamp for diagnostics.
pub fn monotonic_ticks() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::sync::OnceLock;
        use std::time::Instant;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}
