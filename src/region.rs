// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Region and chunk manager.
//
// A region is one superblock object plus up to MAX_CHUNKS data chunks, each
// a separate named shm object of CHUNK_SIZE bytes. The superblock holds the
// region-global state: the ticket counter, the chunk table, the thread
// slots, the superheap and the reclaimer coordination fields. Fat pointers
// address the superblock through the reserved chunk index; data chunks are
// numbered from zero and mapped lazily by every attached process.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::heap::ShmHeap;
use crate::platform::{PlatformShm, ShmMode};
use crate::shm_name;
use crate::shm_ptr::{ShmPtr, SUPERBLOCK_CHUNK};
use crate::status::Status;
use crate::sync::bitmap::MAX_THREADS;
use crate::sync::{ShmEvent, SimpleLock};
use crate::thread_ctx::ThreadSlot;

/// Fixed size of every chunk, superblock included.
pub const CHUNK_SIZE: usize = 1 << 20;
/// Fixed budget of data chunks per region.
pub const MAX_CHUNKS: usize = 2048;

pub const CHUNK_TYPE_SUPER: u32 = 0xB10C_0000;
pub const CHUNK_TYPE_ROOT: u32 = 0xB10C_0001;
pub const CHUNK_TYPE_SECTOR: u32 = 0xB10C_0002;
pub const CHUNK_TYPE_SECTOR_FLEX: u32 = 0xB10C_0004;

/// Header at offset 0 of every chunk.
#[repr(C)]
pub struct ChunkHeader {
    pub type_tag: AtomicU32,
    /// Used-byte cursor for generic chunks; sectors manage their own space.
    pub used: AtomicI32,
}

/// Region-global shared state, at the start of the superblock mapping.
#[repr(C)]
pub struct Superblock {
    pub header: ChunkHeader, // CHUNK_TYPE_SUPER
    pub coordinator_pid: AtomicU32,
    /// Serializes chunk allocation; nested only under a heap lock.
    pub lock: SimpleLock,
    pub ticket: AtomicU32,
    pub chunk_count: AtomicI32,
    /// 1 when the chunk with that index is allocated.
    pub chunk_states: [AtomicI32; MAX_CHUNKS],
    pub has_garbage: AtomicI32,
    pub stop_reclaimer: AtomicI32,
    pub halt: AtomicI32,
    pub reclaimer_taken: AtomicI32,
    pub has_garbage_event: ShmEvent,
    /// Global dictionary visible to every worker; NONE until first use.
    pub root_container: AtomicUsize,
    /// Grace-period snapshot of busy threads, reclaimer-private.
    pub grace_count: AtomicI32,
    pub grace_threads: [AtomicUsize; MAX_THREADS],
    /// Region-wide count of write locks currently held.
    pub locks_held: AtomicI32,
    pub threads: [ThreadSlot; MAX_THREADS],
    pub heaps: [ShmHeap; MAX_THREADS],
}

const _: () = assert!(std::mem::size_of::<Superblock>() <= CHUNK_SIZE);

/// One attached process's view of a region.
pub struct Region {
    id: String,
    superblock_map: PlatformShm,
    chunk_maps: Vec<AtomicPtr<u8>>,
    chunk_handles: Mutex<Vec<Option<PlatformShm>>>,
    is_coordinator: AtomicBool,
    pub(crate) reclaimer: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Region {
    /// Create a fresh region and become its coordinator. Starts the
    /// reclaimer thread.
    pub fn create() -> io::Result<Arc<Region>> {
        let (id, superblock_map) = loop {
            let id = shm_name::make_region_id();
            match PlatformShm::acquire(&id, CHUNK_SIZE, ShmMode::Create) {
                Ok(map) => break (id, map),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        };

        let region = Arc::new(Region {
            id,
            superblock_map,
            chunk_maps: (0..MAX_CHUNKS).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect(),
            chunk_handles: Mutex::new((0..MAX_CHUNKS).map(|_| None).collect()),
            is_coordinator: AtomicBool::new(true),
            reclaimer: Mutex::new(None),
        });

        #[cfg(windows)]
        crate::platform::windows::bind_region_events(&region.id)?;

        let sb = region.superblock();
        sb.lock.init();
        sb.ticket.store(0, Ordering::Release);
        sb.chunk_count.store(0, Ordering::Release);
        sb.has_garbage_event.init();
        sb.root_container.store(ShmPtr::NONE.0, Ordering::Release);
        for i in 0..MAX_THREADS {
            sb.threads[i].init(i);
            sb.heaps[i].init(i);
            sb.grace_threads[i].store(ShmPtr::EMPTY.0, Ordering::Release);
        }
        sb.coordinator_pid.store(std::process::id(), Ordering::Release);
        // publish the magic last: attachers spin on it
        sb.header.used.store(std::mem::size_of::<Superblock>() as i32, Ordering::Release);
        sb.header.type_tag.store(CHUNK_TYPE_SUPER, Ordering::Release);

        crate::reclaimer::start(&region);
        Ok(region)
    }

    /// Attach to an existing region by name.
    pub fn attach(name: &str) -> io::Result<Arc<Region>> {
        let superblock_map = PlatformShm::acquire(name, CHUNK_SIZE, ShmMode::Open)?;
        let region = Arc::new(Region {
            id: name.to_string(),
            superblock_map,
            chunk_maps: (0..MAX_CHUNKS).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect(),
            chunk_handles: Mutex::new((0..MAX_CHUNKS).map(|_| None).collect()),
            is_coordinator: AtomicBool::new(false),
            reclaimer: Mutex::new(None),
        });

        if region.superblock().header.type_tag.load(Ordering::Acquire) != CHUNK_TYPE_SUPER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "superblock magic mismatch",
            ));
        }

        #[cfg(windows)]
        crate::platform::windows::bind_region_events(&region.id)?;

        Ok(region)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_coordinator(&self) -> bool {
        self.is_coordinator.load(Ordering::Acquire)
    }

    pub fn superblock(&self) -> &Superblock {
        unsafe { &*(self.superblock_map.as_mut_ptr() as *const Superblock) }
    }

    /// Draw a fresh ticket; zero is skipped because it encodes "idle".
    pub fn next_ticket(&self) -> u32 {
        loop {
            let t = self
                .superblock()
                .ticket
                .fetch_add(1, Ordering::SeqCst)
                .wrapping_add(1);
            if t != 0 {
                return t;
            }
        }
    }

    /// Translate a fat pointer into this process's address space, mapping
    /// the chunk on first touch.
    pub fn translate(&self, ptr: ShmPtr) -> Option<*mut u8> {
        if !ptr.is_set() {
            return None;
        }
        let chunk = ptr.chunk();
        if chunk == SUPERBLOCK_CHUNK {
            if ptr.offset() >= CHUNK_SIZE {
                return None;
            }
            return Some(unsafe { self.superblock_map.as_mut_ptr().add(ptr.offset()) });
        }
        if chunk >= MAX_CHUNKS {
            return None;
        }
        let mut base = self.chunk_maps[chunk].load(Ordering::Acquire);
        if base.is_null() {
            base = self.map_chunk(chunk)?;
        }
        Some(unsafe { base.add(ptr.offset()) })
    }

    fn map_chunk(&self, chunk: usize) -> Option<*mut u8> {
        let mut handles = self.chunk_handles.lock().unwrap();
        let existing = self.chunk_maps[chunk].load(Ordering::Acquire);
        if !existing.is_null() {
            return Some(existing);
        }
        if self.superblock().chunk_states[chunk].load(Ordering::Acquire) != 1 {
            return None;
        }
        let name = shm_name::chunk_object_name(&self.id, chunk);
        let map = PlatformShm::acquire(&name, CHUNK_SIZE, ShmMode::Open).ok()?;
        let base = map.as_mut_ptr();
        handles[chunk] = Some(map);
        self.chunk_maps[chunk].store(base, Ordering::Release);
        Some(base)
    }

    /// View the block at `ptr` as a `T`. The caller promises `ptr` actually
    /// names a `T`-shaped block; out-of-bounds pointers return None.
    pub fn deref<T>(&self, ptr: ShmPtr) -> Option<&T> {
        if ptr.offset() + std::mem::size_of::<T>() > CHUNK_SIZE {
            return None;
        }
        let raw = self.translate(ptr)?;
        debug_assert_eq!(raw as usize % std::mem::align_of::<T>(), 0);
        Some(unsafe { &*(raw as *const T) })
    }

    /// Mutable variant of `deref`, for one-time in-place initialisation.
    #[allow(clippy::mut_from_ref)]
    pub fn deref_mut<T>(&self, ptr: ShmPtr) -> Option<&mut T> {
        if ptr.offset() + std::mem::size_of::<T>() > CHUNK_SIZE {
            return None;
        }
        let raw = self.translate(ptr)?;
        debug_assert_eq!(raw as usize % std::mem::align_of::<T>(), 0);
        Some(unsafe { &mut *(raw as *mut T) })
    }

    /// Fat pointer for an address inside the superblock mapping.
    pub fn superblock_ptr(&self, addr: *const u8) -> ShmPtr {
        let base = self.superblock_map.as_mut_ptr() as usize;
        let offset = addr as usize - base;
        debug_assert!(offset < CHUNK_SIZE);
        ShmPtr::pack(SUPERBLOCK_CHUNK, offset)
    }

    /// The thread slot a fat pointer refers to, if it points into the
    /// superblock's slot table.
    pub fn thread_slot(&self, ptr: ShmPtr) -> Option<&ThreadSlot> {
        if !ptr.is_set() || ptr.chunk() != SUPERBLOCK_CHUNK {
            return None;
        }
        let sb = self.superblock();
        let base = self.superblock_map.as_mut_ptr() as usize;
        let first = &sb.threads[0] as *const ThreadSlot as usize - base;
        let stride = std::mem::size_of::<ThreadSlot>();
        let off = ptr.offset();
        if off < first || (off - first) % stride != 0 {
            return None;
        }
        let index = (off - first) / stride;
        if index >= MAX_THREADS {
            return None;
        }
        Some(&sb.threads[index])
    }

    /// Allocate and map a fresh chunk, serialized by the superblock lock.
    /// `Failure` when the fixed chunk budget is exhausted — a hard stop.
    pub fn alloc_chunk(&self, type_tag: u32) -> Result<usize, Status> {
        let sb = self.superblock();
        sb.lock.acquire();
        let result = self.alloc_chunk_locked(type_tag);
        sb.lock.release();
        result
    }

    fn alloc_chunk_locked(&self, type_tag: u32) -> Result<usize, Status> {
        let sb = self.superblock();
        let index = sb.chunk_count.load(Ordering::Acquire) as usize;
        if index >= MAX_CHUNKS {
            return Err(Status::Failure); // out of region
        }
        let name = shm_name::chunk_object_name(&self.id, index);
        let map = match PlatformShm::acquire(&name, CHUNK_SIZE, ShmMode::Create) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // stale object from a dead region with a recycled name
                PlatformShm::unlink_by_name(&name);
                PlatformShm::acquire(&name, CHUNK_SIZE, ShmMode::Create)
                    .map_err(|_| Status::Failure)?
            }
            Err(e) => {
                eprintln!("DEBUG alloc_chunk_locked acquire failed: {:?}", e);
                return Err(Status::Failure);
            }
        };

        let base = map.as_mut_ptr();
        {
            let header = unsafe { &*(base as *const ChunkHeader) };
            header.used.store(std::mem::size_of::<ChunkHeader>() as i32, Ordering::Release);
            header.type_tag.store(type_tag, Ordering::Release);
        }
        self.chunk_handles.lock().unwrap()[index] = Some(map);
        self.chunk_maps[index].store(base, Ordering::Release);
        sb.chunk_states[index].store(1, Ordering::Release);
        sb.chunk_count.store(index as i32 + 1, Ordering::Release);
        Ok(index)
    }

    /// Unmap everything; the coordinator additionally unlinks the backing
    /// objects and stops the reclaimer.
    pub fn release(&self) {
        if self.is_coordinator() {
            crate::reclaimer::stop(self);
            let count = self.superblock().chunk_count.load(Ordering::Acquire) as usize;
            for index in 0..count.min(MAX_CHUNKS) {
                PlatformShm::unlink_by_name(&shm_name::chunk_object_name(&self.id, index));
            }
            self.superblock_map.unlink();
            self.is_coordinator.store(false, Ordering::Release);
        }
        self.chunk_handles.lock().unwrap().iter_mut().for_each(|h| {
            *h = None;
        });
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.release();
    }
}
