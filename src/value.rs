// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Immutable refcounted values: bool, integer, float, UCS-4 string, bytes,
// and tuples of fat pointers. Values are never locked; sharing is safe
// because nothing mutates them after publication.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::block::{
    self, RefHeader, TAG_BOOL, TAG_BYTES, TAG_FLOAT, TAG_INT, TAG_STRING, TAG_TUPLE,
};
use crate::region::Region;
use crate::shm_ptr::ShmPtr;
use crate::status::Status;
use crate::thread_ctx::{debug_id, ThreadContext};

/// Header bytes before a value payload, padded so pointer-sized payloads
/// (tuple slots) stay aligned.
pub const VALUE_HEADER_SIZE: usize = (std::mem::size_of::<RefHeader>() + 7) & !7;

/// Payload length in bytes of the value at `ptr`.
pub fn value_len(region: &Region, ptr: ShmPtr) -> Option<usize> {
    let header: &RefHeader = region.deref(ptr)?;
    let total = header.size.load(Ordering::Acquire) as usize;
    Some(total - VALUE_HEADER_SIZE)
}

fn payload_ptr(region: &Region, ptr: ShmPtr) -> Option<*mut u8> {
    region.translate(ptr.shift(VALUE_HEADER_SIZE))
}

/// Allocate a value block with `payload` raw bytes. The new block starts
/// with one reference owned by the caller.
pub fn new_value(thread: &ThreadContext, tag: u32, payload: &[u8]) -> Result<ShmPtr, Status> {
    let total = VALUE_HEADER_SIZE + payload.len();
    let ptr = thread.alloc(total, debug_id::VALUE)?;
    let region = thread.region();
    let header: &RefHeader = region.deref(ptr).ok_or(Status::Failure)?;
    header.init(tag, total);
    if !payload.is_empty() {
        let dst = payload_ptr(region, ptr).ok_or(Status::Failure)?;
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, payload.len());
        }
    }
    Ok(ptr)
}

pub fn new_bool(thread: &ThreadContext, v: bool) -> Result<ShmPtr, Status> {
    new_value(thread, TAG_BOOL, &(v as i32).to_ne_bytes())
}

pub fn new_int(thread: &ThreadContext, v: i64) -> Result<ShmPtr, Status> {
    new_value(thread, TAG_INT, &v.to_ne_bytes())
}

pub fn new_float(thread: &ThreadContext, v: f64) -> Result<ShmPtr, Status> {
    new_value(thread, TAG_FLOAT, &v.to_ne_bytes())
}

pub fn new_bytes(thread: &ThreadContext, v: &[u8]) -> Result<ShmPtr, Status> {
    new_value(thread, TAG_BYTES, v)
}

pub fn get_bool(region: &Region, ptr: ShmPtr) -> Option<bool> {
    expect_tag(region, ptr, TAG_BOOL)?;
    let raw = payload_ptr(region, ptr)?;
    Some(unsafe { (raw as *const i32).read_unaligned() } != 0)
}

pub fn get_int(region: &Region, ptr: ShmPtr) -> Option<i64> {
    expect_tag(region, ptr, TAG_INT)?;
    let raw = payload_ptr(region, ptr)?;
    Some(unsafe { (raw as *const i64).read_unaligned() })
}

pub fn get_float(region: &Region, ptr: ShmPtr) -> Option<f64> {
    expect_tag(region, ptr, TAG_FLOAT)?;
    let raw = payload_ptr(region, ptr)?;
    Some(unsafe { (raw as *const f64).read_unaligned() })
}

pub fn get_bytes(region: &Region, ptr: ShmPtr) -> Option<Vec<u8>> {
    expect_tag(region, ptr, TAG_BYTES)?;
    let len = value_len(region, ptr)?;
    let raw = payload_ptr(region, ptr)?;
    Some(unsafe { std::slice::from_raw_parts(raw, len) }.to_vec())
}

fn expect_tag(region: &Region, ptr: ShmPtr, tag: u32) -> Option<()> {
    let header: &RefHeader = region.deref(ptr)?;
    if header.tag() & !block::RELEASE_MARK == tag {
        Some(())
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// UCS-4 strings
// ---------------------------------------------------------------------------

/// Intern a Rust string as a UCS-4 value; the canonical key type of both
/// dictionaries.
pub fn new_string(thread: &ThreadContext, s: &str) -> Result<ShmPtr, Status> {
    let codepoints: Vec<u32> = s.chars().map(|c| c as u32).collect();
    let bytes = unsafe {
        std::slice::from_raw_parts(codepoints.as_ptr() as *const u8, codepoints.len() * 4)
    };
    let total = VALUE_HEADER_SIZE + bytes.len();
    let ptr = thread.alloc(total, debug_id::STRING)?;
    let region = thread.region();
    let header: &RefHeader = region.deref(ptr).ok_or(Status::Failure)?;
    header.init(TAG_STRING, total);
    if !bytes.is_empty() {
        let dst = payload_ptr(region, ptr).ok_or(Status::Failure)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }
    Ok(ptr)
}

/// Code points of the string value at `ptr`.
pub fn string_codepoints(region: &Region, ptr: ShmPtr) -> Option<&[u32]> {
    expect_tag(region, ptr, TAG_STRING)?;
    let len = value_len(region, ptr)? / 4;
    let raw = payload_ptr(region, ptr)?;
    Some(unsafe { std::slice::from_raw_parts(raw as *const u32, len) })
}

pub fn get_string(region: &Region, ptr: ShmPtr) -> Option<String> {
    let cps = string_codepoints(region, ptr)?;
    Some(cps.iter().filter_map(|&c| char::from_u32(c)).collect())
}

/// FNV-1a over the UCS-4 code-point sequence; the hash used by both
/// dictionaries. Never returns 0 or 1 (reserved bucket states).
pub fn hash_codepoints(cps: &[u32]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &c in cps {
        for b in c.to_le_bytes() {
            hash ^= b as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
    }
    if hash <= 1 {
        hash = 2;
    }
    hash
}

pub fn hash_str(s: &str) -> u32 {
    let cps: Vec<u32> = s.chars().map(|c| c as u32).collect();
    hash_codepoints(&cps)
}

/// Compare a stored string value with a Rust string.
pub fn string_eq_str(region: &Region, ptr: ShmPtr, s: &str) -> bool {
    match string_codepoints(region, ptr) {
        Some(cps) => {
            cps.len() == s.chars().count()
                && cps.iter().zip(s.chars()).all(|(&c, ch)| c == ch as u32)
        }
        None => false,
    }
}

/// Compare two stored string values.
pub fn string_eq(region: &Region, a: ShmPtr, b: ShmPtr) -> bool {
    if a == b {
        return true;
    }
    match (string_codepoints(region, a), string_codepoints(region, b)) {
        (Some(ca), Some(cb)) => ca == cb,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tuples
// ---------------------------------------------------------------------------

/// Allocate a tuple over `items`, taking one reference to each item.
pub fn new_tuple(thread: &ThreadContext, items: &[ShmPtr]) -> Result<ShmPtr, Status> {
    let total = VALUE_HEADER_SIZE + items.len() * std::mem::size_of::<usize>();
    let ptr = thread.alloc(total, debug_id::VALUE)?;
    let region = thread.region();
    let header: &RefHeader = region.deref(ptr).ok_or(Status::Failure)?;
    header.init(TAG_TUPLE, total);
    let slots = tuple_slots(region, ptr).ok_or(Status::Failure)?;
    for (slot, &item) in slots.iter().zip(items) {
        block::acq_store(region, slot, item);
    }
    Ok(ptr)
}

pub fn tuple_len(region: &Region, ptr: ShmPtr) -> Option<usize> {
    expect_tag(region, ptr, TAG_TUPLE)?;
    Some(value_len(region, ptr)? / std::mem::size_of::<usize>())
}

fn tuple_slots(region: &Region, ptr: ShmPtr) -> Option<&[AtomicUsize]> {
    let len = value_len(region, ptr)? / std::mem::size_of::<usize>();
    let raw = payload_ptr(region, ptr)?;
    Some(unsafe { std::slice::from_raw_parts(raw as *const AtomicUsize, len) })
}

pub fn tuple_get(region: &Region, ptr: ShmPtr, index: usize) -> Option<ShmPtr> {
    expect_tag(region, ptr, TAG_TUPLE)?;
    let slots = tuple_slots(region, ptr)?;
    slots.get(index).map(|s| ShmPtr(s.load(Ordering::SeqCst)))
}

pub(crate) fn destroy_tuple(thread: &ThreadContext, ptr: ShmPtr) {
    let region = thread.region();
    if let Some(slots) = tuple_slots(region, ptr) {
        for slot in slots {
            let item = ShmPtr(slot.swap(ShmPtr::EMPTY.0, Ordering::SeqCst));
            block::release(thread, item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_avoids_reserved_values() {
        // empty input hashes to the FNV offset basis, never 0 or 1
        assert!(hash_codepoints(&[]) > 1);
        assert!(hash_str("") > 1);
        assert_ne!(hash_str("a"), hash_str("b"));
    }

    #[test]
    fn hash_is_order_sensitive() {
        assert_ne!(hash_str("ab"), hash_str("ba"));
    }
}
