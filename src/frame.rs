// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The physical frame allocator.
//!
//! A single free list threaded through the free frames themselves
//! manages one contiguous, page-aligned span of physical memory
//! that the kernel hands over at boot.  The span is reached
//! through the kernel direct map, so every frame has a stable
//! kernel-virtual alias for its entire lifetime; [`kva`] and
//! [`phys`] translate between the two views and refuse addresses
//! outside the managed span.
//!
//! Frames are handed out with undefined contents; callers that
//! need zeroed memory clear it themselves.  Freed frames are
//! filled with junk so that dangling references fail loudly.

use crate::mem::{self, P4KA, PAGE_SIZE};
use core::ptr::{self, NonNull};
use spin::Mutex;

/// Fill pattern written over freed frames.
const JUNK: u8 = 0xAA;

/// A free frame, viewed as a link in the free list.
struct FreeFrame {
    next: Option<NonNull<FreeFrame>>,
}

struct FrameList {
    head: Option<NonNull<FreeFrame>>,
    /// Kernel-virtual base of the managed span.
    base: *mut u8,
    /// Physical address of the first managed frame.
    phys_base: u64,
    /// Length of the span in bytes.
    len: usize,
    free: usize,
    outstanding: usize,
}

// The list is only ever reached through the global mutex.
unsafe impl Send for FrameList {}

static FRAMES: Mutex<FrameList> = Mutex::new(FrameList {
    head: None,
    base: ptr::null_mut(),
    phys_base: 0,
    len: 0,
    free: 0,
    outstanding: 0,
});

/// Hands the allocator its managed span: `len` bytes of physical
/// memory starting at physical address `phys_base`, reachable at
/// the kernel-virtual address `base`.  Called once at boot.
///
/// # Safety
/// The span must be page-aligned, unused, and must remain mapped
/// at `base` for the lifetime of the kernel.
pub unsafe fn init(base: NonNull<u8>, len: usize, phys_base: P4KA) {
    let addr = base.as_ptr() as usize;
    assert_eq!(addr % PAGE_SIZE, 0, "frame span misaligned");
    assert_eq!(len % PAGE_SIZE, 0, "frame span length misaligned");
    let phys_base = phys_base.phys_addr();
    assert!(mem::is_physical(phys_base + len as u64));

    let mut fl = FRAMES.lock();
    assert!(fl.len == 0, "frame allocator already initialized");
    fl.base = base.as_ptr();
    fl.phys_base = phys_base;
    fl.len = len;
    // Thread the list lowest-address-first.
    for off in (0..len).step_by(PAGE_SIZE).rev() {
        let frame = unsafe { base.as_ptr().add(off) }.cast::<FreeFrame>();
        unsafe { frame.write(FreeFrame { next: fl.head }) };
        fl.head = NonNull::new(frame);
        fl.free += 1;
    }
    log::info!("frame allocator: {} frames at {phys_base:#x}", fl.free);
}

/// Allocates one page-aligned frame, returning its kernel-virtual
/// address, or None if memory is exhausted.  Contents are
/// undefined.
pub fn alloc() -> Option<NonNull<u8>> {
    let mut fl = FRAMES.lock();
    let frame = fl.head?;
    fl.head = unsafe { frame.as_ref().next };
    fl.free -= 1;
    fl.outstanding += 1;
    Some(frame.cast())
}

/// Returns a frame to the free list.
///
/// # Safety
/// `frame` must have come from [`alloc`] and must not be referenced
/// again.
pub unsafe fn free(frame: NonNull<u8>) {
    let mut fl = FRAMES.lock();
    let addr = frame.as_ptr() as usize;
    let base = fl.base as usize;
    assert_eq!(addr % PAGE_SIZE, 0, "free of unaligned frame");
    assert!(
        addr >= base && addr - base < fl.len,
        "free of foreign frame {addr:#x}"
    );
    unsafe { ptr::write_bytes(frame.as_ptr(), JUNK, PAGE_SIZE) };
    let link = frame.cast::<FreeFrame>();
    unsafe { link.as_ptr().write(FreeFrame { next: fl.head }) };
    fl.head = Some(link);
    fl.free += 1;
    fl.outstanding -= 1;
}

/// Returns the number of frames currently on the free list.
pub fn free_count() -> usize {
    FRAMES.lock().free
}

/// Returns the number of frames currently allocated.
pub fn outstanding() -> usize {
    FRAMES.lock().outstanding
}

/// Returns the physical base and byte length of the managed span.
pub fn managed_phys_range() -> (u64, usize) {
    let fl = FRAMES.lock();
    assert!(fl.len != 0, "frame allocator not initialized");
    (fl.phys_base, fl.len)
}

/// Translates a physical address inside the managed span to its
/// kernel-virtual alias.  Panics on addresses outside the span: a
/// caller holding such an address is confused about frame
/// ownership.
pub fn kva(pa: u64) -> NonNull<u8> {
    let fl = FRAMES.lock();
    assert!(
        pa >= fl.phys_base && pa - fl.phys_base < fl.len as u64,
        "kva: physical address {pa:#x} outside managed span"
    );
    let off = (pa - fl.phys_base) as usize;
    unsafe { NonNull::new_unchecked(fl.base.add(off)) }
}

/// Translates a kernel-virtual frame alias back to its physical
/// address.
pub fn phys(p: NonNull<u8>) -> u64 {
    let fl = FRAMES.lock();
    let addr = p.as_ptr() as usize;
    let base = fl.base as usize;
    assert!(
        addr >= base && addr - base < fl.len,
        "phys: pointer {addr:#x} outside managed span"
    );
    fl.phys_base + (addr - base) as u64
}

/// Translates a kernel-virtual frame alias to its physical page
/// number.
pub fn ppn(p: NonNull<u8>) -> u64 {
    phys(p) >> mem::PAGE_SHIFT
}

/// Returns the kernel-virtual alias of the frame with the given
/// physical page number.
pub fn ppn_kva(ppn: u64) -> NonNull<u8> {
    kva(ppn << mem::PAGE_SHIFT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testenv;

    #[test]
    fn alloc_free_round_trip() {
        let _env = testenv::lock();
        let before = free_count();
        let out_before = outstanding();
        let a = alloc().unwrap();
        let b = alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(free_count(), before - 2);
        assert_eq!(outstanding(), out_before + 2);
        unsafe {
            free(b);
            free(a);
        }
        assert_eq!(free_count(), before);
        assert_eq!(outstanding(), out_before);
    }

    #[test]
    fn translation_round_trip() {
        let _env = testenv::lock();
        let a = alloc().unwrap();
        let pa = phys(a);
        assert_eq!(pa % PAGE_SIZE as u64, 0);
        assert_eq!(kva(pa), a);
        assert_eq!(ppn_kva(ppn(a)), a);
        unsafe { free(a) };
    }

    #[test]
    fn freed_frames_are_junk_filled() {
        let _env = testenv::lock();
        let a = alloc().unwrap();
        unsafe {
            ptr::write_bytes(a.as_ptr(), 0, PAGE_SIZE);
            free(a);
            // The link occupies the first bytes; the tail of the
            // frame must carry the junk pattern.
            let tail = a.as_ptr().add(PAGE_SIZE - 1).read();
            assert_eq!(tail, JUNK);
        }
    }
}
