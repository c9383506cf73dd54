// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stub out things that are not ordinarily available in tests:
//! physical memory and the boot-time kernel tables.
//!
//! The frame allocator and the kernel root are global, exactly as
//! they are in the running kernel, so tests that touch them share
//! one static arena and serialize on a single lock.

use crate::frame;
use crate::mem::{P4KA, MIB};
use crate::mmu;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use spin::Once;
use std::sync::{Mutex, MutexGuard};

const ARENA_SIZE: usize = 4 * MIB;

/// The page-aligned span of "physical" memory tests allocate
/// from, standing in for the range the kernel hands over at boot.
#[repr(C, align(4096))]
struct Arena(UnsafeCell<[u8; ARENA_SIZE]>);

// Tests only reach the arena through the frame allocator, which
// is behind its own lock.
unsafe impl Sync for Arena {}

static ARENA: Arena = Arena(UnsafeCell::new([0; ARENA_SIZE]));
static SETUP: Once<()> = Once::new();
static LOCK: Mutex<()> = Mutex::new(());

/// Serializes the caller against every other test that touches
/// the global allocator or the kernel tables, initializing both
/// on first use.
pub fn lock() -> MutexGuard<'static, ()> {
    let guard = LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    SETUP.call_once(|| {
        let base = NonNull::new(ARENA.0.get().cast::<u8>()).unwrap();
        unsafe { frame::init(base, ARENA_SIZE, P4KA::new(0)) };
        mmu::kernel_init();
    });
    guard
}
