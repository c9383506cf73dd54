// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pointing the current CPU at an address space.
//!
//! Installing an address space is two hardware writes: the
//! per-CPU TSS gets the process's kernel stack top (so that traps
//! from user mode land on the right stack), and CR3 gets the root
//! table.  A context switch between the two writes would wed one
//! process's stack to another's translations, so both happen with
//! interrupts disabled.
//!
//! On bare metal the TSS write is provided by the per-CPU segment
//! code; hosted builds record both writes so tests can observe an
//! install.

use crate::mem::{KSTACK_SIZE, PAGE_SIZE};
use crate::mmu;
use crate::vspace::VSpace;
use core::ptr::NonNull;

/// Installs `vs` on the current CPU.  `kstack` is the base of the
/// owning process's kernel stack; its top goes into the TSS.
///
/// Panics if the kernel stack is not page-aligned.
pub fn install(vs: &VSpace, kstack: NonNull<u8>) {
    let base = kstack.as_ptr() as usize;
    assert_eq!(base % PAGE_SIZE, 0, "install: misaligned kernel stack");
    without_interrupts(|| {
        set_kernel_stack((base + KSTACK_SIZE) as u64);
        unsafe { mmu::load_root(vs.root_phys_addr()) };
    });
}

/// Loads the kernel-only root table, for use when no process is
/// current.
pub fn install_kernel() {
    unsafe { mmu::load_root(mmu::kernel_root_phys()) };
}

/// Runs `f` with interrupts disabled, restoring the previous
/// interrupt state afterwards.
#[cfg(target_os = "none")]
fn without_interrupts<T>(f: impl FnOnce() -> T) -> T {
    let rflags: u64;
    unsafe {
        core::arch::asm!(
            "pushfq; popq {rflags}; cli",
            rflags = out(reg) rflags,
            options(att_syntax),
        );
    }
    let ret = f();
    const IF: u64 = 1 << 9;
    if rflags & IF != 0 {
        unsafe { core::arch::asm!("sti") };
    }
    ret
}

#[cfg(not(target_os = "none"))]
fn without_interrupts<T>(f: impl FnOnce() -> T) -> T {
    f()
}

/// Writes the kernel stack top into the current CPU's TSS.
#[cfg(target_os = "none")]
fn set_kernel_stack(top: u64) {
    unsafe { tss_set_rsp0(top) };
}

#[cfg(target_os = "none")]
extern "C" {
    /// Provided by the per-CPU segment code.
    fn tss_set_rsp0(top: u64);
}

/// Hosted stand-in for the TSS write.
#[cfg(not(target_os = "none"))]
fn set_kernel_stack(top: u64) {
    TSS_RSP0.store(top, core::sync::atomic::Ordering::SeqCst);
}

#[cfg(not(target_os = "none"))]
static TSS_RSP0: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// Returns the last kernel stack top handed to the TSS (hosted
/// builds only).
#[cfg(not(target_os = "none"))]
pub fn recorded_kernel_stack() -> u64 {
    TSS_RSP0.load(core::sync::atomic::Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testenv;

    #[test]
    fn install_records_stack_and_root() {
        let _env = testenv::lock();
        let vs = VSpace::new().unwrap();
        let kstack = crate::frame::alloc().unwrap();
        install(&vs, kstack);
        assert_eq!(
            recorded_kernel_stack(),
            kstack.as_ptr() as u64 + KSTACK_SIZE as u64
        );
        assert_eq!(mmu::loaded_root(), vs.root_phys_addr());

        install_kernel();
        assert_eq!(mmu::loaded_root(), mmu::kernel_root_phys());
        unsafe { crate::frame::free(kstack) };
    }

    #[test]
    #[should_panic(expected = "misaligned kernel stack")]
    fn misaligned_kstack_panics() {
        let _env = testenv::lock();
        let vs = VSpace::new().unwrap();
        let frame = crate::frame::alloc().unwrap();
        let skewed = unsafe { NonNull::new_unchecked(frame.as_ptr().add(8)) };
        install(&vs, skewed);
    }
}
