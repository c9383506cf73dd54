// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Page tables and the MMU.
//!
//! We support 4-level paging for 64-bit operation, but only the
//! small slice of it that user address spaces need: 4KiB leaf
//! mappings, built from a logical description and torn down
//! wholesale.  That lets us make a number of simplifying
//! assumptions:
//!
//! * Every node in the paging radix tree is an ordinary frame
//!   from the frame allocator, and is therefore reachable through
//!   the kernel direct map.  We may take any present entry in an
//!   inner node, extract its physical address, and translate it
//!   to a valid `Table` pointer with `frame::kva`.
//! * The kernel half of the address space is built exactly once,
//!   at boot, and is shared *by pointer* with every per-process
//!   root: the upper root entries of each process table alias the
//!   kernel's own next-level tables.  Tearing down a process
//!   table must therefore only ever touch the user half.
//! * The logical model owned by the caller is authoritative.  We
//!   never read the hardware table to answer questions about the
//!   address space; it is rebuilt from the model instead.
//!
//! A `Table` is a hardware-defined radix tree node: 512 64-bit
//! entries.  A table is characterized by the virtual-address bit
//! position that indexes it: 39 for the root, then 30, 21, and
//! finally 12 for the leaf level.  An entry in a table indexed at
//! shift `s > 12` points to a table indexed at `s - 9`; entries at
//! shift 12 map frames.
//!
//! Consumers interact with per-process tables via the
//! [`PageTable`] type, which wraps a root node and exposes walk,
//! map, and user-half teardown.  The shared kernel root is module
//! state, built by [`kernel_init`].

use crate::frame;
use crate::mem::{self, Perms, V4KA, PAGE_SHIFT, PAGE_SIZE};
use crate::{Error, Result};
use bitstruct::bitstruct;
use core::ptr::NonNull;
use spin::Once;
use static_assertions::const_assert_eq;

/// Entries per table node.
const NENTRIES: usize = 512;

/// Root-table slots below this index cover user space; slots at or
/// above it are the kernel half, shared across address spaces.
const USER_SLOTS: usize = (mem::KERNEL_BASE >> ROOT_SHIFT) & (NENTRIES - 1);
const_assert_eq!(USER_SLOTS, 256);

/// Index shift of the root table.
const ROOT_SHIFT: usize = 39;
/// Each level down is indexed nine bits lower.
const LEVEL_STRIDE: usize = 9;

bitstruct! {
    /// A page table entry used at any level of the paging
    /// hierarchy.  User address spaces exercise only a small
    /// subset of paging functionality, so we don't define every
    /// bit defined by the hardware; accessed, dirty, global and
    /// no-execute stay at their reset values.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Pte(u64) {
        p: bool = 0;
        w: bool = 1;
        u: bool = 2;
        pfn: u64 = 12..51;
    }
}

impl Pte {
    /// Returns an empty PTE.
    pub const fn empty() -> Pte {
        Pte(0)
    }

    /// Returns the physical address mapped or referenced by this
    /// entry.
    pub fn phys_addr(&self) -> u64 {
        self.pfn() << PAGE_SHIFT
    }

    /// Creates a leaf PTE for a user page.  The user bit is
    /// always set; presence and writability come from the
    /// bookkeeping permissions.
    fn new_page(ppn: u64, perms: Perms) -> Pte {
        Pte(0)
            .with_pfn(ppn)
            .with_u(true)
            .with_p(perms.present())
            .with_w(perms.writable())
    }

    /// Creates a leaf PTE for a page of the kernel direct map.
    fn new_kernel_page(ppn: u64) -> Pte {
        Pte(0).with_pfn(ppn).with_p(true).with_w(true)
    }

    /// Creates a PTE referencing a next-level table node.
    fn new_table(pa: u64) -> Pte {
        Pte(0).with_pfn(pa >> PAGE_SHIFT).with_p(true).with_w(true).with_u(true)
    }

    /// Returns true IFF the entry is marked present.
    pub fn present(&self) -> bool {
        self.p()
    }

    /// Returns true IFF the entry is marked writable.
    pub fn writable(&self) -> bool {
        self.w()
    }

    /// Returns true IFF the entry is user-accessible.
    pub fn user(&self) -> bool {
        self.u()
    }

    /// Returns the raw entry value.
    pub fn bits(&self) -> u64 {
        self.0
    }
}

/// One node in the paging radix tree.
#[repr(C, align(4096))]
struct Table {
    entries: [Pte; NENTRIES],
}
const_assert_eq!(core::mem::size_of::<Table>(), PAGE_SIZE);

impl Table {
    /// Allocates a zeroed table node from the frame allocator.
    fn alloc() -> Result<NonNull<Table>> {
        let frame = frame::alloc().ok_or(Error::OutOfFrames)?;
        unsafe { core::ptr::write_bytes(frame.as_ptr(), 0, PAGE_SIZE) };
        Ok(frame.cast())
    }

    /// Computes the entry index for the given virtual address in
    /// a table indexed at the given shift.
    fn index(va: V4KA, shift: usize) -> usize {
        (va.addr() >> shift) & (NENTRIES - 1)
    }
}

/// Resolves a table-reference entry to the node it points at.
///
/// # Safety
/// The entry must reference a table node owned by the paging tree,
/// which always lies inside the frame allocator's span.
unsafe fn table_of(entry: Pte) -> NonNull<Table> {
    debug_assert!(entry.present());
    frame::kva(entry.phys_addr()).cast()
}

/// Descends the tree from `root` to the leaf entry covering `va`.
/// With `create`, missing interior nodes are allocated on the way
/// down; returns None if the frame allocator cannot provide one
/// (or, without `create`, if the path does not exist).
fn walk_from(root: NonNull<Table>, va: V4KA, create: bool) -> Option<NonNull<Pte>> {
    let mut table = root;
    let mut shift = ROOT_SHIFT;
    while shift > PAGE_SHIFT {
        let idx = Table::index(va, shift);
        let entry = unsafe { &mut table.as_mut().entries[idx] };
        if entry.present() {
            table = unsafe { table_of(*entry) };
        } else if create {
            let next = Table::alloc().ok()?;
            *entry = Pte::new_table(frame::phys(next.cast()));
            table = next;
        } else {
            return None;
        }
        shift -= LEVEL_STRIDE;
    }
    let idx = Table::index(va, PAGE_SHIFT);
    Some(NonNull::from(unsafe { &mut table.as_mut().entries[idx] }))
}

/// Frees an entire subtree of paging-structure nodes, including
/// `table` itself.  Leaf entries are *not* followed: the frames
/// they map belong to the logical model, not to the tree.
///
/// # Safety
/// `table` must be a tree node indexed at `shift`, unreachable
/// from any root that is still live on a CPU.
unsafe fn free_subtree(table: NonNull<Table>, shift: usize) {
    if shift > PAGE_SHIFT {
        let node = unsafe { table.as_ref() };
        for entry in node.entries.iter().filter(|e| e.present()) {
            unsafe { free_subtree(table_of(*entry), shift - LEVEL_STRIDE) };
        }
    }
    unsafe { frame::free(table.cast()) };
}

/// A per-process page table: a root node whose kernel half aliases
/// the shared kernel tables and whose user half is rebuilt from
/// the logical model.
pub struct PageTable {
    root: NonNull<Table>,
}

// A PageTable is owned by exactly one address space, which the
// kernel's process lock discipline confines to one CPU at a time.
unsafe impl Send for PageTable {}

impl PageTable {
    /// Creates a new per-process table whose kernel half shares
    /// the boot-time kernel tables by pointer.
    pub fn new_user() -> Result<PageTable> {
        let mut root = Table::alloc()?;
        let kroot = kernel_root();
        unsafe {
            let dst = &mut root.as_mut().entries;
            let src = &kroot.as_ref().entries;
            dst[USER_SLOTS..].copy_from_slice(&src[USER_SLOTS..]);
        }
        Ok(PageTable { root })
    }

    /// Returns the physical address of the root node, suitable
    /// for loading into CR3.
    pub fn phys_addr(&self) -> u64 {
        frame::phys(self.root.cast())
    }

    /// Returns the leaf entry covering `va`, descending the tree
    /// and (with `create`) allocating interior nodes as needed.
    pub fn walk(&mut self, va: V4KA, create: bool) -> Option<&mut Pte> {
        walk_from(self.root, va, create).map(|mut p| unsafe { p.as_mut() })
    }

    /// Installs a leaf mapping of one user page at `va` to the
    /// frame with physical page number `ppn`.
    ///
    /// Panics if a present mapping already covers `va` and
    /// `replace` was not requested: overwriting a live mapping
    /// silently would leak its frame.
    pub fn map_page(&mut self, va: V4KA, ppn: u64, perms: Perms, replace: bool) -> Result<()> {
        let pte = self.walk(va, true).ok_or(Error::OutOfFrames)?;
        if pte.present() && !replace {
            panic!("map_page: remap at {:#x}", va.addr());
        }
        *pte = Pte::new_page(ppn, perms);
        Ok(())
    }

    /// Tears down the user half of the table: every subtree
    /// reachable from a user root slot is freed (the nodes, not
    /// the frames they map) and the slots are zeroed.  The kernel
    /// half is untouched.
    pub fn clear_user(&mut self) {
        let root = unsafe { self.root.as_mut() };
        for entry in root.entries[..USER_SLOTS].iter_mut() {
            if entry.present() {
                unsafe { free_subtree(table_of(*entry), ROOT_SHIFT - LEVEL_STRIDE) };
                *entry = Pte::empty();
            }
        }
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        self.clear_user();
        unsafe { frame::free(self.root.cast()) };
    }
}

struct KernelRoot(NonNull<Table>);

// Built once, then read-only; the pointer itself never changes.
unsafe impl Send for KernelRoot {}
unsafe impl Sync for KernelRoot {}

static KERNEL_ROOT: Once<KernelRoot> = Once::new();

/// Builds the shared kernel root: a direct map of the frame
/// allocator's managed physical span at `KERNEL_BASE`, present and
/// writable, supervisor-only.  Called once at boot, after
/// `frame::init`.  Per-process tables created later alias these
/// kernel tables.
pub fn kernel_init() {
    KERNEL_ROOT.call_once(|| {
        let root = Table::alloc().expect("kernel root table");
        let (phys_base, len) = frame::managed_phys_range();
        for off in (0..len).step_by(PAGE_SIZE) {
            let pa = phys_base + off as u64;
            let va = V4KA::new(mem::KERNEL_BASE + pa as usize);
            let mut pte = walk_from(root, va, true).expect("kernel mapping node");
            unsafe { *pte.as_mut() = Pte::new_kernel_page(pa >> PAGE_SHIFT) };
        }
        log::info!("kernel tables: {len:#x} bytes mapped at {:#x}", mem::KERNEL_BASE);
        KernelRoot(root)
    });
}

fn kernel_root() -> NonNull<Table> {
    KERNEL_ROOT.get().expect("kernel page table not initialized").0
}

/// Returns the physical address of the kernel root node.
pub fn kernel_root_phys() -> u64 {
    frame::phys(kernel_root().cast())
}

/// Loads the given root-table physical address into the MMU.
///
/// # Safety
/// The table must map the executing kernel, and must stay live
/// until another root is loaded.
#[cfg(target_os = "none")]
pub unsafe fn load_root(pa: u64) {
    unsafe {
        core::arch::asm!("movq {pa}, %cr3", pa = in(reg) pa, options(att_syntax));
    }
}

/// Hosted stand-in for the CR3 load: records the root so tests
/// can observe installs.
#[cfg(not(target_os = "none"))]
pub unsafe fn load_root(pa: u64) {
    LOADED_ROOT.store(pa, core::sync::atomic::Ordering::SeqCst);
}

#[cfg(not(target_os = "none"))]
static LOADED_ROOT: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// Returns the last root loaded via [`load_root`] (hosted builds
/// only).
#[cfg(not(target_os = "none"))]
pub fn loaded_root() -> u64 {
    LOADED_ROOT.load(core::sync::atomic::Ordering::SeqCst)
}

#[cfg(test)]
mod pte_tests {
    use super::Pte;
    use crate::mem::Perms;

    #[test]
    fn simple() {
        let pte = Pte::empty().with_pfn(0xF_00FF).with_p(true).with_w(true).with_u(true);
        assert_eq!(pte.0, 0xF00F_F007);
        assert_eq!(pte.phys_addr(), 0xF00F_F000);
    }

    #[test]
    fn user_page() {
        let pte = Pte::new_page(0xF_00FF, Perms::new_data());
        assert_eq!(pte.0, 0xF00F_F007);
        let pte = Pte::new_page(0xF_00FF, Perms::new_rodata());
        assert_eq!(pte.0, 0xF00F_F005);
        let pte = Pte::new_page(0xF_00FF, Perms::new(false, true));
        assert!(!pte.present());
        assert!(pte.writable());
        assert!(pte.user());
    }

    #[test]
    fn kernel_page() {
        let pte = Pte::new_kernel_page(0x123);
        assert_eq!(pte.0, 0x0012_3003);
        assert!(!pte.user());
    }
}
