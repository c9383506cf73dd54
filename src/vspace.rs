// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # The logical address space.
//!
//! A user address space is described twice: once here, portably,
//! as regions of per-page descriptors, and once in the hardware
//! paging tree that the MMU walks.  This module owns the first
//! description and treats it as the truth; [`VSpace::update`]
//! regenerates the hardware half from it wholesale, which
//! sidesteps incremental-diff bugs at the cost of O(mapped pages)
//! work per sync.
//!
//! A [`Region`] is a contiguous, *directional* range of virtual
//! pages: code and heap grow up from their base, the user stack
//! grows down from its.  Encoding the direction keeps descriptor
//! indices non-negative and contiguous from the anchor in both
//! cases.  Each region owns a chain of page-sized descriptor
//! nodes, grown on demand and never moved, so descriptor
//! references stay stable until the region is torn down.
//!
//! Ownership is strict: a region owns its descriptor nodes and,
//! through them, every backing frame; a [`VSpace`] owns its three
//! regions and its hardware table.  Fork duplicates frames rather
//! than sharing them, so teardown can free everything it can
//! reach exactly once.

use crate::frame;
use crate::fs::Inode;
use crate::mem::{self, Perms, V4KA, PAGE_SHIFT, PAGE_SIZE};
use crate::mmu::{PageTable, Pte};
use crate::{Error, Result};
use core::ptr::{self, NonNull};
use static_assertions::const_assert;

/// Number of regions in a user address space.
pub const NREGIONS: usize = 3;

/// The fixed role of each region slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionKind {
    Code = 0,
    Heap = 1,
    Stack = 2,
}

/// Growth direction of a region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dir {
    /// The range is `[va_base, va_base + size)`; index 0 is the
    /// page at `va_base`.
    Up,
    /// The range is `[va_base - size, va_base)`; index 0 is the
    /// page just below `va_base`.
    Down,
}

/// Descriptor of one user virtual page.
#[derive(Clone, Copy, Debug, Default)]
pub struct PageInfo {
    used: bool,
    present: bool,
    writable: bool,
    ppn: u64,
}

impl PageInfo {
    /// True if this slot corresponds to an allocated page.
    pub fn used(&self) -> bool {
        self.used
    }

    /// True if the MMU should see the page as present.
    pub fn present(&self) -> bool {
        self.present
    }

    /// True if the page is writable.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Physical page number of the backing frame.  Meaningful
    /// only while [`used`](Self::used) is true.
    pub fn ppn(&self) -> u64 {
        self.ppn
    }

    /// Flips the logical presence of the page.  Pairs with
    /// [`VSpace::mark_not_present`], which hides an already
    /// non-present page from the MMU.
    pub fn set_present(&mut self, present: bool) {
        self.present = present;
    }

    fn perms(&self) -> Perms {
        Perms::new(self.present, self.writable)
    }
}

/// Descriptors per node: a node must fit in one frame together
/// with its pointer-sized forward link.
const SLOTS: usize =
    (PAGE_SIZE - core::mem::size_of::<usize>()) / core::mem::size_of::<PageInfo>();

/// A page-sized node of page descriptors, chained singly.  Nodes
/// come from the frame allocator and never move or shrink while
/// the owning region lives.
#[repr(C, align(4096))]
struct InfoNode {
    infos: [PageInfo; SLOTS],
    next: Option<NonNull<InfoNode>>,
}
const_assert!(core::mem::size_of::<InfoNode>() == PAGE_SIZE);

impl InfoNode {
    /// Allocates a zeroed node; all slots start unused.
    fn alloc() -> Result<NonNull<InfoNode>> {
        let frame = frame::alloc().ok_or(Error::OutOfFrames)?;
        unsafe { ptr::write_bytes(frame.as_ptr(), 0, PAGE_SIZE) };
        Ok(frame.cast())
    }
}

/// A contiguous, directional range of virtual pages with uniform
/// lifecycle, owning the descriptors for every page it spans.
pub struct Region {
    va_base: usize,
    size: usize,
    dir: Dir,
    pages: Option<NonNull<InfoNode>>,
}

impl Region {
    fn new(dir: Dir) -> Region {
        Region { va_base: 0, size: 0, dir, pages: None }
    }

    /// Returns the anchor address.
    pub fn va_base(&self) -> usize {
        self.va_base
    }

    /// Returns the total bytes covered.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the growth direction.
    pub fn dir(&self) -> Dir {
        self.dir
    }

    /// Sets the anchor address.  Mappings are added separately;
    /// callers describe the intended range, they do not move
    /// existing descriptors.
    pub fn set_va_base(&mut self, va_base: usize) {
        self.va_base = va_base;
    }

    /// Sets the covered byte count.  [`add_mapping`]
    /// deliberately never touches this: the caller decides what
    /// the region is supposed to span.
    ///
    /// [`add_mapping`]: Self::add_mapping
    pub fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    /// Returns the inclusive lower bound of the range.
    pub fn bottom(&self) -> usize {
        match self.dir {
            Dir::Up => self.va_base,
            Dir::Down => self.va_base - self.size,
        }
    }

    /// Returns the exclusive upper bound of the range.
    pub fn top(&self) -> usize {
        match self.dir {
            Dir::Up => self.va_base + self.size,
            Dir::Down => self.va_base,
        }
    }

    /// Maps an address inside the range to its descriptor index.
    fn index_of(&self, va: usize) -> usize {
        match self.dir {
            Dir::Up => {
                debug_assert!(va >= self.va_base);
                (va - self.va_base) >> PAGE_SHIFT
            }
            Dir::Down => {
                debug_assert!(va < self.va_base);
                (self.va_base - 1 - va) >> PAGE_SHIFT
            }
        }
    }

    /// Maps a descriptor index back to the page address it
    /// describes.
    fn va_of(&self, index: usize) -> usize {
        match self.dir {
            Dir::Up => self.va_base + (index << PAGE_SHIFT),
            Dir::Down => self.va_base - ((index + 1) << PAGE_SHIFT),
        }
    }

    /// Returns the descriptor for the page containing `va`,
    /// growing the node chain as needed.  The reference is stable
    /// until the region is torn down.  Fails only if the frame
    /// allocator cannot provide a node.
    fn page_info(&mut self, va: usize) -> Result<&mut PageInfo> {
        let mut index = self.index_of(va);
        if self.pages.is_none() {
            self.pages = Some(InfoNode::alloc()?);
        }
        let mut node = self.pages.unwrap();
        while index >= SLOTS {
            let nr = unsafe { node.as_mut() };
            if nr.next.is_none() {
                nr.next = Some(InfoNode::alloc()?);
            }
            node = nr.next.unwrap();
            index -= SLOTS;
        }
        Ok(unsafe { &mut node.as_mut().infos[index] })
    }

    /// Non-allocating descriptor lookup: returns None if the
    /// chain has never grown far enough to describe `va`.
    pub fn peek(&self, va: usize) -> Option<&PageInfo> {
        let mut index = self.index_of(va);
        let mut node = self.pages?;
        while index >= SLOTS {
            node = unsafe { node.as_ref() }.next?;
            index -= SLOTS;
        }
        Some(unsafe { &node.as_ref().infos[index] })
    }

    fn peek_mut(&mut self, va: usize) -> Option<&mut PageInfo> {
        let mut index = self.index_of(va);
        let mut node = self.pages?;
        while index >= SLOTS {
            node = unsafe { node.as_ref() }.next?;
            index -= SLOTS;
        }
        Some(unsafe { &mut node.as_mut().infos[index] })
    }

    /// Backs every page of `[from_va, from_va + size)` with a
    /// fresh zeroed frame carrying the given permissions.  This
    /// is the central allocator of the subsystem.
    ///
    /// A zero `size` succeeds with no effect.  A range reaching
    /// the kernel half of the address space is refused outright.
    /// If the allocator runs dry partway through, every frame
    /// taken by this call is returned and the touched slots are
    /// cleared before the error is reported; descriptor nodes
    /// grown along the way stay with the region.
    ///
    /// Does **not** change the region's `size`: callers describe
    /// the intended span themselves, before or after.
    ///
    /// Panics if any page in the range is already mapped:
    /// remapping is a kernel programming bug.
    pub fn add_mapping(&mut self, from_va: usize, size: usize, perms: Perms) -> Result<usize> {
        let end = from_va.checked_add(size).ok_or(Error::AddressTooHigh)?;
        // The kernel half, and the non-canonical hole below it,
        // are off limits to user mappings.
        if end > mem::LOW_CANON_SUP {
            return Err(Error::AddressTooHigh);
        }
        if size == 0 {
            return Ok(0);
        }
        let start = mem::page_round_up(from_va);
        // Grow the descriptor chain and refuse remaps up front,
        // so the allocation loop below cannot die on a stale
        // slot after frames have already been handed out.
        let mut a = start;
        while a < end {
            let vpi = self.page_info(a)?;
            assert!(!vpi.used, "add_mapping: remap at {a:#x}");
            a += PAGE_SIZE;
        }
        let mut a = start;
        while a < end {
            let Some(frame) = frame::alloc() else {
                self.unwind(start, a);
                return Err(Error::OutOfFrames);
            };
            unsafe { ptr::write_bytes(frame.as_ptr(), 0, PAGE_SIZE) };
            let ppn = frame::ppn(frame);
            let vpi = self.peek_mut(a).expect("descriptor chain shrank");
            vpi.used = true;
            vpi.present = perms.present();
            vpi.writable = perms.writable();
            vpi.ppn = ppn;
            a += PAGE_SIZE;
        }
        Ok(size)
    }

    /// Walks `[start, upto)` backwards, freeing the frames taken
    /// by a failed `add_mapping` and clearing their slots.
    fn unwind(&mut self, start: usize, upto: usize) {
        let mut a = upto;
        while a > start {
            a -= PAGE_SIZE;
            let vpi = self.peek_mut(a).expect("descriptor chain shrank");
            debug_assert!(vpi.used);
            unsafe { frame::free(frame::ppn_kva(vpi.ppn)) };
            *vpi = PageInfo::default();
        }
    }

    /// [`add_mapping`](Self::add_mapping), then copies `data`
    /// into the freshly allocated frames through their kernel
    /// aliases.  `va` must be page-aligned.
    pub fn add_data(&mut self, va: usize, data: &[u8], perms: Perms) -> Result<usize> {
        debug_assert_eq!(va % PAGE_SIZE, 0);
        let ret = self.add_mapping(va, data.len(), perms)?;
        let mut off = 0;
        while off < data.len() {
            let vpi = self.peek(va + off).expect("fresh mapping missing");
            assert!(vpi.used);
            let n = usize::min(data.len() - off, PAGE_SIZE);
            let dst = frame::ppn_kva(vpi.ppn);
            unsafe {
                ptr::copy_nonoverlapping(data.as_ptr().add(off), dst.as_ptr(), n);
            }
            off += PAGE_SIZE;
        }
        Ok(ret)
    }

    /// Reads `n` bytes at inode offset `off` directly into the
    /// backing frames starting at `va`, which must be
    /// page-aligned and already mapped.  A short read fails the
    /// operation.
    ///
    /// Panics if `va` is unaligned or any page in the span is not
    /// allocated: loading into unmapped space is a kernel bug.
    pub fn load_from<I: Inode>(&mut self, va: usize, ip: &I, off: u64, n: usize) -> Result<()> {
        assert_eq!(va % PAGE_SIZE, 0, "load_from: unaligned base");
        let mut i = 0;
        while i < n {
            let vpi = self.peek(va + i).expect("load_from: page not allocated");
            assert!(vpi.used, "load_from: page not allocated");
            let chunk = usize::min(n - i, PAGE_SIZE);
            let dst = frame::ppn_kva(vpi.ppn);
            let buf = unsafe { core::slice::from_raw_parts_mut(dst.as_ptr(), chunk) };
            if ip.read_at(off + i as u64, buf) != chunk {
                return Err(Error::ShortRead);
            }
            i += PAGE_SIZE;
        }
        Ok(())
    }

    /// True IFF `[va, va + size)` lies within the region's range.
    /// With `size == 0`, the exclusive upper bound itself does
    /// not count as contained.
    pub fn contains(&self, va: usize, size: usize) -> bool {
        if size == 0 && va == self.top() {
            return false;
        }
        let Some(end) = va.checked_add(size) else {
            return false;
        };
        va >= self.bottom() && end <= self.top()
    }

    /// Deep-copies the descriptor chain of `src`, giving every
    /// used slot a fresh frame holding a copy of the original
    /// page.  On allocation failure the nodes and frames copied
    /// so far stay linked into `self`, where teardown will
    /// reclaim them.
    fn clone_pages_from(&mut self, src: &Region) -> Result<()> {
        debug_assert!(self.pages.is_none());
        let mut src_node = src.pages;
        let mut tail: *mut Option<NonNull<InfoNode>> = &mut self.pages;
        while let Some(sn) = src_node {
            let mut node = InfoNode::alloc()?;
            unsafe { *tail = Some(node) };
            let src_ref = unsafe { sn.as_ref() };
            let node_ref = unsafe { node.as_mut() };
            for (dst, s) in node_ref.infos.iter_mut().zip(src_ref.infos.iter()) {
                if !s.used {
                    continue;
                }
                let frame = frame::alloc().ok_or(Error::OutOfFrames)?;
                unsafe {
                    ptr::copy_nonoverlapping(
                        frame::ppn_kva(s.ppn).as_ptr(),
                        frame.as_ptr(),
                        PAGE_SIZE,
                    );
                }
                dst.used = true;
                dst.present = s.present;
                dst.writable = s.writable;
                dst.ppn = frame::ppn(frame);
            }
            tail = &mut node_ref.next;
            src_node = src_ref.next;
        }
        Ok(())
    }

    /// Releases every backing frame and every descriptor node,
    /// returning the region to its empty state.
    fn release(&mut self) {
        let mut node = self.pages.take();
        while let Some(n) = node {
            let nr = unsafe { n.as_ref() };
            for vpi in nr.infos.iter().filter(|v| v.used) {
                unsafe { frame::free(frame::ppn_kva(vpi.ppn)) };
            }
            let next = nr.next;
            unsafe { frame::free(n.cast()) };
            node = next;
        }
        self.va_base = 0;
        self.size = 0;
    }
}

/// One process's user address space: three regions plus the
/// hardware table they are reflected into.
pub struct VSpace {
    pgtbl: PageTable,
    regions: [Region; NREGIONS],
}

// An address space is owned by exactly one process; the kernel's
// process lock discipline gives mutating callers exclusive
// access.
unsafe impl Send for VSpace {}

impl VSpace {
    /// Creates an empty address space: a fresh hardware table
    /// preloaded with the shared kernel mapping, and three empty
    /// regions with their fixed directions.
    pub fn new() -> Result<VSpace> {
        let pgtbl = PageTable::new_user()?;
        Ok(VSpace {
            pgtbl,
            regions: [
                Region::new(Dir::Up),   // code
                Region::new(Dir::Up),   // heap
                Region::new(Dir::Down), // user stack
            ],
        })
    }

    /// Returns the region with the given role.
    pub fn region(&self, kind: RegionKind) -> &Region {
        &self.regions[kind as usize]
    }

    /// Returns the region with the given role, mutably.
    pub fn region_mut(&mut self, kind: RegionKind) -> &mut Region {
        &mut self.regions[kind as usize]
    }

    fn region_index_for(&self, va: usize) -> Option<usize> {
        self.regions.iter().position(|r| match r.dir {
            Dir::Up => va >= r.va_base && va < r.va_base + r.size,
            Dir::Down => va >= r.va_base - r.size && va < r.va_base,
        })
    }

    /// Returns the region whose range contains `va`, if any.
    pub fn region_for(&self, va: usize) -> Option<&Region> {
        self.region_index_for(va).map(|i| &self.regions[i])
    }

    /// Returns the descriptor tracking `va`, if some region spans
    /// it and its chain reaches that far.  This is the seam for
    /// subsystems that manipulate logical presence before calling
    /// [`mark_not_present`](Self::mark_not_present).
    pub fn page_info_mut(&mut self, va: usize) -> Option<&mut PageInfo> {
        let idx = self.region_index_for(va)?;
        self.regions[idx].peek_mut(va)
    }

    /// Sets up the very first process: its code is `init`, copied
    /// to the fixed initial-process base, followed by five
    /// present, writable scratch pages the initial process
    /// expects.  The stack is one page, its top at `SZ_2G`.  The
    /// hardware table is synced before returning.
    ///
    /// Panics on allocation failure: if there is no memory for
    /// the first process, boot cannot proceed.
    pub fn init_code(&mut self, init: &[u8]) {
        const INIT_CODE_BASE: usize = 0x10000;
        const SCRATCH_PAGES: usize = 5;

        let code = self.region_mut(RegionKind::Code);
        code.set_va_base(INIT_CODE_BASE);
        code.set_size(mem::page_round_up(init.len()) + SCRATCH_PAGES * PAGE_SIZE);
        code.add_data(INIT_CODE_BASE, init, Perms::new_data())
            .expect("failed to allocate initial process code");
        code.add_mapping(
            INIT_CODE_BASE + mem::page_round_up(init.len()),
            SCRATCH_PAGES * PAGE_SIZE,
            Perms::new_data(),
        )
        .expect("failed to allocate initial process scratch pages");

        self.init_stack(mem::SZ_2G).expect("failed to allocate initial process stack");
        self.update().expect("failed to sync initial address space");
    }

    /// (Re)initializes the user stack: one present, writable page
    /// just below `top`, which becomes the region's anchor.
    pub fn init_stack(&mut self, top: usize) -> Result<()> {
        let stack = self.region_mut(RegionKind::Stack);
        stack.set_va_base(top);
        stack.set_size(PAGE_SIZE);
        stack.add_mapping(top - PAGE_SIZE, PAGE_SIZE, Perms::new_data())?;
        Ok(())
    }

    /// Copies `data` into the user address space at `va`, walking
    /// page by page through the bookkeeping (never the hardware
    /// table).  Every page touched must be mapped and logically
    /// writable; the span is validated before the first byte is
    /// copied, so a failure writes nothing.
    pub fn write_to(&mut self, va: usize, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = va.checked_add(data.len()).ok_or(Error::AddressTooHigh)?;
        if end > mem::LOW_CANON_SUP {
            return Err(Error::AddressTooHigh);
        }
        let mut a = va;
        while a < end {
            let idx = self.region_index_for(a).ok_or(Error::NotMapped)?;
            let vpi = self.regions[idx].peek(a).ok_or(Error::NotMapped)?;
            if !vpi.used {
                return Err(Error::NotMapped);
            }
            if !vpi.writable {
                return Err(Error::NotWritable);
            }
            a = usize::min(mem::page_round_down(a) + PAGE_SIZE, end);
        }
        let mut a = va;
        let mut data = data;
        while a < end {
            let idx = self.region_index_for(a).expect("validated span");
            let vpi = self.regions[idx].peek(a).expect("validated span");
            let chunk = usize::min(mem::page_round_down(a) + PAGE_SIZE - a, end - a);
            let dst = frame::ppn_kva(vpi.ppn);
            unsafe {
                ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    dst.as_ptr().add(a % PAGE_SIZE),
                    chunk,
                );
            }
            a += chunk;
            data = &data[chunk..];
        }
        Ok(())
    }

    /// Hides a page from the MMU after the logical model has
    /// already marked it not-present: zeroes its hardware entry
    /// if one exists.  `va` must be page-aligned.
    ///
    /// Panics if no region tracks `va` or the descriptor still
    /// says present; hiding a live page is a kernel bug.
    pub fn mark_not_present(&mut self, va: usize) {
        assert_eq!(va % PAGE_SIZE, 0, "mark_not_present: unaligned address");
        let idx = self
            .region_index_for(va)
            .expect("mark_not_present: address in no region");
        let vpi = self.regions[idx].peek(va).expect("mark_not_present: page never tracked");
        assert!(!vpi.present, "mark_not_present: page still marked present");
        if let Some(pte) = self.pgtbl.walk(V4KA::new(va), false) {
            *pte = Pte::empty();
        }
    }

    /// Tests whether `[va, va + size)` lies within the address
    /// space: None if no region contains `va`, otherwise whether
    /// the region contains the whole span.
    pub fn contains(&self, va: usize, size: usize) -> Option<bool> {
        let idx = self.region_index_for(va)?;
        Some(self.regions[idx].contains(va, size))
    }

    /// Rebuilds the hardware table from the logical model: the
    /// user half is torn down wholesale, then every used
    /// descriptor in every region is mapped afresh.  Unused slots
    /// in the middle of a region (code gaps between ELF segments)
    /// produce no mapping.
    pub fn update(&mut self) -> Result<()> {
        self.pgtbl.clear_user();
        let mut mapped = 0usize;
        for r in &self.regions {
            debug_assert_eq!(r.bottom() % PAGE_SIZE, 0);
            let count = mem::page_round_up(r.size) >> PAGE_SHIFT;
            let mut index = 0;
            let mut node = r.pages;
            'chain: while let Some(n) = node {
                let nr = unsafe { n.as_ref() };
                for vpi in nr.infos.iter() {
                    if index >= count {
                        break 'chain;
                    }
                    if vpi.used {
                        let va = V4KA::new(r.va_of(index));
                        self.pgtbl.map_page(va, vpi.ppn, vpi.perms(), false)?;
                        mapped += 1;
                    }
                    index += 1;
                }
                node = nr.next;
            }
        }
        log::trace!("synced {mapped} pages to hardware table");
        Ok(())
    }

    /// Fork-style deep copy: a new address space with the same
    /// region geometry, every used page backed by a fresh frame
    /// holding a copy of the original, synced to its own hardware
    /// table.  Nothing is shared with `self` afterwards.
    pub fn try_clone(&self) -> Result<VSpace> {
        let mut vs = VSpace::new()?;
        for (dst, src) in vs.regions.iter_mut().zip(self.regions.iter()) {
            dst.va_base = src.va_base;
            dst.size = src.size;
            dst.dir = src.dir;
            dst.clone_pages_from(src)?;
        }
        vs.update()?;
        Ok(vs)
    }

    /// Returns the physical address of the root table, for
    /// loading into CR3.
    pub fn root_phys_addr(&self) -> u64 {
        self.pgtbl.phys_addr()
    }

    pub(crate) fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.pgtbl
    }

    /// Logs the top ten words of the user stack.
    pub fn dump_stack(&self) {
        const WORDS: usize = 10;
        let word = core::mem::size_of::<u64>();
        let r = self.region(RegionKind::Stack);
        log::debug!("stack dump: base={:#x} size={:#x}", r.va_base, r.size);
        if r.size == 0 {
            return;
        }
        let floor = usize::max(r.bottom(), r.va_base - WORDS * word);
        let mut va = r.va_base.wrapping_sub(word);
        while va >= floor {
            let Some(vpi) = r.peek(va) else { break };
            if !vpi.used {
                break;
            }
            let src = frame::ppn_kva(vpi.ppn);
            let mut data = 0u64;
            unsafe {
                ptr::copy_nonoverlapping(
                    src.as_ptr().add(va % PAGE_SIZE),
                    &mut data as *mut u64 as *mut u8,
                    word,
                );
            }
            log::debug!("  {va:#x}: {data:#018x}");
            va -= word;
        }
    }

    /// Logs the mapping state of every page the code region
    /// spans.
    pub fn dump_code(&self) {
        let r = self.region(RegionKind::Code);
        log::debug!("code dump: base={:#x} size={:#x}", r.va_base, r.size);
        let count = mem::page_round_up(r.size) >> PAGE_SHIFT;
        for index in 0..count {
            let va = r.va_of(index);
            match r.peek(va) {
                Some(vpi) if vpi.used => log::debug!(
                    "  {va:#x}: ppn={:#x} present={} writable={}",
                    vpi.ppn,
                    vpi.present,
                    vpi.writable
                ),
                _ => log::debug!("  {va:#x}: unmapped"),
            }
        }
    }
}

impl Drop for VSpace {
    /// Releases every backing frame and descriptor node; the
    /// hardware table follows via its own drop, which tears down
    /// the user subtrees while leaving the shared kernel tables
    /// alone.
    fn drop(&mut self) {
        for r in &mut self.regions {
            r.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testenv;

    fn fresh() -> VSpace {
        VSpace::new().expect("address space")
    }

    #[test]
    fn direction_symmetry() {
        let mut up = Region::new(Dir::Up);
        up.set_va_base(0x40_0000);
        for k in 0..600usize {
            assert_eq!(up.index_of(0x40_0000 + k * PAGE_SIZE), k);
            assert_eq!(up.va_of(k), 0x40_0000 + k * PAGE_SIZE);
        }
        let mut down = Region::new(Dir::Down);
        down.set_va_base(mem::SZ_2G);
        for k in 0..600usize {
            let va = mem::SZ_2G - PAGE_SIZE - k * PAGE_SIZE;
            assert_eq!(down.index_of(va), k);
            assert_eq!(down.va_of(k), va);
            // Every byte of the page shares its index.
            assert_eq!(down.index_of(va + PAGE_SIZE - 1), k);
        }
    }

    #[test]
    fn bounds() {
        let mut up = Region::new(Dir::Up);
        up.set_va_base(0x40_0000);
        up.set_size(0x3000);
        assert_eq!(up.bottom(), 0x40_0000);
        assert_eq!(up.top(), 0x40_3000);
        let mut down = Region::new(Dir::Down);
        down.set_va_base(mem::SZ_2G);
        down.set_size(PAGE_SIZE);
        assert_eq!(down.bottom(), mem::SZ_2G - PAGE_SIZE);
        assert_eq!(down.top(), mem::SZ_2G);
    }

    #[test]
    fn contains_edges() {
        let mut r = Region::new(Dir::Up);
        r.set_va_base(0x40_0000);
        r.set_size(0x2000);
        assert!(r.contains(0x40_0000, 0));
        assert!(r.contains(0x40_0000, 0x2000));
        assert!(r.contains(0x40_1FFF, 1));
        assert!(!r.contains(0x40_1FFF, 2));
        // The exclusive top is not contained, even at zero size.
        assert!(!r.contains(0x40_2000, 0));
        assert!(!r.contains(0x3F_FFFF, 1));
        assert!(!r.contains(0x40_0000, usize::MAX));
    }

    #[test]
    fn add_mapping_refuses_kernel_range() {
        let _env = testenv::lock();
        let mut vs = fresh();
        let code = vs.region_mut(RegionKind::Code);
        code.set_va_base(0x10000);
        assert_eq!(
            code.add_mapping(mem::KERNEL_BASE - PAGE_SIZE, 2 * PAGE_SIZE, Perms::new_data()),
            Err(Error::AddressTooHigh)
        );
        assert_eq!(
            code.add_mapping(0x10000, mem::LOW_CANON_SUP, Perms::new_data()),
            Err(Error::AddressTooHigh)
        );
        // No side effects.
        assert!(code.pages.is_none());
    }

    #[test]
    fn add_mapping_zero_size() {
        let _env = testenv::lock();
        let mut vs = fresh();
        let code = vs.region_mut(RegionKind::Code);
        code.set_va_base(0x10000);
        assert_eq!(code.add_mapping(0x10000, 0, Perms::new_data()), Ok(0));
        assert!(code.pages.is_none());
    }

    #[test]
    fn add_mapping_rounds_interior_start() {
        let _env = testenv::lock();
        let mut vs = fresh();
        let code = vs.region_mut(RegionKind::Code);
        code.set_va_base(0x10000);
        // An unaligned start is rounded up to the next page.
        code.add_mapping(0x10010, 0x2000, Perms::new_data()).unwrap();
        assert!(code.peek(0x11000).unwrap().used());
        assert!(code.peek(0x12000).is_some());
        assert!(!code.peek(0x10000).unwrap().used());
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remap_panics() {
        let _env = testenv::lock();
        let mut vs = fresh();
        let code = vs.region_mut(RegionKind::Code);
        code.set_va_base(0x10000);
        code.add_mapping(0x10000, PAGE_SIZE, Perms::new_data()).unwrap();
        let _ = code.add_mapping(0x10000, PAGE_SIZE, Perms::new_data());
    }

    #[test]
    fn remap_is_detected_before_any_allocation() {
        let _env = testenv::lock();
        let mut vs = fresh();
        let code = vs.region_mut(RegionKind::Code);
        code.set_va_base(0x10000);
        // Map the *third* page, then attempt a range that covers
        // it: the attempt must die without backing the first two.
        code.add_mapping(0x12000, PAGE_SIZE, Perms::new_data()).unwrap();
        let before = crate::frame::outstanding();
        let attempt = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let code = vs.region_mut(RegionKind::Code);
            let _ = code.add_mapping(0x10000, 3 * PAGE_SIZE, Perms::new_data());
        }));
        assert!(attempt.is_err());
        assert_eq!(crate::frame::outstanding(), before);
        let code = vs.region(RegionKind::Code);
        assert!(!code.peek(0x10000).unwrap().used());
        assert!(!code.peek(0x11000).unwrap().used());
        assert!(code.peek(0x12000).unwrap().used());
    }

    #[test]
    fn oom_unwind_restores_frame_counts() {
        let _env = testenv::lock();
        let mut vs = fresh();
        let code = vs.region_mut(RegionKind::Code);
        code.set_va_base(0x10000);
        code.set_size(10 * PAGE_SIZE);
        // Pre-grow the descriptor chain so the failing call's
        // only allocations are backing frames.
        code.page_info(0x10000 + 9 * PAGE_SIZE).unwrap();

        // Starve the allocator down to fewer frames than the
        // mapping needs.
        let mut hoard = std::vec::Vec::new();
        while crate::frame::free_count() > 4 {
            hoard.push(crate::frame::alloc().unwrap());
        }
        let free_before = crate::frame::free_count();
        let out_before = crate::frame::outstanding();

        let code = vs.region_mut(RegionKind::Code);
        assert_eq!(
            code.add_mapping(0x10000, 10 * PAGE_SIZE, Perms::new_data()),
            Err(Error::OutOfFrames)
        );
        assert_eq!(crate::frame::free_count(), free_before);
        assert_eq!(crate::frame::outstanding(), out_before);
        for k in 0..10 {
            assert!(!code.peek(0x10000 + k * PAGE_SIZE).unwrap().used());
        }
        // The chain itself survives the failure.
        assert!(code.pages.is_some());

        for f in hoard {
            unsafe { crate::frame::free(f) };
        }
    }

    #[test]
    fn init_code_bootstrap_layout() {
        let _env = testenv::lock();
        let mut vs = fresh();
        let blob = [0x90u8; 200];
        vs.init_code(&blob);

        let code = vs.region(RegionKind::Code);
        assert_eq!(code.va_base(), 0x10000);
        assert_eq!(code.size(), 6 * PAGE_SIZE);
        for k in 0..6 {
            let vpi = code.peek(0x10000 + k * PAGE_SIZE).unwrap();
            assert!(vpi.used() && vpi.present() && vpi.writable());
        }
        // The blob itself landed in the first page.
        let first = crate::frame::ppn_kva(code.peek(0x10000).unwrap().ppn());
        let copied = unsafe { core::slice::from_raw_parts(first.as_ptr(), 200) };
        assert_eq!(copied, &blob[..]);

        let stack = vs.region(RegionKind::Stack);
        assert_eq!(stack.va_base(), mem::SZ_2G);
        assert_eq!(stack.size(), PAGE_SIZE);
        assert_eq!(stack.bottom(), mem::SZ_2G - PAGE_SIZE);

        // The hardware table reflects the stack page.
        let pte = vs
            .page_table_mut()
            .walk(V4KA::new(mem::SZ_2G - PAGE_SIZE), false)
            .expect("stack page mapped");
        assert!(pte.present() && pte.writable() && pte.user());
    }

    #[test]
    fn sync_skips_gaps_and_hides_nonpresent() {
        let _env = testenv::lock();
        let mut vs = fresh();
        let code = vs.region_mut(RegionKind::Code);
        code.set_va_base(0x40_0000);
        code.set_size(3 * PAGE_SIZE);
        // Map pages 0 and 2, leaving a hole at page 1.
        code.add_mapping(0x40_0000, PAGE_SIZE, Perms::new_rodata()).unwrap();
        code.add_mapping(0x40_2000, PAGE_SIZE, Perms::new(false, true)).unwrap();
        vs.update().unwrap();

        let pt = vs.page_table_mut();
        let p0 = pt.walk(V4KA::new(0x40_0000), false).expect("page 0 mapped");
        assert!(p0.present() && !p0.writable() && p0.user());
        // The hole shares a leaf table with page 0, so the walk
        // reaches an entry, but it must be empty.
        let hole = pt.walk(V4KA::new(0x40_1000), false).expect("leaf table exists");
        assert_eq!(hole.bits(), 0);
        let p2 = pt.walk(V4KA::new(0x40_2000), false).expect("page 2 entry emitted");
        assert!(!p2.present());
        assert!(p2.user() && p2.writable());
    }

    #[test]
    fn update_is_idempotent() {
        let _env = testenv::lock();
        let mut vs = fresh();
        vs.init_code(&[0xCCu8; 64]);
        let probe = [0x10000usize, 0x11000, 0x15000, mem::SZ_2G - PAGE_SIZE];
        let first: std::vec::Vec<u64> = probe
            .iter()
            .map(|&va| vs.page_table_mut().walk(V4KA::new(va), false).unwrap().bits())
            .collect();
        vs.update().unwrap();
        let second: std::vec::Vec<u64> = probe
            .iter()
            .map(|&va| vs.page_table_mut().walk(V4KA::new(va), false).unwrap().bits())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn write_to_crosses_page_boundary() {
        let _env = testenv::lock();
        let mut vs = fresh();
        vs.init_code(&[0u8; 16]);
        // Grow the stack to two pages so a straddling write fits.
        let stack = vs.region_mut(RegionKind::Stack);
        stack
            .add_mapping(mem::SZ_2G - 2 * PAGE_SIZE, PAGE_SIZE, Perms::new_data())
            .unwrap();
        stack.set_size(2 * PAGE_SIZE);

        let va = mem::SZ_2G - PAGE_SIZE - 2;
        vs.write_to(va, &[1, 2, 3, 4]).unwrap();

        let stack = vs.region(RegionKind::Stack);
        let lo = crate::frame::ppn_kva(stack.peek(va).unwrap().ppn());
        let hi = crate::frame::ppn_kva(stack.peek(mem::SZ_2G - PAGE_SIZE).unwrap().ppn());
        unsafe {
            assert_eq!(lo.as_ptr().add(PAGE_SIZE - 2).read(), 1);
            assert_eq!(lo.as_ptr().add(PAGE_SIZE - 1).read(), 2);
            assert_eq!(hi.as_ptr().read(), 3);
            assert_eq!(hi.as_ptr().add(1).read(), 4);
        }
    }

    #[test]
    fn write_to_fails_off_the_stack_and_writes_nothing() {
        let _env = testenv::lock();
        let mut vs = fresh();
        vs.init_code(&[0u8; 16]);
        // One-page stack: a write straddling its lower edge must
        // fail without touching the mapped page.
        let va = mem::SZ_2G - PAGE_SIZE - 1;
        assert_eq!(vs.write_to(va, &[1, 2, 3, 4]), Err(Error::NotMapped));
        let stack = vs.region(RegionKind::Stack);
        let page = crate::frame::ppn_kva(stack.peek(mem::SZ_2G - PAGE_SIZE).unwrap().ppn());
        unsafe {
            assert_eq!(page.as_ptr().read(), 0);
            assert_eq!(page.as_ptr().add(1).read(), 0);
            assert_eq!(page.as_ptr().add(2).read(), 0);
        }
    }

    #[test]
    fn write_to_respects_readonly() {
        let _env = testenv::lock();
        let mut vs = fresh();
        let code = vs.region_mut(RegionKind::Code);
        code.set_va_base(0x40_0000);
        code.set_size(PAGE_SIZE);
        code.add_mapping(0x40_0000, PAGE_SIZE, Perms::new_rodata()).unwrap();
        assert_eq!(vs.write_to(0x40_0010, &[1]), Err(Error::NotWritable));
    }

    #[test]
    fn contains_tri_state() {
        let _env = testenv::lock();
        let mut vs = fresh();
        vs.init_code(&[0u8; 16]);
        assert_eq!(vs.contains(0x10000, 16), Some(true));
        assert_eq!(vs.contains(0x10000, 6 * PAGE_SIZE), Some(true));
        // In the code region but running past its top.
        assert_eq!(vs.contains(0x10000, 7 * PAGE_SIZE), Some(false));
        // Nowhere near any region.
        assert_eq!(vs.contains(0x9000_0000, 8), None);
        assert_eq!(vs.contains(mem::SZ_2G - 8, 8), Some(true));
        assert_eq!(vs.contains(mem::SZ_2G - 8, 16), Some(false));
    }

    #[test]
    fn mark_not_present_zeroes_the_entry() {
        let _env = testenv::lock();
        let mut vs = fresh();
        vs.init_code(&[0u8; 16]);
        let va = mem::SZ_2G - PAGE_SIZE;
        vs.page_info_mut(va).unwrap().set_present(false);
        vs.mark_not_present(va);
        let pte = vs.page_table_mut().walk(V4KA::new(va), false).expect("entry exists");
        assert_eq!(pte.bits(), 0);
        // A later sync keeps the page hidden.
        vs.update().unwrap();
        let pte = vs.page_table_mut().walk(V4KA::new(va), false).expect("entry re-emitted");
        assert!(!pte.present());
    }

    #[test]
    #[should_panic(expected = "still marked present")]
    fn mark_not_present_rejects_live_pages() {
        let _env = testenv::lock();
        let mut vs = fresh();
        vs.init_code(&[0u8; 16]);
        vs.mark_not_present(mem::SZ_2G - PAGE_SIZE);
    }

    #[test]
    fn clone_duplicates_frames_and_contents() {
        let _env = testenv::lock();
        let mut vs = fresh();
        vs.init_code(&[0x42u8; 128]);
        vs.write_to(0x10000 + 64, &[0xAB]).unwrap();

        let mut child = vs.try_clone().expect("clone");
        for k in 0..6 {
            let va = 0x10000 + k * PAGE_SIZE;
            let p = vs.region(RegionKind::Code).peek(va).unwrap();
            let c = child.region(RegionKind::Code).peek(va).unwrap();
            assert!(c.used());
            assert_ne!(p.ppn(), c.ppn());
            let pb = unsafe {
                core::slice::from_raw_parts(crate::frame::ppn_kva(p.ppn()).as_ptr(), PAGE_SIZE)
            };
            let cb = unsafe {
                core::slice::from_raw_parts(crate::frame::ppn_kva(c.ppn()).as_ptr(), PAGE_SIZE)
            };
            assert_eq!(pb, cb);
        }

        // Diverge the child; the parent must not notice.
        child.write_to(0x10000 + 64, &[0xCD]).unwrap();
        let p = vs.region(RegionKind::Code).peek(0x10000).unwrap();
        let c = child.region(RegionKind::Code).peek(0x10000).unwrap();
        unsafe {
            assert_eq!(crate::frame::ppn_kva(p.ppn()).as_ptr().add(64).read(), 0xAB);
            assert_eq!(crate::frame::ppn_kva(c.ppn()).as_ptr().add(64).read(), 0xCD);
        }
    }

    #[test]
    fn teardown_returns_every_frame() {
        let _env = testenv::lock();
        let before = crate::frame::outstanding();
        {
            let mut vs = fresh();
            vs.init_code(&[0x77u8; 3000]);
            let child = vs.try_clone().unwrap();
            drop(child);
            drop(vs);
        }
        assert_eq!(crate::frame::outstanding(), before);
    }

    #[test]
    fn debug_dumps_handle_empty_and_live_spaces() {
        let _env = testenv::lock();
        let mut vs = fresh();
        vs.dump_stack();
        vs.dump_code();
        vs.init_code(&[0u8; 32]);
        vs.dump_stack();
        vs.dump_code();
    }

    #[test]
    fn descriptor_chain_spans_multiple_nodes() {
        let _env = testenv::lock();
        let mut vs = fresh();
        let code = vs.region_mut(RegionKind::Code);
        code.set_va_base(0x40_0000);
        // An index beyond one node's worth of slots must land in
        // the second node.
        let far = 0x40_0000 + (SLOTS + 3) * PAGE_SIZE;
        code.page_info(far).unwrap();
        let head = code.pages.unwrap();
        assert!(unsafe { head.as_ref() }.next.is_some());
        // And the returned slot is stable across lookups.
        let a: *const PageInfo = code.page_info(far).unwrap();
        let b: *const PageInfo = code.peek(far).unwrap();
        assert_eq!(a, b);
    }
}
