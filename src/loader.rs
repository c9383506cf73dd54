// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parses an on-disk ELF executable and loads it into a process's
//! code region, reading through the file-system seam.

extern crate alloc;

use crate::fs::{Inode, Vfs};
use crate::mem::{self, Perms, PAGE_SIZE};
use crate::vspace::{RegionKind, VSpace};
use crate::{Error, Result};
use alloc::vec;
use alloc::vec::Vec;
use goblin::container::{Container, Ctx, Endian};
use goblin::elf::program_header::{PF_W, PT_LOAD};
use goblin::elf::ProgramHeader;
use goblin::elf::{self, Elf};

/// Loads the executable at `path` into the address space's code
/// region and places the heap region one guard page past the end
/// of the code.  Returns the image's ELF entry point, the first
/// user instruction to execute.
///
/// Segment data comes straight off the inode into the backing
/// frames; `memsz` bytes beyond `filesz` stay zero (BSS).  On any
/// failure the inode handle is released and whatever partial
/// region state exists is left for the address space's eventual
/// teardown.
pub fn load_code<V: Vfs>(vs: &mut VSpace, fs: &V, path: &str) -> Result<u64> {
    let ip = fs.resolve(path).ok_or(Error::NoSuchFile)?;
    let header = read_header(&ip)?;
    let phdrs = read_program_headers(&ip, &header)?;

    let mut code_end: usize = 0;
    let mut first = true;
    for ph in phdrs.iter().filter(|ph| ph.p_type == PT_LOAD) {
        if ph.p_memsz < ph.p_filesz {
            return Err(Error::Elf("segment memory size below file size"));
        }
        let end = ph
            .p_vaddr
            .checked_add(ph.p_memsz)
            .ok_or(Error::Elf("segment address range wraps"))?;
        let vaddr = ph.p_vaddr as usize;
        if vaddr % PAGE_SIZE != 0 {
            return Err(Error::Elf("segment is not page aligned"));
        }
        let code = vs.region_mut(RegionKind::Code);
        if first {
            code.set_va_base(mem::page_round_down(vaddr));
            first = false;
        }
        let perms = Perms::new(true, ph.p_flags & PF_W != 0);
        code.add_mapping(vaddr, ph.p_memsz as usize, perms)?;
        code.load_from(vaddr, &ip, ph.p_offset, ph.p_filesz as usize)?;
        code_end = usize::max(code_end, end as usize);
        log::debug!(
            "load {path}: segment at {vaddr:#x} filesz={:#x} memsz={:#x} writable={}",
            ph.p_filesz,
            ph.p_memsz,
            perms.writable(),
        );
    }
    if first {
        return Err(Error::Elf("no loadable segments"));
    }

    let code = vs.region_mut(RegionKind::Code);
    let base = code.va_base();
    code.set_size(code_end - base);

    // Reserve the heap one guard page past the code, empty until
    // the process grows it.
    let heap = vs.region_mut(RegionKind::Heap);
    heap.set_va_base(mem::page_round_up(code_end) + PAGE_SIZE);
    heap.set_size(0);

    log::debug!("load {path}: entry {:#x}", header.e_entry);
    Ok(header.e_entry)
}

/// Reads and validates the ELF header.  Note that much of the
/// heavy lifting of validating the header (magic included) is
/// done by the parsing library.
fn read_header<I: Inode>(ip: &I) -> Result<elf::Header> {
    let mut bytes = [0u8; elf::header::header64::SIZEOF_EHDR];
    if ip.read_at(0, &mut bytes) != bytes.len() {
        return Err(Error::Elf("short header read"));
    }
    let header = Elf::parse_header(&bytes).map_err(|_| Error::Elf("unparseable header"))?;
    if header.e_machine != elf::header::EM_X86_64 {
        return Err(Error::Elf("incorrect machine architecture"));
    }
    let container = header.container().map_err(|_| Error::Elf("bad class"))?;
    if container != Container::Big {
        return Err(Error::Elf("object file is not 64-bit"));
    }
    let endian = header.endianness().map_err(|_| Error::Elf("bad endianness"))?;
    if endian != Endian::Little {
        return Err(Error::Elf("object file is not little-endian"));
    }
    if header.e_type != elf::header::ET_EXEC {
        return Err(Error::Elf("object file is not executable"));
    }
    if header.e_entry == 0 {
        return Err(Error::Elf("binary has nil entry point"));
    }
    if header.e_ident[elf::header::EI_VERSION] != elf::header::EV_CURRENT
        || header.e_version != elf::header::EV_CURRENT.into()
    {
        return Err(Error::Elf("bad ELF version number"));
    }
    Ok(header)
}

/// Reads and parses the program header table.  Only the table is
/// pulled off disk; section headers, symbols and strings are
/// never touched.
fn read_program_headers<I: Inode>(
    ip: &I,
    header: &elf::Header,
) -> Result<Vec<ProgramHeader>> {
    const PHENTSIZE: usize = elf::program_header::program_header64::SIZEOF_PHDR;
    if header.e_phentsize as usize != PHENTSIZE {
        return Err(Error::Elf("unexpected program header size"));
    }
    let count = header.e_phnum as usize;
    let mut bytes = vec![0u8; count * PHENTSIZE];
    if ip.read_at(header.e_phoff, &mut bytes) != bytes.len() {
        return Err(Error::Elf("short program header read"));
    }
    let ctx = Ctx::new(Container::Big, Endian::Little);
    ProgramHeader::parse(&bytes, 0, count, ctx)
        .map_err(|_| Error::Elf("cannot parse program headers"))
}
