// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # User virtual address-space management.
//!
//! This crate owns the per-process user address space of a small
//! x86-64 kernel.  It keeps two coupled representations in sync:
//! a portable, region-based description of what is mapped where
//! with what permissions, and the 4-level hardware paging radix
//! tree that the MMU actually walks.  The logical description is
//! authoritative; the hardware table is regenerated from it on
//! demand and is never consulted for state.
//!
//! The pieces, from the bottom up:
//!
//! * [`frame`] --- the physical frame allocator.  Every page of
//!   backing store, every paging-structure node, and every
//!   descriptor node comes from here and goes back here.
//! * [`mmu`] --- the hardware side: page-table entries, the
//!   paging radix tree, and the shared kernel mapping.
//! * [`vspace`] --- the logical side: per-page descriptors,
//!   directional regions, and the [`vspace::VSpace`] that ties
//!   three regions (code, heap, user stack) to a root table.
//! * [`loader`] --- populates a code region from an on-disk ELF
//!   image reached through the [`fs`] traits.
//! * [`cpu`] --- points the current CPU at an address space.
//!
//! When built for bare metal (`target_os = "none"`) the crate is
//! `no_std` and the hardware touch points are real instructions;
//! hosted builds record those side effects instead so the whole
//! subsystem can be exercised by ordinary unit tests.

#![cfg_attr(not(any(test, clippy)), no_std)]
#![forbid(unsafe_op_in_unsafe_fn)]

pub mod cpu;
pub mod frame;
pub mod fs;
pub mod loader;
pub mod mem;
pub mod mmu;
pub mod vspace;

/// Errors reported by address-space operations.
///
/// Resource exhaustion and bad user input are recoverable and
/// surface here; invariant violations by kernel callers (remapping
/// a live page, hiding a page that is still marked present) are
/// programming bugs and panic instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The frame allocator is out of memory.  Any partial work
    /// performed by the failing operation has been unwound.
    OutOfFrames,
    /// The requested range reaches into the kernel half of the
    /// address space (or the non-canonical hole below it).
    AddressTooHigh,
    /// No live mapping covers the requested address.
    NotMapped,
    /// The mapping exists but is read-only.
    NotWritable,
    /// Path resolution failed.
    NoSuchFile,
    /// An inode read returned fewer bytes than requested.
    ShortRead,
    /// The ELF image was rejected; the payload says why.
    Elf(&'static str),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::OutOfFrames => f.write_str("out of physical frames"),
            Error::AddressTooHigh => f.write_str("address range reaches kernel space"),
            Error::NotMapped => f.write_str("address not mapped"),
            Error::NotWritable => f.write_str("mapping is not writable"),
            Error::NoSuchFile => f.write_str("no such file"),
            Error::ShortRead => f.write_str("short read from inode"),
            Error::Elf(why) => write!(f, "ELF: {why}"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod testenv;
