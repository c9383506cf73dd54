// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The file-system seam.
//!
//! Code loading needs exactly two things from the file system:
//! resolving a path to an inode and reading bytes at an offset.
//! The traits here capture that contract without dragging the
//! rest of the file system in.  Resolution hands back a handle
//! that the file system keeps valid (and locked, if it locks) for
//! the handle's lifetime; dropping the handle releases it.

/// A resolved, readable inode.
pub trait Inode {
    /// Reads up to `dst.len()` bytes starting at byte offset
    /// `off`, returning the number of bytes actually read.  A
    /// short count means end-of-file or an I/O error; callers
    /// that need exact reads treat it as failure.  May block on
    /// device I/O.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> usize;
}

/// Path resolution.
pub trait Vfs {
    type File: Inode;

    /// Resolves `path` to an inode handle, or None if the path
    /// does not name one.
    fn resolve(&self, path: &str) -> Option<Self::File>;
}
