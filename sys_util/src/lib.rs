// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Small system utility modules for usage by other modules.

mod descriptor;
mod errno;
pub mod ioctl;
mod mmap;
pub mod unaligned;

pub use crate::descriptor::AsRawDescriptor;
pub use crate::descriptor::FromRawDescriptor;
pub use crate::descriptor::IntoRawDescriptor;
pub use crate::descriptor::RawDescriptor;
pub use crate::errno::errno_result;
pub use crate::errno::Error;
pub use crate::errno::Result;
pub use crate::ioctl::ioctl;
pub use crate::ioctl::ioctl_with_mut_ptr;
pub use crate::ioctl::ioctl_with_mut_ref;
pub use crate::ioctl::ioctl_with_ptr;
pub use crate::ioctl::ioctl_with_ref;
pub use crate::ioctl::ioctl_with_val;
pub use crate::ioctl::IoctlNr;
pub use crate::mmap::Error as MmapError;
pub use crate::mmap::MappedRegion;
pub use crate::mmap::MemoryMapping;
pub use crate::mmap::MemoryMappingBuilder;
pub use crate::mmap::Protection;
pub use crate::mmap::Result as MmapResult;

/// Returns the system page size in bytes.
pub fn pagesize() -> usize {
    // Safe because sysconf is always safe to call and _SC_PAGESIZE cannot
    // fail on Linux.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Rounds `v` up to the nearest multiple of the system page size.
pub fn round_up_to_page_size(v: usize) -> usize {
    let page_mask = pagesize() - 1;
    (v + page_mask) & !page_mask
}
