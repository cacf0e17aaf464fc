// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The mmap module provides a safe interface to map memory and ensures
//! unmap is called when the mapping goes out of scope.

use std::cmp::min;
use std::fs::File;
use std::mem::size_of;
use std::ptr::copy_nonoverlapping;
use std::ptr::null_mut;
use std::ptr::read_unaligned;
use std::ptr::write_unaligned;

use libc::c_int;
use libc::off_t;
use libc::PROT_READ;
use libc::PROT_WRITE;
use remain::sorted;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::descriptor::AsRawDescriptor;
use crate::descriptor::RawDescriptor;
use crate::errno::Error as ErrnoError;

#[sorted]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("requested memory out of range")]
    InvalidAddress,
    #[error("requested offset is out of range of off_t")]
    InvalidOffset,
    #[error("mmap related system call failed: {0}")]
    SystemCallFailed(#[source] ErrnoError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Memory access type for a memory mapping.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct Protection {
    read: bool,
    write: bool,
}

impl Protection {
    /// Returns Protection allowing read/write access.
    #[inline(always)]
    pub fn read_write() -> Protection {
        Protection {
            read: true,
            write: true,
        }
    }

    /// Returns Protection allowing read access.
    #[inline(always)]
    pub fn read() -> Protection {
        Protection {
            read: true,
            ..Default::default()
        }
    }
}

impl From<Protection> for c_int {
    #[inline(always)]
    fn from(p: Protection) -> Self {
        let mut value = 0;
        if p.read {
            value |= PROT_READ;
        }
        if p.write {
            value |= PROT_WRITE;
        }
        value
    }
}

/// A trait for types that expose a contiguous host memory range that can be
/// handed to the kernel as guest backing.
///
/// # Safety
/// Implementations must guarantee that `as_ptr` stays valid for `size` bytes
/// for the whole lifetime of the object and that the range is never remapped
/// or shrunk while it is installed in a guest.
pub unsafe trait MappedRegion: Send + Sync {
    /// Returns a pointer to the beginning of the memory region.
    fn as_ptr(&self) -> *mut u8;

    /// Returns the size of the memory region in bytes.
    fn size(&self) -> usize;
}

/// Wraps an anonymous or file-backed shared memory mapping in the current
/// process. Unmaps on drop.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut u8,
    size: usize,
}

// Safe because the pointer and size describe memory owned by this mapping
// for its whole lifetime, and all accessors bounds check against `size`.
unsafe impl Send for MemoryMapping {}
unsafe impl Sync for MemoryMapping {}

// Safe because the mapping stays valid and fixed until drop.
unsafe impl MappedRegion for MemoryMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl MemoryMapping {
    /// Creates an anonymous shared, read/write mapping of `size` bytes.
    pub fn new(size: usize) -> Result<MemoryMapping> {
        // Safe because no fixed address is requested and the result is
        // checked before use.
        unsafe { MemoryMapping::try_mmap(size, Protection::read_write().into(), None) }
    }

    unsafe fn try_mmap(
        size: usize,
        prot: c_int,
        fd: Option<(RawDescriptor, u64)>,
    ) -> Result<MemoryMapping> {
        let mut flags = libc::MAP_SHARED;
        if fd.is_none() {
            flags |= libc::MAP_ANONYMOUS;
        }
        let (raw_fd, offset) = fd.unwrap_or((-1, 0));
        if offset > off_t::MAX as u64 {
            return Err(Error::InvalidOffset);
        }

        let addr = libc::mmap(null_mut(), size, prot, flags, raw_fd, offset as off_t);
        if addr == libc::MAP_FAILED {
            return Err(Error::SystemCallFailed(ErrnoError::last()));
        }

        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    /// Returns a pointer to the beginning of the mapping. Callers must only
    /// dereference within the mapped size.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    /// Returns the length of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Writes `buf` into the mapping starting at `offset`, truncating at the
    /// end of the mapping, and returns the number of bytes copied.
    pub fn write_slice(&self, buf: &[u8], offset: usize) -> Result<usize> {
        match self.size.checked_sub(offset) {
            Some(size_past_offset) => {
                let bytes_copied = min(size_past_offset, buf.len());
                // Safe because the copy length is bounded by both buffers
                // and a slice can never alias this mapping.
                unsafe {
                    copy_nonoverlapping(buf.as_ptr(), self.addr.add(offset), bytes_copied);
                }
                Ok(bytes_copied)
            }
            None => Err(Error::InvalidAddress),
        }
    }

    /// Reads from the mapping starting at `offset` into `buf`, truncating at
    /// the end of the mapping, and returns the number of bytes copied.
    pub fn read_slice(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        match self.size.checked_sub(offset) {
            Some(size_past_offset) => {
                let bytes_copied = min(size_past_offset, buf.len());
                // Safe because the copy length is bounded by both buffers
                // and a slice can never alias this mapping.
                unsafe {
                    copy_nonoverlapping(self.addr.add(offset), buf.as_mut_ptr(), bytes_copied);
                }
                Ok(bytes_copied)
            }
            None => Err(Error::InvalidAddress),
        }
    }

    /// Writes an object to the mapping at the given offset. Fails if the
    /// object would extend past the end.
    pub fn write_obj<T: IntoBytes + Immutable>(&self, val: T, offset: usize) -> Result<()> {
        self.range_end(offset, size_of::<T>())?;
        // Safe because the bounds were checked above and T is plain data.
        unsafe {
            write_unaligned(self.addr.add(offset) as *mut T, val);
        }
        Ok(())
    }

    /// Reads an object from the mapping at the given offset. Fails if the
    /// object would extend past the end.
    pub fn read_obj<T: FromBytes>(&self, offset: usize) -> Result<T> {
        self.range_end(offset, size_of::<T>())?;
        // Safe because the bounds were checked above and any bit pattern is
        // a valid T.
        unsafe { Ok(read_unaligned(self.addr.add(offset) as *const T)) }
    }

    fn range_end(&self, offset: usize, count: usize) -> Result<usize> {
        let mem_end = offset.checked_add(count).ok_or(Error::InvalidAddress)?;
        if mem_end > self.size {
            return Err(Error::InvalidAddress);
        }
        Ok(mem_end)
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // Safe because this mapping was created by mmap with this address
        // and size and nothing else unmaps it first.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

/// Builder for a `MemoryMapping`, optionally file-backed.
pub struct MemoryMappingBuilder<'a> {
    size: usize,
    descriptor: Option<&'a dyn AsRawDescriptor>,
    offset: Option<u64>,
    protection: Option<Protection>,
}

impl<'a> MemoryMappingBuilder<'a> {
    /// Creates a new builder specifying size of the memory region in bytes.
    pub fn new(size: usize) -> MemoryMappingBuilder<'a> {
        MemoryMappingBuilder {
            size,
            descriptor: None,
            offset: None,
            protection: None,
        }
    }

    /// Backs the mapping with `file` instead of anonymous memory.
    pub fn from_file(mut self, file: &'a File) -> MemoryMappingBuilder<'a> {
        self.descriptor = Some(file as &dyn AsRawDescriptor);
        self
    }

    /// Maps starting at `offset` bytes from the beginning of the file.
    pub fn offset(mut self, offset: u64) -> MemoryMappingBuilder<'a> {
        self.offset = Some(offset);
        self
    }

    /// Sets the access protection of the mapping. Defaults to read/write.
    pub fn protection(mut self, protection: Protection) -> MemoryMappingBuilder<'a> {
        self.protection = Some(protection);
        self
    }

    /// Builds the memory mapping.
    pub fn build(self) -> Result<MemoryMapping> {
        let prot = self.protection.unwrap_or_else(Protection::read_write);
        match self.descriptor {
            // Safe because the descriptor is kept open by the caller for the
            // duration of the call and the result is checked.
            Some(fd) => unsafe {
                MemoryMapping::try_mmap(
                    self.size,
                    prot.into(),
                    Some((fd.as_raw_descriptor(), self.offset.unwrap_or(0))),
                )
            },
            None => {
                // Safe because no fixed address is requested and the result
                // is checked.
                unsafe { MemoryMapping::try_mmap(self.size, prot.into(), None) }
            }
        }
    }
}
