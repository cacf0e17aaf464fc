// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Classification of the exit record the kernel leaves in a vcpu's run page
//! after every vm exit.

use std::mem::offset_of;
use std::mem::size_of;

use kvm_sys::*;
use libc::EPROTO;
use sys_util::unaligned::load_u16_ne;
use sys_util::unaligned::load_u32_ne;
use sys_util::unaligned::load_u64_ne;

use crate::Error;
use crate::Result;
use crate::SysError;

/// Direction of an I/O or memory mapped access performed by the guest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoDirection {
    /// The guest reads and expects data supplied with `Vcpu::set_data`.
    Read,
    /// The guest wrote the value carried in the event.
    Write,
}

/// A vm exit classified from the run page, forwarded to the device layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitEvent {
    /// A port I/O access. `size` is the total transfer length in bytes and
    /// `data` the first element of a write, zero for a read.
    PortIo {
        port: u16,
        size: usize,
        direction: IoDirection,
        data: u32,
    },
    /// A memory mapped I/O access outside any installed region. `data`
    /// carries the written value for a write, zero for a read.
    Mmio {
        address: u64,
        size: usize,
        direction: IoDirection,
        data: u64,
    },
    /// The guest executed a halt instruction.
    Halt,
    /// The guest requested shutdown, for example via triple fault.
    Shutdown,
    /// The kernel failed to emulate on the guest's behalf.
    InternalError { code: u32 },
    /// The guest can accept an interrupt injection now.
    InterruptWindow,
    /// An exit reason this crate does not decode.
    Unhandled { raw: u32 },
}

const EXIT_PAYLOAD: usize = offset_of!(kvm_run, exit);

fn malformed() -> Error {
    Error::RunError(SysError::new(EPROTO))
}

/// Decodes the exit record in `page`, the full run page mapping of a vcpu
/// that has returned from an entry.
///
/// Pure classification: nothing is read from or written to the kernel. Fails
/// if the record is truncated or its payload points outside the page.
pub fn classify(page: &[u8]) -> Result<ExitEvent> {
    if page.len() < size_of::<kvm_run>() {
        return Err(malformed());
    }
    let reason = load_u32_ne(&page[offset_of!(kvm_run, exit_reason)..]);
    let payload = &page[EXIT_PAYLOAD..];
    match reason {
        KVM_EXIT_IO => {
            let direction = match payload[offset_of!(kvm_run_io, direction)] {
                KVM_EXIT_IO_IN => IoDirection::Read,
                KVM_EXIT_IO_OUT => IoDirection::Write,
                _ => return Err(malformed()),
            };
            let size = payload[offset_of!(kvm_run_io, size)] as usize;
            if !matches!(size, 1 | 2 | 4) {
                return Err(malformed());
            }
            let port = load_u16_ne(&payload[offset_of!(kvm_run_io, port)..]);
            let count = load_u32_ne(&payload[offset_of!(kvm_run_io, count)..]) as usize;
            let data_offset = load_u64_ne(&payload[offset_of!(kvm_run_io, data_offset)..]) as usize;
            let total = count.checked_mul(size).ok_or_else(malformed)?;
            let end = data_offset.checked_add(total).ok_or_else(malformed)?;
            if count == 0 || end > page.len() {
                return Err(malformed());
            }
            let data = match direction {
                IoDirection::Write => match size {
                    1 => page[data_offset] as u32,
                    2 => load_u16_ne(&page[data_offset..]) as u32,
                    _ => load_u32_ne(&page[data_offset..]),
                },
                IoDirection::Read => 0,
            };
            Ok(ExitEvent::PortIo {
                port,
                size: total,
                direction,
                data,
            })
        }
        KVM_EXIT_MMIO => {
            let address = load_u64_ne(&payload[offset_of!(kvm_run_mmio, phys_addr)..]);
            let size = load_u32_ne(&payload[offset_of!(kvm_run_mmio, len)..]) as usize;
            if size > 8 {
                return Err(malformed());
            }
            let direction = if payload[offset_of!(kvm_run_mmio, is_write)] != 0 {
                IoDirection::Write
            } else {
                IoDirection::Read
            };
            let data = match direction {
                IoDirection::Write => {
                    let field = offset_of!(kvm_run_mmio, data);
                    let mut bytes = [0u8; 8];
                    bytes[..size].copy_from_slice(&payload[field..field + size]);
                    u64::from_ne_bytes(bytes)
                }
                IoDirection::Read => 0,
            };
            Ok(ExitEvent::Mmio {
                address,
                size,
                direction,
                data,
            })
        }
        KVM_EXIT_HLT => Ok(ExitEvent::Halt),
        KVM_EXIT_SHUTDOWN => Ok(ExitEvent::Shutdown),
        KVM_EXIT_IRQ_WINDOW_OPEN => Ok(ExitEvent::InterruptWindow),
        KVM_EXIT_INTERNAL_ERROR => {
            let code = load_u32_ne(&payload[offset_of!(kvm_run_internal, suberror)..]);
            Ok(ExitEvent::InternalError { code })
        }
        raw => Ok(ExitEvent::Unhandled { raw }),
    }
}
