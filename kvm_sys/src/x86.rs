// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! x86_64 layouts of the KVM structures shared with the kernel, kept in sync
//! with the kernel UAPI headers by the size and offset checks below.

use static_assertions::const_assert_eq;
use sys_util::ioctl_ior_nr;
use sys_util::ioctl_iow_nr;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::KVMIO;

ioctl_iow_nr!(KVM_SET_USER_MEMORY_REGION, KVMIO, 0x46, kvm_userspace_memory_region);
ioctl_iow_nr!(KVM_IRQ_LINE, KVMIO, 0x61, kvm_irq_level);
ioctl_iow_nr!(KVM_CREATE_PIT2, KVMIO, 0x77, kvm_pit_config);
ioctl_ior_nr!(KVM_GET_REGS, KVMIO, 0x81, kvm_regs);
ioctl_iow_nr!(KVM_SET_REGS, KVMIO, 0x82, kvm_regs);
ioctl_ior_nr!(KVM_GET_SREGS, KVMIO, 0x83, kvm_sregs);
ioctl_iow_nr!(KVM_SET_SREGS, KVMIO, 0x84, kvm_sregs);
ioctl_iow_nr!(KVM_INTERRUPT, KVMIO, 0x86, kvm_interrupt);
ioctl_ior_nr!(KVM_GET_PIT2, KVMIO, 0x9f, kvm_pit_state2);
ioctl_iow_nr!(KVM_SET_PIT2, KVMIO, 0xa0, kvm_pit_state2);

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct kvm_regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct kvm_segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
    pub unusable: u8,
    pub padding: u8,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct kvm_dtable {
    pub base: u64,
    pub limit: u16,
    pub padding: [u16; 3],
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct kvm_sregs {
    pub cs: kvm_segment,
    pub ds: kvm_segment,
    pub es: kvm_segment,
    pub fs: kvm_segment,
    pub gs: kvm_segment,
    pub ss: kvm_segment,
    pub tr: kvm_segment,
    pub ldt: kvm_segment,
    pub gdt: kvm_dtable,
    pub idt: kvm_dtable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    pub interrupt_bitmap: [u64; 4],
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct kvm_userspace_memory_region {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct kvm_pit_config {
    pub flags: u32,
    pub pad: [u32; 15],
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct kvm_pit_channel_state {
    pub count: u32,
    pub latched_count: u16,
    pub count_latched: u8,
    pub status_latched: u8,
    pub status: u8,
    pub read_state: u8,
    pub write_state: u8,
    pub write_latch: u8,
    pub rw_mode: u8,
    pub mode: u8,
    pub bcd: u8,
    pub gate: u8,
    pub count_load_time: i64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct kvm_pit_state2 {
    pub channels: [kvm_pit_channel_state; 3],
    pub flags: u32,
    pub reserved: [u32; 9],
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct kvm_interrupt {
    pub irq: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct kvm_irq_level {
    pub irq: u32,
    pub level: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct kvm_run_hw {
    pub hardware_exit_reason: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct kvm_run_fail_entry {
    pub hardware_entry_failure_reason: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct kvm_run_io {
    pub direction: u8,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    pub data_offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct kvm_run_mmio {
    pub phys_addr: u64,
    pub data: [u8; 8],
    pub len: u32,
    pub is_write: u8,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct kvm_run_internal {
    pub suberror: u32,
    pub ndata: u32,
    pub data: [u64; 16],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union kvm_run_exit {
    pub hw: kvm_run_hw,
    pub fail_entry: kvm_run_fail_entry,
    pub io: kvm_run_io,
    pub mmio: kvm_run_mmio,
    pub internal: kvm_run_internal,
    pub padding: [u8; 256],
}

impl Default for kvm_run_exit {
    fn default() -> Self {
        // Safe because an all zero pattern is valid for every union member.
        unsafe { std::mem::zeroed() }
    }
}

/// The shared kernel/userspace communication page, mapped over the region
/// returned by `KVM_GET_VCPU_MMAP_SIZE` on each vcpu descriptor.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct kvm_run {
    pub request_interrupt_window: u8,
    pub immediate_exit: u8,
    pub padding1: [u8; 6],
    pub exit_reason: u32,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub flags: u16,
    pub cr8: u64,
    pub apic_base: u64,
    pub exit: kvm_run_exit,
    pub kvm_valid_regs: u64,
    pub kvm_dirty_regs: u64,
    pub s: [u8; 2048],
}

impl Default for kvm_run {
    fn default() -> Self {
        // Safe because an all zero pattern is valid for this C structure.
        unsafe { std::mem::zeroed() }
    }
}

const_assert_eq!(std::mem::size_of::<kvm_regs>(), 144);
const_assert_eq!(std::mem::size_of::<kvm_segment>(), 24);
const_assert_eq!(std::mem::size_of::<kvm_dtable>(), 16);
const_assert_eq!(std::mem::size_of::<kvm_sregs>(), 312);
const_assert_eq!(std::mem::size_of::<kvm_userspace_memory_region>(), 32);
const_assert_eq!(std::mem::size_of::<kvm_pit_config>(), 64);
const_assert_eq!(std::mem::size_of::<kvm_pit_channel_state>(), 24);
const_assert_eq!(std::mem::size_of::<kvm_pit_state2>(), 112);
const_assert_eq!(std::mem::size_of::<kvm_interrupt>(), 4);
const_assert_eq!(std::mem::size_of::<kvm_irq_level>(), 8);
const_assert_eq!(std::mem::size_of::<kvm_run_io>(), 16);
const_assert_eq!(std::mem::size_of::<kvm_run_mmio>(), 24);
const_assert_eq!(std::mem::size_of::<kvm_run_internal>(), 136);
const_assert_eq!(std::mem::size_of::<kvm_run_exit>(), 256);
const_assert_eq!(std::mem::size_of::<kvm_run>(), 2352);

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use super::*;

    #[test]
    fn run_header_offsets() {
        assert_eq!(offset_of!(kvm_run, request_interrupt_window), 0);
        assert_eq!(offset_of!(kvm_run, immediate_exit), 1);
        assert_eq!(offset_of!(kvm_run, exit_reason), 8);
        assert_eq!(offset_of!(kvm_run, ready_for_interrupt_injection), 12);
        assert_eq!(offset_of!(kvm_run, if_flag), 13);
        assert_eq!(offset_of!(kvm_run, flags), 14);
        assert_eq!(offset_of!(kvm_run, cr8), 16);
        assert_eq!(offset_of!(kvm_run, apic_base), 24);
        assert_eq!(offset_of!(kvm_run, exit), 32);
        assert_eq!(offset_of!(kvm_run, kvm_valid_regs), 288);
        assert_eq!(offset_of!(kvm_run, kvm_dirty_regs), 296);
        assert_eq!(offset_of!(kvm_run, s), 304);
    }

    #[test]
    fn exit_payload_offsets() {
        assert_eq!(offset_of!(kvm_run_io, direction), 0);
        assert_eq!(offset_of!(kvm_run_io, size), 1);
        assert_eq!(offset_of!(kvm_run_io, port), 2);
        assert_eq!(offset_of!(kvm_run_io, count), 4);
        assert_eq!(offset_of!(kvm_run_io, data_offset), 8);

        assert_eq!(offset_of!(kvm_run_mmio, phys_addr), 0);
        assert_eq!(offset_of!(kvm_run_mmio, data), 8);
        assert_eq!(offset_of!(kvm_run_mmio, len), 16);
        assert_eq!(offset_of!(kvm_run_mmio, is_write), 20);

        assert_eq!(offset_of!(kvm_run_internal, data), 8);
    }

    #[test]
    fn sregs_offsets() {
        assert_eq!(offset_of!(kvm_sregs, tr), 144);
        assert_eq!(offset_of!(kvm_sregs, gdt), 192);
        assert_eq!(offset_of!(kvm_sregs, idt), 208);
        assert_eq!(offset_of!(kvm_sregs, cr0), 224);
        assert_eq!(offset_of!(kvm_sregs, efer), 264);
        assert_eq!(offset_of!(kvm_sregs, apic_base), 272);
        assert_eq!(offset_of!(kvm_sregs, interrupt_bitmap), 280);
    }

    #[test]
    fn pit_state_offsets() {
        assert_eq!(offset_of!(kvm_pit_channel_state, latched_count), 4);
        assert_eq!(offset_of!(kvm_pit_channel_state, gate), 15);
        assert_eq!(offset_of!(kvm_pit_channel_state, count_load_time), 16);
        assert_eq!(offset_of!(kvm_pit_state2, flags), 72);
    }
}
