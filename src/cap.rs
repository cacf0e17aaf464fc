// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use kvm_sys::*;

/// A capability the kernel's virtualization subsystem can advertise, queried
/// with `Kvm::check_extension` or `Vm::check_extension`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Cap {
    Irqchip = KVM_CAP_IRQCHIP,
    Hlt = KVM_CAP_HLT,
    UserMemory = KVM_CAP_USER_MEMORY,
    ExtCpuid = KVM_CAP_EXT_CPUID,
    NrVcpus = KVM_CAP_NR_VCPUS,
    NrMemslots = KVM_CAP_NR_MEMSLOTS,
    Pit2 = KVM_CAP_PIT2,
    PitState2 = KVM_CAP_PIT_STATE2,
    ImmediateExit = KVM_CAP_IMMEDIATE_EXIT,
}
