// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::path::Path;

use sys_util::pagesize;
use sys_util::MemoryMapping;
use vmcore::*;

fn kvm_available() -> bool {
    if Path::new("/dev/kvm").exists() {
        true
    } else {
        println!("testing skipped, /dev/kvm not available");
        false
    }
}

#[test]
fn new() {
    if !kvm_available() {
        return;
    }
    Kvm::new().unwrap();
}

#[test]
fn api_version() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    assert_eq!(kvm.get_api_version().unwrap() as u32, kvm_sys::KVM_API_VERSION);
}

#[test]
fn missing_device_node() {
    let res = Kvm::new_with_path(Path::new("/dev/kvm-does-not-exist"));
    assert!(matches!(res, Err(Error::DeviceUnavailable(_))));
}

#[test]
fn non_kvm_node_fails_probe() {
    // A regular file opens fine but rejects the version ioctl.
    let file = tempfile::NamedTempFile::new().unwrap();
    let res = Kvm::new_with_path(file.path());
    assert!(matches!(res, Err(Error::ProbeError(_))));
}

#[test]
fn vcpu_mmap_size() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mmap_size = kvm.get_vcpu_mmap_size().unwrap();
    let page_size = pagesize();
    assert!(mmap_size >= page_size);
    assert!(mmap_size % page_size == 0);
}

#[test]
fn create_vm() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    Vm::new(&kvm).unwrap();
}

#[test]
fn check_extension() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    assert!(kvm.check_extension(Cap::UserMemory));
    assert!(kvm.check_extension(Cap::Irqchip));
}

#[test]
fn check_vm_extension() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let vm = Vm::new(&kvm).unwrap();
    assert!(vm.check_extension(Cap::UserMemory));
}

#[test]
fn add_memory() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let mem = MemoryMapping::new(pagesize() * 4).unwrap();
    vm.add_memory_region(GuestAddress(0x1000), Box::new(mem), false, false)
        .unwrap();
    assert_eq!(vm.regions().num_regions(), 1);
}

#[test]
fn add_memory_ro() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let mem = MemoryMapping::new(pagesize()).unwrap();
    vm.add_memory_region(GuestAddress(0x1000), Box::new(mem), true, false)
        .unwrap();
}

#[test]
fn remove_memory_region() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let mem = MemoryMapping::new(pagesize()).unwrap();
    let slot = vm
        .add_memory_region(GuestAddress(0x1000), Box::new(mem), false, false)
        .unwrap();
    let removed_mem = vm.remove_memory_region(slot).unwrap();
    assert_eq!(removed_mem.size(), pagesize());
    assert_eq!(vm.regions().num_regions(), 0);
}

#[test]
fn remove_invalid_memory() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    assert!(matches!(
        vm.remove_memory_region(0),
        Err(Error::UnknownRegion(0))
    ));
}

#[test]
fn overlap_memory() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let mem = MemoryMapping::new(pagesize() * 4).unwrap();
    vm.add_memory_region(GuestAddress(0x2000), Box::new(mem), false, false)
        .unwrap();
    let overlapping = MemoryMapping::new(pagesize() * 4).unwrap();
    assert!(vm.overlaps(GuestAddress(0x4000), (pagesize() * 4) as u64));
    let res = vm.add_memory_region(GuestAddress(0x4000), Box::new(overlapping), false, false);
    assert!(matches!(res, Err(Error::MemoryInstallError(_))));
    // A rejected install leaves the region set untouched.
    assert_eq!(vm.regions().num_regions(), 1);
}

#[test]
fn unaligned_memory_rejected() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let mem = MemoryMapping::new(pagesize()).unwrap();
    let res = vm.add_memory_region(GuestAddress(0x1001), Box::new(mem), false, false);
    assert!(matches!(res, Err(Error::MemoryInstallError(_))));
    let short = MemoryMapping::new(pagesize() + 1).unwrap();
    let res = vm.add_memory_region(GuestAddress(0x1000), Box::new(short), false, false);
    assert!(matches!(res, Err(Error::MemoryInstallError(_))));
    assert_eq!(vm.regions().num_regions(), 0);
}

#[test]
fn slots_are_not_reused() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let mem = MemoryMapping::new(pagesize()).unwrap();
    let first = vm
        .add_memory_region(GuestAddress(0x1000), Box::new(mem), false, false)
        .unwrap();
    vm.remove_memory_region(first).unwrap();
    let mem = MemoryMapping::new(pagesize()).unwrap();
    let second = vm
        .add_memory_region(GuestAddress(0x1000), Box::new(mem), false, false)
        .unwrap();
    assert_ne!(first, second);
    assert!(matches!(
        vm.remove_memory_region(first),
        Err(Error::UnknownRegion(slot)) if slot == first
    ));
}

#[test]
fn get_memory() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let mem = MemoryMapping::new(pagesize()).unwrap();
    mem.write_obj(0x6704u16, 16).unwrap();
    vm.add_memory_region(GuestAddress(0x10000), Box::new(mem), false, false)
        .unwrap();
    let host = vm.get_host_address(GuestAddress(0x10010), 2).unwrap();
    // Safe because the region stays installed for the rest of the test.
    let value = unsafe { std::ptr::read_volatile(host as *const u16) };
    assert_eq!(value, 0x6704);
    assert!(vm.get_host_address(GuestAddress(0x20000), 1).is_none());
}

#[test]
fn regions_handle_reads_off_thread() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let mem = MemoryMapping::new(pagesize()).unwrap();
    vm.add_memory_region(GuestAddress(0x1000), Box::new(mem), false, false)
        .unwrap();
    let regions = vm.regions();
    let handle = std::thread::spawn(move || {
        assert_eq!(regions.num_regions(), 1);
        assert!(regions.overlaps(GuestAddress(0x1800), 8));
        assert!(!regions.overlaps(GuestAddress(0x3000), 8));
    });
    handle.join().unwrap();
}

#[test]
fn create_vcpu() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let vcpu = vm.create_vcpu(0).unwrap();
    assert_eq!(vcpu.index(), 0);
    assert_eq!(vcpu.state(), RunState::Configured);
}

#[test]
fn duplicate_vcpu_index() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let _vcpu = vm.create_vcpu(0).unwrap();
    assert!(matches!(vm.create_vcpu(0), Err(Error::DuplicateIndex(0))));
    vm.create_vcpu(1).unwrap();
}

#[test]
fn irqchip_only_once() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    vm.create_irq_chip().unwrap();
    assert_eq!(vm.create_irq_chip(), Err(Error::AlreadyCreated));
}

#[test]
fn pit_only_once() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    vm.create_irq_chip().unwrap();
    vm.create_pit(false).unwrap();
    assert_eq!(vm.create_pit(true), Err(Error::AlreadyCreated));
}

#[test]
fn pit_handling() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    vm.create_irq_chip().unwrap();
    vm.create_pit(true).unwrap();
    let pit_state = vm.get_pit_state().unwrap();
    assert_eq!(pit_state.flags, kvm_sys::KVM_PIT_SPEAKER_DUMMY);
    vm.set_pit_state(&pit_state).unwrap();
}

#[test]
fn set_irq_line_needs_irqchip() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let vm = Vm::new(&kvm).unwrap();
    assert!(matches!(
        vm.set_irq_line(4, true),
        Err(Error::InvalidInterruptState(_))
    ));
}

#[test]
fn inject_interrupt_with_irqchip() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    vm.create_irq_chip().unwrap();
    vm.inject_interrupt(0, 4).unwrap();
}

#[test]
fn inject_interrupt_unknown_vcpu() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let vm = Vm::new(&kvm).unwrap();
    assert!(matches!(
        vm.inject_interrupt(0, 32),
        Err(Error::InvalidInterruptState(_))
    ));
}

#[test]
fn inject_interrupt_queues_one_vector() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let _vcpu = vm.create_vcpu(0).unwrap();
    vm.inject_interrupt(0, 32).unwrap();
    assert!(matches!(
        vm.inject_interrupt(0, 33),
        Err(Error::InvalidInterruptState(_))
    ));
}

#[test]
fn inject_interrupt_vector_range() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let _vcpu = vm.create_vcpu(0).unwrap();
    assert_eq!(
        vm.inject_interrupt(0, 256),
        Err(Error::InvalidInterruptState(SysError::new(libc::EINVAL)))
    );
}

#[test]
fn get_set_regs() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let vcpu = vm.create_vcpu(0).unwrap();
    let mut regs = vcpu.get_regs().unwrap();
    regs.rbx = 0x55;
    regs.rip = 0x1000;
    vcpu.set_regs(&regs).unwrap();
    let read_back = vcpu.get_regs().unwrap();
    assert_eq!(read_back.rbx, 0x55);
    assert_eq!(read_back.rip, 0x1000);
}

#[test]
fn get_set_sregs() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let vcpu = vm.create_vcpu(0).unwrap();
    let mut sregs = vcpu.get_sregs().unwrap();
    sregs.cs.base = 0;
    sregs.cs.selector = 0;
    vcpu.set_sregs(&sregs).unwrap();
    let read_back = vcpu.get_sregs().unwrap();
    assert_eq!(read_back.cs.base, 0);
    assert_eq!(read_back.cs.selector, 0);
}

#[test]
fn destroy_twice() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let mut vcpu = vm.create_vcpu(0).unwrap();
    vcpu.destroy().unwrap();
    assert_eq!(vcpu.state(), RunState::Terminated);
    assert_eq!(vcpu.destroy(), Err(Error::AlreadyTerminated));
}

#[test]
fn destroyed_vcpu_operations_fail() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let mut vcpu = vm.create_vcpu(0).unwrap();
    vcpu.destroy().unwrap();
    assert_eq!(vcpu.get_regs(), Err(Error::HandleClosed));
    assert_eq!(vcpu.get_sregs(), Err(Error::HandleClosed));
    assert_eq!(vcpu.set_data(&[0]), Err(Error::HandleClosed));
    assert_eq!(vcpu.set_immediate_exit(true), Err(Error::HandleClosed));
    assert!(matches!(vcpu.to_runnable(), Err(Error::HandleClosed)));
}

#[test]
fn one_runnable_per_thread() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let vcpu0 = vm.create_vcpu(0).unwrap();
    let vcpu1 = vm.create_vcpu(1).unwrap();
    let runnable = vcpu0.to_runnable().unwrap();
    assert!(matches!(vcpu1.to_runnable(), Err(Error::RunError(_))));
    drop(runnable);
    let vcpu2 = vm.create_vcpu(2).unwrap();
    vcpu2.to_runnable().unwrap();
}

#[test]
fn immediate_exit_interrupts_entry() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let vcpu = vm.create_vcpu(0).unwrap();
    vcpu.set_immediate_exit(true).unwrap();
    let runnable = vcpu.to_runnable().unwrap();
    assert_eq!(runnable.run(), Err(Error::Interrupted));
    // The request stays armed until cleared.
    assert_eq!(runnable.run(), Err(Error::Interrupted));
    assert_eq!(runnable.state(), RunState::Configured);
}

#[test]
fn destroy_through_runnable_unbinds_thread() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let vcpu = vm.create_vcpu(0).unwrap();
    let mut runnable = vcpu.to_runnable().unwrap();
    runnable.destroy().unwrap();
    // The kick must not touch the run page of a destroyed vcpu.
    Vcpu::set_local_immediate_exit(true);
    assert_eq!(runnable.state(), RunState::Terminated);
    assert_eq!(runnable.run(), Err(Error::HandleClosed));

    // The thread is free again, and the stale handle's drop must not evict
    // the vcpu bound after it.
    let vcpu1 = vm.create_vcpu(1).unwrap();
    let runnable1 = vcpu1.to_runnable().unwrap();
    drop(runnable);
    Vcpu::set_local_immediate_exit(true);
    assert_eq!(runnable1.run(), Err(Error::Interrupted));
}

#[test]
fn local_immediate_exit_reaches_bound_vcpu() {
    if !kvm_available() {
        return;
    }
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let vcpu = vm.create_vcpu(0).unwrap();
    // Without a bound vcpu this is a no-op.
    Vcpu::set_local_immediate_exit(true);
    let runnable = vcpu.to_runnable().unwrap();
    Vcpu::set_local_immediate_exit(true);
    assert_eq!(runnable.run(), Err(Error::Interrupted));
    Vcpu::set_local_immediate_exit(false);
    drop(runnable);
}
