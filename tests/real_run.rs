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

// Builds a vm with `code` loaded at guest address 0x1000 and a vcpu in real
// mode about to execute it.
fn load_guest(code: &[u8]) -> (Vm, Vcpu) {
    let _ = env_logger::builder().is_test(true).try_init();
    let load_addr = GuestAddress(0x1000);
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    let mem = MemoryMapping::new(pagesize()).unwrap();
    mem.write_slice(code, 0).unwrap();
    vm.add_memory_region(load_addr, Box::new(mem), false, false)
        .unwrap();

    let vcpu = vm.create_vcpu(0).unwrap();

    let mut vcpu_sregs = vcpu.get_sregs().unwrap();
    assert_ne!(vcpu_sregs.cs.base, 0);
    assert_ne!(vcpu_sregs.cs.selector, 0);
    vcpu_sregs.cs.base = 0;
    vcpu_sregs.cs.selector = 0;
    vcpu.set_sregs(&vcpu_sregs).unwrap();

    let mut vcpu_regs = vcpu.get_regs().unwrap();
    vcpu_regs.rip = load_addr.offset();
    vcpu_regs.rflags = 2;
    vcpu.set_regs(&vcpu_regs).unwrap();

    (vm, vcpu)
}

#[test]
fn adder_writes_sum_to_serial() {
    if !kvm_available() {
        return;
    }
    /*
    0000 BA F8 03             mov dx,0x3f8
    0003 00 D8                add al,bl
    0005 04 30                add al,'0'
    0007 EE                   out dx,al
    0008 B0 0A                mov al,'\n'
    000A EE                   out dx,al
    000B 2E C6 06 F1 10 13    mov byte [cs:0x10f1],0x13
    0011 F4                   hlt
    */
    let code = [
        0xba, 0xf8, 0x03, 0x00, 0xd8, 0x04, b'0', 0xee, 0xb0, b'\n', 0xee, 0x2e, 0xc6, 0x06,
        0xf1, 0x10, 0x13, 0xf4,
    ];
    let (vm, vcpu) = load_guest(&code);

    let mut vcpu_regs = vcpu.get_regs().unwrap();
    vcpu_regs.rax = 0x2;
    vcpu_regs.rbx = 0x7;
    vcpu.set_regs(&vcpu_regs).unwrap();

    let mut out = String::new();
    let runnable_vcpu = vcpu.to_runnable().unwrap();
    loop {
        match runnable_vcpu.run().expect("run failed") {
            ExitEvent::PortIo {
                port: 0x3f8,
                size,
                direction: IoDirection::Write,
                data,
            } => {
                assert_eq!(size, 1);
                out.push((data as u8) as char);
            }
            ExitEvent::Halt => break,
            r => panic!("unexpected exit reason: {:?}", r),
        }
    }

    assert_eq!(out, "9\n");
    assert_eq!(runnable_vcpu.state(), RunState::Exited(ExitEvent::Halt));
    let host = vm.get_host_address(GuestAddress(0x10f1), 1).unwrap();
    // Safe because the region stays installed for the rest of the test.
    let stored = unsafe { std::ptr::read_volatile(host) };
    assert_eq!(stored, 0x13);
}

#[test]
fn serial_in_supplies_guest_data() {
    if !kvm_available() {
        return;
    }
    /*
    0000 BA F8 03    mov dx,0x3f8
    0003 EC          in al,dx
    0004 EE          out dx,al
    0005 F4          hlt
    */
    let code = [0xba, 0xf8, 0x03, 0xec, 0xee, 0xf4];
    let (_vm, vcpu) = load_guest(&code);

    let mut echoed = None;
    let runnable_vcpu = vcpu.to_runnable().unwrap();
    loop {
        match runnable_vcpu.run().expect("run failed") {
            ExitEvent::PortIo {
                port: 0x3f8,
                size: 1,
                direction: IoDirection::Read,
                ..
            } => {
                runnable_vcpu.set_data(&[0x5a]).unwrap();
            }
            ExitEvent::PortIo {
                port: 0x3f8,
                size: 1,
                direction: IoDirection::Write,
                data,
            } => {
                echoed = Some(data);
            }
            ExitEvent::Halt => break,
            r => panic!("unexpected exit reason: {:?}", r),
        }
    }

    assert_eq!(echoed, Some(0x5a));
}

#[test]
fn triple_fault_is_shutdown_exit() {
    if !kvm_available() {
        return;
    }
    /*
    0000 0F 0B    ud2
    */
    let code = [0x0f, 0x0b];
    let (_vm, vcpu) = load_guest(&code);

    let runnable_vcpu = vcpu.to_runnable().unwrap();
    match runnable_vcpu.run().expect("run failed") {
        ExitEvent::Shutdown => {}
        r => panic!("unexpected exit reason: {:?}", r),
    }
    // A shutdown exit does not tear the vcpu down; its registers stay
    // readable.
    assert_eq!(
        runnable_vcpu.state(),
        RunState::Exited(ExitEvent::Shutdown)
    );
    runnable_vcpu.get_regs().unwrap();
}

#[test]
fn halt_only_image() {
    if !kvm_available() {
        return;
    }
    let _ = env_logger::builder().is_test(true).try_init();
    let kvm = Kvm::new().unwrap();
    let mut vm = Vm::new(&kvm).unwrap();
    // A single large region at guest address zero, with `hlt` at the entry
    // point.
    let mem = MemoryMapping::new(128 << 20).unwrap();
    mem.write_slice(&[0xf4], 0x1000).unwrap();
    vm.add_memory_region(GuestAddress(0), Box::new(mem), false, false)
        .unwrap();

    let vcpu = vm.create_vcpu(0).unwrap();
    let mut vcpu_sregs = vcpu.get_sregs().unwrap();
    vcpu_sregs.cs.base = 0;
    vcpu_sregs.cs.selector = 0;
    vcpu.set_sregs(&vcpu_sregs).unwrap();
    let mut vcpu_regs = vcpu.get_regs().unwrap();
    vcpu_regs.rip = 0x1000;
    vcpu_regs.rflags = 2;
    vcpu.set_regs(&vcpu_regs).unwrap();

    let runnable_vcpu = vcpu.to_runnable().unwrap();
    assert_eq!(runnable_vcpu.run().unwrap(), ExitEvent::Halt);
}
