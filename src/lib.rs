// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A safe wrapper around the kernel's KVM interface for hosting x86_64
//! guests: device probing, vm and vcpu lifecycle, guest memory slots,
//! interrupt delivery and classified vm exits.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

mod addr;
mod cap;
mod cpuid;
mod exit;

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::File;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ops::DerefMut;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use kvm_sys::*;
use libc::c_ulong;
use libc::open64;
use libc::EBUSY;
use libc::EEXIST;
use libc::EINTR;
use libc::EINVAL;
use libc::ENOENT;
use libc::ENOSPC;
use libc::EOVERFLOW;
use libc::EPROTO;
use libc::O_CLOEXEC;
use libc::O_RDWR;
use log::error;
use log::warn;
use remain::sorted;
use sync::Mutex;
use sys_util::errno_result;
use sys_util::ioctl;
use sys_util::ioctl_with_mut_ref;
use sys_util::ioctl_with_ref;
use sys_util::ioctl_with_val;
use sys_util::pagesize;
use sys_util::AsRawDescriptor;
use sys_util::FromRawDescriptor;
use sys_util::MappedRegion;
use sys_util::MemoryMapping;
use sys_util::MemoryMappingBuilder;
use sys_util::MmapError;
use sys_util::RawDescriptor;
use thiserror::Error as ThisError;

pub use crate::addr::GuestAddress;
pub use crate::cap::Cap;
pub use crate::cpuid::host_cpuid;
pub use crate::cpuid::CpuidResult;
pub use crate::exit::classify;
pub use crate::exit::ExitEvent;
pub use crate::exit::IoDirection;
pub use sys_util::Error as SysError;

/// Errors from vm and vcpu operations.
#[sorted]
#[derive(ThisError, Debug, Eq, PartialEq)]
pub enum Error {
    /// The irqchip or PIT singleton was requested a second time.
    #[error("irqchip or PIT was already created for this vm")]
    AlreadyCreated,
    /// `Vcpu::destroy` was called on an already destroyed vcpu.
    #[error("vcpu was already destroyed")]
    AlreadyTerminated,
    /// The kernel refused to create a vm, vcpu, irqchip or PIT.
    #[error("kernel rejected resource creation: {0}")]
    CreationError(SysError),
    /// The kvm device node could not be opened.
    #[error("failed to open the virtualization device: {0}")]
    DeviceUnavailable(SysError),
    /// A vcpu index was used for a second vcpu.
    #[error("vcpu index {0} is already in use")]
    DuplicateIndex(u32),
    /// The vcpu handle was destroyed before this operation.
    #[error("operation on a destroyed vcpu handle")]
    HandleClosed,
    /// A vm entry returned early because an immediate exit was requested.
    #[error("vm entry was interrupted by an immediate exit request")]
    Interrupted,
    /// An interrupt could not be delivered or queued.
    #[error("interrupt delivery rejected in the current state: {0}")]
    InvalidInterruptState(SysError),
    /// A guest memory region could not be installed or removed.
    #[error("failed to install memory region: {0}")]
    MemoryInstallError(SysError),
    /// The kvm device failed its api version or mmap size probe.
    #[error("virtualization device probe failed: {0}")]
    ProbeError(SysError),
    /// A vm entry failed or produced a malformed exit record.
    #[error("vm entry failed: {0}")]
    RunError(SysError),
    /// The slot number does not name an installed memory region.
    #[error("memory region slot {0} is not installed")]
    UnknownRegion(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

// Sentinel in a vcpu's pending interrupt mailbox meaning nothing is queued.
// Real vectors are bounded by KVM_NR_INTERRUPTS.
const NO_PENDING_INTERRUPT: u32 = u32::MAX;

unsafe fn set_user_memory_region<F: AsRawDescriptor>(
    descriptor: &F,
    slot: u32,
    read_only: bool,
    log_dirty_pages: bool,
    guest_addr: u64,
    memory_size: u64,
    userspace_addr: *mut u8,
) -> sys_util::Result<()> {
    let mut flags = if read_only { KVM_MEM_READONLY } else { 0 };
    if log_dirty_pages {
        flags |= KVM_MEM_LOG_DIRTY_PAGES;
    }
    let region = kvm_userspace_memory_region {
        slot,
        flags,
        guest_phys_addr: guest_addr,
        memory_size,
        userspace_addr: userspace_addr as u64,
    };

    let ret = ioctl_with_ref(descriptor, KVM_SET_USER_MEMORY_REGION(), &region);
    if ret == 0 {
        Ok(())
    } else {
        errno_result()
    }
}

/// A wrapper around opening and using `/dev/kvm`.
///
/// Construction probes the device: it fails unless the kernel speaks
/// `KVM_API_VERSION` and reports a sane vcpu mmap size.
pub struct Kvm {
    kvm: File,
}

impl Kvm {
    /// Opens `/dev/kvm` and probes its api version.
    pub fn new() -> Result<Kvm> {
        Kvm::new_with_path(Path::new("/dev/kvm"))
    }

    /// Opens a kvm device node at `device_path` and probes its api version.
    pub fn new_with_path(device_path: &Path) -> Result<Kvm> {
        // Open calls are safe because we give a nul-terminated string and verify the result.
        let c_path = CString::new(device_path.as_os_str().as_bytes()).unwrap();
        let ret = unsafe { open64(c_path.as_ptr(), O_RDWR | O_CLOEXEC) };
        if ret < 0 {
            return Err(Error::DeviceUnavailable(SysError::last()));
        }
        // Safe because we verify that ret is valid and we own the fd.
        let kvm = Kvm {
            kvm: unsafe { File::from_raw_descriptor(ret) },
        };
        kvm.get_api_version()?;
        Ok(kvm)
    }

    /// Returns the kvm api version, which must be `KVM_API_VERSION` for this
    /// crate to drive the device.
    pub fn get_api_version(&self) -> Result<i32> {
        // Safe because we know that our file is a KVM fd and we verify the return result.
        let version = unsafe { ioctl(self, KVM_GET_API_VERSION()) };
        if version < 0 {
            return Err(Error::ProbeError(SysError::last()));
        }
        if version as u32 != KVM_API_VERSION {
            error!("unsupported kvm api version {}", version);
            return Err(Error::ProbeError(SysError::new(EPROTO)));
        }
        Ok(version)
    }

    /// Checks if a particular `Cap` is available.
    pub fn check_extension(&self, c: Cap) -> bool {
        // Safe because we know that our file is a KVM fd and that the extension is one of the ones
        // defined by kernel.
        unsafe { ioctl_with_val(self, KVM_CHECK_EXTENSION(), c as c_ulong) == 1 }
    }

    /// Returns the size of the mmap backing each vcpu's run page.
    ///
    /// The kernel's answer is validated: a size of zero or one that is not a
    /// multiple of the host page size fails with `Error::ProbeError`.
    pub fn get_vcpu_mmap_size(&self) -> Result<usize> {
        // Safe because we know that our file is a KVM fd and we verify the return result.
        let res = unsafe { ioctl(self, KVM_GET_VCPU_MMAP_SIZE()) };
        if res < 0 {
            return Err(Error::ProbeError(SysError::last()));
        }
        let size = res as usize;
        if size == 0 || size % pagesize() != 0 {
            error!("kvm reported a vcpu mmap size of {}", size);
            return Err(Error::ProbeError(SysError::new(EPROTO)));
        }
        Ok(size)
    }
}

impl AsRawDescriptor for Kvm {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.kvm.as_raw_descriptor()
    }
}

struct MemRegion {
    guest_addr: GuestAddress,
    size: u64,
    mem: Box<dyn MappedRegion>,
}

#[derive(Default)]
struct MemRegionsInner {
    slots: BTreeMap<u32, MemRegion>,
    // Slot numbers are never reused, so this only moves forward.
    next_slot: u32,
}

impl MemRegionsInner {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.slots.values().any(|r| {
            let base = r.guest_addr.offset();
            start < base + r.size && base < end
        })
    }
}

/// A read handle onto the set of memory regions installed in a `Vm`.
///
/// Clones share the same underlying set, so a handle obtained from
/// `Vm::regions` observes later installs and removals and can be read from
/// any thread.
#[derive(Clone, Default)]
pub struct MemRegions {
    inner: Arc<Mutex<MemRegionsInner>>,
}

impl MemRegions {
    /// Returns the number of installed regions.
    pub fn num_regions(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Returns true if any installed region intersects `[addr, addr + size)`.
    pub fn overlaps(&self, addr: GuestAddress, size: u64) -> bool {
        let start = addr.offset();
        let end = start.saturating_add(size);
        self.inner.lock().overlaps(start, end)
    }

    /// Converts a guest address into a host pointer if `addr` lies within an
    /// installed region with at least `len` bytes past it.
    ///
    /// The pointer is only valid as long as the region backing `addr` stays
    /// installed in the vm.
    pub fn get_host_address(&self, addr: GuestAddress, len: u64) -> Option<*mut u8> {
        let inner = self.inner.lock();
        for r in inner.slots.values() {
            let base = r.guest_addr.offset();
            if addr.offset() < base {
                continue;
            }
            let offset = addr.offset() - base;
            if offset.checked_add(len).map_or(true, |end| end > r.size) {
                continue;
            }
            // Safe because the offset was checked against the size of the mapping.
            return Some(unsafe { r.mem.as_ptr().add(offset as usize) });
        }
        None
    }
}

/// A wrapper around creating and using a vm.
pub struct Vm {
    vm: File,
    regions: MemRegions,
    vcpus: BTreeMap<u32, Arc<AtomicU32>>,
    live_vcpus: Arc<AtomicUsize>,
    run_mmap_size: usize,
    has_irqchip: bool,
    has_pit: bool,
}

impl Vm {
    /// Constructs a new `Vm` using the given `Kvm` instance.
    pub fn new(kvm: &Kvm) -> Result<Vm> {
        let run_mmap_size = kvm.get_vcpu_mmap_size()?;
        // Safe because we know kvm is a real kvm fd as this module is the only one that can make
        // Kvm objects.
        let ret = unsafe { ioctl(kvm, KVM_CREATE_VM()) };
        if ret < 0 {
            return Err(Error::CreationError(SysError::last()));
        }
        // Safe because we verify that ret is valid and we own the fd.
        let vm = unsafe { File::from_raw_descriptor(ret) };
        Ok(Vm {
            vm,
            regions: MemRegions::default(),
            vcpus: BTreeMap::new(),
            live_vcpus: Arc::new(AtomicUsize::new(0)),
            run_mmap_size,
            has_irqchip: false,
            has_pit: false,
        })
    }

    /// Checks if a particular `Cap` is available.
    ///
    /// This is distinct from the `Kvm` version of this method because some
    /// extensions depend on the particular `Vm` existing. This method is
    /// encouraged by the kernel because it more accurately reflects the
    /// usable capabilities.
    pub fn check_extension(&self, c: Cap) -> bool {
        // Safe because we know that our file is a VM fd and that the extension is one of the ones
        // defined by kernel.
        unsafe { ioctl_with_val(&self.vm, KVM_CHECK_EXTENSION(), c as c_ulong) == 1 }
    }

    /// Installs `mem` into the guest's physical address space at
    /// `guest_addr`, returning the slot number chosen for it.
    ///
    /// The address and size must be page aligned and must not intersect any
    /// installed region. Slot numbers are never reused, even after the region
    /// that held one is removed. A failed install leaves the vm unchanged.
    pub fn add_memory_region(
        &mut self,
        guest_addr: GuestAddress,
        mem: Box<dyn MappedRegion>,
        read_only: bool,
        log_dirty_pages: bool,
    ) -> Result<u32> {
        let size = mem.size() as u64;
        let page_mask = pagesize() as u64 - 1;
        if size == 0 || size & page_mask != 0 || guest_addr.offset() & page_mask != 0 {
            return Err(Error::MemoryInstallError(SysError::new(EINVAL)));
        }
        let end_addr = guest_addr
            .offset()
            .checked_add(size)
            .ok_or(Error::MemoryInstallError(SysError::new(EOVERFLOW)))?;
        let mut inner = self.regions.inner.lock();
        if inner.overlaps(guest_addr.offset(), end_addr) {
            return Err(Error::MemoryInstallError(SysError::new(ENOSPC)));
        }
        let slot = inner.next_slot;

        // Safe because we check that the given guest address is valid and has no overlaps. We also
        // know that the pointer and size are correct because the MappedRegion interface ensures
        // this. We take ownership of the memory mapping so that it won't be unmapped until the
        // slot is removed.
        let res = unsafe {
            set_user_memory_region(
                &self.vm,
                slot,
                read_only,
                log_dirty_pages,
                guest_addr.offset(),
                size,
                mem.as_ptr(),
            )
        };
        if let Err(e) = res {
            return Err(Error::MemoryInstallError(e));
        }
        inner.next_slot += 1;
        inner.slots.insert(
            slot,
            MemRegion {
                guest_addr,
                size,
                mem,
            },
        );
        Ok(slot)
    }

    /// Removes the memory region installed at `slot`, returning the backing
    /// mapping. The slot number is retired and will not be handed out again.
    pub fn remove_memory_region(&mut self, slot: u32) -> Result<Box<dyn MappedRegion>> {
        let mut inner = self.regions.inner.lock();
        if !inner.slots.contains_key(&slot) {
            return Err(Error::UnknownRegion(slot));
        }
        // Safe because the slot is checked against the list of installed slots and a zero sized
        // region tells the kernel to drop it.
        let res = unsafe {
            set_user_memory_region(&self.vm, slot, false, false, 0, 0, std::ptr::null_mut())
        };
        if let Err(e) = res {
            return Err(Error::MemoryInstallError(e));
        }
        // This remove will always succeed because of the contains_key check above.
        Ok(inner.slots.remove(&slot).unwrap().mem)
    }

    /// Returns a handle for reading the installed memory regions from any
    /// thread.
    pub fn regions(&self) -> MemRegions {
        self.regions.clone()
    }

    /// Returns true if any installed region intersects `[addr, addr + size)`.
    pub fn overlaps(&self, addr: GuestAddress, size: u64) -> bool {
        self.regions.overlaps(addr, size)
    }

    /// Converts a guest address into a host pointer if it lies within an
    /// installed region with at least `len` bytes past it.
    pub fn get_host_address(&self, addr: GuestAddress, len: u64) -> Option<*mut u8> {
        self.regions.get_host_address(addr, len)
    }

    /// Creates an in kernel interrupt controller for this vm. Can only be
    /// done once per vm.
    pub fn create_irq_chip(&mut self) -> Result<()> {
        if self.has_irqchip {
            return Err(Error::AlreadyCreated);
        }
        // Safe because we know that our file is a VM fd and we verify the return result.
        let ret = unsafe { ioctl(&self.vm, KVM_CREATE_IRQCHIP()) };
        if ret != 0 {
            return Err(Error::CreationError(SysError::last()));
        }
        self.has_irqchip = true;
        Ok(())
    }

    /// Creates an in kernel PIT for this vm, optionally with the dummy
    /// speaker port. Can only be done once per vm, after
    /// `Vm::create_irq_chip`.
    pub fn create_pit(&mut self, speaker_enabled: bool) -> Result<()> {
        if self.has_pit {
            return Err(Error::AlreadyCreated);
        }
        let mut pit_config = kvm_pit_config::default();
        if speaker_enabled {
            pit_config.flags = KVM_PIT_SPEAKER_DUMMY;
        }
        // Safe because we know that our file is a VM fd, we know the kernel will only read the
        // correct amount of memory from our pointer, and we verify the return result.
        let ret = unsafe { ioctl_with_ref(&self.vm, KVM_CREATE_PIT2(), &pit_config) };
        if ret != 0 {
            return Err(Error::CreationError(SysError::last()));
        }
        self.has_pit = true;
        Ok(())
    }

    /// Retrieves the current state of the in kernel PIT.
    ///
    /// Note that this call can only succeed after a call to `Vm::create_pit`.
    pub fn get_pit_state(&self) -> Result<kvm_pit_state2> {
        // Safe because we know that our file is a VM fd, we know the kernel will only write
        // correct amount of memory to our pointer, and we verify the return result.
        let mut pit_state = unsafe { std::mem::zeroed() };
        let ret = unsafe { ioctl_with_mut_ref(&self.vm, KVM_GET_PIT2(), &mut pit_state) };
        if ret != 0 {
            return Err(Error::InvalidInterruptState(SysError::last()));
        }
        Ok(pit_state)
    }

    /// Sets the state of the in kernel PIT.
    ///
    /// Note that this call can only succeed after a call to `Vm::create_pit`.
    pub fn set_pit_state(&self, pit_state: &kvm_pit_state2) -> Result<()> {
        // Safe because we know that our file is a VM fd, we know the kernel will only read the
        // correct amount of memory from our pointer, and we verify the return result.
        let ret = unsafe { ioctl_with_ref(&self.vm, KVM_SET_PIT2(), pit_state) };
        if ret != 0 {
            return Err(Error::InvalidInterruptState(SysError::last()));
        }
        Ok(())
    }

    /// Sets the level on the given irq line to 1 if `active` is true, and 0
    /// otherwise.
    ///
    /// Note that this call can only succeed after a call to
    /// `Vm::create_irq_chip`.
    pub fn set_irq_line(&self, irq: u32, active: bool) -> Result<()> {
        let irq_level = kvm_irq_level {
            irq,
            level: active.into(),
        };
        // Safe because we know that our file is a VM fd, we know the kernel will only read the
        // correct amount of memory from our pointer, and we verify the return result.
        let ret = unsafe { ioctl_with_ref(&self.vm, KVM_IRQ_LINE(), &irq_level) };
        if ret != 0 {
            return Err(Error::InvalidInterruptState(SysError::last()));
        }
        Ok(())
    }

    /// Requests delivery of interrupt `vector` to the vcpu created with
    /// `vcpu_index`.
    ///
    /// With an in kernel irqchip the request is routed through it by pulsing
    /// the corresponding line and `vcpu_index` is ignored. Without one the
    /// vector is queued for that vcpu's run loop to inject once the guest can
    /// accept it; at most one vector can be queued per vcpu at a time.
    pub fn inject_interrupt(&self, vcpu_index: u32, vector: u32) -> Result<()> {
        if self.has_irqchip {
            self.set_irq_line(vector, true)?;
            return self.set_irq_line(vector, false);
        }
        if vector >= KVM_NR_INTERRUPTS {
            return Err(Error::InvalidInterruptState(SysError::new(EINVAL)));
        }
        let mailbox = self
            .vcpus
            .get(&vcpu_index)
            .ok_or(Error::InvalidInterruptState(SysError::new(ENOENT)))?;
        mailbox
            .compare_exchange(
                NO_PENDING_INTERRUPT,
                vector,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| Error::InvalidInterruptState(SysError::new(EEXIST)))?;
        Ok(())
    }

    /// Creates a vcpu with the given `index` and maps its run page.
    ///
    /// Every vcpu of a vm must be created with a distinct index, which on
    /// x86_64 doubles as its APIC id.
    pub fn create_vcpu(&mut self, index: u32) -> Result<Vcpu> {
        let entry = match self.vcpus.entry(index) {
            Entry::Occupied(_) => return Err(Error::DuplicateIndex(index)),
            Entry::Vacant(entry) => entry,
        };
        // Safe because we know that our file is a VM fd and we verify the return result.
        let fd = unsafe { ioctl_with_val(&self.vm, KVM_CREATE_VCPU(), index as c_ulong) };
        if fd < 0 {
            return Err(Error::CreationError(SysError::last()));
        }
        // Wrap the vcpu now in case the following ? returns early. This is safe because we
        // verified the value of the fd and we own the fd.
        let vcpu = unsafe { File::from_raw_descriptor(fd) };
        let run_mmap = MemoryMappingBuilder::new(self.run_mmap_size)
            .from_file(&vcpu)
            .build()
            .map_err(|e| match e {
                MmapError::SystemCallFailed(e) => Error::CreationError(e),
                _ => Error::CreationError(SysError::new(EINVAL)),
            })?;
        let pending_irq = Arc::new(AtomicU32::new(NO_PENDING_INTERRUPT));
        entry.insert(pending_irq.clone());
        self.live_vcpus.fetch_add(1, Ordering::SeqCst);
        Ok(Vcpu {
            inner: Some(VcpuInner { run_mmap, vcpu }),
            index,
            state: Cell::new(RunState::Configured),
            pending_irq,
            live: self.live_vcpus.clone(),
        })
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        let live = self.live_vcpus.load(Ordering::SeqCst);
        if live != 0 {
            warn!("vm torn down with {} vcpus still live", live);
        }
        // The slots are uninstalled while the vm fd is still open; the backing mappings are
        // unmapped after that, when the boxes drop.
        let mut inner = self.regions.inner.lock();
        for slot in inner.slots.keys() {
            // Safe because the slot was installed on this vm and a zero sized region tells the
            // kernel to drop it.
            let res = unsafe {
                set_user_memory_region(&self.vm, *slot, false, false, 0, 0, std::ptr::null_mut())
            };
            if let Err(e) = res {
                warn!("failed to remove memory region {}: {}", slot, e);
            }
        }
        inner.slots.clear();
    }
}

/// The lifecycle state of a `Vcpu`, advanced by `RunnableVcpu::run` and
/// `Vcpu::destroy`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunState {
    /// Created and configurable, the guest has not been entered yet.
    Configured,
    /// Currently inside `RunnableVcpu::run`.
    Running,
    /// Returned from an entry with the given event.
    Exited(ExitEvent),
    /// Destroyed with `Vcpu::destroy`. Terminal.
    Terminated,
}

// Field order matters: the run page mapping must be unmapped before the vcpu
// fd it was mapped from is closed.
struct VcpuInner {
    run_mmap: MemoryMapping,
    vcpu: File,
}

/// A wrapper around creating and using a vcpu.
pub struct Vcpu {
    inner: Option<VcpuInner>,
    index: u32,
    state: Cell<RunState>,
    pending_irq: Arc<AtomicU32>,
    live: Arc<AtomicUsize>,
}

struct VcpuThread {
    run: *mut kvm_run,
}

thread_local! {
    static VCPU_THREAD: RefCell<Option<VcpuThread>> = RefCell::new(None);
}

impl Vcpu {
    /// Returns the index this vcpu was created with.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the lifecycle state of this vcpu.
    pub fn state(&self) -> RunState {
        self.state.get()
    }

    fn inner(&self) -> Result<&VcpuInner> {
        self.inner.as_ref().ok_or(Error::HandleClosed)
    }

    /// Consumes `self` and returns a `RunnableVcpu` bound to the calling
    /// thread, which is the only thread the guest may be entered from.
    ///
    /// Fails if another vcpu is already bound to this thread.
    pub fn to_runnable(self) -> Result<RunnableVcpu> {
        let run = self.inner()?.run_mmap.as_ptr() as *mut kvm_run;
        VCPU_THREAD.with(|v| {
            if v.borrow().is_none() {
                *v.borrow_mut() = Some(VcpuThread { run });
                Ok(())
            } else {
                Err(Error::RunError(SysError::new(EBUSY)))
            }
        })?;
        Ok(RunnableVcpu {
            vcpu: self,
            phantom: Default::default(),
        })
    }

    /// Gets the vcpu's current general purpose registers.
    pub fn get_regs(&self) -> Result<kvm_regs> {
        let inner = self.inner()?;
        // Safe because we know that our file is a vcpu fd, we know the kernel will only write the
        // correct amount of memory to our pointer, and we verify the return result.
        let mut regs = unsafe { std::mem::zeroed() };
        let ret = unsafe { ioctl_with_mut_ref(&inner.vcpu, KVM_GET_REGS(), &mut regs) };
        if ret != 0 {
            return Err(Error::RunError(SysError::last()));
        }
        Ok(regs)
    }

    /// Sets the vcpu's general purpose registers.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        let inner = self.inner()?;
        // Safe because we know that our file is a vcpu fd, we know the kernel will only read the
        // correct amount of memory from our pointer, and we verify the return result.
        let ret = unsafe { ioctl_with_ref(&inner.vcpu, KVM_SET_REGS(), regs) };
        if ret != 0 {
            return Err(Error::RunError(SysError::last()));
        }
        Ok(())
    }

    /// Gets the vcpu's current special registers.
    pub fn get_sregs(&self) -> Result<kvm_sregs> {
        let inner = self.inner()?;
        // Safe because we know that our file is a vcpu fd, we know the kernel will only write the
        // correct amount of memory to our pointer, and we verify the return result.
        let mut sregs = unsafe { std::mem::zeroed() };
        let ret = unsafe { ioctl_with_mut_ref(&inner.vcpu, KVM_GET_SREGS(), &mut sregs) };
        if ret != 0 {
            return Err(Error::RunError(SysError::last()));
        }
        Ok(sregs)
    }

    /// Sets the vcpu's special registers.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()> {
        let inner = self.inner()?;
        // Safe because we know that our file is a vcpu fd, we know the kernel will only read the
        // correct amount of memory from our pointer, and we verify the return result.
        let ret = unsafe { ioctl_with_ref(&inner.vcpu, KVM_SET_SREGS(), sregs) };
        if ret != 0 {
            return Err(Error::RunError(SysError::last()));
        }
        Ok(())
    }

    /// Injects interrupt vector `vector` directly into this vcpu.
    ///
    /// Only usable with a vm that has no in kernel irqchip, and only while
    /// the guest is ready for the interrupt. `Vm::inject_interrupt` queues a
    /// vector without either restriction.
    pub fn interrupt(&self, vector: u32) -> Result<()> {
        let inner = self.inner()?;
        if vector >= KVM_NR_INTERRUPTS {
            return Err(Error::InvalidInterruptState(SysError::new(EINVAL)));
        }
        let interrupt = kvm_interrupt { irq: vector };
        // Safe because we know that our file is a vcpu fd, we know the kernel will only read the
        // correct amount of memory from our pointer, and we verify the return result.
        let ret = unsafe { ioctl_with_ref(&inner.vcpu, KVM_INTERRUPT(), &interrupt) };
        if ret != 0 {
            return Err(Error::InvalidInterruptState(SysError::last()));
        }
        Ok(())
    }

    /// Completes a guest read by supplying `data` for the access that caused
    /// the last exit.
    ///
    /// Call this after a run returns a `PortIo` or `Mmio` event with
    /// direction `Read` and before the next entry. `data` must be exactly as
    /// long as the access.
    #[allow(clippy::cast_ptr_alignment)]
    pub fn set_data(&self, data: &[u8]) -> Result<()> {
        let inner = self.inner()?;
        // Safe because we know we mapped enough memory to hold the kvm_run struct because the
        // kernel told us how large it was. The pointer is page aligned so casting to a different
        // type is well defined, hence the clippy allow attribute.
        let run = unsafe { &mut *(inner.run_mmap.as_ptr() as *mut kvm_run) };
        match run.exit_reason {
            KVM_EXIT_IO => {
                // Safe because the exit_reason says which union field the kernel filled in.
                let io = unsafe { run.exit.io };
                if io.direction != KVM_EXIT_IO_IN {
                    return Err(Error::RunError(SysError::new(EINVAL)));
                }
                let data_size = (io.count as usize) * (io.size as usize);
                if data_size != data.len() {
                    return Err(Error::RunError(SysError::new(EINVAL)));
                }
                let data_offset = io.data_offset as usize;
                if data_offset
                    .checked_add(data_size)
                    .map_or(true, |end| end > inner.run_mmap.size())
                {
                    return Err(Error::RunError(SysError::new(EPROTO)));
                }
                // Safe because the data area was bounds checked against the size of the mapping.
                unsafe {
                    let data_ptr = inner.run_mmap.as_ptr().add(data_offset);
                    std::ptr::copy_nonoverlapping(data.as_ptr(), data_ptr, data_size);
                }
                Ok(())
            }
            KVM_EXIT_MMIO => {
                // Safe because the exit_reason says which union field the kernel filled in.
                let mmio = unsafe { &mut run.exit.mmio };
                if mmio.is_write != 0 {
                    return Err(Error::RunError(SysError::new(EINVAL)));
                }
                let len = mmio.len as usize;
                if len > mmio.data.len() || len != data.len() {
                    return Err(Error::RunError(SysError::new(EINVAL)));
                }
                mmio.data[..len].copy_from_slice(data);
                Ok(())
            }
            _ => Err(Error::RunError(SysError::new(EINVAL))),
        }
    }

    /// Specifies whether the next entry of this vcpu returns immediately
    /// with `Error::Interrupted` instead of running guest code.
    ///
    /// The request stays armed until cleared with another call; a run that
    /// observes it does not consume it.
    #[allow(clippy::cast_ptr_alignment)]
    pub fn set_immediate_exit(&self, exit: bool) -> Result<()> {
        let inner = self.inner()?;
        // Safe because we know we mapped enough memory to hold the kvm_run struct because the
        // kernel told us how large it was. The pointer is page aligned so casting to a different
        // type is well defined, hence the clippy allow attribute.
        let run = unsafe { &mut *(inner.run_mmap.as_ptr() as *mut kvm_run) };
        run.immediate_exit = exit.into();
        Ok(())
    }

    /// Sets or clears the immediate exit flag of the vcpu bound to the
    /// current thread with `Vcpu::to_runnable`, without needing a reference
    /// to it. Safe to call from a signal handler on that thread.
    pub fn set_local_immediate_exit(exit: bool) {
        VCPU_THREAD.with(|v| {
            if let Some(state) = &(*v.borrow()) {
                // Safe because the bound vcpu's run page stays mapped for as long as the thread
                // local entry exists.
                unsafe {
                    (*state.run).immediate_exit = exit.into();
                };
            }
        });
    }

    /// Releases the vcpu's kernel resources now instead of when the handle
    /// drops.
    ///
    /// The handle itself stays, in the `Terminated` state, and every later
    /// operation on it fails with `Error::HandleClosed`. Destroying twice
    /// fails with `Error::AlreadyTerminated`. A vcpu bound to the calling
    /// thread with `to_runnable` is unbound first, freeing the thread for
    /// another vcpu.
    pub fn destroy(&mut self) -> Result<()> {
        let inner = match self.inner.take() {
            Some(inner) => inner,
            None => return Err(Error::AlreadyTerminated),
        };
        // A bound vcpu can only be destroyed from its own thread because
        // `RunnableVcpu` cannot move to another one, so the entry holding a
        // pointer into the run page is always this thread's. It must go
        // before the mapping does.
        VCPU_THREAD.with(|v| {
            let mut state = v.borrow_mut();
            let bound_here = state
                .as_ref()
                .map_or(false, |s| s.run as *mut u8 == inner.run_mmap.as_ptr());
            if bound_here {
                *state = None;
            }
        });
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.state.set(RunState::Terminated);
        Ok(())
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A `Vcpu` that is bound to a thread and can enter the guest. Created by
/// calling `to_runnable` on a `Vcpu`.
///
/// Implements `Deref` to a `Vcpu` so all `Vcpu` methods are usable, with the
/// exception of `to_runnable`.
pub struct RunnableVcpu {
    vcpu: Vcpu,
    // vcpus must stay on the same thread once they start.
    // Add a PhantomData pointer to ensure RunnableVcpu is not `Send`.
    phantom: PhantomData<*mut u8>,
}

impl RunnableVcpu {
    /// Runs the guest on this vcpu until it exits, returning the classified
    /// exit event.
    ///
    /// Entries torn down by stray signals are retried transparently. If an
    /// immediate exit was requested the entry returns `Error::Interrupted`
    /// instead, leaving the request armed. An interrupt queued with
    /// `Vm::inject_interrupt` is delivered as soon as the guest can take it.
    #[allow(clippy::cast_ptr_alignment)]
    pub fn run(&self) -> Result<ExitEvent> {
        let inner = match &self.vcpu.inner {
            Some(inner) => inner,
            None => return Err(Error::HandleClosed),
        };
        let prev_state = self.vcpu.state.get();
        self.vcpu.state.set(RunState::Running);
        loop {
            {
                // Safe because we know we mapped enough memory to hold the kvm_run struct because
                // the kernel told us how large it was.
                let run = unsafe { &mut *(inner.run_mmap.as_ptr() as *mut kvm_run) };
                let vector = self.vcpu.pending_irq.load(Ordering::Acquire);
                if vector == NO_PENDING_INTERRUPT {
                    run.request_interrupt_window = 0;
                } else if run.ready_for_interrupt_injection != 0 && run.if_flag != 0 {
                    let interrupt = kvm_interrupt { irq: vector };
                    // Safe because we know that our file is a vcpu fd, we know the kernel will
                    // only read the correct amount of memory from our pointer, and we verify the
                    // return result.
                    let ret =
                        unsafe { ioctl_with_ref(&inner.vcpu, KVM_INTERRUPT(), &interrupt) };
                    if ret != 0 {
                        self.vcpu.state.set(prev_state);
                        return Err(Error::InvalidInterruptState(SysError::last()));
                    }
                    self.vcpu
                        .pending_irq
                        .store(NO_PENDING_INTERRUPT, Ordering::Release);
                    run.request_interrupt_window = 0;
                } else {
                    // Have the kernel exit as soon as the guest can take the vector.
                    run.request_interrupt_window = 1;
                }
            }
            // Safe because we know that our file is a vcpu fd and we verify the return result.
            let ret = unsafe { ioctl(&inner.vcpu, KVM_RUN()) };
            if ret != 0 {
                let err = SysError::last();
                if err.errno() != EINTR {
                    self.vcpu.state.set(prev_state);
                    return Err(Error::RunError(err));
                }
                // Safe because the kernel does not write the run page while no entry is in
                // progress.
                let run = unsafe { &*(inner.run_mmap.as_ptr() as *const kvm_run) };
                if run.immediate_exit != 0 {
                    self.vcpu.state.set(prev_state);
                    return Err(Error::Interrupted);
                }
                continue;
            }
            // Safe because we know we mapped enough memory to hold the kvm_run struct because the
            // kernel told us how large it was.
            let run = unsafe { &*(inner.run_mmap.as_ptr() as *const kvm_run) };
            if run.exit_reason == KVM_EXIT_INTR {
                if run.immediate_exit != 0 {
                    self.vcpu.state.set(prev_state);
                    return Err(Error::Interrupted);
                }
                continue;
            }
            // Safe because the mapping outlives this borrow and the kernel initialized all of it.
            let page = unsafe {
                std::slice::from_raw_parts(inner.run_mmap.as_ptr(), inner.run_mmap.size())
            };
            match classify(page) {
                Ok(event) => {
                    self.vcpu.state.set(RunState::Exited(event));
                    return Ok(event);
                }
                Err(e) => {
                    self.vcpu.state.set(prev_state);
                    return Err(e);
                }
            }
        }
    }
}

impl Deref for RunnableVcpu {
    type Target = Vcpu;
    fn deref(&self) -> &Self::Target {
        &self.vcpu
    }
}

impl DerefMut for RunnableVcpu {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.vcpu
    }
}

impl Drop for RunnableVcpu {
    fn drop(&mut self) {
        // A destroyed vcpu was already unbound by `destroy`, and the entry
        // may since belong to a vcpu bound afterwards. Only a live binding
        // is this vcpu's to clear.
        if self.vcpu.inner.is_some() {
            VCPU_THREAD.with(|v| {
                *v.borrow_mut() = None;
            });
        }
    }
}
