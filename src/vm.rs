//! This module provides the [`Vm`] struct which represents a virtual machine, i.e. a number of
//! virtual CPUs sharing a guest physical address space, a CPUID model and the I/O bus of the
//! embedder.

use bitflags::bitflags;
use crate::bus::{IoBus, NullBus};
use crate::cpuid::CpuidModel;
use crate::error::Error;
use crate::hypervisor::{Hypervisor, HypervisorVcpu};
use crate::irq::{Apic, InterruptLine, VcpuHandle};
use crate::memory::{SlotTable, DEFAULT_SLOT_CAPACITY};
use crate::mmu::GuestMemory;
use crate::msr::UnknownMsrPolicy;
use crate::vcpu::Vcpu;
use log::debug;
use mmap_rs::{MmapMut, MmapOptions};
use parking_lot::{Mutex, MutexGuard};
use rangemap::RangeMap;
use std::collections::HashMap;
use std::sync::Arc;

bitflags! {
    /// The protection flags used when mapping guest physical memory.
    pub struct ProtectionFlags: u32 {
        /// The guest VM is allowed to read from the physical memory.
        const READ    = 1 << 0;
        /// The guest VM is allowed to write to the physical memory.
        const WRITE   = 1 << 1;
        /// The guest VM is allowed to execute from the physical memory.
        const EXECUTE = 1 << 2;
    }
}

/// Anonymous host memory allocated through [`Vm::allocate_ram`].
#[derive(Default)]
struct RamAllocations {
    /// A mapping of the guest physical ranges to their base guest physical address.
    ranges: RangeMap<u64, u64>,
    /// The host mappings, keyed by base guest physical address.
    mappings: HashMap<u64, MmapMut>,
}

/// The state shared by the VM and all of its virtual CPUs.
pub(crate) struct VmContext<H: Hypervisor> {
    pub(crate) hypervisor: Arc<H>,
    pub(crate) slots: SlotTable,
    pub(crate) cpuid: CpuidModel,
    pub(crate) bus: Arc<dyn IoBus>,
    pub(crate) msr_policy: UnknownMsrPolicy,
    vcpu_count: usize,
    ram: Mutex<RamAllocations>,
    /// The lock that serializes the device models of the embedder. Virtual CPUs release it while
    /// they execute guest code.
    pub(crate) lock: Mutex<()>,
}

impl<H: Hypervisor> VmContext<H> {
    pub(crate) fn memory(&self) -> GuestMemory<'_> {
        GuestMemory::new(&self.slots, &*self.bus)
    }
}

/// The `VmBuilder` allows for the configuration of certain properties for the new VM before
/// constructing it, as these properties are immutable once the VM has been built.
pub struct VmBuilder<H: Hypervisor> {
    hypervisor: H,
    vcpu_count: usize,
    slot_capacity: usize,
    cpuid: CpuidModel,
    msr_policy: UnknownMsrPolicy,
    bus: Arc<dyn IoBus>,
}

impl<H: Hypervisor> VmBuilder<H> {
    /// Starts the configuration of a VM on top of the given hypervisor.
    pub fn new(hypervisor: H) -> Self {
        Self {
            hypervisor,
            vcpu_count: 1,
            slot_capacity: DEFAULT_SLOT_CAPACITY,
            cpuid: CpuidModel::default(),
            msr_policy: UnknownMsrPolicy::default(),
            bus: Arc::new(NullBus),
        }
    }

    /// This is used to specify the maximum number of virtual CPUs to use for this VM. The count is
    /// also reported to the guest in the CPUID topology leaves.
    pub fn with_vcpu_count(mut self, count: usize) -> Self {
        self.vcpu_count = count.max(1);
        self
    }

    /// Sets the number of entries in the memory slot table.
    pub fn with_slot_capacity(mut self, capacity: usize) -> Self {
        self.slot_capacity = capacity;
        self
    }

    /// Replaces the CPUID model presented to the guest.
    pub fn with_cpuid(mut self, cpuid: CpuidModel) -> Self {
        self.cpuid = cpuid;
        self
    }

    /// Selects how accesses to MSRs that are not emulated are handled.
    pub fn with_unknown_msr_policy(mut self, policy: UnknownMsrPolicy) -> Self {
        self.msr_policy = policy;
        self
    }

    /// Connects the VM to the port I/O and MMIO dispatcher of the embedder.
    pub fn with_bus(mut self, bus: Arc<dyn IoBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Builds the VM.
    pub fn build(self) -> Result<Vm<H>, Error> {
        let cpuid = self.cpuid.with_vcpu_count(self.vcpu_count as u32);

        Ok(Vm {
            context: Arc::new(VmContext {
                hypervisor: Arc::new(self.hypervisor),
                slots: SlotTable::new(self.slot_capacity),
                cpuid,
                bus: self.bus,
                msr_policy: self.msr_policy,
                vcpu_count: self.vcpu_count,
                ram: Mutex::new(RamAllocations::default()),
                lock: Mutex::new(()),
            }),
        })
    }
}

/// The `Vm` struct represents a virtual machine. Clones refer to the same VM, such that every
/// virtual CPU thread can hold on to one.
pub struct Vm<H: Hypervisor> {
    pub(crate) context: Arc<VmContext<H>>,
}

impl<H: Hypervisor> Clone for Vm<H> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
        }
    }
}

impl<H: Hypervisor> Vm<H> {
    /// The hypervisor backing this VM.
    pub fn hypervisor(&self) -> &H {
        &self.context.hypervisor
    }

    /// The maximum number of virtual CPUs.
    pub fn vcpu_count(&self) -> usize {
        self.context.vcpu_count
    }

    /// The memory slot table of the VM.
    pub fn slots(&self) -> &SlotTable {
        &self.context.slots
    }

    /// Acquires the lock that serializes the device models. [`Vcpu::run`] expects the caller to
    /// hold it and releases it while the guest executes.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.context.lock.lock()
    }

    /// Creates a virtual CPU, using `apic` as its local APIC. Returns the virtual CPU, which must
    /// be run on the thread that created it, and a handle through which other threads deliver
    /// interrupts to it.
    pub fn create_vcpu(&self, apic: Arc<dyn Apic>) -> Result<(Vcpu<H>, VcpuHandle<H>), Error> {
        let hw = self.context.hypervisor.create_vcpu()?;
        let line = Arc::new(InterruptLine::new());
        let handle = VcpuHandle::new(hw.id(), line.clone(), self.context.hypervisor.clone());

        debug!("vcpu {}: created", hw.id());

        let vcpu = Vcpu::new(hw, self.context.clone(), line, apic)?;

        Ok((vcpu, handle))
    }

    /// Maps host memory into the guest physical address space.
    ///
    /// # Safety
    ///
    /// The host memory must remain mapped for as long as it is mapped into the guest.
    pub unsafe fn map(
        &self,
        hva: *mut u8,
        gpa: u64,
        size: u64,
        protection: ProtectionFlags,
    ) -> Result<(), Error> {
        self.context.slots.map(&*self.context.hypervisor, hva, gpa, size, protection)
    }

    /// Unmaps the guest physical range, which must match a mapping exactly.
    pub fn unmap(&self, gpa: u64, size: u64) -> Result<(), Error> {
        self.context.slots.unmap(&*self.context.hypervisor, gpa, size)
    }

    /// Changes the protection flags of the guest physical range.
    pub fn protect(&self, gpa: u64, size: u64, protection: ProtectionFlags) -> Result<(), Error> {
        self.context.slots.protect(&*self.context.hypervisor, gpa, size, protection)
    }

    /// Replaces the host memory backing the mapping at `gpa`.
    ///
    /// # Safety
    ///
    /// The new host memory must cover the whole mapping and remain mapped for as long as it is
    /// mapped into the guest.
    pub unsafe fn remap(&self, gpa: u64, hva: *mut u8) -> Result<(), Error> {
        self.context.slots.remap(&*self.context.hypervisor, gpa, hva)
    }

    /// Notifies the VM that the memory subsystem added a RAM region.
    ///
    /// # Safety
    ///
    /// The host memory must remain mapped until the region is removed.
    pub unsafe fn region_add(
        &self,
        hva: *mut u8,
        gpa: u64,
        size: u64,
        protection: ProtectionFlags,
    ) -> Result<(), Error> {
        self.context.slots.region_add(&*self.context.hypervisor, hva, gpa, size, protection)
    }

    /// Notifies the VM that the memory subsystem removed a RAM region.
    pub fn region_del(&self, gpa: u64, size: u64) -> Result<(), Error> {
        self.context.slots.region_del(&*self.context.hypervisor, gpa, size)
    }

    /// Allocates guest physical memory into the VM's address space at the given guest address with
    /// the given size. The size must be aligned to the page size. The memory stays allocated until
    /// it is released through [`Self::free_ram`] or the VM is dropped.
    pub fn allocate_ram(
        &self,
        gpa: u64,
        size: usize,
        protection: ProtectionFlags,
    ) -> Result<(), Error> {
        let mut mapping = MmapOptions::new(size)?.map_mut()?;

        unsafe {
            self.map(mapping.as_mut_ptr(), gpa, size as u64, protection)?;
        }

        let mut ram = self.context.ram.lock();

        ram.ranges.insert(gpa..gpa + size as u64, gpa);
        ram.mappings.insert(gpa, mapping);

        Ok(())
    }

    /// Unmaps and releases memory allocated through [`Self::allocate_ram`]. The address may lie
    /// anywhere within the allocation.
    pub fn free_ram(&self, gpa: u64) -> Result<(), Error> {
        let mut ram = self.context.ram.lock();

        // Look up the base guest address.
        let range = match ram.ranges.get_key_value(&gpa) {
            Some((range, _)) => range.clone(),
            _ => return Err(Error::InvalidGuestAddress(gpa)),
        };

        self.unmap(range.start, range.end - range.start)?;

        ram.mappings.remove(&range.start);
        ram.ranges.remove(range);

        Ok(())
    }

    /// Reads guest physical memory. Ranges outside of RAM are read from the I/O bus.
    pub fn read_physical(&self, gpa: u64, bytes: &mut [u8]) {
        self.context.memory().read_physical(gpa, bytes)
    }

    /// Writes guest physical memory. Ranges outside of RAM are written to the I/O bus.
    pub fn write_physical(&self, gpa: u64, bytes: &[u8]) {
        self.context.memory().write_physical(gpa, bytes)
    }

    /// Synchronizes the time-stamp counters of all virtual CPUs.
    pub fn sync_tsc(&self, tsc: u64) -> Result<(), Error> {
        self.context.hypervisor.sync_tsc(tsc)
    }
}
