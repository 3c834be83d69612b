//! This module provides the [`Hypervisor`] and [`HypervisorVcpu`] traits, which describe the
//! hardware virtualization facility that the virtualization core runs on top of. The core only
//! consumes these traits: a platform backend (see `os_impl`) implements them on top of the native
//! hypervisor API.

use crate::arch::x86_64::{Register, Vmcs, VmxCapability};
use crate::error::Error;
use crate::vm::ProtectionFlags;

/// The VM-level half of the hardware virtualization facility.
pub trait Hypervisor: Send + Sync + 'static {
    /// The virtual CPU type of the backend.
    type Vcpu: HypervisorVcpu;

    /// Creates a hardware virtual CPU. Some backends bind the virtual CPU to the calling thread,
    /// in which case it must be created on the thread that is going to run it.
    fn create_vcpu(&self) -> Result<Self::Vcpu, Error>;

    /// Maps `size` bytes of host memory starting at `hva` into the guest physical address space
    /// at `gpa`.
    ///
    /// # Safety
    ///
    /// The host memory must remain mapped for as long as the guest physical range is mapped.
    unsafe fn map(
        &self,
        hva: *mut u8,
        gpa: u64,
        size: u64,
        protection: ProtectionFlags,
    ) -> Result<(), Error>;

    /// Unmaps the guest physical range.
    fn unmap(&self, gpa: u64, size: u64) -> Result<(), Error>;

    /// Changes the protection of the guest physical range.
    fn protect(&self, gpa: u64, size: u64, protection: ProtectionFlags) -> Result<(), Error>;

    /// Forces the given virtual CPUs out of guest execution.
    fn kick(&self, vcpus: &[u32]) -> Result<(), Error>;

    /// Synchronizes the time-stamp counters of all virtual CPUs to `tsc`.
    fn sync_tsc(&self, tsc: u64) -> Result<(), Error>;
}

/// The virtual CPU half of the hardware virtualization facility.
pub trait HypervisorVcpu {
    /// The identifier of the virtual CPU, as passed to [`Hypervisor::kick`].
    fn id(&self) -> u32;

    /// Reads a register that is not accessed through the VMCS.
    fn read_register(&self, register: Register) -> Result<u64, Error>;

    /// Writes a register that is not accessed through the VMCS.
    fn write_register(&mut self, register: Register, value: u64) -> Result<(), Error>;

    /// Reads from a field in the VMCS.
    fn read_vmcs(&self, field: Vmcs) -> Result<u64, Error>;

    /// Writes to a field in the VMCS.
    fn write_vmcs(&mut self, field: Vmcs, value: u64) -> Result<(), Error>;

    /// Reads a MSR that is passed through to the guest.
    fn read_msr(&self, msr: u32) -> Result<u64, Error>;

    /// Writes a MSR that is passed through to the guest.
    fn write_msr(&mut self, msr: u32, value: u64) -> Result<(), Error>;

    /// Allows or disallows the guest to access the MSR without a VM exit.
    fn enable_native_msr(&mut self, msr: u32, enabled: bool) -> Result<(), Error>;

    /// Reads a VMX capability.
    fn read_capability(&self, capability: VmxCapability) -> Result<u64, Error>;

    /// Enters the guest and blocks until the next VM exit.
    fn run(&mut self) -> Result<(), Error>;

    /// Invalidates the cached guest address translations.
    fn invalidate_tlb(&mut self) -> Result<(), Error>;

    /// Flushes cached state of the virtual CPU back into the hardware.
    fn flush(&mut self) -> Result<(), Error>;
}
