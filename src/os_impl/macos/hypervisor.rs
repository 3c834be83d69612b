use crate::error::Error;
use crate::hypervisor::Hypervisor;
use crate::vm::ProtectionFlags;
use log::debug;
use super::bindings::*;
use super::vcpu::MacVcpu;

fn memory_flags(protection: ProtectionFlags) -> hv_memory_flags_t {
    let mut flags = 0;

    if protection.contains(ProtectionFlags::READ) {
        flags |= HV_MEMORY_READ;
    }

    if protection.contains(ProtectionFlags::WRITE) {
        flags |= HV_MEMORY_WRITE;
    }

    if protection.contains(ProtectionFlags::EXECUTE) {
        flags |= HV_MEMORY_EXEC;
    }

    flags
}

/// The Hypervisor Framework of macOS. The framework supports a single VM per process, which is
/// created along with this struct and destroyed when it is dropped.
pub struct MacHypervisor {
    _private: (),
}

impl MacHypervisor {
    pub fn new() -> Result<Self, Error> {
        unsafe {
            hv_vm_create(HV_VM_DEFAULT)
        }.into_result()?;

        debug!("created Hypervisor.framework VM");

        Ok(Self {
            _private: (),
        })
    }
}

impl Hypervisor for MacHypervisor {
    type Vcpu = MacVcpu;

    fn create_vcpu(&self) -> Result<MacVcpu, Error> {
        let mut vcpu = 0;

        unsafe {
            hv_vcpu_create(&mut vcpu, HV_VCPU_DEFAULT)
        }.into_result()?;

        Ok(MacVcpu {
            vcpu,
        })
    }

    unsafe fn map(
        &self,
        hva: *mut u8,
        gpa: u64,
        size: u64,
        protection: ProtectionFlags,
    ) -> Result<(), Error> {
        hv_vm_map(
            hva as *const std::ffi::c_void,
            gpa,
            size as usize,
            memory_flags(protection),
        ).into_result()
    }

    fn unmap(&self, gpa: u64, size: u64) -> Result<(), Error> {
        unsafe {
            hv_vm_unmap(gpa, size as usize)
        }.into_result()
    }

    fn protect(&self, gpa: u64, size: u64, protection: ProtectionFlags) -> Result<(), Error> {
        unsafe {
            hv_vm_protect(gpa, size as usize, memory_flags(protection))
        }.into_result()
    }

    fn kick(&self, vcpus: &[u32]) -> Result<(), Error> {
        unsafe {
            hv_vcpu_interrupt(vcpus.as_ptr(), vcpus.len() as _)
        }.into_result()
    }

    fn sync_tsc(&self, tsc: u64) -> Result<(), Error> {
        unsafe {
            hv_vm_sync_tsc(tsc)
        }.into_result()
    }
}

impl Drop for MacHypervisor {
    fn drop(&mut self) {
        unsafe {
            hv_vm_destroy();
        }
    }
}
