//! This module provides the emulation of the model-specific registers that are not passed through
//! to the guest.

use crate::arch::x86_64::*;
use crate::error::Error;
use crate::hypervisor::HypervisorVcpu;
use crate::irq::Apic;
use log::{debug, warn};

/// The MTRR capabilities: eight variable ranges, fixed ranges and write-combining.
const MSR_MTRR_CAP: u32 = 0x0000_00fe;
const MTRR_CAP_VALUE: u64 = MSR_MTRR_VAR_COUNT as u64 | (1 << 8) | (1 << 10);

/// Fast-string operations enabled.
const MISC_ENABLE_DEFAULT: u64 = 1;

/// The microcode revision reported to the guest, in the upper half of the MSR.
const UCODE_REV_VALUE: u64 = 0x1_0000_0000;

const FIXED_MTRR_COUNT: usize = 11;

/// The MSRs that the guest reads and writes without a VM exit.
pub const NATIVE_MSRS: [u32; 10] = [
    MSR_IA32_STAR,
    MSR_IA32_LSTAR,
    MSR_IA32_CSTAR,
    MSR_IA32_SYSCALL_MASK,
    MSR_IA32_FS_BASE,
    MSR_IA32_GS_BASE,
    MSR_IA32_KERNEL_GS_BASE,
    MSR_IA32_TSC_AUX,
    MSR_IA32_SYSENTER_CS,
    MSR_IA32_SYSENTER_ESP,
];

/// What to do when the guest accesses an MSR that is not emulated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnknownMsrPolicy {
    /// Reads return zero, writes are discarded.
    Ignore,
    /// The access raises a general-protection fault in the guest.
    InjectGp,
}

impl Default for UnknownMsrPolicy {
    fn default() -> Self {
        UnknownMsrPolicy::Ignore
    }
}

/// The per-VCPU shadow state of the emulated MSRs.
#[derive(Clone, Debug)]
pub struct MsrFile {
    policy: UnknownMsrPolicy,
    mtrr_variable: [u64; 2 * MSR_MTRR_VAR_COUNT as usize],
    mtrr_fixed: [u64; FIXED_MTRR_COUNT],
    mtrr_default_type: u64,
    misc_enable: u64,
}

impl MsrFile {
    pub fn new(policy: UnknownMsrPolicy) -> Self {
        Self {
            policy,
            mtrr_variable: [0; 2 * MSR_MTRR_VAR_COUNT as usize],
            mtrr_fixed: [0; FIXED_MTRR_COUNT],
            mtrr_default_type: 0,
            misc_enable: MISC_ENABLE_DEFAULT,
        }
    }

    pub fn policy(&self) -> UnknownMsrPolicy {
        self.policy
    }

    /// Restores the power-on values.
    pub fn reset(&mut self) {
        *self = Self::new(self.policy);
    }

    fn fixed_mtrr(msr: u32) -> Option<usize> {
        match msr {
            MSR_MTRR_FIX64K_00000 => Some(0),
            MSR_MTRR_FIX16K_80000 => Some(1),
            MSR_MTRR_FIX16K_A0000 => Some(2),
            _ if (MSR_MTRR_FIX4K_C0000..MSR_MTRR_FIX4K_C0000 + 8).contains(&msr) => {
                Some(3 + (msr - MSR_MTRR_FIX4K_C0000) as usize)
            }
            _ => None,
        }
    }

    fn variable_mtrr(msr: u32) -> Option<usize> {
        let end = MSR_MTRR_PHYS_BASE0 + 2 * MSR_MTRR_VAR_COUNT;

        if (MSR_MTRR_PHYS_BASE0..end).contains(&msr) {
            Some((msr - MSR_MTRR_PHYS_BASE0) as usize)
        } else {
            None
        }
    }

    fn is_native(msr: u32) -> bool {
        NATIVE_MSRS.contains(&msr) || msr == MSR_IA32_SYSENTER_EIP
    }

    /// Emulates `rdmsr`. Returns `None` if the access must raise #GP.
    pub fn read<V: HypervisorVcpu>(
        &self,
        vcpu: &V,
        apic: &dyn Apic,
        msr: u32,
    ) -> Result<Option<u64>, Error> {
        let value = match msr {
            MSR_IA32_TSC => host_tsc().wrapping_add(vcpu.read_vmcs(Vmcs::TscOffset)?),
            MSR_IA32_APICBASE => apic.base(),
            MSR_IA32_UCODE_REV => UCODE_REV_VALUE,
            MSR_IA32_EFER => vcpu.read_vmcs(Vmcs::GuestEfer)?,
            MSR_IA32_FS_BASE => vcpu.read_vmcs(Vmcs::GuestFsBase)?,
            MSR_IA32_GS_BASE => vcpu.read_vmcs(Vmcs::GuestGsBase)?,
            MSR_IA32_MISC_ENABLE => self.misc_enable,
            MSR_MTRR_CAP => MTRR_CAP_VALUE,
            MSR_MTRR_DEF_TYPE => self.mtrr_default_type,
            msr if Self::is_native(msr) => vcpu.read_msr(msr)?,
            msr => {
                if let Some(index) = Self::variable_mtrr(msr) {
                    self.mtrr_variable[index]
                } else if let Some(index) = Self::fixed_mtrr(msr) {
                    self.mtrr_fixed[index]
                } else {
                    return Ok(self.unknown("read", msr));
                }
            }
        };

        Ok(Some(value))
    }

    /// Emulates `wrmsr`. Returns `false` if the access must raise #GP.
    pub fn write<V: HypervisorVcpu>(
        &mut self,
        vcpu: &mut V,
        apic: &dyn Apic,
        msr: u32,
        value: u64,
    ) -> Result<bool, Error> {
        match msr {
            MSR_IA32_TSC => {
                vcpu.write_vmcs(Vmcs::TscOffset, value.wrapping_sub(host_tsc()))?;
            }
            MSR_IA32_APICBASE => apic.set_base(value),
            MSR_IA32_UCODE_REV => (),
            MSR_IA32_EFER => {
                // LMA is owned by the processor.
                let lma = vcpu.read_vmcs(Vmcs::GuestEfer)? & EFER_LMA;

                vcpu.write_vmcs(Vmcs::GuestEfer, (value & !EFER_LMA) | lma)?;

                if value & EFER_NXE != 0 {
                    vcpu.invalidate_tlb()?;
                }
            }
            MSR_IA32_FS_BASE => vcpu.write_vmcs(Vmcs::GuestFsBase, value)?,
            MSR_IA32_GS_BASE => vcpu.write_vmcs(Vmcs::GuestGsBase, value)?,
            MSR_IA32_MISC_ENABLE => self.misc_enable = value,
            MSR_MTRR_CAP => (),
            MSR_MTRR_DEF_TYPE => self.mtrr_default_type = value,
            msr if Self::is_native(msr) => vcpu.write_msr(msr, value)?,
            msr => {
                if let Some(index) = Self::variable_mtrr(msr) {
                    self.mtrr_variable[index] = value;
                } else if let Some(index) = Self::fixed_mtrr(msr) {
                    self.mtrr_fixed[index] = value;
                } else {
                    return Ok(self.unknown("write", msr).is_some());
                }
            }
        }

        Ok(true)
    }

    fn unknown(&self, access: &str, msr: u32) -> Option<u64> {
        match self.policy {
            UnknownMsrPolicy::Ignore => {
                debug!("ignoring {} of unknown MSR {:#x}", access, msr);
                Some(0)
            }
            UnknownMsrPolicy::InjectGp => {
                warn!("{} of unknown MSR {:#x} raises #GP", access, msr);
                None
            }
        }
    }
}

impl Default for MsrFile {
    fn default() -> Self {
        Self::new(UnknownMsrPolicy::default())
    }
}
