use crate::arch::x86_64::*;
use crate::error::Error;
use crate::hypervisor::HypervisorVcpu;
use super::bindings::*;

/// A virtual CPU of the Hypervisor Framework. It is bound to the thread that created it.
pub struct MacVcpu {
    pub(crate) vcpu: hv_vcpuid_t,
}

fn to_hv_register(register: Register) -> hv_x86_reg_t {
    match register {
        Register::Rax    => hv_x86_reg_t::HV_X86_RAX,
        Register::Rcx    => hv_x86_reg_t::HV_X86_RCX,
        Register::Rdx    => hv_x86_reg_t::HV_X86_RDX,
        Register::Rbx    => hv_x86_reg_t::HV_X86_RBX,
        Register::Rsp    => hv_x86_reg_t::HV_X86_RSP,
        Register::Rbp    => hv_x86_reg_t::HV_X86_RBP,
        Register::Rsi    => hv_x86_reg_t::HV_X86_RSI,
        Register::Rdi    => hv_x86_reg_t::HV_X86_RDI,
        Register::R8     => hv_x86_reg_t::HV_X86_R8,
        Register::R9     => hv_x86_reg_t::HV_X86_R9,
        Register::R10    => hv_x86_reg_t::HV_X86_R10,
        Register::R11    => hv_x86_reg_t::HV_X86_R11,
        Register::R12    => hv_x86_reg_t::HV_X86_R12,
        Register::R13    => hv_x86_reg_t::HV_X86_R13,
        Register::R14    => hv_x86_reg_t::HV_X86_R14,
        Register::R15    => hv_x86_reg_t::HV_X86_R15,
        Register::Rip    => hv_x86_reg_t::HV_X86_RIP,
        Register::Rflags => hv_x86_reg_t::HV_X86_RFLAGS,
        Register::Cr2    => hv_x86_reg_t::HV_X86_CR2,
        Register::Xcr0   => hv_x86_reg_t::HV_X86_XCR0,
        Register::Tpr    => hv_x86_reg_t::HV_X86_TPR,
    }
}

impl HypervisorVcpu for MacVcpu {
    fn id(&self) -> u32 {
        self.vcpu
    }

    fn read_register(&self, register: Register) -> Result<u64, Error> {
        let mut value = 0;

        unsafe {
            hv_vcpu_read_register(self.vcpu, to_hv_register(register), &mut value)
        }.into_result()?;

        Ok(value)
    }

    fn write_register(&mut self, register: Register, value: u64) -> Result<(), Error> {
        unsafe {
            hv_vcpu_write_register(self.vcpu, to_hv_register(register), value)
        }.into_result()
    }

    fn read_vmcs(&self, field: Vmcs) -> Result<u64, Error> {
        let mut value = 0;

        unsafe {
            hv_vmx_vcpu_read_vmcs(self.vcpu, field, &mut value)
        }.into_result()?;

        Ok(value)
    }

    fn write_vmcs(&mut self, field: Vmcs, value: u64) -> Result<(), Error> {
        unsafe {
            hv_vmx_vcpu_write_vmcs(self.vcpu, field, value)
        }.into_result()
    }

    fn read_msr(&self, msr: u32) -> Result<u64, Error> {
        let mut value = 0;

        unsafe {
            hv_vcpu_read_msr(self.vcpu, msr, &mut value)
        }.into_result()?;

        Ok(value)
    }

    fn write_msr(&mut self, msr: u32, value: u64) -> Result<(), Error> {
        unsafe {
            hv_vcpu_write_msr(self.vcpu, msr, value)
        }.into_result()
    }

    fn enable_native_msr(&mut self, msr: u32, enabled: bool) -> Result<(), Error> {
        unsafe {
            hv_vcpu_enable_native_msr(self.vcpu, msr, enabled)
        }.into_result()
    }

    fn read_capability(&self, capability: VmxCapability) -> Result<u64, Error> {
        let mut value = 0;

        unsafe {
            hv_vmx_read_capability(capability, &mut value)
        }.into_result()?;

        Ok(value)
    }

    fn run(&mut self) -> Result<(), Error> {
        unsafe {
            hv_vcpu_run(self.vcpu)
        }.into_result()
    }

    fn invalidate_tlb(&mut self) -> Result<(), Error> {
        unsafe {
            hv_vcpu_invalidate_tlb(self.vcpu)
        }.into_result()
    }

    fn flush(&mut self) -> Result<(), Error> {
        unsafe {
            hv_vcpu_flush(self.vcpu)
        }.into_result()
    }
}

impl Drop for MacVcpu {
    fn drop(&mut self) {
        unsafe {
            hv_vcpu_destroy(self.vcpu)
        };
    }
}
