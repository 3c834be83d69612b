//! This module provides [`VmxExt`], a set of helpers layered on top of [`HypervisorVcpu`] that
//! program the VMCS the way the rest of the core expects: segment registers, control registers,
//! interrupt windows and event injection.

use crate::arch::x86_64::*;
use crate::decode::CodeSize;
use crate::error::Error;
use crate::hypervisor::HypervisorVcpu;
use crate::mmu::GuestMemory;
use log::trace;

/// The CR0 bits owned by the host: guest reads of these bits return the read shadow.
pub const CR0_HOST_MASK: u64 = CR0_CD | CR0_NE | CR0_PG;
/// The CR4 bits owned by the host.
pub const CR4_HOST_MASK: u64 = CR4_VMXE;

/// The access rights type of a busy 64-bit TSS.
const AR_TYPE_BUSY_64_TSS: u64 = 11;
const AR_TYPE_MASK: u64 = 0xf;

/// Extends [`HypervisorVcpu`] with helpers to manipulate the guest state held in the VMCS.
pub trait VmxExt: HypervisorVcpu {
    /// Reads a segment register.
    fn read_segment(&self, register: SegmentRegister) -> Result<Segment, Error> {
        let fields = register.vmcs_fields();

        let selector = self.read_vmcs(fields.0)?;
        let base = self.read_vmcs(fields.1)?;
        let limit = self.read_vmcs(fields.2)?;
        let access_rights = self.read_vmcs(fields.3)?;

        Ok(Segment::with_access_rights(base, limit as u32, selector as u16, access_rights))
    }

    /// Writes a segment register.
    fn write_segment(&mut self, register: SegmentRegister, segment: &Segment) -> Result<(), Error> {
        let fields = register.vmcs_fields();

        self.write_vmcs(fields.0, segment.selector as u64)?;
        self.write_vmcs(fields.1, segment.base)?;
        self.write_vmcs(fields.2, segment.limit as u64)?;
        self.write_vmcs(fields.3, segment.access_rights())?;

        Ok(())
    }

    /// Reads a descriptor table register.
    fn read_descriptor_table(&self, register: DescriptorTableRegister) -> Result<DescriptorTable, Error> {
        let (base, limit) = register.vmcs_fields();

        Ok(DescriptorTable {
            base: self.read_vmcs(base)?,
            limit: self.read_vmcs(limit)? as u16,
        })
    }

    /// Writes a descriptor table register.
    fn write_descriptor_table(
        &mut self,
        register: DescriptorTableRegister,
        table: &DescriptorTable,
    ) -> Result<(), Error> {
        let (base, limit) = register.vmcs_fields();

        self.write_vmcs(base, table.base)?;
        self.write_vmcs(limit, table.limit as u64)?;

        Ok(())
    }

    /// Returns CR0 as the guest sees it.
    fn guest_cr0(&self) -> Result<u64, Error> {
        let mask = self.read_vmcs(Vmcs::Cr0Mask)?;

        Ok((self.read_vmcs(Vmcs::GuestCr0)? & !mask) | (self.read_vmcs(Vmcs::Cr0Shadow)? & mask))
    }

    /// Returns CR4 as the guest sees it.
    fn guest_cr4(&self) -> Result<u64, Error> {
        let mask = self.read_vmcs(Vmcs::Cr4Mask)?;

        Ok((self.read_vmcs(Vmcs::GuestCr4)? & !mask) | (self.read_vmcs(Vmcs::Cr4Shadow)? & mask))
    }

    /// Moves the instruction pointer, which ends any STI or MOV SS interrupt shadow.
    fn set_rip(&mut self, rip: u64) -> Result<(), Error> {
        self.write_register(Register::Rip, rip)?;

        let interruptibility = self.read_vmcs(Vmcs::GuestInterruptibility)?;
        let cleared = interruptibility & !(INTERRUPTIBILITY_STI | INTERRUPTIBILITY_MOVSS);

        if cleared != interruptibility {
            self.write_vmcs(Vmcs::GuestInterruptibility, cleared)?;
        }

        Ok(())
    }

    /// Skips the instruction that caused the VM exit.
    fn skip_instruction(&mut self, length: u64) -> Result<(), Error> {
        let rip = self.read_register(Register::Rip)?;

        self.set_rip(rip.wrapping_add(length))
    }

    /// Loads the PAE page-directory-pointer table entries that VM entry uses in place of the
    /// guest's PDPTE registers. They are only used for PAE paging outside of long mode.
    fn load_pdptes(&mut self, memory: &GuestMemory<'_>, cr0: u64) -> Result<(), Error> {
        let efer = self.read_vmcs(Vmcs::GuestEfer)?;
        let mut pdptes = [0u64; 4];

        if cr0 & CR0_PG != 0 && self.read_vmcs(Vmcs::GuestCr4)? & CR4_PAE != 0 && efer & EFER_LME == 0 {
            let cr3 = self.read_vmcs(Vmcs::GuestCr3)? & !0x1f;

            for (index, pdpte) in pdptes.iter_mut().enumerate() {
                *pdpte = memory.read_u64(cr3 + index as u64 * 8);
            }
        }

        let fields = [Vmcs::GuestPdpte0, Vmcs::GuestPdpte1, Vmcs::GuestPdpte2, Vmcs::GuestPdpte3];

        for (field, pdpte) in fields.iter().zip(pdptes.iter()) {
            self.write_vmcs(*field, *pdpte)?;
        }

        Ok(())
    }

    /// Performs a guest write to CR0, entering or leaving long mode as needed.
    fn set_cr0(&mut self, memory: &GuestMemory<'_>, cr0: u64) -> Result<(), Error> {
        let efer = self.read_vmcs(Vmcs::GuestEfer)?;
        let old_cr0 = self.read_vmcs(Vmcs::GuestCr0)?;

        self.load_pdptes(memory, cr0)?;

        self.write_vmcs(Vmcs::Cr0Mask, CR0_HOST_MASK)?;
        self.write_vmcs(Vmcs::Cr0Shadow, cr0)?;
        self.write_vmcs(Vmcs::GuestCr0, (cr0 & !CR0_CD) | CR0_NE | CR0_ET)?;

        if efer & EFER_LME != 0 {
            if old_cr0 & CR0_PG == 0 && cr0 & CR0_PG != 0 {
                self.enter_long_mode(efer)?;
            }

            if cr0 & CR0_PG == 0 {
                self.exit_long_mode(efer)?;
            }
        }

        self.invalidate_tlb()?;
        self.flush()?;

        Ok(())
    }

    /// Activates IA-32e mode: sets EFER.LMA, enables the IA-32e entry control and makes sure the
    /// task register describes a busy 64-bit TSS, as VM entry requires.
    fn enter_long_mode(&mut self, efer: u64) -> Result<(), Error> {
        trace!("vcpu {}: entering long mode", self.id());

        self.write_vmcs(Vmcs::GuestEfer, efer | EFER_LMA)?;

        let controls = self.read_vmcs(Vmcs::VmEntryControls)?;
        self.write_vmcs(Vmcs::VmEntryControls, controls | VmEntryControls::GUEST_IA32E.bits() as u64)?;

        let tr_ar = self.read_vmcs(Vmcs::GuestTrAccessRights)?;

        if tr_ar & AR_TYPE_MASK != AR_TYPE_BUSY_64_TSS {
            self.write_vmcs(Vmcs::GuestTrAccessRights, (tr_ar & !AR_TYPE_MASK) | AR_TYPE_BUSY_64_TSS)?;
        }

        Ok(())
    }

    /// Deactivates IA-32e mode.
    fn exit_long_mode(&mut self, efer: u64) -> Result<(), Error> {
        trace!("vcpu {}: leaving long mode", self.id());

        let controls = self.read_vmcs(Vmcs::VmEntryControls)?;
        self.write_vmcs(Vmcs::VmEntryControls, controls & !(VmEntryControls::GUEST_IA32E.bits() as u64))?;
        self.write_vmcs(Vmcs::GuestEfer, efer & !EFER_LMA)?;

        Ok(())
    }

    /// Performs a guest write to CR4. VMX operation requires CR4.VMXE, which is hidden from the
    /// guest through the read shadow.
    fn set_cr4(&mut self, cr4: u64) -> Result<(), Error> {
        self.write_vmcs(Vmcs::Cr4Mask, CR4_HOST_MASK)?;
        self.write_vmcs(Vmcs::GuestCr4, cr4 | CR4_VMXE)?;
        self.write_vmcs(Vmcs::Cr4Shadow, cr4)?;

        self.invalidate_tlb()?;
        self.flush()?;

        Ok(())
    }

    /// Writes EFER, keeping the IA-32e entry control in sync with EFER.LMA.
    fn set_efer(&mut self, efer: u64) -> Result<(), Error> {
        let controls = self.read_vmcs(Vmcs::VmEntryControls)?;
        let ia32e = VmEntryControls::GUEST_IA32E.bits() as u64;

        let controls = if efer & EFER_LMA != 0 {
            controls | ia32e
        } else {
            controls & !ia32e
        };

        self.write_vmcs(Vmcs::VmEntryControls, controls)?;
        self.write_vmcs(Vmcs::GuestEfer, efer)?;

        Ok(())
    }

    /// Enables or disables a primary processor-based execution control.
    fn set_cpu_based(&mut self, control: CpuBased, enabled: bool) -> Result<(), Error> {
        let value = self.read_vmcs(Vmcs::CpuBased)?;
        let bits = control.bits() as u64;

        let updated = if enabled { value | bits } else { value & !bits };

        if updated != value {
            self.write_vmcs(Vmcs::CpuBased, updated)?;
        }

        Ok(())
    }

    /// Requests a VM exit as soon as the guest can take an external interrupt.
    fn set_interrupt_window(&mut self, enabled: bool) -> Result<(), Error> {
        self.set_cpu_based(CpuBased::IRQ_WND, enabled)
    }

    /// Requests a VM exit as soon as the guest can take an NMI.
    fn set_nmi_window(&mut self, enabled: bool) -> Result<(), Error> {
        self.set_cpu_based(CpuBased::VIRTUAL_NMI_WND, enabled)
    }

    /// Returns `true` if NMIs are currently blocked.
    fn nmi_blocked(&self) -> Result<bool, Error> {
        Ok(self.read_vmcs(Vmcs::GuestInterruptibility)? & INTERRUPTIBILITY_NMI != 0)
    }

    /// Blocks or unblocks NMIs.
    fn set_nmi_blocking(&mut self, blocked: bool) -> Result<(), Error> {
        let value = self.read_vmcs(Vmcs::GuestInterruptibility)?;

        let updated = if blocked {
            value | INTERRUPTIBILITY_NMI
        } else {
            value & !INTERRUPTIBILITY_NMI
        };

        self.write_vmcs(Vmcs::GuestInterruptibility, updated)
    }

    /// Returns `true` if an event is already queued for injection on the next VM entry.
    fn event_pending(&self) -> Result<bool, Error> {
        Ok(self.read_vmcs(Vmcs::EntryIntrInfo)? & INTR_INFO_VALID != 0)
    }

    /// Queues a hardware exception for injection on the next VM entry.
    fn inject_exception(&mut self, vector: u8, error_code: Option<u32>) -> Result<(), Error> {
        let mut info = INTR_INFO_VALID | INTR_TYPE_HW_EXCEPTION | vector as u64;

        if let Some(error_code) = error_code {
            info |= INTR_INFO_DELIVER_CODE;
            self.write_vmcs(Vmcs::EntryExceptionError, error_code as u64)?;
        }

        trace!("vcpu {}: injecting exception {}", self.id(), vector);

        self.write_vmcs(Vmcs::EntryIntrInfo, info)
    }

    /// Returns `true` if the guest is executing in IA-32e mode.
    fn long_mode_active(&self) -> Result<bool, Error> {
        Ok(self.read_vmcs(Vmcs::GuestEfer)? & EFER_LMA != 0)
    }

    /// Determines the default operand and address size of the code segment.
    fn code_size(&self) -> Result<CodeSize, Error> {
        let cs = self.read_segment(SegmentRegister::Cs)?;

        Ok(if self.long_mode_active()? && cs.long {
            CodeSize::Bits64
        } else if self.read_vmcs(Vmcs::GuestCr0)? & CR0_PE != 0 && cs.default {
            CodeSize::Bits32
        } else {
            CodeSize::Bits16
        })
    }
}

impl<T: HypervisorVcpu + ?Sized> VmxExt for T {}
