//! This module provides [`VcpuState`], the in-memory copy of the guest register file that the
//! emulator and the task switcher operate on, and the synchronization of that copy with the
//! hardware virtual CPU.
//!
//! The hardware copy is authoritative unless [`VcpuState::dirty`] is set. The run loop pushes a
//! dirty state before entering the guest; handlers pull before they read.

use crate::arch::x86_64::*;
use crate::decode::CodeSize;
use crate::error::Error;
use crate::flags::{LazyFlags, RFlags, Width};
use crate::hypervisor::HypervisorVcpu;
use crate::mmu::PagingContext;
use crate::vmx::{VmxExt, CR0_HOST_MASK, CR4_HOST_MASK};

/// The register file of a virtual CPU.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VcpuState {
    /// The general-purpose registers, in encoding order.
    pub regs: [u64; 16],
    pub rip: u64,
    /// RFLAGS. The arithmetic flags in here are stale, the authoritative copy lives in
    /// [`Self::lflags`].
    pub rflags: u64,
    pub lflags: LazyFlags,
    /// The segment registers, indexed by [`SegmentRegister`].
    pub segments: [Segment; 8],
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    /// CR0 as seen by the guest.
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    /// CR4 as seen by the guest.
    pub cr4: u64,
    pub efer: u64,
    pub xcr0: u64,
    /// Set when this copy is newer than the hardware copy.
    pub dirty: bool,
    /// Scratch space for memory operands.
    pub mmio_buf: [u8; 8],
}

impl VcpuState {
    /// Returns RFLAGS with the arithmetic flags materialized.
    pub fn rflags(&self) -> u64 {
        self.lflags.materialize(self.rflags)
    }

    pub fn set_rflags(&mut self, rflags: u64) {
        self.rflags = rflags;
        self.lflags.load_rflags(rflags);
    }

    /// Tests one of the flags that are not tracked lazily, e.g. DF or IF.
    pub fn flag(&self, flag: RFlags) -> bool {
        self.rflags & flag.bits() != 0
    }

    pub fn segment(&self, register: SegmentRegister) -> &Segment {
        &self.segments[register as usize]
    }

    pub fn set_segment(&mut self, register: SegmentRegister, segment: Segment) {
        self.segments[register as usize] = segment;
    }

    /// Reads the low `width` bytes of a general-purpose register.
    pub fn read_gpr(&self, index: u8, width: Width) -> u64 {
        width.truncate(self.regs[index as usize & 0xf])
    }

    /// Writes the low `width` bytes of a general-purpose register. As on hardware, 32-bit writes
    /// clear the upper half while 8-bit and 16-bit writes leave the remaining bits alone.
    pub fn write_gpr(&mut self, index: u8, width: Width, value: u64) {
        let register = &mut self.regs[index as usize & 0xf];

        *register = match width {
            Width::Qword => value,
            Width::Dword => value & 0xffff_ffff,
            _ => (*register & !width.mask()) | width.truncate(value),
        };
    }

    /// Reads AH, CH, DH or BH.
    pub fn read_high_byte(&self, index: u8) -> u64 {
        (self.regs[index as usize & 0x3] >> 8) & 0xff
    }

    /// Writes AH, CH, DH or BH.
    pub fn write_high_byte(&mut self, index: u8, value: u64) {
        let register = &mut self.regs[index as usize & 0x3];

        *register = (*register & !0xff00) | ((value & 0xff) << 8);
    }

    /// The current privilege level, which always equals the DPL of SS.
    pub fn cpl(&self) -> u8 {
        if self.cr0 & CR0_PE == 0 {
            0
        } else {
            self.segment(SegmentRegister::Ss).dpl
        }
    }

    pub fn long_mode(&self) -> bool {
        self.efer & EFER_LMA != 0
    }

    pub fn code_size(&self) -> CodeSize {
        let cs = self.segment(SegmentRegister::Cs);

        if self.long_mode() && cs.long {
            CodeSize::Bits64
        } else if self.cr0 & CR0_PE != 0 && cs.default {
            CodeSize::Bits32
        } else {
            CodeSize::Bits16
        }
    }

    /// The state that controls linear address translation.
    pub fn paging(&self) -> PagingContext {
        PagingContext {
            cr0: self.cr0,
            cr3: self.cr3,
            cr4: self.cr4,
            efer: self.efer,
        }
    }

    /// Loads the general-purpose registers, RIP and RFLAGS from the hardware.
    pub fn pull_gprs<V: HypervisorVcpu>(&mut self, vcpu: &V) -> Result<(), Error> {
        for (value, register) in self.regs.iter_mut().zip(Register::GPRS.iter()) {
            *value = vcpu.read_register(*register)?;
        }

        self.rip = vcpu.read_register(Register::Rip)?;
        let rflags = vcpu.read_register(Register::Rflags)?;
        self.set_rflags(rflags);

        Ok(())
    }

    /// Stores the general-purpose registers, RIP and RFLAGS into the hardware. Moving RIP ends
    /// any interrupt shadow.
    pub fn push_gprs<V: HypervisorVcpu>(&self, vcpu: &mut V) -> Result<(), Error> {
        for (value, register) in self.regs.iter().zip(Register::GPRS.iter()) {
            vcpu.write_register(*register, *value)?;
        }

        vcpu.write_register(Register::Rflags, self.rflags())?;

        if vcpu.read_register(Register::Rip)? != self.rip {
            vcpu.set_rip(self.rip)?;
        }

        Ok(())
    }

    /// Loads the complete register file from the hardware.
    pub fn pull<V: HypervisorVcpu>(&mut self, vcpu: &V) -> Result<(), Error> {
        self.pull_gprs(vcpu)?;

        for register in SegmentRegister::ALL.iter() {
            self.segments[*register as usize] = vcpu.read_segment(*register)?;
        }

        self.gdt = vcpu.read_descriptor_table(DescriptorTableRegister::Gdt)?;
        self.idt = vcpu.read_descriptor_table(DescriptorTableRegister::Idt)?;

        self.cr0 = vcpu.guest_cr0()?;
        self.cr2 = vcpu.read_register(Register::Cr2)?;
        self.cr3 = vcpu.read_vmcs(Vmcs::GuestCr3)?;
        self.cr4 = vcpu.guest_cr4()?;
        self.efer = vcpu.read_vmcs(Vmcs::GuestEfer)?;
        self.xcr0 = vcpu.read_register(Register::Xcr0)?;

        Ok(())
    }

    /// Stores the complete register file into the hardware. EFER goes first so that the IA-32e
    /// entry control matches the segments and control registers that follow.
    pub fn push<V: HypervisorVcpu>(&self, vcpu: &mut V) -> Result<(), Error> {
        vcpu.set_efer(self.efer)?;

        for register in SegmentRegister::ALL.iter() {
            vcpu.write_segment(*register, &self.segments[*register as usize])?;
        }

        vcpu.write_descriptor_table(DescriptorTableRegister::Gdt, &self.gdt)?;
        vcpu.write_descriptor_table(DescriptorTableRegister::Idt, &self.idt)?;

        vcpu.write_vmcs(Vmcs::Cr0Mask, CR0_HOST_MASK)?;
        vcpu.write_vmcs(Vmcs::Cr0Shadow, self.cr0)?;
        vcpu.write_vmcs(Vmcs::GuestCr0, (self.cr0 & !CR0_CD) | CR0_NE | CR0_ET)?;
        vcpu.write_register(Register::Cr2, self.cr2)?;
        vcpu.write_vmcs(Vmcs::GuestCr3, self.cr3)?;
        vcpu.write_vmcs(Vmcs::Cr4Mask, CR4_HOST_MASK)?;
        vcpu.write_vmcs(Vmcs::Cr4Shadow, self.cr4)?;
        vcpu.write_vmcs(Vmcs::GuestCr4, self.cr4 | CR4_VMXE)?;
        vcpu.write_register(Register::Xcr0, self.xcr0)?;

        self.push_gprs(vcpu)?;

        vcpu.invalidate_tlb()?;
        vcpu.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeVcpu;
    use proptest::prelude::*;

    #[test]
    fn partial_register_writes() {
        let mut state = VcpuState::default();

        state.regs[0] = 0x1122_3344_5566_7788;

        state.write_gpr(0, Width::Byte, 0xff);
        assert_eq!(state.regs[0], 0x1122_3344_5566_77ff);

        state.write_gpr(0, Width::Word, 0xaaaa);
        assert_eq!(state.regs[0], 0x1122_3344_5566_aaaa);

        state.write_high_byte(0, 0x12);
        assert_eq!(state.read_high_byte(0), 0x12);
        assert_eq!(state.read_gpr(0, Width::Word), 0x12aa);

        state.write_gpr(0, Width::Dword, 0xdead_beef);
        assert_eq!(state.regs[0], 0xdead_beef);
    }

    #[test]
    fn push_gprs_ends_the_interrupt_shadow() {
        let mut vcpu = FakeVcpu::new(0);
        let mut state = VcpuState::default();

        vcpu.write_vmcs(Vmcs::GuestInterruptibility, INTERRUPTIBILITY_STI).unwrap();
        state.pull_gprs(&vcpu).unwrap();

        state.rip = 0x1003;
        state.push_gprs(&mut vcpu).unwrap();

        assert_eq!(vcpu.register(Register::Rip), 0x1003);
        assert_eq!(vcpu.field(Vmcs::GuestInterruptibility), 0);
    }

    fn segment() -> impl Strategy<Value = Segment> {
        (any::<u32>(), any::<u32>(), any::<u16>(), any::<u64>()).prop_map(
            |(base, limit, selector, access_rights)| {
                Segment::with_access_rights(base as u64, limit, selector, access_rights & 0x1_f0ff)
            },
        )
    }

    prop_compose! {
        fn state()(
            regs in any::<[u64; 16]>(),
            rip in any::<u64>(),
            rflags in any::<u64>(),
            segments in proptest::collection::vec(segment(), 8),
            gdt in (any::<u64>(), any::<u16>()),
            idt in (any::<u64>(), any::<u16>()),
            long_mode in any::<bool>(),
            cr0 in any::<u32>(),
            cr2 in any::<u64>(),
            cr3 in any::<u64>(),
            cr4 in any::<u32>(),
            xcr0 in any::<u8>(),
        ) -> VcpuState {
            let mut state = VcpuState::default();

            state.regs = regs;
            state.rip = rip;
            state.set_rflags((rflags & RFlags::all().bits()) | RFlags::FIXED.bits());
            state.segments.copy_from_slice(&segments);
            state.gdt = DescriptorTable { base: gdt.0, limit: gdt.1 };
            state.idt = DescriptorTable { base: idt.0, limit: idt.1 };
            state.cr0 = cr0 as u64 | CR0_ET;
            state.cr2 = cr2;
            state.cr3 = cr3;
            state.cr4 = cr4 as u64;
            state.efer = if long_mode {
                EFER_SCE | EFER_LME | EFER_LMA | EFER_NXE
            } else {
                EFER_NXE
            };
            state.xcr0 = xcr0 as u64 | 1;

            state
        }
    }

    proptest! {
        #[test]
        fn push_then_pull_is_identity(state in state()) {
            let mut vcpu = FakeVcpu::new(0);
            let mut pulled = VcpuState::default();

            state.push(&mut vcpu).unwrap();
            pulled.pull(&vcpu).unwrap();

            prop_assert_eq!(pulled.regs, state.regs);
            prop_assert_eq!(pulled.rip, state.rip);
            prop_assert_eq!(pulled.rflags(), state.rflags());
            prop_assert_eq!(pulled.segments, state.segments);
            prop_assert_eq!(pulled.gdt, state.gdt);
            prop_assert_eq!(pulled.idt, state.idt);
            prop_assert_eq!(pulled.cr0, state.cr0);
            prop_assert_eq!(pulled.cr2, state.cr2);
            prop_assert_eq!(pulled.cr3, state.cr3);
            prop_assert_eq!(pulled.cr4, state.cr4);
            prop_assert_eq!(pulled.efer, state.efer);
            prop_assert_eq!(pulled.xcr0, state.xcr0);

            let ia32e = vcpu.field(Vmcs::VmEntryControls) & VmEntryControls::GUEST_IA32E.bits() as u64;
            prop_assert_eq!(ia32e != 0, state.long_mode());
        }
    }
}
