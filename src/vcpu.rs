//! This modules provides the [`Vcpu`] struct which represents a single virtual CPU that is part of
//! the VM, together with the loop that enters the guest and dispatches the VM exits.
//!
//! Most exits are handled in place: the handler reads what it needs from the hardware, completes
//! the access and moves RIP past the instruction. Only exits that cannot be completed with the
//! exit information alone, such as MMIO accesses and string I/O, fall back to the instruction
//! emulator, which operates on the register file cached in [`VcpuState`].

use crate::arch::x86_64::*;
use crate::emulate::Emulator;
use crate::error::Error;
use crate::exit::*;
use crate::flags::RFlags;
use crate::hypervisor::{Hypervisor, HypervisorVcpu};
use crate::irq::{
    inject_interrupts, sync_tpr_from_hardware, sync_tpr_to_hardware, Apic, InterruptLine,
    InterruptRequest,
};
use crate::msr::{MsrFile, NATIVE_MSRS};
use crate::state::VcpuState;
use crate::task::task_switch;
use crate::vm::VmContext;
use crate::vmx::VmxExt;
use log::{debug, error, trace, warn};
use parking_lot::MutexGuard;
use std::sync::Arc;

/// The guest physical address of the local APIC page.
const APIC_ACCESS_ADDRESS: u64 = 0xfee0_0000;
const PAGE_SIZE: u64 = 0x1000;

const RAX: usize = 0;
const RCX: usize = 1;
const RDX: usize = 2;
const RBX: usize = 3;

/// The `Vcpu` struct represents a virtual CPU that is part of the VM. It must be run on the
/// thread that created it.
pub struct Vcpu<H: Hypervisor> {
    pub(crate) hw: H::Vcpu,
    vm: Arc<VmContext<H>>,
    state: VcpuState,
    msrs: MsrFile,
    line: Arc<InterruptLine>,
    apic: Arc<dyn Apic>,
    halted: bool,
    /// Whether the event that was being delivered at the last VM exit still has to be delivered.
    reinject: bool,
}

impl<H: Hypervisor> Vcpu<H> {
    pub(crate) fn new(
        hw: H::Vcpu,
        vm: Arc<VmContext<H>>,
        line: Arc<InterruptLine>,
        apic: Arc<dyn Apic>,
    ) -> Result<Self, Error> {
        let msrs = MsrFile::new(vm.msr_policy);

        let mut vcpu = Self {
            hw,
            vm,
            state: VcpuState::default(),
            msrs,
            line,
            apic,
            halted: false,
            reinject: false,
        };

        vcpu.configure()?;
        vcpu.reset()?;

        Ok(vcpu)
    }

    pub fn id(&self) -> u32 {
        self.hw.id()
    }

    /// Returns `true` if the virtual CPU is waiting for an interrupt or a startup IPI.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// The register file of the virtual CPU.
    pub fn state(&mut self) -> Result<&VcpuState, Error> {
        if !self.state.dirty {
            self.state.pull(&self.hw)?;
        }

        Ok(&self.state)
    }

    /// The register file of the virtual CPU for modification. The changes are written back to
    /// the hardware before the guest runs again.
    pub fn state_mut(&mut self) -> Result<&mut VcpuState, Error> {
        if !self.state.dirty {
            self.state.pull(&self.hw)?;
            self.state.dirty = true;
        }

        Ok(&mut self.state)
    }

    /// Programs the execution controls. The controls are adjusted to what the hardware supports.
    fn configure(&mut self) -> Result<(), Error> {
        let pin = self.hw.read_capability(VmxCapability::PinBased)?;
        let proc = self.hw.read_capability(VmxCapability::ProcBased)?;
        let proc2 = self.hw.read_capability(VmxCapability::ProcBased2)?;
        let entry = self.hw.read_capability(VmxCapability::Entry)?;

        let pin_based = PinBased::EXTERNAL_INTERRUPT | PinBased::NMI | PinBased::VIRTUAL_NMI;
        let cpu_based = CpuBased::HLT | CpuBased::MWAIT | CpuBased::TSC_OFFSET | CpuBased::TPR_SHADOW;

        self.hw.write_vmcs(Vmcs::PinBased, cap2ctrl(pin, pin_based.bits() as u64))?;
        self.hw.write_vmcs(
            Vmcs::CpuBased,
            cap2ctrl(proc, cpu_based.bits() as u64) | CpuBased::SECONDARY_CONTROLS.bits() as u64,
        )?;
        self.hw.write_vmcs(Vmcs::CpuBased2, cap2ctrl(proc2, CpuBased2::APIC_ACCESSES.bits() as u64))?;
        self.hw.write_vmcs(Vmcs::VmEntryControls, cap2ctrl(entry, 0))?;
        self.hw.write_vmcs(Vmcs::ExceptionBitmap, 0)?;
        self.hw.write_vmcs(Vmcs::TprThreshold, 0)?;
        self.hw.write_vmcs(Vmcs::ApicAccessAddress, APIC_ACCESS_ADDRESS)?;

        for msr in NATIVE_MSRS.iter().chain(std::iter::once(&MSR_IA32_SYSENTER_EIP)) {
            self.hw.enable_native_msr(*msr, true)?;
        }

        Ok(())
    }

    /// Puts the virtual CPU into the state it has after power-on or INIT.
    pub fn reset(&mut self) -> Result<(), Error> {
        debug!("vcpu {}: reset", self.id());

        let mut state = VcpuState::default();

        state.set_segment(
            SegmentRegister::Cs,
            Segment::with_access_rights(0xffff_0000, 0xffff, 0xf000, 0x9b),
        );

        for register in [
            SegmentRegister::Es,
            SegmentRegister::Ss,
            SegmentRegister::Ds,
            SegmentRegister::Fs,
            SegmentRegister::Gs,
        ].iter() {
            state.set_segment(*register, Segment::with_access_rights(0, 0xffff, 0, 0x93));
        }

        state.set_segment(SegmentRegister::Ldt, Segment::with_access_rights(0, 0, 0, SEGMENT_UNUSABLE));
        state.set_segment(SegmentRegister::Tr, Segment::with_access_rights(0, 0, 0, 0x8b));

        state.rip = 0xfff0;
        state.regs[RDX] = 0x623;
        state.set_rflags(RFlags::FIXED.bits());
        state.cr0 = CR0_CD | CR0_NW | CR0_ET;

        state.push(&mut self.hw)?;

        self.hw.write_vmcs(Vmcs::GuestDr7, 0)?;
        self.hw.write_vmcs(Vmcs::GuestInterruptibility, 0)?;
        self.hw.write_vmcs(Vmcs::EntryIntrInfo, 0)?;
        self.hw.set_interrupt_window(false)?;
        self.hw.set_nmi_window(false)?;

        self.state = state;
        self.msrs.reset();
        self.reinject = false;
        self.halted = false;

        self.vm.hypervisor.sync_tsc(0)?;

        Ok(())
    }

    /// The RFLAGS of the guest, without pulling the whole register file.
    fn rflags(&self) -> Result<u64, Error> {
        if self.state.dirty {
            return Ok(self.state.rflags());
        }

        self.hw.read_register(Register::Rflags)
    }

    /// Acts on the requests raised against the virtual CPU by other threads.
    fn process_events(&mut self) -> Result<(), Error> {
        if self.line.take(InterruptRequest::INIT) {
            self.reset()?;
            self.apic.reset();
            self.halted = true;
        }

        if self.line.take(InterruptRequest::SIPI) && self.halted {
            let vector = self.line.sipi_vector() as u64;

            debug!("vcpu {}: startup at {:#x}", self.id(), vector << 12);

            let state = self.state_mut()?;

            state.set_segment(
                SegmentRegister::Cs,
                Segment::with_access_rights(vector << 12, 0xffff, (vector << 8) as u16, 0x9b),
            );
            state.rip = 0;

            self.halted = false;
        }

        if self.line.take(InterruptRequest::POLL) {
            self.apic.poll();
        }

        self.line.take(InterruptRequest::TPR);

        if self.halted {
            let interrupt = self.line.is_pending(InterruptRequest::HARD) &&
                self.rflags()? & RFlags::IF.bits() != 0;

            if interrupt || self.line.is_pending(InterruptRequest::NMI) {
                self.halted = false;
            }
        }

        Ok(())
    }

    /// Runs the virtual CPU until an event needs the attention of the caller. The caller must
    /// hold the VM lock, which is released while the guest executes.
    pub fn run(&mut self, guard: &mut MutexGuard<'_, ()>) -> Result<VcpuExit, Error> {
        self.process_events()?;

        if self.halted {
            return Ok(VcpuExit::Halted);
        }

        loop {
            if self.line.take(InterruptRequest::EXIT) {
                return Ok(VcpuExit::Interrupted);
            }

            if self.state.dirty {
                self.state.push(&mut self.hw)?;
                self.state.dirty = false;
            }

            inject_interrupts(&mut self.hw, &self.line, &*self.apic, self.reinject)?;
            self.reinject = true;

            sync_tpr_to_hardware(&mut self.hw, &*self.apic)?;

            let hw = &mut self.hw;
            MutexGuard::unlocked(guard, || hw.run())?;

            let exit = ExitRecord::read(&self.hw)?;

            if sync_tpr_from_hardware(&self.hw, &*self.apic)? {
                trace!("vcpu {}: TPR changed to {:#x}", self.id(), self.apic.tpr());
            }

            if let Some(exit) = self.handle_exit(&exit)? {
                return Ok(exit);
            }
        }
    }

    /// Handles a VM exit. Returns `None` to keep running the guest.
    fn handle_exit(&mut self, exit: &ExitRecord) -> Result<Option<VcpuExit>, Error> {
        if exit.is_entry_failure() {
            error!("vcpu {}: VM entry failed ({:#x})", self.id(), exit.reason);
            return Err(Error::EntryFailure(exit.reason));
        }

        let reason = match exit.basic_reason() {
            Some(reason) => reason,
            _ => {
                error!("vcpu {}: unhandled exit reason {}", self.id(), exit.reason);
                return Ok(Some(VcpuExit::Reset));
            }
        };

        trace!("vcpu {}: exit {:?} at {:#x}", self.id(), reason, exit.rip);

        let result = match reason {
            VmxReason::Hlt => return self.handle_hlt(exit),
            VmxReason::Mwait => {
                self.hw.skip_instruction(exit.instruction_length)?;
                Some(VcpuExit::Interrupted)
            }
            VmxReason::Monitor | VmxReason::MovDr => {
                self.hw.skip_instruction(exit.instruction_length)?;
                None
            }
            VmxReason::EptViolation => return self.handle_ept_violation(exit).map(|_| None),
            VmxReason::Io => return self.handle_io(exit).map(|_| None),
            VmxReason::Cpuid => return self.handle_cpuid(exit).map(|_| None),
            VmxReason::Xsetbv => return self.handle_xsetbv(exit).map(|_| None),
            VmxReason::Rdmsr => return self.handle_rdmsr(exit).map(|_| None),
            VmxReason::Wrmsr => return self.handle_wrmsr(exit).map(|_| None),
            VmxReason::MovCr => return self.handle_cr_access(exit),
            VmxReason::ApicAccess => {
                self.emulate()?;
                None
            }
            VmxReason::Task => {
                let vm = self.vm.clone();

                task_switch(&mut self.hw, &mut self.state, vm.memory(), exit)?;
                self.reinject = false;

                Some(VcpuExit::Interrupted)
            }
            VmxReason::IrqWnd => {
                self.hw.set_interrupt_window(false)?;
                Some(VcpuExit::Interrupted)
            }
            VmxReason::VirtualNmiWnd => {
                self.hw.set_nmi_window(false)?;
                Some(VcpuExit::Interrupted)
            }
            VmxReason::ExcNmi | VmxReason::Irq | VmxReason::TprThreshold => {
                Some(VcpuExit::Interrupted)
            }
            VmxReason::TripleFault => {
                error!("vcpu {}: triple fault at {:#x}", self.id(), exit.rip);
                Some(VcpuExit::Reset)
            }
            VmxReason::Rdpmc => {
                self.hw.write_register(Register::Rax, 0)?;
                self.hw.write_register(Register::Rdx, 0)?;
                self.hw.skip_instruction(exit.instruction_length)?;
                None
            }
            VmxReason::VmCall => {
                self.hw.inject_exception(EXCEPTION_UD, None)?;
                None
            }
            reason => {
                error!("vcpu {}: unhandled exit {:?} at {:#x}", self.id(), reason, exit.rip);
                Some(VcpuExit::Reset)
            }
        };

        Ok(result)
    }

    fn handle_hlt(&mut self, exit: &ExitRecord) -> Result<Option<VcpuExit>, Error> {
        self.hw.skip_instruction(exit.instruction_length)?;

        let interrupt = self.line.is_pending(InterruptRequest::HARD) &&
            self.hw.read_register(Register::Rflags)? & RFlags::IF.bits() != 0;

        if !interrupt && !self.line.is_pending(InterruptRequest::NMI) && !exit.vectoring() {
            trace!("vcpu {}: halted", self.id());

            self.halted = true;
            return Ok(Some(VcpuExit::Halted));
        }

        Ok(Some(VcpuExit::Interrupted))
    }

    fn handle_ept_violation(&mut self, exit: &ExitRecord) -> Result<(), Error> {
        let gpa = exit.guest_physical_address;

        if exit.qualification & EPT_VIOLATION_NMI_UNBLOCKING != 0 && !exit.vectoring() {
            self.hw.set_nmi_blocking(true)?;
        }

        let slot = self.vm.slots.find(gpa);

        if slot.is_none() && exit.is_emulation_fault() {
            return self.emulate();
        }

        if let Some(slot) = slot {
            let page = gpa & !(PAGE_SIZE - 1);

            trace!("vcpu {}: RAM fault at {:#x} in slot {}", self.id(), gpa, slot.id);

            self.vm.bus.ram_fault(slot.host_address(page), PAGE_SIZE as usize);

            return Ok(());
        }

        error!(
            "vcpu {}: EPT fault at {:#x} (qualification {:#x}, rip {:#x})",
            self.id(),
            gpa,
            exit.qualification,
            exit.rip,
        );

        Err(Error::UnmappedEptFault {
            gpa,
            qualification: exit.qualification,
        })
    }

    fn handle_io(&mut self, exit: &ExitRecord) -> Result<(), Error> {
        let io = IoQualification::from(exit.qualification);

        if io.string {
            return self.emulate();
        }

        let size = io.size.min(4);
        let mut data = [0u8; 4];
        let rax = self.hw.read_register(Register::Rax)?;

        if io.input {
            self.vm.bus.pio_in(io.port, &mut data[..size]);

            let value = u32::from_le_bytes(data) as u64;
            let rax = match size {
                1 => (rax & !0xff) | (value & 0xff),
                2 => (rax & !0xffff) | (value & 0xffff),
                _ => value,
            };

            self.hw.write_register(Register::Rax, rax)?;
        } else {
            self.vm.bus.pio_out(io.port, &rax.to_le_bytes()[..size]);
        }

        self.hw.skip_instruction(exit.instruction_length)
    }

    fn handle_cpuid(&mut self, exit: &ExitRecord) -> Result<(), Error> {
        let leaf = self.hw.read_register(Register::Rax)? as u32;
        let subleaf = self.hw.read_register(Register::Rcx)? as u32;
        let cr4 = self.hw.guest_cr4()?;

        let registers = self.vm.cpuid.cpuid(self.id(), cr4, leaf, subleaf);

        self.hw.write_register(Register::Rax, registers[RAX] as u64)?;
        self.hw.write_register(Register::Rbx, registers[RBX] as u64)?;
        self.hw.write_register(Register::Rcx, registers[RCX] as u64)?;
        self.hw.write_register(Register::Rdx, registers[RDX] as u64)?;

        self.hw.skip_instruction(exit.instruction_length)
    }

    fn handle_xsetbv(&mut self, exit: &ExitRecord) -> Result<(), Error> {
        let eax = self.hw.read_register(Register::Rax)? & 0xffff_ffff;
        let ecx = self.hw.read_register(Register::Rcx)? as u32;
        let edx = self.hw.read_register(Register::Rdx)? & 0xffff_ffff;

        // Only XCR0 exists, and x87 state can never be disabled.
        if ecx == 0 {
            self.hw.write_register(Register::Xcr0, (edx << 32) | eax | 1)?;
        }

        self.hw.skip_instruction(exit.instruction_length)
    }

    fn handle_rdmsr(&mut self, exit: &ExitRecord) -> Result<(), Error> {
        let msr = self.hw.read_register(Register::Rcx)? as u32;

        match self.msrs.read(&self.hw, &*self.apic, msr)? {
            Some(value) => {
                self.hw.write_register(Register::Rax, value & 0xffff_ffff)?;
                self.hw.write_register(Register::Rdx, value >> 32)?;
                self.hw.skip_instruction(exit.instruction_length)
            }
            _ => self.hw.inject_exception(EXCEPTION_GP, Some(0)),
        }
    }

    fn handle_wrmsr(&mut self, exit: &ExitRecord) -> Result<(), Error> {
        let msr = self.hw.read_register(Register::Rcx)? as u32;
        let eax = self.hw.read_register(Register::Rax)? & 0xffff_ffff;
        let edx = self.hw.read_register(Register::Rdx)? & 0xffff_ffff;

        if self.msrs.write(&mut self.hw, &*self.apic, msr, (edx << 32) | eax)? {
            self.hw.skip_instruction(exit.instruction_length)
        } else {
            self.hw.inject_exception(EXCEPTION_GP, Some(0))
        }
    }

    fn handle_cr_access(&mut self, exit: &ExitRecord) -> Result<Option<VcpuExit>, Error> {
        let access = CrAccess::from(exit.qualification);
        let vm = self.vm.clone();
        let memory = vm.memory();
        let register = Register::GPRS[access.register as usize];
        let mut result = None;

        match (access.access, access.cr) {
            (CrAccessType::MovToCr, 0) => {
                let value = self.hw.read_register(register)?;
                self.hw.set_cr0(&memory, value)?;
            }
            (CrAccessType::MovToCr, 4) => {
                let value = self.hw.read_register(register)?;
                self.hw.set_cr4(value)?;
            }
            (CrAccessType::MovToCr, 8) => {
                let value = self.hw.read_register(register)?;
                self.apic.set_tpr(((value & 0xf) << 4) as u8);
                result = Some(VcpuExit::Interrupted);
            }
            (CrAccessType::MovFromCr, 8) => {
                self.hw.write_register(register, (self.apic.tpr() >> 4) as u64)?;
            }
            (CrAccessType::Clts, _) => {
                let cr0 = self.hw.guest_cr0()?;
                self.hw.set_cr0(&memory, cr0 & !CR0_TS)?;
            }
            (CrAccessType::Lmsw, _) => {
                // LMSW sets PE but never clears it.
                let cr0 = self.hw.guest_cr0()?;
                let cr0 = (cr0 & !0xe) | (access.lmsw_source as u64 & 0xf);
                self.hw.set_cr0(&memory, cr0)?;
            }
            (_, cr) => {
                error!("vcpu {}: unhandled access to CR{}", self.id(), cr);
                return Err(Error::UnhandledControlRegister(cr));
            }
        }

        self.hw.skip_instruction(exit.instruction_length)?;

        Ok(result)
    }

    /// Emulates the instruction at RIP.
    fn emulate(&mut self) -> Result<(), Error> {
        let vm = self.vm.clone();

        if !self.state.dirty {
            self.state.pull(&self.hw)?;
        }

        let result = Emulator::new(
            &mut self.hw,
            &mut self.state,
            vm.memory(),
            &mut self.msrs,
            &*self.apic,
        ).step();

        if let Err(ref e) = result {
            warn!("vcpu {}: emulation failed: {}", self.id(), e);
        }

        result
    }
}
