//! This module provides the emulation of hardware task switches through a task-state segment
//! (TSS), which VMX always reports as a VM exit.
//!
//! A switch validates the incoming TSS, saves the outgoing task into its TSS, updates the busy
//! bits and the back link according to what initiated the switch, and loads the incoming task
//! into the register file. The new register file is only committed once every guest memory access
//! has succeeded.

use crate::arch::x86_64::*;
use crate::descriptor::{read_descriptor, write_descriptor, SegmentDescriptor};
use crate::error::Error;
use crate::exit::{ExitRecord, TaskSwitchQualification, TaskSwitchReason};
use crate::flags::{RFlags, Width};
use crate::hypervisor::HypervisorVcpu;
use crate::mmu::{GuestMemory, LinearMemory};
use crate::state::VcpuState;
use crate::vmx::VmxExt;
use log::debug;

/// The minimum limit of a 32-bit TSS.
const TSS32_MIN_LIMIT: u32 = 0x67;
/// The minimum limit of a 16-bit TSS.
const TSS16_MIN_LIMIT: u32 = 0x2b;

/// The segment registers stored in a TSS, in the order they appear.
const TSS_SEGMENTS: [SegmentRegister; 6] = [
    SegmentRegister::Es,
    SegmentRegister::Cs,
    SegmentRegister::Ss,
    SegmentRegister::Ds,
    SegmentRegister::Fs,
    SegmentRegister::Gs,
];

/// The access rights of a segment loaded in virtual-8086 mode.
const V86_ACCESS_RIGHTS: u64 = 0xf3;

/// The fields of a TSS that a task switch reads or writes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct TaskState {
    link: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    /// EAX to EDI, in encoding order.
    regs: [u32; 8],
    /// ES, CS, SS, DS, FS and GS. A 16-bit TSS has no FS and GS.
    segments: [u16; 6],
    ldt: u16,
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

impl TaskState {
    fn read(memory: &LinearMemory<'_>, base: u64, wide: bool) -> Result<Self, Error> {
        let mut state = Self::default();

        if wide {
            let mut bytes = [0u8; 0x68];
            memory.read(base, &mut bytes)?;

            state.link = read_u16(&bytes, 0x00);
            state.cr3 = read_u32(&bytes, 0x1c);
            state.eip = read_u32(&bytes, 0x20);
            state.eflags = read_u32(&bytes, 0x24);

            for (index, register) in state.regs.iter_mut().enumerate() {
                *register = read_u32(&bytes, 0x28 + index * 4);
            }

            for (index, selector) in state.segments.iter_mut().enumerate() {
                *selector = read_u16(&bytes, 0x48 + index * 4);
            }

            state.ldt = read_u16(&bytes, 0x60);
        } else {
            let mut bytes = [0u8; 0x2c];
            memory.read(base, &mut bytes)?;

            state.link = read_u16(&bytes, 0);
            state.eip = read_u16(&bytes, 14) as u32;
            state.eflags = read_u16(&bytes, 16) as u32;

            for (index, register) in state.regs.iter_mut().enumerate() {
                *register = read_u16(&bytes, 18 + index * 2) as u32;
            }

            for (index, selector) in state.segments.iter_mut().take(4).enumerate() {
                *selector = read_u16(&bytes, 34 + index * 2);
            }

            state.ldt = read_u16(&bytes, 42);
        }

        Ok(state)
    }

    /// Writes the fields that change while a task runs: EIP, EFLAGS, the general-purpose
    /// registers and the segment selectors.
    fn write_dynamic(&self, memory: &LinearMemory<'_>, base: u64, wide: bool) -> Result<(), Error> {
        if wide {
            let mut bytes = [0u8; 0x40];

            bytes[0x00..0x04].copy_from_slice(&self.eip.to_le_bytes());
            bytes[0x04..0x08].copy_from_slice(&self.eflags.to_le_bytes());

            for (index, register) in self.regs.iter().enumerate() {
                let offset = 0x08 + index * 4;
                bytes[offset..offset + 4].copy_from_slice(&register.to_le_bytes());
            }

            for (index, selector) in self.segments.iter().enumerate() {
                let offset = 0x28 + index * 4;
                bytes[offset..offset + 2].copy_from_slice(&selector.to_le_bytes());
            }

            // The upper halves of the selector slots are reserved and read back unchanged.
            let mut reserved = [0u8; 0x18];
            memory.read(base + 0x48, &mut reserved)?;

            for index in 0..6 {
                let offset = 0x28 + index * 4 + 2;
                bytes[offset..offset + 2].copy_from_slice(&reserved[index * 4 + 2..index * 4 + 4]);
            }

            memory.write(base + 0x20, &bytes)
        } else {
            let mut bytes = [0u8; 0x1c];

            bytes[0..2].copy_from_slice(&(self.eip as u16).to_le_bytes());
            bytes[2..4].copy_from_slice(&(self.eflags as u16).to_le_bytes());

            for (index, register) in self.regs.iter().enumerate() {
                let offset = 4 + index * 2;
                bytes[offset..offset + 2].copy_from_slice(&(*register as u16).to_le_bytes());
            }

            for (index, selector) in self.segments.iter().take(4).enumerate() {
                let offset = 20 + index * 2;
                bytes[offset..offset + 2].copy_from_slice(&selector.to_le_bytes());
            }

            memory.write(base + 14, &bytes)
        }
    }
}

/// Returns `true` if the event being delivered was raised by hardware rather than by an
/// instruction, in which case the saved EIP points at the interrupted instruction.
fn hardware_event(exit: &ExitRecord) -> bool {
    exit.vectoring() &&
        matches!(
            exit.idt_vectoring_info & INTR_INFO_TYPE_MASK,
            INTR_TYPE_EXT_INTR | INTR_TYPE_NMI | INTR_TYPE_HW_EXCEPTION
        )
}

/// The outcome of validating the incoming TSS.
enum Validation {
    Valid,
    Fault(u8, u32),
}

fn validate(descriptor: &SegmentDescriptor, selector: u16, reason: TaskSwitchReason) -> Validation {
    let error_code = (selector & 0xfffc) as u32;

    // A TSS descriptor must live in the GDT.
    if selector & 0x4 != 0 || !descriptor.is_tss() {
        return Validation::Fault(EXCEPTION_GP, error_code);
    }

    if !descriptor.present() {
        return Validation::Fault(EXCEPTION_NP, error_code);
    }

    // IRET returns to a busy task, everything else must target an available one.
    if descriptor.busy() != (reason == TaskSwitchReason::Iret) {
        return Validation::Fault(EXCEPTION_GP, error_code);
    }

    let minimum = if descriptor.is_tss32() {
        TSS32_MIN_LIMIT
    } else {
        TSS16_MIN_LIMIT
    };

    if descriptor.limit() < minimum {
        return Validation::Fault(EXCEPTION_TS, error_code);
    }

    Validation::Valid
}

/// Loads a segment register of the incoming task.
fn load_segment(
    memory: &LinearMemory<'_>,
    state: &VcpuState,
    selector: u16,
    virtual_8086: bool,
) -> Result<Segment, Error> {
    if virtual_8086 {
        return Ok(Segment::with_access_rights(
            (selector as u64) << 4,
            0xffff,
            selector,
            V86_ACCESS_RIGHTS,
        ));
    }

    if selector & !0x3 == 0 {
        return Ok(Segment {
            selector,
            unusable: true,
            ..Default::default()
        });
    }

    let ldt = state.segment(SegmentRegister::Ldt);
    let mut descriptor = read_descriptor(memory, &state.gdt, ldt, selector)?;

    // Loading a segment marks its descriptor accessed.
    if descriptor.non_system() && descriptor.segment_type() & 0x1 == 0 {
        descriptor.set_segment_type(descriptor.segment_type() | 0x1);
        write_descriptor(memory, &state.gdt, ldt, selector, descriptor)?;
    }

    Ok(descriptor.to_segment(selector))
}

/// Emulates the task switch that caused the VM exit. Faults detected during the switch are raised
/// in the guest; only failures of the hypervisor are returned as errors.
pub fn task_switch<V: HypervisorVcpu>(
    vcpu: &mut V,
    state: &mut VcpuState,
    memory: GuestMemory<'_>,
    exit: &ExitRecord,
) -> Result<(), Error> {
    let qualification = TaskSwitchQualification::from(exit.qualification);

    state.pull(vcpu)?;

    match switch(vcpu, state, memory, exit, &qualification) {
        Err(Error::InvalidSelector(selector)) => {
            debug!("vcpu {}: task switch to invalid selector {:#x}", vcpu.id(), selector);
            vcpu.inject_exception(EXCEPTION_TS, Some((selector & 0xfffc) as u32))
        }
        Err(Error::PageFault { linear, code }) => {
            debug!("vcpu {}: page fault at {:#x} during task switch", vcpu.id(), linear);
            vcpu.write_register(Register::Cr2, linear)?;
            state.cr2 = linear;
            vcpu.inject_exception(EXCEPTION_PF, Some(code))
        }
        result => result,
    }
}

fn switch<V: HypervisorVcpu>(
    vcpu: &mut V,
    state: &mut VcpuState,
    memory: GuestMemory<'_>,
    exit: &ExitRecord,
    qualification: &TaskSwitchQualification,
) -> Result<(), Error> {
    let reason = qualification.reason;
    let new_selector = qualification.selector;
    let linear = LinearMemory::new(memory, state.paging(), false);

    let old_tr = *state.segment(SegmentRegister::Tr);
    let ldt = *state.segment(SegmentRegister::Ldt);

    let mut new_descriptor = read_descriptor(&linear, &state.gdt, &ldt, new_selector)?;

    if let Validation::Fault(vector, error_code) = validate(&new_descriptor, new_selector, reason) {
        debug!(
            "vcpu {}: rejecting task switch to {:#x}: exception {}",
            vcpu.id(),
            new_selector,
            vector,
        );

        return vcpu.inject_exception(vector, Some(error_code));
    }

    let new_wide = new_descriptor.is_tss32();
    let old_wide = old_tr.segment_type & 0x8 != 0;
    let new_base = new_descriptor.base();
    let incoming = TaskState::read(&linear, new_base, new_wide)?;

    debug!(
        "vcpu {}: task switch {:?} from {:#x} to {:#x}",
        vcpu.id(),
        reason,
        old_tr.selector,
        new_selector,
    );

    // Save the outgoing task.
    let mut eflags = state.rflags();

    if reason == TaskSwitchReason::Iret {
        eflags &= !RFlags::NT.bits();
    }

    let eip = if hardware_event(exit) {
        state.rip
    } else {
        state.rip.wrapping_add(exit.instruction_length)
    };

    let mut outgoing = TaskState {
        eip: eip as u32,
        eflags: eflags as u32,
        ..Default::default()
    };

    for (index, register) in outgoing.regs.iter_mut().enumerate() {
        *register = state.regs[index] as u32;
    }

    for (selector, register) in outgoing.segments.iter_mut().zip(TSS_SEGMENTS.iter()) {
        *selector = state.segment(*register).selector;
    }

    outgoing.write_dynamic(&linear, old_tr.base, old_wide)?;

    if reason == TaskSwitchReason::Jmp || reason == TaskSwitchReason::Iret {
        let mut old_descriptor = read_descriptor(&linear, &state.gdt, &ldt, old_tr.selector)?;

        old_descriptor.set_busy(false);
        write_descriptor(&linear, &state.gdt, &ldt, old_tr.selector, old_descriptor)?;
    }

    let mut new_eflags = incoming.eflags as u64;

    if reason == TaskSwitchReason::Call || reason == TaskSwitchReason::Gate {
        linear.write(new_base, &old_tr.selector.to_le_bytes())?;
        new_eflags |= RFlags::NT.bits();
    }

    if reason != TaskSwitchReason::Iret {
        new_descriptor.set_busy(true);
        write_descriptor(&linear, &state.gdt, &ldt, new_selector, new_descriptor)?;
    }

    // Load the incoming task into a copy of the register file.
    let mut next = state.clone();

    if new_wide {
        next.cr3 = incoming.cr3 as u64;
        vcpu.write_vmcs(Vmcs::GuestCr3, next.cr3)?;
        vcpu.load_pdptes(&memory, next.cr0)?;
    }

    next.set_rflags(new_eflags | RFlags::FIXED.bits());

    let width = if new_wide { Width::Dword } else { Width::Word };

    for (index, register) in incoming.regs.iter().enumerate() {
        next.write_gpr(index as u8, width, *register as u64);
    }

    next.rip = incoming.eip as u64;

    let linear = LinearMemory::new(memory, next.paging(), false);
    let virtual_8086 = new_wide && new_eflags & RFlags::VM.bits() != 0;

    let ldt = load_segment(&linear, &next, incoming.ldt, false)?;
    next.set_segment(SegmentRegister::Ldt, ldt);

    for (selector, register) in incoming.segments.iter().zip(TSS_SEGMENTS.iter()) {
        let segment = load_segment(&linear, &next, *selector, virtual_8086)?;
        next.set_segment(*register, segment);
    }

    let mut tr = new_descriptor.to_segment(new_selector);
    tr.segment_type |= 0x2;
    next.set_segment(SegmentRegister::Tr, tr);

    next.cr0 |= CR0_TS;

    // An exception with an error code is delivered on the stack of the new task.
    if exit.vectoring() &&
        exit.idt_vectoring_info & INTR_INFO_TYPE_MASK == INTR_TYPE_HW_EXCEPTION &&
        exit.idt_vectoring_info & INTR_INFO_DELIVER_CODE != 0 {
        let error_code = vcpu.read_vmcs(Vmcs::IdtVectoringError)?;
        let ss = *next.segment(SegmentRegister::Ss);
        let stack_width = if ss.default { Width::Dword } else { Width::Word };
        let esp = next.read_gpr(4, stack_width).wrapping_sub(width.bytes() as u64);
        let esp = stack_width.truncate(esp);

        linear.write(ss.base.wrapping_add(esp), &error_code.to_le_bytes()[..width.bytes()])?;
        next.write_gpr(4, stack_width, esp);
    }

    next.dirty = true;
    *state = next;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SlotTable;
    use crate::test_util::{FakeHypervisor, FakeVcpu, RecordingBus};
    use crate::vm::ProtectionFlags;

    const GDT: u64 = 0x1000;
    const OLD_TSS: u64 = 0x2000;
    const NEW_TSS: u64 = 0x3000;

    const CODE_SELECTOR: u16 = 0x08;
    const DATA_SELECTOR: u16 = 0x10;
    const OLD_TSS_SELECTOR: u16 = 0x18;
    const NEW_TSS_SELECTOR: u16 = 0x20;

    fn tss_descriptor(base: u64, busy: bool) -> u64 {
        let segment_type = if busy { 0xb } else { 0x9 };

        0x67 | ((base & 0xff_ffff) << 16) | ((0x80 | segment_type) << 40) | ((base >> 24) << 56)
    }

    struct Machine {
        hypervisor: FakeHypervisor,
        slots: SlotTable,
        bus: RecordingBus,
        vcpu: FakeVcpu,
        state: VcpuState,
        ram: Vec<u8>,
    }

    impl Machine {
        /// A 32-bit protected mode guest without paging, running in the task at `OLD_TSS`.
        fn new() -> Self {
            let mut machine = Self {
                hypervisor: FakeHypervisor::default(),
                slots: SlotTable::new(4),
                bus: RecordingBus::default(),
                vcpu: FakeVcpu::new(0),
                state: VcpuState::default(),
                ram: vec![0; 0x10000],
            };

            unsafe {
                machine.slots.map(
                    &machine.hypervisor,
                    machine.ram.as_mut_ptr(),
                    0,
                    0x10000,
                    ProtectionFlags::all(),
                ).unwrap();
            }

            machine.put_u64(GDT + 0x08, 0x00cf_9b00_0000_ffff);
            machine.put_u64(GDT + 0x10, 0x00cf_9300_0000_ffff);
            machine.put_u64(GDT + OLD_TSS_SELECTOR as u64, tss_descriptor(OLD_TSS, true));
            machine.put_u64(GDT + NEW_TSS_SELECTOR as u64, tss_descriptor(NEW_TSS, false));

            // The incoming task.
            machine.put_u32(NEW_TSS + 0x20, 0x4000);
            machine.put_u32(NEW_TSS + 0x24, 0x202);
            machine.put_u32(NEW_TSS + 0x28, 0xaaaa);
            machine.put_u32(NEW_TSS + 0x38, 0x8000);
            machine.put_u32(NEW_TSS + 0x48, DATA_SELECTOR as u32);
            machine.put_u32(NEW_TSS + 0x4c, CODE_SELECTOR as u32);
            machine.put_u32(NEW_TSS + 0x50, DATA_SELECTOR as u32);
            machine.put_u32(NEW_TSS + 0x54, DATA_SELECTOR as u32);

            let state = &mut machine.state;
            let code = SegmentDescriptor(0x00cf_9b00_0000_ffff).to_segment(CODE_SELECTOR);
            let data = SegmentDescriptor(0x00cf_9300_0000_ffff).to_segment(DATA_SELECTOR);

            for register in TSS_SEGMENTS.iter() {
                state.set_segment(*register, data);
            }

            state.set_segment(SegmentRegister::Cs, code);
            state.set_segment(SegmentRegister::Ldt, Segment { unusable: true, ..Default::default() });
            state.set_segment(
                SegmentRegister::Tr,
                SegmentDescriptor(tss_descriptor(OLD_TSS, true)).to_segment(OLD_TSS_SELECTOR),
            );
            state.gdt = DescriptorTable { base: GDT, limit: 0x27 };
            state.cr0 = CR0_PE | CR0_ET;
            state.rip = 0x1234;
            state.regs[0] = 0x5555;
            state.set_rflags(RFlags::FIXED.bits() | RFlags::IF.bits());

            machine.state.push(&mut machine.vcpu).unwrap();

            machine
        }

        fn put_u64(&mut self, address: u64, value: u64) {
            let address = address as usize;
            self.ram[address..address + 8].copy_from_slice(&value.to_le_bytes());
        }

        fn put_u32(&mut self, address: u64, value: u32) {
            let address = address as usize;
            self.ram[address..address + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn u32_at(&self, address: u64) -> u32 {
            let address = address as usize;
            read_u32(&self.ram, address)
        }

        fn descriptor(&self, selector: u16) -> SegmentDescriptor {
            let address = (GDT + selector as u64) as usize;
            let mut bytes = [0u8; 8];

            bytes.copy_from_slice(&self.ram[address..address + 8]);
            SegmentDescriptor(u64::from_le_bytes(bytes))
        }

        fn switch(&mut self, reason: u64, length: u64, vectoring: u64) -> Result<(), Error> {
            let exit = ExitRecord {
                reason: VmxReason::Task as u32,
                qualification: (reason << 30) | NEW_TSS_SELECTOR as u64,
                instruction_length: length,
                idt_vectoring_info: vectoring,
                ..Default::default()
            };
            let memory = GuestMemory::new(&self.slots, &self.bus);

            task_switch(&mut self.vcpu, &mut self.state, memory, &exit)
        }
    }

    #[test]
    fn call_nests_the_new_task() {
        let mut machine = Machine::new();

        // call 0x20:0
        machine.switch(0, 7, 0).unwrap();

        // The outgoing task resumes after the call.
        assert_eq!(machine.u32_at(OLD_TSS + 0x20), 0x1234 + 7);
        assert_eq!(machine.u32_at(OLD_TSS + 0x28), 0x5555);
        assert_eq!(machine.u32_at(NEW_TSS) as u16, OLD_TSS_SELECTOR);

        assert!(machine.descriptor(OLD_TSS_SELECTOR).busy());
        assert!(machine.descriptor(NEW_TSS_SELECTOR).busy());

        let state = &machine.state;
        assert!(state.dirty);
        assert_eq!(state.rip, 0x4000);
        assert_eq!(state.regs[0], 0xaaaa);
        assert_eq!(state.regs[4], 0x8000);
        assert!(state.flag(RFlags::NT));
        assert_ne!(state.cr0 & CR0_TS, 0);
        assert_eq!(state.segment(SegmentRegister::Tr).selector, NEW_TSS_SELECTOR);
        assert_eq!(state.segment(SegmentRegister::Tr).segment_type, 0xb);
        assert_eq!(state.segment(SegmentRegister::Cs).selector, CODE_SELECTOR);
        assert!(state.segment(SegmentRegister::Fs).unusable);
    }

    #[test]
    fn jmp_releases_the_old_task() {
        let mut machine = Machine::new();

        machine.switch(2, 7, 0).unwrap();

        assert!(!machine.descriptor(OLD_TSS_SELECTOR).busy());
        assert!(machine.descriptor(NEW_TSS_SELECTOR).busy());
        assert!(!machine.state.flag(RFlags::NT));
    }

    #[test]
    fn hardware_interrupts_save_the_interrupted_eip() {
        let mut machine = Machine::new();

        machine.switch(3, 0, INTR_INFO_VALID | INTR_TYPE_EXT_INTR | 0x20).unwrap();

        assert_eq!(machine.u32_at(OLD_TSS + 0x20), 0x1234);
        assert!(machine.state.flag(RFlags::NT));
    }

    #[test]
    fn exception_error_codes_go_on_the_new_stack() {
        let mut machine = Machine::new();

        machine.vcpu.write_vmcs(Vmcs::IdtVectoringError, 0x18).unwrap();
        machine.switch(3, 0, INTR_INFO_VALID | INTR_TYPE_HW_EXCEPTION | INTR_INFO_DELIVER_CODE | 8).unwrap();

        assert_eq!(machine.state.regs[4], 0x7ffc);
        assert_eq!(machine.u32_at(0x7ffc), 0x18);
    }

    #[test]
    fn busy_target_raises_gp() {
        let mut machine = Machine::new();

        machine.put_u64(GDT + NEW_TSS_SELECTOR as u64, tss_descriptor(NEW_TSS, true));

        let before = machine.state.clone();
        machine.switch(0, 7, 0).unwrap();

        assert_eq!(machine.state.rip, before.rip);
        assert!(!machine.state.dirty);
        assert_eq!(
            machine.vcpu.field(Vmcs::EntryIntrInfo),
            INTR_INFO_VALID | INTR_TYPE_HW_EXCEPTION | INTR_INFO_DELIVER_CODE | EXCEPTION_GP as u64
        );
        assert_eq!(machine.vcpu.field(Vmcs::EntryExceptionError), NEW_TSS_SELECTOR as u64);
    }

    #[test]
    fn selector_beyond_the_gdt_raises_ts() {
        let mut machine = Machine::new();

        machine.state.gdt.limit = 0x1f;
        machine.state.push(&mut machine.vcpu).unwrap();

        machine.switch(2, 7, 0).unwrap();

        assert_eq!(
            machine.vcpu.field(Vmcs::EntryIntrInfo),
            INTR_INFO_VALID | INTR_TYPE_HW_EXCEPTION | INTR_INFO_DELIVER_CODE | EXCEPTION_TS as u64
        );
    }
}
