//! This module provides the decoding of VM exits: the exit record read from the VMCS after every
//! guest entry and the layouts of the exit qualifications that the dispatch loop interprets.

use crate::arch::x86_64::*;
use crate::error::Error;
use crate::hypervisor::HypervisorVcpu;
use num_traits::FromPrimitive;

/// The access that caused an EPT violation was a data read.
pub const EPT_VIOLATION_DATA_READ: u64 = 1 << 0;
/// The access that caused an EPT violation was a data write.
pub const EPT_VIOLATION_DATA_WRITE: u64 = 1 << 1;
/// The access that caused an EPT violation was an instruction fetch.
pub const EPT_VIOLATION_INST_FETCH: u64 = 1 << 2;
/// The guest linear address field is valid.
pub const EPT_VIOLATION_GLA_VALID: u64 = 1 << 7;
/// The access was to the translation of a linear address, rather than to a paging structure.
pub const EPT_VIOLATION_XLAT_VALID: u64 = 1 << 8;
/// The fault occurred while IRET was unblocking NMIs.
pub const EPT_VIOLATION_NMI_UNBLOCKING: u64 = 1 << 12;

/// Why the virtual CPU returned to its caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VcpuExit {
    /// The guest halted and has nothing to wake up for.
    Halted,
    /// An event needs the attention of the caller, e.g. an interrupt to deliver or an I/O
    /// request to complete.
    Interrupted,
    /// The guest requested a system reset, or hit a triple fault.
    Reset,
}

/// The VM exit information read from the VMCS.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExitRecord {
    /// The raw exit reason, including the entry failure bit.
    pub reason: u32,
    pub qualification: u64,
    pub instruction_length: u64,
    pub guest_physical_address: u64,
    pub guest_linear_address: u64,
    pub idt_vectoring_info: u64,
    pub rip: u64,
}

impl ExitRecord {
    /// Reads the exit information of the last VM exit.
    pub fn read<V: HypervisorVcpu>(vcpu: &V) -> Result<Self, Error> {
        Ok(Self {
            reason: vcpu.read_vmcs(Vmcs::ExitReason)? as u32,
            qualification: vcpu.read_vmcs(Vmcs::ExitQualification)?,
            instruction_length: vcpu.read_vmcs(Vmcs::ExitInstructionLength)?,
            guest_physical_address: vcpu.read_vmcs(Vmcs::GuestPhysicalAddress)?,
            guest_linear_address: vcpu.read_vmcs(Vmcs::GuestLinearAddress)?,
            idt_vectoring_info: vcpu.read_vmcs(Vmcs::IdtVectoringInfo)?,
            rip: vcpu.read_register(Register::Rip)?,
        })
    }

    /// Returns `true` if VM entry failed rather than the guest exiting.
    pub fn is_entry_failure(&self) -> bool {
        self.reason & EXIT_REASON_ENTRY_FAILURE != 0
    }

    /// The basic exit reason, or `None` if it is not one the dispatch loop knows about.
    pub fn basic_reason(&self) -> Option<VmxReason> {
        VmxReason::from_u32(self.reason & 0xffff)
    }

    /// Returns `true` if an event was being delivered when the exit occurred.
    pub fn vectoring(&self) -> bool {
        self.idt_vectoring_info & INTR_INFO_VALID != 0
    }

    /// Returns `true` if the EPT violation was a data access to a guest linear address, i.e. one
    /// that can be completed by emulating the faulting instruction.
    pub fn is_emulation_fault(&self) -> bool {
        let qualification = self.qualification;

        if qualification & EPT_VIOLATION_INST_FETCH != 0 {
            return false;
        }

        if qualification & (EPT_VIOLATION_DATA_READ | EPT_VIOLATION_DATA_WRITE) == 0 {
            return false;
        }

        let required = EPT_VIOLATION_GLA_VALID | EPT_VIOLATION_XLAT_VALID;

        qualification & required == required
    }
}

/// The exit qualification of an I/O instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IoQualification {
    pub port: u16,
    /// The access size in bytes.
    pub size: usize,
    pub input: bool,
    pub string: bool,
    pub rep: bool,
}

impl From<u64> for IoQualification {
    fn from(qualification: u64) -> Self {
        Self {
            port: (qualification >> 16) as u16,
            size: (qualification & 0x7) as usize + 1,
            input: qualification & (1 << 3) != 0,
            string: qualification & (1 << 4) != 0,
            rep: qualification & (1 << 5) != 0,
        }
    }
}

/// The kind of control register access.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CrAccessType {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

/// The exit qualification of a control register access.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CrAccess {
    pub cr: u8,
    pub access: CrAccessType,
    /// The general-purpose register of a MOV, in encoding order.
    pub register: u8,
    /// The source operand of LMSW.
    pub lmsw_source: u16,
}

impl From<u64> for CrAccess {
    fn from(qualification: u64) -> Self {
        let access = match (qualification >> 4) & 0x3 {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        };

        Self {
            cr: (qualification & 0xf) as u8,
            access,
            register: ((qualification >> 8) & 0xf) as u8,
            lmsw_source: (qualification >> 16) as u16,
        }
    }
}

/// What initiated a task switch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskSwitchReason {
    Call,
    Iret,
    Jmp,
    /// A task gate in the IDT.
    Gate,
}

/// The exit qualification of a task switch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TaskSwitchQualification {
    pub selector: u16,
    pub reason: TaskSwitchReason,
}

impl From<u64> for TaskSwitchQualification {
    fn from(qualification: u64) -> Self {
        let reason = match (qualification >> 30) & 0x3 {
            0 => TaskSwitchReason::Call,
            1 => TaskSwitchReason::Iret,
            2 => TaskSwitchReason::Jmp,
            _ => TaskSwitchReason::Gate,
        };

        Self {
            selector: qualification as u16,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeVcpu, ScriptedExit};

    #[test]
    fn reads_the_exit_record() {
        let mut vcpu = FakeVcpu::new(0);

        vcpu.script(
            ScriptedExit::new(VmxReason::EptViolation)
                .qualification(EPT_VIOLATION_DATA_WRITE | EPT_VIOLATION_GLA_VALID | EPT_VIOLATION_XLAT_VALID)
                .gpa(0xfee0_0300)
                .register(Register::Rip, 0x1000),
        );
        vcpu.run().unwrap();

        let record = ExitRecord::read(&vcpu).unwrap();

        assert_eq!(record.basic_reason(), Some(VmxReason::EptViolation));
        assert_eq!(record.guest_physical_address, 0xfee0_0300);
        assert_eq!(record.rip, 0x1000);
        assert!(record.is_emulation_fault());
        assert!(!record.is_entry_failure());
        assert!(!record.vectoring());
    }

    #[test]
    fn emulation_faults() {
        let fault = |qualification| ExitRecord {
            qualification,
            ..Default::default()
        };

        let valid = EPT_VIOLATION_GLA_VALID | EPT_VIOLATION_XLAT_VALID;

        assert!(fault(EPT_VIOLATION_DATA_READ | valid).is_emulation_fault());
        assert!(!fault(EPT_VIOLATION_INST_FETCH | EPT_VIOLATION_DATA_READ | valid).is_emulation_fault());
        assert!(!fault(valid).is_emulation_fault());
        // A fault on a paging structure access.
        assert!(!fault(EPT_VIOLATION_DATA_READ | EPT_VIOLATION_GLA_VALID).is_emulation_fault());
    }

    #[test]
    fn entry_failures() {
        let record = ExitRecord {
            reason: EXIT_REASON_ENTRY_FAILURE | 33,
            ..Default::default()
        };

        assert!(record.is_entry_failure());
    }

    #[test]
    fn qualifications() {
        // rep outsw to port 0x1f0
        let io = IoQualification::from(0x01f0_0031);
        assert_eq!(io, IoQualification { port: 0x1f0, size: 2, input: false, string: true, rep: true });

        // mov cr8, rcx
        let cr = CrAccess::from(0x0108);
        assert_eq!(cr.cr, 8);
        assert_eq!(cr.register, 1);
        assert_eq!(cr.access, CrAccessType::MovToCr);

        // lmsw with 0x0001
        let cr = CrAccess::from(0x0001_0030);
        assert_eq!(cr.access, CrAccessType::Lmsw);
        assert_eq!(cr.lmsw_source, 1);

        let task = TaskSwitchQualification::from((3 << 30) | 0x28);
        assert_eq!(task, TaskSwitchQualification { selector: 0x28, reason: TaskSwitchReason::Gate });
    }
}
