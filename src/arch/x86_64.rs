//! This module provides the definitions of the x86-64 architecture and its VMX extensions that
//! the virtualization core programs: registers, segments, MSR indices, VMCS field encodings and
//! exit reasons.

use bitflags::bitflags;
use num_derive::FromPrimitive;

/// Represents the registers of a virtual CPU that are accessed by name rather than through the
/// VMCS.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Register {
    /// The accumulator register.
    Rax,
    /// The counter register.
    Rcx,
    /// The data register.
    Rdx,
    /// The base register.
    Rbx,
    /// The stack pointer register.
    Rsp,
    /// The base pointer register.
    Rbp,
    /// The source index register.
    Rsi,
    /// The destination index register.
    Rdi,
    /// The R8 register.
    R8,
    /// The R9 register.
    R9,
    /// The R10 register.
    R10,
    /// The R11 register.
    R11,
    /// The R12 register.
    R12,
    /// The R13 register.
    R13,
    /// The R14 register.
    R14,
    /// The R15 register.
    R15,
    /// The instruction pointer register.
    Rip,
    /// The status register.
    Rflags,
    /// Control register CR2. This contains the linear address that caused the last page fault.
    Cr2,
    /// The extended control register XCR0.
    Xcr0,
    /// The task priority register, i.e. CR8 in its architectural 4-bit encoding shifted left by
    /// four.
    Tpr,
}

impl Register {
    /// The general-purpose registers in the order of their encoding in the ModRM, SIB and REX
    /// bytes.
    pub const GPRS: [Register; 16] = [
        Register::Rax, Register::Rcx, Register::Rdx, Register::Rbx,
        Register::Rsp, Register::Rbp, Register::Rsi, Register::Rdi,
        Register::R8,  Register::R9,  Register::R10, Register::R11,
        Register::R12, Register::R13, Register::R14, Register::R15,
    ];
}

/// Protected Mode Enable.
pub const CR0_PE: u64 = 1 << 0;
/// Monitor Co-Processor.
pub const CR0_MP: u64 = 1 << 1;
/// Emulation.
pub const CR0_EM: u64 = 1 << 2;
/// Task Switched.
pub const CR0_TS: u64 = 1 << 3;
/// Extension Type.
pub const CR0_ET: u64 = 1 << 4;
/// Numeric Error.
pub const CR0_NE: u64 = 1 << 5;
/// Write Protect.
pub const CR0_WP: u64 = 1 << 16;
/// Not write-through.
pub const CR0_NW: u64 = 1 << 29;
/// Cache Disable.
pub const CR0_CD: u64 = 1 << 30;
/// Paging.
pub const CR0_PG: u64 = 1 << 31;

/// Page Size Extension.
pub const CR4_PSE:        u64 = 1 << 4;
/// Physical Address Extension.
pub const CR4_PAE:        u64 = 1 << 5;
/// Page Global Enable.
pub const CR4_PGE:        u64 = 1 << 7;
/// Virtual Machine eXtension Enable.
pub const CR4_VMXE:       u64 = 1 << 13;
/// PCID enable.
pub const CR4_PCIDE:      u64 = 1 << 17;
/// XSAVE and Processor Extended States enable.
pub const CR4_OSXSAVE:    u64 = 1 << 18;

/// The access rights bit that marks a segment register as unusable.
pub const SEGMENT_UNUSABLE: u64 = 1 << 16;

/// Represents a segment register as cached by the VMCS on the x86-64 architecture.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Segment {
    /// The base address of the segment.
    pub base: u64,
    /// The limit of the segment, expanded to bytes.
    pub limit: u32,
    /// The segment selector, i.e. the value stored in the actual segment registers described by
    /// [`SegmentRegister`]. For 16-bit real mode, this describes a 16-bit value that is multiplied
    /// by 16 to get the base of the segment. For 32-bit protected mode and 64-bit long mode, this
    /// describes an index into the global or local descriptor table.
    pub selector: u16,
    /// The type of the segment.
    pub segment_type: u8,
    /// Whether the segment descriptor describes a code/data segment rather than a system segment.
    pub non_system_segment: bool,
    /// The privilege level of the segment, where 0 is supervisor mode and 3 is user mode.
    pub dpl: u8,
    /// Whether the segment descriptor is valid/present.
    pub present: bool,
    pub available: bool,
    /// Whether this segment uses long mode. This is only checked for 64-bit code segments.
    pub long: bool,
    /// The default operation size: set for 32-bit segments.
    pub default: bool,
    /// Whether the limit is described in bytes or in units of 4 kiB.
    pub granularity: bool,
    /// Whether the segment register has been loaded with a null selector.
    pub unusable: bool,
}

impl Segment {
    /// Unpacks the VMX access rights format.
    pub fn with_access_rights(base: u64, limit: u32, selector: u16, access_rights: u64) -> Self {
        Self {
            base,
            limit,
            selector,
            segment_type: (access_rights & 0xf) as u8,
            non_system_segment: (access_rights >> 4) & 0x1 == 0x1,
            dpl: ((access_rights >> 5) & 0x3) as u8,
            present: (access_rights >> 7) & 0x1 == 0x1,
            available: (access_rights >> 12) & 0x1 == 0x1,
            long: (access_rights >> 13) & 0x1 == 0x1,
            default: (access_rights >> 14) & 0x1 == 0x1,
            granularity: (access_rights >> 15) & 0x1 == 0x1,
            unusable: access_rights & SEGMENT_UNUSABLE != 0,
        }
    }

    /// Packs the segment attributes into the VMX access rights format.
    pub fn access_rights(&self) -> u64 {
        (self.segment_type as u64) & 0xf |
        (self.non_system_segment as u64) << 4 |
        ((self.dpl as u64) & 0x3) << 5 |
        (self.present as u64) << 7 |
        (self.available as u64) << 12 |
        (self.long as u64) << 13 |
        (self.default as u64) << 14 |
        (self.granularity as u64) << 15 |
        if self.unusable { SEGMENT_UNUSABLE } else { 0 }
    }

    /// The requested privilege level of the selector.
    pub fn rpl(&self) -> u8 {
        (self.selector & 0x3) as u8
    }
}

/// Represents the segment registers of the x86-64 architecture, numbered as in the `reg` field
/// of `mov Sreg` instructions.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SegmentRegister {
    /// The ES segment register.
    Es,
    /// The code segment register.
    Cs,
    /// The stack segment register.
    Ss,
    /// The data segment register.
    Ds,
    /// The FS segment register.
    Fs,
    /// The GS segment register.
    Gs,
    /// The local descriptor table.
    Ldt,
    /// The task register.
    Tr,
}

impl SegmentRegister {
    /// Every segment register, in encoding order.
    pub const ALL: [SegmentRegister; 8] = [
        SegmentRegister::Es, SegmentRegister::Cs, SegmentRegister::Ss, SegmentRegister::Ds,
        SegmentRegister::Fs, SegmentRegister::Gs, SegmentRegister::Ldt, SegmentRegister::Tr,
    ];

    /// The VMCS fields holding the selector, base, limit and access rights of the register.
    pub fn vmcs_fields(self) -> (Vmcs, Vmcs, Vmcs, Vmcs) {
        match self {
            SegmentRegister::Es => (
                Vmcs::GuestEs,
                Vmcs::GuestEsBase,
                Vmcs::GuestEsLimit,
                Vmcs::GuestEsAccessRights,
            ),
            SegmentRegister::Cs => (
                Vmcs::GuestCs,
                Vmcs::GuestCsBase,
                Vmcs::GuestCsLimit,
                Vmcs::GuestCsAccessRights,
            ),
            SegmentRegister::Ss => (
                Vmcs::GuestSs,
                Vmcs::GuestSsBase,
                Vmcs::GuestSsLimit,
                Vmcs::GuestSsAccessRights,
            ),
            SegmentRegister::Ds => (
                Vmcs::GuestDs,
                Vmcs::GuestDsBase,
                Vmcs::GuestDsLimit,
                Vmcs::GuestDsAccessRights,
            ),
            SegmentRegister::Fs => (
                Vmcs::GuestFs,
                Vmcs::GuestFsBase,
                Vmcs::GuestFsLimit,
                Vmcs::GuestFsAccessRights,
            ),
            SegmentRegister::Gs => (
                Vmcs::GuestGs,
                Vmcs::GuestGsBase,
                Vmcs::GuestGsLimit,
                Vmcs::GuestGsAccessRights,
            ),
            SegmentRegister::Ldt => (
                Vmcs::GuestLdtr,
                Vmcs::GuestLdtrBase,
                Vmcs::GuestLdtrLimit,
                Vmcs::GuestLdtrAccessRights,
            ),
            SegmentRegister::Tr => (
                Vmcs::GuestTr,
                Vmcs::GuestTrBase,
                Vmcs::GuestTrLimit,
                Vmcs::GuestTrAccessRights,
            ),
        }
    }
}

/// Represents the descriptor table registers of the x86-64 architecture.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DescriptorTableRegister {
    /// The global descriptor table.
    Gdt,
    /// The interrupt descriptor table.
    Idt,
}

impl DescriptorTableRegister {
    /// The VMCS fields holding the base and limit of the table.
    pub fn vmcs_fields(self) -> (Vmcs, Vmcs) {
        match self {
            DescriptorTableRegister::Gdt => (Vmcs::GuestGdtrBase, Vmcs::GuestGdtrLimit),
            DescriptorTableRegister::Idt => (Vmcs::GuestIdtrBase, Vmcs::GuestIdtrLimit),
        }
    }
}

/// Represents a descriptor table on the x86-64 architecture.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DescriptorTable {
    /// The base address of the descriptor table.
    pub base: u64,
    /// The limit of the descriptor table.
    pub limit: u16,
}

/// The time-stamp counter.
pub const MSR_IA32_TSC:            u32 = 0x0000_0010;
/// The microcode update signature as reported to the guest.
pub const MSR_IA32_UCODE_REV:      u32 = 0x0000_0017;
/// The local APIC base address and enable bits.
pub const MSR_IA32_APICBASE:       u32 = 0x0000_001b;
/// The code segment to load when issuing the `sysenter` instruction.
pub const MSR_IA32_SYSENTER_CS:    u32 = 0x0000_0174;
/// The stack pointer to load when issuing the `sysenter` instruction.
pub const MSR_IA32_SYSENTER_ESP:   u32 = 0x0000_0175;
/// The instruction pointer to load when issuing the `sysenter` instruction.
pub const MSR_IA32_SYSENTER_EIP:   u32 = 0x0000_0176;
/// Miscellaneous processor features.
pub const MSR_IA32_MISC_ENABLE:    u32 = 0x0000_01a0;
/// The first variable-range MTRR base register. Mask registers interleave with the bases.
pub const MSR_MTRR_PHYS_BASE0:     u32 = 0x0000_0200;
/// The number of variable-range MTRR pairs.
pub const MSR_MTRR_VAR_COUNT:      u32 = 8;
/// The fixed-range MTRR covering 0x00000-0x7ffff.
pub const MSR_MTRR_FIX64K_00000:   u32 = 0x0000_0250;
/// The fixed-range MTRR covering 0x80000-0x9ffff.
pub const MSR_MTRR_FIX16K_80000:   u32 = 0x0000_0258;
/// The fixed-range MTRR covering 0xa0000-0xbffff.
pub const MSR_MTRR_FIX16K_A0000:   u32 = 0x0000_0259;
/// The first of the eight fixed-range MTRRs covering 0xc0000-0xfffff.
pub const MSR_MTRR_FIX4K_C0000:    u32 = 0x0000_0268;
/// The default memory type.
pub const MSR_MTRR_DEF_TYPE:       u32 = 0x0000_02ff;

/// The Extended Feature Enable Register (EFER).
pub const MSR_IA32_EFER:           u32 = 0xc000_0080;

/// Enables the `syscall` extension.
pub const EFER_SCE: u64 = 1 << 0;
/// Enables long mode.
pub const EFER_LME: u64 = 1 << 8;
/// Indicates long mode is active.
pub const EFER_LMA: u64 = 1 << 10;
/// Enables the non-executable bit.
pub const EFER_NXE: u64 = 1 << 11;

/// The user segment base \[48:63\], the kernel segment base \[32:47\] and the syscall EIP
/// \[0:31\].
pub const MSR_IA32_STAR:           u32 = 0xc000_0081;
/// The instruction pointer to load when issuing a `syscall` in 64-bit mode.
pub const MSR_IA32_LSTAR:          u32 = 0xc000_0082;
/// The instruction pointer to load when issuing a `syscall` in 32-bit compatibility mode.
pub const MSR_IA32_CSTAR:          u32 = 0xc000_0083;
/// Bits set in the syscall mask clear the corresponding bits in the `rflags` register when issuing
/// a `syscall` instruction.
pub const MSR_IA32_SYSCALL_MASK:   u32 = 0xc000_0084;
/// The FS segment base.
pub const MSR_IA32_FS_BASE:        u32 = 0xc000_0100;
/// The GS segment base.
pub const MSR_IA32_GS_BASE:        u32 = 0xc000_0101;
/// The GS segment to swap when issuing the `swapgs` instruction.
pub const MSR_IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;
/// The auxiliary value returned by `rdtscp`.
pub const MSR_IA32_TSC_AUX:        u32 = 0xc000_0103;

bitflags! {
    pub struct PinBased: u32 {
        const EXTERNAL_INTERRUPT = 1 << 0;
        const NMI                = 1 << 3;
        const VIRTUAL_NMI        = 1 << 5;
    }

    pub struct CpuBased: u32 {
        const IRQ_WND            = 1 << 2;
        const TSC_OFFSET         = 1 << 3;
        const HLT                = 1 << 7;
        const INVLPG             = 1 << 9;
        const MWAIT              = 1 << 10;
        const RDPMC              = 1 << 11;
        const RDTSC              = 1 << 12;
        const CR3_LOAD           = 1 << 15;
        const CR3_STORE          = 1 << 16;
        const CR8_LOAD           = 1 << 19;
        const CR8_STORE          = 1 << 20;
        const TPR_SHADOW         = 1 << 21;
        const VIRTUAL_NMI_WND    = 1 << 22;
        const MOV_DR             = 1 << 23;
        const UNCONDITIONAL_IO   = 1 << 24;
        const IO_BITMAPS         = 1 << 25;
        const MTF                = 1 << 27;
        const MSR_BITMAPS        = 1 << 28;
        const MONITOR            = 1 << 29;
        const PAUSE              = 1 << 30;
        const SECONDARY_CONTROLS = 1 << 31;
    }

    pub struct CpuBased2: u32 {
        const APIC_ACCESSES      = 1 << 0;
        const EPT                = 1 << 1;
        const UNRESTRICTED_GUEST = 1 << 7;
    }

    pub struct VmEntryControls: u32 {
        const GUEST_IA32E               = 1 << 9;
        const SMM                       = 1 << 10;
        const DEACTIVE_DUAL_MONITOR     = 1 << 11;
        const LOAD_PERF_GLOBAL_CONTROLS = 1 << 13;
        const LOAD_PAT                  = 1 << 14;
        const LOAD_EFER                 = 1 << 15;
    }
}

/// The capability MSRs reported by the hardware virtualization facility. Each value holds the
/// allowed-0 settings in the low and the allowed-1 settings in the high 32 bits.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
pub enum VmxCapability {
    PinBased        = 0,
    ProcBased       = 1,
    ProcBased2      = 2,
    Entry           = 3,
    Exit            = 4,
    PreemptionTimer = 32,
}

/// Adjusts the requested control bits to what the capability allows: bits that must be set are
/// forced on, bits that cannot be set are cleared.
pub fn cap2ctrl(capability: u64, ctrl: u64) -> u64 {
    (ctrl | (capability & 0xffff_ffff)) & (capability >> 32)
}

/// The possible fields of the VMCS struct.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
pub enum Vmcs {
    /// The ES register of the guest.
    GuestEs                = 0x0000_0800,
    /// The code segment register of the guest.
    GuestCs                = 0x0000_0802,
    /// The stack segment register of the guest.
    GuestSs                = 0x0000_0804,
    /// The data segment register of the guest.
    GuestDs                = 0x0000_0806,
    /// The FS register of the guest.
    GuestFs                = 0x0000_0808,
    /// The GS register of the guest.
    GuestGs                = 0x0000_080a,
    /// The local descriptor table register of the guest.
    GuestLdtr              = 0x0000_080c,
    /// The task register of the guest.
    GuestTr                = 0x0000_080e,
    /// The offset added to the host TSC when the guest reads the TSC.
    TscOffset              = 0x0000_2010,
    /// The guest physical address of the virtualized APIC page.
    ApicAccessAddress      = 0x0000_2014,
    /// The guest physical address that caused an EPT violation.
    GuestPhysicalAddress   = 0x0000_2400,
    /// The EFER MSR of the guest.
    GuestEfer              = 0x0000_2806,
    GuestPdpte0            = 0x0000_280a,
    GuestPdpte1            = 0x0000_280c,
    GuestPdpte2            = 0x0000_280e,
    GuestPdpte3            = 0x0000_2810,
    /// Pin-based controls.
    PinBased               = 0x0000_4000,
    /// CPU-based controls.
    CpuBased               = 0x0000_4002,
    /// The exceptions that cause a VM exit.
    ExceptionBitmap        = 0x0000_4004,
    /// VM exit controls.
    VmExitControls         = 0x0000_400c,
    /// VM entry controls.
    VmEntryControls        = 0x0000_4012,
    /// The event to inject on the next VM entry.
    EntryIntrInfo          = 0x0000_4016,
    /// The error code delivered with the injected event.
    EntryExceptionError    = 0x0000_4018,
    /// The instruction length of an injected software event.
    EntryInstructionLength = 0x0000_401a,
    /// The TPR threshold below which a VM exit occurs.
    TprThreshold           = 0x0000_401c,
    /// Secondary CPU-based controls.
    CpuBased2              = 0x0000_401e,
    /// The error number of the last failing VMX instruction.
    VmxInstructionError    = 0x0000_4400,
    /// The reason for the VM exit.
    ExitReason             = 0x0000_4402,
    /// The event that was being delivered when the VM exit occurred.
    IdtVectoringInfo       = 0x0000_4408,
    IdtVectoringError      = 0x0000_440a,
    /// The length of the instruction that caused the VM exit.
    ExitInstructionLength  = 0x0000_440c,
    /// The ES limit of the guest.
    GuestEsLimit           = 0x0000_4800,
    /// The code segment limit of the guest.
    GuestCsLimit           = 0x0000_4802,
    /// The stack segment limit of the guest.
    GuestSsLimit           = 0x0000_4804,
    /// The data segment limit of the guest.
    GuestDsLimit           = 0x0000_4806,
    /// The FS limit of the guest.
    GuestFsLimit           = 0x0000_4808,
    /// The GS limit of the guest.
    GuestGsLimit           = 0x0000_480a,
    /// The LDT limit of the guest.
    GuestLdtrLimit         = 0x0000_480c,
    /// The task register limit of the guest.
    GuestTrLimit           = 0x0000_480e,
    /// The GDT limit of the guest.
    GuestGdtrLimit         = 0x0000_4810,
    /// The IDT limit of the guest.
    GuestIdtrLimit         = 0x0000_4812,
    /// The ES access rights of the guest.
    GuestEsAccessRights    = 0x0000_4814,
    /// The code segment access rights of the guest.
    GuestCsAccessRights    = 0x0000_4816,
    GuestSsAccessRights    = 0x0000_4818,
    GuestDsAccessRights    = 0x0000_481a,
    GuestFsAccessRights    = 0x0000_481c,
    GuestGsAccessRights    = 0x0000_481e,
    GuestLdtrAccessRights  = 0x0000_4820,
    GuestTrAccessRights    = 0x0000_4822,
    /// STI, MOV SS, SMI and NMI blocking of the guest.
    GuestInterruptibility  = 0x0000_4824,
    GuestActivityState     = 0x0000_4826,
    GuestSysenterCs        = 0x0000_482a,
    Cr0Mask                = 0x0000_6000,
    Cr4Mask                = 0x0000_6002,
    Cr0Shadow              = 0x0000_6004,
    Cr4Shadow              = 0x0000_6006,
    /// The qualification of the VM exit, the meaning of which depends on the exit reason.
    ExitQualification      = 0x0000_6400,
    GuestLinearAddress     = 0x0000_640a,
    GuestCr0               = 0x0000_6800,
    GuestCr3               = 0x0000_6802,
    GuestCr4               = 0x0000_6804,
    GuestEsBase            = 0x0000_6806,
    GuestCsBase            = 0x0000_6808,
    GuestSsBase            = 0x0000_680a,
    GuestDsBase            = 0x0000_680c,
    GuestFsBase            = 0x0000_680e,
    GuestGsBase            = 0x0000_6810,
    GuestLdtrBase          = 0x0000_6812,
    GuestTrBase            = 0x0000_6814,
    GuestGdtrBase          = 0x0000_6816,
    GuestIdtrBase          = 0x0000_6818,
    GuestDr7               = 0x0000_681a,
    GuestSysenterEsp       = 0x0000_6824,
    GuestSysenterEip       = 0x0000_6826,
}

#[derive(Copy, Clone, Debug, Eq, FromPrimitive, PartialEq)]
#[repr(u32)]
pub enum VmxReason {
    ExcNmi            =  0,
    Irq               =  1,
    TripleFault       =  2,
    Init              =  3,
    Sipi              =  4,
    IoSmi             =  5,
    OtherSmi          =  6,
    IrqWnd            =  7,
    VirtualNmiWnd     =  8,
    Task              =  9,
    Cpuid             = 10,
    Getsec            = 11,
    Hlt               = 12,
    Invd              = 13,
    Invlpg            = 14,
    Rdpmc             = 15,
    Rdtsc             = 16,
    Rsm               = 17,
    VmCall            = 18,
    VmClear           = 19,
    VmLaunch          = 20,
    VmPtrLd           = 21,
    VmPtrSt           = 22,
    VmRead            = 23,
    VmResume          = 24,
    VmWrite           = 25,
    VmOff             = 26,
    VmOn              = 27,
    MovCr             = 28,
    MovDr             = 29,
    Io                = 30,
    Rdmsr             = 31,
    Wrmsr             = 32,
    VmEntryGuest      = 33,
    VmEntryMsr        = 34,
    Mwait             = 36,
    Mtf               = 37,
    Monitor           = 39,
    Pause             = 40,
    VmEntryMc         = 41,
    TprThreshold      = 43,
    ApicAccess        = 44,
    VirtualizedEoi    = 45,
    GdtrIdtr          = 46,
    LdtrTr            = 47,
    EptViolation      = 48,
    EptMisconfig      = 49,
    EptInvept         = 50,
    Rdtscp            = 51,
    VmxTimerExpired   = 52,
    Invpid            = 53,
    Wbinvd            = 54,
    Xsetbv            = 55,
    ApicWrite         = 56,
    Rdrand            = 57,
    Invpcid           = 58,
    VmFunc            = 59,
    Rdseed            = 61,
    Xsaves            = 63,
    Xrstors           = 64,
}

/// Set in the exit reason when VM entry itself failed.
pub const EXIT_REASON_ENTRY_FAILURE: u32 = 1 << 31;

/// The event described by an interruption information field is valid.
pub const INTR_INFO_VALID:        u64 = 1 << 31;
/// The event delivers an error code.
pub const INTR_INFO_DELIVER_CODE: u64 = 1 << 11;
/// NMI unblocking due to IRET.
pub const INTR_INFO_NMI_UNBLOCK:  u64 = 1 << 12;
pub const INTR_INFO_VECTOR_MASK:  u64 = 0xff;
pub const INTR_INFO_TYPE_MASK:    u64 = 7 << 8;

pub const INTR_TYPE_EXT_INTR:      u64 = 0 << 8;
pub const INTR_TYPE_NMI:           u64 = 2 << 8;
pub const INTR_TYPE_HW_EXCEPTION:  u64 = 3 << 8;
pub const INTR_TYPE_SW_INTR:       u64 = 4 << 8;
pub const INTR_TYPE_PRIV_SW_EXCEPTION: u64 = 5 << 8;
pub const INTR_TYPE_SW_EXCEPTION:  u64 = 6 << 8;

pub const INTERRUPTIBILITY_STI:   u64 = 1 << 0;
pub const INTERRUPTIBILITY_MOVSS: u64 = 1 << 1;
pub const INTERRUPTIBILITY_SMI:   u64 = 1 << 2;
pub const INTERRUPTIBILITY_NMI:   u64 = 1 << 3;

pub const EXCEPTION_DE: u8 = 0;
pub const EXCEPTION_NMI: u8 = 2;
pub const EXCEPTION_BP: u8 = 3;
pub const EXCEPTION_OF: u8 = 4;
pub const EXCEPTION_UD: u8 = 6;
pub const EXCEPTION_TS: u8 = 10;
pub const EXCEPTION_NP: u8 = 11;
pub const EXCEPTION_GP: u8 = 13;
pub const EXCEPTION_PF: u8 = 14;

/// Reads the time-stamp counter of the host.
pub fn host_tsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        0
    }
}

/// Executes `cpuid` on the host and returns `[eax, ebx, ecx, edx]`.
pub fn host_cpuid(leaf: u32, subleaf: u32) -> [u32; 4] {
    #[cfg(target_arch = "x86_64")]
    {
        let result = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };

        [result.eax, result.ebx, result.ecx, result.edx]
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (leaf, subleaf);
        [0; 4]
    }
}
