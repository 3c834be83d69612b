//! This module provides access to the segment and gate descriptors held in the guest's descriptor
//! tables.

use crate::arch::x86_64::{DescriptorTable, Segment};
use crate::error::Error;
use crate::mmu::LinearMemory;

/// The descriptor type of an available 32-bit TSS.
pub const TYPE_TSS32_AVAILABLE: u8 = 9;
/// The descriptor type of a busy 32-bit TSS.
pub const TYPE_TSS32_BUSY: u8 = 11;
/// The descriptor type of an available 16-bit TSS.
pub const TYPE_TSS16_AVAILABLE: u8 = 1;
/// The descriptor type of a busy 16-bit TSS.
pub const TYPE_TSS16_BUSY: u8 = 3;
/// The descriptor type of a task gate.
pub const TYPE_TASK_GATE: u8 = 5;

/// The busy bit within the type of a TSS descriptor.
const TYPE_TSS_BUSY: u8 = 1 << 1;

/// An 8-byte segment descriptor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SegmentDescriptor(pub u64);

impl SegmentDescriptor {
    pub fn base(&self) -> u64 {
        ((self.0 >> 16) & 0xff_ffff) | (((self.0 >> 56) & 0xff) << 24)
    }

    /// The limit in bytes, i.e. expanded according to the granularity bit.
    pub fn limit(&self) -> u32 {
        let limit = ((self.0 & 0xffff) | (((self.0 >> 48) & 0xf) << 16)) as u32;

        if self.granularity() {
            (limit << 12) | 0xfff
        } else {
            limit
        }
    }

    pub fn segment_type(&self) -> u8 {
        ((self.0 >> 40) & 0xf) as u8
    }

    pub fn set_segment_type(&mut self, segment_type: u8) {
        self.0 = (self.0 & !(0xf << 40)) | (((segment_type & 0xf) as u64) << 40);
    }

    /// Whether this is a code or data segment rather than a system descriptor.
    pub fn non_system(&self) -> bool {
        (self.0 >> 44) & 1 != 0
    }

    pub fn dpl(&self) -> u8 {
        ((self.0 >> 45) & 0x3) as u8
    }

    pub fn present(&self) -> bool {
        (self.0 >> 47) & 1 != 0
    }

    pub fn available(&self) -> bool {
        (self.0 >> 52) & 1 != 0
    }

    pub fn long(&self) -> bool {
        (self.0 >> 53) & 1 != 0
    }

    pub fn default_size(&self) -> bool {
        (self.0 >> 54) & 1 != 0
    }

    pub fn granularity(&self) -> bool {
        (self.0 >> 55) & 1 != 0
    }

    /// Returns `true` if this describes a 16-bit or 32-bit TSS, busy or not.
    pub fn is_tss(&self) -> bool {
        !self.non_system() && (self.segment_type() & !TYPE_TSS_BUSY) & 0x7 == TYPE_TSS16_AVAILABLE
    }

    /// Returns `true` for a 32-bit TSS.
    pub fn is_tss32(&self) -> bool {
        self.is_tss() && self.segment_type() & 0x8 != 0
    }

    pub fn busy(&self) -> bool {
        self.segment_type() & TYPE_TSS_BUSY != 0
    }

    pub fn set_busy(&mut self, busy: bool) {
        let segment_type = self.segment_type();

        self.set_segment_type(if busy {
            segment_type | TYPE_TSS_BUSY
        } else {
            segment_type & !TYPE_TSS_BUSY
        });
    }

    /// Converts the descriptor into the cached segment register format.
    pub fn to_segment(&self, selector: u16) -> Segment {
        Segment {
            base: self.base(),
            limit: self.limit(),
            selector,
            segment_type: self.segment_type(),
            non_system_segment: self.non_system(),
            dpl: self.dpl(),
            present: self.present(),
            available: self.available(),
            long: self.long(),
            default: self.default_size(),
            granularity: self.granularity(),
            unusable: false,
        }
    }
}

/// An 8-byte gate descriptor in the protected-mode IDT.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GateDescriptor(pub u64);

impl GateDescriptor {
    /// The segment selector, which is the TSS selector for task gates.
    pub fn selector(&self) -> u16 {
        ((self.0 >> 16) & 0xffff) as u16
    }

    pub fn gate_type(&self) -> u8 {
        ((self.0 >> 40) & 0xf) as u8
    }

    pub fn dpl(&self) -> u8 {
        ((self.0 >> 45) & 0x3) as u8
    }

    pub fn present(&self) -> bool {
        (self.0 >> 47) & 1 != 0
    }
}

/// Locates the descriptor for `selector` in the GDT, or in the LDT if the table indicator is set.
fn descriptor_address(gdt: &DescriptorTable, ldt: &Segment, selector: u16) -> Result<u64, Error> {
    let (base, limit) = if selector & 0x4 != 0 {
        if ldt.unusable {
            return Err(Error::InvalidSelector(selector));
        }

        (ldt.base, ldt.limit as u64)
    } else {
        (gdt.base, gdt.limit as u64)
    };

    let offset = (selector & !0x7) as u64;

    if offset + 7 > limit {
        return Err(Error::InvalidSelector(selector));
    }

    Ok(base.wrapping_add(offset))
}

/// Reads the descriptor that `selector` refers to.
pub fn read_descriptor(
    memory: &LinearMemory<'_>,
    gdt: &DescriptorTable,
    ldt: &Segment,
    selector: u16,
) -> Result<SegmentDescriptor, Error> {
    let address = descriptor_address(gdt, ldt, selector)?;
    let mut bytes = [0u8; 8];

    memory.supervisor().read(address, &mut bytes)?;

    Ok(SegmentDescriptor(u64::from_le_bytes(bytes)))
}

/// Writes back the descriptor that `selector` refers to.
pub fn write_descriptor(
    memory: &LinearMemory<'_>,
    gdt: &DescriptorTable,
    ldt: &Segment,
    selector: u16,
    descriptor: SegmentDescriptor,
) -> Result<(), Error> {
    let address = descriptor_address(gdt, ldt, selector)?;

    memory.supervisor().write(address, &descriptor.0.to_le_bytes())
}

/// Reads the protected-mode IDT gate for `vector`.
pub fn read_gate(
    memory: &LinearMemory<'_>,
    idt: &DescriptorTable,
    vector: u8,
) -> Result<GateDescriptor, Error> {
    let offset = vector as u64 * 8;

    if offset + 7 > idt.limit as u64 {
        return Err(Error::InvalidSelector((offset as u16) | 0x2));
    }

    let mut bytes = [0u8; 8];

    memory.supervisor().read(idt.base.wrapping_add(offset), &mut bytes)?;

    Ok(GateDescriptor(u64::from_le_bytes(bytes)))
}
