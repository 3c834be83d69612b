//! This module provides guest memory access for the emulator: physical accesses that are served
//! either from the slot table or by the MMIO bus, and linear accesses that walk the guest page
//! tables first.

use crate::arch::x86_64::*;
use crate::bus::IoBus;
use crate::error::Error;
use crate::hypervisor::HypervisorVcpu;
use crate::memory::SlotTable;

const PAGE_SIZE: u64 = 0x1000;

const PTE_PRESENT:  u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_USER:     u64 = 1 << 2;
const PTE_ACCESSED: u64 = 1 << 5;
const PTE_DIRTY:    u64 = 1 << 6;
const PTE_LARGE:    u64 = 1 << 7;
const PTE_NX:       u64 = 1 << 63;

const PTE_ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

/// The page fault error code bits.
pub const PF_PRESENT: u32 = 1 << 0;
pub const PF_WRITE:   u32 = 1 << 1;
pub const PF_USER:    u32 = 1 << 2;
pub const PF_FETCH:   u32 = 1 << 4;

/// Guest physical memory as seen by the emulator.
#[derive(Clone, Copy)]
pub struct GuestMemory<'a> {
    slots: &'a SlotTable,
    bus: &'a dyn IoBus,
}

impl<'a> GuestMemory<'a> {
    pub fn new(slots: &'a SlotTable, bus: &'a dyn IoBus) -> Self {
        Self {
            slots,
            bus,
        }
    }

    /// The bus that serves accesses outside of the slots.
    pub fn bus(&self) -> &'a dyn IoBus {
        self.bus
    }

    /// Returns the length of the chunk starting at `gpa` that does not cross a page or slot
    /// boundary, and the host address backing it if it lies within a slot.
    fn chunk(&self, gpa: u64, len: usize) -> (usize, Option<*mut u8>) {
        let page_left = (!gpa & (PAGE_SIZE - 1)) + 1;
        let mut size = (len as u64).min(page_left);

        match self.slots.find(gpa) {
            Some(slot) => {
                size = size.min(slot.gpa + slot.size - gpa);
                (size as usize, Some(slot.host_address(gpa)))
            }
            _ => (size as usize, None),
        }
    }

    /// Reads guest physical memory.
    pub fn read_physical(&self, gpa: u64, bytes: &mut [u8]) {
        let mut offset = 0;

        while offset < bytes.len() {
            let address = gpa.wrapping_add(offset as u64);
            let (size, hva) = self.chunk(address, bytes.len() - offset);
            let chunk = &mut bytes[offset..offset + size];

            match hva {
                Some(hva) => unsafe {
                    std::ptr::copy_nonoverlapping(hva as *const u8, chunk.as_mut_ptr(), size);
                },
                _ => self.bus.mmio_read(address, chunk),
            }

            offset += size;
        }
    }

    /// Reads up to `bytes.len()` bytes at `gpa` without crossing a page or slot boundary, and
    /// returns the number of bytes read. Outside of the slots only a single byte is read, so
    /// devices never see reads beyond what the caller consumes.
    pub fn read_chunk(&self, gpa: u64, bytes: &mut [u8]) -> usize {
        let (size, hva) = self.chunk(gpa, bytes.len());

        match hva {
            Some(hva) => {
                unsafe {
                    std::ptr::copy_nonoverlapping(hva as *const u8, bytes.as_mut_ptr(), size);
                }

                size
            }
            _ => {
                let size = size.min(1);
                self.bus.mmio_read(gpa, &mut bytes[..size]);
                size
            }
        }
    }

    /// Writes guest physical memory.
    pub fn write_physical(&self, gpa: u64, bytes: &[u8]) {
        let mut offset = 0;

        while offset < bytes.len() {
            let address = gpa.wrapping_add(offset as u64);
            let (size, hva) = self.chunk(address, bytes.len() - offset);
            let chunk = &bytes[offset..offset + size];

            match hva {
                Some(hva) => unsafe {
                    std::ptr::copy_nonoverlapping(chunk.as_ptr(), hva, size);
                },
                _ => self.bus.mmio_write(address, chunk),
            }

            offset += size;
        }
    }

    pub fn read_u64(&self, gpa: u64) -> u64 {
        let mut bytes = [0u8; 8];
        self.read_physical(gpa, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    pub fn read_u32(&self, gpa: u64) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_physical(gpa, &mut bytes);
        u32::from_le_bytes(bytes)
    }
}

/// The kind of access that is being translated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}

/// The guest state that determines how linear addresses are translated.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PagingContext {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

impl PagingContext {
    /// Captures the paging state of the virtual CPU.
    pub fn read<V: HypervisorVcpu>(vcpu: &V) -> Result<Self, Error> {
        Ok(Self {
            cr0: vcpu.read_vmcs(Vmcs::GuestCr0)?,
            cr3: vcpu.read_vmcs(Vmcs::GuestCr3)?,
            cr4: vcpu.read_vmcs(Vmcs::GuestCr4)?,
            efer: vcpu.read_vmcs(Vmcs::GuestEfer)?,
        })
    }

    pub fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PG != 0
    }

    /// Translates the linear address into a guest physical address, updating the accessed and
    /// dirty bits of the entries it walks through.
    pub fn translate(
        &self,
        memory: &GuestMemory<'_>,
        linear: u64,
        access: AccessKind,
        user: bool,
    ) -> Result<u64, Error> {
        if !self.paging_enabled() {
            return Ok(linear);
        }

        let mut walk = Walk {
            memory,
            linear,
            access,
            user,
            write_protect: self.cr0 & CR0_WP != 0,
            nx: self.efer & EFER_NXE != 0,
            writable: true,
            allowed_user: true,
        };

        if self.efer & EFER_LMA != 0 {
            walk.long_mode(self.cr3)
        } else if self.cr4 & CR4_PAE != 0 {
            walk.pae(self.cr3)
        } else {
            walk.legacy(self.cr3, self.cr4 & CR4_PSE != 0)
        }
    }
}

/// The state of a single page walk.
struct Walk<'m, 'a> {
    memory: &'m GuestMemory<'a>,
    linear: u64,
    access: AccessKind,
    user: bool,
    write_protect: bool,
    nx: bool,
    writable: bool,
    allowed_user: bool,
}

impl<'m, 'a> Walk<'m, 'a> {
    fn fault(&self, present: bool) -> Error {
        let mut code = 0;

        if present {
            code |= PF_PRESENT;
        }

        if self.access == AccessKind::Write {
            code |= PF_WRITE;
        }

        if self.user {
            code |= PF_USER;
        }

        if self.access == AccessKind::Fetch && self.nx {
            code |= PF_FETCH;
        }

        Error::PageFault {
            linear: self.linear,
            code,
        }
    }

    /// Checks a paging-structure entry and marks it accessed (and dirty, for a written leaf).
    fn visit(&mut self, address: u64, entry: u64, leaf: bool, wide: bool) -> Result<(), Error> {
        if entry & PTE_PRESENT == 0 {
            return Err(self.fault(false));
        }

        self.writable &= entry & PTE_WRITABLE != 0;
        self.allowed_user &= entry & PTE_USER != 0;

        if leaf {
            let write_denied = !self.writable && (self.user || self.write_protect);

            if (self.access == AccessKind::Write && write_denied) ||
                (self.user && !self.allowed_user) {
                return Err(self.fault(true));
            }

            if self.access == AccessKind::Fetch && self.nx && wide && entry & PTE_NX != 0 {
                return Err(self.fault(true));
            }
        }

        let mut updated = entry | PTE_ACCESSED;

        if leaf && self.access == AccessKind::Write {
            updated |= PTE_DIRTY;
        }

        if updated != entry {
            if wide {
                self.memory.write_physical(address, &updated.to_le_bytes());
            } else {
                self.memory.write_physical(address, &(updated as u32).to_le_bytes());
            }
        }

        Ok(())
    }

    fn entry(&self, table: u64, index: u64) -> (u64, u64) {
        let address = table + index * 8;

        (address, self.memory.read_u64(address))
    }

    fn long_mode(&mut self, cr3: u64) -> Result<u64, Error> {
        let mut table = cr3 & PTE_ADDRESS_MASK;

        for level in (1..=4u32).rev() {
            let shift = 12 + 9 * (level - 1);
            let index = (self.linear >> shift) & 0x1ff;
            let (address, entry) = self.entry(table, index);
            let leaf = level == 1 || ((level == 2 || level == 3) && entry & PTE_LARGE != 0);

            self.visit(address, entry, leaf, true)?;

            if leaf {
                let page_mask = (1u64 << shift) - 1;
                return Ok((entry & PTE_ADDRESS_MASK & !page_mask) | (self.linear & page_mask));
            }

            table = entry & PTE_ADDRESS_MASK;
        }

        unreachable!()
    }

    fn pae(&mut self, cr3: u64) -> Result<u64, Error> {
        let pdpte = self.memory.read_u64((cr3 & !0x1f) + ((self.linear >> 30) & 0x3) * 8);

        if pdpte & PTE_PRESENT == 0 {
            return Err(self.fault(false));
        }

        let (address, pde) = self.entry(pdpte & PTE_ADDRESS_MASK, (self.linear >> 21) & 0x1ff);
        let large = pde & PTE_LARGE != 0;

        self.visit(address, pde, large, true)?;

        if large {
            return Ok((pde & PTE_ADDRESS_MASK & !0x1f_ffff) | (self.linear & 0x1f_ffff));
        }

        let (address, pte) = self.entry(pde & PTE_ADDRESS_MASK, (self.linear >> 12) & 0x1ff);

        self.visit(address, pte, true, true)?;

        Ok((pte & PTE_ADDRESS_MASK) | (self.linear & 0xfff))
    }

    fn legacy(&mut self, cr3: u64, pse: bool) -> Result<u64, Error> {
        let linear = self.linear & 0xffff_ffff;
        let address = (cr3 & 0xffff_f000) + ((linear >> 22) & 0x3ff) * 4;
        let pde = self.memory.read_u32(address) as u64;
        let large = pse && pde & PTE_LARGE != 0;

        self.visit(address, pde, large, false)?;

        if large {
            // PSE-36 keeps physical address bits 32..39 in bits 13..20.
            let high = ((pde >> 13) & 0xff) << 32;
            return Ok(high | (pde & 0xffc0_0000) | (linear & 0x3f_ffff));
        }

        let address = (pde & 0xffff_f000) + ((linear >> 12) & 0x3ff) * 4;
        let pte = self.memory.read_u32(address) as u64;

        self.visit(address, pte, true, false)?;

        Ok((pte & 0xffff_f000) | (linear & 0xfff))
    }
}

/// Linear memory as seen by the guest, translated through the guest page tables.
#[derive(Clone, Copy)]
pub struct LinearMemory<'a> {
    pub memory: GuestMemory<'a>,
    pub paging: PagingContext,
    /// Whether accesses are performed on behalf of user mode code.
    pub user: bool,
}

impl<'a> LinearMemory<'a> {
    pub fn new(memory: GuestMemory<'a>, paging: PagingContext, user: bool) -> Self {
        Self {
            memory,
            paging,
            user,
        }
    }

    /// Returns the same view for implicit supervisor accesses, such as descriptor table and TSS
    /// accesses.
    pub fn supervisor(&self) -> Self {
        Self {
            user: false,
            ..*self
        }
    }

    fn access<F>(&self, linear: u64, len: usize, kind: AccessKind, mut f: F) -> Result<(), Error>
    where
        F: FnMut(u64, usize, usize),
    {
        let mut offset = 0;

        while offset < len {
            let address = linear.wrapping_add(offset as u64);
            let page_end = (address | (PAGE_SIZE - 1)).wrapping_add(1);
            let size = ((len - offset) as u64).min(page_end.wrapping_sub(address)) as usize;
            let gpa = self.paging.translate(&self.memory, address, kind, self.user)?;

            f(gpa, offset, size);
            offset += size;
        }

        Ok(())
    }

    pub fn translate(&self, linear: u64, kind: AccessKind) -> Result<u64, Error> {
        self.paging.translate(&self.memory, linear, kind, self.user)
    }

    pub fn read(&self, linear: u64, bytes: &mut [u8]) -> Result<(), Error> {
        self.read_as(linear, bytes, AccessKind::Read)
    }

    /// Reads linear memory, checking the translation for the given kind of access.
    pub fn read_as(&self, linear: u64, bytes: &mut [u8], kind: AccessKind) -> Result<(), Error> {
        let memory = self.memory;
        let len = bytes.len();

        self.access(linear, len, kind, |gpa, offset, size| {
            memory.read_physical(gpa, &mut bytes[offset..offset + size]);
        })
    }

    /// Fetches instruction bytes at `linear` up to the end of the page or of the memory backing
    /// it, and returns how many bytes were fetched.
    pub fn fetch(&self, linear: u64, bytes: &mut [u8]) -> Result<usize, Error> {
        let gpa = self.translate(linear, AccessKind::Fetch)?;

        Ok(self.memory.read_chunk(gpa, bytes))
    }

    pub fn write(&self, linear: u64, bytes: &[u8]) -> Result<(), Error> {
        let memory = self.memory;

        self.access(linear, bytes.len(), AccessKind::Write, |gpa, offset, size| {
            memory.write_physical(gpa, &bytes[offset..offset + size]);
        })
    }
}
