//! This module provides the memory slot table, which tracks the guest physical address ranges that
//! are backed by host memory.
//!
//! A slot is present if and only if its size is non-zero. No two present slots ever overlap in
//! the guest physical address space, and no range may wrap around the end of it. Lookups take the read side of the table lock, while
//! registrations and removals take the write side and call into the [`Hypervisor`] while holding
//! it.

use crate::error::Error;
use crate::hypervisor::Hypervisor;
use crate::vm::ProtectionFlags;
use log::{debug, trace};
use parking_lot::RwLock;
use std::ops::Range;

/// The default number of slots in the slot table.
pub const DEFAULT_SLOT_CAPACITY: usize = 512;

/// Represents a contiguous guest physical address range backed by host memory.
#[derive(Clone, Copy, Debug)]
pub struct Slot {
    /// The stable identifier of the slot, i.e. its index in the table.
    pub id: usize,
    /// The guest physical address at which the slot starts.
    pub gpa: u64,
    /// The size of the slot in bytes. A size of zero marks the slot as absent.
    pub size: u64,
    /// The host virtual address backing the start of the slot.
    pub hva: *mut u8,
    /// The protection of the guest physical range.
    pub protection: ProtectionFlags,
}

// A slot only describes host memory owned by whoever registered it, which keeps that memory
// mapped while the slot is present.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

impl Slot {
    fn empty(id: usize) -> Self {
        Self {
            id,
            gpa: 0,
            size: 0,
            hva: std::ptr::null_mut(),
            protection: ProtectionFlags::empty(),
        }
    }

    /// Returns `true` if the slot is in use.
    pub fn is_present(&self) -> bool {
        self.size != 0
    }

    /// The guest physical address range covered by the slot.
    pub fn range(&self) -> Range<u64> {
        self.gpa..self.gpa + self.size
    }

    /// Returns `true` if the slot overlaps with the guest physical range `start..end`.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.is_present() && start < self.gpa + self.size && end > self.gpa
    }

    /// Returns `true` if the guest physical address lies within the slot.
    pub fn contains(&self, gpa: u64) -> bool {
        self.is_present() && gpa >= self.gpa && gpa - self.gpa < self.size
    }

    /// Translates a guest physical address within the slot into a host virtual address.
    pub fn host_address(&self, gpa: u64) -> *mut u8 {
        self.hva.wrapping_add((gpa - self.gpa) as usize)
    }
}

/// The table of memory slots of a VM.
pub struct SlotTable {
    slots: RwLock<Vec<Slot>>,
}

impl SlotTable {
    /// Creates a table with room for `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new((0..capacity).map(Slot::empty).collect()),
        }
    }

    /// The number of slots in the table.
    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns the present slot that contains `gpa`.
    pub fn find(&self, gpa: u64) -> Option<Slot> {
        self.slots
            .read()
            .iter()
            .find(|slot| slot.contains(gpa))
            .copied()
    }

    /// Returns a copy of every present slot.
    pub fn present(&self) -> Vec<Slot> {
        self.slots
            .read()
            .iter()
            .filter(|slot| slot.is_present())
            .copied()
            .collect()
    }

    /// Registers host memory at the given guest physical range.
    ///
    /// Re-registering an identical mapping does nothing, and a mapping of exactly the same range
    /// but with a different host address or protection replaces the existing one. Any other
    /// overlap with a present slot is rejected, as is a registration when the table is full.
    ///
    /// # Safety
    ///
    /// The host memory must remain mapped for as long as the slot is present.
    pub unsafe fn map<H: Hypervisor>(
        &self,
        hypervisor: &H,
        hva: *mut u8,
        gpa: u64,
        size: u64,
        protection: ProtectionFlags,
    ) -> Result<(), Error> {
        let end = region_end(gpa, size)?;

        map_locked(&mut self.slots.write(), hypervisor, hva, gpa, end, protection)
    }

    /// Removes the slot covering exactly the given guest physical range. Removing a range that is
    /// not mapped at all is not an error, but a range that only partially matches a slot is.
    pub fn unmap<H: Hypervisor>(&self, hypervisor: &H, gpa: u64, size: u64) -> Result<(), Error> {
        let end = region_end(gpa, size)?;
        let mut slots = self.slots.write();

        let slot = match slots.iter_mut().find(|slot| slot.overlaps(gpa, end)) {
            Some(slot) => slot,
            _ => {
                trace!("unmap of {:#x}+{:#x}: no slot", gpa, size);
                return Ok(());
            }
        };

        if slot.gpa != gpa || slot.size != size {
            return Err(Error::UnmatchedUnmap {
                gpa,
                size,
                slot_gpa: slot.gpa,
                slot_size: slot.size,
            });
        }

        hypervisor.unmap(gpa, size)?;
        slot.size = 0;

        debug!("slot {}: unmapped {:#x}+{:#x}", slot.id, gpa, size);

        Ok(())
    }

    /// Registers a RAM region announced by the memory subsystem. Unlike [`Self::map`], slots that
    /// overlap the new region are torn down first, as the region supersedes them. The table stays
    /// locked for the whole replacement.
    ///
    /// # Safety
    ///
    /// The host memory must remain mapped for as long as the slot is present.
    pub unsafe fn region_add<H: Hypervisor>(
        &self,
        hypervisor: &H,
        hva: *mut u8,
        gpa: u64,
        size: u64,
        protection: ProtectionFlags,
    ) -> Result<(), Error> {
        let end = region_end(gpa, size)?;
        let mut slots = self.slots.write();

        let unchanged = slots
            .iter()
            .find(|slot| slot.overlaps(gpa, end))
            .map_or(false, |slot| slot.gpa == gpa && slot.size == size && slot.hva == hva);

        if unchanged {
            return Ok(());
        }

        region_del_locked(&mut slots, hypervisor, gpa, end)?;
        map_locked(&mut slots, hypervisor, hva, gpa, end, protection)
    }

    /// Tears down every slot that overlaps the region removed by the memory subsystem.
    pub fn region_del<H: Hypervisor>(&self, hypervisor: &H, gpa: u64, size: u64) -> Result<(), Error> {
        let end = region_end(gpa, size)?;

        region_del_locked(&mut self.slots.write(), hypervisor, gpa, end)
    }

    /// Changes the protection of a guest physical range that lies within a single slot.
    pub fn protect<H: Hypervisor>(
        &self,
        hypervisor: &H,
        gpa: u64,
        size: u64,
        protection: ProtectionFlags,
    ) -> Result<(), Error> {
        let end = region_end(gpa, size)?;
        let mut slots = self.slots.write();

        let slot = slots
            .iter_mut()
            .find(|slot| slot.contains(gpa) && end <= slot.gpa + slot.size)
            .ok_or(Error::InvalidGuestAddress(gpa))?;

        hypervisor.protect(gpa, size, protection)?;

        if slot.gpa == gpa && slot.size == size {
            slot.protection = protection;
        }

        Ok(())
    }

    /// Replaces the host memory backing the slot that starts at `gpa`.
    ///
    /// # Safety
    ///
    /// The new host memory must be at least as large as the slot and remain mapped for as long as
    /// the slot is present.
    pub unsafe fn remap<H: Hypervisor>(&self, hypervisor: &H, gpa: u64, hva: *mut u8) -> Result<(), Error> {
        let mut slots = self.slots.write();

        let slot = slots
            .iter_mut()
            .find(|slot| slot.is_present() && slot.gpa == gpa)
            .ok_or(Error::InvalidGuestAddress(gpa))?;

        hypervisor.unmap(slot.gpa, slot.size)?;
        hypervisor.map(hva, slot.gpa, slot.size, slot.protection)?;
        slot.hva = hva;

        debug!("slot {}: remapped {:#x}+{:#x} to {:p}", slot.id, slot.gpa, slot.size, hva);

        Ok(())
    }

    /// Translates a guest physical address into the host virtual address backing it.
    pub fn gpa_to_hva(&self, gpa: u64) -> Option<*mut u8> {
        self.slots
            .read()
            .iter()
            .find(|slot| slot.contains(gpa))
            .map(|slot| slot.host_address(gpa))
    }

    /// Returns the guest physical ranges backed by the host virtual range `hva..hva + len`, one per
    /// slot that intersects it.
    pub fn hva_to_gpa_ranges(&self, hva: *const u8, len: usize) -> Vec<Range<u64>> {
        let start = hva as u64;
        let end = start.saturating_add(len as u64);

        self.slots
            .read()
            .iter()
            .filter(|slot| slot.is_present())
            .filter_map(|slot| {
                let slot_start = slot.hva as u64;
                let slot_end = slot_start.saturating_add(slot.size);

                let from = start.max(slot_start);
                let to = end.min(slot_end);

                if from >= to {
                    return None;
                }

                Some(slot.gpa + (from - slot_start)..slot.gpa + (to - slot_start))
            })
            .collect()
    }
}

/// Returns the exclusive end of the guest physical range `gpa..gpa + size`.
fn region_end(gpa: u64, size: u64) -> Result<u64, Error> {
    gpa.checked_add(size).ok_or(Error::InvalidRegion { gpa, size })
}

unsafe fn map_locked<H: Hypervisor>(
    slots: &mut [Slot],
    hypervisor: &H,
    hva: *mut u8,
    gpa: u64,
    end: u64,
    protection: ProtectionFlags,
) -> Result<(), Error> {
    let size = end - gpa;

    if let Some(index) = slots.iter().position(|slot| slot.overlaps(gpa, end)) {
        let slot = slots[index];

        if slot.gpa != gpa || slot.size != size {
            return Err(Error::OverlappingSlot {
                gpa,
                size,
                slot: slot.id,
                slot_gpa: slot.gpa,
                slot_size: slot.size,
            });
        }

        if slot.hva == hva {
            if slot.protection != protection {
                hypervisor.protect(gpa, size, protection)?;
                slots[index].protection = protection;
            }

            return Ok(());
        }

        debug!("slot {}: replacing backing of {:#x}+{:#x}", slot.id, gpa, size);
        hypervisor.unmap(gpa, size)?;
        slots[index].size = 0;
    }

    let slot = slots
        .iter_mut()
        .find(|slot| !slot.is_present())
        .ok_or(Error::SlotTableFull { gpa, size })?;

    hypervisor.map(hva, gpa, size, protection)?;

    slot.gpa = gpa;
    slot.size = size;
    slot.hva = hva;
    slot.protection = protection;

    debug!("slot {}: mapped {:#x}+{:#x} at {:p}", slot.id, gpa, size, hva);

    Ok(())
}

fn region_del_locked<H: Hypervisor>(
    slots: &mut [Slot],
    hypervisor: &H,
    gpa: u64,
    end: u64,
) -> Result<(), Error> {
    for slot in slots.iter_mut().filter(|slot| slot.overlaps(gpa, end)) {
        hypervisor.unmap(slot.gpa, slot.size)?;
        debug!("slot {}: reset {:#x}+{:#x}", slot.id, slot.gpa, slot.size);
        slot.size = 0;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeHypervisor;
    use proptest::prelude::*;

    fn buffer(size: usize) -> Vec<u8> {
        vec![0; size]
    }

    #[test]
    fn identical_map_is_a_no_op() {
        let hypervisor = FakeHypervisor::default();
        let table = SlotTable::new(4);
        let mut ram = buffer(0x2000);

        unsafe {
            table.map(&hypervisor, ram.as_mut_ptr(), 0x1000, 0x2000, ProtectionFlags::all()).unwrap();
            table.map(&hypervisor, ram.as_mut_ptr(), 0x1000, 0x2000, ProtectionFlags::all()).unwrap();
        }

        assert_eq!(table.present().len(), 1);
        assert_eq!(hypervisor.map_calls(), 1);
    }

    #[test]
    fn same_range_with_new_backing_replaces_the_slot() {
        let hypervisor = FakeHypervisor::default();
        let table = SlotTable::new(4);
        let mut old = buffer(0x1000);
        let mut new = buffer(0x1000);

        unsafe {
            table.map(&hypervisor, old.as_mut_ptr(), 0x1000, 0x1000, ProtectionFlags::all()).unwrap();
            table.map(&hypervisor, new.as_mut_ptr(), 0x1000, 0x1000, ProtectionFlags::all()).unwrap();
        }

        assert_eq!(table.present().len(), 1);
        assert_eq!(table.gpa_to_hva(0x1000), Some(new.as_mut_ptr()));
    }

    #[test]
    fn partial_overlap_is_rejected() {
        let hypervisor = FakeHypervisor::default();
        let table = SlotTable::new(4);
        let mut ram = buffer(0x3000);

        unsafe {
            table.map(&hypervisor, ram.as_mut_ptr(), 0x1000, 0x2000, ProtectionFlags::all()).unwrap();

            let result = table.map(&hypervisor, ram.as_mut_ptr(), 0x2000, 0x2000, ProtectionFlags::all());
            let error = result.unwrap_err();

            assert!(matches!(error, Error::OverlappingSlot { .. }));
            assert!(error.is_fatal());
        }
    }

    #[test]
    fn exhausted_table_is_fatal() {
        let hypervisor = FakeHypervisor::default();
        let table = SlotTable::new(2);
        let mut ram = buffer(0x3000);

        unsafe {
            table.map(&hypervisor, ram.as_mut_ptr(), 0x0000, 0x1000, ProtectionFlags::all()).unwrap();
            table.map(&hypervisor, ram.as_mut_ptr().add(0x1000), 0x1000, 0x1000, ProtectionFlags::all()).unwrap();

            let result = table.map(&hypervisor, ram.as_mut_ptr().add(0x2000), 0x2000, 0x1000, ProtectionFlags::all());

            assert!(matches!(result, Err(Error::SlotTableFull { .. })));
        }
    }

    #[test]
    fn unmap_requires_an_exact_match() {
        let hypervisor = FakeHypervisor::default();
        let table = SlotTable::new(4);
        let mut ram = buffer(0x2000);

        unsafe {
            table.map(&hypervisor, ram.as_mut_ptr(), 0x1000, 0x2000, ProtectionFlags::all()).unwrap();
        }

        assert!(matches!(
            table.unmap(&hypervisor, 0x1000, 0x1000),
            Err(Error::UnmatchedUnmap { .. })
        ));

        // Nothing mapped here.
        table.unmap(&hypervisor, 0x8000, 0x1000).unwrap();

        table.unmap(&hypervisor, 0x1000, 0x2000).unwrap();
        assert!(table.present().is_empty());
    }

    #[test]
    fn region_add_resets_overlapping_slots() {
        let hypervisor = FakeHypervisor::default();
        let table = SlotTable::new(4);
        let mut low = buffer(0x1000);
        let mut high = buffer(0x1000);
        let mut big = buffer(0x4000);

        unsafe {
            table.map(&hypervisor, low.as_mut_ptr(), 0x0000, 0x1000, ProtectionFlags::all()).unwrap();
            table.map(&hypervisor, high.as_mut_ptr(), 0x2000, 0x1000, ProtectionFlags::all()).unwrap();
            table.region_add(&hypervisor, big.as_mut_ptr(), 0x0000, 0x4000, ProtectionFlags::all()).unwrap();
        }

        let present = table.present();
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].range(), 0..0x4000);
    }

    #[test]
    fn region_add_is_atomic_with_concurrent_maps() {
        use std::sync::Arc;
        use std::thread;

        let hypervisor = Arc::new(FakeHypervisor::default());
        let table = Arc::new(SlotTable::new(4));
        let mut big = buffer(0x4000);
        let mut small = buffer(0x1000);
        let (big_hva, small_hva) = (big.as_mut_ptr() as usize, small.as_mut_ptr() as usize);

        let mapper = {
            let hypervisor = hypervisor.clone();
            let table = table.clone();

            thread::spawn(move || {
                for _ in 0..2000 {
                    // Both fail while the region is present.
                    let _ = unsafe {
                        table.map(&*hypervisor, small_hva as *mut u8, 0x2000, 0x1000, ProtectionFlags::all())
                    };
                    let _ = table.unmap(&*hypervisor, 0x2000, 0x1000);
                }
            })
        };

        for _ in 0..2000 {
            unsafe {
                table.region_add(&*hypervisor, big_hva as *mut u8, 0, 0x4000, ProtectionFlags::all()).unwrap();
            }

            table.region_del(&*hypervisor, 0, 0x4000).unwrap();
        }

        mapper.join().unwrap();

        let present = table.present();
        assert!(present.len() <= 1);
        assert_eq!(hypervisor.mappings(), present.iter().map(|slot| (slot.gpa, slot.size)).collect::<Vec<_>>());
    }

    #[test]
    fn ranges_wrapping_the_address_space_are_rejected() {
        let hypervisor = FakeHypervisor::default();
        let table = SlotTable::new(4);
        let mut ram = buffer(0x2000);
        let gpa = u64::MAX - 0xfff;

        unsafe {
            let error = table.map(&hypervisor, ram.as_mut_ptr(), gpa, 0x2000, ProtectionFlags::all()).unwrap_err();

            assert!(matches!(error, Error::InvalidRegion { .. }));
            assert!(error.is_fatal());
            assert!(matches!(
                table.region_add(&hypervisor, ram.as_mut_ptr(), gpa, 0x2000, ProtectionFlags::all()),
                Err(Error::InvalidRegion { .. })
            ));
        }

        assert!(matches!(table.unmap(&hypervisor, gpa, 0x2000), Err(Error::InvalidRegion { .. })));
        assert!(matches!(table.region_del(&hypervisor, gpa, 0x2000), Err(Error::InvalidRegion { .. })));
        assert!(matches!(
            table.protect(&hypervisor, gpa, 0x2000, ProtectionFlags::READ),
            Err(Error::InvalidRegion { .. })
        ));

        // A range that ends below the wrap-around point is fine.
        unsafe {
            table.map(&hypervisor, ram.as_mut_ptr(), gpa - 0x1000, 0x1000, ProtectionFlags::all()).unwrap();
        }

        assert!(table.find(u64::MAX).is_none());
        assert!(table.find(gpa - 1).is_some());
        assert_eq!(table.hva_to_gpa_ranges(ram.as_ptr(), usize::MAX).len(), 1);
        assert_eq!(hypervisor.map_calls(), 1);
    }

    #[test]
    fn hva_to_gpa_ranges_clips_to_slots() {
        let hypervisor = FakeHypervisor::default();
        let table = SlotTable::new(4);
        let mut ram = buffer(0x2000);
        let base = ram.as_mut_ptr();

        unsafe {
            table.map(&hypervisor, base, 0x10_0000, 0x1000, ProtectionFlags::all()).unwrap();
            table.map(&hypervisor, base.add(0x1000), 0x40_0000, 0x1000, ProtectionFlags::all()).unwrap();
        }

        let ranges = table.hva_to_gpa_ranges(unsafe { base.add(0x800) }, 0x1000);

        assert_eq!(ranges, vec![0x10_0800..0x10_1000, 0x40_0000..0x40_0800]);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Map { page: u64, pages: u64, offset: u64 },
        Unmap { page: u64, pages: u64 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..16u64, 1..4u64, 0..4u64).prop_map(|(page, pages, offset)| Op::Map { page, pages, offset }),
            (0..16u64, 1..4u64).prop_map(|(page, pages)| Op::Unmap { page, pages }),
        ]
    }

    proptest! {
        #[test]
        fn present_slots_never_overlap(ops in proptest::collection::vec(op(), 1..32)) {
            let hypervisor = FakeHypervisor::default();
            let table = SlotTable::new(8);
            let mut ram = buffer(0x8000);
            let base = ram.as_mut_ptr();

            for op in ops {
                let _ = match op {
                    Op::Map { page, pages, offset } => unsafe {
                        table.map(
                            &hypervisor,
                            base.add((offset * 0x1000) as usize),
                            page * 0x1000,
                            pages * 0x1000,
                            ProtectionFlags::all(),
                        )
                    },
                    Op::Unmap { page, pages } =>
                        table.unmap(&hypervisor, page * 0x1000, pages * 0x1000),
                };

                let present = table.present();

                for (i, a) in present.iter().enumerate() {
                    for b in &present[i + 1..] {
                        prop_assert!(!a.overlaps(b.gpa, b.gpa + b.size));
                    }

                    for offset in (0..a.size).step_by(0x800) {
                        prop_assert_eq!(
                            table.gpa_to_hva(a.gpa + offset),
                            Some(a.hva.wrapping_add(offset as usize))
                        );
                    }
                }
            }
        }
    }
}
