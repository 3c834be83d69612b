//! Software doubles of the hardware virtualization facility, the I/O bus and the local APIC.
//! Registers and VMCS fields live in maps, and VM exits are replayed from a script.

use crate::arch::x86_64::*;
use crate::bus::IoBus;
use crate::error::Error;
use crate::hypervisor::{Hypervisor, HypervisorVcpu};
use crate::irq::Apic;
use crate::vm::ProtectionFlags;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Default)]
struct FakeHypervisorState {
    mappings: HashMap<u64, (u64, usize, ProtectionFlags)>,
    map_calls: usize,
    kicks: Vec<u32>,
    next_vcpu: u32,
    tsc: Option<u64>,
}

/// A hypervisor that only keeps track of the guest physical mappings.
#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeHypervisorState>,
}

impl FakeHypervisor {
    /// The number of successful calls to [`Hypervisor::map`].
    pub fn map_calls(&self) -> usize {
        self.state.lock().map_calls
    }

    /// The mappings, as `(gpa, size)` pairs sorted by address.
    pub fn mappings(&self) -> Vec<(u64, u64)> {
        let state = self.state.lock();
        let mut mappings: Vec<_> = state
            .mappings
            .iter()
            .map(|(gpa, (size, _, _))| (*gpa, *size))
            .collect();

        mappings.sort();
        mappings
    }

    pub fn kicks(&self) -> Vec<u32> {
        self.state.lock().kicks.clone()
    }

    pub fn synced_tsc(&self) -> Option<u64> {
        self.state.lock().tsc
    }
}

impl Hypervisor for FakeHypervisor {
    type Vcpu = FakeVcpu;

    fn create_vcpu(&self) -> Result<FakeVcpu, Error> {
        let mut state = self.state.lock();
        let id = state.next_vcpu;

        state.next_vcpu += 1;

        Ok(FakeVcpu::new(id))
    }

    unsafe fn map(
        &self,
        hva: *mut u8,
        gpa: u64,
        size: u64,
        protection: ProtectionFlags,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();

        let overlaps = state
            .mappings
            .iter()
            .any(|(start, (len, _, _))| *start < gpa + size && gpa < start + len);

        if overlaps {
            return Err(Error::HypervisorError(0xfae0_0001));
        }

        state.mappings.insert(gpa, (size, hva as usize, protection));
        state.map_calls += 1;

        Ok(())
    }

    fn unmap(&self, gpa: u64, size: u64) -> Result<(), Error> {
        let mut state = self.state.lock();

        match state.mappings.remove(&gpa) {
            Some((len, _, _)) if len == size => Ok(()),
            _ => Err(Error::HypervisorError(0xfae0_0002)),
        }
    }

    fn protect(&self, gpa: u64, size: u64, protection: ProtectionFlags) -> Result<(), Error> {
        let mut state = self.state.lock();

        let mapping = state
            .mappings
            .iter_mut()
            .find(|(start, (len, _, _))| **start <= gpa && gpa + size <= **start + len)
            .ok_or(Error::HypervisorError(0xfae0_0003))?;

        (mapping.1).2 = protection;

        Ok(())
    }

    fn kick(&self, vcpus: &[u32]) -> Result<(), Error> {
        self.state.lock().kicks.extend_from_slice(vcpus);

        Ok(())
    }

    fn sync_tsc(&self, tsc: u64) -> Result<(), Error> {
        self.state.lock().tsc = Some(tsc);

        Ok(())
    }
}

/// A VM exit to replay from [`FakeVcpu::run`].
#[derive(Clone, Debug, Default)]
pub struct ScriptedExit {
    pub reason: u64,
    pub qualification: u64,
    pub instruction_length: u64,
    pub gpa: u64,
    pub linear: u64,
    pub idt_vectoring: u64,
    pub idt_vectoring_error: u64,
    /// Registers changed by the guest before the exit.
    pub registers: Vec<(Register, u64)>,
    /// VMCS fields changed by the guest before the exit.
    pub vmcs: Vec<(Vmcs, u64)>,
}

impl ScriptedExit {
    pub fn new(reason: VmxReason) -> Self {
        Self {
            reason: reason as u64,
            ..Default::default()
        }
    }

    pub fn qualification(mut self, qualification: u64) -> Self {
        self.qualification = qualification;
        self
    }

    pub fn length(mut self, length: u64) -> Self {
        self.instruction_length = length;
        self
    }

    pub fn gpa(mut self, gpa: u64) -> Self {
        self.gpa = gpa;
        self
    }

    pub fn vectoring(mut self, info: u64, error: u64) -> Self {
        self.idt_vectoring = info;
        self.idt_vectoring_error = error;
        self
    }

    pub fn register(mut self, register: Register, value: u64) -> Self {
        self.registers.push((register, value));
        self
    }

    pub fn vmcs(mut self, field: Vmcs, value: u64) -> Self {
        self.vmcs.push((field, value));
        self
    }
}

/// A virtual CPU backed by maps. Unwritten registers and fields read as zero, capabilities allow
/// every control by default.
pub struct FakeVcpu {
    id: u32,
    pub registers: HashMap<Register, u64>,
    pub vmcs: HashMap<Vmcs, u64>,
    pub msrs: HashMap<u32, u64>,
    pub native_msrs: HashSet<u32>,
    pub capabilities: HashMap<VmxCapability, u64>,
    pub exits: VecDeque<ScriptedExit>,
    /// The interruption information of every event injected on entry.
    pub injected: Vec<u64>,
    pub runs: usize,
    pub tlb_invalidations: usize,
    pub flushes: usize,
}

impl FakeVcpu {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            registers: HashMap::new(),
            vmcs: HashMap::new(),
            msrs: HashMap::new(),
            native_msrs: HashSet::new(),
            capabilities: HashMap::new(),
            exits: VecDeque::new(),
            injected: vec![],
            runs: 0,
            tlb_invalidations: 0,
            flushes: 0,
        }
    }

    pub fn script(&mut self, exit: ScriptedExit) {
        self.exits.push_back(exit);
    }

    pub fn register(&self, register: Register) -> u64 {
        self.registers.get(&register).copied().unwrap_or(0)
    }

    pub fn field(&self, field: Vmcs) -> u64 {
        self.vmcs.get(&field).copied().unwrap_or(0)
    }
}

impl HypervisorVcpu for FakeVcpu {
    fn id(&self) -> u32 {
        self.id
    }

    fn read_register(&self, register: Register) -> Result<u64, Error> {
        Ok(self.register(register))
    }

    fn write_register(&mut self, register: Register, value: u64) -> Result<(), Error> {
        self.registers.insert(register, value);

        Ok(())
    }

    fn read_vmcs(&self, field: Vmcs) -> Result<u64, Error> {
        Ok(self.field(field))
    }

    fn write_vmcs(&mut self, field: Vmcs, value: u64) -> Result<(), Error> {
        self.vmcs.insert(field, value);

        Ok(())
    }

    fn read_msr(&self, msr: u32) -> Result<u64, Error> {
        Ok(self.msrs.get(&msr).copied().unwrap_or(0))
    }

    fn write_msr(&mut self, msr: u32, value: u64) -> Result<(), Error> {
        self.msrs.insert(msr, value);

        Ok(())
    }

    fn enable_native_msr(&mut self, msr: u32, enabled: bool) -> Result<(), Error> {
        if enabled {
            self.native_msrs.insert(msr);
        } else {
            self.native_msrs.remove(&msr);
        }

        Ok(())
    }

    fn read_capability(&self, capability: VmxCapability) -> Result<u64, Error> {
        Ok(self.capabilities.get(&capability).copied().unwrap_or(0xffff_ffff << 32))
    }

    fn run(&mut self) -> Result<(), Error> {
        let exit = self.exits.pop_front().ok_or(Error::HypervisorError(0xfae0_0004))?;

        self.runs += 1;

        let entry = self.field(Vmcs::EntryIntrInfo);

        if entry & INTR_INFO_VALID != 0 {
            self.injected.push(entry);
            self.vmcs.insert(Vmcs::EntryIntrInfo, entry & !INTR_INFO_VALID);
        }

        self.vmcs.insert(Vmcs::ExitReason, exit.reason);
        self.vmcs.insert(Vmcs::ExitQualification, exit.qualification);
        self.vmcs.insert(Vmcs::ExitInstructionLength, exit.instruction_length);
        self.vmcs.insert(Vmcs::GuestPhysicalAddress, exit.gpa);
        self.vmcs.insert(Vmcs::GuestLinearAddress, exit.linear);
        self.vmcs.insert(Vmcs::IdtVectoringInfo, exit.idt_vectoring);
        self.vmcs.insert(Vmcs::IdtVectoringError, exit.idt_vectoring_error);

        for (register, value) in exit.registers {
            self.registers.insert(register, value);
        }

        for (field, value) in exit.vmcs {
            self.vmcs.insert(field, value);
        }

        Ok(())
    }

    fn invalidate_tlb(&mut self) -> Result<(), Error> {
        self.tlb_invalidations += 1;

        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.flushes += 1;

        Ok(())
    }
}

#[derive(Default)]
struct BusState {
    mmio: HashMap<u64, u8>,
    mmio_reads: Vec<(u64, usize)>,
    mmio_writes: Vec<(u64, Vec<u8>)>,
    port_input: HashMap<u16, VecDeque<u8>>,
    port_writes: Vec<(u16, Vec<u8>)>,
    ram_faults: usize,
}

/// A bus that records every access. MMIO reads return previously written bytes or zero, port
/// reads return queued input or all ones.
#[derive(Default)]
pub struct RecordingBus {
    state: Mutex<BusState>,
}

impl RecordingBus {
    pub fn set_mmio(&self, gpa: u64, bytes: &[u8]) {
        let mut state = self.state.lock();

        for (offset, byte) in bytes.iter().enumerate() {
            state.mmio.insert(gpa + offset as u64, *byte);
        }
    }

    pub fn queue_input(&self, port: u16, bytes: &[u8]) {
        self.state
            .lock()
            .port_input
            .entry(port)
            .or_default()
            .extend(bytes.iter().copied());
    }

    pub fn mmio_reads(&self) -> Vec<(u64, usize)> {
        self.state.lock().mmio_reads.clone()
    }

    pub fn mmio_writes(&self) -> Vec<(u64, Vec<u8>)> {
        self.state.lock().mmio_writes.clone()
    }

    pub fn port_writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.state.lock().port_writes.clone()
    }

    pub fn ram_faults(&self) -> usize {
        self.state.lock().ram_faults
    }
}

impl IoBus for RecordingBus {
    fn pio_in(&self, port: u16, data: &mut [u8]) {
        let mut state = self.state.lock();
        let input = state.port_input.entry(port).or_default();

        for byte in data.iter_mut() {
            *byte = input.pop_front().unwrap_or(0xff);
        }
    }

    fn pio_out(&self, port: u16, data: &[u8]) {
        self.state.lock().port_writes.push((port, data.to_vec()));
    }

    fn mmio_read(&self, gpa: u64, data: &mut [u8]) {
        let mut state = self.state.lock();

        for (offset, byte) in data.iter_mut().enumerate() {
            *byte = state.mmio.get(&(gpa + offset as u64)).copied().unwrap_or(0);
        }

        state.mmio_reads.push((gpa, data.len()));
    }

    fn mmio_write(&self, gpa: u64, data: &[u8]) {
        let mut state = self.state.lock();

        for (offset, byte) in data.iter().enumerate() {
            state.mmio.insert(gpa + offset as u64, *byte);
        }

        state.mmio_writes.push((gpa, data.to_vec()));
    }

    fn ram_fault(&self, _hva: *mut u8, _size: usize) {
        self.state.lock().ram_faults += 1;
    }
}

#[derive(Default)]
struct ApicState {
    base: u64,
    tpr: u8,
    pending: BTreeSet<u8>,
    polls: usize,
    resets: usize,
}

/// A local APIC that delivers the highest pending vector whose priority class exceeds the TPR.
#[derive(Default)]
pub struct FakeApic {
    state: Mutex<ApicState>,
}

impl FakeApic {
    pub fn request(&self, vector: u8) {
        self.state.lock().pending.insert(vector);
    }

    pub fn polls(&self) -> usize {
        self.state.lock().polls
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }
}

impl Apic for FakeApic {
    fn base(&self) -> u64 {
        self.state.lock().base
    }

    fn set_base(&self, base: u64) {
        self.state.lock().base = base;
    }

    fn tpr(&self) -> u8 {
        self.state.lock().tpr
    }

    fn set_tpr(&self, tpr: u8) {
        self.state.lock().tpr = tpr;
    }

    fn highest_pending(&self) -> Option<u8> {
        self.state.lock().pending.iter().next_back().copied()
    }

    fn acknowledge(&self) -> Option<u8> {
        let mut state = self.state.lock();
        let vector = state.pending.iter().next_back().copied()?;

        if vector >> 4 <= state.tpr >> 4 {
            return None;
        }

        state.pending.remove(&vector);

        Some(vector)
    }

    fn poll(&self) {
        self.state.lock().polls += 1;
    }

    fn reset(&self) {
        let mut state = self.state.lock();

        state.pending.clear();
        state.tpr = 0;
        state.resets += 1;
    }
}
