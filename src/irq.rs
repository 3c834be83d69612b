//! This module provides interrupt delivery: the request flags that other threads raise against a
//! virtual CPU, the [`Apic`] seam to the local APIC model of the embedder, and the logic that
//! turns pending requests into VM-entry event injection.

use crate::arch::x86_64::*;
use crate::error::Error;
use crate::flags::RFlags;
use crate::hypervisor::{Hypervisor, HypervisorVcpu};
use crate::vmx::VmxExt;
use bitflags::bitflags;
use log::trace;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

bitflags! {
    /// The requests that can be raised against a virtual CPU.
    pub struct InterruptRequest: u32 {
        /// The interrupt controller has an interrupt pending.
        const HARD = 1 << 0;
        /// A non-maskable interrupt is pending.
        const NMI  = 1 << 1;
        /// An INIT IPI was received.
        const INIT = 1 << 2;
        /// A startup IPI was received.
        const SIPI = 1 << 3;
        /// The APIC must be polled for a new interrupt.
        const POLL = 1 << 4;
        /// The guest changed its task priority.
        const TPR  = 1 << 5;
        /// The virtual CPU must return to its caller.
        const EXIT = 1 << 6;
    }
}

/// The local APIC model of the embedder.
pub trait Apic: Send + Sync {
    /// The value of the IA32_APIC_BASE MSR.
    fn base(&self) -> u64;

    fn set_base(&self, base: u64);

    /// The task priority register in its 8-bit APIC format.
    fn tpr(&self) -> u8;

    fn set_tpr(&self, tpr: u8);

    /// The highest vector in the interrupt request register, regardless of the TPR.
    fn highest_pending(&self) -> Option<u8>;

    /// Accepts the highest-priority deliverable interrupt, moving it into service.
    fn acknowledge(&self) -> Option<u8>;

    /// Re-evaluates the pending interrupts after [`InterruptRequest::POLL`].
    fn poll(&self);

    /// Resets the APIC after an INIT.
    fn reset(&self);
}

/// The pending requests of a virtual CPU.
#[derive(Debug, Default)]
pub struct InterruptLine {
    requests: AtomicU32,
    sipi_vector: AtomicU8,
}

impl InterruptLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, request: InterruptRequest) {
        self.requests.fetch_or(request.bits(), Ordering::SeqCst);
    }

    pub fn clear(&self, request: InterruptRequest) {
        self.requests.fetch_and(!request.bits(), Ordering::SeqCst);
    }

    pub fn pending(&self) -> InterruptRequest {
        InterruptRequest::from_bits_truncate(self.requests.load(Ordering::SeqCst))
    }

    pub fn is_pending(&self, request: InterruptRequest) -> bool {
        self.pending().intersects(request)
    }

    /// Clears the requests and returns `true` if any of them was pending.
    pub fn take(&self, request: InterruptRequest) -> bool {
        self.requests.fetch_and(!request.bits(), Ordering::SeqCst) & request.bits() != 0
    }

    pub fn set_sipi_vector(&self, vector: u8) {
        self.sipi_vector.store(vector, Ordering::SeqCst);
    }

    pub fn sipi_vector(&self) -> u8 {
        self.sipi_vector.load(Ordering::SeqCst)
    }
}

/// A handle through which other threads raise requests against a virtual CPU and force it out of
/// the guest to notice them.
pub struct VcpuHandle<H: Hypervisor> {
    id: u32,
    line: Arc<InterruptLine>,
    hypervisor: Arc<H>,
}

impl<H: Hypervisor> Clone for VcpuHandle<H> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            line: self.line.clone(),
            hypervisor: self.hypervisor.clone(),
        }
    }
}

impl<H: Hypervisor> VcpuHandle<H> {
    pub(crate) fn new(id: u32, line: Arc<InterruptLine>, hypervisor: Arc<H>) -> Self {
        Self {
            id,
            line,
            hypervisor,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Raises the request and kicks the virtual CPU out of the guest.
    pub fn raise(&self, request: InterruptRequest) -> Result<(), Error> {
        self.line.raise(request);
        self.hypervisor.kick(&[self.id])
    }

    /// Withdraws a request, e.g. when the interrupt controller lowers its output.
    pub fn clear(&self, request: InterruptRequest) {
        self.line.clear(request);
    }

    /// Delivers a startup IPI with the given vector.
    pub fn startup(&self, vector: u8) -> Result<(), Error> {
        self.line.set_sipi_vector(vector);
        self.raise(InterruptRequest::SIPI)
    }
}

/// The interruption type of software events, which need the instruction length on re-injection.
fn is_software_event(info: u64) -> bool {
    matches!(
        info & INTR_INFO_TYPE_MASK,
        INTR_TYPE_SW_INTR | INTR_TYPE_PRIV_SW_EXCEPTION | INTR_TYPE_SW_EXCEPTION
    )
}

/// Re-injects the event whose delivery was interrupted by the last VM exit. Returns `true` if an
/// event was queued.
fn reinject_vectored_event<V: HypervisorVcpu>(vcpu: &mut V) -> Result<bool, Error> {
    let vectoring = vcpu.read_vmcs(Vmcs::IdtVectoringInfo)?;

    if vectoring & INTR_INFO_VALID == 0 {
        return Ok(false);
    }

    let vector = vectoring & INTR_INFO_VECTOR_MASK;
    let mut info = vectoring & (INTR_INFO_VALID | INTR_INFO_TYPE_MASK | INTR_INFO_VECTOR_MASK);

    // #BP and #OF are raised by int3 and into, which VM entry expects as software exceptions.
    if info & INTR_INFO_TYPE_MASK == INTR_TYPE_HW_EXCEPTION &&
        (vector == EXCEPTION_BP as u64 || vector == EXCEPTION_OF as u64) {
        info = (info & !INTR_INFO_TYPE_MASK) | INTR_TYPE_SW_EXCEPTION;
    }

    if vectoring & INTR_INFO_DELIVER_CODE != 0 {
        info |= INTR_INFO_DELIVER_CODE;
        let error = vcpu.read_vmcs(Vmcs::IdtVectoringError)?;
        vcpu.write_vmcs(Vmcs::EntryExceptionError, error)?;
    }

    if is_software_event(info) {
        let length = vcpu.read_vmcs(Vmcs::ExitInstructionLength)?;
        vcpu.write_vmcs(Vmcs::EntryInstructionLength, length)?;
    }

    trace!("vcpu {}: re-injecting vector {} ({:#x})", vcpu.id(), vector, info);

    vcpu.write_vmcs(Vmcs::EntryIntrInfo, info)?;

    Ok(true)
}

/// Queues the highest-priority pending event for injection on the next VM entry, and requests
/// interrupt- or NMI-window exiting for events that cannot be delivered yet. The event that was
/// being delivered when the last VM exit occurred goes first, unless `reinject` is false because
/// the exit handler completed its delivery, as for a task switch through a task gate.
pub fn inject_interrupts<V: HypervisorVcpu>(
    vcpu: &mut V,
    line: &InterruptLine,
    apic: &dyn Apic,
    reinject: bool,
) -> Result<(), Error> {
    if reinject && !vcpu.event_pending()? {
        reinject_vectored_event(vcpu)?;
    }

    if line.is_pending(InterruptRequest::NMI) {
        if !vcpu.event_pending()? && !vcpu.nmi_blocked()? {
            line.clear(InterruptRequest::NMI);

            trace!("vcpu {}: injecting NMI", vcpu.id());

            vcpu.write_vmcs(
                Vmcs::EntryIntrInfo,
                INTR_INFO_VALID | INTR_TYPE_NMI | EXCEPTION_NMI as u64,
            )?;
        } else {
            vcpu.set_nmi_window(true)?;
        }
    }

    let interruptibility = vcpu.read_vmcs(Vmcs::GuestInterruptibility)?;
    let shadowed = interruptibility & (INTERRUPTIBILITY_STI | INTERRUPTIBILITY_MOVSS) != 0;
    let rflags = vcpu.read_register(Register::Rflags)?;

    if line.is_pending(InterruptRequest::HARD) &&
        rflags & RFlags::IF.bits() != 0 &&
        !shadowed &&
        !vcpu.event_pending()? {
        line.clear(InterruptRequest::HARD);

        if let Some(vector) = apic.acknowledge() {
            trace!("vcpu {}: injecting interrupt {:#x}", vcpu.id(), vector);

            vcpu.write_vmcs(
                Vmcs::EntryIntrInfo,
                INTR_INFO_VALID | INTR_TYPE_EXT_INTR | vector as u64,
            )?;
        }

        if apic.highest_pending().is_some() {
            line.raise(InterruptRequest::HARD);
        }
    }

    if line.is_pending(InterruptRequest::HARD) {
        vcpu.set_interrupt_window(true)?;
    }

    Ok(())
}

/// Copies the TPR of the APIC into the hardware and programs the TPR threshold from the highest
/// pending interrupt, so that lowering the TPR below it causes a VM exit.
pub fn sync_tpr_to_hardware<V: HypervisorVcpu>(vcpu: &mut V, apic: &dyn Apic) -> Result<(), Error> {
    vcpu.write_register(Register::Tpr, apic.tpr() as u64)?;

    let threshold = match apic.highest_pending() {
        Some(vector) => (vector >> 4) as u64,
        _ => 0,
    };

    vcpu.write_vmcs(Vmcs::TprThreshold, threshold)
}

/// Copies the TPR written by the guest back into the APIC. Returns `true` if it changed.
pub fn sync_tpr_from_hardware<V: HypervisorVcpu>(vcpu: &V, apic: &dyn Apic) -> Result<bool, Error> {
    let tpr = vcpu.read_register(Register::Tpr)? as u8;

    if tpr == apic.tpr() {
        return Ok(false);
    }

    apic.set_tpr(tpr);

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeApic, FakeVcpu};

    fn interruptible_vcpu() -> FakeVcpu {
        let mut vcpu = FakeVcpu::new(0);

        vcpu.write_register(Register::Rflags, RFlags::IF.bits() | RFlags::FIXED.bits()).unwrap();
        vcpu
    }

    #[test]
    fn take_clears_only_the_requested_bits() {
        let line = InterruptLine::new();

        line.raise(InterruptRequest::HARD | InterruptRequest::POLL);

        assert!(line.take(InterruptRequest::POLL));
        assert!(!line.take(InterruptRequest::POLL));
        assert_eq!(line.pending(), InterruptRequest::HARD);
    }

    #[test]
    fn hard_interrupt_is_injected_when_interruptible() {
        let mut vcpu = interruptible_vcpu();
        let line = InterruptLine::new();
        let apic = FakeApic::default();

        apic.request(0x31);
        line.raise(InterruptRequest::HARD);

        inject_interrupts(&mut vcpu, &line, &apic, true).unwrap();

        assert_eq!(vcpu.field(Vmcs::EntryIntrInfo), INTR_INFO_VALID | 0x31);
        assert!(!line.is_pending(InterruptRequest::HARD));
        assert_eq!(vcpu.field(Vmcs::CpuBased) & CpuBased::IRQ_WND.bits() as u64, 0);
    }

    #[test]
    fn interrupt_shadow_requests_a_window() {
        let mut vcpu = interruptible_vcpu();
        let line = InterruptLine::new();
        let apic = FakeApic::default();

        vcpu.write_vmcs(Vmcs::GuestInterruptibility, INTERRUPTIBILITY_STI).unwrap();
        apic.request(0x31);
        line.raise(InterruptRequest::HARD);

        inject_interrupts(&mut vcpu, &line, &apic, true).unwrap();

        assert_eq!(vcpu.field(Vmcs::EntryIntrInfo) & INTR_INFO_VALID, 0);
        assert_ne!(vcpu.field(Vmcs::CpuBased) & CpuBased::IRQ_WND.bits() as u64, 0);
        assert!(line.is_pending(InterruptRequest::HARD));
    }

    #[test]
    fn blocked_nmi_requests_a_window() {
        let mut vcpu = interruptible_vcpu();
        let line = InterruptLine::new();
        let apic = FakeApic::default();

        line.raise(InterruptRequest::NMI);
        vcpu.write_vmcs(Vmcs::GuestInterruptibility, INTERRUPTIBILITY_NMI).unwrap();

        inject_interrupts(&mut vcpu, &line, &apic, true).unwrap();
        assert_ne!(vcpu.field(Vmcs::CpuBased) & CpuBased::VIRTUAL_NMI_WND.bits() as u64, 0);
        assert!(line.is_pending(InterruptRequest::NMI));

        vcpu.write_vmcs(Vmcs::GuestInterruptibility, 0).unwrap();

        inject_interrupts(&mut vcpu, &line, &apic, true).unwrap();
        assert_eq!(vcpu.field(Vmcs::EntryIntrInfo), INTR_INFO_VALID | INTR_TYPE_NMI | 2);
        assert!(!line.is_pending(InterruptRequest::NMI));
    }

    #[test]
    fn vectored_events_are_reinjected_first() {
        let mut vcpu = interruptible_vcpu();
        let line = InterruptLine::new();
        let apic = FakeApic::default();

        // A #PF with error code 2 whose delivery hit an EPT violation.
        vcpu.write_vmcs(
            Vmcs::IdtVectoringInfo,
            INTR_INFO_VALID | INTR_TYPE_HW_EXCEPTION | INTR_INFO_DELIVER_CODE | 14,
        ).unwrap();
        vcpu.write_vmcs(Vmcs::IdtVectoringError, 2).unwrap();

        apic.request(0x40);
        line.raise(InterruptRequest::HARD);

        inject_interrupts(&mut vcpu, &line, &apic, true).unwrap();

        assert_eq!(
            vcpu.field(Vmcs::EntryIntrInfo),
            INTR_INFO_VALID | INTR_TYPE_HW_EXCEPTION | INTR_INFO_DELIVER_CODE | 14
        );
        assert_eq!(vcpu.field(Vmcs::EntryExceptionError), 2);
        // The interrupt waits for the next window.
        assert!(line.is_pending(InterruptRequest::HARD));
        assert_eq!(apic.highest_pending(), Some(0x40));
    }

    #[test]
    fn breakpoints_are_reinjected_as_software_exceptions() {
        let mut vcpu = interruptible_vcpu();

        vcpu.write_vmcs(Vmcs::IdtVectoringInfo, INTR_INFO_VALID | INTR_TYPE_HW_EXCEPTION | 3).unwrap();
        vcpu.write_vmcs(Vmcs::ExitInstructionLength, 1).unwrap();

        inject_interrupts(&mut vcpu, &InterruptLine::new(), &FakeApic::default(), true).unwrap();

        assert_eq!(vcpu.field(Vmcs::EntryIntrInfo), INTR_INFO_VALID | INTR_TYPE_SW_EXCEPTION | 3);
        assert_eq!(vcpu.field(Vmcs::EntryInstructionLength), 1);
    }

    #[test]
    fn completed_deliveries_are_not_reinjected() {
        let mut vcpu = interruptible_vcpu();

        vcpu.write_vmcs(Vmcs::IdtVectoringInfo, INTR_INFO_VALID | INTR_TYPE_EXT_INTR | 0x30).unwrap();

        inject_interrupts(&mut vcpu, &InterruptLine::new(), &FakeApic::default(), false).unwrap();

        assert_eq!(vcpu.field(Vmcs::EntryIntrInfo) & INTR_INFO_VALID, 0);
    }

    #[test]
    fn tpr_threshold_follows_the_highest_pending_vector() {
        let mut vcpu = FakeVcpu::new(0);
        let apic = FakeApic::default();

        apic.set_tpr(0x20);
        apic.request(0x51);

        sync_tpr_to_hardware(&mut vcpu, &apic).unwrap();

        assert_eq!(vcpu.register(Register::Tpr), 0x20);
        assert_eq!(vcpu.field(Vmcs::TprThreshold), 5);

        vcpu.write_register(Register::Tpr, 0x60).unwrap();
        assert!(sync_tpr_from_hardware(&vcpu, &apic).unwrap());
        assert_eq!(apic.tpr(), 0x60);
        assert!(!sync_tpr_from_hardware(&vcpu, &apic).unwrap());
    }
}
