//! This module provides an `Error` type for the crate using the [`thiserror`] crate.
use crate::decode::DecodeError;
use thiserror::Error;

/// The `Error` type.
#[derive(Debug, Error)]
pub enum Error {
    /// The hardware virtualization facility returned a status code other than success.
    #[error("hypervisor call failed with status {0:#x}")]
    HypervisorError(u32),
    /// Every slot in the memory slot table is in use.
    #[error("no free memory slot for {gpa:#x}+{size:#x}")]
    SlotTableFull { gpa: u64, size: u64 },
    /// A region was registered on top of a slot that it does not exactly replace.
    #[error("region {gpa:#x}+{size:#x} overlaps slot {slot} ({slot_gpa:#x}+{slot_size:#x})")]
    OverlappingSlot {
        gpa: u64,
        size: u64,
        slot: usize,
        slot_gpa: u64,
        slot_size: u64,
    },
    /// A guest physical range wraps around the end of the address space.
    #[error("region {gpa:#x}+{size:#x} wraps around the address space")]
    InvalidRegion { gpa: u64, size: u64 },
    /// An unmap request only partially covered an existing slot.
    #[error("unmap of {gpa:#x}+{size:#x} does not match slot {slot_gpa:#x}+{slot_size:#x}")]
    UnmatchedUnmap {
        gpa: u64,
        size: u64,
        slot_gpa: u64,
        slot_size: u64,
    },
    /// The guest address is not backed by any slot.
    #[error("guest physical address {0:#x} is not mapped")]
    InvalidGuestAddress(u64),
    /// An EPT fault hit an address that is neither RAM nor an emulatable MMIO access.
    #[error("EPT fault at {gpa:#x} (qualification {qualification:#x}) outside any slot")]
    UnmappedEptFault { gpa: u64, qualification: u64 },
    /// A control-register access exit for a register that is not virtualized.
    #[error("unhandled access to CR{0}")]
    UnhandledControlRegister(u8),
    /// VM entry failed; the guest state is inconsistent with the VMX checks.
    #[error("VM entry failed with reason {0:#x}")]
    EntryFailure(u32),
    /// The instruction could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The guest page tables do not map the linear address.
    #[error("guest page fault at {linear:#x} (error code {code:#x})")]
    PageFault { linear: u64, code: u32 },
    /// The guest references a descriptor outside its descriptor table.
    #[error("selector {0:#x} is outside the descriptor table")]
    InvalidSelector(u16),
    /// Wraps [`mmap_rs::error::Error`].
    #[error(transparent)]
    Mmap(#[from] mmap_rs::error::Error),
}

impl Error {
    /// Returns `true` if the error reflects a broken invariant in the surrounding system, i.e. the
    /// embedder is expected to log it and terminate rather than keep running the guest.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Decode(_) | Error::PageFault { .. } | Error::InvalidSelector(_)
        )
    }
}
