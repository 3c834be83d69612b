//! The hvx crate provides the CPU virtualization core of a hosted x86-64 hypervisor built on top
//! of a hardware virtualization facility that exposes VT-x directly, such as Apple's [Hypervisor
//! Framework](https://developer.apple.com/documentation/hypervisor/).
//!
//! The facility only runs the guest until the next VM exit. This crate supplies the rest:
//!  * The loop that enters the guest and dispatches every VM exit ([`Vcpu::run`]).
//!  * An x86 instruction decoder and emulator for accesses the hardware cannot complete, such as
//!    MMIO and string port I/O ([`emulate`]).
//!  * The memory slot table that maps guest physical memory ([`memory`]).
//!  * The virtual CPUID and MSRs ([`cpuid`], [`msr`]), hardware task switching ([`task`]) and
//!    interrupt delivery ([`irq`]).
//!
//! The facility itself is abstracted by the [`Hypervisor`] and [`HypervisorVcpu`] traits. Device
//! models plug in through the [`IoBus`] and [`irq::Apic`] traits.

pub mod arch;
pub mod bus;
pub mod cpuid;
pub mod decode;
pub mod descriptor;
pub mod emulate;
pub mod error;
pub mod exit;
pub mod flags;
pub mod hypervisor;
pub mod irq;
pub mod memory;
pub mod mmu;
pub mod msr;
pub mod os_impl;
pub mod state;
pub mod task;
pub mod vcpu;
pub mod vm;
pub mod vmx;

#[cfg(test)]
mod test_util;

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub use os_impl::macos::{MacHypervisor, MacVcpu};

pub use bus::{IoBus, NullBus};
pub use cpuid::CpuidModel;
pub use error::Error;
pub use exit::VcpuExit;
pub use hypervisor::{Hypervisor, HypervisorVcpu};
pub use irq::{Apic, InterruptRequest, VcpuHandle};
pub use msr::UnknownMsrPolicy;
pub use state::VcpuState;
pub use vm::{ProtectionFlags, Vm, VmBuilder};
pub use vcpu::Vcpu;
