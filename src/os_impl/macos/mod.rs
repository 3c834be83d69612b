pub mod bindings;
pub mod hypervisor;
pub mod vcpu;

pub use hypervisor::MacHypervisor;
pub use vcpu::MacVcpu;
