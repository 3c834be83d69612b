use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Hypervisor(#[from] hvx::Error),
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
mod demo {
    use super::Error;
    use hvx::{Apic, IoBus, MacHypervisor, ProtectionFlags, VmBuilder};
    use log::info;
    use std::sync::Arc;

    /// Prints the bytes written to the Bochs debug port.
    struct DebugPort;

    impl IoBus for DebugPort {
        fn pio_in(&self, _port: u16, data: &mut [u8]) {
            data.iter_mut().for_each(|byte| *byte = 0xff);
        }

        fn pio_out(&self, port: u16, data: &[u8]) {
            if port == 0xe9 {
                print!("{}", String::from_utf8_lossy(data));
            }
        }

        fn mmio_read(&self, _gpa: u64, data: &mut [u8]) {
            data.iter_mut().for_each(|byte| *byte = 0xff);
        }

        fn mmio_write(&self, _gpa: u64, _data: &[u8]) {}
    }

    /// A local APIC that never has anything pending.
    #[derive(Default)]
    struct QuietApic;

    impl Apic for QuietApic {
        fn base(&self) -> u64 { 0xfee0_0900 }
        fn set_base(&self, _base: u64) {}
        fn tpr(&self) -> u8 { 0 }
        fn set_tpr(&self, _tpr: u8) {}
        fn highest_pending(&self) -> Option<u8> { None }
        fn acknowledge(&self) -> Option<u8> { None }
        fn poll(&self) {}
        fn reset(&self) {}
    }

    pub fn run() -> Result<(), Error> {
        env_logger::init();

        // Access the Hypervisor Framework and build a VM with a single vCPU.
        let vm = VmBuilder::new(MacHypervisor::new()?)
            .with_vcpu_count(1)
            .with_bus(Arc::new(DebugPort))
            .build()?;

        // The vCPU starts executing at 0xffff_fff0, so back the top 64 kiB of the 32-bit address
        // space with RAM.
        vm.allocate_ram(0xffff_0000, 0x10000, ProtectionFlags::all())?;

        // mov al, 'h'; out 0xe9, al; mov al, 'i'; out 0xe9, al; hlt
        vm.write_physical(0xffff_fff0, &[0xb0, b'h', 0xe6, 0xe9, 0xb0, b'i', 0xe6, 0xe9, 0xf4]);

        // The vCPU is bound to the thread that creates it.
        let (mut vcpu, _handle) = vm.create_vcpu(Arc::new(QuietApic))?;

        // Run the vCPU. The VM lock is released while the guest executes.
        let mut guard = vm.lock();
        let exit = vcpu.run(&mut guard)?;

        println!();
        info!("vcpu {} exited: {:?}", vcpu.id(), exit);

        Ok(())
    }
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
fn main() -> Result<(), Error> {
    demo::run()
}

#[cfg(not(all(target_os = "macos", target_arch = "x86_64")))]
fn main() -> Result<(), Error> {
    eprintln!("this demo requires the Hypervisor Framework on an x86-64 Mac");

    Ok(())
}
