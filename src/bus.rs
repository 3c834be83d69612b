//! This module provides the [`IoBus`] trait, through which the virtualization core forwards port
//! I/O and MMIO accesses of the guest to the device models of the embedder.

/// The address-space dispatcher of the embedder. Accesses are synchronous: when a call returns the
/// device model has consumed the written data or filled in the read data.
pub trait IoBus: Send + Sync {
    /// Reads `data.len()` bytes from the I/O port.
    fn pio_in(&self, port: u16, data: &mut [u8]);

    /// Writes the bytes to the I/O port.
    fn pio_out(&self, port: u16, data: &[u8]);

    /// Reads `data.len()` bytes from the device mapped at the guest physical address.
    fn mmio_read(&self, gpa: u64, data: &mut [u8]);

    /// Writes the bytes to the device mapped at the guest physical address.
    fn mmio_write(&self, gpa: u64, data: &[u8]);

    /// Called when the guest touched RAM that is registered but may not have been populated yet,
    /// e.g. because it is loaded lazily from a snapshot.
    fn ram_fault(&self, _hva: *mut u8, _size: usize) {}
}

/// A bus without any devices: reads return all ones and writes are discarded.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullBus;

impl IoBus for NullBus {
    fn pio_in(&self, _port: u16, data: &mut [u8]) {
        data.iter_mut().for_each(|byte| *byte = 0xff);
    }

    fn pio_out(&self, _port: u16, _data: &[u8]) {}

    fn mmio_read(&self, _gpa: u64, data: &mut [u8]) {
        data.iter_mut().for_each(|byte| *byte = 0xff);
    }

    fn mmio_write(&self, _gpa: u64, _data: &[u8]) {}
}
