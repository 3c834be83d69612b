//! This module provides the CPUID model presented to the guest: the host leaves, filtered through
//! the features the virtual CPU can support and patched with the topology of the virtual machine.

use crate::arch::x86_64::{host_cpuid, CR4_OSXSAVE};
use std::collections::HashMap;

/// The highest basic leaf exposed to the guest.
const MAX_BASIC_LEAF: u32 = 0xd;
const EXTENDED_BASE: u32 = 0x8000_0000;
/// The highest extended leaf exposed to the guest.
const MAX_EXTENDED_LEAF: u32 = 0x8000_0008;

const EAX: usize = 0;
const EBX: usize = 1;
const ECX: usize = 2;
const EDX: usize = 3;

const LEAF1_ECX_MONITOR: u32 = 1 << 3;
const LEAF1_ECX_VMX: u32 = 1 << 5;
const LEAF1_ECX_SMX: u32 = 1 << 6;
const LEAF1_ECX_OSXSAVE: u32 = 1 << 27;
const LEAF1_ECX_HYPERVISOR: u32 = 1 << 31;
const LEAF1_EDX_HTT: u32 = 1 << 28;

/// AVX-512 state is not saved and restored for the guest, so none of its features may leak.
const LEAF7_EBX_DENIED: u32 = (1 << 16) | (1 << 17) | (1 << 21) | (1 << 26) | (1 << 27) |
    (1 << 28) | (1 << 30) | (1 << 31);
const LEAF7_ECX_DENIED: u32 = (1 << 1) | (1 << 6) | (1 << 11) | (1 << 12) | (1 << 14);
const LEAF7_EDX_DENIED: u32 = (1 << 2) | (1 << 3) | (1 << 8);

/// The XSAVE components supported by the guest: x87, SSE and AVX.
const XCR0_SUPPORTED: u32 = 0x7;

/// A provider of raw CPUID results.
pub trait CpuidSource: Send + Sync {
    fn query(&self, leaf: u32, subleaf: u32) -> [u32; 4];
}

/// Executes `cpuid` on the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostCpuid;

impl CpuidSource for HostCpuid {
    fn query(&self, leaf: u32, subleaf: u32) -> [u32; 4] {
        host_cpuid(leaf, subleaf)
    }
}

/// The CPUID leaves as seen by the guest.
pub struct CpuidModel {
    source: Box<dyn CpuidSource>,
    vendor: Option<[u8; 12]>,
    vcpu_count: u32,
    allow: HashMap<u32, [u32; 4]>,
    deny: HashMap<u32, [u32; 4]>,
}

impl Default for CpuidModel {
    fn default() -> Self {
        Self::new(Box::new(HostCpuid))
    }
}

impl CpuidModel {
    pub fn new(source: Box<dyn CpuidSource>) -> Self {
        Self {
            source,
            vendor: None,
            vcpu_count: 1,
            allow: HashMap::new(),
            deny: HashMap::new(),
        }
    }

    /// Overrides the vendor string of leaf 0.
    pub fn with_vendor(mut self, vendor: &[u8; 12]) -> Self {
        self.vendor = Some(*vendor);
        self
    }

    /// Sets the number of logical processors reported in the topology leaves.
    pub fn with_vcpu_count(mut self, vcpu_count: u32) -> Self {
        self.vcpu_count = vcpu_count.max(1);
        self
    }

    /// Restricts the registers of `leaf` to the given bits, on top of the built-in policy.
    pub fn allow(mut self, leaf: u32, registers: [u32; 4]) -> Self {
        self.allow.insert(leaf, registers);
        self
    }

    /// Hides the given bits of `leaf` from the guest, on top of the built-in policy.
    pub fn deny(mut self, leaf: u32, registers: [u32; 4]) -> Self {
        let entry = self.deny.entry(leaf).or_insert([0; 4]);

        for (denied, bits) in entry.iter_mut().zip(registers.iter()) {
            *denied |= bits;
        }

        self
    }

    pub fn vcpu_count(&self) -> u32 {
        self.vcpu_count
    }

    /// The number of bits needed to encode the logical processor ids.
    fn id_bits(&self) -> u32 {
        32 - (self.vcpu_count - 1).leading_zeros()
    }

    /// Returns the leaf as the virtual CPU `vcpu` with the given CR4 sees it.
    pub fn cpuid(&self, vcpu: u32, cr4: u64, leaf: u32, subleaf: u32) -> [u32; 4] {
        let supported = if leaf < EXTENDED_BASE {
            leaf <= MAX_BASIC_LEAF
        } else {
            leaf <= MAX_EXTENDED_LEAF
        };

        // Unsupported leaves read as zero.
        if !supported {
            return [0; 4];
        }

        let mut registers = self.source.query(leaf, subleaf);

        match leaf {
            0 => {
                registers[EAX] = registers[EAX].min(MAX_BASIC_LEAF);

                if let Some(vendor) = self.vendor {
                    registers[EBX] = u32::from_le_bytes([vendor[0], vendor[1], vendor[2], vendor[3]]);
                    registers[EDX] = u32::from_le_bytes([vendor[4], vendor[5], vendor[6], vendor[7]]);
                    registers[ECX] = u32::from_le_bytes([vendor[8], vendor[9], vendor[10], vendor[11]]);
                }
            }
            1 => {
                // The initial APIC id and the logical processor count.
                registers[EBX] = (registers[EBX] & 0xffff) |
                    ((self.vcpu_count & 0xff) << 16) |
                    ((vcpu & 0xff) << 24);

                registers[ECX] &= !(LEAF1_ECX_MONITOR | LEAF1_ECX_VMX | LEAF1_ECX_SMX | LEAF1_ECX_OSXSAVE);
                registers[ECX] |= LEAF1_ECX_HYPERVISOR;

                if cr4 & CR4_OSXSAVE != 0 {
                    registers[ECX] |= LEAF1_ECX_OSXSAVE;
                }

                if self.vcpu_count > 1 {
                    registers[EDX] |= LEAF1_EDX_HTT;
                } else {
                    registers[EDX] &= !LEAF1_EDX_HTT;
                }
            }
            4 => {
                // Cores per package, only for valid cache descriptors.
                if registers[EAX] & 0x1f != 0 {
                    registers[EAX] = (registers[EAX] & 0x3ff_ffff) | ((self.vcpu_count - 1) << 26);
                }
            }
            5 => registers = [0; 4],
            7 if subleaf == 0 => {
                registers[EBX] &= !LEAF7_EBX_DENIED;
                registers[ECX] &= !LEAF7_ECX_DENIED;
                registers[EDX] &= !LEAF7_EDX_DENIED;
            }
            7 => registers = [0; 4],
            0xb => {
                registers = match subleaf {
                    0 => [0, 1, 0x100, vcpu],
                    1 => [self.id_bits(), self.vcpu_count, 0x201, vcpu],
                    _ => [0, 0, subleaf & 0xff, vcpu],
                };
            }
            0xd if subleaf == 0 => {
                registers[EAX] &= XCR0_SUPPORTED;
                registers[EDX] = 0;
            }
            0xd if subleaf == 1 => {
                // XSAVEOPT only; XSAVEC and XSAVES need state the guest does not have.
                registers[EAX] &= 0x1;
                registers[EBX] = 0;
                registers[ECX] = 0;
                registers[EDX] = 0;
            }
            0xd if subleaf >= 2 && XCR0_SUPPORTED.checked_shr(subleaf).unwrap_or(0) & 1 == 0 => {
                registers = [0; 4]
            }
            0x8000_0000 => registers[EAX] = registers[EAX].min(MAX_EXTENDED_LEAF),
            _ => (),
        }

        if let Some(allow) = self.allow.get(&leaf) {
            for (register, bits) in registers.iter_mut().zip(allow.iter()) {
                *register &= bits;
            }
        }

        if let Some(deny) = self.deny.get(&leaf) {
            for (register, bits) in registers.iter_mut().zip(deny.iter()) {
                *register &= !bits;
            }
        }

        registers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// A processor that reports every feature.
    struct EverythingCpuid;

    impl CpuidSource for EverythingCpuid {
        fn query(&self, _leaf: u32, _subleaf: u32) -> [u32; 4] {
            [u32::MAX; 4]
        }
    }

    fn model() -> CpuidModel {
        CpuidModel::new(Box::new(EverythingCpuid))
    }

    #[test]
    fn avx512_never_leaks() {
        let model = model();

        let leaf1 = model.cpuid(0, 0, 1, 0);
        let leaf7 = model.cpuid(0, 0, 7, 0);

        assert_eq!(leaf1[ECX] & LEAF1_ECX_VMX, 0);
        assert_eq!(leaf7[EBX] & (1 << 16), 0);
        assert_eq!(leaf7[EBX] & LEAF7_EBX_DENIED, 0);
        assert_eq!(leaf7[ECX] & LEAF7_ECX_DENIED, 0);
    }

    #[test]
    fn topology_reflects_the_virtual_machine() {
        let model = model().with_vcpu_count(4);

        let leaf1 = model.cpuid(2, 0, 1, 0);
        assert_eq!(leaf1[EBX] >> 24, 2);
        assert_eq!((leaf1[EBX] >> 16) & 0xff, 4);
        assert_ne!(leaf1[EDX] & LEAF1_EDX_HTT, 0);
        assert_ne!(leaf1[ECX] & LEAF1_ECX_HYPERVISOR, 0);

        assert_eq!(model.cpuid(3, 0, 0xb, 1), [2, 4, 0x201, 3]);
        assert_eq!(model.cpuid(1, 0, 4, 0)[EAX] >> 26, 3);
    }

    #[test]
    fn osxsave_follows_cr4() {
        let model = model();

        assert_eq!(model.cpuid(0, 0, 1, 0)[ECX] & LEAF1_ECX_OSXSAVE, 0);
        assert_ne!(model.cpuid(0, CR4_OSXSAVE, 1, 0)[ECX] & LEAF1_ECX_OSXSAVE, 0);
    }

    #[test]
    fn vendor_override_and_leaf_limits() {
        let model = model().with_vendor(b"GenuineIntel");

        assert_eq!(model.cpuid(0, 0, 0, 0), [MAX_BASIC_LEAF, 0x756e_6547, 0x6c65_746e, 0x4965_6e69]);
        assert_eq!(model.cpuid(0, 0, 0x4000_0000, 0), [0; 4]);
        assert_eq!(model.cpuid(0, 0, 0x8000_0000, 0)[EAX], MAX_EXTENDED_LEAF);
        assert_eq!(model.cpuid(0, 0, 0x8000_0009, 0), [0; 4]);
    }

    #[test]
    fn configured_masks_apply_last() {
        let model = model()
            .allow(0x8000_0001, [u32::MAX, u32::MAX, 0xff, u32::MAX])
            .deny(0x8000_0001, [0, 0, 0, 1 << 27]);

        let leaf = model.cpuid(0, 0, 0x8000_0001, 0);

        assert_eq!(leaf[ECX], 0xff);
        assert_eq!(leaf[EDX] & (1 << 27), 0);
    }

    proptest! {
        #[test]
        fn denied_features_never_leak(leaf in 0u32..0x20, subleaf in 0u32..4) {
            let leaf7 = model().cpuid(0, u64::MAX, leaf, subleaf);

            if leaf == 7 {
                prop_assert_eq!(leaf7[EBX] & LEAF7_EBX_DENIED, 0);
                prop_assert_eq!(leaf7[ECX] & LEAF7_ECX_DENIED, 0);
            }

            if leaf > MAX_BASIC_LEAF {
                prop_assert_eq!(leaf7, [0; 4]);
            }
        }
    }
}
