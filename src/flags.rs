//! This module provides the lazy flags engine used by the instruction emulator.
//!
//! Rather than computing the six arithmetic flags after every emulated instruction, the engine
//! records the sign-extended result of the last operation along with a word of auxiliary bits:
//!
//! | bit(s) | meaning                                            |
//! |--------|----------------------------------------------------|
//! | 63     | carry flag                                         |
//! | 62     | carry out of the bit below the sign bit, i.e. CF^OF|
//! | 8..=15 | parity delta, XORed into the low byte of `result`  |
//! | 3      | auxiliary carry                                    |
//! | 0      | sign delta, XORed into bit 63 of `result`          |
//!
//! The zero, sign and parity flags are derived from `result` on demand, the parity and sign
//! deltas exist so that those flags can be set explicitly without having to fabricate a matching
//! result.

use bitflags::bitflags;

bitflags! {
    /// The bits of the RFLAGS register.
    pub struct RFlags: u64 {
        const CF    = 1 << 0;
        const FIXED = 1 << 1;
        const PF    = 1 << 2;
        const AF    = 1 << 4;
        const ZF    = 1 << 6;
        const SF    = 1 << 7;
        const TF    = 1 << 8;
        const IF    = 1 << 9;
        const DF    = 1 << 10;
        const OF    = 1 << 11;
        const IOPL  = 3 << 12;
        const NT    = 1 << 14;
        const RF    = 1 << 16;
        const VM    = 1 << 17;
        const AC    = 1 << 18;
        const VIF   = 1 << 19;
        const VIP   = 1 << 20;
        const ID    = 1 << 21;

        /// The flags that are tracked lazily.
        const ARITHMETIC = Self::CF.bits | Self::PF.bits | Self::AF.bits | Self::ZF.bits |
            Self::SF.bits | Self::OF.bits;
    }
}

const LF_BIT_SD: u32 = 0;
const LF_BIT_AF: u32 = 3;
const LF_BIT_PDB: u32 = 8;
const LF_BIT_PO: u32 = 62;
const LF_BIT_CF: u32 = 63;

const LF_MASK_SD: u64 = 1 << LF_BIT_SD;
const LF_MASK_AF: u64 = 1 << LF_BIT_AF;
const LF_MASK_PO: u64 = 1 << LF_BIT_PO;
const LF_MASK_CF: u64 = 1 << LF_BIT_CF;

/// Bit `n` of this constant is set if the nibble `n` has even parity.
const PARITY_LOOKUP: u16 = 0x9669;

/// The width of an operand or address in bytes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Width {
    Byte = 1,
    Word = 2,
    Dword = 4,
    Qword = 8,
}

impl Width {
    /// Converts a size in bytes into a width.
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(Width::Byte),
            2 => Some(Width::Word),
            4 => Some(Width::Dword),
            8 => Some(Width::Qword),
            _ => None,
        }
    }

    /// The width in bytes.
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// The width in bits.
    pub fn bits(self) -> u32 {
        (self as u32) * 8
    }

    /// The mask that selects the bits of a value of this width.
    pub fn mask(self) -> u64 {
        match self {
            Width::Qword => u64::MAX,
            width => (1u64 << width.bits()) - 1,
        }
    }

    /// The most significant bit of a value of this width.
    pub fn sign_bit(self) -> u64 {
        1u64 << (self.bits() - 1)
    }

    /// Truncates the value to this width.
    pub fn truncate(self, value: u64) -> u64 {
        value & self.mask()
    }

    /// Sign-extends a value of this width to 64 bits.
    pub fn sign_extend(self, value: u64) -> u64 {
        let shift = 64 - self.bits();

        (((value << shift) as i64) >> shift) as u64
    }

    /// Returns `true` if the sign bit of the value is set.
    pub fn is_negative(self, value: u64) -> bool {
        value & self.sign_bit() != 0
    }
}

/// Computes the carry out of every bit position of `a + b = result`.
fn add_carries(a: u64, b: u64, result: u64) -> u64 {
    (a & b) | ((a | b) & !result)
}

/// Computes the borrow out of every bit position of `a - b = result`.
fn sub_borrows(a: u64, b: u64, result: u64) -> u64 {
    (!a & b) | ((!a ^ b) & result)
}

/// The lazily evaluated arithmetic flags.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LazyFlags {
    /// The sign-extended result of the last flag-setting operation.
    pub result: u64,
    /// The packed auxiliary bits, see the module documentation for the layout.
    pub auxbits: u64,
}

impl LazyFlags {
    /// Builds the lazy representation of the arithmetic flags held in `rflags`.
    pub fn from_rflags(rflags: u64) -> Self {
        let mut flags = Self::default();
        flags.load_rflags(rflags);
        flags
    }

    /// Loads the arithmetic flags from a flat RFLAGS value.
    pub fn load_rflags(&mut self, rflags: u64) {
        let rflags = RFlags::from_bits_truncate(rflags);
        let cf = rflags.contains(RFlags::CF) as u64;
        let of = rflags.contains(RFlags::OF) as u64;

        self.result = if rflags.contains(RFlags::ZF) { 0 } else { 1 << 8 };
        self.auxbits = (cf << LF_BIT_CF) | ((cf ^ of) << LF_BIT_PO);

        if rflags.contains(RFlags::AF) {
            self.auxbits |= LF_MASK_AF;
        }

        if rflags.contains(RFlags::SF) {
            self.auxbits |= LF_MASK_SD;
        }

        // With a zero low byte the parity delta alone decides the parity flag.
        if !rflags.contains(RFlags::PF) {
            self.auxbits |= 1 << LF_BIT_PDB;
        }
    }

    /// Merges the arithmetic flags into `rflags`, keeping all the other bits.
    pub fn materialize(&self, rflags: u64) -> u64 {
        let mut value = RFlags::from_bits_truncate(rflags) & !RFlags::ARITHMETIC;

        value.set(RFlags::CF, self.cf());
        value.set(RFlags::PF, self.pf());
        value.set(RFlags::AF, self.af());
        value.set(RFlags::ZF, self.zf());
        value.set(RFlags::SF, self.sf());
        value.set(RFlags::OF, self.of());

        (rflags & !RFlags::all().bits()) | value.bits()
    }

    pub fn cf(&self) -> bool {
        self.auxbits & LF_MASK_CF != 0
    }

    pub fn of(&self) -> bool {
        (self.auxbits.wrapping_add(1 << LF_BIT_PO) >> LF_BIT_CF) & 1 != 0
    }

    pub fn af(&self) -> bool {
        self.auxbits & LF_MASK_AF != 0
    }

    pub fn zf(&self) -> bool {
        self.result == 0
    }

    pub fn sf(&self) -> bool {
        ((self.result >> 63) ^ (self.auxbits >> LF_BIT_SD)) & 1 != 0
    }

    pub fn pf(&self) -> bool {
        let byte = (self.result ^ (self.auxbits >> LF_BIT_PDB)) & 0xff;
        let nibble = (byte ^ (byte >> 4)) & 0xf;

        (PARITY_LOOKUP >> nibble) & 1 != 0
    }

    /// Records the flags of an operation from its carry vector and result.
    fn set_oszapc(&mut self, width: Width, carries: u64, result: u64) {
        let bits = width.bits();
        let cf = (carries >> (bits - 1)) & 1;
        let po = (carries >> (bits - 2)) & 1;
        let af = (carries >> 3) & 1;

        self.result = width.sign_extend(result);
        self.auxbits = (cf << LF_BIT_CF) | (po << LF_BIT_PO) | (af << LF_BIT_AF);
    }

    /// Like [`Self::set_oszapc`], but leaves the carry flag as it was.
    fn set_oszap(&mut self, width: Width, carries: u64, result: u64) {
        let cf = self.cf();

        self.set_oszapc(width, carries, result);

        // Flipping both CF and PO keeps OF intact.
        if self.cf() != cf {
            self.auxbits ^= LF_MASK_CF | LF_MASK_PO;
        }
    }

    /// Sets the flags after `a + b (+ carry) = result`.
    pub fn set_add(&mut self, width: Width, a: u64, b: u64, result: u64) {
        self.set_oszapc(width, add_carries(a, b, result), result);
    }

    /// Sets the flags after `a - b (- borrow) = result`.
    pub fn set_sub(&mut self, width: Width, a: u64, b: u64, result: u64) {
        self.set_oszapc(width, sub_borrows(a, b, result), result);
    }

    /// Sets the flags after an increment, which preserves the carry flag.
    pub fn set_inc(&mut self, width: Width, a: u64, result: u64) {
        self.set_oszap(width, add_carries(a, 1, result), result);
    }

    /// Sets the flags after a decrement, which preserves the carry flag.
    pub fn set_dec(&mut self, width: Width, a: u64, result: u64) {
        self.set_oszap(width, sub_borrows(a, 1, result), result);
    }

    /// Sets the flags after a logical operation: CF, OF and AF are cleared.
    pub fn set_logic(&mut self, width: Width, result: u64) {
        self.set_oszapc(width, 0, result);
    }

    /// Overrides the overflow and carry flags, as done by shifts and rotates.
    pub fn set_oc(&mut self, of: bool, cf: bool) {
        let (of, cf) = (of as u64, cf as u64);

        self.auxbits &= !(LF_MASK_CF | LF_MASK_PO);
        self.auxbits |= (cf << LF_BIT_CF) | ((of ^ cf) << LF_BIT_PO);
    }

    pub fn set_cf(&mut self, cf: bool) {
        let of = self.of();
        self.set_oc(of, cf);
    }

    pub fn set_of(&mut self, of: bool) {
        let cf = self.cf();
        self.set_oc(of, cf);
    }

    pub fn set_af(&mut self, af: bool) {
        self.auxbits = (self.auxbits & !LF_MASK_AF) | ((af as u64) << LF_BIT_AF);
    }

    pub fn set_zf(&mut self, zf: bool) {
        if zf == self.zf() {
            return;
        }

        if zf {
            // Fold the sign and the parity of the old result into their deltas.
            self.auxbits ^= ((self.result >> 63) & 1) << LF_BIT_SD;
            self.auxbits ^= (self.result & 0xff) << LF_BIT_PDB;
            self.result = 0;
        } else {
            // Bit 8 affects neither the sign nor the parity.
            self.result |= 1 << 8;
        }
    }

    pub fn set_sf(&mut self, sf: bool) {
        if self.sf() != sf {
            self.auxbits ^= LF_MASK_SD;
        }
    }

    pub fn set_pf(&mut self, pf: bool) {
        if self.pf() != pf {
            self.auxbits ^= 1 << LF_BIT_PDB;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// The flags a real processor produces, computed directly from the operands.
    #[derive(Debug, Eq, PartialEq)]
    struct Expected {
        cf: bool,
        of: bool,
        sf: bool,
        zf: bool,
        af: bool,
        pf: bool,
    }

    fn flags_of(lazy: &LazyFlags) -> Expected {
        Expected {
            cf: lazy.cf(),
            of: lazy.of(),
            sf: lazy.sf(),
            zf: lazy.zf(),
            af: lazy.af(),
            pf: lazy.pf(),
        }
    }

    fn parity(result: u64) -> bool {
        (result as u8).count_ones() % 2 == 0
    }

    fn reference_add(width: Width, a: u64, b: u64, carry_in: bool) -> (u64, Expected) {
        let (a, b) = (width.truncate(a), width.truncate(b));
        let wide = a as u128 + b as u128 + carry_in as u128;
        let result = width.truncate(wide as u64);
        let sign = width.sign_bit();

        (result, Expected {
            cf: wide > width.mask() as u128,
            of: (a & sign) == (b & sign) && (result & sign) != (a & sign),
            sf: result & sign != 0,
            zf: result == 0,
            af: ((a ^ b ^ result) & 0x10) != 0,
            pf: parity(result),
        })
    }

    fn reference_sub(width: Width, a: u64, b: u64, borrow_in: bool) -> (u64, Expected) {
        let (a, b) = (width.truncate(a), width.truncate(b));
        let result = width.truncate(a.wrapping_sub(b).wrapping_sub(borrow_in as u64));
        let sign = width.sign_bit();

        (result, Expected {
            cf: (a as u128) < b as u128 + borrow_in as u128,
            of: (a & sign) != (b & sign) && (result & sign) != (a & sign),
            sf: result & sign != 0,
            zf: result == 0,
            af: ((a ^ b ^ result) & 0x10) != 0,
            pf: parity(result),
        })
    }

    fn width() -> impl Strategy<Value = Width> {
        prop_oneof![
            Just(Width::Byte),
            Just(Width::Word),
            Just(Width::Dword),
            Just(Width::Qword),
        ]
    }

    proptest! {
        #[test]
        fn add_and_adc_match_reference(width in width(), a in any::<u64>(), b in any::<u64>(), carry in any::<bool>()) {
            let (result, expected) = reference_add(width, a, b, carry);
            let mut lazy = LazyFlags::default();
            lazy.set_add(width, width.truncate(a), width.truncate(b), result);

            prop_assert_eq!(flags_of(&lazy), expected);
        }

        #[test]
        fn sub_and_sbb_match_reference(width in width(), a in any::<u64>(), b in any::<u64>(), borrow in any::<bool>()) {
            let (result, expected) = reference_sub(width, a, b, borrow);
            let mut lazy = LazyFlags::default();
            lazy.set_sub(width, width.truncate(a), width.truncate(b), result);

            prop_assert_eq!(flags_of(&lazy), expected);
        }

        #[test]
        fn inc_and_dec_preserve_carry(width in width(), a in any::<u64>(), carry in any::<bool>()) {
            let a = width.truncate(a);
            let mut lazy = LazyFlags::default();
            lazy.set_cf(carry);

            let (result, mut expected) = reference_add(width, a, 1, false);
            lazy.set_inc(width, a, result);
            expected.cf = carry;
            prop_assert_eq!(flags_of(&lazy), expected);

            let (result, mut expected) = reference_sub(width, a, 1, false);
            lazy.set_dec(width, a, result);
            expected.cf = carry;
            prop_assert_eq!(flags_of(&lazy), expected);
        }

        #[test]
        fn logic_matches_reference(width in width(), a in any::<u64>(), b in any::<u64>()) {
            let result = width.truncate(a & b);
            let mut lazy = LazyFlags::default();
            lazy.set_logic(width, result);

            prop_assert_eq!(flags_of(&lazy), Expected {
                cf: false,
                of: false,
                sf: width.is_negative(result),
                zf: result == 0,
                af: false,
                pf: parity(result),
            });
        }

        #[test]
        fn explicit_setters_touch_one_flag(
            width in width(),
            a in any::<u64>(),
            b in any::<u64>(),
            which in 0..6usize,
            value in any::<bool>(),
        ) {
            let (result, _) = reference_add(width, a, b, false);
            let mut lazy = LazyFlags::default();
            lazy.set_add(width, width.truncate(a), width.truncate(b), result);

            let mut expected = flags_of(&lazy);

            match which {
                0 => { lazy.set_cf(value); expected.cf = value; }
                1 => { lazy.set_of(value); expected.of = value; }
                2 => { lazy.set_sf(value); expected.sf = value; }
                3 => { lazy.set_zf(value); expected.zf = value; }
                4 => { lazy.set_af(value); expected.af = value; }
                _ => { lazy.set_pf(value); expected.pf = value; }
            }

            prop_assert_eq!(flags_of(&lazy), expected);
        }
    }

    #[test]
    fn rflags_round_trip() {
        let bits = [RFlags::CF, RFlags::PF, RFlags::AF, RFlags::ZF, RFlags::SF, RFlags::OF];

        for combination in 0..(1u32 << bits.len()) {
            let mut rflags = RFlags::FIXED | RFlags::IF | RFlags::DF;

            for (index, bit) in bits.iter().enumerate() {
                if combination & (1 << index) != 0 {
                    rflags |= *bit;
                }
            }

            let lazy = LazyFlags::from_rflags(rflags.bits());

            assert_eq!(lazy.materialize(RFlags::FIXED.bits()), (rflags - RFlags::IF - RFlags::DF).bits());
            assert_eq!(lazy.materialize(rflags.bits()), rflags.bits());
        }
    }

    #[test]
    fn sixty_four_bit_results_are_not_truncated() {
        let mut lazy = LazyFlags::default();
        let result = 0x1_0000_0000u64;
        lazy.set_add(Width::Qword, 0xffff_ffff, 1, result);

        assert!(!lazy.zf());
        assert!(!lazy.cf());
    }
}
