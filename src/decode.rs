//! This module provides the x86 instruction decoder of the emulator. The decoder only covers the
//! instructions that legitimately trap to the hypervisor: accesses to MMIO, port I/O, MSR
//! accesses, and the data movement, arithmetic, logic, shift, rotate, bit test, exchange and
//! string instructions that guests use to touch device memory.

use crate::arch::x86_64::SegmentRegister;
use crate::flags::Width;
use thiserror::Error;

/// The architectural limit on the length of an instruction.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// The default operand and address size of the code segment.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CodeSize {
    Bits16,
    Bits32,
    Bits64,
}

/// The reasons why an instruction could not be decoded.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum DecodeError {
    /// The bytes ended in the middle of the instruction.
    #[error("instruction truncated after {0} bytes")]
    Truncated(usize),
    /// The opcode is not one the emulator implements. Two-byte opcodes are reported as `0x0fxx`.
    #[error("unsupported opcode {opcode:#x}")]
    Unsupported { opcode: u16 },
    /// The instruction is longer than 15 bytes.
    #[error("instruction exceeds {} bytes", MAX_INSTRUCTION_LENGTH)]
    TooLong,
}

/// The repeat prefix of a string instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rep {
    /// `rep`/`repe`: for `cmps` and `scas`, repeat while ZF is set.
    Repe,
    /// `repne`: for `cmps` and `scas`, repeat while ZF is clear.
    Repne,
}

/// A memory operand addressed through ModRM and SIB.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryOperand {
    pub segment: SegmentRegister,
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub displacement: i64,
    /// The displacement is relative to the next instruction.
    pub rip_relative: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperandKind {
    /// A general-purpose register. With `high_byte` set, `index` 0 to 3 selects AH, CH, DH or
    /// BH.
    Register { index: u8, high_byte: bool },
    Immediate(u64),
    Memory(MemoryOperand),
    /// A direct memory offset, as used by `mov` with the accumulator (opcodes A0 to A3).
    Offset { segment: SegmentRegister, offset: u64 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Operand {
    pub kind: OperandKind,
    pub width: Width,
}

impl Operand {
    fn register(index: u8, width: Width) -> Self {
        Self {
            kind: OperandKind::Register { index, high_byte: false },
            width,
        }
    }

    fn immediate(value: u64, width: Width) -> Self {
        Self {
            kind: OperandKind::Immediate(value),
            width,
        }
    }
}

/// The operation of a decoded instruction.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Command {
    Mov,
    Movzx,
    Movsx,
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
    Neg,
    Not,
    Inc,
    Dec,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Rcl,
    Rcr,
    Bt,
    Bts,
    Btr,
    Btc,
    Xchg,
    Xadd,
    In,
    Out,
    Ins,
    Outs,
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Rdmsr,
    Wrmsr,
}

impl Command {
    /// Returns `true` for the string instructions, which take their operands implicitly from
    /// RSI, RDI, RCX and the accumulator.
    pub fn is_string(self) -> bool {
        matches!(
            self,
            Command::Ins | Command::Outs | Command::Movs | Command::Cmps | Command::Stos |
            Command::Lods | Command::Scas
        )
    }
}

const ALU_COMMANDS: [Command; 8] = [
    Command::Add, Command::Or, Command::Adc, Command::Sbb,
    Command::And, Command::Sub, Command::Xor, Command::Cmp,
];

const SHIFT_COMMANDS: [Command; 8] = [
    Command::Rol, Command::Ror, Command::Rcl, Command::Rcr,
    Command::Shl, Command::Shr, Command::Shl, Command::Sar,
];

/// A decoded instruction. Operands are listed destination first.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DecodedInstruction {
    /// The opcode, with two-byte opcodes encoded as `0x0fxx`.
    pub opcode: u16,
    pub command: Command,
    pub operands: Vec<Operand>,
    /// The width of the operation.
    pub operand_size: Width,
    pub address_size: Width,
    pub segment_override: Option<SegmentRegister>,
    pub rep: Option<Rep>,
    pub lock: bool,
    /// The REX prefix, or zero if there was none.
    pub rex: u8,
    /// The encoded length in bytes.
    pub len: usize,
}

struct ModRm {
    mode: u8,
    /// The `reg` field, extended by REX.R.
    reg: u8,
    /// The raw `rm` field.
    rm: u8,
}

struct Decoder<'a> {
    bytes: &'a [u8],
    position: usize,
    code_size: CodeSize,
    rex: u8,
    operand_size: Width,
    address_size: Width,
    segment_override: Option<SegmentRegister>,
}

impl<'a> Decoder<'a> {
    fn byte(&mut self) -> Result<u8, DecodeError> {
        if self.position >= MAX_INSTRUCTION_LENGTH {
            return Err(DecodeError::TooLong);
        }

        let byte = *self
            .bytes
            .get(self.position)
            .ok_or(DecodeError::Truncated(self.position))?;

        self.position += 1;

        Ok(byte)
    }

    /// Reads a little-endian value of `size` bytes, sign-extended to 64 bits.
    fn signed(&mut self, size: usize) -> Result<u64, DecodeError> {
        let mut value = 0u64;

        for shift in 0..size {
            value |= (self.byte()? as u64) << (shift * 8);
        }

        let width = Width::from_bytes(size).ok_or(DecodeError::Truncated(self.position))?;

        Ok(width.sign_extend(value))
    }

    /// Reads an immediate of `size` bytes for an operation of the given width.
    fn immediate(&mut self, size: usize, width: Width) -> Result<Operand, DecodeError> {
        let value = self.signed(size)?;

        Ok(Operand::immediate(width.truncate(value), width))
    }

    /// Reads the immediate of an operation of the given width whose encoding is at most 32 bits
    /// wide.
    fn immediate_z(&mut self, width: Width) -> Result<Operand, DecodeError> {
        self.immediate(width.bytes().min(4), width)
    }

    fn rex_w(&self) -> bool {
        self.rex & 0x8 != 0
    }

    fn modrm(&mut self) -> Result<ModRm, DecodeError> {
        let byte = self.byte()?;

        Ok(ModRm {
            mode: byte >> 6,
            reg: ((byte >> 3) & 0x7) | ((self.rex & 0x4) << 1),
            rm: byte & 0x7,
        })
    }

    /// Returns the register operand for `index`, honoring the legacy high-byte registers that are
    /// only addressable without a REX prefix.
    fn gpr(&self, index: u8, width: Width) -> Operand {
        if width == Width::Byte && self.rex == 0 && (4..8).contains(&index) {
            Operand {
                kind: OperandKind::Register { index: index - 4, high_byte: true },
                width,
            }
        } else {
            Operand::register(index, width)
        }
    }

    fn reg_operand(&self, modrm: &ModRm, width: Width) -> Operand {
        self.gpr(modrm.reg, width)
    }

    fn rm_operand(&mut self, modrm: &ModRm, width: Width) -> Result<Operand, DecodeError> {
        if modrm.mode == 3 {
            let index = modrm.rm | ((self.rex & 0x1) << 3);
            return Ok(self.gpr(index, width));
        }

        let memory = if self.address_size == Width::Word {
            self.memory_16(modrm)?
        } else {
            self.memory_32_64(modrm)?
        };

        Ok(Operand {
            kind: OperandKind::Memory(memory),
            width,
        })
    }

    fn memory_16(&mut self, modrm: &ModRm) -> Result<MemoryOperand, DecodeError> {
        const BX: u8 = 3;
        const BP: u8 = 5;
        const SI: u8 = 6;
        const DI: u8 = 7;

        let (base, index) = match modrm.rm {
            0 => (Some(BX), Some(SI)),
            1 => (Some(BX), Some(DI)),
            2 => (Some(BP), Some(SI)),
            3 => (Some(BP), Some(DI)),
            4 => (Some(SI), None),
            5 => (Some(DI), None),
            6 if modrm.mode == 0 => (None, None),
            6 => (Some(BP), None),
            _ => (Some(BX), None),
        };

        let displacement = match modrm.mode {
            0 if base.is_none() => self.signed(2)?,
            1 => self.signed(1)?,
            2 => self.signed(2)?,
            _ => 0,
        };

        let segment = if base == Some(BP) {
            SegmentRegister::Ss
        } else {
            SegmentRegister::Ds
        };

        Ok(MemoryOperand {
            segment: self.segment_override.unwrap_or(segment),
            base,
            index,
            scale: 1,
            displacement: displacement as i64,
            rip_relative: false,
        })
    }

    fn memory_32_64(&mut self, modrm: &ModRm) -> Result<MemoryOperand, DecodeError> {
        let mut base = None;
        let mut index = None;
        let mut scale = 1;
        let mut rip_relative = false;
        let mut displacement_size = match modrm.mode {
            1 => 1,
            2 => 4,
            _ => 0,
        };

        if modrm.rm == 4 {
            let sib = self.byte()?;
            let sib_index = ((sib >> 3) & 0x7) | ((self.rex & 0x2) << 2);
            let sib_base = sib & 0x7;

            scale = 1 << (sib >> 6);

            if sib_index != 4 {
                index = Some(sib_index);
            }

            if sib_base == 5 && modrm.mode == 0 {
                displacement_size = 4;
            } else {
                base = Some(sib_base | ((self.rex & 0x1) << 3));
            }
        } else if modrm.rm == 5 && modrm.mode == 0 {
            displacement_size = 4;
            rip_relative = self.code_size == CodeSize::Bits64;
        } else {
            base = Some(modrm.rm | ((self.rex & 0x1) << 3));
        }

        let displacement = match displacement_size {
            0 => 0,
            size => self.signed(size)?,
        };

        let segment = match base {
            Some(4) | Some(5) => SegmentRegister::Ss,
            _ => SegmentRegister::Ds,
        };

        Ok(MemoryOperand {
            segment: self.segment_override.unwrap_or(segment),
            base,
            index,
            scale,
            displacement: displacement as i64,
            rip_relative,
        })
    }

    /// The width of port I/O: a byte, or a word or doubleword depending on the operand size.
    fn io_width(&self, opcode: u8) -> Width {
        if opcode & 1 == 0 {
            Width::Byte
        } else if self.operand_size == Width::Word {
            Width::Word
        } else {
            Width::Dword
        }
    }

    /// The width of the byte (even opcode) or full-size (odd opcode) form of an instruction.
    fn width(&self, opcode: u8) -> Width {
        if opcode & 1 == 0 {
            Width::Byte
        } else {
            self.operand_size
        }
    }
}

/// Decodes the instruction at the start of `bytes`.
pub fn decode(bytes: &[u8], code_size: CodeSize) -> Result<DecodedInstruction, DecodeError> {
    let mut decoder = Decoder {
        bytes,
        position: 0,
        code_size,
        rex: 0,
        operand_size: Width::Dword,
        address_size: Width::Dword,
        segment_override: None,
    };

    let mut operand_override = false;
    let mut address_override = false;
    let mut rep = None;
    let mut lock = false;

    let mut opcode = loop {
        let byte = decoder.byte()?;

        match byte {
            0x26 => decoder.segment_override = Some(SegmentRegister::Es),
            0x2e => decoder.segment_override = Some(SegmentRegister::Cs),
            0x36 => decoder.segment_override = Some(SegmentRegister::Ss),
            0x3e => decoder.segment_override = Some(SegmentRegister::Ds),
            0x64 => decoder.segment_override = Some(SegmentRegister::Fs),
            0x65 => decoder.segment_override = Some(SegmentRegister::Gs),
            0x66 => operand_override = true,
            0x67 => address_override = true,
            0xf0 => lock = true,
            0xf2 => rep = Some(Rep::Repne),
            0xf3 => rep = Some(Rep::Repe),
            _ => break byte,
        }
    };

    if code_size == CodeSize::Bits64 && opcode & 0xf0 == 0x40 {
        decoder.rex = opcode;
        opcode = decoder.byte()?;
    }

    decoder.operand_size = match (code_size, operand_override) {
        (CodeSize::Bits64, _) if decoder.rex_w() => Width::Qword,
        (CodeSize::Bits16, false) | (CodeSize::Bits32, true) | (CodeSize::Bits64, true) => Width::Word,
        _ => Width::Dword,
    };

    decoder.address_size = match (code_size, address_override) {
        (CodeSize::Bits64, false) => Width::Qword,
        (CodeSize::Bits16, false) | (CodeSize::Bits32, true) => Width::Word,
        _ => Width::Dword,
    };

    let unsupported = |opcode: u16| DecodeError::Unsupported { opcode };

    let mut operand_size = decoder.operand_size;
    let mut operands = vec![];

    let (full_opcode, command) = match opcode {
        0x0f => {
            let second = decoder.byte()?;
            let full_opcode = 0x0f00 | second as u16;

            let command = match second {
                0x30 => Command::Wrmsr,
                0x32 => Command::Rdmsr,
                0xa3 | 0xab | 0xb3 | 0xbb => {
                    let modrm = decoder.modrm()?;

                    operands.push(decoder.rm_operand(&modrm, operand_size)?);
                    operands.push(decoder.reg_operand(&modrm, operand_size));

                    match second {
                        0xa3 => Command::Bt,
                        0xab => Command::Bts,
                        0xb3 => Command::Btr,
                        _ => Command::Btc,
                    }
                }
                0xba => {
                    let modrm = decoder.modrm()?;

                    let command = match modrm.reg & 0x7 {
                        4 => Command::Bt,
                        5 => Command::Bts,
                        6 => Command::Btr,
                        7 => Command::Btc,
                        _ => return Err(unsupported(full_opcode)),
                    };

                    operands.push(decoder.rm_operand(&modrm, operand_size)?);
                    operands.push(decoder.immediate(1, Width::Byte)?);

                    command
                }
                0xb6 | 0xb7 | 0xbe | 0xbf => {
                    let modrm = decoder.modrm()?;
                    let source = if second & 1 == 0 { Width::Byte } else { Width::Word };

                    operands.push(decoder.reg_operand(&modrm, operand_size));
                    operands.push(decoder.rm_operand(&modrm, source)?);

                    if second < 0xb8 {
                        Command::Movzx
                    } else {
                        Command::Movsx
                    }
                }
                0xc0 | 0xc1 => {
                    let modrm = decoder.modrm()?;

                    operand_size = decoder.width(second);
                    operands.push(decoder.rm_operand(&modrm, operand_size)?);
                    operands.push(decoder.reg_operand(&modrm, operand_size));

                    Command::Xadd
                }
                _ => return Err(unsupported(full_opcode)),
            };

            (full_opcode, command)
        }
        0x00..=0x3f if opcode & 0x7 < 6 => {
            let command = ALU_COMMANDS[(opcode >> 3) as usize];

            operand_size = decoder.width(opcode);

            match opcode & 0x7 {
                0 | 1 => {
                    let modrm = decoder.modrm()?;

                    operands.push(decoder.rm_operand(&modrm, operand_size)?);
                    operands.push(decoder.reg_operand(&modrm, operand_size));
                }
                2 | 3 => {
                    let modrm = decoder.modrm()?;

                    operands.push(decoder.reg_operand(&modrm, operand_size));
                    operands.push(decoder.rm_operand(&modrm, operand_size)?);
                }
                _ => {
                    operands.push(Operand::register(0, operand_size));
                    operands.push(decoder.immediate_z(operand_size)?);
                }
            }

            (opcode as u16, command)
        }
        0x40..=0x4f if code_size != CodeSize::Bits64 => {
            operands.push(Operand::register(opcode & 0x7, operand_size));

            let command = if opcode < 0x48 { Command::Inc } else { Command::Dec };

            (opcode as u16, command)
        }
        0x80..=0x83 => {
            if opcode == 0x82 && code_size == CodeSize::Bits64 {
                return Err(unsupported(opcode as u16));
            }

            let modrm = decoder.modrm()?;

            operand_size = decoder.width(opcode);
            operands.push(decoder.rm_operand(&modrm, operand_size)?);

            let immediate = match opcode {
                0x81 => decoder.immediate_z(operand_size)?,
                _ => decoder.immediate(1, operand_size)?,
            };

            operands.push(immediate);

            (opcode as u16, ALU_COMMANDS[(modrm.reg & 0x7) as usize])
        }
        0x84..=0x8b => {
            let modrm = decoder.modrm()?;

            operand_size = decoder.width(opcode);

            if opcode < 0x8a {
                operands.push(decoder.rm_operand(&modrm, operand_size)?);
                operands.push(decoder.reg_operand(&modrm, operand_size));
            } else {
                operands.push(decoder.reg_operand(&modrm, operand_size));
                operands.push(decoder.rm_operand(&modrm, operand_size)?);
            }

            let command = match opcode {
                0x84 | 0x85 => Command::Test,
                0x86 | 0x87 => Command::Xchg,
                _ => Command::Mov,
            };

            (opcode as u16, command)
        }
        0xa0..=0xa3 => {
            let offset_size = decoder.address_size.bytes();
            let offset = decoder.address_size.truncate(decoder.signed(offset_size)?);
            let segment = decoder.segment_override.unwrap_or(SegmentRegister::Ds);

            operand_size = decoder.width(opcode);

            let accumulator = Operand::register(0, operand_size);
            let memory = Operand {
                kind: OperandKind::Offset { segment, offset },
                width: operand_size,
            };

            if opcode < 0xa2 {
                operands.extend_from_slice(&[accumulator, memory]);
            } else {
                operands.extend_from_slice(&[memory, accumulator]);
            }

            (opcode as u16, Command::Mov)
        }
        0xa8 | 0xa9 => {
            operand_size = decoder.width(opcode);
            operands.push(Operand::register(0, operand_size));
            operands.push(decoder.immediate_z(operand_size)?);

            (opcode as u16, Command::Test)
        }
        0xa4..=0xaf => {
            operand_size = decoder.width(opcode);

            let command = match opcode {
                0xa4 | 0xa5 => Command::Movs,
                0xa6 | 0xa7 => Command::Cmps,
                0xaa | 0xab => Command::Stos,
                0xac | 0xad => Command::Lods,
                _ => Command::Scas,
            };

            (opcode as u16, command)
        }
        0x6c..=0x6f => {
            operand_size = decoder.io_width(opcode);

            let command = if opcode < 0x6e { Command::Ins } else { Command::Outs };

            (opcode as u16, command)
        }
        0xb0..=0xb7 => {
            let index = (opcode & 0x7) | ((decoder.rex & 0x1) << 3);

            operand_size = Width::Byte;
            operands.push(decoder.gpr(index, Width::Byte));
            operands.push(decoder.immediate(1, Width::Byte)?);

            (opcode as u16, Command::Mov)
        }
        0xb8..=0xbf => {
            let index = (opcode & 0x7) | ((decoder.rex & 0x1) << 3);

            operands.push(Operand::register(index, operand_size));
            operands.push(decoder.immediate(operand_size.bytes(), operand_size)?);

            (opcode as u16, Command::Mov)
        }
        0xc0 | 0xc1 | 0xd0..=0xd3 => {
            let modrm = decoder.modrm()?;

            operand_size = decoder.width(opcode);
            operands.push(decoder.rm_operand(&modrm, operand_size)?);

            let count = match opcode {
                0xc0 | 0xc1 => decoder.immediate(1, Width::Byte)?,
                0xd0 | 0xd1 => Operand::immediate(1, Width::Byte),
                _ => Operand::register(1, Width::Byte),
            };

            operands.push(count);

            (opcode as u16, SHIFT_COMMANDS[(modrm.reg & 0x7) as usize])
        }
        0xc6 | 0xc7 => {
            let modrm = decoder.modrm()?;

            if modrm.reg & 0x7 != 0 {
                return Err(unsupported(opcode as u16));
            }

            operand_size = decoder.width(opcode);
            operands.push(decoder.rm_operand(&modrm, operand_size)?);
            operands.push(decoder.immediate_z(operand_size)?);

            (opcode as u16, Command::Mov)
        }
        0xe4..=0xe7 | 0xec..=0xef => {
            operand_size = decoder.io_width(opcode);

            let port = if opcode < 0xe8 {
                decoder.immediate(1, Width::Byte)?
            } else {
                Operand::register(2, Width::Word)
            };

            let accumulator = Operand::register(0, operand_size);

            let command = if opcode & 0x2 == 0 {
                operands.extend_from_slice(&[accumulator, port]);
                Command::In
            } else {
                operands.extend_from_slice(&[port, accumulator]);
                Command::Out
            };

            (opcode as u16, command)
        }
        0xf6 | 0xf7 => {
            let modrm = decoder.modrm()?;

            operand_size = decoder.width(opcode);
            operands.push(decoder.rm_operand(&modrm, operand_size)?);

            let command = match modrm.reg & 0x7 {
                0 | 1 => {
                    operands.push(decoder.immediate_z(operand_size)?);
                    Command::Test
                }
                2 => Command::Not,
                3 => Command::Neg,
                _ => return Err(unsupported(opcode as u16)),
            };

            (opcode as u16, command)
        }
        0xfe | 0xff => {
            let modrm = decoder.modrm()?;

            let command = match modrm.reg & 0x7 {
                0 => Command::Inc,
                1 => Command::Dec,
                _ => return Err(unsupported(opcode as u16)),
            };

            operand_size = decoder.width(opcode);
            operands.push(decoder.rm_operand(&modrm, operand_size)?);

            (opcode as u16, command)
        }
        _ => return Err(unsupported(opcode as u16)),
    };

    Ok(DecodedInstruction {
        opcode: full_opcode,
        command,
        operands,
        operand_size,
        address_size: decoder.address_size,
        segment_override: decoder.segment_override,
        rep,
        lock,
        rex: decoder.rex,
        len: decoder.position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(operand: &Operand) -> MemoryOperand {
        match operand.kind {
            OperandKind::Memory(memory) => memory,
            other => panic!("not a memory operand: {:?}", other),
        }
    }

    #[test]
    fn mov_to_memory_with_sib_and_displacement() {
        // mov [rax + rcx * 4 + 0x10], edx
        let instruction = decode(&[0x89, 0x54, 0x88, 0x10], CodeSize::Bits64).unwrap();

        assert_eq!(instruction.command, Command::Mov);
        assert_eq!(instruction.len, 4);
        assert_eq!(instruction.operand_size, Width::Dword);
        assert_eq!(instruction.operands[1], Operand::register(2, Width::Dword));

        let destination = memory(&instruction.operands[0]);
        assert_eq!(destination.base, Some(0));
        assert_eq!(destination.index, Some(1));
        assert_eq!(destination.scale, 4);
        assert_eq!(destination.displacement, 0x10);
        assert_eq!(destination.segment, SegmentRegister::Ds);
    }

    #[test]
    fn rex_extends_registers_and_operand_size() {
        // mov r9, [r12]
        let instruction = decode(&[0x4d, 0x8b, 0x0c, 0x24], CodeSize::Bits64).unwrap();

        assert_eq!(instruction.rex, 0x4d);
        assert_eq!(instruction.operand_size, Width::Qword);
        assert_eq!(instruction.operands[0], Operand::register(9, Width::Qword));

        let source = memory(&instruction.operands[1]);
        assert_eq!(source.base, Some(12));
        assert_eq!(source.index, None);
        // R12 is not a stack pointer, the default segment stays DS.
        assert_eq!(source.segment, SegmentRegister::Ds);
    }

    #[test]
    fn high_byte_registers_need_no_rex() {
        // mov ah, [rbx]
        let legacy = decode(&[0x8a, 0x23], CodeSize::Bits64).unwrap();
        assert_eq!(
            legacy.operands[0].kind,
            OperandKind::Register { index: 0, high_byte: true }
        );

        // mov spl, [rbx]
        let rex = decode(&[0x40, 0x8a, 0x23], CodeSize::Bits64).unwrap();
        assert_eq!(
            rex.operands[0].kind,
            OperandKind::Register { index: 4, high_byte: false }
        );
    }

    #[test]
    fn rip_relative_only_in_long_mode() {
        let bytes = [0x8b, 0x05, 0x00, 0x10, 0x00, 0x00];

        let long = decode(&bytes, CodeSize::Bits64).unwrap();
        assert!(memory(&long.operands[1]).rip_relative);

        let protected = decode(&bytes, CodeSize::Bits32).unwrap();
        let absolute = memory(&protected.operands[1]);
        assert!(!absolute.rip_relative);
        assert_eq!(absolute.base, None);
        assert_eq!(absolute.displacement, 0x1000);
    }

    #[test]
    fn sixteen_bit_addressing() {
        // mov ax, [bp + di - 2]
        let instruction = decode(&[0x8b, 0x43, 0xfe], CodeSize::Bits16).unwrap();

        assert_eq!(instruction.operand_size, Width::Word);
        assert_eq!(instruction.address_size, Width::Word);

        let source = memory(&instruction.operands[1]);
        assert_eq!(source.base, Some(5));
        assert_eq!(source.index, Some(7));
        assert_eq!(source.displacement, -2);
        assert_eq!(source.segment, SegmentRegister::Ss);
    }

    #[test]
    fn immediates_are_sign_extended_to_the_operand_size() {
        // add qword [rdi], -1
        let instruction = decode(&[0x48, 0x83, 0x07, 0xff], CodeSize::Bits64).unwrap();
        assert_eq!(instruction.command, Command::Add);
        assert_eq!(instruction.operands[1].kind, OperandKind::Immediate(u64::MAX));

        // mov word [bx], 0x8000
        let instruction = decode(&[0xc7, 0x07, 0x00, 0x80], CodeSize::Bits16).unwrap();
        assert_eq!(instruction.operands[1].kind, OperandKind::Immediate(0x8000));
        assert_eq!(instruction.len, 4);

        // mov rax, imm64
        let instruction = decode(
            &[0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
            CodeSize::Bits64,
        ).unwrap();
        assert_eq!(instruction.operands[1].kind, OperandKind::Immediate(0x1122_3344_5566_7788));
        assert_eq!(instruction.len, 10);
    }

    #[test]
    fn string_instructions_with_prefixes() {
        let instruction = decode(&[0xf3, 0xa4], CodeSize::Bits64).unwrap();
        assert_eq!(instruction.command, Command::Movs);
        assert_eq!(instruction.rep, Some(Rep::Repe));
        assert_eq!(instruction.operand_size, Width::Byte);

        let instruction = decode(&[0x66, 0xf2, 0xaf], CodeSize::Bits32).unwrap();
        assert_eq!(instruction.command, Command::Scas);
        assert_eq!(instruction.rep, Some(Rep::Repne));
        assert_eq!(instruction.operand_size, Width::Word);

        let instruction = decode(&[0xf3, 0x6f], CodeSize::Bits64).unwrap();
        assert_eq!(instruction.command, Command::Outs);
        assert_eq!(instruction.operand_size, Width::Dword);
    }

    #[test]
    fn port_io() {
        let instruction = decode(&[0xe6, 0x80], CodeSize::Bits16).unwrap();
        assert_eq!(instruction.command, Command::Out);
        assert_eq!(instruction.operands[0].kind, OperandKind::Immediate(0x80));
        assert_eq!(instruction.operands[1], Operand::register(0, Width::Byte));

        // in eax, dx with REX.W still transfers four bytes.
        let instruction = decode(&[0x48, 0xed], CodeSize::Bits64).unwrap();
        assert_eq!(instruction.command, Command::In);
        assert_eq!(instruction.operand_size, Width::Dword);
        assert_eq!(instruction.operands[1], Operand::register(2, Width::Word));
    }

    #[test]
    fn shifts_and_bit_tests() {
        let instruction = decode(&[0xd3, 0xe8], CodeSize::Bits32).unwrap();
        assert_eq!(instruction.command, Command::Shr);
        assert_eq!(instruction.operands[1], Operand::register(1, Width::Byte));

        let instruction = decode(&[0xc1, 0xf8, 0x03], CodeSize::Bits32).unwrap();
        assert_eq!(instruction.command, Command::Sar);
        assert_eq!(instruction.operands[1].kind, OperandKind::Immediate(3));

        let instruction = decode(&[0x0f, 0xba, 0x2b, 0x07], CodeSize::Bits32).unwrap();
        assert_eq!(instruction.command, Command::Bts);
        assert_eq!(instruction.opcode, 0x0fba);
        assert_eq!(instruction.operands[1].kind, OperandKind::Immediate(7));
    }

    #[test]
    fn moffs_uses_the_address_size() {
        let instruction = decode(
            &[0xa1, 0x00, 0x00, 0xe0, 0xfe, 0x00, 0x00, 0x00, 0x00],
            CodeSize::Bits64,
        ).unwrap();

        assert_eq!(instruction.len, 9);
        assert_eq!(
            instruction.operands[1].kind,
            OperandKind::Offset { segment: SegmentRegister::Ds, offset: 0xfee0_0000 }
        );
    }

    #[test]
    fn inc_dec_short_forms_are_rex_in_long_mode() {
        let instruction = decode(&[0x41], CodeSize::Bits32).unwrap();
        assert_eq!(instruction.command, Command::Inc);
        assert_eq!(instruction.operands[0], Operand::register(1, Width::Dword));

        // 0x41 is REX.B in long mode, so the instruction continues.
        assert_eq!(decode(&[0x41], CodeSize::Bits64), Err(DecodeError::Truncated(1)));
    }

    #[test]
    fn rejects_unsupported_and_overlong_instructions() {
        assert_eq!(
            decode(&[0xf7, 0xf1], CodeSize::Bits64),
            Err(DecodeError::Unsupported { opcode: 0xf7 })
        );
        assert_eq!(
            decode(&[0x0f, 0x05], CodeSize::Bits64),
            Err(DecodeError::Unsupported { opcode: 0x0f05 })
        );
        assert_eq!(decode(&[0x66; 16], CodeSize::Bits32), Err(DecodeError::TooLong));
        assert_eq!(decode(&[0x89], CodeSize::Bits32), Err(DecodeError::Truncated(1)));
    }
}
