//! This module provides the instruction emulator that the VM exit handlers fall back to whenever
//! the hardware cannot complete a guest access on its own, such as MMIO accesses and string port
//! I/O.
//!
//! The emulator operates on the in-memory [`VcpuState`], so the caller must pull the register
//! file from the hardware before emulating and mark it dirty afterwards. [`Emulator::step`]
//! fetches, decodes and executes a single instruction and turns guest-visible faults into
//! pending exceptions.

use crate::arch::x86_64::*;
use crate::decode::{
    decode, CodeSize, Command, DecodeError, DecodedInstruction, MemoryOperand, Operand,
    OperandKind, Rep, MAX_INSTRUCTION_LENGTH,
};
use crate::error::Error;
use crate::flags::{RFlags, Width};
use crate::hypervisor::HypervisorVcpu;
use crate::irq::Apic;
use crate::mmu::{AccessKind, GuestMemory, LinearMemory};
use crate::msr::MsrFile;
use crate::state::VcpuState;
use crate::vmx::VmxExt;
use log::{debug, trace, warn};

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RSI: u8 = 6;
const RDI: u8 = 7;

/// Where an operand lives once its address has been resolved. Register operands stay in the
/// register file of [`VcpuState`] and never reach guest memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Location {
    Register { index: u8, high_byte: bool },
    Memory(u64),
    Immediate(u64),
}

/// Emulates instructions against the register file of a virtual CPU and guest memory.
pub struct Emulator<'a, V: HypervisorVcpu> {
    vcpu: &'a mut V,
    state: &'a mut VcpuState,
    memory: LinearMemory<'a>,
    msrs: &'a mut MsrFile,
    apic: &'a dyn Apic,
}

impl<'a, V: HypervisorVcpu> Emulator<'a, V> {
    pub fn new(
        vcpu: &'a mut V,
        state: &'a mut VcpuState,
        memory: GuestMemory<'a>,
        msrs: &'a mut MsrFile,
        apic: &'a dyn Apic,
    ) -> Self {
        let memory = LinearMemory::new(memory, state.paging(), state.cpl() == 3);

        Self {
            vcpu,
            state,
            memory,
            msrs,
            apic,
        }
    }

    /// Emulates the instruction at RIP. Decode failures raise #UD and page faults raise #PF in
    /// the guest, any other error is returned.
    pub fn step(&mut self) -> Result<(), Error> {
        let result = self.fetch().and_then(|instruction| self.execute(&instruction));

        match result {
            Err(Error::Decode(error)) => {
                warn!(
                    "vcpu {}: cannot emulate instruction at {:#x}: {}",
                    self.vcpu.id(),
                    self.state.rip,
                    error,
                );

                self.vcpu.inject_exception(EXCEPTION_UD, None)
            }
            Err(Error::PageFault { linear, code }) => {
                debug!(
                    "vcpu {}: page fault at {:#x} ({:#x}) while emulating {:#x}",
                    self.vcpu.id(),
                    linear,
                    code,
                    self.state.rip,
                );

                // Completed iterations of a string instruction remain visible.
                self.state.dirty = true;
                self.state.cr2 = linear;
                self.vcpu.write_register(Register::Cr2, linear)?;
                self.vcpu.inject_exception(EXCEPTION_PF, Some(code))
            }
            result => result,
        }
    }

    /// Fetches and decodes the instruction at RIP.
    pub fn fetch(&mut self) -> Result<DecodedInstruction, Error> {
        let code_size = self.state.code_size();
        let linear = self.linear_address(SegmentRegister::Cs, self.state.rip, Width::Qword);
        let mut bytes = [0u8; MAX_INSTRUCTION_LENGTH];
        let mut fetched = 0;

        // Only fetch what the decoder asks for: the bytes after the instruction may be unmapped
        // or belong to a device.
        let instruction = loop {
            let address = linear.wrapping_add(fetched as u64);

            fetched += self.memory.fetch(address, &mut bytes[fetched..])?;

            match decode(&bytes[..fetched], code_size) {
                Err(DecodeError::Truncated(_)) if fetched < bytes.len() => continue,
                result => break result?,
            }
        };

        trace!(
            "vcpu {}: emulating {:?} at {:#x}",
            self.vcpu.id(),
            instruction.command,
            self.state.rip,
        );

        Ok(instruction)
    }

    /// Executes a decoded instruction and advances RIP past it.
    pub fn execute(&mut self, instruction: &DecodedInstruction) -> Result<(), Error> {
        match instruction.command {
            Command::Mov => self.mov(instruction)?,
            Command::Movzx | Command::Movsx => self.movx(instruction)?,
            Command::Add | Command::Or | Command::Adc | Command::Sbb | Command::And |
            Command::Sub | Command::Xor | Command::Cmp | Command::Test => {
                self.arithmetic(instruction)?
            }
            Command::Neg | Command::Not | Command::Inc | Command::Dec => self.unary(instruction)?,
            Command::Shl | Command::Shr | Command::Sar => self.shift(instruction)?,
            Command::Rol | Command::Ror | Command::Rcl | Command::Rcr => self.rotate(instruction)?,
            Command::Bt | Command::Bts | Command::Btr | Command::Btc => self.bit_test(instruction)?,
            Command::Xchg | Command::Xadd => self.exchange(instruction)?,
            Command::In | Command::Out => self.port_io(instruction)?,
            Command::Rdmsr | Command::Wrmsr => {
                if !self.msr(instruction)? {
                    return self.vcpu.inject_exception(EXCEPTION_GP, Some(0));
                }
            }
            Command::Ins | Command::Outs | Command::Movs | Command::Cmps | Command::Stos |
            Command::Lods | Command::Scas => self.string(instruction)?,
        }

        self.advance(instruction.len as u64);

        Ok(())
    }

    fn advance(&mut self, len: u64) {
        let rip = self.state.rip.wrapping_add(len);

        self.state.rip = match self.state.code_size() {
            CodeSize::Bits64 => rip,
            CodeSize::Bits32 => rip & 0xffff_ffff,
            CodeSize::Bits16 => rip & 0xffff,
        };
        self.state.dirty = true;
    }

    /// Applies segmentation to an offset. In 64-bit code only FS and GS have a base.
    fn linear_address(&self, segment: SegmentRegister, offset: u64, address_size: Width) -> u64 {
        let offset = address_size.truncate(offset);
        let base = self.state.segment(segment).base;

        if self.state.code_size() == CodeSize::Bits64 {
            match segment {
                SegmentRegister::Fs | SegmentRegister::Gs => base.wrapping_add(offset),
                _ => offset,
            }
        } else {
            base.wrapping_add(offset) & 0xffff_ffff
        }
    }

    fn effective_address(&self, memory: &MemoryOperand, instruction: &DecodedInstruction) -> u64 {
        let address_size = instruction.address_size;
        let mut offset = memory.displacement as u64;

        if let Some(base) = memory.base {
            offset = offset.wrapping_add(self.state.read_gpr(base, address_size));
        }

        if let Some(index) = memory.index {
            let index = self.state.read_gpr(index, address_size);
            offset = offset.wrapping_add(index.wrapping_mul(memory.scale as u64));
        }

        if memory.rip_relative {
            let next = self.state.rip.wrapping_add(instruction.len as u64);
            offset = offset.wrapping_add(next);
        }

        self.linear_address(memory.segment, offset, address_size)
    }

    fn locate(&self, operand: &Operand, instruction: &DecodedInstruction) -> Location {
        match operand.kind {
            OperandKind::Register { index, high_byte } => Location::Register { index, high_byte },
            OperandKind::Immediate(value) => Location::Immediate(value),
            OperandKind::Memory(ref memory) => {
                Location::Memory(self.effective_address(memory, instruction))
            }
            OperandKind::Offset { segment, offset } => {
                Location::Memory(self.linear_address(segment, offset, instruction.address_size))
            }
        }
    }

    fn read_memory(&mut self, linear: u64, width: Width) -> Result<u64, Error> {
        self.state.mmio_buf = [0; 8];
        self.memory.read(linear, &mut self.state.mmio_buf[..width.bytes()])?;

        Ok(u64::from_le_bytes(self.state.mmio_buf))
    }

    fn write_memory(&mut self, linear: u64, width: Width, value: u64) -> Result<(), Error> {
        self.state.mmio_buf = value.to_le_bytes();
        self.memory.write(linear, &self.state.mmio_buf[..width.bytes()])
    }

    fn load(&mut self, location: Location, width: Width) -> Result<u64, Error> {
        match location {
            Location::Register { index, high_byte: true } => Ok(self.state.read_high_byte(index)),
            Location::Register { index, .. } => Ok(self.state.read_gpr(index, width)),
            Location::Memory(linear) => self.read_memory(linear, width),
            Location::Immediate(value) => Ok(width.truncate(value)),
        }
    }

    fn store(&mut self, location: Location, width: Width, value: u64) -> Result<(), Error> {
        match location {
            Location::Register { index, high_byte: true } => {
                self.state.write_high_byte(index, value);
                Ok(())
            }
            Location::Register { index, .. } => {
                self.state.write_gpr(index, width, value);
                Ok(())
            }
            Location::Memory(linear) => self.write_memory(linear, width, value),
            // Immediates are never destinations.
            Location::Immediate(_) => Ok(()),
        }
    }

    /// Resolves both operands of a two-operand instruction.
    fn operands(&self, instruction: &DecodedInstruction) -> Result<(Location, Location), Error> {
        match instruction.operands.as_slice() {
            [destination, source] => Ok((
                self.locate(destination, instruction),
                self.locate(source, instruction),
            )),
            _ => Err(DecodeError::Unsupported { opcode: instruction.opcode }.into()),
        }
    }

    fn destination(&self, instruction: &DecodedInstruction) -> Result<(Location, Width), Error> {
        match instruction.operands.first() {
            Some(operand) => Ok((self.locate(operand, instruction), operand.width)),
            _ => Err(DecodeError::Unsupported { opcode: instruction.opcode }.into()),
        }
    }

    fn mov(&mut self, instruction: &DecodedInstruction) -> Result<(), Error> {
        let (destination, source) = self.operands(instruction)?;
        let width = instruction.operand_size;
        let value = self.load(source, width)?;

        self.store(destination, width, value)
    }

    fn movx(&mut self, instruction: &DecodedInstruction) -> Result<(), Error> {
        let (destination, source) = self.operands(instruction)?;
        let source_width = instruction.operands[1].width;
        let width = instruction.operands[0].width;

        let mut value = self.load(source, source_width)?;

        if instruction.command == Command::Movsx {
            value = source_width.sign_extend(value);
        }

        self.store(destination, width, width.truncate(value))
    }

    fn arithmetic(&mut self, instruction: &DecodedInstruction) -> Result<(), Error> {
        let (destination, source) = self.operands(instruction)?;
        let width = instruction.operand_size;
        let a = self.load(destination, width)?;
        let b = self.load(source, width)?;
        let carry = self.state.lflags.cf() as u64;
        let flags = &mut self.state.lflags;

        let result = match instruction.command {
            Command::Add => {
                let result = width.truncate(a.wrapping_add(b));
                flags.set_add(width, a, b, result);
                result
            }
            Command::Adc => {
                let result = width.truncate(a.wrapping_add(b).wrapping_add(carry));
                flags.set_add(width, a, b, result);
                result
            }
            Command::Sub | Command::Cmp => {
                let result = width.truncate(a.wrapping_sub(b));
                flags.set_sub(width, a, b, result);
                result
            }
            Command::Sbb => {
                let result = width.truncate(a.wrapping_sub(b).wrapping_sub(carry));
                flags.set_sub(width, a, b, result);
                result
            }
            Command::And | Command::Test => {
                let result = a & b;
                flags.set_logic(width, result);
                result
            }
            Command::Or => {
                let result = a | b;
                flags.set_logic(width, result);
                result
            }
            _ => {
                let result = a ^ b;
                flags.set_logic(width, result);
                result
            }
        };

        match instruction.command {
            Command::Cmp | Command::Test => Ok(()),
            _ => self.store(destination, width, result),
        }
    }

    fn unary(&mut self, instruction: &DecodedInstruction) -> Result<(), Error> {
        let (destination, width) = self.destination(instruction)?;
        let a = self.load(destination, width)?;
        let flags = &mut self.state.lflags;

        let result = match instruction.command {
            Command::Neg => {
                let result = width.truncate(0u64.wrapping_sub(a));
                flags.set_sub(width, 0, a, result);
                result
            }
            Command::Not => width.truncate(!a),
            Command::Inc => {
                let result = width.truncate(a.wrapping_add(1));
                flags.set_inc(width, a, result);
                result
            }
            _ => {
                let result = width.truncate(a.wrapping_sub(1));
                flags.set_dec(width, a, result);
                result
            }
        };

        self.store(destination, width, result)
    }

    /// Reads the count operand of a shift or rotate, masked as the processor does.
    fn count(&mut self, count: Location, width: Width) -> Result<u32, Error> {
        let mask = if width == Width::Qword { 0x3f } else { 0x1f };

        Ok((self.load(count, Width::Byte)? & mask) as u32)
    }

    fn shift(&mut self, instruction: &DecodedInstruction) -> Result<(), Error> {
        let (destination, count) = self.operands(instruction)?;
        let width = instruction.operand_size;
        let count = self.count(count, width)?;

        if count == 0 {
            return Ok(());
        }

        let a = self.load(destination, width)?;
        let bits = width.bits();

        let (result, cf, of) = match instruction.command {
            Command::Shl => {
                let wide = (a as u128) << count;
                let result = width.truncate(wide as u64);
                let cf = (wide >> bits) & 1 != 0;

                (result, cf, width.is_negative(result) ^ cf)
            }
            Command::Shr => {
                let result = a >> count;
                let cf = (a >> (count - 1)) & 1 != 0;

                (result, cf, width.is_negative(a))
            }
            _ => {
                let signed = width.sign_extend(a) as i64;
                let result = width.truncate((signed >> count) as u64);
                let cf = (signed >> (count - 1)) & 1 != 0;

                (result, cf, false)
            }
        };

        self.state.lflags.set_logic(width, result);
        self.state.lflags.set_oc(of, cf);

        self.store(destination, width, result)
    }

    /// Rotates only ever change CF and OF.
    fn rotate(&mut self, instruction: &DecodedInstruction) -> Result<(), Error> {
        let (destination, count) = self.operands(instruction)?;
        let width = instruction.operand_size;
        let count = self.count(count, width)?;

        if count == 0 {
            return Ok(());
        }

        let a = self.load(destination, width)?;
        let bits = width.bits();
        let msb = |value: u64| width.is_negative(value);
        let second = |value: u64| (value >> (bits - 2)) & 1 != 0;

        let (result, cf, of) = match instruction.command {
            Command::Rol => {
                let n = count % bits;
                let result = if n == 0 {
                    a
                } else {
                    width.truncate((a << n) | (a >> (bits - n)))
                };
                let cf = result & 1 != 0;

                (result, cf, msb(result) ^ cf)
            }
            Command::Ror => {
                let n = count % bits;
                let result = if n == 0 {
                    a
                } else {
                    width.truncate((a >> n) | (a << (bits - n)))
                };

                (result, msb(result), msb(result) ^ second(result))
            }
            _ => {
                // RCL and RCR rotate through CF, i.e. over `bits + 1` bits.
                let n = count % (bits + 1);

                if n == 0 {
                    return Ok(());
                }

                let span = bits + 1;
                let mask = (1u128 << span) - 1;
                let value = ((self.state.lflags.cf() as u128) << bits) | a as u128;

                let rotated = if instruction.command == Command::Rcl {
                    ((value << n) | (value >> (span - n))) & mask
                } else {
                    ((value >> n) | (value << (span - n))) & mask
                };

                let result = width.truncate(rotated as u64);
                let cf = (rotated >> bits) & 1 != 0;

                let of = if instruction.command == Command::Rcl {
                    msb(result) ^ cf
                } else {
                    msb(result) ^ second(result)
                };

                (result, cf, of)
            }
        };

        self.state.lflags.set_oc(of, cf);

        self.store(destination, width, result)
    }

    fn bit_test(&mut self, instruction: &DecodedInstruction) -> Result<(), Error> {
        let (mut destination, offset) = self.operands(instruction)?;
        let width = instruction.operand_size;
        let bits = width.bits() as u64;

        let bit = match offset {
            Location::Immediate(value) => value & (bits - 1),
            _ => {
                let offset = self.load(offset, width)?;

                // A register bit offset reaches beyond the addressed operand in memory.
                if let Location::Memory(linear) = destination {
                    let signed = width.sign_extend(offset) as i64;
                    let displacement = (signed >> bits.trailing_zeros()) * width.bytes() as i64;

                    destination = Location::Memory(linear.wrapping_add(displacement as u64));
                }

                offset & (bits - 1)
            }
        };

        let value = self.load(destination, width)?;
        let cf = (value >> bit) & 1 != 0;

        self.state.lflags.set_cf(cf);

        let result = match instruction.command {
            Command::Bts => value | (1 << bit),
            Command::Btr => value & !(1 << bit),
            Command::Btc => value ^ (1 << bit),
            _ => return Ok(()),
        };

        self.store(destination, width, result)
    }

    /// XCHG and XADD. The memory operand is written first so that a page fault leaves the
    /// register untouched.
    fn exchange(&mut self, instruction: &DecodedInstruction) -> Result<(), Error> {
        let (destination, source) = self.operands(instruction)?;
        let width = instruction.operand_size;
        let a = self.load(destination, width)?;
        let b = self.load(source, width)?;

        if instruction.command == Command::Xadd {
            let result = width.truncate(a.wrapping_add(b));

            self.store(destination, width, result)?;
            self.store(source, width, a)?;
            self.state.lflags.set_add(width, a, b, result);
        } else {
            self.store(destination, width, b)?;
            self.store(source, width, a)?;
        }

        Ok(())
    }

    fn port_io(&mut self, instruction: &DecodedInstruction) -> Result<(), Error> {
        let (destination, source) = self.operands(instruction)?;
        let width = instruction.operand_size;
        let bus = self.memory.memory.bus();
        let mut data = [0u8; 8];

        if instruction.command == Command::In {
            let port = self.load(source, Width::Word)? as u16;

            bus.pio_in(port, &mut data[..width.bytes()]);
            self.store(destination, width, u64::from_le_bytes(data))
        } else {
            let port = self.load(destination, Width::Word)? as u16;

            data = self.load(source, width)?.to_le_bytes();
            bus.pio_out(port, &data[..width.bytes()]);

            Ok(())
        }
    }

    /// RDMSR and WRMSR. Returns `false` if the access must raise #GP.
    fn msr(&mut self, instruction: &DecodedInstruction) -> Result<bool, Error> {
        let msr = self.state.read_gpr(RCX, Width::Dword) as u32;

        if instruction.command == Command::Rdmsr {
            let value = match self.msrs.read(&*self.vcpu, self.apic, msr)? {
                Some(value) => value,
                _ => return Ok(false),
            };

            self.state.write_gpr(RAX, Width::Dword, value);
            self.state.write_gpr(RDX, Width::Dword, value >> 32);

            Ok(true)
        } else {
            let value = (self.state.read_gpr(RDX, Width::Dword) << 32) |
                self.state.read_gpr(RAX, Width::Dword);

            self.msrs.write(&mut *self.vcpu, self.apic, msr, value)
        }
    }

    fn step_index(&mut self, index: u8, instruction: &DecodedInstruction) {
        let width = instruction.operand_size.bytes() as u64;
        let delta = if self.state.flag(RFlags::DF) {
            width.wrapping_neg()
        } else {
            width
        };

        let address_size = instruction.address_size;
        let value = self.state.read_gpr(index, address_size).wrapping_add(delta);

        self.state.write_gpr(index, address_size, value);
    }

    fn source_address(&self, instruction: &DecodedInstruction) -> u64 {
        let segment = instruction.segment_override.unwrap_or(SegmentRegister::Ds);
        let offset = self.state.read_gpr(RSI, instruction.address_size);

        self.linear_address(segment, offset, instruction.address_size)
    }

    /// The destination of string instructions is always ES:RDI.
    fn destination_address(&self, instruction: &DecodedInstruction) -> u64 {
        let offset = self.state.read_gpr(RDI, instruction.address_size);

        self.linear_address(SegmentRegister::Es, offset, instruction.address_size)
    }

    /// Executes a single iteration of a string instruction.
    fn string_iteration(&mut self, instruction: &DecodedInstruction) -> Result<(), Error> {
        let width = instruction.operand_size;

        match instruction.command {
            Command::Movs => {
                let source = self.source_address(instruction);
                let destination = self.destination_address(instruction);
                let value = self.read_memory(source, width)?;

                self.write_memory(destination, width, value)?;
                self.step_index(RSI, instruction);
                self.step_index(RDI, instruction);
            }
            Command::Cmps => {
                let source = self.source_address(instruction);
                let destination = self.destination_address(instruction);
                let a = self.read_memory(source, width)?;
                let b = self.read_memory(destination, width)?;

                self.state.lflags.set_sub(width, a, b, width.truncate(a.wrapping_sub(b)));
                self.step_index(RSI, instruction);
                self.step_index(RDI, instruction);
            }
            Command::Stos => {
                let destination = self.destination_address(instruction);
                let value = self.state.read_gpr(RAX, width);

                self.write_memory(destination, width, value)?;
                self.step_index(RDI, instruction);
            }
            Command::Lods => {
                let source = self.source_address(instruction);
                let value = self.read_memory(source, width)?;

                self.state.write_gpr(RAX, width, value);
                self.step_index(RSI, instruction);
            }
            Command::Scas => {
                let destination = self.destination_address(instruction);
                let a = self.state.read_gpr(RAX, width);
                let b = self.read_memory(destination, width)?;

                self.state.lflags.set_sub(width, a, b, width.truncate(a.wrapping_sub(b)));
                self.step_index(RDI, instruction);
            }
            Command::Ins => {
                let destination = self.destination_address(instruction);
                let port = self.state.read_gpr(RDX, Width::Word) as u16;
                let mut data = [0u8; 8];

                // Port reads have side effects, so fault before performing one.
                self.memory.translate(destination, AccessKind::Write)?;
                self.memory.memory.bus().pio_in(port, &mut data[..width.bytes()]);
                self.write_memory(destination, width, u64::from_le_bytes(data))?;
                self.step_index(RDI, instruction);
            }
            _ => {
                let source = self.source_address(instruction);
                let port = self.state.read_gpr(RDX, Width::Word) as u16;
                let data = self.read_memory(source, width)?.to_le_bytes();

                self.memory.memory.bus().pio_out(port, &data[..width.bytes()]);
                self.step_index(RSI, instruction);
            }
        }

        Ok(())
    }

    /// Executes a string instruction, repeating it while RCX is non-zero if it has a repeat
    /// prefix. CMPS and SCAS also stop when ZF no longer matches the prefix.
    fn string(&mut self, instruction: &DecodedInstruction) -> Result<(), Error> {
        let address_size = instruction.address_size;
        let compares = matches!(instruction.command, Command::Cmps | Command::Scas);

        let rep = match instruction.rep {
            Some(rep) => rep,
            _ => return self.string_iteration(instruction),
        };

        while self.state.read_gpr(RCX, address_size) != 0 {
            self.string_iteration(instruction)?;

            let count = self.state.read_gpr(RCX, address_size).wrapping_sub(1);
            self.state.write_gpr(RCX, address_size, count);

            if compares && self.state.lflags.zf() != (rep == Rep::Repe) {
                break;
            }
        }

        Ok(())
    }
}
