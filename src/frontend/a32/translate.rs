//! A32 instruction decoding.
//!
//! Translates a contiguous run of guest instructions into one IR block.
//! Blocks are cut at control flow, at a condition-code change, or at a
//! fixed length cap. An instruction outside the decoded subset ends the
//! block: at the block head it becomes an `Interpret` terminal (handed to
//! the embedder), mid-block it simply terminates the run so the next block
//! starts on it.
//!
//! The subset decoded here is the one whose emission the backend engineers
//! carefully: data-processing with flags, saturating arithmetic, the
//! parallel add/subtract families, word/byte loads and stores, branches,
//! and a VFP slice. Everything else defers to the interpreter callback.

use super::{REG_LR, REG_PC};
use crate::ir::{Arg, Block, Cond, LocationDescriptor, Opcode, Terminal};
use tracing::trace;

/// Maximum guest instructions per block; keeps emitted blocks comfortably
/// inside the per-block spill and size budgets.
const MAX_BLOCK_INSTRUCTIONS: u64 = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct TranslationOptions {
    pub define_unpredictable_behaviour: bool,
}

enum Outcome {
    Continue,
    Term(Terminal),
    /// Not in the decoded subset.
    Undecoded,
}

/// Translate one block starting at `desc`, fetching instruction words
/// through `read_code`.
pub fn translate(
    desc: LocationDescriptor,
    read_code: &mut dyn FnMut(u32) -> u32,
    options: TranslationOptions,
) -> Block {
    let mut trans = Translator {
        block: Block::new(desc),
        desc,
        pc: desc.pc(),
        options,
    };

    if desc.thumb() {
        // Thumb decode is not supported; defer to the interpreter.
        trans.block.add_cycles(1);
        trans.block.set_end_location(desc.advance_pc(2));
        trans
            .block
            .set_terminal(check_halt(Terminal::Interpret {
                next: desc,
                num_instructions: 1,
            }));
        return trans.block;
    }

    loop {
        let insn = read_code(trans.pc);
        let cond_bits = insn >> 28;

        if trans.block.cycle_count() == 0 {
            if cond_bits != 0xF {
                trans.block.set_cond(Cond::from_bits(cond_bits));
            }
        } else if cond_bits == 0xF || Cond::from_bits(cond_bits) != trans.block.cond() {
            // Condition changed: end the run before this instruction.
            trans.finish_fallthrough();
            break;
        }

        let outcome = if cond_bits == 0xF {
            Outcome::Undecoded
        } else {
            trans.decode_one(insn)
        };

        match outcome {
            Outcome::Continue => {
                trans.advance();
                if trans.block.cycle_count() >= MAX_BLOCK_INSTRUCTIONS {
                    trans.finish_fallthrough();
                    break;
                }
            }
            Outcome::Term(terminal) => {
                trans.advance();
                trans.block.set_terminal(check_halt(terminal));
                break;
            }
            Outcome::Undecoded => {
                trace!("undecoded instruction {insn:#010x} at {:#x}", trans.pc);
                if trans.block.cycle_count() == 0 {
                    // Block head: let the embedder interpret it.
                    let here = trans.location_at(trans.pc);
                    trans.advance();
                    trans.block.set_terminal(check_halt(Terminal::Interpret {
                        next: here,
                        num_instructions: 1,
                    }));
                } else {
                    trans.finish_fallthrough();
                }
                break;
            }
        }
    }

    trans.block
}

fn check_halt(inner: Terminal) -> Terminal {
    Terminal::CheckHalt {
        else_: Box::new(inner),
    }
}

struct Translator {
    block: Block,
    desc: LocationDescriptor,
    pc: u32,
    options: TranslationOptions,
}

impl Translator {
    fn advance(&mut self) {
        self.block.add_cycles(1);
        self.pc = self.pc.wrapping_add(4);
        self.block.set_end_location(self.location_at(self.pc));
    }

    fn location_at(&self, pc: u32) -> LocationDescriptor {
        LocationDescriptor::from_value(self.desc.upper_half() | pc as u64)
    }

    fn finish_fallthrough(&mut self) {
        let next = self.location_at(self.pc);
        self.block.set_terminal(check_halt(Terminal::LinkBlock { next }));
    }

    // -- IR building helpers ------------------------------------------

    fn inst(&mut self, op: Opcode, args: [Arg; 3]) -> Arg {
        Arg::Inst(self.block.inst(op, args))
    }

    fn get_reg(&mut self, reg: u8) -> Arg {
        if reg == REG_PC {
            // Reads of the PC observe the current instruction + 8.
            Arg::ImmU32(self.pc.wrapping_add(8))
        } else {
            self.inst(Opcode::GetRegister, [Arg::ImmU8(reg), Arg::Void, Arg::Void])
        }
    }

    fn set_reg(&mut self, reg: u8, value: Arg) {
        debug_assert!(reg != REG_PC);
        self.inst(Opcode::SetRegister, [Arg::ImmU8(reg), value, Arg::Void]);
    }

    fn get_c_flag(&mut self) -> Arg {
        self.inst(Opcode::GetCFlag, [Arg::Void, Arg::Void, Arg::Void])
    }

    fn set_n_z(&mut self, result: Arg) {
        let n = self.inst(Opcode::MostSignificantBit, [result, Arg::Void, Arg::Void]);
        self.inst(Opcode::SetNFlag, [n, Arg::Void, Arg::Void]);
        let z = self.inst(Opcode::IsZero, [result, Arg::Void, Arg::Void]);
        self.inst(Opcode::SetZFlag, [z, Arg::Void, Arg::Void]);
    }

    fn or_q_from_overflow(&mut self, result: Arg) {
        let overflow = self.inst(Opcode::GetOverflowFromOp, [result, Arg::Void, Arg::Void]);
        self.inst(Opcode::OrQFlag, [overflow, Arg::Void, Arg::Void]);
    }

    fn set_ge_from(&mut self, result: Arg) {
        let ge = self.inst(Opcode::GetGEFromOp, [result, Arg::Void, Arg::Void]);
        self.inst(Opcode::SetGEFlags, [ge, Arg::Void, Arg::Void]);
    }

    fn exception(&mut self, exception_code: u32) -> Terminal {
        self.inst(
            Opcode::ExceptionRaised,
            [Arg::ImmU32(self.pc), Arg::ImmU32(exception_code), Arg::Void],
        );
        let next = Arg::ImmU32(self.pc.wrapping_add(4));
        self.inst(Opcode::BranchWritePC, [next, Arg::Void, Arg::Void]);
        Terminal::ReturnToDispatch
    }

    // -- Decode dispatch ----------------------------------------------

    fn decode_one(&mut self, insn: u32) -> Outcome {
        match (insn >> 25) & 0b111 {
            0b000 | 0b001 => self.decode_misc_or_data_processing(insn),
            0b010 => self.decode_load_store_imm(insn),
            0b011 => self.decode_media(insn),
            0b101 => self.decode_branch(insn),
            0b111 => self.decode_coproc_or_svc(insn),
            _ => Outcome::Undecoded,
        }
    }

    fn decode_misc_or_data_processing(&mut self, insn: u32) -> Outcome {
        if insn & 0x0FFF_FFF0 == 0x012F_FF10 {
            return self.branch_exchange(insn);
        }
        if insn & 0x0FF0_00F0 == 0x0120_0070 {
            return Outcome::Term(self.exception(crate::config::EXC_BREAKPOINT));
        }
        if insn & 0x0F90_00F0 == 0x0100_0050 {
            return self.saturating_add_sub(insn);
        }
        if insn & 0x0E00_0000 == 0 {
            // Multiplies and the extra load/store encodings live in the
            // bit7 & bit4 corner of the register data-processing space.
            if insn & 0x0000_0090 == 0x0000_0090 {
                return Outcome::Undecoded;
            }
        }
        self.data_processing(insn)
    }

    fn decode_media(&mut self, insn: u32) -> Outcome {
        if insn & 0x0FF0_00F0 == 0x07F0_00F0 {
            // UDF: the permanently undefined encoding.
            return Outcome::Term(self.exception(crate::config::EXC_UNDEFINED));
        }
        if insn & 0x0FF0_0FF0 == 0x0680_0FB0 {
            return self.select_bytes(insn);
        }
        if insn & 0x0FE0_0030 == 0x06A0_0010 {
            return self.saturate(insn, true);
        }
        if insn & 0x0FE0_0030 == 0x06E0_0010 {
            return self.saturate(insn, false);
        }
        if insn & 0x0F00_0F10 == 0x0600_0F10 {
            return self.parallel_add_sub(insn);
        }
        Outcome::Undecoded
    }

    // -- Branches ------------------------------------------------------

    fn decode_branch(&mut self, insn: u32) -> Outcome {
        let link = insn & (1 << 24) != 0;
        let offset = ((insn << 8) as i32) >> 6; // sign-extended imm24 * 4
        let target = self.pc.wrapping_add(8).wrapping_add(offset as u32);

        if link {
            let ret = self.pc.wrapping_add(4);
            self.set_reg(REG_LR, Arg::ImmU32(ret));
            let ret_desc = self.location_at(ret);
            self.inst(
                Opcode::PushRSB,
                [Arg::ImmU64(ret_desc.value()), Arg::Void, Arg::Void],
            );
        }
        Outcome::Term(Terminal::LinkBlock {
            next: self.location_at(target),
        })
    }

    fn branch_exchange(&mut self, insn: u32) -> Outcome {
        let rm = (insn & 0xF) as u8;
        let target = self.get_reg(rm);
        self.inst(Opcode::BranchWritePC, [target, Arg::Void, Arg::Void]);
        Outcome::Term(Terminal::PopRSBHint)
    }

    fn decode_coproc_or_svc(&mut self, insn: u32) -> Outcome {
        if insn & 0x0F00_0000 == 0x0F00_0000 {
            let imm = insn & 0x00FF_FFFF;
            self.inst(Opcode::CallSupervisor, [Arg::ImmU32(imm), Arg::Void, Arg::Void]);
            return Outcome::Term(Terminal::LinkBlock {
                next: self.location_at(self.pc.wrapping_add(4)),
            });
        }
        self.decode_vfp(insn)
    }

    // -- Data processing -----------------------------------------------

    /// Decode the shifter operand; returns (value, carry-out). The carry is
    /// `Arg::Void` unless requested.
    fn shifter_operand(&mut self, insn: u32, need_carry: bool) -> Option<(Arg, Arg)> {
        if insn & (1 << 25) != 0 {
            // Rotated 8-bit immediate.
            let rotate = ((insn >> 8) & 0xF) * 2;
            let imm = (insn & 0xFF).rotate_right(rotate);
            let carry = if !need_carry {
                Arg::Void
            } else if rotate == 0 {
                self.get_c_flag()
            } else {
                Arg::ImmU8((imm >> 31) as u8)
            };
            return Some((Arg::ImmU32(imm), carry));
        }

        let rm = (insn & 0xF) as u8;
        let shift_type = (insn >> 5) & 0b11;
        let value = self.get_reg(rm);

        if insn & (1 << 4) == 0 {
            // Immediate shift count.
            let imm5 = ((insn >> 7) & 0x1F) as u8;
            let (op, amount) = match (shift_type, imm5) {
                (0b00, 0) => {
                    let carry = if need_carry { self.get_c_flag() } else { Arg::Void };
                    return Some((value, carry));
                }
                (0b00, n) => (Opcode::LogicalShiftLeft, n),
                (0b01, 0) => (Opcode::LogicalShiftRight, 32),
                (0b01, n) => (Opcode::LogicalShiftRight, n),
                (0b10, 0) => (Opcode::ArithmeticShiftRight, 32),
                (0b10, n) => (Opcode::ArithmeticShiftRight, n),
                (0b11, 0) => {
                    // RRX always consumes the carry, whether or not the
                    // carry-out is observed.
                    let carry_in = self.get_c_flag();
                    let result =
                        self.inst(Opcode::RotateRightExtended, [value, carry_in, Arg::Void]);
                    let carry = self.carry_from(result, need_carry);
                    return Some((result, carry));
                }
                (0b11, n) => (Opcode::RotateRight, n),
                _ => unreachable!(),
            };
            let result = self.inst(op, [value, Arg::ImmU8(amount), Arg::ImmU8(0)]);
            let carry = self.carry_from(result, need_carry);
            Some((result, carry))
        } else {
            // Register shift count; bit7 must be clear here (checked by the
            // caller). Shifting by r15 is unpredictable.
            let rs = ((insn >> 8) & 0xF) as u8;
            if rs == REG_PC || rm == REG_PC {
                return None;
            }
            let amount = self.get_reg(rs);
            let carry_in = self.get_c_flag();
            let op = match shift_type {
                0b00 => Opcode::LogicalShiftLeft,
                0b01 => Opcode::LogicalShiftRight,
                0b10 => Opcode::ArithmeticShiftRight,
                _ => Opcode::RotateRight,
            };
            let result = self.inst(op, [value, amount, carry_in]);
            let carry = self.carry_from(result, need_carry);
            Some((result, carry))
        }
    }

    fn carry_from(&mut self, result: Arg, need_carry: bool) -> Arg {
        if need_carry {
            self.inst(Opcode::GetCarryFromOp, [result, Arg::Void, Arg::Void])
        } else {
            Arg::Void
        }
    }

    fn data_processing(&mut self, insn: u32) -> Outcome {
        let opcode = (insn >> 21) & 0xF;
        let s = insn & (1 << 20) != 0;
        let rn = ((insn >> 16) & 0xF) as u8;
        let rd = ((insn >> 12) & 0xF) as u8;

        // Opcodes 0b10xx without S are the MSR/MRS space.
        if !s && (0b1000..=0b1011).contains(&opcode) {
            return Outcome::Undecoded;
        }
        // Data-processing writes to the PC branch; defer those.
        if rd == REG_PC && !(0b1000..=0b1011).contains(&opcode) {
            return Outcome::Undecoded;
        }

        let is_logical = matches!(opcode, 0b0000 | 0b0001 | 0b1000 | 0b1001 | 0b1100 | 0b1101 | 0b1110 | 0b1111);
        let need_shift_carry = s && is_logical;

        let Some((shifter, shifter_carry)) = self.shifter_operand(insn, need_shift_carry) else {
            return self.unpredictable();
        };

        let mut arithmetic = true;
        let result = match opcode {
            0b0000 | 0b1000 => {
                arithmetic = false;
                let a = self.get_reg(rn);
                self.inst(Opcode::And, [a, shifter, Arg::Void])
            }
            0b0001 | 0b1001 => {
                arithmetic = false;
                let a = self.get_reg(rn);
                self.inst(Opcode::Eor, [a, shifter, Arg::Void])
            }
            0b0010 | 0b1010 => {
                let a = self.get_reg(rn);
                self.inst(Opcode::Sub, [a, shifter, Arg::ImmU8(1)])
            }
            0b0011 => {
                let a = self.get_reg(rn);
                self.inst(Opcode::Sub, [shifter, a, Arg::ImmU8(1)])
            }
            0b0100 | 0b1011 => {
                let a = self.get_reg(rn);
                self.inst(Opcode::Add, [a, shifter, Arg::ImmU8(0)])
            }
            0b0101 => {
                let a = self.get_reg(rn);
                let c = self.get_c_flag();
                self.inst(Opcode::Add, [a, shifter, c])
            }
            0b0110 => {
                let a = self.get_reg(rn);
                let c = self.get_c_flag();
                self.inst(Opcode::Sub, [a, shifter, c])
            }
            0b0111 => {
                let a = self.get_reg(rn);
                let c = self.get_c_flag();
                self.inst(Opcode::Sub, [shifter, a, c])
            }
            0b1100 => {
                arithmetic = false;
                let a = self.get_reg(rn);
                self.inst(Opcode::Or, [a, shifter, Arg::Void])
            }
            0b1101 => {
                arithmetic = false;
                shifter
            }
            0b1110 => {
                arithmetic = false;
                let a = self.get_reg(rn);
                let not_b = self.inst(Opcode::Not, [shifter, Arg::Void, Arg::Void]);
                self.inst(Opcode::And, [a, not_b, Arg::Void])
            }
            _ => {
                arithmetic = false;
                self.inst(Opcode::Not, [shifter, Arg::Void, Arg::Void])
            }
        };

        // Compare/test opcodes do not write a register.
        if !(0b1000..=0b1011).contains(&opcode) {
            self.set_reg(rd, result);
        }

        if s {
            self.set_n_z(result);
            if arithmetic {
                let carry = self.inst(Opcode::GetCarryFromOp, [result, Arg::Void, Arg::Void]);
                self.inst(Opcode::SetCFlag, [carry, Arg::Void, Arg::Void]);
                let overflow = self.inst(Opcode::GetOverflowFromOp, [result, Arg::Void, Arg::Void]);
                self.inst(Opcode::SetVFlag, [overflow, Arg::Void, Arg::Void]);
            } else if shifter_carry != Arg::Void {
                self.inst(Opcode::SetCFlag, [shifter_carry, Arg::Void, Arg::Void]);
            }
        }

        Outcome::Continue
    }

    fn unpredictable(&mut self) -> Outcome {
        if self.options.define_unpredictable_behaviour {
            Outcome::Term(self.exception(crate::config::EXC_UNPREDICTABLE))
        } else {
            Outcome::Undecoded
        }
    }

    // -- Saturating arithmetic ----------------------------------------

    fn saturating_add_sub(&mut self, insn: u32) -> Outcome {
        let op = (insn >> 21) & 0b11;
        if op >= 0b10 {
            // QDADD/QDSUB (doubling forms) defer to the interpreter.
            return Outcome::Undecoded;
        }
        let rn = ((insn >> 16) & 0xF) as u8;
        let rd = ((insn >> 12) & 0xF) as u8;
        let rm = (insn & 0xF) as u8;
        if rd == REG_PC {
            return self.unpredictable();
        }

        let a = self.get_reg(rm);
        let b = self.get_reg(rn);
        let opcode = if op == 0 {
            Opcode::SignedSaturatedAdd
        } else {
            Opcode::SignedSaturatedSub
        };
        let result = self.inst(opcode, [a, b, Arg::Void]);
        self.or_q_from_overflow(result);
        self.set_reg(rd, result);
        Outcome::Continue
    }

    /// SSAT/USAT with an optionally shifted operand.
    fn saturate(&mut self, insn: u32, signed: bool) -> Outcome {
        let sat_imm = ((insn >> 16) & 0x1F) as u8;
        let rd = ((insn >> 12) & 0xF) as u8;
        let imm5 = ((insn >> 7) & 0x1F) as u8;
        let asr = insn & (1 << 6) != 0;
        let rm = (insn & 0xF) as u8;
        if rd == REG_PC || rm == REG_PC {
            return self.unpredictable();
        }

        let value = self.get_reg(rm);
        let operand = match (asr, imm5) {
            (false, 0) => value,
            (false, n) => self.inst(
                Opcode::LogicalShiftLeft,
                [value, Arg::ImmU8(n), Arg::ImmU8(0)],
            ),
            (true, 0) => self.inst(
                Opcode::ArithmeticShiftRight,
                [value, Arg::ImmU8(32), Arg::ImmU8(0)],
            ),
            (true, n) => self.inst(
                Opcode::ArithmeticShiftRight,
                [value, Arg::ImmU8(n), Arg::ImmU8(0)],
            ),
        };

        let result = if signed {
            let n = sat_imm + 1;
            self.inst(Opcode::SignedSaturation, [operand, Arg::ImmU8(n), Arg::Void])
        } else {
            self.inst(
                Opcode::UnsignedSaturation,
                [operand, Arg::ImmU8(sat_imm), Arg::Void],
            )
        };
        self.or_q_from_overflow(result);
        self.set_reg(rd, result);
        Outcome::Continue
    }

    // -- Parallel add/subtract ----------------------------------------

    fn parallel_add_sub(&mut self, insn: u32) -> Outcome {
        use Opcode::*;
        let op1 = (insn >> 20) & 0b111;
        let op2 = (insn >> 5) & 0b111;
        let rn = ((insn >> 16) & 0xF) as u8;
        let rd = ((insn >> 12) & 0xF) as u8;
        let rm = (insn & 0xF) as u8;
        if rd == REG_PC || rn == REG_PC || rm == REG_PC {
            return self.unpredictable();
        }

        // op1: 001 signed, 011 signed halving, 101 unsigned,
        // 111 unsigned halving. The saturating rows (Q/UQ) are deferred.
        let (signed, halving) = match op1 {
            0b001 => (true, false),
            0b011 => (true, true),
            0b101 => (false, false),
            0b111 => (false, true),
            _ => return Outcome::Undecoded,
        };

        let opcode = match (op2, signed, halving) {
            (0b000, true, false) => PackedAddS16,
            (0b000, true, true) => PackedHalvingAddS16,
            (0b000, false, false) => PackedAddU16,
            (0b000, false, true) => PackedHalvingAddU16,
            (0b001, true, false) => PackedAddSubS16,
            (0b001, true, true) => PackedHalvingAddSubS16,
            (0b001, false, false) => PackedAddSubU16,
            (0b001, false, true) => PackedHalvingAddSubU16,
            (0b010, true, false) => PackedSubAddS16,
            (0b010, true, true) => PackedHalvingSubAddS16,
            (0b010, false, false) => PackedSubAddU16,
            (0b010, false, true) => PackedHalvingSubAddU16,
            (0b011, true, false) => PackedSubS16,
            (0b011, true, true) => PackedHalvingSubS16,
            (0b011, false, false) => PackedSubU16,
            (0b011, false, true) => PackedHalvingSubU16,
            (0b100, true, false) => PackedAddS8,
            (0b100, true, true) => PackedHalvingAddS8,
            (0b100, false, false) => PackedAddU8,
            (0b100, false, true) => PackedHalvingAddU8,
            (0b111, true, false) => PackedSubS8,
            (0b111, true, true) => PackedHalvingSubS8,
            (0b111, false, false) => PackedSubU8,
            (0b111, false, true) => PackedHalvingSubU8,
            _ => return Outcome::Undecoded,
        };

        let a = self.get_reg(rn);
        let b = self.get_reg(rm);
        let result = self.inst(opcode, [a, b, Arg::Void]);
        if !halving {
            self.set_ge_from(result);
        }
        self.set_reg(rd, result);
        Outcome::Continue
    }

    fn select_bytes(&mut self, insn: u32) -> Outcome {
        let rn = ((insn >> 16) & 0xF) as u8;
        let rd = ((insn >> 12) & 0xF) as u8;
        let rm = (insn & 0xF) as u8;
        if rd == REG_PC || rn == REG_PC || rm == REG_PC {
            return self.unpredictable();
        }

        let ge = self.inst(Opcode::GetGEFlags, [Arg::Void, Arg::Void, Arg::Void]);
        let if_set = self.get_reg(rn);
        let if_clear = self.get_reg(rm);
        let result = self.inst(Opcode::PackedSelect, [ge, if_set, if_clear]);
        self.set_reg(rd, result);
        Outcome::Continue
    }

    // -- Loads and stores ----------------------------------------------

    fn decode_load_store_imm(&mut self, insn: u32) -> Outcome {
        let p = insn & (1 << 24) != 0;
        let u = insn & (1 << 23) != 0;
        let byte = insn & (1 << 22) != 0;
        let w = insn & (1 << 21) != 0;
        let load = insn & (1 << 20) != 0;
        let rn = ((insn >> 16) & 0xF) as u8;
        let rd = ((insn >> 12) & 0xF) as u8;
        let imm12 = insn & 0xFFF;

        // Only offset addressing; post-indexing and writeback defer.
        if !p || w || rd == REG_PC {
            return Outcome::Undecoded;
        }

        let base = self.get_reg(rn);
        let address = if u {
            self.inst(Opcode::Add, [base, Arg::ImmU32(imm12), Arg::ImmU8(0)])
        } else {
            self.inst(Opcode::Sub, [base, Arg::ImmU32(imm12), Arg::ImmU8(1)])
        };

        match (load, byte) {
            (true, false) => {
                let value = self.inst(Opcode::ReadMemory32, [address, Arg::Void, Arg::Void]);
                self.set_reg(rd, value);
            }
            (true, true) => {
                let value = self.inst(Opcode::ReadMemory8, [address, Arg::Void, Arg::Void]);
                self.set_reg(rd, value);
            }
            (false, false) => {
                let value = self.get_reg(rd);
                self.inst(Opcode::WriteMemory32, [address, value, Arg::Void]);
            }
            (false, true) => {
                let value = self.get_reg(rd);
                self.inst(Opcode::WriteMemory8, [address, value, Arg::Void]);
            }
        }
        Outcome::Continue
    }

    // -- VFP ------------------------------------------------------------

    fn decode_vfp(&mut self, insn: u32) -> Outcome {
        // VFP data processing: cond 1110 ... coproc 101x, bit4 = 0.
        if insn & 0x0F00_0E10 != 0x0E00_0A00 {
            return Outcome::Undecoded;
        }
        let double = insn & (1 << 8) != 0;

        let d = vfp_reg(double, (insn >> 12) & 0xF, (insn >> 22) & 1);
        let n = vfp_reg(double, (insn >> 16) & 0xF, (insn >> 7) & 1);
        let m = vfp_reg(double, insn & 0xF, (insn >> 5) & 1);

        if insn & 0x00B0_0E00 == 0x0030_0A00 {
            // VADD / VSUB share opc1; opc3 bit6 picks.
            let sub = insn & (1 << 6) != 0;
            let op = match (double, sub) {
                (false, false) => Opcode::FPAdd32,
                (false, true) => Opcode::FPSub32,
                (true, false) => Opcode::FPAdd64,
                (true, true) => Opcode::FPSub64,
            };
            return self.vfp_binary(op, double, d, n, m);
        }
        if insn & 0x00B0_0E40 == 0x0020_0A00 {
            let op = if double { Opcode::FPMul64 } else { Opcode::FPMul32 };
            return self.vfp_binary(op, double, d, n, m);
        }
        if insn & 0x00B0_0E40 == 0x0080_0A00 {
            let op = if double { Opcode::FPDiv64 } else { Opcode::FPDiv32 };
            return self.vfp_binary(op, double, d, n, m);
        }

        // The "other data-processing" rows: opc1 = 1x11.
        if insn & 0x00B0_0A00 != 0x00B0_0A00 {
            return Outcome::Undecoded;
        }
        let opc2 = (insn >> 16) & 0xF;
        let opc3 = (insn >> 6) & 0b11;

        match (opc2, opc3) {
            (0b0000, 0b01) => {
                // VMOV register
                let value = self.vfp_get(double, m);
                self.vfp_set(double, d, value);
                Outcome::Continue
            }
            (0b0000, 0b11) => {
                let op = if double { Opcode::FPAbs64 } else { Opcode::FPAbs32 };
                self.vfp_unary(op, double, d, m)
            }
            (0b0001, 0b01) => {
                let op = if double { Opcode::FPNeg64 } else { Opcode::FPNeg32 };
                self.vfp_unary(op, double, d, m)
            }
            (0b0001, 0b11) => {
                let op = if double { Opcode::FPSqrt64 } else { Opcode::FPSqrt32 };
                self.vfp_unary(op, double, d, m)
            }
            (0b0111, 0b11) => {
                // VCVT between single and double. sz names the source.
                let value = self.vfp_get(double, m);
                let (op, dst_double) = if double {
                    (Opcode::FPDoubleToSingle, false)
                } else {
                    (Opcode::FPSingleToDouble, true)
                };
                let dst = vfp_reg(dst_double, (insn >> 12) & 0xF, (insn >> 22) & 1);
                let result = self.inst(op, [value, Arg::Void, Arg::Void]);
                self.vfp_set(dst_double, dst, result);
                Outcome::Continue
            }
            (0b1000, _) if opc3 & 1 == 1 => {
                // VCVT from integer; bit7 selects signedness. The source is
                // always a single register.
                let signed = insn & (1 << 7) != 0;
                let src = vfp_reg(false, insn & 0xF, (insn >> 5) & 1);
                let value = self.inst(
                    Opcode::GetExtendedRegister32,
                    [Arg::ImmU8(src), Arg::Void, Arg::Void],
                );
                let op = match (double, signed) {
                    (false, true) => Opcode::FPS32ToSingle,
                    (false, false) => Opcode::FPU32ToSingle,
                    (true, true) => Opcode::FPS32ToDouble,
                    (true, false) => Opcode::FPU32ToDouble,
                };
                let result = self.inst(op, [value, Arg::Void, Arg::Void]);
                self.vfp_set(double, d, result);
                Outcome::Continue
            }
            (0b1100 | 0b1101, _) if opc3 & 1 == 1 => {
                // VCVT to integer; opc2 bit0 selects signedness, bit7
                // selects round-towards-zero over the FPSCR mode. The
                // destination is always a single register.
                let to_signed = opc2 & 1 != 0;
                let round_towards_zero = insn & (1 << 7) != 0;
                let dst = vfp_reg(false, (insn >> 12) & 0xF, (insn >> 22) & 1);
                let value = self.vfp_get(double, m);
                let op = match (double, to_signed) {
                    (false, true) => Opcode::FPSingleToS32,
                    (false, false) => Opcode::FPSingleToU32,
                    (true, true) => Opcode::FPDoubleToS32,
                    (true, false) => Opcode::FPDoubleToU32,
                };
                let result = self.inst(
                    op,
                    [value, Arg::ImmU8(round_towards_zero as u8), Arg::Void],
                );
                self.inst(
                    Opcode::SetExtendedRegister32,
                    [Arg::ImmU8(dst), result, Arg::Void],
                );
                Outcome::Continue
            }
            _ => Outcome::Undecoded,
        }
    }

    fn vfp_get(&mut self, double: bool, index: u8) -> Arg {
        let op = if double {
            Opcode::GetExtendedRegister64
        } else {
            Opcode::GetExtendedRegister32
        };
        self.inst(op, [Arg::ImmU8(index), Arg::Void, Arg::Void])
    }

    fn vfp_set(&mut self, double: bool, index: u8, value: Arg) {
        let op = if double {
            Opcode::SetExtendedRegister64
        } else {
            Opcode::SetExtendedRegister32
        };
        self.inst(op, [Arg::ImmU8(index), value, Arg::Void]);
    }

    fn vfp_binary(&mut self, op: Opcode, double: bool, d: u8, n: u8, m: u8) -> Outcome {
        let a = self.vfp_get(double, n);
        let b = self.vfp_get(double, m);
        let result = self.inst(op, [a, b, Arg::Void]);
        self.vfp_set(double, d, result);
        Outcome::Continue
    }

    fn vfp_unary(&mut self, op: Opcode, double: bool, d: u8, m: u8) -> Outcome {
        let value = self.vfp_get(double, m);
        let result = self.inst(op, [value, Arg::Void, Arg::Void]);
        self.vfp_set(double, d, result);
        Outcome::Continue
    }
}

/// VFP register number from its split encoding: singles interleave the
/// extra bit low, doubles carry it high.
fn vfp_reg(double: bool, base: u32, extra: u32) -> u8 {
    if double {
        ((extra << 4) | base) as u8
    } else {
        ((base << 1) | extra) as u8
    }
}
