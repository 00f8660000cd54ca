//! Packed (parallel) add/subtract over the four bytes or two halfwords of a
//! 32-bit guest register, with the per-lane GE masks the guest exposes
//! through the CPSR.
//!
//! The element-wise forms ride on SSE over the low lanes of an XMM register;
//! the halving forms use bit identities over GPRs where a carry-free
//! partitioned add is cheaper than widening. GE masks are produced as one
//! 0x00/0xFF byte per lane, matching the jit-state representation.

use super::code_buffer::{Alu, Shift};
use super::emit::{EmitContext, Emitter};
use crate::ir::{Inst, InstRef, Opcode, Type};

// Two-byte SSE opcodes (66 0F xx).
const PADDB: u8 = 0xFC;
const PADDW: u8 = 0xFD;
const PSUBB: u8 = 0xF8;
const PSUBW: u8 = 0xF9;
const PADDSB: u8 = 0xEC;
const PADDSW: u8 = 0xED;
const PSUBSB: u8 = 0xE8;
const PSUBSW: u8 = 0xE9;
const PMINUB: u8 = 0xDA;
const PMAXUB: u8 = 0xDE;
const PCMPEQB: u8 = 0x74;
const PCMPEQW: u8 = 0x75;
const PCMPGTB: u8 = 0x64;
const PCMPGTW: u8 = 0x65;
const PXOR: u8 = 0xEF;
const PUNPCKLBW: u8 = 0x60;
const PACKUSWB: u8 = 0x67;
// Three-byte SSE4.1 opcodes (66 0F 38 xx).
const PMINUW: u8 = 0x3A;
const PMAXUW: u8 = 0x3E;

const OPSIZE: Option<u8> = Some(0x66);

struct PackedKind {
    wide: bool,   // 16-bit lanes
    signed: bool,
    sub: bool,
}

fn classify(op: Opcode) -> PackedKind {
    use Opcode::*;
    match op {
        PackedAddU8 => PackedKind { wide: false, signed: false, sub: false },
        PackedAddS8 => PackedKind { wide: false, signed: true, sub: false },
        PackedSubU8 => PackedKind { wide: false, signed: false, sub: true },
        PackedSubS8 => PackedKind { wide: false, signed: true, sub: true },
        PackedAddU16 => PackedKind { wide: true, signed: false, sub: false },
        PackedAddS16 => PackedKind { wide: true, signed: true, sub: false },
        PackedSubU16 => PackedKind { wide: true, signed: false, sub: true },
        PackedSubS16 => PackedKind { wide: true, signed: true, sub: true },
        _ => unreachable!(),
    }
}

impl Emitter {
    /// Element-wise packed add/sub; when a GE consumer exists, additionally
    /// materialize the per-lane mask:
    /// - unsigned add: lane overflowed iff min(sum, b) != b
    /// - unsigned sub: a >= b iff max(a, b) == a
    /// - signed forms: sign of the saturated result decides
    pub(super) fn emit_packed_add_sub(
        &mut self,
        ctx: &mut EmitContext,
        inst_ref: InstRef,
        inst: Inst,
    ) {
        let kind = classify(inst.op);
        let ge_inst = ctx.block.pseudo_op_of(inst_ref, Opcode::GetGEFromOp);

        let xmm_a = ctx.regs.use_scratch_xmm(ctx.buf, inst.args[0]);
        let xmm_b = ctx.regs.use_xmm(ctx.buf, inst.args[1]);

        if let Some(ge) = ge_inst {
            let xmm_ge = ctx.regs.scratch_xmm();
            let scratch = ctx.regs.scratch_xmm();
            let (cmpeq, cmpgt) = if kind.wide {
                (PCMPEQW, PCMPGTW)
            } else {
                (PCMPEQB, PCMPGTB)
            };

            match (kind.signed, kind.sub) {
                (false, false) => {
                    // min(a + b, b) != b detects the lane carry.
                    ctx.buf.sse_reg_reg(OPSIZE, cmpeq, scratch, scratch); // all ones
                    ctx.buf.sse_reg_reg(None, 0x28, xmm_ge, xmm_a); // movaps
                    ctx.buf
                        .sse_reg_reg(OPSIZE, if kind.wide { PADDW } else { PADDB }, xmm_ge, xmm_b);
                    if kind.wide {
                        ctx.buf.sse41_reg_reg(PMINUW, xmm_ge, xmm_b);
                    } else {
                        ctx.buf.sse_reg_reg(OPSIZE, PMINUB, xmm_ge, xmm_b);
                    }
                    ctx.buf.sse_reg_reg(OPSIZE, cmpeq, xmm_ge, xmm_b);
                    ctx.buf.sse_reg_reg(OPSIZE, PXOR, xmm_ge, scratch);
                }
                (false, true) => {
                    // max(a, b) == a detects a >= b.
                    ctx.buf.sse_reg_reg(None, 0x28, xmm_ge, xmm_a);
                    if kind.wide {
                        ctx.buf.sse41_reg_reg(PMAXUW, xmm_ge, xmm_b);
                    } else {
                        ctx.buf.sse_reg_reg(OPSIZE, PMAXUB, xmm_ge, xmm_b);
                    }
                    ctx.buf.sse_reg_reg(OPSIZE, cmpeq, xmm_ge, xmm_a);
                }
                (true, sub) => {
                    // GE iff the saturated result is non-negative.
                    let saturated_op = match (kind.wide, sub) {
                        (false, false) => PADDSB,
                        (false, true) => PSUBSB,
                        (true, false) => PADDSW,
                        (true, true) => PSUBSW,
                    };
                    ctx.buf.sse_reg_reg(OPSIZE, PXOR, xmm_ge, xmm_ge);
                    ctx.buf.sse_reg_reg(None, 0x28, scratch, xmm_a);
                    ctx.buf.sse_reg_reg(OPSIZE, saturated_op, scratch, xmm_b);
                    ctx.buf.sse_reg_reg(OPSIZE, cmpgt, xmm_ge, scratch); // 0 > saturated
                    ctx.buf.sse_reg_reg(OPSIZE, cmpeq, scratch, scratch); // all ones
                    ctx.buf.sse_reg_reg(OPSIZE, PXOR, xmm_ge, scratch); // invert
                }
            }

            ctx.regs.define_xmm(ctx.buf, ge, xmm_ge, Type::U32);
            ctx.erase_instruction(ge);
        }

        let main_op = match (kind.wide, kind.sub) {
            (false, false) => PADDB,
            (false, true) => PSUBB,
            (true, false) => PADDW,
            (true, true) => PSUBW,
        };
        ctx.buf.sse_reg_reg(OPSIZE, main_op, xmm_a, xmm_b);
        ctx.regs.define_xmm(ctx.buf, inst_ref, xmm_a, Type::U32);
    }

    /// Halving add over bytes or halfwords, via
    /// `(x + y) >> 1 == (x & y) + ((x ^ y) >> 1)` with the per-lane shift
    /// done by masking; signed forms restore each lane's sign bit from
    /// `x ^ y`.
    pub(super) fn emit_packed_halving_add(
        &mut self,
        ctx: &mut EmitContext,
        inst_ref: InstRef,
        inst: Inst,
    ) {
        let (signed, low_mask, sign_mask): (bool, u32, u32) = match inst.op {
            Opcode::PackedHalvingAddU8 => (false, 0x7F7F_7F7F, 0),
            Opcode::PackedHalvingAddS8 => (true, 0x7F7F_7F7F, 0x8080_8080),
            Opcode::PackedHalvingAddU16 => (false, 0x7FFF_7FFF, 0),
            Opcode::PackedHalvingAddS16 => (true, 0x7FFF_7FFF, 0x8000_8000),
            _ => unreachable!(),
        };

        let a = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        let b = ctx.regs.use_gpr(ctx.buf, inst.args[1]);
        let xor_a_b = ctx.regs.scratch_gpr();

        ctx.buf.mov_reg_reg32(xor_a_b, a);
        ctx.buf.alu_reg_reg32(Alu::Xor, xor_a_b, b);
        ctx.buf.alu_reg_reg32(Alu::And, a, b);
        if signed {
            let signs = ctx.regs.scratch_gpr();
            ctx.buf.mov_reg_reg32(signs, xor_a_b);
            ctx.buf.alu_reg_imm32(Alu::And, signs, sign_mask);
            ctx.buf.shift_reg_imm8(Shift::Shr, xor_a_b, 1);
            ctx.buf.alu_reg_imm32(Alu::And, xor_a_b, low_mask);
            ctx.buf.alu_reg_reg32(Alu::Or, xor_a_b, signs);
        } else {
            ctx.buf.shift_reg_imm8(Shift::Shr, xor_a_b, 1);
            ctx.buf.alu_reg_imm32(Alu::And, xor_a_b, low_mask);
        }
        ctx.buf.alu_reg_reg32(Alu::Add, a, xor_a_b);

        ctx.regs.define_gpr(ctx.buf, inst_ref, a, Type::U32);
    }

    /// Halving subtract over bytes: widen to words, subtract, arithmetic
    /// shift, repack. Four lanes fit comfortably below the unpack midpoint.
    pub(super) fn emit_packed_halving_sub8(
        &mut self,
        ctx: &mut EmitContext,
        inst_ref: InstRef,
        inst: Inst,
    ) {
        let signed = inst.op == Opcode::PackedHalvingSubS8;

        let a = ctx.regs.use_scratch_xmm(ctx.buf, inst.args[0]);
        let b = ctx.regs.use_scratch_xmm(ctx.buf, inst.args[1]);
        let zero = ctx.regs.scratch_xmm();

        if signed {
            // Sign-extend bytes to words lane-wise.
            ctx.buf.sse_reg_reg(OPSIZE, PUNPCKLBW, a, a);
            ctx.buf.sse_shift_w_imm(4, a, 8); // psraw
            ctx.buf.sse_reg_reg(OPSIZE, PUNPCKLBW, b, b);
            ctx.buf.sse_shift_w_imm(4, b, 8);
        } else {
            ctx.buf.sse_reg_reg(OPSIZE, PXOR, zero, zero);
            ctx.buf.sse_reg_reg(OPSIZE, PUNPCKLBW, a, zero);
            ctx.buf.sse_reg_reg(OPSIZE, PUNPCKLBW, b, zero);
        }
        ctx.buf.sse_reg_reg(OPSIZE, PSUBW, a, b);
        ctx.buf.sse_shift_w_imm(4, a, 1); // psraw: halve, keeping sign
        // Keep the low byte of each word and repack.
        ctx.buf.sse_shift_w_imm(6, a, 8); // psllw
        ctx.buf.sse_shift_w_imm(2, a, 8); // psrlw
        ctx.buf.sse_reg_reg(OPSIZE, PACKUSWB, a, a);

        ctx.regs.define_xmm(ctx.buf, inst_ref, a, Type::U32);
    }

    /// Halving subtract over halfwords: two lanes, done in GPRs.
    pub(super) fn emit_packed_halving_sub16(
        &mut self,
        ctx: &mut EmitContext,
        inst_ref: InstRef,
        inst: Inst,
    ) {
        let signed = inst.op == Opcode::PackedHalvingSubS16;

        let a_hi = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        let b_hi = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[1]);
        let a_lo = ctx.regs.scratch_gpr();
        let b_lo = ctx.regs.scratch_gpr();

        Self::split_halves(ctx, a_hi, a_lo, signed);
        Self::split_halves(ctx, b_hi, b_lo, signed);

        ctx.buf.alu_reg_reg32(Alu::Sub, a_lo, b_lo);
        ctx.buf.alu_reg_reg32(Alu::Sub, a_hi, b_hi);
        ctx.buf.shift_reg_imm8(Shift::Sar, a_lo, 1);
        ctx.buf.shift_reg_imm8(Shift::Sar, a_hi, 1);

        Self::merge_halves(ctx, a_hi, a_lo);
        ctx.regs.define_gpr(ctx.buf, inst_ref, a_hi, Type::U32);
    }

    /// The exchange forms (ASX/SAX): split each operand into halfwords,
    /// cross-add and cross-subtract, optionally halve, and merge with shld.
    /// GE per half comes from the sign (or carry) of the intermediate
    /// 32-bit sum and difference.
    pub(super) fn emit_packed_cross(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        use Opcode::*;
        let (signed, halving, add_is_hi) = match inst.op {
            PackedAddSubU16 => (false, false, true),
            PackedAddSubS16 => (true, false, true),
            PackedSubAddU16 => (false, false, false),
            PackedSubAddS16 => (true, false, false),
            PackedHalvingAddSubU16 => (false, true, true),
            PackedHalvingAddSubS16 => (true, true, true),
            PackedHalvingSubAddU16 => (false, true, false),
            PackedHalvingSubAddS16 => (true, true, false),
            _ => unreachable!(),
        };
        let ge_inst = ctx.block.pseudo_op_of(inst_ref, Opcode::GetGEFromOp);
        debug_assert!(
            ge_inst.is_none() || !halving,
            "halving exchange forms do not produce GE flags"
        );

        let a_hi = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        let b_hi = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[1]);
        let a_lo = ctx.regs.scratch_gpr();
        let b_lo = ctx.regs.scratch_gpr();

        Self::split_halves(ctx, a_hi, a_lo, signed);
        Self::split_halves(ctx, b_hi, b_lo, signed);

        if add_is_hi {
            // hi: a_hi + b_lo, lo: a_lo - b_hi
            ctx.buf.alu_reg_reg32(Alu::Add, a_hi, b_lo);
            ctx.buf.alu_reg_reg32(Alu::Sub, a_lo, b_hi);
        } else {
            // hi: a_hi - b_lo, lo: a_lo + b_hi
            ctx.buf.alu_reg_reg32(Alu::Sub, a_hi, b_lo);
            ctx.buf.alu_reg_reg32(Alu::Add, a_lo, b_hi);
        }

        if let Some(ge) = ge_inst {
            let ge_hi = ctx.regs.scratch_gpr();
            let ge_lo = ctx.regs.scratch_gpr();
            let (sum_reg, diff_reg, sum_is_hi) =
                if add_is_hi { (a_hi, a_lo, true) } else { (a_lo, a_hi, false) };

            // Sum flag: carry out (unsigned) or non-negative (signed).
            let sum_ge = if sum_is_hi { ge_hi } else { ge_lo };
            ctx.buf.mov_reg_reg32(sum_ge, sum_reg);
            if signed {
                ctx.buf.not_reg32(sum_ge);
                ctx.buf.shift_reg_imm8(Shift::Sar, sum_ge, 31);
            } else {
                ctx.buf.shift_reg_imm8(Shift::Shr, sum_ge, 16);
                ctx.buf.neg_reg32(sum_ge);
            }
            // Difference flag: non-negative for both signednesses.
            let diff_ge = if sum_is_hi { ge_lo } else { ge_hi };
            ctx.buf.mov_reg_reg32(diff_ge, diff_reg);
            ctx.buf.not_reg32(diff_ge);
            ctx.buf.shift_reg_imm8(Shift::Sar, diff_ge, 31);

            ctx.buf.alu_reg_imm32(Alu::And, ge_hi, 0xFFFF_0000);
            ctx.buf.alu_reg_imm32(Alu::And, ge_lo, 0x0000_FFFF);
            ctx.buf.alu_reg_reg32(Alu::Or, ge_hi, ge_lo);

            ctx.regs.define_gpr(ctx.buf, ge, ge_hi, Type::U32);
            ctx.erase_instruction(ge);
        }

        if halving {
            ctx.buf.shift_reg_imm8(Shift::Sar, a_hi, 1);
            ctx.buf.shift_reg_imm8(Shift::Sar, a_lo, 1);
        }

        Self::merge_halves(ctx, a_hi, a_lo);
        ctx.regs.define_gpr(ctx.buf, inst_ref, a_hi, Type::U32);
    }

    /// SEL: per-byte select between two registers using the GE mask.
    /// `result = if_clear ^ ((if_clear ^ if_set) & mask)`.
    pub(super) fn emit_packed_select(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let ge = ctx.regs.use_gpr(ctx.buf, inst.args[0]);
        let if_set = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[1]);
        let if_clear = ctx.regs.use_gpr(ctx.buf, inst.args[2]);

        ctx.buf.alu_reg_reg32(Alu::Xor, if_set, if_clear);
        ctx.buf.alu_reg_reg32(Alu::And, if_set, ge);
        ctx.buf.alu_reg_reg32(Alu::Xor, if_set, if_clear);

        ctx.regs.define_gpr(ctx.buf, inst_ref, if_set, Type::U32);
    }

    /// Split `hi` (holding the full value) into a zero/sign-extended low
    /// half in `lo` and shift the top half down in place.
    fn split_halves(ctx: &mut EmitContext, hi: u8, lo: u8, signed: bool) {
        if signed {
            ctx.buf.movsx_reg_reg16(lo, hi);
            ctx.buf.shift_reg_imm8(Shift::Sar, hi, 16);
        } else {
            ctx.buf.movzx_reg_reg16(lo, hi);
            ctx.buf.shift_reg_imm8(Shift::Shr, hi, 16);
        }
    }

    /// Merge the low halfwords of `hi` and `lo` into `hi` as hi:lo.
    fn merge_halves(ctx: &mut EmitContext, hi: u8, lo: u8) {
        ctx.buf.shift_reg_imm8(Shift::Shl, lo, 16);
        ctx.buf.shld_reg_reg_imm8(hi, lo, 16);
    }
}
