//! Floating-point emission under the guest's FPSCR policies.
//!
//! Every arithmetic op is bracketed by up to three transformations chosen
//! by the block's FPSCR snapshot: flush-to-zero on subnormal inputs (sets
//! the IDC sticky flag), flush-to-zero on a subnormal result (sets UFC),
//! and default-NaN substitution. Conversions to integer saturate the way
//! the guest requires, papering over the host's 0x80000000 sentinel by
//! clamping in double precision between the two conversions.

use super::code_buffer::{Alu, CodeBuffer, Label, CC_A, CC_NP, R15};
use super::emit::{EmitContext, Emitter};
use super::jit_state::{JitState, FPSCR_IDC, FPSCR_UFC};
use super::reg_alloc::RegAlloc;
use crate::ir::{Inst, InstRef, Opcode, Type};

const F32_DEFAULT_NAN: u64 = 0x7FC0_0000;
const F64_DEFAULT_NAN: u64 = 0x7FF8_0000_0000_0000;
const F32_NON_SIGN_MASK: u32 = 0x7FFF_FFFF;
const F64_NON_SIGN_MASK: u64 = 0x7FFF_FFFF_FFFF_FFFF;
// abs(x) - 1 compared against these detects a nonzero subnormal.
const F32_PENULTIMATE_DENORMAL: u32 = 0x007F_FFFE;
const F64_PENULTIMATE_DENORMAL: u64 = 0x000F_FFFF_FFFF_FFFE;

const MOVSS_PREFIX: u8 = 0xF3;
const MOVSD_PREFIX: u8 = 0xF2;
const OP_MOVS: u8 = 0x10;
const OP_SQRT: u8 = 0x51;
const OP_CVT_FP2FP: u8 = 0x5A;
const OP_MIN: u8 = 0x5D;
const OP_MAX: u8 = 0x5F;
const OP_UCOMIS: u8 = 0x2E;
const OP_PAND: u8 = 0xDB;

fn precision_of(op: Opcode) -> bool {
    // true = f64
    use Opcode::*;
    matches!(
        op,
        FPAbs64 | FPNeg64 | FPAdd64 | FPSub64 | FPMul64 | FPDiv64 | FPSqrt64 | FPDoubleToSingle
            | FPDoubleToS32 | FPDoubleToU32
    )
}

impl Emitter {
    /// If `xmm_value` holds a nonzero subnormal, replace it with +0 and set
    /// the given FPSCR sticky flag.
    fn flush_subnormal32(
        buf: &mut CodeBuffer,
        regs: &mut RegAlloc,
        xmm_value: u8,
        sticky_flag: u32,
    ) {
        let gpr_scratch = regs.scratch_gpr();
        let mut end = Label::new();
        buf.movd_reg32_xmm(gpr_scratch, xmm_value);
        buf.alu_reg_imm32(Alu::And, gpr_scratch, F32_NON_SIGN_MASK);
        buf.alu_reg_imm32(Alu::Sub, gpr_scratch, 1);
        buf.alu_reg_imm32(Alu::Cmp, gpr_scratch, F32_PENULTIMATE_DENORMAL);
        buf.jcc_label(CC_A, &mut end);
        buf.sse_reg_reg(Some(0x66), 0xEF, xmm_value, xmm_value); // pxor
        buf.alu_mem32_imm32(Alu::Or, R15, JitState::off_fpscr_exc(), sticky_flag);
        buf.bind(&mut end);
    }

    fn flush_subnormal64(
        buf: &mut CodeBuffer,
        regs: &mut RegAlloc,
        xmm_value: u8,
        sticky_flag: u32,
    ) {
        let gpr_scratch = regs.scratch_gpr();
        let gpr_const = regs.scratch_gpr();
        let mut end = Label::new();
        buf.movq_reg64_xmm(gpr_scratch, xmm_value);
        buf.mov_reg_imm64(gpr_const, F64_NON_SIGN_MASK);
        buf.alu_reg_reg64(Alu::And, gpr_scratch, gpr_const);
        buf.alu_reg64_imm8(Alu::Sub, gpr_scratch, 1);
        buf.mov_reg_imm64(gpr_const, F64_PENULTIMATE_DENORMAL);
        buf.alu_reg_reg64(Alu::Cmp, gpr_scratch, gpr_const);
        buf.jcc_label(CC_A, &mut end);
        buf.sse_reg_reg(Some(0x66), 0xEF, xmm_value, xmm_value);
        buf.alu_mem32_imm32(Alu::Or, R15, JitState::off_fpscr_exc(), sticky_flag);
        buf.bind(&mut end);
    }

    /// Replace a NaN result with the canonical default NaN of the
    /// precision.
    fn default_nan(buf: &mut CodeBuffer, f64_precision: bool, xmm_value: u8) {
        let mut end = Label::new();
        let (prefix, nan_bits) = if f64_precision {
            (Some(0x66), F64_DEFAULT_NAN)
        } else {
            (None, F32_DEFAULT_NAN)
        };
        buf.sse_reg_reg(prefix, OP_UCOMIS, xmm_value, xmm_value);
        buf.jcc_label(CC_NP, &mut end);
        let pool = buf.const_pool_ref(nan_bits);
        let mov_prefix = if f64_precision { MOVSD_PREFIX } else { MOVSS_PREFIX };
        buf.sse_reg_rip(Some(mov_prefix), OP_MOVS, xmm_value, pool);
        buf.bind(&mut end);
    }

    /// Zero `xmm_value` if it is NaN (double precision compare).
    fn zero_if_nan64(buf: &mut CodeBuffer, regs: &mut RegAlloc, xmm_value: u8) {
        let xmm_scratch = regs.scratch_xmm();
        buf.sse_reg_reg(Some(0x66), 0xEF, xmm_scratch, xmm_scratch); // pxor
        buf.cmpsd_reg_reg_imm8(xmm_scratch, xmm_value, 7); // ordered mask
        buf.sse_reg_reg(Some(0x66), OP_PAND, xmm_value, xmm_scratch);
    }

    /// Sign-manipulation ops; these are bit operations with no FTZ/DN
    /// involvement.
    pub(super) fn emit_fp_sign_op(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        use Opcode::*;
        let f64_precision = precision_of(inst.op);
        let reg = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        if f64_precision {
            let mask = ctx.regs.scratch_gpr();
            match inst.op {
                FPAbs64 => {
                    ctx.buf.mov_reg_imm64(mask, F64_NON_SIGN_MASK);
                    ctx.buf.alu_reg_reg64(Alu::And, reg, mask);
                }
                FPNeg64 => {
                    ctx.buf.mov_reg_imm64(mask, !F64_NON_SIGN_MASK);
                    ctx.buf.alu_reg_reg64(Alu::Xor, reg, mask);
                }
                _ => unreachable!(),
            }
            ctx.regs.define_gpr(ctx.buf, inst_ref, reg, Type::F64);
        } else {
            match inst.op {
                FPAbs32 => ctx.buf.alu_reg_imm32(Alu::And, reg, F32_NON_SIGN_MASK),
                FPNeg32 => ctx.buf.alu_reg_imm32(Alu::Xor, reg, !F32_NON_SIGN_MASK),
                _ => unreachable!(),
            }
            ctx.regs.define_gpr(ctx.buf, inst_ref, reg, Type::F32);
        }
    }

    pub(super) fn emit_fp_arith(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        use Opcode::*;
        let f64_precision = precision_of(inst.op);
        let fpscr = ctx.block.location().fpscr();
        let op = match inst.op {
            FPAdd32 | FPAdd64 => 0x58,
            FPSub32 | FPSub64 => 0x5C,
            FPMul32 | FPMul64 => 0x59,
            FPDiv32 | FPDiv64 => 0x5E,
            _ => unreachable!(),
        };
        let prefix = if f64_precision { MOVSD_PREFIX } else { MOVSS_PREFIX };

        let result = ctx.regs.use_scratch_xmm(ctx.buf, inst.args[0]);
        let operand = ctx.regs.use_scratch_xmm(ctx.buf, inst.args[1]);

        if fpscr.ftz() {
            if f64_precision {
                Self::flush_subnormal64(ctx.buf, ctx.regs, result, FPSCR_IDC);
                Self::flush_subnormal64(ctx.buf, ctx.regs, operand, FPSCR_IDC);
            } else {
                Self::flush_subnormal32(ctx.buf, ctx.regs, result, FPSCR_IDC);
                Self::flush_subnormal32(ctx.buf, ctx.regs, operand, FPSCR_IDC);
            }
        }
        ctx.buf.sse_reg_reg(Some(prefix), op, result, operand);
        if fpscr.ftz() {
            if f64_precision {
                Self::flush_subnormal64(ctx.buf, ctx.regs, result, FPSCR_UFC);
            } else {
                Self::flush_subnormal32(ctx.buf, ctx.regs, result, FPSCR_UFC);
            }
        }
        if fpscr.dn() {
            Self::default_nan(ctx.buf, f64_precision, result);
        }

        let ty = if f64_precision { Type::F64 } else { Type::F32 };
        ctx.regs.define_xmm(ctx.buf, inst_ref, result, ty);
    }

    pub(super) fn emit_fp_sqrt(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let f64_precision = precision_of(inst.op);
        let fpscr = ctx.block.location().fpscr();
        let prefix = if f64_precision { MOVSD_PREFIX } else { MOVSS_PREFIX };

        let result = ctx.regs.use_scratch_xmm(ctx.buf, inst.args[0]);
        if fpscr.ftz() {
            if f64_precision {
                Self::flush_subnormal64(ctx.buf, ctx.regs, result, FPSCR_IDC);
            } else {
                Self::flush_subnormal32(ctx.buf, ctx.regs, result, FPSCR_IDC);
            }
        }
        ctx.buf.sse_reg_reg(Some(prefix), OP_SQRT, result, result);
        if fpscr.dn() {
            Self::default_nan(ctx.buf, f64_precision, result);
        }

        let ty = if f64_precision { Type::F64 } else { Type::F32 };
        ctx.regs.define_xmm(ctx.buf, inst_ref, result, ty);
    }

    /// Precision conversion. Widening cannot underflow, so only the input
    /// side is flushed for f32→f64; narrowing flushes both sides.
    pub(super) fn emit_fp_convert(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let to_double = inst.op == Opcode::FPSingleToDouble;
        let fpscr = ctx.block.location().fpscr();

        let value = ctx.regs.use_scratch_xmm(ctx.buf, inst.args[0]);
        if fpscr.ftz() {
            if to_double {
                Self::flush_subnormal32(ctx.buf, ctx.regs, value, FPSCR_IDC);
            } else {
                Self::flush_subnormal64(ctx.buf, ctx.regs, value, FPSCR_IDC);
            }
        }
        let prefix = if to_double { MOVSS_PREFIX } else { MOVSD_PREFIX };
        ctx.buf.sse_reg_reg(Some(prefix), OP_CVT_FP2FP, value, value);
        if fpscr.ftz() && !to_double {
            Self::flush_subnormal32(ctx.buf, ctx.regs, value, FPSCR_UFC);
        }
        if fpscr.dn() {
            Self::default_nan(ctx.buf, to_double, value);
        }

        let ty = if to_double { Type::F64 } else { Type::F32 };
        ctx.regs.define_xmm(ctx.buf, inst_ref, value, ty);
    }

    /// FP → integer with guest saturation. The value is widened to double
    /// (lossless), NaN is zeroed, the range is clamped with minsd/maxsd
    /// against exact bounds, and only then converted, so the host's
    /// out-of-range sentinel can never surface. Unsigned targets are biased
    /// by -2^31 into signed range for the rounded conversion and biased
    /// back in the integer domain; the truncating form converts through a
    /// 64-bit register instead.
    pub(super) fn emit_fp_to_fixed(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        use Opcode::*;
        let from_double = precision_of(inst.op);
        let to_unsigned = matches!(inst.op, FPSingleToU32 | FPDoubleToU32);
        let round_towards_zero = inst.args[1].expect_u8() != 0;
        let fpscr = ctx.block.location().fpscr();

        let from = ctx.regs.use_scratch_xmm(ctx.buf, inst.args[0]);
        let to = ctx.regs.scratch_gpr();

        if fpscr.ftz() {
            if from_double {
                Self::flush_subnormal64(ctx.buf, ctx.regs, from, FPSCR_IDC);
            } else {
                Self::flush_subnormal32(ctx.buf, ctx.regs, from, FPSCR_IDC);
            }
        }
        if !from_double {
            ctx.buf
                .sse_reg_reg(Some(MOVSS_PREFIX), OP_CVT_FP2FP, from, from);
        }
        Self::zero_if_nan64(ctx.buf, ctx.regs, from);

        if to_unsigned {
            let min = ctx.buf.const_pool_ref(0.0f64.to_bits());
            let max = ctx.buf.const_pool_ref(4294967295.0f64.to_bits());
            ctx.buf.sse_reg_rip(Some(MOVSD_PREFIX), OP_MAX, from, min);
            ctx.buf.sse_reg_rip(Some(MOVSD_PREFIX), OP_MIN, from, max);
            if round_towards_zero {
                ctx.buf.cvtfp2si_reg64_xmm(MOVSD_PREFIX, true, to, from);
            } else {
                let bias = ctx.buf.const_pool_ref(2147483648.0f64.to_bits());
                ctx.buf.sse_reg_rip(Some(MOVSD_PREFIX), 0x5C, from, bias); // subsd
                ctx.buf.cvtfp2si_reg32_xmm(MOVSD_PREFIX, false, to, from);
                ctx.buf.alu_reg_imm32(Alu::Add, to, 0x8000_0000);
            }
        } else {
            let min = ctx.buf.const_pool_ref((-2147483648.0f64).to_bits());
            let max = ctx.buf.const_pool_ref(2147483647.0f64.to_bits());
            ctx.buf.sse_reg_rip(Some(MOVSD_PREFIX), OP_MAX, from, min);
            ctx.buf.sse_reg_rip(Some(MOVSD_PREFIX), OP_MIN, from, max);
            ctx.buf
                .cvtfp2si_reg32_xmm(MOVSD_PREFIX, round_towards_zero, to, from);
        }

        ctx.regs.define_gpr(ctx.buf, inst_ref, to, Type::U32);
    }

    /// Integer → FP. Exact for doubles; singles round per the guest MXCSR
    /// image. Unsigned sources convert through a 64-bit register.
    pub(super) fn emit_fixed_to_fp(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        use Opcode::*;
        let (to_double, from_unsigned) = match inst.op {
            FPS32ToSingle => (false, false),
            FPU32ToSingle => (false, true),
            FPS32ToDouble => (true, false),
            FPU32ToDouble => (true, true),
            _ => unreachable!(),
        };
        let prefix = if to_double { MOVSD_PREFIX } else { MOVSS_PREFIX };

        let from = ctx.regs.use_gpr(ctx.buf, inst.args[0]);
        let to = ctx.regs.scratch_xmm();

        ctx.buf.sse_reg_reg(Some(0x66), 0xEF, to, to); // pxor: break the cvtsi2* dependency
        if from_unsigned {
            // The 32-bit load already zero-extended; convert as 64-bit.
            ctx.buf.cvtsi2fp_xmm_reg64(prefix, to, from);
        } else {
            ctx.buf.cvtsi2fp_xmm_reg32(prefix, to, from);
        }

        let ty = if to_double { Type::F64 } else { Type::F32 };
        ctx.regs.define_xmm(ctx.buf, inst_ref, to, ty);
    }
}
