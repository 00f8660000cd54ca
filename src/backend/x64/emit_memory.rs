//! Guest load/store emission.
//!
//! Three strategies, chosen at jit construction:
//! - fastmem: one contiguous host mapping, host = base + guest_va;
//! - TLB: inline direct-mapped probe with a per-axis tag check, falling
//!   back to the embedder's memory callbacks on a miss;
//! - callbacks only.
//!
//! The probe indexes `entries[(va >> page_bits) & index_mask]` and hits iff
//! the axis tag equals the page base of the access. A hit yields
//! `host_base + (va & page_mask)`.

use super::code_buffer::{Alu, CodeBuffer, Label, Shift, CC_NE, RAX, RDI, RDX, RSI, R15};
use super::emit::{EmitContext, Emitter};
use super::MemoryConfig;
use crate::ir::{Inst, InstRef, Opcode, Type};
use crate::tlb::{TLB_ENTRY_SHIFT, TLB_OFF_HOST_BASE, TLB_OFF_READ, TLB_OFF_WRITE};

#[derive(Clone, Copy, PartialEq)]
enum Axis {
    Read,
    Write,
}

impl Axis {
    fn tag_offset(self) -> i32 {
        match self {
            Axis::Read => TLB_OFF_READ,
            Axis::Write => TLB_OFF_WRITE,
        }
    }
}

fn access_bits(op: Opcode) -> u32 {
    match op {
        Opcode::ReadMemory8 | Opcode::WriteMemory8 => 8,
        Opcode::ReadMemory16 | Opcode::WriteMemory16 => 16,
        Opcode::ReadMemory32 | Opcode::WriteMemory32 => 32,
        Opcode::ReadMemory64 | Opcode::WriteMemory64 => 64,
        _ => unreachable!(),
    }
}

impl Emitter {
    /// Probe the TLB for `vaddr`; on a hit, fall through with the host
    /// address in `host` and the in-page offset in `tmp`. On a miss, jump
    /// to `slow`.
    #[allow(clippy::too_many_arguments)]
    fn emit_tlb_probe(
        buf: &mut CodeBuffer,
        mem: &MemoryConfig,
        axis: Axis,
        vaddr: u8,
        tmp: u8,
        host: u8,
        slow: &mut Label,
    ) {
        let page_mask = (1u32 << mem.page_bits) - 1;

        buf.mov_reg_reg32(tmp, vaddr);
        buf.shift_reg_imm8(Shift::Shr, tmp, mem.page_bits as u8);
        buf.alu_reg_imm32(Alu::And, tmp, mem.tlb_index_mask);
        buf.shift_reg_imm8(Shift::Shl, tmp, TLB_ENTRY_SHIFT as u8);
        buf.mov_reg_imm64(host, mem.tlb_entries);
        buf.alu_reg_reg64(Alu::Add, host, tmp);

        buf.mov_reg_reg32(tmp, vaddr);
        buf.alu_reg_imm32(Alu::And, tmp, !page_mask);
        buf.cmp_reg_mem64(tmp, host, axis.tag_offset());
        buf.jcc_label(CC_NE, slow);

        buf.mov_reg_mem64(host, host, TLB_OFF_HOST_BASE);
        buf.mov_reg_reg32(tmp, vaddr);
        buf.alu_reg_imm32(Alu::And, tmp, page_mask);
    }

    pub(super) fn emit_read_memory(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let bits = access_bits(inst.op);
        let ty = if bits == 64 { Type::U64 } else { Type::U32 };

        let vaddr = ctx.regs.use_gpr(ctx.buf, inst.args[0]);
        let result = ctx.regs.scratch_gpr();

        if ctx.mem.fastmem != 0 {
            let host = ctx.regs.scratch_gpr();
            ctx.buf.mov_reg_imm64(host, ctx.mem.fastmem);
            Self::emit_host_load(ctx.buf, bits, result, host, vaddr);
        } else if ctx.mem.tlb_entries != 0 {
            let tmp = ctx.regs.scratch_gpr();
            let host = ctx.regs.scratch_gpr();
            let mut slow = Label::new();
            let mut done = Label::new();

            Self::emit_tlb_probe(ctx.buf, ctx.mem, Axis::Read, vaddr, tmp, host, &mut slow);
            Self::emit_host_load(ctx.buf, bits, result, host, tmp);
            ctx.buf.jmp_label(&mut done);

            ctx.buf.bind(&mut slow);
            Self::emit_read_call(ctx, bits, vaddr, result);
            ctx.buf.bind(&mut done);
        } else {
            Self::emit_read_call(ctx, bits, vaddr, result);
        }

        ctx.regs.define_gpr(ctx.buf, inst_ref, result, ty);
    }

    pub(super) fn emit_write_memory(&mut self, ctx: &mut EmitContext, inst: Inst) {
        let bits = access_bits(inst.op);

        let vaddr = ctx.regs.use_gpr(ctx.buf, inst.args[0]);
        let value = ctx.regs.use_gpr(ctx.buf, inst.args[1]);

        if ctx.mem.fastmem != 0 {
            let host = ctx.regs.scratch_gpr();
            ctx.buf.mov_reg_imm64(host, ctx.mem.fastmem);
            Self::emit_host_store(ctx.buf, bits, host, vaddr, value);
        } else if ctx.mem.tlb_entries != 0 {
            let tmp = ctx.regs.scratch_gpr();
            let host = ctx.regs.scratch_gpr();
            let mut slow = Label::new();
            let mut done = Label::new();

            Self::emit_tlb_probe(ctx.buf, ctx.mem, Axis::Write, vaddr, tmp, host, &mut slow);
            Self::emit_host_store(ctx.buf, bits, host, tmp, value);
            ctx.buf.jmp_label(&mut done);

            ctx.buf.bind(&mut slow);
            Self::emit_write_call(ctx, bits, vaddr, value);
            ctx.buf.bind(&mut done);
        } else {
            Self::emit_write_call(ctx, bits, vaddr, value);
        }
    }

    /// Load from `[host + offset]`, zero-extending into `result`.
    fn emit_host_load(buf: &mut CodeBuffer, bits: u32, result: u8, host: u8, offset: u8) {
        match bits {
            8 => buf.movzx_reg_mem8_index(result, host, offset, 0),
            16 => buf.movzx_reg_mem16_index(result, host, offset, 0),
            32 => buf.mov_reg_mem32_index1(result, host, offset, 0),
            64 => buf.mov_reg_mem64_index(result, host, offset, 0, 0),
            _ => unreachable!(),
        }
    }

    fn emit_host_store(buf: &mut CodeBuffer, bits: u32, host: u8, offset: u8, value: u8) {
        match bits {
            8 => buf.mov_mem8_index_reg(host, offset, 0, value),
            16 => buf.mov_mem16_index_reg(host, offset, 0, value),
            32 => buf.mov_mem32_index_reg(host, offset, 0, value),
            64 => buf.mov_mem64_index_reg(host, offset, 0, 0, value),
            _ => unreachable!(),
        }
    }

    /// Slow path: `result = callbacks.memory_readN(vaddr)`. Only
    /// callee-saved registers can be live here; the shim follows the
    /// System-V ABI.
    fn emit_read_call(ctx: &mut EmitContext, bits: u32, vaddr: u8, result: u8) {
        let shim = match bits {
            8 => ctx.shims.read8,
            16 => ctx.shims.read16,
            32 => ctx.shims.read32,
            64 => ctx.shims.read64,
            _ => unreachable!(),
        };
        ctx.buf.mov_reg_reg32(RSI, vaddr);
        ctx.buf.mov_reg_imm64(RDI, ctx.shims.ctx);
        ctx.buf.mov_reg_imm64(RAX, shim);
        ctx.buf.call_reg(RAX);
        if bits == 64 {
            ctx.buf.mov_reg_reg64(result, RAX);
        } else {
            ctx.buf.mov_reg_reg32(result, RAX);
        }
    }

    fn emit_write_call(ctx: &mut EmitContext, bits: u32, vaddr: u8, value: u8) {
        let shim = match bits {
            8 => ctx.shims.write8,
            16 => ctx.shims.write16,
            32 => ctx.shims.write32,
            64 => ctx.shims.write64,
            _ => unreachable!(),
        };
        ctx.buf.mov_reg_reg32(RSI, vaddr);
        if bits == 64 {
            ctx.buf.mov_reg_reg64(RDX, value);
        } else {
            ctx.buf.mov_reg_reg32(RDX, value);
        }
        ctx.buf.mov_reg_imm64(RDI, ctx.shims.ctx);
        ctx.buf.mov_reg_imm64(RAX, shim);
        ctx.buf.call_reg(RAX);
    }
}
