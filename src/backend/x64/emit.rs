//! The emitter core: turns IR blocks into x86-64 code, maintains the block
//! cache, and keeps chained jumps coherent through patching.
//!
//! One [`Emitter`] instance owns the block-descriptor table, the guest-range
//! interval index and the patch registry. Emission walks a block's
//! instructions once, fusing pseudo-ops into their parents, and finishes
//! with the terminal. Direct chaining instructions are registered as patch
//! sites before they are emitted, so a later compilation (or eviction) of
//! the target can rewrite them in place.

use super::block_cache::{BlockDescriptor, IntervalIndex, PatchInformation};
use super::code_buffer::{
    flush_icache_range, Alu, CodeBuffer, Label, Shift, CC_A, CC_AE, CC_B, CC_E, CC_G, CC_LE,
    CC_NE, CC_O, CC_S, RAX, RBX, RCX, RDI, RDX, RSI, R15,
};
use super::jit_state::{
    JitState, NZCV_C, NZCV_C_SHIFT, NZCV_N, NZCV_N_SHIFT, NZCV_V, NZCV_V_SHIFT, NZCV_Z,
    NZCV_Z_SHIFT, RSB_PTR_MASK,
};
use super::reg_alloc::RegAlloc;
use super::{HostShims, MemoryConfig};
use crate::ir::{Arg, Block, Cond, Inst, InstRef, LocationDescriptor, Opcode, Terminal, Type};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

// Fixed byte budgets for the three patch-site shapes. Shorter forms are
// nop-padded so a site can be rewritten in place any number of times.
pub const PATCH_JG_SIZE: usize = 13;
pub const PATCH_JMP_SIZE: usize = 12;
pub const PATCH_MOV_RCX_SIZE: usize = 10;

/// Per-block emission context handed to every opcode handler.
pub struct EmitContext<'a> {
    pub buf: &'a mut CodeBuffer,
    pub regs: &'a mut RegAlloc,
    pub block: &'a mut Block,
    pub shims: &'a HostShims,
    pub mem: &'a MemoryConfig,
}

impl EmitContext<'_> {
    /// Remove a fused pseudo-op from the block so the main loop never
    /// reaches it.
    pub fn erase_instruction(&mut self, inst: InstRef) {
        self.block.erase(inst);
    }
}

pub struct Emitter {
    block_descriptors: HashMap<LocationDescriptor, BlockDescriptor>,
    block_ranges: IntervalIndex,
    patch_information: HashMap<LocationDescriptor, PatchInformation>,
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter {
    pub fn new() -> Self {
        Self {
            block_descriptors: HashMap::new(),
            block_ranges: IntervalIndex::new(),
            patch_information: HashMap::new(),
        }
    }

    /// Pure lookup.
    pub fn get_basic_block(&self, desc: LocationDescriptor) -> Option<&BlockDescriptor> {
        self.block_descriptors.get(&desc)
    }

    /// Emit one translated block, register it, and redirect every pending
    /// patch site that targets its location.
    pub fn emit_block(
        &mut self,
        buf: &mut CodeBuffer,
        regs: &mut RegAlloc,
        shims: &HostShims,
        mem: &MemoryConfig,
        block: &mut Block,
    ) -> BlockDescriptor {
        buf.align16();
        let entrypoint = buf.current();

        regs.reset_for_block();
        {
            let mut ctx = EmitContext {
                buf: &mut *buf,
                regs: &mut *regs,
                block: &mut *block,
                shims,
                mem,
            };

            self.emit_cond_prelude(&mut ctx);
            Self::emit_add_cycles(ctx.buf, ctx.block.cycle_count());

            for index in 0..ctx.block.len() as u32 {
                let inst_ref = InstRef(index);
                let inst = *ctx.block.get(inst_ref);
                self.emit_inst(&mut ctx, inst_ref, inst);
                ctx.regs.end_of_inst();
            }

            let terminal = ctx.block.terminal().clone();
            let location = ctx.block.location();
            self.emit_terminal(&mut ctx, &terminal, location);
            ctx.regs.assert_block_done(ctx.block);
        }

        let size = (buf.current() - entrypoint) as usize;
        let descriptor = BlockDescriptor {
            entrypoint,
            start_location: block.location(),
            end_location: block.end_location(),
            guest_range: (
                block.location().pc(),
                block.end_location().pc().wrapping_sub(1),
            ),
            size,
        };
        debug!(
            "compiled block {:#x} ({} guest insts) at {:#x}, {} bytes",
            descriptor.start_location.pc(),
            block.cycle_count(),
            entrypoint,
            size
        );

        self.block_ranges.add(descriptor.guest_range, descriptor.start_location);
        self.block_descriptors
            .insert(descriptor.start_location, descriptor);
        self.patch(buf, descriptor.start_location, Some(entrypoint));
        flush_icache_range(entrypoint, size);
        descriptor
    }

    // ------------------------------------------------------------------
    // Patching
    // ------------------------------------------------------------------

    /// Rewrite every registered site for `desc` to reference `target`
    /// (`None` retargets them at the return stub).
    pub fn patch(&mut self, buf: &mut CodeBuffer, desc: LocationDescriptor, target: Option<u64>) {
        let Some(info) = self.patch_information.get(&desc) else {
            return;
        };
        let info = info.clone();
        trace!(
            "patching {} sites for {:#x} -> {:?}",
            info.jg.len() + info.jmp.len() + info.mov_rcx.len(),
            desc.pc(),
            target
        );

        let save_code_ptr = buf.current();
        for site in info.jg {
            buf.seek(site);
            Self::emit_patch_jg(buf, target);
        }
        for site in info.jmp {
            buf.seek(site);
            Self::emit_patch_jmp(buf, target);
        }
        for site in info.mov_rcx {
            buf.seek(site);
            Self::emit_patch_mov_rcx(buf, target);
        }
        buf.seek(save_code_ptr);
        flush_icache_range(save_code_ptr, 0);
    }

    pub fn unpatch(&mut self, buf: &mut CodeBuffer, desc: LocationDescriptor) {
        self.patch(buf, desc, None);
    }

    /// Conditional chain site. The unpatched shape relies on rax holding the
    /// target descriptor, loaded just before the cycle-count compare.
    fn emit_patch_jg(buf: &mut CodeBuffer, target: Option<u64>) {
        let start = buf.current();
        match target {
            Some(entry) => buf.jcc_rel32(CC_G, entry),
            None => {
                buf.mov_mem_reg64(R15, JitState::off_upcoming_location(), RAX);
                buf.jcc_rel32(CC_G, buf.return_from_run_address());
            }
        }
        buf.ensure_patch_size(start, PATCH_JG_SIZE);
    }

    fn emit_patch_jmp(buf: &mut CodeBuffer, target: Option<u64>) {
        let start = buf.current();
        match target {
            Some(entry) => buf.jmp_rel32(entry),
            None => {
                buf.mov_mem_reg64(R15, JitState::off_upcoming_location(), RAX);
                buf.jmp_rel32(buf.return_from_run_address());
            }
        }
        buf.ensure_patch_size(start, PATCH_JMP_SIZE);
    }

    fn emit_patch_mov_rcx(buf: &mut CodeBuffer, target: Option<u64>) {
        let start = buf.current();
        let value = target.unwrap_or_else(|| buf.return_from_run_address());
        buf.mov_reg_imm64(RCX, value);
        buf.ensure_patch_size(start, PATCH_MOV_RCX_SIZE);
    }

    // ------------------------------------------------------------------
    // Cache maintenance
    // ------------------------------------------------------------------

    /// Drop all blocks, interval entries, and patch registrations. The code
    /// buffer cursor is left alone; the owner rewinds it separately.
    pub fn clear_cache(&mut self) {
        self.block_ranges.clear();
        self.block_descriptors.clear();
        self.patch_information.clear();
    }

    /// Evict every block whose guest range overlaps one of `ranges`
    /// (closed intervals), unpatching their chained callers back to the
    /// return stub. Patch registrations survive so a future compilation of
    /// the same location can reinstall them.
    pub fn invalidate_cache_ranges(&mut self, buf: &mut CodeBuffer, ranges: &[(u32, u32)]) {
        let mut erase_locations: HashSet<LocationDescriptor> = HashSet::new();
        for &(start, end) in ranges {
            for desc in self.block_ranges.overlapping(start, end) {
                erase_locations.insert(desc);
            }
        }
        debug!("invalidating {} blocks", erase_locations.len());
        for desc in erase_locations {
            let Some(block) = self.block_descriptors.get(&desc).copied() else {
                continue;
            };
            if self.patch_information.contains_key(&desc) {
                self.unpatch(buf, desc);
            }
            self.block_ranges.remove(block.guest_range, desc);
            self.block_descriptors.remove(&desc);
        }
    }

    // ------------------------------------------------------------------
    // Block prelude
    // ------------------------------------------------------------------

    fn emit_add_cycles(buf: &mut CodeBuffer, cycles: u64) {
        assert!(cycles < u32::MAX as u64, "block cycle count overflow");
        if cycles > 0 {
            buf.sub_mem64_imm32(R15, JitState::off_cycles_remaining(), cycles as u32);
        }
    }

    /// Emit the guest-condition test; returns the label of the "condition
    /// passed" path. Uses eax/ecx/edx, which are free at terminal and
    /// prelude positions.
    fn emit_cond(buf: &mut CodeBuffer, cond: Cond) -> Label {
        let mut label = Label::new();
        buf.mov_reg_mem32(RAX, R15, JitState::off_nzcv());

        match cond {
            Cond::EQ => {
                buf.test_reg_imm32(RAX, NZCV_Z);
                buf.jcc_label(CC_NE, &mut label);
            }
            Cond::NE => {
                buf.test_reg_imm32(RAX, NZCV_Z);
                buf.jcc_label(CC_E, &mut label);
            }
            Cond::CS => {
                buf.test_reg_imm32(RAX, NZCV_C);
                buf.jcc_label(CC_NE, &mut label);
            }
            Cond::CC => {
                buf.test_reg_imm32(RAX, NZCV_C);
                buf.jcc_label(CC_E, &mut label);
            }
            Cond::MI => {
                buf.test_reg_imm32(RAX, NZCV_N);
                buf.jcc_label(CC_NE, &mut label);
            }
            Cond::PL => {
                buf.test_reg_imm32(RAX, NZCV_N);
                buf.jcc_label(CC_E, &mut label);
            }
            Cond::VS => {
                buf.test_reg_imm32(RAX, NZCV_V);
                buf.jcc_label(CC_NE, &mut label);
            }
            Cond::VC => {
                buf.test_reg_imm32(RAX, NZCV_V);
                buf.jcc_label(CC_E, &mut label);
            }
            Cond::HI => {
                // c & !z
                buf.alu_reg_imm32(Alu::And, RAX, NZCV_Z | NZCV_C);
                buf.alu_reg_imm32(Alu::Cmp, RAX, NZCV_C);
                buf.jcc_label(CC_E, &mut label);
            }
            Cond::LS => {
                // !c | z
                buf.alu_reg_imm32(Alu::And, RAX, NZCV_Z | NZCV_C);
                buf.alu_reg_imm32(Alu::Cmp, RAX, NZCV_C);
                buf.jcc_label(CC_NE, &mut label);
            }
            Cond::GE => {
                // n == v
                buf.alu_reg_imm32(Alu::And, RAX, NZCV_N | NZCV_V);
                buf.jcc_label(CC_E, &mut label);
                buf.alu_reg_imm32(Alu::Cmp, RAX, NZCV_N | NZCV_V);
                buf.jcc_label(CC_E, &mut label);
            }
            Cond::LT => {
                // n != v
                let mut fail = Label::new();
                buf.alu_reg_imm32(Alu::And, RAX, NZCV_N | NZCV_V);
                buf.jcc_label(CC_E, &mut fail);
                buf.alu_reg_imm32(Alu::Cmp, RAX, NZCV_N | NZCV_V);
                buf.jcc_label(CC_NE, &mut label);
                buf.bind(&mut fail);
            }
            Cond::GT | Cond::LE => {
                // Fold (n ^ v) | z into bit 0 of ecx.
                buf.mov_reg_reg32(RCX, RAX);
                buf.mov_reg_reg32(RDX, RAX);
                buf.shift_reg_imm8(Shift::Shr, RCX, NZCV_N_SHIFT);
                buf.shift_reg_imm8(Shift::Shr, RDX, NZCV_V_SHIFT);
                buf.shift_reg_imm8(Shift::Shr, RAX, NZCV_Z_SHIFT);
                buf.alu_reg_reg32(Alu::Xor, RCX, RDX);
                buf.alu_reg_reg32(Alu::Or, RCX, RAX);
                buf.test_reg_imm32(RCX, 1);
                // GT: !z & (n == v); LE: z | (n != v)
                let cc = if cond == Cond::GT { CC_E } else { CC_NE };
                buf.jcc_label(cc, &mut label);
            }
            Cond::AL => panic!("AL has no condition prelude"),
        }

        label
    }

    fn emit_cond_prelude(&mut self, ctx: &mut EmitContext) {
        if ctx.block.cond() == Cond::AL {
            return;
        }

        let mut pass = Self::emit_cond(ctx.buf, ctx.block.cond());
        Self::emit_add_cycles(ctx.buf, ctx.block.cond_failed_cycle_count());
        let failed = Terminal::LinkBlock {
            next: ctx.block.cond_failed_location(),
        };
        let location = ctx.block.location();
        self.emit_terminal(ctx, &failed, location);
        ctx.buf.bind(&mut pass);
    }

    // ------------------------------------------------------------------
    // Terminals
    // ------------------------------------------------------------------

    fn emit_terminal(
        &mut self,
        ctx: &mut EmitContext,
        terminal: &Terminal,
        initial_location: LocationDescriptor,
    ) {
        match terminal {
            Terminal::Invalid => panic!("invalid terminal reached emission"),
            Terminal::ReturnToDispatch => {
                let stub = ctx.buf.return_from_run_address();
                ctx.buf.jmp_rel32(stub);
            }
            Terminal::LinkBlock { next } => {
                ctx.buf.mov_reg_imm64(RAX, next.value());
                ctx.buf
                    .cmp_mem64_imm8(R15, JitState::off_cycles_remaining(), 0);
                let site = ctx.buf.current();
                self.patch_information.entry(*next).or_default().jg.push(site);
                let target = self.block_descriptors.get(next).map(|b| b.entrypoint);
                Self::emit_patch_jg(ctx.buf, target);
                // Cycle budget exhausted: hand the target to the dispatcher.
                ctx.buf
                    .mov_mem_reg64(R15, JitState::off_upcoming_location(), RAX);
                let stub = ctx.buf.return_from_run_address();
                ctx.buf.jmp_rel32(stub);
            }
            Terminal::LinkBlockFast { next } => {
                ctx.buf.mov_reg_imm64(RAX, next.value());
                let site = ctx.buf.current();
                self.patch_information
                    .entry(*next)
                    .or_default()
                    .jmp
                    .push(site);
                let target = self.block_descriptors.get(next).map(|b| b.entrypoint);
                Self::emit_patch_jmp(ctx.buf, target);
            }
            Terminal::PopRSBHint => {
                // The dynamic branch target descriptor was stored by
                // BranchWritePC; probe the RSB ring for a prediction.
                ctx.buf
                    .mov_reg_mem64(RBX, R15, JitState::off_upcoming_location());
                ctx.buf.mov_reg_mem32(RAX, R15, JitState::off_rsb_ptr());
                ctx.buf.alu_reg_imm32(Alu::Sub, RAX, 1);
                ctx.buf.alu_reg_imm32(Alu::And, RAX, RSB_PTR_MASK);
                ctx.buf.mov_mem_reg32(R15, JitState::off_rsb_ptr(), RAX);
                ctx.buf.cmp_reg_mem64_index(
                    RBX,
                    R15,
                    RAX,
                    3,
                    JitState::off_rsb_location_descriptors(),
                );
                let mut mispredict = Label::new();
                ctx.buf.jcc_label(CC_NE, &mut mispredict);
                ctx.buf
                    .jmp_mem64_index(R15, RAX, JitState::off_rsb_codeptrs());
                ctx.buf.bind(&mut mispredict);
                let stub = ctx.buf.return_from_run_address();
                ctx.buf.jmp_rel32(stub);
            }
            Terminal::If { cond, then_, else_ } => {
                let mut pass = Self::emit_cond(ctx.buf, *cond);
                self.emit_terminal(ctx, else_, initial_location);
                ctx.buf.bind(&mut pass);
                self.emit_terminal(ctx, then_, initial_location);
            }
            Terminal::CheckBit { then_, else_ } => {
                let mut clear = Label::new();
                ctx.buf.cmp_mem32_imm8(R15, JitState::off_check_bit(), 0);
                ctx.buf.jcc_label(CC_E, &mut clear);
                self.emit_terminal(ctx, then_, initial_location);
                ctx.buf.bind(&mut clear);
                self.emit_terminal(ctx, else_, initial_location);
            }
            Terminal::CheckHalt { else_ } => {
                // When the inner terminal has a static successor, publish it
                // first so a halt resumes at the right location.
                if let Some(next) = else_.static_next() {
                    ctx.buf.mov_reg_imm64(RAX, next.value());
                    ctx.buf
                        .mov_mem_reg64(R15, JitState::off_upcoming_location(), RAX);
                }
                let mut keep_going = Label::new();
                ctx.buf
                    .cmp_mem32_imm8(R15, JitState::off_halt_requested(), 0);
                ctx.buf.jcc_label(CC_E, &mut keep_going);
                let stub = ctx.buf.return_from_run_address();
                ctx.buf.jmp_rel32(stub);
                ctx.buf.bind(&mut keep_going);
                self.emit_terminal(ctx, else_, initial_location);
            }
            Terminal::Interpret {
                next,
                num_instructions,
            } => {
                // The interpreter works on the architectural state: publish
                // the PC, call out, then rebuild the location descriptor
                // from wherever the interpreter left regs[15].
                ctx.buf
                    .mov_mem_imm32(R15, JitState::off_reg(15), next.pc());
                ctx.buf.mov_reg_imm64(RDI, ctx.shims.ctx);
                ctx.buf.mov_reg_reg64(RSI, R15);
                ctx.buf.mov_reg_imm32(RDX, *num_instructions);
                ctx.buf.mov_reg_imm64(RAX, ctx.shims.interpret);
                ctx.buf.call_reg(RAX);
                ctx.buf.mov_reg_mem32(RAX, R15, JitState::off_reg(15));
                ctx.buf
                    .mov_reg_imm64(RBX, initial_location.upper_half());
                ctx.buf.alu_reg_reg64(Alu::Or, RBX, RAX);
                ctx.buf
                    .mov_mem_reg64(R15, JitState::off_upcoming_location(), RBX);
                let stub = ctx.buf.return_from_run_address();
                ctx.buf.jmp_rel32(stub);
            }
        }
    }

    // ------------------------------------------------------------------
    // Instruction dispatch
    // ------------------------------------------------------------------

    fn emit_inst(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        use Opcode::*;
        match inst.op {
            Void => {}
            Breakpoint => ctx.buf.int3(),
            Identity => self.emit_identity(ctx, inst_ref, inst),

            GetRegister => self.emit_get_register(ctx, inst_ref, inst),
            SetRegister => self.emit_set_register(ctx, inst),
            GetExtendedRegister32 => self.emit_get_ext_register32(ctx, inst_ref, inst),
            SetExtendedRegister32 => self.emit_set_ext_register32(ctx, inst),
            GetExtendedRegister64 => self.emit_get_ext_register64(ctx, inst_ref, inst),
            SetExtendedRegister64 => self.emit_set_ext_register64(ctx, inst),
            GetCFlag => self.emit_get_c_flag(ctx, inst_ref),
            SetNFlag => self.emit_set_flag(ctx, inst, NZCV_N_SHIFT, NZCV_N),
            SetZFlag => self.emit_set_flag(ctx, inst, NZCV_Z_SHIFT, NZCV_Z),
            SetCFlag => self.emit_set_flag(ctx, inst, NZCV_C_SHIFT, NZCV_C),
            SetVFlag => self.emit_set_flag(ctx, inst, NZCV_V_SHIFT, NZCV_V),
            OrQFlag => self.emit_or_q_flag(ctx, inst),
            GetGEFlags => self.emit_get_ge_flags(ctx, inst_ref),
            SetGEFlags => self.emit_set_ge_flags(ctx, inst),
            BranchWritePC => self.emit_branch_write_pc(ctx, inst),
            PushRSB => self.emit_push_rsb(ctx, inst),
            CallSupervisor => self.emit_call_supervisor(ctx, inst),
            ExceptionRaised => self.emit_exception_raised(ctx, inst),

            MostSignificantBit => self.emit_most_significant_bit(ctx, inst_ref, inst),
            IsZero => self.emit_is_zero(ctx, inst_ref, inst),
            LogicalShiftLeft | LogicalShiftRight | ArithmeticShiftRight | RotateRight => {
                self.emit_shift(ctx, inst_ref, inst)
            }
            RotateRightExtended => self.emit_rrx(ctx, inst_ref, inst),
            Add | Sub => self.emit_add_sub(ctx, inst_ref, inst),
            And | Eor | Or => self.emit_bitwise(ctx, inst_ref, inst),
            Not => self.emit_not(ctx, inst_ref, inst),
            SignedSaturatedAdd | SignedSaturatedSub => {
                self.emit_signed_saturated_add_sub(ctx, inst_ref, inst)
            }
            SignedSaturation => self.emit_signed_saturation(ctx, inst_ref, inst),
            UnsignedSaturation => self.emit_unsigned_saturation(ctx, inst_ref, inst),

            GetCarryFromOp | GetOverflowFromOp | GetGEFromOp => {
                panic!("{:?} reached emission; its parent failed to fuse it", inst.op)
            }

            PackedAddU8 | PackedAddS8 | PackedSubU8 | PackedSubS8 | PackedAddU16
            | PackedAddS16 | PackedSubU16 | PackedSubS16 => {
                self.emit_packed_add_sub(ctx, inst_ref, inst)
            }
            PackedAddSubU16 | PackedAddSubS16 | PackedSubAddU16 | PackedSubAddS16
            | PackedHalvingAddSubU16 | PackedHalvingAddSubS16 | PackedHalvingSubAddU16
            | PackedHalvingSubAddS16 => self.emit_packed_cross(ctx, inst_ref, inst),
            PackedHalvingAddU8 | PackedHalvingAddS8 | PackedHalvingAddU16
            | PackedHalvingAddS16 => self.emit_packed_halving_add(ctx, inst_ref, inst),
            PackedHalvingSubU8 | PackedHalvingSubS8 => {
                self.emit_packed_halving_sub8(ctx, inst_ref, inst)
            }
            PackedHalvingSubU16 | PackedHalvingSubS16 => {
                self.emit_packed_halving_sub16(ctx, inst_ref, inst)
            }
            PackedSelect => self.emit_packed_select(ctx, inst_ref, inst),

            FPAbs32 | FPAbs64 | FPNeg32 | FPNeg64 => self.emit_fp_sign_op(ctx, inst_ref, inst),
            FPAdd32 | FPAdd64 | FPSub32 | FPSub64 | FPMul32 | FPMul64 | FPDiv32 | FPDiv64 => {
                self.emit_fp_arith(ctx, inst_ref, inst)
            }
            FPSqrt32 | FPSqrt64 => self.emit_fp_sqrt(ctx, inst_ref, inst),
            FPSingleToDouble | FPDoubleToSingle => self.emit_fp_convert(ctx, inst_ref, inst),
            FPSingleToS32 | FPSingleToU32 | FPDoubleToS32 | FPDoubleToU32 => {
                self.emit_fp_to_fixed(ctx, inst_ref, inst)
            }
            FPS32ToSingle | FPU32ToSingle | FPS32ToDouble | FPU32ToDouble => {
                self.emit_fixed_to_fp(ctx, inst_ref, inst)
            }

            ReadMemory8 | ReadMemory16 | ReadMemory32 | ReadMemory64 => {
                self.emit_read_memory(ctx, inst_ref, inst)
            }
            WriteMemory8 | WriteMemory16 | WriteMemory32 | WriteMemory64 => {
                self.emit_write_memory(ctx, inst)
            }
        }
    }

    // ------------------------------------------------------------------
    // State access
    // ------------------------------------------------------------------

    fn emit_identity(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let ty = match inst.args[0] {
            Arg::Inst(r) => ctx.block.get(r).op.result_type(),
            _ => Type::U32,
        };
        let reg = ctx.regs.use_gpr(ctx.buf, inst.args[0]);
        ctx.regs.define_gpr(ctx.buf, inst_ref, reg, ty);
    }

    fn emit_get_register(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let index = inst.args[0].expect_u8() as usize;
        let reg = ctx.regs.scratch_gpr();
        ctx.buf.mov_reg_mem32(reg, R15, JitState::off_reg(index));
        ctx.regs.define_gpr(ctx.buf, inst_ref, reg, Type::U32);
    }

    fn emit_set_register(&mut self, ctx: &mut EmitContext, inst: Inst) {
        let index = inst.args[0].expect_u8() as usize;
        match inst.args[1] {
            Arg::ImmU32(v) => ctx.buf.mov_mem_imm32(R15, JitState::off_reg(index), v),
            arg => {
                let reg = ctx.regs.use_gpr(ctx.buf, arg);
                ctx.buf.mov_mem_reg32(R15, JitState::off_reg(index), reg);
            }
        }
    }

    fn emit_get_ext_register32(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let index = inst.args[0].expect_u8() as usize;
        let reg = ctx.regs.scratch_gpr();
        ctx.buf.mov_reg_mem32(reg, R15, JitState::off_ext_reg(index));
        ctx.regs.define_gpr(ctx.buf, inst_ref, reg, Type::F32);
    }

    fn emit_set_ext_register32(&mut self, ctx: &mut EmitContext, inst: Inst) {
        let index = inst.args[0].expect_u8() as usize;
        let reg = ctx.regs.use_gpr(ctx.buf, inst.args[1]);
        ctx.buf.mov_mem_reg32(R15, JitState::off_ext_reg(index), reg);
    }

    fn emit_get_ext_register64(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let index = inst.args[0].expect_u8() as usize;
        let reg = ctx.regs.scratch_gpr();
        ctx.buf
            .mov_reg_mem64(reg, R15, JitState::off_ext_reg(index * 2));
        ctx.regs.define_gpr(ctx.buf, inst_ref, reg, Type::F64);
    }

    fn emit_set_ext_register64(&mut self, ctx: &mut EmitContext, inst: Inst) {
        let index = inst.args[0].expect_u8() as usize;
        let reg = ctx.regs.use_gpr(ctx.buf, inst.args[1]);
        ctx.buf
            .mov_mem_reg64(R15, JitState::off_ext_reg(index * 2), reg);
    }

    fn emit_get_c_flag(&mut self, ctx: &mut EmitContext, inst_ref: InstRef) {
        let reg = ctx.regs.scratch_gpr();
        ctx.buf.mov_reg_mem32(reg, R15, JitState::off_nzcv());
        ctx.buf.shift_reg_imm8(Shift::Shr, reg, NZCV_C_SHIFT);
        ctx.buf.alu_reg_imm32(Alu::And, reg, 1);
        ctx.regs.define_gpr(ctx.buf, inst_ref, reg, Type::U32);
    }

    /// Replace one NZCV bit with a 0/1 value.
    fn emit_set_flag(&mut self, ctx: &mut EmitContext, inst: Inst, shift: u8, mask: u32) {
        match inst.args[0] {
            Arg::ImmU8(v) => {
                debug_assert!(v <= 1);
                if v != 0 {
                    ctx.buf
                        .alu_mem32_imm32(Alu::Or, R15, JitState::off_nzcv(), mask);
                } else {
                    ctx.buf
                        .alu_mem32_imm32(Alu::And, R15, JitState::off_nzcv(), !mask);
                }
            }
            arg => {
                let reg = ctx.regs.use_scratch_gpr(ctx.buf, arg);
                ctx.buf.shift_reg_imm8(Shift::Shl, reg, shift);
                ctx.buf
                    .alu_mem32_imm32(Alu::And, R15, JitState::off_nzcv(), !mask);
                ctx.buf.alu_mem32_reg(Alu::Or, R15, JitState::off_nzcv(), reg);
            }
        }
    }

    fn emit_or_q_flag(&mut self, ctx: &mut EmitContext, inst: Inst) {
        let reg = ctx.regs.use_gpr(ctx.buf, inst.args[0]);
        ctx.buf.alu_mem32_reg(Alu::Or, R15, JitState::off_q(), reg);
    }

    fn emit_get_ge_flags(&mut self, ctx: &mut EmitContext, inst_ref: InstRef) {
        let reg = ctx.regs.scratch_gpr();
        ctx.buf.mov_reg_mem32(reg, R15, JitState::off_ge());
        ctx.regs.define_gpr(ctx.buf, inst_ref, reg, Type::U32);
    }

    fn emit_set_ge_flags(&mut self, ctx: &mut EmitContext, inst: Inst) {
        let reg = ctx.regs.use_gpr(ctx.buf, inst.args[0]);
        ctx.buf.mov_mem_reg32(R15, JitState::off_ge(), reg);
    }

    /// Publish a dynamically computed branch target as the upcoming
    /// location descriptor. ARM-state targets are word-aligned.
    fn emit_branch_write_pc(&mut self, ctx: &mut EmitContext, inst: Inst) {
        let value = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        let upper = ctx.regs.scratch_gpr();
        ctx.buf.alu_reg_imm32(Alu::And, value, 0xFFFF_FFFC);
        ctx.buf
            .mov_reg_imm64(upper, ctx.block.location().upper_half());
        ctx.buf.alu_reg_reg64(Alu::Or, upper, value);
        ctx.buf
            .mov_mem_reg64(R15, JitState::off_upcoming_location(), upper);
    }

    /// Write (target descriptor, predicted host address) into the RSB ring.
    /// The constant load of the code pointer is a registered patch site so
    /// the prediction follows the target block through compilation and
    /// eviction.
    fn emit_push_rsb(&mut self, ctx: &mut EmitContext, inst: Inst) {
        let target = LocationDescriptor::from_value(inst.args[0].expect_u64());

        ctx.regs.scratch_gpr_at(RCX);
        let loc_desc_reg = ctx.regs.scratch_gpr();
        let index_reg = ctx.regs.scratch_gpr();

        ctx.buf
            .mov_reg_mem32(index_reg, R15, JitState::off_rsb_ptr());
        ctx.buf.mov_reg_imm64(loc_desc_reg, target.value());

        let site = ctx.buf.current();
        self.patch_information
            .entry(target)
            .or_default()
            .mov_rcx
            .push(site);
        let target_ptr = self.block_descriptors.get(&target).map(|b| b.entrypoint);
        Self::emit_patch_mov_rcx(ctx.buf, target_ptr);

        ctx.buf.mov_mem64_index_reg(
            R15,
            index_reg,
            3,
            JitState::off_rsb_location_descriptors(),
            loc_desc_reg,
        );
        ctx.buf
            .mov_mem64_index_reg(R15, index_reg, 3, JitState::off_rsb_codeptrs(), RCX);

        ctx.buf.alu_reg_imm32(Alu::Add, index_reg, 1);
        ctx.buf.alu_reg_imm32(Alu::And, index_reg, RSB_PTR_MASK);
        ctx.buf
            .mov_mem_reg32(R15, JitState::off_rsb_ptr(), index_reg);
    }

    fn emit_call_supervisor(&mut self, ctx: &mut EmitContext, inst: Inst) {
        let imm = inst.args[0].expect_u32();
        ctx.regs.scratch_gpr_at(RDI);
        ctx.regs.scratch_gpr_at(RSI);
        ctx.regs.scratch_gpr_at(RAX);
        ctx.buf.mov_reg_imm64(RDI, ctx.shims.ctx);
        ctx.buf.mov_reg_imm32(RSI, imm);
        ctx.buf.mov_reg_imm64(RAX, ctx.shims.call_svc);
        ctx.buf.call_reg(RAX);
    }

    fn emit_exception_raised(&mut self, ctx: &mut EmitContext, inst: Inst) {
        let pc = inst.args[0].expect_u32();
        let exception = inst.args[1].expect_u32();
        ctx.regs.scratch_gpr_at(RDI);
        ctx.regs.scratch_gpr_at(RSI);
        ctx.regs.scratch_gpr_at(RDX);
        ctx.regs.scratch_gpr_at(RAX);
        ctx.buf.mov_reg_imm64(RDI, ctx.shims.ctx);
        ctx.buf.mov_reg_imm32(RSI, pc);
        ctx.buf.mov_reg_imm32(RDX, exception);
        ctx.buf.mov_reg_imm64(RAX, ctx.shims.exception_raised);
        ctx.buf.call_reg(RAX);
    }

    // ------------------------------------------------------------------
    // Scalar ALU
    // ------------------------------------------------------------------

    fn emit_most_significant_bit(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let reg = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        ctx.buf.shift_reg_imm8(Shift::Shr, reg, 31);
        ctx.regs.define_gpr(ctx.buf, inst_ref, reg, Type::U32);
    }

    fn emit_is_zero(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let reg = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        ctx.buf.test_reg_reg32(reg, reg);
        ctx.buf.setcc_reg8(CC_E, reg);
        ctx.buf.movzx_reg_reg8(reg, reg);
        ctx.regs.define_gpr(ctx.buf, inst_ref, reg, Type::U32);
    }

    /// The four ARM shifts over a 32-bit value. ARM uses the low byte of the
    /// count register unmasked, x86 masks counts to 5 bits; the variable
    /// paths branch on the count to reconcile the two, and seed CF before
    /// native shifts so that a zero count preserves the incoming carry.
    fn emit_shift(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let carry_inst = ctx.block.pseudo_op_of(inst_ref, Opcode::GetCarryFromOp);

        match inst.args[1] {
            Arg::ImmU8(amount) => self.emit_shift_imm(ctx, inst_ref, inst, amount, carry_inst),
            _ => self.emit_shift_variable(ctx, inst_ref, inst, carry_inst),
        }
    }

    fn define_carry_out(
        &mut self,
        ctx: &mut EmitContext,
        carry_inst: Option<InstRef>,
        carry_reg: u8,
    ) {
        if let Some(carry) = carry_inst {
            ctx.regs.define_gpr(ctx.buf, carry, carry_reg, Type::U32);
            ctx.erase_instruction(carry);
        }
    }

    fn emit_shift_imm(
        &mut self,
        ctx: &mut EmitContext,
        inst_ref: InstRef,
        inst: Inst,
        amount: u8,
        carry_inst: Option<InstRef>,
    ) {
        let op = inst.op;
        let result = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        let carry_reg = ctx.regs.scratch_gpr();

        match op {
            Opcode::LogicalShiftLeft => {
                debug_assert!((1..32).contains(&amount));
                ctx.buf.shift_reg_imm8(Shift::Shl, result, amount);
                if carry_inst.is_some() {
                    ctx.buf.setcc_reg8(CC_B, carry_reg);
                    ctx.buf.movzx_reg_reg8(carry_reg, carry_reg);
                }
            }
            Opcode::LogicalShiftRight => {
                debug_assert!((1..=32).contains(&amount));
                if amount == 32 {
                    // Result is zero; carry is the original sign bit.
                    ctx.buf.mov_reg_reg32(carry_reg, result);
                    ctx.buf.shift_reg_imm8(Shift::Shr, carry_reg, 31);
                    ctx.buf.alu_reg_reg32(Alu::Xor, result, result);
                } else {
                    ctx.buf.shift_reg_imm8(Shift::Shr, result, amount);
                    if carry_inst.is_some() {
                        ctx.buf.setcc_reg8(CC_B, carry_reg);
                        ctx.buf.movzx_reg_reg8(carry_reg, carry_reg);
                    }
                }
            }
            Opcode::ArithmeticShiftRight => {
                debug_assert!((1..=32).contains(&amount));
                if amount == 32 {
                    ctx.buf.shift_reg_imm8(Shift::Sar, result, 31);
                    ctx.buf.mov_reg_reg32(carry_reg, result);
                    ctx.buf.alu_reg_imm32(Alu::And, carry_reg, 1);
                } else {
                    ctx.buf.shift_reg_imm8(Shift::Sar, result, amount);
                    if carry_inst.is_some() {
                        ctx.buf.setcc_reg8(CC_B, carry_reg);
                        ctx.buf.movzx_reg_reg8(carry_reg, carry_reg);
                    }
                }
            }
            Opcode::RotateRight => {
                debug_assert!((1..32).contains(&amount));
                ctx.buf.shift_reg_imm8(Shift::Ror, result, amount);
                if carry_inst.is_some() {
                    // Carry is the new most significant bit.
                    ctx.buf.mov_reg_reg32(carry_reg, result);
                    ctx.buf.shift_reg_imm8(Shift::Shr, carry_reg, 31);
                }
            }
            _ => unreachable!(),
        }

        self.define_carry_out(ctx, carry_inst, carry_reg);
        ctx.regs.define_gpr(ctx.buf, inst_ref, result, Type::U32);
    }

    fn emit_shift_variable(
        &mut self,
        ctx: &mut EmitContext,
        inst_ref: InstRef,
        inst: Inst,
        carry_inst: Option<InstRef>,
    ) {
        let op = inst.op;
        // Shift count must live in cl for the native shifts.
        ctx.regs.use_gpr_at(ctx.buf, inst.args[1], RCX);
        let result = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        let carry_reg = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[2]);

        let mut end = Label::new();

        match op {
            Opcode::LogicalShiftLeft | Opcode::LogicalShiftRight => {
                let kind = if op == Opcode::LogicalShiftLeft {
                    Shift::Shl
                } else {
                    Shift::Shr
                };
                let mut ge32 = Label::new();
                let mut eq32 = Label::new();
                ctx.buf.cmp_reg8_imm8(RCX, 32);
                ctx.buf.jcc_label(CC_A, &mut ge32);
                ctx.buf.jcc_label(CC_E, &mut eq32);
                // count < 32: seed CF with the incoming carry so a zero
                // count is a no-op including flags.
                ctx.buf.bt_reg_imm8(carry_reg, 0);
                ctx.buf.shift_reg_cl(kind, result);
                ctx.buf.setcc_reg8(CC_B, carry_reg);
                ctx.buf.movzx_reg_reg8(carry_reg, carry_reg);
                ctx.buf.jmp_label(&mut end);
                // count > 32: result and carry are both zero.
                ctx.buf.bind(&mut ge32);
                ctx.buf.alu_reg_reg32(Alu::Xor, result, result);
                ctx.buf.alu_reg_reg32(Alu::Xor, carry_reg, carry_reg);
                ctx.buf.jmp_label(&mut end);
                // count == 32: carry is the bit shifted across the edge.
                ctx.buf.bind(&mut eq32);
                ctx.buf.mov_reg_reg32(carry_reg, result);
                if op == Opcode::LogicalShiftLeft {
                    ctx.buf.alu_reg_imm32(Alu::And, carry_reg, 1);
                } else {
                    ctx.buf.shift_reg_imm8(Shift::Shr, carry_reg, 31);
                }
                ctx.buf.alu_reg_reg32(Alu::Xor, result, result);
                ctx.buf.bind(&mut end);
            }
            Opcode::ArithmeticShiftRight => {
                let mut ge32 = Label::new();
                ctx.buf.cmp_reg8_imm8(RCX, 31);
                ctx.buf.jcc_label(CC_A, &mut ge32);
                ctx.buf.bt_reg_imm8(carry_reg, 0);
                ctx.buf.shift_reg_cl(Shift::Sar, result);
                ctx.buf.setcc_reg8(CC_B, carry_reg);
                ctx.buf.movzx_reg_reg8(carry_reg, carry_reg);
                ctx.buf.jmp_label(&mut end);
                // count >= 32 behaves as 31 with carry = sign.
                ctx.buf.bind(&mut ge32);
                ctx.buf.shift_reg_imm8(Shift::Sar, result, 31);
                ctx.buf.mov_reg_reg32(carry_reg, result);
                ctx.buf.alu_reg_imm32(Alu::And, carry_reg, 1);
                ctx.buf.bind(&mut end);
            }
            Opcode::RotateRight => {
                let mut rot32 = Label::new();
                ctx.buf.test_reg8_imm8(RCX, 0xFF);
                ctx.buf.jcc_label(CC_E, &mut end);
                ctx.buf.test_reg8_imm8(RCX, 0x1F);
                ctx.buf.jcc_label(CC_E, &mut rot32);
                // Plain rotate; the new MSB is the carry.
                ctx.buf.shift_reg_cl(Shift::Ror, result);
                ctx.buf.mov_reg_reg32(carry_reg, result);
                ctx.buf.shift_reg_imm8(Shift::Shr, carry_reg, 31);
                ctx.buf.jmp_label(&mut end);
                // Nonzero multiple of 32: value unchanged, carry = MSB.
                ctx.buf.bind(&mut rot32);
                ctx.buf.mov_reg_reg32(carry_reg, result);
                ctx.buf.shift_reg_imm8(Shift::Shr, carry_reg, 31);
                ctx.buf.bind(&mut end);
            }
            _ => unreachable!(),
        }

        self.define_carry_out(ctx, carry_inst, carry_reg);
        ctx.regs.define_gpr(ctx.buf, inst_ref, result, Type::U32);
    }

    fn emit_rrx(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let carry_inst = ctx.block.pseudo_op_of(inst_ref, Opcode::GetCarryFromOp);
        let result = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        let carry_reg = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[1]);

        ctx.buf.bt_reg_imm8(carry_reg, 0);
        ctx.buf.shift_reg_1(Shift::Rcr, result);
        if carry_inst.is_some() {
            ctx.buf.setcc_reg8(CC_B, carry_reg);
            ctx.buf.movzx_reg_reg8(carry_reg, carry_reg);
        }
        self.define_carry_out(ctx, carry_inst, carry_reg);
        ctx.regs.define_gpr(ctx.buf, inst_ref, result, Type::U32);
    }

    fn emit_add_sub(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let is_sub = inst.op == Opcode::Sub;
        let carry_inst = ctx.block.pseudo_op_of(inst_ref, Opcode::GetCarryFromOp);
        let overflow_inst = ctx.block.pseudo_op_of(inst_ref, Opcode::GetOverflowFromOp);

        let result = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        let operand = ctx.regs.use_gpr(ctx.buf, inst.args[1]);

        // ARM's carry-in for subtraction is NOT-borrow; x86's CF is borrow.
        match inst.args[2] {
            Arg::ImmU8(0) => {
                if is_sub {
                    // Borrow set: a - b - 1.
                    ctx.buf.stc();
                    ctx.buf.alu_reg_reg32(Alu::Sbb, result, operand);
                } else {
                    ctx.buf.alu_reg_reg32(Alu::Add, result, operand);
                }
            }
            Arg::ImmU8(1) => {
                if is_sub {
                    ctx.buf.alu_reg_reg32(Alu::Sub, result, operand);
                } else {
                    ctx.buf.stc();
                    ctx.buf.alu_reg_reg32(Alu::Adc, result, operand);
                }
            }
            arg => {
                let carry_in = ctx.regs.use_gpr(ctx.buf, arg);
                ctx.buf.bt_reg_imm8(carry_in, 0);
                if is_sub {
                    ctx.buf.cmc();
                    ctx.buf.alu_reg_reg32(Alu::Sbb, result, operand);
                } else {
                    ctx.buf.alu_reg_reg32(Alu::Adc, result, operand);
                }
            }
        }

        if carry_inst.is_some() || overflow_inst.is_some() {
            let flags_reg = ctx.regs.scratch_gpr();
            if let Some(carry) = carry_inst {
                // ARM carry-out of a subtraction is the inverse of borrow.
                ctx.buf.setcc_reg8(if is_sub { CC_AE } else { CC_B }, flags_reg);
                ctx.buf.movzx_reg_reg8(flags_reg, flags_reg);
                ctx.regs.define_gpr(ctx.buf, carry, flags_reg, Type::U32);
                ctx.erase_instruction(carry);
            }
            if let Some(overflow) = overflow_inst {
                ctx.buf.setcc_reg8(CC_O, flags_reg);
                ctx.buf.movzx_reg_reg8(flags_reg, flags_reg);
                ctx.regs.define_gpr(ctx.buf, overflow, flags_reg, Type::U32);
                ctx.erase_instruction(overflow);
            }
        }

        ctx.regs.define_gpr(ctx.buf, inst_ref, result, Type::U32);
    }

    fn emit_bitwise(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let alu = match inst.op {
            Opcode::And => Alu::And,
            Opcode::Eor => Alu::Xor,
            Opcode::Or => Alu::Or,
            _ => unreachable!(),
        };
        let result = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        let operand = ctx.regs.use_gpr(ctx.buf, inst.args[1]);
        ctx.buf.alu_reg_reg32(alu, result, operand);
        ctx.regs.define_gpr(ctx.buf, inst_ref, result, Type::U32);
    }

    fn emit_not(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let result = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        ctx.buf.not_reg32(result);
        ctx.regs.define_gpr(ctx.buf, inst_ref, result, Type::U32);
    }

    /// `result = a ± b`, substituting the sign-matched saturation sentinel
    /// on overflow. The sentinel is precomputed from the sign of `a`:
    /// `(a >>> 31) + 0x7FFFFFFF` yields 0x7FFFFFFF for non-negative a and
    /// 0x80000000 for negative a.
    fn emit_signed_saturated_add_sub(
        &mut self,
        ctx: &mut EmitContext,
        inst_ref: InstRef,
        inst: Inst,
    ) {
        let is_sub = inst.op == Opcode::SignedSaturatedSub;
        let overflow_inst = ctx.block.pseudo_op_of(inst_ref, Opcode::GetOverflowFromOp);

        let result = ctx.regs.use_scratch_gpr(ctx.buf, inst.args[0]);
        let operand = ctx.regs.use_gpr(ctx.buf, inst.args[1]);
        let sentinel = ctx.regs.scratch_gpr();

        ctx.buf.mov_reg_reg32(sentinel, result);
        ctx.buf.shift_reg_imm8(Shift::Shr, sentinel, 31);
        ctx.buf.alu_reg_imm32(Alu::Add, sentinel, 0x7FFF_FFFF);

        let alu = if is_sub { Alu::Sub } else { Alu::Add };
        ctx.buf.alu_reg_reg32(alu, result, operand);

        if let Some(overflow) = overflow_inst {
            let flag = ctx.regs.scratch_gpr();
            ctx.buf.setcc_reg8(CC_O, flag);
            ctx.buf.movzx_reg_reg8(flag, flag);
            ctx.regs.define_gpr(ctx.buf, overflow, flag, Type::U32);
            ctx.erase_instruction(overflow);
        }
        ctx.buf.cmovcc_reg_reg32(CC_O, result, sentinel);
        ctx.regs.define_gpr(ctx.buf, inst_ref, result, Type::U32);
    }

    /// Clamp to the signed N-bit range; the overflow pseudo-op reports
    /// whether clamping occurred.
    fn emit_signed_saturation(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let n = inst.args[1].expect_u8() as u32;
        debug_assert!((1..=32).contains(&n));
        let overflow_inst = ctx.block.pseudo_op_of(inst_ref, Opcode::GetOverflowFromOp);

        if n == 32 {
            let value = ctx.regs.use_gpr(ctx.buf, inst.args[0]);
            if let Some(overflow) = overflow_inst {
                let zero = ctx.regs.scratch_gpr();
                ctx.buf.mov_reg_imm32(zero, 0);
                ctx.regs.define_gpr(ctx.buf, overflow, zero, Type::U32);
                ctx.erase_instruction(overflow);
            }
            ctx.regs.define_gpr(ctx.buf, inst_ref, value, Type::U32);
            return;
        }

        let mask = (1u32 << n) - 1;
        let positive_sat = (1u32 << (n - 1)) - 1;
        let negative_sat = (1u32 << (n - 1)).wrapping_neg();
        let bias = 1u32 << (n - 1);

        let value = ctx.regs.use_gpr(ctx.buf, inst.args[0]);
        let result = ctx.regs.scratch_gpr();
        let tmp = ctx.regs.scratch_gpr();
        let ranged = ctx.regs.scratch_gpr();

        // Pick the sign-matched saturation value first, then test range:
        // value + 2^(N-1) fits in N bits iff value is representable.
        ctx.buf.mov_reg_imm32(result, positive_sat);
        ctx.buf.mov_reg_imm32(tmp, negative_sat);
        ctx.buf.test_reg_reg32(value, value);
        ctx.buf.cmovcc_reg_reg32(CC_S, result, tmp);
        ctx.buf.lea_reg_mem32(ranged, value, bias as i32);
        ctx.buf.test_reg_imm32(ranged, !mask);
        ctx.buf.cmovcc_reg_reg32(CC_E, result, value);

        if let Some(overflow) = overflow_inst {
            let flag = ctx.regs.scratch_gpr();
            ctx.buf.setcc_reg8(CC_NE, flag);
            ctx.buf.movzx_reg_reg8(flag, flag);
            ctx.regs.define_gpr(ctx.buf, overflow, flag, Type::U32);
            ctx.erase_instruction(overflow);
        }

        ctx.regs.define_gpr(ctx.buf, inst_ref, result, Type::U32);
    }

    /// Clamp a signed value into [0, 2^N - 1].
    fn emit_unsigned_saturation(&mut self, ctx: &mut EmitContext, inst_ref: InstRef, inst: Inst) {
        let n = inst.args[1].expect_u8() as u32;
        debug_assert!(n <= 31);
        let overflow_inst = ctx.block.pseudo_op_of(inst_ref, Opcode::GetOverflowFromOp);

        let saturated = (1u32 << n) - 1;
        let value = ctx.regs.use_gpr(ctx.buf, inst.args[0]);
        let result = ctx.regs.scratch_gpr();
        let zero = ctx.regs.scratch_gpr();

        ctx.buf.mov_reg_imm32(result, saturated);
        ctx.buf.alu_reg_imm32(Alu::Cmp, value, saturated);
        ctx.buf.cmovcc_reg_reg32(CC_LE, result, value);
        ctx.buf.alu_reg_reg32(Alu::Xor, zero, zero);
        ctx.buf.test_reg_reg32(result, result);
        ctx.buf.cmovcc_reg_reg32(CC_S, result, zero);

        if let Some(overflow) = overflow_inst {
            let flag = ctx.regs.scratch_gpr();
            ctx.buf.alu_reg_reg32(Alu::Cmp, value, result);
            ctx.buf.setcc_reg8(CC_NE, flag);
            ctx.buf.movzx_reg_reg8(flag, flag);
            ctx.regs.define_gpr(ctx.buf, overflow, flag, Type::U32);
            ctx.erase_instruction(overflow);
        }

        ctx.regs.define_gpr(ctx.buf, inst_ref, result, Type::U32);
    }
}
