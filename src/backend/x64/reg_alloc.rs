//! Register allocation for the emitter.
//!
//! Every IR value has a home spill slot inside the jit state; registers are
//! live only within the emission of a single IR instruction. `use_*` loads an
//! operand into a free host register, `define_*` binds an instruction's
//! result register and stores it home, and [`RegAlloc::end_of_inst`] returns
//! the whole file to the allocator. The scheme trades redundant loads for a
//! allocator whose state can never leak stale assignments across the
//! host-call and branch-heavy sequences the emitter produces.
//!
//! r15 (jit-state pointer) and rsp are never allocated. Callee-saved
//! registers are preferred so that the System-V argument registers are
//! almost always free when the emitter sets up a host call.

use super::code_buffer::{CodeBuffer, R15, RSP};
use super::jit_state::{JitState, SPILL_SLOTS};
use crate::ir::{Arg, Block, InstRef, Type};
use std::collections::HashMap;

/// Allocation preference: callee-saved first, then the caller-saved set in
/// reverse argument order.
const GPR_ORDER: [u8; 13] = [12, 13, 14, 3, 8, 9, 10, 11, 6, 7, 2, 1, 0];
const XMM_ORDER: [u8; 16] = [4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 0, 1, 2, 3];

pub struct RegAlloc {
    slots: HashMap<InstRef, (usize, Type)>,
    next_slot: usize,
    gpr_used: u16,
    xmm_used: u16,
}

impl RegAlloc {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next_slot: 0,
            gpr_used: 0,
            xmm_used: 0,
        }
    }

    pub fn reset_for_block(&mut self) {
        self.slots.clear();
        self.next_slot = 0;
        self.gpr_used = 0;
        self.xmm_used = 0;
    }

    fn slot_of(&self, inst: InstRef) -> (usize, Type) {
        *self
            .slots
            .get(&inst)
            .unwrap_or_else(|| panic!("use of undefined value {inst:?}"))
    }

    fn claim_gpr(&mut self) -> u8 {
        for &reg in &GPR_ORDER {
            if self.gpr_used & (1 << reg) == 0 {
                self.gpr_used |= 1 << reg;
                return reg;
            }
        }
        panic!("out of host GPRs in one instruction");
    }

    fn claim_xmm(&mut self) -> u8 {
        for &reg in &XMM_ORDER {
            if self.xmm_used & (1 << reg) == 0 {
                self.xmm_used |= 1 << reg;
                return reg;
            }
        }
        panic!("out of host XMM registers in one instruction");
    }

    /// A free register the handler may clobber.
    pub fn scratch_gpr(&mut self) -> u8 {
        self.claim_gpr()
    }

    /// Claim a specific register (e.g. rcx for a variable shift count).
    pub fn scratch_gpr_at(&mut self, reg: u8) -> u8 {
        assert!(reg != RSP && reg != R15, "register is reserved");
        assert!(self.gpr_used & (1 << reg) == 0, "register already in use");
        self.gpr_used |= 1 << reg;
        reg
    }

    pub fn scratch_xmm(&mut self) -> u8 {
        self.claim_xmm()
    }

    fn load_gpr(&mut self, buf: &mut CodeBuffer, arg: Arg, reg: u8) {
        match arg {
            Arg::Inst(inst) => {
                let (slot, ty) = self.slot_of(inst);
                let disp = JitState::off_spill(slot);
                match ty {
                    Type::U64 | Type::F64 => buf.mov_reg_mem64(reg, R15, disp),
                    _ => buf.mov_reg_mem32(reg, R15, disp),
                }
            }
            Arg::ImmU8(v) => buf.mov_reg_imm32(reg, v as u32),
            Arg::ImmU32(v) => buf.mov_reg_imm32(reg, v),
            Arg::ImmU64(v) => buf.mov_reg_imm64(reg, v),
            Arg::Void => panic!("void argument"),
        }
    }

    /// Load an operand into a fresh register. Because every use gets its own
    /// copy, the result is always safe to clobber; `use_scratch_gpr` exists
    /// for call sites that want to document the clobber.
    pub fn use_gpr(&mut self, buf: &mut CodeBuffer, arg: Arg) -> u8 {
        let reg = self.claim_gpr();
        self.load_gpr(buf, arg, reg);
        reg
    }

    pub fn use_scratch_gpr(&mut self, buf: &mut CodeBuffer, arg: Arg) -> u8 {
        self.use_gpr(buf, arg)
    }

    /// Load an operand into a specific register.
    pub fn use_gpr_at(&mut self, buf: &mut CodeBuffer, arg: Arg, reg: u8) -> u8 {
        self.scratch_gpr_at(reg);
        self.load_gpr(buf, arg, reg);
        reg
    }

    /// Load an operand into a fresh XMM register (zeroing the upper lanes).
    pub fn use_xmm(&mut self, buf: &mut CodeBuffer, arg: Arg) -> u8 {
        let reg = self.claim_xmm();
        match arg {
            Arg::Inst(inst) => {
                let (slot, ty) = self.slot_of(inst);
                let disp = JitState::off_spill(slot);
                match ty {
                    Type::U64 | Type::F64 => buf.movsd_xmm_mem(reg, R15, disp),
                    _ => buf.movss_xmm_mem(reg, R15, disp),
                }
            }
            _ => panic!("immediate arguments are not loaded into XMM registers"),
        }
        reg
    }

    pub fn use_scratch_xmm(&mut self, buf: &mut CodeBuffer, arg: Arg) -> u8 {
        self.use_xmm(buf, arg)
    }

    /// Memory operand `(base, disp)` of a spilled value, for instructions
    /// that can fold a load.
    pub fn use_op_arg(&mut self, arg: Arg) -> (u8, i32) {
        match arg {
            Arg::Inst(inst) => {
                let (slot, _) = self.slot_of(inst);
                (R15, JitState::off_spill(slot))
            }
            _ => panic!("use_op_arg requires a value argument"),
        }
    }

    fn home_slot(&mut self, inst: InstRef, ty: Type) -> usize {
        if let Some(&(slot, existing)) = self.slots.get(&inst) {
            debug_assert_eq!(existing, ty);
            return slot;
        }
        let slot = self.next_slot;
        assert!(slot < SPILL_SLOTS, "block exceeds spill storage");
        self.next_slot += 1;
        self.slots.insert(inst, (slot, ty));
        slot
    }

    /// Bind `inst`'s result to `reg` and store it to the home slot.
    pub fn define_gpr(&mut self, buf: &mut CodeBuffer, inst: InstRef, reg: u8, ty: Type) {
        let slot = self.home_slot(inst, ty);
        let disp = JitState::off_spill(slot);
        match ty {
            Type::U64 | Type::F64 => buf.mov_mem_reg64(R15, disp, reg),
            _ => buf.mov_mem_reg32(R15, disp, reg),
        }
    }

    /// Bind `inst`'s result to an XMM register and store it home.
    pub fn define_xmm(&mut self, buf: &mut CodeBuffer, inst: InstRef, reg: u8, ty: Type) {
        let slot = self.home_slot(inst, ty);
        let disp = JitState::off_spill(slot);
        match ty {
            Type::U64 | Type::F64 => buf.movsd_mem_xmm(R15, disp, reg),
            _ => buf.movss_mem_xmm(R15, disp, reg),
        }
    }

    /// All registers return to the pool; values persist only in their slots.
    pub fn end_of_inst(&mut self) {
        self.gpr_used = 0;
        self.xmm_used = 0;
    }

    /// Emission of a block is complete; verify nothing was left claimed.
    pub fn assert_block_done(&self, block: &Block) {
        debug_assert_eq!(self.gpr_used, 0, "GPRs leaked at end of {:?}", block.location());
        debug_assert_eq!(self.xmm_used, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{LocationDescriptor, Opcode};

    fn fixture() -> (CodeBuffer, RegAlloc, Block) {
        let buf = CodeBuffer::new(0x100000, 0, 4).unwrap();
        let block = Block::new(LocationDescriptor::new(0, false, 0));
        (buf, RegAlloc::new(), block)
    }

    #[test]
    fn prefers_callee_saved_registers() {
        let (mut buf, mut regs, _) = fixture();
        assert_eq!(regs.scratch_gpr(), 12);
        assert_eq!(regs.scratch_gpr(), 13);
        let rcx = regs.scratch_gpr_at(1);
        assert_eq!(rcx, 1);
        regs.end_of_inst();
        // After release the same registers come back.
        assert_eq!(regs.use_gpr(&mut buf, Arg::ImmU32(7)), 12);
    }

    #[test]
    fn define_then_use_round_trips_through_slots() {
        let (mut buf, mut regs, mut block) = fixture();
        let inst = block.inst(Opcode::GetRegister, [Arg::ImmU8(0), Arg::Void, Arg::Void]);
        let r = regs.scratch_gpr();
        regs.define_gpr(&mut buf, inst, r, Type::U32);
        regs.end_of_inst();

        let r2 = regs.use_gpr(&mut buf, Arg::Inst(inst));
        // Fresh instruction, fresh register, loaded from the same slot.
        assert_eq!(r, r2);
    }

    #[test]
    #[should_panic(expected = "use of undefined value")]
    fn use_before_define_panics() {
        let (mut buf, mut regs, _) = fixture();
        regs.use_gpr(&mut buf, Arg::Inst(InstRef(3)));
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn double_claim_of_fixed_register_panics() {
        let (_, mut regs, _) = fixture();
        regs.scratch_gpr_at(1);
        regs.scratch_gpr_at(1);
    }
}
