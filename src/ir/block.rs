//! IR instructions, blocks and terminals.
//!
//! A block is a straight-line run of instructions under a single ARM
//! condition, ending in exactly one terminal. Instructions form an SSA-ish
//! list: each produces at most one value, referenced by [`InstRef`].

use super::{Cond, LocationDescriptor};

/// Index of an instruction (and its value) within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstRef(pub u32);

/// Storage class of an instruction's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Void,
    U32,
    U64,
    F32,
    F64,
}

/// An instruction operand: a prior result or an immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    Void,
    Inst(InstRef),
    ImmU8(u8),
    ImmU32(u32),
    ImmU64(u64),
}

impl Arg {
    pub fn expect_inst(self) -> InstRef {
        match self {
            Arg::Inst(r) => r,
            other => panic!("expected instruction argument, got {other:?}"),
        }
    }

    pub fn expect_u8(self) -> u8 {
        match self {
            Arg::ImmU8(v) => v,
            other => panic!("expected u8 immediate, got {other:?}"),
        }
    }

    pub fn expect_u32(self) -> u32 {
        match self {
            Arg::ImmU32(v) => v,
            other => panic!("expected u32 immediate, got {other:?}"),
        }
    }

    pub fn expect_u64(self) -> u64 {
        match self {
            Arg::ImmU64(v) => v,
            other => panic!("expected u64 immediate, got {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rustfmt::skip]
pub enum Opcode {
    // Erased or inert.
    Void,
    Breakpoint,
    Identity,

    // Guest state access. Register/extended-register indices are ImmU8.
    GetRegister,
    SetRegister,
    GetExtendedRegister32,
    SetExtendedRegister32,
    GetExtendedRegister64,
    SetExtendedRegister64,
    GetCFlag,
    SetNFlag,
    SetZFlag,
    SetCFlag,
    SetVFlag,
    OrQFlag,
    GetGEFlags,
    SetGEFlags,
    BranchWritePC,
    PushRSB,
    CallSupervisor,
    ExceptionRaised,

    // Scalar ALU.
    MostSignificantBit,
    IsZero,
    LogicalShiftLeft,      // (value, amount, carry_in)
    LogicalShiftRight,
    ArithmeticShiftRight,
    RotateRight,
    RotateRightExtended,   // (value, carry_in)
    Add,                   // (a, b, carry_in)
    Sub,                   // (a, b, carry_in); carry is NOT-borrow
    And,
    Eor,
    Or,
    Not,
    SignedSaturatedAdd,
    SignedSaturatedSub,
    SignedSaturation,      // (value, N)
    UnsignedSaturation,    // (value, N)

    // Pseudo-operations: consume a by-product of their first argument's
    // instruction. The emitter fuses them into the parent and must never
    // see one standing alone.
    GetCarryFromOp,
    GetOverflowFromOp,
    GetGEFromOp,

    // Packed (parallel) arithmetic over a 32-bit register.
    PackedAddU8,
    PackedAddS8,
    PackedSubU8,
    PackedSubS8,
    PackedAddU16,
    PackedAddS16,
    PackedSubU16,
    PackedSubS16,
    PackedAddSubU16,       // hi: a_hi + b_lo, lo: a_lo - b_hi
    PackedAddSubS16,
    PackedSubAddU16,       // hi: a_hi - b_lo, lo: a_lo + b_hi
    PackedSubAddS16,
    PackedHalvingAddU8,
    PackedHalvingAddS8,
    PackedHalvingSubU8,
    PackedHalvingSubS8,
    PackedHalvingAddU16,
    PackedHalvingAddS16,
    PackedHalvingSubU16,
    PackedHalvingSubS16,
    PackedHalvingAddSubU16,
    PackedHalvingAddSubS16,
    PackedHalvingSubAddU16,
    PackedHalvingSubAddS16,
    PackedSelect,          // (ge_mask, if_set, if_clear)

    // Floating point. FP32 values live in the low 32 bits of their slot.
    FPAbs32,
    FPAbs64,
    FPNeg32,
    FPNeg64,
    FPAdd32,
    FPAdd64,
    FPSub32,
    FPSub64,
    FPMul32,
    FPMul64,
    FPDiv32,
    FPDiv64,
    FPSqrt32,
    FPSqrt64,
    FPSingleToDouble,
    FPDoubleToSingle,
    FPSingleToS32,         // (value, round_towards_zero)
    FPSingleToU32,
    FPDoubleToS32,
    FPDoubleToU32,
    FPS32ToSingle,
    FPU32ToSingle,
    FPS32ToDouble,
    FPU32ToDouble,

    // Memory. Reads zero-extend into a U32 (U64 for ReadMemory64).
    ReadMemory8,
    ReadMemory16,
    ReadMemory32,
    ReadMemory64,
    WriteMemory8,
    WriteMemory16,
    WriteMemory32,
    WriteMemory64,
}

impl Opcode {
    pub fn result_type(self) -> Type {
        use Opcode::*;
        match self {
            Void | Breakpoint | Identity | SetRegister | SetExtendedRegister32
            | SetExtendedRegister64 | SetNFlag | SetZFlag | SetCFlag | SetVFlag | OrQFlag
            | SetGEFlags | BranchWritePC | PushRSB | CallSupervisor | ExceptionRaised
            | WriteMemory8 | WriteMemory16 | WriteMemory32 | WriteMemory64 => Type::Void,
            ReadMemory64 => Type::U64,
            GetExtendedRegister64 | FPAbs64 | FPNeg64 | FPAdd64 | FPSub64 | FPMul64 | FPDiv64
            | FPSqrt64 | FPSingleToDouble | FPS32ToDouble | FPU32ToDouble => Type::F64,
            GetExtendedRegister32 | FPAbs32 | FPNeg32 | FPAdd32 | FPSub32 | FPMul32 | FPDiv32
            | FPSqrt32 | FPDoubleToSingle | FPS32ToSingle | FPU32ToSingle => Type::F32,
            _ => Type::U32,
        }
    }

    pub fn is_pseudo_op(self) -> bool {
        matches!(
            self,
            Opcode::GetCarryFromOp | Opcode::GetOverflowFromOp | Opcode::GetGEFromOp
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Inst {
    pub op: Opcode,
    pub args: [Arg; 3],
}

/// What happens after the last instruction of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Invalid,
    /// Unconditional exit into the dispatcher.
    ReturnToDispatch,
    /// Direct chain to `next`, re-checking the cycle counter.
    LinkBlock { next: LocationDescriptor },
    /// Direct chain without the cycle check.
    LinkBlockFast { next: LocationDescriptor },
    /// Pop the return-stack buffer and jump through it on a hit.
    PopRSBHint,
    /// Branch between two terminals on a guest condition.
    If {
        cond: Cond,
        then_: Box<Terminal>,
        else_: Box<Terminal>,
    },
    /// Test the jit-state check bit: set → `then_`, clear → `else_`.
    CheckBit {
        then_: Box<Terminal>,
        else_: Box<Terminal>,
    },
    /// Exit to the dispatcher if a halt was requested, else `else_`.
    CheckHalt { else_: Box<Terminal> },
    /// Hand `num_instructions` instructions starting at `next` to the
    /// embedder's interpreter.
    Interpret {
        next: LocationDescriptor,
        num_instructions: u32,
    },
}

impl Terminal {
    /// The statically known next location, when the terminal has one.
    pub fn static_next(&self) -> Option<LocationDescriptor> {
        match self {
            Terminal::LinkBlock { next }
            | Terminal::LinkBlockFast { next }
            | Terminal::Interpret { next, .. } => Some(*next),
            _ => None,
        }
    }
}

/// One translated guest block, pre-emission.
#[derive(Debug, Clone)]
pub struct Block {
    location: LocationDescriptor,
    end_location: LocationDescriptor,
    cond: Cond,
    insts: Vec<Inst>,
    terminal: Terminal,
    cycle_count: u64,
}

impl Block {
    pub fn new(location: LocationDescriptor) -> Self {
        Self {
            location,
            end_location: location,
            cond: Cond::AL,
            insts: Vec::new(),
            terminal: Terminal::Invalid,
            cycle_count: 0,
        }
    }

    pub fn location(&self) -> LocationDescriptor {
        self.location
    }

    pub fn end_location(&self) -> LocationDescriptor {
        self.end_location
    }

    pub fn set_end_location(&mut self, loc: LocationDescriptor) {
        self.end_location = loc;
    }

    pub fn cond(&self) -> Cond {
        self.cond
    }

    pub fn set_cond(&mut self, cond: Cond) {
        self.cond = cond;
    }

    /// Where execution resumes when the block condition fails. Instructions
    /// sharing a failed condition cannot change the flags, so the whole
    /// block is skipped.
    pub fn cond_failed_location(&self) -> LocationDescriptor {
        self.end_location
    }

    pub fn cond_failed_cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn set_terminal(&mut self, terminal: Terminal) {
        self.terminal = terminal;
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn add_cycles(&mut self, cycles: u64) {
        self.cycle_count += cycles;
    }

    pub fn inst(&mut self, op: Opcode, args: [Arg; 3]) -> InstRef {
        let r = InstRef(self.insts.len() as u32);
        self.insts.push(Inst { op, args });
        r
    }

    pub fn get(&self, r: InstRef) -> &Inst {
        &self.insts[r.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Find the (unique) live pseudo-op of kind `op` consuming `parent`.
    pub fn pseudo_op_of(&self, parent: InstRef, op: Opcode) -> Option<InstRef> {
        debug_assert!(op.is_pseudo_op());
        self.insts
            .iter()
            .position(|inst| inst.op == op && inst.args[0] == Arg::Inst(parent))
            .map(|i| InstRef(i as u32))
    }

    /// Remove an instruction from the block and clear its arguments. Used
    /// when a pseudo-op is fused into its parent's emission.
    pub fn erase(&mut self, r: InstRef) {
        let inst = &mut self.insts[r.0 as usize];
        inst.op = Opcode::Void;
        inst.args = [Arg::Void; 3];
    }
}
