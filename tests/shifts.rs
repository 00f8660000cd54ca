//! Shift semantics parity with the architectural reference, including
//! carry-out, for register-counted and immediate-counted forms.

mod common;

use common::{make_jit, run_ticks, TestEnv, INFINITE_LOOP};
use proptest::prelude::*;
use std::cell::RefCell;
use weft::Jit;

const CPSR_C: u32 = 1 << 29;

/// Architectural reference: (result, carry_out) for a register-counted
/// shift, using the low byte of the count.
fn ref_shift(kind: u32, value: u32, count: u32, carry_in: bool) -> (u32, bool) {
    let count = count & 0xFF;
    match kind {
        0b00 => match count {
            // LSL
            0 => (value, carry_in),
            1..=31 => (value << count, (value >> (32 - count)) & 1 == 1),
            32 => (0, value & 1 == 1),
            _ => (0, false),
        },
        0b01 => match count {
            // LSR
            0 => (value, carry_in),
            1..=31 => (value >> count, (value >> (count - 1)) & 1 == 1),
            32 => (0, value >> 31 == 1),
            _ => (0, false),
        },
        0b10 => {
            // ASR
            match count {
                0 => (value, carry_in),
                1..=31 => (
                    ((value as i32) >> count) as u32,
                    (value >> (count - 1)) & 1 == 1,
                ),
                _ => (((value as i32) >> 31) as u32, value >> 31 == 1),
            }
        }
        _ => {
            // ROR
            if count == 0 {
                (value, carry_in)
            } else if count & 0x1F == 0 {
                (value, value >> 31 == 1)
            } else {
                let r = value.rotate_right(count & 0x1F);
                (r, r >> 31 == 1)
            }
        }
    }
}

struct ShiftHarness {
    jit: RefCell<Jit>,
    env: TestEnv,
}

impl ShiftHarness {
    /// `movs r2, r0, <shift> r1` followed by an infinite loop; compiled
    /// once, re-run per case.
    fn new(kind: u32) -> Self {
        let insn = 0xE1B0_2010 | (kind << 5) | (1 << 8); // movs r2, r0, <kind> r1
        let env = TestEnv::new(&[insn, INFINITE_LOOP]);
        let jit = make_jit(&env);
        Self {
            jit: RefCell::new(jit),
            env,
        }
    }

    fn run_case(&self, value: u32, count: u32, carry_in: bool) -> (u32, bool) {
        let mut jit = self.jit.borrow_mut();
        jit.regs_mut()[0] = value;
        jit.regs_mut()[1] = count;
        jit.regs_mut()[2] = 0;
        jit.regs_mut()[15] = 0;
        jit.set_cpsr(if carry_in { CPSR_C } else { 0 });
        self.env.set_ticks(2);
        jit.run().expect("run");
        (jit.regs()[2], jit.cpsr() & CPSR_C != 0)
    }
}

macro_rules! shift_property {
    ($name:ident, $kind:expr) => {
        proptest! {
            #[test]
            fn $name(value: u32, count in 0u32..=255, carry_in: bool) {
                let harness = HARNESS.with(|h| h[$kind as usize].clone());
                let (result, carry) = harness.run_case(value, count, carry_in);
                let (exp_result, exp_carry) = ref_shift($kind, value, count, carry_in);
                prop_assert_eq!(result, exp_result);
                prop_assert_eq!(carry, exp_carry);
            }
        }
    };
}

thread_local! {
    static HARNESS: [std::rc::Rc<ShiftHarness>; 4] = [
        std::rc::Rc::new(ShiftHarness::new(0)),
        std::rc::Rc::new(ShiftHarness::new(1)),
        std::rc::Rc::new(ShiftHarness::new(2)),
        std::rc::Rc::new(ShiftHarness::new(3)),
    ];
}

shift_property!(lsl_matches_reference, 0b00);
shift_property!(lsr_matches_reference, 0b01);
shift_property!(asr_matches_reference, 0b10);
shift_property!(ror_matches_reference, 0b11);

/// Immediate-counted forms, including the `#0` special cases (LSR/ASR #32
/// and RRX).
#[test]
fn immediate_shift_forms() {
    let values = [0u32, 1, 2, 0x8000_0001, 0x7FFF_FFFF, 0xFFFF_FFFF, 0xDEAD_BEEF];

    for kind in 0..4u32 {
        for imm5 in 0..32u32 {
            // movs r2, r0, <kind> #imm5
            let insn = 0xE1B0_2000 | (kind << 5) | (imm5 << 7);
            let env = TestEnv::new(&[insn, INFINITE_LOOP]);
            let mut jit = make_jit(&env);

            for &value in &values {
                for carry_in in [false, true] {
                    jit.regs_mut()[0] = value;
                    jit.regs_mut()[2] = 0;
                    jit.regs_mut()[15] = 0;
                    jit.set_cpsr(if carry_in { CPSR_C } else { 0 });
                    run_ticks(&mut jit, &env, 2);

                    let (exp_result, exp_carry) = ref_imm_shift(kind, value, imm5, carry_in);
                    assert_eq!(
                        jit.regs()[2],
                        exp_result,
                        "kind={kind} imm={imm5} value={value:#x}"
                    );
                    assert_eq!(
                        jit.cpsr() & CPSR_C != 0,
                        exp_carry,
                        "carry: kind={kind} imm={imm5} value={value:#x} c_in={carry_in}"
                    );
                }
            }
        }
    }
}

fn ref_imm_shift(kind: u32, value: u32, imm5: u32, carry_in: bool) -> (u32, bool) {
    match (kind, imm5) {
        (0b00, 0) => (value, carry_in), // plain mov
        (0b01, 0) => ref_shift(0b01, value, 32, carry_in),
        (0b10, 0) => ref_shift(0b10, value, 32, carry_in),
        (0b11, 0) => {
            // RRX
            let result = ((carry_in as u32) << 31) | (value >> 1);
            (result, value & 1 == 1)
        }
        _ => ref_shift(kind, value, imm5, carry_in),
    }
}
