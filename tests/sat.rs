//! Saturating arithmetic: QADD/QSUB, SSAT/USAT, and the Q flag.

mod common;

use common::{make_jit, run_ticks, TestEnv, INFINITE_LOOP};
use proptest::prelude::*;
use std::cell::RefCell;

const CPSR_Q: u32 = 1 << 27;

#[test]
fn qsub_saturates_negative_and_sets_q() {
    // qsub r0, r1, r2
    let env = TestEnv::new(&[0xE122_0051, INFINITE_LOOP]);
    let mut jit = make_jit(&env);
    jit.regs_mut()[1] = 0x8000_0000;
    jit.regs_mut()[2] = 0x0000_0001;

    run_ticks(&mut jit, &env, 2);

    assert_eq!(jit.regs()[0], 0x8000_0000);
    assert_ne!(jit.cpsr() & CPSR_Q, 0);
}

#[test]
fn qadd_saturates_positive() {
    // qadd r0, r1, r2
    let env = TestEnv::new(&[0xE102_0051, INFINITE_LOOP]);
    let mut jit = make_jit(&env);
    jit.regs_mut()[1] = 0x7FFF_FFFF;
    jit.regs_mut()[2] = 1;

    run_ticks(&mut jit, &env, 2);

    assert_eq!(jit.regs()[0], 0x7FFF_FFFF);
    assert_ne!(jit.cpsr() & CPSR_Q, 0);
}

#[test]
fn q_flag_is_sticky() {
    // qadd r0, r1, r2; qadd r3, r4, r5 (non-saturating)
    let env = TestEnv::new(&[0xE102_0051, 0xE105_3054, INFINITE_LOOP]);
    let mut jit = make_jit(&env);
    jit.regs_mut()[1] = 0x7FFF_FFFF;
    jit.regs_mut()[2] = 1;
    jit.regs_mut()[4] = 2;
    jit.regs_mut()[5] = 3;

    run_ticks(&mut jit, &env, 3);

    assert_eq!(jit.regs()[3], 5);
    // The second, in-range add must not clear Q.
    assert_ne!(jit.cpsr() & CPSR_Q, 0);
}

proptest! {
    #[test]
    fn qadd_matches_clamp(a: i32, b: i32) {
        thread_local! {
            static FIXTURE: RefCell<Option<(TestEnv, weft::Jit)>> = const { RefCell::new(None) };
        }
        FIXTURE.with(|f| {
            let mut f = f.borrow_mut();
            let (env, jit) = f.get_or_insert_with(|| {
                let env = TestEnv::new(&[0xE102_0051, INFINITE_LOOP]); // qadd r0, r1, r2
                let jit = make_jit(&env);
                (env, jit)
            });
            jit.regs_mut()[1] = a as u32;
            jit.regs_mut()[2] = b as u32;
            jit.regs_mut()[15] = 0;
            jit.set_cpsr(0);
            env.set_ticks(2);
            jit.run().expect("run");

            let expected = (a as i64 + b as i64).clamp(i32::MIN as i64, i32::MAX as i64);
            prop_assert_eq!(jit.regs()[0] as i32 as i64, expected);
            let saturated = a.checked_add(b).is_none();
            prop_assert_eq!(jit.cpsr() & CPSR_Q != 0, saturated);
            Ok(())
        })?;
    }

    #[test]
    fn qsub_matches_clamp(a: i32, b: i32) {
        thread_local! {
            static FIXTURE: RefCell<Option<(TestEnv, weft::Jit)>> = const { RefCell::new(None) };
        }
        FIXTURE.with(|f| {
            let mut f = f.borrow_mut();
            let (env, jit) = f.get_or_insert_with(|| {
                let env = TestEnv::new(&[0xE122_0051, INFINITE_LOOP]); // qsub r0, r1, r2
                let jit = make_jit(&env);
                (env, jit)
            });
            jit.regs_mut()[1] = a as u32;
            jit.regs_mut()[2] = b as u32;
            jit.regs_mut()[15] = 0;
            jit.set_cpsr(0);
            env.set_ticks(2);
            jit.run().expect("run");

            let expected = (a as i64 - b as i64).clamp(i32::MIN as i64, i32::MAX as i64);
            prop_assert_eq!(jit.regs()[0] as i32 as i64, expected);
            let saturated = a.checked_sub(b).is_none();
            prop_assert_eq!(jit.cpsr() & CPSR_Q != 0, saturated);
            Ok(())
        })?;
    }

    #[test]
    fn ssat_8_matches_clamp(value: i32) {
        thread_local! {
            static FIXTURE: RefCell<Option<(TestEnv, weft::Jit)>> = const { RefCell::new(None) };
        }
        FIXTURE.with(|f| {
            let mut f = f.borrow_mut();
            let (env, jit) = f.get_or_insert_with(|| {
                let env = TestEnv::new(&[0xE6A7_0011, INFINITE_LOOP]); // ssat r0, #8, r1
                let jit = make_jit(&env);
                (env, jit)
            });
            jit.regs_mut()[1] = value as u32;
            jit.regs_mut()[15] = 0;
            jit.set_cpsr(0);
            env.set_ticks(2);
            jit.run().expect("run");

            let expected = value.clamp(-128, 127);
            prop_assert_eq!(jit.regs()[0] as i32, expected);
            prop_assert_eq!(jit.cpsr() & CPSR_Q != 0, value != expected);
            Ok(())
        })?;
    }

    #[test]
    fn usat_8_matches_clamp(value: i32) {
        thread_local! {
            static FIXTURE: RefCell<Option<(TestEnv, weft::Jit)>> = const { RefCell::new(None) };
        }
        FIXTURE.with(|f| {
            let mut f = f.borrow_mut();
            let (env, jit) = f.get_or_insert_with(|| {
                let env = TestEnv::new(&[0xE6E8_0011, INFINITE_LOOP]); // usat r0, #8, r1
                let jit = make_jit(&env);
                (env, jit)
            });
            jit.regs_mut()[1] = value as u32;
            jit.regs_mut()[15] = 0;
            jit.set_cpsr(0);
            env.set_ticks(2);
            jit.run().expect("run");

            let expected = value.clamp(0, 255);
            prop_assert_eq!(jit.regs()[0] as i32, expected);
            prop_assert_eq!(jit.cpsr() & CPSR_Q != 0, value != expected);
            Ok(())
        })?;
    }
}

#[test]
fn ssat_32_is_identity() {
    // ssat r0, #32, r1
    let env = TestEnv::new(&[0xE6BF_0011, INFINITE_LOOP]);
    let mut jit = make_jit(&env);
    jit.regs_mut()[1] = 0x8000_0000;

    run_ticks(&mut jit, &env, 2);

    assert_eq!(jit.regs()[0], 0x8000_0000);
    assert_eq!(jit.cpsr() & CPSR_Q, 0);
}

#[test]
fn ssat_with_shifted_operand() {
    // ssat r0, #16, r1, lsl #4
    let env = TestEnv::new(&[0xE6AF_0211, INFINITE_LOOP]);
    let mut jit = make_jit(&env);
    jit.regs_mut()[1] = 0x0000_9000; // << 4 = 0x90000, above 0x7FFF

    run_ticks(&mut jit, &env, 2);

    assert_eq!(jit.regs()[0], 0x7FFF);
    assert_ne!(jit.cpsr() & CPSR_Q, 0);
}
