//! End-to-end execution: chaining, conditional blocks, cycle accounting,
//! cache invalidation, interpreter fallback, and SVC routing.

mod common;

use common::{make_jit, run_ticks, TestEnv, INFINITE_LOOP};
use weft::{Error, Exception, UserConfig};

#[test]
fn straight_line_arithmetic() {
    let env = TestEnv::new(&[
        0xE3A0_0005, // mov r0, #5
        0xE280_1007, // add r1, r0, #7
        0xE041_2000, // sub r2, r1, r0
        INFINITE_LOOP,
    ]);
    let mut jit = make_jit(&env);

    run_ticks(&mut jit, &env, 4);

    assert_eq!(jit.regs()[0], 5);
    assert_eq!(jit.regs()[1], 12);
    assert_eq!(jit.regs()[2], 7);
    assert_eq!(jit.regs()[15], 12);
}

#[test]
fn counting_loop_chains_blocks() {
    // r0 counts up while r1 counts down; the bne back-edge chains three
    // blocks together through the patch registry.
    let env = TestEnv::new(&[
        0xE3A0_0000, // mov r0, #0
        0xE3A0_100A, // mov r1, #10
        0xE280_0001, // add r0, r0, #1
        0xE251_1001, // subs r1, r1, #1
        0x1AFF_FFFC, // bne .-8
        INFINITE_LOOP,
    ]);
    let mut jit = make_jit(&env);

    run_ticks(&mut jit, &env, 1000);

    assert_eq!(jit.regs()[0], 10);
    assert_eq!(jit.regs()[1], 0);
    // Z set by the final subs.
    assert_ne!(jit.cpsr() & (1 << 30), 0);
}

#[test]
fn cycle_budget_suspends_and_resumes() {
    let env = TestEnv::new(&[
        0xE3A0_0000, // mov r0, #0
        0xE280_0001, // add r0, r0, #1 <- loop
        0xEAFF_FFFD, // b .-4
    ]);
    let mut jit = make_jit(&env);

    // Two cycles only reach the first add once the loop is entered.
    run_ticks(&mut jit, &env, 2);
    let after_first = jit.regs()[0];

    // Resuming continues from the preserved PC, not from scratch.
    run_ticks(&mut jit, &env, 100);
    assert!(jit.regs()[0] > after_first);
    assert_eq!(jit.regs()[15] % 4, 0);
}

#[test]
fn conditional_block_skips_when_condition_fails() {
    let env = TestEnv::new(&[
        0xE350_0000, // cmp r0, #0
        0x13A0_1001, // movne r1, #1
        0x13A0_2002, // movne r2, #2
        0xE3A0_3003, // mov r3, #3
        INFINITE_LOOP,
    ]);

    let mut jit = make_jit(&env);
    run_ticks(&mut jit, &env, 10);
    // r0 == 0: both movne skipped, trailing mov executed.
    assert_eq!(jit.regs()[1], 0);
    assert_eq!(jit.regs()[2], 0);
    assert_eq!(jit.regs()[3], 3);

    let env = TestEnv::new(&[
        0xE350_0000, // cmp r0, #0
        0x13A0_1001, // movne r1, #1
        0x13A0_2002, // movne r2, #2
        0xE3A0_3003, // mov r3, #3
        INFINITE_LOOP,
    ]);
    let mut jit = make_jit(&env);
    jit.regs_mut()[0] = 5;
    run_ticks(&mut jit, &env, 10);
    assert_eq!(jit.regs()[1], 1);
    assert_eq!(jit.regs()[2], 2);
    assert_eq!(jit.regs()[3], 3);
}

#[test]
fn bl_and_bx_round_trip_through_the_rsb() {
    let env = TestEnv::new(&[
        0xE3A0_0001, // 0x00: mov r0, #1
        0xEB00_0002, // 0x04: bl 0x14
        0xE280_0010, // 0x08: add r0, r0, #16 (return lands here)
        INFINITE_LOOP, // 0x0C
        0x0000_0000, // 0x10: (pad)
        0xE280_0002, // 0x14: add r0, r0, #2
        0xE12F_FF1E, // 0x18: bx lr
    ]);
    let mut jit = make_jit(&env);

    run_ticks(&mut jit, &env, 100);

    assert_eq!(jit.regs()[0], 1 + 2 + 16);
    assert_eq!(jit.regs()[14], 0x08);
}

#[test]
fn repeated_calls_use_the_rsb_prediction() {
    // Call the same leaf twice; the second return should be predicted by
    // the RSB (not observable directly, but the result must be identical).
    let env = TestEnv::new(&[
        0xE3A0_0000, // 0x00: mov r0, #0
        0xEB00_0003, // 0x04: bl 0x18
        0xEB00_0002, // 0x08: bl 0x18
        0xE280_0100, // 0x0C: add r0, r0, #256
        INFINITE_LOOP, // 0x10
        0x0000_0000, // 0x14: (pad)
        0xE280_0001, // 0x18: add r0, r0, #1
        0xE12F_FF1E, // 0x1C: bx lr
    ]);
    let mut jit = make_jit(&env);

    run_ticks(&mut jit, &env, 100);
    assert_eq!(jit.regs()[0], 0x102);
}

#[test]
fn self_modification_requires_invalidation() {
    let env = TestEnv::new(&[
        0xE3A0_0001, // mov r0, #1
        INFINITE_LOOP,
    ]);
    let mut jit = make_jit(&env);

    run_ticks(&mut jit, &env, 2);
    assert_eq!(jit.regs()[0], 1);

    // Patch the guest code; without invalidation the stale block runs.
    env.0.borrow_mut().code_mem[0] = 0xE3A0_0002; // mov r0, #2
    jit.regs_mut()[0] = 0;
    jit.regs_mut()[15] = 0;
    run_ticks(&mut jit, &env, 2);
    assert_eq!(jit.regs()[0], 1);

    jit.invalidate_cache_range(0, 4);
    jit.regs_mut()[0] = 0;
    jit.regs_mut()[15] = 0;
    run_ticks(&mut jit, &env, 2);
    assert_eq!(jit.regs()[0], 2);
}

#[test]
fn invalidation_unchains_linked_blocks() {
    // Block A at 0 links to block B at 8. After invalidating B and
    // rewriting it, re-running A must reach the new B through the
    // dispatcher rather than the stale chained copy.
    let env = TestEnv::new(&[
        0xE3A0_0005, // 0x0: mov r0, #5
        0xEA00_0000, // 0x4: b 0xC
        0x0000_0000, // 0x8: (never executed)
        0xE280_1001, // 0xC: add r1, r0, #1
        INFINITE_LOOP,
    ]);
    let mut jit = make_jit(&env);

    run_ticks(&mut jit, &env, 10);
    assert_eq!(jit.regs()[1], 6);

    env.0.borrow_mut().code_mem[3] = 0xE280_1002; // add r1, r0, #2
    jit.invalidate_cache_range(0xC, 4);
    jit.regs_mut()[15] = 0;
    jit.regs_mut()[1] = 0;
    run_ticks(&mut jit, &env, 10);
    assert_eq!(jit.regs()[1], 7);
}

#[test]
fn clear_cache_recompiles_everything() {
    let env = TestEnv::new(&[
        0xE3A0_0001, // mov r0, #1
        INFINITE_LOOP,
    ]);
    let mut jit = make_jit(&env);
    run_ticks(&mut jit, &env, 2);

    env.0.borrow_mut().code_mem[0] = 0xE3A0_0003;
    jit.clear_cache();
    jit.regs_mut()[15] = 0;
    run_ticks(&mut jit, &env, 2);
    assert_eq!(jit.regs()[0], 3);
}

#[test]
fn undecoded_instructions_reach_the_interpreter() {
    let env = TestEnv::new(&[
        0xEE01_0F10, // mcr p15 (undecoded)
        0xEE01_0F10, // mcr p15
        0xE3A0_0009, // mov r0, #9
        INFINITE_LOOP,
    ]);
    let mut jit = make_jit(&env);

    run_ticks(&mut jit, &env, 10);

    // The two-insn run is merged into one interpreter call.
    assert_eq!(env.0.borrow().interpreted, vec![(0, 2)]);
    assert_eq!(jit.regs()[0], 9);
}

#[test]
fn svc_reaches_the_callback_and_continues() {
    let env = TestEnv::new(&[
        0xEF00_002A, // svc #42
        0xE3A0_0001, // mov r0, #1
        INFINITE_LOOP,
    ]);
    let mut jit = make_jit(&env);

    run_ticks(&mut jit, &env, 10);

    assert_eq!(env.0.borrow().svc_calls, vec![42]);
    assert_eq!(jit.regs()[0], 1);
}

#[test]
fn bkpt_raises_an_exception() {
    let env = TestEnv::new(&[
        0xE120_0070, // bkpt #0
        INFINITE_LOOP,
    ]);
    let mut jit = make_jit(&env);

    run_ticks(&mut jit, &env, 10);

    assert_eq!(
        env.0.borrow().exceptions,
        vec![(0, Exception::Breakpoint)]
    );
}

#[test]
fn halt_request_stops_after_one_block() {
    let env = TestEnv::new(&[INFINITE_LOOP]);
    let mut jit = make_jit(&env);

    jit.halt_execution();
    env.set_ticks(1000);
    jit.run().expect("run");

    // The halt was honored at the first terminal: almost the whole budget
    // remains.
    assert!(env.ticks_left() >= 999);
}

#[test]
fn exhausted_code_cache_reports_cache_full() {
    let env = TestEnv::new(&[INFINITE_LOOP]);
    let mut config = UserConfig::new(Box::new(env.clone()));
    // Just over the constructor's floor: room for the pool and thunks but
    // not for a worst-case block.
    config.code_cache_size = 4096 * 8 + 0x10000;
    let mut jit = weft::Jit::new(config).expect("jit construction");

    env.set_ticks(10);
    match jit.run() {
        Err(Error::CacheFull) => {}
        other => panic!("expected CacheFull, got {other:?}"),
    }
}
