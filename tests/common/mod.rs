#![allow(dead_code)] // not every test binary uses every helper

//! Shared test environment: an embedder with deterministic memory.
//!
//! Unwritten data memory reads as its own address bytes (so a 32-bit read
//! at 0x1234500C yields 0x0F0E0D0C), writes land in a map, and code is
//! fetched from a word vector based at guest address zero. Instructions
//! past the end read as `b .` so runaway fetches spin instead of decoding
//! garbage.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use weft::{CoreState, Exception, Jit, UserCallbacks, UserConfig};

pub const INFINITE_LOOP: u32 = 0xEAFF_FFFE; // b .

#[derive(Default)]
pub struct EnvInner {
    pub code_mem: Vec<u32>,
    pub written: HashMap<u32, u8>,
    pub ticks_left: u64,
    pub slow_path_reads: Vec<u32>,
    pub svc_calls: Vec<u32>,
    pub exceptions: Vec<(u32, Exception)>,
    pub interpreted: Vec<(u32, u32)>,
}

impl EnvInner {
    fn read_byte(&mut self, vaddr: u32) -> u8 {
        match self.written.get(&vaddr) {
            Some(&b) => b,
            None => vaddr as u8,
        }
    }
}

#[derive(Clone, Default)]
pub struct TestEnv(pub Rc<RefCell<EnvInner>>);

impl TestEnv {
    pub fn new(code: &[u32]) -> Self {
        let env = TestEnv::default();
        env.0.borrow_mut().code_mem = code.to_vec();
        env
    }

    pub fn set_ticks(&self, ticks: u64) {
        self.0.borrow_mut().ticks_left = ticks;
    }

    pub fn ticks_left(&self) -> u64 {
        self.0.borrow().ticks_left
    }
}

impl UserCallbacks for TestEnv {
    fn memory_read8(&mut self, vaddr: u32) -> u8 {
        self.0.borrow_mut().slow_path_reads.push(vaddr);
        self.0.borrow_mut().read_byte(vaddr)
    }

    fn memory_read16(&mut self, vaddr: u32) -> u16 {
        let mut inner = self.0.borrow_mut();
        inner.slow_path_reads.push(vaddr);
        u16::from_le_bytes([inner.read_byte(vaddr), inner.read_byte(vaddr + 1)])
    }

    fn memory_read32(&mut self, vaddr: u32) -> u32 {
        let mut inner = self.0.borrow_mut();
        inner.slow_path_reads.push(vaddr);
        u32::from_le_bytes([
            inner.read_byte(vaddr),
            inner.read_byte(vaddr + 1),
            inner.read_byte(vaddr + 2),
            inner.read_byte(vaddr + 3),
        ])
    }

    fn memory_read64(&mut self, vaddr: u32) -> u64 {
        let lo = self.memory_read32(vaddr) as u64;
        let hi = self.memory_read32(vaddr + 4) as u64;
        lo | (hi << 32)
    }

    fn memory_write8(&mut self, vaddr: u32, value: u8) {
        self.0.borrow_mut().written.insert(vaddr, value);
    }

    fn memory_write16(&mut self, vaddr: u32, value: u16) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.memory_write8(vaddr + i as u32, b);
        }
    }

    fn memory_write32(&mut self, vaddr: u32, value: u32) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.memory_write8(vaddr + i as u32, b);
        }
    }

    fn memory_write64(&mut self, vaddr: u32, value: u64) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.memory_write8(vaddr + i as u32, b);
        }
    }

    fn memory_read_code(&mut self, vaddr: u32) -> u32 {
        self.0
            .borrow()
            .code_mem
            .get((vaddr / 4) as usize)
            .copied()
            .unwrap_or(INFINITE_LOOP)
    }

    fn interpret_instruction(&mut self, state: &mut CoreState, num_instructions: u32) {
        self.0
            .borrow_mut()
            .interpreted
            .push((state.regs[15], num_instructions));
        state.regs[15] = state.regs[15].wrapping_add(4 * num_instructions);
    }

    fn call_svc(&mut self, svc: u32) {
        self.0.borrow_mut().svc_calls.push(svc);
    }

    fn exception_raised(&mut self, pc: u32, exception: Exception) {
        self.0.borrow_mut().exceptions.push((pc, exception));
    }

    fn add_ticks(&mut self, ticks: u64) {
        let mut inner = self.0.borrow_mut();
        inner.ticks_left = inner.ticks_left.saturating_sub(ticks);
    }

    fn get_ticks_remaining(&mut self) -> u64 {
        self.0.borrow().ticks_left
    }
}

/// A jit over the environment with default (callback-only) memory.
pub fn make_jit(env: &TestEnv) -> Jit {
    let config = UserConfig::new(Box::new(env.clone()));
    Jit::new(config).expect("jit construction")
}

/// Run until `ticks` cycles are consumed (single `run` call).
pub fn run_ticks(jit: &mut Jit, env: &TestEnv, ticks: u64) {
    env.set_ticks(ticks);
    jit.run().expect("run");
}
