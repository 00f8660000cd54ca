//! The public jit instance and its dispatcher loop.
//!
//! `Run` enters emitted code at the compiled entry for the current guest
//! location; emitted code executes until a terminal exhausts the cycle
//! budget, observes a halt request, or reaches an unresolved branch target.
//! Unresolved targets trampoline back here, where the block is compiled,
//! installed, and chained into its callers before execution re-enters.
//!
//! A jit instance is single-threaded: at most one host thread may be inside
//! [`Jit::run`] or mutating the caches at any time. Cache invalidation must
//! happen between runs, never from inside a callback.

use crate::backend::x64::block_cache::BlockDescriptor;
use crate::backend::x64::code_buffer::CodeBuffer;
use crate::backend::x64::emit::Emitter;
use crate::backend::x64::jit_state::{CoreState, JitState};
use crate::backend::x64::reg_alloc::RegAlloc;
use crate::backend::x64::{HostShims, MemoryConfig};
use crate::config::{Exception, UserCallbacks, UserConfig};
use crate::frontend::a32::{self, TranslationOptions};
use crate::ir::{opt, LocationDescriptor};
use crate::{Error, Result};
use tracing::{debug, trace};

/// Worst-case emitted size of one block; compilation refuses to start with
/// less than this left in the buffer.
const MAX_BLOCK_BYTES: usize = 64 * 1024;

/// Thin cell holding the fat callback pointer, so emitted code can pass a
/// single-register context to the `extern "C"` shims.
struct CallbackCell {
    cb: *mut dyn UserCallbacks,
}

extern "C" fn shim_read8(cell: *mut CallbackCell, vaddr: u32) -> u32 {
    unsafe { (*(*cell).cb).memory_read8(vaddr) as u32 }
}

extern "C" fn shim_read16(cell: *mut CallbackCell, vaddr: u32) -> u32 {
    unsafe { (*(*cell).cb).memory_read16(vaddr) as u32 }
}

extern "C" fn shim_read32(cell: *mut CallbackCell, vaddr: u32) -> u32 {
    unsafe { (*(*cell).cb).memory_read32(vaddr) }
}

extern "C" fn shim_read64(cell: *mut CallbackCell, vaddr: u32) -> u64 {
    unsafe { (*(*cell).cb).memory_read64(vaddr) }
}

extern "C" fn shim_write8(cell: *mut CallbackCell, vaddr: u32, value: u32) {
    unsafe { (*(*cell).cb).memory_write8(vaddr, value as u8) }
}

extern "C" fn shim_write16(cell: *mut CallbackCell, vaddr: u32, value: u32) {
    unsafe { (*(*cell).cb).memory_write16(vaddr, value as u16) }
}

extern "C" fn shim_write32(cell: *mut CallbackCell, vaddr: u32, value: u32) {
    unsafe { (*(*cell).cb).memory_write32(vaddr, value) }
}

extern "C" fn shim_write64(cell: *mut CallbackCell, vaddr: u32, value: u64) {
    unsafe { (*(*cell).cb).memory_write64(vaddr, value) }
}

extern "C" fn shim_call_svc(cell: *mut CallbackCell, svc: u32) {
    unsafe { (*(*cell).cb).call_svc(svc) }
}

extern "C" fn shim_exception_raised(cell: *mut CallbackCell, pc: u32, code: u32) {
    unsafe { (*(*cell).cb).exception_raised(pc, Exception::from_code(code)) }
}

extern "C" fn shim_interpret(cell: *mut CallbackCell, state: *mut CoreState, num: u32) {
    unsafe { (*(*cell).cb).interpret_instruction(&mut *state, num) }
}

pub struct Jit {
    state: Box<JitState>,
    buffer: CodeBuffer,
    emitter: Emitter,
    reg_alloc: RegAlloc,
    callbacks: Box<dyn UserCallbacks>,
    // Kept alive for emitted code; points into `callbacks`.
    _cell: Box<CallbackCell>,
    shims: HostShims,
    mem: MemoryConfig,
    translation_options: TranslationOptions,
    print_disassembly: bool,
}

impl Jit {
    pub fn new(config: UserConfig) -> Result<Self> {
        if !config.tlb_entries.is_null() {
            if !(1..=24).contains(&config.tlb_index_bits) {
                return Err(Error::Config(format!(
                    "tlb_index_bits = {} is out of range",
                    config.tlb_index_bits
                )));
            }
            if !(1..32).contains(&config.page_bits) {
                return Err(Error::Config(format!(
                    "page_bits = {} is out of range",
                    config.page_bits
                )));
            }
        }

        let buffer = CodeBuffer::new(
            config.code_cache_size,
            JitState::off_save_host_mxcsr(),
            JitState::off_guest_mxcsr(),
        )?;

        let mut callbacks = config.callbacks;
        let cell = Box::new(CallbackCell {
            cb: &mut *callbacks as *mut dyn UserCallbacks,
        });

        let shims = HostShims {
            ctx: &*cell as *const CallbackCell as u64,
            read8: shim_read8 as usize as u64,
            read16: shim_read16 as usize as u64,
            read32: shim_read32 as usize as u64,
            read64: shim_read64 as usize as u64,
            write8: shim_write8 as usize as u64,
            write16: shim_write16 as usize as u64,
            write32: shim_write32 as usize as u64,
            write64: shim_write64 as usize as u64,
            call_svc: shim_call_svc as usize as u64,
            exception_raised: shim_exception_raised as usize as u64,
            interpret: shim_interpret as usize as u64,
        };

        let mem = MemoryConfig {
            tlb_entries: config.tlb_entries as u64,
            tlb_index_mask: if config.tlb_entries.is_null() {
                0
            } else {
                (1u32 << config.tlb_index_bits) - 1
            },
            page_bits: config.page_bits,
            fastmem: config.fastmem_pointer.map_or(0, |p| p as u64),
        };

        let mut state = Box::new(JitState::new());
        state.update_guest_mxcsr();

        Ok(Self {
            state,
            buffer,
            emitter: Emitter::new(),
            reg_alloc: RegAlloc::new(),
            callbacks,
            _cell: cell,
            shims,
            mem,
            translation_options: TranslationOptions {
                define_unpredictable_behaviour: config.define_unpredictable_behaviour,
            },
            print_disassembly: config.print_disassembly,
        })
    }

    /// Execute guest code until the embedder's cycle budget is consumed or
    /// a halt is requested.
    pub fn run(&mut self) -> Result<()> {
        let cycles = self.callbacks.get_ticks_remaining() as i64;
        self.state.cycles_remaining = cycles;
        self.state.upcoming_location = self.current_location().value();

        loop {
            let desc = LocationDescriptor::from_value(self.state.upcoming_location);
            let cached = self.emitter.get_basic_block(desc).map(|b| b.entrypoint);
            let entrypoint = match cached {
                Some(entrypoint) => entrypoint,
                None => self.compile(desc)?.entrypoint,
            };
            trace!("dispatching to {:#x} at host {entrypoint:#x}", desc.pc());
            self.enter(entrypoint);

            if self.state.halt_requested != 0 || self.state.cycles_remaining <= 0 {
                break;
            }
        }

        self.state.halt_requested = 0;
        self.state.core.regs[15] =
            LocationDescriptor::from_value(self.state.upcoming_location).pc();
        let consumed = cycles - self.state.cycles_remaining;
        self.callbacks.add_ticks(consumed.max(0) as u64);
        Ok(())
    }

    fn enter(&mut self, entrypoint: u64) {
        let run_code: extern "C" fn(*mut JitState, u64) =
            unsafe { std::mem::transmute(self.buffer.run_code_address() as usize) };
        run_code(&mut *self.state as *mut JitState, entrypoint);
    }

    fn compile(&mut self, desc: LocationDescriptor) -> Result<BlockDescriptor> {
        if self.buffer.remaining() < MAX_BLOCK_BYTES {
            debug!("code cache exhausted while compiling {:#x}", desc.pc());
            return Err(Error::CacheFull);
        }

        let mut block = {
            let callbacks = &mut *self.callbacks;
            let mut read_code = |vaddr: u32| callbacks.memory_read_code(vaddr);
            let mut block = a32::translate(desc, &mut read_code, self.translation_options);
            opt::merge_interpret_runs(&mut block, &mut read_code, self.translation_options);
            block
        };

        let descriptor = self.emitter.emit_block(
            &mut self.buffer,
            &mut self.reg_alloc,
            &self.shims,
            &self.mem,
            &mut block,
        );
        if self.print_disassembly {
            Self::print_code(&descriptor);
        }
        Ok(descriptor)
    }

    /// Disassemble and print one compiled block.
    fn print_code(block: &BlockDescriptor) {
        use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

        println!(
            "Compiled block for guest {:#010x} at {:#x} ({} bytes)",
            block.start_location.pc(),
            block.entrypoint,
            block.size
        );

        let bytes =
            unsafe { std::slice::from_raw_parts(block.entrypoint as *const u8, block.size) };
        let mut decoder = Decoder::with_ip(64, bytes, block.entrypoint, DecoderOptions::NONE);
        let mut formatter = IntelFormatter::new();
        let mut output = String::new();
        let mut instruction = iced_x86::Instruction::default();

        while decoder.can_decode() {
            decoder.decode_out(&mut instruction);
            output.clear();
            formatter.format(&instruction, &mut output);
            println!("  {:016x}: {}", instruction.ip(), output);
        }
    }

    fn current_location(&self) -> LocationDescriptor {
        LocationDescriptor::new(
            self.state.core.regs[15],
            self.state.core.thumb(),
            self.state.core.fpscr_mode,
        )
    }

    pub fn regs(&self) -> &[u32; 16] {
        &self.state.core.regs
    }

    pub fn regs_mut(&mut self) -> &mut [u32; 16] {
        &mut self.state.core.regs
    }

    pub fn ext_regs(&self) -> &[u32; 64] {
        &self.state.core.ext_regs
    }

    pub fn ext_regs_mut(&mut self) -> &mut [u32; 64] {
        &mut self.state.core.ext_regs
    }

    pub fn cpsr(&self) -> u32 {
        self.state.core.cpsr()
    }

    pub fn set_cpsr(&mut self, cpsr: u32) {
        self.state.core.set_cpsr(cpsr);
    }

    pub fn fpscr(&self) -> u32 {
        self.state.core.fpscr()
    }

    pub fn set_fpscr(&mut self, fpscr: u32) {
        self.state.core.set_fpscr(fpscr);
        self.state.update_guest_mxcsr();
    }

    /// Request a halt; takes effect at the next CheckHalt terminal.
    pub fn halt_execution(&mut self) {
        self.state.halt_requested = 1;
    }

    /// Drop every compiled block and rewind the code buffer.
    pub fn clear_cache(&mut self) {
        debug!("clearing code cache");
        self.emitter.clear_cache();
        self.buffer.rewind_to_code_begin();
        self.state.reset_rsb();
    }

    /// Evict blocks translated from guest bytes in
    /// `[start, start + length)`, e.g. after guest self-modifying code.
    /// Must not be called from inside a callback.
    pub fn invalidate_cache_range(&mut self, start: u32, length: u32) {
        if length == 0 {
            return;
        }
        let end = start.checked_add(length - 1).unwrap_or(u32::MAX);
        self.emitter
            .invalidate_cache_ranges(&mut self.buffer, &[(start, end)]);
        // The ring may hold code pointers into the evicted blocks.
        self.state.reset_rsb();
    }

    /// Reset guest state (registers, flags, RSB); compiled code survives.
    pub fn reset(&mut self) {
        self.state.reset();
        self.state.update_guest_mxcsr();
    }
}
