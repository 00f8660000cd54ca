//! Embedder-facing configuration and callback interface.

use crate::backend::x64::jit_state::CoreState;
use crate::tlb::TlbEntry;

/// Guest-visible exceptional conditions surfaced through
/// [`UserCallbacks::exception_raised`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// An instruction the architecture defines as UNDEFINED.
    UndefinedInstruction,
    /// A `BKPT` instruction.
    Breakpoint,
    /// An encoding whose behaviour the manual leaves UNPREDICTABLE
    /// (only raised when [`UserConfig::define_unpredictable_behaviour`]
    /// is set).
    UnpredictableInstruction,
}

// Wire values used between emitted code and the callback shims.
pub(crate) const EXC_UNDEFINED: u32 = 0;
pub(crate) const EXC_BREAKPOINT: u32 = 1;
pub(crate) const EXC_UNPREDICTABLE: u32 = 2;

impl Exception {
    pub(crate) fn from_code(code: u32) -> Exception {
        match code {
            EXC_BREAKPOINT => Exception::Breakpoint,
            EXC_UNPREDICTABLE => Exception::UnpredictableInstruction,
            _ => Exception::UndefinedInstruction,
        }
    }
}

/// Host services the translator calls out to.
///
/// The memory accessors are the slow path: emitted code reaches them only
/// when the TLB misses, the axis permission check fails, or no TLB/fastmem
/// was configured. They are invoked on the thread that called [`run`].
///
/// [`run`]: crate::Jit::run
pub trait UserCallbacks {
    fn memory_read8(&mut self, vaddr: u32) -> u8;
    fn memory_read16(&mut self, vaddr: u32) -> u16;
    fn memory_read32(&mut self, vaddr: u32) -> u32;
    fn memory_read64(&mut self, vaddr: u32) -> u64;

    fn memory_write8(&mut self, vaddr: u32, value: u8);
    fn memory_write16(&mut self, vaddr: u32, value: u16);
    fn memory_write32(&mut self, vaddr: u32, value: u32);
    fn memory_write64(&mut self, vaddr: u32, value: u64);

    /// Fetch a guest instruction word for translation.
    fn memory_read_code(&mut self, vaddr: u32) -> u32;

    /// Interpret `num_instructions` instructions starting at the guest PC in
    /// `state.regs[15]`. The implementation must advance `regs[15]` past the
    /// interpreted instructions.
    fn interpret_instruction(&mut self, state: &mut CoreState, num_instructions: u32);

    fn call_svc(&mut self, svc: u32);
    fn exception_raised(&mut self, pc: u32, exception: Exception);

    /// Report cycles consumed by the run that just returned.
    fn add_ticks(&mut self, ticks: u64);
    /// Cycle budget for the next run.
    fn get_ticks_remaining(&mut self) -> u64;
}

/// Jit construction options.
///
/// `tlb_entries` points at an embedder-allocated array of `1 << tlb_index_bits`
/// entries (see [`Tlb`]); it may be null to disable the TLB fast path. The
/// embedder must keep the array alive for the lifetime of the jit and must not
/// mutate it while `run` executes.
///
/// [`Tlb`]: crate::Tlb
pub struct UserConfig {
    pub callbacks: Box<dyn UserCallbacks>,

    /// Embedder-allocated TLB storage, or null.
    pub tlb_entries: *mut TlbEntry,
    /// log2 of the TLB entry count.
    pub tlb_index_bits: u32,
    /// log2 of the guest page size the TLB is indexed by.
    pub page_bits: u32,

    /// Byte size of the executable region.
    pub code_cache_size: usize,

    /// Optional direct host base for a contiguous guest address space.
    /// Takes precedence over the TLB when set.
    pub fastmem_pointer: Option<*mut u8>,

    /// Emit `exception_raised` calls for UNPREDICTABLE encodings instead of
    /// deferring them to the interpreter.
    pub define_unpredictable_behaviour: bool,

    /// Print the disassembly of each compiled block.
    pub print_disassembly: bool,
}

impl UserConfig {
    pub fn new(callbacks: Box<dyn UserCallbacks>) -> Self {
        Self {
            callbacks,
            tlb_entries: core::ptr::null_mut(),
            tlb_index_bits: 0,
            page_bits: 12,
            code_cache_size: 16 * 1024 * 1024,
            fastmem_pointer: None,
            define_unpredictable_behaviour: false,
            print_disassembly: false,
        }
    }
}
