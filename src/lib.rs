//! Weft - a dynamic binary translator core for ARM guests on x86-64 hosts.
//!
//! Weft accepts 32-bit ARM (A32) machine code through an embedder-supplied
//! memory callback, translates contiguous runs of it into an intermediate
//! representation, and emits native x86-64 code that a host thread executes
//! directly to simulate the guest CPU.
//!
//! # Modules
//!
//! - [`jit`] - The public [`Jit`] instance: dispatcher loop and cache control
//! - [`tlb`] - Software guest-page → host-pointer cache used by emitted code
//! - [`frontend`] - A32 instruction decoding into IR
//! - [`backend`] - x86-64 code emission, block cache and chaining
//!
//! # Error Handling
//!
//! All fallible operations use the consolidated [`Error`] type. Guest-visible
//! conditions (undefined instructions, SVCs) are not errors; they are routed
//! through the [`config::UserCallbacks`] interface.

pub mod config;
pub mod frontend;
pub mod ir;
pub mod jit;
pub mod tlb;

pub mod backend;

/// Consolidated error type for all Weft operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("code cache is full; call Jit::clear_cache() and re-run")]
    CacheFull,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("memory mapping error: {0}")]
    MemoryMapping(String),
}

pub type Result<T> = core::result::Result<T, Error>;

pub use backend::x64::jit_state::CoreState;
pub use config::{Exception, UserCallbacks, UserConfig};
pub use jit::Jit;
pub use tlb::{Tlb, TlbEntry, PERM_EXECUTE, PERM_READ, PERM_WRITE};
