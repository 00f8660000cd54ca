//! Host code generation. x86-64 is the only supported host.

pub mod x64;
