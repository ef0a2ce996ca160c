//! yaspl: a small dynamically typed scripting language compiled to
//! bytecode and run on a stack VM with a mark-sweep collector.
//!
//! - [`frontend`]: indentation-aware lexer and token dumper.
//! - [`bytecode`]: opcodes, the bytecode container, the single-pass
//!   compiler, the disassembler and portable images.
//! - [`lang`]: values, heap objects, the hash table and value operations.
//! - [`runtime`]: the collector, the VM and its native functions.

pub mod bytecode;
pub mod frontend;
pub mod lang;
pub mod runtime;
