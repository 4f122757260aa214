//! Register-based bytecode virtual machine for gameplay scripts.
//!
//! The VM executes functions produced by the script compiler (or the text
//! assembler) and is embedded by an engine that owns object lifetime, class
//! metadata and diagnostics.
//!
//! # Architecture
//!
//! - **Registers**: four typed banks per frame (int, float, string, pointer),
//!   sized by the function's [`program::FrameLayout`]
//! - **Instruction format**: fixed 32-bit words, see [`isa`]
//! - **Execution model**: script calls push frames on an explicit stack;
//!   natives may re-enter the VM through [`vm::Vm::call`]
//! - **Memory**: VM-visible blocks and managed objects live in a [`heap::Heap`]
//!   reached through the [`host::Host`]
//! - **Aborts**: fatal conditions unwind every frame of the current invocation
//!   and carry one attribution line per frame, see [`errors::ScriptAbort`]
//!
//! # Modules
//!
//! - [`assembler`]: Assembly parsing, diagnostics, and module generation
//! - [`errors`]: Contract violations and script aborts
//! - [`function`]: Script/native functions and the function table
//! - [`heap`]: Memory blocks, managed objects and classes
//! - [`host`]: The engine interface
//! - [`isa`]: Instruction set definition and opcode mappings
//! - [`operand`]: Selectors carried in instruction fields
//! - [`program`]: Compiled functions and module images
//! - [`value`]: Register values, pointers and names
//! - [`vm`]: The interpreter

pub mod assembler;
pub mod errors;
pub mod function;
pub mod heap;
pub mod host;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod operand;
pub mod program;
pub mod value;
pub mod vm;
