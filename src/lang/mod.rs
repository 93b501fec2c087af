//! The scripting language: parse, lower to bytecode, interpret.

mod ast;
mod builtins;
mod bytecode;
mod compiler;
mod parser;
mod vm;

pub use bytecode::{BinOp, CompiledUnit, Function, Instr};
pub use compiler::{compile, CompiledArtifact};
pub use parser::{MAX_NESTING_DEPTH, MAX_TREE_DEPTH};
pub use vm::{Vm, MAX_CALL_DEPTH};
