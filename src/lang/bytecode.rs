//! Stack bytecode executed by the runner.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::output::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Jump targets are absolute indices into the enclosing code vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum Instr {
    Const(Value),
    Load(String),
    Define(String),
    Store(String),
    Pop,
    MakeList(usize),
    MakeRecord(Vec<String>),
    Index { line: usize },
    IterLen { line: usize },
    Neg { line: usize },
    Not,
    Binary { op: BinOp, line: usize },
    Jump(usize),
    JumpIfFalse(usize),
    JumpIfFalseKeep(usize),
    JumpIfTrueKeep(usize),
    Call { name: String, argc: usize, line: usize },
    Return,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub code: Vec<Instr>,
}

/// Executable output of the compiler stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledUnit {
    pub main: Vec<Instr>,
    pub functions: Vec<Function>,
}

impl CompiledUnit {
    /// Disassembly of every code block, main first.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        write_block(&mut out, "main", &[], &self.main);
        for function in &self.functions {
            out.push('\n');
            write_block(&mut out, &function.name, &function.params, &function.code);
        }
        out
    }
}

fn write_block(out: &mut String, name: &str, params: &[String], code: &[Instr]) {
    let _ = writeln!(out, "fn {}({}):", name, params.join(", "));
    for (at, instr) in code.iter().enumerate() {
        let _ = writeln!(out, "  {at:04}  {}", describe(instr));
    }
}

fn describe(instr: &Instr) -> String {
    match instr {
        Instr::Const(v) => format!("const {}", v.render_nested()),
        Instr::Load(name) => format!("load {name}"),
        Instr::Define(name) => format!("define {name}"),
        Instr::Store(name) => format!("store {name}"),
        Instr::Pop => "pop".to_string(),
        Instr::MakeList(n) => format!("list {n}"),
        Instr::MakeRecord(keys) => format!("record {}", keys.join(", ")),
        Instr::Index { .. } => "index".to_string(),
        Instr::IterLen { .. } => "iter_len".to_string(),
        Instr::Neg { .. } => "neg".to_string(),
        Instr::Not => "not".to_string(),
        Instr::Binary { op, .. } => format!("{op:?}").to_lowercase(),
        Instr::Jump(t) => format!("jump {t:04}"),
        Instr::JumpIfFalse(t) => format!("jump_if_false {t:04}"),
        Instr::JumpIfFalseKeep(t) => format!("jump_if_false_keep {t:04}"),
        Instr::JumpIfTrueKeep(t) => format!("jump_if_true_keep {t:04}"),
        Instr::Call { name, argc, .. } => format!("call {name}/{argc}"),
        Instr::Return => "return".to_string(),
    }
}
