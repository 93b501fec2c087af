//! Lowers the statement tree to bytecode.

use std::collections::HashSet;

use super::ast::{BinaryOp, Expr, Stmt, StmtKind, UnaryOp};
use super::bytecode::{BinOp, CompiledUnit, Function, Instr};
use super::parser;
use crate::error::CompileError;
use crate::output::Value;

/// Compiled unit plus its disassembly.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledArtifact {
    pub unit: CompiledUnit,
    pub listing: String,
}

pub fn compile(source: &str) -> Result<CompiledArtifact, CompileError> {
    let program = parser::parse_program(source)?;
    let unit = Codegen::default().program(&program)?;
    let listing = unit.listing();
    Ok(CompiledArtifact { unit, listing })
}

#[derive(Default)]
struct LoopCtx {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

#[derive(Default)]
struct Block {
    code: Vec<Instr>,
    loops: Vec<LoopCtx>,
    in_function: bool,
}

impl Block {
    fn emit(&mut self, instr: Instr) -> usize {
        self.code.push(instr);
        self.code.len() - 1
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn patch(&mut self, at: usize, target: usize) {
        match &mut self.code[at] {
            Instr::Jump(t)
            | Instr::JumpIfFalse(t)
            | Instr::JumpIfFalseKeep(t)
            | Instr::JumpIfTrueKeep(t) => *t = target,
            _ => {}
        }
    }
}

#[derive(Default)]
struct Codegen {
    functions: Vec<Function>,
    function_names: HashSet<String>,
    hidden: usize,
    /// Line of the statement being lowered, attached to fallible instructions.
    line: usize,
}

impl Codegen {
    fn program(mut self, program: &[Stmt]) -> Result<CompiledUnit, CompileError> {
        let mut main = Block::default();
        for stmt in program {
            match &stmt.kind {
                StmtKind::Fn { name, params, body } => {
                    self.function(stmt.line, name, params, body)?
                }
                _ => self.stmt(&mut main, stmt)?,
            }
        }
        Ok(CompiledUnit {
            main: main.code,
            functions: self.functions,
        })
    }

    fn function(
        &mut self,
        line: usize,
        name: &str,
        params: &[String],
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        if !self.function_names.insert(name.to_string()) {
            return Err(line_error(format!("function `{name}` is declared twice"), line));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = params.iter().find(|p| !seen.insert(p.as_str())) {
            return Err(line_error(
                format!("parameter `{dup}` repeated in function `{name}`"),
                line,
            ));
        }
        let mut block = Block {
            in_function: true,
            ..Block::default()
        };
        self.stmts(&mut block, body)?;
        block.emit(Instr::Const(Value::Null));
        block.emit(Instr::Return);
        self.functions.push(Function {
            name: name.to_string(),
            params: params.to_vec(),
            code: block.code,
        });
        Ok(())
    }

    fn stmts(&mut self, block: &mut Block, stmts: &[Stmt]) -> Result<(), CompileError> {
        for stmt in stmts {
            self.stmt(block, stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, block: &mut Block, stmt: &Stmt) -> Result<(), CompileError> {
        let line = stmt.line;
        self.line = line;
        match &stmt.kind {
            StmtKind::Let { name, value } => {
                self.expr(block, value)?;
                block.emit(Instr::Define(name.clone()));
            }
            StmtKind::Assign { name, value } => {
                self.expr(block, value)?;
                block.emit(Instr::Store(name.clone()));
            }
            StmtKind::Expr(expr) => {
                self.expr(block, expr)?;
                block.emit(Instr::Pop);
            }
            StmtKind::If {
                cond,
                then,
                otherwise,
            } => {
                self.expr(block, cond)?;
                let to_else = block.emit(Instr::JumpIfFalse(0));
                self.stmts(block, then)?;
                match otherwise {
                    Some(otherwise) => {
                        let to_end = block.emit(Instr::Jump(0));
                        let else_at = block.here();
                        block.patch(to_else, else_at);
                        self.stmts(block, otherwise)?;
                        let end = block.here();
                        block.patch(to_end, end);
                    }
                    None => {
                        let end = block.here();
                        block.patch(to_else, end);
                    }
                }
            }
            StmtKind::While { cond, body } => {
                let start = block.here();
                self.expr(block, cond)?;
                let exit = block.emit(Instr::JumpIfFalse(0));
                self.loop_body(block, body, start, exit)?;
            }
            StmtKind::For {
                var,
                iterable,
                body,
            } => {
                let id = self.hidden;
                self.hidden += 1;
                let items = format!("#items{id}");
                let cursor = format!("#cursor{id}");

                self.expr(block, iterable)?;
                block.emit(Instr::Define(items.clone()));
                block.emit(Instr::Const(Value::Num(0.0)));
                block.emit(Instr::Define(cursor.clone()));

                let start = block.here();
                block.emit(Instr::Load(cursor.clone()));
                block.emit(Instr::Load(items.clone()));
                block.emit(Instr::IterLen { line });
                block.emit(Instr::Binary {
                    op: BinOp::Lt,
                    line,
                });
                let exit = block.emit(Instr::JumpIfFalse(0));
                block.emit(Instr::Load(items));
                block.emit(Instr::Load(cursor.clone()));
                block.emit(Instr::Index { line });
                block.emit(Instr::Define(var.clone()));

                block.loops.push(LoopCtx::default());
                self.stmts(block, body)?;
                let ctx = block.loops.pop().unwrap_or_default();
                let step = block.here();
                block.emit(Instr::Load(cursor.clone()));
                block.emit(Instr::Const(Value::Num(1.0)));
                block.emit(Instr::Binary {
                    op: BinOp::Add,
                    line,
                });
                block.emit(Instr::Store(cursor));
                block.emit(Instr::Jump(start));
                let end = block.here();
                block.patch(exit, end);
                for at in ctx.continues {
                    block.patch(at, step);
                }
                for at in ctx.breaks {
                    block.patch(at, end);
                }
            }
            StmtKind::Fn { name, .. } => {
                return Err(line_error(
                    format!("function `{name}` must be declared at the top level"),
                    line,
                ));
            }
            StmtKind::Return(value) => {
                if !block.in_function {
                    return Err(line_error("`return` outside of a function", line));
                }
                match value {
                    Some(value) => self.expr(block, value)?,
                    None => {
                        block.emit(Instr::Const(Value::Null));
                    }
                }
                block.emit(Instr::Return);
            }
            StmtKind::Break | StmtKind::Continue => {
                let is_break = matches!(stmt.kind, StmtKind::Break);
                let at = block.emit(Instr::Jump(0));
                let Some(ctx) = block.loops.last_mut() else {
                    let word = if is_break { "break" } else { "continue" };
                    return Err(line_error(format!("`{word}` outside of a loop"), line));
                };
                if is_break {
                    ctx.breaks.push(at);
                } else {
                    ctx.continues.push(at);
                }
            }
        }
        Ok(())
    }

    /// While-loop body: `continue` re-evaluates the condition at `start`.
    fn loop_body(
        &mut self,
        block: &mut Block,
        body: &[Stmt],
        start: usize,
        exit: usize,
    ) -> Result<(), CompileError> {
        block.loops.push(LoopCtx::default());
        self.stmts(block, body)?;
        let ctx = block.loops.pop().unwrap_or_default();
        block.emit(Instr::Jump(start));
        let end = block.here();
        block.patch(exit, end);
        for at in ctx.continues {
            block.patch(at, start);
        }
        for at in ctx.breaks {
            block.patch(at, end);
        }
        Ok(())
    }

    fn expr(&mut self, block: &mut Block, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Num(n) => {
                block.emit(Instr::Const(Value::Num(*n)));
            }
            Expr::Str(s) => {
                block.emit(Instr::Const(Value::Str(s.clone())));
            }
            Expr::Bool(b) => {
                block.emit(Instr::Const(Value::Bool(*b)));
            }
            Expr::Null => {
                block.emit(Instr::Const(Value::Null));
            }
            Expr::List(items) => {
                for item in items {
                    self.expr(block, item)?;
                }
                block.emit(Instr::MakeList(items.len()));
            }
            Expr::Record(fields) => {
                for (_, value) in fields {
                    self.expr(block, value)?;
                }
                block.emit(Instr::MakeRecord(
                    fields.iter().map(|(k, _)| k.clone()).collect(),
                ));
            }
            Expr::Var(name) => {
                block.emit(Instr::Load(name.clone()));
            }
            Expr::Unary { op, expr } => {
                self.expr(block, expr)?;
                block.emit(match op {
                    UnaryOp::Neg => Instr::Neg { line: self.line },
                    UnaryOp::Not => Instr::Not,
                });
            }
            Expr::Binary { op, lhs, rhs } => {
                self.expr(block, lhs)?;
                self.expr(block, rhs)?;
                block.emit(Instr::Binary {
                    op: lower_op(*op),
                    line: self.line,
                });
            }
            Expr::And(lhs, rhs) => {
                self.expr(block, lhs)?;
                let skip = block.emit(Instr::JumpIfFalseKeep(0));
                block.emit(Instr::Pop);
                self.expr(block, rhs)?;
                let end = block.here();
                block.patch(skip, end);
            }
            Expr::Or(lhs, rhs) => {
                self.expr(block, lhs)?;
                let skip = block.emit(Instr::JumpIfTrueKeep(0));
                block.emit(Instr::Pop);
                self.expr(block, rhs)?;
                let end = block.here();
                block.patch(skip, end);
            }
            Expr::Call { name, args, line } => {
                for arg in args {
                    self.expr(block, arg)?;
                }
                block.emit(Instr::Call {
                    name: name.clone(),
                    argc: args.len(),
                    line: *line,
                });
            }
            Expr::Index {
                target,
                index,
                line,
            } => {
                self.expr(block, target)?;
                self.expr(block, index)?;
                block.emit(Instr::Index { line: *line });
            }
        }
        Ok(())
    }
}

fn lower_op(op: BinaryOp) -> BinOp {
    match op {
        BinaryOp::Add => BinOp::Add,
        BinaryOp::Sub => BinOp::Sub,
        BinaryOp::Mul => BinOp::Mul,
        BinaryOp::Div => BinOp::Div,
        BinaryOp::Rem => BinOp::Rem,
        BinaryOp::Eq => BinOp::Eq,
        BinaryOp::Ne => BinOp::Ne,
        BinaryOp::Lt => BinOp::Lt,
        BinaryOp::Le => BinOp::Le,
        BinaryOp::Gt => BinOp::Gt,
        BinaryOp::Ge => BinOp::Ge,
    }
}

fn line_error(message: impl Into<String>, line: usize) -> CompileError {
    CompileError {
        message: message.into(),
        line: Some(line),
        column: None,
    }
}
