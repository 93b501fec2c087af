//! Bytecode interpreter.
//!
//! Execution uses an explicit frame stack so recursion depth is bounded by
//! [`MAX_CALL_DEPTH`] rather than the native stack. Names are resolved at run
//! time: function locals first, then globals, then builtins.

use std::collections::HashMap;

use super::builtins;
use super::bytecode::{BinOp, CompiledUnit, Function, Instr};
use crate::error::RuntimeError;
use crate::output::{check_container_depth, OutputItem, Value};

pub const MAX_CALL_DEPTH: usize = 512;

struct Frame<'u> {
    code: &'u [Instr],
    ip: usize,
    /// `None` for the top-level frame, whose variables are the globals.
    locals: Option<HashMap<String, Value>>,
    /// Line of the call that created this frame.
    call_line: usize,
}

pub struct Vm<'u> {
    functions: HashMap<&'u str, &'u Function>,
    globals: HashMap<String, Value>,
    frames: Vec<Frame<'u>>,
    stack: Vec<Value>,
    output: Vec<OutputItem>,
}

impl<'u> Vm<'u> {
    pub fn new(unit: &'u CompiledUnit) -> Self {
        let functions = unit
            .functions
            .iter()
            .map(|f| (f.name.as_str(), f))
            .collect();
        Self {
            functions,
            globals: HashMap::new(),
            frames: vec![Frame {
                code: &unit.main,
                ip: 0,
                locals: None,
                call_line: 0,
            }],
            stack: Vec::new(),
            output: Vec::new(),
        }
    }

    /// Run to completion, returning the items emitted in order.
    pub fn run(mut self) -> Result<Vec<OutputItem>, RuntimeError> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                break;
            };
            let code = frame.code;
            let Some(instr) = code.get(frame.ip) else {
                if self.frames.len() == 1 {
                    break;
                }
                // Function bodies always end in `return`; treat running off the end the same way.
                self.frames.pop();
                self.stack.push(Value::Null);
                continue;
            };
            frame.ip += 1;
            self.step(instr)?;
        }
        Ok(self.output)
    }

    fn step(&mut self, instr: &'u Instr) -> Result<(), RuntimeError> {
        match instr {
            Instr::Const(v) => self.stack.push(v.clone()),
            Instr::Load(name) => {
                let value = self
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| self.error(format!("undefined variable `{name}`")))?;
                self.stack.push(value);
            }
            Instr::Define(name) => {
                let value = self.pop()?;
                self.scope_mut().insert(name.clone(), value);
            }
            Instr::Store(name) => {
                let value = self.pop()?;
                let slot = match self.frames.last_mut().and_then(|f| f.locals.as_mut()) {
                    Some(locals) if locals.contains_key(name) => locals.get_mut(name),
                    _ => self.globals.get_mut(name),
                };
                match slot {
                    Some(slot) => *slot = value,
                    None => {
                        let message = format!("assignment to undeclared variable `{name}`");
                        return Err(self.error(message));
                    }
                }
            }
            Instr::Pop => {
                self.pop()?;
            }
            Instr::MakeList(n) => {
                let items = self.pop_n(*n)?;
                check_container_depth(&items).map_err(|m| self.error(m))?;
                self.stack.push(Value::List(items));
            }
            Instr::MakeRecord(keys) => {
                let values = self.pop_n(keys.len())?;
                check_container_depth(&values).map_err(|m| self.error(m))?;
                let mut fields: Vec<(String, Value)> = Vec::with_capacity(keys.len());
                for (key, value) in keys.iter().zip(values) {
                    match fields.iter_mut().find(|(k, _)| k == key) {
                        Some(existing) => existing.1 = value,
                        None => fields.push((key.clone(), value)),
                    }
                }
                self.stack.push(Value::Record(fields));
            }
            Instr::Index { line } => {
                let index = self.pop()?;
                let target = self.pop()?;
                let value = index_value(&target, &index)
                    .map_err(|m| RuntimeError::at_line(m, *line))?;
                self.stack.push(value);
            }
            Instr::IterLen { line } => {
                let len = match self.pop()? {
                    Value::List(items) => items.len(),
                    Value::Str(s) => s.chars().count(),
                    other => {
                        return Err(RuntimeError::at_line(
                            format!("cannot iterate over a {}", other.type_name()),
                            *line,
                        ))
                    }
                };
                self.stack.push(Value::Num(len as f64));
            }
            Instr::Neg { line } => match self.pop()? {
                Value::Num(n) => self.stack.push(Value::Num(-n)),
                other => {
                    return Err(RuntimeError::at_line(
                        format!("cannot negate a {}", other.type_name()),
                        *line,
                    ))
                }
            },
            Instr::Not => {
                let v = self.pop()?;
                self.stack.push(Value::Bool(!v.is_truthy()));
            }
            Instr::Binary { op, line } => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let value = binary(*op, lhs, rhs).map_err(|m| RuntimeError::at_line(m, *line))?;
                self.stack.push(value);
            }
            Instr::Jump(target) => self.jump(*target),
            Instr::JumpIfFalse(target) => {
                if !self.pop()?.is_truthy() {
                    self.jump(*target);
                }
            }
            Instr::JumpIfFalseKeep(target) => {
                if !self.peek()?.is_truthy() {
                    self.jump(*target);
                }
            }
            Instr::JumpIfTrueKeep(target) => {
                if self.peek()?.is_truthy() {
                    self.jump(*target);
                }
            }
            Instr::Call { name, argc, line } => {
                let args = self.pop_n(*argc)?;
                self.call(name, args, *line)?;
            }
            Instr::Return => {
                let value = self.pop()?;
                if self.frames.len() <= 1 {
                    return Err(self.error("`return` at top level"));
                }
                self.frames.pop();
                self.stack.push(value);
            }
        }
        Ok(())
    }

    fn call(&mut self, name: &str, args: Vec<Value>, line: usize) -> Result<(), RuntimeError> {
        if let Some(function) = self.functions.get(name).copied() {
            if args.len() != function.params.len() {
                return Err(RuntimeError::at_line(
                    format!(
                        "`{name}` expects {} argument(s), got {}",
                        function.params.len(),
                        args.len()
                    ),
                    line,
                ));
            }
            if self.frames.len() >= MAX_CALL_DEPTH {
                return Err(RuntimeError::at_line(
                    format!("call stack overflow in `{name}` (depth {MAX_CALL_DEPTH})"),
                    line,
                ));
            }
            let locals = function.params.iter().cloned().zip(args).collect();
            self.frames.push(Frame {
                code: &function.code,
                ip: 0,
                locals: Some(locals),
                call_line: line,
            });
            return Ok(());
        }
        let Some(builtin) = builtins::lookup(name) else {
            return Err(RuntimeError::at_line(format!("undefined function `{name}`"), line));
        };
        let value = builtin(args, &mut self.output).map_err(|m| RuntimeError::at_line(m, line))?;
        self.stack.push(value);
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames
            .last()
            .and_then(|f| f.locals.as_ref())
            .and_then(|locals| locals.get(name))
            .or_else(|| self.globals.get(name))
    }

    fn scope_mut(&mut self) -> &mut HashMap<String, Value> {
        match self.frames.last_mut().and_then(|f| f.locals.as_mut()) {
            Some(locals) => locals,
            None => &mut self.globals,
        }
    }

    fn jump(&mut self, target: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = target;
        }
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| self.error("value stack underflow"))
    }

    fn peek(&self) -> Result<&Value, RuntimeError> {
        self.stack
            .last()
            .ok_or_else(|| self.error("value stack underflow"))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        if self.stack.len() < n {
            return Err(self.error("value stack underflow"));
        }
        let at = self.stack.len() - n;
        Ok(self.stack.split_off(at))
    }

    /// Error attributed to the innermost call site, when there is one.
    fn error(&self, message: impl Into<String>) -> RuntimeError {
        match self.frames.last().map(|f| f.call_line) {
            Some(line) if line > 0 => RuntimeError::at_line(message, line),
            _ => RuntimeError::new(message),
        }
    }
}

fn index_value(target: &Value, index: &Value) -> Result<Value, String> {
    match (target, index) {
        (Value::List(items), Value::Num(n)) => position(*n, items.len())
            .map(|i| items[i].clone())
            .ok_or_else(|| format!("index {index} out of range for list of length {}", items.len())),
        (Value::Str(s), Value::Num(n)) => {
            let len = s.chars().count();
            position(*n, len)
                .and_then(|i| s.chars().nth(i))
                .map(|c| Value::Str(c.to_string()))
                .ok_or_else(|| format!("index {index} out of range for string of length {len}"))
        }
        (Value::Record(_), Value::Str(key)) => target
            .field(key)
            .cloned()
            .ok_or_else(|| format!("record has no field `{key}`")),
        _ => Err(format!(
            "cannot index a {} with a {}",
            target.type_name(),
            index.type_name()
        )),
    }
}

fn position(n: f64, len: usize) -> Option<usize> {
    if n.fract() != 0.0 || n < 0.0 || n >= len as f64 {
        return None;
    }
    Some(n as usize)
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, String> {
    use Value::*;
    let mismatch = |lhs: &Value, rhs: &Value| {
        format!(
            "unsupported operand types for {:?}: {} and {}",
            op,
            lhs.type_name(),
            rhs.type_name()
        )
        .to_lowercase()
    };
    Ok(match (op, lhs, rhs) {
        (BinOp::Eq, a, b) => Bool(a == b),
        (BinOp::Ne, a, b) => Bool(a != b),
        (BinOp::Add, Num(a), Num(b)) => Num(a + b),
        (BinOp::Add, List(mut a), List(b)) => {
            a.extend(b);
            List(a)
        }
        (BinOp::Add, Str(a), b) => Str(format!("{a}{b}")),
        (BinOp::Add, a, Str(b)) => Str(format!("{a}{b}")),
        (BinOp::Sub, Num(a), Num(b)) => Num(a - b),
        (BinOp::Mul, Num(a), Num(b)) => Num(a * b),
        (BinOp::Div | BinOp::Rem, Num(_), Num(b)) if b == 0.0 => {
            return Err("division by zero".to_string())
        }
        (BinOp::Div, Num(a), Num(b)) => Num(a / b),
        (BinOp::Rem, Num(a), Num(b)) => Num(a % b),
        (BinOp::Lt, Num(a), Num(b)) => Bool(a < b),
        (BinOp::Le, Num(a), Num(b)) => Bool(a <= b),
        (BinOp::Gt, Num(a), Num(b)) => Bool(a > b),
        (BinOp::Ge, Num(a), Num(b)) => Bool(a >= b),
        (BinOp::Lt, Str(a), Str(b)) => Bool(a < b),
        (BinOp::Le, Str(a), Str(b)) => Bool(a <= b),
        (BinOp::Gt, Str(a), Str(b)) => Bool(a > b),
        (BinOp::Ge, Str(a), Str(b)) => Bool(a >= b),
        (_, a, b) => return Err(mismatch(&a, &b)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::compile;

    fn run(source: &str) -> Result<Vec<OutputItem>, RuntimeError> {
        let artifact = compile(source).expect("compile failed");
        Vm::new(&artifact.unit).run()
    }

    fn printed(source: &str) -> Vec<String> {
        run(source)
            .expect("run failed")
            .iter()
            .map(|item| item.text())
            .collect()
    }

    #[test]
    fn test_hello_world() {
        assert_eq!(printed(r#"print("hello world")"#), vec!["hello world"]);
    }

    #[test]
    fn test_list_literal_prints_readably() {
        assert_eq!(printed("print([1,2,3])"), vec!["[1, 2, 3]"]);
    }

    #[test]
    fn test_arithmetic_and_strings() {
        assert_eq!(
            printed(r#"let x = 2 + 3 * 4
print(x)
print("x = " + x)
print(7 % 3, -x)"#),
            vec!["14", "x = 14", "1 -14"]
        );
    }

    #[test]
    fn test_functions_and_recursion() {
        let source = r#"
fn fib(n) {
    if n < 2 { return n }
    return fib(n - 1) + fib(n - 2)
}
print(fib(10))
"#;
        assert_eq!(printed(source), vec!["55"]);
    }

    #[test]
    fn test_for_loop_with_break_and_continue() {
        let source = r#"
let total = 0
for x in range(10) {
    if x == 2 { continue }
    if x == 5 { break }
    total = total + x
}
print(total)
"#;
        assert_eq!(printed(source), vec!["8"]);
    }

    #[test]
    fn test_while_loop() {
        let source = "let i = 0\nwhile i < 3 { print(i) i = i + 1 }";
        assert_eq!(printed(source), vec!["0", "1", "2"]);
    }

    #[test]
    fn test_short_circuit_skips_rhs() {
        assert_eq!(printed("print(false && explode())\nprint(true || explode())"), vec!["false", "true"]);
    }

    #[test]
    fn test_locals_do_not_leak() {
        let source = "let x = 1\nfn set() { let x = 5 return x }\nprint(set())\nprint(x)";
        assert_eq!(printed(source), vec!["5", "1"]);
    }

    #[test]
    fn test_functions_can_update_globals() {
        let source = "let count = 0\nfn bump() { count = count + 1 }\nbump()\nbump()\nprint(count)";
        assert_eq!(printed(source), vec!["2"]);
    }

    #[test]
    fn test_undefined_function_is_runtime_error() {
        let err = run("print(1)\nmissing_op(2)").expect_err("should fail");
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("undefined function `missing_op`"));
    }

    #[test]
    fn test_undefined_variable_and_bad_assignment() {
        let err = run("print(nope)").expect_err("should fail");
        assert!(err.message.contains("undefined variable `nope`"));
        let err = run("ghost = 1").expect_err("should fail");
        assert!(err.message.contains("undeclared variable `ghost`"));
    }

    #[test]
    fn test_type_errors_carry_line() {
        let err = run("let a = 1\nlet b = a - \"x\"").expect_err("should fail");
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("unsupported operand types"));
    }

    #[test]
    fn test_runaway_recursion_is_contained() {
        let err = run("fn down(n) { return down(n + 1) }\ndown(0)").expect_err("should fail");
        assert!(err.message.contains("call stack overflow"));
    }

    #[test]
    fn test_value_nesting_is_capped() {
        let err = run("let a = 1\nfor i in range(30000) { a = [a] }\nprint(len(a))")
            .expect_err("should fail");
        assert!(err.message.contains("value nested deeper than 32 levels"));
        let err = run("let r = null\nwhile true { r = {inner: r} }").expect_err("should fail");
        assert!(err.message.contains("nested deeper"));
        let err = run("let a = []\nwhile true { a = push([], a) }").expect_err("should fail");
        assert!(err.message.contains("nested deeper"));
        let source = "let a = 1\nfor i in range(32) { a = [a] }\nprint(type_of(a))";
        assert_eq!(printed(source), vec!["list"]);
    }

    #[test]
    fn test_indexing() {
        let source = r#"let r = {a: [10, 20], b: "xyz"}
print(r["a"][1])
print(r["b"][2])"#;
        assert_eq!(printed(source), vec!["20", "z"]);
        let err = run("[1][3]").expect_err("should fail");
        assert!(err.message.contains("out of range"));
    }
}
