//! PEST-based parser producing the statement tree.

use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;

use super::ast::{BinaryOp, Expr, Stmt, StmtKind, UnaryOp};
use crate::error::CompileError;

#[derive(Parser)]
#[grammar = "lang/script.pest"]
struct ScriptParser;

impl From<pest::error::Error<Rule>> for CompileError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        let (line, column) = match err.line_col {
            pest::error::LineColLocation::Pos((line, col)) => (line, col),
            pest::error::LineColLocation::Span((line, col), _) => (line, col),
        };
        let message = match &err.variant {
            pest::error::ErrorVariant::ParsingError { .. } => {
                format!("syntax error, {}", err.variant.message())
            }
            pest::error::ErrorVariant::CustomError { message } => message.clone(),
        };
        CompileError::at(message, line, column)
    }
}

/// Deepest bracket nesting accepted in source text.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Deepest statement and expression tree the builder will produce.
pub const MAX_TREE_DEPTH: usize = 256;

/// Parse a whole script into top-level statements.
pub fn parse_program(source: &str) -> Result<Vec<Stmt>, CompileError> {
    check_bracket_nesting(source)?;
    let mut pairs = ScriptParser::parse(Rule::program, source)?;
    let program = pairs
        .next()
        .ok_or_else(|| CompileError::new("empty parse tree"))?;
    program
        .into_inner()
        .filter(|p| p.as_rule() != Rule::EOI)
        .map(|p| build_stmt(p, 0))
        .collect()
}

/// Bracket depth outside strings and comments. The grammar recurses once per
/// bracket, so this runs before pest sees the source.
fn check_bracket_nesting(source: &str) -> Result<(), CompileError> {
    let mut depth = 0usize;
    let mut chars = source.char_indices().peekable();
    while let Some((at, c)) = chars.next() {
        match c {
            '"' | '\'' => {
                while let Some((_, s)) = chars.next() {
                    if s == '\\' {
                        chars.next();
                    } else if s == c {
                        break;
                    }
                }
            }
            '/' if matches!(chars.peek(), Some((_, '/'))) => {
                for (_, s) in chars.by_ref() {
                    if s == '\n' {
                        break;
                    }
                }
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut prev = ' ';
                for (_, s) in chars.by_ref() {
                    if prev == '*' && s == '/' {
                        break;
                    }
                    prev = s;
                }
            }
            '(' | '[' | '{' => {
                depth += 1;
                if depth > MAX_NESTING_DEPTH {
                    let before = &source[..at];
                    let line = before.matches('\n').count() + 1;
                    let column = before.chars().rev().take_while(|&c| c != '\n').count() + 1;
                    return Err(CompileError::at(
                        format!("brackets nested deeper than {MAX_NESTING_DEPTH} levels"),
                        line,
                        column,
                    ));
                }
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::kw_fn
            | Rule::kw_let
            | Rule::kw_if
            | Rule::kw_else
            | Rule::kw_while
            | Rule::kw_for
            | Rule::kw_in
            | Rule::kw_return
            | Rule::kw_break
            | Rule::kw_continue
    )
}

/// Inner pairs without keyword tokens.
fn significant(pair: Pair<'_, Rule>) -> impl Iterator<Item = Pair<'_, Rule>> {
    pair.into_inner().filter(|p| !is_keyword(p.as_rule()))
}

fn line_col(pair: &Pair<'_, Rule>) -> (usize, usize) {
    pair.as_span().start_pos().line_col()
}

fn unexpected(pair: &Pair<'_, Rule>) -> CompileError {
    let (line, column) = line_col(pair);
    CompileError::at(
        format!("unexpected {:?} in syntax tree", pair.as_rule()),
        line,
        column,
    )
}

fn next_pair<'i>(
    inner: &mut impl Iterator<Item = Pair<'i, Rule>>,
    parent: &Pair<'i, Rule>,
) -> Result<Pair<'i, Rule>, CompileError> {
    inner.next().ok_or_else(|| {
        let (line, column) = line_col(parent);
        CompileError::at(
            format!("incomplete {:?} in syntax tree", parent.as_rule()),
            line,
            column,
        )
    })
}

/// Depth of a node `levels` below one at `depth`, if the tree may grow that deep.
fn descend(pair: &Pair<'_, Rule>, depth: usize, levels: usize) -> Result<usize, CompileError> {
    let depth = depth + levels;
    if depth > MAX_TREE_DEPTH {
        let (line, column) = line_col(pair);
        return Err(CompileError::at(
            format!("program nested deeper than {MAX_TREE_DEPTH} levels"),
            line,
            column,
        ));
    }
    Ok(depth)
}

fn build_block(pair: Pair<'_, Rule>, depth: usize) -> Result<Vec<Stmt>, CompileError> {
    let depth = descend(&pair, depth, 1)?;
    pair.into_inner().map(|p| build_stmt(p, depth)).collect()
}

fn build_stmt(pair: Pair<'_, Rule>, depth: usize) -> Result<Stmt, CompileError> {
    let (line, _) = line_col(&pair);
    let parent = pair.clone();
    let inner_depth = descend(&parent, depth, 1)?;
    let kind = match pair.as_rule() {
        Rule::fn_decl => {
            let mut inner = significant(pair);
            let name = next_pair(&mut inner, &parent)?.as_str().to_string();
            let mut params = Vec::new();
            let mut body = Vec::new();
            for part in inner {
                match part.as_rule() {
                    Rule::params => {
                        params = part.into_inner().map(|p| p.as_str().to_string()).collect()
                    }
                    Rule::block => body = build_block(part, depth)?,
                    _ => return Err(unexpected(&part)),
                }
            }
            StmtKind::Fn { name, params, body }
        }
        Rule::let_stmt | Rule::assign_stmt => {
            let is_let = pair.as_rule() == Rule::let_stmt;
            let mut inner = significant(pair);
            let name = next_pair(&mut inner, &parent)?.as_str().to_string();
            let value = build_expr(next_pair(&mut inner, &parent)?, inner_depth)?;
            if is_let {
                StmtKind::Let { name, value }
            } else {
                StmtKind::Assign { name, value }
            }
        }
        Rule::if_stmt => build_if(pair, depth)?,
        Rule::while_stmt => {
            let mut inner = significant(pair);
            let cond = build_expr(next_pair(&mut inner, &parent)?, inner_depth)?;
            let body = build_block(next_pair(&mut inner, &parent)?, depth)?;
            StmtKind::While { cond, body }
        }
        Rule::for_stmt => {
            let mut inner = significant(pair);
            let var = next_pair(&mut inner, &parent)?.as_str().to_string();
            let iterable = build_expr(next_pair(&mut inner, &parent)?, inner_depth)?;
            let body = build_block(next_pair(&mut inner, &parent)?, depth)?;
            StmtKind::For {
                var,
                iterable,
                body,
            }
        }
        Rule::return_stmt => {
            let value = significant(pair)
                .next()
                .map(|p| build_expr(p, inner_depth))
                .transpose()?;
            StmtKind::Return(value)
        }
        Rule::break_stmt => StmtKind::Break,
        Rule::continue_stmt => StmtKind::Continue,
        Rule::expr_stmt => {
            let mut inner = pair.into_inner();
            StmtKind::Expr(build_expr(next_pair(&mut inner, &parent)?, inner_depth)?)
        }
        _ => return Err(unexpected(&pair)),
    };
    Ok(Stmt { kind, line })
}

/// `else if` arms become nested `If` statements in the `otherwise` branch.
fn build_if(pair: Pair<'_, Rule>, depth: usize) -> Result<StmtKind, CompileError> {
    let parent = pair.clone();
    let mut inner = significant(pair);
    let cond = next_pair(&mut inner, &parent)?;
    let then = next_pair(&mut inner, &parent)?;
    let mut arms = vec![(line_col(&parent).0, cond, then)];
    let mut tail = None;
    for part in inner {
        match part.as_rule() {
            Rule::else_if => {
                let arm_line = line_col(&part).0;
                let arm_parent = part.clone();
                let mut arm = significant(part);
                let cond = next_pair(&mut arm, &arm_parent)?;
                let then = next_pair(&mut arm, &arm_parent)?;
                arms.push((arm_line, cond, then));
            }
            Rule::else_block => {
                let else_parent = part.clone();
                let mut rest = significant(part);
                tail = Some(next_pair(&mut rest, &else_parent)?);
            }
            _ => return Err(unexpected(&part)),
        }
    }

    // Arm i sits i levels below the outer statement.
    descend(&parent, depth, arms.len())?;
    let deepest = depth + arms.len() - 1;
    let mut otherwise = match tail {
        Some(block) => Some(build_block(block, deepest)?),
        None => None,
    };
    let mut level = deepest;
    while let Some((line, cond, then)) = arms.pop() {
        let cond = build_expr(cond, level + 1)?;
        let then = build_block(then, level)?;
        let kind = StmtKind::If {
            cond,
            then,
            otherwise,
        };
        if arms.is_empty() {
            return Ok(kind);
        }
        otherwise = Some(vec![Stmt { kind, line }]);
        level -= 1;
    }
    Err(unexpected(&parent))
}

fn build_expr(pair: Pair<'_, Rule>, depth: usize) -> Result<Expr, CompileError> {
    let parent = pair.clone();
    match pair.as_rule() {
        Rule::expr => {
            let mut inner = pair.into_inner();
            build_expr(next_pair(&mut inner, &parent)?, depth)
        }
        Rule::or_expr
        | Rule::and_expr
        | Rule::eq_expr
        | Rule::cmp_expr
        | Rule::add_expr
        | Rule::mul_expr => {
            // A left-folded chain of k operators puts its first operand k
            // levels down.
            let parts: Vec<_> = pair.into_inner().collect();
            let operand_depth = descend(&parent, depth, parts.len() / 2)?;
            let mut inner = parts.into_iter();
            let mut lhs = build_expr(next_pair(&mut inner, &parent)?, operand_depth)?;
            while let Some(op) = inner.next() {
                let rhs = build_expr(next_pair(&mut inner, &parent)?, operand_depth)?;
                lhs = combine(&op, lhs, rhs)?;
            }
            Ok(lhs)
        }
        Rule::unary => {
            let mut ops = Vec::new();
            let mut operand = None;
            for part in pair.into_inner() {
                match part.as_rule() {
                    Rule::unary_op if part.as_str() == "-" => ops.push(UnaryOp::Neg),
                    Rule::unary_op => ops.push(UnaryOp::Not),
                    _ => operand = Some(part),
                }
            }
            let operand = operand.ok_or_else(|| unexpected(&parent))?;
            let mut expr = build_expr(operand, descend(&parent, depth, ops.len())?)?;
            for op in ops.into_iter().rev() {
                expr = Expr::Unary {
                    op,
                    expr: Box::new(expr),
                };
            }
            Ok(expr)
        }
        Rule::postfix => build_postfix(pair.into_inner(), &parent, depth),
        Rule::number => pair.as_str().parse::<f64>().map(Expr::Num).map_err(|e| {
            let (line, column) = line_col(&parent);
            CompileError::at(format!("invalid number literal: {e}"), line, column)
        }),
        Rule::string => {
            let mut inner = pair.into_inner();
            Ok(Expr::Str(unescape(next_pair(&mut inner, &parent)?.as_str())))
        }
        Rule::boolean => Ok(Expr::Bool(pair.as_str() == "true")),
        Rule::null => Ok(Expr::Null),
        Rule::list => {
            let item_depth = descend(&parent, depth, 1)?;
            Ok(Expr::List(
                pair.into_inner()
                    .map(|p| build_expr(p, item_depth))
                    .collect::<Result<_, _>>()?,
            ))
        }
        Rule::record => {
            let field_depth = descend(&parent, depth, 1)?;
            let mut fields = Vec::new();
            for field in pair.into_inner() {
                let field_parent = field.clone();
                let mut inner = field.into_inner();
                let key = next_pair(&mut inner, &field_parent)?;
                let key = match key.as_rule() {
                    Rule::string => {
                        let mut key_inner = key.clone().into_inner();
                        unescape(next_pair(&mut key_inner, &key)?.as_str())
                    }
                    _ => key.as_str().to_string(),
                };
                let value = build_expr(next_pair(&mut inner, &field_parent)?, field_depth)?;
                fields.push((key, value));
            }
            Ok(Expr::Record(fields))
        }
        Rule::ident => Ok(Expr::Var(pair.as_str().to_string())),
        _ => Err(unexpected(&pair)),
    }
}

fn build_postfix<'i>(
    inner: Pairs<'i, Rule>,
    parent: &Pair<'i, Rule>,
    depth: usize,
) -> Result<Expr, CompileError> {
    let parts: Vec<_> = inner.collect();
    let inner_depth = descend(parent, depth, parts.len().saturating_sub(1))?;
    let mut inner = parts.into_iter();
    let mut expr = build_expr(next_pair(&mut inner, parent)?, inner_depth)?;
    for suffix in inner {
        let (line, column) = line_col(&suffix);
        match suffix.as_rule() {
            Rule::call_args => {
                let Expr::Var(name) = expr else {
                    return Err(CompileError::at(
                        "only named functions can be called",
                        line,
                        column,
                    ));
                };
                let args = suffix
                    .into_inner()
                    .map(|p| build_expr(p, inner_depth))
                    .collect::<Result<_, _>>()?;
                expr = Expr::Call { name, args, line };
            }
            Rule::index => {
                let index_parent = suffix.clone();
                let mut index_inner = suffix.into_inner();
                let index = build_expr(next_pair(&mut index_inner, &index_parent)?, inner_depth)?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                    line,
                };
            }
            _ => return Err(unexpected(&suffix)),
        }
    }
    Ok(expr)
}

fn combine(op: &Pair<'_, Rule>, lhs: Expr, rhs: Expr) -> Result<Expr, CompileError> {
    let (lhs, rhs) = (Box::new(lhs), Box::new(rhs));
    let op = match op.as_str() {
        "||" => return Ok(Expr::Or(lhs, rhs)),
        "&&" => return Ok(Expr::And(lhs, rhs)),
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Rem,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        _ => return Err(unexpected(op)),
    };
    Ok(Expr::Binary { op, lhs, rhs })
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_expr(source: &str) -> Expr {
        let mut program = parse_program(source).expect("parse failed");
        assert_eq!(program.len(), 1);
        match program.remove(0).kind {
            StmtKind::Expr(expr) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn test_parses_print_call() {
        let expr = single_expr(r#"print("hello world")"#);
        assert_eq!(
            expr,
            Expr::Call {
                name: "print".into(),
                args: vec![Expr::Str("hello world".into())],
                line: 1,
            }
        );
    }

    #[test]
    fn test_precedence_binds_multiplication_tighter() {
        let expr = single_expr("1 + 2 * 3");
        let Expr::Binary { op, rhs, .. } = expr else {
            panic!("expected binary expression");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(*rhs, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_keywords_respect_word_boundaries() {
        let source = "let returned = 1\nreturned = 2\nfor item in [1] { print(item) }";
        let program = parse_program(source).expect("parse failed");
        assert!(matches!(&program[0].kind, StmtKind::Let { name, .. } if name == "returned"));
        assert!(matches!(&program[1].kind, StmtKind::Assign { name, .. } if name == "returned"));
        assert!(matches!(&program[2].kind, StmtKind::For { var, .. } if var == "item"));
        assert_eq!(program[2].line, 3);
    }

    #[test]
    fn test_string_escapes_and_records() {
        let expr = single_expr(r#"{name: 'a\'b', "k": "x\ny"}"#);
        assert_eq!(
            expr,
            Expr::Record(vec![
                ("name".into(), Expr::Str("a'b".into())),
                ("k".into(), Expr::Str("x\ny".into())),
            ])
        );
    }

    #[test]
    fn test_else_if_chains() {
        let program = parse_program("if x { a() } else if y { b() } else { c() }").expect("parse");
        let StmtKind::If { otherwise, .. } = &program[0].kind else {
            panic!("expected if");
        };
        let nested = otherwise.as_ref().expect("else branch");
        assert!(matches!(nested[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn test_syntax_error_reports_location() {
        let err = parse_program("let x = (1 + \nprint(x)").expect_err("should fail");
        assert!(err.line.is_some());
        assert!(err.message.starts_with("syntax error"));
    }

    #[test]
    fn test_calling_an_expression_is_rejected() {
        let err = parse_program("make(1)(2)").expect_err("should fail");
        assert!(err.message.contains("only named functions"));
    }

    fn nested_list(depth: usize) -> String {
        format!("print({}1{})", "[".repeat(depth), "]".repeat(depth))
    }

    #[test]
    fn test_deep_bracket_nesting_is_rejected() {
        assert!(parse_program(&nested_list(MAX_NESTING_DEPTH - 1)).is_ok());
        let err = parse_program(&format!("print(1)\n{}", nested_list(10_000))).unwrap_err();
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("brackets nested deeper than 64 levels"));
    }

    #[test]
    fn test_brackets_in_strings_and_comments_do_not_nest() {
        let source = format!(
            "print(\"{0}\")\n// {0}\n/* {0} */ print('{0}')",
            "([{".repeat(200)
        );
        assert_eq!(parse_program(&source).expect("parse failed").len(), 2);
    }

    #[test]
    fn test_long_operator_chains_are_bounded() {
        let short = vec!["1"; 100].join(" + ");
        assert!(parse_program(&short).is_ok());
        let long = vec!["x"; 5_000].join(" + ");
        let err = parse_program(&long).unwrap_err();
        assert!(err.message.contains("nested deeper than 256 levels"));
        let err = parse_program(&format!("{}x", "-".repeat(5_000))).unwrap_err();
        assert!(err.message.contains("nested deeper"));
    }

    #[test]
    fn test_long_else_if_chains_are_bounded() {
        let arms = |n: usize| {
            let mut source = String::from("if x { a() }");
            for _ in 0..n {
                source.push_str(" else if x { a() }");
            }
            source + " else { b() }"
        };
        let program = parse_program(&arms(20)).expect("parse failed");
        assert!(matches!(program[0].kind, StmtKind::If { .. }));
        let err = parse_program(&arms(1_000)).unwrap_err();
        assert!(err.message.contains("nested deeper"));
    }
}
