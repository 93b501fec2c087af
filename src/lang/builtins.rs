//! Native functions available to every script.
//!
//! The output builtins (`print`, `plot`, `markdown`, `tex`) append to the
//! run's item list; everything else is a pure function of its arguments.

use crate::output::{check_container_depth, OutputItem, Value};

pub type Builtin = fn(Vec<Value>, &mut Vec<OutputItem>) -> Result<Value, String>;

pub fn lookup(name: &str) -> Option<Builtin> {
    let f: Builtin = match name {
        "print" => print,
        "plot" => plot,
        "markdown" => markdown,
        "tex" => tex,
        "len" => len,
        "range" => range,
        "str" => to_str,
        "num" => num,
        "push" => push,
        "keys" => keys,
        "type_of" => type_of,
        "abs" => |a, _| unary_math("abs", a, f64::abs),
        "sqrt" => |a, _| unary_math("sqrt", a, f64::sqrt),
        "floor" => |a, _| unary_math("floor", a, f64::floor),
        "round" => |a, _| unary_math("round", a, f64::round),
        "min" => |a, _| fold_numbers("min", a, f64::min),
        "max" => |a, _| fold_numbers("max", a, f64::max),
        "sum" => sum,
        "raise" => raise,
        _ => return None,
    };
    Some(f)
}

fn print(args: Vec<Value>, out: &mut Vec<OutputItem>) -> Result<Value, String> {
    let value = match args.len() {
        0 => Value::Str(String::new()),
        1 => args.into_iter().next().unwrap_or(Value::Null),
        _ => Value::Str(
            args.iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(" "),
        ),
    };
    out.push(OutputItem::print(value));
    Ok(Value::Null)
}

fn plot(args: Vec<Value>, out: &mut Vec<OutputItem>) -> Result<Value, String> {
    let mut args = args.into_iter();
    let (x, y, title) = match (args.next(), args.next(), args.next(), args.next()) {
        (Some(y), None, None, None) => {
            let y = numbers("plot", &y)?;
            let x = (0..y.len()).map(|i| i as f64).collect();
            (x, y, None)
        }
        (Some(x), Some(y), title, None) => {
            let title = match title {
                None => None,
                Some(Value::Str(t)) => Some(t),
                Some(other) => {
                    return Err(format!(
                        "plot title must be a string, got {}",
                        other.type_name()
                    ))
                }
            };
            (numbers("plot", &x)?, numbers("plot", &y)?, title)
        }
        _ => return Err("plot expects 1 to 3 arguments".to_string()),
    };
    if x.len() != y.len() {
        return Err(format!(
            "plot series differ in length: {} x values, {} y values",
            x.len(),
            y.len()
        ));
    }
    out.push(OutputItem::plot(x, y, title));
    Ok(Value::Null)
}

fn markdown(args: Vec<Value>, out: &mut Vec<OutputItem>) -> Result<Value, String> {
    let [text] = exact::<1>("markdown", args)?;
    out.push(OutputItem::markdown(text.to_string()));
    Ok(Value::Null)
}

fn tex(args: Vec<Value>, out: &mut Vec<OutputItem>) -> Result<Value, String> {
    let [text] = exact::<1>("tex", args)?;
    out.push(OutputItem::tex(text.to_string()));
    Ok(Value::Null)
}

fn len(args: Vec<Value>, _: &mut Vec<OutputItem>) -> Result<Value, String> {
    let [value] = exact::<1>("len", args)?;
    let n = match &value {
        Value::List(items) => items.len(),
        Value::Str(s) => s.chars().count(),
        Value::Record(fields) => fields.len(),
        other => return Err(format!("len() of a {} is undefined", other.type_name())),
    };
    Ok(Value::Num(n as f64))
}

fn range(args: Vec<Value>, _: &mut Vec<OutputItem>) -> Result<Value, String> {
    let nums = args
        .iter()
        .map(|a| a.as_num().ok_or_else(|| "range expects numbers".to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    let (start, end, step) = match nums.as_slice() {
        [end] => (0.0, *end, 1.0),
        [start, end] => (*start, *end, 1.0),
        [start, end, step] => (*start, *end, *step),
        _ => return Err("range expects 1 to 3 arguments".to_string()),
    };
    if step == 0.0 {
        return Err("range step must not be zero".to_string());
    }
    let mut items = Vec::new();
    let mut current = start;
    while (step > 0.0 && current < end) || (step < 0.0 && current > end) {
        items.push(Value::Num(current));
        current += step;
    }
    Ok(Value::List(items))
}

fn to_str(args: Vec<Value>, _: &mut Vec<OutputItem>) -> Result<Value, String> {
    let [value] = exact::<1>("str", args)?;
    Ok(Value::Str(value.to_string()))
}

fn num(args: Vec<Value>, _: &mut Vec<OutputItem>) -> Result<Value, String> {
    let [value] = exact::<1>("num", args)?;
    match value {
        Value::Num(n) => Ok(Value::Num(n)),
        Value::Bool(b) => Ok(Value::Num(if b { 1.0 } else { 0.0 })),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Num)
            .map_err(|_| format!("cannot convert {s:?} to a number")),
        other => Err(format!("cannot convert a {} to a number", other.type_name())),
    }
}

fn push(args: Vec<Value>, _: &mut Vec<OutputItem>) -> Result<Value, String> {
    let [list, item] = exact::<2>("push", args)?;
    match list {
        Value::List(mut items) => {
            check_container_depth([&item])?;
            items.push(item);
            Ok(Value::List(items))
        }
        other => Err(format!("push expects a list, got {}", other.type_name())),
    }
}

fn keys(args: Vec<Value>, _: &mut Vec<OutputItem>) -> Result<Value, String> {
    let [record] = exact::<1>("keys", args)?;
    match record {
        Value::Record(fields) => Ok(Value::List(
            fields.into_iter().map(|(k, _)| Value::Str(k)).collect(),
        )),
        other => Err(format!("keys expects a record, got {}", other.type_name())),
    }
}

fn type_of(args: Vec<Value>, _: &mut Vec<OutputItem>) -> Result<Value, String> {
    let [value] = exact::<1>("type_of", args)?;
    Ok(Value::Str(value.type_name().to_string()))
}

fn sum(args: Vec<Value>, _: &mut Vec<OutputItem>) -> Result<Value, String> {
    let [list] = exact::<1>("sum", args)?;
    Ok(Value::Num(numbers("sum", &list)?.iter().sum()))
}

fn raise(args: Vec<Value>, _: &mut Vec<OutputItem>) -> Result<Value, String> {
    let [message] = exact::<1>("raise", args)?;
    Err(message.to_string())
}

fn unary_math(name: &str, args: Vec<Value>, f: fn(f64) -> f64) -> Result<Value, String> {
    let [value] = exact::<1>(name, args)?;
    match value {
        Value::Num(n) => Ok(Value::Num(f(n))),
        other => Err(format!("{name} expects a number, got {}", other.type_name())),
    }
}

/// `min`/`max` accept either several numbers or a single list of them.
fn fold_numbers(name: &str, args: Vec<Value>, f: fn(f64, f64) -> f64) -> Result<Value, String> {
    let values = if matches!(args.as_slice(), [Value::List(_)]) {
        numbers(name, &args[0])?
    } else {
        numbers(name, &Value::List(args))?
    };
    values
        .into_iter()
        .reduce(f)
        .map(Value::Num)
        .ok_or_else(|| format!("{name} of an empty sequence"))
}

fn numbers(name: &str, value: &Value) -> Result<Vec<f64>, String> {
    match value {
        Value::List(items) => items
            .iter()
            .map(|v| {
                v.as_num().ok_or_else(|| {
                    format!("{name} expects numbers, found a {}", v.type_name())
                })
            })
            .collect(),
        other => Err(format!("{name} expects a list, got {}", other.type_name())),
    }
}

fn exact<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N], String> {
    let got = args.len();
    <[Value; N]>::try_from(args).map_err(|_| format!("{name} expects {N} argument(s), got {got}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Value>) -> (Result<Value, String>, Vec<OutputItem>) {
        let mut out = Vec::new();
        let f = lookup(name).expect("builtin exists");
        (f(args, &mut out), out)
    }

    #[test]
    fn test_print_forms() {
        let (_, out) = call("print", vec![]);
        assert_eq!(out[0].text(), "");
        let (_, out) = call("print", vec![Value::from("a"), Value::Num(2.0)]);
        assert_eq!(out[0].text(), "a 2");
        let (_, out) = call("print", vec![Value::from(vec![1.0, 2.0])]);
        assert_eq!(out[0].text(), "[1, 2]");
    }

    #[test]
    fn test_plot_defaults_x_axis() {
        let (res, out) = call("plot", vec![Value::from(vec![3.0, 1.0, 2.0])]);
        assert_eq!(res, Ok(Value::Null));
        assert_eq!(out[0].text(), "plot (3 points)");
        assert_eq!(
            out[0].payload().field("x"),
            Some(&Value::from(vec![0.0, 1.0, 2.0]))
        );
    }

    #[test]
    fn test_plot_rejects_mismatched_series() {
        let (res, out) = call(
            "plot",
            vec![Value::from(vec![1.0]), Value::from(vec![1.0, 2.0])],
        );
        assert!(res.unwrap_err().contains("differ in length"));
        assert!(out.is_empty());
    }

    #[test]
    fn test_range() {
        let (res, _) = call("range", vec![Value::Num(3.0)]);
        assert_eq!(res, Ok(Value::from(vec![0.0, 1.0, 2.0])));
        let (res, _) = call("range", vec![Value::Num(5.0), Value::Num(0.0), Value::Num(-2.0)]);
        assert_eq!(res, Ok(Value::from(vec![5.0, 3.0, 1.0])));
        let (res, _) = call("range", vec![Value::Num(0.0), Value::Num(1.0), Value::Num(0.0)]);
        assert!(res.is_err());
    }

    #[test]
    fn test_min_max_sum() {
        let (res, _) = call("max", vec![Value::Num(1.0), Value::Num(4.0), Value::Num(2.0)]);
        assert_eq!(res, Ok(Value::Num(4.0)));
        let (res, _) = call("min", vec![Value::from(vec![5.0, -1.0])]);
        assert_eq!(res, Ok(Value::Num(-1.0)));
        let (res, _) = call("sum", vec![Value::from(vec![1.0, 2.0, 3.5])]);
        assert_eq!(res, Ok(Value::Num(6.5)));
        let (res, _) = call("max", vec![Value::List(vec![])]);
        assert!(res.is_err());
    }

    #[test]
    fn test_raise_and_arity() {
        let (res, _) = call("raise", vec![Value::from("boom")]);
        assert_eq!(res, Err("boom".to_string()));
        let (res, _) = call("len", vec![]);
        assert_eq!(res, Err("len expects 1 argument(s), got 0".to_string()));
    }

    #[test]
    fn test_unknown_builtin() {
        assert!(lookup("nope").is_none());
        assert!(lookup("type_of").is_some());
    }

    #[test]
    fn test_num_parses_strings() {
        let (res, _) = call("num", vec![Value::from(" 2.5 ")]);
        assert_eq!(res, Ok(Value::Num(2.5)));
        assert!(call("num", vec![Value::from("x")]).0.is_err());
    }
}
