//! Tutorial scripts that can replace the editor contents.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tutorial {
    pub description: String,
    pub source: String,
}

/// Source of tutorials offered to the user.
pub trait TutorialProvider: Send + Sync {
    fn list_tutorials(&self) -> Vec<Tutorial>;
}

/// Tutorials bundled with the binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTutorials;

const BUILTIN: &[(&str, &str)] = &[
    (
        "Printing values",
        r#"// print() shows any value; several arguments are joined with spaces
print("hello world")
print(1 + 2 * 3)
print([1, 2, 3])
print({name: "lab", version: 1})
print("sum:", sum([1, 2, 3]))
"#,
    ),
    (
        "Variables and control flow",
        r#"let total = 0
for n in range(1, 11) {
    if n % 2 == 0 { continue }
    total = total + n
}
print("odd total: " + total)

let i = 3
while i > 0 {
    print(i)
    i = i - 1
}
print("liftoff")
"#,
    ),
    (
        "Functions and recursion",
        r#"fn fib(n) {
    if n < 2 { return n }
    return fib(n - 1) + fib(n - 2)
}

let xs = []
for i in range(12) {
    xs = push(xs, fib(i))
}
print(xs)
"#,
    ),
    (
        "Plotting a series",
        r#"let xs = range(0, 6.3, 0.1)
let ys = []
for x in xs {
    ys = push(ys, x * x - 3 * x)
}
plot(xs, ys, "x^2 - 3x")
print("plotted " + len(xs) + " points")
"#,
    ),
    (
        "Markdown and TeX output",
        r##"markdown("# Results\nThe table below is computed by the script.")
tex("\\int_0^1 x^2 \\, dx = \\frac{1}{3}")
let rows = {min: min(4, 8, 1), max: max([4, 8, 1])}
print(rows)
"##,
    ),
    (
        "Errors",
        r#"// Runtime errors stop the script and are reported with their line
fn safe_div(a, b) {
    if b == 0 { raise("cannot divide " + a + " by zero") }
    return a / b
}
print(safe_div(10, 4))
print(safe_div(1, 0))
"#,
    ),
];

impl TutorialProvider for BuiltinTutorials {
    fn list_tutorials(&self) -> Vec<Tutorial> {
        BUILTIN
            .iter()
            .map(|(description, source)| Tutorial {
                description: description.to_string(),
                source: source.to_string(),
            })
            .collect()
    }
}
