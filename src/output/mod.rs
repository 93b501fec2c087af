//! Output item model.
//!
//! An [`OutputItem`] is pure tagged data: a [`OutputKind`] plus a [`Value`]
//! payload. Every capability (`is_print`, `text`) is a pure function of that
//! data, so an item reconstructed from its wire form behaves exactly like the
//! one the runner created. The wire form is [`OutputRecord`], whose tag is an
//! untrusted string until [`rehydrate`] validates it.

mod value;

pub use value::{check_container_depth, format_number, Value, MAX_VALUE_DEPTH};

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Print,
    Plot,
    Markdown,
    Tex,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Print => "print",
            OutputKind::Plot => "plot",
            OutputKind::Markdown => "markdown",
            OutputKind::Tex => "tex",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputKind {
    type Err = RehydrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "print" => Ok(OutputKind::Print),
            "plot" => Ok(OutputKind::Plot),
            "markdown" => Ok(OutputKind::Markdown),
            "tex" => Ok(OutputKind::Tex),
            other => Err(RehydrateError::UnknownKind(other.to_string())),
        }
    }
}

/// Behavior-free form of an output item as it travels between stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RehydrateError {
    #[error("unknown output kind `{0}`")]
    UnknownKind(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: OutputKind, reason: String },
}

/// One observable effect of running a script.
#[derive(Debug, Clone)]
pub struct OutputItem {
    kind: OutputKind,
    payload: Value,
}

impl OutputItem {
    pub fn print(value: Value) -> Self {
        Self {
            kind: OutputKind::Print,
            payload: value,
        }
    }

    /// Plot of `y` against `x`; both series must have the same length.
    pub fn plot(x: Vec<f64>, y: Vec<f64>, title: Option<String>) -> Self {
        let mut fields = vec![
            ("x".to_string(), Value::from(x)),
            ("y".to_string(), Value::from(y)),
        ];
        if let Some(title) = title {
            fields.push(("title".to_string(), Value::Str(title)));
        }
        Self {
            kind: OutputKind::Plot,
            payload: Value::Record(fields),
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Markdown,
            payload: Value::Str(text.into()),
        }
    }

    pub fn tex(text: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Tex,
            payload: Value::Str(text.into()),
        }
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn is_print(&self) -> bool {
        self.kind == OutputKind::Print
    }

    /// Human-readable rendering of the payload.
    pub fn text(&self) -> String {
        match self.kind {
            OutputKind::Print | OutputKind::Markdown | OutputKind::Tex => {
                self.payload.to_string()
            }
            OutputKind::Plot => {
                let points = match self.payload.field("y") {
                    Some(Value::List(ys)) => ys.len(),
                    _ => 0,
                };
                let title = match self.payload.field("title") {
                    Some(Value::Str(t)) => t.as_str(),
                    _ => "plot",
                };
                format!("{title} ({points} points)")
            }
        }
    }

    /// Strip the item down to its wire form.
    pub fn to_record(&self) -> OutputRecord {
        OutputRecord {
            kind: self.kind.as_str().to_string(),
            payload: self.payload.clone(),
        }
    }
}

/// Structural equality: same kind and same rendered text.
impl PartialEq for OutputItem {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.text() == other.text()
    }
}

impl Serialize for OutputItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("OutputItem", 3)?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("text", &self.text())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

/// Rebuild a fully capable item from a plain record.
///
/// Nothing about the record is trusted: the tag is parsed and the payload is
/// checked against the shape its kind requires.
pub fn rehydrate(record: OutputRecord) -> Result<OutputItem, RehydrateError> {
    let kind: OutputKind = record.kind.parse()?;
    let invalid = |reason: &str| RehydrateError::InvalidPayload {
        kind,
        reason: reason.to_string(),
    };
    match kind {
        OutputKind::Print => {}
        OutputKind::Markdown | OutputKind::Tex => {
            if !matches!(record.payload, Value::Str(_)) {
                return Err(invalid("expected a string"));
            }
        }
        OutputKind::Plot => {
            let x = numeric_series(record.payload.field("x"))
                .ok_or_else(|| invalid("`x` must be a list of numbers"))?;
            let y = numeric_series(record.payload.field("y"))
                .ok_or_else(|| invalid("`y` must be a list of numbers"))?;
            if x != y {
                return Err(invalid("`x` and `y` differ in length"));
            }
            if let Some(title) = record.payload.field("title") {
                if !matches!(title, Value::Str(_)) {
                    return Err(invalid("`title` must be a string"));
                }
            }
        }
    }
    Ok(OutputItem {
        kind,
        payload: record.payload,
    })
}

/// Length of a list whose elements are all numbers.
fn numeric_series(value: Option<&Value>) -> Option<usize> {
    match value {
        Some(Value::List(items)) if items.iter().all(|v| matches!(v, Value::Num(_))) => {
            Some(items.len())
        }
        _ => None,
    }
}

/// Concatenate the text of every print item, each followed by a newline.
pub fn display_string(items: &[OutputItem]) -> String {
    items
        .iter()
        .filter(|item| item.is_print())
        .fold(String::new(), |mut out, item| {
            out.push_str(&item.text());
            out.push('\n');
            out
        })
}
