//! Error taxonomy for the compile/run pipeline.
//!
//! Only two failure kinds reach the user: a [`CompileError`] from the compiler
//! stage and a [`RuntimeError`] from the runner stage. [`PipelineError`] wraps
//! them with the phase marker shown in the display string.

use serde::{Deserialize, Serialize};

/// Source text could not be turned into an executable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{}{message}", location_prefix(.line, .column))]
pub struct CompileError {
    pub message: String,
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub column: Option<usize>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
            column: Some(column),
        }
    }
}

/// The compiled unit raised or aborted while executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{}{message}", location_prefix(.line, &None))]
pub struct RuntimeError {
    pub message: String,
    #[serde(default)]
    pub line: Option<usize>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
        }
    }
}

/// Terminal failure of one compile-and-run request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("Exception caught by compiler:\n\n{0}")]
    Compile(CompileError),
    #[error("Exception caught while executing the script:\n\n{0}")]
    Runtime(RuntimeError),
}

impl From<CompileError> for PipelineError {
    fn from(err: CompileError) -> Self {
        PipelineError::Compile(err)
    }
}

impl From<RuntimeError> for PipelineError {
    fn from(err: RuntimeError) -> Self {
        PipelineError::Runtime(err)
    }
}

fn location_prefix(line: &Option<usize>, column: &Option<usize>) -> String {
    match (line, column) {
        (Some(line), Some(column)) => format!("line {line}, column {column}: "),
        (Some(line), None) => format!("line {line}: "),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display_includes_location() {
        let err = CompileError::at("expected expr", 2, 7);
        assert_eq!(err.to_string(), "line 2, column 7: expected expr");
        assert_eq!(CompileError::new("boom").to_string(), "boom");
    }

    #[test]
    fn test_pipeline_error_prefixes_phase() {
        let compile = PipelineError::from(CompileError::new("bad token"));
        assert!(compile
            .to_string()
            .starts_with("Exception caught by compiler:\n\n"));
        assert!(compile.to_string().ends_with("bad token"));

        let runtime = PipelineError::from(RuntimeError::at_line("undefined function `nope`", 3));
        assert_eq!(
            runtime.to_string(),
            "Exception caught while executing the script:\n\nline 3: undefined function `nope`"
        );
    }
}
