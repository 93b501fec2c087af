//! Text summary builder for CLI output.
//!
//! Formats a settled pipeline state into stdout lines (the output pane) and
//! stderr lines (diagnostics).

use crate::model::PipelineState;
use crate::output::OutputKind;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Build a text summary from a terminal state. Print items go to stdout
/// through the display string; other kinds are announced on stderr.
pub(crate) fn build_text_summary(state: &PipelineState, show_compiled: bool) -> TextSummary {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    match state {
        PipelineState::Succeeded { result, .. } => {
            if show_compiled {
                stderr.extend(result.listing.lines().map(str::to_string));
            }
            stdout.extend(result.display.lines().map(str::to_string));
            for item in result.items.iter().filter(|i| !i.is_print()) {
                match item.kind() {
                    OutputKind::Plot => stderr.push(format!("[plot] {}", item.text())),
                    kind => {
                        stderr.push(format!("[{kind}]"));
                        stderr.extend(item.text().lines().map(|l| format!("  {l}")));
                    }
                }
            }
            stderr.push(format!(
                "compiled in {:.2} ms, ran in {:.2} ms ({} items)",
                result.compile_ms,
                result.run_ms,
                result.items.len()
            ));
        }
        PipelineState::Failed { error, .. } => {
            stderr.extend(error.to_string().lines().map(str::to_string));
        }
        other => stderr.push(format!("pipeline is {}", other.label())),
    }

    TextSummary { stdout, stderr }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::model::{ExecutionResult, RequestId};
    use crate::output::{display_string, OutputItem, Value};

    #[test]
    fn test_success_prints_display_and_notes_other_kinds() {
        let items = vec![
            OutputItem::print(Value::from("hello world")),
            OutputItem::plot(vec![0.0, 1.0], vec![2.0, 3.0], Some("growth".into())),
            OutputItem::markdown("# Title"),
        ];
        let state = PipelineState::Succeeded {
            request: RequestId(1),
            result: Box::new(ExecutionResult {
                display: display_string(&items),
                items,
                listing: "fn main():".into(),
                compile_ms: 0.5,
                run_ms: 0.25,
                finished_at_utc: String::new(),
            }),
        };
        let summary = build_text_summary(&state, true);
        assert_eq!(summary.stdout, vec!["hello world"]);
        assert_eq!(summary.stderr[0], "fn main():");
        assert!(summary.stderr.contains(&"[plot] growth (2 points)".to_string()));
        assert!(summary.stderr.contains(&"[markdown]".to_string()));
    }

    #[test]
    fn test_failure_goes_to_stderr() {
        let state = PipelineState::Failed {
            request: RequestId(1),
            error: RuntimeError::new("boom").into(),
        };
        let summary = build_text_summary(&state, false);
        assert!(summary.stdout.is_empty());
        assert_eq!(
            summary.stderr,
            vec!["Exception caught while executing the script:", "", "boom"]
        );
    }
}
