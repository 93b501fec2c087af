//! Post-run processing: rehydrate the records a run produced and derive the
//! display string.

use crate::error::RuntimeError;
use crate::model::ExecutionResult;
use crate::output::{self, OutputRecord};

/// Timings and diagnostics collected while a request was in flight.
pub(crate) struct RunMeta {
    pub listing: String,
    pub compile_ms: f64,
    pub run_ms: f64,
}

/// Turn the plain records of a finished run into an [`ExecutionResult`].
///
/// `expected` is the count announced by the runner's final frame; a mismatch
/// means frames were lost and fails the request like a malformed record does.
pub(crate) fn process_run_completion(
    records: Vec<OutputRecord>,
    expected: usize,
    meta: RunMeta,
) -> Result<ExecutionResult, RuntimeError> {
    if records.len() != expected {
        return Err(RuntimeError::new(format!(
            "runner announced {expected} output records but {} arrived",
            records.len()
        )));
    }
    let items = records
        .into_iter()
        .map(output::rehydrate)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RuntimeError::new(format!("malformed output record: {e}")))?;
    let display = output::display_string(&items);
    let finished_at_utc = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();

    Ok(ExecutionResult {
        items,
        display,
        listing: meta.listing,
        compile_ms: meta.compile_ms,
        run_ms: meta.run_ms,
        finished_at_utc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{OutputItem, Value};

    fn meta() -> RunMeta {
        RunMeta {
            listing: String::new(),
            compile_ms: 1.0,
            run_ms: 2.0,
        }
    }

    #[test]
    fn test_display_only_includes_prints() {
        let records = vec![
            OutputItem::print(Value::from("a")).to_record(),
            OutputItem::markdown("# heading").to_record(),
            OutputItem::print(Value::from(vec![1.0, 2.0])).to_record(),
        ];
        let result = process_run_completion(records, 3, meta()).unwrap();
        assert_eq!(result.display, "a\n[1, 2]\n");
        assert_eq!(result.items.len(), 3);
        assert!(!result.items[1].is_print());
        assert!(result.finished_at_utc.ends_with('Z'));
    }

    #[test]
    fn test_malformed_record_fails_as_runtime_error() {
        let records = vec![OutputRecord {
            kind: "sparkline".into(),
            payload: Value::Null,
        }];
        let err = process_run_completion(records, 1, meta()).unwrap_err();
        assert!(err.message.starts_with("malformed output record:"));
    }

    #[test]
    fn test_count_mismatch_is_reported() {
        let err = process_run_completion(vec![], 2, meta()).unwrap_err();
        assert!(err.message.contains("announced 2"));
    }
}
