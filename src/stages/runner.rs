//! Runner stage: executes compiled units and streams back output records.

use super::protocol::{RunReply, RunRequest};
use super::worker::StageService;
use crate::error::RuntimeError;
use crate::lang::{CompiledUnit, Vm};
use crate::model::RequestId;
use crate::output::{OutputItem, OutputRecord};

/// Anything that can execute a compiled unit.
pub trait Runner: Send + 'static {
    fn run(&mut self, unit: &CompiledUnit) -> Result<Vec<OutputItem>, RuntimeError>;
}

/// Bytecode interpreter for the built-in script language.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptRunner;

impl Runner for ScriptRunner {
    fn run(&mut self, unit: &CompiledUnit) -> Result<Vec<OutputItem>, RuntimeError> {
        Vm::new(unit).run()
    }
}

pub(crate) struct RunnerService<R> {
    runner: R,
    chunk_items: usize,
}

impl<R: Runner> RunnerService<R> {
    /// `chunk_items == 0` sends every item in the final frame.
    pub(crate) fn new(runner: R, chunk_items: usize) -> Self {
        Self {
            runner,
            chunk_items,
        }
    }
}

impl<R: Runner> StageService for RunnerService<R> {
    type Request = RunRequest;
    type Reply = RunReply;

    const NAME: &'static str = "runner";

    fn request_id(request: &RunRequest) -> RequestId {
        request.request_id
    }

    fn handle(&mut self, request: RunRequest) -> Vec<RunReply> {
        let request_id = request.request_id;
        match self.runner.run(&request.unit) {
            Ok(items) => {
                let records = items.iter().map(OutputItem::to_record).collect();
                chunk_replies(request_id, records, self.chunk_items)
            }
            Err(error) => {
                tracing::debug!(%request_id, "run failed: {error}");
                vec![RunReply::Error { request_id, error }]
            }
        }
    }

    fn fault(request_id: RequestId, message: String) -> RunReply {
        RunReply::Error {
            request_id,
            error: RuntimeError::new(message),
        }
    }
}

/// Split records into `Chunk` frames of `chunk_items` each, ending with a
/// `Success` frame that carries the remainder and the overall count.
pub fn chunk_replies(
    request_id: RequestId,
    mut records: Vec<OutputRecord>,
    chunk_items: usize,
) -> Vec<RunReply> {
    let total = records.len();
    let mut replies = Vec::new();
    if chunk_items > 0 && total > chunk_items {
        let tail_len = match total % chunk_items {
            0 => chunk_items,
            n => n,
        };
        let tail = records.split_off(total - tail_len);
        let mut rest = records.into_iter().peekable();
        while rest.peek().is_some() {
            let items: Vec<_> = rest.by_ref().take(chunk_items).collect();
            replies.push(RunReply::Chunk { request_id, items });
        }
        records = tail;
    }
    replies.push(RunReply::Success {
        request_id,
        items: records,
        total,
    });
    replies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::compile;
    use crate::output::Value;

    fn records(n: usize) -> Vec<OutputRecord> {
        (0..n)
            .map(|i| OutputItem::print(Value::Num(i as f64)).to_record())
            .collect()
    }

    fn sizes(replies: &[RunReply]) -> Vec<usize> {
        replies
            .iter()
            .map(|r| match r {
                RunReply::Chunk { items, .. } | RunReply::Success { items, .. } => items.len(),
                RunReply::Error { .. } => usize::MAX,
            })
            .collect()
    }

    #[test]
    fn test_chunking_splits_and_counts() {
        let replies = chunk_replies(RequestId(1), records(7), 3);
        assert_eq!(sizes(&replies), vec![3, 3, 1]);
        assert!(matches!(replies.last(), Some(RunReply::Success { total: 7, .. })));

        let replies = chunk_replies(RequestId(1), records(6), 3);
        assert_eq!(sizes(&replies), vec![3, 3]);
    }

    #[test]
    fn test_no_chunking_when_disabled_or_small() {
        assert_eq!(sizes(&chunk_replies(RequestId(1), records(5), 0)), vec![5]);
        assert_eq!(sizes(&chunk_replies(RequestId(1), records(2), 3)), vec![2]);
        assert_eq!(sizes(&chunk_replies(RequestId(1), vec![], 3)), vec![0]);
    }

    #[test]
    fn test_runtime_error_is_tagged_reply() {
        let unit = compile("nope()").unwrap().unit;
        let mut service = RunnerService::new(ScriptRunner, 0);
        let replies = service.handle(RunRequest {
            request_id: RequestId(9),
            unit,
        });
        match replies.as_slice() {
            [RunReply::Error { request_id, error }] => {
                assert_eq!(*request_id, RequestId(9));
                assert!(error.message.contains("undefined function"));
            }
            other => panic!("unexpected replies: {other:?}"),
        }
    }
}
