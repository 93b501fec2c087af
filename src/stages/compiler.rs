//! Compiler stage: source text in, compiled unit or compile error out.

use super::protocol::{CompileReply, CompileRequest};
use super::worker::StageService;
use crate::error::CompileError;
use crate::lang::{self, CompiledArtifact};
use crate::model::RequestId;

/// Anything that can turn source text into an executable unit.
pub trait Compiler: Send + 'static {
    fn compile(&mut self, source: &str) -> Result<CompiledArtifact, CompileError>;
}

/// The built-in script language.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptCompiler;

impl Compiler for ScriptCompiler {
    fn compile(&mut self, source: &str) -> Result<CompiledArtifact, CompileError> {
        lang::compile(source)
    }
}

pub(crate) struct CompilerService<C> {
    compiler: C,
}

impl<C: Compiler> CompilerService<C> {
    pub(crate) fn new(compiler: C) -> Self {
        Self { compiler }
    }
}

impl<C: Compiler> StageService for CompilerService<C> {
    type Request = CompileRequest;
    type Reply = CompileReply;

    const NAME: &'static str = "compiler";

    fn request_id(request: &CompileRequest) -> RequestId {
        request.request_id
    }

    fn handle(&mut self, request: CompileRequest) -> Vec<CompileReply> {
        let request_id = request.request_id;
        let reply = match self.compiler.compile(&request.source) {
            Ok(artifact) => CompileReply::Success {
                request_id,
                unit: artifact.unit,
                listing: artifact.listing,
            },
            Err(error) => {
                tracing::debug!(%request_id, "compile failed: {error}");
                CompileReply::Error { request_id, error }
            }
        };
        vec![reply]
    }

    fn fault(request_id: RequestId, message: String) -> CompileReply {
        CompileReply::Error {
            request_id,
            error: CompileError::new(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_errors_become_tagged_replies() {
        let mut service = CompilerService::new(ScriptCompiler);
        let replies = service.handle(CompileRequest {
            request_id: RequestId(3),
            source: "print(".into(),
        });
        assert!(matches!(
            replies.as_slice(),
            [CompileReply::Error { request_id: RequestId(3), .. }]
        ));
    }

    #[test]
    fn test_successful_compile_carries_listing() {
        let mut service = CompilerService::new(ScriptCompiler);
        let replies = service.handle(CompileRequest {
            request_id: RequestId(4),
            source: "print(1)".into(),
        });
        match replies.as_slice() {
            [CompileReply::Success { listing, .. }] => assert!(listing.contains("call print/1")),
            other => panic!("unexpected replies: {other:?}"),
        }
    }
}
