//! The two isolated stages and the frame protocol between them and the controller.

pub mod compiler;
pub mod protocol;
pub mod runner;
mod worker;

pub use compiler::{Compiler, ScriptCompiler};
pub use runner::{chunk_replies, Runner, ScriptRunner};
pub use worker::{StageHandle, StageService};

use anyhow::Result;
use std::time::Duration;

/// Handles to both stages, spawned together and torn down together.
pub struct Stages {
    pub compiler: StageHandle,
    pub runner: StageHandle,
}

impl Stages {
    pub fn spawn<C: Compiler, R: Runner>(
        compiler: C,
        runner: R,
        chunk_items: usize,
    ) -> Result<Self> {
        Ok(Self {
            compiler: StageHandle::spawn(compiler::CompilerService::new(compiler))?,
            runner: StageHandle::spawn(runner::RunnerService::new(runner, chunk_items))?,
        })
    }

    pub async fn shutdown(self, grace: Duration) {
        futures::future::join(
            self.compiler.shutdown(grace),
            self.runner.shutdown(grace),
        )
        .await;
    }
}
