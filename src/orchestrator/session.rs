//! Editor-side state: the current source text and the tutorial list.

use anyhow::{bail, Result};

use super::controller::Pipeline;
use crate::model::{PipelineState, RequestId};
use crate::tutorials::{Tutorial, TutorialProvider};

pub const DEFAULT_SOURCE: &str = "//write your code here\nprint(\"hello world\")\n";

/// Owns the source text and submits it to the pipeline on request.
pub struct Session {
    source: String,
    tutorials: Vec<Tutorial>,
    pipeline: Pipeline,
}

impl Session {
    pub fn new(pipeline: Pipeline, provider: &dyn TutorialProvider) -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            tutorials: provider.list_tutorials(),
            pipeline,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn edit(&mut self, source: impl Into<String>) {
        self.source = source.into();
    }

    pub fn tutorials(&self) -> &[Tutorial] {
        &self.tutorials
    }

    /// Replace the source with tutorial `index` (0-based).
    pub fn load_tutorial(&mut self, index: usize) -> Result<&Tutorial> {
        let Some(tutorial) = self.tutorials.get(index) else {
            bail!(
                "no tutorial {} (there are {})",
                index + 1,
                self.tutorials.len()
            );
        };
        self.source = tutorial.source.clone();
        Ok(tutorial)
    }

    pub fn compile_and_run(&self) -> RequestId {
        self.pipeline.compile_and_run(self.source.clone())
    }

    pub fn state(&self) -> PipelineState {
        self.pipeline.current_state()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub async fn shutdown(self) -> Result<()> {
        self.pipeline.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PipelineConfig;
    use crate::tutorials::BuiltinTutorials;

    #[tokio::test]
    async fn test_default_source_runs_hello_world() {
        let pipeline = Pipeline::with_script_stages(PipelineConfig::default(), None).unwrap();
        let session = Session::new(pipeline, &BuiltinTutorials);
        assert_eq!(session.source(), DEFAULT_SOURCE);

        let request = session.compile_and_run();
        let state = session.pipeline().settled(request).await.unwrap();
        assert_eq!(state.display_text().as_deref(), Some("hello world\n"));
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_tutorial_replaces_source() {
        let pipeline = Pipeline::with_script_stages(PipelineConfig::default(), None).unwrap();
        let mut session = Session::new(pipeline, &BuiltinTutorials);
        session.edit("print(1)");
        let expected = session.tutorials()[1].source.clone();
        session.load_tutorial(1).unwrap();
        assert_eq!(session.source(), expected);

        let err = session.load_tutorial(99).unwrap_err();
        assert!(err.to_string().starts_with("no tutorial 100"));
        assert_eq!(session.source(), expected);
        session.shutdown().await.unwrap();
    }
}
