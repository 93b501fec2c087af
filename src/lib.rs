//! Compile-and-run pipeline for a small scripting language.
//!
//! A [`orchestrator::Pipeline`] owns two long-lived stages, a compiler and a
//! runner, each on its own thread and reachable only through serialized
//! frames. Output items cross that boundary as plain records and are
//! rehydrated by the controller before being published.

pub mod bench;
pub mod cli;
pub mod error;
pub mod lang;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod stages;
mod text_summary;
pub mod tutorials;
