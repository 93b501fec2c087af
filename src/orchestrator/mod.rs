//! Application-level orchestration.
//!
//! This module owns the compile/run lifecycle (the controller and its state
//! machine), post-run processing such as rehydration, and the editor session
//! that feeds source text into the pipeline.

mod controller;
mod post_process;
mod session;

pub use controller::Pipeline;
pub use session::{Session, DEFAULT_SOURCE};
