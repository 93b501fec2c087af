use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::PipelineError;
use crate::output::OutputItem;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Items per runner reply frame; 0 sends the whole result in one frame.
    pub chunk_items: usize,
    #[serde(with = "humantime_serde")]
    pub busy_notice_after: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_items: 256,
            busy_notice_after: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

/// Identifies one compile-and-run request. Allocated in increasing order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Compile,
    Run,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Compile => "compiling",
            Phase::Run => "running",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub items: Vec<OutputItem>,
    /// `text + "\n"` of every print item, in emission order.
    pub display: String,
    pub listing: String,
    pub compile_ms: f64,
    pub run_ms: f64,
    pub finished_at_utc: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    Compiling {
        request: RequestId,
    },
    Running {
        request: RequestId,
    },
    Succeeded {
        request: RequestId,
        // Boxed; the result dwarfs the other variants.
        result: Box<ExecutionResult>,
    },
    Failed {
        request: RequestId,
        error: PipelineError,
    },
}

impl PipelineState {
    /// True exactly while compiling or running.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            PipelineState::Compiling { .. } | PipelineState::Running { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Succeeded { .. } | PipelineState::Failed { .. }
        )
    }

    pub fn request(&self) -> Option<RequestId> {
        match self {
            PipelineState::Idle => None,
            PipelineState::Compiling { request }
            | PipelineState::Running { request }
            | PipelineState::Succeeded { request, .. }
            | PipelineState::Failed { request, .. } => Some(*request),
        }
    }

    /// What the output pane shows: the print text on success, the
    /// phase-prefixed message on failure.
    pub fn display_text(&self) -> Option<String> {
        match self {
            PipelineState::Succeeded { result, .. } => Some(result.display.clone()),
            PipelineState::Failed { error, .. } => Some(error.to_string()),
            _ => None,
        }
    }

    /// Failure replaces any previous items, so only success has any.
    pub fn items(&self) -> &[OutputItem] {
        match self {
            PipelineState::Succeeded { result, .. } => &result.items,
            _ => &[],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Compiling { .. } => "compiling",
            PipelineState::Running { .. } => "running",
            PipelineState::Succeeded { .. } => "succeeded",
            PipelineState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    PhaseStarted { request: RequestId, phase: Phase },
    Info(InfoEvent),
    Finished { state: PipelineState },
}

/// Structured info events emitted by the controller and consumed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    Superseded {
        previous: RequestId,
        by: RequestId,
    },
    StaleReply {
        request: RequestId,
        phase: Phase,
    },
    StillBusy {
        request: RequestId,
        phase: Phase,
        elapsed_ms: u64,
    },
}

impl InfoEvent {
    /// Render a human-readable message for CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::Superseded { previous, by } => {
                format!("Request {previous} superseded by {by}")
            }
            InfoEvent::StaleReply { request, phase } => {
                format!("Discarded stale {} reply for request {request}", phase_noun(*phase))
            }
            InfoEvent::StillBusy {
                request,
                phase,
                elapsed_ms,
            } => format!(
                "Still {} request {request} after {:.1}s…",
                phase.as_str(),
                *elapsed_ms as f64 / 1000.0
            ),
        }
    }
}

fn phase_noun(phase: Phase) -> &'static str {
    match phase {
        Phase::Compile => "compile",
        Phase::Run => "run",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;

    #[test]
    fn test_busy_tracks_in_flight_states() {
        assert!(!PipelineState::Idle.is_busy());
        assert!(PipelineState::Compiling { request: RequestId(1) }.is_busy());
        assert!(PipelineState::Running { request: RequestId(1) }.is_busy());
        let failed = PipelineState::Failed {
            request: RequestId(1),
            error: CompileError::new("x").into(),
        };
        assert!(!failed.is_busy());
        assert!(failed.is_terminal());
        assert_eq!(failed.request(), Some(RequestId(1)));
        assert!(failed.items().is_empty());
    }

    #[test]
    fn test_state_serializes_with_tag() {
        let json = serde_json::to_value(PipelineState::Running { request: RequestId(4) }).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["request"], 4);
    }

    #[test]
    fn test_config_durations_are_humantime() {
        let json = serde_json::to_value(PipelineConfig::default()).unwrap();
        assert_eq!(json["busy_notice_after"], "2s");
        assert_eq!(json["shutdown_grace"], "500ms");
    }

    #[test]
    fn test_info_messages() {
        let msg = InfoEvent::StillBusy {
            request: RequestId(2),
            phase: Phase::Run,
            elapsed_ms: 2500,
        }
        .to_message();
        assert_eq!(msg, "Still running request #2 after 2.5s…");
    }
}
