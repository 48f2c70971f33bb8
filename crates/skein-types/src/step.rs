//! Step lifecycle types.
//!
//! A step is a reusable unit of work with a lifecycle of one or more stages.
//! The engine observes a running step only through its coarse
//! [`StepState`]; the stage-by-stage detail travels through the stage-change
//! handler callbacks instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// StepState
// ---------------------------------------------------------------------------

/// The coarse state of a running step, as reported by `RunningStep::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// The step has been launched but is not yet able to accept input
    /// (e.g. its container is still being deployed).
    Starting,
    /// The step is idle, waiting for input to one of its stages.
    WaitingForInput,
    /// The step is actively executing a stage.
    Running,
    /// The step has finished; no further stage changes will be reported.
    Finished,
}

impl StepState {
    /// Human-readable label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Starting => "starting",
            StepState::WaitingForInput => "waiting_for_input",
            StepState::Running => "running",
            StepState::Finished => "finished",
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// The ordered list of stages a step moves through.
///
/// Produced by the workflow compiler alongside the DAG; the engine uses it to
/// pre-populate per-stage placeholders in the data model before any step
/// starts, so expressions always observe well-typed empty maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    /// Stage IDs in execution order.
    pub stages: Vec<String>,
}

impl Lifecycle {
    /// Build a lifecycle from stage IDs.
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stages: stages.into_iter().map(Into::into).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors reported by step implementations.
#[derive(Debug, Error)]
pub enum StepError {
    /// The step could not be launched.
    #[error("step failed to start: {0}")]
    StartFailed(String),

    /// Input was offered for a stage the step does not have.
    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    /// A stage may receive input at most once.
    #[error("stage '{0}' already received input")]
    DuplicateStageInput(String),

    /// The step has already been closed.
    #[error("step is closed")]
    Closed,

    /// The step failed while executing.
    #[error("step execution failed: {0}")]
    ExecutionFailed(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
