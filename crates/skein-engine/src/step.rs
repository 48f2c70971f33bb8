//! Step capabilities consumed by the engine.
//!
//! A step is a black-box plugin (typically a container image) with a staged
//! lifecycle. The engine launches every step once per execution through
//! [`RunnableStep::start`], then talks to the returned [`RunningStep`]
//! handle: it delivers resolved stage inputs and polls the coarse state for
//! deadlock detection. The step reports progress through the
//! [`StageChangeHandler`] installed at start.

use std::sync::Arc;

use serde_json::{Map, Value};
use skein_types::step::{StepError, StepState};

// ---------------------------------------------------------------------------
// StageChangeHandler
// ---------------------------------------------------------------------------

/// Receives lifecycle events from one running step.
///
/// The engine installs one handler per step, so callbacks carry no step
/// identity. Callbacks may arrive from any thread. A step that reports
/// `Finished` from `state()` before its `on_step_complete` callback has run
/// is tolerated: the engine treats the completion event, not the state, as
/// the moment the final output exists.
pub trait StageChangeHandler: Send + Sync {
    /// The step moved from an optional previous stage into `new_stage`. If
    /// the previous stage produced an output, `previous_output` carries the
    /// output id and value.
    fn on_stage_change(
        &self,
        previous_stage: Option<&str>,
        previous_output: Option<(&str, &Value)>,
        new_stage: &str,
        waiting_for_input: bool,
    );

    /// The step finished; `previous_stage` is the stage it completed in.
    fn on_step_complete(&self, previous_stage: &str, previous_output: Option<(&str, &Value)>);
}

// ---------------------------------------------------------------------------
// RunnableStep / RunningStep
// ---------------------------------------------------------------------------

/// Factory for running steps. The deployer behind it (container pull,
/// stream attachment, ...) is opaque to the engine.
pub trait RunnableStep: Send + Sync {
    /// Launch the step with its static run data, installing the handler for
    /// lifecycle events. Returns a handle the engine owns until teardown.
    fn start(
        &self,
        run_data: Value,
        handler: Arc<dyn StageChangeHandler>,
    ) -> Result<Box<dyn RunningStep>, StepError>;
}

/// Handle to a launched step.
pub trait RunningStep: Send + Sync {
    /// Deliver resolved input for a stage.
    ///
    /// Contract: never blocks (steps buffer exactly one input per stage),
    /// and on success the step synchronously leaves `WaitingForInput` — a
    /// caller observing `state()` right after a successful delivery must not
    /// see the step still waiting for this input.
    fn provide_stage_input(
        &self,
        stage_id: &str,
        input: Map<String, Value>,
    ) -> Result<(), StepError>;

    /// The coarse state of the step.
    fn state(&self) -> StepState;

    /// Release the step's resources. Called exactly once at teardown.
    fn close(&self) -> Result<(), StepError>;
}
