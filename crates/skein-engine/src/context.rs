//! Live data model and immutable workflow context.
//!
//! The data model is the hierarchical mapping expressions evaluate against:
//! `{input: <validated input>, steps: {<step>: {<stage>: {<output>: value}}}}`.
//! It is created once per execution and grows monotonically as stages
//! complete. The workflow context is a side-channel byte mapping passed
//! unchanged to every expression evaluation (e.g. file-backed attachments).

use std::collections::HashMap;

use serde_json::{Map, Value};
use skein_types::step::Lifecycle;

/// Immutable side-channel inputs available to every expression evaluation.
pub type WorkflowContext = HashMap<String, Vec<u8>>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from data-model mutation.
#[derive(Debug, thiserror::Error)]
pub enum DataModelError {
    /// The step was never registered in the data model.
    #[error("unknown step '{0}' in data model")]
    UnknownStep(String),
}

// ---------------------------------------------------------------------------
// DataModel
// ---------------------------------------------------------------------------

/// The live data model for one execution.
#[derive(Debug, Clone)]
pub struct DataModel {
    root: Value,
}

impl DataModel {
    /// Create a data model with the validated workflow input installed under
    /// `input` and an empty `steps` mapping.
    pub fn new(input: Value) -> Self {
        let mut root = Map::new();
        root.insert("input".to_string(), input);
        root.insert("steps".to_string(), Value::Object(Map::new()));
        Self {
            root: Value::Object(root),
        }
    }

    /// Pre-populate `steps.<step_id>.<stage> = {}` for every lifecycle stage,
    /// so expressions observe empty maps rather than missing keys while a
    /// stage has not yet produced output.
    pub fn register_step(&mut self, step_id: &str, lifecycle: &Lifecycle) {
        let mut stages = Map::new();
        for stage in &lifecycle.stages {
            stages.insert(stage.clone(), Value::Object(Map::new()));
        }
        if let Some(Value::Object(steps)) = self.root.get_mut("steps") {
            steps.insert(step_id.to_string(), Value::Object(stages));
        }
    }

    /// Record a stage output at `steps.<step_id>.<stage_id>.<output_id>`.
    ///
    /// The stage entry is replaced by a mapping holding exactly the produced
    /// output: a stage completes once and carries one output id, so nothing
    /// is ever overwritten within an execution.
    pub fn record_stage_output(
        &mut self,
        step_id: &str,
        stage_id: &str,
        output_id: &str,
        output: Value,
    ) -> Result<(), DataModelError> {
        let steps = match self.root.get_mut("steps") {
            Some(Value::Object(steps)) => steps,
            _ => return Err(DataModelError::UnknownStep(step_id.to_string())),
        };
        let stages = steps
            .get_mut(step_id)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| DataModelError::UnknownStep(step_id.to_string()))?;
        let mut produced = Map::new();
        produced.insert(output_id.to_string(), output);
        stages.insert(stage_id.to_string(), Value::Object(produced));
        Ok(())
    }

    /// The current data model as a value tree, for expression evaluation.
    pub fn snapshot(&self) -> &Value {
        &self.root
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
