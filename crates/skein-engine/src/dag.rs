//! DAG node payloads and the stable node-id grammar.
//!
//! Every node in the execution DAG is a scheduling point: the synthetic
//! `input` gate, a step stage awaiting input, a specific stage output that
//! downstream nodes depend on, or the workflow `output`. Node ids are a
//! deterministic function of their coordinates so the compiler and the
//! scheduler always agree on them.

use std::sync::Arc;

use crate::expression::Template;
use crate::schema::Scope;

/// Id of the synthetic input gate node, removed when execution begins.
pub const INPUT_NODE_ID: &str = "input";

/// Id of the workflow output node.
pub const OUTPUT_NODE_ID: &str = "output";

/// Node id for a step stage.
pub fn stage_node_id(step_id: &str, stage_id: &str) -> String {
    format!("steps.{step_id}.stages.{stage_id}")
}

/// Node id for a specific stage output.
pub fn stage_output_node_id(step_id: &str, stage_id: &str, output_id: &str) -> String {
    format!("steps.{step_id}.stages.{stage_id}.outputs.{output_id}")
}

// ---------------------------------------------------------------------------
// DagItem
// ---------------------------------------------------------------------------

/// The kind of a DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DagItemKind {
    /// The synthetic input gate.
    Input,
    /// A step stage requiring input.
    StepStage,
    /// A marker for one named output of a stage; removed only when the stage
    /// actually produces that output id.
    StepStageOutput,
    /// The workflow output.
    Output,
}

/// Payload of a DAG node.
#[derive(Debug, Clone)]
pub struct DagItem {
    pub kind: DagItemKind,
    pub step_id: Option<String>,
    pub stage_id: Option<String>,
    pub output_id: Option<String>,
    /// Input template resolved when the node becomes ready. Nodes without a
    /// template are pure gates.
    pub input: Option<Template>,
    /// Optional schema the resolved input is rechecked against before
    /// delivery.
    pub input_schema: Option<Arc<dyn Scope>>,
}

impl DagItem {
    /// The synthetic input gate. Carries no template and no schema; its sole
    /// role is to hold back root stages until execution begins.
    pub fn input_gate() -> Self {
        Self {
            kind: DagItemKind::Input,
            step_id: None,
            stage_id: None,
            output_id: None,
            input: None,
            input_schema: None,
        }
    }

    /// A step stage awaiting input.
    pub fn step_stage(
        step_id: impl Into<String>,
        stage_id: impl Into<String>,
        input: Option<Template>,
        input_schema: Option<Arc<dyn Scope>>,
    ) -> Self {
        Self {
            kind: DagItemKind::StepStage,
            step_id: Some(step_id.into()),
            stage_id: Some(stage_id.into()),
            output_id: None,
            input,
            input_schema,
        }
    }

    /// A marker node for one named output of a stage.
    pub fn stage_output(
        step_id: impl Into<String>,
        stage_id: impl Into<String>,
        output_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: DagItemKind::StepStageOutput,
            step_id: Some(step_id.into()),
            stage_id: Some(stage_id.into()),
            output_id: Some(output_id.into()),
            input: None,
            input_schema: None,
        }
    }

    /// The workflow output node; its resolved template is the workflow
    /// result.
    pub fn workflow_output(template: Template) -> Self {
        Self {
            kind: DagItemKind::Output,
            step_id: None,
            stage_id: None,
            output_id: None,
            input: Some(template),
            input_schema: None,
        }
    }

    /// The stable node id for this item.
    pub fn node_id(&self) -> String {
        match self.kind {
            DagItemKind::Input => INPUT_NODE_ID.to_string(),
            DagItemKind::Output => OUTPUT_NODE_ID.to_string(),
            DagItemKind::StepStage => stage_node_id(
                self.step_id.as_deref().unwrap_or_default(),
                self.stage_id.as_deref().unwrap_or_default(),
            ),
            DagItemKind::StepStageOutput => stage_output_node_id(
                self.step_id.as_deref().unwrap_or_default(),
                self.stage_id.as_deref().unwrap_or_default(),
                self.output_id.as_deref().unwrap_or_default(),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
