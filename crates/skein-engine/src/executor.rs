//! Executor front-end and scheduler loop.
//!
//! A [`Workflow`] is a compiled DAG plus its steps and input scope.
//! `execute` launches every step, removes the synthetic `input` gate, and
//! then drives the DAG: whenever a node has no inbound edges left, its input
//! template is resolved against the live data model and either delivered to
//! the owning step's stage or emitted as the workflow output. Stage
//! completions mutate the DAG and re-run the scheduler until the output is
//! produced, the caller cancels, or no step can make further progress
//! (deadlock).
//!
//! All loop state lives behind a single mutex; stage-change callbacks from
//! any thread serialize through it, which is what makes the data model
//! history consistent for expression evaluation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use skein_types::step::{Lifecycle, StepError, StepState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::{DataModel, WorkflowContext};
use crate::dag::{DagItem, DagItemKind, INPUT_NODE_ID, OUTPUT_NODE_ID, stage_node_id,
    stage_output_node_id};
use crate::expression::{ExpressionError, resolve_expressions};
use crate::graph::DirectedGraph;
use crate::schema::{Scope, SchemaError, value_kind};
use crate::step::{RunnableStep, RunningStep, StageChangeHandler};

// ---------------------------------------------------------------------------
// ExecutionError
// ---------------------------------------------------------------------------

/// Errors surfaced by workflow execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The top-level input failed the workflow input scope.
    #[error("invalid workflow input: {0}")]
    InvalidInput(#[source] SchemaError),

    /// The workflow structure is unusable (missing synthetic nodes, cycles,
    /// stage nodes referencing unknown steps).
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// A step could not be launched.
    #[error("failed to launch step '{step_id}': {source}")]
    StepLaunch {
        step_id: String,
        #[source]
        source: StepError,
    },

    /// An expression raised during input resolution. A well-formed compiled
    /// workflow must not produce these.
    #[error("cannot resolve expressions for '{node_id}': {source}")]
    ExpressionEvaluation {
        node_id: String,
        #[source]
        source: ExpressionError,
    },

    /// A resolved stage input failed the stage's declared schema — an
    /// engine/compiler bug.
    #[error("schema evaluation resulted in invalid data for '{node_id}': {source}")]
    SchemaMismatch {
        node_id: String,
        #[source]
        source: SchemaError,
    },

    /// Invariant violation inside the scheduler (missing-node lookups,
    /// mutation failures on nodes the scheduler just observed).
    #[error("internal error: {0}")]
    Internal(String),

    /// No step can make further progress and the output has not been
    /// produced.
    #[error(
        "no steps running, no more executable steps, cannot construct workflow output \
         (unmet dependencies: {})",
        .dependencies.join(", ")
    )]
    Deadlock { dependencies: Vec<String> },

    /// A step failed to release its resources at teardown.
    #[error("failed to close step '{step_id}': {source}")]
    StepClose {
        step_id: String,
        #[source]
        source: StepError,
    },

    /// The caller's context was cancelled.
    #[error("workflow execution aborted")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// An executable workflow: the compiled DAG, its steps, and the input scope.
pub struct Workflow {
    dag: DirectedGraph<DagItem>,
    input: Arc<dyn Scope>,
    step_run_data: HashMap<String, Value>,
    workflow_context: WorkflowContext,
    steps: HashMap<String, Arc<dyn RunnableStep>>,
    lifecycles: HashMap<String, Lifecycle>,
}

impl Workflow {
    /// Assemble a workflow from compiled parts, validating its structure.
    pub fn new(
        dag: DirectedGraph<DagItem>,
        input: Arc<dyn Scope>,
        step_run_data: HashMap<String, Value>,
        workflow_context: WorkflowContext,
        steps: HashMap<String, Arc<dyn RunnableStep>>,
        lifecycles: HashMap<String, Lifecycle>,
    ) -> Result<Self, ExecutionError> {
        match dag.item(INPUT_NODE_ID) {
            Some(item) if item.kind == DagItemKind::Input => {}
            _ => {
                return Err(ExecutionError::InvalidWorkflow(
                    "missing synthetic input node".to_string(),
                ));
            }
        }
        match dag.item(OUTPUT_NODE_ID) {
            Some(item) if item.kind == DagItemKind::Output && item.input.is_some() => {}
            _ => {
                return Err(ExecutionError::InvalidWorkflow(
                    "missing workflow output node or output template".to_string(),
                ));
            }
        }
        // Cycles are deliberately not rejected here: a compiler that failed
        // to reject one produces a workflow whose steps all starve, and the
        // runtime deadlock detection reports the unmet dependencies.
        for node_id in dag.node_ids() {
            let Some(item) = dag.item(&node_id) else {
                continue;
            };
            if item.kind == DagItemKind::StepStage {
                let step_id = item.step_id.as_deref().unwrap_or_default();
                if !steps.contains_key(step_id) || !lifecycles.contains_key(step_id) {
                    return Err(ExecutionError::InvalidWorkflow(format!(
                        "stage node '{node_id}' references unknown step '{step_id}'"
                    )));
                }
            }
        }
        for step_id in steps.keys() {
            if !lifecycles.contains_key(step_id) {
                return Err(ExecutionError::InvalidWorkflow(format!(
                    "step '{step_id}' has no lifecycle"
                )));
            }
        }
        Ok(Self {
            dag,
            input,
            step_run_data,
            workflow_context,
            steps,
            lifecycles,
        })
    }

    /// The scope that validates the top-level workflow input.
    pub fn input(&self) -> Arc<dyn Scope> {
        Arc::clone(&self.input)
    }

    /// The compiled DAG, for visualization and introspection.
    pub fn dag(&self) -> &DirectedGraph<DagItem> {
        &self.dag
    }

    /// Run the workflow with the given input.
    ///
    /// `cancel` is the caller's context: cancelling it aborts the execution.
    /// Returns the resolved workflow output, or the first error the engine
    /// recorded. Every launched step is closed before this returns.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        input: Value,
    ) -> Result<Value, ExecutionError> {
        let input = self
            .input
            .unserialize(&input)
            .map_err(ExecutionError::InvalidInput)?;

        // Scoped cancellation: internal bugs cancel this child token, and
        // dropping the guard cancels it on every return path.
        let cancel = cancel.child_token();
        let _cancel_guard = cancel.clone().drop_guard();

        let (output_tx, mut output_rx) = mpsc::channel(1);

        let mut data = DataModel::new(input);
        for (step_id, lifecycle) in &self.lifecycles {
            data.register_step(step_id, lifecycle);
        }

        let state = Arc::new(LoopState {
            inner: Mutex::new(LoopInner {
                data,
                dag: self.dag.clone(),
                notified: HashSet::new(),
                running_steps: HashMap::new(),
                completed_steps: HashSet::new(),
                output_done: false,
                last_error: None,
            }),
            output_tx,
            cancel: cancel.clone(),
            workflow_context: self.workflow_context.clone(),
        });

        let result = self.run(&state, &mut output_rx, &cancel).await;

        // Teardown: close every launched step exactly once, whatever the
        // outcome above was.
        tracing::debug!("terminating all steps");
        let running = {
            let mut inner = state.lock();
            std::mem::take(&mut inner.running_steps)
        };
        let mut ordered: Vec<(String, Box<dyn RunningStep>)> = running.into_iter().collect();
        ordered.sort_by(|(a, _), (b, _)| a.cmp(b));
        let mut close_error = None;
        for (step_id, step) in ordered {
            tracing::debug!(step_id = step_id.as_str(), "terminating step");
            if let Err(source) = step.close() {
                debug_assert!(false, "failed to close step {step_id}: {source}");
                tracing::error!(
                    step_id = step_id.as_str(),
                    error = %source,
                    "failed to close step"
                );
                close_error.get_or_insert(ExecutionError::StepClose { step_id, source });
            }
        }

        match result {
            Ok(output) => match close_error {
                Some(err) => Err(err),
                None => Ok(output),
            },
            Err(err) => Err(err),
        }
    }

    /// Launch steps, seed the scheduler, and wait for the outcome.
    async fn run(
        &self,
        state: &Arc<LoopState>,
        output_rx: &mut mpsc::Receiver<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, ExecutionError> {
        let mut step_ids: Vec<&String> = self.steps.keys().collect();
        step_ids.sort();
        for step_id in step_ids {
            let handler: Arc<dyn StageChangeHandler> = Arc::new(EngineStageHandler {
                step_id: step_id.clone(),
                state: Arc::downgrade(state),
            });
            let run_data = self
                .step_run_data
                .get(step_id)
                .cloned()
                .unwrap_or(Value::Null);
            tracing::debug!(step_id = step_id.as_str(), "launching step");
            let running = self.steps[step_id]
                .start(run_data, handler)
                .map_err(|source| ExecutionError::StepLaunch {
                    step_id: step_id.clone(),
                    source,
                })?;
            state.lock().running_steps.insert(step_id.clone(), running);
        }

        // Removing the synthetic input node unblocks the root stages.
        {
            let mut inner = state.lock();
            tracing::debug!(dag = %inner.dag.mermaid(), "starting workflow execution");
            inner
                .dag
                .remove_node(INPUT_NODE_ID)
                .map_err(|e| ExecutionError::Internal(format!("cannot remove input node: {e}")))?;
        }
        state.notify_steps();

        tokio::select! {
            received = output_rx.recv() => match received {
                Some(output) => {
                    tracing::debug!("workflow output complete");
                    Ok(output)
                }
                None => Err(ExecutionError::Internal(
                    "output channel unexpectedly closed".to_string(),
                )),
            },
            _ = cancel.cancelled() => {
                tracing::debug!("workflow execution aborted");
                let last_error = state.lock().last_error.take();
                Err(last_error.unwrap_or(ExecutionError::Cancelled))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LoopState
// ---------------------------------------------------------------------------

/// The per-execution state shared between the executor and the stage-change
/// handlers. Exactly one mutex guards the mutable parts.
struct LoopState {
    inner: Mutex<LoopInner>,
    output_tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
    workflow_context: WorkflowContext,
}

struct LoopInner {
    data: DataModel,
    dag: DirectedGraph<DagItem>,
    /// Ready nodes already dispatched; makes scheduling idempotent.
    notified: HashSet<String>,
    running_steps: HashMap<String, Box<dyn RunningStep>>,
    /// Steps whose completion event has been applied. The census trusts this
    /// over `RunningStep::state`: a step reporting `Finished` before its
    /// completion event is applied still has progress in flight.
    completed_steps: HashSet<String>,
    output_done: bool,
    last_error: Option<ExecutionError>,
}

impl LoopState {
    fn lock(&self) -> MutexGuard<'_, LoopInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failure and cancel the execution. The first recorded error
    /// wins; later failures are logged but do not replace it.
    fn record_failure(&self, inner: &mut LoopInner, error: ExecutionError) {
        tracing::error!(error = %error, "workflow failure");
        if inner.last_error.is_none() {
            inner.last_error = Some(error);
        }
        self.cancel.cancel();
    }

    /// Funnel for both stage-change and step-complete events.
    fn on_stage_complete(
        &self,
        step_id: &str,
        previous_stage: Option<&str>,
        previous_output: Option<(&str, &Value)>,
        step_finished: bool,
    ) {
        self.apply_stage_completion(step_id, previous_stage, previous_output, step_finished);
        self.notify_steps();
    }

    fn apply_stage_completion(
        &self,
        step_id: &str,
        previous_stage: Option<&str>,
        previous_output: Option<(&str, &Value)>,
        step_finished: bool,
    ) {
        let mut inner = self.lock();
        if step_finished {
            // Recorded under the same lock acquisition as the node removal
            // and data insertion, so the census never observes a completed
            // step whose output is not yet applied.
            inner.completed_steps.insert(step_id.to_string());
        }
        // Entering the first stage: nothing to retire yet.
        let Some(previous_stage) = previous_stage else {
            return;
        };

        let stage_node = stage_node_id(step_id, previous_stage);
        if let Err(e) = inner.dag.remove_node(&stage_node) {
            self.record_failure(
                &mut inner,
                ExecutionError::Internal(format!(
                    "failed to remove stage node '{stage_node}': {e}"
                )),
            );
            return;
        }

        if let Some((output_id, output)) = previous_output {
            let output_node = stage_output_node_id(step_id, previous_stage, output_id);
            if let Err(e) = inner.dag.remove_node(&output_node) {
                self.record_failure(
                    &mut inner,
                    ExecutionError::Internal(format!(
                        "failed to remove output node '{output_node}': {e}"
                    )),
                );
                return;
            }
            // The node removal and the data insertion happen under the same
            // lock acquisition: readers observe both or neither.
            if let Err(e) =
                inner
                    .data
                    .record_stage_output(step_id, previous_stage, output_id, output.clone())
            {
                self.record_failure(&mut inner, ExecutionError::Internal(e.to_string()));
            }
        }
    }

    /// One scheduler pass: dispatch every newly-ready node, then check for
    /// deadlock. Safe to re-run at any frequency — the notified set prevents
    /// double dispatch.
    fn notify_steps(&self) {
        let mut inner = self.lock();

        let ready = inner.dag.nodes_without_inbound();
        tracing::debug!(count = ready.len(), "DAG nodes with no inbound connection");
        for node_id in ready {
            if !inner.notified.insert(node_id.clone()) {
                continue;
            }
            let Some(item) = inner.dag.item(&node_id).cloned() else {
                continue;
            };
            let Some(template) = item.input else {
                // No input data is needed; the node is a pure gate.
                continue;
            };

            let resolved = match resolve_expressions(
                &template,
                inner.data.snapshot(),
                &self.workflow_context,
            ) {
                Ok(value) => value,
                Err(source) => {
                    self.record_failure(
                        &mut inner,
                        ExecutionError::ExpressionEvaluation { node_id, source },
                    );
                    return;
                }
            };

            match item.kind {
                DagItemKind::StepStage => {
                    if let Some(schema) = &item.input_schema {
                        if let Err(source) = schema.unserialize(&resolved) {
                            self.record_failure(
                                &mut inner,
                                ExecutionError::SchemaMismatch { node_id, source },
                            );
                            return;
                        }
                    }
                    let (Some(step_id), Some(stage_id)) = (&item.step_id, &item.stage_id) else {
                        continue;
                    };
                    let stage_input = match resolved {
                        Value::Object(map) => map,
                        other => {
                            self.record_failure(
                                &mut inner,
                                ExecutionError::Internal(format!(
                                    "stage input for '{node_id}' did not resolve to a mapping \
                                     (got {})",
                                    value_kind(&other)
                                )),
                            );
                            return;
                        }
                    };
                    tracing::debug!(node_id = node_id.as_str(), "providing stage input");
                    if !inner.running_steps.contains_key(step_id) {
                        self.record_failure(
                            &mut inner,
                            ExecutionError::Internal(format!(
                                "no running step '{step_id}' for node '{node_id}'"
                            )),
                        );
                        return;
                    }
                    if let Err(e) =
                        inner.running_steps[step_id].provide_stage_input(stage_id, stage_input)
                    {
                        self.record_failure(
                            &mut inner,
                            ExecutionError::Internal(format!(
                                "failed to provide input to step '{step_id}': {e}"
                            )),
                        );
                        return;
                    }
                }
                DagItemKind::Output => {
                    tracing::debug!("constructing workflow output");
                    inner.output_done = true;
                    // Capacity >= 1 and at most one output dispatch, so this
                    // never blocks.
                    let _ = self.output_tx.try_send(resolved);
                }
                DagItemKind::Input | DagItemKind::StepStageOutput => {}
            }
        }

        // Stage-change events can arrive while later steps are still
        // launching; until the input gate is removed, a quiet census is not
        // a progress signal.
        if inner.dag.contains(INPUT_NODE_ID) {
            return;
        }

        let mut starting = 0usize;
        let mut waiting = 0usize;
        let mut running = 0usize;
        let mut finished = 0usize;
        for (step_id, step) in &inner.running_steps {
            let state = if inner.completed_steps.contains(step_id) {
                StepState::Finished
            } else {
                match step.state() {
                    // The completion event is still in flight; its output
                    // has not been applied yet, so the step has progress
                    // pending.
                    StepState::Finished => StepState::Running,
                    other => other,
                }
            };
            tracing::debug!(
                step_id = step_id.as_str(),
                state = state.as_str(),
                "step state"
            );
            match state {
                StepState::Starting => starting += 1,
                StepState::WaitingForInput => waiting += 1,
                StepState::Running => running += 1,
                StepState::Finished => finished += 1,
            }
        }
        tracing::debug!(
            starting,
            waiting,
            running,
            finished,
            "scheduler pass complete"
        );

        if starting == 0 && running == 0 && !inner.output_done {
            match inner.dag.inbound_of(OUTPUT_NODE_ID) {
                Ok(unmet) if !unmet.is_empty() => {
                    self.record_failure(
                        &mut inner,
                        ExecutionError::Deadlock { dependencies: unmet },
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    self.record_failure(
                        &mut inner,
                        ExecutionError::Internal(format!("cannot inspect output node: {e}")),
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EngineStageHandler
// ---------------------------------------------------------------------------

/// Per-step adapter translating step lifecycle callbacks into scheduler
/// events. Holds a non-owning back-reference to the loop state; ownership
/// flows state → steps only.
struct EngineStageHandler {
    step_id: String,
    state: Weak<LoopState>,
}

impl StageChangeHandler for EngineStageHandler {
    fn on_stage_change(
        &self,
        previous_stage: Option<&str>,
        previous_output: Option<(&str, &Value)>,
        new_stage: &str,
        waiting_for_input: bool,
    ) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        tracing::debug!(
            step_id = self.step_id.as_str(),
            stage = new_stage,
            waiting_for_input,
            "stage change"
        );
        state.on_stage_complete(&self.step_id, previous_stage, previous_output, false);
    }

    fn on_step_complete(&self, previous_stage: &str, previous_output: Option<(&str, &Value)>) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        tracing::debug!(step_id = self.step_id.as_str(), "step complete");
        state.on_stage_complete(&self.step_id, Some(previous_stage), previous_output, true);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
