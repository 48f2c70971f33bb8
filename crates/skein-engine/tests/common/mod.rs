//! Shared harness for the end-to-end execution tests: a scripted in-process
//! step implementation, an event journal, and a workflow fixture builder.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde_json::{Map, Value};
use skein_engine::context::WorkflowContext;
use skein_engine::dag::{DagItem, INPUT_NODE_ID, OUTPUT_NODE_ID, stage_node_id,
    stage_output_node_id};
use skein_engine::executor::Workflow;
use skein_engine::expression::{JexlExpression, Template};
use skein_engine::graph::DirectedGraph;
use skein_engine::schema::{AnyScope, Scope};
use skein_engine::step::{RunnableStep, RunningStep, StageChangeHandler};
use skein_types::step::{Lifecycle, StepError, StepState};

/// Install a fmt subscriber honoring RUST_LOG, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// ---------------------------------------------------------------------------
// Template helpers
// ---------------------------------------------------------------------------

/// A JEXL expression leaf.
pub fn expr(source: &str) -> Template {
    Template::expr(JexlExpression::new(source))
}

/// A mapping template.
pub fn obj(entries: Vec<(&str, Template)>) -> Template {
    Template::Map(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<String, Template>>(),
    )
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Ordered record of step events: `launch:<id>`, `dispatch:<id>`,
/// `complete:<id>`, `close:<id>`.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    pub fn index_of(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

// ---------------------------------------------------------------------------
// Scripted step
// ---------------------------------------------------------------------------

/// What a scripted stage does once it receives input.
#[derive(Clone)]
pub enum StageScript {
    /// Emit the given output id with a value computed from the stage input.
    Emit {
        output_id: &'static str,
        compute: Arc<dyn Fn(&Map<String, Value>) -> Value + Send + Sync>,
    },
    /// Accept the input and then run until the engine closes the step.
    Hang,
}

/// Emit `output_id` with a value computed from the stage input.
pub fn emit(
    output_id: &'static str,
    compute: impl Fn(&Map<String, Value>) -> Value + Send + Sync + 'static,
) -> StageScript {
    StageScript::Emit {
        output_id,
        compute: Arc::new(compute),
    }
}

/// Emit `output_id` with a fixed value.
pub fn emit_value(output_id: &'static str, value: Value) -> StageScript {
    emit(output_id, move |_| value.clone())
}

/// A single-stage step driven by a [`StageScript`], running its lifecycle on
/// a worker thread and reporting through the installed handler.
pub struct ScriptedStep {
    label: String,
    stage: String,
    script: StageScript,
    journal: Journal,
    fail_start: bool,
}

impl RunnableStep for ScriptedStep {
    fn start(
        &self,
        _run_data: Value,
        handler: Arc<dyn StageChangeHandler>,
    ) -> Result<Box<dyn RunningStep>, StepError> {
        if self.fail_start {
            return Err(StepError::StartFailed("scripted launch failure".to_string()));
        }
        self.journal.record(format!("launch:{}", self.label));

        let state = Arc::new(Mutex::new(StepState::Starting));
        let (input_tx, input_rx) = mpsc::channel::<Map<String, Value>>();
        let (park_tx, park_rx) = mpsc::channel::<()>();

        let worker = {
            let state = Arc::clone(&state);
            let stage = self.stage.clone();
            let script = self.script.clone();
            let journal = self.journal.clone();
            let label = self.label.clone();
            thread::spawn(move || {
                *state.lock().unwrap() = StepState::WaitingForInput;
                handler.on_stage_change(None, None, &stage, true);
                let Ok(input) = input_rx.recv() else {
                    // closed before any input arrived
                    return;
                };
                match script {
                    StageScript::Emit { output_id, compute } => {
                        let output = (*compute)(&input);
                        journal.record(format!("complete:{label}"));
                        handler.on_step_complete(&stage, Some((output_id, &output)));
                        *state.lock().unwrap() = StepState::Finished;
                    }
                    StageScript::Hang => {
                        let _ = park_rx.recv();
                    }
                }
            })
        };

        Ok(Box::new(ScriptedRunning {
            label: self.label.clone(),
            stage: self.stage.clone(),
            state,
            journal: self.journal.clone(),
            input_tx: Mutex::new(Some(input_tx)),
            park_tx: Mutex::new(Some(park_tx)),
            worker: Mutex::new(Some(worker)),
        }))
    }
}

struct ScriptedRunning {
    label: String,
    stage: String,
    state: Arc<Mutex<StepState>>,
    journal: Journal,
    input_tx: Mutex<Option<mpsc::Sender<Map<String, Value>>>>,
    park_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RunningStep for ScriptedRunning {
    fn provide_stage_input(
        &self,
        stage_id: &str,
        input: Map<String, Value>,
    ) -> Result<(), StepError> {
        if stage_id != self.stage {
            return Err(StepError::UnknownStage(stage_id.to_string()));
        }
        let guard = self.input_tx.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            return Err(StepError::Closed);
        };
        self.journal.record(format!("dispatch:{}", self.label));
        // Leave WaitingForInput synchronously, per the delivery contract.
        *self.state.lock().unwrap() = StepState::Running;
        tx.send(input).map_err(|_| StepError::Closed)?;
        Ok(())
    }

    fn state(&self) -> StepState {
        *self.state.lock().unwrap()
    }

    fn close(&self) -> Result<(), StepError> {
        self.journal.record(format!("close:{}", self.label));
        self.input_tx.lock().unwrap().take();
        self.park_tx.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

/// Builds a workflow the way the compiler would: an input gate, one stage
/// node per step (stage id `exec`), one marker node per declared stage
/// output, and a workflow output node, wired with dependency edges.
pub struct Fixture {
    dag: DirectedGraph<DagItem>,
    steps: HashMap<String, Arc<dyn RunnableStep>>,
    lifecycles: HashMap<String, Lifecycle>,
    input_scope: Arc<dyn Scope>,
    journal: Journal,
}

impl Fixture {
    pub fn new() -> Self {
        let mut dag = DirectedGraph::new();
        dag.add_node(INPUT_NODE_ID, DagItem::input_gate()).unwrap();
        Self {
            dag,
            steps: HashMap::new(),
            lifecycles: HashMap::new(),
            input_scope: Arc::new(AnyScope),
            journal: Journal::default(),
        }
    }

    /// Replace the workflow input scope (defaults to accept-all).
    pub fn input_scope(&mut self, scope: impl Scope + 'static) {
        self.input_scope = Arc::new(scope);
    }

    /// Add a single-stage step with declared outputs and a script.
    pub fn step(&mut self, id: &str, outputs: &[&str], template: Template, script: StageScript) {
        self.add_step(id, outputs, Some(template), None, script, false);
    }

    /// Like [`Fixture::step`], with a declared stage input schema.
    pub fn step_with_schema(
        &mut self,
        id: &str,
        outputs: &[&str],
        template: Template,
        schema: Arc<dyn Scope>,
        script: StageScript,
    ) {
        self.add_step(id, outputs, Some(template), Some(schema), script, false);
    }

    /// Add a step whose launch fails.
    pub fn failing_step(&mut self, id: &str) {
        self.add_step(
            id,
            &["out"],
            Some(obj(vec![])),
            None,
            emit_value("out", Value::Null),
            true,
        );
    }

    /// Gate `consumer`'s stage on `producer` emitting `output_id`.
    pub fn depends_on(&mut self, consumer: &str, producer: &str, output_id: &str) {
        self.dag
            .connect(
                &stage_output_node_id(producer, "exec", output_id),
                &stage_node_id(consumer, "exec"),
            )
            .unwrap();
    }

    /// Set the workflow output template and its stage-output dependencies.
    pub fn output(&mut self, template: Template, deps: &[(&str, &str)]) {
        self.dag
            .add_node(OUTPUT_NODE_ID, DagItem::workflow_output(template))
            .unwrap();
        for (step_id, output_id) in deps {
            self.dag
                .connect(
                    &stage_output_node_id(step_id, "exec", output_id),
                    OUTPUT_NODE_ID,
                )
                .unwrap();
        }
    }

    pub fn build(self) -> (Workflow, Journal) {
        let workflow = Workflow::new(
            self.dag,
            self.input_scope,
            HashMap::new(),
            WorkflowContext::new(),
            self.steps,
            self.lifecycles,
        )
        .expect("fixture builds a valid workflow");
        (workflow, self.journal)
    }

    fn add_step(
        &mut self,
        id: &str,
        outputs: &[&str],
        template: Option<Template>,
        schema: Option<Arc<dyn Scope>>,
        script: StageScript,
        fail_start: bool,
    ) {
        let stage_node = stage_node_id(id, "exec");
        self.dag
            .add_node(
                stage_node.clone(),
                DagItem::step_stage(id, "exec", template, schema),
            )
            .unwrap();
        self.dag.connect(INPUT_NODE_ID, &stage_node).unwrap();
        for output_id in outputs {
            let output_node = stage_output_node_id(id, "exec", output_id);
            self.dag
                .add_node(
                    output_node.clone(),
                    DagItem::stage_output(id, "exec", *output_id),
                )
                .unwrap();
            self.dag.connect(&stage_node, &output_node).unwrap();
        }
        self.lifecycles
            .insert(id.to_string(), Lifecycle::new(["exec"]));
        self.steps.insert(
            id.to_string(),
            Arc::new(ScriptedStep {
                label: id.to_string(),
                stage: "exec".to_string(),
                script,
                journal: self.journal.clone(),
                fail_start,
            }),
        );
    }
}
