use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ensemble_core::config::EngineConfig;
use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::event::EventBus;
use ensemble_core::requirement::{Requirement, Resolution};
use ensemble_core::run::{Run, RunState};
use ensemble_core::traits::{InferenceClient, RunStore};
use ensemble_core::types::{RunEvent, RunId, SessionId};

use crate::agent::Agent;
use crate::graph::{Flow, GraphExecutor, Scope, WorkflowNode};
use crate::step::{EventSink, StepExecutor};
use crate::team::{Team, TeamLeader};

/// JSON type a schema field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldType,
    #[serde(default)]
    pub required: bool,
}

/// Shape a run input must have. Checked before a run is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    pub fields: Vec<FieldSpec>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn validate(&self, input: &Value) -> Result<()> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let empty = Map::new();
        let object = match input {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(EnsembleError::Validation(format!(
                    "input must be a JSON object, got {}",
                    json_type(other)
                )))
            }
        };
        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(EnsembleError::Validation(format!(
                        "missing required input field '{}'",
                        field.name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.kind.accepts(value) => {
                    return Err(EnsembleError::Validation(format!(
                        "input field '{}' must be {:?}, got {}",
                        field.name,
                        field.kind,
                        json_type(value)
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A named, immutable workflow graph runs can target.
pub struct Workflow {
    pub name: String,
    pub root: WorkflowNode,
    pub input_schema: Option<InputSchema>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, root: impl Into<WorkflowNode>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            input_schema: None,
        }
    }

    /// A workflow of one step, e.g. an agent or a team run directly.
    pub fn from_step(executor: impl StepExecutor) -> Self {
        let name = executor.name().to_string();
        Self::new(name, WorkflowNode::step(executor))
    }

    pub fn with_input_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EnsembleError::Validation("workflow name is empty".into()));
        }
        self.root.validate()
    }
}

type ActiveRuns = Arc<Mutex<HashMap<RunId, CancellationToken>>>;

/// Marks a run as being driven by this process. Removed on drop.
struct ActiveGuard {
    active: ActiveRuns,
    run_id: RunId,
    token: CancellationToken,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.run_id);
        }
    }
}

/// The run state machine.
///
/// Owns workflow registrations and drives runs from `Created` to `Paused` or
/// a terminal state, persisting a snapshot at every transition. A run is
/// driven by at most one task at a time.
pub struct Engine {
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    store: Arc<dyn RunStore>,
    events: Arc<EventBus>,
    active: ActiveRuns,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn RunStore>, config: EngineConfig) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity));
        Self {
            workflows: RwLock::new(HashMap::new()),
            store,
            events,
            active: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Share an existing event bus (e.g. with a scheduler or logger).
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// An agent step bounded by the configured turn limit.
    pub fn agent(&self, name: impl Into<String>, inference: Arc<dyn InferenceClient>) -> Agent {
        Agent::new(name, inference).with_max_turns(self.config.max_agent_turns)
    }

    /// A team step bounded by the configured member timeout.
    pub fn team(&self, name: impl Into<String>, leader: impl TeamLeader) -> Team {
        let team = Team::new(name, leader);
        match self.config.member_timeout_secs {
            0 => team,
            secs => team.with_member_timeout(Duration::from_secs(secs)),
        }
    }

    /// Register a workflow. Replaces any workflow of the same name.
    pub fn register(&self, workflow: Workflow) -> Result<()> {
        workflow.validate()?;
        let name = workflow.name.clone();
        self.workflows
            .write()
            .map_err(|e| EnsembleError::Config(format!("workflow registry poisoned: {}", e)))?
            .insert(name.clone(), Arc::new(workflow));
        info!(workflow = %name, "Workflow registered");
        Ok(())
    }

    /// Registered workflow names, sorted.
    pub fn workflows(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workflows
            .read()
            .map(|w| w.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn workflow(&self, name: &str) -> Result<Arc<Workflow>> {
        self.workflows
            .read()
            .map_err(|e| EnsembleError::Config(format!("workflow registry poisoned: {}", e)))?
            .get(name)
            .cloned()
            .ok_or_else(|| EnsembleError::Validation(format!("unknown workflow '{}'", name)))
    }

    fn begin(&self, run_id: &RunId) -> Result<ActiveGuard> {
        let mut active = self
            .active
            .lock()
            .map_err(|e| EnsembleError::Config(format!("active run table poisoned: {}", e)))?;
        if active.contains_key(run_id) {
            return Err(EnsembleError::NotPaused {
                run_id: run_id.to_string(),
                state: RunState::Running.to_string(),
            });
        }
        let token = CancellationToken::new();
        active.insert(run_id.clone(), token.clone());
        Ok(ActiveGuard {
            active: self.active.clone(),
            run_id: run_id.clone(),
            token,
        })
    }

    /// Start a run and drive it until it pauses or terminates.
    pub async fn start_run(
        &self,
        target: &str,
        input: Value,
        session_id: Option<SessionId>,
    ) -> Result<Run> {
        let sink = EventSink::new(self.events.clone());
        let (run, workflow, guard) = self.prepare_start(target, input, session_id, &sink).await?;
        self.drive(run, workflow, Vec::new(), guard, sink).await
    }

    /// Like [`Engine::start_run`], but returns the run's events as they occur.
    /// The stream ends after the pass's paused or terminal event.
    pub async fn start_run_stream(
        self: &Arc<Self>,
        target: &str,
        input: Value,
        session_id: Option<SessionId>,
    ) -> Result<BoxStream<'static, RunEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::with_tap(self.events.clone(), tx);
        let (run, workflow, guard) = self.prepare_start(target, input, session_id, &sink).await?;
        self.spawn_drive(run, workflow, Vec::new(), guard, sink);
        Ok(event_stream(rx))
    }

    /// Resume a paused run. Every pending requirement must be resolved, either
    /// by an entry in `resolutions` (keyed by requirement id) or earlier
    /// through [`Engine::confirm`] and friends.
    pub async fn continue_run(
        &self,
        run_id: &RunId,
        resolutions: HashMap<String, Resolution>,
    ) -> Result<Run> {
        let sink = EventSink::new(self.events.clone());
        let (run, workflow, resolved, guard) =
            self.prepare_continue(run_id, resolutions, &sink).await?;
        self.drive(run, workflow, resolved, guard, sink).await
    }

    pub async fn continue_run_stream(
        self: &Arc<Self>,
        run_id: &RunId,
        resolutions: HashMap<String, Resolution>,
    ) -> Result<BoxStream<'static, RunEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::with_tap(self.events.clone(), tx);
        let (run, workflow, resolved, guard) =
            self.prepare_continue(run_id, resolutions, &sink).await?;
        self.spawn_drive(run, workflow, resolved, guard, sink);
        Ok(event_stream(rx))
    }

    async fn prepare_start(
        &self,
        target: &str,
        input: Value,
        session_id: Option<SessionId>,
        sink: &EventSink,
    ) -> Result<(Run, Arc<Workflow>, ActiveGuard)> {
        let workflow = self.workflow(target)?;
        if let Some(schema) = &workflow.input_schema {
            schema.validate(&input)?;
        }

        let mut run = Run::new(target, input, session_id.unwrap_or_default());
        let guard = self.begin(&run.run_id)?;
        self.store.save_run(&run).await?;
        info!(run_id = %run.run_id, target, "Run started");
        sink.emit(RunEvent::RunStarted {
            run_id: run.run_id.clone(),
            session_id: run.session_id.clone(),
            target: target.to_string(),
        });

        run.transition(RunState::Running)?;
        self.store.save_run(&run).await?;
        Ok((run, workflow, guard))
    }

    async fn prepare_continue(
        &self,
        run_id: &RunId,
        resolutions: HashMap<String, Resolution>,
        sink: &EventSink,
    ) -> Result<(Run, Arc<Workflow>, Vec<Requirement>, ActiveGuard)> {
        let guard = self.begin(run_id)?;
        let stored = self.load(run_id).await?;
        if stored.state != RunState::Paused {
            return Err(EnsembleError::NotPaused {
                run_id: run_id.to_string(),
                state: stored.state.to_string(),
            });
        }
        let workflow = self.workflow(&stored.target)?;
        if !workflow.root.contains_path(&stored.current_step_path) {
            return Err(EnsembleError::Validation(format!(
                "suspension point {} no longer exists in workflow '{}'",
                stored.current_step_path, stored.target
            )));
        }

        // Work on a copy so a failed continue leaves the stored run untouched.
        let mut run = stored.clone();
        for (requirement_id, resolution) in resolutions {
            let requirement = run
                .pending_requirements
                .iter_mut()
                .find(|r| r.id == requirement_id)
                .ok_or_else(|| EnsembleError::RequirementNotFound(requirement_id.clone()))?;
            requirement.apply(resolution)?;
        }
        let missing: Vec<String> = run
            .pending_requirements
            .iter()
            .filter(|r| !r.is_resolved())
            .map(|r| r.id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(EnsembleError::IncompleteResolution {
                scope: run_id.to_string(),
                missing,
            });
        }

        let resolved = std::mem::take(&mut run.pending_requirements);
        for requirement in &resolved {
            sink.emit(RunEvent::RequirementResolved {
                run_id: run_id.clone(),
                requirement_id: requirement.id.clone(),
            });
        }
        run.resolved_requirements.extend(resolved.iter().cloned());
        run.transition(RunState::Running)?;
        self.store.save_run(&run).await?;

        info!(run_id = %run_id, resolved = resolved.len(), "Run continued");
        sink.emit(RunEvent::RunContinued {
            run_id: run_id.clone(),
            resolved: resolved.len(),
        });
        Ok((run, workflow, resolved, guard))
    }

    fn spawn_drive(
        self: &Arc<Self>,
        run: Run,
        workflow: Arc<Workflow>,
        resolved: Vec<Requirement>,
        guard: ActiveGuard,
        sink: EventSink,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            let run_id = run.run_id.clone();
            if let Err(e) = engine.drive(run, workflow, resolved, guard, sink).await {
                error!(run_id = %run_id, error = %e, "Streaming run failed to persist");
            }
        });
    }

    /// Execute one pass over the graph and settle the run's state.
    async fn drive(
        &self,
        mut run: Run,
        workflow: Arc<Workflow>,
        resolved: Vec<Requirement>,
        guard: ActiveGuard,
        sink: EventSink,
    ) -> Result<Run> {
        let executor = GraphExecutor {
            run_id: run.run_id.clone(),
            session_id: run.session_id.clone(),
            cancel: guard.token.clone(),
            events: sink.clone(),
            default_timeout: match self.config.default_step_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        };
        let mut scope = Scope::from_run(&run, resolved);
        let result = executor.execute(&workflow.root, &mut scope).await;
        scope.write_back(&mut run);

        let last = match result {
            Ok(Flow::Done(output)) => {
                let success = output.success;
                run.output = Some(output);
                run.transition(RunState::Completed)?;
                self.store.save_run(&run).await?;
                info!(run_id = %run.run_id, success, steps = run.step_outputs.len(), "Run completed");
                RunEvent::RunCompleted {
                    run_id: run.run_id.clone(),
                    success,
                }
            }
            Ok(Flow::Suspended(requirements)) => {
                if let Some(first) = requirements.first() {
                    run.current_step_path = first.target.step_path.clone();
                }
                run.pending_requirements = requirements;
                run.transition(RunState::Paused)?;
                self.store.save_run(&run).await?;
                for requirement in &run.pending_requirements {
                    debug!(
                        run_id = %run.run_id,
                        requirement_id = %requirement.id,
                        kind = %requirement.kind,
                        tool = %requirement.target.tool_name,
                        "Requirement raised"
                    );
                    sink.emit(RunEvent::RequirementRaised {
                        run_id: run.run_id.clone(),
                        requirement_id: requirement.id.clone(),
                        kind: requirement.kind,
                    });
                }
                info!(
                    run_id = %run.run_id,
                    pending = run.pending_requirements.len(),
                    path = %run.current_step_path,
                    "Run paused"
                );
                RunEvent::RunPaused {
                    run_id: run.run_id.clone(),
                    pending: run.pending_requirements.len(),
                }
            }
            Err(EnsembleError::Cancelled) => {
                run.transition(RunState::Cancelled)?;
                self.store.save_run(&run).await?;
                info!(run_id = %run.run_id, "Run cancelled");
                RunEvent::RunCancelled {
                    run_id: run.run_id.clone(),
                }
            }
            Err(e) => {
                run.error = Some(e.to_string());
                run.transition(RunState::Errored)?;
                self.store.save_run(&run).await?;
                warn!(run_id = %run.run_id, error = %e, "Run errored");
                RunEvent::RunErrored {
                    run_id: run.run_id.clone(),
                    error: e.to_string(),
                }
            }
        };

        // Listeners may continue or cancel the run as soon as they see this event.
        drop(guard);
        sink.emit(last);
        Ok(run)
    }

    async fn load(&self, run_id: &RunId) -> Result<Run> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EnsembleError::RunNotFound(run_id.to_string()))
    }

    /// Record a resolution on a paused run without continuing it.
    pub async fn resolve_requirement(
        &self,
        run_id: &RunId,
        requirement_id: &str,
        resolution: Resolution,
    ) -> Result<Requirement> {
        let guard = self.begin(run_id)?;
        let mut run = self.load(run_id).await?;
        if run.state != RunState::Paused {
            return Err(EnsembleError::NotPaused {
                run_id: run_id.to_string(),
                state: run.state.to_string(),
            });
        }
        let requirement = run
            .pending_requirements
            .iter_mut()
            .find(|r| r.id == requirement_id)
            .ok_or_else(|| EnsembleError::RequirementNotFound(requirement_id.to_string()))?;
        requirement.apply(resolution)?;
        let resolved = requirement.clone();
        self.store.save_run(&run).await?;
        // A cancel that arrived while the run was claimed here.
        if guard.token.is_cancelled() {
            self.cancel_in_place(run).await?;
            return Err(EnsembleError::Cancelled);
        }
        debug!(run_id = %run_id, requirement_id, status = ?resolved.status, "Requirement resolved");
        Ok(resolved)
    }

    pub async fn confirm(&self, run_id: &RunId, requirement_id: &str) -> Result<Requirement> {
        self.resolve_requirement(run_id, requirement_id, Resolution::Confirm)
            .await
    }

    pub async fn reject(
        &self,
        run_id: &RunId,
        requirement_id: &str,
        note: Option<String>,
    ) -> Result<Requirement> {
        self.resolve_requirement(run_id, requirement_id, Resolution::Reject { note })
            .await
    }

    pub async fn provide_user_input(
        &self,
        run_id: &RunId,
        requirement_id: &str,
        values: Map<String, Value>,
    ) -> Result<Requirement> {
        self.resolve_requirement(run_id, requirement_id, Resolution::UserInput { values })
            .await
    }

    pub async fn set_external_result(
        &self,
        run_id: &RunId,
        requirement_id: &str,
        result: Value,
    ) -> Result<Requirement> {
        self.resolve_requirement(run_id, requirement_id, Resolution::ExternalResult { result })
            .await
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Run> {
        self.load(run_id).await
    }

    /// Runs of a session, oldest first.
    pub async fn list_runs(&self, session_id: &SessionId) -> Result<Vec<Run>> {
        self.store.list_runs(session_id).await
    }

    /// Cancel a run. A run being driven stops at its next checkpoint; a paused
    /// run is cancelled in place. Terminal runs cannot be cancelled.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        // Either signal the pass driving the run, or claim the run so no
        // continue can start while it is being cancelled.
        let _guard = {
            let mut active = self
                .active
                .lock()
                .map_err(|e| EnsembleError::Config(format!("active run table poisoned: {}", e)))?;
            if let Some(token) = active.get(run_id) {
                info!(run_id = %run_id, "Cancelling active run");
                token.cancel();
                return Ok(());
            }
            let token = CancellationToken::new();
            active.insert(run_id.clone(), token.clone());
            ActiveGuard {
                active: self.active.clone(),
                run_id: run_id.clone(),
                token,
            }
        };

        let run = self.load(run_id).await?;
        self.cancel_in_place(run).await
    }

    async fn cancel_in_place(&self, mut run: Run) -> Result<()> {
        run.transition(RunState::Cancelled)?;
        self.store.save_run(&run).await?;
        info!(run_id = %run.run_id, "Run cancelled");
        self.events.publish(RunEvent::RunCancelled { run_id: run.run_id });
        Ok(())
    }
}

/// Turn a per-pass event tap into a stream that ends with the pass.
fn event_stream(rx: mpsc::UnboundedReceiver<RunEvent>) -> BoxStream<'static, RunEvent> {
    Box::pin(futures::stream::unfold(
        (rx, false),
        |(mut rx, finished)| async move {
            if finished {
                return None;
            }
            let event = rx.recv().await?;
            let finished = event.ends_pass();
            Some((event, (rx, finished)))
        },
    ))
}
