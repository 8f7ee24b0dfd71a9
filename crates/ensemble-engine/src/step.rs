use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use ensemble_core::error::Result;
use ensemble_core::event::EventBus;
use ensemble_core::requirement::Requirement;
use ensemble_core::run::{StepOutput, StepPath, StepRecord};
use ensemble_core::types::{RunEvent, RunId, SessionId, ToolContext};

/// State handed back to a step that suspended on a previous pass.
#[derive(Debug, Clone)]
pub struct ResumeData {
    /// Opaque state the step returned when it suspended.
    pub state: Value,
    /// Requirements raised by this step and resolved since.
    pub resolved: Vec<Requirement>,
}

impl ResumeData {
    /// The resolved requirement for a given tool call, if any.
    pub fn resolution_for(&self, tool_call_id: &str) -> Option<&Requirement> {
        self.resolved
            .iter()
            .find(|r| r.target.tool_call_id == tool_call_id)
    }
}

/// Everything a step may read.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub run_input: Value,
    /// Output of the step that ran immediately before in the enclosing scope.
    pub previous: Option<StepOutput>,
    /// Outputs recorded so far in this run, in completion order.
    pub outputs: Vec<StepRecord>,
    /// Copy of the session state taken when the step started.
    pub session_state: Map<String, Value>,
    pub resume: Option<ResumeData>,
}

impl StepInput {
    pub fn new(run_input: Value) -> Self {
        Self {
            run_input,
            previous: None,
            outputs: Vec::new(),
            session_state: Map::new(),
            resume: None,
        }
    }

    /// Latest output recorded under `name`.
    pub fn output(&self, name: &str) -> Option<&StepOutput> {
        self.outputs
            .iter()
            .rev()
            .find(|r| r.name == name)
            .map(|r| &r.output)
    }

    /// The text this step should work on: the previous output, else the run input.
    pub fn message(&self) -> String {
        match &self.previous {
            Some(prev) => prev.content_text(),
            None => match &self.run_input {
                Value::String(s) => s.clone(),
                Value::Object(map) => ["message", "task", "prompt"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
                    .map(str::to_string)
                    .unwrap_or_else(|| self.run_input.to_string()),
                Value::Null => String::new(),
                other => other.to_string(),
            },
        }
    }
}

/// Where run events go: the shared bus plus an optional per-stream tap.
#[derive(Clone)]
pub struct EventSink {
    bus: Arc<EventBus>,
    tap: Option<UnboundedSender<RunEvent>>,
}

impl EventSink {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus, tap: None }
    }

    pub fn with_tap(bus: Arc<EventBus>, tap: UnboundedSender<RunEvent>) -> Self {
        Self {
            bus,
            tap: Some(tap),
        }
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(tap) = &self.tap {
            // The stream consumer may have gone away.
            let _ = tap.send(event.clone());
        }
        self.bus.publish(event);
    }
}

/// Execution context of one step invocation.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub session_id: SessionId,
    /// Path of the workflow node (or team member) being executed.
    pub path: StepPath,
    pub step_name: String,
    pub cancel: CancellationToken,
    pub events: EventSink,
}

impl StepContext {
    pub fn tool_context(&self) -> ToolContext {
        ToolContext {
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// What one step invocation produced.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed(StepOutput),
    /// The step cannot finish without external input. `state` is handed back
    /// in [`ResumeData`] once the requirements are resolved.
    Suspended {
        requirements: Vec<Requirement>,
        state: Value,
    },
}

/// An atomic unit of work in a workflow graph.
pub trait StepExecutor: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn execute(&self, input: StepInput, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>>;
}

type StepFn = dyn Fn(StepInput, StepContext) -> BoxFuture<'static, Result<StepOutcome>> + Send + Sync;

/// A step backed by a closure.
pub struct FnStep {
    name: String,
    f: Arc<StepFn>,
}

impl FnStep {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInput, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(move |input, ctx| Box::pin(f(input, ctx))),
        }
    }

    /// A synchronous step that always completes.
    pub fn from_output<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&StepInput) -> StepOutput + Send + Sync + 'static,
    {
        Self::new(name, move |input, _ctx| {
            let output = f(&input);
            async move { Ok(StepOutcome::Completed(output)) }
        })
    }
}

impl StepExecutor for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, input: StepInput, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>> {
        (self.f)(input, ctx)
    }
}
