use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::requirement::Requirement;
use ensemble_core::run::{PathSegment, StepOutput, StepPath, StepRecord};
use ensemble_core::types::{RunEvent, RunId, SessionId};

use super::node::{
    ConditionNode, LoopNode, ParallelNode, RouterNode, Selection, Step, WorkflowNode,
};
use super::scope::Scope;
use crate::step::{EventSink, ResumeData, StepContext, StepInput, StepOutcome};

/// Result of evaluating a node.
#[derive(Debug, Clone)]
pub enum Flow {
    Done(StepOutput),
    /// Requirements raised while evaluating the node. Completed siblings keep
    /// their recorded outputs.
    Suspended(Vec<Requirement>),
}

/// Persisted progress of a loop node, stored in the run's decisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LoopProgress {
    completed: u32,
    done: bool,
    #[serde(default)]
    last: Option<StepOutput>,
}

/// Walks a workflow tree for one drive pass.
///
/// Resume works by replay: every pass starts at the root, steps whose output
/// is already recorded at their path are skipped, and recorded decisions are
/// reused instead of re-evaluated. Only the suspended steps run again.
pub struct GraphExecutor {
    pub run_id: RunId,
    pub session_id: SessionId,
    pub cancel: CancellationToken,
    pub events: EventSink,
    pub default_timeout: Option<Duration>,
}

impl GraphExecutor {
    pub async fn execute(&self, root: &WorkflowNode, scope: &mut Scope) -> Result<Flow> {
        self.eval(root, StepPath::root(), scope, None).await
    }

    fn eval<'a>(
        &'a self,
        node: &'a WorkflowNode,
        path: StepPath,
        scope: &'a mut Scope,
        prev: Option<StepOutput>,
    ) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(async move {
            match node {
                WorkflowNode::Step(step) => self.run_step(step, path, scope, prev).await,
                WorkflowNode::Sequence(n) => {
                    let items = n
                        .children
                        .iter()
                        .enumerate()
                        .map(|(i, c)| (c, path.child(PathSegment::Child(i))))
                        .collect();
                    self.run_chain(items, n.continue_on_error, scope, prev).await
                }
                WorkflowNode::Parallel(n) => self.run_parallel(n, &path, scope, prev).await,
                WorkflowNode::Condition(n) => self.run_condition(n, &path, scope, prev).await,
                WorkflowNode::Router(n) => self.run_router(n, &path, scope, prev).await,
                WorkflowNode::Loop(n) => self.run_loop(n, &path, scope, prev).await,
            }
        })
    }

    /// Evaluate nodes strictly in order, threading each output into the next.
    async fn run_chain(
        &self,
        items: Vec<(&WorkflowNode, StepPath)>,
        continue_on_error: bool,
        scope: &mut Scope,
        prev: Option<StepOutput>,
    ) -> Result<Flow> {
        let mut prev = prev;
        let mut last: Option<StepOutput> = None;

        for (child, path) in items {
            match self.eval(child, path, scope, prev.clone()).await? {
                Flow::Suspended(requirements) => return Ok(Flow::Suspended(requirements)),
                Flow::Done(output) => {
                    let halt = output.stop_requested || (!output.success && !continue_on_error);
                    prev = Some(output.clone());
                    last = Some(output);
                    if halt {
                        break;
                    }
                }
            }
        }

        Ok(Flow::Done(
            last.or(prev)
                .unwrap_or_else(|| StepOutput::success(Value::Null)),
        ))
    }

    async fn run_step(
        &self,
        step: &Step,
        path: StepPath,
        scope: &mut Scope,
        prev: Option<StepOutput>,
    ) -> Result<Flow> {
        if let Some(done) = scope.recorded(&path) {
            debug!(step = %step.name, path = %path, "Replaying recorded output");
            return Ok(Flow::Done(done));
        }
        if self.cancel.is_cancelled() {
            return Err(EnsembleError::Cancelled);
        }

        let resume = scope.resume_state(&path).map(|state| ResumeData {
            state: state.clone(),
            resolved: scope.resolved_for(&path),
        });
        let input = StepInput {
            run_input: scope.input.clone(),
            previous: prev,
            outputs: scope.outputs.clone(),
            session_state: scope.session_state.clone(),
            resume,
        };
        let ctx = StepContext {
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            path: path.clone(),
            step_name: step.name.clone(),
            cancel: self.cancel.clone(),
            events: self.events.clone(),
        };

        self.events.emit(RunEvent::StepStarted {
            run_id: self.run_id.clone(),
            path: path.key(),
            name: step.name.clone(),
        });

        let timeout = step.timeout.or(self.default_timeout);
        let attempts = step.max_retries + 1;
        let mut attempt = 0;

        let output = loop {
            attempt += 1;
            match self.invoke(step, input.clone(), ctx.clone(), timeout).await {
                Ok(StepOutcome::Suspended {
                    requirements,
                    state,
                }) => {
                    if requirements.is_empty() {
                        return Err(EnsembleError::StepFailed {
                            step: step.name.clone(),
                            message: "suspended without raising a requirement".into(),
                        });
                    }
                    let requirements: Vec<Requirement> = requirements
                        .into_iter()
                        .map(|mut r| {
                            r.target.step_path = path.clone();
                            r.target.step_name = step.name.clone();
                            r
                        })
                        .collect();
                    debug!(
                        step = %step.name,
                        path = %path,
                        count = requirements.len(),
                        "Step suspended"
                    );
                    scope.suspended.insert(path.key(), state);
                    return Ok(Flow::Suspended(requirements));
                }
                Ok(StepOutcome::Completed(output)) if output.success || attempt >= attempts => {
                    break output
                }
                Ok(StepOutcome::Completed(output)) => {
                    warn!(
                        step = %step.name,
                        attempt,
                        error = output.error.as_deref().unwrap_or(""),
                        "Step failed, retrying"
                    );
                }
                Err(EnsembleError::Cancelled) => return Err(EnsembleError::Cancelled),
                Err(e) if attempt < attempts => {
                    warn!(step = %step.name, attempt, error = %e, "Step errored, retrying");
                }
                Err(e) if step.fail_fast => {
                    error!(step = %step.name, error = %e, "Fail-fast step errored");
                    return Err(EnsembleError::StepFailed {
                        step: step.name.clone(),
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(step = %step.name, error = %e, "Step errored, recording failure");
                    break StepOutput::failure(e.to_string());
                }
            }
        };

        self.events.emit(RunEvent::StepCompleted {
            run_id: self.run_id.clone(),
            path: path.key(),
            name: step.name.clone(),
            success: output.success,
        });
        scope.record(path, &step.name, output.clone());
        Ok(Flow::Done(output))
    }

    async fn invoke(
        &self,
        step: &Step,
        input: StepInput,
        ctx: StepContext,
        timeout: Option<Duration>,
    ) -> Result<StepOutcome> {
        let fut = step.executor.execute(input, ctx);
        let bounded = async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(EnsembleError::Timeout {
                        what: format!("step {}", step.name),
                        timeout_ms: limit.as_millis() as u64,
                    }),
                },
                None => fut.await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(EnsembleError::Cancelled),
            result = bounded => result,
        }
    }

    async fn run_parallel(
        &self,
        node: &ParallelNode,
        path: &StepPath,
        scope: &mut Scope,
        prev: Option<StepOutput>,
    ) -> Result<Flow> {
        let base = scope.outputs.len();
        let forks: Vec<Scope> = node.children.iter().map(|_| scope.fork()).collect();

        let branches = node
            .children
            .iter()
            .zip(forks)
            .enumerate()
            .map(|(i, (child, mut fork))| {
                let child_path = path.child(PathSegment::Child(i));
                let prev = prev.clone();
                async move {
                    let result = self.eval(child, child_path, &mut fork, prev).await;
                    (result, fork)
                }
            });
        // Every branch runs to completion before any error surfaces.
        let results = futures::future::join_all(branches).await;

        let mut first_error: Option<EnsembleError> = None;
        let mut requirements = Vec::new();
        let mut content = Map::new();
        let mut errors = Vec::new();
        let mut all_success = true;
        let mut stop_requested = false;

        for ((result, fork), child) in results.into_iter().zip(&node.children) {
            scope.merge(fork, base);
            match result {
                Ok(Flow::Done(output)) => {
                    all_success &= output.success;
                    stop_requested |= output.stop_requested;
                    if let Some(e) = &output.error {
                        errors.push(format!("{}: {}", child.name(), e));
                    }
                    content.insert(child.name().to_string(), output.content);
                }
                Ok(Flow::Suspended(raised)) => requirements.extend(raised),
                Err(e) => {
                    let replace = match &first_error {
                        None => true,
                        Some(existing) => {
                            matches!(e, EnsembleError::Cancelled)
                                && !matches!(existing, EnsembleError::Cancelled)
                        }
                    };
                    if replace {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if !requirements.is_empty() {
            return Ok(Flow::Suspended(requirements));
        }

        Ok(Flow::Done(StepOutput {
            content: Value::Object(content),
            success: all_success || node.continue_on_error,
            stop_requested,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            state_updates: Map::new(),
        }))
    }

    async fn run_condition(
        &self,
        node: &ConditionNode,
        path: &StepPath,
        scope: &mut Scope,
        prev: Option<StepOutput>,
    ) -> Result<Flow> {
        let key = path.key();
        let branch = match scope.decisions.get(&key).and_then(|v| v.as_str()) {
            Some(recorded) => recorded.to_string(),
            None => {
                let take_then = node
                    .predicate
                    .evaluate(&scope.bindings(prev.as_ref(), None, None))?;
                let branch = if take_then { "then" } else { "else" };
                debug!(condition = %node.name, branch, "Condition evaluated");
                scope.decisions.insert(key, Value::from(branch));
                branch.to_string()
            }
        };

        match (branch.as_str(), &node.otherwise) {
            ("then", _) => {
                let child = path.child(PathSegment::Branch("then".into()));
                self.eval(&node.then, child, scope, prev).await
            }
            (_, Some(otherwise)) => {
                let child = path.child(PathSegment::Branch("else".into()));
                self.eval(otherwise, child, scope, prev).await
            }
            (_, None) => Ok(Flow::Done(
                prev.unwrap_or_else(|| StepOutput::success(Value::Null)),
            )),
        }
    }

    async fn run_router(
        &self,
        node: &RouterNode,
        path: &StepPath,
        scope: &mut Scope,
        prev: Option<StepOutput>,
    ) -> Result<Flow> {
        let key = path.key();
        let indices: Vec<usize> = match scope.decisions.get(&key) {
            Some(recorded) => serde_json::from_value(recorded.clone())?,
            None => {
                let selection = node
                    .selector
                    .select(&scope.bindings(prev.as_ref(), None, None))?;
                let indices = resolve_selection(node, selection)?;
                debug!(router = %node.name, ?indices, "Router selected");
                scope
                    .decisions
                    .insert(key, serde_json::to_value(&indices)?);
                indices
            }
        };

        // Keyed by selection position too, so a choice selected twice runs twice.
        let mut items = Vec::with_capacity(indices.len());
        for (k, i) in indices.into_iter().enumerate() {
            let choice = node.choices.get(i).ok_or_else(|| {
                EnsembleError::Validation(format!("router '{}' has no choice #{}", node.name, i))
            })?;
            items.push((
                choice,
                path.child(PathSegment::Child(k))
                    .child(PathSegment::Branch(choice.name().to_string())),
            ));
        }
        self.run_chain(items, false, scope, prev).await
    }

    async fn run_loop(
        &self,
        node: &LoopNode,
        path: &StepPath,
        scope: &mut Scope,
        prev: Option<StepOutput>,
    ) -> Result<Flow> {
        let key = path.key();
        let mut progress: LoopProgress = match scope.decisions.get(&key) {
            Some(recorded) => serde_json::from_value(recorded.clone())?,
            None => LoopProgress::default(),
        };
        if progress.done {
            return Ok(Flow::Done(
                progress
                    .last
                    .unwrap_or_else(|| StepOutput::success(Value::Null)),
            ));
        }

        let mut prev = progress.last.clone().or(prev);
        loop {
            let iteration = progress.completed + 1;
            let pass_path = path.child(PathSegment::Iteration(iteration));

            if !scope.outputs.iter().any(|r| r.path.starts_with(&pass_path)) {
                self.events.emit(RunEvent::LoopIteration {
                    run_id: self.run_id.clone(),
                    path: path.key(),
                    iteration,
                });
            }

            let items = node
                .body
                .iter()
                .enumerate()
                .map(|(i, c)| (c, pass_path.child(PathSegment::Child(i))))
                .collect();

            match self
                .run_chain(items, node.continue_on_error, scope, prev.clone())
                .await?
            {
                Flow::Suspended(requirements) => {
                    // A suspended pass does not count as an iteration.
                    scope
                        .decisions
                        .insert(key, serde_json::to_value(&progress)?);
                    return Ok(Flow::Suspended(requirements));
                }
                Flow::Done(output) => {
                    progress.completed = iteration;
                    progress.last = Some(output.clone());

                    let halted =
                        output.stop_requested || (!output.success && !node.continue_on_error);
                    let finished = halted
                        || progress.completed >= node.max_iterations
                        || match &node.end_condition {
                            Some(predicate) => {
                                let pass: Vec<StepRecord> = scope
                                    .outputs
                                    .iter()
                                    .filter(|r| r.path.starts_with(&pass_path))
                                    .cloned()
                                    .collect();
                                predicate.evaluate(&scope.bindings(
                                    Some(&output),
                                    Some((progress.completed, node.max_iterations)),
                                    Some(pass.as_slice()),
                                ))?
                            }
                            None => false,
                        };

                    progress.done = finished;
                    scope
                        .decisions
                        .insert(key.clone(), serde_json::to_value(&progress)?);

                    if finished {
                        debug!(
                            loop_name = %node.name,
                            iterations = progress.completed,
                            "Loop finished"
                        );
                        return Ok(Flow::Done(output));
                    }
                    prev = Some(output);
                }
            }
        }
    }
}

/// Turn a selection into choice indices, in execution order.
fn resolve_selection(node: &RouterNode, selection: Selection) -> Result<Vec<usize>> {
    match selection {
        Selection::Name(name) => node
            .choices
            .iter()
            .position(|c| c.name() == name)
            .map(|i| vec![i])
            .ok_or_else(|| {
                EnsembleError::Validation(format!(
                    "router '{}' has no choice named '{}'",
                    node.name, name
                ))
            }),
        Selection::Index(i) if i < node.choices.len() => Ok(vec![i]),
        Selection::Index(i) => Err(EnsembleError::Validation(format!(
            "router '{}' has no choice #{}",
            node.name, i
        ))),
        Selection::Many(items) => {
            let mut indices = Vec::new();
            for item in items {
                indices.extend(resolve_selection(node, item)?);
            }
            Ok(indices)
        }
    }
}
