//! Team coordination: a leader policy plus member steps, driven in one of
//! four modes.
//!
//! A team is itself a [`StepExecutor`], so it can sit in a workflow graph or
//! be a member of another team. Every member invocation gets its own path
//! segment (`m:<key>`), so requirements raised arbitrarily deep carry a
//! member chain and are routed back to the right member on resume.

pub mod leader;
pub mod tasks;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::requirement::Requirement;
use ensemble_core::run::{PathSegment, StepOutput};
use ensemble_core::types::{RunEvent, RunId};

use crate::resolver::{CachedResolver, ResolveContext, Resolver};
use crate::step::{ResumeData, StepContext, StepExecutor, StepInput, StepOutcome};

pub use leader::{
    CapabilityLeader, InferenceLeader, MemberProfile, MemberResult, MemberTask, TaskSpec,
    TeamLeader,
};

/// How a team distributes work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamMode {
    /// Leader picks members, crafts their tasks, then synthesizes the results.
    #[default]
    Coordinate,
    /// Leader picks exactly one member whose result is returned as is.
    Route,
    /// Every member gets the same input; results are labeled.
    Broadcast,
    /// Leader decomposes the input into dependent tasks.
    Tasks,
}

/// A member: its routing profile plus the step that does the work.
#[derive(Clone)]
pub struct TeamMember {
    pub profile: MemberProfile,
    pub executor: Arc<dyn StepExecutor>,
}

impl TeamMember {
    pub fn new(profile: MemberProfile, executor: impl StepExecutor) -> Self {
        Self::from_arc(profile, Arc::new(executor))
    }

    pub fn from_arc(profile: MemberProfile, executor: Arc<dyn StepExecutor>) -> Self {
        Self { profile, executor }
    }

    pub fn id(&self) -> &str {
        &self.profile.id
    }
}

/// One unit of member work: who, what, and under which path key.
#[derive(Debug, Clone)]
struct Assignment {
    /// Key of this unit in [`TeamState`] (member id, or task id in task mode).
    unit: String,
    /// Path segment key (`m:<key>`) the member runs under.
    key: String,
    member_id: String,
    task: String,
}

/// Team progress, persisted while members are suspended.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TeamState {
    #[serde(default)]
    plan: Option<Vec<MemberTask>>,
    #[serde(default)]
    tasks: Option<Vec<TaskSpec>>,
    /// Finished units.
    #[serde(default)]
    results: BTreeMap<String, StepOutput>,
    /// Resume states of suspended members, by path key.
    #[serde(default)]
    suspended: BTreeMap<String, Value>,
    /// Child run id of each member invocation, by path key.
    #[serde(default)]
    member_runs: BTreeMap<String, RunId>,
}

/// A team step.
pub struct Team {
    name: String,
    mode: TeamMode,
    leader: Arc<dyn TeamLeader>,
    members: Vec<TeamMember>,
    member_resolver: Option<Arc<CachedResolver<Vec<TeamMember>>>>,
    member_timeout: Option<Duration>,
}

impl Team {
    pub fn new(name: impl Into<String>, leader: impl TeamLeader) -> Self {
        Self {
            name: name.into(),
            mode: TeamMode::default(),
            leader: Arc::new(leader),
            members: Vec::new(),
            member_resolver: None,
            member_timeout: None,
        }
    }

    pub fn with_mode(mut self, mode: TeamMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_member(mut self, member: TeamMember) -> Self {
        self.members.push(member);
        self
    }

    /// Decide membership per run. Resolved members replace the static list.
    pub fn with_member_resolver(mut self, resolver: impl Resolver<Vec<TeamMember>>) -> Self {
        self.member_resolver = Some(Arc::new(CachedResolver::new(resolver)));
        self
    }

    /// Bound every member invocation. Elapsing is a member failure.
    pub fn with_member_timeout(mut self, timeout: Duration) -> Self {
        self.member_timeout = Some(timeout);
        self
    }

    pub fn mode(&self) -> TeamMode {
        self.mode
    }

    async fn members_for(&self, input: &StepInput, ctx: &StepContext) -> Result<Vec<TeamMember>> {
        let members = match &self.member_resolver {
            Some(resolver) => {
                resolver
                    .get(ResolveContext {
                        run_id: ctx.run_id.clone(),
                        session_id: ctx.session_id.clone(),
                        input: input.run_input.clone(),
                        session_state: input.session_state.clone(),
                    })
                    .await?
            }
            None => self.members.clone(),
        };
        if members.is_empty() {
            return Err(EnsembleError::Capability {
                capability: format!("team {}", self.name),
                message: "team has no members".into(),
            });
        }
        Ok(members)
    }

    async fn run(&self, input: StepInput, ctx: StepContext) -> Result<StepOutcome> {
        let members = self.members_for(&input, &ctx).await?;
        let mut state: TeamState = match &input.resume {
            Some(resume) => serde_json::from_value(resume.state.clone())?,
            None => TeamState::default(),
        };
        let message = input.message();

        match self.mode {
            TeamMode::Tasks => self.run_tasks(&members, &mut state, &message, &input, &ctx).await,
            mode => {
                let plan = self.plan(&members, &mut state, &message, mode).await?;
                let assignments: Vec<Assignment> = plan
                    .iter()
                    .map(|t| Assignment {
                        unit: t.member_id.clone(),
                        key: t.member_id.clone(),
                        member_id: t.member_id.clone(),
                        task: t.task.clone(),
                    })
                    .collect();

                let raised = self
                    .dispatch(&members, &assignments, &mut state, &input, &ctx)
                    .await?;
                if !raised.is_empty() {
                    return suspend(raised, &state);
                }
                let output = self.finish(mode, &assignments, &state, &message).await?;
                Ok(StepOutcome::Completed(output))
            }
        }
    }

    /// Load or compute the member plan for the three plan-based modes.
    async fn plan(
        &self,
        members: &[TeamMember],
        state: &mut TeamState,
        message: &str,
        mode: TeamMode,
    ) -> Result<Vec<MemberTask>> {
        if let Some(plan) = &state.plan {
            return Ok(plan.clone());
        }

        let mut plan: Vec<MemberTask> = match mode {
            TeamMode::Broadcast => members
                .iter()
                .map(|m| MemberTask {
                    member_id: m.id().to_string(),
                    task: message.to_string(),
                })
                .collect(),
            _ => {
                let profiles = members.iter().map(|m| m.profile.clone()).collect();
                self.leader.plan(message.to_string(), profiles, mode).await?
            }
        };

        let known: HashSet<&str> = members.iter().map(|m| m.id()).collect();
        let mut seen = HashSet::new();
        plan.retain(|t| {
            if !known.contains(t.member_id.as_str()) {
                warn!(team = %self.name, member = %t.member_id, "Leader picked an unknown member");
                return false;
            }
            seen.insert(t.member_id.clone())
        });
        if mode == TeamMode::Route {
            plan.truncate(1);
        }
        if plan.is_empty() {
            return Err(EnsembleError::Capability {
                capability: format!("team {}", self.name),
                message: "leader selected no members".into(),
            });
        }

        info!(
            team = %self.name,
            mode = ?mode,
            members = ?plan.iter().map(|t| t.member_id.as_str()).collect::<Vec<_>>(),
            "Team planned"
        );
        state.plan = Some(plan.clone());
        Ok(plan)
    }

    async fn run_tasks(
        &self,
        members: &[TeamMember],
        state: &mut TeamState,
        message: &str,
        input: &StepInput,
        ctx: &StepContext,
    ) -> Result<StepOutcome> {
        let specs = match &state.tasks {
            Some(specs) => specs.clone(),
            None => {
                let profiles = members.iter().map(|m| m.profile.clone()).collect();
                let specs = self.leader.decompose(message.to_string(), profiles).await?;
                let ids: Vec<&str> = members.iter().map(|m| m.id()).collect();
                tasks::validate_tasks(&specs, &ids)?;
                if specs.is_empty() {
                    return Err(EnsembleError::Capability {
                        capability: format!("team {}", self.name),
                        message: "leader produced no tasks".into(),
                    });
                }
                info!(team = %self.name, tasks = specs.len(), "Team decomposed input");
                state.tasks = Some(specs.clone());
                specs
            }
        };

        loop {
            let wave = tasks::next_wave(&specs, &state.results);
            if wave.is_empty() {
                break;
            }
            for (task, dep) in &wave.blocked {
                debug!(team = %self.name, task = %task.id, dependency = %dep, "Task blocked");
                state.results.insert(
                    task.id.clone(),
                    StepOutput::failure(format!("blocked: dependency '{}' failed", dep)),
                );
            }
            if wave.ready.is_empty() {
                continue;
            }

            let assignments: Vec<Assignment> = wave
                .ready
                .iter()
                .map(|t| Assignment {
                    unit: t.id.clone(),
                    key: format!("{}#{}", t.member_id, t.id),
                    member_id: t.member_id.clone(),
                    task: with_dependencies(t, &state.results),
                })
                .collect();
            let raised = self
                .dispatch(members, &assignments, state, input, ctx)
                .await?;
            if !raised.is_empty() {
                return suspend(raised, state);
            }
        }

        let results: Vec<MemberResult> = specs
            .iter()
            .filter_map(|t| {
                state.results.get(&t.id).map(|output| MemberResult {
                    member_id: t.member_id.clone(),
                    run_id: state
                        .member_runs
                        .get(&format!("{}#{}", t.member_id, t.id))
                        .cloned(),
                    task: t.task.clone(),
                    output: output.clone(),
                })
            })
            .collect();
        self.require_some_success(&results)?;
        let mut output = self.leader.synthesize(message.to_string(), results.clone()).await?;
        output.state_updates = merged_state(results.iter().map(|r| &r.output));
        Ok(StepOutcome::Completed(output))
    }

    /// Run the assignments that have no result yet, concurrently. Results land
    /// in `state`; requirements raised by suspended members are returned.
    async fn dispatch(
        &self,
        members: &[TeamMember],
        assignments: &[Assignment],
        state: &mut TeamState,
        input: &StepInput,
        ctx: &StepContext,
    ) -> Result<Vec<Requirement>> {
        let pending: Vec<&Assignment> = assignments
            .iter()
            .filter(|a| !state.results.contains_key(&a.unit))
            .collect();

        let mut invocations = Vec::with_capacity(pending.len());
        for assignment in &pending {
            let member = members
                .iter()
                .find(|m| m.id() == assignment.member_id)
                .ok_or_else(|| {
                    EnsembleError::Validation(format!(
                        "team '{}' has no member '{}'",
                        self.name, assignment.member_id
                    ))
                })?;
            let resume = state.suspended.get(&assignment.key).map(|s| ResumeData {
                state: s.clone(),
                resolved: routed_to(input.resume.as_ref(), &assignment.key),
            });
            let member_run = state
                .member_runs
                .entry(assignment.key.clone())
                .or_insert_with(RunId::new)
                .clone();
            invocations.push(self.invoke_member(member, assignment, member_run, input, ctx, resume));
        }
        let outcomes = futures::future::join_all(invocations).await;

        let mut raised = Vec::new();
        let mut cancelled = false;
        for (assignment, outcome) in pending.into_iter().zip(outcomes) {
            match outcome {
                Ok(StepOutcome::Completed(output)) => {
                    state.suspended.remove(&assignment.key);
                    state.results.insert(assignment.unit.clone(), output);
                }
                Ok(StepOutcome::Suspended {
                    requirements,
                    state: member_state,
                }) => {
                    state.suspended.insert(assignment.key.clone(), member_state);
                    raised.extend(requirements.into_iter().map(|mut r| {
                        r.target.member_path.insert(0, assignment.key.clone());
                        r
                    }));
                }
                Err(EnsembleError::Cancelled) => cancelled = true,
                Err(e) => {
                    warn!(
                        team = %self.name,
                        member = %assignment.member_id,
                        error = %e,
                        "Member failed"
                    );
                    state.suspended.remove(&assignment.key);
                    state
                        .results
                        .insert(assignment.unit.clone(), StepOutput::failure(e.to_string()));
                }
            }
        }
        if cancelled {
            return Err(EnsembleError::Cancelled);
        }
        Ok(raised)
    }

    async fn invoke_member(
        &self,
        member: &TeamMember,
        assignment: &Assignment,
        member_run: RunId,
        input: &StepInput,
        ctx: &StepContext,
        resume: Option<ResumeData>,
    ) -> Result<StepOutcome> {
        let member_input = StepInput {
            run_input: Value::String(assignment.task.clone()),
            previous: None,
            outputs: input.outputs.clone(),
            session_state: input.session_state.clone(),
            resume,
        };
        let member_ctx = StepContext {
            path: ctx.path.child(PathSegment::Member(assignment.key.clone())),
            step_name: assignment.member_id.clone(),
            ..ctx.clone()
        };

        ctx.events.emit(RunEvent::MemberStarted {
            run_id: ctx.run_id.clone(),
            member: assignment.key.clone(),
            member_run_id: member_run,
        });

        let fut = member.executor.execute(member_input, member_ctx);
        let outcome = match self.member_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(outcome) => outcome,
                Err(_) => Err(EnsembleError::Timeout {
                    what: format!("member {}", assignment.member_id),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => fut.await,
        };

        let success = match &outcome {
            Ok(StepOutcome::Completed(output)) => Some(output.success),
            Ok(StepOutcome::Suspended { .. }) => None,
            Err(_) => Some(false),
        };
        if let Some(success) = success {
            ctx.events.emit(RunEvent::MemberCompleted {
                run_id: ctx.run_id.clone(),
                member: assignment.key.clone(),
                success,
            });
        }
        outcome
    }

    /// Assemble the team output once every planned member finished.
    async fn finish(
        &self,
        mode: TeamMode,
        assignments: &[Assignment],
        state: &TeamState,
        message: &str,
    ) -> Result<StepOutput> {
        let results: Vec<MemberResult> = assignments
            .iter()
            .filter_map(|a| {
                state.results.get(&a.unit).map(|output| MemberResult {
                    member_id: a.member_id.clone(),
                    run_id: state.member_runs.get(&a.key).cloned(),
                    task: a.task.clone(),
                    output: output.clone(),
                })
            })
            .collect();

        match mode {
            TeamMode::Route => results
                .into_iter()
                .next()
                .map(|r| r.output)
                .ok_or_else(|| EnsembleError::Capability {
                    capability: format!("team {}", self.name),
                    message: "routed member produced no result".into(),
                }),
            TeamMode::Broadcast => {
                self.require_some_success(&results)?;
                let labeled: Vec<Value> = results
                    .iter()
                    .map(|r| {
                        serde_json::json!({
                            "member": r.member_id,
                            "run_id": r.run_id,
                            "content": r.output.content,
                            "success": r.output.success,
                        })
                    })
                    .collect();
                let mut output = StepOutput::success(Value::Array(labeled));
                output.state_updates = merged_state(results.iter().map(|r| &r.output));
                Ok(output)
            }
            TeamMode::Coordinate | TeamMode::Tasks => {
                self.require_some_success(&results)?;
                let state_updates = merged_state(results.iter().map(|r| &r.output));
                let mut output = self.leader.synthesize(message.to_string(), results).await?;
                output.state_updates = state_updates;
                Ok(output)
            }
        }
    }

    /// Member failures are partial results unless every member failed.
    fn require_some_success(&self, results: &[MemberResult]) -> Result<()> {
        if results.iter().any(|r| r.output.success) {
            return Ok(());
        }
        let errors: Vec<String> = results
            .iter()
            .map(|r| {
                format!(
                    "{}: {}",
                    r.member_id,
                    r.output.error.as_deref().unwrap_or("failed")
                )
            })
            .collect();
        Err(EnsembleError::Capability {
            capability: format!("team {}", self.name),
            message: format!("every member failed ({})", errors.join("; ")),
        })
    }
}

/// Resolved requirements addressed to the member at `key`, with that key
/// stripped from their member chain.
fn routed_to(resume: Option<&ResumeData>, key: &str) -> Vec<Requirement> {
    let Some(resume) = resume else {
        return Vec::new();
    };
    resume
        .resolved
        .iter()
        .filter(|r| r.target.member_path.first().is_some_and(|k| k == key))
        .map(|r| {
            let mut r = r.clone();
            r.target.member_path.remove(0);
            r
        })
        .collect()
}

/// The task text plus the outputs of the tasks it depends on.
fn with_dependencies(task: &TaskSpec, done: &BTreeMap<String, StepOutput>) -> String {
    if task.depends_on.is_empty() {
        return task.task.clone();
    }
    let context = task
        .depends_on
        .iter()
        .filter_map(|d| done.get(d).map(|o| format!("[{}] {}", d, o.content_text())))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{}\n\nResults so far:\n{}", task.task, context)
}

/// Session-state writes of member outputs, later members winning.
fn merged_state<'a>(outputs: impl Iterator<Item = &'a StepOutput>) -> Map<String, Value> {
    let mut merged = Map::new();
    for output in outputs {
        for (key, value) in &output.state_updates {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn suspend(requirements: Vec<Requirement>, state: &TeamState) -> Result<StepOutcome> {
    Ok(StepOutcome::Suspended {
        requirements,
        state: serde_json::to_value(state)?,
    })
}

impl StepExecutor for Team {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, input: StepInput, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(self.run(input, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ensemble_core::event::EventBus;
    use ensemble_core::requirement::{RequirementKind, Resolution};
    use ensemble_core::run::StepPath;
    use ensemble_core::types::SessionId;
    use ensemble_test_utils::{answer, call, EchoInference, MockTool, ScriptedInference};
    use tokio_util::sync::CancellationToken;

    use crate::agent::Agent;
    use crate::step::{EventSink, FnStep};

    fn ctx() -> StepContext {
        StepContext {
            run_id: RunId::new(),
            session_id: SessionId::from_str("s1"),
            path: StepPath::root(),
            step_name: "team".into(),
            cancel: CancellationToken::new(),
            events: EventSink::new(Arc::new(EventBus::default())),
        }
    }

    fn echo_member(id: &str, specs: &[&str]) -> TeamMember {
        TeamMember::new(
            MemberProfile::new(id, format!("{} member", id)).with_specializations(specs),
            Agent::new(id, Arc::new(EchoInference::new(format!("{}:", id)))),
        )
    }

    fn failing_member(id: &str) -> TeamMember {
        TeamMember::new(
            MemberProfile::new(id, "always fails"),
            FnStep::from_output(id, |_| StepOutput::failure("down")),
        )
    }

    fn completed(outcome: StepOutcome) -> StepOutput {
        match outcome {
            StepOutcome::Completed(out) => out,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_preserves_declaration_order() {
        let slow = TeamMember::new(
            MemberProfile::new("slow", "slow"),
            FnStep::new("slow", |_input, _ctx| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(StepOutcome::Completed(StepOutput::success("late")))
            }),
        );
        let team = Team::new("panel", CapabilityLeader)
            .with_mode(TeamMode::Broadcast)
            .with_member(slow)
            .with_member(echo_member("fast", &[]));

        let out = completed(team.execute(StepInput::new("hi".into()), ctx()).await.unwrap());
        let labeled = out.content.as_array().unwrap();
        assert_eq!(labeled[0]["member"], "slow");
        assert_eq!(labeled[1]["member"], "fast");
        assert_eq!(labeled[1]["content"], "fast:hi");
    }

    #[tokio::test]
    async fn route_returns_single_member_output() {
        let team = Team::new("desk", CapabilityLeader)
            .with_mode(TeamMode::Route)
            .with_member(echo_member("coder", &["rust"]))
            .with_member(echo_member("writer", &["docs"]));
        let out = completed(
            team.execute(StepInput::new("write docs".into()), ctx())
                .await
                .unwrap(),
        );
        assert_eq!(out.content, Value::from("writer:write docs"));
    }

    #[tokio::test]
    async fn coordinate_synthesizes_and_tolerates_partial_failure() {
        let team = Team::new("crew", CapabilityLeader)
            .with_member(echo_member("coder", &["code"]))
            .with_member(failing_member("flaky"));
        assert_eq!(team.mode(), TeamMode::Coordinate);

        // `code` matches only the coder; the flaky member is never planned.
        let out = completed(team.execute(StepInput::new("code it".into()), ctx()).await.unwrap());
        assert_eq!(out.content, Value::from("[coder] coder:code it"));
    }

    #[tokio::test]
    async fn every_member_failing_is_an_error() {
        let team = Team::new("doomed", CapabilityLeader)
            .with_mode(TeamMode::Broadcast)
            .with_member(failing_member("a"))
            .with_member(failing_member("b"));
        let err = team
            .execute(StepInput::new("x".into()), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Capability { .. }));
    }

    #[tokio::test]
    async fn tasks_mode_blocks_dependents_of_failed_tasks() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let worker = TeamMember::new(
            MemberProfile::new("worker", "does tasks"),
            FnStep::from_output("worker", move |input| {
                counter.fetch_add(1, Ordering::SeqCst);
                if input.message().starts_with("break") {
                    StepOutput::failure("broken")
                } else {
                    StepOutput::success(format!("done {}", input.message()))
                }
            }),
        );
        let plan = serde_json::json!([
            {"id": "a", "member_id": "worker", "task": "break things"},
            {"id": "b", "member_id": "worker", "task": "after a", "depends_on": ["a"]},
            {"id": "c", "member_id": "worker", "task": "independent"}
        ]);
        let leader = InferenceLeader::new(Arc::new(ScriptedInference::new(vec![
            answer(plan.to_string()),
            answer("summary"),
        ])));
        let team = Team::new("pipeline", leader)
            .with_mode(TeamMode::Tasks)
            .with_member(worker);

        let out = completed(team.execute(StepInput::new("go".into()), ctx()).await.unwrap());
        assert_eq!(out.content, Value::from("summary"));
        // `b` never ran.
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn member_requirement_carries_member_path_and_resumes() {
        let inference = Arc::new(ScriptedInference::new(vec![
            call("publish", serde_json::json!({})),
            answer("published"),
        ]));
        let tool = MockTool::new("publish", "ok").requiring_confirmation();
        let publisher = TeamMember::new(
            MemberProfile::new("publisher", "publishes"),
            Agent::new("publisher", inference).with_tool(tool),
        );
        let team = Team::new("newsroom", CapabilityLeader)
            .with_mode(TeamMode::Route)
            .with_member(publisher);
        let ctx = ctx();

        let (reqs, state) = match team.execute(StepInput::new("post".into()), ctx.clone()).await.unwrap() {
            StepOutcome::Suspended { requirements, state } => (requirements, state),
            other => panic!("expected suspension, got {other:?}"),
        };
        assert_eq!(reqs[0].kind, RequirementKind::Confirmation);
        assert_eq!(reqs[0].target.member_path, vec!["publisher".to_string()]);

        let mut resolved = reqs[0].clone();
        resolved.apply(Resolution::Confirm).unwrap();
        let mut input = StepInput::new("post".into());
        input.resume = Some(ResumeData {
            state,
            resolved: vec![resolved],
        });
        let out = completed(team.execute(input, ctx).await.unwrap());
        assert_eq!(out.content, Value::from("published"));
    }

    #[tokio::test]
    async fn member_keeps_its_child_run_id_across_resume() {
        let inference = Arc::new(ScriptedInference::new(vec![
            call("publish", serde_json::json!({})),
            answer("published"),
        ]));
        let publisher = TeamMember::new(
            MemberProfile::new("publisher", "publishes"),
            Agent::new("publisher", inference)
                .with_tool(MockTool::new("publish", "ok").requiring_confirmation()),
        );
        let team = Team::new("desk", CapabilityLeader)
            .with_mode(TeamMode::Broadcast)
            .with_member(publisher);
        let ctx = ctx();

        let (reqs, state) = match team.execute(StepInput::new("post".into()), ctx.clone()).await.unwrap() {
            StepOutcome::Suspended { requirements, state } => (requirements, state),
            other => panic!("expected suspension, got {other:?}"),
        };
        let child = state["member_runs"]["publisher"].as_str().unwrap().to_string();
        assert_ne!(child, ctx.run_id.0);

        let mut resolved = reqs[0].clone();
        resolved.apply(Resolution::Confirm).unwrap();
        let mut input = StepInput::new("post".into());
        input.resume = Some(ResumeData {
            state,
            resolved: vec![resolved],
        });
        let out = completed(team.execute(input, ctx).await.unwrap());
        assert_eq!(out.content[0]["run_id"], Value::from(child));
        assert_eq!(out.content[0]["content"], "published");
    }

    #[tokio::test]
    async fn member_resolver_is_cached_per_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let team = Team::new("dynamic", CapabilityLeader)
            .with_mode(TeamMode::Broadcast)
            .with_member_resolver(crate::resolver::FnResolver::new(move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(vec![echo_member("solo", &[])]) }
            }));
        let ctx = ctx();
        team.execute(StepInput::new("a".into()), ctx.clone()).await.unwrap();
        team.execute(StepInput::new("b".into()), ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn member_timeout_is_a_member_failure() {
        let sleeper = TeamMember::new(
            MemberProfile::new("sleeper", "slow"),
            FnStep::new("sleeper", |_input, _ctx| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(StepOutcome::Completed(StepOutput::success("late")))
            }),
        );
        let team = Team::new("bounded", CapabilityLeader)
            .with_mode(TeamMode::Broadcast)
            .with_member(sleeper)
            .with_member(echo_member("quick", &[]))
            .with_member_timeout(Duration::from_secs(1));
        let out = completed(team.execute(StepInput::new("x".into()), ctx()).await.unwrap());
        let labeled = out.content.as_array().unwrap();
        assert_eq!(labeled[0]["success"], false);
        assert_eq!(labeled[1]["success"], true);
    }
}
