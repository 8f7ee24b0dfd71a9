use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::requirement::{Requirement, RequirementKind, RequirementTarget, Resolution};
use ensemble_core::run::StepOutput;
use ensemble_core::traits::{InferenceClient, Tool};
use ensemble_core::types::{ChatMessage, InferenceRequest, InferenceResponse, ToolCall, ToolOutcome};

use crate::resolver::{CachedResolver, ResolveContext, Resolver};
use crate::step::{ResumeData, StepContext, StepExecutor, StepInput, StepOutcome};
use crate::tools::ToolRegistry;

/// Transcript of an agent step, persisted while the step is suspended.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Transcript {
    messages: Vec<ChatMessage>,
    turn: usize,
    /// Tool calls of the latest assistant turn, in request order.
    #[serde(default)]
    pending_calls: Vec<ToolCall>,
    /// Results already produced for `pending_calls`, by call id.
    #[serde(default)]
    results: BTreeMap<String, CallResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CallResult {
    content: String,
    is_error: bool,
}

impl CallResult {
    fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// What the gate decided for one tool call.
enum Gate {
    Run(Value),
    Answered(CallResult),
    Raise(Requirement),
}

/// A step that runs a ReAct loop against the inference collaborator.
///
/// Each tool call passes a human-in-the-loop gate first: tools that execute
/// out of process, need confirmation, or lack user-supplied arguments raise a
/// [`Requirement`] and the step suspends with its transcript. On resume the
/// resolutions are injected as the results of exactly those calls.
pub struct Agent {
    name: String,
    instructions: Option<String>,
    inference: Arc<dyn InferenceClient>,
    tools: ToolRegistry,
    tool_resolver: Option<Arc<CachedResolver<Vec<Arc<dyn Tool>>>>>,
    max_turns: usize,
}

impl Agent {
    pub fn new(name: impl Into<String>, inference: Arc<dyn InferenceClient>) -> Self {
        Self {
            name: name.into(),
            instructions: None,
            inference,
            tools: ToolRegistry::new(),
            tool_resolver: None,
            max_turns: 10,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Tool) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Tools decided per run, added to the static ones.
    pub fn with_tool_resolver(mut self, resolver: impl Resolver<Vec<Arc<dyn Tool>>>) -> Self {
        self.tool_resolver = Some(Arc::new(CachedResolver::new(resolver)));
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    async fn registry_for(&self, input: &StepInput, ctx: &StepContext) -> Result<ToolRegistry> {
        let Some(resolver) = &self.tool_resolver else {
            return Ok(self.tools.clone());
        };
        let resolved = resolver
            .get(ResolveContext {
                run_id: ctx.run_id.clone(),
                session_id: ctx.session_id.clone(),
                input: input.run_input.clone(),
                session_state: input.session_state.clone(),
            })
            .await?;
        let mut registry = self.tools.clone();
        for tool in resolved {
            registry.register_arc(tool);
        }
        Ok(registry)
    }

    async fn run(&self, input: StepInput, ctx: StepContext) -> Result<StepOutcome> {
        let registry = self.registry_for(&input, &ctx).await?;

        let mut transcript = match &input.resume {
            Some(resume) => serde_json::from_value(resume.state.clone())?,
            None => Transcript {
                messages: vec![ChatMessage::user(input.message())],
                ..Transcript::default()
            },
        };

        if !transcript.pending_calls.is_empty() {
            let raised = self
                .answer_calls(&mut transcript, &registry, input.resume.as_ref(), &ctx)
                .await?;
            if !raised.is_empty() {
                return suspend(raised, &transcript);
            }
        }

        while transcript.turn < self.max_turns {
            if ctx.cancel.is_cancelled() {
                return Err(EnsembleError::Cancelled);
            }
            debug!(agent = %self.name, turn = transcript.turn, "Starting agent turn");

            let request = InferenceRequest {
                instructions: self.instructions.clone(),
                messages: transcript.messages.clone(),
                tools: registry.definitions(),
            };
            let response = tokio::select! {
                result = self.inference.infer(request) => result?,
                _ = ctx.cancel.cancelled() => return Err(EnsembleError::Cancelled),
            };
            transcript.turn += 1;

            match response {
                InferenceResponse::Answer(text) => {
                    info!(agent = %self.name, turns = transcript.turn, "Agent answered");
                    return Ok(StepOutcome::Completed(StepOutput::success(text)));
                }
                InferenceResponse::ToolCalls(calls) => {
                    transcript
                        .messages
                        .push(ChatMessage::assistant_tool_calls(&calls));
                    transcript.pending_calls = calls;
                    transcript.results.clear();

                    let raised = self.answer_calls(&mut transcript, &registry, None, &ctx).await?;
                    if !raised.is_empty() {
                        return suspend(raised, &transcript);
                    }
                }
            }
        }

        warn!(agent = %self.name, max_turns = self.max_turns, "Agent exhausted its turns");
        Ok(StepOutcome::Completed(StepOutput::failure(format!(
            "agent '{}' gave no answer within {} turns",
            self.name, self.max_turns
        ))))
    }

    /// Produce a result for every pending call that can run now. Returns the
    /// requirements raised by the others. Once every call is answered the
    /// results are appended to the transcript in call order.
    async fn answer_calls(
        &self,
        transcript: &mut Transcript,
        registry: &ToolRegistry,
        resume: Option<&ResumeData>,
        ctx: &StepContext,
    ) -> Result<Vec<Requirement>> {
        let mut raised = Vec::new();

        for call in transcript.pending_calls.clone() {
            if transcript.results.contains_key(&call.id) {
                continue;
            }
            let resolved = resume.and_then(|r| r.resolution_for(&call.id));
            let arguments = match gate(&call, registry, resolved) {
                Gate::Answered(result) => {
                    transcript.results.insert(call.id.clone(), result);
                    continue;
                }
                Gate::Raise(requirement) => {
                    debug!(tool = %call.name, kind = %requirement.kind, "Tool call gated");
                    raised.push(requirement);
                    continue;
                }
                Gate::Run(arguments) => arguments,
            };

            match registry
                .execute(&call.name, arguments.clone(), ctx.tool_context())
                .await
            {
                Ok(ToolOutcome::Result(result)) => {
                    transcript.results.insert(
                        call.id.clone(),
                        CallResult {
                            content: result.content,
                            is_error: result.is_error,
                        },
                    );
                }
                Ok(ToolOutcome::Requirement { .. }) if resolved.is_some() => {
                    // Already resolved once for this call; do not ask again.
                    transcript.results.insert(
                        call.id.clone(),
                        CallResult::error(format!(
                            "tool '{}' raised a second requirement for one call",
                            call.name
                        )),
                    );
                }
                Ok(ToolOutcome::Requirement {
                    kind,
                    missing_fields,
                    note,
                }) => {
                    let mut requirement = Requirement::new(
                        kind,
                        RequirementTarget::tool(&call.name, &call.id, arguments),
                    )
                    .with_missing_fields(missing_fields);
                    requirement.note = note;
                    raised.push(requirement);
                }
                Err(EnsembleError::Cancelled) => return Err(EnsembleError::Cancelled),
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Tool call failed");
                    transcript
                        .results
                        .insert(call.id.clone(), CallResult::error(e.to_string()));
                }
            }
        }

        if raised.is_empty() {
            for call in std::mem::take(&mut transcript.pending_calls) {
                if let Some(result) = transcript.results.remove(&call.id) {
                    transcript.messages.push(ChatMessage::tool_result(
                        call.id,
                        result.content,
                        result.is_error,
                    ));
                }
            }
            transcript.results.clear();
        }
        Ok(raised)
    }
}

/// Decide what to do with one call, given its resolution if it had one.
fn gate(call: &ToolCall, registry: &ToolRegistry, resolved: Option<&Requirement>) -> Gate {
    let target = || RequirementTarget::tool(&call.name, &call.id, call.arguments.clone());

    if let Some(requirement) = resolved {
        return match &requirement.resolution {
            // Approval does not supply missing fields; ask for them next.
            Some(Resolution::Confirm) => match missing_input(call, registry) {
                Some(requirement) => Gate::Raise(requirement),
                None => Gate::Run(call.arguments.clone()),
            },
            Some(Resolution::Reject { .. }) => Gate::Answered(CallResult::error(
                requirement.rejection_message().unwrap_or_default(),
            )),
            Some(Resolution::UserInput { values }) => {
                let mut arguments = match &call.arguments {
                    Value::Object(map) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                for (key, value) in values {
                    arguments.insert(key.clone(), value.clone());
                }
                Gate::Run(Value::Object(arguments))
            }
            Some(Resolution::ExternalResult { result }) => Gate::Answered(CallResult::ok(
                match result {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
            )),
            None => Gate::Raise(requirement.clone()),
        };
    }

    let Some(tool) = registry.get(&call.name) else {
        return Gate::Answered(CallResult::error(format!("unknown tool '{}'", call.name)));
    };
    if tool.external_execution() {
        return Gate::Raise(Requirement::new(RequirementKind::ExternalExecution, target()));
    }
    if tool.requires_confirmation() {
        return Gate::Raise(Requirement::new(RequirementKind::Confirmation, target()));
    }
    match missing_input(call, registry) {
        Some(requirement) => Gate::Raise(requirement),
        None => Gate::Run(call.arguments.clone()),
    }
}

/// A `UserInput` requirement if the call leaves any of the tool's declared
/// user input fields absent or null.
fn missing_input(call: &ToolCall, registry: &ToolRegistry) -> Option<Requirement> {
    let tool = registry.get(&call.name)?;
    let missing: Vec<String> = tool
        .user_input_fields()
        .into_iter()
        .filter(|f| call.arguments.get(f).map_or(true, Value::is_null))
        .collect();
    if missing.is_empty() {
        return None;
    }
    Some(
        Requirement::new(
            RequirementKind::UserInput,
            RequirementTarget::tool(&call.name, &call.id, call.arguments.clone()),
        )
        .with_missing_fields(missing),
    )
}

fn suspend(requirements: Vec<Requirement>, transcript: &Transcript) -> Result<StepOutcome> {
    Ok(StepOutcome::Suspended {
        requirements,
        state: serde_json::to_value(transcript)?,
    })
}

impl StepExecutor for Agent {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, input: StepInput, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(self.run(input, ctx))
    }
}
