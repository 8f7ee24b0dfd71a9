use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::run::StepOutput;
use ensemble_core::traits::InferenceClient;
use ensemble_core::types::RunId;
use ensemble_core::types::{ChatMessage, InferenceRequest, InferenceResponse};

use super::TeamMode;

/// Describes a member's capabilities for routing decisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberProfile {
    /// Unique member identifier within the team.
    pub id: String,
    pub description: String,
    /// Domain specializations (e.g., "code", "research", "writing").
    #[serde(default)]
    pub specializations: Vec<String>,
    /// Tool names this member has access to.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl MemberProfile {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_specializations(mut self, specs: &[&str]) -> Self {
        self.specializations = specs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Score how well this member matches a task description.
    /// Higher score = better match.
    pub fn match_score(&self, task: &str, required_tools: &[String]) -> f64 {
        let mut score = 0.0;
        let task_lower = task.to_lowercase();

        for spec in &self.specializations {
            if task_lower.contains(&spec.to_lowercase()) {
                score += 10.0;
            }
        }

        if !required_tools.is_empty() {
            let matched_tools = required_tools
                .iter()
                .filter(|t| self.tools.contains(t))
                .count();
            if matched_tools == required_tools.len() {
                score += 20.0;
            } else {
                score += matched_tools as f64 * 5.0;
            }
        }

        score
    }
}

/// One member's assignment in a coordinate or route plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberTask {
    pub member_id: String,
    pub task: String,
}

/// One task of a decomposed plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub member_id: String,
    pub task: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A member's output, handed to the leader for synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberResult {
    pub member_id: String,
    /// Child run the member executed as.
    pub run_id: Option<RunId>,
    pub task: String,
    pub output: StepOutput,
}

/// Policy that plans, decomposes, and synthesizes for a team.
pub trait TeamLeader: Send + Sync + 'static {
    /// Pick members and craft a task for each. Route mode uses the first entry.
    fn plan(
        &self,
        input: String,
        members: Vec<MemberProfile>,
        mode: TeamMode,
    ) -> BoxFuture<'_, Result<Vec<MemberTask>>>;

    /// Break the input into tasks with dependencies, each assigned to a member.
    fn decompose(
        &self,
        input: String,
        members: Vec<MemberProfile>,
    ) -> BoxFuture<'_, Result<Vec<TaskSpec>>>;

    /// Merge member outputs into the team's result.
    fn synthesize(
        &self,
        input: String,
        results: Vec<MemberResult>,
    ) -> BoxFuture<'_, Result<StepOutput>>;
}

/// Leader backed by the inference collaborator. Plans are requested as JSON.
pub struct InferenceLeader {
    inference: Arc<dyn InferenceClient>,
    instructions: Option<String>,
}

impl InferenceLeader {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self {
            inference,
            instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    async fn ask(&self, prompt: String) -> Result<String> {
        let request = InferenceRequest {
            instructions: self.instructions.clone(),
            messages: vec![ChatMessage::user(prompt)],
            tools: Vec::new(),
        };
        match self.inference.infer(request).await? {
            InferenceResponse::Answer(text) => Ok(text),
            InferenceResponse::ToolCalls(_) => Err(EnsembleError::Inference(
                "team leader asked for tools; expected a plain answer".into(),
            )),
        }
    }
}

fn roster(members: &[MemberProfile]) -> String {
    members
        .iter()
        .map(|m| {
            if m.specializations.is_empty() {
                format!("- {}: {}", m.id, m.description)
            } else {
                format!(
                    "- {}: {} (skills: {})",
                    m.id,
                    m.description,
                    m.specializations.join(", ")
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse the first JSON array embedded in a model reply.
fn extract_json_array<T: DeserializeOwned>(text: &str) -> Result<Vec<T>> {
    let start = text.find('[');
    let end = text.rfind(']');
    match (start, end) {
        (Some(s), Some(e)) if s < e => serde_json::from_str(&text[s..=e])
            .map_err(|e| EnsembleError::Inference(format!("unparseable leader plan: {}", e))),
        _ => Err(EnsembleError::Inference(format!(
            "leader reply holds no JSON array: {}",
            text.chars().take(200).collect::<String>()
        ))),
    }
}

impl TeamLeader for InferenceLeader {
    fn plan(
        &self,
        input: String,
        members: Vec<MemberProfile>,
        mode: TeamMode,
    ) -> BoxFuture<'_, Result<Vec<MemberTask>>> {
        Box::pin(async move {
            let how_many = match mode {
                TeamMode::Route => "exactly one member",
                _ => "one or more members",
            };
            let prompt = format!(
                "You lead a team. Members:\n{}\n\nRequest:\n{}\n\n\
                 Pick {} and write each a task. Reply with a JSON array of \
                 objects {{\"member_id\": string, \"task\": string}}.",
                roster(&members),
                input,
                how_many
            );
            let reply = self.ask(prompt).await?;
            let plan: Vec<MemberTask> = extract_json_array(&reply)?;
            debug!(members = plan.len(), "Leader planned");
            Ok(plan)
        })
    }

    fn decompose(
        &self,
        input: String,
        members: Vec<MemberProfile>,
    ) -> BoxFuture<'_, Result<Vec<TaskSpec>>> {
        Box::pin(async move {
            let prompt = format!(
                "You lead a team. Members:\n{}\n\nRequest:\n{}\n\n\
                 Break the request into tasks. Reply with a JSON array of objects \
                 {{\"id\": string, \"member_id\": string, \"task\": string, \
                 \"depends_on\": [task ids]}}.",
                roster(&members),
                input
            );
            let reply = self.ask(prompt).await?;
            extract_json_array(&reply)
        })
    }

    fn synthesize(
        &self,
        input: String,
        results: Vec<MemberResult>,
    ) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let body = results
                .iter()
                .map(|r| {
                    let status = if r.output.success { "ok" } else { "failed" };
                    format!(
                        "## {} ({})\nTask: {}\n{}",
                        r.member_id,
                        status,
                        r.task,
                        r.output.content_text()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            let prompt = format!(
                "Request:\n{}\n\nMember results:\n{}\n\nWrite the final answer.",
                input, body
            );
            Ok(StepOutput::success(self.ask(prompt).await?))
        })
    }
}

/// Deterministic leader: routes by specialization and tool match, and
/// synthesizes by concatenation.
#[derive(Debug, Clone, Default)]
pub struct CapabilityLeader;

impl CapabilityLeader {
    fn best<'a>(task: &str, members: &'a [MemberProfile]) -> Option<&'a MemberProfile> {
        let mut best: Option<(&MemberProfile, f64)> = None;
        for member in members {
            let score = member.match_score(task, &[]);
            // Ties keep the earlier declaration.
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((member, score));
            }
        }
        best.map(|(m, _)| m)
    }
}

impl TeamLeader for CapabilityLeader {
    fn plan(
        &self,
        input: String,
        members: Vec<MemberProfile>,
        mode: TeamMode,
    ) -> BoxFuture<'_, Result<Vec<MemberTask>>> {
        Box::pin(async move {
            let chosen: Vec<&MemberProfile> = match mode {
                TeamMode::Route => Self::best(&input, &members).into_iter().collect(),
                _ => {
                    let matching: Vec<&MemberProfile> = members
                        .iter()
                        .filter(|m| m.match_score(&input, &[]) > 0.0)
                        .collect();
                    if matching.is_empty() {
                        Self::best(&input, &members).into_iter().collect()
                    } else {
                        matching
                    }
                }
            };
            Ok(chosen
                .into_iter()
                .map(|m| MemberTask {
                    member_id: m.id.clone(),
                    task: input.clone(),
                })
                .collect())
        })
    }

    fn decompose(
        &self,
        input: String,
        members: Vec<MemberProfile>,
    ) -> BoxFuture<'_, Result<Vec<TaskSpec>>> {
        Box::pin(async move {
            let mut tasks = Vec::new();
            for line in input.lines() {
                let task = line
                    .trim()
                    .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == '-' || c == '*')
                    .trim();
                if task.is_empty() {
                    continue;
                }
                let member = Self::best(task, &members).ok_or_else(|| EnsembleError::Capability {
                    capability: "team".into(),
                    message: "no members to assign tasks to".into(),
                })?;
                tasks.push(TaskSpec {
                    id: format!("t{}", tasks.len() + 1),
                    member_id: member.id.clone(),
                    task: task.to_string(),
                    depends_on: Vec::new(),
                });
            }
            Ok(tasks)
        })
    }

    fn synthesize(
        &self,
        _input: String,
        results: Vec<MemberResult>,
    ) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let success = results.iter().any(|r| r.output.success);
            let text = results
                .iter()
                .map(|r| format!("[{}] {}", r.member_id, r.output.content_text()))
                .collect::<Vec<_>>()
                .join("\n\n");
            Ok(if success {
                StepOutput::success(text)
            } else {
                StepOutput::failure(text)
            })
        })
    }
}
