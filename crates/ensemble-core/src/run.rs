use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result};
use crate::requirement::Requirement;
use crate::types::{RunId, SessionId};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Running,
    Paused,
    Completed,
    Errored,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }

    pub fn can_transition_to(&self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Created, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Errored)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run state: {}", other)),
        }
    }
}

/// One hop inside a nested step graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PathSegment {
    /// Index of a child in a Sequence, Parallel, Router selection or Loop body.
    Child(usize),
    /// Branch taken by a Condition (`then`/`else`) or a Router choice name.
    Branch(String),
    /// Loop iteration, counted from 1.
    Iteration(u32),
    /// Team member.
    Member(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Child(i) => write!(f, "{}", i),
            Self::Branch(b) => write!(f, "b:{}", b),
            Self::Iteration(n) => write!(f, "i:{}", n),
            Self::Member(m) => write!(f, "m:{}", m),
        }
    }
}

/// Locates a node inside a (possibly nested) step graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepPath(pub Vec<PathSegment>);

impl StepPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &StepPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Stable string key used for maps and storage.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StepPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
        write!(f, "/{}", parts.join("/"))
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub content: serde_json::Value,
    pub success: bool,
    /// The step succeeded but asks the enclosing graph not to continue.
    #[serde(default)]
    pub stop_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Session-state keys this step wants to set.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub state_updates: serde_json::Map<String, serde_json::Value>,
}

impl StepOutput {
    pub fn success(content: impl Into<serde_json::Value>) -> Self {
        Self {
            content: content.into(),
            success: true,
            stop_requested: false,
            error: None,
            state_updates: serde_json::Map::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            content: serde_json::Value::String(error.clone()),
            success: false,
            stop_requested: false,
            error: Some(error),
            state_updates: serde_json::Map::new(),
        }
    }

    /// Succeed and request that the enclosing graph stop here.
    pub fn stop(content: impl Into<serde_json::Value>) -> Self {
        Self {
            stop_requested: true,
            ..Self::success(content)
        }
    }

    pub fn with_state(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.state_updates.insert(key.into(), value);
        self
    }

    /// The content rendered as text (strings unquoted).
    pub fn content_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// A step output recorded in a run, addressed both by path and by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub path: StepPath,
    pub name: String,
    pub output: StepOutput,
}

/// One execution instance of an agent, team, or workflow.
///
/// Mutated only through [`Run::transition`] and the engine driving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub session_id: SessionId,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Name of the registered workflow this run executes.
    pub target: String,
    pub state: RunState,
    #[serde(default)]
    pub input: serde_json::Value,
    /// Suspension point of the first pending requirement.
    #[serde(default)]
    pub current_step_path: StepPath,
    /// Outputs in completion order.
    #[serde(default)]
    pub step_outputs: Vec<StepRecord>,
    #[serde(default)]
    pub pending_requirements: Vec<Requirement>,
    #[serde(default)]
    pub resolved_requirements: Vec<Requirement>,
    /// Recorded branch choices, router selections and loop counters, by path key.
    #[serde(default)]
    pub decisions: BTreeMap<String, serde_json::Value>,
    /// Opaque resume state of suspended steps, by path key.
    #[serde(default)]
    pub suspended: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub session_state: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub output: Option<StepOutput>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(target: impl Into<String>, input: serde_json::Value, session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            session_id,
            user_id: None,
            target: target.into(),
            state: RunState::Created,
            input,
            current_step_path: StepPath::root(),
            step_outputs: Vec::new(),
            pending_requirements: Vec::new(),
            resolved_requirements: Vec::new(),
            decisions: BTreeMap::new(),
            suspended: BTreeMap::new(),
            session_state: serde_json::Map::new(),
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, enforcing the transition table and the paused invariant.
    pub fn transition(&mut self, to: RunState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(self.invalid(to));
        }
        match to {
            RunState::Paused if self.pending_requirements.is_empty() => {
                return Err(self.invalid(to));
            }
            RunState::Running | RunState::Completed | RunState::Errored
                if !self.pending_requirements.is_empty() =>
            {
                return Err(self.invalid(to));
            }
            RunState::Cancelled => {
                // Abandoned requirements move to history so the paused invariant holds.
                let abandoned = std::mem::take(&mut self.pending_requirements);
                self.resolved_requirements.extend(abandoned);
                self.suspended.clear();
            }
            _ => {}
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn invalid(&self, to: RunState) -> EnsembleError {
        EnsembleError::InvalidTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }

    /// Latest output recorded under `name`.
    pub fn output_named(&self, name: &str) -> Option<&StepOutput> {
        self.step_outputs
            .iter()
            .rev()
            .find(|r| r.name == name)
            .map(|r| &r.output)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending_requirements.iter().map(|r| r.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirement::{RequirementKind, RequirementTarget};

    fn pending_req() -> Requirement {
        Requirement::new(
            RequirementKind::Confirmation,
            RequirementTarget::tool("rm", "c1", serde_json::json!({})),
        )
    }

    #[test]
    fn transition_table() {
        use RunState::*;
        assert!(Created.can_transition_to(Running));
        assert!(!Created.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Cancelled));
        for terminal in [Completed, Errored, Cancelled] {
            for to in [Created, Running, Paused, Completed, Errored, Cancelled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn paused_requires_pending_requirements() {
        let mut run = Run::new("wf", serde_json::json!("hi"), SessionId::new());
        run.transition(RunState::Running).unwrap();
        assert!(run.transition(RunState::Paused).is_err());

        run.pending_requirements.push(pending_req());
        run.transition(RunState::Paused).unwrap();
        // Cannot resume while anything is pending.
        assert!(run.transition(RunState::Running).is_err());
    }

    #[test]
    fn cancel_moves_pending_to_history() {
        let mut run = Run::new("wf", serde_json::Value::Null, SessionId::new());
        run.transition(RunState::Running).unwrap();
        run.pending_requirements.push(pending_req());
        run.transition(RunState::Paused).unwrap();
        run.transition(RunState::Cancelled).unwrap();
        assert!(run.pending_requirements.is_empty());
        assert_eq!(run.resolved_requirements.len(), 1);
        assert!(run.transition(RunState::Running).is_err());
    }

    #[test]
    fn path_display() {
        let path = StepPath::root()
            .child(PathSegment::Child(1))
            .child(PathSegment::Iteration(2))
            .child(PathSegment::Branch("then".into()))
            .child(PathSegment::Member("writer".into()));
        assert_eq!(path.key(), "/1/i:2/b:then/m:writer");
        assert!(path.starts_with(&StepPath::root().child(PathSegment::Child(1))));
        assert_eq!(StepPath::root().key(), "/");
    }

    #[test]
    fn output_named_returns_latest() {
        let mut run = Run::new("wf", serde_json::Value::Null, SessionId::new());
        for (i, text) in ["first", "second"].iter().enumerate() {
            run.step_outputs.push(StepRecord {
                path: StepPath::root().child(PathSegment::Child(i)),
                name: "draft".into(),
                output: StepOutput::success(*text),
            });
        }
        assert_eq!(run.output_named("draft").unwrap().content_text(), "second");
        assert!(run.output_named("missing").is_none());
    }
}
