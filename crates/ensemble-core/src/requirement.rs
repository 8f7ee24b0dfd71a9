//! Human-in-the-loop requirements.
//!
//! A `Requirement` is a blocking condition raised by a step that cannot finish
//! on its own: an action awaiting approval, a tool call missing user-supplied
//! fields, or an action the caller must perform out of process. Resolutions are
//! idempotent: applying the same resolution twice is a no-op, applying a
//! different one fails with `AlreadyResolved`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EnsembleError, Result};
use crate::run::StepPath;

/// Canonical tool result substituted when a confirmation is rejected.
pub const REJECTION_RESULT: &str = "Operation rejected by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    Confirmation,
    UserInput,
    ExternalExecution,
}

impl std::fmt::Display for RequirementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmation => write!(f, "confirmation"),
            Self::UserInput => write!(f, "user_input"),
            Self::ExternalExecution => write!(f, "external_execution"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementStatus {
    Pending,
    Confirmed,
    Rejected,
    Resolved,
}

/// Locates the unit of work that raised a requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementTarget {
    /// Path of the workflow step that raised it.
    pub step_path: StepPath,
    pub step_name: String,
    /// Member chain, outermost first, when raised inside a team.
    #[serde(default)]
    pub member_path: Vec<String>,
    pub tool_name: String,
    pub tool_call_id: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl RequirementTarget {
    pub fn tool(
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            step_path: StepPath::root(),
            step_name: String::new(),
            member_path: Vec::new(),
            tool_name: tool_name.into(),
            tool_call_id: tool_call_id.into(),
            arguments,
        }
    }
}

/// Data supplied by whoever resolves a requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resolution {
    Confirm,
    Reject {
        #[serde(default)]
        note: Option<String>,
    },
    UserInput {
        values: serde_json::Map<String, serde_json::Value>,
    },
    ExternalResult {
        result: serde_json::Value,
    },
}

impl Resolution {
    fn kind(&self) -> RequirementKind {
        match self {
            Self::Confirm | Self::Reject { .. } => RequirementKind::Confirmation,
            Self::UserInput { .. } => RequirementKind::UserInput,
            Self::ExternalResult { .. } => RequirementKind::ExternalExecution,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub kind: RequirementKind,
    pub target: RequirementTarget,
    pub status: RequirementStatus,
    /// Field names a `UserInput` resolution must cover.
    #[serde(default)]
    pub missing_fields: Vec<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Requirement {
    pub fn new(kind: RequirementKind, target: RequirementTarget) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            target,
            status: RequirementStatus::Pending,
            missing_fields: Vec::new(),
            note: None,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn with_missing_fields(mut self, fields: Vec<String>) -> Self {
        self.missing_fields = fields;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.status != RequirementStatus::Pending
    }

    /// Apply a resolution.
    ///
    /// `UserInput` values must cover every missing field or the requirement
    /// stays pending and `IncompleteResolution` is returned.
    pub fn apply(&mut self, resolution: Resolution) -> Result<()> {
        if let Some(existing) = &self.resolution {
            if *existing == resolution {
                return Ok(());
            }
            return Err(EnsembleError::AlreadyResolved(self.id.clone()));
        }

        if resolution.kind() != self.kind {
            return Err(EnsembleError::InvalidResolution {
                requirement_id: self.id.clone(),
                message: format!(
                    "expected a {} resolution, got {}",
                    self.kind,
                    resolution.kind()
                ),
            });
        }

        if let Resolution::UserInput { values } = &resolution {
            let missing: Vec<String> = self
                .missing_fields
                .iter()
                .filter(|f| values.get(f.as_str()).map_or(true, |v| v.is_null()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(EnsembleError::IncompleteResolution {
                    scope: self.id.clone(),
                    missing,
                });
            }
        }

        self.status = match &resolution {
            Resolution::Confirm => RequirementStatus::Confirmed,
            Resolution::Reject { .. } => RequirementStatus::Rejected,
            Resolution::UserInput { .. } | Resolution::ExternalResult { .. } => {
                RequirementStatus::Resolved
            }
        };
        self.resolution = Some(resolution);
        self.resolved_at = Some(Utc::now());
        Ok(())
    }

    /// The text handed back to a step when this confirmation was rejected.
    pub fn rejection_message(&self) -> Option<String> {
        match &self.resolution {
            Some(Resolution::Reject { note: Some(note) }) => {
                Some(format!("{}: {}", REJECTION_RESULT, note))
            }
            Some(Resolution::Reject { note: None }) => Some(REJECTION_RESULT.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_input_req() -> Requirement {
        Requirement::new(
            RequirementKind::UserInput,
            RequirementTarget::tool("send_email", "call-1", json!({"subject": "hi"})),
        )
        .with_missing_fields(vec!["to".into(), "body".into()])
    }

    #[test]
    fn confirm_sets_status() {
        let mut req = Requirement::new(
            RequirementKind::Confirmation,
            RequirementTarget::tool("delete", "c1", json!({})),
        );
        req.apply(Resolution::Confirm).unwrap();
        assert_eq!(req.status, RequirementStatus::Confirmed);
        assert!(req.resolved_at.is_some());
    }

    #[test]
    fn reapplying_same_resolution_is_noop() {
        let mut req = Requirement::new(
            RequirementKind::Confirmation,
            RequirementTarget::tool("delete", "c1", json!({})),
        );
        let reject = Resolution::Reject {
            note: Some("no".into()),
        };
        req.apply(reject.clone()).unwrap();
        req.apply(reject).unwrap();
        assert!(matches!(
            req.apply(Resolution::Confirm),
            Err(EnsembleError::AlreadyResolved(_))
        ));
        assert_eq!(
            req.rejection_message().as_deref(),
            Some("Operation rejected by user: no")
        );
    }

    #[test]
    fn user_input_must_cover_missing_fields() {
        let mut req = user_input_req();
        let mut values = serde_json::Map::new();
        values.insert("to".into(), json!("a@example.com"));

        let err = req
            .apply(Resolution::UserInput {
                values: values.clone(),
            })
            .unwrap_err();
        match err {
            EnsembleError::IncompleteResolution { missing, .. } => {
                assert_eq!(missing, vec!["body".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(req.status, RequirementStatus::Pending);

        values.insert("body".into(), json!("hello"));
        req.apply(Resolution::UserInput { values }).unwrap();
        assert_eq!(req.status, RequirementStatus::Resolved);
    }

    #[test]
    fn kind_mismatch_rejected() {
        let mut req = user_input_req();
        assert!(matches!(
            req.apply(Resolution::Confirm),
            Err(EnsembleError::InvalidResolution { .. })
        ));
    }
}
