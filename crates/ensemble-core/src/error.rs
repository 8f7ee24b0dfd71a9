use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnsembleError {
    // Caller errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} is not paused (state: {state})")]
    NotPaused { run_id: String, state: String },

    /// `scope` names the run or requirement whose resolution is incomplete.
    #[error("Incomplete resolution for {scope}: missing {}", missing.join(", "))]
    IncompleteResolution { scope: String, missing: Vec<String> },

    #[error("Requirement not found: {0}")]
    RequirementNotFound(String),

    #[error("Requirement {0} was already resolved differently")]
    AlreadyResolved(String),

    #[error("Resolution does not match requirement {requirement_id}: {message}")]
    InvalidResolution {
        requirement_id: String,
        message: String,
    },

    #[error("Invalid run transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Execution errors
    #[error("Capability failed: {capability}: {message}")]
    Capability { capability: String, message: String },

    #[error("Timed out after {timeout_ms}ms: {what}")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("Step failed: {step}: {message}")]
    StepFailed { step: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    // Scheduler errors
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("Scheduler lease expired for schedule {schedule_id}")]
    SchedulerLeaseExpired { schedule_id: String },

    #[error("Trigger failed: {0}")]
    Trigger(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EnsembleError {
    /// Whether this error is a recoverable capability failure (timeouts included).
    pub fn is_capability_failure(&self) -> bool {
        matches!(
            self,
            Self::Capability { .. } | Self::Timeout { .. } | Self::Inference(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EnsembleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_capability_failure() {
        let err = EnsembleError::Timeout {
            what: "step fetch".into(),
            timeout_ms: 500,
        };
        assert!(err.is_capability_failure());
        assert!(!EnsembleError::Cancelled.is_capability_failure());
    }

    #[test]
    fn incomplete_resolution_lists_missing() {
        let err = EnsembleError::IncompleteResolution {
            scope: "r1".into(),
            missing: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Incomplete resolution for r1: missing a, b");
    }
}
