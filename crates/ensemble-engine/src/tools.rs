use std::collections::HashMap;
use std::sync::Arc;

use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::traits::Tool;
use ensemble_core::types::{ToolContext, ToolDefinition, ToolOutcome};

/// Registry of tools an agent step may call.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Register an already shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for the inference collaborator, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name, bounded by its timeout and the run's cancellation.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolOutcome> {
        let tool = self.get(name).ok_or_else(|| EnsembleError::Capability {
            capability: name.to_string(),
            message: "unknown tool".into(),
        })?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());
        let cancel = ctx.cancel.clone();

        tokio::select! {
            _ = cancel.cancelled() => Err(EnsembleError::Cancelled),
            result = tokio::time::timeout(timeout, tool.execute(input, ctx)) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(EnsembleError::Timeout {
                    what: format!("tool {}", name),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::types::{RunId, SessionId, ToolResult};
    use futures::future::BoxFuture;
    use tokio_util::sync::CancellationToken;

    struct Slow;

    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "never finishes in time"
        }
        fn timeout_secs(&self) -> u64 {
            1
        }
        fn execute(
            &self,
            _input: serde_json::Value,
            _ctx: ToolContext,
        ) -> BoxFuture<'_, Result<ToolOutcome>> {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(ToolOutcome::Result(ToolResult::success("late")))
            })
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            run_id: RunId::new(),
            session_id: SessionId::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported() {
        let mut registry = ToolRegistry::new();
        registry.register(Slow);
        let err = registry
            .execute("slow", serde_json::Value::Null, ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Timeout { .. }));
        assert!(err.is_capability_failure());
    }

    #[tokio::test]
    async fn unknown_tool_is_capability_error() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("nope", serde_json::Value::Null, ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Capability { .. }));
    }

    #[tokio::test]
    async fn cancelled_before_completion() {
        let mut registry = ToolRegistry::new();
        registry.register(Slow);
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = registry
            .execute("slow", serde_json::Value::Null, ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Cancelled));
    }
}
