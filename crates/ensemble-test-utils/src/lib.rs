//! Test doubles shared by Ensemble crates: a scripted inference client, mock
//! tools with configurable HITL flags, recording run triggers, and temp-dir
//! fixtures.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use ensemble_core::config::AppConfig;
use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::requirement::RequirementKind;
use ensemble_core::traits::{InferenceClient, RunTrigger, Tool};
use ensemble_core::types::{
    InferenceRequest, InferenceResponse, Role, ToolCall, ToolContext, ToolOutcome, ToolResult,
};

/// A terminal answer.
pub fn answer(text: impl Into<String>) -> InferenceResponse {
    InferenceResponse::Answer(text.into())
}

/// A single tool call with a predictable id (`call-<name>`).
pub fn call(name: &str, arguments: Value) -> InferenceResponse {
    InferenceResponse::ToolCalls(vec![tool_call(name, arguments)])
}

pub fn tool_call(name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: format!("call-{}", name),
        name: name.to_string(),
        arguments,
    }
}

/// Inference client that replays a fixed script of responses.
#[derive(Default)]
pub struct ScriptedInference {
    script: Mutex<VecDeque<InferenceResponse>>,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl ScriptedInference {
    pub fn new(responses: Vec<InferenceResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Responses not consumed yet.
    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

impl InferenceClient for ScriptedInference {
    fn infer(&self, request: InferenceRequest) -> BoxFuture<'_, Result<InferenceResponse>> {
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            next.ok_or_else(|| EnsembleError::Inference("script exhausted".into()))
        })
    }
}

/// Inference client that answers with the latest user message, prefixed.
pub struct EchoInference {
    prefix: String,
}

impl EchoInference {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl InferenceClient for EchoInference {
    fn infer(&self, request: InferenceRequest) -> BoxFuture<'_, Result<InferenceResponse>> {
        let last = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_default();
        let reply = format!("{}{}", self.prefix, last);
        Box::pin(async move { Ok(InferenceResponse::Answer(reply)) })
    }
}

/// Inference client that always fails.
pub struct FailingInference;

impl InferenceClient for FailingInference {
    fn infer(&self, _request: InferenceRequest) -> BoxFuture<'_, Result<InferenceResponse>> {
        Box::pin(async { Err(EnsembleError::Inference("provider unavailable".into())) })
    }
}

/// A tool whose HITL behavior is configured per test.
pub struct MockTool {
    name: String,
    reply: Option<String>,
    confirm: bool,
    user_fields: Vec<String>,
    external: bool,
    dynamic: Option<(RequirementKind, Vec<String>)>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<Value>>>,
}

impl MockTool {
    /// A tool that answers with `reply`.
    pub fn new(name: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            ..Self::echo(name)
        }
    }

    /// A tool that answers with its arguments rendered as JSON.
    pub fn echo(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reply: None,
            confirm: false,
            user_fields: Vec::new(),
            external: false,
            dynamic: None,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requiring_confirmation(mut self) -> Self {
        self.confirm = true;
        self
    }

    pub fn with_user_input_fields(mut self, fields: &[&str]) -> Self {
        self.user_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    /// Return a requirement from `execute` instead of a result.
    pub fn raising(mut self, kind: RequirementKind, missing_fields: &[&str]) -> Self {
        self.dynamic = Some((kind, missing_fields.iter().map(|f| f.to_string()).collect()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared invocation counter.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Shared log of arguments the tool was executed with.
    pub fn inputs(&self) -> Arc<Mutex<Vec<Value>>> {
        self.inputs.clone()
    }
}

impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "mock tool"
    }

    fn execute(&self, input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutcome>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(input.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some((kind, missing)) = &self.dynamic {
                return Ok(ToolOutcome::Requirement {
                    kind: *kind,
                    missing_fields: missing.clone(),
                    note: None,
                });
            }
            let content = match &self.reply {
                Some(reply) => reply.clone(),
                None => input.to_string(),
            };
            Ok(ToolOutcome::Result(ToolResult::success(content)))
        })
    }

    fn requires_confirmation(&self) -> bool {
        self.confirm
    }

    fn user_input_fields(&self) -> Vec<String> {
        self.user_fields.clone()
    }

    fn external_execution(&self) -> bool {
        self.external
    }
}

/// Run trigger that records every call and can fail the first N.
#[derive(Default)]
pub struct RecordingTrigger {
    calls: Mutex<Vec<(String, Value)>>,
    fail_first: AtomicU32,
    delay: Option<Duration>,
}

impl RecordingTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` calls with a trigger error.
    pub fn failing(n: u32) -> Self {
        Self {
            fail_first: AtomicU32::new(n),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `(endpoint, payload)` of every call, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

impl RunTrigger for RecordingTrigger {
    fn trigger(&self, endpoint: &str, payload: &Value) -> BoxFuture<'_, Result<Value>> {
        let endpoint = endpoint.to_string();
        let payload = payload.clone();
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let n = self.calls.lock().unwrap().len() + 1;
            self.calls.lock().unwrap().push((endpoint, payload));
            let failed = self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failed {
                return Err(EnsembleError::Trigger(format!("attempt {} refused", n)));
            }
            Ok(serde_json::json!({ "run_id": format!("run-{}", n) }))
        })
    }
}

/// A temp dir plus a database path inside it. Keep the dir alive for the test.
pub fn temp_db() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ensemble.db");
    (dir, path)
}

/// Write `toml` as `ensemble.toml` in a temp dir and load it.
pub fn load_config(toml: &str) -> (tempfile::TempDir, AppConfig) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ensemble.toml");
    std::fs::write(&path, toml).unwrap();
    let config = AppConfig::load(&path).unwrap();
    (dir, config)
}

/// Parse a config string directly, without env expansion.
pub fn parse_config(text: &str) -> AppConfig {
    toml::from_str(text).unwrap()
}

/// Timestamp helper for schedule tests.
pub fn minutes_ago(minutes: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now() - chrono::Duration::minutes(minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_inference_replays_in_order() {
        let client = ScriptedInference::new(vec![call("search", Value::Null), answer("done")]);
        let req = InferenceRequest {
            instructions: None,
            messages: Vec::new(),
            tools: Vec::new(),
        };
        assert!(matches!(
            client.infer(req.clone()).await.unwrap(),
            InferenceResponse::ToolCalls(_)
        ));
        assert_eq!(client.infer(req.clone()).await.unwrap(), answer("done"));
        assert!(client.infer(req).await.is_err());
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn recording_trigger_fails_first_calls() {
        let trigger = RecordingTrigger::failing(1);
        assert!(trigger.trigger("wf", &Value::Null).await.is_err());
        assert!(trigger.trigger("wf", &Value::Null).await.is_ok());
        assert_eq!(trigger.calls().len(), 2);
    }
}
