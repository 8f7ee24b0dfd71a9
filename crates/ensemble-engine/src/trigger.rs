use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use ensemble_core::config::SchedulerConfig;
use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::run::RunState;
use ensemble_core::traits::RunTrigger;
use ensemble_core::types::SessionId;

use crate::engine::Engine;

/// Starts runs by POSTing the schedule payload to `base_url + endpoint`.
pub struct HttpTrigger {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTrigger {
    pub fn new(base_url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnsembleError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(String::from),
        })
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        Self::new(
            &config.base_url,
            config.api_key.as_deref(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

impl RunTrigger for HttpTrigger {
    fn trigger(&self, endpoint: &str, payload: &Value) -> BoxFuture<'_, Result<Value>> {
        let url = self.url(endpoint);
        let payload = payload.clone();
        Box::pin(async move {
            debug!(url = %url, "Posting scheduled run");
            let mut req = self.client.post(&url).json(&payload);
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| EnsembleError::Trigger(format!("request to {} failed: {}", url, e)))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(EnsembleError::Trigger(format!("{} returned {}: {}", url, status, body)));
            }

            let body = resp.text().await.map_err(|e| EnsembleError::Trigger(e.to_string()))?;
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
        })
    }
}

/// Starts runs in-process: the endpoint names a registered workflow.
///
/// The payload is either `{"input": ..., "session_id": "..."}` or, without an
/// `input` key, the run input itself.
pub struct EngineTrigger {
    engine: Arc<Engine>,
}

impl EngineTrigger {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl RunTrigger for EngineTrigger {
    fn trigger(&self, endpoint: &str, payload: &Value) -> BoxFuture<'_, Result<Value>> {
        let target = endpoint.trim_start_matches('/').to_string();
        let (input, session_id) = match payload.get("input") {
            Some(input) => (
                input.clone(),
                payload
                    .get("session_id")
                    .and_then(|s| s.as_str())
                    .map(SessionId::from_str),
            ),
            None => (payload.clone(), None),
        };
        Box::pin(async move {
            let run = self.engine.start_run(&target, input, session_id).await?;
            if run.state == RunState::Errored {
                return Err(EnsembleError::Trigger(format!(
                    "run {} errored: {}",
                    run.run_id,
                    run.error.as_deref().unwrap_or("unknown error")
                )));
            }
            Ok(serde_json::to_value(&run)?)
        })
    }
}
