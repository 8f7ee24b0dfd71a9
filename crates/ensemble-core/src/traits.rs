use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::run::Run;
use crate::schedule::{Schedule, ScheduleRun};
use crate::types::*;

/// Inference collaborator: turns a transcript into an answer or capability calls.
pub trait InferenceClient: Send + Sync + 'static {
    fn infer(&self, request: InferenceRequest) -> BoxFuture<'_, Result<InferenceResponse>>;
}

/// A trusted capability the engine may invoke on a step's behalf.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in inference tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    /// Execute the tool. May itself return a requirement instead of a result.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutcome>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    /// Every call must be approved before it runs.
    fn requires_confirmation(&self) -> bool {
        false
    }

    /// Argument fields the user must supply when the caller left them out.
    fn user_input_fields(&self) -> Vec<String> {
        Vec::new()
    }

    /// The caller performs this action in its own process.
    fn external_execution(&self) -> bool {
        false
    }
}

/// Persistence for run snapshots.
pub trait RunStore: Send + Sync + 'static {
    /// Upsert a snapshot by run id.
    fn save_run(&self, run: &Run) -> BoxFuture<'_, Result<()>>;

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>>;

    /// Runs of a session, oldest first.
    fn list_runs(&self, session_id: &SessionId) -> BoxFuture<'_, Result<Vec<Run>>>;
}

/// Persistence for schedules, their leases, and their firing history.
pub trait ScheduleStore: Send + Sync + 'static {
    /// Upsert a schedule by id.
    fn save_schedule(&self, schedule: &Schedule) -> BoxFuture<'_, Result<()>>;

    fn get_schedule(&self, id: &str) -> BoxFuture<'_, Result<Option<Schedule>>>;

    fn list_schedules(&self) -> BoxFuture<'_, Result<Vec<Schedule>>>;

    fn delete_schedule(&self, id: &str) -> BoxFuture<'_, Result<bool>>;

    /// Enabled schedules with `next_run_at <= now` that hold no live lease.
    fn list_due(
        &self,
        now: DateTime<Utc>,
        lease_ttl: chrono::Duration,
    ) -> BoxFuture<'_, Result<Vec<Schedule>>>;

    /// Atomically claim the lease. Returns false if another live lease exists.
    fn try_acquire(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease_ttl: chrono::Duration,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Refresh `locked_at` to `now`, only if `owner` still holds the lease.
    fn renew_lease(&self, id: &str, owner: &str, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool>>;

    /// Clear the lease and set the next firing time, only if `owner` still holds it.
    fn release(
        &self,
        id: &str,
        owner: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<bool>>;

    fn save_schedule_run(&self, run: &ScheduleRun) -> BoxFuture<'_, Result<()>>;

    /// Firing history of a schedule, oldest first.
    fn list_schedule_runs(&self, schedule_id: &str) -> BoxFuture<'_, Result<Vec<ScheduleRun>>>;
}

/// Starts a run against a schedule's endpoint.
pub trait RunTrigger: Send + Sync + 'static {
    /// Returns the trigger's response (for example the started run's snapshot).
    fn trigger(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}
