use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A cron-triggered, persisted trigger definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub cron_expr: String,
    /// `UTC` or a fixed offset such as `+05:30`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// What to run: a registered workflow name or an HTTP path, depending on the trigger.
    pub endpoint: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub enabled: bool,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_retry_delay() -> u64 {
    60
}

impl Schedule {
    pub fn new(
        name: impl Into<String>,
        cron_expr: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            cron_expr: cron_expr.into(),
            timezone: default_timezone(),
            endpoint: endpoint.into(),
            payload: serde_json::Value::Null,
            enabled: true,
            next_run_at: None,
            locked_by: None,
            locked_at: None,
            max_retries: 0,
            retry_delay_seconds: default_retry_delay(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Due: enabled, `next_run_at` reached, and not held by a live lease.
    pub fn is_due(&self, now: DateTime<Utc>, lease_ttl: Duration) -> bool {
        self.enabled
            && self.next_run_at.is_some_and(|at| at <= now)
            && !self.is_leased(now, lease_ttl)
    }

    /// Whether some poller holds an unexpired lease.
    pub fn is_leased(&self, now: DateTime<Utc>, lease_ttl: Duration) -> bool {
        match (&self.locked_by, self.locked_at) {
            (Some(_), Some(at)) => at + lease_ttl > now,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Whether `owner` holds an unexpired lease.
    pub fn is_leased_by(&self, owner: &str, now: DateTime<Utc>, lease_ttl: Duration) -> bool {
        self.locked_by.as_deref() == Some(owner) && self.is_leased(now, lease_ttl)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRunStatus {
    Success,
    Failed,
}

impl std::fmt::Display for ScheduleRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ScheduleRunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown schedule run status: {}", other)),
        }
    }
}

/// One firing attempt of a schedule. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: String,
    pub schedule_id: String,
    /// 1-based attempt number within one firing.
    pub attempt: u32,
    pub triggered_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: ScheduleRunStatus,
    #[serde(default)]
    pub error: Option<String>,
    /// Run id reported by the trigger, when it returns one.
    #[serde(default)]
    pub run_id: Option<String>,
}
