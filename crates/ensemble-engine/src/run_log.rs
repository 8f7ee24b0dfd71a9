use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use ensemble_core::event::EventBus;
use ensemble_core::types::RunEvent;

/// JSONL event logger.
///
/// Subscribes to the EventBus and appends one JSON object per event to
/// `{log_dir}/{timestamp}.jsonl`, flushing after every line so a crash never
/// leaves a partial entry behind.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

/// Verbosity at which an event starts being written.
/// 1 = run lifecycle, 2 = + steps and requirements, 3 = + members, loops, schedules.
fn event_level(event: &RunEvent) -> u8 {
    match event {
        RunEvent::RunStarted { .. }
        | RunEvent::RunContinued { .. }
        | RunEvent::RunPaused { .. }
        | RunEvent::RunCompleted { .. }
        | RunEvent::RunErrored { .. }
        | RunEvent::RunCancelled { .. } => 1,
        RunEvent::StepStarted { .. }
        | RunEvent::StepCompleted { .. }
        | RunEvent::RequirementRaised { .. }
        | RunEvent::RequirementResolved { .. } => 2,
        RunEvent::LoopIteration { .. }
        | RunEvent::MemberStarted { .. }
        | RunEvent::MemberCompleted { .. }
        | RunEvent::ScheduleFired { .. }
        | RunEvent::ScheduleRunRecorded { .. } => 3,
    }
}

impl RunLogger {
    /// `level` controls verbosity, see [`LogConfig`](ensemble_core::config::LogConfig).
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events until cancelled or the bus closes. Events already
    /// queued when cancellation arrives are still written.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        let mut rx = event_bus.subscribe();

        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = self.log_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), level = self.level, "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                biased;
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&event) else {
                                continue;
                            };
                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// None when the event is above the configured level.
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        if event_level(event) > self.level {
            return None;
        }

        let mut fields = match serde_json::to_value(event) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return None,
        };
        let event_type = fields
            .remove("event")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let run_id = fields
            .remove("run_id")
            .and_then(|v| v.as_str().map(str::to_string));
        if let Some(serde_json::Value::String(error)) = fields.get_mut("error") {
            *error = truncate_str(error, 500).to_string();
        }

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            run_id,
            detail: (!fields.is_empty()).then_some(serde_json::Value::Object(fields)),
        })
    }
}

fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::types::RunId;

    fn started() -> RunEvent {
        RunEvent::RunStarted {
            run_id: RunId::from_str("run-1"),
            session_id: Default::default(),
            target: "wf".into(),
        }
    }

    fn step() -> RunEvent {
        RunEvent::StepCompleted {
            run_id: RunId::from_str("run-1"),
            path: "/0".into(),
            name: "a".into(),
            success: true,
        }
    }

    fn member() -> RunEvent {
        RunEvent::MemberStarted {
            run_id: RunId::from_str("run-1"),
            member: "writer".into(),
            member_run_id: RunId::from_str("run-1.writer"),
        }
    }

    #[test]
    fn entries_split_type_and_run_id() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = logger.event_to_entry(&step()).unwrap();
        assert_eq!(entry.event_type, "step_completed");
        assert_eq!(entry.run_id.as_deref(), Some("run-1"));

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"name\":\"a\""));
        assert!(!json.contains("\"event\""));
    }

    #[test]
    fn level_filters_events() {
        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&started()).is_some());
        assert!(l1.event_to_entry(&step()).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry(&step()).is_some());
        assert!(l2.event_to_entry(&member()).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.event_to_entry(&member()).is_some());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("short", 10), "short");
    }

    #[tokio::test]
    async fn writes_queued_events_before_stopping() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let cancel = CancellationToken::new();
        let logger = RunLogger::new(dir.path().to_path_buf(), 1);

        tokio::join!(logger.run(bus.clone(), cancel.clone()), async {
            bus.publish(started());
            bus.publish(step());
            cancel.cancel();
        });

        let file = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let content = std::fs::read_to_string(file).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("run_started"));
    }
}
