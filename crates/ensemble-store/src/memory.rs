use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;

use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::run::Run;
use ensemble_core::schedule::{Schedule, ScheduleRun};
use ensemble_core::traits::{RunStore, ScheduleStore};
use ensemble_core::types::{RunId, SessionId};

#[derive(Default)]
struct Inner {
    runs: HashMap<String, Run>,
    schedules: HashMap<String, Schedule>,
    schedule_runs: Vec<ScheduleRun>,
}

/// Process-local store with the same semantics as [`crate::SqliteStore`].
///
/// Every operation takes the single lock once, so lease acquisition is atomic
/// among pollers sharing one instance.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| EnsembleError::Database(e.to_string()))
    }
}

impl RunStore for MemoryStore {
    fn save_run(&self, run: &Run) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            self.lock()?.runs.insert(run.run_id.0.clone(), run);
            Ok(())
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        let run_id = run_id.0.clone();
        Box::pin(async move { Ok(self.lock()?.runs.get(&run_id).cloned()) })
    }

    fn list_runs(&self, session_id: &SessionId) -> BoxFuture<'_, Result<Vec<Run>>> {
        let session_id = session_id.clone();
        Box::pin(async move {
            let mut runs: Vec<Run> = self
                .lock()?
                .runs
                .values()
                .filter(|r| r.session_id == session_id)
                .cloned()
                .collect();
            runs.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.run_id.cmp(&b.run_id))
            });
            Ok(runs)
        })
    }
}

impl ScheduleStore for MemoryStore {
    fn save_schedule(&self, schedule: &Schedule) -> BoxFuture<'_, Result<()>> {
        let schedule = schedule.clone();
        Box::pin(async move {
            self.lock()?
                .schedules
                .insert(schedule.id.clone(), schedule);
            Ok(())
        })
    }

    fn get_schedule(&self, id: &str) -> BoxFuture<'_, Result<Option<Schedule>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.lock()?.schedules.get(&id).cloned()) })
    }

    fn list_schedules(&self) -> BoxFuture<'_, Result<Vec<Schedule>>> {
        Box::pin(async move {
            let mut all: Vec<Schedule> = self.lock()?.schedules.values().cloned().collect();
            all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(all)
        })
    }

    fn delete_schedule(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.lock()?.schedules.remove(&id).is_some()) })
    }

    fn list_due(&self, now: DateTime<Utc>, lease_ttl: Duration) -> BoxFuture<'_, Result<Vec<Schedule>>> {
        Box::pin(async move {
            let mut due: Vec<Schedule> = self
                .lock()?
                .schedules
                .values()
                .filter(|s| s.is_due(now, lease_ttl))
                .cloned()
                .collect();
            due.sort_by_key(|s| s.next_run_at);
            Ok(due)
        })
    }

    fn try_acquire(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            let mut inner = self.lock()?;
            match inner.schedules.get_mut(&id) {
                Some(s) if s.is_due(now, lease_ttl) => {
                    s.locked_by = Some(owner);
                    s.locked_at = Some(now);
                    s.updated_at = now;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn renew_lease(&self, id: &str, owner: &str, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            let mut inner = self.lock()?;
            match inner.schedules.get_mut(&id) {
                Some(s) if s.locked_by.as_deref() == Some(owner.as_str()) => {
                    s.locked_at = Some(now);
                    s.updated_at = now;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn release(
        &self,
        id: &str,
        owner: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            let mut inner = self.lock()?;
            match inner.schedules.get_mut(&id) {
                Some(s) if s.locked_by.as_deref() == Some(owner.as_str()) => {
                    s.locked_by = None;
                    s.locked_at = None;
                    s.next_run_at = next_run_at;
                    s.updated_at = Utc::now();
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn save_schedule_run(&self, run: &ScheduleRun) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            self.lock()?.schedule_runs.push(run);
            Ok(())
        })
    }

    fn list_schedule_runs(&self, schedule_id: &str) -> BoxFuture<'_, Result<Vec<ScheduleRun>>> {
        let schedule_id = schedule_id.to_string();
        Box::pin(async move {
            Ok(self
                .lock()?
                .schedule_runs
                .iter()
                .filter(|r| r.schedule_id == schedule_id)
                .cloned()
                .collect())
        })
    }
}
