use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ensemble_core::config::SchedulerConfig;
use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::event::EventBus;
use ensemble_core::schedule::{Schedule, ScheduleRun, ScheduleRunStatus};
use ensemble_core::traits::{RunTrigger, ScheduleStore};
use ensemble_core::types::RunEvent;

use crate::schedules::next_run_after;

/// Default lease owner: `<host>-<pid>-<random>`.
pub fn default_poller_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "ensemble".to_string());
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}-{}-{:08x}", host, std::process::id(), suffix)
}

/// Polls the schedule store and fires due schedules under a lease.
///
/// Any number of pollers may share a store; the lease taken in
/// [`ScheduleStore::try_acquire`] and renewed for as long as the firing
/// runs makes sure each firing happens once.
pub struct SchedulePoller {
    store: Arc<dyn ScheduleStore>,
    trigger: Arc<dyn RunTrigger>,
    events: Arc<EventBus>,
    poller_id: String,
    poll_interval: Duration,
    lease_ttl: chrono::Duration,
    cancel: CancellationToken,
}

impl SchedulePoller {
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn ScheduleStore>,
        trigger: Arc<dyn RunTrigger>,
        events: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            trigger,
            events,
            poller_id: config.poller_id.clone().unwrap_or_else(default_poller_id),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            lease_ttl: chrono::Duration::seconds(config.lease_ttl_secs as i64),
            cancel,
        }
    }

    pub fn with_poller_id(mut self, poller_id: impl Into<String>) -> Self {
        self.poller_id = poller_id.into();
        self
    }

    pub fn with_lease_ttl(mut self, lease_ttl: chrono::Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn poller_id(&self) -> &str {
        &self.poller_id
    }

    /// Run the poll loop. Blocks until cancelled.
    pub async fn run(&self) {
        info!(
            poller_id = %self.poller_id,
            interval_secs = self.poll_interval.as_secs(),
            "Schedule poller started"
        );

        loop {
            match self.poll_once(Utc::now()).await {
                Ok(0) => {}
                Ok(fired) => debug!(fired, "Poll finished"),
                Err(e) => error!(error = %e, "Schedule poll failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.cancel.cancelled() => {
                    info!(poller_id = %self.poller_id, "Schedule poller shutting down");
                    break;
                }
            }
        }
    }

    /// Fire every schedule due at `now` that this poller manages to lease.
    /// Returns the number of firings this poller completed.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.list_due(now, self.lease_ttl).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "Schedules due");

        let results = futures::future::join_all(due.iter().map(|s| self.fire(s, now))).await;
        let mut fired = 0;
        for (schedule, result) in due.iter().zip(results) {
            match result {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => warn!(schedule_id = %schedule.id, error = %e, "Schedule firing abandoned"),
            }
        }
        Ok(fired)
    }

    /// Lease, trigger with retries, record every attempt, release.
    /// Returns false when another poller holds the lease.
    async fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<bool> {
        if !self
            .store
            .try_acquire(&schedule.id, &self.poller_id, now, self.lease_ttl)
            .await?
        {
            debug!(schedule_id = %schedule.id, "Lease held elsewhere, skipping");
            return Ok(false);
        }
        info!(schedule_id = %schedule.id, name = %schedule.name, endpoint = %schedule.endpoint, "Firing schedule");

        let attempts = schedule.max_retries + 1;
        for attempt in 1..=attempts {
            self.renew(&schedule.id).await?;

            let triggered_at = Utc::now();
            self.events.publish(RunEvent::ScheduleFired {
                schedule_id: schedule.id.clone(),
                attempt,
                at: triggered_at,
            });
            let result = self
                .holding_lease(
                    &schedule.id,
                    self.trigger.trigger(&schedule.endpoint, &schedule.payload),
                )
                .await?;

            // Results are only written while the lease is still ours.
            self.renew(&schedule.id).await?;

            let record = ScheduleRun {
                id: uuid::Uuid::new_v4().to_string(),
                schedule_id: schedule.id.clone(),
                attempt,
                triggered_at,
                completed_at: Utc::now(),
                status: if result.is_ok() {
                    ScheduleRunStatus::Success
                } else {
                    ScheduleRunStatus::Failed
                },
                error: result.as_ref().err().map(|e| e.to_string()),
                run_id: result.as_ref().ok().and_then(reported_run_id),
            };
            self.store.save_schedule_run(&record).await?;
            self.events.publish(RunEvent::ScheduleRunRecorded {
                schedule_id: schedule.id.clone(),
                attempt,
                success: result.is_ok(),
            });

            match result {
                Ok(_) => {
                    info!(schedule_id = %schedule.id, attempt, "Schedule run recorded");
                    break;
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        schedule_id = %schedule.id,
                        attempt,
                        retry_in_secs = schedule.retry_delay_seconds,
                        error = %e,
                        "Trigger failed, retrying"
                    );
                    let delay = Duration::from_secs(schedule.retry_delay_seconds);
                    let cancelled = self
                        .holding_lease(&schedule.id, async {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => false,
                                _ = self.cancel.cancelled() => true,
                            }
                        })
                        .await?;
                    if cancelled {
                        break;
                    }
                }
                Err(e) => {
                    error!(schedule_id = %schedule.id, attempts, error = %e, "Trigger failed, giving up");
                }
            }
        }

        let next = match next_run_after(&schedule.cron_expr, &schedule.timezone, Utc::now()) {
            Ok(next) => next,
            Err(e) => {
                error!(schedule_id = %schedule.id, error = %e, "Cannot compute next run");
                None
            }
        };
        if !self.store.release(&schedule.id, &self.poller_id, next).await? {
            warn!(schedule_id = %schedule.id, "Lease lost before release");
        }
        debug!(schedule_id = %schedule.id, next_run_at = ?next, "Lease released");
        Ok(true)
    }

    /// Refresh the lease, or fail with `SchedulerLeaseExpired` if another
    /// poller has taken it.
    async fn renew(&self, schedule_id: &str) -> Result<()> {
        if self
            .store
            .renew_lease(schedule_id, &self.poller_id, Utc::now())
            .await?
        {
            Ok(())
        } else {
            Err(EnsembleError::SchedulerLeaseExpired {
                schedule_id: schedule_id.to_string(),
            })
        }
    }

    /// Drive `work` while renewing the lease every third of its TTL.
    /// `work` is dropped as soon as a renewal fails.
    async fn holding_lease<T>(&self, schedule_id: &str, work: impl Future<Output = T>) -> Result<T> {
        let period = (self.lease_ttl / 3)
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(work);
        loop {
            tokio::select! {
                out = &mut work => return Ok(out),
                _ = heartbeat.tick() => {
                    self.renew(schedule_id).await?;
                    debug!(schedule_id, "Lease renewed");
                }
            }
        }
    }
}

fn reported_run_id(response: &serde_json::Value) -> Option<String> {
    response
        .get("run_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_store::MemoryStore;
    use ensemble_test_utils::RecordingTrigger;

    fn due_schedule(max_retries: u32) -> Schedule {
        let mut schedule = Schedule::new("hourly", "0 * * * *", "report");
        schedule.next_run_at = Some(Utc::now() - chrono::Duration::seconds(5));
        schedule.max_retries = max_retries;
        schedule.retry_delay_seconds = 0;
        schedule
    }

    fn poller(store: Arc<MemoryStore>, trigger: Arc<RecordingTrigger>) -> SchedulePoller {
        SchedulePoller::new(
            &SchedulerConfig::default(),
            store,
            trigger,
            Arc::new(EventBus::default()),
            CancellationToken::new(),
        )
        .with_poller_id("poller-a")
    }

    #[tokio::test]
    async fn fires_and_reschedules() {
        let store = Arc::new(MemoryStore::new());
        let schedule = due_schedule(0);
        store.save_schedule(&schedule).await.unwrap();
        let trigger = Arc::new(RecordingTrigger::new());

        let fired = poller(store.clone(), trigger.clone())
            .poll_once(Utc::now())
            .await
            .unwrap();
        assert_eq!(fired, 1);
        assert_eq!(trigger.calls().len(), 1);

        let runs = store.list_schedule_runs(&schedule.id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].attempt, 1);
        assert_eq!(runs[0].status, ScheduleRunStatus::Success);
        assert_eq!(runs[0].run_id.as_deref(), Some("run-1"));

        let saved = store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert!(saved.locked_by.is_none());
        assert!(saved.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn retries_record_each_attempt() {
        let store = Arc::new(MemoryStore::new());
        let schedule = due_schedule(2);
        store.save_schedule(&schedule).await.unwrap();
        let trigger = Arc::new(RecordingTrigger::failing(2));

        poller(store.clone(), trigger.clone())
            .poll_once(Utc::now())
            .await
            .unwrap();

        let runs = store.list_schedule_runs(&schedule.id).await.unwrap();
        let statuses: Vec<_> = runs.iter().map(|r| (r.attempt, r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (1, ScheduleRunStatus::Failed),
                (2, ScheduleRunStatus::Failed),
                (3, ScheduleRunStatus::Success),
            ]
        );
        assert!(runs[0].error.is_some());
    }

    #[tokio::test]
    async fn slow_trigger_keeps_its_lease() {
        let store = Arc::new(MemoryStore::new());
        let schedule = due_schedule(0);
        store.save_schedule(&schedule).await.unwrap();
        let trigger = Arc::new(RecordingTrigger::new().with_delay(Duration::from_millis(200)));

        let fired = poller(store.clone(), trigger.clone())
            .with_lease_ttl(chrono::Duration::milliseconds(60))
            .poll_once(Utc::now())
            .await
            .unwrap();

        assert_eq!(fired, 1);
        let runs = store.list_schedule_runs(&schedule.id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, ScheduleRunStatus::Success);
        let saved = store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert!(saved.locked_by.is_none());
        assert!(saved.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn retry_delay_longer_than_lease_ttl_finishes_the_firing() {
        let store = Arc::new(MemoryStore::new());
        let mut schedule = due_schedule(2);
        schedule.retry_delay_seconds = 1;
        store.save_schedule(&schedule).await.unwrap();
        let trigger = Arc::new(RecordingTrigger::failing(2));
        let ttl = chrono::Duration::milliseconds(300);

        let first = poller(store.clone(), trigger.clone()).with_lease_ttl(ttl);
        let second = poller(store.clone(), Arc::new(RecordingTrigger::new()))
            .with_poller_id("poller-b")
            .with_lease_ttl(ttl);

        // The second poller looks while the first sleeps past its TTL.
        let (fired, stolen) = tokio::join!(first.poll_once(Utc::now()), async {
            tokio::time::sleep(Duration::from_millis(700)).await;
            second.poll_once(Utc::now()).await
        });
        assert_eq!(fired.unwrap(), 1);
        assert_eq!(stolen.unwrap(), 0);

        let runs = store.list_schedule_runs(&schedule.id).await.unwrap();
        let attempts: Vec<_> = runs.iter().map(|r| (r.attempt, r.status)).collect();
        assert_eq!(
            attempts,
            vec![
                (1, ScheduleRunStatus::Failed),
                (2, ScheduleRunStatus::Failed),
                (3, ScheduleRunStatus::Success),
            ]
        );
        assert_eq!(trigger.calls().len(), 3);

        let saved = store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert!(saved.locked_by.is_none());
        assert!(saved.next_run_at.unwrap() > Utc::now());
        assert_eq!(first.poll_once(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lost_lease_abandons_firing() {
        let store = Arc::new(MemoryStore::new());
        let schedule = due_schedule(0);
        store.save_schedule(&schedule).await.unwrap();
        let trigger = Arc::new(RecordingTrigger::new().with_delay(Duration::from_millis(200)));

        let takeover = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut taken = store.get_schedule(&schedule.id).await.unwrap().unwrap();
            taken.locked_by = Some("poller-b".into());
            taken.locked_at = Some(Utc::now());
            store.save_schedule(&taken).await.unwrap();
        };
        let owner = poller(store.clone(), trigger.clone())
            .with_lease_ttl(chrono::Duration::seconds(1));
        let (fired, ()) = tokio::join!(owner.poll_once(Utc::now()), takeover);

        assert_eq!(fired.unwrap(), 0);
        assert_eq!(trigger.calls().len(), 1);
        assert!(store.list_schedule_runs(&schedule.id).await.unwrap().is_empty());
        let saved = store.get_schedule(&schedule.id).await.unwrap().unwrap();
        assert_eq!(saved.locked_by.as_deref(), Some("poller-b"));
    }

    #[test]
    fn default_poller_ids_differ() {
        assert_ne!(default_poller_id(), default_poller_id());
    }
}
