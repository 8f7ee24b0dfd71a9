//! Schedule CRUD and cron arithmetic.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use tracing::info;

use ensemble_core::error::{EnsembleError, Result};
use ensemble_core::schedule::{Schedule, ScheduleRun};
use ensemble_core::traits::ScheduleStore;

/// Bring a cron expression into the seconds-first form the `cron` crate parses.
///
/// Five-field (classic) expressions gain a leading `0` seconds field and have
/// numeric day-of-week values shifted from `0-6` (Sunday = 0) to `1-7`.
/// Six- and seven-field expressions are taken as written.
pub fn normalize_cron(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => {
            let dow = shift_day_of_week(fields[4])?;
            format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow)
        }
        6 | 7 => fields.join(" "),
        n => {
            return Err(EnsembleError::Validation(format!(
                "cron expression '{}' has {} fields, expected 5 or 6",
                expr, n
            )))
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|e| {
        EnsembleError::Validation(format!("invalid cron expression '{}': {}", expr, e))
    })?;
    Ok(normalized)
}

fn shift_day_of_week(field: &str) -> Result<String> {
    let shift = |n: &str| -> Result<String> {
        match n.parse::<u8>() {
            Ok(d) if d <= 7 => Ok((d % 7 + 1).to_string()),
            Ok(d) => Err(EnsembleError::Validation(format!(
                "day of week {} out of range 0-7",
                d
            ))),
            // Names (MON, Tue, ...) and wildcards need no shift.
            Err(_) => Ok(n.to_string()),
        }
    };

    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let mut shifted = match range.split_once('-') {
            Some((lo, hi)) => format!("{}-{}", shift(lo)?, shift(hi)?),
            None => shift(range)?,
        };
        if let Some(step) = step {
            shifted = format!("{}/{}", shifted, step);
        }
        items.push(shifted);
    }
    Ok(items.join(","))
}

/// Timezone a schedule's cron fields are read in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleZone {
    Offset(FixedOffset),
    /// IANA zone; firings follow its daylight saving rules.
    Named(Tz),
}

/// Accepts `UTC`, `Z`, a fixed offset such as `+05:30` / `-0800`, or an IANA
/// name such as `Europe/Berlin`.
pub fn parse_timezone(tz: &str) -> Result<ScheduleZone> {
    let tz = tz.trim();
    if tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return FixedOffset::east_opt(0)
            .map(ScheduleZone::Offset)
            .ok_or_else(|| EnsembleError::Validation("invalid UTC offset".into()));
    }

    let invalid = || EnsembleError::Validation(format!("invalid timezone '{}'", tz));
    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return tz.parse::<Tz>().map(ScheduleZone::Named).map_err(|_| invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .map(ScheduleZone::Offset)
        .ok_or_else(invalid)
}

/// First firing strictly after `now`, evaluated in the schedule's timezone.
pub fn next_run_after(cron_expr: &str, timezone: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let normalized = normalize_cron(cron_expr)?;
    let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
        EnsembleError::Validation(format!("invalid cron expression '{}': {}", cron_expr, e))
    })?;
    Ok(match parse_timezone(timezone)? {
        ScheduleZone::Offset(offset) => first_after(&schedule, &offset, now),
        ScheduleZone::Named(zone) => first_after(&schedule, &zone, now),
    })
}

fn first_after<Z: TimeZone>(
    schedule: &cron::Schedule,
    zone: &Z,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&now.with_timezone(zone))
        .map(|t| t.with_timezone(&Utc))
        .find(|t| *t > now)
}

/// Fields accepted when creating a schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub cron_expr: String,
    pub timezone: String,
    pub endpoint: String,
    pub payload: Value,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
}

impl NewSchedule {
    pub fn new(name: impl Into<String>, cron_expr: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cron_expr: cron_expr.into(),
            timezone: ensemble_core::schedule::default_timezone(),
            endpoint: endpoint.into(),
            payload: Value::Null,
            max_retries: 0,
            retry_delay_seconds: 60,
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay_seconds: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_seconds = retry_delay_seconds;
        self
    }
}

/// Create, inspect, toggle and remove schedules.
pub struct ScheduleManager {
    store: Arc<dyn ScheduleStore>,
}

impl ScheduleManager {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, new: NewSchedule) -> Result<Schedule> {
        if new.name.trim().is_empty() {
            return Err(EnsembleError::Validation("schedule name is empty".into()));
        }
        if new.endpoint.trim().is_empty() {
            return Err(EnsembleError::Validation("schedule endpoint is empty".into()));
        }
        let next = next_run_after(&new.cron_expr, &new.timezone, Utc::now())?;

        let mut schedule = Schedule::new(new.name, new.cron_expr, new.endpoint);
        schedule.timezone = new.timezone;
        schedule.payload = new.payload;
        schedule.max_retries = new.max_retries;
        schedule.retry_delay_seconds = new.retry_delay_seconds;
        schedule.next_run_at = next;
        self.store.save_schedule(&schedule).await?;

        info!(
            schedule_id = %schedule.id,
            name = %schedule.name,
            cron = %schedule.cron_expr,
            next_run_at = ?schedule.next_run_at,
            "Schedule created"
        );
        Ok(schedule)
    }

    pub async fn list(&self) -> Result<Vec<Schedule>> {
        self.store.list_schedules().await
    }

    pub async fn get(&self, id: &str) -> Result<Schedule> {
        self.store
            .get_schedule(id)
            .await?
            .ok_or_else(|| EnsembleError::ScheduleNotFound(id.to_string()))
    }

    /// Enable a schedule and recompute its next firing from now.
    pub async fn enable(&self, id: &str) -> Result<Schedule> {
        let mut schedule = self.get(id).await?;
        let now = Utc::now();
        schedule.enabled = true;
        schedule.next_run_at = next_run_after(&schedule.cron_expr, &schedule.timezone, now)?;
        schedule.updated_at = now;
        self.store.save_schedule(&schedule).await?;
        info!(schedule_id = %id, next_run_at = ?schedule.next_run_at, "Schedule enabled");
        Ok(schedule)
    }

    pub async fn disable(&self, id: &str) -> Result<Schedule> {
        let mut schedule = self.get(id).await?;
        schedule.enabled = false;
        schedule.updated_at = Utc::now();
        self.store.save_schedule(&schedule).await?;
        info!(schedule_id = %id, "Schedule disabled");
        Ok(schedule)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if !self.store.delete_schedule(id).await? {
            return Err(EnsembleError::ScheduleNotFound(id.to_string()));
        }
        info!(schedule_id = %id, "Schedule deleted");
        Ok(())
    }

    /// Firing history, oldest first.
    pub async fn list_schedule_runs(&self, id: &str) -> Result<Vec<ScheduleRun>> {
        self.get(id).await?;
        self.store.list_schedule_runs(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use ensemble_store::MemoryStore;

    #[test]
    fn five_field_cron_gains_seconds() {
        assert_eq!(normalize_cron("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 9 * * 1-5").unwrap(), "0 0 9 * * 2-6");
        assert_eq!(normalize_cron("30 0 9 * * Mon").unwrap(), "30 0 9 * * Mon");
        assert!(normalize_cron("* * *").is_err());
        assert!(normalize_cron("61 * * * *").is_err());
    }

    fn offset_secs(tz: &str) -> i32 {
        match parse_timezone(tz).unwrap() {
            ScheduleZone::Offset(offset) => offset.local_minus_utc(),
            other => panic!("expected a fixed offset, got {other:?}"),
        }
    }

    #[test]
    fn parses_offsets_and_zone_names() {
        assert_eq!(offset_secs("UTC"), 0);
        assert_eq!(offset_secs("+05:30"), 19800);
        assert_eq!(offset_secs("-0800"), -28800);
        assert_eq!(
            parse_timezone("Europe/Paris").unwrap(),
            ScheduleZone::Named(chrono_tz::Europe::Paris)
        );
        assert!(parse_timezone("Mars/Olympus_Mons").is_err());
        assert!(parse_timezone("+25:00").is_err());
    }

    #[test]
    fn named_zone_follows_daylight_saving() {
        // 09:00 in Berlin is 08:00 UTC in winter and 07:00 UTC in summer.
        let winter = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        let next = next_run_after("0 9 * * *", "Europe/Berlin", winter).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap());

        let summer = Utc.with_ymd_and_hms(2026, 7, 15, 0, 0, 0).unwrap();
        let next = next_run_after("0 9 * * *", "Europe/Berlin", summer).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 15, 7, 0, 0).unwrap());
    }

    #[test]
    fn next_run_is_strictly_after_now() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let next = next_run_after("0 * * * *", "UTC", now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn next_run_honours_timezone() {
        // 09:00 at +02:00 is 07:00 UTC.
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let next = next_run_after("0 9 * * *", "+02:00", now).unwrap().unwrap();
        assert_eq!(next.hour(), 7);
        assert_eq!(next.minute(), 0);
    }

    #[tokio::test]
    async fn enable_and_disable_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let manager = ScheduleManager::new(store.clone());

        let schedule = manager
            .create(NewSchedule::new("nightly", "0 3 * * *", "report"))
            .await
            .unwrap();
        assert!(schedule.enabled);
        assert!(schedule.next_run_at.unwrap() > Utc::now());

        let disabled = manager.disable(&schedule.id).await.unwrap();
        assert!(!disabled.enabled);
        let enabled = manager.enable(&schedule.id).await.unwrap();
        assert!(enabled.enabled);
        assert!(enabled.next_run_at.is_some());

        manager.delete(&schedule.id).await.unwrap();
        assert!(matches!(
            manager.get(&schedule.id).await,
            Err(EnsembleError::ScheduleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_bad_cron_at_creation() {
        let manager = ScheduleManager::new(Arc::new(MemoryStore::new()));
        let err = manager
            .create(NewSchedule::new("bad", "not a cron", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Validation(_)));
        assert!(manager.list().await.unwrap().is_empty());
    }
}
