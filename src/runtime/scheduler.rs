/// Durable cron scheduler
///
/// Schedule rows live in the backend; timers live in tokio-cron-scheduler.
/// Each schedule id maps to at most one timer, so upserting an id replaces
/// its timer instead of stacking a second one. A running service reconciles
/// its timers with the rows every `sync_interval`, which picks up schedules
/// created, edited or removed by other processes. A firing first claims its
/// tick in the backend, then submits the flow through the Flow Composer.

use crate::backend::{FlowHandle, ScheduleEntry, SqliteBackend};
use crate::events::{Event, EventBus};
use crate::workflow::composer::{ComposeError, FlowComposer};
use chrono::Utc;
use chrono_tz::Tz;
use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),

    #[error("schedule '{0}' not found")]
    NotFound(String),

    #[error("schedule '{id}' misfired: {reason}")]
    Misfire { id: String, reason: String },

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("schedule backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<tokio_cron_scheduler::JobSchedulerError> for ScheduleError {
    fn from(e: tokio_cron_scheduler::JobSchedulerError) -> Self {
        ScheduleError::Backend(anyhow::anyhow!("job scheduler: {:?}", e))
    }
}

/// Accept both 5-field (minute-first) and 6/7-field (seconds-first) cron
///
/// 5-field expressions follow crontab conventions: they gain a leading
/// seconds field and their numeric day-of-week (0 or 7 = Sunday) is
/// rewritten to names, since the 6-field dialect numbers days from 1 = Sunday.
pub fn normalize_cron(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }
    let day_of_week = crontab_days_to_names(fields[4]);
    format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], day_of_week
    )
}

fn crontab_days_to_names(field: &str) -> String {
    const NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];
    let day = |token: &str| -> String {
        match token.parse::<usize>() {
            Ok(n) if n < NAMES.len() => NAMES[n].to_string(),
            _ => token.to_string(),
        }
    };

    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = match range.split_once('-') {
                Some((from, to)) => format!("{}-{}", day(from), day(to)),
                None => day(range),
            };
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse and check an entry's cron expression and timezone
pub fn validate_entry(entry: &ScheduleEntry) -> Result<(cron::Schedule, Tz), ScheduleError> {
    let normalized = normalize_cron(&entry.cron_expression);
    let schedule = cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: entry.cron_expression.clone(),
        reason: e.to_string(),
    })?;
    let tz: Tz = entry
        .timezone
        .parse()
        .map_err(|_| ScheduleError::InvalidTimezone(entry.timezone.clone()))?;
    Ok((schedule, tz))
}

/// Shared state a timer callback needs to fire a schedule
#[derive(Clone)]
struct Firing {
    backend: SqliteBackend,
    composer: Arc<FlowComposer>,
    events: EventBus,
}

impl Firing {
    /// Run one timer firing; failures are logged as misfires
    ///
    /// Only the scheduler that claims the tick submits the flow; the others
    /// (and firings of removed or disabled rows) are skipped.
    async fn on_timer(&self, schedule_id: &str) {
        let entry = match self.backend.claim_schedule_firing(schedule_id, Utc::now()).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tracing::debug!(schedule_id, "⏭️ Skipping firing: schedule removed, disabled or already fired");
                return;
            }
            Err(e) => {
                let misfire = ScheduleError::Misfire {
                    id: schedule_id.to_string(),
                    reason: e.to_string(),
                };
                tracing::error!(schedule_id, "❌ {}", misfire);
                return;
            }
        };

        match self.trigger(&entry).await {
            Ok(handle) => {
                tracing::info!(schedule_id, flow_id = %handle.flow_id, "⏰ Schedule fired '{}'", entry.flow_name);
            }
            Err(e) => {
                let misfire = ScheduleError::Misfire {
                    id: entry.id.clone(),
                    reason: e.to_string(),
                };
                tracing::error!(schedule_id, "❌ {}", misfire);
            }
        }
    }

    /// Submit the entry's flow and announce it
    async fn trigger(&self, entry: &ScheduleEntry) -> Result<FlowHandle, ScheduleError> {
        let handle = self.composer.submit(&entry.flow_name, &entry.flow_input).await?;
        let event = Event::schedule_triggered(
            &entry.flow_input.tenant_id,
            &entry.id,
            &entry.flow_name,
            &handle.flow_id,
        );
        if let Err(e) = self.events.publish(&event).await {
            tracing::warn!(schedule_id = %entry.id, "⚠️ Failed to publish schedule.triggered: {}", e);
        }
        Ok(handle)
    }
}

/// Live timer of one schedule and the row fields it was built from
#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerSlot {
    job_uuid: Uuid,
    cron_expression: String,
    timezone: String,
}

impl TimerSlot {
    fn built_from(&self, entry: &ScheduleEntry) -> bool {
        self.cron_expression == entry.cron_expression && self.timezone == entry.timezone
    }
}

/// Cron scheduler service with one replaceable timer per schedule id
#[derive(Clone)]
pub struct CronSchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    job_uuid_map: Arc<RwLock<HashMap<String, TimerSlot>>>, // schedule id -> timer
    firing: Firing,
    sync_interval: Duration,
    sync_task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl CronSchedulerService {
    pub async fn new(
        backend: SqliteBackend,
        composer: Arc<FlowComposer>,
        events: EventBus,
    ) -> Result<Self, ScheduleError> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            firing: Firing {
                backend,
                composer,
                events,
            },
            sync_interval: Duration::from_secs(5),
            sync_task: Arc::new(std::sync::Mutex::new(None)),
        })
    }

    /// How often a started service reconciles timers with the schedule table
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval.max(Duration::from_millis(10));
        self
    }

    /// Rebuild timers from the backend, report misfires, start ticking
    pub async fn start(&self) -> Result<(), ScheduleError> {
        tracing::info!("⏰ Starting cron scheduler service");

        for entry in self.firing.backend.list_schedules().await? {
            if !entry.enabled {
                continue;
            }
            if let Ok((schedule, tz)) = validate_entry(&entry) {
                report_missed_firing(&entry, &schedule, tz);
            }
        }
        self.reconcile().await?;

        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }

        let service = self.clone();
        let sync = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.sync_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = service.reconcile().await {
                    tracing::warn!("⚠️ Schedule sync failed: {}", e);
                }
            }
        });
        if let Ok(mut slot) = self.sync_task.lock() {
            if let Some(previous) = slot.replace(sync) {
                previous.abort();
            }
        }

        tracing::info!(
            "✅ Cron scheduler started with {} active schedule(s)",
            self.active_timers().await
        );
        Ok(())
    }

    /// Bring timers in line with the schedule table
    ///
    /// Adds timers for enabled rows without one, rebuilds timers whose cron
    /// expression or timezone changed, and drops timers of rows that were
    /// removed or disabled. Returns how many timers changed.
    pub async fn reconcile(&self) -> Result<usize, ScheduleError> {
        let mut wanted = HashMap::new();
        for entry in self.firing.backend.list_schedules().await? {
            if !entry.enabled {
                continue;
            }
            match validate_entry(&entry) {
                Ok((_, tz)) => {
                    wanted.insert(entry.id.clone(), (entry, tz));
                }
                Err(e) => tracing::error!(schedule_id = %entry.id, "❌ Skipping stored schedule: {}", e),
            }
        }

        let current = self.job_uuid_map.read().await.clone();
        let mut changed = 0;

        for id in current.keys() {
            if !wanted.contains_key(id) {
                self.remove_timer(id).await;
                changed += 1;
            }
        }
        for (id, (entry, tz)) in &wanted {
            let up_to_date = current.get(id).is_some_and(|slot| slot.built_from(entry));
            if !up_to_date {
                self.replace_timer(entry, *tz).await?;
                changed += 1;
            }
        }

        if changed > 0 {
            tracing::info!("🔁 Schedule sync changed {} timer(s)", changed);
        }
        Ok(changed)
    }

    pub async fn stop(&self) -> Result<(), ScheduleError> {
        tracing::info!("⏹️ Stopping cron scheduler service");
        if let Ok(mut slot) = self.sync_task.lock() {
            if let Some(sync) = slot.take() {
                sync.abort();
            }
        }
        self.job_uuid_map.write().await.clear();
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }
        tracing::info!("✅ Cron scheduler stopped");
        Ok(())
    }

    /// Insert or replace a schedule by id
    ///
    /// Validates the cron expression, timezone and template before touching
    /// the backend. Disabled entries are stored without a timer.
    pub async fn upsert_schedule(&self, entry: ScheduleEntry) -> Result<(), ScheduleError> {
        let (_, tz) = validate_entry(&entry)?;
        if self.firing.composer.templates().get(&entry.flow_name).is_none() {
            return Err(ComposeError::UnknownTemplate(entry.flow_name.clone()).into());
        }

        self.firing.backend.upsert_schedule(&entry).await?;

        if entry.enabled {
            self.replace_timer(&entry, tz).await?;
        } else {
            self.remove_timer(&entry.id).await;
        }

        tracing::info!(
            schedule_id = %entry.id,
            "📅 Upserted schedule '{}' ({} {}) -> {}",
            entry.id,
            entry.cron_expression,
            entry.timezone,
            entry.flow_name
        );
        Ok(())
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        Ok(self.firing.backend.list_schedules().await?)
    }

    pub async fn get_schedule(&self, id: &str) -> Result<ScheduleEntry, ScheduleError> {
        self.firing
            .backend
            .get_schedule(id)
            .await?
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))
    }

    /// Delete a schedule and cancel its future firings
    pub async fn remove_schedule(&self, id: &str) -> Result<bool, ScheduleError> {
        let existed = self.firing.backend.delete_schedule(id).await?;
        self.remove_timer(id).await;
        tracing::info!(schedule_id = id, existed, "🗑️ Removed schedule");
        Ok(existed)
    }

    /// Pause or resume a schedule without deleting it
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), ScheduleError> {
        let mut entry = self.get_schedule(id).await?;
        entry.enabled = enabled;
        self.upsert_schedule(entry).await
    }

    /// Fire a schedule's flow now; its recurring cadence is untouched
    pub async fn run_now(&self, id: &str) -> Result<FlowHandle, ScheduleError> {
        let entry = self.get_schedule(id).await?;
        let handle = self.firing.trigger(&entry).await?;
        tracing::info!(schedule_id = id, flow_id = %handle.flow_id, "▶️ Schedule run on demand");
        Ok(handle)
    }

    /// Number of live timers
    pub async fn active_timers(&self) -> usize {
        self.job_uuid_map.read().await.len()
    }

    async fn replace_timer(&self, entry: &ScheduleEntry, tz: Tz) -> Result<(), ScheduleError> {
        self.remove_timer(&entry.id).await;

        let schedule_id = entry.id.clone();
        let firing = self.firing.clone();
        let job = Job::new_async_tz(normalize_cron(&entry.cron_expression).as_str(), tz, move |_uuid, _l| {
            let schedule_id = schedule_id.clone();
            let firing = firing.clone();
            Box::pin(async move {
                tracing::debug!(schedule_id = %schedule_id, "🔔 Cron timer activated");
                firing.on_timer(&schedule_id).await;
            })
        })?;

        let job_uuid = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };
        self.job_uuid_map.write().await.insert(
            entry.id.clone(),
            TimerSlot {
                job_uuid,
                cron_expression: entry.cron_expression.clone(),
                timezone: entry.timezone.clone(),
            },
        );
        tracing::debug!(schedule_id = %entry.id, "📝 Timer registered");
        Ok(())
    }

    async fn remove_timer(&self, id: &str) {
        let removed = self.job_uuid_map.write().await.remove(id);
        if let Some(slot) = removed {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&slot.job_uuid).await {
                tracing::warn!(schedule_id = id, "⚠️ Failed to remove timer: {:?}", e);
            }
        }
    }
}

/// Log a firing that should have happened while the process was down
///
/// There is no catch-up run: the next regular firing proceeds as usual.
fn report_missed_firing(entry: &ScheduleEntry, schedule: &cron::Schedule, tz: Tz) {
    let Some(last_fired) = entry.last_fired_at else {
        return;
    };
    let now = Utc::now();
    if let Some(due) = schedule.after(&last_fired.with_timezone(&tz)).next() {
        if due.with_timezone(&Utc) < now {
            let misfire = ScheduleError::Misfire {
                id: entry.id.clone(),
                reason: format!("firing due at {} was missed", due),
            };
            tracing::warn!(schedule_id = %entry.id, "⚠️ {}", misfire);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::registry::TemplateRegistry;
    use crate::workflow::templates::{register_builtin_templates, MONITORING_SWEEP};
    use crate::workflow::types::FlowInput;

    async fn service() -> (CronSchedulerService, SqliteBackend) {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let templates = Arc::new(TemplateRegistry::new());
        register_builtin_templates(&templates);
        let events = EventBus::in_memory("test");
        let composer = Arc::new(FlowComposer::new(templates, backend.clone(), events.clone()));
        let service = CronSchedulerService::new(backend.clone(), composer, events)
            .await
            .unwrap();
        (service, backend)
    }

    fn entry(id: &str, cron: &str) -> ScheduleEntry {
        ScheduleEntry::new(id, cron, MONITORING_SWEEP, FlowInput::new("tenant-a", "proj-1"))
    }

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("0 9 * * 1"), "0 0 9 * * MON");
        assert_eq!(normalize_cron("*/5 * * * 1-5"), "0 */5 * * * MON-FRI");
        assert_eq!(normalize_cron("0 0 * * 0,7"), "0 0 0 * * SUN,SUN");
        assert_eq!(normalize_cron("0 0 9 * * Mon"), "0 0 9 * * Mon");
    }

    #[test]
    fn test_validate_rejects_garbage() {
        assert!(matches!(
            validate_entry(&entry("s", "not a cron")),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(matches!(
            validate_entry(&entry("s", "0 9 * * 1").with_timezone("Mars/Olympus")),
            Err(ScheduleError::InvalidTimezone(_))
        ));
        assert!(validate_entry(&entry("s", "0 9 * * 1").with_timezone("America/Chicago")).is_ok());
    }

    #[tokio::test]
    async fn test_upsert_list_remove() {
        let (service, _) = service().await;
        service.upsert_schedule(entry("s1", "0 9 * * 1")).await.unwrap();
        service.upsert_schedule(entry("s1", "0 9 * * 1")).await.unwrap();

        let all = service.list_schedules().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].cron_expression, "0 9 * * 1");
        assert_eq!(service.active_timers().await, 1);

        assert!(service.remove_schedule("s1").await.unwrap());
        assert!(service.list_schedules().await.unwrap().is_empty());
        assert_eq!(service.active_timers().await, 0);
    }

    #[tokio::test]
    async fn test_disabled_entry_has_no_timer() {
        let (service, _) = service().await;
        service.upsert_schedule(entry("s1", "0 9 * * 1")).await.unwrap();
        service.set_enabled("s1", false).await.unwrap();
        assert_eq!(service.active_timers().await, 0);
        assert!(!service.get_schedule("s1").await.unwrap().enabled);

        service.set_enabled("s1", true).await.unwrap();
        assert_eq!(service.active_timers().await, 1);
    }

    #[tokio::test]
    async fn test_reconcile_follows_rows_written_elsewhere() {
        let (service, backend) = service().await;
        backend.upsert_schedule(&entry("a", "0 9 * * 1")).await.unwrap();
        backend.upsert_schedule(&entry("b", "0 9 * * 2").disabled()).await.unwrap();

        assert_eq!(service.reconcile().await.unwrap(), 1);
        assert_eq!(service.active_timers().await, 1);
        assert_eq!(service.reconcile().await.unwrap(), 0);

        backend.upsert_schedule(&entry("a", "0 10 * * 1")).await.unwrap();
        assert_eq!(service.reconcile().await.unwrap(), 1);
        let slot = service.job_uuid_map.read().await.get("a").cloned().unwrap();
        assert_eq!(slot.cron_expression, "0 10 * * 1");

        backend.delete_schedule("a").await.unwrap();
        backend.upsert_schedule(&entry("b", "0 9 * * 2")).await.unwrap();
        assert_eq!(service.reconcile().await.unwrap(), 2);
        assert!(service.job_uuid_map.read().await.contains_key("b"));
        assert_eq!(service.active_timers().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_template_rejected() {
        let (service, _) = service().await;
        let mut bad = entry("s1", "0 9 * * 1");
        bad.flow_name = "nope".into();
        assert!(matches!(
            service.upsert_schedule(bad).await,
            Err(ScheduleError::Compose(ComposeError::UnknownTemplate(_)))
        ));
        assert!(service.list_schedules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_now_submits_without_touching_cadence() {
        let (service, backend) = service().await;
        service.upsert_schedule(entry("s1", "0 9 * * 1")).await.unwrap();

        let handle = service.run_now("s1").await.unwrap();
        assert!(backend.flow_status(&handle.flow_id).await.unwrap().is_some());

        let stored = service.get_schedule("s1").await.unwrap();
        assert_eq!(stored.cron_expression, "0 9 * * 1");
        assert!(stored.last_fired_at.is_none());
        assert_eq!(service.active_timers().await, 1);

        assert!(matches!(
            service.run_now("missing").await,
            Err(ScheduleError::NotFound(_))
        ));
    }
}
