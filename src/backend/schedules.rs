/// Durable schedule rows
///
/// The cron scheduler keeps its timers in memory but treats this table as
/// the source of truth. Every running scheduler periodically reconciles its
/// timers with the rows, and a firing only proceeds after claiming it here,
/// so each tick submits one flow no matter how many schedulers are running.

use super::{from_millis, now_millis, SqliteBackend};
use crate::backend::types::ScheduleEntry;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

impl SqliteBackend {
    /// Insert or replace a schedule by id
    ///
    /// Replacing keeps the previous `last_fired_at`, so an edit does not look
    /// like a missed firing.
    pub async fn upsert_schedule(&self, entry: &ScheduleEntry) -> Result<()> {
        let now = now_millis();
        let flow_input = serde_json::to_string(&entry.flow_input)?;

        sqlx::query(
            r#"
            INSERT INTO schedules (id, cron_expression, timezone, flow_name, flow_input, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                cron_expression = excluded.cron_expression,
                timezone = excluded.timezone,
                flow_name = excluded.flow_name,
                flow_input = excluded.flow_input,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.cron_expression)
        .bind(&entry.timezone)
        .bind(&entry.flow_name)
        .bind(&flow_input)
        .bind(entry.enabled)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleEntry>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    /// All schedules, ordered by id
    pub async fn list_schedules(&self) -> Result<Vec<ScheduleEntry>> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    /// Delete a schedule; returns whether a row existed
    pub async fn delete_schedule(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim the firing of an enabled schedule at `fired_at`
    ///
    /// Succeeds for at most one caller per schedule and second: the row is
    /// only updated when its last firing happened before the current second.
    /// Returns the row as claimed, or None when it is missing, disabled or
    /// already fired for this tick.
    pub async fn claim_schedule_firing(
        &self,
        id: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<Option<ScheduleEntry>> {
        let fired_ms = fired_at.timestamp_millis();
        let tick_start = fired_ms - fired_ms.rem_euclid(1000);

        let row = sqlx::query(
            r#"
            UPDATE schedules SET last_fired_at = ?
            WHERE id = ? AND enabled = 1 AND (last_fired_at IS NULL OR last_fired_at < ?)
            RETURNING *
            "#,
        )
        .bind(fired_ms)
        .bind(id)
        .bind(tick_start)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(schedule_from_row).transpose()
    }
}

fn schedule_from_row(row: &SqliteRow) -> Result<ScheduleEntry> {
    let flow_input: String = row.try_get("flow_input")?;
    let last_fired_at: Option<i64> = row.try_get("last_fired_at")?;

    Ok(ScheduleEntry {
        id: row.try_get("id")?,
        cron_expression: row.try_get("cron_expression")?,
        timezone: row.try_get("timezone")?,
        flow_name: row.try_get("flow_name")?,
        flow_input: serde_json::from_str(&flow_input).context("Corrupt schedule flow input")?,
        enabled: row.try_get("enabled")?,
        last_fired_at: last_fired_at.map(from_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::FlowInput;

    fn entry(id: &str, cron: &str) -> ScheduleEntry {
        ScheduleEntry::new(id, cron, "seo-monitoring-sweep", FlowInput::new("tenant-a", "proj-1"))
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.upsert_schedule(&entry("s1", "0 9 * * 1")).await.unwrap();
        backend
            .upsert_schedule(&entry("s1", "0 10 * * 1").with_timezone("Europe/Berlin"))
            .await
            .unwrap();

        let all = backend.list_schedules().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].cron_expression, "0 10 * * 1");
        assert_eq!(all[0].timezone, "Europe/Berlin");
    }

    #[tokio::test]
    async fn test_upsert_keeps_last_fired() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.upsert_schedule(&entry("s1", "0 9 * * 1")).await.unwrap();
        let fired = from_millis(1_700_000_000_000);
        backend.claim_schedule_firing("s1", fired).await.unwrap().unwrap();

        backend.upsert_schedule(&entry("s1", "0 9 * * 1").disabled()).await.unwrap();
        let stored = backend.get_schedule("s1").await.unwrap().unwrap();
        assert_eq!(stored.last_fired_at, Some(fired));
        assert!(!stored.enabled);
    }

    #[tokio::test]
    async fn test_firing_claimed_once_per_tick() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.upsert_schedule(&entry("s1", "* * * * * *")).await.unwrap();
        let tick = 1_700_000_000_000;

        let claimed = backend.claim_schedule_firing("s1", from_millis(tick + 4)).await.unwrap();
        assert_eq!(claimed.unwrap().last_fired_at, Some(from_millis(tick + 4)));
        // a second scheduler waking for the same tick loses
        assert!(backend
            .claim_schedule_firing("s1", from_millis(tick + 300))
            .await
            .unwrap()
            .is_none());
        assert!(backend
            .claim_schedule_firing("s1", from_millis(tick + 1_002))
            .await
            .unwrap()
            .is_some());

        backend.upsert_schedule(&entry("s1", "* * * * * *").disabled()).await.unwrap();
        assert!(backend
            .claim_schedule_firing("s1", from_millis(tick + 5_000))
            .await
            .unwrap()
            .is_none());
        assert!(backend
            .claim_schedule_firing("missing", from_millis(tick))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.upsert_schedule(&entry("s1", "0 9 * * 1")).await.unwrap();
        assert!(backend.delete_schedule("s1").await.unwrap());
        assert!(!backend.delete_schedule("s1").await.unwrap());
        assert!(backend.list_schedules().await.unwrap().is_empty());
    }
}
