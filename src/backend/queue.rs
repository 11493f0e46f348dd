/// Queue operations over the jobs, flows and child_results tables
///
/// State machine per job:
///
/// ```text
/// waiting-children --(all children terminal)--> waiting
/// waiting | delayed --(claim)--> active
/// active --(success)--> completed
/// active --(failure, budget left)--> delayed | waiting
/// active --(failure, budget spent)--> failed
/// active --(lease expired, budget left)--> waiting
/// active --(lease expired, budget spent)--> failed
/// ```
///
/// A claim takes a lease on the job. The processing worker renews it while
/// the agent runs; a job whose lease ran out belongs to a dead worker.
///
/// Every transition is a single SQL statement or a transaction whose first
/// statement is a write, so concurrent workers (in-process or in other
/// processes) never observe a half-applied transition.

use super::{from_millis, now_millis, SqliteBackend};
use crate::backend::types::{ChildResult, FlowHandle, FlowStatus, JobCounts, JobRecord, JobState};
use crate::workflow::types::{FlowDescriptor, JobDescriptor};
use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Lease taken by `claim_next`
pub const DEFAULT_JOB_LEASE: Duration = Duration::from_secs(30);

/// Failure reason recorded when a stalled job has no attempts left
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Result of one stalled-job sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StalledRecovery {
    /// Jobs put back on their queue for another attempt
    pub requeued: u64,
    /// Jobs whose attempt budget was spent, now terminally failed
    pub failed: u64,
}

impl StalledRecovery {
    pub fn total(&self) -> u64 {
        self.requeued + self.failed
    }
}

/// One job of a flow tree, flattened for insertion
struct PendingJob<'a> {
    id: String,
    parent_id: Option<String>,
    descriptor: &'a JobDescriptor,
    has_children: bool,
}

impl SqliteBackend {
    /// Atomically enqueue a whole flow tree
    ///
    /// Either every job row is inserted or none is. Jobs with prerequisites
    /// start in `waiting-children`; leaves start in `waiting`.
    pub async fn add_flow(&self, flow: &FlowDescriptor) -> Result<FlowHandle> {
        let flow_id = Uuid::new_v4().to_string();
        let now = now_millis();

        let root_children: Vec<&JobDescriptor> = flow
            .root
            .children
            .iter()
            .chain(flow.children.iter())
            .collect();

        let root_id = Uuid::new_v4().to_string();
        let mut pending = vec![PendingJob {
            id: root_id.clone(),
            parent_id: None,
            descriptor: &flow.root,
            has_children: !root_children.is_empty(),
        }];

        // Depth-first flatten, keeping declaration order
        let mut stack: Vec<(&JobDescriptor, String)> = root_children
            .into_iter()
            .rev()
            .map(|child| (child, root_id.clone()))
            .collect();
        while let Some((descriptor, parent_id)) = stack.pop() {
            let id = Uuid::new_v4().to_string();
            for child in descriptor.children.iter().rev() {
                stack.push((child, id.clone()));
            }
            pending.push(PendingJob {
                id,
                parent_id: Some(parent_id),
                descriptor,
                has_children: !descriptor.children.is_empty(),
            });
        }

        let queues_json = serde_json::to_string(&flow.queues())?;

        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO flows (id, template, tenant_id, root_job_id, queues, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&flow_id)
        .bind(&flow.template)
        .bind(flow.tenant_id())
        .bind(&root_id)
        .bind(&queues_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for job in &pending {
            let state = if job.has_children {
                JobState::WaitingChildren
            } else {
                JobState::Waiting
            };
            let payload = serde_json::to_string(&job.descriptor.payload)?;
            let opts = serde_json::to_string(&job.descriptor.options)?;

            sqlx::query(
                r#"
                INSERT INTO jobs (id, flow_id, parent_id, name, queue, payload, opts, state, run_at, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(&flow_id)
            .bind(&job.parent_id)
            .bind(&job.descriptor.name)
            .bind(&job.descriptor.queue_name)
            .bind(&payload)
            .bind(&opts)
            .bind(state.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to enqueue job '{}'", job.descriptor.name))?;
        }

        tx.commit().await?;

        Ok(FlowHandle {
            flow_id,
            root_job_id: root_id,
            job_ids: pending.into_iter().map(|j| j.id).collect(),
        })
    }

    /// Claim the next runnable job on `queue` under the default lease
    pub async fn claim_next(&self, queue: &str) -> Result<Option<JobRecord>> {
        self.claim_next_with_lease(queue, DEFAULT_JOB_LEASE).await
    }

    /// Claim the next runnable job on `queue`, marking it active
    ///
    /// Runnable means `waiting`, or `delayed` with its backoff elapsed. The
    /// claim is one UPDATE statement, so two workers never get the same job.
    /// The job stays owned for `lease`; `renew_lease` extends it.
    pub async fn claim_next_with_lease(&self, queue: &str, lease: Duration) -> Result<Option<JobRecord>> {
        let now = now_millis();
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'active', attempts_made = attempts_made + 1, processed_at = ?, lease_until = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ? AND state IN ('waiting', 'delayed') AND run_at <= ?
                ORDER BY run_at, seq
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now.saturating_add(millis(lease)))
        .bind(queue)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Extend the lease of an attempt that is still running
    ///
    /// Returns false when the attempt no longer owns the job.
    pub async fn renew_lease(&self, job: &JobRecord, lease: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET lease_until = ? WHERE id = ? AND state = 'active' AND attempts_made = ?",
        )
        .bind(now_millis().saturating_add(millis(lease)))
        .bind(&job.id)
        .bind(job.attempts_made as i64)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a successful attempt
    ///
    /// Returns false when this attempt no longer owns the job (it was
    /// recovered as stalled and possibly re-claimed); the outcome is dropped.
    pub async fn complete_job(&self, job: &JobRecord, value: &Value) -> Result<bool> {
        self.finish_job(job, JobState::Completed, Some(value), None)
            .await
    }

    /// Record a terminal failure
    pub async fn fail_job(&self, job: &JobRecord, reason: &str) -> Result<bool> {
        self.finish_job(job, JobState::Failed, None, Some(reason))
            .await
    }

    /// Put a failed attempt back on its queue after `delay`
    pub async fn retry_job(&self, job: &JobRecord, delay: Duration, reason: &str) -> Result<bool> {
        let state = if delay.is_zero() {
            JobState::Waiting
        } else {
            JobState::Delayed
        };
        let run_at = now_millis().saturating_add(millis(delay));

        let result = sqlx::query(
            "UPDATE jobs SET state = ?, run_at = ?, failed_reason = ? WHERE id = ? AND state = 'active' AND attempts_made = ?",
        )
        .bind(state.as_str())
        .bind(run_at)
        .bind(reason)
        .bind(&job.id)
        .bind(job.attempts_made as i64)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_job(
        &self,
        job: &JobRecord,
        state: JobState,
        value: Option<&Value>,
        reason: Option<&str>,
    ) -> Result<bool> {
        let now = now_millis();
        let remove = match state {
            JobState::Completed => job.options.remove_on_complete,
            _ => job.options.remove_on_fail,
        };
        let value_json = value.map(serde_json::to_string).transpose()?;

        let mut tx = self.pool().begin().await?;

        let affected = if remove {
            sqlx::query("DELETE FROM jobs WHERE id = ? AND state = 'active' AND attempts_made = ?")
                .bind(&job.id)
                .bind(job.attempts_made as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET state = ?, return_value = ?, failed_reason = ?, finished_at = ?
                WHERE id = ? AND state = 'active' AND attempts_made = ?
                "#,
            )
            .bind(state.as_str())
            .bind(&value_json)
            .bind(reason)
            .bind(now)
            .bind(&job.id)
            .bind(job.attempts_made as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if remove {
            sqlx::query("DELETE FROM child_results WHERE parent_id = ?")
                .bind(&job.id)
                .execute(&mut *tx)
                .await?;
        }

        match &job.parent_id {
            Some(parent_id) => {
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO child_results (parent_id, child_id, name, state, value, error)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(parent_id)
                .bind(&job.id)
                .bind(&job.name)
                .bind(state.as_str())
                .bind(&value_json)
                .bind(reason)
                .execute(&mut *tx)
                .await?;

                // Parent becomes runnable once no prerequisite is still pending
                sqlx::query(
                    r#"
                    UPDATE jobs SET state = 'waiting', run_at = ?
                    WHERE id = ? AND state = 'waiting-children'
                    AND NOT EXISTS (
                        SELECT 1 FROM jobs
                        WHERE parent_id = ? AND state NOT IN ('completed', 'failed')
                    )
                    "#,
                )
                .bind(now)
                .bind(parent_id)
                .bind(parent_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("UPDATE flows SET finished_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(&job.flow_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Terminal outcomes of a job's prerequisites, in completion order
    pub async fn children_results(&self, parent_id: &str) -> Result<Vec<ChildResult>> {
        let rows = sqlx::query(
            "SELECT child_id, name, state, value, error FROM child_results WHERE parent_id = ? ORDER BY rowid",
        )
        .bind(parent_id)
        .fetch_all(self.pool())
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let state: String = row.try_get("state")?;
            let value: Option<String> = row.try_get("value")?;
            results.push(ChildResult {
                job_id: row.try_get("child_id")?,
                name: row.try_get("name")?,
                state: state.parse()?,
                value: value.map(|v| serde_json::from_str(&v)).transpose()?,
                error: row.try_get("error")?,
            });
        }
        Ok(results)
    }

    /// Reclaim active jobs on `queue` whose lease has run out
    ///
    /// Jobs with attempts left go back to `waiting`; the rest fail terminally
    /// through the normal finish path, so their parent is still released.
    pub async fn recover_stalled(&self, queue: &str) -> Result<StalledRecovery> {
        let now = now_millis();
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE queue = ? AND state = 'active' AND COALESCE(lease_until, 0) <= ? ORDER BY seq",
        )
        .bind(queue)
        .bind(now)
        .fetch_all(self.pool())
        .await?;

        let mut recovery = StalledRecovery::default();
        for row in &rows {
            let job = job_from_row(row)?;
            if job.can_retry() {
                let result = sqlx::query(
                    r#"
                    UPDATE jobs SET state = 'waiting', run_at = ?, lease_until = NULL
                    WHERE id = ? AND state = 'active' AND attempts_made = ? AND COALESCE(lease_until, 0) <= ?
                    "#,
                )
                .bind(now)
                .bind(&job.id)
                .bind(job.attempts_made as i64)
                .bind(now)
                .execute(self.pool())
                .await?;
                recovery.requeued += result.rows_affected();
            } else if self.fail_job(&job, STALLED_REASON).await? {
                recovery.failed += 1;
            }
        }

        Ok(recovery)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Every retained job of a flow, in insertion order (root first)
    pub async fn flow_jobs(&self, flow_id: &str) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE flow_id = ? ORDER BY seq")
            .bind(flow_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Counts per state for one queue, across all flows
    pub async fn queue_counts(&self, queue: &str) -> Result<JobCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs WHERE queue = ? GROUP BY state")
            .bind(queue)
            .fetch_all(self.pool())
            .await?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            counts.add(state.parse()?, n.max(0) as u64);
        }
        Ok(counts)
    }

    /// Aggregate status of one flow across every queue it touches
    pub async fn flow_status(&self, flow_id: &str) -> Result<Option<FlowStatus>> {
        let Some(flow) = sqlx::query("SELECT template, tenant_id, queues FROM flows WHERE id = ?")
            .bind(flow_id)
            .fetch_optional(self.pool())
            .await?
        else {
            return Ok(None);
        };

        let queues_json: String = flow.try_get("queues")?;
        let queue_names: Vec<String> = serde_json::from_str(&queues_json)?;
        let mut queues: BTreeMap<String, JobCounts> = queue_names
            .into_iter()
            .map(|q| (q, JobCounts::default()))
            .collect();

        let rows = sqlx::query(
            "SELECT queue, state, COUNT(*) AS n FROM jobs WHERE flow_id = ? GROUP BY queue, state",
        )
        .bind(flow_id)
        .fetch_all(self.pool())
        .await?;

        for row in rows {
            let queue: String = row.try_get("queue")?;
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            queues.entry(queue).or_default().add(state.parse()?, n.max(0) as u64);
        }

        Ok(Some(FlowStatus {
            flow_id: flow_id.to_string(),
            template: flow.try_get("template")?,
            tenant_id: flow.try_get("tenant_id")?,
            queues,
        }))
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord> {
    let payload: String = row.try_get("payload")?;
    let opts: String = row.try_get("opts")?;
    let state: String = row.try_get("state")?;
    let attempts_made: i64 = row.try_get("attempts_made")?;
    let return_value: Option<String> = row.try_get("return_value")?;
    let run_at: i64 = row.try_get("run_at")?;
    let created_at: i64 = row.try_get("created_at")?;
    let finished_at: Option<i64> = row.try_get("finished_at")?;

    Ok(JobRecord {
        id: row.try_get("id")?,
        flow_id: row.try_get("flow_id")?,
        parent_id: row.try_get("parent_id")?,
        name: row.try_get("name")?,
        queue: row.try_get("queue")?,
        payload: serde_json::from_str(&payload).context("Corrupt job payload")?,
        options: serde_json::from_str(&opts).context("Corrupt job options")?,
        state: state.parse()?,
        attempts_made: u32::try_from(attempts_made.max(0)).unwrap_or(u32::MAX),
        run_at: from_millis(run_at),
        return_value: return_value.map(|v| serde_json::from_str(&v)).transpose()?,
        failed_reason: row.try_get("failed_reason")?,
        created_at: from_millis(created_at),
        finished_at: finished_at.map(from_millis),
    })
}
