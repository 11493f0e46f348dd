/// Append-only event log
///
/// Backs the shared event transport: publishers append rows, subscribers in
/// any process tail the table by sequence number.

use super::{now_millis, SqliteBackend};
use anyhow::Result;
use sqlx::Row;
use std::time::Duration;

/// One published message as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    pub seq: i64,
    pub channel: String,
    pub payload: String,
}

impl SqliteBackend {
    /// Append a message; returns its sequence number
    pub async fn append_event(&self, channel: &str, payload: &str) -> Result<i64> {
        let seq: i64 = sqlx::query_scalar(
            "INSERT INTO events (channel, payload, created_at) VALUES (?, ?, ?) RETURNING seq",
        )
        .bind(channel)
        .bind(payload)
        .bind(now_millis())
        .fetch_one(self.pool())
        .await?;
        Ok(seq)
    }

    /// Highest sequence number written so far (0 when empty)
    pub async fn latest_event_seq(&self) -> Result<i64> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM events")
            .fetch_one(self.pool())
            .await?;
        Ok(seq.unwrap_or(0))
    }

    /// Messages after `after`, oldest first, optionally limited to one channel
    pub async fn events_after(
        &self,
        after: i64,
        channel: Option<&str>,
        limit: u32,
    ) -> Result<Vec<LoggedEvent>> {
        let rows = match channel {
            Some(channel) => {
                sqlx::query(
                    "SELECT seq, channel, payload FROM events WHERE seq > ? AND channel = ? ORDER BY seq LIMIT ?",
                )
                .bind(after)
                .bind(channel)
                .bind(limit as i64)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query("SELECT seq, channel, payload FROM events WHERE seq > ? ORDER BY seq LIMIT ?")
                    .bind(after)
                    .bind(limit as i64)
                    .fetch_all(self.pool())
                    .await?
            }
        };

        rows.iter()
            .map(|row| {
                Ok(LoggedEvent {
                    seq: row.try_get("seq")?,
                    channel: row.try_get("channel")?,
                    payload: row.try_get("payload")?,
                })
            })
            .collect()
    }

    /// Drop messages older than `older_than`; returns how many were removed
    pub async fn prune_events(&self, older_than: Duration) -> Result<u64> {
        let older_ms = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let result = sqlx::query("DELETE FROM events WHERE created_at < ?")
            .bind(now_millis().saturating_sub(older_ms))
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
