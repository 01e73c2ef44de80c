use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

use super::{batch_passes, EventStreams, StreamEntry};
use crate::domain::Event;
use crate::error::{OrraError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Streams persisted in Postgres and shared across processes
#[derive(Clone)]
pub struct PgEventStreams {
    pool: PgPool,
}

fn to_entry(stream: &str, row: &sqlx::postgres::PgRow) -> Result<StreamEntry> {
    let id: i64 = row.get("id");
    let payload: serde_json::Value = row.get("event");
    Ok(StreamEntry {
        stream: stream.to_string(),
        id: id.max(0) as u64,
        event: serde_json::from_value::<Event>(payload)?,
    })
}

fn to_db_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| OrraError::Validation(format!("entry id out of range: {}", id)))
}

impl PgEventStreams {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim up to `count` undelivered entries of one stream for `consumer`
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut tx = self.pool.begin().await?;

        let last: i64 = sqlx::query(
            r#"
            SELECT last_delivered_id FROM stream_groups
            WHERE stream = $1 AND group_name = $2
            FOR UPDATE
            "#,
        )
        .bind(stream)
        .bind(group)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| r.get("last_delivered_id"))
        .ok_or_else(|| OrraError::Validation(format!("no group {} on stream {}", group, stream)))?;

        let rows = sqlx::query(
            r#"
            SELECT id, event FROM stream_entries
            WHERE stream = $1 AND id > $2
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(stream)
        .bind(last)
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let entry = to_entry(stream, row)?;
            sqlx::query(
                r#"
                INSERT INTO stream_pending (stream, group_name, entry_id, consumer, delivered_at, delivery_count)
                VALUES ($1, $2, $3, $4, NOW(), 1)
                ON CONFLICT (stream, group_name, entry_id) DO UPDATE SET
                    consumer = EXCLUDED.consumer,
                    delivered_at = NOW(),
                    delivery_count = stream_pending.delivery_count + 1
                "#,
            )
            .bind(stream)
            .bind(group)
            .bind(to_db_id(entry.id)?)
            .bind(consumer)
            .execute(&mut *tx)
            .await?;
            out.push(entry);
        }

        if let Some(last_entry) = out.last() {
            sqlx::query(
                r#"
                UPDATE stream_groups SET last_delivered_id = $3
                WHERE stream = $1 AND group_name = $2
                "#,
            )
            .bind(stream)
            .bind(group)
            .bind(to_db_id(last_entry.id)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(out)
    }
}

#[async_trait]
impl EventStreams for PgEventStreams {
    /// Appends to one stream commit in id order. Readers advance a per-group
    /// high-water mark, so an id must never become visible after a larger one.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    async fn append(&self, stream: &str, event: &Event) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(stream)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            r#"
            INSERT INTO stream_entries (stream, event_id, event)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(stream)
        .bind(event.id)
        .bind(serde_json::to_value(event)?)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.get::<i64, _>("id").max(0) as u64)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stream_groups (stream, group_name, last_delivered_id)
            VALUES ($1, $2, 0)
            ON CONFLICT (stream, group_name) DO NOTHING
            "#,
        )
        .bind(stream)
        .bind(group)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let mut out = Vec::new();
            for quota in batch_passes(count, streams.len()) {
                for stream in streams {
                    let remaining = count.saturating_sub(out.len());
                    if remaining == 0 {
                        break;
                    }
                    let limit = quota.map_or(remaining, |q| q.min(remaining));
                    out.extend(self.claim(stream, group, consumer, limit).await?);
                }
            }
            if !out.is_empty() || Instant::now() >= deadline {
                return Ok(out);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut out = Vec::new();
        for stream in streams {
            let remaining = count.saturating_sub(out.len());
            if remaining == 0 {
                break;
            }
            let rows = sqlx::query(
                r#"
                SELECT e.id, e.event
                FROM stream_pending p
                JOIN stream_entries e ON e.id = p.entry_id AND e.stream = p.stream
                WHERE p.stream = $1 AND p.group_name = $2 AND p.consumer = $3
                ORDER BY e.id
                LIMIT $4
                "#,
            )
            .bind(stream)
            .bind(group)
            .bind(consumer)
            .bind(remaining as i64)
            .fetch_all(&self.pool)
            .await?;

            for row in &rows {
                out.push(to_entry(stream, row)?);
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, id: u64) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM stream_pending
            WHERE stream = $1 AND group_name = $2 AND entry_id = $3
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(to_db_id(id)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn len(&self, stream: &str) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM stream_entries WHERE stream = $1")
            .bind(stream)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n").max(0) as usize)
    }
}
