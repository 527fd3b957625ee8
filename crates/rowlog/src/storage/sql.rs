//! PostgreSQL-backed row log storage and shard via sqlx.
//!
//! Tables:
//! - `rowlog_sequences`: per-row sequence counters
//! - `rowlog_messages`: messages with payload and execution state
//! - `rowlog_shard`: pending work per subscription
//! - `rowlog_problematic`: problematic set per subscription
//!
//! This module is only available when the `sql` feature is enabled.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::error::RowLogError;
use crate::execution_state::ExecutionState;
use crate::message::{Message, MessageId, PayloadRef};
use crate::row_log_storage::RowLogStorage;
use crate::shard::{RowLogShard, ScannedMessage};
use crate::types::{RowLogId, ShardId, SubscriptionId};

/// One row log and one of its shards stored in PostgreSQL.
pub struct SqlRowLog {
    pool: PgPool,
    row_log: RowLogId,
    shard: ShardId,
}

impl SqlRowLog {
    pub fn new(pool: PgPool, row_log: RowLogId, shard: ShardId) -> Self {
        Self {
            pool,
            row_log,
            shard,
        }
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<(), RowLogError> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|e| RowLogError::PersistenceError {
                reason: format!("migration failed: {e}"),
                source: Some(Box::new(e)),
            })
    }

    async fn flagged(
        &self,
        subscription: &SubscriptionId,
        message: &Message,
    ) -> Result<bool, RowLogError> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM rowlog_problematic
            WHERE row_log = $1 AND shard = $2 AND subscription = $3
              AND row_key = $4 AND ts = $5 AND seq_nr = $6
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&self.shard.0)
        .bind(&subscription.0)
        .bind(&message.row_key)
        .bind(message.timestamp)
        .bind(message.seq_nr)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(row.is_some())
    }
}

fn map_err(e: sqlx::Error) -> RowLogError {
    match e {
        sqlx::Error::PoolClosed => RowLogError::BackendUnavailable {
            reason: "connection pool closed".to_string(),
            source: Some(Box::new(e)),
        },
        e => RowLogError::PersistenceError {
            reason: e.to_string(),
            source: Some(Box::new(e)),
        },
    }
}

fn try_get_column<'r, T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>>(
    row: &'r PgRow,
    column: &str,
) -> Result<T, RowLogError> {
    row.try_get(column)
        .map_err(|e| RowLogError::PersistenceError {
            reason: format!("failed to read '{column}' column: {e}"),
            source: Some(Box::new(e)),
        })
}

fn row_to_message(row: &PgRow) -> Result<Message, RowLogError> {
    let row_key: Vec<u8> = try_get_column(row, "row_key")?;
    let ts: i64 = try_get_column(row, "ts")?;
    let seq_nr: i64 = try_get_column(row, "seq_nr")?;
    let data: Option<Vec<u8>> = try_get_column(row, "data")?;
    let payload_len: Option<i64> = try_get_column(row, "payload_len")?;

    let mut message = Message::new(row_key, ts, seq_nr);
    message.data = data;
    message.payload = payload_len.map(|len| PayloadRef {
        len: usize::try_from(len).unwrap_or_default(),
    });
    Ok(message)
}

fn decode_state(row: &PgRow) -> Result<ExecutionState, RowLogError> {
    let json: serde_json::Value = try_get_column(row, "state")?;
    let revision: i64 = try_get_column(row, "revision")?;
    let mut state: ExecutionState =
        serde_json::from_value(json).map_err(|e| RowLogError::MalformedMessage {
            reason: format!("failed to deserialize execution state: {e}"),
            source: Some(Box::new(e)),
        })?;
    state.revision = revision as u64;
    Ok(state)
}

fn encode_state(state: &ExecutionState) -> Result<serde_json::Value, RowLogError> {
    serde_json::to_value(state).map_err(|e| RowLogError::PersistenceError {
        reason: format!("failed to serialize execution state: {e}"),
        source: Some(Box::new(e)),
    })
}

#[async_trait]
impl RowLogStorage for SqlRowLog {
    async fn next_sequence_nr(&self, row_key: &[u8]) -> Result<i64, RowLogError> {
        let row = sqlx::query(
            r#"
            INSERT INTO rowlog_sequences (row_log, row_key, next_seq)
            VALUES ($1, $2, 1)
            ON CONFLICT (row_log, row_key)
            DO UPDATE SET next_seq = rowlog_sequences.next_seq + 1
            RETURNING next_seq - 1 AS seq_nr
            "#,
        )
        .bind(&self.row_log.0)
        .bind(row_key)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        try_get_column(&row, "seq_nr")
    }

    async fn put_message(
        &self,
        message: &Message,
        payload: Option<&[u8]>,
        state: &ExecutionState,
    ) -> Result<(), RowLogError> {
        let result = sqlx::query(
            r#"
            INSERT INTO rowlog_messages
                (row_log, row_key, ts, seq_nr, data, payload, payload_len, state, revision)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (row_log, row_key, ts, seq_nr) DO NOTHING
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&message.row_key)
        .bind(message.timestamp)
        .bind(message.seq_nr)
        .bind(&message.data)
        .bind(payload)
        .bind(message.payload.map(|p| p.len as i64))
        .bind(encode_state(state)?)
        .bind(state.revision as i64)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(RowLogError::PersistenceError {
                reason: format!("message {} already exists", message.id()),
                source: None,
            });
        }
        Ok(())
    }

    async fn message(&self, id: &MessageId) -> Result<Option<Message>, RowLogError> {
        let row = sqlx::query(
            r#"
            SELECT row_key, ts, seq_nr, data, payload_len FROM rowlog_messages
            WHERE row_log = $1 AND row_key = $2 AND ts = $3 AND seq_nr = $4
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&id.row_key)
        .bind(id.timestamp)
        .bind(id.seq_nr)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn execution_state(
        &self,
        id: &MessageId,
    ) -> Result<Option<ExecutionState>, RowLogError> {
        let row = sqlx::query(
            r#"
            SELECT state, revision FROM rowlog_messages
            WHERE row_log = $1 AND row_key = $2 AND ts = $3 AND seq_nr = $4
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&id.row_key)
        .bind(id.timestamp)
        .bind(id.seq_nr)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        row.as_ref().map(decode_state).transpose()
    }

    async fn compare_and_set_state(
        &self,
        id: &MessageId,
        expected_revision: u64,
        state: &ExecutionState,
    ) -> Result<bool, RowLogError> {
        let mut next = state.clone();
        next.revision = expected_revision + 1;
        let result = sqlx::query(
            r#"
            UPDATE rowlog_messages SET state = $5, revision = $6
            WHERE row_log = $1 AND row_key = $2 AND ts = $3 AND seq_nr = $4
              AND revision = $7
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&id.row_key)
        .bind(id.timestamp)
        .bind(id.seq_nr)
        .bind(encode_state(&next)?)
        .bind(next.revision as i64)
        .bind(expected_revision as i64)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn payload(&self, id: &MessageId) -> Result<Option<Vec<u8>>, RowLogError> {
        let row = sqlx::query(
            r#"
            SELECT payload FROM rowlog_messages
            WHERE row_log = $1 AND row_key = $2 AND ts = $3 AND seq_nr = $4
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&id.row_key)
        .bind(id.timestamp)
        .bind(id.seq_nr)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        match row {
            Some(row) => try_get_column(&row, "payload"),
            None => Ok(None),
        }
    }

    async fn remove_message(&self, id: &MessageId) -> Result<(), RowLogError> {
        sqlx::query(
            r#"
            DELETE FROM rowlog_messages
            WHERE row_log = $1 AND row_key = $2 AND ts = $3 AND seq_nr = $4
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&id.row_key)
        .bind(id.timestamp)
        .bind(id.seq_nr)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl RowLogShard for SqlRowLog {
    fn id(&self) -> &ShardId {
        &self.shard
    }

    async fn put_message(
        &self,
        message: &Message,
        subscriptions: &[SubscriptionId],
    ) -> Result<(), RowLogError> {
        let names: Vec<String> = subscriptions.iter().map(|s| s.0.clone()).collect();
        sqlx::query(
            r#"
            INSERT INTO rowlog_shard
                (row_log, shard, subscription, row_key, ts, seq_nr, data, payload_len)
            SELECT $1, $2, sub, $4, $5, $6, $7, $8 FROM UNNEST($3::TEXT[]) AS sub
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&self.shard.0)
        .bind(&names)
        .bind(&message.row_key)
        .bind(message.timestamp)
        .bind(message.seq_nr)
        .bind(&message.data)
        .bind(message.payload.map(|p| p.len as i64))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn remove_message(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError> {
        sqlx::query(
            r#"
            DELETE FROM rowlog_shard
            WHERE row_log = $1 AND shard = $2 AND subscription = $3
              AND row_key = $4 AND ts = $5 AND seq_nr = $6
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&self.shard.0)
        .bind(&subscription.0)
        .bind(&message.row_key)
        .bind(message.timestamp)
        .bind(message.seq_nr)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn next(
        &self,
        subscription: &SubscriptionId,
        limit: usize,
    ) -> Result<Vec<ScannedMessage>, RowLogError> {
        let healthy_rows = sqlx::query(
            r#"
            SELECT s.row_key, s.ts, s.seq_nr, s.data, s.payload_len FROM rowlog_shard s
            WHERE s.row_log = $1 AND s.shard = $2 AND s.subscription = $3
              AND NOT EXISTS (
                SELECT 1 FROM rowlog_problematic p
                WHERE p.row_log = s.row_log AND p.shard = s.shard
                  AND p.subscription = s.subscription AND p.row_key = s.row_key
                  AND p.ts = s.ts AND p.seq_nr = s.seq_nr)
            ORDER BY s.row_key, s.ts, s.seq_nr
            LIMIT $4
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&self.shard.0)
        .bind(&subscription.0)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut batch = Vec::with_capacity(healthy_rows.len());
        for row in &healthy_rows {
            batch.push(ScannedMessage {
                message: row_to_message(row)?,
                problematic: false,
            });
        }
        // With a full batch, flagged entries past the last healthy one belong to a later scan.
        let bound = (batch.len() >= limit)
            .then(|| batch.last().map(|s| s.message.clone()))
            .flatten();

        let flagged_rows = sqlx::query(
            r#"
            SELECT s.row_key, s.ts, s.seq_nr, s.data, s.payload_len FROM rowlog_shard s
            JOIN rowlog_problematic p
              ON p.row_log = s.row_log AND p.shard = s.shard
             AND p.subscription = s.subscription AND p.row_key = s.row_key
             AND p.ts = s.ts AND p.seq_nr = s.seq_nr
            WHERE s.row_log = $1 AND s.shard = $2 AND s.subscription = $3
              AND ($5::BYTEA IS NULL OR (s.row_key, s.ts, s.seq_nr) <= ($5, $6, $7))
            ORDER BY s.row_key, s.ts, s.seq_nr
            LIMIT $4
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&self.shard.0)
        .bind(&subscription.0)
        .bind(limit as i64)
        .bind(bound.as_ref().map(|m| m.row_key.clone()))
        .bind(bound.as_ref().map(|m| m.timestamp))
        .bind(bound.as_ref().map(|m| m.seq_nr))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        for row in &flagged_rows {
            batch.push(ScannedMessage {
                message: row_to_message(row)?,
                problematic: true,
            });
        }
        batch.sort_by(|a, b| a.message.cmp(&b.message));
        Ok(batch)
    }

    async fn put_problematic(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError> {
        sqlx::query(
            r#"
            INSERT INTO rowlog_problematic
                (row_log, shard, subscription, row_key, ts, seq_nr, data, payload_len)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&self.shard.0)
        .bind(&subscription.0)
        .bind(&message.row_key)
        .bind(message.timestamp)
        .bind(message.seq_nr)
        .bind(&message.data)
        .bind(message.payload.map(|p| p.len as i64))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn remove_problematic(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<(), RowLogError> {
        sqlx::query(
            r#"
            DELETE FROM rowlog_problematic
            WHERE row_log = $1 AND shard = $2 AND subscription = $3
              AND row_key = $4 AND ts = $5 AND seq_nr = $6
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&self.shard.0)
        .bind(&subscription.0)
        .bind(&message.row_key)
        .bind(message.timestamp)
        .bind(message.seq_nr)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn is_problematic(
        &self,
        message: &Message,
        subscription: &SubscriptionId,
    ) -> Result<bool, RowLogError> {
        self.flagged(subscription, message).await
    }

    async fn problematic(
        &self,
        subscription: &SubscriptionId,
    ) -> Result<Vec<Message>, RowLogError> {
        let rows = sqlx::query(
            r#"
            SELECT row_key, ts, seq_nr, data, payload_len FROM rowlog_problematic
            WHERE row_log = $1 AND shard = $2 AND subscription = $3
            ORDER BY row_key, ts, seq_nr
            "#,
        )
        .bind(&self.row_log.0)
        .bind(&self.shard.0)
        .bind(&subscription.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        rows.iter().map(row_to_message).collect()
    }
}
