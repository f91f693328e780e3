use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::errors::PersistenceError;
use crate::domain::ports::{ConversationRecorder, PersistenceService};
use crate::domain::types::{
    AccountSyncSnapshot, AnalyticsSnapshot, ConversationRecord, DecisionCycleRecord,
    PositionEvent, PositionEventKind,
};

use super::database::Database;

/// SQLite-backed [`PersistenceService`] / [`ConversationRecorder`]. Every write is an
/// `INSERT ... ON CONFLICT DO NOTHING` (or `DO UPDATE` for the open-position cache) keyed by the
/// idempotency keys each record carries, so replaying a cycle after a crash never double-counts.
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PersistenceService for SqliteStore {
    async fn record_position_event(&self, event: PositionEvent) -> Result<(), PersistenceError> {
        let close_time_nanos = event.occurred_at.timestamp_nanos_opt().unwrap_or(0);
        let kind = match event.kind {
            PositionEventKind::Open => "open",
            PositionEventKind::Close => "close",
        };
        let decision_json = serde_json::to_string(&event.decision)?;

        sqlx::query(
            r#"
            INSERT INTO position_events
                (trader_id, symbol, close_time_nanos, kind, decision_json, fill_price, fill_size, raw_response, occurred_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(trader_id, symbol, close_time_nanos) DO NOTHING
            "#,
        )
        .bind(&event.trader_id)
        .bind(&event.symbol)
        .bind(close_time_nanos)
        .bind(kind)
        .bind(&decision_json)
        .bind(event.fill_price.to_string())
        .bind(event.fill_size.to_string())
        .bind(&event.raw_response)
        .bind(event.occurred_at.timestamp())
        .execute(&self.db.pool)
        .await?;

        match event.kind {
            PositionEventKind::Open => {
                sqlx::query(
                    r#"
                    INSERT INTO open_positions
                        (trader_id, symbol, kind, decision_json, fill_price, fill_size, raw_response, occurred_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(trader_id, symbol) DO UPDATE SET
                        kind = excluded.kind,
                        decision_json = excluded.decision_json,
                        fill_price = excluded.fill_price,
                        fill_size = excluded.fill_size,
                        raw_response = excluded.raw_response,
                        occurred_at = excluded.occurred_at
                    "#,
                )
                .bind(&event.trader_id)
                .bind(&event.symbol)
                .bind(kind)
                .bind(&decision_json)
                .bind(event.fill_price.to_string())
                .bind(event.fill_size.to_string())
                .bind(&event.raw_response)
                .bind(event.occurred_at.timestamp())
                .execute(&self.db.pool)
                .await?;
            }
            PositionEventKind::Close => {
                sqlx::query("DELETE FROM open_positions WHERE trader_id = ? AND symbol = ?")
                    .bind(&event.trader_id)
                    .bind(&event.symbol)
                    .execute(&self.db.pool)
                    .await?;
            }
        }

        Ok(())
    }

    async fn record_decision_cycle(&self, record: DecisionCycleRecord) -> Result<(), PersistenceError> {
        let decisions_json = serde_json::to_string(&record.decisions)?;
        sqlx::query(
            r#"
            INSERT INTO decision_cycles
                (id, trader_id, cycle_number, timestamp, prompt_digest, cot_trace, decisions_json, success, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.trader_id)
        .bind(record.cycle_number as i64)
        .bind(record.timestamp.timestamp())
        .bind(&record.prompt_digest)
        .bind(&record.cot_trace)
        .bind(&decisions_json)
        .bind(record.success)
        .bind(&record.error_message)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn record_account_snapshot(&self, snapshot: AccountSyncSnapshot) -> Result<(), PersistenceError> {
        let account_json = serde_json::to_string(&snapshot.account_state)?;
        sqlx::query(
            "INSERT INTO account_snapshots (trader_id, account_json, taken_at) VALUES (?, ?, ?)",
        )
        .bind(&snapshot.trader_id)
        .bind(&account_json)
        .bind(snapshot.taken_at.timestamp())
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn record_analytics(&self, snapshot: AnalyticsSnapshot) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO analytics_snapshots
                (trader_id, realized_pnl_usd, cycles_run, decisions_accepted, decisions_rejected, taken_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.trader_id)
        .bind(snapshot.realized_pnl_usd.to_string())
        .bind(snapshot.cycles_run as i64)
        .bind(snapshot.decisions_accepted as i64)
        .bind(snapshot.decisions_rejected as i64)
        .bind(snapshot.taken_at.timestamp())
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn recent_cycles(&self, trader_id: &str, limit: u32) -> Result<Vec<DecisionCycleRecord>, PersistenceError> {
        let rows = sqlx::query_as::<_, CycleRow>(
            r#"
            SELECT id, trader_id, cycle_number, timestamp, prompt_digest, cot_trace, decisions_json, success, error_message
            FROM decision_cycles
            WHERE trader_id = ?
            ORDER BY cycle_number DESC
            LIMIT ?
            "#,
        )
        .bind(trader_id)
        .bind(limit as i64)
        .fetch_all(&self.db.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn hydrate_caches(&self, trader_ids: &[String]) -> Result<HashMap<String, u64>, PersistenceError> {
        let mut restored = HashMap::with_capacity(trader_ids.len());
        for trader_id in trader_ids {
            let row: (Option<i64>,) = sqlx::query_as(
                "SELECT MAX(cycle_number) FROM decision_cycles WHERE trader_id = ?",
            )
            .bind(trader_id)
            .fetch_one(&self.db.pool)
            .await?;

            if let Some(max_cycle) = row.0 {
                restored.insert(trader_id.clone(), max_cycle as u64);
            }
        }
        Ok(restored)
    }
}

#[async_trait]
impl ConversationRecorder for SqliteStore {
    async fn record_conversation(&self, record: ConversationRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO conversations (conversation_id, role, ts, trader_id, content, model, tokens)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(conversation_id, role, ts) DO NOTHING
            "#,
        )
        .bind(record.conversation_id.to_string())
        .bind(&record.role)
        .bind(record.timestamp.timestamp_nanos_opt().unwrap_or(0))
        .bind(&record.trader_id)
        .bind(&record.content)
        .bind(&record.model)
        .bind(record.tokens.map(|t| t as i64))
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct CycleRow {
    id: String,
    trader_id: String,
    cycle_number: i64,
    timestamp: i64,
    prompt_digest: String,
    cot_trace: String,
    decisions_json: String,
    success: bool,
    error_message: Option<String>,
}

impl TryFrom<CycleRow> for DecisionCycleRecord {
    type Error = PersistenceError;

    fn try_from(row: CycleRow) -> Result<Self, Self::Error> {
        Ok(DecisionCycleRecord {
            id: uuid::Uuid::parse_str(&row.id).unwrap_or_else(|_| uuid::Uuid::nil()),
            trader_id: row.trader_id,
            cycle_number: row.cycle_number as u64,
            timestamp: chrono::DateTime::from_timestamp(row.timestamp, 0).unwrap_or_default(),
            prompt_digest: row.prompt_digest,
            cot_trace: row.cot_trace,
            decisions: serde_json::from_str(&row.decisions_json)?,
            success: row.success,
            error_message: row.error_message,
        })
    }
}
