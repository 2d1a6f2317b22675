//! Scheduler (`spec.md` §4.6): per-bot cron jobs evaluated once a minute.
//! Each due job becomes a synthetic `InboundEvent{role: Schedule}` pushed
//! into the same `InboundQueue` normal channel traffic flows through, so
//! the Inbound Processor is the only thing that ever starts a resolver run.

use crate::channels::queue::InboundQueue;
use crate::error::{Result, ValidationError};
use crate::routes::RouteStore;
use crate::{BotId, ChannelType, InboundEvent, MessagePart, Role, RouteId};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const MAX_LOOKAHEAD: chrono::Duration = chrono::Duration::days(366);

#[derive(Debug, Clone)]
pub struct ScheduleJob {
    pub id: Uuid,
    pub bot_id: BotId,
    pub route_id: RouteId,
    pub channel_type: ChannelType,
    pub cron_expr: String,
    pub command: String,
    pub enabled: bool,
    pub max_calls: i64,
    pub current_calls: i64,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Prepends a synthetic seconds field so a standard 5-field (minute hour
/// day-of-month month day-of-week) expression, as required by `spec.md`
/// §6, parses against the `cron` crate's native 6-field (seconds-first)
/// syntax. A caller that already supplies 6 fields is rejected by `cron`
/// itself once prefixed to 7, which is the intended behavior — the
/// contract is 5 fields, not "5 or 6".
fn normalize_cron(expr: &str) -> String {
    format!("0 {}", expr.trim())
}

/// A cron expression is valid for our purposes if, once normalized to the
/// `cron` crate's native syntax, it parses AND has at least one upcoming
/// fire time within the next year — catches expressions that parse but can
/// never actually match (e.g. Feb 30).
pub fn validate_cron(expr: &str) -> Result<cron::Schedule> {
    let schedule = cron::Schedule::from_str(&normalize_cron(expr)).map_err(|e| ValidationError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })?;

    let now = Utc::now();
    let has_upcoming = schedule
        .upcoming(Utc)
        .next()
        .map(|t| t - now <= MAX_LOOKAHEAD)
        .unwrap_or(false);

    if !has_upcoming {
        return Err(ValidationError::InvalidCron {
            expr: expr.to_string(),
            reason: "no upcoming fire time within 366 days".to_string(),
        }
        .into());
    }

    Ok(schedule)
}

pub struct ScheduleStore {
    pool: SqlitePool,
}

impl ScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedule_jobs (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                route_id TEXT NOT NULL REFERENCES bot_channel_routes(id),
                channel_type TEXT NOT NULL,
                cron_expr TEXT NOT NULL,
                command TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                max_calls INTEGER NOT NULL,
                current_calls INTEGER NOT NULL DEFAULT 0,
                next_run_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn create_job(
        &self,
        bot_id: BotId,
        route_id: RouteId,
        channel_type: ChannelType,
        cron_expr: &str,
        command: &str,
        max_calls: i64,
    ) -> Result<ScheduleJob> {
        let schedule = validate_cron(cron_expr)?;
        let next_run_at = schedule
            .upcoming(Utc)
            .next()
            .ok_or_else(|| ValidationError::InvalidCron {
                expr: cron_expr.to_string(),
                reason: "no upcoming fire time".to_string(),
            })?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO schedule_jobs
                (id, bot_id, route_id, channel_type, cron_expr, command, enabled,
                 max_calls, current_calls, next_run_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, 0, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(bot_id.to_string())
        .bind(route_id.to_string())
        .bind(channel_type.to_string())
        .bind(cron_expr)
        .bind(command)
        .bind(max_calls)
        .bind(next_run_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(ScheduleJob {
            id,
            bot_id,
            route_id,
            channel_type,
            cron_expr: cron_expr.to_string(),
            command: command.to_string(),
            enabled: true,
            max_calls,
            current_calls: 0,
            next_run_at,
            created_at: now,
        })
    }

    /// Jobs due at or before `now`: enabled and under their call cap.
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, bot_id, route_id, channel_type, cron_expr, command, enabled,
                   max_calls, current_calls, next_run_at, created_at
            FROM schedule_jobs
            WHERE enabled = 1 AND current_calls < max_calls AND next_run_at <= ?
            "#,
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    /// Increments `current_calls`, auto-disabling the job if it just hit its
    /// cap, and advances `next_run_at` to the next cron fire time. Runs in a
    /// transaction so concurrent ticks can't double-fire a job.
    pub async fn record_fire(&self, job_id: Uuid, cron_expr: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT current_calls, max_calls FROM schedule_jobs WHERE id = ? FOR UPDATE")
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await;
        // sqlite has no row-level locking; the transaction alone serializes
        // writers against this connection pool's single writer.
        let row = match row {
            Ok(r) => r,
            Err(_) => {
                sqlx::query("SELECT current_calls, max_calls FROM schedule_jobs WHERE id = ?")
                    .bind(job_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?
            }
        };
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(());
        };

        let current_calls: i64 = row.get("current_calls");
        let max_calls: i64 = row.get("max_calls");
        let new_calls = current_calls + 1;
        let now_disabled = new_calls >= max_calls;

        let next_run_at = validate_cron(cron_expr)
            .ok()
            .and_then(|s| s.upcoming(Utc).next())
            .unwrap_or_else(|| Utc::now() + chrono::Duration::days(365));

        sqlx::query(
            "UPDATE schedule_jobs SET current_calls = ?, enabled = ?, next_run_at = ? WHERE id = ?",
        )
        .bind(new_calls)
        .bind(!now_disabled)
        .bind(next_run_at.to_rfc3339())
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn row_to_job(r: &sqlx::sqlite::SqliteRow) -> ScheduleJob {
    let id: String = r.get("id");
    let bot_id: String = r.get("bot_id");
    let route_id: String = r.get("route_id");
    let channel_type: String = r.get("channel_type");
    let next_run_at: String = r.get("next_run_at");
    let created_at: String = r.get("created_at");
    ScheduleJob {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        bot_id: bot_id.parse().unwrap_or_default(),
        route_id: route_id.parse().unwrap_or_default(),
        channel_type: channel_type.parse().unwrap_or(ChannelType::LocalWeb),
        cron_expr: r.get("cron_expr"),
        command: r.get("command"),
        enabled: r.get::<i64, _>("enabled") != 0,
        max_calls: r.get("max_calls"),
        current_calls: r.get("current_calls"),
        next_run_at: next_run_at.parse().unwrap_or(Utc::now()),
        created_at: created_at.parse().unwrap_or(Utc::now()),
    }
}

/// Drives the once-a-minute evaluation loop described in `spec.md` §4.6.
pub struct Scheduler {
    store: ScheduleStore,
    routes: RouteStore,
    queue: Arc<InboundQueue>,
}

impl Scheduler {
    pub fn new(pool: SqlitePool, queue: Arc<InboundQueue>) -> Self {
        Self {
            store: ScheduleStore::new(pool.clone()),
            routes: RouteStore::new(pool),
            queue,
        }
    }

    /// Runs forever, ticking once a minute. Missed ticks while the process
    /// was down are not replayed — a job's `next_run_at` is only recomputed
    /// forward from "now" once the process notices it's due.
    pub async fn run(&self) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "scheduler tick failed");
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        for job in self.store.due_jobs(now).await? {
            let route = match self.routes.get(job.route_id).await {
                Ok(route) => route,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "schedule job route vanished, skipping");
                    continue;
                }
            };

            let event = InboundEvent {
                channel_type: job.channel_type,
                external_conversation_id: route.external_conversation_id,
                thread_id: route.external_thread_id,
                sender_subject: "scheduler".to_string(),
                sender_display_name: None,
                self_subject: "self".to_string(),
                role: Role::Schedule,
                parts: vec![MessagePart::Text { text: job.command.clone() }],
                reply_to_external_id: None,
                external_message_id: None,
                reaction: None,
            };

            self.queue.push(job.bot_id, event).await;

            if let Err(e) = self.store.record_fire(job.id, &job.cron_expr).await {
                tracing::error!(job_id = %job.id, error = %e, "failed to record schedule job fire");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::identity::IdentityStore::initialize(&pool).await.unwrap();
        crate::bots::BotStore::initialize(&pool).await.unwrap();
        crate::routes::RouteStore::initialize(&pool).await.unwrap();
        ScheduleStore::initialize(&pool).await.unwrap();
        pool
    }

    #[test]
    fn rejects_garbage_cron() {
        assert!(validate_cron("not a cron expression").is_err());
    }

    #[test]
    fn accepts_every_minute_cron() {
        assert!(validate_cron("* * * * *").is_ok());
    }

    #[test]
    fn rejects_six_field_input() {
        // The contract is 5 fields; a caller that already prepends seconds
        // ends up with 7 once normalized, which `cron` rejects.
        assert!(validate_cron("0 * * * * *").is_err());
    }

    #[tokio::test]
    async fn due_job_fires_once_and_caps_out() {
        let pool = pool().await;
        let route_store = RouteStore::new(pool.clone());
        let bot_id = BotId::new();
        let route = route_store
            .upsert_route(bot_id, ChannelType::Telegram, "chat1", None, serde_json::json!({}))
            .await
            .unwrap();

        let store = ScheduleStore::new(pool.clone());
        let job = store
            .create_job(bot_id, route.id, ChannelType::Telegram, "* * * * *", "ping", 1)
            .await
            .unwrap();

        sqlx::query("UPDATE schedule_jobs SET next_run_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(job.id.to_string())
            .execute(&pool)
            .await
            .unwrap();

        let due = store.due_jobs(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);

        store.record_fire(job.id, &job.cron_expr).await.unwrap();
        let due_after = store.due_jobs(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert!(due_after.is_empty(), "job should be disabled after hitting its cap");
    }
}
