//! Message Store (`spec.md` §2, §3): append-only per-bot history with
//! asset links. Messages belong to the bot (not the route) so messages from
//! any channel interleave in one stream.

use crate::error::{IntegrityError, Result};
use crate::{BotId, MessagePart, RouteId, Role};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub id: Uuid,
    pub bot_id: BotId,
    pub route_id: Option<RouteId>,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    pub external_message_id: Option<String>,
    pub reply_to: Option<Uuid>,
    /// Set on partial-failure / cancellation: message text was persisted
    /// before the run finished (§4.2 state machine, §8 property 6).
    pub aborted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AssetRef {
    pub asset_id: crate::media::MediaAssetId,
    pub role: String,
    pub ordinal: i64,
}

pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history_messages (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                route_id TEXT REFERENCES bot_channel_routes(id),
                role TEXT NOT NULL,
                parts TEXT NOT NULL,
                external_message_id TEXT,
                reply_to TEXT,
                aborted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_bot_created ON history_messages(bot_id, created_at)",
        )
        .execute(pool)
        .await?;

        // §8 property 1: at most one HistoryMessage per (bot, channel,
        // external_message_id). Enforced with a partial unique index since
        // the column is nullable for synthetic/assistant messages.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_history_dedup
            ON history_messages(bot_id, external_message_id)
            WHERE external_message_id IS NOT NULL
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history_message_assets (
                message_id TEXT NOT NULL REFERENCES history_messages(id) ON DELETE CASCADE,
                asset_id TEXT NOT NULL,
                role TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                PRIMARY KEY (message_id, asset_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Append a message. Enforces the §3 invariant that a message's
    /// `route_id`, if present, must belong to the same bot — the caller is
    /// expected to have resolved the route already; this is a defensive
    /// recheck raising `IntegrityError` on mismatch.
    ///
    /// Duplicate `(bot_id, external_message_id)` is silently treated as a
    /// no-op returning the existing row (§8 property 1, §4.1 edge case a).
    pub async fn append(
        &self,
        bot_id: BotId,
        route_id: Option<RouteId>,
        role: Role,
        parts: Vec<MessagePart>,
        external_message_id: Option<&str>,
        reply_to: Option<Uuid>,
    ) -> Result<HistoryMessage> {
        if let Some(route_id) = route_id {
            let route_bot: Option<String> = sqlx::query_scalar(
                "SELECT bot_id FROM bot_channel_routes WHERE id = ?",
            )
            .bind(route_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
            match route_bot {
                Some(b) if b == bot_id.to_string() => {}
                Some(b) => {
                    return Err(IntegrityError::RouteBotMismatch {
                        route_id: route_id.to_string(),
                        route_bot_id: b,
                        expected_bot_id: bot_id.to_string(),
                    }
                    .into());
                }
                None => {
                    return Err(IntegrityError::Constraint(format!(
                        "route {route_id} does not exist"
                    ))
                    .into());
                }
            }
        }

        if let Some(ext_id) = external_message_id {
            if let Some(existing) = self.find_by_external_id(bot_id, ext_id).await? {
                return Ok(existing);
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO history_messages
                (id, bot_id, route_id, role, parts, external_message_id, reply_to, aborted, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(bot_id.to_string())
        .bind(route_id.map(|r| r.to_string()))
        .bind(role_str(role))
        .bind(serde_json::to_string(&parts).map_err(|e| anyhow::anyhow!(e))?)
        .bind(external_message_id)
        .bind(reply_to.map(|r| r.to_string()))
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(HistoryMessage {
            id,
            bot_id,
            route_id,
            role,
            parts,
            external_message_id: external_message_id.map(str::to_string),
            reply_to,
            aborted: false,
            created_at: now,
        })
    }

    /// Mark a message `aborted` (§4.2 cancellation semantics) — used when a
    /// partial assistant message is persisted mid-stream.
    pub async fn mark_aborted(&self, message_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE history_messages SET aborted = 1 WHERE id = ?")
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn link_assets(&self, message_id: Uuid, assets: &[AssetRef]) -> Result<()> {
        for a in assets {
            sqlx::query(
                "INSERT OR REPLACE INTO history_message_assets (message_id, asset_id, role, ordinal) VALUES (?, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(a.asset_id.to_string())
            .bind(&a.role)
            .bind(a.ordinal)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// §4.1 edge cases (a)/(b): lookup used both to detect a duplicate
    /// inbound event before persisting and to check whether a
    /// `reply_to_external_id` points at a message this bot already sent.
    pub async fn find_by_external_id(&self, bot_id: BotId, external_id: &str) -> Result<Option<HistoryMessage>> {
        let row = sqlx::query(
            r#"
            SELECT id, bot_id, route_id, role, parts, external_message_id, reply_to, aborted, created_at
            FROM history_messages WHERE bot_id = ? AND external_message_id = ?
            "#,
        )
        .bind(bot_id.to_string())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_message).transpose()
    }

    /// §4.2 context assembly: recent history up to `max_age`/`max_tokens`,
    /// whichever binds first, oldest first. Token counting is a cheap
    /// whitespace-split approximation — exact tokenization is the
    /// `ChatProvider`'s concern, out of scope here.
    pub async fn recent_history(
        &self,
        bot_id: BotId,
        max_age: chrono::Duration,
        max_tokens: usize,
    ) -> Result<Vec<HistoryMessage>> {
        let since = (Utc::now() - max_age).to_rfc3339();
        let rows = sqlx::query(
            r#"
            SELECT id, bot_id, route_id, role, parts, external_message_id, reply_to, aborted, created_at
            FROM history_messages WHERE bot_id = ? AND created_at >= ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(bot_id.to_string())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        let mut token_budget = max_tokens;
        for row in rows {
            let msg = row_to_message(row)?;
            let approx_tokens: usize = msg
                .parts
                .iter()
                .map(|p| match p {
                    MessagePart::Text { text } => text.split_whitespace().count(),
                    MessagePart::Attachment(_) => 8,
                })
                .sum();
            if approx_tokens > token_budget && !out.is_empty() {
                break;
            }
            token_budget = token_budget.saturating_sub(approx_tokens);
            out.push(msg);
        }
        out.reverse();
        Ok(out)
    }

    pub async fn time_range(
        &self,
        bot_id: BotId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HistoryMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, bot_id, route_id, role, parts, external_message_id, reply_to, aborted, created_at
            FROM history_messages WHERE bot_id = ? AND created_at BETWEEN ? AND ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(bot_id.to_string())
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_message).collect()
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
        Role::Schedule => "schedule",
    }
}

fn role_parse(s: &str) -> Role {
    match s {
        "assistant" => Role::Assistant,
        "system" => Role::System,
        "tool" => Role::Tool,
        "schedule" => Role::Schedule,
        _ => Role::User,
    }
}

fn row_to_message(r: sqlx::sqlite::SqliteRow) -> Result<HistoryMessage> {
    let id: String = r.get("id");
    let bot_id: String = r.get("bot_id");
    let route_id: Option<String> = r.get("route_id");
    let role: String = r.get("role");
    let parts: String = r.get("parts");
    let reply_to: Option<String> = r.get("reply_to");
    let created_at: String = r.get("created_at");

    Ok(HistoryMessage {
        id: Uuid::parse_str(&id).map_err(|e| anyhow::anyhow!(e))?,
        bot_id: bot_id.parse().unwrap_or_default(),
        route_id: route_id.and_then(|s| s.parse().ok()),
        role: role_parse(&role),
        parts: serde_json::from_str(&parts).unwrap_or_default(),
        external_message_id: r.get("external_message_id"),
        reply_to: reply_to.and_then(|s| Uuid::parse_str(&s).ok()),
        aborted: r.get::<i64, _>("aborted") != 0,
        created_at: created_at.parse().unwrap_or(Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::identity::IdentityStore::initialize(&pool).await.unwrap();
        crate::bots::BotStore::initialize(&pool).await.unwrap();
        crate::routes::RouteStore::initialize(&pool).await.unwrap();
        MessageStore::initialize(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn duplicate_external_id_is_idempotent() {
        let pool = pool().await;
        let store = MessageStore::new(pool);
        let bot_id = BotId::new();
        let parts = vec![MessagePart::Text { text: "hi".into() }];

        let a = store
            .append(bot_id, None, Role::User, parts.clone(), Some("ext-1"), None)
            .await
            .unwrap();
        let b = store
            .append(bot_id, None, Role::User, parts, Some("ext-1"), None)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn route_bot_mismatch_is_rejected() {
        let pool = pool().await;
        let route_store = crate::routes::RouteStore::new(pool.clone());
        let store = MessageStore::new(pool);

        let bot_a = BotId::new();
        let bot_b = BotId::new();
        let route = route_store
            .upsert_route(bot_a, crate::ChannelType::Telegram, "c1", None, serde_json::json!({}))
            .await
            .unwrap();

        let err = store
            .append(bot_b, Some(route.id), Role::User, vec![], None, None)
            .await;
        assert!(err.is_err());
    }
}
