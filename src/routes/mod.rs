//! Route Store (`spec.md` §2, §3): maps an external conversation/thread to
//! a logical conversation thread within a bot.

use crate::error::{NotFoundError, Result};
use crate::{BotId, ChannelType, RouteId};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone)]
pub struct BotChannelRoute {
    pub id: RouteId,
    pub bot_id: BotId,
    pub channel_type: ChannelType,
    pub external_conversation_id: String,
    pub external_thread_id: Option<String>,
    /// Where `send`-tool replies go when no explicit target is given:
    /// usually the same conversation/thread this route was last active on.
    pub default_reply_target: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct RouteStore {
    pool: SqlitePool,
}

impl RouteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_channel_routes (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                channel_type TEXT NOT NULL,
                external_conversation_id TEXT NOT NULL,
                external_thread_id TEXT,
                default_reply_target TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(bot_id, channel_type, external_conversation_id, external_thread_id)
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// §4.1 step 4: upsert on `(bot, channel_type, external_conversation_id,
    /// thread_id)`, refreshing `default_reply_target` on every call.
    pub async fn upsert_route(
        &self,
        bot_id: BotId,
        channel_type: ChannelType,
        external_conversation_id: &str,
        external_thread_id: Option<&str>,
        default_reply_target: serde_json::Value,
    ) -> Result<BotChannelRoute> {
        // sqlite treats NULL as distinct in UNIQUE, so normalize the thread
        // key to "" when absent to get real upsert semantics across calls
        // with/without a thread id for the same conversation.
        let thread_key = external_thread_id.unwrap_or("");

        let existing = sqlx::query(
            r#"
            SELECT id FROM bot_channel_routes
            WHERE bot_id = ? AND channel_type = ? AND external_conversation_id = ?
              AND COALESCE(external_thread_id, '') = ?
            "#,
        )
        .bind(bot_id.to_string())
        .bind(channel_type.to_string())
        .bind(external_conversation_id)
        .bind(thread_key)
        .fetch_optional(&self.pool)
        .await?;

        let now = Utc::now();
        let target_json = default_reply_target.to_string();

        if let Some(row) = existing {
            let id: String = row.get("id");
            sqlx::query(
                "UPDATE bot_channel_routes SET default_reply_target = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&target_json)
            .bind(now.to_rfc3339())
            .bind(&id)
            .execute(&self.pool)
            .await?;

            return self.get(RouteId(id.parse().map_err(|e: uuid::Error| anyhow::anyhow!(e))?)).await;
        }

        let id = RouteId::new();
        sqlx::query(
            r#"
            INSERT INTO bot_channel_routes
                (id, bot_id, channel_type, external_conversation_id, external_thread_id,
                 default_reply_target, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(bot_id.to_string())
        .bind(channel_type.to_string())
        .bind(external_conversation_id)
        .bind(external_thread_id)
        .bind(&target_json)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(BotChannelRoute {
            id,
            bot_id,
            channel_type,
            external_conversation_id: external_conversation_id.to_string(),
            external_thread_id: external_thread_id.map(str::to_string),
            default_reply_target,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get(&self, route_id: RouteId) -> Result<BotChannelRoute> {
        let row = sqlx::query(
            r#"
            SELECT id, bot_id, channel_type, external_conversation_id, external_thread_id,
                   default_reply_target, created_at, updated_at
            FROM bot_channel_routes WHERE id = ?
            "#,
        )
        .bind(route_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| NotFoundError::Route(route_id.to_string()))?;
        Ok(row_to_route(&row))
    }

    /// All routes a bot has ever been addressed on — the contact list the
    /// `get_contacts` tool surfaces so `send` has somewhere to target.
    pub async fn list_for_bot(&self, bot_id: BotId) -> Result<Vec<BotChannelRoute>> {
        let rows = sqlx::query(
            r#"
            SELECT id, bot_id, channel_type, external_conversation_id, external_thread_id,
                   default_reply_target, created_at, updated_at
            FROM bot_channel_routes WHERE bot_id = ? ORDER BY updated_at DESC
            "#,
        )
        .bind(bot_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_route).collect())
    }
}

fn row_to_route(r: &sqlx::sqlite::SqliteRow) -> BotChannelRoute {
    let id: String = r.get("id");
    let bot_id: String = r.get("bot_id");
    let channel_type: String = r.get("channel_type");
    let default_reply_target: String = r.get("default_reply_target");
    let created_at: String = r.get("created_at");
    let updated_at: String = r.get("updated_at");
    BotChannelRoute {
        id: id.parse().unwrap_or_default(),
        bot_id: bot_id.parse().unwrap_or_default(),
        channel_type: channel_type.parse().unwrap_or(ChannelType::LocalWeb),
        external_conversation_id: r.get("external_conversation_id"),
        external_thread_id: r.get("external_thread_id"),
        default_reply_target: serde_json::from_str(&default_reply_target)
            .unwrap_or(serde_json::Value::Null),
        created_at: created_at.parse().unwrap_or(Utc::now()),
        updated_at: updated_at.parse().unwrap_or(Utc::now()),
    }
}

impl std::str::FromStr for RouteId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_route_is_idempotent() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::identity::IdentityStore::initialize(&pool).await.unwrap();
        crate::bots::BotStore::initialize(&pool).await.unwrap();
        RouteStore::initialize(&pool).await.unwrap();
        let store = RouteStore::new(pool);
        let bot_id = BotId::new();

        let a = store
            .upsert_route(bot_id, ChannelType::Telegram, "chat1", None, serde_json::json!({}))
            .await
            .unwrap();
        let b = store
            .upsert_route(bot_id, ChannelType::Telegram, "chat1", None, serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.default_reply_target, serde_json::json!({"x": 1}));
    }
}
