//! Inbox (`spec.md` §2, §4.1 step 7): per-bot queue of messages from
//! channels the bot is not currently "active" on. Drained into resolver
//! context as informational notifications (§4.2 context assembly).

use crate::error::Result;
use crate::{BotId, ChannelType, RouteId};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct InboxItem {
    pub id: Uuid,
    pub bot_id: BotId,
    pub route_id: RouteId,
    pub channel_type: ChannelType,
    pub summary: String,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
}

pub struct InboxStore {
    pool: SqlitePool,
}

impl InboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_items (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                route_id TEXT NOT NULL REFERENCES bot_channel_routes(id),
                channel_type TEXT NOT NULL,
                summary TEXT NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn push(
        &self,
        bot_id: BotId,
        route_id: RouteId,
        channel_type: ChannelType,
        summary: &str,
    ) -> Result<InboxItem> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO inbox_items (id, bot_id, route_id, channel_type, summary, consumed, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(bot_id.to_string())
        .bind(route_id.to_string())
        .bind(channel_type.to_string())
        .bind(summary)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(InboxItem {
            id,
            bot_id,
            route_id,
            channel_type,
            summary: summary.to_string(),
            consumed: false,
            created_at: now,
        })
    }

    /// §4.2 context assembly: up to `limit` unconsumed items, oldest first.
    pub async fn unconsumed(&self, bot_id: BotId, limit: usize) -> Result<Vec<InboxItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, bot_id, route_id, channel_type, summary, consumed, created_at
            FROM inbox_items WHERE bot_id = ? AND consumed = 0
            ORDER BY created_at ASC LIMIT ?
            "#,
        )
        .bind(bot_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_item).collect())
    }

    /// Single-item consume primitive. `consume_for_route` below is what the
    /// Inbound Processor actually calls; see its doc comment for the §9 Open
    /// Question decision this runtime implements.
    pub async fn consume(&self, item_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE inbox_items SET consumed = 1 WHERE id = ?")
            .bind(item_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// §9 Open Question: the recorded decision (DESIGN.md) is that any bot
    /// reply clears the route's whole inbox backlog, not just the item an
    /// explicit `react`/`send` targets. Called from the Inbound Processor
    /// once it decides a route is active, before the resolver dispatches
    /// (`spec.md` §4.1 steps 7-8) — simpler to reason about and consistent
    /// across every channel adapter than tracking which specific item a
    /// reply answers.
    pub async fn consume_for_route(&self, bot_id: BotId, route_id: RouteId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE inbox_items SET consumed = 1 WHERE bot_id = ? AND route_id = ? AND consumed = 0",
        )
        .bind(bot_id.to_string())
        .bind(route_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_item(r: &sqlx::sqlite::SqliteRow) -> InboxItem {
    let id: String = r.get("id");
    let bot_id: String = r.get("bot_id");
    let route_id: String = r.get("route_id");
    let channel_type: String = r.get("channel_type");
    let created_at: String = r.get("created_at");
    InboxItem {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        bot_id: bot_id.parse().unwrap_or_default(),
        route_id: route_id.parse().unwrap_or_default(),
        channel_type: channel_type.parse().unwrap_or(ChannelType::LocalWeb),
        summary: r.get("summary"),
        consumed: r.get::<i64, _>("consumed") != 0,
        created_at: created_at.parse().unwrap_or(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_and_drain_unconsumed() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::identity::IdentityStore::initialize(&pool).await.unwrap();
        crate::bots::BotStore::initialize(&pool).await.unwrap();
        crate::routes::RouteStore::initialize(&pool).await.unwrap();
        InboxStore::initialize(&pool).await.unwrap();

        let route_store = crate::routes::RouteStore::new(pool.clone());
        let store = InboxStore::new(pool);
        let bot_id = BotId::new();
        let route = route_store
            .upsert_route(bot_id, ChannelType::Discord, "c", None, serde_json::json!({}))
            .await
            .unwrap();

        store.push(bot_id, route.id, ChannelType::Discord, "ping from #general").await.unwrap();
        let items = store.unconsumed(bot_id, 10).await.unwrap();
        assert_eq!(items.len(), 1);

        store.consume_for_route(bot_id, route.id).await.unwrap();
        assert!(store.unconsumed(bot_id, 10).await.unwrap().is_empty());
    }
}
