//! Bot Registry (`spec.md` §2, §3, §4 AuthorizeAccess call in §4.1 step 3):
//! owns bot records, membership roles, channel configuration, and the
//! creation/deletion lifecycle that provisions/tears down each bot's
//! execution container.

use crate::container::ContainerRuntime;
use crate::error::{AuthorizationError, NotFoundError, Result};
use crate::{BotId, ChannelType, UserId};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotKind {
    Personal,
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Creating,
    Ready,
    Deleting,
}

impl BotStatus {
    fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Creating => "creating",
            BotStatus::Ready => "ready",
            BotStatus::Deleting => "deleting",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "ready" => BotStatus::Ready,
            "deleting" => BotStatus::Deleting,
            _ => BotStatus::Creating,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRefs {
    pub chat_model: String,
    pub memory_model: String,
    pub embedding_model: String,
}

#[derive(Debug, Clone)]
pub struct Bot {
    pub id: BotId,
    pub owner_id: UserId,
    pub name: String,
    pub kind: BotKind,
    pub status: BotStatus,
    pub allow_guest: bool,
    pub models: ModelRefs,
    pub search_provider: Option<String>,
    pub reasoning_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bot {
    /// §3 invariant: a bot in status `deleting` accepts no new messages and
    /// runs no scheduled jobs.
    pub fn accepts_messages(&self) -> bool {
        self.status != BotStatus::Deleting
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "owner" => MemberRole::Owner,
            "admin" => MemberRole::Admin,
            _ => MemberRole::Member,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Admin)
    }
}

#[derive(Debug, Clone)]
pub struct BotMember {
    pub bot_id: BotId,
    pub user_id: UserId,
    pub role: MemberRole,
}

/// `(bot, channel_type)` unique. Opaque `credentials` blob is whatever the
/// adapter needs (bot token, webhook secret, IMAP creds, ...), stored as
/// JSON; encryption at rest is the adapter's concern (see `channels::crypto`
/// if configured with an encryption key).
#[derive(Debug, Clone)]
pub struct BotChannelConfig {
    pub bot_id: BotId,
    pub channel_type: ChannelType,
    pub self_identity: String,
    pub credentials: serde_json::Value,
    pub routing_rules: serde_json::Value,
    pub disabled: bool,
}

/// Access policy evaluated by `AuthorizeAccess`.
#[derive(Debug, Clone, Copy)]
pub struct AccessPolicy {
    pub allow_public_member: bool,
    pub allow_guest: bool,
}

pub struct BotStore {
    pool: SqlitePool,
}

impl BotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'creating',
                allow_guest INTEGER NOT NULL DEFAULT 0,
                chat_model TEXT NOT NULL,
                memory_model TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                search_provider TEXT,
                reasoning_enabled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_members (
                bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (bot_id, user_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_channel_configs (
                bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                channel_type TEXT NOT NULL,
                self_identity TEXT NOT NULL,
                credentials TEXT NOT NULL,
                routing_rules TEXT NOT NULL DEFAULT '{}',
                disabled INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (bot_id, channel_type)
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Create a bot row in `creating` status. Caller drives async
    /// provisioning via [`provision`].
    pub async fn create_bot(
        &self,
        owner_id: UserId,
        name: &str,
        kind: BotKind,
        models: ModelRefs,
    ) -> Result<Bot> {
        let id = BotId::new();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO bots (id, owner_id, name, kind, status, allow_guest,
                chat_model, memory_model, embedding_model, search_provider,
                reasoning_enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'creating', 0, ?, ?, ?, NULL, 0, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(owner_id.0.to_string())
        .bind(name)
        .bind(if kind == BotKind::Public { "public" } else { "personal" })
        .bind(&models.chat_model)
        .bind(&models.memory_model)
        .bind(&models.embedding_model)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT INTO bot_members (bot_id, user_id, role) VALUES (?, ?, 'owner')")
            .bind(id.to_string())
            .bind(owner_id.0.to_string())
            .execute(&self.pool)
            .await?;

        Ok(Bot {
            id,
            owner_id,
            name: name.to_string(),
            kind,
            status: BotStatus::Creating,
            allow_guest: false,
            models,
            search_provider: None,
            reasoning_enabled: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Drive the async container-provisioning lifecycle: on
    /// `ContainerRuntime::start` success flip status to `ready`; on failure
    /// record a lifecycle event and leave the bot in `creating` for a retry.
    pub async fn provision(&self, bot_id: BotId, runtime: &dyn ContainerRuntime) -> Result<()> {
        match runtime.start(&bot_id).await {
            Ok(()) => {
                self.set_status(bot_id, BotStatus::Ready).await?;
                lifecycle_events::record(&self.pool, bot_id, "provisioned", None).await?;
                Ok(())
            }
            Err(e) => {
                lifecycle_events::record(&self.pool, bot_id, "provision_failed", Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Reverse the lifecycle: flip to `deleting`, attempt container
    /// cleanup, then remove the row on success. On failure the status
    /// reverts to `ready` per the §3 lifecycle note.
    pub async fn delete_bot(&self, bot_id: BotId, runtime: &dyn ContainerRuntime) -> Result<()> {
        self.set_status(bot_id, BotStatus::Deleting).await?;

        match runtime.stop(&bot_id).await {
            Ok(()) => {
                sqlx::query("DELETE FROM bots WHERE id = ?")
                    .bind(bot_id.to_string())
                    .execute(&self.pool)
                    .await?;
                lifecycle_events::record(&self.pool, bot_id, "deleted", None).await?;
                Ok(())
            }
            Err(e) => {
                self.set_status(bot_id, BotStatus::Ready).await?;
                lifecycle_events::record(&self.pool, bot_id, "delete_failed", Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn set_status(&self, bot_id: BotId, status: BotStatus) -> Result<()> {
        sqlx::query("UPDATE bots SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(bot_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, bot_id: BotId) -> Result<Bot> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, name, kind, status, allow_guest, chat_model,
                   memory_model, embedding_model, search_provider,
                   reasoning_enabled, created_at, updated_at
            FROM bots WHERE id = ?
            "#,
        )
        .bind(bot_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| NotFoundError::Bot(bot_id.to_string()))?;
        Ok(row_to_bot(&row))
    }

    pub async fn member_role(&self, bot_id: BotId, user_id: UserId) -> Result<Option<MemberRole>> {
        let row = sqlx::query("SELECT role FROM bot_members WHERE bot_id = ? AND user_id = ?")
            .bind(bot_id.to_string())
            .bind(user_id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| MemberRole::parse(&r.get::<String, _>("role"))))
    }

    /// §4.1 step 3: authorize a (possibly guest) sender against a bot.
    ///
    /// - A `deleting` bot never accepts access.
    /// - A member (any role) is always authorized.
    /// - A public bot authorizes non-members when `policy.allow_public_member`.
    /// - A guest (no linked user) is authorized only when `policy.allow_guest`
    ///   and the bot's own `allow_guest` flag both permit it.
    pub async fn authorize_access(
        &self,
        user_id: Option<UserId>,
        bot_id: BotId,
        policy: AccessPolicy,
    ) -> Result<()> {
        let bot = self.get(bot_id).await?;
        if !bot.accepts_messages() {
            return Err(AuthorizationError::BotNotAcceptingMessages {
                bot_id: bot_id.to_string(),
                status: "deleting".into(),
            }
            .into());
        }

        let Some(user_id) = user_id else {
            return if policy.allow_guest && bot.allow_guest {
                Ok(())
            } else {
                Err(AuthorizationError::GuestDisallowed("unlinked channel identity".into()).into())
            };
        };

        if self.member_role(bot_id, user_id).await?.is_some() {
            return Ok(());
        }

        if bot.kind == BotKind::Public && policy.allow_public_member {
            return Ok(());
        }

        Err(AuthorizationError::NotAMember {
            user_id: user_id.to_string(),
            bot_id: bot_id.to_string(),
        }
        .into())
    }

    pub async fn upsert_channel_config(&self, cfg: &BotChannelConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_channel_configs
                (bot_id, channel_type, self_identity, credentials, routing_rules, disabled)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(bot_id, channel_type) DO UPDATE SET
                self_identity = excluded.self_identity,
                credentials = excluded.credentials,
                routing_rules = excluded.routing_rules,
                disabled = excluded.disabled
            "#,
        )
        .bind(cfg.bot_id.to_string())
        .bind(cfg.channel_type.to_string())
        .bind(&cfg.self_identity)
        .bind(cfg.credentials.to_string())
        .bind(cfg.routing_rules.to_string())
        .bind(cfg.disabled as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// §4.1 step 1: look up a `BotChannelConfig` by `(channel_type,
    /// self_identity)` across all bots; reject if none found or disabled.
    pub async fn find_channel_config_by_self(
        &self,
        channel_type: ChannelType,
        self_identity: &str,
    ) -> Result<BotChannelConfig> {
        let row = sqlx::query(
            r#"
            SELECT bot_id, channel_type, self_identity, credentials, routing_rules, disabled
            FROM bot_channel_configs WHERE channel_type = ? AND self_identity = ?
            "#,
        )
        .bind(channel_type.to_string())
        .bind(self_identity)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| {
            NotFoundError::ChannelConfig {
                bot_id: "unknown".into(),
                channel_type: channel_type.to_string(),
            }
        })?;

        let cfg = row_to_channel_config(&row);
        if cfg.disabled {
            return Err(AuthorizationError::ChannelDisabled {
                bot_id: cfg.bot_id.to_string(),
                channel_type: channel_type.to_string(),
            }
            .into());
        }
        Ok(cfg)
    }

    pub async fn list_enabled_channel_configs(&self) -> Result<Vec<BotChannelConfig>> {
        let rows = sqlx::query(
            r#"
            SELECT bot_id, channel_type, self_identity, credentials, routing_rules, disabled
            FROM bot_channel_configs WHERE disabled = 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_channel_config).collect())
    }
}

fn row_to_bot(r: &sqlx::sqlite::SqliteRow) -> Bot {
    let id: String = r.get("id");
    let owner_id: String = r.get("owner_id");
    let kind: String = r.get("kind");
    let status: String = r.get("status");
    let created_at: String = r.get("created_at");
    let updated_at: String = r.get("updated_at");
    Bot {
        id: id.parse().unwrap_or_default(),
        owner_id: UserId(uuid::Uuid::parse_str(&owner_id).unwrap_or_default()),
        name: r.get("name"),
        kind: if kind == "public" { BotKind::Public } else { BotKind::Personal },
        status: BotStatus::parse(&status),
        allow_guest: r.get::<i64, _>("allow_guest") != 0,
        models: ModelRefs {
            chat_model: r.get("chat_model"),
            memory_model: r.get("memory_model"),
            embedding_model: r.get("embedding_model"),
        },
        search_provider: r.get("search_provider"),
        reasoning_enabled: r.get::<i64, _>("reasoning_enabled") != 0,
        created_at: created_at.parse().unwrap_or(Utc::now()),
        updated_at: updated_at.parse().unwrap_or(Utc::now()),
    }
}

fn row_to_channel_config(r: &sqlx::sqlite::SqliteRow) -> BotChannelConfig {
    let bot_id: String = r.get("bot_id");
    let channel_type: String = r.get("channel_type");
    let credentials: String = r.get("credentials");
    let routing_rules: String = r.get("routing_rules");
    BotChannelConfig {
        bot_id: bot_id.parse().unwrap_or_default(),
        channel_type: channel_type.parse().unwrap_or(ChannelType::LocalWeb),
        self_identity: r.get("self_identity"),
        credentials: serde_json::from_str(&credentials).unwrap_or(serde_json::Value::Null),
        routing_rules: serde_json::from_str(&routing_rules).unwrap_or(serde_json::Value::Null),
        disabled: r.get::<i64, _>("disabled") != 0,
    }
}

/// Offline-inspection log for fatal `IntegrityError`s and lifecycle
/// transitions (§7: "the error is recorded into lifecycle_events").
pub mod lifecycle_events {
    use super::*;

    pub async fn initialize(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lifecycle_events (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn record(pool: &SqlitePool, bot_id: BotId, kind: &str, detail: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO lifecycle_events (id, bot_id, kind, detail, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(bot_id.to_string())
        .bind(kind)
        .bind(detail)
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;
        Ok(())
    }
}

pub type SharedBotStore = Arc<BotStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::LocalProcessRuntime;

    async fn setup() -> (BotStore, LocalProcessRuntime) {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::identity::IdentityStore::initialize(&pool).await.unwrap();
        BotStore::initialize(&pool).await.unwrap();
        lifecycle_events::initialize(&pool).await.unwrap();
        let dir = tempdir();
        (BotStore::new(pool), LocalProcessRuntime::new(dir))
    }

    fn tempdir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("meshbot-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn lifecycle_create_provision_delete() {
        let (store, runtime) = setup().await;
        let owner = UserId::new();
        let bot = store
            .create_bot(
                owner,
                "test-bot",
                BotKind::Personal,
                ModelRefs {
                    chat_model: "anthropic/claude-sonnet-4".into(),
                    memory_model: "anthropic/claude-haiku-4.5".into(),
                    embedding_model: "fastembed/bge-small-en-v1.5".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(bot.status, BotStatus::Creating);

        store.provision(bot.id, &runtime).await.unwrap();
        assert_eq!(store.get(bot.id).await.unwrap().status, BotStatus::Ready);

        store.delete_bot(bot.id, &runtime).await.unwrap();
        assert!(store.get(bot.id).await.is_err());
    }

    #[tokio::test]
    async fn deleting_bot_rejects_access() {
        let (store, runtime) = setup().await;
        let owner = UserId::new();
        let bot = store
            .create_bot(owner, "b", BotKind::Personal, ModelRefs {
                chat_model: "m".into(), memory_model: "m".into(), embedding_model: "m".into(),
            })
            .await
            .unwrap();
        store.provision(bot.id, &runtime).await.unwrap();
        store
            .authorize_access(Some(owner), bot.id, AccessPolicy { allow_public_member: false, allow_guest: false })
            .await
            .unwrap();

        // Force into deleting without removing the row, by stopping twice.
        sqlx::query("UPDATE bots SET status = 'deleting' WHERE id = ?")
            .bind(bot.id.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store
            .authorize_access(Some(owner), bot.id, AccessPolicy { allow_public_member: false, allow_guest: false })
            .await;
        assert!(err.is_err());
    }
}
