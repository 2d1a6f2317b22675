//! Identity Registry (`spec.md` §2, §3): maps `(channel_type,
//! channel_subject_id)` to a canonical [`User`], and issues/consumes the
//! short-lived tokens used to link a channel identity to a user or to
//! provision a new bot.

use crate::error::{NotFoundError, Result, ValidationError};
use crate::{ChannelType, UserId};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// A principal. Unique username/email; `role` gates admin-only operations in
/// the Bot Registry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: Option<String>,
    pub role: UserRole,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Member,
    Admin,
}

impl UserRole {
    fn as_str(&self) -> &'static str {
        match self {
            UserRole::Member => "member",
            UserRole::Admin => "admin",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "admin" => UserRole::Admin,
            _ => UserRole::Member,
        }
    }
}

/// `(channel_type, channel_subject_id)` unique. Represents "this Telegram
/// user" independent of whether it has ever been linked to a [`User`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChannelIdentity {
    pub id: Uuid,
    pub channel_type: ChannelType,
    pub channel_subject_id: String,
    pub display_name: Option<String>,
    pub user_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelIdentity {
    /// A guest is a ChannelIdentity with no linked User.
    pub fn is_guest(&self) -> bool {
        self.user_id.is_none()
    }
}

/// Short-lived single-use token that links a [`ChannelIdentity`] to a
/// [`User`] once consumed (§4.1 step 5: "bind codes").
#[derive(Debug, Clone)]
pub struct BindCode {
    pub code: String,
    pub issuing_user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// Short-lived single-use token used to pre-authorize bot provisioning
/// (e.g. issued by the out-of-scope HTTP API and consumed by the daemon
/// when a channel-side setup command completes).
#[derive(Debug, Clone)]
pub struct PreauthKey {
    pub key: String,
    pub bot_id: crate::BotId,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// Grammar for a bind-code message: the literal token `bind:<code>`, case
/// insensitive, optionally surrounded by whitespace. Kept as a single
/// compiled regex rather than re-parsing per message.
static BIND_CODE_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"(?i)^\s*bind:([A-Za-z0-9]{6,32})\s*$").unwrap());

/// Extract a bind code from free-form message text, if it matches the
/// bind-code grammar exactly.
pub fn parse_bind_code(text: &str) -> Option<&str> {
    BIND_CODE_RE.captures(text).map(|c| c.get(1).unwrap().as_str())
}

pub struct IdentityStore {
    pool: SqlitePool,
}

impl IdentityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                email TEXT UNIQUE,
                role TEXT NOT NULL DEFAULT 'member',
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channel_identities (
                id TEXT PRIMARY KEY,
                channel_type TEXT NOT NULL,
                channel_subject_id TEXT NOT NULL,
                display_name TEXT,
                user_id TEXT REFERENCES users(id),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(channel_type, channel_subject_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bind_codes (
                code TEXT PRIMARY KEY,
                issuing_user_id TEXT NOT NULL REFERENCES users(id),
                expires_at TEXT NOT NULL,
                consumed_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS preauth_keys (
                key TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                consumed_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Upsert a `ChannelIdentity` on `(channel_type, channel_subject_id)`.
    /// Returns the existing row if it already existed (preserving any
    /// existing `user_id` link), otherwise inserts a new guest identity.
    pub async fn upsert_channel_identity(
        &self,
        channel_type: ChannelType,
        channel_subject_id: &str,
        display_name: Option<&str>,
    ) -> Result<ChannelIdentity> {
        if let Some(existing) = self
            .find_channel_identity(channel_type, channel_subject_id)
            .await?
        {
            if let Some(name) = display_name
                && existing.display_name.as_deref() != Some(name)
            {
                sqlx::query(
                    "UPDATE channel_identities SET display_name = ?, updated_at = ? WHERE id = ?",
                )
                .bind(name)
                .bind(Utc::now().to_rfc3339())
                .bind(existing.id.to_string())
                .execute(&self.pool)
                .await?;
            }
            return self
                .find_channel_identity(channel_type, channel_subject_id)
                .await?
                .ok_or_else(|| NotFoundError::Bot("channel identity vanished".into()).into());
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO channel_identities
                (id, channel_type, channel_subject_id, display_name, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(channel_type.to_string())
        .bind(channel_subject_id)
        .bind(display_name)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(ChannelIdentity {
            id,
            channel_type,
            channel_subject_id: channel_subject_id.to_string(),
            display_name: display_name.map(str::to_string),
            user_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn find_channel_identity(
        &self,
        channel_type: ChannelType,
        channel_subject_id: &str,
    ) -> Result<Option<ChannelIdentity>> {
        let row = sqlx::query(
            r#"
            SELECT id, channel_type, channel_subject_id, display_name, user_id, created_at, updated_at
            FROM channel_identities WHERE channel_type = ? AND channel_subject_id = ?
            "#,
        )
        .bind(channel_type.to_string())
        .bind(channel_subject_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_identity(&r)))
    }

    /// Link a channel identity to a user, consuming the bind code that
    /// authorized it. Fails if the code is unknown, expired, or already
    /// consumed.
    pub async fn consume_bind_code(
        &self,
        code: &str,
        channel_identity_id: Uuid,
    ) -> Result<UserId> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT issuing_user_id, expires_at, consumed_at FROM bind_codes WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(ValidationError::InvalidBindCode.into());
        };

        let consumed_at: Option<String> = row.get("consumed_at");
        let expires_at: String = row.get("expires_at");
        let expires_at: DateTime<Utc> = expires_at.parse().unwrap_or(Utc::now());

        if consumed_at.is_some() || expires_at < Utc::now() {
            return Err(ValidationError::InvalidBindCode.into());
        }

        let issuing_user_id: String = row.get("issuing_user_id");
        let user_id = UserId(Uuid::parse_str(&issuing_user_id).map_err(|e| anyhow::anyhow!(e))?);

        sqlx::query("UPDATE bind_codes SET consumed_at = ? WHERE code = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(code)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE channel_identities SET user_id = ?, updated_at = ? WHERE id = ?")
            .bind(user_id.0.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(channel_identity_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(user_id)
    }

    pub async fn issue_bind_code(&self, issuing_user_id: UserId, ttl_minutes: i64) -> Result<String> {
        let code = random_code(8);
        sqlx::query(
            "INSERT INTO bind_codes (code, issuing_user_id, expires_at, consumed_at) VALUES (?, ?, ?, NULL)",
        )
        .bind(&code)
        .bind(issuing_user_id.0.to_string())
        .bind((Utc::now() + chrono::Duration::minutes(ttl_minutes)).to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(code)
    }

    pub async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, email, role, active, created_at, updated_at FROM users WHERE id = ?",
        )
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_user(&r)))
    }

    pub async fn create_user(&self, username: &str, email: Option<&str>, role: UserRole) -> Result<User> {
        let id = UserId::new();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, role, active, created_at, updated_at)
            VALUES (?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(id.0.to_string())
        .bind(username)
        .bind(email)
        .bind(role.as_str())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(User {
            id,
            username: username.to_string(),
            email: email.map(str::to_string),
            role,
            active: true,
            created_at: now,
            updated_at: now,
        })
    }
}

fn row_to_identity(r: &sqlx::sqlite::SqliteRow) -> ChannelIdentity {
    let id: String = r.get("id");
    let channel_type: String = r.get("channel_type");
    let user_id: Option<String> = r.get("user_id");
    let created_at: String = r.get("created_at");
    let updated_at: String = r.get("updated_at");
    ChannelIdentity {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        channel_type: channel_type.parse().unwrap_or(ChannelType::LocalWeb),
        channel_subject_id: r.get("channel_subject_id"),
        display_name: r.get("display_name"),
        user_id: user_id
            .and_then(|s| Uuid::parse_str(&s).ok())
            .map(UserId),
        created_at: created_at.parse().unwrap_or(Utc::now()),
        updated_at: updated_at.parse().unwrap_or(Utc::now()),
    }
}

fn row_to_user(r: &sqlx::sqlite::SqliteRow) -> User {
    let id: String = r.get("id");
    let role: String = r.get("role");
    let created_at: String = r.get("created_at");
    let updated_at: String = r.get("updated_at");
    User {
        id: UserId(Uuid::parse_str(&id).unwrap_or_default()),
        username: r.get("username"),
        email: r.get("email"),
        role: UserRole::parse(&role),
        active: r.get::<i64, _>("active") != 0,
        created_at: created_at.parse().unwrap_or(Utc::now()),
        updated_at: updated_at.parse().unwrap_or(Utc::now()),
    }
}

fn random_code(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_code_grammar() {
        assert_eq!(parse_bind_code("bind:ABC123"), Some("ABC123"));
        assert_eq!(parse_bind_code("  BIND:abc12345  "), Some("abc12345"));
        assert_eq!(parse_bind_code("please bind:ABC123 me"), None);
        assert_eq!(parse_bind_code("bind:ab"), None);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_preserves_link() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        IdentityStore::initialize(&pool).await.unwrap();
        let store = IdentityStore::new(pool);

        let user = store
            .create_user("alice", Some("alice@example.com"), UserRole::Member)
            .await
            .unwrap();

        let first = store
            .upsert_channel_identity(ChannelType::Telegram, "12345", Some("Alice"))
            .await
            .unwrap();
        assert!(first.is_guest());

        let code = store.issue_bind_code(user.id, 10).await.unwrap();
        store.consume_bind_code(&code, first.id).await.unwrap();

        let second = store
            .upsert_channel_identity(ChannelType::Telegram, "12345", Some("Alice"))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.user_id, Some(user.id));
    }
}
