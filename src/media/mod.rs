//! Media Store (`spec.md` §2, §3, §8 property 3): content-addressed asset
//! dedup by SHA-256, behind a pluggable storage-provider abstraction.

use crate::error::Result;
use crate::BotId;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MediaAssetId(pub uuid::Uuid);

impl std::fmt::Display for MediaAssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MediaAssetId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
    Other,
}

impl MediaType {
    fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Document => "document",
            MediaType::Other => "other",
        }
    }

    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            MediaType::Image
        } else if mime.starts_with("video/") {
            MediaType::Video
        } else if mime.starts_with("audio/") {
            MediaType::Audio
        } else if mime == "application/pdf" || mime.starts_with("text/") {
            MediaType::Document
        } else {
            MediaType::Other
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaAsset {
    pub id: MediaAssetId,
    pub bot_id: BotId,
    pub content_hash: String,
    pub media_type: MediaType,
    pub mime: String,
    pub size_bytes: u64,
    pub storage_key: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Storage-provider abstraction so swapping local disk for S3-compatible
/// object storage is mechanical, mirroring `ContainerRuntime`'s shape.
#[async_trait::async_trait]
pub trait StorageProvider: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Local-filesystem storage provider rooted at `<data_dir>/bots/<bot>/media`.
pub struct LocalStorageProvider {
    root: PathBuf,
}

impl LocalStorageProvider {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait::async_trait]
impl StorageProvider for LocalStorageProvider {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.root.join(key)).await?)
    }
}

pub struct MediaStore {
    pool: SqlitePool,
    storage: Arc<dyn StorageProvider>,
}

impl MediaStore {
    pub fn new(pool: SqlitePool, storage: Arc<dyn StorageProvider>) -> Self {
        Self { pool, storage }
    }

    pub async fn initialize(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_assets (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                content_hash TEXT NOT NULL,
                media_type TEXT NOT NULL,
                mime TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                storage_key TEXT NOT NULL,
                width INTEGER,
                height INTEGER,
                duration_ms INTEGER,
                created_at TEXT NOT NULL,
                UNIQUE(bot_id, content_hash)
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Ingest `bytes` for `bot_id`. Hashes first; if a row for
    /// `(bot_id, content_hash)` already exists, returns it without writing
    /// again (§3 invariant, §8 property 3). The extension is derived from
    /// `mime` best-effort; unknown mimes fall back to `.bin`.
    pub async fn ingest(
        &self,
        bot_id: BotId,
        bytes: &[u8],
        mime: &str,
        dims: Option<(u32, u32)>,
        duration_ms: Option<u64>,
    ) -> Result<MediaAsset> {
        let content_hash = hex::encode(Sha256::digest(bytes));
        if let Some(existing) = self.find_by_hash(bot_id, &content_hash).await? {
            return Ok(existing);
        }

        let media_type = MediaType::from_mime(mime);
        let ext = mime_guess::get_mime_extensions_str(mime)
            .and_then(|exts| exts.first())
            .unwrap_or(&"bin");
        let storage_key = format!(
            "{}/{}/{}.{}",
            media_type.as_str(),
            &content_hash[..4.min(content_hash.len())],
            content_hash,
            ext
        );
        let full_key = format!("bots/{bot_id}/media/{storage_key}");

        self.storage.put(&full_key, bytes).await?;

        let id = MediaAssetId(uuid::Uuid::new_v4());
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO media_assets
                (id, bot_id, content_hash, media_type, mime, size_bytes, storage_key,
                 width, height, duration_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(bot_id.to_string())
        .bind(&content_hash)
        .bind(media_type.as_str())
        .bind(mime)
        .bind(bytes.len() as i64)
        .bind(&full_key)
        .bind(dims.map(|(w, _)| w as i64))
        .bind(dims.map(|(_, h)| h as i64))
        .bind(duration_ms.map(|d| d as i64))
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(MediaAsset {
            id,
            bot_id,
            content_hash,
            media_type,
            mime: mime.to_string(),
            size_bytes: bytes.len() as u64,
            storage_key: full_key,
            width: dims.map(|(w, _)| w),
            height: dims.map(|(_, h)| h),
            duration_ms,
            created_at: now,
        })
    }

    pub async fn find_by_hash(&self, bot_id: BotId, content_hash: &str) -> Result<Option<MediaAsset>> {
        let row = sqlx::query(
            r#"
            SELECT id, bot_id, content_hash, media_type, mime, size_bytes, storage_key,
                   width, height, duration_ms, created_at
            FROM media_assets WHERE bot_id = ? AND content_hash = ?
            "#,
        )
        .bind(bot_id.to_string())
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_asset(&r)))
    }
}

fn row_to_asset(r: &sqlx::sqlite::SqliteRow) -> MediaAsset {
    let id: String = r.get("id");
    let bot_id: String = r.get("bot_id");
    let media_type: String = r.get("media_type");
    let created_at: String = r.get("created_at");
    MediaAsset {
        id: id.parse().unwrap_or(MediaAssetId(uuid::Uuid::nil())),
        bot_id: bot_id.parse().unwrap_or_default(),
        content_hash: r.get("content_hash"),
        media_type: match media_type.as_str() {
            "image" => MediaType::Image,
            "video" => MediaType::Video,
            "audio" => MediaType::Audio,
            "document" => MediaType::Document,
            _ => MediaType::Other,
        },
        mime: r.get("mime"),
        size_bytes: r.get::<i64, _>("size_bytes") as u64,
        storage_key: r.get("storage_key"),
        width: r.get::<Option<i64>, _>("width").map(|v| v as u32),
        height: r.get::<Option<i64>, _>("height").map(|v| v as u32),
        duration_ms: r.get::<Option<i64>, _>("duration_ms").map(|v| v as u64),
        created_at: created_at.parse().unwrap_or(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_bytes_dedup_to_one_asset() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::identity::IdentityStore::initialize(&pool).await.unwrap();
        crate::bots::BotStore::initialize(&pool).await.unwrap();
        MediaStore::initialize(&pool).await.unwrap();

        let dir = std::env::temp_dir().join(format!("meshbot-media-{}", uuid::Uuid::new_v4()));
        let storage = Arc::new(LocalStorageProvider::new(dir));
        let store = MediaStore::new(pool, storage);
        let bot_id = BotId::new();

        let bytes = b"fake png bytes";
        let a = store.ingest(bot_id, bytes, "image/png", None, None).await.unwrap();
        let b = store.ingest(bot_id, bytes, "image/png", None, None).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.content_hash, b.content_hash);
    }
}
