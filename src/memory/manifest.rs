//! Per-bot file manifest (`spec.md` §4.3, §6): `index/manifest.json` is the
//! authoritative index of `memory/<id>.md` entry files inside the bot's
//! container workspace. Writes are serialized by a per-bot mutex held by
//! [`super::MemoryEngine`]; this module only knows how to read/write the
//! files themselves.

use crate::error::{IntegrityError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub entries: HashMap<Uuid, ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub filters: serde_json::Value,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: 1,
            updated_at: Utc::now(),
            entries: HashMap::new(),
        }
    }
}

fn manifest_path(workdir: &Path) -> PathBuf {
    workdir.join("index").join("manifest.json")
}

fn entry_path(workdir: &Path, id: Uuid) -> PathBuf {
    workdir.join("memory").join(format!("{id}.md"))
}

pub async fn read_manifest(workdir: &Path) -> Result<Manifest> {
    let path = manifest_path(workdir);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => serde_json::from_str(&text).map_err(|e| {
            IntegrityError::CorruptManifest {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
            .into()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
        Err(e) => Err(e.into()),
    }
}

async fn write_manifest(workdir: &Path, manifest: &Manifest) -> Result<()> {
    let path = manifest_path(workdir);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(manifest).map_err(|e| anyhow::anyhow!(e))?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

/// Render a memory entry's Markdown file body (§6 entry file format).
fn render_entry(id: Uuid, hash: &str, created_at: DateTime<Utc>, updated_at: DateTime<Utc>, body: &str) -> String {
    format!(
        "---\nid: {id}\nhash: {hash}\ncreated_at: {}\nupdated_at: {}\n---\n{body}",
        created_at.to_rfc3339(),
        updated_at.to_rfc3339(),
    )
}

/// Parse a previously-rendered entry file back into its parts — used by the
/// §8 round-trip law `parse(format(memoryItem)) == memoryItem`.
pub fn parse_entry(text: &str) -> Option<(Uuid, String, DateTime<Utc>, DateTime<Utc>, String)> {
    let text = text.strip_prefix("---\n")?;
    let (frontmatter, body) = text.split_once("\n---\n")?;

    let mut id = None;
    let mut hash = None;
    let mut created_at = None;
    let mut updated_at = None;
    for line in frontmatter.lines() {
        let (key, value) = line.split_once(": ")?;
        match key {
            "id" => id = Uuid::parse_str(value).ok(),
            "hash" => hash = Some(value.to_string()),
            "created_at" => created_at = DateTime::parse_from_rfc3339(value).ok().map(|d| d.with_timezone(&Utc)),
            "updated_at" => updated_at = DateTime::parse_from_rfc3339(value).ok().map(|d| d.with_timezone(&Utc)),
            _ => {}
        }
    }

    Some((id?, hash?, created_at?, updated_at?, body.to_string()))
}

/// Incremental write: persists new/updated entry files and upserts their
/// manifest rows. Never deletes existing entries (§4.3 "PersistMemories is
/// incremental and never deletes").
pub async fn persist_memories(
    workdir: &Path,
    entries: &[(Uuid, String, String, DateTime<Utc>, DateTime<Utc>, serde_json::Value)],
) -> Result<()> {
    let mut manifest = read_manifest(workdir).await?;

    for (id, hash, body, created_at, updated_at, filters) in entries {
        let path = entry_path(workdir, *id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, render_entry(*id, hash, *created_at, *updated_at, body)).await?;

        manifest.entries.insert(
            *id,
            ManifestEntry {
                hash: hash.clone(),
                created_at: *created_at,
                filters: filters.clone(),
            },
        );
    }

    manifest.updated_at = Utc::now();
    write_manifest(workdir, &manifest).await
}

pub async fn remove_entry(workdir: &Path, id: Uuid) -> Result<()> {
    let path = entry_path(workdir, id);
    if tokio::fs::try_exists(&path).await? {
        tokio::fs::remove_file(&path).await?;
    }

    let mut manifest = read_manifest(workdir).await?;
    manifest.entries.remove(&id);
    manifest.updated_at = Utc::now();
    write_manifest(workdir, &manifest).await
}

/// Full replace used after compaction (§4.3 Compaction, §6): delete every
/// `memory/*.md`, rewrite each from `entries`, rewrite the manifest.
pub async fn rebuild_files(
    workdir: &Path,
    entries: &[(Uuid, String, String, DateTime<Utc>, DateTime<Utc>, serde_json::Value)],
) -> Result<()> {
    let memory_dir = workdir.join("memory");
    if tokio::fs::try_exists(&memory_dir).await? {
        let mut read_dir = tokio::fs::read_dir(&memory_dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("md") {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
    } else {
        tokio::fs::create_dir_all(&memory_dir).await?;
    }

    let mut manifest = Manifest {
        version: 1,
        updated_at: Utc::now(),
        entries: HashMap::new(),
    };

    for (id, hash, body, created_at, updated_at, filters) in entries {
        let path = entry_path(workdir, *id);
        tokio::fs::write(&path, render_entry(*id, hash, *created_at, *updated_at, body)).await?;
        manifest.entries.insert(
            *id,
            ManifestEntry {
                hash: hash.clone(),
                created_at: *created_at,
                filters: filters.clone(),
            },
        );
    }

    write_manifest(workdir, &manifest).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("meshbot-manifest-{}", Uuid::new_v4()))
    }

    #[test]
    fn entry_round_trips() {
        let id = Uuid::new_v4();
        let created = Utc::now();
        let rendered = render_entry(id, "abc123", created, created, "loves pizza");
        let (parsed_id, hash, created_at, updated_at, body) = parse_entry(&rendered).unwrap();
        assert_eq!(parsed_id, id);
        assert_eq!(hash, "abc123");
        assert_eq!(body, "loves pizza");
        assert_eq!(created_at.timestamp(), created.timestamp());
        assert_eq!(updated_at.timestamp(), created.timestamp());
    }

    #[tokio::test]
    async fn rebuild_then_manifest_matches_files() {
        let dir = tmp_dir();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let entries = vec![(
            id,
            "h1".to_string(),
            "fact one".to_string(),
            now,
            now,
            serde_json::json!({"agent_id": "bot-1"}),
        )];

        rebuild_files(&dir, &entries).await.unwrap();
        let manifest = read_manifest(&dir).await.unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries.get(&id).unwrap().hash, "h1");

        let body = tokio::fs::read_to_string(entry_path(&dir, id)).await.unwrap();
        assert!(body.contains("fact one"));
    }

    #[tokio::test]
    async fn persist_memories_never_deletes_prior_entries() {
        let dir = tmp_dir();
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let now = Utc::now();

        persist_memories(&dir, &[(id1, "h1".into(), "one".into(), now, now, serde_json::json!({}))])
            .await
            .unwrap();
        persist_memories(&dir, &[(id2, "h2".into(), "two".into(), now, now, serde_json::json!({}))])
            .await
            .unwrap();

        let manifest = read_manifest(&dir).await.unwrap();
        assert_eq!(manifest.entries.len(), 2);
    }
}
