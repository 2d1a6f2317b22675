//! Memory Engine (`spec.md` §4.3): per-bot long-term memory over a LanceDB
//! vector store plus a file manifest mirrored into the bot's container
//! workspace. Ties together the submodules below into the four public
//! operations (`Add`/`Search`/`Update`/`Delete`) and `Compact`.

pub mod compact;
pub mod decide;
pub mod embedding;
pub mod extract;
pub mod manifest;
pub mod search;
pub mod store;
pub mod types;

use crate::chat_provider::{ChatMessage, ChatProvider};
use crate::config::{MemoryConfig, RuntimeLimits};
use crate::container::ContainerRuntime;
use crate::error::{NotFoundError, Result};
use crate::BotId;
use search::FusionMethod;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use types::{DecisionEvent, MemoryDecision, MemoryItem, MemorySearchResult, Modality, Scope, SourceHit};
use uuid::Uuid;

/// Which index(es) a `Search` call fuses results from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchSources {
    Dense,
    Sparse,
    Hybrid,
}

impl Default for SearchSources {
    fn default() -> Self {
        SearchSources::Hybrid
    }
}

/// Either a single memory id or a whole scope, for `Delete` (§4.3).
pub enum DeleteTarget {
    Id(Uuid),
    Scope(Scope),
}

pub struct MemoryEngine {
    container: Arc<dyn ContainerRuntime>,
    chat_provider: Arc<dyn ChatProvider>,
    stores: store::LanceStoreCache,
    embeddings: embedding::EmbeddingCache,
    memory_config: MemoryConfig,
    limits: RuntimeLimits,
    memory_model: String,
    embedding_model: String,
    vector_dim: i32,
    write_locks: RwLock<HashMap<BotId, Arc<Mutex<()>>>>,
}

impl MemoryEngine {
    pub fn new(
        container: Arc<dyn ContainerRuntime>,
        chat_provider: Arc<dyn ChatProvider>,
        lancedb_root: std::path::PathBuf,
        memory_model: impl Into<String>,
        embedding_model: impl Into<String>,
        vector_dim: i32,
        memory_config: MemoryConfig,
        limits: RuntimeLimits,
    ) -> Self {
        Self {
            container,
            chat_provider,
            stores: store::LanceStoreCache::new(lancedb_root),
            embeddings: embedding::EmbeddingCache::new(),
            memory_config,
            limits,
            memory_model: memory_model.into(),
            embedding_model: embedding_model.into(),
            vector_dim,
            write_locks: RwLock::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, bot_id: BotId) -> Arc<Mutex<()>> {
        if let Some(l) = self.write_locks.read().await.get(&bot_id) {
            return l.clone();
        }
        let mut guard = self.write_locks.write().await;
        guard.entry(bot_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn workdir(&self, bot_id: &BotId) -> std::path::PathBuf {
        self.container.workspace_dir(bot_id)
    }

    fn memory_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.limits.memory_llm_timeout_secs)
    }

    /// `Add(messages, scope, infer?)`. When `infer` is true (default), runs
    /// `Extract` → per-fact candidate retrieval → `Decide` and applies each
    /// decision atomically. When false, each message body is added verbatim
    /// as a plain `ADD`.
    pub async fn add(
        &self,
        bot_id: BotId,
        messages: &[ChatMessage],
        scope: Scope,
        infer: bool,
    ) -> Result<Vec<MemoryItem>> {
        let lock = self.lock_for(bot_id).await;
        let _guard = lock.lock().await;

        let decisions = if infer {
            self.extract_and_decide(bot_id, messages, &scope).await?
        } else {
            messages
                .iter()
                .map(|m| MemoryDecision {
                    event: DecisionEvent::Add,
                    id: None,
                    text: m.text.clone(),
                    old_memory: None,
                })
                .collect()
        };

        self.apply_decisions(bot_id, &scope, decisions).await
    }

    async fn extract_and_decide(
        &self,
        bot_id: BotId,
        messages: &[ChatMessage],
        scope: &Scope,
    ) -> Result<Vec<MemoryDecision>> {
        let facts = extract::extract(
            self.chat_provider.as_ref(),
            &self.memory_model,
            messages,
            scope,
            self.memory_timeout(),
        )
        .await?;

        if facts.is_empty() {
            return Ok(Vec::new());
        }

        let store = self.stores.get_or_open(bot_id, self.vector_dim).await?;
        let mut candidates: HashMap<Uuid, MemoryItem> = HashMap::new();
        for fact in &facts {
            let vector = self.embeddings.embed_one(&self.embedding_model, fact).await?;
            let hits = store
                .search_dense(bot_id, scope, vector, self.memory_config.search_candidates_per_fact)
                .await?;
            for hit in hits {
                if let std::collections::hash_map::Entry::Vacant(e) = candidates.entry(hit.id) {
                    if let Some(item) = self.load_item(bot_id, hit.id).await? {
                        e.insert(item);
                    }
                }
            }
        }

        let candidate_list: Vec<MemoryItem> = candidates.into_values().collect();
        decide::decide(
            self.chat_provider.as_ref(),
            &self.memory_model,
            &facts,
            &candidate_list,
            self.memory_timeout(),
        )
        .await
    }

    async fn apply_decisions(
        &self,
        bot_id: BotId,
        scope: &Scope,
        decisions: Vec<MemoryDecision>,
    ) -> Result<Vec<MemoryItem>> {
        let store = self.stores.get_or_open(bot_id, self.vector_dim).await?;
        let workdir = self.workdir(&bot_id);
        let mut results = Vec::new();

        for decision in decisions {
            match decision.event {
                DecisionEvent::Add => {
                    let hash = types::hash_memory(&decision.text, &[]);
                    let duplicate = self.find_duplicate(bot_id, &workdir, scope, &hash).await?;
                    let item = self.write_item(&store, &workdir, bot_id, scope, duplicate, decision.text).await?;
                    results.push(item);
                }
                DecisionEvent::Update => {
                    let Some(id) = decision.id else {
                        let item = self.write_item(&store, &workdir, bot_id, scope, None, decision.text).await?;
                        results.push(item);
                        continue;
                    };
                    let item = self.write_item(&store, &workdir, bot_id, scope, Some(id), decision.text).await?;
                    results.push(item);
                }
                DecisionEvent::Delete => {
                    if let Some(id) = decision.id {
                        store.delete(id).await?;
                        manifest::remove_entry(&workdir, id).await?;
                    }
                }
                DecisionEvent::None => {}
            }
        }

        Ok(results)
    }

    /// Looks up an existing item in `scope` whose content hash already
    /// equals `hash`, so an `Add` decision for a fact already on file
    /// becomes an in-place rewrite of that row instead of a fresh insert
    /// (§4.3 Determinism clause: "duplicate facts (same hash within scope)
    /// are skipped as ADDs"; §8 property 2, `Add` idempotence). The LLM
    /// `decide()` step is the primary de-dup path; this is the code-level
    /// backstop for when it misses.
    async fn find_duplicate(
        &self,
        bot_id: BotId,
        workdir: &std::path::Path,
        scope: &Scope,
        hash: &str,
    ) -> Result<Option<Uuid>> {
        let manifest = manifest::read_manifest(workdir).await?;
        for (id, entry) in &manifest.entries {
            if entry.hash != hash {
                continue;
            }
            let Some(item) = self.load_item(bot_id, *id).await? else { continue };
            if scope.matches(&item.scope) {
                return Ok(Some(*id));
            }
        }
        Ok(None)
    }

    async fn write_item(
        &self,
        store: &store::LanceMemoryStore,
        workdir: &std::path::Path,
        bot_id: BotId,
        scope: &Scope,
        existing_id: Option<Uuid>,
        text: String,
    ) -> Result<MemoryItem> {
        let id = existing_id.unwrap_or_else(Uuid::new_v4);
        let now = chrono::Utc::now();
        let created_at = if existing_id.is_some() {
            self.load_item(bot_id, id).await?.map(|i| i.created_at).unwrap_or(now)
        } else {
            now
        };
        let hash = types::hash_memory(&text, &[]);

        let item = MemoryItem {
            id,
            text: text.clone(),
            content_hash: hash.clone(),
            scope: scope.clone(),
            modality: Modality::Text,
            embedding_model_id: self.embedding_model.clone(),
            created_at,
            updated_at: now,
        };

        let vector = self.embeddings.embed_one(&self.embedding_model, &text).await?;
        store.upsert(bot_id, &item, vector, &text).await?;

        manifest::persist_memories(
            workdir,
            &[(id, hash, text, created_at, now, scope.as_filters())],
        )
        .await?;

        Ok(item)
    }

    /// `Search(query, scope, limit, sources?)`: embeds the query, runs dense
    /// and/or sparse retrieval, fuses with RRF, and hydrates the top `limit`
    /// ids from the file manifest.
    pub async fn search(
        &self,
        bot_id: BotId,
        query: &str,
        scope: &Scope,
        limit: usize,
        sources: SearchSources,
    ) -> Result<Vec<MemorySearchResult>> {
        let store = self.stores.get_or_open(bot_id, self.vector_dim).await?;

        let mut hit_sources: Vec<Vec<SourceHit>> = Vec::new();
        if matches!(sources, SearchSources::Dense | SearchSources::Hybrid) {
            let vector = self.embeddings.embed_one(&self.embedding_model, query).await?;
            hit_sources.push(store.search_dense(bot_id, scope, vector, limit).await?);
        }
        if matches!(sources, SearchSources::Sparse | SearchSources::Hybrid) {
            hit_sources.push(store.search_sparse(bot_id, scope, query, limit).await?);
        }

        let fused = search::fuse(&hit_sources, FusionMethod::Rrf { k: self.memory_config.rrf_k });

        let mut results = Vec::with_capacity(limit);
        for (rank, (id, score)) in fused.into_iter().enumerate().take(limit) {
            if let Some(item) = self.load_item(bot_id, id).await? {
                results.push(MemorySearchResult { item, score, rank });
            }
        }
        Ok(results)
    }

    /// `Update(id, text)`: re-embeds and rewrites the entry in place,
    /// preserving its original creation time and scope.
    pub async fn update(&self, bot_id: BotId, id: Uuid, text: String) -> Result<MemoryItem> {
        let lock = self.lock_for(bot_id).await;
        let _guard = lock.lock().await;

        let existing = self
            .load_item(bot_id, id)
            .await?
            .ok_or_else(|| NotFoundError::Memory(id.to_string()))?;

        let store = self.stores.get_or_open(bot_id, self.vector_dim).await?;
        let workdir = self.workdir(&bot_id);
        self.write_item(&store, &workdir, bot_id, &existing.scope, Some(id), text).await
    }

    /// `Delete(id|scope)`: point delete or whole-scope delete, removing both
    /// the vector row(s) and the manifest entry/entry file(s).
    pub async fn delete(&self, bot_id: BotId, target: DeleteTarget) -> Result<Vec<Uuid>> {
        let lock = self.lock_for(bot_id).await;
        let _guard = lock.lock().await;

        let store = self.stores.get_or_open(bot_id, self.vector_dim).await?;
        let workdir = self.workdir(&bot_id);

        match target {
            DeleteTarget::Id(id) => {
                store.delete(id).await?;
                manifest::remove_entry(&workdir, id).await?;
                Ok(vec![id])
            }
            DeleteTarget::Scope(scope) => {
                let ids = store.delete_scope(bot_id, &scope).await?;
                for id in &ids {
                    manifest::remove_entry(&workdir, *id).await?;
                }
                Ok(ids)
            }
        }
    }

    /// `Compact(scope)` (§4.3): loads every item under `scope`, runs an LLM
    /// summarization pass producing a smaller canonical fact set, replaces
    /// the scoped items with the canonical ones in both the vector store
    /// and the manifest, and leaves every out-of-scope item untouched.
    /// Returns the number of canonical facts the scope now holds. Triggered
    /// scheduled or on-demand per the spec; this runtime exposes it via the
    /// `compact_memory` built-in tool rather than a cron-driven sweep, since
    /// compaction cadence is a per-bot judgment call, not a fixed interval.
    pub async fn compact(&self, bot_id: BotId, scope: &Scope) -> Result<usize> {
        let lock = self.lock_for(bot_id).await;
        let _guard = lock.lock().await;

        let workdir = self.workdir(&bot_id);
        let existing = manifest::read_manifest(&workdir).await?;

        let mut in_scope = Vec::new();
        let mut unaffected = Vec::with_capacity(existing.entries.len());
        for (id, entry) in &existing.entries {
            let Some(item) = self.load_item(bot_id, *id).await? else { continue };
            if scope.matches(&item.scope) {
                in_scope.push(item);
            } else {
                unaffected.push((*id, entry.hash.clone(), item.text, entry.created_at, item.updated_at, entry.filters.clone()));
            }
        }

        if in_scope.len() < 2 {
            // Nothing to consolidate; still normalizes the on-disk layout.
            let mut entries = unaffected;
            for item in in_scope {
                entries.push((
                    item.id,
                    item.content_hash,
                    item.text,
                    item.created_at,
                    item.updated_at,
                    item.scope.as_filters(),
                ));
            }
            let count = entries.len();
            manifest::rebuild_files(&workdir, &entries).await?;
            return Ok(count);
        }

        let facts: Vec<String> = in_scope.iter().map(|item| item.text.clone()).collect();
        let canonical = compact::summarize(
            self.chat_provider.as_ref(),
            &self.memory_model,
            &facts,
            self.memory_timeout(),
        )
        .await?;

        let store = self.stores.get_or_open(bot_id, self.vector_dim).await?;
        for item in &in_scope {
            store.delete(item.id).await?;
        }

        let now = chrono::Utc::now();
        let mut entries = unaffected;
        for text in &canonical {
            let id = Uuid::new_v4();
            let hash = types::hash_memory(text, &[]);
            let vector = self.embeddings.embed_one(&self.embedding_model, text).await?;
            let item = MemoryItem {
                id,
                text: text.clone(),
                content_hash: hash.clone(),
                scope: scope.clone(),
                modality: Modality::Text,
                embedding_model_id: self.embedding_model.clone(),
                created_at: now,
                updated_at: now,
            };
            store.upsert(bot_id, &item, vector, text).await?;
            entries.push((id, hash, text.clone(), now, now, scope.as_filters()));
        }

        manifest::rebuild_files(&workdir, &entries).await?;
        Ok(canonical.len())
    }

    /// Reconstructs a [`MemoryItem`] from the manifest entry plus its
    /// rendered file body. Per §6 the manifest/entry format does not itself
    /// carry `modality`/`embedding_model_id`; this engine always writes and
    /// reads them at the engine's current defaults rather than inventing
    /// extra manifest fields the format doesn't define.
    async fn load_item(&self, bot_id: BotId, id: Uuid) -> Result<Option<MemoryItem>> {
        let workdir = self.workdir(&bot_id);
        let manifest = manifest::read_manifest(&workdir).await?;
        let Some(entry) = manifest.entries.get(&id) else {
            return Ok(None);
        };

        let path = workdir.join("memory").join(format!("{id}.md"));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some((parsed_id, hash, created_at, updated_at, body)) = manifest::parse_entry(&text) else {
            return Ok(None);
        };
        debug_assert_eq!(parsed_id, id);

        let scope: Scope = serde_json::from_value(entry.filters.clone()).unwrap_or_default();

        Ok(Some(MemoryItem {
            id,
            text: body,
            content_hash: hash,
            scope,
            modality: Modality::Text,
            embedding_model_id: self.embedding_model.clone(),
            created_at,
            updated_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_provider::{ChatChunk, ChatRequest};
    use crate::container::LocalProcessRuntime;
    use futures::stream::{self, BoxStream};

    struct StubProvider {
        response: String,
    }

    #[async_trait::async_trait]
    impl ChatProvider for StubProvider {
        async fn stream(&self, _req: ChatRequest) -> Result<BoxStream<'static, Result<ChatChunk>>> {
            let chunk = ChatChunk::TextDelta(self.response.clone());
            Ok(Box::pin(stream::iter(vec![Ok(chunk)])))
        }
    }

    fn engine(response: &str) -> (MemoryEngine, std::path::PathBuf, BotId) {
        let dir = std::env::temp_dir().join(format!("meshbot-memengine-{}", Uuid::new_v4()));
        let container = Arc::new(LocalProcessRuntime::new(dir.join("workspaces")));
        let provider = Arc::new(StubProvider { response: response.to_string() });
        let engine = MemoryEngine::new(
            container,
            provider,
            dir.join("lancedb"),
            "anthropic/claude-haiku-4.5-20250514",
            "fastembed/bge-small-en-v1.5",
            384,
            MemoryConfig::default(),
            RuntimeLimits::default(),
        );
        (engine, dir, BotId::new())
    }

    #[tokio::test]
    async fn add_verbatim_skips_extract_and_decide() {
        let (engine, dir, bot_id) = engine("unused");
        engine.container.start(&bot_id).await.unwrap();

        let messages = vec![ChatMessage { role: crate::Role::User, text: "loves pizza".into() }];
        let items = engine.add(bot_id, &messages, Scope::default(), false).await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text, "loves pizza");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn update_then_load_reflects_new_text() {
        let (engine, dir, bot_id) = engine("unused");
        engine.container.start(&bot_id).await.unwrap();

        let messages = vec![ChatMessage { role: crate::Role::User, text: "loves pizza".into() }];
        let items = engine.add(bot_id, &messages, Scope::default(), false).await.unwrap();
        let id = items[0].id;

        let updated = engine.update(bot_id, id, "loves sushi now".into()).await.unwrap();
        assert_eq!(updated.text, "loves sushi now");
        assert_eq!(updated.created_at, items[0].created_at);

        let reloaded = engine.load_item(bot_id, id).await.unwrap().unwrap();
        assert_eq!(reloaded.text, "loves sushi now");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn delete_by_id_removes_manifest_entry() {
        let (engine, dir, bot_id) = engine("unused");
        engine.container.start(&bot_id).await.unwrap();

        let messages = vec![ChatMessage { role: crate::Role::User, text: "loves pizza".into() }];
        let items = engine.add(bot_id, &messages, Scope::default(), false).await.unwrap();
        let id = items[0].id;

        let deleted = engine.delete(bot_id, DeleteTarget::Id(id)).await.unwrap();
        assert_eq!(deleted, vec![id]);
        assert!(engine.load_item(bot_id, id).await.unwrap().is_none());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn add_same_text_twice_does_not_duplicate_within_scope() {
        let (engine, dir, bot_id) = engine("unused");
        engine.container.start(&bot_id).await.unwrap();

        let scope = Scope::for_bot(bot_id);
        let messages = vec![ChatMessage { role: crate::Role::User, text: "loves pizza".into() }];

        let first = engine.add(bot_id, &messages, scope.clone(), false).await.unwrap();
        let second = engine.add(bot_id, &messages, scope.clone(), false).await.unwrap();
        assert_eq!(first[0].id, second[0].id);

        let manifest = manifest::read_manifest(&engine.workdir(&bot_id)).await.unwrap();
        assert_eq!(manifest.entries.len(), 1);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn add_same_text_in_different_scopes_is_not_deduped() {
        let (engine, dir, bot_id) = engine("unused");
        engine.container.start(&bot_id).await.unwrap();

        let scope_a = Scope { user_id: Some("alice".into()), ..Scope::for_bot(bot_id) };
        let scope_b = Scope { user_id: Some("bob".into()), ..Scope::for_bot(bot_id) };
        let messages = vec![ChatMessage { role: crate::Role::User, text: "loves pizza".into() }];

        engine.add(bot_id, &messages, scope_a, false).await.unwrap();
        engine.add(bot_id, &messages, scope_b, false).await.unwrap();

        let manifest = manifest::read_manifest(&engine.workdir(&bot_id)).await.unwrap();
        assert_eq!(manifest.entries.len(), 2);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn compact_replaces_scoped_items_with_canonical_facts() {
        let (engine, dir, bot_id) = engine(r#"{"facts": ["eats mostly Italian food"]}"#);
        engine.container.start(&bot_id).await.unwrap();

        let scope = Scope::for_bot(bot_id);
        let messages = vec![
            ChatMessage { role: crate::Role::User, text: "loves pizza".into() },
            ChatMessage { role: crate::Role::User, text: "loves pasta".into() },
        ];
        for m in &messages {
            engine.add(bot_id, std::slice::from_ref(m), scope.clone(), false).await.unwrap();
        }

        let remaining = engine.compact(bot_id, &scope).await.unwrap();
        assert_eq!(remaining, 1);

        let manifest = manifest::read_manifest(&engine.workdir(&bot_id)).await.unwrap();
        assert_eq!(manifest.entries.len(), 1);
        let (_, entry) = manifest.entries.iter().next().unwrap();
        assert!(!entry.hash.is_empty());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn compact_leaves_other_scopes_untouched() {
        let (engine, dir, bot_id) = engine(r#"{"facts": ["canonical fact"]}"#);
        engine.container.start(&bot_id).await.unwrap();

        let scope_a = Scope { user_id: Some("alice".into()), ..Scope::for_bot(bot_id) };
        let scope_b = Scope { user_id: Some("bob".into()), ..Scope::for_bot(bot_id) };

        engine
            .add(bot_id, &[ChatMessage { role: crate::Role::User, text: "alice fact one".into() }], scope_a.clone(), false)
            .await
            .unwrap();
        engine
            .add(bot_id, &[ChatMessage { role: crate::Role::User, text: "alice fact two".into() }], scope_a.clone(), false)
            .await
            .unwrap();
        engine
            .add(bot_id, &[ChatMessage { role: crate::Role::User, text: "bob's only fact".into() }], scope_b.clone(), false)
            .await
            .unwrap();

        engine.compact(bot_id, &scope_a).await.unwrap();

        let manifest = manifest::read_manifest(&engine.workdir(&bot_id)).await.unwrap();
        // One canonical fact for alice, plus bob's untouched fact.
        assert_eq!(manifest.entries.len(), 2);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
